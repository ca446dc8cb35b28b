//! Streams reads and writes for a looped region of a file through a ring
//! buffer.
//!
//! The caller (an image format handler) consumes bytes between [`RingIo::cons`]
//! and [`RingIo::prod`] directly in the ring. In write mode `cons` doubles as
//! the write producer: bytes behind it have been modified by the caller and are
//! flushed back to the file in sector-sized batches.
//!
//! `prod` and `cons` are unbounded cursors. There is no guarantee that `cons`
//! is at or before `prod`; the only meaningful test is `cons < prod` (more data
//! is available). Cursors are occasionally lowered by one ring length together
//! with a matching raise of the ring offset, which leaves
//! [`RingIo::position`] of every byte unchanged.

use alloc::{boxed::Box, sync::Arc};
use core::{
    mem::ManuallyDrop,
    ptr::{self, NonNull},
    slice,
};

use super::{
    FileRef, IoError,
    async_queue::{FopHandle, IoBuf, IoCount, OpQueue},
};
use crate::{
    config::{
        ConfigError, RING_IO_MAX_RING_LEN, RingConfig, SECTOR_SIZE, SYNC_BATCH_SECS,
    },
    sched::Scheduler,
    util::{bitfield::SectorBitmap, cursor::Cursor, sync_cell::SynCell},
};

/// Value of the ring offset before the first seek
pub const RING_UNINITIALIZED: u32 = u32::MAX;

const SECTOR: u32 = SECTOR_SIZE as u32;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct RingFlags: u8 {
        /// The caller is writing, per the last seek
        const WRITING = 1 << 0;
        /// Written data has not yet been committed to storage
        const SYNC_NEEDED = 1 << 1;
        /// Inhibit reads in the I/O scheduler
        const DISABLE_READING = 1 << 2;
    }
}

/// What to do once the outstanding operation has completed
enum Continuation {
    Read {
        first_sector: usize,
        sectors: u8,
        count: IoCount,
    },
    Write {
        cursor: Cursor,
        sectors: u8,
        count: IoCount,
    },
    Sync,
}

struct PendingOp {
    handle: FopHandle,
    continuation: Continuation,
}

pub struct RingIo<'a> {
    queue: &'a OpQueue,
    sched: &'a dyn Scheduler,
    file: FileRef,
    /// Owned; released by Drop or `into_buffer` once no queued operation can
    /// touch it any more
    ring: NonNull<[u8]>,
    config: RingConfig,

    /// Start of the mapped region in the file
    f_off: u64,
    f_len: u32,
    ring_len: u32,
    /// Region position which ring cursor 0 maps to
    ring_off: u32,

    prod: Cursor,
    cons: Cursor,
    /// Oldest cursor whose ring data is still valid
    rd_valid: Cursor,
    /// Oldest write not yet flushed. Sector aligned.
    wd_cons: Cursor,
    /// Follows `cons` while writing, up to where dirty sectors were marked
    wd_prod: Cursor,

    unread: SectorBitmap,
    dirty: SectorBitmap,
    /// Bytes read so far when the ring holds the whole region
    ingested: u32,

    flags: RingFlags,
    pending: Option<PendingOp>,
}

impl<'a> RingIo<'a> {
    /// Maps `region_secs` sectors of `file` starting at byte `f_off` onto
    /// `buffer`. If the buffer is smaller than the region only a sliding window
    /// of the region is kept in memory. [`RingIo::into_buffer`] hands the
    /// buffer back.
    ///
    /// Panics if the layout or `config` cannot work.
    pub fn new(
        queue: &'a OpQueue,
        sched: &'a dyn Scheduler,
        file: FileRef,
        buffer: Box<[u8]>,
        f_off: u64,
        region_secs: u16,
        config: RingConfig,
    ) -> Self {
        assert_eq!(f_off % SECTOR as u64, 0, "region must start on a sector");
        assert!(region_secs > 0, "empty region");

        let f_len = region_secs as u32 * SECTOR;
        let ring_len = f_len.min((buffer.len() & !(SECTOR_SIZE - 1)) as u32);
        assert!(ring_len >= SECTOR, "ring buffer smaller than a sector");
        assert!(
            ring_len as usize <= RING_IO_MAX_RING_LEN,
            "ring of {ring_len:#x} bytes is too large"
        );
        if let Err(err) = config.validate(ring_len, f_len) {
            panic!("invalid ring configuration: {err}");
        }

        log::debug!(
            "ring io over {f_len:#x} bytes at {f_off:#x} with a {ring_len:#x} byte ring ({config:?})"
        );

        Self {
            queue,
            sched,
            file,
            ring: NonNull::from(Box::leak(buffer)),
            config,
            f_off,
            f_len,
            ring_len,
            ring_off: RING_UNINITIALIZED,
            prod: Cursor::ZERO,
            cons: Cursor::ZERO,
            rd_valid: Cursor::ZERO,
            wd_cons: Cursor::ZERO,
            wd_prod: Cursor::ZERO,
            unread: SectorBitmap::with_first((ring_len / SECTOR) as usize),
            dirty: SectorBitmap::new(),
            ingested: 0,
            flags: RingFlags::empty(),
            pending: None,
        }
    }

    pub fn prod(&self) -> Cursor {
        self.prod
    }

    pub fn cons(&self) -> Cursor {
        self.cons
    }

    /// Moves the consumer (or, in write mode, the write producer) forward
    pub fn advance_cons(&mut self, n: u32) {
        self.cons += n;
    }

    pub fn set_cons(&mut self, cons: Cursor) {
        self.cons = cons;
    }

    pub fn ring_len(&self) -> u32 {
        self.ring_len
    }

    pub fn region_len(&self) -> u32 {
        self.f_len
    }

    pub fn config(&self) -> RingConfig {
        self.config
    }

    pub fn set_batch_secs(&mut self, batch_secs: u8) -> Result<(), ConfigError> {
        self.set_config(RingConfig {
            batch_secs,
            ..self.config
        })
    }

    pub fn set_trailing_secs(&mut self, trailing_secs: u8) -> Result<(), ConfigError> {
        self.set_config(RingConfig {
            trailing_secs,
            ..self.config
        })
    }

    fn set_config(&mut self, config: RingConfig) -> Result<(), ConfigError> {
        config.validate(self.ring_len, self.f_len)?;
        self.config = config;
        Ok(())
    }

    pub fn is_writing(&self) -> bool {
        self.flags.contains(RingFlags::WRITING)
    }

    /// Returns true while written data still has to reach storage
    pub fn is_syncing(&self) -> bool {
        self.flags.contains(RingFlags::SYNC_NEEDED)
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Offset into the ring buffer of the byte at `cursor`. Sectors never
    /// wrap, so this only needs computing once per sector.
    pub fn index(&self, cursor: Cursor) -> usize {
        cursor.ring_index(self.ring_len) as usize
    }

    /// Position within the mapped region of the byte at `cursor`
    pub fn position(&self, cursor: Cursor) -> u32 {
        debug_assert_ne!(self.ring_off, RING_UNINITIALIZED, "not yet seeked");
        ((self.ring_off as u64 + cursor.as_u32() as u64) % self.f_len as u64) as u32
    }

    /// Ring contents starting at `cursor`. The range must not wrap the ring,
    /// and must lie between `cons` and `prod` to hold file data.
    pub fn bytes(&self, cursor: Cursor, len: usize) -> &[u8] {
        let index = self.checked_range(cursor, len);
        // Safety: in bounds of the ring, which is borrowed for 'a. The caller
        // does not touch data of in-flight operations.
        unsafe { slice::from_raw_parts(self.base().as_ptr().add(index), len) }
    }

    /// Mutable ring contents starting at `cursor`. See [`RingIo::bytes`].
    pub fn bytes_mut(&mut self, cursor: Cursor, len: usize) -> &mut [u8] {
        let index = self.checked_range(cursor, len);
        // Safety: see `bytes`
        unsafe { slice::from_raw_parts_mut(self.base().as_ptr().add(index), len) }
    }

    fn base(&self) -> NonNull<u8> {
        self.ring.cast()
    }

    #[track_caller]
    fn checked_range(&self, cursor: Cursor, len: usize) -> usize {
        let index = self.index(cursor);
        assert!(
            index + len <= self.ring_len as usize,
            "{len:#x} bytes at {cursor:?} wrap the ring"
        );
        index
    }

    fn sector_of(&self, cursor: Cursor) -> usize {
        self.index(cursor) / SECTOR_SIZE
    }

    fn ring_secs(&self) -> usize {
        (self.ring_len / SECTOR) as usize
    }

    fn is_fully_buffered(&self) -> bool {
        self.ring_len == self.f_len
    }

    /// Repositions the stream at `pos` within the region. If `writing`, read
    /// data is still made available as normal, but from now on `cons` also
    /// marks how far the caller has written.
    pub fn seek(&mut self, pos: u32, writing: bool) {
        assert!(
            !self.is_writing() || self.wd_prod == self.cons,
            "seek with unflushed writes"
        );
        assert!(pos < self.f_len, "{pos:#x} is outside the region");

        self.flags.set(RingFlags::WRITING, writing);

        if self.ring_off == RING_UNINITIALIZED {
            self.prod = Cursor::ZERO;
            self.rd_valid = Cursor::ZERO;
            self.cons = Cursor::new(pos % SECTOR);
            self.ring_off = pos & !(SECTOR - 1);
        } else {
            // The region is a loop: a position behind the oldest valid data is
            // reached by going forward around it
            let valid_pos = self.position(self.rd_valid);
            let pos = if valid_pos > pos { pos + self.f_len } else { pos };
            self.cons = self.rd_valid + (pos - valid_pos);
            self.prod = self.cons.sector_start();
        }
        self.skip_read_sectors();

        if writing {
            self.wd_prod = self.cons;
            self.wd_cons = if self.is_syncing() {
                self.wd_cons.min(self.wd_prod.sector_start())
            } else {
                self.wd_prod.sector_start()
            };
        }

        log::debug!(
            "seek to {pos:#x} ({}): cons {:?} prod {:?}",
            if writing { "write" } else { "read" },
            self.cons,
            self.prod,
        );

        self.schedule();
    }

    /// Per-tick maintenance. Marks fully written sectors dirty, handles the
    /// completion of the outstanding operation and issues the next one.
    pub fn progress(&mut self) -> Result<(), IoError> {
        if self.is_writing() && self.wd_prod.is_before(self.cons) {
            let first_unmarked = self.wd_prod;
            let mut marked = false;
            while self.cons.is_at_or_after(self.wd_prod + SECTOR) {
                let sector = self.sector_of(self.wd_prod);
                self.dirty.set(sector);
                self.wd_prod += SECTOR;
                marked = true;
            }

            if !self.is_syncing() {
                self.flags.insert(RingFlags::SYNC_NEEDED);
                self.wd_cons = first_unmarked.sector_start();
            }

            if marked {
                self.flush_written(false);
            }
        }

        self.reap()?;
        self.schedule();
        self.renormalize();

        Ok(())
    }

    /// Makes everything written so far eligible for writing out. With
    /// `force_partial` the sector holding the last written bytes is included
    /// even though the caller has not filled it.
    pub fn flush(&mut self, force_partial: bool) -> Result<(), IoError> {
        if !self.is_writing() {
            return Ok(());
        }

        self.progress()?;
        self.flush_written(force_partial);

        Ok(())
    }

    fn flush_written(&mut self, partial: bool) {
        assert!(self.is_writing());
        assert!(
            self.cons.bytes_since(self.wd_prod) < SECTOR,
            "written sectors were not marked"
        );

        if partial && self.wd_prod.is_before(self.cons) {
            let first = self.sector_of(self.wd_prod);
            let last = self.sector_of(self.cons - 1);
            self.dirty.set(first);
            self.dirty.set(last);
            self.wd_prod = self.cons;
        }

        self.schedule();
    }

    /// Writes out every dirty sector and syncs the file, yielding until done.
    /// Read-ahead is suspended meanwhile. Call [`RingIo::flush`] first if a
    /// trailing partial sector must be included.
    pub fn sync(&mut self) -> Result<(), IoError> {
        assert!(
            !self.is_writing() || self.wd_prod == self.cons,
            "sync with unflushed writes"
        );

        // Write out as quickly as possible, the caller is likely about to
        // tear this context down
        let batch_secs = self.config.batch_secs;
        let mut rio = scopeguard::guard(self, move |rio| {
            rio.config.batch_secs = batch_secs;
            rio.flags.remove(RingFlags::DISABLE_READING);
        });
        rio.flags.insert(RingFlags::DISABLE_READING);
        rio.config.batch_secs = SYNC_BATCH_SECS;

        while rio.is_syncing() {
            rio.reap()?;
            rio.schedule();
            if !rio.is_syncing() {
                break;
            }

            debug_assert!(rio.has_pending());
            rio.sched.yield_now();
        }

        log::debug!("sync complete");
        Ok(())
    }

    /// Waits for the outstanding operation to finish and forgets about it
    pub fn shutdown(&mut self) {
        if let Some(pending) = self.pending.take() {
            self.queue.wait(pending.handle, self.sched);
        }
    }

    /// Shuts the context down and returns its ring buffer
    pub fn into_buffer(mut self) -> Box<[u8]> {
        self.shutdown();

        let this = ManuallyDrop::new(self);
        // Safety: `this` is never dropped, so the file reference and the ring
        // are released exactly once. Nothing is pending after `shutdown`.
        unsafe {
            drop(ptr::read(&this.file));
            Box::from_raw(this.ring.as_ptr())
        }
    }

    fn check_error(&self) -> Result<(), IoError> {
        match self.queue.last_error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Runs the continuation of the outstanding operation once it is done
    fn reap(&mut self) -> Result<(), IoError> {
        self.check_error()?;

        while let Some(pending) = self.pending.take_if(|p| self.queue.is_done(p.handle)) {
            match pending.continuation {
                Continuation::Read {
                    first_sector,
                    sectors,
                    count,
                } => self.read_complete(first_sector, sectors, count.get()),
                Continuation::Write {
                    cursor,
                    sectors,
                    count,
                } => self.write_complete(cursor, sectors, count.get()),
                Continuation::Sync => self.sync_complete(),
            }
        }

        Ok(())
    }

    /// Moves `prod` past sectors which already hold valid data
    fn skip_read_sectors(&mut self) {
        while self.prod.is_before(self.rd_valid + self.ring_len) {
            if self.unread.get(self.sector_of(self.prod)) {
                break;
            }
            self.prod += SECTOR;
        }
    }

    /// Moves `wd_cons` past fully written sectors which are not dirty
    fn skip_flushed_sectors(&mut self) {
        while self.wd_prod.is_at_or_after(self.wd_cons + SECTOR) {
            if self.dirty.get(self.sector_of(self.wd_cons)) {
                break;
            }
            self.wd_cons += SECTOR;
        }
    }

    /// Issues the next operation, if any and if none is outstanding
    fn schedule(&mut self) {
        if self.pending.is_some() {
            return;
        }

        // Start of the data which must stay in the ring
        let window = if self.is_syncing() {
            self.skip_flushed_sectors();
            self.wd_cons.min(self.cons.sector_start())
        } else {
            let start = self.cons.sector_start();
            debug_assert!(start.is_at_or_after(self.rd_valid));
            start
                .saturating_sub(self.config.trailing_secs as u32 * SECTOR)
                .max(self.rd_valid)
        };

        let batch_len = self.config.batch_secs as u32 * SECTOR;
        if (self.prod + batch_len).is_before(window) {
            // jump forward
            self.prod = window;
        }

        if self.is_fully_buffered() {
            // nothing is ever evicted
            self.rd_valid = window;
        } else if window.is_at_or_after(self.rd_valid + batch_len)
            && self.prod.is_at_or_after(self.rd_valid + self.ring_len)
        {
            // Invalidate a whole batch at a time so that reads are batched too
            let secs = (self.config.batch_secs as usize).min(self.ring_secs());
            for _ in 0..secs {
                let sector = self.sector_of(self.rd_valid);
                self.unread.set(sector);
                self.rd_valid += SECTOR;
            }
        }

        self.skip_read_sectors();

        let reading = !self.flags.contains(RingFlags::DISABLE_READING)
            && (!self.is_fully_buffered() || self.ingested < self.f_len);
        if reading && self.prod.is_before(self.rd_valid + self.ring_len) {
            self.start_read();
            return;
        }

        if self.is_syncing() {
            if self.dirty.any() {
                self.start_write();
            } else {
                self.start_sync();
            }
        }
    }

    fn io_buf(&self, cursor: Cursor, len: usize) -> IoBuf {
        let index = self.checked_range(cursor, len);
        // Safety: the ring is owned by this context and Drop cancels the
        // pending operation before releasing it. A forgotten context leaks the
        // ring. Callers do not access sectors of in-flight operations.
        unsafe { IoBuf::from_raw(self.base().add(index), len) }
    }

    fn start_read(&mut self) {
        let prod = self.prod;

        let max_secs = (self.ring_len - self.index(prod) as u32)
            .min(self.f_len - self.position(prod))
            .min((self.rd_valid + self.ring_len).bytes_since(prod))
            / SECTOR;
        let max_secs = max_secs.min(self.config.batch_secs as u32) as usize;
        assert!(max_secs > 0);

        let first_sector = self.sector_of(prod);
        let sectors = (0..max_secs)
            .take_while(|&i| self.unread.get(first_sector + i))
            .count();
        debug_assert!(sectors > 0, "read started on valid data");

        let len = sectors * SECTOR_SIZE;
        let offset = self.f_off + self.position(prod) as u64;
        let count: IoCount = Arc::new(SynCell::new(None));

        log::debug!("read {sectors} sectors at {offset:#x}");
        log::trace!("unread: {:?}", self.unread);

        let buf = self.io_buf(prod, len);
        self.queue.seek_async(&self.file, offset, self.sched);
        let handle = self
            .queue
            .read_async(&self.file, buf, Some(count.clone()), self.sched);

        self.pending = Some(PendingOp {
            handle,
            continuation: Continuation::Read {
                first_sector,
                sectors: sectors as u8,
                count,
            },
        });
    }

    fn read_complete(&mut self, first_sector: usize, sectors: u8, received: Option<usize>) {
        let Some(received) = received else {
            // Cancelled or failed: the sectors stay unread and get read again
            log::debug!("read of {sectors} sectors at sector {first_sector} did not run");
            self.schedule();
            return;
        };

        let len = sectors as usize * SECTOR_SIZE;
        if received < len {
            // Region extends past the end of the file
            log::debug!("short read: {received:#x} of {len:#x} bytes");
            let start = first_sector * SECTOR_SIZE + received;
            // Safety: within the sectors of the operation which just completed
            unsafe { self.base().add(start).write_bytes(0, len - received) };
        }

        for i in 0..sectors as usize {
            self.unread.clear(first_sector + i);
        }

        if self.is_fully_buffered() {
            self.ingested = (self.ingested + len as u32).min(self.f_len);
        }

        self.schedule();
    }

    fn start_write(&mut self) {
        debug_assert!(self.is_syncing() && self.dirty.any());

        // Seeks can rewind the reader, so look for writes past the producer
        let mut cons = self.wd_cons;
        while self.prod.is_at_or_after(cons + SECTOR) && !self.dirty.get(self.sector_of(cons))
        {
            cons += SECTOR;
        }

        if !self.dirty.get(self.sector_of(cons)) {
            // Nothing dirty before the producer. Ring data is only ever
            // written within one ring length of `rd_valid`, which pins down
            // the cursor of the next dirty sector.
            let ring_secs = self.ring_secs();
            let next = self
                .dirty
                .next_set_wrapping(self.sector_of(cons), ring_secs)
                .expect("dirty bitmap is not empty");
            let base = self.index(self.rd_valid) as u32;
            let ahead = (next as u32 * SECTOR + self.ring_len - base) % self.ring_len;
            cons = self.rd_valid + ahead;
            log::debug!("dirty sector {next} found outside of the write window");
        }

        let max_secs = ((self.ring_len - self.index(cons) as u32) / SECTOR)
            .min((self.f_len - self.position(cons)) / SECTOR)
            .min(self.config.batch_secs as u32) as usize;
        debug_assert!(max_secs > 0);

        // Clear eagerly so that a sector written again while the write is in
        // flight gets written again
        let first_sector = self.sector_of(cons);
        let mut sectors = 0;
        while sectors < max_secs && self.dirty.get(first_sector + sectors) {
            self.dirty.clear(first_sector + sectors);
            sectors += 1;
        }

        let len = sectors * SECTOR_SIZE;
        let offset = self.f_off + self.position(cons) as u64;

        log::debug!("write {sectors} sectors at {offset:#x}");
        log::trace!("dirty: {:?}", self.dirty);

        let count: IoCount = Arc::new(SynCell::new(None));
        let buf = self.io_buf(cons, len);
        self.queue.seek_async(&self.file, offset, self.sched);
        let handle = self
            .queue
            .write_async(&self.file, buf, Some(count.clone()), self.sched);

        self.pending = Some(PendingOp {
            handle,
            continuation: Continuation::Write {
                cursor: cons,
                sectors: sectors as u8,
                count,
            },
        });
    }

    fn write_complete(&mut self, cursor: Cursor, sectors: u8, written: Option<usize>) {
        let Some(written) = written else {
            // Cancelled or failed: the data is still only in the ring
            log::debug!("write of {sectors} sectors at {cursor:?} did not run");
            let first_sector = self.sector_of(cursor);
            for i in 0..sectors as usize {
                self.dirty.set(first_sector + i);
            }
            self.wd_cons = self.wd_cons.min(cursor);
            self.schedule();
            return;
        };

        let len = sectors as usize * SECTOR_SIZE;
        if written < len {
            log::warn!("short write at {cursor:?}: {written:#x} of {len:#x} bytes");
        }
        log::trace!("wrote {sectors} sectors");

        // The sectors just written are clean unless the caller has dirtied
        // them again meanwhile, in which case the cursor has to stop there
        self.skip_flushed_sectors();
        self.schedule();
    }

    fn start_sync(&mut self) {
        log::debug!("sync");

        let handle = self.queue.sync_async(&self.file, self.sched);
        self.pending = Some(PendingOp {
            handle,
            continuation: Continuation::Sync,
        });
    }

    fn sync_complete(&mut self) {
        if !self.dirty.any() {
            self.flags.remove(RingFlags::SYNC_NEEDED);
        }
        self.schedule();
    }

    /// Lowers the cursors by a ring length once they are all at least that far
    /// along, so they never overflow
    fn renormalize(&mut self) {
        if self
            .flags
            .intersects(RingFlags::WRITING | RingFlags::SYNC_NEEDED)
        {
            return;
        }

        if self.cons.as_u32() < self.ring_len || self.rd_valid.as_u32() < self.ring_len {
            return;
        }

        self.prod -= self.ring_len;
        self.cons -= self.ring_len;
        self.rd_valid -= self.ring_len;
        self.ring_off += self.ring_len;
        if self.ring_off >= self.f_len {
            self.ring_off -= self.f_len;
        }
    }
}

impl Drop for RingIo<'_> {
    fn drop(&mut self) {
        // The queue must not touch the ring once it is released
        if let Some(pending) = self.pending.take() {
            if !self.queue.is_done(pending.handle) {
                log::warn!("ring io dropped with an operation in flight");
                self.queue.cancel(pending.handle);
            }
        }

        // Safety: allocated in `new`, and the only queued operation which
        // could access it has been cancelled above
        drop(unsafe { Box::from_raw(self.ring.as_ptr()) });
    }
}

#[cfg(test)]
mod tests {
    use alloc::{sync::Arc, vec::Vec};

    use super::RingIo;
    use crate::{
        config::{RingConfig, SECTOR_SIZE},
        drivers::fs::ram::{FileOp, RamFile},
        fs::{IoError, async_queue::OpQueue},
        sched::DrainingScheduler,
        util::cursor::Cursor,
    };

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8 ^ (i / 512) as u8).collect()
    }

    fn config(batch_secs: u8, trailing_secs: u8) -> RingConfig {
        RingConfig {
            batch_secs,
            trailing_secs,
        }
    }

    fn pump(rio: &mut RingIo<'_>, queue: &OpQueue) {
        let _ = queue.drain();
        rio.progress().unwrap();
    }

    fn wait_for_data(rio: &mut RingIo<'_>, queue: &OpQueue) {
        for _ in 0..1000 {
            if rio.cons().is_before(rio.prod()) {
                return;
            }
            pump(rio, queue);
        }
        panic!("no data arrived at {:?}", rio.cons());
    }

    /// Largest chunk available at the consumer
    fn chunk(rio: &RingIo<'_>, want: usize) -> usize {
        let cons = rio.cons();
        (rio.prod().bytes_since(cons) as usize)
            .min(rio.ring_len() as usize - rio.index(cons))
            .min(want)
    }

    fn read(rio: &mut RingIo<'_>, queue: &OpQueue, len: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(len);
        while out.len() < len {
            wait_for_data(rio, queue);
            let n = chunk(rio, len - out.len());
            out.extend_from_slice(rio.bytes(rio.cons(), n));
            rio.advance_cons(n as u32);
        }
        out
    }

    fn write(rio: &mut RingIo<'_>, queue: &OpQueue, data: &[u8]) {
        let mut done = 0;
        while done < data.len() {
            wait_for_data(rio, queue);
            let n = chunk(rio, data.len() - done);
            let cons = rio.cons();
            rio.bytes_mut(cons, n).copy_from_slice(&data[done..done + n]);
            rio.advance_cons(n as u32);
            rio.progress().unwrap();
            done += n;
        }
    }

    /// Reads the first ring's worth of the region
    fn fill(rio: &mut RingIo<'_>, queue: &OpQueue) {
        for _ in 0..16 {
            pump(rio, queue);
        }
        assert_eq!(rio.prod(), Cursor::new(rio.ring_len()));
    }

    fn writes_and_syncs(ram: &RamFile) -> Vec<FileOp> {
        ram.journal()
            .into_iter()
            .filter(|op| matches!(op, FileOp::Write { .. } | FileOp::Sync))
            .collect()
    }

    #[test]
    fn first_batch_is_read_on_first_drain() {
        init_logger();
        let queue = OpQueue::new();
        let sched = DrainingScheduler::new(&queue);
        let data = pattern(4096);
        let ram = Arc::new(RamFile::with_data(data.clone()));
        let ring = vec![0u8; 2048].into_boxed_slice();
        let mut rio = RingIo::new(&queue, &sched, ram.clone(), ring, 0, 8, config(2, 1));

        rio.seek(0, false);
        assert!(ram.journal().is_empty());

        queue.drain().unwrap();
        assert_eq!(ram.journal(), [FileOp::Read { offset: 0, len: 1024 }]);

        rio.progress().unwrap();
        assert_eq!(rio.prod(), Cursor::new(1024));
        assert_eq!(rio.bytes(Cursor::ZERO, 1024), &data[..1024]);
    }

    #[test]
    fn reads_stay_batched_and_inside_the_region() {
        init_logger();
        let queue = OpQueue::new();
        let sched = DrainingScheduler::new(&queue);
        let data = pattern(8192);
        let ram = Arc::new(RamFile::with_data(data.clone()));
        let ring = vec![0u8; 2048].into_boxed_slice();
        let mut rio = RingIo::new(&queue, &sched, ram.clone(), ring, 1024, 8, config(2, 1));

        rio.seek(3000, false);
        let got = read(&mut rio, &queue, 3 * 4096);

        let region = &data[1024..1024 + 4096];
        let expected: Vec<u8> = region.iter().cycle().skip(3000).take(got.len()).copied().collect();
        assert_eq!(got, expected);

        for op in ram.journal() {
            if let FileOp::Read { offset, len } = op {
                assert!(len <= 2 * SECTOR_SIZE, "{op:?}");
                assert!(offset >= 1024 && offset + len as u64 <= 1024 + 4096, "{op:?}");
            }
        }
    }

    #[test]
    fn cursors_are_renormalized_without_moving_data() {
        init_logger();
        let queue = OpQueue::new();
        let sched = DrainingScheduler::new(&queue);
        let ram = Arc::new(RamFile::with_data(pattern(4096)));
        let ring = vec![0u8; 2048].into_boxed_slice();
        let mut rio = RingIo::new(&queue, &sched, ram, ring, 0, 8, config(2, 1));

        rio.seek(0, false);
        for _ in 0..8 {
            read(&mut rio, &queue, 1000);

            let position = rio.position(rio.cons());
            pump(&mut rio, &queue);
            assert_eq!(rio.position(rio.cons()), position);
        }
        assert!(rio.cons().as_u32() < 3 * rio.ring_len());
    }

    #[test]
    fn writes_only_dirty_sectors_then_syncs() {
        init_logger();
        let queue = OpQueue::new();
        let sched = DrainingScheduler::new(&queue);
        let ram = Arc::new(RamFile::with_data(pattern(4096)));
        let ring = vec![0u8; 2048].into_boxed_slice();
        let mut rio = RingIo::new(&queue, &sched, ram.clone(), ring, 0, 8, config(2, 1));

        rio.seek(0, false);
        fill(&mut rio, &queue);
        ram.clear_journal();

        rio.seek(0, true);
        write(&mut rio, &queue, &[0xaa; 512]);
        rio.sync().unwrap();

        assert_eq!(
            ram.journal(),
            [
                FileOp::Seek(0),
                FileOp::Write { offset: 0, len: 512 },
                FileOp::Sync
            ]
        );
        assert_eq!(&ram.contents()[..512], &[0xaa; 512]);
        assert!(!rio.is_syncing());
        assert_eq!(rio.config().batch_secs, 2);
    }

    #[test]
    fn partial_sector_keeps_the_rest_of_the_sector() {
        init_logger();
        let queue = OpQueue::new();
        let sched = DrainingScheduler::new(&queue);
        let data = pattern(4096);
        let ram = Arc::new(RamFile::with_data(data.clone()));
        let ring = vec![0u8; 2048].into_boxed_slice();
        let mut rio = RingIo::new(&queue, &sched, ram.clone(), ring, 0, 8, config(2, 1));

        rio.seek(0, false);
        fill(&mut rio, &queue);

        rio.seek(0, true);
        write(&mut rio, &queue, &[0x55; 300]);
        rio.flush(true).unwrap();
        rio.sync().unwrap();

        let contents = ram.contents();
        assert_eq!(&contents[..300], &[0x55; 300]);
        assert_eq!(&contents[300..], &data[300..]);
        assert_eq!(writes_and_syncs(&ram).last(), Some(&FileOp::Sync));
    }

    #[test]
    fn writes_wrap_around_the_end_of_the_region() {
        init_logger();
        let queue = OpQueue::new();
        let sched = DrainingScheduler::new(&queue);
        let data = pattern(4096);
        let ram = Arc::new(RamFile::with_data(data.clone()));
        let ring = vec![0u8; 2048].into_boxed_slice();
        let mut rio = RingIo::new(&queue, &sched, ram.clone(), ring, 0, 8, config(2, 1));

        let new: Vec<u8> = (0..500).map(|i| !(i as u8)).collect();
        rio.seek(3900, true);
        write(&mut rio, &queue, &new);
        rio.flush(true).unwrap();
        rio.sync().unwrap();

        let contents = ram.contents();
        assert_eq!(&contents[3900..], &new[..196]);
        assert_eq!(&contents[..304], &new[196..]);
        assert_eq!(&contents[304..3900], &data[304..3900]);
    }

    #[test]
    fn backward_seek_is_served_from_the_file() {
        init_logger();
        let queue = OpQueue::new();
        let sched = DrainingScheduler::new(&queue);
        let data = pattern(4096);
        let ram = Arc::new(RamFile::with_data(data.clone()));
        let ring = vec![0u8; 2048].into_boxed_slice();
        let mut rio = RingIo::new(&queue, &sched, ram, ring, 0, 8, config(2, 1));

        rio.seek(0, false);
        assert_eq!(read(&mut rio, &queue, 3072), &data[..3072]);

        rio.seek(512, false);
        assert_eq!(read(&mut rio, &queue, 512), &data[512..1024]);
    }

    #[test]
    fn fully_buffered_region_is_read_once() {
        init_logger();
        let queue = OpQueue::new();
        let sched = DrainingScheduler::new(&queue);
        let data = pattern(2048);
        let ram = Arc::new(RamFile::with_data(data.clone()));
        let ring = vec![0u8; 4096].into_boxed_slice();
        let mut rio = RingIo::new(&queue, &sched, ram.clone(), ring, 0, 4, config(1, 0));
        assert_eq!(rio.ring_len(), 2048);

        rio.seek(1000, false);
        let got = read(&mut rio, &queue, 4096);

        let expected: Vec<u8> = data.iter().cycle().skip(1000).take(4096).copied().collect();
        assert_eq!(got, expected);

        let read_bytes: usize = ram
            .journal()
            .iter()
            .map(|op| match op {
                FileOp::Read { len, .. } => *len,
                _ => 0,
            })
            .sum();
        assert_eq!(read_bytes, 2048);
    }

    #[test]
    fn short_file_reads_as_zeros() {
        init_logger();
        let queue = OpQueue::new();
        let sched = DrainingScheduler::new(&queue);
        let data = pattern(3000);
        let ram = Arc::new(RamFile::with_data(data.clone()));
        let ring = vec![0xffu8; 2048].into_boxed_slice();
        let mut rio = RingIo::new(&queue, &sched, ram, ring, 0, 8, config(2, 1));

        rio.seek(0, false);
        let got = read(&mut rio, &queue, 4096);

        assert_eq!(&got[..3000], &data[..]);
        assert!(got[3000..].iter().all(|&b| b == 0));
    }

    #[test]
    fn failed_operation_is_reported_by_progress() {
        init_logger();
        let queue = OpQueue::new();
        let sched = DrainingScheduler::new(&queue);
        let ram = Arc::new(RamFile::with_data(pattern(4096)));
        let ring = vec![0u8; 2048].into_boxed_slice();
        let mut rio = RingIo::new(&queue, &sched, ram.clone(), ring, 0, 8, config(2, 1));

        ram.fail_next(IoError::Disk);
        rio.seek(0, false);

        assert_eq!(queue.drain(), Err(IoError::Disk));
        assert_eq!(rio.progress(), Err(IoError::Disk));
        assert_eq!(rio.progress(), Err(IoError::Disk));

        // the failed read is issued again once the error is cleared
        queue.clear_error();
        assert_eq!(read(&mut rio, &queue, 1024), &pattern(4096)[..1024]);
    }

    #[test]
    fn cancelled_read_is_issued_again() {
        init_logger();
        let queue = OpQueue::new();
        let sched = DrainingScheduler::new(&queue);
        let data = pattern(4096);
        let ram = Arc::new(RamFile::with_data(data.clone()));
        let ring = vec![0u8; 2048].into_boxed_slice();
        let mut rio = RingIo::new(&queue, &sched, ram.clone(), ring, 0, 8, config(2, 1));

        rio.seek(0, false);
        queue.cancel_all();
        queue.drain().unwrap();
        assert!(ram.journal().is_empty());

        rio.progress().unwrap();
        assert_eq!(rio.prod(), Cursor::ZERO);
        assert_eq!(read(&mut rio, &queue, 2048), &data[..2048]);
    }

    #[test]
    fn cancelled_write_is_issued_again() {
        init_logger();
        let queue = OpQueue::new();
        let sched = DrainingScheduler::new(&queue);
        let ram = Arc::new(RamFile::with_data(pattern(4096)));
        let ring = vec![0u8; 2048].into_boxed_slice();
        let mut rio = RingIo::new(&queue, &sched, ram.clone(), ring, 0, 8, config(2, 1));

        rio.seek(0, false);
        fill(&mut rio, &queue);
        rio.seek(0, true);
        write(&mut rio, &queue, &[0xaa; 512]);
        assert!(rio.has_pending());

        queue.cancel_all();
        rio.sync().unwrap();

        assert_eq!(&ram.contents()[..512], &[0xaa; 512]);
        assert!(!rio.is_syncing());
    }

    #[test]
    fn failed_write_is_retried_after_clearing_the_error() {
        init_logger();
        let queue = OpQueue::new();
        let sched = DrainingScheduler::new(&queue);
        let data = pattern(4096);
        let ram = Arc::new(RamFile::with_data(data.clone()));
        let ring = vec![0u8; 2048].into_boxed_slice();
        let mut rio = RingIo::new(&queue, &sched, ram.clone(), ring, 0, 8, config(2, 1));

        rio.seek(0, false);
        fill(&mut rio, &queue);
        rio.seek(0, true);
        write(&mut rio, &queue, &[0xaa; 512]);

        ram.fail_next(IoError::Disk);
        assert_eq!(rio.sync(), Err(IoError::Disk));
        assert_eq!(&ram.contents()[..512], &data[..512]);

        queue.clear_error();
        rio.sync().unwrap();

        assert_eq!(&ram.contents()[..512], &[0xaa; 512]);
        assert_eq!(&ram.contents()[512..], &data[512..]);
        assert!(!rio.is_syncing());
    }

    #[test]
    fn writes_stay_batched_and_inside_the_region() {
        init_logger();
        let queue = OpQueue::new();
        let sched = DrainingScheduler::new(&queue);
        let ram = Arc::new(RamFile::with_data(pattern(8192)));
        let ring = vec![0u8; 2048].into_boxed_slice();
        let mut rio = RingIo::new(&queue, &sched, ram.clone(), ring, 1024, 8, config(2, 1));

        rio.seek(3584, false);
        fill(&mut rio, &queue);
        ram.clear_journal();

        rio.seek(3584, true);
        write(&mut rio, &queue, &[0x11; 2048]);
        rio.flush(true).unwrap();
        for _ in 0..8 {
            pump(&mut rio, &queue);
        }
        let before_sync = ram.journal().len();
        rio.sync().unwrap();

        for (i, op) in ram.journal().into_iter().enumerate() {
            if let FileOp::Write { offset, len } = op {
                let batch = if i < before_sync { 2 } else { 4 };
                assert!(len % SECTOR_SIZE == 0 && len <= batch * SECTOR_SIZE, "{op:?}");
                assert!(offset >= 1024 && offset + len as u64 <= 1024 + 4096, "{op:?}");
            }
        }
        let contents = ram.contents();
        assert_eq!(&contents[1024 + 3584..1024 + 4096], &[0x11; 512]);
        assert_eq!(&contents[1024..1024 + 1536], &[0x11; 1536]);
    }

    #[test]
    fn consumer_can_be_rewound_within_valid_data() {
        let queue = OpQueue::new();
        let sched = DrainingScheduler::new(&queue);
        let data = pattern(4096);
        let ram = Arc::new(RamFile::with_data(data.clone()));
        let ring = vec![0u8; 2048].into_boxed_slice();
        let mut rio = RingIo::new(&queue, &sched, ram, ring, 0, 8, config(2, 1));

        rio.seek(0, false);
        read(&mut rio, &queue, 600);

        rio.set_cons(Cursor::new(100));
        assert_eq!(read(&mut rio, &queue, 200), &data[100..300]);
    }

    #[test]
    fn ring_buffer_is_handed_back() {
        let queue = OpQueue::new();
        let sched = DrainingScheduler::new(&queue);
        let data = pattern(4096);
        let ram = Arc::new(RamFile::with_data(data.clone()));
        let ring = vec![0u8; 2048].into_boxed_slice();
        let mut rio = RingIo::new(&queue, &sched, ram.clone(), ring, 0, 8, config(2, 1));

        rio.seek(0, false);
        fill(&mut rio, &queue);
        let ring = rio.into_buffer();

        assert_eq!(&ring[..], &data[..2048]);
        assert!(queue.is_empty());
        // the context released its file reference
        assert_eq!(Arc::strong_count(&ram), 1);
    }

    #[test]
    fn forgotten_context_leaks_its_ring() {
        let queue = OpQueue::new();
        let sched = DrainingScheduler::new(&queue);
        let ram = Arc::new(RamFile::with_data(pattern(4096)));
        let ring = vec![0u8; 2048].into_boxed_slice();
        let mut rio = RingIo::new(&queue, &sched, ram.clone(), ring, 0, 8, config(2, 1));

        rio.seek(0, false);
        core::mem::forget(rio);

        // the queued read still has a live buffer to read into
        queue.drain().unwrap();
        assert_eq!(ram.journal(), [FileOp::Read { offset: 0, len: 1024 }]);
    }

    #[test]
    fn failed_sync_restores_the_batch_size() {
        init_logger();
        let queue = OpQueue::new();
        let sched = DrainingScheduler::new(&queue);
        let ram = Arc::new(RamFile::with_data(pattern(4096)));
        let ring = vec![0u8; 2048].into_boxed_slice();
        let mut rio = RingIo::new(&queue, &sched, ram.clone(), ring, 0, 8, config(2, 1));

        rio.seek(0, false);
        fill(&mut rio, &queue);
        rio.seek(0, true);
        write(&mut rio, &queue, &[1; 512]);

        ram.fail_next(IoError::DiskFull);
        assert_eq!(rio.sync(), Err(IoError::DiskFull));
        assert_eq!(rio.config().batch_secs, 2);
        assert!(rio.is_syncing());
    }

    #[test]
    #[should_panic(expected = "unflushed writes")]
    fn seek_requires_a_flush() {
        let queue = OpQueue::new();
        let sched = DrainingScheduler::new(&queue);
        let ram = Arc::new(RamFile::with_data(pattern(4096)));
        let ring = vec![0u8; 2048].into_boxed_slice();
        let mut rio = RingIo::new(&queue, &sched, ram, ring, 0, 8, config(2, 1));

        rio.seek(0, true);
        write(&mut rio, &queue, &[1; 300]);
        rio.seek(0, false);
    }

    #[test]
    #[should_panic(expected = "invalid ring configuration")]
    fn ring_must_fit_a_batch_and_the_trailing_window() {
        let queue = OpQueue::new();
        let sched = DrainingScheduler::new(&queue);
        let ram = Arc::new(RamFile::new());
        let ring = vec![0u8; 1024].into_boxed_slice();
        let _ = RingIo::new(&queue, &sched, ram, ring, 0, 8, config(2, 0));
    }

    #[test]
    fn batch_size_changes_are_validated() {
        let queue = OpQueue::new();
        let sched = DrainingScheduler::new(&queue);
        let ram = Arc::new(RamFile::new());
        let ring = vec![0u8; 2048].into_boxed_slice();
        let mut rio = RingIo::new(&queue, &sched, ram, ring, 0, 8, config(2, 1));

        assert!(rio.set_batch_secs(3).is_err());
        assert_eq!(rio.set_trailing_secs(0), Ok(()));
        assert_eq!(rio.set_batch_secs(3), Ok(()));
        assert_eq!(rio.config(), config(3, 0));
    }

    #[test]
    fn shutdown_waits_for_the_outstanding_operation() {
        let queue = OpQueue::new();
        let sched = DrainingScheduler::new(&queue);
        let ram = Arc::new(RamFile::with_data(pattern(4096)));
        let ring = vec![0u8; 2048].into_boxed_slice();
        let mut rio = RingIo::new(&queue, &sched, ram.clone(), ring, 0, 8, config(2, 1));

        rio.seek(0, false);
        assert!(rio.has_pending());
        rio.shutdown();

        assert!(!rio.has_pending());
        assert!(queue.is_empty());
        assert_eq!(ram.journal(), [FileOp::Read { offset: 0, len: 1024 }]);
    }

    #[test]
    fn dropping_cancels_the_outstanding_operation() {
        let queue = OpQueue::new();
        let sched = DrainingScheduler::new(&queue);
        let ram = Arc::new(RamFile::with_data(pattern(4096)));
        let ring = vec![0u8; 2048].into_boxed_slice();

        let mut rio = RingIo::new(&queue, &sched, ram.clone(), ring, 0, 8, config(2, 1));
        rio.seek(1024, false);
        drop(rio);

        queue.drain().unwrap();
        assert_eq!(ram.journal(), [FileOp::Seek(1024)]);
    }
}
