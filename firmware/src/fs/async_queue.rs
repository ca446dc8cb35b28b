//! Deferred filesystem operations.
//!
//! Callers of the streaming core must never block on storage, so blocking
//! filesystem calls are queued here and executed later by whichever task
//! drains the queue. The queue is a small ring of [`OPS_LEN`] slots indexed by
//! two free-running sequence counters: an operation's sequence number is its
//! handle, and it is done once the consumer counter has moved past it.

use alloc::sync::Arc;
use core::{fmt, ptr::NonNull, slice};

use conquer_once::spin::OnceCell;
use spin::Mutex;
use thiserror::Error;

use super::{FileRef, IoError};
use crate::{config::OPS_LEN, sched::Scheduler, util::sync_cell::SynCell};

/// Receives the byte count of a read or write once it has executed. Stays
/// `None` if the operation was skipped or failed.
pub type IoCount = Arc<SynCell<Option<usize>>>;

/// Memory region read into or written from by a deferred operation
#[derive(Clone, Copy)]
pub struct IoBuf {
    ptr: NonNull<u8>,
    len: usize,
}

// Safety: an IoBuf is only dereferenced by the task draining the queue, and the
// creator guarantees nobody else touches the memory while the op is in flight.
unsafe impl Send for IoBuf {}

impl IoBuf {
    /// # Safety
    ///
    /// `ptr` must be valid for reads and writes of `len` bytes until the
    /// operation using this buffer is done, and the memory must not be
    /// accessed by anyone else while that operation executes.
    pub unsafe fn from_raw(ptr: NonNull<u8>, len: usize) -> Self {
        Self { ptr, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// # Safety
    ///
    /// See [`IoBuf::from_raw`].
    unsafe fn as_slice<'a>(self) -> &'a [u8] {
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// # Safety
    ///
    /// See [`IoBuf::from_raw`].
    unsafe fn as_mut_slice<'a>(self) -> &'a mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

/// The filesystem call a queued operation performs
#[derive(Clone)]
pub enum OpKind {
    Seek { offset: u64 },
    Read { buf: IoBuf, count: Option<IoCount> },
    Write { buf: IoBuf, count: Option<IoCount> },
    Sync,
}

impl fmt::Debug for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpKind::Seek { offset } => write!(f, "seek({offset:#x})"),
            OpKind::Read { buf, .. } => write!(f, "read({:#x})", buf.len()),
            OpKind::Write { buf, .. } => write!(f, "write({:#x})", buf.len()),
            OpKind::Sync => write!(f, "sync"),
        }
    }
}

#[derive(Clone)]
struct Op {
    kind: OpKind,
    file: FileRef,
    cancelled: bool,
}

impl Op {
    fn execute(&self) -> Result<(), IoError> {
        match &self.kind {
            OpKind::Seek { offset } => {
                // Callers cannot inspect the file pointer when they queue the
                // seek, so skip it here if it would be a no-op
                if self.file.position() != *offset {
                    self.file.seek(*offset)?;
                }
            }
            OpKind::Read { buf, count } => {
                // Safety: guaranteed by the creator of the IoBuf
                let n = self.file.read(unsafe { buf.as_mut_slice() })?;
                if let Some(count) = count {
                    count.set(Some(n));
                }
            }
            OpKind::Write { buf, count } => {
                // Safety: guaranteed by the creator of the IoBuf
                let n = self.file.write(unsafe { buf.as_slice() })?;
                if let Some(count) = count {
                    count.set(Some(n));
                }
            }
            OpKind::Sync => self.file.sync()?,
        }

        Ok(())
    }
}

/// Identifies a queued operation. Only meaningful for the queue that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FopHandle(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation queue is full")]
pub struct QueueFull;

struct QueueState {
    ops: [Option<Op>; OPS_LEN],
    prod: u32,
    cons: u32,
    /// First failure seen by `drain`, kept until cleared
    error: Option<IoError>,
    stalls: u32,
}

const fn slot(seq: u32) -> usize {
    seq as usize & (OPS_LEN - 1)
}

impl QueueState {
    fn len(&self) -> u32 {
        self.prod.wrapping_sub(self.cons)
    }

    fn push(&mut self, file: FileRef, kind: OpKind) -> FopHandle {
        debug_assert!(self.len() < OPS_LEN as u32);

        let seq = self.prod;
        self.ops[slot(seq)] = Some(Op {
            kind,
            file,
            cancelled: false,
        });
        self.prod = seq.wrapping_add(1);

        FopHandle(seq)
    }

    fn is_done(&self, handle: FopHandle) -> bool {
        assert!(
            (handle.0.wrapping_sub(self.prod) as i32) < 0,
            "{handle:?} is ahead of the queue producer ({:#x})",
            self.prod
        );
        (handle.0.wrapping_sub(self.cons) as i32) < 0
    }

    fn cancel_all(&mut self) {
        for op in self.ops.iter_mut().flatten() {
            op.cancelled = true;
        }
    }

    fn describe(&self, back: u32) -> Option<&OpKind> {
        if back > self.len() {
            return None;
        }
        let seq = self.prod.wrapping_sub(back);
        self.ops[slot(seq)].as_ref().map(|op| &op.kind)
    }
}

pub struct OpQueue {
    state: Mutex<QueueState>,
}

impl Default for OpQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl OpQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                ops: [const { None }; OPS_LEN],
                prod: 0,
                cons: 0,
                error: None,
                stalls: 0,
            }),
        }
    }

    /// Stores an operation in the next free slot. If the queue is full this
    /// yields until the draining task frees a slot.
    pub fn enqueue(&self, file: FileRef, kind: OpKind, sched: &dyn Scheduler) -> FopHandle {
        let mut stalled = false;

        loop {
            {
                let mut state = self.state.lock();
                if state.len() < OPS_LEN as u32 {
                    return state.push(file, kind);
                }

                if !stalled {
                    state.stalls += 1;
                    log::warn!(
                        "async queue full; blocking on I/O (last queued: {:?}, {:?})",
                        state.describe(1),
                        state.describe(2),
                    );
                }
            }

            stalled = true;
            sched.yield_now();
        }
    }

    /// Like [`OpQueue::enqueue`] but fails instead of yielding
    pub fn try_enqueue(&self, file: FileRef, kind: OpKind) -> Result<FopHandle, QueueFull> {
        let mut state = self.state.lock();
        if state.len() >= OPS_LEN as u32 {
            return Err(QueueFull);
        }

        Ok(state.push(file, kind))
    }

    pub fn seek_async(&self, file: &FileRef, offset: u64, sched: &dyn Scheduler) -> FopHandle {
        self.enqueue(file.clone(), OpKind::Seek { offset }, sched)
    }

    pub fn read_async(
        &self,
        file: &FileRef,
        buf: IoBuf,
        count: Option<IoCount>,
        sched: &dyn Scheduler,
    ) -> FopHandle {
        self.enqueue(file.clone(), OpKind::Read { buf, count }, sched)
    }

    pub fn write_async(
        &self,
        file: &FileRef,
        buf: IoBuf,
        count: Option<IoCount>,
        sched: &dyn Scheduler,
    ) -> FopHandle {
        self.enqueue(file.clone(), OpKind::Write { buf, count }, sched)
    }

    pub fn sync_async(&self, file: &FileRef, sched: &dyn Scheduler) -> FopHandle {
        self.enqueue(file.clone(), OpKind::Sync, sched)
    }

    /// Returns true once the operation has executed or been skipped
    pub fn is_done(&self, handle: FopHandle) -> bool {
        self.state.lock().is_done(handle)
    }

    pub fn wait(&self, handle: FopHandle, sched: &dyn Scheduler) {
        while !self.is_done(handle) {
            sched.yield_now();
        }
    }

    /// Requests that the operation is skipped. Has no effect once the
    /// operation has started or completed.
    pub fn cancel(&self, handle: FopHandle) {
        let mut state = self.state.lock();
        if state.is_done(handle) {
            return;
        }

        if let Some(op) = state.ops[slot(handle.0)].as_mut() {
            op.cancelled = true;
        }
    }

    /// Requests that every queued operation is skipped
    pub fn cancel_all(&self) {
        self.state.lock().cancel_all();
    }

    /// Returns a handle which is already done. Safe to wait on or cancel.
    pub fn completed_op(&self) -> FopHandle {
        FopHandle(self.state.lock().cons.wrapping_sub(OPS_LEN as u32))
    }

    /// Executes queued operations in order until none remain.
    ///
    /// A failing operation still counts as executed. Its error is recorded
    /// (see [`OpQueue::last_error`]), everything queued behind it is cancelled
    /// and skipped, and the error is returned once the queue is empty.
    pub fn drain(&self) -> Result<(), IoError> {
        let mut failure = None;

        loop {
            // The lock is not held while the filesystem call runs
            let (seq, op) = {
                let state = self.state.lock();
                if state.len() == 0 {
                    return match failure {
                        Some(err) => Err(err),
                        None => Ok(()),
                    };
                }

                let seq = state.cons;
                let op = state.ops[slot(seq)]
                    .clone()
                    .expect("queued slots are always populated");
                (seq, op)
            };

            let result = if op.cancelled {
                Ok(())
            } else {
                op.execute()
            };

            let mut state = self.state.lock();
            state.ops[slot(seq)] = None;
            state.cons = seq.wrapping_add(1);

            if let Err(err) = result {
                log::error!("{:?} failed: {}", op.kind, err);

                state.error.get_or_insert(err);
                state.cancel_all();
                failure.get_or_insert(err);
            }
        }
    }

    /// Returns the first filesystem failure since the last reset
    pub fn last_error(&self) -> Option<IoError> {
        self.state.lock().error
    }

    pub fn clear_error(&self) {
        self.state.lock().error = None;
    }

    /// Number of operations waiting to run
    pub fn len(&self) -> usize {
        self.state.lock().len() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of times an enqueue had to wait for a free slot
    pub fn stalls(&self) -> u32 {
        self.state.lock().stalls
    }

    /// Forgets all state. Handles issued before the reset are meaningless
    /// afterwards.
    fn reset(&self) {
        let mut state = self.state.lock();
        assert_eq!(state.len(), 0, "reset with operations still queued");

        *state = QueueState {
            ops: [const { None }; OPS_LEN],
            prod: 0,
            cons: 0,
            error: None,
            stalls: 0,
        };
    }
}

static QUEUE: OnceCell<OpQueue> = OnceCell::uninit();

/// Initializes (or re-initializes) the process-wide operation queue
pub fn init() {
    QUEUE.get_or_init(OpQueue::new).reset();
}

pub fn get() -> &'static OpQueue {
    QUEUE.get().expect("async queue not yet initialized")
}
