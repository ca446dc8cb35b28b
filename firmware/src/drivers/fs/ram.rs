//! A file kept entirely in memory. Stands in for an image file on removable
//! storage when running hosted, and records every call it receives so that the
//! I/O pattern of the streaming core can be inspected.

use alloc::vec::Vec;

use spin::{Mutex, RwLock};

use crate::fs::{FileOperations, IoError};

/// One call observed by a [`RamFile`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOp {
    Seek(u64),
    Read { offset: u64, len: usize },
    Write { offset: u64, len: usize },
    Sync,
}

pub struct RamFile {
    data: RwLock<Vec<u8>>,
    position: Mutex<u64>,
    journal: Mutex<Vec<FileOp>>,
    /// Error returned by the next call instead of performing it
    fail_next: Mutex<Option<IoError>>,
    /// Largest size the file may grow to
    capacity: Option<usize>,
}

impl Default for RamFile {
    fn default() -> Self {
        Self::new()
    }
}

impl RamFile {
    pub fn new() -> Self {
        Self::with_data(Vec::new())
    }

    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            data: RwLock::new(data),
            position: Mutex::new(0),
            journal: Mutex::new(Vec::new()),
            fail_next: Mutex::new(None),
            capacity: None,
        }
    }

    /// Like [`RamFile::with_data`] but writes extending the file past
    /// `capacity` bytes fail with [`IoError::DiskFull`]
    pub fn with_capacity(data: Vec<u8>, capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
            ..Self::with_data(data)
        }
    }

    pub fn contents(&self) -> Vec<u8> {
        self.data.read().clone()
    }

    pub fn journal(&self) -> Vec<FileOp> {
        self.journal.lock().clone()
    }

    pub fn clear_journal(&self) {
        self.journal.lock().clear();
    }

    /// Makes the next call fail with `error`
    pub fn fail_next(&self, error: IoError) {
        *self.fail_next.lock() = Some(error);
    }

    fn check_failure(&self) -> Result<(), IoError> {
        match self.fail_next.lock().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn record(&self, op: FileOp) {
        self.journal.lock().push(op);
    }
}

impl FileOperations for RamFile {
    fn seek(&self, offset: u64) -> Result<(), IoError> {
        self.check_failure()?;

        *self.position.lock() = offset;
        self.record(FileOp::Seek(offset));

        Ok(())
    }

    fn position(&self) -> u64 {
        *self.position.lock()
    }

    fn read(&self, buffer: &mut [u8]) -> Result<usize, IoError> {
        self.check_failure()?;

        let data = self.data.read();
        let mut position = self.position.lock();
        let offset = *position;

        // If the offset is past the end of the file, there is nothing to read
        let start = usize::try_from(offset)
            .unwrap_or(usize::MAX)
            .min(data.len());

        // The number of bytes we can read is determined by the number of bytes
        // left past the offset and the length of the buffer
        let read_size = buffer.len().min(data.len() - start);
        buffer[..read_size].copy_from_slice(&data[start..start + read_size]);

        *position += read_size as u64;
        self.record(FileOp::Read {
            offset,
            len: buffer.len(),
        });

        Ok(read_size)
    }

    fn write(&self, buffer: &[u8]) -> Result<usize, IoError> {
        self.check_failure()?;

        let mut data = self.data.write();
        let mut position = self.position.lock();
        let offset = *position;
        let start = usize::try_from(offset).map_err(|_| IoError::OutOfBounds)?;

        // If the length of the file would be increased by this operation, we
        // need to first resize the backing buffer up to the new length which
        // fills the new space (and any created holes) with 0s.
        let min_new_len = start + buffer.len();
        if self.capacity.is_some_and(|cap| min_new_len > cap) {
            return Err(IoError::DiskFull);
        }
        if min_new_len > data.len() {
            data.resize(min_new_len, 0);
        }

        data[start..min_new_len].copy_from_slice(buffer);

        *position += buffer.len() as u64;
        self.record(FileOp::Write {
            offset,
            len: buffer.len(),
        });

        Ok(buffer.len())
    }

    fn sync(&self) -> Result<(), IoError> {
        self.check_failure()?;
        self.record(FileOp::Sync);

        Ok(())
    }
}
