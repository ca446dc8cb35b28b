use alloc::sync::Arc;

use thiserror::Error;

pub mod async_queue;
pub mod ring_io;

/// Failure reported by the filesystem access layer. These are sticky: once an
/// operation fails the whole high-level operation it belonged to is abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IoError {
    /// The storage device reported a read or write error
    #[error("disk error")]
    Disk,
    /// No space is left to extend the file
    #[error("disk full")]
    DiskFull,
    /// The file system metadata describing the file is inconsistent
    #[error("corrupt directory entry")]
    Corrupt,
    /// The requested offset is past what the file system can address
    #[error("offset out of bounds")]
    OutOfBounds,
}

/// A trait representing the blocking calls of the filesystem access layer on
/// one open file. The operation queue turns these into deferred operations.
///
/// Implementations keep their own file pointer, so every read or write runs at
/// the position left behind by the previous call.
pub trait FileOperations: Send + Sync {
    /// Moves the file pointer to an absolute offset
    fn seek(&self, offset: u64) -> Result<(), IoError>;

    /// Returns the current file pointer
    fn position(&self) -> u64;

    /// Reads data at the file pointer into the buffer and returns the number
    /// of bytes read. Fewer bytes than requested means end-of-file.
    fn read(&self, buffer: &mut [u8]) -> Result<usize, IoError>;

    /// Writes the buffer at the file pointer and returns the number of bytes
    /// written
    fn write(&self, buffer: &[u8]) -> Result<usize, IoError>;

    /// Commits written data and metadata to the storage device
    fn sync(&self) -> Result<(), IoError>;
}

/// Shared reference to an open file
pub type FileRef = Arc<dyn FileOperations>;
