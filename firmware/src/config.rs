//! Layout constants and tunable options of the streaming I/O core

use thiserror::Error;

/// Granularity of dirty tracking and of every transfer issued by the ring
pub const SECTOR_SIZE: usize = 512;

/// Largest ring buffer a single context may map
pub const RING_IO_MAX_RING_LEN: usize = 64 * 1024;

pub const MAX_RING_SECS: usize = RING_IO_MAX_RING_LEN / SECTOR_SIZE;

/// Batch size used while draining dirty data in `RingIo::sync`
pub const SYNC_BATCH_SECS: u8 = u8::MAX;

/// Depth of the deferred operation queue. Must be a power of two.
pub const OPS_LEN: usize = 4;

const _: () = assert!(OPS_LEN.is_power_of_two());

/// Options of a ring I/O context. Both may be changed between seeks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingConfig {
    /// Upper bound on the number of sectors moved by one read or write
    pub batch_secs: u8,
    /// Sectors behind the consumer that read-ahead must not overwrite
    pub trailing_secs: u8,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            batch_secs: 1,
            trailing_secs: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("batch size must be at least one sector")]
    EmptyBatch,
    /// Read-ahead would never be able to free a batch of the ring
    #[error("{batch_secs} batch + {trailing_secs} trailing sectors do not fit in a {ring_secs} sector ring")]
    RingTooSmall {
        batch_secs: u8,
        trailing_secs: u8,
        ring_secs: u32,
    },
}

impl RingConfig {
    /// Checks that a ring of `ring_len` bytes mapping `region_len` bytes can
    /// make progress with these options
    pub fn validate(&self, ring_len: u32, region_len: u32) -> Result<(), ConfigError> {
        if self.batch_secs == 0 {
            return Err(ConfigError::EmptyBatch);
        }

        // A ring which holds the whole region never evicts anything
        if ring_len == region_len {
            return Ok(());
        }

        let ring_secs = ring_len / SECTOR_SIZE as u32;
        if self.batch_secs as u32 + self.trailing_secs as u32 >= ring_secs {
            return Err(ConfigError::RingTooSmall {
                batch_secs: self.batch_secs,
                trailing_secs: self.trailing_secs,
                ring_secs,
            });
        }

        Ok(())
    }
}
