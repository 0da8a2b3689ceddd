//! Transfer configuration

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::time::Duration;

use crate::error::{Result, TransferError};
use permafrost_files::HASH_CHUNK_SIZE;

/// Largest chunk the service accepts (4 GiB)
pub const MAX_CHUNK_SIZE: u64 = 4 * 1024 * 1024 * 1024;

/// Transfer configuration
///
/// Rate and retry values are tunable policy, not protocol constants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Chunk size for multipart transfers (`1 MiB × 2^k`)
    pub chunk_size_in_bytes: u64,

    /// Maximum part uploads (and, separately, part downloads) in flight
    pub maximum_active_parts: usize,

    /// Scheduler admission rate
    pub requests_per_second: u32,

    /// Extra attempts after the first failure of a transient job
    pub retry_limit: u32,

    /// Delay between waiter polls
    pub poll_interval_ms: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size_in_bytes: permafrost_files::DEFAULT_CHUNK_SIZE,
            maximum_active_parts: 10,
            requests_per_second: 10,
            retry_limit: 3,
            poll_interval_ms: 30_000,
        }
    }
}

impl TransferConfig {
    /// Interval between scheduler ticks
    #[must_use]
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(1) / self.requests_per_second.max(1)
    }

    /// Interval between waiter polls
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::InvalidConfig`] when the chunk size is not a
    /// power-of-two multiple of 1 MiB (up to 4 GiB) or a limit is zero.
    pub fn validate(&self) -> Result<()> {
        let chunk = self.chunk_size_in_bytes;
        let mib = HASH_CHUNK_SIZE as u64;
        if chunk < mib || chunk > MAX_CHUNK_SIZE || chunk % mib != 0 || !(chunk / mib).is_power_of_two()
        {
            return Err(TransferError::InvalidConfig(Cow::Owned(format!(
                "chunk size {chunk} must be 1 MiB times a power of two, at most 4 GiB"
            ))));
        }

        if self.maximum_active_parts == 0 {
            return Err(TransferError::InvalidConfig(Cow::Borrowed(
                "maximum active parts must be at least 1",
            )));
        }

        if self.requests_per_second == 0 {
            return Err(TransferError::InvalidConfig(Cow::Borrowed(
                "requests per second must be at least 1",
            )));
        }

        Ok(())
    }
}
