//! Resumable transfer state
//!
//! A [`TransferRecord`] tracks progress as a contiguous cursor (`position`)
//! plus the offsets of chunks that finished out of order. Pending work is
//! recomputed from those two values alone, so a transfer resumes after a
//! crash without any process memory.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

use crate::error::{Result, TransferError};
use crate::store::Record;

/// Direction of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferKind {
    /// Local file to a vault archive
    Upload,
    /// Vault archive to a local file
    Retrieval,
}

/// Transfer lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferStatus {
    /// Waiting to be driven
    Pending,
    /// Chunks in flight
    Processing,
    /// Being cancelled
    Hold,
    /// Finished and verified
    Done,
    /// Failed; can be restarted
    Error,
}

impl TransferStatus {
    /// True for states the engines resume at startup
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, TransferStatus::Pending | TransferStatus::Processing)
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransferStatus::Pending => "pending",
            TransferStatus::Processing => "processing",
            TransferStatus::Hold => "hold",
            TransferStatus::Done => "done",
            TransferStatus::Error => "error",
        };
        f.write_str(name)
    }
}

/// Chunk state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartStatus {
    /// Not transferred yet
    Pending,
    /// Transferred and verified
    Done,
}

/// One chunk of a transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Part {
    /// `"{parent_id}:{position}"`
    pub id: String,
    /// Owning transfer
    pub parent_id: String,
    /// Byte offset of the chunk
    pub position: u64,
    /// Chunk length in bytes
    pub size: u64,
    /// Inclusive byte range, `"start-end"`
    pub range: String,
    /// Tree hash of the chunk once known
    pub checksum: Option<String>,
    /// Chunk state
    pub status: PartStatus,
}

impl Part {
    /// Plan a pending chunk
    #[must_use]
    pub fn new(parent_id: &str, position: u64, size: u64) -> Self {
        Self {
            id: Self::key(parent_id, position),
            parent_id: parent_id.to_string(),
            position,
            size,
            range: format!("{}-{}", position, position + size.saturating_sub(1)),
            checksum: None,
            status: PartStatus::Pending,
        }
    }

    /// Storage key for the chunk at `position` of `parent_id`
    #[must_use]
    pub fn key(parent_id: &str, position: u64) -> String {
        format!("{parent_id}:{position}")
    }

    /// Mark transferred with its verified checksum
    pub fn complete(&mut self, checksum: String) {
        self.checksum = Some(checksum);
        self.status = PartStatus::Done;
    }
}

impl Record for Part {
    fn key(&self) -> &str {
        &self.id
    }
}

/// Persistent state of one upload or retrieval
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRecord {
    /// Local identifier, also the scheduler reference of its jobs
    pub id: String,
    /// Direction
    pub kind: TransferKind,
    /// Target vault
    pub vault_name: String,
    /// Remote archive, known up front for retrievals and after completion for uploads
    pub archive_id: Option<String>,
    /// Multipart upload id or retrieval job id
    pub remote_id: Option<String>,
    /// Source or destination file
    pub file_path: PathBuf,
    /// Free-form archive description
    pub description: Option<String>,
    /// Transfer chunk size
    pub chunk_size: u64,
    /// Total content size; zero for a retrieval until its job is ready
    pub total_size: u64,
    /// Lifecycle state
    pub status: TransferStatus,
    /// First byte not yet contiguous-complete from the start
    pub position: u64,
    /// Chunk offsets completed out of order, beyond `position`
    pub completed_offsets: BTreeSet<u64>,
    /// Expected tree hash of the whole content (hex)
    pub checksum: Option<String>,
    /// Creation time, seconds since the epoch
    pub created_at: u64,
    /// Completion time, seconds since the epoch
    pub completed_at: Option<u64>,
    /// Last failure, human readable
    pub error: Option<String>,
}

impl Record for TransferRecord {
    fn key(&self) -> &str {
        &self.id
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}

/// Random 128-bit hex identifier
///
/// # Errors
///
/// Returns [`TransferError::InvalidState`] if the OS random source fails.
pub fn generate_id() -> Result<String> {
    let mut bytes = [0u8; 16];
    getrandom::getrandom(&mut bytes).map_err(|e| {
        TransferError::InvalidState(Cow::Owned(format!("random source unavailable: {e}")))
    })?;
    Ok(hex::encode(bytes))
}

impl TransferRecord {
    fn new(kind: TransferKind, vault_name: &str, file_path: PathBuf, chunk_size: u64) -> Result<Self> {
        if vault_name.is_empty() {
            return Err(TransferError::validation("vault name must not be empty"));
        }
        if chunk_size == 0 {
            return Err(TransferError::validation("chunk size must be positive"));
        }

        Ok(Self {
            id: generate_id()?,
            kind,
            vault_name: vault_name.to_string(),
            archive_id: None,
            remote_id: None,
            file_path,
            description: None,
            chunk_size,
            total_size: 0,
            status: TransferStatus::Pending,
            position: 0,
            completed_offsets: BTreeSet::new(),
            checksum: None,
            created_at: now_secs(),
            completed_at: None,
            error: None,
        })
    }

    /// New upload of `total_size` bytes from `file_path`
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Validation`] for an empty vault name, a zero
    /// chunk size or empty content.
    pub fn upload(
        vault_name: &str,
        file_path: impl Into<PathBuf>,
        total_size: u64,
        chunk_size: u64,
    ) -> Result<Self> {
        if total_size == 0 {
            return Err(TransferError::validation("cannot upload an empty archive"));
        }
        let mut record = Self::new(TransferKind::Upload, vault_name, file_path.into(), chunk_size)?;
        record.total_size = total_size;
        Ok(record)
    }

    /// New retrieval of `archive_id` into `file_path`
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Validation`] for an empty vault name or
    /// archive id, or a zero chunk size.
    pub fn retrieval(
        vault_name: &str,
        archive_id: &str,
        file_path: impl Into<PathBuf>,
        chunk_size: u64,
    ) -> Result<Self> {
        if archive_id.is_empty() {
            return Err(TransferError::validation("archive id must not be empty"));
        }
        let mut record =
            Self::new(TransferKind::Retrieval, vault_name, file_path.into(), chunk_size)?;
        record.archive_id = Some(archive_id.to_string());
        Ok(record)
    }

    /// Actual length of the chunk starting at `offset`
    #[must_use]
    pub fn chunk_len(&self, offset: u64) -> u64 {
        self.chunk_size.min(self.total_size.saturating_sub(offset))
    }

    /// Check the invariants a stored record must satisfy before it is driven
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Validation`] for a zero chunk size, a cursor
    /// past the end, or an out-of-order offset that is not a chunk boundary
    /// beyond the cursor.
    pub fn validate(&self) -> Result<()> {
        if self.vault_name.is_empty() {
            return Err(TransferError::validation("vault name must not be empty"));
        }
        if self.chunk_size == 0 {
            return Err(TransferError::validation("chunk size must be positive"));
        }
        if self.position > self.total_size {
            return Err(TransferError::Validation(Cow::Owned(format!(
                "position {} is past the end of a {} byte transfer",
                self.position, self.total_size
            ))));
        }
        if let Some(offset) = self.completed_offsets.iter().find(|&&offset| {
            offset <= self.position || offset >= self.total_size || offset % self.chunk_size != 0
        }) {
            return Err(TransferError::Validation(Cow::Owned(format!(
                "completed offset {offset} is not a pending chunk boundary"
            ))));
        }
        Ok(())
    }

    /// Chunks not yet known to be complete
    #[must_use]
    pub fn pending_chunks(&self) -> Vec<Part> {
        let mut chunks = Vec::new();
        if self.chunk_size == 0 {
            return chunks;
        }
        let mut offset = self.position;
        while offset < self.total_size {
            if !self.completed_offsets.contains(&offset) {
                chunks.push(Part::new(&self.id, offset, self.chunk_len(offset)));
            }
            offset += self.chunk_size;
        }
        chunks
    }

    /// Number of chunks in the whole transfer
    #[must_use]
    pub fn chunk_count(&self) -> u64 {
        if self.chunk_size == 0 {
            return 0;
        }
        self.total_size.div_ceil(self.chunk_size)
    }

    /// Record the chunk at `offset` as complete
    ///
    /// A chunk at the cursor advances it and folds every contiguous
    /// out-of-order completion that follows. Any other chunk is remembered
    /// until its predecessors arrive. Already-recorded offsets are ignored.
    /// Returns whether the state changed.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Validation`] for a zero chunk size or an
    /// offset that is not a chunk boundary inside the content.
    pub fn add_sequence(&mut self, offset: u64) -> Result<bool> {
        if self.chunk_size == 0 {
            return Err(TransferError::validation("chunk size must be positive"));
        }
        if offset >= self.total_size || offset % self.chunk_size != 0 {
            return Err(TransferError::Validation(Cow::Owned(format!(
                "offset {offset} is not a chunk boundary of a {} byte transfer",
                self.total_size
            ))));
        }

        if offset < self.position || self.completed_offsets.contains(&offset) {
            return Ok(false);
        }

        if offset != self.position {
            self.completed_offsets.insert(offset);
            return Ok(true);
        }

        self.position += self.chunk_len(offset);
        while self.completed_offsets.remove(&self.position) {
            self.position += self.chunk_len(self.position);
        }
        Ok(true)
    }

    /// True once every chunk has been folded into the cursor
    #[must_use]
    pub fn is_sequence_complete(&self) -> bool {
        self.total_size > 0 && self.position == self.total_size
    }

    /// Bytes known to be complete
    #[must_use]
    pub fn finished_size(&self) -> u64 {
        self.position
            + self
                .completed_offsets
                .iter()
                .map(|&offset| self.chunk_len(offset))
                .sum::<u64>()
    }

    /// Rounded completion percentage
    #[must_use]
    pub fn completion_percent(&self) -> u8 {
        if self.total_size == 0 {
            return 0;
        }
        let percent = (u128::from(self.finished_size()) * 100 + u128::from(self.total_size) / 2)
            / u128::from(self.total_size);
        // finished_size never exceeds total_size
        percent.min(100) as u8
    }

    /// Pending -> Processing; a resumed transfer may already be Processing
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::InvalidState`] from any other state.
    pub fn begin(&mut self) -> Result<()> {
        match self.status {
            TransferStatus::Pending | TransferStatus::Processing => {
                self.status = TransferStatus::Processing;
                Ok(())
            }
            status => Err(TransferError::InvalidState(Cow::Owned(format!(
                "cannot start a transfer in state {status}"
            )))),
        }
    }

    /// Enter `Hold` for cancellation
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::InvalidState`] if the transfer already finished.
    pub fn hold(&mut self) -> Result<()> {
        if self.status == TransferStatus::Done {
            return Err(TransferError::invalid_state("transfer already finished"));
        }
        self.status = TransferStatus::Hold;
        Ok(())
    }

    /// Mark finished
    pub fn complete(&mut self) {
        self.status = TransferStatus::Done;
        self.completed_at = Some(now_secs());
        self.error = None;
    }

    /// Mark failed with a message
    pub fn fail(&mut self, message: impl Into<String>) {
        self.status = TransferStatus::Error;
        self.error = Some(message.into());
    }

    /// Error -> Pending, keeping completed chunks
    ///
    /// A transfer whose chunks all finished can only have failed its whole
    /// content check, so it is rewound to transfer every chunk again.
    /// Returns whether it was rewound; the caller then owns removing the
    /// stale chunk records.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::InvalidState`] unless the transfer failed.
    pub fn restart(&mut self) -> Result<bool> {
        if self.status != TransferStatus::Error {
            return Err(TransferError::InvalidState(Cow::Owned(format!(
                "only failed transfers can be restarted, state is {}",
                self.status
            ))));
        }
        self.status = TransferStatus::Pending;
        self.error = None;

        let rewind = self.is_sequence_complete();
        if rewind {
            self.rewind();
        }
        Ok(rewind)
    }

    /// Forget all progress
    ///
    /// A retrieval also forgets the archive size and digest so they are
    /// read again from its job.
    pub fn rewind(&mut self) {
        self.position = 0;
        self.completed_offsets.clear();
        if self.kind == TransferKind::Retrieval {
            self.total_size = 0;
            self.checksum = None;
        }
    }
}
