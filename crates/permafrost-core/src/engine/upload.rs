//! Multipart upload engine

use async_trait::async_trait;
use std::borrow::Cow;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use permafrost_files::chunk_io;
use permafrost_files::tree_hash::{self, combine, parse_digest};

use super::{
    EngineCore, Progress, RecoveryReport, TransferDriver, buffer_len, check_digest, recover,
    scheduled,
};
use crate::context::Context;
use crate::error::{Result, TransferError};
use crate::record::{Part, TransferKind, TransferRecord};
use crate::remote::{ColdStorage, collect_pages};
use crate::slots::Category;
use crate::store::RecordStore;

/// Everything one part upload attempt needs
#[derive(Clone)]
struct PartUpload {
    remote: Arc<dyn ColdStorage>,
    vault_name: String,
    upload_id: String,
    file_path: PathBuf,
    part: Part,
}

impl PartUpload {
    /// Read, hash and send the part; returns its verified tree hash
    async fn run(self) -> Result<String> {
        let length = buffer_len(&self.part)?;
        let body = chunk_io::read_range(&self.file_path, self.part.position, length).await?;
        if body.len() != length {
            return Err(TransferError::Validation(Cow::Owned(format!(
                "source file shrank: read {} of {} bytes at offset {}",
                body.len(),
                length,
                self.part.position
            ))));
        }

        let local = tree_hash::tree_hash_hex(&body)
            .ok_or_else(|| TransferError::validation("empty chunk"))?;
        let confirmed = self
            .remote
            .upload_part(&self.vault_name, &self.upload_id, &self.part.range, &local, body)
            .await?;

        check_digest(&local, &confirmed)?;
        Ok(local)
    }
}

/// Drives uploads of local files into vault archives
#[derive(Clone)]
pub struct UploadEngine {
    core: Arc<EngineCore>,
}

impl UploadEngine {
    /// Create an engine over a shared context
    #[must_use]
    pub fn new(ctx: Arc<Context>) -> Self {
        Self {
            core: Arc::new(EngineCore::new(ctx)),
        }
    }

    fn ctx(&self) -> &Context {
        &self.core.ctx
    }

    /// Hash the file, initiate the multipart upload and persist the record
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Validation`] for an empty file, an I/O error
    /// if the file cannot be read, or the initiation call's error.
    pub async fn submit(
        &self,
        vault_name: &str,
        file_path: &Path,
        description: Option<&str>,
    ) -> Result<TransferRecord> {
        let total_size = chunk_io::file_size(file_path).await?;
        let chunk_size = self.ctx().config.chunk_size_in_bytes;
        let mut record = TransferRecord::upload(vault_name, file_path, total_size, chunk_size)?;
        record.description = description.map(str::to_string);

        record.checksum = Some(source_checksum(file_path).await?);

        let remote = Arc::clone(&self.ctx().remote);
        let vault = record.vault_name.clone();
        let desc = record.description.clone();
        let upload_id = scheduled(self.ctx(), Category::Control, &record.id, move || {
            let remote = Arc::clone(&remote);
            let vault = vault.clone();
            let desc = desc.clone();
            async move {
                remote
                    .initiate_upload(&vault, chunk_size, desc.as_deref())
                    .await
            }
        })
        .await?;
        record.remote_id = Some(upload_id);

        let record = self.ctx().records.create(record).await?;
        tracing::info!(
            transfer = %record.id,
            vault = %record.vault_name,
            size = record.total_size,
            chunks = record.chunk_count(),
            "Upload submitted"
        );
        Ok(record)
    }

    /// Submit and drive an upload to completion
    ///
    /// # Errors
    ///
    /// See [`UploadEngine::submit`] and [`UploadEngine::drive`].
    pub async fn upload(
        &self,
        vault_name: &str,
        file_path: &Path,
        description: Option<&str>,
    ) -> Result<TransferRecord> {
        let record = self.submit(vault_name, file_path, description).await?;
        self.drive(&record.id).await
    }

    /// Upload every pending part, verify the composite hash and complete
    ///
    /// Failures other than cancellation are persisted on the record; an
    /// expired upload removes the record.
    ///
    /// # Errors
    ///
    /// Returns the error that stopped the transfer.
    pub async fn drive(&self, id: &str) -> Result<TransferRecord> {
        match self.run(id).await {
            Ok(record) => Ok(record),
            Err(e) => Err(self.core.settle_failure(id, e).await),
        }
    }

    async fn run(&self, id: &str) -> Result<TransferRecord> {
        let record = self.core.mutate(id, TransferRecord::begin).await?;
        let upload_id = record
            .remote_id
            .clone()
            .ok_or_else(|| TransferError::validation("upload record has no upload id"))?;

        let parts = self.core.plan_parts(&record).await?;
        tracing::debug!(transfer = %id, pending = parts.len(), "Uploading parts");

        let remote = Arc::clone(&self.ctx().remote);
        let vault_name = record.vault_name.clone();
        let file_path = record.file_path.clone();
        let record = self
            .core
            .run_parts(record, parts, Category::UploadPart, |part| {
                let job = PartUpload {
                    remote: Arc::clone(&remote),
                    vault_name: vault_name.clone(),
                    upload_id: upload_id.clone(),
                    file_path: file_path.clone(),
                    part: part.clone(),
                };
                move || job.clone().run()
            })
            .await?;

        if !record.is_sequence_complete() {
            return Err(TransferError::invalid_state("parts finished with gaps remaining"));
        }

        let checksum = self.composite_checksum(&record).await?;
        let expected = record
            .checksum
            .clone()
            .ok_or_else(|| TransferError::validation("upload record has no checksum"))?;
        check_digest(&expected, &checksum)?;

        self.finalize(record, &upload_id, &checksum).await
    }

    /// Combine the stored part digests in order
    async fn composite_checksum(&self, record: &TransferRecord) -> Result<String> {
        let parts = self.core.parts_of(&record.id).await?;
        if parts.len() as u64 != record.chunk_count() {
            return Err(TransferError::InvalidState(Cow::Owned(format!(
                "expected {} part records, found {}",
                record.chunk_count(),
                parts.len()
            ))));
        }

        let mut digests = Vec::with_capacity(parts.len());
        for part in &parts {
            let hex_digest = part.checksum.as_deref().ok_or_else(|| {
                TransferError::InvalidState(Cow::Owned(format!("part {} has no checksum", part.id)))
            })?;
            digests.push(parse_digest(hex_digest)?);
        }

        combine(&digests)
            .map(hex::encode)
            .ok_or_else(|| TransferError::validation("no parts to combine"))
    }

    async fn finalize(
        &self,
        record: TransferRecord,
        upload_id: &str,
        checksum: &str,
    ) -> Result<TransferRecord> {
        let remote = Arc::clone(&self.ctx().remote);
        let vault = record.vault_name.clone();
        let upload = upload_id.to_string();
        let sum = checksum.to_string();
        let size = record.total_size;
        let created = scheduled(self.ctx(), Category::Control, &record.id, move || {
            let remote = Arc::clone(&remote);
            let vault = vault.clone();
            let upload = upload.clone();
            let sum = sum.clone();
            async move { remote.complete_upload(&vault, &upload, size, &sum).await }
        })
        .await?;
        check_digest(checksum, &created.checksum)?;

        let archive_id = created.archive_id;
        let record = self
            .core
            .mutate(&record.id, move |record| {
                record.archive_id = Some(archive_id);
                record.complete();
                Ok(())
            })
            .await?;
        for part in self.core.parts_of(&record.id).await? {
            self.ctx().parts.remove(&part.id).await?;
        }

        tracing::info!(
            transfer = %record.id,
            archive = record.archive_id.as_deref().unwrap_or_default(),
            "Upload complete"
        );
        Ok(record)
    }

    /// Cancel an upload: hold it, drain its jobs, abort the remote upload
    /// and remove every local trace
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::TransferNotFound`] for an unknown id, or
    /// [`TransferError::InvalidState`] for a finished transfer.
    pub async fn cancel(&self, id: &str) -> Result<()> {
        let record = self.core.hold_and_drain(id).await?;

        if let Some(upload_id) = record.remote_id.clone() {
            let remote = Arc::clone(&self.ctx().remote);
            let vault = record.vault_name.clone();
            let aborted = scheduled(self.ctx(), Category::Control, id, move || {
                let remote = Arc::clone(&remote);
                let vault = vault.clone();
                let upload_id = upload_id.clone();
                async move { remote.abort_upload(&vault, &upload_id).await }
            })
            .await;
            match aborted {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => tracing::warn!(transfer = %id, "Abort failed, discarding anyway: {}", e),
            }
        }

        self.core.discard(id).await?;
        tracing::info!(transfer = %id, "Upload cancelled");
        Ok(())
    }

    /// Clear a failed upload's error and drive it again
    ///
    /// An upload that failed its composite hash check is rewound: the
    /// source is hashed again and every part is uploaded again.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::InvalidState`] unless the upload failed, or
    /// the error that stops the new attempt.
    pub async fn restart(&self, id: &str) -> Result<TransferRecord> {
        let (record, rewound) = self.core.restart(id).await?;
        tracing::info!(transfer = %id, rewound, "Upload restarted");

        if rewound {
            if let Err(e) = self.rehash(&record).await {
                return Err(self.core.settle_failure(id, e).await);
            }
        }
        self.drive(id).await
    }

    /// Take a fresh whole-file hash of a rewound upload's source
    async fn rehash(&self, record: &TransferRecord) -> Result<()> {
        let size = chunk_io::file_size(&record.file_path).await?;
        if size != record.total_size {
            return Err(TransferError::Validation(Cow::Owned(format!(
                "source file changed size: {} bytes, upload expects {}",
                size, record.total_size
            ))));
        }

        let checksum = source_checksum(&record.file_path).await?;
        self.core
            .mutate(&record.id, move |record| {
                record.checksum = Some(checksum);
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Progress of one upload
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::TransferNotFound`] for an unknown id.
    pub async fn progress(&self, id: &str) -> Result<Progress> {
        self.core.progress(id).await
    }

    /// Every upload record
    ///
    /// # Errors
    ///
    /// Propagates store errors.
    pub async fn transfers(&self) -> Result<Vec<TransferRecord>> {
        self.core.transfers(TransferKind::Upload).await
    }

    /// Startup recovery for uploads
    ///
    /// # Errors
    ///
    /// Propagates store errors and listing failures other than a missing vault.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        recover(self).await
    }
}

/// Whole-file tree hash of an upload source (hex)
async fn source_checksum(file_path: &Path) -> Result<String> {
    let path = file_path.to_path_buf();
    let digest = tokio::task::spawn_blocking(move || tree_hash::compute_file_tree_hash(path))
        .await??
        .ok_or_else(|| TransferError::validation("cannot upload an empty archive"))?;
    Ok(hex::encode(digest))
}

#[async_trait]
impl TransferDriver for UploadEngine {
    const KIND: TransferKind = TransferKind::Upload;

    fn core(&self) -> &EngineCore {
        &self.core
    }

    async fn remote_ids(&self, vault_name: &str) -> Result<HashSet<String>> {
        let ctx = self.ctx();
        let uploads = collect_pages(|marker| {
            let remote = Arc::clone(&ctx.remote);
            let vault = vault_name.to_string();
            scheduled(ctx, Category::List, vault_name, move || {
                let remote = Arc::clone(&remote);
                let vault = vault.clone();
                let marker = marker.clone();
                async move { remote.list_uploads(&vault, marker).await }
            })
        })
        .await?;
        Ok(uploads.into_iter().map(|upload| upload.upload_id).collect())
    }

    async fn drive(&self, id: &str) -> Result<TransferRecord> {
        UploadEngine::drive(self, id).await
    }
}
