//! Archive retrieval engine

use async_trait::async_trait;
use std::borrow::Cow;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use permafrost_files::chunk_io;
use permafrost_files::tree_hash;

use super::{
    EngineCore, Progress, RecoveryReport, TransferDriver, buffer_len, check_digest, recover,
    scheduled,
};
use crate::context::Context;
use crate::error::{Result, TransferError};
use crate::record::{Part, TransferKind, TransferRecord};
use crate::remote::{ColdStorage, JobDescription, JobStatus, collect_pages};
use crate::slots::Category;
use crate::store::RecordStore;
use crate::waiter::Criterion;

/// Everything one ranged download attempt needs
#[derive(Clone)]
struct PartDownload {
    remote: Arc<dyn ColdStorage>,
    vault_name: String,
    job_id: String,
    file_path: PathBuf,
    part: Part,
}

impl PartDownload {
    /// Fetch, verify and write the range; returns its tree hash
    async fn run(self) -> Result<String> {
        let length = buffer_len(&self.part)?;
        let output = self
            .remote
            .get_job_output(&self.vault_name, &self.job_id, &self.part.range)
            .await?;

        if output.body.len() != length {
            return Err(TransferError::Transport(Cow::Owned(format!(
                "short read for range {}: {} of {} bytes",
                self.part.range,
                output.body.len(),
                length
            ))));
        }

        let local = tree_hash::tree_hash_hex(&output.body)
            .ok_or_else(|| TransferError::validation("empty chunk"))?;
        if let Some(expected) = output.checksum.as_deref() {
            check_digest(expected, &local)?;
        }

        chunk_io::write_at(&self.file_path, self.part.position, &output.body).await?;
        Ok(local)
    }
}

/// Drives retrievals of vault archives into local files
#[derive(Clone)]
pub struct RetrievalEngine {
    core: Arc<EngineCore>,
}

impl RetrievalEngine {
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

    /// Request the archive and persist the record
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Validation`] for empty identifiers or the
    /// initiation call's error.
    pub async fn submit(
        &self,
        vault_name: &str,
        archive_id: &str,
        destination: &Path,
    ) -> Result<TransferRecord> {
        let chunk_size = self.ctx().config.chunk_size_in_bytes;
        let mut record = TransferRecord::retrieval(vault_name, archive_id, destination, chunk_size)?;

        let remote = Arc::clone(&self.ctx().remote);
        let vault = record.vault_name.clone();
        let archive = archive_id.to_string();
        let job_id = scheduled(self.ctx(), Category::Control, &record.id, move || {
            let remote = Arc::clone(&remote);
            let vault = vault.clone();
            let archive = archive.clone();
            async move { remote.initiate_retrieval(&vault, &archive, None).await }
        })
        .await?;
        record.remote_id = Some(job_id);

        let record = self.ctx().records.create(record).await?;
        tracing::info!(
            transfer = %record.id,
            vault = %record.vault_name,
            archive = %archive_id,
            "Retrieval submitted"
        );
        Ok(record)
    }

    /// Submit and drive a retrieval to completion
    ///
    /// # Errors
    ///
    /// See [`RetrievalEngine::submit`] and [`RetrievalEngine::drive`].
    pub async fn retrieve(
        &self,
        vault_name: &str,
        archive_id: &str,
        destination: &Path,
    ) -> Result<TransferRecord> {
        let record = self.submit(vault_name, archive_id, destination).await?;
        self.drive(&record.id).await
    }

    /// Wait for the job, download every pending range and verify the file
    ///
    /// Failures other than cancellation are persisted on the record; an
    /// expired job removes the record.
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
        let mut record = self.core.mutate(id, TransferRecord::begin).await?;
        let job_id = record
            .remote_id
            .clone()
            .ok_or_else(|| TransferError::validation("retrieval record has no job id"))?;

        if record.total_size == 0 {
            let job = self.wait_ready(&record, &job_id).await?;
            record = self.apply_job(id, job).await?;
        }

        chunk_io::preallocate(&record.file_path, record.total_size).await?;
        if record.total_size == 0 {
            return self.finish(record).await;
        }

        let parts = self.core.plan_parts(&record).await?;
        tracing::debug!(transfer = %id, pending = parts.len(), "Downloading ranges");

        let remote = Arc::clone(&self.ctx().remote);
        let vault_name = record.vault_name.clone();
        let file_path = record.file_path.clone();
        let record = self
            .core
            .run_parts(record, parts, Category::DownloadPart, |part| {
                let job = PartDownload {
                    remote: Arc::clone(&remote),
                    vault_name: vault_name.clone(),
                    job_id: job_id.clone(),
                    file_path: file_path.clone(),
                    part: part.clone(),
                };
                move || job.clone().run()
            })
            .await?;

        if !record.is_sequence_complete() {
            return Err(TransferError::invalid_state("ranges finished with gaps remaining"));
        }

        if let Some(expected) = record.checksum.clone() {
            let path = record.file_path.clone();
            let digest =
                tokio::task::spawn_blocking(move || tree_hash::compute_file_tree_hash(path))
                    .await??
                    .map(hex::encode)
                    .unwrap_or_default();
            check_digest(&expected, &digest)?;
        }

        self.finish(record).await
    }

    /// Poll the job until the service reports it finished
    async fn wait_ready(&self, record: &TransferRecord, job_id: &str) -> Result<JobDescription> {
        let remote = Arc::clone(&self.ctx().remote);
        let vault = record.vault_name.clone();
        let job = job_id.to_string();
        let poll = move || {
            let remote = Arc::clone(&remote);
            let vault = vault.clone();
            let job = job.clone();
            async move { remote.describe_job(&vault, &job).await }
        };

        tracing::debug!(transfer = %record.id, job = %job_id, "Waiting for retrieval job");
        let description = self
            .ctx()
            .waiter
            .push(poll, Criterion::new("completed", true), &record.id)
            .await?;

        if description.status_code == JobStatus::Failed {
            return Err(TransferError::InvalidState(Cow::Owned(format!(
                "retrieval job failed: {}",
                description.status_message.as_deref().unwrap_or("no reason given")
            ))));
        }
        Ok(description)
    }

    /// Take the archive size and digest from the finished job
    async fn apply_job(&self, id: &str, job: JobDescription) -> Result<TransferRecord> {
        let size = job
            .archive_size_in_bytes
            .ok_or_else(|| TransferError::validation("finished job has no archive size"))?;
        let checksum = job.sha256_tree_hash;

        tracing::info!(transfer = %id, size, "Retrieval job ready");
        self.core
            .mutate(id, move |record| {
                record.total_size = size;
                record.checksum = checksum;
                Ok(())
            })
            .await
    }

    async fn finish(&self, record: TransferRecord) -> Result<TransferRecord> {
        let record = self
            .core
            .mutate(&record.id, |record| {
                record.complete();
                Ok(())
            })
            .await?;
        for part in self.core.parts_of(&record.id).await? {
            self.ctx().parts.remove(&part.id).await?;
        }

        tracing::info!(
            transfer = %record.id,
            path = %record.file_path.display(),
            "Retrieval complete"
        );
        Ok(record)
    }

    /// Cancel a retrieval: hold it, drain its polls and downloads and remove
    /// every local record of it
    ///
    /// The partially written destination file is left in place.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::TransferNotFound`] for an unknown id, or
    /// [`TransferError::InvalidState`] for a finished transfer.
    pub async fn cancel(&self, id: &str) -> Result<()> {
        self.core.hold_and_drain(id).await?;
        self.core.discard(id).await?;
        tracing::info!(transfer = %id, "Retrieval cancelled");
        Ok(())
    }

    /// Clear a failed retrieval's error and drive it again
    ///
    /// A retrieval that failed its whole-file hash check is rewound: the
    /// job is described again and every range is downloaded again.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::InvalidState`] unless the retrieval failed,
    /// or the error that stops the new attempt.
    pub async fn restart(&self, id: &str) -> Result<TransferRecord> {
        let (_, rewound) = self.core.restart(id).await?;
        tracing::info!(transfer = %id, rewound, "Retrieval restarted");
        self.drive(id).await
    }

    /// Progress of one retrieval
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::TransferNotFound`] for an unknown id.
    pub async fn progress(&self, id: &str) -> Result<Progress> {
        self.core.progress(id).await
    }

    /// Every retrieval record
    ///
    /// # Errors
    ///
    /// Propagates store errors.
    pub async fn transfers(&self) -> Result<Vec<TransferRecord>> {
        self.core.transfers(TransferKind::Retrieval).await
    }

    /// Startup recovery for retrievals
    ///
    /// # Errors
    ///
    /// Propagates store errors and listing failures other than a missing vault.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        recover(self).await
    }
}

#[async_trait]
impl TransferDriver for RetrievalEngine {
    const KIND: TransferKind = TransferKind::Retrieval;

    fn core(&self) -> &EngineCore {
        &self.core
    }

    async fn remote_ids(&self, vault_name: &str) -> Result<HashSet<String>> {
        let ctx = self.ctx();
        let jobs = collect_pages(|marker| {
            let remote = Arc::clone(&ctx.remote);
            let vault = vault_name.to_string();
            scheduled(ctx, Category::List, vault_name, move || {
                let remote = Arc::clone(&remote);
                let vault = vault.clone();
                let marker = marker.clone();
                async move { remote.list_jobs(&vault, marker).await }
            })
        })
        .await?;
        Ok(jobs.into_iter().map(|job| job.job_id).collect())
    }

    async fn drive(&self, id: &str) -> Result<TransferRecord> {
        RetrievalEngine::drive(self, id).await
    }
}
