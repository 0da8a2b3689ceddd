//! Upload and retrieval orchestration
//!
//! Both engines share the same shape: persist a [`TransferRecord`], plan
//! its pending chunks as [`Part`] records, push one scheduler job per chunk,
//! fold completions into the record one at a time, then verify the whole
//! content hash and finalize.
//!
//! Chunk transfers run concurrently, but every mutation of a given record
//! goes through a per-record lock so out-of-order completions never race.

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use std::borrow::Cow;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::context::Context;
use crate::error::{Result, TransferError};
use crate::record::{Part, TransferKind, TransferRecord, TransferStatus};
use crate::scheduler::JobOptions;
use crate::slots::Category;
use crate::store::{Filter, RecordStore};

mod retrieval;
mod upload;

pub use retrieval::RetrievalEngine;
pub use upload::UploadEngine;

/// Message stored on transfers interrupted by a previous process
pub const ABORTED_MESSAGE: &str = "Operation aborted";

/// Progress snapshot of one transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Progress {
    /// Bytes known complete
    pub finished_size: u64,
    /// Total bytes
    pub total_size: u64,
    /// Rounded percentage
    pub percent: u8,
    /// Lifecycle state
    pub status: TransferStatus,
}

/// A transfer resumed by startup recovery
#[derive(Debug)]
pub struct ResumedTransfer {
    /// Transfer id
    pub id: String,
    /// Task driving the transfer to completion
    pub handle: JoinHandle<Result<TransferRecord>>,
}

/// Outcome of startup recovery
#[derive(Debug, Default)]
pub struct RecoveryReport {
    /// Transfers found in `Hold` and marked failed
    pub aborted: Vec<String>,
    /// Finished transfers removed
    pub pruned: Vec<String>,
    /// Transfers whose remote operation no longer exists
    pub expired: Vec<String>,
    /// Chunk records without a parent
    pub orphaned_parts: usize,
    /// Malformed records left untouched
    pub invalid: Vec<String>,
    /// Transfers handed back to the scheduler
    pub resumed: Vec<ResumedTransfer>,
}

/// State shared by both engines
pub(crate) struct EngineCore {
    pub(crate) ctx: Arc<Context>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl EngineCore {
    pub(crate) fn new(ctx: Arc<Context>) -> Self {
        Self {
            ctx,
            locks: DashMap::new(),
        }
    }

    fn lock_for(&self, id: &str) -> Arc<Mutex<()>> {
        Arc::clone(self.locks.entry(id.to_string()).or_default().value())
    }

    /// Stored record of `id`, rejected if it cannot be driven safely
    pub(crate) async fn load(&self, id: &str) -> Result<TransferRecord> {
        let record = self
            .ctx
            .records
            .get(id)
            .await?
            .ok_or_else(|| TransferError::TransferNotFound(id.to_string()))?;
        record.validate()?;
        Ok(record)
    }

    /// Apply `change` to the stored record under its lock and persist it
    pub(crate) async fn mutate<F>(&self, id: &str, change: F) -> Result<TransferRecord>
    where
        F: FnOnce(&mut TransferRecord) -> Result<()> + Send,
    {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let mut record = self.load(id).await?;
        change(&mut record)?;
        self.ctx.records.update(record).await
    }

    /// Error -> Pending; a rewound transfer loses its chunk records too
    ///
    /// Returns the stored record and whether it was rewound.
    pub(crate) async fn restart(&self, id: &str) -> Result<(TransferRecord, bool)> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let mut record = self.load(id).await?;
        let rewound = record.restart()?;
        if rewound {
            let removed = self.remove_parts(id).await?;
            tracing::info!(transfer = %id, parts = removed, "Rewinding transfer");
        }
        let record = self.ctx.records.update(record).await?;
        Ok((record, rewound))
    }

    /// Pending chunks of `record`, reusing persisted parts where present
    pub(crate) async fn plan_parts(&self, record: &TransferRecord) -> Result<Vec<Part>> {
        let mut parts = Vec::new();
        for chunk in record.pending_chunks() {
            let part = match self.ctx.parts.get(&chunk.id).await? {
                Some(existing) => existing,
                None => self.ctx.parts.create(chunk).await?,
            };
            parts.push(part);
        }
        Ok(parts)
    }

    /// Chunk records of `parent_id`, ordered by position
    pub(crate) async fn parts_of(&self, parent_id: &str) -> Result<Vec<Part>> {
        let mut parts = self
            .ctx
            .parts
            .find(&Filter::new("parent_id", parent_id))
            .await?;
        parts.sort_by_key(|part| part.position);
        Ok(parts)
    }

    async fn remove_parts(&self, parent_id: &str) -> Result<usize> {
        let parts = self.parts_of(parent_id).await?;
        for part in &parts {
            self.ctx.parts.remove(&part.id).await?;
        }
        Ok(parts.len())
    }

    /// Delete a record together with its chunks
    pub(crate) async fn discard(&self, id: &str) -> Result<()> {
        {
            let lock = self.lock_for(id);
            let _guard = lock.lock().await;
            self.remove_parts(id).await?;
            self.ctx.records.remove(id).await?;
        }
        self.locks.remove(id);
        Ok(())
    }

    /// Mark one chunk done and fold it into its record
    async fn complete_part(&self, mut part: Part, checksum: String) -> Result<TransferRecord> {
        let lock = self.lock_for(&part.parent_id);
        let _guard = lock.lock().await;

        let mut record = self.load(&part.parent_id).await?;
        if record.status == TransferStatus::Hold {
            return Err(TransferError::Cancelled);
        }

        part.complete(checksum);
        self.ctx.parts.update(part.clone()).await?;

        record.add_sequence(part.position)?;
        let record = self.ctx.records.update(record).await?;

        tracing::debug!(
            transfer = %record.id,
            position = part.position,
            percent = record.completion_percent(),
            "Chunk complete"
        );
        Ok(record)
    }

    /// Push one job per part and fold completions as they arrive
    ///
    /// On the first failure the remaining jobs of the transfer are
    /// cancelled and the error is returned.
    pub(crate) async fn run_parts<J, F, Fut>(
        &self,
        record: TransferRecord,
        parts: Vec<Part>,
        category: Category,
        job_for: J,
    ) -> Result<TransferRecord>
    where
        J: Fn(&Part) -> F + Send,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<String>> + Send + 'static,
    {
        let id = record.id.clone();
        let mut pending = FuturesUnordered::new();

        for part in parts {
            let handle = match self
                .ctx
                .scheduler
                .push(job_for(&part), JobOptions::new(category).reference(id.as_str()))
            {
                Ok(handle) => handle,
                Err(e) => {
                    self.ctx.scheduler.remove(id.as_str()).await;
                    return Err(e);
                }
            };
            pending.push(async move { (part, handle.await) });
        }

        let mut latest = record;
        while let Some((part, result)) = pending.next().await {
            let outcome = match result {
                Ok(checksum) => self.complete_part(part, checksum).await,
                Err(e) => Err(e),
            };

            match outcome {
                Ok(record) => latest = record,
                Err(e) => {
                    drop(pending);
                    self.ctx.scheduler.remove(id.as_str()).await;
                    return Err(e);
                }
            }
        }

        Ok(latest)
    }

    /// Persist the outcome of a failed drive
    ///
    /// Cancellation leaves the record alone, an expired remote operation
    /// removes it, anything else is stored on the record as `Error`.
    pub(crate) async fn settle_failure(&self, id: &str, err: TransferError) -> TransferError {
        if err.is_cancelled() {
            tracing::debug!(transfer = %id, "Transfer cancelled");
            return err;
        }

        if err.is_not_found() {
            tracing::warn!(transfer = %id, "Remote operation expired, removing transfer: {}", err);
            if let Err(e) = self.discard(id).await {
                tracing::error!(transfer = %id, "Failed to remove expired transfer: {}", e);
            }
            return err;
        }

        tracing::error!(transfer = %id, "Transfer failed: {}", err);
        let message = err.to_string();
        let stored = self
            .mutate(id, move |record| {
                if !matches!(record.status, TransferStatus::Hold | TransferStatus::Done) {
                    record.fail(message);
                }
                Ok(())
            })
            .await;
        if let Err(e) = stored {
            tracing::error!(transfer = %id, "Failed to persist transfer error: {}", e);
        }
        err
    }

    /// Enter `Hold` and drain the transfer's jobs and polls
    pub(crate) async fn hold_and_drain(&self, id: &str) -> Result<TransferRecord> {
        let record = self.mutate(id, TransferRecord::hold).await?;
        self.ctx.waiter.remove(id).await;
        self.ctx.scheduler.remove(id).await;
        Ok(record)
    }

    pub(crate) async fn progress(&self, id: &str) -> Result<Progress> {
        let record = self.load(id).await?;
        Ok(Progress {
            finished_size: record.finished_size(),
            total_size: record.total_size,
            percent: record.completion_percent(),
            status: record.status,
        })
    }

    pub(crate) async fn transfers(&self, kind: TransferKind) -> Result<Vec<TransferRecord>> {
        self.ctx
            .records
            .find(&Filter::new("kind", serde_json::to_value(kind)?))
            .await
    }

    async fn valid_transfers(&self, kind: TransferKind) -> Result<Vec<TransferRecord>> {
        let mut records = self.transfers(kind).await?;
        records.retain(|record| record.validate().is_ok());
        Ok(records)
    }
}

/// Kind-specific hooks used by the shared recovery sequence
#[async_trait]
pub(crate) trait TransferDriver: Clone + Send + Sync + 'static {
    const KIND: TransferKind;

    fn core(&self) -> &EngineCore;

    /// Ids of the remote operations that still exist in `vault_name`
    async fn remote_ids(&self, vault_name: &str) -> Result<HashSet<String>>;

    /// Drive a persisted transfer to completion
    async fn drive(&self, id: &str) -> Result<TransferRecord>;
}

/// Startup recovery for one transfer kind
pub(crate) async fn recover<D: TransferDriver>(driver: &D) -> Result<RecoveryReport> {
    let core = driver.core();
    let mut report = RecoveryReport::default();

    // 0. Malformed records cannot be driven and are left for inspection
    for record in core.transfers(D::KIND).await? {
        if let Err(e) = record.validate() {
            tracing::warn!(transfer = %record.id, "Skipping malformed record: {}", e);
            report.invalid.push(record.id);
        }
    }

    // 1. Transfers left in Hold died mid-cancel
    for record in core.valid_transfers(D::KIND).await? {
        if record.status == TransferStatus::Hold {
            core.mutate(&record.id, |record| {
                record.fail(ABORTED_MESSAGE);
                Ok(())
            })
            .await?;
            report.aborted.push(record.id);
        }
    }

    // 2. Finished transfers are pruned
    let mut remaining = Vec::new();
    for record in core.valid_transfers(D::KIND).await? {
        if record.status == TransferStatus::Done {
            core.discard(&record.id).await?;
            report.pruned.push(record.id);
        } else {
            remaining.push(record);
        }
    }

    // 3. Transfers without a remote counterpart have expired
    let vaults: HashSet<String> = remaining.iter().map(|r| r.vault_name.clone()).collect();
    let mut known = HashSet::new();
    for vault in vaults {
        match driver.remote_ids(&vault).await {
            Ok(ids) => known.extend(ids.into_iter().map(|id| (vault.clone(), id))),
            Err(e) if e.is_not_found() => {
                tracing::warn!(vault = %vault, "Vault no longer exists");
            }
            Err(e) => return Err(e),
        }
    }

    let mut survivors = Vec::new();
    for record in remaining {
        let exists = record
            .remote_id
            .as_ref()
            .is_some_and(|remote_id| known.contains(&(record.vault_name.clone(), remote_id.clone())));
        if exists {
            survivors.push(record);
        } else {
            tracing::info!(transfer = %record.id, "Remote operation expired");
            core.discard(&record.id).await?;
            report.expired.push(record.id);
        }
    }

    // 4. Chunks whose parent is gone, across all transfer kinds
    let parents: HashSet<String> = core
        .ctx
        .records
        .list()
        .await?
        .into_iter()
        .map(|record| record.id)
        .collect();
    for part in core.ctx.parts.list().await? {
        if !parents.contains(&part.parent_id) {
            core.ctx.parts.remove(&part.id).await?;
            report.orphaned_parts += 1;
        }
    }

    // 5. Resume everything still active
    for record in survivors {
        if !record.status.is_active() {
            continue;
        }
        let engine = driver.clone();
        let id = record.id.clone();
        let handle = tokio::spawn(async move { engine.drive(&id).await });
        report.resumed.push(ResumedTransfer {
            id: record.id,
            handle,
        });
    }

    tracing::info!(
        kind = ?D::KIND,
        aborted = report.aborted.len(),
        pruned = report.pruned.len(),
        expired = report.expired.len(),
        orphaned_parts = report.orphaned_parts,
        invalid = report.invalid.len(),
        resumed = report.resumed.len(),
        "Recovery complete"
    );
    Ok(report)
}

/// Run a remote call as a scheduler job and wait for it
pub(crate) async fn scheduled<T, F, Fut>(
    ctx: &Context,
    category: Category,
    reference: &str,
    call: F,
) -> Result<T>
where
    T: Send + 'static,
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    ctx.scheduler
        .push(call, JobOptions::new(category).reference(reference))?
        .await
}

/// Compare two hex digests
pub(crate) fn check_digest(expected: &str, actual: &str) -> Result<()> {
    if expected.eq_ignore_ascii_case(actual) {
        Ok(())
    } else {
        Err(TransferError::HashMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        })
    }
}

/// Chunk length as an in-memory buffer size
pub(crate) fn buffer_len(part: &Part) -> Result<usize> {
    usize::try_from(part.size).map_err(|_| {
        TransferError::Validation(Cow::Owned(format!(
            "chunk of {} bytes does not fit in memory",
            part.size
        )))
    })
}
