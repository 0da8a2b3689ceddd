//! In-memory cold-storage service with fault injection

use async_trait::async_trait;
use permafrost_core::remote::{
    ArchiveCreated, ChunkOutput, NOT_FOUND_CODE, UploadDescription, VaultDescription, classify,
};
use permafrost_core::{ColdStorage, JobDescription, JobStatus, Page, Result, TransferError};
use permafrost_files::tree_hash::tree_hash_hex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// Remote calls that can be counted or made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// `initiate_upload`
    InitiateUpload,
    /// `upload_part`
    UploadPart,
    /// `complete_upload`
    CompleteUpload,
    /// `abort_upload`
    AbortUpload,
    /// `list_uploads`
    ListUploads,
    /// `initiate_retrieval`
    InitiateRetrieval,
    /// `describe_job`
    DescribeJob,
    /// `get_job_output`
    GetJobOutput,
    /// `list_jobs`
    ListJobs,
    /// `list_vaults`
    ListVaults,
}

struct Upload {
    vault: String,
    part_size: u64,
    description: Option<String>,
    parts: BTreeMap<u64, Vec<u8>>,
}

struct Archive {
    vault: String,
    data: Vec<u8>,
}

struct Job {
    vault: String,
    archive_id: String,
    polls_left: u32,
}

#[derive(Default)]
struct State {
    next_id: u64,
    uploads: BTreeMap<String, Upload>,
    archives: BTreeMap<String, Archive>,
    jobs: BTreeMap<String, Job>,
    faults: HashMap<Operation, (usize, TransferError)>,
    calls: HashMap<Operation, usize>,
    polls_until_ready: u32,
    fail_jobs: bool,
    corrupt_output: bool,
    wrong_archive_hash: bool,
    page_size: usize,
    part_delay: Duration,
}

impl State {
    fn id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }

    /// Count the call and fire any pending fault
    fn enter(&mut self, op: Operation) -> Result<()> {
        *self.calls.entry(op).or_insert(0) += 1;
        if let Some((remaining, error)) = self.faults.get_mut(&op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(error.clone());
            }
        }
        Ok(())
    }
}

fn not_found(what: &str) -> TransferError {
    classify(NOT_FOUND_CODE, what)
}

fn parse_range(range: &str) -> Result<(u64, u64)> {
    let (start, end) = range
        .split_once('-')
        .ok_or_else(|| classify("InvalidParameterValueException", "malformed range"))?;
    let start: u64 = start
        .parse()
        .map_err(|_| classify("InvalidParameterValueException", "malformed range start"))?;
    let end: u64 = end
        .parse()
        .map_err(|_| classify("InvalidParameterValueException", "malformed range end"))?;
    Ok((start, end))
}

fn paginate<T: Clone>(items: Vec<T>, page_size: usize, marker: Option<String>) -> Result<Page<T>> {
    let start: usize = match marker {
        Some(marker) => marker
            .parse()
            .map_err(|_| classify("InvalidParameterValueException", "bad marker"))?,
        None => 0,
    };
    let end = (start + page_size.max(1)).min(items.len());
    let page = items.get(start..end).map(<[T]>::to_vec).unwrap_or_default();
    Ok(Page {
        items: page,
        marker: (end < items.len()).then(|| end.to_string()),
    })
}

/// In-memory cold-storage service
///
/// Behaves like the real service for the calls the engines make and lets a
/// test inject transient faults, expire uploads and jobs, delay jobs and
/// corrupt output checksums.
pub struct MockColdStorage {
    state: Mutex<State>,
    active_parts: AtomicUsize,
    peak_parts: AtomicUsize,
}

impl Default for MockColdStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MockColdStorage {
    /// Empty service with two-item listing pages
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                page_size: 2,
                ..State::default()
            }),
            active_parts: AtomicUsize::new(0),
            peak_parts: AtomicUsize::new(0),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("mock state poisoned")
    }

    /// Fail the next `count` calls of `op` with `error`
    pub fn fail_next(&self, op: Operation, count: usize, error: TransferError) {
        self.state().faults.insert(op, (count, error));
    }

    /// Calls made so far to `op`
    pub fn calls(&self, op: Operation) -> usize {
        self.state().calls.get(&op).copied().unwrap_or(0)
    }

    /// Jobs report `InProgress` for this many describes before finishing
    pub fn set_polls_until_ready(&self, polls: u32) {
        self.state().polls_until_ready = polls;
    }

    /// New jobs finish as `Failed`
    pub fn set_fail_jobs(&self, fail: bool) {
        self.state().fail_jobs = fail;
    }

    /// Job output carries a wrong checksum
    pub fn set_corrupt_output(&self, corrupt: bool) {
        self.state().corrupt_output = corrupt;
    }

    /// Finished jobs report a wrong whole-archive digest
    pub fn set_wrong_archive_hash(&self, wrong: bool) {
        self.state().wrong_archive_hash = wrong;
    }

    /// Hold every part upload for `delay`
    pub fn set_part_delay(&self, delay: Duration) {
        self.state().part_delay = delay;
    }

    /// Store an archive directly; returns its id
    pub fn insert_archive(&self, vault: &str, data: Vec<u8>) -> String {
        let mut state = self.state();
        let id = state.id("archive");
        state.archives.insert(
            id.clone(),
            Archive {
                vault: vault.to_string(),
                data,
            },
        );
        id
    }

    /// Contents of a stored archive
    pub fn archive(&self, archive_id: &str) -> Option<Vec<u8>> {
        self.state().archives.get(archive_id).map(|a| a.data.clone())
    }

    /// True if the multipart upload still exists
    pub fn has_upload(&self, upload_id: &str) -> bool {
        self.state().uploads.contains_key(upload_id)
    }

    /// Drop an upload as if it expired on the service
    pub fn expire_upload(&self, upload_id: &str) {
        self.state().uploads.remove(upload_id);
    }

    /// Drop a job as if it expired on the service
    pub fn expire_job(&self, job_id: &str) {
        self.state().jobs.remove(job_id);
    }

    /// Highest number of part uploads seen in flight at once
    pub fn peak_parts(&self) -> usize {
        self.peak_parts.load(Ordering::SeqCst)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ColdStorage for MockColdStorage {
    async fn initiate_upload(
        &self,
        vault_name: &str,
        part_size: u64,
        description: Option<&str>,
    ) -> Result<String> {
        let mut state = self.state();
        state.enter(Operation::InitiateUpload)?;
        let id = state.id("upload");
        state.uploads.insert(
            id.clone(),
            Upload {
                vault: vault_name.to_string(),
                part_size,
                description: description.map(str::to_string),
                parts: BTreeMap::new(),
            },
        );
        Ok(id)
    }

    async fn upload_part(
        &self,
        vault_name: &str,
        upload_id: &str,
        range: &str,
        checksum: &str,
        body: Vec<u8>,
    ) -> Result<String> {
        let delay = {
            let mut state = self.state();
            state.enter(Operation::UploadPart)?;
            state.part_delay
        };

        let now = self.active_parts.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_parts.fetch_max(now, Ordering::SeqCst);
        let _in_flight = InFlight(&self.active_parts);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let (start, end) = parse_range(range)?;
        if end + 1 - start != body.len() as u64 {
            return Err(classify("InvalidParameterValueException", "range does not match body"));
        }
        let actual = tree_hash_hex(&body).unwrap_or_default();
        if actual != checksum {
            return Err(classify("InvalidParameterValueException", "checksum mismatch"));
        }

        let mut state = self.state();
        let upload = state
            .uploads
            .get_mut(upload_id)
            .filter(|upload| upload.vault == vault_name)
            .ok_or_else(|| not_found("upload"))?;
        upload.parts.insert(start, body);
        Ok(actual)
    }

    async fn complete_upload(
        &self,
        vault_name: &str,
        upload_id: &str,
        archive_size: u64,
        checksum: &str,
    ) -> Result<ArchiveCreated> {
        let mut state = self.state();
        state.enter(Operation::CompleteUpload)?;
        let upload = state
            .uploads
            .remove(upload_id)
            .filter(|upload| upload.vault == vault_name)
            .ok_or_else(|| not_found("upload"))?;

        let data: Vec<u8> = upload.parts.into_values().flatten().collect();
        if data.len() as u64 != archive_size {
            return Err(classify("InvalidParameterValueException", "archive size mismatch"));
        }
        let actual = tree_hash_hex(&data).unwrap_or_default();
        if actual != checksum {
            return Err(classify("InvalidParameterValueException", "archive checksum mismatch"));
        }

        let archive_id = state.id("archive");
        state.archives.insert(
            archive_id.clone(),
            Archive {
                vault: vault_name.to_string(),
                data,
            },
        );
        tracing::debug!(archive = %archive_id, "Mock archive created");
        Ok(ArchiveCreated {
            archive_id,
            checksum: actual,
        })
    }

    async fn abort_upload(&self, _vault_name: &str, upload_id: &str) -> Result<()> {
        let mut state = self.state();
        state.enter(Operation::AbortUpload)?;
        state
            .uploads
            .remove(upload_id)
            .map(|_| ())
            .ok_or_else(|| not_found("upload"))
    }

    async fn list_uploads(
        &self,
        vault_name: &str,
        marker: Option<String>,
    ) -> Result<Page<UploadDescription>> {
        let mut state = self.state();
        state.enter(Operation::ListUploads)?;
        let uploads = state
            .uploads
            .iter()
            .filter(|(_, upload)| upload.vault == vault_name)
            .map(|(id, upload)| UploadDescription {
                upload_id: id.clone(),
                part_size_in_bytes: upload.part_size,
                archive_description: upload.description.clone(),
            })
            .collect();
        paginate(uploads, state.page_size, marker)
    }

    async fn initiate_retrieval(
        &self,
        vault_name: &str,
        archive_id: &str,
        _description: Option<&str>,
    ) -> Result<String> {
        let mut state = self.state();
        state.enter(Operation::InitiateRetrieval)?;
        if !state
            .archives
            .get(archive_id)
            .is_some_and(|archive| archive.vault == vault_name)
        {
            return Err(not_found("archive"));
        }
        let id = state.id("job");
        let polls_left = state.polls_until_ready;
        state.jobs.insert(
            id.clone(),
            Job {
                vault: vault_name.to_string(),
                archive_id: archive_id.to_string(),
                polls_left,
            },
        );
        Ok(id)
    }

    async fn describe_job(&self, _vault_name: &str, job_id: &str) -> Result<JobDescription> {
        let mut guard = self.state();
        guard.enter(Operation::DescribeJob)?;
        let state = &mut *guard;

        let job = state.jobs.get_mut(job_id).ok_or_else(|| not_found("job"))?;
        let archive_id = job.archive_id.clone();
        if job.polls_left > 0 {
            job.polls_left -= 1;
            return Ok(JobDescription {
                job_id: job_id.to_string(),
                archive_id: Some(archive_id),
                completed: false,
                status_code: JobStatus::InProgress,
                status_message: None,
                archive_size_in_bytes: None,
                sha256_tree_hash: None,
            });
        }

        if state.fail_jobs {
            return Ok(JobDescription {
                job_id: job_id.to_string(),
                archive_id: Some(archive_id),
                completed: true,
                status_code: JobStatus::Failed,
                status_message: Some("archive unavailable".to_string()),
                archive_size_in_bytes: None,
                sha256_tree_hash: None,
            });
        }

        let archive = state.archives.get(&archive_id).ok_or_else(|| not_found("archive"))?;
        let sha256_tree_hash = if state.wrong_archive_hash {
            tree_hash_hex(b"some other archive")
        } else {
            tree_hash_hex(&archive.data)
        };
        Ok(JobDescription {
            job_id: job_id.to_string(),
            archive_id: Some(archive_id),
            completed: true,
            status_code: JobStatus::Succeeded,
            status_message: None,
            archive_size_in_bytes: Some(archive.data.len() as u64),
            sha256_tree_hash,
        })
    }

    async fn get_job_output(
        &self,
        _vault_name: &str,
        job_id: &str,
        range: &str,
    ) -> Result<ChunkOutput> {
        let mut state = self.state();
        state.enter(Operation::GetJobOutput)?;

        let job = state.jobs.get(job_id).ok_or_else(|| not_found("job"))?;
        if job.polls_left > 0 {
            return Err(classify("InvalidParameterValueException", "job not finished"));
        }
        let archive = state
            .archives
            .get(&job.archive_id)
            .ok_or_else(|| not_found("archive"))?;

        let (start, end) = parse_range(range)?;
        let body = usize::try_from(start)
            .ok()
            .zip(usize::try_from(end + 1).ok())
            .and_then(|(start, end)| archive.data.get(start..end))
            .ok_or_else(|| classify("InvalidParameterValueException", "range out of bounds"))?
            .to_vec();

        let checksum = if state.corrupt_output {
            tree_hash_hex(b"corrupted")
        } else {
            tree_hash_hex(&body)
        };
        Ok(ChunkOutput { body, checksum })
    }

    async fn list_jobs(
        &self,
        vault_name: &str,
        marker: Option<String>,
    ) -> Result<Page<JobDescription>> {
        let mut state = self.state();
        state.enter(Operation::ListJobs)?;
        let jobs = state
            .jobs
            .iter()
            .filter(|(_, job)| job.vault == vault_name)
            .map(|(id, job)| JobDescription {
                job_id: id.clone(),
                archive_id: Some(job.archive_id.clone()),
                completed: job.polls_left == 0,
                status_code: if job.polls_left == 0 {
                    JobStatus::Succeeded
                } else {
                    JobStatus::InProgress
                },
                status_message: None,
                archive_size_in_bytes: None,
                sha256_tree_hash: None,
            })
            .collect();
        paginate(jobs, state.page_size, marker)
    }

    async fn list_vaults(&self, marker: Option<String>) -> Result<Page<VaultDescription>> {
        let mut state = self.state();
        state.enter(Operation::ListVaults)?;

        let names: BTreeSet<&String> = state
            .archives
            .values()
            .map(|a| &a.vault)
            .chain(state.uploads.values().map(|u| &u.vault))
            .collect();
        let vaults = names
            .into_iter()
            .map(|name| {
                let archives: Vec<&Archive> =
                    state.archives.values().filter(|a| &a.vault == name).collect();
                VaultDescription {
                    vault_name: name.clone(),
                    number_of_archives: archives.len() as u64,
                    size_in_bytes: archives.iter().map(|a| a.data.len() as u64).sum(),
                }
            })
            .collect();
        paginate(vaults, state.page_size, marker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use permafrost_core::remote::collect_pages;

    #[tokio::test]
    async fn test_listing_pages_follow_markers() {
        let mock = MockColdStorage::new();
        for _ in 0..5 {
            mock.initiate_upload("vault", 1 << 20, None).await.unwrap();
        }
        mock.initiate_upload("other", 1 << 20, None).await.unwrap();

        let uploads = collect_pages(|marker| mock.list_uploads("vault", marker))
            .await
            .unwrap();
        assert_eq!(uploads.len(), 5);
        assert_eq!(mock.calls(Operation::ListUploads), 3);
    }

    #[tokio::test]
    async fn test_fault_injection_counts_down() {
        let mock = MockColdStorage::new();
        mock.fail_next(Operation::ListVaults, 1, TransferError::transport("reset"));

        assert!(mock.list_vaults(None).await.is_err());
        assert!(mock.list_vaults(None).await.is_ok());
        assert_eq!(mock.calls(Operation::ListVaults), 2);
    }
}
