//! Cold-storage service contract
//!
//! The engines talk to the storage service only through [`ColdStorage`]. A
//! client maps the service's error codes into [`TransferError`] with
//! [`classify`], which keeps "resource expired" distinct from faults worth
//! retrying.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::future::Future;

use crate::error::{Result, TransferError};

/// Error code the service uses for an expired or unknown resource
pub const NOT_FOUND_CODE: &str = "ResourceNotFoundException";

/// Codes that describe a malformed request rather than a service fault
const REJECTED_CODES: &[&str] = &[
    "InvalidParameterValueException",
    "MissingParameterValueException",
    "PolicyEnforcedException",
];

/// Map a service error code to the transfer error taxonomy
#[must_use]
pub fn classify(code: &str, message: &str) -> TransferError {
    if code == NOT_FOUND_CODE {
        return TransferError::NotFound(Cow::Owned(message.to_string()));
    }
    if REJECTED_CODES.contains(&code) {
        return TransferError::Rejected {
            code: code.to_string(),
            message: message.to_string(),
        };
    }
    TransferError::Remote {
        code: code.to_string(),
        message: message.to_string(),
    }
}

/// One page of a paginated listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page<T> {
    /// Items on this page
    pub items: Vec<T>,
    /// Continuation marker, `None` on the last page
    pub marker: Option<String>,
}

impl<T> Page<T> {
    /// Final page holding `items`
    #[must_use]
    pub fn last(items: Vec<T>) -> Self {
        Self {
            items,
            marker: None,
        }
    }
}

/// Follow continuation markers until the listing is exhausted
///
/// # Errors
///
/// Propagates the first fetch error. Returns [`TransferError::Validation`]
/// if the service hands back the marker it was just given, which would
/// otherwise loop forever.
pub async fn collect_pages<T, F, Fut>(mut fetch: F) -> Result<Vec<T>>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = Result<Page<T>>>,
{
    let mut items = Vec::new();
    let mut marker: Option<String> = None;

    loop {
        let page = fetch(marker.clone()).await?;
        items.extend(page.items);

        match page.marker {
            None => return Ok(items),
            Some(next) if marker.as_deref() == Some(next.as_str()) => {
                return Err(TransferError::Validation(Cow::Owned(format!(
                    "listing repeated continuation marker {next}"
                ))));
            }
            next => marker = next,
        }
    }
}

/// Retrieval job state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    /// Still being prepared
    InProgress,
    /// Output ready to download
    Succeeded,
    /// Terminated without output
    Failed,
}

/// Snapshot of a retrieval job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDescription {
    /// Job identifier
    pub job_id: String,
    /// Archive the job retrieves
    pub archive_id: Option<String>,
    /// True once the job reached a terminal status
    pub completed: bool,
    /// Current status
    pub status_code: JobStatus,
    /// Service message accompanying the status
    pub status_message: Option<String>,
    /// Size of the retrieved archive
    pub archive_size_in_bytes: Option<u64>,
    /// Tree hash of the whole archive (hex)
    pub sha256_tree_hash: Option<String>,
}

/// Ranged job output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkOutput {
    /// Bytes of the requested range
    pub body: Vec<u8>,
    /// Service-computed tree hash of the range (hex)
    pub checksum: Option<String>,
}

/// In-progress multipart upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadDescription {
    /// Multipart upload identifier
    pub upload_id: String,
    /// Part size the upload was initiated with
    pub part_size_in_bytes: u64,
    /// Archive description given at initiation
    pub archive_description: Option<String>,
}

/// Vault summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultDescription {
    /// Vault name
    pub vault_name: String,
    /// Archives in the last inventory
    pub number_of_archives: u64,
    /// Bytes in the last inventory
    pub size_in_bytes: u64,
}

/// Result of a completed multipart upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveCreated {
    /// New archive identifier
    pub archive_id: String,
    /// Service-computed tree hash (hex)
    pub checksum: String,
}

/// Asynchronous cold-storage service
///
/// Implementations return [`TransferError::NotFound`] for an unknown or
/// expired upload, job or vault, and a transient error for faults that may
/// succeed on retry.
#[async_trait]
pub trait ColdStorage: Send + Sync {
    /// Start a multipart upload; returns the upload id
    async fn initiate_upload(
        &self,
        vault_name: &str,
        part_size: u64,
        description: Option<&str>,
    ) -> Result<String>;

    /// Upload one part at an inclusive `"start-end"` range; returns the
    /// service's tree hash of the received bytes
    async fn upload_part(
        &self,
        vault_name: &str,
        upload_id: &str,
        range: &str,
        checksum: &str,
        body: Vec<u8>,
    ) -> Result<String>;

    /// Assemble the uploaded parts into an archive
    async fn complete_upload(
        &self,
        vault_name: &str,
        upload_id: &str,
        archive_size: u64,
        checksum: &str,
    ) -> Result<ArchiveCreated>;

    /// Discard a multipart upload and its parts
    async fn abort_upload(&self, vault_name: &str, upload_id: &str) -> Result<()>;

    /// One page of in-progress multipart uploads
    async fn list_uploads(
        &self,
        vault_name: &str,
        marker: Option<String>,
    ) -> Result<Page<UploadDescription>>;

    /// Request an archive retrieval; returns the job id
    async fn initiate_retrieval(
        &self,
        vault_name: &str,
        archive_id: &str,
        description: Option<&str>,
    ) -> Result<String>;

    /// Current state of a job
    async fn describe_job(&self, vault_name: &str, job_id: &str) -> Result<JobDescription>;

    /// Download an inclusive `"start-end"` range of a finished job's output
    async fn get_job_output(
        &self,
        vault_name: &str,
        job_id: &str,
        range: &str,
    ) -> Result<ChunkOutput>;

    /// One page of the vault's jobs
    async fn list_jobs(
        &self,
        vault_name: &str,
        marker: Option<String>,
    ) -> Result<Page<JobDescription>>;

    /// One page of vaults
    async fn list_vaults(&self, marker: Option<String>) -> Result<Page<VaultDescription>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert!(classify(NOT_FOUND_CODE, "gone").is_not_found());
        assert!(classify("ServiceUnavailableException", "busy").should_retry());
        assert!(classify("ThrottlingException", "slow down").is_transient());

        let rejected = classify("InvalidParameterValueException", "bad range");
        assert!(rejected.is_permanent());
        assert!(!rejected.should_retry());
    }

    #[tokio::test]
    async fn test_collect_pages_follows_markers() {
        let pages = vec![
            Page {
                items: vec![1, 2],
                marker: Some("m1".to_string()),
            },
            Page {
                items: vec![3],
                marker: Some("m2".to_string()),
            },
            Page::last(vec![4, 5]),
        ];

        let mut seen_markers = Vec::new();
        let mut remaining = pages.into_iter();
        let items = collect_pages(|marker| {
            seen_markers.push(marker);
            let page = remaining.next().ok_or(TransferError::validation("too many fetches"));
            async move { page }
        })
        .await
        .unwrap();

        assert_eq!(items, vec![1, 2, 3, 4, 5]);
        assert_eq!(
            seen_markers,
            vec![None, Some("m1".to_string()), Some("m2".to_string())]
        );
    }

    #[tokio::test]
    async fn test_collect_pages_rejects_repeated_marker() {
        let result = collect_pages(|_marker| async {
            Ok(Page {
                items: vec![0u8],
                marker: Some("same".to_string()),
            })
        })
        .await;

        assert!(matches!(result, Err(TransferError::Validation(_))));
    }

    #[tokio::test]
    async fn test_collect_pages_propagates_errors() {
        let result: Result<Vec<u8>> =
            collect_pages(|_marker| async { Err(TransferError::transport("reset")) }).await;
        assert_eq!(result, Err(TransferError::transport("reset")));
    }
}
