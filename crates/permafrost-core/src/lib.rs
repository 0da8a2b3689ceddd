//! # Permafrost Core
//!
//! Transfer execution core for resumable archive transfers to and from an
//! asynchronous cold-storage service.
//!
//! This crate provides:
//! - A rate-limited, retrying, cancelable job scheduler with per-category
//!   concurrency caps
//! - A completion waiter that polls through the scheduler
//! - Resumable transfer records with out-of-order chunk sequencing
//! - Upload and retrieval engines with startup recovery
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │              UploadEngine / RetrievalEngine                      │
//! │   (plan chunks, fold completions, verify, finalize, recover)    │
//! ├───────────────────────────────┬─────────────────────────────────┤
//! │            Waiter             │          RecordStore            │
//! │   (poll until a criterion)    │   (transfers and parts)         │
//! ├───────────────────────────────┴─────────────────────────────────┤
//! │                         Scheduler                                │
//! │   (fixed-rate admission, slots per category, retry, cancel)     │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                        ColdStorage                               │
//! │   (remote multipart and job API)                                │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod record;
pub mod remote;
pub mod scheduler;
pub mod slots;
pub mod store;
pub mod waiter;

pub use config::TransferConfig;
pub use context::Context;
pub use engine::{Progress, RecoveryReport, ResumedTransfer, RetrievalEngine, UploadEngine};
pub use error::{Result, TransferError};
pub use record::{Part, PartStatus, TransferKind, TransferRecord, TransferStatus};
pub use remote::{ColdStorage, JobDescription, JobStatus, Page};
pub use scheduler::{JobHandle, JobOptions, Scheduler, SchedulerState};
pub use slots::{Category, ConcurrencySlots};
pub use store::{Filter, JsonFileStore, MemoryStore, ObservableStore, RecordStore, StoreEvent};
pub use waiter::{Criterion, Waiter};
