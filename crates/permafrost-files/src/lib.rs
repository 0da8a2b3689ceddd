//! # Permafrost Files
//!
//! File-level building blocks for permafrost archive transfers.
//!
//! This crate provides:
//! - SHA-256 tree hashing over 1 MiB leaves, matching the storage service's
//!   archive and range checksums
//! - Positional tree updates for chunks that complete out of order
//! - Position-addressed async chunk reads and writes

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod chunk_io;
pub mod tree_hash;

pub use tree_hash::{Digest, TreeHashError, TreeHasher};

/// Leaf size of the service's tree hash (1 MiB)
///
/// Independent of the transfer chunk size.
pub const HASH_CHUNK_SIZE: usize = 1024 * 1024;

/// Default transfer chunk size (4 MiB)
pub const DEFAULT_CHUNK_SIZE: u64 = 4 * 1024 * 1024;
