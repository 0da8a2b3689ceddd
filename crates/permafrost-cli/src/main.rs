//! Permafrost CLI
//!
//! Offline tooling around resumable cold-storage transfers: tree hashes,
//! chunk plans and the on-disk transfer records.

mod config;
mod progress;

use anyhow::Context as _;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use config::Config;
use permafrost_core::{
    Filter, JsonFileStore, Part, PartStatus, RecordStore, TransferConfig, TransferKind,
    TransferRecord,
};
use permafrost_files::HASH_CHUNK_SIZE;
use permafrost_files::chunk_io;
use permafrost_files::tree_hash::TreeHasher;
use progress::{HashProgress, format_bytes, percent_bar};

/// Bytes read per I/O call while hashing
const READ_BLOCK: usize = 16 * HASH_CHUNK_SIZE;

/// Permafrost - resumable archive transfers for cold storage
#[derive(Parser)]
#[command(name = "permafrost")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path (defaults to the user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compute the SHA-256 tree hash of a file or byte range
    Hash {
        /// File to hash
        #[arg(required = true)]
        file: PathBuf,

        /// First byte of the range
        #[arg(long, default_value_t = 0)]
        offset: u64,

        /// Range length (defaults to the rest of the file)
        #[arg(long)]
        length: Option<u64>,
    },

    /// Check a file against an expected tree hash
    Verify {
        /// File to check
        #[arg(required = true)]
        file: PathBuf,

        /// Expected tree hash (hex)
        #[arg(required = true)]
        digest: String,
    },

    /// Show how content of a given size is split into transfer chunks
    Plan {
        /// Content size in bytes
        #[arg(required = true)]
        size: u64,

        /// Chunk size in bytes (defaults to the configured size)
        #[arg(long)]
        chunk_size: Option<u64>,
    },

    /// List persisted transfers
    List {
        /// Only show one direction
        #[arg(long, value_enum)]
        kind: Option<KindArg>,
    },

    /// Show one persisted transfer and its chunks
    Show {
        /// Transfer id
        #[arg(required = true)]
        id: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum KindArg {
    Upload,
    Retrieval,
}

impl From<KindArg> for TransferKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Upload => TransferKind::Upload,
            KindArg::Retrieval => TransferKind::Retrieval,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("reading config {}", path.display()))?,
        None => Config::load_or_create(Config::default_path())?,
    };

    // Initialize logging
    let level = if cli.verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();

    // Validate configuration
    config.validate()?;

    match cli.command {
        Commands::Hash {
            file,
            offset,
            length,
        } => {
            hash_file(&file, offset, length).await?;
        }
        Commands::Verify { file, digest } => {
            verify_file(&file, &digest).await?;
        }
        Commands::Plan { size, chunk_size } => {
            show_plan(size, chunk_size, &config)?;
        }
        Commands::List { kind } => {
            list_transfers(kind.map(TransferKind::from), &config).await?;
        }
        Commands::Show { id } => {
            show_transfer(&id, &config).await?;
        }
    }

    Ok(())
}

/// Stream `length` bytes at `offset` through a [`TreeHasher`]
async fn tree_hash_range(path: &Path, offset: u64, length: u64) -> anyhow::Result<String> {
    if length == 0 {
        anyhow::bail!("Empty content has no tree hash");
    }

    let label = path.file_name().and_then(|n| n.to_str()).unwrap_or("input");
    let progress = HashProgress::new(length, label);
    let mut hasher = TreeHasher::for_size(length);

    let mut done = 0u64;
    let mut leaf = 0u64;
    while done < length {
        let block = usize::try_from(length - done).map_or(READ_BLOCK, |rest| rest.min(READ_BLOCK));
        let data = match chunk_io::read_range(path, offset + done, block).await {
            Ok(data) => data,
            Err(e) => {
                progress.abandon();
                return Err(e).with_context(|| format!("reading {}", path.display()));
            }
        };

        hasher.update_data(leaf, &data)?;
        leaf += data.len().div_ceil(HASH_CHUNK_SIZE) as u64;
        done += data.len() as u64;
        progress.advance(data.len() as u64);
    }
    progress.finish();

    tracing::debug!(leaves = hasher.leaf_count(), depth = hasher.depth(), "Tree hash complete");
    hasher
        .root_hex()
        .ok_or_else(|| anyhow::anyhow!("Tree hash did not resolve"))
}

/// Resolve the hashed range against the file size
fn resolve_range(size: u64, offset: u64, length: Option<u64>) -> anyhow::Result<u64> {
    if offset > size {
        anyhow::bail!("Offset {offset} is past the end of a {size} byte file");
    }
    let length = length.unwrap_or(size - offset);
    if offset.checked_add(length).is_none_or(|end| end > size) {
        anyhow::bail!("Range {offset}+{length} exceeds the {size} byte file");
    }
    Ok(length)
}

/// Print the tree hash of a file or range
async fn hash_file(file: &Path, offset: u64, length: Option<u64>) -> anyhow::Result<()> {
    let size = chunk_io::file_size(file)
        .await
        .with_context(|| format!("reading {}", file.display()))?;
    let length = resolve_range(size, offset, length)?;

    tracing::info!("Hashing {} bytes of {:?} at offset {}", length, file, offset);
    let digest = tree_hash_range(file, offset, length).await?;
    println!("{digest}  {}", file.display());
    Ok(())
}

/// Compare a file's tree hash with `expected`
async fn verify_file(file: &Path, expected: &str) -> anyhow::Result<()> {
    let size = chunk_io::file_size(file)
        .await
        .with_context(|| format!("reading {}", file.display()))?;
    let actual = tree_hash_range(file, 0, size).await?;

    if !actual.eq_ignore_ascii_case(expected.trim()) {
        anyhow::bail!("{}: tree hash mismatch (expected {}, got {})", file.display(), expected, actual);
    }
    println!("{}: OK", file.display());
    Ok(())
}

/// Print the chunk layout for `size` bytes
fn show_plan(size: u64, chunk_size: Option<u64>, config: &Config) -> anyhow::Result<()> {
    let transfer = TransferConfig {
        chunk_size_in_bytes: chunk_size.unwrap_or(config.transfer.chunk_size_in_bytes),
        ..config.transfer.clone()
    };
    transfer.validate()?;

    let record = TransferRecord::upload("plan", PathBuf::new(), size, transfer.chunk_size_in_bytes)?;
    let hasher = TreeHasher::for_size(size);

    println!("Size: {} ({} bytes)", format_bytes(size), size);
    println!("Chunk size: {}", format_bytes(record.chunk_size));
    println!("Chunks: {}", record.chunk_count());
    println!("Tree: {} leaves, depth {}", hasher.leaf_count(), hasher.depth());
    println!();

    for (index, part) in record.pending_chunks().iter().enumerate() {
        println!("{index:>6}  {:<32}  {}", part.range, format_bytes(part.size));
    }
    Ok(())
}

async fn open_transfers(config: &Config) -> anyhow::Result<JsonFileStore<TransferRecord>> {
    let dir = config.store.transfers_dir();
    JsonFileStore::open(&dir)
        .await
        .with_context(|| format!("opening transfer records in {}", dir.display()))
}

/// Print a table of persisted transfers
async fn list_transfers(kind: Option<TransferKind>, config: &Config) -> anyhow::Result<()> {
    let store = open_transfers(config).await?;
    let records: Vec<TransferRecord> = store
        .list()
        .await?
        .into_iter()
        .filter(|record| kind.is_none_or(|kind| record.kind == kind))
        .collect();

    if records.is_empty() {
        println!("No transfers");
        return Ok(());
    }

    println!("{:<32}  {:<9}  {:<10}  {:<20}  {:>12}  PROGRESS", "ID", "KIND", "STATUS", "VAULT", "SIZE");
    for record in &records {
        println!(
            "{:<32}  {:<9}  {:<10}  {:<20}  {:>12}  {}",
            record.id,
            format!("{:?}", record.kind),
            record.status.to_string(),
            record.vault_name,
            format_bytes(record.total_size),
            percent_bar(record.completion_percent(), 20)
        );
    }
    Ok(())
}

/// Print one transfer and the state of its chunks
async fn show_transfer(id: &str, config: &Config) -> anyhow::Result<()> {
    let store = open_transfers(config).await?;
    let record = store
        .get(id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("No transfer with id {id}"))?;

    println!("Transfer: {}", record.id);
    println!("  Kind: {:?}", record.kind);
    println!("  Status: {}", record.status);
    println!("  Vault: {}", record.vault_name);
    println!("  File: {}", record.file_path.display());
    if let Some(archive_id) = &record.archive_id {
        println!("  Archive: {archive_id}");
    }
    if let Some(remote_id) = &record.remote_id {
        println!("  Remote id: {remote_id}");
    }
    if let Some(description) = &record.description {
        println!("  Description: {description}");
    }
    println!(
        "  Progress: {} of {} {}",
        format_bytes(record.finished_size()),
        format_bytes(record.total_size),
        percent_bar(record.completion_percent(), 20)
    );
    println!("  Chunks: {} x {}", record.chunk_count(), format_bytes(record.chunk_size));
    if !record.completed_offsets.is_empty() {
        println!("  Out of order: {}", record.completed_offsets.len());
    }
    if let Some(checksum) = &record.checksum {
        println!("  Tree hash: {checksum}");
    }
    if let Some(error) = &record.error {
        println!("  Error: {error}");
    }

    let parts_dir = config.store.parts_dir();
    let parts: JsonFileStore<Part> = JsonFileStore::open(&parts_dir)
        .await
        .with_context(|| format!("opening part records in {}", parts_dir.display()))?;
    let mut parts = parts.find(&Filter::new("parent_id", id)).await?;
    parts.sort_by_key(|part| part.position);

    if !parts.is_empty() {
        let done = parts.iter().filter(|part| part.status == PartStatus::Done).count();
        println!();
        println!("Parts ({done}/{} done):", parts.len());
        for part in &parts {
            println!(
                "  {:<32}  {:<7}  {}",
                part.range,
                format!("{:?}", part.status),
                part.checksum.as_deref().unwrap_or("-")
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use permafrost_files::tree_hash::tree_hash_hex;

    #[test]
    fn test_resolve_range() {
        assert_eq!(resolve_range(100, 0, None).unwrap(), 100);
        assert_eq!(resolve_range(100, 40, None).unwrap(), 60);
        assert_eq!(resolve_range(100, 40, Some(10)).unwrap(), 10);
        assert!(resolve_range(100, 101, None).is_err());
        assert!(resolve_range(100, 50, Some(51)).is_err());
        assert!(resolve_range(100, 1, Some(u64::MAX)).is_err());
    }

    #[tokio::test]
    async fn test_streamed_hash_matches_in_memory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let data: Vec<u8> = (0..READ_BLOCK + 3 * HASH_CHUNK_SIZE + 17)
            .map(|i| (i % 253) as u8)
            .collect();
        std::fs::write(&path, &data).unwrap();

        let whole = tree_hash_range(&path, 0, data.len() as u64).await.unwrap();
        assert_eq!(Some(whole), tree_hash_hex(&data));

        let offset = HASH_CHUNK_SIZE + 5;
        let range = tree_hash_range(&path, offset as u64, 2 * HASH_CHUNK_SIZE as u64)
            .await
            .unwrap();
        assert_eq!(
            Some(range),
            tree_hash_hex(&data[offset..offset + 2 * HASH_CHUNK_SIZE])
        );
    }

    #[tokio::test]
    async fn test_empty_range_has_no_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.bin");
        std::fs::write(&path, b"").unwrap();

        assert!(tree_hash_range(&path, 0, 0).await.is_err());
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::try_parse_from(["permafrost", "hash", "a.bin", "--offset", "1048576"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Hash {
                offset: 1_048_576,
                length: None,
                ..
            }
        ));

        let cli = Cli::try_parse_from(["permafrost", "list", "--kind", "retrieval"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::List {
                kind: Some(KindArg::Retrieval)
            }
        ));
    }
}
