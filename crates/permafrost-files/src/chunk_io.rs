//! Position-addressed chunk I/O.
//!
//! Every call opens its own handle and touches only the requested byte
//! range, so concurrent chunk jobs may read or write the same file as long as
//! their ranges are disjoint.

use std::io;
use std::path::Path;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};

/// Read exactly `length` bytes starting at `offset`
///
/// # Errors
///
/// Returns an error if the file cannot be opened or holds fewer than
/// `offset + length` bytes.
pub async fn read_range<P: AsRef<Path>>(path: P, offset: u64, length: usize) -> io::Result<Vec<u8>> {
    let mut file = File::open(path.as_ref()).await?;
    file.seek(SeekFrom::Start(offset)).await?;

    let mut buffer = vec![0u8; length];
    file.read_exact(&mut buffer).await?;

    tracing::trace!(
        "Read {} bytes at offset {} from {}",
        length,
        offset,
        path.as_ref().display()
    );
    Ok(buffer)
}

/// Write `data` at `offset`, creating the file if missing
///
/// Existing content outside the range is left untouched.
///
/// # Errors
///
/// Returns an error if the file cannot be opened or written.
pub async fn write_at<P: AsRef<Path>>(path: P, offset: u64, data: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path.as_ref())
        .await?;
    file.seek(SeekFrom::Start(offset)).await?;
    file.write_all(data).await?;
    file.flush().await?;
    file.sync_data().await?;

    tracing::trace!(
        "Wrote {} bytes at offset {} to {}",
        data.len(),
        offset,
        path.as_ref().display()
    );
    Ok(())
}

/// Create (or resize) a destination file to `size` bytes
///
/// Parent directories are created as needed. Content already written inside
/// the new size is preserved, which lets a resumed download keep its chunks.
///
/// # Errors
///
/// Returns an error if the directories or file cannot be created.
pub async fn preallocate<P: AsRef<Path>>(path: P, size: u64) -> io::Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)
        .await?;
    if file.metadata().await?.len() != size {
        file.set_len(size).await?;
    }
    Ok(())
}

/// Size of a file in bytes
///
/// # Errors
///
/// Returns an error if the file metadata cannot be read.
pub async fn file_size<P: AsRef<Path>>(path: P) -> io::Result<u64> {
    Ok(tokio::fs::metadata(path).await?.len())
}
