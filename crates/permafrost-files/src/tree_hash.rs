//! SHA-256 tree hashing compatible with the cold-storage service's archive digest.
//!
//! The content is split into 1 MiB leaves, each leaf is hashed with SHA-256,
//! and parent nodes are the SHA-256 of the concatenation of their two children.
//! When a level has an odd number of nodes the last one is carried up to the
//! next level unchanged (it is never re-hashed on its own). The digest of the
//! single remaining node is the tree hash.
//!
//! Because every transfer chunk is `1 MiB × 2^k` in size and starts on a chunk
//! boundary, the tree hash of a chunk is exactly the subtree root at that
//! position. Whole-archive digests can therefore be built either from the
//! 1 MiB leaves or from the ordered per-chunk digests with [`combine`].

use sha2::{Digest as _, Sha256};
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

use crate::HASH_CHUNK_SIZE;

/// A raw 32-byte SHA-256 digest
pub type Digest = [u8; 32];

/// Errors raised by positional tree updates
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TreeHashError {
    /// Leaf index beyond the planned leaf count
    #[error("leaf {index} out of range (tree has {leaves} leaves)")]
    IndexOutOfRange {
        /// Offending index
        index: u64,
        /// Leaf count of the tree
        leaves: u64,
    },

    /// Leaf already supplied
    #[error("leaf {0} already set")]
    AlreadySet(u64),

    /// Digest string was not 64 hex characters
    #[error("malformed digest: {0}")]
    MalformedDigest(String),
}

/// Hash a single leaf (at most [`HASH_CHUNK_SIZE`] bytes)
#[must_use]
pub fn hash_leaf(data: &[u8]) -> Digest {
    Sha256::digest(data).into()
}

fn hash_pair(left: &Digest, right: &Digest) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// Combine ordered digests into their tree root
///
/// Returns `None` for an empty slice.
///
/// # Example
///
/// ```
/// use permafrost_files::tree_hash::{combine, hash_leaf};
///
/// let leaf = hash_leaf(b"abc");
/// assert_eq!(combine(&[leaf]), Some(leaf));
/// ```
#[must_use]
pub fn combine(digests: &[Digest]) -> Option<Digest> {
    if digests.is_empty() {
        return None;
    }

    let mut current_level = digests.to_vec();

    while current_level.len() > 1 {
        let mut next_level = Vec::with_capacity(current_level.len().div_ceil(2));

        for pair in current_level.chunks(2) {
            let node = match pair {
                [left, right] => hash_pair(left, right),
                // Odd node is carried up untouched
                [single] => *single,
                _ => unreachable!("chunks(2) yields one or two items"),
            };
            next_level.push(node);
        }

        current_level = next_level;
    }

    Some(current_level[0])
}

/// Leaf digests of an in-memory buffer
#[must_use]
pub fn leaf_digests(data: &[u8]) -> Vec<Digest> {
    data.chunks(HASH_CHUNK_SIZE).map(hash_leaf).collect()
}

/// Tree hash of an in-memory buffer, `None` when empty
#[must_use]
pub fn tree_hash(data: &[u8]) -> Option<Digest> {
    combine(&leaf_digests(data))
}

/// Hex tree hash of an in-memory buffer, `None` when empty
#[must_use]
pub fn tree_hash_hex(data: &[u8]) -> Option<String> {
    tree_hash(data).map(hex::encode)
}

/// Tree hash of a whole file
///
/// Returns `Ok(None)` for a zero-length file.
///
/// # Errors
///
/// Returns an error if the file cannot be opened or read.
pub fn compute_file_tree_hash<P: AsRef<Path>>(path: P) -> io::Result<Option<Digest>> {
    let mut file = File::open(path)?;
    let length = file.metadata()?.len();
    hash_reader(&mut file, length)
}

/// Tree hash of `length` bytes of a file starting at `offset`
///
/// A range running past the end of the file is clamped to the file size.
///
/// # Errors
///
/// Returns an error if the file cannot be opened, seeked or read.
pub fn compute_range_tree_hash<P: AsRef<Path>>(
    path: P,
    offset: u64,
    length: u64,
) -> io::Result<Option<Digest>> {
    let mut file = File::open(path)?;
    let file_size = file.metadata()?.len();
    let length = length.min(file_size.saturating_sub(offset));
    file.seek(SeekFrom::Start(offset))?;
    hash_reader(&mut file, length)
}

fn hash_reader<R: Read>(reader: &mut R, length: u64) -> io::Result<Option<Digest>> {
    let leaf_count = length.div_ceil(HASH_CHUNK_SIZE as u64);
    let mut leaves = Vec::with_capacity(leaf_count as usize);
    let mut buffer = vec![0u8; HASH_CHUNK_SIZE];
    let mut remaining = length;

    while remaining > 0 {
        let want = remaining.min(HASH_CHUNK_SIZE as u64) as usize;
        reader.read_exact(&mut buffer[..want])?;
        leaves.push(hash_leaf(&buffer[..want]));
        remaining -= want as u64;
    }

    Ok(combine(&leaves))
}

/// Parse a 64-character hex digest
///
/// # Errors
///
/// Returns [`TreeHashError::MalformedDigest`] if the input is not 32 hex bytes.
pub fn parse_digest(hex_digest: &str) -> Result<Digest, TreeHashError> {
    let bytes =
        hex::decode(hex_digest).map_err(|_| TreeHashError::MalformedDigest(hex_digest.into()))?;
    bytes
        .try_into()
        .map_err(|_| TreeHashError::MalformedDigest(hex_digest.into()))
}

/// Check a buffer against an expected hex tree hash (case-insensitive)
#[must_use]
pub fn verify(data: &[u8], expected_hex: &str) -> bool {
    tree_hash_hex(data).is_some_and(|actual| actual.eq_ignore_ascii_case(expected_hex))
}

/// Positional tree hasher
///
/// Leaves may be supplied in any order with [`TreeHasher::update`]; sibling
/// pairs are folded into their parent as soon as both are known and the
/// children are dropped, so memory tracks the unresolved frontier rather than
/// the full tree. The root becomes available after the last leaf arrives.
///
/// # Example
///
/// ```
/// use permafrost_files::tree_hash::{TreeHasher, hash_leaf, tree_hash};
///
/// let a = vec![1u8; 1024 * 1024];
/// let b = vec![2u8; 1024];
///
/// let mut hasher = TreeHasher::new(2);
/// hasher.update(1, hash_leaf(&b)).unwrap();
/// hasher.update(0, hash_leaf(&a)).unwrap();
///
/// let whole = [a, b].concat();
/// assert_eq!(hasher.root(), tree_hash(&whole));
/// ```
#[derive(Debug, Clone)]
pub struct TreeHasher {
    /// Real node count per level, leaves first
    level_sizes: Vec<u64>,
    /// Unresolved nodes keyed by (level, index)
    nodes: HashMap<(usize, u64), Digest>,
    /// One bit per leaf already supplied
    filled: Vec<u64>,
    filled_count: u64,
}

impl TreeHasher {
    /// Create a hasher for `leaf_count` leaves
    #[must_use]
    pub fn new(leaf_count: u64) -> Self {
        let mut level_sizes = vec![leaf_count];
        let mut size = leaf_count;
        while size > 1 {
            size = size.div_ceil(2);
            level_sizes.push(size);
        }

        Self {
            level_sizes,
            nodes: HashMap::new(),
            filled: vec![0u64; leaf_count.div_ceil(64) as usize],
            filled_count: 0,
        }
    }

    /// Create a hasher sized for `total_size` bytes of content
    #[must_use]
    pub fn for_size(total_size: u64) -> Self {
        Self::new(total_size.div_ceil(HASH_CHUNK_SIZE as u64))
    }

    /// Number of leaves
    #[must_use]
    pub fn leaf_count(&self) -> u64 {
        self.level_sizes[0]
    }

    /// Number of combination levels above the leaves
    ///
    /// Equals `ceil(log2(ceil(n / 2))) + 1` for `n >= 2` leaves.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.level_sizes.len() - 1
    }

    /// Supply the digest of leaf `index`
    ///
    /// # Errors
    ///
    /// Fails if the index is outside the tree or the leaf was already set.
    pub fn update(&mut self, index: u64, digest: Digest) -> Result<(), TreeHashError> {
        let leaves = self.leaf_count();
        if index >= leaves {
            return Err(TreeHashError::IndexOutOfRange { index, leaves });
        }

        let (word, bit) = ((index / 64) as usize, index % 64);
        if self.filled[word] & (1 << bit) != 0 {
            return Err(TreeHashError::AlreadySet(index));
        }
        self.filled[word] |= 1 << bit;
        self.filled_count += 1;

        self.nodes.insert((0, index), digest);
        self.fold(0, index);
        Ok(())
    }

    /// Hash `data` into consecutive leaves starting at `first_index`
    ///
    /// # Errors
    ///
    /// Fails if any resulting leaf falls outside the tree or was already set.
    pub fn update_data(&mut self, first_index: u64, data: &[u8]) -> Result<(), TreeHashError> {
        for (i, leaf) in data.chunks(HASH_CHUNK_SIZE).enumerate() {
            self.update(first_index + i as u64, hash_leaf(leaf))?;
        }
        Ok(())
    }

    fn fold(&mut self, mut level: usize, mut index: u64) {
        while level + 1 < self.level_sizes.len() {
            let size = self.level_sizes[level];
            let parent = if index % 2 == 0 && index + 1 == size {
                // Lone trailing node, promote as-is
                match self.nodes.remove(&(level, index)) {
                    Some(node) => node,
                    None => return,
                }
            } else {
                let (left_index, right_index) = (index & !1, index | 1);
                if !self.nodes.contains_key(&(level, left_index))
                    || !self.nodes.contains_key(&(level, right_index))
                {
                    return;
                }
                let (Some(left), Some(right)) = (
                    self.nodes.remove(&(level, left_index)),
                    self.nodes.remove(&(level, right_index)),
                ) else {
                    return;
                };
                hash_pair(&left, &right)
            };

            level += 1;
            index /= 2;
            self.nodes.insert((level, index), parent);
        }
    }

    /// True once every leaf has been supplied
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.filled_count == self.leaf_count()
    }

    /// Root digest, available only once every leaf is known
    #[must_use]
    pub fn root(&self) -> Option<Digest> {
        if self.leaf_count() == 0 || !self.is_complete() {
            return None;
        }
        self.nodes.get(&(self.depth(), 0)).copied()
    }

    /// Hex root digest
    #[must_use]
    pub fn root_hex(&self) -> Option<String> {
        self.root().map(hex::encode)
    }

    /// Nodes currently held in memory
    #[must_use]
    pub fn resident_nodes(&self) -> usize {
        self.nodes.len()
    }
}
