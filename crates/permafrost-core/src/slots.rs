//! Per-category in-flight counters
//!
//! Part uploads and part downloads are capped at the configured maximum
//! number of active parts; every other category is unlimited.

use std::collections::HashMap;
use std::fmt;

/// Kind of work a scheduler job performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    /// Upload of one multipart chunk
    UploadPart,
    /// Ranged download of retrieval job output
    DownloadPart,
    /// Job or upload status lookups
    Describe,
    /// Initiate / complete / abort calls
    Control,
    /// Paginated listings
    List,
    /// Anything else
    Other,
}

impl Category {
    /// True for the I/O-bound categories that are capped
    #[must_use]
    pub fn is_limited(self) -> bool {
        matches!(self, Category::UploadPart | Category::DownloadPart)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Category::UploadPart => "upload-part",
            Category::DownloadPart => "download-part",
            Category::Describe => "describe",
            Category::Control => "control",
            Category::List => "list",
            Category::Other => "other",
        };
        f.write_str(name)
    }
}

/// In-flight request counters
#[derive(Debug, Clone)]
pub struct ConcurrencySlots {
    maximum_active_parts: usize,
    counts: HashMap<Category, usize>,
}

impl ConcurrencySlots {
    /// Create counters with the given cap for part transfers
    #[must_use]
    pub fn new(maximum_active_parts: usize) -> Self {
        Self {
            maximum_active_parts,
            counts: HashMap::new(),
        }
    }

    /// Record one more request in flight
    pub fn add(&mut self, category: Category) {
        *self.counts.entry(category).or_insert(0) += 1;
    }

    /// Record one request finished
    pub fn remove(&mut self, category: Category) {
        if let Some(count) = self.counts.get_mut(&category) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.counts.remove(&category);
            }
        }
    }

    /// Requests currently in flight for `category`
    #[must_use]
    pub fn get(&self, category: Category) -> usize {
        self.counts.get(&category).copied().unwrap_or(0)
    }

    /// Free slots for `category`; `usize::MAX` when unlimited
    #[must_use]
    pub fn available_slots(&self, category: Category) -> usize {
        if category.is_limited() {
            self.maximum_active_parts.saturating_sub(self.get(category))
        } else {
            usize::MAX
        }
    }

    /// True when nothing is in flight in any category
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.counts.values().all(|&count| count == 0)
    }
}
