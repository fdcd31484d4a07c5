//! File Metadata
//!
//! A stored file is described by its size and the timestamp of its last change.
//! When the same name shows up on several partitions the listings are merged by
//! keeping the "best" metadata per name: the larger timestamp wins, ties are
//! broken by the larger size.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    /// Size of the file in bytes.
    pub size: u64,
    /// Milliseconds since the UNIX epoch of the last modification.
    pub timestamp: i64,
}

impl FileMetadata {
    pub fn new(size: u64, timestamp: i64) -> Self {
        Self { size, timestamp }
    }
}

impl Ord for FileMetadata {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.size.cmp(&other.size))
    }
}

impl PartialOrd for FileMetadata {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Merges per-partition listings into one, retaining the maximum metadata
/// per name.
pub fn flatten(
    maps: impl IntoIterator<Item = HashMap<String, FileMetadata>>,
) -> HashMap<String, FileMetadata> {
    let mut merged: HashMap<String, FileMetadata> = HashMap::new();
    for map in maps {
        for (name, meta) in map {
            merged
                .entry(name)
                .and_modify(|current| {
                    if meta > *current {
                        *current = meta;
                    }
                })
                .or_insert(meta);
        }
    }
    merged
}

/// Current wall-clock time in milliseconds, used to stamp stored files.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
