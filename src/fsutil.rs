//! Directory-tree measurement helpers.

use anyhow::Result;
use std::path::Path;
use walkdir::WalkDir;

/// Entry and byte counts for a directory tree.
#[derive(Debug, Clone, Copy, Default)]
pub struct TreeSummary {
    /// Files, directories, and symlinks under the root (root excluded).
    pub entries: u64,
    /// Total size of regular files.
    pub bytes: u64,
}

impl TreeSummary {
    /// Size in whole mebibytes, for progress lines.
    pub fn mebibytes(&self) -> u64 {
        self.bytes / 1024 / 1024
    }
}

/// Count entries and file bytes under `root` without following symlinks.
///
/// Unreadable entries are skipped rather than failing the walk; the
/// summary backs progress output, not correctness decisions.
pub fn summarize_tree(root: &Path) -> Result<TreeSummary> {
    let mut summary = TreeSummary::default();

    for entry in WalkDir::new(root).min_depth(1) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(_) => continue,
        };
        summary.entries += 1;
        if entry.file_type().is_file() {
            if let Ok(metadata) = entry.metadata() {
                summary.bytes += metadata.len();
            }
        }
    }

    Ok(summary)
}
