//! Directory Snapshots
//!
//! A [`Snapshot`] maps every regular file in the snippet directory to its
//! modification time. Two snapshots are compared to decide whether the proxy
//! needs to be revalidated and reloaded.

use crate::Result;
use anyhow::Context;
use regex::Regex;
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Point-in-time view of the snippet directory
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    files: BTreeMap<PathBuf, SystemTime>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the top level of `dir`.
    ///
    /// Directories, dangling symlinks and files vanishing mid-read are skipped.
    /// When `filter` is set, only file names it matches are recorded.
    pub fn capture(dir: &Path, filter: Option<&Regex>) -> Result<Self> {
        let entries = std::fs::read_dir(dir)
            .with_context(|| format!("Failed to read snippet directory: {}", dir.display()))?;

        let mut files = BTreeMap::new();
        for entry in entries {
            let entry = entry
                .with_context(|| format!("Failed to read entry in: {}", dir.display()))?;
            let path = entry.path();

            if let Some(filter) = filter {
                let name = entry.file_name();
                if !filter.is_match(&name.to_string_lossy()) {
                    continue;
                }
            }

            // Follows symlinks, so a link to a regular file counts as that file
            let metadata = match std::fs::metadata(&path) {
                Ok(metadata) => metadata,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("Failed to stat snippet: {}", path.display()))
                }
            };

            if !metadata.is_file() {
                continue;
            }

            let modified = metadata
                .modified()
                .with_context(|| format!("Failed to read mtime of: {}", path.display()))?;
            files.insert(path, modified);
        }

        Ok(Self { files })
    }

    pub fn insert(&mut self, path: impl Into<PathBuf>, modified: SystemTime) {
        self.files.insert(path.into(), modified);
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.files.contains_key(path)
    }

    pub fn modified(&self, path: &Path) -> Option<SystemTime> {
        self.files.get(path).copied()
    }

    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.files.keys().map(PathBuf::as_path)
    }

    /// What changed going from `self` to `newer`
    pub fn diff(&self, newer: &Snapshot) -> SnapshotDiff {
        let mut diff = SnapshotDiff::default();

        for (path, modified) in &newer.files {
            match self.files.get(path) {
                None => diff.added.push(path.clone()),
                Some(previous) if previous != modified => diff.modified.push(path.clone()),
                Some(_) => {}
            }
        }

        for path in self.files.keys() {
            if !newer.files.contains_key(path) {
                diff.removed.push(path.clone());
            }
        }

        diff
    }
}

/// Paths that differ between two snapshots
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotDiff {
    pub added: Vec<PathBuf>,
    pub removed: Vec<PathBuf>,
    pub modified: Vec<PathBuf>,
}

impl SnapshotDiff {
    /// True when the snapshots are identical
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }

    pub fn len(&self) -> usize {
        self.added.len() + self.removed.len() + self.modified.len()
    }
}

/// Produces snapshots for the supervisor
pub trait SnapshotSource {
    /// Human readable location, used in logs
    fn location(&self) -> &Path;

    fn capture(&self) -> Result<Snapshot>;
}

/// [`SnapshotSource`] reading a real directory
#[derive(Debug, Clone)]
pub struct DirectorySource {
    dir: PathBuf,
    filter: Option<Regex>,
}

impl DirectorySource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            filter: None,
        }
    }

    pub fn with_filter(mut self, pattern: &str) -> Result<Self> {
        let regex = Regex::new(pattern)
            .with_context(|| format!("Invalid include pattern: {}", pattern))?;
        self.filter = Some(regex);
        Ok(self)
    }

    /// Create the directory (and parents) if it does not exist yet
    pub fn ensure_exists(&self) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create snippet directory: {}", self.dir.display()))
    }
}

impl SnapshotSource for DirectorySource {
    fn location(&self) -> &Path {
        &self.dir
    }

    fn capture(&self) -> Result<Snapshot> {
        Snapshot::capture(&self.dir, self.filter.as_ref())
    }
}
