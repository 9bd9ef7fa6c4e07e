//! C2 — file enumerator. Walks a set of roots, skipping exception paths and
//! symlinks, and lazily yields a `ScanContext` per regular file. Mirrors the
//! integrity scanner's `collect_entries` shape: swallow per-entry errors and
//! keep walking rather than aborting the whole scan.

use sentinel_core::model::{path_is_under, ScanContext};
use std::path::{Path, PathBuf};
use tracing::warn;
use walkdir::WalkDir;

/// How a single root is expanded into candidate files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnumerationMode {
    /// `root` names exactly one file; it is yielded on its own (subject to
    /// the usual exception and size checks).
    SingleFile,
    /// `root` names a directory; only its immediate children are walked.
    DirectoryShallow,
    /// `root` names a directory; every descendant is walked.
    DirectoryRecursive,
}

pub struct EnumerationError {
    pub message: String,
}

/// A lazily-evaluated walk over one or more roots. Nothing under `roots` is
/// touched until the iterator is driven; a caller that only wants the first
/// few matches (e.g. a manual scan the user cancels early) never pays for
/// the rest of the tree.
pub struct FileEnumerator {
    roots: std::vec::IntoIter<(PathBuf, EnumerationMode)>,
    exceptions: Vec<PathBuf>,
    max_file_size_bytes: u64,
    current: Option<walkdir::IntoIter>,
    pending: Option<ScanContext>,
    pub skipped_exceptions: usize,
    pub errors: Vec<String>,
}

impl FileEnumerator {
    /// `roots` pairs each path with how it should be expanded. A directory
    /// root not explicitly tagged `DirectoryShallow` is walked recursively.
    pub fn new(
        roots: Vec<(PathBuf, EnumerationMode)>,
        exceptions: Vec<PathBuf>,
        max_file_size_bytes: u64,
    ) -> Self {
        Self {
            roots: roots.into_iter(),
            exceptions,
            max_file_size_bytes,
            current: None,
            pending: None,
            skipped_exceptions: 0,
            errors: Vec::new(),
        }
    }

    /// Convenience constructor: every directory root is walked recursively,
    /// matching the agent's default background/manual scan behavior.
    pub fn recursive(roots: Vec<PathBuf>, exceptions: Vec<PathBuf>, max_file_size_bytes: u64) -> Self {
        let tagged = roots
            .into_iter()
            .map(|r| {
                let mode = if r.is_file() {
                    EnumerationMode::SingleFile
                } else {
                    EnumerationMode::DirectoryRecursive
                };
                (r, mode)
            })
            .collect();
        Self::new(tagged, exceptions, max_file_size_bytes)
    }

    fn is_excepted(&self, path: &Path) -> bool {
        self.exceptions.iter().any(|ex| path_is_under(path, ex))
    }

    fn build_context(&mut self, path: &Path) -> Option<ScanContext> {
        if self.is_excepted(path) {
            self.skipped_exceptions += 1;
            return None;
        }
        let metadata = match std::fs::metadata(path) {
            Ok(m) => m,
            Err(e) => {
                self.errors.push(format!("metadata error for {}: {e}", path.display()));
                return None;
            }
        };
        if !metadata.is_file() {
            return None;
        }
        if metadata.len() > self.max_file_size_bytes {
            return None;
        }
        let mut ctx = ScanContext::new(path.to_path_buf());
        ctx.size = metadata.len();
        ctx.last_write = metadata.modified().ok().map(chrono::DateTime::<chrono::Utc>::from);
        Some(ctx)
    }

    fn advance_to_next_root(&mut self) -> bool {
        loop {
            let Some((root, mode)) = self.roots.next() else {
                return false;
            };
            if !root.exists() {
                warn!(root = %root.display(), "enumeration root does not exist, skipping");
                continue;
            }
            match mode {
                EnumerationMode::SingleFile => {
                    if let Some(ctx) = self.build_context(&root) {
                        self.pending = Some(ctx);
                        return true;
                    }
                    continue;
                }
                EnumerationMode::DirectoryShallow => {
                    self.current = Some(
                        WalkDir::new(&root)
                            .min_depth(1)
                            .max_depth(1)
                            .follow_links(false)
                            .into_iter(),
                    );
                    return true;
                }
                EnumerationMode::DirectoryRecursive => {
                    self.current = Some(WalkDir::new(&root).follow_links(false).into_iter());
                    return true;
                }
            }
        }
    }
}

impl Iterator for FileEnumerator {
    type Item = ScanContext;

    fn next(&mut self) -> Option<ScanContext> {
        loop {
            if let Some(ctx) = self.pending.take() {
                return Some(ctx);
            }
            if self.current.is_none() {
                if !self.advance_to_next_root() {
                    return None;
                }
                continue;
            }
            let Some(walker) = self.current.as_mut() else {
                return None;
            };
            match walker.next() {
                Some(Ok(entry)) => {
                    if !entry.file_type().is_file() {
                        continue;
                    }
                    if let Some(ctx) = self.build_context(entry.path()) {
                        return Some(ctx);
                    }
                }
                Some(Err(e)) => {
                    self.errors.push(format!("walk error: {e}"));
                    continue;
                }
                None => {
                    self.current = None;
                }
            }
        }
    }
}

/// A non-erroring, best-effort count of how many files a recursive walk of
/// `roots` would visit — used to size a progress bar before a scan starts.
/// Unreadable entries are silently skipped rather than surfaced, since the
/// caller only wants an estimate, not a correctness guarantee.
pub fn estimate_count(roots: &[PathBuf]) -> u64 {
    let mut count = 0u64;
    for root in roots {
        if !root.exists() {
            continue;
        }
        if root.is_file() {
            count += 1;
            continue;
        }
        count += WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .count() as u64;
    }
    count
}
