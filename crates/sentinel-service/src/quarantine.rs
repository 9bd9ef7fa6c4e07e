//! C10 — quarantine store. Atomically moves a malicious file out of place,
//! seals it with per-entry AEAD encryption under the vault's device key,
//! and records a JSON-lines metadata journal so restores are possible
//! without trusting the (encrypted, no longer executable) blob's name.
//!
//! Layout under the quarantine root:
//!   pending/   staging area for a move in flight, cleared on restart
//!   items/     one ciphertext blob per entry, named by entry id
//!   journal.jsonl  append-only metadata for every entry ever created
//!
//! The isolation guarantee lives entirely in `try_atomic_move`: a bare
//! filesystem rename of the live file into `pending/`, retried with
//! doubling backoff. Once that rename succeeds the file no longer resolves
//! at its original path — nothing downstream (encryption, journaling) can
//! weaken that guarantee, so sealing is a separate, unretried step.

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use sentinel_core::hashing::{hash_file_sync, HashKind};
use sentinel_core::model::{path_is_under, AggregatedResult, QuarantineEntry};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

pub struct QuarantineConfig {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for QuarantineConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay_ms: 50,
            max_delay_ms: 2000,
        }
    }
}

#[derive(Debug)]
pub enum QuarantineOutcome {
    Quarantined(QuarantineEntry),
    Failed { error: String },
}

/// Result of the isolation step alone. `moved_path` is the file's new
/// location inside `pending/`, ready for `quarantine_moved_file`.
#[derive(Debug, Clone)]
pub struct AtomicMoveResult {
    pub success: bool,
    pub moved_path: Option<PathBuf>,
}

pub struct QuarantineStore {
    root: PathBuf,
    key: Vec<u8>,
    config: QuarantineConfig,
    journal_lock: Mutex<()>,
}

impl QuarantineStore {
    pub fn open(root: PathBuf, key: Vec<u8>, config: QuarantineConfig) -> Result<Self> {
        fs::create_dir_all(root.join("pending"))?;
        fs::create_dir_all(root.join("items"))?;
        let store = Self {
            root,
            key,
            config,
            journal_lock: Mutex::new(()),
        };
        store.cleanup_pending();
        Ok(store)
    }

    fn journal_path(&self) -> PathBuf {
        self.root.join("journal.jsonl")
    }

    fn items_dir(&self) -> PathBuf {
        self.root.join("items")
    }

    fn pending_dir(&self) -> PathBuf {
        self.root.join("pending")
    }

    /// Removes any staging files left behind by a crash mid-move.
    fn cleanup_pending(&self) {
        if let Ok(entries) = fs::read_dir(self.pending_dir()) {
            for entry in entries.flatten() {
                warn!(path = %entry.path().display(), "removing orphaned quarantine staging file");
                let _ = fs::remove_file(entry.path());
            }
        }
    }

    /// Moves `src` into `pending/` using a same-volume rename, retried with
    /// doubling backoff. This is the isolation guarantee: once it returns
    /// `success = true`, `src` no longer resolves and the artifact cannot
    /// be executed from its original location, regardless of whether
    /// sealing later succeeds.
    pub fn try_atomic_move(&self, src: &Path) -> AtomicMoveResult {
        if !src.exists() {
            return AtomicMoveResult {
                success: false,
                moved_path: None,
            };
        }

        let entry_id = Uuid::new_v4().to_string();
        let dest = self.pending_dir().join(&entry_id);

        let mut delay = Duration::from_millis(self.config.initial_delay_ms);
        let max_delay = Duration::from_millis(self.config.max_delay_ms);

        for attempt in 0..self.config.max_retries {
            match fs::rename(src, &dest) {
                Ok(()) => {
                    return AtomicMoveResult {
                        success: true,
                        moved_path: Some(dest),
                    }
                }
                Err(e) => {
                    warn!(
                        attempt = attempt + 1,
                        error = %e,
                        path = %src.display(),
                        "atomic move attempt failed"
                    );
                    if attempt + 1 < self.config.max_retries {
                        std::thread::sleep(delay);
                        delay = (delay * 2).min(max_delay);
                    }
                }
            }
        }

        AtomicMoveResult {
            success: false,
            moved_path: None,
        }
    }

    /// Seals a file already isolated in `pending/` (by `try_atomic_move`)
    /// into an encrypted blob under `items/`, and records its metadata.
    /// `original_path` is the path the file lived at before isolation;
    /// it no longer exists on disk. On any failure after encryption, the
    /// partial ciphertext is unlinked and `None` is returned.
    pub fn quarantine_moved_file(
        &self,
        pending_path: &Path,
        original_path: &Path,
        aggregated: Option<&AggregatedResult>,
    ) -> Option<QuarantineEntry> {
        let original_file_name = original_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "unknown".to_string());

        let digest = match hash_file_sync(pending_path, HashKind::Sha256) {
            Ok(d) => d,
            Err(e) => {
                error!(error = %e, "hashing pending quarantine file failed");
                return None;
            }
        };
        let sha256 = digest.sha256.unwrap_or_default();

        let entry_id = pending_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let ciphertext_path = self.items_dir().join(format!("{entry_id}.bin"));

        if let Err(e) = self.seal(pending_path, &ciphertext_path) {
            error!(error = %e, "sealing quarantine blob failed");
            let _ = fs::remove_file(&ciphertext_path);
            return None;
        }

        if let Err(e) = fs::remove_file(pending_path) {
            warn!(path = %pending_path.display(), error = %e, "failed to remove pending file after sealing");
        }

        let (verdict, risk_score, engine_summaries, reasons) = match aggregated {
            Some(a) => (
                a.verdict,
                a.risk_score,
                a.engine_results
                    .iter()
                    .map(|r| format!("{}: {:?} ({})", r.engine, r.verdict, r.score))
                    .collect(),
                a.reasons.clone(),
            ),
            None => (
                sentinel_core::model::Verdict::Quarantine,
                0,
                Vec::new(),
                Vec::new(),
            ),
        };

        let entry = QuarantineEntry {
            entry_id: entry_id.clone(),
            original_path: original_path.to_path_buf(),
            original_file_name,
            sha256,
            ciphertext_path,
            plaintext_len: digest.size,
            quarantined_at: Utc::now(),
            verdict,
            risk_score,
            engine_summaries,
            reasons,
            restore_safe: true,
        };

        if let Err(e) = self.append_journal(&entry) {
            error!(entry_id = %entry_id, error = %e, "failed to write quarantine journal entry");
        }

        info!(path = %entry.original_path.display(), entry_id = %entry_id, "file quarantined");
        Some(entry)
    }

    /// Single-step convenience: isolate then seal. Equivalent to calling
    /// `try_atomic_move` followed by `quarantine_moved_file`.
    pub fn quarantine_file(&self, src: &Path, aggregated: &AggregatedResult) -> QuarantineOutcome {
        let moved = self.try_atomic_move(src);
        if !moved.success {
            return QuarantineOutcome::Failed {
                error: format!(
                    "exhausted {} retries moving {} into quarantine",
                    self.config.max_retries,
                    src.display()
                ),
            };
        }
        let pending_path = moved.moved_path.expect("success implies moved_path");
        match self.quarantine_moved_file(&pending_path, src, Some(aggregated)) {
            Some(entry) => QuarantineOutcome::Quarantined(entry),
            None => QuarantineOutcome::Failed {
                error: "sealing quarantined file failed".to_string(),
            },
        }
    }

    fn seal(&self, source: &Path, ciphertext_path: &Path) -> Result<()> {
        let mut plaintext = Vec::new();
        File::open(source)
            .with_context(|| format!("open {}", source.display()))?
            .read_to_end(&mut plaintext)?;
        let nonce = sentinel_core::crypto::generate_nonce();
        let ciphertext = sentinel_core::crypto::encrypt(&self.key, &nonce, &plaintext)
            .map_err(|e| anyhow!("encrypt quarantine blob: {e}"))?;

        let mut file = File::create(ciphertext_path)
            .with_context(|| format!("create {}", ciphertext_path.display()))?;
        file.write_all(&nonce)?;
        file.write_all(&ciphertext)?;
        file.sync_all()?;
        Ok(())
    }

    fn append_journal(&self, entry: &QuarantineEntry) -> Result<()> {
        let _guard = self.journal_lock.lock();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.journal_path())?;
        writeln!(file, "{}", serde_json::to_string(entry)?)?;
        file.flush()?;
        Ok(())
    }

    pub fn list_entries(&self) -> Result<Vec<QuarantineEntry>> {
        let path = self.journal_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(File::open(path)?);
        let mut by_id: HashMap<String, QuarantineEntry> = HashMap::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: QuarantineEntry = serde_json::from_str(&line)?;
            by_id.insert(entry.entry_id.clone(), entry);
        }
        Ok(by_id.into_values().collect())
    }

    /// Authoritative count of live entries (tombstoned/deleted entries are
    /// excluded since their journal record carries `restore_safe = false`
    /// and no surviving ciphertext).
    pub fn count(&self) -> usize {
        self.list_entries()
            .map(|entries| entries.iter().filter(|e| e.ciphertext_path.exists()).count())
            .unwrap_or(0)
    }

    fn find_entry(&self, entry_id: &str) -> Result<QuarantineEntry> {
        self.list_entries()?
            .into_iter()
            .find(|e| e.entry_id == entry_id)
            .ok_or_else(|| anyhow!("no quarantine entry with id {entry_id}"))
    }

    /// Restores a quarantined file to its original path (or `destination`
    /// if given). Rejects the restore if the destination is judged unsafe
    /// (under a temp-directory deny list) or if the decrypted content's
    /// hash no longer matches the journaled hash. Leaves the entry sealed
    /// on any failure; on success the blob is removed and a tombstone is
    /// appended to the journal, the same way `delete` retires an entry, so
    /// a restored file stops appearing in `list_entries`.
    pub fn restore(&self, entry_id: &str, destination: Option<&Path>) -> Result<PathBuf> {
        let entry = self.find_entry(entry_id)?;
        if !entry.restore_safe {
            bail!("entry {entry_id} is marked unsafe to restore");
        }
        let target = destination
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| entry.original_path.clone());
        reject_unsafe_destination(&target)?;

        let plaintext = self.decrypt_entry(&entry)?;
        let digest = sentinel_core::hashing::hash_bytes(&plaintext, HashKind::Sha256);
        if digest.sha256.as_deref() != Some(entry.sha256.as_str()) {
            bail!("integrity check failed: decrypted content does not match journaled hash");
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let staging = target
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(format!(".sentinel_restore_{entry_id}"));
        {
            let mut file = File::create(&staging)?;
            file.write_all(&plaintext)?;
            file.sync_all()?;
        }
        fs::rename(&staging, &target)?;
        self.delete_blob_only(&entry)?;
        let mut tombstone = entry;
        tombstone.restore_safe = false;
        self.append_journal(&tombstone)?;
        info!(entry_id, path = %target.display(), "file restored from quarantine");
        Ok(target)
    }

    /// Deletes a quarantined entry permanently: removes the ciphertext blob
    /// and marks the journal entry deleted by appending a tombstone.
    /// Idempotent: a missing id is not an error here, but callers should
    /// check `list_entries`/`count` first to report it as a no-op.
    pub fn delete(&self, entry_id: &str) -> Result<bool> {
        let Ok(mut entry) = self.find_entry(entry_id) else {
            return Ok(false);
        };
        self.delete_blob_only(&entry)?;
        entry.restore_safe = false;
        self.append_journal(&entry)?;
        Ok(true)
    }

    fn delete_blob_only(&self, entry: &QuarantineEntry) -> Result<()> {
        if entry.ciphertext_path.exists() {
            fs::remove_file(&entry.ciphertext_path)?;
        }
        Ok(())
    }

    fn decrypt_entry(&self, entry: &QuarantineEntry) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        File::open(&entry.ciphertext_path)
            .with_context(|| format!("open {}", entry.ciphertext_path.display()))?
            .read_to_end(&mut data)?;
        if data.len() < 24 {
            bail!("quarantine blob too short to contain a nonce");
        }
        let (nonce_bytes, ciphertext) = data.split_at(24);
        let nonce: [u8; 24] = nonce_bytes.try_into().expect("checked length above");
        sentinel_core::crypto::decrypt(&self.key, &nonce, ciphertext)
            .map_err(|e| anyhow!("decrypt quarantine blob: {e}"))
    }
}

fn reject_unsafe_destination(path: &Path) -> Result<()> {
    let mut deny_list = vec![std::env::temp_dir(), PathBuf::from("/tmp"), PathBuf::from("/var/tmp")];
    for var in ["TEMP", "TMP"] {
        if let Ok(v) = std::env::var(var) {
            deny_list.push(PathBuf::from(v));
        }
    }
    for deny in &deny_list {
        if path_is_under(path, deny) {
            bail!(
                "refusing to restore into {}: path is under a temp-directory deny list entry {}",
                path.display(),
                deny.display()
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentinel_core::model::Verdict;
    use std::time::Duration as StdDuration;

    fn sample_aggregated(path: &Path) -> AggregatedResult {
        AggregatedResult {
            path: path.to_path_buf(),
            risk_score: 90,
            verdict: Verdict::Block,
            reasons: vec!["test signature".into()],
            engine_results: vec![],
            duration: StdDuration::from_millis(1),
        }
    }

    #[test]
    fn quarantine_then_restore_round_trips_content() {
        // The quarantine store itself is free to live under the system temp
        // dir, but the *restore destination* must not be: `reject_unsafe_destination`
        // denies anything under `std::env::temp_dir()`, so the original file
        // (and thus `entry.original_path`, which a `None` destination restores
        // to) has to be rooted outside it. `tempdir_in(".")` creates a
        // scratch directory under the crate's own build tree instead.
        let dir = tempfile::tempdir().unwrap();
        let quarantine_root = dir.path().join("quarantine");
        let store = QuarantineStore::open(quarantine_root, vec![7u8; 32], QuarantineConfig::default()).unwrap();

        let target_dir = tempfile::tempdir_in(".").unwrap();
        let target = target_dir.path().join("evil.exe");
        fs::write(&target, b"malicious payload").unwrap();

        let outcome = store.quarantine_file(&target, &sample_aggregated(&target));
        let entry = match outcome {
            QuarantineOutcome::Quarantined(e) => e,
            QuarantineOutcome::Failed { error } => panic!("quarantine failed: {error}"),
        };
        assert!(!target.exists());
        assert!(entry.ciphertext_path.exists());

        let restored_path = store.restore(&entry.entry_id, None).unwrap();
        assert_eq!(restored_path, target);
        assert_eq!(fs::read(&target).unwrap(), b"malicious payload");
    }

    #[test]
    fn try_atomic_move_fails_for_missing_source() {
        let dir = tempfile::tempdir().unwrap();
        let store = QuarantineStore::open(dir.path().join("q"), vec![1u8; 32], QuarantineConfig::default()).unwrap();
        let result = store.try_atomic_move(&dir.path().join("does-not-exist"));
        assert!(!result.success);
        assert!(result.moved_path.is_none());
    }

    #[test]
    fn try_atomic_move_then_seal_composes_like_quarantine_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = QuarantineStore::open(dir.path().join("q"), vec![2u8; 32], QuarantineConfig::default()).unwrap();
        let target = dir.path().join("dropped.bin");
        fs::write(&target, b"payload bytes").unwrap();

        let moved = store.try_atomic_move(&target);
        assert!(moved.success);
        assert!(!target.exists());
        let pending_path = moved.moved_path.unwrap();
        assert!(pending_path.exists());

        let entry = store
            .quarantine_moved_file(&pending_path, &target, None)
            .expect("sealing should succeed");
        assert!(!pending_path.exists());
        assert!(entry.ciphertext_path.exists());
    }

    #[test]
    fn delete_removes_blob_and_marks_unsafe() {
        let dir = tempfile::tempdir().unwrap();
        let quarantine_root = dir.path().join("quarantine");
        let store = QuarantineStore::open(quarantine_root, vec![3u8; 32], QuarantineConfig::default()).unwrap();

        let target = dir.path().join("bad.bin");
        fs::write(&target, b"payload").unwrap();
        let entry = match store.quarantine_file(&target, &sample_aggregated(&target)) {
            QuarantineOutcome::Quarantined(e) => e,
            QuarantineOutcome::Failed { error } => panic!("{error}"),
        };

        assert!(store.delete(&entry.entry_id).unwrap());
        assert!(!entry.ciphertext_path.exists());
        assert!(store.restore(&entry.entry_id, None).is_err());
    }

    #[test]
    fn delete_on_missing_entry_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let store = QuarantineStore::open(dir.path().join("q"), vec![4u8; 32], QuarantineConfig::default()).unwrap();
        assert!(!store.delete("does-not-exist").unwrap());
    }

    #[test]
    fn restore_rejects_temp_directory_destination() {
        let dir = tempfile::tempdir().unwrap();
        let quarantine_root = dir.path().join("quarantine");
        let store = QuarantineStore::open(quarantine_root, vec![9u8; 32], QuarantineConfig::default()).unwrap();

        let target_dir = dir.path().join("target");
        fs::create_dir_all(&target_dir).unwrap();
        let target = target_dir.join("evil.exe");
        fs::write(&target, b"payload").unwrap();
        let entry = match store.quarantine_file(&target, &sample_aggregated(&target)) {
            QuarantineOutcome::Quarantined(e) => e,
            QuarantineOutcome::Failed { error } => panic!("{error}"),
        };

        let tmp_target = std::env::temp_dir().join("sentinel-test-escape.bin");
        assert!(store.restore(&entry.entry_id, Some(&tmp_target)).is_err());
    }

    #[test]
    fn count_reflects_live_entries_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = QuarantineStore::open(dir.path().join("q"), vec![5u8; 32], QuarantineConfig::default()).unwrap();
        let target = dir.path().join("a.bin");
        fs::write(&target, b"x").unwrap();
        let entry = match store.quarantine_file(&target, &sample_aggregated(&target)) {
            QuarantineOutcome::Quarantined(e) => e,
            QuarantineOutcome::Failed { error } => panic!("{error}"),
        };
        assert_eq!(store.count(), 1);
        store.delete(&entry.entry_id).unwrap();
        assert_eq!(store.count(), 0);
    }
}
