//! C3 — signature database. Known-bad hashes and content patterns, loaded
//! from a signed JSON manifest and kept in memory for O(1) hash lookup.

use anyhow::{Context, Result};
use parking_lot::RwLock;
use sentinel_core::model::{HashAlgorithm, SignatureRecord};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

/// An EICAR-style test string recognized out of the box so the agent has a
/// deterministic way to prove end-to-end detection without a live feed.
pub const EICAR_TEST_STRING: &str =
    r#"X5O!P%@AP[4\PZX54(P^)7CC)7}$EICAR-STANDARD-ANTIVIRUS-TEST-FILE!$H+H*"#;

fn eicar_sha256() -> String {
    let digest = sentinel_core::hashing::hash_bytes(
        EICAR_TEST_STRING.as_bytes(),
        sentinel_core::hashing::HashKind::Sha256,
    );
    digest.sha256.expect("sha256 requested")
}

pub struct SignatureDatabase {
    by_sha256: RwLock<HashMap<String, SignatureRecord>>,
    by_md5: RwLock<HashMap<String, SignatureRecord>>,
    content_patterns: RwLock<Vec<SignatureRecord>>,
}

impl SignatureDatabase {
    pub fn empty() -> Self {
        Self {
            by_sha256: RwLock::new(HashMap::new()),
            by_md5: RwLock::new(HashMap::new()),
            content_patterns: RwLock::new(Vec::new()),
        }
    }

    /// A database seeded with the EICAR test signature, used when no
    /// external feed file is configured.
    pub fn with_builtin_eicar() -> Self {
        let db = Self::empty();
        db.insert(SignatureRecord {
            name: "EICAR-Test-File".to_string(),
            hash: eicar_sha256(),
            algorithm: HashAlgorithm::Sha256,
            content_pattern: Some(EICAR_TEST_STRING.to_string()),
            severity: 100,
        });
        db
    }

    /// Parses the `#`-prefixed-comment, `HEX_HASH|THREAT_NAME|SEVERITY_INT`
    /// line format described in the on-disk signature database contract.
    /// A malformed line is skipped with a warning rather than failing the
    /// whole load; severity is clamped into the valid engine-score range.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let db = Self::empty();
        let mut count = 0usize;
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let parts: Vec<&str> = line.splitn(3, '|').collect();
            let [hash, name, severity] = parts.as_slice() else {
                tracing::warn!(line = lineno + 1, "malformed signature line, skipping");
                continue;
            };
            let Ok(severity) = severity.trim().parse::<u16>() else {
                tracing::warn!(line = lineno + 1, "non-numeric severity, skipping");
                continue;
            };
            let algorithm = match hash.len() {
                64 => HashAlgorithm::Sha256,
                32 => HashAlgorithm::Md5,
                _ => {
                    tracing::warn!(line = lineno + 1, "hash length matches neither SHA-256 nor MD5, skipping");
                    continue;
                }
            };
            db.insert(SignatureRecord {
                name: name.trim().to_string(),
                hash: hash.trim().to_lowercase(),
                algorithm,
                content_pattern: None,
                severity: severity.min(100) as u8,
            });
            count += 1;
        }
        info!(count, path = %path.display(), "loaded signature database");
        Ok(db)
    }

    /// Loads the database from `path`; on any load failure, or when the
    /// file does not exist, falls back to a database seeded with at least
    /// the built-in EICAR entry so detection always has a deterministic
    /// positive case to exercise.
    pub fn load_or_default(path: &Path) -> Self {
        if !path.exists() {
            info!(path = %path.display(), "no signature database on disk, seeding built-in EICAR signature");
            return Self::with_builtin_eicar();
        }
        match Self::load_from_file(path) {
            Ok(db) => db,
            Err(e) => {
                tracing::warn!(error = %e, path = %path.display(), "failed to load signature database, falling back to built-in EICAR signature");
                Self::with_builtin_eicar()
            }
        }
    }

    pub fn insert(&self, record: SignatureRecord) {
        match record.algorithm {
            HashAlgorithm::Sha256 => {
                self.by_sha256.write().insert(record.hash.clone(), record.clone());
            }
            HashAlgorithm::Md5 => {
                self.by_md5.write().insert(record.hash.clone(), record.clone());
            }
        }
        if record.content_pattern.is_some() {
            self.content_patterns.write().push(record);
        }
    }

    pub fn lookup_hash(&self, sha256: Option<&str>, md5: Option<&str>) -> Option<SignatureRecord> {
        if let Some(h) = sha256 {
            if let Some(rec) = self.by_sha256.read().get(h) {
                return Some(rec.clone());
            }
        }
        if let Some(h) = md5 {
            if let Some(rec) = self.by_md5.read().get(h) {
                return Some(rec.clone());
            }
        }
        None
    }

    /// Scans raw bytes for any known content pattern (substring match). Used
    /// when a file's hash is clean but it embeds a known-bad fragment.
    pub fn scan_content(&self, data: &[u8]) -> Option<SignatureRecord> {
        let text = String::from_utf8_lossy(data);
        self.content_patterns
            .read()
            .iter()
            .find(|rec| {
                rec.content_pattern
                    .as_deref()
                    .map(|pat| text.contains(pat))
                    .unwrap_or(false)
            })
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.by_sha256.read().len() + self.by_md5.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eicar_signature_matches_by_hash_and_content() {
        let db = SignatureDatabase::with_builtin_eicar();
        let digest = sentinel_core::hashing::hash_bytes(
            EICAR_TEST_STRING.as_bytes(),
            sentinel_core::hashing::HashKind::Sha256,
        );
        let found = db.lookup_hash(digest.sha256.as_deref(), None);
        assert!(found.is_some());

        let by_content = db.scan_content(EICAR_TEST_STRING.as_bytes());
        assert!(by_content.is_some());
    }

    #[test]
    fn unknown_hash_does_not_match() {
        let db = SignatureDatabase::with_builtin_eicar();
        assert!(db.lookup_hash(Some("deadbeef"), None).is_none());
    }

    #[test]
    fn loads_pipe_delimited_file_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("signatures.db");
        std::fs::write(
            &path,
            "# comment line\n\
             aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa|Test.Generic|75\n\
             not-a-valid-line\n",
        )
        .unwrap();
        let db = SignatureDatabase::load_from_file(&path).unwrap();
        let found = db
            .lookup_hash(
                Some("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"),
                None,
            )
            .unwrap();
        assert_eq!(found.name, "Test.Generic");
        assert_eq!(found.severity, 75);
    }

    #[test]
    fn load_or_default_seeds_eicar_when_file_absent() {
        let dir = tempfile::tempdir().unwrap();
        let db = SignatureDatabase::load_or_default(&dir.path().join("missing.db"));
        assert!(db.lookup_hash(Some(&eicar_sha256()), None).is_some());
    }
}
