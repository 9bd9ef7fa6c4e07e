//! Shared data model for the detection and enforcement pipeline.
//!
//! These types cross every component boundary in the agent (engines,
//! aggregator, cache, quarantine, action executor, IPC) so they live in
//! `sentinel-core` rather than any single crate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// A single attempt to classify one file. Immutable once populated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanContext {
    pub path: PathBuf,
    pub size: u64,
    pub sha256: Option<String>,
    pub md5: Option<String>,
    pub last_write: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub content: Option<Vec<u8>>,
}

impl ScanContext {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            size: 0,
            sha256: None,
            md5: None,
            last_write: None,
            content: None,
        }
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.path.display().to_string())
    }

    pub fn extension_lower(&self) -> Option<String> {
        self.path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
    }
}

/// The coarse action-shaped classification an engine assigns to one context.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngineVerdict {
    Clean,
    Suspicious,
    Malicious,
    Error,
    Unknown,
}

/// The output of one detection engine for one context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineResult {
    pub engine: String,
    pub score: u8,
    pub confidence: f32,
    pub verdict: EngineVerdict,
    pub reasons: Vec<String>,
}

impl EngineResult {
    pub fn clean(engine: &str) -> Self {
        Self {
            engine: engine.to_string(),
            score: 0,
            confidence: 1.0,
            verdict: EngineVerdict::Clean,
            reasons: Vec::new(),
        }
    }

    pub fn error(engine: &str, reason: impl Into<String>) -> Self {
        Self {
            engine: engine.to_string(),
            score: 0,
            confidence: 0.0,
            verdict: EngineVerdict::Error,
            reasons: vec![reason.into()],
        }
    }

    pub fn malicious(engine: &str, score: u8, confidence: f32, reasons: Vec<String>) -> Self {
        Self {
            engine: engine.to_string(),
            score,
            confidence: confidence.clamp(0.0, 1.0),
            verdict: EngineVerdict::Malicious,
            reasons,
        }
    }
}

/// The coarse, action-shaped classification assigned by the aggregator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Allow,
    NeedsReview,
    Quarantine,
    Block,
}

/// The output of the threat aggregator for one context. Deep-cloneable so the
/// scan cache can hand out independent copies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedResult {
    pub path: PathBuf,
    pub risk_score: u32,
    pub verdict: Verdict,
    pub reasons: Vec<String>,
    pub engine_results: Vec<EngineResult>,
    #[serde(with = "duration_millis")]
    pub duration: Duration,
}

impl AggregatedResult {
    pub fn malicious_count(&self) -> usize {
        self.engine_results
            .iter()
            .filter(|r| r.verdict == EngineVerdict::Malicious)
            .count()
    }

    pub fn has_high_confidence_malicious(&self, threshold: f32) -> bool {
        self.engine_results
            .iter()
            .any(|r| r.verdict == EngineVerdict::Malicious && r.confidence >= threshold)
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

/// A known-bad hash or content-pattern signature. Unique by (algorithm, hash).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha256,
    Md5,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureRecord {
    pub name: String,
    pub hash: String,
    pub algorithm: HashAlgorithm,
    pub content_pattern: Option<String>,
    pub severity: u8,
}

/// A change observed by the real-time monitor, already coalesced.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeKind {
    Created,
    Modified,
    Renamed,
    Deleted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEvent {
    pub path: PathBuf,
    pub kind: ChangeKind,
    /// Monotonic milliseconds since the monitor started; not wall-clock time.
    pub timestamp_ms: u64,
}

/// The policy applied once a context is classified `Quarantine`, `Block`, or
/// `NeedsReview`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionMode {
    AutoQuarantine,
    AutoBlock,
    AskUser,
}

/// A detection held in an "awaiting user decision" state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingThreat {
    pub event_id: String,
    pub path: PathBuf,
    pub context: ScanContext,
    pub aggregated: AggregatedResult,
    pub timestamp: DateTime<Utc>,
}

/// The DTO emitted by the action executor for every classified context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreatEvent {
    pub event_id: String,
    pub path: PathBuf,
    pub verdict: Verdict,
    pub risk_score: u32,
    pub action_taken: bool,
    pub result: String,
    pub reasons: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

/// Metadata describing one sealed quarantine entry. Lifecycle: created by
/// `quarantine_moved_file`, removed by `restore` or `delete`; never mutated
/// in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuarantineEntry {
    pub entry_id: String,
    pub original_path: PathBuf,
    pub original_file_name: String,
    pub sha256: String,
    pub ciphertext_path: PathBuf,
    pub plaintext_len: u64,
    pub quarantined_at: DateTime<Utc>,
    pub verdict: Verdict,
    pub risk_score: u32,
    pub engine_summaries: Vec<String>,
    pub reasons: Vec<String>,
    pub restore_safe: bool,
}

/// The in-memory, validated form of the §6 configuration blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    pub enable_real_time_protection: bool,
    pub malware_threshold: f32,
    pub max_file_size_mb: u64,
    pub action_mode: ActionMode,
    pub ask_min_score: u32,
    pub auto_quarantine_min_score: u32,
    pub atomic_move_max_retries: u32,
    pub atomic_move_initial_delay_ms: u64,
    pub atomic_move_max_delay_ms: u64,
    pub sha256_allowlist: Vec<String>,
    pub quarantine_path: PathBuf,
    pub watched_roots: Vec<PathBuf>,
    pub exception_paths: Vec<PathBuf>,
    pub worker_pool_size: usize,
    pub coalesce_ms: u64,
    pub block_threshold: u32,
    pub quarantine_threshold: u32,
    pub review_threshold: u32,
    pub rate_limit_per_minute: u32,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            enable_real_time_protection: true,
            malware_threshold: 0.5,
            max_file_size_mb: 256,
            action_mode: ActionMode::AskUser,
            ask_min_score: 20,
            auto_quarantine_min_score: 80,
            atomic_move_max_retries: 5,
            atomic_move_initial_delay_ms: 50,
            atomic_move_max_delay_ms: 2000,
            sha256_allowlist: Vec::new(),
            quarantine_path: PathBuf::from("quarantine"),
            watched_roots: Vec::new(),
            exception_paths: Vec::new(),
            worker_pool_size: 4,
            coalesce_ms: 150,
            block_threshold: 80,
            quarantine_threshold: 50,
            review_threshold: 20,
            rate_limit_per_minute: 50,
        }
    }
}

/// Returns true if `path` is the same path as, or a descendant of, `ancestor`.
pub fn path_is_under(path: &Path, ancestor: &Path) -> bool {
    path.ancestors().any(|p| p == ancestor)
}
