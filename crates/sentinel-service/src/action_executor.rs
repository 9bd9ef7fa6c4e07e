//! C11 — action executor. The policy layer sitting between the aggregator's
//! verdict and what actually happens to a file: allow-list short circuit,
//! action-mode dispatch (auto-quarantine / auto-block / ask-user), and the
//! pending-threat ledger for verdicts parked awaiting a human decision.
//!
//! Mirrors the per-event-kind dispatch shape the rest of the service uses
//! for its policy layers: one `Arc<Mutex<...>>`-guarded ledger, one method
//! per inbound decision, explicit DTOs out rather than exceptions.

use crate::quarantine::{QuarantineOutcome, QuarantineStore};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use sentinel_core::model::{
    ActionMode, AggregatedResult, PendingThreat, ScanContext, ThreatEvent, Verdict,
};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::sync::Arc;
use uuid::Uuid;

pub struct ActionExecutorConfig {
    pub action_mode: ActionMode,
    pub ask_min_score: u32,
    pub auto_quarantine_min_score: u32,
}

/// What the executor decided to do, and the ticket number if it parked the
/// decision for later resolution via `resolve`.
pub struct ExecutionOutcome {
    pub event: ThreatEvent,
    pub pending: Option<PendingThreat>,
}

/// Fired when a verdict is parked awaiting a user decision. The IPC layer
/// subscribes to this to push `ThreatActionRequired` broadcasts; C11 itself
/// never talks to C12 directly.
pub enum ExecutorSignal {
    ActionRequired(PendingThreat),
    ActionApplied(ThreatEvent),
}

pub struct ActionExecutor {
    config: RwLock<ActionExecutorConfig>,
    allowlist: RwLock<HashSet<String>>,
    quarantine: Arc<QuarantineStore>,
    pending: Mutex<HashMap<String, PendingThreat>>,
    signals: tokio::sync::mpsc::UnboundedSender<ExecutorSignal>,
}

impl ActionExecutor {
    pub fn new(
        config: ActionExecutorConfig,
        allowlist: impl IntoIterator<Item = String>,
        quarantine: Arc<QuarantineStore>,
    ) -> (Self, tokio::sync::mpsc::UnboundedReceiver<ExecutorSignal>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (
            Self {
                config: RwLock::new(config),
                allowlist: RwLock::new(allowlist.into_iter().collect()),
                quarantine,
                pending: Mutex::new(HashMap::new()),
                signals: tx,
            },
            rx,
        )
    }

    pub fn update_config(&self, config: ActionExecutorConfig) {
        *self.config.write() = config;
    }

    pub fn allowlist_snapshot(&self) -> Vec<String> {
        self.allowlist.read().iter().cloned().collect()
    }

    fn add_to_allowlist(&self, hash: &str) {
        self.allowlist.write().insert(hash.to_string());
    }

    fn is_allowlisted(&self, ctx: &ScanContext) -> bool {
        ctx.sha256
            .as_deref()
            .map(|h| self.allowlist.read().contains(h))
            .unwrap_or(false)
    }

    /// Applies policy to one aggregated result. Never panics on a missing
    /// file or failed action; both surface as a `ThreatEvent` with
    /// `action_taken = false` and the failure in `result`.
    pub fn execute(&self, ctx: &ScanContext, aggregated: &AggregatedResult) -> ExecutionOutcome {
        let event_id = Uuid::new_v4().to_string();

        if self.is_allowlisted(ctx) {
            return ExecutionOutcome {
                event: ThreatEvent {
                    event_id,
                    path: ctx.path.clone(),
                    verdict: aggregated.verdict,
                    risk_score: aggregated.risk_score,
                    action_taken: true,
                    result: "Allowlist: file exempted from enforcement".to_string(),
                    reasons: aggregated.reasons.clone(),
                    timestamp: Utc::now(),
                },
                pending: None,
            };
        }

        if aggregated.verdict == Verdict::Allow {
            return ExecutionOutcome {
                event: ThreatEvent {
                    event_id,
                    path: ctx.path.clone(),
                    verdict: aggregated.verdict,
                    risk_score: aggregated.risk_score,
                    action_taken: false,
                    result: "None".to_string(),
                    reasons: aggregated.reasons.clone(),
                    timestamp: Utc::now(),
                },
                pending: None,
            };
        }

        let config = self.config.read();
        let mode = config.action_mode;
        let ask_min_score = config.ask_min_score;
        let auto_quarantine_min_score = config.auto_quarantine_min_score;
        drop(config);

        let effective_mode = match (mode, aggregated.verdict) {
            (_, Verdict::NeedsReview) => ActionMode::AskUser,
            (m, _) => m,
        };

        match effective_mode {
            ActionMode::AutoQuarantine => self.do_quarantine(event_id, ctx, aggregated),
            ActionMode::AutoBlock => self.do_delete(event_id, ctx, aggregated),
            ActionMode::AskUser => {
                let escalate = aggregated.risk_score >= auto_quarantine_min_score
                    && aggregated.has_high_confidence_malicious(0.9);
                if escalate {
                    self.do_quarantine(event_id, ctx, aggregated)
                } else if aggregated.risk_score >= ask_min_score {
                    self.park_for_review(event_id, ctx, aggregated)
                } else {
                    ExecutionOutcome {
                        event: ThreatEvent {
                            event_id,
                            path: ctx.path.clone(),
                            verdict: aggregated.verdict,
                            risk_score: aggregated.risk_score,
                            action_taken: false,
                            result: "None".to_string(),
                            reasons: aggregated.reasons.clone(),
                            timestamp: Utc::now(),
                        },
                        pending: None,
                    }
                }
            }
        }
    }

    fn do_quarantine(
        &self,
        event_id: String,
        ctx: &ScanContext,
        aggregated: &AggregatedResult,
    ) -> ExecutionOutcome {
        let (action_taken, result) = match self.quarantine.quarantine_file(&ctx.path, aggregated) {
            QuarantineOutcome::Quarantined(_) => (true, "Quarantined".to_string()),
            QuarantineOutcome::Failed { error } => (false, format!("Quarantine failed: {error}")),
        };
        let event = ThreatEvent {
            event_id,
            path: ctx.path.clone(),
            verdict: aggregated.verdict,
            risk_score: aggregated.risk_score,
            action_taken,
            result,
            reasons: aggregated.reasons.clone(),
            timestamp: Utc::now(),
        };
        let _ = self.signals.send(ExecutorSignal::ActionApplied(event.clone()));
        ExecutionOutcome {
            event,
            pending: None,
        }
    }

    fn do_delete(
        &self,
        event_id: String,
        ctx: &ScanContext,
        aggregated: &AggregatedResult,
    ) -> ExecutionOutcome {
        let (action_taken, result) = match fs::remove_file(&ctx.path) {
            Ok(()) => (true, "Deleted".to_string()),
            Err(e) => (false, format!("Delete failed: {e}")),
        };
        let event = ThreatEvent {
            event_id,
            path: ctx.path.clone(),
            verdict: aggregated.verdict,
            risk_score: aggregated.risk_score,
            action_taken,
            result,
            reasons: aggregated.reasons.clone(),
            timestamp: Utc::now(),
        };
        let _ = self.signals.send(ExecutorSignal::ActionApplied(event.clone()));
        ExecutionOutcome {
            event,
            pending: None,
        }
    }

    fn park_for_review(
        &self,
        event_id: String,
        ctx: &ScanContext,
        aggregated: &AggregatedResult,
    ) -> ExecutionOutcome {
        let ticket = PendingThreat {
            event_id: event_id.clone(),
            path: ctx.path.clone(),
            context: ctx.clone(),
            aggregated: aggregated.clone(),
            timestamp: Utc::now(),
        };
        self.pending.lock().insert(event_id.clone(), ticket.clone());
        let _ = self
            .signals
            .send(ExecutorSignal::ActionRequired(ticket.clone()));
        ExecutionOutcome {
            event: ThreatEvent {
                event_id,
                path: ctx.path.clone(),
                verdict: aggregated.verdict,
                risk_score: aggregated.risk_score,
                action_taken: false,
                result: "NeedsReview".to_string(),
                reasons: aggregated.reasons.clone(),
                timestamp: Utc::now(),
            },
            pending: Some(ticket),
        }
    }

    pub fn get_pending(&self) -> Vec<PendingThreat> {
        self.pending.lock().values().cloned().collect()
    }

    /// Resolves a previously-parked pending threat exactly once; the ticket
    /// is removed from the ledger regardless of outcome so a second call
    /// with the same id reports "not found".
    pub fn resolve(
        &self,
        event_id: &str,
        action: ResolveAction,
        add_to_exclusions: bool,
    ) -> Result<ThreatEvent, String> {
        let ticket = self
            .pending
            .lock()
            .remove(event_id)
            .ok_or_else(|| format!("pending threat {event_id} not found"))?;

        let event = match action {
            ResolveAction::Delete => {
                let (action_taken, result) = match fs::remove_file(&ticket.path) {
                    Ok(()) => (true, "Deleted".to_string()),
                    Err(e) => (false, format!("Delete failed: {e}")),
                };
                ThreatEvent {
                    event_id: event_id.to_string(),
                    path: ticket.path.clone(),
                    verdict: ticket.aggregated.verdict,
                    risk_score: ticket.aggregated.risk_score,
                    action_taken,
                    result,
                    reasons: ticket.aggregated.reasons.clone(),
                    timestamp: Utc::now(),
                }
            }
            ResolveAction::Quarantine => {
                let (action_taken, result) =
                    match self.quarantine.quarantine_file(&ticket.path, &ticket.aggregated) {
                        QuarantineOutcome::Quarantined(_) => (true, "Quarantined".to_string()),
                        QuarantineOutcome::Failed { error } => {
                            (false, format!("Quarantine failed: {error}"))
                        }
                    };
                ThreatEvent {
                    event_id: event_id.to_string(),
                    path: ticket.path.clone(),
                    verdict: ticket.aggregated.verdict,
                    risk_score: ticket.aggregated.risk_score,
                    action_taken,
                    result,
                    reasons: ticket.aggregated.reasons.clone(),
                    timestamp: Utc::now(),
                }
            }
            ResolveAction::Allow => {
                if add_to_exclusions {
                    if let Some(hash) = &ticket.context.sha256 {
                        self.add_to_allowlist(hash);
                    }
                }
                ThreatEvent {
                    event_id: event_id.to_string(),
                    path: ticket.path.clone(),
                    verdict: ticket.aggregated.verdict,
                    risk_score: ticket.aggregated.risk_score,
                    action_taken: false,
                    result: "Allowed by user decision".to_string(),
                    reasons: ticket.aggregated.reasons.clone(),
                    timestamp: Utc::now(),
                }
            }
        };

        let _ = self
            .signals
            .send(ExecutorSignal::ActionApplied(event.clone()));
        Ok(event)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveAction {
    Delete,
    Quarantine,
    Allow,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quarantine::QuarantineConfig;
    use std::fs;
    use std::path::PathBuf;
    use std::time::Duration;

    fn executor(
        mode: ActionMode,
        quarantine_root: PathBuf,
    ) -> (ActionExecutor, tokio::sync::mpsc::UnboundedReceiver<ExecutorSignal>) {
        let store = Arc::new(
            QuarantineStore::open(quarantine_root, vec![1u8; 32], QuarantineConfig::default()).unwrap(),
        );
        ActionExecutor::new(
            ActionExecutorConfig {
                action_mode: mode,
                ask_min_score: 20,
                auto_quarantine_min_score: 80,
            },
            [],
            store,
        )
    }

    fn aggregated(path: &PathBuf, verdict: Verdict, score: u32) -> AggregatedResult {
        AggregatedResult {
            path: path.clone(),
            risk_score: score,
            verdict,
            reasons: vec!["test".into()],
            engine_results: vec![],
            duration: Duration::from_millis(1),
        }
    }

    #[test]
    fn allow_verdict_takes_no_action() {
        let dir = tempfile::tempdir().unwrap();
        let (executor, _rx) = executor(ActionMode::AutoQuarantine, dir.path().join("q"));
        let ctx = ScanContext::new("/tmp/clean.txt");
        let result = aggregated(&ctx.path, Verdict::Allow, 0);
        let outcome = executor.execute(&ctx, &result);
        assert!(!outcome.event.action_taken);
        assert_eq!(outcome.event.result, "None");
    }

    #[test]
    fn auto_quarantine_mode_quarantines_block_verdicts() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("evil.exe");
        fs::write(&target, b"bad").unwrap();
        let (executor, _rx) = executor(ActionMode::AutoQuarantine, dir.path().join("q"));
        let ctx = ScanContext::new(&target);
        let result = aggregated(&ctx.path, Verdict::Block, 95);
        let outcome = executor.execute(&ctx, &result);
        assert!(outcome.event.action_taken);
        assert_eq!(outcome.event.result, "Quarantined");
        assert!(!target.exists());
    }

    #[test]
    fn allowlisted_hash_short_circuits_enforcement() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("evil.exe");
        fs::write(&target, b"bad").unwrap();
        let store = Arc::new(
            QuarantineStore::open(dir.path().join("q"), vec![1u8; 32], QuarantineConfig::default()).unwrap(),
        );
        let (executor, _rx) = ActionExecutor::new(
            ActionExecutorConfig {
                action_mode: ActionMode::AutoQuarantine,
                ask_min_score: 20,
                auto_quarantine_min_score: 80,
            },
            ["deadbeef".to_string()],
            store,
        );
        let mut ctx = ScanContext::new(&target);
        ctx.sha256 = Some("deadbeef".to_string());
        let result = aggregated(&ctx.path, Verdict::Block, 95);
        let outcome = executor.execute(&ctx, &result);
        assert!(outcome.event.action_taken);
        assert!(outcome.event.result.contains("Allowlist"));
        assert!(target.exists());
    }

    #[test]
    fn ask_user_mid_band_parks_a_pending_ticket() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("suspicious.bin");
        fs::write(&target, b"maybe").unwrap();
        let (executor, _rx) = executor(ActionMode::AskUser, dir.path().join("q"));
        let ctx = ScanContext::new(&target);
        let result = aggregated(&ctx.path, Verdict::Quarantine, 55);
        let outcome = executor.execute(&ctx, &result);
        assert!(!outcome.event.action_taken);
        assert_eq!(outcome.event.result, "NeedsReview");
        assert!(outcome.pending.is_some());
        assert_eq!(executor.get_pending().len(), 1);
        assert!(target.exists());
    }

    #[test]
    fn ask_user_escalates_to_quarantine_above_auto_threshold_with_high_confidence() {
        use sentinel_core::model::{EngineResult, EngineVerdict};
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("certain.bin");
        fs::write(&target, b"bad").unwrap();
        let (executor, _rx) = executor(ActionMode::AskUser, dir.path().join("q"));
        let ctx = ScanContext::new(&target);
        let mut result = aggregated(&ctx.path, Verdict::Block, 90);
        result.engine_results.push(EngineResult {
            engine: "signature".into(),
            score: 100,
            confidence: 0.99,
            verdict: EngineVerdict::Malicious,
            reasons: vec!["matched".into()],
        });
        let outcome = executor.execute(&ctx, &result);
        assert_eq!(outcome.event.result, "Quarantined");
        assert!(!target.exists());
    }

    #[test]
    fn resolve_unknown_event_id_reports_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (executor, _rx) = executor(ActionMode::AskUser, dir.path().join("q"));
        let err = executor
            .resolve("nonexistent", ResolveAction::Allow, false)
            .unwrap_err();
        assert!(err.contains("not found"));
    }

    #[test]
    fn resolve_allow_with_exclusions_adds_hash_to_allowlist() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("maybe.bin");
        fs::write(&target, b"maybe").unwrap();
        let (executor, _rx) = executor(ActionMode::AskUser, dir.path().join("q"));
        let mut ctx = ScanContext::new(&target);
        ctx.sha256 = Some("abc123".to_string());
        let result = aggregated(&ctx.path, Verdict::Quarantine, 55);
        let outcome = executor.execute(&ctx, &result);
        assert!(outcome.pending.is_some());

        let event_id = outcome.event.event_id.clone();
        executor
            .resolve(&event_id, ResolveAction::Allow, true)
            .unwrap();
        assert!(executor.allowlist_snapshot().contains(&"abc123".to_string()));
        assert!(executor.get_pending().is_empty());
    }
}
