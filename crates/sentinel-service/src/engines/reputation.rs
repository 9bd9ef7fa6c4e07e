use super::DetectionEngine;
use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use sentinel_core::model::{EngineResult, ScanContext};
use std::collections::HashSet;

/// Local-only allow/deny list of hashes the operator has explicitly
/// classified. No network reputation lookup: that surface is out of scope,
/// so this engine only ever votes using the lists it's been given.
pub struct ReputationEngine {
    allowlist: RwLock<HashSet<String>>,
    denylist: RwLock<HashSet<String>>,
}

impl ReputationEngine {
    pub fn new() -> Self {
        Self {
            allowlist: RwLock::new(HashSet::new()),
            denylist: RwLock::new(HashSet::new()),
        }
    }

    pub fn with_allowlist(hashes: impl IntoIterator<Item = String>) -> Self {
        Self {
            allowlist: RwLock::new(hashes.into_iter().collect()),
            denylist: RwLock::new(HashSet::new()),
        }
    }

    pub fn set_allowlist(&self, hashes: impl IntoIterator<Item = String>) {
        *self.allowlist.write() = hashes.into_iter().collect();
    }

    pub fn set_denylist(&self, hashes: impl IntoIterator<Item = String>) {
        *self.denylist.write() = hashes.into_iter().collect();
    }
}

#[async_trait]
impl DetectionEngine for ReputationEngine {
    fn name(&self) -> &'static str {
        "reputation"
    }

    fn weight(&self) -> f32 {
        0.2
    }

    async fn analyze(&self, ctx: &ScanContext) -> Result<EngineResult> {
        let Some(h) = ctx.sha256.as_deref() else {
            return Ok(EngineResult::clean(self.name()));
        };
        if self.denylist.read().contains(h) {
            return Ok(EngineResult::malicious(
                self.name(),
                90,
                0.8,
                vec!["hash present in local reputation denylist".to_string()],
            ));
        }
        // Allowlisted or unknown hashes contribute no evidence; this engine
        // never raises risk except for an explicit denylist hit.
        Ok(EngineResult::clean(self.name()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allowlisted_hash_is_clean() {
        let engine = ReputationEngine::with_allowlist(["abc123".to_string()]);
        let mut ctx = ScanContext::new("/tmp/known.bin");
        ctx.sha256 = Some("abc123".to_string());
        let result = engine.analyze(&ctx).await.unwrap();
        assert_eq!(result.score, 0);
    }

    #[tokio::test]
    async fn denylisted_hash_is_flagged_malicious() {
        let engine = ReputationEngine::new();
        engine.set_denylist(["deadbeef".to_string()]);
        let mut ctx = ScanContext::new("/tmp/known.bin");
        ctx.sha256 = Some("deadbeef".to_string());
        let result = engine.analyze(&ctx).await.unwrap();
        assert_eq!(result.score, 90);
    }

    #[tokio::test]
    async fn unknown_hash_is_clean() {
        let engine = ReputationEngine::new();
        let mut ctx = ScanContext::new("/tmp/unknown.bin");
        ctx.sha256 = Some("0000".to_string());
        let result = engine.analyze(&ctx).await.unwrap();
        assert_eq!(result.score, 0);
    }
}
