use super::DetectionEngine;
use crate::signatures::SignatureDatabase;
use anyhow::Result;
use async_trait::async_trait;
use sentinel_core::model::{EngineResult, EngineVerdict, ScanContext};
use std::sync::Arc;

/// Exact-hash and content-pattern matching against the known-bad database.
/// Highest-confidence engine: a hit is authoritative.
pub struct SignatureEngine {
    database: Arc<SignatureDatabase>,
}

impl SignatureEngine {
    pub fn new(database: Arc<SignatureDatabase>) -> Self {
        Self { database }
    }
}

#[async_trait]
impl DetectionEngine for SignatureEngine {
    fn name(&self) -> &'static str {
        "signature"
    }

    fn weight(&self) -> f32 {
        1.0
    }

    async fn analyze(&self, ctx: &ScanContext) -> Result<EngineResult> {
        // A signature hit is always maximal score and confidence: the
        // per-record severity informs nothing here, since a known-bad hash
        // or content pattern is not a matter of degree.
        if let Some(record) = self
            .database
            .lookup_hash(ctx.sha256.as_deref(), ctx.md5.as_deref())
        {
            return Ok(EngineResult::malicious(
                self.name(),
                100,
                1.0,
                vec![format!("matched signature '{}'", record.name)],
            ));
        }
        if let Some(content) = ctx.content.as_deref() {
            if let Some(record) = self.database.scan_content(content) {
                return Ok(EngineResult::malicious(
                    self.name(),
                    100,
                    1.0,
                    vec![format!("content pattern matched '{}'", record.name)],
                ));
            }
        }
        Ok(EngineResult::clean(self.name()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signatures::EICAR_TEST_STRING;

    #[tokio::test]
    async fn detects_eicar_by_hash() {
        let db = Arc::new(SignatureDatabase::with_builtin_eicar());
        let engine = SignatureEngine::new(db);
        let mut ctx = ScanContext::new("/tmp/eicar.txt");
        let digest = sentinel_core::hashing::hash_bytes(
            EICAR_TEST_STRING.as_bytes(),
            sentinel_core::hashing::HashKind::Sha256,
        );
        ctx.sha256 = digest.sha256;
        let result = engine.analyze(&ctx).await.unwrap();
        assert_eq!(result.verdict, EngineVerdict::Malicious);
    }

    #[tokio::test]
    async fn clean_file_is_not_flagged() {
        let db = Arc::new(SignatureDatabase::with_builtin_eicar());
        let engine = SignatureEngine::new(db);
        let mut ctx = ScanContext::new("/tmp/clean.txt");
        ctx.sha256 = Some("0".repeat(64));
        let result = engine.analyze(&ctx).await.unwrap();
        assert_eq!(result.verdict, EngineVerdict::Clean);
    }
}
