use super::DetectionEngine;
use anyhow::Result;
use async_trait::async_trait;
use sentinel_core::model::{EngineResult, ScanContext};

/// A small, fixed-weight linear model over cheap structural features. Not a
/// trained classifier — a deterministic stand-in with the same interface a
/// real model would have, so swapping one in later doesn't touch the
/// aggregator.
pub struct MlEngine;

impl MlEngine {
    pub fn new() -> Self {
        Self
    }

    fn extract_features(ctx: &ScanContext) -> [f32; 4] {
        let content = ctx.content.as_deref().unwrap_or(&[]);
        let size_feature = (ctx.size as f32 / (10.0 * 1024.0 * 1024.0)).min(1.0);
        let double_extension = has_double_extension(ctx);
        let packed_header = looks_packed(content);
        let null_heavy = null_byte_ratio(content);
        [
            size_feature,
            if double_extension { 1.0 } else { 0.0 },
            if packed_header { 1.0 } else { 0.0 },
            null_heavy,
        ]
    }
}

fn has_double_extension(ctx: &ScanContext) -> bool {
    let name = ctx.file_name();
    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() < 3 {
        return false;
    }
    let suspicious_first = ["pdf", "doc", "jpg", "png", "txt"];
    suspicious_first.contains(&parts[parts.len() - 2].to_lowercase().as_str())
}

fn looks_packed(content: &[u8]) -> bool {
    content.len() >= 2 && (content.starts_with(b"MZ") || content.starts_with(b"\x7fELF"))
}

fn null_byte_ratio(content: &[u8]) -> f32 {
    if content.is_empty() {
        return 0.0;
    }
    let sample = &content[..content.len().min(8192)];
    let nulls = sample.iter().filter(|&&b| b == 0).count();
    nulls as f32 / sample.len() as f32
}

#[async_trait]
impl DetectionEngine for MlEngine {
    fn name(&self) -> &'static str {
        "ml"
    }

    fn weight(&self) -> f32 {
        0.5
    }

    async fn analyze(&self, ctx: &ScanContext) -> Result<EngineResult> {
        let weights = [0.1, 0.35, 0.35, 0.2];
        let features = Self::extract_features(ctx);
        let raw: f32 = features.iter().zip(weights.iter()).map(|(f, w)| f * w).sum();

        if raw < 0.2 {
            return Ok(EngineResult::clean(self.name()));
        }

        let mut reasons = Vec::new();
        if features[1] > 0.0 {
            reasons.push("double extension pattern".to_string());
        }
        if features[2] > 0.0 {
            reasons.push("executable header on a non-executable-looking path".to_string());
        }
        if features[3] > 0.3 {
            reasons.push("unusually high null-byte density".to_string());
        }
        if reasons.is_empty() {
            reasons.push("composite structural score above threshold".to_string());
        }

        let score = (raw * 100.0).clamp(0.0, 100.0) as u8;
        Ok(EngineResult::malicious(self.name(), score, raw.min(0.85), reasons))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn clean_text_file_scores_low() {
        let engine = MlEngine::new();
        let mut ctx = ScanContext::new("/tmp/readme.txt");
        ctx.size = 120;
        ctx.content = Some(b"hello world".to_vec());
        let result = engine.analyze(&ctx).await.unwrap();
        assert_eq!(result.score, 0);
    }

    #[tokio::test]
    async fn double_extension_with_pe_header_scores_high() {
        let engine = MlEngine::new();
        let mut ctx = ScanContext::new("/tmp/invoice.pdf.exe");
        ctx.content = Some(b"MZ\x90\x00".to_vec());
        let result = engine.analyze(&ctx).await.unwrap();
        assert!(result.score > 0);
    }
}
