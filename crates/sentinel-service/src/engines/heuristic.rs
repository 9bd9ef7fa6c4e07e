use super::DetectionEngine;
use anyhow::Result;
use async_trait::async_trait;
use sentinel_core::model::{EngineResult, ScanContext};

/// File extensions long associated with dropped malware or webshells.
const SUSPICIOUS_EXTENSIONS: &[&str] = &[
    "php", "sh", "bash", "exe", "bat", "cmd", "ps1", "vbs", "js", "py", "pl", "rb", "cgi", "asp",
    "aspx", "jsp", "war", "dll", "so", "dylib", "elf", "bin", "msi", "scr", "com", "pif", "hta",
    "wsf", "wsh", "reg", "inf", "lnk", "jar", "class", "dex", "apk",
];

/// Filename fragments that read as self-incriminating regardless of extension.
const SUSPICIOUS_NAMES: &[&str] = &[
    "backdoor", "shell", "payload", "exploit", "rootkit", "keylogger", "malware", "trojan",
    "reverse", "webshell", "c99", "r57",
];

const HIGH_ENTROPY_THRESHOLD: f64 = 7.5;
const ENTROPY_SAMPLE_BYTES: usize = 65536;

fn shannon_entropy(data: &[u8]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    let mut counts = [0u64; 256];
    for &byte in data {
        counts[byte as usize] += 1;
    }
    let len = data.len() as f64;
    let mut entropy = 0.0;
    for &count in &counts {
        if count > 0 {
            let p = count as f64 / len;
            entropy -= p * p.log2();
        }
    }
    entropy
}

/// Heuristic, content-and-metadata-pattern matching. Cannot be authoritative
/// the way a signature hit is, so its weight is lower and its confidence
/// scales with how many independent signals fired.
pub struct HeuristicEngine;

impl HeuristicEngine {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl DetectionEngine for HeuristicEngine {
    fn name(&self) -> &'static str {
        "heuristic"
    }

    fn weight(&self) -> f32 {
        0.6
    }

    async fn analyze(&self, ctx: &ScanContext) -> Result<EngineResult> {
        let mut reasons = Vec::new();
        let mut signals = 0u32;

        if let Some(ext) = ctx.extension_lower() {
            if SUSPICIOUS_EXTENSIONS.contains(&ext.as_str()) {
                reasons.push(format!("suspicious extension: .{ext}"));
                signals += 1;
            }
        }

        let name_lower = ctx.file_name().to_lowercase();
        for &pattern in SUSPICIOUS_NAMES {
            if name_lower.contains(pattern) {
                reasons.push(format!("suspicious filename pattern: {pattern}"));
                signals += 1;
                break;
            }
        }

        if let Some(content) = ctx.content.as_deref() {
            let sample_len = content.len().min(ENTROPY_SAMPLE_BYTES);
            let entropy = shannon_entropy(&content[..sample_len]);
            if entropy > HIGH_ENTROPY_THRESHOLD && content.len() > 1024 {
                reasons.push(format!("high entropy content: {entropy:.2}"));
                signals += 1;
            }
        }

        if signals == 0 {
            return Ok(EngineResult::clean(self.name()));
        }

        let score = (signals * 25).min(100) as u8;
        let confidence = (0.4 + 0.2 * signals as f32).min(0.9);
        Ok(EngineResult::malicious(self.name(), score, confidence, reasons))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn flags_suspicious_extension() {
        let engine = HeuristicEngine::new();
        let mut ctx = ScanContext::new("/tmp/payload.exe");
        ctx.content = Some(b"plain text content".to_vec());
        let result = engine.analyze(&ctx).await.unwrap();
        assert!(result.score > 0);
    }

    #[tokio::test]
    async fn clean_name_and_content_is_allowed() {
        let engine = HeuristicEngine::new();
        let mut ctx = ScanContext::new("/tmp/report.txt");
        ctx.content = Some(b"quarterly summary".to_vec());
        let result = engine.analyze(&ctx).await.unwrap();
        assert_eq!(result.score, 0);
    }

    #[test]
    fn entropy_of_uniform_data_is_high() {
        let data: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
        assert!(shannon_entropy(&data) > 7.9);
    }
}
