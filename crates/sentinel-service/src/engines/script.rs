use super::DetectionEngine;
use anyhow::Result;
use async_trait::async_trait;
use sentinel_core::model::{EngineResult, ScanContext};

/// Extensions this screener operates on; every other path yields `Clean`
/// immediately without inspecting content.
const SCRIPT_EXTENSIONS: &[&str] = &["ps1", "vbs", "js", "bat", "cmd"];

/// Files above this size are not content-scanned; legitimate script-adjacent
/// bundles (minified JS, generated vbs) routinely exceed what a screener
/// should pay to scan.
const SCRIPT_SIZE_CEILING_BYTES: u64 = 5 * 1024 * 1024;

/// Dangerous call patterns common to PHP/shell webshells, checked as raw
/// substrings against a bounded content sample.
const DANGEROUS_CALLS: &[&str] = &[
    "eval(",
    "base64_decode",
    "system(",
    "exec(",
    "passthru(",
    "shell_exec",
];

const SAMPLE_BYTES: usize = 4096;

/// Inspects script-like content for magic bytes and known dangerous call
/// patterns. Only operates on the script-extension allowlist; every other
/// path (including compiled binaries the heuristic engine already covers)
/// is out of scope for this engine.
pub struct ScriptEngine;

impl ScriptEngine {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl DetectionEngine for ScriptEngine {
    fn name(&self) -> &'static str {
        "script"
    }

    fn weight(&self) -> f32 {
        0.5
    }

    async fn analyze(&self, ctx: &ScanContext) -> Result<EngineResult> {
        let Some(ext) = ctx.extension_lower() else {
            return Ok(EngineResult::clean(self.name()));
        };
        if !SCRIPT_EXTENSIONS.contains(&ext.as_str()) {
            return Ok(EngineResult::clean(self.name()));
        }
        if ctx.size > SCRIPT_SIZE_CEILING_BYTES {
            let mut result = EngineResult::clean(self.name());
            result.reasons.push(format!(
                "skipped: file exceeds script size-limit of {SCRIPT_SIZE_CEILING_BYTES} bytes"
            ));
            return Ok(result);
        }

        let Some(content) = ctx.content.as_deref() else {
            return Ok(EngineResult::clean(self.name()));
        };
        if content.len() < 2 {
            return Ok(EngineResult::clean(self.name()));
        }

        let mut reasons = Vec::new();

        if content.starts_with(b"#!") {
            reasons.push("shebang: executable script".to_string());
        }
        if content.starts_with(b"<?php") || content.starts_with(b"<?=") {
            reasons.push("PHP opening tag detected".to_string());
        }
        if content.starts_with(b"\x7fELF") {
            reasons.push("ELF binary magic bytes".to_string());
        }
        if content.starts_with(b"MZ") {
            reasons.push("Windows PE magic bytes".to_string());
        }

        let sample_len = content.len().min(SAMPLE_BYTES);
        let text = String::from_utf8_lossy(&content[..sample_len]);
        let mut dangerous_hits = 0u32;
        for &call in DANGEROUS_CALLS {
            if text.contains(call) {
                dangerous_hits += 1;
            }
        }
        if dangerous_hits > 0 {
            reasons.push(format!("{dangerous_hits} dangerous call pattern(s) found"));
        }

        if reasons.is_empty() {
            return Ok(EngineResult::clean(self.name()));
        }

        let score = ((reasons.len() as u8) * 20 + (dangerous_hits as u8) * 15).min(100);
        let confidence = if dangerous_hits >= 2 { 0.8 } else { 0.5 };
        Ok(EngineResult::malicious(self.name(), score, confidence, reasons))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn flags_webshell_pattern_in_script_extension() {
        let engine = ScriptEngine::new();
        let mut ctx = ScanContext::new("/tmp/run.js");
        ctx.content = Some(b"eval(base64_decode('...'));".to_vec());
        ctx.size = ctx.content.as_ref().unwrap().len() as u64;
        let result = engine.analyze(&ctx).await.unwrap();
        assert!(result.score > 0);
    }

    #[tokio::test]
    async fn non_script_extension_is_skipped_entirely() {
        let engine = ScriptEngine::new();
        let mut ctx = ScanContext::new("/tmp/index.php");
        ctx.content = Some(b"<?php eval(base64_decode($_POST['c'])); ?>".to_vec());
        ctx.size = ctx.content.as_ref().unwrap().len() as u64;
        let result = engine.analyze(&ctx).await.unwrap();
        assert_eq!(result.score, 0);
        assert!(result.reasons.is_empty());
    }

    #[tokio::test]
    async fn plain_script_is_clean() {
        let engine = ScriptEngine::new();
        let mut ctx = ScanContext::new("/tmp/notes.ps1");
        ctx.content = Some(b"Get-Process | Select-Object Name".to_vec());
        ctx.size = ctx.content.as_ref().unwrap().len() as u64;
        let result = engine.analyze(&ctx).await.unwrap();
        assert_eq!(result.score, 0);
    }

    #[tokio::test]
    async fn oversized_script_is_skipped_with_size_limit_reason() {
        let engine = ScriptEngine::new();
        let mut ctx = ScanContext::new("/tmp/huge.bat");
        ctx.size = SCRIPT_SIZE_CEILING_BYTES + 1;
        ctx.content = Some(b"eval(".to_vec());
        let result = engine.analyze(&ctx).await.unwrap();
        assert_eq!(result.score, 0);
        assert!(result.reasons[0].contains("size-limit"));
    }
}
