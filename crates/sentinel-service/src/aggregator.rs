//! C6 — threat aggregator. Combines independent engine votes into one
//! risk score and verdict.
//!
//! Each engine's contribution is `score * weight * max(confidence, 0.25)`;
//! the floor on confidence keeps a low-confidence engine from being
//! silently zeroed out, while still letting high-confidence engines
//! dominate. The final score is the contribution sum divided by the
//! weight sum, clamped to [0, 100]. An engine with nothing to say
//! (`Clean`, score 0 by invariant) contributes zero to the numerator by
//! construction; it is also excluded from the denominator so that running
//! more clean engines never dilutes a genuine hit from the rest.

use sentinel_core::model::{AggregatedResult, EngineResult, EngineVerdict, Verdict};
use std::path::PathBuf;
use std::time::Duration;

const CONFIDENCE_FLOOR: f32 = 0.25;
const BLOCK_CONFIDENCE_OVERRIDE: f32 = 0.9;

pub struct AggregatorConfig {
    pub block_threshold: u32,
    pub quarantine_threshold: u32,
    pub review_threshold: u32,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            block_threshold: 80,
            quarantine_threshold: 50,
            review_threshold: 20,
        }
    }
}

pub struct ThreatAggregator {
    config: AggregatorConfig,
    engine_weights: Vec<(&'static str, f32)>,
}

impl ThreatAggregator {
    pub fn new(config: AggregatorConfig, engine_weights: Vec<(&'static str, f32)>) -> Self {
        Self {
            config,
            engine_weights,
        }
    }

    fn weight_for(&self, engine_name: &str) -> f32 {
        self.engine_weights
            .iter()
            .find(|(name, _)| *name == engine_name)
            .map(|(_, w)| *w)
            .unwrap_or(1.0)
    }

    pub fn aggregate(
        &self,
        path: PathBuf,
        engine_results: Vec<EngineResult>,
        duration: Duration,
    ) -> AggregatedResult {
        let mut weighted_sum = 0.0f32;
        let mut weight_sum = 0.0f32;
        let mut reasons = Vec::new();

        for result in &engine_results {
            // Engines that errored out, or had nothing to say, are dropped
            // entirely: they contribute to neither the numerator nor the
            // weight denominator.
            if result.verdict == EngineVerdict::Error || result.verdict == EngineVerdict::Clean {
                continue;
            }
            let weight = self.weight_for(&result.engine);
            let confidence = result.confidence.max(CONFIDENCE_FLOOR);
            weighted_sum += result.score as f32 * weight * confidence;
            weight_sum += weight;
            reasons.extend(result.reasons.iter().cloned());
        }

        let risk_score = if weight_sum > 0.0 {
            (weighted_sum / weight_sum).clamp(0.0, 100.0)
        } else {
            0.0
        } as u32;

        let malicious_count = engine_results
            .iter()
            .filter(|r| r.verdict == EngineVerdict::Malicious)
            .count();
        let has_overriding_confidence = engine_results.iter().any(|r| {
            r.verdict == EngineVerdict::Malicious && r.confidence >= BLOCK_CONFIDENCE_OVERRIDE
        });
        let any_suspicious = engine_results
            .iter()
            .any(|r| r.verdict == EngineVerdict::Suspicious);

        let verdict = if has_overriding_confidence || risk_score >= self.config.block_threshold {
            Verdict::Block
        } else if risk_score >= self.config.quarantine_threshold || malicious_count >= 2 {
            Verdict::Quarantine
        } else if risk_score >= self.config.review_threshold || any_suspicious {
            Verdict::NeedsReview
        } else {
            Verdict::Allow
        };

        AggregatedResult {
            path,
            risk_score,
            verdict,
            reasons,
            engine_results,
            duration,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentinel_core::model::EngineResult;

    fn weights() -> Vec<(&'static str, f32)> {
        vec![
            ("signature", 1.0),
            ("heuristic", 0.6),
            ("ml", 0.5),
            ("script", 0.5),
            ("reputation", 0.2),
        ]
    }

    #[test]
    fn all_clean_yields_allow() {
        let agg = ThreatAggregator::new(AggregatorConfig::default(), weights());
        let results = vec![
            EngineResult::clean("signature"),
            EngineResult::clean("heuristic"),
        ];
        let out = agg.aggregate(PathBuf::from("/tmp/a"), results, Duration::from_millis(5));
        assert_eq!(out.verdict, Verdict::Allow);
        assert_eq!(out.risk_score, 0);
    }

    #[test]
    fn high_confidence_signature_hit_forces_block() {
        let agg = ThreatAggregator::new(AggregatorConfig::default(), weights());
        let results = vec![EngineResult::malicious(
            "signature",
            100,
            1.0,
            vec!["matched".into()],
        )];
        let out = agg.aggregate(PathBuf::from("/tmp/a"), results, Duration::from_millis(5));
        assert_eq!(out.verdict, Verdict::Block);
    }

    #[test]
    fn clean_engines_do_not_dilute_a_signature_hit() {
        // Mirrors the EICAR end-to-end scenario: one decisive signature hit
        // alongside several engines that have nothing to say must still
        // clear the block threshold on score alone, not only via the
        // confidence override.
        let agg = ThreatAggregator::new(AggregatorConfig::default(), weights());
        let results = vec![
            EngineResult::malicious("signature", 100, 1.0, vec!["matched EICAR".into()]),
            EngineResult::clean("heuristic"),
            EngineResult::clean("ml"),
            EngineResult::clean("script"),
            EngineResult::clean("reputation"),
        ];
        let out = agg.aggregate(PathBuf::from("/tmp/eicar.com"), results, Duration::from_millis(5));
        assert!(out.risk_score >= 80, "risk_score was {}", out.risk_score);
        assert_eq!(out.verdict, Verdict::Block);
    }

    #[test]
    fn two_malicious_engines_trigger_quarantine_even_below_threshold() {
        let agg = ThreatAggregator::new(AggregatorConfig::default(), weights());
        let results = vec![
            EngineResult::malicious("heuristic", 30, 0.5, vec!["a".into()]),
            EngineResult::malicious("script", 30, 0.5, vec!["b".into()]),
        ];
        let out = agg.aggregate(PathBuf::from("/tmp/a"), results, Duration::from_millis(5));
        assert_eq!(out.verdict, Verdict::Quarantine);
    }

    #[test]
    fn errored_engine_contributes_nothing() {
        let agg = ThreatAggregator::new(AggregatorConfig::default(), weights());
        let results = vec![
            EngineResult::error("ml", "model unavailable"),
            EngineResult::clean("signature"),
        ];
        let out = agg.aggregate(PathBuf::from("/tmp/a"), results, Duration::from_millis(5));
        assert_eq!(out.risk_score, 0);
        assert_eq!(out.verdict, Verdict::Allow);
    }

    #[test]
    fn low_score_single_engine_is_needs_review_or_allow() {
        let agg = ThreatAggregator::new(AggregatorConfig::default(), weights());
        let results = vec![EngineResult::malicious(
            "heuristic",
            25,
            0.5,
            vec!["weak signal".into()],
        )];
        let out = agg.aggregate(PathBuf::from("/tmp/a"), results, Duration::from_millis(5));
        assert!(matches!(out.verdict, Verdict::NeedsReview | Verdict::Allow));
    }
}
