//! C4 — detection engines. Each engine inspects one `ScanContext` and
//! returns an independent `EngineResult`; the aggregator (C6) combines them.

pub mod heuristic;
pub mod ml;
pub mod reputation;
pub mod script;
pub mod signature;

use anyhow::Result;
use async_trait::async_trait;
use sentinel_core::model::{EngineResult, ScanContext};

#[async_trait]
pub trait DetectionEngine: Send + Sync {
    fn name(&self) -> &'static str;

    /// Relative weight of this engine's vote in the aggregated score, per
    /// the agent's configured weighting (signature 1.0, heuristic 0.6,
    /// ml 0.5, script 0.5, reputation 0.2).
    fn weight(&self) -> f32;

    async fn analyze(&self, ctx: &ScanContext) -> Result<EngineResult>;
}

pub fn default_engines(signatures: std::sync::Arc<crate::signatures::SignatureDatabase>) -> Vec<Box<dyn DetectionEngine>> {
    vec![
        Box::new(signature::SignatureEngine::new(signatures)),
        Box::new(heuristic::HeuristicEngine::new()),
        Box::new(script::ScriptEngine::new()),
        Box::new(ml::MlEngine::new()),
        Box::new(reputation::ReputationEngine::new()),
    ]
}
