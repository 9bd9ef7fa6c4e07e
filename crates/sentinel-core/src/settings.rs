//! Validation for the persisted `AgentSettings` blob. The type itself lives
//! in [`crate::model`] since the IPC layer and the engines both need it;
//! this module owns the invariants a caller must not be allowed to violate.

use crate::model::AgentSettings;
use anyhow::{bail, Result};

/// Clamps and checks an `AgentSettings` the way it will be used downstream:
/// threshold ordering, pool sizing, and path sanity. Called whenever
/// settings arrive from disk or from `UpdateSettings`.
pub fn validate(settings: &AgentSettings) -> Result<()> {
    if settings.review_threshold > settings.quarantine_threshold {
        bail!("review_threshold must not exceed quarantine_threshold");
    }
    if settings.quarantine_threshold > settings.block_threshold {
        bail!("quarantine_threshold must not exceed block_threshold");
    }
    if settings.block_threshold > 100 {
        bail!("block_threshold must be <= 100");
    }
    if settings.worker_pool_size == 0 {
        bail!("worker_pool_size must be at least 1");
    }
    if settings.atomic_move_initial_delay_ms == 0 {
        bail!("atomic_move_initial_delay_ms must be nonzero");
    }
    if settings.atomic_move_max_delay_ms < settings.atomic_move_initial_delay_ms {
        bail!("atomic_move_max_delay_ms must be >= atomic_move_initial_delay_ms");
    }
    if settings.rate_limit_per_minute == 0 {
        bail!("rate_limit_per_minute must be at least 1");
    }
    if !(0.0..=1.0).contains(&settings.malware_threshold) {
        bail!("malware_threshold must be between 0.0 and 1.0");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_are_valid() {
        validate(&AgentSettings::default()).unwrap();
    }

    #[test]
    fn inverted_thresholds_are_rejected() {
        let mut s = AgentSettings::default();
        s.quarantine_threshold = 10;
        s.block_threshold = 5;
        assert!(validate(&s).is_err());
    }

    #[test]
    fn zero_worker_pool_is_rejected() {
        let mut s = AgentSettings::default();
        s.worker_pool_size = 0;
        assert!(validate(&s).is_err());
    }
}
