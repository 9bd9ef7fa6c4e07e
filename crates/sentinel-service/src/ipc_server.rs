//! C12 — service-side IPC handler. Translates each `IpcCommand` into a call
//! against the live `ServiceState`; the transport, session handshake, and
//! admin gating all live in `sentinel_core::ipc` and are already applied
//! before `handle` ever sees a command.

use crate::action_executor::ResolveAction;
use crate::service_state::ServiceState;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use sentinel_core::ipc::{IpcCommand, IpcHandler, IpcResult};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

pub struct ServiceIpcHandler {
    state: Arc<ServiceState>,
}

impl ServiceIpcHandler {
    pub fn new(state: Arc<ServiceState>) -> Self {
        Self { state }
    }
}

fn parse_resolve_action(action: &str) -> Result<(ResolveAction, bool)> {
    match action.to_ascii_lowercase().as_str() {
        "delete" => Ok((ResolveAction::Delete, false)),
        "quarantine" => Ok((ResolveAction::Quarantine, false)),
        "allow" => Ok((ResolveAction::Allow, false)),
        "allow_and_exclude" => Ok((ResolveAction::Allow, true)),
        other => Err(anyhow!("unrecognized resolve action: {other}")),
    }
}

#[async_trait]
impl IpcHandler for ServiceIpcHandler {
    async fn handle(&self, command: IpcCommand) -> Result<IpcResult> {
        match command {
            IpcCommand::Hello { .. } => {
                Err(anyhow!("Hello is handled by the transport, not the handler"))
            }
            IpcCommand::Ping => Ok(IpcResult::Pong),
            IpcCommand::StartScan { paths } => {
                let settings = self.state.settings_snapshot();
                let roots: Vec<PathBuf> = paths.into_iter().map(PathBuf::from).collect();
                let roots = if roots.is_empty() {
                    settings.watched_roots.clone()
                } else {
                    roots
                };
                if roots.is_empty() {
                    return Err(anyhow!("no paths to scan and no watched roots configured"));
                }
                let job_id = self
                    .state
                    .scan_controller()
                    .start_scan(
                        roots,
                        settings.exception_paths.clone(),
                        settings.max_file_size_mb * 1024 * 1024,
                        settings.worker_pool_size,
                    )
                    .await;
                info!(job_id = %job_id, "manual scan started over ipc");
                Ok(IpcResult::ScanStarted { job_id })
            }
            IpcCommand::StopScan => {
                self.state.scan_controller().cancel().await;
                Ok(IpcResult::ScanStopped)
            }
            IpcCommand::GetScanProgress => {
                let progress = self.state.scan_progress().await;
                Ok(IpcResult::ScanProgress(
                    serde_json::to_value(progress).unwrap_or(serde_json::Value::Null),
                ))
            }
            IpcCommand::ListQuarantine => {
                let entries = self.state.quarantine().list_entries()?;
                let values = entries
                    .into_iter()
                    .map(|e| serde_json::to_value(e).unwrap_or(serde_json::Value::Null))
                    .collect();
                Ok(IpcResult::QuarantineList(values))
            }
            IpcCommand::RestoreFromQuarantine { entry_id } => {
                self.state.quarantine().restore(&entry_id, None)?;
                Ok(IpcResult::Restored)
            }
            IpcCommand::DeleteFromQuarantine { entry_id } => {
                self.state.quarantine().delete(&entry_id)?;
                Ok(IpcResult::Deleted)
            }
            IpcCommand::GetPendingThreats => {
                let pending = self.state.action_executor().get_pending();
                let values = pending
                    .into_iter()
                    .map(|p| serde_json::to_value(p).unwrap_or(serde_json::Value::Null))
                    .collect();
                Ok(IpcResult::PendingThreats(values))
            }
            IpcCommand::ResolveThreat { event_id, action } => {
                let (resolve_action, add_to_exclusions) = parse_resolve_action(&action)?;
                // `resolve` itself pushes an `ActionApplied` signal; the
                // service's signal-forwarding task is what logs and
                // broadcasts it, so there is nothing further to do here.
                self.state
                    .action_executor()
                    .resolve(&event_id, resolve_action, add_to_exclusions)
                    .map_err(|e| anyhow!(e))?;
                Ok(IpcResult::ThreatResolved)
            }
            IpcCommand::EnableRealTime => {
                self.state.enable_real_time();
                Ok(IpcResult::RealTimeEnabled)
            }
            IpcCommand::DisableRealTime => {
                self.state.disable_real_time();
                Ok(IpcResult::RealTimeDisabled)
            }
            IpcCommand::UpdateSettings { settings } => {
                self.state.apply_settings(settings).await?;
                Ok(IpcResult::SettingsUpdated)
            }
            IpcCommand::GetStatus => Ok(IpcResult::Status(self.state.status().await)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_resolve_actions() {
        assert_eq!(
            parse_resolve_action("Delete").unwrap(),
            (ResolveAction::Delete, false)
        );
        assert_eq!(
            parse_resolve_action("allow_and_exclude").unwrap(),
            (ResolveAction::Allow, true)
        );
        assert!(parse_resolve_action("nonsense").is_err());
    }
}
