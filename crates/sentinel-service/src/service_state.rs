//! Owns every long-lived component the service wires together at startup
//! and hands out `Arc` handles to the IPC handler and the real-time
//! scanning pipeline.

use crate::action_executor::ActionExecutor;
use crate::event_queue::FileEventQueue;
use crate::monitor::{MonitorStats, RealTimeMonitor};
use crate::quarantine::QuarantineStore;
use crate::scan_controller::{ScanController, ScanProgress};
use anyhow::Result;
use parking_lot::{Mutex, RwLock};
use sentinel_core::event_log::EventLog;
use sentinel_core::ipc::EventEnvelope;
use sentinel_core::model::AgentSettings;
use sentinel_core::vault::Vault;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tracing::warn;

pub struct ServiceState {
    vault: AsyncMutex<Vault>,
    settings: RwLock<AgentSettings>,
    watched_roots: RwLock<Vec<PathBuf>>,
    scan_controller: Arc<ScanController>,
    action_executor: Arc<ActionExecutor>,
    quarantine: Arc<QuarantineStore>,
    event_queue: Arc<FileEventQueue>,
    monitor: Mutex<RealTimeMonitor>,
    monitor_stats: Arc<MonitorStats>,
    event_log: Arc<EventLog>,
    events: broadcast::Sender<EventEnvelope>,
    started_at: Instant,
}

impl ServiceState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        vault: Vault,
        settings: AgentSettings,
        scan_controller: Arc<ScanController>,
        action_executor: Arc<ActionExecutor>,
        quarantine: Arc<QuarantineStore>,
        event_queue: Arc<FileEventQueue>,
        monitor: RealTimeMonitor,
        monitor_stats: Arc<MonitorStats>,
        event_log: Arc<EventLog>,
        events: broadcast::Sender<EventEnvelope>,
    ) -> Self {
        let watched_roots = settings.watched_roots.clone();
        Self {
            vault: AsyncMutex::new(vault),
            settings: RwLock::new(settings),
            watched_roots: RwLock::new(watched_roots),
            scan_controller,
            action_executor,
            quarantine,
            event_queue,
            monitor: Mutex::new(monitor),
            monitor_stats,
            event_log,
            events,
            started_at: Instant::now(),
        }
    }

    pub fn scan_controller(&self) -> Arc<ScanController> {
        self.scan_controller.clone()
    }

    pub fn action_executor(&self) -> Arc<ActionExecutor> {
        self.action_executor.clone()
    }

    pub fn quarantine(&self) -> Arc<QuarantineStore> {
        self.quarantine.clone()
    }

    pub fn event_queue(&self) -> Arc<FileEventQueue> {
        self.event_queue.clone()
    }

    pub fn event_log(&self) -> Arc<EventLog> {
        self.event_log.clone()
    }

    pub fn events(&self) -> broadcast::Sender<EventEnvelope> {
        self.events.clone()
    }

    pub fn monitor_stats(&self) -> Arc<MonitorStats> {
        self.monitor_stats.clone()
    }

    pub fn settings_snapshot(&self) -> AgentSettings {
        self.settings.read().clone()
    }

    pub fn enable_real_time(&self) {
        self.monitor.lock().start();
    }

    pub fn disable_real_time(&self) {
        self.monitor.lock().stop();
    }

    pub fn real_time_running(&self) -> bool {
        self.monitor.lock().is_running()
    }

    pub async fn scan_progress(&self) -> Option<ScanProgress> {
        self.scan_controller.progress().await
    }

    /// Composite status payload for `GetStatus`: real-time state, the
    /// current scan job (if any), quarantine and pending-threat counts, and
    /// monitor stats since this process started.
    pub async fn status(&self) -> serde_json::Value {
        let settings = self.settings_snapshot();
        let progress = self.scan_progress().await;
        let quarantine_count = self.quarantine.count();
        let pending_count = self.action_executor.get_pending().len();
        let (running, stats) = {
            let monitor = self.monitor.lock();
            (monitor.is_running(), monitor.stats_snapshot())
        };
        serde_json::json!({
            "real_time_protection": running,
            "malware_threshold": settings.malware_threshold,
            "action_mode": settings.action_mode,
            "current_scan": progress,
            "quarantine_count": quarantine_count,
            "pending_threats": pending_count,
            "monitor_stats": stats,
            "uptime_ms": self.started_at.elapsed().as_millis() as u64,
        })
    }

    /// Validates, persists to the vault, and applies `new_settings` to every
    /// live component. Applied even if some downstream component fails to
    /// re-register (e.g. a watch root that has since vanished); the vault
    /// write is the single source of truth that survives a restart.
    pub async fn apply_settings(&self, new_settings: AgentSettings) -> Result<()> {
        sentinel_core::settings::validate(&new_settings)?;
        {
            let mut vault = self.vault.lock().await;
            sentinel_core::storage::save_settings(&mut vault, &new_settings)?;
        }

        self.action_executor
            .update_config(crate::action_executor::ActionExecutorConfig {
                action_mode: new_settings.action_mode,
                ask_min_score: new_settings.ask_min_score,
                auto_quarantine_min_score: new_settings.auto_quarantine_min_score,
            });

        {
            let mut monitor = self.monitor.lock();
            monitor.set_exceptions(new_settings.exception_paths.clone());
            let mut watched = self.watched_roots.write();
            for old_root in watched.iter() {
                if !new_settings.watched_roots.contains(old_root) {
                    if let Err(e) = monitor.unwatch(old_root) {
                        warn!(path = %old_root.display(), error = %e, "failed to unwatch removed root");
                    }
                }
            }
            let new_roots: Vec<PathBuf> = new_settings
                .watched_roots
                .iter()
                .filter(|r| !watched.contains(r))
                .cloned()
                .collect();
            if let Err(e) = monitor.watch_paths(&new_roots) {
                warn!(error = %e, "failed to register new watch roots");
            }
            *watched = new_settings.watched_roots.clone();
        }

        if new_settings.enable_real_time_protection {
            self.enable_real_time();
        } else {
            self.disable_real_time();
        }

        *self.settings.write() = new_settings;
        Ok(())
    }
}
