use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use sentinel_core::event_log::{EventLog, EventSeverity};
use sentinel_core::ipc::IpcServer;
use sentinel_core::paths::{data_dir, ipc_socket_path, log_dir};
use sentinel_core::vault::Vault;
use sentinel_core::{crypto, storage};
use sentinel_service::action_executor::{ActionExecutor, ActionExecutorConfig, ExecutorSignal};
use sentinel_service::aggregator::{AggregatorConfig, ThreatAggregator};
use sentinel_service::cache::ScanCache;
use sentinel_service::coalescer::spawn_coalescer;
use sentinel_service::engines::default_engines;
use sentinel_service::event_queue::FileEventQueue;
use sentinel_service::ipc_server::ServiceIpcHandler;
use sentinel_service::monitor::RealTimeMonitor;
use sentinel_service::quarantine::{QuarantineConfig, QuarantineStore};
use sentinel_service::scan_controller::{ScanController, ScanEngineSet};
use sentinel_service::service_state::ServiceState;
use sentinel_service::signatures::SignatureDatabase;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Sentinel on-host protection agent", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Initialize a new encrypted vault and default settings.
    Init {
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Run the background agent.
    Run {
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    match cli.command {
        Commands::Init { data_dir } => init_command(data_dir).await,
        Commands::Run { data_dir } => run_command(data_dir).await,
    }
}

async fn init_command(data_dir_override: Option<PathBuf>) -> Result<()> {
    let data = data_dir_override.unwrap_or(data_dir()?);
    std::fs::create_dir_all(&data)?;
    std::fs::create_dir_all(log_dir()?)?;
    let vault_path = data.join("vault.dat");
    if vault_path.exists() {
        return Err(anyhow!("vault already exists at {}", vault_path.display()));
    }
    let password = prompt_password_twice("Create vault password")?;
    let mut vault = Vault::create_new(&vault_path, &password)?;
    storage::save_settings(&mut vault, &sentinel_core::model::AgentSettings::default())?;
    println!("Vault created at {}", vault_path.display());
    println!("Device ID: {}", vault.payload.device_id);
    Ok(())
}

async fn run_command(data_dir_override: Option<PathBuf>) -> Result<()> {
    let data = data_dir_override.unwrap_or(data_dir()?);
    std::fs::create_dir_all(&data)?;
    std::fs::create_dir_all(log_dir()?)?;
    let vault_path = data.join("vault.dat");
    if !vault_path.exists() {
        return Err(anyhow!("vault missing; run `init` first"));
    }
    let password = prompt_password_once("Enter vault password")?;
    let vault = Vault::open(&vault_path, &password)?;
    let settings = storage::load_settings(&vault)?;
    let signing_key = vault.signing_key()?;

    let log_path = log_dir()?.join("events.log");
    let event_log = Arc::new(EventLog::new(log_path, signing_key.clone(), 10 * 1024 * 1024)?);

    let quarantine_key = crypto::derive_quarantine_key(&signing_key);
    let quarantine_root = if settings.quarantine_path.is_absolute() {
        settings.quarantine_path.clone()
    } else {
        data.join(&settings.quarantine_path)
    };
    let quarantine = Arc::new(QuarantineStore::open(
        quarantine_root,
        quarantine_key.to_vec(),
        QuarantineConfig {
            max_retries: settings.atomic_move_max_retries,
            initial_delay_ms: settings.atomic_move_initial_delay_ms,
            max_delay_ms: settings.atomic_move_max_delay_ms,
        },
    )?);

    let signatures = Arc::new(SignatureDatabase::load_or_default(&data.join("signatures.db")));
    let engines = default_engines(signatures.clone());
    let engine_weights: Vec<(&'static str, f32)> =
        engines.iter().map(|e| (e.name(), e.weight())).collect();
    let aggregator = ThreatAggregator::new(
        AggregatorConfig {
            block_threshold: settings.block_threshold,
            quarantine_threshold: settings.quarantine_threshold,
            review_threshold: settings.review_threshold,
        },
        engine_weights,
    );
    let cache = Arc::new(ScanCache::new(Duration::from_secs(300), 10_000));
    let engine_set = Arc::new(ScanEngineSet {
        cache,
        engines,
        aggregator,
    });

    let (action_executor, mut executor_signals) = ActionExecutor::new(
        ActionExecutorConfig {
            action_mode: settings.action_mode,
            ask_min_score: settings.ask_min_score,
            auto_quarantine_min_score: settings.auto_quarantine_min_score,
        },
        settings.sha256_allowlist.clone(),
        quarantine.clone(),
    );
    let action_executor = Arc::new(action_executor);

    let ipc_server = Arc::new(IpcServer::new(settings.rate_limit_per_minute, ipc_socket_path()?));
    let events_tx = ipc_server.event_sender();

    let (mut monitor, monitor_changes) = RealTimeMonitor::new()?;
    monitor.set_exceptions(settings.exception_paths.clone());
    if let Err(e) = monitor.watch_paths(&settings.watched_roots) {
        warn!(error = %e, "failed to register configured watch roots");
    }
    if settings.enable_real_time_protection {
        monitor.start();
    }
    let monitor_stats = monitor.stats();

    let event_queue = Arc::new(FileEventQueue::new(4096));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (_coalescer, coalescer_handle) = spawn_coalescer(
        monitor_changes,
        event_queue.clone(),
        Duration::from_millis(settings.coalesce_ms),
        shutdown_rx.clone(),
    );

    let sink_executor = action_executor.clone();
    let sink: sentinel_service::scan_controller::ResultSink = Arc::new(move |ctx, aggregated| {
        // Forwarding ThreatDetected/ThreatActionRequired events and logging
        // every decision happens once, in the executor-signal consumer
        // below, rather than here: the executor already hands every
        // applied/parked decision to that channel.
        let _ = sink_executor.execute(ctx, aggregated);
    });

    let scan_controller = Arc::new(ScanController::new(
        engine_set,
        sink,
        events_tx.clone(),
        monitor_stats.clone(),
    ));

    let worker_pool_size = settings.worker_pool_size.max(1);
    let mut scan_worker_handles = Vec::with_capacity(worker_pool_size);
    for _ in 0..worker_pool_size {
        let queue = event_queue.clone();
        let controller = scan_controller.clone();
        let mut shutdown = shutdown_rx.clone();
        scan_worker_handles.push(tokio::spawn(async move {
            loop {
                match queue.try_dequeue() {
                    Some(event) => {
                        if let Err(e) = controller.scan_single(&event.path).await {
                            tracing::debug!(path = %event.path.display(), error = %e, "real-time scan failed");
                        }
                    }
                    None => {
                        tokio::select! {
                            _ = tokio::time::sleep(Duration::from_millis(25)) => {}
                            _ = shutdown.changed() => {
                                if *shutdown.borrow() {
                                    return;
                                }
                            }
                        }
                    }
                }
            }
        }));
    }

    let signals_event_log = event_log.clone();
    let signals_events = events_tx.clone();
    let signals_stats = monitor_stats.clone();
    let signals_task = tokio::spawn(async move {
        while let Some(signal) = executor_signals.recv().await {
            match signal {
                ExecutorSignal::ActionApplied(event) => {
                    if let Err(e) = signals_event_log.append_threat(&event) {
                        warn!(error = %e, "failed to append threat event to log");
                    }
                    if event.action_taken {
                        signals_stats.record_threat_blocked();
                        if event.result == "Quarantined" {
                            signals_stats.record_quarantined();
                        }
                    }
                    let _ = signals_events.send(sentinel_core::ipc::EventEnvelope::new(
                        "ThreatDetected",
                        serde_json::to_value(&event).unwrap_or_default(),
                    ));
                }
                ExecutorSignal::ActionRequired(pending) => {
                    let _ = signals_events.send(sentinel_core::ipc::EventEnvelope::new(
                        "ThreatActionRequired",
                        serde_json::to_value(&pending).unwrap_or_default(),
                    ));
                }
            }
        }
    });

    let service_state = Arc::new(ServiceState::new(
        vault,
        settings,
        scan_controller,
        action_executor,
        quarantine,
        event_queue,
        monitor,
        monitor_stats,
        event_log.clone(),
        events_tx,
    ));
    let handler = Arc::new(ServiceIpcHandler::new(service_state));

    let server_task = {
        let server = ipc_server.clone();
        tokio::spawn(async move { server.start(handler).await })
    };

    event_log.append("SERVICE_START", EventSeverity::Info, serde_json::json!({}))?;
    info!("sentinel agent started");

    signal::ctrl_c().await?;
    info!("sentinel agent stopping");

    let _ = shutdown_tx.send(true);
    let _ = event_log.append("SERVICE_STOP", EventSeverity::Info, serde_json::json!({}));

    server_task.abort();
    coalescer_handle.abort();
    signals_task.abort();
    for handle in scan_worker_handles {
        handle.abort();
    }

    Ok(())
}

fn prompt_password_once(prompt: &str) -> Result<String> {
    if let Ok(pw) = std::env::var("SENTINEL_VAULT_PASSWORD") {
        if !pw.is_empty() {
            return Ok(pw);
        }
    }
    let pw = rpassword::prompt_password(prompt).map_err(|e| anyhow!("password prompt: {e}"))?;
    if pw.len() < 12 {
        return Err(anyhow!("password too short; minimum 12 characters"));
    }
    Ok(pw)
}

fn prompt_password_twice(prompt: &str) -> Result<String> {
    if let Ok(pw) = std::env::var("SENTINEL_VAULT_PASSWORD") {
        if !pw.is_empty() {
            return Ok(pw);
        }
    }
    let first = prompt_password_once(prompt)?;
    let second = rpassword::prompt_password("Confirm password")
        .map_err(|e| anyhow!("password prompt: {e}"))?;
    if first != second {
        return Err(anyhow!("passwords do not match"));
    }
    Ok(first)
}
