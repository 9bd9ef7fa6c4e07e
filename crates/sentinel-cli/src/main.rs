//! Thin unprivileged client over the C12 IPC surface. Talks the same
//! length-prefixed JSON protocol the service's `ServiceIpcHandler` speaks;
//! all session handshake and framing details live in `sentinel_core::ipc`
//! and `sentinel_core::ipc_client`.

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use sentinel_core::ipc::IpcCommand;
use sentinel_core::ipc_client::IpcClient;
use sentinel_core::paths::ipc_socket_path;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "sentinel-cli")]
#[command(about = "Unprivileged CLI for the sentinel agent IPC surface", long_about = None)]
struct Cli {
    /// Override the IPC socket / pipe path (defaults to the standard one).
    #[arg(long)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that the service is reachable.
    Ping,
    /// Start an on-demand scan of the given paths (or the configured
    /// watched roots if none are given).
    Scan {
        paths: Vec<PathBuf>,
    },
    /// Cancel the in-progress scan job, if any.
    StopScan,
    /// Print the current scan job's progress.
    Progress,
    /// List everything currently held in quarantine.
    ListQuarantine,
    /// Restore a quarantined file back to its original location.
    /// Requires a privileged (administrator) session.
    Restore {
        entry_id: String,
    },
    /// Permanently delete a quarantined entry.
    /// Requires a privileged (administrator) session.
    Delete {
        entry_id: String,
    },
    /// List threats awaiting a user decision.
    Pending,
    /// Resolve a pending threat: `delete`, `quarantine`, `allow`, or
    /// `allow_and_exclude`.
    Resolve {
        event_id: String,
        action: String,
    },
    /// Turn real-time protection on.
    EnableRealTime,
    /// Turn real-time protection off. Requires a privileged session.
    DisableRealTime,
    /// Print the service's overall status.
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let socket_path = match cli.socket {
        Some(p) => p,
        None => ipc_socket_path()?,
    };
    let mut client = IpcClient::connect(socket_path, "sentinel-cli").await?;

    let command = match cli.command {
        Commands::Ping => IpcCommand::Ping,
        Commands::Scan { paths } => IpcCommand::StartScan {
            paths: paths
                .into_iter()
                .map(|p| p.to_string_lossy().into_owned())
                .collect(),
        },
        Commands::StopScan => IpcCommand::StopScan,
        Commands::Progress => IpcCommand::GetScanProgress,
        Commands::ListQuarantine => IpcCommand::ListQuarantine,
        Commands::Restore { entry_id } => IpcCommand::RestoreFromQuarantine { entry_id },
        Commands::Delete { entry_id } => IpcCommand::DeleteFromQuarantine { entry_id },
        Commands::Pending => IpcCommand::GetPendingThreats,
        Commands::Resolve { event_id, action } => IpcCommand::ResolveThreat { event_id, action },
        Commands::EnableRealTime => IpcCommand::EnableRealTime,
        Commands::DisableRealTime => IpcCommand::DisableRealTime,
        Commands::Status => IpcCommand::GetStatus,
    };

    let result = client
        .call(command)
        .await
        .map_err(|e| anyhow!("request failed: {e}"))?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
