//! Client-side half of the length-prefixed IPC protocol. Used by
//! `sentinel-cli` and anything else that talks to the running service.

use crate::ipc::{
    read_frame, write_frame, EventEnvelope, IncomingFrame, IpcCommand, IpcResult, RequestEnvelope,
};
use anyhow::{anyhow, Result};

#[cfg(unix)]
use tokio::net::UnixStream;

#[cfg(windows)]
use tokio::net::windows::named_pipe::ClientOptions;

#[cfg(unix)]
type Transport = UnixStream;
#[cfg(windows)]
type Transport = tokio::net::windows::named_pipe::NamedPipeClient;

/// A connected IPC session. Holds the session token returned by `Hello` and
/// reuses one transport for the lifetime of the connection.
pub struct IpcClient {
    stream: Transport,
    session_token: Option<String>,
    /// Broadcast events read while waiting for a request's own response.
    /// Drained on demand by `take_events`; not required for request/response
    /// calls to function.
    pending_events: Vec<EventEnvelope>,
}

impl IpcClient {
    /// Connects and performs the `Hello` handshake. Whether the resulting
    /// session is privileged is decided by the service from this process's
    /// OS-level identity on the transport (peer uid on Unix, administrators
    /// group membership on Windows) — nothing this client sends influences
    /// that decision.
    pub async fn connect(socket_path: std::path::PathBuf, client_id: &str) -> Result<Self> {
        #[cfg(unix)]
        let stream = UnixStream::connect(&socket_path).await?;

        #[cfg(windows)]
        let stream = ClientOptions::new()
            .open(&socket_path)
            .map_err(|e| anyhow!("ipc connect: {e}"))?;

        let mut client = Self {
            stream,
            session_token: None,
            pending_events: Vec::new(),
        };

        let result = client
            .send_raw(IpcCommand::Hello {
                client_id: client_id.to_string(),
            })
            .await?;
        match result {
            IpcResult::Welcome { session_token } => {
                client.session_token = Some(session_token);
                Ok(client)
            }
            other => Err(anyhow!("unexpected handshake reply: {other:?}")),
        }
    }

    pub async fn call(&mut self, command: IpcCommand) -> Result<IpcResult> {
        self.send_raw(command).await
    }

    /// Broadcast events (`ThreatDetected`, `ScanProgress`, ...) observed
    /// while waiting for a call's own response. Does not read the socket;
    /// call `call()` again to pump more frames off the wire.
    pub fn take_events(&mut self) -> Vec<EventEnvelope> {
        std::mem::take(&mut self.pending_events)
    }

    async fn send_raw(&mut self, command: IpcCommand) -> Result<IpcResult> {
        let envelope = RequestEnvelope {
            session_token: self.session_token.clone(),
            command,
        };
        let body = serde_json::to_vec(&envelope)?;
        write_frame(&mut self.stream, &body).await?;
        loop {
            let response_body = read_frame(&mut self.stream).await?;
            match serde_json::from_slice(&response_body)? {
                IncomingFrame::Event(event) => {
                    self.pending_events.push(event);
                    continue;
                }
                IncomingFrame::Response(response) => {
                    return if response.ok {
                        response
                            .result
                            .ok_or_else(|| anyhow!("service returned ok with no result"))
                    } else {
                        Err(anyhow!(response
                            .error
                            .unwrap_or_else(|| "unknown error".into())))
                    };
                }
            }
        }
    }
}
