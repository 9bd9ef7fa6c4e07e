//! Service-side IPC wire protocol: length-prefixed JSON frames over a Unix
//! domain socket or Windows named pipe, with session tokens and a sliding
//! rate-window per connection.
//!
//! Frames are `[u32 little-endian length][JSON body]`. A body larger than
//! `MAX_FRAME_BYTES` is rejected before it is fully read.

use crate::model::AgentSettings;
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{broadcast, Mutex};

pub const IPC_PROTOCOL_VERSION: u32 = 1;
pub const MAX_FRAME_BYTES: u32 = 2 * 1024 * 1024;
pub const SESSION_TTL: Duration = Duration::from_secs(3600);

/// Commands that require an authenticated admin session, not merely a valid
/// one. Enforced server-side before the handler ever sees the request.
const ADMIN_COMMANDS: &[&str] = &[
    "RestoreFromQuarantine",
    "DeleteFromQuarantine",
    "DisableRealTime",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", content = "args")]
pub enum IpcCommand {
    /// `admin` is not part of this message: whether a session is privileged
    /// is derived from the OS transport's peer credentials at accept time,
    /// never from anything the client asserts on the wire.
    Hello { client_id: String },
    Ping,
    StartScan { paths: Vec<String> },
    StopScan,
    GetScanProgress,
    ListQuarantine,
    RestoreFromQuarantine { entry_id: String },
    DeleteFromQuarantine { entry_id: String },
    GetPendingThreats,
    ResolveThreat { event_id: String, action: String },
    EnableRealTime,
    DisableRealTime,
    UpdateSettings { settings: AgentSettings },
    GetStatus,
}

impl IpcCommand {
    fn name(&self) -> &'static str {
        match self {
            IpcCommand::Hello { .. } => "Hello",
            IpcCommand::Ping => "Ping",
            IpcCommand::StartScan { .. } => "StartScan",
            IpcCommand::StopScan => "StopScan",
            IpcCommand::GetScanProgress => "GetScanProgress",
            IpcCommand::ListQuarantine => "ListQuarantine",
            IpcCommand::RestoreFromQuarantine { .. } => "RestoreFromQuarantine",
            IpcCommand::DeleteFromQuarantine { .. } => "DeleteFromQuarantine",
            IpcCommand::GetPendingThreats => "GetPendingThreats",
            IpcCommand::ResolveThreat { .. } => "ResolveThreat",
            IpcCommand::EnableRealTime => "EnableRealTime",
            IpcCommand::DisableRealTime => "DisableRealTime",
            IpcCommand::UpdateSettings { .. } => "UpdateSettings",
            IpcCommand::GetStatus => "GetStatus",
        }
    }

    fn is_admin_only(&self) -> bool {
        ADMIN_COMMANDS.contains(&self.name())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "result", content = "data")]
pub enum IpcResult {
    Welcome { session_token: String },
    Pong,
    ScanStarted { job_id: String },
    ScanStopped,
    ScanProgress(serde_json::Value),
    QuarantineList(Vec<serde_json::Value>),
    Restored,
    Deleted,
    PendingThreats(Vec<serde_json::Value>),
    ThreatResolved,
    RealTimeEnabled,
    RealTimeDisabled,
    SettingsUpdated,
    Status(serde_json::Value),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub session_token: Option<String>,
    pub command: IpcCommand,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub ok: bool,
    pub result: Option<IpcResult>,
    pub error: Option<String>,
}

/// Server-initiated push, interleaved on the same framed connection as
/// request/response traffic. Distinguished from `ResponseEnvelope` on the
/// wire by the presence of `event_type` rather than `ok`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_type: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl EventEnvelope {
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            timestamp: Utc::now(),
        }
    }
}

/// What a client may read off the wire outside of its own request/response
/// turn: either a broadcast event or (if it raced a response) the response
/// itself. `#[serde(untagged)]` distinguishes by shape since the two
/// envelopes share no field names.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IncomingFrame {
    Event(EventEnvelope),
    Response(ResponseEnvelope),
}

impl ResponseEnvelope {
    fn ok(result: IpcResult) -> Self {
        Self {
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    fn err(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            result: None,
            error: Some(message.into()),
        }
    }
}

pub async fn write_frame<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    body: &[u8],
) -> Result<()> {
    if body.len() as u64 > MAX_FRAME_BYTES as u64 {
        return Err(anyhow!("frame too large: {} bytes", body.len()));
    }
    writer.write_u32_le(body.len() as u32).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_frame<R: tokio::io::AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let len = reader.read_u32_le().await?;
    if len > MAX_FRAME_BYTES {
        return Err(anyhow!("frame exceeds {} bytes: {} bytes", MAX_FRAME_BYTES, len));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

struct Session {
    admin: bool,
    issued_at: Instant,
    request_times: VecDeque<Instant>,
}

/// Tracks live sessions and their sliding-window request rate. One instance
/// is shared by every accepted connection.
pub struct SessionManager {
    sessions: Mutex<HashMap<String, Session>>,
    rate_limit_per_minute: u32,
}

impl SessionManager {
    pub fn new(rate_limit_per_minute: u32) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            rate_limit_per_minute,
        }
    }

    pub async fn issue(&self, admin: bool) -> String {
        let mut bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        let token = hex::encode(bytes);
        let mut sessions = self.sessions.lock().await;
        sessions.insert(
            token.clone(),
            Session {
                admin,
                issued_at: Instant::now(),
                request_times: VecDeque::new(),
            },
        );
        token
    }

    /// Validates the token's TTL, checks admin gating for `command`, and
    /// records this request against the sliding rate window.
    pub async fn authorize(&self, token: &str, command: &IpcCommand) -> Result<()> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .get_mut(token)
            .ok_or_else(|| anyhow!("unknown or expired session"))?;
        if session.issued_at.elapsed() > SESSION_TTL {
            sessions.remove(token);
            return Err(anyhow!("session expired"));
        }
        if command.is_admin_only() && !session.admin {
            return Err(anyhow!("command requires an admin session"));
        }
        let now = Instant::now();
        let window_start = now - Duration::from_secs(60);
        while session
            .request_times
            .front()
            .map(|t| *t < window_start)
            .unwrap_or(false)
        {
            session.request_times.pop_front();
        }
        if session.request_times.len() as u32 >= self.rate_limit_per_minute {
            return Err(anyhow!("rate limit exceeded"));
        }
        session.request_times.push_back(now);
        Ok(())
    }

    pub async fn evict_expired(&self) {
        let mut sessions = self.sessions.lock().await;
        sessions.retain(|_, s| s.issued_at.elapsed() <= SESSION_TTL);
    }
}

#[async_trait::async_trait]
pub trait IpcHandler {
    async fn handle(&self, command: IpcCommand) -> Result<IpcResult>;
}

/// Default capacity of the server-wide broadcast channel. Slow or vanished
/// subscribers lag and get silently evicted (the next recv returns
/// `Lagged`, which we treat as a cue to stop that connection's forwarding
/// loop rather than fall permanently behind).
const EVENT_CHANNEL_CAPACITY: usize = 1024;

pub struct IpcServer {
    sessions: Arc<SessionManager>,
    socket_path: std::path::PathBuf,
    events: broadcast::Sender<EventEnvelope>,
}

impl IpcServer {
    pub fn new(rate_limit_per_minute: u32, socket_path: std::path::PathBuf) -> Self {
        let (events, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            sessions: Arc::new(SessionManager::new(rate_limit_per_minute)),
            socket_path,
            events,
        }
    }

    /// A handle the rest of the service can use to push `ThreatDetected`,
    /// `ScanProgress`, and similar events to every connected session.
    pub fn event_sender(&self) -> broadcast::Sender<EventEnvelope> {
        self.events.clone()
    }

    #[cfg(unix)]
    pub async fn start(self: Arc<Self>, handler: Arc<dyn IpcHandler + Send + Sync>) -> Result<()> {
        use tokio::net::UnixListener;
        if self.socket_path.exists() {
            let _ = std::fs::remove_file(&self.socket_path);
        }
        let listener = UnixListener::bind(&self.socket_path)?;
        loop {
            let (stream, _addr) = listener.accept().await?;
            let is_admin = unix_peer_is_admin(&stream);
            let sessions = self.sessions.clone();
            let handler = handler.clone();
            let events = self.events.subscribe();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, is_admin, sessions, handler, events).await {
                    tracing::warn!(error = %e, "ipc connection ended");
                }
            });
        }
    }

    #[cfg(windows)]
    pub async fn start(self: Arc<Self>, handler: Arc<dyn IpcHandler + Send + Sync>) -> Result<()> {
        use tokio::net::windows::named_pipe::ServerOptions;
        loop {
            let server = ServerOptions::new()
                .first_pipe_instance(true)
                .create(&self.socket_path)?;
            server.connect().await?;
            let is_admin = windows_peer_is_admin(&server);
            let sessions = self.sessions.clone();
            let handler = handler.clone();
            let events = self.events.subscribe();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(server, is_admin, sessions, handler, events).await {
                    tracing::warn!(error = %e, "ipc connection ended");
                }
            });
        }
    }
}

/// A connecting peer is treated as the privileged local administrator only
/// when its real uid is 0. Group-based elevation (e.g. `sudo`-granted
/// membership without a uid change) is deliberately out of scope: a wrong
/// "yes" here lets an unprivileged client quarantine-restore or disable
/// real-time protection.
#[cfg(unix)]
fn unix_peer_is_admin(stream: &tokio::net::UnixStream) -> bool {
    match stream.peer_cred() {
        Ok(cred) => cred.uid() == 0,
        Err(e) => {
            tracing::warn!(error = %e, "could not read ipc peer credentials, treating as non-admin");
            false
        }
    }
}

/// Impersonates the connected named-pipe client just long enough to check
/// whether its token is a member of the local Administrators group, then
/// reverts. Failure at any step is treated as non-admin rather than
/// propagated, since a broken credential check must fail closed.
#[cfg(windows)]
fn windows_peer_is_admin(server: &tokio::net::windows::named_pipe::NamedPipeServer) -> bool {
    use std::os::windows::io::AsRawHandle;
    use windows_sys::Win32::Foundation::{CloseHandle, HANDLE};
    use windows_sys::Win32::Security::{
        CheckTokenMembership, CreateWellKnownSid, WinBuiltinAdministratorsSid,
    };
    use windows_sys::Win32::System::Pipes::{ImpersonateNamedPipeClient, RevertToSelf};
    use windows_sys::Win32::System::Threading::{GetCurrentThread, OpenThreadToken, TOKEN_QUERY};

    let handle = server.as_raw_handle() as HANDLE;
    unsafe {
        if ImpersonateNamedPipeClient(handle) == 0 {
            return false;
        }

        let mut token: HANDLE = std::ptr::null_mut();
        let opened = OpenThreadToken(GetCurrentThread(), TOKEN_QUERY, 1, &mut token);
        if opened == 0 {
            RevertToSelf();
            return false;
        }

        let mut admins_sid = [0u8; 64];
        let mut sid_size = admins_sid.len() as u32;
        let created = CreateWellKnownSid(
            WinBuiltinAdministratorsSid,
            std::ptr::null_mut(),
            admins_sid.as_mut_ptr() as *mut _,
            &mut sid_size,
        );

        let mut is_member: i32 = 0;
        let is_admin = created != 0
            && CheckTokenMembership(token, admins_sid.as_mut_ptr() as *mut _, &mut is_member) != 0
            && is_member != 0;

        CloseHandle(token);
        RevertToSelf();
        is_admin
    }
}

async fn handle_connection<S>(
    mut stream: S,
    is_admin: bool,
    sessions: Arc<SessionManager>,
    handler: Arc<dyn IpcHandler + Send + Sync>,
    mut events: broadcast::Receiver<EventEnvelope>,
) -> Result<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    loop {
        tokio::select! {
            body = read_frame(&mut stream) => {
                let body = match body {
                    Ok(b) => b,
                    Err(_) => return Ok(()),
                };
                let req: RequestEnvelope = match serde_json::from_slice(&body) {
                    Ok(r) => r,
                    Err(e) => {
                        let resp = ResponseEnvelope::err(format!("malformed request: {e}"));
                        write_frame(&mut stream, &serde_json::to_vec(&resp)?).await?;
                        continue;
                    }
                };

                let response = if let IpcCommand::Hello { .. } = &req.command {
                    let token = sessions.issue(is_admin).await;
                    ResponseEnvelope::ok(IpcResult::Welcome {
                        session_token: token,
                    })
                } else {
                    match &req.session_token {
                        None => ResponseEnvelope::err("missing session token"),
                        Some(token) => match sessions.authorize(token, &req.command).await {
                            Ok(()) => match handler.handle(req.command).await {
                                Ok(result) => ResponseEnvelope::ok(result),
                                Err(e) => ResponseEnvelope::err(e.to_string()),
                            },
                            Err(e) => ResponseEnvelope::err(e.to_string()),
                        },
                    }
                };

                write_frame(&mut stream, &serde_json::to_vec(&response)?).await?;
            }
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        if write_frame(&mut stream, &serde_json::to_vec(&event)?).await.is_err() {
                            return Ok(());
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return Ok(()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hello_issues_session_and_gates_admin_commands() {
        let sessions = SessionManager::new(50);
        let token = sessions.issue(false).await;
        let ok = sessions.authorize(&token, &IpcCommand::GetStatus).await;
        assert!(ok.is_ok());
        let denied = sessions
            .authorize(&token, &IpcCommand::DisableRealTime)
            .await;
        assert!(denied.is_err());
    }

    #[tokio::test]
    async fn admin_session_may_use_admin_commands() {
        let sessions = SessionManager::new(50);
        let token = sessions.issue(true).await;
        let ok = sessions
            .authorize(
                &token,
                &IpcCommand::RestoreFromQuarantine {
                    entry_id: "x".into(),
                },
            )
            .await;
        assert!(ok.is_ok());
    }

    #[tokio::test]
    async fn rate_limit_is_enforced() {
        let sessions = SessionManager::new(2);
        let token = sessions.issue(false).await;
        assert!(sessions.authorize(&token, &IpcCommand::Ping).await.is_ok());
        assert!(sessions.authorize(&token, &IpcCommand::Ping).await.is_ok());
        assert!(sessions.authorize(&token, &IpcCommand::Ping).await.is_err());
    }

    #[tokio::test]
    async fn unknown_session_is_rejected() {
        let sessions = SessionManager::new(50);
        assert!(sessions
            .authorize("not-a-real-token", &IpcCommand::Ping)
            .await
            .is_err());
    }
}
