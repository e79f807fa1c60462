//! Control stream: login exchange, room records and the connection's task queue.
//!
//! Stream 1 of every connection. The initiator sends the login HEADERS (a host that
//! registers a room follows with its `frp:motd` and `frp:port` records), the responder
//! answers with `:status` and its own records. Afterwards the stream stays open; its
//! owner drains [`ControlCommand`]s and guards the connection against idleness.

use std::{net::SocketAddr, time::Duration};

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::aefrp::tunnel::{
    mux::{ErrorCode, Mux, MuxError, MuxStream},
    portmap::PortMap,
    protocol::{
        Headers, Method, PROTOCOL_VERSION, ProtocolError, Record, RecordBuf, SCHEME,
        SERVER_SOFTWARE, header, status,
    },
};

pub const CONTROL_STREAM_ID: u32 = 1;
pub const LOGIN_TIMEOUT: Duration = Duration::from_secs(10);
pub const PING_TIMEOUT: Duration = Duration::from_secs(10);
const COMMAND_QUEUE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlState {
    Open,
    LoginSent,
    LoginAcked,
    Serving,
    Closed,
}

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("mux: {0}")]
    Mux(#[from] MuxError),
    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("login refused with status {0:?}")]
    Refused(String),
    #[error("bad login: {0}")]
    BadLogin(&'static str),
    #[error("control: timed out")]
    Timeout,
    #[error("control: channel closed")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginRequest {
    pub method: Method,
    /// Display name (`:authority`).
    pub name: String,
    pub version: String,
}

impl LoginRequest {
    pub fn new(method: Method, name: impl Into<String>) -> Self {
        Self {
            method,
            name: name.into(),
            version: PROTOCOL_VERSION.to_string(),
        }
    }

    pub fn to_headers(&self) -> Headers {
        Headers::new()
            .with(header::METHOD, self.method.as_str())
            .with(header::SCHEME, SCHEME)
            .with(header::AUTHORITY, self.name.clone())
            .with(header::VERSION, self.version.clone())
    }

    pub fn from_headers(h: &Headers) -> Result<Self, ControlError> {
        if !h.is_frp() {
            return Err(ControlError::BadLogin("scheme is not Frp"));
        }
        let method = match h.method() {
            Some(m @ (Method::Connect | Method::Create)) => m,
            _ => return Err(ControlError::BadLogin("method must be CONNECT or CREATE")),
        };
        Ok(Self {
            method,
            name: h.get(header::AUTHORITY).unwrap_or_default().trim().to_string(),
            version: h.get(header::VERSION).unwrap_or_default().to_string(),
        })
    }
}

/// What a registering host announces about its room.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Announcement {
    pub motd: String,
    pub ports: PortMap,
}

/// What the initiator learns from the responder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Welcome {
    pub server: String,
    /// Responder's room or display name (`:authority`).
    pub name: String,
    pub motd: String,
    /// Absent when the initiator is the room host itself.
    pub ports: Option<PortMap>,
}

pub enum ControlCommand {
    /// Open a bridge stream toward the peer for a client at `endpoint`.
    Push {
        endpoint: SocketAddr,
        reply: oneshot::Sender<Result<MuxStream, MuxError>>,
    },
}

/// Cloneable sender side of a control task queue.
#[derive(Clone, Debug)]
pub struct ControlHandle {
    tx: mpsc::Sender<ControlCommand>,
}

pub fn command_queue() -> (ControlHandle, mpsc::Receiver<ControlCommand>) {
    let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
    (ControlHandle { tx }, rx)
}

impl ControlHandle {
    pub async fn schedule(&self, cmd: ControlCommand) -> Result<(), ControlError> {
        self.tx.send(cmd).await.map_err(|_| ControlError::Closed)
    }

    pub async fn push(&self, endpoint: SocketAddr) -> Result<MuxStream, ControlError> {
        let (reply, rx) = oneshot::channel();
        self.schedule(ControlCommand::Push { endpoint, reply }).await?;
        Ok(rx.await.map_err(|_| ControlError::Closed)??)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

pub fn push_headers(endpoint: SocketAddr) -> Headers {
    Headers::new()
        .with(header::METHOD, Method::Push.as_str())
        .with(header::SCHEME, SCHEME)
        .with(header::ENDPOINT_IP, endpoint.to_string())
}

pub struct ControlChannel {
    stream: MuxStream,
    state: ControlState,
    records: RecordBuf,
}

impl ControlChannel {
    pub fn state(&self) -> ControlState {
        self.state
    }

    /// Initiator side. Opens stream 1, logs in and reads the responder's records.
    /// `announce` is set when registering a room as its host.
    ///
    /// A failed login closes `mux`.
    pub async fn login(
        mux: &Mux,
        req: &LoginRequest,
        announce: Option<&Announcement>,
    ) -> Result<(Self, Welcome), ControlError> {
        match Self::login_inner(mux, req, announce).await {
            Ok(ok) => Ok(ok),
            Err(err) => {
                mux.close(&format!("login failed: {err}")).await;
                Err(err)
            }
        }
    }

    async fn login_inner(
        mux: &Mux,
        req: &LoginRequest,
        announce: Option<&Announcement>,
    ) -> Result<(Self, Welcome), ControlError> {
        let stream = mux.open_stream(&req.to_headers(), false).await?;
        let mut ch = Self {
            stream,
            state: ControlState::Open,
            records: RecordBuf::default(),
        };
        if let Some(a) = announce {
            ch.send_record(&Record::Motd(a.motd.clone())).await?;
            ch.send_record(&Record::Ports(a.ports.clone())).await?;
        }
        ch.state = ControlState::LoginSent;

        let resp = tokio::time::timeout(LOGIN_TIMEOUT, ch.stream.recv_headers())
            .await
            .map_err(|_| ControlError::Timeout)??;
        let code = resp.status().unwrap_or_default();
        if code != status::OK {
            ch.state = ControlState::Closed;
            return Err(ControlError::Refused(code.to_string()));
        }
        ch.state = ControlState::LoginAcked;

        let server = resp.get(header::SERVER).unwrap_or_default().to_string();
        let name = resp.get(header::AUTHORITY).unwrap_or_default().to_string();
        let motd = match ch.read_record().await? {
            Record::Motd(m) => m,
            _ => return Err(ControlError::BadLogin("expected frp:motd")),
        };
        let ports = if announce.is_none() {
            match ch.read_record().await? {
                Record::Ports(p) => Some(p),
                _ => return Err(ControlError::BadLogin("expected frp:port")),
            }
        } else {
            None
        };
        ch.state = ControlState::Serving;
        Ok((
            ch,
            Welcome {
                server,
                name,
                motd,
                ports,
            },
        ))
    }

    /// Responder side. Waits for stream 1 and parses its login headers.
    pub async fn accept(mux: &Mux) -> Result<(Self, LoginRequest), ControlError> {
        let stream = tokio::time::timeout(LOGIN_TIMEOUT, mux.accept())
            .await
            .map_err(|_| ControlError::Timeout)?
            .ok_or(ControlError::Closed)?;
        if stream.id() != CONTROL_STREAM_ID {
            stream.reset(ErrorCode::Protocol).await;
            return Err(ControlError::BadLogin("first stream is not the control stream"));
        }
        let headers = tokio::time::timeout(LOGIN_TIMEOUT, stream.recv_headers())
            .await
            .map_err(|_| ControlError::Timeout)??;
        let mut ch = Self {
            stream,
            state: ControlState::LoginSent,
            records: RecordBuf::default(),
        };
        match LoginRequest::from_headers(&headers) {
            Ok(req) => Ok((ch, req)),
            Err(err) => {
                ch.refuse(status::BAD_REQUEST).await;
                Err(err)
            }
        }
    }

    /// Responder side, host registration: the announced MOTD and port map.
    pub async fn read_announcement(&mut self) -> Result<Announcement, ControlError> {
        let motd = match self.read_record().await? {
            Record::Motd(m) => m,
            _ => return Err(ControlError::BadLogin("expected frp:motd")),
        };
        let ports = match self.read_record().await? {
            Record::Ports(p) => p,
            _ => return Err(ControlError::BadLogin("expected frp:port")),
        };
        Ok(Announcement { motd, ports })
    }

    /// Responder side: `200` naming the room, then the MOTD and, for peers other than
    /// the room host, the port map.
    pub async fn welcome(
        &mut self,
        name: &str,
        motd: &str,
        ports: Option<&PortMap>,
    ) -> Result<(), ControlError> {
        let resp = Headers::new()
            .with(header::STATUS, status::OK)
            .with(header::SERVER, SERVER_SOFTWARE)
            .with(header::AUTHORITY, name);
        self.stream.send_headers(&resp, false).await?;
        self.state = ControlState::LoginAcked;
        self.send_record(&Record::Motd(motd.to_string())).await?;
        if let Some(ports) = ports {
            self.send_record(&Record::Ports(ports.clone())).await?;
        }
        self.state = ControlState::Serving;
        Ok(())
    }

    /// Responder side: refuses the login and ends the stream.
    pub async fn refuse(&mut self, code: &str) {
        let resp = Headers::new()
            .with(header::STATUS, code)
            .with(header::SERVER, SERVER_SOFTWARE);
        let _ = self.stream.send_headers(&resp, true).await;
        self.state = ControlState::Closed;
    }

    async fn send_record(&self, r: &Record) -> Result<(), ControlError> {
        let wire = r.encode()?;
        self.stream.send_data(&wire, false).await?;
        Ok(())
    }

    /// Next known record; unknown tags are skipped.
    async fn read_record(&mut self) -> Result<Record, ControlError> {
        let deadline = tokio::time::Instant::now() + LOGIN_TIMEOUT;
        loop {
            match self.records.next_record()? {
                Some(Record::Unknown(tag)) => {
                    tracing::debug!(tag = %tag, "control: skipping unknown record");
                }
                Some(r) => return Ok(r),
                None => {
                    let chunk = tokio::time::timeout_at(deadline, self.stream.recv_data())
                        .await
                        .map_err(|_| ControlError::Timeout)??
                        .ok_or(ControlError::Closed)?;
                    self.records.extend(&chunk);
                }
            }
        }
    }

    fn drain_records(&mut self) -> Result<(), ProtocolError> {
        while let Some(r) = self.records.next_record()? {
            tracing::debug!(tag = %r.tag(), "control: record while serving");
        }
        Ok(())
    }

    /// Serves the connection until it ends and returns the reason.
    ///
    /// Queued commands are drained in batches under one write lock. When nothing has
    /// arrived for `idle_timeout` the peer is pinged; only an unanswered ping closes
    /// the connection.
    pub async fn serve(
        mut self,
        mux: &Mux,
        mut commands: mpsc::Receiver<ControlCommand>,
        idle_timeout: Duration,
    ) -> String {
        self.state = ControlState::Serving;
        let mut commands_open = true;
        let reason = loop {
            let idle_left = idle_timeout.saturating_sub(mux.idle());
            tokio::select! {
                cmd = commands.recv(), if commands_open => match cmd {
                    Some(cmd) => {
                        let mut batch = vec![cmd];
                        while let Ok(more) = commands.try_recv() {
                            batch.push(more);
                        }
                        run_commands(mux, batch).await;
                    }
                    None => commands_open = false,
                },
                data = self.stream.recv_data() => match data {
                    Ok(Some(chunk)) => {
                        self.records.extend(&chunk);
                        if let Err(err) = self.drain_records() {
                            break format!("control stream: {err}");
                        }
                    }
                    Ok(None) => break "control stream closed by peer".to_string(),
                    Err(err) => break format!("control stream: {err}"),
                },
                reason = mux.closed() => break reason,
                _ = tokio::time::sleep(idle_left) => {
                    if mux.idle() >= idle_timeout {
                        match mux.ping(PING_TIMEOUT).await {
                            Ok(rtt) => tracing::debug!(rtt = ?rtt, "control: idle ping answered"),
                            Err(err) => break format!("idle ping failed: {err}"),
                        }
                    }
                }
            }
        };
        self.state = ControlState::Closed;
        mux.close(&reason).await;
        reason
    }
}

async fn run_commands(mux: &Mux, batch: Vec<ControlCommand>) {
    // Dropping the batch fails every reply with `Closed`.
    let Ok(mut w) = mux.lock().await else {
        return;
    };
    for cmd in batch {
        match cmd {
            ControlCommand::Push { endpoint, reply } => {
                let r = w.open_stream(&push_headers(endpoint), false).await;
                let _ = reply.send(r);
            }
        }
    }
}
