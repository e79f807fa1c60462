//! Uplink from a host behind NAT to a public relay.
//!
//! The host logs in without a target room, which makes the relay create a room keyed
//! by the host's fingerprint. Peers that later ask the relay for that room arrive here
//! as pushed streams and are served by the host's own server.

use std::{sync::Arc, time::Duration};

use crate::aefrp::{
    identity::Fingerprint,
    tunnel::{
        bridge,
        control::{Announcement, ControlChannel, LOGIN_TIMEOUT, LoginRequest, command_queue},
        mux::{ErrorCode, Mux, MuxStream, Role},
        protocol::Method,
        room::Room,
        secure,
        server::{RelayServer, SERVER_IDLE_TIMEOUT},
        transport::transport_by_name,
    },
};

#[derive(Debug, Clone)]
pub struct HostUplinkOptions {
    pub relay_addr: String,
    pub transport: String,
    pub relay_fingerprint: Option<Fingerprint>,
    pub dial_timeout: Duration,
    pub idle_timeout: Duration,
}

impl HostUplinkOptions {
    pub fn new(relay_addr: impl Into<String>) -> Self {
        Self {
            relay_addr: relay_addr.into(),
            transport: "tcp".to_string(),
            relay_fingerprint: None,
            dial_timeout: Duration::from_secs(5),
            idle_timeout: SERVER_IDLE_TIMEOUT,
        }
    }
}

pub struct HostUplink {
    opts: HostUplinkOptions,
    server: Arc<RelayServer>,
    room: Arc<Room>,
}

impl std::fmt::Debug for HostUplink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostUplink")
            .field("relay", &self.opts.relay_addr)
            .field("room", &self.room.fingerprint)
            .finish_non_exhaustive()
    }
}

impl HostUplink {
    /// `server` must already own its local room.
    pub fn new(server: Arc<RelayServer>, opts: HostUplinkOptions) -> anyhow::Result<Self> {
        if opts.relay_addr.trim().is_empty() {
            anyhow::bail!("host: relay_addr is required");
        }
        let room = server
            .room(&server.fingerprint())
            .ok_or_else(|| anyhow::anyhow!("host: no local room to publish"))?;
        Ok(Self { opts, server, room })
    }

    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) -> anyhow::Result<()> {
        let mut backoff = Duration::from_secs(1);
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            match self.run_once(shutdown.clone()).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    tracing::warn!(
                        relay = %self.opts.relay_addr,
                        err = %err,
                        backoff = %humantime::format_duration(backoff),
                        "host: relay uplink lost; retrying"
                    );
                }
            }

            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return Ok(());
                    }
                }
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(Duration::from_secs(10));
        }
    }

    async fn run_once(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) -> anyhow::Result<()> {
        let tr = transport_by_name(&self.opts.transport)?;
        let (io, _) = tokio::time::timeout(self.opts.dial_timeout, tr.dial(&self.opts.relay_addr))
            .await
            .map_err(|_| anyhow::anyhow!("host: dial {} timed out", self.opts.relay_addr))??;
        let conn = secure::connect(io, self.server.tls(), None, self.opts.relay_fingerprint).await?;

        let mux = Mux::new(conn.stream, Role::Initiator);
        let info = self.room.info();
        let req = LoginRequest::new(Method::Create, info.name.clone());
        let ann = Announcement {
            motd: info.motd,
            ports: info.ports,
        };
        let (ctl, welcome) = ControlChannel::login(&mux, &req, Some(&ann)).await?;
        tracing::info!(
            relay = %self.opts.relay_addr,
            relay_fingerprint = %conn.peer,
            relay_name = %welcome.name,
            motd = %welcome.motd,
            room = %self.room.fingerprint,
            "host: room published"
        );

        let pushes = tokio::spawn(accept_pushes(mux.clone(), self.server.clone()));
        let (_control, rx) = command_queue();
        let res = tokio::select! {
            reason = ctl.serve(&mux, rx, self.opts.idle_timeout) => Err(anyhow::anyhow!("host: {reason}")),
            _ = async { let _ = shutdown.wait_for(|v| *v).await; } => {
                mux.close("host shutting down").await;
                Ok(())
            }
        };
        pushes.abort();
        res
    }
}

/// Serves every stream the relay pushes; anything else is refused.
async fn accept_pushes(mux: Mux, server: Arc<RelayServer>) {
    while let Some(stream) = mux.accept().await {
        let server = server.clone();
        tokio::spawn(async move {
            if let Err(err) = serve_push(stream, &server).await {
                tracing::debug!(err = %err, "host: pushed stream ended");
            }
        });
    }
}

async fn serve_push(stream: MuxStream, server: &Arc<RelayServer>) -> anyhow::Result<()> {
    let req = match tokio::time::timeout(LOGIN_TIMEOUT, stream.recv_headers()).await {
        Ok(req) => req?,
        Err(_) => {
            stream.reset(ErrorCode::Cancel).await;
            anyhow::bail!("host: stream {} sent no headers", stream.id());
        }
    };
    if req.method() != Some(Method::Push) || !req.is_frp() {
        stream.reset(ErrorCode::Refused).await;
        return Ok(());
    }
    bridge::accept_push(stream, &req, server).await
}
