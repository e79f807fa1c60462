use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use arc_swap::ArcSwapOption;
use serde::Serialize;
use tokio::{
    net::{TcpListener, UdpSocket},
    task::JoinSet,
};

use crate::aefrp::{
    identity::{Fingerprint, Identity},
    tunnel::{
        connection::{Connection, refuse_incoming},
        control::{ControlChannel, LoginRequest, command_queue},
        mux::{Mux, Role},
        portmap::{PortMap, PortMapEntry},
        protocol::Method,
        proxy,
        secure::{self, SecureConfig, SecureError},
        transport::{BoxedStream, transport_by_name},
    },
};

pub const CLIENT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub server_addr: String,
    pub transport: String,
    /// Room to join, keyed by its host's fingerprint.
    pub room: Fingerprint,
    /// Expected fingerprint of the server at `server_addr` when it is a relay.
    pub relay_fingerprint: Option<Fingerprint>,
    /// Display name sent at login.
    pub name: String,
    pub bind_ip: IpAddr,
    /// `(label or port, local port)` overrides for the room's port map.
    pub port_overrides: Vec<(String, u16)>,
    pub dial_timeout: Duration,
    pub idle_timeout: Duration,
}

impl ClientOptions {
    pub fn new(server_addr: impl Into<String>, room: Fingerprint) -> Self {
        Self {
            server_addr: server_addr.into(),
            transport: "tcp".to_string(),
            room,
            relay_fingerprint: None,
            name: String::new(),
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port_overrides: Vec::new(),
            dial_timeout: Duration::from_secs(5),
            idle_timeout: CLIENT_IDLE_TIMEOUT,
        }
    }
}

/// A local listener forwarding into the room.
#[derive(Debug, Clone, Serialize)]
pub struct ForwardedPort {
    pub entry: PortMapEntry,
    pub listen: SocketAddr,
}

/// What the client learned on its last successful login.
#[derive(Debug, Clone, Serialize)]
pub struct ClientSession {
    pub room: Fingerprint,
    pub name: String,
    pub motd: String,
    pub ports: Vec<ForwardedPort>,
}

pub struct Client {
    opts: ClientOptions,
    tls: SecureConfig,
    session: ArcSwapOption<ClientSession>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("server", &self.opts.server_addr)
            .field("room", &self.opts.room)
            .finish_non_exhaustive()
    }
}

/// Secure stream to the room's host at the end of `io`.
///
/// When the server is not the room host itself (a relay), a second handshake runs
/// inside the first one and must reach the room fingerprint.
pub async fn negotiate(
    io: BoxedStream,
    tls: &SecureConfig,
    room: Fingerprint,
    relay: Option<Fingerprint>,
) -> Result<BoxedStream, SecureError> {
    let outer = secure::connect(io, tls, Some(room), relay).await?;
    if outer.peer == room {
        return Ok(Box::new(outer.stream));
    }
    tracing::debug!(relay = %outer.peer.short(), room = %room.short(), "client: negotiating through relay");
    let inner = secure::connect(outer.stream, tls, Some(room), Some(room)).await?;
    Ok(Box::new(inner.stream))
}

impl Client {
    pub fn new(identity: &Identity, mut opts: ClientOptions) -> anyhow::Result<Self> {
        if opts.server_addr.trim().is_empty() {
            anyhow::bail!("tunnel: client server_addr is required");
        }
        if opts.dial_timeout <= Duration::from_millis(0) {
            opts.dial_timeout = Duration::from_secs(5);
        }
        if opts.idle_timeout <= Duration::from_millis(0) {
            opts.idle_timeout = CLIENT_IDLE_TIMEOUT;
        }
        if opts.name.trim().is_empty() {
            opts.name = identity.fingerprint().short();
        }
        Ok(Self {
            opts,
            tls: SecureConfig::new(identity)?,
            session: ArcSwapOption::empty(),
        })
    }

    /// Current session, if connected.
    pub fn session(&self) -> Option<Arc<ClientSession>> {
        self.session.load_full()
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
                        transport = %self.opts.transport,
                        server = %self.opts.server_addr,
                        room = %self.opts.room.short(),
                        err = %err,
                        backoff = %humantime::format_duration(backoff),
                        "client: disconnected; retrying"
                    );
                }
            }
            self.session.store(None);

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
        let (io, remote) = tokio::time::timeout(self.opts.dial_timeout, tr.dial(&self.opts.server_addr))
            .await
            .map_err(|_| anyhow::anyhow!("client: dial {} timed out", self.opts.server_addr))??;
        let stream = tokio::time::timeout(
            secure::HANDSHAKE_TIMEOUT,
            negotiate(io, &self.tls, self.opts.room, self.opts.relay_fingerprint),
        )
        .await
        .map_err(|_| anyhow::anyhow!("client: handshake timed out"))??;

        let mux = Mux::new(stream, Role::Initiator);
        let conn = Connection::new(self.opts.room, remote, mux.clone());
        let req = LoginRequest::new(Method::Connect, self.opts.name.clone());
        let (ctl, welcome) = ControlChannel::login(&mux, &req, None).await?;
        conn.set_name(&welcome.name);

        let mut ports = welcome.ports.unwrap_or_default();
        for (key, local_port) in &self.opts.port_overrides {
            if !ports.set_local_port(key, *local_port) {
                tracing::warn!(key = %key, "client: override matches no port of the room");
            }
        }
        if ports.is_empty() {
            tracing::warn!(room = %self.opts.room.short(), "client: room forwards no ports");
        }
        tracing::info!(
            room = %self.opts.room.short(),
            name = %conn.name(),
            motd = %welcome.motd,
            ports = ports.len(),
            transport = %tr.name(),
            "client: joined room"
        );

        let mut tasks = JoinSet::new();
        let forwarded = self.open_listeners(&conn, &ports, &mut tasks).await;
        self.session.store(Some(Arc::new(ClientSession {
            room: self.opts.room,
            name: conn.name(),
            motd: welcome.motd,
            ports: forwarded,
        })));
        tasks.spawn(refuse_incoming(mux.clone()));

        let (_control, rx) = command_queue();
        let res = tokio::select! {
            reason = ctl.serve(&mux, rx, self.opts.idle_timeout) => Err(anyhow::anyhow!("client: {reason}")),
            _ = async { let _ = shutdown.wait_for(|v| *v).await; } => {
                mux.close("client shutting down").await;
                Ok(())
            }
        };
        tasks.abort_all();
        res
    }

    async fn open_listeners(
        &self,
        conn: &Arc<Connection>,
        ports: &PortMap,
        tasks: &mut JoinSet<()>,
    ) -> Vec<ForwardedPort> {
        let mut out = Vec::new();
        for entry in ports.entries() {
            let bind = SocketAddr::new(self.opts.bind_ip, entry.local_port);
            let listen = if entry.udp {
                match UdpSocket::bind(bind).await {
                    Ok(sock) => {
                        let addr = sock.local_addr().unwrap_or(bind);
                        let conn = conn.clone();
                        let entry = entry.clone();
                        tasks.spawn(async move {
                            let key = entry.key().into_owned();
                            if let Err(err) = proxy::forward_udp(conn, entry, sock).await {
                                tracing::warn!(key = %key, err = %err, "client: udp forward ended");
                            }
                        });
                        addr
                    }
                    Err(err) => {
                        tracing::warn!(addr = %bind, err = %err, "client: udp bind failed");
                        continue;
                    }
                }
            } else {
                match TcpListener::bind(bind).await {
                    Ok(ln) => {
                        let addr = ln.local_addr().unwrap_or(bind);
                        tasks.spawn(accept_tcp(conn.mux.clone(), entry.clone(), ln));
                        addr
                    }
                    Err(err) => {
                        tracing::warn!(addr = %bind, err = %err, "client: tcp bind failed");
                        continue;
                    }
                }
            };
            tracing::info!(
                key = %entry.key(),
                protocol = entry.protocol(),
                listen = %listen,
                "client: forwarding"
            );
            out.push(ForwardedPort {
                entry: entry.clone(),
                listen,
            });
        }
        out
    }
}

async fn accept_tcp(mux: Mux, entry: PortMapEntry, ln: TcpListener) {
    loop {
        let (sock, peer) = match ln.accept().await {
            Ok(a) => a,
            Err(err) => {
                tracing::warn!(key = %entry.key(), err = %err, "client: accept failed");
                return;
            }
        };
        let mux = mux.clone();
        let entry = entry.clone();
        tokio::spawn(async move {
            if let Err(err) = proxy::forward_tcp(mux, entry, sock).await {
                tracing::debug!(peer = %peer, err = %err, "client: stream ended");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aefrp::{
        identity::Acl,
        tunnel::{
            host::{HostUplink, HostUplinkOptions},
            server::{LocalRoomOptions, RelayServer, ServerOptions},
        },
    };
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn tcp_echo() -> SocketAddr {
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = l.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut s, _)) = l.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = s.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    async fn serve_on_loopback(server: Arc<RelayServer>) -> SocketAddr {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((s, remote)) = ln.accept().await {
                tokio::spawn(server.accept(s, remote));
            }
        });
        addr
    }

    async fn wait_session(client: &Client) -> Arc<ClientSession> {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if let Some(s) = client.session() {
                    return s;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap()
    }

    async fn echo_through(addr: SocketAddr) {
        let mut s = tokio::net::TcpStream::connect(addr).await.unwrap();
        s.write_all(b"hello through the room").await.unwrap();
        let mut buf = [0u8; 22];
        tokio::time::timeout(Duration::from_secs(10), s.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"hello through the room");
    }

    fn room_ports(echo: SocketAddr) -> PortMap {
        PortMap::new(vec![
            PortMapEntry::new(echo.port(), Some("echo".into()), false).with_target(echo.to_string()),
        ])
        .unwrap()
    }

    #[tokio::test]
    async fn direct_join_forwards_tcp() {
        let echo = tcp_echo().await;
        let host_id = Identity::generate().unwrap();
        let host = RelayServer::new(&host_id, ServerOptions::default()).unwrap();
        host.add_local_room(LocalRoomOptions {
            name: "direct".into(),
            motd: "hello".into(),
            ports: room_ports(echo),
            acl: Acl::default(),
        })
        .unwrap();
        let host_addr = serve_on_loopback(host).await;

        let mut opts = ClientOptions::new(host_addr.to_string(), host_id.fingerprint());
        opts.port_overrides = vec![("echo".into(), 0)];
        let client = Arc::new(Client::new(&Identity::generate().unwrap(), opts).unwrap());
        let (_stop, shutdown) = tokio::sync::watch::channel(false);
        let runner = client.clone();
        tokio::spawn(async move { runner.run(shutdown).await });

        let session = wait_session(&client).await;
        assert_eq!(session.name, "direct");
        assert_eq!(session.motd, "hello");
        assert_eq!(session.ports.len(), 1);
        echo_through(session.ports[0].listen).await;
    }

    #[tokio::test]
    async fn relay_bridges_a_double_negotiation_to_the_host() {
        let echo = tcp_echo().await;

        let relay_id = Identity::generate().unwrap();
        let relay = RelayServer::new(&relay_id, ServerOptions::default()).unwrap();
        let relay_addr = serve_on_loopback(relay.clone()).await;

        let host_id = Identity::generate().unwrap();
        let host = RelayServer::new(&host_id, ServerOptions::default()).unwrap();
        host.add_local_room(LocalRoomOptions {
            name: "behind-nat".into(),
            motd: "bridged".into(),
            ports: room_ports(echo),
            acl: Acl::default(),
        })
        .unwrap();

        let (_stop, shutdown) = tokio::sync::watch::channel(false);
        let mut up = HostUplinkOptions::new(relay_addr.to_string());
        up.relay_fingerprint = Some(relay_id.fingerprint());
        let uplink = HostUplink::new(host.clone(), up).unwrap();
        let sd = shutdown.clone();
        tokio::spawn(async move { uplink.run(sd).await });

        // The room appears on the relay once the host announced it.
        tokio::time::timeout(Duration::from_secs(10), async {
            while !relay.room(&host_id.fingerprint()).is_some_and(|r| r.is_ready()) {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();

        let mut opts = ClientOptions::new(relay_addr.to_string(), host_id.fingerprint());
        opts.relay_fingerprint = Some(relay_id.fingerprint());
        opts.port_overrides = vec![("echo".into(), 0)];
        opts.name = "carol".into();
        let client = Arc::new(Client::new(&Identity::generate().unwrap(), opts).unwrap());
        let runner = client.clone();
        tokio::spawn(async move { runner.run(shutdown).await });

        let session = wait_session(&client).await;
        assert_eq!(session.name, "behind-nat");
        assert_eq!(session.motd, "bridged");
        echo_through(session.ports[0].listen).await;

        let members = host
            .room(&host_id.fingerprint())
            .unwrap()
            .snapshot()
            .members;
        assert!(members.iter().any(|m| m.name == "carol"));
    }

    #[tokio::test]
    async fn wrong_relay_fingerprint_is_a_peer_mismatch() {
        let relay = RelayServer::new(&Identity::generate().unwrap(), ServerOptions::default()).unwrap();
        let relay_addr = serve_on_loopback(relay).await;

        let tls = SecureConfig::new(&Identity::generate().unwrap()).unwrap();
        let io: BoxedStream = Box::new(tokio::net::TcpStream::connect(relay_addr).await.unwrap());
        let wanted = Fingerprint::from_bytes([3; 32]);
        let err = negotiate(io, &tls, wanted, Some(wanted)).await.err().unwrap();
        assert!(matches!(err, SecureError::PeerMismatch { .. }));
    }
}
