use std::{future::Future, net::SocketAddr, pin::Pin, sync::Arc, time::Duration};

use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::aefrp::{
    identity::{Acl, Fingerprint, Identity},
    telemetry::{self, ActiveSession},
    tunnel::{
        bridge,
        connection::{Connection, refuse_incoming},
        control::{ControlChannel, LOGIN_TIMEOUT, LoginRequest, command_queue},
        mux::{ErrorCode, Mux, MuxStream, Role},
        portmap::PortMap,
        protocol::{Method, status},
        proxy,
        room::{
            self, Admission, HostLink, Room, RoomInfo, RoomKind, RoomMap, RoomSnapshot,
            remove_room,
        },
        secure::{
            self, Extensions, HandshakeContext, HandshakeHooks, Reject, SecureConfig,
            SecureError, Stage, reason,
        },
        transport::{Transport, transport_by_name},
    },
};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub const SERVER_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const REMOTE_DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_BACKOFF: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Name this server logs in with, and the name of its own room.
    pub name: String,
    /// MOTD sent to hosts registering a room here.
    pub motd: String,
    pub handshake_timeout: Duration,
    pub idle_timeout: Duration,
    /// Every peer must pass this list.
    pub endpoint_whitelist: Acl,
    /// Peers allowed to create rooms.
    pub host_whitelist: Acl,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            name: "aefrp".to_string(),
            motd: String::new(),
            handshake_timeout: secure::HANDSHAKE_TIMEOUT,
            idle_timeout: SERVER_IDLE_TIMEOUT,
            endpoint_whitelist: Acl::default(),
            host_whitelist: Acl::default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LocalRoomOptions {
    pub name: String,
    pub motd: String,
    pub ports: PortMap,
    pub acl: Acl,
}

/// Rendezvous for rooms: accepts secure connections and decides, per handshake,
/// whether the peer hosts a room, joins one served here, or is bridged to a host.
pub struct RelayServer {
    opts: ServerOptions,
    tls: SecureConfig,
    rooms: RoomMap,
    conns: DashMap<u64, Mux>,
}

impl std::fmt::Debug for RelayServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayServer")
            .field("fingerprint", &self.tls.local_fingerprint())
            .field("rooms", &self.rooms.len())
            .finish_non_exhaustive()
    }
}

impl RelayServer {
    pub fn new(identity: &Identity, opts: ServerOptions) -> anyhow::Result<Arc<Self>> {
        Ok(Arc::new(Self {
            opts,
            tls: SecureConfig::new(identity)?,
            rooms: RoomMap::default(),
            conns: DashMap::new(),
        }))
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.tls.local_fingerprint()
    }

    pub fn tls(&self) -> &SecureConfig {
        &self.tls
    }

    pub fn room(&self, fp: &Fingerprint) -> Option<Arc<Room>> {
        self.rooms.get(fp).map(|r| r.value().clone())
    }

    pub fn rooms_snapshot(&self) -> Vec<RoomSnapshot> {
        let mut out: Vec<_> = self.rooms.iter().map(|r| r.value().snapshot()).collect();
        out.sort_by(|a, b| a.fingerprint.cmp(&b.fingerprint));
        out
    }

    pub fn connection_count(&self) -> usize {
        self.conns.len()
    }

    fn register(&self, room: Room) -> anyhow::Result<Arc<Room>> {
        use dashmap::mapref::entry::Entry;

        match self.rooms.entry(room.fingerprint) {
            Entry::Occupied(_) => {
                anyhow::bail!("relay: room {} already exists", room.fingerprint)
            }
            Entry::Vacant(v) => {
                let room = Arc::new(room);
                v.insert(room.clone());
                Ok(room)
            }
        }
    }

    /// Registers the room owned by this server itself. It is ready immediately and its
    /// ports are dialed from this process.
    pub fn add_local_room(&self, opts: LocalRoomOptions) -> anyhow::Result<Arc<Room>> {
        let info = RoomInfo {
            name: opts.name,
            motd: opts.motd,
            ports: opts.ports,
        };
        let room = self.register(Room::new(self.fingerprint(), RoomKind::Local, info, opts.acl))?;
        tracing::info!(
            room = %room.fingerprint,
            ports = room.info().ports.len(),
            "relay: local room added"
        );
        Ok(room)
    }

    /// Mirrors the room of the host at `host_addr`. A background dialer keeps a
    /// connection to the host, which then receives bridged peers.
    pub fn add_remote_room(
        self: &Arc<Self>,
        fingerprint: Fingerprint,
        host_addr: &str,
        transport: &str,
        shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> anyhow::Result<Arc<Room>> {
        let tr = transport_by_name(transport)?;
        let room = self.register(Room::new(
            fingerprint,
            RoomKind::Remote,
            RoomInfo::default(),
            Acl::default(),
        ))?;
        tokio::spawn(self.clone().run_remote_room(
            room.clone(),
            host_addr.trim().to_string(),
            tr,
            shutdown,
        ));
        Ok(room)
    }

    async fn run_remote_room(
        self: Arc<Self>,
        room: Arc<Room>,
        host_addr: String,
        tr: Arc<dyn Transport>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        let mut backoff = Duration::from_secs(1);
        loop {
            if *shutdown.borrow() {
                break;
            }
            let started = tokio::time::Instant::now();
            match self.remote_room_once(&room, &host_addr, tr.as_ref()).await {
                Ok(reason) => {
                    tracing::info!(room = %room.fingerprint.short(), host = %host_addr, reason = %reason, "relay: remote room disconnected");
                }
                Err(err) => {
                    tracing::warn!(
                        room = %room.fingerprint.short(),
                        host = %host_addr,
                        err = %err,
                        backoff = %humantime::format_duration(backoff),
                        "relay: remote room unreachable; retrying"
                    );
                }
            }
            room.set_ready(false);
            if started.elapsed() > MAX_BACKOFF {
                backoff = Duration::from_secs(1);
            }

            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
        remove_room(&self.rooms, &room);
    }

    async fn remote_room_once(
        &self,
        room: &Arc<Room>,
        host_addr: &str,
        tr: &dyn Transport,
    ) -> anyhow::Result<String> {
        let (io, peer_addr) = tokio::time::timeout(REMOTE_DIAL_TIMEOUT, tr.dial(host_addr))
            .await
            .map_err(|_| anyhow::anyhow!("relay: dial {host_addr} timed out"))??;
        let conn = secure::connect(io, &self.tls, Some(room.fingerprint), Some(room.fingerprint)).await?;

        let mux = Mux::new(conn.stream, Role::Initiator);
        let req = LoginRequest::new(Method::Create, self.opts.name.clone());
        let (ctl, welcome) = ControlChannel::login(&mux, &req, None).await?;
        let conn = Connection::new(conn.peer, peer_addr, mux.clone());
        conn.set_name(&welcome.name);

        room.set_info(RoomInfo {
            name: conn.name(),
            motd: welcome.motd,
            ports: welcome.ports.unwrap_or_default(),
        });
        let (control, rx) = command_queue();
        room.attach_host(HostLink {
            conn_id: conn.id,
            peer: conn.peer,
            control,
        });
        room.set_ready(true);
        self.conns.insert(conn.id, mux.clone());
        tracing::info!(
            room = %room.fingerprint.short(),
            name = %conn.name(),
            host = %peer_addr,
            "relay: remote room ready"
        );

        tokio::spawn(refuse_incoming(mux.clone()));
        let reason = ctl.serve(&mux, rx, self.opts.idle_timeout).await;
        room.detach_host(conn.id);
        self.conns.remove(&conn.id);
        Ok(reason)
    }

    /// Serves one raw connection. Boxed because pushed peers re-enter it.
    pub fn accept<S>(self: &Arc<Self>, io: S, remote: SocketAddr) -> BoxFuture<'static, anyhow::Result<()>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let this = self.clone();
        Box::pin(async move { this.serve_conn(io, remote).await })
    }

    async fn serve_conn<S>(self: Arc<Self>, io: S, remote: SocketAddr) -> anyhow::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        telemetry::connection_accepted();
        let acc = match secure::accept(io, remote, &self.tls, &*self, self.opts.handshake_timeout).await {
            Ok(acc) => acc,
            Err(SecureError::Rejected(reject)) => {
                telemetry::handshake_rejected(reject.reason());
                tracing::info!(peer = %remote, reason = %reject, "relay: handshake rejected");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        match acc.admission {
            Admission::Host(claim) => {
                let mux = Mux::new(acc.stream, Role::Responder);
                let conn = Connection::new(acc.peer, remote, mux);
                self.run_session(&conn, self.host_session(&conn, claim)).await
            }
            Admission::Member(room) => {
                let mux = Mux::new(acc.stream, Role::Responder);
                let conn = Connection::new(acc.peer, remote, mux);
                self.run_session(&conn, self.member_session(&conn, room)).await
            }
            Admission::Redirect(room) => {
                tracing::debug!(peer = %remote, room = %room.fingerprint.short(), "relay: bridging to host");
                bridge::splice(acc.stream, &room, remote).await
            }
        }
    }

    async fn run_session(
        &self,
        conn: &Arc<Connection>,
        session: impl Future<Output = anyhow::Result<String>>,
    ) -> anyhow::Result<()> {
        let _active = ActiveSession::start();
        self.conns.insert(conn.id, conn.mux.clone());
        let res = session.await;
        self.conns.remove(&conn.id);
        match res {
            Ok(reason) => {
                tracing::info!(conn = conn.id, name = %conn.name(), peer = %conn.remote, reason = %reason, "relay: connection closed");
                Ok(())
            }
            Err(err) => {
                conn.close(&err.to_string()).await;
                Err(err)
            }
        }
    }

    async fn host_session(&self, conn: &Arc<Connection>, claim: room::RoomClaim) -> anyhow::Result<String> {
        let (mut ctl, login) = ControlChannel::accept(&conn.mux).await?;
        if login.method != Method::Create {
            ctl.refuse(status::FORBIDDEN).await;
            anyhow::bail!("relay: room host must log in with CREATE");
        }
        conn.set_name(&login.name);
        let ann = ctl.read_announcement().await?;
        claim.room().set_info(RoomInfo {
            name: conn.name(),
            motd: ann.motd,
            ports: ann.ports,
        });
        ctl.welcome(&self.opts.name, &self.opts.motd, None).await?;

        let (control, rx) = command_queue();
        claim.room().attach_host(HostLink {
            conn_id: conn.id,
            peer: conn.peer,
            control,
        });
        claim.room().set_ready(true);
        let room = claim.commit();
        tracing::info!(
            room = %room.fingerprint,
            name = %conn.name(),
            ports = room.info().ports.len(),
            peer = %conn.remote,
            "relay: room registered"
        );

        tokio::spawn(refuse_incoming(conn.mux.clone()));
        let reason = ctl.serve(&conn.mux, rx, self.opts.idle_timeout).await;
        room.detach_host(conn.id);
        remove_room(&self.rooms, &room);
        tracing::info!(room = %room.fingerprint.short(), "relay: room removed");
        Ok(reason)
    }

    async fn member_session(self: &Arc<Self>, conn: &Arc<Connection>, room: Arc<Room>) -> anyhow::Result<String> {
        let (mut ctl, login) = ControlChannel::accept(&conn.mux).await?;
        conn.set_name(&login.name);
        let info = room.info();
        ctl.welcome(&info.name, &info.motd, Some(&info.ports)).await?;
        room.add_member(conn.member_info());
        tracing::info!(
            room = %room.fingerprint.short(),
            name = %conn.name(),
            peer = %conn.remote,
            method = login.method.as_str(),
            "relay: member joined"
        );

        let allow_push = login.method == Method::Create;
        let streams = tokio::spawn(self.clone().member_streams(conn.clone(), room.clone(), allow_push));
        let (_control, rx) = command_queue();
        let reason = ctl.serve(&conn.mux, rx, self.opts.idle_timeout).await;
        streams.abort();
        room.remove_member(conn.id);
        Ok(reason)
    }

    async fn member_streams(self: Arc<Self>, conn: Arc<Connection>, room: Arc<Room>, allow_push: bool) {
        while let Some(stream) = conn.mux.accept().await {
            let server = self.clone();
            let room = room.clone();
            tokio::spawn(async move {
                if let Err(err) = server.dispatch(stream, &room, allow_push).await {
                    tracing::debug!(err = %err, "relay: data stream ended");
                }
            });
        }
    }

    async fn dispatch(self: &Arc<Self>, stream: MuxStream, room: &Room, allow_push: bool) -> anyhow::Result<()> {
        let req = match tokio::time::timeout(LOGIN_TIMEOUT, stream.recv_headers()).await {
            Ok(req) => req?,
            Err(_) => {
                stream.reset(ErrorCode::Cancel).await;
                anyhow::bail!("relay: stream {} sent no headers", stream.id());
            }
        };
        match req.method() {
            Some(Method::Connect) if req.is_frp() => {
                proxy::serve_data_stream(stream, req, room.info().ports).await
            }
            Some(Method::Push) if allow_push && req.is_frp() => {
                bridge::accept_push(stream, &req, self).await
            }
            _ => {
                stream.reset(ErrorCode::Refused).await;
                Ok(())
            }
        }
    }

    /// Accepts raw connections from `transport` at `addr` until `shutdown` flips.
    pub async fn listen_and_serve(
        self: &Arc<Self>,
        addr: &str,
        transport: &str,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let tr = transport_by_name(transport)?;
        let ln = tr.listen(addr).await?;
        tracing::info!(
            addr = %addr,
            transport = %tr.name(),
            fingerprint = %self.fingerprint(),
            "relay: listening"
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                accepted = ln.accept() => {
                    let (io, remote) = match accepted {
                        Ok(a) => a,
                        Err(err) => {
                            tracing::warn!(err = %err, "relay: accept failed");
                            continue;
                        }
                    };
                    let fut = self.accept(io, remote);
                    tokio::spawn(async move {
                        if let Err(err) = fut.await {
                            tracing::debug!(peer = %remote, err = %err, "relay: connection ended with error");
                        }
                    });
                }
            }
        }

        self.close_all("server shutting down").await;
        Ok(())
    }

    /// Closes every live connection.
    pub async fn close_all(&self, reason: &str) {
        let muxes: Vec<Mux> = self.conns.iter().map(|c| c.value().clone()).collect();
        for mux in muxes {
            mux.close(reason).await;
        }
    }
}

impl HandshakeHooks for RelayServer {
    type Admission = Admission;

    fn verify_certificate(
        &self,
        _ctx: &HandshakeContext,
        fingerprint: &Fingerprint,
    ) -> Result<(), Reject> {
        if !self.opts.endpoint_whitelist.permits(fingerprint) {
            return Err(Reject::new(reason::SYSTEM_NOT_ALLOWED));
        }
        Ok(())
    }

    fn negotiate(
        &self,
        ctx: &HandshakeContext,
        extensions: &Extensions,
        stage: Stage,
    ) -> Result<Option<Admission>, Reject> {
        if stage != Stage::Finished {
            return Ok(None);
        }
        let peer = ctx.peer.ok_or_else(|| Reject::new(reason::SYSTEM_INTERNAL))?;
        room::resolve(
            &self.rooms,
            peer,
            extensions.target_room,
            &self.opts.host_whitelist,
        )
        .map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aefrp::tunnel::{
        control::Announcement,
        portmap::PortMapEntry,
        secure::{Connected, connect},
    };

    fn remote() -> SocketAddr {
        "127.0.0.1:5000".parse().unwrap()
    }

    async fn dial(
        server: &Arc<RelayServer>,
        who: &Identity,
        target: Option<Fingerprint>,
    ) -> Result<Connected<tokio::io::DuplexStream>, SecureError> {
        let (a, b) = tokio::io::duplex(1 << 20);
        let fut = server.accept(b, remote());
        tokio::spawn(fut);
        let tls = SecureConfig::new(who).unwrap();
        connect(a, &tls, target, None).await
    }

    fn rejected(r: Result<Connected<tokio::io::DuplexStream>, SecureError>) -> String {
        match r {
            Err(SecureError::HandshakeRejected(reason)) => reason,
            Err(other) => panic!("unexpected error: {other:?}"),
            Ok(_) => panic!("handshake unexpectedly accepted"),
        }
    }

    #[tokio::test]
    async fn local_room_serves_members() {
        let relay_id = Identity::generate().unwrap();
        let server = RelayServer::new(&relay_id, ServerOptions::default()).unwrap();
        let ports = PortMap::new(vec![PortMapEntry::new(80, Some("web".into()), false)]).unwrap();
        server
            .add_local_room(LocalRoomOptions {
                name: "home".into(),
                motd: "hi".into(),
                ports: ports.clone(),
                acl: Acl::default(),
            })
            .unwrap();

        let client = Identity::generate().unwrap();
        let conn = dial(&server, &client, Some(server.fingerprint())).await.unwrap();
        assert_eq!(conn.peer, server.fingerprint());

        let mux = Mux::new(conn.stream, Role::Initiator);
        let req = LoginRequest::new(Method::Connect, "bob");
        let (_ctl, welcome) = ControlChannel::login(&mux, &req, None).await.unwrap();
        assert_eq!(welcome.name, "home");
        assert_eq!(welcome.motd, "hi");
        assert_eq!(welcome.ports, Some(ports));

        let room = server.room(&server.fingerprint()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while room.member_count() == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(room.snapshot().members[0].name, "bob");
    }

    #[tokio::test]
    async fn handshake_reasons_reach_peers() {
        let relay_id = Identity::generate().unwrap();
        let allowed = Identity::generate().unwrap();
        let blocked = Identity::generate().unwrap();
        let stranger = Identity::generate().unwrap();

        let opts = ServerOptions {
            host_whitelist: Acl::whitelist([allowed.fingerprint()]),
            ..ServerOptions::default()
        };
        let server = RelayServer::new(&relay_id, opts).unwrap();
        let mut acl = Acl::whitelist([allowed.fingerprint(), blocked.fingerprint()]);
        acl.blacklist.insert(blocked.fingerprint());
        server
            .add_local_room(LocalRoomOptions {
                acl,
                ..LocalRoomOptions::default()
            })
            .unwrap();
        let own = Some(server.fingerprint());

        assert_eq!(
            rejected(dial(&server, &stranger, Some(Fingerprint::from_bytes([7; 32]))).await),
            reason::ROOM_NOT_FOUND
        );
        assert_eq!(rejected(dial(&server, &blocked, own).await), reason::ROOM_BLOCKED);
        assert_eq!(rejected(dial(&server, &stranger, own).await), reason::ROOM_NOT_ALLOWED);
        assert_eq!(rejected(dial(&server, &stranger, None).await), reason::SYSTEM_NOT_ALLOWED);
        assert!(dial(&server, &allowed, own).await.is_ok());
    }

    #[tokio::test]
    async fn endpoint_whitelist_applies_to_everyone() {
        let opts = ServerOptions {
            endpoint_whitelist: Acl::whitelist([Fingerprint::from_bytes([1; 32])]),
            ..ServerOptions::default()
        };
        let server = RelayServer::new(&Identity::generate().unwrap(), opts).unwrap();
        let who = Identity::generate().unwrap();
        assert_eq!(rejected(dial(&server, &who, None).await), reason::SYSTEM_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn hosted_rooms_are_unique_and_vanish_with_their_host() {
        let server = RelayServer::new(&Identity::generate().unwrap(), ServerOptions::default()).unwrap();
        let host = Identity::generate().unwrap();

        let conn = dial(&server, &host, None).await.unwrap();
        let mux = Mux::new(conn.stream, Role::Initiator);
        let ann = Announcement {
            motd: "hosted".into(),
            ports: PortMap::new(vec![PortMapEntry::new(25565, None, false)]).unwrap(),
        };
        let req = LoginRequest::new(Method::Create, "lan");
        let (_ctl, _) = ControlChannel::login(&mux, &req, Some(&ann)).await.unwrap();

        let room = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(r) = server.room(&host.fingerprint()).filter(|r| r.is_ready()) {
                    return r;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(room.info().name, "lan");
        assert_eq!(room.kind, RoomKind::Hosted);

        assert_eq!(
            rejected(dial(&server, &host, None).await),
            reason::ROOM_ALREADY_EXIST
        );

        mux.close("bye").await;
        tokio::time::timeout(Duration::from_secs(5), async {
            while server.room(&host.fingerprint()).is_some() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }
}
