//! Data streams: one mux stream per forwarded TCP connection, one per UDP port.

use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};

use bytes::Bytes;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpStream, UdpSocket},
    sync::mpsc,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};

use crate::aefrp::{
    net::{resolve_socket_addr, target_addr},
    telemetry,
    tunnel::{
        connection::Connection,
        datagram::{FrameAssembler, encode_datagram, encoded_len},
        mux::{ErrorCode, Mux, MuxError, MuxStream, RESUME_THRESHOLD, frame::MAX_FRAME_PAYLOAD},
        portmap::{PortMap, PortMapEntry},
        protocol::{Headers, Method, SCHEME, header, status},
    },
};

pub const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
const UDP_BUF: usize = 64 * 1024;
const UDP_BACKLOG: usize = 256;
const MAX_UDP_PEERS: usize = 64;
const UDP_PEER_IDLE: Duration = Duration::from_secs(120);
const UDP_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Request opening a data stream for `entry`.
pub fn connect_headers(entry: &PortMapEntry) -> Headers {
    Headers::new()
        .with(header::METHOD, Method::Connect.as_str())
        .with(header::SCHEME, SCHEME)
        .with(header::PATH, entry.key().into_owned())
        .with(header::PROTOCOL, entry.protocol())
}

fn status_headers(code: &str) -> Headers {
    Headers::new().with(header::STATUS, code)
}

/// Copies between `stream` and `local` until both directions finished.
///
/// Local EOF half-closes the stream with an empty final DATA frame; the peer's
/// END_STREAM shuts down the local write side. Any error resets the stream.
pub async fn pump<L>(stream: &MuxStream, local: L) -> Result<(), MuxError>
where
    L: AsyncRead + AsyncWrite,
{
    let (mut rd, mut wr) = tokio::io::split(local);

    let up = async {
        let mut buf = vec![0u8; MAX_FRAME_PAYLOAD];
        loop {
            let mut window = stream.send_window();
            if window <= 0 {
                window = stream.wait_send_window(RESUME_THRESHOLD).await?;
            }
            let cap = buf.len().min(window as usize);
            let n = rd.read(&mut buf[..cap]).await?;
            if n == 0 {
                stream.send_data(&[], true).await?;
                return Ok::<_, MuxError>(());
            }
            stream.send_data(&buf[..n], false).await?;
            telemetry::bytes_egress(n);
        }
    };

    let down = async {
        while let Some(chunk) = stream.recv_data().await? {
            wr.write_all(&chunk).await?;
            telemetry::bytes_ingress(chunk.len());
        }
        let _ = wr.shutdown().await;
        Ok::<_, MuxError>(())
    };

    if let Err(err) = tokio::try_join!(up, down) {
        stream.reset(ErrorCode::Cancel).await;
        return Err(err);
    }
    Ok(())
}

/// Sends one datagram record, or drops it when the send window cannot take it.
/// Returns whether it was sent.
pub async fn send_datagram(stream: &MuxStream, sender: u32, payload: &[u8]) -> Result<bool, MuxError> {
    let need = encoded_len(sender, payload.len()) as i64;
    if stream.send_window() < need {
        telemetry::udp_dropped();
        return Ok(false);
    }
    let record = match encode_datagram(sender, payload) {
        Ok(r) => r,
        Err(_) => {
            telemetry::udp_dropped();
            return Ok(false);
        }
    };
    let mut w = stream.mux().lock().await?;
    match w.send_data(stream, &record, false).await {
        Ok(()) => {
            telemetry::bytes_egress(payload.len());
            Ok(true)
        }
        Err(MuxError::FlowControl { .. }) => {
            telemetry::udp_dropped();
            Ok(false)
        }
        Err(err) => Err(err),
    }
}

/// Host side of a `CONNECT` data stream: resolves the port entry, dials its target and
/// pumps. Unknown keys get `404`, unreachable targets `502`.
pub async fn serve_data_stream(stream: MuxStream, req: Headers, ports: PortMap) -> anyhow::Result<()> {
    let key = req.get(header::PATH).unwrap_or_default();
    let entry = ports
        .get(key)
        .filter(|e| req.get(header::PROTOCOL).unwrap_or("tcp") == e.protocol())
        .cloned();
    let Some(entry) = entry else {
        tracing::debug!(key = %key, "proxy: unknown port mapping");
        stream.send_headers(&status_headers(status::NOT_FOUND), true).await?;
        return Ok(());
    };
    let target = target_addr(&entry.target, entry.port);

    if entry.udp {
        return run_udp_host(stream, &target).await;
    }

    let local = match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&target)).await {
        Ok(Ok(s)) => s,
        Ok(Err(err)) => {
            tracing::warn!(target = %target, err = %err, "proxy: dial failed");
            stream.send_headers(&status_headers(status::BAD_GATEWAY), true).await?;
            return Ok(());
        }
        Err(_) => {
            tracing::warn!(target = %target, "proxy: dial timed out");
            stream.send_headers(&status_headers(status::BAD_GATEWAY), true).await?;
            return Ok(());
        }
    };
    let _ = local.set_nodelay(true);
    stream.send_headers(&status_headers(status::OK), false).await?;
    pump(&stream, local).await?;
    Ok(())
}

/// Host side of a UDP port: one connected socket toward `target` per remote sender.
///
/// Any failure resets the stream: `PROTOCOL` for malformed records, `CANCEL` otherwise.
async fn run_udp_host(stream: MuxStream, target: &str) -> anyhow::Result<()> {
    let target = match resolve_socket_addr(target).await {
        Ok(t) => t,
        Err(err) => {
            tracing::warn!(target = %target, err = %err, "proxy: udp target unresolved");
            stream.send_headers(&status_headers(status::BAD_GATEWAY), true).await?;
            return Ok(());
        }
    };
    stream.send_headers(&status_headers(status::OK), false).await?;

    let (tx, mut rx) = mpsc::channel::<(u32, Bytes)>(UDP_BACKLOG);
    let mut peers = UdpPeers::new(target, MAX_UDP_PEERS, tx);
    let mut asm = FrameAssembler::default();
    let mut sweep = tokio::time::interval(UDP_SWEEP_INTERVAL);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let res: Result<(), (ErrorCode, anyhow::Error)> = loop {
        tokio::select! {
            chunk = stream.recv_data() => {
                let chunk = match chunk {
                    Ok(Some(c)) => c,
                    Ok(None) => break Ok(()),
                    Err(err) => break Err((ErrorCode::Cancel, err.into())),
                };
                asm.push(&chunk);
                if let Err(err) = deliver_to_target(&mut asm, &mut peers).await {
                    break Err(err);
                }
            }
            Some((sender, payload)) = rx.recv() => {
                peers.touch(sender);
                if let Err(err) = send_datagram(&stream, sender, &payload).await {
                    break Err((ErrorCode::Cancel, err.into()));
                }
            }
            _ = sweep.tick() => {
                let expired = peers.expire(UDP_PEER_IDLE);
                if expired > 0 {
                    tracing::debug!(target = %target, expired, "proxy: idle udp peers dropped");
                }
            }
        }
    };
    drop(peers);
    match res {
        Ok(()) => {
            let _ = stream.send_data(&[], true).await;
            Ok(())
        }
        Err((code, err)) => {
            tracing::warn!(target = %target, code = ?code, err = %err, "proxy: udp stream failed");
            stream.reset(code).await;
            Err(err)
        }
    }
}

/// Sends every complete record in `asm` to its sender's socket.
async fn deliver_to_target(
    asm: &mut FrameAssembler,
    peers: &mut UdpPeers,
) -> Result<(), (ErrorCode, anyhow::Error)> {
    loop {
        let (sender, payload) = match asm.next_datagram() {
            Ok(Some(d)) => d,
            Ok(None) => return Ok(()),
            Err(err) => return Err((ErrorCode::Protocol, err.into())),
        };
        telemetry::bytes_ingress(payload.len());
        let sock = match peers.socket_for(sender).await {
            Ok(Some(s)) => s,
            Ok(None) => {
                telemetry::udp_dropped();
                continue;
            }
            Err(err) => return Err((ErrorCode::Cancel, err.into())),
        };
        if let Err(err) = sock.send(&payload).await {
            tracing::debug!(sender, err = %err, "proxy: udp send to target failed");
        }
    }
}

struct UdpPeer {
    sock: Arc<UdpSocket>,
    reader: JoinHandle<()>,
    last_seen: Instant,
}

impl Drop for UdpPeer {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Sockets toward one UDP target keyed by remote sender id, at most `max` of them.
struct UdpPeers {
    target: SocketAddr,
    max: usize,
    peers: HashMap<u32, UdpPeer>,
    tx: mpsc::Sender<(u32, Bytes)>,
}

impl UdpPeers {
    fn new(target: SocketAddr, max: usize, tx: mpsc::Sender<(u32, Bytes)>) -> Self {
        Self {
            target,
            max,
            peers: HashMap::new(),
            tx,
        }
    }

    /// Socket of `sender`, connecting a new one when there is room. `None` while the
    /// table is full of live peers.
    async fn socket_for(&mut self, sender: u32) -> std::io::Result<Option<Arc<UdpSocket>>> {
        let now = Instant::now();
        if let Some(p) = self.peers.get_mut(&sender) {
            p.last_seen = now;
            return Ok(Some(p.sock.clone()));
        }
        if self.peers.len() >= self.max && self.expire(UDP_PEER_IDLE) == 0 {
            return Ok(None);
        }
        let sock = Arc::new(connect_udp(self.target).await?);
        let reader = tokio::spawn(udp_reader(sender, sock.clone(), self.tx.clone()));
        self.peers.insert(
            sender,
            UdpPeer {
                sock: sock.clone(),
                reader,
                last_seen: now,
            },
        );
        tracing::debug!(target = %self.target, sender, peers = self.peers.len(), "proxy: new udp peer");
        Ok(Some(sock))
    }

    fn touch(&mut self, sender: u32) {
        if let Some(p) = self.peers.get_mut(&sender) {
            p.last_seen = Instant::now();
        }
    }

    /// Drops peers silent in both directions for at least `idle`.
    fn expire(&mut self, idle: Duration) -> usize {
        let now = Instant::now();
        let before = self.peers.len();
        self.peers.retain(|_, p| now.duration_since(p.last_seen) < idle);
        before - self.peers.len()
    }
}

async fn connect_udp(target: SocketAddr) -> std::io::Result<UdpSocket> {
    let bind: SocketAddr = if target.is_ipv4() {
        ([0, 0, 0, 0], 0).into()
    } else {
        ([0u16; 8], 0).into()
    };
    let sock = UdpSocket::bind(bind).await?;
    sock.connect(target).await?;
    Ok(sock)
}

async fn udp_reader(sender: u32, sock: Arc<UdpSocket>, tx: mpsc::Sender<(u32, Bytes)>) {
    let mut buf = vec![0u8; UDP_BUF];
    loop {
        match sock.recv(&mut buf).await {
            Ok(n) => {
                if tx.send((sender, Bytes::copy_from_slice(&buf[..n]))).await.is_err() {
                    return;
                }
            }
            Err(err) => {
                tracing::debug!(sender, err = %err, "proxy: udp target recv failed");
                return;
            }
        }
    }
}

/// Client side: opens a data stream for `entry`, waits for `200`.
pub async fn open_data_stream(mux: &Mux, entry: &PortMapEntry) -> anyhow::Result<MuxStream> {
    let stream = mux.open_stream(&connect_headers(entry), false).await?;
    let resp = tokio::time::timeout(DIAL_TIMEOUT * 2, stream.recv_headers())
        .await
        .map_err(|_| anyhow::anyhow!("proxy: no response for {}", entry.key()))??;
    match resp.status() {
        Some(status::OK) => Ok(stream),
        code => {
            stream.reset(ErrorCode::Cancel).await;
            anyhow::bail!(
                "proxy: {} refused with status {}",
                entry.key(),
                code.unwrap_or("<none>")
            )
        }
    }
}

/// Client side of one accepted local TCP connection.
pub async fn forward_tcp(mux: Mux, entry: PortMapEntry, local: TcpStream) -> anyhow::Result<()> {
    let _ = local.set_nodelay(true);
    let stream = open_data_stream(&mux, &entry).await?;
    pump(&stream, local).await?;
    Ok(())
}

/// Client side of a UDP port: all local peers share `socket` and one data stream,
/// told apart by the connection's sender table.
pub async fn forward_udp(conn: Arc<Connection>, entry: PortMapEntry, socket: UdpSocket) -> anyhow::Result<()> {
    let stream = open_data_stream(&conn.mux, &entry).await?;
    let mut asm = FrameAssembler::default();
    let mut buf = vec![0u8; UDP_BUF];

    loop {
        tokio::select! {
            got = socket.recv_from(&mut buf) => {
                let (n, from) = got?;
                let sender = conn.udp_senders().id_for(from);
                send_datagram(&stream, sender, &buf[..n]).await?;
            }
            chunk = stream.recv_data() => {
                let Some(chunk) = chunk? else {
                    return Ok(());
                };
                asm.push(&chunk);
                while let Some((sender, payload)) = asm.next_datagram()? {
                    let to = conn.udp_senders().addr_of(sender);
                    match to {
                        Some(to) => {
                            telemetry::bytes_ingress(payload.len());
                            let _ = socket.send_to(&payload, to).await;
                        }
                        None => telemetry::udp_dropped(),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::aefrp::{
        identity::Fingerprint,
        tunnel::mux::{
            Role,
            frame::{FrameWriter, WINDOW_UPDATE},
        },
    };
    use tokio::net::TcpListener;

    fn pair() -> (Mux, Mux) {
        let (a, b) = tokio::io::duplex(1 << 20);
        (Mux::new(a, Role::Initiator), Mux::new(b, Role::Responder))
    }

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

    fn serve_host(host: Mux, ports: PortMap) {
        tokio::spawn(async move {
            while let Some(st) = host.accept().await {
                let ports = ports.clone();
                tokio::spawn(async move {
                    let req = st.recv_headers().await.unwrap();
                    let _ = serve_data_stream(st, req, ports).await;
                });
            }
        });
    }

    #[tokio::test]
    async fn tcp_backpressure_loses_nothing() {
        let echo = tcp_echo().await;
        let (client, host) = pair();
        let entry = PortMapEntry::new(echo.port(), Some("echo".into()), false)
            .with_target(echo.to_string());
        serve_host(host, PortMap::new(vec![entry.clone()]).unwrap());

        let stream = open_data_stream(&client, &entry).await.unwrap();
        let (near, mut far) = tokio::io::duplex(4096);
        let pumping = tokio::spawn(async move { pump(&stream, near).await });

        // Several windows worth, read back slowly through a small duplex buffer.
        let payload: Vec<u8> = (0..600_000u32).map(|i| (i % 251) as u8).collect();
        let (mut fr, mut fw) = tokio::io::split(&mut far);
        let expected = payload.clone();
        let writer = async move {
            fw.write_all(&payload).await.unwrap();
            fw.shutdown().await.unwrap();
        };
        let reader = async move {
            let mut got = Vec::new();
            fr.read_to_end(&mut got).await.unwrap();
            got
        };
        let ((), got) = tokio::join!(writer, reader);
        assert_eq!(got.len(), expected.len());
        assert!(got == expected);
        pumping.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn unknown_key_and_dead_target_are_reported() {
        let dead = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap()
        };
        let (client, host) = pair();
        let down = PortMapEntry::new(1, Some("down".into()), false).with_target(dead.to_string());
        serve_host(host, PortMap::new(vec![down.clone()]).unwrap());

        let missing = PortMapEntry::new(2, Some("missing".into()), false);
        let err = open_data_stream(&client, &missing).await.unwrap_err();
        assert!(err.to_string().contains(status::NOT_FOUND));
        let err = open_data_stream(&client, &down).await.unwrap_err();
        assert!(err.to_string().contains(status::BAD_GATEWAY));
    }

    #[tokio::test]
    async fn udp_peers_are_demultiplexed() {
        let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            while let Ok((n, from)) = echo.recv_from(&mut buf).await {
                let _ = echo.send_to(&buf[..n], from).await;
            }
        });

        let (client, host) = pair();
        let entry = PortMapEntry::new(echo_addr.port(), None, true).with_target(echo_addr.to_string());
        serve_host(host, PortMap::new(vec![entry.clone()]).unwrap());

        let conn = Connection::new(
            Fingerprint::from_bytes([1; 32]),
            "127.0.0.1:1".parse().unwrap(),
            client,
        );
        let front = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let front_addr = front.local_addr().unwrap();
        tokio::spawn(forward_udp(conn.clone(), entry, front));

        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut buf = [0u8; 64];
        for _ in 0..3 {
            a.send_to(b"from-a", front_addr).await.unwrap();
            b.send_to(b"from-b", front_addr).await.unwrap();
            let n = tokio::time::timeout(Duration::from_secs(5), a.recv(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(&buf[..n], b"from-a");
            let n = tokio::time::timeout(Duration::from_secs(5), b.recv(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(&buf[..n], b"from-b");
        }
        assert_eq!(conn.udp_senders().len(), 2);
    }

    #[tokio::test]
    async fn datagrams_beyond_the_window_are_dropped() {
        let (client, host) = pair();
        let stream = client
            .open_stream(&connect_headers(&PortMapEntry::new(9, None, true)), false)
            .await
            .unwrap();
        let _peer = host.accept().await.unwrap();

        let big = vec![0u8; 60_000];
        assert!(send_datagram(&stream, 0, &big).await.unwrap());
        // The window now holds less than a second record of the same size.
        assert!(!send_datagram(&stream, 0, &big).await.unwrap());
        assert!(send_datagram(&stream, 0, b"small").await.unwrap());
    }

    async fn eventually(mut cond: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    #[tokio::test]
    async fn tcp_reads_pause_at_zero_window_and_resume_above_threshold() {
        // The peer is a bare frame writer that never reads and never grants credit
        // on its own.
        let (a, raw) = tokio::io::duplex(1 << 20);
        let client = Mux::new(a, Role::Initiator);
        let (_rd, wr) = tokio::io::split(raw);
        let mut peer = FrameWriter::new(Box::new(wr));

        let entry = PortMapEntry::new(80, Some("web".into()), false);
        let stream = client.open_stream(&connect_headers(&entry), false).await.unwrap();
        let id = stream.id();
        let (near, mut far) = tokio::io::duplex(1024);
        let pumping = stream.clone();
        tokio::spawn(async move { pump(&pumping, near).await });

        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();
        tokio::spawn(async move {
            let chunk = [7u8; 1024];
            while far.write_all(&chunk).await.is_ok() {
                counter.fetch_add(chunk.len(), Ordering::SeqCst);
            }
        });

        eventually(|| stream.send_window() == 0).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let settled = accepted.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(accepted.load(Ordering::SeqCst), settled);

        peer.push(WINDOW_UPDATE, 0, id, &(RESUME_THRESHOLD as u32).to_be_bytes());
        peer.flush().await.unwrap();
        eventually(|| stream.send_window() == RESUME_THRESHOLD).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(stream.send_window(), RESUME_THRESHOLD);
        assert_eq!(accepted.load(Ordering::SeqCst), settled);

        peer.push(WINDOW_UPDATE, 0, id, &1u32.to_be_bytes());
        peer.flush().await.unwrap();
        eventually(|| accepted.load(Ordering::SeqCst) > settled).await;
        eventually(|| stream.send_window() == 0).await;
    }

    #[tokio::test(start_paused = true)]
    async fn udp_peers_are_capped_and_idle_ones_make_room() {
        let target = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (tx, _rx) = mpsc::channel(8);
        let mut peers = UdpPeers::new(target.local_addr().unwrap(), 2, tx);

        assert!(peers.socket_for(1).await.unwrap().is_some());
        assert!(peers.socket_for(2).await.unwrap().is_some());
        assert!(peers.socket_for(3).await.unwrap().is_none());

        tokio::time::advance(UDP_PEER_IDLE / 2).await;
        peers.touch(2);
        assert!(peers.socket_for(3).await.unwrap().is_none());

        tokio::time::advance(UDP_PEER_IDLE / 2).await;
        assert!(peers.socket_for(3).await.unwrap().is_some());
        assert_eq!(peers.peers.len(), 2);
        assert!(!peers.peers.contains_key(&1));
        assert!(peers.peers.contains_key(&2));

        tokio::time::advance(UDP_PEER_IDLE).await;
        assert_eq!(peers.expire(UDP_PEER_IDLE), 2);
        assert!(peers.peers.is_empty());
    }

    #[tokio::test]
    async fn malformed_udp_record_resets_the_stream() {
        let target = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = target.local_addr().unwrap();
        let (client, host) = pair();
        let entry = PortMapEntry::new(addr.port(), None, true).with_target(addr.to_string());
        serve_host(host, PortMap::new(vec![entry.clone()]).unwrap());

        let stream = open_data_stream(&client, &entry).await.unwrap();
        // A one byte record holding an unterminated sender varint.
        stream.send_data(&[0, 1, 0x80], false).await.unwrap();
        let got = tokio::time::timeout(Duration::from_secs(5), stream.recv_data())
            .await
            .unwrap();
        assert!(matches!(got, Err(MuxError::StreamReset(ErrorCode::Protocol))));
    }
}
