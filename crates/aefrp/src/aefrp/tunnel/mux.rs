//! Stream multiplexer carried over one secure connection.
//!
//! HTTP/2-shaped framing without HPACK or a connection-level window: every stream has
//! its own send and receive window starting at [`INITIAL_WINDOW`]. The connection
//! initiator owns odd stream ids (1 is the control stream), the responder even ids.

pub mod frame;
mod stream;

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError, atomic::Ordering},
    time::Duration,
};

use bytes::Bytes;
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{mpsc, oneshot, watch},
    time::Instant,
};

pub use frame::ErrorCode;
use frame::{
    DATA, FLAG_ACK, FLAG_END_STREAM, Frame, FrameWriter, GOAWAY, HEADERS, MAX_FRAME_PAYLOAD,
    PING, RST_STREAM, WINDOW_UPDATE,
};
use stream::StreamShared;
pub use stream::MuxStream;

use crate::aefrp::tunnel::protocol::Headers;

pub const INITIAL_WINDOW: i64 = 65536;
pub const REPLENISH_THRESHOLD: i64 = 32767;
pub const RESUME_THRESHOLD: i64 = 1400;

const ACCEPT_BACKLOG: usize = 64;
/// HEADERS blocks a stream may hold unread before the peer is considered abusive.
const MAX_PENDING_HEADERS: usize = 4;
const CLOSE_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum MuxError {
    #[error("connection closed")]
    Closed,
    #[error("stream reset ({0:?})")]
    StreamReset(ErrorCode),
    #[error("flow control: {len} bytes exceeds send window {window}")]
    FlowControl { len: usize, window: i64 },
    #[error("frame too large: {0}")]
    FrameTooLarge(usize),
    #[error("peer went away ({0:?})")]
    GoAway(ErrorCode),
    #[error("protocol: {0}")]
    Protocol(&'static str),
    #[error("ping timed out")]
    Timeout,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Dialed the connection; opens odd stream ids.
    Initiator,
    /// Accepted the connection; opens even stream ids.
    Responder,
}

struct StreamTable {
    streams: HashMap<u32, Arc<StreamShared>>,
    next_local: u32,
    last_remote: u32,
}

struct MuxInner {
    role: Role,
    writer: tokio::sync::Mutex<FrameWriter>,
    table: Mutex<StreamTable>,
    incoming: tokio::sync::Mutex<mpsc::Receiver<MuxStream>>,
    pings: Mutex<HashMap<u64, oneshot::Sender<()>>>,
    closed: watch::Sender<Option<String>>,
    last_rx: Mutex<Instant>,
}

#[derive(Clone)]
pub struct Mux {
    inner: Arc<MuxInner>,
}

impl std::fmt::Debug for Mux {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mux")
            .field("role", &self.inner.role)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Mux {
    /// Starts multiplexing over `io` and spawns the frame reader.
    pub fn new<S>(io: S, role: Role) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (rd, wr) = tokio::io::split(io);
        let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);
        let (closed, _) = watch::channel(None);
        let next_local = match role {
            Role::Initiator => 1,
            Role::Responder => 2,
        };
        let mux = Mux {
            inner: Arc::new(MuxInner {
                role,
                writer: tokio::sync::Mutex::new(FrameWriter::new(Box::new(wr))),
                table: Mutex::new(StreamTable {
                    streams: HashMap::new(),
                    next_local,
                    last_remote: 0,
                }),
                incoming: tokio::sync::Mutex::new(rx),
                pings: Mutex::new(HashMap::new()),
                closed,
                last_rx: Mutex::new(Instant::now()),
            }),
        };
        tokio::spawn(read_loop(mux.clone(), rd, tx));
        mux
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    fn table(&self) -> MutexGuard<'_, StreamTable> {
        self.inner.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pings(&self) -> MutexGuard<'_, HashMap<u64, oneshot::Sender<()>>> {
        self.inner.pings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stream(&self, id: u32) -> Option<Arc<StreamShared>> {
        self.table().streams.get(&id).cloned()
    }

    /// Time since the last frame arrived from the peer.
    pub fn idle(&self) -> Duration {
        self.inner
            .last_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    fn touch(&self) {
        *self
            .inner
            .last_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    #[cfg(test)]
    pub fn stream_count(&self) -> usize {
        self.table().streams.len()
    }

    fn is_peer_id(&self, id: u32) -> bool {
        id != 0
            && match self.inner.role {
                Role::Initiator => id % 2 == 0,
                Role::Responder => id % 2 == 1,
            }
    }

    /// Acquires the connection write lock.
    pub async fn lock(&self) -> Result<WriteGuard<'_>, MuxError> {
        let w = self.inner.writer.lock().await;
        if self.is_closed() {
            return Err(MuxError::Closed);
        }
        Ok(WriteGuard { mux: self, w })
    }

    pub async fn open_stream(&self, headers: &Headers, end_stream: bool) -> Result<MuxStream, MuxError> {
        let mut w = self.lock().await?;
        w.open_stream(headers, end_stream).await
    }

    /// Next stream opened by the peer; `None` once the connection is closed.
    pub async fn accept(&self) -> Option<MuxStream> {
        self.inner.incoming.lock().await.recv().await
    }

    /// Round trip of a PING with a random payload.
    pub async fn ping(&self, timeout: Duration) -> Result<Duration, MuxError> {
        let token: u64 = rand::random();
        let (tx, rx) = oneshot::channel();
        self.pings().insert(token, tx);
        let start = Instant::now();

        let sent = async {
            let mut w = self.lock().await?;
            w.w.push(PING, 0, 0, &token.to_be_bytes());
            w.flush().await
        }
        .await;
        if let Err(err) = sent {
            self.pings().remove(&token);
            return Err(err);
        }

        let res = tokio::time::timeout(timeout, rx).await;
        self.pings().remove(&token);
        match res {
            Ok(Ok(())) => Ok(start.elapsed()),
            Ok(Err(_)) => Err(MuxError::Closed),
            Err(_) => Err(MuxError::Timeout),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.borrow().is_some()
    }

    /// Resolves with the close reason once the connection is gone.
    pub async fn closed(&self) -> String {
        let mut rx = self.inner.closed.subscribe();
        match rx.wait_for(|c| c.is_some()).await {
            Ok(reason) => (*reason).clone().unwrap_or_default(),
            Err(_) => String::new(),
        }
    }

    /// Sends GOAWAY and resets every live stream with `NoError`.
    pub async fn close(&self, reason: &str) {
        // Take the writer before flagging closed so in-flight writes finish first.
        let goaway = async {
            let mut w = self.inner.writer.lock().await;
            if !self.shutdown_local(reason.to_string()) {
                return;
            }
            let last = self.table().last_remote;
            let mut p = [0u8; 8];
            p[..4].copy_from_slice(&last.to_be_bytes());
            p[4..].copy_from_slice(&ErrorCode::NoError.as_u32().to_be_bytes());
            w.push(GOAWAY, 0, 0, &p);
            let _ = w.shutdown().await;
        };
        if tokio::time::timeout(CLOSE_GRACE, goaway).await.is_err() {
            self.shutdown_local(reason.to_string());
        }
    }

    /// Flags the connection closed and fails every stream and ping. Returns false when
    /// it was already closed.
    fn shutdown_local(&self, reason: String) -> bool {
        let mut first = false;
        self.inner.closed.send_if_modified(|c| {
            if c.is_none() {
                *c = Some(reason);
                first = true;
                true
            } else {
                false
            }
        });
        if !first {
            return false;
        }
        let streams: Vec<_> = self.table().streams.drain().map(|(_, s)| s).collect();
        for s in streams {
            s.mark_reset(ErrorCode::NoError);
        }
        self.pings().clear();
        true
    }

    fn retire(&self, shared: &StreamShared) {
        if shared.is_done() {
            self.table().streams.remove(&shared.id);
        }
    }

    fn spawn_stream_error(&self, id: u32, code: ErrorCode) {
        if let Some(s) = self.table().streams.remove(&id) {
            s.mark_reset(code);
        }
        let mux = self.clone();
        tokio::spawn(async move {
            if let Ok(mut w) = mux.lock().await {
                w.w.push(RST_STREAM, 0, id, &code.as_u32().to_be_bytes());
                let _ = w.flush().await;
            }
        });
    }

    fn dispatch(&self, f: Frame, incoming: &mpsc::Sender<MuxStream>) -> Result<(), MuxError> {
        match f.kind {
            DATA => self.on_data(f),
            HEADERS => self.on_headers(f, incoming),
            RST_STREAM => {
                let code = read_u32(&f.payload)?;
                if let Some(s) = self.table().streams.remove(&f.stream_id) {
                    s.mark_reset(ErrorCode::from_u32(code));
                }
                Ok(())
            }
            PING => {
                let token: [u8; 8] = f.payload[..]
                    .try_into()
                    .map_err(|_| MuxError::Protocol("ping payload must be 8 bytes"))?;
                if f.has(FLAG_ACK) {
                    if let Some(tx) = self.pings().remove(&u64::from_be_bytes(token)) {
                        let _ = tx.send(());
                    }
                } else {
                    let mux = self.clone();
                    tokio::spawn(async move {
                        if let Ok(mut w) = mux.lock().await {
                            w.w.push(PING, FLAG_ACK, 0, &token);
                            let _ = w.flush().await;
                        }
                    });
                }
                Ok(())
            }
            GOAWAY => {
                if f.payload.len() < 8 {
                    return Err(MuxError::Protocol("short goaway"));
                }
                let code = read_u32(&f.payload[4..])?;
                Err(MuxError::GoAway(ErrorCode::from_u32(code)))
            }
            WINDOW_UPDATE => {
                let inc = read_u32(&f.payload)? & 0x7fff_ffff;
                if let Some(s) = self.stream(f.stream_id) {
                    s.send_window.fetch_add(inc as i64, Ordering::AcqRel);
                    s.send_notify.notify_one();
                    s.send_notify.notify_waiters();
                }
                Ok(())
            }
            // Unknown frame types are ignored.
            _ => Ok(()),
        }
    }

    fn on_data(&self, f: Frame) -> Result<(), MuxError> {
        // Late data for a forgotten stream is dropped.
        let Some(s) = self.stream(f.stream_id) else {
            return Ok(());
        };
        let len = f.payload.len() as i64;
        let fin = f.has(FLAG_END_STREAM);
        let overflow = {
            let mut st = s.recv();
            if st.reset.is_some() || st.fin {
                return Ok(());
            }
            if len > st.window {
                true
            } else {
                st.window -= len;
                if !f.payload.is_empty() {
                    st.chunks.push_back(f.payload);
                }
                st.fin = fin;
                false
            }
        };
        if overflow {
            self.spawn_stream_error(f.stream_id, ErrorCode::FlowControl);
            return Ok(());
        }
        s.recv_notify.notify_one();
        if fin {
            self.retire(&s);
        }
        Ok(())
    }

    fn on_headers(&self, f: Frame, incoming: &mpsc::Sender<MuxStream>) -> Result<(), MuxError> {
        let fin = f.has(FLAG_END_STREAM);
        let Ok(headers) = Headers::decode(f.payload) else {
            self.spawn_stream_error(f.stream_id, ErrorCode::Protocol);
            return Ok(());
        };

        if let Some(s) = self.stream(f.stream_id) {
            let overflow = {
                let mut st = s.recv();
                if st.headers.len() >= MAX_PENDING_HEADERS {
                    true
                } else {
                    st.headers.push_back(headers);
                    st.fin |= fin;
                    false
                }
            };
            if overflow {
                self.spawn_stream_error(f.stream_id, ErrorCode::Protocol);
                return Ok(());
            }
            s.recv_notify.notify_one();
            if fin {
                self.retire(&s);
            }
            return Ok(());
        }

        if !self.is_peer_id(f.stream_id) {
            return Ok(());
        }
        let shared = {
            let mut t = self.table();
            if f.stream_id <= t.last_remote {
                return Ok(());
            }
            t.last_remote = f.stream_id;
            let shared = Arc::new(StreamShared::new(f.stream_id));
            {
                let mut st = shared.recv();
                st.headers.push_back(headers);
                st.fin = fin;
            }
            t.streams.insert(f.stream_id, shared.clone());
            shared
        };
        let stream = MuxStream {
            shared,
            mux: self.clone(),
        };
        if incoming.try_send(stream).is_err() {
            self.spawn_stream_error(f.stream_id, ErrorCode::Refused);
        }
        Ok(())
    }
}

fn read_u32(p: &[u8]) -> Result<u32, MuxError> {
    let b: [u8; 4] = p
        .get(..4)
        .and_then(|s| s.try_into().ok())
        .ok_or(MuxError::Protocol("short frame payload"))?;
    Ok(u32::from_be_bytes(b))
}

async fn read_loop<R>(mux: Mux, mut rd: R, incoming: mpsc::Sender<MuxStream>)
where
    R: AsyncRead + Unpin,
{
    let mut closed = mux.inner.closed.subscribe();
    let reason = loop {
        let frame = tokio::select! {
            r = frame::read_frame(&mut rd) => r,
            _ = closed.wait_for(|c| c.is_some()) => return,
        };
        match frame {
            Ok(f) => {
                mux.touch();
                if let Err(err) = mux.dispatch(f, &incoming) {
                    break err.to_string();
                }
            }
            Err(MuxError::Io(err)) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                break "peer closed".to_string();
            }
            Err(err) => break err.to_string(),
        }
    };
    tracing::debug!(role = ?mux.role(), reason = %reason, "mux: connection closed");
    mux.shutdown_local(reason);
}

/// Holder of the connection write lock.
pub struct WriteGuard<'a> {
    mux: &'a Mux,
    w: tokio::sync::MutexGuard<'a, FrameWriter>,
}

impl WriteGuard<'_> {
    async fn flush(&mut self) -> Result<(), MuxError> {
        if let Err(err) = self.w.flush().await {
            self.mux.shutdown_local(format!("write failed: {err}"));
            return Err(err.into());
        }
        Ok(())
    }

    fn push_headers(&mut self, id: u32, headers: &Headers, end_stream: bool) -> Result<(), MuxError> {
        let block: Bytes = headers.encode();
        if block.len() > MAX_FRAME_PAYLOAD {
            return Err(MuxError::Protocol("header block too large"));
        }
        let flags = if end_stream { FLAG_END_STREAM } else { 0 };
        self.w.push(HEADERS, flags, id, &block);
        Ok(())
    }

    /// Allocates the next local stream id and sends its opening HEADERS.
    pub async fn open_stream(&mut self, headers: &Headers, end_stream: bool) -> Result<MuxStream, MuxError> {
        let shared = {
            let mut t = self.mux.table();
            let id = t.next_local;
            t.next_local = id
                .checked_add(2)
                .filter(|n| *n <= 0x7fff_ffff)
                .ok_or(MuxError::Protocol("stream ids exhausted"))?;
            let shared = Arc::new(StreamShared::new(id));
            t.streams.insert(id, shared.clone());
            shared
        };
        if end_stream {
            shared.local_fin.store(true, Ordering::Release);
        }
        let stream = MuxStream {
            shared,
            mux: self.mux.clone(),
        };
        if let Err(err) = self.push_headers(stream.id(), headers, end_stream) {
            self.mux.table().streams.remove(&stream.id());
            return Err(err);
        }
        self.flush().await?;
        Ok(stream)
    }

    pub async fn send_headers(
        &mut self,
        stream: &MuxStream,
        headers: &Headers,
        end_stream: bool,
    ) -> Result<(), MuxError> {
        if let Some(code) = stream.shared.reset_code() {
            return Err(MuxError::StreamReset(code));
        }
        self.push_headers(stream.id(), headers, end_stream)?;
        if end_stream {
            stream.shared.local_fin.store(true, Ordering::Release);
        }
        self.flush().await?;
        if end_stream {
            self.mux.retire(&stream.shared);
        }
        Ok(())
    }

    /// Sends `data`, split into frames. Exceeding the send window is an error.
    pub async fn send_data(&mut self, stream: &MuxStream, data: &[u8], is_final: bool) -> Result<(), MuxError> {
        if let Some(code) = stream.shared.reset_code() {
            return Err(MuxError::StreamReset(code));
        }
        let window = stream.send_window();
        if data.len() as i64 > window {
            return Err(MuxError::FlowControl {
                len: data.len(),
                window,
            });
        }
        if data.is_empty() && !is_final {
            return Ok(());
        }
        stream
            .shared
            .send_window
            .fetch_sub(data.len() as i64, Ordering::AcqRel);

        let id = stream.id();
        if data.is_empty() {
            self.w.push(DATA, FLAG_END_STREAM, id, &[]);
        } else {
            let n = data.len().div_ceil(MAX_FRAME_PAYLOAD);
            for (i, chunk) in data.chunks(MAX_FRAME_PAYLOAD).enumerate() {
                let flags = if is_final && i + 1 == n { FLAG_END_STREAM } else { 0 };
                self.w.push(DATA, flags, id, chunk);
            }
        }
        if is_final {
            stream.shared.local_fin.store(true, Ordering::Release);
        }
        self.flush().await?;
        if is_final {
            self.mux.retire(&stream.shared);
        }
        Ok(())
    }

    pub async fn send_window_update(&mut self, id: u32, increment: u32) -> Result<(), MuxError> {
        self.w.push(WINDOW_UPDATE, 0, id, &increment.to_be_bytes());
        self.flush().await
    }

    /// Resets stream `id` locally and tells the peer.
    pub async fn stream_error(&mut self, id: u32, code: ErrorCode) -> Result<(), MuxError> {
        if let Some(s) = self.mux.table().streams.remove(&id) {
            s.mark_reset(code);
        }
        self.w.push(RST_STREAM, 0, id, &code.as_u32().to_be_bytes());
        self.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aefrp::tunnel::protocol::{SCHEME, header};

    fn pair() -> (Mux, Mux) {
        let (a, b) = tokio::io::duplex(1 << 20);
        (Mux::new(a, Role::Initiator), Mux::new(b, Role::Responder))
    }

    fn req(path: &str) -> Headers {
        Headers::new()
            .with(header::SCHEME, SCHEME)
            .with(header::PATH, path)
    }

    #[tokio::test]
    async fn streams_carry_headers_and_data_with_half_close() {
        let (c, s) = pair();
        let out = c.open_stream(&req("a"), false).await.unwrap();
        assert_eq!(out.id(), 1);
        let out2 = c.open_stream(&req("b"), false).await.unwrap();
        assert_eq!(out2.id(), 3);

        let inc = s.accept().await.unwrap();
        assert_eq!(inc.id(), 1);
        assert_eq!(inc.recv_headers().await.unwrap().get(header::PATH), Some("a"));

        out.send_data(b"hello", true).await.unwrap();
        assert_eq!(&inc.recv_data().await.unwrap().unwrap()[..], b"hello");
        assert!(inc.recv_data().await.unwrap().is_none());

        inc.send_headers(&Headers::new().with(header::STATUS, "200"), false)
            .await
            .unwrap();
        inc.send_data(b"bye", true).await.unwrap();
        assert_eq!(out.recv_headers().await.unwrap().status(), Some("200"));
        assert_eq!(&out.recv_data().await.unwrap().unwrap()[..], b"bye");
        assert!(out.recv_data().await.unwrap().is_none());

        let pushed = s.open_stream(&req("p"), true).await.unwrap();
        assert_eq!(pushed.id(), 2);
        let got = c.accept().await.unwrap();
        assert_eq!(got.id(), 2);
    }

    #[tokio::test]
    async fn sending_past_the_window_is_refused_until_consumed() {
        let (c, s) = pair();
        let out = c.open_stream(&req("bulk"), false).await.unwrap();
        let inc = s.accept().await.unwrap();

        let block = vec![7u8; INITIAL_WINDOW as usize];
        out.send_data(&block, false).await.unwrap();
        assert_eq!(out.send_window(), 0);
        assert!(matches!(
            out.send_data(b"x", false).await,
            Err(MuxError::FlowControl { len: 1, window: 0 })
        ));

        let mut got = 0usize;
        while got < block.len() {
            got += inc.recv_data().await.unwrap().unwrap().len();
        }
        assert_eq!(got, block.len());
        assert!(inc.recv_window() > REPLENISH_THRESHOLD);

        let w = out.wait_send_window(RESUME_THRESHOLD).await.unwrap();
        assert!(w > RESUME_THRESHOLD);
        out.send_data(b"more", true).await.unwrap();
        assert_eq!(&inc.recv_data().await.unwrap().unwrap()[..], b"more");
    }

    #[tokio::test]
    async fn ping_measures_round_trip() {
        let (c, s) = pair();
        let rtt = c.ping(Duration::from_secs(5)).await.unwrap();
        assert!(rtt < Duration::from_secs(5));
        s.ping(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn close_resets_streams_on_both_sides() {
        let (c, s) = pair();
        let out = c.open_stream(&req("x"), false).await.unwrap();
        let inc = s.accept().await.unwrap();

        c.close("shutdown").await;
        assert!(c.is_closed());
        assert!(matches!(
            out.recv_data().await,
            Err(MuxError::StreamReset(ErrorCode::NoError))
        ));

        let reason = s.closed().await;
        assert!(!reason.is_empty());
        assert!(matches!(
            inc.recv_data().await,
            Err(MuxError::StreamReset(ErrorCode::NoError))
        ));
        assert!(s.accept().await.is_none());
        assert!(matches!(
            c.ping(Duration::from_secs(1)).await,
            Err(MuxError::Closed)
        ));
    }

    #[tokio::test]
    async fn reset_reaches_the_peer() {
        let (c, s) = pair();
        let out = c.open_stream(&req("x"), false).await.unwrap();
        let inc = s.accept().await.unwrap();
        inc.reset(ErrorCode::Refused).await;
        assert!(matches!(
            out.recv_data().await,
            Err(MuxError::StreamReset(ErrorCode::Refused))
        ));
        assert_eq!(c.stream_count(), 0);
    }

    #[tokio::test]
    async fn data_over_receive_window_is_answered_with_rst() {
        let (raw, b) = tokio::io::duplex(1 << 20);
        let s = Mux::new(b, Role::Responder);
        let (mut rd, wr) = tokio::io::split(raw);
        let mut w = FrameWriter::new(Box::new(wr));

        w.push(HEADERS, 0, 1, &req("x").encode());
        let chunk = vec![0u8; MAX_FRAME_PAYLOAD];
        for _ in 0..5 {
            w.push(DATA, 0, 1, &chunk);
        }
        w.flush().await.unwrap();

        let inc = s.accept().await.unwrap();
        let f = frame::read_frame(&mut rd).await.unwrap();
        assert_eq!(f.kind, RST_STREAM);
        assert_eq!(f.stream_id, 1);
        assert_eq!(read_u32(&f.payload).unwrap(), ErrorCode::FlowControl.as_u32());
        assert!(inc.is_reset());
    }

    #[tokio::test]
    async fn headers_flood_on_one_stream_is_answered_with_rst() {
        let (raw, b) = tokio::io::duplex(1 << 20);
        let s = Mux::new(b, Role::Responder);
        let (mut rd, wr) = tokio::io::split(raw);
        let mut w = FrameWriter::new(Box::new(wr));

        for _ in 0..=MAX_PENDING_HEADERS {
            w.push(HEADERS, 0, 1, &req("x").encode());
        }
        w.flush().await.unwrap();

        let inc = s.accept().await.unwrap();
        let f = frame::read_frame(&mut rd).await.unwrap();
        assert_eq!(f.kind, RST_STREAM);
        assert_eq!(f.stream_id, 1);
        assert_eq!(read_u32(&f.payload).unwrap(), ErrorCode::Protocol.as_u32());
        assert!(inc.is_reset());
        assert_eq!(s.stream_count(), 0);
    }
}
