use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::aefrp::tunnel::portmap::{PortMap, PortMapEntry, PortMapError};

pub const SCHEME: &str = "Frp";
pub const SERVER_SOFTWARE: &str = concat!("aefrp/", env!("CARGO_PKG_VERSION"));
pub const PROTOCOL_VERSION: &str = "1";

pub const MAX_PORTS: usize = 16;
pub const MAX_RECORD_BYTES: usize = 8192;
pub const MAX_REASON_BYTES: usize = 1024;

pub const TAG_MOTD: &str = "frp:motd";
pub const TAG_PORT: &str = "frp:port";

/// Header names used on control and data streams.
pub mod header {
    pub const METHOD: &str = ":method";
    pub const SCHEME: &str = ":scheme";
    pub const AUTHORITY: &str = ":authority";
    pub const PATH: &str = ":path";
    pub const STATUS: &str = ":status";
    pub const SERVER: &str = "server";
    pub const VERSION: &str = "version";
    pub const PROTOCOL: &str = "protocol";
    pub const ENDPOINT_IP: &str = "endpoint-ip";
}

pub mod status {
    pub const OK: &str = "200";
    pub const BAD_REQUEST: &str = "400";
    pub const FORBIDDEN: &str = "403";
    pub const NOT_FOUND: &str = "404";
    pub const BAD_GATEWAY: &str = "502";
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("truncated input")]
    Truncated,
    #[error("varint too long")]
    VarintTooLong,
    #[error("string is not valid utf-8")]
    BadUtf8,
    #[error("record too large: {0}")]
    RecordTooLarge(usize),
    #[error("unknown verdict code {0}")]
    BadVerdict(u8),
    #[error("port map: {0}")]
    PortMap(#[from] PortMapError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Connect,
    Create,
    Push,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Connect => "CONNECT",
            Method::Create => "CREATE",
            Method::Push => "PUSH",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CONNECT" => Some(Method::Connect),
            "CREATE" => Some(Method::Create),
            "PUSH" => Some(Method::Push),
            _ => None,
        }
    }
}

pub fn put_varint<B: BufMut>(buf: &mut B, mut v: u32) {
    loop {
        let b = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            buf.put_u8(b);
            return;
        }
        buf.put_u8(b | 0x80);
    }
}

pub fn varint_len(v: u32) -> usize {
    match v {
        0..=0x7f => 1,
        0x80..=0x3fff => 2,
        0x4000..=0x1f_ffff => 3,
        0x20_0000..=0x0fff_ffff => 4,
        _ => 5,
    }
}

pub fn get_varint<B: Buf>(buf: &mut B) -> Result<u32, ProtocolError> {
    let mut out: u32 = 0;
    for i in 0..5 {
        if !buf.has_remaining() {
            return Err(ProtocolError::Truncated);
        }
        let b = buf.get_u8();
        out |= ((b & 0x7f) as u32) << (7 * i);
        if b & 0x80 == 0 {
            return Ok(out);
        }
    }
    Err(ProtocolError::VarintTooLong)
}

pub fn put_str<B: BufMut>(buf: &mut B, s: &str) {
    put_varint(buf, s.len() as u32);
    buf.put_slice(s.as_bytes());
}

pub fn get_str<B: Buf>(buf: &mut B) -> Result<String, ProtocolError> {
    let n = get_varint(buf)? as usize;
    if buf.remaining() < n {
        return Err(ProtocolError::Truncated);
    }
    let mut raw = vec![0u8; n];
    buf.copy_to_slice(&mut raw);
    String::from_utf8(raw).map_err(|_| ProtocolError::BadUtf8)
}

/// Ordered header list carried by HEADERS frames.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    /// Replaces an existing value or appends.
    pub fn insert(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.0.iter_mut().find(|(n, _)| n == name) {
            Some((_, v)) => *v = value,
            None => self.0.push((name.to_string(), value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn method(&self) -> Option<Method> {
        self.get(header::METHOD).and_then(Method::parse)
    }

    pub fn status(&self) -> Option<&str> {
        self.get(header::STATUS)
    }

    pub fn is_frp(&self) -> bool {
        self.get(header::SCHEME) == Some(SCHEME)
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        put_varint(&mut buf, self.0.len() as u32);
        for (n, v) in &self.0 {
            put_str(&mut buf, n);
            put_str(&mut buf, v);
        }
        buf.freeze()
    }

    pub fn decode(mut b: Bytes) -> Result<Self, ProtocolError> {
        let n = get_varint(&mut b)? as usize;
        // Each pair needs at least two length bytes.
        if n > b.remaining() / 2 {
            return Err(ProtocolError::Truncated);
        }
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            let name = get_str(&mut b)?;
            let value = get_str(&mut b)?;
            out.push((name, value));
        }
        Ok(Self(out))
    }
}

/// Application record exchanged on the control stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Motd(String),
    Ports(PortMap),
    /// Tag this build does not understand; skipped by readers.
    Unknown(String),
}

impl Record {
    pub fn tag(&self) -> &str {
        match self {
            Record::Motd(_) => TAG_MOTD,
            Record::Ports(_) => TAG_PORT,
            Record::Unknown(tag) => tag,
        }
    }

    /// `u16 len | u8 tagLen | tag | body`, where `len` counts everything after itself.
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let tag = self.tag();
        let mut body = BytesMut::new();
        match self {
            Record::Motd(text) => body.put_slice(text.as_bytes()),
            Record::Ports(ports) => encode_ports(ports, &mut body),
            Record::Unknown(_) => {}
        }
        let len = 1 + tag.len() + body.len();
        if len > MAX_RECORD_BYTES {
            return Err(ProtocolError::RecordTooLarge(len));
        }
        let mut out = BytesMut::with_capacity(2 + len);
        out.put_u16(len as u16);
        out.put_u8(tag.len() as u8);
        out.put_slice(tag.as_bytes());
        out.put_slice(&body);
        Ok(out.freeze())
    }

    fn decode(tag: String, body: Bytes) -> Result<Self, ProtocolError> {
        match tag.as_str() {
            TAG_MOTD => String::from_utf8(body.to_vec())
                .map(Record::Motd)
                .map_err(|_| ProtocolError::BadUtf8),
            TAG_PORT => decode_ports(body).map(Record::Ports),
            _ => Ok(Record::Unknown(tag)),
        }
    }
}

fn encode_ports(ports: &PortMap, buf: &mut BytesMut) {
    for e in ports.entries() {
        buf.put_u16(e.port);
        put_str(buf, e.label.as_deref().unwrap_or(""));
        buf.put_u8(e.udp as u8);
    }
}

fn decode_ports(mut body: Bytes) -> Result<PortMap, ProtocolError> {
    let mut entries = Vec::new();
    while body.has_remaining() {
        if body.remaining() < 2 {
            return Err(ProtocolError::Truncated);
        }
        let port = body.get_u16();
        let label = get_str(&mut body)?;
        if !body.has_remaining() {
            return Err(ProtocolError::Truncated);
        }
        let udp = body.get_u8() != 0;
        entries.push(PortMapEntry::new(port, Some(label), udp));
        if entries.len() > MAX_PORTS {
            return Err(PortMapError::TooMany(entries.len()).into());
        }
    }
    Ok(PortMap::new(entries)?)
}

/// Reassembles records from arbitrarily split DATA chunks.
#[derive(Debug, Default)]
pub struct RecordBuf {
    buf: BytesMut,
}

impl RecordBuf {
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Pops one complete record, or `None` when more bytes are needed.
    pub fn next_record(&mut self) -> Result<Option<Record>, ProtocolError> {
        if self.buf.len() < 2 {
            return Ok(None);
        }
        let len = u16::from_be_bytes([self.buf[0], self.buf[1]]) as usize;
        if len > MAX_RECORD_BYTES {
            return Err(ProtocolError::RecordTooLarge(len));
        }
        if len == 0 {
            return Err(ProtocolError::Truncated);
        }
        if self.buf.len() < 2 + len {
            return Ok(None);
        }
        self.buf.advance(2);
        let mut rec = self.buf.split_to(len).freeze();
        let tag_len = rec.get_u8() as usize;
        if rec.remaining() < tag_len {
            return Err(ProtocolError::Truncated);
        }
        let tag = rec.split_to(tag_len);
        let tag = String::from_utf8(tag.to_vec()).map_err(|_| ProtocolError::BadUtf8)?;
        Record::decode(tag, rec).map(Some)
    }
}

/// Outcome the accepting side reports right after the secure handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accepted,
    Rejected(String),
}

pub async fn write_verdict<W: AsyncWrite + Unpin>(
    w: &mut W,
    verdict: &Verdict,
) -> Result<(), ProtocolError> {
    let mut buf = BytesMut::new();
    match verdict {
        Verdict::Accepted => {
            buf.put_u8(0);
            put_varint(&mut buf, 0);
        }
        Verdict::Rejected(reason) => {
            let mut end = reason.len().min(MAX_REASON_BYTES);
            while !reason.is_char_boundary(end) {
                end -= 1;
            }
            buf.put_u8(1);
            put_str(&mut buf, &reason[..end]);
        }
    }
    w.write_all(&buf).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_verdict<R: AsyncRead + Unpin>(r: &mut R) -> Result<Verdict, ProtocolError> {
    let code = r.read_u8().await?;
    let n = read_varint(r).await? as usize;
    if n > MAX_REASON_BYTES {
        return Err(ProtocolError::RecordTooLarge(n));
    }
    let mut raw = vec![0u8; n];
    r.read_exact(&mut raw).await?;
    let reason = String::from_utf8(raw).map_err(|_| ProtocolError::BadUtf8)?;
    match code {
        0 => Ok(Verdict::Accepted),
        1 => Ok(Verdict::Rejected(reason)),
        other => Err(ProtocolError::BadVerdict(other)),
    }
}

async fn read_varint<R: AsyncRead + Unpin>(r: &mut R) -> Result<u32, ProtocolError> {
    let mut out: u32 = 0;
    for i in 0..5 {
        let b = r.read_u8().await?;
        out |= ((b & 0x7f) as u32) << (7 * i);
        if b & 0x80 == 0 {
            return Ok(out);
        }
    }
    Err(ProtocolError::VarintTooLong)
}
