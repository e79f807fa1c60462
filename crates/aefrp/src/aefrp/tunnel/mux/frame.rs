use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::MuxError;

pub const HEADER_LEN: usize = 9;
pub const MAX_FRAME_PAYLOAD: usize = 16384;

pub const DATA: u8 = 0x0;
pub const HEADERS: u8 = 0x1;
pub const RST_STREAM: u8 = 0x3;
pub const PING: u8 = 0x6;
pub const GOAWAY: u8 = 0x7;
pub const WINDOW_UPDATE: u8 = 0x8;

pub const FLAG_END_STREAM: u8 = 0x1;
pub const FLAG_ACK: u8 = 0x1;

/// Stream and connection error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    NoError,
    Protocol,
    Internal,
    FlowControl,
    StreamClosed,
    Refused,
    Cancel,
    Connect,
}

impl ErrorCode {
    pub fn as_u32(self) -> u32 {
        match self {
            ErrorCode::NoError => 0,
            ErrorCode::Protocol => 1,
            ErrorCode::Internal => 2,
            ErrorCode::FlowControl => 3,
            ErrorCode::StreamClosed => 5,
            ErrorCode::Refused => 7,
            ErrorCode::Cancel => 8,
            ErrorCode::Connect => 10,
        }
    }

    pub fn from_u32(v: u32) -> Self {
        match v {
            0 => ErrorCode::NoError,
            1 => ErrorCode::Protocol,
            3 => ErrorCode::FlowControl,
            5 => ErrorCode::StreamClosed,
            7 => ErrorCode::Refused,
            8 => ErrorCode::Cancel,
            10 => ErrorCode::Connect,
            _ => ErrorCode::Internal,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: u8,
    pub flags: u8,
    pub stream_id: u32,
    pub payload: Bytes,
}

impl Frame {
    pub fn has(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }
}

pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Frame, MuxError> {
    let mut hdr = [0u8; HEADER_LEN];
    r.read_exact(&mut hdr).await?;
    let len = u32::from_be_bytes([0, hdr[0], hdr[1], hdr[2]]) as usize;
    if len > MAX_FRAME_PAYLOAD {
        return Err(MuxError::FrameTooLarge(len));
    }
    let kind = hdr[3];
    let flags = hdr[4];
    let stream_id = u32::from_be_bytes([hdr[5], hdr[6], hdr[7], hdr[8]]) & 0x7fff_ffff;
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload).await?;
    Ok(Frame {
        kind,
        flags,
        stream_id,
        payload: Bytes::from(payload),
    })
}

/// Buffers frames and pushes them out on `flush`.
pub struct FrameWriter {
    io: Box<dyn AsyncWrite + Send + Unpin>,
    buf: BytesMut,
}

impl FrameWriter {
    pub fn new(io: Box<dyn AsyncWrite + Send + Unpin>) -> Self {
        Self {
            io,
            buf: BytesMut::with_capacity(HEADER_LEN + MAX_FRAME_PAYLOAD),
        }
    }

    pub fn push(&mut self, kind: u8, flags: u8, stream_id: u32, payload: &[u8]) {
        debug_assert!(payload.len() <= MAX_FRAME_PAYLOAD);
        let len = payload.len() as u32;
        self.buf.put_slice(&len.to_be_bytes()[1..]);
        self.buf.put_u8(kind);
        self.buf.put_u8(flags);
        self.buf.put_u32(stream_id & 0x7fff_ffff);
        self.buf.put_slice(payload);
    }

    pub async fn flush(&mut self) -> std::io::Result<()> {
        if !self.buf.is_empty() {
            let out = self.buf.split();
            self.io.write_all(&out).await?;
        }
        self.io.flush().await
    }

    pub async fn shutdown(&mut self) -> std::io::Result<()> {
        self.flush().await?;
        self.io.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_header_layout() {
        let (a, mut b) = tokio::io::duplex(1024);
        let mut w = FrameWriter::new(Box::new(a));
        w.push(HEADERS, FLAG_END_STREAM, 3, b"abc");
        w.push(PING, FLAG_ACK, 0, &[1, 2, 3, 4, 5, 6, 7, 8]);
        w.flush().await.unwrap();

        let f = read_frame(&mut b).await.unwrap();
        assert_eq!(f.kind, HEADERS);
        assert!(f.has(FLAG_END_STREAM));
        assert_eq!(f.stream_id, 3);
        assert_eq!(&f.payload[..], b"abc");

        let f = read_frame(&mut b).await.unwrap();
        assert_eq!(f.kind, PING);
        assert_eq!(f.payload.len(), 8);
    }

    #[tokio::test]
    async fn oversized_frame_is_refused() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let len = (MAX_FRAME_PAYLOAD as u32 + 1).to_be_bytes();
        a.write_all(&[len[1], len[2], len[3], DATA, 0, 0, 0, 0, 1])
            .await
            .unwrap();
        assert!(matches!(
            read_frame(&mut b).await,
            Err(MuxError::FrameTooLarge(_))
        ));
    }
}
