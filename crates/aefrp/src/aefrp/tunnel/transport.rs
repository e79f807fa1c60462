use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;

/// A bidirectional async byte stream.
///
/// Rust trait objects can only have a single non-auto "principal" trait, so we
/// wrap `AsyncRead + AsyncWrite` into a single trait.
pub trait AsyncStream: tokio::io::AsyncRead + tokio::io::AsyncWrite {}
impl<T> AsyncStream for T where T: tokio::io::AsyncRead + tokio::io::AsyncWrite + ?Sized {}

pub type BoxedStream = Box<dyn AsyncStream + Unpin + Send>;

/// Carrier for the secure channel: a reliable byte stream between two peers.
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;
    async fn listen(&self, addr: &str) -> anyhow::Result<Box<dyn TransportListener>>;
    async fn dial(&self, addr: &str) -> anyhow::Result<(BoxedStream, SocketAddr)>;
}

#[async_trait]
pub trait TransportListener: Send + Sync {
    async fn accept(&self) -> anyhow::Result<(BoxedStream, SocketAddr)>;
    fn local_addr(&self) -> Option<SocketAddr>;
}

pub fn parse_transport(name: &str) -> anyhow::Result<String> {
    let mut n = name.trim().to_ascii_lowercase();
    if n.is_empty() {
        n = "tcp".into();
    }
    match n.as_str() {
        "tcp" | "kcp" => Ok(n),
        // KCP is the UDP carrier; accept the plain name too.
        "udp" => Ok("kcp".into()),
        _ => anyhow::bail!("tunnel: unknown transport {name:?} (expected tcp|kcp)"),
    }
}

pub mod kcp;
pub mod tcp;

pub fn transport_by_name(name: &str) -> anyhow::Result<Arc<dyn Transport>> {
    let n = parse_transport(name)?;
    match n.as_str() {
        "kcp" => Ok(Arc::new(kcp::KcpTransport::new())),
        _ => Ok(Arc::new(tcp::TcpTransport::new())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_names() {
        assert_eq!(parse_transport("").unwrap(), "tcp");
        assert_eq!(parse_transport(" TCP ").unwrap(), "tcp");
        assert_eq!(parse_transport("udp").unwrap(), "kcp");
        assert!(parse_transport("quic").is_err());
        assert_eq!(transport_by_name("kcp").unwrap().name(), "kcp");
    }

    #[tokio::test]
    async fn tcp_carrier_roundtrip() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let t = transport_by_name("tcp").unwrap();
        let ln = t.listen("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut s, _) = ln.accept().await.unwrap();
            let mut buf = [0u8; 5];
            s.read_exact(&mut buf).await.unwrap();
            s.write_all(&buf).await.unwrap();
        });

        let (mut c, peer) = t.dial(&addr.to_string()).await.unwrap();
        assert_eq!(peer, addr);
        c.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        c.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        server.await.unwrap();
    }
}
