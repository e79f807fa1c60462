use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_kcp::{KcpConfig, KcpListener, KcpStream};

use crate::aefrp::{
    net::{normalize_bind_addr, resolve_socket_addr},
    tunnel::transport::{BoxedStream, Transport, TransportListener},
};

/// Reliable UDP carrier (KCP). Useful where TCP to the relay is throttled.
pub struct KcpTransport {
    kcp: KcpConfig,
}

impl KcpTransport {
    pub fn new() -> Self {
        let mut kcp = KcpConfig::default();
        // Streaming mode: the secure channel is a byte stream, not messages.
        kcp.stream = true;
        Self { kcp }
    }
}

#[async_trait]
impl Transport for KcpTransport {
    fn name(&self) -> &'static str {
        "kcp"
    }

    async fn listen(&self, addr: &str) -> anyhow::Result<Box<dyn TransportListener>> {
        let bind_addr: SocketAddr = normalize_bind_addr(addr).parse()?;
        let ln = KcpListener::bind(self.kcp.clone(), bind_addr).await?;
        let local = ln.local_addr().ok();
        Ok(Box::new(KcpTransportListener {
            ln: Mutex::new(ln),
            local,
        }))
    }

    async fn dial(&self, addr: &str) -> anyhow::Result<(BoxedStream, SocketAddr)> {
        let remote = resolve_socket_addr(addr).await?;
        let c = KcpStream::connect(&self.kcp, remote).await?;
        Ok((Box::new(c), remote))
    }
}

pub struct KcpTransportListener {
    ln: Mutex<KcpListener>,
    local: Option<SocketAddr>,
}

#[async_trait]
impl TransportListener for KcpTransportListener {
    async fn accept(&self) -> anyhow::Result<(BoxedStream, SocketAddr)> {
        let mut ln = self.ln.lock().await;
        let (c, peer) = ln.accept().await?;
        Ok((Box::new(c), peer))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }
}
