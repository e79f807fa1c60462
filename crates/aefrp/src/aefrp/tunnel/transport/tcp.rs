use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};

use crate::aefrp::{
    net::normalize_bind_addr,
    tunnel::transport::{BoxedStream, Transport, TransportListener},
};

pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn name(&self) -> &'static str {
        "tcp"
    }

    async fn listen(&self, addr: &str) -> anyhow::Result<Box<dyn TransportListener>> {
        let ln = TcpListener::bind(normalize_bind_addr(addr).as_ref()).await?;
        Ok(Box::new(TcpTransportListener { ln }))
    }

    async fn dial(&self, addr: &str) -> anyhow::Result<(BoxedStream, SocketAddr)> {
        let c = TcpStream::connect(addr).await?;
        let _ = c.set_nodelay(true);
        let remote = c.peer_addr()?;
        Ok((Box::new(c), remote))
    }
}

pub struct TcpTransportListener {
    ln: TcpListener,
}

#[async_trait]
impl TransportListener for TcpTransportListener {
    async fn accept(&self) -> anyhow::Result<(BoxedStream, SocketAddr)> {
        let (c, remote) = self.ln.accept().await?;
        let _ = c.set_nodelay(true);
        Ok((Box::new(c), remote))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.ln.local_addr().ok()
    }
}
