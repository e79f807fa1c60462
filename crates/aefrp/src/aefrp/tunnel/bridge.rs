//! Splicing a peer that asked for a room hosted elsewhere through to its host.
//!
//! The relay pushes a stream over the host's control connection and pumps the peer's
//! secure stream into it through an in-memory pipe. The host feeds the pushed stream
//! into its own server as if the peer had connected directly, so the peer can run a
//! second handshake against the host inside the first one.

use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::aefrp::tunnel::{
    mux::MuxStream,
    protocol::{Headers, header},
    proxy::pump,
    room::Room,
    server::RelayServer,
};

const PIPE_BUFFER: usize = 64 * 1024;

/// Relay side: connects `peer` with the host of `room`.
pub async fn splice<S>(peer: S, room: &Room, endpoint: SocketAddr) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let link = room
        .host_link()
        .ok_or_else(|| anyhow::anyhow!("bridge: room {} has no host", room.fingerprint.short()))?;
    let stream = link
        .control
        .push(endpoint)
        .await
        .context("bridge: push stream toward host")?;
    tracing::debug!(
        room = %room.fingerprint.short(),
        peer = %endpoint,
        stream = stream.id(),
        "bridge: spliced"
    );

    let (mut near, far) = tokio::io::duplex(PIPE_BUFFER);
    let pumping = tokio::spawn(async move { pump(&stream, far).await });
    let mut peer = peer;
    let copied = tokio::io::copy_bidirectional(&mut peer, &mut near).await;
    drop(near);
    let pumped = pumping.await.context("bridge: pump task")?;
    copied?;
    pumped?;
    Ok(())
}

/// Host side: serves a pushed stream with `server` as if it were a raw connection
/// from the peer named in `endpoint-ip`.
pub async fn accept_push(stream: MuxStream, req: &Headers, server: &Arc<RelayServer>) -> anyhow::Result<()> {
    let endpoint = req
        .get(header::ENDPOINT_IP)
        .and_then(|s| s.parse::<SocketAddr>().ok())
        .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));

    let (near, far) = tokio::io::duplex(PIPE_BUFFER);
    let server = server.clone();
    tokio::spawn(async move {
        if let Err(err) = server.accept(far, endpoint).await {
            tracing::debug!(peer = %endpoint, err = %err, "bridge: pushed peer ended");
        }
    });
    pump(&stream, near).await?;
    Ok(())
}
