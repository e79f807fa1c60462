use std::{
    net::SocketAddr,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use crate::aefrp::{
    identity::Fingerprint,
    tunnel::{
        datagram::SenderTable,
        mux::{ErrorCode, Mux},
        room::MemberInfo,
    },
};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_connection_id() -> u64 {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

/// One authenticated, multiplexed peer session.
#[derive(Debug)]
pub struct Connection {
    pub id: u64,
    pub peer: Fingerprint,
    pub remote: SocketAddr,
    pub mux: Mux,
    name: Mutex<String>,
    udp: Mutex<SenderTable>,
}

impl Connection {
    pub fn new(peer: Fingerprint, remote: SocketAddr, mux: Mux) -> Arc<Self> {
        Arc::new(Self {
            id: next_connection_id(),
            peer,
            remote,
            mux,
            name: Mutex::new(String::new()),
            udp: Mutex::new(SenderTable::new()),
        })
    }

    /// Display name, falling back to the short fingerprint.
    pub fn name(&self) -> String {
        let name = self.name.lock().unwrap_or_else(PoisonError::into_inner);
        if name.is_empty() {
            self.peer.short()
        } else {
            name.clone()
        }
    }

    pub fn set_name(&self, name: &str) {
        *self.name.lock().unwrap_or_else(PoisonError::into_inner) = name.trim().to_string();
    }

    /// UDP peers seen on this connection, shared by all of its UDP port mappings.
    pub fn udp_senders(&self) -> MutexGuard<'_, SenderTable> {
        self.udp.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn member_info(&self) -> MemberInfo {
        MemberInfo {
            id: self.id,
            name: self.name(),
            fingerprint: self.peer,
            remote: self.remote,
        }
    }

    pub async fn close(&self, reason: &str) {
        self.mux.close(reason).await;
    }
}

/// Refuses every stream the peer opens until the connection ends.
pub async fn refuse_incoming(mux: Mux) {
    while let Some(stream) = mux.accept().await {
        tracing::debug!(stream = stream.id(), "connection: refusing unexpected stream");
        stream.reset(ErrorCode::Refused).await;
    }
}
