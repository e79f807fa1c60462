//! Fake peer-to-peer tunnel.
//!
//! Peers authenticate with self-signed certificates and are known by fingerprint.
//! A host publishes a room, either directly or through a relay it keeps an uplink to;
//! clients join the room by fingerprint and forward local ports into it.

pub mod bridge;
pub mod client;
pub mod connection;
pub mod control;
pub mod datagram;
pub mod host;
pub mod mux;
pub mod portmap;
pub mod protocol;
pub mod proxy;
pub mod room;
pub mod secure;
pub mod server;
pub mod transport;
