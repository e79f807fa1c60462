use std::borrow::Cow;

use serde::Serialize;
use thiserror::Error;

use crate::aefrp::tunnel::protocol::MAX_PORTS;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PortMapError {
    #[error("too many port mappings: {0} (max {MAX_PORTS})")]
    TooMany(usize),
    #[error("duplicate port mapping {0:?}")]
    DuplicateKey(String),
}

/// One forwarded port as seen by a room.
///
/// `port` and `label` are what the room advertises. `target` only exists on the host
/// (where the stream is terminated) and `local_port` only matters on a client, where it
/// may be overridden to avoid local conflicts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortMapEntry {
    pub port: u16,
    pub label: Option<String>,
    pub udp: bool,
    #[serde(skip)]
    pub local_port: u16,
    #[serde(skip)]
    pub target: String,
}

impl PortMapEntry {
    pub fn new(port: u16, label: Option<String>, udp: bool) -> Self {
        let label = label
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty());
        Self {
            port,
            label,
            udp,
            local_port: port,
            target: String::new(),
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }

    /// Identity of the entry within a room: the label, or the port when unlabeled.
    pub fn key(&self) -> Cow<'_, str> {
        match &self.label {
            Some(l) => Cow::Borrowed(l.as_str()),
            None => Cow::Owned(self.port.to_string()),
        }
    }

    pub fn protocol(&self) -> &'static str {
        if self.udp { "udp" } else { "tcp" }
    }
}

/// Ordered, key-unique set of port mappings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct PortMap {
    entries: Vec<PortMapEntry>,
}

impl PortMap {
    pub fn new(entries: Vec<PortMapEntry>) -> Result<Self, PortMapError> {
        if entries.len() > MAX_PORTS {
            return Err(PortMapError::TooMany(entries.len()));
        }
        for (i, e) in entries.iter().enumerate() {
            let key = e.key();
            if entries[..i].iter().any(|p| p.key() == key) {
                return Err(PortMapError::DuplicateKey(key.into_owned()));
            }
        }
        Ok(Self { entries })
    }

    pub fn get(&self, key: &str) -> Option<&PortMapEntry> {
        self.entries.iter().find(|e| e.key() == key)
    }

    pub fn entries(&self) -> &[PortMapEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Overrides the client-side listen port of the entry matching `key`
    /// (label or advertised port). Returns false when nothing matched.
    pub fn set_local_port(&mut self, key: &str, local_port: u16) -> bool {
        let key = key.trim();
        match self
            .entries
            .iter_mut()
            .find(|e| e.key() == key || e.port.to_string() == key)
        {
            Some(e) => {
                e.local_port = local_port;
                true
            }
            None => false,
        }
    }
}
