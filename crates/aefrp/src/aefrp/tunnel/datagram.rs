use std::{collections::HashMap, net::SocketAddr};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::aefrp::tunnel::protocol::{ProtocolError, get_varint, put_varint, varint_len};

/// Datagram framing over a tunnel stream.
///
/// Each datagram is encoded as `u16be len | varint sender | payload`, where `len`
/// covers the sender varint and the payload. Several UDP peers share one stream and
/// are told apart by `sender`.
pub const MAX_RECORD_LEN: usize = u16::MAX as usize;

pub fn encoded_len(sender: u32, payload_len: usize) -> usize {
    2 + varint_len(sender) + payload_len
}

pub fn encode_datagram(sender: u32, payload: &[u8]) -> Result<Bytes, ProtocolError> {
    let len = varint_len(sender) + payload.len();
    if len > MAX_RECORD_LEN {
        return Err(ProtocolError::RecordTooLarge(len));
    }
    let mut out = BytesMut::with_capacity(2 + len);
    out.put_u16(len as u16);
    put_varint(&mut out, sender);
    out.put_slice(payload);
    Ok(out.freeze())
}

/// Reassembles datagram records from stream chunks that may split or merge them.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    buf: BytesMut,
}

impl FrameAssembler {
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    #[cfg(test)]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Emits `(sender, payload)` once a whole record is buffered.
    pub fn next_datagram(&mut self) -> Result<Option<(u32, Bytes)>, ProtocolError> {
        if self.buf.len() < 2 {
            return Ok(None);
        }
        let len = u16::from_be_bytes([self.buf[0], self.buf[1]]) as usize;
        if self.buf.len() < 2 + len {
            return Ok(None);
        }
        self.buf.advance(2);
        let mut rec = self.buf.split_to(len).freeze();
        let sender = get_varint(&mut rec)?;
        Ok(Some((sender, rec)))
    }
}

/// Bijection between UDP peer addresses and the sender ids used on the wire.
#[derive(Debug, Default)]
pub struct SenderTable {
    by_id: HashMap<u32, SocketAddr>,
    by_addr: HashMap<SocketAddr, u32>,
    next: u32,
}

impl SenderTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Id of `addr`, allocating the next free one for an unseen peer.
    pub fn id_for(&mut self, addr: SocketAddr) -> u32 {
        if let Some(id) = self.by_addr.get(&addr) {
            return *id;
        }
        while self.by_id.contains_key(&self.next) {
            self.next = self.next.wrapping_add(1);
        }
        let id = self.next;
        self.next = self.next.wrapping_add(1);
        self.by_id.insert(id, addr);
        self.by_addr.insert(addr, id);
        id
    }

    pub fn addr_of(&self, id: u32) -> Option<SocketAddr> {
        self.by_id.get(&id).copied()
    }

    #[cfg(test)]
    pub fn remove(&mut self, id: u32) -> Option<SocketAddr> {
        let addr = self.by_id.remove(&id)?;
        self.by_addr.remove(&addr);
        Some(addr)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assembler_handles_split_and_merged_records() {
        let mut wire = BytesMut::new();
        wire.extend_from_slice(&encode_datagram(0, b"ping").unwrap());
        wire.extend_from_slice(&encode_datagram(300, &[7u8; 1000]).unwrap());
        wire.extend_from_slice(&encode_datagram(1, b"").unwrap());

        let mut asm = FrameAssembler::default();
        let mut got = Vec::new();
        for chunk in wire.chunks(3) {
            asm.push(chunk);
            while let Some(d) = asm.next_datagram().unwrap() {
                got.push(d);
            }
        }
        assert_eq!(got.len(), 3);
        assert_eq!(got[0], (0, Bytes::from_static(b"ping")));
        assert_eq!(got[1].0, 300);
        assert_eq!(got[1].1.len(), 1000);
        assert_eq!(got[2], (1, Bytes::new()));
        assert_eq!(asm.buffered(), 0);
    }

    #[test]
    fn partial_record_is_not_emitted() {
        let wire = encode_datagram(5, b"abcdef").unwrap();
        let mut asm = FrameAssembler::default();
        asm.push(&wire[..wire.len() - 1]);
        assert!(asm.next_datagram().unwrap().is_none());
        asm.push(&wire[wire.len() - 1..]);
        assert_eq!(
            asm.next_datagram().unwrap(),
            Some((5, Bytes::from_static(b"abcdef")))
        );
    }

    #[test]
    fn sender_table_is_a_bijection() {
        let a: SocketAddr = "10.0.0.1:1000".parse().unwrap();
        let b: SocketAddr = "10.0.0.2:1000".parse().unwrap();
        let mut t = SenderTable::new();
        let ia = t.id_for(a);
        let ib = t.id_for(b);
        assert_ne!(ia, ib);
        assert_eq!(t.id_for(a), ia);
        assert_eq!(t.addr_of(ib), Some(b));
        assert_eq!(t.addr_of(99), None);
        assert_eq!(t.remove(ia), Some(a));
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn encoded_len_matches_wire() {
        let wire = encode_datagram(200, &[1u8; 10]).unwrap();
        assert_eq!(wire.len(), encoded_len(200, 10));
        assert!(encode_datagram(0, &vec![0u8; MAX_RECORD_LEN]).is_err());
    }
}
