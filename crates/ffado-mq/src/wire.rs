//! Fixed 20-byte wire record shared by both message kinds the ring buffer
//! needs (`DataWritten`, `DataAck`). Kept as a hand-rolled `Wire` trait
//! instead of reaching for `serde`/`bincode`: the record is small, fixed,
//! and never changes shape, which is exactly the case the teacher's
//! `shm_layout.rs` header handles the same way.

pub const MESSAGE_WIRE_LEN: usize = 20;
pub const MAGIC: u32 = 0x5743_9812;
pub const VERSION: u32 = 0;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WireError {
    #[error("message too short: got {len} bytes, need {MESSAGE_WIRE_LEN}")]
    Truncated { len: usize },
    #[error("bad magic: expected {MAGIC:#010x}, got {found:#010x}")]
    BadMagic { found: u32 },
    #[error("unsupported version: expected {VERSION}, got {found}")]
    BadVersion { found: u32 },
    #[error("unknown message kind {found}")]
    UnknownKind { found: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    DataWritten = 1,
    DataAck = 2,
}

impl MessageKind {
    fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(MessageKind::DataWritten),
            2 => Some(MessageKind::DataAck),
            _ => None,
        }
    }
}

/// A trait for types that serialise to/from a fixed-size byte buffer,
/// narrower than `serde` on purpose: the only thing a queue needs to know
/// about its payload is how to turn it into bytes and back.
pub trait Wire: Sized {
    fn encode(&self) -> [u8; MESSAGE_WIRE_LEN];
    fn decode(bytes: &[u8]) -> Result<Self, WireError>;
}

/// One ring-buffer protocol message: "block `slot` at sequence `seq` was
/// written" or "...was acknowledged".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageKind,
    pub slot: u32,
    pub seq: u32,
}

impl Message {
    pub fn data_written(slot: u32, seq: u32) -> Self {
        Self {
            kind: MessageKind::DataWritten,
            slot,
            seq,
        }
    }

    pub fn data_ack(slot: u32, seq: u32) -> Self {
        Self {
            kind: MessageKind::DataAck,
            slot,
            seq,
        }
    }
}

impl Wire for Message {
    fn encode(&self) -> [u8; MESSAGE_WIRE_LEN] {
        let mut buf = [0u8; MESSAGE_WIRE_LEN];
        buf[0..4].copy_from_slice(&MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&VERSION.to_le_bytes());
        buf[8..12].copy_from_slice(&(self.kind as u32).to_le_bytes());
        buf[12..16].copy_from_slice(&self.slot.to_le_bytes());
        buf[16..20].copy_from_slice(&self.seq.to_le_bytes());
        buf
    }

    fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < MESSAGE_WIRE_LEN {
            return Err(WireError::Truncated { len: bytes.len() });
        }
        let magic = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        if magic != MAGIC {
            return Err(WireError::BadMagic { found: magic });
        }
        let version = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        if version != VERSION {
            return Err(WireError::BadVersion { found: version });
        }
        let kind_raw = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
        let kind = MessageKind::from_u32(kind_raw).ok_or(WireError::UnknownKind { found: kind_raw })?;
        let slot = u32::from_le_bytes(bytes[12..16].try_into().unwrap());
        let seq = u32::from_le_bytes(bytes[16..20].try_into().unwrap());
        Ok(Message { kind, slot, seq })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_the_wire() {
        let m = Message::data_written(7, 42);
        let bytes = m.encode();
        let back = Message::decode(&bytes).unwrap();
        assert_eq!(m, back);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = Message::data_ack(1, 1).encode();
        bytes[0] ^= 0xff;
        assert!(matches!(
            Message::decode(&bytes),
            Err(WireError::BadMagic { .. })
        ));
    }

    #[test]
    fn rejects_truncated_input() {
        let bytes = Message::data_ack(1, 1).encode();
        assert_eq!(
            Message::decode(&bytes[..10]),
            Err(WireError::Truncated { len: 10 })
        );
    }
}
