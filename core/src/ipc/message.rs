//! Wire message format
//!
//! Spec §6: "Message: packed `{i32 type, i32 ws_id, i32 from_nid, i32
//! to_nid; u64 cxl_hdm_offset, i32 page_order, i64 acked_fault_count}`."
//! Encoded/decoded by hand with explicit byte offsets rather than a derive
//! macro, the same style the teacher's own wire-format code uses for its
//! network stack (`net::ethernet`, `net::tcp`: manual field-by-field
//! parse/construct instead of `#[repr(C)]` casts) even though its IPC
//! layer (`ipc::message`, `ipc::shared_memory`) relies on `#[repr(C)]`.

/// Size in bytes of one encoded [`Message`] on the wire.
pub const MESSAGE_WIRE_SIZE: usize = 4 * 4 + 8 + 4 + 8;

/// Message type enum values (spec §6, fixed across nodes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum MessageType {
    Fetch = 0,
    FetchAck = 1,
    FetchNack = 2,
    Invalidate = 3,
    InvalidateAck = 4,
    InvalidateNack = 5,
    Error = 6,
}

impl MessageType {
    /// Decode a wire value, per spec §7 ("Unknown message type is logged
    /// and dropped").
    pub fn from_i32(v: i32) -> Option<Self> {
        Some(match v {
            0 => Self::Fetch,
            1 => Self::FetchAck,
            2 => Self::FetchNack,
            3 => Self::Invalidate,
            4 => Self::InvalidateAck,
            5 => Self::InvalidateNack,
            6 => Self::Error,
            _ => return None,
        })
    }

    pub fn is_ack(self) -> bool {
        matches!(self, Self::FetchAck | Self::InvalidateAck)
    }

    pub fn is_nack(self) -> bool {
        matches!(self, Self::FetchNack | Self::InvalidateNack)
    }

    /// Pair a request type with the ACK/NACK types a responder may send
    /// back.
    pub fn ack_for(self) -> Option<Self> {
        match self {
            Self::Fetch => Some(Self::FetchAck),
            Self::Invalidate => Some(Self::InvalidateAck),
            _ => None,
        }
    }

    pub fn nack_for(self) -> Option<Self> {
        match self {
            Self::Fetch => Some(Self::FetchNack),
            Self::Invalidate => Some(Self::InvalidateNack),
            _ => None,
        }
    }
}

/// One coherence message: header plus payload (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Message {
    pub msg_type: MessageType,
    pub ws_id: i32,
    pub from_node: i32,
    pub to_node: i32,
    pub offset: u64,
    pub page_order: i32,
    pub acked_fault_count: i64,
}

impl Message {
    /// Encode into exactly [`MESSAGE_WIRE_SIZE`] bytes.
    pub fn encode(&self, out: &mut [u8; MESSAGE_WIRE_SIZE]) {
        out[0..4].copy_from_slice(&(self.msg_type as i32).to_le_bytes());
        out[4..8].copy_from_slice(&self.ws_id.to_le_bytes());
        out[8..12].copy_from_slice(&self.from_node.to_le_bytes());
        out[12..16].copy_from_slice(&self.to_node.to_le_bytes());
        out[16..24].copy_from_slice(&self.offset.to_le_bytes());
        out[24..28].copy_from_slice(&self.page_order.to_le_bytes());
        out[28..36].copy_from_slice(&self.acked_fault_count.to_le_bytes());
    }

    /// Decode from exactly [`MESSAGE_WIRE_SIZE`] bytes. Returns `None` for
    /// an out-of-range message type (spec §7: `InvalidMessage`).
    pub fn decode(bytes: &[u8; MESSAGE_WIRE_SIZE]) -> Option<Self> {
        let msg_type = MessageType::from_i32(i32::from_le_bytes(bytes[0..4].try_into().unwrap()))?;
        Some(Self {
            msg_type,
            ws_id: i32::from_le_bytes(bytes[4..8].try_into().unwrap()),
            from_node: i32::from_le_bytes(bytes[8..12].try_into().unwrap()),
            to_node: i32::from_le_bytes(bytes[12..16].try_into().unwrap()),
            offset: u64::from_le_bytes(bytes[16..24].try_into().unwrap()),
            page_order: i32::from_le_bytes(bytes[24..28].try_into().unwrap()),
            acked_fault_count: i64::from_le_bytes(bytes[28..36].try_into().unwrap()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_round_trips_through_wire_bytes() {
        let msg = Message {
            msg_type: MessageType::Invalidate,
            ws_id: 42,
            from_node: 1,
            to_node: 2,
            offset: 0x10_000,
            page_order: 0,
            acked_fault_count: 7,
        };
        let mut wire = [0u8; MESSAGE_WIRE_SIZE];
        msg.encode(&mut wire);
        let decoded = Message::decode(&wire).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn unknown_message_type_decodes_to_none() {
        let mut wire = [0u8; MESSAGE_WIRE_SIZE];
        wire[0..4].copy_from_slice(&999i32.to_le_bytes());
        assert!(Message::decode(&wire).is_none());
    }

    #[test]
    fn ack_nack_pairing_matches_request_type() {
        assert_eq!(MessageType::Fetch.ack_for(), Some(MessageType::FetchAck));
        assert_eq!(MessageType::Fetch.nack_for(), Some(MessageType::FetchNack));
        assert_eq!(
            MessageType::Invalidate.ack_for(),
            Some(MessageType::InvalidateAck)
        );
        assert!(MessageType::Error.ack_for().is_none());
    }
}
