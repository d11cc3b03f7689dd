//! Types and rules shared by the replication client and the relay server:
//! entity identifiers, the ownership tie-break, the tag-prefixed wire
//! protocol and the length-prefixed frames used for the reliable stream.

pub mod framing;
pub mod ids;
pub mod ownership;
pub mod protocol;

pub use ids::{
    EntityId, EntityKey, EntityKind, ParticipantId, CANONICAL_ID_BASE, SERVER_PARTICIPANT,
    TEMPORARY_ID_SLOTS,
};
pub use ownership::{can_take_ownership, OwnershipStamp};
pub use protocol::{Message, MessageReader, ProtocolError};

/// Bumped whenever the message catalogue changes incompatibly.
pub const PROTOCOL_VERSION: u32 = 1;

/// Default bound for one packed unreliable packet.
pub const DEFAULT_MAX_PACKET_BYTES: usize = 512;

/// Receive buffer for a single datagram, participant prefix included.
pub const MAX_DATAGRAM_BYTES: usize = 2048;

/// Length of the participant id prefix on every datagram.
pub const DATAGRAM_HEADER_BYTES: usize = 4;

/// Prefixes an unreliable payload with the sender's participant id.
pub fn encode_datagram(participant: ParticipantId, payload: &[u8]) -> Vec<u8> {
    let mut datagram = Vec::with_capacity(DATAGRAM_HEADER_BYTES + payload.len());
    datagram.extend_from_slice(&participant.to_le_bytes());
    datagram.extend_from_slice(payload);
    datagram
}

/// Splits a datagram into its sender id and payload.
pub fn decode_datagram(datagram: &[u8]) -> Option<(ParticipantId, &[u8])> {
    if datagram.len() < DATAGRAM_HEADER_BYTES {
        return None;
    }
    let (header, payload) = datagram.split_at(DATAGRAM_HEADER_BYTES);
    let mut id = [0u8; DATAGRAM_HEADER_BYTES];
    id.copy_from_slice(header);
    Some((ParticipantId::from_le_bytes(id), payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_datagram_prefix() {
        let datagram = encode_datagram(9, &[7, 8]);
        assert_eq!(datagram.len(), DATAGRAM_HEADER_BYTES + 2);
        let (participant, payload) = decode_datagram(&datagram).unwrap();
        assert_eq!(participant, 9);
        assert_eq!(payload, &[7, 8]);
    }

    #[test]
    fn test_short_datagram_is_rejected() {
        assert!(decode_datagram(&[1, 2, 3]).is_none());
    }

    #[test]
    fn test_default_packet_fits_datagram() {
        assert!(DEFAULT_MAX_PACKET_BYTES + DATAGRAM_HEADER_BYTES <= MAX_DATAGRAM_BYTES);
    }
}
