//! Merges every reliable message produced during a tick into a single
//! reliable send, preserving enqueue order.

use shared::{Message, ProtocolError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReliableEnvelope {
    pub tag: u8,
    pub payload: Option<Vec<u8>>,
}

#[derive(Debug, Default)]
pub struct ReliableCoalescer {
    queue: Vec<ReliableEnvelope>,
}

impl ReliableCoalescer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue_reliable(&mut self, tag: u8, payload: Option<Vec<u8>>) {
        self.queue.push(ReliableEnvelope { tag, payload });
    }

    pub fn enqueue_message(&mut self, message: &Message) -> Result<(), ProtocolError> {
        let body = message.body()?;
        self.enqueue_reliable(message.tag(), Some(body));
        Ok(())
    }

    /// `tag0 payload0 tag1 payload1 ...`, or `None` if nothing was queued.
    pub fn flush_reliable(&mut self) -> Option<Vec<u8>> {
        if self.queue.is_empty() {
            return None;
        }

        let size = self
            .queue
            .iter()
            .map(|envelope| 1 + envelope.payload.as_ref().map_or(0, Vec::len))
            .sum();
        let mut out = Vec::with_capacity(size);
        for envelope in self.queue.drain(..) {
            out.push(envelope.tag);
            if let Some(payload) = envelope.payload {
                out.extend_from_slice(&payload);
            }
        }
        Some(out)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::protocol::{tag, GrabChanged, OwnershipClaim, RemoveEntity};
    use shared::{EntityKey, EntityKind, MessageReader, OwnershipStamp};

    #[test]
    fn test_empty_flush_is_none() {
        let mut coalescer = ReliableCoalescer::new();
        assert!(coalescer.flush_reliable().is_none());
    }

    #[test]
    fn test_raw_envelopes_concatenate_in_order() {
        let mut coalescer = ReliableCoalescer::new();
        coalescer.enqueue_reliable(7, Some(vec![1, 2]));
        coalescer.enqueue_reliable(8, None);
        coalescer.enqueue_reliable(9, Some(vec![3]));

        assert_eq!(coalescer.flush_reliable(), Some(vec![7, 1, 2, 8, 9, 3]));
        assert!(coalescer.is_empty());
        assert!(coalescer.flush_reliable().is_none());
    }

    #[test]
    fn test_coalesced_messages_walk_back_out() {
        let key = EntityKey::canonical(EntityKind::Object, 4021);
        let messages = vec![
            Message::OwnershipClaim(OwnershipClaim {
                key,
                stamp: OwnershipStamp::new(3, 1000),
            }),
            Message::GrabChanged(GrabChanged {
                key,
                grabber: Some(3),
            }),
            Message::RemoveEntity(RemoveEntity { key }),
        ];

        let mut coalescer = ReliableCoalescer::new();
        for message in &messages {
            coalescer.enqueue_message(message).unwrap();
        }
        assert_eq!(coalescer.len(), 3);

        let packet = coalescer.flush_reliable().unwrap();
        assert_eq!(packet[0], tag::OWNERSHIP_CLAIM);
        let decoded: Vec<Message> = MessageReader::new(&packet).collect::<Result<_, _>>().unwrap();
        assert_eq!(decoded, messages);
    }
}
