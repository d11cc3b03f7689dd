//! Tag-based demultiplexing of one physical inbound message.

use log::warn;
use shared::{Message, MessageReader};

/// Hands every decodable sub-message of `bytes` to `handle`, in order.
///
/// A malformed sub-message ends the walk for this buffer only; the count of
/// delivered messages is returned.
pub fn demux<F>(bytes: &[u8], mut handle: F) -> usize
where
    F: FnMut(Message),
{
    let mut reader = MessageReader::new(bytes);
    let mut delivered = 0;
    for result in &mut reader {
        match result {
            Ok(message) => {
                handle(message);
                delivered += 1;
            }
            Err(e) => {
                warn!(
                    "Dropping rest of inbound message after {} sub-messages: {}",
                    delivered, e
                );
            }
        }
    }
    delivered
}

/// Collects the decodable sub-messages of `bytes`.
pub fn decode_all(bytes: &[u8]) -> Vec<Message> {
    let mut messages = Vec::new();
    demux(bytes, |message| messages.push(message));
    messages
}
