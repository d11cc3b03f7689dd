//! Wire messages and the tag-prefixed envelope.
//!
//! Every logical message is one tag byte followed by its bincode-encoded
//! body. Bodies are self-delimiting, so any number of messages can be
//! concatenated into a single physical send and walked back out with
//! [`MessageReader`].

use crate::ids::{EntityKey, EntityKind, ParticipantId};
use crate::ownership::OwnershipStamp;
use bincode::Options;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Tag bytes, one per message type.
pub mod tag {
    pub const CONNECT: u8 = 1;
    pub const WELCOME: u8 = 2;
    pub const DISCONNECT: u8 = 3;
    pub const PING: u8 = 4;
    pub const PONG: u8 = 5;

    pub const CREATE_ENTITY: u8 = 10;
    pub const ENTITY_CONFIRMED: u8 = 11;
    pub const ENTITY_REDUNDANT: u8 = 12;
    pub const ENTITY_SPAWNED: u8 = 13;
    pub const REMOVE_ENTITY: u8 = 14;

    pub const OWNERSHIP_CLAIM: u8 = 20;
    pub const OWNERSHIP_CHANGED: u8 = 21;
    pub const GRAB_CHANGED: u8 = 22;

    pub const STATE_UPDATE: u8 = 30;
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown message tag {0}")]
    UnknownTag(u8),
    #[error("failed to decode message with tag {tag}: {source}")]
    Decode {
        tag: u8,
        #[source]
        source: bincode::Error,
    },
    #[error("failed to encode message with tag {tag}: {source}")]
    Encode {
        tag: u8,
        #[source]
        source: bincode::Error,
    },
}

fn codec() -> impl Options {
    bincode::DefaultOptions::new().allow_trailing_bytes()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connect {
    pub protocol_version: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Welcome {
    pub participant: ParticipantId,
    pub server_time_ms: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disconnect {
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    pub client_time_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong {
    pub client_time_ms: u64,
    pub server_time_ms: u32,
}

/// Sent by the creator while the entity only has a temporary id.
/// `dedupe_key` names entities that two participants may create
/// independently (e.g. the same material of a shared bundle).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateEntity {
    pub kind: EntityKind,
    pub temp_id: u16,
    pub dedupe_key: Option<String>,
    pub state: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityConfirmed {
    pub kind: EntityKind,
    pub temp_id: u16,
    pub canonical_id: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRedundant {
    pub kind: EntityKind,
    pub temp_id: u16,
    pub winner_id: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySpawned {
    pub key: EntityKey,
    pub stamp: OwnershipStamp,
    pub grabber: Option<ParticipantId>,
    pub state: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveEntity {
    pub key: EntityKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnershipClaim {
    pub key: EntityKey,
    pub stamp: OwnershipStamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnershipChanged {
    pub key: EntityKey,
    pub stamp: OwnershipStamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrabChanged {
    pub key: EntityKey,
    pub grabber: Option<ParticipantId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateUpdate {
    pub key: EntityKey,
    pub stamp: OwnershipStamp,
    pub state: Vec<u8>,
}

/// Every message that can appear on either channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Connect(Connect),
    Welcome(Welcome),
    Disconnect(Disconnect),
    Ping(Ping),
    Pong(Pong),
    CreateEntity(CreateEntity),
    EntityConfirmed(EntityConfirmed),
    EntityRedundant(EntityRedundant),
    EntitySpawned(EntitySpawned),
    RemoveEntity(RemoveEntity),
    OwnershipClaim(OwnershipClaim),
    OwnershipChanged(OwnershipChanged),
    GrabChanged(GrabChanged),
    StateUpdate(StateUpdate),
}

macro_rules! encode_body {
    ($tag:expr, $body:expr, $out:expr) => {
        codec()
            .serialize_into($out, $body)
            .map_err(|source| ProtocolError::Encode { tag: $tag, source })
    };
}

impl Message {
    pub fn tag(&self) -> u8 {
        match self {
            Message::Connect(_) => tag::CONNECT,
            Message::Welcome(_) => tag::WELCOME,
            Message::Disconnect(_) => tag::DISCONNECT,
            Message::Ping(_) => tag::PING,
            Message::Pong(_) => tag::PONG,
            Message::CreateEntity(_) => tag::CREATE_ENTITY,
            Message::EntityConfirmed(_) => tag::ENTITY_CONFIRMED,
            Message::EntityRedundant(_) => tag::ENTITY_REDUNDANT,
            Message::EntitySpawned(_) => tag::ENTITY_SPAWNED,
            Message::RemoveEntity(_) => tag::REMOVE_ENTITY,
            Message::OwnershipClaim(_) => tag::OWNERSHIP_CLAIM,
            Message::OwnershipChanged(_) => tag::OWNERSHIP_CHANGED,
            Message::GrabChanged(_) => tag::GRAB_CHANGED,
            Message::StateUpdate(_) => tag::STATE_UPDATE,
        }
    }

    /// Appends the body (without the tag byte) to `out`.
    pub fn write_body(&self, out: &mut Vec<u8>) -> Result<(), ProtocolError> {
        let tag = self.tag();
        match self {
            Message::Connect(body) => encode_body!(tag, body, out),
            Message::Welcome(body) => encode_body!(tag, body, out),
            Message::Disconnect(body) => encode_body!(tag, body, out),
            Message::Ping(body) => encode_body!(tag, body, out),
            Message::Pong(body) => encode_body!(tag, body, out),
            Message::CreateEntity(body) => encode_body!(tag, body, out),
            Message::EntityConfirmed(body) => encode_body!(tag, body, out),
            Message::EntityRedundant(body) => encode_body!(tag, body, out),
            Message::EntitySpawned(body) => encode_body!(tag, body, out),
            Message::RemoveEntity(body) => encode_body!(tag, body, out),
            Message::OwnershipClaim(body) => encode_body!(tag, body, out),
            Message::OwnershipChanged(body) => encode_body!(tag, body, out),
            Message::GrabChanged(body) => encode_body!(tag, body, out),
            Message::StateUpdate(body) => encode_body!(tag, body, out),
        }
    }

    /// Body bytes on their own, for callers that write the tag separately.
    pub fn body(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut out = Vec::new();
        self.write_body(&mut out)?;
        Ok(out)
    }

    /// Appends tag and body to `out`.
    pub fn write_to(&self, out: &mut Vec<u8>) -> Result<(), ProtocolError> {
        out.push(self.tag());
        self.write_body(out)
    }

    /// A standalone physical message carrying only `self`.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut out = Vec::new();
        self.write_to(&mut out)?;
        Ok(out)
    }

    /// Decodes one body for `tag`, advancing `input` past the consumed bytes.
    pub fn read_body(tag: u8, input: &mut &[u8]) -> Result<Message, ProtocolError> {
        fn body<T: serde::de::DeserializeOwned>(
            tag: u8,
            input: &mut &[u8],
        ) -> Result<T, ProtocolError> {
            codec()
                .deserialize_from(input)
                .map_err(|source| ProtocolError::Decode { tag, source })
        }

        let message = match tag {
            tag::CONNECT => Message::Connect(body(tag, input)?),
            tag::WELCOME => Message::Welcome(body(tag, input)?),
            tag::DISCONNECT => Message::Disconnect(body(tag, input)?),
            tag::PING => Message::Ping(body(tag, input)?),
            tag::PONG => Message::Pong(body(tag, input)?),
            tag::CREATE_ENTITY => Message::CreateEntity(body(tag, input)?),
            tag::ENTITY_CONFIRMED => Message::EntityConfirmed(body(tag, input)?),
            tag::ENTITY_REDUNDANT => Message::EntityRedundant(body(tag, input)?),
            tag::ENTITY_SPAWNED => Message::EntitySpawned(body(tag, input)?),
            tag::REMOVE_ENTITY => Message::RemoveEntity(body(tag, input)?),
            tag::OWNERSHIP_CLAIM => Message::OwnershipClaim(body(tag, input)?),
            tag::OWNERSHIP_CHANGED => Message::OwnershipChanged(body(tag, input)?),
            tag::GRAB_CHANGED => Message::GrabChanged(body(tag, input)?),
            tag::STATE_UPDATE => Message::StateUpdate(body(tag, input)?),
            other => return Err(ProtocolError::UnknownTag(other)),
        };
        Ok(message)
    }
}

/// Walks the tag-prefixed messages of one physical message.
///
/// After the first error the reader yields nothing more: the rest of that
/// buffer cannot be framed reliably.
pub struct MessageReader<'a> {
    remaining: &'a [u8],
}

impl<'a> MessageReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { remaining: bytes }
    }

    pub fn remaining(&self) -> usize {
        self.remaining.len()
    }
}

impl<'a> Iterator for MessageReader<'a> {
    type Item = Result<Message, ProtocolError>;

    fn next(&mut self) -> Option<Self::Item> {
        let (&tag, rest) = self.remaining.split_first()?;
        let mut cursor = rest;
        match Message::read_body(tag, &mut cursor) {
            Ok(message) => {
                self.remaining = cursor;
                Some(Ok(message))
            }
            Err(e) => {
                self.remaining = &[];
                Some(Err(e))
            }
        }
    }
}
