//! Message kinds, topic naming and the wire envelopes exchanged between
//! front and back processes.
//!
//! Envelopes are framed with bincode. Application values travel inside them
//! as bytes produced by the configured [`StateCodec`](crate::codec::StateCodec).

use std::fmt;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::ShardResult;
use crate::ids::{BackMasterIndex, ChannelId, ClientUid, FrontMasterIndex, FrontUid};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    // front -> back
    Connect,
    BroadcastAllBack,
    SendBack,
    Link,
    Unlink,
    AddClientWrite,
    RemoveClientWrite,
    // back -> front
    ConnectionChange,
    SendFront,
    BroadcastLinkedFronts,
    BroadcastAllFronts,
    AcceptLink,
    // front master -> back master
    SendQueued,
    // back master -> front master
    PatchState,
    MessageClient,
}

impl MessageKind {
    pub const fn code(self) -> u8 {
        match self {
            MessageKind::Connect => 0,
            MessageKind::BroadcastAllBack => 1,
            MessageKind::SendBack => 2,
            MessageKind::Link => 3,
            MessageKind::Unlink => 4,
            MessageKind::AddClientWrite => 5,
            MessageKind::RemoveClientWrite => 6,
            MessageKind::ConnectionChange => 7,
            MessageKind::SendFront => 8,
            MessageKind::BroadcastLinkedFronts => 9,
            MessageKind::BroadcastAllFronts => 10,
            MessageKind::AcceptLink => 11,
            MessageKind::SendQueued => 12,
            MessageKind::PatchState => 13,
            MessageKind::MessageClient => 14,
        }
    }
}

/// Transport subject for one message kind, optionally scoped to an instance
/// (channel id, front uid or master index). Renders as `"<code>-<instance>"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic {
    kind: MessageKind,
    instance: Option<String>,
}

impl Topic {
    pub fn new(kind: MessageKind, instance: Option<String>) -> Self {
        Self { kind, instance }
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn connect() -> Self {
        Self::new(MessageKind::Connect, None)
    }

    pub fn broadcast_all_back() -> Self {
        Self::new(MessageKind::BroadcastAllBack, None)
    }

    pub fn broadcast_all_fronts() -> Self {
        Self::new(MessageKind::BroadcastAllFronts, None)
    }

    pub fn send_back(channel_id: &str) -> Self {
        Self::new(MessageKind::SendBack, Some(channel_id.to_string()))
    }

    pub fn for_front(kind: MessageKind, front_uid: &FrontUid) -> Self {
        Self::new(kind, Some(front_uid.to_string()))
    }

    pub fn send_queued(back_master_index: BackMasterIndex) -> Self {
        Self::new(MessageKind::SendQueued, Some(back_master_index.to_string()))
    }

    pub fn patch_state(front_master_index: FrontMasterIndex) -> Self {
        Self::new(MessageKind::PatchState, Some(front_master_index.to_string()))
    }

    pub fn message_client(front_master_index: FrontMasterIndex) -> Self {
        Self::new(
            MessageKind::MessageClient,
            Some(front_master_index.to_string()),
        )
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.instance {
            Some(instance) => write!(f, "{}-{}", self.kind.code(), instance),
            None => write!(f, "{}", self.kind.code()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectRequest {
    pub channel_id: ChannelId,
    pub front_uid: FrontUid,
    pub front_master_index: FrontMasterIndex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionChange {
    pub channel_id: ChannelId,
    pub back_master_index: BackMasterIndex,
    pub status: ConnectionStatus,
}

/// Body of LINK, UNLINK, ADD_CLIENT_WRITE and REMOVE_CLIENT_WRITE.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRequest {
    pub client_uid: ClientUid,
    #[serde(with = "serde_bytes")]
    pub options: Vec<u8>,
    /// Identifies one LINK attempt; zero on every other request.
    pub link_ticket: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptLink {
    /// Empty when the back channel never had state.
    #[serde(with = "serde_bytes")]
    pub encoded_state: Vec<u8>,
    pub client_uid: ClientUid,
    #[serde(with = "serde_bytes")]
    pub options: Vec<u8>,
    /// Copied from the LINK being answered.
    pub link_ticket: u64,
}

/// Front-to-back application message, either queued into a SEND_QUEUED batch
/// or sent directly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMessage {
    pub channel_id: ChannelId,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
    pub from_client: Option<ClientUid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrontMessage {
    pub channel_id: ChannelId,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatePatch {
    pub channel_id: ChannelId,
    #[serde(with = "serde_bytes")]
    pub patch: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientMessage {
    pub client_uid: ClientUid,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

pub fn encode_envelope<T: Serialize>(value: &T) -> ShardResult<Bytes> {
    Ok(Bytes::from(bincode::serialize(value)?))
}

pub fn decode_envelope<T: DeserializeOwned>(bytes: &[u8]) -> ShardResult<T> {
    Ok(bincode::deserialize(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topics_render_code_and_instance() {
        assert_eq!(Topic::connect().to_string(), "0");
        assert_eq!(Topic::send_back("lobby").to_string(), "2-lobby");
        assert_eq!(
            Topic::for_front(MessageKind::AcceptLink, &FrontUid::new("lobby", 3)).to_string(),
            "11-lobby.3"
        );
        assert_eq!(Topic::send_queued(2).to_string(), "12-2");
        assert_eq!(Topic::patch_state(4).to_string(), "13-4");
        assert_eq!(Topic::message_client(4).to_string(), "14-4");
    }

    #[test]
    fn distinct_kinds_never_share_a_topic() {
        let front = FrontUid::new("lobby", 0);
        let link = Topic::for_front(MessageKind::Link, &front);
        let unlink = Topic::for_front(MessageKind::Unlink, &front);
        assert_ne!(link.to_string(), unlink.to_string());
    }

    #[test]
    fn queued_batch_survives_framing() {
        let batch = vec![
            ChannelMessage {
                channel_id: "a".into(),
                payload: b"{}".to_vec(),
                from_client: Some("client-1".into()),
            },
            ChannelMessage {
                channel_id: "b".into(),
                payload: Vec::new(),
                from_client: None,
            },
        ];
        let bytes = encode_envelope(&batch).expect("encode");
        let decoded: Vec<ChannelMessage> = decode_envelope(&bytes).expect("decode");
        assert_eq!(decoded, batch);
    }

    #[test]
    fn truncated_envelope_is_a_wire_error() {
        let bytes = encode_envelope(&StatePatch {
            channel_id: "a".into(),
            patch: vec![1, 2, 3],
        })
        .expect("encode");
        let err = decode_envelope::<StatePatch>(&bytes[..bytes.len() - 2]).unwrap_err();
        assert!(matches!(err, crate::error::ShardError::Wire(_)));
    }
}
