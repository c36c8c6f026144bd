use thiserror::Error;
use transport_bus::BusError;

use crate::ids::{BackMasterIndex, ChannelId, ClientUid, FrontUid};

#[derive(Debug, Error)]
pub enum ShardError {
    #[error("channel {channel_id} timed out connecting; {outstanding} channel(s) never replied")]
    ConnectTimeout {
        channel_id: ChannelId,
        outstanding: usize,
    },
    #[error("client {client_uid} timed out linking to channel {channel_id}")]
    LinkTimeout {
        channel_id: ChannelId,
        client_uid: ClientUid,
    },
    #[error("link of client {client_uid} to channel {channel_id} was cancelled")]
    LinkCancelled {
        channel_id: ChannelId,
        client_uid: ClientUid,
    },
    #[error("channel {channel_id} is already connecting")]
    AlreadyConnecting { channel_id: ChannelId },
    #[error("client {client_uid} is already linking to channel {channel_id}")]
    AlreadyLinking {
        channel_id: ChannelId,
        client_uid: ClientUid,
    },
    #[error("client {client_uid} is already linked to channel {channel_id}")]
    AlreadyLinked {
        channel_id: ChannelId,
        client_uid: ClientUid,
    },
    #[error("channel {channel_id} has not connected to its back channel")]
    NotConnected { channel_id: ChannelId },
    #[error("no channel is linked to back master {back_master_index}")]
    BackMasterNotLinked { back_master_index: BackMasterIndex },
    #[error("front {front_uid} never connected to channel {channel_id}")]
    UnknownFront {
        channel_id: ChannelId,
        front_uid: FrontUid,
    },
    #[error("unknown channel {channel_id}")]
    UnknownChannel { channel_id: ChannelId },
    #[error("client {client_uid} already exists")]
    DuplicateClient { client_uid: ClientUid },
    #[error("unknown client {client_uid}")]
    UnknownClient { client_uid: ClientUid },
    #[error("client {client_uid} has no processor channel")]
    NoProcessorChannel { client_uid: ClientUid },
    #[error("channel {channel_id} received traffic but no {hook} handler is installed")]
    MissingHandler {
        channel_id: ChannelId,
        hook: &'static str,
    },
    #[error("master channel owning {channel_id} was dropped")]
    MasterDropped { channel_id: ChannelId },
    #[error("codec error: {0}")]
    Codec(String),
    #[error("delta error: {0}")]
    Delta(String),
    #[error("wire error: {0}")]
    Wire(#[from] bincode::Error),
    #[error("{0}")]
    Bus(#[from] BusError),
}

pub type ShardResult<T> = Result<T, ShardError>;
