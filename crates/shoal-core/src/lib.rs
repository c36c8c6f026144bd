//! Sharded channel state replicated from back processes to front processes
//! over a publish/subscribe bus.
//!
//! A [`BackChannel`] owns one shard's state. Every front process holds a
//! mirrored [`FrontChannel`] per shard that clients link through. Master
//! channels ([`BackMasterChannel`], [`FrontMasterChannel`]) own all channels
//! of a process, count cross-process interest and batch traffic between
//! processes.

pub mod back_channel;
pub mod back_master;
pub mod channel;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod front_channel;
pub mod front_master;
pub mod hooks;
pub mod ids;
pub mod pending;
pub mod protocol;
pub mod refcount;

pub use back_channel::BackChannel;
pub use back_master::BackMasterChannel;
pub use client::{Client, ClientUpdate, UpdateKind};
pub use codec::{JsonCodec, SpliceDelta, StateCodec, StateDelta};
pub use config::ChannelConfig;
pub use error::{ShardError, ShardResult};
pub use front_channel::{FrontChannel, LinkResponse};
pub use front_master::FrontMasterChannel;
pub use hooks::{
    AcceptAll, BackChannelHandler, BackChannelObserver, ClientHandler, FrontChannelHandler,
    LinkPolicy,
};
pub use ids::{BackMasterIndex, ChannelId, ClientUid, FrontMasterIndex, FrontUid};
