//! Application-facing hooks.
//!
//! Decision hooks ([`LinkPolicy`]) return a value that changes the protocol
//! outcome. Observers ([`BackChannelObserver`], the `on_*ed` methods of
//! [`FrontChannelHandler`]) are told about outcomes and cannot change them.

use bytes::Bytes;
use serde_json::Value;

use crate::error::{ShardError, ShardResult};
use crate::ids::{BackMasterIndex, ClientUid, FrontUid};

/// Receives application messages addressed to a back channel.
pub trait BackChannelHandler: Send + Sync {
    fn on_message(&self, channel_id: &str, message: Value) -> ShardResult<()> {
        let _ = message;
        Err(ShardError::MissingHandler {
            channel_id: channel_id.to_string(),
            hook: "on_message",
        })
    }

    fn on_client_message(
        &self,
        channel_id: &str,
        client_uid: &str,
        message: Value,
    ) -> ShardResult<()> {
        let _ = (client_uid, message);
        Err(ShardError::MissingHandler {
            channel_id: channel_id.to_string(),
            hook: "on_client_message",
        })
    }
}

/// Decides whether clients may listen to or write through a back channel.
///
/// Returning `None` refuses the request silently; `Some(options)` accepts it
/// and `options` is handed back to the requesting front.
pub trait LinkPolicy: Send + Sync {
    fn on_add_client_listen(
        &self,
        channel_id: &str,
        client_uid: &str,
        options: &Value,
    ) -> Option<Value> {
        let _ = (channel_id, client_uid);
        Some(options.clone())
    }

    fn on_add_client_write(
        &self,
        channel_id: &str,
        client_uid: &str,
        options: &Value,
    ) -> Option<Value> {
        let _ = (channel_id, client_uid);
        Some(options.clone())
    }
}

/// Accepts every request, echoing its options.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl LinkPolicy for AcceptAll {}

pub trait BackChannelObserver: Send + Sync {
    fn on_front_connected(&self, channel_id: &str, front_uid: &FrontUid) {
        let _ = (channel_id, front_uid);
    }

    fn on_added_client_listener(&self, channel_id: &str, client_uid: &ClientUid, options: &Value) {
        let _ = (channel_id, client_uid, options);
    }

    fn on_removed_client_listener(
        &self,
        channel_id: &str,
        client_uid: &ClientUid,
        options: &Value,
    ) {
        let _ = (channel_id, client_uid, options);
    }

    fn on_added_client_write(&self, channel_id: &str, client_uid: &ClientUid, options: &Value) {
        let _ = (channel_id, client_uid, options);
    }

    fn on_removed_client_write(&self, channel_id: &str, client_uid: &ClientUid, options: &Value) {
        let _ = (channel_id, client_uid, options);
    }
}

pub trait FrontChannelHandler: Send + Sync {
    fn on_message(&self, channel_id: &str, message: Value) -> ShardResult<()> {
        let _ = message;
        Err(ShardError::MissingHandler {
            channel_id: channel_id.to_string(),
            hook: "on_message",
        })
    }

    fn on_connected(&self, channel_id: &str, back_master_index: BackMasterIndex) {
        let _ = (channel_id, back_master_index);
    }

    fn on_disconnected(&self, channel_id: &str) {
        let _ = channel_id;
    }

    /// Raw patch as produced by the back channel's delta; it is not decoded
    /// here.
    fn on_patch_state(&self, channel_id: &str, patch: &Bytes) {
        let _ = (channel_id, patch);
    }
}

/// Receives direct messages addressed to a client.
pub trait ClientHandler: Send + Sync {
    fn on_message(&self, client_uid: &str, message: Value);
}

impl<F> ClientHandler for F
where
    F: Fn(&str, Value) + Send + Sync,
{
    fn on_message(&self, client_uid: &str, message: Value) {
        self(client_uid, message)
    }
}
