//! End-user session on a front process.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::error::{ShardError, ShardResult};
use crate::front_channel::{FrontChannel, LinkResponse};
use crate::front_master::{FrontMasterChannel, FrontMasterInner};
use crate::hooks::ClientHandler;
use crate::ids::{ChannelId, ClientUid};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    /// Full encoded snapshot taken when the link was accepted.
    Set,
    /// Raw delta against the previous update of the same channel.
    Patch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientUpdate {
    pub channel_id: ChannelId,
    pub kind: UpdateKind,
    pub payload: Bytes,
}

#[derive(Default)]
struct ClientState {
    processor_channel: Option<ChannelId>,
    linked_channels: BTreeSet<ChannelId>,
    queued_updates: BTreeMap<ChannelId, Vec<ClientUpdate>>,
}

struct ClientInner {
    uid: ClientUid,
    master: Weak<FrontMasterInner>,
    handler: RwLock<Option<Arc<dyn ClientHandler>>>,
    state: Mutex<ClientState>,
}

/// Cheap to clone; every clone refers to the same session.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").field("uid", &self.inner.uid).finish()
    }
}

impl Client {
    pub(crate) fn new(uid: ClientUid, master: Weak<FrontMasterInner>) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                uid,
                master,
                handler: RwLock::new(None),
                state: Mutex::new(ClientState::default()),
            }),
        }
    }

    pub fn uid(&self) -> &str {
        &self.inner.uid
    }

    pub fn set_handler(&self, handler: Arc<dyn ClientHandler>) {
        *self.inner.handler.write() = Some(handler);
    }

    fn front_channel(&self, channel_id: &str) -> ShardResult<FrontChannel> {
        let master = FrontMasterChannel::from_weak(&self.inner.master).ok_or_else(|| {
            ShardError::MasterDropped {
                channel_id: channel_id.to_string(),
            }
        })?;
        master
            .channel(channel_id)
            .ok_or_else(|| ShardError::UnknownChannel {
                channel_id: channel_id.to_string(),
            })
    }

    /// Links this client to the front channel `channel_id` and waits for the
    /// back channel to accept.
    pub async fn link(&self, channel_id: &str, options: Value) -> ShardResult<LinkResponse> {
        let channel = self.front_channel(channel_id)?;
        channel.link(self, options).await
    }

    pub fn unlink(&self, channel_id: &str, options: Value) -> ShardResult<bool> {
        let channel = self.front_channel(channel_id)?;
        channel.unlink(self.uid(), options)
    }

    /// Makes `channel_id` the channel this client's writes go through,
    /// releasing the previous one.
    pub fn set_processor_channel(&self, channel_id: &str, options: Value) -> ShardResult<()> {
        let channel = self.front_channel(channel_id)?;
        let previous = self.inner.state.lock().processor_channel.clone();
        if previous.as_deref() == Some(channel_id) {
            return Ok(());
        }
        if let Some(previous) = previous {
            self.front_channel(&previous)?
                .remove_client_write(self.uid(), Value::Null)?;
        }
        channel.add_client_write(self.uid(), options)?;
        self.inner.state.lock().processor_channel = Some(channel_id.to_string());
        Ok(())
    }

    /// Returns `false` when no processor channel was set.
    pub fn remove_processor_channel(&self, options: Value) -> ShardResult<bool> {
        let Some(channel_id) = self.inner.state.lock().processor_channel.take() else {
            return Ok(false);
        };
        self.front_channel(&channel_id)?
            .remove_client_write(self.uid(), options)?;
        Ok(true)
    }

    pub fn processor_channel(&self) -> Option<ChannelId> {
        self.inner.state.lock().processor_channel.clone()
    }

    /// Queues `message` on the processor channel, tagged with this client's
    /// uid.
    pub fn send(&self, message: &Value) -> ShardResult<()> {
        let channel_id = self
            .processor_channel()
            .ok_or_else(|| ShardError::NoProcessorChannel {
                client_uid: self.inner.uid.clone(),
            })?;
        self.front_channel(&channel_id)?
            .send(message, Some(self.uid()))
    }

    pub fn linked_channel_ids(&self) -> Vec<ChannelId> {
        self.inner
            .state
            .lock()
            .linked_channels
            .iter()
            .cloned()
            .collect()
    }

    pub fn is_linked_to(&self, channel_id: &str) -> bool {
        self.inner.state.lock().linked_channels.contains(channel_id)
    }

    /// Drains every queued update, channel by channel, each in arrival order.
    pub fn take_updates(&self) -> Vec<ClientUpdate> {
        let queued = std::mem::take(&mut self.inner.state.lock().queued_updates);
        queued.into_values().flatten().collect()
    }

    pub fn take_updates_for(&self, channel_id: &str) -> Vec<ClientUpdate> {
        self.inner
            .state
            .lock()
            .queued_updates
            .remove(channel_id)
            .unwrap_or_default()
    }

    pub fn queued_update_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .queued_updates
            .values()
            .map(Vec::len)
            .sum()
    }

    /// Cancels in-flight links, unlinks from every channel, drops the
    /// processor channel and deregisters from the front master. Every step is
    /// attempted; the first failure is returned.
    pub fn disconnect(&self) -> ShardResult<()> {
        let Some(master) = FrontMasterChannel::from_weak(&self.inner.master) else {
            *self.inner.state.lock() = ClientState::default();
            return Ok(());
        };
        let mut first_error = None;
        for channel in master.channels() {
            if let Err(err) = channel.unlink(self.uid(), Value::Null) {
                warn!(
                    target = "shoal::client",
                    client_uid = %self.inner.uid,
                    channel_id = %channel.channel_id(),
                    error = %err,
                    "unlink during disconnect failed"
                );
                first_error.get_or_insert(err);
            }
        }
        if let Err(err) = self.remove_processor_channel(Value::Null) {
            first_error.get_or_insert(err);
        }
        master.remove_client(self.uid());
        self.inner.state.lock().queued_updates.clear();
        debug!(target = "shoal::client", client_uid = %self.inner.uid, "client disconnected");
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub(crate) fn record_link(&self, channel_id: &str, encoded_state: Bytes) {
        let mut state = self.inner.state.lock();
        state.linked_channels.insert(channel_id.to_string());
        state
            .queued_updates
            .entry(channel_id.to_string())
            .or_default()
            .push(ClientUpdate {
                channel_id: channel_id.to_string(),
                kind: UpdateKind::Set,
                payload: encoded_state,
            });
    }

    pub(crate) fn forget_link(&self, channel_id: &str) {
        let mut state = self.inner.state.lock();
        state.linked_channels.remove(channel_id);
        state.queued_updates.remove(channel_id);
    }

    pub(crate) fn queue_patch(&self, channel_id: &str, patch: Bytes) {
        self.inner
            .state
            .lock()
            .queued_updates
            .entry(channel_id.to_string())
            .or_default()
            .push(ClientUpdate {
                channel_id: channel_id.to_string(),
                kind: UpdateKind::Patch,
                payload: patch,
            });
    }

    pub(crate) fn deliver(&self, message: Value) {
        let handler = self.inner.handler.read().clone();
        match handler {
            Some(handler) => handler.on_message(&self.inner.uid, message),
            None => trace!(
                target = "shoal::client",
                client_uid = %self.inner.uid,
                "direct message without a handler"
            ),
        }
    }
}
