//! Per-process owner of every front channel on a front process.
//!
//! Counts, per back master, how many of its channels have linked clients and
//! holds the outbound message queue for that back master. Inbound patch
//! batches and direct client messages are demultiplexed here.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use futures::future::try_join_all;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};
use transport_bus::Bus;

use crate::channel::{envelope_handler, ChannelCore};
use crate::client::Client;
use crate::codec::StateCodec;
use crate::config::ChannelConfig;
use crate::error::{ShardError, ShardResult};
use crate::front_channel::FrontChannel;
use crate::ids::{BackMasterIndex, ChannelId, ClientUid, FrontMasterIndex};
use crate::protocol::{ChannelMessage, ClientMessage, StatePatch, Topic};
use crate::refcount::{RefCountMap, UnlinkOutcome};

#[derive(Default)]
struct FrontMasterState {
    linked_back_masters: RefCountMap<BackMasterIndex, Vec<ChannelMessage>>,
    clients: HashMap<ClientUid, Client>,
}

pub(crate) struct FrontMasterInner {
    index: FrontMasterIndex,
    core: ChannelCore,
    codec: Arc<dyn StateCodec>,
    channels: BTreeMap<ChannelId, FrontChannel>,
    state: Mutex<FrontMasterState>,
}

#[derive(Clone)]
pub struct FrontMasterChannel {
    inner: Arc<FrontMasterInner>,
}

impl FrontMasterChannel {
    /// Builds one front channel per distinct id. `channel_ids` must name
    /// every shard in the cluster: a channel only counts as connected once
    /// all of them have answered, and acks from other ids are ignored.
    pub fn new<I, S>(
        index: FrontMasterIndex,
        channel_ids: I,
        messenger: Arc<dyn Bus>,
        codec: Arc<dyn StateCodec>,
        config: ChannelConfig,
    ) -> ShardResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<ChannelId>,
    {
        let shard_ids: Arc<BTreeSet<ChannelId>> =
            Arc::new(channel_ids.into_iter().map(Into::into).collect());
        let inner = Arc::new_cyclic(|master: &Weak<FrontMasterInner>| {
            let channels = shard_ids
                .iter()
                .map(|channel_id| {
                    let channel = FrontChannel::new(
                        channel_id.clone(),
                        index,
                        Arc::clone(&shard_ids),
                        master.clone(),
                        Arc::clone(&messenger),
                        Arc::clone(&codec),
                        config,
                    );
                    (channel_id.clone(), channel)
                })
                .collect();
            FrontMasterInner {
                index,
                core: ChannelCore::new(format!("front-master-{index}"), Arc::clone(&messenger)),
                codec: Arc::clone(&codec),
                channels,
                state: Mutex::new(FrontMasterState::default()),
            }
        });

        for channel in inner.channels.values() {
            channel.register()?;
        }
        inner.core.pull(
            &Topic::patch_state(index),
            envelope_handler(&inner, |inner, batch: Vec<StatePatch>| {
                FrontMasterChannel::from_inner(inner).handle_state_patches(batch);
            }),
        )?;
        inner.core.pull(
            &Topic::message_client(index),
            envelope_handler(&inner, |inner, message: ClientMessage| {
                FrontMasterChannel::from_inner(inner).handle_client_message(message);
            }),
        )?;
        debug!(
            target = "shoal::front_master",
            front_master_index = index,
            channels = inner.channels.len(),
            "front master ready"
        );
        Ok(Self { inner })
    }

    fn from_inner(inner: &Arc<FrontMasterInner>) -> Self {
        Self {
            inner: Arc::clone(inner),
        }
    }

    pub(crate) fn from_weak(master: &Weak<FrontMasterInner>) -> Option<Self> {
        master.upgrade().map(|inner| Self { inner })
    }

    pub fn index(&self) -> FrontMasterIndex {
        self.inner.index
    }

    pub fn channel(&self, channel_id: &str) -> Option<FrontChannel> {
        self.inner.channels.get(channel_id).cloned()
    }

    pub fn channels(&self) -> impl Iterator<Item = &FrontChannel> {
        self.inner.channels.values()
    }

    /// Connects every child channel concurrently; fails with the first error.
    pub async fn connect_all(&self) -> ShardResult<()> {
        try_join_all(self.inner.channels.values().map(|channel| channel.connect())).await?;
        Ok(())
    }

    pub fn link_back_master(&self, back_master_index: BackMasterIndex) {
        let outcome = self
            .inner
            .state
            .lock()
            .linked_back_masters
            .link(back_master_index, Vec::new);
        trace!(
            target = "shoal::front_master",
            front_master_index = self.inner.index,
            back_master_index,
            ?outcome,
            "linked back master"
        );
    }

    /// Drops one link on `back_master_index`. Messages still queued when the
    /// last link goes are sent right away rather than discarded.
    pub fn unlink_back_master(&self, back_master_index: BackMasterIndex) {
        let outcome = self
            .inner
            .state
            .lock()
            .linked_back_masters
            .unlink(&back_master_index);
        match outcome {
            UnlinkOutcome::Absent => warn!(
                target = "shoal::front_master",
                front_master_index = self.inner.index,
                back_master_index,
                "unlink from a back master that was never linked"
            ),
            UnlinkOutcome::Removed(queued) if !queued.is_empty() => {
                if let Err(err) = self.push_batch(back_master_index, &queued) {
                    warn!(
                        target = "shoal::front_master",
                        back_master_index,
                        dropped = queued.len(),
                        error = %err,
                        "final queued batch not delivered"
                    );
                }
            }
            _ => {}
        }
    }

    /// Appends `message` to the queue of `back_master_index`. Queuing towards
    /// a back master with no linked channel is a call-ordering bug and fails.
    pub fn add_queued_message(
        &self,
        back_master_index: BackMasterIndex,
        message: ChannelMessage,
    ) -> ShardResult<()> {
        let mut state = self.inner.state.lock();
        let queue = state
            .linked_back_masters
            .get_mut(&back_master_index)
            .ok_or(ShardError::BackMasterNotLinked { back_master_index })?;
        queue.push(message);
        Ok(())
    }

    /// Pushes every non-empty queue as one SEND_QUEUED batch and clears it.
    /// Returns how many batches were sent.
    pub fn send_queued_messages(&self) -> ShardResult<usize> {
        let batches: Vec<(BackMasterIndex, Vec<ChannelMessage>)> = {
            let mut state = self.inner.state.lock();
            state
                .linked_back_masters
                .iter_mut()
                .filter(|(_, queue)| !queue.is_empty())
                .map(|(index, queue)| (*index, std::mem::take(queue)))
                .collect()
        };
        let mut sent = 0usize;
        let mut first_error = None;
        for (back_master_index, batch) in batches {
            match self.push_batch(back_master_index, &batch) {
                Ok(()) => sent += 1,
                Err(err) => {
                    warn!(
                        target = "shoal::front_master",
                        back_master_index,
                        error = %err,
                        "queued batch not delivered"
                    );
                    first_error.get_or_insert(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(sent),
        }
    }

    fn push_batch(&self, back_master_index: BackMasterIndex, batch: &[ChannelMessage]) -> ShardResult<()> {
        trace!(
            target = "shoal::front_master",
            front_master_index = self.inner.index,
            back_master_index,
            messages = batch.len(),
            "sending queued batch"
        );
        self.inner
            .core
            .push(&Topic::send_queued(back_master_index), &batch)
    }

    /// Dispatches a PATCH_STATE batch, in order, to the addressed channels.
    pub fn handle_state_patches(&self, batch: Vec<StatePatch>) {
        for patch in batch {
            match self.inner.channels.get(&patch.channel_id) {
                Some(channel) => {
                    channel.patch_state(Bytes::from(patch.patch));
                }
                None => warn!(
                    target = "shoal::front_master",
                    front_master_index = self.inner.index,
                    channel_id = %patch.channel_id,
                    "patch for a channel this master does not own"
                ),
            }
        }
    }

    /// Delivers a MESSAGE_CLIENT payload. Clients that have since
    /// disconnected from this process are skipped silently.
    pub fn handle_client_message(&self, message: ClientMessage) {
        let client = self.inner.state.lock().clients.get(&message.client_uid).cloned();
        let Some(client) = client else {
            debug!(
                target = "shoal::front_master",
                client_uid = %message.client_uid,
                "direct message for a client no longer here"
            );
            return;
        };
        match self.inner.codec.decode(&message.payload) {
            Ok(value) => client.deliver(value),
            Err(err) => warn!(
                target = "shoal::front_master",
                client_uid = %message.client_uid,
                error = %err,
                "undecodable direct message"
            ),
        }
    }

    pub fn create_client(&self, client_uid: impl Into<ClientUid>) -> ShardResult<Client> {
        let client_uid = client_uid.into();
        let mut state = self.inner.state.lock();
        if state.clients.contains_key(&client_uid) {
            return Err(ShardError::DuplicateClient { client_uid });
        }
        let client = Client::new(client_uid.clone(), Arc::downgrade(&self.inner));
        state.clients.insert(client_uid, client.clone());
        Ok(client)
    }

    pub fn client(&self, client_uid: &str) -> Option<Client> {
        self.inner.state.lock().clients.get(client_uid).cloned()
    }

    pub(crate) fn remove_client(&self, client_uid: &str) -> Option<Client> {
        self.inner.state.lock().clients.remove(client_uid)
    }

    pub fn disconnect_client(&self, client_uid: &str) -> ShardResult<()> {
        let client = self.client(client_uid).ok_or_else(|| ShardError::UnknownClient {
            client_uid: client_uid.to_string(),
        })?;
        client.disconnect()
    }

    pub fn connected_client_uids(&self) -> Vec<ClientUid> {
        let mut uids: Vec<ClientUid> = self.inner.state.lock().clients.keys().cloned().collect();
        uids.sort();
        uids
    }

    pub fn linked_back_master_indexes(&self) -> Vec<BackMasterIndex> {
        self.inner
            .state
            .lock()
            .linked_back_masters
            .keys()
            .copied()
            .collect()
    }

    pub fn back_master_link_count(&self, back_master_index: BackMasterIndex) -> usize {
        self.inner
            .state
            .lock()
            .linked_back_masters
            .count(&back_master_index)
    }

    pub fn queued_message_count(&self, back_master_index: BackMasterIndex) -> usize {
        self.inner
            .state
            .lock()
            .linked_back_masters
            .get(&back_master_index)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn close(&self) {
        for channel in self.inner.channels.values() {
            channel.close();
        }
        self.inner.core.close();
        let mut state = self.inner.state.lock();
        state.linked_back_masters.clear();
        state.clients.clear();
    }
}
