//! Per-process owner of every back channel on a back process.
//!
//! Aggregates, per remote front master, how many (channel, front) link pairs
//! route through it together with the patches waiting to be sent there, and,
//! per client, how many back channels it listens to.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, error, trace, warn};
use transport_bus::Bus;

use crate::back_channel::BackChannel;
use crate::channel::{envelope_handler, ChannelCore};
use crate::codec::{StateCodec, StateDelta};
use crate::error::{ShardError, ShardResult};
use crate::ids::{BackMasterIndex, ChannelId, ClientUid, FrontMasterIndex};
use crate::protocol::{ChannelMessage, ClientMessage, StatePatch, Topic};
use crate::refcount::{LinkOutcome, RefCountMap, UnlinkOutcome};

#[derive(Default)]
struct BackMasterState {
    connected_front_masters: BTreeSet<FrontMasterIndex>,
    linked_front_masters: RefCountMap<FrontMasterIndex, Vec<StatePatch>>,
    linked_clients: RefCountMap<ClientUid, FrontMasterIndex>,
}

pub(crate) struct BackMasterInner {
    index: BackMasterIndex,
    core: ChannelCore,
    codec: Arc<dyn StateCodec>,
    channels: BTreeMap<ChannelId, BackChannel>,
    state: Mutex<BackMasterState>,
}

#[derive(Clone)]
pub struct BackMasterChannel {
    inner: Arc<BackMasterInner>,
}

impl BackMasterChannel {
    pub fn new<I, S>(
        index: BackMasterIndex,
        channel_ids: I,
        messenger: Arc<dyn Bus>,
        codec: Arc<dyn StateCodec>,
        delta: Arc<dyn StateDelta>,
    ) -> ShardResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<ChannelId>,
    {
        let channel_ids: Vec<ChannelId> = channel_ids.into_iter().map(Into::into).collect();
        let inner = Arc::new_cyclic(|master: &Weak<BackMasterInner>| {
            let channels = channel_ids
                .iter()
                .map(|channel_id| {
                    let channel = BackChannel::new(
                        channel_id.clone(),
                        index,
                        master.clone(),
                        Arc::clone(&messenger),
                        Arc::clone(&codec),
                        Arc::clone(&delta),
                    );
                    (channel_id.clone(), channel)
                })
                .collect();
            BackMasterInner {
                index,
                core: ChannelCore::new(format!("back-master-{index}"), Arc::clone(&messenger)),
                codec: Arc::clone(&codec),
                channels,
                state: Mutex::new(BackMasterState::default()),
            }
        });
        for channel in inner.channels.values() {
            channel.register()?;
        }
        debug!(
            target = "shoal::back_master",
            back_master_index = index,
            channels = inner.channels.len(),
            "back master ready"
        );
        Ok(Self { inner })
    }

    pub(crate) fn from_weak(
        master: &Weak<BackMasterInner>,
        channel_id: &str,
    ) -> ShardResult<Self> {
        master
            .upgrade()
            .map(|inner| Self { inner })
            .ok_or_else(|| ShardError::MasterDropped {
                channel_id: channel_id.to_string(),
            })
    }

    pub fn index(&self) -> BackMasterIndex {
        self.inner.index
    }

    pub fn channel(&self, channel_id: &str) -> Option<BackChannel> {
        self.inner.channels.get(channel_id).cloned()
    }

    pub fn channels(&self) -> impl Iterator<Item = &BackChannel> {
        self.inner.channels.values()
    }

    /// Called by a child channel when a mirrored front finishes connecting.
    /// The batched-message receiver is registered on the first front master
    /// ever seen; later calls for a known front master are no-ops.
    pub fn on_channel_connection(&self, front_master_index: FrontMasterIndex) {
        let first_ever = {
            let mut state = self.inner.state.lock();
            let was_empty = state.connected_front_masters.is_empty();
            if !state.connected_front_masters.insert(front_master_index) {
                return;
            }
            was_empty
        };
        debug!(
            target = "shoal::back_master",
            back_master_index = self.inner.index,
            front_master_index,
            "front master connected"
        );
        if first_ever {
            let handler = envelope_handler(&self.inner, |inner, batch: Vec<ChannelMessage>| {
                BackMasterChannel {
                    inner: Arc::clone(inner),
                }
                .handle_queued_messages(batch);
            });
            if let Err(err) = self
                .inner
                .core
                .pull(&Topic::send_queued(self.inner.index), handler)
            {
                error!(
                    target = "shoal::back_master",
                    back_master_index = self.inner.index,
                    error = %err,
                    "failed to register queued message receiver"
                );
            }
        }
    }

    pub fn linked_channel_from(&self, front_master_index: FrontMasterIndex) {
        let outcome = self
            .inner
            .state
            .lock()
            .linked_front_masters
            .link(front_master_index, Vec::new);
        trace!(
            target = "shoal::back_master",
            back_master_index = self.inner.index,
            front_master_index,
            ?outcome,
            "linked channel from front master"
        );
    }

    pub fn unlinked_channel_from(&self, front_master_index: FrontMasterIndex) {
        let outcome = self
            .inner
            .state
            .lock()
            .linked_front_masters
            .unlink(&front_master_index);
        match outcome {
            UnlinkOutcome::Absent => warn!(
                target = "shoal::back_master",
                back_master_index = self.inner.index,
                front_master_index,
                "unlink from a front master that was never linked"
            ),
            UnlinkOutcome::Removed(pending) if !pending.is_empty() => debug!(
                target = "shoal::back_master",
                front_master_index,
                dropped = pending.len(),
                "front master unlinked with patches still queued"
            ),
            _ => {}
        }
    }

    pub fn added_client_link(&self, client_uid: &str, front_master_index: FrontMasterIndex) {
        let mut state = self.inner.state.lock();
        let outcome = state
            .linked_clients
            .link(client_uid.to_string(), || front_master_index);
        if let LinkOutcome::Incremented(_) = outcome {
            let known = state.linked_clients.get(&client_uid.to_string()).copied();
            if known != Some(front_master_index) {
                warn!(
                    target = "shoal::back_master",
                    client_uid,
                    known = ?known,
                    front_master_index,
                    "client linked through a second front master; keeping the first"
                );
            }
        }
    }

    pub fn removed_client_link(&self, client_uid: &str) {
        let outcome = self
            .inner
            .state
            .lock()
            .linked_clients
            .unlink(&client_uid.to_string());
        if let UnlinkOutcome::Absent = outcome {
            warn!(
                target = "shoal::back_master",
                client_uid, "removed a client link that was never added"
            );
        }
    }

    /// Queues `patch` for every front master in `front_master_indexes` that is
    /// currently linked.
    pub fn add_state_patch(
        &self,
        front_master_indexes: &[FrontMasterIndex],
        channel_id: &str,
        patch: Bytes,
    ) {
        let mut state = self.inner.state.lock();
        for front_master_index in front_master_indexes {
            match state.linked_front_masters.get_mut(front_master_index) {
                Some(batch) => batch.push(StatePatch {
                    channel_id: channel_id.to_string(),
                    patch: patch.to_vec(),
                }),
                None => warn!(
                    target = "shoal::back_master",
                    channel_id,
                    front_master_index,
                    "patch addressed to an unlinked front master"
                ),
            }
        }
    }

    /// Pushes every non-empty patch batch to its front master and clears it.
    /// Returns how many batches were sent.
    pub fn send_state_patches(&self) -> ShardResult<usize> {
        let batches: Vec<(FrontMasterIndex, Vec<StatePatch>)> = {
            let mut state = self.inner.state.lock();
            state
                .linked_front_masters
                .iter_mut()
                .filter(|(_, batch)| !batch.is_empty())
                .map(|(index, batch)| (*index, std::mem::take(batch)))
                .collect()
        };
        self.push_batches(batches)
    }

    /// Sends whatever is queued for one front master ahead of a message that
    /// must not overtake it.
    pub(crate) fn flush_state_patches_to(&self, front_master_index: FrontMasterIndex) {
        let batch = {
            let mut state = self.inner.state.lock();
            match state.linked_front_masters.get_mut(&front_master_index) {
                Some(batch) if !batch.is_empty() => std::mem::take(batch),
                _ => return,
            }
        };
        if let Err(err) = self.push_batches(vec![(front_master_index, batch)]) {
            warn!(
                target = "shoal::back_master",
                front_master_index,
                error = %err,
                "failed to flush patches"
            );
        }
    }

    fn push_batches(&self, batches: Vec<(FrontMasterIndex, Vec<StatePatch>)>) -> ShardResult<usize> {
        let mut sent = 0usize;
        let mut first_error = None;
        for (front_master_index, batch) in batches {
            trace!(
                target = "shoal::back_master",
                back_master_index = self.inner.index,
                front_master_index,
                patches = batch.len(),
                "sending patch batch"
            );
            match self
                .inner
                .core
                .push(&Topic::patch_state(front_master_index), &batch)
            {
                Ok(()) => sent += 1,
                Err(err) => {
                    warn!(
                        target = "shoal::back_master",
                        front_master_index,
                        error = %err,
                        "patch batch not delivered"
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

    /// Dispatches a SEND_QUEUED batch to the addressed child channels.
    pub fn handle_queued_messages(&self, batch: Vec<ChannelMessage>) {
        for message in batch {
            let Some(channel) = self.inner.channels.get(&message.channel_id) else {
                warn!(
                    target = "shoal::back_master",
                    back_master_index = self.inner.index,
                    channel_id = %message.channel_id,
                    "queued message for a channel this master does not own"
                );
                continue;
            };
            if let Err(err) = channel.handle_message(message) {
                error!(
                    target = "shoal::back_master",
                    channel_id = %channel.channel_id(),
                    error = %err,
                    "queued message handler failed"
                );
            }
        }
    }

    /// Sends `message` straight to the front master the client is linked
    /// through. Returns `Ok(false)` when the client is not linked to any
    /// channel of this master.
    pub fn message_client(&self, client_uid: &str, message: &Value) -> ShardResult<bool> {
        let front_master_index = self
            .inner
            .state
            .lock()
            .linked_clients
            .get(&client_uid.to_string())
            .copied();
        let Some(front_master_index) = front_master_index else {
            return Ok(false);
        };
        let payload = self.inner.codec.encode(message)?;
        self.inner.core.push(
            &Topic::message_client(front_master_index),
            &ClientMessage {
                client_uid: client_uid.to_string(),
                payload: payload.to_vec(),
            },
        )?;
        Ok(true)
    }

    pub fn linked_front_master_indexes_array(&self) -> Vec<FrontMasterIndex> {
        self.inner
            .state
            .lock()
            .linked_front_masters
            .keys()
            .copied()
            .collect()
    }

    pub fn front_master_link_count(&self, front_master_index: FrontMasterIndex) -> usize {
        self.inner
            .state
            .lock()
            .linked_front_masters
            .count(&front_master_index)
    }

    pub fn pending_patch_count(&self, front_master_index: FrontMasterIndex) -> usize {
        self.inner
            .state
            .lock()
            .linked_front_masters
            .get(&front_master_index)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn client_link_count(&self, client_uid: &str) -> usize {
        self.inner
            .state
            .lock()
            .linked_clients
            .count(&client_uid.to_string())
    }

    pub fn client_front_master(&self, client_uid: &str) -> Option<FrontMasterIndex> {
        self.inner
            .state
            .lock()
            .linked_clients
            .get(&client_uid.to_string())
            .copied()
    }

    pub fn connected_front_masters(&self) -> Vec<FrontMasterIndex> {
        self.inner
            .state
            .lock()
            .connected_front_masters
            .iter()
            .copied()
            .collect()
    }

    pub fn close(&self) {
        for channel in self.inner.channels.values() {
            channel.close();
        }
        self.inner.core.close();
        let mut state = self.inner.state.lock();
        state.connected_front_masters.clear();
        state.linked_front_masters.clear();
        state.linked_clients.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use transport_bus::LocalBus;

    use crate::codec::{JsonCodec, SpliceDelta};

    fn master(channel_ids: &[&str]) -> BackMasterChannel {
        BackMasterChannel::new(
            0,
            channel_ids.iter().copied(),
            Arc::new(LocalBus::new()),
            Arc::new(JsonCodec),
            Arc::new(SpliceDelta),
        )
        .expect("back master")
    }

    #[test]
    fn front_master_entry_follows_link_count() {
        let master = master(&["a"]);
        master.linked_channel_from(2);
        master.linked_channel_from(2);
        assert_eq!(master.front_master_link_count(2), 2);
        assert_eq!(master.linked_front_master_indexes_array(), vec![2]);

        master.unlinked_channel_from(2);
        assert_eq!(master.linked_front_master_indexes_array(), vec![2]);
        master.unlinked_channel_from(2);
        assert!(master.linked_front_master_indexes_array().is_empty());

        // An extra unlink must not resurrect or underflow the entry.
        master.unlinked_channel_from(2);
        assert_eq!(master.front_master_link_count(2), 0);
    }

    #[test]
    fn client_lookup_is_removed_at_zero() {
        let master = master(&["a", "b"]);
        master.added_client_link("c1", 4);
        master.added_client_link("c1", 4);
        assert_eq!(master.client_link_count("c1"), 2);
        assert_eq!(master.client_front_master("c1"), Some(4));

        master.removed_client_link("c1");
        assert_eq!(master.client_link_count("c1"), 1);
        master.removed_client_link("c1");
        assert_eq!(master.client_front_master("c1"), None);
        master.removed_client_link("c1");
        assert_eq!(master.client_link_count("c1"), 0);
    }

    #[test]
    fn client_keeps_its_first_front_master() {
        let master = master(&["a"]);
        master.added_client_link("c1", 1);
        master.added_client_link("c1", 9);
        assert_eq!(master.client_front_master("c1"), Some(1));
    }

    #[test]
    fn patches_only_queue_for_linked_front_masters() {
        let master = master(&["a"]);
        master.linked_channel_from(1);
        master.add_state_patch(&[1, 2], "a", Bytes::from_static(b"p"));
        assert_eq!(master.pending_patch_count(1), 1);
        assert_eq!(master.pending_patch_count(2), 0);
    }

    #[test]
    fn message_client_reports_unknown_clients() {
        let master = master(&["a"]);
        assert!(!master
            .message_client("ghost", &serde_json::json!({"hi": 1}))
            .expect("lookup"));
    }

    #[tokio::test]
    async fn connection_registers_queued_receiver_once() {
        let bus = Arc::new(LocalBus::new());
        let master = BackMasterChannel::new(
            3,
            ["a"],
            bus.clone(),
            Arc::new(JsonCodec),
            Arc::new(SpliceDelta),
        )
        .expect("back master");
        assert!(!bus.has_puller("12-3"));
        master.on_channel_connection(0);
        master.on_channel_connection(1);
        master.on_channel_connection(0);
        assert!(bus.has_puller("12-3"));
        assert_eq!(master.connected_front_masters(), vec![0, 1]);
    }

    proptest! {
        #[test]
        fn entries_exist_while_links_are_outstanding(links in proptest::collection::vec(0u32..5, 0..40)) {
            let master = master(&["a"]);
            let mut outstanding: BTreeMap<u32, usize> = BTreeMap::new();
            for index in &links {
                master.linked_channel_from(*index);
                master.added_client_link(&format!("client-{index}"), *index);
                *outstanding.entry(*index).or_default() += 1;
            }
            for index in &links {
                master.unlinked_channel_from(*index);
                master.removed_client_link(&format!("client-{index}"));
                let left = outstanding.get_mut(index).expect("linked above");
                *left -= 1;
                prop_assert_eq!(
                    master.linked_front_master_indexes_array().contains(index),
                    *left > 0
                );
                prop_assert_eq!(master.front_master_link_count(*index), *left);
                prop_assert_eq!(master.client_link_count(&format!("client-{index}")), *left);
            }
            prop_assert!(master.linked_front_master_indexes_array().is_empty());
        }
    }
}
