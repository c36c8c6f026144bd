//! Authoritative side of one shard: owns the state, answers the connect and
//! link protocol for fronts, and turns state changes into patches.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::{debug, error, trace, warn};
use transport_bus::Bus;

use crate::back_master::{BackMasterChannel, BackMasterInner};
use crate::channel::{envelope_handler, ChannelCore};
use crate::codec::{StateCodec, StateDelta};
use crate::error::{ShardError, ShardResult};
use crate::hooks::{BackChannelHandler, BackChannelObserver, LinkPolicy};
use crate::ids::{BackMasterIndex, ClientUid, FrontMasterIndex, FrontUid};
use crate::protocol::{
    AcceptLink, ChannelMessage, ClientRequest, ConnectRequest, ConnectionChange,
    ConnectionStatus, FrontMessage, MessageKind, Topic,
};

#[derive(Default)]
struct BackChannelState {
    state: Option<Value>,
    /// Last encoding handed to fronts; snapshots and the next diff use it.
    previous_state_encoded: Option<Bytes>,
    connected_fronts: BTreeMap<FrontUid, FrontMasterIndex>,
    mirrored_front_uids: BTreeSet<FrontUid>,
    listening_client_uids: BTreeSet<ClientUid>,
    writing_client_uids: BTreeSet<ClientUid>,
    /// A front uid is present only while its client set is non-empty.
    linked_front_and_client_uids: BTreeMap<FrontUid, BTreeSet<ClientUid>>,
}

impl BackChannelState {
    fn linked_front_master_indexes(&self) -> Vec<FrontMasterIndex> {
        let indexes: BTreeSet<FrontMasterIndex> = self
            .linked_front_and_client_uids
            .keys()
            .map(|front_uid| front_uid.front_master_index)
            .collect();
        indexes.into_iter().collect()
    }
}

struct BackChannelInner {
    core: ChannelCore,
    back_master_index: BackMasterIndex,
    master: Weak<BackMasterInner>,
    codec: Arc<dyn StateCodec>,
    delta: Arc<dyn StateDelta>,
    handler: RwLock<Option<Arc<dyn BackChannelHandler>>>,
    policy: RwLock<Option<Arc<dyn LinkPolicy>>>,
    observer: RwLock<Option<Arc<dyn BackChannelObserver>>>,
    state: Mutex<BackChannelState>,
}

#[derive(Clone)]
pub struct BackChannel {
    inner: Arc<BackChannelInner>,
}

impl BackChannel {
    pub(crate) fn new(
        channel_id: String,
        back_master_index: BackMasterIndex,
        master: Weak<BackMasterInner>,
        messenger: Arc<dyn Bus>,
        codec: Arc<dyn StateCodec>,
        delta: Arc<dyn StateDelta>,
    ) -> Self {
        Self {
            inner: Arc::new(BackChannelInner {
                core: ChannelCore::new(channel_id, messenger),
                back_master_index,
                master,
                codec,
                delta,
                handler: RwLock::new(None),
                policy: RwLock::new(None),
                observer: RwLock::new(None),
                state: Mutex::new(BackChannelState::default()),
            }),
        }
    }

    fn from_inner(inner: &Arc<BackChannelInner>) -> Self {
        Self {
            inner: Arc::clone(inner),
        }
    }

    /// Registers the cluster-wide receivers: CONNECT, BROADCAST_ALL_BACK and
    /// this channel's SEND_BACK.
    pub(crate) fn register(&self) -> ShardResult<()> {
        let core = &self.inner.core;
        let channel_id = core.channel_id().to_string();

        core.subscribe(
            &Topic::connect(),
            &channel_id,
            envelope_handler(&self.inner, |inner, request: ConnectRequest| {
                BackChannel::from_inner(inner).handle_connect(request);
            }),
        )?;
        core.subscribe(
            &Topic::broadcast_all_back(),
            &channel_id,
            envelope_handler(&self.inner, |inner, message: ChannelMessage| {
                BackChannel::from_inner(inner).dispatch_logged(message);
            }),
        )?;
        core.pull(
            &Topic::send_back(&channel_id),
            envelope_handler(&self.inner, |inner, message: ChannelMessage| {
                BackChannel::from_inner(inner).dispatch_logged(message);
            }),
        )?;
        Ok(())
    }

    pub fn channel_id(&self) -> &str {
        self.inner.core.channel_id()
    }

    pub fn back_master_index(&self) -> BackMasterIndex {
        self.inner.back_master_index
    }

    fn master(&self) -> ShardResult<BackMasterChannel> {
        BackMasterChannel::from_weak(&self.inner.master, self.channel_id())
    }

    pub fn set_handler(&self, handler: Arc<dyn BackChannelHandler>) {
        *self.inner.handler.write() = Some(handler);
    }

    pub fn set_link_policy(&self, policy: Arc<dyn LinkPolicy>) {
        *self.inner.policy.write() = Some(policy);
    }

    pub fn set_observer(&self, observer: Arc<dyn BackChannelObserver>) {
        *self.inner.observer.write() = Some(observer);
    }

    fn observer(&self) -> Option<Arc<dyn BackChannelObserver>> {
        self.inner.observer.read().clone()
    }

    fn decode_options(&self, options: &[u8]) -> ShardResult<Value> {
        if options.is_empty() {
            return Ok(Value::Null);
        }
        self.inner.codec.decode(options)
    }

    fn handle_connect(&self, request: ConnectRequest) {
        let front_uid = request.front_uid.clone();
        let (known, mirrored) = {
            let mut state = self.inner.state.lock();
            if state.connected_fronts.contains_key(&front_uid) {
                (true, false)
            } else {
                state
                    .connected_fronts
                    .insert(front_uid.clone(), request.front_master_index);
                let mirrored = request.channel_id == self.channel_id();
                if mirrored {
                    state.mirrored_front_uids.insert(front_uid.clone());
                }
                (false, mirrored)
            }
        };

        if known {
            debug!(
                target = "shoal::back_channel",
                channel_id = %self.channel_id(),
                front_uid = %front_uid,
                "repeated connect; acknowledging again"
            );
        } else {
            if mirrored {
                if let Err(err) = self.register_front_receivers(&front_uid) {
                    error!(
                        target = "shoal::back_channel",
                        channel_id = %self.channel_id(),
                        front_uid = %front_uid,
                        error = %err,
                        "failed to register front receivers"
                    );
                }
                match self.master() {
                    Ok(master) => master.on_channel_connection(request.front_master_index),
                    Err(err) => warn!(
                        target = "shoal::back_channel",
                        error = %err,
                        "connect without master"
                    ),
                }
            }
            if let Some(observer) = self.observer() {
                observer.on_front_connected(self.channel_id(), &front_uid);
            }
            trace!(
                target = "shoal::back_channel",
                channel_id = %self.channel_id(),
                front_uid = %front_uid,
                mirrored,
                "front connected"
            );
        }

        self.reply_connection(&front_uid, ConnectionStatus::Connected);
    }

    fn reply_connection(&self, front_uid: &FrontUid, status: ConnectionStatus) {
        let change = ConnectionChange {
            channel_id: self.channel_id().to_string(),
            back_master_index: self.inner.back_master_index,
            status,
        };
        if let Err(err) = self.inner.core.push(
            &Topic::for_front(MessageKind::ConnectionChange, front_uid),
            &change,
        ) {
            warn!(
                target = "shoal::back_channel",
                channel_id = %self.channel_id(),
                front_uid = %front_uid,
                error = %err,
                "connection change not delivered"
            );
        }
    }

    fn register_front_receivers(&self, front_uid: &FrontUid) -> ShardResult<()> {
        let core = &self.inner.core;
        let kinds = [
            MessageKind::Link,
            MessageKind::Unlink,
            MessageKind::AddClientWrite,
            MessageKind::RemoveClientWrite,
        ];
        for kind in kinds {
            let from = front_uid.clone();
            let handler = envelope_handler(&self.inner, move |inner, request: ClientRequest| {
                let channel = BackChannel::from_inner(inner);
                match kind {
                    MessageKind::Link => channel.handle_link(&from, request),
                    MessageKind::Unlink => channel.handle_unlink(&from, request),
                    MessageKind::AddClientWrite => channel.handle_add_client_write(request),
                    _ => channel.handle_remove_client_write(request),
                }
            });
            core.pull(&Topic::for_front(kind, front_uid), handler)?;
        }
        Ok(())
    }

    fn handle_link(&self, front_uid: &FrontUid, request: ClientRequest) {
        let client_uid = request.client_uid;
        let options = match self.decode_options(&request.options) {
            Ok(options) => options,
            Err(err) => {
                warn!(
                    target = "shoal::back_channel",
                    client_uid = %client_uid,
                    error = %err,
                    "undecodable link options"
                );
                return;
            }
        };
        let policy = self.inner.policy.read().clone();
        let accepted = match policy {
            Some(policy) => policy.on_add_client_listen(self.channel_id(), &client_uid, &options),
            None => Some(options),
        };
        let Some(accepted) = accepted else {
            debug!(
                target = "shoal::back_channel",
                channel_id = %self.channel_id(),
                client_uid = %client_uid,
                "link refused"
            );
            return;
        };
        let master = match self.master() {
            Ok(master) => master,
            Err(err) => {
                warn!(target = "shoal::back_channel", error = %err, "link without master");
                return;
            }
        };
        let encoded_options = match self.inner.codec.encode(&accepted) {
            Ok(bytes) => bytes,
            Err(err) => {
                error!(
                    target = "shoal::back_channel",
                    client_uid = %client_uid,
                    error = %err,
                    "cannot encode accepted options"
                );
                return;
            }
        };

        let front_master_index = front_uid.front_master_index;
        let (encoded_state, first_for_front) = {
            let mut state = self.inner.state.lock();
            if !state.listening_client_uids.insert(client_uid.clone()) {
                debug!(
                    target = "shoal::back_channel",
                    channel_id = %self.channel_id(),
                    client_uid = %client_uid,
                    "client already listening"
                );
                return;
            }
            let encoded_state = state.previous_state_encoded.clone().unwrap_or_default();
            let clients = state
                .linked_front_and_client_uids
                .entry(front_uid.clone())
                .or_default();
            let first = clients.is_empty();
            clients.insert(client_uid.clone());
            (encoded_state, first)
        };

        master.added_client_link(&client_uid, front_master_index);
        // Patches diffed against an older base must reach the front before
        // the snapshot does, otherwise the new client would receive them.
        master.flush_state_patches_to(front_master_index);
        let accept = AcceptLink {
            encoded_state: encoded_state.to_vec(),
            client_uid: client_uid.clone(),
            options: encoded_options.to_vec(),
            link_ticket: request.link_ticket,
        };
        if let Err(err) = self
            .inner
            .core
            .push(&Topic::for_front(MessageKind::AcceptLink, front_uid), &accept)
        {
            warn!(
                target = "shoal::back_channel",
                channel_id = %self.channel_id(),
                front_uid = %front_uid,
                error = %err,
                "accept not delivered"
            );
        }
        if first_for_front {
            master.linked_channel_from(front_master_index);
        }
        debug!(
            target = "shoal::back_channel",
            channel_id = %self.channel_id(),
            client_uid = %client_uid,
            front_uid = %front_uid,
            "client linked"
        );
        if let Some(observer) = self.observer() {
            observer.on_added_client_listener(self.channel_id(), &client_uid, &accepted);
        }
    }

    fn handle_unlink(&self, front_uid: &FrontUid, request: ClientRequest) {
        let client_uid = request.client_uid;
        let options = self.decode_options(&request.options).unwrap_or(Value::Null);

        let emptied_front = {
            let mut state = self.inner.state.lock();
            if !state.listening_client_uids.remove(&client_uid) {
                trace!(
                    target = "shoal::back_channel",
                    channel_id = %self.channel_id(),
                    client_uid = %client_uid,
                    "unlink for a client that is not listening"
                );
                return;
            }
            let holder = if state
                .linked_front_and_client_uids
                .get(front_uid)
                .is_some_and(|clients| clients.contains(&client_uid))
            {
                Some(front_uid.clone())
            } else {
                state
                    .linked_front_and_client_uids
                    .iter()
                    .find(|(_, clients)| clients.contains(&client_uid))
                    .map(|(uid, _)| uid.clone())
            };
            match holder {
                Some(holder) => {
                    let emptied = state
                        .linked_front_and_client_uids
                        .get_mut(&holder)
                        .map(|clients| {
                            clients.remove(&client_uid);
                            clients.is_empty()
                        })
                        .unwrap_or(false);
                    if emptied {
                        state.linked_front_and_client_uids.remove(&holder);
                        Some(holder.front_master_index)
                    } else {
                        None
                    }
                }
                None => None,
            }
        };

        match self.master() {
            Ok(master) => {
                if let Some(front_master_index) = emptied_front {
                    master.unlinked_channel_from(front_master_index);
                }
                master.removed_client_link(&client_uid);
            }
            Err(err) => warn!(
                target = "shoal::back_channel",
                error = %err,
                "unlink without master"
            ),
        }
        debug!(
            target = "shoal::back_channel",
            channel_id = %self.channel_id(),
            client_uid = %client_uid,
            "client unlinked"
        );
        if let Some(observer) = self.observer() {
            observer.on_removed_client_listener(self.channel_id(), &client_uid, &options);
        }
    }

    fn handle_add_client_write(&self, request: ClientRequest) {
        let client_uid = request.client_uid;
        let options = self.decode_options(&request.options).unwrap_or(Value::Null);
        let policy = self.inner.policy.read().clone();
        let accepted = match policy {
            Some(policy) => policy.on_add_client_write(self.channel_id(), &client_uid, &options),
            None => Some(options),
        };
        let Some(accepted) = accepted else {
            debug!(
                target = "shoal::back_channel",
                channel_id = %self.channel_id(),
                client_uid = %client_uid,
                "write refused"
            );
            return;
        };
        let added = self
            .inner
            .state
            .lock()
            .writing_client_uids
            .insert(client_uid.clone());
        if added {
            if let Some(observer) = self.observer() {
                observer.on_added_client_write(self.channel_id(), &client_uid, &accepted);
            }
        }
    }

    fn handle_remove_client_write(&self, request: ClientRequest) {
        let client_uid = request.client_uid;
        let options = self.decode_options(&request.options).unwrap_or(Value::Null);
        let removed = self
            .inner
            .state
            .lock()
            .writing_client_uids
            .remove(&client_uid);
        if removed {
            if let Some(observer) = self.observer() {
                observer.on_removed_client_write(self.channel_id(), &client_uid, &options);
            }
        }
    }

    fn dispatch_logged(&self, message: ChannelMessage) {
        if let Err(err) = self.handle_message(message) {
            error!(
                target = "shoal::back_channel",
                channel_id = %self.channel_id(),
                error = %err,
                "message handler failed"
            );
        }
    }

    /// Routes an inbound message to `on_client_message` when it came from a
    /// client and to `on_message` otherwise.
    pub fn handle_message(&self, message: ChannelMessage) -> ShardResult<()> {
        let value = self.inner.codec.decode(&message.payload)?;
        let handler = self.inner.handler.read().clone();
        match (handler, message.from_client) {
            (Some(handler), Some(client_uid)) => {
                handler.on_client_message(self.channel_id(), &client_uid, value)
            }
            (Some(handler), None) => handler.on_message(self.channel_id(), value),
            (None, from_client) => Err(ShardError::MissingHandler {
                channel_id: self.channel_id().to_string(),
                hook: if from_client.is_some() {
                    "on_client_message"
                } else {
                    "on_message"
                },
            }),
        }
    }

    /// Replaces the state and makes its encoding the new baseline. No patch
    /// is produced.
    pub fn set_state(&self, state: Value) -> ShardResult<()> {
        let encoded = self.inner.codec.encode(&state)?;
        let mut guard = self.inner.state.lock();
        guard.state = Some(state);
        guard.previous_state_encoded = Some(encoded);
        Ok(())
    }

    /// Replaces the state without touching the baseline; the change goes out
    /// on the next [`BackChannel::patch_state`].
    pub fn replace_state(&self, state: Value) {
        self.inner.state.lock().state = Some(state);
    }

    /// Mutates the state in place. `mutate` runs under the channel lock and
    /// must not call back into this channel.
    pub fn update_state<F: FnOnce(&mut Value)>(&self, mutate: F) {
        let mut guard = self.inner.state.lock();
        mutate(guard.state.get_or_insert(Value::Null));
    }

    pub fn state(&self) -> Option<Value> {
        self.inner.state.lock().state.clone()
    }

    /// Last encoding sent to fronts, or empty when no state was ever set.
    pub fn encoded_state(&self) -> Bytes {
        self.inner
            .state
            .lock()
            .previous_state_encoded
            .clone()
            .unwrap_or_default()
    }

    /// Diffs the current state against the last broadcast encoding and queues
    /// the patch for every linked front master. Returns `false` when the
    /// encodings are identical.
    pub fn patch_state(&self) -> ShardResult<bool> {
        let (patch, front_master_indexes) = {
            let mut guard = self.inner.state.lock();
            let Some(current) = guard.state.as_ref() else {
                return Ok(false);
            };
            let encoded = self.inner.codec.encode(current)?;
            let previous = guard.previous_state_encoded.clone().unwrap_or_default();
            if encoded == previous {
                return Ok(false);
            }
            let patch = self.inner.delta.diff(&previous, &encoded)?;
            guard.previous_state_encoded = Some(encoded);
            (patch, guard.linked_front_master_indexes())
        };
        trace!(
            target = "shoal::back_channel",
            channel_id = %self.channel_id(),
            bytes = patch.len(),
            fronts = front_master_indexes.len(),
            "state patched"
        );
        if !front_master_indexes.is_empty() {
            self.master()?
                .add_state_patch(&front_master_indexes, self.channel_id(), patch);
        }
        Ok(true)
    }

    /// Replaces the state and immediately patches it.
    pub fn apply_state(&self, state: Value) -> ShardResult<bool> {
        self.replace_state(state);
        self.patch_state()
    }

    fn front_message(&self, message: &Value) -> ShardResult<FrontMessage> {
        Ok(FrontMessage {
            channel_id: self.channel_id().to_string(),
            payload: self.inner.codec.encode(message)?.to_vec(),
        })
    }

    /// Sends to one connected front.
    pub fn send(&self, message: &Value, front_uid: &FrontUid) -> ShardResult<()> {
        if !self.inner.state.lock().connected_fronts.contains_key(front_uid) {
            return Err(ShardError::UnknownFront {
                channel_id: self.channel_id().to_string(),
                front_uid: front_uid.clone(),
            });
        }
        let envelope = self.front_message(message)?;
        self.inner
            .core
            .push(&Topic::for_front(MessageKind::SendFront, front_uid), &envelope)
    }

    /// Sends to every front when `front_uids` is `None`, otherwise only to
    /// the listed fronts.
    pub fn broadcast(&self, message: &Value, front_uids: Option<&[FrontUid]>) -> ShardResult<()> {
        match front_uids {
            None => {
                let envelope = self.front_message(message)?;
                self.inner
                    .core
                    .publish(&Topic::broadcast_all_fronts(), &envelope)
            }
            Some(front_uids) => {
                for front_uid in front_uids {
                    self.send(message, front_uid)?;
                }
                Ok(())
            }
        }
    }

    /// Sends to every front that has at least one linked client.
    pub fn broadcast_linked(&self, message: &Value) -> ShardResult<()> {
        let envelope = self.front_message(message)?;
        let linked: Vec<FrontUid> = self
            .inner
            .state
            .lock()
            .linked_front_and_client_uids
            .keys()
            .cloned()
            .collect();
        for front_uid in linked {
            self.inner.core.push(
                &Topic::for_front(MessageKind::BroadcastLinkedFronts, &front_uid),
                &envelope,
            )?;
        }
        Ok(())
    }

    pub fn message_client(&self, client_uid: &str, message: &Value) -> ShardResult<bool> {
        self.master()?.message_client(client_uid, message)
    }

    pub fn connected_front_uids(&self) -> Vec<FrontUid> {
        self.inner
            .state
            .lock()
            .connected_fronts
            .keys()
            .cloned()
            .collect()
    }

    pub fn mirrored_front_uids(&self) -> Vec<FrontUid> {
        self.inner
            .state
            .lock()
            .mirrored_front_uids
            .iter()
            .cloned()
            .collect()
    }

    pub fn listening_client_uids(&self) -> Vec<ClientUid> {
        self.inner
            .state
            .lock()
            .listening_client_uids
            .iter()
            .cloned()
            .collect()
    }

    pub fn writing_client_uids(&self) -> Vec<ClientUid> {
        self.inner
            .state
            .lock()
            .writing_client_uids
            .iter()
            .cloned()
            .collect()
    }

    pub fn linked_front_uids(&self) -> Vec<FrontUid> {
        self.inner
            .state
            .lock()
            .linked_front_and_client_uids
            .keys()
            .cloned()
            .collect()
    }

    pub fn linked_client_uids_for(&self, front_uid: &FrontUid) -> Vec<ClientUid> {
        self.inner
            .state
            .lock()
            .linked_front_and_client_uids
            .get(front_uid)
            .map(|clients| clients.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn linked_front_master_indexes(&self) -> Vec<FrontMasterIndex> {
        self.inner.state.lock().linked_front_master_indexes()
    }

    /// Tells every connected front this channel is going away, releases the
    /// master-level counts it holds and drops its bus registrations.
    pub fn close(&self) {
        let (fronts, linked) = {
            let mut state = self.inner.state.lock();
            state.mirrored_front_uids.clear();
            state.listening_client_uids.clear();
            state.writing_client_uids.clear();
            (
                std::mem::take(&mut state.connected_fronts),
                std::mem::take(&mut state.linked_front_and_client_uids),
            )
        };
        if let Ok(master) = self.master() {
            for (front_uid, clients) in &linked {
                for client_uid in clients {
                    master.removed_client_link(client_uid);
                }
                master.unlinked_channel_from(front_uid.front_master_index);
            }
        }
        for front_uid in fronts.keys() {
            self.reply_connection(front_uid, ConnectionStatus::Disconnected);
        }
        self.inner.core.close();
        debug!(
            target = "shoal::back_channel",
            channel_id = %self.channel_id(),
            fronts = fronts.len(),
            "back channel closed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use transport_bus::LocalBus;

    use crate::codec::{JsonCodec, SpliceDelta};

    fn master() -> BackMasterChannel {
        BackMasterChannel::new(
            0,
            ["lobby"],
            Arc::new(LocalBus::new()),
            Arc::new(JsonCodec),
            Arc::new(SpliceDelta),
        )
        .expect("back master")
    }

    #[test]
    fn unchanged_state_produces_no_patch() {
        let master = master();
        let channel = master.channel("lobby").expect("channel");
        channel.set_state(json!({"foo": "bar"})).expect("set");
        assert!(!channel.patch_state().expect("patch"));

        channel.replace_state(json!({"foo": "bar"}));
        assert!(!channel.patch_state().expect("patch"));
    }

    #[test]
    fn patch_advances_the_baseline() {
        let master = master();
        let channel = master.channel("lobby").expect("channel");
        channel.set_state(json!({"foo": "bar"})).expect("set");

        channel.update_state(|state| state["foo"] = json!("baz"));
        assert!(channel.patch_state().expect("patch"));
        assert_eq!(
            JsonCodec.decode(&channel.encoded_state()).expect("decode"),
            json!({"foo": "baz"})
        );
        assert!(!channel.patch_state().expect("second patch"));
    }

    #[test]
    fn channel_without_state_has_an_empty_snapshot() {
        let master = master();
        let channel = master.channel("lobby").expect("channel");
        assert!(channel.encoded_state().is_empty());
        assert!(!channel.patch_state().expect("patch"));
    }

    #[test]
    fn messages_without_a_handler_name_the_channel() {
        let master = master();
        let channel = master.channel("lobby").expect("channel");
        let err = channel
            .handle_message(ChannelMessage {
                channel_id: "lobby".into(),
                payload: b"1".to_vec(),
                from_client: Some("c1".into()),
            })
            .unwrap_err();
        match err {
            ShardError::MissingHandler { channel_id, hook } => {
                assert_eq!(channel_id, "lobby");
                assert_eq!(hook, "on_client_message");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn sending_to_an_unknown_front_fails() {
        let master = master();
        let channel = master.channel("lobby").expect("channel");
        let err = channel
            .send(&json!("hi"), &FrontUid::new("lobby", 9))
            .unwrap_err();
        assert!(matches!(err, ShardError::UnknownFront { .. }));
    }
}
