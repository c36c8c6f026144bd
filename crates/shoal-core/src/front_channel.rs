//! Client-facing proxy for one shard on a front process.
//!
//! Drives the front half of the connect and link handshakes. A client uid is
//! either linking (a pending request with an armed timer), linked, or
//! neither; never both.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::{debug, error, trace, warn};
use transport_bus::Bus;

use crate::channel::{envelope_handler, ChannelCore};
use crate::client::Client;
use crate::codec::StateCodec;
use crate::config::ChannelConfig;
use crate::error::{ShardError, ShardResult};
use crate::front_master::{FrontMasterChannel, FrontMasterInner};
use crate::hooks::FrontChannelHandler;
use crate::ids::{BackMasterIndex, ChannelId, ClientUid, FrontMasterIndex, FrontUid};
use crate::pending::{wait, PendingRequests};
use crate::protocol::{
    AcceptLink, ChannelMessage, ClientRequest, ConnectRequest, ConnectionChange,
    ConnectionStatus, FrontMessage, MessageKind, Topic,
};

/// What a successful link hands back to the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkResponse {
    /// Encoded snapshot at accept time; empty when the back never had state.
    pub encoded_state: Bytes,
    /// Options as accepted (possibly rewritten) by the back's link policy.
    pub options: Value,
}

#[derive(Default)]
struct FrontChannelState {
    connected: bool,
    linked: bool,
    back_master_index: Option<BackMasterIndex>,
    connected_channel_ids: BTreeSet<ChannelId>,
    linked_clients: BTreeMap<ClientUid, Client>,
}

struct FrontChannelInner {
    core: ChannelCore,
    front_uid: FrontUid,
    /// Every shard id the front master mirrors.
    shard_ids: Arc<BTreeSet<ChannelId>>,
    config: ChannelConfig,
    master: Weak<FrontMasterInner>,
    codec: Arc<dyn StateCodec>,
    handler: RwLock<Option<Arc<dyn FrontChannelHandler>>>,
    connect_request: PendingRequests<(), ()>,
    /// Keyed by client uid; the context carries the LINK's ticket.
    link_requests: PendingRequests<ClientUid, LinkResponse, (Client, u64)>,
    next_link_ticket: AtomicU64,
    state: Mutex<FrontChannelState>,
}

#[derive(Clone)]
pub struct FrontChannel {
    inner: Arc<FrontChannelInner>,
}

impl FrontChannel {
    pub(crate) fn new(
        channel_id: ChannelId,
        front_master_index: FrontMasterIndex,
        shard_ids: Arc<BTreeSet<ChannelId>>,
        master: Weak<FrontMasterInner>,
        messenger: Arc<dyn Bus>,
        codec: Arc<dyn StateCodec>,
        config: ChannelConfig,
    ) -> Self {
        let front_uid = FrontUid::new(channel_id.clone(), front_master_index);
        Self {
            inner: Arc::new(FrontChannelInner {
                core: ChannelCore::new(channel_id, messenger),
                front_uid,
                shard_ids,
                config,
                master,
                codec,
                handler: RwLock::new(None),
                connect_request: PendingRequests::new(),
                link_requests: PendingRequests::new(),
                next_link_ticket: AtomicU64::new(1),
                state: Mutex::new(FrontChannelState::default()),
            }),
        }
    }

    fn from_inner(inner: &Arc<FrontChannelInner>) -> Self {
        Self {
            inner: Arc::clone(inner),
        }
    }

    pub(crate) fn register(&self) -> ShardResult<()> {
        let core = &self.inner.core;
        let front_uid = &self.inner.front_uid;

        core.subscribe(
            &Topic::broadcast_all_fronts(),
            &front_uid.to_string(),
            envelope_handler(&self.inner, |inner, message: FrontMessage| {
                FrontChannel::from_inner(inner).handle_front_message(message);
            }),
        )?;
        core.pull(
            &Topic::for_front(MessageKind::ConnectionChange, front_uid),
            envelope_handler(&self.inner, |inner, change: ConnectionChange| {
                FrontChannel::from_inner(inner).handle_connection_change(change);
            }),
        )?;
        core.pull(
            &Topic::for_front(MessageKind::AcceptLink, front_uid),
            envelope_handler(&self.inner, |inner, accept: AcceptLink| {
                FrontChannel::from_inner(inner).handle_accept_link(accept);
            }),
        )?;
        for kind in [MessageKind::SendFront, MessageKind::BroadcastLinkedFronts] {
            core.pull(
                &Topic::for_front(kind, front_uid),
                envelope_handler(&self.inner, |inner, message: FrontMessage| {
                    FrontChannel::from_inner(inner).handle_front_message(message);
                }),
            )?;
        }
        Ok(())
    }

    pub fn channel_id(&self) -> &str {
        self.inner.core.channel_id()
    }

    pub fn front_uid(&self) -> &FrontUid {
        &self.inner.front_uid
    }

    pub fn set_handler(&self, handler: Arc<dyn FrontChannelHandler>) {
        *self.inner.handler.write() = Some(handler);
    }

    fn handler(&self) -> Option<Arc<dyn FrontChannelHandler>> {
        self.inner.handler.read().clone()
    }

    fn master(&self) -> ShardResult<FrontMasterChannel> {
        FrontMasterChannel::from_weak(&self.inner.master).ok_or_else(|| {
            ShardError::MasterDropped {
                channel_id: self.channel_id().to_string(),
            }
        })
    }

    fn encode_options(&self, options: &Value) -> ShardResult<Vec<u8>> {
        Ok(self.inner.codec.encode(options)?.to_vec())
    }

    fn client_request(&self, client_uid: &str, options: Vec<u8>) -> ClientRequest {
        ClientRequest {
            client_uid: client_uid.to_string(),
            options,
            link_ticket: 0,
        }
    }

    fn push_to_back(&self, kind: MessageKind, request: &ClientRequest) -> ShardResult<()> {
        self.inner
            .core
            .push(&Topic::for_front(kind, &self.inner.front_uid), request)
    }

    /// Tells the back to drop `client_uid`. Only logs on failure: by the time
    /// this runs the front has already let the client go.
    fn release_on_back(&self, client_uid: &str, options: Vec<u8>) {
        let request = self.client_request(client_uid, options);
        if let Err(err) = self.push_to_back(MessageKind::Unlink, &request) {
            warn!(
                target = "shoal::front_channel",
                front_uid = %self.inner.front_uid,
                client_uid,
                error = %err,
                "unlink not delivered"
            );
        }
    }

    /// Announces this front to every back channel and resolves once every
    /// shard the front master mirrors has acknowledged. Never retried; a timed out
    /// caller must call again.
    pub async fn connect(&self) -> ShardResult<()> {
        if self.is_connected() {
            return Ok(());
        }
        let weak = Arc::downgrade(&self.inner);
        let channel_id = self.channel_id().to_string();
        let total = self.inner.shard_ids.len();
        let reply = self
            .inner
            .connect_request
            .begin((), (), self.inner.config.connect_timeout, move || {
                let connected = weak
                    .upgrade()
                    .map(|inner| inner.state.lock().connected_channel_ids.len())
                    .unwrap_or(0);
                ShardError::ConnectTimeout {
                    channel_id,
                    outstanding: total.saturating_sub(connected),
                }
            })
            .ok_or_else(|| ShardError::AlreadyConnecting {
                channel_id: self.channel_id().to_string(),
            })?;

        let request = ConnectRequest {
            channel_id: self.channel_id().to_string(),
            front_uid: self.inner.front_uid.clone(),
            front_master_index: self.inner.front_uid.front_master_index,
        };
        if let Err(err) = self.inner.core.publish(&Topic::connect(), &request) {
            if let Some(pending) = self.inner.connect_request.take(&()) {
                pending.cancel();
            }
            return Err(err);
        }
        trace!(
            target = "shoal::front_channel",
            front_uid = %self.inner.front_uid,
            total,
            "connect published"
        );
        wait(reply, || ShardError::MasterDropped {
            channel_id: self.channel_id().to_string(),
        })
        .await
    }

    fn handle_connection_change(&self, change: ConnectionChange) {
        let own = change.channel_id == self.channel_id();
        match change.status {
            ConnectionStatus::Connected => {
                if !self.inner.shard_ids.contains(&change.channel_id) {
                    debug!(
                        target = "shoal::front_channel",
                        front_uid = %self.inner.front_uid,
                        from = %change.channel_id,
                        "connect ack from an unknown shard ignored"
                    );
                    return;
                }
                let just_connected = {
                    let mut state = self.inner.state.lock();
                    state.connected_channel_ids.insert(change.channel_id.clone());
                    if own {
                        state.back_master_index = Some(change.back_master_index);
                    }
                    if !state.connected
                        && state.connected_channel_ids.len() >= self.inner.shard_ids.len()
                    {
                        state.connected = true;
                        Some(state.back_master_index)
                    } else {
                        None
                    }
                };
                let Some(back_master_index) = just_connected else {
                    return;
                };
                self.inner.connect_request.complete(&(), Ok(()));
                debug!(
                    target = "shoal::front_channel",
                    front_uid = %self.inner.front_uid,
                    back_master_index = ?back_master_index,
                    "connected"
                );
                match (back_master_index, self.handler()) {
                    (Some(back_master_index), Some(handler)) => {
                        handler.on_connected(self.channel_id(), back_master_index)
                    }
                    (None, _) => warn!(
                        target = "shoal::front_channel",
                        front_uid = %self.inner.front_uid,
                        "every shard answered but the mirrored back channel did not"
                    ),
                    _ => {}
                }
            }
            ConnectionStatus::Disconnected => {
                let released = {
                    let mut state = self.inner.state.lock();
                    state.connected_channel_ids.remove(&change.channel_id);
                    if own {
                        state.connected = false;
                        state.linked = false;
                        let clients = std::mem::take(&mut state.linked_clients);
                        Some((clients, state.back_master_index.take()))
                    } else {
                        None
                    }
                };
                debug!(
                    target = "shoal::front_channel",
                    front_uid = %self.inner.front_uid,
                    from = %change.channel_id,
                    "back channel disconnected"
                );
                let Some((clients, back_master_index)) = released else {
                    return;
                };
                // The back is gone, so there is nobody to send UNLINK to.
                self.release_links(clients, back_master_index);
                self.fail_link_requests();
                if let Some(handler) = self.handler() {
                    handler.on_disconnected(self.channel_id());
                }
            }
        }
    }

    /// Asks the mirrored back channel to start sending this client state.
    ///
    /// Resolves with the snapshot at accept time, or fails with
    /// [`ShardError::LinkTimeout`] when the back never answers (a refused
    /// link looks the same), or [`ShardError::LinkCancelled`] when the
    /// client unlinks or disconnects first.
    pub async fn link(&self, client: &Client, options: Value) -> ShardResult<LinkResponse> {
        let client_uid = client.uid().to_string();
        {
            let state = self.inner.state.lock();
            if state.linked_clients.contains_key(&client_uid) {
                return Err(ShardError::AlreadyLinked {
                    channel_id: self.channel_id().to_string(),
                    client_uid,
                });
            }
            if state.back_master_index.is_none() {
                return Err(ShardError::NotConnected {
                    channel_id: self.channel_id().to_string(),
                });
            }
        }
        let link_ticket = self.inner.next_link_ticket.fetch_add(1, Ordering::Relaxed);
        let request = ClientRequest {
            link_ticket,
            ..self.client_request(&client_uid, self.encode_options(&options)?)
        };

        let weak = Arc::downgrade(&self.inner);
        let channel_id = self.channel_id().to_string();
        let timeout_uid = client_uid.clone();
        let reply = self
            .inner
            .link_requests
            .begin(
                client_uid.clone(),
                (client.clone(), link_ticket),
                self.inner.config.link_timeout,
                move || {
                    // An accept may still be on its way; make the back forget
                    // whatever it registers for this attempt.
                    if let Some(inner) = weak.upgrade() {
                        FrontChannel::from_inner(&inner).release_on_back(&timeout_uid, Vec::new());
                    }
                    ShardError::LinkTimeout {
                        channel_id,
                        client_uid: timeout_uid,
                    }
                },
            )
            .ok_or_else(|| ShardError::AlreadyLinking {
                channel_id: self.channel_id().to_string(),
                client_uid: client_uid.clone(),
            })?;

        if let Err(err) = self.push_to_back(MessageKind::Link, &request) {
            if let Some(pending) = self.inner.link_requests.take(&client_uid) {
                pending.cancel();
            }
            return Err(err);
        }
        trace!(
            target = "shoal::front_channel",
            front_uid = %self.inner.front_uid,
            client_uid = %client_uid,
            link_ticket,
            "link requested"
        );
        wait(reply, || ShardError::LinkCancelled {
            channel_id: self.channel_id().to_string(),
            client_uid,
        })
        .await
    }

    fn handle_accept_link(&self, accept: AcceptLink) {
        let client_uid = accept.client_uid;
        let Some(pending) = self
            .inner
            .link_requests
            .take_if(&client_uid, |(_, ticket)| *ticket == accept.link_ticket)
        else {
            // Answers an attempt that was abandoned; the UNLINK sent when it
            // was abandoned follows this accept on the back.
            debug!(
                target = "shoal::front_channel",
                front_uid = %self.inner.front_uid,
                client_uid = %client_uid,
                link_ticket = accept.link_ticket,
                "stale accept ignored"
            );
            return;
        };

        let options = if accept.options.is_empty() {
            Ok(Value::Null)
        } else {
            self.inner.codec.decode(&accept.options)
        };
        let options = match options {
            Ok(options) => options,
            Err(err) => {
                pending.resolve(Err(err));
                self.release_on_back(&client_uid, Vec::new());
                return;
            }
        };

        let client = pending.context().0.clone();
        let (first, back_master_index) = {
            let mut state = self.inner.state.lock();
            let first = state.linked_clients.is_empty();
            state.linked_clients.insert(client_uid.clone(), client.clone());
            state.linked = true;
            (first, state.back_master_index)
        };
        if first {
            match (back_master_index, self.master()) {
                (Some(back_master_index), Ok(master)) => master.link_back_master(back_master_index),
                (None, _) => warn!(
                    target = "shoal::front_channel",
                    front_uid = %self.inner.front_uid,
                    "accept received while not connected"
                ),
                (_, Err(err)) => warn!(
                    target = "shoal::front_channel",
                    error = %err,
                    "accept without master"
                ),
            }
        }

        let encoded_state = Bytes::from(accept.encoded_state);
        client.record_link(self.channel_id(), encoded_state.clone());
        pending.resolve(Ok(LinkResponse {
            encoded_state,
            options,
        }));
        debug!(
            target = "shoal::front_channel",
            front_uid = %self.inner.front_uid,
            client_uid = %client_uid,
            "client linked"
        );
    }

    /// Unlinks a linked client or cancels a linking one, then tells the back.
    /// Returns `Ok(false)` when the client was neither. Local state is
    /// released even when the back can no longer be reached.
    pub fn unlink(&self, client_uid: &str, options: Value) -> ShardResult<bool> {
        let removed = {
            let mut state = self.inner.state.lock();
            match state.linked_clients.remove(client_uid) {
                Some(client) => {
                    let emptied = state.linked_clients.is_empty();
                    if emptied {
                        state.linked = false;
                    }
                    Some((client, emptied, state.back_master_index))
                }
                None => None,
            }
        };

        match removed {
            Some((client, emptied, back_master_index)) => {
                client.forget_link(self.channel_id());
                if emptied {
                    if let Some(back_master_index) = back_master_index {
                        self.master()?.unlink_back_master(back_master_index);
                    }
                }
            }
            None => match self.inner.link_requests.take(&client_uid.to_string()) {
                Some(pending) => {
                    pending.resolve(Err(ShardError::LinkCancelled {
                        channel_id: self.channel_id().to_string(),
                        client_uid: client_uid.to_string(),
                    }));
                }
                None => return Ok(false),
            },
        }

        let options = match self.encode_options(&options) {
            Ok(options) => options,
            Err(err) => {
                warn!(
                    target = "shoal::front_channel",
                    client_uid,
                    error = %err,
                    "unlink options dropped"
                );
                Vec::new()
            }
        };
        self.release_on_back(client_uid, options);
        debug!(
            target = "shoal::front_channel",
            front_uid = %self.inner.front_uid,
            client_uid,
            "client unlinked"
        );
        Ok(true)
    }

    fn require_connected(&self) -> ShardResult<BackMasterIndex> {
        self.inner
            .state
            .lock()
            .back_master_index
            .ok_or_else(|| ShardError::NotConnected {
                channel_id: self.channel_id().to_string(),
            })
    }

    pub fn add_client_write(&self, client_uid: &str, options: Value) -> ShardResult<()> {
        self.require_connected()?;
        let request = self.client_request(client_uid, self.encode_options(&options)?);
        self.push_to_back(MessageKind::AddClientWrite, &request)
    }

    pub fn remove_client_write(&self, client_uid: &str, options: Value) -> ShardResult<()> {
        self.require_connected()?;
        let request = self.client_request(client_uid, self.encode_options(&options)?);
        self.push_to_back(MessageKind::RemoveClientWrite, &request)
    }

    /// Queues `message` for the mirrored back channel; it leaves with the
    /// next SEND_QUEUED batch. Fails when no channel of this front master is
    /// linked to that back master.
    pub fn send(&self, message: &Value, from_client: Option<&str>) -> ShardResult<()> {
        let back_master_index = self.require_connected()?;
        let payload = self.inner.codec.encode(message)?.to_vec();
        self.master()?.add_queued_message(
            back_master_index,
            ChannelMessage {
                channel_id: self.channel_id().to_string(),
                payload,
                from_client: from_client.map(str::to_string),
            },
        )
    }

    /// Sends straight to back channel `target_channel_id`, bypassing the
    /// queue.
    pub fn send_direct(
        &self,
        target_channel_id: &str,
        message: &Value,
        from_client: Option<&str>,
    ) -> ShardResult<()> {
        let payload = self.inner.codec.encode(message)?.to_vec();
        self.inner.core.push(
            &Topic::send_back(target_channel_id),
            &ChannelMessage {
                channel_id: target_channel_id.to_string(),
                payload,
                from_client: from_client.map(str::to_string),
            },
        )
    }

    pub fn broadcast_all_back(&self, message: &Value, from_client: Option<&str>) -> ShardResult<()> {
        let payload = self.inner.codec.encode(message)?.to_vec();
        self.inner.core.publish(
            &Topic::broadcast_all_back(),
            &ChannelMessage {
                channel_id: self.channel_id().to_string(),
                payload,
                from_client: from_client.map(str::to_string),
            },
        )
    }

    /// Fans a raw patch out to every linked client and the patch observer.
    /// Ignored (returns `false`) while no client is linked.
    pub fn patch_state(&self, patch: Bytes) -> bool {
        let clients: Vec<Client> = {
            let state = self.inner.state.lock();
            if !state.linked {
                return false;
            }
            state.linked_clients.values().cloned().collect()
        };
        for client in &clients {
            client.queue_patch(self.channel_id(), patch.clone());
        }
        if let Some(handler) = self.handler() {
            handler.on_patch_state(self.channel_id(), &patch);
        }
        trace!(
            target = "shoal::front_channel",
            front_uid = %self.inner.front_uid,
            clients = clients.len(),
            "patch delivered"
        );
        true
    }

    fn handle_front_message(&self, message: FrontMessage) {
        let result = self
            .inner
            .codec
            .decode(&message.payload)
            .and_then(|value| match self.handler() {
                Some(handler) => handler.on_message(self.channel_id(), value),
                None => Err(ShardError::MissingHandler {
                    channel_id: self.channel_id().to_string(),
                    hook: "on_message",
                }),
            });
        if let Err(err) = result {
            error!(
                target = "shoal::front_channel",
                front_uid = %self.inner.front_uid,
                from = %message.channel_id,
                error = %err,
                "message handler failed"
            );
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state.lock().connected
    }

    pub fn is_linked(&self) -> bool {
        self.inner.state.lock().linked
    }

    pub fn is_linking(&self, client_uid: &str) -> bool {
        self.inner.link_requests.contains(&client_uid.to_string())
    }

    pub fn back_master_index(&self) -> Option<BackMasterIndex> {
        self.inner.state.lock().back_master_index
    }

    pub fn linked_client_uids(&self) -> Vec<ClientUid> {
        self.inner
            .state
            .lock()
            .linked_clients
            .keys()
            .cloned()
            .collect()
    }

    pub fn linking_client_uids(&self) -> Vec<ClientUid> {
        let mut uids = self.inner.link_requests.keys();
        uids.sort();
        uids
    }

    pub fn connected_channel_ids(&self) -> Vec<ChannelId> {
        self.inner
            .state
            .lock()
            .connected_channel_ids
            .iter()
            .cloned()
            .collect()
    }

    /// Releases every linked client, fails every in-flight request and
    /// drops bus registrations.
    pub fn close(&self) {
        let (clients, back_master_index) = {
            let mut state = self.inner.state.lock();
            state.connected = false;
            state.linked = false;
            state.connected_channel_ids.clear();
            (
                std::mem::take(&mut state.linked_clients),
                state.back_master_index.take(),
            )
        };
        for client_uid in clients.keys() {
            self.release_on_back(client_uid, Vec::new());
        }
        self.release_links(clients, back_master_index);
        for client_uid in self.fail_link_requests() {
            self.release_on_back(&client_uid, Vec::new());
        }
        if let Some(pending) = self.inner.connect_request.take(&()) {
            pending.resolve(Err(ShardError::NotConnected {
                channel_id: self.channel_id().to_string(),
            }));
        }
        self.inner.core.close();
    }

    /// Drops local link records for `clients` and, when there were any, this
    /// channel's hold on the front master's link to `back_master_index`.
    fn release_links(
        &self,
        clients: BTreeMap<ClientUid, Client>,
        back_master_index: Option<BackMasterIndex>,
    ) {
        if clients.is_empty() {
            return;
        }
        for client in clients.values() {
            client.forget_link(self.channel_id());
        }
        match (back_master_index, self.master()) {
            (Some(back_master_index), Ok(master)) => master.unlink_back_master(back_master_index),
            (None, _) => {}
            (_, Err(err)) => debug!(
                target = "shoal::front_channel",
                error = %err,
                "links released without master"
            ),
        }
        debug!(
            target = "shoal::front_channel",
            front_uid = %self.inner.front_uid,
            clients = clients.len(),
            "links released"
        );
    }

    /// Fails every in-flight link with `LinkCancelled`; returns their uids.
    fn fail_link_requests(&self) -> Vec<ClientUid> {
        self.inner
            .link_requests
            .take_all()
            .into_iter()
            .map(|(client_uid, pending)| {
                pending.resolve(Err(ShardError::LinkCancelled {
                    channel_id: self.channel_id().to_string(),
                    client_uid: client_uid.clone(),
                }));
                client_uid
            })
            .collect()
    }
}
