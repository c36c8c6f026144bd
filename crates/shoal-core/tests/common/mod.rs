#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::Value;
use transport_bus::LocalBus;

use shoal_core::{
    BackChannel, BackChannelHandler, BackChannelObserver, BackMasterChannel, BackMasterIndex,
    ChannelConfig, ClientUid, FrontChannel, FrontChannelHandler, FrontMasterChannel, JsonCodec,
    LinkPolicy, ShardResult, SpliceDelta, StateCodec,
};

/// Back masters laid out as given plus `front_masters` front masters that
/// each mirror every channel, all on one in-memory bus.
pub struct Cluster {
    pub bus: Arc<LocalBus>,
    pub backs: Vec<BackMasterChannel>,
    pub fronts: Vec<FrontMasterChannel>,
}

impl Cluster {
    pub fn new(layout: &[&[&str]], front_masters: u32) -> Self {
        Self::with_config(layout, front_masters, ChannelConfig::default())
    }

    pub fn with_config(layout: &[&[&str]], front_masters: u32, config: ChannelConfig) -> Self {
        let bus = Arc::new(LocalBus::new());
        let backs = layout
            .iter()
            .enumerate()
            .map(|(index, channel_ids)| {
                BackMasterChannel::new(
                    index as BackMasterIndex,
                    channel_ids.iter().copied(),
                    bus.clone(),
                    Arc::new(JsonCodec),
                    Arc::new(SpliceDelta),
                )
                .expect("back master")
            })
            .collect();
        let all_ids: Vec<&str> = layout.iter().flat_map(|ids| ids.iter().copied()).collect();
        let fronts = (0..front_masters)
            .map(|index| {
                FrontMasterChannel::new(
                    index,
                    all_ids.iter().copied(),
                    bus.clone(),
                    Arc::new(JsonCodec),
                    config,
                )
                .expect("front master")
            })
            .collect();
        Self { bus, backs, fronts }
    }

    pub async fn connect(&self) {
        for front in &self.fronts {
            front.connect_all().await.expect("connect");
        }
    }

    pub fn back_channel(&self, channel_id: &str) -> BackChannel {
        self.backs
            .iter()
            .find_map(|master| master.channel(channel_id))
            .expect("back channel")
    }

    pub fn front_channel(&self, front_master_index: usize, channel_id: &str) -> FrontChannel {
        self.fronts[front_master_index]
            .channel(channel_id)
            .expect("front channel")
    }
}

/// Lets the bus dispatcher drain. The clock is paused in these tests, so
/// the sleep only completes once every task is idle.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

pub fn decode(bytes: &[u8]) -> Value {
    JsonCodec.decode(bytes).expect("decode")
}

#[derive(Default)]
pub struct FrontRecorder {
    pub messages: Mutex<Vec<Value>>,
    pub patches: Mutex<Vec<Bytes>>,
    pub connected: Mutex<Vec<BackMasterIndex>>,
    pub disconnected: Mutex<usize>,
}

impl FrontChannelHandler for FrontRecorder {
    fn on_message(&self, _channel_id: &str, message: Value) -> ShardResult<()> {
        self.messages.lock().push(message);
        Ok(())
    }

    fn on_connected(&self, _channel_id: &str, back_master_index: BackMasterIndex) {
        self.connected.lock().push(back_master_index);
    }

    fn on_disconnected(&self, _channel_id: &str) {
        *self.disconnected.lock() += 1;
    }

    fn on_patch_state(&self, _channel_id: &str, patch: &Bytes) {
        self.patches.lock().push(patch.clone());
    }
}

#[derive(Default)]
pub struct BackRecorder {
    /// `(from_client, message)` in arrival order.
    pub messages: Mutex<Vec<(Option<ClientUid>, Value)>>,
    pub listeners_added: Mutex<Vec<ClientUid>>,
    pub listeners_removed: Mutex<Vec<ClientUid>>,
    pub writers_added: Mutex<Vec<ClientUid>>,
    pub writers_removed: Mutex<Vec<ClientUid>>,
}

impl BackChannelHandler for BackRecorder {
    fn on_message(&self, _channel_id: &str, message: Value) -> ShardResult<()> {
        self.messages.lock().push((None, message));
        Ok(())
    }

    fn on_client_message(
        &self,
        _channel_id: &str,
        client_uid: &str,
        message: Value,
    ) -> ShardResult<()> {
        self.messages
            .lock()
            .push((Some(client_uid.to_string()), message));
        Ok(())
    }
}

impl BackChannelObserver for BackRecorder {
    fn on_added_client_listener(&self, _channel_id: &str, client_uid: &ClientUid, _options: &Value) {
        self.listeners_added.lock().push(client_uid.clone());
    }

    fn on_removed_client_listener(
        &self,
        _channel_id: &str,
        client_uid: &ClientUid,
        _options: &Value,
    ) {
        self.listeners_removed.lock().push(client_uid.clone());
    }

    fn on_added_client_write(&self, _channel_id: &str, client_uid: &ClientUid, _options: &Value) {
        self.writers_added.lock().push(client_uid.clone());
    }

    fn on_removed_client_write(&self, _channel_id: &str, client_uid: &ClientUid, _options: &Value) {
        self.writers_removed.lock().push(client_uid.clone());
    }
}

/// Refuses the listed clients and tags accepted options.
pub struct RefuseClients(pub Vec<&'static str>);

impl LinkPolicy for RefuseClients {
    fn on_add_client_listen(
        &self,
        _channel_id: &str,
        client_uid: &str,
        options: &Value,
    ) -> Option<Value> {
        if self.0.contains(&client_uid) {
            return None;
        }
        Some(serde_json::json!({ "accepted": options.clone() }))
    }
}
