//! Single-process cluster: every back and front master of a node sharing one
//! in-memory bus, plus the timers that flush their batches.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use bytes::Bytes;
use futures::future::try_join_all;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, info, warn};
use transport_bus::{Bus, LocalBus};

use shoal_core::{
    BackChannel, BackChannelHandler, BackMasterChannel, BackMasterIndex, ChannelId, Client,
    FrontMasterChannel, JsonCodec, ShardResult, SpliceDelta, StateDelta, UpdateKind,
};

use crate::config::NodeConfig;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct Room {
    moves: u64,
    last_client: Option<String>,
}

/// Application state behind every back channel: a move counter per room.
#[derive(Debug, Default)]
pub struct RoomBook {
    rooms: Mutex<HashMap<ChannelId, Room>>,
}

impl RoomBook {
    pub fn snapshot(&self, channel_id: &str) -> Value {
        let rooms = self.rooms.lock();
        let room = rooms.get(channel_id).cloned().unwrap_or_default();
        json!({ "moves": room.moves, "last": room.last_client })
    }

    pub fn total_moves(&self) -> u64 {
        self.rooms.lock().values().map(|room| room.moves).sum()
    }
}

impl BackChannelHandler for RoomBook {
    fn on_message(&self, channel_id: &str, message: Value) -> ShardResult<()> {
        debug!(target = "shoal_node::rooms", channel_id, %message, "front message");
        Ok(())
    }

    fn on_client_message(
        &self,
        channel_id: &str,
        client_uid: &str,
        message: Value,
    ) -> ShardResult<()> {
        let mut rooms = self.rooms.lock();
        let room = rooms.entry(channel_id.to_string()).or_default();
        room.moves += 1;
        room.last_client = Some(client_uid.to_string());
        debug!(
            target = "shoal_node::rooms",
            channel_id,
            client_uid,
            %message,
            moves = room.moves,
            "move recorded"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DemoReport {
    pub clients: usize,
    pub messages_sent: u64,
    pub moves_recorded: u64,
    /// Clients whose rebuilt state matches their back channel's encoding.
    pub consistent_clients: usize,
}

pub struct LocalCluster {
    config: NodeConfig,
    bus: Arc<LocalBus>,
    backs: Vec<BackMasterChannel>,
    fronts: Vec<FrontMasterChannel>,
    rooms: Arc<RoomBook>,
    ticks: Vec<JoinHandle<()>>,
}

impl LocalCluster {
    /// Builds every master, seeds each room and waits for all front channels
    /// to connect. Must run inside a tokio runtime.
    pub async fn start(config: NodeConfig) -> anyhow::Result<Self> {
        let bus = Arc::new(LocalBus::new());
        let rooms = Arc::new(RoomBook::default());
        let messenger: Arc<dyn Bus> = bus.clone();

        let mut backs = Vec::new();
        for index in 0..config.back_masters {
            let master = BackMasterChannel::new(
                index as BackMasterIndex,
                config.channel_ids_for_back_master(index),
                Arc::clone(&messenger),
                Arc::new(JsonCodec),
                Arc::new(SpliceDelta),
            )
            .with_context(|| format!("building back master {index}"))?;
            for channel in master.channels() {
                channel.set_handler(rooms.clone());
                channel.set_state(rooms.snapshot(channel.channel_id()))?;
            }
            backs.push(master);
        }

        let channel_config = config.channel_config();
        let fronts = (0..config.front_masters)
            .map(|index| {
                FrontMasterChannel::new(
                    index,
                    config.channel_id_list(),
                    Arc::clone(&messenger),
                    Arc::new(JsonCodec),
                    channel_config,
                )
                .with_context(|| format!("building front master {index}"))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        try_join_all(fronts.iter().map(|front| front.connect_all()))
            .await
            .context("connecting front channels")?;
        info!(
            target = "shoal_node::cluster",
            back_masters = backs.len(),
            front_masters = fronts.len(),
            channels = config.channel_id_list().len(),
            "cluster connected"
        );

        let mut cluster = Self {
            config,
            bus,
            backs,
            fronts,
            rooms,
            ticks: Vec::new(),
        };
        cluster.spawn_ticks();
        Ok(cluster)
    }

    fn spawn_ticks(&mut self) {
        let backs = self.backs.clone();
        let rooms = Arc::clone(&self.rooms);
        let period = self.config.patch_interval();
        self.ticks.push(tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                for master in &backs {
                    publish_rooms(master, &rooms);
                }
            }
        }));

        let fronts = self.fronts.clone();
        let period = self.config.queue_interval();
        self.ticks.push(tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                for master in &fronts {
                    if let Err(err) = master.send_queued_messages() {
                        warn!(
                            target = "shoal_node::cluster",
                            front_master_index = master.index(),
                            error = %err,
                            "queued messages not sent"
                        );
                    }
                }
            }
        }));
    }

    pub fn back_channel(&self, channel_id: &str) -> Option<BackChannel> {
        self.backs
            .iter()
            .find_map(|master| master.channel(channel_id))
    }

    /// Connects `clients` clients spread over every front master and room,
    /// has each send one move per round, then checks that every client's
    /// replicated state matches its room.
    pub async fn run_demo(&self, clients: usize, rounds: u32) -> anyhow::Result<DemoReport> {
        let channel_ids = self.config.channel_id_list();
        if channel_ids.is_empty() || self.fronts.is_empty() {
            bail!("demo needs at least one channel and one front master");
        }
        let mut sessions: Vec<(Client, ChannelId)> = Vec::with_capacity(clients);
        for n in 0..clients {
            let front = &self.fronts[n % self.fronts.len()];
            let channel_id = channel_ids[n % channel_ids.len()].clone();
            let client = front.create_client(format!("player-{n}"))?;
            client
                .link(&channel_id, json!({ "seat": n }))
                .await
                .with_context(|| format!("linking {} to {channel_id}", client.uid()))?;
            client.set_processor_channel(&channel_id, Value::Null)?;
            sessions.push((client, channel_id));
        }

        let mut messages_sent = 0u64;
        for round in 0..rounds {
            for (client, _) in &sessions {
                client.send(&json!({ "round": round }))?;
                messages_sent += 1;
            }
            sleep(self.config.queue_interval()).await;
        }
        // Long enough for the last moves to be queued, applied and patched.
        sleep(3 * (self.config.queue_interval() + self.config.patch_interval())).await;

        let mut consistent_clients = 0usize;
        for (client, channel_id) in &sessions {
            let back = self
                .back_channel(channel_id)
                .ok_or_else(|| anyhow!("no back channel owns {channel_id}"))?;
            let rebuilt = rebuild_state(client, channel_id)?;
            if rebuilt == back.encoded_state() {
                consistent_clients += 1;
            } else {
                warn!(
                    target = "shoal_node::cluster",
                    client_uid = client.uid(),
                    channel_id = %channel_id,
                    "client state diverged"
                );
            }
        }

        let report = DemoReport {
            clients: sessions.len(),
            messages_sent,
            moves_recorded: self.rooms.total_moves(),
            consistent_clients,
        };
        for (client, _) in sessions {
            if let Err(err) = client.disconnect() {
                warn!(
                    target = "shoal_node::cluster",
                    client_uid = client.uid(),
                    error = %err,
                    "client disconnect failed"
                );
            }
        }
        Ok(report)
    }

    pub fn shutdown(self) {
        for tick in &self.ticks {
            tick.abort();
        }
        for front in &self.fronts {
            for client_uid in front.connected_client_uids() {
                if let Err(err) = front.disconnect_client(&client_uid) {
                    debug!(
                        target = "shoal_node::cluster",
                        %client_uid,
                        error = %err,
                        "disconnect during shutdown"
                    );
                }
            }
            front.close();
        }
        for back in &self.backs {
            back.close();
        }
        self.bus.close();
        info!(target = "shoal_node::cluster", "cluster stopped");
    }
}

fn publish_rooms(master: &BackMasterChannel, rooms: &RoomBook) {
    for channel in master.channels() {
        if let Err(err) = channel.apply_state(rooms.snapshot(channel.channel_id())) {
            warn!(
                target = "shoal_node::cluster",
                channel_id = %channel.channel_id(),
                error = %err,
                "state patch failed"
            );
        }
    }
    if let Err(err) = master.send_state_patches() {
        warn!(
            target = "shoal_node::cluster",
            back_master_index = master.index(),
            error = %err,
            "patch batches not sent"
        );
    }
}

/// Replays a client's snapshot and patches for one channel.
fn rebuild_state(client: &Client, channel_id: &str) -> anyhow::Result<Bytes> {
    let mut state = Bytes::new();
    for update in client.take_updates_for(channel_id) {
        state = match update.kind {
            UpdateKind::Set => update.payload,
            UpdateKind::Patch => SpliceDelta.apply_patch(&state, &update.payload)?,
        };
    }
    Ok(state)
}
