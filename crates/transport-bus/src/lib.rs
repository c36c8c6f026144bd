use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Bytes,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus channel closed")]
    Closed,
    #[error("bus transport error: {0}")]
    Transport(String),
    #[error("no receiver pulling topic '{0}'")]
    NoReceiver(String),
    #[error("topic '{0}' already has a puller")]
    DuplicatePuller(String),
}

pub type BusResult<T> = Result<T, BusError>;

/// Callback invoked once per delivered message.
pub type Handler = Arc<dyn Fn(BusMessage) + Send + Sync>;

/// Named publish/subscribe and push/pull primitives.
///
/// `publish` fans a message out to every subscriber of a topic, while `push`
/// delivers to the single receiver that `pull`s the topic.
pub trait Bus: Send + Sync {
    fn publish(&self, topic: &str, payload: Bytes) -> BusResult<()>;
    fn subscribe(&self, topic: &str, subscriber_id: &str, handler: Handler) -> BusResult<()>;
    fn unsubscribe(&self, topic: &str, subscriber_id: &str) -> bool;
    fn push(&self, topic: &str, payload: Bytes) -> BusResult<()>;
    fn pull(&self, topic: &str, handler: Handler) -> BusResult<()>;
    fn remove_pull(&self, topic: &str) -> bool;
    fn close(&self);
}

struct Delivery {
    handler: Handler,
    message: BusMessage,
}

#[derive(Default)]
struct Routes {
    subscribers: HashMap<String, Vec<(String, Handler)>>,
    pullers: HashMap<String, Handler>,
}

/// In-memory bus for tests and single-process clusters.
///
/// Every delivery goes through one FIFO queue drained by a single pump task,
/// so handlers never run concurrently with each other.
pub struct LocalBus {
    routes: RwLock<Routes>,
    queue: mpsc::UnboundedSender<Delivery>,
    pending_rx: Mutex<Option<mpsc::UnboundedReceiver<Delivery>>>,
    pump: OnceLock<JoinHandle<()>>,
    closed: AtomicBool,
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalBus {
    pub fn new() -> Self {
        let (queue, rx) = mpsc::unbounded_channel();
        Self {
            routes: RwLock::new(Routes::default()),
            queue,
            pending_rx: Mutex::new(Some(rx)),
            pump: OnceLock::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> BusResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::Closed);
        }
        Ok(())
    }

    fn ensure_pump(&self) -> BusResult<()> {
        if self.pump.get().is_some() {
            return Ok(());
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|err| BusError::Transport(format!("no tokio runtime: {err}")))?;
        let Some(mut rx) = self.pending_rx.lock().take() else {
            return Ok(());
        };
        let handle = runtime.spawn(async move {
            while let Some(delivery) = rx.recv().await {
                trace!(
                    target = "transport.bus",
                    topic = %delivery.message.topic,
                    bytes = delivery.message.payload.len(),
                    "dispatching"
                );
                (delivery.handler)(delivery.message);
            }
            debug!(target = "transport.bus", "dispatch queue closed");
        });
        let _ = self.pump.set(handle);
        Ok(())
    }

    fn enqueue(&self, handler: Handler, topic: &str, payload: Bytes) -> BusResult<()> {
        self.queue
            .send(Delivery {
                handler,
                message: BusMessage {
                    topic: topic.to_string(),
                    payload,
                },
            })
            .map_err(|_| BusError::Closed)
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.routes
            .read()
            .subscribers
            .get(topic)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn has_puller(&self, topic: &str) -> bool {
        self.routes.read().pullers.contains_key(topic)
    }
}

impl Bus for LocalBus {
    fn publish(&self, topic: &str, payload: Bytes) -> BusResult<()> {
        self.ensure_open()?;
        self.ensure_pump()?;
        let handlers: Vec<Handler> = self
            .routes
            .read()
            .subscribers
            .get(topic)
            .map(|subs| subs.iter().map(|(_, handler)| Arc::clone(handler)).collect())
            .unwrap_or_default();
        for handler in handlers {
            self.enqueue(handler, topic, payload.clone())?;
        }
        Ok(())
    }

    fn subscribe(&self, topic: &str, subscriber_id: &str, handler: Handler) -> BusResult<()> {
        self.ensure_open()?;
        let mut routes = self.routes.write();
        let subs = routes.subscribers.entry(topic.to_string()).or_default();
        match subs.iter_mut().find(|(id, _)| id == subscriber_id) {
            Some(existing) => existing.1 = handler,
            None => subs.push((subscriber_id.to_string(), handler)),
        }
        Ok(())
    }

    fn unsubscribe(&self, topic: &str, subscriber_id: &str) -> bool {
        let mut routes = self.routes.write();
        let Some(subs) = routes.subscribers.get_mut(topic) else {
            return false;
        };
        let before = subs.len();
        subs.retain(|(id, _)| id != subscriber_id);
        let removed = subs.len() != before;
        if subs.is_empty() {
            routes.subscribers.remove(topic);
        }
        removed
    }

    fn push(&self, topic: &str, payload: Bytes) -> BusResult<()> {
        self.ensure_open()?;
        self.ensure_pump()?;
        let handler = self
            .routes
            .read()
            .pullers
            .get(topic)
            .cloned()
            .ok_or_else(|| BusError::NoReceiver(topic.to_string()))?;
        self.enqueue(handler, topic, payload)
    }

    fn pull(&self, topic: &str, handler: Handler) -> BusResult<()> {
        self.ensure_open()?;
        let mut routes = self.routes.write();
        if routes.pullers.contains_key(topic) {
            return Err(BusError::DuplicatePuller(topic.to_string()));
        }
        routes.pullers.insert(topic.to_string(), handler);
        Ok(())
    }

    fn remove_pull(&self, topic: &str) -> bool {
        self.routes.write().pullers.remove(topic).is_some()
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut routes = self.routes.write();
        routes.subscribers.clear();
        routes.pullers.clear();
        drop(routes);
        if let Some(handle) = self.pump.get() {
            handle.abort();
        }
        debug!(target = "transport.bus", "local bus closed");
    }
}
