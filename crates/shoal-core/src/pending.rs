//! Correlation table for requests answered by a later reply message or by a
//! timer, whichever comes first.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::{ShardError, ShardResult};

pub type Reply<T> = oneshot::Receiver<ShardResult<T>>;

/// One in-flight request. Consuming it through [`Pending::resolve`] is the
/// only way its timer gets cancelled.
pub struct Pending<T, C> {
    ticket: u64,
    reply: oneshot::Sender<ShardResult<T>>,
    timer: JoinHandle<()>,
    context: C,
}

impl<T, C> Pending<T, C> {
    pub fn context(&self) -> &C {
        &self.context
    }

    /// Cancels the timer, delivers `result` to the waiting caller and hands
    /// back the request context.
    pub fn resolve(self, result: ShardResult<T>) -> C {
        self.timer.abort();
        let _ = self.reply.send(result);
        self.context
    }

    /// Drops the request without answering it; the waiting caller sees its
    /// sender dropped.
    pub fn cancel(self) -> C {
        self.timer.abort();
        self.context
    }
}

struct Table<K, T, C> {
    next_ticket: u64,
    entries: HashMap<K, Pending<T, C>>,
}

pub struct PendingRequests<K, T, C = ()> {
    table: Arc<Mutex<Table<K, T, C>>>,
}

impl<K, T, C> Default for PendingRequests<K, T, C> {
    fn default() -> Self {
        Self {
            table: Arc::new(Mutex::new(Table {
                next_ticket: 0,
                entries: HashMap::new(),
            })),
        }
    }
}

impl<K, T, C> PendingRequests<K, T, C>
where
    K: Eq + Hash + Clone + Send + 'static,
    T: Send + 'static,
    C: Send + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a request under `key` and arms its timer. Returns `None`
    /// when a request with the same key is already pending.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn begin<F>(&self, key: K, context: C, timeout: Duration, on_timeout: F) -> Option<Reply<T>>
    where
        F: FnOnce() -> ShardError + Send + 'static,
    {
        let mut table = self.table.lock();
        if table.entries.contains_key(&key) {
            return None;
        }
        table.next_ticket += 1;
        let ticket = table.next_ticket;

        let (reply, receiver) = oneshot::channel();
        let weak = Arc::downgrade(&self.table);
        let timer_key = key.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(table) = weak.upgrade() else {
                return;
            };
            let expired = {
                let mut table = table.lock();
                match table.entries.get(&timer_key) {
                    Some(pending) if pending.ticket == ticket => table.entries.remove(&timer_key),
                    _ => None,
                }
            };
            if let Some(pending) = expired {
                let _ = pending.reply.send(Err(on_timeout()));
            }
        });

        table.entries.insert(
            key,
            Pending {
                ticket,
                reply,
                timer,
                context,
            },
        );
        Some(receiver)
    }

    pub fn take(&self, key: &K) -> Option<Pending<T, C>> {
        self.table.lock().entries.remove(key)
    }

    /// Removes the request under `key` only when `matches` accepts its
    /// context.
    pub fn take_if(&self, key: &K, matches: impl FnOnce(&C) -> bool) -> Option<Pending<T, C>> {
        let mut table = self.table.lock();
        if table.entries.get(key).is_some_and(|pending| matches(&pending.context)) {
            table.entries.remove(key)
        } else {
            None
        }
    }

    pub fn take_all(&self) -> Vec<(K, Pending<T, C>)> {
        self.table.lock().entries.drain().collect()
    }

    /// Removes and resolves the request under `key`. Returns `false` when
    /// nothing was pending.
    pub fn complete(&self, key: &K, result: ShardResult<T>) -> bool {
        match self.take(key) {
            Some(pending) => {
                pending.resolve(result);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.table.lock().entries.contains_key(key)
    }

    pub fn keys(&self) -> Vec<K> {
        self.table.lock().entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.table.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Awaits a reply, mapping a dropped sender to `dropped`.
pub async fn wait<T>(reply: Reply<T>, dropped: impl FnOnce() -> ShardError) -> ShardResult<T> {
    match reply.await {
        Ok(result) => result,
        Err(_) => Err(dropped()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timeout_error() -> ShardError {
        ShardError::LinkTimeout {
            channel_id: "lobby".into(),
            client_uid: "c1".into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn completes_before_timer() {
        let pending: PendingRequests<String, u32> = PendingRequests::new();
        let reply = pending
            .begin("c1".into(), (), Duration::from_secs(5), timeout_error)
            .expect("first request");
        assert!(pending.complete(&"c1".to_string(), Ok(7)));
        assert_eq!(reply.await.unwrap().unwrap(), 7);
        assert!(pending.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn timer_rejects_and_clears_entry() {
        let pending: PendingRequests<String, u32> = PendingRequests::new();
        let reply = pending
            .begin("c1".into(), (), Duration::from_secs(5), timeout_error)
            .expect("first request");
        let result = reply.await.unwrap();
        assert!(matches!(result, Err(ShardError::LinkTimeout { .. })));
        assert!(!pending.contains(&"c1".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_key_is_refused() {
        let pending: PendingRequests<String, u32> = PendingRequests::new();
        let _reply = pending
            .begin("c1".into(), (), Duration::from_secs(5), timeout_error)
            .expect("first request");
        assert!(pending
            .begin("c1".into(), (), Duration::from_secs(5), timeout_error)
            .is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_timer_never_touches_a_newer_request() {
        let pending: PendingRequests<String, u32> = PendingRequests::new();
        let first = pending
            .begin("c1".into(), (), Duration::from_secs(5), timeout_error)
            .expect("first request");
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(pending.complete(&"c1".to_string(), Ok(1)));
        assert_eq!(first.await.unwrap().unwrap(), 1);

        let second = pending
            .begin("c1".into(), (), Duration::from_secs(5), timeout_error)
            .expect("second request");
        // Past the first request's deadline, well before the second's.
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(pending.contains(&"c1".to_string()));
        assert!(pending.complete(&"c1".to_string(), Ok(2)));
        assert_eq!(second.await.unwrap().unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn resolve_returns_context() {
        let pending: PendingRequests<String, (), &'static str> = PendingRequests::new();
        let reply = pending
            .begin("c1".into(), "ctx", Duration::from_secs(5), timeout_error)
            .expect("request");
        let taken = pending.take(&"c1".to_string()).expect("pending");
        assert_eq!(*taken.context(), "ctx");
        assert_eq!(taken.resolve(Ok(())), "ctx");
        assert!(reply.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn take_if_leaves_a_non_matching_request() {
        let pending: PendingRequests<String, (), u64> = PendingRequests::new();
        let _reply = pending
            .begin("c1".into(), 2, Duration::from_secs(5), timeout_error)
            .expect("request");
        assert!(pending.take_if(&"c1".to_string(), |ticket| *ticket == 1).is_none());
        assert!(pending.contains(&"c1".to_string()));
        let taken = pending
            .take_if(&"c1".to_string(), |ticket| *ticket == 2)
            .expect("matching request");
        assert_eq!(taken.cancel(), 2);
        assert!(pending.is_empty());
    }
}
