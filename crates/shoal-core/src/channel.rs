use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{trace, warn};
use transport_bus::{Bus, BusMessage, Handler};

use crate::error::ShardResult;
use crate::ids::ChannelId;
use crate::protocol::{decode_envelope, encode_envelope, Topic};

#[derive(Debug)]
enum Registration {
    Subscription { topic: String, subscriber_id: String },
    Pull { topic: String },
}

/// Identity shared by front and back channels: a channel id bound to a
/// messenger, plus every bus registration made on its behalf so `close` can
/// tear them all down.
pub struct ChannelCore {
    channel_id: ChannelId,
    messenger: Arc<dyn Bus>,
    registrations: Mutex<Vec<Registration>>,
}

impl ChannelCore {
    pub fn new(channel_id: impl Into<ChannelId>, messenger: Arc<dyn Bus>) -> Self {
        Self {
            channel_id: channel_id.into(),
            messenger,
            registrations: Mutex::new(Vec::new()),
        }
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn subscribe(&self, topic: &Topic, subscriber_id: &str, handler: Handler) -> ShardResult<()> {
        let topic = topic.to_string();
        self.messenger.subscribe(&topic, subscriber_id, handler)?;
        self.registrations.lock().push(Registration::Subscription {
            topic,
            subscriber_id: subscriber_id.to_string(),
        });
        Ok(())
    }

    pub fn pull(&self, topic: &Topic, handler: Handler) -> ShardResult<()> {
        let topic = topic.to_string();
        self.messenger.pull(&topic, handler)?;
        self.registrations.lock().push(Registration::Pull { topic });
        Ok(())
    }

    pub fn publish<T: Serialize>(&self, topic: &Topic, envelope: &T) -> ShardResult<()> {
        let payload = encode_envelope(envelope)?;
        trace!(
            target = "shoal::channel",
            channel_id = %self.channel_id,
            topic = %topic,
            bytes = payload.len(),
            "publish"
        );
        self.messenger.publish(&topic.to_string(), payload)?;
        Ok(())
    }

    pub fn push<T: Serialize>(&self, topic: &Topic, envelope: &T) -> ShardResult<()> {
        let payload = encode_envelope(envelope)?;
        trace!(
            target = "shoal::channel",
            channel_id = %self.channel_id,
            topic = %topic,
            bytes = payload.len(),
            "push"
        );
        self.messenger.push(&topic.to_string(), payload)?;
        Ok(())
    }

    pub fn close(&self) {
        let registrations = std::mem::take(&mut *self.registrations.lock());
        for registration in registrations {
            match registration {
                Registration::Subscription {
                    topic,
                    subscriber_id,
                } => {
                    self.messenger.unsubscribe(&topic, &subscriber_id);
                }
                Registration::Pull { topic } => {
                    self.messenger.remove_pull(&topic);
                }
            }
        }
    }
}

/// Builds a bus handler that decodes an envelope of type `M` and forwards it
/// to `inner`. The handler holds only a weak reference, so registrations never
/// keep their owner alive.
pub(crate) fn envelope_handler<I, M, F>(inner: &Arc<I>, on_envelope: F) -> Handler
where
    I: Send + Sync + 'static,
    M: DeserializeOwned,
    F: Fn(&Arc<I>, M) + Send + Sync + 'static,
{
    let weak = Arc::downgrade(inner);
    Arc::new(move |message: BusMessage| {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        match decode_envelope::<M>(&message.payload) {
            Ok(envelope) => on_envelope(&inner, envelope),
            Err(err) => warn!(
                target = "shoal::channel",
                topic = %message.topic,
                error = %err,
                "dropping undecodable message"
            ),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use transport_bus::LocalBus;

    use crate::protocol::MessageKind;
    use crate::ids::FrontUid;

    #[test]
    fn close_releases_every_registration() {
        let bus = Arc::new(LocalBus::new());
        let core = ChannelCore::new("lobby", bus.clone());
        let noop: Handler = Arc::new(|_| {});
        let link = Topic::for_front(MessageKind::Link, &FrontUid::new("lobby", 0));

        core.subscribe(&Topic::connect(), "lobby", noop.clone())
            .expect("subscribe");
        core.pull(&link, noop).expect("pull");
        assert_eq!(bus.subscriber_count("0"), 1);
        assert!(bus.has_puller(&link.to_string()));

        core.close();
        assert_eq!(bus.subscriber_count("0"), 0);
        assert!(!bus.has_puller(&link.to_string()));
    }
}
