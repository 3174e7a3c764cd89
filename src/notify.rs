use std::fmt;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::debug;
use ulid::Ulid;

use crate::model::Event;
use crate::observability::NOTIFY_CHANNELS;

const CHANNEL_CAPACITY: usize = 256;

/// What a change feed is about: one provider's calendar and waiting list, or one user's inbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Provider(Ulid),
    Inbox(Ulid),
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Provider(id) => write!(f, "provider_{id}"),
            Channel::Inbox(id) => write!(f, "inbox_{id}"),
        }
    }
}

/// Broadcast hub carrying every applied event to whoever watches the channel it touches.
#[derive(Default)]
pub struct NotifyHub {
    channels: DashMap<Channel, broadcast::Sender<Event>>,
}

impl NotifyHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a channel, creating it if needed.
    pub fn subscribe(&self, channel: Channel) -> broadcast::Receiver<Event> {
        let rx = self
            .channels
            .entry(channel)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe();
        metrics::gauge!(NOTIFY_CHANNELS).set(self.channel_count() as f64);
        rx
    }

    /// No-op if nobody is listening.
    pub fn send(&self, channel: Channel, event: &Event) {
        if let Some(sender) = self.channels.get(&channel) {
            let _ = sender.send(event.clone());
        }
    }

    pub fn receiver_count(&self, channel: Channel) -> usize {
        self.channels
            .get(&channel)
            .map_or(0, |sender| sender.receiver_count())
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Drop a channel once its last subscriber is gone.
    pub fn remove_if_idle(&self, channel: Channel) {
        if self
            .channels
            .remove_if(&channel, |_, sender| sender.receiver_count() == 0)
            .is_some()
        {
            debug!("closed {channel}");
            metrics::gauge!(NOTIFY_CHANNELS).set(self.channel_count() as f64);
        }
    }
}
