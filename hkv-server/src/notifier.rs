//! Pub/sub notifier (spec §4.7, §6 `publish`/`subscribe`): single-process
//! channel fan-out. Each channel name lazily gets a `tokio::sync::broadcast`
//! pair; publishing to a channel with no subscribers is a no-op rather than
//! an error (spec §2.5 Non-goals: "pub/sub routing beyond single-process
//! channel notification" is out of scope, so there is no cross-node
//! delivery here).

use hashbrown::HashMap;
use parking_lot::RwLock;
use tokio::sync::broadcast;

/// Change-notification channel names, spec §4.7.
pub fn keyspace_channel(key: &[u8]) -> String {
    format!("__keyspace@0__:{}", String::from_utf8_lossy(key))
}

pub const EXPIRED_CHANNEL: &str = "__keyevent@0__:expired";

pub struct Notifier {
    channels: RwLock<HashMap<String, broadcast::Sender<Vec<u8>>>>,
    buffer_size: usize,
}

impl Notifier {
    pub fn new(buffer_size: usize) -> Self {
        Notifier { channels: RwLock::new(HashMap::new()), buffer_size: buffer_size.max(1) }
    }

    /// Subscribes to `channel`, creating it if this is the first
    /// subscriber. Dropping the returned receiver unsubscribes.
    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<Vec<u8>> {
        if let Some(tx) = self.channels.read().get(channel) {
            return tx.subscribe();
        }
        let mut channels = self.channels.write();
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.buffer_size).0)
            .subscribe()
    }

    /// Publishes `message` to `channel`, returning the number of
    /// subscribers it was delivered to. A channel with zero subscribers
    /// (or one never subscribed to) returns 0 without allocating a sender.
    pub fn publish(&self, channel: &str, message: &[u8]) -> usize {
        let channels = self.channels.read();
        match channels.get(channel) {
            Some(tx) => tx.send(message.to_vec()).unwrap_or(0),
            None => 0,
        }
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels.read().get(channel).map(|tx| tx.receiver_count()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_without_subscribers_is_a_noop() {
        let notifier = Notifier::new(16);
        assert_eq!(notifier.publish("ch", b"hi"), 0);
    }

    #[test]
    fn subscriber_receives_published_message() {
        let notifier = Notifier::new(16);
        let mut rx = notifier.subscribe("ch");
        let delivered = notifier.publish("ch", b"hi");
        assert_eq!(delivered, 1);
        let msg = rx.try_recv().unwrap();
        assert_eq!(msg, b"hi");
    }

    #[test]
    fn keyspace_channel_formats_key() {
        assert_eq!(keyspace_channel(b"foo"), "__keyspace@0__:foo");
    }
}
