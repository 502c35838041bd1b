//! Channel subscription registry.
//!
//! Maps channel names to live hold sessions and fans published items out
//! to them. When the last subscriber leaves, the channel entry lingers for
//! a grace period so a quick reconnect does not churn upstream
//! subscriptions.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::debug;

use crate::item::PublishItem;

/// How long an empty channel entry survives.
pub const SUBSCRIPTION_LINGER: Duration = Duration::from_secs(60);

/// Events the registry reports for upstream subscription management.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionEvent {
    Subscribed { channel: String },
    Unsubscribed { channel: String },
}

struct ChannelEntry {
    subscribers: HashMap<u64, mpsc::UnboundedSender<PublishItem>>,
    linger_until: Option<Instant>,
}

#[derive(Default)]
pub struct SubscriptionRegistry {
    channels: HashMap<String, ChannelEntry>,
    events: Vec<SubscriptionEvent>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .get(channel)
            .map(|e| e.subscribers.len())
            .unwrap_or(0)
    }

    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.channels.contains_key(channel)
    }

    /// Register a session's interest in a channel.
    pub fn subscribe(
        &mut self,
        session: u64,
        channel: &str,
        sink: mpsc::UnboundedSender<PublishItem>,
    ) {
        let entry = self
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| {
                ChannelEntry {
                    subscribers: HashMap::new(),
                    linger_until: None,
                }
            });
        if entry.subscribers.is_empty() && entry.linger_until.is_none() {
            self.events.push(SubscriptionEvent::Subscribed {
                channel: channel.to_string(),
            });
        }
        entry.linger_until = None;
        entry.subscribers.insert(session, sink);
    }

    /// Remove a session from a channel. With `linger`, an emptied channel
    /// stays known for the grace period.
    pub fn unsubscribe(&mut self, session: u64, channel: &str, linger: bool, now: Instant) {
        let Some(entry) = self.channels.get_mut(channel) else {
            return;
        };
        entry.subscribers.remove(&session);
        if !entry.subscribers.is_empty() {
            return;
        }

        if linger {
            entry.linger_until = Some(now + SUBSCRIPTION_LINGER);
        } else {
            self.channels.remove(channel);
            self.events.push(SubscriptionEvent::Unsubscribed {
                channel: channel.to_string(),
            });
        }
    }

    /// Remove a session from every channel.
    pub fn remove_session(&mut self, session: u64, linger: bool, now: Instant) {
        let channels: Vec<String> = self
            .channels
            .iter()
            .filter(|(_, e)| e.subscribers.contains_key(&session))
            .map(|(c, _)| c.clone())
            .collect();
        for channel in channels {
            self.unsubscribe(session, &channel, linger, now);
        }
    }

    /// Deliver an item to every subscriber of its channel. Returns how many
    /// sessions received it.
    pub fn dispatch(&mut self, item: &PublishItem) -> usize {
        let Some(entry) = self.channels.get_mut(&item.channel) else {
            debug!(channel = %item.channel, "publish for unsubscribed channel");
            return 0;
        };

        let mut delivered = 0;
        entry
            .subscribers
            .retain(|_, sink| match sink.send(item.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(_) => false,
            });
        delivered
    }

    /// Expire lingering empty channels.
    pub fn sweep(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .channels
            .iter()
            .filter(|(_, e)| {
                e.subscribers.is_empty()
                    && e.linger_until.map(|t| now >= t).unwrap_or(false)
            })
            .map(|(c, _)| c.clone())
            .collect();
        for channel in expired {
            self.channels.remove(&channel);
            self.events
                .push(SubscriptionEvent::Unsubscribed { channel });
        }
    }

    /// Subscription changes since the last call.
    pub fn take_events(&mut self) -> Vec<SubscriptionEvent> {
        std::mem::take(&mut self.events)
    }
}
