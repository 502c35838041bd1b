//! Per-channel publish ordering.
//!
//! Items whose `prev-id` does not match the channel's last known id are
//! parked until the item they depend on goes out, then released in chain
//! order. Parked items are bounded per channel and expire on a shared
//! clock so a missing predecessor cannot stall a channel forever.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::item::PublishItem;
use crate::lastids::PublishLastIds;

/// Most parked items per channel; beyond this new arrivals are dropped.
pub const CHANNEL_PENDING_MAX: usize = 100;

/// Parked items older than this are released out of order.
pub const PENDING_EXPIRE: Duration = Duration::from_secs(10);

/// Cadence for the expiry sweep.
pub const EXPIRE_INTERVAL: Duration = Duration::from_secs(1);

struct PendingItem {
    time: Instant,
    seq: u64,
    item: PublishItem,
}

#[derive(Default)]
struct ChannelPending {
    by_prev_id: HashMap<String, u64>,
}

/// Reorder buffer in front of publish delivery.
pub struct Sequencer {
    last_ids: PublishLastIds,
    pending: HashMap<u64, PendingItem>,
    by_channel: HashMap<String, ChannelPending>,
    by_time: BTreeMap<(Instant, u64), u64>,
    next_seq: u64,
    ready: Vec<PublishItem>,
}

impl Sequencer {
    pub fn new(last_ids_capacity: usize) -> Self {
        Self {
            last_ids: PublishLastIds::new(last_ids_capacity),
            pending: HashMap::new(),
            by_channel: HashMap::new(),
            by_time: BTreeMap::new(),
            next_seq: 0,
            ready: Vec::new(),
        }
    }

    pub fn last_id(&self, channel: &str) -> Option<&str> {
        self.last_ids.value(channel)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Whether the owner needs to drive [`expire`](Self::expire) on a timer.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Feed an item in; take released items with [`take_ready`](Self::take_ready).
    pub fn add_item(&mut self, item: PublishItem, now: Instant) {
        let last = self.last_ids.value(&item.channel).map(str::to_string);

        if let (Some(last), Some(prev_id)) = (&last, &item.prev_id) {
            if last != prev_id {
                let channel_pending = self.by_channel.entry(item.channel.clone()).or_default();

                if channel_pending.by_prev_id.contains_key(prev_id) {
                    debug!(
                        channel = %item.channel,
                        prev_id = %prev_id,
                        "already holding an item with this prev-id, dropping"
                    );
                    return;
                }
                if channel_pending.by_prev_id.len() >= CHANNEL_PENDING_MAX {
                    debug!(channel = %item.channel, "too many pending items, dropping");
                    return;
                }

                let seq = self.next_seq;
                self.next_seq += 1;
                channel_pending.by_prev_id.insert(prev_id.clone(), seq);
                self.by_time.insert((now, seq), seq);
                self.pending.insert(
                    seq,
                    PendingItem {
                        time: now,
                        seq,
                        item,
                    },
                );
                return;
            }
        }

        self.send_item(item);
    }

    /// Drop everything parked for a channel.
    pub fn clear_channel(&mut self, channel: &str) {
        let Some(channel_pending) = self.by_channel.remove(channel) else {
            return;
        };
        for (_, seq) in channel_pending.by_prev_id {
            if let Some(p) = self.pending.remove(&seq) {
                self.by_time.remove(&(p.time, p.seq));
            }
        }
    }

    /// Release items parked past their deadline, in arrival order.
    pub fn expire(&mut self, now: Instant) {
        loop {
            let Some((&(time, seq), _)) = self.by_time.iter().next() else {
                break;
            };
            if now.duration_since(time) < PENDING_EXPIRE {
                break;
            }

            self.by_time.remove(&(time, seq));
            let p = self.pending.remove(&seq).expect("index consistent");
            self.unpark(&p.item);

            debug!(
                channel = %p.item.channel,
                id = p.item.id.as_deref().unwrap_or(""),
                "releasing expired pending item"
            );
            self.send_item(p.item);
        }
    }

    /// Items released since the last call.
    pub fn take_ready(&mut self) -> Vec<PublishItem> {
        std::mem::take(&mut self.ready)
    }

    fn unpark(&mut self, item: &PublishItem) {
        if let Some(channel_pending) = self.by_channel.get_mut(&item.channel) {
            if let Some(prev_id) = &item.prev_id {
                channel_pending.by_prev_id.remove(prev_id);
            }
            if channel_pending.by_prev_id.is_empty() {
                self.by_channel.remove(&item.channel);
            }
        }
    }

    fn send_item(&mut self, item: PublishItem) {
        match &item.id {
            Some(id) => self.last_ids.set(&item.channel, id),
            None => self.last_ids.remove(&item.channel),
        }

        let channel = item.channel.clone();
        let mut id = item.id.clone();
        self.ready.push(item);

        // release any chain now unblocked
        while let Some(current) = id {
            let Some(channel_pending) = self.by_channel.get_mut(&channel) else {
                break;
            };
            let Some(seq) = channel_pending.by_prev_id.remove(&current) else {
                break;
            };
            if channel_pending.by_prev_id.is_empty() {
                self.by_channel.remove(&channel);
            }

            let p = self.pending.remove(&seq).expect("index consistent");
            self.by_time.remove(&(p.time, p.seq));

            match &p.item.id {
                Some(next_id) => self.last_ids.set(&channel, next_id),
                None => self.last_ids.remove(&channel),
            }
            id = p.item.id.clone();
            self.ready.push(p.item);
        }
    }
}
