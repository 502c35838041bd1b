//! Last-published-id cache per channel, bounded by recency.

use std::collections::{BTreeMap, HashMap};

/// LRU map of channel to last published id.
#[derive(Debug)]
pub struct PublishLastIds {
    max_capacity: usize,
    table: HashMap<String, (u64, String)>,
    recently_used: BTreeMap<u64, String>,
    counter: u64,
}

impl PublishLastIds {
    pub fn new(max_capacity: usize) -> Self {
        Self {
            max_capacity,
            table: HashMap::new(),
            recently_used: BTreeMap::new(),
            counter: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Store the id for a channel, promoting it to most recent.
    pub fn set(&mut self, channel: &str, id: &str) {
        self.counter += 1;
        let stamp = self.counter;

        if let Some((old_stamp, _)) = self.table.get(channel) {
            self.recently_used.remove(old_stamp);
        } else {
            while !self.table.is_empty() && self.table.len() >= self.max_capacity {
                let (_, oldest) = self.recently_used.pop_first().expect("table nonempty");
                self.table.remove(&oldest);
            }
        }

        self.table
            .insert(channel.to_string(), (stamp, id.to_string()));
        self.recently_used.insert(stamp, channel.to_string());
    }

    pub fn remove(&mut self, channel: &str) {
        if let Some((stamp, _)) = self.table.remove(channel) {
            self.recently_used.remove(&stamp);
        }
    }

    pub fn clear(&mut self) {
        self.table.clear();
        self.recently_used.clear();
    }

    /// Last id for a channel, or `None` if unknown.
    pub fn value(&self, channel: &str) -> Option<&str> {
        self.table.get(channel).map(|(_, id)| id.as_str())
    }
}
