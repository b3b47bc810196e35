//! Retained message store.
//!
//! One entry per topic name, holding the last retained publish and its publisher.
//! A retained publish with an empty payload is a tombstone: it removes the entry.
//! Expired entries are skipped on read and purged by the maintenance sweep.
//!
//! Entries live in a trie keyed by topic level, so replaying retained messages for a
//! new subscription only walks the branches its filter can reach:
//!
//! ```text
//! Root
//! ├── status
//! │   ├── online (value)
//! │   └── offline (value)
//! └── $SYS
//!     └── uptime (value)
//! ```

use serde::{Deserialize, Serialize};

use crate::topic::{Level, Topic};
use crate::types::{ClientId, HashMap, Message, TimestampMillis, TopicName};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Retained {
    pub message: Message,
    pub publisher: ClientId,
}

/// Outcome of applying a retained publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetainOp {
    Stored,
    Removed,
    /// Tombstone for a topic with no entry.
    Unchanged,
}

#[derive(Debug, Default)]
struct Node {
    value: Option<Retained>,
    branches: HashMap<Level, Node>,
}

impl Node {
    #[inline]
    fn is_empty(&self) -> bool {
        self.value.is_none() && self.branches.is_empty()
    }

    fn _insert(&mut self, path: &[Level], value: Retained) -> Option<Retained> {
        match path.split_first() {
            None => self.value.replace(value),
            Some((first, rest)) => self.branches.entry(first.clone()).or_default()._insert(rest, value),
        }
    }

    fn _remove(&mut self, path: &[Level]) -> Option<Retained> {
        let Some((first, rest)) = path.split_first() else { return self.value.take() };
        let child = self.branches.get_mut(first)?;
        let res = child._remove(rest);
        if child.is_empty() {
            self.branches.remove(first);
        }
        res
    }

    fn _get(&self, path: &[Level]) -> Option<&Retained> {
        match path.split_first() {
            None => self.value.as_ref(),
            Some((first, rest)) => self.branches.get(first)?._get(rest),
        }
    }

    /// Walks the filter levels against stored topic levels. `root` is set while at the
    /// first level, where wildcards never reach `$` topics.
    fn _matches<'a>(
        &'a self,
        filter: &[Level],
        root: bool,
        now: TimestampMillis,
        out: &mut Vec<&'a Retained>,
    ) {
        match filter.split_first() {
            None => out.extend(self.value.as_ref().filter(|r| !r.message.is_expired(now))),
            Some((Level::MultiWildcard, _)) => {
                //"#" also matches the parent level
                out.extend(self.value.as_ref().filter(|r| !r.message.is_expired(now)));
                for (level, child) in self.branches.iter() {
                    if root && level.is_metadata() {
                        continue;
                    }
                    child._live(now, out);
                }
            }
            Some((Level::SingleWildcard, rest)) => {
                for (level, child) in self.branches.iter() {
                    if root && level.is_metadata() {
                        continue;
                    }
                    child._matches(rest, false, now, out);
                }
            }
            Some((level, rest)) => {
                if let Some(child) = self.branches.get(level) {
                    child._matches(rest, false, now, out);
                }
            }
        }
    }

    fn _live<'a>(&'a self, now: TimestampMillis, out: &mut Vec<&'a Retained>) {
        out.extend(self.value.as_ref().filter(|r| !r.message.is_expired(now)));
        for child in self.branches.values() {
            child._live(now, out);
        }
    }

    fn _all<'a>(&'a self, out: &mut Vec<&'a Retained>) {
        out.extend(self.value.as_ref());
        for child in self.branches.values() {
            child._all(out);
        }
    }

    fn _purge(&mut self, now: TimestampMillis, out: &mut Vec<TopicName>) {
        if self.value.as_ref().map(|r| r.message.is_expired(now)).unwrap_or(false) {
            if let Some(r) = self.value.take() {
                out.push(r.message.topic);
            }
        }
        self.branches.retain(|_, child| {
            child._purge(now, out);
            !child.is_empty()
        });
    }
}

#[derive(Debug, Default)]
pub struct RetainedStore {
    root: Node,
    len: usize,
}

impl RetainedStore {
    pub fn set(&mut self, message: Message, publisher: ClientId) -> RetainOp {
        let topic = match Topic::parse_name(&message.topic) {
            Ok(topic) => topic,
            Err(e) => {
                log::warn!("retained message dropped, {}", e);
                return RetainOp::Unchanged;
            }
        };
        if message.payload.is_empty() {
            match self.root._remove(topic.levels()) {
                Some(_) => {
                    self.len -= 1;
                    RetainOp::Removed
                }
                None => RetainOp::Unchanged,
            }
        } else {
            if self.root._insert(topic.levels(), Retained { message, publisher }).is_none() {
                self.len += 1;
            }
            RetainOp::Stored
        }
    }

    pub fn get(&self, topic: &str) -> Option<&Retained> {
        let topic = Topic::parse_name(topic).ok()?;
        self.root._get(topic.levels())
    }

    /// Live retained messages whose topic the filter accepts.
    pub fn matches(&self, filter: &Topic, now: TimestampMillis) -> Vec<Message> {
        let mut out = Vec::new();
        self.root._matches(filter.levels(), true, now, &mut out);
        out.into_iter().map(|r| r.message.clone()).collect()
    }

    /// Drops expired entries, returning their topics.
    pub fn purge_expired(&mut self, now: TimestampMillis) -> Vec<TopicName> {
        let mut expired = Vec::new();
        self.root._purge(now, &mut expired);
        self.len -= expired.len();
        expired
    }

    pub fn iter(&self) -> impl Iterator<Item = &Retained> {
        let mut out = Vec::with_capacity(self.len);
        self.root._all(&mut out);
        out.into_iter()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MessageProperties, QoS};

    fn retained(topic: &str, payload: &'static str) -> Message {
        Message::new(topic, QoS::AtLeastOnce, true, payload, MessageProperties::default())
    }

    fn matched(store: &RetainedStore, filter: &str) -> Vec<String> {
        let filter = Topic::parse_filter(filter).unwrap();
        let mut topics: Vec<String> = store
            .matches(&filter, fluxmq_utils::timestamp_millis())
            .into_iter()
            .map(|m| m.topic.to_string())
            .collect();
        topics.sort();
        topics
    }

    #[test]
    fn tombstone() {
        let mut store = RetainedStore::default();
        let c = ClientId::from("c");
        assert_eq!(store.set(retained("status/online", ""), c.clone()), RetainOp::Unchanged);
        assert!(store.is_empty());

        assert_eq!(store.set(retained("status/online", "1"), c.clone()), RetainOp::Stored);
        assert_eq!(store.set(retained("status/online", "2"), c.clone()), RetainOp::Stored);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("status/online").unwrap().message.payload, "2");
        assert_eq!(store.set(retained("status/online", ""), c), RetainOp::Removed);
        assert!(store.get("status/online").is_none());
        assert!(store.root.is_empty());
    }

    #[test]
    fn wildcard_walk() {
        let mut store = RetainedStore::default();
        let c = ClientId::from("c");
        let topics = ["sport", "sport/tennis/player1", "sport/tennis/player2", "/finance", "$SYS/uptime", "a/$b"];
        for t in topics {
            store.set(retained(t, "x"), c.clone());
        }
        assert_eq!(matched(&store, "sport/#"), vec!["sport", "sport/tennis/player1", "sport/tennis/player2"]);
        assert_eq!(matched(&store, "sport/+/player1"), vec!["sport/tennis/player1"]);
        assert_eq!(matched(&store, "+/+"), vec!["/finance", "a/$b"]);
        assert_eq!(matched(&store, "+"), vec!["sport"]);
        assert_eq!(matched(&store, "#").len(), 5);
        assert_eq!(matched(&store, "$SYS/#"), vec!["$SYS/uptime"]);
        assert!(matched(&store, "+/uptime").is_empty());
        assert_eq!(store.iter().count(), 6);
    }

    #[test]
    fn matching_and_expiry() {
        let mut store = RetainedStore::default();
        let c = ClientId::from("c");
        store.set(retained("a/b", "1"), c.clone());
        store.set(retained("a/c", "2"), c.clone());
        let mut old = retained("a/d/e", "3").with_expiry(1);
        old.create_time -= 10_000;
        store.set(old, c.clone());
        store.set(retained("$SYS/x", "4"), c);

        let now = fluxmq_utils::timestamp_millis();
        assert_eq!(matched(&store, "a/+"), vec!["a/b", "a/c"]);
        assert_eq!(matched(&store, "#"), vec!["a/b", "a/c"]);

        assert_eq!(store.purge_expired(now), vec![TopicName::from("a/d/e")]);
        assert_eq!(store.len(), 3);
        let a = &store.root.branches[&Level::Normal("a".into())];
        assert!(!a.branches.contains_key(&Level::Normal("d".into())));
    }
}
