use std::fmt;

use crate::error::TopicError;
use crate::topic::{Level, Topic};
use crate::types::{ClientId, HashMap, HashSet, ShareName, Subscription, TimestampMillis, TopicFilter};

/// Identity of a stored subscription within one trie node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Key {
    client_id: ClientId,
    share_name: Option<ShareName>,
}

impl Key {
    #[inline]
    fn new(client_id: &ClientId, share_name: Option<&ShareName>) -> Self {
        Self { client_id: client_id.clone(), share_name: share_name.cloned() }
    }
}

#[derive(Default)]
struct Node {
    values: HashMap<Key, Subscription>,
    branches: HashMap<Level, Node>,
}

impl Node {
    #[inline]
    fn _insert(&mut self, mut path: Vec<Level>, key: Key, sub: Subscription) -> bool {
        if let Some(first) = path.pop() {
            self.branches.entry(first).or_default()._insert(path, key, sub)
        } else {
            self.values.insert(key, sub).is_some()
        }
    }

    #[inline]
    fn _remove(&mut self, path: &[Level], key: &Key) -> Option<Subscription> {
        if path.is_empty() {
            self.values.remove(key)
        } else {
            let t = &path[0];
            let x = self.branches.get_mut(t)?;
            let res = x._remove(&path[1..], key);
            if x.values.is_empty() && x.branches.is_empty() {
                self.branches.remove(t);
            }
            res
        }
    }

    #[inline]
    fn _get_mut(&mut self, path: &[Level], key: &Key) -> Option<&mut Subscription> {
        match path.split_first() {
            None => self.values.get_mut(key),
            Some((first, rest)) => self.branches.get_mut(first)?._get_mut(rest, key),
        }
    }

    #[inline]
    fn _get(&self, path: &[Level], key: &Key) -> Option<&Subscription> {
        match path.split_first() {
            None => self.values.get(key),
            Some((first, rest)) => self.branches.get(first)?._get(rest, key),
        }
    }

    fn collect(&self, out: &mut Vec<(ClientId, Subscription)>) {
        out.extend(self.values.iter().map(|(k, s)| (k.client_id.clone(), s.clone())));
    }

    fn _matches(&self, path: &[Level], depth: usize, out: &mut Vec<(ClientId, Subscription)>) {
        if path.is_empty() {
            //Match parent #
            if let Some(n) = self.branches.get(&Level::MultiWildcard) {
                n.collect(out);
            }
            self.collect(out);
            return;
        }

        //Topic names starting with the $ character cannot be matched by
        //topic filters starting with wildcards (# or +)
        if !(depth == 0 && path[0].is_metadata()) {
            if let Some(n) = self.branches.get(&Level::MultiWildcard) {
                n.collect(out);
            }
            if let Some(n) = self.branches.get(&Level::SingleWildcard) {
                n._matches(&path[1..], depth + 1, out);
            }
        }

        //Precise matching
        if let Some(n) = self.branches.get(&path[0]) {
            n._matches(&path[1..], depth + 1, out);
        }
    }

    fn _all(&self, out: &mut Vec<(ClientId, Subscription)>) {
        self.collect(out);
        for n in self.branches.values() {
            n._all(out);
        }
    }

    #[inline]
    fn values_size(&self) -> usize {
        let len: usize = self.branches.values().map(|n| n.values_size()).sum();
        self.values.len() + len
    }

    #[inline]
    fn nodes_size(&self) -> usize {
        let len: usize = self.branches.values().map(|n| n.nodes_size()).sum();
        self.branches.len() + len
    }
}

/// Subscription index: a trie keyed by topic level, plus a per-client index of
/// full filters so a client's subscriptions can be dropped without a walk.
#[derive(Default)]
pub struct TopicTree {
    root: Node,
    clients: HashMap<ClientId, HashSet<TopicFilter>>,
}

impl TopicTree {
    /// Returns whether an existing subscription of this client to the same filter was replaced.
    pub fn insert(&mut self, client_id: &ClientId, sub: Subscription) -> Result<bool, TopicError> {
        let topic = Topic::parse_filter(&sub.topic_filter)?;
        let mut path: Vec<Level> = topic.levels().clone();
        path.reverse();
        let key = Key::new(client_id, sub.share_name.as_ref());
        self.clients.entry(client_id.clone()).or_default().insert(sub.full_filter());
        Ok(self.root._insert(path, key, sub))
    }

    /// Removes the subscription of `client_id` to `filter`, as the client wrote it
    /// (`$share/<group>/` prefix included).
    pub fn remove(&mut self, client_id: &ClientId, filter: &str) -> Option<Subscription> {
        let (share_name, reduced) = Subscription::split_share(filter).ok()?;
        let topic = Topic::parse_filter(&reduced).ok()?;
        let removed = self.root._remove(topic.levels(), &Key::new(client_id, share_name.as_ref()));
        if let Some(filters) = self.clients.get_mut(client_id) {
            filters.remove(filter);
            if filters.is_empty() {
                self.clients.remove(client_id);
            }
        }
        removed
    }

    /// Drops every subscription of a client.
    pub fn remove_client(&mut self, client_id: &ClientId) -> Vec<Subscription> {
        let filters = self.clients.remove(client_id).unwrap_or_default();
        let mut removed = Vec::with_capacity(filters.len());
        for filter in filters {
            let Ok((share_name, reduced)) = Subscription::split_share(&filter) else { continue };
            let Ok(topic) = Topic::parse_filter(&reduced) else { continue };
            if let Some(sub) = self.root._remove(topic.levels(), &Key::new(client_id, share_name.as_ref())) {
                removed.push(sub);
            }
        }
        removed
    }

    /// All subscriptions whose filter accepts the topic name. A client matching
    /// through several filters appears once per filter.
    pub fn matches(&self, topic_name: &str) -> Vec<(ClientId, Subscription)> {
        let mut out = Vec::new();
        if let Ok(topic) = Topic::parse_name(topic_name) {
            self.root._matches(topic.levels(), 0, &mut out);
        }
        out
    }

    pub fn get(&self, client_id: &ClientId, filter: &str) -> Option<&Subscription> {
        let (share_name, reduced) = Subscription::split_share(filter).ok()?;
        let topic = Topic::parse_filter(&reduced).ok()?;
        self.root._get(topic.levels(), &Key::new(client_id, share_name.as_ref()))
    }

    /// Records a shared-group dispatch on the member's subscription.
    pub fn stamp_shared(&mut self, client_id: &ClientId, filter: &str, at: TimestampMillis) {
        let Ok((share_name, reduced)) = Subscription::split_share(filter) else { return };
        let Ok(topic) = Topic::parse_filter(&reduced) else { return };
        if let Some(sub) = self.root._get_mut(topic.levels(), &Key::new(client_id, share_name.as_ref())) {
            sub.last_shared_dispatch_time = at;
        }
    }

    pub fn client_subscriptions(&self, client_id: &ClientId) -> Vec<Subscription> {
        self.clients
            .get(client_id)
            .map(|filters| filters.iter().filter_map(|f| self.get(client_id, f).cloned()).collect())
            .unwrap_or_default()
    }

    pub fn all(&self) -> Vec<(ClientId, Subscription)> {
        let mut out = Vec::new();
        self.root._all(&mut out);
        out
    }

    #[inline]
    pub fn values_size(&self) -> usize {
        self.root.values_size()
    }

    #[inline]
    pub fn nodes_size(&self) -> usize {
        self.root.nodes_size()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.root.values.is_empty() && self.root.branches.is_empty()
    }
}

impl fmt::Debug for TopicTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TopicTree {{ nodes_size: {}, values_size: {} }}", self.nodes_size(), self.values_size())
    }
}
