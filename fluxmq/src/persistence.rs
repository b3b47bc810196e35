use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::anyhow;
use parking_lot::RwLock;

use fluxmq_conf::{Storage, StorageType};

use crate::retain::Retained;
use crate::types::{ClientId, HashMap, SessionState, Subscription, TopicFilter, TopicName};
use crate::Result;

/// Durable state of the broker: local sessions, their subscriptions and retained messages.
pub trait Persistence: Send + Sync {
    fn get_all_sessions(&self) -> Result<Vec<SessionState>>;

    fn get_all_subscriptions(&self) -> Result<Vec<(ClientId, Subscription)>>;

    fn get_all_retained_messages(&self) -> Result<Vec<(TopicName, Retained)>>;

    fn persist_session(&self, state: &SessionState) -> Result<()>;

    fn remove_session(&self, client_id: &str) -> Result<()>;

    fn persist_subscription(&self, client_id: &ClientId, sub: &Subscription) -> Result<()>;

    /// `topic_filter` is the full filter, share prefix included.
    fn remove_subscription(&self, client_id: &str, topic_filter: &str) -> Result<()>;

    fn remove_subscriptions(&self, client_id: &str) -> Result<()>;

    fn persist_retained(&self, topic: &str, retained: &Retained) -> Result<()>;

    fn remove_retained(&self, topic: &str) -> Result<()>;

    #[inline]
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

pub fn build(storage: &Storage) -> Result<Arc<dyn Persistence>> {
    Ok(match storage.typ {
        StorageType::None => Arc::new(NoPersistence),
        StorageType::Memory => Arc::new(MemoryPersistence::default()),
        StorageType::Sled => Arc::new(SledPersistence::open(&storage.dir)?),
    })
}

/// Keeps nothing.
pub struct NoPersistence;

impl Persistence for NoPersistence {
    fn get_all_sessions(&self) -> Result<Vec<SessionState>> {
        Ok(Vec::new())
    }

    fn get_all_subscriptions(&self) -> Result<Vec<(ClientId, Subscription)>> {
        Ok(Vec::new())
    }

    fn get_all_retained_messages(&self) -> Result<Vec<(TopicName, Retained)>> {
        Ok(Vec::new())
    }

    fn persist_session(&self, _state: &SessionState) -> Result<()> {
        Ok(())
    }

    fn remove_session(&self, _client_id: &str) -> Result<()> {
        Ok(())
    }

    fn persist_subscription(&self, _client_id: &ClientId, _sub: &Subscription) -> Result<()> {
        Ok(())
    }

    fn remove_subscription(&self, _client_id: &str, _topic_filter: &str) -> Result<()> {
        Ok(())
    }

    fn remove_subscriptions(&self, _client_id: &str) -> Result<()> {
        Ok(())
    }

    fn persist_retained(&self, _topic: &str, _retained: &Retained) -> Result<()> {
        Ok(())
    }

    fn remove_retained(&self, _topic: &str) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryPersistence {
    sessions: RwLock<HashMap<ClientId, SessionState>>,
    subscriptions: RwLock<BTreeMap<(ClientId, TopicFilter), Subscription>>,
    retained: RwLock<HashMap<TopicName, Retained>>,
}

impl Persistence for MemoryPersistence {
    fn get_all_sessions(&self) -> Result<Vec<SessionState>> {
        Ok(self.sessions.read().values().cloned().collect())
    }

    fn get_all_subscriptions(&self) -> Result<Vec<(ClientId, Subscription)>> {
        Ok(self.subscriptions.read().iter().map(|((c, _), s)| (c.clone(), s.clone())).collect())
    }

    fn get_all_retained_messages(&self) -> Result<Vec<(TopicName, Retained)>> {
        Ok(self.retained.read().iter().map(|(t, r)| (t.clone(), r.clone())).collect())
    }

    fn persist_session(&self, state: &SessionState) -> Result<()> {
        self.sessions.write().insert(state.client_id.clone(), state.clone());
        Ok(())
    }

    fn remove_session(&self, client_id: &str) -> Result<()> {
        self.sessions.write().remove(client_id);
        Ok(())
    }

    fn persist_subscription(&self, client_id: &ClientId, sub: &Subscription) -> Result<()> {
        self.subscriptions.write().insert((client_id.clone(), sub.full_filter()), sub.clone());
        Ok(())
    }

    fn remove_subscription(&self, client_id: &str, topic_filter: &str) -> Result<()> {
        self.subscriptions.write().remove(&(ClientId::from(client_id), TopicFilter::from(topic_filter)));
        Ok(())
    }

    fn remove_subscriptions(&self, client_id: &str) -> Result<()> {
        self.subscriptions.write().retain(|(c, _), _| &**c != client_id);
        Ok(())
    }

    fn persist_retained(&self, topic: &str, retained: &Retained) -> Result<()> {
        self.retained.write().insert(TopicName::from(topic), retained.clone());
        Ok(())
    }

    fn remove_retained(&self, topic: &str) -> Result<()> {
        self.retained.write().remove(topic);
        Ok(())
    }
}

/// sled backed store. Trees `sessions`, `subscriptions` and `retained` hold bincode values
/// under the keys `client_id`, `client_id\0filter` and `topic`.
pub struct SledPersistence {
    db: sled::Db,
    sessions: sled::Tree,
    subscriptions: sled::Tree,
    retained: sled::Tree,
}

impl SledPersistence {
    pub fn open(path: &str) -> Result<Self> {
        let db = sled::open(path).map_err(|e| anyhow!("failed to open sled db at {}, {}", path, e))?;
        let sessions = db.open_tree("sessions")?;
        let subscriptions = db.open_tree("subscriptions")?;
        let retained = db.open_tree("retained")?;
        Ok(Self { db, sessions, subscriptions, retained })
    }

    #[inline]
    fn subscription_key(client_id: &str, topic_filter: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(client_id.len() + topic_filter.len() + 1);
        key.extend_from_slice(client_id.as_bytes());
        key.push(0);
        key.extend_from_slice(topic_filter.as_bytes());
        key
    }

    fn values<T: serde::de::DeserializeOwned>(tree: &sled::Tree) -> Result<Vec<T>> {
        let mut out = Vec::new();
        for item in tree.iter() {
            let (_, value) = item?;
            out.push(bincode::deserialize(&value)?);
        }
        Ok(out)
    }
}

impl Persistence for SledPersistence {
    fn get_all_sessions(&self) -> Result<Vec<SessionState>> {
        Self::values(&self.sessions)
    }

    fn get_all_subscriptions(&self) -> Result<Vec<(ClientId, Subscription)>> {
        Self::values(&self.subscriptions)
    }

    fn get_all_retained_messages(&self) -> Result<Vec<(TopicName, Retained)>> {
        Self::values::<Retained>(&self.retained)
            .map(|items| items.into_iter().map(|r| (r.message.topic.clone(), r)).collect())
    }

    fn persist_session(&self, state: &SessionState) -> Result<()> {
        self.sessions.insert(state.client_id.as_bytes(), bincode::serialize(state)?)?;
        Ok(())
    }

    fn remove_session(&self, client_id: &str) -> Result<()> {
        self.sessions.remove(client_id.as_bytes())?;
        Ok(())
    }

    fn persist_subscription(&self, client_id: &ClientId, sub: &Subscription) -> Result<()> {
        let key = Self::subscription_key(client_id, &sub.full_filter());
        self.subscriptions.insert(key, bincode::serialize(&(client_id, sub))?)?;
        Ok(())
    }

    fn remove_subscription(&self, client_id: &str, topic_filter: &str) -> Result<()> {
        self.subscriptions.remove(Self::subscription_key(client_id, topic_filter))?;
        Ok(())
    }

    fn remove_subscriptions(&self, client_id: &str) -> Result<()> {
        let mut prefix = client_id.as_bytes().to_vec();
        prefix.push(0);
        for item in self.subscriptions.scan_prefix(prefix) {
            let (key, _) = item?;
            self.subscriptions.remove(key)?;
        }
        Ok(())
    }

    fn persist_retained(&self, topic: &str, retained: &Retained) -> Result<()> {
        self.retained.insert(topic.as_bytes(), bincode::serialize(retained)?)?;
        Ok(())
    }

    fn remove_retained(&self, topic: &str) -> Result<()> {
        self.retained.remove(topic.as_bytes())?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Message, MessageProperties, ProtocolVersion, QoS};

    fn state(client_id: &str) -> SessionState {
        SessionState {
            client_id: client_id.into(),
            protocol: ProtocolVersion::V5,
            username: None,
            will: None,
            session_expiry_interval: 30,
            disconnected_at: Some(1),
            next_packet_id: 5,
            pending_send: vec![(
                4,
                Message::new("a/b", QoS::AtLeastOnce, false, "x", MessageProperties::default()),
            )],
            awaiting_send_ack: Vec::new(),
            awaiting_rel_ack: vec![3],
            received_qos2: Vec::new(),
        }
    }

    fn exercise(p: &dyn Persistence) {
        let c1 = ClientId::from("c1");
        p.persist_session(&state("c1")).unwrap();
        p.persist_session(&state("c2")).unwrap();
        p.remove_session("c2").unwrap();
        let sessions = p.get_all_sessions().unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].next_packet_id, 5);
        assert_eq!(sessions[0].pending_send.len(), 1);

        p.persist_subscription(&c1, &Subscription::new("a/+", QoS::AtLeastOnce).unwrap()).unwrap();
        p.persist_subscription(&c1, &Subscription::new("$share/g/a/+", QoS::AtLeastOnce).unwrap()).unwrap();
        p.persist_subscription(&"c10".into(), &Subscription::new("x", QoS::AtMostOnce).unwrap()).unwrap();
        assert_eq!(p.get_all_subscriptions().unwrap().len(), 3);
        p.remove_subscription("c1", "$share/g/a/+").unwrap();
        assert_eq!(p.get_all_subscriptions().unwrap().len(), 2);
        p.remove_subscriptions("c1").unwrap();
        let subs = p.get_all_subscriptions().unwrap();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].0, "c10");

        let msg = Message::new("t", QoS::AtMostOnce, true, "v", MessageProperties::default());
        p.persist_retained("t", &Retained { message: msg, publisher: c1 }).unwrap();
        let retained = p.get_all_retained_messages().unwrap();
        assert_eq!(retained.len(), 1);
        assert_eq!(retained[0].0, "t");
        p.remove_retained("t").unwrap();
        assert!(p.get_all_retained_messages().unwrap().is_empty());
    }

    #[test]
    fn memory() {
        exercise(&MemoryPersistence::default());
    }

    #[test]
    fn sled() {
        let dir = std::env::temp_dir().join(format!("fluxmq-test-{}", uuid::Uuid::new_v4().as_simple()));
        let path = dir.to_string_lossy().to_string();
        {
            let p = SledPersistence::open(&path).unwrap();
            exercise(&p);
            p.persist_session(&state("c3")).unwrap();
            p.flush().unwrap();
        }
        let p = SledPersistence::open(&path).unwrap();
        assert_eq!(p.get_all_sessions().unwrap().len(), 2);
        drop(p);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
