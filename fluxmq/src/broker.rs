//! The broker: single owner of every session, the subscription trie, the retained store
//! and the cluster peer table.
//!
//! All mutation happens through `&mut Broker` on the server task, so routing decisions
//! that touch the trie, several sessions and the retained store are never observed
//! half-applied. Connection tasks and cluster links talk to it with
//! [`Command`](crate::server::Command)s.

use std::sync::Arc;

use bytestring::ByteString;

use fluxmq_conf::Mqtt;
use fluxmq_utils::timestamp_millis;

use crate::acl::{AuthResult, Authentication, Authorization};
use crate::cluster::{ClusterMessage, ClusterState, LinkId, Peer, PeerTx};
use crate::error::{BrokerError, ReasonCode};
use crate::packet::{ConnAck, ConnectRequest, Inbound, Outbound, SubscribeStatus};
use crate::persistence::Persistence;
use crate::retain::{RetainOp, Retained, RetainedStore};
use crate::session::{ClientHandle, RemoteSession, Session, SessionEntry, SessionOps, SessionSink, Tx};
use crate::topic::Topic;
use crate::trie::TopicTree;
use crate::types::{
    ClientId, ConnId, HashMap, HashSet, Message, NodeName, PacketId, ProtocolVersion, QoS, RetainHandling,
    SessionInfo, ShareName, SubscribeFilter, Subscription, SubscriptionIdentifier, TimestampMillis, TopicFilter,
    SESSION_NEVER_EXPIRE,
};
use crate::Result;

/// Persistence and replication side effects of session transitions.
struct Effects<'a> {
    persistence: &'a dyn Persistence,
    cluster: &'a ClusterState,
}

impl SessionSink for Effects<'_> {
    fn persist(&mut self, session: &Session) {
        if let Err(e) = self.persistence.persist_session(&session.state()) {
            log::warn!("{} persist session error, {}", session.client_id, e);
        }
    }

    #[inline]
    fn propagate(&mut self, info: SessionInfo) {
        self.cluster.broadcast(ClusterMessage::SessionUpdate(info));
    }

    #[inline]
    fn forward(&mut self, node: &NodeName, msg: ClusterMessage) {
        self.cluster.send(node, msg);
    }
}

/// Per-client result of matching one publish against non-shared filters.
struct Delivery {
    qos: QoS,
    retain_as_published: bool,
    subscription_ids: Vec<SubscriptionIdentifier>,
}

pub struct Broker {
    config: Mqtt,
    sessions: HashMap<ClientId, SessionEntry>,
    conns: HashMap<ConnId, ClientId>,
    subscriptions: TopicTree,
    retained: RetainedStore,
    persistence: Arc<dyn Persistence>,
    authentication: Arc<dyn Authentication>,
    authorization: Arc<dyn Authorization>,
    cluster: ClusterState,
}

impl Broker {
    pub fn new(
        config: Mqtt,
        cluster: ClusterState,
        persistence: Arc<dyn Persistence>,
        authentication: Arc<dyn Authentication>,
        authorization: Arc<dyn Authorization>,
    ) -> Self {
        Self {
            config,
            sessions: HashMap::default(),
            conns: HashMap::default(),
            subscriptions: TopicTree::default(),
            retained: RetainedStore::default(),
            persistence,
            authentication,
            authorization,
            cluster,
        }
    }

    /// Loads persisted sessions (disconnected), their subscriptions and retained messages.
    pub fn restore(&mut self) -> Result<()> {
        let now = timestamp_millis();
        for state in self.persistence.get_all_sessions()? {
            let client_id = state.client_id.clone();
            self.sessions.insert(client_id, SessionEntry::Local(Box::new(Session::from_state(state, now))));
        }
        let mut subs = 0;
        for (client_id, sub) in self.persistence.get_all_subscriptions()? {
            if !self.sessions.contains_key(&client_id) {
                log::debug!("{} skip orphan subscription {}", client_id, sub.full_filter());
                continue;
            }
            self.subscriptions.insert(&client_id, sub)?;
            subs += 1;
        }
        for (topic, r) in self.persistence.get_all_retained_messages()? {
            if r.message.is_expired(now) {
                self.persistence.remove_retained(&topic)?;
                continue;
            }
            self.retained.set(r.message, r.publisher);
        }
        log::info!(
            "restored {} sessions, {} subscriptions, {} retained messages",
            self.sessions.len(),
            subs,
            self.retained.len()
        );
        Ok(())
    }

    #[inline]
    pub fn config(&self) -> &Mqtt {
        &self.config
    }

    #[inline]
    pub fn session(&self, client_id: &str) -> Option<&SessionEntry> {
        self.sessions.get(client_id)
    }

    #[inline]
    pub fn local_session(&self, client_id: &str) -> Option<&Session> {
        self.sessions.get(client_id).and_then(|e| e.as_local())
    }

    #[inline]
    pub fn sessions_count(&self) -> usize {
        self.sessions.len()
    }

    #[inline]
    pub fn subscriptions(&self) -> &TopicTree {
        &self.subscriptions
    }

    #[inline]
    pub fn retained(&self) -> &RetainedStore {
        &self.retained
    }

    #[inline]
    pub fn cluster(&self) -> &ClusterState {
        &self.cluster
    }

    /// Connected here or on a peer.
    #[inline]
    pub fn is_client_connected(&self, client_id: &str) -> bool {
        self.sessions.get(client_id).map(|s| s.is_connected()).unwrap_or(false)
    }

    #[inline]
    fn effects(&self) -> Effects<'_> {
        Effects { persistence: &*self.persistence, cluster: &self.cluster }
    }

    fn local_mut(&mut self, client_id: &str) -> std::result::Result<(&mut Session, Effects<'_>), BrokerError> {
        let fx = Effects { persistence: &*self.persistence, cluster: &self.cluster };
        match self.sessions.get_mut(client_id) {
            Some(SessionEntry::Local(s)) => Ok((&mut **s, fx)),
            _ => Err(BrokerError::protocol(
                ReasonCode::ImplementationSpecificError,
                format!("{} has no local session", client_id),
            )),
        }
    }

    fn check_capabilities(&self, message: &Message) -> std::result::Result<(), BrokerError> {
        if message.retain && !self.config.retain_available {
            return Err(BrokerError::protocol(ReasonCode::RetainNotSupported, "retain is not available"));
        }
        if message.qos > self.config.maximum_qos {
            return Err(BrokerError::protocol(
                ReasonCode::QosNotSupported,
                format!("{:?} exceeds the maximum QoS {:?}", message.qos, self.config.maximum_qos),
            ));
        }
        Ok(())
    }

    /// Routes a publish to every matching session. `remote` marks a publish relayed by a
    /// peer: it only reaches local sessions and is not mirrored again. Returns whether
    /// at least one session was handed the message.
    pub fn publish(
        &mut self,
        publisher: Option<&ClientId>,
        message: Message,
        remote: bool,
    ) -> std::result::Result<bool, BrokerError> {
        self.check_capabilities(&message)?;

        let now = timestamp_millis();
        let mut deliveries: HashMap<ClientId, Delivery> = HashMap::default();
        let mut groups: HashMap<ShareName, Vec<(ClientId, Subscription)>> = HashMap::default();
        let mut nodes: HashSet<NodeName> = HashSet::default();

        for (client_id, sub) in self.subscriptions.matches(&message.topic) {
            if let Some(share_name) = sub.share_name.clone() {
                //the publishing node picks the group member
                if !remote {
                    groups.entry(share_name).or_default().push((client_id, sub));
                }
                continue;
            }
            if sub.no_local && publisher == Some(&client_id) {
                continue;
            }
            match self.sessions.get(&client_id) {
                Some(SessionEntry::Local(_)) => {}
                Some(SessionEntry::Remote(r)) => {
                    if !remote {
                        nodes.insert(r.node.clone());
                    }
                    continue;
                }
                None => continue,
            }
            let d = deliveries.entry(client_id).or_insert_with(|| Delivery {
                qos: QoS::AtMostOnce,
                retain_as_published: false,
                subscription_ids: Vec::new(),
            });
            d.qos = d.qos.max(sub.qos.min(message.qos));
            d.retain_as_published |= sub.retain_as_published;
            if let Some(id) = sub.subscription_identifier {
                d.subscription_ids.push(id);
            }
        }

        let mut delivered = false;
        let mut fx = Effects { persistence: &*self.persistence, cluster: &self.cluster };

        for (client_id, d) in deliveries {
            if let Some(entry) = self.sessions.get_mut(&client_id) {
                let mut msg = message.clone();
                msg.qos = d.qos;
                msg.retain = message.retain && d.retain_as_published;
                msg.dup = false;
                msg.properties.subscription_ids = d.subscription_ids;
                entry.publish(msg, &mut fx);
                delivered = true;
            }
        }

        for (share_name, members) in groups {
            let members: Vec<(ClientId, Subscription)> =
                members.into_iter().filter(|(c, _)| self.sessions.contains_key(c)).collect();
            let group_max = members.iter().map(|(_, s)| s.last_shared_dispatch_time).max().unwrap_or(0);
            //the stalest member, offline ones included, client id breaks ties
            let Some((client_id, sub)) =
                members.iter().min_by_key(|(c, s)| (s.last_shared_dispatch_time, c.clone()))
            else {
                continue;
            };
            log::trace!("$share/{}/{} picked {}", share_name, sub.topic_filter, client_id);
            self.subscriptions.stamp_shared(client_id, &sub.full_filter(), now.max(group_max + 1));
            if let Some(entry) = self.sessions.get_mut(client_id) {
                let mut msg = message.clone();
                msg.qos = sub.qos.min(message.qos);
                msg.retain = message.retain && sub.retain_as_published;
                msg.dup = false;
                msg.properties.subscription_ids = sub.subscription_identifier.into_iter().collect();
                entry.publish(msg, &mut fx);
                delivered = true;
            }
        }

        for node in nodes {
            let msg = ClusterMessage::Publish { publisher: publisher.cloned(), message: message.clone() };
            if self.cluster.send(&node, msg) {
                delivered = true;
            }
        }

        if message.retain && !remote {
            self.store_retained(message, publisher.cloned().unwrap_or_default(), true);
        }
        Ok(delivered)
    }

    /// Applies a retained publish; an empty payload deletes the entry.
    fn store_retained(&mut self, message: Message, publisher: ClientId, propagate: bool) {
        let topic = message.topic.clone();
        let retained = Retained { message, publisher };
        let res = match self.retained.set(retained.message.clone(), retained.publisher.clone()) {
            RetainOp::Stored => self.persistence.persist_retained(&topic, &retained),
            RetainOp::Removed => self.persistence.remove_retained(&topic),
            RetainOp::Unchanged => Ok(()),
        };
        if let Err(e) = res {
            log::warn!("retained message {} persist error, {}", topic, e);
        }
        if propagate {
            self.cluster.broadcast(ClusterMessage::Retain { topic, retained });
        }
    }

    /// Returns whether an existing subscription to the same filter was replaced.
    pub fn subscribe(
        &mut self,
        client_id: &ClientId,
        sub: Subscription,
        remote: bool,
    ) -> std::result::Result<bool, BrokerError> {
        let replaced = self.subscriptions.insert(client_id, sub.clone())?;
        if !remote {
            if let Err(e) = self.persistence.persist_subscription(client_id, &sub) {
                log::warn!("{} persist subscription error, {}", client_id, e);
            }
            self.cluster.broadcast(ClusterMessage::Subscribe { client_id: client_id.clone(), subscription: sub });
        }
        Ok(replaced)
    }

    /// `topic_filter` as the client wrote it. Returns whether the subscription existed.
    pub fn unsubscribe(&mut self, client_id: &ClientId, topic_filter: &str, remote: bool) -> bool {
        let existed = self.subscriptions.remove(client_id, topic_filter).is_some();
        if existed && !remote {
            if let Err(e) = self.persistence.remove_subscription(client_id, topic_filter) {
                log::warn!("{} remove subscription error, {}", client_id, e);
            }
            self.cluster.broadcast(ClusterMessage::Unsubscribe {
                client_id: client_id.clone(),
                topic_filter: TopicFilter::from(topic_filter),
            });
        }
        existed
    }

    fn purge_subscriptions(&mut self, client_id: &ClientId) {
        let removed = self.subscriptions.remove_client(client_id);
        if let Err(e) = self.persistence.remove_subscriptions(client_id) {
            log::warn!("{} remove subscriptions error, {}", client_id, e);
        }
        for sub in removed {
            self.cluster.broadcast(ClusterMessage::Unsubscribe {
                client_id: client_id.clone(),
                topic_filter: sub.full_filter(),
            });
        }
    }

    fn connack(&self, reason: ReasonCode, session_present: bool) -> ConnAck {
        ConnAck {
            reason,
            session_present,
            assigned_client_id: None,
            session_expiry_interval: None,
            server_keep_alive: self.config.server_keep_alive,
            receive_maximum: self.config.receive_maximum,
            maximum_qos: self.config.maximum_qos,
            retain_available: self.config.retain_available,
            maximum_packet_size: self.config.maximum_packet_size.as_u32(),
            topic_alias_maximum: self.config.maximum_topic_alias,
            wildcard_subscription_available: self.config.wildcard_subscription_available,
            subscription_identifiers_available: self.config.subscription_identifiers_available,
            shared_subscription_available: self.config.shared_subscription_available,
        }
    }

    fn refuse(&self, tx: &Tx, client_id: &str, reason: ReasonCode) -> bool {
        log::info!("{:?} connect refused, {}", client_id, reason);
        let _ = tx.send(Outbound::ConnAck(Box::new(self.connack(reason, false))));
        let _ = tx.send(Outbound::Close);
        false
    }

    /// Handles CONNECT. The CONNACK goes out on `tx` before anything else the session sends.
    pub fn connect(&mut self, conn_id: ConnId, mut req: ConnectRequest, tx: Tx) -> bool {
        if req.auth_method.is_some() {
            return self.refuse(&tx, &req.client_id, ReasonCode::BadAuthenticationMethod);
        }
        if let Some(will) = req.will.as_ref() {
            if will.message.retain && !self.config.retain_available {
                return self.refuse(&tx, &req.client_id, ReasonCode::RetainNotSupported);
            }
            if will.message.qos > self.config.maximum_qos {
                return self.refuse(&tx, &req.client_id, ReasonCode::QosNotSupported);
            }
        }

        let mut assigned_client_id = None;
        if req.client_id.is_empty() {
            if !req.protocol.is_v5() && !req.clean_start {
                return self.refuse(&tx, &req.client_id, ReasonCode::ClientIdentifierNotValid);
            }
            let id = ClientId::from(uuid::Uuid::new_v4().as_simple().to_string());
            if req.protocol.is_v5() {
                assigned_client_id = Some(id.clone());
            }
            req.client_id = id;
        }

        match self.authentication.authenticate(&req.client_id, req.username.as_deref(), req.password.as_deref()) {
            AuthResult::Allow => {}
            AuthResult::BadUsernameOrPassword => {
                return self.refuse(&tx, &req.client_id, ReasonCode::BadUserNameOrPassword)
            }
            AuthResult::NotAuthorized => return self.refuse(&tx, &req.client_id, ReasonCode::NotAuthorized),
        }

        let expiry = match req.protocol {
            ProtocolVersion::V3 if req.clean_start => 0,
            ProtocolVersion::V3 => SESSION_NEVER_EXPIRE,
            ProtocolVersion::V5 => req.session_expiry_interval.unwrap_or(0),
        }
        .min(self.config.max_session_expiry_interval);
        let keep_alive = self.config.server_keep_alive.unwrap_or(req.keep_alive);

        let client_id = req.client_id.clone();
        let (mut session, session_present) = self.take_over(&client_id, req.protocol, req.clean_start);
        session.protocol = req.protocol;
        session.username = req.username.take();
        session.will = req.will.take();
        session.session_expiry_interval = expiry;

        let mut ack = self.connack(ReasonCode::Success, session_present);
        ack.assigned_client_id = assigned_client_id;
        if req.protocol.is_v5() && req.session_expiry_interval.unwrap_or(0) != expiry {
            ack.session_expiry_interval = Some(expiry);
        }
        let _ = tx.send(Outbound::ConnAck(Box::new(ack)));

        let handle = ClientHandle::new(conn_id, tx, keep_alive, req.maximum_packet_size);
        {
            let mut fx = self.effects();
            session.mark_connected(handle, req.receive_maximum.unwrap_or(u16::MAX), &mut fx);
            session.resend_pending(&mut fx);
        }
        log::info!(
            "{} connected, conn_id: {}, protocol: {:?}, session_present: {}, keep_alive: {}",
            client_id,
            conn_id,
            req.protocol,
            session_present,
            keep_alive
        );
        self.conns.insert(conn_id, client_id.clone());
        self.sessions.insert(client_id, SessionEntry::Local(session));
        true
    }

    /// Detaches any previous owner of `client_id` and returns the session to activate.
    fn take_over(
        &mut self,
        client_id: &ClientId,
        protocol: ProtocolVersion,
        clean_start: bool,
    ) -> (Box<Session>, bool) {
        match self.sessions.remove(client_id) {
            Some(SessionEntry::Local(mut s)) => {
                if let Some(old) = s.conn_id() {
                    log::info!("{} session taken over, previous conn_id: {}", client_id, old);
                    self.conns.remove(&old);
                    s.disconnect_client_session_taken_over(&mut self.effects());
                }
                if clean_start {
                    s.reset();
                    self.purge_subscriptions(client_id);
                    (s, false)
                } else {
                    (s, true)
                }
            }
            Some(SessionEntry::Remote(mut r)) => {
                log::info!("{} taken over from {}", client_id, r.node);
                r.disconnect_client_session_taken_over(&mut self.effects());
                if clean_start {
                    self.purge_subscriptions(client_id);
                } else {
                    for sub in self.subscriptions.client_subscriptions(client_id) {
                        if let Err(e) = self.persistence.persist_subscription(client_id, &sub) {
                            log::warn!("{} persist subscription error, {}", client_id, e);
                        }
                    }
                }
                (Box::new(Session::new(client_id.clone(), protocol)), !clean_start)
            }
            None => (Box::new(Session::new(client_id.clone(), protocol)), false),
        }
    }

    /// A packet read by the connection `conn_id`. Protocol violations close that connection only.
    pub fn handle_inbound(&mut self, conn_id: ConnId, packet: Inbound) {
        let Some(client_id) = self.conns.get(&conn_id).cloned() else {
            log::debug!("conn_id {} is not attached to a session", conn_id);
            return;
        };
        let now = timestamp_millis();
        let handle = self.sessions.get_mut(&client_id).and_then(|e| e.as_local_mut()).and_then(|s| s.handle_mut());
        if let Some(h) = handle {
            h.touch(now);
        }
        if let Err(e) = self.dispatch_inbound(conn_id, &client_id, packet) {
            log::info!("{} closed on protocol error, {}", client_id, e);
            if let Some(s) = self.sessions.get(&client_id).and_then(|e| e.as_local()) {
                s.disconnect(e.reason_code(), None);
            }
        }
    }

    fn dispatch_inbound(
        &mut self,
        conn_id: ConnId,
        client_id: &ClientId,
        packet: Inbound,
    ) -> std::result::Result<(), BrokerError> {
        match packet {
            Inbound::Publish { packet_id, message } => self.inbound_publish(client_id, packet_id, message)?,
            Inbound::PubAck { packet_id } => {
                let (s, mut fx) = self.local_mut(client_id)?;
                s.on_puback(packet_id, &mut fx);
            }
            Inbound::PubRec { packet_id } => {
                let (s, mut fx) = self.local_mut(client_id)?;
                s.on_pubrec(packet_id, &mut fx);
            }
            Inbound::PubRel { packet_id } => {
                let (s, mut fx) = self.local_mut(client_id)?;
                s.on_pubrel(packet_id, &mut fx);
            }
            Inbound::PubComp { packet_id } => {
                let (s, mut fx) = self.local_mut(client_id)?;
                s.on_pubcomp(packet_id, &mut fx);
            }
            Inbound::Subscribe { packet_id, subscription_identifier, filters } => {
                self.inbound_subscribe(client_id, packet_id, subscription_identifier, filters)?
            }
            Inbound::Unsubscribe { packet_id, filters } => {
                let status = filters
                    .iter()
                    .map(|f| {
                        if self.unsubscribe(client_id, f, false) {
                            ReasonCode::Success
                        } else {
                            ReasonCode::NoSubscriptionExisted
                        }
                    })
                    .collect();
                let (s, _) = self.local_mut(client_id)?;
                s.send(Outbound::UnsubAck { packet_id, status });
            }
            Inbound::PingReq => {
                let (s, _) = self.local_mut(client_id)?;
                s.send(Outbound::PingResp);
            }
            Inbound::Disconnect { normal, session_expiry_interval } => {
                let max_expiry = self.config.max_session_expiry_interval;
                let (s, mut fx) = self.local_mut(client_id)?;
                if let Some(expiry) = session_expiry_interval {
                    if s.session_expiry_interval == 0 && expiry != 0 {
                        return Err(BrokerError::protocol(
                            ReasonCode::ProtocolError,
                            "session expiry interval set on DISCONNECT after CONNECT with zero",
                        ));
                    }
                    s.session_expiry_interval = expiry.min(max_expiry);
                }
                if normal {
                    s.will = None;
                }
                s.send(Outbound::Close);
                s.mark_disconnected(&mut fx);
                log::info!("{} disconnected, conn_id: {}", client_id, conn_id);
                self.conns.remove(&conn_id);
            }
        }
        Ok(())
    }

    fn inbound_publish(
        &mut self,
        client_id: &ClientId,
        packet_id: Option<PacketId>,
        message: Message,
    ) -> std::result::Result<(), BrokerError> {
        let (protocol, username) = {
            let (s, _) = self.local_mut(client_id)?;
            (s.protocol, s.username.clone())
        };
        if Topic::parse_name(&message.topic).is_err() {
            return Err(BrokerError::protocol(
                ReasonCode::TopicNameInvalid,
                format!("invalid topic name {:?}", message.topic),
            ));
        }
        //nothing is recorded for a publish the broker refuses
        self.check_capabilities(&message)?;
        let packet_id = match (message.qos, packet_id) {
            (QoS::AtMostOnce, _) => None,
            (_, Some(id)) => Some(id),
            (_, None) => {
                return Err(BrokerError::protocol(ReasonCode::ProtocolError, "QoS > 0 publish without packet id"))
            }
        };

        if !self.authorization.authorize(client_id, username.as_deref(), &message.topic, false, &message.payload) {
            log::info!("{} not authorized to publish to {}", client_id, message.topic);
            //MQTT 3 has no negative acknowledgement, the publish is dropped
            let reason = if protocol.is_v5() { ReasonCode::NotAuthorized } else { ReasonCode::Success };
            let (s, _) = self.local_mut(client_id)?;
            match (message.qos, packet_id) {
                (QoS::AtLeastOnce, Some(packet_id)) => s.send(Outbound::PubAck { packet_id, reason }),
                (QoS::ExactlyOnce, Some(packet_id)) => s.send(Outbound::PubRec { packet_id, reason }),
                _ => true,
            };
            return Ok(());
        }

        match (message.qos, packet_id) {
            (QoS::AtLeastOnce, Some(packet_id)) => {
                let delivered = self.publish(Some(client_id), message, false)?;
                let reason = if delivered { ReasonCode::Success } else { ReasonCode::NoMatchingSubscribers };
                let (s, _) = self.local_mut(client_id)?;
                s.send(Outbound::PubAck { packet_id, reason });
            }
            (QoS::ExactlyOnce, Some(packet_id)) => {
                let receive_maximum = self.config.receive_maximum;
                let fresh = {
                    let (s, mut fx) = self.local_mut(client_id)?;
                    let fresh = s.receive_qos2(packet_id, receive_maximum)?;
                    if fresh {
                        fx.persist(s);
                    }
                    fresh
                };
                let reason = if !fresh || self.publish(Some(client_id), message, false)? {
                    ReasonCode::Success
                } else {
                    ReasonCode::NoMatchingSubscribers
                };
                let (s, _) = self.local_mut(client_id)?;
                s.send(Outbound::PubRec { packet_id, reason });
            }
            _ => {
                self.publish(Some(client_id), message, false)?;
            }
        }
        Ok(())
    }

    fn check_subscription(
        &self,
        client_id: &ClientId,
        username: Option<&str>,
        req: &SubscribeFilter,
        subscription_identifier: Option<SubscriptionIdentifier>,
    ) -> std::result::Result<Subscription, ReasonCode> {
        let mut sub = Subscription::from_request(req).map_err(|_| ReasonCode::TopicFilterInvalid)?;
        if sub.is_shared() && !self.config.shared_subscription_available {
            return Err(ReasonCode::SharedSubscriptionsNotSupported);
        }
        if sub.has_wildcards() && !self.config.wildcard_subscription_available {
            return Err(ReasonCode::WildcardSubscriptionsNotSupported);
        }
        if subscription_identifier.is_some() && !self.config.subscription_identifiers_available {
            return Err(ReasonCode::SubscriptionIdentifiersNotSupported);
        }
        if !self.authorization.authorize(client_id, username, &req.topic_filter, true, &[]) {
            log::info!("{} not authorized to subscribe to {}", client_id, req.topic_filter);
            return Err(ReasonCode::NotAuthorized);
        }
        sub.qos = req.qos.min(self.config.maximum_qos);
        sub.subscription_identifier = subscription_identifier;
        Ok(sub)
    }

    fn inbound_subscribe(
        &mut self,
        client_id: &ClientId,
        packet_id: PacketId,
        subscription_identifier: Option<SubscriptionIdentifier>,
        filters: Vec<SubscribeFilter>,
    ) -> std::result::Result<(), BrokerError> {
        let username = {
            let (s, _) = self.local_mut(client_id)?;
            s.username.clone()
        };
        if let Some(f) = filters.iter().find(|f| f.no_local && f.topic_filter.starts_with("$share/")) {
            return Err(BrokerError::protocol(
                ReasonCode::ProtocolError,
                format!("no local on shared subscription {}", f.topic_filter),
            ));
        }

        let mut status = Vec::with_capacity(filters.len());
        let mut granted = Vec::new();
        for f in filters.iter() {
            match self.check_subscription(client_id, username.as_deref(), f, subscription_identifier) {
                Ok(sub) => {
                    let qos = sub.qos;
                    let replaced = self.subscribe(client_id, sub.clone(), false)?;
                    status.push(SubscribeStatus::Granted(qos));
                    granted.push((sub, !replaced));
                }
                Err(reason) => status.push(SubscribeStatus::Refused(reason)),
            }
        }

        let now = timestamp_millis();
        let mut fx = Effects { persistence: &*self.persistence, cluster: &self.cluster };
        let Some(SessionEntry::Local(s)) = self.sessions.get_mut(client_id) else { return Ok(()) };
        s.send(Outbound::SubAck { packet_id, status });

        for (sub, is_new) in granted {
            let replay = match sub.retain_handling {
                RetainHandling::AtSubscribe => true,
                RetainHandling::AtSubscribeNew => is_new,
                RetainHandling::NoAtSubscribe => false,
            };
            if !replay || sub.is_shared() {
                continue;
            }
            let Ok(filter) = Topic::parse_filter(&sub.topic_filter) else { continue };
            for mut msg in self.retained.matches(&filter, now) {
                msg.qos = msg.qos.min(sub.qos);
                msg.retain = true;
                msg.properties.subscription_ids = sub.subscription_identifier.into_iter().collect();
                s.publish(msg, &mut fx);
            }
        }
        Ok(())
    }

    /// The connection task of `conn_id` ended.
    pub fn closed(&mut self, conn_id: ConnId) {
        let Some(client_id) = self.conns.remove(&conn_id) else { return };
        let mut fx = Effects { persistence: &*self.persistence, cluster: &self.cluster };
        if let Some(SessionEntry::Local(s)) = self.sessions.get_mut(&client_id) {
            if s.conn_id() == Some(conn_id) {
                log::info!("{} connection lost, conn_id: {}", client_id, conn_id);
                s.mark_disconnected(&mut fx);
            }
        }
    }

    fn publish_will(&mut self, client_id: &ClientId, message: Message) {
        log::debug!("{} publish will to {}", client_id, message.topic);
        if let Err(e) = self.publish(Some(client_id), message, false) {
            log::warn!("{} will publish error, {}", client_id, e);
        }
    }

    /// Maintenance tick: keep-alive, session expiry, delayed wills and retained expiry.
    pub fn clean_up_operations(&mut self, now: TimestampMillis) {
        let timed_out: Vec<ClientId> = self
            .sessions
            .iter_mut()
            .filter_map(|(id, e)| if e.check_keep_alive_expired(now) { Some(id.clone()) } else { None })
            .collect();
        for client_id in timed_out {
            let mut fx = Effects { persistence: &*self.persistence, cluster: &self.cluster };
            if let Some(SessionEntry::Local(s)) = self.sessions.get_mut(&client_id) {
                if let Some(conn_id) = s.conn_id() {
                    self.conns.remove(&conn_id);
                }
                s.mark_disconnected(&mut fx);
            }
        }

        let expired: Vec<ClientId> =
            self.sessions.iter().filter(|(_, e)| e.is_expired(now)).map(|(id, _)| id.clone()).collect();
        for client_id in expired {
            let Some(SessionEntry::Local(mut s)) = self.sessions.remove(&client_id) else { continue };
            log::info!("{} session expired", client_id);
            if let Some(will) = s.take_will(now) {
                self.publish_will(&client_id, will);
            }
            self.purge_subscriptions(&client_id);
            if let Err(e) = self.persistence.remove_session(&client_id) {
                log::warn!("{} remove session error, {}", client_id, e);
            }
        }

        let due: Vec<ClientId> = self
            .sessions
            .iter()
            .filter(|(_, e)| e.as_local().map(|s| s.will_due(now)).unwrap_or(false))
            .map(|(id, _)| id.clone())
            .collect();
        for client_id in due {
            let will = match self.local_mut(&client_id) {
                Ok((s, mut fx)) => {
                    let will = s.take_will(now);
                    fx.persist(s);
                    will
                }
                Err(_) => None,
            };
            if let Some(will) = will {
                self.publish_will(&client_id, will);
            }
        }

        for topic in self.retained.purge_expired(now) {
            if let Err(e) = self.persistence.remove_retained(&topic) {
                log::warn!("retained message {} remove error, {}", topic, e);
            }
        }
    }

    /// Registers a link to `name`. On success the peer receives a snapshot of this node's
    /// local sessions, their subscriptions and the retained store.
    pub fn link_up(&mut self, name: NodeName, link_id: LinkId, dialer: NodeName, tx: PeerTx) -> bool {
        if !self.cluster.link_up(name.clone(), Peer::new(link_id, dialer, tx)) {
            return false;
        }
        let Some(peer) = self.cluster.get(&name) else { return false };
        for entry in self.sessions.values() {
            if let SessionEntry::Local(s) = entry {
                peer.send(ClusterMessage::SessionUpdate(s.info()));
            }
        }
        for (client_id, subscription) in self.subscriptions.all() {
            if matches!(self.sessions.get(&client_id), Some(SessionEntry::Local(_))) {
                peer.send(ClusterMessage::Subscribe { client_id, subscription });
            }
        }
        for retained in self.retained.iter() {
            let topic = retained.message.topic.clone();
            peer.send(ClusterMessage::Retain { topic, retained: retained.clone() });
        }
        log::info!("node {} linked, link_id: {}, peers: {}", name, link_id, self.cluster.len());
        true
    }

    /// Drops the peer and everything learnt from it, unless `link_id` is stale.
    pub fn link_down(&mut self, name: &str, link_id: LinkId) {
        if !self.cluster.link_down(name, link_id) {
            return;
        }
        let proxies: Vec<ClientId> = self
            .sessions
            .iter()
            .filter(|(_, e)| matches!(e, SessionEntry::Remote(r) if r.node == name))
            .map(|(id, _)| id.clone())
            .collect();
        for client_id in proxies.iter() {
            self.sessions.remove(client_id);
            self.subscriptions.remove_client(client_id);
        }
        log::info!("node {} unlinked, {} remote sessions dropped", name, proxies.len());
    }

    fn remote_proxy(&mut self, client_id: &ClientId, from: &NodeName) -> bool {
        match self.sessions.get(client_id) {
            Some(SessionEntry::Local(_)) => {
                log::debug!("{} is owned by this node, ignore event from {}", client_id, from);
                false
            }
            Some(SessionEntry::Remote(_)) => true,
            None => {
                self.sessions.insert(
                    client_id.clone(),
                    SessionEntry::Remote(RemoteSession::new(client_id.clone(), from.clone())),
                );
                true
            }
        }
    }

    /// A frame from peer `from`. Applied as remote: never mirrored again.
    pub fn handle_cluster(&mut self, from: NodeName, msg: ClusterMessage) {
        match msg {
            ClusterMessage::Hello { name, .. } => {
                log::debug!("unexpected Hello from {} ({})", from, name);
            }
            ClusterMessage::SessionUpdate(info) => {
                let client_id = info.client_id.clone();
                if self.remote_proxy(&client_id, &from) {
                    if let Some(SessionEntry::Remote(r)) = self.sessions.get_mut(&client_id) {
                        r.update(&from, info);
                    }
                }
            }
            ClusterMessage::SessionTakenOver { client_id } => {
                let Some(SessionEntry::Local(s)) = self.sessions.remove(&client_id) else {
                    log::debug!("{} taken over by {} but not owned here", client_id, from);
                    return;
                };
                log::info!("{} taken over by node {}", client_id, from);
                if let Some(conn_id) = s.conn_id() {
                    self.conns.remove(&conn_id);
                }
                s.disconnect(ReasonCode::SessionTakenOver, None);
                if let Err(e) = self.persistence.remove_session(&client_id) {
                    log::warn!("{} remove session error, {}", client_id, e);
                }
                if let Err(e) = self.persistence.remove_subscriptions(&client_id) {
                    log::warn!("{} remove subscriptions error, {}", client_id, e);
                }
                let mut proxy = RemoteSession::new(client_id.clone(), from);
                proxy.connected = true;
                proxy.protocol = s.protocol;
                self.sessions.insert(client_id, SessionEntry::Remote(proxy));
            }
            ClusterMessage::Subscribe { client_id, subscription } => {
                if self.remote_proxy(&client_id, &from) {
                    if let Err(e) = self.subscribe(&client_id, subscription, true) {
                        log::warn!("{} remote subscribe from {} error, {}", client_id, from, e);
                    }
                }
            }
            ClusterMessage::Unsubscribe { client_id, topic_filter } => {
                if !matches!(self.sessions.get(&client_id), Some(SessionEntry::Remote(_))) {
                    return;
                }
                self.unsubscribe(&client_id, &topic_filter, true);
                let idle = !self.is_client_connected(&client_id)
                    && self.subscriptions.client_subscriptions(&client_id).is_empty();
                if idle {
                    self.sessions.remove(&client_id);
                }
            }
            ClusterMessage::Retain { retained, .. } => {
                self.store_retained(retained.message, retained.publisher, false);
            }
            ClusterMessage::Publish { publisher, message } => {
                if let Err(e) = self.publish(publisher.as_ref(), message, true) {
                    log::warn!("remote publish from {} error, {}", from, e);
                }
            }
            ClusterMessage::Deliver { client_id, message } => {
                let mut fx = Effects { persistence: &*self.persistence, cluster: &self.cluster };
                match self.sessions.get_mut(&client_id) {
                    Some(SessionEntry::Local(s)) => s.publish(message, &mut fx),
                    _ => log::debug!("{} not owned here, delivery from {} dropped", client_id, from),
                }
            }
        }
    }

    /// Disconnects every local client, optionally pointing it at another server, then flushes storage.
    pub fn stop(&mut self, server_reference: Option<ByteString>, temporarily_moved: bool) {
        let reason = if temporarily_moved {
            ReasonCode::UseAnotherServer
        } else if server_reference.is_some() {
            ReasonCode::ServerMoved
        } else {
            ReasonCode::ServerShuttingDown
        };
        let mut fx = Effects { persistence: &*self.persistence, cluster: &self.cluster };
        for entry in self.sessions.values_mut() {
            if let SessionEntry::Local(s) = entry {
                if s.is_connected() {
                    s.disconnect(reason, server_reference.clone());
                    s.mark_disconnected(&mut fx);
                }
            }
        }
        self.conns.clear();
        if let Err(e) = self.persistence.flush() {
            log::warn!("persistence flush error, {}", e);
        }
        log::info!("broker stopped, {}", reason);
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU16;

    use tokio::sync::mpsc;

    use fluxmq_conf::Cluster;

    use super::*;
    use crate::acl::StaticAuth;
    use crate::cluster::PeerRx;
    use crate::persistence::MemoryPersistence;
    use crate::session::Rx;
    use crate::types::{MessageProperties, Will};

    fn pid(v: u16) -> PacketId {
        NonZeroU16::new(v).unwrap()
    }

    fn broker_named(name: &str, config: Mqtt) -> Broker {
        let auth = Arc::new(StaticAuth::default());
        let cluster = ClusterState::new(&Cluster { name: name.into(), ..Default::default() });
        Broker::new(config, cluster, Arc::new(MemoryPersistence::default()), auth.clone(), auth)
    }

    fn broker() -> Broker {
        broker_named("n1", Mqtt::default())
    }

    fn request(client_id: &str, clean_start: bool, expiry: u32) -> ConnectRequest {
        let mut req = ConnectRequest::new(ProtocolVersion::V5, client_id);
        req.clean_start = clean_start;
        req.session_expiry_interval = Some(expiry);
        req
    }

    fn connect_with(b: &mut Broker, conn_id: ConnId, req: ConnectRequest) -> (Rx, Box<ConnAck>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        b.connect(conn_id, req, tx);
        match rx.try_recv() {
            Ok(Outbound::ConnAck(ack)) => (rx, ack),
            other => panic!("expected CONNACK, got {:?}", other),
        }
    }

    fn connect(b: &mut Broker, conn_id: ConnId, client_id: &str) -> Rx {
        let (rx, ack) = connect_with(b, conn_id, request(client_id, true, 60));
        assert_eq!(ack.reason, ReasonCode::Success);
        rx
    }

    fn subscribe_with(b: &mut Broker, conn_id: ConnId, filter: SubscribeFilter, id: Option<u32>) {
        b.handle_inbound(
            conn_id,
            Inbound::Subscribe { packet_id: pid(1), subscription_identifier: id, filters: vec![filter] },
        );
    }

    fn subscribe(b: &mut Broker, conn_id: ConnId, filter: &str, qos: QoS) {
        subscribe_with(b, conn_id, SubscribeFilter::new(filter, qos), None);
    }

    fn msg(topic: &str, qos: QoS, payload: &'static str) -> Message {
        Message::new(topic, qos, false, payload, MessageProperties::default())
    }

    fn drain(rx: &mut Rx) -> Vec<Outbound> {
        let mut out = Vec::new();
        while let Ok(p) = rx.try_recv() {
            out.push(p);
        }
        out
    }

    fn publishes(rx: &mut Rx) -> Vec<(Option<PacketId>, Message)> {
        drain(rx)
            .into_iter()
            .filter_map(|p| match p {
                Outbound::Publish { packet_id, message } => Some((packet_id, message)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn qos1_delivery_and_ack() {
        let mut b = broker();
        let mut rx = connect(&mut b, 1, "c1");
        subscribe(&mut b, 1, "a/b", QoS::AtLeastOnce);
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [Outbound::SubAck { status, .. }] if status == &vec![SubscribeStatus::Granted(QoS::AtLeastOnce)]
        ));

        assert!(b.publish(None, msg("a/b", QoS::AtLeastOnce, "x"), false).unwrap());
        let got = publishes(&mut rx);
        assert_eq!(got.len(), 1);
        let (packet_id, m) = &got[0];
        assert_eq!(m.payload, "x");
        assert_eq!(m.qos, QoS::AtLeastOnce);
        let packet_id = packet_id.expect("packet id");
        assert_eq!(b.local_session("c1").unwrap().inflight().awaiting_ack_len(), 1);

        b.handle_inbound(1, Inbound::PubAck { packet_id });
        assert_eq!(b.local_session("c1").unwrap().inflight().awaiting_ack_len(), 0);
    }

    #[test]
    fn retained_tombstone_prevents_replay() {
        let mut b = broker();
        let _rx_a = connect(&mut b, 1, "a");
        let mut retained = msg("status/online", QoS::AtMostOnce, "1");
        retained.retain = true;
        b.handle_inbound(1, Inbound::Publish { packet_id: None, message: retained.clone() });
        assert_eq!(b.retained().len(), 1);

        let mut tombstone = msg("status/online", QoS::AtMostOnce, "");
        tombstone.retain = true;
        b.handle_inbound(1, Inbound::Publish { packet_id: None, message: tombstone.clone() });
        assert!(b.retained().is_empty());
        // no-op without an entry
        b.handle_inbound(1, Inbound::Publish { packet_id: None, message: tombstone });
        assert!(b.retained().is_empty());

        let mut rx_b = connect(&mut b, 2, "b");
        subscribe(&mut b, 2, "status/+", QoS::AtMostOnce);
        assert!(publishes(&mut rx_b).is_empty());
    }

    #[test]
    fn retained_replay_follows_retain_handling() {
        let mut b = broker();
        let mut m = msg("status/online", QoS::AtLeastOnce, "1");
        m.retain = true;
        b.publish(None, m, false).unwrap();

        let mut rx = connect(&mut b, 1, "c1");
        subscribe(&mut b, 1, "status/+", QoS::AtMostOnce);
        let got = publishes(&mut rx);
        assert_eq!(got.len(), 1);
        assert!(got[0].1.retain);
        assert_eq!(got[0].1.qos, QoS::AtMostOnce);

        let mut f = SubscribeFilter::new("status/+", QoS::AtMostOnce);
        f.retain_handling = RetainHandling::AtSubscribeNew;
        subscribe_with(&mut b, 1, f.clone(), None);
        assert!(publishes(&mut rx).is_empty());

        f.topic_filter = "status/#".into();
        subscribe_with(&mut b, 1, f, None);
        assert_eq!(publishes(&mut rx).len(), 1);

        let mut f = SubscribeFilter::new("status/online", QoS::AtMostOnce);
        f.retain_handling = RetainHandling::NoAtSubscribe;
        subscribe_with(&mut b, 1, f, None);
        assert!(publishes(&mut rx).is_empty());

        subscribe(&mut b, 1, "$share/g/status/online", QoS::AtMostOnce);
        assert!(publishes(&mut rx).is_empty());
    }

    #[test]
    fn expired_session_is_purged() {
        let mut b = broker();
        let (_rx, _) = connect_with(&mut b, 1, request("c1", true, 5));
        subscribe(&mut b, 1, "a/b", QoS::AtLeastOnce);
        b.handle_inbound(1, Inbound::Disconnect { normal: true, session_expiry_interval: None });
        assert!(!b.is_client_connected("c1"));

        let at = b.local_session("c1").unwrap().disconnected_at().unwrap();
        b.clean_up_operations(at + 4_000);
        assert!(b.session("c1").is_some());

        b.clean_up_operations(at + 6_000);
        assert!(b.session("c1").is_none());
        assert!(b.subscriptions().is_empty());
        assert!(!b.publish(None, msg("a/b", QoS::AtLeastOnce, "x"), false).unwrap());
    }

    #[test]
    fn expired_message_skipped_on_resend() {
        let mut b = broker();
        let (_rx, _) = connect_with(&mut b, 1, request("c1", true, 60));
        subscribe(&mut b, 1, "a/b", QoS::AtLeastOnce);
        b.closed(1);

        let mut m = msg("a/b", QoS::AtLeastOnce, "x").with_expiry(1);
        m.create_time -= 900;
        assert!(b.publish(None, m, false).unwrap());
        assert_eq!(b.local_session("c1").unwrap().inflight().pending_len(), 1);

        std::thread::sleep(std::time::Duration::from_millis(200));
        let (mut rx, ack) = connect_with(&mut b, 2, request("c1", false, 60));
        assert!(ack.session_present);
        assert!(publishes(&mut rx).is_empty());
        let s = b.local_session("c1").unwrap();
        assert_eq!(s.inflight().pending_len() + s.inflight().awaiting_ack_len(), 0);
    }

    #[test]
    fn shared_group_round_robin() {
        let mut b = broker();
        let mut rxs: Vec<Rx> = Vec::new();
        for (i, c) in ["s1", "s2", "s3"].iter().enumerate() {
            let conn_id = i as ConnId + 1;
            rxs.push(connect(&mut b, conn_id, c));
            subscribe(&mut b, conn_id, "$share/g/topic", QoS::AtMostOnce);
            drain(&mut rxs[i]);
        }
        for _ in 0..3 {
            assert!(b.publish(None, msg("topic", QoS::AtMostOnce, "x"), false).unwrap());
        }
        for rx in rxs.iter_mut() {
            assert_eq!(publishes(rx).len(), 1);
        }
        // and around again
        assert!(b.publish(None, msg("topic", QoS::AtMostOnce, "x"), false).unwrap());
        assert_eq!(rxs.iter_mut().map(|rx| publishes(rx).len()).sum::<usize>(), 1);
    }

    #[test]
    fn shared_pick_includes_offline_members() {
        let mut b = broker();
        let mut rx1 = connect(&mut b, 1, "s1");
        let mut rx2 = connect(&mut b, 2, "s2");
        subscribe(&mut b, 1, "$share/g/topic", QoS::AtLeastOnce);
        subscribe(&mut b, 2, "$share/g/topic", QoS::AtLeastOnce);
        drain(&mut rx1);
        drain(&mut rx2);
        b.closed(1);
        assert!(!b.is_client_connected("s1"));

        for _ in 0..4 {
            assert!(b.publish(None, msg("topic", QoS::AtLeastOnce, "x"), false).unwrap());
        }
        assert_eq!(publishes(&mut rx2).len(), 2);
        assert_eq!(b.local_session("s1").unwrap().inflight().pending_len(), 2);
    }

    #[test]
    fn shared_group_spans_filters() {
        let mut b = broker();
        let mut rxs: Vec<Rx> = Vec::new();
        let members = [("s1", "$share/g/a/+"), ("s2", "$share/g/a/b"), ("s3", "$share/h/a/#")];
        for (i, (c, f)) in members.iter().enumerate() {
            let conn_id = i as ConnId + 1;
            rxs.push(connect(&mut b, conn_id, c));
            subscribe(&mut b, conn_id, f, QoS::AtMostOnce);
            drain(&mut rxs[i]);
        }
        assert!(b.publish(None, msg("a/b", QoS::AtMostOnce, "x"), false).unwrap());
        let got: Vec<usize> = rxs.iter_mut().map(|rx| publishes(rx).len()).collect();
        assert_eq!(got[0] + got[1], 1);
        assert_eq!(got[2], 1);
    }

    #[test]
    fn no_local_and_overlapping_filters() {
        let mut b = broker();
        let mut rx1 = connect(&mut b, 1, "c1");
        let mut rx2 = connect(&mut b, 2, "c2");
        let mut f = SubscribeFilter::new("a/b", QoS::AtLeastOnce);
        f.no_local = true;
        subscribe_with(&mut b, 1, f, None);
        subscribe_with(&mut b, 2, SubscribeFilter::new("a/+", QoS::AtMostOnce), Some(7));
        subscribe_with(&mut b, 2, SubscribeFilter::new("a/b", QoS::ExactlyOnce), Some(9));
        drain(&mut rx1);
        drain(&mut rx2);

        let message = msg("a/b", QoS::AtLeastOnce, "x");
        b.handle_inbound(1, Inbound::Publish { packet_id: Some(pid(5)), message });
        assert!(matches!(
            drain(&mut rx1).as_slice(),
            [Outbound::PubAck { reason: ReasonCode::Success, .. }]
        ));
        let got = publishes(&mut rx2);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].1.qos, QoS::AtLeastOnce);
        let mut ids = got[0].1.properties.subscription_ids.clone();
        ids.sort();
        assert_eq!(ids, vec![7, 9]);
    }

    #[test]
    fn inbound_qos2_not_routed_twice() {
        let mut b = broker();
        let mut rx1 = connect(&mut b, 1, "c1");
        let mut rx2 = connect(&mut b, 2, "c2");
        subscribe(&mut b, 2, "a/b", QoS::AtMostOnce);
        drain(&mut rx2);

        let m = msg("a/b", QoS::ExactlyOnce, "x");
        b.handle_inbound(1, Inbound::Publish { packet_id: Some(pid(3)), message: m.clone() });
        b.handle_inbound(1, Inbound::Publish { packet_id: Some(pid(3)), message: m });
        assert_eq!(publishes(&mut rx2).len(), 1);
        let out = drain(&mut rx1);
        assert_eq!(out.iter().filter(|p| matches!(p, Outbound::PubRec { .. })).count(), 2);

        b.handle_inbound(1, Inbound::PubRel { packet_id: pid(3) });
        assert!(matches!(
            drain(&mut rx1).as_slice(),
            [Outbound::PubComp { reason: ReasonCode::Success, .. }]
        ));

        let message = msg("x/y", QoS::ExactlyOnce, "x");
        b.handle_inbound(1, Inbound::Publish { packet_id: Some(pid(4)), message });
        assert!(matches!(
            drain(&mut rx1).as_slice(),
            [Outbound::PubRec { reason: ReasonCode::NoMatchingSubscribers, .. }]
        ));
    }

    #[test]
    fn subscribe_validation() {
        let config = Mqtt {
            maximum_qos: QoS::AtLeastOnce,
            shared_subscription_available: false,
            subscription_identifiers_available: false,
            ..Default::default()
        };
        let mut b = broker_named("n1", config);
        let mut rx = connect(&mut b, 1, "c1");
        b.handle_inbound(
            1,
            Inbound::Subscribe {
                packet_id: pid(2),
                subscription_identifier: None,
                filters: vec![
                    SubscribeFilter::new("a/#/b", QoS::AtMostOnce),
                    SubscribeFilter::new("$share/g/a", QoS::AtMostOnce),
                    SubscribeFilter::new("a/b", QoS::ExactlyOnce),
                ],
            },
        );
        match drain(&mut rx).as_slice() {
            [Outbound::SubAck { status, .. }] => assert_eq!(
                status,
                &vec![
                    SubscribeStatus::Refused(ReasonCode::TopicFilterInvalid),
                    SubscribeStatus::Refused(ReasonCode::SharedSubscriptionsNotSupported),
                    SubscribeStatus::Granted(QoS::AtLeastOnce),
                ]
            ),
            other => panic!("unexpected {:?}", other),
        }

        subscribe_with(&mut b, 1, SubscribeFilter::new("x", QoS::AtMostOnce), Some(3));
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [Outbound::SubAck { status, .. }]
                if status == &vec![SubscribeStatus::Refused(ReasonCode::SubscriptionIdentifiersNotSupported)]
        ));

        b.handle_inbound(1, Inbound::Unsubscribe { packet_id: pid(3), filters: vec!["a/b".into(), "zz".into()] });
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [Outbound::UnsubAck { status, .. }]
                if status == &vec![ReasonCode::Success, ReasonCode::NoSubscriptionExisted]
        ));
    }

    #[test]
    fn refused_qos2_publish_leaves_no_packet_id() {
        let config = Mqtt { retain_available: false, ..Default::default() };
        let mut b = broker_named("n1", config);
        let mut rx = connect(&mut b, 1, "c1");
        let mut m = msg("a/b", QoS::ExactlyOnce, "x");
        m.retain = true;
        b.handle_inbound(1, Inbound::Publish { packet_id: Some(pid(8)), message: m });
        assert!(matches!(
            drain(&mut rx).first(),
            Some(Outbound::Disconnect { reason: ReasonCode::RetainNotSupported, .. })
        ));
        assert_eq!(b.local_session("c1").unwrap().inflight().received_qos2_len(), 0);
    }

    #[test]
    fn protocol_error_closes_only_offender() {
        let mut b = broker();
        let mut rx1 = connect(&mut b, 1, "c1");
        let mut rx2 = connect(&mut b, 2, "c2");
        subscribe(&mut b, 2, "#", QoS::AtMostOnce);
        drain(&mut rx2);

        let mut f = SubscribeFilter::new("$share/g/a", QoS::AtMostOnce);
        f.no_local = true;
        subscribe_with(&mut b, 1, f, None);
        assert!(matches!(
            drain(&mut rx1).as_slice(),
            [Outbound::Disconnect { reason: ReasonCode::ProtocolError, .. }, Outbound::Close]
        ));
        b.closed(1);
        assert!(!b.is_client_connected("c1"));
        assert!(b.is_client_connected("c2"));
        assert!(b.publish(None, msg("a", QoS::AtMostOnce, "x"), false).unwrap());
        assert_eq!(publishes(&mut rx2).len(), 1);
    }

    #[test]
    fn connect_refusals_and_assigned_id() {
        let mut b = broker();
        let mut req = request("c1", true, 0);
        req.auth_method = Some("SCRAM-SHA-1".into());
        let (_rx, ack) = connect_with(&mut b, 1, req);
        assert_eq!(ack.reason, ReasonCode::BadAuthenticationMethod);
        assert!(b.session("c1").is_none());

        let mut req = ConnectRequest::new(ProtocolVersion::V3, "");
        req.clean_start = false;
        let (_rx, ack) = connect_with(&mut b, 2, req);
        assert_eq!(ack.reason, ReasonCode::ClientIdentifierNotValid);

        let (_rx, ack) = connect_with(&mut b, 3, request("", true, u32::MAX));
        assert_eq!(ack.reason, ReasonCode::Success);
        let id = ack.assigned_client_id.clone().expect("assigned id");
        assert!(b.is_client_connected(&id));

        let config = Mqtt {
            max_session_expiry_interval: 100,
            server_keep_alive: Some(30),
            retain_available: false,
            ..Default::default()
        };
        let mut b = broker_named("n1", config);
        let (_rx, ack) = connect_with(&mut b, 1, request("c1", true, 3600));
        assert_eq!(ack.session_expiry_interval, Some(100));
        assert_eq!(ack.server_keep_alive, Some(30));
        assert_eq!(b.local_session("c1").unwrap().handle().unwrap().keep_alive, 30);

        let mut req = request("c2", true, 0);
        let mut will = msg("w", QoS::AtMostOnce, "bye");
        will.retain = true;
        req.will = Some(Will { message: will, delay_interval: 0 });
        let (_rx, ack) = connect_with(&mut b, 2, req);
        assert_eq!(ack.reason, ReasonCode::RetainNotSupported);
    }

    #[test]
    fn authorization_denials() {
        let mut cfg = fluxmq_conf::Auth::default();
        cfg.acl.push(fluxmq_conf::AclRule {
            username: None,
            topic_filter: "secret/#".into(),
            action: fluxmq_conf::AclAction::All,
            allow: false,
        });
        let auth = Arc::new(StaticAuth::new(&cfg));
        let cluster = ClusterState::new(&Cluster { name: "n1".into(), ..Default::default() });
        let mut b =
            Broker::new(Mqtt::default(), cluster, Arc::new(MemoryPersistence::default()), auth.clone(), auth);

        let mut rx = connect(&mut b, 1, "c1");
        let message = msg("secret/a", QoS::AtLeastOnce, "x");
        b.handle_inbound(1, Inbound::Publish { packet_id: Some(pid(1)), message });
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [Outbound::PubAck { reason: ReasonCode::NotAuthorized, .. }]
        ));
        subscribe(&mut b, 1, "secret/+", QoS::AtMostOnce);
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [Outbound::SubAck { status, .. }]
                if status == &vec![SubscribeStatus::Refused(ReasonCode::NotAuthorized)]
        ));
    }

    #[test]
    fn local_takeover() {
        let mut b = broker();
        let (mut rx1, _) = connect_with(&mut b, 1, request("c1", false, 60));
        subscribe(&mut b, 1, "a/b", QoS::AtLeastOnce);
        drain(&mut rx1);

        let (_rx2, ack) = connect_with(&mut b, 2, request("c1", false, 60));
        assert!(ack.session_present);
        assert!(matches!(
            drain(&mut rx1).as_slice(),
            [Outbound::Disconnect { reason: ReasonCode::SessionTakenOver, .. }, Outbound::Close]
        ));
        // the old connection closing afterwards does not detach the new one
        b.closed(1);
        assert!(b.is_client_connected("c1"));
        assert_eq!(b.subscriptions().client_subscriptions(&"c1".into()).len(), 1);

        let (_rx3, ack) = connect_with(&mut b, 3, request("c1", true, 60));
        assert!(!ack.session_present);
        assert!(b.subscriptions().is_empty());
    }

    #[test]
    fn keep_alive_and_will() {
        let mut b = broker();
        let mut rx_w = connect(&mut b, 1, "watcher");
        subscribe(&mut b, 1, "last/will", QoS::AtMostOnce);
        drain(&mut rx_w);

        let mut req = request("c1", true, 60);
        req.keep_alive = 1;
        req.will = Some(Will { message: msg("last/will", QoS::AtMostOnce, "gone"), delay_interval: 0 });
        let (mut rx, _) = connect_with(&mut b, 2, req);
        let last_seen = b.local_session("c1").unwrap().handle().unwrap().last_seen;

        b.clean_up_operations(last_seen + 1_000);
        assert!(b.is_client_connected("c1"));
        b.clean_up_operations(last_seen + 1_501);
        assert!(!b.is_client_connected("c1"));
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [Outbound::Disconnect { reason: ReasonCode::KeepAliveTimeout, .. }, Outbound::Close]
        ));
        let got = publishes(&mut rx_w);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].1.payload, "gone");

        // a normal disconnect discards the will
        let mut req = request("c2", true, 60);
        req.will = Some(Will { message: msg("last/will", QoS::AtMostOnce, "gone"), delay_interval: 0 });
        connect_with(&mut b, 3, req);
        b.handle_inbound(3, Inbound::Disconnect { normal: true, session_expiry_interval: None });
        b.clean_up_operations(timestamp_millis());
        assert!(publishes(&mut rx_w).is_empty());
    }

    #[test]
    fn disconnect_cannot_enable_expiry() {
        let mut b = broker();
        let (mut rx, _) = connect_with(&mut b, 1, request("c1", true, 0));
        b.handle_inbound(1, Inbound::Disconnect { normal: true, session_expiry_interval: Some(30) });
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [Outbound::Disconnect { reason: ReasonCode::ProtocolError, .. }, Outbound::Close]
        ));
    }

    #[test]
    fn stop_redirects_clients() {
        let mut b = broker();
        let mut rx = connect(&mut b, 1, "c1");
        b.stop(Some("other:1883".into()), false);
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [Outbound::Disconnect { reason: ReasonCode::ServerMoved, server_reference: Some(_) }, Outbound::Close]
        ));
        assert!(!b.is_client_connected("c1"));

        let mut b = broker();
        let mut rx = connect(&mut b, 1, "c1");
        b.stop(None, false);
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [Outbound::Disconnect { reason: ReasonCode::ServerShuttingDown, .. }, Outbound::Close]
        ));
    }

    #[test]
    fn restore_from_persistence() {
        let persistence: Arc<dyn Persistence> = Arc::new(MemoryPersistence::default());
        let auth = Arc::new(StaticAuth::default());
        let cluster = || ClusterState::new(&Cluster { name: "n1".into(), ..Default::default() });
        {
            let mut b = Broker::new(Mqtt::default(), cluster(), persistence.clone(), auth.clone(), auth.clone());
            connect_with(&mut b, 1, request("c1", false, 600));
            subscribe(&mut b, 1, "a/+", QoS::AtLeastOnce);
            let mut m = msg("a/r", QoS::AtMostOnce, "kept");
            m.retain = true;
            b.publish(None, m, false).unwrap();
            b.closed(1);
            b.publish(None, msg("a/q", QoS::AtLeastOnce, "queued"), false).unwrap();
        }
        let mut b = Broker::new(Mqtt::default(), cluster(), persistence, auth.clone(), auth);
        b.restore().unwrap();
        assert!(!b.is_client_connected("c1"));
        assert_eq!(b.subscriptions().values_size(), 1);
        assert_eq!(b.retained().len(), 1);

        let (mut rx, ack) = connect_with(&mut b, 2, request("c1", false, 600));
        assert!(ack.session_present);
        let got = publishes(&mut rx);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].1.payload, "queued");
    }

    /// Moves frames queued for `to` on the link from `from`.
    fn pump(from: &str, rx: &mut PeerRx, to: &mut Broker) -> usize {
        let mut n = 0;
        while let Ok(msg) = rx.try_recv() {
            to.handle_cluster(from.into(), msg);
            n += 1;
        }
        n
    }

    fn linked() -> (Broker, Broker, PeerRx, PeerRx) {
        let mut n1 = broker_named("n1", Mqtt::default());
        let mut n2 = broker_named("n2", Mqtt::default());
        let (tx12, rx12) = mpsc::unbounded_channel();
        let (tx21, rx21) = mpsc::unbounded_channel();
        assert!(n1.link_up("n2".into(), 1, "n1".into(), tx12));
        assert!(n2.link_up("n1".into(), 1, "n1".into(), tx21));
        (n1, n2, rx12, rx21)
    }

    #[test]
    fn cluster_routes_publish_and_retain() {
        let (mut n1, mut n2, mut to_n2, mut to_n1) = linked();
        let mut rx = connect(&mut n2, 1, "c2");
        subscribe(&mut n2, 1, "a/+", QoS::AtLeastOnce);
        drain(&mut rx);
        pump("n2", &mut to_n1, &mut n1);
        assert!(n1.session("c2").map(|e| e.is_remote()).unwrap_or(false));
        assert!(n1.is_client_connected("c2"));

        let mut m = msg("a/b", QoS::AtLeastOnce, "x");
        m.retain = true;
        assert!(n1.publish(None, m, false).unwrap());
        assert_eq!(n1.retained().len(), 1);
        pump("n1", &mut to_n2, &mut n2);
        assert_eq!(n2.retained().len(), 1);
        let got = publishes(&mut rx);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].1.payload, "x");
        // relayed publishes are not mirrored back
        assert_eq!(pump("n2", &mut to_n1, &mut n1), 0);

        // a node joining later gets the snapshot
        let mut n3 = broker_named("n3", Mqtt::default());
        let (tx, mut to_n3) = mpsc::unbounded_channel();
        n2.link_up("n3".into(), 2, "n2".into(), tx);
        pump("n2", &mut to_n3, &mut n3);
        assert!(n3.session("c2").is_some());
        assert_eq!(n3.subscriptions().values_size(), 1);
        assert_eq!(n3.retained().len(), 1);

        n1.link_down("n2", 1);
        assert!(n1.session("c2").is_none());
        assert!(n1.subscriptions().is_empty());
    }

    #[test]
    fn cluster_shared_pick_and_takeover() {
        let (mut n1, mut n2, mut to_n2, mut to_n1) = linked();
        let mut rx_remote = connect(&mut n2, 1, "s2");
        subscribe(&mut n2, 1, "$share/g/t", QoS::AtMostOnce);
        drain(&mut rx_remote);
        pump("n2", &mut to_n1, &mut n1);
        let mut rx_local = connect(&mut n1, 1, "s1");
        subscribe(&mut n1, 1, "$share/g/t", QoS::AtMostOnce);
        drain(&mut rx_local);
        pump("n1", &mut to_n2, &mut n2);

        for _ in 0..2 {
            n1.publish(None, msg("t", QoS::AtMostOnce, "x"), false).unwrap();
        }
        pump("n1", &mut to_n2, &mut n2);
        assert_eq!(publishes(&mut rx_local).len(), 1);
        assert_eq!(publishes(&mut rx_remote).len(), 1);

        // s2 reconnects on n1
        let (_rx, ack) = connect_with(&mut n1, 2, request("s2", false, 60));
        assert_eq!(ack.reason, ReasonCode::Success);
        pump("n1", &mut to_n2, &mut n2);
        assert!(matches!(
            drain(&mut rx_remote).as_slice(),
            [Outbound::Disconnect { reason: ReasonCode::SessionTakenOver, .. }, Outbound::Close]
        ));
        assert!(n2.session("s2").map(|e| e.is_remote()).unwrap_or(false));
        assert!(n1.local_session("s2").is_some());
        // ownership now lies with n1, stale updates from n2 are ignored
        pump("n2", &mut to_n1, &mut n1);
        assert!(n1.local_session("s2").is_some());
    }
}
