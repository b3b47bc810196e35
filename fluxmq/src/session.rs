use std::fmt;
use std::num::NonZeroU16;

use bytestring::ByteString;
use tokio::sync::mpsc;

use fluxmq_utils::timestamp_millis;

use crate::cluster::ClusterMessage;
use crate::error::{BrokerError, ReasonCode};
use crate::inflight::Inflight;
use crate::packet::Outbound;
use crate::types::{
    ClientId, ConnId, Message, NodeName, PacketId, ProtocolVersion, QoS, SessionInfo, SessionState,
    TimestampMillis, Will, SESSION_NEVER_EXPIRE,
};

pub type Tx = mpsc::UnboundedSender<Outbound>;
pub type Rx = mpsc::UnboundedReceiver<Outbound>;

/// Side effects of session state changes, supplied by the broker.
pub trait SessionSink {
    fn persist(&mut self, session: &Session);

    fn propagate(&mut self, info: SessionInfo);

    fn forward(&mut self, node: &NodeName, msg: ClusterMessage);
}

/// Operations shared by locally connected sessions and proxies of sessions owned by a peer.
pub trait SessionOps {
    fn client_id(&self) -> &ClientId;

    fn is_connected(&self) -> bool;

    fn publish(&mut self, message: Message, sink: &mut dyn SessionSink);

    fn disconnect_client_session_taken_over(&mut self, sink: &mut dyn SessionSink);

    fn check_keep_alive_expired(&mut self, now: TimestampMillis) -> bool;

    fn is_expired(&self, now: TimestampMillis) -> bool;
}

/// The live connection attached to a session.
pub struct ClientHandle {
    pub conn_id: ConnId,
    tx: Tx,
    pub keep_alive: u16,
    pub last_seen: TimestampMillis,
    pub max_packet_size: Option<u32>,
}

impl ClientHandle {
    pub fn new(conn_id: ConnId, tx: Tx, keep_alive: u16, max_packet_size: Option<u32>) -> Self {
        Self { conn_id, tx, keep_alive, last_seen: timestamp_millis(), max_packet_size }
    }

    /// Queues a packet for the connection task; false once the connection is gone.
    #[inline]
    pub fn send(&self, packet: Outbound) -> bool {
        self.tx.send(packet).is_ok()
    }

    #[inline]
    pub fn touch(&mut self, now: TimestampMillis) {
        self.last_seen = now;
    }

    /// Silence longer than one and a half keep-alive periods.
    #[inline]
    pub fn keep_alive_expired(&self, now: TimestampMillis) -> bool {
        self.keep_alive > 0 && now - self.last_seen > self.keep_alive as i64 * 1500
    }
}

fn write_publish(
    handle: &ClientHandle,
    protocol: ProtocolVersion,
    packet_id: Option<PacketId>,
    msg: &Message,
    dup: bool,
    now: TimestampMillis,
) -> bool {
    let mut out = msg.prepared(now);
    out.dup = dup;
    if !out.fit(handle.max_packet_size, protocol) {
        log::warn!(
            "publish to {:?} exceeds the client maximum packet size {:?}, dropped",
            out.topic,
            handle.max_packet_size
        );
        return false;
    }
    handle.send(Outbound::Publish { packet_id, message: out });
    true
}

pub struct Session {
    pub client_id: ClientId,
    pub protocol: ProtocolVersion,
    pub username: Option<ByteString>,
    pub will: Option<Will>,
    pub session_expiry_interval: u32,
    disconnected_at: Option<TimestampMillis>,
    receive_maximum: u16,
    send_quota: u16,
    inflight: Inflight,
    handle: Option<ClientHandle>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("client_id", &self.client_id)
            .field("connected", &self.handle.is_some())
            .field("session_expiry_interval", &self.session_expiry_interval)
            .field("disconnected_at", &self.disconnected_at)
            .field("send_quota", &self.send_quota)
            .field("pending", &self.inflight.pending_len())
            .field("awaiting_ack", &self.inflight.awaiting_ack_len())
            .field("awaiting_rel", &self.inflight.awaiting_rel_len())
            .finish()
    }
}

impl Session {
    pub fn new(client_id: ClientId, protocol: ProtocolVersion) -> Self {
        Self {
            client_id,
            protocol,
            username: None,
            will: None,
            session_expiry_interval: 0,
            disconnected_at: None,
            receive_maximum: u16::MAX,
            send_quota: 0,
            inflight: Inflight::default(),
            handle: None,
        }
    }

    /// Rebuilds a persisted session; it comes back disconnected.
    pub fn from_state(state: SessionState, now: TimestampMillis) -> Self {
        let inflight = Inflight::from_state(&state);
        Self {
            client_id: state.client_id,
            protocol: state.protocol,
            username: state.username,
            will: state.will,
            session_expiry_interval: state.session_expiry_interval,
            disconnected_at: Some(state.disconnected_at.unwrap_or(now)),
            receive_maximum: u16::MAX,
            send_quota: 0,
            inflight,
            handle: None,
        }
    }

    pub fn state(&self) -> SessionState {
        let mut state = SessionState {
            client_id: self.client_id.clone(),
            protocol: self.protocol,
            username: self.username.clone(),
            will: self.will.clone(),
            session_expiry_interval: self.session_expiry_interval,
            disconnected_at: self.disconnected_at,
            next_packet_id: 1,
            pending_send: Vec::new(),
            awaiting_send_ack: Vec::new(),
            awaiting_rel_ack: Vec::new(),
            received_qos2: Vec::new(),
        };
        self.inflight.fill_state(&mut state);
        state
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            client_id: self.client_id.clone(),
            connected: self.handle.is_some(),
            protocol: self.protocol,
            session_expiry_interval: self.session_expiry_interval,
            disconnected_at: self.disconnected_at,
        }
    }

    #[inline]
    pub fn inflight(&self) -> &Inflight {
        &self.inflight
    }

    #[inline]
    pub fn handle(&self) -> Option<&ClientHandle> {
        self.handle.as_ref()
    }

    #[inline]
    pub fn handle_mut(&mut self) -> Option<&mut ClientHandle> {
        self.handle.as_mut()
    }

    #[inline]
    pub fn conn_id(&self) -> Option<ConnId> {
        self.handle.as_ref().map(|h| h.conn_id)
    }

    #[inline]
    pub fn disconnected_at(&self) -> Option<TimestampMillis> {
        self.disconnected_at
    }

    #[inline]
    pub fn send_quota(&self) -> u16 {
        self.send_quota
    }

    /// Drops queued and in-flight state, as a clean start requires.
    pub fn reset(&mut self) {
        self.inflight.clear();
        self.will = None;
    }

    /// Attaches a live connection. Persists and notifies the cluster unconditionally.
    pub fn mark_connected(&mut self, handle: ClientHandle, receive_maximum: u16, sink: &mut dyn SessionSink) {
        self.handle = Some(handle);
        self.receive_maximum = receive_maximum.max(1);
        self.send_quota = self.receive_maximum;
        self.disconnected_at = None;
        sink.persist(self);
        sink.propagate(self.info());
    }

    /// Detaches the live connection. A no-op unless currently connected.
    pub fn mark_disconnected(&mut self, sink: &mut dyn SessionSink) {
        if self.handle.take().is_none() {
            return;
        }
        if self.disconnected_at.is_none() {
            self.disconnected_at = Some(timestamp_millis());
        }
        self.send_quota = 0;
        sink.persist(self);
        sink.propagate(self.info());
    }

    /// Sends DISCONNECT (MQTT 5 only carries it) and asks the connection task to close.
    pub fn disconnect(&self, reason: ReasonCode, server_reference: Option<ByteString>) {
        if let Some(h) = self.handle.as_ref() {
            h.send(Outbound::Disconnect { reason, server_reference });
            h.send(Outbound::Close);
        }
    }

    #[inline]
    pub fn send(&self, packet: Outbound) -> bool {
        self.handle.as_ref().map(|h| h.send(packet)).unwrap_or(false)
    }

    fn send_pending(&mut self) {
        let Some(handle) = self.handle.as_ref() else { return };
        let now = timestamp_millis();
        while self.send_quota > 0 {
            let Some((id, msg)) = self.inflight.pop_pending() else { break };
            if msg.is_expired(now) {
                log::debug!("{} drop expired message, packet_id: {}", self.client_id, id);
                continue;
            }
            let Some(packet_id) = NonZeroU16::new(id) else { continue };
            if write_publish(handle, self.protocol, Some(packet_id), &msg, false, now) {
                self.send_quota -= 1;
                self.inflight.push_awaiting_ack(id, msg);
            }
        }
    }

    #[inline]
    fn release_quota(&mut self) {
        self.send_quota = self.send_quota.saturating_add(1).min(self.receive_maximum);
    }

    /// Called after a reconnect: resend in-flight PUBLISH (dup) and PUBREL, then drain the backlog.
    pub fn resend_pending(&mut self, sink: &mut dyn SessionSink) {
        let now = timestamp_millis();
        let resend = self.inflight.take_resend(now);
        let rel = self.inflight.awaiting_rel_ids();
        if let Some(handle) = self.handle.as_ref() {
            for (id, msg) in resend.iter() {
                let packet_id = NonZeroU16::new(*id);
                if !write_publish(handle, self.protocol, packet_id, msg, true, now) {
                    self.inflight.remove_awaiting_ack(*id);
                }
            }
            for packet_id in rel.into_iter().filter_map(NonZeroU16::new) {
                handle.send(Outbound::PubRel { packet_id, reason: ReasonCode::Success });
            }
        }
        let used = self.inflight.awaiting_ack_len() + self.inflight.awaiting_rel_len();
        self.send_quota = self.receive_maximum.saturating_sub(used.min(u16::MAX as usize) as u16);
        self.send_pending();
        sink.persist(self);
    }

    pub fn on_puback(&mut self, packet_id: PacketId, sink: &mut dyn SessionSink) -> bool {
        if self.inflight.remove_awaiting_ack(packet_id.get()).is_none() {
            log::debug!("{} PUBACK for unknown packet_id: {}", self.client_id, packet_id);
            return false;
        }
        self.release_quota();
        self.send_pending();
        sink.persist(self);
        true
    }

    pub fn on_pubrec(&mut self, packet_id: PacketId, sink: &mut dyn SessionSink) -> bool {
        let id = packet_id.get();
        if self.inflight.remove_awaiting_ack(id).is_some() {
            self.inflight.push_awaiting_rel(id);
            self.send(Outbound::PubRel { packet_id, reason: ReasonCode::Success });
            sink.persist(self);
            true
        } else {
            self.send(Outbound::PubRel { packet_id, reason: ReasonCode::PacketIdentifierNotFound });
            false
        }
    }

    pub fn on_pubcomp(&mut self, packet_id: PacketId, sink: &mut dyn SessionSink) -> bool {
        if !self.inflight.remove_awaiting_rel(packet_id.get()) {
            log::debug!("{} PUBCOMP for unknown packet_id: {}", self.client_id, packet_id);
            return false;
        }
        self.release_quota();
        self.send_pending();
        sink.persist(self);
        true
    }

    pub fn on_pubrel(&mut self, packet_id: PacketId, sink: &mut dyn SessionSink) {
        let reason = if self.inflight.release_qos2(packet_id.get()) {
            sink.persist(self);
            ReasonCode::Success
        } else {
            ReasonCode::PacketIdentifierNotFound
        };
        self.send(Outbound::PubComp { packet_id, reason });
    }

    /// Records an inbound QoS 2 identifier. Ok(false) means a duplicate that must not be routed again.
    pub fn receive_qos2(&mut self, packet_id: PacketId, receive_maximum: u16) -> Result<bool, BrokerError> {
        let id = packet_id.get();
        if !self.inflight.receive_qos2(id) {
            return Ok(false);
        }
        if self.inflight.received_qos2_len() > receive_maximum as usize {
            self.inflight.release_qos2(id);
            return Err(BrokerError::protocol(
                ReasonCode::ReceiveMaximumExceeded,
                format!("more than {} concurrent QoS 2 publishes", receive_maximum),
            ));
        }
        Ok(true)
    }

    /// Whether the will should go out now: its delay elapsed since the disconnect.
    pub fn will_due(&self, now: TimestampMillis) -> bool {
        match (&self.will, self.disconnected_at) {
            (Some(will), Some(at)) if self.handle.is_none() => now - at >= will.delay_interval as i64 * 1000,
            _ => false,
        }
    }

    /// Takes the will message, stamped with the dispatch time.
    pub fn take_will(&mut self, now: TimestampMillis) -> Option<Message> {
        self.will.take().map(|w| {
            let mut msg = w.message;
            msg.create_time = now;
            msg
        })
    }
}

impl SessionOps for Session {
    #[inline]
    fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    #[inline]
    fn is_connected(&self) -> bool {
        self.handle.is_some()
    }

    fn publish(&mut self, message: Message, sink: &mut dyn SessionSink) {
        let now = timestamp_millis();
        if message.is_expired(now) {
            log::debug!("{} drop expired message, topic: {}", self.client_id, message.topic);
            return;
        }
        if message.qos == QoS::AtMostOnce {
            if let Some(handle) = self.handle.as_ref() {
                write_publish(handle, self.protocol, None, &message, false, now);
            }
            return;
        }
        match self.inflight.next_id() {
            Ok(packet_id) => {
                self.inflight.push_pending(packet_id, message);
                self.send_pending();
                sink.persist(self);
            }
            Err(e) => {
                log::warn!("{} message dropped, topic: {}, {}", self.client_id, message.topic, e);
            }
        }
    }

    fn disconnect_client_session_taken_over(&mut self, sink: &mut dyn SessionSink) {
        self.disconnect(ReasonCode::SessionTakenOver, None);
        self.mark_disconnected(sink);
    }

    fn check_keep_alive_expired(&mut self, now: TimestampMillis) -> bool {
        match self.handle.as_ref() {
            Some(h) if h.keep_alive_expired(now) => {
                log::info!("{} keep alive timeout, last seen {}", self.client_id, h.last_seen);
                self.disconnect(ReasonCode::KeepAliveTimeout, None);
                true
            }
            _ => false,
        }
    }

    fn is_expired(&self, now: TimestampMillis) -> bool {
        if self.handle.is_some() || self.session_expiry_interval == SESSION_NEVER_EXPIRE {
            return false;
        }
        self.disconnected_at
            .map(|at| now - at >= self.session_expiry_interval as i64 * 1000)
            .unwrap_or(false)
    }
}

/// A session owned by a peer node; publishes travel over the cluster link.
#[derive(Debug, Clone)]
pub struct RemoteSession {
    pub client_id: ClientId,
    pub node: NodeName,
    pub connected: bool,
    pub protocol: ProtocolVersion,
    pub session_expiry_interval: u32,
    pub disconnected_at: Option<TimestampMillis>,
}

impl RemoteSession {
    pub fn new(client_id: ClientId, node: NodeName) -> Self {
        Self {
            client_id,
            node,
            connected: false,
            protocol: ProtocolVersion::V5,
            session_expiry_interval: 0,
            disconnected_at: None,
        }
    }

    pub fn update(&mut self, node: &NodeName, info: SessionInfo) {
        self.node.clone_from(node);
        self.connected = info.connected;
        self.protocol = info.protocol;
        self.session_expiry_interval = info.session_expiry_interval;
        self.disconnected_at = info.disconnected_at;
    }
}

impl SessionOps for RemoteSession {
    #[inline]
    fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    #[inline]
    fn is_connected(&self) -> bool {
        self.connected
    }

    fn publish(&mut self, message: Message, sink: &mut dyn SessionSink) {
        sink.forward(&self.node, ClusterMessage::Deliver { client_id: self.client_id.clone(), message });
    }

    fn disconnect_client_session_taken_over(&mut self, sink: &mut dyn SessionSink) {
        sink.forward(&self.node, ClusterMessage::SessionTakenOver { client_id: self.client_id.clone() });
        self.connected = false;
    }

    // the owning node watches keep alive and expiry
    #[inline]
    fn check_keep_alive_expired(&mut self, _now: TimestampMillis) -> bool {
        false
    }

    #[inline]
    fn is_expired(&self, _now: TimestampMillis) -> bool {
        false
    }
}

#[derive(Debug)]
pub enum SessionEntry {
    Local(Box<Session>),
    Remote(RemoteSession),
}

impl SessionEntry {
    #[inline]
    pub fn as_local(&self) -> Option<&Session> {
        match self {
            SessionEntry::Local(s) => Some(s),
            SessionEntry::Remote(_) => None,
        }
    }

    #[inline]
    pub fn as_local_mut(&mut self) -> Option<&mut Session> {
        match self {
            SessionEntry::Local(s) => Some(s),
            SessionEntry::Remote(_) => None,
        }
    }

    #[inline]
    pub fn is_remote(&self) -> bool {
        matches!(self, SessionEntry::Remote(_))
    }

    #[inline]
    fn ops(&self) -> &dyn SessionOps {
        match self {
            SessionEntry::Local(s) => &**s,
            SessionEntry::Remote(r) => r,
        }
    }

    #[inline]
    fn ops_mut(&mut self) -> &mut dyn SessionOps {
        match self {
            SessionEntry::Local(s) => &mut **s,
            SessionEntry::Remote(r) => r,
        }
    }
}

impl SessionOps for SessionEntry {
    fn client_id(&self) -> &ClientId {
        self.ops().client_id()
    }

    fn is_connected(&self) -> bool {
        self.ops().is_connected()
    }

    fn publish(&mut self, message: Message, sink: &mut dyn SessionSink) {
        self.ops_mut().publish(message, sink)
    }

    fn disconnect_client_session_taken_over(&mut self, sink: &mut dyn SessionSink) {
        self.ops_mut().disconnect_client_session_taken_over(sink)
    }

    fn check_keep_alive_expired(&mut self, now: TimestampMillis) -> bool {
        self.ops_mut().check_keep_alive_expired(now)
    }

    fn is_expired(&self, now: TimestampMillis) -> bool {
        self.ops().is_expired(now)
    }
}
