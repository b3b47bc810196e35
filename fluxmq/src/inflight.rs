use std::collections::BTreeSet;
use std::num::NonZeroU16;

use itertools::Itertools;
use rust_box::dequemap::DequeBTreeMap as DequeMap;

use crate::error::BrokerError;
use crate::types::{Message, PacketId, SessionState, TimestampMillis};

type OutQueue = DequeMap<u16, Message>;

/// Per-session QoS 1/2 windows, keyed by packet identifier.
///
/// An outbound message sits in exactly one of `pending_send` (quota exhausted or
/// client offline), `awaiting_send_ack` (PUBLISH written, waiting for PUBACK/PUBREC)
/// or, reduced to its identifier, `awaiting_rel_ack` (PUBREL written, waiting for PUBCOMP).
pub struct Inflight {
    next: u16,
    pending_send: OutQueue,
    awaiting_send_ack: OutQueue,
    awaiting_rel_ack: DequeMap<u16, ()>,
    received_qos2: BTreeSet<u16>,
}

impl Default for Inflight {
    fn default() -> Self {
        Self {
            next: 1,
            pending_send: OutQueue::default(),
            awaiting_send_ack: OutQueue::default(),
            awaiting_rel_ack: DequeMap::default(),
            received_qos2: BTreeSet::default(),
        }
    }
}

impl Inflight {
    /// Cyclic allocation over [1, 65535]; identifiers still in use are skipped.
    /// A full cycle without a free identifier is an error rather than a spin.
    pub fn next_id(&mut self) -> Result<PacketId, BrokerError> {
        for _ in 0..u16::MAX {
            let packet_id = self.next;
            self.next = if self.next == u16::MAX { 1 } else { self.next + 1 };
            if !self.in_use(packet_id) {
                if let Some(id) = NonZeroU16::new(packet_id) {
                    return Ok(id);
                }
            }
        }
        Err(BrokerError::PacketIdExhausted)
    }

    /// A PUBREL still outstanding keeps its identifier reserved as well.
    #[inline]
    pub fn in_use(&self, packet_id: u16) -> bool {
        self.pending_send.contains_key(&packet_id)
            || self.awaiting_send_ack.contains_key(&packet_id)
            || self.awaiting_rel_ack.contains_key(&packet_id)
    }

    #[inline]
    pub fn push_pending(&mut self, packet_id: PacketId, msg: Message) {
        self.pending_send.insert(packet_id.get(), msg);
    }

    #[inline]
    pub fn pop_pending(&mut self) -> Option<(u16, Message)> {
        self.pending_send.pop_front()
    }

    #[inline]
    pub fn push_awaiting_ack(&mut self, packet_id: u16, msg: Message) {
        self.awaiting_send_ack.insert(packet_id, msg);
    }

    #[inline]
    pub fn remove_awaiting_ack(&mut self, packet_id: u16) -> Option<Message> {
        self.awaiting_send_ack.remove(&packet_id)
    }

    #[inline]
    pub fn push_awaiting_rel(&mut self, packet_id: u16) {
        self.awaiting_rel_ack.insert(packet_id, ());
    }

    #[inline]
    pub fn remove_awaiting_rel(&mut self, packet_id: u16) -> bool {
        self.awaiting_rel_ack.remove(&packet_id).is_some()
    }

    /// Records an inbound QoS 2 identifier; false if it was already recorded.
    #[inline]
    pub fn receive_qos2(&mut self, packet_id: u16) -> bool {
        self.received_qos2.insert(packet_id)
    }

    #[inline]
    pub fn release_qos2(&mut self, packet_id: u16) -> bool {
        self.received_qos2.remove(&packet_id)
    }

    #[inline]
    pub fn received_qos2_len(&self) -> usize {
        self.received_qos2.len()
    }

    #[inline]
    pub fn pending_len(&self) -> usize {
        self.pending_send.len()
    }

    #[inline]
    pub fn awaiting_ack_len(&self) -> usize {
        self.awaiting_send_ack.len()
    }

    #[inline]
    pub fn awaiting_rel_len(&self) -> usize {
        self.awaiting_rel_ack.len()
    }

    #[inline]
    pub fn has_pending(&self, packet_id: u16) -> bool {
        self.pending_send.contains_key(&packet_id)
    }

    #[inline]
    pub fn has_awaiting_ack(&self, packet_id: u16) -> bool {
        self.awaiting_send_ack.contains_key(&packet_id)
    }

    /// In-flight messages to resend after a reconnect, oldest first. Expired ones are dropped.
    pub fn take_resend(&mut self, now: TimestampMillis) -> Vec<(u16, Message)> {
        let expired = self
            .awaiting_send_ack
            .iter()
            .filter(|(_, m)| m.is_expired(now))
            .map(|(id, _)| *id)
            .collect_vec();
        for id in expired {
            log::debug!("drop expired in-flight message, packet_id: {}", id);
            self.awaiting_send_ack.remove(&id);
        }
        self.awaiting_send_ack.iter().map(|(id, m)| (*id, m.clone())).collect_vec()
    }

    pub fn awaiting_rel_ids(&self) -> Vec<u16> {
        self.awaiting_rel_ack.iter().map(|(id, _)| *id).collect_vec()
    }

    pub fn fill_state(&self, state: &mut SessionState) {
        state.next_packet_id = self.next;
        state.pending_send = self.pending_send.iter().map(|(id, m)| (*id, m.clone())).collect();
        state.awaiting_send_ack = self.awaiting_send_ack.iter().map(|(id, m)| (*id, m.clone())).collect();
        state.awaiting_rel_ack = self.awaiting_rel_ids();
        state.received_qos2 = self.received_qos2.iter().copied().collect();
    }

    pub fn from_state(state: &SessionState) -> Self {
        let mut inflight = Inflight { next: state.next_packet_id.max(1), ..Default::default() };
        for (id, m) in &state.pending_send {
            inflight.pending_send.insert(*id, m.clone());
        }
        for (id, m) in &state.awaiting_send_ack {
            inflight.awaiting_send_ack.insert(*id, m.clone());
        }
        for id in &state.awaiting_rel_ack {
            inflight.awaiting_rel_ack.insert(*id, ());
        }
        inflight.received_qos2.extend(state.received_qos2.iter().copied());
        inflight
    }

    pub fn clear(&mut self) {
        *self = Inflight::default();
    }
}
