use std::fmt;
use std::num::NonZeroU16;

use bytes::Bytes;
use bytestring::ByteString;
use serde::{Deserialize, Serialize};

pub use fluxmq_utils::TimestampMillis;
pub use rmqtt_codec::types::QoS;

use fluxmq_utils::timestamp_millis;

use crate::error::TopicError;
use crate::topic::Topic;

pub type ClientId = ByteString;
pub type TopicName = ByteString;
pub type TopicFilter = ByteString;
pub type ShareName = ByteString;
pub type NodeName = String;
pub type ConnId = u64;
pub type PacketId = NonZeroU16;
pub type SubscriptionIdentifier = u32;
pub type UserProperty = (ByteString, ByteString);
pub type UserProperties = Vec<UserProperty>;

pub type HashMap<K, V> = std::collections::HashMap<K, V, ahash::RandomState>;
pub type HashSet<K> = std::collections::HashSet<K, ahash::RandomState>;

/// Session expiry interval meaning "never expires".
pub const SESSION_NEVER_EXPIRE: u32 = u32::MAX;

const SHARE_PREFIX: &str = "$share/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolVersion {
    V3,
    V5,
}

impl ProtocolVersion {
    #[inline]
    pub fn is_v5(&self) -> bool {
        matches!(self, ProtocolVersion::V5)
    }
}

/// Application properties travelling with a publish. Only MQTT 5 sessions see them on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageProperties {
    pub payload_format_utf8: bool,
    /// seconds
    pub message_expiry_interval: Option<u32>,
    pub content_type: Option<ByteString>,
    pub response_topic: Option<ByteString>,
    pub correlation_data: Option<Bytes>,
    pub user_properties: UserProperties,
    pub subscription_ids: Vec<SubscriptionIdentifier>,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub topic: TopicName,
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
    pub payload: Bytes,
    pub properties: MessageProperties,
    pub create_time: TimestampMillis,
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("topic", &self.topic)
            .field("qos", &self.qos)
            .field("retain", &self.retain)
            .field("dup", &self.dup)
            .field("payload_len", &self.payload.len())
            .field("properties", &self.properties)
            .field("create_time", &self.create_time)
            .finish()
    }
}

impl Message {
    pub fn new<T: Into<TopicName>, P: Into<Bytes>>(
        topic: T,
        qos: QoS,
        retain: bool,
        payload: P,
        properties: MessageProperties,
    ) -> Self {
        Self {
            topic: topic.into(),
            qos,
            retain,
            dup: false,
            payload: payload.into(),
            properties,
            create_time: timestamp_millis(),
        }
    }

    #[inline]
    pub fn with_expiry(mut self, secs: u32) -> Self {
        self.properties.message_expiry_interval = Some(secs);
        self
    }

    #[inline]
    fn expire_at(&self) -> Option<TimestampMillis> {
        self.properties.message_expiry_interval.map(|secs| self.create_time + secs as i64 * 1000)
    }

    /// Expired once publish time plus the expiry interval lies strictly in the past.
    #[inline]
    pub fn is_expired(&self, now: TimestampMillis) -> bool {
        self.expire_at().map(|at| at < now).unwrap_or(false)
    }

    /// Seconds left before expiry, rounded up.
    #[inline]
    pub fn remaining_expiry(&self, now: TimestampMillis) -> Option<u32> {
        self.expire_at().map(|at| {
            let left = (at - now).max(0);
            ((left + 999) / 1000).min(u32::MAX as i64) as u32
        })
    }

    /// Copy prepared for the wire: the expiry interval is re-derived relative to `now`.
    pub fn prepared(&self, now: TimestampMillis) -> Message {
        let mut msg = self.clone();
        if let Some(left) = self.remaining_expiry(now) {
            msg.properties.message_expiry_interval = Some(left);
        }
        msg
    }

    /// Estimated size of the PUBLISH packet carrying this message.
    pub fn encoded_size(&self, protocol: ProtocolVersion) -> usize {
        let mut var = 2 + self.topic.len();
        if self.qos != QoS::AtMostOnce {
            var += 2;
        }
        if protocol.is_v5() {
            let props = self.properties_size();
            var += varint_len(props) + props;
        }
        let remaining = var + self.payload.len();
        1 + varint_len(remaining) + remaining
    }

    fn properties_size(&self) -> usize {
        let p = &self.properties;
        let mut len = 0;
        if p.payload_format_utf8 {
            len += 2;
        }
        if p.message_expiry_interval.is_some() {
            len += 5;
        }
        len += p.content_type.as_ref().map(|v| 3 + v.len()).unwrap_or_default();
        len += p.response_topic.as_ref().map(|v| 3 + v.len()).unwrap_or_default();
        len += p.correlation_data.as_ref().map(|v| 3 + v.len()).unwrap_or_default();
        len += p.user_properties.iter().map(|(k, v)| 5 + k.len() + v.len()).sum::<usize>();
        len += p.subscription_ids.iter().map(|id| 1 + varint_len(*id as usize)).sum::<usize>();
        len
    }

    /// Sheds user properties, last first, until the packet fits `max_size`. They are the only
    /// optional part of a PUBLISH. Returns false if it still does not fit.
    pub fn fit(&mut self, max_size: Option<u32>, protocol: ProtocolVersion) -> bool {
        let max_size = match max_size {
            Some(max) => max as usize,
            None => return true,
        };
        while self.encoded_size(protocol) > max_size {
            if protocol.is_v5() && self.properties.user_properties.pop().is_some() {
                continue;
            }
            return false;
        }
        true
    }
}

#[inline]
fn varint_len(n: usize) -> usize {
    match n {
        0..=127 => 1,
        128..=16_383 => 2,
        16_384..=2_097_151 => 3,
        _ => 4,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetainHandling {
    #[default]
    AtSubscribe,
    AtSubscribeNew,
    NoAtSubscribe,
}

/// Subscribe request options for one topic filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeFilter {
    pub topic_filter: TopicFilter,
    pub qos: QoS,
    pub no_local: bool,
    pub retain_as_published: bool,
    pub retain_handling: RetainHandling,
}

impl SubscribeFilter {
    pub fn new<F: Into<TopicFilter>>(topic_filter: F, qos: QoS) -> Self {
        Self {
            topic_filter: topic_filter.into(),
            qos,
            no_local: false,
            retain_as_published: false,
            retain_handling: RetainHandling::AtSubscribe,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    /// Filter with any `$share/<group>/` prefix removed.
    pub topic_filter: TopicFilter,
    pub qos: QoS,
    pub no_local: bool,
    pub retain_as_published: bool,
    pub retain_handling: RetainHandling,
    pub share_name: Option<ShareName>,
    pub subscription_identifier: Option<SubscriptionIdentifier>,
    pub last_shared_dispatch_time: TimestampMillis,
}

impl Subscription {
    pub fn new(filter: &str, qos: QoS) -> Result<Self, TopicError> {
        let (share_name, topic_filter) = Self::split_share(filter)?;
        Ok(Self {
            topic_filter,
            qos,
            no_local: false,
            retain_as_published: false,
            retain_handling: RetainHandling::AtSubscribe,
            share_name,
            subscription_identifier: None,
            last_shared_dispatch_time: 0,
        })
    }

    pub fn from_request(req: &SubscribeFilter) -> Result<Self, TopicError> {
        let mut sub = Self::new(&req.topic_filter, req.qos)?;
        sub.no_local = req.no_local;
        sub.retain_as_published = req.retain_as_published;
        sub.retain_handling = req.retain_handling;
        Ok(sub)
    }

    /// Splits `$share/<group>/<filter>` into its group and reduced filter, validating both.
    pub fn split_share(filter: &str) -> Result<(Option<ShareName>, TopicFilter), TopicError> {
        let (share_name, reduced) = if let Some(rest) = filter.strip_prefix(SHARE_PREFIX) {
            let (group, reduced) = rest
                .split_once('/')
                .ok_or_else(|| TopicError::InvalidTopic(format!("invalid shared filter `{}`", filter)))?;
            if group.is_empty() || group.contains(['+', '#']) {
                return Err(TopicError::InvalidTopic(format!("invalid share name in `{}`", filter)));
            }
            (Some(ShareName::from(group)), reduced)
        } else {
            (None, filter)
        };
        Topic::parse_filter(reduced)?;
        Ok((share_name, TopicFilter::from(reduced)))
    }

    #[inline]
    pub fn is_shared(&self) -> bool {
        self.share_name.is_some()
    }

    #[inline]
    pub fn has_wildcards(&self) -> bool {
        self.topic_filter.contains(['+', '#'])
    }

    /// Filter as the client wrote it.
    pub fn full_filter(&self) -> TopicFilter {
        match &self.share_name {
            Some(group) => TopicFilter::from(format!("{}{}/{}", SHARE_PREFIX, group, self.topic_filter)),
            None => self.topic_filter.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Will {
    pub message: Message,
    /// seconds
    pub delay_interval: u32,
}

/// Snapshot of a session as persisted; queues keep their packet identifiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub client_id: ClientId,
    pub protocol: ProtocolVersion,
    pub username: Option<ByteString>,
    pub will: Option<Will>,
    pub session_expiry_interval: u32,
    pub disconnected_at: Option<TimestampMillis>,
    pub next_packet_id: u16,
    pub pending_send: Vec<(u16, Message)>,
    pub awaiting_send_ack: Vec<(u16, Message)>,
    pub awaiting_rel_ack: Vec<u16>,
    pub received_qos2: Vec<u16>,
}

/// What peers learn about a session owned elsewhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub client_id: ClientId,
    pub connected: bool,
    pub protocol: ProtocolVersion,
    pub session_expiry_interval: u32,
    pub disconnected_at: Option<TimestampMillis>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_filter_split() {
        let sub = Subscription::new("$share/g/sport/+", QoS::AtLeastOnce).unwrap();
        assert_eq!(sub.share_name.as_deref(), Some("g"));
        assert_eq!(sub.topic_filter, "sport/+");
        assert_eq!(sub.full_filter(), "$share/g/sport/+");

        let sub = Subscription::new("sport/#", QoS::AtMostOnce).unwrap();
        assert!(sub.share_name.is_none());
        assert_eq!(sub.full_filter(), "sport/#");

        assert!(Subscription::new("$share/g", QoS::AtMostOnce).is_err());
        assert!(Subscription::new("$share//a", QoS::AtMostOnce).is_err());
        assert!(Subscription::new("$share/g+/a", QoS::AtMostOnce).is_err());
        assert!(Subscription::new("a/#/b", QoS::AtMostOnce).is_err());
    }

    #[test]
    fn message_expiry() {
        let mut msg = Message::new("a/b", QoS::AtLeastOnce, false, "x", MessageProperties::default());
        msg.create_time = 10_000;
        assert!(!msg.is_expired(100_000));
        assert_eq!(msg.remaining_expiry(100_000), None);

        let msg = msg.with_expiry(1);
        assert!(!msg.is_expired(11_000));
        assert!(msg.is_expired(11_001));
        assert_eq!(msg.remaining_expiry(10_200), Some(1));
        assert_eq!(msg.prepared(10_200).properties.message_expiry_interval, Some(1));
        assert_eq!(msg.remaining_expiry(12_000), Some(0));
    }

    #[test]
    fn message_fit() {
        let mut props = MessageProperties::default();
        props.user_properties.push(("k".into(), "v".repeat(100).into()));
        props.content_type = Some("text".into());
        let mut msg = Message::new("a/b", QoS::AtLeastOnce, false, "x", props);
        let full = msg.encoded_size(ProtocolVersion::V5);
        assert!(full > 100);
        assert!(msg.fit(Some(full as u32), ProtocolVersion::V5));
        assert_eq!(msg.properties.user_properties.len(), 1);
        assert!(msg.fit(Some(20), ProtocolVersion::V5));
        assert!(msg.properties.user_properties.is_empty());
        assert_eq!(msg.properties.content_type.as_deref(), Some("text"));
        assert!(!msg.fit(Some(5), ProtocolVersion::V5));
        assert!(msg.fit(None, ProtocolVersion::V3));
    }
}
