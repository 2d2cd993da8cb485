//! Core data types for the control tower.
//!
//! This module defines the identifiers and value types shared across the
//! tailer: logs, sequence numbers, topics, tenants, and the record shape
//! handed over by the log store.

use bytes::Bytes;

/// Identifier of one append-only log in the log store.
///
/// Assigned by the [`LogRouter`](crate::router::LogRouter) from a topic;
/// many topics hash to one log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LogId(pub u64);

impl std::fmt::Display for LogId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Log({})", self.0)
    }
}

/// Position within a log.
///
/// Monotonically increasing, assigned by the log store. Zero is reserved
/// and means "subscribe at the tail".
pub type SequenceNumber = u64;

/// Identifier of one reader cursor registered with the log store.
pub type ReaderId = usize;

/// Namespace half of a topic identity.
///
/// Namespaces up to [`NamespaceId::MAX_RESERVED`] are reserved for system
/// topics; client publishes land in [`NamespaceId::GUEST`] and above.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NamespaceId(pub u16);

impl NamespaceId {
    /// Highest reserved (system) namespace.
    pub const MAX_RESERVED: NamespaceId = NamespaceId(99);

    /// Default namespace for guest clients.
    pub const GUEST: NamespaceId = NamespaceId(101);

    /// Whether this namespace is reserved for system topics.
    pub fn is_reserved(self) -> bool {
        self <= Self::MAX_RESERVED
    }
}

/// Tenant identity carried on wire messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TenantId(pub u16);

impl TenantId {
    pub const GUEST: TenantId = TenantId(1);
}

/// The unit of subscription: a `(namespace, topic name)` pair.
///
/// Ordered by byte representation so it can key ordered containers.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TopicUuid {
    pub namespace: NamespaceId,
    pub topic: Bytes,
}

impl TopicUuid {
    pub fn new(namespace: NamespaceId, topic: impl Into<Bytes>) -> Self {
        Self {
            namespace,
            topic: topic.into(),
        }
    }
}

impl std::fmt::Display for TopicUuid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Topic({}, {})",
            self.namespace.0,
            String::from_utf8_lossy(&self.topic)
        )
    }
}

/// Identifier of one client stream at the upstream copilot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamId(pub u64);

/// Identifier of one subscription within a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(pub u64);

/// Handle identifying a single subscription at the upstream copilot.
///
/// Delivered messages are addressed to a list of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CopilotSub {
    pub stream: StreamId,
    pub sub: SubscriptionId,
}

impl CopilotSub {
    pub fn new(stream: StreamId, sub: SubscriptionId) -> Self {
        Self { stream, sub }
    }
}

impl std::fmt::Display for CopilotSub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Sub({}, {})", self.stream.0, self.sub.0)
    }
}

/// Kind of a gap in a log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GapKind {
    /// No records in the range; nothing was lost.
    Benign = 0,
    /// Records in the range fell out of retention.
    Retention = 1,
    /// Records in the range were lost by the log store.
    DataLoss = 2,
}

impl GapKind {
    pub fn is_malignant(self) -> bool {
        !matches!(self, GapKind::Benign)
    }

    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(GapKind::Benign),
            1 => Some(GapKind::Retention),
            2 => Some(GapKind::DataLoss),
            _ => None,
        }
    }
}

/// Retention period requested for a published record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Retention {
    OneHour = 0,
    OneDay = 1,
    OneWeek = 2,
}

impl Retention {
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(Retention::OneHour),
            1 => Some(Retention::OneDay),
            2 => Some(Retention::OneWeek),
            _ => None,
        }
    }
}

/// Globally unique message identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MsgId(pub [u8; 16]);

impl MsgId {
    pub const ZERO: MsgId = MsgId([0; 16]);
}

/// Per-room message id generator.
///
/// Ids combine a per-room seed with a counter; rooms never share one, so
/// no cross-thread coordination is needed.
#[derive(Debug)]
pub struct MsgIdGenerator {
    seed: u64,
    counter: u64,
}

impl MsgIdGenerator {
    pub fn new(seed: u64) -> Self {
        Self { seed, counter: 0 }
    }

    pub fn next(&mut self) -> MsgId {
        self.counter += 1;
        let mut id = [0u8; 16];
        id[..8].copy_from_slice(&self.seed.to_le_bytes());
        id[8..].copy_from_slice(&self.counter.to_le_bytes());
        MsgId(id)
    }
}

/// One record as handed over by the log tailer.
///
/// Carries the log position plus every field needed to build a `Deliver`
/// message without consulting the store again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub seqno: SequenceNumber,
    pub topic: TopicUuid,
    pub tenant: TenantId,
    pub msg_id: MsgId,
    pub retention: Retention,
    pub payload: Bytes,
}

impl LogRecord {
    /// Approximate memory footprint, used for cache accounting.
    pub fn total_size(&self) -> usize {
        std::mem::size_of::<Self>() + self.topic.topic.len() + self.payload.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_order_topics_by_namespace_then_name() {
        let a = TopicUuid::new(NamespaceId(1), "alpha");
        let b = TopicUuid::new(NamespaceId(1), "beta");
        let c = TopicUuid::new(NamespaceId(2), "alpha");

        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn should_flag_reserved_namespaces() {
        assert!(NamespaceId(0).is_reserved());
        assert!(NamespaceId(99).is_reserved());
        assert!(!NamespaceId(100).is_reserved());
        assert!(!NamespaceId::GUEST.is_reserved());
    }

    #[test]
    fn should_generate_distinct_msg_ids() {
        let mut generator = MsgIdGenerator::new(7);

        let first = generator.next();
        let second = generator.next();

        assert_ne!(first, second);
        assert_eq!(&first.0[..8], &second.0[..8]);
    }

    #[test]
    fn should_decode_gap_kind_from_wire() {
        assert_eq!(GapKind::from_wire(0), Some(GapKind::Benign));
        assert_eq!(GapKind::from_wire(1), Some(GapKind::Retention));
        assert_eq!(GapKind::from_wire(2), Some(GapKind::DataLoss));
        assert_eq!(GapKind::from_wire(3), None);
        assert!(GapKind::Retention.is_malignant());
        assert!(!GapKind::Benign.is_malignant());
    }
}
