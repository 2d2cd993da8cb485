//! RocketSpeed Control Tower - the topic tailer subsystem.
//!
//! RocketSpeed is a distributed publish/subscribe system layered over an
//! append-only log store. Pilots append published records to logs;
//! control towers tail those logs and fan records out to subscribers;
//! copilots route client subscriptions to the right towers. This crate
//! is the heart of the control tower: one [`TopicTailer`] per room
//! (worker), mapping an unbounded set of topics onto a small pool of log
//! readers.
//!
//! # Key Concepts
//!
//! - **Log**: an append-only record sequence in the external log store,
//!   identified by [`LogId`]. Many topics hash onto one log via the
//!   [`LogRouter`].
//! - **Seqno**: monotonic position within a log. Subscribing at seqno 0
//!   means "from the tail".
//! - **Reader**: one cursor into the log store. A room owns a few so one
//!   log can be served at several positions; readers merge when their
//!   positions meet.
//! - **Room**: the single worker task owning all tailer state. Upstream
//!   threads talk to it through a bounded command queue ([`Room`],
//!   [`RoomHandle`]).
//!
//! Subscribers receive [`Message::Deliver`] and [`Message::Gap`] wire
//! messages with a contiguous `(prev_seqno, seqno)` chain per
//! subscription; benign gaps announce record-free ranges, retention and
//! data-loss gaps announce missing data.
//!
//! # Example
//!
//! ```ignore
//! use controltower::{Room, RoomHandle, TailerConfig, HashLogRouter, HostId};
//! use common::{clock::SystemClock, flow::ChannelSink};
//!
//! let (out_tx, out_rx) = tokio::sync::mpsc::channel(1024);
//! let handle = Room::spawn(
//!     TailerConfig::default(),
//!     log_store,
//!     std::sync::Arc::new(HashLogRouter::new(1024)),
//!     Box::new(ChannelSink::new(out_tx)),
//!     std::sync::Arc::new(SystemClock),
//!     HostId::new("tower-1", 58200),
//! );
//! handle.add_subscriber(topic, 0, copilot_sub)?;
//! // out_rx now yields OutboundMessage values for the client I/O layer.
//! ```

mod bloom;
mod cache;
mod config;
mod error;
mod message;
mod metrics;
mod model;
mod reader;
mod room;
mod router;
mod storage;
mod subscription;
mod tailer;
mod topic;

pub mod test_utils;

pub use cache::CacheRead;
pub use config::TailerConfig;
pub use error::{Error, Result};
pub use message::{
    HostId, Message, MessageDeliver, MessageGap, MessageMetadata, MetaType, MetadataOp,
    TopicMetadata, WIRE_VERSION,
};
pub use metrics::Metrics;
pub use model::{
    CopilotSub, GapKind, LogId, LogRecord, MsgId, MsgIdGenerator, NamespaceId, ReaderId, Retention,
    SequenceNumber, StreamId, SubscriptionId, TenantId, TopicUuid,
};
pub use room::{Room, RoomCommand, RoomHandle};
pub use router::{HashLogRouter, LogRouter};
pub use storage::{FindLatestCallback, LogStore};
pub use tailer::{FindLatestSeqnoResponse, OutboundMessage, TopicTailer};
