//! Backpressure-aware sink primitives.
//!
//! A [`Sink`] is anything that accepts values and may be full. Producers
//! choose between two disciplines:
//!
//! - `try_write` hands the value back on a full sink. Used where the
//!   producer can park its position and retry later (cache drains).
//! - `write` suspends until the sink has capacity. Used on the record
//!   path: while the producer is suspended it stops draining its own
//!   input queue, which is how "downstream full" propagates upstream.
//!
//! [`Flow`] is a per-batch latch recording that a `try_write` failed, so
//! loops that fan one event out to several sinks can finish the current
//! item and then stop. [`FlowControl`] keeps lifetime backpressure
//! accounting and warns when a producer stays blocked for too long.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Error returned by [`Sink::write`] when the receiving side is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkClosed;

impl std::fmt::Display for SinkClosed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sink closed")
    }
}

impl std::error::Error for SinkClosed {}

/// A destination for values that can apply backpressure.
#[async_trait]
pub trait Sink<T>: Send {
    /// Attempts a non-blocking write.
    ///
    /// On backpressure the value is handed back to the caller so it can
    /// be retried; a closed sink also hands the value back (the caller
    /// cannot usefully distinguish the two without retrying).
    fn try_write(&mut self, value: T) -> Result<(), T>;

    /// Writes, suspending until the sink has capacity.
    async fn write(&mut self, value: T) -> Result<(), SinkClosed>;

    /// Resolves when the sink is likely to accept a write.
    async fn ready(&mut self);
}

/// A [`Sink`] backed by a bounded tokio channel.
pub struct ChannelSink<T> {
    tx: mpsc::Sender<T>,
}

impl<T> ChannelSink<T> {
    pub fn new(tx: mpsc::Sender<T>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl<T: Send + 'static> Sink<T> for ChannelSink<T> {
    fn try_write(&mut self, value: T) -> Result<(), T> {
        self.tx.try_send(value).map_err(|err| match err {
            mpsc::error::TrySendError::Full(value) => value,
            mpsc::error::TrySendError::Closed(value) => value,
        })
    }

    async fn write(&mut self, value: T) -> Result<(), SinkClosed> {
        self.tx.send(value).await.map_err(|_| SinkClosed)
    }

    async fn ready(&mut self) {
        // A permit proves capacity exists; dropping it releases the slot
        // back to the next writer.
        let _ = self.tx.reserve().await;
    }
}

/// Per-batch write-failure latch.
///
/// Created at the start of a delivery batch; once a `try_write` through
/// it fails, the latch stays set and further writes are refused so the
/// caller stops at a well-defined position.
#[derive(Debug, Default)]
pub struct Flow {
    failed: bool,
}

impl Flow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes through the latch. Returns `false` (and sets the latch) on
    /// backpressure; the value is dropped, so callers must not advance
    /// past it.
    pub fn write<T>(&mut self, sink: &mut dyn Sink<T>, value: T) -> bool {
        debug_assert!(!self.failed, "write after backpressure");
        if sink.try_write(value).is_err() {
            self.failed = true;
        }
        !self.failed
    }

    pub fn write_has_failed(&self) -> bool {
        self.failed
    }
}

/// Lifetime backpressure accounting for one producer.
#[derive(Debug)]
pub struct FlowControl {
    applied: u64,
    lifted: u64,
    blocked_since: Option<Instant>,
    warn_after: Duration,
}

impl FlowControl {
    pub fn new(warn_after: Duration) -> Self {
        Self {
            applied: 0,
            lifted: 0,
            blocked_since: None,
            warn_after,
        }
    }

    /// Records that the producer hit a full sink.
    pub fn on_blocked(&mut self, source: &str) {
        self.applied += 1;
        let since = *self.blocked_since.get_or_insert_with(Instant::now);
        if since.elapsed() >= self.warn_after {
            tracing::warn!(
                "{} blocked on downstream for {:?} (applied={} lifted={})",
                source,
                since.elapsed(),
                self.applied,
                self.lifted
            );
        }
    }

    /// Records that the sink accepted a write again.
    pub fn on_unblocked(&mut self) {
        self.lifted += 1;
        self.blocked_since = None;
    }

    pub fn backpressure_applied(&self) -> u64 {
        self.applied
    }

    pub fn backpressure_lifted(&self) -> u64 {
        self.lifted
    }
}

impl Default for FlowControl {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn should_hand_value_back_when_channel_full() {
        // given
        let (tx, mut rx) = mpsc::channel::<u32>(1);
        let mut sink = ChannelSink::new(tx);

        // when
        assert!(sink.try_write(1).is_ok());
        let rejected = sink.try_write(2);

        // then
        assert_eq!(rejected, Err(2));
        assert_eq!(rx.recv().await, Some(1));
        assert!(sink.try_write(3).is_ok());
    }

    #[tokio::test]
    async fn should_suspend_write_until_capacity() {
        let (tx, mut rx) = mpsc::channel::<u32>(1);
        let mut sink = ChannelSink::new(tx);
        sink.try_write(1).unwrap();

        let writer = tokio::spawn(async move {
            sink.write(2).await.unwrap();
            sink
        });

        // the writer cannot finish until the receiver drains a slot
        assert_eq!(rx.recv().await, Some(1));
        let mut sink = writer.await.unwrap();
        assert_eq!(rx.recv().await, Some(2));
        assert!(sink.try_write(3).is_ok());
    }

    #[tokio::test]
    async fn should_report_closed_sink() {
        let (tx, rx) = mpsc::channel::<u32>(1);
        drop(rx);
        let mut sink = ChannelSink::new(tx);

        assert_eq!(sink.write(1).await, Err(SinkClosed));
    }

    #[tokio::test]
    async fn should_latch_flow_after_first_failure() {
        let (tx, _rx) = mpsc::channel::<u32>(1);
        let mut sink = ChannelSink::new(tx);
        let mut flow = Flow::new();

        assert!(flow.write(&mut sink, 1));
        assert!(!flow.write(&mut sink, 2));
        assert!(flow.write_has_failed());
    }

    #[test]
    fn should_count_backpressure_events() {
        let mut fc = FlowControl::new(Duration::from_secs(1));

        fc.on_blocked("test");
        fc.on_unblocked();
        fc.on_blocked("test");

        assert_eq!(fc.backpressure_applied(), 2);
        assert_eq!(fc.backpressure_lifted(), 1);
    }
}
