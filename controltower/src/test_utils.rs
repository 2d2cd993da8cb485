//! Test doubles for exercising the tailer without a log store or a
//! client I/O layer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use common::flow::{Sink, SinkClosed};

use crate::error::Result;
use crate::model::{
    LogId, LogRecord, MsgIdGenerator, ReaderId, Retention, SequenceNumber, TenantId, TopicUuid,
};
use crate::storage::{FindLatestCallback, LogStore};
use crate::tailer::OutboundMessage;

/// A cursor-management call recorded by [`MockLogStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCall {
    Start {
        log_id: LogId,
        seqno: SequenceNumber,
        reader_id: ReaderId,
        first_open: bool,
    },
    Stop {
        log_id: LogId,
        reader_id: ReaderId,
    },
}

/// A log store that records every call and answers `FindLatestSeqno`
/// from a configurable table (default tail: 1).
pub struct MockLogStore {
    calls: Mutex<Vec<StoreCall>>,
    latest: Mutex<HashMap<LogId, SequenceNumber>>,
    subscribe_past_end: bool,
}

impl MockLogStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            latest: Mutex::new(HashMap::new()),
            subscribe_past_end: true,
        })
    }

    pub fn without_subscribe_past_end() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            latest: Mutex::new(HashMap::new()),
            subscribe_past_end: false,
        })
    }

    /// Sets the tail returned for `log_id`.
    pub fn set_latest(&self, log_id: LogId, seqno: SequenceNumber) {
        self.latest.lock().unwrap().insert(log_id, seqno);
    }

    pub fn calls(&self) -> Vec<StoreCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn stop_calls(&self, log_id: LogId) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| matches!(call, StoreCall::Stop { log_id: l, .. } if *l == log_id))
            .count()
    }

    pub fn start_calls(&self, log_id: LogId) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| matches!(call, StoreCall::Start { log_id: l, .. } if *l == log_id))
            .count()
    }

    /// The seqno of the most recent `start_reading` for a log.
    pub fn last_start_seqno(&self, log_id: LogId) -> Option<SequenceNumber> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find_map(|call| match call {
                StoreCall::Start { log_id: l, seqno, .. } if *l == log_id => Some(*seqno),
                _ => None,
            })
    }
}

impl LogStore for MockLogStore {
    fn start_reading(
        &self,
        log_id: LogId,
        seqno: SequenceNumber,
        reader_id: ReaderId,
        first_open: bool,
    ) -> Result<()> {
        self.calls.lock().unwrap().push(StoreCall::Start {
            log_id,
            seqno,
            reader_id,
            first_open,
        });
        Ok(())
    }

    fn stop_reading(&self, log_id: LogId, reader_id: ReaderId) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(StoreCall::Stop { log_id, reader_id });
        Ok(())
    }

    fn find_latest_seqno(&self, log_id: LogId, callback: FindLatestCallback) {
        let tail = self
            .latest
            .lock()
            .unwrap()
            .get(&log_id)
            .copied()
            .unwrap_or(1);
        callback(Ok(tail));
    }

    fn can_subscribe_past_end(&self) -> bool {
        self.subscribe_past_end
    }
}

struct TestSinkInner {
    messages: Vec<OutboundMessage>,
    capacity: Option<usize>,
}

/// A sink that collects outbound messages in memory.
///
/// `try_write` honours the configured capacity; `write` always appends
/// (a suspended test would otherwise deadlock against itself).
pub struct TestSink {
    inner: Arc<Mutex<TestSinkInner>>,
}

/// Shared view into a [`TestSink`]'s collected messages.
#[derive(Clone)]
pub struct SinkInspector {
    inner: Arc<Mutex<TestSinkInner>>,
}

impl TestSink {
    /// An unbounded collecting sink.
    pub fn collecting() -> (Self, SinkInspector) {
        Self::with_capacity(None)
    }

    /// A collecting sink whose `try_write` fails once `capacity`
    /// messages are buffered.
    pub fn with_capacity(capacity: Option<usize>) -> (Self, SinkInspector) {
        let inner = Arc::new(Mutex::new(TestSinkInner {
            messages: Vec::new(),
            capacity,
        }));
        (
            Self {
                inner: inner.clone(),
            },
            SinkInspector { inner },
        )
    }
}

#[async_trait]
impl Sink<OutboundMessage> for TestSink {
    fn try_write(&mut self, value: OutboundMessage) -> std::result::Result<(), OutboundMessage> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(capacity) = inner.capacity {
            if inner.messages.len() >= capacity {
                return Err(value);
            }
        }
        inner.messages.push(value);
        Ok(())
    }

    async fn write(&mut self, value: OutboundMessage) -> std::result::Result<(), SinkClosed> {
        self.inner.lock().unwrap().messages.push(value);
        Ok(())
    }

    async fn ready(&mut self) {}
}

impl SinkInspector {
    pub fn messages(&self) -> Vec<OutboundMessage> {
        self.inner.lock().unwrap().messages.clone()
    }

    /// Removes and returns everything collected so far, freeing capacity.
    pub fn take(&self) -> Vec<OutboundMessage> {
        std::mem::take(&mut self.inner.lock().unwrap().messages)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn set_capacity(&self, capacity: Option<usize>) {
        self.inner.lock().unwrap().capacity = capacity;
    }
}

/// Builds log records with fresh message ids.
pub struct RecordFactory {
    msg_ids: MsgIdGenerator,
}

impl RecordFactory {
    pub fn new() -> Self {
        Self {
            msg_ids: MsgIdGenerator::new(0xF00D),
        }
    }

    pub fn record(&mut self, topic: &TopicUuid, seqno: SequenceNumber, payload: &str) -> LogRecord {
        LogRecord {
            seqno,
            topic: topic.clone(),
            tenant: TenantId::GUEST,
            msg_id: self.msg_ids.next(),
            retention: Retention::OneDay,
            payload: Bytes::copy_from_slice(payload.as_bytes()),
        }
    }
}

impl Default for RecordFactory {
    fn default() -> Self {
        Self::new()
    }
}
