#![allow(dead_code)]

//! Shared fixture for driving a [`TopicTailer`] directly, with the log
//! store and the delivery sink replaced by test doubles.

use std::sync::Arc;

use common::clock::MockClock;
use controltower::test_utils::{MockLogStore, RecordFactory, SinkInspector, TestSink};
use controltower::{
    CopilotSub, FindLatestSeqnoResponse, GapKind, HostId, LogId, LogRouter, Message, Metrics,
    NamespaceId, ReaderId, Result, SequenceNumber, StreamId, SubscriptionId, TailerConfig,
    TopicTailer, TopicUuid,
};
use tokio::sync::mpsc;

/// Routes every topic to one log; scenarios exercise one log at a time.
pub struct FixedRouter(pub LogId);

impl LogRouter for FixedRouter {
    fn route(&self, _topic: &TopicUuid) -> Result<LogId> {
        Ok(self.0)
    }
}

pub struct Fixture {
    pub tailer: TopicTailer,
    pub latest_rx: mpsc::Receiver<FindLatestSeqnoResponse>,
    pub sink: SinkInspector,
    pub store: Arc<MockLogStore>,
    pub clock: Arc<MockClock>,
    pub metrics: Arc<Metrics>,
    pub factory: RecordFactory,
}

impl Fixture {
    pub fn new(log_id: LogId, config: TailerConfig) -> Self {
        let (sink, inspector) = TestSink::collecting();
        Self::build(MockLogStore::new(), sink, inspector, log_id, config)
    }

    pub fn with_sink_capacity(log_id: LogId, config: TailerConfig, capacity: usize) -> Self {
        let (sink, inspector) = TestSink::with_capacity(Some(capacity));
        Self::build(MockLogStore::new(), sink, inspector, log_id, config)
    }

    pub fn build(
        store: Arc<MockLogStore>,
        sink: TestSink,
        inspector: SinkInspector,
        log_id: LogId,
        config: TailerConfig,
    ) -> Self {
        let clock = Arc::new(MockClock::new());
        let metrics = Arc::new(Metrics::new());
        let (tailer, latest_rx) = TopicTailer::new(
            config,
            store.clone(),
            Arc::new(FixedRouter(log_id)),
            Box::new(sink),
            metrics.clone(),
            clock.clone(),
            HostId::new("test-tower", 0),
        );
        Self {
            tailer,
            latest_rx,
            sink: inspector,
            store,
            clock,
            metrics,
            factory: RecordFactory::new(),
        }
    }

    /// Feeds one record through the tailer as reader `reader_id`.
    pub async fn feed(
        &mut self,
        topic: &TopicUuid,
        seqno: SequenceNumber,
        log_id: LogId,
        reader_id: ReaderId,
    ) {
        let record = self.factory.record(topic, seqno, &format!("payload-{seqno}"));
        self.tailer
            .send_log_record(record, log_id, reader_id)
            .await
            .unwrap();
    }

    /// Forwards the next pending FindLatestSeqno response to the tailer,
    /// as the room worker would.
    pub async fn drive_find_latest(&mut self) {
        let response = self
            .latest_rx
            .try_recv()
            .expect("a FindLatestSeqno response should be pending");
        self.tailer
            .process_find_latest_response(response)
            .await
            .unwrap();
    }

    /// `(prev_seqno, seqno)` of every Deliver addressed to `id`, in
    /// delivery order.
    pub fn delivers_to(&self, id: CopilotSub) -> Vec<(SequenceNumber, SequenceNumber)> {
        self.sink
            .messages()
            .iter()
            .filter(|out| out.recipients.contains(&id))
            .filter_map(|out| match &out.message {
                Message::Deliver(deliver) => Some((deliver.prev_seqno, deliver.seqno)),
                _ => None,
            })
            .collect()
    }

    /// `(kind, from, to)` of every Gap addressed to `id`, in delivery
    /// order.
    pub fn gaps_to(&self, id: CopilotSub) -> Vec<(GapKind, SequenceNumber, SequenceNumber)> {
        self.sink
            .messages()
            .iter()
            .filter(|out| out.recipients.contains(&id))
            .filter_map(|out| match &out.message {
                Message::Gap(gap) => Some((gap.kind, gap.from, gap.to)),
                _ => None,
            })
            .collect()
    }

    /// Every message addressed to `id` as `(is_deliver, a, b)` where
    /// records map to `(prev, seqno)` and gaps to `(from, to)`.
    pub fn events_to(&self, id: CopilotSub) -> Vec<Event> {
        self.sink
            .messages()
            .iter()
            .filter(|out| out.recipients.contains(&id))
            .filter_map(|out| match &out.message {
                Message::Deliver(deliver) => {
                    Some(Event::Deliver(deliver.prev_seqno, deliver.seqno))
                }
                Message::Gap(gap) => Some(Event::Gap(gap.kind, gap.from, gap.to)),
                Message::Metadata(_) => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// `(prev_seqno, seqno)`
    Deliver(SequenceNumber, SequenceNumber),
    /// `(kind, from, to)`
    Gap(GapKind, SequenceNumber, SequenceNumber),
}

pub fn topic(name: &str) -> TopicUuid {
    TopicUuid::new(NamespaceId::GUEST, name.to_string())
}

pub fn sub(stream: u64, id: u64) -> CopilotSub {
    CopilotSub::new(StreamId(stream), SubscriptionId(id))
}
