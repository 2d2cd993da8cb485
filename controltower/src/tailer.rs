//! The topic tailer: one room's view of the log store.
//!
//! Maps an unbounded set of topics onto a fixed pool of log readers,
//! keeps per-topic delivery history so every subscription receives a
//! contiguous `(prev_seqno, seqno)` chain, fans records and gaps out to
//! subscribers, bumps subscriptions that fall too far behind, and serves
//! backlog from the in-memory [`DataCache`] whenever possible.
//!
//! Everything here runs on the room worker; public entry points assume
//! exclusive access (the [`Room`](crate::room::Room) provides it).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::SystemTime;

use common::clock::Clock;
use common::flow::{Flow, FlowControl, Sink};
use rand::Rng;
use tokio::sync::mpsc;

use crate::cache::{CacheRead, DataCache};
use crate::config::TailerConfig;
use crate::error::{Error, Result};
use crate::message::{HostId, Message, MessageDeliver, MessageGap};
use crate::metrics::Metrics;
use crate::model::{
    CopilotSub, GapKind, LogId, LogRecord, ReaderId, SequenceNumber, StreamId, TenantId, TopicUuid,
};
use crate::reader::LogReader;
use crate::router::LogRouter;
use crate::storage::LogStore;
use crate::subscription::SubscriptionMap;
use crate::topic::TopicManager;

/// One wire message addressed to a set of subscriptions, on its way to
/// the client I/O layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub message: Message,
    pub recipients: Vec<CopilotSub>,
}

/// Response to an asynchronous `FindLatestSeqno` request, routed back to
/// the room through a bounded queue.
#[derive(Debug)]
pub struct FindLatestSeqnoResponse {
    pub log_id: LogId,
    pub result: Result<SequenceNumber>,
}

/// Which reader hosts a new subscription.
enum ReaderSlot {
    Real(usize),
    Pending,
}

/// A subscription whose cache drain hit backpressure, parked for retry.
struct PendingSubscription {
    topic: TopicUuid,
    log_id: LogId,
    seqno: SequenceNumber,
    /// Position already confirmed to the subscriber, so the retry
    /// continues the `(prev, seqno)` chain instead of restarting it.
    prev_seqno: SequenceNumber,
    from_tail: bool,
}

/// Scheduled restart of one reader on one log.
struct RestartEvent {
    at: SystemTime,
    reader_idx: usize,
    log_id: LogId,
}

/// Outcome of draining a new subscription from the cache.
enum CacheDrain {
    /// Cache exhausted; attach a log reader at `attach_seqno`.
    Complete {
        attach_seqno: SequenceNumber,
        prev_seqno: SequenceNumber,
        still_from_tail: bool,
    },
    /// The sink pushed back; retry from `resume_seqno` later.
    Backoff {
        resume_seqno: SequenceNumber,
        prev_seqno: SequenceNumber,
    },
}

pub struct TopicTailer {
    config: TailerConfig,
    store: Arc<dyn LogStore>,
    router: Arc<dyn LogRouter>,
    sink: Box<dyn Sink<OutboundMessage>>,
    metrics: Arc<Metrics>,
    clock: Arc<dyn Clock>,
    origin: HostId,

    /// Each reader can read each log once; multiple readers exist so one
    /// log can be served at multiple positions.
    readers: Vec<LogReader>,

    /// Virtual reader keeping state for subscriptions no real reader can
    /// host without a rewind. Real readers adopt its logs as they free
    /// up.
    pending_reader: LogReader,

    /// Subscription index per log.
    topic_map: HashMap<LogId, TopicManager>,

    /// Last-known tail estimate per log, kept outside the readers so a
    /// reopened log does not start blind.
    tail_seqno_cached: HashMap<LogId, SequenceNumber>,

    cache: DataCache,
    stream_subscriptions: SubscriptionMap,
    flow_control: FlowControl,

    /// Subscriptions waiting on a FindLatestSeqno response, per log.
    pending_find_responses: HashMap<LogId, Vec<CopilotSub>>,

    /// FindLatestSeqno requests deferred by the concurrency cap.
    pending_find_requests: VecDeque<LogId>,

    latest_seqno_tx: mpsc::Sender<FindLatestSeqnoResponse>,

    /// Cache drains parked on sink backpressure, keyed by subscription.
    pending_cache_drains: HashMap<CopilotSub, PendingSubscription>,

    /// Readers paused mid cache catch-up, waiting for sink capacity.
    reentry_cache_readers: Vec<(LogId, usize)>,

    restart_events: Vec<RestartEvent>,
}

impl TopicTailer {
    /// Creates a tailer and the receiving end of its FindLatestSeqno
    /// response queue. The caller (normally the room worker) must feed
    /// received responses back through
    /// [`process_find_latest_response`](Self::process_find_latest_response).
    pub fn new(
        config: TailerConfig,
        store: Arc<dyn LogStore>,
        router: Arc<dyn LogRouter>,
        sink: Box<dyn Sink<OutboundMessage>>,
        metrics: Arc<Metrics>,
        clock: Arc<dyn Clock>,
        origin: HostId,
    ) -> (Self, mpsc::Receiver<FindLatestSeqnoResponse>) {
        let (latest_seqno_tx, latest_seqno_rx) =
            mpsc::channel(config.max_find_time_requests.max(1));
        let num_readers = config.readers_per_room.max(1);
        let readers = (0..num_readers)
            .map(|id| LogReader::new(Some(store.clone()), id, config.max_subscription_lag))
            .collect();
        let pending_reader = LogReader::new(None, num_readers, config.max_subscription_lag);
        let cache = DataCache::new(
            config.cache_size,
            config.cache_block_size,
            config.bloom_bits_per_msg,
            config.cache_data_from_system_namespaces,
            metrics.clone(),
        );
        let tailer = Self {
            config,
            store,
            router,
            sink,
            metrics,
            clock,
            origin,
            readers,
            pending_reader,
            topic_map: HashMap::new(),
            tail_seqno_cached: HashMap::new(),
            cache,
            stream_subscriptions: SubscriptionMap::new(),
            flow_control: FlowControl::default(),
            pending_find_responses: HashMap::new(),
            pending_find_requests: VecDeque::new(),
            latest_seqno_tx,
            pending_cache_drains: HashMap::new(),
            reentry_cache_readers: Vec::new(),
            restart_events: Vec::new(),
        };
        (tailer, latest_seqno_rx)
    }

    /// Subscribes `id` to `topic` starting at `start` (0 = tail).
    pub async fn add_subscriber(
        &mut self,
        topic: TopicUuid,
        start: SequenceNumber,
        id: CopilotSub,
    ) -> Result<()> {
        self.metrics.add_subscriber_requests.inc();
        if topic.topic.is_empty() {
            return Err(Error::InvalidArgument("empty topic".to_string()));
        }
        let log_id = self.router.route(&topic)?;

        if start == 0 {
            // Subscribing at the tail requires knowing where the tail
            // is. Use a cached estimate when one exists; otherwise ask
            // the log store and park the subscription until the answer
            // arrives.
            self.metrics.add_subscriber_requests_at_0.inc();
            let tail = self.tail_seqno_estimate(log_id);
            self.stream_subscriptions.insert(id, topic.clone());
            if tail != 0 {
                self.metrics.add_subscriber_requests_at_0_fast.inc();
                self.add_tail_subscriber(topic, id, log_id, tail).await?;
            } else {
                self.metrics.add_subscriber_requests_at_0_slow.inc();
                let in_flight = self.in_flight_find_requests();
                let waiters = self.pending_find_responses.entry(log_id).or_default();
                waiters.push(id);
                if waiters.len() > 1 {
                    tracing::debug!(
                        "Piggy-backing in-flight FindLatestSeqno on {} for {}",
                        log_id,
                        id
                    );
                } else if in_flight < self.config.max_find_time_requests {
                    self.send_find_latest_request(log_id);
                } else if !self.pending_find_requests.contains(&log_id) {
                    self.pending_find_requests.push_back(log_id);
                }
            }
        } else {
            self.stream_subscriptions.insert(id, topic.clone());
            self.process_pending_subscription(topic, id, log_id, start, start, false)
                .await?;
        }
        Ok(())
    }

    /// Removes one subscription.
    pub fn remove_subscriber(&mut self, id: CopilotSub) -> Result<()> {
        self.metrics.remove_subscriber_requests.inc();
        let Some(topic) = self.stream_subscriptions.move_out(id) else {
            tracing::warn!("Cannot remove unknown subscription {}", id);
            return Err(Error::NotFound);
        };
        let log_id = self.router.route(&topic)?;
        tracing::debug!("{} unsubscribed from {}", id, topic);
        self.remove_subscriber_internal(&topic, id, log_id)
    }

    /// Removes every subscription of a stream (client disconnect).
    pub fn remove_stream(&mut self, stream: StreamId) -> Result<()> {
        tracing::debug!("Stream({}) unsubscribed from all topics", stream.0);
        let mut subs = Vec::new();
        self.stream_subscriptions.visit_stream(stream, |sub_id, topic| {
            subs.push((CopilotSub::new(stream, sub_id), topic.clone()));
        });
        for (id, topic) in subs {
            let log_id = self.router.route(&topic)?;
            self.remove_subscriber_internal(&topic, id, log_id)?;
        }
        self.stream_subscriptions.remove_stream(stream);
        Ok(())
    }

    /// Consumes one record from the log store.
    pub async fn send_log_record(
        &mut self,
        record: LogRecord,
        log_id: LogId,
        reader_id: ReaderId,
    ) -> Result<()> {
        let Some(reader_idx) = self.reader_index(reader_id) else {
            tracing::warn!("Record on {} for unknown Reader({})", log_id, reader_id);
            return Err(Error::NotFound);
        };

        self.receive_log_record(&record, log_id, reader_idx).await?;
        self.cache.put(log_id, record);

        // If the next position is already cached, the reader can catch
        // up without the log store.
        let next = self.readers[reader_idx].next_seqno_hint(log_id);
        if next != 0 && self.cache.has_entry(log_id, next) {
            self.readers[reader_idx].pause_reading(log_id)?;
            self.metrics.cache_reentries.inc();
            self.send_cache_record(log_id, reader_idx).await?;
        } else {
            self.attempt_reader_merges(reader_idx, log_id)?;
        }
        Ok(())
    }

    /// Consumes one gap from the log store.
    pub async fn send_gap_record(
        &mut self,
        log_id: LogId,
        kind: GapKind,
        from: SequenceNumber,
        to: SequenceNumber,
        reader_id: ReaderId,
    ) -> Result<()> {
        let Some(reader_idx) = self.reader_index(reader_id) else {
            tracing::warn!("Gap on {} for unknown Reader({})", log_id, reader_id);
            return Err(Error::NotFound);
        };

        self.metrics.gap_records_received.inc();
        if self.readers[reader_idx].validate_gap(log_id, from).is_err() {
            self.metrics.gap_records_out_of_order.inc();
            tracing::warn!(
                "Reader({}) dropping out-of-order gap {}@[{}, {}]",
                reader_id,
                log_id,
                from,
                to
            );
            return Ok(());
        }

        // Per-topic gap messages for every subscribed topic. The topics
        // are collected up front: the fan-out below mutates subscription
        // state while it runs.
        let mut topics = Vec::new();
        if let Some(manager) = self.topic_map.get(&log_id) {
            manager.visit_topics(|topic| topics.push(topic.clone()));
        }
        for topic in topics {
            let prev = self.readers[reader_idx].process_gap(log_id, &topic, to);
            let groups = Self::collect_gap_groups(&mut self.topic_map, log_id, &topic, prev, to);
            if groups.is_empty() {
                self.metrics.gap_records_without_subscriptions.inc();
            } else {
                self.metrics.gap_records_with_subscriptions.inc();
                for (group_from, recipients) in groups {
                    let msg = self.gap_message(kind, group_from, to);
                    self.deliver(msg, recipients).await;
                }
            }
        }

        self.readers[reader_idx].advance_tail_on_gap(log_id, to);
        if let Some(tail) = self.tail_seqno_cached.get_mut(&log_id) {
            if *tail <= to {
                *tail = to + 1;
            }
        }

        if kind.is_malignant() {
            // Records were lost, so per-topic history on the far side of
            // the gap cannot be trusted.
            self.metrics.malignant_gaps_received.inc();
            self.readers[reader_idx].flush_history(log_id, to + 1);
        } else {
            self.metrics.benign_gaps_received.inc();
            self.readers[reader_idx].process_benign_gap(log_id, from, to);
        }

        self.attempt_reader_merges(reader_idx, log_id)?;
        Ok(())
    }

    /// Handles a FindLatestSeqno response routed back from the store.
    pub async fn process_find_latest_response(
        &mut self,
        response: FindLatestSeqnoResponse,
    ) -> Result<()> {
        let log_id = response.log_id;
        let tail = match response.result {
            Ok(seqno) => seqno.max(1),
            Err(err) => {
                tracing::warn!("Failed to find latest seqno in {}: {} (retrying)", log_id, err);
                self.send_find_latest_request(log_id);
                return Ok(());
            }
        };

        let waiters = self.pending_find_responses.remove(&log_id).unwrap_or_default();
        for id in waiters {
            // The subscriber may have unsubscribed while the request was
            // in flight; opening a reader for it would leak.
            match self.stream_subscriptions.find(id).cloned() {
                Some(topic) => self.add_tail_subscriber(topic, id, log_id, tail).await?,
                None => {
                    tracing::debug!("{} unsubscribed before FindLatestSeqno response arrived", id)
                }
            }
        }

        tracing::info!("Suggesting tail for {}@{}", log_id, tail);
        let entry = self.tail_seqno_cached.entry(log_id).or_insert(0);
        *entry = (*entry).max(tail);
        for reader in &mut self.readers {
            if reader.is_log_open(log_id) {
                reader.suggest_tail_seqno(log_id, tail);
            }
        }

        self.drain_pending_find_requests();
        Ok(())
    }

    /// Time-based processing: deferred find-latest requests, reader
    /// restarts, adoption of pending subscriptions, and retries of
    /// everything parked on backpressure.
    pub async fn tick(&mut self) -> Result<()> {
        self.drain_pending_find_requests();

        // Due reader restarts.
        let now = self.clock.now();
        let mut due = Vec::new();
        self.restart_events.retain(|event| {
            if event.at <= now {
                due.push((event.reader_idx, event.log_id));
                false
            } else {
                true
            }
        });
        for (reader_idx, log_id) in due {
            // Paused readers are owned by the cache re-entry path.
            if self.readers[reader_idx].is_reading(log_id) {
                self.metrics.reader_restarts.inc();
                tracing::info!(
                    "Restarting Reader({}) on {} at {}",
                    self.readers[reader_idx].reader_id(),
                    log_id,
                    self.readers[reader_idx].next_seqno_hint(log_id)
                );
                self.readers[reader_idx].restart_reading(log_id)?;
                self.schedule_restart(reader_idx, log_id);
            } else if self.readers[reader_idx].is_log_open(log_id) {
                self.schedule_restart(reader_idx, log_id);
            }
        }

        // Hand pending subscriptions to readers with a free slot.
        for log_id in self.pending_reader.open_logs() {
            let free = (0..self.readers.len()).find(|&idx| !self.readers[idx].is_log_open(log_id));
            if let Some(reader_idx) = free {
                let state = self
                    .pending_reader
                    .take_log_state(log_id)
                    .ok_or_else(|| Error::Internal("pending log state vanished".to_string()))?;
                self.readers[reader_idx].adopt_log_state(log_id, state)?;
                self.seed_reader_tail(reader_idx, log_id);
                self.schedule_restart(reader_idx, log_id);
            }
        }

        // Retry cache drains parked on backpressure.
        let parked: Vec<(CopilotSub, PendingSubscription)> =
            self.pending_cache_drains.drain().collect();
        for (id, pending) in parked {
            if self.stream_subscriptions.find(id).is_some() {
                self.process_pending_subscription(
                    pending.topic,
                    id,
                    pending.log_id,
                    pending.seqno,
                    pending.prev_seqno,
                    pending.from_tail,
                )
                .await?;
            }
        }

        // Retry readers parked mid cache catch-up.
        let reentry = std::mem::take(&mut self.reentry_cache_readers);
        for (log_id, reader_idx) in reentry {
            self.send_cache_record(log_id, reader_idx).await?;
        }
        Ok(())
    }

    /// Current tail estimate for a log, or 0 if unknown.
    pub fn tail_seqno_estimate(&self, log_id: LogId) -> SequenceNumber {
        self.tail_seqno_cached.get(&log_id).copied().unwrap_or(0)
    }

    /// Human-readable information about one log.
    pub fn log_info(&self, log_id: LogId) -> String {
        let mut result = format!("{}.tail_seqno_cached: {}\n", log_id, self.tail_seqno_estimate(log_id));
        for reader in &self.readers {
            result.push_str(&reader.log_info(log_id));
        }
        result
    }

    /// Human-readable information about every log with a tail estimate
    /// or an open reader.
    pub fn all_logs_info(&self) -> String {
        let mut result = String::new();
        for (log_id, tail) in &self.tail_seqno_cached {
            result.push_str(&format!("{}.tail_seqno_cached: {}\n", log_id, tail));
        }
        for reader in &self.readers {
            result.push_str(&reader.all_logs_info());
        }
        result
    }

    pub fn clear_cache(&mut self) {
        tracing::info!("Clearing data cache");
        self.cache.clear();
    }

    pub fn set_cache_capacity(&mut self, capacity: usize) {
        tracing::info!("Setting data cache capacity to {}", capacity);
        self.cache.set_capacity(capacity);
    }

    pub fn cache_usage(&self) -> usize {
        self.cache.usage()
    }

    pub fn cache_capacity(&self) -> usize {
        self.cache.capacity()
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn backpressure_applied(&self) -> u64 {
        self.flow_control.backpressure_applied()
    }

    pub fn backpressure_lifted(&self) -> u64 {
        self.flow_control.backpressure_lifted()
    }

    fn reader_index(&self, reader_id: ReaderId) -> Option<usize> {
        self.readers
            .iter()
            .position(|reader| reader.reader_id() == reader_id)
    }

    /// Writes one message downstream. Returns `false` when the sink
    /// pushed back and the write had to wait for capacity; the message
    /// itself is never lost.
    async fn deliver(&mut self, message: Message, recipients: Vec<CopilotSub>) -> bool {
        let out = OutboundMessage {
            message,
            recipients,
        };
        match self.sink.try_write(out) {
            Ok(()) => true,
            Err(out) => {
                self.metrics.backpressure_applied.inc();
                self.flow_control.on_blocked("topic_tailer");
                if self.sink.write(out).await.is_err() {
                    tracing::warn!("Delivery sink closed; message dropped");
                }
                self.metrics.backpressure_lifted.inc();
                self.flow_control.on_unblocked();
                false
            }
        }
    }

    fn deliver_message(&self, record: &LogRecord, prev_seqno: SequenceNumber) -> Message {
        Message::Deliver(MessageDeliver {
            tenant: record.tenant,
            origin: self.origin.clone(),
            namespace: record.topic.namespace,
            topic: record.topic.topic.clone(),
            prev_seqno,
            seqno: record.seqno,
            msg_id: record.msg_id,
            retention: record.retention,
            payload: record.payload.clone(),
        })
    }

    fn gap_message(&self, kind: GapKind, from: SequenceNumber, to: SequenceNumber) -> Message {
        Message::Gap(MessageGap {
            tenant: TenantId::GUEST,
            origin: self.origin.clone(),
            kind,
            from,
            to,
        })
    }

    /// Visits subscribers of `topic` whose position falls in
    /// `[lo, seqno]`, advances them past the record, and groups the
    /// recipients by the `prev_seqno` value their delivery must carry.
    /// Subscriptions registered from a tail subscribe get `prev = 0` on
    /// their first record.
    fn collect_record_groups(
        topic_map: &mut HashMap<LogId, TopicManager>,
        log_id: LogId,
        topic: &TopicUuid,
        lo: SequenceNumber,
        seqno: SequenceNumber,
    ) -> Vec<(SequenceNumber, Vec<CopilotSub>)> {
        let mut groups: Vec<(SequenceNumber, Vec<CopilotSub>)> = Vec::new();
        if let Some(manager) = topic_map.get_mut(&log_id) {
            manager.visit_subscribers(topic, lo, seqno, |sub| {
                let prev = if sub.from_tail { 0 } else { sub.prev_seqno };
                match groups.iter_mut().find(|(p, _)| *p == prev) {
                    Some((_, recipients)) => recipients.push(sub.id),
                    None => groups.push((prev, vec![sub.id])),
                }
                sub.prev_seqno = seqno;
                sub.next_seqno = seqno + 1;
                sub.from_tail = false;
            });
        }
        groups
    }

    /// Gap counterpart of [`collect_record_groups`]: advances matching
    /// subscribers to `to + 1` and groups them by their confirmed
    /// position, which becomes the gap's `from`.
    fn collect_gap_groups(
        topic_map: &mut HashMap<LogId, TopicManager>,
        log_id: LogId,
        topic: &TopicUuid,
        lo: SequenceNumber,
        to: SequenceNumber,
    ) -> Vec<(SequenceNumber, Vec<CopilotSub>)> {
        let mut groups: Vec<(SequenceNumber, Vec<CopilotSub>)> = Vec::new();
        if let Some(manager) = topic_map.get_mut(&log_id) {
            manager.visit_subscribers(topic, lo, to, |sub| {
                let from = sub.prev_seqno;
                match groups.iter_mut().find(|(p, _)| *p == from) {
                    Some((_, recipients)) => recipients.push(sub.id),
                    None => groups.push((from, vec![sub.id])),
                }
                sub.prev_seqno = to;
                sub.next_seqno = to + 1;
            });
        }
        groups
    }

    /// Updates reader and subscription state for one in-order record and
    /// fans it out.
    async fn receive_log_record(
        &mut self,
        record: &LogRecord,
        log_id: LogId,
        reader_idx: usize,
    ) -> Result<()> {
        self.metrics.log_records_received.inc();
        self.metrics
            .log_records_received_payload_bytes
            .inc_by(record.payload.len() as u64);

        let seqno = record.seqno;
        let (prev_seqno, is_tail) =
            match self.readers[reader_idx].process_record(log_id, seqno, &record.topic) {
                Ok(result) => result,
                Err(_) => {
                    self.metrics.log_records_out_of_order.inc();
                    tracing::warn!(
                        "Reader({}) dropping out-of-order record {}@{}",
                        self.readers[reader_idx].reader_id(),
                        log_id,
                        seqno
                    );
                    return Ok(());
                }
            };

        if is_tail {
            self.metrics.tail_records_received.inc();
            let entry = self.tail_seqno_cached.entry(log_id).or_insert(0);
            *entry = (*entry).max(seqno + 1);
        } else {
            self.metrics.backlog_records_received.inc();
        }

        // lo = 0 covers topics the reader has no history for (after a
        // flush); subscribers then receive the record with prev = 0.
        let groups =
            Self::collect_record_groups(&mut self.topic_map, log_id, &record.topic, prev_seqno, seqno);
        if groups.is_empty() {
            self.metrics.log_records_without_subscriptions.inc();
        } else {
            self.metrics.log_records_with_subscriptions.inc();
            for (prev, recipients) in groups {
                let msg = self.deliver_message(record, prev);
                self.deliver(msg, recipients).await;
            }
        }

        // Bump topics that have gone silent for too long, so their
        // subscribers learn the log has moved on. The gap covers up to
        // the position before the current record (which is on another
        // topic); the subscriptions resume past the current position.
        let mut bumps = Vec::new();
        self.readers[reader_idx].bump_lagging_subscriptions(log_id, seqno, |topic, old_next| {
            bumps.push((topic.clone(), old_next));
        });
        for (bump_topic, old_next) in bumps {
            let mut groups: Vec<(SequenceNumber, Vec<CopilotSub>)> = Vec::new();
            if let Some(manager) = self.topic_map.get_mut(&log_id) {
                manager.visit_subscribers(&bump_topic, old_next, seqno, |sub| {
                    let from = sub.prev_seqno;
                    match groups.iter_mut().find(|(p, _)| *p == from) {
                        Some((_, recipients)) => recipients.push(sub.id),
                        None => groups.push((from, vec![sub.id])),
                    }
                    sub.prev_seqno = seqno - 1;
                    sub.next_seqno = seqno + 1;
                });
            }
            for (from, recipients) in groups {
                self.metrics
                    .bumped_subscriptions
                    .inc_by(recipients.len() as u64);
                let msg = self.gap_message(GapKind::Benign, from, seqno - 1);
                self.deliver(msg, recipients).await;
            }
        }
        Ok(())
    }

    /// Catches a paused reader up from the cache. Resumes (or merges)
    /// the reader unless the sink pushed back, in which case the reader
    /// stays paused and is parked for retry.
    async fn send_cache_record(&mut self, log_id: LogId, reader_idx: usize) -> Result<()> {
        if !self.readers[reader_idx].is_log_open(log_id) {
            return Ok(());
        }
        match self.advance_reader_from_cache(log_id, reader_idx).await? {
            CacheRead::ReadContinue | CacheRead::NoneRead => {
                if !self.attempt_reader_merges(reader_idx, log_id)? {
                    tracing::info!(
                        "Restarting @{} after reading from {} cache",
                        self.readers[reader_idx].next_seqno_hint(log_id),
                        log_id
                    );
                    self.readers[reader_idx].restart_reading(log_id)?;
                }
            }
            CacheRead::ReadBackoff => {
                tracing::info!(
                    "Backing off @{} after reading from {} cache",
                    self.readers[reader_idx].next_seqno_hint(log_id),
                    log_id
                );
                self.readers[reader_idx].pause_reading(log_id)?;
                self.reentry_cache_readers.push((log_id, reader_idx));
            }
        }
        Ok(())
    }

    async fn advance_reader_from_cache(
        &mut self,
        log_id: LogId,
        reader_idx: usize,
    ) -> Result<CacheRead> {
        if self.cache.capacity() == 0 {
            return Ok(CacheRead::NoneRead);
        }
        let start = self.readers[reader_idx].next_seqno_hint(log_id);
        if start == 0 {
            return Ok(CacheRead::NoneRead);
        }

        let mut pos = start;
        let mut backoff = false;
        while let Some(record) = self.cache.get(log_id, pos).cloned() {
            let (prev_seqno, is_tail) =
                self.readers[reader_idx].process_record(log_id, record.seqno, &record.topic)?;
            if is_tail {
                let entry = self.tail_seqno_cached.entry(log_id).or_insert(0);
                *entry = (*entry).max(record.seqno + 1);
            }

            let groups = Self::collect_record_groups(
                &mut self.topic_map,
                log_id,
                &record.topic,
                prev_seqno,
                record.seqno,
            );
            let mut delivered = false;
            for (prev, recipients) in groups {
                let msg = self.deliver_message(&record, prev);
                if !self.deliver(msg, recipients).await {
                    backoff = true;
                }
                delivered = true;
            }
            if delivered {
                self.metrics.records_served_from_cache.inc();
            }
            pos += 1;
            if backoff {
                break;
            }
        }

        if pos == start {
            Ok(CacheRead::NoneRead)
        } else if backoff {
            Ok(CacheRead::ReadBackoff)
        } else {
            Ok(CacheRead::ReadContinue)
        }
    }

    /// Delivers cached backlog to a single new subscription before a
    /// reader is attached.
    async fn deliver_from_cache(
        &mut self,
        topic: &TopicUuid,
        id: CopilotSub,
        log_id: LogId,
        start: SequenceNumber,
        prev_start: SequenceNumber,
        from_tail: bool,
    ) -> CacheDrain {
        if self.cache.capacity() == 0 {
            return CacheDrain::Complete {
                attach_seqno: start,
                prev_seqno: prev_start,
                still_from_tail: from_tail,
            };
        }

        let mut flow = Flow::new();
        let mut last_delivered: Option<SequenceNumber> = None;
        let mut prev_chain = if from_tail { 0 } else { prev_start };
        let next = {
            let cache = &mut self.cache;
            let sink = &mut self.sink;
            let origin = &self.origin;
            let metrics = self.metrics.clone();
            cache.visit(log_id, start, Some(topic), |record| {
                let message = Message::Deliver(MessageDeliver {
                    tenant: record.tenant,
                    origin: origin.clone(),
                    namespace: record.topic.namespace,
                    topic: record.topic.topic.clone(),
                    prev_seqno: prev_chain,
                    seqno: record.seqno,
                    msg_id: record.msg_id,
                    retention: record.retention,
                    payload: record.payload.clone(),
                });
                let out = OutboundMessage {
                    message,
                    recipients: vec![id],
                };
                if flow.write(&mut **sink, out) {
                    metrics.records_served_from_cache.inc();
                    prev_chain = record.seqno;
                    last_delivered = Some(record.seqno);
                    true
                } else {
                    false
                }
            })
        };

        if flow.write_has_failed() {
            return CacheDrain::Backoff {
                resume_seqno: next,
                prev_seqno: prev_chain,
            };
        }

        // If the cache extends past the last record on this topic, close
        // the distance with a benign gap so the subscription can attach
        // at the cache edge.
        let delivered_edge = last_delivered.map_or(start, |seqno| seqno + 1);
        let mut prev_seqno = last_delivered.unwrap_or(prev_start);
        if next > delivered_edge {
            let gap_from = last_delivered.unwrap_or(prev_start);
            let msg = self.gap_message(GapKind::Benign, gap_from, next - 1);
            self.deliver(msg, vec![id]).await;
            prev_seqno = next - 1;
        }

        CacheDrain::Complete {
            attach_seqno: next,
            prev_seqno,
            still_from_tail: from_tail && last_delivered.is_none(),
        }
    }

    /// Finishes registration of a subscription: drains the cache, picks
    /// a reader, opens the log, and records the subscription.
    async fn process_pending_subscription(
        &mut self,
        topic: TopicUuid,
        id: CopilotSub,
        log_id: LogId,
        seqno: SequenceNumber,
        prev_start: SequenceNumber,
        from_tail: bool,
    ) -> Result<()> {
        debug_assert!(seqno != 0);
        match self
            .deliver_from_cache(&topic, id, log_id, seqno, prev_start, from_tail)
            .await
        {
            CacheDrain::Backoff {
                resume_seqno,
                prev_seqno,
            } => {
                self.metrics.cache_reader_backoff.inc();
                tracing::info!(
                    "Backpressure draining cache for {} on {} (will retry at {})",
                    id,
                    topic,
                    resume_seqno
                );
                self.pending_cache_drains.insert(
                    id,
                    PendingSubscription {
                        topic,
                        log_id,
                        seqno: resume_seqno,
                        prev_seqno,
                        from_tail,
                    },
                );
            }
            CacheDrain::Complete {
                attach_seqno,
                prev_seqno,
                still_from_tail,
            } => {
                match self.reader_for_new_subscription(&topic, log_id, attach_seqno) {
                    ReaderSlot::Real(reader_idx) => {
                        let first_open =
                            self.readers[reader_idx].start_reading(&topic, log_id, attach_seqno)?;
                        if first_open {
                            self.seed_reader_tail(reader_idx, log_id);
                            self.schedule_restart(reader_idx, log_id);
                        }
                    }
                    ReaderSlot::Pending => {
                        self.pending_reader
                            .start_reading(&topic, log_id, attach_seqno)?;
                    }
                }
                let was_new = self.topic_map.entry(log_id).or_default().add_subscriber(
                    &topic,
                    id,
                    attach_seqno,
                    prev_seqno,
                    still_from_tail,
                );
                if !was_new {
                    self.metrics.updated_subscriptions.inc();
                }
                tracing::debug!(
                    "{} subscribed for {}@{} ({})",
                    id,
                    topic,
                    attach_seqno,
                    if was_new { "new" } else { "update" }
                );
            }
        }
        Ok(())
    }

    /// Teaches a tail subscriber the current tail with a benign gap and
    /// registers it there.
    async fn add_tail_subscriber(
        &mut self,
        topic: TopicUuid,
        id: CopilotSub,
        log_id: LogId,
        tail: SequenceNumber,
    ) -> Result<()> {
        tracing::debug!("Sending gap on {}@0-{} {}", topic, tail - 1, log_id);
        let msg = self.gap_message(GapKind::Benign, 0, tail - 1);
        self.deliver(msg, vec![id]).await;

        let seqno = if self.store.can_subscribe_past_end() {
            tail
        } else {
            tail.saturating_sub(1).max(1)
        };
        self.process_pending_subscription(topic, id, log_id, seqno, seqno, true)
            .await
    }

    fn remove_subscriber_internal(
        &mut self,
        topic: &TopicUuid,
        id: CopilotSub,
        log_id: LogId,
    ) -> Result<()> {
        self.pending_cache_drains.remove(&id);
        let Some(manager) = self.topic_map.get_mut(&log_id) else {
            return Ok(());
        };
        if manager.remove_subscriber(topic, id) {
            // Last subscriber on the topic: every reader forgets it, and
            // readers whose last topic left close the log.
            let mut log_closed = true;
            for reader_idx in 0..self.readers.len() {
                if self.readers[reader_idx].stop_reading(topic, log_id)? {
                    self.cancel_restarts(reader_idx, log_id);
                }
                log_closed = log_closed && !self.readers[reader_idx].is_log_open(log_id);
            }
            self.pending_reader.stop_reading(topic, log_id)?;
            log_closed = log_closed && !self.pending_reader.is_log_open(log_id);

            if log_closed {
                // No reader keeps the estimate fresh any more.
                self.tail_seqno_cached.remove(&log_id);
                self.reentry_cache_readers.retain(|(l, _)| *l != log_id);
            }
            if self.topic_map.get(&log_id).is_some_and(TopicManager::is_empty) {
                self.topic_map.remove(&log_id);
            }
        }
        Ok(())
    }

    /// Picks the cheapest reader for a new subscription, or the pending
    /// reader when every candidate would have to rewind.
    fn reader_for_new_subscription(
        &self,
        topic: &TopicUuid,
        log_id: LogId,
        seqno: SequenceNumber,
    ) -> ReaderSlot {
        // With a single reader there is nothing to choose; rewinds are
        // taken immediately.
        if self.readers.len() == 1 {
            return ReaderSlot::Real(0);
        }
        let mut best = None;
        let mut best_cost = crate::reader::SUBSCRIPTION_COST_REWIND;
        for (idx, reader) in self.readers.iter().enumerate() {
            let cost = reader.subscription_cost(topic, log_id, seqno);
            if cost < best_cost {
                best_cost = cost;
                best = Some(idx);
            }
        }
        match best {
            Some(idx) => ReaderSlot::Real(idx),
            None => ReaderSlot::Pending,
        }
    }

    /// Merges `src` into another reader at the same position on
    /// `log_id`, freeing `src` to adopt pending subscriptions.
    fn attempt_reader_merges(&mut self, src_idx: usize, log_id: LogId) -> Result<bool> {
        let Some(src_last) = self.readers[src_idx].last_read(log_id) else {
            return Ok(false);
        };
        let dst_idx = (0..self.readers.len())
            .find(|&idx| idx != src_idx && self.readers[idx].last_read(log_id) == Some(src_last));
        let Some(dst_idx) = dst_idx else {
            return Ok(false);
        };

        tracing::info!(
            "Merging Reader({}) into Reader({}) on {}@{}",
            self.readers[src_idx].reader_id(),
            self.readers[dst_idx].reader_id(),
            log_id,
            src_last + 1
        );
        let state = self.readers[src_idx]
            .take_log_state(log_id)
            .ok_or_else(|| Error::Internal("merge source state vanished".to_string()))?;
        if state.is_reading() {
            self.store
                .stop_reading(log_id, self.readers[src_idx].reader_id())?;
        }
        self.readers[dst_idx].merge_log_state(log_id, state);
        self.metrics.reader_merges.inc();
        self.cancel_restarts(src_idx, log_id);

        // The source reader is free on this log now; let it take over
        // parked subscriptions.
        if self.pending_reader.is_log_open(log_id) {
            let pending_state = self
                .pending_reader
                .take_log_state(log_id)
                .ok_or_else(|| Error::Internal("pending log state vanished".to_string()))?;
            self.readers[src_idx].adopt_log_state(log_id, pending_state)?;
            self.seed_reader_tail(src_idx, log_id);
            self.schedule_restart(src_idx, log_id);
        }
        Ok(true)
    }

    fn seed_reader_tail(&mut self, reader_idx: usize, log_id: LogId) {
        if let Some(tail) = self.tail_seqno_cached.get(&log_id) {
            self.readers[reader_idx].suggest_tail_seqno(log_id, *tail);
        }
    }

    fn schedule_restart(&mut self, reader_idx: usize, log_id: LogId) {
        let min = self.config.min_reader_restart_duration;
        let max = self.config.max_reader_restart_duration.max(min);
        let delay = if max > min {
            min + (max - min).mul_f64(rand::thread_rng().gen_range(0.0..1.0))
        } else {
            min
        };
        self.restart_events.push(RestartEvent {
            at: self.clock.now() + delay,
            reader_idx,
            log_id,
        });
    }

    fn cancel_restarts(&mut self, reader_idx: usize, log_id: LogId) {
        self.restart_events
            .retain(|event| !(event.reader_idx == reader_idx && event.log_id == log_id));
    }

    fn in_flight_find_requests(&self) -> usize {
        self.pending_find_responses
            .len()
            .saturating_sub(self.pending_find_requests.len())
    }

    fn send_find_latest_request(&mut self, log_id: LogId) {
        self.metrics.find_latest_seqno_requests.inc();
        let tx = self.latest_seqno_tx.clone();
        self.store.find_latest_seqno(
            log_id,
            Box::new(move |result| {
                // Queue capacity equals the in-flight cap, so this only
                // fails if the room is gone.
                if tx.try_send(FindLatestSeqnoResponse { log_id, result }).is_err() {
                    tracing::error!("Failed to queue FindLatestSeqno response for {}", log_id);
                }
            }),
        );
        tracing::info!("Sent FindLatestSeqno request on {}", log_id);
    }

    fn drain_pending_find_requests(&mut self) {
        while !self.pending_find_requests.is_empty()
            && self.in_flight_find_requests() < self.config.max_find_time_requests
        {
            if let Some(log_id) = self.pending_find_requests.pop_front() {
                self.send_find_latest_request(log_id);
            }
        }
    }
}
