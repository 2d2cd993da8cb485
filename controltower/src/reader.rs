//! Per-reader log state machine.
//!
//! A [`LogReader`] owns one cursor per open log: where the cursor started,
//! the last position consumed, a tail estimate, and the per-topic history
//! needed to compute delivery ranges. A room holds a small pool of real
//! readers plus one *virtual* reader that keeps subscription state for
//! logs no real reader has capacity for yet.
//!
//! The per-log topic map is ordered by recency of update: the topic at
//! the LRU end has gone longest without a record, which makes it the
//! candidate for lag bumping without scanning every topic.

use std::collections::HashMap;
use std::sync::Arc;

use lru::LruCache;

use crate::error::{Error, Result};
use crate::model::{LogId, ReaderId, SequenceNumber, TopicUuid};
use crate::storage::LogStore;

/// Cost of accepting a subscription that would force a rewind. Rewinds
/// re-deliver data to every other subscription on the reader, so they are
/// only taken when no other reader can host the subscription.
pub const SUBSCRIPTION_COST_REWIND: u64 = u64::MAX;

/// Cost of opening a log on a reader that is not reading it. Opening
/// talks to the log store, so a reader slightly behind the requested
/// position is preferred over an idle one.
pub const SUBSCRIPTION_COST_START: u64 = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
struct TopicState {
    next_seqno: SequenceNumber,
}

/// State for one open log on one reader.
pub(crate) struct LogState {
    /// Position at which the reader opened, last reseeked, or last
    /// flushed. Per-topic history below this point does not exist.
    start_seqno: SequenceNumber,
    /// Last record or gap position consumed. Records must arrive at
    /// exactly `last_read + 1`.
    last_read: SequenceNumber,
    /// Lower-bound estimate of the next seqno to be written; 0 when
    /// unknown. Monotonically non-decreasing while the log stays open.
    tail_seqno: SequenceNumber,
    /// Whether the underlying log stream is currently open. Paused
    /// readers keep their state but consume nothing.
    is_reading: bool,
    /// Per-topic history, ordered by recency of update (MRU end holds
    /// the most recently advanced topic).
    topics: LruCache<TopicUuid, TopicState>,
}

impl LogState {
    pub(crate) fn is_reading(&self) -> bool {
        self.is_reading
    }

    fn new(seqno: SequenceNumber) -> Self {
        Self {
            start_seqno: seqno,
            last_read: seqno - 1,
            tail_seqno: 0,
            is_reading: false,
            topics: LruCache::unbounded(),
        }
    }

    /// Minimum `next_seqno` across all topics; the position to open the
    /// log at when this state is adopted by a real reader.
    pub(crate) fn min_next_seqno(&self) -> SequenceNumber {
        self.topics
            .iter()
            .map(|(_, state)| state.next_seqno)
            .min()
            .unwrap_or(self.last_read + 1)
    }
}

/// Encapsulates the state needed for one reader of logs.
pub struct LogReader {
    /// `None` for the virtual pending reader.
    store: Option<Arc<dyn LogStore>>,
    reader_id: ReaderId,
    max_subscription_lag: u64,
    log_state: HashMap<LogId, LogState>,
}

impl LogReader {
    pub fn new(
        store: Option<Arc<dyn LogStore>>,
        reader_id: ReaderId,
        max_subscription_lag: u64,
    ) -> Self {
        Self {
            store,
            reader_id,
            max_subscription_lag,
            log_state: HashMap::new(),
        }
    }

    pub fn reader_id(&self) -> ReaderId {
        self.reader_id
    }

    /// A virtual reader keeps topic subscription state without an actual
    /// log stream behind it.
    pub fn is_virtual(&self) -> bool {
        self.store.is_none()
    }

    pub fn is_log_open(&self, log_id: LogId) -> bool {
        self.log_state.contains_key(&log_id)
    }

    /// Whether the underlying stream is consuming the log (open and not
    /// paused).
    pub fn is_reading(&self, log_id: LogId) -> bool {
        self.log_state
            .get(&log_id)
            .is_some_and(|state| state.is_reading)
    }

    /// Next expected sequence number for a log, or 0 if the log is not
    /// open.
    pub fn next_seqno_hint(&self, log_id: LogId) -> SequenceNumber {
        self.log_state
            .get(&log_id)
            .map_or(0, |state| state.last_read + 1)
    }

    pub fn last_read(&self, log_id: LogId) -> Option<SequenceNumber> {
        self.log_state.get(&log_id).map(|state| state.last_read)
    }

    pub fn tail_seqno(&self, log_id: LogId) -> SequenceNumber {
        self.log_state.get(&log_id).map_or(0, |state| state.tail_seqno)
    }

    pub fn open_logs(&self) -> Vec<LogId> {
        self.log_state.keys().copied().collect()
    }

    /// Registers a subscription for `topic` and positions the log stream
    /// so `seqno` will be read.
    ///
    /// The first call for a log opens the stream. Later calls are no-ops
    /// unless `seqno` lies at or before `last_read`, in which case the
    /// stream reseeks backward; a reseek below `start_seqno` also flushes
    /// all other topic history, since promises made about positions the
    /// reader never covered from `seqno` cannot be honoured.
    ///
    /// Returns `true` when this call opened the log.
    pub fn start_reading(
        &mut self,
        topic: &TopicUuid,
        log_id: LogId,
        seqno: SequenceNumber,
    ) -> Result<bool> {
        debug_assert!(seqno > 0, "seqno 0 is reserved");
        let first_open = !self.log_state.contains_key(&log_id);
        let state = self
            .log_state
            .entry(log_id)
            .or_insert_with(|| LogState::new(seqno));

        let mut reseek;
        if let Some(topic_state) = state.topics.peek_mut(topic) {
            reseek = seqno < topic_state.next_seqno;
            topic_state.next_seqno = topic_state.next_seqno.min(seqno);
            if reseek {
                // position dropped, so this topic is now the most stale
                state.topics.demote(topic);
            }
        } else {
            state
                .topics
                .push(topic.clone(), TopicState { next_seqno: seqno });
            state.topics.demote(topic);
            reseek = true;
        }

        if !first_open && reseek {
            // no reseek needed if the stream has not reached seqno yet
            reseek = seqno <= state.last_read;
        }

        if reseek {
            if first_open {
                tracing::info!(
                    "{}Reader({}) now reading {} from {} for {}",
                    if self.store.is_none() { "Virtual" } else { "" },
                    self.reader_id,
                    log_id,
                    seqno,
                    topic
                );
            } else {
                tracing::info!(
                    "{}Reader({}) rewinding {} from {} to {} for {}",
                    if self.store.is_none() { "Virtual" } else { "" },
                    self.reader_id,
                    log_id,
                    state.last_read + 1,
                    seqno,
                    topic
                );
                if seqno < state.start_seqno && self.store.is_some() {
                    // rewound below everything this reader has covered;
                    // per-topic history can no longer be honoured
                    let own_state = TopicState { next_seqno: seqno };
                    state.topics.clear();
                    state.topics.push(topic.clone(), own_state);
                }
            }
            state.start_seqno = seqno;
            Self::open_log_stream(&self.store, self.reader_id, log_id, state, seqno, first_open)?;
        }
        Ok(first_open)
    }

    /// Forgets the topic entirely. When it was the last topic on the log
    /// the stream is closed and the whole `LogState` (tail estimate
    /// included) is dropped; returns `true` in that case.
    pub fn stop_reading(&mut self, topic: &TopicUuid, log_id: LogId) -> Result<bool> {
        let Some(state) = self.log_state.get_mut(&log_id) else {
            return Ok(false);
        };
        if state.topics.pop(topic).is_none() {
            return Ok(false);
        }
        tracing::info!(
            "No more subscribers on {} for {} {}Reader({})",
            topic,
            log_id,
            if self.store.is_none() { "Virtual" } else { "" },
            self.reader_id
        );
        if state.topics.is_empty() {
            let was_reading = state.is_reading;
            self.log_state.remove(&log_id);
            if was_reading {
                if let Some(store) = &self.store {
                    store.stop_reading(log_id, self.reader_id)?;
                }
            }
            return Ok(true);
        }
        Ok(false)
    }

    /// Stops consuming a log without discarding any state. Idempotent.
    pub fn pause_reading(&mut self, log_id: LogId) -> Result<()> {
        debug_assert!(!self.is_virtual());
        let Some(state) = self.log_state.get_mut(&log_id) else {
            return Err(Error::NotFound);
        };
        if state.is_reading {
            state.is_reading = false;
            if let Some(store) = &self.store {
                store.stop_reading(log_id, self.reader_id)?;
            }
        }
        Ok(())
    }

    /// Re-issues the open at the current position, resuming a paused
    /// reader or nudging the storage layer to rebalance a live one.
    pub fn restart_reading(&mut self, log_id: LogId) -> Result<()> {
        debug_assert!(!self.is_virtual());
        let Some(state) = self.log_state.get_mut(&log_id) else {
            return Err(Error::NotFound);
        };
        state.is_reading = true;
        if let Some(store) = &self.store {
            store.start_reading(log_id, state.last_read + 1, self.reader_id, false)?;
        }
        Ok(())
    }

    /// Consumes one record, enforcing strict ordering.
    ///
    /// Returns the previous position known for the record's topic (0 when
    /// the reader knows nothing about the topic) and whether the record
    /// sits at the tail estimate.
    pub fn process_record(
        &mut self,
        log_id: LogId,
        seqno: SequenceNumber,
        topic: &TopicUuid,
    ) -> Result<(SequenceNumber, bool)> {
        let Some(state) = self.log_state.get_mut(&log_id) else {
            return Err(Error::NotFound);
        };
        if seqno != state.last_read + 1 {
            return Err(Error::NotFound);
        }
        state.last_read = seqno;

        let mut is_tail = false;
        if state.tail_seqno > 0 && state.tail_seqno <= seqno {
            is_tail = true;
            state.tail_seqno = seqno + 1;
        }

        let mut known = false;
        let prev_seqno = match state.topics.peek_mut(topic) {
            Some(topic_state) => {
                known = true;
                let prev = topic_state.next_seqno;
                topic_state.next_seqno = seqno + 1;
                prev
            }
            None => 0,
        };
        if known {
            state.topics.promote(topic);
        }
        Ok((prev_seqno, is_tail))
    }

    /// Checks that a gap starts exactly where the stream left off.
    pub fn validate_gap(&self, log_id: LogId, from: SequenceNumber) -> Result<()> {
        let Some(state) = self.log_state.get(&log_id) else {
            return Err(Error::NotFound);
        };
        if from != state.last_read + 1 {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    /// Consumes a gap for one topic; the caller is expected to have run
    /// [`validate_gap`](Self::validate_gap) first. Returns the previous
    /// position known for the topic, or 0.
    pub fn process_gap(
        &mut self,
        log_id: LogId,
        topic: &TopicUuid,
        to: SequenceNumber,
    ) -> SequenceNumber {
        let Some(state) = self.log_state.get_mut(&log_id) else {
            debug_assert!(false, "gap for unopened log should have been validated");
            return 0;
        };
        let mut known = false;
        let prev_seqno = match state.topics.peek_mut(topic) {
            Some(topic_state) => {
                known = true;
                let prev = topic_state.next_seqno;
                topic_state.next_seqno = to + 1;
                prev
            }
            None => 0,
        };
        if known {
            state.topics.promote(topic);
        }
        prev_seqno
    }

    /// Advances past a benign gap without touching topic history.
    pub fn process_benign_gap(&mut self, log_id: LogId, _from: SequenceNumber, to: SequenceNumber) {
        if let Some(state) = self.log_state.get_mut(&log_id) {
            state.last_read = to;
        }
    }

    /// Resets the log to start at `seqno` and clears all topic history.
    ///
    /// Used on malignant gaps: the reader can no longer claim to know
    /// per-topic positions on the far side of lost data.
    pub fn flush_history(&mut self, log_id: LogId, seqno: SequenceNumber) {
        if let Some(state) = self.log_state.get_mut(&log_id) {
            state.start_seqno = seqno;
            state.last_read = seqno - 1;
            state.topics.clear();
        }
    }

    /// Raises the tail estimate. Called after a `FindLatestSeqno`
    /// response; the estimate never decreases.
    pub fn suggest_tail_seqno(&mut self, log_id: LogId, seqno: SequenceNumber) {
        if let Some(state) = self.log_state.get_mut(&log_id) {
            state.tail_seqno = state.tail_seqno.max(state.last_read + 1).max(seqno);
        }
    }

    /// Advances the tail estimate past a gap, if one exists.
    pub fn advance_tail_on_gap(&mut self, log_id: LogId, to: SequenceNumber) {
        if let Some(state) = self.log_state.get_mut(&log_id) {
            if state.tail_seqno > 0 && state.tail_seqno <= to {
                state.tail_seqno = to + 1;
            }
        }
    }

    /// Bumps topics whose position lags more than `max_subscription_lag`
    /// behind `current_seqno`.
    ///
    /// Topics are examined from the stale end of the recency order, so
    /// the walk stops at the first topic that is not lagging. `on_bump`
    /// receives each bumped topic with its old position; the topic is
    /// advanced to `current_seqno + 1` and becomes the most recent.
    pub fn bump_lagging_subscriptions(
        &mut self,
        log_id: LogId,
        current_seqno: SequenceNumber,
        mut on_bump: impl FnMut(&TopicUuid, SequenceNumber),
    ) {
        let Some(state) = self.log_state.get_mut(&log_id) else {
            return;
        };
        loop {
            let Some((topic, topic_state)) = state.topics.peek_lru() else {
                break;
            };
            let old_next = topic_state.next_seqno;
            if old_next.saturating_add(self.max_subscription_lag) >= current_seqno {
                break;
            }
            let topic = topic.clone();
            tracing::debug!(
                "Bumping {} from {} to {} on {}",
                topic,
                old_next,
                current_seqno,
                log_id
            );
            if let Some(topic_state) = state.topics.peek_mut(&topic) {
                topic_state.next_seqno = current_seqno + 1;
            }
            state.topics.promote(&topic);
            on_bump(&topic, old_next);
        }
    }

    /// Cost of accepting a new subscription at `(log_id, seqno)`; lower
    /// is better.
    pub fn subscription_cost(
        &self,
        topic: &TopicUuid,
        log_id: LogId,
        seqno: SequenceNumber,
    ) -> u64 {
        match self.log_state.get(&log_id) {
            Some(state) => {
                if state.last_read < seqno {
                    // cost is the distance until the stream reaches seqno
                    return seqno - state.last_read;
                }
                match state.topics.peek(topic) {
                    // past the position with no history for the topic
                    None => SUBSCRIPTION_COST_REWIND,
                    Some(topic_state) => {
                        if seqno < topic_state.next_seqno {
                            SUBSCRIPTION_COST_REWIND
                        } else {
                            0
                        }
                    }
                }
            }
            None => SUBSCRIPTION_COST_START,
        }
    }

    /// Removes and returns the whole state for a log, leaving the stream
    /// untouched. Used when merging readers.
    pub(crate) fn take_log_state(&mut self, log_id: LogId) -> Option<LogState> {
        self.log_state.remove(&log_id)
    }

    /// Absorbs topic history from another reader positioned at the same
    /// `last_read`; positions merge by taking the earlier one per topic.
    pub(crate) fn merge_log_state(&mut self, log_id: LogId, mut incoming: LogState) {
        let Some(state) = self.log_state.get_mut(&log_id) else {
            debug_assert!(false, "merge target must have the log open");
            return;
        };
        debug_assert_eq!(state.last_read, incoming.last_read);
        while let Some((topic, topic_state)) = incoming.topics.pop_lru() {
            match state.topics.peek_mut(&topic) {
                Some(existing) => {
                    existing.next_seqno = existing.next_seqno.min(topic_state.next_seqno);
                }
                None => {
                    state.topics.push(topic, topic_state);
                }
            }
        }
        state.start_seqno = state.start_seqno.min(incoming.start_seqno);
        state.tail_seqno = state.tail_seqno.max(incoming.tail_seqno);
    }

    /// Takes over subscription state parked on the virtual reader and
    /// opens the log at its earliest position.
    pub(crate) fn adopt_log_state(&mut self, log_id: LogId, mut state: LogState) -> Result<()> {
        debug_assert!(!self.is_virtual());
        debug_assert!(!self.is_log_open(log_id));
        let seqno = state.min_next_seqno();
        state.start_seqno = seqno;
        state.last_read = seqno - 1;
        state.is_reading = false;
        Self::open_log_stream(&self.store, self.reader_id, log_id, &mut state, seqno, true)?;
        self.log_state.insert(log_id, state);
        Ok(())
    }

    fn open_log_stream(
        store: &Option<Arc<dyn LogStore>>,
        reader_id: ReaderId,
        log_id: LogId,
        state: &mut LogState,
        seqno: SequenceNumber,
        first_open: bool,
    ) -> Result<()> {
        if state.last_read != seqno - 1 || !state.is_reading {
            state.last_read = seqno - 1;
            state.is_reading = true;
            if let Some(store) = store {
                store.start_reading(log_id, seqno, reader_id, first_open)?;
            }
        }
        Ok(())
    }

    /// Human-readable state for one log.
    pub fn log_info(&self, log_id: LogId) -> String {
        match self.log_state.get(&log_id) {
            Some(state) => format!(
                "{}.reader[{}].last_read: {}\n{}.reader[{}].num_topics: {}\n",
                log_id,
                self.reader_id,
                state.last_read,
                log_id,
                self.reader_id,
                state.topics.len()
            ),
            None => format!("{}.reader[{}] not currently reading\n", log_id, self.reader_id),
        }
    }

    /// Human-readable state for every open log.
    pub fn all_logs_info(&self) -> String {
        let mut result = String::new();
        for log_id in self.log_state.keys() {
            result.push_str(&self.log_info(*log_id));
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NamespaceId;

    fn topic(name: &str) -> TopicUuid {
        TopicUuid::new(NamespaceId::GUEST, name.to_string())
    }

    struct NullStore;

    impl LogStore for NullStore {
        fn start_reading(
            &self,
            _log_id: LogId,
            _seqno: SequenceNumber,
            _reader_id: ReaderId,
            _first_open: bool,
        ) -> Result<()> {
            Ok(())
        }

        fn stop_reading(&self, _log_id: LogId, _reader_id: ReaderId) -> Result<()> {
            Ok(())
        }

        fn find_latest_seqno(&self, _log_id: LogId, _callback: crate::storage::FindLatestCallback) {}

        fn can_subscribe_past_end(&self) -> bool {
            true
        }
    }

    fn reader() -> LogReader {
        // virtual readers exercise all state transitions minus storage
        LogReader::new(None, 0, 10)
    }

    fn real_reader() -> LogReader {
        LogReader::new(Some(Arc::new(NullStore)), 0, 10)
    }

    const LOG: LogId = LogId(1);

    #[test]
    fn should_reject_out_of_order_record() {
        let mut reader = reader();
        reader.start_reading(&topic("t"), LOG, 5).unwrap();

        assert!(reader.process_record(LOG, 5, &topic("t")).is_ok());
        assert_eq!(
            reader.process_record(LOG, 7, &topic("t")),
            Err(Error::NotFound)
        );
        // state unchanged by the rejected record
        assert_eq!(reader.next_seqno_hint(LOG), 6);
    }

    #[test]
    fn should_reject_record_for_unopened_log() {
        let mut reader = reader();

        assert_eq!(
            reader.process_record(LOG, 1, &topic("t")),
            Err(Error::NotFound)
        );
    }

    #[test]
    fn should_track_previous_seqno_per_topic() {
        let mut reader = reader();
        reader.start_reading(&topic("t"), LOG, 5).unwrap();

        let (prev, _) = reader.process_record(LOG, 5, &topic("t")).unwrap();
        assert_eq!(prev, 5);

        let (prev, _) = reader.process_record(LOG, 6, &topic("other")).unwrap();
        assert_eq!(prev, 0, "unknown topic has no history");

        let (prev, _) = reader.process_record(LOG, 7, &topic("t")).unwrap();
        assert_eq!(prev, 6);
    }

    #[test]
    fn should_mark_tail_records_and_keep_estimate_monotonic() {
        let mut reader = reader();
        reader.start_reading(&topic("t"), LOG, 5).unwrap();
        reader.suggest_tail_seqno(LOG, 7);

        let (_, is_tail) = reader.process_record(LOG, 5, &topic("t")).unwrap();
        assert!(!is_tail);
        let (_, is_tail) = reader.process_record(LOG, 6, &topic("t")).unwrap();
        assert!(!is_tail);
        let (_, is_tail) = reader.process_record(LOG, 7, &topic("t")).unwrap();
        assert!(is_tail);
        assert_eq!(reader.tail_seqno(LOG), 8);

        // suggesting a lower estimate never decreases it
        reader.suggest_tail_seqno(LOG, 2);
        assert_eq!(reader.tail_seqno(LOG), 8);
    }

    #[test]
    fn should_bump_only_lagging_topics() {
        let mut reader = reader();
        reader.start_reading(&topic("stale"), LOG, 5).unwrap();
        reader.start_reading(&topic("fresh"), LOG, 5).unwrap();

        // records only on "fresh"
        for seqno in 5..=30 {
            reader.process_record(LOG, seqno, &topic("fresh")).unwrap();
        }

        let mut bumped = Vec::new();
        reader.bump_lagging_subscriptions(LOG, 30, |t, old| bumped.push((t.clone(), old)));

        // "stale" is 25 behind with lag 10; "fresh" is current
        assert_eq!(bumped, vec![(topic("stale"), 5)]);

        // a second pass finds nothing
        let mut bumped = Vec::new();
        reader.bump_lagging_subscriptions(LOG, 30, |t, old| bumped.push((t.clone(), old)));
        assert!(bumped.is_empty());
    }

    #[test]
    fn should_never_bump_within_lag_threshold() {
        let mut reader = reader();
        reader.start_reading(&topic("t"), LOG, 5).unwrap();

        let mut bumped = Vec::new();
        reader.bump_lagging_subscriptions(LOG, 15, |t, old| bumped.push((t.clone(), old)));

        // 5 + 10 >= 15, not eligible
        assert!(bumped.is_empty());
    }

    #[test]
    fn should_keep_most_stale_topic_at_lru_end() {
        let mut reader = reader();
        reader.start_reading(&topic("a"), LOG, 5).unwrap();
        reader.start_reading(&topic("b"), LOG, 5).unwrap();

        // "a" advances, "b" stays
        reader.process_record(LOG, 5, &topic("a")).unwrap();

        let mut bumped = Vec::new();
        reader.bump_lagging_subscriptions(LOG, 100, |t, old| bumped.push((t.clone(), old)));

        // "b" (still at 5) is bumped before "a" (at 6)
        assert_eq!(bumped[0], (topic("b"), 5));
        assert_eq!(bumped[1], (topic("a"), 6));
    }

    #[test]
    fn should_flush_history_on_malignant_gap() {
        let mut reader = reader();
        reader.start_reading(&topic("t"), LOG, 10).unwrap();
        reader.process_record(LOG, 10, &topic("t")).unwrap();

        reader.flush_history(LOG, 21);

        assert_eq!(reader.next_seqno_hint(LOG), 21);
        let (prev, _) = reader.process_record(LOG, 21, &topic("t")).unwrap();
        assert_eq!(prev, 0, "history is gone after flush");
    }

    #[test]
    fn should_advance_past_benign_gap() {
        let mut reader = reader();
        reader.start_reading(&topic("t"), LOG, 10).unwrap();

        reader.process_benign_gap(LOG, 10, 19);

        assert_eq!(reader.next_seqno_hint(LOG), 20);
        // topic history survives a benign gap
        let (prev, _) = reader.process_record(LOG, 20, &topic("t")).unwrap();
        assert_eq!(prev, 10);
    }

    #[test]
    fn should_validate_gap_position() {
        let mut reader = reader();
        reader.start_reading(&topic("t"), LOG, 10).unwrap();

        assert!(reader.validate_gap(LOG, 10).is_ok());
        assert_eq!(reader.validate_gap(LOG, 12), Err(Error::NotFound));
        assert_eq!(reader.validate_gap(LogId(9), 10), Err(Error::NotFound));
    }

    #[test]
    fn should_flush_topic_history_on_rewind_below_start() {
        // reader covering [60, 100]
        let mut reader = real_reader();
        reader.start_reading(&topic("x"), LOG, 60).unwrap();
        for seqno in 60..=100 {
            reader.process_record(LOG, seqno, &topic("x")).unwrap();
        }

        // new subscription rewinds to 50, below start_seqno
        reader.start_reading(&topic("w"), LOG, 50).unwrap();

        assert_eq!(reader.next_seqno_hint(LOG), 50);
        let (prev, _) = reader.process_record(LOG, 50, &topic("w")).unwrap();
        assert_eq!(prev, 50);
        let (prev, _) = reader.process_record(LOG, 51, &topic("x")).unwrap();
        assert_eq!(prev, 0, "history for x was flushed by the deep rewind");
    }

    #[test]
    fn should_not_reseek_when_position_not_reached() {
        let mut reader = reader();
        reader.start_reading(&topic("a"), LOG, 10).unwrap();

        // subscription ahead of the stream does not move last_read
        reader.start_reading(&topic("b"), LOG, 50).unwrap();

        assert_eq!(reader.next_seqno_hint(LOG), 10);
    }

    #[test]
    fn should_close_log_when_last_topic_stops() {
        let mut reader = reader();
        reader.start_reading(&topic("a"), LOG, 10).unwrap();
        reader.start_reading(&topic("b"), LOG, 12).unwrap();

        assert!(!reader.stop_reading(&topic("a"), LOG).unwrap());
        assert!(reader.is_log_open(LOG));
        assert!(reader.stop_reading(&topic("b"), LOG).unwrap());
        assert!(!reader.is_log_open(LOG));
        // tail estimate does not survive the close
        assert_eq!(reader.tail_seqno(LOG), 0);
    }

    #[test]
    fn should_compute_subscription_cost() {
        let mut reader = reader();
        reader.start_reading(&topic("t"), LOG, 10).unwrap();
        for seqno in 10..=20 {
            reader.process_record(LOG, seqno, &topic("t")).unwrap();
        }

        // ahead of the stream: distance
        assert_eq!(reader.subscription_cost(&topic("t"), LOG, 25), 5);
        // behind the stream on a known topic: rewind
        assert_eq!(
            reader.subscription_cost(&topic("t"), LOG, 15),
            SUBSCRIPTION_COST_REWIND
        );
        // behind the stream, unknown topic: rewind
        assert_eq!(
            reader.subscription_cost(&topic("u"), LOG, 15),
            SUBSCRIPTION_COST_REWIND
        );
        // log not open: flat open cost
        assert_eq!(
            reader.subscription_cost(&topic("t"), LogId(9), 15),
            SUBSCRIPTION_COST_START
        );
    }

    #[test]
    fn should_merge_topic_history_at_matching_positions() {
        let mut src = reader();
        let mut dst = reader();
        src.start_reading(&topic("a"), LOG, 10).unwrap();
        dst.start_reading(&topic("a"), LOG, 12).unwrap();
        dst.start_reading(&topic("b"), LOG, 12).unwrap();

        // bring both to last_read == 14
        for seqno in 10..=14 {
            src.process_record(LOG, seqno, &topic("a")).unwrap();
        }
        for seqno in 12..=14 {
            dst.process_record(LOG, seqno, &topic("b")).unwrap();
        }

        let state = src.take_log_state(LOG).unwrap();
        dst.merge_log_state(LOG, state);

        assert!(!src.is_log_open(LOG));
        // positions merge by taking the earlier one per topic
        let (prev, _) = dst.process_record(LOG, 15, &topic("a")).unwrap();
        assert_eq!(prev, 12);
    }

    #[test]
    fn should_adopt_pending_state_at_earliest_position() {
        let mut pending = reader();
        pending.start_reading(&topic("a"), LOG, 30).unwrap();
        pending.start_reading(&topic("b"), LOG, 20).unwrap();

        let mut real = reader();
        let state = pending.take_log_state(LOG).unwrap();
        real.adopt_log_state(LOG, state).unwrap();

        assert_eq!(real.next_seqno_hint(LOG), 20);
        let (prev, _) = real.process_record(LOG, 20, &topic("b")).unwrap();
        assert_eq!(prev, 20);
    }
}
