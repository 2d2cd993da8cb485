//! Per-log subscriber index.

use std::collections::HashMap;

use crate::model::{CopilotSub, SequenceNumber, TopicUuid};

/// One subscription as tracked by the tailer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSubscription {
    pub id: CopilotSub,
    /// Next sequence number this subscription has not yet been sent.
    pub next_seqno: SequenceNumber,
    /// Position confirmed to the subscriber: the seqno of the last record
    /// or gap delivered, or the start seqno before anything was sent.
    /// Each delivery carries this as `prev_seqno`, keeping the
    /// subscriber's `(prev, seqno)` chain contiguous.
    pub prev_seqno: SequenceNumber,
    /// Set for subscriptions registered from a subscribe-at-tail. Their
    /// first record delivers with `prev_seqno = 0`, telling the client
    /// everything earlier is implicitly skipped.
    pub from_tail: bool,
}

/// Maps each topic of one log to its subscribers.
///
/// Subscriber lists are small in practice, so they are plain vectors
/// scanned linearly.
#[derive(Debug, Default)]
pub struct TopicManager {
    topics: HashMap<TopicUuid, Vec<TopicSubscription>>,
}

impl TopicManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or updates a subscription.
    ///
    /// Returns `true` if the subscription is new, `false` if an existing
    /// one was re-pointed at a different position.
    pub fn add_subscriber(
        &mut self,
        topic: &TopicUuid,
        id: CopilotSub,
        next_seqno: SequenceNumber,
        prev_seqno: SequenceNumber,
        from_tail: bool,
    ) -> bool {
        let subs = self.topics.entry(topic.clone()).or_default();
        for sub in subs.iter_mut() {
            if sub.id == id {
                sub.next_seqno = next_seqno;
                sub.prev_seqno = prev_seqno;
                sub.from_tail = from_tail;
                return false;
            }
        }
        subs.push(TopicSubscription {
            id,
            next_seqno,
            prev_seqno,
            from_tail,
        });
        true
    }

    /// Removes a subscription.
    ///
    /// Returns `true` if this was the last subscriber on the topic (the
    /// topic entry is dropped).
    pub fn remove_subscriber(&mut self, topic: &TopicUuid, id: CopilotSub) -> bool {
        let Some(subs) = self.topics.get_mut(topic) else {
            return false;
        };
        subs.retain(|sub| sub.id != id);
        if subs.is_empty() {
            self.topics.remove(topic);
            return true;
        }
        false
    }

    /// Visits every subscriber on `topic` whose `next_seqno` lies in
    /// `[lo, hi]`. The visitor may advance the subscription in place.
    pub fn visit_subscribers(
        &mut self,
        topic: &TopicUuid,
        lo: SequenceNumber,
        hi: SequenceNumber,
        mut visitor: impl FnMut(&mut TopicSubscription),
    ) {
        if let Some(subs) = self.topics.get_mut(topic) {
            for sub in subs.iter_mut() {
                if sub.next_seqno >= lo && sub.next_seqno <= hi {
                    visitor(sub);
                }
            }
        }
    }

    /// Visits every topic with at least one subscriber.
    ///
    /// Gap delivery collects topics through this before fanning out;
    /// the fan-out itself mutates the manager per topic, so the caller
    /// clones what it needs inside the visitor.
    pub fn visit_topics(&self, mut visitor: impl FnMut(&TopicUuid)) {
        for topic in self.topics.keys() {
            visitor(topic);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    pub fn num_subscribers(&self, topic: &TopicUuid) -> usize {
        self.topics.get(topic).map_or(0, Vec::len)
    }
}
