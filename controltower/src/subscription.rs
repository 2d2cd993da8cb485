//! Stream-indexed subscription lookup.

use std::collections::HashMap;

use crate::model::{CopilotSub, StreamId, SubscriptionId, TopicUuid};

/// Maps a stream and subscription id to the subscribed topic.
///
/// This is a lookup relation, never ownership: the authoritative
/// subscription state lives in the per-log
/// [`TopicManager`](crate::topic::TopicManager). Optimized for removing
/// all subscriptions of a stream at once (client disconnect).
#[derive(Debug, Default)]
pub struct SubscriptionMap {
    map: HashMap<StreamId, HashMap<SubscriptionId, TopicUuid>>,
}

impl SubscriptionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find(&self, id: CopilotSub) -> Option<&TopicUuid> {
        self.map.get(&id.stream)?.get(&id.sub)
    }

    /// Removes and returns the topic for one subscription.
    pub fn move_out(&mut self, id: CopilotSub) -> Option<TopicUuid> {
        let subs = self.map.get_mut(&id.stream)?;
        let topic = subs.remove(&id.sub);
        if subs.is_empty() {
            self.map.remove(&id.stream);
        }
        topic
    }

    pub fn insert(&mut self, id: CopilotSub, topic: TopicUuid) {
        self.map.entry(id.stream).or_default().insert(id.sub, topic);
    }

    /// Removes every subscription of a stream.
    pub fn remove_stream(&mut self, stream: StreamId) {
        self.map.remove(&stream);
    }

    /// Visits every subscription of a stream.
    pub fn visit_stream(&self, stream: StreamId, mut visitor: impl FnMut(SubscriptionId, &TopicUuid)) {
        if let Some(subs) = self.map.get(&stream) {
            for (sub_id, topic) in subs {
                visitor(*sub_id, topic);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
