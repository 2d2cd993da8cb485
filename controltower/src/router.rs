//! Topic to log routing.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::error::{Error, Result};
use crate::model::{LogId, TopicUuid};

/// Maps topics onto logs.
///
/// Implementations must be pure and immutable after construction: the
/// same topic always routes to the same log, from any thread.
pub trait LogRouter: Send + Sync {
    fn route(&self, topic: &TopicUuid) -> Result<LogId>;
}

/// Routes by hashing the topic identity over a fixed log range.
#[derive(Debug, Clone)]
pub struct HashLogRouter {
    num_logs: u64,
}

impl HashLogRouter {
    pub fn new(num_logs: u64) -> Self {
        debug_assert!(num_logs > 0, "log range must not be empty");
        Self { num_logs }
    }
}

impl LogRouter for HashLogRouter {
    fn route(&self, topic: &TopicUuid) -> Result<LogId> {
        if self.num_logs == 0 {
            return Err(Error::Internal("log range is empty".to_string()));
        }
        let mut hasher = DefaultHasher::new();
        topic.hash(&mut hasher);
        Ok(LogId(1 + hasher.finish() % self.num_logs))
    }
}
