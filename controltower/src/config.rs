//! Configuration options for a control tower room.

use std::time::Duration;

/// Configuration for one room's topic tailer.
///
/// Every field has a production-ready default; construct with
/// `TailerConfig::default()` and override what you need.
#[derive(Debug, Clone)]
pub struct TailerConfig {
    /// Number of sequence numbers a topic may lag behind the log before
    /// its subscriptions are bumped forward with a benign gap.
    pub max_subscription_lag: u64,

    /// Size of the log reader pool. Multiple readers let the room serve
    /// subscriptions at different positions of one log without rewinding.
    pub readers_per_room: usize,

    /// Lower bound for the random delay before an open reader is
    /// restarted. Restarts give the storage layer a chance to rebalance
    /// and guard against wedged readers.
    pub min_reader_restart_duration: Duration,

    /// Upper bound for the reader restart delay.
    pub max_reader_restart_duration: Duration,

    /// Capacity of the bounded command queue between upstream threads and
    /// the room worker. Overflow surfaces as `NoBuffer` to the caller.
    pub storage_to_room_queue_size: usize,

    /// Byte budget for the data cache. Zero disables caching.
    pub cache_size: usize,

    /// Number of records per cache block.
    pub cache_block_size: usize,

    /// Bloom filter density for cache blocks, in bits per message.
    pub bloom_bits_per_msg: u32,

    /// Whether records in reserved (system) namespaces are cached.
    pub cache_data_from_system_namespaces: bool,

    /// Concurrency cap on outstanding `FindLatestSeqno` requests. Also
    /// sizes the response queue back into the room.
    pub max_find_time_requests: usize,

    /// Tick period for time-based processing (queued find-latest
    /// requests, reader restarts, parked cache drains).
    pub timer_interval: Duration,
}

impl Default for TailerConfig {
    fn default() -> Self {
        Self {
            max_subscription_lag: 10_000,
            readers_per_room: 2,
            min_reader_restart_duration: Duration::from_secs(30),
            max_reader_restart_duration: Duration::from_secs(60),
            storage_to_room_queue_size: 1000,
            cache_size: 0,
            cache_block_size: 1024,
            bloom_bits_per_msg: 10,
            cache_data_from_system_namespaces: false,
            max_find_time_requests: 100,
            timer_interval: Duration::from_millis(100),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_default_to_documented_values() {
        let config = TailerConfig::default();

        assert_eq!(config.max_subscription_lag, 10_000);
        assert_eq!(config.readers_per_room, 2);
        assert_eq!(config.storage_to_room_queue_size, 1000);
        assert_eq!(config.cache_size, 0);
        assert_eq!(config.cache_block_size, 1024);
        assert_eq!(config.bloom_bits_per_msg, 10);
        assert!(!config.cache_data_from_system_namespaces);
        assert_eq!(config.max_find_time_requests, 100);
        assert_eq!(config.timer_interval, Duration::from_millis(100));
        assert!(config.min_reader_restart_duration <= config.max_reader_restart_duration);
    }
}
