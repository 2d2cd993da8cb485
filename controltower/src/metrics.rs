//! Prometheus metrics for one control tower room.

use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

/// Container for all room metrics.
///
/// Counters are cheap to clone; the tailer and cache share one instance
/// through an `Arc`.
pub struct Metrics {
    registry: Registry,

    /// Records received from the log store.
    pub log_records_received: Counter,

    /// Payload bytes received from the log store.
    pub log_records_received_payload_bytes: Counter,

    /// Records received behind the tail estimate.
    pub backlog_records_received: Counter,

    /// Records received at the tail estimate.
    pub tail_records_received: Counter,

    /// Records that matched at least one subscription.
    pub log_records_with_subscriptions: Counter,

    /// Records that matched no subscription.
    pub log_records_without_subscriptions: Counter,

    /// Records dropped for arriving out of sequence order.
    pub log_records_out_of_order: Counter,

    /// Subscriptions advanced past a silent range with a benign gap.
    pub bumped_subscriptions: Counter,

    /// Gap records received from the log store.
    pub gap_records_received: Counter,

    /// Gap records dropped for arriving out of sequence order.
    pub gap_records_out_of_order: Counter,

    /// Gaps that reached at least one subscription.
    pub gap_records_with_subscriptions: Counter,

    /// Gaps that reached no subscription.
    pub gap_records_without_subscriptions: Counter,

    /// Benign gaps received.
    pub benign_gaps_received: Counter,

    /// Retention and data-loss gaps received.
    pub malignant_gaps_received: Counter,

    /// AddSubscriber requests processed.
    pub add_subscriber_requests: Counter,

    /// AddSubscriber requests with start seqno 0 (subscribe at tail).
    pub add_subscriber_requests_at_0: Counter,

    /// Tail subscriptions served from a cached tail estimate.
    pub add_subscriber_requests_at_0_fast: Counter,

    /// Tail subscriptions that needed a FindLatestSeqno round trip.
    pub add_subscriber_requests_at_0_slow: Counter,

    /// Subscriptions that re-pointed an existing registration.
    pub updated_subscriptions: Counter,

    /// RemoveSubscriber requests processed.
    pub remove_subscriber_requests: Counter,

    /// FindLatestSeqno requests issued to the log store.
    pub find_latest_seqno_requests: Counter,

    /// Records delivered from the data cache.
    pub records_served_from_cache: Counter,

    /// Cache drains parked because the sink applied backpressure.
    pub cache_reader_backoff: Counter,

    /// Readers restarted by the rotation timer.
    pub reader_restarts: Counter,

    /// Readers merged into another reader on the same log.
    pub reader_merges: Counter,

    /// Readers that caught up from the cache after a log record.
    pub cache_reentries: Counter,

    /// Records read out of the cache.
    pub cache_hits: Counter,

    /// Cache lookups that found no applicable records.
    pub cache_misses: Counter,

    /// Records inserted into the cache.
    pub cache_inserts: Counter,

    /// Blocks skipped thanks to a bloom filter.
    pub bloom_hits: Counter,

    /// Blocks the bloom filter could not rule out.
    pub bloom_misses: Counter,

    /// Bloom filter positives with no matching record in the block.
    pub bloom_false_positives: Counter,

    /// Times the delivery sink pushed back on the record path.
    pub backpressure_applied: Counter,

    /// Times a blocked delivery resumed.
    pub backpressure_lifted: Counter,

    /// Current cache usage in bytes.
    pub cache_usage_bytes: Gauge,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

macro_rules! register_counter {
    ($registry:expr, $name:literal, $help:literal) => {{
        let counter = Counter::default();
        $registry.register($name, $help, counter.clone());
        counter
    }};
}

impl Metrics {
    /// Create a new metrics registry with all metrics registered.
    pub fn new() -> Self {
        let mut registry = Registry::with_prefix("tower_topic_tailer");

        let log_records_received = register_counter!(
            registry,
            "log_records_received",
            "Records received from the log store"
        );
        let log_records_received_payload_bytes = register_counter!(
            registry,
            "log_records_received_payload_bytes",
            "Payload bytes received from the log store"
        );
        let backlog_records_received = register_counter!(
            registry,
            "backlog_records_received",
            "Records received behind the tail estimate"
        );
        let tail_records_received = register_counter!(
            registry,
            "tail_records_received",
            "Records received at the tail estimate"
        );
        let log_records_with_subscriptions = register_counter!(
            registry,
            "log_records_with_subscriptions",
            "Records that matched at least one subscription"
        );
        let log_records_without_subscriptions = register_counter!(
            registry,
            "log_records_without_subscriptions",
            "Records that matched no subscription"
        );
        let log_records_out_of_order = register_counter!(
            registry,
            "log_records_out_of_order",
            "Records dropped for arriving out of order"
        );
        let bumped_subscriptions = register_counter!(
            registry,
            "bumped_subscriptions",
            "Subscriptions advanced past a silent range"
        );
        let gap_records_received = register_counter!(
            registry,
            "gap_records_received",
            "Gap records received from the log store"
        );
        let gap_records_out_of_order = register_counter!(
            registry,
            "gap_records_out_of_order",
            "Gap records dropped for arriving out of order"
        );
        let gap_records_with_subscriptions = register_counter!(
            registry,
            "gap_records_with_subscriptions",
            "Gaps that reached at least one subscription"
        );
        let gap_records_without_subscriptions = register_counter!(
            registry,
            "gap_records_without_subscriptions",
            "Gaps that reached no subscription"
        );
        let benign_gaps_received =
            register_counter!(registry, "benign_gaps_received", "Benign gaps received");
        let malignant_gaps_received = register_counter!(
            registry,
            "malignant_gaps_received",
            "Retention and data-loss gaps received"
        );
        let add_subscriber_requests = register_counter!(
            registry,
            "add_subscriber_requests",
            "AddSubscriber requests processed"
        );
        let add_subscriber_requests_at_0 = register_counter!(
            registry,
            "add_subscriber_requests_at_0",
            "AddSubscriber requests at seqno 0"
        );
        let add_subscriber_requests_at_0_fast = register_counter!(
            registry,
            "add_subscriber_requests_at_0_fast",
            "Tail subscriptions served from a cached estimate"
        );
        let add_subscriber_requests_at_0_slow = register_counter!(
            registry,
            "add_subscriber_requests_at_0_slow",
            "Tail subscriptions needing a FindLatestSeqno round trip"
        );
        let updated_subscriptions = register_counter!(
            registry,
            "updated_subscriptions",
            "Subscriptions that re-pointed an existing registration"
        );
        let remove_subscriber_requests = register_counter!(
            registry,
            "remove_subscriber_requests",
            "RemoveSubscriber requests processed"
        );
        let find_latest_seqno_requests = register_counter!(
            registry,
            "find_latest_seqno_requests",
            "FindLatestSeqno requests issued"
        );
        let records_served_from_cache = register_counter!(
            registry,
            "records_served_from_cache",
            "Records delivered from the data cache"
        );
        let cache_reader_backoff = register_counter!(
            registry,
            "cache_reader_backoff",
            "Cache drains parked on sink backpressure"
        );
        let reader_restarts = register_counter!(
            registry,
            "reader_restarts",
            "Readers restarted by the rotation timer"
        );
        let reader_merges =
            register_counter!(registry, "reader_merges", "Readers merged on the same log");
        let cache_reentries = register_counter!(
            registry,
            "cache_reentries",
            "Readers that caught up from the cache"
        );
        let cache_hits = register_counter!(registry, "cache_hits", "Records read out of the cache");
        let cache_misses = register_counter!(
            registry,
            "cache_misses",
            "Cache lookups that found no applicable records"
        );
        let cache_inserts =
            register_counter!(registry, "cache_inserts", "Records inserted into the cache");
        let bloom_hits = register_counter!(
            registry,
            "bloom_hits",
            "Blocks skipped thanks to a bloom filter"
        );
        let bloom_misses = register_counter!(
            registry,
            "bloom_misses",
            "Blocks the bloom filter could not rule out"
        );
        let bloom_false_positives = register_counter!(
            registry,
            "bloom_false_positives",
            "Bloom positives with no matching record"
        );
        let backpressure_applied = register_counter!(
            registry,
            "backpressure_applied",
            "Times the delivery sink pushed back"
        );
        let backpressure_lifted = register_counter!(
            registry,
            "backpressure_lifted",
            "Times a blocked delivery resumed"
        );

        let cache_usage_bytes = Gauge::default();
        registry.register(
            "cache_usage_bytes",
            "Current cache usage in bytes",
            cache_usage_bytes.clone(),
        );

        Self {
            registry,
            log_records_received,
            log_records_received_payload_bytes,
            backlog_records_received,
            tail_records_received,
            log_records_with_subscriptions,
            log_records_without_subscriptions,
            log_records_out_of_order,
            bumped_subscriptions,
            gap_records_received,
            gap_records_out_of_order,
            gap_records_with_subscriptions,
            gap_records_without_subscriptions,
            benign_gaps_received,
            malignant_gaps_received,
            add_subscriber_requests,
            add_subscriber_requests_at_0,
            add_subscriber_requests_at_0_fast,
            add_subscriber_requests_at_0_slow,
            updated_subscriptions,
            remove_subscriber_requests,
            find_latest_seqno_requests,
            records_served_from_cache,
            cache_reader_backoff,
            reader_restarts,
            reader_merges,
            cache_reentries,
            cache_hits,
            cache_misses,
            cache_inserts,
            bloom_hits,
            bloom_misses,
            bloom_false_positives,
            backpressure_applied,
            backpressure_lifted,
            cache_usage_bytes,
        }
    }

    /// Encode all metrics to Prometheus text format.
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        prometheus_client::encoding::text::encode(&mut buffer, &self.registry)
            .expect("encoding metrics should not fail");
        buffer
    }
}
