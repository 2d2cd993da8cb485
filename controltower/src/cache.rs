//! In-memory cache of recently tailed records.
//!
//! Records are grouped into fixed-size blocks keyed by
//! `(log_id, block start seqno)`, with the block start aligned to a
//! multiple of the block size. Whole blocks sit in an LRU chain bounded
//! by a byte budget; each block carries a bloom filter over the topics
//! appearing in it so a single-topic drain can skip blocks wholesale.
//!
//! Blocks are immutable once a slot is written: re-storing an existing
//! position is a no-op.

use std::sync::Arc;

use lru::LruCache;

use crate::bloom::BloomFilter;
use crate::metrics::Metrics;
use crate::model::{LogId, LogRecord, SequenceNumber};

/// Outcome of draining a subscription from the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheRead {
    /// No applicable cache contents.
    NoneRead,
    /// Everything available was delivered; subscribe at the returned
    /// position.
    ReadContinue,
    /// The sink applied backpressure; retry later from the returned
    /// position.
    ReadBackoff,
}

struct CacheBlock {
    records: Vec<Option<LogRecord>>,
    bloom: BloomFilter,
    bytes: usize,
}

impl CacheBlock {
    fn new(block_size: usize, bloom_bits_per_msg: u32) -> Self {
        let bloom = BloomFilter::new(block_size, bloom_bits_per_msg);
        let bytes = std::mem::size_of::<Self>()
            + block_size * std::mem::size_of::<Option<LogRecord>>()
            + bloom.byte_size();
        Self {
            records: vec![None; block_size],
            bloom,
            bytes,
        }
    }
}

/// Fixed-budget cache of tailed records with per-block bloom filters.
pub struct DataCache {
    capacity: usize,
    usage: usize,
    block_size: usize,
    bloom_bits_per_msg: u32,
    cache_system_namespaces: bool,
    blocks: LruCache<(LogId, SequenceNumber), CacheBlock>,
    metrics: Arc<Metrics>,
}

impl DataCache {
    pub fn new(
        capacity: usize,
        block_size: usize,
        bloom_bits_per_msg: u32,
        cache_system_namespaces: bool,
        metrics: Arc<Metrics>,
    ) -> Self {
        debug_assert!(block_size > 0);
        Self {
            capacity,
            usage: 0,
            block_size,
            bloom_bits_per_msg,
            cache_system_namespaces,
            blocks: LruCache::unbounded(),
            metrics,
        }
    }

    fn align_to_block_start(&self, seqno: SequenceNumber) -> SequenceNumber {
        seqno - seqno % self.block_size as u64
    }

    /// Stores one record. A zero capacity disables the cache entirely;
    /// reserved namespaces are stored only when configured.
    pub fn put(&mut self, log_id: LogId, record: LogRecord) {
        if self.capacity == 0 {
            return;
        }
        if record.topic.namespace.is_reserved() && !self.cache_system_namespaces {
            return;
        }

        let block_start = self.align_to_block_start(record.seqno);
        let offset = (record.seqno - block_start) as usize;
        let key = (log_id, block_start);
        if self.blocks.get(&key).is_none() {
            let block = CacheBlock::new(self.block_size, self.bloom_bits_per_msg);
            self.usage += block.bytes;
            self.blocks.push(key, block);
        }
        let block = self.blocks.get_mut(&key).expect("block just ensured");

        if block.records[offset].is_some() {
            debug_assert_eq!(
                block.records[offset].as_ref().map(|r| r.seqno),
                Some(record.seqno)
            );
            return;
        }
        let charge = record.total_size();
        block.bloom.insert(&record.topic);
        block.records[offset] = Some(record);
        block.bytes += charge;
        self.usage += charge;
        self.metrics.cache_inserts.inc();

        self.evict_to_budget();
    }

    /// Whether a record is cached at exactly this position.
    pub fn has_entry(&self, log_id: LogId, seqno: SequenceNumber) -> bool {
        if self.capacity == 0 {
            return false;
        }
        let block_start = self.align_to_block_start(seqno);
        let offset = (seqno - block_start) as usize;
        self.blocks
            .peek(&(log_id, block_start))
            .is_some_and(|block| block.records[offset].is_some())
    }

    /// Returns the cached record at exactly this position, if any.
    pub fn get(&mut self, log_id: LogId, seqno: SequenceNumber) -> Option<&LogRecord> {
        if self.capacity == 0 {
            return None;
        }
        let block_start = self.align_to_block_start(seqno);
        let offset = (seqno - block_start) as usize;
        self.blocks
            .get(&(log_id, block_start))
            .and_then(|block| block.records[offset].as_ref())
    }

    /// Visits contiguously cached records starting at `from`.
    ///
    /// `visit` returns `true` to continue; returning `false` stops the
    /// scan with that record counted as not consumed. When `topic_filter`
    /// is set, blocks whose bloom filter rules the topic out are skipped
    /// without visiting (the reader still advances past them, which is
    /// safe because bloom filters have no false negatives).
    ///
    /// Returns the first sequence number not found in the cache, or the
    /// position of the record the visitor rejected.
    pub fn visit(
        &mut self,
        log_id: LogId,
        from: SequenceNumber,
        topic_filter: Option<&crate::model::TopicUuid>,
        mut visit: impl FnMut(&LogRecord) -> bool,
    ) -> SequenceNumber {
        if self.capacity == 0 {
            return from;
        }
        let block_size = self.block_size;
        let mut pos = from;
        'blocks: loop {
            let block_start = self.align_to_block_start(pos);
            let Some(block) = self.blocks.get(&(log_id, block_start)) else {
                break;
            };

            let skip_block = topic_filter
                .map(|topic| !block.bloom.may_contain(topic))
                .unwrap_or(false);
            if skip_block {
                self.metrics.bloom_hits.inc();
            } else if topic_filter.is_some() {
                self.metrics.bloom_misses.inc();
            }

            let mut matched = 0u64;
            for offset in (pos - block_start) as usize..block_size {
                let Some(record) = &block.records[offset] else {
                    pos = block_start + offset as u64;
                    break 'blocks;
                };
                if !skip_block {
                    let relevant = topic_filter.map_or(true, |topic| record.topic == *topic);
                    if relevant {
                        matched += 1;
                        if !visit(record) {
                            pos = record.seqno;
                            break 'blocks;
                        }
                    }
                }
                pos = block_start + offset as u64 + 1;
            }
            if !skip_block && topic_filter.is_some() && matched == 0 {
                self.metrics.bloom_false_positives.inc();
            }
        }

        if pos > from {
            self.metrics.cache_hits.inc_by(pos - from);
        } else {
            self.metrics.cache_misses.inc();
        }
        pos
    }

    /// Drops everything.
    pub fn clear(&mut self) {
        self.blocks.clear();
        self.usage = 0;
        self.metrics.cache_usage_bytes.set(0);
    }

    /// Changes the byte budget, evicting as needed. Zero disables the
    /// cache.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
        if capacity == 0 {
            self.clear();
            return;
        }
        while self.usage > self.capacity && !self.blocks.is_empty() {
            if let Some((_, block)) = self.blocks.pop_lru() {
                self.usage -= block.bytes;
            }
        }
        self.metrics.cache_usage_bytes.set(self.usage as i64);
    }

    pub fn usage(&self) -> usize {
        self.usage
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn evict_to_budget(&mut self) {
        // the most recent block is never evicted, even when oversized
        while self.usage > self.capacity && self.blocks.len() > 1 {
            if let Some((_, block)) = self.blocks.pop_lru() {
                self.usage -= block.bytes;
            }
        }
        self.metrics.cache_usage_bytes.set(self.usage as i64);
    }
}
