//! Subscription lifecycle, reader pooling, and backpressure behavior.

mod support;

use std::sync::Arc;

use common::clock::MockClock;
use support::{sub, topic, Event, Fixture};
use controltower::test_utils::{MockLogStore, StoreCall, TestSink};
use controltower::{
    Error, GapKind, HostId, LogId, LogRouter, Metrics, NamespaceId, Result, StreamId,
    TailerConfig, TopicTailer, TopicUuid,
};

const LOG: LogId = LogId(1);

fn config() -> TailerConfig {
    TailerConfig::default()
}

#[tokio::test]
async fn should_stop_reading_exactly_once_when_last_subscriber_leaves() {
    // given: two subscribers on the same topic
    let mut fx = Fixture::new(LOG, config());
    let t = topic("T");
    let a = sub(1, 1);
    let b = sub(2, 1);
    fx.tailer.add_subscriber(t.clone(), 5, a).await.unwrap();
    fx.tailer.add_subscriber(t.clone(), 8, b).await.unwrap();

    // when / then: the log closes only with the last subscriber
    fx.tailer.remove_subscriber(a).unwrap();
    assert_eq!(fx.store.stop_calls(LOG), 0);

    fx.tailer.remove_subscriber(b).unwrap();
    assert_eq!(fx.store.stop_calls(LOG), 1);

    // removing again reports the subscription as unknown
    assert_eq!(fx.tailer.remove_subscriber(b), Err(Error::NotFound));
}

#[tokio::test]
async fn should_leave_no_state_behind_after_unsubscribe() {
    let mut fx = Fixture::new(LOG, config());
    let t = topic("T");
    let a = sub(1, 1);
    fx.tailer.add_subscriber(t.clone(), 5, a).await.unwrap();
    fx.tailer.remove_subscriber(a).unwrap();

    // a record for the now-closed log is dropped, not delivered
    fx.feed(&t, 5, LOG, 0).await;
    assert!(fx.sink.is_empty());

    // re-subscribing starts from a clean slate
    fx.tailer.add_subscriber(t.clone(), 5, a).await.unwrap();
    fx.feed(&t, 5, LOG, 0).await;
    assert_eq!(fx.delivers_to(a), vec![(5, 5)]);
    assert_eq!(fx.store.stop_calls(LOG), 1);
    assert_eq!(fx.store.start_calls(LOG), 2);
}

#[tokio::test]
async fn should_remove_every_subscription_of_a_stream() {
    let mut fx = Fixture::new(LOG, config());
    let t1 = topic("T1");
    let t2 = topic("T2");
    let s1 = sub(9, 1);
    let s2 = sub(9, 2);
    let other = sub(10, 1);
    fx.tailer.add_subscriber(t1.clone(), 5, s1).await.unwrap();
    fx.tailer.add_subscriber(t2.clone(), 5, s2).await.unwrap();
    fx.tailer.add_subscriber(t1.clone(), 5, other).await.unwrap();

    fx.tailer.remove_stream(StreamId(9)).unwrap();

    // the other stream keeps the log open
    assert_eq!(fx.store.stop_calls(LOG), 0);
    fx.feed(&t1, 5, LOG, 0).await;
    assert_eq!(fx.delivers_to(other), vec![(5, 5)]);
    assert_eq!(fx.delivers_to(s1), vec![]);
    assert_eq!(fx.delivers_to(s2), vec![]);
}

#[tokio::test]
async fn should_repoint_existing_subscription() {
    let mut fx = Fixture::new(
        LOG,
        TailerConfig {
            readers_per_room: 1,
            ..config()
        },
    );
    let t = topic("T");
    let a = sub(3, 1);
    fx.tailer.add_subscriber(t.clone(), 10, a).await.unwrap();
    for seqno in 10..=12 {
        fx.feed(&t, seqno, LOG, 0).await;
    }

    // when: the same subscription re-subscribes further back
    fx.tailer.add_subscriber(t.clone(), 5, a).await.unwrap();

    // then: the reader rewound and the chain restarts at 5
    assert_eq!(fx.store.last_start_seqno(LOG), Some(5));
    for seqno in 5..=6 {
        fx.feed(&t, seqno, LOG, 0).await;
    }
    let deliveries = fx.delivers_to(a);
    assert_eq!(deliveries[deliveries.len() - 2..], [(5, 5), (5, 6)]);

    let encoded = fx.metrics.encode();
    assert!(encoded.contains("updated_subscriptions_total 1"));
}

#[tokio::test]
async fn should_merge_readers_at_the_same_position() {
    // given: subscriber A served by reader 0 up to seqno 10
    let mut fx = Fixture::new(LOG, config());
    let t = topic("T");
    let a = sub(4, 1);
    let b = sub(5, 1);
    fx.tailer.add_subscriber(t.clone(), 5, a).await.unwrap();
    for seqno in 5..=10 {
        fx.feed(&t, seqno, LOG, 0).await;
    }

    // B at 8 would rewind reader 0, so reader 1 picks it up
    fx.tailer.add_subscriber(t.clone(), 8, b).await.unwrap();
    assert!(fx
        .store
        .calls()
        .contains(&StoreCall::Start {
            log_id: LOG,
            seqno: 8,
            reader_id: 1,
            first_open: true
        }));

    // when: reader 1 catches up to reader 0's position
    for seqno in 8..=10 {
        fx.feed(&t, seqno, LOG, 1).await;
    }

    // then: reader 1 merged into reader 0 and stopped
    assert!(fx
        .store
        .calls()
        .contains(&StoreCall::Stop {
            log_id: LOG,
            reader_id: 1
        }));
    assert!(fx.metrics.encode().contains("reader_merges_total 1"));

    // one record on reader 0 now reaches both subscribers
    fx.feed(&t, 11, LOG, 0).await;
    assert!(fx.delivers_to(a).contains(&(10, 11)));
    assert!(fx.delivers_to(b).contains(&(10, 11)));
}

#[tokio::test]
async fn should_park_subscription_when_all_readers_would_rewind() {
    // given: both readers committed to positions past the request
    let mut fx = Fixture::new(LOG, config());
    let t1 = topic("T1");
    let t2 = topic("T2");
    let t3 = topic("T3");
    fx.tailer.add_subscriber(t1.clone(), 10, sub(6, 1)).await.unwrap();
    fx.feed(&t1, 10, LOG, 0).await;
    // far enough ahead that opening reader 1 is cheaper than waiting
    fx.tailer.add_subscriber(t2.clone(), 5000, sub(7, 1)).await.unwrap();
    assert_eq!(fx.store.start_calls(LOG), 2);

    // when: a subscription arrives below both reader positions
    let c = sub(8, 1);
    fx.tailer.add_subscriber(t3.clone(), 5, c).await.unwrap();

    // then: no reader was opened for it
    assert_eq!(fx.store.start_calls(LOG), 2);

    // when reader 1 frees up, the parked subscription is adopted
    fx.tailer.remove_subscriber(sub(7, 1)).unwrap();
    fx.tailer.tick().await.unwrap();
    assert!(fx.store.calls().contains(&StoreCall::Start {
        log_id: LOG,
        seqno: 5,
        reader_id: 1,
        first_open: true
    }));

    fx.feed(&t3, 5, LOG, 1).await;
    assert_eq!(fx.delivers_to(c), vec![(5, 5)]);
}

#[tokio::test]
async fn should_park_cache_drain_on_backpressure_and_resume_on_tick() {
    // given: a warm cache and a sink with a single free slot
    let mut fx = Fixture::new(
        LOG,
        TailerConfig {
            cache_size: 1 << 20,
            cache_block_size: 16,
            ..config()
        },
    );
    let z = topic("Z");
    let filler = topic("filler");
    fx.tailer.add_subscriber(filler.clone(), 100, sub(9, 1)).await.unwrap();
    for seqno in 100..=105 {
        let rec_topic = if (101..=103).contains(&seqno) { &z } else { &filler };
        fx.feed(rec_topic, seqno, LOG, 0).await;
    }
    assert_eq!(fx.store.start_calls(LOG), 1);
    fx.sink.take();
    fx.sink.set_capacity(Some(1));

    // when: F drains the cache and hits the wall after one record
    let f = sub(10, 1);
    fx.tailer.add_subscriber(z.clone(), 100, f).await.unwrap();

    // then: one record made it out, the drain is parked
    assert_eq!(fx.delivers_to(f), vec![(100, 101)]);
    assert_eq!(fx.store.start_calls(LOG), 1, "no reader while parked");
    assert!(fx.metrics.encode().contains("cache_reader_backoff_total 1"));

    // when capacity returns, the tick finishes the drain
    fx.sink.take();
    fx.sink.set_capacity(None);
    fx.tailer.tick().await.unwrap();

    assert_eq!(
        fx.events_to(f),
        vec![
            Event::Deliver(101, 102),
            Event::Deliver(102, 103),
            Event::Gap(GapKind::Benign, 103, 105),
        ]
    );
}

#[tokio::test]
async fn should_cancel_parked_drain_on_unsubscribe() {
    let mut fx = Fixture::new(
        LOG,
        TailerConfig {
            cache_size: 1 << 20,
            cache_block_size: 16,
            ..config()
        },
    );
    let z = topic("Z");
    fx.tailer.add_subscriber(topic("filler"), 100, sub(9, 1)).await.unwrap();
    for seqno in 100..=103 {
        fx.feed(&z, seqno, LOG, 0).await;
    }
    fx.sink.take();
    fx.sink.set_capacity(Some(1));

    let f = sub(10, 1);
    fx.tailer.add_subscriber(z.clone(), 100, f).await.unwrap();
    assert_eq!(fx.delivers_to(f).len(), 1);

    // when: the subscriber disconnects while parked
    fx.tailer.remove_subscriber(f).unwrap();
    fx.sink.take();
    fx.sink.set_capacity(None);
    fx.tailer.tick().await.unwrap();

    // then: nothing more is delivered and no reader is opened for it
    assert!(fx.delivers_to(f).is_empty());
    assert_eq!(fx.store.start_calls(LOG), 1);
}

#[tokio::test]
async fn should_serve_would_be_rewind_entirely_from_cache() {
    // given: a cache holding 10..=20 and a reader at 21
    let mut fx = Fixture::new(
        LOG,
        TailerConfig {
            readers_per_room: 1,
            cache_size: 1 << 20,
            cache_block_size: 16,
            ..config()
        },
    );
    let t = topic("T");
    let a = sub(11, 1);
    fx.tailer.add_subscriber(t.clone(), 10, a).await.unwrap();
    for seqno in 10..=20 {
        fx.feed(&t, seqno, LOG, 0).await;
    }
    fx.sink.take();

    // when: a second subscriber rewinds the single reader to 10 and the
    // first re-read record arrives from the log
    let b = sub(12, 1);
    fx.tailer.add_subscriber(t.clone(), 10, b).await.unwrap();
    // the cache already serves 10..=20 during subscription, so B is
    // attached at 21 without any log reads
    assert_eq!(
        fx.delivers_to(b).iter().map(|(_, s)| *s).collect::<Vec<_>>(),
        (10..=20).collect::<Vec<_>>()
    );
    assert!(fx.metrics.encode().contains("records_served_from_cache_total 11"));
}

/// Routes topics to a log derived from their namespace, so tests can
/// address several logs.
struct NamespaceRouter;

impl LogRouter for NamespaceRouter {
    fn route(&self, topic: &TopicUuid) -> Result<LogId> {
        Ok(LogId(topic.namespace.0 as u64))
    }
}

#[tokio::test]
async fn should_cap_concurrent_find_latest_requests() {
    // given: a cap of one in-flight FindLatestSeqno request
    let store = MockLogStore::new();
    store.set_latest(LogId(201), 10);
    store.set_latest(LogId(202), 20);
    let (sink, inspector) = TestSink::collecting();
    let (mut tailer, mut latest_rx) = TopicTailer::new(
        TailerConfig {
            max_find_time_requests: 1,
            ..config()
        },
        store.clone(),
        Arc::new(NamespaceRouter),
        Box::new(sink),
        Arc::new(Metrics::new()),
        Arc::new(MockClock::new()),
        HostId::new("test-tower", 0),
    );

    let t1 = TopicUuid::new(NamespaceId(201), "a");
    let t2 = TopicUuid::new(NamespaceId(202), "b");
    let s1 = sub(1, 1);
    let s2 = sub(2, 1);

    // when: two tail subscriptions on different logs arrive
    tailer.add_subscriber(t1, 0, s1).await.unwrap();
    tailer.add_subscriber(t2, 0, s2).await.unwrap();

    // then: only the first request went out
    let first = latest_rx.try_recv().expect("first request in flight");
    assert!(latest_rx.try_recv().is_err(), "second request deferred");

    // completing the first releases the second
    tailer.process_find_latest_response(first).await.unwrap();
    let second = latest_rx.try_recv().expect("second request released");
    tailer.process_find_latest_response(second).await.unwrap();

    let gaps: Vec<_> = inspector
        .messages()
        .iter()
        .filter_map(|out| match &out.message {
            controltower::Message::Gap(gap) => Some((out.recipients.clone(), gap.from, gap.to)),
            _ => None,
        })
        .collect();
    assert_eq!(gaps.len(), 2);
    assert_eq!(gaps[0], (vec![s1], 0, 9));
    assert_eq!(gaps[1], (vec![s2], 0, 19));
}
