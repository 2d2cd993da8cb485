//! The room worker: a single task owning one [`TopicTailer`].
//!
//! All public entry points enqueue a command onto a bounded queue and
//! return immediately; the worker drains commands, `FindLatestSeqno`
//! responses, and a periodic tick until cancelled. A full queue surfaces
//! as [`Error::NoBuffer`] to the caller, which is expected to retry.

use std::sync::Arc;

use common::clock::Clock;
use common::flow::Sink;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::TailerConfig;
use crate::error::{Error, Result};
use crate::message::{HostId, MessageMetadata, MetaType, MetadataOp};
use crate::metrics::Metrics;
use crate::model::{
    CopilotSub, GapKind, LogId, LogRecord, ReaderId, SequenceNumber, StreamId, SubscriptionId,
    TopicUuid,
};
use crate::router::LogRouter;
use crate::storage::LogStore;
use crate::tailer::{OutboundMessage, TopicTailer};

/// Commands accepted by the room worker.
#[derive(Debug)]
pub enum RoomCommand {
    AddSubscriber {
        topic: TopicUuid,
        start: SequenceNumber,
        id: CopilotSub,
    },
    RemoveSubscriber {
        id: CopilotSub,
    },
    RemoveStream {
        stream: StreamId,
    },
    LogRecord {
        record: LogRecord,
        log_id: LogId,
        reader_id: ReaderId,
    },
    GapRecord {
        log_id: LogId,
        kind: GapKind,
        from: SequenceNumber,
        to: SequenceNumber,
        reader_id: ReaderId,
    },
}

/// Spawns room workers.
pub struct Room;

impl Room {
    /// Spawns the worker task and returns the handle used to feed it.
    pub fn spawn(
        config: TailerConfig,
        store: Arc<dyn LogStore>,
        router: Arc<dyn LogRouter>,
        sink: Box<dyn Sink<OutboundMessage>>,
        clock: Arc<dyn Clock>,
        origin: HostId,
    ) -> RoomHandle {
        let metrics = Arc::new(Metrics::new());
        let (cmd_tx, mut cmd_rx) = mpsc::channel(config.storage_to_room_queue_size.max(1));
        let stop = CancellationToken::new();
        let timer_interval = config.timer_interval;

        let (mut tailer, mut latest_rx) = TopicTailer::new(
            config,
            store,
            router,
            sink,
            metrics.clone(),
            clock,
            origin,
        );

        let worker_stop = stop.clone();
        let worker: JoinHandle<()> = tokio::spawn(async move {
            let mut interval = tokio::time::interval(timer_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = worker_stop.cancelled() => break,
                    command = cmd_rx.recv() => match command {
                        Some(command) => {
                            if let Err(err) = Self::apply(&mut tailer, command).await {
                                tracing::warn!("Room command failed: {}", err);
                            }
                        }
                        None => break,
                    },
                    Some(response) = latest_rx.recv() => {
                        if let Err(err) = tailer.process_find_latest_response(response).await {
                            tracing::warn!("FindLatestSeqno response failed: {}", err);
                        }
                    }
                    _ = interval.tick() => {
                        if let Err(err) = tailer.tick().await {
                            tracing::warn!("Room tick failed: {}", err);
                        }
                    }
                }
            }
        });

        RoomHandle {
            cmd_tx,
            stop,
            metrics,
            worker: Some(worker),
        }
    }

    async fn apply(tailer: &mut TopicTailer, command: RoomCommand) -> Result<()> {
        match command {
            RoomCommand::AddSubscriber { topic, start, id } => {
                tailer.add_subscriber(topic, start, id).await
            }
            RoomCommand::RemoveSubscriber { id } => tailer.remove_subscriber(id),
            RoomCommand::RemoveStream { stream } => tailer.remove_stream(stream),
            RoomCommand::LogRecord {
                record,
                log_id,
                reader_id,
            } => tailer.send_log_record(record, log_id, reader_id).await,
            RoomCommand::GapRecord {
                log_id,
                kind,
                from,
                to,
                reader_id,
            } => tailer.send_gap_record(log_id, kind, from, to, reader_id).await,
        }
    }
}

/// Cloneable entry point into a room worker.
pub struct RoomHandle {
    cmd_tx: mpsc::Sender<RoomCommand>,
    stop: CancellationToken,
    metrics: Arc<Metrics>,
    worker: Option<JoinHandle<()>>,
}

impl RoomHandle {
    /// Subscribes `id` to `topic` starting at `start` (0 = tail).
    pub fn add_subscriber(
        &self,
        topic: TopicUuid,
        start: SequenceNumber,
        id: CopilotSub,
    ) -> Result<()> {
        self.command(RoomCommand::AddSubscriber { topic, start, id })
    }

    /// Removes one subscription.
    pub fn remove_subscriber(&self, id: CopilotSub) -> Result<()> {
        self.command(RoomCommand::RemoveSubscriber { id })
    }

    /// Removes every subscription of a stream.
    pub fn remove_stream(&self, stream: StreamId) -> Result<()> {
        self.command(RoomCommand::RemoveStream { stream })
    }

    /// Feeds one record from the log store.
    pub fn send_log_record(
        &self,
        record: LogRecord,
        log_id: LogId,
        reader_id: ReaderId,
    ) -> Result<()> {
        self.command(RoomCommand::LogRecord {
            record,
            log_id,
            reader_id,
        })
    }

    /// Feeds one gap from the log store.
    pub fn send_gap_record(
        &self,
        log_id: LogId,
        kind: GapKind,
        from: SequenceNumber,
        to: SequenceNumber,
        reader_id: ReaderId,
    ) -> Result<()> {
        self.command(RoomCommand::GapRecord {
            log_id,
            kind,
            from,
            to,
            reader_id,
        })
    }

    /// Translates a decoded metadata request from a copilot stream into
    /// subscribe/unsubscribe commands.
    ///
    /// Metadata messages key subscriptions by topic, so the subscription
    /// id is derived from the topic identity: one subscription per
    /// `(stream, topic)` pair.
    pub fn on_metadata(&self, stream: StreamId, message: MessageMetadata) -> Result<()> {
        if message.meta_type != MetaType::Request {
            return Err(Error::InvalidArgument(
                "only metadata requests are accepted".to_string(),
            ));
        }
        for entry in message.topics {
            let topic = TopicUuid::new(entry.namespace, entry.topic.clone());
            let id = CopilotSub::new(stream, subscription_id_for(&topic));
            match entry.op {
                MetadataOp::Subscribe => self.command(RoomCommand::AddSubscriber {
                    topic,
                    start: entry.seqno,
                    id,
                })?,
                MetadataOp::Unsubscribe => {
                    self.command(RoomCommand::RemoveSubscriber { id })?
                }
            }
        }
        Ok(())
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    /// Stops the worker and waits for it to exit.
    pub async fn shutdown(mut self) {
        self.stop.cancel();
        if let Some(worker) = self.worker.take() {
            let _ = worker.await;
        }
    }

    fn command(&self, command: RoomCommand) -> Result<()> {
        self.cmd_tx.try_send(command).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => Error::NoBuffer,
            mpsc::error::TrySendError::Closed(_) => {
                Error::Internal("room worker stopped".to_string())
            }
        })
    }
}

fn subscription_id_for(topic: &TopicUuid) -> SubscriptionId {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    topic.hash(&mut hasher);
    SubscriptionId(hasher.finish())
}
