//! Interface to the log store consumed by the tailer.
//!
//! The log store driver lives outside this crate; the tailer only needs
//! the cursor management surface below. Record and gap events flow back
//! through the room's command queue, not through this trait.

use crate::error::Result;
use crate::model::{LogId, ReaderId, SequenceNumber};

/// Callback invoked with the result of a `find_latest_seqno` request.
///
/// May be invoked on any thread.
pub type FindLatestCallback = Box<dyn FnOnce(Result<SequenceNumber>) + Send>;

/// Cursor management surface of the log store.
///
/// All methods are command enqueues: they return once the request is
/// accepted, not once it takes effect.
pub trait LogStore: Send + Sync {
    /// Opens (or re-seeks) reader `reader_id` on `log_id` at `seqno`.
    /// `first_open` is set when the reader had no prior position on this
    /// log.
    fn start_reading(
        &self,
        log_id: LogId,
        seqno: SequenceNumber,
        reader_id: ReaderId,
        first_open: bool,
    ) -> Result<()>;

    /// Closes reader `reader_id` on `log_id`.
    fn stop_reading(&self, log_id: LogId, reader_id: ReaderId) -> Result<()>;

    /// Requests the sequence number of the next record to be written to
    /// `log_id`. The callback may arrive on any thread.
    fn find_latest_seqno(&self, log_id: LogId, callback: FindLatestCallback);

    /// Whether the store accepts a subscription one past the current
    /// tail. When it does not, tail subscriptions attach at `tail - 1`.
    fn can_subscribe_past_end(&self) -> bool;
}
