//! Request body transfer.
//!
//! A [`BodyGenerator`] is attached to a [`Request`][crate::Request] and asked
//! for a fresh [`Body`] at the start of every Attempt that sends one. The
//! engine then pulls data out of the body with [`Body::transfer_to`] until it
//! reports [`BodyState::Stop`].
//!
//! ```text
//!                 ┌───────────┐
//!       ┌────────▶│ Continue  │──┐
//!       │         └───────────┘  │  flush, call again
//!       │                        │
//! transfer_to ◀──────────────────┘
//!       │         ┌───────────┐
//!       ├────────▶│ Suspend   │──▶ wait for BodyListener::on_content_added
//!       │         └───────────┘
//!       │         ┌───────────┐
//!       └────────▶│ Stop      │──▶ close
//!                 └───────────┘
//! ```

use std::io;
use std::sync::Arc;

use bytes::BytesMut;

mod bytes_body;
pub use bytes_body::ByteBodyGenerator;

mod file;
pub use file::FileBodyGenerator;

mod feed;
pub use feed::FeedableBodyGenerator;

/// Outcome of one [`Body::transfer_to`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyState {
    /// More data is available, call again.
    Continue,

    /// No data is available right now. The body will call
    /// [`BodyListener::on_content_added`] once there is.
    Suspend,

    /// The body is exhausted.
    Stop,
}

/// A cursor over request body data.
///
/// A body is owned by exactly one Attempt and closed exactly once by the
/// engine, whichever way the Attempt ends.
pub trait Body: Send {
    /// Length of the body in bytes, or `-1` when unknown.
    fn content_length(&self) -> i64;

    /// Write as much data as is available into the spare capacity of `target`.
    ///
    /// Implementations must not grow `target` beyond its capacity. Data
    /// written alongside a [`BodyState::Stop`] is still sent.
    fn transfer_to(&mut self, target: &mut BytesMut) -> io::Result<BodyState>;

    /// Release underlying resources. Calling this more than once is a no-op.
    fn close(&mut self) -> io::Result<()>;

    /// Register the listener to notify when a suspended body has more data.
    fn set_listener(&mut self, listener: Arc<dyn BodyListener>) {
        let _ = listener;
    }

    /// Random access view of the body, for zero copy transfers.
    fn as_random_access(&mut self) -> Option<&mut dyn RandomAccessBody> {
        None
    }
}

/// A body whose content can be read at arbitrary positions.
///
/// Used to hand file regions to the transport without copying them through
/// the engine's buffers.
pub trait RandomAccessBody: Send {
    /// Number of bytes in the region.
    fn region_length(&self) -> u64;

    /// Copy bytes from `position` (relative to the region start) into `target`.
    ///
    /// Returns the number of bytes copied, `0` when `position` is at the end.
    fn transfer_region(&mut self, position: u64, target: &mut dyn io::Write) -> io::Result<u64>;
}

/// Receives notifications from bodies that returned [`BodyState::Suspend`].
pub trait BodyListener: Send + Sync {
    /// New content was added to the body.
    fn on_content_added(&self);

    /// The producer of the body failed.
    fn on_error(&self, error: &io::Error) {
        let _ = error;
        self.on_content_added();
    }
}

impl BodyListener for tokio::sync::Notify {
    fn on_content_added(&self) {
        // notify_one stores a permit, a notification before the wait is not lost.
        self.notify_one();
    }
}

/// Creates a [`Body`] per Attempt.
pub trait BodyGenerator: Send + Sync {
    /// Create a body positioned at its start.
    fn create_body(&self) -> io::Result<Box<dyn Body>>;

    /// Whether [`BodyGenerator::create_body`] can be called again after a body
    /// has been (partially) consumed, producing the same content.
    fn is_replayable(&self) -> bool {
        true
    }
}

/// Spare capacity of `target`, the most a body may write in one transfer.
pub(crate) fn spare(target: &BytesMut) -> usize {
    target.capacity() - target.len()
}
