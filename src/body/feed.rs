use std::collections::VecDeque;
use std::io;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

use super::{spare, Body, BodyGenerator, BodyListener, BodyState};
use crate::Error;

/// A body that is fed data while the request is in flight.
///
/// The engine pulls whatever has been fed so far and suspends when the queue
/// runs dry. Each [`FeedableBodyGenerator::feed`] wakes the engine up again.
///
/// Fed data is consumed, so the body can't be replayed on retries.
#[derive(Clone)]
pub struct FeedableBodyGenerator {
    shared: Arc<Mutex<Feed>>,
    content_length: i64,
}

#[derive(Default)]
struct Feed {
    queue: VecDeque<Bytes>,
    last: bool,
    closed: bool,
    failed: Option<(io::ErrorKind, String)>,
    listener: Option<Arc<dyn BodyListener>>,
}

impl FeedableBodyGenerator {
    /// Creates a body of unknown length.
    pub fn new() -> Self {
        Self::with_content_length(-1)
    }

    /// Creates a body that will be fed exactly `content_length` bytes.
    pub fn with_content_length(content_length: i64) -> Self {
        FeedableBodyGenerator {
            shared: Arc::new(Mutex::new(Feed::default())),
            content_length,
        }
    }

    /// Append data. `last` marks the end of the body.
    pub fn feed(&self, data: impl Into<Bytes>, last: bool) -> Result<(), Error> {
        let listener = {
            let mut feed = self.shared.lock();
            if feed.last {
                return Err(Error::Protocol("feed after last chunk".into()));
            }
            if feed.closed {
                return Err(Error::Cancelled);
            }
            let data = data.into();
            if !data.is_empty() {
                feed.queue.push_back(data);
            }
            feed.last = last;
            feed.listener.clone()
        };

        // Notify outside the lock, the listener may pull straight away.
        if let Some(listener) = listener {
            listener.on_content_added();
        }

        Ok(())
    }

    /// Fail the body. The Attempt sending it fails with this error.
    pub fn fail(&self, error: io::Error) {
        let listener = {
            let mut feed = self.shared.lock();
            feed.failed = Some((error.kind(), error.to_string()));
            feed.listener.clone()
        };
        if let Some(listener) = listener {
            listener.on_error(&error);
        }
    }
}

impl Default for FeedableBodyGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl BodyGenerator for FeedableBodyGenerator {
    fn create_body(&self) -> io::Result<Box<dyn Body>> {
        Ok(Box::new(FeedBody {
            shared: self.shared.clone(),
            content_length: self.content_length,
            pulled: false,
        }))
    }

    fn is_replayable(&self) -> bool {
        false
    }
}

struct FeedBody {
    shared: Arc<Mutex<Feed>>,
    content_length: i64,
    pulled: bool,
}

impl Body for FeedBody {
    fn content_length(&self) -> i64 {
        self.content_length
    }

    fn transfer_to(&mut self, target: &mut BytesMut) -> io::Result<BodyState> {
        let mut feed = self.shared.lock();
        self.pulled = true;

        if let Some((kind, message)) = &feed.failed {
            return Err(io::Error::new(*kind, message.clone()));
        }

        while spare(target) > 0 {
            let Some(front) = feed.queue.front_mut() else {
                break;
            };
            let n = spare(target).min(front.len());
            target.extend_from_slice(&front.split_to(n));
            if front.is_empty() {
                feed.queue.pop_front();
            }
        }

        let state = if !feed.queue.is_empty() {
            BodyState::Continue
        } else if feed.last {
            BodyState::Stop
        } else {
            BodyState::Suspend
        };

        Ok(state)
    }

    fn close(&mut self) -> io::Result<()> {
        let mut feed = self.shared.lock();
        feed.listener = None;
        // A body that was never pulled from leaves the fed data to the next one.
        if self.pulled {
            feed.closed = true;
            feed.queue.clear();
        }
        Ok(())
    }

    fn set_listener(&mut self, listener: Arc<dyn BodyListener>) {
        self.shared.lock().listener = Some(listener);
    }
}
