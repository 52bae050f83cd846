use std::io;

use bytes::{Bytes, BytesMut};

use super::{spare, Body, BodyGenerator, BodyState};

/// A body from an in-memory buffer.
#[derive(Debug, Clone)]
pub struct ByteBodyGenerator {
    data: Bytes,
}

impl ByteBodyGenerator {
    /// Wrap the data. Cloning [`Bytes`] is cheap so every body shares it.
    pub fn new(data: impl Into<Bytes>) -> Self {
        ByteBodyGenerator { data: data.into() }
    }
}

impl BodyGenerator for ByteBodyGenerator {
    fn create_body(&self) -> io::Result<Box<dyn Body>> {
        Ok(Box::new(ByteBody {
            data: self.data.clone(),
            closed: false,
        }))
    }
}

struct ByteBody {
    data: Bytes,
    closed: bool,
}

impl Body for ByteBody {
    fn content_length(&self) -> i64 {
        self.data.len() as i64
    }

    fn transfer_to(&mut self, target: &mut BytesMut) -> io::Result<BodyState> {
        if self.closed {
            return Ok(BodyState::Stop);
        }

        let n = spare(target).min(self.data.len());
        target.extend_from_slice(&self.data.split_to(n));

        if self.data.is_empty() {
            Ok(BodyState::Stop)
        } else {
            Ok(BodyState::Continue)
        }
    }

    fn close(&mut self) -> io::Result<()> {
        self.closed = true;
        self.data = Bytes::new();
        Ok(())
    }
}
