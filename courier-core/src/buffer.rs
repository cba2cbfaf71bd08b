//! Reconnect buffer. Holds publishes issued while the transport is down and
//! hands them back in FIFO order once a new link is up.
//!
//! The buffer only guarantees a transmission attempt after reconnect. It does
//! not track delivery.

use std::{collections::VecDeque, fmt};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use crate::error::{Error, Result};

/// Which configured limit rejected an enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferLimit {
    /// total buffered bytes
    Bytes(usize),
    /// number of buffered entries
    Entries(usize),
}

impl fmt::Display for BufferLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferLimit::Bytes(n) => write!(f, "{n} bytes"),
            BufferLimit::Entries(n) => write!(f, "{n} entries"),
        }
    }
}

/// What to do when a new entry does not fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Fail the new publish, keep everything already buffered.
    #[default]
    RejectNewest,
    /// Evict from the front until the new entry fits. Evictions are logged
    /// and returned to the caller.
    DropOldest,
}

/// Capacity configuration. `None` means unbounded on that axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferLimits {
    pub max_bytes: Option<usize>,
    pub max_entries: Option<usize>,
    pub overflow: OverflowPolicy,
}

/// A publish waiting for the transport to come back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingPublish {
    pub subject: String,
    pub reply: Option<String>,
    pub payload: Bytes,
}

impl PendingPublish {
    pub fn new(subject: impl Into<String>, reply: Option<String>, payload: Bytes) -> Self {
        Self {
            subject: subject.into(),
            reply,
            payload,
        }
    }

    /// Bytes this entry counts against the byte limit.
    pub fn size(&self) -> usize {
        self.subject.len() + self.reply.as_ref().map_or(0, String::len) + self.payload.len()
    }
}

/// Bounded FIFO of pending publishes.
#[derive(Debug, Default)]
pub struct OutboundBuffer {
    entries: VecDeque<PendingPublish>,
    bytes: usize,
    limits: BufferLimits,
}

impl OutboundBuffer {
    pub fn new(limits: BufferLimits) -> Self {
        Self {
            entries: VecDeque::new(),
            bytes: 0,
            limits,
        }
    }

    pub fn limits(&self) -> BufferLimits {
        self.limits
    }

    /// number of buffered entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// total bytes currently buffered
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    fn fits(&self, entries: usize, bytes: usize) -> Option<BufferLimit> {
        if let Some(max) = self.limits.max_entries {
            if entries > max {
                return Some(BufferLimit::Entries(max));
            }
        }
        if let Some(max) = self.limits.max_bytes {
            if bytes > max {
                return Some(BufferLimit::Bytes(max));
            }
        }
        None
    }

    /// Add an entry at the back.
    ///
    /// Returns the number of entries evicted to make room, which is always 0
    /// under [`OverflowPolicy::RejectNewest`]. On error the buffer is
    /// unchanged.
    pub fn enqueue(&mut self, entry: PendingPublish) -> Result<usize> {
        let size = entry.size();

        // an entry that cannot fit in an empty buffer is rejected regardless of policy
        if let Some(limit) = self.fits(1, size) {
            return Err(Error::BufferFull { limit });
        }

        let mut evicted = 0;
        while let Some(limit) = self.fits(self.entries.len() + 1, self.bytes + size) {
            match self.limits.overflow {
                OverflowPolicy::RejectNewest => {
                    trace!(subject = %entry.subject, %limit, "reconnect buffer rejected publish");
                    return Err(Error::BufferFull { limit });
                }
                OverflowPolicy::DropOldest => {
                    if let Some(old) = self.entries.pop_front() {
                        self.bytes -= old.size();
                        evicted += 1;
                    }
                }
            }
        }
        if evicted > 0 {
            warn!(evicted, "reconnect buffer evicted oldest publishes");
        }

        self.bytes += size;
        self.entries.push_back(entry);
        Ok(evicted)
    }

    /// Take every buffered entry in FIFO order. The iterator is lazy; entries
    /// not yet yielded when it is dropped are discarded.
    pub fn drain(&mut self) -> Drain<'_> {
        self.bytes = 0;
        Drain {
            inner: self.entries.drain(..),
        }
    }

    /// Discard everything, returning how many entries were dropped.
    pub fn clear(&mut self) -> usize {
        let n = self.entries.len();
        self.entries.clear();
        self.bytes = 0;
        n
    }

    /// Peek at the buffered entries in order.
    pub fn iter(&self) -> impl Iterator<Item = &PendingPublish> {
        self.entries.iter()
    }
}

/// Draining FIFO iterator returned by [`OutboundBuffer::drain`].
#[derive(Debug)]
pub struct Drain<'a> {
    inner: std::collections::vec_deque::Drain<'a, PendingPublish>,
}

impl Iterator for Drain<'_> {
    type Item = PendingPublish;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl ExactSizeIterator for Drain<'_> {}
