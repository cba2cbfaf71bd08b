use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use crate::error::Error;

/// Lifecycle of a [`Connection`](super::Connection).
///
/// Moves forward only, except for the reconnect cycle
/// `Connected -> Reconnecting -> Connected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

impl State {
    pub fn as_str(&self) -> &'static str {
        match self {
            State::Disconnected => "disconnected",
            State::Connecting => "connecting",
            State::Connected => "connected",
            State::Reconnecting => "reconnecting",
            State::Closed => "closed",
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, State::Closed)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why and how a connection ended.
#[derive(Debug, Clone)]
pub struct CloseReport {
    /// `None` when closed by [`Connection::close`](super::Connection::close),
    /// otherwise the error that ended it
    pub reason: Option<Error>,
    /// buffered publishes thrown away at close
    pub discarded: usize,
}

impl CloseReport {
    /// True when the connection ended on its own rather than by `close`.
    pub fn is_failure(&self) -> bool {
        self.reason.is_some()
    }
}

/// Point-in-time copy of a connection's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Statistics {
    pub published: u64,
    pub buffered: u64,
    pub buffer_rejected: u64,
    pub flushed: u64,
    pub discarded: u64,
    pub delivered: u64,
    pub echo_suppressed: u64,
    pub reconnects: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) published: AtomicU64,
    pub(crate) buffered: AtomicU64,
    pub(crate) buffer_rejected: AtomicU64,
    pub(crate) flushed: AtomicU64,
    pub(crate) discarded: AtomicU64,
    pub(crate) delivered: AtomicU64,
    pub(crate) echo_suppressed: AtomicU64,
    pub(crate) reconnects: AtomicU64,
}

impl Counters {
    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> Statistics {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        Statistics {
            published: load(&self.published),
            buffered: load(&self.buffered),
            buffer_rejected: load(&self.buffer_rejected),
            flushed: load(&self.flushed),
            discarded: load(&self.discarded),
            delivered: load(&self.delivered),
            echo_suppressed: load(&self.echo_suppressed),
            reconnects: load(&self.reconnects),
        }
    }
}
