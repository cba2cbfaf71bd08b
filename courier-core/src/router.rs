//! Subscription router. Maps subject patterns (optionally with a queue group)
//! to local handlers and decides which of them see an inbound message.
//!
//! Queue-group balancing happens on the server. The router only delivers to
//! the queue members the server named and never picks one itself.

use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use bytes::Bytes;
use tracing::trace;

use crate::{
    error::Result,
    proto::{ClientId, ClientOp, Sid},
    subject,
};

/// A message handed to a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub subject: String,
    pub reply: Option<String>,
    pub payload: Bytes,
}

/// Delivery capability held by a subscription.
pub trait Handler: Send + Sync + 'static {
    fn invoke(&self, msg: Message);
}

impl<F> Handler for F
where
    F: Fn(Message) + Send + Sync + 'static,
{
    fn invoke(&self, msg: Message) {
        self(msg)
    }
}

/// A message as it came off the link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    pub subject: String,
    pub reply: Option<String>,
    pub payload: Bytes,
    /// connection that published it
    pub origin: ClientId,
    /// queue members on this connection chosen by the server
    pub queue_sids: Vec<Sid>,
}

struct Subscription {
    subject: String,
    queue: Option<String>,
    handler: Arc<dyn Handler>,
    live: Arc<AtomicBool>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("subject", &self.subject)
            .field("queue", &self.queue)
            .field("live", &self.live.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// A pending handler invocation, run outside the connection lock.
pub struct Delivery {
    pub sid: Sid,
    handler: Arc<dyn Handler>,
    live: Arc<AtomicBool>,
    msg: Message,
}

impl Delivery {
    /// Invoke the handler unless the subscription went away in the meantime.
    /// Returns whether the handler ran.
    pub fn deliver(self) -> bool {
        if !self.live.load(Ordering::Acquire) {
            return false;
        }
        self.handler.invoke(self.msg);
        true
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("sid", &self.sid)
            .field("subject", &self.msg.subject)
            .finish_non_exhaustive()
    }
}

/// Outcome of routing one inbound message.
#[derive(Debug, Default)]
pub struct Dispatch {
    pub deliveries: Vec<Delivery>,
    /// dropped because it was our own publish and echo is off
    pub echo_suppressed: bool,
}

/// Subscription table for one connection.
#[derive(Debug)]
pub struct Router {
    subs: BTreeMap<Sid, Subscription>,
    next_sid: Sid,
    no_echo: bool,
}

impl Router {
    pub fn new(no_echo: bool) -> Self {
        Self {
            subs: BTreeMap::new(),
            next_sid: 1,
            no_echo,
        }
    }

    pub fn no_echo(&self) -> bool {
        self.no_echo
    }

    pub fn len(&self) -> usize {
        self.subs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subs.is_empty()
    }

    /// Register a subscription. Returns its sid and liveness flag.
    pub fn subscribe(
        &mut self,
        subject: &str,
        queue: Option<&str>,
        handler: Arc<dyn Handler>,
    ) -> Result<(Sid, Arc<AtomicBool>)> {
        subject::validate_pattern(subject)?;
        if let Some(queue) = queue {
            subject::validate_queue(queue)?;
        }
        let sid = self.next_sid;
        self.next_sid += 1;
        let live = Arc::new(AtomicBool::new(true));
        self.subs.insert(
            sid,
            Subscription {
                subject: subject.to_owned(),
                queue: queue.map(str::to_owned),
                handler,
                live: Arc::clone(&live),
            },
        );
        trace!(sid, subject, ?queue, "subscription registered");
        Ok((sid, live))
    }

    /// Remove a subscription. Returns false if it was already gone.
    pub fn unsubscribe(&mut self, sid: Sid) -> bool {
        match self.subs.remove(&sid) {
            Some(sub) => {
                sub.live.store(false, Ordering::Release);
                true
            }
            None => false,
        }
    }

    /// Mark every subscription dead and forget them.
    pub fn clear(&mut self) {
        for sub in self.subs.values() {
            sub.live.store(false, Ordering::Release);
        }
        self.subs.clear();
    }

    /// `Sub` frames for every live subscription, in sid order. Sent after a
    /// reconnect so the server knows our interest again.
    pub fn interest(&self) -> Vec<ClientOp> {
        self.subs
            .iter()
            .map(|(sid, sub)| ClientOp::Sub {
                sid: *sid,
                subject: sub.subject.clone(),
                queue: sub.queue.clone(),
            })
            .collect()
    }

    /// Work out which handlers receive `msg`. `own_id` is the id the server
    /// gave our current link.
    pub fn dispatch_incoming(&self, msg: &IncomingMessage, own_id: ClientId) -> Dispatch {
        if self.no_echo && msg.origin == own_id {
            trace!(subject = %msg.subject, "dropping echo of own publish");
            return Dispatch {
                deliveries: Vec::new(),
                echo_suppressed: true,
            };
        }

        let deliveries = self
            .subs
            .iter()
            .filter(|(sid, sub)| match sub.queue {
                None => subject::matches(&sub.subject, &msg.subject),
                Some(_) => msg.queue_sids.contains(sid),
            })
            .filter(|(_, sub)| sub.live.load(Ordering::Acquire))
            .map(|(sid, sub)| Delivery {
                sid: *sid,
                handler: Arc::clone(&sub.handler),
                live: Arc::clone(&sub.live),
                msg: Message {
                    subject: msg.subject.clone(),
                    reply: msg.reply.clone(),
                    payload: msg.payload.clone(),
                },
            })
            .collect();

        Dispatch {
            deliveries,
            echo_suppressed: false,
        }
    }
}
