//! # Connection manager
//!
//! [`Connection`] owns one logical connection to a set of servers. It
//! performs the credential handshake, keeps the link alive, and reconnects
//! with bounded exponential backoff when the link is lost. Publishes issued
//! while reconnecting go to the reconnect buffer and are flushed in order
//! before the connection reports `Connected` again.
//!
//! ```no_run
//! # async fn demo() -> courier_core::Result<()> {
//! use courier_core::{ConnectOptions, Connection};
//!
//! let conn = Connection::connect(ConnectOptions::new().name("demo")).await?;
//! let mut sub = conn.subscribe("greet.*").await?;
//! conn.publish("greet.world", "hello").await?;
//! if let Some(msg) = sub.next().await {
//!     println!("{}: {:?}", msg.subject, msg.payload);
//! }
//! conn.close().await;
//! # Ok(())
//! # }
//! ```

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant},
};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info_span, trace};
use tracing_futures::Instrument;

use crate::{
    buffer::PendingPublish,
    error::{Error, Result},
    metrics,
    proto::{ClientId, ClientOp, ServerInfo, Sid},
    router::{Handler, Message},
    subject,
    transport::{TcpTransport, Transport},
};

mod driver;
pub mod options;
pub mod state;
pub mod subscriber;

use driver::{Inner, track_buffered_bytes};
pub use options::ConnectOptions;
pub use state::{CloseReport, State, Statistics};
pub use subscriber::{Subscriber, SubscriptionHandle};

/// A connection to one of a list of servers. Cheap to clone; all clones
/// share the same link, buffer and subscriptions.
#[derive(Debug, Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Connect over TCP.
    pub async fn connect(options: ConnectOptions) -> Result<Self> {
        let transport = TcpTransport::new(options.connect_timeout);
        Self::connect_with(options, transport).await
    }

    /// Connect using `transport` for every connect and reconnect attempt.
    ///
    /// Credentials are loaded before any network activity, so a malformed
    /// bundle fails with [`Error::Parse`] without contacting a server.
    /// Authorization failures are returned immediately and never retried.
    pub async fn connect_with(options: ConnectOptions, transport: impl Transport) -> Result<Self> {
        options.validate()?;
        let creds = options.load_credentials()?;

        let span = info_span!("connection", name = ?options.name);
        let inner = Arc::new(Inner::new(options, creds, Arc::new(transport)));
        {
            let mut shared = inner.lock().await;
            inner.set_state(&mut shared, State::Connecting);
        }

        let rx = match inner
            .establish_initial()
            .instrument(span.clone())
            .await
        {
            Ok(established) => inner.install(established).await,
            Err(err) => Err(err),
        };
        let rx = match rx {
            Ok(rx) => rx,
            Err(err) => {
                inner.shutdown(Some(err.clone())).await;
                return Err(err);
            }
        };

        tokio::spawn(Arc::clone(&inner).run(rx).instrument(span));
        Ok(Self { inner })
    }

    pub async fn publish(&self, subject: &str, payload: impl Into<Bytes>) -> Result<()> {
        self.publish_inner(subject, None, payload.into()).await
    }

    pub async fn publish_with_reply(
        &self,
        subject: &str,
        reply: &str,
        payload: impl Into<Bytes>,
    ) -> Result<()> {
        self.publish_inner(subject, Some(reply), payload.into())
            .await
    }

    async fn publish_inner(&self, subject: &str, reply: Option<&str>, payload: Bytes) -> Result<()> {
        subject::validate_subject(subject)?;
        if let Some(reply) = reply {
            subject::validate_subject(reply)?;
        }
        let inner = &self.inner;
        let mut shared = inner.lock().await;

        let entry = PendingPublish::new(subject, reply.map(str::to_owned), payload);
        match shared.state {
            State::Closed => return Err(Error::Closed),
            State::Connected => {
                let max_payload = shared.server_info.as_ref().map_or(0, |i| i.max_payload);
                if max_payload > 0 && entry.payload.len() > max_payload {
                    return Err(Error::Protocol(format!(
                        "payload of {} bytes exceeds server maximum of {max_payload}",
                        entry.payload.len()
                    )));
                }
                if shared.send(ClientOp::from(entry.clone())).is_ok() {
                    state::Counters::add(&inner.counters.published, 1);
                    metrics::PUBLISHED.inc();
                    return Ok(());
                }
                // the link died under us; the driver notices and reconnects
            }
            _ => {}
        }

        let before = shared.buffer.bytes();
        let result = shared.buffer.enqueue(entry);
        track_buffered_bytes(before, shared.buffer.bytes());
        match result {
            Ok(evicted) => {
                state::Counters::add(&inner.counters.buffered, 1);
                metrics::BUFFERED.inc();
                if evicted > 0 {
                    state::Counters::add(&inner.counters.discarded, evicted as u64);
                    metrics::DISCARDED.inc_by(evicted as u64);
                }
                trace!(subject, buffered = shared.buffer.len(), "publish buffered");
                Ok(())
            }
            Err(err) => {
                state::Counters::add(&inner.counters.buffer_rejected, 1);
                metrics::BUFFER_REJECTED.inc();
                debug!(subject, %err, "publish rejected");
                Err(err)
            }
        }
    }

    /// Subscribe with a callback. The handler runs on the connection's
    /// inbound task, one message at a time, in arrival order.
    pub async fn subscribe_with(
        &self,
        subject: &str,
        queue: Option<&str>,
        handler: impl Handler,
    ) -> Result<SubscriptionHandle> {
        let mut shared = self.inner.lock().await;
        if shared.state == State::Closed {
            return Err(Error::Closed);
        }
        let (sid, live) = shared.router.subscribe(subject, queue, Arc::new(handler))?;
        if shared.state == State::Connected {
            // a failed send is repaired by the resubscribe on reconnect
            let _ = shared.send(ClientOp::Sub {
                sid,
                subject: subject.to_owned(),
                queue: queue.map(str::to_owned),
            });
        }
        Ok(SubscriptionHandle {
            sid,
            subject: subject.to_owned(),
            queue: queue.map(str::to_owned),
            live,
            conn: Arc::downgrade(&self.inner),
        })
    }

    /// Subscribe to `subject` (wildcards allowed).
    pub async fn subscribe(&self, subject: &str) -> Result<Subscriber> {
        self.channel_subscribe(subject, None).await
    }

    /// Join queue group `queue` on `subject`. Each message published on the
    /// subject reaches exactly one member of the group.
    pub async fn queue_subscribe(&self, subject: &str, queue: &str) -> Result<Subscriber> {
        self.channel_subscribe(subject, Some(queue)).await
    }

    async fn channel_subscribe(&self, subject: &str, queue: Option<&str>) -> Result<Subscriber> {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = self
            .subscribe_with(subject, queue, move |msg: Message| {
                let _ = tx.send(msg);
            })
            .await?;
        Ok(Subscriber::new(handle, rx))
    }

    /// Stop delivery to `handle`. Returns false if it had already stopped.
    pub async fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        unsubscribe_sid(&self.inner, handle.sid).await
    }

    /// Round trip to the server. Resolves once the server processed
    /// everything this connection sent before the call.
    pub async fn flush(&self) -> Result<()> {
        let timeout = self.inner.options.request_timeout;
        let rx = {
            let mut shared = self.inner.lock().await;
            match shared.state {
                State::Closed => return Err(Error::Closed),
                State::Connected => {}
                state => return Err(Error::Network(format!("cannot flush while {state}"))),
            }
            shared.send(ClientOp::Ping)?;
            let (tx, rx) = oneshot::channel();
            shared.pongs.push_back(Some(tx));
            rx
        };
        tokio::select! {
            _ = self.inner.cancel.cancelled() => Err(Error::Closed),
            pong = tokio::time::timeout(timeout, rx) => match pong {
                Ok(Ok(())) => Ok(()),
                Ok(Err(_)) => Err(Error::Network("connection lost before flush completed".into())),
                Err(_) => Err(Error::Timeout(format!("flush took longer than {timeout:?}"))),
            }
        }
    }

    /// Publish with a fresh inbox as reply subject and wait for the first
    /// reply.
    pub async fn request(
        &self,
        subject: &str,
        payload: impl Into<Bytes>,
        timeout: Option<Duration>,
    ) -> Result<Message> {
        let timeout = timeout.unwrap_or(self.inner.options.request_timeout);
        let inbox = self.inner.new_inbox();
        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let handle = self
            .subscribe_with(&inbox, None, move |msg: Message| {
                let waiter = tx.lock().unwrap_or_else(PoisonError::into_inner).take();
                if let Some(waiter) = waiter {
                    let _ = waiter.send(msg);
                }
            })
            .await?;

        let started = Instant::now();
        let result = async {
            self.publish_with_reply(subject, &inbox, payload).await?;
            tokio::select! {
                _ = self.inner.cancel.cancelled() => Err(Error::Closed),
                reply = tokio::time::timeout(timeout, rx) => match reply {
                    Ok(Ok(msg)) => Ok(msg),
                    Ok(Err(_)) => Err(Error::Closed),
                    Err(_) => Err(Error::Timeout(format!(
                        "no reply on {subject} within {timeout:?}"
                    ))),
                }
            }
        }
        .await;
        self.unsubscribe(&handle).await;

        if result.is_ok() {
            metrics::REQUEST_DURATION.observe(started.elapsed().as_secs_f64());
        }
        result
    }

    /// Close the connection. Cancels any reconnect in progress, drops the
    /// reconnect buffer and ends every subscription. Calling it again
    /// returns the first report.
    pub async fn close(&self) -> CloseReport {
        self.inner.shutdown(None).await
    }

    /// Wait until the connection is closed, by [`close`](Self::close) or by
    /// giving up on reconnecting.
    pub async fn closed(&self) -> CloseReport {
        let mut rx = self.inner.close_tx.subscribe();
        let report = rx.wait_for(Option::is_some).await;
        match report.as_deref() {
            Ok(Some(report)) => report.clone(),
            // the sender lives in `inner`, which we hold
            _ => CloseReport {
                reason: Some(Error::Closed),
                discarded: 0,
            },
        }
    }

    pub fn state(&self) -> State {
        *self.inner.state_tx.borrow()
    }

    /// Wait until the connection reaches `state`. Returns early with
    /// `Closed` if the connection closes first.
    pub async fn wait_for_state(&self, state: State) -> State {
        let mut rx = self.inner.state_tx.subscribe();
        let reached = rx
            .wait_for(|current| *current == state || current.is_closed())
            .await
            .map(|s| *s);
        reached.unwrap_or(State::Closed)
    }

    /// Id the server gave the current link. `None` while not connected.
    pub async fn connection_id(&self) -> Option<ClientId> {
        self.inner.lock().await.client_id
    }

    pub async fn server_info(&self) -> Option<ServerInfo> {
        self.inner.lock().await.server_info.clone()
    }

    /// Number of publishes waiting in the reconnect buffer.
    pub async fn buffered(&self) -> usize {
        self.inner.lock().await.buffer.len()
    }

    pub fn stats(&self) -> Statistics {
        self.inner.counters.snapshot()
    }

    pub fn options(&self) -> &ConnectOptions {
        &self.inner.options
    }
}

pub(crate) async fn unsubscribe_sid(inner: &Inner, sid: Sid) -> bool {
    let mut shared = inner.lock().await;
    if !shared.router.unsubscribe(sid) {
        return false;
    }
    if shared.state == State::Connected {
        let _ = shared.send(ClientOp::Unsub { sid });
    }
    trace!(sid, "unsubscribed");
    true
}
