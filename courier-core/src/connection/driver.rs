//! Link ownership for one connection: handshake, inbound dispatch, keepalive,
//! reconnect and shutdown.

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio::{
    sync::{Mutex, MutexGuard, mpsc, oneshot, watch},
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::{
    options::ConnectOptions,
    state::{CloseReport, Counters, State},
};
use crate::{
    buffer::{OutboundBuffer, PendingPublish},
    creds::Credentials,
    error::{Error, Result},
    metrics,
    proto::{ClientId, ClientOp, ConnectInfo, ServerInfo, ServerOp},
    router::{IncomingMessage, Router},
    transport::{Link, Transport},
};

const LANG: &str = "rust";

/// State guarded by the connection lock.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) state: State,
    /// writer half of the current link, only set while connected
    pub(crate) link: Option<mpsc::UnboundedSender<ClientOp>>,
    pub(crate) client_id: Option<ClientId>,
    pub(crate) server_info: Option<ServerInfo>,
    pub(crate) buffer: OutboundBuffer,
    pub(crate) router: Router,
    /// one entry per ping in flight, `None` for keepalive pings
    pub(crate) pongs: VecDeque<Option<oneshot::Sender<()>>>,
    /// keepalive pings sent since the last pong of any kind
    pub(crate) pings_out: usize,
    pub(crate) close: Option<CloseReport>,
}

impl Shared {
    /// Send a frame on the current link.
    pub(crate) fn send(&self, op: ClientOp) -> Result<()> {
        let tx = self
            .link
            .as_ref()
            .ok_or_else(|| Error::Network("not connected".into()))?;
        tx.send(op)
            .map_err(|_| Error::Network("link closed while sending".into()))
    }
}

pub(crate) struct Inner {
    pub(crate) options: ConnectOptions,
    creds: Option<Credentials>,
    transport: Arc<dyn Transport>,
    shared: Mutex<Shared>,
    pub(crate) state_tx: watch::Sender<State>,
    pub(crate) close_tx: watch::Sender<Option<CloseReport>>,
    pub(crate) cancel: CancellationToken,
    pub(crate) counters: Counters,
    inbox_prefix: String,
    next_inbox: AtomicU64,
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inner")
            .field("servers", &self.options.servers)
            .field("name", &self.options.name)
            .field("state", &*self.state_tx.borrow())
            .field("transport", &self.transport)
            .finish_non_exhaustive()
    }
}

/// A link that completed the handshake.
#[derive(Debug)]
pub(crate) struct Established {
    link: Link,
    info: ServerInfo,
    addr: String,
}

fn server_error(message: String) -> Error {
    if message.to_ascii_lowercase().contains("authorization") {
        Error::Auth(message)
    } else {
        Error::Protocol(message)
    }
}

/// Adjust the process-wide buffered bytes gauge after a buffer change.
pub(crate) fn track_buffered_bytes(before: usize, after: usize) {
    metrics::BUFFERED_BYTES.add(after as i64 - before as i64);
}

impl Inner {
    pub(crate) fn new(
        options: ConnectOptions,
        creds: Option<Credentials>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let shared = Shared {
            state: State::Disconnected,
            link: None,
            client_id: None,
            server_info: None,
            buffer: OutboundBuffer::new(options.buffer_limits()),
            router: Router::new(options.no_echo),
            pongs: VecDeque::new(),
            pings_out: 0,
            close: None,
        };
        Self {
            options,
            creds,
            transport,
            shared: Mutex::new(shared),
            state_tx: watch::Sender::new(State::Disconnected),
            close_tx: watch::Sender::new(None),
            cancel: CancellationToken::new(),
            counters: Counters::default(),
            inbox_prefix: format!("{:016x}", rand::random::<u64>()),
            next_inbox: AtomicU64::new(1),
        }
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().await
    }

    pub(crate) fn set_state(&self, shared: &mut Shared, state: State) {
        if shared.state == state {
            return;
        }
        debug!(from = %shared.state, to = %state, "connection state change");
        shared.state = state;
        metrics::STATE_CHANGES
            .with_label_values(&[state.as_str()])
            .inc();
        self.state_tx.send_replace(state);
    }

    /// Fresh reply subject, unique within this process run.
    pub(crate) fn new_inbox(&self) -> String {
        let n = self.next_inbox.fetch_add(1, Ordering::Relaxed);
        format!("_INBOX.{}.{n}", self.inbox_prefix)
    }

    /// Open a link to `addr` and complete the connect handshake on it.
    pub(crate) async fn handshake(&self, addr: &str) -> Result<Established> {
        let timeout = self.options.connect_timeout;
        tokio::time::timeout(timeout, self.handshake_inner(addr))
            .await
            .map_err(|_| Error::Timeout(format!("handshake with {addr} took longer than {timeout:?}")))?
    }

    async fn handshake_inner(&self, addr: &str) -> Result<Established> {
        let mut link = self.transport.connect(addr).await?;
        let info = match link.rx.recv().await {
            Some(ServerOp::Info(info)) => info,
            Some(ServerOp::Err { message }) => return Err(server_error(message)),
            Some(op) => {
                return Err(Error::Protocol(format!("expected info frame, got {op:?}")));
            }
            None => return Err(Error::Network(format!("{addr} closed the link before info"))),
        };

        let sig = match (&self.creds, &info.nonce) {
            (Some(creds), Some(nonce)) => Some(creds.sign_challenge(nonce.as_bytes())?),
            (None, _) if info.auth_required => {
                return Err(Error::Auth(format!(
                    "server {} requires credentials",
                    info.server_id
                )));
            }
            _ => None,
        };
        let connect = ConnectInfo {
            name: self.options.name.clone(),
            echo: !self.options.no_echo,
            jwt: self.creds.as_ref().map(|c| c.jwt().to_owned()),
            sig,
            lang: LANG.to_owned(),
            version: env!("CARGO_PKG_VERSION").to_owned(),
        };
        let closed = || Error::Network(format!("{addr} closed the link during handshake"));
        link.tx
            .send(ClientOp::Connect(connect))
            .map_err(|_| closed())?;
        link.tx.send(ClientOp::Ping).map_err(|_| closed())?;

        // the server answers our ping only after accepting the connect
        loop {
            match link.rx.recv().await {
                Some(ServerOp::Pong) => break,
                Some(ServerOp::Ping) => link.tx.send(ClientOp::Pong).map_err(|_| closed())?,
                Some(ServerOp::Err { message }) => return Err(server_error(message)),
                Some(op) => trace!(?op, "ignoring frame during handshake"),
                None => return Err(closed()),
            }
        }
        debug!(%addr, client_id = info.client_id, server_id = %info.server_id, "handshake complete");
        Ok(Established {
            link,
            info,
            addr: addr.to_owned(),
        })
    }

    /// Initial connect: `connect_retry_max + 1` rounds over the server list.
    pub(crate) async fn establish_initial(&self) -> Result<Established> {
        let rounds = self.options.connect_retry_max.saturating_add(1);
        let mut last_err = None;
        for round in 0..rounds {
            for addr in &self.options.servers {
                match self.handshake(addr).await {
                    Ok(established) => {
                        info!(%addr, round, "connected");
                        return Ok(established);
                    }
                    Err(err) if err.is_terminal() => {
                        error!(%addr, %err, "connect rejected");
                        return Err(err);
                    }
                    Err(err) => {
                        warn!(%addr, round, %err, "connect attempt failed");
                        last_err = Some(err);
                    }
                }
            }
            if round + 1 < rounds {
                let delay = self.options.backoff(round);
                info!(?delay, next_round = round + 1, "retrying connect");
                tokio::time::sleep(delay).await;
            }
        }
        Err(Error::Network(match last_err {
            Some(err) => format!("unable to connect to any server: {err}"),
            None => "unable to connect to any server".into(),
        }))
    }

    /// Install a freshly established link. Re-registers subscriptions and
    /// flushes the reconnect buffer before anyone else can publish.
    pub(crate) async fn install(
        &self,
        established: Established,
    ) -> Result<mpsc::UnboundedReceiver<ServerOp>> {
        let Established { link, info, addr } = established;
        let mut shared = self.lock().await;
        if shared.state == State::Closed {
            return Err(Error::Closed);
        }
        let reconnect = shared.state == State::Reconnecting;

        for op in shared.router.interest() {
            link.tx
                .send(op)
                .map_err(|_| Error::Network(format!("{addr} went away while resubscribing")))?;
        }

        let before = shared.buffer.bytes();
        let pending: Vec<PendingPublish> = shared.buffer.drain().collect();
        let mut flushed = 0u64;
        let mut oversize = 0u64;
        let mut rest = pending.into_iter();
        while let Some(entry) = rest.next() {
            if info.max_payload > 0 && entry.payload.len() > info.max_payload {
                warn!(
                    subject = %entry.subject,
                    size = entry.payload.len(),
                    max_payload = info.max_payload,
                    "dropping buffered publish larger than server maximum"
                );
                oversize += 1;
                continue;
            }
            if link.tx.send(ClientOp::from(entry.clone())).is_err() {
                for entry in std::iter::once(entry).chain(rest) {
                    // everything fit before the drain so this cannot overflow
                    let _ = shared.buffer.enqueue(entry);
                }
                track_buffered_bytes(before, shared.buffer.bytes());
                self.count_oversize(oversize);
                return Err(Error::Network(format!(
                    "{addr} went away while flushing the reconnect buffer"
                )));
            }
            flushed += 1;
        }
        track_buffered_bytes(before, shared.buffer.bytes());
        self.count_oversize(oversize);
        if flushed > 0 {
            info!(flushed, %addr, "flushed reconnect buffer");
            Counters::add(&self.counters.flushed, flushed);
            metrics::FLUSHED.inc_by(flushed);
        }

        shared.client_id = Some(info.client_id);
        shared.server_info = Some(info);
        shared.link = Some(link.tx);
        self.set_state(&mut shared, State::Connected);
        if reconnect {
            Counters::add(&self.counters.reconnects, 1);
            metrics::RECONNECTS.inc();
            info!(%addr, "reconnected");
        }
        Ok(link.rx)
    }

    fn count_oversize(&self, dropped: u64) {
        if dropped > 0 {
            Counters::add(&self.counters.discarded, dropped);
            metrics::DISCARDED.inc_by(dropped);
        }
    }

    /// Serve links until closed, reconnecting whenever one is lost.
    pub(crate) async fn run(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<ServerOp>) {
        loop {
            let Some(err) = self.serve_link(&mut rx).await else {
                trace!("driver cancelled");
                return;
            };
            if err.is_terminal() {
                self.shutdown(Some(err)).await;
                return;
            }
            if !self.begin_reconnect(&err).await {
                return;
            }
            match self.reconnect().await {
                Ok(next) => rx = next,
                Err(err) => {
                    self.shutdown(Some(err)).await;
                    return;
                }
            }
        }
    }

    /// Pump one link. Returns the reason it was lost, or `None` when closed.
    async fn serve_link(&self, rx: &mut mpsc::UnboundedReceiver<ServerOp>) -> Option<Error> {
        let period = self.options.ping_interval;
        let mut keepalive = tokio::time::interval_at(Instant::now() + period, period);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                op = rx.recv() => match op {
                    Some(op) => {
                        if let Err(err) = self.handle_op(op).await {
                            return Some(err);
                        }
                    }
                    None => return Some(Error::Network("connection lost".into())),
                },
                _ = keepalive.tick() => {
                    if let Err(err) = self.keepalive().await {
                        return Some(err);
                    }
                }
            }
        }
    }

    async fn handle_op(&self, op: ServerOp) -> Result<()> {
        match op {
            ServerOp::Msg {
                subject,
                reply,
                payload,
                origin,
                queue_sids,
            } => {
                let msg = IncomingMessage {
                    subject,
                    reply,
                    payload,
                    origin,
                    queue_sids,
                };
                let dispatch = {
                    let shared = self.lock().await;
                    let own_id = shared.client_id.unwrap_or_default();
                    shared.router.dispatch_incoming(&msg, own_id)
                };
                if dispatch.echo_suppressed {
                    Counters::add(&self.counters.echo_suppressed, 1);
                    metrics::ECHO_SUPPRESSED.inc();
                    return Ok(());
                }
                // handlers run outside the lock so they may call back into the connection
                for delivery in dispatch.deliveries {
                    if delivery.deliver() {
                        Counters::add(&self.counters.delivered, 1);
                        metrics::DELIVERED.inc();
                    }
                }
            }
            ServerOp::Ping => self.lock().await.send(ClientOp::Pong)?,
            ServerOp::Pong => {
                let waiter = {
                    let mut shared = self.lock().await;
                    shared.pings_out = 0;
                    shared.pongs.pop_front()
                };
                if let Some(Some(tx)) = waiter {
                    let _ = tx.send(());
                }
            }
            ServerOp::Info(info) => {
                let mut shared = self.lock().await;
                debug!(server_id = %info.server_id, "server info updated");
                // the link keeps the id it was handed at connect
                let client_id = shared.client_id;
                shared.server_info = Some(ServerInfo {
                    client_id: client_id.unwrap_or(info.client_id),
                    ..info
                });
            }
            ServerOp::Ok => {}
            ServerOp::Err { message } => match server_error(message) {
                err @ Error::Auth(_) => return Err(err),
                err => warn!(%err, "server reported an error"),
            },
        }
        Ok(())
    }

    async fn keepalive(&self) -> Result<()> {
        let mut shared = self.lock().await;
        if shared.pings_out >= self.options.max_pings_out {
            warn!(
                outstanding = shared.pings_out,
                max_pings_out = self.options.max_pings_out,
                "stale connection"
            );
            return Err(Error::Network("stale connection".into()));
        }
        shared.send(ClientOp::Ping)?;
        shared.pongs.push_back(None);
        shared.pings_out += 1;
        trace!(outstanding = shared.pings_out, "keepalive ping");
        Ok(())
    }

    /// Move to `Reconnecting` after a lost link. Returns false if the
    /// connection was closed in the meantime.
    async fn begin_reconnect(&self, cause: &Error) -> bool {
        let mut shared = self.lock().await;
        if shared.state == State::Closed {
            return false;
        }
        warn!(%cause, "link lost, reconnecting");
        shared.link = None;
        shared.client_id = None;
        // pings on the dead link will never be answered
        shared.pongs.clear();
        shared.pings_out = 0;
        self.set_state(&mut shared, State::Reconnecting);
        true
    }

    async fn reconnect(&self) -> Result<mpsc::UnboundedReceiver<ServerOp>> {
        let max = self.options.max_reconnect_attempts;
        let mut attempts = 0usize;
        let mut round = 0u32;
        let mut last_err: Option<Error> = None;
        loop {
            for addr in &self.options.servers {
                if max.is_some_and(|max| attempts >= max) {
                    let cause = last_err
                        .as_ref()
                        .map_or_else(|| "no attempts allowed".to_owned(), Error::to_string);
                    error!(attempts, "giving up reconnecting");
                    return Err(Error::Network(format!(
                        "gave up after {attempts} reconnect attempts: {cause}"
                    )));
                }
                attempts += 1;

                let result = tokio::select! {
                    _ = self.cancel.cancelled() => return Err(Error::Closed),
                    result = self.handshake(addr) => result,
                };
                match result.map(|established| self.install(established)) {
                    Ok(install) => match install.await {
                        Ok(rx) => return Ok(rx),
                        Err(Error::Closed) => return Err(Error::Closed),
                        Err(err) => {
                            warn!(%addr, attempts, %err, "reconnect attempt failed");
                            last_err = Some(err);
                        }
                    },
                    Err(err) if err.is_terminal() => {
                        error!(%addr, %err, "reconnect rejected");
                        return Err(err);
                    }
                    Err(err) => {
                        warn!(%addr, attempts, %err, "reconnect attempt failed");
                        last_err = Some(err);
                    }
                }
            }

            let delay = self.options.backoff(round);
            round = round.saturating_add(1);
            debug!(?delay, attempts, "waiting before next reconnect round");
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(Error::Closed),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Move to `Closed`. Idempotent: later calls return the first report.
    pub(crate) async fn shutdown(&self, reason: Option<Error>) -> CloseReport {
        let mut shared = self.lock().await;
        if let Some(report) = &shared.close {
            return report.clone();
        }

        let before = shared.buffer.bytes();
        let discarded = shared.buffer.clear();
        track_buffered_bytes(before, 0);
        if discarded > 0 {
            warn!(discarded, "discarding buffered publishes on close");
            Counters::add(&self.counters.discarded, discarded as u64);
            metrics::DISCARDED.inc_by(discarded as u64);
        }
        shared.link = None;
        shared.client_id = None;
        shared.router.clear();
        shared.pongs.clear();
        shared.pings_out = 0;
        self.set_state(&mut shared, State::Closed);

        match &reason {
            Some(err) => error!(%err, discarded, "connection closed"),
            None => info!(discarded, "connection closed"),
        }
        let report = CloseReport { reason, discarded };
        shared.close = Some(report.clone());
        self.close_tx.send_replace(Some(report.clone()));
        drop(shared);

        self.cancel.cancel();
        report
    }
}

impl From<PendingPublish> for ClientOp {
    fn from(entry: PendingPublish) -> Self {
        ClientOp::Pub {
            subject: entry.subject,
            reply: entry.reply,
            payload: entry.payload,
        }
    }
}
