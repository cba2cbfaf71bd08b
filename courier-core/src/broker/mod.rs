//! # Broker
//!
//! In-process broker used as the remote party for clients: hands out
//! nonces, authenticates, routes publishes to matching subscriptions, picks
//! one member per queue group and honors each client's echo preference.
//! It can run behind [`MemoryTransport`] or be served over TCP with
//! [`Broker::serve`].
//!
//! [`MemoryTransport`]: crate::transport::MemoryTransport
use std::{
    collections::{BTreeSet, HashMap},
    fmt, io,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use rand::seq::SliceRandom;
use tokio::{net::TcpListener, sync::mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::{
    error::{Error, Result},
    proto::{ClientId, ClientOp, ConnectInfo, ServerInfo, ServerOp, Sid},
    subject,
    transport::{Link, tcp::bridge},
};

pub mod auth;

pub use auth::AuthPolicy;

/// Default time a new link has to send its connect frame.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);
/// Default max payload advertised to clients.
pub const DEFAULT_MAX_PAYLOAD: usize = 1024 * 1024;

/// Broker settings.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub name: String,
    pub auth: AuthPolicy,
    pub max_payload: usize,
    pub handshake_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            name: "courier".into(),
            auth: AuthPolicy::None,
            max_payload: DEFAULT_MAX_PAYLOAD,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

#[derive(Debug)]
struct PeerSub {
    subject: String,
    queue: Option<String>,
}

struct Peer {
    tx: mpsc::UnboundedSender<ServerOp>,
    echo: bool,
    name: Option<String>,
    subs: HashMap<Sid, PeerSub>,
    kick: CancellationToken,
}

struct BrokerInner {
    config: BrokerConfig,
    server_id: String,
    next_client: AtomicU64,
    accepting: AtomicBool,
    peers: Mutex<HashMap<ClientId, Peer>>,
}

/// Cheaply cloneable handle to a running broker.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

impl fmt::Debug for Broker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broker")
            .field("server_id", &self.inner.server_id)
            .field("name", &self.inner.config.name)
            .field("accepting", &self.inner.accepting.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        let server_id = format!("{:016X}", rand::random::<u64>());
        Self {
            inner: Arc::new(BrokerInner {
                config,
                server_id,
                next_client: AtomicU64::new(1),
                accepting: AtomicBool::new(true),
                peers: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.inner.server_id
    }

    fn peers(&self) -> MutexGuard<'_, HashMap<ClientId, Peer>> {
        // routing state stays consistent even if a holder panicked
        self.inner
            .peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a new link. The `Info` frame is already queued on it.
    pub fn accept(&self) -> Result<Link> {
        if !self.inner.accepting.load(Ordering::Acquire) {
            return Err(Error::Network("broker is not accepting connections".into()));
        }
        let client_id = self.inner.next_client.fetch_add(1, Ordering::AcqRel);
        let nonce = self.inner.config.auth.nonce();

        let (to_client, client_rx) = mpsc::unbounded_channel();
        let (client_tx, from_client) = mpsc::unbounded_channel();

        let info = ServerInfo {
            server_id: self.inner.server_id.clone(),
            server_name: self.inner.config.name.clone(),
            version: env!("CARGO_PKG_VERSION").to_owned(),
            client_id,
            nonce: nonce.clone(),
            auth_required: self.inner.config.auth.required(),
            max_payload: self.inner.config.max_payload,
            connect_urls: Vec::new(),
        };
        // receiver is in hand, cannot fail
        let _ = to_client.send(ServerOp::Info(info));

        tokio::spawn(self.clone().session(client_id, nonce, to_client, from_client));
        Ok(Link {
            tx: client_tx,
            rx: client_rx,
        })
    }

    async fn session(
        self,
        client_id: ClientId,
        nonce: Option<String>,
        tx: mpsc::UnboundedSender<ServerOp>,
        mut rx: mpsc::UnboundedReceiver<ClientOp>,
    ) {
        let connect = match tokio::time::timeout(self.inner.config.handshake_timeout, rx.recv())
            .await
        {
            Ok(Some(ClientOp::Connect(connect))) => connect,
            Ok(Some(op)) => {
                debug!(client_id, ?op, "expected connect as first frame");
                let _ = tx.send(ServerOp::err("expected connect"));
                return;
            }
            Ok(None) => return,
            Err(_) => {
                debug!(client_id, "handshake timed out");
                let _ = tx.send(ServerOp::err("handshake timeout"));
                return;
            }
        };

        if let Err(err) = self.inner.config.auth.authorize(&connect, nonce.as_deref()) {
            warn!(client_id, name = ?connect.name, %err, "rejecting client");
            let _ = tx.send(ServerOp::err(format!("authorization violation: {err}")));
            return;
        }

        let kick = self.register(client_id, &connect, tx);
        info!(client_id, name = ?connect.name, echo = connect.echo, "client connected");

        loop {
            tokio::select! {
                _ = kick.cancelled() => break,
                op = rx.recv() => match op {
                    Some(op) => self.handle(client_id, op),
                    None => break,
                }
            }
        }

        self.peers().remove(&client_id);
        debug!(client_id, "client disconnected");
    }

    fn register(
        &self,
        client_id: ClientId,
        connect: &ConnectInfo,
        tx: mpsc::UnboundedSender<ServerOp>,
    ) -> CancellationToken {
        let kick = CancellationToken::new();
        self.peers().insert(
            client_id,
            Peer {
                tx,
                echo: connect.echo,
                name: connect.name.clone(),
                subs: HashMap::new(),
                kick: kick.clone(),
            },
        );
        kick
    }

    fn send_to(&self, client_id: ClientId, op: ServerOp) {
        if let Some(peer) = self.peers().get(&client_id) {
            let _ = peer.tx.send(op);
        }
    }

    fn handle(&self, client_id: ClientId, op: ClientOp) {
        match op {
            ClientOp::Pub {
                subject,
                reply,
                payload,
            } => {
                if payload.len() > self.inner.config.max_payload {
                    self.send_to(client_id, ServerOp::err("maximum payload exceeded"));
                    return;
                }
                if subject::validate_subject(&subject).is_err() {
                    self.send_to(client_id, ServerOp::err("invalid subject"));
                    return;
                }
                self.route(client_id, &subject, reply, payload);
            }
            ClientOp::Sub {
                sid,
                subject,
                queue,
            } => {
                if subject::validate_pattern(&subject).is_err() {
                    self.send_to(client_id, ServerOp::err("invalid subject"));
                    return;
                }
                trace!(client_id, sid, %subject, ?queue, "sub");
                if let Some(peer) = self.peers().get_mut(&client_id) {
                    peer.subs.insert(sid, PeerSub { subject, queue });
                }
            }
            ClientOp::Unsub { sid } => {
                if let Some(peer) = self.peers().get_mut(&client_id) {
                    peer.subs.remove(&sid);
                }
            }
            ClientOp::Ping => self.send_to(client_id, ServerOp::Pong),
            ClientOp::Pong => {}
            ClientOp::Connect(_) => {
                self.send_to(client_id, ServerOp::err("already connected"));
            }
        }
    }

    /// Deliver one publish. Plain subscribers each get it; every queue group
    /// gets it once, on a member picked at random.
    fn route(&self, origin: ClientId, subject: &str, reply: Option<String>, payload: Bytes) {
        let peers = self.peers();

        let mut plain = BTreeSet::new();
        // members of one group may subscribe with different, overlapping patterns
        let mut groups: HashMap<&str, Vec<(ClientId, Sid)>> = HashMap::new();
        for (client_id, peer) in peers.iter() {
            if *client_id == origin && !peer.echo {
                continue;
            }
            for (sid, sub) in &peer.subs {
                if !subject::matches(&sub.subject, subject) {
                    continue;
                }
                match &sub.queue {
                    None => {
                        plain.insert(*client_id);
                    }
                    Some(queue) => groups
                        .entry(queue.as_str())
                        .or_default()
                        .push((*client_id, *sid)),
                }
            }
        }

        let mut picked: HashMap<ClientId, Vec<Sid>> = HashMap::new();
        let mut rng = rand::thread_rng();
        for members in groups.values() {
            if let Some((client_id, sid)) = members.choose(&mut rng) {
                picked.entry(*client_id).or_default().push(*sid);
            }
        }

        let receivers: BTreeSet<ClientId> = plain.into_iter().chain(picked.keys().copied()).collect();
        trace!(origin, subject, receivers = receivers.len(), "routing publish");
        for client_id in receivers {
            let Some(peer) = peers.get(&client_id) else {
                continue;
            };
            let op = ServerOp::Msg {
                subject: subject.to_owned(),
                reply: reply.clone(),
                payload: payload.clone(),
                origin,
                queue_sids: picked.remove(&client_id).unwrap_or_default(),
            };
            if peer.tx.send(op).is_err() {
                trace!(client_id, "peer went away mid-route");
            }
        }
    }

    /// Stop or resume accepting new links.
    pub fn set_accepting(&self, accepting: bool) {
        info!(accepting, "broker accept state changed");
        self.inner.accepting.store(accepting, Ordering::Release);
    }

    /// Drop one client's link.
    pub fn kick(&self, client_id: ClientId) -> bool {
        match self.peers().remove(&client_id) {
            Some(peer) => {
                peer.kick.cancel();
                true
            }
            None => false,
        }
    }

    /// Drop every client link.
    pub fn disconnect_all(&self) -> usize {
        let peers: Vec<Peer> = self.peers().drain().map(|(_, peer)| peer).collect();
        for peer in &peers {
            peer.kick.cancel();
        }
        info!(count = peers.len(), "disconnected all clients");
        peers.len()
    }

    /// Number of authenticated clients.
    pub fn client_count(&self) -> usize {
        self.peers().len()
    }

    /// Names clients gave in their connect frame, by id.
    pub fn clients(&self) -> Vec<(ClientId, Option<String>)> {
        let mut clients: Vec<_> = self
            .peers()
            .iter()
            .map(|(id, peer)| (*id, peer.name.clone()))
            .collect();
        clients.sort_unstable_by_key(|(id, _)| *id);
        clients
    }

    /// Total subscriptions held across clients.
    pub fn subscription_count(&self) -> usize {
        self.peers().values().map(|peer| peer.subs.len()).sum()
    }

    /// Accept TCP clients until `token` is cancelled.
    pub async fn serve(self, listener: TcpListener, token: CancellationToken) -> io::Result<()> {
        info!(addr = ?listener.local_addr()?, server_id = %self.inner.server_id, "broker listening");
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    self.disconnect_all();
                    info!("broker shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => match self.accept() {
                        Ok(link) => {
                            debug!(?peer, "accepted tcp client");
                            if let Err(err) = stream.set_nodelay(true) {
                                debug!(?err, "failed to set TCP_NODELAY");
                            }
                            bridge::<ServerOp, ClientOp>(stream, link.tx, link.rx);
                        }
                        Err(err) => debug!(?peer, %err, "refusing tcp client"),
                    },
                    Err(err) => error!(?err, "failed to accept tcp client"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tracing_test::traced_test;

    use super::*;

    async fn connect(broker: &Broker, echo: bool) -> (ClientId, Link) {
        let mut link = broker.accept().unwrap();
        let Some(ServerOp::Info(info)) = link.rx.recv().await else {
            panic!("expected info");
        };
        link.tx
            .send(ClientOp::Connect(ConnectInfo {
                name: None,
                echo,
                jwt: None,
                sig: None,
                lang: "rust".into(),
                version: "test".into(),
            }))
            .unwrap();
        link.tx.send(ClientOp::Ping).unwrap();
        assert_eq!(link.rx.recv().await, Some(ServerOp::Pong));
        (info.client_id, link)
    }

    async fn round_trip(link: &mut Link) -> Vec<ServerOp> {
        link.tx.send(ClientOp::Ping).unwrap();
        let mut ops = Vec::new();
        loop {
            match link.rx.recv().await.unwrap() {
                ServerOp::Pong => return ops,
                op => ops.push(op),
            }
        }
    }

    fn publish(link: &Link, subject: &str) {
        link.tx
            .send(ClientOp::Pub {
                subject: subject.into(),
                reply: None,
                payload: Bytes::from_static(b"hello"),
            })
            .unwrap();
    }

    #[tokio::test]
    async fn test_routes_to_plain_subscribers() {
        let broker = Broker::default();
        let (_, mut a) = connect(&broker, true).await;
        let (_, mut b) = connect(&broker, true).await;
        a.tx.send(ClientOp::Sub {
            sid: 1,
            subject: "orders.*".into(),
            queue: None,
        })
        .unwrap();
        round_trip(&mut a).await;

        publish(&b, "orders.new");
        round_trip(&mut b).await;
        let ops = round_trip(&mut a).await;
        assert_eq!(ops.len(), 1);
        assert!(matches!(&ops[0], ServerOp::Msg { subject, queue_sids, .. } if subject == "orders.new" && queue_sids.is_empty()));
    }

    #[tokio::test]
    async fn test_no_echo_skips_origin() {
        let broker = Broker::default();
        let (_, mut a) = connect(&broker, false).await;
        a.tx.send(ClientOp::Sub {
            sid: 1,
            subject: "x".into(),
            queue: None,
        })
        .unwrap();
        publish(&a, "x");
        assert!(round_trip(&mut a).await.is_empty());
    }

    #[tokio::test]
    async fn test_queue_group_gets_one_copy() {
        let broker = Broker::default();
        let mut members = Vec::new();
        for _ in 0..3 {
            let (_, mut link) = connect(&broker, true).await;
            link.tx
                .send(ClientOp::Sub {
                    sid: 1,
                    subject: "jobs".into(),
                    queue: Some("workers".into()),
                })
                .unwrap();
            round_trip(&mut link).await;
            members.push(link);
        }
        let (_, mut publisher) = connect(&broker, true).await;
        for _ in 0..20 {
            publish(&publisher, "jobs");
        }
        round_trip(&mut publisher).await;

        let mut total = 0;
        for link in &mut members {
            let ops = round_trip(link).await;
            for op in &ops {
                assert!(matches!(op, ServerOp::Msg { queue_sids, .. } if queue_sids == &vec![1]));
            }
            total += ops.len();
        }
        assert_eq!(total, 20);
    }

    #[tokio::test]
    async fn test_not_accepting() {
        let broker = Broker::default();
        broker.set_accepting(false);
        assert!(matches!(broker.accept(), Err(Error::Network(_))));
        broker.set_accepting(true);
        assert!(broker.accept().is_ok());
    }

    #[tokio::test]
    async fn test_kick_closes_link() {
        let broker = Broker::default();
        let (id, mut link) = connect(&broker, true).await;
        assert_eq!(broker.client_count(), 1);
        assert!(broker.kick(id));
        assert_eq!(link.rx.recv().await, None);
        assert_eq!(broker.client_count(), 0);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_rejects_missing_credentials() {
        let broker = Broker::new(BrokerConfig {
            auth: AuthPolicy::Jwt {
                trusted_issuers: vec![],
            },
            ..Default::default()
        });
        let mut link = broker.accept().unwrap();
        let Some(ServerOp::Info(info)) = link.rx.recv().await else {
            panic!("expected info");
        };
        assert!(info.auth_required);
        assert!(info.nonce.is_some());
        link.tx
            .send(ClientOp::Connect(ConnectInfo {
                name: None,
                echo: true,
                jwt: None,
                sig: None,
                lang: "rust".into(),
                version: "test".into(),
            }))
            .unwrap();
        let Some(ServerOp::Err { message }) = link.rx.recv().await else {
            panic!("expected err");
        };
        assert!(message.starts_with("authorization violation"));
        assert_eq!(link.rx.recv().await, None);
        assert!(logs_contain("rejecting client"));
    }
}
