#![allow(dead_code)]

use std::{
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use courier_core::{
    async_trait,
    broker::Broker,
    connection::{ConnectOptions, Connection, State, Subscriber},
    creds::{self, Credentials, UserClaims},
    nkeys::KeyPair,
    router::Message,
    transport::{Link, MemoryTransport, Transport},
};

pub const WAIT: Duration = Duration::from_secs(3);

/// Options tuned for tests: quick backoff, no keepalive noise.
pub fn opts() -> ConnectOptions {
    ConnectOptions::new()
        .servers(["mem://a"])
        .reconnect_wait(Duration::from_millis(10), Duration::from_millis(50))
        .connect_timeout(Duration::from_secs(1))
        .ping_interval(Duration::from_secs(60))
        .max_reconnect_attempts(None)
}

pub async fn connect(broker: &Broker, opts: ConnectOptions) -> Connection {
    Connection::connect_with(opts, MemoryTransport::new(broker.clone()))
        .await
        .unwrap()
}

/// Next message or panic after [`WAIT`].
pub async fn next(sub: &mut Subscriber) -> Message {
    tokio::time::timeout(WAIT, sub.next())
        .await
        .expect("timed out waiting for a message")
        .expect("subscription ended")
}

/// Drain what is already queued on `sub`.
pub fn drain(sub: &mut Subscriber) -> Vec<Message> {
    std::iter::from_fn(|| sub.try_next()).collect()
}

pub async fn wait_for(conn: &Connection, state: State) {
    let reached = tokio::time::timeout(WAIT, conn.wait_for_state(state))
        .await
        .expect("timed out waiting for state");
    assert_eq!(reached, state);
}

/// Drop `conn`'s link while the broker refuses new ones.
pub async fn knock_out(broker: &Broker, conn: &Connection) {
    broker.set_accepting(false);
    let id = conn.connection_id().await.expect("connected");
    assert!(broker.kick(id));
    wait_for(conn, State::Reconnecting).await;
}

/// Counts connect attempts before handing off to the in-process broker.
#[derive(Debug, Clone)]
pub struct CountingTransport {
    inner: MemoryTransport,
    pub attempts: Arc<AtomicUsize>,
}

impl CountingTransport {
    pub fn new(broker: &Broker) -> Self {
        Self {
            inner: MemoryTransport::new(broker.clone()),
            attempts: Arc::default(),
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for CountingTransport {
    async fn connect(&self, addr: &str) -> courier_core::Result<Link> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.inner.connect(addr).await
    }
}

/// User credentials issued by `account`.
pub fn user_creds(account: &KeyPair, name: &str) -> (Credentials, String) {
    let user = KeyPair::new_user();
    let claims = UserClaims {
        iss: account.public_key(),
        sub: user.public_key(),
        name: name.to_owned(),
        ..Default::default()
    };
    let jwt = creds::encode_jwt(&claims, account).unwrap();
    let seed = user.seed().unwrap();
    let bundle = creds::format_bundle(&jwt, &seed);
    (Credentials::parse(&bundle).unwrap(), bundle)
}

/// Write `contents` to a file unique to this test process.
pub fn temp_file(name: &str, contents: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("courier-{}-{name}", std::process::id()));
    std::fs::write(&path, contents).unwrap();
    path
}
