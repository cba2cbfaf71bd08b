//! TCP transport. Frames are carried with [`FrameCodec`] and bridged onto the
//! link channels by a reader and a writer task.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Serialize, de::DeserializeOwned};
use tokio::{net::TcpStream, sync::mpsc};
use tokio_util::{codec::Framed, sync::CancellationToken};
use tracing::{debug, trace};

use super::{Link, Transport};
use crate::{
    error::{Error, Result},
    proto::{ClientOp, FrameCodec, ServerOp},
};

/// Port used when an address does not carry one.
pub const DEFAULT_PORT: u16 = 4222;

const SCHEMES: &[&str] = &["nats://", "tcp://", "courier://"];

/// Turn `nats://host[:port]` (or a bare `host[:port]`) into `host:port`.
pub fn socket_addr(addr: &str) -> Result<String> {
    let rest = SCHEMES
        .iter()
        .find_map(|scheme| addr.strip_prefix(scheme))
        .unwrap_or(addr)
        .trim_end_matches('/');
    if rest.is_empty() || rest.contains('/') {
        return Err(Error::Config(format!("invalid server address '{addr}'")));
    }
    // `[::1]:4222` and `host:4222` carry a port; a bare `[::1]` or `host` does not
    let has_port = match rest.rsplit_once(':') {
        Some((host, port)) => {
            !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()) && !host.ends_with(':')
        }
        None => false,
    };
    if has_port {
        Ok(rest.to_owned())
    } else {
        Ok(format!("{rest}:{DEFAULT_PORT}"))
    }
}

/// Plain TCP transport.
#[derive(Debug, Clone, Copy)]
pub struct TcpTransport {
    connect_timeout: Duration,
}

impl TcpTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, addr: &str) -> Result<Link> {
        let target = socket_addr(addr)?;
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&target))
            .await
            .map_err(|_| {
                Error::Network(format!(
                    "connect to {target} timed out after {:?}",
                    self.connect_timeout
                ))
            })?
            .map_err(|e| Error::Network(format!("connect to {target} failed: {e}")))?;
        if let Err(err) = stream.set_nodelay(true) {
            debug!(?err, "failed to set TCP_NODELAY");
        }
        debug!(%target, "tcp link established");

        let (in_tx, in_rx) = mpsc::unbounded_channel::<ServerOp>();
        let (out_tx, out_rx) = mpsc::unbounded_channel::<ClientOp>();
        bridge(stream, in_tx, out_rx);
        Ok(Link {
            tx: out_tx,
            rx: in_rx,
        })
    }
}

/// Pump frames between a socket and a pair of channels.
///
/// Frames read from the socket go to `inbound`; frames received on `outbound`
/// are written to the socket. When either side ends, both tasks stop and the
/// socket is dropped, so the channel peers observe the link going away.
pub(crate) fn bridge<W, R>(
    stream: TcpStream,
    inbound: mpsc::UnboundedSender<R>,
    mut outbound: mpsc::UnboundedReceiver<W>,
) where
    W: Serialize + Send + 'static,
    R: DeserializeOwned + Send + 'static,
{
    let (mut sink, mut frames) = Framed::new(stream, FrameCodec::<W, R>::new()).split();
    let token = CancellationToken::new();

    let writer_token = token.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = writer_token.cancelled() => break,
                op = outbound.recv() => match op {
                    Some(op) => {
                        if let Err(err) = sink.send(op).await {
                            debug!(?err, "socket write failed");
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
        let _ = sink.close().await;
        writer_token.cancel();
        trace!("socket writer finished");
    });

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                frame = frames.next() => match frame {
                    Some(Ok(op)) => {
                        if inbound.send(op).is_err() {
                            break;
                        }
                    }
                    Some(Err(err)) => {
                        debug!(?err, "socket read failed");
                        break;
                    }
                    None => break,
                }
            }
        }
        token.cancel();
        trace!("socket reader finished");
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_addr() {
        assert_eq!(socket_addr("nats://127.0.0.1:4222").unwrap(), "127.0.0.1:4222");
        assert_eq!(socket_addr("tcp://localhost").unwrap(), "localhost:4222");
        assert_eq!(socket_addr("demo.example.com:5222").unwrap(), "demo.example.com:5222");
        assert_eq!(socket_addr("nats://[::1]:4223").unwrap(), "[::1]:4223");
        assert_eq!(socket_addr("nats://host/").unwrap(), "host:4222");
        assert!(socket_addr("nats://").is_err());
        assert!(socket_addr("nats://host/path").is_err());
    }

    #[tokio::test]
    async fn test_connect_refused_is_network_error() {
        // bind then drop to get a port nothing listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = TcpTransport::new(Duration::from_secs(1));
        let err = transport.connect(&addr.to_string()).await.unwrap_err();
        assert!(matches!(err, Error::Network(_)));
    }
}
