//! Transports hand the connection manager a [`Link`] to one server address.
//! Framing and socket handling stay behind this seam.

use std::fmt;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{
    error::Result,
    proto::{ClientOp, ServerOp},
};

pub mod memory;
pub mod tcp;

pub use memory::MemoryTransport;
pub use tcp::TcpTransport;

/// An established byte-stream connection, seen as two frame channels.
///
/// The link is gone once `rx` yields `None` or a send on `tx` fails.
#[derive(Debug)]
pub struct Link {
    pub tx: mpsc::UnboundedSender<ClientOp>,
    pub rx: mpsc::UnboundedReceiver<ServerOp>,
}

/// Something that can open a [`Link`] to a server address.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug + 'static {
    /// Open a link to `addr`. Failures are reported as [`Error::Network`].
    ///
    /// CANCEL-SAFETY: the connection manager may drop this future when the
    /// connection is closed mid-attempt.
    ///
    /// [`Error::Network`]: crate::Error::Network
    async fn connect(&self, addr: &str) -> Result<Link>;
}
