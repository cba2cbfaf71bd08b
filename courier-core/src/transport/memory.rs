//! In-process transport. Links go straight to a [`Broker`] without touching
//! a socket.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;

use super::{Link, Transport};
use crate::{
    broker::Broker,
    error::{Error, Result},
};

/// Routes server addresses to in-process brokers.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    routes: Arc<HashMap<String, Broker>>,
    fallback: Option<Broker>,
}

impl MemoryTransport {
    /// Every address resolves to `broker`.
    pub fn new(broker: Broker) -> Self {
        Self {
            routes: Arc::default(),
            fallback: Some(broker),
        }
    }

    /// Resolve `addr` to `broker`. Addresses not routed fail to connect
    /// unless a fallback broker was given to [`MemoryTransport::new`].
    pub fn route(mut self, addr: impl Into<String>, broker: Broker) -> Self {
        Arc::make_mut(&mut self.routes).insert(addr.into(), broker);
        self
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, addr: &str) -> Result<Link> {
        let broker = self
            .routes
            .get(addr)
            .or(self.fallback.as_ref())
            .ok_or_else(|| Error::Network(format!("no broker at '{addr}'")))?;
        broker.accept()
    }
}
