//! courier prelude

pub use crate::{
    anyhow::{self, Context},
    async_trait,
    broker::{AuthPolicy, Broker, BrokerConfig},
    buffer::OverflowPolicy,
    bytes::Bytes,
    connection::{
        CloseReport, ConnectOptions, Connection, State, Statistics, Subscriber, SubscriptionHandle,
    },
    creds::Credentials,
    error::{Error, Result},
    router::{Handler, Message},
    tokio,
    tracing::{self, debug, error, info, instrument, trace, warn},
    transport::{MemoryTransport, TcpTransport, Transport},
};

pub use std::{sync::Arc, time::Duration};
