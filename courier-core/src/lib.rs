//! # courier
//!
//! Core of a publish/subscribe messaging client: a connection manager that
//! reconnects and buffers publishes while the link is down, per-connection
//! echo suppression, the NKey/JWT credential handshake, and a subscription
//! router that honors queue groups.
#![warn(
    missing_debug_implementations,
    missing_copy_implementations,
    rust_2018_idioms,
    non_snake_case,
    non_upper_case_globals
)]
#![allow(clippy::cognitive_complexity)]
#![deny(rustdoc::broken_intra_doc_links)]
#![doc(test(
    no_crate_inject,
    attr(deny(warnings, rust_2018_idioms), allow(dead_code, unused_variables))
))]
pub use anyhow;
pub use async_trait::async_trait;
pub use bytes;
pub use nkeys;
pub use tokio;
pub use tracing;

pub mod broker;
pub mod buffer;
pub mod config;
pub mod connection;
pub mod creds;
pub mod error;
pub mod metrics;
pub mod prelude;
pub mod proto;
pub mod router;
pub mod subject;
pub mod transport;

pub use crate::{
    connection::{ConnectOptions, Connection, State},
    error::{Error, Result},
};
