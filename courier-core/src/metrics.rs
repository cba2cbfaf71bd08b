//! # metrics
//!
//! process-wide counters for every connection in this process
use lazy_static::lazy_static;
use prometheus::{
    Histogram, IntCounter, IntCounterVec, IntGauge, register_histogram, register_int_counter,
    register_int_counter_vec, register_int_gauge,
};

lazy_static! {
    /// publishes written to a live link
    pub static ref PUBLISHED: IntCounter = register_int_counter!("courier_published", "publishes sent on a live link").unwrap();
    /// publishes held in a reconnect buffer
    pub static ref BUFFERED: IntCounter = register_int_counter!("courier_buffered", "publishes held while reconnecting").unwrap();
    /// publishes refused because the buffer was full
    pub static ref BUFFER_REJECTED: IntCounter = register_int_counter!("courier_buffer_rejected", "publishes rejected by a full reconnect buffer").unwrap();
    /// publishes evicted by the drop-oldest policy or thrown away at close
    pub static ref DISCARDED: IntCounter = register_int_counter!("courier_discarded", "buffered publishes that were never sent").unwrap();
    /// buffered publishes written after a reconnect
    pub static ref FLUSHED: IntCounter = register_int_counter!("courier_flushed", "buffered publishes sent after reconnect").unwrap();
    /// bytes currently held across reconnect buffers
    pub static ref BUFFERED_BYTES: IntGauge = register_int_gauge!("courier_buffered_bytes", "bytes held in reconnect buffers").unwrap();

    /// handler invocations
    pub static ref DELIVERED: IntCounter = register_int_counter!("courier_delivered", "messages handed to subscriptions").unwrap();
    /// inbound messages dropped because they were our own publish
    pub static ref ECHO_SUPPRESSED: IntCounter = register_int_counter!("courier_echo_suppressed", "own publishes dropped by echo suppression").unwrap();

    /// successful reconnects
    pub static ref RECONNECTS: IntCounter = register_int_counter!("courier_reconnects", "successful reconnects").unwrap();
    /// state transitions by target state
    pub static ref STATE_CHANGES: IntCounterVec = register_int_counter_vec!(
        "courier_state_changes",
        "connection state transitions",
        &["state"]
    )
    .unwrap();

    /// request/reply round trip time
    pub static ref REQUEST_DURATION: Histogram = register_histogram!(
        "courier_request_duration",
        "request round trip (seconds), only counts answered requests"
    )
    .unwrap();
}
