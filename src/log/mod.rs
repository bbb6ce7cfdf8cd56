//! # Sync-topic port.
//!
//! The coordination protocol runs entirely over one partitioned,
//! offset-addressable, at-least-once log topic. This module is the boundary
//! to that log: the runtime consumes the [`LogClient`] / [`LogProducer`] /
//! [`LogConsumer`] traits and never a concrete client.
//!
//! ## Contract
//! - Records carry a partition key; records with the same key are observed by
//!   every consumer in one total order. Task signals are keyed by task name,
//!   node-info documents by node id.
//! - Offsets are assigned by the log and strictly increase per partition; the
//!   protocol uses them as its only authoritative ordering fact.
//! - Delivery is at-least-once; consumers may rewind and re-observe records.
//!
//! [`memory::MemoryLog`] is the in-tree implementation used by the
//! simulation tests and demos.

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Log offset of a record within its partition.
pub type Offset = u64;

/// One consumed record.
#[derive(Clone, Debug)]
pub struct LogRecord {
    /// Offset assigned by the log.
    pub offset: Offset,
    /// Partition key (task name or node id).
    pub key: String,
    /// Serialized payload.
    pub value: String,
}

/// Where a fresh consumer is positioned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartPosition {
    /// Before the oldest retained record.
    Earliest,
    /// After the newest record at subscription time.
    Latest,
}

/// Errors surfaced by the log client.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum LogError {
    /// A publish did not complete; retrying may succeed.
    #[error("produce to '{topic}' failed: {reason}")]
    Produce {
        /// Topic name.
        topic: String,
        /// Client-reported cause.
        reason: String,
    },

    /// A fetch did not complete; retrying may succeed.
    #[error("fetch from '{topic}' failed: {reason}")]
    Fetch {
        /// Topic name.
        topic: String,
        /// Client-reported cause.
        reason: String,
    },

    /// The client is permanently unusable (closed, unauthorized, bad topic).
    #[error("log client for '{topic}' failed fatally: {reason}")]
    Fatal {
        /// Topic name.
        reason: String,
        /// Client-reported cause.
        topic: String,
    },
}

impl LogError {
    /// True when the operation may be retried with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, LogError::Produce { .. } | LogError::Fetch { .. })
    }
}

/// Factory for producer and consumer handles on the sync topic.
#[async_trait]
pub trait LogClient: Send + Sync {
    /// Name of the sync topic this client is bound to.
    fn topic(&self) -> &str;

    /// Creates a producer handle. Producers are internally thread-safe.
    async fn producer(&self) -> Result<Box<dyn LogProducer>, LogError>;

    /// Creates a consumer positioned per `start`.
    async fn consumer(&self, start: StartPosition) -> Result<Box<dyn LogConsumer>, LogError>;
}

/// Publishes records to the sync topic.
#[async_trait]
pub trait LogProducer: Send + Sync {
    /// Appends one record, returning its assigned offset.
    async fn send(&self, key: &str, value: String) -> Result<Offset, LogError>;
}

/// Tails the sync topic. One consumer is owned by one loop; the trait is
/// deliberately `&mut self`.
#[async_trait]
pub trait LogConsumer: Send {
    /// Waits up to `timeout` for records past the current position. An empty
    /// batch is a normal poll expiry, not an error.
    async fn poll(&mut self, timeout: Duration) -> Result<Vec<LogRecord>, LogError>;

    /// Offset of the next record this consumer will observe.
    fn position(&self) -> Offset;

    /// Moves the read position (used for history replay).
    fn seek(&mut self, offset: Offset);

    /// Offset one past the newest record currently in the topic.
    async fn end_offset(&mut self) -> Result<Offset, LogError>;
}
