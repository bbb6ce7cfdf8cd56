//! # taskherd
//!
//! **Taskherd** coordinates periodic tasks across a fleet of peer nodes so
//! that, for every registered task, at most one node is actively running it
//! at any time, while the cluster stays available under node joins,
//! crashes, network hiccups and clock skew.
//!
//! Coordination flows entirely through one shared append-only log topic
//! used as a broadcast bus: nodes publish small typed signals and everyone
//! observes them in the log's total order. Log offsets are the only
//! authoritative fact in claim arbitration; local clocks only drive
//! timeouts.
//!
//! | Area               | Description                                              | Key types / traits                       |
//! |--------------------|----------------------------------------------------------|------------------------------------------|
//! | **Node**           | Lifecycle owner; registry, run/shutdown.                 | [`Node`]                                 |
//! | **Tasks**          | Job bodies and timing contracts.                         | [`Job`], [`JobFn`], [`TaskDefinition`]   |
//! | **Signals**        | Typed records on the sync topic.                         | [`Signal`], [`SignalKind`], [`Sender`]   |
//! | **Log port**       | The boundary to the shared log.                          | [`log::LogClient`], [`log::memory::MemoryLog`] |
//! | **Timers**         | Named future actions, replace-by-name.                   | [`PendingHandler`]                       |
//! | **Observability**  | In-process event bus and subscribers.                    | [`Event`], [`Bus`], [`Subscribe`]        |
//! | **Errors**         | Runtime and job error taxonomies.                        | [`NodeError`], [`JobError`]              |
//!
//! ## Example
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//! use taskherd::{Config, Node, SystemClock, TaskDefinition};
//! use taskherd::log::memory::MemoryLog;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let topic = MemoryLog::new("task-sync");
//!     let node = Node::new(
//!         Config::default(),
//!         Arc::new(topic.client()),
//!         Arc::new(SystemClock),
//!     );
//!     node.run().await?;
//!
//!     node.register(
//!         TaskDefinition::builder("tick")
//!             .with_period(Duration::from_secs(5))
//!             .build_fn(|_ctx: CancellationToken| async {
//!                 println!("tick");
//!                 Ok(())
//!             }),
//!     )
//!     .await?;
//!
//!     tokio::time::sleep(Duration::from_secs(30)).await;
//!     node.shutdown().await;
//!     Ok(())
//! }
//! ```

mod clock;
mod config;
mod error;
mod machine;

pub mod core;
pub mod events;
pub mod log;
pub mod node;
pub mod pending;
pub mod signals;
pub mod tasks;

// ---- Public re-exports ----

pub use clock::{Clock, ClockRef, FixedClock, SystemClock};
pub use config::{BackoffPolicy, Config};
pub use error::{JobError, NodeError};
pub use events::{Bus, Event, EventKind, LogWriter, Subscribe};
pub use log::{LogRecord, Offset, StartPosition};
pub use node::info::{NodeTaskInformation, TaskInformation};
pub use node::Node;
pub use pending::PendingHandler;
pub use signals::{Sender, Signal, SignalKind};
pub use tasks::{
    BoxJobFuture, Job, JobFn, JobRef, TaskDefinition, TaskDefinitionBuilder, TaskSnapshot,
    TaskState,
};
