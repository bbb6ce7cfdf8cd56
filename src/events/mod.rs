//! # In-process observability: events, bus, subscribers.

mod bus;
mod event;
mod subscriber;

pub use bus::Bus;
pub use event::{Event, EventKind};
pub use subscriber::{LogWriter, Subscribe};
