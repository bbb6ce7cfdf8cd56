//! # Event bus for broadcasting runtime events.
//!
//! Thin wrapper around [`tokio::sync::broadcast`]. Every component that
//! wants to narrate progress publishes here; any number of subscribers
//! observe independently. Events are best-effort: with no subscribers, or a
//! full channel, they are dropped; the node runs fine unobserved.

use tokio::sync::broadcast;

use super::event::Event;

/// Broadcast channel for runtime events.
#[derive(Clone)]
pub struct Bus {
    tx: broadcast::Sender<Event>,
}

impl Bus {
    /// Creates a bus with the given channel capacity. When capacity is
    /// exceeded, the oldest undelivered events are dropped per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publishes an event to all current subscribers (non-blocking).
    pub fn publish(&self, ev: Event) {
        let _ = self.tx.send(ev);
    }

    /// Creates a receiver for all events published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}
