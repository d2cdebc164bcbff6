//! Per-turn event bus: assigns the monotone sequence number that makes
//! a turn's event stream a total order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use dp_domain::event::{Event, EventBody};

#[derive(Clone)]
pub struct EventBus {
    turn_id: u64,
    seq: Arc<AtomicU64>,
    tx: mpsc::UnboundedSender<Event>,
}

impl EventBus {
    /// Create a bus and its subscriber end.
    pub fn channel(turn_id: u64) -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                turn_id,
                seq: Arc::new(AtomicU64::new(0)),
                tx,
            },
            rx,
        )
    }

    pub fn turn_id(&self) -> u64 {
        self.turn_id
    }

    /// Emit one event. Returns false when the subscriber is gone —
    /// emission never blocks and never fails the loop.
    pub fn emit(&self, body: EventBody) -> bool {
        let event = Event {
            turn_id: self.turn_id,
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
            body,
        };
        self.tx.send(event).is_ok()
    }
}
