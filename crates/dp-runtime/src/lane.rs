//! Per-session lane locks: turns on one session are strictly
//! sequential; a new user message enqueues behind the running turn.
//! Different sessions run concurrently.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

pub struct LaneMap {
    lanes: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl Default for LaneMap {
    fn default() -> Self {
        Self::new()
    }
}

impl LaneMap {
    pub fn new() -> Self {
        Self {
            lanes: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire the lane for a session; resolves when the prior turn
    /// reaches a terminal state. The permit is held for the duration
    /// of the turn and releases on drop.
    pub async fn acquire(&self, session_id: &str) -> OwnedSemaphorePermit {
        let lane = {
            let mut lanes = self.lanes.lock();
            lanes
                .entry(session_id.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(1)))
                .clone()
        };
        lane.acquire_owned()
            .await
            .expect("lane semaphore is never closed")
    }

    /// Drop lanes no turn currently holds.
    pub fn prune_idle(&self) {
        self.lanes.lock().retain(|_, sem| sem.available_permits() == 0);
    }

    pub fn lane_count(&self) -> usize {
        self.lanes.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_session_is_sequential() {
        let lanes = Arc::new(LaneMap::new());
        let first = lanes.acquire("s1").await;

        let lanes2 = lanes.clone();
        let waiter = tokio::spawn(async move {
            let _permit = lanes2.acquire("s1").await;
            true
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!waiter.is_finished(), "second turn must wait");

        drop(first);
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn different_sessions_run_concurrently() {
        let lanes = LaneMap::new();
        let _a = lanes.acquire("a").await;
        let _b = lanes.acquire("b").await;
        assert_eq!(lanes.lane_count(), 2);
    }

    #[tokio::test]
    async fn prune_drops_idle_lanes() {
        let lanes = LaneMap::new();
        {
            let _p = lanes.acquire("gone").await;
        }
        lanes.prune_idle();
        assert_eq!(lanes.lane_count(), 0);
    }
}
