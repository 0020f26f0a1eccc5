//! Per-id async FIFO queue.
//!
//! [`AsyncIdQueue`] keeps one lane per correlation id. Each lane has a
//! single consumer that [`pull`](AsyncIdQueue::pull)s items in order;
//! closing a lane wakes that consumer with the close reason.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use crate::error::{PeerError, Result};

struct LaneState<T> {
    items: VecDeque<T>,
    closed: Option<PeerError>,
}

struct Lane<T> {
    state: Mutex<LaneState<T>>,
    notify: Notify,
}

impl<T> Lane<T> {
    fn new() -> Self {
        Self {
            state: Mutex::new(LaneState {
                items: VecDeque::new(),
                closed: None,
            }),
            notify: Notify::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, LaneState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn close(&self, reason: PeerError) {
        let mut state = self.state();
        state.items.clear();
        state.closed = Some(reason);
        drop(state);
        self.notify.notify_waiters();
    }
}

/// FIFO queues keyed by correlation id.
pub struct AsyncIdQueue<T> {
    lanes: Mutex<HashMap<String, Arc<Lane<T>>>>,
}

impl<T> AsyncIdQueue<T> {
    pub fn new() -> Self {
        Self {
            lanes: Mutex::new(HashMap::new()),
        }
    }

    fn lanes(&self) -> MutexGuard<'_, HashMap<String, Arc<Lane<T>>>> {
        self.lanes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of open lanes.
    pub fn len(&self) -> usize {
        self.lanes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lanes().is_empty()
    }

    /// Open the lane for `id`. Opening an open lane is a no-op.
    pub fn open(&self, id: &str) {
        self.lanes()
            .entry(id.to_owned())
            .or_insert_with(|| Arc::new(Lane::new()));
    }

    pub fn is_open(&self, id: &str) -> bool {
        self.lanes().contains_key(id)
    }

    /// Push an item onto the lane for `id`.
    ///
    /// Returns `false` (dropping the item) when the lane is not open.
    pub fn push(&self, id: &str, item: T) -> bool {
        let Some(lane) = self.lanes().get(id).cloned() else {
            return false;
        };
        lane.state().items.push_back(item);
        lane.notify.notify_one();
        true
    }

    /// Pull the next item from the lane for `id`, waiting if it is empty.
    ///
    /// # Errors
    ///
    /// - [`PeerError::NotOpen`] if the lane is not open when called
    /// - the close reason if the lane is closed while waiting
    pub async fn pull(&self, id: &str) -> Result<T> {
        let lane = self
            .lanes()
            .get(id)
            .cloned()
            .ok_or_else(|| PeerError::NotOpen { id: id.to_owned() })?;

        loop {
            // Registered before the state check so a close in between still wakes us.
            let notified = lane.notify.notified();
            {
                let mut state = lane.state();
                if let Some(item) = state.items.pop_front() {
                    return Ok(item);
                }
                if let Some(reason) = &state.closed {
                    return Err(reason.clone());
                }
            }
            notified.await;
        }
    }

    /// Close the lane for `id`, or every lane when `id` is `None`.
    ///
    /// Pending and future pulls on a closed lane fail with `reason`, or with
    /// [`PeerError::Closed`] when no reason is given. Queued items are dropped.
    pub fn close(&self, id: Option<&str>, reason: Option<PeerError>) {
        let closed: Vec<(String, Arc<Lane<T>>)> = {
            let mut lanes = self.lanes();
            match id {
                Some(id) => lanes.remove_entry(id).into_iter().collect(),
                None => lanes.drain().collect(),
            }
        };

        for (id, lane) in closed {
            let reason = reason.clone().unwrap_or(PeerError::Closed { id });
            lane.close(reason);
        }
    }
}

impl<T> Default for AsyncIdQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for AsyncIdQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncIdQueue")
            .field("open", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_push_then_pull_in_order() {
        let queue = AsyncIdQueue::new();
        queue.open("1");
        assert!(queue.push("1", "a"));
        assert!(queue.push("1", "b"));

        assert_eq!(queue.pull("1").await.unwrap(), "a");
        assert_eq!(queue.pull("1").await.unwrap(), "b");
    }

    #[tokio::test]
    async fn test_push_to_closed_lane_is_dropped() {
        let queue = AsyncIdQueue::new();
        assert!(!queue.push("1", 1));
        assert!(!queue.is_open("1"));
    }

    #[tokio::test]
    async fn test_pull_not_open() {
        let queue = AsyncIdQueue::<u8>::new();
        let err = queue.pull("x").await.unwrap_err();
        assert!(matches!(err, PeerError::NotOpen { id } if id == "x"));
    }

    #[tokio::test]
    async fn test_pull_waits_for_push() {
        let queue = Arc::new(AsyncIdQueue::new());
        queue.open("1");

        let puller = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pull("1").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.push("1", 42);

        assert_eq!(puller.await.unwrap().unwrap(), 42);
    }

    #[tokio::test]
    async fn test_close_rejects_pending_pull() {
        let queue = Arc::new(AsyncIdQueue::<u8>::new());
        queue.open("1");
        queue.open("2");

        let puller = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pull("1").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.close(Some("1"), None);

        let err = puller.await.unwrap().unwrap_err();
        assert!(matches!(err, PeerError::Closed { id } if id == "1"));
        assert!(!queue.is_open("1"));
        assert!(queue.is_open("2"));
    }

    #[tokio::test]
    async fn test_close_all_with_reason() {
        let queue = Arc::new(AsyncIdQueue::<u8>::new());
        queue.open("1");
        queue.open("2");

        let pullers: Vec<_> = ["1", "2"]
            .into_iter()
            .map(|id| {
                let queue = queue.clone();
                tokio::spawn(async move { queue.pull(id).await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.close(None, Some(PeerError::aborted("shutdown")));

        for puller in pullers {
            assert!(puller.await.unwrap().unwrap_err().is_aborted());
        }
        assert!(queue.is_empty());
    }
}
