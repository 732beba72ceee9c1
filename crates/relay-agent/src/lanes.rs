//! Concurrency-limited FIFO scheduling across named lanes.

use crate::LaneError;
use futures::FutureExt;
use futures::future::BoxFuture;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::debug;

const DEFAULT_LANE_CONCURRENCY: usize = 1;

struct LaneState {
    max_concurrent: usize,
    active: usize,
    pending: VecDeque<BoxFuture<'static, ()>>,
}

impl Default for LaneState {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_LANE_CONCURRENCY,
            active: 0,
            pending: VecDeque::new(),
        }
    }
}

/// Tasks in one lane are admitted in enqueue order, at most
/// `max_concurrent` at a time; lanes never block each other.
#[derive(Clone, Default)]
pub struct CommandQueue {
    lanes: Arc<Mutex<HashMap<String, LaneState>>>,
}

/// Resolves with the task's own output once it has run.
pub struct LaneTicket<T> {
    rx: oneshot::Receiver<Result<T, LaneError>>,
}

impl<T> Future for LaneTicket<T> {
    type Output = Result<T, LaneError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(LaneError::Discarded)))
    }
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits<'a>(limits: impl IntoIterator<Item = (&'a String, &'a usize)>) -> Self {
        let queue = Self::new();
        for (lane, limit) in limits {
            queue.set_lane_concurrency(lane, *limit);
        }
        queue
    }

    /// Clamps to at least one and immediately admits queued work that now fits.
    pub fn set_lane_concurrency(&self, lane: &str, max_concurrent: usize) {
        self.lock()
            .entry(lane.to_string())
            .or_default()
            .max_concurrent = max_concurrent.max(1);
        self.pump(lane);
    }

    pub fn lane_concurrency(&self, lane: &str) -> usize {
        self.lock()
            .get(lane)
            .map_or(DEFAULT_LANE_CONCURRENCY, |state| state.max_concurrent)
    }

    /// Queues `task` on `lane`. The task is enqueued before this returns, so
    /// admission order follows call order even if the ticket is awaited later.
    pub fn enqueue<F, T>(&self, lane: &str, task: F) -> LaneTicket<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let queue = self.clone();
        let lane_name = lane.to_string();
        let job = async move {
            let outcome = tokio::spawn(task)
                .await
                .map_err(|error| LaneError::TaskPanicked(error.to_string()));
            queue.release(&lane_name);
            let _ = tx.send(outcome);
        }
        .boxed();

        let queued = {
            let mut lanes = self.lock();
            let state = lanes.entry(lane.to_string()).or_default();
            state.pending.push_back(job);
            state.pending.len()
        };
        debug!(lane, queued, "task enqueued");
        self.pump(lane);
        LaneTicket { rx }
    }

    /// Queued-but-not-started plus in-flight tasks.
    pub fn queue_size(&self, lane: &str) -> usize {
        self.lock()
            .get(lane)
            .map_or(0, |state| state.pending.len() + state.active)
    }

    pub fn active_count(&self, lane: &str) -> usize {
        self.lock().get(lane).map_or(0, |state| state.active)
    }

    /// Drops tasks that have not started; their tickets resolve to
    /// [`LaneError::Discarded`]. Running tasks are unaffected.
    pub fn clear_lane(&self, lane: &str) -> usize {
        let discarded: Vec<_> = match self.lock().get_mut(lane) {
            Some(state) => state.pending.drain(..).collect(),
            None => Vec::new(),
        };
        if !discarded.is_empty() {
            debug!(lane, discarded = discarded.len(), "lane cleared");
        }
        discarded.len()
    }

    fn release(&self, lane: &str) {
        if let Some(state) = self.lock().get_mut(lane) {
            state.active = state.active.saturating_sub(1);
        }
        self.pump(lane);
    }

    fn pump(&self, lane: &str) {
        let admitted: Vec<_> = {
            let mut lanes = self.lock();
            let Some(state) = lanes.get_mut(lane) else {
                return;
            };
            let mut admitted = Vec::new();
            while state.active < state.max_concurrent {
                let Some(job) = state.pending.pop_front() else {
                    break;
                };
                state.active += 1;
                admitted.push(job);
            }
            admitted
        };
        for job in admitted {
            tokio::spawn(job);
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, LaneState>> {
        self.lanes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
