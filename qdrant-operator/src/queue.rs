//! The per-resource work queue: debounced scheduling, single-flight
//! dispatch.
//!
//! Every reconcile trigger (watch event, retry, resync sweep) lands here as
//! an [`Enqueue`]. The queue keeps one deadline per request: scheduling a
//! key that is already waiting is a no-op, except that an earlier deadline
//! replaces a later one (a live edit must not wait out a long retry). A
//! debounce period is added to every deadline so a burst of events for one
//! resource collapses into a single reconcile.
//!
//! Dispatch is single-flight per key, with the control-plane active set as
//! the source of truth: a request whose key is already reconciling is
//! parked and restarted the moment the running reconcile finishes.
//! Different keys run concurrently as spawned tasks. The queue is purely
//! in-memory; after a restart, the initial relist and the periodic resync
//! repopulate it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use prometheus::IntGauge;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::state::{ControlState, Request};

/// Debounce added to every deadline.
pub const RECONCILE_DEBOUNCE: Duration = Duration::from_secs(1);

/// A request to reconcile `request` once `run_at` (plus debounce) passes.
#[derive(Debug)]
pub struct Enqueue {
    pub request: Request,
    pub run_at: Instant,
}

impl Enqueue {
    /// Due as soon as the debounce period allows.
    #[must_use]
    pub fn now(request: Request) -> Self {
        Self {
            request,
            run_at: Instant::now(),
        }
    }

    /// Due after `delay`, used for retry scheduling.
    #[must_use]
    pub fn after(request: Request, delay: Duration) -> Self {
        Self {
            request,
            run_at: Instant::now() + delay,
        }
    }
}

/// Producer half handed to the router, reconcilers and resync sweep.
pub type QueueSender = mpsc::UnboundedSender<Enqueue>;

/// Consumer side: owns the timers and drives reconciles.
pub struct WorkQueue {
    rx: mpsc::UnboundedReceiver<Enqueue>,
    state: Arc<ControlState>,
    debounce: Duration,
    depth_gauge: Option<IntGauge>,
    /// Deadline per queued request. This map *is* the queue; there is no
    /// separate timer structure to fall out of sync with.
    queued: HashMap<Request, Instant>,
    /// Requests that came due while their key was still reconciling.
    parked: HashSet<Request>,
}

impl WorkQueue {
    #[must_use]
    pub fn new(
        rx: mpsc::UnboundedReceiver<Enqueue>,
        state: Arc<ControlState>,
        debounce: Duration,
    ) -> Self {
        Self {
            rx,
            state,
            debounce,
            depth_gauge: None,
            queued: HashMap::new(),
            parked: HashSet::new(),
        }
    }

    /// Exports the queue depth (waiting plus parked) through `gauge`.
    #[must_use]
    pub fn with_depth_gauge(mut self, gauge: IntGauge) -> Self {
        self.depth_gauge = Some(gauge);
        self
    }

    fn record(&mut self, item: Enqueue) {
        if self.parked.contains(&item.request) {
            // Already due and waiting for its key to free up; it cannot run
            // any sooner than that.
            return;
        }
        let due = item.run_at + self.debounce;
        self.queued
            .entry(item.request)
            .and_modify(|at| {
                // Scheduling a pending key is a no-op, but an earlier
                // deadline wins over a later one.
                if *at > due {
                    *at = due;
                }
            })
            .or_insert(due);
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.queued.values().min().copied()
    }

    fn take_due(&mut self, now: Instant) -> Vec<Request> {
        let mut due = Vec::new();
        self.queued.retain(|request, at| {
            if *at <= now {
                due.push(request.clone());
                false
            } else {
                true
            }
        });
        due
    }

    fn update_gauge(&self) {
        if let Some(gauge) = &self.depth_gauge {
            gauge.set((self.queued.len() + self.parked.len()) as i64);
        }
    }

    /// Starts the reconcile, or parks the request if its key is busy.
    ///
    /// The active set doubles as the single-flight lock: insertion failing
    /// means a reconcile for this key is still running somewhere.
    fn dispatch<F>(&mut self, in_flight: &mut JoinSet<Request>, reconcile: &mut F, request: Request)
    where
        F: FnMut(Request) -> BoxFuture<'static, ()>,
    {
        if !self.state.mark_active(&request) {
            debug!(key = %request.key, "key busy, parking request");
            self.parked.insert(request);
            return;
        }
        let fut = reconcile(request.clone());
        in_flight.spawn(async move {
            fut.await;
            request
        });
    }

    /// Runs until the sender side closes and all accepted work has drained.
    pub async fn run<F>(mut self, mut reconcile: F)
    where
        F: FnMut(Request) -> BoxFuture<'static, ()>,
    {
        let mut in_flight: JoinSet<Request> = JoinSet::new();
        let mut closed = false;
        loop {
            self.update_gauge();
            if closed && in_flight.is_empty() && self.queued.is_empty() {
                // Parked entries only exist while their key is in flight,
                // so the queue is fully drained here.
                return;
            }
            let deadline = self.next_deadline();
            let wake_at = deadline.unwrap_or_else(Instant::now);
            tokio::select! {
                item = self.rx.recv(), if !closed => match item {
                    Some(item) => self.record(item),
                    None => closed = true,
                },
                Some(finished) = in_flight.join_next(), if !in_flight.is_empty() => {
                    match finished {
                        Ok(request) => {
                            self.state.clear_active(&request);
                            if self.parked.take(&request).is_some() {
                                // The key was re-triggered mid-reconcile;
                                // its slot just freed up.
                                self.dispatch(&mut in_flight, &mut reconcile, request);
                            }
                        }
                        // The request inside never comes back from a
                        // panicked task; its active entry is covered by the
                        // shutdown drain cap.
                        Err(err) => warn!(error = %err, "reconcile task panicked"),
                    }
                },
                () = tokio::time::sleep_until(wake_at), if deadline.is_some() => {
                    let now = Instant::now();
                    for request in self.take_due(now) {
                        if self.state.is_shutting_down() {
                            // A timer firing after the latch is a no-op.
                            continue;
                        }
                        self.dispatch(&mut in_flight, &mut reconcile, request);
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Key, ResourceKind};
    use futures::FutureExt;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::{advance, pause, sleep};

    fn request(name: &str) -> Request {
        Request {
            kind: ResourceKind::Cluster,
            key: Key::new("default", name),
        }
    }

    fn queue(
        state: &Arc<ControlState>,
        debounce: Duration,
    ) -> (QueueSender, WorkQueue) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, WorkQueue::new(rx, state.clone(), debounce))
    }

    /// Spawns the queue with a reconcile that appends each request to a log.
    fn spawn_logging_queue(
        queue: WorkQueue,
    ) -> (Arc<Mutex<Vec<Request>>>, tokio::task::JoinHandle<()>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        let handle = tokio::spawn(queue.run(move |request| {
            let sink = sink.clone();
            async move { sink.lock().push(request) }.boxed()
        }));
        (log, handle)
    }

    #[tokio::test]
    async fn dispatches_only_after_the_debounce_period() {
        pause();
        let state = Arc::new(ControlState::default());
        let (tx, queue) = queue(&state, Duration::from_secs(1));
        let (log, handle) = spawn_logging_queue(queue);

        tx.send(Enqueue::now(request("a"))).unwrap();
        sleep(Duration::from_millis(500)).await;
        assert!(log.lock().is_empty());
        sleep(Duration::from_secs(1)).await;
        assert_eq!(log.lock().as_slice(), &[request("a")]);

        drop(tx);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn scheduling_a_pending_key_is_idempotent() {
        pause();
        let state = Arc::new(ControlState::default());
        let (tx, queue) = queue(&state, Duration::from_secs(1));
        let (log, handle) = spawn_logging_queue(queue);

        tx.send(Enqueue::now(request("a"))).unwrap();
        tx.send(Enqueue::now(request("a"))).unwrap();
        tx.send(Enqueue::after(request("a"), Duration::from_secs(30))).unwrap();
        sleep(Duration::from_secs(2)).await;
        assert_eq!(log.lock().len(), 1);
        // The duplicates were absorbed, not queued behind the first.
        sleep(Duration::from_secs(60)).await;
        assert_eq!(log.lock().len(), 1);

        drop(tx);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn an_earlier_deadline_expedites_a_queued_retry() {
        pause();
        let state = Arc::new(ControlState::default());
        let (tx, queue) = queue(&state, Duration::from_millis(100));
        let (log, handle) = spawn_logging_queue(queue);

        tx.send(Enqueue::after(request("a"), Duration::from_secs(30))).unwrap();
        sleep(Duration::from_secs(1)).await;
        assert!(log.lock().is_empty());
        tx.send(Enqueue::now(request("a"))).unwrap();
        sleep(Duration::from_secs(1)).await;
        assert_eq!(log.lock().len(), 1);

        drop(tx);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn one_reconcile_per_key_but_keys_run_concurrently() {
        pause();
        let state = Arc::new(ControlState::default());
        let (tx, queue) = queue(&state, Duration::from_millis(10));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let per_key_overlap = Arc::new(AtomicUsize::new(0));
        let keys_running = Arc::new(Mutex::new(std::collections::HashSet::new()));

        let (running2, peak2) = (running.clone(), peak.clone());
        let (overlap2, keys2) = (per_key_overlap.clone(), keys_running.clone());
        let handle = tokio::spawn(queue.run(move |request| {
            let running = running2.clone();
            let peak = peak2.clone();
            let overlap = overlap2.clone();
            let keys = keys2.clone();
            async move {
                if !keys.lock().insert(request.key.clone()) {
                    overlap.fetch_add(1, Ordering::SeqCst);
                }
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                sleep(Duration::from_secs(1)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                keys.lock().remove(&request.key);
            }
            .boxed()
        }));

        for name in ["a", "b"] {
            tx.send(Enqueue::now(request(name))).unwrap();
        }
        // Re-trigger "a" while its first reconcile is still sleeping.
        sleep(Duration::from_millis(500)).await;
        tx.send(Enqueue::now(request("a"))).unwrap();
        sleep(Duration::from_secs(5)).await;

        // Both keys overlapped, no key overlapped with itself, and the
        // parked re-trigger ran after the first finished.
        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(per_key_overlap.load(Ordering::SeqCst), 0);
        assert_eq!(state.active_count(), 0);

        drop(tx);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn parked_requests_rerun_once_their_key_frees_up() {
        pause();
        let state = Arc::new(ControlState::default());
        let (tx, queue) = queue(&state, Duration::from_millis(10));
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let handle = tokio::spawn(queue.run(move |_| {
            let count = count2.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                sleep(Duration::from_secs(2)).await;
            }
            .boxed()
        }));

        tx.send(Enqueue::now(request("a"))).unwrap();
        sleep(Duration::from_secs(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        // Due while the first run still has a second to go.
        tx.send(Enqueue::now(request("a"))).unwrap();
        sleep(Duration::from_millis(500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        sleep(Duration::from_secs(4)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);

        drop(tx);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn timers_firing_during_shutdown_are_skipped() {
        pause();
        let state = Arc::new(ControlState::default());
        let (tx, queue) = queue(&state, Duration::from_millis(10));
        let (log, handle) = spawn_logging_queue(queue);

        tx.send(Enqueue::now(request("a"))).unwrap();
        state.begin_shutdown();
        sleep(Duration::from_secs(2)).await;
        assert!(log.lock().is_empty());
        assert_eq!(state.active_count(), 0);

        drop(tx);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn depth_gauge_tracks_waiting_requests() {
        pause();
        let state = Arc::new(ControlState::default());
        let gauge = IntGauge::new("depth", "queued requests").unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = WorkQueue::new(rx, state.clone(), Duration::from_secs(1))
            .with_depth_gauge(gauge.clone());
        let (log, handle) = spawn_logging_queue(queue);

        tx.send(Enqueue::now(request("a"))).unwrap();
        tx.send(Enqueue::now(request("b"))).unwrap();
        sleep(Duration::from_millis(500)).await;
        assert_eq!(gauge.get(), 2);
        sleep(Duration::from_secs(1)).await;
        assert_eq!(log.lock().len(), 2);
        assert_eq!(gauge.get(), 0);

        drop(tx);
        handle.await.unwrap();
    }
}
