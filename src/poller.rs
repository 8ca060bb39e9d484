// Resource poller
// Polls server-reported status for independently tracked ids until each one
// reaches a terminal state, errors, times out or is stopped.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, ReentrantMutex};
use std::cell::Cell;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(300);

/// A polled status
pub trait PollStatus: Clone + Send + Sync + 'static {
    /// True when no further transition will occur
    fn is_terminal(&self) -> bool;
}

/// Callbacks for one tracked id.
/// Handlers run synchronously on the polling task and may stop their own id.
/// By the time a final callback (terminal, timeout, error) runs the id is no longer tracked.
pub trait PollHandler<K, S, E>: Send + Sync + 'static {
    /// Every successful fetch, terminal or not
    fn on_update(&self, id: &K, status: &S);

    /// After `on_update` for a terminal status
    fn on_terminal(&self, id: &K, status: &S) {
        let _ = (id, status);
    }

    /// The poll budget ran out before a terminal status was seen
    fn on_timeout(&self, id: &K, elapsed: Duration);

    /// A fetch failed; polling for this id has stopped
    fn on_error(&self, id: &K, error: &E);
}

#[derive(Debug, Clone)]
pub struct PollConfig {
    /// Delay between the settling of one fetch and the start of the next
    pub interval: Duration,
    /// Budget from start until a synthesized timeout
    pub timeout: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            timeout: DEFAULT_POLL_TIMEOUT,
        }
    }
}

/// Delivery gate shared by an entry and its task.
/// Once deactivated no callback for the entry runs again.
struct Delivery<S> {
    active: ReentrantMutex<Cell<bool>>,
    last_status: Mutex<Option<S>>,
}

impl<S> Delivery<S> {
    fn new() -> Self {
        Self {
            active: ReentrantMutex::new(Cell::new(true)),
            last_status: Mutex::new(None),
        }
    }

    /// Run `f` if still active; returns whether the entry is active afterwards
    fn deliver(&self, f: impl FnOnce()) -> bool {
        let active = self.active.lock();
        if !active.get() {
            return false;
        }
        f();
        active.get()
    }

    /// Blocks until an in-progress delivery on another thread has finished
    fn deactivate(&self) {
        self.active.lock().set(false);
    }
}

struct PollEntry<S> {
    generation: u64,
    started_at: Instant,
    task: JoinHandle<()>,
    delivery: Arc<Delivery<S>>,
}

struct PollerInner<K: Eq + Hash, S> {
    entries: DashMap<K, PollEntry<S>>,
    generations: AtomicU64,
    config: PollConfig,
}

impl<K: Eq + Hash, S> Drop for PollerInner<K, S> {
    fn drop(&mut self) {
        for entry in self.entries.iter() {
            entry.delivery.deactivate();
            entry.task.abort();
        }
    }
}

/// Resource poller
/// At most one entry per id. Each entry owns one task that sleeps, fetches,
/// and schedules its next tick only after the previous fetch settled.
/// Dropping the last handle cancels every task.
pub struct ResourcePoller<K: Eq + Hash, S> {
    inner: Arc<PollerInner<K, S>>,
}

impl<K: Eq + Hash, S> Clone for ResourcePoller<K, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, S> ResourcePoller<K, S>
where
    K: Eq + Hash + Clone + fmt::Display + Send + Sync + 'static,
    S: PollStatus,
{
    pub fn new(config: PollConfig) -> Self {
        Self {
            inner: Arc::new(PollerInner {
                entries: DashMap::new(),
                generations: AtomicU64::new(0),
                config,
            }),
        }
    }

    pub fn config(&self) -> &PollConfig {
        &self.inner.config
    }

    /// Start polling `id`. Returns false (and does nothing) if it is already tracked.
    pub fn start_polling<E, F, Fut, H>(&self, id: K, fetch: F, handler: Arc<H>) -> bool
    where
        E: fmt::Display + Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<S, E>> + Send + 'static,
        H: PollHandler<K, S, E>,
    {
        match self.inner.entries.entry(id.clone()) {
            Entry::Occupied(_) => {
                tracing::debug!(resource_id = %id, "Already polling, ignoring start");
                false
            }
            Entry::Vacant(slot) => {
                let generation = self.inner.generations.fetch_add(1, Ordering::SeqCst) + 1;
                let delivery = Arc::new(Delivery::new());
                let started_at = Instant::now();

                let task = tokio::spawn(run_poll(
                    Arc::downgrade(&self.inner),
                    id.clone(),
                    generation,
                    started_at,
                    self.inner.config.clone(),
                    Arc::clone(&delivery),
                    fetch,
                    handler,
                ));

                slot.insert(PollEntry {
                    generation,
                    started_at,
                    task,
                    delivery,
                });

                tracing::info!(
                    resource_id = %id,
                    interval_ms = self.inner.config.interval.as_millis() as u64,
                    timeout_secs = self.inner.config.timeout.as_secs(),
                    "Started polling"
                );
                true
            }
        }
    }

    /// Stop polling `id`. Safe on ids that are not tracked.
    /// An in-flight fetch is cancelled and its result never delivered.
    pub fn stop_polling(&self, id: &K) -> bool {
        match self.inner.entries.remove(id) {
            Some((_, entry)) => {
                entry.delivery.deactivate();
                entry.task.abort();
                tracing::debug!(resource_id = %id, "Stopped polling");
                true
            }
            None => false,
        }
    }

    /// Stop every tracked id; returns how many were stopped
    pub fn stop_all(&self) -> usize {
        let ids: Vec<K> = self
            .inner
            .entries
            .iter()
            .map(|entry| entry.key().clone())
            .collect();

        let stopped = ids.iter().filter(|id| self.stop_polling(id)).count();
        if stopped > 0 {
            tracing::info!(stopped, "Stopped all polling");
        }
        stopped
    }

    pub fn is_polling(&self, id: &K) -> bool {
        self.inner.entries.contains_key(id)
    }

    pub fn active_count(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn tracked_ids(&self) -> Vec<K> {
        self.inner
            .entries
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Status from the most recent successful fetch for a tracked id
    pub fn last_status(&self, id: &K) -> Option<S> {
        self.inner
            .entries
            .get(id)
            .and_then(|entry| entry.delivery.last_status.lock().clone())
    }

    /// Time since polling started for a tracked id
    pub fn elapsed(&self, id: &K) -> Option<Duration> {
        self.inner
            .entries
            .get(id)
            .map(|entry| entry.started_at.elapsed())
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_poll<K, S, E, F, Fut, H>(
    inner: Weak<PollerInner<K, S>>,
    id: K,
    generation: u64,
    started_at: Instant,
    config: PollConfig,
    delivery: Arc<Delivery<S>>,
    fetch: F,
    handler: Arc<H>,
) where
    K: Eq + Hash + fmt::Display,
    S: PollStatus,
    E: fmt::Display,
    F: Fn() -> Fut,
    Fut: Future<Output = Result<S, E>>,
    H: PollHandler<K, S, E>,
{
    let mut tick: u64 = 0;

    loop {
        let remaining = config.timeout.saturating_sub(started_at.elapsed());
        tokio::time::sleep(config.interval.min(remaining)).await;
        tick += 1;

        let elapsed = started_at.elapsed();
        if elapsed >= config.timeout {
            tracing::warn!(resource_id = %id, elapsed_secs = elapsed.as_secs(), "Poll budget exceeded");
            unregister(&inner, &id, generation);
            delivery.deliver(|| handler.on_timeout(&id, elapsed));
            return;
        }

        // A fetch that outlives the budget counts as a timeout
        let outcome = tokio::time::timeout(config.timeout - elapsed, fetch()).await;

        match outcome {
            Err(_) => {
                let elapsed = started_at.elapsed();
                tracing::warn!(resource_id = %id, tick, "Status fetch still pending at poll budget");
                unregister(&inner, &id, generation);
                delivery.deliver(|| handler.on_timeout(&id, elapsed));
                return;
            }
            Ok(Err(error)) => {
                tracing::warn!(resource_id = %id, tick, error = %error, "Status fetch failed, stopping poll");
                unregister(&inner, &id, generation);
                delivery.deliver(|| handler.on_error(&id, &error));
                return;
            }
            Ok(Ok(status)) if status.is_terminal() => {
                tracing::info!(resource_id = %id, tick, "Reached terminal status");
                unregister(&inner, &id, generation);
                delivery.deliver(|| {
                    handler.on_update(&id, &status);
                    handler.on_terminal(&id, &status);
                });
                return;
            }
            Ok(Ok(status)) => {
                let still_active = delivery.deliver(|| {
                    *delivery.last_status.lock() = Some(status.clone());
                    handler.on_update(&id, &status);
                });
                if !still_active {
                    return;
                }
            }
        }
    }
}

/// Drop the entry before its final callback; a newer entry for the same id is left alone
fn unregister<K: Eq + Hash, S>(inner: &Weak<PollerInner<K, S>>, id: &K, generation: u64) {
    if let Some(inner) = inner.upgrade() {
        inner
            .entries
            .remove_if(id, |_, entry| entry.generation == generation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Clone, PartialEq)]
    enum Status {
        Processing,
        Done,
    }

    impl PollStatus for Status {
        fn is_terminal(&self) -> bool {
            *self != Status::Processing
        }
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn events(&self) -> Vec<String> {
            self.events.lock().clone()
        }

        fn count(&self, prefix: &str) -> usize {
            self.events
                .lock()
                .iter()
                .filter(|e| e.starts_with(prefix))
                .count()
        }
    }

    impl PollHandler<u32, Status, String> for Recorder {
        fn on_update(&self, id: &u32, status: &Status) {
            self.events.lock().push(format!("update:{}:{:?}", id, status));
        }

        fn on_terminal(&self, id: &u32, status: &Status) {
            self.events.lock().push(format!("terminal:{}:{:?}", id, status));
        }

        fn on_timeout(&self, id: &u32, _elapsed: Duration) {
            self.events.lock().push(format!("timeout:{}", id));
        }

        fn on_error(&self, id: &u32, error: &String) {
            self.events.lock().push(format!("error:{}:{}", id, error));
        }
    }

    fn config(interval_secs: u64, timeout_secs: u64) -> PollConfig {
        PollConfig {
            interval: Duration::from_secs(interval_secs),
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    /// Fetch returning `script[n]` on the n-th call (last entry repeats)
    fn scripted(
        script: Vec<Status>,
        calls: Arc<AtomicUsize>,
    ) -> impl Fn() -> futures::future::Ready<Result<Status, String>> + Send + Sync + 'static {
        move || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            let status = script[n.min(script.len() - 1)].clone();
            futures::future::ready(Ok(status))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_is_idempotent() {
        let poller = ResourcePoller::new(config(2, 300));
        let calls = Arc::new(AtomicUsize::new(0));
        let recorder = Arc::new(Recorder::default());

        assert!(poller.start_polling(
            7,
            scripted(vec![Status::Processing], Arc::clone(&calls)),
            Arc::clone(&recorder)
        ));
        assert!(!poller.start_polling(
            7,
            scripted(vec![Status::Processing], Arc::clone(&calls)),
            Arc::clone(&recorder)
        ));
        assert_eq!(poller.active_count(), 1);

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.count("update"), 1);
        poller.stop_all();
    }

    #[tokio::test(start_paused = true)]
    async fn test_processing_then_ready_stops_after_second_tick() {
        let poller = ResourcePoller::new(config(2, 300));
        let calls = Arc::new(AtomicUsize::new(0));
        let recorder = Arc::new(Recorder::default());

        poller.start_polling(
            1,
            scripted(vec![Status::Processing, Status::Done], Arc::clone(&calls)),
            Arc::clone(&recorder),
        );

        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert_eq!(poller.last_status(&1), Some(Status::Processing));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(
            recorder.events(),
            vec![
                "update:1:Processing".to_string(),
                "update:1:Done".to_string(),
                "terminal:1:Done".to_string(),
            ]
        );
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!poller.is_polling(&1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_when_never_terminal() {
        let poller = ResourcePoller::new(config(2, 10));
        let calls = Arc::new(AtomicUsize::new(0));
        let recorder = Arc::new(Recorder::default());

        let started = Instant::now();
        poller.start_polling(
            3,
            scripted(vec![Status::Processing], Arc::clone(&calls)),
            Arc::clone(&recorder),
        );

        tokio::time::sleep(Duration::from_secs(9)).await;
        assert_eq!(recorder.count("timeout"), 0);
        assert!(poller.is_polling(&3));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(recorder.count("timeout"), 1);
        assert_eq!(recorder.count("update"), 4);
        assert_eq!(recorder.count("terminal"), 0);
        assert!(!poller.is_polling(&3));
        assert!(started.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_when_server_never_responds() {
        let poller: ResourcePoller<u32, Status> = ResourcePoller::new(config(2, 10));
        let recorder = Arc::new(Recorder::default());

        poller.start_polling(
            4,
            || futures::future::pending::<Result<Status, String>>(),
            Arc::clone(&recorder),
        );

        tokio::time::sleep(Duration::from_millis(9900)).await;
        assert!(recorder.events().is_empty());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(recorder.events(), vec!["timeout:4".to_string()]);
        assert!(!poller.is_polling(&4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_not_exceeded_when_interval_overshoots() {
        let poller = ResourcePoller::new(config(2, 5));
        let calls = Arc::new(AtomicUsize::new(0));
        let recorder = Arc::new(Recorder::default());

        poller.start_polling(
            5,
            scripted(vec![Status::Processing], Arc::clone(&calls)),
            Arc::clone(&recorder),
        );

        tokio::time::sleep(Duration::from_millis(5100)).await;
        assert_eq!(recorder.count("timeout"), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_discards_in_flight_fetch() {
        let poller = ResourcePoller::new(config(2, 300));
        let calls = Arc::new(AtomicUsize::new(0));
        let recorder = Arc::new(Recorder::default());

        let fetch_calls = Arc::clone(&calls);
        poller.start_polling(
            9,
            move || {
                fetch_calls.fetch_add(1, Ordering::SeqCst);
                async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok::<_, String>(Status::Done)
                }
            },
            Arc::clone(&recorder),
        );

        // Fetch started at 2s and settles at 7s
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(poller.stop_polling(&9));

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(recorder.events().is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_error_stops_poll() {
        let poller: ResourcePoller<u32, Status> = ResourcePoller::new(config(2, 300));
        let recorder = Arc::new(Recorder::default());

        poller.start_polling(
            2,
            || futures::future::ready(Err::<Status, _>("404 Document not found".to_string())),
            Arc::clone(&recorder),
        );

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(
            recorder.events(),
            vec!["error:2:404 Document not found".to_string()]
        );
        assert!(!poller.is_polling(&2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_all_leaves_nothing_running() {
        let poller = ResourcePoller::new(config(2, 300));
        let calls = Arc::new(AtomicUsize::new(0));
        let recorder = Arc::new(Recorder::default());

        for id in 0..5 {
            poller.start_polling(
                id,
                scripted(vec![Status::Processing], Arc::clone(&calls)),
                Arc::clone(&recorder),
            );
        }
        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 5);

        assert_eq!(poller.stop_all(), 5);
        assert_eq!(poller.active_count(), 0);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(poller.stop_all(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_unknown_id_is_noop() {
        let poller: ResourcePoller<u32, Status> = ResourcePoller::new(PollConfig::default());
        assert!(!poller.stop_polling(&42));
        assert!(!poller.stop_polling(&42));
    }

    struct StopSelf {
        poller: Mutex<Option<ResourcePoller<u32, Status>>>,
        updates: AtomicUsize,
    }

    impl PollHandler<u32, Status, String> for StopSelf {
        fn on_update(&self, id: &u32, _status: &Status) {
            self.updates.fetch_add(1, Ordering::SeqCst);
            if let Some(poller) = self.poller.lock().as_ref() {
                poller.stop_polling(id);
            }
        }

        fn on_timeout(&self, _id: &u32, _elapsed: Duration) {}

        fn on_error(&self, _id: &u32, _error: &String) {}
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_may_stop_its_own_id() {
        let poller = ResourcePoller::new(config(2, 300));
        let calls = Arc::new(AtomicUsize::new(0));
        let handler = Arc::new(StopSelf {
            poller: Mutex::new(Some(poller.clone())),
            updates: AtomicUsize::new(0),
        });

        poller.start_polling(
            11,
            scripted(vec![Status::Processing], Arc::clone(&calls)),
            Arc::clone(&handler),
        );

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(handler.updates.load(Ordering::SeqCst), 1);
        assert!(!poller.is_polling(&11));

        // Break the handler -> poller cycle
        handler.poller.lock().take();
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_after_stop_is_independent() {
        let poller = ResourcePoller::new(config(2, 300));
        let old_calls = Arc::new(AtomicUsize::new(0));
        let new_calls = Arc::new(AtomicUsize::new(0));
        let recorder = Arc::new(Recorder::default());

        poller.start_polling(
            1,
            scripted(vec![Status::Processing], Arc::clone(&old_calls)),
            Arc::clone(&recorder),
        );
        assert!(poller.stop_polling(&1));
        assert!(poller.start_polling(
            1,
            scripted(vec![Status::Processing, Status::Done], Arc::clone(&new_calls)),
            Arc::clone(&recorder)
        ));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(old_calls.load(Ordering::SeqCst), 0);
        assert_eq!(new_calls.load(Ordering::SeqCst), 2);
        assert!(!poller.is_polling(&1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_poller_cancels_tasks() {
        let poller = ResourcePoller::new(config(2, 300));
        let calls = Arc::new(AtomicUsize::new(0));
        let recorder = Arc::new(Recorder::default());

        poller.start_polling(
            1,
            scripted(vec![Status::Processing], Arc::clone(&calls)),
            Arc::clone(&recorder),
        );
        drop(poller);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(recorder.events().is_empty());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Start(u32),
        Stop(u32),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u32..4).prop_map(Op::Start),
            (0u32..4).prop_map(Op::Stop),
        ]
    }

    proptest! {
        #[test]
        fn prop_at_most_one_entry_per_id(ops in proptest::collection::vec(op(), 1..40)) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .start_paused(true)
                .build()
                .unwrap();

            runtime.block_on(async {
                let poller = ResourcePoller::new(config(2, 300));
                let recorder = Arc::new(Recorder::default());
                let mut model = HashSet::new();

                for op in &ops {
                    match op {
                        Op::Start(id) => {
                            let started = poller.start_polling(
                                *id,
                                || futures::future::pending::<Result<Status, String>>(),
                                Arc::clone(&recorder),
                            );
                            prop_assert_eq!(started, model.insert(*id));
                        }
                        Op::Stop(id) => {
                            prop_assert_eq!(poller.stop_polling(id), model.remove(id));
                        }
                    }
                    prop_assert_eq!(poller.active_count(), model.len());
                }

                prop_assert_eq!(poller.stop_all(), model.len());
                prop_assert_eq!(poller.active_count(), 0);
                Ok(())
            })?;
        }
    }
}
