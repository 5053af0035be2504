// src/ingest/scheduler.rs
//! Per-source repeating job runner with completion/error listeners.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures::future::BoxFuture;
use metrics::counter;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// What to do when a firing arrives while the previous run is still going.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OverlapPolicy {
    /// Drop the firing.
    #[default]
    Skip,
    /// Start another run alongside the outstanding one.
    Allow,
}

#[derive(Debug)]
pub struct JobCompleted<T> {
    pub id: u64,
    pub result: T,
}

#[derive(Debug)]
pub struct JobFailed {
    pub id: u64,
    pub error: anyhow::Error,
}

type Job<T> = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<T>> + Send + Sync>;
type CompletedHandler<T> = Arc<dyn Fn(&JobCompleted<T>) + Send + Sync>;
type ErrorHandler = Arc<dyn Fn(&JobFailed) + Send + Sync>;

struct Listeners<T> {
    completed: RwLock<Vec<CompletedHandler<T>>>,
    failed: RwLock<Vec<ErrorHandler>>,
}

struct Shared<T> {
    name: String,
    overlap: OverlapPolicy,
    next_id: AtomicU64,
    in_flight: AtomicBool,
    listeners: Listeners<T>,
}

/// Fires a job every `interval` once scheduled. Single-process only.
pub struct Scheduler<T> {
    shared: Arc<Shared<T>>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + Sync + 'static> Scheduler<T> {
    pub fn new(name: impl Into<String>, overlap: OverlapPolicy) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                overlap,
                next_id: AtomicU64::new(1),
                in_flight: AtomicBool::new(false),
                listeners: Listeners {
                    completed: RwLock::new(Vec::new()),
                    failed: RwLock::new(Vec::new()),
                },
            }),
            ticker: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn on_completed<F>(&self, handler: F)
    where
        F: Fn(&JobCompleted<T>) + Send + Sync + 'static,
    {
        write_lock(&self.shared.listeners.completed).push(Arc::new(handler));
    }

    pub fn on_error<F>(&self, handler: F)
    where
        F: Fn(&JobFailed) + Send + Sync + 'static,
    {
        write_lock(&self.shared.listeners.failed).push(Arc::new(handler));
    }

    /// Arm the timer. The first firing happens one `every` from now; calling this
    /// again replaces the previous timer.
    pub fn schedule<F, Fut>(&self, job: F, every: Duration)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let job: Job<T> = Arc::new(move || -> BoxFuture<'static, anyhow::Result<T>> { Box::pin(job()) });
        let shared = Arc::clone(&self.shared);
        let every = every.max(Duration::from_millis(1));

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                fire(&shared, &job);
            }
        });

        let mut slot = self.ticker.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(old) = slot.replace(handle) {
            old.abort();
        }
        tracing::info!(scheduler = %self.shared.name, every_ms = every.as_millis() as u64, "job scheduled");
    }

    /// Stop future firings. Runs already started keep going.
    pub fn stop(&self) {
        let mut slot = self.ticker.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(handle) = slot.take() {
            handle.abort();
            tracing::info!(scheduler = %self.shared.name, "scheduler stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.ticker
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }
}

impl<T> Drop for Scheduler<T> {
    fn drop(&mut self) {
        let mut slot = self.ticker.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(handle) = slot.take() {
            handle.abort();
        }
    }
}

fn fire<T: Send + Sync + 'static>(shared: &Arc<Shared<T>>, job: &Job<T>) {
    if shared.overlap == OverlapPolicy::Skip && shared.in_flight.swap(true, Ordering::AcqRel) {
        counter!("scheduler_skipped_total", "job" => shared.name.clone()).increment(1);
        tracing::warn!(scheduler = %shared.name, "previous run still in flight, skipping firing");
        return;
    }

    let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
    let shared = Arc::clone(shared);
    let job = Arc::clone(job);
    counter!("scheduler_runs_total", "job" => shared.name.clone()).increment(1);

    tokio::spawn(async move {
        // The job future is built inside its own task, so a panic in the closure or
        // in the future surfaces as a JoinError instead of killing the timer.
        let outcome = match tokio::spawn(async move { job().await }).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(error)) => Err(error),
            Err(join) => Err(anyhow::anyhow!("job panicked or was cancelled: {join}")),
        };

        if shared.overlap == OverlapPolicy::Skip {
            shared.in_flight.store(false, Ordering::Release);
        }

        match outcome {
            Ok(result) => emit_completed(&shared, &JobCompleted { id, result }),
            Err(error) => emit_failed(&shared, &JobFailed { id, error }),
        }
    });
}

fn emit_completed<T>(shared: &Shared<T>, event: &JobCompleted<T>) {
    let handlers = read_lock(&shared.listeners.completed).clone();
    for (idx, handler) in handlers.iter().enumerate() {
        if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
            tracing::error!(scheduler = %shared.name, listener = idx, job_id = event.id, "completed listener panicked");
        }
    }
}

fn emit_failed<T>(shared: &Shared<T>, event: &JobFailed) {
    let handlers = read_lock(&shared.listeners.failed).clone();
    for (idx, handler) in handlers.iter().enumerate() {
        if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
            tracing::error!(scheduler = %shared.name, listener = idx, job_id = event.id, "error listener panicked");
        }
    }
}

fn read_lock<V>(lock: &RwLock<V>) -> std::sync::RwLockReadGuard<'_, V> {
    lock.read().unwrap_or_else(|p| p.into_inner())
}

fn write_lock<V>(lock: &RwLock<V>) -> std::sync::RwLockWriteGuard<'_, V> {
    lock.write().unwrap_or_else(|p| p.into_inner())
}
