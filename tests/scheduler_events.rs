// tests/scheduler_events.rs
//
// Timer semantics and listener dispatch of the job scheduler, on a paused clock.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};

use hn_story_stream::ingest::scheduler::{OverlapPolicy, Scheduler};

const EVERY: Duration = Duration::from_secs(10);

fn counting_job(counter: Arc<AtomicUsize>) -> impl Fn() -> futures::future::Ready<anyhow::Result<usize>> + Send + Sync {
    move || futures::future::ready(Ok(counter.fetch_add(1, Ordering::SeqCst) + 1))
}

#[tokio::test(start_paused = true)]
async fn first_run_waits_one_full_interval() {
    let scheduler = Scheduler::new("first", OverlapPolicy::Skip);
    let (tx, mut rx) = mpsc::unbounded_channel();
    scheduler.on_completed(move |done| {
        let _ = tx.send((done.id, Instant::now()));
    });

    let start = Instant::now();
    scheduler.schedule(|| async { Ok(()) }, EVERY);

    let (id, at) = timeout(Duration::from_secs(60), rx.recv()).await.unwrap().unwrap();
    assert_eq!(id, 1);
    assert!(at - start >= EVERY, "no immediate fire on schedule");
    assert!(at - start < EVERY * 2);
}

#[tokio::test(start_paused = true)]
async fn listeners_run_in_registration_order_and_survive_panics() {
    let scheduler = Scheduler::new("listeners", OverlapPolicy::Skip);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let (tx, mut rx) = mpsc::unbounded_channel();

    let s = seen.clone();
    scheduler.on_completed(move |_| s.lock().unwrap().push("first"));
    scheduler.on_completed(|_| panic!("listener blew up"));
    let s = seen.clone();
    scheduler.on_completed(move |done| {
        s.lock().unwrap().push("third");
        let _ = tx.send(done.id);
    });

    scheduler.schedule(|| async { Ok(1u8) }, EVERY);

    assert_eq!(timeout(Duration::from_secs(60), rx.recv()).await.unwrap(), Some(1));
    assert_eq!(*seen.lock().unwrap(), vec!["first", "third"]);

    // The timer keeps firing after a listener panicked.
    assert_eq!(timeout(Duration::from_secs(60), rx.recv()).await.unwrap(), Some(2));
    scheduler.stop();
}

#[tokio::test(start_paused = true)]
async fn job_errors_and_panics_reach_error_listeners() {
    let scheduler: Scheduler<()> = Scheduler::new("errors", OverlapPolicy::Skip);
    let (tx, mut rx) = mpsc::unbounded_channel();
    scheduler.on_error(move |failed| {
        let _ = tx.send((failed.id, failed.error.to_string()));
    });

    let runs = Arc::new(AtomicUsize::new(0));
    let r = runs.clone();
    scheduler.schedule(
        move || {
            let n = r.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    anyhow::bail!("upstream unavailable");
                }
                panic!("job crashed")
            }
        },
        EVERY,
    );

    let (id, msg) = timeout(Duration::from_secs(60), rx.recv()).await.unwrap().unwrap();
    assert_eq!(id, 1);
    assert_eq!(msg, "upstream unavailable");

    let (id, msg) = timeout(Duration::from_secs(60), rx.recv()).await.unwrap().unwrap();
    assert_eq!(id, 2);
    assert!(msg.contains("panicked"), "got: {msg}");
    scheduler.stop();
}

#[tokio::test(start_paused = true)]
async fn skip_policy_drops_firings_while_a_run_is_in_flight() {
    let scheduler: Scheduler<()> = Scheduler::new("skip", OverlapPolicy::Skip);
    let started = Arc::new(AtomicUsize::new(0));
    let s = started.clone();
    scheduler.schedule(
        move || {
            s.fetch_add(1, Ordering::SeqCst);
            async {
                sleep(Duration::from_secs(25)).await;
                Ok(())
            }
        },
        EVERY,
    );

    // Fires at 10s (runs until 35s); 20s and 30s are skipped; 40s starts again.
    sleep(Duration::from_secs(41)).await;
    assert_eq!(started.load(Ordering::SeqCst), 2);
    scheduler.stop();
}

#[tokio::test(start_paused = true)]
async fn allow_policy_overlaps_runs() {
    let scheduler: Scheduler<()> = Scheduler::new("allow", OverlapPolicy::Allow);
    let started = Arc::new(AtomicUsize::new(0));
    let s = started.clone();
    scheduler.schedule(
        move || {
            s.fetch_add(1, Ordering::SeqCst);
            async {
                sleep(Duration::from_secs(25)).await;
                Ok(())
            }
        },
        EVERY,
    );

    sleep(Duration::from_secs(41)).await;
    assert_eq!(started.load(Ordering::SeqCst), 4);
    scheduler.stop();
}

#[tokio::test(start_paused = true)]
async fn stop_prevents_further_firings() {
    let scheduler = Scheduler::new("stop", OverlapPolicy::Skip);
    let counter = Arc::new(AtomicUsize::new(0));
    scheduler.schedule(counting_job(counter.clone()), EVERY);
    assert!(scheduler.is_running());

    sleep(Duration::from_secs(11)).await;
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    scheduler.stop();
    assert!(!scheduler.is_running());
    sleep(Duration::from_secs(60)).await;
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn job_closure_panic_is_reported_and_does_not_block_later_runs() {
    let scheduler: Scheduler<usize> = Scheduler::new("sync-panic", OverlapPolicy::Skip);
    let (err_tx, mut err_rx) = mpsc::unbounded_channel();
    let (ok_tx, mut ok_rx) = mpsc::unbounded_channel();
    scheduler.on_error(move |failed| {
        let _ = err_tx.send((failed.id, failed.error.to_string()));
    });
    scheduler.on_completed(move |done| {
        let _ = ok_tx.send((done.id, done.result));
    });

    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();
    scheduler.schedule(
        move || {
            let n = c.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                panic!("closure failed before producing a future");
            }
            futures::future::ready(Ok(n))
        },
        EVERY,
    );

    let (id, msg) = timeout(Duration::from_secs(60), err_rx.recv()).await.unwrap().unwrap();
    assert_eq!(id, 1);
    assert!(msg.contains("panicked"), "got: {msg}");
    // The in-flight guard was released, so the next firing runs normally.
    assert_eq!(
        timeout(Duration::from_secs(60), ok_rx.recv()).await.unwrap(),
        Some((2, 1))
    );
    assert!(scheduler.is_running());
    scheduler.stop();
}
