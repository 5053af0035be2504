// src/live/mod.rs
//! Live arrival counts for subscribed clients.
//!
//! Each client gets one `initial` count on connect and a windowed `update` count
//! on every tick of its own timer. A server-wide sweep pings every client and
//! evicts the ones that did not answer the previous ping.

pub mod socket;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::{counter, describe_counter, describe_gauge, gauge};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::store::Store;

/// Frames queued per client before pushes start being dropped.
const OUTBOX_CAPACITY: usize = 16;

/// One-time registration of the live series.
pub fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_gauge!("live_clients", "Currently open live subscriptions.");
        describe_counter!("live_evictions_total", "Live clients evicted by the liveness sweep.");
    });
}

/// Server → client push messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LiveMessage {
    Initial {
        count: i64,
        since: DateTime<Utc>,
        timestamp: DateTime<Utc>,
    },
    Update {
        count: i64,
        since: DateTime<Utc>,
        interval: String,
        timestamp: DateTime<Utc>,
    },
}

/// What the socket loop should do next for one client.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Message(LiveMessage),
    Ping,
    Close,
}

#[derive(Debug, Clone, Copy)]
pub struct LiveConfig {
    pub update_period: Duration,
    pub sweep_period: Duration,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            update_period: Duration::from_secs(5 * 60),
            sweep_period: Duration::from_secs(30),
        }
    }
}

/// Handle returned to the connection that opened a subscription.
pub struct Subscription {
    pub client_id: String,
    pub conn_id: u64,
    pub subscribed_at: DateTime<Utc>,
    pub outbox: mpsc::Receiver<Outbound>,
}

struct ClientEntry {
    conn_id: u64,
    subscribed_at: DateTime<Utc>,
    checkpoint: DateTime<Utc>,
    alive: bool,
    tx: mpsc::Sender<Outbound>,
    timer: Option<JoinHandle<()>>,
}

impl ClientEntry {
    fn shutdown(mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        let _ = self.tx.try_send(Outbound::Close);
    }
}

struct Inner {
    store: Store,
    config: LiveConfig,
    interval_label: String,
    next_conn: AtomicU64,
    clients: Mutex<HashMap<String, ClientEntry>>,
}

/// Owns every open subscription, keyed by client id. Cheap to clone.
#[derive(Clone)]
pub struct LiveHub {
    inner: Arc<Inner>,
}

impl LiveHub {
    pub fn new(store: Store, config: LiveConfig) -> Self {
        ensure_metrics_described();
        Self {
            inner: Arc::new(Inner {
                store,
                interval_label: describe_period(config.update_period),
                config,
                next_conn: AtomicU64::new(1),
                clients: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients().len()
    }

    pub fn is_subscribed(&self, client_id: &str) -> bool {
        self.clients().contains_key(client_id)
    }

    fn clients(&self) -> MutexGuard<'_, HashMap<String, ClientEntry>> {
        self.inner.clients.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Register `client_id`, queue its initial count, and arm its update timer.
    ///
    /// A previous subscription under the same id is closed and replaced.
    pub async fn open(&self, client_id: &str) -> Subscription {
        let subscribed_at = Utc::now();
        let conn_id = self.inner.next_conn.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(OUTBOX_CAPACITY);

        let timer = spawn_update_timer(
            Arc::downgrade(&self.inner),
            client_id.to_string(),
            conn_id,
            self.inner.config.update_period,
        );

        let replaced = {
            let mut clients = self.clients();
            let replaced = clients.insert(
                client_id.to_string(),
                ClientEntry {
                    conn_id,
                    subscribed_at,
                    checkpoint: subscribed_at,
                    alive: true,
                    tx,
                    timer: Some(timer),
                },
            );
            gauge!("live_clients").set(clients.len() as f64);
            replaced
        };
        if let Some(old) = replaced {
            tracing::info!(client_id, "replacing existing subscription");
            old.shutdown();
        }

        tracing::info!(client_id, conn_id, "client subscribed");
        self.push_initial(client_id, conn_id).await;

        Subscription {
            client_id: client_id.to_string(),
            conn_id,
            subscribed_at,
            outbox: rx,
        }
    }

    /// Drop the subscription if it still belongs to `conn_id`.
    pub fn close(&self, client_id: &str, conn_id: u64) {
        let removed = {
            let mut clients = self.clients();
            let removed = match clients.get(client_id) {
                Some(entry) if entry.conn_id == conn_id => clients.remove(client_id),
                _ => None,
            };
            gauge!("live_clients").set(clients.len() as f64);
            removed
        };
        if let Some(mut entry) = removed {
            if let Some(timer) = entry.timer.take() {
                timer.abort();
            }
            tracing::info!(client_id, conn_id, "client disconnected");
        }
    }

    /// Record a pong.
    pub fn mark_alive(&self, client_id: &str, conn_id: u64) {
        if let Some(entry) = self.clients().get_mut(client_id) {
            if entry.conn_id == conn_id {
                entry.alive = true;
            }
        }
    }

    /// One liveness pass: evict clients still unanswered since the last pass,
    /// then mark the rest not-alive and ping them. Returns the evicted ids.
    pub fn sweep(&self) -> Vec<String> {
        let mut evicted = Vec::new();
        let mut clients = self.clients();

        let stale: Vec<String> = clients
            .iter()
            .filter(|(_, e)| !e.alive)
            .map(|(id, _)| id.clone())
            .collect();
        for id in stale {
            if let Some(entry) = clients.remove(&id) {
                entry.shutdown();
                evicted.push(id);
            }
        }

        for entry in clients.values_mut() {
            entry.alive = false;
            let _ = entry.tx.try_send(Outbound::Ping);
        }
        gauge!("live_clients").set(clients.len() as f64);
        drop(clients);

        if !evicted.is_empty() {
            counter!("live_evictions_total").increment(evicted.len() as u64);
            tracing::info!(evicted = ?evicted, "evicted unresponsive clients");
        }
        evicted
    }

    /// Run `sweep` every `sweep_period` until the returned handle is aborted.
    pub fn spawn_liveness_sweep(&self) -> JoinHandle<()> {
        let hub = self.clone();
        let period = self.inner.config.sweep_period;
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                hub.sweep();
            }
        })
    }

    /// Push the count of records created since the subscription started.
    pub async fn push_initial(&self, client_id: &str, conn_id: u64) {
        let Some((since, tx)) = self.target(client_id, conn_id, |e| e.subscribed_at) else {
            return;
        };
        let count = match self.inner.store.count_since(since).await {
            Ok(n) => n,
            Err(e) => {
                tracing::error!(client_id, error = %e, "initial count failed");
                return;
            }
        };
        deliver(
            client_id,
            &tx,
            LiveMessage::Initial {
                count,
                since,
                timestamp: Utc::now(),
            },
        );
    }

    /// Push the count of records created since the last checkpoint and advance it.
    pub async fn push_update(&self, client_id: &str, conn_id: u64) {
        let Some((since, tx)) = self.target(client_id, conn_id, |e| e.checkpoint) else {
            return;
        };
        let now = Utc::now();
        let count = match self.inner.store.count_between(since, now).await {
            Ok(n) => n,
            Err(e) => {
                tracing::error!(client_id, error = %e, "update count failed");
                return;
            }
        };

        if let Some(entry) = self.clients().get_mut(client_id) {
            if entry.conn_id == conn_id {
                entry.checkpoint = now;
            }
        }

        deliver(
            client_id,
            &tx,
            LiveMessage::Update {
                count,
                since,
                interval: self.inner.interval_label.clone(),
                timestamp: now,
            },
        );
    }

    /// Sender plus a timestamp for a live subscription, or `None` if it is gone.
    fn target(
        &self,
        client_id: &str,
        conn_id: u64,
        pick: impl FnOnce(&ClientEntry) -> DateTime<Utc>,
    ) -> Option<(DateTime<Utc>, mpsc::Sender<Outbound>)> {
        let clients = self.clients();
        let entry = clients.get(client_id).filter(|e| e.conn_id == conn_id)?;
        if entry.tx.is_closed() {
            return None;
        }
        Some((pick(entry), entry.tx.clone()))
    }
}

fn spawn_update_timer(inner: Weak<Inner>, client_id: String, conn_id: u64, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(inner) = inner.upgrade() else {
                return;
            };
            LiveHub { inner }.push_update(&client_id, conn_id).await;
        }
    })
}

fn deliver(client_id: &str, tx: &mpsc::Sender<Outbound>, msg: LiveMessage) {
    if let Err(e) = tx.try_send(Outbound::Message(msg)) {
        tracing::debug!(client_id, error = %e, "push dropped");
    }
}

/// "5 minutes", "30 seconds", "1 minute".
fn describe_period(d: Duration) -> String {
    let secs = d.as_secs();
    let (n, unit) = if secs >= 60 && secs % 60 == 0 {
        (secs / 60, "minute")
    } else if secs >= 1 {
        (secs, "second")
    } else {
        return format!("{} ms", d.as_millis());
    };
    if n == 1 {
        format!("1 {unit}")
    } else {
        format!("{n} {unit}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn period_labels() {
        assert_eq!(describe_period(Duration::from_secs(300)), "5 minutes");
        assert_eq!(describe_period(Duration::from_secs(60)), "1 minute");
        assert_eq!(describe_period(Duration::from_secs(30)), "30 seconds");
        assert_eq!(describe_period(Duration::from_millis(40)), "40 ms");
    }

    #[test]
    fn messages_serialize_with_type_tag() {
        let ts = Utc::now();
        let v = serde_json::to_value(LiveMessage::Update {
            count: 0,
            since: ts,
            interval: "5 minutes".into(),
            timestamp: ts,
        })
        .unwrap();
        assert_eq!(v["type"], "update");
        assert_eq!(v["count"], 0);
        assert_eq!(v["interval"], "5 minutes");
        assert!(v.get("since").is_some());

        let v = serde_json::to_value(LiveMessage::Initial {
            count: 3,
            since: ts,
            timestamp: ts,
        })
        .unwrap();
        assert_eq!(v["type"], "initial");
        assert_eq!(v["count"], 3);
    }
}
