//! Named-event one-shot timer engine.
//!
//! Fires a payload-bearing event at a wall-clock instant, supports
//! cancellation by handle, and can serialize its pending set to a snapshot
//! and re-arm it after a process restart. Entries whose fire time has
//! already passed are re-armed with zero delay on restore, which is what
//! makes expiry deadlines survive restarts.
//!
//! Dispatch is always deferred: a timer never fires synchronously inside
//! the call that scheduled it, and every callback runs on its own spawned
//! task so one panicking callback cannot take the others down. A fired or
//! cancelled timer is removed from the pending set before any callback
//! runs, so a cancelled handle can never fire late.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::error::{CoreError, Result};

/// Handle to a scheduled timer. Process-local, not portable across
/// restarts (snapshots carry fire times, not handles).
pub type TimerId = u64;

/// Handle to an event subscription.
pub type SubscriptionId = u64;

type Callback = Arc<dyn Fn(serde_json::Value) + Send + Sync>;

/// Serialized pending set, sufficient to reconstruct scheduling state
/// after a restart.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimerSnapshot {
    pub events: Vec<SnapshotEvent>,
}

/// One pending timer in a snapshot: event name, absolute fire time in
/// epoch milliseconds, and the payload it carries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotEvent {
    pub event: String,
    pub fire_at: i64,
    pub payload: serde_json::Value,
}

struct Pending {
    event: String,
    fire_at: i64,
    payload: serde_json::Value,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    callbacks: HashMap<String, Vec<(SubscriptionId, Callback)>>,
    pending: HashMap<TimerId, Pending>,
}

/// The timer engine. Cheap to clone; clones share one pending set, so a
/// single engine can serve several components as long as they keep their
/// event names disjoint.
#[derive(Clone, Default)]
pub struct TimerEngine {
    inner: Arc<Mutex<Inner>>,
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

impl TimerEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `callback` to `event`. Multiple callbacks per event are
    /// allowed and each fired timer invokes all of them.
    pub fn on(
        &self,
        event: &str,
        callback: impl Fn(serde_json::Value) + Send + Sync + 'static,
    ) -> Result<SubscriptionId> {
        Self::require_event_name(event)?;
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;
        inner
            .callbacks
            .entry(event.to_string())
            .or_default()
            .push((id, Arc::new(callback)));
        Ok(id)
    }

    /// Remove a subscription. Unknown ids are a no-op.
    pub fn off(&self, event: &str, subscription: SubscriptionId) -> Result<()> {
        Self::require_event_name(event)?;
        let mut inner = self.inner.lock().unwrap();
        if let Some(callbacks) = inner.callbacks.get_mut(event) {
            callbacks.retain(|(id, _)| *id != subscription);
        }
        Ok(())
    }

    /// Schedule a one-shot dispatch of `event` carrying `payload`,
    /// `delay_ms` from now. A zero delay fires on the next scheduler
    /// tick, never synchronously.
    pub fn set(&self, event: &str, delay_ms: i64, payload: serde_json::Value) -> Result<TimerId> {
        Self::require_event_name(event)?;
        let fire_at = now_ms() + delay_ms.max(0);
        Ok(self.arm(event, fire_at, payload))
    }

    /// Cancel a pending timer. Idempotent: unknown or already-fired ids
    /// are a no-op.
    pub fn cancel(&self, id: TimerId) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(pending) = inner.pending.remove(&id) {
            pending.task.abort();
        }
    }

    /// Cancel every pending timer.
    pub fn cancel_all(&self) {
        let mut inner = self.inner.lock().unwrap();
        for (_, pending) in inner.pending.drain() {
            pending.task.abort();
        }
    }

    /// Number of timers currently pending.
    pub fn pending_count(&self) -> usize {
        self.inner.lock().unwrap().pending.len()
    }

    /// Serialize all pending timers. Timer ids are process-local and are
    /// not part of the snapshot.
    pub fn to_snapshot(&self) -> TimerSnapshot {
        let inner = self.inner.lock().unwrap();
        let mut entries: Vec<(TimerId, SnapshotEvent)> = inner
            .pending
            .iter()
            .map(|(id, p)| {
                (
                    *id,
                    SnapshotEvent {
                        event: p.event.clone(),
                        fire_at: p.fire_at,
                        payload: p.payload.clone(),
                    },
                )
            })
            .collect();
        // Scheduling order doubles as FIFO order within an event.
        entries.sort_by_key(|(id, _)| *id);
        TimerSnapshot {
            events: entries.into_iter().map(|(_, e)| e).collect(),
        }
    }

    /// Re-arm every timer in `snapshot`. Entries whose fire time has
    /// passed are re-armed with zero delay unless `ignore_expired` is
    /// set, in which case they are dropped without firing. Returns the
    /// entries that were restored.
    pub fn from_snapshot(
        &self,
        snapshot: &TimerSnapshot,
        ignore_expired: bool,
    ) -> Vec<SnapshotEvent> {
        let now = now_ms();
        let mut restored = Vec::new();
        for entry in &snapshot.events {
            let remaining = (entry.fire_at - now).max(0);
            if remaining == 0 && ignore_expired {
                continue;
            }
            self.arm(&entry.event, entry.fire_at, entry.payload.clone());
            restored.push(entry.clone());
        }
        restored
    }

    fn require_event_name(event: &str) -> Result<()> {
        if event.is_empty() {
            return Err(CoreError::InvalidArgument("empty event name".to_string()));
        }
        Ok(())
    }

    /// Register a pending timer firing at the absolute instant `fire_at`.
    fn arm(&self, event: &str, fire_at: i64, payload: serde_json::Value) -> TimerId {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;

        let delay = (fire_at - now_ms()).max(0) as u64;
        let weak = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            Self::fire(weak, id);
        });

        inner.pending.insert(
            id,
            Pending {
                event: event.to_string(),
                fire_at,
                payload,
                task,
            },
        );
        id
    }

    fn fire(weak: Weak<Mutex<Inner>>, id: TimerId) {
        let Some(inner_arc) = weak.upgrade() else {
            return;
        };

        let (callbacks, payload) = {
            let mut inner = inner_arc.lock().unwrap();
            // A cancel that won the race already removed the entry.
            let Some(pending) = inner.pending.remove(&id) else {
                return;
            };
            let callbacks: Vec<Callback> = inner
                .callbacks
                .get(&pending.event)
                .map(|subs| subs.iter().map(|(_, cb)| cb.clone()).collect())
                .unwrap_or_default();
            (callbacks, pending.payload)
        };

        // Zero subscribers is not an error; the dispatch is a no-op.
        for callback in callbacks {
            let payload = payload.clone();
            tokio::spawn(async move {
                callback(payload);
            });
        }
    }
}
