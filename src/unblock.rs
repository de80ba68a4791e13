//! Global "unblock all" override.
//!
//! One boolean-plus-expiry cell independent of the whitelist: while
//! active, every URL is exempt from blocking. Activation is time-boxed in
//! hours; the deactivation timer is persisted by timestamp and re-armed
//! on init, so the override lapses at the right wall-clock instant even
//! across a restart.

use std::sync::{Arc, Mutex, Weak};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::MissingStatePolicy;
use crate::error::{CoreError, Result};
use crate::storage::Storage;
use crate::timer::{TimerEngine, TimerId};

const UNBLOCK_STORAGE_KEY: &str = "__unblock_all";

/// Timer event namespace owned by this component (disjoint from the
/// whitelist's).
const EXPIRED_EVENT: &str = "unblock.expired";

pub type ExpiredCallback = Arc<dyn Fn() + Send + Sync>;

/// Persisted shape: active flag plus the deactivation instant.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct OverrideState {
    active: bool,
    timestamp: i64,
}

struct Inner {
    active: bool,
    expires_at: i64,
    timer_id: Option<TimerId>,
    on_expired: Option<ExpiredCallback>,
}

pub struct UnblockAll {
    inner: Arc<Mutex<Inner>>,
    timer: TimerEngine,
    storage: Arc<dyn Storage>,
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

impl UnblockAll {
    /// Restore the override from storage, re-arming the remaining
    /// deactivation delay when a previous activation has not lapsed yet.
    ///
    /// A missing record seeds the inactive default; whether that is also
    /// reported as [`CoreError::Load`] depends on `on_missing`.
    pub fn init(
        storage: Arc<dyn Storage>,
        timer: TimerEngine,
        on_missing: MissingStatePolicy,
    ) -> Result<Self> {
        let state: Option<OverrideState> = match storage.get(UNBLOCK_STORAGE_KEY)? {
            Some(blob) => Some(serde_json::from_value(blob)?),
            None => {
                storage.set(
                    UNBLOCK_STORAGE_KEY,
                    json!(OverrideState {
                        active: false,
                        timestamp: 0,
                    }),
                )?;
                if on_missing == MissingStatePolicy::Fail {
                    return Err(CoreError::Load(UNBLOCK_STORAGE_KEY.to_string()));
                }
                None
            }
        };

        let unblock = Self {
            inner: Arc::new(Mutex::new(Inner {
                active: false,
                expires_at: 0,
                timer_id: None,
                on_expired: None,
            })),
            timer,
            storage,
        };
        unblock.subscribe_expiry()?;

        if let Some(OverrideState { active: true, timestamp }) = state {
            let remaining = timestamp - now_ms();
            if remaining > 0 {
                let mut inner = unblock.inner.lock().unwrap();
                inner.active = true;
                inner.expires_at = timestamp;
                inner.timer_id = Some(unblock.timer.set(EXPIRED_EVENT, remaining, json!(null))?);
                tracing::info!("restored active unblock-all ({} ms remaining)", remaining);
            }
        }

        Ok(unblock)
    }

    /// Whether the override is active right now. Computed against the
    /// wall clock, so it flips at the deadline even before the
    /// deactivation timer is delivered.
    pub fn active(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.active && inner.expires_at > now_ms()
    }

    /// Deactivation instant (epoch ms) of the current activation, if any.
    pub fn expires_at(&self) -> Option<i64> {
        let inner = self.inner.lock().unwrap();
        if inner.active { Some(inner.expires_at) } else { None }
    }

    /// Activate for `hours` (fractions allowed). `hours <= 0` deactivates
    /// immediately and cancels any pending deactivation timer.
    pub fn set(&self, hours: f64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();

        if let Some(timer_id) = inner.timer_id.take() {
            self.timer.cancel(timer_id);
        }

        if hours > 0.0 {
            let duration_ms = (hours * 3_600_000.0).round() as i64;
            let expires_at = now_ms() + duration_ms;
            inner.active = true;
            inner.expires_at = expires_at;
            inner.timer_id = Some(self.timer.set(EXPIRED_EVENT, duration_ms, json!(null))?);
            self.storage.set(
                UNBLOCK_STORAGE_KEY,
                json!(OverrideState {
                    active: true,
                    timestamp: expires_at,
                }),
            )?;
            tracing::info!("unblock-all activated for {} hour(s), until {}", hours, expires_at);
        } else {
            inner.active = false;
            inner.expires_at = 0;
            self.storage.set(
                UNBLOCK_STORAGE_KEY,
                json!(OverrideState {
                    active: false,
                    timestamp: 0,
                }),
            )?;
            tracing::info!("unblock-all deactivated");
        }
        Ok(())
    }

    /// Set the callback invoked when an activation lapses naturally.
    /// Single slot, last writer wins.
    pub fn set_on_expired(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.inner.lock().unwrap().on_expired = Some(Arc::new(callback));
    }

    fn subscribe_expiry(&self) -> Result<()> {
        let weak: Weak<Mutex<Inner>> = Arc::downgrade(&self.inner);
        let storage = self.storage.clone();
        self.timer.on(EXPIRED_EVENT, move |_payload| {
            let Some(inner_arc) = weak.upgrade() else {
                return;
            };

            let callback = {
                let mut inner = inner_arc.lock().unwrap();
                // Stale firing after a newer activation: not due yet.
                if !inner.active || inner.expires_at > now_ms() {
                    return;
                }
                inner.active = false;
                inner.expires_at = 0;
                inner.timer_id = None;
                if let Err(err) = storage.set(
                    UNBLOCK_STORAGE_KEY,
                    json!(OverrideState {
                        active: false,
                        timestamp: 0,
                    }),
                ) {
                    tracing::error!("failed to persist unblock-all expiry: {err}");
                }
                inner.on_expired.clone()
            };

            tracing::info!("unblock-all expired");
            if let Some(callback) = callback {
                callback();
            }
        })?;
        Ok(())
    }
}
