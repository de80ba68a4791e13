//! Whitelist: domain → expiry map with timer-driven expiration.
//!
//! Each entry exempts one canonical domain from blocking until an
//! absolute expiry instant, or forever ([`FOREVER`]). The map is
//! persisted as one JSON blob; expiry timers are re-armed from persisted
//! timestamps on init, so deadlines survive process restarts.
//!
//! `check` is computed purely from timestamps. Timer delivery only
//! removes lapsed entries from the active map and drives the expired
//! listener; blocking correctness never depends on it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::MissingStatePolicy;
use crate::domain::{FOREVER, canonical_domain};
use crate::error::{CoreError, Result};
use crate::storage::Storage;
use crate::timer::{TimerEngine, TimerId};

const WHITELIST_STORAGE_KEY: &str = "__whitelist";

/// Timer event namespace owned by this component.
const EXPIRED_EVENT: &str = "whitelist.expired";

/// Listener invoked with the affected domain, off the caller's stack.
pub type DomainListener = Arc<dyn Fn(String) + Send + Sync>;

/// One whitelist entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    pub domain: String,
    /// Absolute expiry in epoch milliseconds, or [`FOREVER`].
    pub timestamp: i64,
    /// Process-local handle of the armed expiry timer, if any.
    #[serde(skip)]
    timer_id: Option<TimerId>,
}

/// Outcome of a whitelist lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    pub blocked: bool,
    /// Milliseconds remaining, `-1` for forever. `None` when blocked.
    pub time_left: Option<i64>,
}

impl CheckResult {
    fn blocked() -> Self {
        Self {
            blocked: true,
            time_left: None,
        }
    }
}

struct Inner {
    entries: HashMap<String, Entry>,
    change_listener: Option<DomainListener>,
    expired_listener: Option<DomainListener>,
}

pub struct Whitelist {
    inner: Arc<Mutex<Inner>>,
    timer: TimerEngine,
    storage: Arc<dyn Storage>,
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

impl Whitelist {
    /// Load the persisted whitelist and re-arm expiry timers for entries
    /// still in the future.
    ///
    /// A missing blob is [`CoreError::Load`] under
    /// [`MissingStatePolicy::Fail`]; under
    /// [`MissingStatePolicy::InitEmpty`] an empty map is created and
    /// persisted.
    pub fn init(
        storage: Arc<dyn Storage>,
        timer: TimerEngine,
        on_missing: MissingStatePolicy,
    ) -> Result<Self> {
        let entries: HashMap<String, Entry> = match storage.get(WHITELIST_STORAGE_KEY)? {
            Some(blob) => {
                let entries = serde_json::from_value(blob)?;
                tracing::debug!(
                    "loaded whitelist from storage using key={}",
                    WHITELIST_STORAGE_KEY
                );
                entries
            }
            None => match on_missing {
                MissingStatePolicy::Fail => {
                    return Err(CoreError::Load(WHITELIST_STORAGE_KEY.to_string()));
                }
                MissingStatePolicy::InitEmpty => {
                    let entries = HashMap::new();
                    storage.set(WHITELIST_STORAGE_KEY, json!(entries))?;
                    entries
                }
            },
        };

        let inner = Arc::new(Mutex::new(Inner {
            entries,
            change_listener: None,
            expired_listener: None,
        }));

        let whitelist = Self {
            inner,
            timer,
            storage,
        };
        whitelist.subscribe_expiry()?;
        whitelist.rearm_persisted();
        Ok(whitelist)
    }

    /// Add `url`'s domain to the whitelist until `timestamp` (epoch ms),
    /// or forever when `timestamp == FOREVER`. Re-adding overwrites the
    /// existing entry and cancels its timer.
    ///
    /// Returns `Ok(false)` when the URL does not canonicalize; storage
    /// failures propagate after the in-memory update.
    pub fn add_url(&self, url: &str, timestamp: i64) -> Result<bool> {
        let Some(domain) = canonical_domain(url) else {
            return Ok(false);
        };
        tracing::info!("whitelisting {} until {} ({})", domain, timestamp, url);

        let mut inner = self.inner.lock().unwrap();
        if let Some(previous) = inner.entries.get(&domain) {
            if let Some(timer_id) = previous.timer_id {
                self.timer.cancel(timer_id);
            }
        }

        let timer_id = if timestamp == FOREVER {
            None
        } else {
            Some(self.timer.set(
                EXPIRED_EVENT,
                timestamp - now_ms(),
                json!({ "domain": domain }),
            )?)
        };

        inner.entries.insert(
            domain.clone(),
            Entry {
                domain: domain.clone(),
                timestamp,
                timer_id,
            },
        );
        self.persist(&inner.entries)?;
        Self::notify(inner.change_listener.clone(), domain);
        Ok(true)
    }

    /// Remove `url`'s domain from the whitelist, cancelling its timer.
    /// Returns `Ok(false)` when the URL does not canonicalize or has no
    /// entry.
    pub fn remove_url(&self, url: &str) -> Result<bool> {
        let Some(domain) = canonical_domain(url) else {
            return Ok(false);
        };

        let mut inner = self.inner.lock().unwrap();
        let Some(entry) = inner.entries.remove(&domain) else {
            return Ok(false);
        };
        tracing::info!("un-whitelisting {} ({})", domain, url);

        if let Some(timer_id) = entry.timer_id {
            self.timer.cancel(timer_id);
        }
        self.persist(&inner.entries)?;
        Self::notify(inner.change_listener.clone(), domain);
        Ok(true)
    }

    /// Check whether `url` is currently blocked.
    ///
    /// Blocked iff there is no entry for the domain or its deadline has
    /// passed. The tie at exactly zero remaining milliseconds counts as
    /// blocked.
    pub fn check(&self, url: &str) -> CheckResult {
        let Some(domain) = canonical_domain(url) else {
            return CheckResult::blocked();
        };

        let inner = self.inner.lock().unwrap();
        let Some(entry) = inner.entries.get(&domain) else {
            return CheckResult::blocked();
        };

        if entry.timestamp < 0 {
            return CheckResult {
                blocked: false,
                time_left: Some(FOREVER),
            };
        }

        let time_left = (entry.timestamp - now_ms()).max(0);
        if time_left > 0 {
            CheckResult {
                blocked: false,
                time_left: Some(time_left),
            }
        } else {
            CheckResult::blocked()
        }
    }

    /// Current entries, sorted by domain.
    pub fn entries(&self) -> Vec<Entry> {
        let inner = self.inner.lock().unwrap();
        let mut entries: Vec<Entry> = inner.entries.values().cloned().collect();
        entries.sort_by(|a, b| a.domain.cmp(&b.domain));
        entries
    }

    /// Set the listener for add/remove changes. Single slot, last writer
    /// wins.
    pub fn set_change_listener(&self, listener: impl Fn(String) + Send + Sync + 'static) {
        self.inner.lock().unwrap().change_listener = Some(Arc::new(listener));
    }

    /// Set the listener for natural expirations (timer-driven, not
    /// explicit removal). Single slot, last writer wins.
    pub fn set_expired_listener(&self, listener: impl Fn(String) + Send + Sync + 'static) {
        self.inner.lock().unwrap().expired_listener = Some(Arc::new(listener));
    }

    fn persist(&self, entries: &HashMap<String, Entry>) -> Result<()> {
        self.storage
            .set(WHITELIST_STORAGE_KEY, serde_json::to_value(entries)?)
    }

    fn notify(listener: Option<DomainListener>, domain: String) {
        if let Some(listener) = listener {
            tokio::spawn(async move {
                listener(domain);
            });
        }
    }

    /// Route expiry-timer firings back into the map.
    fn subscribe_expiry(&self) -> Result<()> {
        let weak: Weak<Mutex<Inner>> = Arc::downgrade(&self.inner);
        let storage = self.storage.clone();
        self.timer.on(EXPIRED_EVENT, move |payload| {
            let Some(inner_arc) = weak.upgrade() else {
                return;
            };
            let Some(domain) = payload.get("domain").and_then(|d| d.as_str()) else {
                return;
            };

            let (listener, removed) = {
                let mut inner = inner_arc.lock().unwrap();
                // A stale firing for an entry that was re-added (and whose
                // deadline is no longer due) must not evict the new entry.
                let due = inner
                    .entries
                    .get(domain)
                    .is_some_and(|e| e.timestamp >= 0 && e.timestamp <= now_ms());
                if due {
                    inner.entries.remove(domain);
                    let blob = serde_json::to_value(&inner.entries).unwrap_or_else(|_| json!({}));
                    if let Err(err) = storage.set(WHITELIST_STORAGE_KEY, blob) {
                        tracing::error!("failed to persist whitelist after expiry: {err}");
                    }
                }
                (inner.expired_listener.clone(), due)
            };

            if removed {
                tracing::info!("whitelist entry expired: {}", domain);
                Self::notify(listener, domain.to_string());
            }
        })?;
        Ok(())
    }

    /// Arm expiry timers for persisted entries still in the future.
    fn rearm_persisted(&self) {
        let mut inner = self.inner.lock().unwrap();
        let now = now_ms();
        for entry in inner.entries.values_mut() {
            if entry.timestamp > now {
                match self.timer.set(
                    EXPIRED_EVENT,
                    entry.timestamp - now,
                    json!({ "domain": entry.domain }),
                ) {
                    Ok(id) => entry.timer_id = Some(id),
                    Err(err) => tracing::error!("failed to arm expiry timer: {err}"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::{sleep, timeout};

    fn fresh() -> Whitelist {
        Whitelist::init(
            Arc::new(MemoryStorage::new()),
            TimerEngine::new(),
            MissingStatePolicy::InitEmpty,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn unknown_url_is_blocked() {
        let whitelist = fresh();
        assert!(whitelist.check("https://example.com").blocked);
    }

    #[tokio::test]
    async fn forever_entry_never_expires() {
        let whitelist = fresh();
        assert!(whitelist.add_url("https://example.com", FOREVER).unwrap());

        let result = whitelist.check("https://example.com");
        assert!(!result.blocked);
        assert_eq!(result.time_left, Some(FOREVER));
    }

    #[tokio::test]
    async fn unparseable_url_is_rejected() {
        let whitelist = fresh();
        assert!(!whitelist.add_url("not a url", FOREVER).unwrap());
        assert!(!whitelist.remove_url("not a url").unwrap());
    }

    #[tokio::test]
    async fn timed_entry_reports_time_left_then_blocks() {
        let whitelist = fresh();
        whitelist
            .add_url("https://example.com", now_ms() + 150)
            .unwrap();

        let result = whitelist.check("https://example.com");
        assert!(!result.blocked);
        let left = result.time_left.unwrap();
        assert!(left > 0 && left <= 150);

        sleep(Duration::from_millis(250)).await;
        assert!(whitelist.check("https://example.com").blocked);
    }

    #[tokio::test]
    async fn already_past_timestamp_is_blocked() {
        let whitelist = fresh();
        whitelist
            .add_url("https://example.com", now_ms() - 1)
            .unwrap();
        assert!(whitelist.check("https://example.com").blocked);
    }

    #[tokio::test]
    async fn remove_url_blocks_again() {
        let whitelist = fresh();
        whitelist.add_url("https://example.com", FOREVER).unwrap();
        assert!(whitelist.remove_url("https://example.com").unwrap());
        assert!(whitelist.check("https://example.com").blocked);
        // Second removal finds nothing.
        assert!(!whitelist.remove_url("https://example.com").unwrap());
    }

    #[tokio::test]
    async fn www_variant_shares_the_entry() {
        let whitelist = fresh();
        whitelist.add_url("https://example.com", FOREVER).unwrap();

        assert!(!whitelist.check("https://www.example.com/path").blocked);
        assert!(whitelist.check("https://sub.example.com").blocked);
    }

    #[tokio::test]
    async fn readding_overwrites_and_cancels_previous_timer() {
        let timer = TimerEngine::new();
        let whitelist = Whitelist::init(
            Arc::new(MemoryStorage::new()),
            timer.clone(),
            MissingStatePolicy::InitEmpty,
        )
        .unwrap();

        whitelist
            .add_url("https://example.com", now_ms() + 100)
            .unwrap();
        whitelist.add_url("https://example.com", FOREVER).unwrap();
        assert_eq!(timer.pending_count(), 0);

        // The first deadline passing must not evict the forever entry.
        sleep(Duration::from_millis(200)).await;
        let result = whitelist.check("https://example.com");
        assert!(!result.blocked);
        assert_eq!(result.time_left, Some(FOREVER));
    }

    #[tokio::test]
    async fn expiry_fires_expired_listener_and_drops_entry() {
        let whitelist = fresh();
        let (tx, mut rx) = mpsc::unbounded_channel();
        whitelist.set_expired_listener(move |domain| {
            let _ = tx.send(domain);
        });

        whitelist
            .add_url("https://example.com", now_ms() + 50)
            .unwrap();

        let fired = timeout(Duration::from_millis(1000), rx.recv())
            .await
            .unwrap();
        assert_eq!(fired.as_deref(), Some("example.com"));
        assert!(whitelist.entries().is_empty());
    }

    #[tokio::test]
    async fn explicit_removal_does_not_fire_expired_listener() {
        let whitelist = fresh();
        let (tx, mut rx) = mpsc::unbounded_channel();
        whitelist.set_expired_listener(move |domain| {
            let _ = tx.send(domain);
        });

        whitelist.add_url("https://example.com", FOREVER).unwrap();
        whitelist.remove_url("https://example.com").unwrap();

        sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn change_listener_sees_adds_and_removes() {
        let whitelist = fresh();
        let (tx, mut rx) = mpsc::unbounded_channel();
        whitelist.set_change_listener(move |domain| {
            let _ = tx.send(domain);
        });

        whitelist.add_url("https://example.com", FOREVER).unwrap();
        whitelist.remove_url("https://example.com").unwrap();

        let first = timeout(Duration::from_millis(500), rx.recv()).await.unwrap();
        let second = timeout(Duration::from_millis(500), rx.recv()).await.unwrap();
        assert_eq!(first.as_deref(), Some("example.com"));
        assert_eq!(second.as_deref(), Some("example.com"));
    }

    #[tokio::test]
    async fn missing_blob_fails_under_fail_policy() {
        let result = Whitelist::init(
            Arc::new(MemoryStorage::new()),
            TimerEngine::new(),
            MissingStatePolicy::Fail,
        );
        assert!(matches!(result, Err(CoreError::Load(_))));
    }

    #[tokio::test]
    async fn init_empty_seeds_storage() {
        let storage = Arc::new(MemoryStorage::new());
        {
            let _ = Whitelist::init(
                storage.clone(),
                TimerEngine::new(),
                MissingStatePolicy::InitEmpty,
            )
            .unwrap();
        }
        // A later strict init finds the seeded empty map.
        let whitelist =
            Whitelist::init(storage, TimerEngine::new(), MissingStatePolicy::Fail).unwrap();
        assert!(whitelist.entries().is_empty());
    }

    #[tokio::test]
    async fn restart_rearms_future_deadlines() {
        let storage = Arc::new(MemoryStorage::new());
        {
            let whitelist = Whitelist::init(
                storage.clone(),
                TimerEngine::new(),
                MissingStatePolicy::InitEmpty,
            )
            .unwrap();
            whitelist
                .add_url("https://example.com", now_ms() + 120)
                .unwrap();
            whitelist.add_url("https://forever.org", FOREVER).unwrap();
        }

        // "Restart": fresh engine and map from the same storage.
        let timer = TimerEngine::new();
        let whitelist =
            Whitelist::init(storage, timer.clone(), MissingStatePolicy::Fail).unwrap();
        assert_eq!(timer.pending_count(), 1);
        assert!(!whitelist.check("https://example.com").blocked);

        let (tx, mut rx) = mpsc::unbounded_channel();
        whitelist.set_expired_listener(move |domain| {
            let _ = tx.send(domain);
        });
        let fired = timeout(Duration::from_millis(1000), rx.recv())
            .await
            .unwrap();
        assert_eq!(fired.as_deref(), Some("example.com"));
        assert!(whitelist.check("https://example.com").blocked);
        assert!(!whitelist.check("https://forever.org").blocked);
    }

    #[tokio::test]
    async fn persisted_blob_carries_domains_and_timestamps() {
        let storage = Arc::new(MemoryStorage::new());
        let whitelist = Whitelist::init(
            storage.clone(),
            TimerEngine::new(),
            MissingStatePolicy::InitEmpty,
        )
        .unwrap();
        whitelist.add_url("https://example.com", FOREVER).unwrap();

        let blob = storage.get("__whitelist").unwrap().unwrap();
        assert_eq!(blob["example.com"]["timestamp"], json!(FOREVER));
    }
}
