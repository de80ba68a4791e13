//! Access controller.
//!
//! Composes the whitelist, PIN authority, and global override into the
//! decision function "is this URL currently blocked" and the
//! state-changing operations the host environment drives. After every
//! mutation that can affect open views, the host's refresh hook is
//! invoked so it can re-evaluate its tabs against the new state.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::auth::AuthChannel;
use crate::config::MissingStatePolicy;
use crate::domain::timestamp_from_hours;
use crate::error::{CoreError, Result};
use crate::pin::PinAuthority;
use crate::storage::Storage;
use crate::timer::TimerEngine;
use crate::unblock::UnblockAll;
use crate::whitelist::{CheckResult, Entry, Whitelist};

/// Host hook asked to re-evaluate all open views against current state.
pub type RefreshHook = Arc<dyn Fn() + Send + Sync>;

/// Snapshot of controller state for display.
#[derive(Debug, Clone)]
pub struct Status {
    pub pin_set: bool,
    pub unblock_all_active: bool,
    pub unblock_all_expires_at: Option<i64>,
    pub entries: Vec<Entry>,
}

pub struct AccessController {
    whitelist: Whitelist,
    pin: PinAuthority,
    unblock_all: UnblockAll,
    refresh: Arc<Mutex<Option<RefreshHook>>>,
}

impl AccessController {
    /// Initialize all components against shared storage and one timer
    /// engine. The global override's natural expiry triggers the refresh
    /// hook so the host re-blocks open views when the grace period ends.
    pub fn init(
        storage: Arc<dyn Storage>,
        timer: TimerEngine,
        on_missing: MissingStatePolicy,
    ) -> Result<Self> {
        let whitelist = Whitelist::init(storage.clone(), timer.clone(), on_missing)?;
        let pin = PinAuthority::init(storage.clone(), on_missing)?;
        let unblock_all = UnblockAll::init(storage, timer, on_missing)?;

        let refresh: Arc<Mutex<Option<RefreshHook>>> = Arc::new(Mutex::new(None));
        let slot = refresh.clone();
        unblock_all.set_on_expired(move || {
            if let Some(hook) = slot.lock().unwrap().clone() {
                hook();
            }
        });

        Ok(Self {
            whitelist,
            pin,
            unblock_all,
            refresh,
        })
    }

    /// Install the host's refresh hook. Single slot, last writer wins.
    pub fn set_refresh_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.refresh.lock().unwrap() = Some(Arc::new(hook));
    }

    /// Whether `url` should be blocked right now.
    pub fn is_blocked(&self, url: &str) -> bool {
        self.whitelist.check(url).blocked && !self.unblock_all.active()
    }

    /// Whitelist-level lookup (ignores the global override), for display.
    pub fn check(&self, url: &str) -> CheckResult {
        self.whitelist.check(url)
    }

    /// Attempt to unblock `url` until `expiry_timestamp` by presenting a
    /// PIN.
    ///
    /// An already-open URL succeeds trivially (the views are refreshed
    /// anyway). A wrong candidate yields [`CoreError::IncorrectPin`], or
    /// [`CoreError::PinNotConfigured`] when no PIN has been set yet.
    pub fn try_unblock_with_pin(
        &self,
        url: &str,
        candidate_pin: &str,
        expiry_timestamp: i64,
    ) -> Result<()> {
        if !self.is_blocked(url) {
            self.request_refresh();
            return Ok(());
        }

        if self.pin.check(candidate_pin) {
            if self.whitelist.add_url(url, expiry_timestamp)? {
                self.request_refresh();
                Ok(())
            } else {
                Err(CoreError::InvalidArgument(format!(
                    "url does not canonicalize: {url}"
                )))
            }
        } else if !self.pin.is_set() {
            Err(CoreError::PinNotConfigured)
        } else {
            Err(CoreError::IncorrectPin)
        }
    }

    /// Attempt to unblock `url` through the external authorization
    /// channel, waiting up to `budget` for the remote decision. A grant
    /// is treated exactly like a correct PIN entry with the granted
    /// duration.
    pub async fn try_unblock_with_auth<A: AuthChannel>(
        &self,
        auth: &A,
        url: &str,
        budget: Duration,
    ) -> Result<()> {
        if !self.is_blocked(url) {
            self.request_refresh();
            return Ok(());
        }

        let grant = auth.request_unblock(url, budget).await?;
        let timestamp = timestamp_from_hours(Some(grant.hours));
        if self.whitelist.add_url(url, timestamp)? {
            self.request_refresh();
            Ok(())
        } else {
            Err(CoreError::InvalidArgument(format!(
                "url does not canonicalize: {url}"
            )))
        }
    }

    /// Re-block `url` by removing its whitelist entry. Returns whether
    /// an entry was removed.
    pub fn block(&self, url: &str) -> Result<bool> {
        let removed = self.whitelist.remove_url(url)?;
        self.request_refresh();
        Ok(removed)
    }

    /// Suspend all blocking for `hours`; `hours <= 0` reinstates
    /// blocking immediately.
    pub fn unblock_all_for(&self, hours: f64) -> Result<()> {
        self.unblock_all.set(hours)?;
        self.request_refresh();
        Ok(())
    }

    /// Update the PIN; see [`PinAuthority::update`].
    pub fn update_pin(&self, old_pin: Option<&str>, new_pin: &str) -> Result<()> {
        self.pin.update(old_pin, new_pin)
    }

    pub fn status(&self) -> Status {
        Status {
            pin_set: self.pin.is_set(),
            unblock_all_active: self.unblock_all.active(),
            unblock_all_expires_at: self.unblock_all.expires_at(),
            entries: self.whitelist.entries(),
        }
    }

    pub fn whitelist(&self) -> &Whitelist {
        &self.whitelist
    }

    pub fn pin(&self) -> &PinAuthority {
        &self.pin
    }

    fn request_refresh(&self) {
        if let Some(hook) = self.refresh.lock().unwrap().clone() {
            hook();
        }
    }
}
