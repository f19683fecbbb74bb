//! Last-resort liveness check.
//!
//! Some BLE stacks wedge in ways no reconnect gets out of. When a data class
//! has not been decoded within the horizon, a [`RecoveryAction`] runs; the
//! binary installs [`ExitProcess`] so the service supervisor restarts it.

use crate::snapshot::DataClass;
use crate::Error;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub trait RecoveryAction: Send + Sync {
    fn recover(&self, cause: &Error);
}

/// Logs the cause and terminates the process.
#[derive(Debug, Clone, Copy)]
pub struct ExitProcess {
    pub code: i32,
}

impl Default for ExitProcess {
    fn default() -> Self {
        Self { code: 1 }
    }
}

impl RecoveryAction for ExitProcess {
    fn recover(&self, cause: &Error) {
        log::error!("{cause}, restarting");
        std::process::exit(self.code);
    }
}

#[derive(Debug)]
pub struct Watchdog {
    horizon: Duration,
    stamps: Mutex<[Instant; 2]>,
}

impl Watchdog {
    /// A zero `horizon` disables the watchdog.
    pub fn new(horizon: Duration) -> Self {
        let now = Instant::now();
        Self {
            horizon,
            stamps: Mutex::new([now; 2]),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.horizon.is_zero()
    }

    /// Records a successful decode of `class` at `at`.
    pub fn stamp_at(&self, class: DataClass, at: Instant) {
        let mut stamps = self.stamps.lock().unwrap_or_else(PoisonError::into_inner);
        stamps[class.index()] = at;
    }

    /// Returns the liveness error for the stalest class past the horizon, if any.
    ///
    /// Every stale class is re-armed at `now`, so one crossing yields one error.
    pub fn check(&self, now: Instant) -> Option<Error> {
        if !self.is_enabled() {
            return None;
        }
        let mut stamps = self.stamps.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stalest: Option<(DataClass, Duration)> = None;
        for class in DataClass::ALL {
            let elapsed = now.saturating_duration_since(stamps[class.index()]);
            if elapsed > self.horizon {
                stamps[class.index()] = now;
                if stalest.map_or(true, |(_, e)| elapsed > e) {
                    stalest = Some((class, elapsed));
                }
            }
        }
        stalest.map(|(class, elapsed)| Error::Liveness { class, elapsed })
    }

    /// Checks every `period` on the runtime and hands each failure to `action`.
    pub fn spawn(self: Arc<Self>, period: Duration, action: Arc<dyn RecoveryAction>) -> JoinHandle<()> {
        tokio::spawn(async move {
            if !self.is_enabled() {
                log::debug!("Watchdog disabled");
                return;
            }
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if let Some(err) = self.check(Instant::now()) {
                    action.recover(&err);
                }
            }
        })
    }
}
