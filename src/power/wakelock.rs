//! Reference-counted wakelock with a release-grace timer.
//!
//! Grounded on `util/power/wakelock.cc`: acquiring the lock for any
//! [`WakeSource`] while the aggregate refcount is zero takes the real
//! kernel wakelock; releasing the last source doesn't drop it
//! immediately but arms a short grace timer, so back-to-back
//! acquire/release pairs across the router's worker threads don't
//! thrash the kernel wakelock.

use crate::power::watchdog::WakelockWatchdog;
use crate::timer::{Timer, TimerService};
use crate::types::WakeSource;
use parking_lot::Mutex;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

const RELEASE_GRACE: Duration = Duration::from_millis(100);

/// Abstraction over the host's kernel wakelock mechanism, so the
/// voting logic in [`Wakelock`] is testable without touching
/// `/sys/power`.
pub trait PowerInterface: Send + Sync {
    fn acquire_wakelock(&self);
    fn release_wakelock(&self);
}

/// Writes to the standard Android kernel wakelock sysfs interface.
/// If those nodes don't exist (a non-Android Linux host, or a
/// sandboxed test run), acquire/release are silently no-ops.
pub struct SysfsPowerInterface {
    name: String,
}

impl SysfsPowerInterface {
    pub fn new(name: impl Into<String>) -> Self {
        SysfsPowerInterface { name: name.into() }
    }

    fn write_node(&self, path: &str) {
        match std::fs::OpenOptions::new().write(true).open(path) {
            Ok(mut file) => {
                if let Err(e) = file.write_all(self.name.as_bytes()) {
                    log::warn!("failed to write {}: {}", path, e);
                }
            }
            Err(e) => {
                log::debug!("wakelock sysfs node {} unavailable: {}", path, e);
            }
        }
    }
}

impl PowerInterface for SysfsPowerInterface {
    fn acquire_wakelock(&self) {
        self.write_node("/sys/power/wake_lock");
    }

    fn release_wakelock(&self) {
        self.write_node("/sys/power/wake_unlock");
    }
}

struct State {
    counts: [u32; WakeSource::ALL.len()],
    release_timer: Option<Timer>,
}

fn index(source: WakeSource) -> usize {
    WakeSource::ALL.iter().position(|s| *s == source).unwrap()
}

/// Votes per [`WakeSource`] aggregated into a single kernel wakelock.
///
/// Each source with a nonzero vote also has an active bark/bite
/// [`WakelockWatchdog`] timer (§4.4 invariant ii): `acquire`/`release`
/// arm and disarm it in lockstep with the vote, so callers only ever
/// interact with the wakelock and never touch the watchdog directly.
pub struct Wakelock {
    state: Mutex<State>,
    power: Arc<dyn PowerInterface>,
    timers: Arc<TimerService>,
    watchdog: Arc<WakelockWatchdog>,
}

impl Wakelock {
    pub fn new(power: Arc<dyn PowerInterface>, timers: Arc<TimerService>) -> Arc<Self> {
        let watchdog = WakelockWatchdog::new(timers.clone());
        Arc::new(Wakelock {
            state: Mutex::new(State {
                counts: [0; WakeSource::ALL.len()],
                release_timer: None,
            }),
            power,
            timers,
            watchdog,
        })
    }

    fn total(state: &State) -> u32 {
        state.counts.iter().sum()
    }

    pub fn acquire(self: &Arc<Self>, source: WakeSource) {
        let mut state = self.state.lock();
        let was_zero = Self::total(&state) == 0;
        let idx = index(source);
        let source_was_idle = state.counts[idx] == 0;
        state.counts[idx] += 1;

        // A pending release is moot now: cancel it.
        state.release_timer = None;

        if was_zero {
            self.power.acquire_wakelock();
        }
        if source_was_idle {
            self.watchdog.arm(source);
        }
    }

    pub fn release(self: &Arc<Self>, source: WakeSource) {
        let mut state = self.state.lock();
        let idx = index(source);
        if state.counts[idx] == 0 {
            log::warn!("{:?} released with no outstanding vote", source);
            return;
        }
        state.counts[idx] -= 1;
        if state.counts[idx] == 0 {
            self.watchdog.disarm(source);
        }

        if Self::total(&state) == 0 {
            let this = self.clone();
            let timer = self.timers.schedule(RELEASE_GRACE, move || {
                this.release_grace_expired();
            });
            state.release_timer = Some(timer);
        }
    }

    fn release_grace_expired(self: &Arc<Self>) {
        let mut state = self.state.lock();
        if Self::total(&state) == 0 {
            self.power.release_wakelock();
        }
        state.release_timer = None;
    }

    pub fn is_held(&self, source: WakeSource) -> bool {
        self.state.lock().counts[index(source)] > 0
    }

    pub fn total_held(&self) -> u32 {
        Self::total(&self.state.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingPower {
        acquires: AtomicUsize,
        releases: AtomicUsize,
    }

    impl PowerInterface for CountingPower {
        fn acquire_wakelock(&self) {
            self.acquires.fetch_add(1, Ordering::SeqCst);
        }
        fn release_wakelock(&self) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn acquire_then_release_holds_through_grace_period() {
        let power = Arc::new(CountingPower::default());
        let timers = Arc::new(TimerService::new().unwrap());
        let wakelock = Wakelock::new(power.clone(), timers);

        wakelock.acquire(WakeSource::Tx);
        assert_eq!(power.acquires.load(Ordering::SeqCst), 1);

        wakelock.release(WakeSource::Tx);
        // Still held immediately after release; the grace timer hasn't fired.
        assert_eq!(power.releases.load(Ordering::SeqCst), 0);

        std::thread::sleep(Duration::from_millis(250));
        assert_eq!(power.releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reacquire_within_grace_window_cancels_release() {
        let power = Arc::new(CountingPower::default());
        let timers = Arc::new(TimerService::new().unwrap());
        let wakelock = Wakelock::new(power.clone(), timers);

        wakelock.acquire(WakeSource::Rx);
        wakelock.release(WakeSource::Rx);
        wakelock.acquire(WakeSource::Rx);

        std::thread::sleep(Duration::from_millis(250));
        assert_eq!(power.releases.load(Ordering::SeqCst), 0);
        assert_eq!(power.acquires.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn multiple_sources_keep_lock_until_all_release() {
        let power = Arc::new(CountingPower::default());
        let timers = Arc::new(TimerService::new().unwrap());
        let wakelock = Wakelock::new(power.clone(), timers);

        wakelock.acquire(WakeSource::Tx);
        wakelock.acquire(WakeSource::Rx);
        wakelock.release(WakeSource::Tx);

        std::thread::sleep(Duration::from_millis(250));
        assert_eq!(power.releases.load(Ordering::SeqCst), 0);

        wakelock.release(WakeSource::Rx);
        std::thread::sleep(Duration::from_millis(250));
        assert_eq!(power.releases.load(Ordering::SeqCst), 1);
    }
}
