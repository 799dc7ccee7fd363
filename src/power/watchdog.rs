//! Per-source bark/bite watchdog.
//!
//! Grounded on `util/power/wakelock_watchdog.cc`: every [`WakeSource`]
//! vote arms a pair of timers — a "bark" warning at half the source's
//! budget and a "bite" at the full budget. A bite is fatal for every
//! source except `Transport`, which re-arms its own timer instead of
//! crashing (a wedged UART can be legitimately slow without being
//! fatal to the whole HAL).

use crate::timer::{Timer, TimerService};
use crate::types::WakeSource;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

fn budget(source: WakeSource) -> Duration {
    match source {
        WakeSource::Tx | WakeSource::Rx | WakeSource::RouterTask => Duration::from_secs(5),
        WakeSource::HciBusy => Duration::from_secs(10),
        WakeSource::Transport | WakeSource::Initialize | WakeSource::Close => {
            Duration::from_secs(20)
        }
    }
}

fn bite_reason(source: WakeSource) -> &'static str {
    match source {
        WakeSource::Tx => "TX timeout",
        WakeSource::Rx => "RX timeout",
        WakeSource::HciBusy => "HCI timeout",
        WakeSource::RouterTask => "Router Task timeout",
        WakeSource::Transport => "Transport timeout",
        WakeSource::Initialize => "Initialize timeout",
        WakeSource::Close => "Close timeout",
    }
}

struct ArmedTimers {
    bark: Timer,
    bite: Timer,
}

/// Watches every outstanding [`WakeSource`] vote for a stuck holder.
pub struct WakelockWatchdog {
    timers: Arc<TimerService>,
    armed: Mutex<HashMap<WakeSource, ArmedTimers>>,
}

impl WakelockWatchdog {
    pub fn new(timers: Arc<TimerService>) -> Arc<Self> {
        Arc::new(WakelockWatchdog {
            timers,
            armed: Mutex::new(HashMap::new()),
        })
    }

    /// Arm the watchdog for `source`. Call when the corresponding
    /// wakelock vote is taken.
    pub fn arm(self: &Arc<Self>, source: WakeSource) {
        self.arm_with_budget(source, budget(source));
    }

    /// Arm the watchdog for `source` with an explicit budget, bypassing
    /// the real per-source table. Exists so tests can exercise bark/bite
    /// without waiting on multi-second production budgets.
    pub fn arm_with_budget(self: &Arc<Self>, source: WakeSource, full: Duration) {
        let half = full / 2;

        let bark_self = self.clone();
        let bark = self.timers.schedule(half, move || bark_self.on_bark(source));

        let bite_self = self.clone();
        let bite = self.timers.schedule(full, move || bite_self.on_bite(source));

        self.armed.lock().insert(source, ArmedTimers { bark, bite });
    }

    /// Disarm the watchdog for `source`. Call when the corresponding
    /// wakelock vote is released.
    pub fn disarm(&self, source: WakeSource) {
        self.armed.lock().remove(&source);
    }

    fn on_bark(&self, source: WakeSource) {
        log::warn!(
            "wakelock watchdog bark: {:?} has been held for over {:?}",
            source,
            budget(source) / 2
        );
    }

    fn on_bite(self: &Arc<Self>, source: WakeSource) {
        if source == WakeSource::Transport {
            log::error!(
                "wakelock watchdog bite on Transport: re-arming instead of crashing"
            );
            self.arm(source);
            return;
        }

        log::error!("wakelock watchdog bite: {}", bite_reason(source));
        panic!("{}", bite_reason(source));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arm_and_disarm_does_not_panic() {
        let timers = Arc::new(TimerService::new().unwrap());
        let watchdog = WakelockWatchdog::new(timers);
        watchdog.arm(WakeSource::Tx);
        watchdog.disarm(WakeSource::Tx);
        std::thread::sleep(Duration::from_millis(50));
    }

    #[test]
    fn transport_bite_rearms_instead_of_escalating() {
        // A Transport bite re-arms its own timer rather than panicking;
        // observe that the process is still alive and the source is
        // still armed well past its (short, test-only) budget.
        let timers = Arc::new(TimerService::new().unwrap());
        let watchdog = WakelockWatchdog::new(timers);
        watchdog.arm_with_budget(WakeSource::Transport, Duration::from_millis(40));

        std::thread::sleep(Duration::from_millis(200));
        assert!(watchdog.armed.lock().contains_key(&WakeSource::Transport));
    }

    #[test]
    fn disarm_before_bite_prevents_it() {
        let timers = Arc::new(TimerService::new().unwrap());
        let watchdog = WakelockWatchdog::new(timers);
        watchdog.arm_with_budget(WakeSource::RouterTask, Duration::from_millis(500));
        watchdog.disarm(WakeSource::RouterTask);

        // Would have bitten (and panicked the dispatch thread) by now if
        // disarm hadn't cancelled the timers.
        std::thread::sleep(Duration::from_millis(700));
    }

    #[test]
    fn bite_panics_the_dispatch_thread_with_the_source_specific_reason() {
        use std::sync::Mutex as StdMutex;

        static CAUGHT: StdMutex<Option<String>> = StdMutex::new(None);
        let previous_hook = std::panic::take_hook();
        std::panic::set_hook(Box::new(|info| {
            let message = info.payload().downcast_ref::<String>().cloned().unwrap_or_default();
            *CAUGHT.lock().unwrap() = Some(message);
        }));

        let timers = Arc::new(TimerService::new().unwrap());
        let watchdog = WakelockWatchdog::new(timers);
        watchdog.arm_with_budget(WakeSource::Tx, Duration::from_millis(40));

        std::thread::sleep(Duration::from_millis(300));
        std::panic::set_hook(previous_hook);

        assert_eq!(CAUGHT.lock().unwrap().as_deref(), Some("TX timeout"));
    }
}
