//! Stalled-fix watchdog.
//!
//! gpsd keeps replaying the last TPV when the receiver goes quiet, so a
//! fix whose timestamp has not advanced between two observations is stale.
//! The watchdog reverts it to the placeholder so downstream consumers (the
//! `status` packet, telemetry) stop treating it as current.

use std::sync::Arc;
use std::time::Duration;

use log::warn;

use crate::gnss::BLANK;
use crate::state::SyncState;
use crate::telemetry::{TelemetryEvent, TelemetrySender};

const CHECK_PERIOD: Duration = Duration::from_secs(3);

pub struct Watchdog {
    state: Arc<SyncState>,
    telemetry: TelemetrySender,
    last_time: Option<String>,
}

impl Watchdog {
    pub fn new(state: Arc<SyncState>, telemetry: TelemetrySender) -> Self {
        Watchdog {
            state,
            telemetry,
            last_time: None,
        }
    }

    pub fn run(mut self) {
        loop {
            self.step();
            std::thread::sleep(CHECK_PERIOD);
        }
    }

    /// One observation. A valid fix time identical to the previous
    /// observation means the stream stalled; reset and report.
    fn step(&mut self) {
        let current = {
            let fix = self.state.fix.read().unwrap_or_else(|e| e.into_inner());
            fix.time.clone()
        };

        if current == BLANK {
            self.last_time = None;
            return;
        }

        if self.last_time.as_deref() == Some(current.as_str()) {
            warn!("GNSS fix stalled at {}, resetting", current);
            {
                let mut fix = self.state.fix.write().unwrap_or_else(|e| e.into_inner());
                fix.reset();
            }
            let snapshot = self
                .state
                .fix
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .clone();
            self.telemetry.push(TelemetryEvent::GnssReport { fix: snapshot });
            self.last_time = None;
        } else {
            self.last_time = Some(current);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::telemetry;

    fn fixture() -> (Watchdog, Arc<SyncState>, std::sync::mpsc::Receiver<TelemetryEvent>) {
        let state = Arc::new(SyncState::new(SyncConfig::default()));
        let (tx, rx) = telemetry::channel();
        (Watchdog::new(state.clone(), tx), state, rx)
    }

    fn set_fix_time(state: &SyncState, time: &str) {
        let mut fix = state.fix.write().unwrap();
        fix.time = time.to_string();
        fix.status = 1;
    }

    #[test]
    fn advancing_fix_is_left_alone() {
        let (mut watchdog, state, rx) = fixture();

        set_fix_time(&state, "12:00:00");
        watchdog.step();
        set_fix_time(&state, "12:00:03");
        watchdog.step();

        assert_eq!(state.fix.read().unwrap().time, "12:00:03");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn stalled_fix_is_reset_and_reported() {
        let (mut watchdog, state, rx) = fixture();

        set_fix_time(&state, "12:00:00");
        watchdog.step();
        watchdog.step();

        let fix = state.fix.read().unwrap();
        assert_eq!(fix.time, BLANK);
        assert_eq!(fix.status, -1);
        assert!(matches!(
            rx.try_recv().unwrap(),
            TelemetryEvent::GnssReport { .. }
        ));
    }

    #[test]
    fn placeholder_fix_never_trips_the_watchdog() {
        let (mut watchdog, state, rx) = fixture();

        watchdog.step();
        watchdog.step();
        watchdog.step();

        assert_eq!(state.fix.read().unwrap().time, BLANK);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn recovery_after_reset_starts_a_fresh_observation() {
        let (mut watchdog, state, _rx) = fixture();

        set_fix_time(&state, "12:00:00");
        watchdog.step();
        watchdog.step(); // resets

        // The same timestamp arriving again is a new observation, not an
        // immediate second stall.
        set_fix_time(&state, "12:00:00");
        watchdog.step();
        assert_eq!(state.fix.read().unwrap().time, "12:00:00");
    }
}
