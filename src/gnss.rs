//! GNSS daemon (gpsd) fix stream consumer.
//!
//! Connects to gpsd's JSON watch stream over TCP, normalizes TPV reports
//! into a [`GnssFix`], refreshes the satellite list from SKY reports, and
//! latches the one-way `gnss_synced` flag on the first valid fix. Stream
//! exhaustion and connection refusal are retry triggers, not errors.

use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use log::{debug, error, info, warn};
use serde::Serialize;
use serde_json::Value;

use crate::ops::Ops;
use crate::state::SyncState;
use crate::system;
use crate::telemetry::{TelemetryEvent, TelemetrySender};

const RETRY_DELAY: Duration = Duration::from_secs(5);
const WATCH_COMMAND: &str = "?WATCH={\"enable\":true,\"json\":true};\n";

/// Placeholder shown for fields with no valid data.
pub const BLANK: &str = "-";

/// One GNSS positioning report, normalized for display and packet encoding.
/// Mutated only by the GNSS monitor (and reset by the watchdog).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GnssFix {
    pub date: String,
    pub time: String,
    pub latitude: String,
    pub longitude: String,
    pub speed: String,
    pub altitude: String,
    pub mode: i64,
    pub status: i64,
    pub sats_change: bool,
    pub sat_list: Vec<Value>,
    pub sats: String,
    pub sats_valid: String,
    /// Epoch seconds of the last valid fix, used when the operator switches
    /// to an external source before the NTP daemon has settled.
    #[serde(skip)]
    pub epoch: Option<i64>,
}

impl Default for GnssFix {
    fn default() -> Self {
        GnssFix {
            date: BLANK.to_string(),
            time: BLANK.to_string(),
            latitude: BLANK.to_string(),
            longitude: BLANK.to_string(),
            speed: BLANK.to_string(),
            altitude: BLANK.to_string(),
            mode: -1,
            status: -1,
            sats_change: true,
            sat_list: Vec::new(),
            sats: BLANK.to_string(),
            sats_valid: BLANK.to_string(),
            epoch: None,
        }
    }
}

impl GnssFix {
    pub fn reset(&mut self) {
        *self = GnssFix::default();
    }
}

/// Format decimal degrees as a degree-minute-second string with a
/// hemisphere suffix, e.g. `55° 45' 20" N`.
fn format_dms(value: f64, positive: char, negative: char) -> String {
    let hemisphere = if value < 0.0 { negative } else { positive };
    let value = value.abs();
    let minutes = value.fract() * 60.0;
    let seconds = minutes.fract() * 60.0;
    format!(
        "{}\u{b0} {}' {}\" {}",
        value.trunc() as i64,
        minutes.trunc() as i64,
        seconds.trunc() as i64,
        hemisphere
    )
}

fn as_i64(value: &Value, default: i64) -> i64 {
    match value {
        Value::Number(n) => match n.as_i64() {
            Some(v) => v,
            None => n.as_f64().filter(|f| f.is_finite()).map_or(default, |f| f as i64),
        },
        _ => default,
    }
}

/// Apply a TPV report to the fix. Returns `true` when this report is the
/// first ever valid one, i.e. the caller must latch `gnss_synced`.
pub fn apply_tpv(fix: &mut GnssFix, report: &Value, already_synced: bool) -> bool {
    let mode = as_i64(&report["mode"], -1);
    fix.mode = mode;

    let mut status = as_i64(&report["status"], 0);
    // No 3D fix means the receiver's validity claim cannot be trusted.
    if mode < 3 {
        status = 0;
    }
    fix.status = status;

    let newly_synced = !already_synced && status > 0;

    if status == 0 {
        for field in [
            &mut fix.date,
            &mut fix.time,
            &mut fix.latitude,
            &mut fix.longitude,
            &mut fix.speed,
            &mut fix.altitude,
        ] {
            *field = BLANK.to_string();
        }
    } else {
        match report["time"].as_str().and_then(|t| DateTime::parse_from_rfc3339(t).ok()) {
            Some(utc) => {
                let local = utc.with_timezone(&Local);
                fix.epoch = Some(local.timestamp());
                fix.time = local.format("%H:%M:%S").to_string();
                fix.date = local.format("%d.%m.%y").to_string();
            }
            None => {
                fix.date = BLANK.to_string();
                fix.time = BLANK.to_string();
            }
        }

        fix.latitude = match report["lat"].as_f64().filter(|_| mode == 3) {
            Some(v) => format_dms(v, 'N', 'S'),
            None => BLANK.to_string(),
        };
        fix.longitude = match report["lon"].as_f64().filter(|_| mode == 3) {
            Some(v) => format_dms(v, 'E', 'W'),
            None => BLANK.to_string(),
        };
        fix.speed = match report["speed"].as_f64().filter(|_| mode == 3) {
            Some(v) => format!("{}", v as i64),
            None => BLANK.to_string(),
        };
        fix.altitude = match report["alt"].as_f64().filter(|_| mode == 3) {
            Some(v) => format!("{}", v as i64),
            None => BLANK.to_string(),
        };
    }

    // The satellite list is refreshed only by SKY reports.
    fix.sats_change = false;

    newly_synced
}

/// Apply a SKY report: refresh the satellite list and usage counters.
pub fn apply_sky(fix: &mut GnssFix, report: &Value) {
    if let Some(sats) = report["satellites"].as_array() {
        fix.sat_list = sats.clone();
        fix.sats = sats.len().to_string();
        fix.sats_valid = sats
            .iter()
            .filter(|s| s["used"].as_bool().unwrap_or(false))
            .count()
            .to_string();
        fix.sats_change = true;
    }
}

/// Long-lived task consuming the gpsd watch stream.
pub struct GnssMonitor {
    addr: String,
    state: Arc<SyncState>,
    ops: Arc<Ops>,
    telemetry: TelemetrySender,
}

impl GnssMonitor {
    pub fn new(
        addr: String,
        state: Arc<SyncState>,
        ops: Arc<Ops>,
        telemetry: TelemetrySender,
    ) -> Self {
        GnssMonitor {
            addr,
            state,
            ops,
            telemetry,
        }
    }

    pub fn run(&self) {
        info!("Connecting to the GNSS daemon at {}...", self.addr);
        loop {
            match self.connect() {
                Ok(stream) => self.consume(stream),
                Err(e) => {
                    // Expected while the daemon is starting up.
                    debug!("GNSS daemon connect failed: {}", e);
                    info!("Waiting for the GNSS daemon...");
                }
            }
            self.degrade_and_restart();
            std::thread::sleep(RETRY_DELAY);
        }
    }

    fn connect(&self) -> std::io::Result<TcpStream> {
        let stream = TcpStream::connect(&self.addr)?;
        let mut command_half = stream.try_clone()?;
        command_half.write_all(WATCH_COMMAND.as_bytes())?;
        Ok(stream)
    }

    fn consume(&self, stream: TcpStream) {
        let reader = BufReader::new(stream);
        for line in reader.lines() {
            let line = match line {
                Ok(l) => l,
                Err(e) => {
                    warn!("GNSS stream read error: {}", e);
                    return;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            let report: Value = match serde_json::from_str(&line) {
                Ok(v) => v,
                Err(e) => {
                    debug!("Ignoring unparseable GNSS report: {}", e);
                    continue;
                }
            };
            self.process_report(&report);
        }
        info!("GNSS stream ended, reconnecting...");
    }

    fn process_report(&self, report: &Value) {
        let newly_synced = match report["class"].as_str() {
            Some("TPV") => {
                let mut fix = self.state.fix.write().unwrap_or_else(|e| e.into_inner());
                apply_tpv(&mut fix, report, self.state.gnss_synced())
            }
            Some("SKY") => {
                let mut fix = self.state.fix.write().unwrap_or_else(|e| e.into_inner());
                apply_sky(&mut fix, report);
                false
            }
            _ => return,
        };

        if newly_synced && self.state.latch_gnss_synced() {
            info!("First valid satellite fix, enabling network time service");
            if let Err(e) = self.ops.refresh_listen_permissions() {
                error!("Failed to update time service permissions: {}", e);
            }
        }

        let snapshot = self.state.fix.read().unwrap_or_else(|e| e.into_inner()).clone();
        self.telemetry.push(TelemetryEvent::GnssReport { fix: snapshot });
    }

    /// Reset the fix, tell the world, and ask for a daemon restart.
    fn degrade_and_restart(&self) {
        {
            let mut fix = self.state.fix.write().unwrap_or_else(|e| e.into_inner());
            fix.reset();
        }
        let snapshot = self.state.fix.read().unwrap_or_else(|e| e.into_inner()).clone();
        self.telemetry.push(TelemetryEvent::GnssReport { fix: snapshot });
        system::systemctl("restart", "gpsd.socket");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tpv_without_3d_fix_never_trusts_status() {
        let mut fix = GnssFix::default();
        let report = json!({"class": "TPV", "mode": 2, "status": 1});
        let synced = apply_tpv(&mut fix, &report, false);
        assert!(!synced);
        assert_eq!(fix.mode, 2);
        assert_eq!(fix.status, 0);
        assert_eq!(fix.latitude, BLANK);
    }

    #[test]
    fn tpv_with_non_numeric_mode_defaults() {
        let mut fix = GnssFix::default();
        let report = json!({"class": "TPV", "mode": "bogus"});
        apply_tpv(&mut fix, &report, false);
        assert_eq!(fix.mode, -1);
        assert_eq!(fix.status, 0);
    }

    #[test]
    fn first_valid_fix_requests_latch() {
        let mut fix = GnssFix::default();
        let report = json!({
            "class": "TPV", "mode": 3, "status": 1,
            "time": "2024-06-01T12:00:00.000Z",
            "lat": 55.755833, "lon": 37.617222, "speed": 1.8, "alt": 144.9
        });
        assert!(apply_tpv(&mut fix, &report, false));
        // Already latched: the same fix must not request it again.
        assert!(!apply_tpv(&mut fix, &report, true));
        assert!(fix.latitude.starts_with("55\u{b0} 45'"));
        assert!(fix.latitude.ends_with(" N"));
        assert!(fix.longitude.ends_with(" E"));
        assert_eq!(fix.speed, "1");
        assert_eq!(fix.altitude, "144");
        assert!(fix.epoch.is_some());
    }

    #[test]
    fn southern_western_hemisphere_suffixes() {
        assert!(format_dms(-33.865143, 'N', 'S').ends_with(" S"));
        assert!(format_dms(-70.6506, 'E', 'W').ends_with(" W"));
        assert_eq!(format_dms(-33.865143, 'N', 'S'), "33\u{b0} 51' 54\" S");
    }

    #[test]
    fn sky_refreshes_satellites_and_tpv_retains_them() {
        let mut fix = GnssFix::default();
        let sky = json!({"class": "SKY", "satellites": [
            {"PRN": 4, "used": true}, {"PRN": 9, "used": false}, {"PRN": 12, "used": true}
        ]});
        apply_sky(&mut fix, &sky);
        assert!(fix.sats_change);
        assert_eq!(fix.sats, "3");
        assert_eq!(fix.sats_valid, "2");

        let tpv = json!({"class": "TPV", "mode": 1});
        apply_tpv(&mut fix, &tpv, true);
        assert!(!fix.sats_change);
        assert_eq!(fix.sat_list.len(), 3);
    }

    #[test]
    fn sky_without_satellite_block_keeps_previous_list() {
        let mut fix = GnssFix::default();
        apply_sky(
            &mut fix,
            &json!({"class": "SKY", "satellites": [{"PRN": 1, "used": true}]}),
        );
        let before = fix.sat_list.clone();
        fix.sats_change = false;
        apply_sky(&mut fix, &json!({"class": "SKY"}));
        assert_eq!(fix.sat_list, before);
        assert!(!fix.sats_change);
    }
}
