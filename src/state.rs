//! Shared synchronization state.
//!
//! One explicitly constructed [`SyncState`] is passed as an `Arc` into every
//! task at startup. Fields are partitioned by single-writer ownership: the
//! arbiter owns the sources, the GNSS monitor owns the fix and the sync
//! latch, the peer poll cycle owns the peer table, and operator operations
//! own the configuration. Cross-task readers may observe the previous
//! cycle's snapshot; that is acceptable for telemetry and best-effort
//! packet content.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::RwLock;

use chrono::Utc;
use serde::Serialize;

use crate::config::SyncConfig;
use crate::gnss::GnssFix;
use crate::packet::{McuVersion, PacketSnapshot, PpsInfo};
use crate::peers::PeerTable;

/// Authoritative wall-clock time source resolved by the arbiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeSource {
    None,
    Internal,
    Gnss,
}

impl TimeSource {
    pub fn label(self) -> &'static str {
        match self {
            TimeSource::None => "no data",
            TimeSource::Internal => "Internal",
            TimeSource::Gnss => "GNSS",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => TimeSource::Internal,
            2 => TimeSource::Gnss,
            _ => TimeSource::None,
        }
    }
}

/// Authoritative PPS (second-edge) source resolved by the arbiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PpsSource {
    None,
    Internal,
    Gnss,
}

impl PpsSource {
    pub fn label(self) -> &'static str {
        match self {
            PpsSource::None => "no data",
            PpsSource::Internal => "Internal",
            PpsSource::Gnss => "GNSS",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => PpsSource::Internal,
            2 => PpsSource::Gnss,
            _ => PpsSource::None,
        }
    }
}

pub struct SyncState {
    /// Written by the peer-poll/arbiter cycle.
    pub peers: RwLock<PeerTable>,
    /// Written by the GNSS monitor; reset by the watchdog.
    pub fix: RwLock<GnssFix>,
    /// Written by operator-facing operations.
    pub config: RwLock<SyncConfig>,
    /// Last discipline report decoded from the MCU.
    pub pps_info: RwLock<Option<PpsInfo>>,
    /// Firmware identity reported by the MCU version struct.
    pub mcu_version: RwLock<Option<McuVersion>>,
    time_source: AtomicU8,
    pps_source: AtomicU8,
    gnss_synced: AtomicBool,
}

impl SyncState {
    pub fn new(config: SyncConfig) -> Self {
        SyncState {
            peers: RwLock::new(PeerTable::default()),
            fix: RwLock::new(GnssFix::default()),
            config: RwLock::new(config),
            pps_info: RwLock::new(None),
            mcu_version: RwLock::new(None),
            time_source: AtomicU8::new(TimeSource::None as u8),
            pps_source: AtomicU8::new(PpsSource::None as u8),
            gnss_synced: AtomicBool::new(false),
        }
    }

    pub fn time_source(&self) -> TimeSource {
        TimeSource::from_u8(self.time_source.load(Ordering::Relaxed))
    }

    pub fn pps_source(&self) -> PpsSource {
        PpsSource::from_u8(self.pps_source.load(Ordering::Relaxed))
    }

    /// Store the single authoritative source pair for this arbiter cycle.
    pub fn set_sources(&self, time: TimeSource, pps: PpsSource) {
        self.time_source.store(time as u8, Ordering::Relaxed);
        self.pps_source.store(pps as u8, Ordering::Relaxed);
    }

    pub fn gnss_synced(&self) -> bool {
        self.gnss_synced.load(Ordering::Relaxed)
    }

    /// One-way latch. Returns `true` only for the transition that actually
    /// set it; once set it never reverts for the process lifetime.
    pub fn latch_gnss_synced(&self) -> bool {
        !self.gnss_synced.swap(true, Ordering::Relaxed)
    }

    /// Capture everything the codec needs, read at encode time so queued
    /// requests are never serialized against a stale snapshot.
    pub fn packet_snapshot(&self) -> PacketSnapshot {
        let config = self.config.read().unwrap_or_else(|e| e.into_inner());
        let fix = self.fix.read().unwrap_or_else(|e| e.into_inner());
        PacketSnapshot {
            utc: Utc::now().timestamp(),
            tz: config.tz,
            tz_kv: config.tz_kv,
            tz_rs: config.tz_rs,
            gnss_status: fix.status,
            sync_source: config.sync_source,
            ext_source: config.ext_source,
            mcu: config.mcu,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sources_default_to_none() {
        let state = SyncState::new(SyncConfig::default());
        assert_eq!(state.time_source(), TimeSource::None);
        assert_eq!(state.pps_source(), PpsSource::None);
    }

    #[test]
    fn set_sources_stores_one_pair() {
        let state = SyncState::new(SyncConfig::default());
        state.set_sources(TimeSource::Gnss, PpsSource::Gnss);
        assert_eq!(state.time_source(), TimeSource::Gnss);
        assert_eq!(state.pps_source(), PpsSource::Gnss);
        state.set_sources(TimeSource::Internal, PpsSource::Internal);
        assert_eq!(state.time_source(), TimeSource::Internal);
        assert_eq!(state.pps_source(), PpsSource::Internal);
    }

    #[test]
    fn gnss_latch_is_one_way() {
        let state = SyncState::new(SyncConfig::default());
        assert!(!state.gnss_synced());
        assert!(state.latch_gnss_synced());
        assert!(state.gnss_synced());
        // Second latch attempt reports "already set" and changes nothing.
        assert!(!state.latch_gnss_synced());
        assert!(state.gnss_synced());
    }
}
