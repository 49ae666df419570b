//! Source arbitration: from a peer table to one authoritative
//! time-source/PPS-source pair.
//!
//! The NTP daemon elects at most one system peer (`*`) per cycle. When the
//! election lands on a PPS-class reference the wall-clock authority is not
//! that reference itself; it has to be re-derived from the sibling time
//! references in a fixed preference order.

use std::sync::Arc;
use std::time::Duration;

use chrono::Local;

use crate::peers::{PeerMonitor, PeerStatus, PeerTable, RefId};
use crate::state::{PpsSource, SyncState, TimeSource};
use crate::telemetry::{TelemetryEvent, TelemetrySender};

const CYCLE_PERIOD: Duration = Duration::from_millis(250);

/// The source pair resolved for one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arbitration {
    pub time: TimeSource,
    pub pps: PpsSource,
}

/// The logical authority a reference vouches for.
fn authority(refid: RefId) -> TimeSource {
    match refid {
        RefId::Lcl | RefId::Lpps => TimeSource::Internal,
        RefId::Nmea | RefId::Gpps => TimeSource::Gnss,
    }
}

fn as_pps(time: TimeSource) -> PpsSource {
    match time {
        TimeSource::None => PpsSource::None,
        TimeSource::Internal => PpsSource::Internal,
        TimeSource::Gnss => PpsSource::Gnss,
    }
}

/// Resolve the source pair for this cycle and relabel the table so the
/// displayed statuses match the resolved roles.
///
/// `*` on a time reference names it directly. `*` on a PPS-class reference
/// promotes the preferred non-rejected sibling time reference (GPPS: NMEA
/// then LCL; LPPS: LCL then NMEA) to "source of time" and demotes the
/// starred reference to "source of PPS"; with both siblings rejected the
/// wall-clock authority defaults to the starred reference's own class.
/// `o` supplies the PPS source only while none is assigned.
pub fn arbitrate(table: &mut PeerTable) -> Arbitration {
    let mut time = TimeSource::None;
    let mut pps = PpsSource::None;

    for refid in RefId::ALL {
        match table.status(refid) {
            PeerStatus::SourceOfTime => {
                time = authority(refid);

                if refid.is_pps_class() {
                    let siblings = match refid {
                        RefId::Gpps => [RefId::Nmea, RefId::Lcl],
                        _ => [RefId::Lcl, RefId::Nmea],
                    };
                    if let Some(chosen) = siblings
                        .into_iter()
                        .find(|s| table.status(*s) != PeerStatus::Rejected)
                    {
                        table.get_mut(chosen).status = PeerStatus::SourceOfTime;
                        time = authority(chosen);
                    }
                    table.get_mut(refid).status = PeerStatus::SourceOfPps;
                    pps = as_pps(authority(refid));
                }
            }
            PeerStatus::SourceOfPps => {
                if pps == PpsSource::None {
                    pps = as_pps(authority(refid));
                }
            }
            _ => {}
        }
    }

    Arbitration { time, pps }
}

/// Periodic task: poll the daemon, arbitrate, publish.
pub struct SyncArbiter {
    monitor: PeerMonitor,
    state: Arc<SyncState>,
    telemetry: TelemetrySender,
}

impl SyncArbiter {
    pub fn new(state: Arc<SyncState>, telemetry: TelemetrySender) -> Self {
        SyncArbiter {
            monitor: PeerMonitor,
            state,
            telemetry,
        }
    }

    pub fn run(&self) {
        loop {
            self.cycle();
            std::thread::sleep(CYCLE_PERIOD);
        }
    }

    fn cycle(&self) {
        let mut table = self.monitor.poll();
        let verdict = arbitrate(&mut table);

        self.state.set_sources(verdict.time, verdict.pps);
        {
            let mut peers = self.state.peers.write().unwrap_or_else(|e| e.into_inner());
            *peers = table.clone();
        }

        let now = Local::now();
        self.telemetry.push(TelemetryEvent::TimeReport {
            date: now.format("%d.%m.%Y").to_string(),
            time: now.format("%H:%M:%S").to_string(),
            synctime: verdict.time.label().to_string(),
            syncpps: verdict.pps.label().to_string(),
            peers: table,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(statuses: [(RefId, PeerStatus); 4]) -> PeerTable {
        let mut table = PeerTable::default();
        for (refid, status) in statuses {
            table.get_mut(refid).status = status;
        }
        table
    }

    #[test]
    fn gnss_pps_elected_with_valid_nmea_names_gnss_time() {
        let mut peers = table([
            (RefId::Lcl, PeerStatus::Rejected),
            (RefId::Nmea, PeerStatus::Valid),
            (RefId::Gpps, PeerStatus::SourceOfTime),
            (RefId::Lpps, PeerStatus::Rejected),
        ]);
        let verdict = arbitrate(&mut peers);
        assert_eq!(verdict.time, TimeSource::Gnss);
        assert_eq!(verdict.pps, PpsSource::Gnss);
        // Displayed roles follow the resolution.
        assert_eq!(peers.status(RefId::Nmea), PeerStatus::SourceOfTime);
        assert_eq!(peers.status(RefId::Gpps), PeerStatus::SourceOfPps);
    }

    #[test]
    fn internal_pps_elected_prefers_local_clock() {
        let mut peers = table([
            (RefId::Lcl, PeerStatus::Valid),
            (RefId::Nmea, PeerStatus::Valid),
            (RefId::Gpps, PeerStatus::Rejected),
            (RefId::Lpps, PeerStatus::SourceOfTime),
        ]);
        let verdict = arbitrate(&mut peers);
        assert_eq!(verdict.time, TimeSource::Internal);
        assert_eq!(verdict.pps, PpsSource::Internal);
        assert_eq!(peers.status(RefId::Lcl), PeerStatus::SourceOfTime);
        assert_eq!(peers.status(RefId::Lpps), PeerStatus::SourceOfPps);
    }

    #[test]
    fn time_reference_elected_with_candidate_pps() {
        let mut peers = table([
            (RefId::Lcl, PeerStatus::Rejected),
            (RefId::Nmea, PeerStatus::SourceOfTime),
            (RefId::Gpps, PeerStatus::Rejected),
            (RefId::Lpps, PeerStatus::SourceOfPps),
        ]);
        let verdict = arbitrate(&mut peers);
        assert_eq!(verdict.time, TimeSource::Gnss);
        assert_eq!(verdict.pps, PpsSource::Internal);
        assert_eq!(peers.status(RefId::Nmea), PeerStatus::SourceOfTime);
    }

    #[test]
    fn pps_election_with_both_time_references_rejected_keeps_class_authority() {
        let mut peers = table([
            (RefId::Lcl, PeerStatus::Rejected),
            (RefId::Nmea, PeerStatus::Rejected),
            (RefId::Gpps, PeerStatus::SourceOfTime),
            (RefId::Lpps, PeerStatus::Unused),
        ]);
        let verdict = arbitrate(&mut peers);
        // No sibling promoted, but the class still names the authority.
        assert_eq!(verdict.time, TimeSource::Gnss);
        assert_eq!(verdict.pps, PpsSource::Gnss);
        assert_eq!(peers.status(RefId::Nmea), PeerStatus::Rejected);
        assert_eq!(peers.status(RefId::Lcl), PeerStatus::Rejected);
    }

    #[test]
    fn pps_candidate_alone_supplies_only_the_pps_source() {
        let mut peers = table([
            (RefId::Lcl, PeerStatus::Valid),
            (RefId::Nmea, PeerStatus::Valid),
            (RefId::Gpps, PeerStatus::SourceOfPps),
            (RefId::Lpps, PeerStatus::Unused),
        ]);
        let verdict = arbitrate(&mut peers);
        assert_eq!(verdict.time, TimeSource::None);
        assert_eq!(verdict.pps, PpsSource::Gnss);
    }

    #[test]
    fn empty_table_resolves_to_no_data() {
        let mut peers = PeerTable::default();
        let verdict = arbitrate(&mut peers);
        assert_eq!(verdict.time, TimeSource::None);
        assert_eq!(verdict.pps, PpsSource::None);
    }

    #[test]
    fn secondary_pps_candidate_never_overrides_an_assigned_source() {
        // GPPS starred assigns the PPS source; a stray `o` on LPPS must not
        // replace it.
        let mut peers = table([
            (RefId::Lcl, PeerStatus::Valid),
            (RefId::Nmea, PeerStatus::Valid),
            (RefId::Gpps, PeerStatus::SourceOfTime),
            (RefId::Lpps, PeerStatus::SourceOfPps),
        ]);
        let verdict = arbitrate(&mut peers);
        assert_eq!(verdict.pps, PpsSource::Gnss);
        assert_eq!(verdict.time, TimeSource::Gnss);
    }
}
