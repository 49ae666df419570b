//! NTP daemon peer-table polling and classification.
//!
//! The daemon is treated as a black box: we shell out to `ntpq -p`, parse its
//! tabular output and classify the four recognized reference identifiers.
//! Everything else in the output is ignored.

use log::debug;
use serde::Serialize;

use crate::system;

/// The four recognized time/PPS authorities, as they appear in the refid
/// column of `ntpq -p`. Fixed by construction; the parser drops anything
/// else, so the arbitration cascade never sees a fifth identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RefId {
    Lcl,
    Nmea,
    Gpps,
    Lpps,
}

impl RefId {
    pub const ALL: [RefId; 4] = [RefId::Lcl, RefId::Nmea, RefId::Gpps, RefId::Lpps];

    pub fn token(self) -> &'static str {
        match self {
            RefId::Lcl => ".LCL.",
            RefId::Nmea => ".NMEA.",
            RefId::Gpps => ".GPPS.",
            RefId::Lpps => ".LPPS.",
        }
    }

    pub fn from_token(token: &str) -> Option<RefId> {
        RefId::ALL.iter().copied().find(|r| r.token() == token)
    }

    pub fn display_name(self) -> &'static str {
        match self {
            RefId::Lcl => "Internal (time)",
            RefId::Nmea => "GNSS (time)",
            RefId::Gpps => "GNSS (PPS)",
            RefId::Lpps => "Internal (PPS)",
        }
    }

    /// PPS-class references report edge timing, not wall-clock time; their
    /// underlying time authority must be re-derived by the arbiter.
    pub fn is_pps_class(self) -> bool {
        matches!(self, RefId::Gpps | RefId::Lpps)
    }
}

/// Classification of a peer's single-character selection code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerStatus {
    #[default]
    Unused,
    Rejected,
    Valid,
    SourceOfTime,
    SourceOfPps,
}

impl PeerStatus {
    /// Fixed code-to-label table for the tally character `ntpq` prints in
    /// front of the remote column.
    pub fn from_code(code: char) -> Option<PeerStatus> {
        match code {
            'x' | '.' | '-' => Some(PeerStatus::Rejected),
            '+' | '#' => Some(PeerStatus::Valid),
            '*' => Some(PeerStatus::SourceOfTime),
            'o' => Some(PeerStatus::SourceOfPps),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            PeerStatus::Unused => "unused",
            PeerStatus::Rejected => "rejected",
            PeerStatus::Valid => "valid",
            PeerStatus::SourceOfTime => "source of time",
            PeerStatus::SourceOfPps => "source of PPS",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PeerRecord {
    pub status: PeerStatus,
    pub stratum: String,
    pub offset: String,
    pub jitter: String,
}

/// Peer records for the four fixed reference identifiers. Rebuilt from
/// scratch on every poll; references absent from the daemon's output stay at
/// their default ("unused") record.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PeerTable {
    pub lcl: PeerRecord,
    pub nmea: PeerRecord,
    pub gpps: PeerRecord,
    pub lpps: PeerRecord,
}

impl PeerTable {
    pub fn get(&self, refid: RefId) -> &PeerRecord {
        match refid {
            RefId::Lcl => &self.lcl,
            RefId::Nmea => &self.nmea,
            RefId::Gpps => &self.gpps,
            RefId::Lpps => &self.lpps,
        }
    }

    pub fn get_mut(&mut self, refid: RefId) -> &mut PeerRecord {
        match refid {
            RefId::Lcl => &mut self.lcl,
            RefId::Nmea => &mut self.nmea,
            RefId::Gpps => &mut self.gpps,
            RefId::Lpps => &mut self.lpps,
        }
    }

    pub fn status(&self, refid: RefId) -> PeerStatus {
        self.get(refid).status
    }
}

/// Parse `ntpq -p` output into a fresh peer table.
///
/// The first two lines are the header. A data line counts only if it has at
/// least 10 whitespace-separated fields and its second field is a known
/// refid; the selection code is the first character of the remote column.
pub fn parse_peer_table(output: &str) -> PeerTable {
    let mut table = PeerTable::default();

    if !output.contains("remote") {
        return table;
    }

    for line in output.lines().skip(2) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 10 {
            continue;
        }
        let refid = match RefId::from_token(fields[1]) {
            Some(r) => r,
            None => continue,
        };

        let record = table.get_mut(refid);
        record.stratum = fields[2].to_string();
        record.offset = fields[8].to_string();
        record.jitter = fields[9].to_string();
        if let Some(status) = fields[0].chars().next().and_then(PeerStatus::from_code) {
            record.status = status;
        }
    }

    table
}

/// Polls the NTP daemon's peer-status interface.
pub struct PeerMonitor;

impl PeerMonitor {
    /// Query the daemon. On any failure (daemon down, unexpected output)
    /// this degrades to the all-default table rather than failing the
    /// caller.
    pub fn poll(&self) -> PeerTable {
        let output = match system::run_cmd("ntpq -p") {
            Ok(o) => o,
            Err(e) => {
                debug!("ntpq query failed: {}", e);
                return PeerTable::default();
            }
        };
        let table = parse_peer_table(&output);
        debug!("peer table: {:?}", table);
        table
    }
}
