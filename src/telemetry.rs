//! Events pushed to the presentation layer.
//!
//! The presentation layer (HTTP/websocket UI) is an external collaborator;
//! it owns the receiving end of the channel. The daemon binary simply
//! drains it at debug level when no presentation layer is attached.

use std::sync::mpsc;

use log::debug;
use serde::Serialize;

use crate::gnss::GnssFix;
use crate::peers::PeerTable;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TelemetryEvent {
    /// Time/peer snapshot, emitted every arbiter cycle (~4Hz).
    TimeReport {
        date: String,
        time: String,
        synctime: String,
        syncpps: String,
        peers: PeerTable,
    },
    /// Fix snapshot, emitted on every processed GNSS report and on reset.
    GnssReport { fix: GnssFix },
}

/// Sending half handed to every task that emits telemetry. Losing the
/// receiver is not an error; emission is best-effort.
#[derive(Clone)]
pub struct TelemetrySender {
    tx: mpsc::Sender<TelemetryEvent>,
}

impl TelemetrySender {
    pub fn push(&self, event: TelemetryEvent) {
        if self.tx.send(event).is_err() {
            debug!("telemetry receiver detached");
        }
    }
}

pub fn channel() -> (TelemetrySender, mpsc::Receiver<TelemetryEvent>) {
    let (tx, rx) = mpsc::channel();
    (TelemetrySender { tx }, rx)
}

/// Fallback consumer used when no presentation layer is attached.
pub fn run_drain(rx: mpsc::Receiver<TelemetryEvent>) {
    for event in rx {
        match serde_json::to_string(&event) {
            Ok(json) => debug!("telemetry: {}", json),
            Err(e) => debug!("telemetry serialization failed: {}", e),
        }
    }
}
