//! Host-side controller for a GNSS-synchronized time-distribution
//! appliance.
//!
//! The controller owns the USB link to the front-panel MCU, watches the
//! NTP daemon and gpsd, arbitrates which source currently provides
//! wall-clock time and the PPS edge, and applies operator configuration to
//! the host system.

pub mod arbiter;
pub mod config;
pub mod console;
pub mod error;
pub mod gnss;
pub mod link;
pub mod ops;
pub mod packet;
pub mod peers;
pub mod state;
pub mod system;
pub mod telemetry;
pub mod transport;
pub mod watchdog;
