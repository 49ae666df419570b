use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Which authority the NTP daemon is configured to follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncSource {
    Internal,
    External,
}

impl SyncSource {
    pub fn label(self) -> &'static str {
        match self {
            SyncSource::Internal => "Internal",
            SyncSource::External => "External (GNSS)",
        }
    }
}

/// Physical path to the external GNSS receiver, selected by the MCU mux.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtSource {
    Internal,
    Rs422,
    Rs232,
}

impl ExtSource {
    /// Selector value carried in the `gps_mux` packet.
    pub fn mux_code(self) -> u8 {
        match self {
            ExtSource::Internal => 1,
            ExtSource::Rs422 => 2,
            ExtSource::Rs232 => 3,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ExtSource::Internal => "GNSS internal",
            ExtSource::Rs422 => "GNSS RS-422",
            ExtSource::Rs232 => "GNSS RS-232",
        }
    }
}

/// One of the two LAN ports on the appliance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LanId {
    Lan1,
    Lan2,
}

impl LanId {
    pub const ALL: [LanId; 2] = [LanId::Lan1, LanId::Lan2];

    /// Interface name as known to systemd-networkd.
    pub fn device(self) -> &'static str {
        match self {
            LanId::Lan1 => "lan1",
            LanId::Lan2 => "lan2",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            LanId::Lan1 => "LAN 1",
            LanId::Lan2 => "LAN 2",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UartParams {
    pub speed: u32,
    pub size: u8,
    pub parity: char,
    pub stopbits: u8,
}

impl Default for UartParams {
    fn default() -> Self {
        UartParams {
            speed: 115_200,
            size: 8,
            parity: 'N',
            stopbits: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetInterface {
    pub ip: String,
    pub netmask: String,
    pub gateway: String,
    pub mac: String,
    pub status: String,
    pub speed: String,
    /// Whether NTP broadcast is enabled on this interface (subject to the
    /// gnss_synced gate when the sync source is external).
    pub listen: bool,
}

impl NetInterface {
    fn with_ip(ip: &str) -> Self {
        NetInterface {
            ip: ip.to_string(),
            netmask: "255.255.255.0".to_string(),
            gateway: "192.168.0.1".to_string(),
            mac: "00:00:00:00:00:00".to_string(),
            status: "DOWN".to_string(),
            speed: "0".to_string(),
            listen: true,
        }
    }
}

/// Timing parameters pushed to the MCU in `gps_wdog` and `reset` packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct McuParams {
    pub pps_timeout: u32,
    pub connect_timeout: u32,
    pub reset_hold: u32,
    pub gps_reset: u8,
    pub pps_reset: u8,
    pub mcu_reset: u8,
}

impl Default for McuParams {
    fn default() -> Self {
        McuParams {
            pps_timeout: 5,
            connect_timeout: 1800,
            reset_hold: 1,
            gps_reset: 0,
            pps_reset: 0,
            mcu_reset: 0,
        }
    }
}

/// Persistent appliance configuration. Mutated only by operator-facing
/// operations; every mutating operation calls [`SyncConfig::save`] afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    pub sync_source: SyncSource,
    pub ext_source: ExtSource,
    pub satellite_system: String,
    pub receiver: String,
    /// Maximum clock slew the NTP daemon may apply, in minutes.
    pub timejump_min: u32,
    /// System timezone, hours east of UTC.
    pub tz: i32,
    /// Timezone of the quartz wall display.
    pub tz_kv: i32,
    /// Timezone of the remote RS-485 display.
    pub tz_rs: i32,
    pub internal: UartParams,
    pub rs422: UartParams,
    pub rs232: UartParams,
    pub lan1: NetInterface,
    pub lan2: NetInterface,
    pub mcu: McuParams,
    /// Accumulated operating time, seconds, across power cycles.
    pub optime_sec: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            sync_source: SyncSource::External,
            ext_source: ExtSource::Rs422,
            satellite_system: "gnss".to_string(),
            receiver: "irz7".to_string(),
            timejump_min: 15,
            tz: 3,
            tz_kv: 0,
            tz_rs: 0,
            internal: UartParams::default(),
            rs422: UartParams::default(),
            rs232: UartParams::default(),
            lan1: NetInterface::with_ip("192.168.0.101"),
            lan2: NetInterface::with_ip("192.168.0.102"),
            mcu: McuParams::default(),
            optime_sec: 0,
        }
    }
}

impl SyncConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading settings from {}", path.display()))?;
        let config = serde_json::from_str(&text)
            .with_context(|| format!("parsing settings from {}", path.display()))?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path, text)
            .with_context(|| format!("writing settings to {}", path.display()))?;
        Ok(())
    }

    pub fn uart(&self, source: ExtSource) -> &UartParams {
        match source {
            ExtSource::Internal => &self.internal,
            ExtSource::Rs422 => &self.rs422,
            ExtSource::Rs232 => &self.rs232,
        }
    }

    pub fn uart_mut(&mut self, source: ExtSource) -> &mut UartParams {
        match source {
            ExtSource::Internal => &mut self.internal,
            ExtSource::Rs422 => &mut self.rs422,
            ExtSource::Rs232 => &mut self.rs232,
        }
    }

    pub fn lan(&self, lan: LanId) -> &NetInterface {
        match lan {
            LanId::Lan1 => &self.lan1,
            LanId::Lan2 => &self.lan2,
        }
    }

    pub fn lan_mut(&mut self, lan: LanId) -> &mut NetInterface {
        match lan {
            LanId::Lan1 => &mut self.lan1,
            LanId::Lan2 => &mut self.lan2,
        }
    }
}
