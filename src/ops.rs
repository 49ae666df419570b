//! Operator-facing operations.
//!
//! Every mutating operation validates its input first, applies the change
//! to the host system, then updates and persists the configuration. A
//! `ConfigError` return means nothing was changed. Success messages are
//! human-readable and end up in the operator journal.

use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{Local, TimeZone};
use log::{info, warn};

use crate::config::{ExtSource, LanId, SyncConfig, SyncSource, UartParams};
use crate::console::ConsoleIntent;
use crate::error::ConfigError;
use crate::link::IntentHandler;
use crate::packet::Request;
use crate::state::SyncState;
use crate::system;

/// UART speeds the receiver port hardware supports.
pub const SUPPORTED_SPEEDS: [u32; 5] = [9_600, 19_200, 38_400, 57_600, 115_200];

const UPTIME_SNAPSHOT_PERIOD: Duration = Duration::from_secs(3600);

/// Serial-line contract to the GNSS receiver module. Concrete
/// implementations translate speed and constellation changes into the
/// receiver's own command set.
#[cfg_attr(test, mockall::automock)]
pub trait ReceiverPort: Send + Sync {
    /// Program the host UART for the given line parameters.
    fn configure(&self, params: &UartParams) -> Result<(), ConfigError>;

    /// Move the receiver (and the host UART) to a new speed. Returns the
    /// speed actually in effect afterwards.
    fn set_speed(&self, params: &UartParams, new_speed: u32) -> Result<u32, ConfigError>;

    /// Select the satellite constellation set ("gps", "gnss", "all").
    fn select_satellites(&self, params: &UartParams, system: &str) -> Result<(), ConfigError>;
}

/// MNP-7 receiver behind `/dev/ttyS1`, driven with proprietary NMEA
/// sentences.
pub struct Irz7Port {
    device: String,
}

impl Irz7Port {
    pub fn new(device: &str) -> Self {
        Irz7Port {
            device: device.to_string(),
        }
    }

    fn send_sentence(&self, body: &str) -> Result<(), ConfigError> {
        let mut checksum = 0u8;
        for byte in body.bytes() {
            checksum ^= byte;
        }
        let sentence = format!("${}*{:02X}\r\n", body, checksum);
        let mut port = OpenOptions::new()
            .write(true)
            .open(&self.device)
            .map_err(|e| ConfigError::Rejected(format!("opening {}: {}", self.device, e)))?;
        port.write_all(sentence.as_bytes())
            .map_err(|e| ConfigError::Rejected(format!("writing to {}: {}", self.device, e)))?;
        Ok(())
    }
}

fn stty_command(device: &str, params: &UartParams) -> Result<String, ConfigError> {
    if !SUPPORTED_SPEEDS.contains(&params.speed) {
        return Err(ConfigError::UnsupportedSpeed(params.speed.to_string()));
    }
    if !(5..=8).contains(&params.size) {
        return Err(ConfigError::Rejected(format!(
            "Invalid character size: {}",
            params.size
        )));
    }
    let stopbits = match params.stopbits {
        1 => "-cstopb",
        2 => "cstopb",
        other => {
            return Err(ConfigError::Rejected(format!(
                "Invalid stop bit count: {}",
                other
            )))
        }
    };
    let parity = match params.parity {
        'N' => "-parenb",
        'E' => "parenb -parodd",
        'O' => "parenb parodd",
        other => {
            return Err(ConfigError::Rejected(format!(
                "Invalid parity: {}",
                other
            )))
        }
    };
    Ok(format!(
        "stty -F {} {} cs{} {} {}",
        device, params.speed, params.size, stopbits, parity
    ))
}

impl ReceiverPort for Irz7Port {
    fn configure(&self, params: &UartParams) -> Result<(), ConfigError> {
        let command = stty_command(&self.device, params)?;
        let out = system::run_cmd(&command).map_err(|e| ConfigError::Rejected(e.to_string()))?;
        if out.trim().is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Rejected(format!("stty: {}", out.trim())))
        }
    }

    fn set_speed(&self, params: &UartParams, new_speed: u32) -> Result<u32, ConfigError> {
        if !SUPPORTED_SPEEDS.contains(&new_speed) {
            return Err(ConfigError::UnsupportedSpeed(new_speed.to_string()));
        }
        // Tell the receiver at its current speed, then follow it.
        self.configure(params)?;
        self.send_sentence(&format!("PIRZ,BAUD,{}", new_speed))?;
        let mut moved = params.clone();
        moved.speed = new_speed;
        self.configure(&moved)?;
        Ok(new_speed)
    }

    fn select_satellites(&self, params: &UartParams, system: &str) -> Result<(), ConfigError> {
        let code = match system {
            "gps" => 1,
            "gnss" => 2,
            "all" => 3,
            other => {
                return Err(ConfigError::Rejected(format!(
                    "Unknown satellite system: {}",
                    other
                )))
            }
        };
        self.configure(params)?;
        self.send_sentence(&format!("PIRZ,SYS,{}", code))
    }
}

/// Host file locations, overridable for tests and development runs.
#[derive(Debug, Clone)]
pub struct OpsPaths {
    pub settings: PathBuf,
    pub ntp_conf: PathBuf,
    pub network_dir: PathBuf,
    pub uptime_snapshot: PathBuf,
}

impl Default for OpsPaths {
    fn default() -> Self {
        OpsPaths {
            settings: PathBuf::from("/var/lib/timestation/settings.json"),
            ntp_conf: PathBuf::from("/etc/ntp.conf"),
            network_dir: PathBuf::from("/etc/systemd/network"),
            uptime_snapshot: PathBuf::from("/var/lib/timestation/uptime"),
        }
    }
}

pub struct Ops {
    state: Arc<SyncState>,
    requests: Sender<Request>,
    receiver: Box<dyn ReceiverPort>,
    paths: OpsPaths,
}

fn sys<T>(result: Result<T>) -> Result<T, ConfigError> {
    result.map_err(|e| ConfigError::Rejected(format!("{:#}", e)))
}

impl Ops {
    pub fn new(
        state: Arc<SyncState>,
        requests: Sender<Request>,
        receiver: Box<dyn ReceiverPort>,
        paths: OpsPaths,
    ) -> Self {
        Ops {
            state,
            requests,
            receiver,
            paths,
        }
    }

    fn config(&self) -> SyncConfig {
        self.state
            .config
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn update_config(&self, apply: impl FnOnce(&mut SyncConfig)) {
        let mut config = self.state.config.write().unwrap_or_else(|e| e.into_inner());
        apply(&mut config);
    }

    pub fn persist(&self) -> Result<()> {
        self.config()
            .save(&self.paths.settings)
            .context("persisting settings")
    }

    fn enqueue(&self, request: Request) {
        if self.requests.send(request).is_err() {
            warn!("request queue closed, {:?} not delivered", request);
        }
    }

    /// Whether serving NTP on an interface is currently allowed: the
    /// operator must have enabled it, and an external sync source only
    /// serves once a satellite sync has happened.
    fn listen_permitted(&self, config: &SyncConfig, lan: LanId) -> bool {
        config.lan(lan).listen
            && (config.sync_source == SyncSource::Internal || self.state.gnss_synced())
    }

    /// Re-derive the per-interface NTP permission lines. Called when the
    /// sync source changes and when the satellite latch first sets.
    pub fn refresh_listen_permissions(&self) -> Result<()> {
        let config = self.config();
        for lan in LanId::ALL {
            system::set_ntp_listen(
                &self.paths.ntp_conf,
                lan.device(),
                &config.lan(lan).ip,
                self.listen_permitted(&config, lan),
            )?;
        }
        system::restart_ntp();
        Ok(())
    }

    /// Switch between the internal free-running clock and the GNSS
    /// reference block in the NTP configuration.
    pub fn set_sync_source(&self, source: SyncSource) -> Result<String, ConfigError> {
        sys(system::ntp_source_config(
            &self.paths.ntp_conf,
            source == SyncSource::External,
        ))?;
        self.update_config(|c| c.sync_source = source);

        // Moving to an external source before any satellite sync must stop
        // us serving time we cannot vouch for.
        if !self.state.gnss_synced() {
            sys(self.refresh_listen_permissions())?;
        } else {
            system::restart_ntp();
        }

        // Step straight to the last satellite time so the daemon does not
        // have to slew across the whole offset.
        if source == SyncSource::External {
            let epoch = self
                .state
                .fix
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .epoch;
            if let Some(epoch) = epoch {
                if let Some(when) = Local.timestamp_opt(epoch, 0).single() {
                    let date = when.format("%Y-%m-%d").to_string();
                    let time = when.format("%H:%M:%S").to_string();
                    if let Err(e) = system::set_system_time(&date, &time) {
                        warn!("presetting satellite time: {:#}", e);
                    }
                }
            }
        }

        self.enqueue(Request::Status);
        sys(self.persist())?;
        Ok(format!("Sync source selected: {}", source.label()))
    }

    /// Switch the MCU multiplexer (and gpsd) to another receiver path.
    pub fn set_ext_sync_source(&self, source: ExtSource) -> Result<String, ConfigError> {
        system::systemctl("stop", "gpsd");
        self.update_config(|c| c.ext_source = source);
        if source != ExtSource::Internal {
            self.receiver.configure(self.config().uart(source))?;
        }
        self.enqueue(Request::GpsMux);
        system::systemctl("start", "gpsd");
        system::restart_ntp();
        sys(self.persist())?;
        Ok(format!(
            "External sync source selected: {}",
            source.label()
        ))
    }

    /// Apply the full GNSS settings form: receiver path, UART speed and
    /// satellite constellation.
    pub fn save_gnss(
        &self,
        source: ExtSource,
        speed: u32,
        satellite_system: &str,
        receiver: &str,
    ) -> Result<String, ConfigError> {
        if !SUPPORTED_SPEEDS.contains(&speed) {
            return Err(ConfigError::UnsupportedSpeed(speed.to_string()));
        }
        if receiver != "irz7" {
            return Err(ConfigError::Rejected(format!(
                "Unsupported receiver model: {}",
                receiver
            )));
        }

        system::systemctl("stop", "gpsd");
        self.update_config(|c| c.ext_source = source);
        self.enqueue(Request::GpsMux);

        let params = self.config().uart(source).clone();
        let selected_speed = if params.speed != speed {
            self.receiver.set_speed(&params, speed)?
        } else {
            params.speed
        };

        let mut moved = params;
        moved.speed = selected_speed;
        self.receiver.select_satellites(&moved, satellite_system)?;

        self.update_config(|c| {
            c.uart_mut(source).speed = selected_speed;
            c.satellite_system = satellite_system.to_string();
            c.receiver = receiver.to_string();
        });

        system::systemctl("start", "gpsd");
        system::restart_ntp();
        sys(self.persist())?;
        Ok("GNSS settings saved".to_string())
    }

    /// Reconfigure one LAN port and its NTP permission.
    pub fn change_net_cfg(
        &self,
        lan: LanId,
        ip: &str,
        netmask: &str,
        gateway: &str,
        listen: Option<bool>,
    ) -> Result<String, ConfigError> {
        if ![ip, netmask, gateway].iter().all(|a| system::validate_ipv4(a)) {
            return Err(ConfigError::InvalidAddress);
        }

        sys(system::write_network_file(
            &self.paths.network_dir,
            lan.device(),
            ip,
            netmask,
            gateway,
        ))?;
        system::systemctl("restart", "systemd-networkd");

        self.update_config(|c| {
            let iface = c.lan_mut(lan);
            iface.ip = ip.to_string();
            iface.netmask = netmask.to_string();
            iface.gateway = gateway.to_string();
            if let Some(listen) = listen {
                iface.listen = listen;
            }
        });

        let config = self.config();
        sys(system::set_ntp_listen(
            &self.paths.ntp_conf,
            lan.device(),
            ip,
            self.listen_permitted(&config, lan),
        ))?;
        system::restart_ntp();
        sys(self.persist())?;

        if config.lan(lan).listen {
            info!("Time service enabled on {}", lan.label());
        } else {
            info!("Time service disabled on {}", lan.label());
        }
        Ok(format!("{} settings changed", lan.label()))
    }

    /// Set the system clock by hand. Only meaningful while free-running;
    /// with an external source the satellites own the clock.
    pub fn save_time(&self, date: &str, time: &str) -> Result<String, ConfigError> {
        if self.config().sync_source != SyncSource::Internal {
            return Err(ConfigError::Rejected(
                "Time can be set only with the internal sync source".to_string(),
            ));
        }
        if date.is_empty() || time.is_empty() {
            return Err(ConfigError::Rejected("Empty date or time".to_string()));
        }
        sys(system::set_system_time(date, time))?;
        Ok(format!("Date and time set: {} {}", date, time))
    }

    /// Apply the time-settings form: slew cap and the three timezones
    /// (system, quartz wall display, remote RS-485 display).
    pub fn save_time_settings(
        &self,
        timejump_min: u32,
        tz: i32,
        tz_kv: i32,
        tz_rs: i32,
    ) -> Result<String, ConfigError> {
        // Validate everything before touching the system.
        system::timezone_name(tz)?;
        if timejump_min == 0 {
            return Err(ConfigError::InvalidTimeout(timejump_min.to_string()));
        }

        sys(system::set_timejump(&self.paths.ntp_conf, timejump_min))?;
        sys(system::set_timezone(tz))?;

        self.update_config(|c| {
            c.timejump_min = timejump_min;
            c.tz = tz;
            c.tz_kv = tz_kv;
            c.tz_rs = tz_rs;
        });
        system::restart_ntp();
        sys(self.persist())?;
        Ok("Time settings changed".to_string())
    }

    /// Startup readback: seed the interface table from the live system,
    /// reverting an unreadable interface to factory settings.
    pub fn seed_network(&self) {
        let defaults = SyncConfig::default();
        for lan in LanId::ALL {
            match system::read_network(&self.paths.network_dir, lan.device()) {
                Ok(probe) => {
                    self.update_config(|c| {
                        let iface = c.lan_mut(lan);
                        iface.ip = probe.ip.clone();
                        iface.netmask = probe.netmask.clone();
                        iface.gateway = probe.gateway.clone();
                        iface.mac = probe.mac.clone();
                        iface.status = probe.status.clone();
                        iface.speed = probe.speed.clone();
                    });
                    let config = self.config();
                    if let Err(e) = system::set_ntp_listen(
                        &self.paths.ntp_conf,
                        lan.device(),
                        &probe.ip,
                        self.listen_permitted(&config, lan),
                    ) {
                        warn!("updating NTP permission for {}: {:#}", lan.label(), e);
                    }
                }
                Err(e) => {
                    warn!("{} unreadable ({:#}), loading factory settings", lan.label(), e);
                    let factory = defaults.lan(lan);
                    if let Err(e) = self.change_net_cfg(
                        lan,
                        &factory.ip,
                        &factory.netmask,
                        &factory.gateway,
                        Some(factory.listen),
                    ) {
                        warn!("factory reset of {} failed: {}", lan.label(), e);
                    }
                }
            }
        }
    }

    /// Fold the previous boot's uptime snapshot into the operating-time
    /// counter. Runs once at startup.
    pub fn restore_optime(&self) {
        let optime = self
            .state
            .config
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .optime_sec;
        if let Some(total) = system::accumulate_optime(&self.paths.uptime_snapshot, optime) {
            self.update_config(|c| c.optime_sec = total);
            if let Err(e) = self.persist() {
                warn!("persisting operating time: {:#}", e);
            }
            info!("Accumulated operating time: {}s", total);
        }
    }

    /// Hourly uptime snapshot so operating time survives a power cut.
    pub fn run_uptime_task(&self) {
        loop {
            if let Err(e) = system::snapshot_uptime(&self.paths.uptime_snapshot) {
                warn!("uptime snapshot: {:#}", e);
            }
            std::thread::sleep(UPTIME_SNAPSHOT_PERIOD);
        }
    }
}

impl IntentHandler for Ops {
    fn handle_intent(&self, intent: ConsoleIntent) {
        let result = match intent {
            ConsoleIntent::ApplyDateTime { date, time } => self.save_time(&date, &time),
            ConsoleIntent::ApplyTimezones { tz, tz_kv, tz_rs } => {
                let timejump = self.config().timejump_min;
                self.save_time_settings(timejump, tz, tz_kv, tz_rs)
            }
            ConsoleIntent::ApplyNetConfig {
                lan,
                ip,
                netmask,
                gateway,
                listen,
            } => self.change_net_cfg(lan, &ip, &netmask, &gateway, Some(listen)),
            ConsoleIntent::ApplySyncSelection {
                sync_source,
                ext_source,
                satellite_system,
            } => self.set_sync_source(sync_source).and_then(|_| {
                if sync_source == SyncSource::External {
                    let speed = self.config().uart(ext_source).speed;
                    let receiver = self.config().receiver.clone();
                    self.save_gnss(ext_source, speed, &satellite_system, &receiver)
                } else {
                    Ok(String::new())
                }
            }),
        };
        match result {
            Ok(msg) if !msg.is_empty() => info!("{}", msg),
            Ok(_) => {}
            Err(e) => warn!("console request rejected: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Write;
    use std::sync::mpsc;
    use tempfile::TempDir;

    struct Fixture {
        ops: Ops,
        rx: std::sync::mpsc::Receiver<Request>,
        dir: TempDir,
    }

    fn fixture(receiver: Box<dyn ReceiverPort>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let ntp_conf = dir.path().join("ntp.conf");
        let mut file = fs::File::create(&ntp_conf).unwrap();
        write!(
            file,
            "tinker panic 900\n\
             #server 127.127.20.0 mode 80 minpoll 4 # GPS_server\n\
             #fudge 127.127.20.0 refid NMEA # GPS_fudge\n\
             #server 127.127.22.0 minpoll 4 # PPS_server\n\
             #fudge 127.127.22.0 refid GPPS # PPS_fudge\n\
             interface listen 192.168.0.101 # lan1\n\
             interface listen 192.168.0.102 # lan2\n"
        )
        .unwrap();

        let paths = OpsPaths {
            settings: dir.path().join("settings.json"),
            ntp_conf,
            network_dir: dir.path().to_path_buf(),
            uptime_snapshot: dir.path().join("uptime"),
        };
        let state = Arc::new(SyncState::new(SyncConfig::default()));
        let (tx, rx) = mpsc::channel();
        Fixture {
            ops: Ops::new(state, tx, receiver, paths),
            rx,
            dir,
        }
    }

    fn no_receiver() -> Box<dyn ReceiverPort> {
        let mut mock = MockReceiverPort::new();
        mock.expect_configure().returning(|_| Ok(()));
        mock.expect_set_speed().returning(|_, s| Ok(s));
        mock.expect_select_satellites().returning(|_, _| Ok(()));
        Box::new(mock)
    }

    #[test]
    fn save_gnss_rejects_unsupported_speed() {
        let f = fixture(no_receiver());
        assert_eq!(
            f.ops.save_gnss(ExtSource::Rs422, 1200, "gnss", "irz7"),
            Err(ConfigError::UnsupportedSpeed("1200".to_string()))
        );
        // Nothing was enqueued or persisted.
        assert!(f.rx.try_recv().is_err());
        assert!(!f.ops.paths.settings.exists());
    }

    #[test]
    fn save_gnss_rejects_unknown_receiver() {
        let f = fixture(no_receiver());
        assert!(matches!(
            f.ops.save_gnss(ExtSource::Rs232, 9600, "gnss", "ublox"),
            Err(ConfigError::Rejected(_))
        ));
    }

    #[test]
    fn save_gnss_programs_receiver_and_persists() {
        let mut mock = MockReceiverPort::new();
        mock.expect_set_speed()
            .withf(|params, new| params.speed == 115_200 && *new == 9600)
            .times(1)
            .returning(|_, new| Ok(new));
        mock.expect_select_satellites()
            .withf(|params, system| params.speed == 9600 && system == "all")
            .times(1)
            .returning(|_, _| Ok(()));

        let f = fixture(Box::new(mock));
        let msg = f.ops.save_gnss(ExtSource::Rs232, 9600, "all", "irz7").unwrap();
        assert_eq!(msg, "GNSS settings saved");
        assert_eq!(f.rx.try_recv().unwrap(), Request::GpsMux);

        let saved = SyncConfig::load(&f.ops.paths.settings).unwrap();
        assert_eq!(saved.ext_source, ExtSource::Rs232);
        assert_eq!(saved.rs232.speed, 9600);
        assert_eq!(saved.satellite_system, "all");
    }

    #[test]
    fn change_net_cfg_rejects_bad_addresses() {
        let f = fixture(no_receiver());
        assert_eq!(
            f.ops
                .change_net_cfg(LanId::Lan1, "300.0.0.1", "255.255.255.0", "10.0.0.1", None),
            Err(ConfigError::InvalidAddress)
        );
        assert!(!f.dir.path().join("lan1.network").exists());
    }

    #[test]
    fn change_net_cfg_writes_unit_and_listen_line() {
        let f = fixture(no_receiver());
        f.ops
            .change_net_cfg(
                LanId::Lan1,
                "10.1.0.5",
                "255.255.255.0",
                "10.1.0.1",
                Some(true),
            )
            .unwrap();

        let unit = fs::read_to_string(f.dir.path().join("lan1.network")).unwrap();
        assert!(unit.contains("Address=10.1.0.5/24"));

        // External source, not yet satellite-synced: listen stays blocked.
        let conf = fs::read_to_string(&f.ops.paths.ntp_conf).unwrap();
        assert!(conf.contains("#interface listen 10.1.0.5 # lan1"));

        let saved = SyncConfig::load(&f.ops.paths.settings).unwrap();
        assert_eq!(saved.lan1.ip, "10.1.0.5");
        assert!(saved.lan1.listen);
    }

    #[test]
    fn listen_opens_after_satellite_latch() {
        let f = fixture(no_receiver());
        f.ops.state.latch_gnss_synced();
        f.ops.refresh_listen_permissions().unwrap();

        let conf = fs::read_to_string(&f.ops.paths.ntp_conf).unwrap();
        assert!(conf.contains("\ninterface listen 192.168.0.101 # lan1"));
        assert!(conf.contains("\ninterface listen 192.168.0.102 # lan2"));
    }

    #[test]
    fn save_time_requires_internal_source() {
        let f = fixture(no_receiver());
        // Factory default is the external source.
        assert!(matches!(
            f.ops.save_time("2024-06-01", "12:00:00"),
            Err(ConfigError::Rejected(_))
        ));
    }

    #[test]
    fn save_time_settings_validates_before_acting() {
        let f = fixture(no_receiver());
        let before = fs::read_to_string(&f.ops.paths.ntp_conf).unwrap();

        assert_eq!(
            f.ops.save_time_settings(15, 99, 0, 0),
            Err(ConfigError::UnknownTimezone(99))
        );
        assert_eq!(
            f.ops.save_time_settings(0, 3, 0, 0),
            Err(ConfigError::InvalidTimeout("0".to_string()))
        );
        assert_eq!(fs::read_to_string(&f.ops.paths.ntp_conf).unwrap(), before);
    }

    #[test]
    fn sync_source_switch_rewrites_refclock_block() {
        let f = fixture(no_receiver());
        f.ops.set_sync_source(SyncSource::Internal).unwrap();

        let conf = fs::read_to_string(&f.ops.paths.ntp_conf).unwrap();
        assert!(conf.contains("#server 127.127.20.0"));
        // Internal source serves regardless of the satellite latch.
        assert!(conf.contains("\ninterface listen 192.168.0.101 # lan1"));
        assert_eq!(f.rx.try_recv().unwrap(), Request::Status);

        let saved = SyncConfig::load(&f.ops.paths.settings).unwrap();
        assert_eq!(saved.sync_source, SyncSource::Internal);
    }

    #[test]
    fn restore_optime_folds_snapshot_once() {
        let f = fixture(no_receiver());
        fs::write(&f.ops.paths.uptime_snapshot, "500.9 900.0\n").unwrap();

        f.ops.restore_optime();
        let saved = SyncConfig::load(&f.ops.paths.settings).unwrap();
        assert_eq!(saved.optime_sec, 500);

        // Snapshot consumed, a second restore changes nothing.
        f.ops.restore_optime();
        assert_eq!(
            SyncConfig::load(&f.ops.paths.settings).unwrap().optime_sec,
            500
        );
    }

    #[test]
    fn stty_command_maps_line_parameters() {
        let params = UartParams::default();
        assert_eq!(
            stty_command("/dev/ttyS1", &params).unwrap(),
            "stty -F /dev/ttyS1 115200 cs8 -cstopb -parenb"
        );

        let mut odd = params.clone();
        odd.parity = 'O';
        odd.stopbits = 2;
        assert_eq!(
            stty_command("/dev/ttyS1", &odd).unwrap(),
            "stty -F /dev/ttyS1 115200 cs8 cstopb parenb parodd"
        );

        let mut bad = params;
        bad.speed = 300;
        assert_eq!(
            stty_command("/dev/ttyS1", &bad),
            Err(ConfigError::UnsupportedSpeed("300".to_string()))
        );
    }
}
