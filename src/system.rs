//! Host system plumbing: shell commands, service control, marked-line
//! editing of `ntp.conf`, systemd-networkd interface files and uptime
//! accounting.
//!
//! Everything here takes explicit paths so the file-editing helpers can be
//! exercised against temp files.

use std::fs;
use std::path::Path;
use std::process::Command;

use anyhow::{anyhow, Context, Result};
use log::{debug, warn};

use crate::error::ConfigError;

/// Run a shell command line, capturing stdout and stderr together.
pub fn run_cmd(command: &str) -> Result<String> {
    debug!("run: {}", command);
    let output = Command::new("sh")
        .arg("-c")
        .arg(command)
        .output()
        .with_context(|| format!("spawning `{}`", command))?;
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    Ok(text)
}

/// Drive a systemd unit. gpsd must be bounced through its socket unit or
/// the daemon immediately respawns with stale options.
pub fn systemctl(action: &str, service: &str) {
    let commands: Vec<String> = if service == "gpsd" || service == "gpsd.socket" {
        match action {
            "start" => vec!["systemctl start gpsd.socket".into()],
            "stop" => vec![
                "systemctl stop gpsd.socket".into(),
                "systemctl stop gpsd".into(),
            ],
            "restart" => vec![
                "systemctl stop gpsd.socket".into(),
                "systemctl stop gpsd".into(),
                "systemctl start gpsd.socket".into(),
                "systemctl start gpsd".into(),
            ],
            other => vec![format!("systemctl {} gpsd", other)],
        }
    } else {
        vec![format!("systemctl {} {}", action, service)]
    };

    for command in commands {
        if let Err(e) = run_cmd(&command) {
            warn!("{}: {}", command, e);
        }
    }
}

pub fn restart_ntp() {
    systemctl("restart", "ntp");
}

/// One marked-line edit. The first line containing the label is rewritten;
/// each edit fires at most once per pass.
#[derive(Debug, Clone)]
pub enum LineEdit {
    /// Prefix the line with `#` unless already commented.
    Comment,
    /// Strip leading `#` and spaces.
    Uncomment,
    /// Replace the whitespace-separated field at `position` with `value`.
    ReplaceField { position: usize, value: String },
}

/// Apply label-keyed edits to a config file in place. Fails if any label
/// was not found; the file is rewritten only when all labels matched.
pub fn edit_marked_lines(path: &Path, edits: &[(&str, LineEdit)]) -> Result<()> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;

    let mut pending: Vec<Option<&(&str, LineEdit)>> = edits.iter().map(Some).collect();
    let mut out = String::with_capacity(text.len());

    for line in text.lines() {
        let mut rewritten: Option<String> = None;
        for slot in pending.iter_mut() {
            let (label, edit) = match slot {
                Some(pair) => (pair.0, &pair.1),
                None => continue,
            };
            if !line.contains(label) {
                continue;
            }
            rewritten = Some(match edit {
                LineEdit::Comment => {
                    if line.starts_with('#') {
                        line.to_string()
                    } else {
                        format!("#{}", line)
                    }
                }
                LineEdit::Uncomment => line.trim_start_matches(['#', ' ']).to_string(),
                LineEdit::ReplaceField { position, value } => {
                    let mut fields: Vec<&str> = line.split_whitespace().collect();
                    if *position >= fields.len() {
                        return Err(anyhow!(
                            "line `{}` has no field {} to replace",
                            label,
                            position
                        ));
                    }
                    fields[*position] = value.as_str();
                    fields.join(" ")
                }
            });
            *slot = None;
            break;
        }
        out.push_str(rewritten.as_deref().unwrap_or(line));
        out.push('\n');
    }

    if let Some(missed) = pending.iter().flatten().next() {
        return Err(anyhow!("label `{}` not found in {}", missed.0, path.display()));
    }

    fs::write(path, out).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

/// Marker labels of the GNSS refclock lines in `ntp.conf`.
const NTP_SOURCE_LABELS: [&str; 4] = ["GPS_server", "GPS_fudge", "PPS_server", "PPS_fudge"];

/// Comment or uncomment the GNSS refclock block: commented means the
/// daemon free-runs on the local clock (internal source).
pub fn ntp_source_config(conf: &Path, external: bool) -> Result<()> {
    let edit = if external {
        LineEdit::Uncomment
    } else {
        LineEdit::Comment
    };
    let edits: Vec<(&str, LineEdit)> = NTP_SOURCE_LABELS
        .iter()
        .map(|label| (*label, edit.clone()))
        .collect();
    edit_marked_lines(conf, &edits)
}

/// Rewrite one interface's broadcast line in `ntp.conf`: the address field
/// tracks the interface address, and the line is commented out whenever
/// serving time is not permitted.
pub fn set_ntp_listen(conf: &Path, device: &str, ip: &str, permitted: bool) -> Result<()> {
    edit_marked_lines(
        conf,
        &[(
            device,
            LineEdit::ReplaceField {
                position: 2,
                value: ip.to_string(),
            },
        )],
    )?;
    let edit = if permitted {
        LineEdit::Uncomment
    } else {
        LineEdit::Comment
    };
    edit_marked_lines(conf, &[(device, edit)])
}

/// Cap the step the NTP daemon may take without panicking, in minutes.
pub fn set_timejump(conf: &Path, minutes: u32) -> Result<()> {
    edit_marked_lines(
        conf,
        &[(
            "tinker panic",
            LineEdit::ReplaceField {
                position: 2,
                value: (u64::from(minutes) * 60).to_string(),
            },
        )],
    )
}

/// Dotted-quad each octet in 0..=255.
pub fn validate_ipv4(address: &str) -> bool {
    let octets: Vec<&str> = address.split('.').collect();
    octets.len() == 4
        && octets.iter().all(|octet| {
            !octet.is_empty()
                && octet.len() <= 3
                && octet.chars().all(|c| c.is_ascii_digit())
                && octet.parse::<u32>().map(|n| n <= 255).unwrap_or(false)
        })
}

/// `255.255.255.0` -> 24. Accepts non-contiguous masks the way the prefix
/// count does, since the interface file only carries a prefix length.
pub fn netmask_to_cidr(netmask: &str) -> Option<u32> {
    if !validate_ipv4(netmask) {
        return None;
    }
    Some(
        netmask
            .split('.')
            .filter_map(|octet| octet.parse::<u32>().ok())
            .map(u32::count_ones)
            .sum(),
    )
}

pub fn cidr_to_netmask(cidr: u32) -> String {
    let mask: u32 = if cidr == 0 {
        0
    } else {
        u32::MAX << (32 - cidr.min(32))
    };
    format!(
        "{}.{}.{}.{}",
        mask >> 24,
        (mask >> 16) & 0xff,
        (mask >> 8) & 0xff,
        mask & 0xff
    )
}

/// `192.168.000.001` -> `192.168.0.1`.
fn normalize_ipv4(address: &str) -> String {
    address
        .split('.')
        .map(|octet| octet.trim_start_matches('0'))
        .map(|octet| if octet.is_empty() { "0" } else { octet })
        .collect::<Vec<_>>()
        .join(".")
}

/// Write the systemd-networkd unit for one interface.
pub fn write_network_file(
    network_dir: &Path,
    device: &str,
    ip: &str,
    netmask: &str,
    gateway: &str,
) -> Result<()> {
    let cidr = netmask_to_cidr(netmask)
        .ok_or_else(|| anyhow!("invalid netmask {}", netmask))?;
    let path = network_dir.join(format!("{}.network", device));
    let text = format!(
        "[Match]\nName={}\n\n[Network]\nAddress={}/{}\nGateway={}\n",
        device,
        normalize_ipv4(ip),
        cidr,
        normalize_ipv4(gateway),
    );
    fs::write(&path, text).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

/// Network parameters probed from a live interface or its unit file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetProbe {
    pub ip: String,
    pub netmask: String,
    pub gateway: String,
    pub mac: String,
    pub status: String,
    pub speed: String,
}

/// Read back one interface's parameters: from the kernel when the link is
/// up, from the networkd unit file otherwise.
pub fn read_network(network_dir: &Path, device: &str) -> Result<NetProbe> {
    let status = run_cmd(&format!("ip -br a show {} | awk '{{print $2}}'", device))?
        .trim()
        .to_string();

    if status == "UP" {
        let inet4 = run_cmd(&format!("ip -br a show {} | awk '{{print $3}}'", device))?
            .trim()
            .to_string();
        let gateway = run_cmd(&format!(
            "ip route | awk '/{}/' | awk '/default via/{{print $3}}'",
            device
        ))?
        .lines()
        .next()
        .unwrap_or("")
        .trim()
        .to_string();
        let mac = run_cmd(&format!(
            "ip a show {} | grep ether | awk '{{print $2}}'",
            device
        ))?
        .trim()
        .to_string();
        let speed = run_cmd(&format!("cat /sys/class/net/{}/speed", device))?
            .trim()
            .to_string();

        let (ip, cidr) = inet4
            .split_once('/')
            .ok_or_else(|| anyhow!("no address on {}", device))?;
        let cidr: u32 = cidr.parse().with_context(|| format!("prefix on {}", device))?;
        if gateway.is_empty() {
            return Err(anyhow!("no default route via {}", device));
        }
        return Ok(NetProbe {
            ip: ip.to_string(),
            netmask: cidr_to_netmask(cidr),
            gateway,
            mac,
            status,
            speed,
        });
    }

    // Link down: the unit file is the only source of truth.
    let path = network_dir.join(format!("{}.network", device));
    let text = fs::read_to_string(&path)
        .with_context(|| format!("reading {}", path.display()))?;
    let mut inet4 = None;
    let mut gateway = None;
    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("Address=") {
            inet4 = Some(rest.trim().to_string());
        }
        if let Some(rest) = line.strip_prefix("Gateway=") {
            gateway.get_or_insert_with(|| rest.trim().to_string());
        }
    }
    let inet4 = inet4.ok_or_else(|| anyhow!("no Address= in {}", path.display()))?;
    let gateway = gateway.ok_or_else(|| anyhow!("no Gateway= in {}", path.display()))?;
    let (ip, cidr) = inet4
        .split_once('/')
        .ok_or_else(|| anyhow!("malformed Address= in {}", path.display()))?;
    let cidr: u32 = cidr
        .parse()
        .with_context(|| format!("prefix in {}", path.display()))?;
    Ok(NetProbe {
        ip: ip.to_string(),
        netmask: cidr_to_netmask(cidr),
        gateway,
        mac: "00:00:00:00:00:00".to_string(),
        status,
        speed: "0".to_string(),
    })
}

/// IANA zone used for each whole-hour offset the appliance exposes.
pub fn timezone_name(offset_hours: i32) -> Result<&'static str, ConfigError> {
    let name = match offset_hours {
        -12 => "Etc/GMT+12",
        -11 => "Pacific/Midway",
        -10 => "Pacific/Honolulu",
        -9 => "America/Anchorage",
        -8 => "America/Los_Angeles",
        -7 => "America/Denver",
        -6 => "America/Chicago",
        -5 => "America/Cayman",
        -4 => "Atlantic/Bermuda",
        -3 => "America/Argentina/Buenos_Aires",
        -2 => "Atlantic/South_Georgia",
        -1 => "Atlantic/Cape_Verde",
        0 => "UTC",
        1 => "Europe/Rome",
        2 => "Europe/Kaliningrad",
        3 => "Europe/Moscow",
        4 => "Europe/Samara",
        5 => "Asia/Yekaterinburg",
        6 => "Asia/Omsk",
        7 => "Asia/Novosibirsk",
        8 => "Asia/Irkutsk",
        9 => "Asia/Yakutsk",
        10 => "Asia/Vladivostok",
        11 => "Asia/Magadan",
        12 => "Asia/Kamchatka",
        13 => "Pacific/Apia",
        14 => "Pacific/Kiritimati",
        other => return Err(ConfigError::UnknownTimezone(other)),
    };
    Ok(name)
}

pub fn set_timezone(offset_hours: i32) -> Result<()> {
    let zone = timezone_name(offset_hours).map_err(|e| anyhow!(e))?;
    let out = run_cmd(&format!("timedatectl set-timezone \"{}\"", zone))?;
    if out.trim().is_empty() {
        Ok(())
    } else {
        Err(anyhow!("timedatectl: {}", out.trim()))
    }
}

pub fn set_system_time(date: &str, time: &str) -> Result<()> {
    let out = run_cmd(&format!("timedatectl set-time \"{} {}\"", date, time))?;
    if out.trim().is_empty() {
        Ok(())
    } else {
        Err(anyhow!("timedatectl: {}", out.trim()))
    }
}

/// First field of a `/proc/uptime`-format file, truncated to whole seconds.
/// Absent or unparsable files read as zero.
pub fn read_uptime(path: &Path) -> u64 {
    let text = match fs::read_to_string(path) {
        Ok(t) => t,
        Err(_) => return 0,
    };
    text.split_whitespace()
        .next()
        .and_then(|field| field.parse::<f64>().ok())
        .map(|seconds| seconds as u64)
        .unwrap_or(0)
}

/// Fold the last recorded uptime snapshot into the running total and
/// consume the snapshot file.
pub fn accumulate_optime(snapshot: &Path, optime_sec: u64) -> Option<u64> {
    let uptime = read_uptime(snapshot);
    if uptime == 0 {
        return None;
    }
    if let Err(e) = fs::remove_file(snapshot) {
        debug!("removing {}: {}", snapshot.display(), e);
    }
    Some(optime_sec + uptime)
}

/// Snapshot the kernel uptime so the accumulated operating time survives a
/// hard power cut.
pub fn snapshot_uptime(snapshot: &Path) -> Result<()> {
    let text = fs::read_to_string("/proc/uptime").context("reading /proc/uptime")?;
    fs::write(snapshot, text)
        .with_context(|| format!("writing {}", snapshot.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn ntp_conf() -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            "tinker panic 900\n\
             #server 127.127.20.0 mode 80 minpoll 4 # GPS_server\n\
             #fudge 127.127.20.0 time2 0.496 refid NMEA # GPS_fudge\n\
             #server 127.127.22.0 minpoll 4 # PPS_server\n\
             #fudge 127.127.22.0 flag3 1 refid GPPS # PPS_fudge\n\
             interface listen 192.168.0.101 # lan1\n\
             #interface listen 192.168.0.102 # lan2\n"
        )
        .unwrap();
        file
    }

    #[test]
    fn source_config_toggles_refclock_block() {
        let file = ntp_conf();

        ntp_source_config(file.path(), true).unwrap();
        let text = fs::read_to_string(file.path()).unwrap();
        assert!(text.contains("\nserver 127.127.20.0"));
        assert!(text.contains("\nfudge 127.127.22.0"));

        ntp_source_config(file.path(), false).unwrap();
        let text = fs::read_to_string(file.path()).unwrap();
        assert!(text.contains("#server 127.127.20.0"));
        assert!(text.contains("#server 127.127.22.0"));
        assert!(text.contains("#fudge 127.127.20.0"));
    }

    #[test]
    fn listen_rewrites_address_and_permission() {
        let file = ntp_conf();

        set_ntp_listen(file.path(), "lan1", "10.1.0.5", false).unwrap();
        let text = fs::read_to_string(file.path()).unwrap();
        assert!(text.contains("#interface listen 10.1.0.5 # lan1"));

        set_ntp_listen(file.path(), "lan1", "10.1.0.5", true).unwrap();
        let text = fs::read_to_string(file.path()).unwrap();
        assert!(text.contains("\ninterface listen 10.1.0.5 # lan1"));
        // The other interface's line is untouched.
        assert!(text.contains("#interface listen 192.168.0.102 # lan2"));
    }

    #[test]
    fn timejump_replaces_panic_threshold_in_seconds() {
        let file = ntp_conf();
        set_timejump(file.path(), 15).unwrap();
        let text = fs::read_to_string(file.path()).unwrap();
        assert!(text.starts_with("tinker panic 900\n"));

        set_timejump(file.path(), 2).unwrap();
        let text = fs::read_to_string(file.path()).unwrap();
        assert!(text.starts_with("tinker panic 120\n"));
    }

    #[test]
    fn missing_label_leaves_file_unchanged() {
        let file = ntp_conf();
        let before = fs::read_to_string(file.path()).unwrap();
        assert!(edit_marked_lines(file.path(), &[("lan9", LineEdit::Comment)]).is_err());
        assert_eq!(fs::read_to_string(file.path()).unwrap(), before);
    }

    #[test]
    fn ipv4_validation() {
        assert!(validate_ipv4("192.168.0.1"));
        assert!(validate_ipv4("0.0.0.0"));
        assert!(validate_ipv4("255.255.255.255"));
        assert!(!validate_ipv4("256.0.0.1"));
        assert!(!validate_ipv4("192.168.0"));
        assert!(!validate_ipv4("192.168.0.1.5"));
        assert!(!validate_ipv4("a.b.c.d"));
        assert!(!validate_ipv4(""));
    }

    #[test]
    fn netmask_cidr_round_trip() {
        assert_eq!(netmask_to_cidr("255.255.255.0"), Some(24));
        assert_eq!(netmask_to_cidr("255.255.0.0"), Some(16));
        assert_eq!(netmask_to_cidr("255.255.255.252"), Some(30));
        assert_eq!(netmask_to_cidr("bogus"), None);
        assert_eq!(cidr_to_netmask(24), "255.255.255.0");
        assert_eq!(cidr_to_netmask(30), "255.255.255.252");
        assert_eq!(cidr_to_netmask(0), "0.0.0.0");
    }

    #[test]
    fn network_file_normalizes_octets() {
        let dir = tempfile::tempdir().unwrap();
        write_network_file(
            dir.path(),
            "lan1",
            "192.168.000.101",
            "255.255.255.0",
            "192.168.000.001",
        )
        .unwrap();
        let text = fs::read_to_string(dir.path().join("lan1.network")).unwrap();
        assert_eq!(
            text,
            "[Match]\nName=lan1\n\n[Network]\nAddress=192.168.0.101/24\nGateway=192.168.0.1\n"
        );
    }

    #[test]
    fn downed_interface_reads_back_from_unit_file() {
        let dir = tempfile::tempdir().unwrap();
        write_network_file(dir.path(), "lan2", "10.0.0.2", "255.255.0.0", "10.0.0.1").unwrap();

        let probe = read_network(dir.path(), "lan2").unwrap();
        assert_eq!(probe.ip, "10.0.0.2");
        assert_eq!(probe.netmask, "255.255.0.0");
        assert_eq!(probe.gateway, "10.0.0.1");
        assert_eq!(probe.speed, "0");
    }

    #[test]
    fn timezone_table_covers_the_exposed_range() {
        assert_eq!(timezone_name(3).unwrap(), "Europe/Moscow");
        assert_eq!(timezone_name(0).unwrap(), "UTC");
        assert_eq!(timezone_name(-12).unwrap(), "Etc/GMT+12");
        assert_eq!(timezone_name(14).unwrap(), "Pacific/Kiritimati");
        assert_eq!(timezone_name(15), Err(ConfigError::UnknownTimezone(15)));
    }

    #[test]
    fn uptime_parses_first_float_field() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "12345.67 40000.00\n").unwrap();
        assert_eq!(read_uptime(file.path()), 12345);
        assert_eq!(read_uptime(Path::new("/nonexistent/uptime")), 0);
    }

    #[test]
    fn optime_accumulates_and_consumes_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = dir.path().join("uptime");
        fs::write(&snapshot, "100.5 200.0\n").unwrap();

        assert_eq!(accumulate_optime(&snapshot, 1000), Some(1100));
        assert!(!snapshot.exists());
        // Nothing to fold in once consumed.
        assert_eq!(accumulate_optime(&snapshot, 1100), None);
    }
}
