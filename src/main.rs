use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use log::{info, warn};

use timestation::arbiter::SyncArbiter;
use timestation::config::SyncConfig;
use timestation::console::NullConsole;
use timestation::gnss::GnssMonitor;
use timestation::link::{run_time_broadcast, LinkShared, Reader, Writer};
use timestation::ops::{Irz7Port, Ops, OpsPaths};
use timestation::packet::Codec;
use timestation::state::SyncState;
use timestation::system;
use timestation::telemetry;
use timestation::transport::UsbTransport;
use timestation::watchdog::Watchdog;

#[derive(Parser, Debug)]
#[command(author, version, about = "GNSS time-station host controller", long_about = None)]
struct Args {
    /// Persisted settings file
    #[arg(long, default_value = "/var/lib/timestation/settings.json")]
    settings: PathBuf,

    /// NTP daemon configuration file
    #[arg(long, default_value = "/etc/ntp.conf")]
    ntp_conf: PathBuf,

    /// systemd-networkd unit directory
    #[arg(long, default_value = "/etc/systemd/network")]
    network_dir: PathBuf,

    /// Uptime snapshot file for operating-time accounting
    #[arg(long, default_value = "/var/lib/timestation/uptime")]
    uptime_file: PathBuf,

    /// gpsd endpoint
    #[arg(long, default_value = "127.0.0.1:2947")]
    gpsd: String,

    /// Serial device of the external GNSS receiver
    #[arg(long, default_value = "/dev/ttyS1")]
    receiver_device: String,

    /// Log level (error, warn, info, debug, trace); RUST_LOG overrides
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();
    env_logger::init_from_env(env_logger::Env::default().default_filter_or(args.log_level.as_str()));

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        info!("Shutdown requested");
        r.store(false, Ordering::SeqCst);
    })?;

    let config = match SyncConfig::load(&args.settings) {
        Ok(c) => c,
        Err(e) => {
            warn!("Settings unavailable ({:#}), using factory defaults", e);
            SyncConfig::default()
        }
    };

    let state = Arc::new(SyncState::new(config));
    let (telemetry_tx, telemetry_rx) = telemetry::channel();
    let (requests_tx, requests_rx) = mpsc::channel();

    let paths = OpsPaths {
        settings: args.settings.clone(),
        ntp_conf: args.ntp_conf.clone(),
        network_dir: args.network_dir.clone(),
        uptime_snapshot: args.uptime_file.clone(),
    };
    let ops = Arc::new(Ops::new(
        state.clone(),
        requests_tx.clone(),
        Box::new(Irz7Port::new(&args.receiver_device)),
        paths.clone(),
    ));

    // Startup housekeeping: fold the last boot's uptime into the operating
    // time, read the live network config back, and make the NTP permission
    // lines consistent with it.
    ops.restore_optime();
    ops.seed_network();
    if let Err(e) = ops.refresh_listen_permissions() {
        warn!("initial NTP permission refresh failed: {:#}", e);
    }

    let codec = Arc::new(Codec::new(Arc::new(NullConsole)));
    let link = Arc::new(LinkShared::new(UsbTransport::new()));

    {
        let reader = Reader::new(
            link.clone(),
            codec.clone(),
            state.clone(),
            requests_tx.clone(),
            ops.clone(),
        );
        thread::Builder::new()
            .name("usb-reader".into())
            .spawn(move || reader.run())?;
    }
    {
        let writer = Writer::new(
            link.clone(),
            codec.clone(),
            state.clone(),
            requests_rx,
            requests_tx.clone(),
        );
        thread::Builder::new()
            .name("usb-writer".into())
            .spawn(move || writer.run())?;
    }
    {
        let link = link.clone();
        let requests = requests_tx.clone();
        thread::Builder::new()
            .name("time-broadcast".into())
            .spawn(move || run_time_broadcast(link, requests))?;
    }
    {
        let arbiter = SyncArbiter::new(state.clone(), telemetry_tx.clone());
        thread::Builder::new()
            .name("arbiter".into())
            .spawn(move || arbiter.run())?;
    }
    {
        let monitor = GnssMonitor::new(
            args.gpsd.clone(),
            state.clone(),
            ops.clone(),
            telemetry_tx.clone(),
        );
        thread::Builder::new()
            .name("gnss-monitor".into())
            .spawn(move || monitor.run())?;
    }
    {
        let watchdog = Watchdog::new(state.clone(), telemetry_tx.clone());
        thread::Builder::new()
            .name("gnss-watchdog".into())
            .spawn(move || watchdog.run())?;
    }
    {
        let ops = ops.clone();
        thread::Builder::new()
            .name("uptime".into())
            .spawn(move || ops.run_uptime_task())?;
    }
    thread::Builder::new()
        .name("telemetry-drain".into())
        .spawn(move || telemetry::run_drain(telemetry_rx))?;

    info!("Time station controller started");

    while running.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(500));
    }

    // Worker threads are detached; a final uptime snapshot is the only
    // state worth flushing.
    if let Err(e) = system::snapshot_uptime(&args.uptime_file) {
        warn!("final uptime snapshot: {:#}", e);
    }
    info!("Time station controller stopped");
    Ok(())
}
