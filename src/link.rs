//! Device link: reconnect state machine plus the reader, writer and
//! time-broadcast tasks.
//!
//! The link cycles `Absent -> Acquiring -> Ready` and falls back to
//! `Absent` whenever the transport reports the device gone. Device absence
//! is an expected, non-terminal condition; acquisition retries forever with
//! a fixed backoff. A read timeout is not a transition, and a stalled
//! endpoint gets a bounded number of retries before it is treated as a
//! removal.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, error, info, warn};

use crate::console::ConsoleIntent;
use crate::error::TransportError;
use crate::packet::{Codec, Decoded, Request, VERSION_STRUCT_ID};
use crate::state::SyncState;
use crate::transport::Transport;

const READ_TIMEOUT: Duration = Duration::from_millis(100);
const WRITE_TIMEOUT: Duration = Duration::from_secs(1);
/// Backoff when enumeration finds no device at all.
const ABSENT_BACKOFF: Duration = Duration::from_secs(5);
/// Backoff after enumeration succeeded but claiming failed.
const CLAIM_BACKOFF: Duration = Duration::from_secs(1);
/// Holdoff after a stalled endpoint was feature-cleared.
const STALL_HOLDOFF: Duration = Duration::from_secs(5);
/// Consecutive stalls tolerated before the device is treated as removed.
const MAX_STALLS: u32 = 3;

/// How long the writer waits on the queue before re-checking link health.
const DEQUEUE_TIMEOUT: Duration = Duration::from_millis(250);

/// Idle poll cadence for the broadcaster while the device is absent.
const BROADCAST_IDLE: Duration = Duration::from_millis(250);

/// The reader forwards console intents here; implemented by the operations
/// layer.
#[cfg_attr(test, mockall::automock)]
pub trait IntentHandler: Send + Sync {
    fn handle_intent(&self, intent: ConsoleIntent);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Absent,
    Acquiring,
    Ready,
}

impl LinkState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => LinkState::Acquiring,
            2 => LinkState::Ready,
            _ => LinkState::Absent,
        }
    }
}

enum AcquireOutcome {
    Ready { newly: bool },
    Backoff(Duration),
}

/// The transport handle and link state shared by the reader and writer
/// tasks. Both may drive reacquisition; the mutex serializes them and
/// `acquire` is idempotent once the device is held.
pub struct LinkShared<T: Transport> {
    transport: Mutex<T>,
    state: AtomicU8,
}

impl<T: Transport> LinkShared<T> {
    pub fn new(transport: T) -> Self {
        LinkShared {
            transport: Mutex::new(transport),
            state: AtomicU8::new(LinkState::Absent as u8),
        }
    }

    pub fn state(&self) -> LinkState {
        LinkState::from_u8(self.state.load(Ordering::Relaxed))
    }

    fn set_state(&self, state: LinkState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    fn try_acquire(&self) -> AcquireOutcome {
        let mut transport = self.transport.lock().unwrap_or_else(|e| e.into_inner());
        if self.state() == LinkState::Ready {
            // The peer task got there first.
            return AcquireOutcome::Ready { newly: false };
        }
        self.set_state(LinkState::Acquiring);
        match transport.acquire() {
            Ok(()) => {
                self.set_state(LinkState::Ready);
                info!("USB device detected");
                AcquireOutcome::Ready { newly: true }
            }
            Err(TransportError::NotFound) => {
                self.set_state(LinkState::Absent);
                debug!("USB device not found");
                AcquireOutcome::Backoff(ABSENT_BACKOFF)
            }
            Err(e) => {
                self.set_state(LinkState::Absent);
                warn!("USB device claim failed: {}", e);
                AcquireOutcome::Backoff(CLAIM_BACKOFF)
            }
        }
    }

    fn fault(&self) {
        let mut transport = self.transport.lock().unwrap_or_else(|e| e.into_inner());
        transport.release();
        self.set_state(LinkState::Absent);
        warn!("USB link lost, re-enumerating");
    }

    #[cfg(test)]
    fn force_ready(&self) {
        self.set_state(LinkState::Ready);
    }
}

/// Reader task: decodes MCU packets, enqueues follow-up requests and
/// forwards console intents.
pub struct Reader<T: Transport> {
    link: Arc<LinkShared<T>>,
    codec: Arc<Codec>,
    state: Arc<SyncState>,
    requests: Sender<Request>,
    intents: Arc<dyn IntentHandler>,
    stalls: u32,
}

impl<T: Transport> Reader<T> {
    pub fn new(
        link: Arc<LinkShared<T>>,
        codec: Arc<Codec>,
        state: Arc<SyncState>,
        requests: Sender<Request>,
        intents: Arc<dyn IntentHandler>,
    ) -> Self {
        Reader {
            link,
            codec,
            state,
            requests,
            intents,
            stalls: 0,
        }
    }

    pub fn run(mut self) {
        loop {
            if let Some(backoff) = self.step() {
                std::thread::sleep(backoff);
            }
        }
    }

    /// One iteration; returns how long the caller should back off, if at
    /// all.
    fn step(&mut self) -> Option<Duration> {
        if self.link.state() != LinkState::Ready {
            return match self.link.try_acquire() {
                AcquireOutcome::Ready { newly } => {
                    if newly {
                        enqueue_startup_requests(&self.requests);
                    }
                    None
                }
                AcquireOutcome::Backoff(d) => Some(d),
            };
        }

        let result = {
            let mut transport = self.link.transport.lock().unwrap_or_else(|e| e.into_inner());
            transport.read(READ_TIMEOUT)
        };
        match result {
            Ok(data) => {
                self.stalls = 0;
                debug!("READ: {:02x?}", data);
                self.dispatch(&data);
                None
            }
            Err(TransportError::Timeout) => {
                self.stalls = 0;
                debug!("read timeout");
                None
            }
            Err(TransportError::Stall) => {
                self.stalls += 1;
                if self.stalls >= MAX_STALLS {
                    self.stalls = 0;
                    self.link.fault();
                    None
                } else {
                    Some(STALL_HOLDOFF)
                }
            }
            Err(e) => {
                error!("USB read failed: {}", e);
                self.stalls = 0;
                self.link.fault();
                None
            }
        }
    }

    fn dispatch(&self, data: &[u8]) {
        match self.codec.decode(data) {
            Err(e) => warn!("Discarding inbound packet: {}", e),
            Ok(Decoded::Void) => {}
            Ok(Decoded::Get(request)) => self.send(request),
            Ok(Decoded::PpsInfo(info)) => {
                debug!("PPS discipline report: {:?}", info);
                *self.state.pps_info.write().unwrap_or_else(|e| e.into_inner()) = Some(info);
            }
            Ok(Decoded::Buttons { frame, update }) => {
                debug!("console buttons: {:?}", frame);
                for intent in update.intents {
                    self.intents.handle_intent(intent);
                }
                if update.redraw {
                    self.send(Request::Lcd);
                }
            }
            Ok(Decoded::Version(version)) => {
                info!(
                    "MCU firmware: model={} range={} date={} mods={}",
                    version.model, version.range, version.date, version.mods
                );
                *self
                    .state
                    .mcu_version
                    .write()
                    .unwrap_or_else(|e| e.into_inner()) = Some(version);
            }
        }
    }

    fn send(&self, request: Request) {
        if self.requests.send(request).is_err() {
            warn!("request queue closed");
        }
    }
}

/// Writer task: drains the FIFO request queue, encoding each item against
/// the current state snapshot.
pub struct Writer<T: Transport> {
    link: Arc<LinkShared<T>>,
    codec: Arc<Codec>,
    state: Arc<SyncState>,
    queue: Receiver<Request>,
    requests: Sender<Request>,
    stalls: u32,
}

impl<T: Transport> Writer<T> {
    pub fn new(
        link: Arc<LinkShared<T>>,
        codec: Arc<Codec>,
        state: Arc<SyncState>,
        queue: Receiver<Request>,
        requests: Sender<Request>,
    ) -> Self {
        Writer {
            link,
            codec,
            state,
            queue,
            requests,
            stalls: 0,
        }
    }

    pub fn run(mut self) {
        loop {
            if let Some(backoff) = self.step() {
                std::thread::sleep(backoff);
            }
        }
    }

    fn step(&mut self) -> Option<Duration> {
        if self.link.state() != LinkState::Ready {
            return match self.link.try_acquire() {
                AcquireOutcome::Ready { newly } => {
                    if newly {
                        enqueue_startup_requests(&self.requests);
                    }
                    None
                }
                AcquireOutcome::Backoff(d) => Some(d),
            };
        }

        let request = match self.queue.recv_timeout(DEQUEUE_TIMEOUT) {
            Ok(r) => r,
            Err(RecvTimeoutError::Timeout) => return None,
            Err(RecvTimeoutError::Disconnected) => return Some(DEQUEUE_TIMEOUT),
        };

        let snapshot = self.state.packet_snapshot();
        let bytes = self.codec.encode(request, &snapshot);
        debug!("SEND: {:?}", request);

        let result = {
            let mut transport = self.link.transport.lock().unwrap_or_else(|e| e.into_inner());
            transport.write(&bytes, WRITE_TIMEOUT)
        };
        match result {
            Ok(()) => {
                self.stalls = 0;
                None
            }
            Err(TransportError::Timeout) => {
                // Best-effort delivery; the item is not retried.
                debug!("send timeout for {:?}", request);
                None
            }
            Err(TransportError::Stall) => {
                self.stalls += 1;
                if self.stalls >= MAX_STALLS {
                    self.stalls = 0;
                    self.link.fault();
                    None
                } else {
                    Some(STALL_HOLDOFF)
                }
            }
            Err(e) => {
                // The dequeued item is discarded; no redelivery across
                // reconnect.
                error!("USB write failed: {}", e);
                self.stalls = 0;
                self.link.fault();
                None
            }
        }
    }
}

/// First packets after every (re)connection: mux selection, watchdog
/// parameters and a version query.
fn enqueue_startup_requests(requests: &Sender<Request>) {
    for request in [
        Request::GpsMux,
        Request::GpsWdog,
        Request::Get(VERSION_STRUCT_ID),
    ] {
        if requests.send(request).is_err() {
            return;
        }
    }
}

/// Packets sent on each second boundary: the clock stream, the fix status
/// and a version query whose reply doubles as an MCU liveness probe.
fn enqueue_second_broadcast(requests: &Sender<Request>) -> bool {
    for request in [
        Request::Time,
        Request::Status,
        Request::Get(VERSION_STRUCT_ID),
    ] {
        if requests.send(request).is_err() {
            return false;
        }
    }
    true
}

/// Periodic MCU time broadcast, aligned to the wall-clock second boundary.
/// Sleeping for the remainder of the current second instead of a fixed
/// interval keeps cumulative drift from accruing.
pub fn run_time_broadcast<T: Transport>(link: Arc<LinkShared<T>>, requests: Sender<Request>) {
    loop {
        if link.state() != LinkState::Ready {
            std::thread::sleep(BROADCAST_IDLE);
            continue;
        }

        let millis_into_second = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::from(d.subsec_millis()))
            .unwrap_or(0);

        if millis_into_second < 100 && !enqueue_second_broadcast(&requests) {
            warn!("request queue closed, stopping time broadcast");
            return;
        }

        std::thread::sleep(Duration::from_millis(1000 - millis_into_second));
    }
}
