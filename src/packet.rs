//! Binary codec for the MCU packet catalogue.
//!
//! Every packet starts with a little-endian `u16` struct-id followed by a
//! fixed-layout payload. Outbound packets are encoded from a state
//! snapshot taken at send time; inbound packets are decoded into typed
//! values plus any follow-up work the reader must perform. Unknown ids are
//! never encoded and never dispatched.
//!
//! Outbound layouts (id, payload):
//! - `void`     0  (none)
//! - `get`      1  requested struct-id (u16)
//! - `time`     2  utc, utc+tz*3600, utc+tz_kv*3600, utc+tz_rs*3600 (4 x u64)
//! - `status`   3  gnss_status (u8: 0=none,1=invalid,2=valid),
//!                 ntp_mode (u8: 0=none,1=internal,2=gnss)
//! - `gps_mux`  4  external-source selector (u8: 0=none,1=internal,2=RS422,3=RS232)
//! - `gps_wdog` 5  pps_timeout, connect_timeout, reset_hold (3 x u32)
//! - `reset`    6  gps_reset, pps_reset, mcu_reset (3 x u8)
//! - `lcd`      7  opaque 488-byte console frame
//!
//! Inbound layouts:
//! - `void`     0  (none)
//! - `get`      1  struct-id the MCU wants sent (u16)
//! - `pps_info` 2  aif_state, aop_state, aop_delta, aif_delta (4 x i32),
//!                 aif_sum (u64), dac (u16)
//! - `buttons`  3  rising, falling, pressed, clamping, timers (5 x u16)
//! - `version`  4  model, range, date (16 bytes each), mods (2 bytes)

use std::io::Cursor;
use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt};

use crate::config::{ExtSource, McuParams, SyncSource};
use crate::console::{ButtonFrame, Console, ConsoleUpdate};
use crate::error::ProtocolError;

pub const LCD_FRAME_LEN: usize = 488;

/// Inbound struct-id of the MCU version record, requested with `get`.
pub const VERSION_STRUCT_ID: u16 = 4;

/// A named outbound request awaiting transmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    Void,
    Get(u16),
    Time,
    Status,
    GpsMux,
    GpsWdog,
    Reset,
    Lcd,
}

impl Request {
    pub fn struct_id(self) -> u16 {
        match self {
            Request::Void => 0,
            Request::Get(_) => 1,
            Request::Time => 2,
            Request::Status => 3,
            Request::GpsMux => 4,
            Request::GpsWdog => 5,
            Request::Reset => 6,
            Request::Lcd => 7,
        }
    }

    /// Resolve the struct-id named by an inbound `get` into the request
    /// that will answer it.
    pub fn from_struct_id(id: u16) -> Result<Request, ProtocolError> {
        match id {
            0 => Ok(Request::Void),
            // A `get` for `get` can only mean "resend the version query".
            1 => Ok(Request::Get(VERSION_STRUCT_ID)),
            2 => Ok(Request::Time),
            3 => Ok(Request::Status),
            4 => Ok(Request::GpsMux),
            5 => Ok(Request::GpsWdog),
            6 => Ok(Request::Reset),
            7 => Ok(Request::Lcd),
            other => Err(ProtocolError::UnknownStruct(other)),
        }
    }
}

/// Values captured from [`crate::state::SyncState`] immediately before
/// encoding, so a queued request is never serialized against stale data.
#[derive(Debug, Clone, Copy)]
pub struct PacketSnapshot {
    /// Current UTC, seconds since the epoch.
    pub utc: i64,
    pub tz: i32,
    pub tz_kv: i32,
    pub tz_rs: i32,
    /// Raw NMEA-style fix status: -1 none, 0 'V', 1 'A', 2 'D'.
    pub gnss_status: i64,
    pub sync_source: SyncSource,
    pub ext_source: ExtSource,
    pub mcu: McuParams,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PpsInfo {
    pub aif_state: i32,
    pub aop_state: i32,
    pub aop_delta: i32,
    pub aif_delta: i32,
    pub aif_sum: u64,
    pub dac: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct McuVersion {
    pub model: String,
    pub range: String,
    pub date: String,
    pub mods: String,
}

/// A decoded inbound packet together with the follow-up it demands.
#[derive(Debug)]
pub enum Decoded {
    Void,
    /// The MCU asked us to send a struct.
    Get(Request),
    PpsInfo(PpsInfo),
    Buttons {
        frame: ButtonFrame,
        update: ConsoleUpdate,
    },
    Version(McuVersion),
}

pub struct Codec {
    console: Arc<dyn Console>,
}

impl Codec {
    pub fn new(console: Arc<dyn Console>) -> Self {
        Codec { console }
    }

    /// Encode a request against the given snapshot. Pure and deterministic;
    /// never mutates state.
    pub fn encode(&self, request: Request, snap: &PacketSnapshot) -> Vec<u8> {
        let mut out = Vec::with_capacity(16);
        out.extend_from_slice(&request.struct_id().to_le_bytes());

        match request {
            Request::Void => {}
            Request::Get(struct_id) => {
                out.extend_from_slice(&struct_id.to_le_bytes());
            }
            Request::Time => {
                for tz_hours in [0, snap.tz, snap.tz_kv, snap.tz_rs] {
                    let shifted = snap.utc + i64::from(tz_hours) * 3600;
                    out.extend_from_slice(&(shifted as u64).to_le_bytes());
                }
            }
            Request::Status => {
                // NMEA status {-1,0,1,2} -> wire {0,1,2,2}; anything else
                // counts as "no receiver".
                let raw = if (-1..=2).contains(&snap.gnss_status) {
                    snap.gnss_status
                } else {
                    -1
                };
                let gnss_status = (raw + 1).min(2) as u8;
                let ntp_mode = match snap.sync_source {
                    SyncSource::Internal => 1u8,
                    SyncSource::External => 2u8,
                };
                out.push(gnss_status);
                out.push(ntp_mode);
            }
            Request::GpsMux => {
                let selector = match snap.sync_source {
                    SyncSource::Internal => 0,
                    SyncSource::External => snap.ext_source.mux_code(),
                };
                out.push(selector);
            }
            Request::GpsWdog => {
                for value in [
                    snap.mcu.pps_timeout,
                    snap.mcu.connect_timeout,
                    snap.mcu.reset_hold,
                ] {
                    out.extend_from_slice(&value.to_le_bytes());
                }
            }
            Request::Reset => {
                out.push(snap.mcu.gps_reset);
                out.push(snap.mcu.pps_reset);
                out.push(snap.mcu.mcu_reset);
            }
            Request::Lcd => {
                out.extend_from_slice(&self.console.render());
            }
        }

        out
    }

    /// Decode an inbound packet. Button frames are run through the console
    /// collaborator so the resulting intents travel with the decode result;
    /// the codec itself performs no other side effects.
    pub fn decode(&self, data: &[u8]) -> Result<Decoded, ProtocolError> {
        if data.len() < 2 {
            return Err(ProtocolError::MalformedPacket(format!(
                "{} byte packet has no struct id",
                data.len()
            )));
        }
        let mut rdr = Cursor::new(data);
        let struct_id = rdr.read_u16::<LittleEndian>()?;

        match struct_id {
            0 => {
                expect_len(data, 2, "void")?;
                Ok(Decoded::Void)
            }
            1 => {
                expect_len(data, 4, "get")?;
                let wanted = rdr.read_u16::<LittleEndian>()?;
                Ok(Decoded::Get(Request::from_struct_id(wanted)?))
            }
            2 => {
                expect_len(data, 28, "pps_info")?;
                Ok(Decoded::PpsInfo(PpsInfo {
                    aif_state: rdr.read_i32::<LittleEndian>()?,
                    aop_state: rdr.read_i32::<LittleEndian>()?,
                    aop_delta: rdr.read_i32::<LittleEndian>()?,
                    aif_delta: rdr.read_i32::<LittleEndian>()?,
                    aif_sum: rdr.read_u64::<LittleEndian>()?,
                    dac: rdr.read_u16::<LittleEndian>()?,
                }))
            }
            3 => {
                expect_len(data, 12, "buttons")?;
                let frame = ButtonFrame {
                    rising: rdr.read_u16::<LittleEndian>()?,
                    falling: rdr.read_u16::<LittleEndian>()?,
                    pressed: rdr.read_u16::<LittleEndian>()?,
                    clamping: rdr.read_u16::<LittleEndian>()?,
                    timers: rdr.read_u16::<LittleEndian>()?,
                };
                let update = self.console.handle_buttons(frame);
                Ok(Decoded::Buttons { frame, update })
            }
            4 => {
                expect_len(data, 52, "version")?;
                Ok(Decoded::Version(McuVersion {
                    model: fixed_text(&data[2..18]),
                    range: fixed_text(&data[18..34]),
                    date: fixed_text(&data[34..50]),
                    mods: fixed_text(&data[50..52]),
                }))
            }
            other => Err(ProtocolError::MalformedPacket(format!(
                "unknown inbound struct id {}",
                other
            ))),
        }
    }
}

fn expect_len(data: &[u8], expected: usize, name: &str) -> Result<(), ProtocolError> {
    if data.len() != expected {
        return Err(ProtocolError::MalformedPacket(format!(
            "{} packet is {} bytes, expected {}",
            name,
            data.len(),
            expected
        )));
    }
    Ok(())
}

/// NUL-padded fixed-width text field.
fn fixed_text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches('\0')
        .to_string()
}

impl From<std::io::Error> for ProtocolError {
    fn from(e: std::io::Error) -> Self {
        ProtocolError::MalformedPacket(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::NullConsole;

    fn codec() -> Codec {
        Codec::new(Arc::new(NullConsole))
    }

    fn snapshot() -> PacketSnapshot {
        PacketSnapshot {
            utc: 1_700_000_000,
            tz: 3,
            tz_kv: 0,
            tz_rs: -2,
            gnss_status: 2,
            sync_source: SyncSource::External,
            ext_source: ExtSource::Rs422,
            mcu: McuParams::default(),
        }
    }

    fn read_u16(data: &[u8], at: usize) -> u16 {
        u16::from_le_bytes([data[at], data[at + 1]])
    }

    fn read_u64(data: &[u8], at: usize) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&data[at..at + 8]);
        u64::from_le_bytes(buf)
    }

    #[test]
    fn void_and_get_round_trip() {
        let codec = codec();
        let snap = snapshot();

        let void = codec.encode(Request::Void, &snap);
        assert_eq!(void, vec![0, 0]);
        assert!(matches!(codec.decode(&void).unwrap(), Decoded::Void));

        let get = codec.encode(Request::Get(VERSION_STRUCT_ID), &snap);
        assert_eq!(get.len(), 4);
        assert_eq!(read_u16(&get, 0), 1);
        match codec.decode(&get).unwrap() {
            Decoded::Get(Request::GpsMux) => {} // inbound id 4 names gps_mux
            other => panic!("unexpected decode: {:?}", other),
        }
    }

    #[test]
    fn time_fields_follow_timezone_arithmetic() {
        let snap = snapshot();
        let data = codec().encode(Request::Time, &snap);
        assert_eq!(data.len(), 2 + 4 * 8);
        assert_eq!(read_u16(&data, 0), 2);
        let utc = snap.utc as u64;
        assert_eq!(read_u64(&data, 2), utc);
        assert_eq!(read_u64(&data, 10), utc + 3 * 3600);
        assert_eq!(read_u64(&data, 18), utc);
        assert_eq!(read_u64(&data, 26), utc - 2 * 3600);
    }

    #[test]
    fn status_maps_fix_status_and_ntp_mode() {
        let codec = codec();
        let mut snap = snapshot();

        // 'D' (differential) clamps to "valid", external source -> gnss mode.
        let data = codec.encode(Request::Status, &snap);
        assert_eq!(data, vec![3, 0, 2, 2]);

        snap.gnss_status = -1;
        snap.sync_source = SyncSource::Internal;
        let data = codec.encode(Request::Status, &snap);
        assert_eq!(data, vec![3, 0, 0, 1]);

        snap.gnss_status = 99;
        let data = codec.encode(Request::Status, &snap);
        assert_eq!(data[2], 0);
    }

    #[test]
    fn gps_mux_selector_follows_sync_and_ext_source() {
        let codec = codec();
        let mut snap = snapshot();

        assert_eq!(codec.encode(Request::GpsMux, &snap), vec![4, 0, 2]);

        snap.ext_source = ExtSource::Rs232;
        assert_eq!(codec.encode(Request::GpsMux, &snap)[2], 3);

        snap.sync_source = SyncSource::Internal;
        assert_eq!(codec.encode(Request::GpsMux, &snap)[2], 0);
    }

    #[test]
    fn gps_wdog_and_reset_round_trip_config_fields() {
        let mut snap = snapshot();
        snap.mcu.pps_timeout = 7;
        snap.mcu.connect_timeout = 600;
        snap.mcu.reset_hold = 2;
        snap.mcu.pps_reset = 1;

        let wdog = codec().encode(Request::GpsWdog, &snap);
        assert_eq!(wdog.len(), 14);
        assert_eq!(read_u16(&wdog, 0), 5);
        assert_eq!(u32::from_le_bytes(wdog[2..6].try_into().unwrap()), 7);
        assert_eq!(u32::from_le_bytes(wdog[6..10].try_into().unwrap()), 600);
        assert_eq!(u32::from_le_bytes(wdog[10..14].try_into().unwrap()), 2);

        let reset = codec().encode(Request::Reset, &snap);
        assert_eq!(reset, vec![6, 0, 0, 1, 0]);
    }

    #[test]
    fn lcd_carries_full_frame() {
        let data = codec().encode(Request::Lcd, &snapshot());
        assert_eq!(data.len(), 2 + LCD_FRAME_LEN);
        assert_eq!(read_u16(&data, 0), 7);
    }

    #[test]
    fn buttons_decode_produces_frame_and_console_update() {
        let codec = codec();
        let mut data = vec![3u8, 0];
        for v in [1u16, 0, 2, 0, 8] {
            data.extend_from_slice(&v.to_le_bytes());
        }
        match codec.decode(&data).unwrap() {
            Decoded::Buttons { frame, update } => {
                assert_eq!(frame.rising, 1);
                assert_eq!(frame.pressed, 2);
                assert_eq!(frame.timers, 8);
                assert!(!update.redraw);
                assert!(update.intents.is_empty());
            }
            other => panic!("unexpected decode: {:?}", other),
        }
    }

    #[test]
    fn version_decode_strips_padding() {
        let mut data = vec![4u8, 0];
        let mut field = |text: &str, width: usize| {
            let mut buf = vec![0u8; width];
            buf[..text.len()].copy_from_slice(text.as_bytes());
            data.extend_from_slice(&buf);
        };
        field("BS-683", 16);
        field("1.0", 16);
        field("2023-11-01", 16);
        field("A", 2);

        match codec().decode(&data).unwrap() {
            Decoded::Version(v) => {
                assert_eq!(v.model, "BS-683");
                assert_eq!(v.range, "1.0");
                assert_eq!(v.date, "2023-11-01");
                assert_eq!(v.mods, "A");
            }
            other => panic!("unexpected decode: {:?}", other),
        }
    }

    #[test]
    fn malformed_packets_are_rejected() {
        let codec = codec();
        assert!(matches!(
            codec.decode(&[]),
            Err(ProtocolError::MalformedPacket(_))
        ));
        // Known id, wrong length.
        assert!(matches!(
            codec.decode(&[3, 0, 1, 2]),
            Err(ProtocolError::MalformedPacket(_))
        ));
        // Unknown inbound id.
        assert!(matches!(
            codec.decode(&[9, 0]),
            Err(ProtocolError::MalformedPacket(_))
        ));
        // `get` naming a struct outside the catalogue.
        let mut get = vec![1u8, 0];
        get.extend_from_slice(&42u16.to_le_bytes());
        assert!(matches!(
            codec.decode(&get),
            Err(ProtocolError::UnknownStruct(42))
        ));
    }
}
