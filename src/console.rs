//! Narrow contract to the on-device LCD console.
//!
//! The menu rendering logic lives outside this crate; here we only define
//! the seam: button edges go in, console intents and frame buffers come
//! out. The reader task forwards intents to the operator-facing operations.

use crate::config::{ExtSource, LanId, SyncSource};
use crate::packet::LCD_FRAME_LEN;

/// Decoded button/console struct payload: edge counters plus timer flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ButtonFrame {
    pub rising: u16,
    pub falling: u16,
    pub pressed: u16,
    pub clamping: u16,
    pub timers: u16,
}

/// An operator action committed from the console menu.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleIntent {
    ApplyDateTime {
        date: String,
        time: String,
    },
    ApplyTimezones {
        tz: i32,
        tz_kv: i32,
        tz_rs: i32,
    },
    ApplyNetConfig {
        lan: LanId,
        ip: String,
        netmask: String,
        gateway: String,
        listen: bool,
    },
    ApplySyncSelection {
        sync_source: SyncSource,
        ext_source: ExtSource,
        satellite_system: String,
    },
}

/// Result of feeding one button frame to the console.
#[derive(Debug, Clone, Default)]
pub struct ConsoleUpdate {
    /// The screen changed and an `lcd` packet should follow.
    pub redraw: bool,
    pub intents: Vec<ConsoleIntent>,
}

#[cfg_attr(test, mockall::automock)]
pub trait Console: Send + Sync {
    /// Advance the menu state machine with one frame of button edges.
    fn handle_buttons(&self, frame: ButtonFrame) -> ConsoleUpdate;

    /// Render the current screen into an opaque frame buffer for the `lcd`
    /// packet.
    fn render(&self) -> [u8; LCD_FRAME_LEN];
}

/// Console stub for headless operation: ignores buttons, renders blank.
pub struct NullConsole;

impl Console for NullConsole {
    fn handle_buttons(&self, _frame: ButtonFrame) -> ConsoleUpdate {
        ConsoleUpdate::default()
    }

    fn render(&self) -> [u8; LCD_FRAME_LEN] {
        [0u8; LCD_FRAME_LEN]
    }
}
