use thiserror::Error;

/// Errors surfaced by the USB transport layer.
///
/// `Timeout` is routine (the MCU simply had nothing to say) and is logged at
/// debug level only. `Stall` means an endpoint halted and a feature-clear was
/// attempted; the caller may retry. `Gone` means the device was physically
/// removed and the link must be released and re-acquired.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transfer timed out")]
    Timeout,
    #[error("endpoint stalled")]
    Stall,
    #[error("device removed")]
    Gone,
    #[error("no device found")]
    NotFound,
    #[error("failed to claim device: {0}")]
    Claim(String),
}

/// Errors raised by the packet codec. The offending packet is discarded and
/// logged; neither variant mutates state or triggers a retry.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unknown struct id {0}")]
    UnknownStruct(u16),
    #[error("malformed packet: {0}")]
    MalformedPacket(String),
}

/// Validation failures from operator-facing operations. Returned to the
/// caller as a human-readable message; no state is mutated.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid address")]
    InvalidAddress,
    #[error("Unsupported UART speed: {0}")]
    UnsupportedSpeed(String),
    #[error("Invalid timeout value: {0}")]
    InvalidTimeout(String),
    #[error("Unknown timezone offset: {0:+}")]
    UnknownTimezone(i32),
    #[error("{0}")]
    Rejected(String),
}
