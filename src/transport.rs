//! Device acquisition and bulk transfer over the physical USB link.
//!
//! Only [`UsbTransport`] touches real hardware; everything above it talks
//! to the [`Transport`] trait, so the link state machine can be exercised
//! with a mock.

use std::time::Duration;

use log::{debug, error};
use rusb::{DeviceHandle, GlobalContext};

use crate::error::TransportError;

const VENDOR_ID: u16 = 0x0483;
const PRODUCT_ID: u16 = 0x572b;

/// Interfaces the kernel may have claimed for its own drivers.
const CLAIMED_INTERFACES: [u8; 3] = [0, 1, 2];

const EP_IN: u8 = 0x81;
const EP_OUT: u8 = 0x01;

/// Inbound packets are at most one 64-byte bulk transfer.
pub const READ_BUF_LEN: usize = 64;

#[cfg_attr(test, mockall::automock)]
pub trait Transport: Send {
    /// Enumerate and claim the device. Idempotent when already acquired.
    /// `NotFound` means no device is attached; `Claim` means enumeration
    /// succeeded but configuration failed.
    fn acquire(&mut self) -> Result<(), TransportError>;

    /// Drop the handle. Safe to call when nothing is acquired.
    fn release(&mut self);

    fn read(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError>;

    fn write(&mut self, data: &[u8], timeout: Duration) -> Result<(), TransportError>;
}

pub struct UsbTransport {
    handle: Option<DeviceHandle<GlobalContext>>,
}

impl UsbTransport {
    pub fn new() -> Self {
        UsbTransport { handle: None }
    }

    /// Map a bulk-transfer error, attempting a feature-clear on a stalled
    /// endpoint before giving the device up for gone.
    fn map_transfer_error(&mut self, endpoint: u8, err: rusb::Error) -> TransportError {
        match err {
            rusb::Error::Timeout => TransportError::Timeout,
            rusb::Error::NoDevice => {
                self.release();
                TransportError::Gone
            }
            rusb::Error::Pipe => {
                let cleared = self
                    .handle
                    .as_ref()
                    .map(|h| h.clear_halt(endpoint))
                    .unwrap_or(Err(rusb::Error::NoDevice));
                match cleared {
                    Ok(()) => {
                        debug!("Cleared stalled endpoint {:#04x}", endpoint);
                        TransportError::Stall
                    }
                    Err(e) => {
                        error!("Endpoint {:#04x} feature-clear failed: {}", endpoint, e);
                        self.release();
                        TransportError::Gone
                    }
                }
            }
            other => {
                error!("USB transfer failed: {}", other);
                self.release();
                TransportError::Gone
            }
        }
    }
}

impl Default for UsbTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for UsbTransport {
    fn acquire(&mut self) -> Result<(), TransportError> {
        if self.handle.is_some() {
            return Ok(());
        }

        let handle = match rusb::open_device_with_vid_pid(VENDOR_ID, PRODUCT_ID) {
            Some(h) => h,
            None => return Err(TransportError::NotFound),
        };

        // Remember which interfaces we stole from the kernel so they can be
        // handed back after configuration (or if configuration fails).
        let mut detached = Vec::new();
        for interface in CLAIMED_INTERFACES {
            match handle.kernel_driver_active(interface) {
                Ok(true) => match handle.detach_kernel_driver(interface) {
                    Ok(()) => {
                        debug!("Detached kernel driver from interface {}", interface);
                        detached.push(interface);
                    }
                    Err(e) => debug!("Detach of interface {} failed: {}", interface, e),
                },
                Ok(false) => {}
                Err(e) => debug!("Driver query on interface {} failed: {}", interface, e),
            }
        }

        if let Err(e) = handle.set_active_configuration(1) {
            for interface in detached {
                if let Err(e) = handle.attach_kernel_driver(interface) {
                    debug!("Reattach of interface {} failed: {}", interface, e);
                }
            }
            return Err(TransportError::Claim(e.to_string()));
        }

        for interface in detached {
            match handle.attach_kernel_driver(interface) {
                Ok(()) => debug!("Reattached kernel driver to interface {}", interface),
                Err(e) => debug!("Reattach of interface {} failed: {}", interface, e),
            }
        }

        self.handle = Some(handle);
        Ok(())
    }

    fn release(&mut self) {
        self.handle = None;
    }

    fn read(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let handle = self.handle.as_ref().ok_or(TransportError::Gone)?;
        let mut buf = [0u8; READ_BUF_LEN];
        match handle.read_bulk(EP_IN, &mut buf, timeout) {
            Ok(len) => Ok(buf[..len].to_vec()),
            Err(e) => Err(self.map_transfer_error(EP_IN, e)),
        }
    }

    fn write(&mut self, data: &[u8], timeout: Duration) -> Result<(), TransportError> {
        let handle = self.handle.as_ref().ok_or(TransportError::Gone)?;
        match handle.write_bulk(EP_OUT, data, timeout) {
            Ok(_) => Ok(()),
            Err(e) => Err(self.map_transfer_error(EP_OUT, e)),
        }
    }
}
