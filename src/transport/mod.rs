//! Transport primitives consumed by the acquisition engines
//!
//! Engines talk to hardware through the [`serial::SerialTransport`] and
//! [`usb::UsbTransport`] traits; the concrete adapters here wrap the
//! `serialport` and `rusb` crates. Tests drive the engines with in-memory
//! implementations of the same traits.

pub mod serial;
pub mod usb;

pub use serial::{ConnSpec, Parity, SerialComm, SerialTransport, SystemSerial};
pub use usb::{UsbBackend, UsbDeviceInfo, UsbTransport, USB_TIMEOUT};
