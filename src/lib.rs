//! Acquisition core for test-and-measurement instruments
//!
//! This library presents a uniform data-acquisition pipeline: a driver
//! discovers instruments on a transport (serial/USB), opens a session,
//! configures sampling parameters and triggers, starts acquisition, and
//! delivers a typed stream of measurement packets to subscribers.
//!
//! # Architecture
//!
//! - **Session**: single-threaded cooperative event loop multiplexing I/O
//!   readiness across heterogeneous devices, fanning out datafeed packets
//! - **Driver**: capability-driven interface every hardware backend honors
//! - **Engines**: an OLS/SUMP serial logic-analyzer engine and a
//!   FX2/DSLogic USB logic-analyzer engine
//! - **DMM parsers**: frame validators/decoders for serial multimeters
//!
//! # Example
//!
//! ```no_run
//! use sigstream::{Registry, Session, ScanOption};
//! use sigstream::drivers::ols::OlsDriver;
//!
//! let mut registry = Registry::new();
//! registry.register(Box::new(OlsDriver::new()))?;
//!
//! let driver = registry.driver_mut("ols").unwrap();
//! let devices = driver.scan(&[ScanOption::Conn("/dev/ttyACM0".into())])?;
//!
//! let mut session = Session::new();
//! session.feed_mut().subscribe(Box::new(|dev, packet| {
//!     println!("{dev}: {}", packet.kind_name());
//! }));
//!
//! driver.dev_open(devices[0])?;
//! driver.acquisition_start(devices[0], &mut session)?;
//! session.run()?;
//! # Ok::<(), sigstream::Error>(())
//! ```

use thiserror::Error;

pub mod device;
pub mod dmm;
pub mod driver;
pub mod drivers;
pub mod packet;
pub mod session;
pub mod transport;
pub mod types;

pub use device::{Device, DeviceId, DeviceStatus, Probe, ProbeKind};
pub use driver::{
    Capability, ConfigValue, Driver, InfoKey, InfoValue, Registry, SamplerateSpec, ScanOption,
};
pub use packet::{Analog, Header, Logic, MetaAnalog, MetaLogic, Packet};
pub use session::{Datafeed, EventSource, Session, SourceAction, SourceEvent, SourceHandle};
pub use types::{Mq, MqFlags, Rational, Unit};

/// Library error type.
///
/// Each variant maps onto one of the stable status codes exposed by
/// [`Error::code`]. Codes are never reused for different errors; new
/// variants may only add codes.
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("device error: {0}")]
    Dev(String),

    #[error("invalid argument: {0}")]
    Arg(String),

    #[error("unsupported samplerate: {0} Hz")]
    Samplerate(u64),

    #[error("internal bug: {0}")]
    Bug(String),
}

impl Error {
    /// Stable numeric status code for this error.
    ///
    /// `0` is reserved for success and `-2` for allocation failure; neither
    /// is ever produced by this enum.
    pub fn code(&self) -> i32 {
        match self {
            Error::Io(_) | Error::Transport(_) | Error::Dev(_) => -1,
            Error::Arg(_) => -3,
            Error::Bug(_) => -4,
            Error::Samplerate(_) => -5,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(Error::Dev("gone".into()).code(), -1);
        assert_eq!(Error::Transport("short read".into()).code(), -1);
        assert_eq!(Error::Arg("bad cap".into()).code(), -3);
        assert_eq!(Error::Bug("null context".into()).code(), -4);
        assert_eq!(Error::Samplerate(1).code(), -5);
    }
}
