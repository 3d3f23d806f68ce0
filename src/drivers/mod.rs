//! Hardware backends
//!
//! Each driver generalizes over its transport through a factory or backend
//! trait so the engines can be exercised against scripted in-memory
//! transports.

pub mod dslogic;
pub mod ols;
pub mod serial_dmm;

use std::fs::File;
use std::io::Read;
use std::path::PathBuf;

use crate::transport::serial::{ConnSpec, SerialComm, SerialTransport, SystemSerial};
use crate::{Error, Result};

/// Creates a serial transport for a connection. Drivers call this on every
/// open so a closed port can be reopened.
pub type SerialFactory =
    Box<dyn FnMut(&ConnSpec, &SerialComm) -> Result<Box<dyn SerialTransport>> + Send>;

/// Factory producing real OS serial ports.
pub fn system_serial_factory() -> SerialFactory {
    Box::new(|conn, comm| match conn {
        ConnSpec::Path(path) => Ok(Box::new(SystemSerial::open(path, comm)?) as Box<_>),
        other => Err(Error::Arg(format!(
            "serial driver needs a port path, got {other:?}"
        ))),
    })
}

/// Source of firmware and FPGA bitstream blobs, read in chunks until EOF.
pub trait ResourceReader: Send {
    fn open(&mut self, name: &str) -> Result<Box<dyn Read + Send>>;
}

/// Looks up firmware files in a list of directories.
pub struct FsResources {
    dirs: Vec<PathBuf>,
}

impl FsResources {
    pub fn new(dirs: Vec<PathBuf>) -> Self {
        Self { dirs }
    }
}

impl ResourceReader for FsResources {
    fn open(&mut self, name: &str) -> Result<Box<dyn Read + Send>> {
        for dir in &self.dirs {
            let path = dir.join(name);
            if path.is_file() {
                return Ok(Box::new(File::open(path)?));
            }
        }
        Err(Error::Arg(format!("firmware resource '{name}' not found")))
    }
}
