//! Datafeed packet model
//!
//! Packets flow from an acquisition engine to session subscribers. Every
//! acquisition emits exactly one [`Packet::Header`] first and exactly one
//! [`Packet::End`] last; `Logic`/`Analog` payloads are always preceded by
//! the matching `Meta*` packet describing them.

use std::fmt;
use std::time::SystemTime;

use crate::types::{Mq, MqFlags, Unit};
use crate::{Error, Result};

/// Version of the datafeed protocol carried in the header packet.
pub const FEED_VERSION: u32 = 1;

/// A datafeed packet.
///
/// Subscribers receive packets by reference; any subscriber that needs to
/// retain payload data past the callback must clone it.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// First packet of every acquisition.
    Header(Header),
    /// Describes the `Logic` packets that follow.
    MetaLogic(MetaLogic),
    /// Describes the `Analog` packets that follow.
    MetaAnalog(MetaAnalog),
    Logic(Logic),
    Analog(Analog),
    /// Marks the trigger sample boundary in the surrounding `Logic` stream.
    Trigger,
    FrameBegin,
    FrameEnd,
    /// Acquisition terminator. No packet follows.
    End,
}

impl Packet {
    /// Short name of the packet variant, for logging.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Packet::Header(_) => "header",
            Packet::MetaLogic(_) => "meta-logic",
            Packet::MetaAnalog(_) => "meta-analog",
            Packet::Logic(_) => "logic",
            Packet::Analog(_) => "analog",
            Packet::Trigger => "trigger",
            Packet::FrameBegin => "frame-begin",
            Packet::FrameEnd => "frame-end",
            Packet::End => "end",
        }
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.kind_name())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    pub feed_version: u32,
    pub start_time: SystemTime,
}

impl Header {
    pub fn new() -> Self {
        Self {
            feed_version: FEED_VERSION,
            start_time: SystemTime::now(),
        }
    }
}

impl Default for Header {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetaLogic {
    pub num_probes: usize,
    /// Samplerate in Hz, strictly positive.
    pub samplerate: u64,
}

impl MetaLogic {
    pub fn new(num_probes: usize, samplerate: u64) -> Result<Self> {
        if samplerate == 0 {
            return Err(Error::Samplerate(0));
        }
        Ok(Self {
            num_probes,
            samplerate,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetaAnalog {
    pub num_probes: usize,
}

/// Packed parallel logic samples.
///
/// Bit `i` of each sample corresponds to the probe with index `i`. The
/// payload length is always a whole number of samples.
#[derive(Clone, PartialEq, Eq)]
pub struct Logic {
    unitsize: usize,
    data: Vec<u8>,
}

impl Logic {
    /// Create a logic payload. `unitsize` must be 1, 2, 4 or 8 bytes and
    /// must evenly divide the payload length.
    pub fn new(unitsize: usize, data: Vec<u8>) -> Result<Self> {
        if !matches!(unitsize, 1 | 2 | 4 | 8) {
            return Err(Error::Arg(format!("invalid logic unitsize {unitsize}")));
        }
        if data.len() % unitsize != 0 {
            return Err(Error::Arg(format!(
                "logic payload length {} not a multiple of unitsize {}",
                data.len(),
                unitsize
            )));
        }
        Ok(Self { unitsize, data })
    }

    pub fn unitsize(&self) -> usize {
        self.unitsize
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn num_samples(&self) -> usize {
        self.data.len() / self.unitsize
    }

    /// The `index`-th sample, widened to u64 from its little-endian bytes.
    pub fn sample(&self, index: usize) -> Option<u64> {
        let start = index.checked_mul(self.unitsize)?;
        let bytes = self.data.get(start..start + self.unitsize)?;
        let mut value = 0u64;
        for (i, b) in bytes.iter().enumerate() {
            value |= (*b as u64) << (i * 8);
        }
        Some(value)
    }
}

impl fmt::Debug for Logic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Logic[unitsize={}, samples={}]",
            self.unitsize,
            self.num_samples()
        )
    }
}

/// Analog readings with their measured quantity, unit, and modifiers.
#[derive(Debug, Clone, PartialEq)]
pub struct Analog {
    pub mq: Mq,
    pub unit: Unit,
    pub mqflags: MqFlags,
    pub data: Vec<f32>,
}

impl Analog {
    pub fn new(mq: Mq, unit: Unit, mqflags: MqFlags, data: Vec<f32>) -> Self {
        Self {
            mq,
            unit,
            mqflags,
            data,
        }
    }
}
