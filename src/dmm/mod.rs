//! Multimeter packet-parser framework
//!
//! DMM protocols are fixed-size frames arriving over a serial byte stream
//! with no framing bytes. A [`PacketParser`] validates and decodes one
//! candidate frame; the [`FrameScanner`] slides over the incoming stream,
//! discarding bytes until a valid frame lines up. Parsers live in a
//! process-wide immutable profile table.

pub mod rs9lcd;

use tracing::debug;

use crate::types::{Mq, MqFlags, Unit};
use crate::Result;

/// Buffered stream window the scanner keeps while hunting for frames.
pub const DMM_BUFSIZE: usize = 256;

/// One decoded multimeter reading.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub value: f32,
    pub mq: Mq,
    pub unit: Unit,
    pub mqflags: MqFlags,
}

/// Validates and decodes fixed-size multimeter frames.
pub trait PacketParser: Send + Sync {
    /// Frame size in bytes.
    fn packet_size(&self) -> usize;

    /// Cheap validity check on a candidate frame of exactly
    /// [`PacketParser::packet_size`] bytes. Invalid frames are discarded
    /// silently by callers; only debug logging happens here.
    fn valid(&self, frame: &[u8]) -> bool;

    /// Decode a frame that passed [`PacketParser::valid`].
    fn parse(&self, frame: &[u8]) -> Result<Reading>;
}

/// A supported multimeter: identity plus how to talk to it.
pub struct DmmProfile {
    /// Registry name of the driver instantiated for this profile.
    pub driver_name: &'static str,
    pub vendor: &'static str,
    pub device: &'static str,
    /// Serial parameters as `<baudrate>/<databits><parity><stopbits>`.
    pub serialcomm: &'static str,
    pub parser: &'static (dyn PacketParser + 'static),
}

static PROFILES: &[DmmProfile] = &[DmmProfile {
    driver_name: "radioshack-22-812",
    vendor: "RadioShack",
    device: "22-812",
    serialcomm: "4800/8n1",
    parser: &rs9lcd::Rs9Lcd,
}];

/// The process-wide table of supported multimeters.
pub fn profiles() -> &'static [DmmProfile] {
    PROFILES
}

pub fn profile(vendor: &str, device: &str) -> Option<&'static DmmProfile> {
    PROFILES
        .iter()
        .find(|p| p.vendor == vendor && p.device == device)
}

/// Sliding-window scanner over a DMM byte stream.
///
/// Since these meters never identify themselves, the only way to find
/// frame boundaries is to try every alignment: a rejected candidate
/// advances the window by one byte and scanning continues.
pub struct FrameScanner {
    buf: Vec<u8>,
    packet_size: usize,
}

impl FrameScanner {
    pub fn new(packet_size: usize) -> Self {
        Self {
            buf: Vec::with_capacity(DMM_BUFSIZE),
            packet_size,
        }
    }

    /// Append freshly read stream bytes. The window is bounded: if it
    /// overflows, the oldest bytes are dropped.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
        if self.buf.len() > DMM_BUFSIZE {
            let excess = self.buf.len() - DMM_BUFSIZE;
            self.buf.drain(..excess);
        }
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Extract the next valid frame, discarding misaligned bytes.
    pub fn next_frame(&mut self, parser: &dyn PacketParser) -> Option<Vec<u8>> {
        while self.buf.len() >= self.packet_size {
            if parser.valid(&self.buf[..self.packet_size]) {
                return Some(self.buf.drain(..self.packet_size).collect());
            }
            debug!("discarding byte 0x{:02x} while resynchronizing", self.buf[0]);
            self.buf.drain(..1);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Accepts frames starting with 0xaa.
    struct MarkerParser;

    impl PacketParser for MarkerParser {
        fn packet_size(&self) -> usize {
            4
        }

        fn valid(&self, frame: &[u8]) -> bool {
            frame[0] == 0xaa
        }

        fn parse(&self, _frame: &[u8]) -> Result<Reading> {
            Ok(Reading {
                value: 0.0,
                mq: Mq::Voltage,
                unit: Unit::Volt,
                mqflags: MqFlags::empty(),
            })
        }
    }

    #[test]
    fn test_scanner_finds_aligned_frame() {
        let mut scanner = FrameScanner::new(4);
        scanner.push(&[0xaa, 1, 2, 3]);
        let frame = scanner.next_frame(&MarkerParser).unwrap();
        assert_eq!(frame, vec![0xaa, 1, 2, 3]);
        assert_eq!(scanner.buffered(), 0);
    }

    #[test]
    fn test_scanner_resynchronizes() {
        let mut scanner = FrameScanner::new(4);
        scanner.push(&[0x00, 0x01, 0xaa, 5, 6, 7]);
        let frame = scanner.next_frame(&MarkerParser).unwrap();
        assert_eq!(frame, vec![0xaa, 5, 6, 7]);
    }

    #[test]
    fn test_scanner_waits_for_full_frame() {
        let mut scanner = FrameScanner::new(4);
        scanner.push(&[0xaa, 1]);
        assert!(scanner.next_frame(&MarkerParser).is_none());
        scanner.push(&[2, 3]);
        assert!(scanner.next_frame(&MarkerParser).is_some());
    }

    #[test]
    fn test_scanner_window_is_bounded() {
        let mut scanner = FrameScanner::new(4);
        scanner.push(&vec![0x55; DMM_BUFSIZE + 100]);
        assert_eq!(scanner.buffered(), DMM_BUFSIZE);
    }

    #[test]
    fn test_profile_table_lookup() {
        assert!(profile("RadioShack", "22-812").is_some());
        assert!(profile("Acme", "DMM-9000").is_none());
        assert_eq!(profiles().len(), 1);
        assert_eq!(profiles()[0].parser.packet_size(), rs9lcd::PACKET_SIZE);
    }
}
