//! SUMP/OLS wire protocol
//!
//! Short commands are a single opcode byte; long commands carry four data
//! bytes. The device is big-endian on trigger parameters but reads the
//! divider word byte-reversed and the capture-size word half-word-swapped,
//! so every multi-byte parameter goes through a named byte-order helper
//! rather than memory punning.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::device::{Device, DeviceId};
use crate::packet::{Logic, Packet};
use crate::session::{Datafeed, EventSource, SourceAction, SourceEvent};
use crate::transport::serial::SerialTransport;
use crate::types::{khz, mhz};
use crate::{Error, Result};

pub const CMD_RESET: u8 = 0x00;
pub const CMD_RUN: u8 = 0x01;
pub const CMD_ID: u8 = 0x02;
pub const CMD_METADATA: u8 = 0x04;
pub const CMD_SET_DIVIDER: u8 = 0x80;
pub const CMD_CAPTURE_SIZE: u8 = 0x81;
pub const CMD_SET_FLAGS: u8 = 0x82;
pub const CMD_SET_TRIGGER_MASK: [u8; 4] = [0xc0, 0xc4, 0xc8, 0xcc];
pub const CMD_SET_TRIGGER_VALUE: [u8; 4] = [0xc1, 0xc5, 0xc9, 0xcd];
pub const CMD_SET_TRIGGER_CONFIG: [u8; 4] = [0xc2, 0xc6, 0xca, 0xce];

pub const FLAG_DEMUX: u16 = 0x0001;
pub const FLAG_FILTER: u16 = 0x0002;
/// Channel-group disable bits sit at positions 2..=5; 1 means disabled.
pub const FLAG_RLE: u16 = 0x0100;

/// The device's fixed input clock.
pub const CLOCK_RATE: u64 = mhz(100);
pub const MIN_NUM_SAMPLES: u64 = 4;
pub const NUM_TRIGGER_STAGES: usize = 4;

/// Default samplerate range, overridable by device metadata.
pub const SAMPLERATE_LOW: u64 = 10;
pub const SAMPLERATE_HIGH: u64 = mhz(200);
pub const SAMPLERATE_STEP: u64 = 1;

/// Silence longer than one byte-time means the device finished sending.
/// Doubled to 30 ms to be safe.
pub const RECEIVE_TIMEOUT: Duration = Duration::from_millis(30);

/// How long to wait for the ID and metadata responses during discovery.
pub const PROBE_TIMEOUT: Duration = Duration::from_millis(10);

/// Reverse the two 16-bit halves of a word.
pub fn reverse16(value: u32) -> u32 {
    let mut out = (value & 0xff) << 8;
    out |= (value & 0xff00) >> 8;
    out |= (value & 0xff0000) << 8;
    out |= (value & 0xff000000) >> 8;
    out
}

/// Reverse all four bytes of a word.
pub fn reverse32(value: u32) -> u32 {
    value.swap_bytes()
}

pub fn send_short_command(serial: &mut dyn SerialTransport, command: u8) -> Result<()> {
    debug!("ols: sending cmd 0x{command:02x}");
    serial.write_all(&[command])
}

/// Long command: opcode plus four data bytes, most significant first.
pub fn send_long_command(serial: &mut dyn SerialTransport, command: u8, data: u32) -> Result<()> {
    debug!("ols: sending cmd 0x{command:02x} data 0x{data:08x}");
    let bytes = data.to_be_bytes();
    serial.write_all(&[command, bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Fields reported by the metadata command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceMetadata {
    pub name: String,
    pub version: String,
    pub probe_count: usize,
    /// Sample memory in bytes; 0 if not reported.
    pub max_samples: u32,
    /// Maximum samplerate in Hz; 0 if not reported.
    pub max_samplerate: u64,
    pub protocol_version: u32,
}

/// Parse a metadata response: TLV keys until a 0x00 key. The key byte
/// encodes `type = key >> 5` and `token = key & 0x1f`.
pub fn parse_metadata(buf: &[u8]) -> DeviceMetadata {
    let mut md = DeviceMetadata::default();
    let mut version_parts: Vec<String> = Vec::new();
    let mut i = 0;

    while i < buf.len() {
        let key = buf[i];
        i += 1;
        if key == 0x00 {
            break;
        }
        let typ = key >> 5;
        let token = key & 0x1f;
        match typ {
            0 => {
                // NUL-terminated string.
                let start = i;
                while i < buf.len() && buf[i] != 0 {
                    i += 1;
                }
                let s = String::from_utf8_lossy(&buf[start..i]).into_owned();
                if i < buf.len() {
                    i += 1; // consume the NUL
                }
                debug!("ols: got metadata key 0x{key:02x} value '{s}'");
                match token {
                    0x01 => md.name.push_str(&s),
                    0x02 => version_parts.push(format!("FPGA version {s}")),
                    0x03 => version_parts.push(format!("Ancillary version {s}")),
                    _ => info!("ols: unknown string token 0x{token:02x}: '{s}'"),
                }
            }
            1 => {
                // 32-bit big-endian unsigned.
                if i + 4 > buf.len() {
                    break;
                }
                let value = u32::from_be_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
                i += 4;
                debug!("ols: got metadata key 0x{key:02x} value 0x{value:08x}");
                match token {
                    0x00 => md.probe_count = value as usize,
                    0x01 => md.max_samples = value,
                    0x02 => {} // amount of dynamic memory, unused
                    0x03 => md.max_samplerate = value as u64,
                    0x04 => md.protocol_version = value,
                    _ => info!("ols: unknown int token 0x{token:02x}: 0x{value:08x}"),
                }
            }
            2 => {
                // 8-bit unsigned.
                if i >= buf.len() {
                    break;
                }
                let value = buf[i];
                i += 1;
                debug!("ols: got metadata key 0x{key:02x} value 0x{value:02x}");
                match token {
                    0x00 => md.probe_count = value as usize,
                    0x01 => md.protocol_version = value as u32,
                    _ => info!("ols: unknown byte token 0x{token:02x}: 0x{value:02x}"),
                }
            }
            _ => {
                // Unknown type: the payload length is unknowable, so treat
                // the next byte as a key and keep going.
                info!("ols: unknown metadata type in key 0x{key:02x}");
            }
        }
    }

    md.version = version_parts.join(", ");
    md
}

/// Per-instance acquisition state.
pub struct OlsContext {
    pub max_samples: u32,
    pub max_samplerate: u64,
    pub protocol_version: u32,

    pub cur_samplerate: u64,
    pub cur_samplerate_divider: u32,
    pub limit_samples: u64,
    pub capture_ratio: u64,
    pub flag_reg: u16,

    pub probe_mask: u32,
    pub trigger_mask: [u32; NUM_TRIGGER_STAGES],
    pub trigger_value: [u32; NUM_TRIGGER_STAGES],
    pub num_stages: usize,
    /// Trigger position in 32-bit samples from the start of the capture
    /// buffer, or -1 when no trigger is armed.
    pub trigger_at: i64,

    // Receive state
    pub acq_running: bool,
    pub started: bool,
    pub sample: [u8; 4],
    pub num_bytes: usize,
    pub rle_count: u64,
    pub num_samples: u64,
    pub raw_sample_buf: Vec<u8>,
}

impl OlsContext {
    pub fn new() -> Self {
        Self {
            max_samples: 0,
            max_samplerate: 0,
            protocol_version: 0,
            cur_samplerate: khz(200),
            cur_samplerate_divider: 0,
            limit_samples: 0,
            capture_ratio: 0,
            flag_reg: 0,
            probe_mask: 0xffff_ffff,
            trigger_mask: [0; NUM_TRIGGER_STAGES],
            trigger_value: [0; NUM_TRIGGER_STAGES],
            num_stages: 0,
            trigger_at: -1,
            acq_running: false,
            started: false,
            sample: [0; 4],
            num_bytes: 0,
            rle_count: 0,
            num_samples: 0,
            raw_sample_buf: Vec::new(),
        }
    }

    pub fn apply_metadata(&mut self, md: &DeviceMetadata) {
        self.max_samples = md.max_samples;
        self.max_samplerate = md.max_samplerate;
        self.protocol_version = md.protocol_version;
    }

    /// Program the samplerate divider for `rate`.
    ///
    /// Rates above the clock engage DEMUX, which interleaves two channel
    /// groups to double the effective rate. If the divider cannot hit the
    /// requested rate exactly, the nearest achievable rate is kept and
    /// logged.
    pub fn set_samplerate(&mut self, rate: u64) -> Result<()> {
        if rate == 0 {
            return Err(Error::Samplerate(rate));
        }
        if self.max_samplerate > 0 {
            if rate > self.max_samplerate {
                return Err(Error::Samplerate(rate));
            }
        } else if !(SAMPLERATE_LOW..=SAMPLERATE_HIGH).contains(&rate) {
            return Err(Error::Samplerate(rate));
        }

        if rate > CLOCK_RATE {
            self.flag_reg |= FLAG_DEMUX;
            self.cur_samplerate_divider = ((2 * CLOCK_RATE).div_ceil(rate) - 1) as u32;
        } else {
            self.flag_reg &= !FLAG_DEMUX;
            self.cur_samplerate_divider = (CLOCK_RATE / rate - 1) as u32;
        }

        self.cur_samplerate = CLOCK_RATE / (self.cur_samplerate_divider as u64 + 1);
        if self.flag_reg & FLAG_DEMUX != 0 {
            self.cur_samplerate *= 2;
        }
        if self.cur_samplerate != rate {
            info!(
                "ols: cannot match samplerate {rate}, using {}",
                self.cur_samplerate
            );
        }

        Ok(())
    }

    /// Build the probe mask and trigger stage words from the device's
    /// probe configuration.
    pub fn configure_probes(&mut self, device: &Device) -> Result<()> {
        self.probe_mask = 0;
        self.trigger_mask = [0; NUM_TRIGGER_STAGES];
        self.trigger_value = [0; NUM_TRIGGER_STAGES];
        self.num_stages = 0;

        for probe in &device.probes {
            if !probe.enabled {
                continue;
            }
            if probe.index >= 32 {
                return Err(Error::Arg(format!(
                    "probe index {} beyond the 32 inputs",
                    probe.index
                )));
            }
            let probe_bit = 1u32 << probe.index;
            self.probe_mask |= probe_bit;

            let Some(expr) = &probe.trigger else {
                continue;
            };
            for (stage, tc) in expr.chars().enumerate() {
                if stage >= NUM_TRIGGER_STAGES {
                    // Only parallel mode with up to 4 stages.
                    return Err(Error::Arg(format!(
                        "trigger expression '{expr}' exceeds {NUM_TRIGGER_STAGES} stages"
                    )));
                }
                match tc {
                    '0' => self.trigger_mask[stage] |= probe_bit,
                    '1' => {
                        self.trigger_mask[stage] |= probe_bit;
                        self.trigger_value[stage] |= probe_bit;
                    }
                    other => {
                        return Err(Error::Arg(format!(
                            "trigger character '{other}' unsupported by the parallel trigger"
                        )));
                    }
                }
            }
            self.num_stages = self.num_stages.max(expr.chars().count());
        }

        Ok(())
    }

    /// Number of enabled channel groups per the flag register.
    pub fn num_channels(&self) -> usize {
        let mut n = 0;
        let mut bit = 0x20;
        while bit > 0x02 {
            if self.flag_reg & bit == 0 {
                n += 1;
            }
            bit /= 2;
        }
        n
    }

    /// Feed one received byte into the sample accumulator.
    pub fn process_byte(&mut self, byte: u8) {
        // Ignore it if we've read enough.
        if self.num_samples >= self.limit_samples {
            return;
        }

        let num_channels = self.num_channels();
        self.sample[self.num_bytes] = byte;
        self.num_bytes += 1;
        if self.num_bytes != num_channels {
            return;
        }

        // Got a full sample.
        if self.flag_reg & FLAG_RLE != 0 {
            // In RLE mode the high bit of the most significant byte marks
            // a count word rather than a sample.
            if self.sample[self.num_bytes - 1] & 0x80 != 0 {
                self.sample[self.num_bytes - 1] &= 0x7f;
                // The count is reconstructed from the sample bytes in wire
                // order, least significant byte first.
                self.rle_count = u32::from_le_bytes(self.sample) as u64;
                debug!("ols: RLE count = {}", self.rle_count);
                self.sample = [0; 4];
                self.num_bytes = 0;
                return;
            }
        }

        self.num_samples += self.rle_count + 1;
        if self.num_samples > self.limit_samples {
            // Save us from overrunning the buffer.
            self.rle_count -= self.num_samples - self.limit_samples;
            self.num_samples = self.limit_samples;
        }

        if num_channels < 4 {
            // Disabled channel groups speed up the transfer; expand them
            // back to zero bytes so the feed always carries full 32-bit
            // samples.
            let mut expanded = [0u8; 4];
            let mut j = 0;
            for (i, slot) in expanded.iter_mut().enumerate() {
                if (self.flag_reg >> 2) & (1 << i) == 0 {
                    *slot = self.sample[j];
                    j += 1;
                }
            }
            self.sample = expanded;
        }

        // The device sends its buffer youngest-first; store backwards so
        // the feed sees samples in capture order.
        let offset = ((self.limit_samples - self.num_samples) * 4) as usize;
        for i in 0..=self.rle_count as usize {
            self.raw_sample_buf[offset + i * 4..offset + i * 4 + 4].copy_from_slice(&self.sample);
        }

        self.sample = [0; 4];
        self.num_bytes = 0;
        self.rle_count = 0;
    }

    /// Build the properly-ordered logic packets once the device has gone
    /// quiet: pre-trigger slice, trigger marker, post-trigger slice, or a
    /// single slice when no trigger was armed.
    pub fn capture_packets(&self) -> Result<Vec<Packet>> {
        let data_start = ((self.limit_samples - self.num_samples) * 4) as usize;
        let data_end = data_start + (self.num_samples * 4) as usize;
        let mut packets = Vec::new();

        if self.trigger_at >= 0 {
            let trigger_bytes =
                ((self.trigger_at as u64 * 4).min(self.num_samples * 4)) as usize;
            if trigger_bytes > 0 {
                packets.push(Packet::Logic(Logic::new(
                    4,
                    self.raw_sample_buf[data_start..data_start + trigger_bytes].to_vec(),
                )?));
            }
            packets.push(Packet::Trigger);
            packets.push(Packet::Logic(Logic::new(
                4,
                self.raw_sample_buf[data_start + trigger_bytes..data_end].to_vec(),
            )?));
        } else {
            packets.push(Packet::Logic(Logic::new(
                4,
                self.raw_sample_buf[data_start..data_end].to_vec(),
            )?));
        }

        Ok(packets)
    }
}

impl Default for OlsContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Event source registered for a running acquisition.
///
/// Registered with an infinite timeout; once the first byte arrives it
/// rearms itself with [`RECEIVE_TIMEOUT`] so that silence marks the end of
/// the capture.
pub struct OlsAcquisition {
    pub device: DeviceId,
    pub devc: Arc<Mutex<OlsContext>>,
    pub serial: Arc<Mutex<Box<dyn SerialTransport>>>,
}

impl EventSource for OlsAcquisition {
    fn ready(&mut self) -> Result<bool> {
        Ok(self.serial.lock().unwrap().bytes_available()? > 0)
    }

    fn dispatch(&mut self, event: SourceEvent, feed: &mut Datafeed) -> Result<SourceAction> {
        match event {
            SourceEvent::Ready => {
                let mut devc = self.devc.lock().unwrap();
                let mut action = SourceAction::Continue;
                if !devc.started {
                    // First byte: the device sends without pause until
                    // done, so from here on silence means completion.
                    devc.started = true;
                    devc.raw_sample_buf = vec![0u8; (devc.limit_samples * 4) as usize];
                    action = SourceAction::Reschedule(Some(RECEIVE_TIMEOUT));
                    debug!("ols: capture started, watching for trailing silence");
                }

                let mut byte = [0u8; 1];
                let read = self.serial.lock().unwrap().read(&mut byte);
                match read {
                    Ok(0) => Ok(action),
                    Ok(_) => {
                        devc.process_byte(byte[0]);
                        Ok(action)
                    }
                    Err(e) => {
                        warn!("ols: read failed, aborting acquisition: {e}");
                        devc.acq_running = false;
                        drop(devc);
                        feed.send(self.device, &Packet::End);
                        Ok(SourceAction::Remove)
                    }
                }
            }
            SourceEvent::Timeout => {
                // The device went quiet: capture complete.
                let mut devc = self.devc.lock().unwrap();
                let packets = devc.capture_packets();
                devc.acq_running = false;
                drop(devc);

                match packets {
                    Ok(packets) => {
                        for packet in &packets {
                            feed.send(self.device, packet);
                        }
                    }
                    Err(e) => warn!("ols: failed to assemble capture: {e}"),
                }
                feed.send(self.device, &Packet::End);

                let _ = self.serial.lock().unwrap().flush_input();
                Ok(SourceAction::Remove)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reverse_helpers() {
        assert_eq!(reverse32(0x12345678), 0x78563412);
        assert_eq!(reverse16(0x12345678), 0x34127856);
        assert_eq!(reverse32(0x00000001), 0x01000000);
    }

    #[test]
    fn test_parse_metadata_string_and_int() {
        // String token 1 "DEV", then key 0x21 (type 1, token 1) with value
        // 0x20, then the terminator.
        let buf = [
            0x01, b'D', b'E', b'V', 0x00, 0x21, 0x00, 0x00, 0x00, 0x20, 0x00,
        ];
        let md = parse_metadata(&buf);
        assert!(md.name.contains("DEV"));
        assert_eq!(md.max_samples, 32);
    }

    #[test]
    fn test_parse_metadata_versions_and_counts() {
        let mut buf = vec![0x02];
        buf.extend_from_slice(b"3.0\0");
        buf.extend_from_slice(&[0x40, 16]); // type 2 token 0: 16 probes
        buf.extend_from_slice(&[0x23, 0x05, 0xf5, 0xe1, 0x00]); // max rate 100 MHz
        buf.push(0x00);

        let md = parse_metadata(&buf);
        assert_eq!(md.version, "FPGA version 3.0");
        assert_eq!(md.probe_count, 16);
        assert_eq!(md.max_samplerate, mhz(100));
    }

    #[test]
    fn test_parse_metadata_skips_unknown_tokens() {
        let buf = [
            0x1f, b'?', 0x00, // unknown string token 0x1f
            0x40, 8,    // probe count 8
            0x00,
        ];
        let md = parse_metadata(&buf);
        assert_eq!(md.probe_count, 8);
    }

    #[test]
    fn test_samplerate_divider_round_trip() {
        let mut ctx = OlsContext::new();
        for rate in [10, 1000, khz(200), mhz(1), mhz(100)] {
            ctx.set_samplerate(rate).unwrap();
            let expected = CLOCK_RATE / (CLOCK_RATE / rate);
            assert_eq!(ctx.cur_samplerate, expected, "rate {rate}");
        }
    }

    #[test]
    fn test_samplerate_demux_doubles_clock() {
        let mut ctx = OlsContext::new();
        ctx.set_samplerate(mhz(200)).unwrap();
        assert_ne!(ctx.flag_reg & FLAG_DEMUX, 0);
        assert_eq!(ctx.cur_samplerate_divider, 0);
        assert_eq!(ctx.cur_samplerate, mhz(200));

        ctx.set_samplerate(mhz(50)).unwrap();
        assert_eq!(ctx.flag_reg & FLAG_DEMUX, 0);
        assert_eq!(ctx.cur_samplerate, mhz(50));
    }

    #[test]
    fn test_samplerate_out_of_range() {
        let mut ctx = OlsContext::new();
        assert!(ctx.set_samplerate(0).is_err());
        assert!(ctx.set_samplerate(9).is_err());
        assert!(ctx.set_samplerate(mhz(201)).is_err());

        // Metadata-reported maximum takes precedence over the default
        // range.
        ctx.max_samplerate = mhz(50);
        assert!(ctx.set_samplerate(mhz(100)).is_err());
        assert!(ctx.set_samplerate(mhz(50)).is_ok());
    }

    fn test_device(num_probes: usize) -> Device {
        use crate::device::{DeviceId, Probe, ProbeKind};

        let mut dev = Device::new(
            DeviceId {
                driver: "ols",
                index: 0,
            },
            "Sump",
            "Logic Analyzer",
            "v1.0",
        );
        for i in 0..num_probes {
            dev.probes
                .push(Probe::new(i, ProbeKind::Logic, true, &i.to_string()).unwrap());
        }
        dev
    }

    #[test]
    fn test_configure_probes_builds_stages() {
        let mut dev = test_device(8);
        dev.configure_probe(0, true, Some("1")).unwrap();
        dev.configure_probe(1, true, Some("01")).unwrap();

        let mut ctx = OlsContext::new();
        ctx.configure_probes(&dev).unwrap();

        assert_eq!(ctx.probe_mask, 0xff);
        assert_eq!(ctx.num_stages, 2);
        assert_eq!(ctx.trigger_mask[0], 0b11);
        assert_eq!(ctx.trigger_value[0], 0b01);
        assert_eq!(ctx.trigger_mask[1], 0b10);
        assert_eq!(ctx.trigger_value[1], 0b10);
    }

    #[test]
    fn test_configure_probes_rejects_five_stages() {
        let mut dev = test_device(8);
        dev.configure_probe(0, true, Some("10101")).unwrap();

        let mut ctx = OlsContext::new();
        assert!(ctx.configure_probes(&dev).is_err());
    }

    #[test]
    fn test_num_channels_from_flag_reg() {
        let mut ctx = OlsContext::new();
        ctx.flag_reg = 0;
        assert_eq!(ctx.num_channels(), 4);
        ctx.flag_reg = 0x38; // groups 1..3 disabled
        assert_eq!(ctx.num_channels(), 1);
        ctx.flag_reg = 0x3c;
        assert_eq!(ctx.num_channels(), 0);
    }

    fn capture_ctx(limit: u64, flag_reg: u16) -> OlsContext {
        let mut ctx = OlsContext::new();
        ctx.limit_samples = limit;
        ctx.flag_reg = flag_reg;
        ctx.raw_sample_buf = vec![0u8; (limit * 4) as usize];
        ctx.started = true;
        ctx
    }

    #[test]
    fn test_receive_fills_buffer_from_the_end() {
        // One channel group: one byte per sample.
        let mut ctx = capture_ctx(8, 0x38);
        for byte in [0xa0, 0xa1, 0xa2, 0xa3, 0xa4, 0xa5, 0xa6, 0xa7] {
            ctx.process_byte(byte);
        }
        assert_eq!(ctx.num_samples, 8);

        let packets = ctx.capture_packets().unwrap();
        assert_eq!(packets.len(), 1);
        let Packet::Logic(logic) = &packets[0] else {
            panic!("expected logic packet");
        };
        assert_eq!(logic.unitsize(), 4);
        assert_eq!(logic.data().len(), 32);
        // Youngest-first on the wire, so the last byte received is the
        // first sample out.
        assert_eq!(&logic.data()[..4], &[0xa7, 0, 0, 0]);
        assert_eq!(&logic.data()[28..], &[0xa0, 0, 0, 0]);
    }

    #[test]
    fn test_receive_discards_beyond_limit() {
        let mut ctx = capture_ctx(2, 0x38);
        for byte in [0x11, 0x22, 0x33, 0x44] {
            ctx.process_byte(byte);
        }
        assert_eq!(ctx.num_samples, 2);
        let packets = ctx.capture_packets().unwrap();
        let Packet::Logic(logic) = &packets[0] else {
            panic!("expected logic packet");
        };
        assert_eq!(logic.data(), &[0x22, 0, 0, 0, 0x11, 0, 0, 0]);
    }

    #[test]
    fn test_rle_replication() {
        let mut ctx = capture_ctx(8, 0x38);
        ctx.flag_reg |= FLAG_RLE;

        // Count word 3 (high bit set), then a sample: four copies total.
        ctx.process_byte(0x83);
        assert_eq!(ctx.rle_count, 3);
        ctx.process_byte(0x42);
        assert_eq!(ctx.num_samples, 4);

        let offset = ((8 - 4) * 4) as usize;
        for i in 0..4 {
            assert_eq!(
                &ctx.raw_sample_buf[offset + i * 4..offset + i * 4 + 4],
                &[0x42, 0, 0, 0]
            );
        }
    }

    #[test]
    fn test_rle_replication_clamped_to_limit() {
        let mut ctx = capture_ctx(4, 0x38);
        ctx.flag_reg |= FLAG_RLE;

        ctx.process_byte(0x85); // count 5: would be 6 samples
        ctx.process_byte(0x42);
        assert_eq!(ctx.num_samples, 4);

        let packets = ctx.capture_packets().unwrap();
        let Packet::Logic(logic) = &packets[0] else {
            panic!("expected logic packet");
        };
        assert_eq!(logic.data().len(), 16);
        assert!(logic.data().chunks(4).all(|c| c == [0x42, 0, 0, 0]));
    }

    #[test]
    fn test_trigger_slicing() {
        let mut ctx = capture_ctx(8, 0x38);
        ctx.trigger_at = 3;
        for byte in [0xa0, 0xa1, 0xa2, 0xa3, 0xa4, 0xa5, 0xa6, 0xa7] {
            ctx.process_byte(byte);
        }

        let packets = ctx.capture_packets().unwrap();
        assert_eq!(packets.len(), 3);
        let Packet::Logic(pre) = &packets[0] else {
            panic!("expected pre-trigger logic");
        };
        assert_eq!(packets[1], Packet::Trigger);
        let Packet::Logic(post) = &packets[2] else {
            panic!("expected post-trigger logic");
        };
        assert_eq!(pre.data().len(), 12);
        assert_eq!(post.data().len(), 20);
        // Trigger sits at byte offset trigger_at * 4 of the concatenated
        // stream.
        assert_eq!(pre.data().len(), ctx.trigger_at as usize * 4);
    }

    #[test]
    fn test_group_expansion_zeroes_disabled_groups() {
        // Groups 0 and 2 enabled: two bytes per sample.
        let mut ctx = capture_ctx(1, 0x28);
        assert_eq!(ctx.num_channels(), 2);
        ctx.process_byte(0x11);
        ctx.process_byte(0x22);

        let packets = ctx.capture_packets().unwrap();
        let Packet::Logic(logic) = &packets[0] else {
            panic!("expected logic packet");
        };
        assert_eq!(logic.data(), &[0x11, 0, 0x22, 0]);
    }
}
