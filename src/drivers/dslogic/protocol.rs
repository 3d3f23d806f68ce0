//! DSLogic USB protocol: FPGA configuration frame, trigger block, and the
//! bulk streaming receive path
//!
//! The FPGA is configured with a fixed-layout little-endian frame bracketed
//! by 32-bit sync words, each parameter block preceded by a 16-bit section
//! header. The frame length is announced through a vendor request in
//! half-words. Sample data streams in over bulk endpoint 6 as 8-bit or
//! 16-bit samples depending on the capture width.

use std::io::Read;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use crate::device::{Device, DeviceId};
use crate::packet::{Logic, Packet};
use crate::session::{Datafeed, EventSource, SourceAction, SourceEvent};
use crate::transport::usb::UsbTransport;
use crate::types::{khz, mhz};
use crate::{Error, Result};

// Vendor requests on the endpoint-0 control pipe.
pub const CMD_GET_FW_VERSION: u8 = 0xb0;
pub const CMD_START: u8 = 0xb2;
pub const CMD_CONFIG: u8 = 0xb3;
pub const CMD_SETTING: u8 = 0xb4;
pub const CMD_WR_REG: u8 = 0xb8;

/// Register address of the trigger voltage threshold DAC.
pub const ADDR_VTH: u8 = 0x78;

/// Bulk endpoint for firmware/configuration download.
pub const EP_CONFIG_OUT: u8 = 0x02;
/// Bulk endpoint for sample streaming.
pub const EP_STREAM_IN: u8 = 0x86;

// Flags in the 3-byte start-command payload.
pub const START_FLAGS_STOP: u8 = 1 << 7;
pub const START_FLAGS_SAMPLE_WIDE: u8 = 1 << 5;
pub const START_FLAGS_MODE_LA: u8 = 1 << 4;

// Mode word bits.
pub const MODE_TRIG_EN: u16 = 1 << 0;
pub const MODE_CLK_TYPE: u16 = 1 << 1;
pub const MODE_CLK_EDGE: u16 = 1 << 2;
pub const MODE_RLE_MODE: u16 = 1 << 3;
pub const MODE_HALF_MODE: u16 = 1 << 5;
pub const MODE_QUAR_MODE: u16 = 1 << 6;
pub const MODE_INT_TEST: u16 = 1 << 9;
pub const MODE_EXT_TEST: u16 = 1 << 10;
pub const MODE_LPB_TEST: u16 = 1 << 11;
pub const MODE_STREAM_MODE: u16 = 1 << 12;

// Configuration frame framing words and section headers.
pub const CFG_START: u32 = 0xf5a5_f5a5;
pub const CFG_END: u32 = 0xfa5a_fa5a;
pub const CFG_MODE: u16 = 0x0001;
pub const CFG_DIVIDER: u16 = 0x0002;
pub const CFG_COUNT: u16 = 0x0003;
pub const CFG_TRIG_POS: u16 = 0x0005;
pub const CFG_TRIG_GLB: u16 = 0x0007;
pub const CFG_CH_EN: u16 = 0x0008;
pub const CFG_TRIG: u16 = 0x40a0;

pub const MAX_LOGIC_SAMPLERATE: u64 = mhz(100);
/// Hardware sample memory depth, in samples.
pub const MAX_LOGIC_DEPTH: u64 = 16 * 1024 * 1024;
pub const NUM_TRIGGER_STAGES: usize = 16;
/// Stages available to the software trigger matcher.
pub const NUM_SOFT_TRIGGER_STAGES: usize = 4;
/// Sentinel for "trigger already fired / not armed".
pub const TRIGGER_FIRED: i32 = -1;

/// Upload the bitstream in one big chunk; chunked uploads have issues.
pub const FW_BUFSIZE: usize = 1024 * 1024;
/// Time the FX2 needs before it accepts the FPGA bitstream.
pub const FPGA_UPLOAD_DELAY: Duration = Duration::from_millis(10);
/// The device renumerates after a firmware upload and must not be opened
/// before this has passed.
pub const MAX_RENUM_DELAY: Duration = Duration::from_millis(3000);
pub const NUM_SIMUL_TRANSFERS: usize = 32;
pub const MAX_EMPTY_TRANSFERS: usize = NUM_SIMUL_TRANSFERS * 2;

pub const SAMPLERATES: &[u64] = &[
    khz(10),
    khz(20),
    khz(50),
    khz(100),
    khz(200),
    khz(500),
    mhz(1),
    mhz(2),
    mhz(5),
    mhz(10),
    mhz(20),
    mhz(25),
    mhz(50),
    mhz(100),
    mhz(200),
    mhz(400),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpMode {
    Normal,
    InternalTest,
    ExternalTest,
    LoopbackTest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockEdge {
    Rising,
    Falling,
}

/// Input logic family the trigger threshold is tuned for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoltageThreshold {
    /// 1.8 V to 3.3 V logic.
    V18_33,
    /// 5 V logic.
    V5,
}

impl VoltageThreshold {
    pub fn volts(self) -> f64 {
        match self {
            VoltageThreshold::V18_33 => 1.4,
            VoltageThreshold::V5 => 2.5,
        }
    }
}

/// A single probe's trigger condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMatch {
    Zero,
    One,
    Rising,
    Falling,
    Edge,
}

impl TriggerMatch {
    pub fn from_char(c: char) -> Result<TriggerMatch> {
        Ok(match c {
            '0' => TriggerMatch::Zero,
            '1' => TriggerMatch::One,
            'r' => TriggerMatch::Rising,
            'f' => TriggerMatch::Falling,
            'c' => TriggerMatch::Edge,
            other => return Err(Error::Arg(format!("invalid trigger character '{other}'"))),
        })
    }
}

fn put_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

/// The FPGA configuration frame.
///
/// Serialized little-endian with [`FpgaConfig::to_bytes`]; the layout and
/// section order are fixed and the total size is [`FpgaConfig::BYTE_LEN`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FpgaConfig {
    pub mode: u16,
    pub divider: u32,
    pub count: u32,
    pub trig_pos: u32,
    pub trig_glb: u16,
    pub ch_en: u16,
    pub trig_mask0: [u16; NUM_TRIGGER_STAGES],
    pub trig_mask1: [u16; NUM_TRIGGER_STAGES],
    pub trig_value0: [u16; NUM_TRIGGER_STAGES],
    pub trig_value1: [u16; NUM_TRIGGER_STAGES],
    pub trig_edge0: [u16; NUM_TRIGGER_STAGES],
    pub trig_edge1: [u16; NUM_TRIGGER_STAGES],
    pub trig_logic0: [u16; NUM_TRIGGER_STAGES],
    pub trig_logic1: [u16; NUM_TRIGGER_STAGES],
    pub trig_count: [u32; NUM_TRIGGER_STAGES],
}

impl FpgaConfig {
    /// Serialized frame size in bytes.
    pub const BYTE_LEN: usize = 360;

    pub fn new() -> Self {
        Self {
            mode: 0,
            divider: 0,
            count: 0,
            trig_pos: 0,
            trig_glb: 0,
            ch_en: 0,
            trig_mask0: [0; NUM_TRIGGER_STAGES],
            trig_mask1: [0; NUM_TRIGGER_STAGES],
            trig_value0: [0; NUM_TRIGGER_STAGES],
            trig_value1: [0; NUM_TRIGGER_STAGES],
            trig_edge0: [0; NUM_TRIGGER_STAGES],
            trig_edge1: [0; NUM_TRIGGER_STAGES],
            trig_logic0: [0; NUM_TRIGGER_STAGES],
            trig_logic1: [0; NUM_TRIGGER_STAGES],
            trig_count: [0; NUM_TRIGGER_STAGES],
        }
    }

    /// Frame length as sent in the `SETTING` vendor request: half-words.
    pub fn len_half_words() -> u32 {
        (Self::BYTE_LEN / 2) as u32
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::BYTE_LEN);
        put_u32(&mut buf, CFG_START);
        put_u16(&mut buf, CFG_MODE);
        put_u16(&mut buf, self.mode);
        put_u16(&mut buf, CFG_DIVIDER);
        put_u32(&mut buf, self.divider);
        put_u16(&mut buf, CFG_COUNT);
        put_u32(&mut buf, self.count);
        put_u16(&mut buf, CFG_TRIG_POS);
        put_u32(&mut buf, self.trig_pos);
        put_u16(&mut buf, CFG_TRIG_GLB);
        put_u16(&mut buf, self.trig_glb);
        put_u16(&mut buf, CFG_CH_EN);
        put_u16(&mut buf, self.ch_en);
        put_u16(&mut buf, CFG_TRIG);
        for array in [
            &self.trig_mask0,
            &self.trig_mask1,
            &self.trig_value0,
            &self.trig_value1,
            &self.trig_edge0,
            &self.trig_edge1,
            &self.trig_logic0,
            &self.trig_logic1,
        ] {
            for value in array {
                put_u16(&mut buf, *value);
            }
        }
        for value in &self.trig_count {
            put_u32(&mut buf, *value);
        }
        put_u32(&mut buf, CFG_END);
        debug_assert_eq!(buf.len(), Self::BYTE_LEN);
        buf
    }
}

impl Default for FpgaConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-instance device state.
pub struct DslContext {
    pub cur_samplerate: u64,
    pub limit_samples: u64,
    pub capture_ratio: u64,
    pub continuous: bool,
    pub external_clock: bool,
    pub clock_edge: ClockEdge,
    pub op_mode: OpMode,
    pub voltage_threshold: VoltageThreshold,
    pub sample_wide: bool,

    // Software trigger
    pub trigger_mask: [u16; NUM_SOFT_TRIGGER_STAGES],
    pub trigger_value: [u16; NUM_SOFT_TRIGGER_STAGES],
    pub num_soft_stages: usize,
    pub trigger_stage: i32,

    // Streaming accounting
    pub num_samples: u64,
    pub empty_transfer_count: usize,
    pub acq_running: bool,
    pub fw_updated: Option<Instant>,
}

impl DslContext {
    pub fn new() -> Self {
        Self {
            cur_samplerate: MAX_LOGIC_SAMPLERATE,
            limit_samples: 0,
            capture_ratio: 0,
            continuous: false,
            external_clock: false,
            clock_edge: ClockEdge::Rising,
            op_mode: OpMode::Normal,
            voltage_threshold: VoltageThreshold::V18_33,
            sample_wide: true,
            trigger_mask: [0; NUM_SOFT_TRIGGER_STAGES],
            trigger_value: [0; NUM_SOFT_TRIGGER_STAGES],
            num_soft_stages: 0,
            trigger_stage: TRIGGER_FIRED,
            num_samples: 0,
            empty_transfer_count: 0,
            acq_running: false,
            fw_updated: None,
        }
    }

    /// Build the FPGA mode word from the current settings.
    pub fn build_mode(&self) -> u16 {
        let mut mode = match self.op_mode {
            OpMode::Normal => 0,
            OpMode::InternalTest => MODE_INT_TEST,
            OpMode::ExternalTest => MODE_EXT_TEST,
            OpMode::LoopbackTest => MODE_LPB_TEST,
        };

        if self.cur_samplerate == MAX_LOGIC_SAMPLERATE * 2 {
            mode |= MODE_HALF_MODE;
        } else if self.cur_samplerate == MAX_LOGIC_SAMPLERATE * 4 {
            mode |= MODE_QUAR_MODE;
        }

        if self.continuous {
            mode |= MODE_STREAM_MODE;
        }
        if self.external_clock {
            mode |= MODE_CLK_TYPE;
            if self.clock_edge == ClockEdge::Falling {
                mode |= MODE_CLK_EDGE;
            }
        }

        // Long captures need RLE or the data comes back corrupted.
        let depth_factor = self.cur_samplerate.div_ceil(MAX_LOGIC_SAMPLERATE);
        if self.limit_samples > MAX_LOGIC_DEPTH * depth_factor && !self.continuous {
            mode |= MODE_RLE_MODE;
        }

        mode
    }

    pub fn bytes_per_ms(&self) -> u64 {
        self.cur_samplerate.min(mhz(100)) / 1000 * 2
    }

    /// Each transfer holds 10 ms of data, rounded up to a multiple of 512.
    pub fn buffer_size(&self) -> usize {
        let s = (10 * self.bytes_per_ms()) as usize;
        (s + 511) & !511
    }

    /// Enough parallel transfers to cover about 100 ms of data.
    pub fn num_transfers(&self) -> usize {
        let n = (100 * self.bytes_per_ms()) as usize / self.buffer_size();
        n.clamp(1, NUM_SIMUL_TRANSFERS)
    }

    /// Arm the software trigger from the probes' trigger expressions.
    ///
    /// The streaming matcher compares levels only; expressions with edge
    /// conditions leave the matching to the FPGA and emit no trigger
    /// marker in the stream.
    pub fn configure_soft_trigger(&mut self, device: &Device) -> Result<()> {
        self.trigger_mask = [0; NUM_SOFT_TRIGGER_STAGES];
        self.trigger_value = [0; NUM_SOFT_TRIGGER_STAGES];
        self.num_soft_stages = 0;
        self.trigger_stage = TRIGGER_FIRED;

        let mut has_edge = false;
        for probe in &device.probes {
            if !probe.enabled {
                continue;
            }
            let Some(expr) = &probe.trigger else {
                continue;
            };
            let probe_bit = 1u16 << probe.index;
            for (stage, c) in expr.chars().enumerate() {
                if stage >= NUM_SOFT_TRIGGER_STAGES {
                    return Err(Error::Arg(format!(
                        "trigger expression '{expr}' exceeds {NUM_SOFT_TRIGGER_STAGES} stages"
                    )));
                }
                match TriggerMatch::from_char(c)? {
                    TriggerMatch::Zero => self.trigger_mask[stage] |= probe_bit,
                    TriggerMatch::One => {
                        self.trigger_mask[stage] |= probe_bit;
                        self.trigger_value[stage] |= probe_bit;
                    }
                    _ => has_edge = true,
                }
            }
            self.num_soft_stages = self.num_soft_stages.max(expr.chars().count());
        }

        if has_edge {
            debug!("dslogic: edge trigger left to the FPGA matcher");
            self.num_soft_stages = 0;
            self.trigger_stage = TRIGGER_FIRED;
        } else if self.num_soft_stages > 0 {
            self.trigger_stage = 0;
        }

        Ok(())
    }

    /// Whether `sample` satisfies the current software trigger stage.
    pub fn match_sample(&self, sample: u16) -> bool {
        let stage = self.trigger_stage as usize;
        (sample & self.trigger_mask[stage]) == self.trigger_value[stage]
    }
}

impl Default for DslContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the FPGA trigger block from the probe configuration.
///
/// Stage 0 carries the active match set; the remaining stages keep their
/// "don't care" defaults (mask 0xff, logic 2) so single-stage use works
/// transparently. Arming any match also sets the trigger-enable mode bit.
pub fn configure_trigger(cfg: &mut FpgaConfig, device: &Device, ctx: &DslContext) -> Result<()> {
    cfg.ch_en = 0;
    for probe in &device.probes {
        if probe.enabled {
            cfg.ch_en |= 1 << probe.index;
        }
    }

    cfg.trig_mask0[0] = 0xffff;
    cfg.trig_mask1[0] = 0xffff;
    cfg.trig_value0[0] = 0;
    cfg.trig_value1[0] = 0;
    cfg.trig_edge0[0] = 0;
    cfg.trig_edge1[0] = 0;
    cfg.trig_logic0[0] = 0;
    cfg.trig_logic1[0] = 0;
    cfg.trig_count[0] = 0;
    cfg.trig_glb = 0;

    for i in 1..NUM_TRIGGER_STAGES {
        cfg.trig_mask0[i] = 0xff;
        cfg.trig_mask1[i] = 0xff;
        cfg.trig_value0[i] = 0;
        cfg.trig_value1[i] = 0;
        cfg.trig_edge0[i] = 0;
        cfg.trig_edge1[i] = 0;
        cfg.trig_logic0[i] = 2;
        cfg.trig_logic1[i] = 2;
        cfg.trig_count[i] = 0;
    }

    cfg.trig_pos = (ctx.capture_ratio as f64 / 100.0 * ctx.limit_samples as f64) as u32;
    debug!("dslogic: trigger position {}", cfg.trig_pos);

    let mut armed = false;
    for probe in &device.probes {
        if !probe.enabled {
            // Ignore disabled channels with a trigger.
            continue;
        }
        let Some(expr) = &probe.trigger else {
            continue;
        };
        let Some(first) = expr.chars().next() else {
            continue;
        };
        let channelbit = 1u16 << probe.index;
        armed = true;
        match TriggerMatch::from_char(first)? {
            TriggerMatch::One => {
                cfg.trig_mask0[0] &= !channelbit;
                cfg.trig_mask1[0] &= !channelbit;
                cfg.trig_value0[0] |= channelbit;
                cfg.trig_value1[0] |= channelbit;
            }
            TriggerMatch::Zero => {
                cfg.trig_mask0[0] &= !channelbit;
                cfg.trig_mask1[0] &= !channelbit;
            }
            TriggerMatch::Falling => {
                cfg.trig_mask0[0] &= !channelbit;
                cfg.trig_mask1[0] &= !channelbit;
                cfg.trig_edge0[0] |= channelbit;
                cfg.trig_edge1[0] |= channelbit;
            }
            TriggerMatch::Rising => {
                cfg.trig_mask0[0] &= !channelbit;
                cfg.trig_mask1[0] &= !channelbit;
                cfg.trig_value0[0] |= channelbit;
                cfg.trig_value1[0] |= channelbit;
                cfg.trig_edge0[0] |= channelbit;
                cfg.trig_edge1[0] |= channelbit;
            }
            TriggerMatch::Edge => {
                cfg.trig_edge0[0] |= channelbit;
                cfg.trig_edge1[0] |= channelbit;
            }
        }
    }

    if armed {
        cfg.mode |= MODE_TRIG_EN;
    }

    Ok(())
}

/// Announce and send the FPGA configuration frame.
pub fn fpga_configure(usb: &mut dyn UsbTransport, cfg: &FpgaConfig) -> Result<()> {
    debug!("dslogic: configuring FPGA");

    // The length crosses the wire in half-words, in three bytes.
    let len = FpgaConfig::len_half_words();
    let announce = [
        (len & 0xff) as u8,
        ((len >> 8) & 0xff) as u8,
        ((len >> 16) & 0xff) as u8,
    ];
    usb.control_out(CMD_SETTING, 0, 0, &announce)?;

    let bytes = cfg.to_bytes();
    let sent = usb.bulk_write(EP_CONFIG_OUT, &bytes)?;
    if sent != bytes.len() {
        return Err(Error::Transport(format!(
            "short FPGA configuration transfer: {sent} of {} bytes",
            bytes.len()
        )));
    }
    Ok(())
}

/// Upload an FPGA bitstream: announce with the `CONFIG` request, give the
/// FX2 a moment, then bulk-write the blob. Short transfers are fatal.
pub fn fpga_firmware_upload(usb: &mut dyn UsbTransport, bitstream: &mut dyn Read) -> Result<()> {
    usb.control_out(CMD_CONFIG, 0, 0, &[0, 0, 0])?;
    thread::sleep(FPGA_UPLOAD_DELAY);

    let mut buf = vec![0u8; FW_BUFSIZE];
    let mut total = 0u64;
    loop {
        let chunk = bitstream.read(&mut buf)?;
        if chunk == 0 {
            break;
        }
        let sent = usb.bulk_write(EP_CONFIG_OUT, &buf[..chunk])?;
        total += sent as u64;
        trace!("dslogic: uploaded {total} bitstream bytes");
        if sent != chunk {
            return Err(Error::Transport(
                "short transfer while uploading the FPGA bitstream".into(),
            ));
        }
    }

    debug!("dslogic: FPGA bitstream upload done ({total} bytes)");
    Ok(())
}

/// Program the trigger threshold DAC.
pub fn set_voltage_threshold(usb: &mut dyn UsbTransport, vth: VoltageThreshold) -> Result<()> {
    let value = (vth.volts() / 5.0 * 255.0) as u8;
    let cmd = (value as u16) | ((ADDR_VTH as u16) << 8);
    usb.control_out(CMD_WR_REG, 0, 0, &cmd.to_le_bytes())
}

/// Send the acquisition start/stop control request.
pub fn send_start(usb: &mut dyn UsbTransport, flags: u8) -> Result<()> {
    // flags, sample_delay_h, sample_delay_l
    usb.control_out(CMD_START, 0, 0, &[flags, 0, 0])
}

fn read_sample(data: &[u8], index: usize, unitsize: usize) -> u16 {
    if unitsize == 2 {
        u16::from_le_bytes([data[index * 2], data[index * 2 + 1]])
    } else {
        data[index] as u16
    }
}

/// Event source draining the bulk-in completion queue for one device.
pub struct DslAcquisition {
    pub device: DeviceId,
    pub devc: Arc<Mutex<DslContext>>,
    pub usb: Arc<Mutex<Box<dyn UsbTransport>>>,
}

impl DslAcquisition {
    fn finish(&self, devc: &mut DslContext, feed: &mut Datafeed) {
        devc.acq_running = false;
        feed.send(self.device, &Packet::End);
        let mut usb = self.usb.lock().unwrap();
        if let Err(e) = send_start(usb.as_mut(), START_FLAGS_STOP) {
            debug!("dslogic: stop command failed: {e}");
        }
        let _ = usb.cancel_all();
    }
}

impl EventSource for DslAcquisition {
    fn ready(&mut self) -> Result<bool> {
        Ok(self.usb.lock().unwrap().has_completion())
    }

    fn dispatch(&mut self, event: SourceEvent, feed: &mut Datafeed) -> Result<SourceAction> {
        let mut devc = self.devc.lock().unwrap();
        if !devc.acq_running {
            return Ok(SourceAction::Remove);
        }

        let payload = match event {
            SourceEvent::Ready => match self.usb.lock().unwrap().poll_completion()? {
                Some(payload) => payload,
                None => return Ok(SourceAction::Continue),
            },
            SourceEvent::Timeout => {
                // No transfer completed for the whole USB timeout: the
                // device or the bus is stuck.
                warn!("dslogic: no transfer completions, aborting acquisition");
                self.finish(&mut devc, feed);
                return Ok(SourceAction::Remove);
            }
        };

        if payload.is_empty() {
            devc.empty_transfer_count += 1;
            if devc.empty_transfer_count >= MAX_EMPTY_TRANSFERS {
                warn!("dslogic: device stalled, aborting acquisition");
                self.finish(&mut devc, feed);
                return Ok(SourceAction::Remove);
            }
            let buffer_size = devc.buffer_size();
            self.usb
                .lock()
                .unwrap()
                .submit_bulk_in(EP_STREAM_IN, buffer_size)?;
            return Ok(SourceAction::Continue);
        }
        devc.empty_transfer_count = 0;

        let unitsize = if devc.sample_wide { 2 } else { 1 };
        let usable = payload.len() - payload.len() % unitsize;
        let total_samples = usable / unitsize;
        let mut start_sample = 0usize;

        // Software trigger: match on the width-expanded sample value, not
        // on raw bytes, so wide mode sees correct channel positions.
        if devc.trigger_stage >= 0 {
            let mut fired_at = None;
            for i in 0..total_samples {
                let sample = read_sample(&payload, i, unitsize);
                if devc.match_sample(sample) {
                    devc.trigger_stage += 1;
                    if devc.trigger_stage as usize >= devc.num_soft_stages {
                        devc.trigger_stage = TRIGGER_FIRED;
                        fired_at = Some(i);
                        break;
                    }
                } else if devc.trigger_stage > 0 {
                    devc.trigger_stage = 0;
                }
            }
            match fired_at {
                Some(i) => {
                    info!("dslogic: software trigger fired");
                    feed.send(self.device, &Packet::Trigger);
                    start_sample = i;
                }
                None => {
                    // Still hunting: this transfer is all pre-trigger.
                    let buffer_size = devc.buffer_size();
                    self.usb
                        .lock()
                        .unwrap()
                        .submit_bulk_in(EP_STREAM_IN, buffer_size)?;
                    return Ok(SourceAction::Continue);
                }
            }
        }

        let remaining = if devc.continuous {
            u64::MAX
        } else {
            devc.limit_samples.saturating_sub(devc.num_samples)
        };
        let take = ((total_samples - start_sample) as u64).min(remaining) as usize;

        if take > 0 {
            let slice =
                payload[start_sample * unitsize..(start_sample + take) * unitsize].to_vec();
            feed.send(self.device, &Packet::Logic(Logic::new(unitsize, slice)?));
            devc.num_samples += take as u64;
        }

        if !devc.continuous && devc.num_samples >= devc.limit_samples {
            debug!("dslogic: sample limit reached ({})", devc.num_samples);
            self.finish(&mut devc, feed);
            return Ok(SourceAction::Remove);
        }

        let buffer_size = devc.buffer_size();
        self.usb
            .lock()
            .unwrap()
            .submit_bulk_in(EP_STREAM_IN, buffer_size)?;
        Ok(SourceAction::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceId, Probe, ProbeKind};

    fn test_device(num_probes: usize) -> Device {
        let mut dev = Device::new(
            DeviceId {
                driver: "dslogic",
                index: 0,
            },
            "DreamSourceLab",
            "DSLogic",
            "",
        );
        for i in 0..num_probes {
            dev.probes
                .push(Probe::new(i, ProbeKind::Logic, true, &i.to_string()).unwrap());
        }
        dev
    }

    #[test]
    fn test_fpga_config_layout() {
        let mut cfg = FpgaConfig::new();
        cfg.mode = 0x1234;
        cfg.divider = 0xaabbccdd;

        let bytes = cfg.to_bytes();
        assert_eq!(bytes.len(), FpgaConfig::BYTE_LEN);
        assert_eq!(FpgaConfig::len_half_words(), 180);

        // Framing words.
        assert_eq!(&bytes[..4], &CFG_START.to_le_bytes());
        assert_eq!(&bytes[bytes.len() - 4..], &CFG_END.to_le_bytes());

        // First section: mode header then the mode word, little-endian.
        assert_eq!(&bytes[4..6], &CFG_MODE.to_le_bytes());
        assert_eq!(&bytes[6..8], &[0x34, 0x12]);
        assert_eq!(&bytes[8..10], &CFG_DIVIDER.to_le_bytes());
        assert_eq!(&bytes[10..14], &[0xdd, 0xcc, 0xbb, 0xaa]);
    }

    #[test]
    fn test_mode_word_rle_threshold() {
        let mut ctx = DslContext::new();
        ctx.cur_samplerate = MAX_LOGIC_SAMPLERATE;
        ctx.limit_samples = MAX_LOGIC_DEPTH + 1;
        ctx.continuous = false;
        assert_ne!(ctx.build_mode() & MODE_RLE_MODE, 0);

        ctx.limit_samples = MAX_LOGIC_DEPTH;
        assert_eq!(ctx.build_mode() & MODE_RLE_MODE, 0);

        // Continuous mode streams instead of using RLE.
        ctx.limit_samples = MAX_LOGIC_DEPTH + 1;
        ctx.continuous = true;
        let mode = ctx.build_mode();
        assert_eq!(mode & MODE_RLE_MODE, 0);
        assert_ne!(mode & MODE_STREAM_MODE, 0);
    }

    #[test]
    fn test_mode_word_half_and_quarter() {
        let mut ctx = DslContext::new();
        ctx.cur_samplerate = MAX_LOGIC_SAMPLERATE * 2;
        assert_ne!(ctx.build_mode() & MODE_HALF_MODE, 0);

        ctx.cur_samplerate = MAX_LOGIC_SAMPLERATE * 4;
        let mode = ctx.build_mode();
        assert_eq!(mode & MODE_HALF_MODE, 0);
        assert_ne!(mode & MODE_QUAR_MODE, 0);
    }

    #[test]
    fn test_mode_word_external_clock() {
        let mut ctx = DslContext::new();
        ctx.external_clock = true;
        assert_ne!(ctx.build_mode() & MODE_CLK_TYPE, 0);
        assert_eq!(ctx.build_mode() & MODE_CLK_EDGE, 0);

        ctx.clock_edge = ClockEdge::Falling;
        assert_ne!(ctx.build_mode() & MODE_CLK_EDGE, 0);
    }

    #[test]
    fn test_transfer_sizing() {
        let mut ctx = DslContext::new();
        ctx.cur_samplerate = mhz(100);
        // 100 MHz: 200000 bytes/ms, 2 MB per 10 ms transfer.
        assert_eq!(ctx.bytes_per_ms(), 200_000);
        assert_eq!(ctx.buffer_size() % 512, 0);
        assert!(ctx.buffer_size() >= 10 * 200_000);
        assert!(ctx.num_transfers() <= NUM_SIMUL_TRANSFERS);

        // Rates above 100 MHz are clamped for transfer sizing.
        ctx.cur_samplerate = mhz(400);
        assert_eq!(ctx.bytes_per_ms(), 200_000);

        ctx.cur_samplerate = khz(10);
        assert!(ctx.num_transfers() >= 1);
    }

    #[test]
    fn test_trigger_block_defaults() {
        let dev = test_device(16);
        let mut ctx = DslContext::new();
        ctx.capture_ratio = 50;
        ctx.limit_samples = 1000;

        let mut cfg = FpgaConfig::new();
        configure_trigger(&mut cfg, &dev, &ctx).unwrap();

        assert_eq!(cfg.ch_en, 0xffff);
        assert_eq!(cfg.trig_mask0[0], 0xffff);
        assert_eq!(cfg.trig_pos, 500);
        for i in 1..NUM_TRIGGER_STAGES {
            assert_eq!(cfg.trig_mask0[i], 0xff);
            assert_eq!(cfg.trig_logic0[i], 2);
        }
        // No trigger armed: mode bit stays clear.
        assert_eq!(cfg.mode & MODE_TRIG_EN, 0);
    }

    #[test]
    fn test_trigger_block_match_kinds() {
        let mut dev = test_device(16);
        dev.configure_probe(0, true, Some("1")).unwrap();
        dev.configure_probe(1, true, Some("0")).unwrap();
        dev.configure_probe(2, true, Some("r")).unwrap();
        dev.configure_probe(3, true, Some("f")).unwrap();
        dev.configure_probe(4, true, Some("c")).unwrap();

        let ctx = DslContext::new();
        let mut cfg = FpgaConfig::new();
        configure_trigger(&mut cfg, &dev, &ctx).unwrap();

        // One: mask cleared, value and no edge.
        assert_eq!(cfg.trig_mask0[0] & 0x01, 0);
        assert_ne!(cfg.trig_value0[0] & 0x01, 0);
        assert_eq!(cfg.trig_edge0[0] & 0x01, 0);
        // Zero: mask cleared only.
        assert_eq!(cfg.trig_mask0[0] & 0x02, 0);
        assert_eq!(cfg.trig_value0[0] & 0x02, 0);
        // Rising: mask cleared, value and edge set.
        assert_eq!(cfg.trig_mask0[0] & 0x04, 0);
        assert_ne!(cfg.trig_value0[0] & 0x04, 0);
        assert_ne!(cfg.trig_edge0[0] & 0x04, 0);
        // Falling: mask cleared, edge set, value clear.
        assert_eq!(cfg.trig_mask0[0] & 0x08, 0);
        assert_eq!(cfg.trig_value0[0] & 0x08, 0);
        assert_ne!(cfg.trig_edge0[0] & 0x08, 0);
        // Edge: only the edge bits.
        assert_ne!(cfg.trig_mask0[0] & 0x10, 0);
        assert_ne!(cfg.trig_edge0[0] & 0x10, 0);

        assert_ne!(cfg.mode & MODE_TRIG_EN, 0);
    }

    #[test]
    fn test_disabled_probe_trigger_ignored() {
        let mut dev = test_device(16);
        dev.configure_probe(5, true, Some("1")).unwrap();
        dev.probe_mut(5).unwrap().enabled = false;

        let ctx = DslContext::new();
        let mut cfg = FpgaConfig::new();
        configure_trigger(&mut cfg, &dev, &ctx).unwrap();
        assert_eq!(cfg.mode & MODE_TRIG_EN, 0);
        assert_eq!(cfg.ch_en & (1 << 5), 0);
    }

    #[test]
    fn test_soft_trigger_stage_advance() {
        let mut dev = test_device(16);
        // Stage 0: probe 0 low; stage 1: probe 0 high.
        dev.configure_probe(0, true, Some("01")).unwrap();

        let mut ctx = DslContext::new();
        ctx.configure_soft_trigger(&dev).unwrap();
        assert_eq!(ctx.num_soft_stages, 2);
        assert_eq!(ctx.trigger_stage, 0);

        assert!(ctx.match_sample(0x0000));
        assert!(!ctx.match_sample(0x0001));
        ctx.trigger_stage = 1;
        assert!(ctx.match_sample(0x0001));
    }

    #[test]
    fn test_soft_trigger_edge_defers_to_fpga() {
        let mut dev = test_device(16);
        dev.configure_probe(0, true, Some("r")).unwrap();

        let mut ctx = DslContext::new();
        ctx.configure_soft_trigger(&dev).unwrap();
        assert_eq!(ctx.trigger_stage, TRIGGER_FIRED);
        assert_eq!(ctx.num_soft_stages, 0);
    }

    #[test]
    fn test_voltage_threshold_register_value() {
        // 2.5 V maps to half scale.
        let value = (VoltageThreshold::V5.volts() / 5.0 * 255.0) as u8;
        assert_eq!(value, 127);
    }
}
