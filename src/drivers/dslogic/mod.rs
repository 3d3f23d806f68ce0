//! DreamSourceLab DSLogic USB logic analyzer (FX2 based)
//!
//! A freshly plugged device runs no application firmware; scanning uploads
//! the FX2 firmware over the Cypress vendor request and the device then
//! renumerates, which takes up to a few seconds. Opening uploads the
//! model-specific FPGA bitstream; acquisition sends the FPGA configuration
//! frame and streams samples over bulk endpoint 6 with a pool of parallel
//! transfers.

pub mod protocol;

use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::device::{Device, DeviceId, DeviceStatus, Probe, ProbeKind};
use crate::driver::{
    Capability, ConfigValue, Driver, InfoKey, InfoValue, SamplerateSpec, ScanOption,
};
use crate::drivers::{FsResources, ResourceReader};
use crate::packet::{Header, MetaLogic, Packet};
use crate::session::{Interest, Session, SourceHandle};
use crate::transport::usb::{RusbBackend, UsbBackend, UsbDeviceInfo, UsbTransport, USB_TIMEOUT};
use crate::{Error, Result};

use protocol::*;

const DRIVER_NAME: &str = "dslogic";
const NUM_PROBES: usize = 16;

/// Cypress-standard firmware download vendor request.
const FX2_FIRMWARE_LOAD: u8 = 0xa0;
/// FX2 CPU control/status register; write 1 to hold the CPU in reset.
const FX2_CPUCS: u16 = 0xe600;
const FX2_CHUNK: usize = 512;

pub const DEV_CAPS_16BIT: u32 = 1 << 0;

/// A supported VID/PID with its identity and firmware name.
pub struct DslProfile {
    pub vid: u16,
    pub pid: u16,
    pub vendor: &'static str,
    pub model: &'static str,
    pub model_version: &'static str,
    pub firmware: &'static str,
    pub dev_caps: u32,
}

static PROFILES: &[DslProfile] = &[
    DslProfile {
        vid: 0x2a0e,
        pid: 0x0001,
        vendor: "DreamSourceLab",
        model: "DSLogic",
        model_version: "",
        firmware: "dreamsourcelab-dslogic-fx2.fw",
        dev_caps: DEV_CAPS_16BIT,
    },
    DslProfile {
        vid: 0x2a0e,
        pid: 0x0003,
        vendor: "DreamSourceLab",
        model: "DSLogic Pro",
        model_version: "",
        firmware: "dreamsourcelab-dslogic-pro-fx2.fw",
        dev_caps: DEV_CAPS_16BIT,
    },
    DslProfile {
        vid: 0x2a0e,
        pid: 0x0020,
        vendor: "DreamSourceLab",
        model: "DSLogic Plus",
        model_version: "",
        firmware: "dreamsourcelab-dslogic-plus-fx2.fw",
        dev_caps: DEV_CAPS_16BIT,
    },
    DslProfile {
        vid: 0x2a0e,
        pid: 0x0021,
        vendor: "DreamSourceLab",
        model: "DSLogic Basic",
        model_version: "",
        firmware: "dreamsourcelab-dslogic-basic-fx2.fw",
        dev_caps: DEV_CAPS_16BIT,
    },
];

/// Pick the FPGA bitstream by exact model name; the original DSLogic has
/// two bitstreams selected by the configured voltage range.
fn bitstream_name(model: &str, vth: VoltageThreshold) -> Result<&'static str> {
    match model {
        "DSLogic" => Ok(match vth {
            VoltageThreshold::V18_33 => "dslogic-fpga-3v3.bin",
            VoltageThreshold::V5 => "dslogic-fpga-5v.bin",
        }),
        "DSLogic Pro" => Ok("dslogic-pro-fpga.bin"),
        "DSLogic Plus" => Ok("dslogic-plus-fpga.bin"),
        "DSLogic Basic" => Ok("dslogic-basic-fpga.bin"),
        _ => Err(Error::Dev(format!(
            "no FPGA bitstream known for model '{model}'"
        ))),
    }
}

/// Hold the FX2 CPU in reset, download the firmware image into RAM, then
/// release the CPU so the new firmware boots and the device renumerates.
fn upload_fx2_firmware(usb: &mut dyn UsbTransport, firmware: &mut dyn std::io::Read) -> Result<()> {
    usb.control_out(FX2_FIRMWARE_LOAD, FX2_CPUCS, 0, &[1])?;

    let mut image = Vec::new();
    firmware.read_to_end(&mut image)?;
    let mut addr = 0usize;
    for chunk in image.chunks(FX2_CHUNK) {
        usb.control_out(FX2_FIRMWARE_LOAD, addr as u16, 0, chunk)?;
        addr += chunk.len();
    }

    usb.control_out(FX2_FIRMWARE_LOAD, FX2_CPUCS, 0, &[0])?;
    debug!("dslogic: FX2 firmware upload done ({} bytes)", image.len());
    Ok(())
}

struct DslInstance {
    device: Device,
    info: UsbDeviceInfo,
    profile: &'static DslProfile,
    devc: Arc<Mutex<DslContext>>,
    usb: Option<Arc<Mutex<Box<dyn UsbTransport>>>>,
    source: Option<SourceHandle>,
}

/// DSLogic driver.
pub struct DslogicDriver {
    backend: Box<dyn UsbBackend>,
    resources: Box<dyn ResourceReader>,
    instances: Vec<DslInstance>,
}

impl DslogicDriver {
    /// Real hardware through `rusb`, firmware from the usual share dirs.
    pub fn new() -> Result<Self> {
        Ok(Self::with_backend(
            Box::new(RusbBackend::new()?),
            Box::new(FsResources::new(vec![
                "/usr/local/share/sigstream/firmware".into(),
                "/usr/share/sigstream/firmware".into(),
            ])),
        ))
    }

    /// Custom backend and firmware source (tests use scripted transports).
    pub fn with_backend(backend: Box<dyn UsbBackend>, resources: Box<dyn ResourceReader>) -> Self {
        Self {
            backend,
            resources,
            instances: Vec::new(),
        }
    }

    fn instance(&self, id: DeviceId) -> Result<&DslInstance> {
        if id.driver != DRIVER_NAME {
            return Err(Error::Bug(format!(
                "device {id} handed to the dslogic driver"
            )));
        }
        self.instances
            .get(id.index)
            .ok_or_else(|| Error::Arg(format!("unknown device {id}")))
    }

    fn instance_mut(&mut self, id: DeviceId) -> Result<&mut DslInstance> {
        if id.driver != DRIVER_NAME {
            return Err(Error::Bug(format!(
                "device {id} handed to the dslogic driver"
            )));
        }
        self.instances
            .get_mut(id.index)
            .ok_or_else(|| Error::Arg(format!("unknown device {id}")))
    }

    /// Set the input logic family the trigger threshold is tuned for.
    /// Takes effect at the next open (the DSLogic proper also selects its
    /// bitstream by this).
    pub fn set_voltage_threshold(&mut self, id: DeviceId, vth: VoltageThreshold) -> Result<()> {
        let inst = self.instance_mut(id)?;
        inst.devc.lock().unwrap().voltage_threshold = vth;
        Ok(())
    }
}

impl Driver for DslogicDriver {
    fn name(&self) -> &'static str {
        DRIVER_NAME
    }

    fn longname(&self) -> &'static str {
        "DreamSourceLab DSLogic"
    }

    fn cleanup(&mut self) -> Result<()> {
        for inst in &mut self.instances {
            inst.usb = None;
            inst.device.status = DeviceStatus::Inactive;
        }
        self.instances.clear();
        Ok(())
    }

    fn scan(&mut self, options: &[ScanOption]) -> Result<Vec<DeviceId>> {
        let mut model_hint = None;
        for opt in options {
            if let ScanOption::Model(m) = opt {
                model_hint = Some(m.clone());
            }
        }

        let Self {
            backend,
            resources,
            instances,
        } = self;

        let mut found = Vec::new();
        for info in backend.enumerate()? {
            let Some(profile) = PROFILES
                .iter()
                .find(|p| p.vid == info.vid && p.pid == info.pid)
            else {
                continue;
            };
            if let Some(hint) = &model_hint {
                if profile.model != hint {
                    continue;
                }
            }

            let index = instances.len();
            let id = DeviceId {
                driver: DRIVER_NAME,
                index,
            };
            let mut device = Device::new(id, profile.vendor, profile.model, profile.model_version);
            for i in 0..NUM_PROBES {
                device
                    .probes
                    .push(Probe::new(i, ProbeKind::Logic, true, &i.to_string())?);
            }
            let devc = DslContext::new();
            let devc = Arc::new(Mutex::new(devc));

            match backend.open(&info) {
                Ok(mut usb) => {
                    match usb.control_in(CMD_GET_FW_VERSION, 0, 0, 2) {
                        Ok(version) => {
                            info!(
                                "dslogic: found {} with firmware {:?}",
                                profile.model, version
                            );
                        }
                        Err(_) => {
                            // No application firmware yet: upload it. The
                            // device renumerates and must not be opened
                            // until the renumeration delay has passed.
                            info!("dslogic: uploading FX2 firmware '{}'", profile.firmware);
                            let mut fw = resources.open(profile.firmware)?;
                            upload_fx2_firmware(usb.as_mut(), fw.as_mut())?;
                            devc.lock().unwrap().fw_updated = Some(std::time::Instant::now());
                            device.status = DeviceStatus::Initializing;
                        }
                    }
                }
                Err(e) => {
                    warn!("dslogic: cannot open {:04x}.{:04x}: {e}", info.vid, info.pid);
                    continue;
                }
            }

            instances.push(DslInstance {
                device,
                info,
                profile,
                devc,
                usb: None,
                source: None,
            });
            found.push(id);
        }

        Ok(found)
    }

    fn dev_list(&self) -> Vec<DeviceId> {
        self.instances.iter().map(|i| i.device.id).collect()
    }

    fn device(&self, id: DeviceId) -> Option<&Device> {
        self.instance(id).ok().map(|i| &i.device)
    }

    fn device_mut(&mut self, id: DeviceId) -> Option<&mut Device> {
        self.instance_mut(id).ok().map(|i| &mut i.device)
    }

    fn dev_open(&mut self, id: DeviceId) -> Result<()> {
        if id.driver != DRIVER_NAME {
            return Err(Error::Bug(format!(
                "device {id} handed to the dslogic driver"
            )));
        }
        let Self {
            backend,
            resources,
            instances,
        } = self;
        let inst = instances
            .get_mut(id.index)
            .ok_or_else(|| Error::Arg(format!("unknown device {id}")))?;

        let vth = {
            let devc = inst.devc.lock().unwrap();
            if let Some(at) = devc.fw_updated {
                if at.elapsed() < MAX_RENUM_DELAY {
                    return Err(Error::Dev(
                        "device is renumerating after the firmware upload".into(),
                    ));
                }
            }
            devc.voltage_threshold
        };

        if inst.usb.is_none() {
            let mut usb = backend.open(&inst.info)?;
            set_voltage_threshold(usb.as_mut(), vth)?;
            let name = bitstream_name(inst.profile.model, vth)?;
            debug!("dslogic: uploading FPGA bitstream '{name}'");
            let mut bitstream = resources.open(name)?;
            fpga_firmware_upload(usb.as_mut(), bitstream.as_mut())?;
            inst.usb = Some(Arc::new(Mutex::new(usb)));
        }
        inst.device.status = DeviceStatus::Active;
        Ok(())
    }

    fn dev_close(&mut self, id: DeviceId) -> Result<()> {
        let inst = self.instance_mut(id)?;
        inst.usb = None;
        inst.device.status = DeviceStatus::Inactive;
        Ok(())
    }

    fn info_get(&self, key: InfoKey, dev: Option<DeviceId>) -> Result<InfoValue> {
        match key {
            InfoKey::HwOpts => Ok(InfoValue::Strings(vec!["conn".into(), "model".into()])),
            InfoKey::HwCaps => Ok(InfoValue::Caps(vec![
                Capability::LogicAnalyzer,
                Capability::Samplerate,
                Capability::CaptureRatio,
                Capability::LimitSamples,
                Capability::Continuous,
            ])),
            InfoKey::NumProbes => Ok(InfoValue::Uint(NUM_PROBES as u64)),
            InfoKey::ProbeNames => Ok(InfoValue::Strings(
                (0..NUM_PROBES).map(|i| i.to_string()).collect(),
            )),
            InfoKey::Samplerates => Ok(InfoValue::Samplerates(SamplerateSpec::List(
                SAMPLERATES.to_vec(),
            ))),
            InfoKey::TriggerAlphabet => Ok(InfoValue::TriggerAlphabet("01rfc")),
            InfoKey::CurSamplerate => {
                let id = dev.ok_or_else(|| Error::Arg("current samplerate needs a device".into()))?;
                let devc = self.instance(id)?.devc.lock().unwrap();
                Ok(InfoValue::Uint(devc.cur_samplerate))
            }
            _ => Err(Error::Arg(format!("dslogic does not provide {key:?}"))),
        }
    }

    fn config_set(&mut self, id: DeviceId, cap: Capability, value: ConfigValue) -> Result<()> {
        let inst = self.instance_mut(id)?;
        if inst.device.status != DeviceStatus::Active {
            return Err(Error::Dev(format!("device {id} is not open")));
        }
        let mut devc = inst.devc.lock().unwrap();

        match cap {
            Capability::Samplerate => {
                let rate = value.as_uint()?;
                if !SAMPLERATES.contains(&rate) {
                    return Err(Error::Samplerate(rate));
                }
                devc.cur_samplerate = rate;
                Ok(())
            }
            Capability::LimitSamples => {
                let limit = value.as_uint()?;
                if limit == 0 {
                    return Err(Error::Arg("sample limit must be nonzero".into()));
                }
                devc.limit_samples = limit;
                Ok(())
            }
            Capability::CaptureRatio => {
                let ratio = value.as_uint()?;
                if ratio > 100 {
                    devc.capture_ratio = 0;
                    return Err(Error::Dev(format!("capture ratio {ratio} out of range")));
                }
                devc.capture_ratio = ratio;
                Ok(())
            }
            Capability::Continuous => {
                devc.continuous = value.as_bool()?;
                Ok(())
            }
            other => Err(Error::Arg(format!("dslogic does not support {other:?}"))),
        }
    }

    fn acquisition_start(&mut self, id: DeviceId, session: &mut Session) -> Result<()> {
        let inst = self.instance_mut(id)?;
        if inst.device.status != DeviceStatus::Active {
            return Err(Error::Dev(format!("device {id} is not open")));
        }
        let usb = inst
            .usb
            .clone()
            .ok_or_else(|| Error::Bug("open device without a transport".into()))?;

        let mut devc = inst.devc.lock().unwrap();
        if devc.limit_samples == 0 && !devc.continuous {
            return Err(Error::Dev("sample limit not configured".into()));
        }
        devc.sample_wide =
            inst.profile.dev_caps & DEV_CAPS_16BIT != 0 && inst.device.num_enabled_probes() > 8;
        devc.configure_soft_trigger(&inst.device)?;

        let mut cfg = FpgaConfig::new();
        cfg.mode = devc.build_mode();
        cfg.divider = MAX_LOGIC_SAMPLERATE.div_ceil(devc.cur_samplerate).max(1) as u32;
        cfg.count = devc.limit_samples as u32;
        configure_trigger(&mut cfg, &inst.device, &devc)?;

        {
            let mut guard = usb.lock().unwrap();
            let port = guard.as_mut();
            fpga_configure(port, &cfg)?;

            let transfers = devc.num_transfers();
            let buffer_size = devc.buffer_size();
            debug!("dslogic: submitting {transfers} transfers of {buffer_size} bytes");
            for _ in 0..transfers {
                port.submit_bulk_in(EP_STREAM_IN, buffer_size)?;
            }

            let mut flags = START_FLAGS_MODE_LA;
            if devc.sample_wide {
                flags |= START_FLAGS_SAMPLE_WIDE;
            }
            send_start(port, flags)?;
        }

        devc.num_samples = 0;
        devc.empty_transfer_count = 0;
        devc.acq_running = true;
        let samplerate = devc.cur_samplerate;
        drop(devc);

        let handle = session.next_handle();
        inst.source = Some(handle);
        session.source_add(
            handle,
            Interest::READ,
            Some(USB_TIMEOUT),
            Box::new(DslAcquisition {
                device: id,
                devc: Arc::clone(&inst.devc),
                usb,
            }),
        );

        let num_probes = inst.device.probes.len();
        session.feed_mut().send(id, &Packet::Header(Header::new()));
        session
            .feed_mut()
            .send(id, &Packet::MetaLogic(MetaLogic::new(num_probes, samplerate)?));

        Ok(())
    }

    fn acquisition_stop(&mut self, id: DeviceId, session: &mut Session) -> Result<()> {
        let inst = self.instance_mut(id)?;
        let was_running = {
            let mut devc = inst.devc.lock().unwrap();
            std::mem::replace(&mut devc.acq_running, false)
        };
        if let Some(handle) = inst.source.take() {
            let _ = session.source_remove(handle);
        }
        if was_running {
            inst.device.status = DeviceStatus::Stopping;
            if let Some(usb) = &inst.usb {
                let mut guard = usb.lock().unwrap();
                if let Err(e) = send_start(guard.as_mut(), START_FLAGS_STOP) {
                    debug!("dslogic: stop command failed: {e}");
                }
                let _ = guard.cancel_all();
            }
            session.feed_mut().send(id, &Packet::End);
            inst.device.status = DeviceStatus::Active;
        }
        Ok(())
    }
}
