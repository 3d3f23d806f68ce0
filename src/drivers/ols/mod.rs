//! Openbench Logic Sniffer (SUMP protocol) serial logic analyzer
//!
//! Discovery sends five RESET commands to flush any partially-received
//! long command, then an ID command; a device answering `1SLO` or `1ALS`
//! speaks the SUMP protocol. Boards that also answer the metadata command
//! report their name and limits; anything else is taken for a generic
//! 32-probe Sump board.

pub mod protocol;

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::device::{Device, DeviceId, DeviceStatus, Probe, ProbeKind};
use crate::driver::{
    Capability, ConfigValue, Driver, InfoKey, InfoValue, SamplerateSpec, ScanOption,
};
use crate::drivers::{system_serial_factory, SerialFactory};
use crate::packet::{Header, MetaLogic, Packet};
use crate::session::{Interest, Session, SourceHandle};
use crate::transport::serial::{ConnSpec, SerialComm, SerialTransport};
use crate::{Error, Result};

use protocol::*;

const DRIVER_NAME: &str = "ols";
const DEFAULT_SERIALCOMM: &str = "115200/8n1";
const NUM_PROBES: usize = 32;

struct OlsInstance {
    device: Device,
    conn: ConnSpec,
    comm: SerialComm,
    devc: Arc<Mutex<OlsContext>>,
    serial: Option<Arc<Mutex<Box<dyn SerialTransport>>>>,
    source: Option<SourceHandle>,
}

/// Openbench Logic Sniffer driver.
pub struct OlsDriver {
    factory: SerialFactory,
    instances: Vec<OlsInstance>,
}

impl OlsDriver {
    pub fn new() -> Self {
        Self::with_factory(system_serial_factory())
    }

    /// Use a custom transport factory (tests drive the engine with
    /// scripted in-memory ports).
    pub fn with_factory(factory: SerialFactory) -> Self {
        Self {
            factory,
            instances: Vec::new(),
        }
    }

    fn instance(&self, id: DeviceId) -> Result<&OlsInstance> {
        if id.driver != DRIVER_NAME {
            return Err(Error::Bug(format!("device {id} handed to the ols driver")));
        }
        self.instances
            .get(id.index)
            .ok_or_else(|| Error::Arg(format!("unknown device {id}")))
    }

    fn instance_mut(&mut self, id: DeviceId) -> Result<&mut OlsInstance> {
        if id.driver != DRIVER_NAME {
            return Err(Error::Bug(format!("device {id} handed to the ols driver")));
        }
        self.instances
            .get_mut(id.index)
            .ok_or_else(|| Error::Arg(format!("unknown device {id}")))
    }

    /// Wait up to `timeout` for the device to have bytes pending.
    fn wait_for_data(serial: &mut dyn SerialTransport, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if serial.bytes_available()? > 0 {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Drain the metadata response: keep reading until the device has been
    /// quiet for the probe timeout.
    fn read_metadata_stream(serial: &mut dyn SerialTransport) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        let mut last_data = Instant::now();
        loop {
            let mut chunk = [0u8; 64];
            let n = serial.read(&mut chunk)?;
            if n > 0 {
                buf.extend_from_slice(&chunk[..n]);
                last_data = Instant::now();
            } else if last_data.elapsed() >= PROBE_TIMEOUT {
                break;
            } else {
                thread::sleep(Duration::from_millis(1));
            }
        }
        Ok(buf)
    }

    fn add_probes(device: &mut Device, count: usize) -> Result<()> {
        for i in 0..count.min(NUM_PROBES) {
            device
                .probes
                .push(Probe::new(i, ProbeKind::Logic, true, &i.to_string())?);
        }
        Ok(())
    }
}

impl Default for OlsDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver for OlsDriver {
    fn name(&self) -> &'static str {
        DRIVER_NAME
    }

    fn longname(&self) -> &'static str {
        "Openbench Logic Sniffer"
    }

    fn cleanup(&mut self) -> Result<()> {
        for inst in &mut self.instances {
            inst.serial = None;
            inst.device.status = DeviceStatus::Inactive;
        }
        self.instances.clear();
        Ok(())
    }

    fn scan(&mut self, options: &[ScanOption]) -> Result<Vec<DeviceId>> {
        let mut conn = None;
        let mut serialcomm = None;
        for opt in options {
            match opt {
                ScanOption::Conn(c) => conn = Some(c.clone()),
                ScanOption::SerialComm(s) => serialcomm = Some(s.clone()),
                ScanOption::Model(_) => {}
            }
        }
        let Some(conn) = conn else {
            debug!("ols: no connection option given, not scanning");
            return Ok(Vec::new());
        };
        let conn: ConnSpec = conn.parse()?;
        let comm: SerialComm = serialcomm.as_deref().unwrap_or(DEFAULT_SERIALCOMM).parse()?;

        info!("ols: probing {conn:?}");
        let mut serial = (self.factory)(&conn, &comm)?;

        // The device could be anywhere in a 5-byte command, so flush with
        // five resets before asking for the ID.
        for _ in 0..5 {
            if let Err(e) = send_short_command(serial.as_mut(), CMD_RESET) {
                warn!("ols: port is not writable: {e}");
                return Ok(Vec::new());
            }
        }
        send_short_command(serial.as_mut(), CMD_ID)?;

        if !Self::wait_for_data(serial.as_mut(), PROBE_TIMEOUT)? {
            debug!("ols: no reply to ID command");
            return Ok(Vec::new());
        }
        let mut id_reply = [0u8; 4];
        if serial.read(&mut id_reply)? != 4 {
            return Ok(Vec::new());
        }
        if &id_reply != b"1SLO" && &id_reply != b"1ALS" {
            debug!("ols: unrecognized ID reply {id_reply:02x?}");
            return Ok(Vec::new());
        }

        // Definitely the SUMP protocol; see if the board also has the
        // metadata extension.
        send_short_command(serial.as_mut(), CMD_METADATA)?;
        let index = self.instances.len();
        let id = DeviceId {
            driver: DRIVER_NAME,
            index,
        };

        let mut devc = OlsContext::new();
        let mut device;
        if Self::wait_for_data(serial.as_mut(), PROBE_TIMEOUT)? {
            let raw = Self::read_metadata_stream(serial.as_mut())?;
            let md = parse_metadata(&raw);
            devc.apply_metadata(&md);
            device = Device::new(id, "Sump", &md.name, &md.version);
            let count = if md.probe_count > 0 {
                md.probe_count
            } else {
                NUM_PROBES
            };
            Self::add_probes(&mut device, count)?;
        } else {
            // Not an OLS, just some board using the SUMP protocol.
            device = Device::new(id, "Sump", "Logic Analyzer", "v1.0");
            Self::add_probes(&mut device, NUM_PROBES)?;
        }

        info!(
            "ols: found {} '{}' with {} probes",
            device.vendor,
            device.model,
            device.probes.len()
        );
        self.instances.push(OlsInstance {
            device,
            conn,
            comm,
            devc: Arc::new(Mutex::new(devc)),
            serial: None,
            source: None,
        });

        Ok(vec![id])
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
            return Err(Error::Bug(format!("device {id} handed to the ols driver")));
        }
        let Self {
            factory, instances, ..
        } = self;
        let inst = instances
            .get_mut(id.index)
            .ok_or_else(|| Error::Arg(format!("unknown device {id}")))?;
        if inst.serial.is_none() {
            let serial = (factory)(&inst.conn, &inst.comm)?;
            inst.serial = Some(Arc::new(Mutex::new(serial)));
        }
        inst.device.status = DeviceStatus::Active;
        Ok(())
    }

    fn dev_close(&mut self, id: DeviceId) -> Result<()> {
        let inst = self.instance_mut(id)?;
        inst.serial = None;
        inst.device.status = DeviceStatus::Inactive;
        Ok(())
    }

    fn info_get(&self, key: InfoKey, dev: Option<DeviceId>) -> Result<InfoValue> {
        match key {
            InfoKey::HwOpts => Ok(InfoValue::Strings(vec![
                "conn".into(),
                "serialcomm".into(),
            ])),
            InfoKey::HwCaps => Ok(InfoValue::Caps(vec![
                Capability::LogicAnalyzer,
                Capability::Samplerate,
                Capability::CaptureRatio,
                Capability::LimitSamples,
                Capability::Rle,
            ])),
            InfoKey::NumProbes => match dev {
                Some(id) => Ok(InfoValue::Uint(self.instance(id)?.device.probes.len() as u64)),
                None => Ok(InfoValue::Uint(NUM_PROBES as u64)),
            },
            InfoKey::ProbeNames => Ok(InfoValue::Strings(
                (0..NUM_PROBES).map(|i| i.to_string()).collect(),
            )),
            InfoKey::Samplerates => Ok(InfoValue::Samplerates(SamplerateSpec::Range {
                low: SAMPLERATE_LOW,
                high: SAMPLERATE_HIGH,
                step: SAMPLERATE_STEP,
            })),
            InfoKey::TriggerAlphabet => Ok(InfoValue::TriggerAlphabet("01")),
            InfoKey::CurSamplerate => {
                let id = dev.ok_or_else(|| Error::Arg("current samplerate needs a device".into()))?;
                let devc = self.instance(id)?.devc.lock().unwrap();
                Ok(InfoValue::Uint(devc.cur_samplerate))
            }
            _ => Err(Error::Arg(format!("ols does not provide {key:?}"))),
        }
    }

    fn config_set(&mut self, id: DeviceId, cap: Capability, value: ConfigValue) -> Result<()> {
        let inst = self.instance_mut(id)?;
        if inst.device.status != DeviceStatus::Active {
            return Err(Error::Dev(format!("device {id} is not open")));
        }
        let mut devc = inst.devc.lock().unwrap();

        match cap {
            Capability::Samplerate => devc.set_samplerate(value.as_uint()?),
            Capability::LimitSamples => {
                let limit = value.as_uint()?;
                if limit < MIN_NUM_SAMPLES {
                    return Err(Error::Dev(format!(
                        "at least {MIN_NUM_SAMPLES} samples are needed"
                    )));
                }
                if devc.max_samples > 0 && limit > devc.max_samples as u64 {
                    warn!("ols: sample limit {limit} exceeds device memory");
                }
                devc.limit_samples = limit;
                info!("ols: sample limit {limit}");
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
            Capability::Rle => {
                if value.as_bool()? {
                    info!("ols: enabling RLE");
                    devc.flag_reg |= FLAG_RLE;
                } else {
                    devc.flag_reg &= !FLAG_RLE;
                }
                Ok(())
            }
            other => Err(Error::Arg(format!("ols does not support {other:?}"))),
        }
    }

    fn acquisition_start(&mut self, id: DeviceId, session: &mut Session) -> Result<()> {
        let inst = self.instance_mut(id)?;
        if inst.device.status != DeviceStatus::Active {
            return Err(Error::Dev(format!("device {id} is not open")));
        }
        let serial = inst
            .serial
            .clone()
            .ok_or_else(|| Error::Bug("open device without a transport".into()))?;

        let mut devc = inst.devc.lock().unwrap();
        devc.configure_probes(&inst.device)?;
        if devc.limit_samples < MIN_NUM_SAMPLES {
            return Err(Error::Dev("sample limit not configured".into()));
        }

        // Channel groups present in the probe mask stay enabled; the rest
        // are switched off to speed up the transfer.
        let mut changrp_mask = 0u8;
        let mut num_channels = 0u32;
        for i in 0..4 {
            if devc.probe_mask & (0xff << (i * 8)) != 0 {
                changrp_mask |= 1 << i;
                num_channels += 1;
            }
        }
        if num_channels == 0 {
            return Err(Error::Dev("no probes are enabled".into()));
        }

        // Stay within the hardware buffer; the device counts in units of
        // four samples.
        let max_per_group = if devc.max_samples > 0 {
            devc.max_samples as u64 / num_channels as u64
        } else {
            devc.limit_samples
        };
        let readcount = (max_per_group.min(devc.limit_samples) / 4) as u32;

        let mut trigger_config = [0u32; NUM_TRIGGER_STAGES];
        if devc.num_stages > 0 {
            trigger_config[devc.num_stages - 1] |= 0x08;
        }

        let delaycount;
        {
            let mut guard = serial.lock().unwrap();
            let port = guard.as_mut();

            if devc.trigger_mask[0] != 0 {
                delaycount =
                    (readcount as f64 * (1.0 - devc.capture_ratio as f64 / 100.0)) as u32;
                devc.trigger_at =
                    ((readcount - delaycount) as i64) * 4 - devc.num_stages as i64;
                for stage in 0..NUM_TRIGGER_STAGES {
                    send_long_command(
                        port,
                        CMD_SET_TRIGGER_MASK[stage],
                        reverse32(devc.trigger_mask[stage]),
                    )?;
                    send_long_command(
                        port,
                        CMD_SET_TRIGGER_VALUE[stage],
                        reverse32(devc.trigger_value[stage]),
                    )?;
                    send_long_command(port, CMD_SET_TRIGGER_CONFIG[stage], trigger_config[stage])?;
                }
            } else {
                devc.trigger_at = -1;
                send_long_command(port, CMD_SET_TRIGGER_MASK[0], devc.trigger_mask[0])?;
                send_long_command(port, CMD_SET_TRIGGER_VALUE[0], devc.trigger_value[0])?;
                send_long_command(port, CMD_SET_TRIGGER_CONFIG[0], 0x0000_0008)?;
                delaycount = readcount;
            }

            info!(
                "ols: setting samplerate to {} Hz (divider {}, demux {})",
                devc.cur_samplerate,
                devc.cur_samplerate_divider,
                if devc.flag_reg & FLAG_DEMUX != 0 {
                    "on"
                } else {
                    "off"
                }
            );
            send_long_command(port, CMD_SET_DIVIDER, reverse32(devc.cur_samplerate_divider))?;

            // Sample count and delay count, both in units of four samples,
            // minus one.
            let data = ((readcount.wrapping_sub(1) & 0xffff) << 16)
                | (delaycount.wrapping_sub(1) & 0xffff);
            send_long_command(port, CMD_CAPTURE_SIZE, reverse16(data))?;

            // The flag register wants the group bits at 2..=5, and 1 means
            // "disable channel group".
            devc.flag_reg |= !((changrp_mask as u16) << 2) & 0x3c;
            devc.flag_reg |= FLAG_FILTER;
            devc.rle_count = 0;
            let flags = devc.flag_reg as u32;
            send_long_command(port, CMD_SET_FLAGS, (flags << 24) | ((flags << 8) & 0xff0000))?;

            send_short_command(port, CMD_RUN)?;
        }

        devc.num_samples = 0;
        devc.num_bytes = 0;
        devc.sample = [0; 4];
        devc.started = false;
        devc.acq_running = true;
        let samplerate = devc.cur_samplerate;
        drop(devc);

        let handle = session.next_handle();
        inst.source = Some(handle);
        session.source_add(
            handle,
            Interest::READ,
            None,
            Box::new(OlsAcquisition {
                device: id,
                devc: Arc::clone(&inst.devc),
                serial,
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
            session.feed_mut().send(id, &Packet::End);
            // End has drained to the subscribers; the device stays open.
            inst.device.status = DeviceStatus::Active;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::serial::testing::ScriptedSerial;

    /// Shared handle onto one scripted port, so the test can feed bytes
    /// and inspect writes while the driver owns its own transport clones.
    #[derive(Clone)]
    struct SharedSerial(Arc<Mutex<ScriptedSerial>>);

    impl SerialTransport for SharedSerial {
        fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
            self.0.lock().unwrap().read(buf)
        }

        fn write(&mut self, buf: &[u8]) -> Result<usize> {
            self.0.lock().unwrap().write(buf)
        }

        fn bytes_available(&mut self) -> Result<usize> {
            self.0.lock().unwrap().bytes_available()
        }

        fn flush_input(&mut self) -> Result<()> {
            self.0.lock().unwrap().flush_input()
        }
    }

    fn scripted_factory(shared: Arc<Mutex<ScriptedSerial>>) -> SerialFactory {
        Box::new(move |_, _| Ok(Box::new(SharedSerial(Arc::clone(&shared))) as Box<_>))
    }

    fn conn_options() -> Vec<ScanOption> {
        vec![ScanOption::Conn("/dev/ttyACM0".into())]
    }

    #[test]
    fn test_scan_without_metadata_yields_generic_sump() {
        let shared = Arc::new(Mutex::new(ScriptedSerial::new()));
        shared.lock().unwrap().queue(b"1SLO");

        let mut driver = OlsDriver::with_factory(scripted_factory(Arc::clone(&shared)));
        let ids = driver.scan(&conn_options()).unwrap();
        assert_eq!(ids.len(), 1);

        let device = driver.device(ids[0]).unwrap();
        assert_eq!(device.vendor, "Sump");
        assert_eq!(device.model, "Logic Analyzer");
        assert_eq!(device.probes.len(), 32);
        assert_eq!(device.probes[0].name, "0");
        assert_eq!(device.probes[31].name, "31");
        assert!(device.probes.iter().all(|p| p.enabled));

        // Five resets, then ID, then METADATA.
        let tx = shared.lock().unwrap().tx.clone();
        assert_eq!(&tx[..7], &[0, 0, 0, 0, 0, CMD_ID, CMD_METADATA]);
    }

    #[test]
    fn test_scan_with_metadata() {
        let shared = Arc::new(Mutex::new(ScriptedSerial::new()));
        shared.lock().unwrap().queue(b"1ALS");
        // Device name "DEV", sample memory 32 bytes, terminator.
        shared
            .lock()
            .unwrap()
            .queue(&[0x01, b'D', b'E', b'V', 0x00, 0x21, 0x00, 0x00, 0x00, 0x20, 0x00]);

        let mut driver = OlsDriver::with_factory(scripted_factory(Arc::clone(&shared)));
        let ids = driver.scan(&conn_options()).unwrap();
        assert_eq!(ids.len(), 1);

        let device = driver.device(ids[0]).unwrap();
        assert!(device.model.contains("DEV"));

        let inst = driver.instance(ids[0]).unwrap();
        assert_eq!(inst.devc.lock().unwrap().max_samples, 32);
    }

    #[test]
    fn test_scan_rejects_unknown_id_reply() {
        let shared = Arc::new(Mutex::new(ScriptedSerial::new()));
        shared.lock().unwrap().queue(b"XXXX");

        let mut driver = OlsDriver::with_factory(scripted_factory(shared));
        assert!(driver.scan(&conn_options()).unwrap().is_empty());
    }

    #[test]
    fn test_scan_without_conn_is_empty() {
        let shared = Arc::new(Mutex::new(ScriptedSerial::new()));
        let mut driver = OlsDriver::with_factory(scripted_factory(shared));
        assert!(driver.scan(&[]).unwrap().is_empty());
    }

    fn scanned_driver(
        metadata: Option<&[u8]>,
    ) -> (OlsDriver, DeviceId, Arc<Mutex<ScriptedSerial>>) {
        let shared = Arc::new(Mutex::new(ScriptedSerial::new()));
        shared.lock().unwrap().queue(b"1SLO");
        if let Some(md) = metadata {
            shared.lock().unwrap().queue(md);
        }
        let mut driver = OlsDriver::with_factory(scripted_factory(Arc::clone(&shared)));
        let ids = driver.scan(&conn_options()).unwrap();
        let id = ids[0];
        (driver, id, shared)
    }

    #[test]
    fn test_config_limits() {
        let (mut driver, id, _shared) = scanned_driver(None);
        driver.dev_open(id).unwrap();

        // Below the four-sample minimum.
        let err = driver
            .config_set(id, Capability::LimitSamples, ConfigValue::Uint(3))
            .unwrap_err();
        assert_eq!(err.code(), -1);

        driver
            .config_set(id, Capability::LimitSamples, ConfigValue::Uint(8))
            .unwrap();

        // Out-of-range capture ratio errors and resets to zero.
        driver
            .config_set(id, Capability::CaptureRatio, ConfigValue::Uint(50))
            .unwrap();
        let err = driver
            .config_set(id, Capability::CaptureRatio, ConfigValue::Uint(101))
            .unwrap_err();
        assert_eq!(err.code(), -1);
        let inst = driver.instance(id).unwrap();
        assert_eq!(inst.devc.lock().unwrap().capture_ratio, 0);
    }

    #[test]
    fn test_config_requires_open_device() {
        let (mut driver, id, _shared) = scanned_driver(None);
        assert!(driver
            .config_set(id, Capability::LimitSamples, ConfigValue::Uint(8))
            .is_err());
    }

    #[test]
    fn test_config_unknown_cap() {
        let (mut driver, id, _shared) = scanned_driver(None);
        driver.dev_open(id).unwrap();
        let err = driver
            .config_set(id, Capability::Vdiv, ConfigValue::Uint(1))
            .unwrap_err();
        assert_eq!(err.code(), -3);
    }

    #[test]
    fn test_info_get() {
        let (driver, id, _shared) = scanned_driver(None);

        let InfoValue::Caps(caps) = driver.info_get(InfoKey::HwCaps, None).unwrap() else {
            panic!("expected caps");
        };
        assert!(caps.contains(&Capability::Rle));

        let InfoValue::Samplerates(spec) = driver.info_get(InfoKey::Samplerates, None).unwrap()
        else {
            panic!("expected samplerates");
        };
        assert_eq!(
            spec,
            SamplerateSpec::Range {
                low: 10,
                high: crate::types::mhz(200),
                step: 1
            }
        );

        let InfoValue::Uint(rate) = driver.info_get(InfoKey::CurSamplerate, Some(id)).unwrap()
        else {
            panic!("expected rate");
        };
        assert_eq!(rate, crate::types::khz(200));
        assert!(driver.info_get(InfoKey::CurSamplerate, None).is_err());
    }

    /// Collect the full datafeed for one acquisition driven through the
    /// real session loop.
    fn run_acquisition(
        driver: &mut OlsDriver,
        id: DeviceId,
        shared: &Arc<Mutex<ScriptedSerial>>,
        capture_bytes: &[u8],
    ) -> Vec<Packet> {
        let packets = Arc::new(Mutex::new(Vec::new()));
        let mut session = Session::new();
        let sink = Arc::clone(&packets);
        session.feed_mut().subscribe(Box::new(move |_, packet| {
            sink.lock().unwrap().push(packet.clone());
        }));

        driver.acquisition_start(id, &mut session).unwrap();
        shared.lock().unwrap().queue(capture_bytes);
        session.run().unwrap();
        drop(session);

        Arc::try_unwrap(packets).unwrap().into_inner().unwrap()
    }

    #[test]
    fn test_eight_sample_capture_no_trigger() {
        // Metadata reports 8 probes: one channel group.
        let (mut driver, id, shared) = scanned_driver(Some(&[0x40, 8, 0x00]));
        driver.dev_open(id).unwrap();
        driver
            .config_set(id, Capability::LimitSamples, ConfigValue::Uint(8))
            .unwrap();

        let packets = run_acquisition(
            &mut driver,
            id,
            &shared,
            &[0xa0, 0xa1, 0xa2, 0xa3, 0xa4, 0xa5, 0xa6, 0xa7],
        );

        assert_eq!(packets.len(), 4);
        let Packet::Header(_) = &packets[0] else {
            panic!("expected header first");
        };
        let Packet::MetaLogic(meta) = &packets[1] else {
            panic!("expected meta-logic");
        };
        assert_eq!(meta.num_probes, 8);
        assert_eq!(meta.samplerate, crate::types::khz(200));
        let Packet::Logic(logic) = &packets[2] else {
            panic!("expected logic");
        };
        assert_eq!(logic.unitsize(), 4);
        assert_eq!(logic.data().len(), 32);
        let mut expected = Vec::new();
        for byte in [0xa7, 0xa6, 0xa5, 0xa4, 0xa3, 0xa2, 0xa1, 0xa0] {
            expected.extend_from_slice(&[byte, 0, 0, 0]);
        }
        assert_eq!(logic.data(), &expected[..]);
        assert_eq!(packets[3], Packet::End);

        // RUN was the last command before the capture streamed in.
        let tx = shared.lock().unwrap().tx.clone();
        assert_eq!(*tx.last().unwrap(), CMD_RUN);
    }

    #[test]
    fn test_triggered_capture_slices_around_trigger() {
        let (mut driver, id, shared) = scanned_driver(Some(&[0x40, 8, 0x00]));
        driver.dev_open(id).unwrap();
        driver
            .config_set(id, Capability::LimitSamples, ConfigValue::Uint(8))
            .unwrap();
        driver
            .config_set(id, Capability::CaptureRatio, ConfigValue::Uint(50))
            .unwrap();
        driver
            .device_mut(id)
            .unwrap()
            .configure_probe(0, true, Some("1"))
            .unwrap();

        let packets = run_acquisition(
            &mut driver,
            id,
            &shared,
            &[0xa0, 0xa1, 0xa2, 0xa3, 0xa4, 0xa5, 0xa6, 0xa7],
        );

        // readcount 2, delaycount 1, trigger_at (2-1)*4 - 1 = 3.
        let kinds: Vec<_> = packets.iter().map(|p| p.kind_name()).collect();
        assert_eq!(
            kinds,
            vec!["header", "meta-logic", "logic", "trigger", "logic", "end"]
        );
        let Packet::Logic(pre) = &packets[2] else {
            panic!("expected pre-trigger logic");
        };
        let Packet::Logic(post) = &packets[4] else {
            panic!("expected post-trigger logic");
        };
        assert_eq!(pre.data().len(), 12);
        assert_eq!(post.data().len(), 20);

        // The trigger stage commands went out byte-reversed: stage 0 mask
        // 0x00000001 crosses the wire as 0x01 0x00 0x00 0x00.
        let tx = shared.lock().unwrap().tx.clone();
        let pos = tx
            .windows(5)
            .position(|w| w[0] == CMD_SET_TRIGGER_MASK[0])
            .unwrap();
        assert_eq!(&tx[pos..pos + 5], &[CMD_SET_TRIGGER_MASK[0], 1, 0, 0, 0]);
    }

    #[test]
    fn test_acquisition_stop_is_idempotent() {
        let (mut driver, id, shared) = scanned_driver(Some(&[0x40, 8, 0x00]));
        driver.dev_open(id).unwrap();
        driver
            .config_set(id, Capability::LimitSamples, ConfigValue::Uint(8))
            .unwrap();

        let packets = Arc::new(Mutex::new(Vec::new()));
        let mut session = Session::new();
        let sink = Arc::clone(&packets);
        session.feed_mut().subscribe(Box::new(move |_, packet| {
            sink.lock().unwrap().push(packet.kind_name());
        }));

        driver.acquisition_start(id, &mut session).unwrap();
        let _ = shared;
        driver.acquisition_stop(id, &mut session).unwrap();
        driver.acquisition_stop(id, &mut session).unwrap();

        assert_eq!(session.num_sources(), 0);
        let seen = packets.lock().unwrap();
        // Exactly one end despite the double stop.
        assert_eq!(seen.iter().filter(|k| **k == "end").count(), 1);
    }

    #[test]
    fn test_acquisition_requires_sample_limit() {
        let (mut driver, id, _shared) = scanned_driver(None);
        driver.dev_open(id).unwrap();
        let mut session = Session::new();
        assert!(driver.acquisition_start(id, &mut session).is_err());
    }
}
