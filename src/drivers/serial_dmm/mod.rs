//! Generic serial multimeter driver
//!
//! One driver services every meter in the DMM profile table: the profile
//! supplies the identity, serial parameters, and packet parser, and this
//! driver owns the byte-stream scanning loop. Meters send their frames
//! unsolicited a few times per second; invalid candidates are discarded
//! byte by byte until the stream realigns.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::device::{Device, DeviceId, DeviceStatus, Probe, ProbeKind};
use crate::dmm::{DmmProfile, FrameScanner, PacketParser};
use crate::driver::{
    Capability, ConfigValue, Driver, InfoKey, InfoValue, ScanOption,
};
use crate::drivers::{system_serial_factory, SerialFactory};
use crate::packet::{Analog, Header, MetaAnalog, Packet};
use crate::session::{
    Datafeed, EventSource, Interest, Session, SourceAction, SourceEvent, SourceHandle,
};
use crate::transport::serial::{ConnSpec, SerialComm, SerialTransport};
use crate::{Error, Result};

/// Poll interval while waiting for the meter to send.
const RECEIVE_INTERVAL: Duration = Duration::from_millis(50);

/// Bytes pulled off the port per callback.
const READ_CHUNK: usize = 64;

struct DmmContext {
    limit_samples: u64,
    num_samples: u64,
    end_deadline: Option<Instant>,
    acq_running: bool,
}

impl DmmContext {
    fn new() -> Self {
        Self {
            limit_samples: 0,
            num_samples: 0,
            end_deadline: None,
            acq_running: false,
        }
    }
}

struct DmmInstance {
    device: Device,
    conn: ConnSpec,
    comm: SerialComm,
    devc: Arc<Mutex<DmmContext>>,
    limit_msec: u64,
    serial: Option<Arc<Mutex<Box<dyn SerialTransport>>>>,
    source: Option<SourceHandle>,
}

/// Serial DMM driver bound to one profile from the DMM table.
pub struct SerialDmmDriver {
    profile: &'static DmmProfile,
    factory: SerialFactory,
    instances: Vec<DmmInstance>,
}

impl SerialDmmDriver {
    pub fn new(profile: &'static DmmProfile) -> Self {
        Self::with_factory(profile, system_serial_factory())
    }

    pub fn with_factory(profile: &'static DmmProfile, factory: SerialFactory) -> Self {
        Self {
            profile,
            factory,
            instances: Vec::new(),
        }
    }

    fn instance(&self, id: DeviceId) -> Result<&DmmInstance> {
        if id.driver != self.profile.driver_name {
            return Err(Error::Bug(format!("device {id} handed to the wrong driver")));
        }
        self.instances
            .get(id.index)
            .ok_or_else(|| Error::Arg(format!("unknown device {id}")))
    }

    fn instance_mut(&mut self, id: DeviceId) -> Result<&mut DmmInstance> {
        if id.driver != self.profile.driver_name {
            return Err(Error::Bug(format!("device {id} handed to the wrong driver")));
        }
        self.instances
            .get_mut(id.index)
            .ok_or_else(|| Error::Arg(format!("unknown device {id}")))
    }
}

impl Driver for SerialDmmDriver {
    fn name(&self) -> &'static str {
        self.profile.driver_name
    }

    fn longname(&self) -> &'static str {
        self.profile.device
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
            debug!("{}: no connection option given", self.profile.driver_name);
            return Ok(Vec::new());
        };
        let conn: ConnSpec = conn.parse()?;
        let comm: SerialComm = serialcomm
            .as_deref()
            .unwrap_or(self.profile.serialcomm)
            .parse()?;

        // The meter never identifies itself; opening the port is the only
        // check a scan can do.
        let _probe = (self.factory)(&conn, &comm)?;
        info!(
            "{}: assuming {} {} on {conn:?}",
            self.profile.driver_name, self.profile.vendor, self.profile.device
        );

        let id = DeviceId {
            driver: self.profile.driver_name,
            index: self.instances.len(),
        };
        let mut device = Device::new(id, self.profile.vendor, self.profile.device, "");
        device
            .probes
            .push(Probe::new(0, ProbeKind::Analog, true, "P1")?);

        self.instances.push(DmmInstance {
            device,
            conn,
            comm,
            devc: Arc::new(Mutex::new(DmmContext::new())),
            limit_msec: 0,
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
        if id.driver != self.profile.driver_name {
            return Err(Error::Bug(format!("device {id} handed to the wrong driver")));
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

    fn info_get(&self, key: InfoKey, _dev: Option<DeviceId>) -> Result<InfoValue> {
        match key {
            InfoKey::HwOpts => Ok(InfoValue::Strings(vec![
                "conn".into(),
                "serialcomm".into(),
            ])),
            InfoKey::HwCaps => Ok(InfoValue::Caps(vec![
                Capability::Multimeter,
                Capability::LimitSamples,
                Capability::LimitMsec,
                Capability::Continuous,
            ])),
            InfoKey::NumProbes => Ok(InfoValue::Uint(1)),
            InfoKey::ProbeNames => Ok(InfoValue::Strings(vec!["P1".into()])),
            _ => Err(Error::Arg(format!(
                "{} does not provide {key:?}",
                self.profile.driver_name
            ))),
        }
    }

    fn config_set(&mut self, id: DeviceId, cap: Capability, value: ConfigValue) -> Result<()> {
        let inst = self.instance_mut(id)?;
        if inst.device.status != DeviceStatus::Active {
            return Err(Error::Dev(format!("device {id} is not open")));
        }
        match cap {
            Capability::LimitSamples => {
                let limit = value.as_uint()?;
                if limit == 0 {
                    return Err(Error::Arg("sample limit must be nonzero".into()));
                }
                inst.devc.lock().unwrap().limit_samples = limit;
                Ok(())
            }
            Capability::LimitMsec => {
                let msec = value.as_uint()?;
                if msec == 0 {
                    return Err(Error::Arg("time limit must be nonzero".into()));
                }
                inst.limit_msec = msec;
                Ok(())
            }
            Capability::Continuous => {
                // Continuous is the natural mode: clearing the limits is
                // all it takes.
                if value.as_bool()? {
                    let mut devc = inst.devc.lock().unwrap();
                    devc.limit_samples = 0;
                    inst.limit_msec = 0;
                }
                Ok(())
            }
            other => Err(Error::Arg(format!(
                "{} does not support {other:?}",
                self.profile.driver_name
            ))),
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

        {
            let mut devc = inst.devc.lock().unwrap();
            devc.num_samples = 0;
            devc.end_deadline = if inst.limit_msec > 0 {
                Some(Instant::now() + Duration::from_millis(inst.limit_msec))
            } else {
                None
            };
            devc.acq_running = true;
        }

        let handle = session.next_handle();
        inst.source = Some(handle);
        session.source_add(
            handle,
            Interest::READ,
            Some(RECEIVE_INTERVAL),
            Box::new(DmmAcquisition {
                device: id,
                devc: Arc::clone(&inst.devc),
                serial,
                parser: self.profile.parser,
                scanner: FrameScanner::new(self.profile.parser.packet_size()),
            }),
        );

        session.feed_mut().send(id, &Packet::Header(Header::new()));
        session
            .feed_mut()
            .send(id, &Packet::MetaAnalog(MetaAnalog { num_probes: 1 }));
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
            inst.device.status = DeviceStatus::Active;
        }
        Ok(())
    }
}

struct DmmAcquisition {
    device: DeviceId,
    devc: Arc<Mutex<DmmContext>>,
    serial: Arc<Mutex<Box<dyn SerialTransport>>>,
    parser: &'static dyn PacketParser,
    scanner: FrameScanner,
}

impl DmmAcquisition {
    fn limits_reached(devc: &DmmContext) -> bool {
        if devc.limit_samples > 0 && devc.num_samples >= devc.limit_samples {
            return true;
        }
        devc.end_deadline.is_some_and(|d| Instant::now() >= d)
    }
}

impl EventSource for DmmAcquisition {
    fn ready(&mut self) -> Result<bool> {
        Ok(self.serial.lock().unwrap().bytes_available()? > 0)
    }

    fn dispatch(&mut self, event: SourceEvent, feed: &mut Datafeed) -> Result<SourceAction> {
        let mut devc = self.devc.lock().unwrap();
        if !devc.acq_running {
            return Ok(SourceAction::Remove);
        }

        if event == SourceEvent::Ready {
            let mut chunk = [0u8; READ_CHUNK];
            let n = self.serial.lock().unwrap().read(&mut chunk)?;
            self.scanner.push(&chunk[..n]);

            while let Some(frame) = self.scanner.next_frame(self.parser) {
                let reading = match self.parser.parse(&frame) {
                    Ok(reading) => reading,
                    Err(e) => {
                        debug!("{}: discarding undecodable frame: {e}", self.device);
                        continue;
                    }
                };
                feed.send(
                    self.device,
                    &Packet::Analog(Analog::new(
                        reading.mq,
                        reading.unit,
                        reading.mqflags,
                        vec![reading.value],
                    )),
                );
                devc.num_samples += 1;
                if devc.limit_samples > 0 && devc.num_samples >= devc.limit_samples {
                    break;
                }
            }
        }

        if Self::limits_reached(&devc) {
            devc.acq_running = false;
            drop(devc);
            feed.send(self.device, &Packet::End);
            return Ok(SourceAction::Remove);
        }
        Ok(SourceAction::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dmm::profile;
    use crate::transport::serial::testing::ScriptedSerial;
    use crate::types::{Mq, MqFlags, Unit};

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

    fn scripted_driver() -> (SerialDmmDriver, DeviceId, Arc<Mutex<ScriptedSerial>>) {
        let shared = Arc::new(Mutex::new(ScriptedSerial::new()));
        let factory_shared = Arc::clone(&shared);
        let factory: SerialFactory =
            Box::new(move |_, _| Ok(Box::new(SharedSerial(Arc::clone(&factory_shared))) as Box<_>));

        let mut driver =
            SerialDmmDriver::with_factory(profile("RadioShack", "22-812").unwrap(), factory);
        let ids = driver
            .scan(&[ScanOption::Conn("/dev/ttyUSB0".into())])
            .unwrap();
        let id = ids[0];
        (driver, id, shared)
    }

    /// A 22-812 frame showing 0.000 in DC volts mode.
    fn dc_volts_frame() -> [u8; 9] {
        let mut f = [0x00, 0x02, 0x00, 0x00, 0xd7, 0xd7, 0xd7, 0x00, 0x00];
        let sum: u8 = f[..8]
            .iter()
            .fold(0u8, |acc, b| acc.wrapping_add(*b))
            .wrapping_add(57);
        f[8] = sum;
        f
    }

    fn run_acquisition(
        driver: &mut SerialDmmDriver,
        id: DeviceId,
        shared: &Arc<Mutex<ScriptedSerial>>,
        stream: &[u8],
    ) -> Vec<Packet> {
        let packets = Arc::new(Mutex::new(Vec::new()));
        let mut session = Session::new();
        let sink = Arc::clone(&packets);
        session.feed_mut().subscribe(Box::new(move |_, packet| {
            sink.lock().unwrap().push(packet.clone());
        }));

        driver.acquisition_start(id, &mut session).unwrap();
        shared.lock().unwrap().queue(stream);
        session.run().unwrap();
        drop(session);
        Arc::try_unwrap(packets).unwrap().into_inner().unwrap()
    }

    #[test]
    fn test_scan_creates_one_analog_probe() {
        let (driver, id, _shared) = scripted_driver();
        let device = driver.device(id).unwrap();
        assert_eq!(device.vendor, "RadioShack");
        assert_eq!(device.model, "22-812");
        assert_eq!(device.probes.len(), 1);
        assert_eq!(device.probes[0].kind, ProbeKind::Analog);
        assert_eq!(device.probes[0].name, "P1");
    }

    #[test]
    fn test_dc_volts_reading_through_the_feed() {
        let (mut driver, id, shared) = scripted_driver();
        driver.dev_open(id).unwrap();
        driver
            .config_set(id, Capability::LimitSamples, ConfigValue::Uint(1))
            .unwrap();

        let packets = run_acquisition(&mut driver, id, &shared, &dc_volts_frame());

        let kinds: Vec<_> = packets.iter().map(|p| p.kind_name()).collect();
        assert_eq!(kinds, vec!["header", "meta-analog", "analog", "end"]);
        let Packet::Analog(analog) = &packets[2] else {
            panic!("expected analog packet");
        };
        assert_eq!(analog.mq, Mq::Voltage);
        assert_eq!(analog.unit, Unit::Volt);
        assert!(analog.mqflags.contains(MqFlags::DC));
        assert_eq!(analog.data, vec![0.0]);
    }

    #[test]
    fn test_rejected_frame_resynchronizes() {
        let (mut driver, id, shared) = scripted_driver();
        driver.dev_open(id).unwrap();
        driver
            .config_set(id, Capability::LimitSamples, ConfigValue::Uint(1))
            .unwrap();

        // Same frame but with both kilo and mega lit: checksum passes,
        // the selection check rejects it, and the scanner slides on to
        // the valid frame that follows.
        let mut bad = dc_volts_frame();
        bad[1] = 0x30;
        bad[8] = bad[8].wrapping_add(0x2e); // 0x30 - 0x02
        let mut stream = bad.to_vec();
        stream.extend_from_slice(&dc_volts_frame());

        let packets = run_acquisition(&mut driver, id, &shared, &stream);
        let analog_count = packets
            .iter()
            .filter(|p| matches!(p, Packet::Analog(_)))
            .count();
        assert_eq!(analog_count, 1);
    }

    #[test]
    fn test_time_limit_ends_acquisition() {
        let (mut driver, id, shared) = scripted_driver();
        driver.dev_open(id).unwrap();
        driver
            .config_set(id, Capability::LimitMsec, ConfigValue::Uint(1))
            .unwrap();

        let packets = run_acquisition(&mut driver, id, &shared, &[]);
        let kinds: Vec<_> = packets.iter().map(|p| p.kind_name()).collect();
        assert_eq!(kinds, vec!["header", "meta-analog", "end"]);
    }

    #[test]
    fn test_config_rejects_zero_limits() {
        let (mut driver, id, _shared) = scripted_driver();
        driver.dev_open(id).unwrap();
        assert!(driver
            .config_set(id, Capability::LimitSamples, ConfigValue::Uint(0))
            .is_err());
        assert!(driver
            .config_set(id, Capability::LimitMsec, ConfigValue::Uint(0))
            .is_err());
    }
}
