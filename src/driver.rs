//! Hardware driver interface
//!
//! Every hardware backend implements [`Driver`]: discovery, lifecycle,
//! capability-driven configuration and acquisition control. Drivers are
//! collected in a [`Registry`] value constructed explicitly at startup;
//! there is no ambient global driver list.

use tracing::{debug, info};

use crate::device::{Device, DeviceId};
use crate::session::Session;
use crate::types::Rational;
use crate::{Error, Result};

/// A scan option: a hint passed to [`Driver::scan`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOption {
    /// How to connect: an OS device path (`/dev/ttyACM0`), a USB
    /// `<bus>.<addr>` pair in decimal, or `<vid>.<pid>` in hex.
    Conn(String),
    /// Serial communication spec, e.g. `9600/8n1`.
    SerialComm(String),
    /// Model hint for drivers that cannot detect the exact model.
    Model(String),
}

/// Device class and configuration capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    // Device classes
    LogicAnalyzer,
    Oscilloscope,
    Multimeter,

    // Configuration
    Samplerate,
    /// Pre/post trigger ratio in percent, 0..=100.
    CaptureRatio,
    LimitSamples,
    LimitMsec,
    LimitFrames,
    Continuous,
    Rle,
    TriggerSlope,
    TriggerSource,
    HorizTriggerPos,
    BufferSize,
    TimeBase,
    Filter,
    Vdiv,
    Coupling,
    PatternMode,
    SessionFile,
    CaptureFile,
    CaptureUnitSize,
    CaptureNumProbes,
}

/// A configuration value accepted by [`Driver::config_set`].
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValue {
    Uint(u64),
    Bool(bool),
    Float(f64),
    Str(String),
    Rational(Rational),
}

impl ConfigValue {
    pub fn as_uint(&self) -> Result<u64> {
        match self {
            ConfigValue::Uint(v) => Ok(*v),
            other => Err(Error::Arg(format!("expected uint value, got {other:?}"))),
        }
    }

    pub fn as_bool(&self) -> Result<bool> {
        match self {
            ConfigValue::Bool(v) => Ok(*v),
            other => Err(Error::Arg(format!("expected bool value, got {other:?}"))),
        }
    }

    pub fn as_str(&self) -> Result<&str> {
        match self {
            ConfigValue::Str(v) => Ok(v),
            other => Err(Error::Arg(format!("expected string value, got {other:?}"))),
        }
    }

    pub fn as_float(&self) -> Result<f64> {
        match self {
            ConfigValue::Float(v) => Ok(*v),
            other => Err(Error::Arg(format!("expected float value, got {other:?}"))),
        }
    }
}

/// Keys for [`Driver::info_get`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoKey {
    /// Scan options supported by the driver.
    HwOpts,
    /// Capabilities supported by the device.
    HwCaps,
    NumProbes,
    ProbeNames,
    Samplerates,
    /// Trigger characters supported, out of "01rfc".
    TriggerAlphabet,
    CurSamplerate,
    Patterns,
    BufferSizes,
    TimeBases,
    TriggerSources,
    Filters,
    Vdivs,
    Coupling,
}

/// Samplerates a device supports: either a stepped range or an enumerated
/// list, never both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SamplerateSpec {
    Range { low: u64, high: u64, step: u64 },
    List(Vec<u64>),
}

impl SamplerateSpec {
    pub fn supports(&self, rate: u64) -> bool {
        match self {
            SamplerateSpec::Range { low, high, .. } => rate >= *low && rate <= *high,
            SamplerateSpec::List(rates) => rates.contains(&rate),
        }
    }
}

/// Values returned from [`Driver::info_get`].
#[derive(Debug, Clone, PartialEq)]
pub enum InfoValue {
    Caps(Vec<Capability>),
    Uint(u64),
    Strings(Vec<String>),
    Samplerates(SamplerateSpec),
    TriggerAlphabet(&'static str),
    UintList(Vec<u64>),
}

/// The uniform interface every hardware backend honors.
///
/// A driver owns its device instances and all driver-private acquisition
/// state. Devices are addressed by the [`DeviceId`] values returned from
/// [`Driver::scan`].
pub trait Driver: Send {
    /// Short name, unique within a registry.
    fn name(&self) -> &'static str;

    fn longname(&self) -> &'static str;

    /// One-time driver initialization.
    fn init(&mut self) -> Result<()> {
        Ok(())
    }

    /// Close and drop all instances. Logs and continues over per-instance
    /// failures; returns the first error observed.
    fn cleanup(&mut self) -> Result<()>;

    /// Probe for devices. Newly found instances are appended to the
    /// driver's instance list and their ids returned.
    fn scan(&mut self, options: &[ScanOption]) -> Result<Vec<DeviceId>>;

    /// Ids of all known instances, in scan order.
    fn dev_list(&self) -> Vec<DeviceId>;

    fn device(&self, id: DeviceId) -> Option<&Device>;

    fn device_mut(&mut self, id: DeviceId) -> Option<&mut Device>;

    fn dev_open(&mut self, id: DeviceId) -> Result<()>;

    fn dev_close(&mut self, id: DeviceId) -> Result<()>;

    /// Query driver or device information. `dev` is required for keys that
    /// are per-device (e.g. [`InfoKey::CurSamplerate`]).
    fn info_get(&self, key: InfoKey, dev: Option<DeviceId>) -> Result<InfoValue>;

    /// Set a configuration value on an open device. Rejected values leave
    /// the device state unchanged unless documented otherwise.
    fn config_set(&mut self, id: DeviceId, cap: Capability, value: ConfigValue) -> Result<()>;

    /// Program the hardware and register an event source with the session.
    /// Emits `Header` and the appropriate `Meta*` packet on success.
    fn acquisition_start(&mut self, id: DeviceId, session: &mut Session) -> Result<()>;

    /// Request the acquisition to wind down: flush, emit `End`, unregister
    /// the source. Idempotent.
    fn acquisition_stop(&mut self, id: DeviceId, session: &mut Session) -> Result<()>;
}

/// Explicitly-constructed collection of drivers.
pub struct Registry {
    drivers: Vec<Box<dyn Driver>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            drivers: Vec::new(),
        }
    }

    /// Register and initialize a driver. Driver names must be unique.
    pub fn register(&mut self, mut driver: Box<dyn Driver>) -> Result<()> {
        if self.drivers.iter().any(|d| d.name() == driver.name()) {
            return Err(Error::Arg(format!(
                "driver '{}' already registered",
                driver.name()
            )));
        }
        driver.init()?;
        info!("registered driver '{}' ({})", driver.name(), driver.longname());
        self.drivers.push(driver);
        Ok(())
    }

    pub fn driver(&self, name: &str) -> Option<&dyn Driver> {
        self.drivers
            .iter()
            .find(|d| d.name() == name)
            .map(|d| d.as_ref())
    }

    pub fn driver_mut(&mut self, name: &str) -> Option<&mut (dyn Driver + 'static)> {
        self.drivers
            .iter_mut()
            .find(|d| d.name() == name)
            .map(|d| d.as_mut())
    }

    pub fn drivers(&self) -> impl Iterator<Item = &dyn Driver> {
        self.drivers.iter().map(|d| d.as_ref())
    }

    /// Clean up every driver, logging failures and continuing. Returns the
    /// first error observed, if any.
    pub fn cleanup_all(&mut self) -> Result<()> {
        let mut first_err = None;
        for driver in &mut self.drivers {
            if let Err(e) = driver.cleanup() {
                debug!("cleanup of driver '{}' failed: {e}", driver.name());
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullDriver;

    impl Driver for NullDriver {
        fn name(&self) -> &'static str {
            "null"
        }

        fn longname(&self) -> &'static str {
            "Null driver"
        }

        fn cleanup(&mut self) -> Result<()> {
            Ok(())
        }

        fn scan(&mut self, _options: &[ScanOption]) -> Result<Vec<DeviceId>> {
            Ok(Vec::new())
        }

        fn dev_list(&self) -> Vec<DeviceId> {
            Vec::new()
        }

        fn device(&self, _id: DeviceId) -> Option<&Device> {
            None
        }

        fn device_mut(&mut self, _id: DeviceId) -> Option<&mut Device> {
            None
        }

        fn dev_open(&mut self, _id: DeviceId) -> Result<()> {
            Ok(())
        }

        fn dev_close(&mut self, _id: DeviceId) -> Result<()> {
            Ok(())
        }

        fn info_get(&self, _key: InfoKey, _dev: Option<DeviceId>) -> Result<InfoValue> {
            Err(Error::Arg("unsupported".into()))
        }

        fn config_set(
            &mut self,
            _id: DeviceId,
            _cap: Capability,
            _value: ConfigValue,
        ) -> Result<()> {
            Err(Error::Arg("unsupported".into()))
        }

        fn acquisition_start(&mut self, _id: DeviceId, _session: &mut Session) -> Result<()> {
            Err(Error::Dev("no device".into()))
        }

        fn acquisition_stop(&mut self, _id: DeviceId, _session: &mut Session) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_registry_rejects_duplicate_names() {
        let mut registry = Registry::new();
        registry.register(Box::new(NullDriver)).unwrap();
        let err = registry.register(Box::new(NullDriver)).unwrap_err();
        assert_eq!(err.code(), -3);
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = Registry::new();
        registry.register(Box::new(NullDriver)).unwrap();
        assert!(registry.driver("null").is_some());
        assert!(registry.driver("missing").is_none());
        assert_eq!(registry.drivers().count(), 1);
    }

    #[test]
    fn test_samplerate_spec_supports() {
        let range = SamplerateSpec::Range {
            low: 10,
            high: 1000,
            step: 1,
        };
        assert!(range.supports(10));
        assert!(range.supports(1000));
        assert!(!range.supports(9));
        assert!(!range.supports(1001));

        let list = SamplerateSpec::List(vec![100, 200]);
        assert!(list.supports(200));
        assert!(!list.supports(150));
    }

    #[test]
    fn test_config_value_accessors() {
        assert_eq!(ConfigValue::Uint(7).as_uint().unwrap(), 7);
        assert!(ConfigValue::Uint(7).as_bool().is_err());
        assert!(ConfigValue::Bool(true).as_bool().unwrap());
        assert_eq!(ConfigValue::Str("x".into()).as_str().unwrap(), "x");
    }
}
