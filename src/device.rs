//! Device instances and probes

use std::fmt;

use crate::{Error, Result};

/// Hard limit on probes per device, bounded by the u64 probe bitset.
pub const MAX_PROBES: usize = 64;

/// Maximum accepted probe name length.
pub const MAX_PROBE_NAME_LEN: usize = 32;

/// Characters accepted in a trigger expression: level, edge, change.
pub const TRIGGER_ALPHABET: &str = "01rfc";

/// Identity of a device instance: the owning driver plus the instance
/// index within that driver. Stable for the lifetime of the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId {
    pub driver: &'static str,
    pub index: usize,
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}#{}", self.driver, self.index)
    }
}

/// Lifecycle status of a device instance.
///
/// Inactive -> Active on a successful open; Active -> Stopping on stop;
/// Stopping -> Inactive once the end-of-stream packet has drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    NotFound,
    Initializing,
    Inactive,
    Active,
    Stopping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    Logic,
    Analog,
}

/// A single logic or analog input on an instrument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Probe {
    pub index: usize,
    pub kind: ProbeKind,
    pub enabled: bool,
    pub name: String,
    /// Trigger expression over [`TRIGGER_ALPHABET`]; its length is the
    /// number of trigger stages this probe participates in.
    pub trigger: Option<String>,
}

impl Probe {
    pub fn new(index: usize, kind: ProbeKind, enabled: bool, name: &str) -> Result<Self> {
        if index >= MAX_PROBES {
            return Err(Error::Arg(format!(
                "probe index {index} out of range (max {MAX_PROBES})"
            )));
        }
        if name.len() > MAX_PROBE_NAME_LEN {
            return Err(Error::Arg(format!(
                "probe name '{name}' exceeds {MAX_PROBE_NAME_LEN} chars"
            )));
        }
        Ok(Self {
            index,
            kind,
            enabled,
            name: name.to_string(),
            trigger: None,
        })
    }

    /// Set or clear this probe's trigger expression, validating the
    /// alphabet. Stage-count limits are enforced by the driver.
    pub fn set_trigger(&mut self, expr: Option<&str>) -> Result<()> {
        if let Some(expr) = expr {
            if expr.is_empty() {
                return Err(Error::Arg("empty trigger expression".into()));
            }
            for c in expr.chars() {
                if !TRIGGER_ALPHABET.contains(c) {
                    return Err(Error::Arg(format!(
                        "invalid trigger character '{c}' (expected one of {TRIGGER_ALPHABET})"
                    )));
                }
            }
            self.trigger = Some(expr.to_string());
        } else {
            self.trigger = None;
        }
        Ok(())
    }
}

/// A device instance produced by a driver scan.
///
/// Driver-private acquisition state is not kept here; each driver owns its
/// own per-instance context alongside the `Device`.
#[derive(Debug, Clone)]
pub struct Device {
    pub id: DeviceId,
    pub status: DeviceStatus,
    pub vendor: String,
    pub model: String,
    pub version: String,
    pub probes: Vec<Probe>,
}

impl Device {
    pub fn new(id: DeviceId, vendor: &str, model: &str, version: &str) -> Self {
        Self {
            id,
            status: DeviceStatus::Inactive,
            vendor: vendor.to_string(),
            model: model.to_string(),
            version: version.to_string(),
            probes: Vec::new(),
        }
    }

    pub fn probe(&self, index: usize) -> Option<&Probe> {
        self.probes.iter().find(|p| p.index == index)
    }

    pub fn probe_mut(&mut self, index: usize) -> Option<&mut Probe> {
        self.probes.iter_mut().find(|p| p.index == index)
    }

    /// Enable/disable a probe and set its trigger expression in one call.
    pub fn configure_probe(
        &mut self,
        index: usize,
        enabled: bool,
        trigger: Option<&str>,
    ) -> Result<()> {
        let probe = self
            .probe_mut(index)
            .ok_or_else(|| Error::Arg(format!("no probe with index {index}")))?;
        probe.enabled = enabled;
        probe.set_trigger(trigger)
    }

    pub fn num_enabled_probes(&self) -> usize {
        self.probes.iter().filter(|p| p.enabled).count()
    }
}
