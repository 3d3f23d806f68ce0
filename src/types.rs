//! Core measurement types: quantities, units, flags, rationals

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use crate::{Error, Result};

/// Samplerate helpers, in Hz.
pub const fn hz(n: u64) -> u64 {
    n
}

pub const fn khz(n: u64) -> u64 {
    n * 1_000
}

pub const fn mhz(n: u64) -> u64 {
    n * 1_000_000
}

pub const fn ghz(n: u64) -> u64 {
    n * 1_000_000_000
}

/// Measured quantity: what physical value a reading represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mq {
    Voltage,
    Current,
    Resistance,
    Capacitance,
    Temperature,
    Frequency,
    DutyCycle,
    Continuity,
    PulseWidth,
    Conductance,
    /// Electrical power, usually in W or dBm.
    Power,
    /// Gain (a transistor's hFE, for example).
    Gain,
    SoundPressureLevel,
    GasConcentration,
    RelativeHumidity,
}

/// Unit in which a measured quantity is expressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Unit {
    Volt,
    Ampere,
    Ohm,
    Farad,
    Kelvin,
    Celsius,
    Fahrenheit,
    Hertz,
    Percentage,
    /// Readings that are only meaningfully true/false (continuity beep,
    /// logic HI/LOW). The value is 1.0 or 0.0.
    Boolean,
    Second,
    Siemens,
    /// Power in decibels referenced to 1 milliwatt.
    DecibelMw,
    /// Voltage in decibels referenced to 1 volt.
    DecibelVolt,
    /// Intrinsically unitless quantities such as ratios and gains.
    Unitless,
    /// Sound pressure level relative to 20 micropascals.
    DecibelSpl,
    /// Normalized (0..1) concentration of a substance.
    Concentration,
}

/// Bitset of modifiers attached to an analog reading (AC/DC, hold, range,
/// SPL weighting, and so on).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct MqFlags(u64);

impl MqFlags {
    pub const AC: MqFlags = MqFlags(0x0000_0001);
    pub const DC: MqFlags = MqFlags(0x0000_0002);
    pub const RMS: MqFlags = MqFlags(0x0000_0004);
    /// Value is the voltage drop across a diode, or NaN.
    pub const DIODE: MqFlags = MqFlags(0x0000_0008);
    /// Device is in "hold" mode, repeating the last measurement.
    pub const HOLD: MqFlags = MqFlags(0x0000_0010);
    /// Device only updates on a new maximum value.
    pub const MAX: MqFlags = MqFlags(0x0000_0020);
    /// Device only updates on a new minimum value.
    pub const MIN: MqFlags = MqFlags(0x0000_0040);
    pub const AUTORANGE: MqFlags = MqFlags(0x0000_0080);
    pub const RELATIVE: MqFlags = MqFlags(0x0000_0100);
    pub const SPL_FREQ_WEIGHT_A: MqFlags = MqFlags(0x0000_0200);
    pub const SPL_FREQ_WEIGHT_C: MqFlags = MqFlags(0x0000_0400);
    pub const SPL_FREQ_WEIGHT_Z: MqFlags = MqFlags(0x0000_0800);
    pub const SPL_FREQ_WEIGHT_FLAT: MqFlags = MqFlags(0x0000_1000);
    pub const SPL_TIME_WEIGHT_S: MqFlags = MqFlags(0x0000_2000);
    pub const SPL_TIME_WEIGHT_F: MqFlags = MqFlags(0x0000_4000);
    /// Time-averaged sound pressure level (LAT / LEQ).
    pub const SPL_LAT: MqFlags = MqFlags(0x0000_8000);
    /// Percentage of measurements over a preset alarm level.
    pub const SPL_PCT_OVER_ALARM: MqFlags = MqFlags(0x0001_0000);

    pub const fn empty() -> Self {
        MqFlags(0)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: MqFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: MqFlags) {
        self.0 |= other.0;
    }
}

impl BitOr for MqFlags {
    type Output = MqFlags;

    fn bitor(self, rhs: MqFlags) -> MqFlags {
        MqFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for MqFlags {
    fn bitor_assign(&mut self, rhs: MqFlags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for MqFlags {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "MqFlags(0x{:x})", self.0)
    }
}

/// Rational number with a u64 numerator and nonzero u64 denominator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rational {
    pub p: u64,
    pub q: u64,
}

impl Rational {
    pub fn new(p: u64, q: u64) -> Result<Self> {
        if q == 0 {
            return Err(Error::Arg("rational denominator must be nonzero".into()));
        }
        Ok(Self { p, q })
    }

    pub fn as_f64(self) -> f64 {
        self.p as f64 / self.q as f64
    }
}

impl fmt::Display for Rational {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.p, self.q)
    }
}
