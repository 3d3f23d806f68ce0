//! RadioShack 22-812 protocol decoder
//!
//! The meter sends 9-byte frames that are a 1:1 mapping of its LCD
//! segments, hence the name rs9lcd. Layout:
//!
//! `mode, ind1, ind2, digit4, digit3, digit2, digit1, info, checksum`
//!
//! `digit1` is the leftmost (most significant) display digit and `digit4`
//! the rightmost. The meter never identifies itself, so every possible
//! check is applied before a frame is accepted: mode range, checksum, and
//! mutual exclusion of the multiplier and quantity indicator bits.

use tracing::debug;

use crate::dmm::{PacketParser, Reading};
use crate::types::{Mq, MqFlags, Unit};
use crate::{Error, Result};

pub const PACKET_SIZE: usize = 9;

// Indicator byte 1.
const IND1_HZ: u8 = 0x80;
const IND1_OHM: u8 = 0x40;
const IND1_KILO: u8 = 0x20;
const IND1_MEGA: u8 = 0x10;
const IND1_FARAD: u8 = 0x08;
const IND1_AMP: u8 = 0x04;
const IND1_VOLT: u8 = 0x02;
const IND1_MILI: u8 = 0x01;

// Indicator byte 2.
const IND2_MICRO: u8 = 0x80;
const IND2_NANO: u8 = 0x40;
const IND2_DBM: u8 = 0x20;
const IND2_SEC: u8 = 0x10;
const IND2_DUTY: u8 = 0x08;
const IND2_HFE: u8 = 0x04;
const IND2_MIN: u8 = 0x01;

// Info byte.
const INFO_HOLD: u8 = 0x10;
const INFO_NEG: u8 = 0x08;
const INFO_AUTO: u8 = 0x01;

/// Digit 4 carries the MAX flag in its decimal-point position.
const DIG4_MAX: u8 = 0x08;
/// Mask removing the decimal point from a digit.
const DP_MASK: u8 = 0x08;

// 7-segment glyphs.
const LCD_0: u8 = 0xd7;
const LCD_1: u8 = 0x50;
const LCD_2: u8 = 0xb5;
const LCD_3: u8 = 0xf1;
const LCD_4: u8 = 0x72;
const LCD_5: u8 = 0xe3;
const LCD_6: u8 = 0xe7;
const LCD_7: u8 = 0x51;
const LCD_8: u8 = 0xf7;
const LCD_9: u8 = 0xf3;
const LCD_C: u8 = 0x87;
const LCD_LOWER_H: u8 = 0x66;
const LCD_H: u8 = 0x76;

const MODE_INVALID: u8 = 26;

/// The meter's rotary-switch/selection modes, as encoded in byte 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    DcV,
    AcV,
    DcMicroAmp,
    DcMilliAmp,
    DcAmp,
    AcMicroAmp,
    AcMilliAmp,
    AcAmp,
    Ohm,
    Farad,
    Hz,
    VoltHz,
    AmpHz,
    Duty,
    VoltDuty,
    AmpDuty,
    Width,
    VoltWidth,
    AmpWidth,
    Diode,
    Continuity,
    Hfe,
    Logic,
    Dbm,
    Temp,
}

impl Mode {
    fn from_raw(raw: u8) -> Option<Mode> {
        Some(match raw {
            0 => Mode::DcV,
            1 => Mode::AcV,
            2 => Mode::DcMicroAmp,
            3 => Mode::DcMilliAmp,
            4 => Mode::DcAmp,
            5 => Mode::AcMicroAmp,
            6 => Mode::AcMilliAmp,
            7 => Mode::AcAmp,
            8 => Mode::Ohm,
            9 => Mode::Farad,
            10 => Mode::Hz,
            11 => Mode::VoltHz,
            12 => Mode::AmpHz,
            13 => Mode::Duty,
            14 => Mode::VoltDuty,
            15 => Mode::AmpDuty,
            16 => Mode::Width,
            17 => Mode::VoltWidth,
            18 => Mode::AmpWidth,
            19 => Mode::Diode,
            20 => Mode::Continuity,
            21 => Mode::Hfe,
            22 => Mode::Logic,
            23 => Mode::Dbm,
            // 24 is a gap in the mode table.
            25 => Mode::Temp,
            _ => return None,
        })
    }
}

/// Field accessors over a raw 9-byte frame.
#[derive(Clone, Copy)]
struct Frame<'a>(&'a [u8]);

impl<'a> Frame<'a> {
    fn mode(self) -> u8 {
        self.0[0]
    }

    fn ind1(self) -> u8 {
        self.0[1]
    }

    fn ind2(self) -> u8 {
        self.0[2]
    }

    /// Digits in frame order: index 0 is digit4 (rightmost, least
    /// significant), index 3 is digit1 (leftmost, most significant).
    fn digit(self, i: usize) -> u8 {
        self.0[3 + i]
    }

    fn digit4(self) -> u8 {
        self.0[3]
    }

    fn digit2(self) -> u8 {
        self.0[5]
    }

    fn info(self) -> u8 {
        self.0[7]
    }

    fn checksum(self) -> u8 {
        self.0[8]
    }
}

fn checksum_valid(frame: Frame) -> bool {
    let sum: u8 = frame.0[..PACKET_SIZE - 1]
        .iter()
        .fold(0u8, |acc, b| acc.wrapping_add(*b))
        // The protocol adds this funky constant to the checksum.
        .wrapping_add(57);
    sum == frame.checksum()
}

/// At most one multiplier and one measured-quantity indicator may be lit.
fn selection_good(frame: Frame) -> bool {
    let multipliers = [
        frame.ind1() & IND1_KILO,
        frame.ind1() & IND1_MEGA,
        frame.ind1() & IND1_MILI,
        frame.ind2() & IND2_MICRO,
        frame.ind2() & IND2_NANO,
    ];
    if multipliers.iter().filter(|b| **b != 0).count() > 1 {
        debug!("more than one multiplier indicator lit");
        return false;
    }

    let quantities = [
        frame.ind1() & IND1_HZ,
        frame.ind1() & IND1_OHM,
        frame.ind1() & IND1_FARAD,
        frame.ind1() & IND1_AMP,
        frame.ind1() & IND1_VOLT,
        frame.ind2() & IND2_DBM,
        frame.ind2() & IND2_SEC,
        frame.ind2() & IND2_DUTY,
        frame.ind2() & IND2_HFE,
    ];
    if quantities.iter().filter(|b| **b != 0).count() > 1 {
        debug!("more than one quantity indicator lit");
        return false;
    }

    true
}

/// Map a 7-segment pattern (decimal point stripped) to its digit. Unknown
/// patterns (the display also shows letters in some modes) yield `None`
/// and the value decodes to NaN.
fn decode_digit(raw: u8) -> Option<u8> {
    match raw & !DP_MASK {
        0x00 | LCD_0 => Some(0),
        LCD_1 => Some(1),
        LCD_2 => Some(2),
        LCD_3 => Some(3),
        LCD_4 => Some(4),
        LCD_5 => Some(5),
        LCD_6 => Some(6),
        LCD_7 => Some(7),
        LCD_8 => Some(8),
        LCD_9 => Some(9),
        other => {
            debug!("unknown digit segments 0x{other:02x}");
            None
        }
    }
}

/// Reassemble the display value: digits left to right, scaled by the
/// decimal-point position, then by the lit multiplier, then negated.
///
/// `skip_last` drops the rightmost digit; temperature mode uses it because
/// digit 4 shows the C/F scale glyph instead of a number.
fn lcd_to_double(frame: Frame, skip_last: bool) -> f64 {
    let end = if skip_last { 1 } else { 0 };
    let mut rawval = 0.0f64;
    let mut multiplier = 1.0f64;
    let mut dp_reached = false;

    for i in (end..=3).rev() {
        let raw_digit = frame.digit(i);
        let digit = match decode_digit(raw_digit) {
            Some(d) => d,
            None => {
                rawval = f64::NAN;
                break;
            }
        };
        // Digit 1 has no decimal point; digit 4's DP position is the MAX
        // flag, so a DP there still scales but is reported separately.
        if i < 3 && raw_digit & DP_MASK != 0 {
            dp_reached = true;
        }
        if dp_reached {
            multiplier /= 10.0;
        }
        rawval = rawval * 10.0 + digit as f64;
    }
    rawval *= multiplier;

    if frame.info() & INFO_NEG != 0 {
        rawval = -rawval;
    }

    if frame.ind2() & IND2_NANO != 0 {
        rawval *= 1e-9;
    } else if frame.ind2() & IND2_MICRO != 0 {
        rawval *= 1e-6;
    } else if frame.ind1() & IND1_MILI != 0 {
        rawval *= 1e-3;
    } else if frame.ind1() & IND1_KILO != 0 {
        rawval *= 1e3;
    } else if frame.ind1() & IND1_MEGA != 0 {
        rawval *= 1e6;
    }

    rawval
}

fn is_celsius(frame: Frame) -> bool {
    frame.digit4() & !DP_MASK == LCD_C
}

fn is_shortcirc(frame: Frame) -> bool {
    frame.digit2() & !DP_MASK == LCD_LOWER_H
}

fn is_logic_high(frame: Frame) -> bool {
    frame.digit2() & !DP_MASK == LCD_H
}

/// The rs9lcd packet parser.
pub struct Rs9Lcd;

impl PacketParser for Rs9Lcd {
    fn packet_size(&self) -> usize {
        PACKET_SIZE
    }

    fn valid(&self, frame: &[u8]) -> bool {
        if frame.len() != PACKET_SIZE {
            return false;
        }
        let frame = Frame(frame);

        // Check the mode first; no point summing the checksum for a frame
        // that will be rejected anyway.
        if frame.mode() >= MODE_INVALID {
            return false;
        }
        if !checksum_valid(frame) {
            debug!("frame with invalid checksum discarded");
            return false;
        }
        if !selection_good(frame) {
            debug!("frame with invalid selection bits discarded");
            return false;
        }
        true
    }

    fn parse(&self, frame: &[u8]) -> Result<Reading> {
        if frame.len() != PACKET_SIZE {
            return Err(Error::Arg(format!(
                "rs9lcd frame must be {PACKET_SIZE} bytes, got {}",
                frame.len()
            )));
        }
        let frame = Frame(frame);
        let mode = Mode::from_raw(frame.mode())
            .ok_or_else(|| Error::Arg(format!("unknown mode {}", frame.mode())))?;

        let rawval = lcd_to_double(frame, false);
        let mut value = rawval;
        let mut mqflags = MqFlags::empty();

        let (mq, unit) = match mode {
            Mode::DcV => {
                mqflags |= MqFlags::DC;
                (Mq::Voltage, Unit::Volt)
            }
            Mode::AcV => {
                mqflags |= MqFlags::AC;
                (Mq::Voltage, Unit::Volt)
            }
            Mode::DcMicroAmp | Mode::DcMilliAmp | Mode::DcAmp => {
                mqflags |= MqFlags::DC;
                (Mq::Current, Unit::Ampere)
            }
            Mode::AcMicroAmp | Mode::AcMilliAmp | Mode::AcAmp => {
                mqflags |= MqFlags::AC;
                (Mq::Current, Unit::Ampere)
            }
            Mode::Ohm => (Mq::Resistance, Unit::Ohm),
            Mode::Farad => (Mq::Capacitance, Unit::Farad),
            Mode::Continuity => {
                value = if is_shortcirc(frame) { 1.0 } else { 0.0 };
                (Mq::Continuity, Unit::Boolean)
            }
            Mode::Diode => {
                mqflags |= MqFlags::DIODE | MqFlags::DC;
                (Mq::Voltage, Unit::Volt)
            }
            Mode::Hz | Mode::VoltHz | Mode::AmpHz => (Mq::Frequency, Unit::Hertz),
            Mode::Logic => {
                // Always a voltage measurement; with no numeric reading the
                // display shows HI/LOW and the value becomes boolean.
                if rawval.is_nan() {
                    value = if is_logic_high(frame) { 1.0 } else { 0.0 };
                    (Mq::Voltage, Unit::Boolean)
                } else {
                    (Mq::Voltage, Unit::Volt)
                }
            }
            Mode::Hfe => (Mq::Gain, Unit::Unitless),
            Mode::Duty | Mode::VoltDuty | Mode::AmpDuty => (Mq::DutyCycle, Unit::Percentage),
            Mode::Width | Mode::VoltWidth | Mode::AmpWidth => (Mq::PulseWidth, Unit::Second),
            Mode::Temp => {
                // The rightmost digit is the C/F glyph, not a number.
                value = lcd_to_double(frame, true);
                let unit = if is_celsius(frame) {
                    Unit::Celsius
                } else {
                    Unit::Fahrenheit
                };
                (Mq::Temperature, unit)
            }
            Mode::Dbm => {
                mqflags |= MqFlags::AC;
                (Mq::Power, Unit::DecibelMw)
            }
        };

        if frame.info() & INFO_HOLD != 0 {
            mqflags |= MqFlags::HOLD;
        }
        if frame.digit4() & DIG4_MAX != 0 {
            mqflags |= MqFlags::MAX;
        }
        if frame.ind2() & IND2_MIN != 0 {
            mqflags |= MqFlags::MIN;
        }
        if frame.info() & INFO_AUTO != 0 {
            mqflags |= MqFlags::AUTORANGE;
        }

        Ok(Reading {
            value: value as f32,
            mq,
            unit,
            mqflags,
        })
    }
}
