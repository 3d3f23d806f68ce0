//! Serial byte transport
//!
//! [`SerialTransport`] is the non-blocking byte primitive the serial
//! engines are written against. [`SystemSerial`] adapts a real OS port via
//! the `serialport` crate; tests use scripted in-memory transports.

use std::str::FromStr;
use std::time::Duration;

use tracing::trace;

use crate::{Error, Result};

/// Non-blocking serial port primitive.
///
/// `read` never blocks: it returns `Ok(0)` when no byte is pending.
/// Readiness is probed with [`SerialTransport::bytes_available`].
pub trait SerialTransport: Send {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    fn write(&mut self, buf: &[u8]) -> Result<usize>;

    fn bytes_available(&mut self) -> Result<usize>;

    /// Discard any unread input.
    fn flush_input(&mut self) -> Result<()>;

    /// Write the whole buffer or fail. A short write is a transport error.
    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        let n = self.write(buf)?;
        if n != buf.len() {
            return Err(Error::Transport(format!(
                "short write: {n} of {} bytes",
                buf.len()
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Even,
    Odd,
}

/// Serial communication parameters in `<baudrate>/<databits><parity><stopbits>`
/// form, e.g. `9600/8n1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialComm {
    pub baudrate: u32,
    pub databits: u8,
    pub parity: Parity,
    pub stopbits: u8,
}

impl FromStr for SerialComm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (baud, frame) = s
            .split_once('/')
            .ok_or_else(|| Error::Arg(format!("invalid serial comm spec '{s}'")))?;
        let baudrate: u32 = baud
            .parse()
            .map_err(|_| Error::Arg(format!("invalid baudrate in '{s}'")))?;

        let mut chars = frame.chars();
        let databits = chars
            .next()
            .and_then(|c| c.to_digit(10))
            .filter(|d| (5..=8).contains(d))
            .ok_or_else(|| Error::Arg(format!("invalid data bits in '{s}'")))?
            as u8;
        let parity = match chars.next() {
            Some('n') | Some('N') => Parity::None,
            Some('e') | Some('E') => Parity::Even,
            Some('o') | Some('O') => Parity::Odd,
            _ => return Err(Error::Arg(format!("invalid parity in '{s}'"))),
        };
        let stopbits = chars
            .next()
            .and_then(|c| c.to_digit(10))
            .filter(|d| *d == 1 || *d == 2)
            .ok_or_else(|| Error::Arg(format!("invalid stop bits in '{s}'")))?
            as u8;
        if chars.next().is_some() {
            return Err(Error::Arg(format!("trailing garbage in '{s}'")));
        }

        Ok(SerialComm {
            baudrate,
            databits,
            parity,
            stopbits,
        })
    }
}

/// How to reach a device: an OS path for serial ports, or a USB address as
/// `<bus>.<addr>` (decimal) or `<vid>.<pid>` (4-digit hex).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnSpec {
    Path(String),
    UsbBusAddr(u8, u8),
    UsbVidPid(u16, u16),
}

impl FromStr for ConnSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(Error::Arg("empty connection spec".into()));
        }
        if !s.starts_with('/') {
            if let Some((a, b)) = s.split_once('.') {
                if a.len() == 4 && b.len() == 4 {
                    if let (Ok(vid), Ok(pid)) =
                        (u16::from_str_radix(a, 16), u16::from_str_radix(b, 16))
                    {
                        return Ok(ConnSpec::UsbVidPid(vid, pid));
                    }
                }
                if let (Ok(bus), Ok(addr)) = (a.parse::<u8>(), b.parse::<u8>()) {
                    return Ok(ConnSpec::UsbBusAddr(bus, addr));
                }
            }
        }
        Ok(ConnSpec::Path(s.to_string()))
    }
}

/// OS serial port backed by the `serialport` crate.
pub struct SystemSerial {
    port: Box<dyn serialport::SerialPort>,
}

impl SystemSerial {
    /// Open `path` with the given communication parameters. The port is
    /// configured with a near-zero timeout so reads never stall the
    /// session loop.
    pub fn open(path: &str, comm: &SerialComm) -> Result<Self> {
        let databits = match comm.databits {
            5 => serialport::DataBits::Five,
            6 => serialport::DataBits::Six,
            7 => serialport::DataBits::Seven,
            8 => serialport::DataBits::Eight,
            other => return Err(Error::Arg(format!("unsupported data bits {other}"))),
        };
        let parity = match comm.parity {
            Parity::None => serialport::Parity::None,
            Parity::Even => serialport::Parity::Even,
            Parity::Odd => serialport::Parity::Odd,
        };
        let stopbits = match comm.stopbits {
            1 => serialport::StopBits::One,
            2 => serialport::StopBits::Two,
            other => return Err(Error::Arg(format!("unsupported stop bits {other}"))),
        };

        let port = serialport::new(path, comm.baudrate)
            .data_bits(databits)
            .parity(parity)
            .stop_bits(stopbits)
            .timeout(Duration::from_millis(1))
            .open()
            .map_err(|e| Error::Transport(format!("cannot open {path}: {e}")))?;

        trace!("opened serial port {path} at {}", comm.baudrate);
        Ok(Self { port })
    }
}

impl SerialTransport for SystemSerial {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        use std::io::Read;
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        use std::io::Write;
        let n = self.port.write(buf)?;
        self.port.flush()?;
        Ok(n)
    }

    fn bytes_available(&mut self) -> Result<usize> {
        self.port
            .bytes_to_read()
            .map(|n| n as usize)
            .map_err(|e| Error::Transport(e.to_string()))
    }

    fn flush_input(&mut self) -> Result<()> {
        self.port
            .clear(serialport::ClearBuffer::Input)
            .map_err(|e| Error::Transport(e.to_string()))
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_comm_parse() {
        let comm: SerialComm = "115200/8n1".parse().unwrap();
        assert_eq!(comm.baudrate, 115200);
        assert_eq!(comm.databits, 8);
        assert_eq!(comm.parity, Parity::None);
        assert_eq!(comm.stopbits, 1);

        let comm: SerialComm = "9600/7e2".parse().unwrap();
        assert_eq!(comm.databits, 7);
        assert_eq!(comm.parity, Parity::Even);
        assert_eq!(comm.stopbits, 2);
    }

    #[test]
    fn test_serial_comm_parse_rejects_garbage() {
        assert!("9600".parse::<SerialComm>().is_err());
        assert!("abc/8n1".parse::<SerialComm>().is_err());
        assert!("9600/9n1".parse::<SerialComm>().is_err());
        assert!("9600/8x1".parse::<SerialComm>().is_err());
        assert!("9600/8n3".parse::<SerialComm>().is_err());
        assert!("9600/8n1z".parse::<SerialComm>().is_err());
    }

    #[test]
    fn test_conn_spec_parse() {
        assert_eq!(
            "/dev/ttyACM0".parse::<ConnSpec>().unwrap(),
            ConnSpec::Path("/dev/ttyACM0".into())
        );
        assert_eq!(
            "1.65".parse::<ConnSpec>().unwrap(),
            ConnSpec::UsbBusAddr(1, 65)
        );
        assert_eq!(
            "1d6b.0001".parse::<ConnSpec>().unwrap(),
            ConnSpec::UsbVidPid(0x1d6b, 0x0001)
        );
        // Paths containing dots stay paths.
        assert_eq!(
            "/dev/cu.usbserial-1410".parse::<ConnSpec>().unwrap(),
            ConnSpec::Path("/dev/cu.usbserial-1410".into())
        );
    }

    #[test]
    fn test_scripted_serial_roundtrip() {
        use testing::ScriptedSerial;

        let mut port = ScriptedSerial::new();
        port.queue(b"1SLO");
        assert_eq!(port.bytes_available().unwrap(), 4);

        let mut buf = [0u8; 4];
        assert_eq!(port.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"1SLO");
        assert_eq!(port.bytes_available().unwrap(), 0);

        port.write_all(&[0x00, 0x01]).unwrap();
        assert_eq!(port.tx, vec![0x00, 0x01]);
    }
}
