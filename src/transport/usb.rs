//! USB transfer transport
//!
//! [`UsbTransport`] gives the USB engine vendor control requests, bulk
//! writes, and an asynchronous bulk-in completion queue: the engine submits
//! transfers and drains completed payloads without ever blocking the
//! session loop. [`RusbBackend`] adapts real hardware through the `rusb`
//! crate, pumping submitted transfers on an internal thread and handing
//! completions back over a bounded channel.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};
use tracing::{debug, trace, warn};

use crate::{Error, Result};

/// Bound on any single outstanding USB operation.
pub const USB_TIMEOUT: Duration = Duration::from_secs(3);

/// Address of a USB device on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbDeviceInfo {
    pub vid: u16,
    pub pid: u16,
    pub bus: u8,
    pub address: u8,
}

/// USB control/bulk primitive with a completion-queue model for bulk-in
/// streaming.
///
/// Endpoint arguments carry the full endpoint address including the
/// direction bit (`0x02` = EP2 OUT, `0x86` = EP6 IN).
pub trait UsbTransport: Send {
    /// Vendor OUT control request on endpoint 0.
    fn control_out(&mut self, request: u8, value: u16, index: u16, data: &[u8]) -> Result<()>;

    /// Vendor IN control request on endpoint 0, reading up to `len` bytes.
    fn control_in(&mut self, request: u8, value: u16, index: u16, len: usize) -> Result<Vec<u8>>;

    fn bulk_write(&mut self, endpoint: u8, data: &[u8]) -> Result<usize>;

    /// Queue a bulk-in transfer of up to `length` bytes.
    fn submit_bulk_in(&mut self, endpoint: u8, length: usize) -> Result<()>;

    /// Whether a completed transfer is waiting to be polled.
    fn has_completion(&mut self) -> bool;

    /// Drain one completed transfer, if any. An empty payload is an empty
    /// transfer (the device had nothing to send before the timeout).
    fn poll_completion(&mut self) -> Result<Option<Vec<u8>>>;

    /// Transfers submitted but not yet polled.
    fn pending(&self) -> usize;

    /// Drop all outstanding transfers.
    fn cancel_all(&mut self) -> Result<()>;
}

/// Enumerates and opens USB devices. The engine never touches `rusb`
/// directly, so tests can swap in a scripted backend.
pub trait UsbBackend: Send {
    fn enumerate(&mut self) -> Result<Vec<UsbDeviceInfo>>;

    fn open(&mut self, info: &UsbDeviceInfo) -> Result<Box<dyn UsbTransport>>;
}

// ── rusb adapter ────────────────────────────────────────────────────────

pub struct RusbBackend {
    context: rusb::Context,
}

impl RusbBackend {
    pub fn new() -> Result<Self> {
        let context = rusb::Context::new().map_err(|e| Error::Transport(e.to_string()))?;
        Ok(Self { context })
    }
}

impl UsbBackend for RusbBackend {
    fn enumerate(&mut self) -> Result<Vec<UsbDeviceInfo>> {
        use rusb::UsbContext;

        let mut found = Vec::new();
        let devices = self
            .context
            .devices()
            .map_err(|e| Error::Transport(e.to_string()))?;
        for device in devices.iter() {
            let desc = match device.device_descriptor() {
                Ok(d) => d,
                Err(e) => {
                    debug!("skipping device without descriptor: {e}");
                    continue;
                }
            };
            found.push(UsbDeviceInfo {
                vid: desc.vendor_id(),
                pid: desc.product_id(),
                bus: device.bus_number(),
                address: device.address(),
            });
        }
        Ok(found)
    }

    fn open(&mut self, info: &UsbDeviceInfo) -> Result<Box<dyn UsbTransport>> {
        use rusb::UsbContext;

        let devices = self
            .context
            .devices()
            .map_err(|e| Error::Transport(e.to_string()))?;
        for device in devices.iter() {
            if device.bus_number() != info.bus || device.address() != info.address {
                continue;
            }
            let mut handle = device.open().map_err(|e| Error::Transport(e.to_string()))?;
            handle
                .claim_interface(0)
                .map_err(|e| Error::Transport(e.to_string()))?;
            return Ok(Box::new(RusbTransport::new(handle)));
        }
        Err(Error::Dev(format!(
            "USB device {:04x}.{:04x} at {}.{} is gone",
            info.vid, info.pid, info.bus, info.address
        )))
    }
}

/// Pump-thread request: one bulk-in transfer to perform.
type SubmitRequest = (u8, usize);

/// Open USB device with a pump thread servicing submitted bulk-in
/// transfers. Each blocking read happens off the session thread; completed
/// payloads (empty on timeout) come back through a bounded channel.
pub struct RusbTransport {
    handle: Arc<rusb::DeviceHandle<rusb::Context>>,
    submit_tx: Sender<SubmitRequest>,
    completion_rx: Receiver<Vec<u8>>,
    pending: Arc<AtomicUsize>,
    shutdown: Arc<AtomicBool>,
    pump: Option<JoinHandle<()>>,
}

impl RusbTransport {
    pub fn new(handle: rusb::DeviceHandle<rusb::Context>) -> Self {
        let handle = Arc::new(handle);
        let (submit_tx, submit_rx) = bounded::<SubmitRequest>(64);
        let (completion_tx, completion_rx) = bounded::<Vec<u8>>(64);
        let shutdown = Arc::new(AtomicBool::new(false));

        let pump_handle = Arc::clone(&handle);
        let pump_shutdown = Arc::clone(&shutdown);
        let pump = std::thread::Builder::new()
            .name("usb-pump".into())
            .spawn(move || {
                while !pump_shutdown.load(Ordering::Relaxed) {
                    let (endpoint, length) =
                        match submit_rx.recv_timeout(Duration::from_millis(100)) {
                            Ok(req) => req,
                            Err(_) => continue,
                        };
                    let mut buf = vec![0u8; length];
                    let payload = match pump_handle.read_bulk(endpoint, &mut buf, USB_TIMEOUT) {
                        Ok(n) => {
                            buf.truncate(n);
                            buf
                        }
                        Err(rusb::Error::Timeout) => Vec::new(),
                        Err(e) => {
                            warn!("bulk-in transfer failed: {e}");
                            Vec::new()
                        }
                    };
                    if completion_tx.send(payload).is_err() {
                        break;
                    }
                }
            })
            .expect("failed to spawn USB pump thread");

        Self {
            handle,
            submit_tx,
            completion_rx,
            pending: Arc::new(AtomicUsize::new(0)),
            shutdown,
            pump: Some(pump),
        }
    }
}

impl UsbTransport for RusbTransport {
    fn control_out(&mut self, request: u8, value: u16, index: u16, data: &[u8]) -> Result<()> {
        let request_type = rusb::request_type(
            rusb::Direction::Out,
            rusb::RequestType::Vendor,
            rusb::Recipient::Device,
        );
        trace!("control out: req 0x{request:02x} value 0x{value:04x} len {}", data.len());
        self.handle
            .write_control(request_type, request, value, index, data, USB_TIMEOUT)
            .map_err(|e| Error::Transport(format!("control request 0x{request:02x}: {e}")))?;
        Ok(())
    }

    fn control_in(&mut self, request: u8, value: u16, index: u16, len: usize) -> Result<Vec<u8>> {
        let request_type = rusb::request_type(
            rusb::Direction::In,
            rusb::RequestType::Vendor,
            rusb::Recipient::Device,
        );
        let mut buf = vec![0u8; len];
        let n = self
            .handle
            .read_control(request_type, request, value, index, &mut buf, USB_TIMEOUT)
            .map_err(|e| Error::Transport(format!("control request 0x{request:02x}: {e}")))?;
        buf.truncate(n);
        Ok(buf)
    }

    fn bulk_write(&mut self, endpoint: u8, data: &[u8]) -> Result<usize> {
        self.handle
            .write_bulk(endpoint, data, USB_TIMEOUT)
            .map_err(|e| Error::Transport(format!("bulk write ep 0x{endpoint:02x}: {e}")))
    }

    fn submit_bulk_in(&mut self, endpoint: u8, length: usize) -> Result<()> {
        self.submit_tx
            .try_send((endpoint, length))
            .map_err(|_| Error::Transport("transfer submission queue full".into()))?;
        self.pending.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn has_completion(&mut self) -> bool {
        !self.completion_rx.is_empty()
    }

    fn poll_completion(&mut self) -> Result<Option<Vec<u8>>> {
        match self.completion_rx.try_recv() {
            Ok(payload) => {
                self.pending.fetch_sub(1, Ordering::Relaxed);
                Ok(Some(payload))
            }
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => {
                Err(Error::Transport("USB pump thread is gone".into()))
            }
        }
    }

    fn pending(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    fn cancel_all(&mut self) -> Result<()> {
        // Best effort: drain whatever the pump already finished. The pump
        // abandons the rest at shutdown.
        while self.completion_rx.try_recv().is_ok() {}
        self.pending.store(0, Ordering::Relaxed);
        Ok(())
    }
}

impl Drop for RusbTransport {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(pump) = self.pump.take() {
            let _ = pump.join();
        }
    }
}
