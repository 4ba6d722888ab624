//! Serial transport session.
//!
//! Owns every open connection and is the sole gate to the physical line:
//! one request/response transaction at a time per handle, bounded by a
//! deadline. The protocol is strictly request/response over a half-duplex
//! link, so scheduling reduces to one outstanding request per handle,
//! enforced with a per-handle lock.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, SerialPortType, StopBits};
use thiserror::Error;
use vscope_protocol::{encode_frame, FrameDecoder, FrameError};

/// How long a single backend read may block before the deadline is
/// rechecked.
const POLL_QUANTUM: Duration = Duration::from_millis(5);

/// Transport-level faults. All are locally recoverable; none abort the
/// process.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// No port exists at the given path.
    #[error("port not found: {path}")]
    PortNotFound {
        /// Path that failed to open.
        path: String,
    },

    /// The port exists but is held by another process.
    #[error("port busy: {path}")]
    PortBusy {
        /// Path that failed to open.
        path: String,
    },

    /// The handle does not refer to an open connection.
    #[error("invalid handle: {handle}")]
    InvalidHandle {
        /// Offending handle id.
        handle: u64,
    },

    /// No complete response arrived before the deadline.
    #[error("timeout")]
    Timeout,

    /// The response frame arrived but failed its CRC check.
    #[error("crc mismatch")]
    CrcMismatch,

    /// Underlying I/O failure, including a recovered poisoned lock.
    #[error("io error: {message}")]
    IoError {
        /// Description of the failure.
        message: String,
    },

    /// Rejected configuration or malformed request.
    #[error("invalid config: {message}")]
    InvalidConfig {
        /// Description of the rejection.
        message: String,
    },

    /// The request would not fit in a single frame.
    #[error("payload too large")]
    PayloadTooLarge,
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut => TransportError::Timeout,
            _ => TransportError::IoError {
                message: err.to_string(),
            },
        }
    }
}

impl From<serialport::Error> for TransportError {
    fn from(err: serialport::Error) -> Self {
        match err.kind {
            serialport::ErrorKind::NoDevice => TransportError::PortNotFound {
                path: err.to_string(),
            },
            serialport::ErrorKind::Io(io_kind) => match io_kind {
                io::ErrorKind::TimedOut => TransportError::Timeout,
                io::ErrorKind::PermissionDenied => TransportError::PortBusy {
                    path: err.to_string(),
                },
                _ => TransportError::IoError {
                    message: err.to_string(),
                },
            },
            serialport::ErrorKind::InvalidInput => TransportError::InvalidConfig {
                message: err.to_string(),
            },
            _ => TransportError::IoError {
                message: err.to_string(),
            },
        }
    }
}

/// Serial line parameters for opening a device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerialConfig {
    /// Baud rate in bits per second.
    pub baud_rate: u32,
    /// Data bits per character.
    pub data_bits: DataBits,
    /// Parity checking.
    pub parity: Parity,
    /// Stop bits.
    pub stop_bits: StopBits,
}

impl Default for SerialConfig {
    fn default() -> Self {
        SerialConfig {
            baud_rate: 115_200,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
        }
    }
}

/// Description of an available serial port.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortInfo {
    /// System path of the port.
    pub path: String,
    /// USB vendor id, when known.
    pub vid: Option<u16>,
    /// USB product id, when known.
    pub pid: Option<u16>,
    /// USB manufacturer string, when known.
    pub manufacturer: Option<String>,
    /// USB product string, when known.
    pub product: Option<String>,
    /// USB serial number, when known.
    pub serial_number: Option<String>,
    /// Port kind ("usb", "bluetooth", "pci", "unknown").
    pub port_type: String,
}

/// Opaque id of one open connection.
///
/// Bound 1:1 to the connection; invalid after [`Transport::close`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle(pub u64);

impl std::fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Byte-stream backend behind a handle.
///
/// Implemented by real serial ports and by the simulated device link, so
/// everything above the transport is testable without hardware.
pub trait SerialLink: Send {
    /// Write the whole buffer.
    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;

    /// Read available bytes, blocking at most the link's read timeout.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Bound how long a single read may block.
    fn set_read_timeout(&mut self, timeout: Duration) -> Result<(), TransportError>;

    /// Discard unread device→host bytes.
    fn discard_input(&mut self) -> Result<(), TransportError>;
}

impl SerialLink for Box<dyn SerialPort> {
    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        Write::write_all(self, data)?;
        self.flush()
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Read::read(self, buf)
    }

    fn set_read_timeout(&mut self, timeout: Duration) -> Result<(), TransportError> {
        self.set_timeout(timeout).map_err(TransportError::from)
    }

    fn discard_input(&mut self) -> Result<(), TransportError> {
        self.clear(ClearBuffer::Input).map_err(TransportError::from)
    }
}

impl SerialLink for vscope_sim::SimLink {
    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        Write::write_all(self, data)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Read::read(self, buf)
    }

    fn set_read_timeout(&mut self, timeout: Duration) -> Result<(), TransportError> {
        vscope_sim::SimLink::set_read_timeout(self, timeout);
        Ok(())
    }

    fn discard_input(&mut self) -> Result<(), TransportError> {
        vscope_sim::SimLink::discard_input(self);
        Ok(())
    }
}

type SharedLink = Arc<Mutex<Box<dyn SerialLink>>>;

/// The transport session: registry of open connections plus the
/// request/response primitive.
///
/// One instance is owned by the application context and shared (`Arc`)
/// wherever connections are made.
pub struct Transport {
    next_id: AtomicU64,
    links: RwLock<HashMap<u64, SharedLink>>,
}

impl Transport {
    /// Create an empty transport session.
    pub fn new() -> Self {
        Transport {
            next_id: AtomicU64::new(1),
            links: RwLock::new(HashMap::new()),
        }
    }

    /// List serial ports present on the system.
    pub fn list_ports() -> Result<Vec<PortInfo>, TransportError> {
        let ports = serialport::available_ports()?;
        let mut out = Vec::new();
        for port in ports {
            let (vid, pid, manufacturer, product, serial_number, port_type) = match &port.port_type
            {
                SerialPortType::UsbPort(info) => (
                    Some(info.vid),
                    Some(info.pid),
                    info.manufacturer.clone(),
                    info.product.clone(),
                    info.serial_number.clone(),
                    "usb".to_string(),
                ),
                SerialPortType::BluetoothPort => {
                    (None, None, None, None, None, "bluetooth".to_string())
                }
                SerialPortType::PciPort => (None, None, None, None, None, "pci".to_string()),
                SerialPortType::Unknown => (None, None, None, None, None, "unknown".to_string()),
            };

            out.push(PortInfo {
                path: port.port_name,
                vid,
                pid,
                manufacturer,
                product,
                serial_number,
                port_type,
            });
        }
        Ok(out)
    }

    /// Open a serial port and register it.
    pub fn open(&self, path: &str, config: &SerialConfig) -> Result<DeviceHandle, TransportError> {
        let builder = serialport::new(path, config.baud_rate)
            .data_bits(config.data_bits)
            .parity(config.parity)
            .stop_bits(config.stop_bits)
            .flow_control(FlowControl::None)
            .timeout(POLL_QUANTUM);

        let port = builder.open().map_err(|err| match err.kind {
            serialport::ErrorKind::NoDevice => TransportError::PortNotFound {
                path: path.to_string(),
            },
            serialport::ErrorKind::Io(io::ErrorKind::PermissionDenied) => {
                TransportError::PortBusy {
                    path: path.to_string(),
                }
            }
            _ => TransportError::from(err),
        })?;

        self.register(Box::new(port))
    }

    /// Register an already-constructed link (e.g. a simulated device).
    pub fn register(&self, mut link: Box<dyn SerialLink>) -> Result<DeviceHandle, TransportError> {
        link.set_read_timeout(POLL_QUANTUM)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut links = self
            .links
            .write()
            .map_err(|_| Self::poisoned_registry("register"))?;
        links.insert(id, Arc::new(Mutex::new(link)));
        Ok(DeviceHandle(id))
    }

    /// Close a connection; the handle is invalid afterwards.
    pub fn close(&self, handle: DeviceHandle) -> Result<(), TransportError> {
        let mut links = self
            .links
            .write()
            .map_err(|_| Self::poisoned_registry("close"))?;
        links.remove(&handle.0);
        Ok(())
    }

    /// Discard any unread bytes pending on a connection.
    pub fn flush(&self, handle: DeviceHandle) -> Result<(), TransportError> {
        let link = self.get(handle)?;
        let mut link = link.lock().map_err(|_| self.evict_poisoned(handle, "flush"))?;
        link.discard_input()
    }

    /// Perform one request/response transaction.
    ///
    /// `request` is TYPE+PAYLOAD; framing is added here, and the response is
    /// returned as TYPE+PAYLOAD with framing stripped and CRC verified.
    /// Fails with [`TransportError::Timeout`] when no complete response
    /// arrives before the deadline; a partial frame present at the deadline
    /// is discarded, never carried into the next attempt.
    pub fn send_request(
        &self,
        handle: DeviceHandle,
        request: &[u8],
        deadline: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let (&msg_type, payload) = request.split_first().ok_or(TransportError::InvalidConfig {
            message: "request must include the message type".to_string(),
        })?;

        let frame = encode_frame(msg_type, payload).map_err(|err| match err {
            FrameError::PayloadTooLarge { .. } => TransportError::PayloadTooLarge,
            other => TransportError::IoError {
                message: other.to_string(),
            },
        })?;

        let link = self.get(handle)?;
        let mut link = link
            .lock()
            .map_err(|_| self.evict_poisoned(handle, "send_request"))?;

        // Stale bytes from a previous timed-out exchange would desynchronize
        // this one.
        link.discard_input()?;

        link.write_all(&frame)?;

        self.read_response(&mut **link, deadline)
    }

    fn read_response(
        &self,
        link: &mut dyn SerialLink,
        deadline: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let expiry = Instant::now() + deadline;
        let mut decoder = FrameDecoder::new();
        let mut buf = [0u8; 256];

        loop {
            if Instant::now() >= expiry {
                debug!("request deadline elapsed with {} buffered bytes", decoder.buffered_len());
                return Err(TransportError::Timeout);
            }

            let n = match link.read(&mut buf) {
                Ok(0) => continue,
                Ok(n) => n,
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::TimedOut
                            | io::ErrorKind::WouldBlock
                            | io::ErrorKind::Interrupted
                    ) =>
                {
                    continue;
                }
                Err(err) => return Err(TransportError::from(err)),
            };

            decoder.push(&buf[..n]);
            loop {
                match decoder.try_decode() {
                    Ok(Some(frame)) => {
                        let mut response = Vec::with_capacity(1 + frame.payload.len());
                        response.push(frame.msg_type);
                        response.extend_from_slice(&frame.payload);
                        return Ok(response);
                    }
                    Ok(None) => break,
                    Err(FrameError::CrcMismatch { expected, actual }) => {
                        warn!("response crc mismatch: expected 0x{expected:02X}, got 0x{actual:02X}");
                        return Err(TransportError::CrcMismatch);
                    }
                    Err(err) => {
                        // Bad length byte: drop the false sync and keep
                        // hunting until the deadline.
                        debug!("resynchronizing after {err}");
                    }
                }
            }
        }
    }

    fn get(&self, handle: DeviceHandle) -> Result<SharedLink, TransportError> {
        let links = self
            .links
            .read()
            .map_err(|_| Self::poisoned_registry("get"))?;
        links
            .get(&handle.0)
            .cloned()
            .ok_or(TransportError::InvalidHandle { handle: handle.0 })
    }

    /// A poisoned handle lock means a writer panicked mid-transaction; the
    /// link state is unknown, so the handle is evicted and the caller must
    /// reconnect.
    fn evict_poisoned(&self, handle: DeviceHandle, context: &str) -> TransportError {
        if let Ok(mut links) = self.links.write() {
            links.remove(&handle.0);
        }
        warn!("device lock poisoned during {context}; handle {handle} evicted");
        TransportError::IoError {
            message: format!(
                "device lock poisoned during {context}; handle {handle} removed; reconnect required"
            ),
        }
    }

    fn poisoned_registry(context: &str) -> TransportError {
        TransportError::IoError {
            message: format!("registry lock poisoned during {context}"),
        }
    }
}

impl Default for Transport {
    fn default() -> Self {
        Self::new()
    }
}
