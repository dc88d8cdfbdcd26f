//! Serial transport for the SAS link.
//!
//! Owns the device exclusively. SAS marks the first byte of every message
//! with the 9th ("wakeup") bit; on an 8N1-style port this is realized by
//! transmitting the first byte with Mark parity and the remainder with
//! Space parity, toggled per frame rather than relying on any driver's
//! 9-bit emulation.
//!
//! Receive timing is two-level: a response window for the first byte of a
//! reply, then a short inter-byte window for the rest. A reply that never
//! starts is `Timeout`; one that stalls mid-frame is `ShortRead`.

use crate::config::Config;
use crate::error::{FrameError, LinkError};
use crate::frame::FrameSource;
use serialport::{ClearBuffer, DataBits, Parity, SerialPort, StopBits};
use std::io::{Read, Write};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Link abstraction the poll engine drives. The production implementation
/// is [`SasTransport`]; tests substitute an in-memory EGM fixture.
pub trait SasLink: FrameSource + Send {
    /// Transmit a frame, first byte carrying the wakeup marker.
    fn send(&mut self, frame: &[u8]) -> Result<(), LinkError>;
}

pub struct SasTransport {
    port: Box<dyn SerialPort>,
    inter_byte_timeout: Duration,
    response_timeout: Duration,
    /// Set once the first byte of a response has arrived; cleared on send.
    mid_frame: bool,
}

impl SasTransport {
    /// Open the configured device exclusively. Fails fast when the device
    /// path does not exist, which the orchestrator treats as a hardware
    /// fault at startup.
    pub fn open(config: &Config) -> Result<Self, LinkError> {
        let port = serialport::new(config.com_port.as_str(), config.baudrate)
            .data_bits(DataBits::Eight)
            .stop_bits(StopBits::One)
            .parity(Parity::Space)
            .timeout(Duration::from_millis(config.inter_byte_timeout_ms))
            .open()
            .map_err(map_serial_err)?;

        debug!(port = %config.com_port, baud = config.baudrate, "serial port opened");

        Ok(SasTransport {
            port,
            inter_byte_timeout: Duration::from_millis(config.inter_byte_timeout_ms),
            response_timeout: Duration::from_millis(config.response_timeout_ms),
            mid_frame: false,
        })
    }

    /// Receive exactly `n` bytes. The first byte of a response is allowed
    /// the full window in `timeout`; subsequent bytes must arrive within
    /// the inter-byte timeout.
    pub fn recv(&mut self, n: usize, timeout: Duration) -> Result<Vec<u8>, LinkError> {
        let mut buf = vec![0u8; n];
        let mut filled = 0usize;
        let deadline = Instant::now() + timeout;

        while filled < n {
            match self.port.read(&mut buf[filled..]) {
                Ok(0) => return Err(self.device_gone()),
                Ok(count) => {
                    filled += count;
                    self.mid_frame = true;
                }
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut || e.kind() == std::io::ErrorKind::Interrupted => {
                    if self.mid_frame || filled > 0 {
                        return Err(LinkError::Frame(FrameError::ShortRead { wanted: n, got: filled }));
                    }
                    if Instant::now() >= deadline {
                        return Err(LinkError::Timeout);
                    }
                }
                Err(_) => return Err(self.device_gone()),
            }
        }

        trace!(bytes = filled, "serial recv");
        Ok(buf)
    }

    fn device_gone(&mut self) -> LinkError {
        self.mid_frame = false;
        LinkError::DeviceGone
    }
}

impl FrameSource for SasTransport {
    fn read_exact_bytes(&mut self, n: usize) -> Result<Vec<u8>, LinkError> {
        let window = if self.mid_frame {
            self.inter_byte_timeout
        } else {
            self.response_timeout
        };
        self.recv(n, window)
    }
}

impl SasLink for SasTransport {
    fn send(&mut self, frame: &[u8]) -> Result<(), LinkError> {
        let Some((first, rest)) = frame.split_first() else {
            return Ok(());
        };

        // Drop any stale bytes from an aborted previous exchange.
        self.port.clear(ClearBuffer::Input).map_err(map_serial_err)?;
        self.mid_frame = false;

        self.port.set_parity(Parity::Mark).map_err(map_serial_err)?;
        self.port.write_all(std::slice::from_ref(first))?;
        self.port.flush()?;

        self.port.set_parity(Parity::Space).map_err(map_serial_err)?;
        if !rest.is_empty() {
            self.port.write_all(rest)?;
            self.port.flush()?;
        }
        Ok(())
    }
}

fn map_serial_err(err: serialport::Error) -> LinkError {
    match err.kind() {
        serialport::ErrorKind::NoDevice => LinkError::DeviceGone,
        serialport::ErrorKind::Io(kind) => LinkError::Io(std::io::Error::new(kind, err.description)),
        _ => LinkError::Io(std::io::Error::other(err.description)),
    }
}
