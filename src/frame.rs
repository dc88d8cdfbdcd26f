//! SAS frame codec.
//!
//! Pure and stateless: frame assembly, response parsing, and CRC-16/KERMIT
//! (poly 0x1021, init 0x0000, reflected in/out, xor-out 0x0000; low byte
//! first on the wire). The wakeup marker on the first transmitted byte is
//! the transport's job and never appears in codec output.

use crate::error::{FrameError, LinkError};
use crc::{Crc, CRC_16_KERMIT};

/// Payload bytes past this are a framing fault, not a real SAS response.
pub const MAX_PAYLOAD: usize = 240;

const SAS_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_KERMIT);

/// CRC-16/KERMIT over `address || command || payload`.
pub fn crc16(bytes: &[u8]) -> u16 {
    SAS_CRC.checksum(bytes)
}

/// Assemble a complete long-poll frame: address, command, payload, CRC.
pub fn encode(address: u8, command: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 4);
    out.push(address);
    out.push(command);
    out.extend_from_slice(payload);
    let crc = crc16(&out);
    out.extend_from_slice(&crc.to_le_bytes());
    out
}

/// What a command's response looks like on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseShape {
    /// One raw byte, no CRC (general-poll exception report).
    SingleByte,
    /// One raw byte: the EGM's address echoed as ACK, or address|0x80 as NACK.
    Ack,
    /// `address || command || N payload bytes || crc`.
    Fixed(usize),
    /// `address || command || length || payload bytes || crc`
    /// (the length byte is covered by the CRC and kept in the payload).
    Variable,
}

/// A parsed response frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    pub address: u8,
    pub command: u8,
    /// Payload after the command byte; for `Variable` shapes the leading
    /// length byte is stripped.
    pub payload: Vec<u8>,
    /// Total bytes consumed from the source.
    pub consumed: usize,
}

/// Exact-read byte source. Implemented by the serial transport and by
/// in-memory fixtures in tests.
pub trait FrameSource {
    fn read_exact_bytes(&mut self, n: usize) -> Result<Vec<u8>, LinkError>;
}

impl<T: AsRef<[u8]>> FrameSource for std::io::Cursor<T> {
    fn read_exact_bytes(&mut self, n: usize) -> Result<Vec<u8>, LinkError> {
        let data = self.get_ref().as_ref();
        let pos = self.position() as usize;
        let available = data.len().saturating_sub(pos);
        if available < n {
            return Err(LinkError::Frame(FrameError::ShortRead {
                wanted: n,
                got: available,
            }));
        }
        let out = data[pos..pos + n].to_vec();
        self.set_position((pos + n) as u64);
        Ok(out)
    }
}

/// Read and validate one response frame of the given shape.
///
/// `SingleByte` and `Ack` shapes carry no CRC; everything else is verified
/// against CRC-16/KERMIT of `address || command || [length ||] payload`.
pub fn decode<S: FrameSource>(source: &mut S, shape: ResponseShape) -> Result<DecodedFrame, LinkError> {
    match shape {
        ResponseShape::SingleByte | ResponseShape::Ack => {
            let byte = source.read_exact_bytes(1)?;
            Ok(DecodedFrame {
                address: byte[0],
                command: 0,
                payload: byte,
                consumed: 1,
            })
        }
        ResponseShape::Fixed(len) => {
            if len > MAX_PAYLOAD {
                return Err(LinkError::Frame(FrameError::FrameTooLong(len)));
            }
            let head = source.read_exact_bytes(2)?;
            let body = source.read_exact_bytes(len + 2)?;
            let payload = check_crc(&head, &body[..len], &body[len..])?;
            Ok(DecodedFrame {
                address: head[0],
                command: head[1],
                payload,
                consumed: len + 4,
            })
        }
        ResponseShape::Variable => {
            let head = source.read_exact_bytes(3)?;
            let len = head[2] as usize;
            if len > MAX_PAYLOAD {
                return Err(LinkError::Frame(FrameError::FrameTooLong(len)));
            }
            let body = source.read_exact_bytes(len + 2)?;
            let payload = check_crc(&head, &body[..len], &body[len..])?;
            Ok(DecodedFrame {
                address: head[0],
                command: head[1],
                payload,
                consumed: len + 5,
            })
        }
    }
}

fn check_crc(head: &[u8], payload: &[u8], crc_bytes: &[u8]) -> Result<Vec<u8>, LinkError> {
    let mut covered = head.to_vec();
    covered.extend_from_slice(payload);
    let computed = crc16(&covered);
    let received = u16::from_le_bytes([crc_bytes[0], crc_bytes[1]]);
    if computed != received {
        return Err(LinkError::Frame(FrameError::BadCrc { computed, received }));
    }
    Ok(payload.to_vec())
}
