//! Error kinds shared across the agent.
//!
//! Framing and link errors are recovered locally by the poll engine.
//! Protocol errors surface on the originating result event. Store errors
//! degrade to journaling. Ingress errors drop the offending message.
//! Only configuration and journal corruption are fatal at startup.

use thiserror::Error;

/// Frame construction and parsing failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("crc mismatch: computed {computed:#06x}, frame carried {received:#06x}")]
    BadCrc { computed: u16, received: u16 },

    #[error("short read: wanted {wanted} bytes, got {got}")]
    ShortRead { wanted: usize, got: usize },

    #[error("no response spec for command {0:#04x}")]
    UnknownCommand(u8),

    #[error("frame too long: {0} payload bytes")]
    FrameTooLong(usize),
}

/// Failures on the serial link itself.
#[derive(Debug, Error)]
pub enum LinkError {
    /// No response byte arrived within the response window.
    #[error("response timeout")]
    Timeout,

    /// Retries exhausted on a single frame.
    #[error("link fault: retries exhausted")]
    LinkFault,

    /// The serial device disappeared; the transport is closed.
    #[error("serial device gone")]
    DeviceGone,

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("serial i/o: {0}")]
    Io(#[from] std::io::Error),
}

impl LinkError {
    /// Whether the same frame is worth retrying on this link.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LinkError::Timeout | LinkError::Frame(FrameError::BadCrc { .. } | FrameError::ShortRead { .. })
        )
    }
}

/// SAS protocol-level failures, reported to the originating caller.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unexpected response to command {command:#04x}")]
    UnexpectedResponse { command: u8 },

    #[error("aft transfer rejected, status {0:#04x}")]
    AftRejected(u8),

    #[error("machine not ready")]
    MachineNotReady,
}

/// Durable sink and remote store failures.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("remote store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("remote store write failed: {0}")]
    StoreWriteFailed(String),

    #[error("journal full ({bytes} of {cap} bytes)")]
    JournalFull { bytes: u64, cap: u64 },

    /// Checksum mismatch on a non-trailing journal record. Fatal at startup.
    #[error("journal corrupt at line {line}")]
    JournalCorrupt { line: usize },

    #[error("journal i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// Command ingress rejections. The offending message is dropped and logged.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IngressError {
    #[error("signature mismatch")]
    SignatureInvalid,

    #[error("message timestamp outside freshness window")]
    StaleMessage,

    #[error("nonce already seen within window")]
    ReplayedNonce,

    #[error("malformed command: {0}")]
    MalformedCommand(String),

    /// The engine mailbox is full; the backend should retry.
    #[error("command mailbox full")]
    Busy,
}

/// Fatal startup configuration error. Exits with code 2.
#[derive(Debug, Error)]
#[error("invalid configuration: {0}")]
pub struct ConfigError(pub String);
