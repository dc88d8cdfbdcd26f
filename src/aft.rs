//! AFT credit transfers (long poll 72).
//!
//! The sender owns the transaction table and drives one transfer at a
//! time: build the request, watch the immediate status, interrogate until
//! the EGM reports a terminal status, and surface the outcome as an
//! `AftResult` event. Transport retries belong to the poll engine; this
//! module only handles protocol-level pacing (interrogation every
//! `aft_poll_interval`, MachineNotReady resends bounded to five with the
//! transaction id preserved).
//!
//! Field layout and status codes follow the in-house SAS dialect pin
//! recorded in DESIGN.md; amounts are 5-byte big-endian packed BCD.

use crate::bcd::{decode_bcd, encode_bcd};
use crate::error::ProtocolError;
use crate::types::{unix_ts, AftRequest, AftStatus, AftTransferType, AgentEvent};
use std::collections::VecDeque;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

pub const AFT_COMMAND: u8 = 0x72;

/// Immediate / interrogated status bytes.
const STATUS_FULL_COMPLETE: u8 = 0x00;
const STATUS_PARTIAL_COMPLETE: u8 = 0x01;
const STATUS_PENDING: u8 = 0x40;
const STATUS_NOT_READY: u8 = 0x41;
const STATUS_EXPIRED: u8 = 0x94;
const STATUS_CANCELLED: u8 = 0xC0;

const MAX_TRANSACTION_ID: usize = 20;
const MAX_PROTOCOL_RETRIES: u32 = 5;
const RETRY_SPACING: Duration = Duration::from_secs(1);

impl AftTransferType {
    pub fn wire_code(&self) -> u8 {
        match self {
            AftTransferType::InHouseToMachineCashable => 0x00,
            AftTransferType::InHouseToMachineRestricted => 0x10,
            AftTransferType::InHouseToMachineNonRestricted => 0x20,
            AftTransferType::MachineToInHouse => 0x80,
            AftTransferType::BonusCoinOut => 0x40,
            AftTransferType::BonusJackpot => 0x41,
            AftTransferType::CancelPending => 0x81,
            AftTransferType::InterrogateStatus => 0xFF,
        }
    }
}

/// Build the length-prefixed 72 payload for a transfer request.
pub fn build_transfer_payload(
    request: &AftRequest,
    transaction_id: &str,
    transfer_type: AftTransferType,
) -> Result<Vec<u8>, ProtocolError> {
    if transaction_id.len() > MAX_TRANSACTION_ID || !transaction_id.is_ascii() {
        return Err(ProtocolError::UnexpectedResponse { command: AFT_COMMAND });
    }
    let overflow = |_| ProtocolError::UnexpectedResponse { command: AFT_COMMAND };

    let mut body = Vec::with_capacity(28 + transaction_id.len());
    body.push(transfer_type.wire_code());
    body.extend_from_slice(&encode_bcd(request.cashable_cents, 5).map_err(overflow)?);
    body.extend_from_slice(&encode_bcd(request.restricted_cents, 5).map_err(overflow)?);
    body.extend_from_slice(&encode_bcd(request.nonrestricted_cents, 5).map_err(overflow)?);

    let mut flags = 0u8;
    if request.lock_after_transfer {
        flags |= 0x02;
    }
    if request.receipt_request {
        flags |= 0x04;
    }
    body.push(flags);

    body.extend_from_slice(&request.asset_number.to_le_bytes());
    body.extend_from_slice(&request.pool_id.to_le_bytes());
    body.extend_from_slice(&encode_bcd(request.expiration as u64, 4).map_err(overflow)?);
    body.push(transaction_id.len() as u8);
    body.extend_from_slice(transaction_id.as_bytes());

    let mut payload = Vec::with_capacity(body.len() + 1);
    payload.push(body.len() as u8);
    payload.extend_from_slice(&body);
    Ok(payload)
}

/// Build the length-prefixed interrogation payload.
pub fn build_interrogate_payload() -> Vec<u8> {
    vec![0x01, AftTransferType::InterrogateStatus.wire_code()]
}

/// A parsed 72 response: status byte, echoed transaction id, and any
/// trailing receipt data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AftResponse {
    pub status_byte: u8,
    pub transaction_id: String,
    pub receipt_data: Vec<u8>,
}

impl AftResponse {
    pub fn status(&self) -> AftStatus {
        match self.status_byte {
            STATUS_FULL_COMPLETE => AftStatus::FullComplete,
            STATUS_PARTIAL_COMPLETE => AftStatus::PartialComplete,
            STATUS_PENDING | STATUS_NOT_READY => AftStatus::Pending,
            STATUS_EXPIRED => AftStatus::Expired,
            STATUS_CANCELLED => AftStatus::Cancelled,
            code => AftStatus::Rejected(code),
        }
    }
}

/// Parse a 72 response payload (length byte already stripped).
pub fn parse_response(payload: &[u8]) -> Result<AftResponse, ProtocolError> {
    if payload.len() < 2 {
        return Err(ProtocolError::UnexpectedResponse { command: AFT_COMMAND });
    }
    let status_byte = payload[0];
    let id_len = payload[1] as usize;
    if id_len > MAX_TRANSACTION_ID || payload.len() < 2 + id_len {
        return Err(ProtocolError::UnexpectedResponse { command: AFT_COMMAND });
    }
    let transaction_id = std::str::from_utf8(&payload[2..2 + id_len])
        .map_err(|_| ProtocolError::UnexpectedResponse { command: AFT_COMMAND })?
        .to_string();
    Ok(AftResponse {
        status_byte,
        transaction_id,
        receipt_data: payload[2 + id_len..].to_vec(),
    })
}

/// Encode a request's monetary fields back out of a completed transaction
/// for the result event.
fn result_event(request: &AftRequest, transaction_id: &str, status: AftStatus) -> AgentEvent {
    AgentEvent::AftResult {
        transaction_id: transaction_id.to_string(),
        transfer_type: request.transfer_type,
        cashable_cents: request.cashable_cents,
        restricted_cents: request.restricted_cents,
        nonrestricted_cents: request.nonrestricted_cents,
        status: status.label(),
        observed_at: unix_ts(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Initial request (or a MachineNotReady resend) is due.
    AwaitingSend,
    /// Waiting between interrogation polls.
    AwaitingStatus,
    /// Cancel frame is due; terminal only once the EGM confirms.
    Cancelling,
}

#[derive(Debug)]
struct ActiveTransfer {
    request: AftRequest,
    transaction_id: String,
    phase: Phase,
    due: Instant,
    protocol_retries: u32,
}

/// What kind of wire work the sender wants next; the engine maps this to
/// its command priorities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AftWork {
    /// Status interrogation or cancellation frame.
    Interrogate,
    /// Initial or re-sent transfer request.
    Send,
}

pub struct AftSender {
    active: Option<ActiveTransfer>,
    queue: VecDeque<AftRequest>,
    interrogate_interval: Duration,
    counter: u64,
}

impl AftSender {
    pub fn new(interrogate_interval: Duration) -> Self {
        AftSender {
            active: None,
            queue: VecDeque::new(),
            interrogate_interval,
            counter: 0,
        }
    }

    /// Queue a transfer. Returns the transaction id (generated when the
    /// request carries none).
    pub fn submit(&mut self, mut request: AftRequest) -> String {
        let transaction_id = match request.transaction_id.clone() {
            Some(id) => id,
            None => {
                let id = self.generate_transaction_id();
                request.transaction_id = Some(id.clone());
                id
            }
        };
        info!(transaction_id = %transaction_id, "aft transfer queued");
        self.queue.push_back(request);
        transaction_id
    }

    /// Request cancellation of a pending transfer. Returns false when the
    /// transaction id is neither active nor queued.
    pub fn cancel(&mut self, transaction_id: &str, now: Instant) -> bool {
        if let Some(active) = self.active.as_mut() {
            if active.transaction_id == transaction_id {
                active.phase = Phase::Cancelling;
                active.due = now;
                return true;
            }
        }
        let before = self.queue.len();
        self.queue
            .retain(|r| r.transaction_id.as_deref() != Some(transaction_id));
        before != self.queue.len()
    }

    /// Whether any frame is due on the wire, and at which priority.
    pub fn due_work(&self, now: Instant) -> Option<AftWork> {
        match &self.active {
            Some(active) if active.due <= now => match active.phase {
                Phase::AwaitingSend => Some(AftWork::Send),
                Phase::AwaitingStatus | Phase::Cancelling => Some(AftWork::Interrogate),
            },
            Some(_) => None,
            None if !self.queue.is_empty() => Some(AftWork::Send),
            None => None,
        }
    }

    /// Produce the next due 72 payload, activating a queued request when
    /// nothing is in flight.
    pub fn take_frame(&mut self, now: Instant) -> Option<Vec<u8>> {
        if self.active.is_none() {
            let request = self.queue.pop_front()?;
            let transaction_id = request
                .transaction_id
                .clone()
                .expect("queued requests always carry an id");
            self.active = Some(ActiveTransfer {
                request,
                transaction_id,
                phase: Phase::AwaitingSend,
                due: now,
                protocol_retries: 0,
            });
        }

        let active = self.active.as_mut()?;
        if active.due > now {
            return None;
        }

        let payload = match active.phase {
            Phase::AwaitingSend => build_transfer_payload(
                &active.request,
                &active.transaction_id,
                active.request.transfer_type,
            ),
            Phase::Cancelling => build_transfer_payload(
                &active.request,
                &active.transaction_id,
                AftTransferType::CancelPending,
            ),
            Phase::AwaitingStatus => Ok(build_interrogate_payload()),
        };

        match payload {
            Ok(p) => Some(p),
            Err(e) => {
                // Unencodable request: fail it locally, keep the link clean.
                warn!(transaction_id = %active.transaction_id, error = %e, "aft request not encodable");
                self.active = None;
                None
            }
        }
    }

    /// Feed back the decoded 72 response for the frame produced by
    /// [`take_frame`]. Returns events to emit (at most one `AftResult`).
    pub fn on_response(&mut self, payload: &[u8], now: Instant) -> Result<Vec<AgentEvent>, ProtocolError> {
        let response = parse_response(payload)?;
        let Some(active) = self.active.as_mut() else {
            return Err(ProtocolError::UnexpectedResponse { command: AFT_COMMAND });
        };
        if !response.transaction_id.is_empty() && response.transaction_id != active.transaction_id {
            return Err(ProtocolError::UnexpectedResponse { command: AFT_COMMAND });
        }

        if response.status_byte == STATUS_NOT_READY {
            if active.protocol_retries >= MAX_PROTOCOL_RETRIES {
                let event = result_event(
                    &active.request,
                    &active.transaction_id,
                    AftStatus::Rejected(STATUS_NOT_READY),
                );
                warn!(transaction_id = %active.transaction_id, "machine not ready, retries exhausted");
                self.active = None;
                return Ok(vec![event]);
            }
            active.protocol_retries += 1;
            active.phase = Phase::AwaitingSend;
            active.due = now + RETRY_SPACING;
            debug!(
                transaction_id = %active.transaction_id,
                retry = active.protocol_retries,
                "machine not ready, will resend"
            );
            return Ok(vec![]);
        }

        let status = response.status();
        if status.is_terminal() {
            let event = result_event(&active.request, &active.transaction_id, status);
            info!(transaction_id = %active.transaction_id, status = %status.label(), "aft transfer terminal");
            self.active = None;
            return Ok(vec![event]);
        }

        // In progress: switch to (or stay in) interrogation pacing.
        if active.phase != Phase::Cancelling {
            active.phase = Phase::AwaitingStatus;
        }
        active.due = now + self.interrogate_interval;
        Ok(vec![])
    }

    /// Link-level failure on a frame from [`take_frame`]: leave the
    /// transaction active and let it resend after the retry spacing. The
    /// transaction id is unchanged, so a duplicate arrival is idempotent
    /// on the EGM side.
    pub fn on_link_failure(&mut self, now: Instant) {
        if let Some(active) = self.active.as_mut() {
            if active.phase == Phase::AwaitingStatus {
                active.due = now + self.interrogate_interval;
            } else {
                active.due = now + RETRY_SPACING;
            }
        }
    }

    pub fn active_transaction_id(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.transaction_id.as_str())
    }

    fn generate_transaction_id(&mut self) -> String {
        self.counter = (self.counter + 1) % 1_000_000;
        let epoch_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        format!("{epoch_ms}-{}", self.counter)
    }
}

/// Decode the monetary fields of a transfer payload; used by tests and
/// loopback fixtures to validate what actually went on the wire.
pub fn decode_transfer_payload(payload: &[u8]) -> Result<(AftTransferType, u64, u64, u64, String), ProtocolError> {
    let malformed = ProtocolError::UnexpectedResponse { command: AFT_COMMAND };
    if payload.len() < 29 {
        return Err(malformed);
    }
    let body = &payload[1..]; // skip length byte
    let transfer_type = match body[0] {
        0x00 => AftTransferType::InHouseToMachineCashable,
        0x10 => AftTransferType::InHouseToMachineRestricted,
        0x20 => AftTransferType::InHouseToMachineNonRestricted,
        0x80 => AftTransferType::MachineToInHouse,
        0x40 => AftTransferType::BonusCoinOut,
        0x41 => AftTransferType::BonusJackpot,
        0x81 => AftTransferType::CancelPending,
        0xFF => AftTransferType::InterrogateStatus,
        _ => return Err(malformed),
    };
    let cashable = decode_bcd(&body[1..6]).map_err(|_| ProtocolError::UnexpectedResponse { command: AFT_COMMAND })?;
    let restricted = decode_bcd(&body[6..11]).map_err(|_| ProtocolError::UnexpectedResponse { command: AFT_COMMAND })?;
    let nonrestricted =
        decode_bcd(&body[11..16]).map_err(|_| ProtocolError::UnexpectedResponse { command: AFT_COMMAND })?;
    let id_len = body[27] as usize;
    if body.len() < 28 + id_len {
        return Err(ProtocolError::UnexpectedResponse { command: AFT_COMMAND });
    }
    let transaction_id = String::from_utf8(body[28..28 + id_len].to_vec())
        .map_err(|_| ProtocolError::UnexpectedResponse { command: AFT_COMMAND })?;
    Ok((transfer_type, cashable, restricted, nonrestricted, transaction_id))
}
