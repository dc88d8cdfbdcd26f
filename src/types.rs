// Shared agent vocabulary.
//
// Events flow poll engine → durable sink → remote store; commands flow
// command ingress → poll engine. Everything that crosses a thread boundary
// lives here.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds since the Unix epoch.
pub fn unix_ts() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// One decoded meter value as observed on the link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeterReading {
    pub meter_code: u8,
    pub raw_bcd: Vec<u8>,
    pub value: u64,
    pub observed_at: u64,
}

/// AFT transfer kinds, as accepted from the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AftTransferType {
    InHouseToMachineCashable,
    InHouseToMachineRestricted,
    InHouseToMachineNonRestricted,
    MachineToInHouse,
    BonusCoinOut,
    BonusJackpot,
    CancelPending,
    InterrogateStatus,
}

/// A credit transfer request, from the backend or a local caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AftRequest {
    pub transfer_type: AftTransferType,
    #[serde(default)]
    pub cashable_cents: u64,
    #[serde(default)]
    pub restricted_cents: u64,
    #[serde(default)]
    pub nonrestricted_cents: u64,
    pub asset_number: u32,
    /// ASCII, at most 20 bytes. Generated as `{epoch_ms}-{counter}` when absent.
    #[serde(default)]
    pub transaction_id: Option<String>,
    /// Expiration date as MMDDYYYY digits, or 0 for none.
    #[serde(default)]
    pub expiration: u32,
    #[serde(default)]
    pub pool_id: u16,
    #[serde(default)]
    pub receipt_request: bool,
    #[serde(default)]
    pub lock_after_transfer: bool,
}

/// Lifecycle of one AFT transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AftStatus {
    Pending,
    Sent,
    FullComplete,
    PartialComplete,
    Rejected(u8),
    Expired,
    Cancelled,
}

impl AftStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, AftStatus::Pending | AftStatus::Sent)
    }

    /// Stable label used in remote store rows.
    pub fn label(&self) -> String {
        match self {
            AftStatus::Pending => "pending".to_string(),
            AftStatus::Sent => "sent".to_string(),
            AftStatus::FullComplete => "full_complete".to_string(),
            AftStatus::PartialComplete => "partial_complete".to_string(),
            AftStatus::Rejected(code) => format!("rejected_{code:#04x}"),
            AftStatus::Expired => "expired".to_string(),
            AftStatus::Cancelled => "cancelled".to_string(),
        }
    }
}

/// Commands other components enqueue onto the poll engine mailbox.
#[derive(Debug, Clone)]
pub enum EngineCommand {
    /// Reset a pending handpay after the back office has paid it out.
    JackpotReset { amount_cents: u64 },
    AftSend(AftRequest),
    AftCancel { transaction_id: String },
}

/// Observed state changes, delivered to the durable sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AgentEvent {
    MeterChanged {
        asset_number: u32,
        machine_address: u8,
        meter_code: u8,
        old_value: u64,
        new_value: u64,
        suspect: bool,
        observed_at: u64,
    },
    AftResult {
        transaction_id: String,
        transfer_type: AftTransferType,
        cashable_cents: u64,
        restricted_cents: u64,
        nonrestricted_cents: u64,
        status: String,
        observed_at: u64,
    },
    EgmException {
        code: u8,
        name: String,
        observed_at: u64,
    },
    HandpayDetected {
        amount_cents: u64,
        observed_at: u64,
    },
    JackpotReset {
        amount_cents: u64,
        acked: bool,
        observed_at: u64,
    },
    /// Journal usage crossed 80% of its cap.
    JournalPressure {
        bytes: u64,
        cap: u64,
        observed_at: u64,
    },
}

impl AgentEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            AgentEvent::MeterChanged { .. } => EventKind::MeterChanged,
            AgentEvent::AftResult { .. } => EventKind::AftResult,
            AgentEvent::EgmException { .. }
            | AgentEvent::HandpayDetected { .. }
            | AgentEvent::JackpotReset { .. }
            | AgentEvent::JournalPressure { .. } => EventKind::EgmEvent,
        }
    }

    pub fn observed_at(&self) -> u64 {
        match self {
            AgentEvent::MeterChanged { observed_at, .. }
            | AgentEvent::AftResult { observed_at, .. }
            | AgentEvent::EgmException { observed_at, .. }
            | AgentEvent::HandpayDetected { observed_at, .. }
            | AgentEvent::JackpotReset { observed_at, .. }
            | AgentEvent::JournalPressure { observed_at, .. } => *observed_at,
        }
    }
}

/// Event families with independent delivery ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    MeterChanged,
    AftResult,
    EgmEvent,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::MeterChanged => "meter_changed",
            EventKind::AftResult => "aft_result",
            EventKind::EgmEvent => "egm_event",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "meter_changed" => Some(EventKind::MeterChanged),
            "aft_result" => Some(EventKind::AftResult),
            "egm_event" => Some(EventKind::EgmEvent),
            _ => None,
        }
    }
}

/// A sink entry: sequence is assigned at enqueue, body is the serde_json
/// encoding of the `AgentEvent`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedEvent {
    pub sequence: u64,
    pub kind: EventKind,
    pub body: Vec<u8>,
    pub first_attempt: u64,
    pub attempts: u32,
}

impl QueuedEvent {
    pub fn from_event(sequence: u64, event: &AgentEvent) -> Self {
        QueuedEvent {
            sequence,
            kind: event.kind(),
            body: serde_json::to_vec(event).expect("event serialization is infallible"),
            first_attempt: unix_ts(),
            attempts: 0,
        }
    }

    pub fn decode_event(&self) -> Option<AgentEvent> {
        serde_json::from_slice(&self.body).ok()
    }
}
