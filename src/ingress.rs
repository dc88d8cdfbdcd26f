//! Command Ingress - authenticated channel from the backend.
//!
//! A persistent WebSocket client receives `{payload, signature, timestamp}`
//! envelopes. A message is accepted iff the HMAC-SHA256 over
//! `timestamp || canonical_json(payload)` verifies, the timestamp is inside
//! the freshness window, and its nonce has not been seen within that
//! window. Accepted commands go to the poll engine mailbox; a full mailbox
//! answers `busy` so the backend can retry. Rejections drop the message
//! and log, never crash.

use crate::config::Config;
use crate::error::IngressError;
use crate::types::{unix_ts, AftRequest, EngineCommand};
use futures::{SinkExt, StreamExt};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

const RECONNECT_INITIAL: Duration = Duration::from_secs(1);
const RECONNECT_CAP: Duration = Duration::from_secs(30);
const MAX_AFT_AMOUNT: u64 = 9_999_999_999; // 5 BCD bytes

type HmacSha256 = Hmac<Sha256>;

/// Canonical JSON: object keys sorted, `,`/`:` separators, no whitespace.
/// This is the exact byte sequence the backend signs.
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::to_string(k).expect("string keys always serialize"),
                        canonical_json(&map[k])
                    )
                })
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let fields: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", fields.join(","))
        }
        other => serde_json::to_string(other).expect("scalar values always serialize"),
    }
}

/// Replay guard: remembers `timestamp || sha256(payload)` for the length
/// of the freshness window.
pub struct NonceCache {
    seen: HashMap<String, u64>,
    window: u64,
}

impl NonceCache {
    pub fn new(window: u64) -> Self {
        NonceCache {
            seen: HashMap::new(),
            window,
        }
    }

    /// Returns false when the nonce was already seen inside the window.
    pub fn insert(&mut self, nonce: String, now: u64) -> bool {
        self.seen.retain(|_, at| now.saturating_sub(*at) <= self.window);
        if self.seen.contains_key(&nonce) {
            return false;
        }
        self.seen.insert(nonce, now);
        true
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    payload: Value,
    signature: String,
    timestamp: String,
}

/// Verify one raw envelope and translate it into an engine command.
/// `Ok(None)` is a valid message with no engine effect (ping).
pub fn verify_envelope(
    api_key: &[u8],
    raw: &str,
    now: u64,
    nonces: &mut NonceCache,
) -> Result<Option<EngineCommand>, IngressError> {
    let envelope: Envelope =
        serde_json::from_str(raw).map_err(|e| IngressError::MalformedCommand(e.to_string()))?;

    let canonical = canonical_json(&envelope.payload);
    let mut mac = HmacSha256::new_from_slice(api_key).expect("hmac accepts any key length");
    mac.update(envelope.timestamp.as_bytes());
    mac.update(canonical.as_bytes());
    let signature = hex::decode(&envelope.signature).map_err(|_| IngressError::SignatureInvalid)?;
    mac.verify_slice(&signature).map_err(|_| IngressError::SignatureInvalid)?;

    let timestamp: u64 = envelope
        .timestamp
        .parse()
        .map_err(|_| IngressError::MalformedCommand("timestamp is not unix seconds".to_string()))?;
    if now.abs_diff(timestamp) > nonces.window {
        return Err(IngressError::StaleMessage);
    }

    let nonce = format!("{}{}", envelope.timestamp, hex::encode(Sha256::digest(canonical.as_bytes())));
    if !nonces.insert(nonce, now) {
        return Err(IngressError::ReplayedNonce);
    }

    command_from_payload(&envelope.payload)
}

fn command_from_payload(payload: &Value) -> Result<Option<EngineCommand>, IngressError> {
    let action = payload
        .get("action")
        .and_then(Value::as_str)
        .ok_or_else(|| IngressError::MalformedCommand("missing action".to_string()))?;
    let data = payload.get("data").cloned().unwrap_or(Value::Object(Default::default()));

    match action {
        "ping" => Ok(None),
        "jackpot" => {
            let amount_cents = data
                .get("amount_cents")
                .and_then(Value::as_u64)
                .ok_or_else(|| IngressError::MalformedCommand("jackpot needs amount_cents".to_string()))?;
            Ok(Some(EngineCommand::JackpotReset { amount_cents }))
        }
        "aft_send" => {
            let request: AftRequest =
                serde_json::from_value(data).map_err(|e| IngressError::MalformedCommand(e.to_string()))?;
            validate_aft(&request)?;
            Ok(Some(EngineCommand::AftSend(request)))
        }
        "aft_cancel" => {
            let transaction_id = data
                .get("transaction_id")
                .and_then(Value::as_str)
                .ok_or_else(|| IngressError::MalformedCommand("aft_cancel needs transaction_id".to_string()))?;
            Ok(Some(EngineCommand::AftCancel {
                transaction_id: transaction_id.to_string(),
            }))
        }
        other => Err(IngressError::MalformedCommand(format!("unknown action {other:?}"))),
    }
}

fn validate_aft(request: &AftRequest) -> Result<(), IngressError> {
    for (field, amount) in [
        ("cashable_cents", request.cashable_cents),
        ("restricted_cents", request.restricted_cents),
        ("nonrestricted_cents", request.nonrestricted_cents),
    ] {
        if amount > MAX_AFT_AMOUNT {
            return Err(IngressError::MalformedCommand(format!("{field} exceeds {MAX_AFT_AMOUNT}")));
        }
    }
    if let Some(id) = &request.transaction_id {
        if id.len() > 20 || !id.is_ascii() || id.is_empty() {
            return Err(IngressError::MalformedCommand(
                "transaction_id must be 1..=20 ascii bytes".to_string(),
            ));
        }
    }
    Ok(())
}

impl IngressError {
    /// Stable label for error replies to the backend.
    pub fn label(&self) -> &'static str {
        match self {
            IngressError::SignatureInvalid => "signature_invalid",
            IngressError::StaleMessage => "stale_message",
            IngressError::ReplayedNonce => "replayed_nonce",
            IngressError::MalformedCommand(_) => "malformed_command",
            IngressError::Busy => "busy",
        }
    }
}

pub struct CommandIngress {
    config: Arc<Config>,
    commands: mpsc::SyncSender<EngineCommand>,
    nonces: NonceCache,
    shutdown: Arc<AtomicBool>,
}

impl CommandIngress {
    pub fn new(config: Arc<Config>, commands: mpsc::SyncSender<EngineCommand>, shutdown: Arc<AtomicBool>) -> Self {
        let nonces = NonceCache::new(config.freshness_window_s);
        CommandIngress {
            config,
            commands,
            nonces,
            shutdown,
        }
    }

    /// Connect-and-serve loop with exponential reconnect backoff.
    pub async fn run(mut self) {
        let mut backoff = RECONNECT_INITIAL;
        while !self.shutdown.load(Ordering::Relaxed) {
            match connect_async(self.config.ws_server_url.as_str()).await {
                Ok((ws, _)) => {
                    info!(url = %self.config.ws_server_url, "backend channel connected");
                    backoff = RECONNECT_INITIAL;
                    if let Err(e) = self.session(ws).await {
                        warn!(error = %e, "backend channel dropped");
                    }
                }
                Err(e) => {
                    warn!(error = %e, backoff = ?backoff, "backend connect failed");
                }
            }
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }
            self.sleep_checked(backoff).await;
            backoff = (backoff * 2).min(RECONNECT_CAP);
        }
        info!("command ingress stopped");
    }

    async fn session<St>(
        &mut self,
        ws: tokio_tungstenite::WebSocketStream<St>,
    ) -> Result<(), tokio_tungstenite::tungstenite::Error>
    where
        St: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let (mut outbound, mut inbound) = ws.split();
        loop {
            tokio::select! {
                message = inbound.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            let reply = self.handle_message(text.as_str());
                            outbound.send(Message::text(reply)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => return Ok(()),
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e),
                    }
                }
                _ = tokio::time::sleep(Duration::from_millis(500)) => {
                    if self.shutdown.load(Ordering::Relaxed) {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Verify, translate, enqueue; build the JSON reply either way.
    pub fn handle_message(&mut self, raw: &str) -> String {
        let result = verify_envelope(self.config.api_key.as_bytes(), raw, unix_ts(), &mut self.nonces)
            .and_then(|command| match command {
                None => Ok("pong"),
                Some(command) => match self.commands.try_send(command) {
                    Ok(()) => Ok("ok"),
                    Err(mpsc::TrySendError::Full(_)) => Err(IngressError::Busy),
                    Err(mpsc::TrySendError::Disconnected(_)) => {
                        Err(IngressError::MalformedCommand("engine unavailable".to_string()))
                    }
                },
            });

        match result {
            Ok(status) => {
                debug!(status, "backend message accepted");
                format!("{{\"status\":\"{status}\"}}")
            }
            Err(e) => {
                warn!(error = %e, "backend message rejected");
                format!("{{\"status\":\"error\",\"error\":\"{}\"}}", e.label())
            }
        }
    }

    async fn sleep_checked(&self, total: Duration) {
        let mut remaining = total;
        while remaining > Duration::ZERO && !self.shutdown.load(Ordering::Relaxed) {
            let step = remaining.min(Duration::from_millis(500));
            tokio::time::sleep(step).await;
            remaining -= step;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AftTransferType;

    const KEY: &[u8] = b"test-api-key";

    fn sign(payload: &Value, timestamp: u64) -> String {
        let mut mac = HmacSha256::new_from_slice(KEY).unwrap();
        mac.update(timestamp.to_string().as_bytes());
        mac.update(canonical_json(payload).as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn envelope(payload: Value, timestamp: u64) -> String {
        let signature = sign(&payload, timestamp);
        serde_json::json!({
            "payload": payload,
            "signature": signature,
            "timestamp": timestamp.to_string(),
        })
        .to_string()
    }

    #[test]
    fn canonical_json_sorts_keys_recursively() {
        let value = serde_json::json!({
            "b": 1,
            "a": { "z": [1, 2, {"y": 0, "x": null}], "m": "s" }
        });
        assert_eq!(
            canonical_json(&value),
            r#"{"a":{"m":"s","z":[1,2,{"x":null,"y":0}]},"b":1}"#
        );
    }

    #[test]
    fn valid_jackpot_command_accepted() {
        let now = 1_700_000_000;
        let mut nonces = NonceCache::new(30);
        let payload = serde_json::json!({ "action": "jackpot", "data": { "amount_cents": 125_000 } });
        let raw = envelope(payload, now);

        match verify_envelope(KEY, &raw, now, &mut nonces) {
            Ok(Some(EngineCommand::JackpotReset { amount_cents: 125_000 })) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn tampered_payload_fails_signature() {
        let now = 1_700_000_000;
        let mut nonces = NonceCache::new(30);
        let payload = serde_json::json!({ "action": "jackpot", "data": { "amount_cents": 1 } });
        let raw = envelope(payload, now).replace("\"amount_cents\":1", "\"amount_cents\":100000");

        assert_eq!(
            verify_envelope(KEY, &raw, now, &mut nonces).unwrap_err(),
            IngressError::SignatureInvalid
        );
    }

    #[test]
    fn stale_timestamp_rejected_even_with_valid_signature() {
        let now = 1_700_000_000;
        let mut nonces = NonceCache::new(30);
        let payload = serde_json::json!({ "action": "ping" });
        let raw = envelope(payload, now - 120);

        assert_eq!(
            verify_envelope(KEY, &raw, now, &mut nonces).unwrap_err(),
            IngressError::StaleMessage
        );
    }

    #[test]
    fn replay_within_window_rejected() {
        let now = 1_700_000_000;
        let mut nonces = NonceCache::new(30);
        let payload = serde_json::json!({ "action": "ping" });
        let raw = envelope(payload, now);

        assert!(matches!(verify_envelope(KEY, &raw, now, &mut nonces), Ok(None)));
        assert_eq!(
            verify_envelope(KEY, &raw, now + 5, &mut nonces).unwrap_err(),
            IngressError::ReplayedNonce
        );
    }

    #[test]
    fn same_message_after_window_is_fresh_but_stale() {
        let now = 1_700_000_000;
        let mut nonces = NonceCache::new(30);
        let payload = serde_json::json!({ "action": "ping" });
        let raw = envelope(payload, now);

        assert!(matches!(verify_envelope(KEY, &raw, now, &mut nonces), Ok(None)));
        // Past the window the nonce is forgotten, but freshness now fails.
        assert_eq!(
            verify_envelope(KEY, &raw, now + 60, &mut nonces).unwrap_err(),
            IngressError::StaleMessage
        );
    }

    #[test]
    fn aft_send_parses_full_request() {
        let now = 1_700_000_000;
        let mut nonces = NonceCache::new(30);
        let payload = serde_json::json!({
            "action": "aft_send",
            "data": {
                "transfer_type": "in_house_to_machine_cashable",
                "cashable_cents": 500,
                "asset_number": 10,
                "transaction_id": "TX1"
            }
        });
        let raw = envelope(payload, now);

        match verify_envelope(KEY, &raw, now, &mut nonces) {
            Ok(Some(EngineCommand::AftSend(request))) => {
                assert_eq!(request.transfer_type, AftTransferType::InHouseToMachineCashable);
                assert_eq!(request.cashable_cents, 500);
                assert_eq!(request.transaction_id.as_deref(), Some("TX1"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn oversized_aft_amount_rejected() {
        let now = 1_700_000_000;
        let mut nonces = NonceCache::new(30);
        let payload = serde_json::json!({
            "action": "aft_send",
            "data": {
                "transfer_type": "in_house_to_machine_cashable",
                "cashable_cents": 10_000_000_000u64,
                "asset_number": 10
            }
        });
        let raw = envelope(payload, now);

        match verify_envelope(KEY, &raw, now, &mut nonces) {
            Err(IngressError::MalformedCommand(_)) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn unknown_action_rejected() {
        let now = 1_700_000_000;
        let mut nonces = NonceCache::new(30);
        let payload = serde_json::json!({ "action": "reboot" });
        let raw = envelope(payload, now);

        match verify_envelope(KEY, &raw, now, &mut nonces) {
            Err(IngressError::MalformedCommand(_)) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
