//! Poll Engine - owns the SAS link.
//!
//! A single deterministic loop on a dedicated thread: general poll, drain
//! at most one mailbox command, then one prioritized long poll (AFT status
//! interrogation > jackpot control > credit send > meter poll). Exactly one
//! frame is in flight at any instant.
//!
//! Framing and link errors are recovered here: per-frame retries with a
//! short backoff, then a transport reopen with exponential backoff. Nothing
//! in this module touches the network or the journal; observed changes
//! leave through the event channel.

use crate::aft::{AftSender, AftWork, AFT_COMMAND};
use crate::bcd::decode_bcd;
use crate::config::Config;
use crate::error::LinkError;
use crate::frame::{self, DecodedFrame, ResponseShape};
use crate::meters::MeterTracker;
use crate::transport::SasLink;
use crate::types::{unix_ts, AgentEvent, EngineCommand, MeterReading};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// General polls are the address byte with the top bit set; the EGM answers
/// with one exception byte (0x00 when it has nothing to report).
pub const GENERAL_POLL_BIT: u8 = 0x80;
pub const METER_POLL_COMMAND: u8 = 0x2F;
pub const HANDPAY_INFO_COMMAND: u8 = 0x1B;
pub const HANDPAY_RESET_COMMAND: u8 = 0x94;

const EXCEPTION_NONE: u8 = 0x00;
const EXCEPTION_HANDPAY_PENDING: u8 = 0x51;

const RETRY_BACKOFF: Duration = Duration::from_millis(20);
const REOPEN_INITIAL: Duration = Duration::from_millis(100);
const REOPEN_FACTOR: u32 = 4;
const REOPEN_CAP: Duration = Duration::from_secs(5);

/// Link state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Closed,
    Opening,
    Polling,
    Recovering,
    Stopped,
}

/// How a long poll response is parsed and routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseHandler {
    SelectedMeters,
    AftTransfer,
    HandpayInfo,
    HandpayResetAck,
}

#[derive(Debug, Clone, Copy)]
pub struct CommandSpec {
    pub shape: ResponseShape,
    pub handler: ResponseHandler,
}

/// Static dispatch table keyed by command code. Unknown codes are a typed
/// error, not a reflective miss.
pub fn command_spec(command: u8) -> Option<CommandSpec> {
    match command {
        METER_POLL_COMMAND => Some(CommandSpec {
            shape: ResponseShape::Variable,
            handler: ResponseHandler::SelectedMeters,
        }),
        AFT_COMMAND => Some(CommandSpec {
            shape: ResponseShape::Variable,
            handler: ResponseHandler::AftTransfer,
        }),
        HANDPAY_INFO_COMMAND => Some(CommandSpec {
            shape: ResponseShape::Fixed(10),
            handler: ResponseHandler::HandpayInfo,
        }),
        HANDPAY_RESET_COMMAND => Some(CommandSpec {
            shape: ResponseShape::Ack,
            handler: ResponseHandler::HandpayResetAck,
        }),
        _ => None,
    }
}

/// Exception codes the agent names; everything else is forwarded as
/// `unknown`.
pub fn exception_name(code: u8) -> &'static str {
    match code {
        0x11 => "slot_door_open",
        0x12 => "slot_door_closed",
        0x13 => "drop_door_open",
        0x14 => "drop_door_closed",
        0x17 => "ac_power_applied",
        0x18 => "ac_power_lost",
        0x19 => "cashbox_door_open",
        0x1A => "cashbox_door_closed",
        0x20 => "general_tilt",
        0x47 => "bill_accepted",
        0x51 => "handpay_pending",
        0x52 => "handpay_reset",
        0x66 => "cashout_button_pressed",
        0x69 => "aft_transfer_complete",
        _ => "unknown",
    }
}

/// Meter codes polled together share one 2F request and one BCD width.
struct MeterGroup {
    length_bytes: u8,
    codes: Vec<u8>,
}

enum WireAction {
    Aft,
    JackpotReset { amount_cents: u64 },
    MeterPoll,
}

/// Per-exchange context carried from the request site to the response
/// handler.
#[derive(Debug, Clone, Copy)]
enum ResponseContext {
    None,
    Jackpot { amount_cents: u64 },
    Aft { sent_at: Instant },
}

pub struct PollEngine<L: SasLink> {
    config: Arc<Config>,
    link: Option<L>,
    open_link: Box<dyn FnMut() -> Result<L, LinkError> + Send>,
    state: LinkState,
    meters: MeterTracker,
    meter_lengths: HashMap<u8, u8>,
    meter_groups: Vec<MeterGroup>,
    next_group: usize,
    aft: AftSender,
    commands: mpsc::Receiver<EngineCommand>,
    pending: VecDeque<EngineCommand>,
    events: tokio::sync::mpsc::Sender<AgentEvent>,
    shutdown: Arc<AtomicBool>,
    reopen_backoff: Duration,
}

impl<L: SasLink> PollEngine<L> {
    pub fn new(
        config: Arc<Config>,
        link: L,
        open_link: Box<dyn FnMut() -> Result<L, LinkError> + Send>,
        commands: mpsc::Receiver<EngineCommand>,
        events: tokio::sync::mpsc::Sender<AgentEvent>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        let meters = MeterTracker::new(config.asset_number, config.address, &config.listeners);
        let meter_lengths = config.listeners.iter().map(|l| (l.code, l.length_bytes)).collect();

        let mut meter_groups: Vec<MeterGroup> = Vec::new();
        for listener in &config.listeners {
            match meter_groups.iter_mut().find(|g| g.length_bytes == listener.length_bytes) {
                Some(group) => group.codes.push(listener.code),
                None => meter_groups.push(MeterGroup {
                    length_bytes: listener.length_bytes,
                    codes: vec![listener.code],
                }),
            }
        }

        let aft = AftSender::new(Duration::from_millis(config.aft_poll_interval_ms));

        PollEngine {
            config,
            link: Some(link),
            open_link,
            state: LinkState::Closed,
            meters,
            meter_lengths,
            meter_groups,
            next_group: 0,
            aft,
            commands,
            pending: VecDeque::new(),
            events,
            shutdown,
            reopen_backoff: REOPEN_INITIAL,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Current reopen backoff; the next recovery attempt waits this long.
    pub fn reopen_backoff(&self) -> Duration {
        self.reopen_backoff
    }

    pub fn meters(&self) -> &MeterTracker {
        &self.meters
    }

    /// Run until shutdown is signalled.
    pub fn run(mut self) {
        info!(address = self.config.address, "poll engine starting");
        while self.state != LinkState::Stopped {
            self.step();
        }
        info!("poll engine stopped");
    }

    /// One state-machine step. Public so tests can drive the engine
    /// without a thread.
    pub fn step(&mut self) {
        if self.shutdown.load(Ordering::Relaxed) {
            self.state = LinkState::Stopped;
            return;
        }
        match self.state {
            LinkState::Closed => self.state = LinkState::Opening,
            LinkState::Opening | LinkState::Recovering => self.reconnect_step(),
            LinkState::Polling => self.poll_cycle(),
            LinkState::Stopped => {}
        }
    }

    /// One reopen attempt, preceded by the current backoff. Heartbeat logs
    /// once per attempt, not per frame retry.
    fn reconnect_step(&mut self) {
        // First startup probe goes out immediately; every attempt after a
        // failure waits out the current backoff.
        if self.state == LinkState::Recovering || self.link.is_none() || self.reopen_backoff > REOPEN_INITIAL {
            self.sleep_checked(self.reopen_backoff);
            if self.shutdown.load(Ordering::Relaxed) {
                self.state = LinkState::Stopped;
                return;
            }
        }

        if self.link.is_none() {
            match (self.open_link)() {
                Ok(link) => self.link = Some(link),
                Err(e) => {
                    info!(error = %e, backoff = ?self.reopen_backoff, "serial reopen failed");
                    self.bump_backoff();
                    return;
                }
            }
        }

        match self.general_poll() {
            Ok(code) => {
                info!("link established, polling");
                self.state = LinkState::Polling;
                self.reopen_backoff = REOPEN_INITIAL;
                if code != EXCEPTION_NONE {
                    self.handle_exception(code);
                }
                self.meter_snapshot();
            }
            Err(e) => {
                info!(error = %e, backoff = ?self.reopen_backoff, "link probe failed");
                self.bump_backoff();
            }
        }
    }

    fn bump_backoff(&mut self) {
        self.reopen_backoff = (self.reopen_backoff * REOPEN_FACTOR).min(REOPEN_CAP);
    }

    /// Seed the meter tracker with one pass over every configured group so
    /// change detection starts from live values.
    fn meter_snapshot(&mut self) {
        for index in 0..self.meter_groups.len() {
            if self.poll_meter_group(index).is_err() {
                self.enter_recovering();
                return;
            }
        }
    }

    fn poll_cycle(&mut self) {
        match self.general_poll() {
            Ok(code) => {
                if code != EXCEPTION_NONE {
                    self.handle_exception(code);
                }
            }
            Err(_) => {
                self.enter_recovering();
                return;
            }
        }

        loop {
            match self.commands.try_recv() {
                Ok(command) => self.pending.push_back(command),
                Err(_) => break,
            }
        }

        let now = Instant::now();
        if let Some(action) = self.next_wire_action(now) {
            if self.execute(action).is_err() {
                self.enter_recovering();
                return;
            }
        }

        if self.config.poll_interval_ms > 0 {
            self.sleep_checked(Duration::from_millis(self.config.poll_interval_ms));
        }
    }

    /// Pick one long poll for this cycle. At most one mailbox command is
    /// consumed, keeping poll cadence stable under command load.
    fn next_wire_action(&mut self, now: Instant) -> Option<WireAction> {
        if self.aft.due_work(now) == Some(AftWork::Interrogate) {
            return Some(WireAction::Aft);
        }

        if let Some(pos) = self
            .pending
            .iter()
            .position(|c| matches!(c, EngineCommand::JackpotReset { .. }))
        {
            if let Some(EngineCommand::JackpotReset { amount_cents }) = self.pending.remove(pos) {
                return Some(WireAction::JackpotReset { amount_cents });
            }
        }

        if let Some(command) = self.pending.pop_front() {
            match command {
                EngineCommand::AftSend(request) => {
                    self.aft.submit(request);
                }
                EngineCommand::AftCancel { transaction_id } => {
                    if !self.aft.cancel(&transaction_id, now) {
                        warn!(transaction_id = %transaction_id, "cancel for unknown aft transaction");
                    }
                }
                EngineCommand::JackpotReset { .. } => unreachable!("drained above"),
            }
        }

        if self.aft.due_work(now) == Some(AftWork::Send) {
            return Some(WireAction::Aft);
        }

        if !self.meter_groups.is_empty() {
            return Some(WireAction::MeterPoll);
        }
        None
    }

    fn execute(&mut self, action: WireAction) -> Result<(), LinkError> {
        match action {
            WireAction::Aft => {
                let now = Instant::now();
                let Some(payload) = self.aft.take_frame(now) else {
                    return Ok(());
                };
                self.long_poll(AFT_COMMAND, &payload, ResponseContext::Aft { sent_at: now })
            }
            WireAction::JackpotReset { amount_cents } => {
                self.long_poll(HANDPAY_RESET_COMMAND, &[], ResponseContext::Jackpot { amount_cents })
            }
            WireAction::MeterPoll => {
                let index = self.next_group;
                self.next_group = (self.next_group + 1) % self.meter_groups.len();
                self.poll_meter_group(index)
            }
        }
    }

    /// Send one long poll and route the decoded response through the
    /// dispatch table entry for its command code.
    fn long_poll(&mut self, command: u8, body: &[u8], context: ResponseContext) -> Result<(), LinkError> {
        let Some(spec) = command_spec(command) else {
            warn!(command = format_args!("{command:#04x}"), "no response spec for command");
            return Ok(());
        };
        let tx = frame::encode(self.config.address, command, body);
        match self.exchange(&tx, spec.shape) {
            Ok(reply) => {
                self.dispatch(command, spec, reply, context);
                Ok(())
            }
            Err(fault) => {
                if let ResponseContext::Aft { sent_at } = context {
                    self.aft.on_link_failure(sent_at);
                }
                Err(fault)
            }
        }
    }

    fn dispatch(&mut self, command: u8, spec: CommandSpec, reply: DecodedFrame, context: ResponseContext) {
        // Ack shapes carry no command echo; everything else must echo the
        // command we sent.
        if matches!(spec.shape, ResponseShape::Fixed(_) | ResponseShape::Variable) && reply.command != command {
            warn!(
                sent = format_args!("{command:#04x}"),
                echoed = format_args!("{:#04x}", reply.command),
                "unexpected command echo"
            );
            return;
        }

        match spec.handler {
            ResponseHandler::SelectedMeters => self.handle_meter_records(&reply.payload),
            ResponseHandler::AftTransfer => match self.aft.on_response(&reply.payload, Instant::now()) {
                Ok(events) => {
                    for event in events {
                        self.emit(event);
                    }
                }
                Err(e) => warn!(error = %e, "aft response rejected"),
            },
            ResponseHandler::HandpayInfo => match decode_bcd(&reply.payload[2..7]) {
                Ok(amount_cents) => self.emit(AgentEvent::HandpayDetected {
                    amount_cents,
                    observed_at: unix_ts(),
                }),
                Err(e) => warn!(error = %e, "handpay amount not bcd"),
            },
            ResponseHandler::HandpayResetAck => {
                let acked = reply.payload[0] == self.config.address;
                if !acked {
                    warn!(reply = format_args!("{:#04x}", reply.payload[0]), "handpay reset nacked");
                }
                let amount_cents = match context {
                    ResponseContext::Jackpot { amount_cents } => amount_cents,
                    _ => 0,
                };
                self.emit(AgentEvent::JackpotReset {
                    amount_cents,
                    acked,
                    observed_at: unix_ts(),
                });
            }
        }
    }

    /// Send one frame and decode its response, retrying the same frame on
    /// CRC and timing faults. Exhaustion is a link fault; the caller moves
    /// the engine to `Recovering`.
    fn exchange(&mut self, tx: &[u8], shape: ResponseShape) -> Result<DecodedFrame, LinkError> {
        let mut attempt = 0u32;
        loop {
            let result = {
                let link = self.link.as_mut().ok_or(LinkError::DeviceGone)?;
                link.send(tx).and_then(|_| frame::decode(link, shape))
            };
            match result {
                Ok(frame) => return Ok(frame),
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    attempt += 1;
                    debug!(attempt, error = %e, "frame retry");
                    std::thread::sleep(RETRY_BACKOFF);
                }
                Err(LinkError::DeviceGone) => {
                    self.link = None;
                    return Err(LinkError::DeviceGone);
                }
                Err(e) => {
                    debug!(error = %e, "frame retries exhausted");
                    return Err(LinkError::LinkFault);
                }
            }
        }
    }

    fn general_poll(&mut self) -> Result<u8, LinkError> {
        let poll = [self.config.address | GENERAL_POLL_BIT];
        let frame = self.exchange(&poll, ResponseShape::SingleByte)?;
        Ok(frame.payload[0])
    }

    fn handle_exception(&mut self, code: u8) {
        let name = exception_name(code);
        debug!(code = format_args!("{code:#04x}"), name, "exception reported");
        self.emit(AgentEvent::EgmException {
            code,
            name: name.to_string(),
            observed_at: unix_ts(),
        });

        // A pending handpay is worth an immediate amount interrogation.
        if code == EXCEPTION_HANDPAY_PENDING {
            if let Err(e) = self.long_poll(HANDPAY_INFO_COMMAND, &[], ResponseContext::None) {
                warn!(error = %e, "handpay interrogation failed");
            }
        }
    }

    fn poll_meter_group(&mut self, index: usize) -> Result<(), LinkError> {
        let (length_bytes, codes) = {
            let group = &self.meter_groups[index];
            (group.length_bytes, group.codes.clone())
        };

        let mut body = Vec::with_capacity(codes.len() + 2);
        body.push((codes.len() + 1) as u8);
        body.push(length_bytes);
        body.extend_from_slice(&codes);

        self.long_poll(METER_POLL_COMMAND, &body, ResponseContext::None)
    }

    /// Split a 2F response payload into `meter_code || BCD value` records
    /// using the configured per-meter widths.
    fn handle_meter_records(&mut self, payload: &[u8]) {
        let observed_at = unix_ts();
        let mut rest = payload;
        while !rest.is_empty() {
            let code = rest[0];
            let Some(&length) = self.meter_lengths.get(&code) else {
                warn!(
                    meter_code = format_args!("{code:#04x}"),
                    "meter record for unconfigured code, discarding rest of frame"
                );
                return;
            };
            let length = length as usize;
            if rest.len() < 1 + length {
                warn!(
                    meter_code = format_args!("{code:#04x}"),
                    "truncated meter record"
                );
                return;
            }
            let raw = &rest[1..1 + length];
            match decode_bcd(raw) {
                Ok(value) => {
                    let reading = MeterReading {
                        meter_code: code,
                        raw_bcd: raw.to_vec(),
                        value,
                        observed_at,
                    };
                    if let Some(event) = self.meters.observe(reading) {
                        self.emit(event);
                    }
                }
                Err(e) => warn!(meter_code = format_args!("{code:#04x}"), error = %e, "meter value not bcd"),
            }
            rest = &rest[1 + length..];
        }
    }

    fn enter_recovering(&mut self) {
        if self.state != LinkState::Recovering {
            warn!("link fault, entering recovery");
            self.state = LinkState::Recovering;
            self.reopen_backoff = REOPEN_INITIAL;
        }
    }

    fn emit(&mut self, event: AgentEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(tokio::sync::mpsc::error::TrySendError::Full(event)) => {
                warn!(?event, "event channel full, dropping");
            }
            Err(tokio::sync::mpsc::error::TrySendError::Closed(_)) => {
                debug!("event channel closed");
            }
        }
    }

    /// Sleep in short slices so shutdown stays responsive.
    fn sleep_checked(&self, total: Duration) {
        let slice = Duration::from_millis(100);
        let mut remaining = total;
        while remaining > Duration::ZERO {
            if self.shutdown.load(Ordering::Relaxed) {
                return;
            }
            let step = remaining.min(slice);
            std::thread::sleep(step);
            remaining -= step;
        }
    }
}
