//! ---
//! rl_section: "05-protocol-core"
//! rl_subsection: "module"
//! rl_type: "source"
//! rl_scope: "code"
//! rl_description: "Master orchestration of the room controller bus."
//! rl_version: "v0.0.0-prealpha"
//! rl_owner: "tbd"
//! ---
//! The master poll loop.
//!
//! Every exchange walks `Enumerate -> Send -> Pending -> Receiving -> Received | Error`
//! and returns to `Enumerate`. `poll` advances as far as it can without waiting on the
//! bus or a timer and then returns; it never fails and never blocks.
//!
//! Priority at `Enumerate`, highest first: a firmware or bootloader session, the log pull
//! cycle, an asset session, the ad-hoc command slot, the time broadcast, and finally the
//! round-robin status poll. A request that failed and still has attempts left is resent
//! before anything else is considered.

use std::ops::RangeInclusive;

use roomlink_logging::{
    log_system_event, rl_debug, rl_error, rl_info, rl_warn, BusContext, SystemEventOutcome,
};
use roomlink_metrics::ProtocolMetrics;
use roomlink_msg::{
    encode, AddressPair, BusTransport, FrameKind, LogRecord, Opcode, ReplyShape, ACK, NAK,
    RECORD_SIZE,
};
use roomlink_persistence::{LogError, NvStore};
use roomlink_rt::{Clock, Countdown};
use roomlink_transfer::{
    AssetSource, TransferEngine, TransferKind, TransferProgress, TransferReport,
};
use serde::{Deserialize, Serialize};
use strum::Display;
use tracing::{debug, info, warn};

use crate::attempt::{AttemptOutcome, ExchangeAttempt};
use crate::command::{AdHocCommand, CommandOutcome, CommandResult};
use crate::context::{CycleEnd, LogCycle, LogPhase, ProtocolContext, StatusFlags, StatusReply};
use crate::enumerator::Destination;
use crate::events::MasterEvent;
use crate::reply::{classify_reply, ReplyStatus};
use crate::scan::{BusScan, ScanMode, ScanReport};
use crate::{CommandError, CoreError, Result};

const MAX_STEPS_PER_POLL: usize = 8;

/// Orchestrator state for the exchange in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ProtocolState {
    Enumerate,
    Send,
    Pending,
    Receiving,
    Received,
    Error,
}

/// Why a request is on the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangePurpose {
    TimeBroadcast,
    StatusPoll {
        unit: u16,
    },
    LogQuery {
        unit: u16,
        offset: u16,
        max: u8,
    },
    LogDelete {
        unit: u16,
        count: u16,
    },
    Transfer {
        unit: u16,
        kind: TransferKind,
        echo: Option<u16>,
        arms_bootloader: bool,
    },
    AdHoc(AdHocCommand),
}

impl ExchangePurpose {
    pub fn label(&self) -> &'static str {
        match self {
            ExchangePurpose::TimeBroadcast => "time-broadcast",
            ExchangePurpose::StatusPoll { .. } => "status-poll",
            ExchangePurpose::LogQuery { .. } => "log-query",
            ExchangePurpose::LogDelete { .. } => "log-delete",
            ExchangePurpose::Transfer { .. } => "transfer",
            ExchangePurpose::AdHoc(_) => "ad-hoc",
        }
    }

    pub fn unit(&self) -> Option<u16> {
        match self {
            ExchangePurpose::TimeBroadcast => None,
            ExchangePurpose::StatusPoll { unit }
            | ExchangePurpose::LogQuery { unit, .. }
            | ExchangePurpose::LogDelete { unit, .. }
            | ExchangePurpose::Transfer { unit, .. } => Some(*unit),
            ExchangePurpose::AdHoc(command) => match command.destination {
                Destination::Unit(unit) => Some(unit),
                _ => None,
            },
        }
    }
}

#[derive(Debug, Clone)]
struct Exchange {
    purpose: ExchangePurpose,
    bytes: Vec<u8>,
    reply: ReplyShape,
    expect: AddressPair,
}

enum Step {
    Continue,
    Wait,
}

/// Master controller: the protocol context plus the bus and tick collaborators.
pub struct MasterController<S, B, C> {
    ctx: ProtocolContext<S>,
    bus: B,
    clock: C,
    state: ProtocolState,
    exchange: Option<Exchange>,
    reply_payload: Option<Vec<u8>>,
    attempt: ExchangeAttempt,
    response_timer: Countdown,
    byte_timer: Countdown,
    delay_timer: Countdown,
    settle_timer: Countdown,
    time_timer: Countdown,
    rx: Vec<u8>,
    metrics: Option<ProtocolMetrics>,
    ticks: u64,
}

impl<S, B, C> MasterController<S, B, C>
where
    S: NvStore,
    B: BusTransport,
    C: Clock,
{
    pub fn new(ctx: ProtocolContext<S>, bus: B, clock: C) -> Self {
        let attempt = ExchangeAttempt::new(ctx.settings.attempt_ceiling);
        Self {
            ctx,
            bus,
            clock,
            state: ProtocolState::Enumerate,
            exchange: None,
            reply_payload: None,
            attempt,
            response_timer: Countdown::stopped(),
            byte_timer: Countdown::stopped(),
            delay_timer: Countdown::stopped(),
            settle_timer: Countdown::stopped(),
            time_timer: Countdown::stopped(),
            rx: Vec::new(),
            metrics: None,
            ticks: 0,
        }
    }

    pub fn with_metrics(mut self, metrics: ProtocolMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn state(&self) -> ProtocolState {
        self.state
    }

    pub fn context(&self) -> &ProtocolContext<S> {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut ProtocolContext<S> {
        &mut self.ctx
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn flags(&self) -> StatusFlags {
        self.ctx.flags
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Purpose of the request currently on the bus or waiting to be resent.
    pub fn current_purpose(&self) -> Option<&ExchangePurpose> {
        self.exchange.as_ref().map(|exchange| &exchange.purpose)
    }

    /// Validate and queue an operator command.
    pub fn submit_command(
        &mut self,
        opcode: Opcode,
        destination: Destination,
        args: &str,
    ) -> std::result::Result<(), CommandError> {
        let table = self.ctx.enumerator.table();
        if let Destination::Unit(addr) = destination {
            if table.is_reserved(addr) || addr == self.ctx.settings.master {
                return Err(CommandError::ReservedAddress(addr));
            }
        }
        let command = AdHocCommand::parse(opcode, destination, args)?;
        if let Some(new) = command.new_bus_address() {
            if new == self.ctx.settings.master || table.is_reserved(new) {
                return Err(CommandError::ReservedAddress(new));
            }
            if table.contains(new) {
                return Err(CommandError::AddressInUse(new));
            }
        }
        self.ctx.commands.submit_parsed(command)
    }

    pub fn take_command_result(&mut self) -> Option<CommandResult> {
        self.ctx.commands.take_result()
    }

    /// Queue a firmware, bootloader or asset delivery to `unit`.
    pub fn submit_transfer(
        &mut self,
        kind: TransferKind,
        unit: u16,
        source: Box<dyn AssetSource>,
    ) -> Result<()> {
        if self.ctx.enumerator.table().is_reserved(unit) || unit == self.ctx.settings.master {
            return Err(CoreError::Address(format!(
                "{unit:#06x} cannot receive a transfer"
            )));
        }
        info!(unit, kind = kind.label(), source = %source.label(), "transfer queued");
        self.ctx.queue_transfer(kind, unit, source);
        Ok(())
    }

    /// Records `start_index..` of the master log, oldest first.
    pub fn get_log_page(&mut self, start_index: usize, max: usize) -> Result<Vec<LogRecord>> {
        Ok(self.ctx.log.read_page(start_index, max)?)
    }

    /// Drop the oldest `records` from the master log; clears `LOG_FULL` once room exists.
    pub fn delete_log_page(&mut self, records: usize) -> Result<usize> {
        let removed = self.ctx.log.delete_records(records)?;
        if !self.ctx.log.is_full() {
            self.ctx.flags.remove(StatusFlags::LOG_FULL);
        }
        Ok(removed)
    }

    /// Commissioning scan. Runs to completion; only allowed between exchanges.
    pub fn scan(&mut self, range: RangeInclusive<u16>, mode: ScanMode) -> Result<ScanReport> {
        if self.state != ProtocolState::Enumerate || self.exchange.is_some() {
            return Err(CoreError::Busy);
        }
        let settings = self.ctx.settings.scan_settings();
        let report = BusScan::new(
            &mut self.bus,
            &self.clock,
            self.ctx.enumerator.table(),
            range,
            mode,
            settings,
        )
        .run()?;
        let ctx = match report.found {
            Some(unit) => BusContext::new().with_unit(unit),
            None => BusContext::new(),
        };
        let outcome = if report.found.is_some() {
            SystemEventOutcome::Success
        } else {
            SystemEventOutcome::Fault
        };
        log_system_event(Some(&ctx), "bus.scan", "bus scan finished", outcome);
        self.delay_timer
            .start(self.clock.now_ms(), self.ctx.settings.inter_frame_delay);
        Ok(report)
    }

    /// One scheduler tick.
    pub fn poll(&mut self) -> ProtocolState {
        self.ticks += 1;
        for _ in 0..MAX_STEPS_PER_POLL {
            if let Step::Wait = self.step() {
                break;
            }
        }
        self.state
    }

    fn step(&mut self) -> Step {
        let now = self.clock.now_ms();
        match self.state {
            ProtocolState::Enumerate => self.enumerate(now),
            ProtocolState::Send => self.send(now),
            ProtocolState::Pending => self.pending(now),
            ProtocolState::Receiving => self.receiving(now),
            ProtocolState::Received => self.received(now),
            ProtocolState::Error => self.failed(now),
        }
    }

    fn bus_context(&self, purpose: &ExchangePurpose) -> BusContext<'static> {
        let ctx = BusContext::new()
            .with_purpose(purpose.label())
            .with_tick(self.ticks);
        match purpose.unit() {
            Some(unit) => ctx.with_unit(unit),
            None => ctx,
        }
    }

    fn record_exchange(&self, purpose: &ExchangePurpose, outcome: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_exchange(purpose.label(), outcome);
        }
    }

    fn stop_timers(&mut self) {
        self.response_timer.stop();
        self.byte_timer.stop();
    }

    fn enumerate(&mut self, now: u64) -> Step {
        if self.delay_timer.pending(now) || self.settle_timer.pending(now) {
            return Step::Wait;
        }
        self.delay_timer.stop();
        self.settle_timer.stop();

        if self.exchange.is_some() {
            self.state = ProtocolState::Send;
            return Step::Continue;
        }
        match self.choose_next(now) {
            Some(exchange) => {
                self.attempt.reset();
                self.exchange = Some(exchange);
                self.state = ProtocolState::Send;
                Step::Continue
            }
            None => Step::Wait,
        }
    }

    fn choose_next(&mut self, now: u64) -> Option<Exchange> {
        self.start_queued_transfer();

        let system_session = self
            .ctx
            .transfer
            .as_ref()
            .is_some_and(|engine| engine.is_active() && engine.kind().is_system_image());
        if system_session {
            return self.transfer_exchange();
        }
        if let Some(cycle) = self.ctx.log_cycle {
            return self.log_exchange(cycle);
        }
        if self.ctx.transfer.as_ref().is_some_and(TransferEngine::is_active) {
            return self.transfer_exchange();
        }
        if let Some(command) = self.ctx.commands.dispatch() {
            return self.command_exchange(command);
        }
        if !self.time_timer.is_running() || self.time_timer.expired(now) {
            self.time_timer
                .start(now, self.ctx.settings.time_broadcast_interval);
            return self.time_exchange();
        }
        let unit = self.ctx.enumerator.next_unit();
        self.request(
            ExchangePurpose::StatusPoll { unit },
            FrameKind::Command,
            unit,
            vec![Opcode::GetStatus.code()],
            ReplyShape::AckThenFrame,
        )
    }

    fn request(
        &self,
        purpose: ExchangePurpose,
        kind: FrameKind,
        dest: u16,
        payload: Vec<u8>,
        reply: ReplyShape,
    ) -> Option<Exchange> {
        let master = self.ctx.settings.master;
        match encode(kind, dest, master, payload) {
            Ok(frame) => Some(Exchange {
                purpose,
                bytes: frame.to_bytes(),
                reply,
                expect: AddressPair::reply(master, dest),
            }),
            Err(err) => {
                warn!(purpose = purpose.label(), error = %err, "request could not be framed");
                None
            }
        }
    }

    fn start_queued_transfer(&mut self) {
        let superseding = matches!(
            (&self.ctx.transfer, self.ctx.transfer_queue.front()),
            (Some(active), Some(next))
                if !active.kind().is_system_image() && next.kind.is_system_image()
        );
        if superseding {
            if let Some(mut engine) = self.ctx.transfer.take() {
                let report = engine.cancel();
                warn!(unit = report.unit, kind = report.kind.label(), "asset session superseded");
                if let Some(metrics) = &self.metrics {
                    metrics.record_transfer(report.kind.label(), "superseded");
                }
            }
        }
        if self.ctx.transfer.is_some() {
            return;
        }
        while let Some(queued) = self.ctx.transfer_queue.pop_front() {
            let (kind, unit) = (queued.kind, queued.unit);
            match TransferEngine::start(kind, unit, queued.source, &self.ctx.settings.transfer) {
                Ok(engine) => {
                    self.ctx.transfer = Some(engine);
                    return;
                }
                Err(err) => {
                    warn!(unit, kind = kind.label(), error = %err, "transfer could not start");
                    if let Some(metrics) = &self.metrics {
                        metrics.record_transfer(kind.label(), "rejected");
                    }
                    self.ctx.flags.insert(StatusFlags::LAST_TRANSFER_FAILED);
                    self.ctx.record_event(MasterEvent::TransferFailed { unit, kind });
                }
            }
        }
    }

    fn transfer_exchange(&mut self) -> Option<Exchange> {
        let master = self.ctx.settings.master;
        let engine = self.ctx.transfer.as_mut()?;
        let (unit, kind) = (engine.unit(), engine.kind());
        match engine.prepare_chunk(master) {
            Ok(prepared) => Some(Exchange {
                purpose: ExchangePurpose::Transfer {
                    unit,
                    kind,
                    echo: prepared.echo,
                    arms_bootloader: prepared.arms_bootloader,
                },
                bytes: prepared.frame.to_bytes(),
                reply: prepared.reply,
                expect: AddressPair::reply(master, unit),
            }),
            Err(err) => {
                warn!(unit, kind = kind.label(), error = %err, "transfer frame unavailable");
                let report = engine.cancel();
                self.ctx.transfer = None;
                self.finish_transfer(report, false);
                None
            }
        }
    }

    fn log_exchange(&mut self, cycle: LogCycle) -> Option<Exchange> {
        match cycle.phase {
            LogPhase::Query => {
                let offset = u16::try_from(cycle.stored).unwrap_or(u16::MAX);
                let max = self.ctx.settings.log_page_records;
                let [hi, lo] = offset.to_be_bytes();
                self.request(
                    ExchangePurpose::LogQuery {
                        unit: cycle.unit,
                        offset,
                        max,
                    },
                    FrameKind::Command,
                    cycle.unit,
                    vec![Opcode::GetLogList.code(), hi, lo, max],
                    ReplyShape::AckThenFrame,
                )
            }
            LogPhase::Delete => {
                let count = u16::try_from(cycle.stored).unwrap_or(u16::MAX);
                let [hi, lo] = count.to_be_bytes();
                self.request(
                    ExchangePurpose::LogDelete {
                        unit: cycle.unit,
                        count,
                    },
                    FrameKind::Command,
                    cycle.unit,
                    vec![Opcode::DeleteLogList.code(), hi, lo],
                    ReplyShape::AckOnly,
                )
            }
        }
    }

    fn command_exchange(&mut self, command: AdHocCommand) -> Option<Exchange> {
        let dest = command.destination.addr(self.ctx.enumerator.table());
        let payload = command.payload();
        let reply = command.reply();
        let exchange = self.request(
            ExchangePurpose::AdHoc(command),
            FrameKind::Command,
            dest,
            payload,
            reply,
        );
        if exchange.is_none() {
            self.ctx.commands.complete(CommandOutcome::Failed, 0);
        }
        exchange
    }

    fn time_exchange(&self) -> Option<Exchange> {
        let mut payload = vec![Opcode::SetClock.code()];
        payload.extend_from_slice(&self.ctx.now().0);
        self.request(
            ExchangePurpose::TimeBroadcast,
            FrameKind::Command,
            self.ctx.enumerator.broadcast_addr(),
            payload,
            ReplyShape::None,
        )
    }

    fn send(&mut self, now: u64) -> Step {
        let Some(exchange) = self.exchange.as_ref() else {
            self.state = ProtocolState::Enumerate;
            return Step::Continue;
        };
        self.bus.discard_received();
        self.rx.clear();
        self.reply_payload = None;
        self.attempt.record_send();

        if let Err(err) = self.bus.send(&exchange.bytes) {
            rl_warn!(context = self.bus_context(&exchange.purpose), "send failed: {}", err);
            self.state = ProtocolState::Error;
            return Step::Continue;
        }
        rl_debug!(
            context = self.bus_context(&exchange.purpose),
            "request sent, attempt {}",
            self.attempt.sends()
        );

        if !exchange.reply.expects_reply() {
            let purpose = exchange.purpose.clone();
            self.exchange = None;
            self.record_exchange(&purpose, "sent");
            if let ExchangePurpose::AdHoc(_) = purpose {
                self.ctx
                    .commands
                    .complete(CommandOutcome::Sent, self.attempt.sends());
            }
            self.delay_timer
                .start(now, self.ctx.settings.inter_frame_delay);
            self.state = ProtocolState::Enumerate;
            return Step::Continue;
        }

        let mut timeout = self.ctx.settings.response_timeout;
        if let ExchangePurpose::Transfer {
            arms_bootloader: true,
            ..
        } = exchange.purpose
        {
            timeout += self.ctx.settings.bootloader_settle;
        }
        self.response_timer.start(now, timeout);
        self.state = ProtocolState::Pending;
        Step::Continue
    }

    fn collect(&mut self, now: u64) -> bool {
        if self.bus.bytes_available() == 0 {
            return false;
        }
        self.rx.extend(self.bus.take_received());
        self.byte_timer.start(now, self.ctx.settings.byte_timeout);
        true
    }

    fn pending(&mut self, now: u64) -> Step {
        self.collect(now);
        let reply = match self.exchange.as_ref() {
            Some(exchange) => exchange.reply,
            None => {
                self.state = ProtocolState::Enumerate;
                return Step::Continue;
            }
        };
        self.state = match self.rx.first() {
            None if self.response_timer.expired(now) => {
                debug!(tick = self.ticks, "no reply before response timeout");
                ProtocolState::Error
            }
            None => return Step::Wait,
            Some(&NAK) => ProtocolState::Error,
            Some(&ACK) if reply == ReplyShape::AckOnly => ProtocolState::Received,
            Some(&ACK) => ProtocolState::Receiving,
            Some(_) => ProtocolState::Error,
        };
        Step::Continue
    }

    fn receiving(&mut self, now: u64) -> Step {
        self.collect(now);
        let Some(exchange) = self.exchange.as_ref() else {
            self.state = ProtocolState::Enumerate;
            return Step::Continue;
        };
        self.state = match classify_reply(&self.rx, exchange.reply, exchange.expect) {
            ReplyStatus::AckWithFrame(frame) => {
                self.reply_payload = Some(frame.payload);
                ProtocolState::Received
            }
            ReplyStatus::Incomplete if !self.byte_timer.expired(now) => return Step::Wait,
            _ => ProtocolState::Error,
        };
        Step::Continue
    }

    fn received(&mut self, now: u64) -> Step {
        self.stop_timers();
        let payload = self.reply_payload.take();
        let Some(exchange) = self.exchange.take() else {
            self.state = ProtocolState::Enumerate;
            return Step::Continue;
        };
        let accepted = match exchange.purpose.clone() {
            ExchangePurpose::StatusPoll { unit } => self.on_status(unit, payload.as_deref(), now),
            ExchangePurpose::LogQuery { unit, .. } => self.on_log_page(unit, payload.as_deref()),
            ExchangePurpose::LogDelete { count, .. } => self.on_log_deleted(count),
            ExchangePurpose::AdHoc(command) => self.on_command_reply(command, payload),
            ExchangePurpose::TimeBroadcast => true,
            ExchangePurpose::Transfer { echo, .. } => {
                let echoed = match (echo, payload.as_deref()) {
                    (Some(_), Some([hi, lo, ..])) => Some(u16::from_be_bytes([*hi, *lo])),
                    _ => None,
                };
                match self.ctx.transfer.as_mut() {
                    Some(engine) => {
                        let progress = engine.on_ack(echoed);
                        self.on_transfer_progress(exchange, progress, now);
                    }
                    None => debug!("transfer reply with no session"),
                }
                self.state = ProtocolState::Enumerate;
                return Step::Continue;
            }
        };
        if accepted {
            self.record_exchange(&exchange.purpose, "ok");
            self.state = ProtocolState::Enumerate;
        } else {
            rl_debug!(
                context = self.bus_context(&exchange.purpose),
                "reply payload rejected"
            );
            self.exchange = Some(exchange);
            self.state = ProtocolState::Error;
        }
        Step::Continue
    }

    fn failed(&mut self, now: u64) -> Step {
        self.stop_timers();
        self.reply_payload = None;
        self.state = ProtocolState::Enumerate;
        let Some(exchange) = self.exchange.take() else {
            return Step::Continue;
        };
        if let Some(metrics) = &self.metrics {
            metrics.record_failure(exchange.purpose.label());
        }
        self.delay_timer
            .start(now, self.ctx.settings.inter_frame_delay);

        if let ExchangePurpose::Transfer { .. } = exchange.purpose {
            if let Some(engine) = self.ctx.transfer.as_mut() {
                let progress = engine.on_failure();
                self.on_transfer_progress(exchange, progress, now);
            }
            return Step::Continue;
        }

        match self.attempt.record_failure() {
            AttemptOutcome::Retry { remaining } => {
                rl_debug!(
                    context = self.bus_context(&exchange.purpose),
                    "attempt failed, {} left",
                    remaining
                );
                self.exchange = Some(exchange);
            }
            AttemptOutcome::Exhausted => self.on_exhausted(exchange),
        }
        Step::Continue
    }

    fn on_exhausted(&mut self, exchange: Exchange) {
        rl_warn!(
            context = self.bus_context(&exchange.purpose),
            "request abandoned after {} attempts",
            self.attempt.sends()
        );
        self.record_exchange(&exchange.purpose, "exhausted");
        match exchange.purpose {
            ExchangePurpose::StatusPoll { unit } => {
                if self.ctx.units.record_exhausted(unit) {
                    self.ctx.record_event(MasterEvent::UnitUnreachable { unit });
                }
                self.publish_unreachable();
            }
            ExchangePurpose::LogQuery { unit, .. } | ExchangePurpose::LogDelete { unit, .. } => {
                self.ctx.log_cycle = None;
                self.ctx.flags.insert(StatusFlags::LOG_TRANSFER_FAILED);
                self.ctx.record_event(MasterEvent::LogTransferFailed { unit });
            }
            ExchangePurpose::AdHoc(_) => {
                self.ctx
                    .commands
                    .complete(CommandOutcome::Failed, self.attempt.sends());
            }
            ExchangePurpose::TimeBroadcast | ExchangePurpose::Transfer { .. } => {}
        }
    }

    fn publish_unreachable(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.set_unreachable(self.ctx.units.unreachable_count());
        }
    }

    fn on_status(&mut self, unit: u16, payload: Option<&[u8]>, now: u64) -> bool {
        let Some(reply) = payload.and_then(StatusReply::parse) else {
            return false;
        };
        let was_unreachable = self
            .ctx
            .units
            .get(unit)
            .is_some_and(|status| !status.reachable);
        if self.ctx.units.record_reply(unit, reply, now) {
            self.ctx.record_event(MasterEvent::SosReported { unit });
        }
        if was_unreachable {
            rl_info!(
                context = BusContext::new().with_unit(unit).with_purpose("status-poll"),
                "unit reachable again"
            );
            self.publish_unreachable();
        }
        if reply.has_logs && self.ctx.log_cycle.is_none() {
            if self.ctx.log.is_full() {
                self.ctx.flags.insert(StatusFlags::LOG_FULL);
            } else {
                debug!(unit, "unit holds logs, starting pull cycle");
                self.ctx.log_cycle = Some(LogCycle::new(unit));
            }
        }
        true
    }

    fn on_log_page(&mut self, unit: u16, payload: Option<&[u8]>) -> bool {
        let Some((&count, body)) = payload.and_then(<[u8]>::split_first) else {
            return false;
        };
        let count = usize::from(count);
        if count > usize::from(self.ctx.settings.log_page_records)
            || body.len() != count * RECORD_SIZE
        {
            return false;
        }
        let Ok(records) = body
            .chunks(RECORD_SIZE)
            .map(LogRecord::from_bytes)
            .collect::<std::result::Result<Vec<_>, _>>()
        else {
            return false;
        };
        let Some(mut cycle) = self.ctx.log_cycle.filter(|cycle| cycle.unit == unit) else {
            return true;
        };

        let mut stored = 0;
        let mut halted = None;
        for record in records {
            match self.ctx.log.append(record.event()) {
                Ok(_) => stored += 1,
                Err(LogError::Full) => {
                    halted = Some(CycleEnd::MasterFull);
                    break;
                }
                Err(err) => {
                    rl_error!(
                        context = BusContext::new().with_unit(unit).with_purpose("log-pull"),
                        "pulled record not stored: {}",
                        err
                    );
                    halted = Some(CycleEnd::StoreFailed);
                    break;
                }
            }
        }
        if let Some(metrics) = &self.metrics {
            metrics.add_log_records(stored);
        }
        cycle.stored += stored;
        cycle.rounds += 1;
        match halted {
            Some(CycleEnd::MasterFull) => self.ctx.flags.insert(StatusFlags::LOG_FULL),
            Some(_) => self.ctx.flags.insert(StatusFlags::LOG_TRANSFER_FAILED),
            None => {}
        }
        cycle.end = halted.or((count == 0).then_some(CycleEnd::Drained));
        if cycle.end.is_some() || cycle.rounds >= self.ctx.settings.log_cadence {
            if cycle.stored == 0 {
                self.ctx.log_cycle = None;
                self.log_cycle_ended(unit, cycle.end.unwrap_or(CycleEnd::Drained));
                return true;
            }
            cycle.phase = LogPhase::Delete;
        }
        self.ctx.log_cycle = Some(cycle);
        true
    }

    fn on_log_deleted(&mut self, count: u16) -> bool {
        let Some(mut cycle) = self.ctx.log_cycle else {
            return true;
        };
        cycle.stored = cycle.stored.saturating_sub(usize::from(count));
        if cycle.stored == 0 {
            if let Some(end) = cycle.end {
                self.ctx.log_cycle = None;
                self.log_cycle_ended(cycle.unit, end);
                return true;
            }
            cycle.phase = LogPhase::Query;
            cycle.rounds = 0;
        }
        // A remainder beyond one delete's reach stays in the Delete phase.
        self.ctx.log_cycle = Some(cycle);
        true
    }

    fn log_cycle_ended(&self, unit: u16, end: CycleEnd) {
        let ctx = BusContext::new().with_unit(unit).with_purpose("log-pull");
        match end {
            CycleEnd::Drained => log_system_event(
                Some(&ctx),
                "log.drained",
                "unit log pulled",
                SystemEventOutcome::Success,
            ),
            CycleEnd::MasterFull => log_system_event(
                Some(&ctx),
                "log.halted",
                "master log full, pull stopped",
                SystemEventOutcome::Fault,
            ),
            CycleEnd::StoreFailed => log_system_event(
                Some(&ctx),
                "log.halted",
                "master log write failed, pull stopped",
                SystemEventOutcome::Fault,
            ),
        }
    }

    fn on_command_reply(&mut self, command: AdHocCommand, payload: Option<Vec<u8>>) -> bool {
        if let (Some(new), Destination::Unit(old)) = (command.new_bus_address(), command.destination) {
            if self.ctx.enumerator.table().contains(old) {
                match self.ctx.enumerator.replace(old, new) {
                    Ok(()) => self.ctx.units.rename(old, new),
                    Err(err) => warn!(old, new, error = %err, "address table not updated"),
                }
            }
        }
        let outcome = match payload {
            Some(data) => CommandOutcome::Reply(data),
            None => CommandOutcome::Acked,
        };
        self.ctx.commands.complete(outcome, self.attempt.sends());
        true
    }

    fn on_transfer_progress(&mut self, exchange: Exchange, progress: TransferProgress, now: u64) {
        let ExchangePurpose::Transfer {
            kind,
            echo,
            arms_bootloader,
            ..
        } = exchange.purpose
        else {
            return;
        };
        let chunk_acked = echo.is_some()
            && matches!(progress, TransferProgress::Advanced | TransferProgress::Finished(_));
        if chunk_acked {
            if let Some(metrics) = &self.metrics {
                metrics.record_chunk(kind.label());
            }
        }
        match progress {
            TransferProgress::Advanced => {
                self.record_exchange(&exchange.purpose, "ok");
                if arms_bootloader {
                    self.settle_timer
                        .start(now, self.ctx.settings.bootloader_settle);
                }
            }
            TransferProgress::Retry { .. } => {
                self.exchange = Some(exchange);
            }
            TransferProgress::Finished(report) => {
                self.record_exchange(&exchange.purpose, "ok");
                self.finish_transfer(report, true);
                if !self.ctx.transfer.as_ref().is_some_and(TransferEngine::is_active) {
                    self.ctx.transfer = None;
                }
            }
            TransferProgress::Released => {
                self.record_exchange(&exchange.purpose, "ok");
                self.ctx.transfer = None;
            }
            TransferProgress::Failed(report) => {
                self.record_exchange(&exchange.purpose, "exhausted");
                self.ctx.transfer = None;
                self.finish_transfer(report, false);
            }
        }
    }

    fn finish_transfer(&mut self, report: TransferReport, ok: bool) {
        let (unit, kind) = (report.unit, report.kind);
        if let Some(metrics) = &self.metrics {
            metrics.record_transfer(kind.label(), if ok { "finished" } else { "failed" });
        }
        if ok {
            self.ctx.flags.remove(StatusFlags::LAST_TRANSFER_FAILED);
            self.ctx.record_event(MasterEvent::TransferFinished { unit, kind });
            if report.rearm_write_protect {
                rl_info!(
                    context = BusContext::new().with_unit(unit).with_purpose("transfer"),
                    "bootloader updated, flash write protection to be re-armed"
                );
            }
        } else {
            self.ctx.flags.insert(StatusFlags::LAST_TRANSFER_FAILED);
            self.ctx.record_event(MasterEvent::TransferFailed { unit, kind });
        }
        self.ctx.last_transfer = Some(report);
    }
}
