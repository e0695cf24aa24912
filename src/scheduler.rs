//! Bus scheduler: executes the frame graph against a virtual clock
//!
//! A run walks one major frame per cycle, depth-first through its minor
//! frames, performing one transfer at a time. Cycle `n + 1` never starts
//! before cycle `n` start plus the major frame period; a cycle whose work
//! takes longer than the period is counted as an overrun and the next one
//! begins at the first period boundary after the work ended.

use std::collections::VecDeque;
use std::num::NonZeroU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::bus;
use crate::catalog::Direction;
use crate::core::{Channel, FrameId, MessageId};
use crate::error::{BcError, Entity, GraphFault, Result};
use crate::frame::FrameKind;
use crate::hbuf::DecodedRecord;
use crate::opcode::Instruction;
use crate::session::Device;
use crate::terminal::{TransferRequest, TransferResponse};
use crate::word::BlockStatus;

/// Number of major frame cycles to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RepeatCount {
    /// Run this many cycles, then stop
    Times(NonZeroU32),
    /// Run until explicitly stopped
    Indefinite,
}

impl RepeatCount {
    /// Interpret a raw count, where `-1` means indefinitely
    pub fn from_raw(count: i32) -> Result<Self> {
        match count {
            -1 => Ok(RepeatCount::Indefinite),
            n if n > 0 => Self::times(n as u32),
            n => Err(BcError::invalid_argument(format!(
                "Repeat count {} is neither positive nor -1",
                n
            ))),
        }
    }

    /// Run exactly `count` cycles
    pub fn times(count: u32) -> Result<Self> {
        NonZeroU32::new(count)
            .map(RepeatCount::Times)
            .ok_or_else(|| BcError::invalid_argument("Repeat count must be positive"))
    }

    fn allows(&self, completed: u64) -> bool {
        match self {
            RepeatCount::Times(n) => completed < n.get() as u64,
            RepeatCount::Indefinite => true,
        }
    }
}

/// Priority of an asynchronous transfer request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AsyncPriority {
    /// Sent at the end of the current minor frame
    #[default]
    Low,
    /// Sent at the next opcode boundary
    High,
}

impl AsyncPriority {
    /// Integer code used at the driver boundary
    pub fn code(&self) -> u16 {
        match self {
            AsyncPriority::Low => 1,
            AsyncPriority::High => 2,
        }
    }
}

impl TryFrom<u16> for AsyncPriority {
    type Error = BcError;

    fn try_from(value: u16) -> Result<Self> {
        match value {
            1 => Ok(AsyncPriority::Low),
            2 => Ok(AsyncPriority::High),
            _ => Err(BcError::invalid_argument(format!(
                "Unknown asynchronous mode: {}",
                value
            ))),
        }
    }
}

/// How virtual time relates to wall-clock time in background runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Pacing {
    /// Cycles run back to back as fast as the host allows
    Unpaced,
    /// Each cycle waits until its virtual start time has elapsed on the wall clock
    #[default]
    RealTime,
}

/// Scheduler state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SchedulerState {
    #[default]
    Stopped,
    Running,
}

/// Timing of one completed major frame cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CycleReport {
    /// Zero-based cycle index within the run
    pub index: u64,
    /// Virtual start time, in microseconds
    pub start_us: u64,
    /// Virtual time the last transfer of the cycle finished
    pub end_us: u64,
    /// Whether the cycle's work exceeded the major frame period
    pub overrun: bool,
}

/// Snapshot of scheduler progress
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SchedulerStatus {
    /// Current state
    pub state: SchedulerState,
    /// Major frame of the current or last run
    pub major_frame: Option<FrameId>,
    /// Completed cycles in the current or last run
    pub cycles: u64,
    /// Cycles whose work exceeded the period
    pub overruns: u64,
    /// Completed transfers, scheduled and asynchronous
    pub transfers: u64,
    /// Completed asynchronous transfers
    pub async_transfers: u64,
    /// Virtual clock, in microseconds
    pub clock_us: u64,
    /// Most recent cycles, oldest first
    pub recent_cycles: Vec<CycleReport>,
    /// Error that ended the last run, if any
    pub fault: Option<BcError>,
}

/// Outcome of a run that ended without a fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RunSummary {
    /// Completed cycles
    pub cycles: u64,
    /// Overrun cycles
    pub overruns: u64,
    /// Completed transfers
    pub transfers: u64,
    /// Virtual clock at the end of the run
    pub clock_us: u64,
    /// Whether the run ended because of a stop request
    pub stopped: bool,
}

/// Scheduler bookkeeping shared with the session API
#[derive(Debug, Default)]
pub(crate) struct Control {
    pub(crate) status: SchedulerStatus,
    history: VecDeque<CycleReport>,
    high: VecDeque<MessageId>,
    low: VecDeque<MessageId>,
}

impl Control {
    /// Reset progress for a new run; returns the virtual time it starts at
    pub(crate) fn begin(&mut self, major: FrameId) -> u64 {
        let clock_us = self.status.clock_us;
        self.status = SchedulerStatus {
            state: SchedulerState::Running,
            major_frame: Some(major),
            clock_us,
            ..Default::default()
        };
        self.history.clear();
        clock_us
    }

    /// Drop queued requests for `message`; returns how many were removed
    pub(crate) fn cancel(&mut self, message: MessageId) -> usize {
        let before = self.queued();
        self.high.retain(|&queued| queued != message);
        self.low.retain(|&queued| queued != message);
        before - self.queued()
    }

    pub(crate) fn enqueue(&mut self, message: MessageId, priority: AsyncPriority) {
        match priority {
            AsyncPriority::High => self.high.push_back(message),
            AsyncPriority::Low => self.low.push_back(message),
        }
    }

    pub(crate) fn queued(&self) -> usize {
        self.high.len() + self.low.len()
    }

    pub(crate) fn snapshot(&self) -> SchedulerStatus {
        let mut status = self.status.clone();
        status.recent_cycles = self.history.iter().copied().collect();
        status
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stopped,
}

/// Executes one run of a major frame on the calling thread
pub(crate) struct Runner {
    device: Arc<Device>,
    major: FrameId,
    period_us: u64,
    repeat: RepeatCount,
    base_us: u64,
    clock_us: u64,
    transfers: u64,
    async_transfers: u64,
    origin: Instant,
}

impl Runner {
    /// Prepare a run whose first cycle starts at virtual time `clock_us`
    pub(crate) fn new(
        device: Arc<Device>,
        major: FrameId,
        period: u32,
        repeat: RepeatCount,
        clock_us: u64,
    ) -> Self {
        Runner {
            device,
            major,
            period_us: period as u64 * bus::FRAME_TIME_UNIT_US,
            repeat,
            base_us: clock_us,
            clock_us,
            transfers: 0,
            async_transfers: 0,
            origin: Instant::now(),
        }
    }

    /// Run to completion, stop request or fault; always leaves the scheduler stopped
    pub(crate) fn run(mut self, pacing: Pacing) -> Result<RunSummary> {
        info!(
            device = self.device.config.device,
            major = %self.major,
            period_us = self.period_us,
            repeat = ?self.repeat,
            "scheduler started"
        );
        let result = self.cycles(pacing);

        let mut control = self.device.control.lock();
        control.status.state = SchedulerState::Stopped;
        control.status.clock_us = self.clock_us;
        match &result {
            Ok(summary) => info!(
                device = self.device.config.device,
                cycles = summary.cycles,
                overruns = summary.overruns,
                transfers = summary.transfers,
                stopped = summary.stopped,
                "scheduler stopped"
            ),
            Err(fault) => {
                warn!(device = self.device.config.device, %fault, "scheduler run aborted");
                control.status.fault = Some(fault.clone());
            }
        }
        self.device.wake.notify_all();
        result
    }

    fn cycles(&mut self, pacing: Pacing) -> Result<RunSummary> {
        let mut completed = 0u64;
        let mut overruns = 0u64;
        let mut next_start = self.clock_us;
        let mut stopped = false;

        while self.repeat.allows(completed) {
            if !self.wait_for_start(next_start, pacing) {
                stopped = true;
                break;
            }
            self.clock_us = next_start;
            let start = self.clock_us;

            if self.execute_frame(self.major, 0)? == Flow::Stopped {
                stopped = true;
                break;
            }

            let end = self.clock_us;
            let work = end - start;
            let overrun = work > self.period_us;
            let periods = if overrun {
                work.div_ceil(self.period_us)
            } else {
                1
            };
            next_start = start + periods * self.period_us;
            if overrun {
                overruns += 1;
                warn!(
                    major = %self.major,
                    cycle = completed,
                    work_us = end - start,
                    period_us = self.period_us,
                    "major frame overrun"
                );
            }

            self.publish_cycle(CycleReport {
                index: completed,
                start_us: start,
                end_us: end,
                overrun,
            });
            completed += 1;
        }

        Ok(RunSummary {
            cycles: completed,
            overruns,
            transfers: self.transfers,
            clock_us: self.clock_us,
            stopped,
        })
    }

    fn stop_requested(&self) -> bool {
        self.device.stop.load(Ordering::Acquire)
    }

    /// Returns false if a stop was requested before the cycle could start
    fn wait_for_start(&self, start_us: u64, pacing: Pacing) -> bool {
        if self.stop_requested() {
            return false;
        }
        if pacing == Pacing::Unpaced {
            return true;
        }
        let deadline = self.origin + Duration::from_micros(start_us - self.base_us);
        let mut control = self.device.control.lock();
        while !self.stop_requested() && Instant::now() < deadline {
            self.device.wake.wait_until(&mut control, deadline);
        }
        !self.stop_requested()
    }

    fn publish_cycle(&self, report: CycleReport) {
        let mut control = self.device.control.lock();
        control.status.cycles += 1;
        if report.overrun {
            control.status.overruns += 1;
        }
        control.status.clock_us = self.clock_us;
        if control.history.len() == self.device.config.cycle_history {
            control.history.pop_front();
        }
        if self.device.config.cycle_history > 0 {
            control.history.push_back(report);
        }
        self.device.wake.notify_all();
    }

    fn execute_frame(&mut self, id: FrameId, depth: usize) -> Result<Flow> {
        let (kind, opcodes) = {
            let setup = self.device.setup.lock();
            if depth > setup.frames.len() {
                return Err(BcError::graph(Some(id), None, GraphFault::Cycle));
            }
            let frame = setup.frames.get(id).ok_or_else(|| {
                let entity = if depth == 0 {
                    Entity::MajorFrame
                } else {
                    Entity::MinorFrame
                };
                BcError::not_found(entity, id)
            })?;
            (frame.kind, frame.opcodes.clone())
        };

        for opcode_id in opcodes {
            if self.stop_requested() {
                return Ok(Flow::Stopped);
            }
            if self.service_async(AsyncPriority::High)? == Flow::Stopped {
                return Ok(Flow::Stopped);
            }

            let opcode = {
                let setup = self.device.setup.lock();
                setup
                    .opcodes
                    .get(opcode_id)
                    .copied()
                    .ok_or_else(|| BcError::not_found(Entity::OpCode, opcode_id))?
            };
            if !opcode.condition.holds() {
                continue;
            }
            match opcode.instruction {
                Instruction::ExecuteMessage(message) => self.transfer(message)?,
                Instruction::CallFrame(frame) => {
                    if self.execute_frame(frame, depth + 1)? == Flow::Stopped {
                        return Ok(Flow::Stopped);
                    }
                }
            }
        }

        if kind == FrameKind::Minor && self.service_async(AsyncPriority::Low)? == Flow::Stopped {
            return Ok(Flow::Stopped);
        }
        Ok(Flow::Continue)
    }

    /// Send queued asynchronous messages; a low-priority slot also drains high ones first
    fn service_async(&mut self, slot: AsyncPriority) -> Result<Flow> {
        loop {
            if self.stop_requested() {
                return Ok(Flow::Stopped);
            }
            let next = {
                let mut control = self.device.control.lock();
                match slot {
                    AsyncPriority::High => control.high.pop_front(),
                    AsyncPriority::Low => control.high.pop_front().or_else(|| control.low.pop_front()),
                }
            };
            let Some(message) = next else {
                return Ok(Flow::Continue);
            };
            match self.transfer(message) {
                Ok(()) => {
                    self.async_transfers += 1;
                    self.device.control.lock().status.async_transfers = self.async_transfers;
                }
                // Deleted after it was dequeued; the request is dropped.
                Err(BcError::NotFound {
                    entity: Entity::Message,
                    id,
                }) if id == message.value() => {
                    debug!(message = %message, "asynchronous message deleted before it was sent");
                }
                Err(fault) => return Err(fault),
            }
        }
    }

    fn transfer(&mut self, id: MessageId) -> Result<()> {
        let response_time_us = self.device.config.response_time_us as u64;
        let record = {
            let mut setup = self.device.setup.lock();
            let message = setup
                .catalog
                .message(id)
                .cloned()
                .ok_or_else(|| BcError::not_found(Entity::Message, id))?;
            let block = setup
                .catalog
                .data_block_mut(message.data_block)
                .ok_or_else(|| BcError::not_found(Entity::DataBlock, message.data_block))?;

            let count = message.word_count.get();
            let outgoing = match (message.direction, &message.async_buffer) {
                (Direction::BcToRt, Some(snapshot)) => snapshot.clone(),
                (Direction::BcToRt, None) => block.active_words()[..count].to_vec(),
                (Direction::RtToBc, _) => Vec::new(),
            };
            let command = message.command_word();
            let request = TransferRequest {
                command,
                address: message.address,
                sub_address: message.sub_address,
                direction: message.direction,
                word_count: message.word_count,
                channel: message.channel,
                data: &outgoing,
                time_us: self.clock_us,
            };
            let response = self.device.responder.lock().transfer(&request);

            let sent_words = match message.direction {
                Direction::BcToRt => count as u64,
                Direction::RtToBc => 0,
            };
            let mut block_status = BlockStatus {
                end_of_message: true,
                channel_b: message.channel == Channel::B,
                ..Default::default()
            };

            let (status, data) = match response {
                TransferResponse::Completed { status, data } => {
                    let received = match message.direction {
                        Direction::RtToBc => {
                            let mut words = data;
                            words.resize(count, 0);
                            block.write_inactive(&words)?;
                            words
                        }
                        Direction::BcToRt => outgoing,
                    };
                    if message.async_buffer.is_none() {
                        block.flip();
                    }
                    let answered = status.is_some();
                    let returned = match message.direction {
                        Direction::RtToBc => count as u64,
                        Direction::BcToRt => 0,
                    };
                    let mut busy_us = (1 + sent_words + returned) * bus::WORD_TIME_US;
                    if answered {
                        busy_us += bus::WORD_TIME_US + response_time_us;
                    }
                    self.clock_us += busy_us;
                    block_status.status_set = status.is_some_and(|s| s.has_exception());
                    (status, received)
                }
                TransferResponse::NoResponse => {
                    self.clock_us += (1 + sent_words) * bus::WORD_TIME_US + bus::NO_RESPONSE_TIMEOUT_US;
                    block_status.error = true;
                    block_status.no_response = true;
                    (None, Vec::new())
                }
            };

            DecodedRecord {
                message: id,
                direction: message.direction,
                block_status,
                time_tag: self.clock_us,
                command,
                status,
                word_count: data.len(),
                data,
                channel: message.channel,
                gap_time_us: message.gap_time_us,
            }
        };
        self.clock_us += (record.gap_time_us as u64).max(bus::MIN_GAP_US);
        self.transfers += 1;

        debug!(
            message = %id,
            time_tag = record.time_tag,
            words = record.word_count,
            no_response = record.block_status.no_response,
            "transfer complete"
        );
        if let Some(hbuf) = self.device.hbuf.get() {
            hbuf.push(record);
        }
        self.device.control.lock().status.transfers = self.transfers;
        Ok(())
    }
}
