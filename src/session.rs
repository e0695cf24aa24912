//! Device session: owns every entity of one bus controller

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::bus;
use crate::catalog::{BlockKind, MessageCatalog, MessageSpec};
use crate::core::{DataBlockId, FrameId, MessageId, OpCodeId};
use crate::error::{BcError, Entity, Result};
use crate::frame::{FrameGraph, FrameKind};
use crate::hbuf::{Drained, HardwareBuffer, MsgLocation};
use crate::opcode::{Condition, Instruction, OpCodeTable};
use crate::scheduler::{
    AsyncPriority, Control, Pacing, RepeatCount, RunSummary, Runner, SchedulerState,
    SchedulerStatus,
};
use crate::terminal::{BusResponder, SimulatedBus};

/// Tunable parameters of a device session
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SessionConfig {
    /// Device number, used to tell sessions apart in logs
    pub device: u16,
    /// How runs relate virtual time to the wall clock
    pub pacing: Pacing,
    /// Simulated remote terminal response time, in microseconds
    pub response_time_us: u32,
    /// Number of recent cycle reports kept in the scheduler status
    pub cycle_history: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            device: 0,
            pacing: Pacing::RealTime,
            response_time_us: bus::DEFAULT_RESPONSE_TIME_US,
            cycle_history: 64,
        }
    }
}

/// Builder for device sessions
pub struct SessionBuilder {
    config: SessionConfig,
    responder: Option<Box<dyn BusResponder>>,
}

impl SessionBuilder {
    /// Create a new session builder
    pub fn new() -> Self {
        SessionBuilder {
            config: SessionConfig::default(),
            responder: None,
        }
    }

    /// Replace the whole configuration
    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the device number
    pub fn with_device(mut self, device: u16) -> Self {
        self.config.device = device;
        self
    }

    /// Set the pacing of runs
    pub fn with_pacing(mut self, pacing: Pacing) -> Self {
        self.config.pacing = pacing;
        self
    }

    /// Set the simulated response time
    pub fn with_response_time(mut self, response_time_us: u32) -> Self {
        self.config.response_time_us = response_time_us;
        self
    }

    /// Set how many cycle reports are kept
    pub fn with_cycle_history(mut self, cycles: usize) -> Self {
        self.config.cycle_history = cycles;
        self
    }

    /// Answer transfers with `responder` instead of a fresh [`SimulatedBus`]
    pub fn with_responder(mut self, responder: impl BusResponder + 'static) -> Self {
        self.responder = Some(Box::new(responder));
        self
    }

    /// Build the session
    pub fn build(self) -> DeviceSession {
        let responder = self
            .responder
            .unwrap_or_else(|| Box::new(SimulatedBus::new()));
        info!(device = self.config.device, pacing = ?self.config.pacing, "device initialized");
        DeviceSession {
            device: Arc::new(Device {
                config: self.config,
                setup: Mutex::new(Setup::default()),
                hbuf: OnceLock::new(),
                responder: Mutex::new(responder),
                control: Mutex::new(Control::default()),
                wake: Condvar::new(),
                stop: AtomicBool::new(false),
            }),
            runner: None,
        }
    }
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Catalog, opcode table and frame graph, with their validation stamp
#[derive(Debug, Default)]
pub(crate) struct Setup {
    pub(crate) catalog: MessageCatalog,
    pub(crate) opcodes: OpCodeTable,
    pub(crate) frames: FrameGraph,
    generation: u64,
    validated: Option<u64>,
}

impl Setup {
    fn touch(&mut self) {
        self.generation += 1;
    }

    fn is_validated(&self) -> bool {
        self.validated == Some(self.generation)
    }
}

/// State shared between the session API and its runner thread
pub(crate) struct Device {
    pub(crate) config: SessionConfig,
    pub(crate) setup: Mutex<Setup>,
    pub(crate) hbuf: OnceLock<Arc<HardwareBuffer>>,
    pub(crate) responder: Mutex<Box<dyn BusResponder>>,
    pub(crate) control: Mutex<Control>,
    pub(crate) wake: Condvar,
    pub(crate) stop: AtomicBool,
}

/// One bus controller device and everything it owns
///
/// Configuration calls (data blocks, messages, opcodes, frames) may be made
/// at any time; any change to them requires a fresh [`validate`] before the
/// next [`start`]. Dropping the session stops a running scheduler.
///
/// [`validate`]: DeviceSession::validate
/// [`start`]: DeviceSession::start
pub struct DeviceSession {
    device: Arc<Device>,
    runner: Option<JoinHandle<Result<RunSummary>>>,
}

impl DeviceSession {
    /// Open a session for `device` with default configuration
    pub fn initialize(device: u16) -> Self {
        SessionBuilder::new().with_device(device).build()
    }

    /// Device number of this session
    pub fn device(&self) -> u16 {
        self.device.config.device
    }

    /// Session configuration
    pub fn config(&self) -> &SessionConfig {
        &self.device.config
    }

    fn configure<T>(&self, change: impl FnOnce(&mut Setup) -> Result<T>) -> Result<T> {
        let mut setup = self.device.setup.lock();
        let value = change(&mut setup)?;
        setup.touch();
        Ok(value)
    }

    /// Create a data block seeded with `initial`
    pub fn create_data_block(
        &self,
        id: impl Into<DataBlockId>,
        kind: BlockKind,
        capacity: usize,
        initial: &[u16],
    ) -> Result<()> {
        let id = id.into();
        self.configure(|setup| setup.catalog.create_data_block(id, kind, capacity, initial))
    }

    /// Delete a data block no message references
    pub fn delete_data_block(&self, id: impl Into<DataBlockId>) -> Result<()> {
        let id = id.into();
        self.configure(|setup| setup.catalog.delete_data_block(id))
    }

    /// Create a scheduled message
    pub fn create_message(&self, spec: MessageSpec) -> Result<()> {
        self.configure(|setup| setup.catalog.create_message(spec))
    }

    /// Create an asynchronous BC->RT message carrying `buffer`
    pub fn create_async_message(&self, spec: MessageSpec, buffer: &[u16]) -> Result<()> {
        self.configure(|setup| setup.catalog.create_async_message(spec, buffer))
    }

    /// Delete a message, dropping any queued asynchronous sends of it
    pub fn delete_message(&self, id: impl Into<MessageId>) -> Result<()> {
        let id = id.into();
        self.configure(|setup| setup.catalog.delete_message(id))?;
        let cancelled = self.device.control.lock().cancel(id);
        if cancelled > 0 {
            debug!(device = self.device(), message = %id, cancelled, "queued asynchronous transfers dropped");
        }
        Ok(())
    }

    /// Write host data into the inactive side of a data block
    pub fn write_data_block(&self, id: impl Into<DataBlockId>, words: &[u16]) -> Result<()> {
        let id = id.into();
        let mut setup = self.device.setup.lock();
        setup
            .catalog
            .data_block_mut(id)
            .ok_or_else(|| BcError::not_found(Entity::DataBlock, id))?
            .write_inactive(words)
    }

    /// Read the active side of a data block
    pub fn read_data_block(&self, id: impl Into<DataBlockId>) -> Result<Vec<u16>> {
        let id = id.into();
        let setup = self.device.setup.lock();
        setup
            .catalog
            .data_block(id)
            .map(|block| block.active_words().to_vec())
            .ok_or_else(|| BcError::not_found(Entity::DataBlock, id))
    }

    /// Record an opcode; its target is resolved by [`validate`](Self::validate)
    pub fn create_opcode(
        &self,
        id: impl Into<OpCodeId>,
        instruction: Instruction,
        condition: Condition,
    ) -> Result<()> {
        let id = id.into();
        self.configure(|setup| setup.opcodes.create(id, instruction, condition))
    }

    /// Create a frame; `period` is required for major frames, in 100 µs units
    pub fn create_frame(
        &self,
        id: impl Into<FrameId>,
        kind: FrameKind,
        opcodes: &[OpCodeId],
        period: Option<u32>,
    ) -> Result<()> {
        let id = id.into();
        self.configure(|setup| setup.frames.create_frame(id, kind, opcodes, period))
    }

    /// Delete a frame
    pub fn delete_frame(&self, id: impl Into<FrameId>) -> Result<()> {
        let id = id.into();
        self.configure(|setup| setup.frames.delete_frame(id))
    }

    /// Validate the frame graph against the opcode table and catalog
    pub fn validate(&self) -> Result<()> {
        let mut setup = self.device.setup.lock();
        setup.validated = None;
        setup.frames.validate(&setup.opcodes, &setup.catalog)?;
        setup.validated = Some(setup.generation);
        debug!(device = self.device(), frames = setup.frames.len(), "frame graph validated");
        Ok(())
    }

    /// Install the hardware buffer; allowed once per session
    pub fn install_buffer(&self, capacity: usize) -> Result<()> {
        if self.device.hbuf.get().is_some() {
            return Err(BcError::invalid_state("Hardware buffer already installed"));
        }
        let buffer = Arc::new(HardwareBuffer::new(capacity)?);
        self.device
            .hbuf
            .set(buffer)
            .map_err(|_| BcError::invalid_state("Hardware buffer already installed"))?;
        info!(device = self.device(), capacity, "hardware buffer installed");
        Ok(())
    }

    /// Shared handle to the hardware buffer, for readers on other threads
    pub fn hardware_buffer(&self) -> Result<Arc<HardwareBuffer>> {
        self.device
            .hbuf
            .get()
            .cloned()
            .ok_or_else(|| BcError::not_ready("Hardware buffer not installed"))
    }

    /// Retrieve a decoded record from the hardware buffer without blocking
    pub fn drain(&self, location: MsgLocation) -> Result<Drained> {
        Ok(self.hardware_buffer()?.drain(location))
    }

    fn reap(&mut self) {
        if self.state() == SchedulerState::Stopped {
            if let Some(handle) = self.runner.take() {
                let _ = handle.join();
            }
        }
    }

    fn prepare(&self, major: FrameId, repeat: RepeatCount) -> Result<Runner> {
        let mut control = self.device.control.lock();
        if control.status.state == SchedulerState::Running {
            return Err(BcError::invalid_state("Scheduler already running"));
        }
        let period = {
            let setup = self.device.setup.lock();
            if !setup.is_validated() {
                return Err(BcError::not_ready("Frame graph has not been validated"));
            }
            setup
                .frames
                .get(major)
                .filter(|frame| frame.kind == FrameKind::Major)
                .and_then(|frame| frame.period)
                .ok_or_else(|| BcError::not_found(Entity::MajorFrame, major))?
        };
        if self.device.hbuf.get().is_none() {
            warn!(device = self.device(), "no hardware buffer installed; transfers will not be captured");
        }

        let clock_us = control.begin(major);
        self.device.stop.store(false, Ordering::Release);
        Ok(Runner::new(Arc::clone(&self.device), major, period, repeat, clock_us))
    }

    /// Start running `major` in the background
    pub fn start(&mut self, major: impl Into<FrameId>, repeat: RepeatCount) -> Result<()> {
        self.reap();
        let runner = self.prepare(major.into(), repeat)?;
        let pacing = self.device.config.pacing;
        let spawned = thread::Builder::new()
            .name(format!("bc-scheduler-{}", self.device()))
            .spawn(move || runner.run(pacing));
        match spawned {
            Ok(handle) => {
                self.runner = Some(handle);
                Ok(())
            }
            Err(err) => {
                self.device.control.lock().status.state = SchedulerState::Stopped;
                Err(BcError::invalid_state(format!(
                    "Cannot spawn scheduler thread: {}",
                    err
                )))
            }
        }
    }

    /// Run a finite number of cycles of `major` on the calling thread
    pub fn run_blocking(
        &mut self,
        major: impl Into<FrameId>,
        repeat: RepeatCount,
    ) -> Result<RunSummary> {
        if repeat == RepeatCount::Indefinite {
            return Err(BcError::invalid_argument(
                "A blocking run needs a finite repeat count",
            ));
        }
        self.reap();
        let runner = self.prepare(major.into(), repeat)?;
        runner.run(self.device.config.pacing)
    }

    /// Queue an asynchronous message for the next idle slot
    pub fn send_async(&self, message: impl Into<MessageId>, priority: AsyncPriority) -> Result<()> {
        let message = message.into();
        {
            let setup = self.device.setup.lock();
            match setup.catalog.message(message) {
                Some(msg) if msg.is_async() => {}
                _ => return Err(BcError::not_found(Entity::AsyncMessage, message)),
            }
        }
        let mut control = self.device.control.lock();
        control.enqueue(message, priority);
        debug!(device = self.device(), message = %message, ?priority, queued = control.queued(), "asynchronous transfer queued");
        Ok(())
    }

    /// Stop the scheduler after the opcode in progress
    ///
    /// Returns the fault that ended the background run, if there was one.
    /// Calling it again, or with no run in progress, succeeds.
    pub fn stop(&mut self) -> Result<()> {
        {
            let _control = self.device.control.lock();
            self.device.stop.store(true, Ordering::Release);
            self.device.wake.notify_all();
        }
        if let Some(handle) = self.runner.take() {
            let outcome = handle
                .join()
                .map_err(|_| BcError::invalid_state("Scheduler thread panicked"))?;
            outcome?;
        }
        Ok(())
    }

    /// Current scheduler state
    pub fn state(&self) -> SchedulerState {
        self.device.control.lock().status.state
    }

    /// Snapshot of scheduler progress
    pub fn status(&self) -> SchedulerStatus {
        self.device.control.lock().snapshot()
    }

    /// Wait until the current run has completed `cycles` cycles
    ///
    /// Returns false if the timeout expired or the run ended first.
    pub fn wait_for_cycles(&self, cycles: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut control = self.device.control.lock();
        while control.status.cycles < cycles && control.status.state == SchedulerState::Running {
            if self.device.wake.wait_until(&mut control, deadline).timed_out() {
                break;
            }
        }
        control.status.cycles >= cycles
    }

    /// Stop the scheduler and release the session
    pub fn free(mut self) -> Result<()> {
        self.stop()?;
        info!(device = self.device(), "device freed");
        Ok(())
    }
}

impl fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSession")
            .field("device", &self.device.config.device)
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
