use std::io::{self, Write};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use milstd1553b_bc::{
    bus, AsyncPriority, BcError, BlockKind, Channel, Condition, DecodedRecord, DeviceSession,
    Direction, Drained, FrameId, FrameKind, Instruction, MessageId, MessageSpec, MsgLocation,
    OpCodeId, Pacing, RepeatCount, SchedulerStatus, SessionBuilder,
};
use tracing::debug;

/// Script line that could not be parsed
#[derive(Debug, thiserror::Error)]
#[error("line {line}: {message}")]
pub struct UsageError {
    line: usize,
    message: String,
}

#[derive(Debug, Parser)]
#[command(no_binary_name = true, disable_help_flag = true, disable_version_flag = true)]
struct ScriptLine {
    #[command(subcommand)]
    command: ScriptCommand,
}

#[derive(Debug, Subcommand)]
enum ScriptCommand {
    /// Open the device session.
    Init {
        #[arg(long, default_value_t = 0)]
        device: u16,
        /// Run cycles back to back instead of at wall-clock pace.
        #[arg(long)]
        unpaced: bool,
        #[arg(long = "response-time", value_name = "US", default_value_t = bus::DEFAULT_RESPONSE_TIME_US)]
        response_time: u32,
    },
    /// Create a data block.
    #[command(name = "create-datablock")]
    CreateDataBlock {
        id: u16,
        #[arg(long, value_enum, default_value_t = BlockArg::Single)]
        kind: BlockArg,
        #[arg(long, default_value_t = 32)]
        capacity: usize,
        /// Initial words, comma separated.
        #[arg(long, value_delimiter = ',', value_parser = parse_word)]
        data: Vec<u16>,
    },
    /// Delete a data block.
    #[command(name = "delete-datablock")]
    DeleteDataBlock { id: u16 },
    /// Write host data into a data block.
    #[command(name = "write-datablock")]
    WriteDataBlock {
        id: u16,
        #[arg(value_delimiter = ',', value_parser = parse_word, required = true)]
        data: Vec<u16>,
    },
    /// Print the active words of a data block.
    #[command(name = "read-datablock")]
    ReadDataBlock { id: u16 },
    /// Create a scheduled message.
    CreateMessage {
        id: u16,
        #[arg(value_enum)]
        direction: DirectionArg,
        block: u16,
        rt: u8,
        sa: u8,
        wc: u16,
        #[arg(long, default_value_t = 0)]
        gap: u16,
        #[arg(long, value_enum, default_value_t = ChannelArg::A)]
        channel: ChannelArg,
    },
    /// Create an asynchronous BC->RT message.
    CreateAsyncMessage {
        id: u16,
        block: u16,
        rt: u8,
        sa: u8,
        wc: u16,
        #[arg(long, value_delimiter = ',', value_parser = parse_word)]
        data: Vec<u16>,
        #[arg(long, default_value_t = 0)]
        gap: u16,
        #[arg(long, value_enum, default_value_t = ChannelArg::A)]
        channel: ChannelArg,
    },
    /// Delete a message.
    DeleteMessage { id: u16 },
    /// Create an opcode.
    CreateOpcode {
        id: u16,
        #[arg(value_enum)]
        instruction: InstructionArg,
        target: u16,
    },
    /// Create a frame.
    CreateFrame {
        id: u16,
        #[arg(value_enum)]
        kind: FrameArg,
        /// OpCode ids, comma separated.
        #[arg(long, value_delimiter = ',', required = true)]
        opcodes: Vec<u16>,
        /// Major frame period in 100 µs units.
        #[arg(long)]
        period: Option<u32>,
    },
    /// Delete a frame.
    DeleteFrame { id: u16 },
    /// Install the hardware buffer.
    InstallBuffer { capacity: usize },
    /// Validate the frame graph.
    Validate,
    /// Start a major frame in the background; -1 repeats until stopped.
    Start {
        major: u16,
        #[arg(allow_negative_numbers = true)]
        repeat: i32,
    },
    /// Run a major frame for a fixed number of cycles and wait for it.
    Run { major: u16, cycles: u32 },
    /// Queue an asynchronous message.
    SendAsync {
        message: u16,
        #[arg(long, value_enum, default_value_t = PriorityArg::Low)]
        priority: PriorityArg,
    },
    /// Wait until the running major frame has completed N cycles.
    WaitCycles {
        cycles: u64,
        #[arg(long = "timeout-ms", default_value_t = 5000)]
        timeout_ms: u64,
    },
    /// Pause the script.
    Sleep { ms: u64 },
    /// Retrieve and print a record from the hardware buffer.
    Decode {
        #[arg(value_enum, default_value_t = LocationArg::NextPurge)]
        location: LocationArg,
        /// Repeat until the buffer has nothing more to return.
        #[arg(long)]
        all: bool,
        /// Print records as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Print scheduler progress.
    Status,
    /// Stop the scheduler.
    Stop,
    /// Stop the scheduler and close the session.
    Free,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BlockArg {
    Single,
    Double,
}

impl From<BlockArg> for BlockKind {
    fn from(value: BlockArg) -> Self {
        match value {
            BlockArg::Single => BlockKind::Single,
            BlockArg::Double => BlockKind::Double,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum DirectionArg {
    #[value(name = "bc-rt")]
    BcToRt,
    #[value(name = "rt-bc")]
    RtToBc,
}

impl From<DirectionArg> for Direction {
    fn from(value: DirectionArg) -> Self {
        match value {
            DirectionArg::BcToRt => Direction::BcToRt,
            DirectionArg::RtToBc => Direction::RtToBc,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ChannelArg {
    A,
    B,
}

impl From<ChannelArg> for Channel {
    fn from(value: ChannelArg) -> Self {
        match value {
            ChannelArg::A => Channel::A,
            ChannelArg::B => Channel::B,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum InstructionArg {
    Xeq,
    Cal,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FrameArg {
    Major,
    Minor,
}

impl From<FrameArg> for FrameKind {
    fn from(value: FrameArg) -> Self {
        match value {
            FrameArg::Major => FrameKind::Major,
            FrameArg::Minor => FrameKind::Minor,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PriorityArg {
    Low,
    High,
}

impl From<PriorityArg> for AsyncPriority {
    fn from(value: PriorityArg) -> Self {
        match value {
            PriorityArg::Low => AsyncPriority::Low,
            PriorityArg::High => AsyncPriority::High,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LocationArg {
    NextPurge,
    NextNoPurge,
    LatestPurge,
    LatestNoPurge,
}

impl From<LocationArg> for MsgLocation {
    fn from(value: LocationArg) -> Self {
        match value {
            LocationArg::NextPurge => MsgLocation::NextPurge,
            LocationArg::NextNoPurge => MsgLocation::NextNoPurge,
            LocationArg::LatestPurge => MsgLocation::LatestPurge,
            LocationArg::LatestNoPurge => MsgLocation::LatestNoPurge,
        }
    }
}

fn parse_word(text: &str) -> std::result::Result<u16, String> {
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.map_err(|err| format!("invalid data word '{}': {}", text, err))
}

/// Executes harness script lines against one device session
pub struct Harness<W: Write> {
    session: Option<DeviceSession>,
    out: W,
}

impl Harness<io::Stdout> {
    pub fn stdout() -> Self {
        Harness::new(io::stdout())
    }
}

impl<W: Write> Harness<W> {
    pub fn new(out: W) -> Self {
        Harness { session: None, out }
    }

    /// Run every line of `script`; stops at the first failure
    pub fn run_script(&mut self, script: &str) -> Result<()> {
        for (index, raw) in script.lines().enumerate() {
            let line = index + 1;
            let text = raw.split('#').next().unwrap_or_default().trim();
            if text.is_empty() {
                continue;
            }
            let parsed = ScriptLine::try_parse_from(text.split_whitespace()).map_err(|err| {
                UsageError {
                    line,
                    message: err.render().to_string().trim_end().to_owned(),
                }
            })?;
            debug!(line, command = text, "script command");
            self.execute(parsed.command)
                .with_context(|| format!("line {}: {}", line, text))?;
        }
        Ok(())
    }

    fn session(&self) -> Result<&DeviceSession> {
        self.session
            .as_ref()
            .ok_or_else(|| BcError::not_ready("Device not initialized").into())
    }

    fn session_mut(&mut self) -> Result<&mut DeviceSession> {
        self.session
            .as_mut()
            .ok_or_else(|| BcError::not_ready("Device not initialized").into())
    }

    fn execute(&mut self, command: ScriptCommand) -> Result<()> {
        match command {
            ScriptCommand::Init {
                device,
                unpaced,
                response_time,
            } => {
                if self.session.is_some() {
                    return Err(BcError::invalid_state("Device already initialized").into());
                }
                let pacing = if unpaced {
                    Pacing::Unpaced
                } else {
                    Pacing::RealTime
                };
                self.session = Some(
                    SessionBuilder::new()
                        .with_device(device)
                        .with_pacing(pacing)
                        .with_response_time(response_time)
                        .build(),
                );
                writeln!(self.out, "initialized device {}", device)?;
            }
            ScriptCommand::CreateDataBlock {
                id,
                kind,
                capacity,
                data,
            } => {
                self.session()?
                    .create_data_block(id, kind.into(), capacity, &data)?;
            }
            ScriptCommand::DeleteDataBlock { id } => self.session()?.delete_data_block(id)?,
            ScriptCommand::WriteDataBlock { id, data } => {
                self.session()?.write_data_block(id, &data)?
            }
            ScriptCommand::ReadDataBlock { id } => {
                let words = self.session()?.read_data_block(id)?;
                writeln!(self.out, "data block {}: {}", id, format_words(&words))?;
            }
            ScriptCommand::CreateMessage {
                id,
                direction,
                block,
                rt,
                sa,
                wc,
                gap,
                channel,
            } => {
                let spec = MessageSpec::new(id, direction.into(), block, rt, sa, wc)
                    .with_gap_time(gap)
                    .with_channel(channel.into());
                self.session()?.create_message(spec)?;
            }
            ScriptCommand::CreateAsyncMessage {
                id,
                block,
                rt,
                sa,
                wc,
                data,
                gap,
                channel,
            } => {
                let spec = MessageSpec::new(id, Direction::BcToRt, block, rt, sa, wc)
                    .with_gap_time(gap)
                    .with_channel(channel.into());
                self.session()?.create_async_message(spec, &data)?;
            }
            ScriptCommand::DeleteMessage { id } => self.session()?.delete_message(id)?,
            ScriptCommand::CreateOpcode {
                id,
                instruction,
                target,
            } => {
                let instruction = match instruction {
                    InstructionArg::Xeq => Instruction::ExecuteMessage(MessageId::new(target)),
                    InstructionArg::Cal => Instruction::CallFrame(FrameId::new(target)),
                };
                self.session()?
                    .create_opcode(id, instruction, Condition::Always)?;
            }
            ScriptCommand::CreateFrame {
                id,
                kind,
                opcodes,
                period,
            } => {
                let opcodes: Vec<OpCodeId> = opcodes.into_iter().map(OpCodeId::new).collect();
                self.session()?
                    .create_frame(id, kind.into(), &opcodes, period)?;
            }
            ScriptCommand::DeleteFrame { id } => self.session()?.delete_frame(id)?,
            ScriptCommand::InstallBuffer { capacity } => {
                self.session()?.install_buffer(capacity)?
            }
            ScriptCommand::Validate => {
                self.session()?.validate()?;
                writeln!(self.out, "frame graph valid")?;
            }
            ScriptCommand::Start { major, repeat } => {
                let repeat = RepeatCount::from_raw(repeat)?;
                self.session_mut()?.start(major, repeat)?;
                writeln!(self.out, "started major frame {}", major)?;
            }
            ScriptCommand::Run { major, cycles } => {
                let summary = self
                    .session_mut()?
                    .run_blocking(major, RepeatCount::times(cycles)?)?;
                writeln!(
                    self.out,
                    "ran {} cycles: {} overruns, {} transfers, clock {} us",
                    summary.cycles, summary.overruns, summary.transfers, summary.clock_us
                )?;
            }
            ScriptCommand::SendAsync { message, priority } => {
                self.session()?.send_async(message, priority.into())?
            }
            ScriptCommand::WaitCycles { cycles, timeout_ms } => {
                let session = self.session()?;
                if !session.wait_for_cycles(cycles, Duration::from_millis(timeout_ms)) {
                    let status = session.status();
                    if let Some(fault) = status.fault {
                        return Err(fault.into());
                    }
                    return Err(anyhow!(
                        "timed out after {} ms waiting for {} cycles ({} completed)",
                        timeout_ms,
                        cycles,
                        status.cycles
                    ));
                }
            }
            ScriptCommand::Sleep { ms } => thread::sleep(Duration::from_millis(ms)),
            ScriptCommand::Decode {
                location,
                all,
                json,
            } => self.decode(location.into(), all, json)?,
            ScriptCommand::Status => {
                let status = self.session()?.status();
                self.print_status(&status)?;
            }
            ScriptCommand::Stop => {
                self.session_mut()?.stop()?;
                writeln!(self.out, "stopped")?;
            }
            ScriptCommand::Free => {
                let session = self
                    .session
                    .take()
                    .ok_or_else(|| BcError::not_ready("Device not initialized"))?;
                session.free()?;
                writeln!(self.out, "freed")?;
            }
        }
        Ok(())
    }

    fn decode(&mut self, location: MsgLocation, all: bool, json: bool) -> Result<()> {
        loop {
            let drained = self.session()?.drain(location)?;
            let done = drained.is_empty();
            if json {
                self.print_json(&drained)?;
            } else {
                self.print_drained(&drained)?;
            }
            if !all || done || !matches!(location, MsgLocation::NextPurge) {
                return Ok(());
            }
        }
    }

    #[cfg(feature = "serde")]
    fn print_json(&mut self, drained: &Drained) -> Result<()> {
        writeln!(self.out, "{}", serde_json::to_string(drained)?)?;
        Ok(())
    }

    #[cfg(not(feature = "serde"))]
    fn print_json(&mut self, _drained: &Drained) -> Result<()> {
        Err(anyhow!("JSON output requires the serde feature"))
    }

    fn print_drained(&mut self, drained: &Drained) -> Result<()> {
        match &drained.record {
            Some(record) => {
                writeln!(self.out, "{}", format_record(record))?;
                writeln!(
                    self.out,
                    "  pending {} lost {}",
                    drained.pending, drained.lost
                )?;
            }
            None => writeln!(
                self.out,
                "no record (pending {} lost {})",
                drained.pending, drained.lost
            )?,
        }
        Ok(())
    }

    fn print_status(&mut self, status: &SchedulerStatus) -> Result<()> {
        let major = status
            .major_frame
            .map(|frame| frame.to_string())
            .unwrap_or_else(|| "-".to_owned());
        writeln!(
            self.out,
            "state {:?} major {} cycles {} overruns {} transfers {} async {} clock {} us",
            status.state,
            major,
            status.cycles,
            status.overruns,
            status.transfers,
            status.async_transfers,
            status.clock_us
        )?;
        if let Some(fault) = &status.fault {
            writeln!(self.out, "  fault {}: {}", fault.kind(), fault)?;
        }
        Ok(())
    }
}

fn format_words(words: &[u16]) -> String {
    words
        .iter()
        .map(|word| format!("{:04X}", word))
        .collect::<Vec<_>>()
        .join(" ")
}

fn format_record(record: &DecodedRecord) -> String {
    let status = record
        .status
        .map(|status| format!("{:04X}", status.raw()))
        .unwrap_or_else(|| "----".to_owned());
    format!(
        "message {} {} {} cmd {:04X} sts {} bsw {:04X} time {} us words {} [{}]",
        record.message,
        record.direction,
        record.channel,
        record.command.raw(),
        status,
        record.block_status.encode(),
        record.time_tag,
        record.word_count,
        format_words(&record.data)
    )
}
