//! # MIL-STD-1553B Bus Controller
//!
//! A hardware-independent model of a MIL-STD-1553B bus controller.
//!
//! MIL-STD-1553B is a serial command/response data bus used in military avionics
//! and aerospace systems. A bus controller drives every transfer on the bus
//! according to a schedule of frames. This library provides:
//!
//! - A message catalog of data blocks and BC->RT / RT->BC messages
//! - An opcode table and a frame graph, validated before use
//! - A scheduler running major frames against a virtual clock
//! - A bounded hardware buffer of decoded transfers, drained by the host
//! - Simulated remote terminals to answer transfers
//!
//! ## Features
//!
//! - `serde`: Enable serialization/deserialization support
//!
//! ## Example
//!
//! ```
//! use milstd1553b_bc::{
//!     BlockKind, Condition, Direction, FrameKind, Instruction, MessageId, MessageSpec,
//!     MsgLocation, OpCodeId, Pacing, RepeatCount, SessionBuilder, FrameId,
//! };
//!
//! let mut session = SessionBuilder::new().with_pacing(Pacing::Unpaced).build();
//! session.create_data_block(1u16, BlockKind::Single, 32, &[])?;
//! session.create_message(MessageSpec::new(1u16, Direction::RtToBc, 1u16, 1, 1, 32))?;
//! session.create_opcode(1u16, Instruction::ExecuteMessage(MessageId::new(1)), Condition::Always)?;
//! session.create_opcode(2u16, Instruction::CallFrame(FrameId::new(1)), Condition::Always)?;
//! session.create_frame(1u16, FrameKind::Minor, &[OpCodeId::new(1)], None)?;
//! session.create_frame(2u16, FrameKind::Major, &[OpCodeId::new(2)], Some(1000))?;
//! session.install_buffer(32 * 1024)?;
//! session.validate()?;
//!
//! session.run_blocking(2u16, RepeatCount::times(1)?)?;
//! let record = session.drain(MsgLocation::NextPurge)?.record;
//! assert_eq!(record.map(|r| r.word_count), Some(32));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod catalog;
pub mod core;
pub mod error;
pub mod frame;
pub mod hbuf;
pub mod opcode;
pub mod scheduler;
pub mod session;
pub mod terminal;
pub mod word;

pub use catalog::{BlockKind, DataBlock, Direction, Message, MessageCatalog, MessageSpec};
pub use core::{Address, Channel, DataBlockId, FrameId, MessageId, OpCodeId, SubAddress, WordCount};
pub use error::{error_str, BcError, Entity, ErrorKind, GraphFault, GraphSite, Result};
pub use frame::{Frame, FrameGraph, FrameKind};
pub use hbuf::{DecodedRecord, Drained, HardwareBuffer, MsgLocation};
pub use opcode::{Condition, Instruction, OpCode, OpCodeTable};
pub use scheduler::{
    AsyncPriority, CycleReport, Pacing, RepeatCount, RunSummary, SchedulerState, SchedulerStatus,
};
pub use session::{DeviceSession, SessionBuilder, SessionConfig};
pub use terminal::{BusResponder, RTState, RemoteTerminal, RTStats, SimulatedBus, TransferRequest, TransferResponse};
pub use word::{BlockStatus, CommandWord, StatusWord};

/// Bus timing constants used by the virtual clock
pub mod bus {
    /// Time to transmit one 20-bit word at 1 Mbps, in microseconds
    pub const WORD_TIME_US: u64 = 20;

    /// Smallest intermessage gap, in microseconds
    pub const MIN_GAP_US: u64 = 4;

    /// Time the bus controller waits for a status word before declaring no response
    pub const NO_RESPONSE_TIMEOUT_US: u64 = 14;

    /// Length of one frame time unit, in microseconds
    pub const FRAME_TIME_UNIT_US: u64 = 100;

    /// Default simulated remote terminal response time, in microseconds
    pub const DEFAULT_RESPONSE_TIME_US: u32 = 8;
}
