//! OpCode table: schedulable instructions

use std::collections::BTreeMap;

use tracing::debug;

use crate::core::{FrameId, MessageId, OpCodeId};
use crate::error::{BcError, Result};

/// Condition under which an opcode executes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Condition {
    /// Unconditional execution
    #[default]
    Always,
}

impl Condition {
    /// Integer code used at the driver boundary
    pub fn code(&self) -> u16 {
        match self {
            Condition::Always => 15,
        }
    }

    /// Evaluate the condition at execution time
    pub fn holds(&self) -> bool {
        match self {
            Condition::Always => true,
        }
    }
}

impl TryFrom<u16> for Condition {
    type Error = BcError;

    fn try_from(value: u16) -> Result<Self> {
        match value {
            15 => Ok(Condition::Always),
            _ => Err(BcError::invalid_argument(format!(
                "Unsupported condition test: {}",
                value
            ))),
        }
    }
}

/// Instruction kind, carrying the id it targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Instruction {
    /// Execute a message transfer
    ExecuteMessage(MessageId),
    /// Call a minor frame
    CallFrame(FrameId),
}

impl Instruction {
    /// Execute-message opcode type code
    pub const XEQ: u16 = 1;
    /// Call-frame opcode type code
    pub const CAL: u16 = 3;

    /// Build an instruction from an opcode type code and its parameter
    pub fn from_code(code: u16, target: u16) -> Result<Self> {
        match code {
            Self::XEQ => Ok(Instruction::ExecuteMessage(MessageId::new(target))),
            Self::CAL => Ok(Instruction::CallFrame(FrameId::new(target))),
            _ => Err(BcError::invalid_argument(format!(
                "Unsupported opcode type: {}",
                code
            ))),
        }
    }

    /// Opcode type code
    pub fn code(&self) -> u16 {
        match self {
            Instruction::ExecuteMessage(_) => Self::XEQ,
            Instruction::CallFrame(_) => Self::CAL,
        }
    }
}

/// A single schedulable instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct OpCode {
    /// OpCode id
    pub id: OpCodeId,
    /// What the opcode does
    pub instruction: Instruction,
    /// When it does it
    pub condition: Condition,
}

/// OpCodes of a device session
///
/// Targets are recorded as given; they are resolved when the frame graph is
/// validated, since an opcode may name a frame that is created later.
#[derive(Debug, Default)]
pub struct OpCodeTable {
    opcodes: BTreeMap<OpCodeId, OpCode>,
}

impl OpCodeTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new opcode
    pub fn create(
        &mut self,
        id: OpCodeId,
        instruction: Instruction,
        condition: Condition,
    ) -> Result<()> {
        if self.opcodes.contains_key(&id) {
            return Err(BcError::invalid_argument(format!(
                "OpCode {} already exists",
                id
            )));
        }
        self.opcodes.insert(
            id,
            OpCode {
                id,
                instruction,
                condition,
            },
        );
        debug!(opcode = %id, ?instruction, ?condition, "created opcode");
        Ok(())
    }

    /// Look up an opcode
    pub fn get(&self, id: OpCodeId) -> Option<&OpCode> {
        self.opcodes.get(&id)
    }

    /// Iterate over all opcodes in id order
    pub fn iter(&self) -> impl Iterator<Item = &OpCode> {
        self.opcodes.values()
    }

    /// Number of opcodes
    pub fn len(&self) -> usize {
        self.opcodes.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.opcodes.is_empty()
    }
}
