//! Frame graph: minor and major frame composition and validation

use std::collections::{BTreeMap, HashMap};

use tracing::debug;

use crate::catalog::MessageCatalog;
use crate::core::{FrameId, OpCodeId};
use crate::error::{BcError, Entity, GraphFault, Result};
use crate::opcode::{Instruction, OpCodeTable};

/// Level of a frame in the two-level schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FrameKind {
    /// Periodic frame started by the scheduler; calls minor frames only
    Major,
    /// Frame of message executions and nested minor frame calls
    Minor,
}

impl FrameKind {
    /// Integer code used at the driver boundary
    pub fn code(&self) -> u16 {
        match self {
            FrameKind::Major => 0,
            FrameKind::Minor => 2,
        }
    }
}

impl TryFrom<u16> for FrameKind {
    type Error = BcError;

    fn try_from(value: u16) -> Result<Self> {
        match value {
            0 => Ok(FrameKind::Major),
            2 => Ok(FrameKind::Minor),
            _ => Err(BcError::invalid_argument(format!(
                "Unknown frame type: {}",
                value
            ))),
        }
    }
}

/// A frame: an ordered list of opcodes
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Frame {
    /// Frame id
    pub id: FrameId,
    /// Frame level
    pub kind: FrameKind,
    /// OpCodes executed in order
    pub opcodes: Vec<OpCodeId>,
    /// Major frame period in frame-time units; `None` for minor frames
    pub period: Option<u32>,
}

impl Frame {
    /// Maximum number of opcodes in one frame
    pub const MAX_OPCODES: usize = 10;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Visit {
    InProgress,
    Done,
}

/// Frames of a device session
#[derive(Debug, Default)]
pub struct FrameGraph {
    frames: BTreeMap<FrameId, Frame>,
}

impl FrameGraph {
    /// Create an empty graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a frame from an ordered list of opcode ids
    pub fn create_frame(
        &mut self,
        id: FrameId,
        kind: FrameKind,
        opcodes: &[OpCodeId],
        period: Option<u32>,
    ) -> Result<()> {
        if self.frames.contains_key(&id) {
            return Err(BcError::invalid_argument(format!(
                "Frame {} already exists",
                id
            )));
        }
        if opcodes.is_empty() || opcodes.len() > Frame::MAX_OPCODES {
            return Err(BcError::invalid_argument(format!(
                "Frame {} holds {} opcodes, expected 1 to {}",
                id,
                opcodes.len(),
                Frame::MAX_OPCODES
            )));
        }
        let period = match (kind, period) {
            (FrameKind::Major, Some(period)) if period > 0 => Some(period),
            (FrameKind::Major, _) => {
                return Err(BcError::invalid_argument(format!(
                    "Major frame {} requires a positive period",
                    id
                )))
            }
            (FrameKind::Minor, None | Some(0)) => None,
            (FrameKind::Minor, Some(period)) => {
                return Err(BcError::invalid_argument(format!(
                    "Minor frame {} cannot have a period ({})",
                    id, period
                )))
            }
        };

        self.frames.insert(
            id,
            Frame {
                id,
                kind,
                opcodes: opcodes.to_vec(),
                period,
            },
        );
        debug!(frame = %id, ?kind, opcodes = opcodes.len(), ?period, "created frame");
        Ok(())
    }

    /// Delete a frame
    pub fn delete_frame(&mut self, id: FrameId) -> Result<()> {
        self.frames
            .remove(&id)
            .ok_or_else(|| BcError::not_found(Entity::Frame, id))?;
        debug!(frame = %id, "deleted frame");
        Ok(())
    }

    /// Look up a frame
    pub fn get(&self, id: FrameId) -> Option<&Frame> {
        self.frames.get(&id)
    }

    /// Number of frames
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Whether the graph has no frames
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Check referential integrity, the major/minor hierarchy and acyclicity
    ///
    /// Frames are examined in id order, then any opcode not reachable from a
    /// frame, then the call graph. The first violation is returned.
    pub fn validate(&self, opcodes: &OpCodeTable, catalog: &MessageCatalog) -> Result<()> {
        for frame in self.frames.values() {
            for &opcode_id in &frame.opcodes {
                let opcode = opcodes.get(opcode_id).ok_or_else(|| {
                    BcError::graph(
                        Some(frame.id),
                        Some(opcode_id),
                        GraphFault::MissingTarget {
                            entity: Entity::OpCode,
                            id: opcode_id.value(),
                        },
                    )
                })?;
                if frame.kind == FrameKind::Major
                    && !matches!(opcode.instruction, Instruction::CallFrame(_))
                {
                    return Err(BcError::graph(
                        Some(frame.id),
                        Some(opcode_id),
                        GraphFault::MajorExecutesMessage,
                    ));
                }
                self.resolve(opcode.instruction, catalog)
                    .map_err(|fault| BcError::graph(Some(frame.id), Some(opcode_id), fault))?;
            }
        }

        for opcode in opcodes.iter() {
            self.resolve(opcode.instruction, catalog)
                .map_err(|fault| BcError::graph(None, Some(opcode.id), fault))?;
        }

        let mut visits = HashMap::new();
        for &id in self.frames.keys() {
            if !visits.contains_key(&id) {
                self.visit(id, opcodes, &mut visits)?;
            }
        }
        Ok(())
    }

    fn resolve(&self, instruction: Instruction, catalog: &MessageCatalog) -> std::result::Result<(), GraphFault> {
        match instruction {
            Instruction::ExecuteMessage(id) => match catalog.message(id) {
                Some(message) if message.is_async() => Err(GraphFault::AsyncMessageScheduled),
                Some(_) => Ok(()),
                None => Err(GraphFault::MissingTarget {
                    entity: Entity::Message,
                    id: id.value(),
                }),
            },
            Instruction::CallFrame(id) => match self.frames.get(&id) {
                Some(frame) if frame.kind == FrameKind::Minor => Ok(()),
                _ => Err(GraphFault::MissingTarget {
                    entity: Entity::MinorFrame,
                    id: id.value(),
                }),
            },
        }
    }

    fn visit(
        &self,
        id: FrameId,
        opcodes: &OpCodeTable,
        visits: &mut HashMap<FrameId, Visit>,
    ) -> Result<()> {
        visits.insert(id, Visit::InProgress);
        if let Some(frame) = self.frames.get(&id) {
            for &opcode_id in &frame.opcodes {
                let Some(Instruction::CallFrame(target)) =
                    opcodes.get(opcode_id).map(|op| op.instruction)
                else {
                    continue;
                };
                match visits.get(&target) {
                    Some(Visit::InProgress) => {
                        return Err(BcError::graph(Some(id), Some(opcode_id), GraphFault::Cycle));
                    }
                    Some(Visit::Done) => {}
                    None => self.visit(target, opcodes, visits)?,
                }
            }
        }
        visits.insert(id, Visit::Done);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{BlockKind, Direction, MessageSpec};
    use crate::core::{DataBlockId, MessageId};
    use crate::error::ErrorKind;
    use crate::opcode::Condition;

    struct Fixture {
        catalog: MessageCatalog,
        opcodes: OpCodeTable,
        frames: FrameGraph,
    }

    impl Fixture {
        fn new() -> Self {
            let mut catalog = MessageCatalog::new();
            catalog
                .create_data_block(DataBlockId::new(1), BlockKind::Single, 32, &[])
                .unwrap();
            catalog
                .create_message(MessageSpec::new(1, Direction::RtToBc, 1, 1, 1, 32))
                .unwrap();
            Fixture {
                catalog,
                opcodes: OpCodeTable::new(),
                frames: FrameGraph::new(),
            }
        }

        fn xeq(&mut self, id: u16, message: u16) -> OpCodeId {
            let id = OpCodeId::new(id);
            self.opcodes
                .create(id, Instruction::ExecuteMessage(MessageId::new(message)), Condition::Always)
                .unwrap();
            id
        }

        fn cal(&mut self, id: u16, frame: u16) -> OpCodeId {
            let id = OpCodeId::new(id);
            self.opcodes
                .create(id, Instruction::CallFrame(FrameId::new(frame)), Condition::Always)
                .unwrap();
            id
        }

        fn minor(&mut self, id: u16, opcodes: &[OpCodeId]) {
            self.frames
                .create_frame(FrameId::new(id), FrameKind::Minor, opcodes, None)
                .unwrap();
        }

        fn major(&mut self, id: u16, opcodes: &[OpCodeId]) {
            self.frames
                .create_frame(FrameId::new(id), FrameKind::Major, opcodes, Some(1000))
                .unwrap();
        }

        fn validate(&self) -> Result<()> {
            self.frames.validate(&self.opcodes, &self.catalog)
        }
    }

    #[test]
    fn test_create_frame_arguments() {
        let mut frames = FrameGraph::new();
        let ops: Vec<OpCodeId> = (1..=11).map(OpCodeId::new).collect();

        let empty = frames.create_frame(FrameId::new(1), FrameKind::Minor, &[], None);
        assert_eq!(empty.unwrap_err().kind(), ErrorKind::InvalidArgument);

        let too_many = frames.create_frame(FrameId::new(1), FrameKind::Minor, &ops, None);
        assert_eq!(too_many.unwrap_err().kind(), ErrorKind::InvalidArgument);

        for period in [None, Some(0)] {
            let err = frames.create_frame(FrameId::new(2), FrameKind::Major, &ops[..1], period);
            assert_eq!(err.unwrap_err().kind(), ErrorKind::InvalidArgument);
        }

        assert!(frames
            .create_frame(FrameId::new(1), FrameKind::Minor, &ops[..10], None)
            .is_ok());
        assert!(frames
            .create_frame(FrameId::new(1), FrameKind::Minor, &ops[..1], None)
            .is_err());
    }

    #[test]
    fn test_valid_two_level_schedule() {
        let mut fx = Fixture::new();
        let op1 = fx.xeq(1, 1);
        fx.minor(1, &[op1]);
        let op2 = fx.cal(2, 1);
        fx.major(2, &[op2]);
        assert!(fx.validate().is_ok());
    }

    #[test]
    fn test_opcode_created_before_frame() {
        let mut fx = Fixture::new();
        // Call opcode names frame 5 before it exists.
        let call = fx.cal(1, 5);
        let xeq = fx.xeq(2, 1);
        fx.major(9, &[call]);
        assert_eq!(fx.validate().unwrap_err().kind(), ErrorKind::NotFound);

        fx.minor(5, &[xeq]);
        assert!(fx.validate().is_ok());
    }

    #[test]
    fn test_missing_message_target() {
        let mut fx = Fixture::new();
        let op = fx.xeq(1, 42);
        fx.minor(1, &[op]);
        assert_eq!(
            fx.validate().unwrap_err(),
            BcError::graph(
                Some(FrameId::new(1)),
                Some(OpCodeId::new(1)),
                GraphFault::MissingTarget {
                    entity: Entity::Message,
                    id: 42
                }
            )
        );
    }

    #[test]
    fn test_missing_opcode_in_frame() {
        let mut fx = Fixture::new();
        fx.minor(1, &[OpCodeId::new(77)]);
        let err = fx.validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_unreferenced_opcode_is_checked() {
        let mut fx = Fixture::new();
        fx.cal(3, 99);
        let err = fx.validate().unwrap_err();
        assert_eq!(
            err,
            BcError::graph(
                None,
                Some(OpCodeId::new(3)),
                GraphFault::MissingTarget {
                    entity: Entity::MinorFrame,
                    id: 99
                }
            )
        );
    }

    #[test]
    fn test_major_frame_executes_message() {
        let mut fx = Fixture::new();
        let op = fx.xeq(1, 1);
        fx.major(2, &[op]);
        let err = fx.validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert_eq!(
            err,
            BcError::graph(
                Some(FrameId::new(2)),
                Some(OpCodeId::new(1)),
                GraphFault::MajorExecutesMessage
            )
        );
    }

    #[test]
    fn test_call_to_major_frame_rejected() {
        let mut fx = Fixture::new();
        let xeq = fx.xeq(1, 1);
        fx.minor(1, &[xeq]);
        let call_minor = fx.cal(2, 1);
        fx.major(2, &[call_minor]);
        let call_major = fx.cal(3, 2);
        fx.minor(3, &[call_major]);
        assert_eq!(fx.validate().unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_direct_self_reference_is_cycle() {
        let mut fx = Fixture::new();
        let call_self = fx.cal(1, 1);
        fx.minor(1, &[call_self]);
        let err = fx.validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cycle);
        assert_eq!(
            err,
            BcError::graph(Some(FrameId::new(1)), Some(OpCodeId::new(1)), GraphFault::Cycle)
        );
    }

    #[test]
    fn test_three_hop_cycle() {
        let mut fx = Fixture::new();
        let to_2 = fx.cal(1, 2);
        let to_3 = fx.cal(2, 3);
        let to_1 = fx.cal(3, 1);
        let xeq = fx.xeq(4, 1);
        fx.minor(1, &[xeq, to_2]);
        fx.minor(2, &[to_3]);
        fx.minor(3, &[to_1]);
        let start = fx.cal(5, 1);
        fx.major(10, &[start]);
        assert_eq!(fx.validate().unwrap_err().kind(), ErrorKind::Cycle);
    }

    #[test]
    fn test_shared_minor_frame_is_not_a_cycle() {
        let mut fx = Fixture::new();
        let xeq = fx.xeq(1, 1);
        fx.minor(1, &[xeq]);
        let call_1 = fx.cal(2, 1);
        fx.minor(2, &[call_1, call_1]);
        let call_2 = fx.cal(3, 2);
        fx.major(3, &[call_1, call_2]);
        assert!(fx.validate().is_ok());
    }

    #[test]
    fn test_async_message_cannot_be_scheduled() {
        let mut fx = Fixture::new();
        fx.catalog
            .create_async_message(MessageSpec::new(2, Direction::BcToRt, 1, 1, 2, 4), &[1])
            .unwrap();
        let op = fx.xeq(1, 2);
        fx.minor(1, &[op]);
        assert_eq!(fx.validate().unwrap_err().kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_frame_kind_codes() {
        assert_eq!(FrameKind::try_from(0).unwrap(), FrameKind::Major);
        assert_eq!(FrameKind::try_from(2).unwrap(), FrameKind::Minor);
        assert!(FrameKind::try_from(1).is_err());
    }
}
