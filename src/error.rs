//! Error types for the bus controller model

use std::fmt;

use thiserror::Error;

use crate::core::{FrameId, OpCodeId};

/// Result type for bus controller operations
pub type Result<T> = std::result::Result<T, BcError>;

/// Kind of entity owned by a device session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Entity {
    /// Data block
    DataBlock,
    /// Message (synchronous or asynchronous)
    Message,
    /// Asynchronous message
    AsyncMessage,
    /// OpCode
    OpCode,
    /// Frame of any kind
    Frame,
    /// Minor frame
    MinorFrame,
    /// Major frame
    MajorFrame,
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Entity::DataBlock => write!(f, "data block"),
            Entity::Message => write!(f, "message"),
            Entity::AsyncMessage => write!(f, "asynchronous message"),
            Entity::OpCode => write!(f, "opcode"),
            Entity::Frame => write!(f, "frame"),
            Entity::MinorFrame => write!(f, "minor frame"),
            Entity::MajorFrame => write!(f, "major frame"),
        }
    }
}

/// Violation found while validating the frame graph
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum GraphFault {
    /// An opcode target does not resolve to an entity of the expected kind
    MissingTarget { entity: Entity, id: u16 },
    /// The frame call chain reaches a frame that is already on the stack
    Cycle,
    /// A major frame holds an opcode other than a frame call
    MajorExecutesMessage,
    /// An opcode schedules a message flagged asynchronous
    AsyncMessageScheduled,
}

impl GraphFault {
    fn kind(&self) -> ErrorKind {
        match self {
            GraphFault::MissingTarget { .. } => ErrorKind::NotFound,
            GraphFault::Cycle => ErrorKind::Cycle,
            GraphFault::MajorExecutesMessage | GraphFault::AsyncMessageScheduled => {
                ErrorKind::InvalidArgument
            }
        }
    }
}

impl fmt::Display for GraphFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphFault::MissingTarget { entity, id } => write!(f, "{} {} does not exist", entity, id),
            GraphFault::Cycle => write!(f, "frame call chain is recursive"),
            GraphFault::MajorExecutesMessage => {
                write!(f, "major frames may only call minor frames")
            }
            GraphFault::AsyncMessageScheduled => {
                write!(f, "asynchronous messages cannot be scheduled by an opcode")
            }
        }
    }
}

/// Location of a frame graph violation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GraphSite {
    /// Frame being examined, if the violation was found through a frame
    pub frame: Option<FrameId>,
    /// Offending opcode
    pub opcode: Option<OpCodeId>,
}

impl fmt::Display for GraphSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.frame, self.opcode) {
            (Some(frame), Some(opcode)) => write!(f, "frame {}, opcode {}", frame, opcode),
            (Some(frame), None) => write!(f, "frame {}", frame),
            (None, Some(opcode)) => write!(f, "opcode {}", opcode),
            (None, None) => write!(f, "frame graph"),
        }
    }
}

/// Errors returned by every fallible bus controller operation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BcError {
    /// Malformed or out-of-range input
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Referenced id does not exist
    #[error("Not found: {entity} {id}")]
    NotFound { entity: Entity, id: u16 },

    /// Deletion blocked by a live dependent
    #[error("Resource in use: {entity} {id} is referenced by {by} {by_id}")]
    ResourceInUse {
        entity: Entity,
        id: u16,
        by: Entity,
        by_id: u16,
    },

    /// A prerequisite step (validation, installation) has not been performed
    #[error("Not ready: {0}")]
    NotReady(String),

    /// Operation is invalid for the current scheduler or buffer state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Frame graph validation failed
    #[error("Frame graph error at {site}: {fault}")]
    Graph { site: GraphSite, fault: GraphFault },
}

impl BcError {
    /// Create a new InvalidArgument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        BcError::InvalidArgument(msg.into())
    }

    /// Create a new NotFound error
    pub fn not_found(entity: Entity, id: impl Into<u16>) -> Self {
        BcError::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Create a new ResourceInUse error
    pub fn in_use(entity: Entity, id: impl Into<u16>, by: Entity, by_id: impl Into<u16>) -> Self {
        BcError::ResourceInUse {
            entity,
            id: id.into(),
            by,
            by_id: by_id.into(),
        }
    }

    /// Create a new NotReady error
    pub fn not_ready(msg: impl Into<String>) -> Self {
        BcError::NotReady(msg.into())
    }

    /// Create a new InvalidState error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        BcError::InvalidState(msg.into())
    }

    /// Create a new frame graph error
    pub fn graph(frame: Option<FrameId>, opcode: Option<OpCodeId>, fault: GraphFault) -> Self {
        BcError::Graph {
            site: GraphSite { frame, opcode },
            fault,
        }
    }

    /// Classify the error into one of the reported error kinds
    pub fn kind(&self) -> ErrorKind {
        match self {
            BcError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            BcError::NotFound { .. } => ErrorKind::NotFound,
            BcError::ResourceInUse { .. } => ErrorKind::ResourceInUse,
            BcError::NotReady(_) => ErrorKind::NotReady,
            BcError::InvalidState(_) => ErrorKind::InvalidState,
            BcError::Graph { fault, .. } => fault.kind(),
        }
    }

    /// Numeric code of this error, as reported at the integer boundary
    pub fn code(&self) -> i16 {
        self.kind().code()
    }
}

/// Error classification shared by the library and the harness
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    ResourceInUse,
    NotReady,
    InvalidState,
    Cycle,
}

impl ErrorKind {
    const ALL: [ErrorKind; 6] = [
        ErrorKind::InvalidArgument,
        ErrorKind::NotFound,
        ErrorKind::ResourceInUse,
        ErrorKind::NotReady,
        ErrorKind::InvalidState,
        ErrorKind::Cycle,
    ];

    /// Kind name as printed by the harness
    pub fn name(&self) -> &'static str {
        match self {
            ErrorKind::InvalidArgument => "InvalidArgument",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::ResourceInUse => "ResourceInUse",
            ErrorKind::NotReady => "NotReady",
            ErrorKind::InvalidState => "InvalidState",
            ErrorKind::Cycle => "Cycle",
        }
    }

    /// Negative return code, zero being success
    pub fn code(&self) -> i16 {
        match self {
            ErrorKind::InvalidArgument => -1,
            ErrorKind::NotFound => -2,
            ErrorKind::ResourceInUse => -3,
            ErrorKind::NotReady => -4,
            ErrorKind::InvalidState => -5,
            ErrorKind::Cycle => -6,
        }
    }

    /// Look up the kind for a return code
    pub fn from_code(code: i16) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.code() == code)
    }

    fn description(&self) -> &'static str {
        match self {
            ErrorKind::InvalidArgument => "malformed or out-of-range argument",
            ErrorKind::NotFound => "referenced id does not exist",
            ErrorKind::ResourceInUse => "resource is still referenced",
            ErrorKind::NotReady => "required setup step has not been performed",
            ErrorKind::InvalidState => "operation not allowed in the current state",
            ErrorKind::Cycle => "frame call graph contains a cycle",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Human-readable description for a numeric return code
pub fn error_str(code: i16) -> &'static str {
    if code == 0 {
        return "success";
    }
    ErrorKind::from_code(code)
        .map(|kind| kind.description())
        .unwrap_or("unknown error")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BcError::invalid_argument("capacity 0");
        assert!(err.to_string().contains("Invalid argument"));

        let err = BcError::in_use(Entity::DataBlock, 1u16, Entity::Message, 7u16);
        assert_eq!(
            err.to_string(),
            "Resource in use: data block 1 is referenced by message 7"
        );
    }

    #[test]
    fn test_graph_fault_kinds() {
        let cycle = BcError::graph(Some(FrameId::new(3)), Some(OpCodeId::new(9)), GraphFault::Cycle);
        assert_eq!(cycle.kind(), ErrorKind::Cycle);
        assert!(cycle.to_string().contains("frame 3, opcode 9"));

        let missing = BcError::graph(
            None,
            Some(OpCodeId::new(2)),
            GraphFault::MissingTarget {
                entity: Entity::Message,
                id: 4,
            },
        );
        assert_eq!(missing.kind(), ErrorKind::NotFound);

        let major = BcError::graph(Some(FrameId::new(2)), None, GraphFault::MajorExecutesMessage);
        assert_eq!(major.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_error_codes() {
        for kind in ErrorKind::ALL {
            assert!(kind.code() < 0);
            assert_eq!(ErrorKind::from_code(kind.code()), Some(kind));
        }
        assert_eq!(error_str(0), "success");
        assert_eq!(error_str(-2), "referenced id does not exist");
        assert_eq!(error_str(-99), "unknown error");
    }
}
