//! Core types shared by the bus controller model

use crate::error::{BcError, Result};

macro_rules! entity_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
        pub struct $name(u16);

        impl $name {
            /// Wrap a raw id
            pub const fn new(id: u16) -> Self {
                $name(id)
            }

            /// Get the raw id value
            pub fn value(&self) -> u16 {
                self.0
            }
        }

        impl From<u16> for $name {
            fn from(id: u16) -> Self {
                $name(id)
            }
        }

        impl From<$name> for u16 {
            fn from(id: $name) -> u16 {
                id.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

entity_id!(
    /// Identity of a data block, unique within a device session
    DataBlockId
);
entity_id!(
    /// Identity of a message, unique within a device session
    MessageId
);
entity_id!(
    /// Identity of an opcode, unique within a device session
    OpCodeId
);
entity_id!(
    /// Identity of a frame, unique within a device session
    FrameId
);

/// Bus channel a message is transmitted on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Channel {
    /// Bus A (primary)
    #[default]
    A,
    /// Bus B (redundant)
    B,
}

impl Channel {
    /// Message option bit selecting channel A
    pub const OPTION_CHANNEL_A: u32 = 0x0080;

    /// Decode the channel from message option bits
    pub fn from_options(options: u32) -> Self {
        if options & Self::OPTION_CHANNEL_A != 0 {
            Channel::A
        } else {
            Channel::B
        }
    }

    /// Encode the channel as message option bits
    pub fn options(&self) -> u32 {
        match self {
            Channel::A => Self::OPTION_CHANNEL_A,
            Channel::B => 0,
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Channel::A => write!(f, "Bus A"),
            Channel::B => write!(f, "Bus B"),
        }
    }
}

/// Remote terminal address (0-31, with 31 being broadcast)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Address(u8);

impl Address {
    /// Maximum address value (31)
    pub const MAX: u8 = 31;
    /// Broadcast address
    pub const BROADCAST: u8 = 31;

    /// Create a new address, validating it's within range [0, 31]
    pub fn new(addr: u8) -> Result<Self> {
        if addr > Self::MAX {
            return Err(BcError::invalid_argument(format!(
                "RT address {} out of range [0, {}]",
                addr,
                Self::MAX
            )));
        }
        Ok(Address(addr))
    }

    /// Get the raw address value
    pub fn value(&self) -> u8 {
        self.0
    }

    /// Check if this is the broadcast address
    pub fn is_broadcast(&self) -> bool {
        self.0 == Self::BROADCAST
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_broadcast() {
            write!(f, "RT-31 (broadcast)")
        } else {
            write!(f, "RT-{}", self.0)
        }
    }
}

/// Sub-address within a remote terminal (0-31)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SubAddress(u8);

impl SubAddress {
    /// Maximum sub-address value (31)
    pub const MAX: u8 = 31;

    /// Create a new sub-address (0-31)
    pub fn new(addr: u8) -> Result<Self> {
        if addr > Self::MAX {
            return Err(BcError::invalid_argument(format!(
                "Sub-address {} out of range [0, {}]",
                addr,
                Self::MAX
            )));
        }
        Ok(SubAddress(addr))
    }

    /// Get the raw sub-address value
    pub fn value(&self) -> u8 {
        self.0
    }
}

/// Number of data words carried by a message (1-32)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct WordCount(u8);

impl WordCount {
    /// Largest transfer a single message can carry
    pub const MAX: u8 = 32;

    /// Create a new word count, validating it's within range [1, 32]
    pub fn new(count: u16) -> Result<Self> {
        if count == 0 || count > Self::MAX as u16 {
            return Err(BcError::invalid_argument(format!(
                "Word count {} out of range [1, {}]",
                count,
                Self::MAX
            )));
        }
        Ok(WordCount(count as u8))
    }

    /// Number of words as a length
    pub fn get(&self) -> usize {
        self.0 as usize
    }

    /// 5-bit command word field, where 32 words are encoded as 0
    pub fn field(&self) -> u8 {
        self.0 & 0x1F
    }

    /// Decode the 5-bit command word field
    pub fn from_field(field: u8) -> Self {
        match field & 0x1F {
            0 => WordCount(32),
            n => WordCount(n),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_creation() {
        assert!(Address::new(0).is_ok());
        assert!(Address::new(31).is_ok());
        assert!(Address::new(32).is_err());
        assert!(Address::new(31).unwrap().is_broadcast());
    }

    #[test]
    fn test_subaddress_creation() {
        assert!(SubAddress::new(0).is_ok());
        assert!(SubAddress::new(31).is_ok());
        assert!(SubAddress::new(32).is_err());
    }

    #[test]
    fn test_word_count_field() -> Result<()> {
        assert!(WordCount::new(0).is_err());
        assert!(WordCount::new(33).is_err());

        let full = WordCount::new(32)?;
        assert_eq!(full.field(), 0);
        assert_eq!(WordCount::from_field(0), full);
        assert_eq!(WordCount::from_field(7).get(), 7);
        Ok(())
    }

    #[test]
    fn test_channel_options() {
        assert_eq!(Channel::from_options(128), Channel::A);
        assert_eq!(Channel::from_options(0), Channel::B);
        assert_eq!(Channel::B.options(), 0);
        assert_eq!(Channel::A.to_string(), "Bus A");
    }

    #[test]
    fn test_id_display() {
        assert_eq!(FrameId::new(2).to_string(), "2");
        assert_eq!(u16::from(MessageId::from(9)), 9);
    }
}
