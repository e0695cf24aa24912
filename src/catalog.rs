//! Message catalog: data blocks and the messages that reference them

use std::collections::BTreeMap;

use tracing::debug;

use crate::core::{Address, Channel, DataBlockId, MessageId, SubAddress, WordCount};
use crate::error::{BcError, Entity, Result};
use crate::word::CommandWord;

/// Buffering scheme of a data block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BlockKind {
    /// One word sequence shared by host and bus
    #[default]
    Single,
    /// Two word sequences; the bus uses the active side, the host the inactive one
    Double,
}

impl BlockKind {
    /// Integer code used at the driver boundary
    pub fn code(&self) -> u16 {
        match self {
            BlockKind::Single => 32,
            BlockKind::Double => 33,
        }
    }
}

impl TryFrom<u16> for BlockKind {
    type Error = BcError;

    fn try_from(value: u16) -> Result<Self> {
        match value {
            32 => Ok(BlockKind::Single),
            33 => Ok(BlockKind::Double),
            _ => Err(BcError::invalid_argument(format!(
                "Unknown data block type: {}",
                value
            ))),
        }
    }
}

/// Fixed-capacity word storage read and written by message transfers
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DataBlock {
    id: DataBlockId,
    kind: BlockKind,
    sides: [Vec<u16>; 2],
    active: usize,
}

impl DataBlock {
    /// Smallest allowed capacity in words
    pub const MIN_CAPACITY: usize = 1;
    /// Largest allowed capacity in words
    pub const MAX_CAPACITY: usize = 32;

    fn new(id: DataBlockId, kind: BlockKind, capacity: usize, initial: &[u16]) -> Result<Self> {
        if !(Self::MIN_CAPACITY..=Self::MAX_CAPACITY).contains(&capacity) {
            return Err(BcError::invalid_argument(format!(
                "Data block capacity {} out of range [{}, {}]",
                capacity,
                Self::MIN_CAPACITY,
                Self::MAX_CAPACITY
            )));
        }
        if initial.len() > capacity {
            return Err(BcError::invalid_argument(format!(
                "Initial data of {} words exceeds data block capacity {}",
                initial.len(),
                capacity
            )));
        }

        let mut words = vec![0u16; capacity];
        words[..initial.len()].copy_from_slice(initial);
        let other = match kind {
            BlockKind::Single => Vec::new(),
            BlockKind::Double => words.clone(),
        };

        Ok(DataBlock {
            id,
            kind,
            sides: [words, other],
            active: 0,
        })
    }

    /// Get the data block id
    pub fn id(&self) -> DataBlockId {
        self.id
    }

    /// Get the buffering scheme
    pub fn kind(&self) -> BlockKind {
        self.kind
    }

    /// Capacity in words
    pub fn capacity(&self) -> usize {
        self.sides[0].len()
    }

    fn inactive(&self) -> usize {
        match self.kind {
            BlockKind::Single => self.active,
            BlockKind::Double => 1 - self.active,
        }
    }

    /// Words on the side the bus currently reads from
    pub fn active_words(&self) -> &[u16] {
        &self.sides[self.active]
    }

    /// Words on the side the host may update
    pub fn inactive_words(&self) -> &[u16] {
        &self.sides[self.inactive()]
    }

    /// Copy `words` into the inactive side, starting at word 0
    pub fn write_inactive(&mut self, words: &[u16]) -> Result<()> {
        if words.len() > self.capacity() {
            return Err(BcError::invalid_argument(format!(
                "{} words exceed data block {} capacity {}",
                words.len(),
                self.id,
                self.capacity()
            )));
        }
        let side = self.inactive();
        self.sides[side][..words.len()].copy_from_slice(words);
        Ok(())
    }

    /// Swap active and inactive sides; a no-op for single-buffered blocks
    pub fn flip(&mut self) {
        if self.kind == BlockKind::Double {
            self.active = 1 - self.active;
        }
    }
}

/// Transfer direction of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Direction {
    /// Bus controller sends data to a remote terminal (RT receives)
    BcToRt,
    /// Remote terminal sends data to the bus controller (RT transmits)
    RtToBc,
}

impl Direction {
    /// Transmit bit of the command word
    pub fn transmit_bit(&self) -> bool {
        matches!(self, Direction::RtToBc)
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::BcToRt => write!(f, "BC->RT"),
            Direction::RtToBc => write!(f, "RT->BC"),
        }
    }
}

/// Parameters of a message creation request
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MessageSpec {
    /// Message id to create
    pub id: MessageId,
    /// Transfer direction
    pub direction: Direction,
    /// Data block providing or receiving the data words
    pub data_block: DataBlockId,
    /// Target RT address (0-31)
    pub rt: u8,
    /// Target sub-address (0-31)
    pub sub_address: u8,
    /// Data word count (1-32)
    pub word_count: u16,
    /// Gap after the message, in microseconds
    pub gap_time_us: u16,
    /// Channel the message is sent on
    pub channel: Channel,
}

impl MessageSpec {
    /// Describe a message with default gap time and channel A
    pub fn new(
        id: impl Into<MessageId>,
        direction: Direction,
        data_block: impl Into<DataBlockId>,
        rt: u8,
        sub_address: u8,
        word_count: u16,
    ) -> Self {
        MessageSpec {
            id: id.into(),
            direction,
            data_block: data_block.into(),
            rt,
            sub_address,
            word_count,
            gap_time_us: 0,
            channel: Channel::A,
        }
    }

    /// Set the inter-message gap time
    pub fn with_gap_time(mut self, gap_time_us: u16) -> Self {
        self.gap_time_us = gap_time_us;
        self
    }

    /// Set the channel
    pub fn with_channel(mut self, channel: Channel) -> Self {
        self.channel = channel;
        self
    }
}

/// A message definition, validated against the catalog
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Message {
    /// Message id
    pub id: MessageId,
    /// Transfer direction
    pub direction: Direction,
    /// Referenced data block
    pub data_block: DataBlockId,
    /// Target RT address
    pub address: Address,
    /// Target sub-address
    pub sub_address: SubAddress,
    /// Number of data words transferred
    pub word_count: WordCount,
    /// Gap after the message, in microseconds
    pub gap_time_us: u16,
    /// Channel the message is sent on
    pub channel: Channel,
    /// Data sent by an asynchronous message; `None` for scheduled messages
    pub async_buffer: Option<Vec<u16>>,
}

impl Message {
    /// Whether the message is only sent through an explicit asynchronous request
    pub fn is_async(&self) -> bool {
        self.async_buffer.is_some()
    }

    /// Command word the bus controller issues for this message
    pub fn command_word(&self) -> CommandWord {
        CommandWord::new(
            self.address,
            self.direction.transmit_bit(),
            self.sub_address,
            self.word_count,
        )
    }
}

/// Data blocks and messages of a device session
#[derive(Debug, Default)]
pub struct MessageCatalog {
    blocks: BTreeMap<DataBlockId, DataBlock>,
    messages: BTreeMap<MessageId, Message>,
}

impl MessageCatalog {
    /// Create an empty catalog
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a data block of `capacity` words, seeded with `initial`
    pub fn create_data_block(
        &mut self,
        id: DataBlockId,
        kind: BlockKind,
        capacity: usize,
        initial: &[u16],
    ) -> Result<()> {
        if self.blocks.contains_key(&id) {
            return Err(BcError::invalid_argument(format!(
                "Data block {} already exists",
                id
            )));
        }
        let block = DataBlock::new(id, kind, capacity, initial)?;
        self.blocks.insert(id, block);
        debug!(block = %id, ?kind, capacity, "created data block");
        Ok(())
    }

    /// Delete a data block no message references
    pub fn delete_data_block(&mut self, id: DataBlockId) -> Result<()> {
        if !self.blocks.contains_key(&id) {
            return Err(BcError::not_found(Entity::DataBlock, id));
        }
        if let Some(user) = self.messages.values().find(|msg| msg.data_block == id) {
            return Err(BcError::in_use(Entity::DataBlock, id, Entity::Message, user.id));
        }
        self.blocks.remove(&id);
        debug!(block = %id, "deleted data block");
        Ok(())
    }

    /// Create a scheduled message
    pub fn create_message(&mut self, spec: MessageSpec) -> Result<()> {
        let message = self.build_message(spec, None)?;
        self.insert_message(message);
        Ok(())
    }

    /// Create an asynchronous BC->RT message sending `buffer`
    pub fn create_async_message(&mut self, spec: MessageSpec, buffer: &[u16]) -> Result<()> {
        if spec.direction != Direction::BcToRt {
            return Err(BcError::invalid_argument(
                "Asynchronous messages must be BC->RT",
            ));
        }
        let count = WordCount::new(spec.word_count)?.get();
        if buffer.len() > count {
            return Err(BcError::invalid_argument(format!(
                "Asynchronous buffer of {} words exceeds word count {}",
                buffer.len(),
                count
            )));
        }
        let mut snapshot = vec![0u16; count];
        snapshot[..buffer.len()].copy_from_slice(buffer);

        let message = self.build_message(spec, Some(snapshot))?;
        self.insert_message(message);
        Ok(())
    }

    fn build_message(&self, spec: MessageSpec, async_buffer: Option<Vec<u16>>) -> Result<Message> {
        if self.messages.contains_key(&spec.id) {
            return Err(BcError::invalid_argument(format!(
                "Message {} already exists",
                spec.id
            )));
        }
        let address = Address::new(spec.rt)?;
        let sub_address = SubAddress::new(spec.sub_address)?;
        let word_count = WordCount::new(spec.word_count)?;

        let block = self
            .blocks
            .get(&spec.data_block)
            .ok_or_else(|| BcError::not_found(Entity::DataBlock, spec.data_block))?;
        if word_count.get() > block.capacity() {
            return Err(BcError::invalid_argument(format!(
                "Word count {} exceeds data block {} capacity {}",
                word_count.get(),
                block.id(),
                block.capacity()
            )));
        }

        Ok(Message {
            id: spec.id,
            direction: spec.direction,
            data_block: spec.data_block,
            address,
            sub_address,
            word_count,
            gap_time_us: spec.gap_time_us,
            channel: spec.channel,
            async_buffer,
        })
    }

    fn insert_message(&mut self, message: Message) {
        debug!(
            message = %message.id,
            direction = %message.direction,
            rt = message.address.value(),
            sa = message.sub_address.value(),
            wc = message.word_count.get(),
            asynchronous = message.is_async(),
            "created message"
        );
        self.messages.insert(message.id, message);
    }

    /// Delete a message
    pub fn delete_message(&mut self, id: MessageId) -> Result<()> {
        self.messages
            .remove(&id)
            .ok_or_else(|| BcError::not_found(Entity::Message, id))?;
        debug!(message = %id, "deleted message");
        Ok(())
    }

    /// Look up a data block
    pub fn data_block(&self, id: DataBlockId) -> Option<&DataBlock> {
        self.blocks.get(&id)
    }

    /// Look up a data block for mutation
    pub fn data_block_mut(&mut self, id: DataBlockId) -> Option<&mut DataBlock> {
        self.blocks.get_mut(&id)
    }

    /// Look up a message
    pub fn message(&self, id: MessageId) -> Option<&Message> {
        self.messages.get(&id)
    }

    /// Number of data blocks
    pub fn data_block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Number of messages
    pub fn message_count(&self) -> usize {
        self.messages.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn catalog_with_block(capacity: usize) -> MessageCatalog {
        let mut catalog = MessageCatalog::new();
        catalog
            .create_data_block(DataBlockId::new(1), BlockKind::Single, capacity, &[])
            .unwrap();
        catalog
    }

    #[test]
    fn test_data_block_capacity_range() {
        let mut catalog = MessageCatalog::new();
        for capacity in [0, 33] {
            let err = catalog
                .create_data_block(DataBlockId::new(1), BlockKind::Single, capacity, &[])
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        }
        assert!(catalog
            .create_data_block(DataBlockId::new(1), BlockKind::Single, 32, &[])
            .is_ok());
    }

    #[test]
    fn test_duplicate_data_block() {
        let mut catalog = catalog_with_block(4);
        let err = catalog
            .create_data_block(DataBlockId::new(1), BlockKind::Double, 4, &[])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_initial_data() -> Result<()> {
        let mut catalog = MessageCatalog::new();
        catalog.create_data_block(DataBlockId::new(3), BlockKind::Single, 4, &[1, 2])?;
        let block = catalog.data_block(DataBlockId::new(3)).unwrap();
        assert_eq!(block.active_words(), &[1, 2, 0, 0]);

        let err = catalog
            .create_data_block(DataBlockId::new(4), BlockKind::Single, 2, &[1, 2, 3])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        Ok(())
    }

    #[test]
    fn test_double_buffer_sides() -> Result<()> {
        let mut catalog = MessageCatalog::new();
        catalog.create_data_block(DataBlockId::new(1), BlockKind::Double, 2, &[5, 5])?;
        let block = catalog.data_block_mut(DataBlockId::new(1)).unwrap();

        block.write_inactive(&[7, 8])?;
        assert_eq!(block.active_words(), &[5, 5]);
        block.flip();
        assert_eq!(block.active_words(), &[7, 8]);
        assert_eq!(block.inactive_words(), &[5, 5]);
        Ok(())
    }

    #[test]
    fn test_single_buffer_flip_is_noop() -> Result<()> {
        let mut catalog = catalog_with_block(2);
        let block = catalog.data_block_mut(DataBlockId::new(1)).unwrap();
        block.write_inactive(&[9])?;
        block.flip();
        assert_eq!(block.active_words(), &[9, 0]);
        Ok(())
    }

    #[test]
    fn test_message_validation() {
        let mut catalog = catalog_with_block(16);

        let bad_rt = MessageSpec::new(1, Direction::RtToBc, 1, 32, 1, 4);
        assert_eq!(
            catalog.create_message(bad_rt).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );

        let bad_sa = MessageSpec::new(1, Direction::RtToBc, 1, 1, 32, 4);
        assert_eq!(
            catalog.create_message(bad_sa).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );

        let too_long = MessageSpec::new(1, Direction::RtToBc, 1, 1, 1, 17);
        assert_eq!(
            catalog.create_message(too_long).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );

        let no_block = MessageSpec::new(1, Direction::RtToBc, 9, 1, 1, 4);
        assert_eq!(
            catalog.create_message(no_block).unwrap_err(),
            BcError::not_found(Entity::DataBlock, 9u16)
        );

        let ok = MessageSpec::new(1, Direction::RtToBc, 1, 1, 1, 16);
        assert!(catalog.create_message(ok.clone()).is_ok());
        assert_eq!(
            catalog.create_message(ok).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
    }

    #[test]
    fn test_deletion_ordering() -> Result<()> {
        let mut catalog = catalog_with_block(32);
        catalog.create_message(MessageSpec::new(1, Direction::RtToBc, 1, 1, 1, 32))?;

        let err = catalog.delete_data_block(DataBlockId::new(1)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceInUse);

        catalog.delete_message(MessageId::new(1))?;
        catalog.delete_data_block(DataBlockId::new(1))?;
        assert_eq!(catalog.data_block_count(), 0);
        assert_eq!(
            catalog.delete_message(MessageId::new(1)).unwrap_err().kind(),
            ErrorKind::NotFound
        );
        Ok(())
    }

    #[test]
    fn test_async_message() -> Result<()> {
        let mut catalog = catalog_with_block(8);
        let spec = MessageSpec::new(5, Direction::BcToRt, 1, 2, 3, 4);
        catalog.create_async_message(spec, &[0xAAAA, 0x5555])?;

        let message = catalog.message(MessageId::new(5)).unwrap();
        assert!(message.is_async());
        assert_eq!(
            message.async_buffer.as_deref(),
            Some(&[0xAAAA, 0x5555, 0, 0][..])
        );

        let receive = MessageSpec::new(6, Direction::RtToBc, 1, 2, 3, 4);
        assert!(catalog.create_async_message(receive, &[]).is_err());
        Ok(())
    }

    #[test]
    fn test_block_kind_codes() {
        assert_eq!(BlockKind::try_from(32).unwrap(), BlockKind::Single);
        assert_eq!(BlockKind::try_from(33).unwrap(), BlockKind::Double);
        assert!(BlockKind::try_from(1).is_err());
        assert_eq!(BlockKind::Double.code(), 33);
    }
}
