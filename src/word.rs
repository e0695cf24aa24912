//! Command, status and block status words captured with each transfer

use bitfield::bitfield;

use crate::core::{Address, SubAddress, WordCount};

bitfield! {
    /// A MIL-STD-1553B command word
    ///
    /// Format:
    /// - Bits 15-11: RT address
    /// - Bit 10: Transmit (1) / Receive (0), from the RT's point of view
    /// - Bits 9-5: Sub-address
    /// - Bits 4-0: Data word count (0 means 32 words)
    #[derive(Clone, Copy, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct CommandWord(u16);
    impl Debug;
    u8;
    pub rt_address, set_rt_address: 15, 11;
    pub transmit, set_transmit: 10;
    pub sub_address, set_sub_address: 9, 5;
    pub word_count_field, set_word_count_field: 4, 0;
}

impl CommandWord {
    /// Build a command word for a transfer
    pub fn new(address: Address, transmit: bool, sub_address: SubAddress, count: WordCount) -> Self {
        let mut word = CommandWord(0);
        word.set_rt_address(address.value());
        word.set_transmit(transmit);
        word.set_sub_address(sub_address.value());
        word.set_word_count_field(count.field());
        word
    }

    /// Wrap a raw 16-bit value
    pub fn from_raw(raw: u16) -> Self {
        CommandWord(raw)
    }

    /// Get the raw 16-bit value
    pub fn raw(&self) -> u16 {
        self.0
    }

    /// Decoded word count
    pub fn word_count(&self) -> WordCount {
        WordCount::from_field(self.word_count_field())
    }
}

bitfield! {
    /// A MIL-STD-1553B status word returned by a remote terminal
    ///
    /// Format:
    /// - Bits 15-11: RT address
    /// - Bit 10: Message error
    /// - Bit 9: Instrumentation
    /// - Bit 8: Service request
    /// - Bits 7-5: Reserved
    /// - Bit 4: Broadcast command received
    /// - Bit 3: Busy
    /// - Bit 2: Subsystem flag
    /// - Bit 1: Dynamic bus control acceptance
    /// - Bit 0: Terminal flag
    #[derive(Clone, Copy, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct StatusWord(u16);
    impl Debug;
    u8;
    pub rt_address, set_rt_address: 15, 11;
    pub message_error, set_message_error: 10;
    pub instrumentation, set_instrumentation: 9;
    pub service_request, set_service_request: 8;
    pub broadcast_received, set_broadcast_received: 4;
    pub busy, set_busy: 3;
    pub subsystem_flag, set_subsystem_flag: 2;
    pub dynamic_bus_control, set_dynamic_bus_control: 1;
    pub terminal_flag, set_terminal_flag: 0;
}

impl StatusWord {
    /// Clear status word from the given terminal
    pub fn clear(address: Address) -> Self {
        let mut word = StatusWord(0);
        word.set_rt_address(address.value());
        word
    }

    /// Wrap a raw 16-bit value
    pub fn from_raw(raw: u16) -> Self {
        StatusWord(raw)
    }

    /// Get the raw 16-bit value
    pub fn raw(&self) -> u16 {
        self.0
    }

    /// Whether any error or attention bit is raised
    pub fn has_exception(&self) -> bool {
        self.message_error() || self.busy() || self.subsystem_flag() || self.terminal_flag()
    }
}

/// Block status flags recorded by the bus controller for each message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BlockStatus {
    /// Message completed
    pub end_of_message: bool,
    /// Message was transmitted on channel B
    pub channel_b: bool,
    /// An error was detected during the transfer
    pub error: bool,
    /// Status word had an exception bit set
    pub status_set: bool,
    /// Remote terminal did not respond
    pub no_response: bool,
}

impl BlockStatus {
    const END_OF_MESSAGE: u16 = 0x8000;
    const CHANNEL_B: u16 = 0x2000;
    const ERROR: u16 = 0x1000;
    const STATUS_SET: u16 = 0x0800;
    const NO_RESPONSE: u16 = 0x0200;

    /// Encode flags as a 16-bit block status word
    pub fn encode(&self) -> u16 {
        let mut word = 0u16;
        if self.end_of_message {
            word |= Self::END_OF_MESSAGE;
        }
        if self.channel_b {
            word |= Self::CHANNEL_B;
        }
        if self.error {
            word |= Self::ERROR;
        }
        if self.status_set {
            word |= Self::STATUS_SET;
        }
        if self.no_response {
            word |= Self::NO_RESPONSE;
        }
        word
    }

    /// Decode flags from a 16-bit block status word
    pub fn decode(word: u16) -> Self {
        BlockStatus {
            end_of_message: word & Self::END_OF_MESSAGE != 0,
            channel_b: word & Self::CHANNEL_B != 0,
            error: word & Self::ERROR != 0,
            status_set: word & Self::STATUS_SET != 0,
            no_response: word & Self::NO_RESPONSE != 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;

    #[test]
    fn test_command_word_layout() -> Result<()> {
        let word = CommandWord::new(Address::new(1)?, true, SubAddress::new(1)?, WordCount::new(32)?);
        // 00001 1 00001 00000
        assert_eq!(word.raw(), 0x0C20);
        assert_eq!(word.rt_address(), 1);
        assert!(word.transmit());
        assert_eq!(word.sub_address(), 1);
        assert_eq!(word.word_count().get(), 32);
        Ok(())
    }

    #[test]
    fn test_command_word_from_raw() {
        let word = CommandWord::from_raw(0xF9E5);
        assert_eq!(word.rt_address(), 31);
        assert!(!word.transmit());
        assert_eq!(word.sub_address(), 15);
        assert_eq!(word.word_count().get(), 5);
    }

    #[test]
    fn test_status_word_flags() -> Result<()> {
        let mut status = StatusWord::clear(Address::new(5)?);
        assert_eq!(status.raw(), 5 << 11);
        assert!(!status.has_exception());

        status.set_busy(true);
        assert!(status.has_exception());
        assert_eq!(status.raw() & 0x0008, 0x0008);
        Ok(())
    }

    #[test]
    fn test_block_status_encoding() {
        let flags = BlockStatus {
            end_of_message: true,
            no_response: true,
            ..Default::default()
        };
        assert_eq!(flags.encode(), 0x8200);
        assert_eq!(BlockStatus::decode(flags.encode()), flags);
    }
}
