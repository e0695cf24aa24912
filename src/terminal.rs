//! Remote terminals answering bus controller transfers

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::catalog::Direction;
use crate::core::{Address, Channel, SubAddress, WordCount};
use crate::word::{CommandWord, StatusWord};

/// A transfer put on the bus by the scheduler
#[derive(Debug, Clone)]
pub struct TransferRequest<'a> {
    /// Command word issued by the bus controller
    pub command: CommandWord,
    /// Target terminal
    pub address: Address,
    /// Target sub-address
    pub sub_address: SubAddress,
    /// Transfer direction
    pub direction: Direction,
    /// Number of data words
    pub word_count: WordCount,
    /// Channel used
    pub channel: Channel,
    /// Data words sent for BC->RT transfers; empty for RT->BC
    pub data: &'a [u16],
    /// Virtual bus time at which the command word is sent, in microseconds
    pub time_us: u64,
}

/// What came back from the terminal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferResponse {
    /// Terminal answered; `status` is absent for broadcast transfers
    Completed {
        status: Option<StatusWord>,
        data: Vec<u16>,
    },
    /// Terminal did not answer within the response timeout
    NoResponse,
}

/// The far side of the bus
///
/// The scheduler hands every transfer to a responder, one at a time.
pub trait BusResponder: Send {
    fn transfer(&mut self, request: &TransferRequest<'_>) -> TransferResponse;
}

/// State of a Remote Terminal device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RTState {
    /// Device is idle
    Idle,
    /// Device reported an error or did not respond
    Error,
    /// Device is configured not to respond
    NoResponse,
}

/// A simulated Remote Terminal
#[derive(Debug, Clone)]
pub struct RemoteTerminal {
    /// Address of the RT
    pub address: Address,
    /// Current state
    pub state: RTState,
    /// Virtual time of the last transaction
    pub last_seen_us: Option<u64>,
    /// Number of errors detected
    pub error_count: u32,
    /// Number of successful transactions
    pub success_count: u32,
    responding: bool,
    memory: HashMap<u8, Vec<u16>>,
}

impl RemoteTerminal {
    /// Create a new Remote Terminal
    pub fn new(address: Address) -> Self {
        RemoteTerminal {
            address,
            state: RTState::Idle,
            last_seen_us: None,
            error_count: 0,
            success_count: 0,
            responding: true,
            memory: HashMap::new(),
        }
    }

    fn sub_address_memory(&mut self, sub_address: SubAddress) -> &mut Vec<u16> {
        let rt = self.address.value() as u16;
        self.memory.entry(sub_address.value()).or_insert_with(|| {
            let sa = sub_address.value() as u16;
            (0..WordCount::MAX as u16)
                .map(|i| (rt << 11) | (sa << 6) | i)
                .collect()
        })
    }

    /// Record a successful transaction
    pub fn record_success(&mut self, time_us: u64) {
        self.success_count += 1;
        self.state = RTState::Idle;
        self.last_seen_us = Some(time_us);
    }

    /// Record a failed transaction
    pub fn record_error(&mut self, time_us: u64) {
        self.error_count += 1;
        self.state = if self.responding {
            RTState::Error
        } else {
            RTState::NoResponse
        };
        self.last_seen_us = Some(time_us);
    }

    fn respond(&mut self, request: &TransferRequest<'_>) -> TransferResponse {
        if !self.responding {
            self.record_error(request.time_us);
            return TransferResponse::NoResponse;
        }
        let count = request.word_count.get();
        let memory = self.sub_address_memory(request.sub_address);
        let data = match request.direction {
            Direction::BcToRt => {
                let len = request.data.len().min(count);
                memory[..len].copy_from_slice(&request.data[..len]);
                Vec::new()
            }
            Direction::RtToBc => memory[..count].to_vec(),
        };
        self.record_success(request.time_us);
        TransferResponse::Completed {
            status: Some(StatusWord::clear(self.address)),
            data,
        }
    }
}

/// Statistics for a Remote Terminal
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RTStats {
    /// Address of the RT
    pub address: Address,
    /// Current state
    pub state: RTState,
    /// Number of successful transactions
    pub success_count: u32,
    /// Number of failed transactions
    pub error_count: u32,
    /// Error rate (0.0 to 1.0)
    pub error_rate: f32,
}

#[derive(Debug, Default)]
struct Terminals {
    by_address: HashMap<u8, RemoteTerminal>,
}

impl Terminals {
    fn terminal(&mut self, address: Address) -> &mut RemoteTerminal {
        self.by_address
            .entry(address.value())
            .or_insert_with(|| RemoteTerminal::new(address))
    }
}

/// Simulated remote terminals with per-subaddress memory
///
/// Every terminal keeps 32 words per sub-address. BC->RT transfers store
/// into that memory and RT->BC transfers read it back. Memory starts with
/// the pattern `rt << 11 | sa << 6 | index`. Terminals are created on first
/// use. Clones share the same terminals, so a host can keep a handle after
/// passing one to a session.
#[derive(Debug, Clone, Default)]
pub struct SimulatedBus {
    terminals: Arc<Mutex<Terminals>>,
}

impl SimulatedBus {
    /// Create a bus with no terminals yet
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a terminal answer or ignore transfers
    pub fn set_responding(&self, address: Address, responding: bool) {
        let mut terminals = self.terminals.lock();
        terminals.terminal(address).responding = responding;
    }

    /// Preload sub-address memory, starting at word 0
    pub fn load(&self, address: Address, sub_address: SubAddress, words: &[u16]) {
        let mut terminals = self.terminals.lock();
        let memory = terminals.terminal(address).sub_address_memory(sub_address);
        let len = words.len().min(memory.len());
        memory[..len].copy_from_slice(&words[..len]);
    }

    /// Current sub-address memory
    pub fn memory(&self, address: Address, sub_address: SubAddress) -> Vec<u16> {
        let mut terminals = self.terminals.lock();
        terminals.terminal(address).sub_address_memory(sub_address).clone()
    }

    /// Statistics for one terminal, if it has been used
    pub fn stats(&self, address: Address) -> Option<RTStats> {
        let terminals = self.terminals.lock();
        terminals.by_address.get(&address.value()).map(|rt| {
            let total = rt.success_count + rt.error_count;
            RTStats {
                address: rt.address,
                state: rt.state,
                success_count: rt.success_count,
                error_count: rt.error_count,
                error_rate: if total > 0 {
                    rt.error_count as f32 / total as f32
                } else {
                    0.0
                },
            }
        })
    }
}

impl BusResponder for SimulatedBus {
    fn transfer(&mut self, request: &TransferRequest<'_>) -> TransferResponse {
        let mut terminals = self.terminals.lock();
        let response = if request.address.is_broadcast() {
            match request.direction {
                // Broadcast receive reaches every known terminal; none answers.
                Direction::BcToRt => {
                    for rt in terminals.by_address.values_mut() {
                        if rt.responding {
                            let _ = rt.respond(request);
                        }
                    }
                    TransferResponse::Completed {
                        status: None,
                        data: Vec::new(),
                    }
                }
                Direction::RtToBc => TransferResponse::NoResponse,
            }
        } else {
            terminals.terminal(request.address).respond(request)
        };
        trace!(
            rt = request.address.value(),
            sa = request.sub_address.value(),
            direction = %request.direction,
            ?response,
            "terminal transfer"
        );
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;

    fn request<'a>(
        rt: u8,
        direction: Direction,
        count: u16,
        data: &'a [u16],
    ) -> Result<TransferRequest<'a>> {
        let address = Address::new(rt)?;
        let sub_address = SubAddress::new(1)?;
        let word_count = WordCount::new(count)?;
        Ok(TransferRequest {
            command: CommandWord::new(address, direction.transmit_bit(), sub_address, word_count),
            address,
            sub_address,
            direction,
            word_count,
            channel: Channel::A,
            data,
            time_us: 100,
        })
    }

    #[test]
    fn test_receive_then_transmit() -> Result<()> {
        let mut bus = SimulatedBus::new();
        let sent = bus.transfer(&request(3, Direction::BcToRt, 2, &[0xBEEF, 0xCAFE])?);
        assert!(matches!(sent, TransferResponse::Completed { ref data, .. } if data.is_empty()));

        match bus.transfer(&request(3, Direction::RtToBc, 3, &[])?) {
            TransferResponse::Completed { status, data } => {
                assert_eq!(status.map(|s| s.rt_address()), Some(3));
                assert_eq!(data, vec![0xBEEF, 0xCAFE, (3 << 11) | (1 << 6) | 2]);
            }
            other => panic!("unexpected response {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn test_default_pattern() -> Result<()> {
        let bus = SimulatedBus::new();
        let memory = bus.memory(Address::new(1)?, SubAddress::new(1)?);
        assert_eq!(memory.len(), 32);
        assert_eq!(memory[0], 0x0840);
        assert_eq!(memory[31], 0x085F);
        Ok(())
    }

    #[test]
    fn test_non_responding_terminal() -> Result<()> {
        let mut bus = SimulatedBus::new();
        let address = Address::new(4)?;
        bus.set_responding(address, false);
        assert_eq!(
            bus.transfer(&request(4, Direction::RtToBc, 1, &[])?),
            TransferResponse::NoResponse
        );

        let stats = bus.stats(address).unwrap();
        assert_eq!(stats.state, RTState::NoResponse);
        assert_eq!(stats.error_count, 1);
        assert_eq!(stats.error_rate, 1.0);
        Ok(())
    }

    #[test]
    fn test_broadcast_receive() -> Result<()> {
        let mut bus = SimulatedBus::new();
        let a = Address::new(1)?;
        let b = Address::new(2)?;
        bus.set_responding(a, true);
        bus.set_responding(b, true);

        let response = bus.transfer(&request(31, Direction::BcToRt, 1, &[0x1234])?);
        assert_eq!(
            response,
            TransferResponse::Completed {
                status: None,
                data: Vec::new()
            }
        );
        assert_eq!(bus.memory(a, SubAddress::new(1)?)[0], 0x1234);
        assert_eq!(bus.memory(b, SubAddress::new(1)?)[0], 0x1234);
        Ok(())
    }

    #[test]
    fn test_stats_untouched_terminal() -> Result<()> {
        let bus = SimulatedBus::new();
        assert!(bus.stats(Address::new(9)?).is_none());
        Ok(())
    }
}
