//! Hardware buffer: bounded store of decoded completed transfers

use std::collections::VecDeque;

use parking_lot::Mutex;
use tracing::trace;

use crate::catalog::Direction;
use crate::core::{Channel, MessageId};
use crate::error::{BcError, Result};
use crate::word::{BlockStatus, CommandWord, StatusWord};

/// A completed transfer as captured by the bus controller
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DecodedRecord {
    /// Message that was transferred
    pub message: MessageId,
    /// Transfer direction
    pub direction: Direction,
    /// Block status flags
    pub block_status: BlockStatus,
    /// Virtual time of completion, in microseconds
    pub time_tag: u64,
    /// Command word issued
    pub command: CommandWord,
    /// Status word returned; absent for broadcast or no response
    pub status: Option<StatusWord>,
    /// Number of valid data words
    pub word_count: usize,
    /// Data words at completion time
    pub data: Vec<u16>,
    /// Channel used
    pub channel: Channel,
    /// Gap time that followed the message, in microseconds
    pub gap_time_us: u16,
}

/// Which record `drain` returns and whether it is removed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MsgLocation {
    /// Oldest unread record, removed on read
    #[default]
    NextPurge,
    /// Oldest unread record, left in place
    NextNoPurge,
    /// Newest record; the whole buffer is purged
    LatestPurge,
    /// Newest record, left in place
    LatestNoPurge,
}

impl MsgLocation {
    /// Integer code used at the driver boundary
    pub fn code(&self) -> u16 {
        match self {
            MsgLocation::NextPurge => 0,
            MsgLocation::NextNoPurge => 1,
            MsgLocation::LatestPurge => 2,
            MsgLocation::LatestNoPurge => 3,
        }
    }
}

impl TryFrom<u16> for MsgLocation {
    type Error = BcError;

    fn try_from(value: u16) -> Result<Self> {
        match value {
            0 => Ok(MsgLocation::NextPurge),
            1 => Ok(MsgLocation::NextNoPurge),
            2 => Ok(MsgLocation::LatestPurge),
            3 => Ok(MsgLocation::LatestNoPurge),
            _ => Err(BcError::invalid_argument(format!(
                "Unknown message location: {}",
                value
            ))),
        }
    }
}

/// Outcome of a `drain` call
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Drained {
    /// Selected record, `None` when nothing is unread
    pub record: Option<DecodedRecord>,
    /// Records still held after the call
    pub pending: usize,
    /// Total records lost to overflow so far
    pub lost: u64,
}

impl Drained {
    /// Whether the buffer had nothing to return
    pub fn is_empty(&self) -> bool {
        self.record.is_none()
    }
}

#[derive(Debug)]
struct Fifo {
    records: VecDeque<DecodedRecord>,
    lost: u64,
    produced: u64,
}

/// Bounded FIFO of decoded records shared by the scheduler and a reader
///
/// When full, pushing evicts the oldest record and counts it as lost.
/// Every operation takes the one internal lock and returns immediately.
#[derive(Debug)]
pub struct HardwareBuffer {
    capacity: usize,
    fifo: Mutex<Fifo>,
}

impl HardwareBuffer {
    const PREALLOCATE_LIMIT: usize = 4096;

    /// Create a buffer holding up to `capacity` records
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(BcError::invalid_argument(
                "Hardware buffer capacity must be positive",
            ));
        }
        Ok(HardwareBuffer {
            capacity,
            fifo: Mutex::new(Fifo {
                records: VecDeque::with_capacity(capacity.min(Self::PREALLOCATE_LIMIT)),
                lost: 0,
                produced: 0,
            }),
        })
    }

    /// Configured capacity in records
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a record, evicting the oldest one if the buffer is full
    pub fn push(&self, record: DecodedRecord) {
        let mut fifo = self.fifo.lock();
        if fifo.records.len() == self.capacity {
            if let Some(evicted) = fifo.records.pop_front() {
                fifo.lost += 1;
                trace!(message = %evicted.message, time_tag = evicted.time_tag, "hardware buffer overflow");
            }
        }
        fifo.records.push_back(record);
        fifo.produced += 1;
    }

    /// Retrieve a record without blocking
    pub fn drain(&self, location: MsgLocation) -> Drained {
        let mut fifo = self.fifo.lock();
        let record = match location {
            MsgLocation::NextPurge => fifo.records.pop_front(),
            MsgLocation::NextNoPurge => fifo.records.front().cloned(),
            MsgLocation::LatestPurge => {
                let latest = fifo.records.pop_back();
                fifo.records.clear();
                latest
            }
            MsgLocation::LatestNoPurge => fifo.records.back().cloned(),
        };
        Drained {
            record,
            pending: fifo.records.len(),
            lost: fifo.lost,
        }
    }

    /// Records currently held
    pub fn len(&self) -> usize {
        self.fifo.lock().records.len()
    }

    /// Whether no record is held
    pub fn is_empty(&self) -> bool {
        self.fifo.lock().records.is_empty()
    }

    /// Total records lost to overflow
    pub fn lost(&self) -> u64 {
        self.fifo.lock().lost
    }

    /// Total records ever pushed
    pub fn produced(&self) -> u64 {
        self.fifo.lock().produced
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Address, SubAddress, WordCount};
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::thread;

    fn record(time_tag: u64) -> DecodedRecord {
        let address = Address::new(1).unwrap();
        DecodedRecord {
            message: MessageId::new(1),
            direction: Direction::RtToBc,
            block_status: BlockStatus {
                end_of_message: true,
                ..Default::default()
            },
            time_tag,
            command: CommandWord::new(
                address,
                true,
                SubAddress::new(1).unwrap(),
                WordCount::new(1).unwrap(),
            ),
            status: Some(StatusWord::clear(address)),
            word_count: 1,
            data: vec![time_tag as u16],
            channel: Channel::A,
            gap_time_us: 0,
        }
    }

    fn tags(buffer: &HardwareBuffer) -> Vec<u64> {
        let mut out = Vec::new();
        while let Some(rec) = buffer.drain(MsgLocation::NextPurge).record {
            out.push(rec.time_tag);
        }
        out
    }

    #[test]
    fn test_zero_capacity() {
        assert!(HardwareBuffer::new(0).is_err());
    }

    #[test]
    fn test_empty_drain() -> Result<()> {
        let buffer = HardwareBuffer::new(4)?;
        for location in [
            MsgLocation::NextPurge,
            MsgLocation::NextNoPurge,
            MsgLocation::LatestPurge,
            MsgLocation::LatestNoPurge,
        ] {
            let drained = buffer.drain(location);
            assert!(drained.is_empty());
            assert_eq!(drained.lost, 0);
        }
        Ok(())
    }

    #[test]
    fn test_locations() -> Result<()> {
        let buffer = HardwareBuffer::new(8)?;
        for tag in 1..=4 {
            buffer.push(record(tag));
        }

        let peek = buffer.drain(MsgLocation::NextNoPurge);
        assert_eq!(peek.record.map(|r| r.time_tag), Some(1));
        assert_eq!(peek.pending, 4);

        let latest = buffer.drain(MsgLocation::LatestNoPurge);
        assert_eq!(latest.record.map(|r| r.time_tag), Some(4));
        assert_eq!(latest.pending, 4);

        let next = buffer.drain(MsgLocation::NextPurge);
        assert_eq!(next.record.map(|r| r.time_tag), Some(1));
        assert_eq!(next.pending, 3);

        let purge = buffer.drain(MsgLocation::LatestPurge);
        assert_eq!(purge.record.map(|r| r.time_tag), Some(4));
        assert_eq!(purge.pending, 0);
        assert!(buffer.is_empty());
        Ok(())
    }

    #[test]
    fn test_overflow_keeps_newest() -> Result<()> {
        let buffer = HardwareBuffer::new(3)?;
        for tag in 1..=5 {
            buffer.push(record(tag));
        }
        assert_eq!(buffer.lost(), 2);
        assert_eq!(buffer.produced(), 5);
        assert_eq!(buffer.drain(MsgLocation::NextNoPurge).lost, 2);
        assert_eq!(tags(&buffer), vec![3, 4, 5]);
        Ok(())
    }

    #[test]
    fn test_concurrent_producer_and_reader() -> Result<()> {
        let buffer = Arc::new(HardwareBuffer::new(16)?);
        let producer = {
            let buffer = Arc::clone(&buffer);
            thread::spawn(move || {
                for tag in 0..1000 {
                    buffer.push(record(tag));
                }
            })
        };

        let mut read = 0u64;
        let mut last = None;
        while !producer.is_finished() || !buffer.is_empty() {
            if let Some(rec) = buffer.drain(MsgLocation::NextPurge).record {
                assert!(last.map_or(true, |prev| rec.time_tag > prev));
                last = Some(rec.time_tag);
                read += 1;
            }
        }
        producer.join().unwrap();
        assert_eq!(read + buffer.lost(), 1000);
        Ok(())
    }

    proptest! {
        #[test]
        fn overflow_drops_exactly_the_excess(capacity in 1usize..64, extra in 1usize..64) {
            let buffer = HardwareBuffer::new(capacity).unwrap();
            let total = (capacity + extra) as u64;
            for tag in 0..total {
                buffer.push(record(tag));
            }
            prop_assert_eq!(buffer.lost(), extra as u64);
            let expected: Vec<u64> = (extra as u64..total).collect();
            prop_assert_eq!(tags(&buffer), expected);
        }
    }
}
