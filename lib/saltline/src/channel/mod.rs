pub mod reliable;
pub mod unreliable;

use serde_derive::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::block::{BlockRef, OutgoingBlock, CHANNEL_BLOCK_HEADER_SIZE};
use crate::message::Message;
use crate::shared::NetworkResult;

pub use self::reliable::ReliableChannel;
pub use self::unreliable::{UnreliableOrderedChannel, UnreliableUnorderedChannel};

/// Channel sub-commands, carried in the high nibble of the block type byte.
pub const CMD_SHORT_MESSAGE: u8 = 0;
pub const CMD_LONG_MESSAGE: u8 = 1;
pub const CMD_ACK: u8 = 2;
pub const CMD_ACK_BITMAP: u8 = 3;

/// Per-fragment header of a long message: message number, offset, total length.
pub const LONG_MESSAGE_HEADER_SIZE: usize = 2 + 4 + 4;

/// The delivery contract of a channel.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, Eq, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum ChannelKind {
    ReliableOrdered,
    ReliableUnordered,
    UnreliableOrdered,
    UnreliableUnordered,
}

impl ChannelKind {
    #[inline]
    pub fn from_u8(value: u8) -> Option<ChannelKind> {
        Some(match value {
            0 => ChannelKind::ReliableOrdered,
            1 => ChannelKind::ReliableUnordered,
            2 => ChannelKind::UnreliableOrdered,
            3 => ChannelKind::UnreliableUnordered,
            _ => return None,
        })
    }

    /// The default channel layout rotates through all four kinds.
    #[inline]
    pub fn round_robin(index: usize) -> ChannelKind {
        match index % 4 {
            0 => ChannelKind::ReliableOrdered,
            1 => ChannelKind::ReliableUnordered,
            2 => ChannelKind::UnreliableOrdered,
            _ => ChannelKind::UnreliableUnordered,
        }
    }
}

/// Everything a channel needs when emitting outgoing blocks.
pub struct OutgoingContext<'a> {
    pub now: u64,
    /// Retransmission timeout for fresh transmissions, already clamped.
    pub rto: u64,
    /// Ceiling for per-block exponential backoff, already clamped.
    pub resend_limit: u64,
    /// Bytes available for a single block in one frame.
    pub block_budget: usize,
    /// Packets counted as lost this measurement window.
    pub lost: &'a mut u64,
    pub queue: &'a mut VecDeque<OutgoingBlock>,
}

/// One channel of a peer, dispatched through the shared capability set.
pub enum Channel {
    ReliableOrdered(ReliableChannel),
    ReliableUnordered(ReliableChannel),
    UnreliableOrdered(UnreliableOrderedChannel),
    UnreliableUnordered(UnreliableUnorderedChannel),
}

impl Channel {
    pub fn new(kind: ChannelKind, index: u8, window_size: u32, max_message_size: usize) -> Channel {
        match kind {
            ChannelKind::ReliableOrdered => {
                Channel::ReliableOrdered(ReliableChannel::new(index, window_size, true, max_message_size))
            }
            ChannelKind::ReliableUnordered => {
                Channel::ReliableUnordered(ReliableChannel::new(index, window_size, false, max_message_size))
            }
            ChannelKind::UnreliableOrdered => {
                Channel::UnreliableOrdered(UnreliableOrderedChannel::new(index, max_message_size))
            }
            ChannelKind::UnreliableUnordered => {
                Channel::UnreliableUnordered(UnreliableUnorderedChannel::new(index, max_message_size))
            }
        }
    }

    #[inline]
    pub fn kind(&self) -> ChannelKind {
        match self {
            Channel::ReliableOrdered(_) => ChannelKind::ReliableOrdered,
            Channel::ReliableUnordered(_) => ChannelKind::ReliableUnordered,
            Channel::UnreliableOrdered(_) => ChannelKind::UnreliableOrdered,
            Channel::UnreliableUnordered(_) => ChannelKind::UnreliableUnordered,
        }
    }

    /// Largest message that still fits a single block in a frame with `frame_budget`
    /// bytes of block space.
    #[inline]
    pub fn max_unfragmented_size(&self, frame_budget: usize) -> usize {
        let overhead = CHANNEL_BLOCK_HEADER_SIZE + self.short_overhead();
        frame_budget.saturating_sub(overhead)
    }

    /// Payload bytes carried by one long-message fragment.
    #[inline]
    pub fn fragment_size(&self, frame_budget: usize) -> usize {
        let overhead = CHANNEL_BLOCK_HEADER_SIZE + self.sequence_overhead() + LONG_MESSAGE_HEADER_SIZE;
        frame_budget.saturating_sub(overhead)
    }

    #[inline]
    fn sequence_overhead(&self) -> usize {
        match self {
            Channel::UnreliableUnordered(_) => 0,
            _ => 2,
        }
    }

    #[inline]
    fn short_overhead(&self) -> usize {
        self.sequence_overhead()
    }

    /// Queues a message for transmission, fragmenting when it exceeds the
    /// unfragmented budget.
    pub fn send_message(
        &mut self,
        message: &Message,
        frame_budget: usize,
        max_message_size: usize,
    ) -> NetworkResult<()> {
        let short_budget = self.max_unfragmented_size(frame_budget);
        let fragment_budget = self.fragment_size(frame_budget);

        match self {
            Channel::ReliableOrdered(channel) | Channel::ReliableUnordered(channel) => {
                channel.send_message(message, short_budget, fragment_budget, max_message_size)
            }
            Channel::UnreliableOrdered(channel) => {
                channel.send_message(message, short_budget, fragment_budget, max_message_size)
            }
            Channel::UnreliableUnordered(channel) => {
                channel.send_message(message, short_budget, fragment_budget, max_message_size)
            }
        }
    }

    /// Feeds one received channel block into the channel.
    pub fn dispatch_incoming(
        &mut self,
        command: u8,
        payload: &[u8],
        now: u64,
        rtt_samples: &mut Vec<u64>,
    ) -> NetworkResult<()> {
        match self {
            Channel::ReliableOrdered(channel) | Channel::ReliableUnordered(channel) => {
                channel.dispatch_incoming(command, payload, now, rtt_samples)
            }
            Channel::UnreliableOrdered(channel) => channel.dispatch_incoming(command, payload),
            Channel::UnreliableUnordered(channel) => channel.dispatch_incoming(command, payload),
        }
    }

    /// Moves ready blocks (acknowledgements, retransmissions, fresh traffic) into
    /// the peer's outgoing queue.
    pub fn dispatch_outgoing(&mut self, ctx: &mut OutgoingContext) {
        match self {
            Channel::ReliableOrdered(channel) | Channel::ReliableUnordered(channel) => {
                channel.dispatch_outgoing(ctx)
            }
            Channel::UnreliableOrdered(channel) => channel.dispatch_outgoing(ctx),
            Channel::UnreliableUnordered(channel) => channel.dispatch_outgoing(ctx),
        }
    }

    /// Pops the next fully assembled incoming message.
    #[inline]
    pub fn next_message(&mut self) -> Option<Message> {
        match self {
            Channel::ReliableOrdered(channel) | Channel::ReliableUnordered(channel) => {
                channel.next_message()
            }
            Channel::UnreliableOrdered(channel) => channel.next_message(),
            Channel::UnreliableUnordered(channel) => channel.next_message(),
        }
    }

    /// Parks a transmitted reliable block in the channel's sent list.
    pub fn park_transmitted(&mut self, block: BlockRef, now: u64, rto: u64, resend_limit: u64) {
        match self {
            Channel::ReliableOrdered(channel) | Channel::ReliableUnordered(channel) => {
                channel.park_transmitted(block, now, rto, resend_limit)
            }
            _ => {}
        }
    }

    /// True while any transmitted block still awaits an acknowledgement.
    #[inline]
    pub fn has_unacked(&self) -> bool {
        match self {
            Channel::ReliableOrdered(channel) | Channel::ReliableUnordered(channel) => {
                channel.has_unacked()
            }
            _ => false,
        }
    }

    /// True while the channel still holds traffic that has not hit the wire.
    #[inline]
    pub fn has_backlog(&self) -> bool {
        match self {
            Channel::ReliableOrdered(channel) | Channel::ReliableUnordered(channel) => {
                channel.has_backlog()
            }
            Channel::UnreliableOrdered(channel) => channel.has_backlog(),
            Channel::UnreliableUnordered(channel) => channel.has_backlog(),
        }
    }

    /// Earliest pending retransmission deadline, if any.
    #[inline]
    pub fn next_deadline(&self) -> Option<u64> {
        match self {
            Channel::ReliableOrdered(channel) | Channel::ReliableUnordered(channel) => {
                channel.next_deadline()
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_robin_layout() {
        assert_eq!(ChannelKind::round_robin(0), ChannelKind::ReliableOrdered);
        assert_eq!(ChannelKind::round_robin(1), ChannelKind::ReliableUnordered);
        assert_eq!(ChannelKind::round_robin(2), ChannelKind::UnreliableOrdered);
        assert_eq!(ChannelKind::round_robin(3), ChannelKind::UnreliableUnordered);
        assert_eq!(ChannelKind::round_robin(4), ChannelKind::ReliableOrdered);
    }

    #[test]
    fn test_kind_byte_roundtrip() {
        for value in 0..4u8 {
            assert_eq!(ChannelKind::from_u8(value).unwrap() as u8, value);
        }
        assert_eq!(ChannelKind::from_u8(4), None);
    }

    #[test]
    fn test_budgets_account_for_headers() {
        let reliable = Channel::new(ChannelKind::ReliableOrdered, 0, 64, 1 << 24);
        let unordered = Channel::new(ChannelKind::UnreliableUnordered, 0, 64, 1 << 24);

        // channel header + 16 bit sequence
        assert_eq!(reliable.max_unfragmented_size(100), 100 - 4 - 2);
        // no sequence on unordered short messages
        assert_eq!(unordered.max_unfragmented_size(100), 100 - 4);

        assert_eq!(reliable.fragment_size(100), 100 - 4 - 2 - 10);
        assert_eq!(unordered.fragment_size(100), 100 - 4 - 10);
    }
}
