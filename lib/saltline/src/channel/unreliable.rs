use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use hashbrown::HashMap;
use std::collections::VecDeque;
use std::io::Cursor;

use brine::seq::seq_diff;

use super::{OutgoingContext, CMD_LONG_MESSAGE, CMD_SHORT_MESSAGE};
use crate::block::{encode_channel_block, OutgoingBlock};
use crate::message::Message;
use crate::shared::{ErrorType, NetworkError, NetworkResult};

/// Upper bound on concurrently assembling long messages per unordered channel.
const MAX_ASSEMBLERS: usize = 64;

/// Unreliable ordered: every block carries a sequence stamp, the receiver never
/// delivers anything older than the last delivery and flags gaps on the next
/// delivered message.
pub struct UnreliableOrderedChannel {
    index: u8,
    max_message_size: usize,

    next_seq: u16,
    message_counter: u16,
    outgoing_wire: VecDeque<Vec<u8>>,

    expected: u16,
    lost_since_delivery: bool,
    assembler: Option<StreamAssembler>,

    incoming_messages: VecDeque<Message>,
}

struct StreamAssembler {
    message: u16,
    total: u32,
    received: u32,
    data: Vec<u8>,
}

impl UnreliableOrderedChannel {
    pub fn new(index: u8, max_message_size: usize) -> UnreliableOrderedChannel {
        UnreliableOrderedChannel {
            index,
            max_message_size,
            next_seq: 0,
            message_counter: 0,
            outgoing_wire: VecDeque::new(),
            expected: 0,
            lost_since_delivery: false,
            assembler: None,
            incoming_messages: VecDeque::new(),
        }
    }

    pub fn send_message(
        &mut self,
        message: &Message,
        short_budget: usize,
        fragment_budget: usize,
        max_message_size: usize,
    ) -> NetworkResult<()> {
        if message.len() > max_message_size {
            return Err(NetworkError::Fatal(ErrorType::MessageTooLarge));
        }

        let bytes = message.as_slice();

        if bytes.len() <= short_budget {
            let seq = self.next_seq;
            self.next_seq = self.next_seq.wrapping_add(1);

            let mut payload = Vec::with_capacity(2 + bytes.len());
            payload.write_u16::<LittleEndian>(seq).unwrap();
            payload.extend_from_slice(bytes);

            self.outgoing_wire
                .push_back(encode_channel_block(self.index, CMD_SHORT_MESSAGE, &payload));
            return Ok(());
        }

        if fragment_budget == 0 {
            return Err(NetworkError::Fatal(ErrorType::MessageTooLarge));
        }

        let message_number = self.message_counter;
        self.message_counter = self.message_counter.wrapping_add(1);

        let total = bytes.len() as u32;
        let mut offset = 0usize;

        while offset < bytes.len() {
            let end = (offset + fragment_budget).min(bytes.len());
            let seq = self.next_seq;
            self.next_seq = self.next_seq.wrapping_add(1);

            let mut payload = Vec::with_capacity(12 + end - offset);
            payload.write_u16::<LittleEndian>(seq).unwrap();
            payload.write_u16::<LittleEndian>(message_number).unwrap();
            payload.write_u32::<LittleEndian>(offset as u32).unwrap();
            payload.write_u32::<LittleEndian>(total).unwrap();
            payload.extend_from_slice(&bytes[offset..end]);

            self.outgoing_wire
                .push_back(encode_channel_block(self.index, CMD_LONG_MESSAGE, &payload));

            offset = end;
        }

        Ok(())
    }

    pub fn dispatch_incoming(&mut self, command: u8, payload: &[u8]) -> NetworkResult<()> {
        let mut cursor = Cursor::new(payload);

        match command {
            CMD_SHORT_MESSAGE => {
                let seq = cursor.read_u16::<LittleEndian>().map_err(|_| malformed())?;
                let diff = seq_diff(seq, self.expected);

                if diff < 0 {
                    self.lost_since_delivery = true;
                    return Ok(());
                }

                if diff > 0 {
                    self.lost_since_delivery = true;
                }

                if self.assembler.take().is_some() {
                    // A short message interrupting a fragment stream means fragments died
                    self.lost_since_delivery = true;
                }

                self.expected = seq.wrapping_add(1);

                let previous_lost = std::mem::replace(&mut self.lost_since_delivery, false);
                self.incoming_messages
                    .push_back(Message::assembled(payload[2..].to_vec(), previous_lost));
            }
            CMD_LONG_MESSAGE => {
                let seq = cursor.read_u16::<LittleEndian>().map_err(|_| malformed())?;
                let message = cursor.read_u16::<LittleEndian>().map_err(|_| malformed())?;
                let offset = cursor.read_u32::<LittleEndian>().map_err(|_| malformed())?;
                let total = cursor.read_u32::<LittleEndian>().map_err(|_| malformed())?;
                let data = &payload[12..];

                if total == 0
                    || total as usize > self.max_message_size
                    || u64::from(offset) + data.len() as u64 > u64::from(total)
                {
                    return Err(malformed());
                }

                let diff = seq_diff(seq, self.expected);

                if diff < 0 {
                    self.lost_since_delivery = true;
                    return Ok(());
                }

                if diff > 0 {
                    self.lost_since_delivery = true;
                    self.assembler = None;
                }

                self.expected = seq.wrapping_add(1);

                if offset == 0 {
                    self.assembler = Some(StreamAssembler {
                        message,
                        total,
                        received: 0,
                        data: vec![0; total as usize],
                    });
                }

                let complete = match &mut self.assembler {
                    Some(assembler)
                        if assembler.message == message
                            && assembler.total == total
                            && assembler.received == offset =>
                    {
                        let start = offset as usize;
                        assembler.data[start..start + data.len()].copy_from_slice(data);
                        assembler.received += data.len() as u32;
                        assembler.received >= assembler.total
                    }
                    _ => {
                        // Mid-message fragment with no usable assembler
                        self.assembler = None;
                        self.lost_since_delivery = true;
                        false
                    }
                };

                if complete {
                    let assembler = self.assembler.take().unwrap();
                    let previous_lost = std::mem::replace(&mut self.lost_since_delivery, false);
                    self.incoming_messages
                        .push_back(Message::assembled(assembler.data, previous_lost));
                }
            }
            _ => return Err(malformed()),
        }

        Ok(())
    }

    pub fn dispatch_outgoing(&mut self, ctx: &mut OutgoingContext) {
        while let Some(wire) = self.outgoing_wire.pop_front() {
            ctx.queue.push_back(OutgoingBlock::Unreliable(wire));
        }
    }

    #[inline]
    pub fn next_message(&mut self) -> Option<Message> {
        self.incoming_messages.pop_front()
    }

    #[inline]
    pub fn has_backlog(&self) -> bool {
        !self.outgoing_wire.is_empty()
    }
}

/// Unreliable unordered: short messages carry no sequence stamp at all; long
/// messages reassemble by message number from whatever fragments arrive.
pub struct UnreliableUnorderedChannel {
    index: u8,
    max_message_size: usize,

    message_counter: u16,
    outgoing_wire: VecDeque<Vec<u8>>,

    assemblers: HashMap<u16, RangeAssembler>,
    assembler_order: VecDeque<u16>,

    incoming_messages: VecDeque<Message>,
}

struct RangeAssembler {
    total: u32,
    covered: u32,
    data: Vec<u8>,
    ranges: Vec<(u32, u32)>,
}

enum Absorb {
    Partial,
    Complete(Vec<u8>),
    Conflict,
}

impl RangeAssembler {
    fn new(total: u32) -> RangeAssembler {
        RangeAssembler {
            total,
            covered: 0,
            data: vec![0; total as usize],
            ranges: Vec::new(),
        }
    }

    fn absorb(&mut self, offset: u32, data: &[u8]) -> Absorb {
        let len = data.len() as u32;

        for (start, range_len) in self.ranges.iter() {
            if offset < start + range_len && *start < offset + len {
                return Absorb::Conflict;
            }
        }

        let start = offset as usize;
        self.data[start..start + data.len()].copy_from_slice(data);
        self.ranges.push((offset, len));
        self.covered += len;

        if self.covered >= self.total {
            Absorb::Complete(std::mem::replace(&mut self.data, Vec::new()))
        } else {
            Absorb::Partial
        }
    }
}

impl UnreliableUnorderedChannel {
    pub fn new(index: u8, max_message_size: usize) -> UnreliableUnorderedChannel {
        UnreliableUnorderedChannel {
            index,
            max_message_size,
            message_counter: 0,
            outgoing_wire: VecDeque::new(),
            assemblers: HashMap::new(),
            assembler_order: VecDeque::new(),
            incoming_messages: VecDeque::new(),
        }
    }

    pub fn send_message(
        &mut self,
        message: &Message,
        short_budget: usize,
        fragment_budget: usize,
        max_message_size: usize,
    ) -> NetworkResult<()> {
        if message.len() > max_message_size {
            return Err(NetworkError::Fatal(ErrorType::MessageTooLarge));
        }

        let bytes = message.as_slice();

        if bytes.len() <= short_budget {
            self.outgoing_wire
                .push_back(encode_channel_block(self.index, CMD_SHORT_MESSAGE, bytes));
            return Ok(());
        }

        if fragment_budget == 0 {
            return Err(NetworkError::Fatal(ErrorType::MessageTooLarge));
        }

        let message_number = self.message_counter;
        self.message_counter = self.message_counter.wrapping_add(1);

        let total = bytes.len() as u32;
        let mut offset = 0usize;

        while offset < bytes.len() {
            let end = (offset + fragment_budget).min(bytes.len());

            let mut payload = Vec::with_capacity(10 + end - offset);
            payload.write_u16::<LittleEndian>(message_number).unwrap();
            payload.write_u32::<LittleEndian>(offset as u32).unwrap();
            payload.write_u32::<LittleEndian>(total).unwrap();
            payload.extend_from_slice(&bytes[offset..end]);

            self.outgoing_wire
                .push_back(encode_channel_block(self.index, CMD_LONG_MESSAGE, &payload));

            offset = end;
        }

        Ok(())
    }

    pub fn dispatch_incoming(&mut self, command: u8, payload: &[u8]) -> NetworkResult<()> {
        match command {
            CMD_SHORT_MESSAGE => {
                self.incoming_messages
                    .push_back(Message::assembled(payload.to_vec(), false));
            }
            CMD_LONG_MESSAGE => {
                let mut cursor = Cursor::new(payload);
                let message = cursor.read_u16::<LittleEndian>().map_err(|_| malformed())?;
                let offset = cursor.read_u32::<LittleEndian>().map_err(|_| malformed())?;
                let total = cursor.read_u32::<LittleEndian>().map_err(|_| malformed())?;
                let data = &payload[10..];

                if total == 0
                    || total as usize > self.max_message_size
                    || u64::from(offset) + data.len() as u64 > u64::from(total)
                {
                    return Err(malformed());
                }

                if !self.assemblers.contains_key(&message) {
                    self.evict_for(message);
                    self.assemblers.insert(message, RangeAssembler::new(total));
                    self.assembler_order.push_back(message);
                }

                let assembler = self.assemblers.get_mut(&message).unwrap();

                if assembler.total != total {
                    // Message number reuse with a different size: start over
                    *assembler = RangeAssembler::new(total);
                }

                match assembler.absorb(offset, data) {
                    Absorb::Complete(data) => {
                        self.remove_assembler(message);
                        self.incoming_messages
                            .push_back(Message::assembled(data, false));
                    }
                    Absorb::Conflict => {
                        // Overlapping fragment: reset and absorb this one fresh
                        let mut fresh = RangeAssembler::new(total);
                        if let Absorb::Complete(data) = fresh.absorb(offset, data) {
                            self.remove_assembler(message);
                            self.incoming_messages
                                .push_back(Message::assembled(data, false));
                        } else {
                            *self.assemblers.get_mut(&message).unwrap() = fresh;
                        }
                    }
                    Absorb::Partial => {}
                }
            }
            _ => return Err(malformed()),
        }

        Ok(())
    }

    fn evict_for(&mut self, _incoming: u16) {
        if self.assemblers.len() < MAX_ASSEMBLERS {
            return;
        }

        if let Some(oldest) = self.assembler_order.pop_front() {
            self.assemblers.remove(&oldest);
        }
    }

    fn remove_assembler(&mut self, message: u16) {
        self.assemblers.remove(&message);
        self.assembler_order.retain(|entry| *entry != message);
    }

    pub fn dispatch_outgoing(&mut self, ctx: &mut OutgoingContext) {
        while let Some(wire) = self.outgoing_wire.pop_front() {
            ctx.queue.push_back(OutgoingBlock::Unreliable(wire));
        }
    }

    #[inline]
    pub fn next_message(&mut self) -> Option<Message> {
        self.incoming_messages.pop_front()
    }

    #[inline]
    pub fn has_backlog(&self) -> bool {
        !self.outgoing_wire.is_empty()
    }
}

#[inline]
fn malformed() -> NetworkError {
    NetworkError::Fatal(ErrorType::Malformed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BlockReader, ParsedBlock};
    use std::collections::VecDeque;

    fn drain_ordered(channel: &mut UnreliableOrderedChannel) -> Vec<(u8, Vec<u8>)> {
        let mut lost = 0;
        let mut queue = VecDeque::new();
        let mut ctx = OutgoingContext {
            now: 1,
            rto: 100,
            resend_limit: 800,
            block_budget: 1000,
            lost: &mut lost,
            queue: &mut queue,
        };
        channel.dispatch_outgoing(&mut ctx);

        queue
            .iter()
            .map(|outgoing| {
                let mut reader = BlockReader::new(outgoing.wire());
                match reader.next_block().unwrap().unwrap() {
                    ParsedBlock::Channel { command, payload, .. } => (command, payload.to_vec()),
                    other => panic!("unexpected block {:?}", other),
                }
            })
            .collect()
    }

    fn drain_unordered(channel: &mut UnreliableUnorderedChannel) -> Vec<(u8, Vec<u8>)> {
        let mut lost = 0;
        let mut queue = VecDeque::new();
        let mut ctx = OutgoingContext {
            now: 1,
            rto: 100,
            resend_limit: 800,
            block_budget: 1000,
            lost: &mut lost,
            queue: &mut queue,
        };
        channel.dispatch_outgoing(&mut ctx);

        queue
            .iter()
            .map(|outgoing| {
                let mut reader = BlockReader::new(outgoing.wire());
                match reader.next_block().unwrap().unwrap() {
                    ParsedBlock::Channel { command, payload, .. } => (command, payload.to_vec()),
                    other => panic!("unexpected block {:?}", other),
                }
            })
            .collect()
    }

    #[test]
    fn test_ordered_drops_stale() {
        let mut sender = UnreliableOrderedChannel::new(0, 1 << 24);
        let mut receiver = UnreliableOrderedChannel::new(0, 1 << 24);

        for index in 0..3u8 {
            sender.send_message(&Message::new(vec![index]), 1000, 1000, 1 << 24).unwrap();
        }

        let blocks = drain_ordered(&mut sender);

        // Deliver 0, then 2, then the stale 1
        receiver.dispatch_incoming(blocks[0].0, &blocks[0].1).unwrap();
        receiver.dispatch_incoming(blocks[2].0, &blocks[2].1).unwrap();
        receiver.dispatch_incoming(blocks[1].0, &blocks[1].1).unwrap();

        let first = receiver.next_message().unwrap();
        assert_eq!(first.as_slice(), &[0]);
        assert!(!first.previous_lost());

        let second = receiver.next_message().unwrap();
        assert_eq!(second.as_slice(), &[2]);
        assert!(second.previous_lost());

        assert!(receiver.next_message().is_none());
    }

    #[test]
    fn test_ordered_fragments_reassemble() {
        let mut sender = UnreliableOrderedChannel::new(0, 1 << 24);
        let mut receiver = UnreliableOrderedChannel::new(0, 1 << 24);

        let payload: Vec<u8> = (0..2500u32).map(|value| value as u8).collect();
        sender.send_message(&Message::new(payload.clone()), 1000, 1000, 1 << 24).unwrap();

        for (command, block) in drain_ordered(&mut sender) {
            receiver.dispatch_incoming(command, &block).unwrap();
        }

        let message = receiver.next_message().unwrap();
        assert_eq!(message.as_slice(), &payload[..]);
        assert!(!message.previous_lost());
    }

    #[test]
    fn test_ordered_lost_fragment_kills_message() {
        let mut sender = UnreliableOrderedChannel::new(0, 1 << 24);
        let mut receiver = UnreliableOrderedChannel::new(0, 1 << 24);

        sender.send_message(&Message::new(vec![1; 2500]), 1000, 1000, 1 << 24).unwrap();
        sender.send_message(&Message::new(vec![9]), 1000, 1000, 1 << 24).unwrap();

        let blocks = drain_ordered(&mut sender);
        assert_eq!(blocks.len(), 4);

        // Middle fragment lost
        receiver.dispatch_incoming(blocks[0].0, &blocks[0].1).unwrap();
        receiver.dispatch_incoming(blocks[2].0, &blocks[2].1).unwrap();
        receiver.dispatch_incoming(blocks[3].0, &blocks[3].1).unwrap();

        let message = receiver.next_message().unwrap();
        assert_eq!(message.as_slice(), &[9]);
        assert!(message.previous_lost());
        assert!(receiver.next_message().is_none());
    }

    #[test]
    fn test_unordered_short_has_no_stamp() {
        let mut sender = UnreliableUnorderedChannel::new(0, 1 << 24);
        sender.send_message(&Message::new(vec![5, 6]), 1000, 1000, 1 << 24).unwrap();

        let blocks = drain_unordered(&mut sender);
        assert_eq!(blocks[0].0, CMD_SHORT_MESSAGE);
        // Payload is exactly the message bytes
        assert_eq!(blocks[0].1, vec![5, 6]);
    }

    #[test]
    fn test_unordered_fragments_any_order() {
        let mut sender = UnreliableUnorderedChannel::new(0, 1 << 24);
        let mut receiver = UnreliableUnorderedChannel::new(0, 1 << 24);

        let payload: Vec<u8> = (0..2500u32).map(|value| (value * 7) as u8).collect();
        sender.send_message(&Message::new(payload.clone()), 1000, 1000, 1 << 24).unwrap();

        let mut blocks = drain_unordered(&mut sender);
        blocks.reverse();

        for (command, block) in blocks {
            receiver.dispatch_incoming(command, &block).unwrap();
        }

        let message = receiver.next_message().unwrap();
        assert_eq!(message.as_slice(), &payload[..]);
    }

    #[test]
    fn test_unordered_duplicate_fragment_resets() {
        let mut sender = UnreliableUnorderedChannel::new(0, 1 << 24);
        let mut receiver = UnreliableUnorderedChannel::new(0, 1 << 24);

        sender.send_message(&Message::new(vec![3; 2500]), 1000, 1000, 1 << 24).unwrap();
        let blocks = drain_unordered(&mut sender);

        // The duplicate first fragment conflicts and resets the assembler, so the
        // message still assembles from the repeat delivery
        receiver.dispatch_incoming(blocks[0].0, &blocks[0].1).unwrap();
        receiver.dispatch_incoming(blocks[0].0, &blocks[0].1).unwrap();
        receiver.dispatch_incoming(blocks[1].0, &blocks[1].1).unwrap();
        receiver.dispatch_incoming(blocks[2].0, &blocks[2].1).unwrap();

        let message = receiver.next_message().unwrap();
        assert_eq!(message.as_slice(), &vec![3u8; 2500][..]);
    }

    #[test]
    fn test_unordered_assembler_eviction() {
        let mut receiver = UnreliableUnorderedChannel::new(0, 1 << 24);

        // Open more assemblers than the cap by sending first fragments only
        for message in 0..(MAX_ASSEMBLERS as u16 + 8) {
            let mut payload = Vec::new();
            payload.write_u16::<LittleEndian>(message).unwrap();
            payload.write_u32::<LittleEndian>(0).unwrap();
            payload.write_u32::<LittleEndian>(100).unwrap();
            payload.extend_from_slice(&[0; 50]);

            receiver.dispatch_incoming(CMD_LONG_MESSAGE, &payload).unwrap();
        }

        assert!(receiver.assemblers.len() <= MAX_ASSEMBLERS);
    }
}
