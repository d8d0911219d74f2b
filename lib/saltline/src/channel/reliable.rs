use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use hashbrown::HashMap;
use std::collections::VecDeque;
use std::io::Cursor;

use brine::seq::seq_diff;

use super::{OutgoingContext, CMD_ACK, CMD_ACK_BITMAP, CMD_LONG_MESSAGE, CMD_SHORT_MESSAGE};
use crate::block::{encode_channel_block, BlockRef, OutgoingBlock, ReliableBlock, CHANNEL_BLOCK_HEADER_SIZE};
use crate::message::Message;
use crate::shared::{ErrorType, NetworkError, NetworkResult};

/// A block queued for transmission that has not been assigned a window slot yet.
struct PendingBlock {
    command: u8,
    /// Command payload without the leading sequence number.
    payload: Vec<u8>,
}

enum IncomingBlock {
    Short(Vec<u8>),
    Long {
        message: u16,
        offset: u32,
        total: u32,
        data: Vec<u8>,
    },
}

struct Assembler {
    message: u16,
    total: u32,
    received: u32,
    data: Vec<u8>,
}

impl Assembler {
    fn new(message: u16, total: u32) -> Assembler {
        Assembler {
            message,
            total,
            received: 0,
            data: vec![0; total as usize],
        }
    }

    /// Copies one fragment in; completion hands the buffer out.
    fn absorb(&mut self, offset: u32, data: &[u8]) -> Option<Vec<u8>> {
        let start = offset as usize;
        self.data[start..start + data.len()].copy_from_slice(data);
        self.received += data.len() as u32;

        if self.received >= self.total {
            Some(std::mem::replace(&mut self.data, Vec::new()))
        } else {
            None
        }
    }
}

/// A reliable channel with a power-of-two sliding block window in both directions.
/// The `ordered` flag decides whether delivery waits for the in-order cursor.
pub struct ReliableChannel {
    index: u8,
    ordered: bool,
    window: u32,
    mask: usize,
    max_message_size: usize,

    // Outgoing side
    next_seq: u16,
    ack_cursor: u16,
    outgoing_slots: Vec<Option<BlockRef>>,
    pending: VecDeque<PendingBlock>,
    sent_list: VecDeque<BlockRef>,
    unacked: usize,
    message_counter: u16,

    // Incoming side
    next_expected: u16,
    incoming_seqs: Vec<Option<u16>>,
    incoming_blocks: Vec<Option<IncomingBlock>>,
    ack_queue: Vec<u16>,
    ordered_assembler: Option<Assembler>,
    assemblers: HashMap<u16, Assembler>,

    incoming_messages: VecDeque<Message>,
}

impl ReliableChannel {
    pub fn new(index: u8, window_size: u32, ordered: bool, max_message_size: usize) -> ReliableChannel {
        if !window_size.is_power_of_two() || window_size > 65536 {
            panic!("Reliable window size must be a power of two of at most 65536, got {}", window_size);
        }

        ReliableChannel {
            index,
            ordered,
            window: window_size,
            mask: window_size as usize - 1,
            max_message_size,
            next_seq: 0,
            ack_cursor: 0,
            outgoing_slots: (0..window_size).map(|_| None).collect(),
            pending: VecDeque::new(),
            sent_list: VecDeque::new(),
            unacked: 0,
            message_counter: 0,
            next_expected: 0,
            incoming_seqs: vec![None; window_size as usize],
            incoming_blocks: (0..window_size).map(|_| None).collect(),
            ack_queue: Vec::new(),
            ordered_assembler: None,
            assemblers: HashMap::new(),
            incoming_messages: VecDeque::new(),
        }
    }

    #[inline]
    fn slot(&self, seq: u16) -> usize {
        usize::from(seq) & self.mask
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
            self.pending.push_back(PendingBlock {
                command: CMD_SHORT_MESSAGE,
                payload: bytes.to_vec(),
            });
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

            self.pending.push_back(PendingBlock {
                command: CMD_LONG_MESSAGE,
                payload,
            });

            offset = end;
        }

        Ok(())
    }

    pub fn dispatch_incoming(
        &mut self,
        command: u8,
        payload: &[u8],
        now: u64,
        rtt_samples: &mut Vec<u64>,
    ) -> NetworkResult<()> {
        let mut cursor = Cursor::new(payload);

        match command {
            CMD_ACK => {
                let seq = cursor.read_u16::<LittleEndian>().map_err(|_| malformed())?;
                self.acknowledge(seq, now, rtt_samples);
            }
            CMD_ACK_BITMAP => {
                let base = cursor.read_u16::<LittleEndian>().map_err(|_| malformed())?;
                let bits = &payload[2..];

                for (byte_index, byte) in bits.iter().enumerate() {
                    if *byte == 0 {
                        continue;
                    }
                    for bit in 0..8 {
                        if byte & (1 << bit) != 0 {
                            let seq = base.wrapping_add((byte_index * 8 + bit) as u16);
                            self.acknowledge(seq, now, rtt_samples);
                        }
                    }
                }
            }
            CMD_SHORT_MESSAGE => {
                let seq = cursor.read_u16::<LittleEndian>().map_err(|_| malformed())?;
                let data = payload[2..].to_vec();
                self.receive_block(seq, IncomingBlock::Short(data))?;
            }
            CMD_LONG_MESSAGE => {
                let seq = cursor.read_u16::<LittleEndian>().map_err(|_| malformed())?;
                let message = cursor.read_u16::<LittleEndian>().map_err(|_| malformed())?;
                let offset = cursor.read_u32::<LittleEndian>().map_err(|_| malformed())?;
                let total = cursor.read_u32::<LittleEndian>().map_err(|_| malformed())?;
                let data = payload[12..].to_vec();

                if total == 0
                    || total as usize > self.max_message_size
                    || u64::from(offset) + data.len() as u64 > u64::from(total)
                {
                    return Err(malformed());
                }

                self.receive_block(
                    seq,
                    IncomingBlock::Long {
                        message,
                        offset,
                        total,
                        data,
                    },
                )?;
            }
            _ => return Err(malformed()),
        }

        Ok(())
    }

    /// Window placement of one received block, per the reliable receive contract:
    /// late blocks are re-acknowledged, in-window blocks are stored and acknowledged,
    /// far-future blocks are silently dropped to starve ack feedback loops.
    fn receive_block(&mut self, seq: u16, block: IncomingBlock) -> NetworkResult<()> {
        let dist = u32::from(seq.wrapping_sub(self.next_expected));

        if dist < self.window {
            let slot = self.slot(seq);

            if self.incoming_seqs[slot].is_none() {
                self.incoming_seqs[slot] = Some(seq);

                if self.ordered {
                    self.incoming_blocks[slot] = Some(block);
                } else {
                    self.deliver(block)?;
                }
            }

            self.ack_queue.push(seq);
            self.advance_cursor()?;
        } else if seq_diff(seq, self.next_expected) < 0 {
            // Late duplicate: the sender missed our ack, repeat it
            self.ack_queue.push(seq);
        }

        Ok(())
    }

    fn advance_cursor(&mut self) -> NetworkResult<()> {
        loop {
            let slot = self.slot(self.next_expected);

            match self.incoming_seqs[slot] {
                Some(seq) if seq == self.next_expected => {
                    self.incoming_seqs[slot] = None;

                    if let Some(block) = self.incoming_blocks[slot].take() {
                        self.deliver(block)?;
                    }

                    self.next_expected = self.next_expected.wrapping_add(1);
                }
                _ => return Ok(()),
            }
        }
    }

    fn deliver(&mut self, block: IncomingBlock) -> NetworkResult<()> {
        match block {
            IncomingBlock::Short(data) => {
                self.incoming_messages.push_back(Message::assembled(data, false));
            }
            IncomingBlock::Long {
                message,
                offset,
                total,
                data,
            } => {
                if self.ordered {
                    let restart = match &self.ordered_assembler {
                        Some(assembler) => assembler.message != message || assembler.total != total,
                        None => true,
                    };

                    if restart {
                        self.ordered_assembler = Some(Assembler::new(message, total));
                    }

                    let assembler = self.ordered_assembler.as_mut().unwrap();
                    if let Some(assembled) = assembler.absorb(offset, &data) {
                        self.ordered_assembler = None;
                        self.incoming_messages.push_back(Message::assembled(assembled, false));
                    }
                } else {
                    let assembler = self
                        .assemblers
                        .entry(message)
                        .or_insert_with(|| Assembler::new(message, total));

                    if assembler.total != total {
                        *assembler = Assembler::new(message, total);
                    }

                    if let Some(assembled) = assembler.absorb(offset, &data) {
                        self.assemblers.remove(&message);
                        self.incoming_messages.push_back(Message::assembled(assembled, false));
                    }
                }
            }
        }

        Ok(())
    }

    fn acknowledge(&mut self, seq: u16, now: u64, rtt_samples: &mut Vec<u64>) {
        let slot = self.slot(seq);

        let hit = match &self.outgoing_slots[slot] {
            Some(block) => block.seq == seq && !block.acked.get(),
            None => false,
        };

        if hit {
            let block = self.outgoing_slots[slot].as_ref().unwrap();
            block.acked.set(true);

            if block.sent_time.get() != 0 {
                rtt_samples.push(now.wrapping_sub(block.sent_time.get()));
            }

            self.unacked -= 1;
        }

        // Advance the acknowledgement cursor over every consecutive acked slot
        loop {
            let slot = self.slot(self.ack_cursor);

            let clear = match &self.outgoing_slots[slot] {
                Some(block) => block.seq == self.ack_cursor && block.acked.get(),
                None => false,
            };

            if !clear {
                break;
            }

            self.outgoing_slots[slot] = None;
            self.ack_cursor = self.ack_cursor.wrapping_add(1);
        }
    }

    pub fn dispatch_outgoing(&mut self, ctx: &mut OutgoingContext) {
        self.emit_acks(ctx);
        self.scan_resends(ctx);
        self.fill_window(ctx);
    }

    fn emit_acks(&mut self, ctx: &mut OutgoingContext) {
        if self.ack_queue.is_empty() {
            return;
        }

        let base_ref = self.next_expected.wrapping_sub(self.window as u16);
        let mut seqs = std::mem::replace(&mut self.ack_queue, Vec::new());
        seqs.sort_unstable_by_key(|seq| seq.wrapping_sub(base_ref));
        seqs.dedup();

        if seqs.len() == 1 {
            let mut payload = Vec::with_capacity(2);
            payload.write_u16::<LittleEndian>(seqs[0]).unwrap();
            ctx.queue.push_back(OutgoingBlock::Control(encode_channel_block(
                self.index,
                CMD_ACK,
                &payload,
            )));
            return;
        }

        let bitmap_budget = ctx
            .block_budget
            .saturating_sub(CHANNEL_BLOCK_HEADER_SIZE + 2)
            .max(1);
        let max_bits = bitmap_budget * 8;

        let mut start = 0;
        while start < seqs.len() {
            let base = seqs[start];
            let mut end = start;
            let mut top_bit = 0usize;

            while end < seqs.len() {
                let bit = usize::from(seqs[end].wrapping_sub(base));
                if bit >= max_bits {
                    break;
                }
                top_bit = bit;
                end += 1;
            }

            let mut bitmap = vec![0u8; top_bit / 8 + 1];
            for seq in &seqs[start..end] {
                let bit = usize::from(seq.wrapping_sub(base));
                bitmap[bit / 8] |= 1 << (bit % 8);
            }

            let mut payload = Vec::with_capacity(2 + bitmap.len());
            payload.write_u16::<LittleEndian>(base).unwrap();
            payload.extend_from_slice(&bitmap);

            ctx.queue.push_back(OutgoingBlock::Control(encode_channel_block(
                self.index,
                CMD_ACK_BITMAP,
                &payload,
            )));

            start = end;
        }
    }

    fn scan_resends(&mut self, ctx: &mut OutgoingContext) {
        if self.sent_list.is_empty() {
            return;
        }

        let mut keep = VecDeque::with_capacity(self.sent_list.len());
        let mut resend = Vec::new();

        while let Some(block) = self.sent_list.pop_front() {
            if block.acked.get() {
                continue;
            }

            let elapsed = ctx.now.wrapping_sub(block.sent_time.get());

            if elapsed >= block.resend_timeout.get() {
                *ctx.lost += 1;
                block
                    .resend_timeout
                    .set((block.resend_timeout.get() * 2).min(block.resend_limit.get()));
                block.in_flight.set(false);
                resend.push(block);
            } else {
                keep.push_back(block);
            }
        }

        self.sent_list = keep;

        // Timed out blocks jump the queue
        for block in resend.into_iter().rev() {
            ctx.queue.push_front(OutgoingBlock::Reliable(block));
        }
    }

    fn fill_window(&mut self, ctx: &mut OutgoingContext) {
        while !self.pending.is_empty() {
            let seq = self.next_seq;
            let slot = self.slot(seq);

            if self.outgoing_slots[slot].is_some() {
                // Window full: wait for the cursor to advance
                return;
            }

            let pending = self.pending.pop_front().unwrap();

            let mut payload = Vec::with_capacity(2 + pending.payload.len());
            payload.write_u16::<LittleEndian>(seq).unwrap();
            payload.extend_from_slice(&pending.payload);

            let wire = encode_channel_block(self.index, pending.command, &payload);
            let block = ReliableBlock::new(self.index, seq, wire);

            self.outgoing_slots[slot] = Some(block.clone());
            self.unacked += 1;
            self.next_seq = self.next_seq.wrapping_add(1);

            ctx.queue.push_back(OutgoingBlock::Reliable(block));
        }
    }

    pub fn park_transmitted(&mut self, block: BlockRef, now: u64, rto: u64, resend_limit: u64) {
        if block.acked.get() || block.in_flight.get() {
            return;
        }

        block.sent_time.set(now.max(1));
        if block.resend_timeout.get() == 0 {
            block.resend_timeout.set(rto);
            block.resend_limit.set(resend_limit);
        }
        block.in_flight.set(true);

        self.sent_list.push_back(block);
    }

    #[inline]
    pub fn next_message(&mut self) -> Option<Message> {
        self.incoming_messages.pop_front()
    }

    #[inline]
    pub fn has_unacked(&self) -> bool {
        self.unacked > 0
    }

    #[inline]
    pub fn has_backlog(&self) -> bool {
        !self.pending.is_empty() || !self.ack_queue.is_empty()
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.sent_list
            .iter()
            .filter(|block| !block.acked.get())
            .map(|block| block.sent_time.get().wrapping_add(block.resend_timeout.get()))
            .min()
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

    const BUDGET: usize = 1000;

    fn channel(ordered: bool) -> ReliableChannel {
        ReliableChannel::new(0, 64, ordered, 1 << 24)
    }

    fn ctx<'a>(now: u64, lost: &'a mut u64, queue: &'a mut VecDeque<OutgoingBlock>) -> OutgoingContext<'a> {
        OutgoingContext {
            now,
            rto: 100,
            resend_limit: 800,
            block_budget: BUDGET,
            lost,
            queue,
        }
    }

    /// Drains the sender's queue, returning (command, payload) pairs and parking
    /// reliable blocks as if they hit the wire at `now`.
    fn transmit(channel: &mut ReliableChannel, now: u64) -> Vec<(u8, Vec<u8>)> {
        let mut lost = 0;
        let mut queue = VecDeque::new();
        channel.dispatch_outgoing(&mut ctx(now, &mut lost, &mut queue));

        let mut out = Vec::new();
        for outgoing in queue {
            let wire = outgoing.wire().to_vec();

            let mut reader = BlockReader::new(&wire);
            match reader.next_block().unwrap().unwrap() {
                ParsedBlock::Channel { command, payload, .. } => {
                    out.push((command, payload.to_vec()))
                }
                other => panic!("unexpected block {:?}", other),
            }

            if let OutgoingBlock::Reliable(block) = outgoing {
                channel.park_transmitted(block, now, 100, 800);
            }
        }
        out
    }

    fn pump(sender: &mut ReliableChannel, receiver: &mut ReliableChannel, now: u64) {
        let mut rtt = Vec::new();
        for (command, payload) in transmit(sender, now) {
            receiver.dispatch_incoming(command, &payload, now, &mut rtt).unwrap();
        }
        for (command, payload) in transmit(receiver, now) {
            sender.dispatch_incoming(command, &payload, now, &mut rtt).unwrap();
        }
    }

    #[test]
    fn test_in_order_delivery() {
        let mut sender = channel(true);
        let mut receiver = channel(true);

        for index in 0..10u8 {
            sender.send_message(&Message::new(vec![index]), BUDGET, BUDGET, 1 << 24).unwrap();
        }

        pump(&mut sender, &mut receiver, 1);

        for index in 0..10u8 {
            assert_eq!(receiver.next_message().unwrap().as_slice(), &[index]);
        }
        assert!(receiver.next_message().is_none());
        assert!(!sender.has_unacked());
    }

    #[test]
    fn test_out_of_order_arrival_delivers_in_order() {
        let mut sender = channel(true);
        let mut receiver = channel(true);

        for index in 0..4u8 {
            sender.send_message(&Message::new(vec![index]), BUDGET, BUDGET, 1 << 24).unwrap();
        }

        let mut blocks = transmit(&mut sender, 1);
        blocks.reverse();

        let mut rtt = Vec::new();
        for (command, payload) in blocks {
            receiver.dispatch_incoming(command, &payload, 1, &mut rtt).unwrap();
        }

        for index in 0..4u8 {
            assert_eq!(receiver.next_message().unwrap().as_slice(), &[index]);
        }
    }

    #[test]
    fn test_unordered_delivers_immediately() {
        let mut sender = channel(false);
        let mut receiver = channel(false);

        for index in 0..4u8 {
            sender.send_message(&Message::new(vec![index]), BUDGET, BUDGET, 1 << 24).unwrap();
        }

        let mut blocks = transmit(&mut sender, 1);
        blocks.reverse();

        let mut rtt = Vec::new();
        for (command, payload) in blocks {
            receiver.dispatch_incoming(command, &payload, 1, &mut rtt).unwrap();
        }

        // Messages surface in arrival order, not send order
        let mut received: Vec<u8> = Vec::new();
        while let Some(message) = receiver.next_message() {
            received.push(message.as_slice()[0]);
        }
        assert_eq!(received, vec![3, 2, 1, 0]);
    }

    #[test]
    fn test_duplicate_blocks_deliver_once() {
        let mut sender = channel(true);
        let mut receiver = channel(true);

        sender.send_message(&Message::new(vec![42]), BUDGET, BUDGET, 1 << 24).unwrap();

        let blocks = transmit(&mut sender, 1);
        let mut rtt = Vec::new();

        for _ in 0..3 {
            for (command, payload) in blocks.iter() {
                receiver.dispatch_incoming(*command, payload, 1, &mut rtt).unwrap();
            }
        }

        assert_eq!(receiver.next_message().unwrap().as_slice(), &[42]);
        assert!(receiver.next_message().is_none());
    }

    #[test]
    fn test_far_future_block_dropped_without_ack() {
        let mut receiver = channel(true);

        // Sequence number far past the window
        let mut payload = Vec::new();
        payload.write_u16::<LittleEndian>(5000).unwrap();
        payload.push(1);

        let mut rtt = Vec::new();
        receiver.dispatch_incoming(CMD_SHORT_MESSAGE, &payload, 1, &mut rtt).unwrap();

        assert!(receiver.next_message().is_none());
        assert!(receiver.ack_queue.is_empty());
    }

    #[test]
    fn test_late_duplicate_still_acked() {
        let mut sender = channel(true);
        let mut receiver = channel(true);

        sender.send_message(&Message::new(vec![1]), BUDGET, BUDGET, 1 << 24).unwrap();
        let blocks = transmit(&mut sender, 1);

        let mut rtt = Vec::new();
        for (command, payload) in blocks.iter() {
            receiver.dispatch_incoming(*command, payload, 1, &mut rtt).unwrap();
        }
        let _ = transmit(&mut receiver, 1);

        // The same block shows up again long after the cursor moved past it
        for (command, payload) in blocks.iter() {
            receiver.dispatch_incoming(*command, payload, 2, &mut rtt).unwrap();
        }

        assert!(!receiver.ack_queue.is_empty());
        assert!(receiver.next_message().is_none());
    }

    #[test]
    fn test_ack_batching_uses_bitmap() {
        let mut sender = channel(false);
        let mut receiver = channel(false);

        for index in 0..8u8 {
            sender.send_message(&Message::new(vec![index]), BUDGET, BUDGET, 1 << 24).unwrap();
        }

        let mut rtt = Vec::new();
        for (command, payload) in transmit(&mut sender, 1) {
            receiver.dispatch_incoming(command, &payload, 1, &mut rtt).unwrap();
        }

        let acks = transmit(&mut receiver, 1);
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].0, CMD_ACK_BITMAP);

        for (command, payload) in acks {
            sender.dispatch_incoming(command, &payload, 2, &mut rtt).unwrap();
        }
        assert!(!sender.has_unacked());
        assert_eq!(rtt.len(), 8);
    }

    #[test]
    fn test_single_ack_uses_plain_ack() {
        let mut sender = channel(true);
        let mut receiver = channel(true);

        sender.send_message(&Message::new(vec![7]), BUDGET, BUDGET, 1 << 24).unwrap();

        let mut rtt = Vec::new();
        for (command, payload) in transmit(&mut sender, 1) {
            receiver.dispatch_incoming(command, &payload, 1, &mut rtt).unwrap();
        }

        let acks = transmit(&mut receiver, 1);
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].0, CMD_ACK);
    }

    #[test]
    fn test_timeout_requeues_and_doubles() {
        let mut sender = channel(true);

        sender.send_message(&Message::new(vec![7]), BUDGET, BUDGET, 1 << 24).unwrap();
        let _ = transmit(&mut sender, 1);

        assert_eq!(sender.sent_list.len(), 1);
        let first_timeout = sender.sent_list[0].resend_timeout.get();

        // Not yet expired
        let mut lost = 0;
        let mut queue = VecDeque::new();
        sender.dispatch_outgoing(&mut ctx(50, &mut lost, &mut queue));
        assert!(queue.is_empty());
        assert_eq!(lost, 0);

        // Expired: the block re-queues at the front with a doubled timeout
        sender.dispatch_outgoing(&mut ctx(1 + first_timeout, &mut lost, &mut queue));
        assert_eq!(queue.len(), 1);
        assert_eq!(lost, 1);
        assert!(sender.sent_list.is_empty());

        match &queue[0] {
            OutgoingBlock::Reliable(block) => {
                assert_eq!(block.resend_timeout.get(), first_timeout * 2)
            }
            _ => panic!("expected reliable block"),
        }
    }

    #[test]
    fn test_window_backpressure() {
        let mut sender = ReliableChannel::new(0, 4, true, 1 << 24);

        for index in 0..6u8 {
            sender.send_message(&Message::new(vec![index]), BUDGET, BUDGET, 1 << 24).unwrap();
        }

        let blocks = transmit(&mut sender, 1);
        assert_eq!(blocks.len(), 4);
        assert_eq!(sender.pending.len(), 2);

        // Acking the window head frees slots for the rest
        let mut rtt = Vec::new();
        let mut payload = Vec::new();
        payload.write_u16::<LittleEndian>(0).unwrap();
        sender.dispatch_incoming(CMD_ACK, &payload, 2, &mut rtt).unwrap();

        let blocks = transmit(&mut sender, 2);
        assert_eq!(blocks.len(), 1);
    }

    #[test]
    fn test_fragmented_message_roundtrip() {
        let mut sender = channel(true);
        let mut receiver = channel(true);

        let payload: Vec<u8> = (0..100_000u32).map(|value| value as u8).collect();
        sender.send_message(&Message::new(payload.clone()), 1000, 1000, 1 << 24).unwrap();

        for round in 0..200 {
            pump(&mut sender, &mut receiver, round + 1);
            if !sender.has_unacked() && !sender.has_backlog() {
                break;
            }
        }

        let message = receiver.next_message().expect("message did not assemble");
        assert_eq!(message.as_slice(), &payload[..]);
        assert!(receiver.next_message().is_none());
    }

    #[test]
    fn test_unordered_fragments_assemble_per_message() {
        let mut sender = channel(false);
        let mut receiver = channel(false);

        let first: Vec<u8> = vec![1; 2500];
        let second: Vec<u8> = vec![2; 2500];

        sender.send_message(&Message::new(first.clone()), 1000, 1000, 1 << 24).unwrap();
        sender.send_message(&Message::new(second.clone()), 1000, 1000, 1 << 24).unwrap();

        for round in 0..50 {
            pump(&mut sender, &mut receiver, round + 1);
        }

        let mut received = Vec::new();
        while let Some(message) = receiver.next_message() {
            received.push(message.as_slice().to_vec());
        }

        assert_eq!(received.len(), 2);
        assert!(received.contains(&first));
        assert!(received.contains(&second));
    }

    #[test]
    fn test_oversized_message_rejected() {
        let mut sender = channel(true);
        let result = sender.send_message(&Message::new(vec![0; 100]), BUDGET, BUDGET, 50);
        assert_eq!(result.unwrap_err(), NetworkError::Fatal(ErrorType::MessageTooLarge));
    }

    #[test]
    fn test_malformed_long_header_rejected() {
        let mut receiver = channel(true);

        let mut payload = Vec::new();
        payload.write_u16::<LittleEndian>(0).unwrap(); // seq
        payload.write_u16::<LittleEndian>(0).unwrap(); // message
        payload.write_u32::<LittleEndian>(100).unwrap(); // offset past total
        payload.write_u32::<LittleEndian>(10).unwrap(); // total
        payload.extend_from_slice(&[0; 4]);

        let mut rtt = Vec::new();
        assert!(receiver
            .dispatch_incoming(CMD_LONG_MESSAGE, &payload, 1, &mut rtt)
            .is_err());
    }
}
