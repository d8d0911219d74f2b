use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::cell::Cell;
use std::io::Cursor;
use std::rc::Rc;

use crate::shared::{ChannelId, ErrorType, NetworkError, NetworkResult};

/// Low nibble of the leading byte of every block packet.
pub const BLOCK_PING: u8 = 1;
pub const BLOCK_PONG: u8 = 2;
pub const BLOCK_DISCONNECT: u8 = 3;
pub const BLOCK_DISCONNECT_ACK: u8 = 4;
pub const BLOCK_BANDWIDTH_LIMITS: u8 = 5;
pub const BLOCK_BANDWIDTH_LIMITS_ACK: u8 = 6;
pub const BLOCK_MTU_PROBE: u8 = 7;
pub const BLOCK_CHANNEL: u8 = 8;

/// Fixed part of a channel block: type byte, channel number, payload length.
pub const CHANNEL_BLOCK_HEADER_SIZE: usize = 4;

/// Fixed part of an MTU probe block: type byte, sequence, phase, claimed size, pad length.
pub const MTU_PROBE_HEADER_SIZE: usize = 8;

/// A non-channel block packet, parsed or about to be encoded.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ControlBlock {
    Ping { seq: u8 },
    Pong { seq: u8 },
    Disconnect { data: u64 },
    DisconnectAck { data: u64 },
    BandwidthLimits { incoming: u32, outgoing: u32 },
    BandwidthLimitsAck,
    MtuProbe { seq: u16, phase: u8, size: u16 },
}

impl ControlBlock {
    /// Encodes the block; `probe_pad` only applies to MTU probes and sizes the dummy
    /// payload that brings the datagram up to the probed size.
    pub fn write(&self, probe_pad: usize) -> Vec<u8> {
        let mut out = Vec::new();

        match *self {
            ControlBlock::Ping { seq } => {
                out.write_u8(BLOCK_PING).unwrap();
                out.write_u8(seq).unwrap();
            }
            ControlBlock::Pong { seq } => {
                out.write_u8(BLOCK_PONG).unwrap();
                out.write_u8(seq).unwrap();
            }
            ControlBlock::Disconnect { data } => {
                out.write_u8(BLOCK_DISCONNECT).unwrap();
                out.write_u64::<LittleEndian>(data).unwrap();
            }
            ControlBlock::DisconnectAck { data } => {
                out.write_u8(BLOCK_DISCONNECT_ACK).unwrap();
                out.write_u64::<LittleEndian>(data).unwrap();
            }
            ControlBlock::BandwidthLimits { incoming, outgoing } => {
                out.write_u8(BLOCK_BANDWIDTH_LIMITS).unwrap();
                out.write_u32::<LittleEndian>(incoming).unwrap();
                out.write_u32::<LittleEndian>(outgoing).unwrap();
            }
            ControlBlock::BandwidthLimitsAck => {
                out.write_u8(BLOCK_BANDWIDTH_LIMITS_ACK).unwrap();
            }
            ControlBlock::MtuProbe { seq, phase, size } => {
                out.write_u8(BLOCK_MTU_PROBE).unwrap();
                out.write_u16::<LittleEndian>(seq).unwrap();
                out.write_u8(phase).unwrap();
                out.write_u16::<LittleEndian>(size).unwrap();
                out.write_u16::<LittleEndian>(probe_pad as u16).unwrap();
                out.resize(MTU_PROBE_HEADER_SIZE + probe_pad, 0);
            }
        }

        out
    }
}

/// Encodes a channel block around an already built command payload. The command
/// sits in the high nibble of the type byte.
pub fn encode_channel_block(channel: ChannelId, command: u8, payload: &[u8]) -> Vec<u8> {
    debug_assert!(command < 16);
    debug_assert!(payload.len() <= usize::from(u16::max_value()));

    let mut out = Vec::with_capacity(CHANNEL_BLOCK_HEADER_SIZE + payload.len());
    out.write_u8(BLOCK_CHANNEL | (command << 4)).unwrap();
    out.write_u8(channel).unwrap();
    out.write_u16::<LittleEndian>(payload.len() as u16).unwrap();
    out.extend_from_slice(payload);
    out
}

/// One block pulled out of a decrypted frame.
#[derive(Debug, Eq, PartialEq)]
pub enum ParsedBlock<'a> {
    Control(ControlBlock),
    Channel {
        channel: ChannelId,
        command: u8,
        payload: &'a [u8],
    },
}

/// Walks the concatenated block packets inside one decrypted frame payload.
pub struct BlockReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> BlockReader<'a> {
    #[inline]
    pub fn new(buf: &'a [u8]) -> BlockReader<'a> {
        BlockReader { buf, pos: 0 }
    }

    /// Returns the next block, `None` at the end, or a malformed error; a malformed
    /// frame poisons everything after the failure point.
    pub fn next_block(&mut self) -> NetworkResult<Option<ParsedBlock<'a>>> {
        if self.pos >= self.buf.len() {
            return Ok(None);
        }

        let rest = &self.buf[self.pos..];
        let mut cursor = Cursor::new(rest);

        let type_byte = cursor.read_u8().map_err(|_| malformed())?;
        let kind = type_byte & 0x0F;
        let subtype = type_byte >> 4;

        let block = match kind {
            BLOCK_PING => ParsedBlock::Control(ControlBlock::Ping {
                seq: cursor.read_u8().map_err(|_| malformed())?,
            }),
            BLOCK_PONG => ParsedBlock::Control(ControlBlock::Pong {
                seq: cursor.read_u8().map_err(|_| malformed())?,
            }),
            BLOCK_DISCONNECT => ParsedBlock::Control(ControlBlock::Disconnect {
                data: cursor.read_u64::<LittleEndian>().map_err(|_| malformed())?,
            }),
            BLOCK_DISCONNECT_ACK => ParsedBlock::Control(ControlBlock::DisconnectAck {
                data: cursor.read_u64::<LittleEndian>().map_err(|_| malformed())?,
            }),
            BLOCK_BANDWIDTH_LIMITS => {
                let incoming = cursor.read_u32::<LittleEndian>().map_err(|_| malformed())?;
                let outgoing = cursor.read_u32::<LittleEndian>().map_err(|_| malformed())?;
                ParsedBlock::Control(ControlBlock::BandwidthLimits { incoming, outgoing })
            }
            BLOCK_BANDWIDTH_LIMITS_ACK => ParsedBlock::Control(ControlBlock::BandwidthLimitsAck),
            BLOCK_MTU_PROBE => {
                let seq = cursor.read_u16::<LittleEndian>().map_err(|_| malformed())?;
                let phase = cursor.read_u8().map_err(|_| malformed())?;
                let size = cursor.read_u16::<LittleEndian>().map_err(|_| malformed())?;
                let pad = cursor.read_u16::<LittleEndian>().map_err(|_| malformed())?;

                let consumed = cursor.position() as usize;
                if rest.len() < consumed + usize::from(pad) {
                    return Err(malformed());
                }
                cursor.set_position((consumed + usize::from(pad)) as u64);

                ParsedBlock::Control(ControlBlock::MtuProbe { seq, phase, size })
            }
            BLOCK_CHANNEL => {
                let channel = cursor.read_u8().map_err(|_| malformed())?;
                let length = cursor.read_u16::<LittleEndian>().map_err(|_| malformed())?;

                let consumed = cursor.position() as usize;
                if rest.len() < consumed + usize::from(length) {
                    return Err(malformed());
                }

                let payload = &rest[consumed..consumed + usize::from(length)];
                cursor.set_position((consumed + usize::from(length)) as u64);

                ParsedBlock::Channel {
                    channel,
                    command: subtype,
                    payload,
                }
            }
            _ => return Err(malformed()),
        };

        self.pos += cursor.position() as usize;
        Ok(Some(block))
    }
}

#[inline]
fn malformed() -> NetworkError {
    NetworkError::Fatal(ErrorType::Malformed)
}

/// A reliable channel block that stays alive across the outgoing queue, the window
/// slot and the sent list until acknowledged. Single threaded, so plain `Rc`/`Cell`.
pub struct ReliableBlock {
    pub channel: ChannelId,
    pub seq: u16,
    pub wire: Vec<u8>,
    pub acked: Cell<bool>,
    pub in_flight: Cell<bool>,
    pub sent_time: Cell<u64>,
    pub resend_timeout: Cell<u64>,
    pub resend_limit: Cell<u64>,
}

pub type BlockRef = Rc<ReliableBlock>;

impl ReliableBlock {
    pub fn new(channel: ChannelId, seq: u16, wire: Vec<u8>) -> BlockRef {
        Rc::new(ReliableBlock {
            channel,
            seq,
            wire,
            acked: Cell::new(false),
            in_flight: Cell::new(false),
            sent_time: Cell::new(0),
            resend_timeout: Cell::new(0),
            resend_limit: Cell::new(0),
        })
    }
}

/// Entry in a peer's outgoing block queue.
pub enum OutgoingBlock {
    /// Fire and forget control traffic.
    Control(Vec<u8>),
    /// Unreliable channel payloads, lost if the frame is dropped.
    Unreliable(Vec<u8>),
    /// Reliable channel payloads, parked in the channel's sent list after transmit.
    Reliable(BlockRef),
}

impl OutgoingBlock {
    #[inline]
    pub fn wire(&self) -> &[u8] {
        match self {
            OutgoingBlock::Control(wire) => wire,
            OutgoingBlock::Unreliable(wire) => wire,
            OutgoingBlock::Reliable(block) => &block.wire,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_roundtrip() {
        let blocks = [
            ControlBlock::Ping { seq: 3 },
            ControlBlock::Pong { seq: 3 },
            ControlBlock::Disconnect { data: 0x12345678 },
            ControlBlock::DisconnectAck { data: 0x12345678 },
            ControlBlock::BandwidthLimits {
                incoming: 1_000_000,
                outgoing: 250_000,
            },
            ControlBlock::BandwidthLimitsAck,
        ];

        let mut frame = Vec::new();
        for block in blocks.iter() {
            frame.extend_from_slice(&block.write(0));
        }

        let mut reader = BlockReader::new(&frame);
        for block in blocks.iter() {
            match reader.next_block().unwrap().unwrap() {
                ParsedBlock::Control(parsed) => assert_eq!(parsed, *block),
                other => panic!("unexpected block {:?}", other),
            }
        }
        assert!(reader.next_block().unwrap().is_none());
    }

    #[test]
    fn test_mtu_probe_carries_padding() {
        let probe = ControlBlock::MtuProbe {
            seq: 9,
            phase: 0,
            size: 1200,
        };

        let wire = probe.write(100);
        assert_eq!(wire.len(), MTU_PROBE_HEADER_SIZE + 100);

        let mut reader = BlockReader::new(&wire);
        match reader.next_block().unwrap().unwrap() {
            ParsedBlock::Control(parsed) => assert_eq!(parsed, probe),
            other => panic!("unexpected block {:?}", other),
        }
        assert!(reader.next_block().unwrap().is_none());
    }

    #[test]
    fn test_channel_block_roundtrip() {
        let wire = encode_channel_block(5, 2, &[1, 2, 3, 4]);

        let mut reader = BlockReader::new(&wire);
        match reader.next_block().unwrap().unwrap() {
            ParsedBlock::Channel {
                channel,
                command,
                payload,
            } => {
                assert_eq!(channel, 5);
                assert_eq!(command, 2);
                assert_eq!(payload, &[1, 2, 3, 4]);
            }
            other => panic!("unexpected block {:?}", other),
        }
    }

    #[test]
    fn test_truncated_channel_block_is_malformed() {
        let mut wire = encode_channel_block(0, 0, &[1, 2, 3, 4]);
        wire.truncate(wire.len() - 1);

        let mut reader = BlockReader::new(&wire);
        assert_eq!(
            reader.next_block().unwrap_err(),
            NetworkError::Fatal(ErrorType::Malformed)
        );
    }

    #[test]
    fn test_unknown_block_type_is_malformed() {
        let wire = [0x0Fu8, 0, 0];
        let mut reader = BlockReader::new(&wire);
        assert_eq!(
            reader.next_block().unwrap_err(),
            NetworkError::Fatal(ErrorType::Malformed)
        );
    }
}
