use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};

use brine::crypto;

/// First four bytes of every handshake packet. Normal packets can never collide with
/// this: their fourth byte is the marker, which is never 0xFF.
pub const HANDSHAKE_MAGIC: [u8; 4] = [0x52, 0x4E, 0x4C, 0xFF];

pub const VERSION_MAJOR: u16 = 1;
pub const VERSION_MINOR: u16 = 0;
pub const VERSION_PATCH: u16 = 0;

/// Handshake header: magic, version, protocol id, crc32c, packet type.
pub const HANDSHAKE_HEADER_SIZE: usize = 4 + 8 + 8 + 4 + 1;
const CRC_OFFSET: usize = 20;

/// Normal header: peer id, flags, marker, low 16 bits of send time, sequence, tag.
pub const NORMAL_HEADER_SIZE: usize = 2 + 1 + 1 + 2 + 8 + 16;
const TAG_OFFSET: usize = 14;

/// The marker byte in a normal header. Anything but 0xFF works; 0xFF is reserved to
/// the handshake magic.
pub const NORMAL_MARKER: u8 = 0x00;

/// Bit 0 of the normal header flags: the payload is compressed.
pub const FLAG_COMPRESSED: u8 = 0b0000_0001;

/// Connection establishment packets are padded to at least the minimum unfragmented
/// UDP payload (576 - 60 - 8) so a response is never larger than its trigger.
pub const PADDED_PACKET_SIZE: usize = 508;

pub const CONNECTION_TOKEN_SIZE: usize = 128;
pub const AUTHENTICATION_TOKEN_SIZE: usize = 128;
pub const CHALLENGE_SIZE: usize = 32;
pub const MAX_CHANNEL_COUNT: usize = 32;

pub const MIN_MTU: u16 = 576;
pub const MAX_MTU: u16 = 4096;

/// Candidate UDP payload sizes for MTU discovery, probed largest first.
pub const MTU_CANDIDATES: [u16; 20] = [
    65535, 49152, 32000, 17914, 16384, 9000, 8166, 4352, 4096, 2048, 2002, 1536, 1514, 1500,
    1492, 1434, 1280, 1006, 750, 576,
];

pub const AUTH_REQUEST_BODY_SIZE: usize = 32 + 64 + 2;
pub const AUTH_RESPONSE_BODY_SIZE: usize = 32 + 64 + AUTHENTICATION_TOKEN_SIZE + 2 + 1 + MAX_CHANNEL_COUNT + 8;
pub const APPROVAL_BODY_SIZE: usize = 2;

pub const AUTH_REQUEST_CIPHER_SIZE: usize = AUTH_REQUEST_BODY_SIZE + crypto::MAC_SIZE;
pub const AUTH_RESPONSE_CIPHER_SIZE: usize = AUTH_RESPONSE_BODY_SIZE + crypto::MAC_SIZE;
pub const APPROVAL_CIPHER_SIZE: usize = APPROVAL_BODY_SIZE + crypto::MAC_SIZE;

const SALTS_SIZE: usize = 16;

#[inline]
pub fn pack_version() -> u64 {
    (u64::from(VERSION_MAJOR) << 32) | (u64::from(VERSION_MINOR) << 16) | u64::from(VERSION_PATCH)
}

/// Major and minor must match; the patch level is ignored.
#[inline]
pub fn version_compatible(version: u64) -> bool {
    version >> 16 == pack_version() >> 16
}

/// The salt pair a handshake packet carries, as seen by the packet's sender.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Salts {
    pub local: u64,
    pub remote: u64,
}

impl Salts {
    /// The same pair from the receiver's point of view.
    #[inline]
    pub fn flipped(self) -> Salts {
        Salts {
            local: self.remote,
            remote: self.local,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum HandshakeKind {
    ConnectionRequest = 0,
    ChallengeRequest = 1,
    ChallengeResponse = 2,
    AuthenticationRequest = 3,
    AuthenticationResponse = 4,
    ApprovalResponse = 5,
    DenialResponse = 6,
    ApprovalAcknowledge = 7,
    DenialAcknowledge = 8,
}

impl HandshakeKind {
    #[inline]
    fn from_u8(value: u8) -> Option<HandshakeKind> {
        Some(match value {
            0 => HandshakeKind::ConnectionRequest,
            1 => HandshakeKind::ChallengeRequest,
            2 => HandshakeKind::ChallengeResponse,
            3 => HandshakeKind::AuthenticationRequest,
            4 => HandshakeKind::AuthenticationResponse,
            5 => HandshakeKind::ApprovalResponse,
            6 => HandshakeKind::DenialResponse,
            7 => HandshakeKind::ApprovalAcknowledge,
            8 => HandshakeKind::DenialAcknowledge,
            _ => return None,
        })
    }

    /// Every handshake packet has a fixed total size.
    #[inline]
    pub fn packet_size(self) -> usize {
        match self {
            HandshakeKind::ConnectionRequest
            | HandshakeKind::ChallengeRequest
            | HandshakeKind::ChallengeResponse
            | HandshakeKind::AuthenticationRequest => PADDED_PACKET_SIZE,
            HandshakeKind::AuthenticationResponse => {
                HANDSHAKE_HEADER_SIZE + SALTS_SIZE + AUTH_RESPONSE_CIPHER_SIZE
            }
            HandshakeKind::ApprovalResponse => HANDSHAKE_HEADER_SIZE + SALTS_SIZE + APPROVAL_CIPHER_SIZE,
            HandshakeKind::DenialResponse => HANDSHAKE_HEADER_SIZE + SALTS_SIZE + 1,
            HandshakeKind::ApprovalAcknowledge => HANDSHAKE_HEADER_SIZE + SALTS_SIZE + 16,
            HandshakeKind::DenialAcknowledge => HANDSHAKE_HEADER_SIZE + SALTS_SIZE,
        }
    }
}

/// Typed rejection carried by a DenialResponse.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum DenialReason {
    Unknown = 0,
    Full = 1,
    TooFewChannels = 2,
    TooManyChannels = 3,
    WrongChannelTypes = 4,
    Unauthorized = 5,
}

impl DenialReason {
    #[inline]
    fn from_u8(value: u8) -> DenialReason {
        match value {
            1 => DenialReason::Full,
            2 => DenialReason::TooFewChannels,
            3 => DenialReason::TooManyChannels,
            4 => DenialReason::WrongChannelTypes,
            5 => DenialReason::Unauthorized,
            _ => DenialReason::Unknown,
        }
    }
}

#[derive(Clone)]
pub struct ConnectionRequest {
    pub peer_id: u16,
    pub salt: u64,
    pub incoming_bandwidth: u32,
    pub outgoing_bandwidth: u32,
    pub token: [u8; CONNECTION_TOKEN_SIZE],
}

#[derive(Clone)]
pub struct ChallengeRequest {
    pub salts: Salts,
    pub incoming_bandwidth: u32,
    pub outgoing_bandwidth: u32,
    pub challenge: [u8; CHALLENGE_SIZE],
    pub repetitions: u32,
}

#[derive(Clone)]
pub struct ChallengeResponse {
    pub salts: Salts,
    pub solved: [u8; CHALLENGE_SIZE],
    pub exchange_public: [u8; crypto::EXCHANGE_KEY_SIZE],
}

#[derive(Clone)]
pub struct AuthenticationRequest {
    pub salts: Salts,
    /// The server's ephemeral X25519 public key, in clear: the client needs it to
    /// derive the key the attached cipher was sealed with.
    pub exchange_public: [u8; crypto::EXCHANGE_KEY_SIZE],
    pub cipher: [u8; AUTH_REQUEST_CIPHER_SIZE],
}

#[derive(Clone)]
pub struct AuthenticationResponse {
    pub salts: Salts,
    pub cipher: [u8; AUTH_RESPONSE_CIPHER_SIZE],
}

#[derive(Clone)]
pub struct ApprovalResponse {
    pub salts: Salts,
    pub cipher: [u8; APPROVAL_CIPHER_SIZE],
}

#[derive(Clone)]
pub struct DenialResponse {
    pub salts: Salts,
    pub reason: DenialReason,
}

#[derive(Clone)]
pub struct ApprovalAcknowledge {
    pub salts: Salts,
    pub mac: [u8; 16],
}

#[derive(Clone)]
pub struct DenialAcknowledge {
    pub salts: Salts,
}

pub enum HandshakePacket {
    ConnectionRequest(ConnectionRequest),
    ChallengeRequest(ChallengeRequest),
    ChallengeResponse(ChallengeResponse),
    AuthenticationRequest(AuthenticationRequest),
    AuthenticationResponse(AuthenticationResponse),
    ApprovalResponse(ApprovalResponse),
    DenialResponse(DenialResponse),
    ApprovalAcknowledge(ApprovalAcknowledge),
    DenialAcknowledge(DenialAcknowledge),
}

impl HandshakePacket {
    #[inline]
    pub fn kind(&self) -> HandshakeKind {
        match self {
            HandshakePacket::ConnectionRequest(_) => HandshakeKind::ConnectionRequest,
            HandshakePacket::ChallengeRequest(_) => HandshakeKind::ChallengeRequest,
            HandshakePacket::ChallengeResponse(_) => HandshakeKind::ChallengeResponse,
            HandshakePacket::AuthenticationRequest(_) => HandshakeKind::AuthenticationRequest,
            HandshakePacket::AuthenticationResponse(_) => HandshakeKind::AuthenticationResponse,
            HandshakePacket::ApprovalResponse(_) => HandshakeKind::ApprovalResponse,
            HandshakePacket::DenialResponse(_) => HandshakeKind::DenialResponse,
            HandshakePacket::ApprovalAcknowledge(_) => HandshakeKind::ApprovalAcknowledge,
            HandshakePacket::DenialAcknowledge(_) => HandshakeKind::DenialAcknowledge,
        }
    }

    /// Serializes the packet into a ready-to-send datagram with padding and checksum.
    pub fn write(&self, protocol_id: u64) -> Vec<u8> {
        let kind = self.kind();
        let mut packet = Vec::with_capacity(kind.packet_size());

        packet.extend_from_slice(&HANDSHAKE_MAGIC);
        packet.write_u64::<LittleEndian>(pack_version()).unwrap();
        packet.write_u64::<LittleEndian>(protocol_id).unwrap();
        packet.write_u32::<LittleEndian>(0).unwrap();
        packet.write_u8(kind as u8).unwrap();

        match self {
            HandshakePacket::ConnectionRequest(body) => {
                packet.write_u16::<LittleEndian>(body.peer_id).unwrap();
                packet.write_u64::<LittleEndian>(body.salt).unwrap();
                packet.write_u32::<LittleEndian>(body.incoming_bandwidth).unwrap();
                packet.write_u32::<LittleEndian>(body.outgoing_bandwidth).unwrap();
                packet.extend_from_slice(&body.token);
            }
            HandshakePacket::ChallengeRequest(body) => {
                write_salts(&mut packet, body.salts);
                packet.write_u32::<LittleEndian>(body.incoming_bandwidth).unwrap();
                packet.write_u32::<LittleEndian>(body.outgoing_bandwidth).unwrap();
                packet.extend_from_slice(&body.challenge);
                packet.write_u32::<LittleEndian>(body.repetitions).unwrap();
            }
            HandshakePacket::ChallengeResponse(body) => {
                write_salts(&mut packet, body.salts);
                packet.extend_from_slice(&body.solved);
                packet.extend_from_slice(&body.exchange_public);
            }
            HandshakePacket::AuthenticationRequest(body) => {
                write_salts(&mut packet, body.salts);
                packet.extend_from_slice(&body.exchange_public);
                packet.extend_from_slice(&body.cipher);
            }
            HandshakePacket::AuthenticationResponse(body) => {
                write_salts(&mut packet, body.salts);
                packet.extend_from_slice(&body.cipher);
            }
            HandshakePacket::ApprovalResponse(body) => {
                write_salts(&mut packet, body.salts);
                packet.extend_from_slice(&body.cipher);
            }
            HandshakePacket::DenialResponse(body) => {
                write_salts(&mut packet, body.salts);
                packet.write_u8(body.reason as u8).unwrap();
            }
            HandshakePacket::ApprovalAcknowledge(body) => {
                write_salts(&mut packet, body.salts);
                packet.extend_from_slice(&body.mac);
            }
            HandshakePacket::DenialAcknowledge(body) => {
                write_salts(&mut packet, body.salts);
            }
        }

        packet.resize(kind.packet_size(), 0);

        let crc = crc32c::crc32c(&packet);
        packet[CRC_OFFSET..CRC_OFFSET + 4].copy_from_slice(&crc.to_le_bytes());

        packet
    }

    /// Parses and validates a handshake datagram. Every failure is silent by design;
    /// the caller only learns that the bytes were not a usable handshake packet.
    pub fn read(buf: &[u8], protocol_id: u64) -> Option<HandshakePacket> {
        if buf.len() < HANDSHAKE_HEADER_SIZE || buf[..4] != HANDSHAKE_MAGIC {
            return None;
        }

        let mut cursor = Cursor::new(&buf[4..]);
        let version = cursor.read_u64::<LittleEndian>().ok()?;
        let packet_protocol = cursor.read_u64::<LittleEndian>().ok()?;
        let crc = cursor.read_u32::<LittleEndian>().ok()?;
        let kind = HandshakeKind::from_u8(cursor.read_u8().ok()?)?;

        if !version_compatible(version) || packet_protocol != protocol_id {
            return None;
        }

        if buf.len() != kind.packet_size() {
            return None;
        }

        let mut checked = buf.to_vec();
        checked[CRC_OFFSET..CRC_OFFSET + 4].copy_from_slice(&[0; 4]);

        if crc32c::crc32c(&checked) != crc {
            return None;
        }

        let mut cursor = Cursor::new(&buf[HANDSHAKE_HEADER_SIZE..]);

        Some(match kind {
            HandshakeKind::ConnectionRequest => {
                let peer_id = cursor.read_u16::<LittleEndian>().ok()?;
                let salt = cursor.read_u64::<LittleEndian>().ok()?;
                let incoming_bandwidth = cursor.read_u32::<LittleEndian>().ok()?;
                let outgoing_bandwidth = cursor.read_u32::<LittleEndian>().ok()?;
                let mut token = [0u8; CONNECTION_TOKEN_SIZE];
                cursor.read_exact(&mut token).ok()?;

                HandshakePacket::ConnectionRequest(ConnectionRequest {
                    peer_id,
                    salt,
                    incoming_bandwidth,
                    outgoing_bandwidth,
                    token,
                })
            }
            HandshakeKind::ChallengeRequest => {
                let salts = read_salts(&mut cursor)?;
                let incoming_bandwidth = cursor.read_u32::<LittleEndian>().ok()?;
                let outgoing_bandwidth = cursor.read_u32::<LittleEndian>().ok()?;
                let mut challenge = [0u8; CHALLENGE_SIZE];
                cursor.read_exact(&mut challenge).ok()?;
                let repetitions = cursor.read_u32::<LittleEndian>().ok()?;

                HandshakePacket::ChallengeRequest(ChallengeRequest {
                    salts,
                    incoming_bandwidth,
                    outgoing_bandwidth,
                    challenge,
                    repetitions,
                })
            }
            HandshakeKind::ChallengeResponse => {
                let salts = read_salts(&mut cursor)?;
                let mut solved = [0u8; CHALLENGE_SIZE];
                cursor.read_exact(&mut solved).ok()?;
                let mut exchange_public = [0u8; crypto::EXCHANGE_KEY_SIZE];
                cursor.read_exact(&mut exchange_public).ok()?;

                HandshakePacket::ChallengeResponse(ChallengeResponse {
                    salts,
                    solved,
                    exchange_public,
                })
            }
            HandshakeKind::AuthenticationRequest => {
                let salts = read_salts(&mut cursor)?;
                let mut exchange_public = [0u8; crypto::EXCHANGE_KEY_SIZE];
                cursor.read_exact(&mut exchange_public).ok()?;
                let mut cipher = [0u8; AUTH_REQUEST_CIPHER_SIZE];
                cursor.read_exact(&mut cipher).ok()?;

                HandshakePacket::AuthenticationRequest(AuthenticationRequest {
                    salts,
                    exchange_public,
                    cipher,
                })
            }
            HandshakeKind::AuthenticationResponse => {
                let salts = read_salts(&mut cursor)?;
                let mut cipher = [0u8; AUTH_RESPONSE_CIPHER_SIZE];
                cursor.read_exact(&mut cipher).ok()?;

                HandshakePacket::AuthenticationResponse(AuthenticationResponse { salts, cipher })
            }
            HandshakeKind::ApprovalResponse => {
                let salts = read_salts(&mut cursor)?;
                let mut cipher = [0u8; APPROVAL_CIPHER_SIZE];
                cursor.read_exact(&mut cipher).ok()?;

                HandshakePacket::ApprovalResponse(ApprovalResponse { salts, cipher })
            }
            HandshakeKind::DenialResponse => {
                let salts = read_salts(&mut cursor)?;
                let reason = DenialReason::from_u8(cursor.read_u8().ok()?);

                HandshakePacket::DenialResponse(DenialResponse { salts, reason })
            }
            HandshakeKind::ApprovalAcknowledge => {
                let salts = read_salts(&mut cursor)?;
                let mut mac = [0u8; 16];
                cursor.read_exact(&mut mac).ok()?;

                HandshakePacket::ApprovalAcknowledge(ApprovalAcknowledge { salts, mac })
            }
            HandshakeKind::DenialAcknowledge => {
                let salts = read_salts(&mut cursor)?;

                HandshakePacket::DenialAcknowledge(DenialAcknowledge { salts })
            }
        })
    }
}

#[inline]
fn write_salts(packet: &mut Vec<u8>, salts: Salts) {
    packet.write_u64::<LittleEndian>(salts.local).unwrap();
    packet.write_u64::<LittleEndian>(salts.remote).unwrap();
}

#[inline]
fn read_salts(cursor: &mut Cursor<&[u8]>) -> Option<Salts> {
    let local = cursor.read_u64::<LittleEndian>().ok()?;
    let remote = cursor.read_u64::<LittleEndian>().ok()?;
    Some(Salts { local, remote })
}

/// Zeroes the MAC and checksum fields of a serialized ApprovalAcknowledge so the
/// Poly1305 authenticator can be computed or checked over the rest. The checksum is
/// re-stamped after the MAC lands in the packet.
#[inline]
pub fn acknowledge_mac_input(packet: &[u8]) -> Vec<u8> {
    let mut input = packet.to_vec();
    let mac_offset = HANDSHAKE_HEADER_SIZE + SALTS_SIZE;
    for byte in &mut input[mac_offset..mac_offset + 16] {
        *byte = 0;
    }
    for byte in &mut input[CRC_OFFSET..CRC_OFFSET + 4] {
        *byte = 0;
    }
    input
}

/// Re-stamps the header checksum after a field was patched into a serialized packet.
#[inline]
pub fn patch_crc(packet: &mut [u8]) {
    packet[CRC_OFFSET..CRC_OFFSET + 4].copy_from_slice(&[0; 4]);
    let crc = crc32c::crc32c(packet);
    packet[CRC_OFFSET..CRC_OFFSET + 4].copy_from_slice(&crc.to_le_bytes());
}

/// Patches the MAC field of a serialized ApprovalAcknowledge and restores the
/// checksum.
#[inline]
pub fn patch_acknowledge_mac(packet: &mut [u8], mac: &[u8; 16]) {
    let mac_offset = HANDSHAKE_HEADER_SIZE + SALTS_SIZE;
    packet[mac_offset..mac_offset + 16].copy_from_slice(mac);
    patch_crc(packet);
}

/// Plaintext body of an AuthenticationRequest.
pub struct AuthRequestBody {
    pub identity: [u8; crypto::SIGN_PUBLIC_KEY_SIZE],
    pub signature: [u8; crypto::SIGNATURE_SIZE],
    pub mtu: u16,
}

impl AuthRequestBody {
    pub fn write(&self) -> [u8; AUTH_REQUEST_BODY_SIZE] {
        let mut out = [0u8; AUTH_REQUEST_BODY_SIZE];
        {
            let mut buf = &mut out[..];
            buf.write_all(&self.identity).unwrap();
            buf.write_all(&self.signature).unwrap();
            buf.write_u16::<LittleEndian>(self.mtu).unwrap();
        }
        out
    }

    pub fn read(raw: &[u8; AUTH_REQUEST_BODY_SIZE]) -> AuthRequestBody {
        let mut cursor = Cursor::new(&raw[..]);

        let mut identity = [0u8; crypto::SIGN_PUBLIC_KEY_SIZE];
        cursor.read_exact(&mut identity).unwrap();
        let mut signature = [0u8; crypto::SIGNATURE_SIZE];
        cursor.read_exact(&mut signature).unwrap();
        let mtu = cursor.read_u16::<LittleEndian>().unwrap();

        AuthRequestBody {
            identity,
            signature,
            mtu,
        }
    }
}

/// Plaintext body of an AuthenticationResponse.
pub struct AuthResponseBody {
    pub identity: [u8; crypto::SIGN_PUBLIC_KEY_SIZE],
    pub signature: [u8; crypto::SIGNATURE_SIZE],
    pub token: [u8; AUTHENTICATION_TOKEN_SIZE],
    pub mtu: u16,
    pub channel_count: u8,
    pub channel_kinds: [u8; MAX_CHANNEL_COUNT],
    pub application_data: u64,
}

impl AuthResponseBody {
    pub fn write(&self) -> [u8; AUTH_RESPONSE_BODY_SIZE] {
        let mut out = [0u8; AUTH_RESPONSE_BODY_SIZE];
        {
            let mut buf = &mut out[..];
            buf.write_all(&self.identity).unwrap();
            buf.write_all(&self.signature).unwrap();
            buf.write_all(&self.token).unwrap();
            buf.write_u16::<LittleEndian>(self.mtu).unwrap();
            buf.write_u8(self.channel_count).unwrap();
            buf.write_all(&self.channel_kinds).unwrap();
            buf.write_u64::<LittleEndian>(self.application_data).unwrap();
        }
        out
    }

    pub fn read(raw: &[u8; AUTH_RESPONSE_BODY_SIZE]) -> AuthResponseBody {
        let mut cursor = Cursor::new(&raw[..]);

        let mut identity = [0u8; crypto::SIGN_PUBLIC_KEY_SIZE];
        cursor.read_exact(&mut identity).unwrap();
        let mut signature = [0u8; crypto::SIGNATURE_SIZE];
        cursor.read_exact(&mut signature).unwrap();
        let mut token = [0u8; AUTHENTICATION_TOKEN_SIZE];
        cursor.read_exact(&mut token).unwrap();
        let mtu = cursor.read_u16::<LittleEndian>().unwrap();
        let channel_count = cursor.read_u8().unwrap();
        let mut channel_kinds = [0u8; MAX_CHANNEL_COUNT];
        cursor.read_exact(&mut channel_kinds).unwrap();
        let application_data = cursor.read_u64::<LittleEndian>().unwrap();

        AuthResponseBody {
            identity,
            signature,
            token,
            mtu,
            channel_count,
            channel_kinds,
            application_data,
        }
    }
}

/// Normal (data phase) packet header. The whole serialized header, with the tag field
/// zeroed, is the AEAD associated data.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct NormalHeader {
    pub peer_id: u16,
    pub flags: u8,
    pub sent_time: u16,
    pub sequence: u64,
    pub tag: [u8; 16],
}

impl NormalHeader {
    pub fn write(&self, out: &mut [u8]) {
        let mut buf = &mut out[..NORMAL_HEADER_SIZE];
        buf.write_u16::<LittleEndian>(self.peer_id).unwrap();
        buf.write_u8(self.flags).unwrap();
        buf.write_u8(NORMAL_MARKER).unwrap();
        buf.write_u16::<LittleEndian>(self.sent_time).unwrap();
        buf.write_u64::<LittleEndian>(self.sequence).unwrap();
        buf.write_all(&self.tag).unwrap();
    }

    pub fn read(buf: &[u8]) -> Option<NormalHeader> {
        if buf.len() < NORMAL_HEADER_SIZE || buf[3] == 0xFF {
            return None;
        }

        let mut cursor = Cursor::new(buf);
        let peer_id = cursor.read_u16::<LittleEndian>().ok()?;
        let flags = cursor.read_u8().ok()?;
        let _marker = cursor.read_u8().ok()?;
        let sent_time = cursor.read_u16::<LittleEndian>().ok()?;
        let sequence = cursor.read_u64::<LittleEndian>().ok()?;
        let mut tag = [0u8; 16];
        cursor.read_exact(&mut tag).ok()?;

        Some(NormalHeader {
            peer_id,
            flags,
            sent_time,
            sequence,
            tag,
        })
    }

    /// The serialized header with a zeroed tag field, for use as associated data.
    #[inline]
    pub fn associated_data(&self) -> [u8; NORMAL_HEADER_SIZE] {
        let mut ad = [0u8; NORMAL_HEADER_SIZE];
        let mut zeroed = *self;
        zeroed.tag = [0; 16];
        zeroed.write(&mut ad);
        ad
    }

    /// Patches a freshly computed tag into an already serialized packet.
    #[inline]
    pub fn patch_tag(packet: &mut [u8], tag: &[u8; 16]) {
        packet[TAG_OFFSET..TAG_OFFSET + 16].copy_from_slice(tag);
    }
}

/// AEAD nonce for the two encrypted handshake payloads. The packet type is folded
/// into the nonce counter so the server's two encrypted packets never share one.
/// Salts are given as the packet's sender sees them.
#[inline]
pub fn handshake_nonce(nonce: u64, packet_type: u8, salts: Salts) -> [u8; crypto::NONCE_SIZE] {
    let mut out = [0u8; crypto::NONCE_SIZE];
    out[..8].copy_from_slice(&nonce.wrapping_add(u64::from(packet_type)).to_le_bytes());
    out[8..16].copy_from_slice(&salts.remote.to_le_bytes());
    out[16..].copy_from_slice(&salts.local.to_le_bytes());
    out
}

/// AEAD nonce for data phase frames: sequence, connection nonce, connection salt.
#[inline]
pub fn data_nonce(sequence: u64, connection_nonce: u64, connection_salt: u64) -> [u8; crypto::NONCE_SIZE] {
    let mut out = [0u8; crypto::NONCE_SIZE];
    out[..8].copy_from_slice(&sequence.to_le_bytes());
    out[8..16].copy_from_slice(&connection_nonce.to_le_bytes());
    out[16..].copy_from_slice(&connection_salt.to_le_bytes());
    out
}

/// Hashes a challenge `repetitions` times, feeding each digest into the next round.
pub fn solve_challenge(challenge: &[u8; CHALLENGE_SIZE], repetitions: u32) -> [u8; CHALLENGE_SIZE] {
    let mut solved = *challenge;

    for _ in 0..repetitions {
        let input = solved;
        crypto::hash(&mut solved, &input);
    }

    solved
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROTOCOL: u64 = 0xDEAD_BEEF_CAFE_BABE;

    fn roundtrip(packet: HandshakePacket) -> HandshakePacket {
        let wire = packet.write(PROTOCOL);
        assert_eq!(wire.len(), packet.kind().packet_size());
        HandshakePacket::read(&wire, PROTOCOL).expect("roundtrip failed")
    }

    #[test]
    fn test_connection_request_roundtrip_and_padding() {
        let packet = HandshakePacket::ConnectionRequest(ConnectionRequest {
            peer_id: 7,
            salt: 0x1122_3344_5566_7788,
            incoming_bandwidth: 1_000_000,
            outgoing_bandwidth: 500_000,
            token: [0xAB; CONNECTION_TOKEN_SIZE],
        });

        let wire = packet.write(PROTOCOL);
        assert_eq!(wire.len(), PADDED_PACKET_SIZE);

        match HandshakePacket::read(&wire, PROTOCOL).unwrap() {
            HandshakePacket::ConnectionRequest(body) => {
                assert_eq!(body.peer_id, 7);
                assert_eq!(body.salt, 0x1122_3344_5566_7788);
                assert_eq!(body.incoming_bandwidth, 1_000_000);
                assert_eq!(body.outgoing_bandwidth, 500_000);
                assert_eq!(body.token, [0xAB; CONNECTION_TOKEN_SIZE]);
            }
            _ => panic!("wrong packet type"),
        }
    }

    #[test]
    fn test_establishment_packets_meet_padding_floor() {
        for kind in [
            HandshakeKind::ConnectionRequest,
            HandshakeKind::ChallengeRequest,
            HandshakeKind::ChallengeResponse,
            HandshakeKind::AuthenticationRequest,
        ]
        .iter()
        {
            assert!(kind.packet_size() >= PADDED_PACKET_SIZE);
        }
    }

    #[test]
    fn test_challenge_request_roundtrip() {
        let packet = HandshakePacket::ChallengeRequest(ChallengeRequest {
            salts: Salts { local: 1, remote: 2 },
            incoming_bandwidth: 0,
            outgoing_bandwidth: 0,
            challenge: [9; CHALLENGE_SIZE],
            repetitions: 1024,
        });

        match roundtrip(packet) {
            HandshakePacket::ChallengeRequest(body) => {
                assert_eq!(body.salts, Salts { local: 1, remote: 2 });
                assert_eq!(body.challenge, [9; CHALLENGE_SIZE]);
                assert_eq!(body.repetitions, 1024);
            }
            _ => panic!("wrong packet type"),
        }
    }

    #[test]
    fn test_corrupt_crc_rejected() {
        let packet = HandshakePacket::DenialAcknowledge(DenialAcknowledge {
            salts: Salts { local: 5, remote: 6 },
        });

        let mut wire = packet.write(PROTOCOL);
        wire[HANDSHAKE_HEADER_SIZE] ^= 1;

        assert!(HandshakePacket::read(&wire, PROTOCOL).is_none());
    }

    #[test]
    fn test_wrong_protocol_id_rejected() {
        let packet = HandshakePacket::DenialAcknowledge(DenialAcknowledge {
            salts: Salts { local: 5, remote: 6 },
        });

        let wire = packet.write(PROTOCOL);
        assert!(HandshakePacket::read(&wire, PROTOCOL + 1).is_none());
    }

    #[test]
    fn test_patch_version_is_ignored() {
        assert!(version_compatible(pack_version() + 5));
        assert!(!version_compatible(pack_version() + (1 << 16)));
        assert!(!version_compatible(pack_version() + (1 << 32)));
    }

    #[test]
    fn test_truncated_packet_rejected() {
        let packet = HandshakePacket::ConnectionRequest(ConnectionRequest {
            peer_id: 0,
            salt: 0,
            incoming_bandwidth: 0,
            outgoing_bandwidth: 0,
            token: [0; CONNECTION_TOKEN_SIZE],
        });

        let wire = packet.write(PROTOCOL);
        assert!(HandshakePacket::read(&wire[..wire.len() - 1], PROTOCOL).is_none());
    }

    #[test]
    fn test_normal_header_roundtrip() {
        let header = NormalHeader {
            peer_id: 42,
            flags: FLAG_COMPRESSED,
            sent_time: 0xBEEF,
            sequence: 0x0102_0304_0506_0708,
            tag: [3; 16],
        };

        let mut wire = [0u8; NORMAL_HEADER_SIZE];
        header.write(&mut wire);

        assert_eq!(NormalHeader::read(&wire).unwrap(), header);
        // A normal header can never masquerade as a handshake packet
        assert_ne!(wire[3], 0xFF);
    }

    #[test]
    fn test_normal_header_associated_data_zeroes_tag() {
        let header = NormalHeader {
            peer_id: 1,
            flags: 0,
            sent_time: 2,
            sequence: 3,
            tag: [0xEE; 16],
        };

        let ad = header.associated_data();
        assert_eq!(&ad[TAG_OFFSET..], &[0u8; 16][..]);

        let mut wire = [0u8; NORMAL_HEADER_SIZE];
        header.write(&mut wire);
        assert_eq!(&ad[..TAG_OFFSET], &wire[..TAG_OFFSET]);
    }

    #[test]
    fn test_handshake_nonce_differs_per_packet_type() {
        let salts = Salts { local: 10, remote: 20 };

        let auth = handshake_nonce(77, HandshakeKind::AuthenticationRequest as u8, salts);
        let approval = handshake_nonce(77, HandshakeKind::ApprovalResponse as u8, salts);

        assert_ne!(auth, approval);
        assert_eq!(auth[8..], approval[8..]);
    }

    #[test]
    fn test_solve_challenge_iterates() {
        let challenge = [7u8; CHALLENGE_SIZE];

        let once = solve_challenge(&challenge, 1);
        let twice = solve_challenge(&challenge, 2);

        let mut manual = [0u8; CHALLENGE_SIZE];
        brine::crypto::hash(&mut manual, &once);

        assert_ne!(once, twice);
        assert_eq!(manual, twice);
    }

    #[test]
    fn test_auth_bodies_roundtrip() {
        let request = AuthRequestBody {
            identity: [1; 32],
            signature: [2; 64],
            mtu: 1200,
        };
        let decoded = AuthRequestBody::read(&request.write());
        assert_eq!(decoded.identity, request.identity);
        assert_eq!(&decoded.signature[..], &request.signature[..]);
        assert_eq!(decoded.mtu, 1200);

        let response = AuthResponseBody {
            identity: [3; 32],
            signature: [4; 64],
            token: [5; AUTHENTICATION_TOKEN_SIZE],
            mtu: 900,
            channel_count: 2,
            channel_kinds: [0; MAX_CHANNEL_COUNT],
            application_data: 0xFEED,
        };
        let decoded = AuthResponseBody::read(&response.write());
        assert_eq!(decoded.mtu, 900);
        assert_eq!(decoded.channel_count, 2);
        assert_eq!(decoded.application_data, 0xFEED);
        assert_eq!(&decoded.token[..], &response.token[..]);
    }
}
