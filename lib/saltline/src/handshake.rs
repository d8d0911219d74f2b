use std::net::{IpAddr, SocketAddr};

use brine::crypto;

use crate::protocol::{self, CHALLENGE_SIZE};

/// Both fixed server-side tables are 12 bit open-addressed: a slot either matches,
/// is reclaimable, or the packet is dropped. No chains, no allocation per attempt.
pub const TABLE_BITS: usize = 12;
pub const TABLE_SIZE: usize = 1 << TABLE_BITS;
pub const TABLE_MASK: u64 = (TABLE_SIZE - 1) as u64;

/// Inter-arrival deltas of the most recent connection attempts, feeding the
/// proof-of-work difficulty.
pub const ATTEMPT_HISTORY_SIZE: usize = 256;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CandidateStage {
    AwaitingChallengeResponse,
    AwaitingAuthenticationResponse,
    AwaitingAcknowledge,
}

/// Server-side record of a handshake in progress, before a peer exists.
pub struct Candidate {
    pub addr: SocketAddr,
    /// The client's salt.
    pub remote_salt: u64,
    /// The salt this host chose for the exchange.
    pub local_salt: u64,
    pub stage: CandidateStage,

    pub challenge: [u8; CHALLENGE_SIZE],
    pub repetitions: u32,
    pub solved: [u8; CHALLENGE_SIZE],
    pub nonce: u64,

    pub exchange_secret: [u8; crypto::EXCHANGE_KEY_SIZE],
    pub exchange_public: [u8; crypto::EXCHANGE_KEY_SIZE],
    pub remote_exchange_public: [u8; crypto::EXCHANGE_KEY_SIZE],
    pub shared_key: [u8; crypto::KEY_SIZE],

    /// The peer id the client picked for itself; outgoing normal headers towards
    /// the client carry it.
    pub client_peer_id: u16,
    pub remote_incoming_bandwidth: u32,
    pub remote_outgoing_bandwidth: u32,
    pub mtu: u16,

    /// Local peer created at approval, if the handshake got that far.
    pub peer: Option<crate::shared::PeerId>,

    /// The last response sent; duplicates of the triggering packet re-send it.
    pub cached_response: Vec<u8>,

    pub created: u64,
}

impl Candidate {
    pub fn new(addr: SocketAddr, remote_salt: u64, client_peer_id: u16, now: u64) -> Candidate {
        let mut challenge = [0u8; CHALLENGE_SIZE];
        crypto::random_bytes(&mut challenge);

        Candidate {
            addr,
            remote_salt,
            local_salt: crypto::random_u64(),
            stage: CandidateStage::AwaitingChallengeResponse,
            challenge,
            repetitions: 0,
            solved: [0; CHALLENGE_SIZE],
            nonce: 0,
            exchange_secret: [0; crypto::EXCHANGE_KEY_SIZE],
            exchange_public: [0; crypto::EXCHANGE_KEY_SIZE],
            remote_exchange_public: [0; crypto::EXCHANGE_KEY_SIZE],
            shared_key: [0; crypto::KEY_SIZE],
            client_peer_id,
            remote_incoming_bandwidth: 0,
            remote_outgoing_bandwidth: 0,
            mtu: protocol::MIN_MTU,
            peer: None,
            cached_response: Vec::new(),
            created: now,
        }
    }

    #[inline]
    pub fn expired(&self, now: u64, pending_timeout: u64) -> bool {
        now.wrapping_sub(self.created) >= pending_timeout
    }

    /// True when a packet carrying sender-perspective `salts` belongs here.
    #[inline]
    pub fn matches(&self, addr: SocketAddr, salts: protocol::Salts) -> bool {
        self.addr == addr && self.remote_salt == salts.local && self.local_salt == salts.remote
    }
}

/// Per source address throttle for connection attempts.
pub struct KnownAddress {
    pub addr: SocketAddr,
    pub limiter: brine::rate::RateLimiter,
    pub last_attempt: u64,
}

/// Ring of the last inter-arrival deltas between connection attempts; the busier
/// the listener, the harder the challenge.
pub struct AttemptHistory {
    deltas: [u64; ATTEMPT_HISTORY_SIZE],
    index: usize,
    count: usize,
    last_attempt: u64,
}

impl AttemptHistory {
    pub fn new() -> AttemptHistory {
        AttemptHistory {
            deltas: [0; ATTEMPT_HISTORY_SIZE],
            index: 0,
            count: 0,
            last_attempt: 0,
        }
    }

    pub fn record(&mut self, now: u64) {
        if self.last_attempt != 0 {
            self.deltas[self.index] = now.wrapping_sub(self.last_attempt);
            self.index = (self.index + 1) % ATTEMPT_HISTORY_SIZE;
            self.count = (self.count + 1).min(ATTEMPT_HISTORY_SIZE);
        }

        self.last_attempt = now.max(1);
    }

    /// Smoothed attempts per second over the recorded window.
    pub fn attempts_per_second(&self) -> u64 {
        if self.count == 0 {
            return 0;
        }

        let sum: u64 = self.deltas[..self.count].iter().sum();
        let average = (sum / self.count as u64).max(1);

        1000 / average.max(1)
    }

    /// Challenge difficulty: the smoothed attempt rate scaled by the configured
    /// factor, clamped into the configured repetition range.
    pub fn repetitions(&self, factor: u32, minimum: u32, maximum: u32) -> u32 {
        let scaled = self
            .attempts_per_second()
            .saturating_mul(u64::from(factor))
            .min(u64::from(maximum)) as u32;

        scaled.max(minimum)
    }
}

/// FNV-1a over the address bytes; cheap and stable across the process.
pub fn address_hash(addr: &SocketAddr) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;

    let mut feed = |byte: u8| {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01B3);
    };

    match addr.ip() {
        IpAddr::V4(ip) => {
            for byte in ip.octets().iter() {
                feed(*byte);
            }
        }
        IpAddr::V6(ip) => {
            for byte in ip.octets().iter() {
                feed(*byte);
            }
        }
    }

    for byte in addr.port().to_le_bytes().iter() {
        feed(*byte);
    }

    hash
}

/// Table slot for the per-address throttle table.
#[inline]
pub fn known_address_index(addr: &SocketAddr) -> usize {
    (address_hash(addr) & TABLE_MASK) as usize
}

/// Table slot for a candidate keyed by source address and the client's salt.
#[inline]
pub fn candidate_index(addr: &SocketAddr, remote_salt: u64) -> usize {
    let mixed = address_hash(addr) ^ remote_salt.wrapping_mul(0x9E37_79B9_7F4A_7C15);
    (mixed & TABLE_MASK) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("10.0.0.7:{}", port).parse().unwrap()
    }

    #[test]
    fn test_attempt_history_rates() {
        let mut history = AttemptHistory::new();
        assert_eq!(history.attempts_per_second(), 0);

        // One attempt every 10 ms = 100 per second
        for tick in 0..50u64 {
            history.record(1 + tick * 10);
        }

        let rate = history.attempts_per_second();
        assert!(rate >= 90 && rate <= 110, "rate {}", rate);
    }

    #[test]
    fn test_repetitions_clamped() {
        let mut history = AttemptHistory::new();
        for tick in 0..50u64 {
            history.record(1 + tick);
        }

        // A flood saturates at the maximum
        assert_eq!(history.repetitions(1000, 16, 4096), 4096);

        // A quiet listener sits at the minimum
        let idle = AttemptHistory::new();
        assert_eq!(idle.repetitions(4, 16, 4096), 16);
    }

    #[test]
    fn test_table_indices_in_range() {
        for port in 0..64u16 {
            assert!(known_address_index(&addr(port)) < TABLE_SIZE);
            assert!(candidate_index(&addr(port), u64::from(port) << 40) < TABLE_SIZE);
        }
    }

    #[test]
    fn test_candidate_matching() {
        let candidate = Candidate::new(addr(1), 77, 3, 100);

        let good = protocol::Salts {
            local: 77,
            remote: candidate.local_salt,
        };
        assert!(candidate.matches(addr(1), good));
        assert!(!candidate.matches(addr(2), good));

        let bad = protocol::Salts {
            local: 78,
            remote: candidate.local_salt,
        };
        assert!(!candidate.matches(addr(1), bad));
    }

    #[test]
    fn test_candidate_expiry() {
        let candidate = Candidate::new(addr(1), 0, 0, 1_000);
        assert!(!candidate.expired(5_000, 10_000));
        assert!(candidate.expired(11_000, 10_000));
    }
}
