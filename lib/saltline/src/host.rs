use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use brine::crypto;
use brine::identity::Identity;
use brine::logging::{self, Logger};
use brine::rate::{BandwidthTracker, RateLimiter};

use crate::channel::ChannelKind;
use crate::compress::Compressor;
use crate::config::HostConfig;
use crate::event::HostEvent;
use crate::handshake::{
    candidate_index, known_address_index, AttemptHistory, Candidate, CandidateStage, KnownAddress,
    TABLE_SIZE,
};
use crate::message::Message;
use crate::network::{Interrupter, Network, WaitOutcome};
use crate::peer::{DispatchContext, Peer, PeerState};
use crate::protocol::{
    self, handshake_nonce, AuthRequestBody, AuthResponseBody, DenialReason, HandshakeKind,
    HandshakePacket, Salts, HANDSHAKE_MAGIC, MAX_MTU, MIN_MTU, NORMAL_HEADER_SIZE,
};
use crate::shared::{ChannelId, ErrorType, NetworkError, NetworkResult, PeerId};

/// A client refuses challenges beyond this many hash rounds outright.
const CHALLENGE_REPETITION_CEILING: u32 = 1 << 20;

/// What one `service` call produced.
#[derive(Debug)]
pub enum ServiceResult {
    Event(HostEvent),
    Timeout,
    Interrupt,
    Error(ErrorType),
}

/// Validates the clear-text connection token of a ConnectionRequest.
pub type ConnectionTokenValidator =
    Box<dyn FnMut(&[u8; protocol::CONNECTION_TOKEN_SIZE], SocketAddr) -> bool>;

/// Validates the authenticated token of an AuthenticationResponse.
pub type AuthenticationTokenValidator = Box<dyn FnMut(&[u8; protocol::AUTHENTICATION_TOKEN_SIZE]) -> bool>;

/// Extra knobs for `Host::connect_with`.
pub struct ConnectOptions {
    /// 64 bit application payload delivered inside the AuthenticationResponse.
    pub data: u64,
    pub connection_token: [u8; protocol::CONNECTION_TOKEN_SIZE],
    pub authentication_token: [u8; protocol::AUTHENTICATION_TOKEN_SIZE],
    /// When set, the remote's long term identity must match or the handshake dies.
    pub expected_identity: Option<[u8; crypto::SIGN_PUBLIC_KEY_SIZE]>,
}

impl Default for ConnectOptions {
    fn default() -> ConnectOptions {
        ConnectOptions {
            data: 0,
            connection_token: [0; protocol::CONNECTION_TOKEN_SIZE],
            authentication_token: [0; protocol::AUTHENTICATION_TOKEN_SIZE],
            expected_identity: None,
        }
    }
}

/// A local UDP endpoint and every peer it serves. Single threaded; all state
/// mutation happens inside `service`/`flush`/`connect` on the owning thread.
pub struct Host {
    config: HostConfig,
    protocol_id: u64,
    identity: Identity,
    log: Logger,

    network: Box<dyn Network>,
    compressor: Option<Box<dyn Compressor>>,

    peers: Vec<Option<Peer>>,
    free_ids: Vec<PeerId>,
    to_free: Vec<PeerId>,

    events: VecDeque<HostEvent>,

    candidates: Vec<Option<Candidate>>,
    known_addresses: Vec<Option<KnownAddress>>,
    attempts: AttemptHistory,

    connection_token_validator: Option<ConnectionTokenValidator>,
    authentication_token_validator: Option<AuthenticationTokenValidator>,

    host_limiter: RateLimiter,
    incoming_tracker: BandwidthTracker,
    outgoing_tracker: BandwidthTracker,

    time_base: Instant,
}

impl Host {
    pub fn new(
        config: HostConfig,
        mut network: Box<dyn Network>,
        identity: Identity,
        log: &Logger,
    ) -> NetworkResult<Host> {
        config.validate()?;

        network.set_dont_fragment(!config.mtu_do_fragment)?;

        let host_log = log.new(logging::o!("host" => format!("{}", network.local_addr())));
        let host_limiter = RateLimiter::new(u64::from(config.outgoing_bandwidth_limit), 1_000, 1);

        Ok(Host {
            protocol_id: config.protocol_id,
            config,
            identity,
            log: host_log,
            network,
            compressor: None,
            peers: Vec::new(),
            free_ids: Vec::new(),
            to_free: Vec::new(),
            events: VecDeque::new(),
            candidates: (0..TABLE_SIZE).map(|_| None).collect(),
            known_addresses: (0..TABLE_SIZE).map(|_| None).collect(),
            attempts: AttemptHistory::new(),
            connection_token_validator: None,
            authentication_token_validator: None,
            host_limiter,
            incoming_tracker: BandwidthTracker::new(1),
            outgoing_tracker: BandwidthTracker::new(1),
            time_base: Instant::now(),
        })
    }

    /// Attaches a payload compressor; frames it shrinks get the compressed flag.
    pub fn set_compressor(&mut self, compressor: Box<dyn Compressor>) {
        self.compressor = Some(compressor);
    }

    pub fn set_connection_token_validator(&mut self, validator: ConnectionTokenValidator) {
        self.connection_token_validator = Some(validator);
    }

    pub fn set_authentication_token_validator(&mut self, validator: AuthenticationTokenValidator) {
        self.authentication_token_validator = Some(validator);
    }

    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.network.local_addr()
    }

    #[inline]
    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Monotonic engine time in milliseconds, starting at one.
    #[inline]
    pub fn now_ms(&self) -> u64 {
        self.time_base.elapsed().as_millis() as u64 + 1
    }

    /// A handle that makes a blocking `service` call return `Interrupt`; usable
    /// from any thread.
    pub fn interrupter(&self) -> Interrupter {
        self.network.interrupter()
    }

    #[inline]
    pub fn peer(&self, id: PeerId) -> Option<&Peer> {
        self.peers.get(usize::from(id)).and_then(Option::as_ref)
    }

    fn peer_mut(&mut self, id: PeerId) -> Option<&mut Peer> {
        self.peers.get_mut(usize::from(id)).and_then(Option::as_mut)
    }

    fn live_peer_count(&self) -> usize {
        self.peers.iter().filter(|slot| slot.is_some()).count()
    }

    fn allocate_peer_id(&mut self) -> Option<PeerId> {
        if self.live_peer_count() >= usize::from(self.config.max_peers) {
            return None;
        }

        if let Some(id) = self.free_ids.pop() {
            return Some(id);
        }

        if self.peers.len() >= usize::from(u16::max_value()) {
            return None;
        }

        self.peers.push(None);
        Some((self.peers.len() - 1) as PeerId)
    }

    /// Starts a handshake towards `addr` using the first `channel_count` of the
    /// host's configured channel kinds.
    pub fn connect(&mut self, addr: SocketAddr, channel_count: u8, data: u64) -> NetworkResult<PeerId> {
        let mut options = ConnectOptions::default();
        options.data = data;
        self.connect_with(addr, channel_count, options)
    }

    pub fn connect_with(
        &mut self,
        addr: SocketAddr,
        channel_count: u8,
        options: ConnectOptions,
    ) -> NetworkResult<PeerId> {
        if channel_count == 0 || usize::from(channel_count) > self.config.channel_kinds.len() {
            return Err(NetworkError::Fatal(ErrorType::UnknownChannel));
        }

        let now = self.now_ms();
        let id = self
            .allocate_peer_id()
            .ok_or(NetworkError::Fatal(ErrorType::Capacity))?;

        let mut peer = Peer::new(id, addr, &self.config, channel_count, now, &self.log);
        peer.state = PeerState::Requesting;
        peer.initiator = true;
        peer.connection_token = options.connection_token;
        peer.authentication_token = options.authentication_token;
        peer.expected_identity = options.expected_identity;
        peer.application_data = options.data;
        peer.handshake_started_at = now;
        peer.rebuild_connection_request(&self.config, self.protocol_id);
        peer.send_cached_handshake(&mut *self.network, now);

        logging::debug!(self.log, "connecting"; "addr" => %addr, "peer" => id);

        self.peers[usize::from(id)] = Some(peer);
        Ok(id)
    }

    /// Queues a message on one channel of one peer.
    pub fn send(&mut self, id: PeerId, channel: ChannelId, message: &Message) -> NetworkResult<()> {
        let config = &self.config;

        match self.peers.get_mut(usize::from(id)).and_then(Option::as_mut) {
            Some(peer) => peer.send_message(channel, message, config),
            None => Err(NetworkError::Fatal(ErrorType::InvalidState)),
        }
    }

    /// Shares one message across every connected peer; the payload is reference
    /// counted, not copied per peer.
    pub fn broadcast(&mut self, channel: ChannelId, message: &Message) {
        let config = &self.config;

        for slot in self.peers.iter_mut() {
            if let Some(peer) = slot {
                if peer.state() == PeerState::Connected {
                    let _ = peer.send_message(channel, message, config);
                }
            }
        }
    }

    /// Starts the graceful disconnect sequence towards a peer.
    pub fn disconnect(&mut self, id: PeerId, data: u64) {
        let now = self.now_ms();
        if let Some(peer) = self.peer_mut(id) {
            peer.disconnect(data, false, now);
        }
    }

    /// Like `disconnect`, but only after all pending reliable traffic is flushed
    /// and acknowledged.
    pub fn disconnect_later(&mut self, id: PeerId, data: u64) {
        let now = self.now_ms();
        if let Some(peer) = self.peer_mut(id) {
            peer.disconnect(data, true, now);
        }
    }

    /// Triggers an MTU discovery walk on a connected peer.
    pub fn start_mtu_probe(&mut self, id: PeerId) {
        let now = self.now_ms();
        if let Some(peer) = self.peer_mut(id) {
            peer.start_mtu_probe(now);
        }
    }

    /// Applies new bandwidth limits and broadcasts them to every live peer.
    pub fn set_bandwidth_limits(&mut self, incoming: u32, outgoing: u32) {
        let now = self.now_ms();

        self.config.incoming_bandwidth_limit = incoming;
        self.config.outgoing_bandwidth_limit = outgoing;
        self.host_limiter.reconfigure(u64::from(outgoing), 1_000, now);

        for slot in self.peers.iter_mut() {
            if let Some(peer) = slot {
                if peer.state() == PeerState::Connected {
                    peer.set_bandwidth_limits(incoming, outgoing, now);
                }
            }
        }
    }

    /// One non-blocking engine iteration; never waits and never consumes events.
    pub fn flush(&mut self) -> NetworkResult<()> {
        match self.service(0) {
            ServiceResult::Error(error) => Err(NetworkError::Fatal(error)),
            _ => Ok(()),
        }
    }

    /// Pops a pending event without doing any engine work.
    pub fn check_events(&mut self) -> ServiceResult {
        self.service(-1)
    }

    /// Drives the engine. Negative timeout only drains queued events; zero runs
    /// exactly one non-blocking iteration; positive blocks on the socket until an
    /// event, the timeout or an interrupt.
    pub fn service(&mut self, timeout_ms: i64) -> ServiceResult {
        if timeout_ms < 0 {
            self.free_pending();
            return match self.events.pop_front() {
                Some(event) => ServiceResult::Event(event),
                None => ServiceResult::Timeout,
            };
        }

        if timeout_ms == 0 {
            self.free_pending();
            let now = self.now_ms();
            self.update_trackers(now);
            self.dispatch_peers(now);

            if let Err(error) = self.receive_packets(now) {
                return ServiceResult::Error(error);
            }

            self.dispatch_peers(now);
            return ServiceResult::Timeout;
        }

        let deadline = self.now_ms().wrapping_add(timeout_ms as u64);

        loop {
            self.free_pending();

            if let Some(event) = self.events.pop_front() {
                return ServiceResult::Event(event);
            }

            let now = self.now_ms();
            self.update_trackers(now);

            self.dispatch_peers(now);

            if let Err(error) = self.receive_packets(now) {
                return ServiceResult::Error(error);
            }

            let next_time = self.dispatch_peers(now);

            if !self.events.is_empty() {
                continue;
            }

            let now = self.now_ms();
            if !brine::time::time_before(now, deadline) {
                return ServiceResult::Timeout;
            }

            // Work is already due: run another iteration without waiting
            if !brine::time::time_before(now, next_time) {
                continue;
            }

            let until = deadline.min(next_time);
            let wait = Duration::from_millis(until.saturating_sub(now).max(1));

            match self.network.wait(Some(wait)) {
                Ok(WaitOutcome::Interrupt) => return ServiceResult::Interrupt,
                Ok(_) => {}
                Err(NetworkError::Fatal(error)) => return ServiceResult::Error(error),
                Err(NetworkError::Wait) => {}
            }
        }
    }

    fn update_trackers(&mut self, now: u64) {
        self.incoming_tracker.update(now);
        self.outgoing_tracker.update(now);
    }

    fn free_pending(&mut self) {
        while let Some(id) = self.to_free.pop() {
            let slot = usize::from(id);
            if let Some(peer) = self.peers.get_mut(slot).and_then(Option::take) {
                logging::debug!(self.log, "peer freed"; "peer" => id, "state" => ?peer.state());
                self.release_candidate_for(&peer);
                self.free_ids.push(id);
            }
        }
    }

    fn release_candidate_for(&mut self, peer: &Peer) {
        let index = candidate_index(&peer.addr, peer.remote_salt);

        let clear = match &self.candidates[index] {
            Some(candidate) => candidate.peer == Some(peer.id),
            None => false,
        };

        if clear {
            self.candidates[index] = None;
        }
    }

    /// Runs the per-peer dispatch over every live peer and collects the earliest
    /// next deadline.
    fn dispatch_peers(&mut self, now: u64) -> u64 {
        let mut next_time = now.wrapping_add(self.config.ping_interval.max(100));

        let Host {
            ref config,
            protocol_id,
            ref mut network,
            ref mut compressor,
            ref mut peers,
            ref mut events,
            ref mut host_limiter,
            ref mut outgoing_tracker,
            ref mut to_free,
            ..
        } = *self;

        for slot in peers.iter_mut() {
            let peer = match slot {
                Some(peer) => peer,
                None => continue,
            };

            let mut ctx = DispatchContext {
                now,
                config,
                protocol_id,
                network: &mut **network,
                compressor: compressor.as_mut(),
                events,
                host_limiter,
                host_tracker: outgoing_tracker,
            };

            let deadline = peer.dispatch(&mut ctx);

            if brine::time::time_before(deadline, next_time) {
                next_time = deadline;
            }

            if peer.should_free() && !to_free.contains(&peer.id) {
                to_free.push(peer.id);
            }
        }

        // Candidate slots for peers that finished the handshake implicitly
        let done: Vec<PeerId> = self
            .peers
            .iter()
            .filter_map(|slot| slot.as_ref())
            .filter(|peer| peer.candidate_done)
            .map(|peer| peer.id)
            .collect();

        for id in done {
            if let Some(peer) = self.peers[usize::from(id)].take() {
                self.release_candidate_for(&peer);
                self.peers[usize::from(id)] = Some(peer);
            }
            if let Some(peer) = self.peer_mut(id) {
                peer.candidate_done = false;
            }
        }

        next_time
    }

    /// Drains the socket, classifying each datagram as handshake or normal traffic.
    fn receive_packets(&mut self, now: u64) -> Result<(), ErrorType> {
        let mut buf = vec![0u8; 65_536];

        loop {
            let (count, from) = match self.network.recv_from(&mut buf) {
                Ok(received) => received,
                Err(NetworkError::Wait) => return Ok(()),
                Err(NetworkError::Fatal(error)) => return Err(error),
            };

            self.incoming_tracker.add(count as u64);
            self.route_packet(&buf[..count], from, now);
        }
    }

    fn route_packet(&mut self, packet: &[u8], from: SocketAddr, now: u64) {
        if packet.len() >= 4 && packet[..4] == HANDSHAKE_MAGIC {
            if let Some(parsed) = HandshakePacket::read(packet, self.protocol_id) {
                self.dispatch_handshake(packet, parsed, from, now);
            }
            return;
        }

        if packet.len() < NORMAL_HEADER_SIZE || packet[3] == 0xFF {
            return;
        }

        let peer_id = u16::from_le_bytes([packet[0], packet[1]]);

        if let Some(peer) = self.peer_mut(peer_id) {
            if peer.addr == from {
                peer.queue_incoming(packet.to_vec());
            }
        }
    }

    fn dispatch_handshake(
        &mut self,
        raw: &[u8],
        packet: HandshakePacket,
        from: SocketAddr,
        now: u64,
    ) {
        match packet {
            HandshakePacket::ConnectionRequest(body) => {
                self.server_on_connection_request(body, from, now)
            }
            HandshakePacket::ChallengeRequest(body) => self.client_on_challenge_request(body, from),
            HandshakePacket::ChallengeResponse(body) => {
                self.server_on_challenge_response(body, from, now)
            }
            HandshakePacket::AuthenticationRequest(body) => {
                self.client_on_authentication_request(body, from)
            }
            HandshakePacket::AuthenticationResponse(body) => {
                self.server_on_authentication_response(body, from, now)
            }
            HandshakePacket::ApprovalResponse(body) => self.client_on_approval_response(body, from, now),
            HandshakePacket::DenialResponse(body) => self.client_on_denial_response(body, from),
            HandshakePacket::ApprovalAcknowledge(body) => {
                self.server_on_acknowledge(raw, body, from, now)
            }
            // Reserved: accepted and discarded
            HandshakePacket::DenialAcknowledge(_) => {}
        }
    }

    // ---- server side -------------------------------------------------------

    fn server_on_connection_request(
        &mut self,
        body: protocol::ConnectionRequest,
        from: SocketAddr,
        now: u64,
    ) {
        if !self.admit_source_address(from, now) {
            return;
        }

        self.attempts.record(now);

        if self.config.check_connection_tokens {
            match self.connection_token_validator.as_mut() {
                Some(validator) => {
                    if !validator(&body.token, from) {
                        return;
                    }
                }
                // Checking enabled with nothing to check against rejects everything
                None => return,
            }
        }

        let index = candidate_index(&from, body.salt);
        let pending_timeout = self.config.pending_connection_timeout;

        enum SlotAction {
            Resend,
            Drop,
            Create,
        }

        let action = match &self.candidates[index] {
            Some(candidate)
                if candidate.addr == from
                    && candidate.remote_salt == body.salt
                    && !candidate.expired(now, pending_timeout) =>
            {
                SlotAction::Resend
            }
            Some(candidate) if !candidate.expired(now, pending_timeout) => SlotAction::Drop,
            _ => SlotAction::Create,
        };

        match action {
            SlotAction::Drop => {}
            SlotAction::Resend => {
                let candidate = self.candidates[index].as_ref().unwrap();
                let _ = self.network.send_to(&candidate.cached_response, from);
            }
            SlotAction::Create => {
                let mut candidate = Candidate::new(from, body.salt, body.peer_id, now);
                candidate.remote_incoming_bandwidth = body.incoming_bandwidth;
                candidate.remote_outgoing_bandwidth = body.outgoing_bandwidth;
                candidate.repetitions = self.attempts.repetitions(
                    self.config.challenge_difficulty_factor,
                    self.config.minimum_challenge_repetitions,
                    self.config.maximum_challenge_repetitions,
                );

                let packet = HandshakePacket::ChallengeRequest(protocol::ChallengeRequest {
                    salts: Salts {
                        local: candidate.local_salt,
                        remote: candidate.remote_salt,
                    },
                    incoming_bandwidth: self.config.incoming_bandwidth_limit,
                    outgoing_bandwidth: self.config.outgoing_bandwidth_limit,
                    challenge: candidate.challenge,
                    repetitions: candidate.repetitions,
                })
                .write(self.protocol_id);

                let _ = self.network.send_to(&packet, from);
                self.outgoing_tracker.add(packet.len() as u64);

                candidate.cached_response = packet;
                self.candidates[index] = Some(candidate);

                logging::trace!(self.log, "challenge issued"; "addr" => %from);
            }
        }
    }

    /// Burst and period throttling per source address, in a fixed overwrite-expired
    /// table so a flood costs no memory.
    fn admit_source_address(&mut self, from: SocketAddr, now: u64) -> bool {
        let index = known_address_index(&from);
        let burst = self.config.rate_limiter_host_address_burst;
        let period = self.config.rate_limiter_host_address_period;

        enum SlotAction {
            Admit,
            Reject,
            Claim,
        }

        let action = match &mut self.known_addresses[index] {
            Some(known) if known.addr == from => {
                if known.limiter.can_proceed(1, now) {
                    known.limiter.add_amount(1);
                    known.last_attempt = now;
                    SlotAction::Admit
                } else {
                    SlotAction::Reject
                }
            }
            Some(known) => {
                // Foreign entry: reclaim only once it has gone stale
                if now.wrapping_sub(known.last_attempt) >= period.saturating_mul(2) {
                    SlotAction::Claim
                } else {
                    SlotAction::Reject
                }
            }
            None => SlotAction::Claim,
        };

        match action {
            SlotAction::Admit => true,
            SlotAction::Reject => false,
            SlotAction::Claim => {
                let mut limiter = RateLimiter::new(burst, period, now);
                limiter.add_amount(1);

                self.known_addresses[index] = Some(KnownAddress {
                    addr: from,
                    limiter,
                    last_attempt: now,
                });

                true
            }
        }
    }

    fn server_on_challenge_response(
        &mut self,
        body: protocol::ChallengeResponse,
        from: SocketAddr,
        now: u64,
    ) {
        let index = candidate_index(&from, body.salts.local);
        let pending_timeout = self.config.pending_connection_timeout;
        let mtu = self.config.mtu;

        let candidate = match &mut self.candidates[index] {
            Some(candidate)
                if candidate.matches(from, body.salts)
                    && !candidate.expired(now, pending_timeout) =>
            {
                candidate
            }
            _ => return,
        };

        if candidate.stage != CandidateStage::AwaitingChallengeResponse {
            // The client missed our answer: repeat the current stage's packet
            let _ = self.network.send_to(&candidate.cached_response, from);
            return;
        }

        let expected = protocol::solve_challenge(&candidate.challenge, candidate.repetitions);
        if !crypto::memcmp(&expected, &body.solved) {
            return;
        }

        let (secret, public) = crypto::exchange_keypair();
        let mut shared = [0u8; crypto::EXCHANGE_KEY_SIZE];
        if !crypto::exchange(&mut shared, &secret, &body.exchange_public) {
            return;
        }

        candidate.solved = body.solved;
        candidate.nonce = u64::from_le_bytes([
            body.solved[0],
            body.solved[1],
            body.solved[2],
            body.solved[3],
            body.solved[4],
            body.solved[5],
            body.solved[6],
            body.solved[7],
        ]);
        candidate.exchange_secret = secret;
        candidate.exchange_public = public;
        candidate.remote_exchange_public = body.exchange_public;
        candidate.shared_key = crypto::derive_key(&shared);

        let mut sign_input = [0u8; crypto::EXCHANGE_KEY_SIZE * 2];
        sign_input[..crypto::EXCHANGE_KEY_SIZE].copy_from_slice(&public);
        sign_input[crypto::EXCHANGE_KEY_SIZE..].copy_from_slice(&body.exchange_public);
        let signature = self.identity.sign(&sign_input);

        let auth_body = AuthRequestBody {
            identity: *self.identity.public,
            signature,
            mtu,
        };

        let salts = Salts {
            local: candidate.local_salt,
            remote: candidate.remote_salt,
        };

        let nonce = handshake_nonce(
            candidate.nonce,
            HandshakeKind::AuthenticationRequest as u8,
            salts,
        );

        let mut cipher = [0u8; protocol::AUTH_REQUEST_CIPHER_SIZE];
        if !crypto::encrypt(
            &mut cipher,
            &auth_body.write(),
            &candidate.solved,
            &nonce,
            &candidate.shared_key,
        ) {
            return;
        }

        let packet = HandshakePacket::AuthenticationRequest(protocol::AuthenticationRequest {
            salts,
            exchange_public: public,
            cipher,
        })
        .write(self.protocol_id);

        let _ = self.network.send_to(&packet, from);
        self.outgoing_tracker.add(packet.len() as u64);

        candidate.cached_response = packet;
        candidate.stage = CandidateStage::AwaitingAuthenticationResponse;

        logging::trace!(self.log, "challenge solved, authentication sent"; "addr" => %from);
    }

    fn server_on_authentication_response(
        &mut self,
        body: protocol::AuthenticationResponse,
        from: SocketAddr,
        now: u64,
    ) {
        let index = candidate_index(&from, body.salts.local);
        let pending_timeout = self.config.pending_connection_timeout;

        // Copy what the admission path needs, releasing the table borrow
        let (nonce, solved, shared_key, remote_exchange_public, exchange_public) =
            match &self.candidates[index] {
                Some(candidate)
                    if candidate.matches(from, body.salts)
                        && !candidate.expired(now, pending_timeout) =>
                {
                    if candidate.stage == CandidateStage::AwaitingAcknowledge {
                        let _ = self.network.send_to(&candidate.cached_response, from);
                        return;
                    }

                    if candidate.stage != CandidateStage::AwaitingAuthenticationResponse {
                        return;
                    }

                    (
                        candidate.nonce,
                        candidate.solved,
                        candidate.shared_key,
                        candidate.remote_exchange_public,
                        candidate.exchange_public,
                    )
                }
                _ => return,
            };

        let client_salts = body.salts;

        let nonce_bytes = handshake_nonce(
            nonce,
            HandshakeKind::AuthenticationResponse as u8,
            client_salts,
        );

        let mut plain = [0u8; protocol::AUTH_RESPONSE_BODY_SIZE];
        if !crypto::decrypt(&mut plain, &body.cipher, &solved, &nonce_bytes, &shared_key) {
            return;
        }

        let auth = AuthResponseBody::read(&plain);

        let mut sign_input = [0u8; crypto::EXCHANGE_KEY_SIZE * 2];
        sign_input[..crypto::EXCHANGE_KEY_SIZE].copy_from_slice(&remote_exchange_public);
        sign_input[crypto::EXCHANGE_KEY_SIZE..].copy_from_slice(&exchange_public);

        if !crypto::sign_verify(&auth.signature, &sign_input, &auth.identity) {
            return;
        }

        let server_salts = client_salts.flipped();

        if let Some(reason) = self.admission_denial(&auth) {
            logging::debug!(self.log, "connection denied"; "addr" => %from, "reason" => ?reason);

            let packet = HandshakePacket::DenialResponse(protocol::DenialResponse {
                salts: server_salts,
                reason,
            })
            .write(self.protocol_id);

            let _ = self.network.send_to(&packet, from);
            self.candidates[index] = None;
            return;
        }

        let id = match self.allocate_peer_id() {
            Some(id) => id,
            None => {
                let packet = HandshakePacket::DenialResponse(protocol::DenialResponse {
                    salts: server_salts,
                    reason: DenialReason::Full,
                })
                .write(self.protocol_id);

                let _ = self.network.send_to(&packet, from);
                self.candidates[index] = None;
                return;
            }
        };

        let candidate = self.candidates[index].as_ref().unwrap();

        let mut peer = Peer::new(id, from, &self.config, auth.channel_count, now, &self.log);
        peer.state = PeerState::Approving;
        peer.local_salt = candidate.local_salt;
        peer.remote_salt = candidate.remote_salt;
        peer.connection_nonce = candidate.nonce;
        peer.solved_challenge = candidate.solved;
        peer.exchange_secret = candidate.exchange_secret;
        peer.exchange_public = candidate.exchange_public;
        peer.remote_exchange_public = candidate.remote_exchange_public;
        peer.shared_key = candidate.shared_key;
        peer.remote_identity = auth.identity;
        peer.application_data = auth.application_data;
        peer.remote_id = candidate.client_peer_id;
        peer.handshake_started_at = now;
        peer.set_mtu(u16::min(self.config.mtu, auth.mtu).max(MIN_MTU).min(MAX_MTU));

        if candidate.remote_incoming_bandwidth > 0 {
            peer.cap_outgoing_bandwidth(candidate.remote_incoming_bandwidth, now);
        }

        let approval_nonce = handshake_nonce(
            nonce,
            HandshakeKind::ApprovalResponse as u8,
            server_salts,
        );

        let mut approval_cipher = [0u8; protocol::APPROVAL_CIPHER_SIZE];
        if !crypto::encrypt(
            &mut approval_cipher,
            &id.to_le_bytes(),
            &solved,
            &approval_nonce,
            &shared_key,
        ) {
            self.candidates[index] = None;
            return;
        }

        let packet = HandshakePacket::ApprovalResponse(protocol::ApprovalResponse {
            salts: server_salts,
            cipher: approval_cipher,
        })
        .write(self.protocol_id);

        let _ = self.network.send_to(&packet, from);
        self.outgoing_tracker.add(packet.len() as u64);

        peer.cached_handshake = Some(packet.clone());
        peer.handshake_sent_at = now;

        self.peers[usize::from(id)] = Some(peer);

        let candidate = self.candidates[index].as_mut().unwrap();
        candidate.cached_response = packet;
        candidate.stage = CandidateStage::AwaitingAcknowledge;
        candidate.peer = Some(id);

        logging::debug!(self.log, "connection approved"; "addr" => %from, "peer" => id);
    }

    /// The admission checks of the approval step, in denial order.
    fn admission_denial(&mut self, auth: &AuthResponseBody) -> Option<DenialReason> {
        if auth.channel_count == 0 {
            return Some(DenialReason::TooFewChannels);
        }

        if usize::from(auth.channel_count) > self.config.channel_kinds.len() {
            return Some(DenialReason::TooManyChannels);
        }

        let expected = self.config.channel_kind_bytes();
        let count = usize::from(auth.channel_count);
        if !crypto::memcmp(&expected[..count], &auth.channel_kinds[..count]) {
            return Some(DenialReason::WrongChannelTypes);
        }

        if self.live_peer_count() >= usize::from(self.config.max_peers) {
            return Some(DenialReason::Full);
        }

        if self.config.check_authentication_tokens {
            match self.authentication_token_validator.as_mut() {
                Some(validator) => {
                    if !validator(&auth.token) {
                        return Some(DenialReason::Unauthorized);
                    }
                }
                None => return Some(DenialReason::Unauthorized),
            }
        }

        None
    }

    fn server_on_acknowledge(
        &mut self,
        raw: &[u8],
        body: protocol::ApprovalAcknowledge,
        from: SocketAddr,
        now: u64,
    ) {
        let index = candidate_index(&from, body.salts.local);
        let pending_timeout = self.config.pending_connection_timeout;

        let (shared_key, peer_id) = match &self.candidates[index] {
            Some(candidate)
                if candidate.matches(from, body.salts)
                    && candidate.stage == CandidateStage::AwaitingAcknowledge
                    && !candidate.expired(now, pending_timeout) =>
            {
                (candidate.shared_key, candidate.peer)
            }
            _ => return,
        };

        let input = protocol::acknowledge_mac_input(raw);
        if !crypto::onetimeauth_verify(&body.mac, &input, &shared_key) {
            return;
        }

        self.candidates[index] = None;

        if let Some(id) = peer_id {
            let events = &mut self.events;
            if let Some(peer) = self.peers.get_mut(usize::from(id)).and_then(Option::as_mut) {
                peer.promote_connected(events, now);
                peer.candidate_done = false;
            }
        }
    }

    // ---- client side -------------------------------------------------------

    /// Finds the local peer a server-sent handshake packet belongs to: the address
    /// matches, our salt is echoed, and the server salt is consistent.
    fn find_client_peer(&mut self, from: SocketAddr, salts: Salts) -> Option<usize> {
        self.peers.iter().position(|slot| match slot {
            Some(peer) => {
                peer.addr == from
                    && peer.local_salt == salts.remote
                    && (peer.remote_salt == 0 || peer.remote_salt == salts.local)
            }
            None => false,
        })
    }

    fn client_on_challenge_request(&mut self, body: protocol::ChallengeRequest, from: SocketAddr) {
        if body.repetitions == 0 || body.repetitions > CHALLENGE_REPETITION_CEILING {
            return;
        }

        let position = match self.find_client_peer(from, body.salts) {
            Some(position) => position,
            None => return,
        };

        let now = self.now_ms();
        let protocol_id = self.protocol_id;

        let peer = self.peers[position].as_mut().unwrap();

        if peer.state != PeerState::Requesting {
            return;
        }

        peer.remote_salt = body.salts.local;
        peer.solved_challenge = protocol::solve_challenge(&body.challenge, body.repetitions);
        peer.connection_nonce = u64::from_le_bytes([
            peer.solved_challenge[0],
            peer.solved_challenge[1],
            peer.solved_challenge[2],
            peer.solved_challenge[3],
            peer.solved_challenge[4],
            peer.solved_challenge[5],
            peer.solved_challenge[6],
            peer.solved_challenge[7],
        ]);

        let (secret, public) = crypto::exchange_keypair();
        peer.exchange_secret = secret;
        peer.exchange_public = public;

        if body.incoming_bandwidth > 0 {
            peer.cap_outgoing_bandwidth(body.incoming_bandwidth, now);
        }

        let packet = HandshakePacket::ChallengeResponse(protocol::ChallengeResponse {
            salts: Salts {
                local: peer.local_salt,
                remote: peer.remote_salt,
            },
            solved: peer.solved_challenge,
            exchange_public: public,
        })
        .write(protocol_id);

        peer.cached_handshake = Some(packet);
        peer.state = PeerState::Challenging;
        peer.send_cached_handshake(&mut *self.network, now);
    }

    fn client_on_authentication_request(
        &mut self,
        body: protocol::AuthenticationRequest,
        from: SocketAddr,
    ) {
        let position = match self.find_client_peer(from, body.salts) {
            Some(position) => position,
            None => return,
        };

        let now = self.now_ms();
        let protocol_id = self.protocol_id;
        let config_mtu = self.config.mtu;
        let kind_bytes = self.config.channel_kind_bytes();
        let identity_public = *self.identity.public;

        let peer = self.peers[position].as_mut().unwrap();

        match peer.state {
            PeerState::Challenging => {}
            // Our response got lost: repeat it
            PeerState::Authenticating => {
                peer.send_cached_handshake(&mut *self.network, now);
                return;
            }
            _ => return,
        }

        let mut shared = [0u8; crypto::EXCHANGE_KEY_SIZE];
        if !crypto::exchange(&mut shared, &peer.exchange_secret, &body.exchange_public) {
            return;
        }
        let shared_key = crypto::derive_key(&shared);

        // Sender (server) perspective salts
        let server_salts = Salts {
            local: peer.remote_salt,
            remote: peer.local_salt,
        };

        let nonce = handshake_nonce(
            peer.connection_nonce,
            HandshakeKind::AuthenticationRequest as u8,
            server_salts,
        );

        let mut plain = [0u8; protocol::AUTH_REQUEST_BODY_SIZE];
        if !crypto::decrypt(
            &mut plain,
            &body.cipher,
            &peer.solved_challenge,
            &nonce,
            &shared_key,
        ) {
            return;
        }

        let auth = AuthRequestBody::read(&plain);

        let mut sign_input = [0u8; crypto::EXCHANGE_KEY_SIZE * 2];
        sign_input[..crypto::EXCHANGE_KEY_SIZE].copy_from_slice(&body.exchange_public);
        sign_input[crypto::EXCHANGE_KEY_SIZE..].copy_from_slice(&peer.exchange_public);

        if !crypto::sign_verify(&auth.signature, &sign_input, &auth.identity) {
            return;
        }

        if let Some(expected) = &peer.expected_identity {
            if !crypto::memcmp(expected, &auth.identity) {
                return;
            }
        }

        peer.shared_key = shared_key;
        peer.remote_exchange_public = body.exchange_public;
        peer.remote_identity = auth.identity;
        peer.set_mtu(u16::min(peer.mtu(), auth.mtu).max(MIN_MTU).min(MAX_MTU));

        // Sign the key pair in the reverse order
        let mut response_input = [0u8; crypto::EXCHANGE_KEY_SIZE * 2];
        response_input[..crypto::EXCHANGE_KEY_SIZE].copy_from_slice(&peer.exchange_public);
        response_input[crypto::EXCHANGE_KEY_SIZE..].copy_from_slice(&body.exchange_public);
        let signature = self.identity.sign(&response_input);

        let response = AuthResponseBody {
            identity: identity_public,
            signature,
            token: peer.authentication_token,
            mtu: config_mtu,
            channel_count: peer.channel_count,
            channel_kinds: kind_bytes,
            application_data: peer.application_data,
        };

        let client_salts = server_salts.flipped();

        let response_nonce = handshake_nonce(
            peer.connection_nonce,
            HandshakeKind::AuthenticationResponse as u8,
            client_salts,
        );

        let mut cipher = [0u8; protocol::AUTH_RESPONSE_CIPHER_SIZE];
        if !crypto::encrypt(
            &mut cipher,
            &response.write(),
            &peer.solved_challenge,
            &response_nonce,
            &peer.shared_key,
        ) {
            return;
        }

        let packet = HandshakePacket::AuthenticationResponse(protocol::AuthenticationResponse {
            salts: client_salts,
            cipher,
        })
        .write(protocol_id);

        peer.cached_handshake = Some(packet);
        peer.state = PeerState::Authenticating;
        peer.send_cached_handshake(&mut *self.network, now);
    }

    fn client_on_approval_response(
        &mut self,
        body: protocol::ApprovalResponse,
        from: SocketAddr,
        now: u64,
    ) {
        let position = match self.find_client_peer(from, body.salts) {
            Some(position) => position,
            None => return,
        };

        let protocol_id = self.protocol_id;
        let events = &mut self.events;

        let peer = self.peers[position].as_mut().unwrap();

        let duplicate = peer.state == PeerState::Connected;
        if !duplicate && peer.state != PeerState::Authenticating {
            return;
        }

        let nonce = handshake_nonce(
            peer.connection_nonce,
            HandshakeKind::ApprovalResponse as u8,
            Salts {
                local: peer.remote_salt,
                remote: peer.local_salt,
            },
        );

        let mut plain = [0u8; protocol::APPROVAL_BODY_SIZE];
        if !crypto::decrypt(
            &mut plain,
            &body.cipher,
            &peer.solved_challenge,
            &nonce,
            &peer.shared_key,
        ) {
            return;
        }

        peer.remote_id = u16::from_le_bytes(plain);

        // Build and MAC the acknowledge
        let mut packet = HandshakePacket::ApprovalAcknowledge(protocol::ApprovalAcknowledge {
            salts: Salts {
                local: peer.local_salt,
                remote: peer.remote_salt,
            },
            mac: [0; 16],
        })
        .write(protocol_id);

        let mac = crypto::onetimeauth(&protocol::acknowledge_mac_input(&packet), &peer.shared_key);
        protocol::patch_acknowledge_mac(&mut packet, &mac);

        let _ = self.network.send_to(&packet, from);

        if !duplicate {
            events.push_back(HostEvent::Approval { peer: peer.id });
            peer.promote_connected(events, now);
            peer.candidate_done = false;
        }
    }

    fn client_on_denial_response(&mut self, body: protocol::DenialResponse, from: SocketAddr) {
        let position = match self.find_client_peer(from, body.salts) {
            Some(position) => position,
            None => return,
        };

        let events = &mut self.events;
        let peer = self.peers[position].as_mut().unwrap();

        if !peer.state.is_pending() {
            return;
        }

        logging::debug!(self.log, "connection denied by remote"; "reason" => ?body.reason);

        events.push_back(HostEvent::Denial {
            peer: peer.id,
            reason: body.reason,
        });

        peer.mark_disconnected();
    }

    /// The channel kinds a given peer runs with; `None` when the peer is gone.
    pub fn peer_channel_kinds(&self, id: PeerId) -> Option<Vec<ChannelKind>> {
        self.peer(id).map(|peer| {
            self.config
                .channel_kinds
                .iter()
                .take(usize::from(peer.channel_count))
                .copied()
                .collect()
        })
    }
}
