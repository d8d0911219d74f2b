use std::collections::VecDeque;
use std::net::SocketAddr;

use brine::crypto;
use brine::logging::{self, Logger};
use brine::rate::{BandwidthTracker, RateLimiter};

use crate::block::{BlockReader, ControlBlock, OutgoingBlock, ParsedBlock, MTU_PROBE_HEADER_SIZE};
use crate::channel::{Channel, ChannelKind, OutgoingContext};
use crate::compress::Compressor;
use crate::config::HostConfig;
use crate::event::HostEvent;
use crate::message::Message;
use crate::network::Network;
use crate::protocol::{
    self, data_nonce, NormalHeader, FLAG_COMPRESSED, MAX_MTU, MIN_MTU, MTU_CANDIDATES,
    NORMAL_HEADER_SIZE,
};
use crate::shared::{ChannelId, ErrorType, NetworkError, NetworkResult, PeerId};

/// How often one MTU candidate is retried before falling through to the next.
const MTU_PROBE_TRIES: u32 = 3;
const MTU_PROBE_INTERVAL: u64 = 100;

/// A stale Requesting-state salt is rotated after this long.
const SALT_ROTATION_TIMEOUT: u64 = 1_000;

/// Loss statistics close their measurement window every ten seconds.
const LOSS_MEASUREMENT_WINDOW: u64 = 10_000;

/// Starting RTT estimate before the first sample, in 32.32 fixed point.
const INITIAL_RTT: i64 = 300 << 32;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PeerState {
    Disconnected,
    Requesting,
    Challenging,
    Authenticating,
    Approving,
    Connected,
    DisconnectLater,
    Disconnecting,
    DisconnectionAcking,
    DisconnectionPending,
}

impl PeerState {
    /// States where the client drives handshake retransmission.
    #[inline]
    pub(crate) fn is_pending(self) -> bool {
        match self {
            PeerState::Requesting
            | PeerState::Challenging
            | PeerState::Authenticating
            | PeerState::Approving => true,
            _ => false,
        }
    }

    #[inline]
    pub(crate) fn is_live(self) -> bool {
        match self {
            PeerState::Connected | PeerState::DisconnectLater => true,
            _ => false,
        }
    }
}

/// Sliding window of the most recently accepted encrypted packet sequence numbers.
/// Sequence numbers start at one so a zeroed slot always reads as empty.
pub struct ReplayWindow {
    slots: Vec<u64>,
    highest: u64,
    size: u64,
}

impl ReplayWindow {
    pub fn new(size: u32) -> ReplayWindow {
        ReplayWindow {
            slots: vec![0; size as usize],
            highest: 0,
            size: u64::from(size),
        }
    }

    /// True when `sequence` may still be accepted: newer than everything seen, or
    /// inside the window and not yet recorded.
    pub fn check(&self, sequence: u64) -> bool {
        if sequence == 0 {
            return false;
        }

        if sequence > self.highest {
            return true;
        }

        if sequence + self.size <= self.highest {
            return false;
        }

        let slot = (sequence % self.size) as usize;
        self.slots[slot] < sequence
    }

    /// Records an accepted sequence number. The highest value never regresses.
    pub fn commit(&mut self, sequence: u64) {
        let slot = (sequence % self.size) as usize;

        if self.slots[slot] < sequence {
            self.slots[slot] = sequence;
        }

        if sequence > self.highest {
            self.highest = sequence;
        }
    }
}

struct PingSlot {
    seq: u8,
    sent: u64,
    timeout: u64,
}

struct MtuProbe {
    /// Index into the candidate table.
    index: usize,
    tries_left: u32,
    seq: u16,
    last_send: u64,
    awaiting: bool,
}

/// Everything a peer needs from its host during one dispatch.
pub struct DispatchContext<'a> {
    pub now: u64,
    pub config: &'a HostConfig,
    pub protocol_id: u64,
    pub network: &'a mut dyn Network,
    pub compressor: Option<&'a mut Box<dyn Compressor>>,
    pub events: &'a mut VecDeque<HostEvent>,
    pub host_limiter: &'a mut RateLimiter,
    pub host_tracker: &'a mut BandwidthTracker,
}

/// Local handle for one remote endpoint: connection state machine, channel list,
/// block packet queues, statistics and the AEAD framing for everything it sends.
pub struct Peer {
    pub(crate) id: PeerId,
    pub(crate) remote_id: PeerId,
    pub(crate) addr: SocketAddr,
    pub(crate) state: PeerState,
    log: Logger,

    // Handshake material
    pub(crate) local_salt: u64,
    pub(crate) remote_salt: u64,
    pub(crate) connection_nonce: u64,
    pub(crate) solved_challenge: [u8; protocol::CHALLENGE_SIZE],
    pub(crate) exchange_secret: [u8; crypto::EXCHANGE_KEY_SIZE],
    pub(crate) exchange_public: [u8; crypto::EXCHANGE_KEY_SIZE],
    pub(crate) remote_exchange_public: [u8; crypto::EXCHANGE_KEY_SIZE],
    pub(crate) shared_key: [u8; crypto::KEY_SIZE],
    pub(crate) remote_identity: [u8; crypto::SIGN_PUBLIC_KEY_SIZE],
    pub(crate) expected_identity: Option<[u8; crypto::SIGN_PUBLIC_KEY_SIZE]>,
    pub(crate) application_data: u64,
    pub(crate) connection_token: [u8; protocol::CONNECTION_TOKEN_SIZE],
    pub(crate) authentication_token: [u8; protocol::AUTHENTICATION_TOKEN_SIZE],
    pub(crate) channel_count: u8,

    // Client-side handshake retransmission
    pub(crate) cached_handshake: Option<Vec<u8>>,
    pub(crate) handshake_sent_at: u64,
    pub(crate) handshake_started_at: u64,
    /// Set when a server-side peer leaves Approving and its candidate slot can go.
    pub(crate) candidate_done: bool,
    /// True on the side that sent the ConnectionRequest. The role picks the
    /// direction bit folded into the data phase nonce, so the two directions can
    /// never collide under the one shared key.
    pub(crate) initiator: bool,

    // Data phase crypto
    send_sequence: u64,
    replay: ReplayWindow,

    // Channels and queues
    channels: Vec<Channel>,
    outgoing: VecDeque<OutgoingBlock>,
    probe_queue: VecDeque<Vec<u8>>,
    incoming_packets: VecDeque<Vec<u8>>,

    // Timing and statistics
    last_receive_time: u64,
    rtt_mean: i64,
    rtt_variance: i64,
    loss_mean: i64,
    loss_variance: i64,
    packets_sent_window: u64,
    packets_lost_window: u64,
    loss_window_start: u64,
    rtt_samples: Vec<u64>,

    // Keep-alive
    pings: Vec<PingSlot>,
    next_ping_seq: u8,
    last_keepalive: u64,

    // Bandwidth
    limiter: RateLimiter,
    incoming_tracker: BandwidthTracker,
    outgoing_tracker: BandwidthTracker,
    limits_dirty: bool,
    limits_sent_at: u64,
    pending_limits: (u32, u32),

    // MTU
    mtu: u16,
    probe: Option<MtuProbe>,

    // Disconnect bookkeeping
    disconnect_data: u64,
    disconnect_sent_at: u64,
    disconnect_started_at: u64,
}

impl Peer {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: PeerId,
        addr: SocketAddr,
        config: &HostConfig,
        channel_count: u8,
        now: u64,
        log: &Logger,
    ) -> Peer {
        let kinds: Vec<ChannelKind> = config
            .channel_kinds
            .iter()
            .take(usize::from(channel_count))
            .copied()
            .collect();

        let channels = kinds
            .iter()
            .enumerate()
            .map(|(index, kind)| {
                Channel::new(
                    *kind,
                    index as u8,
                    config.reliable_channel_block_packet_window_size,
                    config.max_message_size as usize,
                )
            })
            .collect();

        Peer {
            id,
            remote_id: 0,
            addr,
            state: PeerState::Disconnected,
            log: log.new(logging::o!("peer" => id)),
            local_salt: crypto::random_u64(),
            remote_salt: 0,
            connection_nonce: 0,
            solved_challenge: [0; protocol::CHALLENGE_SIZE],
            exchange_secret: [0; crypto::EXCHANGE_KEY_SIZE],
            exchange_public: [0; crypto::EXCHANGE_KEY_SIZE],
            remote_exchange_public: [0; crypto::EXCHANGE_KEY_SIZE],
            shared_key: [0; crypto::KEY_SIZE],
            remote_identity: [0; crypto::SIGN_PUBLIC_KEY_SIZE],
            expected_identity: None,
            application_data: 0,
            connection_token: [0; protocol::CONNECTION_TOKEN_SIZE],
            authentication_token: [0; protocol::AUTHENTICATION_TOKEN_SIZE],
            channel_count,
            cached_handshake: None,
            handshake_sent_at: 0,
            handshake_started_at: now,
            candidate_done: false,
            initiator: false,
            send_sequence: 0,
            replay: ReplayWindow::new(config.encrypted_packet_sequence_window_size),
            channels,
            outgoing: VecDeque::new(),
            probe_queue: VecDeque::new(),
            incoming_packets: VecDeque::new(),
            last_receive_time: now,
            rtt_mean: INITIAL_RTT,
            rtt_variance: 0,
            loss_mean: 0,
            loss_variance: 0,
            packets_sent_window: 0,
            packets_lost_window: 0,
            loss_window_start: now,
            rtt_samples: Vec::new(),
            pings: Vec::new(),
            next_ping_seq: 0,
            last_keepalive: now,
            limiter: RateLimiter::new(u64::from(config.outgoing_bandwidth_limit), 1_000, now),
            incoming_tracker: BandwidthTracker::new(now),
            outgoing_tracker: BandwidthTracker::new(now),
            limits_dirty: false,
            limits_sent_at: 0,
            pending_limits: (config.incoming_bandwidth_limit, config.outgoing_bandwidth_limit),
            mtu: config.mtu,
            probe: None,
            disconnect_data: 0,
            disconnect_sent_at: 0,
            disconnect_started_at: 0,
        }
    }

    #[inline]
    pub fn state(&self) -> PeerState {
        self.state
    }

    #[inline]
    pub fn address(&self) -> SocketAddr {
        self.addr
    }

    #[inline]
    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    /// Smoothed round trip estimate in milliseconds.
    #[inline]
    pub fn rtt(&self) -> u64 {
        (self.rtt_mean >> 32).max(0) as u64
    }

    /// Smoothed packet loss ratio in [0, 1].
    #[inline]
    pub fn packet_loss(&self) -> f64 {
        (self.loss_mean as f64 / (1u64 << 32) as f64).max(0.0)
    }

    /// Incoming payload bytes per second.
    #[inline]
    pub fn incoming_bandwidth(&self) -> u64 {
        self.incoming_tracker.rate()
    }

    /// Outgoing payload bytes per second.
    #[inline]
    pub fn outgoing_bandwidth(&self) -> u64 {
        self.outgoing_tracker.rate()
    }

    /// Remote's 64 bit application data from its AuthenticationResponse.
    #[inline]
    pub fn application_data(&self) -> u64 {
        self.application_data
    }

    /// The remote's long term Ed25519 identity learned during the handshake.
    #[inline]
    pub fn remote_identity(&self) -> &[u8; crypto::SIGN_PUBLIC_KEY_SIZE] {
        &self.remote_identity
    }

    #[inline]
    pub(crate) fn set_mtu(&mut self, mtu: u16) {
        self.mtu = mtu;
    }

    /// Caps what this peer may send to the remote's advertised incoming limit.
    #[inline]
    pub(crate) fn cap_outgoing_bandwidth(&mut self, bits_per_second: u32, now: u64) {
        self.limiter.reconfigure(u64::from(bits_per_second), 1_000, now);
    }

    #[inline]
    pub(crate) fn mark_disconnected(&mut self) {
        self.state = PeerState::Disconnected;
    }

    /// The peer is finished and its slot can be reclaimed.
    #[inline]
    pub(crate) fn should_free(&self) -> bool {
        match self.state {
            PeerState::Disconnected | PeerState::DisconnectionPending => true,
            _ => false,
        }
    }

    /// Current retransmission timeout, clamped to the configured range.
    fn rto(&self, config: &HostConfig) -> u64 {
        let raw = ((self.rtt_mean + 4 * self.rtt_variance) >> 32).max(0) as u64;
        raw.max(config.minimum_retransmission_timeout)
            .min(config.maximum_retransmission_timeout)
    }

    fn resend_limit(&self, config: &HostConfig) -> u64 {
        (self.rto(config) * 4)
            .max(config.minimum_retransmission_timeout_limit)
            .min(config.maximum_retransmission_timeout_limit)
    }

    fn update_rtt(&mut self, sample_ms: u64) {
        let sample = (sample_ms as i64) << 32;

        let error = sample - self.rtt_mean;
        self.rtt_mean += error >> 3;
        self.rtt_variance += (error.abs() >> 2) - (self.rtt_variance >> 2);
    }

    fn update_loss(&mut self, now: u64) {
        if now.wrapping_sub(self.loss_window_start) < LOSS_MEASUREMENT_WINDOW {
            return;
        }

        if self.packets_sent_window > 0 {
            let measured =
                ((self.packets_lost_window.min(self.packets_sent_window) as i64) << 32)
                    / self.packets_sent_window as i64;

            if self.loss_mean == 0 && self.loss_variance == 0 {
                self.loss_mean = measured;
            } else {
                let error = measured - self.loss_mean;
                self.loss_mean += error >> 3;
                self.loss_variance += (error.abs() >> 2) - (self.loss_variance >> 2);
            }
        }

        self.packets_sent_window = 0;
        self.packets_lost_window = 0;
        self.loss_window_start = now;
    }

    /// Queues a message on one of the peer's channels.
    pub fn send_message(&mut self, channel: ChannelId, message: &Message, config: &HostConfig) -> NetworkResult<()> {
        if !self.state.is_live() && !self.state.is_pending() {
            return Err(NetworkError::Fatal(ErrorType::InvalidState));
        }

        let frame_budget = usize::from(self.mtu).saturating_sub(NORMAL_HEADER_SIZE);
        let channel = self
            .channels
            .get_mut(usize::from(channel))
            .ok_or(NetworkError::Fatal(ErrorType::UnknownChannel))?;

        channel.send_message(message, frame_budget, config.max_message_size as usize)
    }

    /// Starts a graceful disconnect. With `later` set, pending reliable traffic is
    /// flushed before the disconnect sequence begins.
    pub fn disconnect(&mut self, data: u64, later: bool, now: u64) {
        if !self.state.is_live() {
            return;
        }

        self.disconnect_data = data;

        if later {
            self.state = PeerState::DisconnectLater;
        } else {
            self.begin_disconnect(now);
        }
    }

    fn begin_disconnect(&mut self, now: u64) {
        self.state = PeerState::Disconnecting;
        self.disconnect_started_at = now;
        self.disconnect_sent_at = now;
        self.outgoing.push_back(OutgoingBlock::Control(
            ControlBlock::Disconnect {
                data: self.disconnect_data,
            }
            .write(0),
        ));
    }

    /// Applies fresh local bandwidth limits and schedules the broadcast to the
    /// remote side.
    pub fn set_bandwidth_limits(&mut self, incoming: u32, outgoing: u32, now: u64) {
        self.pending_limits = (incoming, outgoing);
        self.limiter.reconfigure(u64::from(outgoing), 1_000, now);
        self.limits_dirty = true;
        self.limits_sent_at = 0;
    }

    /// Kicks off an MTU discovery walk from the largest candidate downwards.
    pub fn start_mtu_probe(&mut self, now: u64) {
        let start = MTU_CANDIDATES
            .iter()
            .position(|size| *size <= MAX_MTU)
            .unwrap_or(MTU_CANDIDATES.len());

        self.probe = Some(MtuProbe {
            index: start,
            tries_left: MTU_PROBE_TRIES,
            seq: 0,
            last_send: now.wrapping_sub(MTU_PROBE_INTERVAL),
            awaiting: false,
        });
    }

    /// Hands a received encrypted datagram to the peer for later decryption.
    pub(crate) fn queue_incoming(&mut self, packet: Vec<u8>) {
        // Bounded so a flood cannot balloon the deferred queue
        if self.incoming_packets.len() >= 256 {
            self.incoming_packets.pop_front();
        }
        self.incoming_packets.push_back(packet);
    }

    /// The per-service-iteration dispatch: timeouts, statistics, handshake
    /// retransmission, inbound processing, keep-alive and the outgoing flush.
    /// Returns the earliest time the peer wants to run again.
    pub(crate) fn dispatch(&mut self, ctx: &mut DispatchContext) -> u64 {
        let now = ctx.now;

        // Connection timeout covers every state that expects traffic
        if self.state.is_live()
            && now.wrapping_sub(self.last_receive_time) >= ctx.config.connection_timeout
        {
            logging::debug!(self.log, "connection timed out"; "addr" => %self.addr);
            ctx.events.push_back(HostEvent::Disconnect {
                peer: self.id,
                data: 0,
            });
            self.state = PeerState::Disconnected;
            return now;
        }

        self.incoming_tracker.update(now);
        self.outgoing_tracker.update(now);

        self.dispatch_bandwidth_limits(ctx);
        self.dispatch_mtu_probe(ctx);
        self.dispatch_incoming_packets(ctx);
        self.deliver_messages(ctx);
        self.update_loss(now);
        self.dispatch_connection_state(ctx);
        self.dispatch_keep_alive(ctx);
        self.dispatch_outgoing(ctx);

        self.next_deadline(ctx)
    }

    fn dispatch_bandwidth_limits(&mut self, ctx: &mut DispatchContext) {
        if !self.limits_dirty || !self.state.is_live() {
            return;
        }

        if ctx.now.wrapping_sub(self.limits_sent_at) < ctx.config.ping_resend_timeout
            && self.limits_sent_at != 0
        {
            return;
        }

        self.limits_sent_at = ctx.now;
        self.outgoing.push_back(OutgoingBlock::Control(
            ControlBlock::BandwidthLimits {
                incoming: self.pending_limits.0,
                outgoing: self.pending_limits.1,
            }
            .write(0),
        ));
    }

    fn dispatch_mtu_probe(&mut self, ctx: &mut DispatchContext) {
        if !self.state.is_live() {
            return;
        }

        let now = ctx.now;

        let trial = match &mut self.probe {
            None => return,
            Some(probe) => {
                if now.wrapping_sub(probe.last_send) < MTU_PROBE_INTERVAL {
                    return;
                }

                if probe.tries_left == 0 {
                    probe.index += 1;
                    probe.tries_left = MTU_PROBE_TRIES;
                }

                if probe.index >= MTU_CANDIDATES.len() {
                    None
                } else {
                    probe.tries_left -= 1;
                    probe.last_send = now;
                    probe.seq = probe.seq.wrapping_add(1);
                    probe.awaiting = true;

                    Some((probe.seq, MTU_CANDIDATES[probe.index]))
                }
            }
        };

        match trial {
            None => self.probe = None,
            Some((seq, size)) => self.queue_probe_frame(seq, 0, size),
        }
    }

    /// Builds an MTU probe block padded so the final datagram is exactly `size`.
    fn queue_probe_frame(&mut self, seq: u16, phase: u8, size: u16) {
        let target = usize::from(size).max(NORMAL_HEADER_SIZE + MTU_PROBE_HEADER_SIZE);
        let pad = target - NORMAL_HEADER_SIZE - MTU_PROBE_HEADER_SIZE;

        let wire = ControlBlock::MtuProbe { seq, phase, size }.write(pad);
        self.probe_queue.push_back(wire);
    }

    fn adopt_mtu(&mut self, size: u16, ctx: &mut DispatchContext) {
        let adopted = size.max(MIN_MTU).min(MAX_MTU);

        if adopted != self.mtu {
            self.mtu = adopted;
            logging::debug!(self.log, "mtu adopted"; "mtu" => adopted);
            ctx.events.push_back(HostEvent::Mtu {
                peer: self.id,
                mtu: adopted,
            });
        }
    }

    fn handle_mtu_probe(&mut self, seq: u16, phase: u8, size: u16, ctx: &mut DispatchContext) {
        match phase {
            // "can you echo this size?"
            0 => self.queue_probe_frame(seq, 1, size),
            // Our own probe came back: confirm and adopt
            1 => {
                let matched = match &self.probe {
                    Some(probe) => probe.awaiting && probe.seq == seq,
                    None => false,
                };

                if matched {
                    self.queue_probe_frame(seq, 2, size);
                    self.adopt_mtu(size, ctx);
                    self.probe = None;
                }
            }
            // The prober confirmed: adopt and finalize
            2 => {
                self.adopt_mtu(size, ctx);
                self.queue_probe_frame(seq, 3, size);
            }
            // Finalized; also covers late confirmations adopting the size
            _ => self.adopt_mtu(size, ctx),
        }
    }

    fn dispatch_incoming_packets(&mut self, ctx: &mut DispatchContext) {
        while let Some(packet) = self.incoming_packets.pop_front() {
            if let Err(err) = self.process_frame(&packet, ctx) {
                // Unauthenticated noise is dropped without reaction
                logging::trace!(self.log, "dropped frame"; "error" => ?err);
            }
        }
    }

    fn process_frame(&mut self, packet: &[u8], ctx: &mut DispatchContext) -> NetworkResult<()> {
        let header = match NormalHeader::read(packet) {
            Some(header) => header,
            None => return Err(NetworkError::Fatal(ErrorType::Malformed)),
        };

        if !self.replay.check(header.sequence) {
            return Err(NetworkError::Fatal(ErrorType::Malformed));
        }

        let body = &packet[NORMAL_HEADER_SIZE..];

        // Combined-mode ciphertext is body followed by the header's tag
        let mut cipher = Vec::with_capacity(body.len() + crypto::MAC_SIZE);
        cipher.extend_from_slice(body);
        cipher.extend_from_slice(&header.tag);

        let mut plain = vec![0u8; body.len()];

        // The remote stamps its own direction bit into the nonce counter
        let direction = if self.initiator { 1u64 << 63 } else { 0 };
        let nonce = data_nonce(
            header.sequence | direction,
            self.connection_nonce,
            self.local_salt ^ self.remote_salt,
        );

        if !crypto::decrypt(
            &mut plain,
            &cipher,
            &header.associated_data(),
            &nonce,
            &self.shared_key,
        ) {
            return Err(NetworkError::Fatal(ErrorType::Crypto));
        }

        self.replay.commit(header.sequence);
        self.last_receive_time = ctx.now;
        self.incoming_tracker.add(packet.len() as u64);

        // A decryptable frame proves the client holds the session key, which
        // finalizes a server-side peer still waiting for the explicit acknowledge
        if self.state == PeerState::Approving {
            self.finalize_server_side(ctx);
        }

        let payload;
        let decompressed;

        if header.flags & FLAG_COMPRESSED != 0 {
            if plain.len() < 2 {
                return Err(NetworkError::Fatal(ErrorType::Malformed));
            }

            let expected = usize::from(u16::from_le_bytes([plain[0], plain[1]]));
            let compressor = match ctx.compressor.as_mut() {
                Some(compressor) => compressor,
                None => return Err(NetworkError::Fatal(ErrorType::Compression)),
            };

            let mut out = Vec::new();
            compressor.decompress(&plain[2..], expected, &mut out)?;
            decompressed = out;
            payload = &decompressed[..];
        } else {
            payload = &plain[..];
        }

        self.process_blocks(payload, ctx)
    }

    pub(crate) fn finalize_server_side(&mut self, ctx: &mut DispatchContext) {
        let now = ctx.now;
        self.promote_connected(ctx.events, now);
    }

    /// Finishes the handshake: the peer is live, the cached handshake packet and
    /// (for server-side peers) the candidate slot are no longer needed.
    pub(crate) fn promote_connected(&mut self, events: &mut VecDeque<HostEvent>, now: u64) {
        if self.state == PeerState::Connected || !self.state.is_pending() {
            return;
        }

        self.state = PeerState::Connected;
        self.candidate_done = true;
        self.cached_handshake = None;
        self.last_keepalive = now;
        self.last_receive_time = now;
        logging::debug!(self.log, "peer connected"; "addr" => %self.addr);
        events.push_back(HostEvent::Connect { peer: self.id });
    }

    fn process_blocks(&mut self, payload: &[u8], ctx: &mut DispatchContext) -> NetworkResult<()> {
        let mut reader = BlockReader::new(payload);
        let mut rtt_samples = std::mem::replace(&mut self.rtt_samples, Vec::new());

        let result = loop {
            match reader.next_block() {
                Ok(None) => break Ok(()),
                Err(err) => break Err(err),
                Ok(Some(ParsedBlock::Control(control))) => {
                    self.handle_control(control, ctx);
                }
                Ok(Some(ParsedBlock::Channel {
                    channel,
                    command,
                    payload,
                })) => {
                    let slot = match self.channels.get_mut(usize::from(channel)) {
                        Some(slot) => slot,
                        None => break Err(NetworkError::Fatal(ErrorType::UnknownChannel)),
                    };

                    if let Err(err) = slot.dispatch_incoming(command, payload, ctx.now, &mut rtt_samples)
                    {
                        break Err(err);
                    }
                }
            }
        };

        for sample in rtt_samples.drain(..) {
            self.update_rtt(sample);
        }
        self.rtt_samples = rtt_samples;

        result
    }

    fn handle_control(&mut self, control: ControlBlock, ctx: &mut DispatchContext) {
        match control {
            ControlBlock::Ping { seq } => {
                self.outgoing
                    .push_back(OutgoingBlock::Control(ControlBlock::Pong { seq }.write(0)));
            }
            ControlBlock::Pong { seq } => {
                if let Some(position) = self.pings.iter().position(|ping| ping.seq == seq) {
                    let ping = self.pings.remove(position);
                    let sample = ctx.now.wrapping_sub(ping.sent);
                    self.update_rtt(sample);
                }
            }
            ControlBlock::Disconnect { data } => {
                if self.state.is_live() || self.state == PeerState::DisconnectionAcking {
                    self.outgoing.push_back(OutgoingBlock::Control(
                        ControlBlock::DisconnectAck { data }.write(0),
                    ));

                    if self.state != PeerState::DisconnectionAcking {
                        logging::debug!(self.log, "remote disconnected"; "data" => data);
                        ctx.events.push_back(HostEvent::Disconnect {
                            peer: self.id,
                            data,
                        });
                        self.state = PeerState::DisconnectionAcking;
                    }
                }
            }
            ControlBlock::DisconnectAck { .. } => {
                if self.state == PeerState::Disconnecting {
                    ctx.events.push_back(HostEvent::Disconnect {
                        peer: self.id,
                        data: self.disconnect_data,
                    });
                    self.state = PeerState::DisconnectionPending;
                }
            }
            ControlBlock::BandwidthLimits { incoming, outgoing } => {
                // The remote's incoming limit caps what we may send
                self.limiter.reconfigure(u64::from(incoming), 1_000, ctx.now);
                ctx.events.push_back(HostEvent::BandwidthLimits {
                    peer: self.id,
                    incoming,
                    outgoing,
                });
                self.outgoing.push_back(OutgoingBlock::Control(
                    ControlBlock::BandwidthLimitsAck.write(0),
                ));
            }
            ControlBlock::BandwidthLimitsAck => {
                self.limits_dirty = false;
            }
            ControlBlock::MtuProbe { seq, phase, size } => {
                self.handle_mtu_probe(seq, phase, size, ctx);
            }
        }
    }

    fn deliver_messages(&mut self, ctx: &mut DispatchContext) {
        for (index, channel) in self.channels.iter_mut().enumerate() {
            while let Some(message) = channel.next_message() {
                ctx.events.push_back(HostEvent::Receive {
                    peer: self.id,
                    channel: index as ChannelId,
                    message,
                });
            }
        }
    }

    fn dispatch_connection_state(&mut self, ctx: &mut DispatchContext) {
        let now = ctx.now;

        match self.state {
            state if state.is_pending() => {
                if now.wrapping_sub(self.handshake_started_at)
                    >= ctx.config.pending_connection_timeout
                {
                    logging::debug!(self.log, "pending connection timed out"; "state" => ?state);
                    ctx.events.push_back(HostEvent::Disconnect {
                        peer: self.id,
                        data: 0,
                    });
                    self.state = PeerState::Disconnected;
                    return;
                }

                // A Requesting peer rotates a stale salt before re-sending
                if state == PeerState::Requesting
                    && now.wrapping_sub(self.handshake_sent_at) >= SALT_ROTATION_TIMEOUT
                    && self.handshake_sent_at != 0
                {
                    self.local_salt = crypto::random_u64();
                    self.rebuild_connection_request(ctx.config, ctx.protocol_id);
                }

                if now.wrapping_sub(self.handshake_sent_at)
                    >= ctx.config.pending_connection_send_timeout
                {
                    self.send_cached_handshake(&mut *ctx.network, now);
                }
            }
            PeerState::DisconnectLater => {
                let idle = self.outgoing.is_empty()
                    && self
                        .channels
                        .iter()
                        .all(|channel| !channel.has_unacked() && !channel.has_backlog());

                if idle {
                    self.begin_disconnect(now);
                }
            }
            PeerState::Disconnecting => {
                if now.wrapping_sub(self.disconnect_started_at)
                    >= ctx.config.pending_disconnection_timeout
                {
                    ctx.events.push_back(HostEvent::Disconnect {
                        peer: self.id,
                        data: self.disconnect_data,
                    });
                    self.state = PeerState::DisconnectionPending;
                    return;
                }

                if now.wrapping_sub(self.disconnect_sent_at)
                    >= ctx.config.pending_disconnection_send_timeout
                {
                    self.disconnect_sent_at = now;
                    self.outgoing.push_back(OutgoingBlock::Control(
                        ControlBlock::Disconnect {
                            data: self.disconnect_data,
                        }
                        .write(0),
                    ));
                }
            }
            PeerState::DisconnectionAcking => {
                if self.outgoing.is_empty() {
                    self.state = PeerState::DisconnectionPending;
                }
            }
            _ => {}
        }
    }

    pub(crate) fn rebuild_connection_request(&mut self, config: &HostConfig, protocol_id: u64) {
        let packet = protocol::HandshakePacket::ConnectionRequest(protocol::ConnectionRequest {
            peer_id: self.id,
            salt: self.local_salt,
            incoming_bandwidth: config.incoming_bandwidth_limit,
            outgoing_bandwidth: config.outgoing_bandwidth_limit,
            token: self.connection_token,
        });

        self.cached_handshake = Some(packet.write(protocol_id));
    }

    pub(crate) fn send_cached_handshake(&mut self, network: &mut dyn Network, now: u64) {
        if let Some(packet) = &self.cached_handshake {
            self.handshake_sent_at = now;
            let _ = network.send_to(packet, self.addr);
        }
    }

    fn dispatch_keep_alive(&mut self, ctx: &mut DispatchContext) {
        if self.state != PeerState::Connected {
            return;
        }

        let now = ctx.now;

        // Per-ping exponential resend, counted as loss
        for ping in self.pings.iter_mut() {
            if now.wrapping_sub(ping.sent) >= ping.timeout {
                ping.sent = now;
                ping.timeout = (ping.timeout * 2).min(ctx.config.ping_interval);
                self.packets_lost_window += 1;
                self.outgoing.push_back(OutgoingBlock::Control(
                    ControlBlock::Ping { seq: ping.seq }.write(0),
                ));
            }
        }

        let idle = self.outgoing.is_empty()
            && self
                .channels
                .iter()
                .all(|channel| !channel.has_unacked() && !channel.has_backlog());

        if idle
            && self.pings.len() < ctx.config.keep_alive_window_size as usize
            && now.wrapping_sub(self.last_keepalive) >= ctx.config.ping_interval
        {
            let seq = self.next_ping_seq;
            self.next_ping_seq = self.next_ping_seq.wrapping_add(1);
            self.last_keepalive = now;

            self.pings.push(PingSlot {
                seq,
                sent: now,
                timeout: ctx.config.ping_resend_timeout,
            });

            self.outgoing
                .push_back(OutgoingBlock::Control(ControlBlock::Ping { seq }.write(0)));
        }
    }

    fn dispatch_outgoing(&mut self, ctx: &mut DispatchContext) {
        if !self.state.is_live()
            && self.state != PeerState::Disconnecting
            && self.state != PeerState::DisconnectionAcking
        {
            return;
        }

        let frame_budget = usize::from(self.mtu).saturating_sub(NORMAL_HEADER_SIZE);
        let rto = self.rto(ctx.config);
        let resend_limit = self.resend_limit(ctx.config);

        {
            let mut outgoing_ctx = OutgoingContext {
                now: ctx.now,
                rto,
                resend_limit,
                block_budget: frame_budget,
                lost: &mut self.packets_lost_window,
                queue: &mut self.outgoing,
            };

            for channel in self.channels.iter_mut() {
                channel.dispatch_outgoing(&mut outgoing_ctx);
            }
        }

        // MTU probe frames go out alone, exactly sized and never compressed
        if let Some(wire) = self.probe_queue.pop_front() {
            self.send_frame(wire, false, ctx);
        }

        if self.outgoing.is_empty() {
            return;
        }

        // Aggregate queued blocks into exactly one frame per flush
        let mut payload = Vec::with_capacity(frame_budget);
        let mut transmitted: Vec<crate::block::BlockRef> = Vec::new();

        while let Some(front) = self.outgoing.front() {
            let len = front.wire().len();

            if !payload.is_empty() && payload.len() + len > frame_budget {
                break;
            }

            let block = self.outgoing.pop_front().unwrap();
            payload.extend_from_slice(block.wire());

            if let OutgoingBlock::Reliable(reliable) = block {
                transmitted.push(reliable);
            }
        }

        self.send_frame(payload, true, ctx);

        for block in transmitted {
            let channel = usize::from(block.channel);
            self.channels[channel].park_transmitted(block, ctx.now, rto, resend_limit);
        }
    }

    /// Seals one payload into an AEAD frame and sends it, subject to the peer and
    /// host rate limiters.
    fn send_frame(&mut self, mut payload: Vec<u8>, allow_compression: bool, ctx: &mut DispatchContext) {
        if payload.is_empty() {
            return;
        }

        let mut flags = 0u8;

        if allow_compression && payload.len() >= 3 {
            if let Some(compressor) = ctx.compressor.as_mut() {
                let mut compressed = Vec::new();
                if compressor.compress(&payload, &mut compressed)
                    && compressed.len() + 2 < payload.len()
                {
                    let mut framed = Vec::with_capacity(compressed.len() + 2);
                    framed.extend_from_slice(&(payload.len() as u16).to_le_bytes());
                    framed.extend_from_slice(&compressed);
                    payload = framed;
                    flags |= FLAG_COMPRESSED;
                }
            }
        }

        let sequence = self.send_sequence + 1;

        let mut header = NormalHeader {
            peer_id: self.remote_id,
            flags,
            sent_time: ctx.now as u16,
            sequence,
            tag: [0; 16],
        };

        let direction = if self.initiator { 0 } else { 1u64 << 63 };
        let nonce = data_nonce(
            sequence | direction,
            self.connection_nonce,
            self.local_salt ^ self.remote_salt,
        );

        let mut cipher = vec![0u8; payload.len() + crypto::MAC_SIZE];
        if !crypto::encrypt(
            &mut cipher,
            &payload,
            &header.associated_data(),
            &nonce,
            &self.shared_key,
        ) {
            logging::warn!(self.log, "frame encryption failed");
            return;
        }

        let (body, tag) = cipher.split_at(payload.len());
        header.tag.copy_from_slice(tag);

        let mut packet = vec![0u8; NORMAL_HEADER_SIZE + body.len()];
        header.write(&mut packet);
        packet[NORMAL_HEADER_SIZE..].copy_from_slice(body);

        self.send_sequence = sequence;
        self.packets_sent_window += 1;

        let bits = packet.len() as u64 * 8;

        // A frame the limiter refuses is intentional packet loss
        if !self.limiter.can_proceed(bits, ctx.now) || !ctx.host_limiter.can_proceed(bits, ctx.now) {
            self.packets_lost_window += 1;
            return;
        }

        self.limiter.add_amount(bits);
        ctx.host_limiter.add_amount(bits);
        self.outgoing_tracker.add(packet.len() as u64);
        ctx.host_tracker.add(packet.len() as u64);

        let _ = ctx.network.send_to(&packet, self.addr);
    }

    /// The earliest moment this peer needs attention again.
    fn next_deadline(&self, ctx: &DispatchContext) -> u64 {
        let now = ctx.now;
        let mut deadline = now.wrapping_add(ctx.config.ping_interval.max(1));

        let mut consider = |candidate: u64| {
            if brine::time::time_before(candidate, deadline) {
                deadline = candidate;
            }
        };

        if self.state.is_pending() {
            consider(self.handshake_sent_at.wrapping_add(ctx.config.pending_connection_send_timeout));
        }

        if self.state == PeerState::Disconnecting {
            consider(self.disconnect_sent_at.wrapping_add(ctx.config.pending_disconnection_send_timeout));
        }

        for channel in self.channels.iter() {
            if let Some(channel_deadline) = channel.next_deadline() {
                consider(channel_deadline);
            }
        }

        for ping in self.pings.iter() {
            consider(ping.sent.wrapping_add(ping.timeout));
        }

        if self.probe.is_some() {
            consider(now.wrapping_add(MTU_PROBE_INTERVAL));
        }

        if !self.outgoing.is_empty() || !self.probe_queue.is_empty() {
            consider(now);
        }

        deadline.max(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replay_window_contract() {
        let mut window = ReplayWindow::new(16);

        // Fresh sequence numbers are accepted and recorded
        assert!(window.check(1));
        window.commit(1);
        assert!(!window.check(1));

        assert!(window.check(5));
        window.commit(5);
        assert!(!window.check(5));

        // In-window holes remain acceptable
        assert!(window.check(3));

        // Everything at or below highest - window is gone
        window.commit(100);
        assert!(!window.check(84));
        assert!(window.check(85));
        assert!(window.check(101));

        // Sequence zero never passes
        assert!(!window.check(0));
    }

    #[test]
    fn test_replay_window_highest_never_regresses() {
        let mut window = ReplayWindow::new(16);

        window.commit(50);
        window.commit(40);

        assert!(!window.check(40));
        assert!(window.check(51));
        assert!(window.check(45));
    }

    #[test]
    fn test_rtt_jacobson_converges() {
        let config = HostConfig::default();
        let log = logging::discard();
        let mut peer = Peer::new(0, "10.0.0.1:1".parse().unwrap(), &config, 1, 0, &log);

        for _ in 0..64 {
            peer.update_rtt(100);
        }

        let rtt = peer.rtt();
        assert!(rtt >= 90 && rtt <= 110, "rtt {}", rtt);

        let rto = peer.rto(&config);
        assert!(rto >= config.minimum_retransmission_timeout);
        assert!(rto <= config.maximum_retransmission_timeout);
    }

    #[test]
    fn test_loss_window_updates_every_ten_seconds() {
        let config = HostConfig::default();
        let log = logging::discard();
        let mut peer = Peer::new(0, "10.0.0.1:1".parse().unwrap(), &config, 1, 0, &log);

        peer.packets_sent_window = 100;
        peer.packets_lost_window = 50;

        peer.update_loss(5_000);
        assert_eq!(peer.packet_loss(), 0.0);

        peer.update_loss(10_000);
        assert!((peer.packet_loss() - 0.5).abs() < 0.01);
        assert_eq!(peer.packets_sent_window, 0);
    }

    #[test]
    fn test_state_classification() {
        assert!(PeerState::Requesting.is_pending());
        assert!(PeerState::Approving.is_pending());
        assert!(!PeerState::Connected.is_pending());
        assert!(PeerState::Connected.is_live());
        assert!(PeerState::DisconnectLater.is_live());
        assert!(!PeerState::Disconnecting.is_live());
    }

    #[test]
    fn test_probe_frame_is_exactly_sized() {
        let config = HostConfig::default();
        let log = logging::discard();
        let mut peer = Peer::new(0, "10.0.0.1:1".parse().unwrap(), &config, 1, 0, &log);

        peer.queue_probe_frame(1, 0, 1200);
        let wire = peer.probe_queue.pop_front().unwrap();

        assert_eq!(NORMAL_HEADER_SIZE + wire.len(), 1200);
    }
}
