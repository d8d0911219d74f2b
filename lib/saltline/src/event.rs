use crate::message::Message;
use crate::protocol::DenialReason;
use crate::shared::{ChannelId, PeerId};

/// Application visible outcomes surfaced by `Host::service`.
#[derive(Debug)]
pub enum HostEvent {
    /// The handshake completed and the peer is live.
    Connect { peer: PeerId },
    /// The peer went away; `data` is the remote's disconnect payload, or zero on timeout.
    Disconnect { peer: PeerId, data: u64 },
    /// The remote host approved our connection attempt.
    Approval { peer: PeerId },
    /// The remote host denied our connection attempt.
    Denial { peer: PeerId, reason: DenialReason },
    /// The remote side broadcast new bandwidth limits.
    BandwidthLimits { peer: PeerId, incoming: u32, outgoing: u32 },
    /// MTU probing settled on a new value.
    Mtu { peer: PeerId, mtu: u16 },
    /// A channel assembled a complete message.
    Receive { peer: PeerId, channel: ChannelId, message: Message },
}
