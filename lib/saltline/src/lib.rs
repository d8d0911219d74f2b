//! `saltline` is a connection-oriented, reliability-configurable, authenticated UDP
//! transport for real-time interactive applications. A [`Host`] owns one socket and
//! every peer behind it; peers multiplex up to 32 channels with selectable delivery
//! semantics, frames are sealed with XChaCha20-Poly1305 under keys agreed through a
//! mutually authenticated, proof-of-work gated handshake.
//!
//! Hosts are single threaded: everything happens inside [`Host::service`] on the
//! owning thread, and the socket wait is the only suspension point. Scale out by
//! running more hosts.

#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod block;
pub mod channel;
pub mod compress;
pub mod config;
pub mod discovery;
pub mod event;
pub mod handshake;
pub mod host;
pub mod message;
pub mod network;
pub mod peer;
pub mod protocol;
pub mod shared;

pub use crate::channel::ChannelKind;
pub use crate::compress::{Compressor, Deflate};
pub use crate::config::HostConfig;
pub use crate::event::HostEvent;
pub use crate::host::{ConnectOptions, Host, ServiceResult};
pub use crate::message::Message;
pub use crate::network::{
    InterferenceConfig, InterferenceNetwork, Interrupter, MemoryMesh, MemoryNetwork, Network,
    UdpNetwork,
};
pub use crate::peer::{Peer, PeerState};
pub use crate::protocol::DenialReason;
pub use crate::shared::{ChannelId, ErrorType, NetworkError, NetworkResult, PeerId};
