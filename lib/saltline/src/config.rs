use serde_derive::{Deserialize, Serialize};
use std::path::Path;

use crate::channel::ChannelKind;
use crate::protocol::{MAX_CHANNEL_COUNT, MAX_MTU, MIN_MTU};
use crate::shared::{ErrorType, NetworkError, NetworkResult};

pub const DEFAULT_MTU: u16 = 900;

/// Everything a host can be tuned with. All timeouts are milliseconds, all
/// bandwidth limits are bits per second (zero meaning unlimited).
#[derive(Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HostConfig {
    pub max_peers: u16,
    pub channel_kinds: Vec<ChannelKind>,
    pub incoming_bandwidth_limit: u32,
    pub outgoing_bandwidth_limit: u32,
    pub mtu: u16,
    pub mtu_do_fragment: bool,
    pub connection_timeout: u64,
    pub ping_interval: u64,
    pub ping_resend_timeout: u64,
    pub pending_connection_timeout: u64,
    pub pending_connection_send_timeout: u64,
    pub pending_disconnection_timeout: u64,
    pub pending_disconnection_send_timeout: u64,
    pub minimum_retransmission_timeout: u64,
    pub maximum_retransmission_timeout: u64,
    pub minimum_retransmission_timeout_limit: u64,
    pub maximum_retransmission_timeout_limit: u64,
    pub reliable_channel_block_packet_window_size: u32,
    pub encrypted_packet_sequence_window_size: u32,
    pub keep_alive_window_size: u32,
    pub rate_limiter_host_address_burst: u64,
    pub rate_limiter_host_address_period: u64,
    pub check_connection_tokens: bool,
    pub check_authentication_tokens: bool,
    pub challenge_difficulty_factor: u32,
    pub minimum_challenge_repetitions: u32,
    pub maximum_challenge_repetitions: u32,
    pub max_message_size: u32,
    pub protocol_id: u64,
}

impl Default for HostConfig {
    fn default() -> HostConfig {
        HostConfig {
            max_peers: 16,
            channel_kinds: (0..MAX_CHANNEL_COUNT).map(ChannelKind::round_robin).collect(),
            incoming_bandwidth_limit: 0,
            outgoing_bandwidth_limit: 0,
            mtu: DEFAULT_MTU,
            mtu_do_fragment: false,
            connection_timeout: 10_000,
            ping_interval: 1_000,
            ping_resend_timeout: 100,
            pending_connection_timeout: 10_000,
            pending_connection_send_timeout: 100,
            pending_disconnection_timeout: 5_000,
            pending_disconnection_send_timeout: 50,
            minimum_retransmission_timeout: 1,
            maximum_retransmission_timeout: 500,
            minimum_retransmission_timeout_limit: 4,
            maximum_retransmission_timeout_limit: 5_000,
            reliable_channel_block_packet_window_size: 1_024,
            encrypted_packet_sequence_window_size: 256,
            keep_alive_window_size: 4,
            rate_limiter_host_address_burst: 20,
            rate_limiter_host_address_period: 1_000,
            check_connection_tokens: false,
            check_authentication_tokens: false,
            challenge_difficulty_factor: 4,
            minimum_challenge_repetitions: 16,
            maximum_challenge_repetitions: 65_536,
            max_message_size: 1 << 24,
            protocol_id: 0,
        }
    }
}

impl HostConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> HostConfig {
        serdeconv::from_toml_file(path).expect("Error loading host configuration file")
    }

    pub fn validate(&self) -> NetworkResult<()> {
        if self.channel_kinds.is_empty() {
            return Err(config_error("at least one channel must be configured"));
        }

        if self.channel_kinds.len() > MAX_CHANNEL_COUNT {
            return Err(config_error("too many channels configured"));
        }

        if self.mtu < MIN_MTU || self.mtu > MAX_MTU {
            return Err(config_error("mtu out of range"));
        }

        let window = self.reliable_channel_block_packet_window_size;
        if !window.is_power_of_two() || window > 65_536 {
            return Err(config_error(
                "reliable channel window size must be a power of two of at most 65536",
            ));
        }

        let replay = self.encrypted_packet_sequence_window_size;
        if !replay.is_power_of_two() || replay < 16 || replay > 65_536 {
            return Err(config_error(
                "encrypted packet sequence window size must be a power of two in 16..65536",
            ));
        }

        let keep_alive = self.keep_alive_window_size;
        if !keep_alive.is_power_of_two() || keep_alive > 256 {
            return Err(config_error(
                "keep alive window size must be a power of two of at most 256",
            ));
        }

        if self.minimum_retransmission_timeout == 0
            || self.minimum_retransmission_timeout > self.maximum_retransmission_timeout
        {
            return Err(config_error("retransmission timeout range is inverted"));
        }

        if self.minimum_retransmission_timeout_limit > self.maximum_retransmission_timeout_limit {
            return Err(config_error("retransmission timeout limit range is inverted"));
        }

        if self.minimum_challenge_repetitions == 0
            || self.minimum_challenge_repetitions > self.maximum_challenge_repetitions
        {
            return Err(config_error("challenge repetition range is inverted"));
        }

        if self.rate_limiter_host_address_period == 0 {
            return Err(config_error("rate limiter period must be non-zero"));
        }

        Ok(())
    }

    /// The channel layout as the byte array carried in an AuthenticationResponse.
    pub fn channel_kind_bytes(&self) -> [u8; MAX_CHANNEL_COUNT] {
        let mut bytes = [0u8; MAX_CHANNEL_COUNT];
        for (slot, kind) in bytes.iter_mut().zip(self.channel_kinds.iter()) {
            *slot = *kind as u8;
        }
        bytes
    }
}

#[inline]
fn config_error(reason: &'static str) -> NetworkError {
    NetworkError::Fatal(ErrorType::Config(reason))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(HostConfig::default().validate().is_ok());
    }

    #[test]
    fn test_default_channels_rotate() {
        let config = HostConfig::default();
        assert_eq!(config.channel_kinds.len(), MAX_CHANNEL_COUNT);
        assert_eq!(config.channel_kinds[0], ChannelKind::ReliableOrdered);
        assert_eq!(config.channel_kinds[5], ChannelKind::ReliableUnordered);
    }

    #[test]
    fn test_rejects_bad_windows() {
        let mut config = HostConfig::default();
        config.reliable_channel_block_packet_window_size = 1000;
        assert!(config.validate().is_err());

        let mut config = HostConfig::default();
        config.encrypted_packet_sequence_window_size = 8;
        assert!(config.validate().is_err());

        let mut config = HostConfig::default();
        config.keep_alive_window_size = 512;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_mtu() {
        let mut config = HostConfig::default();
        config.mtu = 100;
        assert!(config.validate().is_err());

        config.mtu = 5000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_empty_channels() {
        let mut config = HostConfig::default();
        config.channel_kinds.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = HostConfig::default();
        let toml = serdeconv::to_toml_string(&config).unwrap();
        let restored: HostConfig = serdeconv::from_toml_str(&toml).unwrap();

        assert_eq!(restored.max_peers, config.max_peers);
        assert_eq!(restored.channel_kinds, config.channel_kinds);
        assert_eq!(restored.mtu, config.mtu);
    }

    #[test]
    fn test_channel_kind_bytes() {
        let mut config = HostConfig::default();
        config.channel_kinds = vec![ChannelKind::UnreliableUnordered, ChannelKind::ReliableOrdered];

        let bytes = config.channel_kind_bytes();
        assert_eq!(bytes[0], 3);
        assert_eq!(bytes[1], 0);
        assert_eq!(&bytes[2..], &[0; 30][..]);
    }
}
