//! See [`Config`].

use std::time::Duration;

use {crate::message::MAX_CHANNELS_PER_METHOD, octs::FixedEncodeLen};

/// Tunable parameters for a [`crate::conn::Connection`].
///
/// Every field has a doc comment, and [`Config::default`] picks values that
/// are reasonable for an interactive low-latency application over the
/// public internet.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Config {
    /// Maximum size, in bytes, of a single UDP payload this connection will
    /// write. Messages larger than this (minus header overhead) are
    /// fragmented (see [`crate::frag`]).
    pub max_transmission_unit: usize,

    /// Sustained throttle rate, in bytes per second. `0.0` means unlimited.
    pub throttle_bytes_per_second: f64,

    /// Maximum throttle debt, in bytes, before sending halts within a single
    /// heartbeat invocation.
    pub throttle_peak_bytes: usize,

    /// Whether multiple messages may be packed into a single UDP payload.
    /// If `false`, each payload written carries at most one message.
    pub use_message_coalescing: bool,

    /// Delay between handshake retries (resending Connect/ConnectResponse).
    pub handshake_attempt_delay: Duration,

    /// Number of handshake attempts before giving up and disconnecting.
    pub handshake_max_attempts: u32,

    /// Maximum delay before a pending ack must be flushed, even if no other
    /// outgoing traffic is piggybacking it.
    pub max_ack_delay: Duration,

    /// Number of independent sequence channels per delivery method that
    /// supports channels (every method except plain `Unreliable`, which
    /// still gets one channel per [`crate::message::MessageType`] purposes).
    ///
    /// Must be `<=` [`crate::message::MAX_CHANNELS_PER_METHOD`].
    pub channels_per_delivery_method: u8,

    /// Per-connection cap on bytes buffered for in-flight fragment
    /// reassembly, guarding against a peer drip-feeding fragments of
    /// messages it never completes.
    pub max_reassembly_bytes: usize,

    /// Wall-clock period between Heartbeat Engine invocations.
    pub heartbeat_interval: Duration,

    /// Maximum age of last-heard-from traffic before the connection is
    /// declared dead and disconnected with a timeout reason.
    pub timeout: Duration,

    /// Whether the application must explicitly [`crate::conn::Connection::approve`]
    /// an inbound connection before the handshake can complete.
    pub require_approval: bool,
}

impl Config {
    /// Number of bytes of fixed header overhead a fragmented message costs,
    /// in addition to [`crate::message::MessageHeader::ENCODE_LEN`]: one flag
    /// byte plus a [`crate::frag::FragmentPosition`].
    pub const FRAGMENT_HEADER_SIZE: usize = 1 + crate::frag::FragmentPosition::ENCODE_LEN;

    /// Maximum payload length, in bytes, that a single non-fragmented message
    /// may carry before it must be split by [`crate::frag::split`].
    #[must_use]
    pub fn max_unfragmented_payload_len(&self) -> usize {
        self.max_transmission_unit
            .saturating_sub(crate::message::MAX_MESSAGE_OVERHEAD)
    }

    /// Maximum payload length of a single fragment.
    #[must_use]
    pub fn max_fragment_payload_len(&self) -> usize {
        self.max_transmission_unit
            .saturating_sub(crate::message::MessageHeader::ENCODE_LEN + Self::FRAGMENT_HEADER_SIZE)
    }

    /// Validates that this configuration is internally consistent.
    ///
    /// # Errors
    ///
    /// Errors if `channels_per_delivery_method` exceeds
    /// [`crate::message::MAX_CHANNELS_PER_METHOD`], or the MTU is too small
    /// to fit even a single byte of payload after header overhead.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channels_per_delivery_method > MAX_CHANNELS_PER_METHOD {
            return Err(ConfigError::TooManyChannels {
                requested: self.channels_per_delivery_method,
                max: MAX_CHANNELS_PER_METHOD,
            });
        }
        if self.max_fragment_payload_len() == 0 {
            return Err(ConfigError::MtuTooSmall {
                mtu: self.max_transmission_unit,
            });
        }
        Ok(())
    }
}

/// A [`Config`] failed [`Config::validate`].
#[derive(Debug, Clone, Copy, derive_more::Display, derive_more::Error)]
pub enum ConfigError {
    /// `channels_per_delivery_method` was too large to be packed into a
    /// single [`crate::message::MessageType`] byte.
    #[display("requested {requested} channels per method, maximum is {max}")]
    TooManyChannels {
        /// Value requested by the configuration.
        requested: u8,
        /// Maximum supported value.
        max: u8,
    },
    /// The MTU is too small to fit a single fragment payload byte.
    #[display("max_transmission_unit {mtu} is too small to fit any fragment payload")]
    MtuTooSmall {
        /// The configured MTU.
        mtu: usize,
    },
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_transmission_unit: 1408,
            throttle_bytes_per_second: 0.0,
            throttle_peak_bytes: 64 * 1024,
            use_message_coalescing: true,
            handshake_attempt_delay: Duration::from_millis(500),
            handshake_max_attempts: 10,
            max_ack_delay: Duration::from_millis(100),
            channels_per_delivery_method: 32,
            max_reassembly_bytes: 4 * 1024 * 1024,
            heartbeat_interval: Duration::from_millis(50),
            timeout: Duration::from_secs(10),
            require_approval: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn rejects_too_many_channels() {
        let mut config = Config::default();
        config.channels_per_delivery_method = MAX_CHANNELS_PER_METHOD + 1;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::TooManyChannels { .. })
        ));
    }

    #[test]
    fn rejects_tiny_mtu() {
        let mut config = Config::default();
        config.max_transmission_unit = 4;
        assert!(matches!(config.validate(), Err(ConfigError::MtuTooSmall { .. })));
    }
}
