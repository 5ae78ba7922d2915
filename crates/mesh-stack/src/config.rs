//! Pipeline configuration
//!
//! ```json
//! {
//!   "default_ttl": 5,
//!   "discard_timeout_ms": 10000,
//!   "acknowledgment_timer_base_ms": 150,
//!   "acknowledgment_timer_per_segment_ms": 50,
//!   "allow_iv_index_recovery_over_42": false,
//!   "iv_update_test_mode": false,
//!   "proxy_mtu": 22
//! }
//! ```
//!
//! Every field is optional; missing fields take the values above.

use mesh_keys::IvUpdatePolicy;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

fn default_ttl() -> u8 {
    5
}

fn default_discard_timeout_ms() -> u64 {
    10_000
}

fn default_ack_base_ms() -> u64 {
    150
}

fn default_ack_per_segment_ms() -> u64 {
    50
}

fn default_proxy_mtu() -> usize {
    22
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshConfig {
    /// TTL of messages sent without an explicit one
    #[serde(default = "default_ttl")]
    pub default_ttl: u8,
    /// Incomplete segmented messages are dropped after this idle time
    #[serde(default = "default_discard_timeout_ms")]
    pub discard_timeout_ms: u64,
    #[serde(default = "default_ack_base_ms")]
    pub acknowledgment_timer_base_ms: u64,
    #[serde(default = "default_ack_per_segment_ms")]
    pub acknowledgment_timer_per_segment_ms: u64,
    /// Lift the 42 limit of IV Index Recovery
    #[serde(default)]
    pub allow_iv_index_recovery_over_42: bool,
    /// Disable the 96-hour rule of single IV steps
    #[serde(default)]
    pub iv_update_test_mode: bool,
    /// GATT MTU of the proxy bearer (ATT MTU - 3)
    #[serde(default = "default_proxy_mtu")]
    pub proxy_mtu: usize,
}

impl Default for MeshConfig {
    fn default() -> Self {
        MeshConfig {
            default_ttl: default_ttl(),
            discard_timeout_ms: default_discard_timeout_ms(),
            acknowledgment_timer_base_ms: default_ack_base_ms(),
            acknowledgment_timer_per_segment_ms: default_ack_per_segment_ms(),
            allow_iv_index_recovery_over_42: false,
            iv_update_test_mode: false,
            proxy_mtu: default_proxy_mtu(),
        }
    }
}

impl MeshConfig {
    /// Parses and validates a JSON configuration.
    ///
    /// # Errors
    /// - `ConfigError::Parse`: malformed JSON or wrong field types
    /// - see [`MeshConfig::validate`]
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: MeshConfig =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// # Errors
    /// - `ConfigError::InvalidTtl`: TTL 1 or above 127
    /// - `ConfigError::InvalidMtu`: MTU below 2
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_ttl == 1 || self.default_ttl > 127 {
            return Err(ConfigError::InvalidTtl(self.default_ttl));
        }
        if self.proxy_mtu < 2 {
            return Err(ConfigError::InvalidMtu(self.proxy_mtu));
        }
        Ok(())
    }

    /// ACK timer of an incoming segmented message with the given SegN.
    pub fn acknowledgment_timer_ms(&self, seg_n: u8) -> u64 {
        self.acknowledgment_timer_base_ms + self.acknowledgment_timer_per_segment_ms * u64::from(seg_n)
    }

    /// Overwrite rule flags for the current IV Recovery state.
    pub fn iv_update_policy(&self, iv_recovery_active: bool) -> IvUpdatePolicy {
        IvUpdatePolicy {
            iv_recovery_active,
            test_mode: self.iv_update_test_mode,
            unlimited_recovery_allowed: self.allow_iv_index_recovery_over_42,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_json() {
        let config = MeshConfig::from_json("{}").unwrap();
        assert_eq!(config, MeshConfig::default());
        assert_eq!(config.default_ttl, 5);
        assert_eq!(config.proxy_mtu, 22);
        assert_eq!(config.acknowledgment_timer_ms(0), 150);
        assert_eq!(config.acknowledgment_timer_ms(3), 300);
    }

    #[test]
    fn test_partial_json() {
        let config = MeshConfig::from_json(
            r#"{"default_ttl": 0, "iv_update_test_mode": true, "proxy_mtu": 64}"#,
        )
        .unwrap();
        assert_eq!(config.default_ttl, 0);
        assert_eq!(config.proxy_mtu, 64);
        let policy = config.iv_update_policy(true);
        assert!(policy.test_mode);
        assert!(policy.iv_recovery_active);
        assert!(!policy.unlimited_recovery_allowed);
    }

    #[test]
    fn test_invalid_values() {
        assert_eq!(
            MeshConfig::from_json(r#"{"default_ttl": 1}"#),
            Err(ConfigError::InvalidTtl(1))
        );
        assert_eq!(
            MeshConfig::from_json(r#"{"default_ttl": 128}"#),
            Err(ConfigError::InvalidTtl(128))
        );
        assert_eq!(
            MeshConfig::from_json(r#"{"proxy_mtu": 1}"#),
            Err(ConfigError::InvalidMtu(1))
        );
        assert!(matches!(
            MeshConfig::from_json(r#"{"default_ttl": "five"}"#),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_json_round_trip() {
        let config = MeshConfig { allow_iv_index_recovery_over_42: true, ..Default::default() };
        assert_eq!(MeshConfig::from_json(&config.to_json()).unwrap(), config);
    }
}
