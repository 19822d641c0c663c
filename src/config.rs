//! Bridge configuration.

use serde::{Deserialize, Serialize};

use crate::error::{BridgeResult, ValidationError};
use crate::transport::TransportConfig;

/// Configuration for a `QueryBridge`.
///
/// Every field has a default, so a partial JSON document is enough:
///
/// ```
/// use querybridge::BridgeConfig;
///
/// let cfg = BridgeConfig::from_json(r#"{"transport": {"event_queue_capacity": 16}}"#).unwrap();
/// assert_eq!(cfg.transport.event_queue_capacity, 16);
/// assert_eq!(cfg.transport.request_timeout_ms, 5_000);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Boundary queue sizes and timeouts.
    pub transport: TransportConfig,
}

impl BridgeConfig {
    /// Load from a JSON document; missing fields take their defaults.
    pub fn from_json(json: &str) -> BridgeResult<Self> {
        let cfg: Self = serde_json::from_str(json).map_err(|e| ValidationError::InvalidConfig {
            reason: e.to_string(),
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject zero capacities and timeouts.
    pub fn validate(&self) -> BridgeResult<()> {
        let checks = [
            ("transport.request_queue_capacity", self.transport.request_queue_capacity as u64),
            ("transport.event_queue_capacity", self.transport.event_queue_capacity as u64),
            ("transport.request_timeout_ms", self.transport.request_timeout_ms),
            ("transport.max_frame_bytes", self.transport.max_frame_bytes as u64),
        ];
        for (field, value) in checks {
            if value == 0 {
                return Err(ValidationError::InvalidConfig {
                    reason: format!("{field} must be greater than zero"),
                }
                .into());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        BridgeConfig::default().validate().unwrap();
    }

    #[test]
    fn nested_overrides_keep_other_defaults() {
        let cfg = BridgeConfig::from_json(r#"{"transport": {"request_timeout_ms": 250}}"#).unwrap();
        assert_eq!(cfg.transport.request_timeout_ms, 250);
        assert_eq!(cfg.transport.event_queue_capacity, 4096);
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let err = BridgeConfig::from_json(r#"{"transport": {"event_queue_capacity": 0}}"#).unwrap_err();
        assert!(err.is_validation());
        assert!(err.to_string().contains("event_queue_capacity"));
    }

    #[test]
    fn malformed_json_is_rejected() {
        assert!(BridgeConfig::from_json("{").unwrap_err().is_validation());
    }
}
