//! Conduit configuration.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConduitConfig {
    /// Number of worker slots. Bounds concurrency in both modes.
    pub pod_count: usize,
    /// Recycle a fixed pool of pods through the free-list instead of
    /// building a fresh pod per message.
    #[serde(default)]
    pub reuse_pods: bool,
}

impl Default for ConduitConfig {
    fn default() -> Self {
        Self {
            pod_count: 3,
            reuse_pods: false,
        }
    }
}

impl ConduitConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pod_count == 0 {
            return Err(ConfigError::ZeroPodCount);
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("pod_count must be at least 1")]
    ZeroPodCount,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_pods_rejected() {
        let config = ConduitConfig {
            pod_count: 0,
            reuse_pods: false,
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroPodCount)
        ));
    }

    #[test]
    fn reuse_defaults_to_false_on_the_wire() {
        let config: ConduitConfig = serde_json::from_str(r#"{"pod_count": 5}"#).unwrap();
        assert_eq!(config.pod_count, 5);
        assert!(!config.reuse_pods);
        config.validate().unwrap();
    }
}
