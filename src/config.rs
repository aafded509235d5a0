//! Engine configuration.

use serde::{Deserialize, Serialize};

use crate::error::UekvaultError;

/// Minimum Argon2id memory cost in KiB (64 MiB).
pub const MIN_KDF_MEMORY_KIB: u32 = 64 * 1024;

/// Minimum Argon2id pass count.
pub const MIN_KDF_ITERATIONS: u32 = 3;

/// Minimum Argon2id lane count.
pub const MIN_KDF_PARALLELISM: u32 = 4;

/// Argon2id cost parameters. The output length is fixed at 32 bytes.
///
/// Recorded inside every [`UekEnvelope`](crate::model::UekEnvelope) so an
/// envelope always opens with the parameters that sealed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: MIN_KDF_MEMORY_KIB,
            iterations: MIN_KDF_ITERATIONS,
            parallelism: MIN_KDF_PARALLELISM,
        }
    }
}

impl KdfParams {
    /// Reject parameters below the memory-hardness floor.
    pub fn validate(&self) -> Result<(), UekvaultError> {
        if self.memory_kib < MIN_KDF_MEMORY_KIB {
            return Err(UekvaultError::Config(format!(
                "kdf memory {} KiB is below the {} KiB floor",
                self.memory_kib, MIN_KDF_MEMORY_KIB
            )));
        }
        if self.iterations < MIN_KDF_ITERATIONS {
            return Err(UekvaultError::Config(format!(
                "kdf iterations {} is below the floor of {}",
                self.iterations, MIN_KDF_ITERATIONS
            )));
        }
        if self.parallelism < MIN_KDF_PARALLELISM {
            return Err(UekvaultError::Config(format!(
                "kdf parallelism {} is below the floor of {}",
                self.parallelism, MIN_KDF_PARALLELISM
            )));
        }
        Ok(())
    }
}

/// Configuration for the [`KeyRotationEngine`](crate::rotation::KeyRotationEngine).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// KDF parameters applied to newly sealed envelopes.
    pub kdf: KdfParams,

    /// Upper bound on threads migrating resources within one rotation.
    pub workers: usize,

    /// Resources requested per store page.
    pub page_size: usize,

    /// Re-read-and-retry budget per resource after a rejected
    /// compare-and-swap.
    pub max_cas_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            kdf: KdfParams::default(),
            workers: 4,
            page_size: 256,
            max_cas_retries: 3,
        }
    }
}

impl EngineConfig {
    /// Parse a JSON document. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, UekvaultError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| UekvaultError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), UekvaultError> {
        self.kdf.validate()?;
        if self.workers == 0 {
            return Err(UekvaultError::Config("workers must be at least 1".into()));
        }
        if self.page_size == 0 {
            return Err(UekvaultError::Config("page_size must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_meet_the_floor() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config = EngineConfig::from_json(r#"{ "workers": 8 }"#).unwrap();
        assert_eq!(config.workers, 8);
        assert_eq!(config.page_size, 256);
        assert_eq!(config.kdf, KdfParams::default());
    }

    #[test]
    fn test_weak_kdf_rejected() {
        let json = r#"{ "kdf": { "memory_kib": 1024, "iterations": 3, "parallelism": 4 } }"#;
        assert!(matches!(
            EngineConfig::from_json(json),
            Err(UekvaultError::Config(_))
        ));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let config = EngineConfig {
            workers: 0,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
