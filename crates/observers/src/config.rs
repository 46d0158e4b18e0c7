//! Storage plugin configuration

use crate::error::{ObserverError, Result};
use drivenet_types::MosaicId;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Network-wide parameters of the storage state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Process storage notifications at all
    pub enabled: bool,
    /// Target number of members in download and data modification shards
    pub shard_size: u8,
    /// Replicator count below which a drive is considered under-served
    pub min_replicator_count: u16,
    /// Interval between storage payments of a drive
    pub storage_billing_period_secs: u64,
    /// Interval between download approval rounds of a channel
    pub download_billing_period_secs: u64,
    /// Average interval between verifications of a drive
    pub verification_interval_secs: u64,
    /// Expected block interval
    pub block_generation_time_secs: u64,
    /// Additional verification duration per megabyte of drive size (milliseconds)
    pub verification_expiration_coefficient: u64,
    /// Base verification duration
    pub verification_expiration_constant_secs: u64,
    pub currency_mosaic_id: MosaicId,
    pub storage_mosaic_id: MosaicId,
    pub streaming_mosaic_id: MosaicId,
    /// Bind the onboarding node boot key to the replicator entry
    pub enable_replicator_boot_key_binding: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            shard_size: 20,
            min_replicator_count: 4,
            storage_billing_period_secs: 7 * 24 * 60 * 60, // 1 week
            download_billing_period_secs: 24 * 60 * 60,    // 1 day
            verification_interval_secs: 4 * 60 * 60,      // 4 hours
            block_generation_time_secs: 15,
            verification_expiration_coefficient: 60,
            verification_expiration_constant_secs: 10 * 60,
            currency_mosaic_id: MosaicId(0x6BED_913F_A202_23F8),
            storage_mosaic_id: MosaicId(0x3D02_B5E1_F2E6_1B3D),
            streaming_mosaic_id: MosaicId(0x53E6_D1C2_2E8B_02A0),
            enable_replicator_boot_key_binding: false,
        }
    }
}

impl StorageConfig {
    /// Parse a TOML document; missing fields take their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: StorageConfig = toml::from_str(content)
            .map_err(|e| ObserverError::InvalidConfig(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading storage configuration from: {}", path.display());

        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;

        info!("Storage configuration loaded successfully");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.shard_size == 0 {
            return Err(ObserverError::InvalidConfig(
                "shard_size must be positive".to_string(),
            ));
        }
        if self.min_replicator_count == 0 {
            return Err(ObserverError::InvalidConfig(
                "min_replicator_count must be positive".to_string(),
            ));
        }
        if self.storage_billing_period_secs == 0 || self.download_billing_period_secs == 0 {
            return Err(ObserverError::InvalidConfig(
                "billing periods must be positive".to_string(),
            ));
        }
        if self.block_generation_time_secs == 0 {
            return Err(ObserverError::InvalidConfig(
                "block_generation_time_secs must be positive".to_string(),
            ));
        }
        let mosaics = [
            self.currency_mosaic_id,
            self.storage_mosaic_id,
            self.streaming_mosaic_id,
        ];
        if mosaics[0] == mosaics[1] || mosaics[0] == mosaics[2] || mosaics[1] == mosaics[2] {
            return Err(ObserverError::InvalidConfig(
                "currency, storage and streaming mosaics must differ".to_string(),
            ));
        }
        Ok(())
    }

    pub fn shard_size(&self) -> usize {
        self.shard_size as usize
    }

    pub fn storage_billing_period_ms(&self) -> u64 {
        self.storage_billing_period_secs.saturating_mul(1000)
    }

    pub fn download_billing_period_ms(&self) -> u64 {
        self.download_billing_period_secs.saturating_mul(1000)
    }

    /// Number of blocks per verification interval, at least one.
    pub fn verification_factor(&self) -> u64 {
        (self.verification_interval_secs / self.block_generation_time_secs).max(1)
    }

    /// Time a drive of `size_mb` is given to complete a verification.
    pub fn verification_duration_ms(&self, size_mb: u64) -> u64 {
        self.verification_expiration_constant_secs
            .saturating_mul(1000)
            .saturating_add(self.verification_expiration_coefficient.saturating_mul(size_mb))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        StorageConfig::default().validate().unwrap();
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let config = StorageConfig::from_toml_str(
            r#"
            shard_size = 4
            min_replicator_count = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.shard_size, 4);
        assert_eq!(config.min_replicator_count, 3);
        assert_eq!(
            config.storage_billing_period_secs,
            StorageConfig::default().storage_billing_period_secs
        );
    }

    #[test]
    fn rejects_zero_shard_size() {
        let err = StorageConfig::from_toml_str("shard_size = 0").unwrap_err();
        assert!(matches!(err, ObserverError::InvalidConfig(_)));
    }

    #[test]
    fn rejects_shared_mosaics() {
        let config = StorageConfig {
            streaming_mosaic_id: StorageConfig::default().storage_mosaic_id,
            ..StorageConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "verification_interval_secs = 60").unwrap();
        writeln!(file, "block_generation_time_secs = 15").unwrap();
        let config = StorageConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.verification_factor(), 4);
    }

    #[test]
    fn verification_duration_scales_with_size() {
        let config = StorageConfig {
            verification_expiration_constant_secs: 10,
            verification_expiration_coefficient: 5,
            ..StorageConfig::default()
        };
        assert_eq!(config.verification_duration_ms(100), 10_500);
    }
}
