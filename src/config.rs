use crate::error::{JournalError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const MIN_ORDER: u8 = 12;
pub const MAX_ORDER: u8 = 64;

/// Tunables for one journal. `order` and `splay_width` are immutable once
/// the header is created; the flush knobs shape appender batching and the
/// commit interval bounds commit-position write coalescing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalConfig {
    /// Coalescing window for commit-position writes, in seconds.
    pub commit_interval_secs: f64,
    /// Appender batch size in entries; zero flushes on every append.
    pub flush_interval: u32,
    /// Appender batch size in bytes; zero flushes on every append.
    pub flush_bytes: u64,
    /// Maximum appender batch age in seconds; zero disables the age timer.
    pub flush_age_secs: f64,
    /// Data object size exponent: objects hold up to `2^order` bytes.
    pub order: u8,
    /// Number of data objects per active set.
    pub splay_width: u8,
    /// Pool hosting the data objects; -1 uses the header's container.
    pub data_pool_id: i64,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            commit_interval_secs: 5.0,
            flush_interval: 0,
            flush_bytes: 0,
            flush_age_secs: 0.0,
            order: 24,
            splay_width: 4,
            data_pool_id: -1,
        }
    }
}

impl JournalConfig {
    pub fn validate(&self) -> Result<()> {
        if self.order < MIN_ORDER || self.order > MAX_ORDER {
            return Err(JournalError::Domain(format!(
                "order {} outside [{}, {}]",
                self.order, MIN_ORDER, MAX_ORDER
            )));
        }
        if self.splay_width == 0 {
            return Err(JournalError::invalid("splay width must be non-zero"));
        }
        if self.commit_interval_secs < 0.0
            || !self.commit_interval_secs.is_finite()
        {
            return Err(JournalError::invalid("commit interval must be non-negative"));
        }
        if self.flush_age_secs < 0.0 || !self.flush_age_secs.is_finite() {
            return Err(JournalError::invalid("flush age must be non-negative"));
        }
        Ok(())
    }

    pub fn commit_interval(&self) -> Duration {
        Duration::from_secs_f64(self.commit_interval_secs)
    }

    pub fn flush_age(&self) -> Option<Duration> {
        if self.flush_age_secs > 0.0 {
            Some(Duration::from_secs_f64(self.flush_age_secs))
        } else {
            None
        }
    }

    pub fn object_soft_max_size(&self) -> u64 {
        1u64 << self.order
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = JournalConfig::default();
        config.validate().unwrap();
        assert_eq!(config.object_soft_max_size(), 1 << 24);
        assert_eq!(config.flush_age(), None);
    }

    #[test]
    fn order_bounds_are_domain_errors() {
        let mut config = JournalConfig {
            order: 11,
            ..JournalConfig::default()
        };
        assert!(matches!(config.validate(), Err(JournalError::Domain(_))));
        config.order = 65;
        assert!(matches!(config.validate(), Err(JournalError::Domain(_))));
        config.order = 12;
        config.validate().unwrap();
        config.order = 64;
        config.validate().unwrap();
    }

    #[test]
    fn zero_splay_width_is_invalid() {
        let config = JournalConfig {
            splay_width: 0,
            ..JournalConfig::default()
        };
        assert!(matches!(config.validate(), Err(JournalError::Invalid(_))));
    }

    #[test]
    fn json_round_trip() {
        let config = JournalConfig {
            commit_interval_secs: 0.25,
            flush_interval: 16,
            flush_bytes: 1 << 20,
            flush_age_secs: 1.5,
            order: 22,
            splay_width: 8,
            data_pool_id: 3,
        };
        let json = serde_json::to_string(&config).unwrap();
        let parsed: JournalConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }
}
