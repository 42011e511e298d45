//! Allocator tunables
//!
//! Process-wide knobs parsed once from the `PYTORCH_NPU_ALLOC_CONF`
//! environment string, a comma-separated list of `key:value` pairs:
//!
//! - `max_split_size_mb`: blocks at least this large (in MiB) are never
//!   split, so huge cached blocks cannot be nibbled into fragments. Must be
//!   larger than the 20 MiB large-buffer size. Default: unlimited.
//! - `garbage_collection_threshold`: fraction in (0, 1) of the memory cap
//!   above which allocation pressure preemptively releases aged free
//!   blocks. Default: 0 (disabled).
//!
//! Unknown keys are a hard error.

use once_cell::sync::Lazy;

use super::block::LARGE_BUFFER;
use crate::error::{AllocResult, NpuAllocError};

/// Environment variable holding the allocator configuration.
pub const ALLOC_CONF_ENV: &str = "PYTORCH_NPU_ALLOC_CONF";

const MIB: usize = 1024 * 1024;

/// Parsed allocator configuration.
#[derive(Debug, Clone)]
pub struct AllocatorConfig {
    max_split_size: usize,
    garbage_collection_threshold: f64,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        AllocatorConfig {
            max_split_size: usize::MAX,
            garbage_collection_threshold: 0.0,
        }
    }
}

impl AllocatorConfig {
    /// Read the configuration from [`ALLOC_CONF_ENV`]; an unset variable
    /// yields the defaults, a malformed one is a hard error.
    pub fn from_env() -> AllocResult<Self> {
        match std::env::var(ALLOC_CONF_ENV) {
            Ok(conf) => Self::parse(&conf),
            Err(_) => Ok(Self::default()),
        }
    }

    /// Parse a configuration string like
    /// `max_split_size_mb:200,garbage_collection_threshold:0.6`.
    pub fn parse(conf: &str) -> AllocResult<Self> {
        let mut config = Self::default();
        for entry in conf.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            let (key, value) = entry.split_once(':').ok_or_else(|| {
                NpuAllocError::InvalidConfig(format!("expected key:value, got '{}'", entry))
            })?;
            match key.trim() {
                "max_split_size_mb" => config.set_max_split_size_mb(parse_number(value)?)?,
                "garbage_collection_threshold" => {
                    config.set_garbage_collection_threshold(parse_number(value)?)?
                }
                other => {
                    return Err(NpuAllocError::InvalidConfig(format!(
                        "unrecognized option: {}",
                        other
                    )))
                }
            }
        }
        Ok(config)
    }

    fn set_max_split_size_mb(&mut self, mb: u64) -> AllocResult<()> {
        let floor_mb = (LARGE_BUFFER / MIB) as u64;
        if mb <= floor_mb {
            return Err(NpuAllocError::InvalidConfig(format!(
                "max_split_size_mb too small, must be > {}",
                floor_mb
            )));
        }
        let mb = mb.clamp(floor_mb, (usize::MAX / MIB) as u64);
        self.max_split_size = mb as usize * MIB;
        Ok(())
    }

    fn set_garbage_collection_threshold(&mut self, threshold: f64) -> AllocResult<()> {
        if threshold <= 0.0 || threshold >= 1.0 {
            return Err(NpuAllocError::InvalidConfig(format!(
                "garbage_collection_threshold must be within (0.0, 1.0), got {}",
                threshold
            )));
        }
        self.garbage_collection_threshold = threshold;
        Ok(())
    }

    /// Blocks at least this many bytes are excluded from splitting.
    pub fn max_split_size(&self) -> usize {
        self.max_split_size
    }

    /// Whether a split limit was configured at all.
    pub fn has_max_split_size(&self) -> bool {
        self.max_split_size != usize::MAX
    }

    /// GC trigger fraction of the memory cap; 0 disables GC.
    pub fn garbage_collection_threshold(&self) -> f64 {
        self.garbage_collection_threshold
    }

    /// Builder used by tests and embedders that bypass the environment.
    pub fn with_max_split_size_mb(mut self, mb: u64) -> AllocResult<Self> {
        self.set_max_split_size_mb(mb)?;
        Ok(self)
    }

    pub fn with_garbage_collection_threshold(mut self, threshold: f64) -> AllocResult<Self> {
        self.set_garbage_collection_threshold(threshold)?;
        Ok(self)
    }
}

fn parse_number<T: std::str::FromStr>(value: &str) -> AllocResult<T> {
    value.trim().parse::<T>().map_err(|_| {
        NpuAllocError::InvalidConfig(format!("expected a numeric value, got '{}'", value.trim()))
    })
}

/// Process-wide configuration, parsed from the environment on first use.
/// A malformed variable poisons every allocation with the same error
/// message rather than silently falling back to defaults.
static PROCESS_CONFIG: Lazy<AllocResult<AllocatorConfig>> = Lazy::new(AllocatorConfig::from_env);

/// The process-wide configuration from [`ALLOC_CONF_ENV`].
pub fn process_config() -> AllocResult<AllocatorConfig> {
    match &*PROCESS_CONFIG {
        Ok(config) => Ok(config.clone()),
        Err(err) => Err(NpuAllocError::InvalidConfig(err.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_defaults() {
        let config = AllocatorConfig::default();
        assert_eq!(config.max_split_size(), usize::MAX);
        assert!(!config.has_max_split_size());
        assert_eq!(config.garbage_collection_threshold(), 0.0);
    }

    #[test]
    fn test_parse_both_keys() {
        let config =
            AllocatorConfig::parse("max_split_size_mb:200,garbage_collection_threshold:0.6")
                .unwrap();
        assert_eq!(config.max_split_size(), 200 * MIB);
        assert!(config.has_max_split_size());
        assert_eq!(config.garbage_collection_threshold(), 0.6);
    }

    #[test]
    fn test_parse_tolerates_whitespace_and_empty_entries() {
        let config = AllocatorConfig::parse(" max_split_size_mb : 64 ,, ").unwrap();
        assert_eq!(config.max_split_size(), 64 * MIB);
    }

    #[test]
    fn test_parse_empty_string_is_default() {
        let config = AllocatorConfig::parse("").unwrap();
        assert_eq!(config.max_split_size(), usize::MAX);
    }

    #[test]
    fn test_unknown_key_is_hard_error() {
        let err = AllocatorConfig::parse("roundup_power2:1").unwrap_err();
        assert!(err.to_string().contains("unrecognized"));
    }

    #[test]
    fn test_max_split_at_or_below_large_buffer_rejected() {
        assert!(AllocatorConfig::parse("max_split_size_mb:20").is_err());
        assert!(AllocatorConfig::parse("max_split_size_mb:1").is_err());
        assert!(AllocatorConfig::parse("max_split_size_mb:21").is_ok());
    }

    #[test]
    fn test_gc_threshold_open_interval() {
        assert!(AllocatorConfig::parse("garbage_collection_threshold:0").is_err());
        assert!(AllocatorConfig::parse("garbage_collection_threshold:1").is_err());
        assert!(AllocatorConfig::parse("garbage_collection_threshold:1.5").is_err());
        assert!(AllocatorConfig::parse("garbage_collection_threshold:0.01").is_ok());
    }

    #[test]
    fn test_malformed_pairs_rejected() {
        assert!(AllocatorConfig::parse("max_split_size_mb").is_err());
        assert!(AllocatorConfig::parse("max_split_size_mb:abc").is_err());
        assert!(AllocatorConfig::parse("garbage_collection_threshold:").is_err());
    }

    #[test]
    #[serial]
    fn test_from_env_reads_variable() {
        std::env::set_var(ALLOC_CONF_ENV, "max_split_size_mb:128");
        let config = AllocatorConfig::from_env().unwrap();
        assert_eq!(config.max_split_size(), 128 * MIB);

        std::env::remove_var(ALLOC_CONF_ENV);
        let config = AllocatorConfig::from_env().unwrap();
        assert!(!config.has_max_split_size());
    }
}
