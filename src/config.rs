//! Cache Configuration
//!
//! YAML-loadable description of a layered cache. Durations are human strings
//! (`"250ms"`, `"30s"`, `"5m"`, `"1h"`, `"1d"`, or combinations like `"1h30m"`).
//!
//! ```yaml
//! promoteEnabled: true
//! writeBack: true
//! writeBackInterval: 2s
//! layers:
//!   - type: memory
//!     maxSize: 1000
//!     ttl: 5m
//!     policy: lru
//!   - type: disk
//!     baseDir: /var/cache/quotes
//!     ttl: 1h
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::disk::{DiskConfig, DEFAULT_DISK_MAX_SIZE};
use crate::cache::layered::LayeredOptions;
use crate::cache::memory::{MemoryConfig, DEFAULT_MEMORY_MAX_SIZE};
use crate::cache::policy::PolicyKind;
use crate::cache::remote::MockRemoteConfig;
use crate::error::{CacheError, Result};

/// Tier implementation of a layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerKind {
    Memory,
    Disk,
    Remote,
}

impl LayerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LayerKind::Memory => "memory",
            LayerKind::Disk => "disk",
            LayerKind::Remote => "remote",
        }
    }
}

impl std::fmt::Display for LayerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One tier of a layered cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerConfig {
    /// Written as `type`; `kind` is still read
    #[serde(rename = "type", alias = "kind")]
    pub kind: LayerKind,

    /// Maximum entries (0 = unbounded)
    #[serde(default = "default_max_size")]
    pub max_size: usize,

    /// Default entry lifetime
    #[serde(default = "default_ttl")]
    pub ttl: String,

    /// Disabled layers are built but skipped by get, set and promotion
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Eviction policy (memory: oldest-created scan when unset, disk: lru)
    #[serde(default)]
    pub policy: Option<PolicyKind>,

    /// Reaper period, "0s" disables it
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval: String,

    /// Disk only: root directory
    #[serde(default)]
    pub base_dir: Option<PathBuf>,

    /// Disk only: sub-directory for this layer's files
    #[serde(default)]
    pub file_prefix: Option<String>,

    /// Remote mock only: simulated latency
    #[serde(default)]
    pub latency: Option<String>,
}

fn default_max_size() -> usize {
    DEFAULT_MEMORY_MAX_SIZE
}

fn default_ttl() -> String {
    "5m".to_string()
}

fn default_true() -> bool {
    true
}

fn default_cleanup_interval() -> String {
    "1m".to_string()
}

fn default_write_back_interval() -> String {
    "5s".to_string()
}

fn default_write_back_threshold() -> usize {
    100
}

fn default_promotion_workers() -> usize {
    4
}

fn default_promotion_queue_capacity() -> usize {
    1024
}

impl LayerConfig {
    /// Parse the default TTL
    pub fn ttl(&self) -> Result<Duration> {
        parse_duration(&self.ttl)
    }

    /// Parse the reaper period
    pub fn cleanup_interval(&self) -> Result<Duration> {
        parse_duration(&self.cleanup_interval)
    }

    pub fn memory_config(&self) -> Result<MemoryConfig> {
        Ok(MemoryConfig {
            max_size: self.max_size,
            ttl: self.ttl()?,
            cleanup_interval: self.cleanup_interval()?,
            policy: self.policy,
        })
    }

    pub fn disk_config(&self) -> Result<DiskConfig> {
        let base_dir = self
            .base_dir
            .clone()
            .ok_or_else(|| CacheError::Config("disk layer requires baseDir".to_string()))?;
        let mut config = DiskConfig::new(base_dir);
        if let Some(prefix) = &self.file_prefix {
            config.file_prefix = prefix.clone();
        }
        config.max_size = self.max_size;
        config.ttl = self.ttl()?;
        config.cleanup_interval = self.cleanup_interval()?;
        config.policy = self.policy.unwrap_or(PolicyKind::Lru);
        Ok(config)
    }

    pub fn remote_config(&self) -> Result<MockRemoteConfig> {
        let latency = match &self.latency {
            Some(latency) => parse_duration(latency)?,
            None => Duration::ZERO,
        };
        Ok(MockRemoteConfig {
            max_size: self.max_size,
            ttl: self.ttl()?,
            latency,
        })
    }

    fn validate(&self, index: usize) -> Result<()> {
        let invalid =
            |msg: String| CacheError::Config(format!("layer {} ({}): {}", index, self.kind, msg));

        if self.ttl()?.is_zero() {
            return Err(invalid("ttl must be greater than 0".to_string()));
        }
        self.cleanup_interval()?;

        match self.kind {
            LayerKind::Disk => {
                let dir = self.base_dir.as_deref().unwrap_or(Path::new(""));
                if dir.as_os_str().is_empty() {
                    return Err(invalid("baseDir is required".to_string()));
                }
                if let Some(prefix) = &self.file_prefix {
                    if prefix.is_empty() || prefix.contains(['/', '\\']) || prefix == ".." {
                        return Err(invalid(format!("invalid filePrefix {:?}", prefix)));
                    }
                }
            }
            LayerKind::Remote => {
                if let Some(latency) = &self.latency {
                    parse_duration(latency)?;
                }
            }
            LayerKind::Memory => {}
        }
        Ok(())
    }
}

/// A complete layered cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayeredCacheConfig {
    /// Tiers, fastest first
    pub layers: Vec<LayerConfig>,

    #[serde(default = "default_true")]
    pub promote_enabled: bool,

    #[serde(default)]
    pub write_through: bool,

    #[serde(default)]
    pub write_back: bool,

    #[serde(default = "default_write_back_interval")]
    pub write_back_interval: String,

    #[serde(default = "default_write_back_threshold")]
    pub write_back_threshold: usize,

    /// Bound on every tier call, unbounded when unset
    #[serde(default)]
    pub operation_timeout: Option<String>,

    #[serde(default = "default_promotion_workers")]
    pub promotion_workers: usize,

    #[serde(default = "default_promotion_queue_capacity")]
    pub promotion_queue_capacity: usize,
}

impl LayeredCacheConfig {
    /// Read and validate a YAML file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| CacheError::io(path, e))?;
        Self::from_yaml(&raw)
    }

    /// Parse and validate YAML text
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(raw)
            .map_err(|e| CacheError::Config(format!("invalid cache config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| CacheError::Config(e.to_string()))
    }

    /// Check structural rules
    pub fn validate(&self) -> Result<()> {
        if self.layers.is_empty() {
            return Err(CacheError::Config(
                "at least one layer is required".to_string(),
            ));
        }
        for (index, layer) in self.layers.iter().enumerate() {
            layer.validate(index)?;
        }
        if !self.layers.iter().any(|l| l.enabled) {
            return Err(CacheError::Config(
                "at least one layer must be enabled".to_string(),
            ));
        }

        parse_duration(&self.write_back_interval)?;
        if self.write_back
            && self.write_back_threshold == 0
            && parse_duration(&self.write_back_interval)?.is_zero()
        {
            return Err(CacheError::Config(
                "write-back needs a non-zero writeBackInterval or writeBackThreshold".to_string(),
            ));
        }
        if let Some(timeout) = &self.operation_timeout {
            if parse_duration(timeout)?.is_zero() {
                return Err(CacheError::Config(
                    "operationTimeout must be greater than 0".to_string(),
                ));
            }
        }
        if self.promote_enabled && self.promotion_workers == 0 {
            return Err(CacheError::Config(
                "promotionWorkers must be greater than 0".to_string(),
            ));
        }
        if self.promote_enabled && self.promotion_queue_capacity == 0 {
            return Err(CacheError::Config(
                "promotionQueueCapacity must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Composite knobs with durations parsed
    pub fn options(&self) -> Result<LayeredOptions> {
        Ok(LayeredOptions {
            promote_enabled: self.promote_enabled,
            write_through: self.write_through,
            write_back: self.write_back,
            write_back_interval: parse_duration(&self.write_back_interval)?,
            write_back_threshold: self.write_back_threshold,
            operation_timeout: self
                .operation_timeout
                .as_deref()
                .map(parse_duration)
                .transpose()?,
            promotion_workers: self.promotion_workers,
            promotion_queue_capacity: self.promotion_queue_capacity,
        })
    }
}

impl Default for LayeredCacheConfig {
    fn default() -> Self {
        default_layered_config()
    }
}

// =============================================================================
// Factories
// =============================================================================

/// Memory tier in front of a disk tier under the system temp directory
pub fn default_layered_config() -> LayeredCacheConfig {
    LayeredCacheConfig {
        layers: vec![
            memory_layer(),
            disk_layer(std::env::temp_dir().join("layercache")),
        ],
        promote_enabled: true,
        write_through: false,
        write_back: false,
        write_back_interval: default_write_back_interval(),
        write_back_threshold: default_write_back_threshold(),
        operation_timeout: None,
        promotion_workers: default_promotion_workers(),
        promotion_queue_capacity: default_promotion_queue_capacity(),
    }
}

/// Memory layer: 10k entries, 5m TTL, LRU
pub fn memory_layer() -> LayerConfig {
    LayerConfig {
        kind: LayerKind::Memory,
        max_size: DEFAULT_MEMORY_MAX_SIZE,
        ttl: "5m".to_string(),
        enabled: true,
        policy: Some(PolicyKind::Lru),
        cleanup_interval: "1m".to_string(),
        base_dir: None,
        file_prefix: None,
        latency: None,
    }
}

/// Disk layer rooted at `base_dir`: 100k entries, 1h TTL, LRU
pub fn disk_layer(base_dir: impl Into<PathBuf>) -> LayerConfig {
    LayerConfig {
        kind: LayerKind::Disk,
        max_size: DEFAULT_DISK_MAX_SIZE,
        ttl: "1h".to_string(),
        enabled: true,
        policy: Some(PolicyKind::Lru),
        cleanup_interval: "5m".to_string(),
        base_dir: Some(base_dir.into()),
        file_prefix: Some("cache".to_string()),
        latency: None,
    }
}

/// Remote layer: unbounded, 24h TTL
pub fn remote_layer() -> LayerConfig {
    LayerConfig {
        kind: LayerKind::Remote,
        max_size: 0,
        ttl: "24h".to_string(),
        enabled: true,
        policy: None,
        cleanup_interval: "0s".to_string(),
        base_dir: None,
        file_prefix: None,
        latency: None,
    }
}

// =============================================================================
// Duration Parsing
// =============================================================================

/// Parse a duration string like "250ms", "30s", "5m", "1h", "1d" or "1h30m".
///
/// A bare number is seconds. Zero is allowed.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(CacheError::Config("empty duration string".to_string()));
    }

    let mut total_ms: u64 = 0;
    let mut num_buf = String::new();
    let mut unit_buf = String::new();

    let mut apply = |num_buf: &mut String, unit_buf: &mut String| -> Result<()> {
        let num: u64 = num_buf
            .parse()
            .map_err(|_| CacheError::Config(format!("invalid number in duration: {}", s)))?;
        let multiplier = match unit_buf.to_ascii_lowercase().as_str() {
            "ms" => 1,
            "s" | "" => 1_000,
            "m" => 60_000,
            "h" => 3_600_000,
            "d" => 86_400_000,
            other => {
                return Err(CacheError::Config(format!(
                    "unknown duration unit: {}",
                    other
                )))
            }
        };
        total_ms = num
            .checked_mul(multiplier)
            .and_then(|ms| total_ms.checked_add(ms))
            .ok_or_else(|| CacheError::Config(format!("duration overflow: {}", s)))?;
        num_buf.clear();
        unit_buf.clear();
        Ok(())
    };

    for c in s.chars() {
        if c.is_ascii_digit() {
            if !unit_buf.is_empty() {
                apply(&mut num_buf, &mut unit_buf)?;
            }
            num_buf.push(c);
        } else if c.is_ascii_alphabetic() {
            if num_buf.is_empty() {
                return Err(CacheError::Config(format!("invalid duration: {}", s)));
            }
            unit_buf.push(c);
        } else {
            return Err(CacheError::Config(format!("invalid duration: {}", s)));
        }
    }
    if !num_buf.is_empty() {
        apply(&mut num_buf, &mut unit_buf)?;
    }

    Ok(Duration::from_millis(total_ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    // =========================================================================
    // parse_duration Tests
    // =========================================================================

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("1d").unwrap(), Duration::from_secs(86400));
        assert_eq!(parse_duration("1H").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("2MS").unwrap(), Duration::from_millis(2));
    }

    #[test]
    fn test_parse_duration_combined() {
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("1m30s500ms").unwrap(), Duration::from_millis(90_500));
    }

    #[test]
    fn test_parse_duration_bare_number_is_seconds() {
        assert_eq!(parse_duration("45").unwrap(), Duration::from_secs(45));
        assert_eq!(parse_duration(" 10s ").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("0s").unwrap(), Duration::ZERO);
    }

    #[test]
    fn test_parse_duration_invalid() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("abc").is_err());
        assert!(parse_duration("10x").is_err());
        assert!(parse_duration("1.5s").is_err());
        assert!(parse_duration("-5s").is_err());
        assert!(parse_duration("99999999999999999999d").is_err());
    }

    // =========================================================================
    // Config Tests
    // =========================================================================

    #[test]
    fn test_yaml_with_defaults() {
        let config = LayeredCacheConfig::from_yaml(
            r#"
layers:
  - type: memory
    maxSize: 2
    policy: lru
  - type: disk
    baseDir: /tmp/quotes
"#,
        )
        .unwrap();

        assert_eq!(config.layers.len(), 2);
        assert!(config.promote_enabled);
        assert!(!config.write_back);
        assert_eq!(config.layers[0].max_size, 2);
        assert_eq!(config.layers[0].policy, Some(PolicyKind::Lru));
        assert_eq!(config.layers[0].ttl().unwrap(), Duration::from_secs(300));

        let disk = config.layers[1].disk_config().unwrap();
        assert_eq!(disk.dir(), PathBuf::from("/tmp/quotes/cache"));
        assert_eq!(disk.policy, PolicyKind::Lru);
    }

    #[test]
    fn test_options_parse_durations() {
        let config = LayeredCacheConfig::from_yaml(
            r#"
writeBack: true
writeBackInterval: 250ms
operationTimeout: 2s
layers:
  - type: memory
"#,
        )
        .unwrap();
        let options = config.options().unwrap();
        assert!(options.write_back);
        assert_eq!(options.write_back_interval, Duration::from_millis(250));
        assert_eq!(options.operation_timeout, Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_validate_rejects_bad_configs() {
        let mut config = default_layered_config();
        config.layers.clear();
        assert_matches!(config.validate(), Err(CacheError::Config(_)));

        let mut config = default_layered_config();
        config.layers[1].base_dir = None;
        assert_matches!(config.validate(), Err(CacheError::Config(msg)) if msg.contains("baseDir"));

        let mut config = default_layered_config();
        config.layers[0].ttl = "0s".to_string();
        assert!(config.validate().is_err());

        let mut config = default_layered_config();
        for layer in &mut config.layers {
            layer.enabled = false;
        }
        assert!(config.validate().is_err());

        let mut config = default_layered_config();
        config.operation_timeout = Some("0ms".to_string());
        assert!(config.validate().is_err());

        let mut config = default_layered_config();
        config.layers[1].file_prefix = Some("../escape".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_layer_type_field() {
        let config = LayeredCacheConfig::from_yaml(
            r#"
layers:
  - type: memory
  - kind: remote
"#,
        )
        .unwrap();
        assert_eq!(config.layers[0].kind, LayerKind::Memory);
        assert_eq!(config.layers[1].kind, LayerKind::Remote);

        let yaml = config.to_yaml().unwrap();
        assert!(yaml.contains("type: memory"), "{}", yaml);
        assert!(!yaml.contains("kind:"), "{}", yaml);
    }

    #[test]
    fn test_unknown_policy_is_rejected() {
        let result = LayeredCacheConfig::from_yaml(
            r#"
layers:
  - type: memory
    policy: random
"#,
        );
        assert_matches!(result, Err(CacheError::Config(_)));
    }

    #[test]
    fn test_factories_are_independent() {
        let mut a = default_layered_config();
        let b = default_layered_config();
        a.layers[0].max_size = 1;
        assert_eq!(b.layers[0].max_size, DEFAULT_MEMORY_MAX_SIZE);
        assert!(b.validate().is_ok());
        assert_eq!(remote_layer().remote_config().unwrap().max_size, 0);
    }

    #[test]
    fn test_yaml_round_trip() {
        let config = default_layered_config();
        let yaml = config.to_yaml().unwrap();
        assert_eq!(LayeredCacheConfig::from_yaml(&yaml).unwrap(), config);
    }

    #[tokio::test]
    async fn test_load_missing_file_is_io_error() {
        let result = LayeredCacheConfig::load("/nonexistent/layercache.yaml").await;
        assert_matches!(result, Err(CacheError::Io { .. }));
    }
}
