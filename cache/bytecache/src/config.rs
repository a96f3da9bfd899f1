//! Cache configuration.

use serde::Deserialize;

use crate::error::CacheError;

/// Configuration for the sharded cache.
///
/// Sizes may be given as plain byte counts or as strings like `"64KB"`,
/// `"8MB"`, `"1GB"` when deserialized from a config file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CacheConfig {
    /// Number of shards; must be a power of two.
    pub shards: usize,

    /// Largest entry (key + value) the cache is tuned for.
    #[serde(deserialize_with = "deserialize_size")]
    pub max_entry_size: usize,

    /// Initial byte-arena capacity per shard.
    #[serde(deserialize_with = "deserialize_size")]
    pub initial_shard_size: usize,

    /// Byte-arena capacity cap per shard; writes fail once a full shard
    /// cannot grow past this.
    #[serde(deserialize_with = "deserialize_size")]
    pub maximum_shard_size: usize,

    /// Default TTL in seconds applied when a write passes a zero TTL.
    /// 0 disables the default, making zero-TTL writes live forever.
    pub life_window: u64,

    /// Log hash collisions and other per-operation detail.
    pub verbose: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            shards: 32,
            max_entry_size: 500,
            initial_shard_size: 64 * 1024,
            maximum_shard_size: 8 * 1024 * 1024,
            life_window: 0,
            verbose: false,
        }
    }
}

impl CacheConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), CacheError> {
        if self.shards == 0 || !self.shards.is_power_of_two() {
            return Err(CacheError::InvalidConfig(format!(
                "shards must be a power of two, got {}",
                self.shards
            )));
        }
        if self.max_entry_size == 0 {
            return Err(CacheError::InvalidConfig(
                "max_entry_size must be non-zero".to_owned(),
            ));
        }
        if self.maximum_shard_size < self.initial_shard_size {
            return Err(CacheError::InvalidConfig(format!(
                "maximum_shard_size ({}) is below initial_shard_size ({})",
                self.maximum_shard_size, self.initial_shard_size
            )));
        }
        Ok(())
    }

    pub(crate) fn initial_shard_bytes(&self) -> usize {
        self.initial_shard_size
    }

    pub(crate) fn max_shard_bytes(&self) -> usize {
        self.maximum_shard_size
    }
}

/// Parse a size string like `"64KB"` or `"8MB"` into bytes.
pub fn parse_size(s: &str) -> Result<usize, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty size string".to_owned());
    }

    let (num_str, suffix) = match s.find(|c: char| c.is_alphabetic()) {
        Some(idx) => (&s[..idx], s[idx..].to_uppercase()),
        None => (s, String::new()),
    };

    let num: usize = num_str
        .trim()
        .parse()
        .map_err(|_| format!("invalid number: {num_str}"))?;

    let multiplier: usize = match suffix.as_str() {
        "" | "B" => 1,
        "K" | "KB" => 1024,
        "M" | "MB" => 1024 * 1024,
        "G" | "GB" => 1024 * 1024 * 1024,
        _ => return Err(format!("unknown size suffix: {suffix}")),
    };

    num.checked_mul(multiplier)
        .ok_or_else(|| "size overflow".to_owned())
}

fn deserialize_size<'de, D>(deserializer: D) -> Result<usize, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum SizeValue {
        Number(usize),
        String(String),
    }

    match SizeValue::deserialize(deserializer)? {
        SizeValue::Number(n) => Ok(n),
        SizeValue::String(s) => parse_size(&s).map_err(D::Error::custom),
    }
}
