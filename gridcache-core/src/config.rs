//! Configuration types

use crate::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// ORM property keys understood by [`GridCacheConfig::from_properties`].
pub mod keys {
    pub const LOCK_TIMEOUT_MS: &str = "gridcache.lock_timeout_ms";
    pub const OPERATION_TIMEOUT_MS: &str = "gridcache.operation_timeout_ms";
    pub const CLEANUP_INTERVAL_MS: &str = "gridcache.cleanup_interval_ms";
    pub const REGION_PREFIX: &str = "gridcache.region_prefix";
    pub const STATUS_NAME: &str = "gridcache.status.name";
    pub const STATUS_REFRESH_MS: &str = "gridcache.status.refresh_ms";
    pub const TOPIC_CAPACITY: &str = "gridcache.topic_capacity";
    pub const NEAR_CACHE_MAX_SIZE: &str = "gridcache.near_cache.max_size";
    pub const NEAR_CACHE_TTL_MS: &str = "gridcache.near_cache.ttl_ms";
    /// Per-region overrides: `gridcache.region.<name>.max_size` / `.ttl_ms`.
    pub const REGION_OVERRIDE_PREFIX: &str = "gridcache.region.";
}

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_STATUS_REFRESH: Duration = Duration::from_secs(30);
pub const DEFAULT_TOPIC_CAPACITY: usize = 1024;
pub const DEFAULT_NEAR_CACHE_MAX_SIZE: usize = 100_000;
pub const DEFAULT_NEAR_CACHE_TTL: Duration = Duration::from_secs(3600);

/// Near-cache limits for one region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegionConfig {
    /// Entries kept locally before cleanup trims the oldest.
    pub near_cache_max_size: usize,
    /// Age after which a local entry is dropped and re-read from the grid.
    #[serde(with = "duration_ms")]
    pub near_cache_ttl: Duration,
}

impl Default for RegionConfig {
    fn default() -> Self {
        Self {
            near_cache_max_size: DEFAULT_NEAR_CACHE_MAX_SIZE,
            near_cache_ttl: DEFAULT_NEAR_CACHE_TTL,
        }
    }
}

impl RegionConfig {
    pub fn with_max_size(mut self, max: usize) -> Self {
        self.near_cache_max_size = max;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.near_cache_ttl = ttl;
        self
    }
}

/// Factory-wide configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridCacheConfig {
    /// How long a soft lock protects a key before another session may take it over.
    #[serde(with = "duration_ms")]
    pub lock_timeout: Duration,
    /// Upper bound for a single grid round trip.
    #[serde(with = "duration_ms")]
    pub operation_timeout: Duration,
    /// Period of the near-cache cleanup task.
    #[serde(with = "duration_ms")]
    pub cleanup_interval: Duration,
    /// Prefix prepended to every region name (`<prefix>.<region>`).
    pub region_prefix: Option<String>,
    /// Name of the region status exporter; none disables it.
    pub status_name: Option<String>,
    /// Refresh bound of the status exporter's computed counters.
    #[serde(with = "duration_ms")]
    pub status_refresh: Duration,
    /// Buffered invalidation events per topic subscriber.
    pub topic_capacity: usize,
    /// Limits for regions without an explicit override.
    pub default_region: RegionConfig,
    /// Overrides keyed by unqualified region name.
    pub regions: HashMap<String, RegionConfig>,
}

impl Default for GridCacheConfig {
    fn default() -> Self {
        Self {
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            region_prefix: None,
            status_name: None,
            status_refresh: DEFAULT_STATUS_REFRESH,
            topic_capacity: DEFAULT_TOPIC_CAPACITY,
            default_region: RegionConfig::default(),
            regions: HashMap::new(),
        }
    }
}

impl GridCacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    pub fn with_region_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.region_prefix = Some(prefix.into());
        self
    }

    pub fn with_status_name(mut self, name: impl Into<String>) -> Self {
        self.status_name = Some(name.into());
        self
    }

    pub fn with_topic_capacity(mut self, capacity: usize) -> Self {
        self.topic_capacity = capacity;
        self
    }

    pub fn with_default_region(mut self, region: RegionConfig) -> Self {
        self.default_region = region;
        self
    }

    pub fn with_region(mut self, name: impl Into<String>, region: RegionConfig) -> Self {
        self.regions.insert(name.into(), region);
        self
    }

    /// Effective near-cache limits for a region, named with or without the
    /// configured prefix. Overrides are keyed by the unqualified name.
    pub fn region_config(&self, name: &str) -> RegionConfig {
        self.regions
            .get(self.unqualify(name))
            .or_else(|| self.regions.get(name))
            .cloned()
            .unwrap_or_else(|| self.default_region.clone())
    }

    /// Strip the configured prefix, if `name` carries it.
    pub fn unqualify<'a>(&self, name: &'a str) -> &'a str {
        match &self.region_prefix {
            Some(prefix) if !prefix.is_empty() => name
                .strip_prefix(prefix.as_str())
                .and_then(|rest| rest.strip_prefix('.'))
                .unwrap_or(name),
            _ => name,
        }
    }

    /// Qualify a region name with the configured prefix.
    pub fn qualify(&self, name: &str) -> String {
        match &self.region_prefix {
            Some(prefix) if !prefix.is_empty() => format!("{}.{}", prefix, name),
            _ => name.to_string(),
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lock_timeout.is_zero() {
            return Err(invalid("lock_timeout", "0", "must be greater than zero"));
        }
        if self.operation_timeout.is_zero() {
            return Err(invalid("operation_timeout", "0", "must be greater than zero"));
        }
        if self.cleanup_interval.is_zero() {
            return Err(invalid("cleanup_interval", "0", "must be greater than zero"));
        }
        if self.topic_capacity == 0 {
            return Err(invalid("topic_capacity", "0", "must be greater than zero"));
        }
        let overrides = self.regions.iter().map(|(n, r)| (n.as_str(), r));
        for (name, region) in std::iter::once(("default", &self.default_region)).chain(overrides) {
            if region.near_cache_max_size == 0 {
                return Err(invalid(
                    &format!("region.{}.max_size", name),
                    "0",
                    "must be greater than zero",
                ));
            }
        }
        Ok(())
    }

    /// Build from the string properties the ORM passes at start-up.
    ///
    /// Unknown keys are ignored; malformed values fail.
    pub fn from_properties(props: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(v) = props.get(keys::LOCK_TIMEOUT_MS) {
            config.lock_timeout = parse_millis(keys::LOCK_TIMEOUT_MS, v)?;
        }
        if let Some(v) = props.get(keys::OPERATION_TIMEOUT_MS) {
            config.operation_timeout = parse_millis(keys::OPERATION_TIMEOUT_MS, v)?;
        }
        if let Some(v) = props.get(keys::CLEANUP_INTERVAL_MS) {
            config.cleanup_interval = parse_millis(keys::CLEANUP_INTERVAL_MS, v)?;
        }
        if let Some(v) = props.get(keys::STATUS_REFRESH_MS) {
            config.status_refresh = parse_millis(keys::STATUS_REFRESH_MS, v)?;
        }
        if let Some(v) = props.get(keys::TOPIC_CAPACITY) {
            config.topic_capacity = parse_number(keys::TOPIC_CAPACITY, v)?;
        }
        if let Some(v) = props.get(keys::REGION_PREFIX) {
            config.region_prefix = non_empty(v);
        }
        if let Some(v) = props.get(keys::STATUS_NAME) {
            config.status_name = non_empty(v);
        }
        if let Some(v) = props.get(keys::NEAR_CACHE_MAX_SIZE) {
            config.default_region.near_cache_max_size =
                parse_number(keys::NEAR_CACHE_MAX_SIZE, v)?;
        }
        if let Some(v) = props.get(keys::NEAR_CACHE_TTL_MS) {
            config.default_region.near_cache_ttl = parse_millis(keys::NEAR_CACHE_TTL_MS, v)?;
        }

        for (key, value) in props {
            let Some(rest) = key.strip_prefix(keys::REGION_OVERRIDE_PREFIX) else {
                continue;
            };
            let Some((region, setting)) = rest.rsplit_once('.') else {
                continue;
            };
            let entry = config
                .regions
                .entry(region.to_string())
                .or_insert_with(|| config.default_region.clone());
            match setting {
                "max_size" => entry.near_cache_max_size = parse_number(key, value)?,
                "ttl_ms" => entry.near_cache_ttl = parse_millis(key, value)?,
                _ => {}
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Build from a TOML document using the serde field names.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source).map_err(|e| ConfigError::InvalidValue {
            field: "toml".to_string(),
            value: String::new(),
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }
}

fn invalid(field: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_number(field: &str, value: &str) -> Result<usize, ConfigError> {
    value
        .trim()
        .parse::<usize>()
        .map_err(|e| invalid(field, value, &e.to_string()))
}

fn parse_millis(field: &str, value: &str) -> Result<Duration, ConfigError> {
    value
        .trim()
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|e| invalid(field, value, &e.to_string()))
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Serde adapter storing `Duration` as integer milliseconds.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = GridCacheConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.status_refresh, Duration::from_secs(30));
        assert_eq!(config.qualify("Country"), "Country");
    }

    #[test]
    fn test_from_properties() {
        let config = GridCacheConfig::from_properties(&props(&[
            (keys::LOCK_TIMEOUT_MS, "1500"),
            (keys::REGION_PREFIX, "app"),
            (keys::STATUS_NAME, "local"),
            (keys::NEAR_CACHE_MAX_SIZE, "50"),
            ("gridcache.region.Country.ttl_ms", "2000"),
            ("hibernate.show_sql", "true"),
        ]))
        .unwrap();

        assert_eq!(config.lock_timeout, Duration::from_millis(1500));
        assert_eq!(config.qualify("Country"), "app.Country");
        assert_eq!(config.status_name.as_deref(), Some("local"));

        let country = config.region_config("Country");
        assert_eq!(country.near_cache_max_size, 50);
        assert_eq!(country.near_cache_ttl, Duration::from_millis(2000));
        assert_eq!(config.region_config("City").near_cache_max_size, 50);
    }

    #[test]
    fn test_region_config_resolves_qualified_name() {
        let config = GridCacheConfig::from_properties(&props(&[
            (keys::REGION_PREFIX, "app"),
            ("gridcache.region.Person.max_size", "7"),
        ]))
        .unwrap();

        assert_eq!(config.unqualify("app.Person"), "Person");
        assert_eq!(config.unqualify("application.Person"), "application.Person");
        assert_eq!(config.region_config("app.Person").near_cache_max_size, 7);
        assert_eq!(config.region_config("Person").near_cache_max_size, 7);
        assert_eq!(
            config.region_config("app.Order").near_cache_max_size,
            DEFAULT_NEAR_CACHE_MAX_SIZE
        );
    }

    #[test]
    fn test_from_properties_rejects_malformed() {
        let result = GridCacheConfig::from_properties(&props(&[(keys::LOCK_TIMEOUT_MS, "soon")]));
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));

        let result = GridCacheConfig::from_properties(&props(&[(keys::LOCK_TIMEOUT_MS, "0")]));
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_from_toml() {
        let config = GridCacheConfig::from_toml_str(
            r#"
            lock_timeout = 2000
            region_prefix = "orders"

            [default_region]
            near_cache_max_size = 10

            [regions.Order]
            near_cache_ttl = 500
            "#,
        )
        .unwrap();

        assert_eq!(config.lock_timeout, Duration::from_secs(2));
        assert_eq!(config.default_region.near_cache_max_size, 10);
        assert_eq!(
            config.region_config("Order").near_cache_ttl,
            Duration::from_millis(500)
        );
        assert_eq!(config.operation_timeout, DEFAULT_OPERATION_TIMEOUT);
    }
}
