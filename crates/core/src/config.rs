use serde::Deserialize;

/// Root application configuration. Loaded from environment variables
/// with the prefix `PAYWALL_DECIDER__` and an optional TOML config file.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub assignments: AssignmentConfig,
    #[serde(default)]
    pub debug: DebugConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    #[serde(default = "default_locale")]
    pub locale: String,
    #[serde(default)]
    pub app_version: Option<String>,
    #[serde(default = "default_platform")]
    pub platform: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// When false every request bypasses completed entries (in-flight coalescing still applies).
    #[serde(default = "default_cache_enabled")]
    pub enabled: bool,
    /// Warm the cache with active treatment paywalls after each config refresh.
    #[serde(default)]
    pub preload: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssignmentConfig {
    #[serde(default = "default_assignments_path")]
    pub store_path: String,
    /// Fixed RNG seed for reproducible draws. Unset means OS entropy.
    #[serde(default)]
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct DebugConfig {
    /// Preview mode: bypasses the subscription gate and cached responses.
    #[serde(default)]
    pub preview: bool,
}

// Default functions
fn default_locale() -> String {
    "en_US".to_string()
}
fn default_platform() -> String {
    "ios".to_string()
}
fn default_cache_enabled() -> bool {
    true
}
fn default_assignments_path() -> String {
    "assignments.json".to_string()
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            locale: default_locale(),
            app_version: None,
            platform: default_platform(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_cache_enabled(),
            preload: false,
        }
    }
}

impl Default for AssignmentConfig {
    fn default() -> Self {
        Self {
            store_path: default_assignments_path(),
            seed: None,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            device: DeviceConfig::default(),
            cache: CacheConfig::default(),
            assignments: AssignmentConfig::default(),
            debug: DebugConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables only.
    pub fn load() -> Result<Self, config::ConfigError> {
        Self::load_from(None)
    }

    /// Load configuration from an optional TOML file, with environment variables taking precedence.
    pub fn load_from(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::with_name(path)
                    .format(config::FileFormat::Toml)
                    .required(false),
            );
        }
        let builder = builder.add_source(
            config::Environment::with_prefix("PAYWALL_DECIDER")
                .separator("__")
                .try_parsing(true)
                .list_separator(","),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.device.locale, "en_US");
        assert!(config.cache.enabled);
        assert!(!config.debug.preview);
        assert!(config.assignments.seed.is_none());
    }

    #[test]
    fn test_missing_file_is_not_an_error() {
        let config = AppConfig::load_from(Some("/nonexistent/paywall-decider")).unwrap();
        assert_eq!(config.device.platform, "ios");
    }
}
