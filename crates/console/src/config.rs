//! Console configuration management

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

/// Baud rate used when nothing is configured
pub const DEFAULT_BAUD_RATE: u32 = 9600;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleConfig {
    #[serde(default)]
    pub console: ConsoleSettings,
    #[serde(default)]
    pub output: OutputSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleSettings {
    /// Whether the USBasp console is active at all
    #[serde(default)]
    pub enabled: bool,
    /// UART baud rate programmed into the device on every session open
    #[serde(default = "ConsoleSettings::default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "ConsoleSettings::default_log_level")]
    pub log_level: String,
}

impl Default for ConsoleSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            baud_rate: Self::default_baud_rate(),
            log_level: Self::default_log_level(),
        }
    }
}

impl ConsoleSettings {
    fn default_baud_rate() -> u32 {
        DEFAULT_BAUD_RATE
    }

    fn default_log_level() -> String {
        "info".to_string()
    }
}

/// Where device output goes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSettings {
    /// Output file; stdout when absent. `~` is expanded.
    #[serde(default)]
    pub path: Option<String>,
    /// Append to an existing file instead of truncating it
    #[serde(default = "OutputSettings::default_append")]
    pub append: bool,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            path: None,
            append: Self::default_append(),
        }
    }
}

impl OutputSettings {
    fn default_append() -> bool {
        true
    }

    /// Output file with `~` expanded
    pub fn resolved_path(&self) -> Option<PathBuf> {
        self.path
            .as_deref()
            .map(|p| PathBuf::from(shellexpand::tilde(p).as_ref()))
    }
}

impl ConsoleConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            PathBuf::from(shellexpand::tilde(&p.to_string_lossy()).as_ref())
        } else {
            // Try standard locations in order
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/usbasp-console/console.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config = Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Parse and validate TOML content
    pub fn parse(content: &str) -> Result<Self> {
        let config: ConsoleConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        // Create parent directories if they don't exist
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usbasp-console").join("console.toml")
        } else {
            PathBuf::from(".config/usbasp-console/console.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.console.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.console.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.console.baud_rate == 0 {
            return Err(anyhow!("Invalid baud rate 0, must be greater than 0"));
        }

        if let Some(path) = &self.output.path
            && path.trim().is_empty()
        {
            return Err(anyhow!("Empty output path, omit it to write to stdout"));
        }

        Ok(())
    }
}

/// Settings the session manager reads at session-open time and on a
/// settings-changed notification
pub trait ConfigProvider: Send + Sync {
    /// Always greater than zero
    fn baud_rate(&self) -> u32;

    fn is_feature_enabled(&self) -> bool;
}

/// Configuration shared between the host and the session manager
///
/// The host swaps in a reloaded file with [`replace`](Self::replace) and then
/// notifies the console that settings changed.
#[derive(Debug)]
pub struct SharedConfig {
    inner: RwLock<ConsoleConfig>,
}

impl SharedConfig {
    pub fn new(config: ConsoleConfig) -> Self {
        Self {
            inner: RwLock::new(config),
        }
    }

    /// Current configuration snapshot
    pub fn get(&self) -> ConsoleConfig {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Install a new configuration, rejecting invalid values
    pub fn replace(&self, config: ConsoleConfig) -> Result<()> {
        config.validate()?;
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = config;
        Ok(())
    }

    /// Force the feature on or off without touching the rest
    pub fn set_enabled(&self, enabled: bool) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .console
            .enabled = enabled;
    }
}

impl ConfigProvider for SharedConfig {
    fn baud_rate(&self) -> u32 {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .console
            .baud_rate
    }

    fn is_feature_enabled(&self) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .console
            .enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ConsoleConfig::default();
        assert!(!config.console.enabled);
        assert_eq!(config.console.baud_rate, 9600);
        assert_eq!(config.console.log_level, "info");
        assert!(config.output.path.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = ConsoleConfig::parse("").unwrap();
        assert_eq!(config, ConsoleConfig::default());
    }

    #[test]
    fn test_zero_baud_rate_rejected() {
        let err = ConsoleConfig::parse("[console]\nbaud_rate = 0\n").unwrap_err();
        assert!(err.to_string().contains("baud rate"));
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = ConsoleConfig::default();
        config.console.log_level = "invalid".to_string();
        assert!(config.validate().is_err());

        config.console.log_level = "debug".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let mut config = ConsoleConfig::default();
        config.console.enabled = true;
        config.output.path = Some("/tmp/usbasp.log".to_string());

        let toml_str = toml::to_string(&config).unwrap();
        let parsed: ConsoleConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(config, parsed);
    }

    #[test]
    fn test_shared_config_provider() {
        let shared = SharedConfig::new(ConsoleConfig::default());
        assert!(!shared.is_feature_enabled());
        assert_eq!(shared.baud_rate(), 9600);

        shared.set_enabled(true);
        assert!(shared.is_feature_enabled());

        let mut next = shared.get();
        next.console.baud_rate = 57600;
        shared.replace(next).unwrap();
        assert_eq!(shared.baud_rate(), 57600);
        assert!(shared.is_feature_enabled());
    }

    #[test]
    fn test_shared_config_rejects_invalid_replacement() {
        let shared = SharedConfig::new(ConsoleConfig::default());
        let mut bad = shared.get();
        bad.console.baud_rate = 0;
        assert!(shared.replace(bad).is_err());
        assert_eq!(shared.baud_rate(), 9600);
    }
}
