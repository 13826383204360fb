//! Integration tests for configuration loading
//!
//! Covers:
//! - Full and minimal console config files
//! - Save/load round trip through the filesystem
//! - Rejection of invalid values
//! - Hot reload through `SharedConfig`

use console::config::{ConfigProvider, ConsoleConfig, SharedConfig};
use std::fs;
use tempfile::tempdir;

const FULL_CONFIG: &str = r#"
[console]
enabled = true
baud_rate = 115200
log_level = "debug"

[output]
path = "/var/log/usbasp.log"
append = false
"#;

#[test]
fn test_full_config() {
    let config = ConsoleConfig::parse(FULL_CONFIG).unwrap();
    assert!(config.console.enabled);
    assert_eq!(config.console.baud_rate, 115_200);
    assert_eq!(config.console.log_level, "debug");
    assert_eq!(config.output.path.as_deref(), Some("/var/log/usbasp.log"));
    assert!(!config.output.append);
}

#[test]
fn test_partial_config_fills_defaults() {
    let config = ConsoleConfig::parse("[console]\nenabled = true\n").unwrap();
    assert!(config.console.enabled);
    assert_eq!(config.console.baud_rate, 9600);
    assert_eq!(config.console.log_level, "info");
    assert!(config.output.path.is_none());
    assert!(config.output.append);
}

#[test]
fn test_invalid_values_rejected() {
    assert!(ConsoleConfig::parse("[console]\nbaud_rate = 0\n").is_err());
    assert!(ConsoleConfig::parse("[console]\nlog_level = \"loud\"\n").is_err());
    assert!(ConsoleConfig::parse("[output]\npath = \"  \"\n").is_err());
    assert!(ConsoleConfig::parse("[console]\nbaud_rate = \"fast\"\n").is_err());
}

#[test]
fn test_save_and_load_roundtrip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("nested").join("console.toml");

    let mut config = ConsoleConfig::default();
    config.console.enabled = true;
    config.console.baud_rate = 38_400;
    config.output.path = Some("~/usbasp.log".to_string());
    config.save(&path).unwrap();
    assert!(path.exists());

    let loaded = ConsoleConfig::load(Some(path)).unwrap();
    assert_eq!(loaded, config);
}

#[test]
fn test_load_missing_explicit_path_fails() {
    let dir = tempdir().unwrap();
    let err = ConsoleConfig::load(Some(dir.path().join("absent.toml"))).unwrap_err();
    assert!(format!("{:#}", err).contains("Failed to read config file"));
}

#[test]
fn test_load_invalid_file_fails() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("console.toml");
    fs::write(&path, "[console]\nbaud_rate = 0\n").unwrap();

    let err = ConsoleConfig::load(Some(path)).unwrap_err();
    assert!(format!("{:#}", err).contains("Failed to parse config file"));
}

#[test]
fn test_output_path_tilde_expansion() {
    let mut config = ConsoleConfig::default();
    assert!(config.output.resolved_path().is_none());

    config.output.path = Some("~/usbasp.log".to_string());
    let resolved = config.output.resolved_path().unwrap();
    assert!(!resolved.to_string_lossy().starts_with('~'));
    assert!(resolved.ends_with("usbasp.log"));
}

#[test]
fn test_shared_config_reload() {
    let shared = SharedConfig::new(ConsoleConfig::default());
    assert!(!shared.is_feature_enabled());

    let reloaded = ConsoleConfig::parse(FULL_CONFIG).unwrap();
    shared.replace(reloaded).unwrap();
    assert!(shared.is_feature_enabled());
    assert_eq!(shared.baud_rate(), 115_200);
}
