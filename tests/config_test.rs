//! Integration tests for configuration loading

use std::io::Write;
use std::time::Duration;

use highlight_store::config::{AppConfig, DatabaseConfig};
use highlight_store::StoreError;

fn config_file(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
fn test_default_database_config() {
    let config = DatabaseConfig::default();
    assert_eq!(config.name, "AppDB");
    assert_eq!(config.open_timeout(), Duration::from_secs(30));
    assert!(config.store_path().ends_with("AppDB"));
}

#[test]
fn test_load_from_file_overrides_defaults() {
    let file = config_file(
        r#"
[database]
path = "/tmp/highlights"
name = "TestDB"
open_timeout_secs = 5

[logging]
level = "debug"
format = "json"
"#,
    );

    let config = AppConfig::load_from(file.path()).unwrap();
    assert_eq!(config.database.name, "TestDB");
    assert_eq!(config.database.open_timeout_secs, 5);
    assert_eq!(config.database.store_path(), std::path::Path::new("/tmp/highlights/TestDB"));
    // Unset values keep their defaults
    assert_eq!(config.database.cache_capacity_bytes, 64 * 1024 * 1024);
    assert_eq!(config.logging.level, "debug");
    assert_eq!(config.logging.format, "json");
}

#[test]
fn test_invalid_log_level_rejected() {
    let file = config_file(
        r#"
[logging]
level = "verbose"
"#,
    );

    let err = AppConfig::load_from(file.path()).unwrap_err();
    assert!(matches!(err, StoreError::InvalidConfig(_)));
}

#[test]
fn test_temporary_store_needs_no_path() {
    let mut config = AppConfig::default();
    config.database = DatabaseConfig::temporary();
    config.database.path = String::new();
    assert!(config.validate().is_ok());

    config.database.temporary = false;
    assert!(config.validate().is_err());
}

#[test]
fn test_environment_uses_double_underscore_separator() {
    // Only this test touches flush_every_ms, so the variable cannot leak into the others
    std::env::set_var("HIGHLIGHT_STORE__DATABASE__FLUSH_EVERY_MS", "250");
    let loaded = AppConfig::load();
    std::env::remove_var("HIGHLIGHT_STORE__DATABASE__FLUSH_EVERY_MS");

    assert_eq!(loaded.unwrap().database.flush_every_ms, Some(250));
}
