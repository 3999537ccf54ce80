use shelf_config::{CodecKind, ConfigError, ShelfConfig};
use std::path::PathBuf;
use tempfile::TempDir;

#[test]
fn loads_config_file_from_disk() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("shelf.toml");
    std::fs::write(
        &path,
        r#"
[cache]
dir = "/srv/cache"
key_prefix = "v2_"
codec = "json"

[cache.lock]
retry_interval_ms = 20
"#,
    )
    .unwrap();

    let config = ShelfConfig::load_from_path(&path).unwrap();
    if std::env::var_os(shelf_config::CACHE_DIR_ENV).is_none() {
        assert_eq!(config.cache.dir, Some(PathBuf::from("/srv/cache")));
    }
    assert_eq!(config.cache.key_prefix, "v2_");
    assert_eq!(config.cache.codec, CodecKind::Json);
    assert_eq!(config.cache.lock.retry_interval_ms, 20);
    assert_eq!(config.cache.lock.timeout_ms, 1_000);
}

#[test]
fn missing_file_reports_the_path() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("absent.toml");

    let err = ShelfConfig::load_from_path(&path).unwrap_err();
    assert!(matches!(err, ConfigError::Io { .. }));
    assert!(err.to_string().contains("absent.toml"));
}

#[test]
fn parse_errors_do_not_echo_the_source_text() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("shelf.toml");
    std::fs::write(&path, "[cache]\nenabled = \"sometimes-secret\"\n").unwrap();

    let err = ShelfConfig::load_from_path(&path).unwrap_err();
    assert!(matches!(err, ConfigError::Toml(_)));
    assert!(!err.to_string().contains("enabled = "));
}
