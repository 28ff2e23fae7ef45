use std::{env, fs};

use tiercache::config::loader::{load_config, load_config_with_default_path};

#[test]
fn config_parsing_and_env_overrides_and_validation() {
    let dir = tempfile::tempdir().expect("tmp dir");
    let path = dir.path().join("tiercache.toml");

    let toml_content = r#"
[local]
max_entries = 500
default_ttl_ms = 60000

[local.ttl_overrides_ms]
draft = 300000

[redis]
enabled = true
url = "redis://127.0.0.1:6379"
key_prefix = "resume-app:"
lazy_connect = true
reconnect_interval_ms = 250

[policy]
compression_threshold_bytes = 4096
single_flight = false
"#;
    fs::write(&path, toml_content).expect("write toml");

    // 1) Valid config parses, unspecified fields keep their defaults
    let cfg = load_config(path.to_str()).expect("should parse config");
    assert_eq!(cfg.local.max_entries, 500);
    assert_eq!(cfg.local.ttl_for("draft").as_millis(), 300_000);
    assert_eq!(cfg.local.ttl_for("other").as_millis(), 60_000);
    assert!(cfg.redis.enabled);
    assert!(cfg.redis.lazy_connect);
    assert_eq!(cfg.redis.key_prefix, "resume-app:");
    assert_eq!(cfg.redis.reconnect_interval_ms, 250);
    assert_eq!(cfg.redis.max_reconnect_attempts, 10);
    assert_eq!(cfg.policy.compression_threshold_bytes, 4096);
    assert!(!cfg.policy.single_flight);
    assert!((cfg.policy.stale_ratio - 0.8).abs() < f64::EPSILON);

    // 2) Env override should win over file
    unsafe {
        env::set_var("TIERCACHE__LOCAL__MAX_ENTRIES", "42");
    }
    let cfg_env = load_config(path.to_str()).expect("should parse config with env overrides");
    assert_eq!(cfg_env.local.max_entries, 42);
    unsafe {
        env::remove_var("TIERCACHE__LOCAL__MAX_ENTRIES");
    }

    // 3) Invalid config should error
    let invalid_path = dir.path().join("invalid.toml");
    let invalid_toml = r#"
[local]
max_entries = 0
"#;
    fs::write(&invalid_path, invalid_toml).expect("write invalid toml");
    let err = load_config_with_default_path(Some(&invalid_path)).expect_err("must be invalid");
    assert!(err.contains("max_entries"), "unexpected error: {err}");

    // 4) Enabled redis without URL should error
    let no_url_path = dir.path().join("no_url.toml");
    fs::write(&no_url_path, "[redis]\nenabled = true\nurl = \"\"\n").expect("write toml");
    assert!(load_config(no_url_path.to_str()).is_err());
}
