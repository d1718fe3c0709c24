//! Tests for `src/config.rs`: file loading, env overrides, validation.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use courier::config::{Config, CONFIG_PATH_VAR};

const FULL_TOML: &str = r#"
[backend]
base_url = "https://app.example.com"
api_key = "key-from-file"
ingest_path = "/hooks/ingest"

[admin]
bind = "127.0.0.1:9000"
secret = "file-secret"

[queue]
max_concurrent = 5
max_queue_size = 200

[retry]
max_retries = 2
base_delay_ms = 250
multiplier = 3.0

[supervisor]
probe_interval_secs = 15

[photos]
enabled = false

[accounts]
bot_tokens = ["111:aaa", "not-a-token", "222:bbb"]

[logging]
dir = "/var/log/courier"
"#;

fn resolver(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = vars
        .iter()
        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
        .collect();
    move |key| map.get(key).cloned()
}

fn write_config(contents: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let path = dir.path().join("courier.toml");
    std::fs::write(&path, contents).expect("should write config");
    (dir, path)
}

#[test]
fn file_values_are_loaded_and_converted() {
    let (_dir, path) = write_config(FULL_TOML);
    let path = path.to_string_lossy().into_owned();

    let config = Config::load_with(resolver(&[(CONFIG_PATH_VAR, path.as_str())])).expect("valid config");

    assert_eq!(config.backend.base_url, "https://app.example.com");
    assert_eq!(config.backend.ingest_path, "/hooks/ingest");
    assert_eq!(config.backend.roster_path, "/api/telegram/accounts");
    assert!(!config.photos.enabled);
    assert!(config.media.enabled);

    let queue = config.queue_config();
    assert_eq!(queue.max_concurrent, 5);
    assert_eq!(queue.max_queue_size, 200);
    assert_eq!(queue.dispatch_delay, Duration::from_millis(100));

    let retry = config.retry_policy();
    assert_eq!(retry.max_retries, 2);
    assert_eq!(retry.base_delay, Duration::from_millis(250));
    assert!((retry.multiplier - 3.0).abs() < f64::EPSILON);
    assert_eq!(retry.max_delay, Duration::from_secs(30));

    assert_eq!(config.admin_addr().expect("addr").port(), 9000);
    assert_eq!(config.logging.dir, PathBuf::from("/var/log/courier"));

    let accounts = config.env_accounts();
    let ids: Vec<&str> = accounts.iter().map(|c| c.account_id.as_str()).collect();
    assert_eq!(ids, vec!["111", "222"]);
}

#[test]
fn environment_overrides_file() {
    let (_dir, path) = write_config(FULL_TOML);
    let path = path.to_string_lossy().into_owned();

    let config = Config::load_with(resolver(&[
        (CONFIG_PATH_VAR, path.as_str()),
        ("COURIER_BACKEND_URL", "http://backend.internal:3000"),
        ("COURIER_ADMIN_SECRET", "env-secret"),
        ("COURIER_MAX_CONCURRENT", "8"),
        ("COURIER_RETRY_MULTIPLIER", "1.5"),
        ("COURIER_BOT_TOKENS", " 333:ccc , ,444:ddd"),
    ]))
    .expect("valid config");

    assert_eq!(config.backend.base_url, "http://backend.internal:3000");
    assert_eq!(config.admin.secret, "env-secret");
    assert_eq!(config.queue.max_concurrent, 8);
    assert!((config.retry.multiplier - 1.5).abs() < f64::EPSILON);
    assert_eq!(config.accounts.bot_tokens, vec!["333:ccc", "444:ddd"]);
}

#[test]
fn missing_file_uses_defaults_plus_environment() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let path = dir.path().join("absent.toml");
    let path = path.to_string_lossy().into_owned();

    let config = Config::load_with(resolver(&[
        (CONFIG_PATH_VAR, path.as_str()),
        ("COURIER_BACKEND_URL", "https://app.example.com"),
        ("COURIER_ADMIN_SECRET", "s"),
    ]))
    .expect("valid config");

    assert_eq!(config.queue.max_concurrent, 3);
    assert_eq!(config.queue.max_queue_size, 1000);
    assert_eq!(config.retry.max_retries, 5);
    assert_eq!(config.supervisor.probe_interval_secs, 30);
    assert_eq!(config.photos.ttl_secs, 3600);
    assert!(config.backend.api_key.is_none());
}

#[test]
fn backend_url_is_required() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let path = dir.path().join("absent.toml");
    let path = path.to_string_lossy().into_owned();

    let err = Config::load_with(resolver(&[
        (CONFIG_PATH_VAR, path.as_str()),
        ("COURIER_ADMIN_SECRET", "s"),
    ]))
    .expect_err("should fail");
    assert!(err.to_string().contains("backend base URL"));
}

#[test]
fn admin_secret_is_required() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let path = dir.path().join("absent.toml");
    let path = path.to_string_lossy().into_owned();

    let err = Config::load_with(resolver(&[
        (CONFIG_PATH_VAR, path.as_str()),
        ("COURIER_BACKEND_URL", "https://app.example.com"),
    ]))
    .expect_err("should fail");
    assert!(err.to_string().contains("admin secret"));
}

#[test]
fn invalid_tunables_are_rejected() {
    let base = r#"
[backend]
base_url = "https://app.example.com"
[admin]
secret = "s"
"#;
    let cases = [
        ("[queue]\nmax_concurrent = 0\n", "max_concurrent"),
        ("[queue]\nmax_queue_size = 0\n", "max_queue_size"),
        ("[retry]\nmultiplier = 0.5\n", "multiplier"),
        ("[supervisor]\nprobe_interval_secs = 0\n", "probe_interval_secs"),
    ];

    for (extra, needle) in cases {
        let mut config = Config::from_toml(&format!("{base}{extra}")).expect("parse");
        config.apply_overrides(|_| None);
        let err = config.validate().expect_err(needle);
        assert!(err.to_string().contains(needle), "{needle}: {err}");
    }
}

#[test]
fn non_http_backend_is_rejected() {
    let mut config = Config::from_toml(
        r#"
[backend]
base_url = "ftp://files.example.com"
[admin]
secret = "s"
"#,
    )
    .expect("parse");
    config.apply_overrides(|_| None);
    assert!(config.validate().is_err());
}

#[test]
fn malformed_toml_is_an_error() {
    assert!(Config::from_toml("[backend\nbase_url = ").is_err());
}

#[test]
fn debug_output_redacts_secrets() {
    let config = Config::from_toml(FULL_TOML).expect("parse");
    let rendered = format!("{config:?}");
    assert!(!rendered.contains("key-from-file"));
    assert!(!rendered.contains("file-secret"));
    assert!(!rendered.contains("222:bbb"));
}
