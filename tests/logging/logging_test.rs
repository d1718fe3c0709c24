//! Tests for `src/logging.rs`.

use courier::logging::{LoggingGuard, LOG_FILE_PREFIX};

#[test]
fn logging_guard_is_send() {
    fn assert_send<T: Send>() {}
    assert_send::<LoggingGuard>();
}

#[test]
fn production_logging_installs_once() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let logs_dir = tmp.path().join("logs");
    assert!(!logs_dir.exists());

    let guard = courier::logging::init_production(&logs_dir).expect("first init succeeds");
    assert!(logs_dir.exists(), "logs directory should be created");

    tracing::info!(account_id = "1", "logging smoke test");
    drop(guard);

    let written = std::fs::read_dir(&logs_dir)
        .expect("read logs dir")
        .filter_map(Result::ok)
        .any(|entry| entry.file_name().to_string_lossy().starts_with(LOG_FILE_PREFIX));
    assert!(written, "a rotated log file should exist");

    // A second global subscriber is refused; the CLI variant tolerates it.
    assert!(courier::logging::init_production(&logs_dir).is_err());
    courier::logging::init_cli();
}
