//! Production logging setup. A single test: the subscriber is process-wide.

use leosac::logging::{self, LOG_FILE_PREFIX};

#[test]
fn production_logging_writes_rotated_files_once() {
    let root = tempfile::tempdir().expect("tempdir");
    let logs = root.path().join("var").join("log").join("leosac");

    let guard = logging::init_production(&logs, "info").expect("first init");
    assert!(logs.is_dir());
    tracing::info!(unit = "test", "hello from the logging test");

    assert!(logging::init_production(&logs, "info").is_err());
    logging::init_cli("debug");
    drop(guard);

    let names: Vec<String> = std::fs::read_dir(&logs)
        .expect("read logs dir")
        .filter_map(Result::ok)
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    assert!(
        names.iter().any(|name| name.starts_with(LOG_FILE_PREFIX)),
        "no log file in {names:?}"
    );
}
