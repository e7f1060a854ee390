use oomwatch_config::{discover_config_path, reload, OomwatchConfig};
use tempfile::NamedTempFile;

#[test]
fn explicit_path_wins() {
    let file = NamedTempFile::new().unwrap();
    assert_eq!(
        discover_config_path(Some(file.path())).as_deref(),
        Some(file.path())
    );
}

#[test]
fn missing_file_reports_the_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.toml");

    let err = OomwatchConfig::load_from_path(&path).unwrap_err();
    assert!(err.to_string().contains("absent.toml"), "{err}");
}

#[test]
fn reload_detects_changes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("oomwatch.toml");
    std::fs::write(&path, "[watchdog]\ngracetime = 5\n").unwrap();
    let initial = OomwatchConfig::load_from_path(&path).unwrap();

    let (same, _diagnostics, changed) = reload(&path, &initial).unwrap();
    assert!(!changed);
    assert_eq!(same, initial);

    std::fs::write(&path, "[watchdog]\ngracetime = 15\n").unwrap();
    let (updated, diagnostics, changed) = reload(&path, &initial).unwrap();
    assert!(changed);
    assert!(diagnostics.is_ok());
    assert_eq!(updated.watchdog.grace_time_secs, 15);
}
