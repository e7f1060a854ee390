use std::path::PathBuf;
use std::time::Duration;

use oomwatch_config::OomwatchConfig;

#[test]
fn kernel_sysctl_names_are_accepted() {
    let text = r#"
[watchdog]
gracetime = 10
resettime = 600
bufsize = 64
crashflag = false
crashflag_name = "/var/lib/oomflag"
"#;

    let (config, diagnostics) =
        OomwatchConfig::load_from_str_with_diagnostics(text).expect("config should parse");

    assert!(diagnostics.unknown_keys.is_empty(), "{diagnostics:?}");
    let settings = config.watchdog_settings();
    assert_eq!(settings.grace_time, Duration::from_secs(10));
    assert_eq!(settings.reset_time, Duration::from_secs(600));
    assert_eq!(settings.reserve_size_mb, 64);
    assert!(!settings.crash_flag);
    assert_eq!(settings.marker_path, PathBuf::from("/var/lib/oomflag"));
}

#[test]
fn descriptive_names_map_to_the_same_settings() {
    let text = r#"
[watchdog]
grace_time_secs = 10
reset_time_secs = 600
reserve_size_mb = 64
crash_flag = false
marker_path = "/var/lib/oomflag"
tick_interval_ms = 500
lock_reserve = true
"#;

    let (config, diagnostics) =
        OomwatchConfig::load_from_str_with_diagnostics(text).expect("config should parse");

    assert!(diagnostics.is_ok(), "{diagnostics:?}");
    let settings = config.watchdog_settings();
    assert_eq!(settings.grace_time, Duration::from_secs(10));
    assert_eq!(settings.reserve_size_mb, 64);
    assert!(settings.lock_reserve);
    assert_eq!(config.tick_interval(), Duration::from_millis(500));
}
