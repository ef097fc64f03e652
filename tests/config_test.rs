use std::collections::HashMap;
use std::time::Duration;

use outbox_rs::Error;
use outbox_rs::config::{Config, StoreBackend};

fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let vars: HashMap<String, String> = vars
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |name| vars.get(name).cloned()
}

#[test]
fn empty_environment_uses_defaults() {
    let config = Config::from_lookup(lookup(&[])).unwrap();
    assert_eq!(config, Config::default());

    let manager = config.manager_config();
    assert_eq!(manager.submission_interval, Duration::from_secs(10));
    assert_eq!(manager.max_concurrent, Some(10));
    assert_eq!(manager.request_time_limit, None);
    assert_eq!(manager.retry.max_attempts, None);
}

#[test]
fn environment_overrides_are_applied() {
    let config = Config::from_lookup(lookup(&[
        ("OUTBOX_STORE", "SQLite"),
        ("OUTBOX_STORE_PATH", "/var/lib/outbox/queue.db"),
        ("OUTBOX_MAX_CONCURRENT", "0"),
        ("OUTBOX_REQUEST_TIME_LIMIT_SECS", "300"),
        ("OUTBOX_MAX_ATTEMPTS", "5"),
        ("LOG_LEVEL", "debug"),
    ]))
    .unwrap();

    assert_eq!(config.store_backend, StoreBackend::Sqlite);
    assert_eq!(config.log_level, "debug");

    let manager = config.manager_config();
    assert_eq!(manager.max_concurrent, None);
    assert_eq!(manager.request_time_limit, Some(Duration::from_secs(300)));
    assert_eq!(manager.retry.max_attempts, Some(5));
}

#[test]
fn malformed_values_fail_fast() {
    for vars in [
        [("OUTBOX_MAX_CONCURRENT", "many")],
        [("OUTBOX_STORE", "postgres")],
        [("OUTBOX_SUBMISSION_INTERVAL_SECS", "0")],
        [("OUTBOX_MAX_ATTEMPTS", "0")],
    ] {
        let result = Config::from_lookup(lookup(&vars));
        assert!(matches!(result, Err(Error::Config(_))), "{vars:?} should be rejected");
    }
}

#[test]
fn toml_config_parses_and_rejects_unknown_keys() {
    let config = Config::from_toml_str(
        r#"
        store_backend = "memory"
        submission_interval_secs = 2
        progress_interval_ms = 250
        max_attempts = 3
        "#,
    )
    .unwrap();
    assert_eq!(config.store_backend, StoreBackend::Memory);
    assert_eq!(config.resolved_store_path(), None);
    assert_eq!(
        config.manager_config().progress_interval,
        Duration::from_millis(250)
    );

    let bad = Config::from_toml_str("retries = 3");
    assert!(matches!(bad, Err(Error::Config(_))));
}

#[test]
fn load_reads_a_config_file() {
    let dir = std::env::temp_dir().join(format!("outbox-config-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("outbox.toml");
    std::fs::write(&path, "store_backend = \"json\"\nstore_path = \"q.json\"\n").unwrap();

    let config = Config::load(&path).unwrap();
    assert_eq!(config.resolved_store_path(), Some(std::path::PathBuf::from("q.json")));
    assert!(config.open_store().is_ok());

    assert!(Config::load(dir.join("missing.toml")).is_err());
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn telemetry_settings_describe_the_queue() {
    let config = Config::from_lookup(lookup(&[
        ("OUTBOX_STORE", "sqlite"),
        ("OUTBOX_MAX_CONCURRENT", "4"),
        ("LOG_LEVEL", "debug"),
    ]))
    .unwrap();

    let telemetry = config.telemetry_config("outbox");
    assert_eq!(telemetry.service_name, "outbox");
    assert_eq!(telemetry.log_level, "debug");
    assert_eq!(telemetry.endpoint, None);

    let attribute = |key: &str| {
        telemetry
            .resource_attributes
            .iter()
            .find(|kv| kv.key.as_str() == key)
            .map(|kv| kv.value.to_string())
    };
    assert_eq!(attribute("outbox.store.backend").as_deref(), Some("sqlite"));
    assert_eq!(attribute("outbox.max_concurrent").as_deref(), Some("4"));
    assert_eq!(
        attribute("outbox.store.path").as_deref(),
        Some("outbox-queue.db")
    );
}
