use super::settings::Settings;
use super::{PersistenceBackend, load_config};

use serial_test::serial;
use std::env;
use std::fs;
use tempfile::TempDir;

#[test]
fn test_default_settings() {
    let settings = Settings::default();
    assert_eq!(settings.broker.default_prefetch, 1000);
    assert_eq!(settings.broker.retroactive_backlog, 100);
    assert_eq!(settings.broker.dead_letter_queue, "DLQ");
    assert_eq!(settings.persistence.backend, PersistenceBackend::Memory);
    assert_eq!(settings.logging.level, "info");
    assert!(!settings.logging.targets);
    assert_eq!(settings.broker.subscriber_pending_limit, 10_000);
}

#[test]
#[serial]
fn load_config_from_file_overrides_defaults() {
    // load_config reads config/default.toml relative to the working directory
    let tmp = TempDir::new().expect("create tempdir");
    let orig = env::current_dir().expect("current_dir");
    env::set_current_dir(tmp.path()).expect("set current dir");

    fs::create_dir_all("config").expect("create config dir");
    let toml = r#"
        [broker]
        default_prefetch = 10
        dead_letter_queue = "DEAD.LETTERS"
        subscriber_pending_limit = 50

        [persistence]
        backend = "sled"
        path = "/tmp/relaymq-test"
    "#;
    fs::write("config/default.toml", toml).expect("write config file");

    let cfg = load_config();

    // restore cwd before asserting so a failure cannot leak the temp dir
    env::set_current_dir(orig).expect("restore cwd");

    let cfg = cfg.expect("load_config failed");
    assert_eq!(cfg.broker.default_prefetch, 10);
    assert_eq!(cfg.broker.dead_letter_queue, "DEAD.LETTERS");
    assert_eq!(cfg.broker.retroactive_backlog, 100);
    assert_eq!(cfg.broker.subscriber_pending_limit, 50);
    assert_eq!(cfg.persistence.backend, PersistenceBackend::Sled);
    assert_eq!(cfg.persistence.path, "/tmp/relaymq-test");
    assert_eq!(cfg.logging.level, "info");
}

#[test]
#[serial]
fn environment_overrides_defaults() {
    temp_env::with_vars(
        [
            ("RELAYMQ__BROKER__DEFAULT_PREFETCH", Some("5")),
            ("RELAYMQ__LOGGING__LEVEL", Some("debug")),
            ("RELAYMQ__LOGGING__TARGETS", Some("true")),
        ],
        || {
            let cfg = load_config().expect("load_config failed");
            assert_eq!(cfg.broker.default_prefetch, 5);
            assert_eq!(cfg.logging.level, "debug");
            assert!(cfg.logging.targets);
            assert_eq!(cfg.logging.max_level(), tracing::Level::DEBUG);
            assert_eq!(cfg.broker.durable_pending_limit, 10_000);
        },
    );
}
