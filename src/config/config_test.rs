use serial_test::serial;
use temp_env::with_vars;

use super::*;

fn cleanup_all_coord_env_vars() {
    for (key, _) in std::env::vars() {
        if key.starts_with("COORD__") || key == CONFIG_PATH_ENV {
            std::env::remove_var(&key);
        }
    }
}

#[test]
#[serial]
fn default_config_should_initialize_with_hardcoded_values() {
    let config = CoordinatorConfig::default();

    assert_eq!(config.connection.hosts, vec!["127.0.0.1:2181".to_string()]);
    assert_eq!(config.connection.session_timeout_ms, 10_000);
    assert!(config.connection.randomize_hosts);
    assert!(config.connection.chroot.is_none());
    assert_eq!(config.retry.max_attempts, 3);
    assert_eq!(config.codec, PayloadFormat::Bincode);
    assert!(config.validate().is_ok());
}

#[test]
#[serial]
fn new_should_merge_environment_overrides() {
    cleanup_all_coord_env_vars();
    with_vars(
        vec![
            ("COORD__CONNECTION__CHROOT", Some("/services/billing")),
            ("COORD__RETRY__MAX_ATTEMPTS", Some("0")),
            ("COORD__CONNECTION__HOSTS", Some("zk1:2181,zk2:2182")),
        ],
        || {
            let config = CoordinatorConfig::new().unwrap().validate().unwrap();

            assert_eq!(config.connection.chroot.as_deref(), Some("/services/billing"));
            assert!(config.retry.is_unbounded());
            assert_eq!(config.connection.hosts, vec!["zk1:2181", "zk2:2182"]);
        },
    );
}

#[test]
#[serial]
fn with_override_config_should_merge_file_settings() {
    cleanup_all_coord_env_vars();
    let temp_dir = tempfile::tempdir().unwrap();
    let config_path = temp_dir.path().join("coord.toml");

    std::fs::write(
        &config_path,
        r#"
        codec = "json"

        [connection]
        hosts = ["10.0.0.1:2181", "10.0.0.2:2181"]
        randomize_hosts = false

        [retry]
        max_attempts = 5
        timeout_ms = 250
        "#,
    )
    .unwrap();

    let empty_vars: Vec<(&str, Option<&str>)> = vec![];
    with_vars(empty_vars, || {
        let base_config = CoordinatorConfig::new().expect("success");
        let config = base_config
            .with_override_config(config_path.to_str().unwrap())
            .unwrap()
            .validate()
            .unwrap();

        assert_eq!(config.codec, PayloadFormat::Json);
        assert_eq!(config.connection.hosts.len(), 2);
        assert!(!config.connection.randomize_hosts);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.timeout_ms, 250);
        // untouched values keep their defaults
        assert_eq!(config.connection.session_timeout_ms, 10_000);
    });
}

#[test]
#[serial]
fn config_path_env_should_be_required_when_set() {
    cleanup_all_coord_env_vars();
    with_vars(vec![(CONFIG_PATH_ENV, Some("/nonexistent/coord.toml"))], || {
        assert!(CoordinatorConfig::new().is_err());
    });
}

#[test]
fn validation_should_reject_malformed_hosts() {
    for bad in ["", "zk1", "zk1:", ":2181", "zk1:http", "zk1:70000", "zk 1:2181"] {
        let mut config = CoordinatorConfig::default();
        config.connection.hosts = vec![bad.to_string()];
        assert!(
            matches!(config.validate(), Err(crate::Error::Config(_))),
            "host {bad:?} should be rejected"
        );
    }
}

#[test]
fn validation_should_accept_well_formed_hosts() {
    for good in ["zk1:2181", "127.0.0.1:2181", "zk-1.internal:65535"] {
        assert!(validate_host_port(good).is_ok(), "host {good:?} should be accepted");
    }
}

#[test]
fn validation_should_reject_empty_host_list() {
    let mut config = CoordinatorConfig::default();
    config.connection.hosts.clear();
    assert!(config.validate().is_err());
}

#[test]
fn validation_should_reject_relative_or_trailing_chroot() {
    for bad in ["services", "/services/", "/", "/a//b"] {
        let mut config = CoordinatorConfig::default();
        config.connection.chroot = Some(bad.to_string());
        assert!(config.validate().is_err(), "chroot {bad:?} should be rejected");
    }
}

#[test]
fn retry_policy_should_double_delay_up_to_cap() {
    let policy = ConnectRetryPolicy {
        max_attempts: 10,
        timeout_ms: 100,
        base_delay_ms: 50,
        max_delay_ms: 300,
    };
    assert_eq!(policy.delay_after(1).as_millis(), 50);
    assert_eq!(policy.delay_after(2).as_millis(), 100);
    assert_eq!(policy.delay_after(3).as_millis(), 200);
    assert_eq!(policy.delay_after(4).as_millis(), 300);
    assert_eq!(policy.delay_after(40).as_millis(), 300);
}

#[test]
fn retry_policy_validation() {
    let mut policy = ConnectRetryPolicy::default();
    assert!(policy.validate().is_ok());
    policy.timeout_ms = 0;
    assert!(policy.validate().is_err());

    let policy = ConnectRetryPolicy {
        base_delay_ms: 500,
        max_delay_ms: 100,
        ..ConnectRetryPolicy::default()
    };
    assert!(policy.validate().is_err());
}
