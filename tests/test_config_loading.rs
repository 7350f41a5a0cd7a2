//! Configuration loading and validation tests
//!
//! Tests focus on observable outcomes of loading: defaults applied, secrets
//! resolved from the environment, and invalid files rejected.

use iotlink::config::{AuthMode, ConfigError, SessionConfig};
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(temp_file, "{content}").unwrap();
    temp_file
}

#[test]
fn test_config_loads_successfully_from_valid_toml() {
    let file = write_config(
        r#"
[broker]
host = "6784dcf26c8dc8689881e67d.cn-shanghai.iot.volces.com"
tls = true

[device]
product_key = "6788bd810f9bad3f8ef674fa"
device_name = "P1-9"
device_secret = "98cb52e94e437ee407dbed37"

[session]
keep_alive_secs = 120
ack_timeout_secs = 5
"#,
    );

    let config = SessionConfig::load_from_file(file.path()).unwrap();

    assert_eq!(config.port(), 8883);
    assert_eq!(config.device.auth_mode, AuthMode::DeviceSecret);
    assert_eq!(config.keep_alive(), Duration::from_secs(120));
    assert_eq!(config.ping_interval(), Duration::from_secs(120));
    assert_eq!(config.ack_timeout(), Duration::from_secs(5));
    assert_eq!(config.reconnect.backoff_ms, vec![1000, 2000, 4000, 8000, 16000]);

    let endpoint = config.endpoint();
    assert!(endpoint.tls);
    assert!(endpoint.verify_ssl);
    assert_eq!(endpoint.address(), format!("{}:8883", config.broker.host));
}

#[test]
fn test_config_secret_from_environment() {
    std::env::set_var("IOTLINK_TEST_DEVICE_SECRET", "98cb52e94e437ee407dbed37");
    let file = write_config(
        r#"
[broker]
host = "localhost"

[device]
product_key = "pk"
device_name = "dn"
device_secret = "env:IOTLINK_TEST_DEVICE_SECRET"
"#,
    );

    let config = SessionConfig::load_from_file(file.path()).unwrap();
    assert_eq!(
        config.device.device_secret.as_deref(),
        Some("98cb52e94e437ee407dbed37")
    );
}

#[test]
fn test_config_missing_env_secret() {
    let file = write_config(
        r#"
[broker]
host = "localhost"

[device]
product_key = "pk"
device_name = "dn"
device_secret = "env:IOTLINK_TEST_UNSET_VARIABLE"
"#,
    );

    match SessionConfig::load_from_file(file.path()) {
        Err(ConfigError::EnvVarNotFound(name)) => {
            assert_eq!(name, "IOTLINK_TEST_UNSET_VARIABLE")
        }
        other => panic!("expected missing variable, got {other:?}"),
    }
}

#[test]
fn test_config_rejects_invalid_files() {
    let missing_section = write_config(
        r#"
[broker]
host = "localhost"
"#,
    );
    assert!(matches!(
        SessionConfig::load_from_file(missing_section.path()),
        Err(ConfigError::TomlParse(_))
    ));

    let bad_identifier = write_config(
        r#"
[broker]
host = "localhost"

[device]
product_key = "pk with spaces"
device_name = "dn"
device_secret = "s"
"#,
    );
    assert!(matches!(
        SessionConfig::load_from_file(bad_identifier.path()),
        Err(ConfigError::InvalidConfig(_))
    ));

    let ping_too_long = write_config(
        r#"
[broker]
host = "localhost"

[device]
product_key = "pk"
device_name = "dn"
device_secret = "s"

[session]
keep_alive_secs = 30
ping_interval_secs = 60
"#,
    );
    assert!(matches!(
        SessionConfig::load_from_file(ping_too_long.path()),
        Err(ConfigError::InvalidConfig(_))
    ));

    for session in [
        "ack_timeout_secs = 0",
        "ping_timeout_secs = 0",
        "connect_timeout_secs = 0",
        "ack_timeout_secs = 9223372036854775807",
    ] {
        let file = write_config(&format!(
            r#"
[broker]
host = "localhost"

[device]
product_key = "pk"
device_name = "dn"
device_secret = "s"

[session]
{session}
"#
        ));
        assert!(
            matches!(
                SessionConfig::load_from_file(file.path()),
                Err(ConfigError::InvalidConfig(_))
            ),
            "{session} should be rejected"
        );
    }
}

#[test]
fn test_config_file_not_found() {
    assert!(matches!(
        SessionConfig::load_from_file("/nonexistent/device.toml".as_ref()),
        Err(ConfigError::FileRead(_))
    ));
}

#[test]
fn test_redacted_config_round_trips_without_secrets() {
    let config = SessionConfig::new("localhost", "pk", "dn", "98cb52e94e437ee407dbed37");
    let rendered = toml::to_string_pretty(&config.redacted()).unwrap();

    assert!(!rendered.contains("98cb52e94e437ee407dbed37"));
    assert!(rendered.contains("***"));
}
