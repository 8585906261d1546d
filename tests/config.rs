//! Configuration loading tests.

mod common;

use corral::core::config::{Config, ConfigOverrides};

const FULL: &str = r#"
[server]
id = "lab-a"
bind = "0.0.0.0:7420"

[allocation]
max_priority = 10
default_priority = 5

[federation]
cache_ttl_seconds = 5

[[federation.remotes]]
id = "lab-b"
address = "10.0.0.2:7420"

[auth]
admins = ["root"]

[[targets]]
name = "nuc-01"
type = "nuc"
ip = "10.1.0.21"
mac = "aa:bb:cc:dd:ee:ff"
components = ["psu", "main"]
"#;

#[test]
fn loads_from_file() {
    let file = common::config_file(FULL);
    let config = Config::from_file(file.path()).unwrap();
    assert_eq!(config.server.id, "lab-a");
    assert_eq!(config.allocation.default_priority, 5);
    assert_eq!(config.federation.remotes[0].id, "lab-b");
    assert_eq!(config.targets[0].kind, "nuc");
    assert_eq!(config.targets[0].components, vec!["psu", "main"]);
    assert_eq!(config.auth.admins, vec!["root"]);
}

#[test]
fn missing_file_is_reported() {
    let err = Config::from_file(std::path::Path::new("/nonexistent/corral.toml")).unwrap_err();
    assert!(err.to_string().contains("failed to read config file"));
}

#[test]
fn shipped_sample_config_is_valid() {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("config/corral.toml");
    let config = Config::from_file(&path).unwrap();
    assert_eq!(config.targets.len(), 3);
}

#[test]
fn rejects_remote_shadowing_local_id() {
    let file = common::config_file(
        r#"
[server]
id = "lab-a"

[[federation.remotes]]
id = "lab-a"
address = "10.0.0.2:7420"
"#,
    );
    let err = Config::from_file(file.path()).unwrap_err();
    assert!(format!("{:#}", err).contains("not unique"));
}

#[test]
fn rejects_duplicate_targets_and_components() {
    let err = Config::from_toml(
        r#"
[server]
id = "lab-a"

[[targets]]
name = "qemu-01"

[[targets]]
name = "qemu-01"
"#,
    )
    .unwrap_err();
    assert!(err.to_string().contains("duplicate target"));

    let err = Config::from_toml(
        r#"
[server]
id = "lab-a"

[[targets]]
name = "nuc-01"
components = ["main", "main"]
"#,
    )
    .unwrap_err();
    assert!(err.to_string().contains("duplicate component"));
}

#[test]
fn rejects_bad_bind_and_log_level() {
    let err = Config::from_toml("[server]\nid = \"a\"\nbind = \"nowhere\"\n").unwrap_err();
    assert!(err.to_string().contains("server.bind"));

    let err = Config::from_toml("[server]\nid = \"a\"\n[telemetry]\nlog_level = \"loud\"\n")
        .unwrap_err();
    assert!(err.to_string().contains("log_level"));
}

#[test]
fn bind_override_is_validated() {
    let mut config = Config::from_toml(FULL).unwrap();
    config.apply_overrides(&ConfigOverrides {
        log_level: None,
        bind: Some("not-an-addr".into()),
    });
    assert!(config.validate().is_err());
}
