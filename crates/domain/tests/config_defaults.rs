use tg_domain::config::{Config, ConfigSeverity, NoRolePolicy};

#[test]
fn default_host_is_localhost() {
    let config = Config::default();
    assert_eq!(config.server.host, "127.0.0.1");
    assert_eq!(config.server.port, 8021);
}

#[test]
fn explicit_zero_host_parses() {
    let toml_str = r#"
[server]
host = "0.0.0.0"
port = 9090
"#;
    let config: Config = toml::from_str(toml_str).unwrap();
    assert_eq!(config.server.host, "0.0.0.0");
    assert_eq!(config.server.port, 9090);
}

#[test]
fn default_no_role_policy_deletes() {
    let config = Config::default();
    assert_eq!(config.auth.no_role_policy, NoRolePolicy::Delete);
}

#[test]
fn no_role_policy_parses_from_toml() {
    let toml_str = r#"
[auth]
no_role_policy = "disable"
"#;
    let config: Config = toml::from_str(toml_str).unwrap();
    assert_eq!(config.auth.no_role_policy, NoRolePolicy::Disable);
}

#[test]
fn default_cache_matches_documented_limits() {
    let config = Config::default();
    assert_eq!(config.permission_cache.ttl_secs, 300);
    assert_eq!(config.permission_cache.max_entries, 50_000);
}

#[test]
fn zero_port_is_a_validation_error() {
    let toml_str = r#"
[server]
port = 0
"#;
    let config: Config = toml::from_str(toml_str).unwrap();
    let issues = config.validate();
    assert!(issues
        .iter()
        .any(|i| i.severity == ConfigSeverity::Error && i.field == "server.port"));
}

#[test]
fn defaults_validate_cleanly() {
    let issues = Config::default().validate();
    assert!(!issues.iter().any(|i| i.severity == ConfigSeverity::Error));
}
