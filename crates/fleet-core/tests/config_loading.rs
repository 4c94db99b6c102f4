//! Loading node configuration from TOML files.

use std::io::Write;

use fleet_core::{AgentId, ConfigError, NodeConfig, ServiceRole};
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[test]
fn full_config_round_trips_from_disk() {
    let file = write_config(
        r#"
[node]
name = "node-7"
container_prefix = "n7"
stop_agents_on_shutdown = true

[networks]
public = "n7-pub"
internal = "n7-int"

[dispatch]
timeout_ms = 1500

[retry]
max_attempts = 5
base_delay_ms = 100

[docker]
stop_grace_secs = 3

[[services]]
role = "proxy"
image = "fleet/proxy:2"

[[agents]]
id = "0xabc"
image = "agents/abc:1"
chain_id = 1
public = true

[[agents]]
id = "0xdef"
image = "agents/def:1"
env = { LOG = "debug" }
"#,
    );

    let config = NodeConfig::load(file.path()).unwrap();
    assert_eq!(config.node.container_prefix, "n7");
    assert!(config.node.stop_agents_on_shutdown);
    assert_eq!(config.networks.public, "n7-pub");
    assert_eq!(config.dispatch.timeout_ms, 1500);
    assert_eq!(config.retry.max_attempts, 5);
    assert_eq!(config.retry.base_delay_ms, 100);
    // Unset fields keep their defaults.
    assert_eq!(config.retry.max_delay_ms, 4_000);
    assert_eq!(config.docker.stop_grace_secs, 3);

    assert_eq!(config.services.len(), 1);
    assert_eq!(config.services[0].role, ServiceRole::Proxy);
    assert!(config.services[0].is_public());
    assert_eq!(config.services[0].container_name("n7"), "n7-proxy");

    assert_eq!(config.agents.len(), 2);
    assert_eq!(config.agents[0].id, AgentId::from("0xabc"));
    assert_eq!(config.agents[0].chain_id, Some(1));
    assert!(config.agents[0].public);
    assert_eq!(config.agents[1].env.get("LOG").map(String::as_str), Some("debug"));
    assert_eq!(config.agents[1].rpc_port, fleet_core::domain::DEFAULT_AGENT_RPC_PORT);
}

#[test]
fn missing_file_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = NodeConfig::load(dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, ConfigError::Io { .. }));
}

#[test]
fn malformed_toml_is_parse_error() {
    let file = write_config("[node\nname = ");
    let err = NodeConfig::load(file.path()).unwrap_err();
    assert!(matches!(err, ConfigError::Parse(_)));
}

#[test]
fn duplicate_agent_ids_are_rejected() {
    let err = NodeConfig::from_toml_str(
        r#"
[[agents]]
id = "a"
image = "x"

[[agents]]
id = "a"
image = "y"
"#,
    )
    .unwrap_err();
    assert!(matches!(err, ConfigError::Invalid(ref msg) if msg.contains("duplicate")));
}

#[test]
fn empty_agent_image_is_rejected() {
    let err = NodeConfig::from_toml_str(
        r#"
[[agents]]
id = "a"
image = " "
"#,
    )
    .unwrap_err();
    assert!(matches!(err, ConfigError::Invalid(_)));
}

#[test]
fn zero_dispatch_timeout_is_rejected() {
    let err = NodeConfig::from_toml_str("[dispatch]\ntimeout_ms = 0\n").unwrap_err();
    assert!(matches!(err, ConfigError::Invalid(_)));
}
