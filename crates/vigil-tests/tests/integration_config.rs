// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! # Config Integration Tests
//!
//! - `test_config_*`: parsing files in every format and validation
//! - `test_registry_*`: the saved-server document across instances

use std::time::Duration;

use vigil_config::{
    ConfigError, ConfigFormat, ConfigLoader, LogFormat, LogLevel, ServerRegistry,
};
use vigil_opcua::{SecurityMode, SecurityPolicy};

use vigil_tests::common::{fixtures::ConfigFixtures, init_test_logging, temp_test_dir};

fn loader() -> ConfigLoader {
    ConfigLoader::new().with_env_prefix("VIGIL_ITEST_CONFIG")
}

// =============================================================================
// Configuration Files
// =============================================================================

#[test]
fn test_config_yaml_file() {
    init_test_logging();
    let dir = temp_test_dir("vigil-config");
    let path = dir.path().join("vigil.yaml");
    std::fs::write(&path, ConfigFixtures::yaml()).unwrap();

    let config = loader().load(&path).unwrap();

    assert_eq!(config.runtime.instance_id, "line-1");
    assert_eq!(config.runtime.status_interval, Duration::from_secs(5));
    assert_eq!(config.servers.len(), 2);
    assert_eq!(config.enabled_servers().count(), 1);

    let plc = config.get_server("plc-01").unwrap();
    assert_eq!(plc.display_name(), "Press line");
    assert_eq!(plc.historized_tags().count(), 2);
    assert_eq!(plc.tags[2].interval(), Duration::from_millis(250));
    assert_eq!(plc.security.policy, SecurityPolicy::Basic256Sha256);
    assert_eq!(plc.security.mode, SecurityMode::SignAndEncrypt);
    assert_eq!(
        plc.security.certificate_path.as_deref(),
        Some(dir.path().join("pki/client.der").as_path())
    );
    assert!(plc.endpoint().validate().is_ok());

    assert_eq!(config.historian.data_dir, dir.path().join("history"));
    assert_eq!(config.historian.max_batch_events, 200);
    assert_eq!(config.historian.max_batch_latency, Duration::from_millis(500));
    assert_eq!(config.fanout.subscription_config().consumer_capacity, 64);
    assert_eq!(config.logging.level, LogLevel::Debug);
    assert_eq!(config.logging.format, LogFormat::Json);
}

#[test]
fn test_config_toml_string() {
    let config = loader()
        .load_from_str(ConfigFixtures::toml(), ConfigFormat::Toml)
        .unwrap();

    assert_eq!(config.servers.len(), 1);
    assert!(config.servers[0].tags[0].historize);
    assert_eq!(config.historian.max_batch_events, 50);
    assert!(config.historian.enabled);
}

#[test]
fn test_config_rejects_duplicate_servers() {
    let error = loader()
        .load_from_str(ConfigFixtures::json_duplicate_servers(), ConfigFormat::Json)
        .unwrap_err();
    assert!(matches!(error, ConfigError::DuplicateServerId { ref server_id } if server_id == "plc"));
}

#[test]
fn test_config_rejects_bad_endpoint() {
    let yaml = r#"
servers:
  - id: plc
    endpoint_url: "http://10.0.0.10"
"#;
    let error = loader().load_from_str(yaml, ConfigFormat::Yaml).unwrap_err();
    assert!(matches!(error, ConfigError::Validation { .. }));
}

// =============================================================================
// Saved-Server Registry
// =============================================================================

#[test]
fn test_registry_persists_across_instances() {
    let dir = temp_test_dir("vigil-registry");
    let path = dir.path().join("state").join("state.json");

    {
        let registry = ServerRegistry::open(&path).unwrap();
        registry
            .upsert_server("opc.tcp://10.0.0.10:4840", Some("Press line"))
            .unwrap();
        registry
            .add_tag("opc.tcp://10.0.0.10:4840", "ns=2;s=Speed", "Line1/Speed")
            .unwrap();
        registry
            .add_tag("opc.tcp://10.0.0.10:4840", "ns=2;s=Temp", "Line1/Temp")
            .unwrap();
    }

    let registry = ServerRegistry::open(&path).unwrap();
    let servers = registry.list_servers().unwrap();
    assert_eq!(servers.len(), 1);
    assert_eq!(servers[0].name, "Press line");

    // Upserting without a name keeps the tags and the name.
    let again = registry.upsert_server("opc.tcp://10.0.0.10:4840", None).unwrap();
    assert_eq!(again.name, "Press line");
    assert_eq!(again.tags.len(), 2);

    assert!(registry
        .remove_tag("opc.tcp://10.0.0.10:4840", "ns=2;s=Temp")
        .unwrap());
    let tags = registry.list_tags("opc.tcp://10.0.0.10:4840").unwrap();
    assert_eq!(tags.len(), 1);
    assert_eq!(tags[0].path, "Line1/Speed");

    assert!(registry.delete_server("opc.tcp://10.0.0.10:4840").unwrap());
    assert!(registry.list_servers().unwrap().is_empty());
}

#[test]
fn test_registry_rejects_tag_for_unknown_server() {
    let dir = temp_test_dir("vigil-registry");
    let registry = ServerRegistry::open(dir.path().join("state.json")).unwrap();

    let error = registry
        .add_tag("opc.tcp://nowhere:4840", "ns=2;s=X", "X")
        .unwrap_err();
    assert!(matches!(error, ConfigError::UnknownServer { .. }));
}
