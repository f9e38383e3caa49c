// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Implementation of the `validate` command.

use vigil_config::VigilConfig;

use crate::cli::{Cli, OutputFormat, ValidateArgs};
use crate::error::{BinError, BinResult};

/// Executes the `validate` command to validate configuration.
pub fn validate(cli: &Cli, args: ValidateArgs) -> BinResult<()> {
    let config_path = &cli.config;

    if !config_path.exists() {
        return Err(BinError::config(format!(
            "Configuration file not found: {}",
            config_path.display()
        )));
    }

    let config = vigil_config::load_config(config_path).map_err(|e| {
        BinError::config(format!("Configuration validation failed: {}", e))
    })?;

    let warnings = collect_warnings(&config);
    let historized: usize = config
        .servers
        .iter()
        .map(|s| s.historized_tags().count())
        .sum();
    let tags: usize = config.servers.iter().map(|s| s.tags.len()).sum();

    match args.format {
        OutputFormat::Text => {
            println!("✓ Configuration is valid: {}", config_path.display());
            println!();
            println!("Summary:");
            println!("  Instance ID: {}", config.runtime.instance_id);
            println!(
                "  Servers: {} ({} enabled)",
                config.servers.len(),
                config.enabled_servers().count()
            );
            println!("  Tags: {} ({} historized)", tags, historized);
            println!(
                "  Historian: {}",
                if config.historian.enabled {
                    format!("enabled ({})", config.historian.data_dir.display())
                } else {
                    "disabled".to_string()
                }
            );
            println!(
                "  Logging: {} / {}",
                config.logging.level.as_str(),
                config.logging.format.as_str()
            );

            if !warnings.is_empty() {
                println!();
                println!("Warnings:");
                for warning in &warnings {
                    println!("  ⚠ {}", warning);
                }
            }

            if args.show_config {
                println!();
                println!("Parsed configuration:");
                println!(
                    "{}",
                    serde_json::to_string_pretty(&config)
                        .unwrap_or_else(|_| "(serialization error)".to_string())
                );
            }
        }
        OutputFormat::Json => {
            let output = serde_json::json!({
                "valid": true,
                "config_path": config_path.display().to_string(),
                "summary": {
                    "instance_id": config.runtime.instance_id,
                    "server_count": config.servers.len(),
                    "enabled_server_count": config.enabled_servers().count(),
                    "tag_count": tags,
                    "historized_tag_count": historized,
                    "historian_enabled": config.historian.enabled,
                    "historian_data_dir": config.historian.data_dir.display().to_string(),
                },
                "warnings": warnings,
                "config": if args.show_config { Some(&config) } else { None },
            });
            let rendered = serde_json::to_string_pretty(&output)
                .map_err(|e| BinError::report(e.to_string()))?;
            println!("{}", rendered);
        }
    }

    if args.strict && !warnings.is_empty() {
        return Err(BinError::config(format!(
            "Strict mode: {} warning(s) found",
            warnings.len()
        )));
    }

    Ok(())
}

/// Returns non-fatal issues of a valid configuration.
pub fn collect_warnings(config: &VigilConfig) -> Vec<String> {
    let mut warnings = Vec::new();

    if config.servers.is_empty() {
        warnings.push("No servers configured".to_string());
    } else if config.enabled_servers().next().is_none() {
        warnings.push("All servers are disabled".to_string());
    }

    let mut historized = 0;
    for server in &config.servers {
        if server.tags.is_empty() {
            warnings.push(format!("Server '{}' has no tags", server.id));
        }
        if server.security.policy.is_deprecated() {
            warnings.push(format!(
                "Server '{}' uses deprecated security policy {}",
                server.id, server.security.policy
            ));
        }
        historized += server.historized_tags().count();
    }

    if historized > 0 && !config.historian.enabled {
        warnings.push(format!(
            "{} tag(s) are marked historize but the historian is disabled",
            historized
        ));
    }
    if historized == 0 && config.historian.enabled && !config.servers.is_empty() {
        warnings.push("Historian is enabled but no tag is historized".to_string());
    }

    warnings
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_config::{ServerConfig, TagConfig};
    use vigil_opcua::SecurityPolicy;

    #[test]
    fn test_warnings_for_empty_config() {
        let warnings = collect_warnings(&VigilConfig::default());
        assert_eq!(warnings, vec!["No servers configured".to_string()]);
    }

    #[test]
    fn test_warnings_for_servers() {
        let mut config = VigilConfig::default();
        let mut legacy = ServerConfig::new("legacy", "opc.tcp://10.0.0.2:4840");
        legacy.security.policy = SecurityPolicy::Basic256;
        legacy.enabled = false;
        config.servers.push(legacy);

        let warnings = collect_warnings(&config);
        assert!(warnings.contains(&"All servers are disabled".to_string()));
        assert!(warnings.iter().any(|w| w.contains("no tags")));
        assert!(warnings.iter().any(|w| w.contains("deprecated")));
        assert!(warnings.iter().any(|w| w.contains("no tag is historized")));
    }

    #[test]
    fn test_historized_without_historian() {
        let mut config = VigilConfig::default();
        config.historian.enabled = false;
        config.servers.push(
            ServerConfig::new("plc", "opc.tcp://localhost:4840")
                .with_tag(TagConfig::new("ns=2;s=Speed").historized()),
        );

        let warnings = collect_warnings(&config);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("historian is disabled"));
    }

    #[test]
    fn test_clean_config_has_no_warnings() {
        let mut config = VigilConfig::default();
        config.servers.push(
            ServerConfig::new("plc", "opc.tcp://localhost:4840")
                .with_tag(TagConfig::new("ns=2;s=Speed").historized()),
        );
        assert!(collect_warnings(&config).is_empty());
    }
}
