//! Device resolution from the merged data model.
//!
//! Grounded in `original_source/nac_test/pyats_core/inventory/device_inventory.py`:
//! required-field validation, the skip-not-fail policy for malformed device
//! entries, and reading credentials only from the merged document (never
//! from the environment).

use serde::{Deserialize, Serialize};
use serde_yaml::Value;

use crate::config::MergedDataModel;

/// Connection-method override, replacing the default SSH protocol/port.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionOptions {
    pub protocol: String,
    pub port: Option<u16>,
}

/// One resolved device, ready to feed `TestbedBuilder`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceRecord {
    pub device_id: String,
    pub hostname: String,
    pub host: String,
    pub os: String,
    pub platform: Option<String>,
    pub model: Option<String>,
    pub series: Option<String>,
    pub username: String,
    pub password: String,
    pub port: Option<u16>,
    pub connection_options: Option<ConnectionOptions>,
    pub ssh_options: Option<Vec<(String, Value)>>,
    pub command: Option<String>,
    pub device_type: Option<String>,
}

/// Resolves device identifiers from the merged data model into connection
/// records, skipping (not failing) on missing required fields.
#[derive(Debug, Default)]
pub struct DeviceInventory;

impl DeviceInventory {
    pub fn new() -> Self {
        Self
    }

    /// Resolves every entry under `devices` in the merged data model.
    /// Returns resolved records plus `(device_id, reason)` for any entry
    /// missing a required field.
    pub fn resolve(
        &self,
        data: &MergedDataModel,
    ) -> (Vec<DeviceRecord>, Vec<(String, String)>) {
        let mut resolved = Vec::new();
        let mut skipped = Vec::new();

        let Some(devices) = data.get("devices").and_then(|v| v.as_mapping()) else {
            return (resolved, skipped);
        };

        for (key, value) in devices {
            let device_id = key.as_str().unwrap_or_default().to_string();
            match resolve_one(&device_id, value) {
                Ok(record) => resolved.push(record),
                Err(reason) => skipped.push((device_id, reason)),
            }
        }

        resolved.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        (resolved, skipped)
    }
}

fn resolve_one(device_id: &str, value: &Value) -> Result<DeviceRecord, String> {
    let map = value
        .as_mapping()
        .ok_or_else(|| "device entry is not a mapping".to_string())?;

    let get_str = |key: &str| -> Option<String> {
        map.get(key).and_then(|v| v.as_str()).map(|s| s.to_string())
    };

    let hostname = get_str("hostname").ok_or("missing required field: hostname")?;
    let host = get_str("host").ok_or("missing required field: host")?;
    let os = get_str("os").ok_or("missing required field: os")?;
    let username = get_str("username").ok_or("missing required field: username")?;
    let password = get_str("password").ok_or("missing required field: password")?;

    let port = map
        .get("port")
        .and_then(|v| v.as_u64())
        .map(|p| p as u16);

    let connection_options = map.get("connection_options").and_then(|v| {
        let m = v.as_mapping()?;
        let protocol = m.get("protocol")?.as_str()?.to_string();
        let port = m.get("port").and_then(|p| p.as_u64()).map(|p| p as u16);
        Some(ConnectionOptions { protocol, port })
    });

    let ssh_options = map.get("ssh_options").and_then(|v| v.as_mapping()).map(|m| {
        m.iter()
            .filter_map(|(k, v)| k.as_str().map(|k| (k.to_string(), v.clone())))
            .collect::<Vec<_>>()
    });

    let command = get_str("command");

    Ok(DeviceRecord {
        device_id: device_id.to_string(),
        hostname,
        host,
        os,
        platform: get_str("platform"),
        model: get_str("model"),
        series: get_str("series"),
        username,
        password,
        port,
        connection_options,
        ssh_options,
        command,
        device_type: get_str("type"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model_from_yaml(yaml: &str) -> MergedDataModel {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn resolves_complete_devices() {
        let data = model_from_yaml(
            r#"
devices:
  r1:
    hostname: router1
    host: 10.1.1.1
    os: iosxe
    username: admin
    password: secret
"#,
        );
        let (resolved, skipped) = DeviceInventory::new().resolve(&data);
        assert_eq!(resolved.len(), 1);
        assert!(skipped.is_empty());
        assert_eq!(resolved[0].hostname, "router1");
    }

    #[test]
    fn missing_required_field_skips_not_fails() {
        let data = model_from_yaml(
            r#"
devices:
  r1:
    hostname: router1
    host: 10.1.1.1
    os: iosxe
    username: admin
  r2:
    hostname: router2
    host: 10.1.1.2
    os: iosxe
    username: admin
    password: secret
"#,
        );
        let (resolved, skipped) = DeviceInventory::new().resolve(&data);
        assert_eq!(resolved.len(), 1);
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].0, "r1");
        assert!(skipped[0].1.contains("password"));
    }

    #[test]
    fn no_devices_key_returns_empty() {
        let data = model_from_yaml("other: value\n");
        let (resolved, skipped) = DeviceInventory::new().resolve(&data);
        assert!(resolved.is_empty());
        assert!(skipped.is_empty());
    }

    #[test]
    fn command_field_is_carried_through() {
        let data = model_from_yaml(
            r#"
devices:
  r1:
    hostname: router1
    host: 10.1.1.1
    os: iosxe
    username: admin
    password: secret
    command: /mock/a.sh
"#,
        );
        let (resolved, _) = DeviceInventory::new().resolve(&data);
        assert_eq!(resolved[0].command.as_deref(), Some("/mock/a.sh"));
    }
}
