//! Testbed descriptor construction.
//!
//! A testbed is the YAML document the downstream pyATS-style worker reads to
//! learn how to connect to devices. Grounded in
//! `original_source/nac_test/pyats_core/testbed/testbed_builder.py` for the
//! exact per-device entry shape (`alias`, `type`, `credentials`,
//! `connections.cli`, the `settings.POST_DISCONNECT_WAIT_SEC` knob) and in
//! the teacher's `serde_yaml`-backed config loading (`config::schema`) for
//! how this crate represents YAML documents as typed values.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;

use crate::device::DeviceRecord;

/// Top-level testbed document: `{ testbed: {...}, devices: {...} }`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Testbed {
    #[serde(default)]
    pub testbed: TestbedMeta,
    #[serde(default)]
    pub devices: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TestbedMeta {
    #[serde(default = "default_testbed_name")]
    pub name: String,
    #[serde(default)]
    pub credentials: BTreeMap<String, Value>,
}

fn default_testbed_name() -> String {
    "nac_test".to_string()
}

impl Testbed {
    fn minimal_skeleton() -> Self {
        Testbed {
            testbed: TestbedMeta {
                name: default_testbed_name(),
                credentials: BTreeMap::new(),
            },
            devices: BTreeMap::new(),
        }
    }

    /// Loads a user-supplied base testbed file. A missing path is not an
    /// error -- callers should treat `None` and "file does not exist" the
    /// same way (fall back to the skeleton).
    pub fn load_user_base(path: Option<&Path>) -> Result<Option<Testbed>> {
        let Some(path) = path else { return Ok(None) };
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read user testbed: {}", path.display()))?;
        let testbed: Testbed = serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse user testbed: {}", path.display()))?;
        Ok(Some(testbed))
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_yaml::to_string(self).context("failed to serialize testbed")?;
        std::fs::write(path, content)
            .with_context(|| format!("failed to write testbed: {}", path.display()))
    }
}

/// Builds single-device and consolidated testbeds from resolved devices,
/// honoring a user-supplied base testbed when present.
#[derive(Debug, Default)]
pub struct TestbedBuilder;

impl TestbedBuilder {
    pub fn new() -> Self {
        Self
    }

    /// Single-device testbed for a per-device D2D worker.
    ///
    /// If the user base already has an entry for this hostname, the base is
    /// returned untouched (user wins, bit-identical per the spec's
    /// invariant). Otherwise an auto-generated entry is inserted into the
    /// base (or a minimal skeleton).
    pub fn build_single(&self, device: &DeviceRecord, user_base: Option<&Testbed>) -> Testbed {
        if let Some(base) = user_base {
            if base.devices.contains_key(&device.hostname) {
                return base.clone();
            }
        }
        let mut testbed = user_base.cloned().unwrap_or_else(Testbed::minimal_skeleton);
        testbed
            .devices
            .insert(device.hostname.clone(), auto_entry(device));
        testbed
    }

    /// Consolidated testbed for the connection broker: every resolved
    /// device, with the user base's entries preserved verbatim for any
    /// hostname it already names.
    pub fn build_consolidated(
        &self,
        devices: &[DeviceRecord],
        user_base: Option<&Testbed>,
    ) -> Testbed {
        let mut testbed = user_base.cloned().unwrap_or_else(Testbed::minimal_skeleton);
        for device in devices {
            if testbed.devices.contains_key(&device.hostname) {
                continue;
            }
            testbed
                .devices
                .insert(device.hostname.clone(), auto_entry(device));
        }
        testbed
    }
}

fn auto_entry(device: &DeviceRecord) -> Value {
    let mut map = serde_yaml::Mapping::new();
    map.insert("alias".into(), device.hostname.clone().into());
    map.insert("os".into(), device.os.clone().into());
    map.insert(
        "type".into(),
        device.device_type.clone().unwrap_or_else(|| "router".to_string()).into(),
    );

    let mut credentials = serde_yaml::Mapping::new();
    let mut default_cred = serde_yaml::Mapping::new();
    default_cred.insert("username".into(), device.username.clone().into());
    default_cred.insert("password".into(), device.password.clone().into());
    credentials.insert("default".into(), default_cred.into());
    map.insert("credentials".into(), credentials.into());

    let mut cli = serde_yaml::Mapping::new();
    if let Some(command) = &device.command {
        cli.insert("command".into(), command.clone().into());
        let mut arguments = serde_yaml::Mapping::new();
        arguments.insert(
            "init_config_commands".into(),
            Value::Sequence(Vec::new()),
        );
        arguments.insert("operating_mode".into(), true.into());
        cli.insert("arguments".into(), arguments.into());
    } else {
        let (protocol, port) = device
            .connection_options
            .as_ref()
            .map(|o| (o.protocol.clone(), o.port))
            .unwrap_or(("ssh".to_string(), None));
        cli.insert("protocol".into(), protocol.into());
        cli.insert("ip".into(), device.host.clone().into());
        cli.insert("port".into(), (port.or(device.port).unwrap_or(22) as i64).into());
        let mut arguments = serde_yaml::Mapping::new();
        if let Some(ssh_options) = &device.ssh_options {
            for (k, v) in ssh_options {
                arguments.insert(k.clone().into(), v.clone());
            }
        }
        cli.insert("arguments".into(), arguments.into());
    }

    let mut connections = serde_yaml::Mapping::new();
    connections.insert("cli".into(), cli.into());
    map.insert("connections".into(), connections.into());

    if let Some(platform) = &device.platform {
        map.insert("platform".into(), platform.clone().into());
    }
    if let Some(model) = &device.model {
        map.insert("model".into(), model.clone().into());
    }
    if let Some(series) = &device.series {
        map.insert("series".into(), series.clone().into());
    }

    let mut settings = serde_yaml::Mapping::new();
    settings.insert("POST_DISCONNECT_WAIT_SEC".into(), 0.into());
    map.insert("settings".into(), settings.into());

    Value::Mapping(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::ConnectionOptions;

    fn device(hostname: &str, command: Option<&str>) -> DeviceRecord {
        DeviceRecord {
            device_id: hostname.to_string(),
            hostname: hostname.to_string(),
            host: "10.1.1.1".to_string(),
            os: "iosxe".to_string(),
            platform: None,
            model: None,
            series: None,
            username: "admin".to_string(),
            password: "secret".to_string(),
            port: None,
            connection_options: None,
            ssh_options: None,
            command: command.map(|s| s.to_string()),
            device_type: None,
        }
    }

    #[test]
    fn auto_entry_uses_ssh_when_no_command() {
        let d = device("router1", None);
        let entry = auto_entry(&d);
        let cli = entry.get("connections").unwrap().get("cli").unwrap();
        assert_eq!(cli.get("protocol").unwrap().as_str(), Some("ssh"));
        assert_eq!(cli.get("ip").unwrap().as_str(), Some("10.1.1.1"));
        assert!(cli.get("command").is_none());
    }

    #[test]
    fn auto_entry_uses_command_when_present() {
        let d = device("router1", Some("/mock/a.sh"));
        let entry = auto_entry(&d);
        let cli = entry.get("connections").unwrap().get("cli").unwrap();
        assert_eq!(cli.get("command").unwrap().as_str(), Some("/mock/a.sh"));
        assert!(cli.get("ip").is_none());
    }

    #[test]
    fn user_base_entry_is_preserved_bit_identical() {
        let mut base = Testbed::default();
        let mut user_entry = serde_yaml::Mapping::new();
        user_entry.insert(
            "connections".into(),
            {
                let mut conns = serde_yaml::Mapping::new();
                let mut cli = serde_yaml::Mapping::new();
                cli.insert("command".into(), "/mock/a.sh".into());
                conns.insert("cli".into(), cli.into());
                conns.into()
            },
        );
        base.devices
            .insert("router1".to_string(), user_entry.clone().into());

        let builder = TestbedBuilder::new();
        let d = device("router1", None);
        let single = builder.build_single(&d, Some(&base));
        assert_eq!(
            single.devices.get("router1"),
            Some(&Value::Mapping(user_entry))
        );
    }

    #[test]
    fn consolidated_inserts_auto_devices_and_skips_user_hostnames() {
        let mut base = Testbed::default();
        base.devices
            .insert("router1".to_string(), Value::Mapping(Default::default()));

        let builder = TestbedBuilder::new();
        let devices = vec![device("router1", None), device("router2", None)];
        let consolidated = builder.build_consolidated(&devices, Some(&base));

        assert_eq!(consolidated.devices.len(), 2);
        assert_eq!(
            consolidated.devices.get("router1"),
            Some(&Value::Mapping(Default::default()))
        );
        assert!(consolidated.devices.get("router2").unwrap().get("os").is_some());
    }
}
