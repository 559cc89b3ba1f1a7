use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::env;

use crate::consts::{
    CONF_DEVICE_ID, CONF_IS_GATEWAY, CONF_NAME, CONF_PARENT_GATEWAY, CONF_TYPE, DOMAIN,
};
use crate::entries::{ConfigEntries, ConfigEntry, config_entry_gateways};
use crate::error::ConfigError;
use crate::profile::DeviceProfile;
use crate::tuya::ConnectionSettings;

#[derive(Debug, Clone)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub tuya: TuyaConfig,
    pub entries: ConfigEntries,
    pub profiles: HashMap<String, DeviceProfile>,
}

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub topic_prefix: String,
    pub client_id: String,
    pub discovery_prefix: String,
}

#[derive(Debug, Clone)]
pub struct TuyaConfig {
    pub poll_interval_secs: u64,
}

/// An entry in the devices file, either wrapped with a title or bare data.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawEntry {
    Wrapped {
        #[serde(default)]
        title: Option<String>,
        data: Map<String, Value>,
    },
    Bare(Map<String, Value>),
}

fn env_required(key: &str) -> Result<String, ConfigError> {
    env::var(key).map_err(|_| ConfigError::MissingEnv(key.to_string()))
}

fn env_optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_or_default<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let devices_file = env_or_default("DEVICES_FILE", "devices.json".to_string());
        let profiles_file = env_or_default("PROFILES_FILE", "profiles.json".to_string());

        let config = Self {
            mqtt: MqttConfig {
                broker_host: env_required("MQTT_BROKER_HOST")?,
                broker_port: env_or_default("MQTT_BROKER_PORT", 1883),
                username: env_optional("MQTT_USERNAME"),
                password: env_optional("MQTT_PASSWORD"),
                topic_prefix: env_or_default("MQTT_TOPIC_PREFIX", DOMAIN.to_string()),
                client_id: env_or_default("MQTT_CLIENT_ID", "tuya-local-mqtt".to_string()),
                discovery_prefix: env_or_default(
                    "HA_DISCOVERY_PREFIX",
                    "homeassistant".to_string(),
                ),
            },
            tuya: TuyaConfig {
                poll_interval_secs: env_or_default("TUYA_POLL_INTERVAL_SECS", 30),
            },
            entries: parse_entries(&read_file(&devices_file)?, &devices_file)?,
            profiles: parse_profiles(&read_file(&profiles_file)?, &profiles_file)?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.broker_host.is_empty() {
            return Err(ConfigError::Invalid("MQTT_BROKER_HOST must not be empty".into()));
        }
        if self.entries.is_empty() {
            return Err(ConfigError::Invalid("No devices found in devices file".into()));
        }
        if self.tuya.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid("TUYA_POLL_INTERVAL_SECS must be > 0".into()));
        }

        let gateways = config_entry_gateways(&self.entries);
        for entry in self.entries.async_entries(DOMAIN) {
            let invalid = |reason: String| ConfigError::InvalidEntry {
                entry: entry.title.clone(),
                reason,
            };

            if let Some(parent) = entry.get_str(CONF_PARENT_GATEWAY) {
                if !gateways.iter().any(|g| g == parent) {
                    return Err(invalid(format!("parent {parent} is not a gateway")));
                }
            }

            match entry.get_str(CONF_TYPE) {
                Some(device_type) if !self.profiles.contains_key(device_type) => {
                    return Err(invalid(format!("unknown device type {device_type}")));
                }
                Some(_) => {}
                None if entry.get_flag(CONF_IS_GATEWAY) => {}
                None => return Err(invalid(format!("missing '{CONF_TYPE}'"))),
            }

            ConnectionSettings::from_entry(entry, &self.entries)?;
        }
        Ok(())
    }
}

impl MqttConfig {
    pub fn bridge_status_topic(&self) -> String {
        format!("{}/bridge_status", self.topic_prefix)
    }
}

fn read_file(path: &str) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_string(),
        source,
    })
}

fn parse_entries(content: &str, path: &str) -> Result<ConfigEntries, ConfigError> {
    let raw_entries: Vec<RawEntry> =
        serde_json::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })?;

    let entries = raw_entries
        .into_iter()
        .enumerate()
        .map(|(index, raw)| {
            let (title, data) = match raw {
                RawEntry::Wrapped { title, data } => (title, data),
                RawEntry::Bare(data) => (None, data),
            };
            let title = title
                .or_else(|| data.get(CONF_NAME).and_then(Value::as_str).map(String::from))
                .or_else(|| data.get(CONF_DEVICE_ID).and_then(Value::as_str).map(String::from))
                .unwrap_or_else(|| format!("entry_{index}"));
            ConfigEntry::new(format!("entry_{index}"), title, data)
        })
        .collect();

    Ok(ConfigEntries::new(entries))
}

fn parse_profiles(content: &str, path: &str) -> Result<HashMap<String, DeviceProfile>, ConfigError> {
    serde_json::from_str(content).map_err(|source| ConfigError::Parse {
        path: path.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entries::config_entry_by_device_id;

    const PROFILES: &str = r#"{
        "smart_plug": {
            "name": "Smart Plug",
            "primary_entity": {
                "entity": "switch",
                "dps": [{"id": "1", "name": "switch", "type": "boolean"}]
            }
        },
        "door_sensor": {
            "name": "Door Sensor",
            "primary_entity": {
                "entity": "binary_sensor",
                "class": "door",
                "dps": [{"id": "1", "name": "sensor", "type": "boolean"}]
            },
            "secondary_entities": [{
                "entity": "sensor",
                "name": "Battery",
                "category": "diagnostic",
                "dps": [{"id": "2", "name": "sensor", "type": "integer", "unit": "%"}]
            }]
        }
    }"#;

    fn config(devices: &str) -> Config {
        Config {
            mqtt: MqttConfig {
                broker_host: "localhost".into(),
                broker_port: 1883,
                username: None,
                password: None,
                topic_prefix: "tuya_local".into(),
                client_id: "test".into(),
                discovery_prefix: "homeassistant".into(),
            },
            tuya: TuyaConfig {
                poll_interval_secs: 30,
            },
            entries: parse_entries(devices, "devices.json").unwrap(),
            profiles: parse_profiles(PROFILES, "profiles.json").unwrap(),
        }
    }

    #[test]
    fn parses_bare_and_wrapped_entries() {
        let config = config(
            r#"[
                {"device_id": "plug1", "host": "10.0.0.5", "local_key": "k", "type": "smart_plug", "name": "Desk"},
                {"title": "Hub", "data": {"device_id": "gw1", "host": "10.0.0.2", "local_key": "g", "is_gateway": true}}
            ]"#,
        );
        assert_eq!(config.entries.len(), 2);
        let plug = config_entry_by_device_id(&config.entries, "plug1").unwrap();
        assert_eq!(plug.title, "Desk");
        assert_eq!(plug.entry_id, "entry_0");
        let hub = config_entry_by_device_id(&config.entries, "gw1").unwrap();
        assert_eq!(hub.title, "Hub");
        assert!(config.validate().is_ok());
        assert_eq!(config.profiles["door_sensor"].all_entities().count(), 2);
    }

    #[test]
    fn sub_devices_need_a_gateway_parent() {
        let ok = config(
            r#"[
                {"device_id": "gw1", "host": "10.0.0.2", "local_key": "g", "is_gateway": true},
                {"device_id": "gw1", "device_cid": "c1", "parent_gateway": "gw1", "type": "door_sensor"}
            ]"#,
        );
        assert!(ok.validate().is_ok());

        let not_gateway = config(
            r#"[
                {"device_id": "plug1", "host": "10.0.0.5", "local_key": "k", "type": "smart_plug"},
                {"device_id": "plug1", "device_cid": "c1", "parent_gateway": "plug1", "type": "door_sensor"}
            ]"#,
        );
        assert!(matches!(
            not_gateway.validate(),
            Err(ConfigError::InvalidEntry { .. })
        ));
    }

    #[test]
    fn entry_order_does_not_matter_for_sub_devices() {
        let config = config(
            r#"[
                {"device_id": "gw1", "device_cid": "c1", "parent_gateway": "gw1", "type": "door_sensor"},
                {"device_id": "gw1", "host": "10.0.0.2", "local_key": "g", "is_gateway": true}
            ]"#,
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_unknown_types_and_versions() {
        let unknown = config(
            r#"[{"device_id": "x", "host": "10.0.0.5", "local_key": "k", "type": "toaster"}]"#,
        );
        assert!(unknown.validate().is_err());

        let untyped = config(r#"[{"device_id": "x", "host": "10.0.0.5", "local_key": "k"}]"#);
        assert!(untyped.validate().is_err());

        let bad_version = config(
            r#"[{"device_id": "x", "host": "10.0.0.5", "local_key": "k", "type": "smart_plug", "protocol_version": "2.0"}]"#,
        );
        assert!(bad_version.validate().is_err());
    }

    #[test]
    fn demo_files_validate() {
        let mut config = config(include_str!("../demos/devices.json"));
        config.profiles =
            parse_profiles(include_str!("../demos/profiles.json"), "profiles.json").unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config_entry_gateways(&config.entries).len(), 1);
    }

    #[test]
    fn empty_devices_file_is_rejected() {
        let empty = config("[]");
        assert!(matches!(empty.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn malformed_files_report_the_path() {
        let err = parse_entries("{not json", "devices.json").unwrap_err();
        assert!(err.to_string().starts_with("Failed to parse devices.json"));
    }
}
