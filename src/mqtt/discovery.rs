use serde::Serialize;
use serde_json::Value;

use crate::device::{Device, DeviceInfo};
use crate::entity::TuyaLocalEntity;
use crate::profile::{EntityCategory, Platform, unit_from_ascii};

pub const PAYLOAD_ON: &str = "ON";
pub const PAYLOAD_OFF: &str = "OFF";
pub const PAYLOAD_ONLINE: &str = "online";
pub const PAYLOAD_OFFLINE: &str = "offline";
/// Rendered state when the primary dp has no value; the host shows it as unknown.
pub const PAYLOAD_NONE: &str = "None";

/// Per-entity topics under `{prefix}/{unique_id}/`.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityTopics {
    pub state: String,
    pub attributes: String,
    pub availability: String,
    pub command: String,
    pub refresh: String,
}

impl EntityTopics {
    pub fn new(prefix: &str, unique_id: &str) -> Self {
        let base = format!("{prefix}/{unique_id}");
        Self {
            state: format!("{base}/state"),
            attributes: format!("{base}/attributes"),
            availability: format!("{base}/availability"),
            command: format!("{base}/set"),
            refresh: format!("{base}/refresh"),
        }
    }
}

/// Parse an entity topic into (unique_id, action).
/// Expected format: {prefix}/{unique_id}/{action}
pub fn parse_entity_topic<'a>(topic: &'a str, prefix: &str) -> Option<(&'a str, &'a str)> {
    let rest = topic.strip_prefix(prefix)?.strip_prefix('/')?;
    let (unique_id, action) = rest.split_once('/')?;
    if unique_id.is_empty() || action.is_empty() || action.contains('/') {
        return None;
    }
    Some((unique_id, action))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscoveryDevice {
    pub identifiers: Vec<String>,
    pub name: String,
    pub manufacturer: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub via_device: Option<String>,
}

impl From<DeviceInfo> for DiscoveryDevice {
    fn from(info: DeviceInfo) -> Self {
        Self {
            identifiers: info
                .identifiers
                .iter()
                .map(|(domain, id)| format!("{domain}_{id}"))
                .collect(),
            name: info.name,
            manufacturer: info.manufacturer,
            model: info.model,
            via_device: info.via_device.map(|(domain, id)| format!("{domain}_{id}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Availability {
    pub topic: String,
}

/// Home Assistant MQTT discovery payload for one entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscoveryConfig {
    /// Null lets the host name the entity after its device.
    pub name: Option<String>,
    pub unique_id: String,
    pub device: DiscoveryDevice,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_category: Option<EntityCategory>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_class: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit_of_measurement: Option<String>,
    pub state_topic: String,
    pub json_attributes_topic: String,
    /// The bridge status and the entity's own availability; both must be online.
    pub availability: Vec<Availability>,
    pub availability_mode: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_on: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_off: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<f64>,
}

pub fn discovery_topic(discovery_prefix: &str, platform: Platform, unique_id: &str) -> String {
    format!("{discovery_prefix}/{}/{unique_id}/config", platform.as_str())
}

pub fn discovery_config<D: Device + ?Sized>(
    entity: &TuyaLocalEntity<D>,
    topics: &EntityTopics,
    bridge_status_topic: &str,
) -> DiscoveryConfig {
    let platform = entity.platform();
    let primary = entity.primary_dp();
    let writable = platform.is_writable() && primary.is_some_and(|dp| !dp.readonly);
    let on_off = matches!(platform, Platform::Switch | Platform::BinarySensor);
    let device = DiscoveryDevice::from(entity.device_info());

    let options = match (platform, primary) {
        (Platform::Select, Some(dp)) => Some(dp.values().iter().map(value_to_string).collect()),
        _ => None,
    };
    let range = match (platform, primary) {
        (Platform::Number, Some(dp)) => dp.host_range(),
        _ => None,
    };

    DiscoveryConfig {
        name: if entity.has_entity_name() {
            entity.name().map(String::from)
        } else {
            Some(entity.name().unwrap_or(&device.name).to_string())
        },
        unique_id: entity.unique_id(),
        device,
        entity_category: entity.entity_category(),
        icon: entity.icon(),
        device_class: entity.device_class().map(String::from),
        unit_of_measurement: primary
            .and_then(|dp| dp.unit.as_deref())
            .map(|unit| unit_from_ascii(unit).to_string()),
        state_topic: topics.state.clone(),
        json_attributes_topic: topics.attributes.clone(),
        availability: vec![
            Availability {
                topic: bridge_status_topic.to_string(),
            },
            Availability {
                topic: topics.availability.clone(),
            },
        ],
        availability_mode: "all",
        command_topic: writable.then(|| topics.command.clone()),
        payload_on: on_off.then_some(PAYLOAD_ON),
        payload_off: on_off.then_some(PAYLOAD_OFF),
        options,
        min: range.map(|(min, _, _)| min),
        max: range.map(|(_, max, _)| max),
        step: range.map(|(_, _, step)| step),
    }
}

/// The entity's state as an MQTT payload.
pub fn render_state<D: Device + ?Sized>(entity: &TuyaLocalEntity<D>) -> String {
    let Some(value) = entity.state() else {
        return PAYLOAD_NONE.to_string();
    };
    match entity.platform() {
        Platform::Switch | Platform::BinarySensor => match value {
            Value::Bool(true) => PAYLOAD_ON.to_string(),
            Value::Bool(false) => PAYLOAD_OFF.to_string(),
            other => value_to_string(&other),
        },
        _ => value_to_string(&value),
    }
}

pub fn render_availability<D: Device + ?Sized>(entity: &TuyaLocalEntity<D>) -> &'static str {
    if entity.available() {
        PAYLOAD_ONLINE
    } else {
        PAYLOAD_OFFLINE
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => PAYLOAD_NONE.to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::device::fake::FakeDevice;
    use crate::profile::TuyaEntityConfig;
    use serde_json::json;

    const BRIDGE_STATUS: &str = "tuya_local/bridge_status";

    fn entity(device: FakeDevice, config: Value) -> TuyaLocalEntity<FakeDevice> {
        let config: TuyaEntityConfig = serde_json::from_value(config).unwrap();
        TuyaLocalEntity::new(Arc::new(device), config)
    }

    #[test]
    fn topics_round_through_the_parser() {
        let topics = EntityTopics::new("tuya_local", "abc-switch");
        assert_eq!(topics.command, "tuya_local/abc-switch/set");
        assert_eq!(
            parse_entity_topic(&topics.command, "tuya_local"),
            Some(("abc-switch", "set"))
        );
        assert_eq!(
            parse_entity_topic(&topics.refresh, "tuya_local"),
            Some(("abc-switch", "refresh"))
        );
        assert_eq!(parse_entity_topic("other/abc/set", "tuya_local"), None);
        assert_eq!(parse_entity_topic("tuya_local/abc", "tuya_local"), None);
        assert_eq!(parse_entity_topic("tuya_local/abc/set/x", "tuya_local"), None);
    }

    #[test]
    fn number_discovery_carries_range_and_unit() {
        let entity = entity(
            FakeDevice::new("heater1"),
            json!({
                "entity": "number",
                "name": "Target Temperature",
                "category": "config",
                "dps": [{
                    "id": "2",
                    "name": "value",
                    "type": "integer",
                    "unit": "C",
                    "range": {"min": 50, "max": 350},
                    "step": 5,
                    "mapping": [{"scale": 10}]
                }]
            }),
        );
        let topics = EntityTopics::new("tuya_local", &entity.unique_id());
        let config = discovery_config(&entity, &topics, BRIDGE_STATUS);

        assert_eq!(config.name.as_deref(), Some("Target Temperature"));
        assert_eq!(config.unique_id, "heater1-number_target_temperature");
        assert_eq!(config.device.identifiers, vec!["tuya_local_heater1".to_string()]);
        assert_eq!(config.unit_of_measurement.as_deref(), Some("°C"));
        assert_eq!(config.command_topic.as_deref(), Some(topics.command.as_str()));
        assert_eq!((config.min, config.max, config.step), (Some(5.0), Some(35.0), Some(0.5)));
        assert_eq!(config.payload_on, None);

        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["entity_category"], "config");
        assert!(json.get("options").is_none());
    }

    #[test]
    fn unnamed_sensor_serializes_null_name_without_command() {
        let entity = entity(
            FakeDevice::new("th1"),
            json!({
                "entity": "binary_sensor",
                "class": "door",
                "dps": [{"id": "1", "name": "sensor", "type": "boolean"}]
            }),
        );
        let topics = EntityTopics::new("tuya_local", &entity.unique_id());
        let json = serde_json::to_value(discovery_config(&entity, &topics, BRIDGE_STATUS)).unwrap();
        assert_eq!(json["name"], Value::Null);
        assert_eq!(json["device_class"], "door");
        assert_eq!(json["payload_on"], "ON");
        assert!(json.get("command_topic").is_none());
        assert!(json.get("icon").is_none());
    }

    #[test]
    fn availability_follows_bridge_and_entity() {
        let entity = entity(
            FakeDevice::new("plug1"),
            json!({
                "entity": "switch",
                "dps": [{"id": "1", "name": "switch", "type": "boolean"}]
            }),
        );
        let topics = EntityTopics::new("tuya_local", &entity.unique_id());
        let json = serde_json::to_value(discovery_config(&entity, &topics, BRIDGE_STATUS)).unwrap();
        assert_eq!(json["availability_mode"], "all");
        assert_eq!(
            json["availability"],
            json!([
                {"topic": "tuya_local/bridge_status"},
                {"topic": "tuya_local/plug1-switch/availability"}
            ])
        );
        assert!(json.get("availability_topic").is_none());
    }

    #[test]
    fn select_discovery_lists_options() {
        let entity = entity(
            FakeDevice::new("ac1"),
            json!({
                "entity": "select",
                "name": "Mode",
                "dps": [{
                    "id": "4",
                    "name": "option",
                    "type": "string",
                    "mapping": [
                        {"dps_val": "cold", "value": "Cool"},
                        {"dps_val": "hot", "value": "Heat"}
                    ]
                }]
            }),
        );
        let topics = EntityTopics::new("tuya_local", &entity.unique_id());
        let config = discovery_config(&entity, &topics, BRIDGE_STATUS);
        assert_eq!(config.options, Some(vec!["Cool".to_string(), "Heat".to_string()]));
    }

    #[test]
    fn state_rendering_per_platform() {
        let switch = entity(
            FakeDevice::with_dps("plug1", json!({"1": true})),
            json!({
                "entity": "switch",
                "dps": [{"id": "1", "name": "switch", "type": "boolean"}]
            }),
        );
        assert_eq!(render_state(&switch), "ON");
        assert_eq!(render_availability(&switch), "online");

        let sensor = entity(
            FakeDevice::new("th1"),
            json!({
                "entity": "sensor",
                "dps": [{"id": "3", "name": "sensor", "type": "integer"}]
            }),
        );
        assert_eq!(render_state(&sensor), "None");
        assert_eq!(render_availability(&sensor), "offline");
    }
}
