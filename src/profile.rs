use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

use crate::device::Device;
use crate::error::CommandError;

const DEFAULT_ICON_PRIORITY: u32 = 100;

fn default_icon_priority() -> u32 {
    DEFAULT_ICON_PRIORITY
}

/// Entity platforms a profile can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Sensor,
    BinarySensor,
    Switch,
    Number,
    Select,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Sensor => "sensor",
            Platform::BinarySensor => "binary_sensor",
            Platform::Switch => "switch",
            Platform::Number => "number",
            Platform::Select => "select",
        }
    }

    /// Name of the dp the platform renders as its own state rather than as an attribute.
    pub fn primary_dps(&self) -> &'static str {
        match self {
            Platform::Sensor | Platform::BinarySensor => "sensor",
            Platform::Switch => "switch",
            Platform::Number => "value",
            Platform::Select => "option",
        }
    }

    /// Icon used when the profile does not supply one.
    pub fn default_icon(&self) -> Option<&'static str> {
        match self {
            Platform::Switch => Some("mdi:toggle-switch-variant"),
            Platform::Number => Some("mdi:ray-vertex"),
            Platform::Select => Some("mdi:format-list-bulleted"),
            Platform::Sensor | Platform::BinarySensor => None,
        }
    }

    pub fn is_writable(&self) -> bool {
        matches!(self, Platform::Switch | Platform::Number | Platform::Select)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityCategory {
    Config,
    Diagnostic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DpType {
    Boolean,
    Integer,
    Float,
    String,
    Bitfield,
}

/// A device type: the entities it exposes and the dps behind each of them.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceProfile {
    pub name: String,
    #[serde(default)]
    pub manufacturer: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    pub primary_entity: TuyaEntityConfig,
    #[serde(default)]
    pub secondary_entities: Vec<TuyaEntityConfig>,
}

impl DeviceProfile {
    pub fn all_entities(&self) -> impl Iterator<Item = &TuyaEntityConfig> {
        std::iter::once(&self.primary_entity).chain(self.secondary_entities.iter())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TuyaEntityConfig {
    pub entity: Platform,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    category: Option<EntityCategory>,
    #[serde(default)]
    icon: Option<String>,
    #[serde(default = "default_icon_priority")]
    icon_priority: u32,
    #[serde(default)]
    pub class: Option<String>,
    dps: Vec<TuyaDpsConfig>,
}

impl TuyaEntityConfig {
    pub fn dps(&self) -> &[TuyaDpsConfig] {
        &self.dps
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn entity_category(&self) -> Option<EntityCategory> {
        self.category
    }

    /// Identifies this entity within its device.
    pub fn config_id(&self) -> String {
        match &self.name {
            Some(name) => format!("{}_{}", self.entity.as_str(), slugify(name)),
            None => self.entity.as_str().to_string(),
        }
    }

    pub fn unique_id(&self, device_uid: &str) -> String {
        format!("{}-{}", device_uid, self.config_id())
    }

    /// The icon with the lowest priority value among the entity's own icon
    /// and the icons attached to the dps' current values.
    pub fn icon<D: Device + ?Sized>(&self, device: &D) -> Option<String> {
        let mut best: Option<(u32, String)> =
            self.icon.as_ref().map(|icon| (self.icon_priority, icon.clone()));

        for dp in &self.dps {
            if let Some((priority, icon)) = dp.icon_rule(device) {
                if best.as_ref().is_none_or(|(p, _)| priority < *p) {
                    best = Some((priority, icon));
                }
            }
        }
        best.map(|(_, icon)| icon)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct DpsRange {
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DpsMapping {
    /// Raw device value this entry applies to; entries without one are the default.
    #[serde(default)]
    dps_val: Option<Value>,
    #[serde(default)]
    value: Option<Value>,
    #[serde(default)]
    scale: Option<f64>,
    #[serde(default)]
    icon: Option<String>,
    #[serde(default)]
    icon_priority: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TuyaDpsConfig {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub dp_type: DpType,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub readonly: bool,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    range: Option<DpsRange>,
    #[serde(default)]
    step: Option<f64>,
    #[serde(default)]
    mapping: Vec<DpsMapping>,
}

impl TuyaDpsConfig {
    fn default_map(&self) -> Option<&DpsMapping> {
        self.mapping.iter().find(|m| m.dps_val.is_none())
    }

    fn find_map(&self, raw: &Value) -> Option<&DpsMapping> {
        self.mapping
            .iter()
            .find(|m| m.dps_val.as_ref().is_some_and(|v| values_match(v, raw)))
            .or_else(|| self.default_map())
    }

    fn scale(&self) -> Option<f64> {
        self.default_map()
            .and_then(|m| m.scale)
            .filter(|s| *s != 0.0 && *s != 1.0)
    }

    /// The dp's value as the host should see it.
    pub fn get_value<D: Device + ?Sized>(&self, device: &D) -> Option<Value> {
        let raw = device.get_property(&self.id)?;
        let Some(map) = self.find_map(&raw) else {
            return Some(raw);
        };
        if let Some(value) = &map.value {
            return Some(value.clone());
        }
        match (map.scale, raw.as_f64()) {
            (Some(scale), Some(n)) if scale != 0.0 => Number::from_f64(n / scale).map(Value::Number),
            _ => Some(raw),
        }
    }

    /// Convert a host value back into the raw value the device expects.
    pub fn get_value_to_set(&self, value: &Value) -> Result<Value, CommandError> {
        if self.readonly {
            return Err(CommandError::ReadOnly(self.name.clone()));
        }

        let mapped = self.mapping.iter().find(|m| {
            m.dps_val.is_some() && m.value.as_ref().is_some_and(|v| values_match(v, value))
        });
        if let Some(raw) = mapped.and_then(|m| m.dps_val.clone()) {
            return Ok(raw);
        }

        let mut raw = value.clone();
        if let (Some(scale), Some(n)) = (self.scale(), value.as_f64()) {
            raw = Number::from_f64(n * scale)
                .map(Value::Number)
                .ok_or_else(|| self.invalid(value))?;
        }

        if let (Some(range), Some(n)) = (self.range, raw.as_f64()) {
            if n < range.min || n > range.max {
                return Err(self.invalid(value));
            }
        }

        coerce(self.dp_type, &raw).ok_or_else(|| self.invalid(value))
    }

    fn invalid(&self, value: &Value) -> CommandError {
        CommandError::InvalidValue {
            dp: self.name.clone(),
            value: match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            },
        }
    }

    fn icon_rule<D: Device + ?Sized>(&self, device: &D) -> Option<(u32, String)> {
        let raw = device.get_property(&self.id)?;
        let map = self.find_map(&raw)?;
        let icon = map.icon.clone()?;
        Some((map.icon_priority.unwrap_or(DEFAULT_ICON_PRIORITY), icon))
    }

    /// Host-side values the mapping declares, in declaration order.
    pub fn values(&self) -> Vec<Value> {
        self.mapping
            .iter()
            .filter(|m| m.dps_val.is_some())
            .filter_map(|m| m.value.clone())
            .collect()
    }

    /// Range and step in host units.
    pub fn host_range(&self) -> Option<(f64, f64, f64)> {
        let range = self.range?;
        let scale = self.scale().unwrap_or(1.0);
        let step = self.step.unwrap_or(1.0);
        Some((range.min / scale, range.max / scale, step / scale))
    }
}

fn values_match(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn coerce(dp_type: DpType, value: &Value) -> Option<Value> {
    match dp_type {
        DpType::Boolean => match value {
            Value::Bool(b) => Some(Value::Bool(*b)),
            Value::Number(n) => n.as_f64().map(|f| Value::Bool(f != 0.0)),
            Value::String(s) => match s.to_ascii_lowercase().as_str() {
                "true" | "1" | "on" => Some(Value::Bool(true)),
                "false" | "0" | "off" => Some(Value::Bool(false)),
                _ => None,
            },
            _ => None,
        },
        DpType::Integer | DpType::Bitfield => {
            let n = match value {
                Value::Number(n) => n.as_f64()?,
                Value::String(s) => s.trim().parse::<f64>().ok()?,
                _ => return None,
            };
            Some(Value::from(n.round() as i64))
        }
        DpType::Float => {
            let n = match value {
                Value::Number(n) => n.as_f64()?,
                Value::String(s) => s.trim().parse::<f64>().ok()?,
                _ => return None,
            };
            Number::from_f64(n).map(Value::Number)
        }
        DpType::String => match value {
            Value::String(s) => Some(Value::String(s.clone())),
            Value::Null => None,
            other => Some(Value::String(other.to_string())),
        },
    }
}

/// Map the ASCII unit spellings used in profiles to their display form.
pub fn unit_from_ascii(unit: &str) -> &str {
    match unit {
        "C" => "°C",
        "F" => "°F",
        "ugm3" => "µg/m³",
        "m2" => "m²",
        other => other,
    }
}

/// "Target Temperature" → "target_temperature"
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('_') {
            slug.push('_');
        }
    }
    slug.trim_matches('_').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::fake::FakeDevice;
    use serde_json::json;

    fn heater() -> TuyaEntityConfig {
        serde_json::from_value(json!({
            "entity": "number",
            "name": "Target Temperature",
            "icon": "mdi:thermometer",
            "dps": [
                {
                    "id": "2",
                    "name": "value",
                    "type": "integer",
                    "unit": "C",
                    "range": {"min": 50, "max": 350},
                    "step": 5,
                    "mapping": [{"scale": 10}]
                },
                {
                    "id": "4",
                    "name": "mode",
                    "type": "string",
                    "mapping": [
                        {"dps_val": "hot", "value": "heat", "icon": "mdi:fire", "icon_priority": 1},
                        {"dps_val": "cold", "value": "cool"}
                    ]
                },
                {"id": "9", "name": "error", "type": "bitfield", "readonly": true}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn unique_id_uses_platform_and_slugged_name() {
        let config = heater();
        assert_eq!(config.config_id(), "number_target_temperature");
        assert_eq!(config.unique_id("abc123"), "abc123-number_target_temperature");

        let unnamed: TuyaEntityConfig = serde_json::from_value(json!({
            "entity": "switch",
            "dps": [{"id": "1", "name": "switch", "type": "boolean"}]
        }))
        .unwrap();
        assert_eq!(unnamed.unique_id("abc123"), "abc123-switch");
        assert_eq!(unnamed.name(), None);
    }

    #[test]
    fn get_value_applies_scale_and_mapping() {
        let config = heater();
        let device = FakeDevice::with_dps("dev", json!({"2": 215, "4": "hot"}));
        assert_eq!(config.dps()[0].get_value(&device), Some(json!(21.5)));
        assert_eq!(config.dps()[1].get_value(&device), Some(json!("heat")));

        device.set_dp("4", json!("auto"));
        assert_eq!(config.dps()[1].get_value(&device), Some(json!("auto")));
    }

    #[test]
    fn get_value_is_none_when_device_has_no_value() {
        let config = heater();
        let device = FakeDevice::new("dev");
        assert_eq!(config.dps()[0].get_value(&device), None);
        assert_eq!(config.dps()[1].get_value(&device), None);
    }

    #[test]
    fn get_value_to_set_inverts_scale_and_mapping() {
        let config = heater();
        assert_eq!(config.dps()[0].get_value_to_set(&json!(22.5)), Ok(json!(225)));
        assert_eq!(config.dps()[1].get_value_to_set(&json!("cool")), Ok(json!("cold")));
    }

    #[test]
    fn get_value_to_set_rejects_out_of_range_and_readonly() {
        let config = heater();
        assert!(matches!(
            config.dps()[0].get_value_to_set(&json!(40)),
            Err(CommandError::InvalidValue { .. })
        ));
        assert_eq!(
            config.dps()[2].get_value_to_set(&json!(1)),
            Err(CommandError::ReadOnly("error".into()))
        );
    }

    #[test]
    fn host_range_is_scaled() {
        let config = heater();
        assert_eq!(config.dps()[0].host_range(), Some((5.0, 35.0, 0.5)));
        assert_eq!(config.dps()[1].values(), vec![json!("heat"), json!("cool")]);
    }

    #[test]
    fn icon_prefers_lowest_priority() {
        let config = heater();
        let device = FakeDevice::with_dps("dev", json!({"4": "hot"}));
        assert_eq!(config.icon(&device).as_deref(), Some("mdi:fire"));

        device.set_dp("4", json!("cold"));
        assert_eq!(config.icon(&device).as_deref(), Some("mdi:thermometer"));
    }

    #[test]
    fn unknown_category_is_rejected() {
        let result: Result<TuyaEntityConfig, _> = serde_json::from_value(json!({
            "entity": "sensor",
            "category": "bogus",
            "dps": []
        }));
        assert!(result.is_err());

        let diag: TuyaEntityConfig = serde_json::from_value(json!({
            "entity": "sensor",
            "category": "diagnostic",
            "dps": []
        }))
        .unwrap();
        assert_eq!(diag.entity_category(), Some(EntityCategory::Diagnostic));
    }

    #[test]
    fn ascii_units_are_translated() {
        assert_eq!(unit_from_ascii("C"), "°C");
        assert_eq!(unit_from_ascii("F"), "°F");
        assert_eq!(unit_from_ascii("ugm3"), "µg/m³");
        assert_eq!(unit_from_ascii("m2"), "m²");
        assert_eq!(unit_from_ascii("kWh"), "kWh");
    }

    #[test]
    fn slugify_collapses_separators() {
        assert_eq!(slugify("Solar Heat  Pump"), "solar_heat_pump");
        assert_eq!(slugify("-PM2.5-"), "pm2_5");
    }
}
