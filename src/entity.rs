use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::info;

use crate::device::{Device, DeviceInfo};
use crate::error::CommandError;
use crate::profile::{EntityCategory, Platform, TuyaDpsConfig, TuyaEntityConfig};

/// Common behaviour for every entity type: binds one entity config to the
/// device it reads from, and presents it the way the host expects.
pub struct TuyaLocalEntity<D: Device + ?Sized> {
    device: Arc<D>,
    config: TuyaEntityConfig,
    primary_dp: Option<TuyaDpsConfig>,
    attr_dps: Vec<TuyaDpsConfig>,
}

impl<D: Device + ?Sized> TuyaLocalEntity<D> {
    pub fn new(device: Arc<D>, config: TuyaEntityConfig) -> Self {
        let (mut entity, mut dps) = Self::init_begin(device, config);
        entity.primary_dp = dps.remove(entity.platform().primary_dps());
        entity.init_end(dps);
        entity
    }

    fn init_begin(device: Arc<D>, config: TuyaEntityConfig) -> (Self, BTreeMap<String, TuyaDpsConfig>) {
        let dps = config
            .dps()
            .iter()
            .map(|dp| (dp.name.clone(), dp.clone()))
            .collect();
        let entity = Self {
            device,
            config,
            primary_dp: None,
            attr_dps: Vec::new(),
        };
        (entity, dps)
    }

    fn init_end(&mut self, dps: BTreeMap<String, TuyaDpsConfig>) {
        self.attr_dps
            .extend(dps.into_values().filter(|dp| !dp.hidden));
    }

    pub fn platform(&self) -> Platform {
        self.config.entity
    }

    pub fn primary_dp(&self) -> Option<&TuyaDpsConfig> {
        self.primary_dp.as_ref()
    }

    pub fn device_class(&self) -> Option<&str> {
        self.config.class.as_deref()
    }

    pub fn should_poll(&self) -> bool {
        false
    }

    pub fn available(&self) -> bool {
        self.device.has_returned_state()
    }

    /// Name for the UI; absent means the device name is used.
    pub fn name(&self) -> Option<&str> {
        self.config.name()
    }

    pub fn has_entity_name(&self) -> bool {
        true
    }

    pub fn unique_id(&self) -> String {
        self.config.unique_id(self.device.unique_id())
    }

    pub fn device_info(&self) -> DeviceInfo {
        self.device.device_info()
    }

    pub fn entity_category(&self) -> Option<EntityCategory> {
        self.config.entity_category()
    }

    pub fn icon(&self) -> Option<String> {
        match self.config.icon(self.device.as_ref()) {
            Some(icon) if !icon.is_empty() => Some(icon),
            _ => self.platform().default_icon().map(String::from),
        }
    }

    /// The value of the dp the platform renders as its state.
    pub fn state(&self) -> Option<Value> {
        self.primary_dp
            .as_ref()
            .and_then(|dp| dp.get_value(self.device.as_ref()))
    }

    /// Values of the remaining visible dps. Optional dps are left out while
    /// they have no value; everything else is reported, null included.
    pub fn extra_state_attributes(&self) -> Map<String, Value> {
        let mut attr = Map::new();
        for dp in &self.attr_dps {
            let value = dp.get_value(self.device.as_ref());
            if value.is_some() || !dp.optional {
                attr.insert(dp.name.clone(), value.unwrap_or(Value::Null));
            }
        }
        attr
    }

    /// Apply a command payload from the host to the primary dp.
    pub async fn async_handle_command(&self, payload: &str) -> Result<(), CommandError> {
        let dp = self
            .primary_dp
            .as_ref()
            .filter(|_| self.platform().is_writable())
            .ok_or_else(|| CommandError::NotWritable(self.unique_id()))?;

        let payload = payload.trim();
        let value = match self.platform() {
            Platform::Switch => match payload.to_ascii_uppercase().as_str() {
                "ON" | "TRUE" | "1" => Value::Bool(true),
                "OFF" | "FALSE" | "0" => Value::Bool(false),
                _ => return Err(invalid(dp, payload)),
            },
            Platform::Number => payload
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| invalid(dp, payload))?,
            Platform::Select => Value::String(payload.to_string()),
            Platform::Sensor | Platform::BinarySensor => {
                return Err(CommandError::NotWritable(self.unique_id()));
            }
        };

        let mut dps = Map::new();
        dps.insert(dp.id.clone(), dp.get_value_to_set(&value)?);
        info!("Setting {} to {}", self.unique_id(), payload);
        self.device.async_set_properties(dps).await?;
        Ok(())
    }

    pub async fn async_update(&self) {
        self.device.async_refresh().await;
    }

    pub async fn async_added_to_hass(&self) {
        self.device.register_entity(&self.unique_id());
    }

    pub async fn async_will_remove_from_hass(&self) {
        self.device.async_unregister_entity(&self.unique_id()).await;
    }
}

fn invalid(dp: &TuyaDpsConfig, payload: &str) -> CommandError {
    CommandError::InvalidValue {
        dp: dp.name.clone(),
        value: payload.to_string(),
    }
}
