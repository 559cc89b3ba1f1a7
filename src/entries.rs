use std::collections::HashSet;

use serde_json::{Map, Value};

use crate::consts::{CONF_DEVICE_ID, CONF_IS_GATEWAY, DOMAIN};

/// One persisted integration instance. `data` is keyed by the `CONF_*` constants
/// and is otherwise left untyped.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigEntry {
    pub entry_id: String,
    pub domain: String,
    pub title: String,
    pub data: Map<String, Value>,
}

impl ConfigEntry {
    pub fn new(entry_id: impl Into<String>, title: impl Into<String>, data: Map<String, Value>) -> Self {
        Self {
            entry_id: entry_id.into(),
            domain: DOMAIN.to_string(),
            title: title.into(),
            data,
        }
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key)?.as_str()
    }

    /// Whether `key` is present and truthy.
    pub fn get_flag(&self, key: &str) -> bool {
        self.data.get(key).is_some_and(is_truthy)
    }

    pub fn device_id(&self) -> Option<&str> {
        self.get_str(CONF_DEVICE_ID)
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// The set of config entries known to the host, across all domains.
#[derive(Debug, Clone, Default)]
pub struct ConfigEntries {
    entries: Vec<ConfigEntry>,
}

impl ConfigEntries {
    pub fn new(entries: Vec<ConfigEntry>) -> Self {
        Self { entries }
    }

    pub fn async_entries<'a>(&'a self, domain: &'a str) -> impl Iterator<Item = &'a ConfigEntry> {
        self.entries.iter().filter(move |e| e.domain == domain)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Look up config entry by device id.
pub fn config_entry_by_device_id<'a>(
    entries: &'a ConfigEntries,
    device_id: &str,
) -> Option<&'a ConfigEntry> {
    entries
        .async_entries(DOMAIN)
        .find(|entry| entry.device_id() == Some(device_id))
}

/// The gateway entry with `device_id`. Sub-devices share their gateway's id,
/// so the first match is only taken when it is flagged as a gateway.
pub fn gateway_entry_by_device_id<'a>(
    entries: &'a ConfigEntries,
    device_id: &str,
) -> Option<&'a ConfigEntry> {
    config_entry_by_device_id(entries, device_id)
        .filter(|entry| entry.get_flag(CONF_IS_GATEWAY))
        .or_else(|| {
            entries.async_entries(DOMAIN).find(|entry| {
                entry.device_id() == Some(device_id) && entry.get_flag(CONF_IS_GATEWAY)
            })
        })
}

/// Device ids of every entry flagged as a gateway. Order is unspecified.
pub fn config_entry_gateways(entries: &ConfigEntries) -> Vec<String> {
    entries
        .async_entries(DOMAIN)
        .filter(|entry| entry.get_flag(CONF_IS_GATEWAY))
        .filter_map(|entry| entry.device_id().map(String::from))
        .collect::<HashSet<_>>()
        .into_iter()
        .collect()
}
