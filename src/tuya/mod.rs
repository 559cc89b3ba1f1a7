pub mod client;

use std::net::IpAddr;

use serde_json::{Map, Value};

use crate::consts::{
    API_PROTOCOL_VERSIONS, CONF_DEVICE_CID, CONF_HOST, CONF_LOCAL_KEY, CONF_PARENT_GATEWAY,
    CONF_POLL_ONLY, CONF_PROTOCOL_VERSION, DEFAULT_PROTOCOL_VERSION,
};
use crate::entries::{ConfigEntries, ConfigEntry, gateway_entry_by_device_id};
use crate::error::ConfigError;

/// Everything needed to open a local session for one device.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSettings {
    pub name: String,
    /// Id the session authenticates as: the device itself, or its gateway.
    pub device_id: String,
    /// Id dps are queried for: the device, or the sub-device's cid.
    pub dev_id: String,
    pub cid: Option<String>,
    pub local_key: String,
    pub ip: IpAddr,
    pub version: String,
    pub poll_only: bool,
}

impl ConnectionSettings {
    /// Resolve the connection for `entry`. Gateway sub-devices connect through
    /// their parent's address, key and protocol version.
    pub fn from_entry(entry: &ConfigEntry, entries: &ConfigEntries) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidEntry {
            entry: entry.title.clone(),
            reason,
        };
        let device_id = entry
            .device_id()
            .ok_or_else(|| invalid("missing 'device_id'".into()))?;

        let (via, cid) = match entry.get_str(CONF_PARENT_GATEWAY) {
            Some(parent) => {
                let gateway = gateway_entry_by_device_id(entries, parent)
                    .ok_or_else(|| invalid(format!("parent gateway {parent} not configured")))?;
                let cid = entry
                    .get_str(CONF_DEVICE_CID)
                    .ok_or_else(|| invalid("sub-device missing 'device_cid'".into()))?;
                (gateway, Some(cid.to_string()))
            }
            None => (entry, None),
        };

        let via_id = via.device_id().unwrap_or(device_id);
        let host = via
            .get_str(CONF_HOST)
            .ok_or_else(|| invalid(format!("{via_id} missing '{CONF_HOST}'")))?;
        let ip: IpAddr = host
            .parse()
            .map_err(|e| invalid(format!("invalid host '{host}': {e}")))?;
        let local_key = via
            .get_str(CONF_LOCAL_KEY)
            .ok_or_else(|| invalid(format!("{via_id} missing '{CONF_LOCAL_KEY}'")))?;
        let version = protocol_version(via).map_err(invalid)?;

        Ok(Self {
            name: entry.title.clone(),
            device_id: via_id.to_string(),
            dev_id: cid.clone().unwrap_or_else(|| device_id.to_string()),
            cid,
            local_key: local_key.to_string(),
            ip,
            version,
            poll_only: entry.get_flag(CONF_POLL_ONLY),
        })
    }
}

/// The entry's protocol version as the session library spells it.
pub fn protocol_version(entry: &ConfigEntry) -> Result<String, String> {
    let version = match entry.data.get(CONF_PROTOCOL_VERSION) {
        None | Some(Value::Null) => DEFAULT_PROTOCOL_VERSION.to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => match n.as_f64() {
            Some(f) => format!("{f:.1}"),
            None => n.to_string(),
        },
        Some(other) => return Err(format!("invalid protocol version {other}")),
    };
    if API_PROTOCOL_VERSIONS.contains(&version.as_str()) {
        Ok(version)
    } else {
        Err(format!("unsupported protocol version {version}"))
    }
}

/// Extract dps from a JSON payload, skipping gateway traffic meant for another sub-device.
pub fn dps_from_json(payload: &str, cid: Option<&str>) -> Option<Map<String, Value>> {
    let value: Value = serde_json::from_str(payload).ok()?;
    if let (Some(expected), Some(actual)) = (cid, value.get("cid").and_then(Value::as_str)) {
        if expected != actual {
            return None;
        }
    }
    match value.get("dps")? {
        Value::Object(dps) => Some(dps.clone()),
        _ => None,
    }
}
