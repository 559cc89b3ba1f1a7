use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use crate::consts::{CONF_DEVICE_CID, CONF_NAME, CONF_PARENT_GATEWAY, DOMAIN};
use crate::entries::ConfigEntry;
use crate::error::DeviceError;
use crate::profile::DeviceProfile;

/// How the host groups entities into a device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceInfo {
    pub identifiers: Vec<(String, String)>,
    pub name: String,
    pub manufacturer: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub via_device: Option<(String, String)>,
}

/// What an entity needs from the device it belongs to.
#[async_trait]
pub trait Device: Send + Sync {
    fn has_returned_state(&self) -> bool;

    fn unique_id(&self) -> &str;

    fn device_info(&self) -> DeviceInfo;

    /// Raw value of a dp, as last reported by the device.
    fn get_property(&self, dps_id: &str) -> Option<Value>;

    async fn async_refresh(&self);

    fn register_entity(&self, entity_id: &str);

    async fn async_unregister_entity(&self, entity_id: &str);

    async fn async_set_properties(&self, dps: Map<String, Value>) -> Result<(), DeviceError>;
}

/// Requests from the host side to a device's session task.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceRequest {
    Start,
    Stop,
    Refresh,
    Set(Map<String, Value>),
}

/// A device reached over the local network, shared by its session task and its entities.
pub struct LocalDevice {
    unique_id: String,
    info: DeviceInfo,
    state: RwLock<Map<String, Value>>,
    entities: Mutex<Vec<String>>,
    request_tx: mpsc::Sender<DeviceRequest>,
    notify_tx: mpsc::Sender<String>,
}

impl LocalDevice {
    pub fn new(
        entry: &ConfigEntry,
        profile: &DeviceProfile,
        request_tx: mpsc::Sender<DeviceRequest>,
        notify_tx: mpsc::Sender<String>,
    ) -> Self {
        let parent = entry.get_str(CONF_PARENT_GATEWAY);
        let unique_id = match (parent, entry.get_str(CONF_DEVICE_CID)) {
            (Some(_), Some(cid)) => cid,
            _ => entry.device_id().unwrap_or(&entry.entry_id),
        }
        .to_string();

        let name = entry
            .get_str(CONF_NAME)
            .map(String::from)
            .unwrap_or_else(|| entry.title.clone());

        let info = DeviceInfo {
            identifiers: vec![(DOMAIN.to_string(), unique_id.clone())],
            name,
            manufacturer: profile
                .manufacturer
                .clone()
                .unwrap_or_else(|| "Tuya".to_string()),
            model: Some(profile.model.clone().unwrap_or_else(|| profile.name.clone())),
            via_device: parent.map(|p| (DOMAIN.to_string(), p.to_string())),
        };

        Self {
            unique_id,
            info,
            state: RwLock::new(Map::new()),
            entities: Mutex::new(Vec::new()),
            request_tx,
            notify_tx,
        }
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn registered_entities(&self) -> Vec<String> {
        self.entities.lock().clone()
    }

    /// Merge dps reported by the device into the cache.
    pub fn update_state(&self, dps: Map<String, Value>) {
        let changed = {
            let mut state = self.state.write();
            let was_empty = state.is_empty();
            let mut changed = false;
            for (id, value) in dps {
                if state.get(&id) != Some(&value) {
                    state.insert(id, value);
                    changed = true;
                }
            }
            changed || (was_empty && !state.is_empty())
        };
        if changed {
            self.notify_entities();
        }
    }

    /// Forget cached state after losing the device.
    pub fn clear_state(&self) {
        let had_state = {
            let mut state = self.state.write();
            let had_state = !state.is_empty();
            state.clear();
            had_state
        };
        if had_state {
            info!("Device {} is unavailable", self.info.name);
            self.notify_entities();
        }
    }

    /// Does not wait on the receiver; a full queue drops the update.
    fn notify_entities(&self) {
        for entity_id in self.registered_entities() {
            match self.notify_tx.try_send(entity_id) {
                Ok(()) => {}
                Err(TrySendError::Full(entity_id)) => {
                    warn!("Entity update queue full, dropping update for {}", entity_id);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("Entity update channel closed");
                    return;
                }
            }
        }
    }
}

#[async_trait]
impl Device for LocalDevice {
    fn has_returned_state(&self) -> bool {
        !self.state.read().is_empty()
    }

    fn unique_id(&self) -> &str {
        &self.unique_id
    }

    fn device_info(&self) -> DeviceInfo {
        self.info.clone()
    }

    fn get_property(&self, dps_id: &str) -> Option<Value> {
        self.state.read().get(dps_id).cloned()
    }

    async fn async_refresh(&self) {
        if self.request_tx.send(DeviceRequest::Refresh).await.is_err() {
            warn!("Refresh requested for stopped device {}", self.info.name);
        }
    }

    fn register_entity(&self, entity_id: &str) {
        let first = {
            let mut entities = self.entities.lock();
            if entities.iter().any(|e| e == entity_id) {
                return;
            }
            entities.push(entity_id.to_string());
            entities.len() == 1
        };
        debug!("Entity {} registered with {}", entity_id, self.info.name);
        if first {
            if let Err(e) = self.request_tx.try_send(DeviceRequest::Start) {
                warn!("Could not start device {}: {}", self.info.name, e);
            }
        }
    }

    async fn async_unregister_entity(&self, entity_id: &str) {
        let last = {
            let mut entities = self.entities.lock();
            let before = entities.len();
            entities.retain(|e| e != entity_id);
            before != entities.len() && entities.is_empty()
        };
        debug!("Entity {} unregistered from {}", entity_id, self.info.name);
        if last && self.request_tx.send(DeviceRequest::Stop).await.is_err() {
            debug!("Device {} already stopped", self.info.name);
        }
    }

    async fn async_set_properties(&self, dps: Map<String, Value>) -> Result<(), DeviceError> {
        self.request_tx
            .send(DeviceRequest::Set(dps))
            .await
            .map_err(|_| DeviceError::Closed(self.unique_id.clone()))
    }
}
