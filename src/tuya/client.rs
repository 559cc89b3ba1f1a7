use std::sync::Arc;
use std::time::Duration;

use rust_async_tuyapi::mesparse::{CommandType, Message};
use rust_async_tuyapi::tuyadevice::TuyaDevice;
use rust_async_tuyapi::{Payload, PayloadStruct};
use serde_json::{Map, Value, json};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::device::{DeviceRequest, LocalDevice};

use super::{ConnectionSettings, dps_from_json};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
const POLL_RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);
const INITIAL_BACKOFF: Duration = Duration::from_secs(5);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Reconnect delay: doubles on every failure up to the cap, back to the
/// start once a session gets going.
#[derive(Debug)]
struct Backoff {
    next: Duration,
}

impl Backoff {
    fn new() -> Self {
        Self {
            next: INITIAL_BACKOFF,
        }
    }

    fn current(&self) -> Duration {
        self.next
    }

    fn failed(&mut self) {
        self.next = (self.next * 2).min(MAX_BACKOFF);
    }

    fn reset(&mut self) {
        self.next = INITIAL_BACKOFF;
    }
}

/// How a started device stopped running.
enum Exit {
    /// Asked to stop; wait for the next start.
    Stopped,
    /// The request channel is gone; the task should end.
    Closed,
}

pub struct TuyaClient {
    settings: ConnectionSettings,
    device: Arc<LocalDevice>,
}

impl TuyaClient {
    pub fn new(settings: ConnectionSettings, device: Arc<LocalDevice>) -> Self {
        Self { settings, device }
    }

    /// Device task. Idles until an entity registers, then keeps the device
    /// connected until the last entity goes away.
    pub async fn run(&self, mut requests: mpsc::Receiver<DeviceRequest>, poll_interval: Duration) {
        loop {
            match requests.recv().await {
                Some(DeviceRequest::Start) => {}
                Some(other) => {
                    debug!("Device {} not started, ignoring {:?}", self.settings.name, other);
                    continue;
                }
                None => return,
            }

            info!("Starting device {}", self.settings.name);
            match self.run_started(&mut requests, poll_interval).await {
                Exit::Stopped => info!("Stopped device {}", self.settings.name),
                Exit::Closed => return,
            }
        }
    }

    /// Connects, polls, handles requests, reconnects on failure.
    async fn run_started(
        &self,
        requests: &mut mpsc::Receiver<DeviceRequest>,
        poll_interval: Duration,
    ) -> Exit {
        let mut backoff = Backoff::new();

        loop {
            info!(
                "Connecting to device {} ({}) at {}",
                self.settings.name, self.settings.dev_id, self.settings.ip
            );

            let result = if self.settings.poll_only {
                self.run_polling(requests, poll_interval, &mut backoff).await
            } else {
                self.run_session(requests, poll_interval, &mut backoff).await
            };

            match result {
                Ok(exit) => {
                    self.device.clear_state();
                    return exit;
                }
                Err(e) => {
                    error!(
                        "Device {} session error: {}. Reconnecting in {:?}",
                        self.settings.name,
                        e,
                        backoff.current()
                    );
                    self.device.clear_state();

                    tokio::select! {
                        _ = tokio::time::sleep(backoff.current()) => {}
                        request = requests.recv() => {
                            match request {
                                Some(DeviceRequest::Stop) => return Exit::Stopped,
                                None => return Exit::Closed,
                                Some(DeviceRequest::Set(dps)) => {
                                    warn!("Dropping command for offline device {}: {:?}", self.settings.name, dps);
                                }
                                Some(_) => {}
                            }
                        }
                    }
                    backoff.failed();
                }
            }
        }
    }

    fn open(&self) -> Result<TuyaDevice, String> {
        TuyaDevice::new(
            &self.settings.version,
            &self.settings.device_id,
            Some(&self.settings.local_key),
            self.settings.ip,
        )
        .map_err(|e| format!("Failed to create device: {e:?}"))
    }

    /// Persistent session: the device pushes changes, polled as a fallback.
    async fn run_session(
        &self,
        requests: &mut mpsc::Receiver<DeviceRequest>,
        poll_interval: Duration,
        backoff: &mut Backoff,
    ) -> Result<Exit, String> {
        let mut device = self.open()?;
        let mut receiver = device
            .connect()
            .await
            .map_err(|e| format!("Failed to connect: {e:?}"))?;

        info!("Connected to device {}", self.settings.name);

        self.query_all_dps(&mut device).await?;
        backoff.reset();

        let mut heartbeat_interval = tokio::time::interval(HEARTBEAT_INTERVAL);
        let mut poll_timer = tokio::time::interval(poll_interval);
        // Skip first tick (we already queried)
        poll_timer.tick().await;

        loop {
            tokio::select! {
                _ = heartbeat_interval.tick() => {
                    device.heartbeat().await
                        .map_err(|e| format!("Heartbeat failed: {e:?}"))?;
                }
                _ = poll_timer.tick() => {
                    self.query_all_dps(&mut device).await?;
                }
                msg = receiver.recv() => {
                    match msg {
                        Some(Ok(messages)) => {
                            for m in messages {
                                if m.command == Some(CommandType::HeartBeat) {
                                    continue;
                                }
                                if let Some(dps) = self.extract_dps(&m) {
                                    info!("Processing {} DPs from {}", dps.len(), self.settings.name);
                                    self.device.update_state(dps);
                                }
                            }
                        }
                        Some(Err(e)) => {
                            return Err(format!("Device error: {e:?}"));
                        }
                        None => {
                            return Err("Device channel closed".into());
                        }
                    }
                }
                request = requests.recv() => {
                    match request {
                        Some(DeviceRequest::Stop) => return Ok(Exit::Stopped),
                        None => return Ok(Exit::Closed),
                        Some(DeviceRequest::Start) => {}
                        Some(DeviceRequest::Refresh) => {
                            self.query_all_dps(&mut device).await?;
                        }
                        Some(DeviceRequest::Set(dps)) => {
                            info!("Sending command to {}: {:?}", self.settings.name, dps);
                            if let Err(e) = device.set_values(Value::Object(dps)).await {
                                warn!("Failed to send command to {}: {:?}", self.settings.name, e);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Poll-only mode: a short connection per query or write.
    async fn run_polling(
        &self,
        requests: &mut mpsc::Receiver<DeviceRequest>,
        poll_interval: Duration,
        backoff: &mut Backoff,
    ) -> Result<Exit, String> {
        let mut poll_timer = tokio::time::interval(poll_interval);

        loop {
            tokio::select! {
                _ = poll_timer.tick() => {
                    self.poll_once().await?;
                    backoff.reset();
                }
                request = requests.recv() => {
                    match request {
                        Some(DeviceRequest::Stop) => return Ok(Exit::Stopped),
                        None => return Ok(Exit::Closed),
                        Some(DeviceRequest::Start) => {}
                        Some(DeviceRequest::Refresh) => self.poll_once().await?,
                        Some(DeviceRequest::Set(dps)) => self.write_once(dps).await?,
                    }
                }
            }
        }
    }

    async fn poll_once(&self) -> Result<(), String> {
        let mut device = self.open()?;
        let mut receiver = device
            .connect()
            .await
            .map_err(|e| format!("Failed to connect: {e:?}"))?;

        self.query_all_dps(&mut device).await?;

        let dps = tokio::time::timeout(POLL_RESPONSE_TIMEOUT, async {
            while let Some(msg) = receiver.recv().await {
                match msg {
                    Ok(messages) => {
                        if let Some(dps) = messages.iter().find_map(|m| self.extract_dps(m)) {
                            return Ok(dps);
                        }
                    }
                    Err(e) => return Err(format!("Device error: {e:?}")),
                }
            }
            Err("Device channel closed".to_string())
        })
        .await
        .map_err(|_| format!("No response from {} within {:?}", self.settings.name, POLL_RESPONSE_TIMEOUT))??;

        debug!("Polled {} DPs from {}", dps.len(), self.settings.name);
        self.device.update_state(dps);
        Ok(())
    }

    async fn write_once(&self, dps: Map<String, Value>) -> Result<(), String> {
        let mut device = self.open()?;
        let _receiver = device
            .connect()
            .await
            .map_err(|e| format!("Failed to connect: {e:?}"))?;

        info!("Sending command to {}: {:?}", self.settings.name, dps);
        device
            .set_values(Value::Object(dps))
            .await
            .map_err(|e| format!("Command failed: {e:?}"))?;
        self.poll_once().await
    }

    async fn query_all_dps(&self, device: &mut TuyaDevice) -> Result<(), String> {
        let payload = Payload::Struct(PayloadStruct {
            dev_id: self.settings.dev_id.clone(),
            gw_id: Some(self.settings.device_id.clone()),
            uid: None,
            t: None,
            dp_id: None,
            dps: Some(json!({})),
        });

        device
            .get(payload)
            .await
            .map_err(|e| format!("DP query failed: {e:?}"))
    }

    fn extract_dps(&self, msg: &Message) -> Option<Map<String, Value>> {
        dps_from_payload(&msg.payload, self.settings.cid.as_deref())
    }
}

/// Dps carried by a message payload. With `cid` set, payloads addressed to
/// another sub-device of the same gateway are skipped.
fn dps_from_payload(payload: &Payload, cid: Option<&str>) -> Option<Map<String, Value>> {
    // DP query responses sometimes arrive as Payload::String holding
    // {"dps":{...}} instead of Payload::Struct.
    match payload {
        Payload::Struct(ps) => {
            if let Some(cid) = cid {
                if ps.dev_id != cid {
                    debug!("Skipping dps for sub-device {}", ps.dev_id);
                    return None;
                }
            }
            match &ps.dps {
                Some(Value::Object(dps)) => Some(dps.clone()),
                other => {
                    debug!("PayloadStruct without dps object: {:?}", other);
                    None
                }
            }
        }
        Payload::String(s) => dps_from_json(s, cid),
        Payload::Raw(b) => {
            debug!("Payload::Raw ({} bytes), skipping", b.len());
            None
        }
        _ => None,
    }
}
