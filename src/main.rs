mod config;
mod consts;
mod device;
mod entity;
mod entries;
mod error;
mod mqtt;
mod profile;
mod tuya;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::consts::{CONF_TYPE, DOMAIN};
use crate::device::{DeviceRequest, LocalDevice};
use crate::entity::TuyaLocalEntity;
use crate::entries::config_entry_gateways;
use crate::tuya::ConnectionSettings;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = match config::Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        "Starting tuya-local-mqtt bridge (mqtt={}:{}, entries={}, profiles={})",
        config.mqtt.broker_host,
        config.mqtt.broker_port,
        config.entries.len(),
        config.profiles.len(),
    );

    let gateways = config_entry_gateways(&config.entries);
    if !gateways.is_empty() {
        info!("  Gateways: {}", gateways.join(", "));
    }

    // Devices name the entities to republish on this channel
    let (update_tx, update_rx) = mpsc::channel::<String>(200);

    let poll_interval = Duration::from_secs(config.tuya.poll_interval_secs);
    let mut entities = Vec::new();
    let mut device_handles = Vec::new();

    for entry in config.entries.async_entries(DOMAIN) {
        let Some(device_type) = entry.get_str(CONF_TYPE) else {
            info!("  Gateway: {} (no entities)", entry.title);
            continue;
        };
        let Some(profile) = config.profiles.get(device_type) else {
            warn!("Skipping {}: unknown device type {}", entry.title, device_type);
            continue;
        };
        let settings = match ConnectionSettings::from_entry(entry, &config.entries) {
            Ok(s) => s,
            Err(e) => {
                warn!("Skipping {}: {}", entry.title, e);
                continue;
            }
        };

        let (request_tx, request_rx) = mpsc::channel::<DeviceRequest>(50);
        let device = Arc::new(LocalDevice::new(entry, profile, request_tx, update_tx.clone()));

        info!(
            "  Device: {} ({}) at {}: {} ({} entities)",
            device.name(),
            settings.dev_id,
            settings.ip,
            profile.name,
            profile.all_entities().count(),
        );

        for entity_config in profile.all_entities() {
            entities.push(Arc::new(TuyaLocalEntity::new(
                device.clone(),
                entity_config.clone(),
            )));
        }

        let client = tuya::client::TuyaClient::new(settings, device);
        device_handles.push(tokio::spawn(async move {
            client.run(request_rx, poll_interval).await;
        }));
    }

    // Drop the original sender so the channel closes when all devices are gone
    drop(update_tx);

    for entity in &entities {
        entity.async_added_to_hass().await;
    }

    let mqtt_client = mqtt::client::MqttClient::new(&config.mqtt, entities.clone());
    let mqtt_handle = tokio::spawn(async move {
        mqtt_client.run(update_rx).await;
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT, shutting down");
        }
        _ = async {
            let mut sigterm = tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::terminate()
            ).expect("Failed to register SIGTERM handler");
            sigterm.recv().await;
        } => {
            info!("Received SIGTERM, shutting down");
        }
    }

    // Cleanup
    for entity in &entities {
        entity.async_will_remove_from_hass().await;
    }
    for handle in device_handles {
        handle.abort();
    }
    mqtt_handle.abort();
    info!("tuya-local-mqtt bridge stopped");
}
