use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::MqttConfig;
use crate::device::LocalDevice;
use crate::entity::TuyaLocalEntity;

use super::discovery::{
    EntityTopics, PAYLOAD_OFFLINE, PAYLOAD_ONLINE, discovery_config, discovery_topic,
    parse_entity_topic, render_availability, render_state,
};

pub type Entity = TuyaLocalEntity<LocalDevice>;

/// Messages queued per entity when (re)announcing: discovery, availability,
/// state, attributes, and two subscriptions.
const REQUESTS_PER_ENTITY: usize = 6;

struct Registered {
    entity: Arc<Entity>,
    topics: EntityTopics,
}

pub struct MqttClient {
    client: AsyncClient,
    eventloop: EventLoop,
    config: MqttConfig,
    entities: HashMap<String, Registered>,
}

impl MqttClient {
    pub fn new(config: &MqttConfig, entities: Vec<Arc<Entity>>) -> Self {
        let mut mqttopts = MqttOptions::new(
            &config.client_id,
            &config.broker_host,
            config.broker_port,
        );
        mqttopts.set_keep_alive(Duration::from_secs(30));

        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            mqttopts.set_credentials(user, pass);
        }

        // LWT: every discovery payload lists this topic, so the bridge going
        // away takes every entity with it.
        let lwt = rumqttc::LastWill::new(
            config.bridge_status_topic(),
            PAYLOAD_OFFLINE.as_bytes().to_vec(),
            QoS::AtLeastOnce,
            true,
        );
        mqttopts.set_last_will(lwt);

        // Room for a full announcement burst, which is queued before the event loop is polled again.
        let capacity = 100 + entities.len() * REQUESTS_PER_ENTITY;
        let (client, eventloop) = AsyncClient::new(mqttopts, capacity);

        let mut registered = HashMap::new();
        for entity in entities {
            let unique_id = entity.unique_id();
            let topics = EntityTopics::new(&config.topic_prefix, &unique_id);
            if registered
                .insert(unique_id.clone(), Registered { entity, topics })
                .is_some()
            {
                warn!("Duplicate entity {}, keeping the last one", unique_id);
            }
        }

        Self {
            client,
            eventloop,
            config: config.clone(),
            entities: registered,
        }
    }

    /// Run the MQTT event loop. Announces entities on connect, routes
    /// commands and refreshes to them, and republishes entities named on
    /// `updates` by their device.
    pub async fn run(mut self, mut updates: mpsc::Receiver<String>) {
        let mut last_values: HashMap<String, String> = HashMap::new();

        loop {
            tokio::select! {
                event = self.eventloop.poll() => {
                    match event {
                        Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                            info!("Connected to MQTT broker");
                            // The broker may have lost retained state; send everything again.
                            last_values.clear();
                            self.announce(&mut last_values).await;
                        }
                        Ok(Event::Incoming(Incoming::Publish(publish))) => {
                            let payload = String::from_utf8_lossy(&publish.payload).to_string();
                            self.handle_message(&publish.topic, &payload).await;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            error!("MQTT connection error: {}. Reconnecting...", e);
                            tokio::time::sleep(Duration::from_secs(5)).await;
                        }
                    }
                }
                Some(unique_id) = updates.recv() => {
                    match self.entities.get(&unique_id) {
                        Some(registered) => {
                            publish_entity(
                                &self.client,
                                &self.config,
                                registered,
                                &mut last_values,
                            )
                            .await;
                        }
                        None => debug!("Update for unknown entity {}", unique_id),
                    }
                }
            }
        }
    }

    async fn announce(&self, last_values: &mut HashMap<String, String>) {
        if let Err(e) = self
            .client
            .publish(
                self.config.bridge_status_topic(),
                QoS::AtLeastOnce,
                true,
                PAYLOAD_ONLINE,
            )
            .await
        {
            error!("Failed to publish online status: {}", e);
        }

        for registered in self.entities.values() {
            publish_entity(&self.client, &self.config, registered, last_values).await;

            for topic in [&registered.topics.command, &registered.topics.refresh] {
                if let Err(e) = self.client.subscribe(topic, QoS::AtLeastOnce).await {
                    error!("Failed to subscribe to {}: {}", topic, e);
                }
            }
        }
    }

    async fn handle_message(&self, topic: &str, payload: &str) {
        let Some((unique_id, action)) = parse_entity_topic(topic, &self.config.topic_prefix)
        else {
            debug!("Ignoring message on {}", topic);
            return;
        };
        let Some(registered) = self.entities.get(unique_id) else {
            warn!("Unknown entity in topic: {}", topic);
            return;
        };

        match action {
            "set" => {
                if let Err(e) = registered.entity.async_handle_command(payload).await {
                    warn!("Command for {} failed: {}", unique_id, e);
                }
            }
            "refresh" => registered.entity.async_update().await,
            _ => debug!("Ignoring {} for {}", action, unique_id),
        }
    }
}

/// Publish discovery config, availability, state and attributes of one
/// entity, skipping payloads identical to the last ones sent.
async fn publish_entity(
    client: &AsyncClient,
    config: &MqttConfig,
    registered: &Registered,
    last_values: &mut HashMap<String, String>,
) {
    let entity: &Entity = &registered.entity;
    let topics = &registered.topics;

    let discovery = match serde_json::to_string(&discovery_config(
        entity,
        topics,
        &config.bridge_status_topic(),
    )) {
        Ok(json) => json,
        Err(e) => {
            error!("Failed to encode discovery for {}: {}", entity.unique_id(), e);
            return;
        }
    };
    let attributes = serde_json::Value::Object(entity.extra_state_attributes()).to_string();

    let messages = [
        (
            discovery_topic(&config.discovery_prefix, entity.platform(), &entity.unique_id()),
            discovery,
            true,
        ),
        (
            topics.availability.clone(),
            render_availability(entity).to_string(),
            true,
        ),
        (topics.state.clone(), render_state(entity), true),
        (topics.attributes.clone(), attributes, true),
    ];

    for (topic, payload, retain) in messages {
        if last_values.get(&topic) == Some(&payload) {
            continue;
        }
        debug!("Publishing {}: {}", topic, payload);
        if let Err(e) = client
            .publish(&topic, QoS::AtLeastOnce, retain, payload.as_bytes())
            .await
        {
            warn!("Failed to publish {}: {}", topic, e);
            continue;
        }
        last_values.insert(topic, payload);
    }
}
