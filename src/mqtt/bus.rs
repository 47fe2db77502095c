use std::sync::Arc;

use log::error;
use serde::Serialize;

use super::{
    connection::{PublishError, Publisher},
    dto::encode,
};

pub const TOPIC_SET: &str = "/set";
pub const TOPIC_GAMMA: &str = "/gamma";
pub const TOPIC_FIRMWARE_CONFIG: &str = "/firmware/config";

/// Everything a component needs to talk to the devices: where to publish and
/// under which base topic.
#[derive(Clone)]
pub struct BusContext {
    publisher: Arc<dyn Publisher>,
    base_topic: String,
}

impl BusContext {
    pub fn new(publisher: Arc<dyn Publisher>, base_topic: impl Into<String>) -> Self {
        BusContext {
            publisher,
            base_topic: base_topic.into(),
        }
    }

    pub fn topic(&self, suffix: &str) -> String {
        format!("{}{}", self.base_topic, suffix)
    }

    /// Encodes `dto` and publishes it under `<base><suffix>`. An encoding
    /// failure skips the publish.
    pub fn publish_dto<T: Serialize>(&self, suffix: &str, dto: &T) -> Result<(), PublishError> {
        let payload = encode(dto).map_err(|e| {
            error!("Not publishing to {}: {}", suffix, e);
            e
        })?;

        self.publisher.publish(&self.topic(suffix), payload)
    }
}
