use std::sync::Arc;

use color_eyre::Result;
use eyre::eyre;
use log::{debug, error, info};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    collaborators::CaptureControl,
    glowworm::{device::Device, registry::DeviceRegistry},
    mqtt::{connection::InboundMessage, dto::decode_announcement},
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Routed {
    Announcement(String),
    StartCapture,
    StopCapture,
    Ignored,
}

/// Decides what an inbound message means and hands it to whoever owns it.
#[derive(Clone)]
pub struct InboundRouter {
    pub registry: DeviceRegistry,
    pub capture: Arc<dyn CaptureControl>,
    pub announce_topic: Option<String>,
}

impl InboundRouter {
    pub async fn route(&self, message: InboundMessage) -> Result<Routed> {
        if self.announce_topic.as_deref() == Some(message.topic.as_str()) {
            let announcement = decode_announcement(&message.payload)?;
            if announcement.device_name.is_empty() {
                return Err(eyre!("Announcement without a device name on {}", message.topic));
            }

            let device = Device::from(announcement);
            let name = device.name.clone();

            self.registry.upsert(device).await;

            return Ok(Routed::Announcement(name));
        }

        let content = String::from_utf8_lossy(&message.payload);
        debug!("MQTT command on {}: {}", message.topic, content);

        // Plain substring match, the command channel carries no structure.
        if content.contains("START") {
            info!("Start requested over MQTT");
            self.capture.start_capture();
            Ok(Routed::StartCapture)
        } else if content.contains("STOP") {
            info!("Stop requested over MQTT");
            self.capture.stop_capture();
            Ok(Routed::StopCapture)
        } else {
            Ok(Routed::Ignored)
        }
    }
}

/// Consumes the inbound work queue so that nothing runs on the transport's
/// own task.
pub fn start_inbound_loop(
    mut inbound: mpsc::Receiver<InboundMessage>,
    router: InboundRouter,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => break,
                message = inbound.recv() => message,
            };

            let Some(message) = message else {
                break;
            };

            let topic = message.topic.clone();
            if let Err(e) = router.route(message).await {
                error!("Error while processing MQTT message on {}: {:?}", topic, e);
            }
        }

        debug!("Inbound MQTT loop stopped");
    })
}
