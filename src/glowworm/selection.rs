use log::{debug, info};
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::settings::{LocalConfig, SERIAL_PORT_AUTO};

use super::{
    device::{Device, WIRED_DEVICE_NAME},
    registry::{DeviceRegistry, RegistrySnapshot},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamMode {
    /// Colors are streamed over MQTT to any registered device.
    StreamBroadcast,
    /// MQTT is enabled but colors go down the wire; the wireless twin of the
    /// wired device is the one to talk to.
    Hybrid,
    WiredOnly,
}

impl StreamMode {
    pub fn of(config: &LocalConfig) -> Self {
        if config.mqtt_stream {
            StreamMode::StreamBroadcast
        } else if config.mqtt_enable {
            StreamMode::Hybrid
        } else {
            StreamMode::WiredOnly
        }
    }
}

/// Picks the device that should receive the color stream.
///
/// `None` is not an error: nothing eligible has announced itself yet and the
/// caller should simply skip this cycle.
pub fn select_target(registry: &RegistrySnapshot, config: &LocalConfig) -> Option<Device> {
    match StreamMode::of(config) {
        StreamMode::StreamBroadcast => {
            if config.serial_port != SERIAL_PORT_AUTO || config.multi_monitor > 1 {
                registry.by_name(&config.serial_port).cloned()
            } else {
                registry.first().cloned()
            }
        }
        StreamMode::Hybrid => {
            let wired = registry.by_name(WIRED_DEVICE_NAME)?;
            let mac = wired.mac.as_deref()?;

            registry
                .by_mac(mac)
                .find(|device| !device.is_wired())
                .cloned()
        }
        StreamMode::WiredOnly => registry.by_name(WIRED_DEVICE_NAME).cloned(),
    }
}

fn same_device(a: &Option<Device>, b: &Option<Device>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.name == b.name && a.mac == b.mac && a.ip == b.ip,
        (None, None) => true,
        _ => false,
    }
}

/// Re-runs [`select_target`] whenever the registry changes. The receiver
/// only sees an update when a different device gets picked.
pub fn start_target_loop(
    registry: &DeviceRegistry,
    config: LocalConfig,
    cancel: CancellationToken,
) -> (watch::Receiver<Option<Device>>, JoinHandle<()>) {
    let mut changes = registry.subscribe();
    let initial = select_target(&changes.borrow_and_update(), &config);
    let (tx, rx) = watch::channel(initial);

    let handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = changes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }

            let target = select_target(&changes.borrow_and_update(), &config);

            tx.send_if_modified(|current| {
                if same_device(current, &target) {
                    return false;
                }

                match &target {
                    Some(device) => info!("Streaming to {} ({})", device.name, device.ip),
                    None => info!("No device to stream to"),
                }
                *current = target;
                true
            });
        }

        debug!("Target selection loop stopped");
    });

    (rx, handle)
}
