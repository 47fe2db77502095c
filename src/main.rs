use std::sync::Arc;

use color_eyre::Result;
use glowworm_mqtt::{
    collaborators::{CaptureControl, ConfigStore, Headless, JsonFileStore},
    glowworm::{
        controls::LedControls,
        registry::{start_sweep_loop, DeviceRegistry},
        selection::start_target_loop,
    },
    mqtt::{
        bus::BusContext,
        connection::{connect_with_retry, Publisher},
        events::{start_inbound_loop, InboundRouter},
    },
    settings::read_settings,
    tasks::join_loops,
};
use log::{info, warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const INBOUND_QUEUE_SIZE: usize = 64;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    pretty_env_logger::formatted_builder()
        .parse_filters(&std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
        .init();

    let settings = read_settings()?;
    let store = JsonFileStore::new(&settings.instance.config_dir);
    let config = store.read(settings.instance.id)?.unwrap_or_default();

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        }
    });

    let headless = Arc::new(Headless::default());
    let capture: Arc<dyn CaptureControl> = headless.clone();
    let registry = DeviceRegistry::new();
    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_SIZE);

    let manager = if config.mqtt_enable {
        let options = config.broker_options(settings.mqtt.announce_topic.clone());
        connect_with_retry(&options, inbound_tx, &cancel).await.map(Arc::new)
    } else {
        info!("MQTT disabled for instance {}", settings.instance.id);
        None
    };

    let router = InboundRouter {
        registry: registry.clone(),
        capture: capture.clone(),
        announce_topic: settings.mqtt.announce_topic.clone(),
    };
    let inbound_loop = start_inbound_loop(inbound_rx, router, cancel.clone());
    let sweep_loop = start_sweep_loop(&registry, cancel.clone());
    let (_target, target_loop) = start_target_loop(&registry, config.clone(), cancel.clone());

    let controls = LedControls {
        bus: manager.clone().map(|manager| {
            let publisher: Arc<dyn Publisher> = manager;
            BusContext::new(publisher, config.mqtt_topic.clone())
        }),
        capture,
        serial: headless.clone(),
        confirm: headless,
    };
    if config.toggle_led {
        if let Err(e) = controls.turn_on_leds(&config) {
            warn!("Can't turn the LEDs on: {}", e);
        }
    }

    cancel.cancelled().await;
    info!("Shutting down");

    if config.toggle_led {
        if let Err(e) = controls.turn_off_leds(&config) {
            warn!("Can't turn the LEDs off: {}", e);
        }
    }
    if let Some(manager) = &manager {
        manager.shutdown();
    }
    join_loops(vec![
        ("inbound", inbound_loop),
        ("sweep", sweep_loop),
        ("target", target_loop),
    ])
    .await;

    Ok(())
}
