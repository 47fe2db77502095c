use std::sync::Arc;

use log::{debug, error, info, warn};

use crate::{
    collaborators::{
        ConfigStore, Confirm, InstanceControl, SerialLink, SerialParams, StoreError,
    },
    mqtt::{
        bus::{BusContext, TOPIC_FIRMWARE_CONFIG},
        dto::FirmwareConfigDto,
    },
    settings::{BaudRate, LocalConfig, SERIAL_PORT_AUTO},
};

use super::registry::{DeviceRegistry, RegistrySnapshot};

pub const BAUD_RATE_PROMPT: &str =
    "Changing the baud rate reprograms the device and restarts the instance. Continue?";

/// Highest number of local instances, one per monitor.
pub const MAX_INSTANCES: u8 = 3;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConfigChanges {
    pub baud_rate_changed: bool,
    pub topic_changed: bool,
}

impl ConfigChanges {
    pub fn any(&self) -> bool {
        self.baud_rate_changed || self.topic_changed
    }
}

/// Compares a requested config against the persisted one. A topic change
/// only matters when the requested config talks over MQTT.
pub fn detect_changes(requested: &LocalConfig, persisted: &LocalConfig) -> ConfigChanges {
    ConfigChanges {
        baud_rate_changed: requested.baud_rate != persisted.baud_rate,
        topic_changed: requested.mqtt_topic != persisted.mqtt_topic && requested.mqtt_enable,
    }
}

#[derive(Debug, thiserror::Error)]
#[error("no registered device matches serial port {0:?}")]
pub struct UnresolvedTarget(pub String);

/// Finds the MAC of the device `serial_port` refers to. `AUTO` means the
/// first registered device; an exact name or IP match wins over that.
pub fn resolve_target_mac(
    registry: &RegistrySnapshot,
    serial_port: &str,
) -> Result<String, UnresolvedTarget> {
    let mut mac = None;

    if serial_port == SERIAL_PORT_AUTO {
        mac = registry.first().and_then(|device| device.mac.clone());
    }

    for device in registry.devices() {
        if device.name == serial_port || device.ip == serial_port {
            mac = device.mac.clone();
        }
    }

    mac.filter(|mac| !mac.is_empty())
        .ok_or_else(|| UnresolvedTarget(serial_port.to_string()))
}

/// Local instances, other than `instance`, that share settings with it.
pub fn companion_instances(instance: u8, multi_monitor: u8) -> Vec<u8> {
    let mut companions = vec![];

    if instance != 1 {
        companions.push(1);
    }
    for other in 2..=multi_monitor.min(MAX_INSTANCES) {
        if other != instance {
            companions.push(other);
        }
    }

    companions
}

#[derive(Debug, thiserror::Error)]
pub enum ReconfigureError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("unsupported baud rate {0:?}")]
    UnknownBaudRate(String),
}

#[derive(Clone, Debug, PartialEq)]
pub enum SaveOutcome {
    /// No config existed before, nothing to compare against.
    FirstSave,
    /// Nothing device related changed; the instance was restarted.
    Unchanged,
    /// New parameters were sent to the device and the instance restarted.
    Reprogrammed,
    /// The topic changed while MQTT was off, there is no device to tell.
    NothingToProgram,
    /// The user refused the baud rate change. `reverted` is what is now
    /// persisted.
    Cancelled { reverted: LocalConfig },
}

pub struct FirmwareCoordinator {
    pub instance: u8,
    pub registry: DeviceRegistry,
    pub bus: Option<BusContext>,
    pub store: Arc<dyn ConfigStore>,
    pub confirm: Arc<dyn Confirm>,
    pub instance_control: Arc<dyn InstanceControl>,
    pub serial: Arc<dyn SerialLink>,
}

impl FirmwareCoordinator {
    /// Persists `requested` for this instance, shares the common settings
    /// with the companion instances and reprograms the device if the baud
    /// rate or topic changed.
    pub async fn save(&self, requested: LocalConfig) -> Result<SaveOutcome, ReconfigureError> {
        if BaudRate::parse(&requested.baud_rate).is_none() {
            return Err(ReconfigureError::UnknownBaudRate(requested.baud_rate));
        }

        let persisted = self.store.read(self.instance)?;

        self.store.persist(&requested, self.instance)?;
        self.propagate_shared(&requested)?;

        let Some(persisted) = persisted else {
            info!("First configuration saved for instance {}", self.instance);
            return Ok(SaveOutcome::FirstSave);
        };

        let changes = detect_changes(&requested, &persisted);
        if !changes.any() {
            self.instance_control.restart();
            return Ok(SaveOutcome::Unchanged);
        }

        self.program_firmware(requested, &persisted, changes).await
    }

    async fn program_firmware(
        &self,
        requested: LocalConfig,
        persisted: &LocalConfig,
        changes: ConfigChanges,
    ) -> Result<SaveOutcome, ReconfigureError> {
        let bus_mode = persisted.mqtt_enable;
        let mut dto = FirmwareConfigDto::default();

        if bus_mode {
            let snapshot = self.registry.snapshot().await;

            match resolve_target_mac(&snapshot, &requested.serial_port) {
                Ok(mac) => dto.mac = Some(mac),
                Err(e) => {
                    // Sent anyway with an empty MAC
                    error!("No device can be programmed: {}", e);
                    dto.mac = Some(String::new());
                }
            }
        }

        if changes.baud_rate_changed {
            let rate = BaudRate::parse(&requested.baud_rate)
                .ok_or_else(|| ReconfigureError::UnknownBaudRate(requested.baud_rate.clone()))?;

            if !self.confirm.confirm(BAUD_RATE_PROMPT) {
                let mut reverted = requested;
                reverted.baud_rate = persisted.baud_rate.clone();
                self.store.persist(&reverted, self.instance)?;

                info!("Baud rate change cancelled, keeping {}", reverted.baud_rate);
                return Ok(SaveOutcome::Cancelled { reverted });
            }

            if bus_mode {
                dto.baudrate = Some(rate.firmware_index().to_string());
                if changes.topic_changed {
                    dto.mqttopic = Some(requested.mqtt_topic.clone());
                }
                self.publish_firmware_config(&dto);
            } else {
                self.serial.send_params(SerialParams {
                    baud_rate: Some(rate.firmware_index()),
                    ..Default::default()
                });
            }

            self.instance_control.restart();
            Ok(SaveOutcome::Reprogrammed)
        } else if changes.topic_changed && bus_mode {
            dto.mqttopic = Some(requested.mqtt_topic.clone());
            self.publish_firmware_config(&dto);

            self.instance_control.restart();
            Ok(SaveOutcome::Reprogrammed)
        } else {
            Ok(SaveOutcome::NothingToProgram)
        }
    }

    fn publish_firmware_config(&self, dto: &FirmwareConfigDto) {
        match &self.bus {
            Some(bus) => {
                if let Err(e) = bus.publish_dto(TOPIC_FIRMWARE_CONFIG, dto) {
                    debug!("Firmware config not published: {}", e);
                }
            }
            None => warn!("MQTT is not connected, firmware config not sent"),
        }
    }

    /// Copies the shared settings into every companion instance that already
    /// has a config. Instances without one are left for their first start.
    pub fn propagate_shared(&self, config: &LocalConfig) -> Result<(), StoreError> {
        for companion in companion_instances(self.instance, config.multi_monitor) {
            match self.store.read(companion)? {
                Some(mut other) => {
                    other.copy_shared_from(config);
                    self.store.persist(&other, companion)?;
                    debug!("Shared settings copied to instance {}", companion);
                }
                None => debug!("Instance {} has no config yet, skipping", companion),
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::{
        collaborators::fakes::{FakeConfirm, FakeInstance, FakeSerial, MemoryStore},
        glowworm::device::DeviceBuilder,
        mqtt::connection::fakes::RecordingPublisher,
    };

    const BASE: &str = "lights/glowwormluciferin";

    struct Harness {
        coordinator: FirmwareCoordinator,
        publisher: Arc<RecordingPublisher>,
        store: Arc<MemoryStore>,
        confirm: Arc<FakeConfirm>,
        instance: Arc<FakeInstance>,
        serial: Arc<FakeSerial>,
    }

    fn harness(instance_id: u8, answer: bool, configs: Vec<(u8, LocalConfig)>) -> Harness {
        let publisher = Arc::new(RecordingPublisher::default());
        let store = Arc::new(MemoryStore::with(configs));
        let confirm = Arc::new(FakeConfirm::answering(answer));
        let instance = Arc::new(FakeInstance::default());
        let serial = Arc::new(FakeSerial::default());

        let coordinator = FirmwareCoordinator {
            instance: instance_id,
            registry: DeviceRegistry::new(),
            bus: Some(BusContext::new(publisher.clone(), BASE)),
            store: store.clone(),
            confirm: confirm.clone(),
            instance_control: instance.clone(),
            serial: serial.clone(),
        };

        Harness {
            coordinator,
            publisher,
            store,
            confirm,
            instance,
            serial,
        }
    }

    fn bus_config() -> LocalConfig {
        LocalConfig {
            mqtt_enable: true,
            baud_rate: "500000".to_string(),
            ..Default::default()
        }
    }

    async fn register(registry: &DeviceRegistry, name: &str, ip: &str, mac: &str) {
        registry
            .upsert(
                DeviceBuilder::default()
                    .name(name)
                    .ip(ip)
                    .mac(mac)
                    .build()
                    .unwrap(),
            )
            .await;
    }

    #[test]
    fn topic_change_needs_mqtt() {
        let persisted = bus_config();
        let requested = LocalConfig {
            mqtt_topic: "other".to_string(),
            ..bus_config()
        };
        assert!(detect_changes(&requested, &persisted).topic_changed);

        let requested = LocalConfig {
            mqtt_enable: false,
            ..requested
        };
        assert_eq!(detect_changes(&requested, &persisted), ConfigChanges::default());
    }

    #[test]
    fn companions_per_instance() {
        assert_eq!(companion_instances(1, 1), Vec::<u8>::new());
        assert_eq!(companion_instances(1, 3), vec![2, 3]);
        assert_eq!(companion_instances(2, 2), vec![1]);
        assert_eq!(companion_instances(2, 3), vec![1, 3]);
        assert_eq!(companion_instances(3, 3), vec![1, 2]);
        assert_eq!(companion_instances(2, 1), vec![1]);
    }

    #[tokio::test]
    async fn resolves_mac_by_auto_name_or_ip() {
        let registry = DeviceRegistry::new();
        register(&registry, "first", "192.168.1.10", "AA:AA").await;
        register(&registry, "desk-led", "192.168.1.52", "BB:BB").await;
        let snapshot = registry.snapshot().await;

        assert_eq!(resolve_target_mac(&snapshot, "AUTO").unwrap(), "AA:AA");
        assert_eq!(resolve_target_mac(&snapshot, "desk-led").unwrap(), "BB:BB");
        assert_eq!(resolve_target_mac(&snapshot, "192.168.1.52").unwrap(), "BB:BB");
        assert!(resolve_target_mac(&snapshot, "COM4").is_err());
        assert!(resolve_target_mac(&RegistrySnapshot::default(), "AUTO").is_err());
    }

    #[tokio::test]
    async fn cancelled_baud_change_reverts_and_publishes_nothing() {
        let h = harness(1, false, vec![(1, bus_config())]);
        register(&h.coordinator.registry, "desk-led", "192.168.1.52", "AA:BB").await;

        let requested = LocalConfig {
            baud_rate: "921600".to_string(),
            ..bus_config()
        };
        let outcome = h.coordinator.save(requested).await.unwrap();

        let SaveOutcome::Cancelled { reverted } = outcome else {
            panic!("expected a cancelled save");
        };
        assert_eq!(reverted.baud_rate, "500000");
        assert_eq!(h.store.get(1).unwrap().baud_rate, "500000");
        assert!(h.publisher.topics().is_empty());
        assert_eq!(h.instance.restarts.load(Ordering::SeqCst), 0);
        assert_eq!(h.confirm.prompts.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn confirmed_baud_change_publishes_index_and_topic() {
        let h = harness(1, true, vec![(1, bus_config())]);
        register(&h.coordinator.registry, "desk-led", "192.168.1.52", "AA:BB").await;

        let requested = LocalConfig {
            baud_rate: "921600".to_string(),
            mqtt_topic: "lights/kitchen".to_string(),
            ..bus_config()
        };
        let outcome = h.coordinator.save(requested).await.unwrap();

        assert_eq!(outcome, SaveOutcome::Reprogrammed);
        assert_eq!(h.publisher.topics(), vec!["lights/glowwormluciferin/firmware/config"]);
        assert_eq!(
            h.publisher.payloads_as_json(),
            vec![serde_json::json!({
                "MAC": "AA:BB",
                "baudrate": "4",
                "mqttopic": "lights/kitchen"
            })]
        );
        assert_eq!(h.store.get(1).unwrap().baud_rate, "921600");
        assert_eq!(h.instance.restarts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn topic_only_change_needs_no_confirmation() {
        let h = harness(1, false, vec![(1, bus_config())]);
        register(&h.coordinator.registry, "desk-led", "192.168.1.52", "AA:BB").await;

        let requested = LocalConfig {
            mqtt_topic: "lights/kitchen".to_string(),
            ..bus_config()
        };
        let outcome = h.coordinator.save(requested).await.unwrap();

        assert_eq!(outcome, SaveOutcome::Reprogrammed);
        assert!(h.confirm.prompts.lock().unwrap().is_empty());
        assert_eq!(
            h.publisher.payloads_as_json(),
            vec![serde_json::json!({ "MAC": "AA:BB", "mqttopic": "lights/kitchen" })]
        );
        assert_eq!(h.instance.restarts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unresolved_target_still_publishes_with_empty_mac() {
        let h = harness(1, true, vec![(1, bus_config())]);

        let requested = LocalConfig {
            baud_rate: "230400".to_string(),
            ..bus_config()
        };
        h.coordinator.save(requested).await.unwrap();

        assert_eq!(
            h.publisher.payloads_as_json(),
            vec![serde_json::json!({ "MAC": "", "baudrate": "1" })]
        );
    }

    #[tokio::test]
    async fn wired_baud_change_goes_down_the_serial_link() {
        let persisted = LocalConfig {
            mqtt_enable: false,
            ..bus_config()
        };
        let h = harness(1, true, vec![(1, persisted.clone())]);

        let requested = LocalConfig {
            baud_rate: "1000000".to_string(),
            ..persisted
        };
        let outcome = h.coordinator.save(requested).await.unwrap();

        assert_eq!(outcome, SaveOutcome::Reprogrammed);
        assert!(h.publisher.topics().is_empty());
        assert_eq!(
            *h.serial.sent.lock().unwrap(),
            vec![SerialParams {
                baud_rate: Some(5),
                ..Default::default()
            }]
        );
    }

    #[tokio::test]
    async fn unknown_baud_rate_is_rejected_before_asking() {
        let h = harness(1, true, vec![(1, bus_config())]);

        let requested = LocalConfig {
            baud_rate: "9600".to_string(),
            ..bus_config()
        };
        let result = h.coordinator.save(requested).await;

        assert!(matches!(result, Err(ReconfigureError::UnknownBaudRate(_))));
        assert!(h.confirm.prompts.lock().unwrap().is_empty());
        assert_eq!(h.store.get(1).unwrap().baud_rate, "500000");
        assert!(h.store.writes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn retrying_a_rejected_baud_rate_is_still_rejected() {
        let h = harness(1, true, vec![(1, bus_config())]);
        let requested = LocalConfig {
            baud_rate: "9600".to_string(),
            ..bus_config()
        };

        assert!(h.coordinator.save(requested.clone()).await.is_err());
        let result = h.coordinator.save(requested).await;

        assert!(matches!(result, Err(ReconfigureError::UnknownBaudRate(_))));
        assert_eq!(h.instance.restarts.load(Ordering::SeqCst), 0);
        assert_eq!(h.store.get(1).unwrap().baud_rate, "500000");
    }

    #[tokio::test]
    async fn unchanged_save_restarts_and_first_save_does_not() {
        let h = harness(1, true, vec![(1, bus_config())]);
        assert_eq!(h.coordinator.save(bus_config()).await.unwrap(), SaveOutcome::Unchanged);
        assert_eq!(h.instance.restarts.load(Ordering::SeqCst), 1);

        let h = harness(1, true, vec![]);
        assert_eq!(h.coordinator.save(bus_config()).await.unwrap(), SaveOutcome::FirstSave);
        assert_eq!(h.instance.restarts.load(Ordering::SeqCst), 0);
        assert_eq!(h.store.get(1), Some(bus_config()));
    }

    #[tokio::test]
    async fn shared_settings_reach_existing_companions_only() {
        let companion = LocalConfig {
            serial_port: "COM22".to_string(),
            monitor_number: 1,
            screen_res_x: 2560,
            ..Default::default()
        };
        let h = harness(1, true, vec![(1, bus_config()), (2, companion)]);

        let requested = LocalConfig {
            multi_monitor: 3,
            gamma: 1.8,
            white_temperature: 5,
            check_for_updates: false,
            sync_check: false,
            toggle_led: false,
            color_chooser: "255,0,0,255".to_string(),
            ..bus_config()
        };
        h.coordinator.save(requested).await.unwrap();

        let second = h.store.get(2).unwrap();
        assert_eq!(second.gamma, 1.8);
        assert_eq!(second.white_temperature, 5);
        assert!(!second.check_for_updates);
        assert!(!second.sync_check);
        assert!(!second.toggle_led);
        assert_eq!(second.color_chooser, "255,0,0,255");
        assert_eq!(second.multi_monitor, 3);
        assert_eq!(second.serial_port, "COM22");
        assert_eq!(second.monitor_number, 1);
        assert_eq!(second.screen_res_x, 2560);

        assert!(h.store.get(3).is_none());
    }

    #[tokio::test]
    async fn secondary_instance_updates_the_main_one() {
        let main = LocalConfig {
            serial_port: "COM3".to_string(),
            ..bus_config()
        };
        let h = harness(2, true, vec![(1, main), (2, bus_config())]);

        let requested = LocalConfig {
            multi_monitor: 2,
            gamma: 4.0,
            ..bus_config()
        };
        h.coordinator.save(requested).await.unwrap();

        let main = h.store.get(1).unwrap();
        assert_eq!(main.gamma, 4.0);
        assert_eq!(main.multi_monitor, 2);
        assert_eq!(main.serial_port, "COM3");
    }
}
