use std::path::PathBuf;

use palette::Srgba;
use serde::{Deserialize, Serialize};

/// Serial port value meaning "pick whatever device shows up first".
pub const SERIAL_PORT_AUTO: &str = "AUTO";

#[derive(Clone, Deserialize, Debug)]
pub struct InstanceSettings {
    /// Which local instance this process is (1 drives the main monitor).
    pub id: u8,
    pub config_dir: PathBuf,
}

#[derive(Clone, Deserialize, Debug)]
pub struct MqttSettings {
    /// Topic devices publish their announcements to. Deployment specific.
    pub announce_topic: Option<String>,
}

#[derive(Clone, Deserialize, Debug)]
pub struct Settings {
    pub instance: InstanceSettings,
    pub mqtt: MqttSettings,
}

pub fn read_settings() -> Result<Settings, config::ConfigError> {
    config::Config::builder()
        .add_source(config::File::with_name("Settings"))
        .add_source(config::Environment::with_prefix("GLOWWORM").separator("__"))
        .build()?
        .try_deserialize::<Settings>()
}

/// Baud rates supported by the Glow Worm firmware, in firmware order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BaudRate {
    B230400,
    B460800,
    B500000,
    B921600,
    B1000000,
    B1500000,
    B2000000,
}

impl BaudRate {
    pub const ALL: [BaudRate; 7] = [
        BaudRate::B230400,
        BaudRate::B460800,
        BaudRate::B500000,
        BaudRate::B921600,
        BaudRate::B1000000,
        BaudRate::B1500000,
        BaudRate::B2000000,
    ];

    pub fn bits_per_second(self) -> u32 {
        match self {
            BaudRate::B230400 => 230_400,
            BaudRate::B460800 => 460_800,
            BaudRate::B500000 => 500_000,
            BaudRate::B921600 => 921_600,
            BaudRate::B1000000 => 1_000_000,
            BaudRate::B1500000 => 1_500_000,
            BaudRate::B2000000 => 2_000_000,
        }
    }

    pub fn parse(value: &str) -> Option<BaudRate> {
        let bps: u32 = value.trim().parse().ok()?;
        Self::ALL.into_iter().find(|rate| rate.bits_per_second() == bps)
    }

    /// Index the firmware expects: position in [`BaudRate::ALL`] plus one.
    pub fn firmware_index(self) -> u8 {
        Self::ALL
            .iter()
            .position(|rate| *rate == self)
            .map(|i| i as u8 + 1)
            .unwrap_or_default()
    }
}

/// Configuration of one local instance, as stored in its own config file.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LocalConfig {
    pub mqtt_server: String,
    pub mqtt_topic: String,
    pub mqtt_username: String,
    pub mqtt_pwd: String,
    pub mqtt_enable: bool,
    pub mqtt_stream: bool,
    pub serial_port: String,
    pub multi_monitor: u8,
    pub baud_rate: String,

    // Shared between every instance
    pub gamma: f64,
    pub white_temperature: u8,
    pub check_for_updates: bool,
    pub sync_check: bool,
    pub toggle_led: bool,
    pub color_chooser: String,

    // Specific to this instance
    pub screen_res_x: u32,
    pub screen_res_y: u32,
    pub monitor_number: u8,
    pub brightness: u8,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            mqtt_server: "tcp://192.168.1.3:1883".to_string(),
            mqtt_topic: "lights/glowwormluciferin".to_string(),
            mqtt_username: String::new(),
            mqtt_pwd: String::new(),
            mqtt_enable: false,
            mqtt_stream: false,
            serial_port: SERIAL_PORT_AUTO.to_string(),
            multi_monitor: 1,
            baud_rate: "500000".to_string(),
            gamma: 2.2,
            white_temperature: 1,
            check_for_updates: true,
            sync_check: true,
            toggle_led: true,
            color_chooser: "255,255,255,255".to_string(),
            screen_res_x: 1920,
            screen_res_y: 1080,
            monitor_number: 0,
            brightness: 255,
        }
    }
}

impl LocalConfig {
    /// Parses the "r,g,b,a" color chooser value.
    pub fn chosen_color(&self) -> Option<Srgba<u8>> {
        let mut parts = self.color_chooser.split(',').map(|c| c.trim().parse::<u8>());

        let red = parts.next()?.ok()?;
        let green = parts.next()?.ok()?;
        let blue = parts.next()?.ok()?;
        let alpha = match parts.next() {
            Some(alpha) => alpha.ok()?,
            None => u8::MAX,
        };

        Some(Srgba::new(red, green, blue, alpha))
    }

    /// Copies the fields every companion instance shares, leaving serial
    /// port, screen geometry and monitor index alone.
    pub fn copy_shared_from(&mut self, other: &LocalConfig) {
        self.gamma = other.gamma;
        self.white_temperature = other.white_temperature;
        self.check_for_updates = other.check_for_updates;
        self.sync_check = other.sync_check;
        self.toggle_led = other.toggle_led;
        self.color_chooser = other.color_chooser.clone();
        self.multi_monitor = other.multi_monitor;
    }

    pub fn broker_options(&self, announce_topic: Option<String>) -> BrokerOptions {
        BrokerOptions {
            server_uri: self.mqtt_server.clone(),
            username: self.mqtt_username.clone(),
            password: self.mqtt_pwd.clone(),
            topic: self.mqtt_topic.clone(),
            announce_topic,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokerOptions {
    pub server_uri: String,
    pub username: String,
    pub password: String,
    pub topic: String,
    pub announce_topic: Option<String>,
}

impl BrokerOptions {
    /// Every topic the connection manager keeps subscribed.
    pub fn subscriptions(&self) -> Vec<String> {
        let mut topics = vec![self.topic.clone()];
        topics.extend(self.announce_topic.clone());
        topics
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn baud_rate_firmware_index_is_one_based() {
        assert_eq!(BaudRate::B230400.firmware_index(), 1);
        assert_eq!(BaudRate::parse("500000"), Some(BaudRate::B500000));
        assert_eq!(BaudRate::B500000.firmware_index(), 3);
        assert_eq!(BaudRate::B2000000.firmware_index(), 7);
        assert_eq!(BaudRate::parse("115200"), None);
    }

    #[test]
    fn color_chooser_parses_with_and_without_alpha() {
        let mut config = LocalConfig {
            color_chooser: "10, 20,30,40".to_string(),
            ..Default::default()
        };
        assert_eq!(config.chosen_color(), Some(Srgba::new(10, 20, 30, 40)));

        config.color_chooser = "1,2,3".to_string();
        assert_eq!(config.chosen_color(), Some(Srgba::new(1, 2, 3, 255)));

        config.color_chooser = "red".to_string();
        assert_eq!(config.chosen_color(), None);
    }

    #[test]
    fn copy_shared_leaves_instance_fields() {
        let source = LocalConfig {
            gamma: 1.8,
            white_temperature: 4,
            toggle_led: false,
            multi_monitor: 3,
            serial_port: "COM3".to_string(),
            monitor_number: 0,
            ..Default::default()
        };
        let mut companion = LocalConfig {
            serial_port: "COM22".to_string(),
            monitor_number: 1,
            screen_res_x: 2560,
            ..Default::default()
        };

        companion.copy_shared_from(&source);

        assert_eq!(companion.gamma, 1.8);
        assert_eq!(companion.white_temperature, 4);
        assert!(!companion.toggle_led);
        assert_eq!(companion.multi_monitor, 3);
        assert_eq!(companion.serial_port, "COM22");
        assert_eq!(companion.monitor_number, 1);
        assert_eq!(companion.screen_res_x, 2560);
    }

    #[test]
    fn subscriptions_include_announce_topic() {
        let options = LocalConfig::default().broker_options(Some("glowworm/announce".into()));
        assert_eq!(
            options.subscriptions(),
            vec!["lights/glowwormluciferin".to_string(), "glowworm/announce".to_string()]
        );
    }
}
