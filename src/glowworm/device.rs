use derive_builder::Builder;
use tokio::time::Instant;

use crate::mqtt::dto::AnnouncementDto;

/// Registry name of the device attached over the wired channel.
pub const WIRED_DEVICE_NAME: &str = "USB";

#[derive(Builder, Clone, Debug, PartialEq, Eq)]
#[builder(setter(into, strip_option))]
pub struct Device {
    pub name: String,
    #[builder(default)]
    pub mac: Option<String>,
    #[builder(default)]
    pub ip: String,
    #[builder(default)]
    pub board: Option<String>,
    #[builder(default)]
    pub firmware_version: Option<String>,
    #[builder(default)]
    pub gpio: Option<u8>,
    #[builder(default)]
    pub baud_rate: Option<String>,
    #[builder(default)]
    pub mqtt_topic: Option<String>,
    #[builder(default)]
    pub number_of_leds_connected: Option<u32>,

    /// Refreshed by the registry on every upsert.
    #[builder(default = "Instant::now()")]
    pub last_seen: Instant,
}

impl Device {
    pub fn is_wired(&self) -> bool {
        self.name == WIRED_DEVICE_NAME
    }
}

impl From<AnnouncementDto> for Device {
    fn from(announcement: AnnouncementDto) -> Self {
        Device {
            name: announcement.device_name,
            mac: announcement.mac.filter(|mac| !mac.is_empty()),
            ip: announcement.ip,
            board: announcement.board,
            firmware_version: announcement.version,
            gpio: announcement.gpio,
            baud_rate: announcement.baudrate,
            mqtt_topic: announcement.mqttopic,
            number_of_leds_connected: announcement.lednum,
            last_seen: Instant::now(),
        }
    }
}
