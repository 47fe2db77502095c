use palette::Srgb;
use serde::{Deserialize, Serialize};

pub const EFFECT_SOLID: &str = "Solid";

#[derive(Debug, thiserror::Error)]
#[error("failed to encode MQTT payload: {0}")]
pub struct SerializationError(#[from] serde_json::Error);

/// Encodes an outbound DTO as a JSON payload.
pub fn encode<T: Serialize>(dto: &T) -> Result<Vec<u8>, SerializationError> {
    Ok(serde_json::to_vec(dto)?)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PowerState {
    On,
    Off,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ColorDto {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl From<Srgb<u8>> for ColorDto {
    fn from(color: Srgb<u8>) -> Self {
        ColorDto {
            r: color.red,
            g: color.green,
            b: color.blue,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct StateDto {
    pub state: PowerState,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub effect: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub color: Option<ColorDto>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub brightness: Option<u8>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub whitetemp: Option<u8>,
}

impl StateDto {
    pub fn new(state: PowerState) -> Self {
        StateDto {
            state,
            effect: None,
            color: None,
            brightness: None,
            whitetemp: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Deserialize, Serialize)]
pub struct GammaDto {
    pub gamma: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct FirmwareConfigDto {
    #[serde(rename = "MAC", skip_serializing_if = "Option::is_none", default)]
    pub mac: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub gpio: Option<u8>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub baudrate: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub mqttopic: Option<String>,
}

/// What a Glow Worm device publishes about itself.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct AnnouncementDto {
    #[serde(rename = "deviceName")]
    pub device_name: String,

    #[serde(rename = "IP", default)]
    pub ip: String,

    #[serde(rename = "MAC", default)]
    pub mac: Option<String>,

    #[serde(rename = "ver", default)]
    pub version: Option<String>,

    #[serde(default)]
    pub board: Option<String>,

    #[serde(default)]
    pub gpio: Option<u8>,

    #[serde(default)]
    pub baudrate: Option<String>,

    #[serde(default)]
    pub mqttopic: Option<String>,

    #[serde(default)]
    pub lednum: Option<u32>,
}

pub fn decode_announcement(
    payload: &[u8],
) -> Result<AnnouncementDto, serde_path_to_error::Error<serde_json::Error>> {
    let de = &mut serde_json::Deserializer::from_slice(payload);
    serde_path_to_error::deserialize(de)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_dto_roundtrip() {
        let dto = StateDto {
            brightness: Some(128),
            ..StateDto::new(PowerState::On)
        };

        let payload = encode(&dto).unwrap();
        assert_eq!(
            String::from_utf8(payload.clone()).unwrap(),
            r#"{"state":"ON","brightness":128}"#
        );

        let decoded: StateDto = serde_json::from_slice(&payload).unwrap();
        assert_eq!(decoded, dto);
    }

    #[test]
    fn firmware_config_uses_uppercase_mac_and_skips_unset_fields() {
        let dto = FirmwareConfigDto {
            mac: Some("AA:BB".to_string()),
            baudrate: Some("3".to_string()),
            ..Default::default()
        };

        let json = String::from_utf8(encode(&dto).unwrap()).unwrap();
        assert_eq!(json, r#"{"MAC":"AA:BB","baudrate":"3"}"#);
    }

    #[test]
    fn color_dto_from_palette() {
        let color: ColorDto = Srgb::new(1u8, 2, 3).into();
        assert_eq!(color, ColorDto { r: 1, g: 2, b: 3 });
    }

    #[test]
    fn decodes_announcement() {
        let payload = br#"{"deviceName":"desk-led","IP":"192.168.1.52","MAC":"AA:BB","ver":"4.0.1","board":"ESP8266","gpio":2,"baudrate":"500000","mqttopic":"glowworm","lednum":120}"#;

        let announcement = decode_announcement(payload).unwrap();
        assert_eq!(announcement.device_name, "desk-led");
        assert_eq!(announcement.mac.as_deref(), Some("AA:BB"));
        assert_eq!(announcement.gpio, Some(2));
        assert_eq!(announcement.lednum, Some(120));
    }

    #[test]
    fn announcement_decode_error_names_the_field() {
        let err = decode_announcement(br#"{"deviceName":"x","gpio":"two"}"#).unwrap_err();
        assert_eq!(err.path().to_string(), "gpio");
    }
}
