use std::sync::Arc;

use log::{debug, info};

use crate::{
    collaborators::{CaptureControl, Confirm, SerialLink, SerialParams},
    mqtt::{
        bus::{BusContext, TOPIC_FIRMWARE_CONFIG, TOPIC_GAMMA, TOPIC_SET},
        connection::PublishError,
        dto::{FirmwareConfigDto, GammaDto, PowerState, StateDto, EFFECT_SOLID},
    },
    settings::LocalConfig,
};

use super::device::Device;

/// Pins the firmware can drive the LED strip from.
pub const SUPPORTED_GPIOS: [u8; 3] = [2, 5, 16];

pub const GPIO_PROMPT: &str = "Changing the GPIO reboots the device. Continue?";

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("GPIO {0} is not supported, use one of 2, 5 or 16")]
    UnsupportedGpio(u8),

    #[error(transparent)]
    Publish(#[from] PublishError),
}

/// Settings the user tweaks while the lights are running. With a bus they
/// go to the device over MQTT, without one down the wired channel.
pub struct LedControls {
    pub bus: Option<BusContext>,
    pub capture: Arc<dyn CaptureControl>,
    pub serial: Arc<dyn SerialLink>,
    pub confirm: Arc<dyn Confirm>,
}

impl LedControls {
    /// A running capture drives its own effect, so a static one is only
    /// forced while it is idle.
    fn idle_effect(&self) -> Option<String> {
        (!self.capture.is_running()).then(|| EFFECT_SOLID.to_string())
    }

    pub fn set_gamma(&self, gamma: f64) -> Result<(), PublishError> {
        match &self.bus {
            Some(bus) => bus.publish_dto(TOPIC_GAMMA, &GammaDto { gamma }),
            None => Ok(()),
        }
    }

    pub fn set_white_temperature(&self, white_temperature: u8) -> Result<(), PublishError> {
        let Some(bus) = &self.bus else {
            return Ok(());
        };

        let dto = StateDto {
            effect: self.idle_effect(),
            whitetemp: Some(white_temperature),
            ..StateDto::new(PowerState::On)
        };
        bus.publish_dto(TOPIC_SET, &dto)
    }

    pub fn turn_on_leds(&self, config: &LocalConfig) -> Result<(), PublishError> {
        let color = config.chosen_color().map(|rgba| rgba.color);

        match &self.bus {
            Some(bus) => {
                let dto = StateDto {
                    effect: self.idle_effect(),
                    color: color.map(Into::into),
                    brightness: Some(config.brightness),
                    whitetemp: Some(config.white_temperature),
                    ..StateDto::new(PowerState::On)
                };
                bus.publish_dto(TOPIC_SET, &dto)
            }
            None => {
                self.serial.send_params(SerialParams {
                    brightness: Some(config.brightness),
                    color,
                    ..Default::default()
                });
                Ok(())
            }
        }
    }

    pub fn turn_off_leds(&self, config: &LocalConfig) -> Result<(), PublishError> {
        match &self.bus {
            Some(bus) => {
                let dto = StateDto {
                    effect: Some(EFFECT_SOLID.to_string()),
                    brightness: Some(config.brightness),
                    whitetemp: Some(config.white_temperature),
                    ..StateDto::new(PowerState::Off)
                };
                bus.publish_dto(TOPIC_SET, &dto)
            }
            None => {
                self.serial.send_params(SerialParams {
                    brightness: Some(0),
                    ..Default::default()
                });
                Ok(())
            }
        }
    }

    /// Moves the LED strip to another pin. Returns `Ok(false)` if the user
    /// declined.
    pub fn change_gpio(&self, device: &Device, gpio: u8) -> Result<bool, ControlError> {
        if !SUPPORTED_GPIOS.contains(&gpio) {
            return Err(ControlError::UnsupportedGpio(gpio));
        }

        if !self.confirm.confirm(GPIO_PROMPT) {
            debug!("GPIO change on {} declined", device.name);
            return Ok(false);
        }

        self.capture.stop_capture();
        info!("Moving {} to GPIO {}", device.name, gpio);

        match &self.bus {
            Some(bus) => {
                let dto = FirmwareConfigDto {
                    mac: Some(device.mac.clone().unwrap_or_default()),
                    gpio: Some(gpio),
                    ..Default::default()
                };
                bus.publish_dto(TOPIC_FIRMWARE_CONFIG, &dto)?;
            }
            None => self.serial.send_params(SerialParams {
                gpio: Some(gpio),
                ..Default::default()
            }),
        }

        Ok(true)
    }
}
