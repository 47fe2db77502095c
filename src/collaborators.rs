//! Interfaces to everything living outside the coordinator: screen capture,
//! user prompts, process restarts, the wired serial channel and config files.

use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
};

use log::{debug, info, warn};
use palette::Srgb;

use crate::settings::LocalConfig;

pub trait CaptureControl: Send + Sync {
    fn start_capture(&self);
    fn stop_capture(&self);
    fn is_running(&self) -> bool;
}

/// Asks the user a yes/no question.
pub trait Confirm: Send + Sync {
    fn confirm(&self, prompt: &str) -> bool;
}

pub trait InstanceControl: Send + Sync {
    /// Restarts this instance so that a saved configuration takes effect.
    fn restart(&self);
}

/// Parameters pushed down the wired channel. Sending them reboots the
/// microcontroller.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SerialParams {
    pub baud_rate: Option<u8>,
    pub gpio: Option<u8>,
    pub brightness: Option<u8>,
    pub color: Option<Srgb<u8>>,
}

pub trait SerialLink: Send + Sync {
    fn send_params(&self, params: SerialParams);
}

/// Stand-in for a process running without a screen grabber, a UI or a
/// serial port attached. Requests are logged and otherwise dropped.
#[derive(Default)]
pub struct Headless {
    capturing: AtomicBool,
}

impl CaptureControl for Headless {
    fn start_capture(&self) {
        info!("Capture started");
        self.capturing.store(true, Ordering::SeqCst);
    }

    fn stop_capture(&self) {
        info!("Capture stopped");
        self.capturing.store(false, Ordering::SeqCst);
    }

    fn is_running(&self) -> bool {
        self.capturing.load(Ordering::SeqCst)
    }
}

impl Confirm for Headless {
    fn confirm(&self, prompt: &str) -> bool {
        warn!("Nobody to ask, declining: {}", prompt);
        false
    }
}

impl InstanceControl for Headless {
    fn restart(&self) {
        warn!("Restart requested, the new configuration applies on the next start");
    }
}

impl SerialLink for Headless {
    fn send_params(&self, params: SerialParams) {
        warn!("No serial port attached, dropping {:?}", params);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to access config file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config file {path:?}: {source}")]
    Json {
        path: PathBuf,
        source: serde_path_to_error::Error<serde_json::Error>,
    },

    #[error("failed to encode config: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Reads and writes the config of a local instance (1 to 3).
pub trait ConfigStore: Send + Sync {
    /// `Ok(None)` when that instance has no config yet.
    fn read(&self, instance: u8) -> Result<Option<LocalConfig>, StoreError>;
    fn persist(&self, config: &LocalConfig, instance: u8) -> Result<(), StoreError>;
}

/// One JSON file per instance inside a directory.
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        JsonFileStore { dir: dir.into() }
    }

    pub fn path_for(&self, instance: u8) -> PathBuf {
        self.dir.join(format!("instance-{}.json", instance))
    }
}

fn io_error(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

impl ConfigStore for JsonFileStore {
    fn read(&self, instance: u8) -> Result<Option<LocalConfig>, StoreError> {
        let path = self.path_for(instance);

        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(&path, e)),
        };

        let de = &mut serde_json::Deserializer::from_slice(&bytes);
        let config = serde_path_to_error::deserialize(de)
            .map_err(|source| StoreError::Json { path, source })?;

        Ok(Some(config))
    }

    fn persist(&self, config: &LocalConfig, instance: u8) -> Result<(), StoreError> {
        let path = self.path_for(instance);
        let json = serde_json::to_string_pretty(config)?;

        fs::create_dir_all(&self.dir).map_err(|e| io_error(&self.dir, e))?;
        fs::write(&path, json).map_err(|e| io_error(&path, e))?;
        debug!("Wrote config for instance {} to {:?}", instance, path);

        Ok(())
    }
}
