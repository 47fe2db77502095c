use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::Duration,
};

use log::{debug, info};
use tokio::{
    sync::{watch, RwLock},
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;

use super::device::Device;

pub const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// A device whose last announcement is older than this is evicted...
pub const STALE_AFTER: Duration = Duration::from_secs(20);

/// ...but only while it is younger than this. Devices silent for longer are
/// kept.
pub const STALE_UNTIL: Duration = Duration::from_secs(60);

/// Returns whether a sweep at `now` evicts a device last seen at `last_seen`.
pub fn is_stale(last_seen: Instant, now: Instant) -> bool {
    let age = now.saturating_duration_since(last_seen);
    age > STALE_AFTER && age < STALE_UNTIL
}

/// Devices keyed by insertion sequence, plus name and MAC indices into it.
#[derive(Debug, Default)]
struct Entries {
    next_seq: u64,
    devices: BTreeMap<u64, Device>,
    by_name: HashMap<String, u64>,
    by_mac: HashMap<String, Vec<u64>>,
}

impl Entries {
    fn index_mac(&mut self, mac: &str, seq: u64) {
        let seqs = self.by_mac.entry(mac.to_string()).or_default();
        if !seqs.contains(&seq) {
            seqs.push(seq);
        }
    }

    fn unindex_mac(&mut self, mac: &str, seq: u64) {
        if let Some(seqs) = self.by_mac.get_mut(mac) {
            seqs.retain(|s| *s != seq);
            if seqs.is_empty() {
                self.by_mac.remove(mac);
            }
        }
    }

    /// Returns true when the device was not known before.
    fn upsert(&mut self, device: Device) -> bool {
        match self.by_name.get(&device.name).copied() {
            Some(seq) => {
                let previous_mac = self.devices.get(&seq).and_then(|d| d.mac.clone());

                if previous_mac != device.mac {
                    if let Some(mac) = previous_mac {
                        self.unindex_mac(&mac, seq);
                    }
                    if let Some(mac) = &device.mac {
                        self.index_mac(mac, seq);
                    }
                }

                self.devices.insert(seq, device);
                false
            }
            None => {
                let seq = self.next_seq;
                self.next_seq += 1;

                self.by_name.insert(device.name.clone(), seq);
                if let Some(mac) = &device.mac {
                    self.index_mac(mac, seq);
                }
                self.devices.insert(seq, device);
                true
            }
        }
    }

    fn remove(&mut self, seq: u64) -> Option<Device> {
        let device = self.devices.remove(&seq)?;

        self.by_name.remove(&device.name);
        if let Some(mac) = &device.mac {
            self.unindex_mac(mac, seq);
        }

        Some(device)
    }

    fn snapshot(&self) -> RegistrySnapshot {
        let devices: Vec<Device> = self.devices.values().cloned().collect();

        let mut by_name = HashMap::with_capacity(devices.len());
        let mut by_mac: HashMap<String, Vec<usize>> = HashMap::new();
        for (position, device) in devices.iter().enumerate() {
            by_name.insert(device.name.clone(), position);
            if let Some(mac) = &device.mac {
                by_mac.entry(mac.clone()).or_default().push(position);
            }
        }

        RegistrySnapshot {
            devices,
            by_name,
            by_mac,
        }
    }
}

/// Immutable view of the registry, in the order devices first appeared.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RegistrySnapshot {
    devices: Vec<Device>,
    by_name: HashMap<String, usize>,
    by_mac: HashMap<String, Vec<usize>>,
}

impl RegistrySnapshot {
    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn first(&self) -> Option<&Device> {
        self.devices.first()
    }

    pub fn by_name(&self, name: &str) -> Option<&Device> {
        self.by_name.get(name).map(|i| &self.devices[*i])
    }

    pub fn by_mac<'a>(&'a self, mac: &str) -> impl Iterator<Item = &'a Device> + 'a {
        self.by_mac
            .get(mac)
            .into_iter()
            .flatten()
            .map(move |i| &self.devices[*i])
    }
}

/// Presence registry of Glow Worm devices, shared between the inbound
/// message task and the sweep task.
#[derive(Clone)]
pub struct DeviceRegistry {
    entries: Arc<RwLock<Entries>>,
    changes: Arc<watch::Sender<RegistrySnapshot>>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRegistry {
    pub fn new() -> Self {
        let (changes, _) = watch::channel(RegistrySnapshot::default());

        DeviceRegistry {
            entries: Default::default(),
            changes: Arc::new(changes),
        }
    }

    pub async fn upsert(&self, device: Device) {
        self.upsert_at(device, Instant::now()).await
    }

    pub async fn upsert_at(&self, mut device: Device, now: Instant) {
        device.last_seen = now;

        let mut entries = self.entries.write().await;
        let name = device.name.clone();
        if entries.upsert(device) {
            info!("Device {} announced itself", name);
        }

        self.changes.send_replace(entries.snapshot());
    }

    pub async fn snapshot(&self) -> RegistrySnapshot {
        self.entries.read().await.snapshot()
    }

    /// Receiver that sees a fresh snapshot after every change.
    pub fn subscribe(&self) -> watch::Receiver<RegistrySnapshot> {
        self.changes.subscribe()
    }

    pub async fn sweep(&self) -> Vec<Device> {
        self.sweep_at(Instant::now()).await
    }

    /// Evicts every device [`is_stale`] at `now`, returning the evicted ones.
    pub async fn sweep_at(&self, now: Instant) -> Vec<Device> {
        let mut entries = self.entries.write().await;

        let stale: Vec<u64> = entries
            .devices
            .iter()
            .filter(|(_, device)| is_stale(device.last_seen, now))
            .map(|(seq, _)| *seq)
            .collect();

        if stale.is_empty() {
            return vec![];
        }

        let removed: Vec<Device> = stale
            .into_iter()
            .filter_map(|seq| entries.remove(seq))
            .collect();

        for device in &removed {
            info!("Device {} went silent, removing it", device.name);
        }

        self.changes.send_replace(entries.snapshot());

        removed
    }
}

pub fn start_sweep_loop(registry: &DeviceRegistry, cancel: CancellationToken) -> JoinHandle<()> {
    let registry = registry.clone();

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            registry.sweep().await;
        }

        debug!("Presence sweep stopped");
    })
}
