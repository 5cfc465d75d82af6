//! Hardware lane ownership.
//!
//! Each GPU-bound worker claims its device at initialize time and holds a
//! `DeviceLease` until shutdown. A second claim on the same device fails
//! unless sharing was enabled, which keeps the LLM and image lanes from
//! contending for one card.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::config::{ConfigStore, GlobalSettings, MonitoringSettings};
use crate::error::WorkerError;
use crate::telemetry::{DeviceTelemetry, EstimatedTelemetry, create_telemetry};

/// Where a worker runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    Cpu,
    Gpu(u32),
}

impl Device {
    /// Map a configured device id. Negative ids mean CPU.
    pub fn from_id(id: i64) -> Self {
        u32::try_from(id).map(Device::Gpu).unwrap_or(Device::Cpu)
    }

    pub fn is_gpu(&self) -> bool {
        matches!(self, Device::Gpu(_))
    }

    pub fn id(&self) -> i64 {
        match self {
            Device::Cpu => -1,
            Device::Gpu(index) => i64::from(*index),
        }
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Gpu(index) => write!(f, "gpu:{index}"),
        }
    }
}

#[derive(Debug, Default)]
struct Claims {
    owners: HashMap<u32, Vec<String>>,
}

/// Tracks which worker owns which GPU.
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    claims: Arc<Mutex<Claims>>,
    allow_shared: bool,
}

impl DeviceRegistry {
    pub fn new(allow_shared: bool) -> Self {
        Self {
            claims: Arc::default(),
            allow_shared,
        }
    }

    /// Claim `device` for `owner`. CPU claims always succeed and are not
    /// tracked.
    pub fn claim(&self, device: Device, owner: &str) -> Result<DeviceLease, WorkerError> {
        let Device::Gpu(index) = device else {
            return Ok(DeviceLease {
                device,
                owner: owner.to_string(),
                claims: None,
            });
        };

        let mut claims = self.claims.lock().unwrap_or_else(PoisonError::into_inner);
        let owners = claims.owners.entry(index).or_default();
        if let Some(existing) = owners.first()
            && !self.allow_shared
        {
            return Err(WorkerError::DeviceBusy {
                device_id: i64::from(index),
                owner: existing.clone(),
            });
        }
        owners.push(owner.to_string());
        tracing::debug!(device = %device, owner, "Device claimed");

        Ok(DeviceLease {
            device,
            owner: owner.to_string(),
            claims: Some(Arc::clone(&self.claims)),
        })
    }

    /// Current owners of a GPU.
    pub fn owners(&self, index: u32) -> Vec<String> {
        self.claims
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .owners
            .get(&index)
            .cloned()
            .unwrap_or_default()
    }
}

/// Exclusive (or shared, if allowed) hold on a device. Released on drop.
#[derive(Debug)]
pub struct DeviceLease {
    device: Device,
    owner: String,
    claims: Option<Arc<Mutex<Claims>>>,
}

impl DeviceLease {
    pub fn device(&self) -> Device {
        self.device
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        let (Some(claims), Device::Gpu(index)) = (self.claims.take(), self.device) else {
            return;
        };
        let mut claims = claims.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(owners) = claims.owners.get_mut(&index) {
            if let Some(pos) = owners.iter().position(|o| *o == self.owner) {
                owners.remove(pos);
            }
            if owners.is_empty() {
                claims.owners.remove(&index);
            }
        }
        tracing::debug!(device = %self.device, owner = %self.owner, "Device released");
    }
}

/// Process-wide hardware handles shared by every worker.
#[derive(Clone)]
pub struct Hardware {
    pub devices: DeviceRegistry,
    pub telemetry: Arc<dyn DeviceTelemetry>,
}

impl Hardware {
    pub fn new(devices: DeviceRegistry, telemetry: Arc<dyn DeviceTelemetry>) -> Self {
        Self { devices, telemetry }
    }

    /// Build from `global.allow_shared_gpu` and `monitoring.telemetry`.
    pub fn from_config(config: &ConfigStore) -> Self {
        let global = GlobalSettings::from_store(config);
        let monitoring = MonitoringSettings::from_store(config);
        let telemetry = if monitoring.collect_gpu {
            create_telemetry(monitoring.telemetry)
        } else {
            Arc::new(EstimatedTelemetry::new())
        };
        Self::new(DeviceRegistry::new(global.allow_shared_gpu), telemetry)
    }
}

impl Default for Hardware {
    fn default() -> Self {
        Self::new(DeviceRegistry::default(), Arc::new(EstimatedTelemetry::new()))
    }
}

impl std::fmt::Debug for Hardware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hardware")
            .field("devices", &self.devices)
            .field("telemetry", &self.telemetry.source())
            .finish()
    }
}
