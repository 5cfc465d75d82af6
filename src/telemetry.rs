//! Device utilization and memory sampling.
//!
//! `NvidiaSmiTelemetry` shells out to `nvidia-smi` and caches the answer for a
//! short window. `EstimatedTelemetry` derives a busy fraction from the work the
//! lanes report plus the memory footprint of loaded models; it is also the
//! fallback whenever a real query fails or the device is the CPU.

use std::collections::HashMap;
use std::process::Command;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::config::settings::TelemetrySource;
use crate::device::Device;

/// Weight given to the newest busy-fraction observation.
const EWMA_ALPHA: f64 = 0.3;
/// Idle time after which the estimate has halved.
const IDLE_HALF_LIFE: Duration = Duration::from_secs(5);
const SMI_CACHE_TTL: Duration = Duration::from_millis(500);

/// One reading for one device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceSample {
    /// Busy fraction in `[0.0, 1.0]`.
    pub utilization: f64,
    pub memory_used_mb: u64,
    pub memory_total_mb: Option<u64>,
}

/// Source of per-device utilization readings.
pub trait DeviceTelemetry: Send + Sync {
    /// Short name used in logs.
    fn source(&self) -> &'static str;

    fn sample(&self, device: Device) -> DeviceSample;

    /// A lane finished a unit of work that kept `device` busy for `busy`.
    fn record_activity(&self, _device: Device, _busy: Duration) {}

    /// Memory held by the model resident on `device` (0 once unloaded).
    fn record_memory(&self, _device: Device, _memory_mb: u64) {}
}

#[derive(Debug, Clone, Copy)]
struct Estimate {
    busy_ewma: f64,
    memory_mb: u64,
    last_activity: Instant,
}

impl Estimate {
    fn new() -> Self {
        Self {
            busy_ewma: 0.0,
            memory_mb: 0,
            last_activity: Instant::now(),
        }
    }

    fn utilization(&self, now: Instant) -> f64 {
        let idle = now.saturating_duration_since(self.last_activity);
        let decay = 0.5_f64.powf(idle.as_secs_f64() / IDLE_HALF_LIFE.as_secs_f64());
        (self.busy_ewma * decay).clamp(0.0, 1.0)
    }
}

/// Conservative estimate from lane activity.
#[derive(Debug, Default)]
pub struct EstimatedTelemetry {
    devices: Mutex<HashMap<Device, Estimate>>,
}

impl EstimatedTelemetry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DeviceTelemetry for EstimatedTelemetry {
    fn source(&self) -> &'static str {
        "estimated"
    }

    fn sample(&self, device: Device) -> DeviceSample {
        let devices = self.devices.lock().unwrap_or_else(PoisonError::into_inner);
        let estimate = devices.get(&device).copied().unwrap_or_else(Estimate::new);
        DeviceSample {
            utilization: if devices.contains_key(&device) {
                estimate.utilization(Instant::now())
            } else {
                0.0
            },
            memory_used_mb: estimate.memory_mb,
            memory_total_mb: None,
        }
    }

    fn record_activity(&self, device: Device, busy: Duration) {
        let now = Instant::now();
        let mut devices = self.devices.lock().unwrap_or_else(PoisonError::into_inner);
        let estimate = devices.entry(device).or_insert_with(Estimate::new);

        let window = now.saturating_duration_since(estimate.last_activity).max(busy);
        let fraction = if window.is_zero() {
            1.0
        } else {
            (busy.as_secs_f64() / window.as_secs_f64()).min(1.0)
        };
        estimate.busy_ewma = EWMA_ALPHA * fraction + (1.0 - EWMA_ALPHA) * estimate.busy_ewma;
        estimate.last_activity = now;
    }

    fn record_memory(&self, device: Device, memory_mb: u64) {
        let mut devices = self.devices.lock().unwrap_or_else(PoisonError::into_inner);
        devices.entry(device).or_insert_with(Estimate::new).memory_mb = memory_mb;
    }
}

/// Real readings from `nvidia-smi`, falling back to estimates.
pub struct NvidiaSmiTelemetry {
    executable: String,
    cache: Mutex<Option<(Instant, HashMap<u32, DeviceSample>)>>,
    fallback: EstimatedTelemetry,
}

impl NvidiaSmiTelemetry {
    pub fn new() -> Self {
        Self::with_executable("nvidia-smi")
    }

    pub fn with_executable(executable: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
            cache: Mutex::new(None),
            fallback: EstimatedTelemetry::new(),
        }
    }

    /// Whether the tool is installed and sees at least one GPU.
    pub fn probe(&self) -> bool {
        Command::new(&self.executable)
            .arg("-L")
            .output()
            .map(|out| out.status.success() && !out.stdout.is_empty())
            .unwrap_or(false)
    }

    fn query(&self) -> Option<HashMap<u32, DeviceSample>> {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((taken, samples)) = cache.as_ref()
            && taken.elapsed() < SMI_CACHE_TTL
        {
            return Some(samples.clone());
        }

        let output = Command::new(&self.executable)
            .args([
                "--query-gpu=index,utilization.gpu,memory.used,memory.total",
                "--format=csv,noheader,nounits",
            ])
            .output();
        let output = match output {
            Ok(out) if out.status.success() => out,
            Ok(out) => {
                tracing::debug!(status = %out.status, "nvidia-smi query failed");
                return None;
            }
            Err(e) => {
                tracing::debug!(error = %e, "nvidia-smi unavailable");
                return None;
            }
        };

        let samples = parse_smi_csv(&String::from_utf8_lossy(&output.stdout));
        *cache = Some((Instant::now(), samples.clone()));
        Some(samples)
    }
}

impl Default for NvidiaSmiTelemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceTelemetry for NvidiaSmiTelemetry {
    fn source(&self) -> &'static str {
        "nvidia-smi"
    }

    fn sample(&self, device: Device) -> DeviceSample {
        if let Device::Gpu(index) = device
            && let Some(sample) = self.query().and_then(|mut all| all.remove(&index))
        {
            return sample;
        }
        self.fallback.sample(device)
    }

    fn record_activity(&self, device: Device, busy: Duration) {
        self.fallback.record_activity(device, busy);
    }

    fn record_memory(&self, device: Device, memory_mb: u64) {
        self.fallback.record_memory(device, memory_mb);
    }
}

/// Parse `index, util%, used MiB, total MiB` rows. Malformed rows are skipped.
fn parse_smi_csv(text: &str) -> HashMap<u32, DeviceSample> {
    text.lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            let [index, util, used, total] = fields.as_slice() else {
                return None;
            };
            let utilization = util.parse::<f64>().ok()? / 100.0;
            Some((
                index.parse().ok()?,
                DeviceSample {
                    utilization: utilization.clamp(0.0, 1.0),
                    memory_used_mb: used.parse().ok()?,
                    memory_total_mb: total.parse().ok(),
                },
            ))
        })
        .collect()
}

/// Pick the telemetry implementation for the configured source.
pub fn create_telemetry(source: TelemetrySource) -> Arc<dyn DeviceTelemetry> {
    match source {
        TelemetrySource::Estimated => Arc::new(EstimatedTelemetry::new()),
        TelemetrySource::NvidiaSmi => Arc::new(NvidiaSmiTelemetry::new()),
        TelemetrySource::Auto => {
            let smi = NvidiaSmiTelemetry::new();
            if smi.probe() {
                tracing::info!("Using nvidia-smi for device telemetry");
                Arc::new(smi)
            } else {
                tracing::info!("nvidia-smi not available, using estimated device telemetry");
                Arc::new(EstimatedTelemetry::new())
            }
        }
    }
}
