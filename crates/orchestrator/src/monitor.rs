//! Process memory sampling and pressure detection.
//!
//! The monitor keeps a bounded ring of recent samples for the lifetime of
//! the process. It is owned by the milestone driver and lent to the phase
//! runner, which is the only caller; there is no shared global instance.

use std::collections::VecDeque;

use buildloop_core::{MemoryMetrics, MemoryTier};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::{debug, warn};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;
const BYTES_PER_GB: f64 = BYTES_PER_MB * 1024.0;

/// Longest gap, in messages, between two samples.
pub const MAX_SAMPLE_INTERVAL: usize = 10;

/// Raw numbers from one platform read.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeReading {
    pub rss_bytes: u64,
    pub vms_bytes: u64,
    pub cpu_percent: f32,
    pub total_system_bytes: u64,
    pub available_system_bytes: u64,
}

/// Source of memory readings. `None` means the platform could not be read.
pub trait MemoryProbe: Send {
    fn probe(&mut self) -> Option<ProbeReading>;
}

/// Reads the current process through `sysinfo`.
pub struct SysinfoProbe {
    system: System,
    pid: Option<Pid>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                warn!(error = %e, "Cannot determine own pid; memory samples will be unavailable");
                None
            }
        };
        Self {
            system: System::new(),
            pid,
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SysinfoProbe {
    fn probe(&mut self) -> Option<ProbeReading> {
        let pid = self.pid?;
        self.system.refresh_memory();
        self.system
            .refresh_processes(ProcessesToUpdate::Some(&[pid]), true);

        let process = self.system.process(pid)?;
        let total_system_bytes = self.system.total_memory();
        if total_system_bytes == 0 {
            return None;
        }
        Some(ProbeReading {
            rss_bytes: process.memory(),
            vms_bytes: process.virtual_memory(),
            cpu_percent: process.cpu_usage(),
            total_system_bytes,
            available_system_bytes: self.system.available_memory(),
        })
    }
}

/// Thresholds and ring size, read from `[monitor]` in the project config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    /// Resident memory above this is pressure.
    pub memory_ceiling_mb: f64,
    /// Percent of system memory above which we are under pressure.
    pub max_percent: f64,
    /// System available memory below this is pressure.
    pub min_available_mb: f64,
    /// Samples kept in the ring.
    pub capacity: usize,
    /// Samples compared for leak detection.
    pub growth_window: usize,
    pub growth_threshold_mb: f64,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            memory_ceiling_mb: 2048.0,
            max_percent: 80.0,
            min_available_mb: 500.0,
            capacity: 100,
            growth_window: 5,
            growth_threshold_mb: 200.0,
        }
    }
}

pub struct ResourceMonitor {
    probe: Box<dyn MemoryProbe>,
    settings: MonitorSettings,
    history: VecDeque<MemoryMetrics>,
    interval: usize,
}

impl ResourceMonitor {
    pub fn new(probe: Box<dyn MemoryProbe>, settings: MonitorSettings) -> Self {
        let capacity = settings.capacity.max(1);
        Self {
            probe,
            settings,
            history: VecDeque::with_capacity(capacity),
            interval: MAX_SAMPLE_INTERVAL,
        }
    }

    pub fn with_sysinfo(settings: MonitorSettings) -> Self {
        Self::new(Box::new(SysinfoProbe::new()), settings)
    }

    /// Total physical memory of the host in GB, or 0.0 when unknown.
    pub fn system_memory_gb() -> f64 {
        let mut system = System::new();
        system.refresh_memory();
        system.total_memory() as f64 / BYTES_PER_GB
    }

    pub fn detect_tier() -> MemoryTier {
        MemoryTier::from_total_gb(Self::system_memory_gb())
    }

    pub fn settings(&self) -> &MonitorSettings {
        &self.settings
    }

    /// Take a sample and append it to the ring. Never fails: an unreadable
    /// platform yields [`MemoryMetrics::unavailable`].
    pub fn sample(&mut self) -> MemoryMetrics {
        let metrics = match self.probe.probe() {
            Some(reading) => Self::to_metrics(reading),
            None => {
                debug!("Memory probe unavailable");
                MemoryMetrics::unavailable()
            }
        };

        if self.history.len() >= self.settings.capacity.max(1) {
            self.history.pop_front();
        }
        self.history.push_back(metrics.clone());
        metrics
    }

    fn to_metrics(reading: ProbeReading) -> MemoryMetrics {
        let rss_mb = reading.rss_bytes as f64 / BYTES_PER_MB;
        MemoryMetrics {
            rss_mb,
            vms_mb: reading.vms_bytes as f64 / BYTES_PER_MB,
            percent: reading.rss_bytes as f64 / reading.total_system_bytes as f64 * 100.0,
            available_system_mb: reading.available_system_bytes as f64 / BYTES_PER_MB,
            cpu_percent: f64::from(reading.cpu_percent),
            timestamp: Utc::now(),
            available: true,
        }
    }

    pub fn history(&self) -> impl Iterator<Item = &MemoryMetrics> {
        self.history.iter()
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    /// Most recent sample that carries real numbers.
    pub fn latest(&self) -> Option<&MemoryMetrics> {
        self.history.iter().rev().find(|m| m.available)
    }

    pub fn is_under_pressure(&self) -> bool {
        let Some(latest) = self.latest() else {
            return false;
        };
        latest.rss_mb > self.settings.memory_ceiling_mb
            || latest.percent > self.settings.max_percent
            || latest.available_system_mb < self.settings.min_available_mb
    }

    /// Pressure, or resident memory growing faster than the leak threshold
    /// across the last `growth_window` real samples.
    pub fn should_trigger_cleanup(&self) -> bool {
        if self.is_under_pressure() {
            return true;
        }
        let window = self.settings.growth_window;
        if window < 2 {
            return false;
        }
        let recent: Vec<f64> = self
            .history
            .iter()
            .rev()
            .filter(|m| m.available)
            .take(window)
            .map(|m| m.rss_mb)
            .collect();
        if recent.len() < window {
            return false;
        }
        // `recent` is newest first.
        recent[0] - recent[window - 1] > self.settings.growth_threshold_mb
    }

    /// Messages to consume before the next sample.
    pub fn sampling_interval(&self) -> usize {
        self.interval
    }

    /// Halve the sampling interval while cleanup is recommended and relax it
    /// back towards [`MAX_SAMPLE_INTERVAL`] afterwards.
    pub fn adjust_cadence(&mut self, cleanup_recommended: bool) -> usize {
        let next = if cleanup_recommended {
            (self.interval / 2).max(1)
        } else {
            (self.interval * 2).min(MAX_SAMPLE_INTERVAL)
        };
        if next != self.interval {
            debug!(from = self.interval, to = next, "Sampling interval changed");
        }
        self.interval = next;
        next
    }
}

impl std::fmt::Debug for ResourceMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceMonitor")
            .field("settings", &self.settings)
            .field("samples", &self.history.len())
            .field("interval", &self.interval)
            .finish()
    }
}
