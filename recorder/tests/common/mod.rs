//! Shared fixtures for the integration suites
#![allow(dead_code)]

use std::sync::Arc;

use pulse_recorder::config::{RecorderConfig, SamplingConfig};
use pulse_recorder::error::SamplerResult;
use pulse_recorder::monitor::MonitorService;
use pulse_recorder::sampler::{CounterSource, CoreTimes, CpuSnapshot, HostInfo, MemorySnapshot};
use pulse_recorder::store::MetricsStore;

pub type SharedStore = Arc<tokio::sync::Mutex<MetricsStore>>;

/// Deterministic counter source: two cores, one 25% busy and one 75%
/// busy in user time, fixed 8/16 GiB memory.
pub struct ScriptedSource {
    ticks: u64,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self { ticks: 0 }
    }
}

impl CounterSource for ScriptedSource {
    fn cpu_snapshot(&mut self) -> SamplerResult<CpuSnapshot> {
        self.ticks += 1;
        let t = self.ticks;
        Ok(CpuSnapshot {
            cores: vec![
                CoreTimes { user: t * 25, system: 0, idle: t * 75 },
                CoreTimes { user: t * 75, system: 0, idle: t * 25 },
            ],
        })
    }

    fn memory(&mut self) -> SamplerResult<MemorySnapshot> {
        Ok(MemorySnapshot {
            free_bytes: 8 * 1024 * 1024 * 1024,
            total_bytes: 16 * 1024 * 1024 * 1024,
        })
    }

    fn host_info(&self) -> HostInfo {
        test_host()
    }
}

pub fn test_host() -> HostInfo {
    HostInfo {
        hostname: "test-host".to_string(),
        distro: "TestOS".to_string(),
        release: "1.0".to_string(),
    }
}

pub fn test_config(interval_ms: u64) -> RecorderConfig {
    let mut config = RecorderConfig::default();
    config.sampling.interval_ms = interval_ms;
    config.retention.history_days = 1;
    config.stream.default_history_secs = 2;
    config
}

pub fn shared_store() -> SharedStore {
    Arc::new(tokio::sync::Mutex::new(
        MetricsStore::open_in_memory(1).unwrap(),
    ))
}

pub fn scripted_monitor(interval_ms: u64, store: SharedStore) -> MonitorService {
    MonitorService::new(
        SamplingConfig { interval_ms, tick_cap: None },
        store,
        Box::new(ScriptedSource::new()),
        64,
    )
}
