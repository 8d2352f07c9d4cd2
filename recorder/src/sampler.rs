//! Counter sampling for the Pulse recorder service
//!
//! This module converts raw cumulative OS counters into normalized load
//! percentages. The raw counter source itself is a capability behind the
//! [`CounterSource`] trait: the sampling loop asks it for per-core tick
//! snapshots and memory readings on demand, and the load math here turns
//! two successive snapshots into one aggregate percentage.

use std::fs;

use serde::{Deserialize, Serialize};
use sysinfo::System;

use crate::error::{SamplerError, SamplerResult};

/// Location of the cumulative per-core tick counters on Linux
const PROC_STAT: &str = "/proc/stat";

const BYTES_PER_GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Cumulative tick counters for one core, since an arbitrary epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CoreTimes {
    /// Ticks spent in user mode
    pub user: u64,

    /// Ticks spent in kernel mode
    pub system: u64,

    /// Idle ticks
    pub idle: u64,
}

/// One snapshot of all per-core counters, in stable core order
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CpuSnapshot {
    pub cores: Vec<CoreTimes>,
}

/// One reading of system memory, in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemorySnapshot {
    pub free_bytes: u64,
    pub total_bytes: u64,
}

/// Host identity sent to subscribers on connect
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HostInfo {
    pub hostname: String,
    pub distro: String,
    pub release: String,
}

/// Capability that produces raw counter snapshots and memory readings.
///
/// The sampling loop owns exactly one source for its lifetime; snapshots
/// from different sources must not be mixed.
pub trait CounterSource: Send {
    /// Take a cumulative per-core counter snapshot
    fn cpu_snapshot(&mut self) -> SamplerResult<CpuSnapshot>;

    /// Read current free/total system memory
    fn memory(&mut self) -> SamplerResult<MemorySnapshot>;

    /// Describe the host this source samples
    fn host_info(&self) -> HostInfo;
}

/// Compute the aggregate CPU load percentage between two snapshots.
///
/// For each core, the elapsed ticks are `Δuser + Δsystem + Δidle`; the
/// core's load is `100 · Δuser / elapsed` when any ticks elapsed and `0`
/// otherwise (a core sampled too fast contributes zero rather than a
/// division fault). The result is the arithmetic mean across cores and is
/// always in `[0, 100]`.
///
/// The two snapshots must describe the same cores in the same order;
/// mismatched core counts are a caller error and are not retried.
pub fn compute_load(prev: &CpuSnapshot, curr: &CpuSnapshot) -> SamplerResult<f64> {
    if prev.cores.len() != curr.cores.len() {
        return Err(SamplerError::CoreCountMismatch {
            prev: prev.cores.len(),
            curr: curr.cores.len(),
        });
    }

    if curr.cores.is_empty() {
        return Ok(0.0);
    }

    let mut load_sum = 0.0;
    for (p, c) in prev.cores.iter().zip(curr.cores.iter()) {
        // Saturating deltas: a wrapped counter contributes nothing for
        // this tick instead of a bogus huge load.
        let user = c.user.saturating_sub(p.user);
        let system = c.system.saturating_sub(p.system);
        let idle = c.idle.saturating_sub(p.idle);

        let elapsed = user + system + idle;
        if elapsed > 0 {
            load_sum += 100.0 * user as f64 / elapsed as f64;
        }
    }

    Ok(load_sum / curr.cores.len() as f64)
}

/// Convert a byte count into GiB
pub fn bytes_to_gib(bytes: u64) -> f64 {
    bytes as f64 / BYTES_PER_GIB
}

/// Parse the per-core `cpuN` lines of a `/proc/stat` dump.
///
/// The aggregate `cpu` line is skipped; columns are
/// `user nice system idle ...` and only user/system/idle are kept.
fn parse_proc_stat(content: &str) -> SamplerResult<CpuSnapshot> {
    let mut cores = Vec::new();

    for line in content.lines() {
        let mut parts = line.split_whitespace();
        let label = parts.next().unwrap_or_default();
        if !label.starts_with("cpu") || label == "cpu" {
            continue;
        }

        let fields: Vec<u64> = parts.map(|f| f.parse().unwrap_or(0)).collect();
        if fields.len() < 4 {
            return Err(SamplerError::CounterRead {
                reason: format!("malformed counter line for {label}"),
            });
        }

        cores.push(CoreTimes {
            user: fields[0],
            system: fields[2],
            idle: fields[3],
        });
    }

    if cores.is_empty() {
        return Err(SamplerError::CounterRead {
            reason: "no per-core counters found".to_string(),
        });
    }

    Ok(CpuSnapshot { cores })
}

/// Counter source backed by the running host: procfs for per-core tick
/// counters, sysinfo for memory totals and host identity.
pub struct SystemCounterSource {
    system: System,
}

impl SystemCounterSource {
    pub fn new() -> Self {
        Self { system: System::new() }
    }
}

impl Default for SystemCounterSource {
    fn default() -> Self {
        Self::new()
    }
}

impl CounterSource for SystemCounterSource {
    fn cpu_snapshot(&mut self) -> SamplerResult<CpuSnapshot> {
        let content = fs::read_to_string(PROC_STAT).map_err(|e| SamplerError::CounterRead {
            reason: format!("{PROC_STAT}: {e}"),
        })?;

        parse_proc_stat(&content)
    }

    fn memory(&mut self) -> SamplerResult<MemorySnapshot> {
        self.system.refresh_memory();

        Ok(MemorySnapshot {
            free_bytes: self.system.free_memory(),
            total_bytes: self.system.total_memory(),
        })
    }

    fn host_info(&self) -> HostInfo {
        HostInfo {
            hostname: System::host_name().unwrap_or_else(|| "unknown".to_string()),
            distro: System::name().unwrap_or_else(|| "unknown".to_string()),
            release: System::os_version().unwrap_or_else(|| "unknown".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(cores: &[(u64, u64, u64)]) -> CpuSnapshot {
        CpuSnapshot {
            cores: cores
                .iter()
                .map(|&(user, system, idle)| CoreTimes { user, system, idle })
                .collect(),
        }
    }

    #[test]
    fn test_single_core_load() {
        let prev = snapshot(&[(100, 50, 850)]);
        let curr = snapshot(&[(125, 60, 915)]);

        // 25 user ticks out of 100 elapsed
        let load = compute_load(&prev, &curr).unwrap();
        assert!((load - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_mean_across_cores() {
        let prev = snapshot(&[(0, 0, 0), (0, 0, 0)]);
        let curr = snapshot(&[(100, 0, 0), (0, 0, 100)]);

        // One fully busy core, one fully idle core
        let load = compute_load(&prev, &curr).unwrap();
        assert!((load - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_zero_elapsed_ticks_is_zero_not_fault() {
        let prev = snapshot(&[(100, 50, 850), (10, 10, 10)]);
        let curr = snapshot(&[(100, 50, 850), (10, 10, 10)]);

        let load = compute_load(&prev, &curr).unwrap();
        assert_eq!(load, 0.0);
    }

    #[test]
    fn test_load_stays_in_range() {
        let cases = [
            (snapshot(&[(0, 0, 0)]), snapshot(&[(1000, 0, 0)])),
            (snapshot(&[(5, 5, 5)]), snapshot(&[(5, 5, 1000)])),
            (snapshot(&[(1, 2, 3), (4, 5, 6)]), snapshot(&[(100, 2, 3), (4, 500, 6)])),
        ];

        for (prev, curr) in cases {
            let load = compute_load(&prev, &curr).unwrap();
            assert!((0.0..=100.0).contains(&load), "load {load} out of range");
        }
    }

    #[test]
    fn test_counter_wrap_contributes_zero() {
        // Current user counter below the previous one: wrapped
        let prev = snapshot(&[(1000, 0, 0)]);
        let curr = snapshot(&[(10, 0, 0)]);

        let load = compute_load(&prev, &curr).unwrap();
        assert_eq!(load, 0.0);
    }

    #[test]
    fn test_core_count_mismatch_is_error() {
        let prev = snapshot(&[(0, 0, 0)]);
        let curr = snapshot(&[(1, 1, 1), (2, 2, 2)]);

        let err = compute_load(&prev, &curr).unwrap_err();
        assert!(matches!(err, SamplerError::CoreCountMismatch { prev: 1, curr: 2 }));
    }

    #[test]
    fn test_empty_snapshots() {
        let load = compute_load(&CpuSnapshot::default(), &CpuSnapshot::default()).unwrap();
        assert_eq!(load, 0.0);
    }

    #[test]
    fn test_parse_proc_stat() {
        let content = "\
cpu  1000 20 300 4000 50 0 10 0 0 0
cpu0 600 10 200 2000 30 0 5 0 0 0
cpu1 400 10 100 2000 20 0 5 0 0 0
intr 123456
ctxt 654321
";
        let snap = parse_proc_stat(content).unwrap();
        assert_eq!(snap.cores.len(), 2);
        assert_eq!(snap.cores[0], CoreTimes { user: 600, system: 200, idle: 2000 });
        assert_eq!(snap.cores[1], CoreTimes { user: 400, system: 100, idle: 2000 });
    }

    #[test]
    fn test_parse_proc_stat_no_cores() {
        assert!(parse_proc_stat("intr 1 2 3\n").is_err());
    }

    #[test]
    fn test_bytes_to_gib() {
        assert_eq!(bytes_to_gib(0), 0.0);
        assert_eq!(bytes_to_gib(1024 * 1024 * 1024), 1.0);
        assert!((bytes_to_gib(16 * 1024 * 1024 * 1024) - 16.0).abs() < 1e-9);
    }

    #[test]
    fn test_system_source_host_info_is_populated() {
        let source = SystemCounterSource::new();
        let info = source.host_info();
        assert!(!info.hostname.is_empty());
        assert!(!info.distro.is_empty());
    }
}
