//! Sampling loop for the Pulse recorder service
//!
//! One background task drives the whole recorder: every interval it takes
//! a counter snapshot, turns the delta against the previous snapshot into
//! an aggregate load, reads memory, appends the composite row to the
//! store, and announces the new sample on a broadcast channel. The loop
//! is the only writer to the store and the only source of new-sample
//! events.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broadcast::SamplePayload;
use crate::config::SamplingConfig;
use crate::error::{RecorderError, Result};
use crate::sampler::{bytes_to_gib, compute_load, CounterSource};
use crate::store::MetricsStore;

/// Announcement of one freshly persisted sample
#[derive(Debug, Clone)]
pub struct NewSample {
    /// Row id the sample landed under
    pub time_id: i64,

    /// Wire payload for live delivery
    pub payload: SamplePayload,
}

/// Sampling loop state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    Idle,
    Running,
    Stopped,
}

/// Tick counters kept by the loop
#[derive(Debug, Clone, Copy, Default)]
pub struct TickStats {
    /// Ticks that appended and announced a sample
    pub ticks_completed: u64,

    /// Ticks abandoned on a counter read or append failure
    pub ticks_failed: u64,
}

/// Shareable control handle for a running loop
#[derive(Clone)]
pub struct MonitorHandle {
    status: Arc<RwLock<ServiceStatus>>,
    cancel: CancellationToken,
}

impl MonitorHandle {
    /// Request a cooperative stop, observed at the next tick boundary.
    ///
    /// An in-flight tick finishes its persistence and broadcast first.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let mut status = self.status.write().await;
        if *status == ServiceStatus::Idle {
            *status = ServiceStatus::Stopped;
        }
    }

    pub async fn status(&self) -> ServiceStatus {
        *self.status.read().await
    }
}

/// The sampling loop service
pub struct MonitorService {
    sampling: SamplingConfig,
    store: Arc<tokio::sync::Mutex<MetricsStore>>,
    source: Option<Box<dyn CounterSource>>,
    sample_tx: broadcast::Sender<NewSample>,
    status: Arc<RwLock<ServiceStatus>>,
    stats: Arc<RwLock<TickStats>>,
    cancel: CancellationToken,
    done: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl MonitorService {
    pub fn new(
        sampling: SamplingConfig,
        store: Arc<tokio::sync::Mutex<MetricsStore>>,
        source: Box<dyn CounterSource>,
        channel_capacity: usize,
    ) -> Self {
        let (sample_tx, _) = broadcast::channel(channel_capacity);

        Self {
            sampling,
            store,
            source: Some(source),
            sample_tx,
            status: Arc::new(RwLock::new(ServiceStatus::Idle)),
            stats: Arc::new(RwLock::new(TickStats::default())),
            cancel: CancellationToken::new(),
            done: CancellationToken::new(),
            task: None,
        }
    }

    /// Subscribe to new-sample announcements
    pub fn subscribe_samples(&self) -> broadcast::Receiver<NewSample> {
        self.sample_tx.subscribe()
    }

    /// Control handle usable from other tasks
    pub fn handle(&self) -> MonitorHandle {
        MonitorHandle {
            status: self.status.clone(),
            cancel: self.cancel.clone(),
        }
    }

    pub async fn status(&self) -> ServiceStatus {
        *self.status.read().await
    }

    pub async fn stats(&self) -> TickStats {
        *self.stats.read().await
    }

    /// Start the loop: take the initial snapshot, then tick every
    /// interval until stopped.
    pub async fn start(&mut self) -> Result<()> {
        let source = self
            .source
            .take()
            .ok_or_else(|| RecorderError::Generic("sampling loop already started".to_string()))?;

        info!(interval_ms = self.sampling.interval_ms, "starting sampling loop");
        *self.status.write().await = ServiceStatus::Running;

        let interval = Duration::from_millis(self.sampling.interval_ms);
        let store = self.store.clone();
        let sample_tx = self.sample_tx.clone();
        let status = self.status.clone();
        let stats = self.stats.clone();
        let cancel = self.cancel.clone();
        let done = self.done.clone();

        self.task = Some(tokio::spawn(async move {
            run_loop(source, interval, store, sample_tx, stats, cancel).await;
            *status.write().await = ServiceStatus::Stopped;
            done.cancel();
            info!("sampling loop stopped");
        }));

        Ok(())
    }

    /// Wait until the loop has fully exited, without consuming it.
    ///
    /// Resolves for bounded runs ending on their own as well as for
    /// explicit stops.
    pub async fn wait_finished(&self) {
        self.done.cancelled().await;
    }

    /// Request a cooperative stop (see [`MonitorHandle::stop`])
    pub async fn stop(&self) {
        self.handle().stop().await;
    }

    /// Wait for the loop task to finish
    pub async fn join(&mut self) {
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

async fn run_loop(
    mut source: Box<dyn CounterSource>,
    interval: Duration,
    store: Arc<tokio::sync::Mutex<MetricsStore>>,
    sample_tx: broadcast::Sender<NewSample>,
    stats: Arc<RwLock<TickStats>>,
    cancel: CancellationToken,
) {
    let mut prev = match source.cpu_snapshot() {
        Ok(snapshot) => snapshot,
        Err(e) => {
            error!(error = %e, "initial counter snapshot failed");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        let curr = match source.cpu_snapshot() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "counter snapshot failed, tick skipped");
                stats.write().await.ticks_failed += 1;
                continue;
            }
        };

        let load = match compute_load(&prev, &curr) {
            Ok(load) => load,
            Err(e) => {
                // Counter topology changed under us; not retried.
                error!(error = %e, "stopping sampling loop");
                break;
            }
        };

        let memory = match source.memory() {
            Ok(memory) => memory,
            Err(e) => {
                warn!(error = %e, "memory read failed, tick skipped");
                stats.write().await.ticks_failed += 1;
                prev = curr;
                continue;
            }
        };

        let timestamp = Utc::now().timestamp_millis();
        let free_gib = bytes_to_gib(memory.free_bytes);
        let total_gib = bytes_to_gib(memory.total_bytes);

        let appended = store.lock().await.append(timestamp, load, free_gib, total_gib);
        match appended {
            Ok(time_id) => {
                let payload = SamplePayload::new(timestamp, load, free_gib, total_gib);
                let _ = sample_tx.send(NewSample { time_id, payload });
                stats.write().await.ticks_completed += 1;
                debug!(time_id, cpu_load = load, "sample recorded");
            }
            Err(e) => {
                warn!(error = %e, "sample append failed, tick abandoned");
                stats.write().await.ticks_failed += 1;
            }
        }

        prev = curr;
    }
}

/// Bounded-run policy for debug and test runs.
///
/// Counts new-sample announcements and stops the loop once the cap is
/// reached, so a cap of N yields exactly N appends. Kept outside the
/// loop itself; attach it only when a cap was explicitly configured.
pub struct TickCapPolicy;

impl TickCapPolicy {
    pub fn attach(service: &MonitorService, cap: u64) -> JoinHandle<()> {
        let mut samples = service.subscribe_samples();
        let handle = service.handle();

        tokio::spawn(async move {
            let mut seen = 0u64;
            loop {
                match samples.recv().await {
                    Ok(_) => seen += 1,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => seen += skipped,
                    Err(broadcast::error::RecvError::Closed) => break,
                }

                if seen >= cap {
                    info!(ticks = seen, "tick cap reached, stopping sampling loop");
                    handle.stop().await;
                    break;
                }
            }
        })
    }
}
