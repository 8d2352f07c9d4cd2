//! Subscriber registry and broadcast dispatch for the Pulse recorder
//!
//! Live viewers subscribe here: each gets host metadata plus a bounded
//! historical backfill on connect, then every new sample as a live event.
//! A subscriber's replay window can be reconfigured while streaming; the
//! subscriber is paused for the duration so it sees a consistent cut
//! between old-window backfill and new-window live samples.
//!
//! The registry is an arena of records behind one mutex; delivery
//! eligibility is a per-record atomic pause flag, so the hot broadcast
//! path never takes more than the list lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::RecorderConfig;
use crate::error::{Result, SubscriptionError};
use crate::monitor::NewSample;
use crate::sampler::HostInfo;
use crate::store::{MetricsRow, MetricsStore};

/// Wire payload of one sample event, floats rounded to 2 decimals
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplePayload {
    /// Sample timestamp in epoch milliseconds
    pub time: i64,

    /// Aggregate CPU load percentage
    pub cpu_load: f64,

    /// Free memory in GiB
    pub free: f64,

    /// Total memory in GiB
    pub tot: f64,
}

impl SamplePayload {
    pub fn new(time: i64, cpu_load: f64, free: f64, tot: f64) -> Self {
        Self {
            time,
            cpu_load: round2(cpu_load),
            free: round2(free),
            tot: round2(tot),
        }
    }

    pub fn from_row(row: &MetricsRow) -> Self {
        Self::new(row.timestamp, row.cpu_load, row.mem_free, row.mem_total)
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Host metadata event, sent once immediately after subscribe
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostInfoEvent {
    #[serde(rename = "hostInfos")]
    pub host_infos: HostInfo,

    #[serde(rename = "clientID")]
    pub client_id: Uuid,

    pub options: ClientWindow,
}

/// One field of a subscriber's window descriptor.
///
/// `edit = false` fields are advisory-only: reconfiguration requests
/// naming them are skipped, not rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowField {
    pub name: String,
    pub max: u64,
    pub min: u64,
    pub value: u64,
    pub unit: String,
    pub text: String,
    pub edit: bool,
}

/// A subscriber's replay-window configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientWindow {
    /// Sampling frequency awareness in milliseconds (advisory)
    pub freq: WindowField,

    /// History length in seconds (editable)
    pub hist: WindowField,
}

impl ClientWindow {
    fn defaults(defaults: &StreamDefaults) -> Self {
        let retained_secs = defaults.retention_ms / 1000;

        Self {
            freq: WindowField {
                name: "frequency".to_string(),
                max: defaults.retention_ms,
                min: defaults.freq_ms,
                value: defaults.freq_ms,
                unit: "ms".to_string(),
                text: "Monitoring frequency".to_string(),
                edit: false,
            },
            hist: WindowField {
                name: "history".to_string(),
                max: retained_secs,
                min: 1,
                value: defaults.history_secs.min(retained_secs),
                unit: "s".to_string(),
                text: "History size".to_string(),
                edit: true,
            },
        }
    }

    /// Number of backfill rows this window asks for:
    /// `ceil(history_s / (freq_ms / 1000))`
    pub fn backfill_rows(&self) -> usize {
        let freq_ms = self.freq.value.max(1);
        ((self.hist.value * 1000).div_ceil(freq_ms)) as usize
    }

    /// Merge one requested field change into the window.
    ///
    /// Unknown names and non-editable fields are no-ops; edited values
    /// are clamped into the field's `[min, max]`. Returns whether the
    /// window changed.
    fn apply(&mut self, name: &str, value: u64) -> bool {
        let field = match name {
            "hist" | "history" => &mut self.hist,
            "freq" | "frequency" => &mut self.freq,
            other => {
                debug!(field = other, "ignoring unknown window field");
                return false;
            }
        };

        if !field.edit {
            debug!(field = %field.name, "ignoring non-editable window field");
            return false;
        }

        let clamped = value.clamp(field.min, field.max);
        let changed = field.value != clamped;
        field.value = clamped;
        changed
    }
}

/// Event delivered to one subscriber over its channel.
///
/// The external transport turns each into a named event on the wire.
#[derive(Debug, Clone)]
pub enum SubscriberEvent {
    HostInfo(HostInfoEvent),
    Backfill(Vec<SamplePayload>),
    Sample(SamplePayload),
}

impl SubscriberEvent {
    /// Wire event name the transport should use
    pub fn event_name(&self) -> &'static str {
        match self {
            SubscriberEvent::HostInfo(_) => "hostinfos",
            SubscriberEvent::Backfill(_) | SubscriberEvent::Sample(_) => "data",
        }
    }
}

/// Response to a window reconfiguration request
#[derive(Debug, Clone, Serialize)]
pub struct ReconfigureResponse {
    /// The updated window descriptor
    pub window: ClientWindow,

    /// Fresh backfill for the new window
    pub data: Vec<SamplePayload>,
}

/// Receiving side of one subscription
pub struct SubscriberHandle {
    pub id: Uuid,
    pub events: mpsc::UnboundedReceiver<SubscriberEvent>,
}

struct SubscriberRecord {
    window: ClientWindow,
    paused: Arc<AtomicBool>,
    reconfigure_lock: Arc<tokio::sync::Mutex<()>>,
    tx: mpsc::UnboundedSender<SubscriberEvent>,
}

/// Process-wide defaults handed to every new subscriber window
#[derive(Debug, Clone)]
pub struct StreamDefaults {
    /// Sampling interval in milliseconds
    pub freq_ms: u64,

    /// Default history window in seconds
    pub history_secs: u64,

    /// Retention horizon in milliseconds
    pub retention_ms: u64,
}

impl StreamDefaults {
    pub fn from_config(config: &RecorderConfig) -> Self {
        Self {
            freq_ms: config.sampling.interval_ms,
            history_secs: config.stream.default_history_secs,
            retention_ms: config.retention.horizon_ms() as u64,
        }
    }
}

/// Subscriber registry and broadcast dispatcher
pub struct Broadcaster {
    subscribers: Mutex<HashMap<Uuid, SubscriberRecord>>,
    store: Arc<tokio::sync::Mutex<MetricsStore>>,
    defaults: StreamDefaults,
    host: HostInfo,
}

impl Broadcaster {
    pub fn new(
        store: Arc<tokio::sync::Mutex<MetricsStore>>,
        defaults: StreamDefaults,
        host: HostInfo,
    ) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            store,
            defaults,
            host,
        }
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<Uuid, SubscriberRecord>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of currently connected subscribers
    pub fn subscriber_count(&self) -> usize {
        self.registry().len()
    }

    /// Register a new live viewer.
    ///
    /// The record is primed paused so the host-metadata event and the
    /// backfill burst are queued ahead of any live sample, then unpaused.
    pub async fn subscribe(&self) -> Result<SubscriberHandle> {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        let window = ClientWindow::defaults(&self.defaults);
        let paused = Arc::new(AtomicBool::new(true));

        self.registry().insert(
            id,
            SubscriberRecord {
                window: window.clone(),
                paused: paused.clone(),
                reconfigure_lock: Arc::new(tokio::sync::Mutex::new(())),
                tx: tx.clone(),
            },
        );

        let _ = tx.send(SubscriberEvent::HostInfo(HostInfoEvent {
            host_infos: self.host.clone(),
            client_id: id,
            options: window.clone(),
        }));

        let backfill = match self.fetch_backfill(&window).await {
            Ok(rows) => rows,
            Err(e) => {
                self.registry().remove(&id);
                return Err(e);
            }
        };
        let _ = tx.send(SubscriberEvent::Backfill(backfill));

        paused.store(false, Ordering::SeqCst);
        info!(subscriber = %id, "connection started");

        Ok(SubscriberHandle { id, events: rx })
    }

    /// Remove a subscriber. Idempotent: unknown ids are a no-op.
    ///
    /// This is the sole removal path; the transport calls it when it
    /// detects a closed connection.
    pub fn unsubscribe(&self, id: Uuid) {
        if self.registry().remove(&id).is_some() {
            info!(subscriber = %id, "connection closed");
        }
    }

    /// Reconfigure a subscriber's replay window.
    ///
    /// The subscriber is paused while its window is merged and a fresh
    /// backfill fetched, so no live sample lands mid-reconfiguration.
    /// Reconfigurations are serialized per subscriber; different
    /// subscribers proceed independently.
    pub async fn reconfigure(
        &self,
        id: Uuid,
        fields: &HashMap<String, u64>,
    ) -> Result<ReconfigureResponse> {
        let (paused, reconfigure_lock) = {
            let registry = self.registry();
            let record = registry
                .get(&id)
                .ok_or(SubscriptionError::UnknownSubscriber { id })?;
            (record.paused.clone(), record.reconfigure_lock.clone())
        };

        let _serial = reconfigure_lock.lock().await;

        paused.store(true, Ordering::SeqCst);
        debug!(subscriber = %id, "updating window, live delivery paused");

        let window = {
            let mut registry = self.registry();
            let record = match registry.get_mut(&id) {
                Some(record) => record,
                None => {
                    // Unsubscribed while we waited on the serial lock
                    return Err(SubscriptionError::UnknownSubscriber { id }.into());
                }
            };

            for (name, value) in fields {
                record.window.apply(name, *value);
            }
            record.window.clone()
        };

        let backfill = self.fetch_backfill(&window).await;
        paused.store(false, Ordering::SeqCst);

        let data = backfill?;
        debug!(subscriber = %id, rows = data.len(), "window updated, live delivery resumed");

        Ok(ReconfigureResponse { window, data })
    }

    /// Deliver one live sample to every non-paused subscriber.
    ///
    /// One subscriber's dead channel never affects the others: the send
    /// failure is logged and the pass continues. Removal stays with
    /// `unsubscribe`.
    pub fn dispatch(&self, payload: &SamplePayload) {
        let registry = self.registry();
        for (id, record) in registry.iter() {
            if record.paused.load(Ordering::SeqCst) {
                continue;
            }
            if record.tx.send(SubscriberEvent::Sample(payload.clone())).is_err() {
                debug!(subscriber = %id, "subscriber channel closed, dropping sample");
            }
        }
    }

    async fn fetch_backfill(&self, window: &ClientWindow) -> Result<Vec<SamplePayload>> {
        let now = Utc::now().timestamp_millis();
        let count = window.backfill_rows();

        let rows = self.store.lock().await.query_window(now, count)?;
        Ok(rows.iter().map(SamplePayload::from_row).collect())
    }
}

/// Bridge the sampling loop's new-sample channel into the registry.
///
/// Runs until the channel closes (the sampling loop is gone).
pub fn run_dispatcher(
    broadcaster: Arc<Broadcaster>,
    mut samples: broadcast::Receiver<NewSample>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match samples.recv().await {
                Ok(sample) => broadcaster.dispatch(&sample.payload),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "dispatcher lagged behind the sampling loop");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        debug!("dispatcher finished, sample channel closed");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> StreamDefaults {
        StreamDefaults {
            freq_ms: 1000,
            history_secs: 60,
            retention_ms: 30 * 24 * 3600 * 1000,
        }
    }

    #[test]
    fn test_round2() {
        assert_eq!(round2(33.333333), 33.33);
        assert_eq!(round2(66.666666), 66.67);
        assert_eq!(round2(0.0), 0.0);
    }

    #[test]
    fn test_payload_rounding() {
        let payload = SamplePayload::new(1_000, 12.3456, 3.98765, 15.99999);
        assert_eq!(payload.cpu_load, 12.35);
        assert_eq!(payload.free, 3.99);
        assert_eq!(payload.tot, 16.0);
    }

    #[test]
    fn test_default_window() {
        let window = ClientWindow::defaults(&defaults());

        assert_eq!(window.freq.value, 1000);
        assert!(!window.freq.edit);
        assert_eq!(window.freq.min, 1000);

        assert_eq!(window.hist.value, 60);
        assert!(window.hist.edit);
        assert_eq!(window.hist.min, 1);
        assert_eq!(window.hist.max, 30 * 24 * 3600);
    }

    #[test]
    fn test_backfill_rows_ceiling() {
        let mut window = ClientWindow::defaults(&defaults());
        // 60 s of history at one sample per second
        assert_eq!(window.backfill_rows(), 60);

        window.freq.value = 1500;
        window.hist.value = 4;
        // ceil(4000 / 1500) = 3
        assert_eq!(window.backfill_rows(), 3);
    }

    #[test]
    fn test_apply_editable_field() {
        let mut window = ClientWindow::defaults(&defaults());
        assert!(window.apply("history", 120));
        assert_eq!(window.hist.value, 120);

        // Short key accepted too
        assert!(window.apply("hist", 30));
        assert_eq!(window.hist.value, 30);
    }

    #[test]
    fn test_apply_clamps_to_range() {
        let mut window = ClientWindow::defaults(&defaults());
        window.apply("history", u64::MAX);
        assert_eq!(window.hist.value, window.hist.max);

        window.apply("history", 0);
        assert_eq!(window.hist.value, 1);
    }

    #[test]
    fn test_apply_noneditable_field_is_noop() {
        let mut window = ClientWindow::defaults(&defaults());
        assert!(!window.apply("frequency", 50));
        assert_eq!(window.freq.value, 1000);
    }

    #[test]
    fn test_apply_unknown_field_is_noop() {
        let mut window = ClientWindow::defaults(&defaults());
        assert!(!window.apply("color", 7));
        assert_eq!(window, ClientWindow::defaults(&defaults()));
    }

    #[test]
    fn test_hostinfo_event_wire_shape() {
        let event = HostInfoEvent {
            host_infos: HostInfo {
                hostname: "test-host".to_string(),
                distro: "Linux".to_string(),
                release: "6.1.0".to_string(),
            },
            client_id: Uuid::nil(),
            options: ClientWindow::defaults(&defaults()),
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["hostInfos"]["hostname"], "test-host");
        assert!(json.get("clientID").is_some());
        assert_eq!(json["options"]["hist"]["unit"], "s");
        assert_eq!(json["options"]["freq"]["edit"], false);
    }

    #[test]
    fn test_event_names() {
        let payload = SamplePayload::new(0, 0.0, 0.0, 0.0);
        assert_eq!(SubscriberEvent::Sample(payload.clone()).event_name(), "data");
        assert_eq!(SubscriberEvent::Backfill(vec![payload]).event_name(), "data");
    }
}
