//! Pulse recorder service library
//!
//! This library provides the core functionality for the Pulse recorder
//! service: a periodic sampler that converts raw OS counters into
//! normalized load percentages, a retention-bounded time-series store,
//! and a multi-subscriber broadcast layer with per-subscriber replay
//! windows.

pub mod broadcast;
pub mod config;
pub mod error;
pub mod monitor;
pub mod sampler;
pub mod store;

// Re-export commonly used types
pub use broadcast::{
    Broadcaster, ClientWindow, HostInfoEvent, ReconfigureResponse, SamplePayload, StreamDefaults,
    SubscriberEvent, SubscriberHandle, WindowField,
};
pub use config::RecorderConfig;
pub use error::{RecorderError, Result};
pub use monitor::{MonitorService, NewSample, ServiceStatus, TickCapPolicy, TickStats};
pub use sampler::{compute_load, CounterSource, CpuSnapshot, HostInfo, SystemCounterSource};
pub use store::{MetricsRow, MetricsStore};
