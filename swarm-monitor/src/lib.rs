//! Read-only Swarm/Docker service inventory (C8), proxied through
//! Portainer, plus the CPU-load sampling the saturation controller (C7)
//! depends on. Only manager nodes run this; elsewhere the cache just
//! stays empty (spec §4.5).

pub mod client;
pub mod error;
pub mod reconciler;
pub mod state;

pub use client::{CpuLoadSample, PortainerClient, SharedPortainerClient};
pub use error::MonitorError;
pub use state::{LogEntry, ServiceState, ServiceStateCache, ServiceStatus, SseEvent};
