//! WakeDock - wake-on-demand container orchestration
//!
//! This library keeps idle services stopped and transparently restarts them
//! when they are needed, while holding a reverse proxy's configuration in
//! lock-step with the set of running services:
//! - Maintains a registry of services and their lifecycle state
//! - Wakes services on demand (container or compose stack) via the Docker API
//! - Puts services to sleep when an auto-shutdown policy decides they are idle
//! - Regenerates the proxy's managed configuration section on every
//!   exposure-changing transition and reloads the proxy through its admin API
//! - Monitors per-service CPU and memory usage with a bounded sample history

pub mod config;
pub mod docker;
pub mod error;
pub mod monitor;
pub mod orchestrator;
pub mod proxy;
pub mod service;
