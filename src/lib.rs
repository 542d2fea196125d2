//! Wakegate - A reverse proxy that wakes sleeping backends on demand
//!
//! This library provides a reverse proxy that:
//! - Routes HTTP traffic based on Host header to configured services
//! - Probes each service before forwarding and, while it is unresponsive,
//!   sends Wake-on-LAN magic packets in a bounded retry loop
//! - Forwards the inbound request once the service answers and relays the
//!   backend's response unchanged
//! - Merges a service map file with `SERVICE_<HOST>_<FIELD>` environment
//!   overrides and global defaults, field by field
//! - Swaps the whole service registry atomically on reload

pub mod config;
pub mod engine;
pub mod error;
pub mod pool;
pub mod probe;
pub mod proxy;
pub mod registry;
pub mod resolver;
pub mod wol;

/// Version information for the proxy
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
