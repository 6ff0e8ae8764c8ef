//! # signalk-server
//!
//! The SignalK server hub: owns the full model, applies what the provider
//! pipelines deliver and manages the pipelines themselves.

pub mod providers;
pub mod server;
pub mod statistics;

pub use providers::ProviderManager;
pub use server::{ProviderStatus, ServerConfig, SignalKServer};
pub use signalk_core::{Delta, FullSignalK, SignalKStore};
pub use statistics::{ProviderStatistics, ServerStatistics, StatisticsCollector};
