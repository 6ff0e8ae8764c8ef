//! # signalk-providers
//!
//! Data providers for SignalK server.
//!
//! A provider is a pipeline of stages that turns one input channel into
//! canonical deltas:
//! - transports: serial, TCP client and server, UDP, subprocess, file and
//!   folder replay, websocket client
//! - line splitting and format detection for mixed or multiplexed input
//! - NMEA 0183 and NMEA 2000 decoding
//! - replay throttling, raw logging and path filtering
//!
//! Pipelines report to the server through an [`AppHandle`].

pub mod app;
pub mod config;
pub mod demux;
pub mod detect;
pub mod error;
pub mod liner;
pub mod n2k;
pub mod nmea0183;
pub mod pipeline;
pub mod record;
pub mod stage;
pub mod stages;
pub mod throttle;
pub mod transport;

pub use app::{AppEvent, AppHandle, ProviderEvent};
pub use config::{CanFraming, ConnectionConfig, Protocol, TransportKind, TransportSettings};
pub use error::{ProviderError, Result};
pub use pipeline::{Pipeline, PipelineContext};
pub use record::{Framing, Record, TaggedLine};
pub use stage::{Stage, Transform};
pub use stages::LogRegistry;
