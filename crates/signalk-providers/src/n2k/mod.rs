//! NMEA 2000: gateway encodings, PGN decoding and Signal K mapping.

pub mod analyzer;
pub mod canonicalizer;
pub mod formats;
pub mod frame;
pub mod mapping;
pub mod pgns;

pub use analyzer::Analyzer;
pub use canonicalizer::{N2kOptions, N2kToSignalK, SourceFilter};
pub use formats::{parse_pcdin, CanLineParser, LineFormat};
pub use frame::{CanId, FastPacketAssembler, PgnMessage};
