//! Records flowing between pipeline stages.

use chrono::{DateTime, SecondsFormat, Utc};
use signalk_core::Delta;

use crate::n2k::PgnMessage;

/// Where a tagged line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Read from a `<millis>;<disc>;<payload>` log; timestamps are historical.
    Multiplexed,
    /// Classified from live input; timestamp is the arrival time.
    Live,
}

/// A line with its timestamp and protocol discriminator.
#[derive(Debug, Clone, PartialEq)]
pub struct TaggedLine {
    pub timestamp_ms: i64,
    pub discriminator: char,
    pub payload: String,
    pub framing: Framing,
}

/// Unit of data passed between stages. Stages pass through kinds they don't handle.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Bytes(Vec<u8>),
    Line(String),
    Tagged(TaggedLine),
    Pgn(PgnMessage),
    Delta(Delta),
}

impl Record {
    pub fn kind(&self) -> &'static str {
        match self {
            Record::Bytes(_) => "bytes",
            Record::Line(_) => "line",
            Record::Tagged(_) => "tagged",
            Record::Pgn(_) => "pgn",
            Record::Delta(_) => "delta",
        }
    }
}

/// Wall clock in epoch milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// ISO 8601 UTC with millisecond precision, as used in deltas.
pub fn iso_timestamp(ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .unwrap_or_else(Utc::now)
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn iso_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
