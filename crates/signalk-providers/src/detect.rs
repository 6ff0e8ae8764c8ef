//! Input format detection.
//!
//! The first non-empty line decides, for the life of the connection, whether
//! the input is a multiplexed log (`<millis>;<disc>;<payload>`) or live mixed
//! protocol traffic. Every line is then emitted as a [`TaggedLine`] carrying a
//! timestamp and a discriminator for the demultiplexer.

use tracing::{info, warn};

use crate::record::{now_ms, Framing, Record, TaggedLine};
use crate::stage::Transform;

/// Discriminator of canonical SignalK JSON.
pub const DISC_SIGNALK: char = 'I';
/// Discriminator of NMEA 0183 sentences.
pub const DISC_NMEA0183: char = 'N';
/// Discriminator of NMEA 2000 analyzer text.
pub const DISC_N2K: char = 'A';

const FIELD_SEPARATOR: u8 = b';';
const SEPARATOR_OFFSET: usize = 13;

/// Vendor sentence prefix carried on the `!` talker that is NMEA 2000 data.
const IKONVERT_PREFIX: &str = "!PDGY";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectState {
    Undetermined,
    MultiplexedLog,
    LiveMixed,
}

/// True when `line` looks like a multiplexed log record.
pub fn is_multiplexed(line: &str) -> bool {
    line.len() > 16
        && line.as_bytes().get(SEPARATOR_OFFSET) == Some(&FIELD_SEPARATOR)
        && line.split(';').count() >= 3
}

/// Parse a multiplexed record. The payload may itself contain `;`.
pub fn parse_multiplexed(line: &str) -> Option<TaggedLine> {
    let mut parts = line.splitn(3, ';');
    let timestamp_ms = parts.next()?.trim().parse::<i64>().ok()?;
    let discriminator = parts.next()?.chars().next()?;
    let payload = parts.next()?.to_string();
    Some(TaggedLine {
        timestamp_ms,
        discriminator,
        payload,
        framing: Framing::Multiplexed,
    })
}

/// Pick a discriminator for a live line.
pub fn classify(line: &str) -> char {
    if line.starts_with('{') {
        DISC_SIGNALK
    } else if (line.starts_with('$') || line.starts_with('!')) && !line.starts_with(IKONVERT_PREFIX) {
        DISC_NMEA0183
    } else {
        DISC_N2K
    }
}

/// Line → tagged line, deciding the input format on the first line.
#[derive(Debug)]
pub struct FormatDetector {
    state: DetectState,
}

impl Default for FormatDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl FormatDetector {
    pub fn new() -> Self {
        Self {
            state: DetectState::Undetermined,
        }
    }

    pub fn state(&self) -> DetectState {
        self.state
    }

    pub fn tag(&mut self, line: String) -> Option<TaggedLine> {
        if line.is_empty() {
            return None;
        }
        if self.state == DetectState::Undetermined {
            self.state = if is_multiplexed(&line) {
                DetectState::MultiplexedLog
            } else {
                DetectState::LiveMixed
            };
            info!("Input detected as {:?}", self.state);
        }
        match self.state {
            DetectState::MultiplexedLog => {
                let tagged = parse_multiplexed(&line);
                if tagged.is_none() {
                    warn!("Malformed multiplexed record: {}", line);
                }
                tagged
            }
            _ => Some(TaggedLine {
                timestamp_ms: now_ms(),
                discriminator: classify(&line),
                payload: line,
                framing: Framing::Live,
            }),
        }
    }
}

impl Transform for FormatDetector {
    fn name(&self) -> &str {
        "format-detector"
    }

    fn handle_read(&mut self, record: Record, out: &mut Vec<Record>) {
        match record {
            Record::Line(line) => out.extend(self.tag(line).map(Record::Tagged)),
            other => out.push(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multiplexed_detection() {
        assert!(is_multiplexed("1500000000000;A;2017-07-14T02:40:00.000Z,2,127250,36,255,8,00"));
        assert!(is_multiplexed("1500000000000;I;{\"updates\":[]}"));
        // separator not at offset 13
        assert!(!is_multiplexed("150000000000;A;2017-07-14T02:40:00.000Z,2"));
        assert!(!is_multiplexed("$GPRMC,123519,A,4807.038,N,01131.000,E"));
        assert!(!is_multiplexed("1500000000000;A"));
    }

    #[test]
    fn test_payload_keeps_separators() {
        let tagged = parse_multiplexed("1500000000000;N;$GPXXX,a;b;c*00").unwrap();
        assert_eq!(tagged.timestamp_ms, 1_500_000_000_000);
        assert_eq!(tagged.discriminator, 'N');
        assert_eq!(tagged.payload, "$GPXXX,a;b;c*00");
    }

    #[test]
    fn test_state_is_terminal() {
        let mut detector = FormatDetector::new();
        let first = detector.tag("1500000000000;I;{\"updates\":[]}".into()).unwrap();
        assert_eq!(detector.state(), DetectState::MultiplexedLog);
        assert_eq!(first.framing, Framing::Multiplexed);

        // a live-looking line afterwards is still parsed as multiplexed
        assert!(detector.tag("$GPHDT,123.4,T*31".into()).is_none());
        assert_eq!(detector.state(), DetectState::MultiplexedLog);
    }

    #[test]
    fn test_live_classification() {
        let mut detector = FormatDetector::new();
        let cases = [
            ("{\"updates\":[]}", 'I'),
            ("$GPHDT,123.4,T*31", 'N'),
            ("!AIVDM,1,1,,A,13aEOK?P00PD2wVMdLDRhgvL289?,0*26", 'N'),
            ("!PDGY,127250,2,36,255,0.0,AP8BAP//fw==", 'A'),
            ("2017-07-14T02:40:00.000Z,2,127250,36,255,8,00,ff,7f,ff,7f,ff,7f,fd", 'A'),
        ];
        for (line, expected) in cases {
            let tagged = detector.tag(line.to_string()).unwrap();
            assert_eq!(tagged.discriminator, expected, "{}", line);
            assert_eq!(tagged.framing, Framing::Live);
        }
        assert_eq!(detector.state(), DetectState::LiveMixed);
    }
}
