//! Routes tagged lines to the decoder for their discriminator.

use serde_json::Value;
use signalk_core::Delta;
use tracing::{debug, warn};

use crate::detect::{DISC_N2K, DISC_NMEA0183, DISC_SIGNALK};
use crate::n2k::CanLineParser;
use crate::nmea0183::Nmea0183Decoder;
use crate::record::{iso_timestamp, Framing, Record, TaggedLine};
use crate::stage::Transform;

/// Discriminators that carry NMEA 0183 besides `N`.
const NMEA0183_ALIASES: [char; 3] = ['C', 'G', 'M'];

pub struct Demux {
    nmea0183: Nmea0183Decoder,
    can: CanLineParser,
}

impl Demux {
    pub fn new(nmea0183: Nmea0183Decoder, can: CanLineParser) -> Self {
        Self { nmea0183, can }
    }

    fn signalk(&self, tagged: &TaggedLine) -> Option<Delta> {
        let json: Value = match serde_json::from_str(&tagged.payload) {
            Ok(json) => json,
            Err(e) => {
                debug!("Unparsable Signal K record: {}", e);
                return None;
            }
        };
        if json.get("updates").is_none() {
            return None;
        }
        let mut delta: Delta = match serde_json::from_value(json) {
            Ok(delta) => delta,
            Err(e) => {
                warn!("Invalid delta {}: {}", tagged.payload, e);
                return None;
            }
        };
        let timestamp = iso_timestamp(tagged.timestamp_ms);
        for update in &mut delta.updates {
            update.timestamp = Some(timestamp.clone());
        }
        Some(delta)
    }

    pub fn route(&mut self, tagged: TaggedLine) -> Option<Record> {
        let record_ms = match tagged.framing {
            Framing::Multiplexed => Some(tagged.timestamp_ms),
            Framing::Live => None,
        };
        match tagged.discriminator {
            DISC_SIGNALK => self.signalk(&tagged).map(Record::Delta),
            DISC_NMEA0183 => self.nmea0183.decode(&tagged.payload, record_ms),
            d if NMEA0183_ALIASES.contains(&d) => self.nmea0183.decode(&tagged.payload, record_ms),
            DISC_N2K => self
                .can
                .parse(&tagged.payload, tagged.timestamp_ms)
                .map(Record::Pgn),
            other => {
                debug!("Unknown discriminator '{}', dropping record", other);
                None
            }
        }
    }
}

impl Transform for Demux {
    fn name(&self) -> &str {
        "demux"
    }

    fn handle_read(&mut self, record: Record, out: &mut Vec<Record>) {
        match record {
            Record::Tagged(tagged) => out.extend(self.route(tagged)),
            other => out.push(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::AppHandle;
    use crate::nmea0183::Nmea0183Options;

    fn demux() -> Demux {
        let (app, _rx) = AppHandle::channel(16);
        Demux::new(
            Nmea0183Decoder::new("log", Nmea0183Options::default(), app),
            CanLineParser::new().unwrap(),
        )
    }

    fn tagged(discriminator: char, payload: &str) -> TaggedLine {
        TaggedLine {
            timestamp_ms: 1_500_000_000_000,
            discriminator,
            payload: payload.to_string(),
            framing: Framing::Multiplexed,
        }
    }

    #[test]
    fn test_signalk_record_takes_record_timestamp() {
        let payload = r#"{"updates":[{"source":{"label":"x"},"timestamp":"2020-01-01T00:00:00Z","values":[{"path":"a.b","value":1}]},{"values":[{"path":"c","value":2}]}]}"#;
        let Some(Record::Delta(delta)) = demux().route(tagged('I', payload)) else {
            panic!("expected a delta");
        };
        assert_eq!(delta.updates.len(), 2);
        for update in &delta.updates {
            assert_eq!(update.timestamp.as_deref(), Some("2017-07-14T02:40:00.000Z"));
        }
        assert_eq!(delta.updates[0].values[0].path, "a.b");
    }

    #[test]
    fn test_non_delta_json_ignored() {
        assert!(demux().route(tagged('I', r#"{"name":"hello","version":"1.7.0"}"#)).is_none());
        assert!(demux().route(tagged('I', "{broken")).is_none());
    }

    #[test]
    fn test_routes() {
        let mut demux = demux();
        assert!(matches!(
            demux.route(tagged('N', "$GPHDT,123.4,T*31")),
            Some(Record::Delta(_))
        ));
        assert!(matches!(
            demux.route(tagged('G', "$GPHDT,123.4,T*31")),
            Some(Record::Delta(_))
        ));
        assert!(matches!(
            demux.route(tagged('A', "2017-07-14T02:40:00.000Z,2,127250,36,255,8,00,39,30,ff,7f,0c,fe,fd")),
            Some(Record::Pgn(_))
        ));
        assert!(demux.route(tagged('Z', "whatever")).is_none());
    }
}
