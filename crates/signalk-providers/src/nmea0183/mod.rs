//! NMEA 0183 sentence decoding.

pub mod sentences;

use serde::Deserialize;
use signalk_core::{Delta, Source, Update};
use tracing::{debug, warn};

use crate::app::{AppHandle, ProviderEvent};
use crate::n2k::parse_pcdin;
use crate::record::{iso_timestamp, now_ms, Record};
use crate::stage::Transform;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Nmea0183Options {
    #[serde(default = "default_true")]
    pub validate_checksum: bool,
    #[serde(default)]
    pub append_checksum: bool,
}

fn default_true() -> bool {
    true
}

impl Default for Nmea0183Options {
    fn default() -> Self {
        Self {
            validate_checksum: true,
            append_checksum: false,
        }
    }
}

/// XOR of every byte between the start delimiter and `*`.
pub fn checksum(body: &str) -> u8 {
    body.bytes().fold(0, |acc, b| acc ^ b)
}

/// Split an optional `\c:<secs>,...*hh\` tag block off a sentence.
/// Returns the tag timestamp in milliseconds and the sentence.
pub fn strip_tag_block(line: &str) -> (Option<i64>, &str) {
    let Some(rest) = line.strip_prefix('\\') else {
        return (None, line);
    };
    let Some((tags, sentence)) = rest.split_once('\\') else {
        return (None, line);
    };
    let tags = tags.split('*').next().unwrap_or_default();
    let timestamp = tags
        .split(',')
        .find_map(|tag| tag.strip_prefix("c:"))
        .and_then(|c| c.parse::<i64>().ok())
        // some writers use milliseconds
        .and_then(|c| if c > 100_000_000_000 { Some(c) } else { c.checked_mul(1000) });
    (timestamp, sentence)
}

/// Decodes sentences into deltas for one provider.
#[derive(Debug)]
pub struct Nmea0183Decoder {
    provider_id: String,
    options: Nmea0183Options,
    app: AppHandle,
}

impl Nmea0183Decoder {
    pub fn new(provider_id: &str, options: Nmea0183Options, app: AppHandle) -> Self {
        Self {
            provider_id: provider_id.to_string(),
            options,
            app,
        }
    }

    /// Check or repair the checksum. Returns the sentence without `*hh`.
    fn verify<'a>(&self, sentence: &'a str) -> Option<&'a str> {
        let body = &sentence[1..];
        match body.rsplit_once('*') {
            Some((data, given)) => {
                if self.options.validate_checksum {
                    let expected = checksum(data);
                    let ok = u8::from_str_radix(given.trim(), 16).map_or(false, |g| g == expected);
                    if !ok {
                        debug!("{}: checksum mismatch in {}", self.provider_id, sentence);
                        return None;
                    }
                }
                Some(data)
            }
            None if self.options.append_checksum || !self.options.validate_checksum => Some(body),
            None => {
                debug!("{}: sentence without checksum: {}", self.provider_id, sentence);
                None
            }
        }
    }

    /// Decode one line. `record_ms` is the timestamp of a multiplexed record;
    /// live lines use the tag block or the wall clock.
    pub fn decode(&self, line: &str, record_ms: Option<i64>) -> Option<Record> {
        let (tag_ms, sentence) = strip_tag_block(line.trim());
        if !(sentence.starts_with('$') || sentence.starts_with('!')) || sentence.len() < 6 {
            debug!("{}: not an NMEA 0183 sentence: {}", self.provider_id, line);
            return None;
        }
        let data = self.verify(sentence)?;
        let full = format!("{}{}*{:02X}", &sentence[..1], data, checksum(data));
        self.app.publish(ProviderEvent::Nmea0183 {
            provider_id: self.provider_id.clone(),
            sentence: full.clone(),
        });

        let mut fields = data.split(',');
        let address = fields.next().unwrap_or_default();
        if address == "PCDIN" {
            return parse_pcdin(&full).map(Record::Pgn);
        }
        if address.len() < 5 || !address.is_ascii() {
            return None;
        }
        let (talker, kind) = address.split_at(address.len() - 3);
        let fields: Vec<&str> = fields.collect();
        let values = match sentences::values(kind, &fields) {
            Some(values) => values,
            None => {
                debug!("{}: no mapping for {}", self.provider_id, kind);
                return None;
            }
        };
        if values.is_empty() {
            return None;
        }

        let ts = tag_ms.or(record_ms).unwrap_or_else(now_ms);
        let source = Source::nmea0183(&self.provider_id, talker, kind);
        Some(Record::Delta(Delta::single(
            None,
            Update::from_source(source, Some(iso_timestamp(ts)), values),
        )))
    }
}

impl Transform for Nmea0183Decoder {
    fn name(&self) -> &str {
        "nmea0183"
    }

    fn handle_read(&mut self, record: Record, out: &mut Vec<Record>) {
        match record {
            Record::Line(line) => out.extend(self.decode(&line, None)),
            other => out.push(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::TryRecvError;

    fn decoder(options: Nmea0183Options) -> (Nmea0183Decoder, AppHandle) {
        let (app, _rx) = AppHandle::channel(16);
        (Nmea0183Decoder::new("gps", options, app.clone()), app)
    }

    fn delta(record: Option<Record>) -> Delta {
        match record {
            Some(Record::Delta(delta)) => delta,
            other => panic!("expected a delta, got {:?}", other),
        }
    }

    #[test]
    fn test_checksum() {
        assert_eq!(checksum("GPHDT,123.4,T"), 0x31);
    }

    #[test]
    fn test_decode_with_source() {
        let (decoder, app) = decoder(Nmea0183Options::default());
        let mut events = app.subscribe_events();
        let d = delta(decoder.decode("$GPHDT,123.4,T*31", Some(1_500_000_000_000)));
        let update = &d.updates[0];
        assert_eq!(update.timestamp.as_deref(), Some("2017-07-14T02:40:00.000Z"));
        let source = update.source.as_ref().unwrap();
        assert_eq!(source.label, "gps");
        assert_eq!(source.talker.as_deref(), Some("GP"));
        assert_eq!(source.sentence.as_deref(), Some("HDT"));
        assert_eq!(update.values[0].path, "navigation.headingTrue");

        match events.try_recv().unwrap() {
            ProviderEvent::Nmea0183 { sentence, .. } => assert_eq!(sentence, "$GPHDT,123.4,T*31"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_bad_checksum_dropped() {
        let (decoder, app) = decoder(Nmea0183Options::default());
        let mut events = app.subscribe_events();
        assert!(decoder.decode("$GPHDT,123.4,T*00", None).is_none());
        assert!(decoder.decode("$GPHDT,123.4,T", None).is_none());
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn test_append_checksum() {
        let (decoder, app) = decoder(Nmea0183Options {
            validate_checksum: true,
            append_checksum: true,
        });
        let mut events = app.subscribe_events();
        assert!(decoder.decode("$GPHDT,123.4,T", None).is_some());
        match events.try_recv().unwrap() {
            ProviderEvent::Nmea0183 { sentence, .. } => assert_eq!(sentence, "$GPHDT,123.4,T*31"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_tag_block_timestamp() {
        let (decoder, _app) = decoder(Nmea0183Options::default());
        let d = delta(decoder.decode("\\s:r003669,c:1500000000*4F\\$GPHDT,123.4,T*31", Some(1)));
        assert_eq!(d.updates[0].timestamp.as_deref(), Some("2017-07-14T02:40:00.000Z"));
    }

    #[test]
    fn test_out_of_range_tag_timestamp_ignored() {
        let line = "\\c:-9999999999999999*00\\$GPHDT,123.4,T*31";
        assert_eq!(strip_tag_block(line), (None, "$GPHDT,123.4,T*31"));

        let (decoder, _app) = decoder(Nmea0183Options::default());
        let d = delta(decoder.decode(line, Some(1_700_000_000_000)));
        assert_eq!(d.updates[0].timestamp.as_deref(), Some("2023-11-14T22:13:20.000Z"));
    }

    #[test]
    fn test_ais_is_published_without_delta() {
        let (decoder, app) = decoder(Nmea0183Options::default());
        let mut events = app.subscribe_events();
        let sentence = "!AIVDM,1,1,,A,13aEOK?P00PD2wVMdLDRhgvL289?,0*26";
        let data = &sentence[1..sentence.len() - 3];
        let sentence = format!("!{}*{:02X}", data, checksum(data));
        assert!(decoder.decode(&sentence, None).is_none());
        assert!(events.try_recv().is_ok());
    }

    #[test]
    fn test_pcdin_becomes_pgn() {
        let (decoder, _app) = decoder(Nmea0183Options::default());
        let data = "PCDIN,01F112,00000000,24,003930FF7F0CFEFD";
        let sentence = format!("${}*{:02X}", data, checksum(data));
        match decoder.decode(&sentence, None) {
            Some(Record::Pgn(msg)) => assert_eq!(msg.pgn, 127250),
            other => panic!("expected a PGN, got {:?}", other),
        }
    }
}
