//! Normalized NMEA 2000 messages, CAN identifiers and fast-packet reassembly.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use super::pgns;

/// Destination address meaning "all devices".
pub const BROADCAST: u8 = 255;

fn broadcast() -> u8 {
    BROADCAST
}

/// One decoded NMEA 2000 message, whatever gateway it came through.
///
/// Field names are camelCase and values SI, the same shape the canboat
/// analyzer prints with `-json -si -camel`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PgnMessage {
    pub timestamp: String,
    #[serde(default)]
    pub prio: u8,
    pub pgn: u32,
    pub src: u8,
    #[serde(default = "broadcast")]
    pub dst: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

impl PgnMessage {
    /// Decode `data` (a complete payload) through the PGN table.
    pub fn decode(timestamp: String, id: CanId, data: &[u8]) -> Option<Self> {
        let (description, fields) = pgns::decode(id.pgn, data)?;
        Some(Self {
            timestamp,
            prio: id.prio,
            pgn: id.pgn,
            src: id.src,
            dst: id.dst,
            description: Some(description.to_string()),
            fields,
        })
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }
}

/// Parts of a 29-bit NMEA 2000 CAN identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanId {
    pub prio: u8,
    pub pgn: u32,
    pub src: u8,
    pub dst: u8,
}

impl CanId {
    pub fn from_raw(id: u32) -> Self {
        let prio = ((id >> 26) & 0x7) as u8;
        let src = (id & 0xFF) as u8;
        let pdu_format = (id >> 16) & 0xFF;
        let pdu_specific = ((id >> 8) & 0xFF) as u8;
        let mut pgn = (id >> 8) & 0x1FFFF;
        // PDU1: the low byte is a destination address, not part of the PGN
        let dst = if pdu_format < 240 {
            pgn &= 0x1FF00;
            pdu_specific
        } else {
            BROADCAST
        };
        Self { prio, pgn, src, dst }
    }

    /// Build from parts carried separately (iKonvert, Actisense text).
    pub fn new(prio: u8, pgn: u32, src: u8, dst: u8) -> Self {
        Self { prio, pgn, src, dst }
    }
}

#[derive(Debug)]
struct Partial {
    expected: usize,
    next_frame: u8,
    data: Vec<u8>,
}

/// Reassembles fast-packet PGNs from single CAN frames.
///
/// Frame 0 carries the sequence/frame counter, the total length and six
/// data bytes; every following frame carries the counter and seven bytes.
/// Transfers are keyed by source, PGN and sequence id.
#[derive(Debug, Default)]
pub struct FastPacketAssembler {
    partial: HashMap<(u8, u32, u8), Partial>,
}

impl FastPacketAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one frame. Returns the full payload once it is complete.
    pub fn push(&mut self, id: &CanId, data: &[u8]) -> Option<Vec<u8>> {
        if !pgns::is_fast_packet(id.pgn) {
            return Some(data.to_vec());
        }
        let (&counter, rest) = data.split_first()?;
        let sequence = counter >> 5;
        let frame = counter & 0x1F;
        let key = (id.src, id.pgn, sequence);

        if frame == 0 {
            let (&len, payload) = rest.split_first()?;
            let expected = len as usize;
            if payload.len() >= expected {
                self.partial.remove(&key);
                return Some(payload[..expected].to_vec());
            }
            self.partial.insert(
                key,
                Partial {
                    expected,
                    next_frame: 1,
                    data: payload.to_vec(),
                },
            );
            return None;
        }

        let partial = self.partial.get_mut(&key)?;
        if frame != partial.next_frame {
            debug!(
                "Fast packet {} from {}: expected frame {}, got {}",
                id.pgn, id.src, partial.next_frame, frame
            );
            self.partial.remove(&key);
            return None;
        }
        partial.data.extend_from_slice(rest);
        partial.next_frame += 1;
        if partial.data.len() >= partial.expected {
            let mut done = self.partial.remove(&key)?;
            done.data.truncate(done.expected);
            return Some(done.data);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_can_id_pdu2() {
        let id = CanId::from_raw(0x09F8017F);
        assert_eq!(id.pgn, 129025);
        assert_eq!(id.src, 0x7F);
        assert_eq!(id.prio, 2);
        assert_eq!(id.dst, BROADCAST);
    }

    #[test]
    fn test_can_id_pdu1() {
        // ISO request (59904) addressed to 0x23 from 0x05
        let id = CanId::from_raw(0x18EA2305);
        assert_eq!(id.pgn, 59904);
        assert_eq!(id.dst, 0x23);
        assert_eq!(id.src, 0x05);
        assert_eq!(id.prio, 6);
    }

    #[test]
    fn test_fast_packet_reassembly() {
        let mut assembler = FastPacketAssembler::new();
        let id = CanId::new(6, 127489, 0x10, BROADCAST);
        // 26 byte payload: frame 0 carries 6, frames 1-3 carry 7 each
        let payload: Vec<u8> = (0u8..26).collect();

        let mut frame0 = vec![0x40, 26];
        frame0.extend_from_slice(&payload[0..6]);
        assert!(assembler.push(&id, &frame0).is_none());

        for (i, chunk) in payload[6..].chunks(7).enumerate() {
            let mut frame = vec![0x40 | (i as u8 + 1)];
            frame.extend_from_slice(chunk);
            let done = assembler.push(&id, &frame);
            if i < 2 {
                assert!(done.is_none());
            } else {
                assert_eq!(done.unwrap(), payload);
            }
        }
    }

    #[test]
    fn test_fast_packet_out_of_order_dropped() {
        let mut assembler = FastPacketAssembler::new();
        let id = CanId::new(6, 127489, 0x10, BROADCAST);
        assert!(assembler.push(&id, &[0x20, 26, 0, 1, 2, 3, 4, 5]).is_none());
        assert!(assembler.push(&id, &[0x22, 0, 0, 0, 0, 0, 0, 0]).is_none());
        assert!(assembler.push(&id, &[0x21, 0, 0, 0, 0, 0, 0, 0]).is_none());
    }

    #[test]
    fn test_single_frame_passes() {
        let mut assembler = FastPacketAssembler::new();
        let id = CanId::from_raw(0x09F8017F);
        assert_eq!(assembler.push(&id, &[1, 2, 3]).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_analyzer_json_shape() {
        let line = r#"{"timestamp":"2017-07-14T02:40:00.000Z","prio":2,"src":36,"dst":255,"pgn":127250,"description":"Vessel Heading","fields":{"sid":0,"heading":1.2,"reference":"Magnetic"}}"#;
        let msg: PgnMessage = serde_json::from_str(line).unwrap();
        assert_eq!(msg.pgn, 127250);
        assert_eq!(msg.field("reference").and_then(Value::as_str), Some("Magnetic"));
    }
}
