//! Text encodings of NMEA 2000 traffic written by common gateways.
//!
//! [`CanLineParser`] recognises each line on its own, so one stream may mix
//! encodings. Single CAN frames go through fast-packet reassembly; gateways
//! that already deliver whole messages are decoded directly.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use regex::Regex;
use tracing::{debug, warn};

use super::frame::{CanId, FastPacketAssembler, PgnMessage, BROADCAST};
use crate::error::{ProviderError, Result};
use crate::record::{iso_timestamp, now_ms, Record};
use crate::stage::Transform;

/// Encoding of one line, as recognised by [`CanLineParser::detect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineFormat {
    /// canboat / Actisense text: `ts,prio,pgn,src,dst,len,hex,...`
    Actisense,
    /// Linux candump, either the `can0 ID [n] ..` or `(ts) can0 ID#hex` form.
    Candump,
    /// Yacht Devices RAW: `hh:mm:ss.sss R ID bytes...`
    YdRaw,
    /// Digital Yacht iKonvert: `!PDGY,pgn,prio,src,dst,timer,base64`
    IKonvert,
    /// NMEA 2000 wrapped in NMEA 0183: `$PCDIN,pgn,timer,src,hex*hh`
    Pcdin,
}

fn hex_bytes<'a>(parts: impl Iterator<Item = &'a str>) -> Option<Vec<u8>> {
    parts
        .map(|p| u8::from_str_radix(p.trim(), 16).ok())
        .collect()
}

/// Parses gateway text into [`PgnMessage`]s.
#[derive(Debug)]
pub struct CanLineParser {
    candump_spaced: Regex,
    candump_compact: Regex,
    assembler: FastPacketAssembler,
}

impl CanLineParser {
    pub fn new() -> Result<Self> {
        let candump_spaced = Regex::new(r"^\s*\w+\s+([0-9A-Fa-f]{8})\s+\[(\d)\]\s+((?:[0-9A-Fa-f]{2}\s*)*)$")
            .map_err(|e| ProviderError::config(e.to_string()))?;
        let candump_compact = Regex::new(r"^\(([\d.]+)\)\s+\w+\s+([0-9A-Fa-f]{8})#([0-9A-Fa-f]*)$")
            .map_err(|e| ProviderError::config(e.to_string()))?;
        Ok(Self {
            candump_spaced,
            candump_compact,
            assembler: FastPacketAssembler::new(),
        })
    }

    pub fn detect(&self, line: &str) -> Option<LineFormat> {
        if line.starts_with("!PDGY,") {
            Some(LineFormat::IKonvert)
        } else if line.starts_with("$PCDIN,") {
            Some(LineFormat::Pcdin)
        } else if self.candump_compact.is_match(line) || self.candump_spaced.is_match(line) {
            Some(LineFormat::Candump)
        } else if is_ydraw(line) {
            Some(LineFormat::YdRaw)
        } else if line.split(',').count() >= 7 {
            Some(LineFormat::Actisense)
        } else {
            None
        }
    }

    /// Parse one line received at `received_ms`. Returns `None` for
    /// unrecognised lines, PGNs outside the table and unfinished fast packets.
    pub fn parse(&mut self, line: &str, received_ms: i64) -> Option<PgnMessage> {
        let line = line.trim();
        match self.detect(line)? {
            LineFormat::Actisense => parse_actisense(line),
            LineFormat::IKonvert => parse_ikonvert(line, received_ms),
            LineFormat::Pcdin => parse_pcdin(line),
            LineFormat::Candump => {
                let (ts, id, data) = self.parse_candump(line, received_ms)?;
                self.frame(ts, id, &data)
            }
            LineFormat::YdRaw => {
                let (id, data) = parse_ydraw(line)?;
                self.frame(received_ms, id, &data)
            }
        }
    }

    fn frame(&mut self, ts_ms: i64, raw_id: u32, data: &[u8]) -> Option<PgnMessage> {
        let id = CanId::from_raw(raw_id);
        let payload = self.assembler.push(&id, data)?;
        PgnMessage::decode(iso_timestamp(ts_ms), id, &payload)
    }

    fn parse_candump(&self, line: &str, received_ms: i64) -> Option<(i64, u32, Vec<u8>)> {
        if let Some(caps) = self.candump_compact.captures(line) {
            let ts = caps[1]
                .parse::<f64>()
                .map(|secs| (secs * 1000.0) as i64)
                .unwrap_or(received_ms);
            let id = u32::from_str_radix(&caps[2], 16).ok()?;
            let data = hex::decode(&caps[3]).ok()?;
            return Some((ts, id, data));
        }
        let caps = self.candump_spaced.captures(line)?;
        let id = u32::from_str_radix(&caps[1], 16).ok()?;
        let len: usize = caps[2].parse().ok()?;
        let data = hex_bytes(caps[3].split_whitespace())?;
        if data.len() != len {
            debug!("candump length mismatch: {}", line);
            return None;
        }
        Some((received_ms, id, data))
    }
}

fn is_ydraw(line: &str) -> bool {
    let mut parts = line.split_whitespace();
    let time = parts.next().unwrap_or_default();
    let direction = parts.next().unwrap_or_default();
    time.len() >= 8
        && time.as_bytes()[2] == b':'
        && (direction == "R" || direction == "T")
        && parts.next().map_or(false, |id| id.len() == 8)
}

fn parse_ydraw(line: &str) -> Option<(u32, Vec<u8>)> {
    let mut parts = line.split_whitespace().skip(2);
    let id = u32::from_str_radix(parts.next()?, 16).ok()?;
    Some((id, hex_bytes(parts)?))
}

fn parse_actisense(line: &str) -> Option<PgnMessage> {
    let parts: Vec<&str> = line.split(',').collect();
    let prio = parts[1].trim().parse().ok()?;
    let pgn = parts[2].trim().parse().ok()?;
    let src = parts[3].trim().parse().ok()?;
    let dst = parts[4].trim().parse().ok()?;
    let len: usize = parts[5].trim().parse().ok()?;
    let data = hex_bytes(parts[6..].iter().copied())?;
    if data.len() < len {
        debug!("Actisense line shorter than its length field: {}", line);
        return None;
    }
    PgnMessage::decode(
        parts[0].trim().to_string(),
        CanId::new(prio, pgn, src, dst),
        &data[..len],
    )
}

fn parse_ikonvert(line: &str, received_ms: i64) -> Option<PgnMessage> {
    let parts: Vec<&str> = line.split(',').collect();
    if parts.len() < 7 {
        return None;
    }
    let pgn = parts[1].parse().ok()?;
    let prio = parts[2].parse().ok()?;
    let src = parts[3].parse().ok()?;
    let dst = parts[4].parse().ok()?;
    let data = match BASE64.decode(parts[6].trim()) {
        Ok(data) => data,
        Err(e) => {
            warn!("Invalid iKonvert payload {}: {}", line, e);
            return None;
        }
    };
    PgnMessage::decode(
        iso_timestamp(received_ms),
        CanId::new(prio, pgn, src, dst),
        &data,
    )
}

/// Decode a `$PCDIN` sentence. The checksum is not checked here.
pub fn parse_pcdin(sentence: &str) -> Option<PgnMessage> {
    let body = sentence.split('*').next()?;
    let parts: Vec<&str> = body.split(',').collect();
    if parts.len() < 5 || parts[0] != "$PCDIN" {
        return None;
    }
    let pgn = u32::from_str_radix(parts[1], 16).ok()?;
    let timer = u32::from_str_radix(parts[2], 16).ok()?;
    let src = u8::from_str_radix(parts[3], 16).ok()?;
    let data = hex::decode(parts[4]).ok()?;
    let ts = if timer == 0 { now_ms() } else { timer as i64 * 1000 };
    PgnMessage::decode(iso_timestamp(ts), CanId::new(3, pgn, src, BROADCAST), &data)
}

impl Transform for CanLineParser {
    fn name(&self) -> &str {
        "can-line-parser"
    }

    fn handle_read(&mut self, record: Record, out: &mut Vec<Record>) {
        match record {
            Record::Line(line) => out.extend(self.parse(&line, now_ms()).map(Record::Pgn)),
            other => out.push(other),
        }
    }
}
