//! Sentence bodies to Signal K values.
//!
//! Every parser takes the comma separated fields after the sentence address
//! and returns the values it could read. Empty fields are skipped.

use std::f64::consts::PI;

use chrono::{NaiveDate, NaiveTime, TimeZone, Utc};
use serde_json::json;
use signalk_core::PathValue;

const KNOTS_TO_MS: f64 = 1852.0 / 3600.0;
const KMH_TO_MS: f64 = 1.0 / 3.6;
const FEET_TO_M: f64 = 0.3048;
const FATHOMS_TO_M: f64 = 1.8288;
const CELSIUS_TO_KELVIN: f64 = 273.15;

fn rad(deg: f64) -> f64 {
    deg * PI / 180.0
}

fn field<'a>(fields: &[&'a str], i: usize) -> Option<&'a str> {
    fields.get(i).copied().filter(|f| !f.is_empty())
}

fn number(fields: &[&str], i: usize) -> Option<f64> {
    field(fields, i)?.parse().ok()
}

/// `ddmm.mmm` / `dddmm.mmm` plus hemisphere to signed decimal degrees.
fn coordinate(value: Option<&str>, hemisphere: Option<&str>) -> Option<f64> {
    let value = value?;
    let dot = value.find('.').unwrap_or(value.len());
    if dot < 2 {
        return None;
    }
    let degrees: f64 = value[..dot - 2].parse().ok()?;
    let minutes: f64 = value[dot - 2..].parse().ok()?;
    let decimal = degrees + minutes / 60.0;
    match hemisphere? {
        "N" | "E" => Some(decimal),
        "S" | "W" => Some(-decimal),
        _ => None,
    }
}

fn position(fields: &[&str], lat: usize) -> Option<PathValue> {
    let latitude = coordinate(field(fields, lat), field(fields, lat + 1))?;
    let longitude = coordinate(field(fields, lat + 2), field(fields, lat + 3))?;
    Some(PathValue::new(
        "navigation.position",
        json!({"latitude": latitude, "longitude": longitude}),
    ))
}

fn time_of_day(value: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(value, "%H%M%S%.f")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H%M%S"))
        .ok()
}

fn datetime(date: NaiveDate, time: &str) -> Option<PathValue> {
    let naive = date.and_time(time_of_day(time)?);
    let iso = Utc
        .from_utc_datetime(&naive)
        .to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
    Some(PathValue::new("navigation.datetime", iso))
}

/// Signed variation: west is negative.
fn variation(fields: &[&str], i: usize) -> Option<f64> {
    let value = rad(number(fields, i)?);
    match field(fields, i + 1) {
        Some("W") => Some(-value),
        _ => Some(value),
    }
}

fn push(out: &mut Vec<PathValue>, path: &str, value: Option<f64>) {
    if let Some(value) = value {
        out.push(PathValue::new(path, value));
    }
}

fn depth_with_offset(out: &mut Vec<PathValue>, depth: f64, offset: Option<f64>) {
    out.push(PathValue::new("environment.depth.belowTransducer", depth));
    match offset {
        Some(offset) if offset > 0.0 => {
            out.push(PathValue::new("environment.depth.surfaceToTransducer", offset));
            out.push(PathValue::new("environment.depth.belowSurface", depth + offset));
        }
        Some(offset) if offset < 0.0 => {
            out.push(PathValue::new("environment.depth.transducerToKeel", offset));
            out.push(PathValue::new("environment.depth.belowKeel", depth + offset));
        }
        _ => {}
    }
}

fn rmc(f: &[&str]) -> Vec<PathValue> {
    let mut out = Vec::new();
    if field(f, 1) != Some("A") {
        return out;
    }
    out.extend(position(f, 2));
    push(&mut out, "navigation.speedOverGround", number(f, 6).map(|kn| kn * KNOTS_TO_MS));
    push(&mut out, "navigation.courseOverGroundTrue", number(f, 7).map(rad));
    let date = field(f, 8).and_then(|d| NaiveDate::parse_from_str(d, "%d%m%y").ok());
    if let (Some(date), Some(time)) = (date, field(f, 0)) {
        out.extend(datetime(date, time));
    }
    push(&mut out, "navigation.magneticVariation", variation(f, 9));
    out
}

fn gga(f: &[&str]) -> Vec<PathValue> {
    let mut out = Vec::new();
    let quality = number(f, 5).map(|q| q as u64).unwrap_or(0);
    let method = match quality {
        1 => "GNSS Fix",
        2 => "DGNSS fix",
        3 => "Precise GNSS",
        4 => "RTK fixed integer",
        5 => "RTK float",
        6 => "Estimated (DR) mode",
        7 => "Manual input",
        8 => "Simulator mode",
        _ => "no GPS",
    };
    out.push(PathValue::new("navigation.gnss.methodQuality", method));
    if quality == 0 {
        return out;
    }
    out.extend(position(f, 1));
    push(&mut out, "navigation.gnss.satellites", number(f, 6));
    push(&mut out, "navigation.gnss.horizontalDilution", number(f, 7));
    push(&mut out, "navigation.gnss.antennaAltitude", number(f, 8));
    push(&mut out, "navigation.gnss.geoidalSeparation", number(f, 10));
    out
}

fn gll(f: &[&str]) -> Vec<PathValue> {
    match field(f, 5) {
        Some("A") | None => position(f, 0).into_iter().collect(),
        _ => Vec::new(),
    }
}

fn vtg(f: &[&str]) -> Vec<PathValue> {
    let mut out = Vec::new();
    push(&mut out, "navigation.courseOverGroundTrue", number(f, 0).map(rad));
    push(&mut out, "navigation.courseOverGroundMagnetic", number(f, 2).map(rad));
    let sog = number(f, 4)
        .map(|kn| kn * KNOTS_TO_MS)
        .or_else(|| number(f, 6).map(|kmh| kmh * KMH_TO_MS));
    push(&mut out, "navigation.speedOverGround", sog);
    out
}

fn hdg(f: &[&str]) -> Vec<PathValue> {
    let mut out = Vec::new();
    push(&mut out, "navigation.headingMagnetic", number(f, 0).map(rad));
    push(&mut out, "navigation.magneticDeviation", variation(f, 1));
    push(&mut out, "navigation.magneticVariation", variation(f, 3));
    out
}

fn dbt(f: &[&str]) -> Vec<PathValue> {
    let depth = number(f, 2)
        .or_else(|| number(f, 0).map(|ft| ft * FEET_TO_M))
        .or_else(|| number(f, 4).map(|fa| fa * FATHOMS_TO_M));
    depth
        .map(|d| vec![PathValue::new("environment.depth.belowTransducer", d)])
        .unwrap_or_default()
}

fn dpt(f: &[&str]) -> Vec<PathValue> {
    let mut out = Vec::new();
    if let Some(depth) = number(f, 0) {
        depth_with_offset(&mut out, depth, number(f, 1));
    }
    out
}

fn mwv(f: &[&str]) -> Vec<PathValue> {
    let mut out = Vec::new();
    if field(f, 4) == Some("V") {
        return out;
    }
    let speed = number(f, 2).and_then(|s| match field(f, 3) {
        Some("N") => Some(s * KNOTS_TO_MS),
        Some("K") => Some(s * KMH_TO_MS),
        Some("M") => Some(s),
        _ => None,
    });
    let angle = number(f, 0).map(|deg| {
        let a = rad(deg);
        if a > PI {
            a - 2.0 * PI
        } else {
            a
        }
    });
    match field(f, 1) {
        Some("R") => {
            push(&mut out, "environment.wind.angleApparent", angle);
            push(&mut out, "environment.wind.speedApparent", speed);
        }
        Some("T") => {
            push(&mut out, "environment.wind.angleTrueWater", angle);
            push(&mut out, "environment.wind.speedTrue", speed);
        }
        _ => {}
    }
    out
}

fn mtw(f: &[&str]) -> Vec<PathValue> {
    let mut out = Vec::new();
    push(
        &mut out,
        "environment.water.temperature",
        number(f, 0).map(|c| c + CELSIUS_TO_KELVIN),
    );
    out
}

fn vhw(f: &[&str]) -> Vec<PathValue> {
    let mut out = Vec::new();
    push(&mut out, "navigation.headingTrue", number(f, 0).map(rad));
    push(&mut out, "navigation.headingMagnetic", number(f, 2).map(rad));
    let stw = number(f, 4)
        .map(|kn| kn * KNOTS_TO_MS)
        .or_else(|| number(f, 6).map(|kmh| kmh * KMH_TO_MS));
    push(&mut out, "navigation.speedThroughWater", stw);
    out
}

fn zda(f: &[&str]) -> Vec<PathValue> {
    let date = (|| {
        let day = field(f, 1)?.parse().ok()?;
        let month = field(f, 2)?.parse().ok()?;
        let year = field(f, 3)?.parse().ok()?;
        NaiveDate::from_ymd_opt(year, month, day)
    })();
    match (date, field(f, 0)) {
        (Some(date), Some(time)) => datetime(date, time).into_iter().collect(),
        _ => Vec::new(),
    }
}

/// Values for sentence type `kind`, or `None` when the type is not supported.
pub fn values(kind: &str, fields: &[&str]) -> Option<Vec<PathValue>> {
    let values = match kind {
        "RMC" => rmc(fields),
        "GGA" => gga(fields),
        "GLL" => gll(fields),
        "VTG" => vtg(fields),
        "HDG" => hdg(fields),
        "HDT" => {
            let mut out = Vec::new();
            push(&mut out, "navigation.headingTrue", number(fields, 0).map(rad));
            out
        }
        "HDM" => {
            let mut out = Vec::new();
            push(&mut out, "navigation.headingMagnetic", number(fields, 0).map(rad));
            out
        }
        "DBT" => dbt(fields),
        "DPT" => dpt(fields),
        "MWV" => mwv(fields),
        "MTW" => mtw(fields),
        "VHW" => vhw(fields),
        "ZDA" => zda(fields),
        _ => return None,
    };
    Some(values)
}
