//! PGN fields to Signal K paths.

use std::f64::consts::PI;

use serde_json::{json, Map, Value};
use signalk_core::PathValue;

use super::frame::PgnMessage;
use super::pgns::{ENGINE_STATUS_1, ENGINE_STATUS_2, MANUFACTURER_CODE};

fn num(fields: &Map<String, Value>, name: &str) -> Option<f64> {
    fields.get(name).and_then(Value::as_f64)
}

fn text<'a>(fields: &'a Map<String, Value>, name: &str) -> Option<&'a str> {
    fields.get(name).and_then(Value::as_str)
}

/// Lowercase alphanumerics only, so "Over Temperature" matches "overTemperature".
pub fn normalize_flag(name: &str) -> String {
    name.chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Path segment for an engine instance.
pub fn engine_instance(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) if s == "Single Engine or Dual Engine Port" => "port".into(),
        Some(Value::String(s)) if s == "Dual Engine Starboard" => "starboard".into(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => "0".into(),
    }
}

fn instance(fields: &Map<String, Value>) -> String {
    match fields.get("instance") {
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::String(s)) => s.clone(),
        _ => "0".into(),
    }
}

/// Angles in (-π, π].
fn signed_angle(angle: f64) -> f64 {
    if angle > PI {
        angle - 2.0 * PI
    } else {
        angle
    }
}

fn words(flag: &str) -> String {
    let mut out = String::new();
    for (i, c) in flag.chars().enumerate() {
        if i == 0 {
            out.push(c.to_ascii_uppercase());
        } else {
            if c.is_ascii_uppercase() {
                out.push(' ');
            }
            out.push(c);
        }
    }
    out
}

fn flags_set(value: Option<&Value>) -> Option<Vec<String>> {
    match value? {
        Value::Array(items) => Some(
            items
                .iter()
                .filter_map(Value::as_str)
                .map(normalize_flag)
                .collect(),
        ),
        Value::Object(map) => Some(map.keys().map(|k| normalize_flag(k)).collect()),
        Value::String(s) => Some(s.split(',').map(normalize_flag).collect()),
        _ => None,
    }
}

fn engine_notifications(engine: &str, fields: &Map<String, Value>, out: &mut Vec<PathValue>) {
    for (field, names) in [
        ("discreteStatus1", ENGINE_STATUS_1),
        ("discreteStatus2", ENGINE_STATUS_2),
    ] {
        let Some(set) = flags_set(fields.get(field)) else {
            continue;
        };
        for name in names {
            let active = set.contains(&normalize_flag(name));
            let value = if active {
                json!({
                    "state": "alarm",
                    "method": ["visual", "sound"],
                    "message": format!("Engine {}: {}", engine, words(name)),
                })
            } else {
                json!({
                    "state": "normal",
                    "method": [],
                    "message": format!("Engine {}: {}", engine, words(name)),
                })
            };
            out.push(PathValue::new(
                format!("notifications.propulsion.{}.{}", engine, name),
                value,
            ));
        }
    }
}

fn temperature_path(source: &str, instance: &str) -> Option<String> {
    let path = match source {
        "Sea Temperature" => "environment.water.temperature".to_string(),
        "Outside Temperature" => "environment.outside.temperature".to_string(),
        "Inside Temperature" => "environment.inside.temperature".to_string(),
        "Engine Room Temperature" => "environment.inside.engineRoom.temperature".to_string(),
        "Main Cabin Temperature" => "environment.inside.mainCabin.temperature".to_string(),
        "Live Well Temperature" => format!("tanks.liveWell.{}.temperature", instance),
        "Bait Well Temperature" => format!("tanks.baitWell.{}.temperature", instance),
        "Refrigeration Temperature" => "environment.inside.refrigerator.temperature".to_string(),
        "Heating System Temperature" => "environment.inside.heating.temperature".to_string(),
        "Dew Point Temperature" => "environment.outside.dewPointTemperature".to_string(),
        "Freezer Temperature" => "environment.inside.freezer.temperature".to_string(),
        "Exhaust Gas Temperature" => format!("propulsion.{}.exhaustTemperature", instance),
        _ => return None,
    };
    Some(path)
}

/// Manufacturer name for a numeric code, falling back to the number.
pub fn manufacturer_name(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => {
            let code = n.as_u64()?;
            Some(
                MANUFACTURER_CODE
                    .iter()
                    .find(|(c, _)| *c == code)
                    .map_or_else(|| code.to_string(), |(_, name)| name.to_string()),
            )
        }
        _ => None,
    }
}

/// 64-bit ISO NAME from an address claim, as 16 hex digits.
pub fn can_name(fields: &Map<String, Value>) -> Option<String> {
    let int = |name: &str| -> Option<u64> {
        match fields.get(name)? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => super::pgns::lookup_code(MANUFACTURER_CODE, s),
            _ => None,
        }
    };
    let unique = int("uniqueNumber")?;
    let manufacturer = int("manufacturerCode")?;
    let name = unique & 0x1F_FFFF
        | (manufacturer & 0x7FF) << 21
        | (int("deviceInstanceLower").unwrap_or(0) & 0x7) << 32
        | (int("deviceInstanceUpper").unwrap_or(0) & 0x1F) << 35
        | (int("deviceFunction").unwrap_or(0) & 0xFF) << 40
        | (int("deviceClass").unwrap_or(0) & 0x7F) << 49
        | (int("systemInstance").unwrap_or(0) & 0xF) << 56
        | (int("industryGroup").unwrap_or(0) & 0x7) << 60
        | (int("arbitraryAddressCapable").unwrap_or(0) & 0x1) << 63;
    Some(format!("{:016x}", name))
}

/// Signal K values carried by one message. Empty for PGNs with no mapping.
pub fn to_values(msg: &PgnMessage) -> Vec<PathValue> {
    let f = &msg.fields;
    let mut out = Vec::new();
    let mut push = |path: String, value: Option<f64>| {
        if let Some(v) = value {
            out.push(PathValue::new(path, v));
        }
    };

    match msg.pgn {
        127245 => push("steering.rudderAngle".into(), num(f, "position")),
        127250 => {
            let path = match text(f, "reference") {
                Some("True") => "navigation.headingTrue",
                _ => "navigation.headingMagnetic",
            };
            push(path.into(), num(f, "heading"));
            push("navigation.magneticDeviation".into(), num(f, "deviation"));
            push("navigation.magneticVariation".into(), num(f, "variation"));
        }
        127488 => {
            let engine = engine_instance(f.get("instance"));
            push(
                format!("propulsion.{}.revolutions", engine),
                num(f, "speed").map(|rpm| rpm / 60.0),
            );
            push(format!("propulsion.{}.boostPressure", engine), num(f, "boostPressure"));
            push(
                format!("propulsion.{}.drive.trimState", engine),
                num(f, "tiltTrim").map(|p| p / 100.0),
            );
        }
        127489 => {
            let engine = engine_instance(f.get("instance"));
            let p = |name: &str| format!("propulsion.{}.{}", engine, name);
            push(p("oilPressure"), num(f, "oilPressure"));
            push(p("oilTemperature"), num(f, "oilTemperature"));
            push(p("temperature"), num(f, "temperature"));
            push(p("alternatorVoltage"), num(f, "alternatorPotential"));
            // L/h to m³/s
            push(p("fuel.rate"), num(f, "fuelRate").map(|r| r / 3_600_000.0));
            push(p("runTime"), num(f, "totalEngineHours"));
            push(p("coolantPressure"), num(f, "coolantPressure"));
            push(p("fuel.pressure"), num(f, "fuelPressure"));
            push(p("engineLoad"), num(f, "engineLoad").map(|v| v / 100.0));
            push(p("engineTorque"), num(f, "engineTorque").map(|v| v / 100.0));
            engine_notifications(&engine, f, &mut out);
        }
        127508 => {
            let battery = format!("electrical.batteries.{}", instance(f));
            push(format!("{}.voltage", battery), num(f, "voltage"));
            push(format!("{}.current", battery), num(f, "current"));
            push(format!("{}.temperature", battery), num(f, "temperature"));
        }
        128259 => {
            push("navigation.speedThroughWater".into(), num(f, "speedWaterReferenced"));
        }
        128267 => {
            let depth = num(f, "depth");
            push("environment.depth.belowTransducer".into(), depth);
            if let (Some(depth), Some(offset)) = (depth, num(f, "offset")) {
                if offset > 0.0 {
                    push("environment.depth.surfaceToTransducer".into(), Some(offset));
                    push("environment.depth.belowSurface".into(), Some(depth + offset));
                } else if offset < 0.0 {
                    push("environment.depth.transducerToKeel".into(), Some(offset));
                    push("environment.depth.belowKeel".into(), Some(depth + offset));
                }
            }
        }
        129025 => {
            if let (Some(latitude), Some(longitude)) = (num(f, "latitude"), num(f, "longitude")) {
                out.push(PathValue::new(
                    "navigation.position",
                    json!({"latitude": latitude, "longitude": longitude}),
                ));
            }
        }
        129026 => {
            let path = match text(f, "cogReference") {
                Some("Magnetic") => "navigation.courseOverGroundMagnetic",
                _ => "navigation.courseOverGroundTrue",
            };
            push(path.into(), num(f, "cog"));
            push("navigation.speedOverGround".into(), num(f, "sog"));
        }
        130306 => {
            let speed = num(f, "windSpeed");
            let angle = num(f, "windAngle");
            match text(f, "reference") {
                Some("Apparent") => {
                    push("environment.wind.speedApparent".into(), speed);
                    push("environment.wind.angleApparent".into(), angle.map(signed_angle));
                }
                Some("True (boat referenced)") => {
                    push("environment.wind.speedOverGround".into(), speed);
                    push("environment.wind.angleTrueGround".into(), angle.map(signed_angle));
                }
                Some("True (water referenced)") => {
                    push("environment.wind.speedTrue".into(), speed);
                    push("environment.wind.angleTrueWater".into(), angle.map(signed_angle));
                }
                Some("True (ground referenced to North)") => {
                    push("environment.wind.speedOverGround".into(), speed);
                    push("environment.wind.directionTrue".into(), angle);
                }
                Some("Magnetic (ground referenced to Magnetic North)") => {
                    push("environment.wind.speedOverGround".into(), speed);
                    push("environment.wind.directionMagnetic".into(), angle);
                }
                _ => {}
            }
        }
        130312 => {
            if let Some(path) = text(f, "source").and_then(|s| temperature_path(s, &instance(f))) {
                push(path, num(f, "actualTemperature"));
            }
        }
        _ => {}
    }
    out
}
