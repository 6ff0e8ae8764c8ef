//! PGN descriptions and the payload decoder.
//!
//! Each supported PGN is a list of little-endian bit fields. Numeric fields
//! are scaled to SI units; a field holding its "not available" sentinel (all
//! ones, or the largest positive value for signed fields) is left out of the
//! decoded object.

use serde_json::{json, Map, Value};

#[derive(Debug, Clone, Copy)]
enum Kind {
    /// Unsigned, scaled by the resolution.
    Unsigned(f64),
    /// Two's complement, scaled by the resolution.
    Signed(f64),
    /// Unsigned integer rendered as a number.
    Integer,
    /// Enumeration; unknown values are rendered as numbers.
    Lookup(&'static [(u64, &'static str)]),
    /// Bit set; rendered as the names of the bits that are set.
    Flags(&'static [&'static str]),
    /// Fixed width text padded with 0xFF, 0x00, '@' or spaces.
    Ascii,
    Reserved,
}

#[derive(Debug, Clone, Copy)]
struct Field {
    name: &'static str,
    bits: usize,
    kind: Kind,
}

const fn field(name: &'static str, bits: usize, kind: Kind) -> Field {
    Field { name, bits, kind }
}

const fn reserved(bits: usize) -> Field {
    Field {
        name: "reserved",
        bits,
        kind: Kind::Reserved,
    }
}

struct Pgn {
    pgn: u32,
    description: &'static str,
    fast_packet: bool,
    fields: &'static [Field],
}

pub const DIRECTION_REFERENCE: &[(u64, &str)] = &[(0, "True"), (1, "Magnetic"), (2, "Error")];

pub const WIND_REFERENCE: &[(u64, &str)] = &[
    (0, "True (ground referenced to North)"),
    (1, "Magnetic (ground referenced to Magnetic North)"),
    (2, "Apparent"),
    (3, "True (boat referenced)"),
    (4, "True (water referenced)"),
];

pub const TEMPERATURE_SOURCE: &[(u64, &str)] = &[
    (0, "Sea Temperature"),
    (1, "Outside Temperature"),
    (2, "Inside Temperature"),
    (3, "Engine Room Temperature"),
    (4, "Main Cabin Temperature"),
    (5, "Live Well Temperature"),
    (6, "Bait Well Temperature"),
    (7, "Refrigeration Temperature"),
    (8, "Heating System Temperature"),
    (9, "Dew Point Temperature"),
    (13, "Freezer Temperature"),
    (14, "Exhaust Gas Temperature"),
];

pub const ENGINE_INSTANCE: &[(u64, &str)] = &[
    (0, "Single Engine or Dual Engine Port"),
    (1, "Dual Engine Starboard"),
];

const RUDDER_DIRECTION: &[(u64, &str)] = &[
    (0, "No Order"),
    (1, "Move to starboard"),
    (2, "Move to port"),
];

const WATER_SPEED_TYPE: &[(u64, &str)] = &[
    (0, "Paddle wheel"),
    (1, "Pitot tube"),
    (2, "Doppler"),
    (3, "Correlation (ultra sound)"),
    (4, "Electro Magnetic"),
];

pub const MANUFACTURER_CODE: &[(u64, &str)] = &[
    (135, "Airmar"),
    (137, "Maretron"),
    (140, "Lowrance"),
    (229, "Garmin"),
    (273, "Actisense"),
    (275, "Navico"),
    (381, "B & G"),
    (419, "Fusion Electronics"),
    (717, "Yacht Devices"),
    (1855, "Furuno"),
    (1857, "Simrad"),
];

pub const ENGINE_STATUS_1: &[&str] = &[
    "checkEngine",
    "overTemperature",
    "lowOilPressure",
    "lowOilLevel",
    "lowFuelPressure",
    "lowSystemVoltage",
    "lowCoolantLevel",
    "waterFlow",
    "waterInFuel",
    "chargeIndicator",
    "preheatIndicator",
    "highBoostPressure",
    "revLimitExceeded",
    "egrSystem",
    "throttlePositionSensor",
    "emergencyStopMode",
];

pub const ENGINE_STATUS_2: &[&str] = &[
    "warningLevel1",
    "warningLevel2",
    "powerReduction",
    "maintenanceNeeded",
    "engineCommError",
    "subOrSecondaryThrottle",
    "neutralStartProtect",
    "engineShuttingDown",
];

use Kind::*;

static PGNS: &[Pgn] = &[
    Pgn {
        pgn: 60928,
        description: "ISO Address Claim",
        fast_packet: false,
        fields: &[
            field("uniqueNumber", 21, Integer),
            field("manufacturerCode", 11, Lookup(MANUFACTURER_CODE)),
            field("deviceInstanceLower", 3, Integer),
            field("deviceInstanceUpper", 5, Integer),
            field("deviceFunction", 8, Integer),
            field("spare", 1, Integer),
            field("deviceClass", 7, Integer),
            field("systemInstance", 4, Integer),
            field("industryGroup", 3, Integer),
            field("arbitraryAddressCapable", 1, Integer),
        ],
    },
    Pgn {
        pgn: 126996,
        description: "Product Information",
        fast_packet: true,
        fields: &[
            field("nmea2000Version", 16, Unsigned(0.001)),
            field("productCode", 16, Integer),
            field("modelId", 256, Ascii),
            field("softwareVersionCode", 256, Ascii),
            field("modelVersion", 256, Ascii),
            field("modelSerialCode", 256, Ascii),
            field("certificationLevel", 8, Integer),
            field("loadEquivalency", 8, Integer),
        ],
    },
    Pgn {
        pgn: 127245,
        description: "Rudder",
        fast_packet: false,
        fields: &[
            field("instance", 8, Integer),
            field("directionOrder", 2, Lookup(RUDDER_DIRECTION)),
            reserved(6),
            field("angleOrder", 16, Signed(0.0001)),
            field("position", 16, Signed(0.0001)),
            reserved(16),
        ],
    },
    Pgn {
        pgn: 127250,
        description: "Vessel Heading",
        fast_packet: false,
        fields: &[
            field("sid", 8, Integer),
            field("heading", 16, Unsigned(0.0001)),
            field("deviation", 16, Signed(0.0001)),
            field("variation", 16, Signed(0.0001)),
            field("reference", 2, Lookup(DIRECTION_REFERENCE)),
            reserved(6),
        ],
    },
    Pgn {
        pgn: 127488,
        description: "Engine Parameters, Rapid Update",
        fast_packet: false,
        fields: &[
            field("instance", 8, Lookup(ENGINE_INSTANCE)),
            field("speed", 16, Unsigned(0.25)),
            field("boostPressure", 16, Unsigned(100.0)),
            field("tiltTrim", 8, Signed(1.0)),
            reserved(16),
        ],
    },
    Pgn {
        pgn: 127489,
        description: "Engine Parameters, Dynamic",
        fast_packet: true,
        fields: &[
            field("instance", 8, Lookup(ENGINE_INSTANCE)),
            field("oilPressure", 16, Unsigned(100.0)),
            field("oilTemperature", 16, Unsigned(0.1)),
            field("temperature", 16, Unsigned(0.01)),
            field("alternatorPotential", 16, Signed(0.01)),
            field("fuelRate", 16, Signed(0.1)),
            field("totalEngineHours", 32, Unsigned(1.0)),
            field("coolantPressure", 16, Unsigned(100.0)),
            field("fuelPressure", 16, Unsigned(1000.0)),
            reserved(8),
            field("discreteStatus1", 16, Flags(ENGINE_STATUS_1)),
            field("discreteStatus2", 16, Flags(ENGINE_STATUS_2)),
            field("engineLoad", 8, Signed(1.0)),
            field("engineTorque", 8, Signed(1.0)),
        ],
    },
    Pgn {
        pgn: 127508,
        description: "Battery Status",
        fast_packet: false,
        fields: &[
            field("instance", 8, Integer),
            field("voltage", 16, Signed(0.01)),
            field("current", 16, Signed(0.1)),
            field("temperature", 16, Unsigned(0.01)),
            field("sid", 8, Integer),
        ],
    },
    Pgn {
        pgn: 128259,
        description: "Speed",
        fast_packet: false,
        fields: &[
            field("sid", 8, Integer),
            field("speedWaterReferenced", 16, Unsigned(0.01)),
            field("speedGroundReferenced", 16, Unsigned(0.01)),
            field("speedWaterReferencedType", 8, Lookup(WATER_SPEED_TYPE)),
            reserved(16),
        ],
    },
    Pgn {
        pgn: 128267,
        description: "Water Depth",
        fast_packet: false,
        fields: &[
            field("sid", 8, Integer),
            field("depth", 32, Unsigned(0.01)),
            field("offset", 16, Signed(0.001)),
            field("range", 8, Unsigned(10.0)),
        ],
    },
    Pgn {
        pgn: 129025,
        description: "Position, Rapid Update",
        fast_packet: false,
        fields: &[
            field("latitude", 32, Signed(1e-7)),
            field("longitude", 32, Signed(1e-7)),
        ],
    },
    Pgn {
        pgn: 129026,
        description: "COG & SOG, Rapid Update",
        fast_packet: false,
        fields: &[
            field("sid", 8, Integer),
            field("cogReference", 2, Lookup(DIRECTION_REFERENCE)),
            reserved(6),
            field("cog", 16, Unsigned(0.0001)),
            field("sog", 16, Unsigned(0.01)),
            reserved(16),
        ],
    },
    Pgn {
        pgn: 130306,
        description: "Wind Data",
        fast_packet: false,
        fields: &[
            field("sid", 8, Integer),
            field("windSpeed", 16, Unsigned(0.01)),
            field("windAngle", 16, Unsigned(0.0001)),
            field("reference", 3, Lookup(WIND_REFERENCE)),
            reserved(21),
        ],
    },
    Pgn {
        pgn: 130312,
        description: "Temperature",
        fast_packet: false,
        fields: &[
            field("sid", 8, Integer),
            field("instance", 8, Integer),
            field("source", 8, Lookup(TEMPERATURE_SOURCE)),
            field("actualTemperature", 16, Unsigned(0.01)),
            field("setTemperature", 16, Unsigned(0.01)),
            reserved(8),
        ],
    },
];

fn describe(pgn: u32) -> Option<&'static Pgn> {
    PGNS.iter().find(|p| p.pgn == pgn)
}

pub fn is_known(pgn: u32) -> bool {
    describe(pgn).is_some()
}

pub fn is_fast_packet(pgn: u32) -> bool {
    describe(pgn).map_or(false, |p| p.fast_packet)
}

/// Reverse lookup of a name in a lookup table.
pub fn lookup_code(table: &[(u64, &str)], name: &str) -> Option<u64> {
    table.iter().find(|(_, n)| *n == name).map(|(code, _)| *code)
}

fn read_bits(data: &[u8], start: usize, len: usize) -> Option<u64> {
    if len == 0 || len > 64 || start + len > data.len() * 8 {
        return None;
    }
    let mut value = 0u64;
    for i in 0..len {
        let bit = start + i;
        if (data[bit / 8] >> (bit % 8)) & 1 == 1 {
            value |= 1 << i;
        }
    }
    Some(value)
}

fn all_ones(bits: usize) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

fn ascii(bytes: &[u8]) -> Option<String> {
    let text: String = bytes
        .iter()
        .take_while(|&&b| b != 0xFF && b != 0x00)
        .map(|&b| b as char)
        .collect();
    let text = text.trim_end_matches(['@', ' ']).to_string();
    (!text.is_empty()).then_some(text)
}

fn decode_field(field: &Field, data: &[u8], start: usize) -> Option<Value> {
    if let Ascii = field.kind {
        let from = start / 8;
        let to = (from + field.bits / 8).min(data.len());
        return data.get(from..to).and_then(ascii).map(Value::String);
    }
    let raw = read_bits(data, start, field.bits)?;
    let missing = field.bits > 1 && raw == all_ones(field.bits);
    match field.kind {
        Reserved | Ascii => None,
        Integer if missing => None,
        Integer => Some(json!(raw)),
        Unsigned(_) if missing => None,
        Unsigned(resolution) => Some(json!(raw as f64 * resolution)),
        Signed(resolution) => {
            let max_positive = all_ones(field.bits - 1);
            if raw == max_positive {
                return None;
            }
            let shift = 64 - field.bits;
            let signed = ((raw << shift) as i64) >> shift;
            Some(json!(signed as f64 * resolution))
        }
        Lookup(_) if missing => None,
        Lookup(table) => Some(
            table
                .iter()
                .find(|(code, _)| *code == raw)
                .map_or_else(|| json!(raw), |(_, name)| json!(name)),
        ),
        Flags(_) if missing => None,
        Flags(names) => Some(Value::Array(
            names
                .iter()
                .enumerate()
                .filter(|(bit, _)| raw & (1 << bit) != 0)
                .map(|(_, name)| json!(name))
                .collect(),
        )),
    }
}

/// Decode a complete payload. Returns the PGN description and its fields,
/// or `None` for PGNs not in the table.
pub fn decode(pgn: u32, data: &[u8]) -> Option<(&'static str, Map<String, Value>)> {
    let description = describe(pgn)?;
    let mut fields = Map::new();
    let mut offset = 0;
    for field in description.fields {
        if let Some(value) = decode_field(field, data, offset) {
            fields.insert(field.name.to_string(), value);
        }
        offset += field.bits;
    }
    Some((description.description, fields))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(value: Option<&Value>, expected: f64) -> bool {
        value
            .and_then(Value::as_f64)
            .map_or(false, |v| (v - expected).abs() < 1e-6)
    }

    #[test]
    fn test_vessel_heading() {
        // sid 0, heading 1.2345 rad, deviation n/a, variation -0.05 rad, magnetic
        let heading = 12345u16.to_le_bytes();
        let variation = (-500i16).to_le_bytes();
        let data = [
            0x00, heading[0], heading[1], 0xFF, 0x7F, variation[0], variation[1], 0xFD,
        ];
        let (description, fields) = decode(127250, &data).unwrap();
        assert_eq!(description, "Vessel Heading");
        assert!(close(fields.get("heading"), 1.2345));
        assert!(fields.get("deviation").is_none());
        assert!(close(fields.get("variation"), -0.05));
        assert_eq!(fields["reference"], "Magnetic");
    }

    #[test]
    fn test_position_rapid() {
        let lat = 601_234_567i32.to_le_bytes();
        let lon = (-249_876_543i32).to_le_bytes();
        let mut data = lat.to_vec();
        data.extend_from_slice(&lon);
        let (_, fields) = decode(129025, &data).unwrap();
        assert!(close(fields.get("latitude"), 60.1234567));
        assert!(close(fields.get("longitude"), -24.9876543));
    }

    #[test]
    fn test_engine_flags() {
        let mut data = vec![0xFFu8; 26];
        data[0] = 1;
        // discrete status 1 at byte 20: overTemperature (bit 1) and lowOilPressure (bit 2)
        data[20] = 0b0000_0110;
        data[21] = 0;
        data[22] = 0;
        data[23] = 0;
        let (_, fields) = decode(127489, &data).unwrap();
        assert_eq!(fields["instance"], "Dual Engine Starboard");
        assert_eq!(fields["discreteStatus1"], json!(["overTemperature", "lowOilPressure"]));
        assert_eq!(fields["discreteStatus2"], json!([]));
        assert!(fields.get("oilPressure").is_none());
    }

    #[test]
    fn test_product_information_text() {
        let mut data = vec![0xFFu8; 134];
        data[0..2].copy_from_slice(&2100u16.to_le_bytes());
        data[2..4].copy_from_slice(&1234u16.to_le_bytes());
        data[4..36].fill(b' ');
        data[4..12].copy_from_slice(b"GPS 200 ");
        let (_, fields) = decode(126996, &data).unwrap();
        assert_eq!(fields["modelId"], "GPS 200");
        assert_eq!(fields["productCode"], 1234);
        assert!(fields.get("softwareVersionCode").is_none());
    }

    #[test]
    fn test_unknown_pgn() {
        assert!(decode(65280, &[0; 8]).is_none());
        assert!(is_fast_packet(126996));
        assert!(!is_fast_packet(129025));
    }
}
