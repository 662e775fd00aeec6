//! Record parser for "apps installed" log lines
//!
//! A line carries five tab-separated fields:
//! `device_type  device_id  latitude  longitude  app_id,app_id,...`

use crate::error::ParseError;

const FIELD_COUNT: usize = 5;

/// One parsed "apps installed" event
#[derive(Debug, Clone, PartialEq)]
pub struct AppsInstalled {
    pub dev_type: String,
    pub dev_id: String,
    pub lat: f64,
    pub lon: f64,
    /// Never empty
    pub apps: Vec<u64>,
}

impl AppsInstalled {
    /// Cache key, `"<device_type>:<device_id>"`
    pub fn key(&self) -> String {
        format!("{}:{}", self.dev_type, self.dev_id)
    }
}

/// Parse one log line into an event.
///
/// App ids that fail to parse are skipped; the line is rejected only when
/// none survive.
pub fn parse_line(line: &str) -> Result<AppsInstalled, ParseError> {
    let fields: Vec<&str> = line.trim().split('\t').collect();
    if fields.len() != FIELD_COUNT {
        return Err(ParseError::MalformedLine {
            fields: fields.len(),
        });
    }

    let (lat, lon) = match (parse_coordinate(fields[2]), parse_coordinate(fields[3])) {
        (Some(lat), Some(lon)) => (lat, lon),
        _ => return Err(ParseError::BadCoordinates),
    };

    let apps: Vec<u64> = fields[4]
        .split(',')
        .filter_map(|raw| parse_app_id(raw.trim()))
        .collect();
    if apps.is_empty() {
        return Err(ParseError::NoValidAppIds);
    }

    Ok(AppsInstalled {
        dev_type: fields[0].to_string(),
        dev_id: fields[1].to_string(),
        lat,
        lon,
        apps,
    })
}

/// Unsigned integer with an optional `0x`, `0o` or `0b` prefix. A bare
/// leading zero means octal, as in C literals. Signs are not accepted.
fn parse_app_id(raw: &str) -> Option<u64> {
    let lower = raw.get(..2).map(str::to_ascii_lowercase);
    let (digits, radix) = match lower.as_deref() {
        Some("0x") => (&raw[2..], 16),
        Some("0o") => (&raw[2..], 8),
        Some("0b") => (&raw[2..], 2),
        _ if raw.len() > 1 && raw.starts_with('0') => (&raw[1..], 8),
        _ => (raw, 10),
    };
    if digits.is_empty() || digits.starts_with(['+', '-']) {
        return None;
    }
    u64::from_str_radix(digits, radix).ok()
}

fn parse_coordinate(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}
