//! Parsing of RouterOS `print detail` output.
//!
//! The CLI emits semi-structured records: a `Flags:` banner, then one record
//! per line starting with a row index, with long records wrapped onto
//! indented continuation lines. Values are `key=value` or `key="value"`, and
//! large numbers carry space thousands-separators (`5 368 709 120`).

use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::NaiveDateTime;
use regex::Regex;

use crate::error::{RdsError, Result};

/// One normalized record: all continuation lines joined, fields extracted.
pub type Record = HashMap<String, String>;

static FIELD_RE: LazyLock<Regex> = LazyLock::new(|| {
    // Quoted value, then spaced digit groups, then a bare token. The spaced
    // alternative must come before the bare one or `5 368 709 120` would
    // capture as `5`.
    Regex::new(
        r#"(?P<k>[a-z][a-z0-9.-]{0,64})=(?:"(?P<q>[^"]{0,512})"|(?P<n>[0-9]{1,20}(?: [0-9]{3}){1,10})|(?P<v>[^\s"]{1,512}))"#,
    )
    .unwrap()
});

static CREATION_TIME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"creation-time=([0-9]{4}-[0-9]{2}-[0-9]{2} [0-9]{2}:[0-9]{2}:[0-9]{2})").unwrap()
});

static RATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([0-9]{1,15})(?:\.([0-9]{1,6}))?(bps|kbps|Mbps|Gbps)$").unwrap());

/// Join wrapped continuation lines and drop banners, yielding one physical
/// line per record.
///
/// A record line starts with an optional flag column and a row index; any
/// following line that is indented and does not start its own index belongs
/// to the previous record.
pub fn normalize(output: &str) -> Vec<String> {
    let mut records: Vec<String> = Vec::new();

    for raw in output.lines() {
        let line = raw.trim_end();
        if line.trim().is_empty() {
            continue;
        }
        let trimmed = line.trim_start();
        if trimmed.starts_with("Flags:") {
            continue;
        }

        if is_record_start(line) {
            records.push(trimmed.to_string());
        } else if let Some(last) = records.last_mut() {
            last.push(' ');
            last.push_str(trimmed);
        }
        // An indented line before any record start is banner residue; drop it.
    }

    records
}

/// A record line begins with whitespace, optional single-letter flags, and a
/// numeric row index.
fn is_record_start(line: &str) -> bool {
    let mut tokens = line.split_whitespace();
    match tokens.next() {
        Some(first) if first.bytes().all(|b| b.is_ascii_digit()) => true,
        Some(first) if first.len() <= 3 && first.bytes().all(|b| b.is_ascii_uppercase()) => {
            // Flag column (e.g. `X` for disabled) followed by the index.
            matches!(tokens.next(), Some(second) if second.bytes().all(|b| b.is_ascii_digit()))
        }
        _ => false,
    }
}

/// Extract `key=value` fields from a normalized record line.
pub fn parse_record(line: &str) -> Record {
    let mut fields = Record::new();
    for caps in FIELD_RE.captures_iter(line) {
        let key = caps.name("k").map(|m| m.as_str().to_string());
        let Some(key) = key else { continue };
        let value = if let Some(q) = caps.name("q") {
            q.as_str().to_string()
        } else if let Some(n) = caps.name("n") {
            n.as_str().replace(' ', "")
        } else if let Some(v) = caps.name("v") {
            v.as_str().to_string()
        } else {
            continue;
        };
        fields.insert(key, value);
    }

    // `creation-time` holds an unquoted space; the generic pass truncates it
    // at the date, so re-extract the full stamp.
    if let Some(caps) = CREATION_TIME_RE.captures(line) {
        fields.insert("creation-time".to_string(), caps[1].to_string());
    }

    fields
}

/// Normalize then parse every record in one reply.
pub fn parse_records(output: &str) -> Vec<Record> {
    normalize(output).iter().map(|line| parse_record(line)).collect()
}

/// Parse an integer that may carry space thousands-separators.
pub fn parse_grouped_u64(s: &str) -> Result<u64> {
    let compact: String = s.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.is_empty() || !compact.bytes().all(|b| b.is_ascii_digit()) {
        return Err(RdsError::Parse(format!("not a number: '{}'", s)));
    }
    compact
        .parse()
        .map_err(|_| RdsError::Parse(format!("number out of range: '{}'", s)))
}

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const GIB: u64 = 1024 * MIB;
const TIB: u64 = 1024 * GIB;

/// Render a byte count the way the RDS CLI likes to receive it: the largest
/// binary unit that divides it exactly, else raw bytes.
pub fn format_human_size(bytes: u64) -> String {
    if bytes > 0 && bytes % TIB == 0 {
        format!("{}T", bytes / TIB)
    } else if bytes > 0 && bytes % GIB == 0 {
        format!("{}G", bytes / GIB)
    } else if bytes > 0 && bytes % MIB == 0 {
        format!("{}M", bytes / MIB)
    } else if bytes > 0 && bytes % KIB == 0 {
        format!("{}K", bytes / KIB)
    } else {
        bytes.to_string()
    }
}

/// Parse a size the CLI reports, either raw bytes (possibly grouped) or with
/// a binary unit suffix.
pub fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim();
    if s.is_empty() {
        return Err(RdsError::Parse("empty size".to_string()));
    }
    let (num, multiplier) = match s.as_bytes()[s.len() - 1] {
        b'K' | b'k' => (&s[..s.len() - 1], KIB),
        b'M' | b'm' => (&s[..s.len() - 1], MIB),
        b'G' | b'g' => (&s[..s.len() - 1], GIB),
        b'T' | b't' => (&s[..s.len() - 1], TIB),
        _ => (s, 1),
    };
    let base = parse_grouped_u64(num)?;
    base.checked_mul(multiplier)
        .ok_or_else(|| RdsError::Parse(format!("size overflow: '{}'", s)))
}

/// Convert a monitor-traffic rate (`1.5Mbps`, `800kbps`, `0bps`) to bytes
/// per second.
pub fn parse_rate_to_bytes_per_sec(s: &str) -> Result<u64> {
    let s = s.trim();
    let caps = RATE_RE
        .captures(s)
        .ok_or_else(|| RdsError::Parse(format!("malformed rate: '{}'", s)))?;

    let whole: u64 = caps[1]
        .parse()
        .map_err(|_| RdsError::Parse(format!("malformed rate: '{}'", s)))?;
    let unit = match &caps[3] {
        "bps" => 1u64,
        "kbps" => 1_000,
        "Mbps" => 1_000_000,
        "Gbps" => 1_000_000_000,
        other => return Err(RdsError::Parse(format!("unknown rate unit: '{}'", other))),
    };

    let mut bits = whole
        .checked_mul(unit)
        .ok_or_else(|| RdsError::Parse(format!("rate overflow: '{}'", s)))?;
    if let Some(frac) = caps.get(2) {
        let digits = frac.as_str();
        let numerator: u64 = digits
            .parse()
            .map_err(|_| RdsError::Parse(format!("malformed rate: '{}'", s)))?;
        let denominator = 10u64.pow(digits.len() as u32);
        bits += numerator * unit / denominator;
    }

    Ok(bits / 8)
}

/// Parse a `creation-time` stamp (`2024-01-15 12:33:01`, device-local time
/// treated as UTC). Returns None for formats this driver does not recognize.
pub fn parse_creation_time(s: &str) -> Option<SystemTime> {
    let naive = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").ok()?;
    let secs = naive.and_utc().timestamp();
    if secs < 0 {
        return None;
    }
    Some(UNIX_EPOCH + Duration::from_secs(secs as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DISK_DETAIL: &str = r#"Flags: X - disabled
 0    slot="pvc-123e4567-e89b-42d3-a456-426614174000" type="file"
      file-path="/storage-pool/metal-csi/pvc-123e4567-e89b-42d3-a456-426614174000.img"
      file-size=5 368 709 120 nvme-tcp-export=yes nvme-tcp-server-port=4420
      nvme-tcp-server-nqn="nqn.2000-02.com.mikrotik:pvc-123e4567-e89b-42d3-a456-426614174000"
      status="ready"
"#;

    #[test]
    fn test_normalize_joins_wrapped_lines() {
        let records = normalize(DISK_DETAIL);
        assert_eq!(records.len(), 1);
        assert!(records[0].contains("slot="));
        assert!(records[0].contains("status="));
        assert!(!records[0].contains("Flags"));
    }

    #[test]
    fn test_normalize_multiple_records() {
        let out = "Flags: X - disabled\n 0   slot=\"pvc-a\" file-size=1024\n 1   slot=\"pvc-b\"\n     file-size=2048\n";
        let records = normalize(out);
        assert_eq!(records.len(), 2);
        assert!(records[1].contains("file-size=2048"));
    }

    #[test]
    fn test_normalize_flagged_record() {
        let out = "Flags: X - disabled\nX 0   slot=\"pvc-a\" file-size=1024\n";
        let records = normalize(out);
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_normalize_empty_output() {
        assert!(normalize("").is_empty());
        assert!(normalize("Flags: X - disabled\n\n").is_empty());
    }

    #[test]
    fn test_parse_record_fields() {
        let records = parse_records(DISK_DETAIL);
        assert_eq!(records.len(), 1);
        let r = &records[0];
        assert_eq!(
            r.get("slot").unwrap(),
            "pvc-123e4567-e89b-42d3-a456-426614174000"
        );
        assert_eq!(r.get("file-size").unwrap(), "5368709120");
        assert_eq!(r.get("nvme-tcp-export").unwrap(), "yes");
        assert_eq!(r.get("nvme-tcp-server-port").unwrap(), "4420");
        assert_eq!(r.get("status").unwrap(), "ready");
        assert_eq!(
            r.get("nvme-tcp-server-nqn").unwrap(),
            "nqn.2000-02.com.mikrotik:pvc-123e4567-e89b-42d3-a456-426614174000"
        );
    }

    #[test]
    fn test_parse_record_creation_time() {
        let line = r#"0 name="storage-pool/metal-csi/x.img" size=1 048 576 creation-time=2024-01-15 12:33:01"#;
        let r = parse_record(line);
        assert_eq!(r.get("creation-time").unwrap(), "2024-01-15 12:33:01");
        assert_eq!(r.get("size").unwrap(), "1048576");
        let t = parse_creation_time(r.get("creation-time").unwrap()).unwrap();
        assert!(t > UNIX_EPOCH);
    }

    #[test]
    fn test_parse_grouped_u64() {
        assert_eq!(parse_grouped_u64("5 368 709 120").unwrap(), 5_368_709_120);
        assert_eq!(parse_grouped_u64("1024").unwrap(), 1024);
        assert!(parse_grouped_u64("").is_err());
        assert!(parse_grouped_u64("12a4").is_err());
    }

    #[test]
    fn test_format_human_size() {
        assert_eq!(format_human_size(5 * GIB), "5G");
        assert_eq!(format_human_size(16 * TIB), "16T");
        assert_eq!(format_human_size(1536 * MIB), "1536M");
        assert_eq!(format_human_size(GIB + 1), (GIB + 1).to_string());
        assert_eq!(format_human_size(0), "0");
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("5G").unwrap(), 5 * GIB);
        assert_eq!(parse_size("16T").unwrap(), 16 * TIB);
        assert_eq!(parse_size("5 368 709 120").unwrap(), 5 * GIB);
        assert_eq!(parse_size("1024").unwrap(), 1024);
        assert!(parse_size("").is_err());
        assert!(parse_size("G").is_err());
    }

    #[test]
    fn test_size_roundtrip() {
        for bytes in [GIB, 5 * GIB, 16 * TIB, GIB + 512 * MIB, 123456789] {
            assert_eq!(parse_size(&format_human_size(bytes)).unwrap(), bytes);
        }
    }

    #[test]
    fn test_parse_rate() {
        assert_eq!(parse_rate_to_bytes_per_sec("8bps").unwrap(), 1);
        assert_eq!(parse_rate_to_bytes_per_sec("800kbps").unwrap(), 100_000);
        assert_eq!(parse_rate_to_bytes_per_sec("1.5Mbps").unwrap(), 187_500);
        assert_eq!(parse_rate_to_bytes_per_sec("2Gbps").unwrap(), 250_000_000);
        assert_eq!(parse_rate_to_bytes_per_sec("0bps").unwrap(), 0);
        assert!(parse_rate_to_bytes_per_sec("fast").is_err());
        assert!(parse_rate_to_bytes_per_sec("1.5Tbps").is_err());
    }

    #[test]
    fn test_parse_creation_time_formats() {
        assert!(parse_creation_time("2024-01-15 12:33:01").is_some());
        assert!(parse_creation_time("jan/15/2024 12:33:01").is_none());
        assert!(parse_creation_time("").is_none());
    }
}
