//! Small stand-alone helpers shared by the graph and manifest engine:
//! RFC3339 timestamp formatting and random hex id generation. Kept
//! dependency-free (no `chrono`) since the only caller needs UTC
//! wall-clock stamps for image metadata, not general calendar math.

use std::time::{SystemTime, UNIX_EPOCH};

/// Formats "now" as an RFC3339 UTC timestamp, e.g. `2024-03-05T12:34:56Z`.
pub fn now_rfc3339() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    format_unix_rfc3339(secs as i64)
}

/// Formats a unix timestamp (seconds) as RFC3339 UTC. Uses Howard
/// Hinnant's `civil_from_days` algorithm to avoid pulling in a calendar
/// dependency for a single call site.
pub fn format_unix_rfc3339(unix_secs: i64) -> String {
    let days = unix_secs.div_euclid(86_400);
    let time_of_day = unix_secs.rem_euclid(86_400);
    let (year, month, day) = civil_from_days(days);
    let hour = time_of_day / 3600;
    let minute = (time_of_day % 3600) / 60;
    let second = time_of_day % 60;
    format!("{year:04}-{month:02}-{day:02}T{hour:02}:{minute:02}:{second:02}Z")
}

fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u64; // [0, 146096]
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146_096) / 365; // [0, 399]
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100); // [0, 365]
    let mp = (5 * doy + 2) / 153; // [0, 11]
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32; // [1, 31]
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32; // [1, 12]
    let y = if m <= 2 { y + 1 } else { y };
    (y, m, d)
}

/// Generates a 64-hex-character id in the same shape as a SHA-256 digest,
/// for `Graph::create`'s randomly-generated image ids (spec.md §4.1).
pub fn random_hex_id() -> String {
    let a = uuid::Uuid::new_v4();
    let b = uuid::Uuid::new_v4();
    format!("{}{}", a.simple(), b.simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_known_epoch() {
        assert_eq!(format_unix_rfc3339(0), "1970-01-01T00:00:00Z");
    }

    #[test]
    fn formats_known_date() {
        // 2021-01-01T00:00:00Z
        assert_eq!(format_unix_rfc3339(1_609_459_200), "2021-01-01T00:00:00Z");
    }

    #[test]
    fn random_ids_look_like_sha256() {
        let id = random_hex_id();
        assert_eq!(id.len(), 64);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
