//! Log line filtering and Docker timestamp parsing

use crate::error::{Result, SockerlessError};
use chrono::{DateTime, TimeZone, Utc};

/// Last `n` lines; `n <= 0` yields nothing
pub fn filter_log_tail(lines: &[String], n: i64) -> Vec<String> {
    if n <= 0 {
        return Vec::new();
    }
    let n = n as usize;
    if n >= lines.len() {
        return lines.to_vec();
    }
    lines[lines.len() - n..].to_vec()
}

/// Lines stamped at or after `since`; unstamped lines are kept
pub fn filter_log_since(lines: &[String], since: DateTime<Utc>) -> Vec<String> {
    lines
        .iter()
        .filter(|l| parse_line_timestamp(l).map_or(true, |ts| ts >= since))
        .cloned()
        .collect()
}

/// Lines stamped before `until`; unstamped lines are kept
pub fn filter_log_until(lines: &[String], until: DateTime<Utc>) -> Vec<String> {
    lines
        .iter()
        .filter(|l| parse_line_timestamp(l).map_or(true, |ts| ts < until))
        .cloned()
        .collect()
}

/// Parse a `since`/`until` value: RFC3339Nano, or integer/float epoch seconds
pub fn parse_docker_timestamp(s: &str) -> Result<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Ok(t.with_timezone(&Utc));
    }
    if let Ok(secs) = s.parse::<i64>() {
        if let Some(t) = Utc.timestamp_opt(secs, 0).single() {
            return Ok(t);
        }
    }
    if let Ok(epoch) = s.parse::<f64>() {
        let secs = epoch.trunc() as i64;
        let nanos = ((epoch - epoch.trunc()) * 1e9).round() as u32;
        if let Some(t) = Utc.timestamp_opt(secs, nanos.min(999_999_999)).single() {
            return Ok(t);
        }
    }
    Err(SockerlessError::InvalidParameter(format!(
        "unrecognized timestamp format: {}",
        s
    )))
}

/// Timestamp at the start of a log line (`<rfc3339nano> message`)
pub fn parse_line_timestamp(line: &str) -> Option<DateTime<Utc>> {
    let (ts, _) = line.split_once(' ')?;
    DateTime::parse_from_rfc3339(ts)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Strip the leading timestamp from a log line if present
pub fn strip_line_timestamp(line: &str) -> &str {
    match line.split_once(' ') {
        Some((ts, rest)) if DateTime::parse_from_rfc3339(ts).is_ok() => rest,
        _ => line,
    }
}
