//! ISO-8601 durations (`PT8S`, `P1DT2H`, `PT0.5S`)
//!
//! Years and months are rejected: their length depends on the calendar and
//! the engine only needs fixed spans.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serializer};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid ISO-8601 duration '{input}': {reason}")]
pub struct DurationError {
    pub input: String,
    pub reason: &'static str,
}

fn err(input: &str, reason: &'static str) -> DurationError {
    DurationError {
        input: input.to_string(),
        reason,
    }
}

/// Parse an ISO-8601 duration
pub fn parse_iso8601(input: &str) -> Result<Duration, DurationError> {
    let s = input.trim();
    let rest = s
        .strip_prefix('P')
        .or_else(|| s.strip_prefix('p'))
        .ok_or_else(|| err(input, "must start with 'P'"))?;
    if rest.is_empty() {
        return Err(err(input, "no components"));
    }

    let mut seconds = 0f64;
    let mut in_time = false;
    let mut number = String::new();
    let mut seen_component = false;

    for c in rest.chars() {
        match c {
            'T' | 't' => {
                if in_time || !number.is_empty() {
                    return Err(err(input, "misplaced 'T'"));
                }
                in_time = true;
            }
            '0'..='9' | '.' | ',' => number.push(if c == ',' { '.' } else { c }),
            unit => {
                let value: f64 = number
                    .parse()
                    .map_err(|_| err(input, "missing number before unit"))?;
                number.clear();
                seen_component = true;
                let factor = match (in_time, unit.to_ascii_uppercase()) {
                    (false, 'W') => 7.0 * 86400.0,
                    (false, 'D') => 86400.0,
                    (false, 'Y') | (false, 'M') => {
                        return Err(err(input, "years and months are not supported"))
                    }
                    (true, 'H') => 3600.0,
                    (true, 'M') => 60.0,
                    (true, 'S') => 1.0,
                    _ => return Err(err(input, "unknown unit")),
                };
                seconds += value * factor;
            }
        }
    }

    if !number.is_empty() {
        return Err(err(input, "trailing number without unit"));
    }
    if !seen_component {
        return Err(err(input, "no components"));
    }
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(err(input, "out of range"));
    }
    Ok(Duration::from_secs_f64(seconds))
}

/// Format a duration as ISO-8601 (seconds precision with fraction when needed)
pub fn format_iso8601(d: Duration) -> String {
    let total = d.as_secs();
    let nanos = d.subsec_nanos();
    if total == 0 && nanos == 0 {
        return "PT0S".to_string();
    }
    let days = total / 86400;
    let hours = (total % 86400) / 3600;
    let minutes = (total % 3600) / 60;
    let secs = total % 60;

    let mut out = String::from("P");
    if days > 0 {
        out.push_str(&format!("{days}D"));
    }
    if hours > 0 || minutes > 0 || secs > 0 || nanos > 0 {
        out.push('T');
        if hours > 0 {
            out.push_str(&format!("{hours}H"));
        }
        if minutes > 0 {
            out.push_str(&format!("{minutes}M"));
        }
        if secs > 0 || nanos > 0 {
            if nanos > 0 {
                let frac = format!("{:.9}", nanos as f64 / 1e9);
                let frac = frac.trim_start_matches('0').trim_end_matches('0');
                out.push_str(&format!("{secs}{frac}S"));
            } else {
                out.push_str(&format!("{secs}S"));
            }
        }
    }
    out
}

/// Serde adapter for `Duration` fields written as ISO-8601 strings
pub mod iso8601 {
    use super::*;

    pub fn serialize<S>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format_iso8601(*d))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_iso8601(&s).map_err(serde::de::Error::custom)
    }

    /// Same adapter for `Option<Duration>`
    pub mod option {
        use super::*;

        pub fn serialize<S>(d: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match d {
                Some(d) => serializer.serialize_some(&format_iso8601(*d)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            let s = Option::<String>::deserialize(deserializer)?;
            match s {
                Some(s) if !s.trim().is_empty() => parse_iso8601(&s)
                    .map(Some)
                    .map_err(serde::de::Error::custom),
                _ => Ok(None),
            }
        }
    }
}
