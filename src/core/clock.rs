#![forbid(unsafe_code)]

use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

#[must_use]
pub fn now() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

#[must_use]
pub fn format(ts: OffsetDateTime) -> String {
    ts.format(&Rfc3339).unwrap_or_else(|_| "unknown".to_owned())
}

#[must_use]
pub fn now_rfc3339() -> String {
    format(now())
}

/// Parses RFC 3339 plus the offset-less `YYYY-MM-DD[ T]HH:MM:SS[.f]` and bare-date
/// forms that hand-edited headers tend to contain. Offset-less values are UTC.
#[must_use]
pub fn parse(s: &str) -> Option<OffsetDateTime> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(ts) = OffsetDateTime::parse(s, &Rfc3339) {
        return Some(ts);
    }

    let normalized = s.replacen(' ', "T", 1);
    let candidate = match normalized.split_once('T') {
        None => format!("{normalized}T00:00:00Z"),
        Some((_, clock)) if has_offset(clock) => normalized,
        Some(_) => format!("{normalized}Z"),
    };
    OffsetDateTime::parse(&candidate, &Rfc3339).ok()
}

fn has_offset(clock: &str) -> bool {
    clock.ends_with('Z') || clock.ends_with('z') || clock.contains('+') || clock.contains('-')
}

/// `serde(with = ..)` adapter storing timestamps as RFC 3339 strings.
pub mod rfc3339 {
    use serde::{Deserialize as _, Deserializer, Serializer};
    use time::OffsetDateTime;

    pub fn serialize<S: Serializer>(ts: &OffsetDateTime, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&super::format(*ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<OffsetDateTime, D::Error> {
        let raw = String::deserialize(de)?;
        super::parse(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp '{raw}'")))
    }

    pub mod option {
        use serde::{Deserialize as _, Deserializer, Serializer};
        use time::OffsetDateTime;

        pub fn serialize<S: Serializer>(
            ts: &Option<OffsetDateTime>,
            ser: S,
        ) -> Result<S::Ok, S::Error> {
            match ts {
                Some(ts) => ser.serialize_some(&super::super::format(*ts)),
                None => ser.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            de: D,
        ) -> Result<Option<OffsetDateTime>, D::Error> {
            let raw = Option::<String>::deserialize(de)?;
            match raw {
                None => Ok(None),
                Some(raw) => super::super::parse(&raw)
                    .map(Some)
                    .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp '{raw}'"))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_common_header_timestamps() {
        let a = parse("2025-06-22T10:00:00Z").unwrap();
        let b = parse("2025-06-22 10:00:00").unwrap();
        let c = parse("2025-06-22T10:00:00.250000").unwrap();
        assert_eq!(a, b);
        assert!(c > a);
        assert_eq!(parse("2025-06-22").unwrap().hour(), 0);
        assert!(parse("yesterday").is_none());
        assert!(parse("").is_none());
    }

    #[test]
    fn format_round_trips() {
        let ts = parse("2025-06-22T10:00:00.5+02:00").unwrap();
        assert_eq!(parse(&format(ts)), Some(ts));
    }
}
