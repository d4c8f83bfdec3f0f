use chrono::{LocalResult, NaiveDateTime, TimeZone};
use chrono_tz::Tz;

use crate::model::Ms;

/// Format of the `datetime-local` values submitted by the booking form.
pub const LOCAL_DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HintError {
    #[error("unknown time zone: {0}")]
    UnknownTimeZone(String),
    #[error("not a valid date and time: {0}")]
    Malformed(String),
    #[error("{0} does not exist in the selected time zone")]
    NonexistentLocalTime(String),
}

/// What the client told us about itself. Only the time zone matters to the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientHint {
    pub time_zone: Tz,
}

impl Default for ClientHint {
    fn default() -> Self {
        Self { time_zone: Tz::UTC }
    }
}

impl ClientHint {
    pub fn new(time_zone: Tz) -> Self {
        Self { time_zone }
    }

    /// Parse an IANA zone name such as `Europe/Sofia`.
    pub fn from_zone_name(name: &str) -> Result<Self, HintError> {
        name.parse::<Tz>()
            .map(Self::new)
            .map_err(|_| HintError::UnknownTimeZone(name.to_string()))
    }

    /// Resolve a local wall-clock string into an instant.
    ///
    /// A wall-clock time repeated by a DST fold resolves to its earlier instant;
    /// one skipped by a DST gap is rejected.
    pub fn resolve_local(&self, value: &str) -> Result<Ms, HintError> {
        let naive = NaiveDateTime::parse_from_str(value.trim(), LOCAL_DATETIME_FORMAT)
            .map_err(|_| HintError::Malformed(value.to_string()))?;
        match self.time_zone.from_local_datetime(&naive) {
            LocalResult::Single(dt) => Ok(dt.timestamp_millis()),
            LocalResult::Ambiguous(earliest, _) => Ok(earliest.timestamp_millis()),
            LocalResult::None => Err(HintError::NonexistentLocalTime(value.to_string())),
        }
    }

    /// Render an instant as the caller's local wall-clock time.
    pub fn format_local(&self, at: Ms) -> String {
        match self.time_zone.timestamp_millis_opt(at) {
            LocalResult::Single(dt) | LocalResult::Ambiguous(dt, _) => {
                dt.format(LOCAL_DATETIME_FORMAT).to_string()
            }
            LocalResult::None => at.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utc_round_trip() {
        let hint = ClientHint::default();
        let at = hint.resolve_local("2025-06-01T10:00").unwrap();
        assert_eq!(at, 1_748_772_000_000);
        assert_eq!(hint.format_local(at), "2025-06-01T10:00");
    }

    #[test]
    fn zone_offset_applied() {
        let sofia = ClientHint::from_zone_name("Europe/Sofia").unwrap();
        let utc = ClientHint::default();
        // Sofia is UTC+3 in June
        assert_eq!(
            sofia.resolve_local("2025-06-01T13:00").unwrap(),
            utc.resolve_local("2025-06-01T10:00").unwrap()
        );
    }

    #[test]
    fn unknown_zone_rejected() {
        assert_eq!(
            ClientHint::from_zone_name("Mars/Olympus"),
            Err(HintError::UnknownTimeZone("Mars/Olympus".into()))
        );
    }

    #[test]
    fn malformed_value_rejected() {
        let hint = ClientHint::default();
        assert!(matches!(hint.resolve_local("01/06/2025 10:00"), Err(HintError::Malformed(_))));
        assert!(matches!(hint.resolve_local(""), Err(HintError::Malformed(_))));
    }

    #[test]
    fn dst_gap_rejected() {
        // Clocks jump 02:00 → 03:00 in New York on 2025-03-09
        let ny = ClientHint::from_zone_name("America/New_York").unwrap();
        assert!(matches!(
            ny.resolve_local("2025-03-09T02:30"),
            Err(HintError::NonexistentLocalTime(_))
        ));
    }

    #[test]
    fn dst_fold_resolves_to_earliest() {
        // 01:30 happens twice in New York on 2025-11-02; first one is EDT (UTC-4)
        let ny = ClientHint::from_zone_name("America/New_York").unwrap();
        let utc = ClientHint::default();
        assert_eq!(
            ny.resolve_local("2025-11-02T01:30").unwrap(),
            utc.resolve_local("2025-11-02T05:30").unwrap()
        );
    }
}
