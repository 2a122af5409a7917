//! Parsing for `--since` values.

use chrono::{DateTime, TimeDelta, Utc};

/// Errors from [`parse_since`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub(crate) enum SinceError {
    /// Neither an RFC 3339 timestamp nor `<n><unit>`.
    #[error("expected an RFC 3339 timestamp or a duration like 90s, 5m, 2h, 1d: {0:?}")]
    Invalid(String),
    /// The duration reaches past the representable range.
    #[error("duration out of range: {0:?}")]
    OutOfRange(String),
}

/// Resolve `input` to an absolute instant.
///
/// Accepts an RFC 3339 timestamp, or a relative duration counted back from
/// `now` with a unit suffix of `s`, `m`, `h` or `d`.
pub(crate) fn parse_since(input: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>, SinceError> {
    let input = input.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(input) {
        return Ok(ts.with_timezone(&Utc));
    }

    let invalid = || SinceError::Invalid(input.to_string());
    let split = input
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(invalid)?;
    let (amount, unit) = input.split_at(split);
    let amount: i64 = amount.parse().map_err(|_| invalid())?;

    let out_of_range = || SinceError::OutOfRange(input.to_string());
    let delta = match unit {
        "s" => TimeDelta::try_seconds(amount),
        "m" => TimeDelta::try_minutes(amount),
        "h" => TimeDelta::try_hours(amount),
        "d" => TimeDelta::try_days(amount),
        _ => return Err(invalid()),
    }
    .ok_or_else(out_of_range)?;

    now.checked_sub_signed(delta).ok_or_else(out_of_range)
}
