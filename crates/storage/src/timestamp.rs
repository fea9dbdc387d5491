//! Fixed-width UTC timestamps.
//!
//! Every stored timestamp uses the same format with microsecond precision so
//! that string comparison orders them chronologically in both backends.

use time::format_description::FormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};

use crate::StorageError;

const FORMAT: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z");

/// Format a timestamp as `YYYY-MM-DDTHH:MM:SS.ffffffZ` in UTC.
pub fn format_timestamp(at: OffsetDateTime) -> String {
    let utc = at.to_offset(UtcOffset::UTC);
    // The format has no fallible components for in-range dates.
    utc.format(FORMAT).unwrap_or_else(|_| {
        format!(
            "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}.{:06}Z",
            utc.year(),
            utc.month() as u8,
            utc.day(),
            utc.hour(),
            utc.minute(),
            utc.second(),
            utc.microsecond()
        )
    })
}

/// The current time, formatted with [`format_timestamp`].
pub fn now_timestamp() -> String {
    format_timestamp(OffsetDateTime::now_utc())
}

/// Parse a timestamp produced by [`format_timestamp`].
pub fn parse_timestamp(value: &str) -> Result<OffsetDateTime, StorageError> {
    PrimitiveDateTime::parse(value, FORMAT)
        .map(PrimitiveDateTime::assume_utc)
        .map_err(|e| StorageError::Serialization(format!("invalid timestamp '{value}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn formats_with_fixed_width() {
        let at = datetime!(2025-03-04 05:06:07.000089 UTC);
        assert_eq!(format_timestamp(at), "2025-03-04T05:06:07.000089Z");
    }

    #[test]
    fn parse_inverts_format() {
        let at = datetime!(2025-12-31 23:59:59.999999 UTC);
        let parsed = parse_timestamp(&format_timestamp(at)).unwrap();
        assert_eq!(parsed, at);
    }

    #[test]
    fn string_order_is_chronological() {
        let earlier = format_timestamp(datetime!(2025-01-01 09:00:00.5 UTC));
        let later = format_timestamp(datetime!(2025-01-01 10:00:00 UTC));
        assert!(earlier < later);
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            parse_timestamp("yesterday"),
            Err(StorageError::Serialization(_))
        ));
    }
}
