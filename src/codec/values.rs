//! Text codecs for leaf values: ISO-8601 dates and base64 binary content.

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};

use crate::error::ContactError;

/// Mime type recorded for binary leaves written without an explicit content type.
pub const DEFAULT_MIME_TYPE: &str = "binary";

/// Parse a stored date. Accepts RFC 3339 with any offset, offset-less date-times (read as UTC),
/// and bare dates (midnight UTC).
pub fn parse_date(text: &str) -> Result<DateTime<Utc>, ContactError> {
    let text = text.trim();
    if let Ok(date) = DateTime::parse_from_rfc3339(text) {
        return Ok(date.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f") {
        return Ok(naive.and_utc());
    }
    let day = NaiveDate::parse_from_str(text, "%Y-%m-%d")?;
    day.and_hms_opt(0, 0, 0)
        .map(|naive| naive.and_utc())
        .ok_or_else(|| ContactError::SchemaViolation(format!("Invalid date '{text}'")))
}

/// UTC ISO-8601 text, with sub-second digits only when present.
pub fn format_date(date: &DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

pub fn encode_binary(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn decode_binary(text: &str) -> Result<Vec<u8>, ContactError> {
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    Ok(STANDARD.decode(compact)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_date_forms() {
        let expected = Utc.with_ymd_and_hms(2008, 1, 1, 12, 0, 0).unwrap();
        assert_eq!(parse_date("2008-01-01T12:00:00Z").unwrap(), expected);
        assert_eq!(parse_date("2008-01-01T14:00:00+02:00").unwrap(), expected);
        assert_eq!(parse_date("2008-01-01T12:00:00").unwrap(), expected);
        assert_eq!(
            parse_date("2008-01-01").unwrap(),
            Utc.with_ymd_and_hms(2008, 1, 1, 0, 0, 0).unwrap()
        );
        assert!(parse_date("yesterday").is_err());
        assert_eq!(format_date(&expected), "2008-01-01T12:00:00Z");
    }

    #[test]
    fn test_binary_tolerates_line_breaks() {
        let encoded = encode_binary(b"contact photo bytes");
        let wrapped = format!("{}\n  {}", &encoded[..10], &encoded[10..]);
        assert_eq!(decode_binary(&wrapped).unwrap(), b"contact photo bytes");
        assert!(matches!(
            decode_binary("!!!"),
            Err(ContactError::MalformedDocument(_))
        ));
    }
}
