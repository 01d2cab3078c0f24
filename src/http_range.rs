use std::cmp::min;
use std::time::SystemTime;

use time::OffsetDateTime;
use time::format_description::FormatItem;
use time::macros::format_description;
use time::macros::offset;

const HTTP_DATE_FORMAT: &[FormatItem<'_>] = format_description!(
    "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
);

#[must_use]
pub(crate) fn systemtime_to_http_datetime(time: SystemTime) -> String {
    let odt = OffsetDateTime::from(time);
    assert_eq!(odt.offset(), offset!(UTC));

    /* round up to the next full second */
    let odt = match odt.nanosecond() {
        0 => odt,
        ns => odt.saturating_add(time::Duration::NANOSECOND * (1_000_000_000 - ns)),
    };

    odt.format(HTTP_DATE_FORMAT).expect("date should be valid")
}

/// Outcome of evaluating a request `Range` header against a file size.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum RangeOutcome {
    /// Serve `[start, start + length)` with the given `Content-Range` value.
    Partial {
        content_range: String,
        start: u64,
        length: u64,
    },
    /// Syntactically valid but not satisfiable for this file size.
    Unsatisfiable,
    /// No (or malformed) range; serve the full representation.
    Full,
}

/// Evaluates a single-range `bytes=` request per RFC 7233 section 2.1.
///
/// Multi-range requests and malformed values fall back to a full response;
/// a well-formed range that lies outside the file yields
/// [`RangeOutcome::Unsatisfiable`].
#[must_use]
pub(crate) fn http_evaluate_range(range: Option<&str>, file_size: u64) -> RangeOutcome {
    let Some(range) = range else {
        return RangeOutcome::Full;
    };

    let Some(byte_range) = range.strip_prefix("bytes=") else {
        return RangeOutcome::Full;
    };

    // TODO: support multiple ranges: bytes=500-600,601-999
    if byte_range.contains(',') {
        return RangeOutcome::Full;
    }

    let Some((start, end)) = byte_range.split_once('-') else {
        return RangeOutcome::Full;
    };

    let start = if start.is_empty() {
        None
    } else {
        match start.trim().parse::<u64>() {
            Ok(v) => Some(v),
            Err(_) => return RangeOutcome::Full,
        }
    };
    let end = if end.is_empty() {
        None
    } else {
        match end.trim().parse::<u64>() {
            Ok(v) => Some(v),
            Err(_) => return RangeOutcome::Full,
        }
    };

    let (start, end) = match (start, end) {
        (None, None) => return RangeOutcome::Full,
        (Some(s), Some(e)) => {
            if s > e {
                return RangeOutcome::Full;
            }
            if s >= file_size {
                return RangeOutcome::Unsatisfiable;
            }
            (s, min(e, file_size - 1))
        }
        (Some(s), None) => {
            if s >= file_size {
                return RangeOutcome::Unsatisfiable;
            }
            (s, file_size - 1)
        }
        (None, Some(e)) => {
            if e == 0 || file_size == 0 {
                return RangeOutcome::Unsatisfiable;
            }
            (file_size.saturating_sub(e), file_size - 1)
        }
    };

    RangeOutcome::Partial {
        content_range: format!("bytes {start}-{end}/{file_size}"),
        start,
        length: end + 1 - start,
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, UNIX_EPOCH};

    use super::*;

    #[test]
    fn format_datetime_test() {
        assert_eq!(
            systemtime_to_http_datetime(UNIX_EPOCH),
            "Thu, 01 Jan 1970 00:00:00 GMT"
        );

        /* sub-second part rounds up */
        assert_eq!(
            systemtime_to_http_datetime(UNIX_EPOCH + Duration::from_nanos(999_999_999)),
            "Thu, 01 Jan 1970 00:00:01 GMT"
        );
    }

    #[test]
    fn satisfiable_ranges() {
        assert_eq!(
            http_evaluate_range(Some("bytes=0-1023"), 8192),
            RangeOutcome::Partial {
                content_range: "bytes 0-1023/8192".to_string(),
                start: 0,
                length: 1024
            }
        );

        assert_eq!(
            http_evaluate_range(Some("bytes=4096-"), 10000),
            RangeOutcome::Partial {
                content_range: "bytes 4096-9999/10000".to_string(),
                start: 4096,
                length: 5904
            }
        );

        /* suffix range */
        assert_eq!(
            http_evaluate_range(Some("bytes=-500"), 10000),
            RangeOutcome::Partial {
                content_range: "bytes 9500-9999/10000".to_string(),
                start: 9500,
                length: 500
            }
        );

        /* end clamped to file size */
        assert_eq!(
            http_evaluate_range(Some("bytes=5000-6999"), 6000),
            RangeOutcome::Partial {
                content_range: "bytes 5000-5999/6000".to_string(),
                start: 5000,
                length: 1000
            }
        );
    }

    #[test]
    fn unsatisfiable_ranges() {
        assert_eq!(
            http_evaluate_range(Some("bytes=9999-99999"), 8192),
            RangeOutcome::Unsatisfiable
        );
        assert_eq!(
            http_evaluate_range(Some("bytes=8192-"), 8192),
            RangeOutcome::Unsatisfiable
        );
        assert_eq!(
            http_evaluate_range(Some("bytes=-0"), 8192),
            RangeOutcome::Unsatisfiable
        );
    }

    #[test]
    fn full_fallbacks() {
        assert_eq!(http_evaluate_range(None, 8192), RangeOutcome::Full);
        assert_eq!(http_evaluate_range(Some("ABCDEFG"), 8192), RangeOutcome::Full);
        assert_eq!(http_evaluate_range(Some("bytes="), 8192), RangeOutcome::Full);
        assert_eq!(http_evaluate_range(Some("bytes=-"), 8192), RangeOutcome::Full);
        assert_eq!(
            http_evaluate_range(Some("bytes=foo-bar"), 8192),
            RangeOutcome::Full
        );
        assert_eq!(
            http_evaluate_range(Some("bytes=1023-0"), 8192),
            RangeOutcome::Full
        );
        assert_eq!(
            http_evaluate_range(Some("bytes=0-50, 100-150"), 8192),
            RangeOutcome::Full
        );
    }
}
