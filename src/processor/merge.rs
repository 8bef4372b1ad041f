//! Building the per-row write out of two profile outcomes.

use chrono::{DateTime, Utc};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

use crate::psi::{CheckError, ProfileResult, NOT_AVAILABLE};
use crate::rows::{Column, RowStatus};

/// Base of the human-facing report viewer.
pub const REPORT_VIEWER: &str = "https://pagespeed.web.dev/report";

/// Everything except the characters `encodeURIComponent` leaves alone.
const URI_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// Values for one contiguous write starting at [`Column::Status`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowWrite {
    pub status: RowStatus,
    pub values: Vec<String>,
}

impl RowWrite {
    pub const START: Column = Column::Status;
}

/// Merge the mobile and desktop outcomes for `url`.
///
/// A failure on either side marks the whole row `Error` and drops the other
/// side's metrics; only the two messages survive.
pub fn merge(
    url: &str,
    mobile: &Result<ProfileResult, CheckError>,
    desktop: &Result<ProfileResult, CheckError>,
    checked_at: DateTime<Utc>,
) -> RowWrite {
    let checked = format_checked_at(checked_at);

    let values = match (mobile, desktop) {
        (Ok(m), Ok(d)) => {
            let mut values = vec![RowStatus::Complete.to_string(), checked];
            values.extend(m.metric_fields());
            values.extend(d.metric_fields());
            values.push(m.top_issues.clone());
            values.push(d.top_issues.clone());
            values.push(report_link(url));
            values
        }
        _ => {
            let m_error = error_text(mobile);
            let d_error = error_text(desktop);
            let mut values = vec![RowStatus::Error.to_string(), checked];
            values.extend(std::iter::repeat(NOT_AVAILABLE.to_string()).take(12));
            values.push(format!("Mobile: {}", m_error));
            values.push(format!("Desktop: {}", d_error));
            values.push(NOT_AVAILABLE.to_string());
            values
        }
    };

    let status = if mobile.is_ok() && desktop.is_ok() {
        RowStatus::Complete
    } else {
        RowStatus::Error
    };
    RowWrite { status, values }
}

/// Write recorded when processing a row failed outright.
pub fn script_error(message: &str) -> RowWrite {
    RowWrite {
        status: RowStatus::ScriptError,
        values: vec![RowStatus::ScriptError.to_string(), message.to_string()],
    }
}

/// Link to the PageSpeed report viewer for `url`, with the URL escaped.
pub fn report_link(url: &str) -> String {
    format!("{}?url={}", REPORT_VIEWER, utf8_percent_encode(url, URI_COMPONENT))
}

/// RFC 1123 timestamp, e.g. `Sat, 17 Oct 2026 12:00:00 GMT`.
pub fn format_checked_at(at: DateTime<Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

fn error_text(outcome: &Result<ProfileResult, CheckError>) -> String {
    match outcome {
        Ok(_) => "OK".to_string(),
        Err(e) => e.to_string(),
    }
}
