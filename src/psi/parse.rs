//! Lighthouse response normalization.

use serde_json::{Map, Value};
use tracing::debug;

use super::{CheckError, ProfileResult, NOT_AVAILABLE};

/// Audit ids of the five reported metrics, in column order.
pub const METRIC_AUDITS: [&str; 5] = [
    "first-contentful-paint",
    "speed-index",
    "largest-contentful-paint",
    "total-blocking-time",
    "cumulative-layout-shift",
];

/// How many opportunities make it into the issues summary.
pub const MAX_OPPORTUNITIES: usize = 5;

pub const NO_OPPORTUNITIES: &str = "No major opportunities found.";

/// Turn a raw `runPagespeed` body into a [`ProfileResult`].
pub fn normalize(response: &Value) -> Result<ProfileResult, CheckError> {
    let Some(lighthouse) = response.get("lighthouseResult").filter(|v| !v.is_null()) else {
        let preview: String = response.to_string().chars().take(500).collect();
        debug!(response = %preview, "No lighthouseResult in API response");
        return Err(CheckError::Parse(
            "Invalid API response: No lighthouseResult.".to_string(),
        ));
    };

    let audits = match lighthouse.get("audits") {
        None | Some(Value::Null) => {
            return Err(CheckError::Parse("Invalid API response: No audits.".to_string()))
        }
        Some(Value::Object(audits)) => audits,
        Some(other) => {
            return Err(parse_failure(format!(
                "expected audits to be an object, found {}",
                json_kind(other)
            )))
        }
    };

    let performance = lighthouse
        .pointer("/categories/performance/score")
        .and_then(Value::as_f64)
        .map(|score| (score * 100.0).round().max(0.0) as u32);

    let [fcp, si, lcp, tbt, cls] = METRIC_AUDITS.map(|id| display_value(audits, id));

    Ok(ProfileResult {
        performance,
        fcp,
        si,
        lcp,
        tbt,
        cls,
        top_issues: top_issues(audits),
    })
}

fn display_value(audits: &Map<String, Value>, id: &str) -> String {
    audits
        .get(id)
        .and_then(|audit| audit.get("displayValue"))
        .and_then(Value::as_str)
        .unwrap_or(NOT_AVAILABLE)
        .to_string()
}

/// Ranked list of the biggest opportunities, one per line.
fn top_issues(audits: &Map<String, Value>) -> String {
    let mut opportunities: Vec<(&str, f64)> = audits
        .iter()
        .filter_map(|(id, audit)| {
            let details = audit.get("details")?;
            if details.get("type").and_then(Value::as_str) != Some("opportunity") {
                return None;
            }
            let savings = details.get("overallSavingsMs").and_then(Value::as_f64)?;
            if savings <= 0.0 {
                return None;
            }
            let title = audit.get("title").and_then(Value::as_str).unwrap_or(id.as_str());
            Some((title, savings))
        })
        .collect();

    // Stable sort keeps audit-id order among equal savings
    opportunities.sort_by(|a, b| b.1.total_cmp(&a.1));

    if opportunities.is_empty() {
        return NO_OPPORTUNITIES.to_string();
    }

    opportunities
        .iter()
        .take(MAX_OPPORTUNITIES)
        .enumerate()
        .map(|(i, (title, savings))| {
            format!("{}. {} (Est. Savings: {} ms)", i + 1, title, savings.round() as i64)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn parse_failure(detail: String) -> CheckError {
    CheckError::Parse(format!("Could not parse API response. {}", detail))
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
