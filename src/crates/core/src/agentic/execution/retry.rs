//! Transient-error classification and backoff

use crate::util::errors::{StewardError, StewardResult};
use serde_json::Value;
use std::time::Duration;
use steward_core_types::{ApiErrorData, MessageError};
use tokio_util::sync::CancellationToken;

pub const RETRY_INITIAL_DELAY: u64 = 2_000;
pub const RETRY_BACKOFF_FACTOR: u64 = 2;
pub const RETRY_MAX_DELAY_NO_HEADERS: u64 = 30_000;
/// Largest delay a single sleep is allowed to take
pub const RETRY_MAX_DELAY: u64 = 2_147_483_647;

/// Delay in milliseconds before retry number `attempt` (1-based).
pub fn delay(attempt: u32, error: Option<&ApiErrorData>) -> u64 {
    delay_at(attempt, error, chrono::Utc::now().timestamp_millis())
}

pub(crate) fn delay_at(attempt: u32, error: Option<&ApiErrorData>, now_ms: i64) -> u64 {
    let exponent = attempt.max(1) - 1;
    let backoff = RETRY_BACKOFF_FACTOR
        .checked_pow(exponent)
        .map(|factor| RETRY_INITIAL_DELAY.saturating_mul(factor))
        .unwrap_or(u64::MAX);

    if let Some(headers) = error.and_then(|e| e.response_headers.as_ref()) {
        if let Some(ms) = header_f64(headers.get("retry-after-ms")) {
            return clamp_ms(ms);
        }
        if let Some(value) = headers.get("retry-after") {
            if let Some(seconds) = header_f64(Some(value)) {
                return clamp_ms((seconds * 1000.0).ceil());
            }
            if let Some(date_ms) = parse_http_date(value) {
                let diff = date_ms - now_ms;
                if diff > 0 {
                    return diff as u64;
                }
            }
        }
        return backoff;
    }

    backoff.min(RETRY_MAX_DELAY_NO_HEADERS)
}

/// HTTP-date in any of the three RFC 9110 forms, as epoch millis.
fn parse_http_date(value: &str) -> Option<i64> {
    let value = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if let Ok(date) = chrono::DateTime::parse_from_rfc2822(&value) {
        return Some(date.timestamp_millis());
    }
    // RFC 850, then asctime
    ["%A, %d-%b-%y %H:%M:%S GMT", "%a %b %d %H:%M:%S %Y"]
        .iter()
        .find_map(|format| chrono::NaiveDateTime::parse_from_str(&value, format).ok())
        .map(|naive| naive.and_utc().timestamp_millis())
}

fn header_f64(value: Option<&String>) -> Option<f64> {
    let parsed = value?.trim().parse::<f64>().ok()?;
    parsed.is_finite().then_some(parsed)
}

fn clamp_ms(ms: f64) -> u64 {
    if ms <= 0.0 {
        0
    } else {
        ms.min(u64::MAX as f64) as u64
    }
}

/// Status message to show while retrying, or `None` when `error` is final.
pub fn retryable(error: &MessageError) -> Option<String> {
    match error {
        MessageError::Api(data) => {
            if !data.is_retryable {
                return None;
            }
            if data.message.contains("Overloaded") {
                Some("Provider is overloaded".to_string())
            } else {
                Some(data.message.clone())
            }
        }
        MessageError::Unknown { message } => classify_json(message),
        _ => None,
    }
}

fn str_at<'a>(json: &'a Value, path: &[&str]) -> Option<&'a str> {
    let mut current = json;
    for key in path {
        current = current.get(key)?;
    }
    current.as_str()
}

fn classify_json(message: &str) -> Option<String> {
    let json: Value = serde_json::from_str(message).ok()?;
    let is_error_type = str_at(&json, &["type"]) == Some("error");

    if is_error_type && str_at(&json, &["error", "type"]) == Some("too_many_requests") {
        return Some("Too Many Requests".to_string());
    }
    if str_at(&json, &["code"]).is_some_and(|code| code.contains("exhausted") || code.contains("unavailable")) {
        return Some("Provider is overloaded".to_string());
    }
    if is_error_type && str_at(&json, &["error", "code"]).is_some_and(|code| code.contains("rate_limit")) {
        return Some("Rate Limited".to_string());
    }
    let error = json.get("error").filter(|e| !e.is_null());
    let no_kv_space = str_at(&json, &["error", "message"]).is_some_and(|m| m.contains("no_kv_space"));
    let server_error = is_error_type && str_at(&json, &["error", "type"]) == Some("server_error");
    if no_kv_space || server_error || error.is_some_and(json_truthy) {
        return Some("Provider Server Error".to_string());
    }
    None
}

fn json_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Sleeps `ms` (clamped) unless `cancel` fires first.
pub async fn sleep(ms: u64, cancel: &CancellationToken) -> StewardResult<()> {
    let duration = Duration::from_millis(ms.min(RETRY_MAX_DELAY));
    tokio::select! {
        _ = cancel.cancelled() => Err(StewardError::cancelled("Retry sleep aborted")),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}
