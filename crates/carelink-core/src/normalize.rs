use serde_json::Value;

use crate::message::WirePayload;

/// Display label for an unattributable sender.
pub const UNKNOWN_SENDER: &str = "Unknown";

/// Raw values below this are second-scale and get promoted to milliseconds.
const MS_THRESHOLD: f64 = 1e12;

/// Normalize a raw wire timestamp to milliseconds since the Unix epoch.
///
/// Accepts a JSON number or numeric string. Values below `10^12` are
/// treated as seconds and multiplied by 1000; anything else is already
/// milliseconds. Unparsable or missing input falls back to the current
/// wall-clock time instead of failing the message.
pub fn normalize_timestamp(raw: Option<&Value>) -> i64 {
    match raw.and_then(parse_millis) {
        Some(ms) => ms,
        None => now_ms(),
    }
}

fn parse_millis(value: &Value) -> Option<i64> {
    let n = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    if !n.is_finite() || n <= 0.0 {
        return None;
    }
    let ms = if n < MS_THRESHOLD { n * 1000.0 } else { n };
    Some(ms as i64)
}

/// Current wall-clock time in milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Sender display name with the fallback chain `senderName` -> `sender`
/// -> a fixed placeholder.
pub fn display_name(payload: &WirePayload) -> String {
    payload
        .sender_name
        .as_deref()
        .filter(|s| !s.is_empty())
        .or(payload.sender.as_deref().filter(|s| !s.is_empty()))
        .unwrap_or(UNKNOWN_SENDER)
        .to_string()
}
