//! Numeric coercion and display formatting for extracted values

use crate::error::FormattingError;
use crate::events::SourceValue;
use serde_json::Value;

/// Longest display string before truncation kicks in
pub const DISPLAY_CAP: usize = 32;

/// Largest decimal precision a source may request (two digits)
pub const MAX_DECIMALS: u32 = 99;

const ELLIPSIS: &str = "...";

/// Turn an extracted JSON value into a source value
///
/// Anything whose string form parses as a float becomes numeric, including
/// numeric strings such as `"1.5"`. `null` yields `None`.
pub fn coerce(value: &Value) -> Option<SourceValue> {
    match value {
        Value::Null => None,
        Value::Number(number) => Some(match number.as_f64() {
            Some(n) => SourceValue::Number(n),
            None => SourceValue::Text(number.to_string()),
        }),
        Value::String(text) => Some(match text.trim().parse::<f64>() {
            Ok(n) => SourceValue::Number(n),
            Err(_) => SourceValue::Text(text.clone()),
        }),
        other => Some(SourceValue::Text(other.to_string())),
    }
}

/// Shortest round-trip form of a float
///
/// Positional between `1e-4` and `1e16` with at least one fractional digit
/// (`100.0`, `0.0001`); scientific outside it with a signed, two-digit
/// exponent (`1e+16`, `2.5e-05`).
pub fn format_float(value: f64) -> String {
    if value.is_nan() {
        return "nan".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf" } else { "-inf" }.to_string();
    }

    let magnitude = value.abs();
    if magnitude == 0.0 || (1e-4..1e16).contains(&magnitude) {
        return format!("{:?}", value);
    }

    let scientific = format!("{:e}", value);
    match scientific
        .split_once('e')
        .and_then(|(mantissa, exponent)| Some((mantissa, exponent.parse::<i32>().ok()?)))
    {
        Some((mantissa, exponent)) => {
            let sign = if exponent < 0 { '-' } else { '+' };
            format!("{}e{}{:02}", mantissa, sign, exponent.abs())
        }
        None => scientific,
    }
}

/// Format a number to the requested decimal precision
///
/// Without a precision the value is shown by `format_float`.
///
/// # Errors
///
/// Returns `FormattingError::InvalidPrecision` if `decimals` exceeds `MAX_DECIMALS`.
pub fn format_number(value: f64, decimals: Option<u32>) -> Result<String, FormattingError> {
    match decimals {
        Some(d) if d > MAX_DECIMALS => Err(FormattingError::InvalidPrecision(d)),
        Some(d) => Ok(format!("{:.*}", d as usize, value)),
        None => Ok(format_float(value)),
    }
}

/// Cap a display string at `cap` characters
///
/// Returns the display text and whether it was truncated. Truncated text keeps
/// `cap - 3` characters, trimmed, followed by `...`.
pub fn truncate_display(text: &str, cap: usize) -> (String, bool) {
    if text.chars().count() <= cap {
        return (text.to_string(), false);
    }

    let kept: String = text.chars().take(cap.saturating_sub(ELLIPSIS.len())).collect();
    (format!("{}{}", kept.trim(), ELLIPSIS), true)
}
