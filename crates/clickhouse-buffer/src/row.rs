//! Row values and normalization.
//!
//! A row is an ordered list of column values. Before a row enters the
//! buffer it is normalized once and serialized to a single-line JSON array,
//! the `JSONCompactEachRow` input format:
//!
//! - timestamps become integer Unix seconds (truncated toward zero)
//! - booleans become `1` / `0`
//! - everything else keeps its JSON representation

use crate::error::Result;
use chrono::{DateTime, Utc};
use serde_json::Number;
use std::time::SystemTime;

/// One column value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Text(String),
    Number(Number),
    Bool(bool),
    Timestamp(DateTime<Utc>),
    /// Any other JSON value, serialized as-is.
    Json(serde_json::Value),
}

pub type Row = Vec<Value>;

/// Build a [`Row`] from heterogeneous literals.
///
/// ```ignore
/// buffer.push(row![42, "signup", true, chrono::Utc::now()]).await?;
/// ```
#[macro_export]
macro_rules! row {
    ($($value:expr),* $(,)?) => {
        vec![$($crate::row::Value::from($value)),*]
    };
}

impl Value {
    fn normalize(&self) -> serde_json::Value {
        match self {
            Value::Text(s) => serde_json::Value::String(s.clone()),
            Value::Number(n) => serde_json::Value::Number(n.clone()),
            Value::Bool(b) => serde_json::Value::from(u8::from(*b)),
            Value::Timestamp(ts) => serde_json::Value::from(unix_seconds(ts)),
            Value::Json(v) => v.clone(),
        }
    }
}

fn unix_seconds(ts: &DateTime<Utc>) -> i64 {
    let secs = ts.timestamp();
    if secs < 0 && ts.timestamp_subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

/// Normalize a row and serialize it as one JSON array line (no newline).
pub fn format_row(row: &[Value]) -> Result<String> {
    let normalized: Vec<serde_json::Value> = row.iter().map(Value::normalize).collect();
    Ok(serde_json::to_string(&normalized)?)
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

macro_rules! impl_from_integer {
    ($($t:ty),*) => {
        $(
            impl From<$t> for Value {
                fn from(n: $t) -> Self {
                    Value::Number(Number::from(n))
                }
            }
        )*
    };
}

impl_from_integer!(i8, i16, i32, i64, u8, u16, u32, u64, usize, isize);

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        match Number::from_f64(n) {
            Some(n) => Value::Number(n),
            None => Value::Json(serde_json::Value::Null),
        }
    }
}

impl From<f32> for Value {
    fn from(n: f32) -> Self {
        Value::from(f64::from(n))
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(ts: DateTime<Utc>) -> Self {
        Value::Timestamp(ts)
    }
}

impl From<SystemTime> for Value {
    fn from(ts: SystemTime) -> Self {
        Value::Timestamp(DateTime::<Utc>::from(ts))
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Json(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Value::Json(serde_json::Value::Null),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_plain_values_pass_through() {
        let line = format_row(&row![1, "a", 2.5]).unwrap();
        assert_eq!(line, r#"[1,"a",2.5]"#);
    }

    #[test]
    fn test_booleans_become_integers() {
        let line = format_row(&row![true, false]).unwrap();
        assert_eq!(line, "[1,0]");
    }

    #[test]
    fn test_timestamps_truncate_to_seconds() {
        let ts = Utc.timestamp_millis_opt(1_700_000_000_999).unwrap();
        let line = format_row(&row![ts]).unwrap();
        assert_eq!(line, "[1700000000]");
    }

    #[test]
    fn test_negative_timestamps_truncate_toward_zero() {
        let ts = Utc.timestamp_millis_opt(-1_500).unwrap();
        assert_eq!(format_row(&row![ts]).unwrap(), "[-1]");
    }

    #[test]
    fn test_system_time_is_a_timestamp() {
        let ts = SystemTime::UNIX_EPOCH + std::time::Duration::from_millis(42_400);
        assert_eq!(format_row(&row![ts]).unwrap(), "[42]");
    }

    #[test]
    fn test_json_and_null_values() {
        let line = format_row(&row![
            serde_json::json!({"k": [1, 2]}),
            Option::<i32>::None,
            f64::NAN
        ])
        .unwrap();
        assert_eq!(line, r#"[{"k":[1,2]},null,null]"#);
    }

    #[test]
    fn test_text_is_escaped_on_one_line() {
        let line = format_row(&row!["multi\nline \"quoted\""]).unwrap();
        assert!(!line.contains('\n'));
        assert_eq!(line, r#"["multi\nline \"quoted\""]"#);
    }

    #[test]
    fn test_empty_row() {
        assert_eq!(format_row(&[]).unwrap(), "[]");
    }
}
