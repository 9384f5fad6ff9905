//! Value coercions applied by column mappings.

use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::config::Coercion;
use crate::core::{SqlNullType, SqlValue};

const TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

/// NULL type hint carried by a coerced NULL.
pub fn null_type(coercion: Coercion) -> SqlNullType {
    match coercion {
        Coercion::Text => SqlNullType::String,
        Coercion::Integer => SqlNullType::I32,
        Coercion::Bigint => SqlNullType::I64,
        Coercion::Float => SqlNullType::F64,
        Coercion::Boolean => SqlNullType::Bool,
        Coercion::Decimal => SqlNullType::Decimal,
        Coercion::Timestamp => SqlNullType::DateTime,
        Coercion::Date => SqlNullType::Date,
        Coercion::Uuid => SqlNullType::Uuid,
    }
}

/// Convert `value` as `coercion` demands. The error is a human-readable reason.
pub fn coerce(value: &SqlValue, coercion: Coercion) -> Result<SqlValue, String> {
    if value.is_null() {
        return Ok(SqlValue::Null(null_type(coercion)));
    }

    let converted = match coercion {
        Coercion::Text => Some(SqlValue::Text(display_text(value))),
        Coercion::Integer => to_i64(value)
            .and_then(|v| i32::try_from(v).ok())
            .map(SqlValue::I32),
        Coercion::Bigint => to_i64(value).map(SqlValue::I64),
        Coercion::Float => to_f64(value).map(SqlValue::F64),
        Coercion::Boolean => to_bool(value).map(SqlValue::Bool),
        Coercion::Decimal => to_decimal(value).map(SqlValue::Decimal),
        Coercion::Timestamp => to_timestamp(value).map(SqlValue::DateTime),
        Coercion::Date => to_date(value).map(SqlValue::Date),
        Coercion::Uuid => to_uuid(value).map(SqlValue::Uuid),
    };

    converted.ok_or_else(|| {
        format!(
            "cannot convert {:?} value '{}' to {}",
            value.null_type(),
            display_text(value),
            coercion
        )
    })
}

/// Plain text rendering, as a user would expect to read the value.
fn display_text(value: &SqlValue) -> String {
    match value {
        SqlValue::Bool(b) => b.to_string(),
        SqlValue::F32(v) => v.to_string(),
        SqlValue::F64(v) => v.to_string(),
        SqlValue::DateTime(dt) => dt.format("%Y-%m-%d %H:%M:%S%.f").to_string(),
        SqlValue::DateTimeOffset(dt) => dt.to_rfc3339(),
        other => other.canonical_text(),
    }
}

fn to_i64(value: &SqlValue) -> Option<i64> {
    match value {
        SqlValue::Bool(b) => Some(*b as i64),
        SqlValue::F32(v) => float_to_i64(*v as f64),
        SqlValue::F64(v) => float_to_i64(*v),
        SqlValue::Decimal(d) if d.fract().is_zero() => d.to_i64(),
        SqlValue::Text(s) => s.trim().parse().ok(),
        other => other.as_i64(),
    }
}

/// `i64::MAX as f64` rounds up to 2^63, which is out of range.
fn float_to_i64(v: f64) -> Option<i64> {
    if v.fract() == 0.0 && v >= i64::MIN as f64 && v < i64::MAX as f64 {
        Some(v as i64)
    } else {
        None
    }
}

fn to_f64(value: &SqlValue) -> Option<f64> {
    match value {
        SqlValue::F32(v) => Some(*v as f64),
        SqlValue::F64(v) => Some(*v),
        SqlValue::Decimal(d) => d.to_f64(),
        SqlValue::Text(s) => s.trim().parse().ok(),
        other => other.as_i64().map(|v| v as f64),
    }
}

fn to_bool(value: &SqlValue) -> Option<bool> {
    match value {
        SqlValue::Bool(b) => Some(*b),
        SqlValue::Text(s) => match s.trim().to_lowercase().as_str() {
            "true" | "t" | "yes" | "y" | "1" => Some(true),
            "false" | "f" | "no" | "n" | "0" => Some(false),
            _ => None,
        },
        other => match other.as_i64() {
            Some(0) => Some(false),
            Some(1) => Some(true),
            _ => None,
        },
    }
}

fn to_decimal(value: &SqlValue) -> Option<Decimal> {
    match value {
        SqlValue::Decimal(d) => Some(*d),
        SqlValue::F32(v) => Decimal::try_from(*v).ok(),
        SqlValue::F64(v) => Decimal::try_from(*v).ok(),
        SqlValue::Text(s) => Decimal::from_str(s.trim()).ok(),
        other => other.as_i64().map(Decimal::from),
    }
}

fn to_timestamp(value: &SqlValue) -> Option<NaiveDateTime> {
    match value {
        SqlValue::DateTime(dt) => Some(*dt),
        SqlValue::DateTimeOffset(dt) => Some(dt.naive_utc()),
        SqlValue::Date(d) => Some(d.and_time(NaiveTime::MIN)),
        SqlValue::Text(s) => parse_timestamp(s.trim()),
        _ => None,
    }
}

fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_utc());
    }
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .map(|d| d.and_time(NaiveTime::MIN))
        })
}

fn to_date(value: &SqlValue) -> Option<NaiveDate> {
    match value {
        SqlValue::Date(d) => Some(*d),
        SqlValue::DateTime(dt) => Some(dt.date()),
        SqlValue::DateTimeOffset(dt) => Some(dt.date_naive()),
        SqlValue::Text(s) => {
            let s = s.trim();
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .or_else(|| parse_timestamp(s).map(|dt| dt.date()))
        }
        _ => None,
    }
}

fn to_uuid(value: &SqlValue) -> Option<Uuid> {
    match value {
        SqlValue::Uuid(u) => Some(*u),
        SqlValue::Text(s) => Uuid::parse_str(s.trim()).ok(),
        SqlValue::Bytes(b) => Uuid::from_slice(b).ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    #[test]
    fn test_null_passes_through_every_coercion() {
        let null = SqlValue::Null(SqlNullType::String);
        for c in [Coercion::Integer, Coercion::Timestamp, Coercion::Uuid, Coercion::Text] {
            let out = coerce(&null, c).unwrap();
            assert!(out.is_null());
            assert_eq!(out.null_type(), null_type(c));
        }
    }

    #[test]
    fn test_text_to_timestamp_formats() {
        let want = ts("2024-03-01 12:30:00");
        for input in [
            "2024-03-01 12:30:00",
            "2024-03-01T12:30:00",
            "2024-03-01T12:30:00Z",
            "2024-03-01T14:30:00+02:00",
            " 2024-03-01 12:30 ",
        ] {
            assert_eq!(
                coerce(&SqlValue::from(input), Coercion::Timestamp).unwrap(),
                SqlValue::DateTime(want),
                "input {input}"
            );
        }
        assert_eq!(
            coerce(&SqlValue::from("2024-03-01"), Coercion::Timestamp).unwrap(),
            SqlValue::DateTime(ts("2024-03-01 00:00:00"))
        );
    }

    #[test]
    fn test_bad_timestamp_is_error() {
        let err = coerce(&SqlValue::from("yesterday"), Coercion::Timestamp).unwrap_err();
        assert!(err.contains("yesterday"));
        assert!(err.contains("timestamp"));
    }

    #[test]
    fn test_integer_range_checked() {
        assert_eq!(coerce(&SqlValue::from("42"), Coercion::Integer).unwrap(), SqlValue::I32(42));
        assert!(coerce(&SqlValue::I64(i64::MAX), Coercion::Integer).is_err());
        assert_eq!(
            coerce(&SqlValue::I64(i64::MAX), Coercion::Bigint).unwrap(),
            SqlValue::I64(i64::MAX)
        );
        assert!(coerce(&SqlValue::F64(1.5), Coercion::Bigint).is_err());
        assert_eq!(coerce(&SqlValue::F64(3.0), Coercion::Bigint).unwrap(), SqlValue::I64(3));
    }

    #[test]
    fn test_float_at_i64_boundary() {
        let two_pow_63 = 9_223_372_036_854_775_808.0_f64;
        assert!(coerce(&SqlValue::F64(two_pow_63), Coercion::Bigint).is_err());
        assert_eq!(
            coerce(&SqlValue::F64(-two_pow_63), Coercion::Bigint).unwrap(),
            SqlValue::I64(i64::MIN)
        );
        assert!(coerce(&SqlValue::F64(f64::NAN), Coercion::Bigint).is_err());
    }

    #[test]
    fn test_boolean_spellings() {
        for (input, want) in [("TRUE", true), ("f", false), ("yes", true), ("0", false)] {
            assert_eq!(
                coerce(&SqlValue::from(input), Coercion::Boolean).unwrap(),
                SqlValue::Bool(want)
            );
        }
        assert_eq!(coerce(&SqlValue::I32(1), Coercion::Boolean).unwrap(), SqlValue::Bool(true));
        assert!(coerce(&SqlValue::I32(2), Coercion::Boolean).is_err());
        assert!(coerce(&SqlValue::from("maybe"), Coercion::Boolean).is_err());
    }

    #[test]
    fn test_decimal_and_text() {
        assert_eq!(
            coerce(&SqlValue::from("19.990"), Coercion::Decimal).unwrap(),
            SqlValue::Decimal(Decimal::new(19990, 3))
        );
        assert_eq!(coerce(&SqlValue::I32(7), Coercion::Text).unwrap(), SqlValue::from("7"));
        assert_eq!(
            coerce(&SqlValue::Bool(false), Coercion::Text).unwrap(),
            SqlValue::from("false")
        );
    }

    #[test]
    fn test_uuid_and_date() {
        let id = Uuid::new_v4();
        assert_eq!(
            coerce(&SqlValue::Text(id.to_string()), Coercion::Uuid).unwrap(),
            SqlValue::Uuid(id)
        );
        assert_eq!(
            coerce(&SqlValue::DateTime(ts("2024-03-01 12:30:00")), Coercion::Date).unwrap(),
            SqlValue::Date(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap())
        );
    }
}
