//! Per-column type coercion policy.
//!
//! Maps a raw source value through its column descriptor to a
//! destination-ready [`PgValue`], or to a [`ConversionFailure`] describing
//! exactly why the value cannot cross. The policy is total: every expected
//! domain mismatch yields a typed failure, never a silent truncation, wrap,
//! or panic.

use crate::catalog::{ColumnDescriptor, SourceType, TableDescriptor};
use crate::error::{ReplicateError, Result};
use crate::value::{PgValue, RawValue, SourceRow};
use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// Why a value could not be converted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureReason {
    NumericOverflow,
    InvalidNumeric,
    InvalidBoolean,
    InvalidUuid,
    TimestampOutOfRange,
    InvalidTimestamp,
    LengthExceeded,
    UnexpectedNull,
    SourceTypeMismatch,
}

impl FailureReason {
    /// Stable kebab-case tag used in reports and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::NumericOverflow => "numeric-overflow",
            FailureReason::InvalidNumeric => "invalid-numeric",
            FailureReason::InvalidBoolean => "invalid-boolean",
            FailureReason::InvalidUuid => "invalid-uuid",
            FailureReason::TimestampOutOfRange => "timestamp-out-of-range",
            FailureReason::InvalidTimestamp => "invalid-timestamp",
            FailureReason::LengthExceeded => "length-exceeded",
            FailureReason::UnexpectedNull => "unexpected-null",
            FailureReason::SourceTypeMismatch => "source-type-mismatch",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A per-row, per-column conversion failure. Collected as data and surfaced
/// in the run report; never raised as an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversionFailure {
    pub column: String,
    pub reason: FailureReason,
    pub raw_value: String,
}

impl ConversionFailure {
    fn new(column: &str, reason: FailureReason, raw: &RawValue) -> Self {
        Self {
            column: column.to_string(),
            reason,
            raw_value: raw.render(),
        }
    }
}

/// A row after coercion: destination-ready values plus any failures.
///
/// A row carrying failures must never be written; the pipeline reports and
/// skips it.
#[derive(Debug, Clone)]
pub struct CoercedRow {
    pub values: Vec<PgValue>,
    pub failures: Vec<ConversionFailure>,
}

impl CoercedRow {
    /// Whether every column converted cleanly.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Coerce one source row column-by-column.
///
/// The row's values must align with the descriptor's column order; an arity
/// mismatch is a programmer error in the source reader and is fatal.
pub fn coerce_row(table: &TableDescriptor, row: &SourceRow) -> Result<CoercedRow> {
    if row.values.len() != table.columns.len() {
        return Err(ReplicateError::transfer(
            table.name.clone(),
            format!(
                "source row has {} values for {} columns",
                row.values.len(),
                table.columns.len()
            ),
        ));
    }

    let mut values = Vec::with_capacity(table.columns.len());
    let mut failures = Vec::new();

    for (col, raw) in table.columns.iter().zip(&row.values) {
        match coerce_value(col, raw) {
            Ok(value) => values.push(value),
            Err(failure) => {
                values.push(PgValue::Null);
                failures.push(failure);
            }
        }
    }

    Ok(CoercedRow { values, failures })
}

/// Coerce a single raw value through its column descriptor.
pub fn coerce_value(
    col: &ColumnDescriptor,
    raw: &RawValue,
) -> std::result::Result<PgValue, ConversionFailure> {
    if matches!(raw, RawValue::Null) {
        return if col.nullable {
            Ok(PgValue::Null)
        } else {
            Err(ConversionFailure::new(
                &col.name,
                FailureReason::UnexpectedNull,
                raw,
            ))
        };
    }

    match &col.source_type {
        SourceType::SmallInt => coerce_small_int(col, raw),
        SourceType::Int => coerce_int(col, raw),
        SourceType::Numeric { precision, scale } => coerce_numeric(col, *precision, *scale, raw),
        SourceType::Bool => coerce_bool(col, raw),
        SourceType::Uuid => coerce_uuid(col, raw),
        SourceType::Timestamp => coerce_timestamp(col, raw),
        SourceType::VarText | SourceType::FixedText => coerce_text(col, raw),
        SourceType::Binary => coerce_binary(col, raw),
    }
}

fn mismatch(col: &ColumnDescriptor, raw: &RawValue) -> ConversionFailure {
    ConversionFailure::new(&col.name, FailureReason::SourceTypeMismatch, raw)
}

fn coerce_small_int(
    col: &ColumnDescriptor,
    raw: &RawValue,
) -> std::result::Result<PgValue, ConversionFailure> {
    let wide = parse_raw_integer(col, raw)?;
    i16::try_from(wide).map(PgValue::SmallInt).map_err(|_| {
        ConversionFailure::new(&col.name, FailureReason::NumericOverflow, raw)
    })
}

fn coerce_int(
    col: &ColumnDescriptor,
    raw: &RawValue,
) -> std::result::Result<PgValue, ConversionFailure> {
    let wide = parse_raw_integer(col, raw)?;
    i32::try_from(wide).map(PgValue::Int).map_err(|_| {
        ConversionFailure::new(&col.name, FailureReason::NumericOverflow, raw)
    })
}

fn parse_raw_integer(
    col: &ColumnDescriptor,
    raw: &RawValue,
) -> std::result::Result<i64, ConversionFailure> {
    match raw {
        RawValue::Int(v) => Ok(*v),
        RawValue::Text(s) => s.trim().parse::<i64>().map_err(|_| {
            ConversionFailure::new(&col.name, FailureReason::InvalidNumeric, raw)
        }),
        _ => Err(mismatch(col, raw)),
    }
}

/// Arbitrary-precision numeric coercion.
///
/// The integer-digit check runs textually before parsing (so values beyond
/// `Decimal`'s 28-digit range still report overflow, not a parse error) and
/// again after rounding, because rounding half-away-from-zero can carry into
/// a new integer digit (9.99995 at scale 4 becomes 10.0000).
fn coerce_numeric(
    col: &ColumnDescriptor,
    precision: u32,
    scale: u32,
    raw: &RawValue,
) -> std::result::Result<PgValue, ConversionFailure> {
    let text = match raw {
        RawValue::Text(s) => s.trim().to_string(),
        RawValue::Int(v) => v.to_string(),
        _ => return Err(mismatch(col, raw)),
    };

    let max_integer_digits = precision.saturating_sub(scale);

    let int_digits = match text_integer_digits(&text) {
        Some(n) => n,
        None => {
            return Err(ConversionFailure::new(
                &col.name,
                FailureReason::InvalidNumeric,
                raw,
            ))
        }
    };
    if int_digits > max_integer_digits {
        return Err(ConversionFailure::new(
            &col.name,
            FailureReason::NumericOverflow,
            raw,
        ));
    }

    let parsed = Decimal::from_str(&text).map_err(|_| {
        ConversionFailure::new(&col.name, FailureReason::InvalidNumeric, raw)
    })?;

    let rounded = parsed.round_dp_with_strategy(scale, RoundingStrategy::MidpointAwayFromZero);
    if decimal_integer_digits(&rounded) > max_integer_digits {
        return Err(ConversionFailure::new(
            &col.name,
            FailureReason::NumericOverflow,
            raw,
        ));
    }

    Ok(PgValue::Numeric(rounded))
}

/// Count significant integer digits in a plain decimal string.
///
/// Returns `None` when the string is not a plain signed decimal (scientific
/// notation and stray characters are rejected here; `Decimal::from_str`
/// never sees them).
fn text_integer_digits(text: &str) -> Option<u32> {
    let unsigned = text.strip_prefix(['-', '+']).unwrap_or(text);
    if unsigned.is_empty() {
        return None;
    }

    let (int_part, frac_part) = match unsigned.split_once('.') {
        Some((i, f)) => (i, f),
        None => (unsigned, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }
    if !int_part.chars().all(|c| c.is_ascii_digit())
        || !frac_part.chars().all(|c| c.is_ascii_digit())
    {
        return None;
    }

    Some(int_part.trim_start_matches('0').len() as u32)
}

fn decimal_integer_digits(value: &Decimal) -> u32 {
    let truncated = value.trunc();
    if truncated.is_zero() {
        return 0;
    }
    let rendered = truncated.abs().to_string();
    let int_part = rendered.split('.').next().unwrap_or("");
    int_part.trim_start_matches('0').len() as u32
}

/// Boolean from the source's bit encoding: exactly {0, 1, "0", "1", true,
/// false}. Anything else is invalid.
fn coerce_bool(
    col: &ColumnDescriptor,
    raw: &RawValue,
) -> std::result::Result<PgValue, ConversionFailure> {
    let value = match raw {
        RawValue::Bool(b) => Some(*b),
        RawValue::Int(0) => Some(false),
        RawValue::Int(1) => Some(true),
        RawValue::Text(s) => match s.trim() {
            "0" => Some(false),
            "1" => Some(true),
            _ => None,
        },
        _ => None,
    };

    value.map(PgValue::Bool).ok_or_else(|| {
        ConversionFailure::new(&col.name, FailureReason::InvalidBoolean, raw)
    })
}

/// GUID normalization to the canonical lowercase hyphenated form.
///
/// Accepts the textual shapes the source emits (braced, hyphenated, simple,
/// any case); normalization is idempotent.
fn coerce_uuid(
    col: &ColumnDescriptor,
    raw: &RawValue,
) -> std::result::Result<PgValue, ConversionFailure> {
    match raw {
        RawValue::Text(s) => uuid::Uuid::parse_str(s.trim())
            .map(PgValue::Uuid)
            .map_err(|_| ConversionFailure::new(&col.name, FailureReason::InvalidUuid, raw)),
        _ => Err(mismatch(col, raw)),
    }
}

/// Lowest timestamp PostgreSQL can store (Julian day zero).
fn pg_timestamp_min() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(-4713, 11, 24)
        .expect("valid constant date")
        .and_hms_opt(0, 0, 0)
        .expect("valid constant time")
}

/// Naive timestamps pass through unchanged: the source stores local
/// wall-clock time without zone information, and inventing a zone here
/// would corrupt it. Only the destination's representable range is checked.
/// (`chrono`'s maximum year is below PostgreSQL's upper bound, so once a
/// value parses only the lower bound can be violated.)
fn coerce_timestamp(
    col: &ColumnDescriptor,
    raw: &RawValue,
) -> std::result::Result<PgValue, ConversionFailure> {
    let dt = match raw {
        RawValue::DateTime(dt) => *dt,
        RawValue::Text(s) => parse_timestamp_text(s.trim()).ok_or_else(|| {
            ConversionFailure::new(&col.name, FailureReason::InvalidTimestamp, raw)
        })?,
        _ => return Err(mismatch(col, raw)),
    };

    if dt < pg_timestamp_min() {
        return Err(ConversionFailure::new(
            &col.name,
            FailureReason::TimestampOutOfRange,
            raw,
        ));
    }

    Ok(PgValue::Timestamp(dt))
}

fn parse_timestamp_text(text: &str) -> Option<NaiveDateTime> {
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, format) {
            return Some(dt);
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

/// Length-validated text. Exceeding the declared maximum is a failure, not
/// a truncation: truncating would corrupt business identifiers.
fn coerce_text(
    col: &ColumnDescriptor,
    raw: &RawValue,
) -> std::result::Result<PgValue, ConversionFailure> {
    match raw {
        RawValue::Text(s) => {
            if let Some(max) = col.max_length {
                if s.chars().count() as u32 > max {
                    return Err(ConversionFailure::new(
                        &col.name,
                        FailureReason::LengthExceeded,
                        raw,
                    ));
                }
            }
            Ok(PgValue::Text(s.clone()))
        }
        _ => Err(mismatch(col, raw)),
    }
}

fn coerce_binary(
    col: &ColumnDescriptor,
    raw: &RawValue,
) -> std::result::Result<PgValue, ConversionFailure> {
    match raw {
        RawValue::Bytes(b) => Ok(PgValue::Bytes(b.clone())),
        _ => Err(mismatch(col, raw)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn column(source_type: SourceType) -> ColumnDescriptor {
        ColumnDescriptor {
            name: "c".to_string(),
            source_type,
            nullable: false,
            max_length: None,
        }
    }

    fn numeric_column(precision: u32, scale: u32) -> ColumnDescriptor {
        column(SourceType::Numeric { precision, scale })
    }

    fn text_column(max_length: u32) -> ColumnDescriptor {
        ColumnDescriptor {
            max_length: Some(max_length),
            ..column(SourceType::VarText)
        }
    }

    fn reason(result: std::result::Result<PgValue, ConversionFailure>) -> FailureReason {
        result.unwrap_err().reason
    }

    #[test]
    fn test_numeric_within_precision() {
        let col = numeric_column(18, 4);
        let v = coerce_value(&col, &RawValue::Text("12345.678".into())).unwrap();
        assert_eq!(v, PgValue::Numeric(Decimal::from_str("12345.6780").unwrap()));
    }

    #[test]
    fn test_numeric_overflow_boundary() {
        // numeric(18,4) holds at most 14 integer digits.
        let col = numeric_column(18, 4);
        let max_ok = "9".repeat(14);
        assert!(coerce_value(&col, &RawValue::Text(max_ok)).is_ok());

        let too_big = "1".to_string() + &"0".repeat(14);
        assert_eq!(
            reason(coerce_value(&col, &RawValue::Text(too_big))),
            FailureReason::NumericOverflow
        );
    }

    #[test]
    fn test_numeric_overflow_huge_value() {
        // 21 integer digits against numeric(18,4); also exceeds what a
        // Decimal mantissa can hold, so the textual pre-check must catch it.
        let col = numeric_column(18, 4);
        assert_eq!(
            reason(coerce_value(
                &col,
                &RawValue::Text("100000000000000000000".into())
            )),
            FailureReason::NumericOverflow
        );
    }

    #[test]
    fn test_numeric_rounds_half_away_from_zero() {
        let col = numeric_column(10, 2);
        let v = coerce_value(&col, &RawValue::Text("1.005".into())).unwrap();
        assert_eq!(v, PgValue::Numeric(Decimal::from_str("1.01").unwrap()));

        let v = coerce_value(&col, &RawValue::Text("-1.005".into())).unwrap();
        assert_eq!(v, PgValue::Numeric(Decimal::from_str("-1.01").unwrap()));
    }

    #[test]
    fn test_numeric_rounding_carry_overflows() {
        // 9.99995 rounds to 10.0000, which no longer fits numeric(5,4).
        let col = numeric_column(5, 4);
        assert_eq!(
            reason(coerce_value(&col, &RawValue::Text("9.99995".into()))),
            FailureReason::NumericOverflow
        );
    }

    #[test]
    fn test_numeric_invalid_text() {
        let col = numeric_column(10, 2);
        assert_eq!(
            reason(coerce_value(&col, &RawValue::Text("12,50".into()))),
            FailureReason::InvalidNumeric
        );
        assert_eq!(
            reason(coerce_value(&col, &RawValue::Text("1e5".into()))),
            FailureReason::InvalidNumeric
        );
    }

    #[test]
    fn test_numeric_from_integer_raw() {
        let col = numeric_column(10, 2);
        let v = coerce_value(&col, &RawValue::Int(-42)).unwrap();
        assert_eq!(v, PgValue::Numeric(Decimal::from_str("-42.00").unwrap()));
    }

    #[test]
    fn test_numeric_leading_zeros_ignored() {
        let col = numeric_column(3, 2);
        let v = coerce_value(&col, &RawValue::Text("000.50".into())).unwrap();
        assert_eq!(v, PgValue::Numeric(Decimal::from_str("0.50").unwrap()));
    }

    #[test]
    fn test_small_int_range() {
        let col = column(SourceType::SmallInt);
        assert_eq!(
            coerce_value(&col, &RawValue::Int(32767)).unwrap(),
            PgValue::SmallInt(32767)
        );
        assert_eq!(
            reason(coerce_value(&col, &RawValue::Int(32768))),
            FailureReason::NumericOverflow
        );
    }

    #[test]
    fn test_int_from_text() {
        let col = column(SourceType::Int);
        assert_eq!(
            coerce_value(&col, &RawValue::Text(" -7 ".into())).unwrap(),
            PgValue::Int(-7)
        );
        assert_eq!(
            reason(coerce_value(&col, &RawValue::Int(i64::MAX))),
            FailureReason::NumericOverflow
        );
    }

    #[test]
    fn test_boolean_accepted_encodings() {
        let col = column(SourceType::Bool);
        assert_eq!(
            coerce_value(&col, &RawValue::Bool(true)).unwrap(),
            PgValue::Bool(true)
        );
        assert_eq!(
            coerce_value(&col, &RawValue::Int(0)).unwrap(),
            PgValue::Bool(false)
        );
        assert_eq!(
            coerce_value(&col, &RawValue::Text("1".into())).unwrap(),
            PgValue::Bool(true)
        );
    }

    #[test]
    fn test_boolean_rejected_encodings() {
        let col = column(SourceType::Bool);
        assert_eq!(
            reason(coerce_value(&col, &RawValue::Int(2))),
            FailureReason::InvalidBoolean
        );
        assert_eq!(
            reason(coerce_value(&col, &RawValue::Text("yes".into()))),
            FailureReason::InvalidBoolean
        );
        assert_eq!(
            reason(coerce_value(&col, &RawValue::Text("true".into()))),
            FailureReason::InvalidBoolean
        );
    }

    #[test]
    fn test_uuid_normalizes_case_and_braces() {
        let col = column(SourceType::Uuid);
        let raw = RawValue::Text("{6F9619FF-8B86-D011-B42D-00C04FC964FF}".into());
        let v = coerce_value(&col, &raw).unwrap();
        assert_eq!(
            v,
            PgValue::Uuid(Uuid::parse_str("6f9619ff-8b86-d011-b42d-00c04fc964ff").unwrap())
        );
    }

    #[test]
    fn test_uuid_normalization_idempotent() {
        let col = column(SourceType::Uuid);
        let first = match coerce_value(&col, &RawValue::Text("6F9619FF8B86D011B42D00C04FC964FF".into()))
        {
            Ok(PgValue::Uuid(u)) => u.hyphenated().to_string(),
            other => panic!("unexpected: {:?}", other),
        };
        let second = match coerce_value(&col, &RawValue::Text(first.clone())) {
            Ok(PgValue::Uuid(u)) => u.hyphenated().to_string(),
            other => panic!("unexpected: {:?}", other),
        };
        assert_eq!(first, second);
        assert_eq!(first, "6f9619ff-8b86-d011-b42d-00c04fc964ff");
    }

    #[test]
    fn test_uuid_malformed_rejected() {
        let col = column(SourceType::Uuid);
        assert_eq!(
            reason(coerce_value(&col, &RawValue::Text("not-a-guid".into()))),
            FailureReason::InvalidUuid
        );
    }

    #[test]
    fn test_timestamp_naive_passthrough() {
        let col = column(SourceType::Timestamp);
        let dt = NaiveDate::from_ymd_opt(2024, 6, 1)
            .unwrap()
            .and_hms_opt(13, 30, 5)
            .unwrap();
        assert_eq!(
            coerce_value(&col, &RawValue::DateTime(dt)).unwrap(),
            PgValue::Timestamp(dt)
        );
    }

    #[test]
    fn test_timestamp_below_range_rejected() {
        let col = column(SourceType::Timestamp);
        let ancient = NaiveDate::from_ymd_opt(-4800, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        assert_eq!(
            reason(coerce_value(&col, &RawValue::DateTime(ancient))),
            FailureReason::TimestampOutOfRange
        );
    }

    #[test]
    fn test_timestamp_from_text() {
        let col = column(SourceType::Timestamp);
        let v = coerce_value(&col, &RawValue::Text("2024-06-01 13:30:05.250".into())).unwrap();
        let expected = NaiveDate::from_ymd_opt(2024, 6, 1)
            .unwrap()
            .and_hms_milli_opt(13, 30, 5, 250)
            .unwrap();
        assert_eq!(v, PgValue::Timestamp(expected));

        assert_eq!(
            reason(coerce_value(&col, &RawValue::Text("June 1st".into()))),
            FailureReason::InvalidTimestamp
        );
    }

    #[test]
    fn test_text_length_enforced() {
        let col = text_column(5);
        assert_eq!(
            coerce_value(&col, &RawValue::Text("abcde".into())).unwrap(),
            PgValue::Text("abcde".into())
        );
        assert_eq!(
            reason(coerce_value(&col, &RawValue::Text("abcdef".into()))),
            FailureReason::LengthExceeded
        );
    }

    #[test]
    fn test_text_length_counts_chars_not_bytes() {
        let col = text_column(3);
        assert!(coerce_value(&col, &RawValue::Text("äöü".into())).is_ok());
    }

    #[test]
    fn test_binary_passthrough() {
        let col = column(SourceType::Binary);
        assert_eq!(
            coerce_value(&col, &RawValue::Bytes(vec![0xde, 0xad])).unwrap(),
            PgValue::Bytes(vec![0xde, 0xad])
        );
        assert_eq!(
            reason(coerce_value(&col, &RawValue::Text("blob".into()))),
            FailureReason::SourceTypeMismatch
        );
    }

    #[test]
    fn test_null_handling() {
        let nullable = ColumnDescriptor {
            nullable: true,
            ..column(SourceType::Int)
        };
        assert_eq!(coerce_value(&nullable, &RawValue::Null).unwrap(), PgValue::Null);

        let required = column(SourceType::Int);
        assert_eq!(
            reason(coerce_value(&required, &RawValue::Null)),
            FailureReason::UnexpectedNull
        );
    }

    #[test]
    fn test_coerce_row_collects_failures() {
        let table = TableDescriptor {
            name: "t".into(),
            columns: vec![
                column(SourceType::Int),
                ColumnDescriptor {
                    name: "flag".into(),
                    ..column(SourceType::Bool)
                },
            ],
            primary_key: vec!["c".into()],
            foreign_keys: vec![],
            depth_column: None,
        };

        let row = SourceRow::new(vec![RawValue::Int(1), RawValue::Text("maybe".into())]);
        let coerced = coerce_row(&table, &row).unwrap();
        assert!(!coerced.is_clean());
        assert_eq!(coerced.failures.len(), 1);
        assert_eq!(coerced.failures[0].column, "flag");
        assert_eq!(coerced.failures[0].reason, FailureReason::InvalidBoolean);
        assert_eq!(coerced.failures[0].raw_value, "maybe");
    }

    #[test]
    fn test_coerce_row_arity_mismatch_is_fatal() {
        let table = TableDescriptor {
            name: "t".into(),
            columns: vec![column(SourceType::Int)],
            primary_key: vec!["c".into()],
            foreign_keys: vec![],
            depth_column: None,
        };
        let row = SourceRow::new(vec![RawValue::Int(1), RawValue::Int(2)]);
        assert!(coerce_row(&table, &row).is_err());
    }
}
