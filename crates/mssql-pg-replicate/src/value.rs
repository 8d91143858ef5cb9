//! Value types carried through the replication pipeline.
//!
//! [`RawValue`] is what the source driver hands us: loosely typed, with
//! numerics and GUIDs as text and timestamps as native values. [`PgValue`]
//! is a destination-ready value produced by the coercion policy, bindable
//! as a statement parameter.

use bytes::BytesMut;
use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};
use uuid::Uuid;

/// A raw, untyped source value as produced by the source driver.
///
/// Numeric and GUID columns arrive as text (the reader casts them
/// server-side), date/time columns as native values, everything else in the
/// closest wire shape. Created per fetched record and discarded after
/// coercion; never persisted.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
    Bytes(Vec<u8>),
    DateTime(NaiveDateTime),
}

impl RawValue {
    /// Short kind tag for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            RawValue::Null => "null",
            RawValue::Bool(_) => "bool",
            RawValue::Int(_) => "int",
            RawValue::Text(_) => "text",
            RawValue::Bytes(_) => "bytes",
            RawValue::DateTime(_) => "datetime",
        }
    }

    /// Render the raw value for failure reports.
    ///
    /// Byte payloads are summarized by length rather than dumped.
    pub fn render(&self) -> String {
        match self {
            RawValue::Null => "NULL".to_string(),
            RawValue::Bool(v) => v.to_string(),
            RawValue::Int(v) => v.to_string(),
            RawValue::Text(v) => v.clone(),
            RawValue::Bytes(v) => format!("<{} bytes>", v.len()),
            RawValue::DateTime(v) => v.to_string(),
        }
    }
}

/// One fetched source record: raw values aligned with the owning
/// [`crate::catalog::TableDescriptor`]'s column order.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRow {
    pub values: Vec<RawValue>,
}

impl SourceRow {
    pub fn new(values: Vec<RawValue>) -> Self {
        Self { values }
    }
}

/// A destination-ready typed value.
///
/// Every variant binds as a parameter through the [`ToSql`] implementation
/// below, so batches are written with parameterized statements rather than
/// interpolated literals.
#[derive(Debug, Clone, PartialEq)]
pub enum PgValue {
    Null,
    Bool(bool),
    SmallInt(i16),
    Int(i32),
    Numeric(Decimal),
    Uuid(Uuid),
    Timestamp(NaiveDateTime),
    Text(String),
    Bytes(Vec<u8>),
}

impl PgValue {
    /// Check if this value is NULL.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, PgValue::Null)
    }
}

impl ToSql for PgValue {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> std::result::Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        match self {
            PgValue::Null => Ok(IsNull::Yes),
            PgValue::Bool(v) => v.to_sql(ty, out),
            PgValue::SmallInt(v) => v.to_sql(ty, out),
            PgValue::Int(v) => v.to_sql(ty, out),
            PgValue::Numeric(v) => v.to_sql(ty, out),
            PgValue::Uuid(v) => v.to_sql(ty, out),
            PgValue::Timestamp(v) => v.to_sql(ty, out),
            PgValue::Text(v) => v.to_sql(ty, out),
            PgValue::Bytes(v) => v.to_sql(ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        // Variant/column compatibility is established by the coercion policy;
        // the inner to_sql call still validates the concrete pairing.
        true
    }

    to_sql_checked!();
}

impl From<bool> for PgValue {
    fn from(v: bool) -> Self {
        PgValue::Bool(v)
    }
}

impl From<i16> for PgValue {
    fn from(v: i16) -> Self {
        PgValue::SmallInt(v)
    }
}

impl From<i32> for PgValue {
    fn from(v: i32) -> Self {
        PgValue::Int(v)
    }
}

impl From<Decimal> for PgValue {
    fn from(v: Decimal) -> Self {
        PgValue::Numeric(v)
    }
}

impl From<Uuid> for PgValue {
    fn from(v: Uuid) -> Self {
        PgValue::Uuid(v)
    }
}

impl From<NaiveDateTime> for PgValue {
    fn from(v: NaiveDateTime) -> Self {
        PgValue::Timestamp(v)
    }
}

impl From<String> for PgValue {
    fn from(v: String) -> Self {
        PgValue::Text(v)
    }
}

impl From<Vec<u8>> for PgValue {
    fn from(v: Vec<u8>) -> Self {
        PgValue::Bytes(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_value_render() {
        assert_eq!(RawValue::Null.render(), "NULL");
        assert_eq!(RawValue::Int(42).render(), "42");
        assert_eq!(RawValue::Text("abc".into()).render(), "abc");
        assert_eq!(RawValue::Bytes(vec![1, 2, 3]).render(), "<3 bytes>");
    }

    #[test]
    fn test_pg_value_is_null() {
        assert!(PgValue::Null.is_null());
        assert!(!PgValue::Int(7).is_null());
    }

    #[test]
    fn test_from_implementations() {
        let v: PgValue = 42i32.into();
        assert_eq!(v, PgValue::Int(42));

        let v: PgValue = "hello".to_string().into();
        assert_eq!(v, PgValue::Text("hello".to_string()));
    }
}
