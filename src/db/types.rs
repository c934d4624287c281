//! Row decoding for the sqlx driver.
//!
//! Columns are first classified into a [`TypeCategory`], then decoded by a
//! backend-specific function into JSON. PostgreSQL columns are classified by
//! their declared type, SQLite values by their storage class. Values that
//! cannot be decoded become `null` and are logged.

use crate::models::DatabaseType;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde_json::{Map, Value as JsonValue};
use std::fmt::Write as _;
use sqlx::encode::IsNull;
use sqlx::error::BoxDynError;
use sqlx::postgres::types::Oid;
use sqlx::postgres::{PgArgumentBuffer, PgRow, PgTypeInfo, PgValueFormat, PgValueRef};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Decode, Encode, Row, Type, TypeInfo, ValueRef};

/// Logical category of a column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Integer,
    Float,
    Decimal,
    Boolean,
    Text,
    Binary,
    Json,
}

/// Classify a declared column type.
pub fn categorize_type(type_name: &str, backend: DatabaseType) -> TypeCategory {
    let lower = type_name.to_ascii_lowercase();

    // Before the float check: "numeric" would otherwise be ambiguous
    if lower.contains("numeric") || lower.contains("decimal") {
        return match backend {
            // NUMERIC affinity holds plain integers or reals
            DatabaseType::SQLite => TypeCategory::Float,
            DatabaseType::PostgreSQL => TypeCategory::Decimal,
        };
    }
    if lower == "bool" || lower == "boolean" {
        return TypeCategory::Boolean;
    }
    if (lower.contains("int") && !lower.contains("interval") && lower != "point")
        || lower.contains("serial")
    {
        return TypeCategory::Integer;
    }
    if lower.contains("float") || lower.contains("double") || lower == "real" {
        return TypeCategory::Float;
    }
    if lower == "json" || lower == "jsonb" {
        return TypeCategory::Json;
    }
    if lower.contains("blob") || lower == "bytea" {
        return TypeCategory::Binary;
    }
    TypeCategory::Text
}

/// NUMERIC kept as its exact textual representation.
#[derive(Debug)]
pub struct RawDecimal(pub String);

impl Type<sqlx::Postgres> for RawDecimal {
    fn type_info() -> PgTypeInfo {
        PgTypeInfo::with_name("NUMERIC")
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        ty.name().eq_ignore_ascii_case("numeric")
    }
}

impl<'r> Decode<'r, sqlx::Postgres> for RawDecimal {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        match value.format() {
            PgValueFormat::Text => Ok(RawDecimal(value.as_str()?.to_string())),
            PgValueFormat::Binary => numeric_from_binary(value.as_bytes()?).map(RawDecimal),
        }
    }
}

/// A NULL parameter whose type the server infers from context, so
/// `age = $1` or an INT column in an INSERT accept it.
#[derive(Debug, Clone, Copy)]
pub struct UntypedNull;

impl Type<sqlx::Postgres> for UntypedNull {
    fn type_info() -> PgTypeInfo {
        // OID 0 leaves the parameter type unspecified
        PgTypeInfo::with_oid(Oid(0))
    }

    fn compatible(_ty: &PgTypeInfo) -> bool {
        true
    }
}

impl Encode<'_, sqlx::Postgres> for UntypedNull {
    fn encode_by_ref(&self, _buf: &mut PgArgumentBuffer) -> Result<IsNull, BoxDynError> {
        Ok(IsNull::Yes)
    }
}

/// Render the binary NUMERIC wire format: base-10000 digit groups with a
/// group weight, a sign word and the display scale.
fn numeric_from_binary(buf: &[u8]) -> Result<String, BoxDynError> {
    let word = |i: usize| -> Result<i16, BoxDynError> {
        buf.get(i..i + 2)
            .map(|b| i16::from_be_bytes([b[0], b[1]]))
            .ok_or_else(|| "truncated NUMERIC value".into())
    };

    let ndigits = word(0)?.max(0) as usize;
    let weight = word(2)? as i32;
    let sign = word(4)? as u16;
    let dscale = word(6)?.max(0) as usize;
    match sign {
        0xC000 => return Ok("NaN".to_string()),
        0xD000 => return Ok("Infinity".to_string()),
        0xF000 => return Ok("-Infinity".to_string()),
        _ => {}
    }
    let digits = (0..ndigits)
        .map(|i| word(8 + 2 * i))
        .collect::<Result<Vec<_>, _>>()?;
    let group = |i: i32| -> i16 {
        usize::try_from(i)
            .ok()
            .and_then(|i| digits.get(i).copied())
            .unwrap_or(0)
    };

    let mut out = String::new();
    if sign == 0x4000 {
        out.push('-');
    }
    if weight < 0 {
        out.push('0');
    } else {
        write!(out, "{}", group(0))?;
        for i in 1..=weight {
            write!(out, "{:04}", group(i))?;
        }
    }
    if dscale > 0 {
        let mut frac = String::new();
        let mut i = weight + 1;
        while frac.len() < dscale {
            write!(frac, "{:04}", group(i))?;
            i += 1;
        }
        frac.truncate(dscale);
        out.push('.');
        out.push_str(&frac);
    }
    Ok(out)
}

/// Binary column values are returned base64-encoded.
pub fn encode_binary(bytes: &[u8]) -> JsonValue {
    JsonValue::String(STANDARD.encode(bytes))
}

fn float_to_json(v: f64) -> JsonValue {
    serde_json::Number::from_f64(v)
        .map(JsonValue::Number)
        .unwrap_or_else(|| JsonValue::String(v.to_string()))
}

fn or_null<T>(
    result: Result<Option<T>, sqlx::Error>,
    column: &str,
    f: impl FnOnce(T) -> JsonValue,
) -> JsonValue {
    match result {
        Ok(Some(v)) => f(v),
        Ok(None) => JsonValue::Null,
        Err(e) => {
            tracing::warn!(column, error = %e, "Failed to decode column, returning null");
            JsonValue::Null
        }
    }
}

/// Convert a driver row into a JSON object keyed by column name.
pub trait RowToJson {
    fn to_json_map(&self) -> Map<String, JsonValue>;
}

impl RowToJson for PgRow {
    fn to_json_map(&self) -> Map<String, JsonValue> {
        self.columns()
            .iter()
            .map(|col| {
                let type_name = col.type_info().name();
                let value = decode_pg_column(self, col.ordinal(), col.name(), type_name);
                (col.name().to_string(), value)
            })
            .collect()
    }
}

impl RowToJson for SqliteRow {
    fn to_json_map(&self) -> Map<String, JsonValue> {
        self.columns()
            .iter()
            .map(|col| {
                let type_name = col.type_info().name();
                let value = decode_sqlite_column(self, col.ordinal(), col.name(), type_name);
                (col.name().to_string(), value)
            })
            .collect()
    }
}

fn decode_pg_column(row: &PgRow, idx: usize, name: &str, type_name: &str) -> JsonValue {
    match categorize_type(type_name, DatabaseType::PostgreSQL) {
        // Postgres integer widths are strict; decode with the exact width
        TypeCategory::Integer => match type_name.to_ascii_uppercase().as_str() {
            "INT2" | "SMALLINT" | "SMALLSERIAL" => {
                or_null(row.try_get::<Option<i16>, _>(idx), name, |v| v.into())
            }
            "INT4" | "INT" | "INTEGER" | "SERIAL" => {
                or_null(row.try_get::<Option<i32>, _>(idx), name, |v| v.into())
            }
            _ => or_null(row.try_get::<Option<i64>, _>(idx), name, |v| v.into()),
        },
        TypeCategory::Float => {
            if type_name.eq_ignore_ascii_case("float4") || type_name.eq_ignore_ascii_case("real") {
                or_null(row.try_get::<Option<f32>, _>(idx), name, |v| {
                    float_to_json(v as f64)
                })
            } else {
                or_null(row.try_get::<Option<f64>, _>(idx), name, float_to_json)
            }
        }
        TypeCategory::Decimal => {
            or_null(row.try_get::<Option<RawDecimal>, _>(idx), name, |v| {
                JsonValue::String(v.0)
            })
        }
        TypeCategory::Boolean => or_null(row.try_get::<Option<bool>, _>(idx), name, JsonValue::Bool),
        TypeCategory::Json => or_null(row.try_get::<Option<JsonValue>, _>(idx), name, |v| v),
        TypeCategory::Binary => {
            or_null(row.try_get::<Option<Vec<u8>>, _>(idx), name, |v| encode_binary(&v))
        }
        TypeCategory::Text => match type_name.to_ascii_uppercase().as_str() {
            "TIMESTAMPTZ" => or_null(row.try_get::<Option<DateTime<Utc>>, _>(idx), name, |v| {
                JsonValue::String(v.to_rfc3339())
            }),
            "TIMESTAMP" => or_null(row.try_get::<Option<NaiveDateTime>, _>(idx), name, |v| {
                JsonValue::String(v.to_string())
            }),
            "DATE" => or_null(row.try_get::<Option<NaiveDate>, _>(idx), name, |v| {
                JsonValue::String(v.to_string())
            }),
            "TIME" => or_null(row.try_get::<Option<NaiveTime>, _>(idx), name, |v| {
                JsonValue::String(v.to_string())
            }),
            _ => or_null(row.try_get::<Option<String>, _>(idx), name, JsonValue::String),
        },
    }
}

fn decode_sqlite_column(row: &SqliteRow, idx: usize, name: &str, declared: &str) -> JsonValue {
    let raw = match row.try_get_raw(idx) {
        Ok(raw) => raw,
        Err(e) => {
            tracing::warn!(column = name, error = %e, "Failed to read column, returning null");
            return JsonValue::Null;
        }
    };
    if raw.is_null() {
        return JsonValue::Null;
    }

    // Expression columns have no declared type, so go by the value's
    // storage class and let the declaration only mark booleans.
    let storage = raw.type_info();
    let category = match categorize_type(storage.name(), DatabaseType::SQLite) {
        TypeCategory::Integer
            if categorize_type(declared, DatabaseType::SQLite) == TypeCategory::Boolean =>
        {
            TypeCategory::Boolean
        }
        other => other,
    };

    match category {
        TypeCategory::Integer => or_null(row.try_get::<Option<i64>, _>(idx), name, |v| v.into()),
        TypeCategory::Float | TypeCategory::Decimal => {
            or_null(row.try_get::<Option<f64>, _>(idx), name, float_to_json)
        }
        TypeCategory::Boolean => or_null(row.try_get::<Option<bool>, _>(idx), name, JsonValue::Bool),
        TypeCategory::Binary => {
            or_null(row.try_get::<Option<Vec<u8>>, _>(idx), name, |v| encode_binary(&v))
        }
        TypeCategory::Json | TypeCategory::Text => {
            or_null(row.try_get::<Option<String>, _>(idx), name, JsonValue::String)
        }
    }
}
