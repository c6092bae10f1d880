//! Parameter binding and row marshalling
//!
//! Payloads pass through uninterpreted: parameters arrive as JSON values and
//! rows leave as JSON objects keyed by column name. Parameters are encoded as
//! the type the server inferred for them when the statement was prepared, so a
//! JSON string can feed a uuid, date or timestamp column.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use sqlx::encode::{Encode, IsNull};
use sqlx::error::BoxDynError;
use sqlx::postgres::{PgArgumentBuffer, PgArguments, PgRow, PgTypeInfo};
use sqlx::query::Query;
use sqlx::types::Json;
use sqlx::{Column, Postgres, Row, Type, TypeInfo};
use uuid::Uuid;

/// Result of one statement
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    pub rows: Vec<Value>,
    /// Rows returned for SELECT, rows affected otherwise
    pub row_count: u64,
}

/// A JSON parameter that cannot be encoded as its inferred type
#[derive(Debug, thiserror::Error)]
#[error("parameter ${position} is not a valid {expected}: {reason}")]
pub struct ParamError {
    pub position: usize,
    pub expected: String,
    pub reason: String,
}

/// SQL NULL carrying the parameter type the server inferred
#[derive(Debug, Clone)]
struct TypedNull(PgTypeInfo);

impl Type<Postgres> for TypedNull {
    fn type_info() -> PgTypeInfo {
        <String as Type<Postgres>>::type_info()
    }

    fn compatible(_ty: &PgTypeInfo) -> bool {
        true
    }
}

impl<'q> Encode<'q, Postgres> for TypedNull {
    fn encode_by_ref(&self, _buf: &mut PgArgumentBuffer) -> Result<IsNull, BoxDynError> {
        Ok(IsNull::Yes)
    }

    fn produces(&self) -> Option<PgTypeInfo> {
        Some(self.0.clone())
    }
}

type PgQuery<'q> = Query<'q, Postgres, PgArguments>;

/// Bind one JSON parameter as the type the server expects at `position`
/// (1-based).
///
/// Types without a conversion here fall back to [`bind_value`].
pub(crate) fn bind_as<'q>(
    query: PgQuery<'q>,
    position: usize,
    value: &Value,
    target: &PgTypeInfo,
) -> Result<PgQuery<'q>, ParamError> {
    if value.is_null() {
        return Ok(query.bind(TypedNull(target.clone())));
    }

    let converted = match target.name() {
        "BOOL" => boolean(value).map(|v| query.bind(v)),
        "INT2" => integer::<i16>(value).map(|v| query.bind(v)),
        "INT4" => integer::<i32>(value).map(|v| query.bind(v)),
        "INT8" => integer::<i64>(value).map(|v| query.bind(v)),
        "FLOAT4" => float(value).map(|v| query.bind(v as f32)),
        "FLOAT8" => float(value).map(|v| query.bind(v)),
        "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" | "UNKNOWN" => Ok(query.bind(text(value))),
        "UUID" => uuid_value(value).map(|v| query.bind(v)),
        "DATE" => date(value).map(|v| query.bind(v)),
        "TIMESTAMPTZ" => timestamptz(value).map(|v| query.bind(v)),
        "TIMESTAMP" => timestamp(value).map(|v| query.bind(v)),
        "JSON" | "JSONB" => Ok(query.bind(Json(value.clone()))),
        "TEXT[]" | "VARCHAR[]" => array(value, |v| Ok(text(v))).map(|v| query.bind(v)),
        "INT4[]" => array(value, integer::<i32>).map(|v| query.bind(v)),
        "INT8[]" => array(value, integer::<i64>).map(|v| query.bind(v)),
        "UUID[]" => array(value, uuid_value).map(|v| query.bind(v)),
        _ => Ok(bind_value(query, value)),
    };

    converted.map_err(|reason| ParamError {
        position,
        expected: target.name().to_string(),
        reason,
    })
}

/// Bind one JSON parameter by its JSON shape alone.
///
/// Integers bind as INT8, other numbers as FLOAT8, strings as TEXT, arrays
/// and objects as JSONB. NULL binds as a TEXT null.
pub(crate) fn bind_value<'q>(query: PgQuery<'q>, value: &Value) -> PgQuery<'q> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => query.bind(i),
            None => query.bind(n.as_f64()),
        },
        Value::String(s) => query.bind(s.clone()),
        other => query.bind(Json(other.clone())),
    }
}

fn shape(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn string(value: &Value) -> Result<&str, String> {
    value
        .as_str()
        .ok_or_else(|| format!("expected a string, got {}", shape(value)))
}

fn text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn boolean(value: &Value) -> Result<bool, String> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "t" | "yes" | "on" | "1" => Ok(true),
            "false" | "f" | "no" | "off" | "0" => Ok(false),
            other => Err(format!("'{}' is not a boolean", other)),
        },
        other => Err(format!("expected a boolean, got {}", shape(other))),
    }
}

fn integer<T: TryFrom<i64>>(value: &Value) -> Result<T, String> {
    let wide = match value {
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| format!("{} is not an integer", n))?,
        Value::String(s) => s.trim().parse::<i64>().map_err(|e| e.to_string())?,
        other => return Err(format!("expected an integer, got {}", shape(other))),
    };
    T::try_from(wide).map_err(|_| format!("{} is out of range", wide))
}

fn float(value: &Value) -> Result<f64, String> {
    match value {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| format!("{} is not representable", n)),
        Value::String(s) => s.trim().parse::<f64>().map_err(|e| e.to_string()),
        other => Err(format!("expected a number, got {}", shape(other))),
    }
}

fn uuid_value(value: &Value) -> Result<Uuid, String> {
    Uuid::parse_str(string(value)?).map_err(|e| e.to_string())
}

fn date(value: &Value) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(string(value)?, "%Y-%m-%d").map_err(|e| e.to_string())
}

fn timestamptz(value: &Value) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(string(value)?)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| e.to_string())
}

fn timestamp(value: &Value) -> Result<NaiveDateTime, String> {
    let raw = string(value)?;
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
        .or_else(|_| DateTime::parse_from_rfc3339(raw).map(|t| t.naive_utc()))
        .map_err(|e| e.to_string())
}

fn array<T>(value: &Value, item: fn(&Value) -> Result<T, String>) -> Result<Vec<T>, String> {
    match value {
        Value::Array(items) => items.iter().map(item).collect(),
        other => Err(format!("expected an array, got {}", shape(other))),
    }
}

/// Convert a row into a JSON object
pub(crate) fn row_to_json(row: &PgRow) -> Value {
    let mut object = Map::with_capacity(row.columns().len());
    for column in row.columns() {
        let value = column_value(row, column.ordinal(), column.type_info().name());
        object.insert(column.name().to_string(), value);
    }
    Value::Object(object)
}

fn column_value(row: &PgRow, index: usize, type_name: &str) -> Value {
    let decoded = match type_name {
        "BOOL" => row.try_get::<Option<bool>, _>(index).map(|v| v.map(Value::from)),
        "INT2" => row.try_get::<Option<i16>, _>(index).map(|v| v.map(Value::from)),
        "INT4" => row.try_get::<Option<i32>, _>(index).map(|v| v.map(Value::from)),
        "INT8" => row.try_get::<Option<i64>, _>(index).map(|v| v.map(Value::from)),
        "FLOAT4" => row.try_get::<Option<f32>, _>(index).map(|v| v.map(Value::from)),
        "FLOAT8" => row.try_get::<Option<f64>, _>(index).map(|v| v.map(Value::from)),
        "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" | "CITEXT" => {
            row.try_get::<Option<String>, _>(index).map(|v| v.map(Value::from))
        }
        "JSON" | "JSONB" => row.try_get::<Option<Value>, _>(index),
        "UUID" => row
            .try_get::<Option<Uuid>, _>(index)
            .map(|v| v.map(|u| Value::from(u.to_string()))),
        "TIMESTAMPTZ" => row
            .try_get::<Option<DateTime<Utc>>, _>(index)
            .map(|v| v.map(|t| Value::from(t.to_rfc3339()))),
        "TIMESTAMP" => row
            .try_get::<Option<NaiveDateTime>, _>(index)
            .map(|v| v.map(|t| Value::from(t.to_string()))),
        "DATE" => row
            .try_get::<Option<NaiveDate>, _>(index)
            .map(|v| v.map(|d| Value::from(d.to_string()))),
        "TEXT[]" | "VARCHAR[]" => row
            .try_get::<Option<Vec<String>>, _>(index)
            .map(|v| v.map(Value::from)),
        "INT4[]" => row
            .try_get::<Option<Vec<i32>>, _>(index)
            .map(|v| v.map(Value::from)),
        "INT8[]" => row
            .try_get::<Option<Vec<i64>>, _>(index)
            .map(|v| v.map(Value::from)),
        other => {
            tracing::debug!(
                column = index,
                type_name = other,
                "unsupported column type, returning null"
            );
            Ok(None)
        }
    };

    match decoded {
        Ok(value) => value.unwrap_or(Value::Null),
        Err(e) => {
            tracing::warn!(column = index, type_name, error = %e, "failed to decode column");
            Value::Null
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn query_result_serializes_in_camel_case() {
        let result = QueryResult {
            rows: vec![json!({"id": 1})],
            row_count: 1,
        };
        let rendered = serde_json::to_value(&result).unwrap();
        assert_eq!(rendered, json!({"rows": [{"id": 1}], "rowCount": 1}));
    }

    #[test]
    fn binding_accepts_every_json_shape() {
        let params = [
            json!(null),
            json!(true),
            json!(42),
            json!(1.5),
            json!("text"),
            json!({"k": [1, 2]}),
        ];

        let mut query = sqlx::query("SELECT $1, $2, $3, $4, $5, $6");
        for param in &params {
            query = bind_value(query, param);
        }
        drop(query);
    }

    #[test]
    fn strings_convert_to_inferred_types() {
        assert_eq!(
            uuid_value(&json!("2b1a6c2e-0000-4000-8000-000000000001")).unwrap().to_string(),
            "2b1a6c2e-0000-4000-8000-000000000001"
        );
        assert_eq!(
            date(&json!("2024-05-01")).unwrap(),
            NaiveDate::from_ymd_opt(2024, 5, 1).unwrap()
        );
        assert_eq!(
            timestamptz(&json!("2024-05-01T14:00:00+02:00")).unwrap().to_rfc3339(),
            "2024-05-01T12:00:00+00:00"
        );
        assert!(timestamp(&json!("2024-05-01 12:00:00")).is_ok());
        assert_eq!(integer::<i32>(&json!("7")).unwrap(), 7);
        assert!(boolean(&json!("t")).unwrap());
        assert_eq!(text(&json!(42)), "42");
    }

    #[test]
    fn out_of_range_and_wrong_shapes_are_rejected() {
        assert!(integer::<i16>(&json!(70_000)).is_err());
        assert!(integer::<i32>(&json!(1.5)).is_err());
        assert!(uuid_value(&json!(12)).is_err());
        assert!(array(&json!("x"), integer::<i64>).is_err());
    }

    #[test]
    fn inferred_type_drives_binding() {
        let uuid_type = PgTypeInfo::with_name("UUID");
        let int_type = PgTypeInfo::with_name("INT4");

        let query = sqlx::query("SELECT $1, $2");
        let query = bind_as(query, 1, &json!(null), &int_type).unwrap();
        let query = bind_as(query, 2, &json!("2b1a6c2e-0000-4000-8000-000000000001"), &uuid_type)
            .unwrap();
        drop(query);

        let Err(err) = bind_as(sqlx::query("SELECT $1"), 1, &json!("not-a-uuid"), &uuid_type)
        else {
            panic!("a malformed uuid should not bind");
        };
        assert_eq!(err.position, 1);
        assert_eq!(err.expected, "UUID");
        assert!(err.to_string().starts_with("parameter $1 is not a valid UUID"));
    }
}
