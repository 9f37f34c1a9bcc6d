// Value Model
// Dynamic values flowing into builders and out of drivers

use chrono::{NaiveDate, NaiveDateTime};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;

/// Raw SQL fragment substituted textually instead of being bound
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqlExpression(pub String);

impl SqlExpression {
    pub fn new(expression: impl Into<String>) -> Self {
        Self(expression.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SqlExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single column value
#[derive(Debug, Clone, PartialEq, Default)]
pub enum SqlValue {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// Exact numeric kept as its decimal text
    Decimal(String),
    String(String),
    DateTime(NaiveDateTime),
    Uuid(uuid::Uuid),
    Bytes(Vec<u8>),
    Json(serde_json::Value),
    Array(Vec<SqlValue>),
    Expression(SqlExpression),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Int(v) => Some(*v),
            SqlValue::Bool(b) => Some(i64::from(*b)),
            SqlValue::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            SqlValue::Decimal(s) | SqlValue::String(s) => s.trim().parse().ok(),
            SqlValue::Json(serde_json::Value::Number(n)) => n.as_i64(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SqlValue::Int(v) => Some(*v as f64),
            SqlValue::Float(f) => Some(*f),
            SqlValue::Decimal(s) | SqlValue::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            SqlValue::Bool(b) => Some(*b),
            SqlValue::Int(v) => Some(*v != 0),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::String(s) | SqlValue::Decimal(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_datetime(&self) -> Option<NaiveDateTime> {
        match self {
            SqlValue::DateTime(dt) => Some(*dt),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            SqlValue::Null => "null",
            SqlValue::Bool(_) => "bool",
            SqlValue::Int(_) => "int",
            SqlValue::Float(_) => "float",
            SqlValue::Decimal(_) => "decimal",
            SqlValue::String(_) => "string",
            SqlValue::DateTime(_) => "datetime",
            SqlValue::Uuid(_) => "uuid",
            SqlValue::Bytes(_) => "bytes",
            SqlValue::Json(_) => "json",
            SqlValue::Array(_) => "array",
            SqlValue::Expression(_) => "expression",
        }
    }

    /// JSON rendition used when an engine has no native type for the value
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value;
        match self {
            SqlValue::Null => Value::Null,
            SqlValue::Bool(b) => Value::Bool(*b),
            SqlValue::Int(v) => Value::from(*v),
            SqlValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            SqlValue::Decimal(s) | SqlValue::String(s) => Value::String(s.clone()),
            SqlValue::DateTime(dt) => Value::String(dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string()),
            SqlValue::Uuid(u) => Value::String(u.to_string()),
            SqlValue::Bytes(b) => Value::Array(b.iter().map(|x| Value::from(*x)).collect()),
            SqlValue::Json(v) => v.clone(),
            SqlValue::Array(items) => Value::Array(items.iter().map(SqlValue::to_json).collect()),
            SqlValue::Expression(e) => Value::String(e.0.clone()),
        }
    }

    pub fn from_json(value: serde_json::Value) -> SqlValue {
        use serde_json::Value;
        match value {
            Value::Null => SqlValue::Null,
            Value::Bool(b) => SqlValue::Bool(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => SqlValue::Int(i),
                None => n.as_f64().map(SqlValue::Float).unwrap_or(SqlValue::Null),
            },
            Value::String(s) => SqlValue::String(s),
            Value::Array(items) => {
                SqlValue::Array(items.into_iter().map(SqlValue::from_json).collect())
            }
            object @ Value::Object(_) => SqlValue::Json(object),
        }
    }
}

impl Serialize for SqlValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for SqlValue {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        serde_json::Value::deserialize(deserializer).map(SqlValue::from_json)
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlValue::Null => f.write_str("NULL"),
            SqlValue::String(s) | SqlValue::Decimal(s) => f.write_str(s),
            SqlValue::Expression(e) => f.write_str(&e.0),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

macro_rules! impl_from {
    ($($t:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$t> for SqlValue {
                fn from(v: $t) -> Self {
                    SqlValue::$variant(v.into())
                }
            }
        )*
    };
}

impl_from!(
    bool => Bool,
    i8 => Int,
    i16 => Int,
    i32 => Int,
    i64 => Int,
    u8 => Int,
    u16 => Int,
    u32 => Int,
    f32 => Float,
    f64 => Float,
    String => String,
    NaiveDateTime => DateTime,
    uuid::Uuid => Uuid,
    Vec<u8> => Bytes,
    serde_json::Value => Json,
    SqlExpression => Expression,
);

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::String(v.to_string())
    }
}

impl From<NaiveDate> for SqlValue {
    fn from(v: NaiveDate) -> Self {
        SqlValue::DateTime(v.and_time(chrono::NaiveTime::MIN))
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

/// Ordered key/value pairs: WHERE conditions, SET lists, insert values, bound args
pub type KeyValues = IndexMap<String, SqlValue>;

/// One result row, columns in select order
pub type Row = IndexMap<String, SqlValue>;

/// Build a `KeyValues` from literal pairs.
pub fn kv<K, V, I>(pairs: I) -> KeyValues
where
    K: Into<String>,
    V: Into<SqlValue>,
    I: IntoIterator<Item = (K, V)>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

/// Rows returned by a query, with column names in select order
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RowSet {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

impl RowSet {
    pub fn new(columns: Vec<String>, rows: Vec<Row>) -> Self {
        Self { columns, rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn first(&self) -> Option<&Row> {
        self.rows.first()
    }

    pub fn into_first(self) -> Option<Row> {
        self.rows.into_iter().next()
    }
}

/// Read-side decoding hint for text columns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    ArrayString,
    Json,
}

pub type FieldTypeMapping = HashMap<String, FieldType>;

/// Lower-case the keys of every row and decode mapped text columns.
pub fn deformat_keys(rowset: RowSet, mapping: Option<&FieldTypeMapping>) -> RowSet {
    let columns = rowset.columns.iter().map(|c| c.to_lowercase()).collect();
    let rows = rowset
        .rows
        .into_iter()
        .map(|row| deformat_row(row, mapping))
        .collect();
    RowSet { columns, rows }
}

pub fn deformat_row(row: Row, mapping: Option<&FieldTypeMapping>) -> Row {
    row.into_iter()
        .map(|(key, value)| {
            let key = key.to_lowercase();
            let value = match mapping.and_then(|m| m.get(&key)) {
                Some(field_type) => decode_field(*field_type, value),
                None => value,
            };
            (key, value)
        })
        .collect()
}

fn decode_field(field_type: FieldType, value: SqlValue) -> SqlValue {
    let text = match &value {
        SqlValue::String(s) => s.as_str(),
        SqlValue::Bytes(b) => match std::str::from_utf8(b) {
            Ok(s) => s,
            Err(_) => return value,
        },
        _ => return value,
    };
    match field_type {
        FieldType::Json => match serde_json::from_str::<serde_json::Value>(text) {
            Ok(json) => SqlValue::Json(json),
            Err(_) => value,
        },
        FieldType::ArrayString => match serde_json::from_str::<Vec<serde_json::Value>>(text) {
            Ok(items) => SqlValue::Array(items.into_iter().map(SqlValue::from_json).collect()),
            Err(_) => parse_pg_text_array(text).unwrap_or(value),
        },
    }
}

// `{a,b,"c d"}` text form, as returned when an array column is cast to text
fn parse_pg_text_array(text: &str) -> Option<SqlValue> {
    let inner = text.trim().strip_prefix('{')?.strip_suffix('}')?;
    if inner.is_empty() {
        return Some(SqlValue::Array(Vec::new()));
    }
    let mut items = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        match c {
            '"' => in_quotes = !in_quotes,
            '\\' if in_quotes => {
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            ',' if !in_quotes => items.push(SqlValue::String(std::mem::take(&mut current))),
            c => current.push(c),
        }
    }
    items.push(SqlValue::String(current));
    Some(SqlValue::Array(items))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accessors() {
        assert_eq!(SqlValue::Int(7).as_i64(), Some(7));
        assert_eq!(SqlValue::Decimal("42".into()).as_i64(), Some(42));
        assert_eq!(SqlValue::Float(3.0).as_i64(), Some(3));
        assert_eq!(SqlValue::Float(3.5).as_i64(), None);
        assert_eq!(SqlValue::Int(0).as_bool(), Some(false));
        assert_eq!(SqlValue::from("abc").as_str(), Some("abc"));
        assert!(SqlValue::from(None::<i32>).is_null());
    }

    #[test]
    fn test_json_conversion() {
        let value = SqlValue::from_json(serde_json::json!({"a": [1, 2]}));
        assert!(matches!(value, SqlValue::Json(_)));
        let value = SqlValue::from_json(serde_json::json!(["x", 1.5]));
        assert_eq!(
            value,
            SqlValue::Array(vec![SqlValue::String("x".into()), SqlValue::Float(1.5)])
        );
        assert_eq!(serde_json::to_string(&SqlValue::Int(5)).unwrap(), "5");
    }

    #[test]
    fn test_kv_keeps_order() {
        let values = kv([("b", 1), ("a", 2)]);
        let keys: Vec<_> = values.keys().cloned().collect();
        assert_eq!(keys, vec!["b", "a"]);
    }

    #[test]
    fn test_deformat_keys_lowercases_and_decodes() {
        let mut row = Row::new();
        row.insert("CODE".to_string(), SqlValue::from("A1"));
        row.insert("TAGS".to_string(), SqlValue::from("[\"x\",\"y\"]"));
        row.insert("META".to_string(), SqlValue::from("{\"k\":1}"));
        let rowset = RowSet::new(vec!["CODE".into(), "TAGS".into(), "META".into()], vec![row]);

        let mut mapping = FieldTypeMapping::new();
        mapping.insert("tags".to_string(), FieldType::ArrayString);
        mapping.insert("meta".to_string(), FieldType::Json);

        let result = deformat_keys(rowset, Some(&mapping));
        assert_eq!(result.columns, vec!["code", "tags", "meta"]);
        let row = result.first().unwrap();
        assert_eq!(row["code"], SqlValue::from("A1"));
        assert_eq!(
            row["tags"],
            SqlValue::Array(vec![SqlValue::from("x"), SqlValue::from("y")])
        );
        assert_eq!(row["meta"], SqlValue::Json(serde_json::json!({"k": 1})));
    }

    #[test]
    fn test_pg_text_array() {
        assert_eq!(
            parse_pg_text_array("{a,\"b c\"}"),
            Some(SqlValue::Array(vec![SqlValue::from("a"), SqlValue::from("b c")]))
        );
        assert_eq!(parse_pg_text_array("{}"), Some(SqlValue::Array(vec![])));
        assert_eq!(parse_pg_text_array("abc"), None);
    }
}
