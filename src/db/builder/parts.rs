// SQL parts shared by every statement builder

use super::{add_arg, param_name};
use crate::db::dialect::Dialect;
use crate::db::sqlchecker::{check_base_query, check_identifier, check_value};
use crate::db::traits::DatabaseError;
use crate::db::value::{KeyValues, SqlValue};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl FromStr for SortDirection {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "asc" => Ok(SortDirection::Asc),
            "desc" => Ok(SortDirection::Desc),
            other => Err(DatabaseError::InvalidRequest(format!(
                "invalid sort direction {:?}",
                other
            ))),
        }
    }
}

impl fmt::Display for SortDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NullsOrder {
    First,
    Last,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderByField {
    pub field: String,
    #[serde(default)]
    pub direction: SortDirection,
    #[serde(default)]
    pub nulls: Option<NullsOrder>,
}

impl OrderByField {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Asc,
            nulls: None,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Desc,
            nulls: None,
        }
    }

    pub fn nulls_first(mut self) -> Self {
        self.nulls = Some(NullsOrder::First);
        self
    }

    pub fn nulls_last(mut self) -> Self {
        self.nulls = Some(NullsOrder::Last);
        self
    }

    /// `("name", "desc nulls last")` as found in request parameters
    pub fn parse(field: &str, spec: &str) -> Result<Self, DatabaseError> {
        let tokens: Vec<String> = spec.split_whitespace().map(str::to_ascii_lowercase).collect();
        let (direction, rest) = match tokens.first().map(String::as_str) {
            Some("asc") | Some("desc") => (tokens[0].parse()?, &tokens[1..]),
            _ => (SortDirection::Asc, &tokens[..]),
        };
        let nulls = match rest {
            [] => None,
            [n, p] if n == "nulls" && p == "first" => Some(NullsOrder::First),
            [n, p] if n == "nulls" && p == "last" => Some(NullsOrder::Last),
            _ => {
                return Err(DatabaseError::InvalidRequest(format!(
                    "invalid order by {:?} for {}",
                    spec, field
                )))
            }
        };
        Ok(Self {
            field: field.to_string(),
            direction,
            nulls,
        })
    }
}

pub type FieldsOrderBy = Vec<OrderByField>;

/// Split `expr [AS] alias` into its parts when both sides are plain words.
fn split_alias(field: &str) -> Option<(&str, &str)> {
    let tokens: Vec<&str> = field.split_whitespace().collect();
    match tokens.as_slice() {
        [name, alias] => Some((name, alias)),
        [name, kw, alias] if kw.eq_ignore_ascii_case("as") => Some((name, alias)),
        _ => None,
    }
}

fn looks_like_identifier(text: &str) -> bool {
    !text.is_empty()
        && text
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '$' | '#' | '@' | '"' | '[' | ']'))
}

/// Validate and format a table reference: `table`, `schema.table`, `table alias`.
pub fn sql_part_table(dialect: &dyn Dialect, table: &str) -> Result<String, DatabaseError> {
    let table = table.trim();
    if check_identifier(dialect, table).is_ok() {
        return Ok(dialect.format_identifier(table));
    }
    match split_alias(table) {
        Some((name, alias)) => {
            check_identifier(dialect, name)?;
            check_identifier(dialect, alias)?;
            Ok(format!(
                "{} {}",
                dialect.format_identifier(name),
                dialect.format_identifier(alias)
            ))
        }
        // surfaces the identifier error of the whole reference
        None => check_identifier(dialect, table).map(|_| table.to_string()),
    }
}

fn sql_part_field(dialect: &dyn Dialect, field: &str) -> Result<String, DatabaseError> {
    let field = field.trim();
    if field == "*" {
        return Ok(field.to_string());
    }
    if let Some(qualifier) = field.strip_suffix(".*") {
        check_identifier(dialect, qualifier)?;
        return Ok(format!("{}.*", dialect.format_identifier(qualifier)));
    }
    if looks_like_identifier(field) {
        check_identifier(dialect, field)?;
        return Ok(dialect.format_identifier(field));
    }
    if let Some((name, alias)) = split_alias(field) {
        if looks_like_identifier(name) {
            check_identifier(dialect, name)?;
            check_identifier(dialect, alias)?;
            return Ok(format!("{} AS {}", dialect.format_identifier(name), alias));
        }
    }
    // computed column, e.g. `count(*) as total`
    check_base_query(dialect, field)?;
    Ok(field.to_string())
}

/// Comma separated select list; `*` when no fields are given.
pub fn sql_part_field_names(
    dialect: &dyn Dialect,
    fields: Option<&[String]>,
) -> Result<String, DatabaseError> {
    match fields {
        None => Ok("*".to_string()),
        Some([]) => Ok("*".to_string()),
        Some(fields) => Ok(fields
            .iter()
            .map(|f| sql_part_field(dialect, f))
            .collect::<Result<Vec<_>, _>>()?
            .join(", ")),
    }
}

/// `AND`-joined conditions plus the arguments they bind.
///
/// NULL becomes `IS NULL`, arrays become `= ANY(..)` / `IN (..)`,
/// expressions are inlined as whole conditions.
pub fn sql_part_where(
    dialect: &dyn Dialect,
    where_kv: &KeyValues,
) -> Result<(String, KeyValues), DatabaseError> {
    let mut conditions = Vec::with_capacity(where_kv.len());
    let mut args = KeyValues::new();
    for (key, value) in where_kv {
        if let SqlValue::Expression(expression) = value {
            check_value(value)?;
            conditions.push(expression.as_str().to_string());
            continue;
        }
        check_identifier(dialect, key)?;
        let field = dialect.format_identifier(key);
        let name = param_name(key);
        match value {
            SqlValue::Null => conditions.push(format!("{} IS NULL", field)),
            SqlValue::Array(items) if dialect.supports_native_arrays() => {
                conditions.push(format!("{} = ANY(:{})", field, name));
                add_arg(&mut args, name, SqlValue::Array(items.clone()))?;
            }
            SqlValue::Array(items) if items.is_empty() => {
                conditions.push(format!("{} IN (NULL)", field))
            }
            SqlValue::Array(items) => {
                let mut markers = Vec::with_capacity(items.len());
                for (i, item) in items.iter().enumerate() {
                    let item_name = format!("{}__{}", name, i);
                    markers.push(format!(":{}", item_name));
                    add_arg(&mut args, item_name, item.clone())?;
                }
                conditions.push(format!("{} IN ({})", field, markers.join(", ")));
            }
            other => {
                conditions.push(format!("{} = :{}", field, name));
                add_arg(&mut args, name, other.clone())?;
            }
        }
    }
    Ok((conditions.join(" AND "), args))
}

pub fn sql_part_order_by(
    dialect: &dyn Dialect,
    order_by: &[OrderByField],
) -> Result<String, DatabaseError> {
    let mut items = Vec::with_capacity(order_by.len());
    for item in order_by {
        check_identifier(dialect, &item.field)?;
        let mut part = format!("{} {}", dialect.format_identifier(&item.field), item.direction);
        if let Some(nulls) = item.nulls {
            if !dialect.supports_nulls_ordering() {
                return Err(DatabaseError::InvalidRequest(format!(
                    "NULLS FIRST/LAST is not supported on {}",
                    dialect.database_type()
                )));
            }
            part.push_str(match nulls {
                NullsOrder::First => " NULLS FIRST",
                NullsOrder::Last => " NULLS LAST",
            });
        }
        items.push(part);
    }
    Ok(items.join(", "))
}

/// `a = :new_a, b = :new_b`; the `new_` prefix keeps SET arguments apart from WHERE ones.
pub fn sql_part_set(
    dialect: &dyn Dialect,
    set: &KeyValues,
) -> Result<(String, KeyValues), DatabaseError> {
    let mut assignments = Vec::with_capacity(set.len());
    let mut args = KeyValues::new();
    for (key, value) in set {
        check_identifier(dialect, key)?;
        let field = dialect.format_identifier(key);
        if let SqlValue::Expression(expression) = value {
            check_value(value)?;
            assignments.push(format!("{} = {}", field, expression.as_str()));
            continue;
        }
        let name = format!("new_{}", param_name(key));
        assignments.push(format!("{} = :{}", field, name));
        add_arg(&mut args, name, value.clone())?;
    }
    Ok((assignments.join(", "), args))
}

/// Column list, value markers and arguments of an INSERT
pub fn sql_part_insert(
    dialect: &dyn Dialect,
    values: &KeyValues,
) -> Result<(Vec<String>, Vec<String>, KeyValues), DatabaseError> {
    let mut fields = Vec::with_capacity(values.len());
    let mut markers = Vec::with_capacity(values.len());
    let mut args = KeyValues::new();
    for (key, value) in values {
        check_identifier(dialect, key)?;
        fields.push(dialect.format_identifier(key));
        if let SqlValue::Expression(expression) = value {
            check_value(value)?;
            markers.push(expression.as_str().to_string());
            continue;
        }
        let name = param_name(key);
        markers.push(format!(":{}", name));
        add_arg(&mut args, name, value.clone())?;
    }
    Ok((fields, markers, args))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::dialect::DatabaseType;
    use crate::db::value::{kv, SqlExpression};

    fn pg() -> &'static dyn Dialect {
        DatabaseType::Postgresql.dialect().unwrap()
    }

    #[test]
    fn test_field_names() {
        assert_eq!(sql_part_field_names(pg(), None).unwrap(), "*");
        let fields = vec!["code".to_string(), "a.name".to_string(), "t.*".to_string()];
        assert_eq!(sql_part_field_names(pg(), Some(&fields)).unwrap(), "code, a.name, t.*");
        let fields = vec!["count(*) as total".to_string(), "code c".to_string()];
        assert_eq!(
            sql_part_field_names(pg(), Some(&fields)).unwrap(),
            "count(*) as total, code AS c"
        );
        let fields = vec!["select".to_string()];
        assert!(sql_part_field_names(pg(), Some(&fields)).is_err());
        let fields = vec!["pg_sleep(10)--".to_string()];
        assert!(sql_part_field_names(pg(), Some(&fields)).is_err());
    }

    #[test]
    fn test_table_reference() {
        assert_eq!(sql_part_table(pg(), "area").unwrap(), "area");
        assert_eq!(sql_part_table(pg(), "area a").unwrap(), "area a");
        assert_eq!(sql_part_table(pg(), "area AS a").unwrap(), "area a");
        assert!(sql_part_table(pg(), "area; drop table x").is_err());
        let oracle = DatabaseType::Oracle.dialect().unwrap();
        assert_eq!(sql_part_table(oracle, "area").unwrap(), "AREA");
    }

    #[test]
    fn test_where_part() {
        let where_kv = kv([
            ("code", SqlValue::from("A1")),
            ("deleted_at", SqlValue::Null),
            ("x", SqlValue::Expression(SqlExpression::new("created_at > now()"))),
        ]);
        let (sql, args) = sql_part_where(pg(), &where_kv).unwrap();
        assert_eq!(sql, "code = :code AND deleted_at IS NULL AND created_at > now()");
        assert_eq!(args.len(), 1);
        assert_eq!(args["code"], SqlValue::from("A1"));
    }

    #[test]
    fn test_where_arrays() {
        let where_kv = kv([("id", SqlValue::Array(vec![SqlValue::Int(1), SqlValue::Int(2)]))]);
        let (sql, _) = sql_part_where(pg(), &where_kv).unwrap();
        assert_eq!(sql, "id = ANY(:id)");

        let mssql = DatabaseType::Sqlserver.dialect().unwrap();
        let (sql, args) = sql_part_where(mssql, &where_kv).unwrap();
        assert_eq!(sql, "id IN (:id__0, :id__1)");
        assert_eq!(args.len(), 2);

        let empty = kv([("id", SqlValue::Array(vec![]))]);
        let (sql, _) = sql_part_where(mssql, &empty).unwrap();
        assert_eq!(sql, "id IN (NULL)");
    }

    #[test]
    fn test_set_part_prefixes_params() {
        let set = kv([("name", SqlValue::from("North")), ("updated_at", SqlValue::Expression(SqlExpression::new("now()")))]);
        let (sql, args) = sql_part_set(pg(), &set).unwrap();
        assert_eq!(sql, "name = :new_name, updated_at = now()");
        assert_eq!(args.keys().collect::<Vec<_>>(), vec!["new_name"]);
    }

    #[test]
    fn test_order_by_part() {
        let order = vec![OrderByField::asc("code"), OrderByField::desc("name").nulls_last()];
        assert_eq!(sql_part_order_by(pg(), &order).unwrap(), "code ASC, name DESC NULLS LAST");
        let mysql = DatabaseType::Mysql.dialect().unwrap();
        assert!(sql_part_order_by(mysql, &order).is_err());
    }

    #[test]
    fn test_order_by_parse() {
        let field = OrderByField::parse("name", "DESC nulls first").unwrap();
        assert_eq!(field, OrderByField::desc("name").nulls_first());
        assert_eq!(OrderByField::parse("name", "").unwrap(), OrderByField::asc("name"));
        assert!(OrderByField::parse("name", "sideways").is_err());
    }

    #[test]
    fn test_insert_part() {
        let values = kv([("code", "A1"), ("name", "North")]);
        let (fields, markers, args) = sql_part_insert(pg(), &values).unwrap();
        assert_eq!(fields, vec!["code", "name"]);
        assert_eq!(markers, vec![":code", ":name"]);
        assert_eq!(args.len(), 2);
    }

    #[test]
    fn test_where_rejects_fields_sharing_a_marker() {
        let where_kv = kv([("a.code", "A1"), ("a_code", "B2")]);
        let err = sql_part_where(pg(), &where_kv).unwrap_err();
        assert!(matches!(err, DatabaseError::InvalidRequest(_)));
        assert!(sql_part_insert(pg(), &where_kv).is_err());
    }
}
