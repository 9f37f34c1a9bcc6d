// Query/Statement Builder
// Pure SQL assembly: builders emit `:name` markers, `bind_named` turns them
// into dialect placeholders with a positional parameter list.

pub mod parts;
pub mod select;
pub mod write;

pub use parts::{
    sql_part_field_names, sql_part_insert, sql_part_order_by, sql_part_set, sql_part_where,
    FieldsOrderBy, NullsOrder, OrderByField, SortDirection,
};
pub use select::{
    build_count, build_paging, build_select, parse_limit, total_pages, CountRequest,
    CountResult, PagingRequest, PagingResult, PagingStatements, SelectRequest, TOTAL_ROWS_FIELD,
};
pub use write::{build_delete, build_insert, build_update, InsertStatement, WriteStatement};

use crate::db::dialect::{DatabaseType, Dialect};
use crate::db::sqlchecker::{check_all, CheckOptions};
use crate::db::traits::DatabaseError;
use crate::db::value::{KeyValues, SqlValue};
use std::collections::HashMap;

/// SQL text with `:name` markers and the arguments they refer to
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NamedStatement {
    pub sql: String,
    pub args: KeyValues,
    /// Markers filled by the engine (Oracle `RETURNING .. INTO`)
    pub out_params: Vec<String>,
}

impl NamedStatement {
    pub fn new(sql: impl Into<String>, args: KeyValues) -> Self {
        Self {
            sql: sql.into(),
            args,
            out_params: Vec::new(),
        }
    }

    /// Run the injection checker, then bind for the dialect.
    pub fn checked_bind(
        &self,
        dialect: &dyn Dialect,
        options: CheckOptions,
    ) -> Result<Statement, DatabaseError> {
        check_all(dialect, &self.sql, &self.args, options)?;
        bind_named_with_out(dialect, &self.sql, &self.args, &self.out_params)
    }
}

/// A statement ready for a driver
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<SqlValue>,
    /// Parameter names in `params` order
    pub param_names: Vec<String>,
    pub out_params: Vec<String>,
}

impl Statement {
    /// Parameterless statement
    pub fn raw(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            ..Default::default()
        }
    }
}

/// Make a builder-safe parameter name out of a field reference (`a.code` -> `a_code`).
pub fn param_name(key: &str) -> String {
    key.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

/// Bind `value` under `name`; two fields landing on one marker is rejected.
pub fn add_arg(args: &mut KeyValues, name: String, value: SqlValue) -> Result<(), DatabaseError> {
    if args.contains_key(&name) {
        return Err(DatabaseError::InvalidRequest(format!(
            "parameter :{} is bound by more than one field",
            name
        )));
    }
    args.insert(name, value);
    Ok(())
}

/// Normalise a value to what the engine can bind.
pub fn prepare_value(dialect: &dyn Dialect, value: &SqlValue) -> SqlValue {
    let database_type = dialect.database_type();
    match value {
        SqlValue::Bool(b) if dialect.normalizes_booleans() => SqlValue::Int(i64::from(*b)),
        SqlValue::Array(_) if !dialect.supports_native_arrays() => {
            SqlValue::String(value.to_json().to_string())
        }
        SqlValue::Json(json)
            if matches!(database_type, DatabaseType::Sqlserver | DatabaseType::Oracle) =>
        {
            SqlValue::String(json.to_string())
        }
        SqlValue::Uuid(u) if database_type != DatabaseType::Postgresql => {
            SqlValue::String(u.to_string())
        }
        other => other.clone(),
    }
}

fn is_param_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_param_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn lookup<'a>(args: &'a KeyValues, name: &str) -> Option<&'a SqlValue> {
    args.get(name).or_else(|| {
        args.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    })
}

/// Rewrite `:name` markers into dialect placeholders.
///
/// `::` casts, quoted literals, quoted identifiers and comments are copied
/// through untouched. `SqlExpression` arguments are inlined.
pub fn bind_named(
    dialect: &dyn Dialect,
    sql: &str,
    args: &KeyValues,
) -> Result<Statement, DatabaseError> {
    bind_named_with_out(dialect, sql, args, &[])
}

fn bind_named_with_out(
    dialect: &dyn Dialect,
    sql: &str,
    args: &KeyValues,
    out_params: &[String],
) -> Result<Statement, DatabaseError> {
    let mut out = String::with_capacity(sql.len());
    let mut params = Vec::new();
    let mut param_names: Vec<String> = Vec::new();
    let mut assigned: HashMap<String, String> = HashMap::new();
    let chars: Vec<char> = sql.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '\'' | '"' => {
                // copy the quoted run, doubled quotes included
                out.push(c);
                i += 1;
                while i < chars.len() {
                    out.push(chars[i]);
                    if chars[i] == c {
                        if chars.get(i + 1) == Some(&c) {
                            out.push(c);
                            i += 2;
                            continue;
                        }
                        break;
                    }
                    i += 1;
                }
                i += 1;
            }
            '-' if chars.get(i + 1) == Some(&'-') => {
                while i < chars.len() && chars[i] != '\n' {
                    out.push(chars[i]);
                    i += 1;
                }
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                out.push_str("/*");
                i += 2;
                while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                    out.push(chars[i]);
                    i += 1;
                }
                if i < chars.len() {
                    out.push_str("*/");
                    i += 2;
                }
            }
            ':' if chars.get(i + 1) == Some(&':') => {
                out.push_str("::");
                i += 2;
            }
            ':' if chars.get(i + 1).copied().is_some_and(is_param_start) => {
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && is_param_char(chars[end]) {
                    end += 1;
                }
                let name: String = chars[start..end].iter().collect();
                i = end;

                if out_params.iter().any(|p| p.eq_ignore_ascii_case(&name)) {
                    out.push(':');
                    out.push_str(&name);
                    continue;
                }
                let value = lookup(args, &name).ok_or_else(|| {
                    DatabaseError::InvalidRequest(format!("MISSING_PARAMETER:{}", name))
                })?;
                if let SqlValue::Expression(expression) = value {
                    out.push_str(expression.as_str());
                    continue;
                }
                if dialect.reuses_placeholders() {
                    if let Some(placeholder) = assigned.get(&name) {
                        out.push_str(placeholder);
                        continue;
                    }
                }
                params.push(prepare_value(dialect, value));
                param_names.push(name.clone());
                let placeholder = dialect.placeholder(params.len(), &name);
                out.push_str(&placeholder);
                assigned.insert(name, placeholder);
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }

    Ok(Statement {
        sql: out,
        params,
        param_names,
        out_params: out_params.to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::value::{kv, SqlExpression};

    fn dialect(t: DatabaseType) -> &'static dyn Dialect {
        t.dialect().unwrap()
    }

    #[test]
    fn test_bind_postgres_reuses_placeholders() {
        let args = kv([("code", "A1"), ("name", "North")]);
        let stmt = bind_named(
            dialect(DatabaseType::Postgresql),
            "SELECT * FROM area WHERE code = :code OR alt = :code AND name = :name",
            &args,
        )
        .unwrap();
        assert_eq!(
            stmt.sql,
            "SELECT * FROM area WHERE code = $1 OR alt = $1 AND name = $2"
        );
        assert_eq!(stmt.params, vec![SqlValue::from("A1"), SqlValue::from("North")]);
        assert_eq!(stmt.param_names, vec!["code", "name"]);
    }

    #[test]
    fn test_bind_mysql_repeats_values() {
        let args = kv([("code", "A1")]);
        let stmt = bind_named(
            dialect(DatabaseType::Mysql),
            "SELECT * FROM area WHERE code = :code OR alt = :code",
            &args,
        )
        .unwrap();
        assert_eq!(stmt.sql, "SELECT * FROM area WHERE code = ? OR alt = ?");
        assert_eq!(stmt.params.len(), 2);
    }

    #[test]
    fn test_bind_skips_casts_and_literals() {
        let args = kv([("d", "2024-01-01")]);
        let stmt = bind_named(
            dialect(DatabaseType::Postgresql),
            "SELECT ':x' AS a, \"b:c\", :d::date",
            &args,
        )
        .unwrap();
        assert_eq!(stmt.sql, "SELECT ':x' AS a, \"b:c\", $1::date");
        assert_eq!(stmt.params.len(), 1);
    }

    #[test]
    fn test_bind_sqlserver_and_oracle() {
        let args = kv([("code", SqlValue::from("A1")), ("active", SqlValue::Bool(true))]);
        let stmt = bind_named(
            dialect(DatabaseType::Sqlserver),
            "UPDATE t SET active = :active WHERE code = :code",
            &args,
        )
        .unwrap();
        assert_eq!(stmt.sql, "UPDATE t SET active = @P1 WHERE code = @P2");
        assert_eq!(stmt.params[0], SqlValue::Int(1));

        let stmt = bind_named(dialect(DatabaseType::Oracle), "WHERE CODE = :code", &args).unwrap();
        assert_eq!(stmt.sql, "WHERE CODE = :code");
        assert_eq!(stmt.param_names, vec!["code"]);
    }

    #[test]
    fn test_bind_missing_parameter() {
        let err = bind_named(dialect(DatabaseType::Postgresql), "WHERE a = :a", &KeyValues::new())
            .unwrap_err();
        assert!(err.to_string().contains("MISSING_PARAMETER:a"));
    }

    #[test]
    fn test_bind_inlines_expressions() {
        let args = kv([("ts", SqlValue::Expression(SqlExpression::new("now()")))]);
        let stmt = bind_named(dialect(DatabaseType::Postgresql), "SET updated_at = :ts", &args).unwrap();
        assert_eq!(stmt.sql, "SET updated_at = now()");
        assert!(stmt.params.is_empty());
    }

    #[test]
    fn test_prepare_value() {
        let pg = dialect(DatabaseType::Postgresql);
        let mssql = dialect(DatabaseType::Sqlserver);
        let array = SqlValue::Array(vec![SqlValue::from("a")]);
        assert_eq!(prepare_value(pg, &array), array);
        assert_eq!(prepare_value(mssql, &array), SqlValue::from("[\"a\"]"));
        assert_eq!(prepare_value(pg, &SqlValue::Bool(true)), SqlValue::Bool(true));
        assert_eq!(prepare_value(mssql, &SqlValue::Bool(false)), SqlValue::Int(0));
    }

    #[test]
    fn test_checked_bind_rejects_injection() {
        let named = NamedStatement::new(
            "SELECT * FROM area WHERE code = :code",
            kv([("code", "x' or '1'='1")]),
        );
        let pg = dialect(DatabaseType::Postgresql);
        assert!(named.checked_bind(pg, CheckOptions::default()).is_err());
        assert!(named.checked_bind(pg, CheckOptions::allow_risk()).is_ok());
    }

    #[test]
    fn test_param_name() {
        assert_eq!(param_name("a.code"), "a_code");
        assert_eq!(param_name("code"), "code");
    }
}
