// SQL Injection Checker
// Validates identifiers, operators, values and assembled query text before execution

use crate::db::dialect::Dialect;
use crate::db::traits::DatabaseError;
use crate::db::value::{KeyValues, SqlValue};
use once_cell::sync::Lazy;
use regex::Regex;

pub const STAGE_QUERY: &str = "QUERY_VALIDATION_FAILED";
pub const STAGE_VALUE: &str = "VALUE_VALIDATION_FAILED";
pub const STAGE_LIKE: &str = "LIKE_PATTERN_VALIDATION_FAILED";
pub const STAGE_ORDER_BY: &str = "ORDER_BY_VALIDATION_FAILED";
pub const STAGE_IDENTIFIER: &str = "IDENTIFIER_VALIDATION_FAILED";
pub const STAGE_OPERATOR: &str = "OPERATOR_VALIDATION_FAILED";

const MAX_LIKE_WILDCARDS: usize = 5;

/// Per-call checker switches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckOptions {
    /// Skip `check_all` entirely; for trusted, internally generated SQL only
    pub allow_risk: bool,
}

impl CheckOptions {
    pub fn allow_risk() -> Self {
        Self { allow_risk: true }
    }
}

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .map(|p| Regex::new(&format!("(?i){}", p)).expect("valid regex"))
        .collect()
}

static QUERY_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[
        r"--",
        r"/\*",
        r"\*/",
        r"\bunion\b",
        r"\bdrop\b",
        r"\bexec\b",
        r"\bexecute\b",
        r"\btruncate\b",
        r"\bcreate\b",
        r"\balter\b",
        r"\bgrant\b",
        r"\brevoke\b",
        r"\bcommit\b",
        r"\brollback\b",
        r"\binto\s+outfile\b",
        r"\binto\s+dumpfile\b",
        r"\bload_file\b",
        r"\bsleep\b",
        r"\bbenchmark\b",
        r"\bwaitfor\b",
        r"\bdelay\b",
        r"\bsys_eval\b",
        r"\binformation_schema\b",
        r"\bsysobjects\b",
        r"\bxp_\w*\b",
        r"\bsp_\w*\b",
        r"\bdeclare\b",
        r"\b\d+\s*=\s*\d+\b",
    ])
});

// Data is free text; only flag shapes that only make sense as injected SQL.
static VALUE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[
        r"--",
        r"/\*",
        r"\*/",
        r";\s*(drop|delete|insert|update|exec|execute|truncate|alter|create|grant|revoke|shutdown)\b",
        r"\bunion\s+(all\s+)?select\b",
        r"\bxp_cmdshell\b",
        r"\bwaitfor\s+delay\b",
        r"\b(sleep|pg_sleep|benchmark|load_file|sys_eval)\s*\(",
        r"\binto\s+(outfile|dumpfile)\b",
        r"'\s*(or|and)\s+\S+\s*=\s*\S+",
        r"\bor\s+\d+\s*=\s*\d+\b",
    ])
});

static LIKE_KEYWORD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(i?like)\b").expect("valid regex"));

static ORDER_BY_KEYWORD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\border\s+by\b").expect("valid regex"));

static ORDER_BY_END: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(limit|offset|fetch|for\s+update|for\s+share)\b").expect("valid regex")
});

fn find_suspicious(text: &str, patterns: &[Regex]) -> Option<String> {
    patterns
        .iter()
        .find(|re| re.is_match(text))
        .map(|re| re.as_str().trim_start_matches("(?i)").to_string())
}

// ============================================================================
// Identifiers
// ============================================================================

/// Split `schema."Table"` into its parts, keeping quotes on quoted parts.
fn split_identifier(dialect: &dyn Dialect, identifier: &str) -> Result<Vec<String>, DatabaseError> {
    let fail = |detail: &str| {
        DatabaseError::injection(STAGE_IDENTIFIER, format!("{} in identifier {:?}", detail, identifier))
    };
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut closing: Option<char> = None;
    let mut just_closed = false;
    let mut chars = identifier.chars().peekable();
    while let Some(c) = chars.next() {
        if let Some(close) = closing {
            current.push(c);
            if c == close {
                // a doubled closing quote is an escaped quote
                if chars.peek() == Some(&close) {
                    current.push(close);
                    chars.next();
                } else {
                    closing = None;
                    just_closed = true;
                }
            }
            continue;
        }
        if c == '.' {
            parts.push(std::mem::take(&mut current));
            just_closed = false;
            continue;
        }
        if just_closed {
            return Err(fail("unexpected text after quoted part"));
        }
        if let Some(&(_, close)) = dialect.quote_pairs().iter().find(|(open, _)| *open == c) {
            if !current.is_empty() {
                return Err(fail("misplaced quote"));
            }
            closing = Some(close);
        }
        current.push(c);
    }
    if closing.is_some() {
        return Err(fail("unterminated quote"));
    }
    parts.push(current);
    Ok(parts)
}

fn check_quoted_part(dialect: &dyn Dialect, part: &str, identifier: &str) -> Result<(), DatabaseError> {
    let inner: String = part.chars().skip(1).take(part.chars().count() - 2).collect();
    if inner.is_empty() {
        return Err(DatabaseError::injection(
            STAGE_IDENTIFIER,
            format!("empty quoted identifier in {:?}", identifier),
        ));
    }
    if inner.chars().count() > dialect.max_identifier_length() {
        return Err(DatabaseError::injection(
            STAGE_IDENTIFIER,
            format!(
                "identifier {:?} exceeds maximum length of {} for {}",
                inner,
                dialect.max_identifier_length(),
                dialect.database_type()
            ),
        ));
    }
    if let Some(pattern) = find_suspicious(&inner, &QUERY_PATTERNS) {
        return Err(DatabaseError::injection(
            STAGE_IDENTIFIER,
            format!("quoted identifier {:?} matches {}", inner, pattern),
        ));
    }
    Ok(())
}

/// Validate a plain or `.`-qualified identifier for the dialect.
pub fn check_identifier(dialect: &dyn Dialect, identifier: &str) -> Result<(), DatabaseError> {
    if identifier.is_empty() {
        return Err(DatabaseError::injection(STAGE_IDENTIFIER, "identifier cannot be empty"));
    }
    for part in split_identifier(dialect, identifier)? {
        if part.is_empty() {
            return Err(DatabaseError::injection(
                STAGE_IDENTIFIER,
                format!("empty part in identifier {:?}", identifier),
            ));
        }
        let first = part.chars().next().unwrap_or_default();
        if dialect.quote_pairs().iter().any(|(open, _)| *open == first) {
            check_quoted_part(dialect, &part, identifier)?;
            continue;
        }
        let part = part.as_str();
        if part.len() > dialect.max_identifier_length() {
            return Err(DatabaseError::injection(
                STAGE_IDENTIFIER,
                format!(
                    "identifier {:?} exceeds maximum length of {} for {}",
                    part,
                    dialect.max_identifier_length(),
                    dialect.database_type()
                ),
            ));
        }
        if !dialect.identifier_pattern().is_match(part) {
            return Err(DatabaseError::injection(
                STAGE_IDENTIFIER,
                format!("invalid identifier format: {}", part),
            ));
        }
        if dialect.reserved_keywords().contains(part.to_lowercase().as_str()) {
            return Err(DatabaseError::injection(
                STAGE_IDENTIFIER,
                format!("identifier {:?} is a reserved keyword", part),
            ));
        }
        if let Some(pattern) = find_suspicious(part, &QUERY_PATTERNS) {
            return Err(DatabaseError::injection(
                STAGE_IDENTIFIER,
                format!("invalid identifier {:?}: matches {}", part, pattern),
            ));
        }
    }
    Ok(())
}

// ============================================================================
// Operators and values
// ============================================================================

pub fn check_operator(dialect: &dyn Dialect, operator: &str) -> Result<(), DatabaseError> {
    let normalized = operator
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    if dialect.operators().contains(&normalized.as_str()) {
        Ok(())
    } else {
        Err(DatabaseError::injection(
            STAGE_OPERATOR,
            format!("invalid operator {:?} for {}", operator, dialect.database_type()),
        ))
    }
}

fn check_string_value(s: &str) -> Result<(), DatabaseError> {
    match find_suspicious(s, &VALUE_PATTERNS) {
        Some(pattern) => Err(DatabaseError::injection(
            STAGE_VALUE,
            format!("value matches suspicious pattern {}", pattern),
        )),
        None => Ok(()),
    }
}

fn check_json_value(value: &serde_json::Value) -> Result<(), DatabaseError> {
    match value {
        serde_json::Value::String(s) => check_string_value(s),
        serde_json::Value::Array(items) => items.iter().try_for_each(check_json_value),
        serde_json::Value::Object(map) => map.iter().try_for_each(|(key, v)| {
            check_string_value(key)?;
            check_json_value(v)
        }),
        _ => Ok(()),
    }
}

/// Recursively validate a bound value.
pub fn check_value(value: &SqlValue) -> Result<(), DatabaseError> {
    match value {
        SqlValue::String(s) => check_string_value(s),
        SqlValue::Json(json) => check_json_value(json),
        SqlValue::Array(items) => items.iter().try_for_each(check_value),
        SqlValue::Expression(expression) => match find_suspicious(expression.as_str(), &QUERY_PATTERNS) {
            Some(pattern) => Err(DatabaseError::injection(
                STAGE_VALUE,
                format!("expression matches suspicious pattern {}", pattern),
            )),
            None if expression.as_str().contains(';') => Err(DatabaseError::injection(
                STAGE_VALUE,
                "expression contains ';'",
            )),
            None => Ok(()),
        },
        SqlValue::Null
        | SqlValue::Bool(_)
        | SqlValue::Int(_)
        | SqlValue::Float(_)
        | SqlValue::Decimal(_)
        | SqlValue::DateTime(_)
        | SqlValue::Uuid(_)
        | SqlValue::Bytes(_) => Ok(()),
    }
}

// ============================================================================
// Query text
// ============================================================================

fn check_like_literal(pattern: &str) -> Result<(), DatabaseError> {
    if let Some(found) = find_suspicious(pattern, &VALUE_PATTERNS) {
        return Err(DatabaseError::injection(
            STAGE_LIKE,
            format!("LIKE pattern matches suspicious pattern {}", found),
        ));
    }
    if pattern.matches('%').count() > MAX_LIKE_WILDCARDS {
        return Err(DatabaseError::injection(STAGE_LIKE, "too many wildcards in LIKE pattern"));
    }
    Ok(())
}

/// Check the pattern operand of every LIKE / ILIKE.
///
/// A quoted literal right after the keyword is checked directly; a `:name`
/// parameter is looked up in `args`.
pub fn check_like_pattern(query: &str, args: &KeyValues) -> Result<(), DatabaseError> {
    for m in LIKE_KEYWORD.find_iter(query) {
        let rest = query[m.end()..].trim_start();
        if let Some(literal) = rest.strip_prefix('\'') {
            let Some(end) = literal.find('\'') else {
                continue;
            };
            check_like_literal(&literal[..end])?;
        } else if let Some(param) = rest.strip_prefix(':') {
            let name: String = param
                .chars()
                .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
                .collect();
            if let Some(SqlValue::String(value)) = lookup_arg(args, &name) {
                check_like_literal(value)?;
            }
        }
    }
    Ok(())
}

fn lookup_arg<'a>(args: &'a KeyValues, name: &str) -> Option<&'a SqlValue> {
    args.get(name).or_else(|| {
        args.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    })
}

/// Split on commas that are not nested in parentheses.
fn split_top_level(text: &str) -> Vec<&str> {
    let mut items = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (i, c) in text.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth -= 1,
            ',' if depth == 0 => {
                items.push(&text[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    items.push(&text[start..]);
    items
}

/// Validate an ORDER BY list: `field [ASC|DESC] [NULLS FIRST|LAST], ...`.
pub fn check_order_by(dialect: &dyn Dialect, expression: &str) -> Result<(), DatabaseError> {
    let fail = |detail: String| DatabaseError::injection(STAGE_ORDER_BY, detail);
    if expression.trim().is_empty() {
        return Err(fail("empty ORDER BY".to_string()));
    }
    for item in split_top_level(expression) {
        let tokens: Vec<&str> = item.split_whitespace().collect();
        let Some(field) = tokens.first() else {
            return Err(fail(format!("empty ORDER BY item in {:?}", expression)));
        };
        match field.parse::<u64>() {
            Ok(0) => return Err(fail("column ordinal must be positive".to_string())),
            Ok(_) => {}
            Err(_) => check_identifier(dialect, field)
                .map_err(|e| fail(format!("invalid ORDER BY field {:?}: {}", field, e)))?,
        }
        let mut rest = &tokens[1..];
        if let Some(direction) = rest.first() {
            if direction.eq_ignore_ascii_case("asc") || direction.eq_ignore_ascii_case("desc") {
                rest = &rest[1..];
            }
        }
        match rest {
            [] => {}
            [nulls, position]
                if nulls.eq_ignore_ascii_case("nulls")
                    && (position.eq_ignore_ascii_case("first") || position.eq_ignore_ascii_case("last")) =>
            {
                if !dialect.supports_nulls_ordering() {
                    return Err(fail(format!(
                        "NULLS {} is not supported on {}",
                        position.to_uppercase(),
                        dialect.database_type()
                    )));
                }
            }
            _ => return Err(fail(format!("invalid ORDER BY item {:?}", item.trim()))),
        }
    }
    Ok(())
}

/// Reject empty text, statement separators and the suspicious pattern set.
pub fn check_base_query(dialect: &dyn Dialect, query: &str) -> Result<(), DatabaseError> {
    if query.trim().is_empty() {
        return Err(DatabaseError::injection(STAGE_QUERY, "empty query"));
    }
    if query.contains(';') {
        return Err(DatabaseError::injection(
            STAGE_QUERY,
            format!("multiple statements are not allowed on {}", dialect.database_type()),
        ));
    }
    if let Some(pattern) = find_suspicious(query, &QUERY_PATTERNS) {
        return Err(DatabaseError::injection(
            STAGE_QUERY,
            format!("query matches suspicious pattern {}", pattern),
        ));
    }
    Ok(())
}

/// The text of the outermost ORDER BY clause, if any
fn extract_order_by(query: &str) -> Option<&str> {
    let mut depth_at = Vec::with_capacity(query.len() + 1);
    let mut depth = 0i32;
    for c in query.bytes() {
        depth_at.push(depth);
        match c {
            b'(' => depth += 1,
            b')' => depth -= 1,
            _ => {}
        }
    }
    let m = ORDER_BY_KEYWORD
        .find_iter(query)
        .filter(|m| depth_at.get(m.start()).copied().unwrap_or(0) == 0)
        .last()?;
    let tail = &query[m.end()..];
    let end = ORDER_BY_END.find(tail).map(|e| e.start()).unwrap_or(tail.len());
    Some(tail[..end].trim())
}

/// Run every applicable check over an assembled statement and its arguments.
pub fn check_all(
    dialect: &dyn Dialect,
    query: &str,
    args: &KeyValues,
    options: CheckOptions,
) -> Result<(), DatabaseError> {
    if options.allow_risk {
        return Ok(());
    }
    check_base_query(dialect, query)?;
    for value in args.values() {
        check_value(value)?;
    }
    if LIKE_KEYWORD.is_match(query) {
        check_like_pattern(query, args)?;
    }
    if let Some(order_by) = extract_order_by(query) {
        check_order_by(dialect, order_by)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::dialect::DatabaseType;
    use crate::db::value::{kv, SqlExpression};

    fn pg() -> &'static dyn Dialect {
        DatabaseType::Postgresql.dialect().unwrap()
    }

    fn mssql() -> &'static dyn Dialect {
        DatabaseType::Sqlserver.dialect().unwrap()
    }

    fn stage(err: DatabaseError) -> &'static str {
        match err {
            DatabaseError::SqlInjectionDetected { stage, .. } => stage,
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_identifier_accepts_plain_and_qualified() {
        assert!(check_identifier(pg(), "area").is_ok());
        assert!(check_identifier(pg(), "public.area").is_ok());
        assert!(check_identifier(pg(), "name").is_ok());
        assert!(check_identifier(pg(), "created_at").is_ok());
        assert!(check_identifier(pg(), "\"Mixed Case\"").is_ok());
        assert!(check_identifier(mssql(), "dbo.[order details]").is_ok());
    }

    #[test]
    fn test_identifier_rejects_keywords_and_garbage() {
        assert_eq!(stage(check_identifier(pg(), "select").unwrap_err()), STAGE_IDENTIFIER);
        assert!(check_identifier(pg(), "FROM").is_err());
        assert!(check_identifier(pg(), "").is_err());
        assert!(check_identifier(pg(), "a..b").is_err());
        assert!(check_identifier(pg(), "a.").is_err());
        assert!(check_identifier(pg(), "1abc").is_err());
        assert!(check_identifier(pg(), "code; drop").is_err());
        assert!(check_identifier(pg(), "\"unterminated").is_err());
        assert!(check_identifier(pg(), "\"x\"y").is_err());
        assert!(check_identifier(pg(), &"a".repeat(64)).is_err());
        assert!(check_identifier(mssql(), &"a".repeat(128)).is_ok());
        assert!(check_identifier(pg(), "[bracketed]").is_err());
    }

    #[test]
    fn test_quoted_identifier_escapes() {
        assert!(check_identifier(pg(), "\"say \"\"hi\"\"\"").is_ok());
        assert!(check_identifier(pg(), "\"x -- y\"").is_err());
    }

    #[test]
    fn test_operators() {
        assert!(check_operator(pg(), "ilike").is_ok());
        assert!(check_operator(mssql(), "ilike").is_err());
        assert!(check_operator(mssql(), "NOT  IN").is_ok());
        assert!(check_operator(pg(), "=").is_ok());
        assert_eq!(stage(check_operator(pg(), "~*").unwrap_err()), STAGE_OPERATOR);
    }

    #[test]
    fn test_values() {
        assert!(check_value(&SqlValue::from("create account")).is_ok());
        assert!(check_value(&SqlValue::from("O'Brien")).is_ok());
        assert!(check_value(&SqlValue::Int(5)).is_ok());
        assert!(check_value(&SqlValue::from("x'; drop table area")).is_err());
        assert!(check_value(&SqlValue::from("' or '1'='1")).is_err());
        assert!(check_value(&SqlValue::from("1 union select password")).is_err());
        assert!(check_value(&SqlValue::Array(vec![SqlValue::from("ok"), SqlValue::from("a -- b")])).is_err());
        assert!(check_value(&SqlValue::Json(serde_json::json!({"a": {"b": "sleep(5)"}}))).is_err());
        assert!(check_value(&SqlValue::Json(serde_json::json!({"x/*": 1}))).is_err());
        assert!(check_value(&SqlValue::Expression(SqlExpression::new("now()"))).is_ok());
        assert!(check_value(&SqlValue::Expression(SqlExpression::new("1; drop table x"))).is_err());
    }

    #[test]
    fn test_like_pattern() {
        let args = KeyValues::new();
        assert!(check_like_pattern("name like '%abc%'", &args).is_ok());
        assert_eq!(
            stage(check_like_pattern("name LIKE '%a%b%c%d%e%f%'", &args).unwrap_err()),
            STAGE_LIKE
        );
        let args = kv([("p", "%%%%%%%")]);
        assert!(check_like_pattern("name ilike :p", &args).is_err());
        let args = kv([("p", "%ab%")]);
        assert!(check_like_pattern("name ilike :p", &args).is_ok());
    }

    #[test]
    fn test_order_by() {
        assert!(check_order_by(pg(), "code").is_ok());
        assert!(check_order_by(pg(), "code DESC, a.name asc").is_ok());
        assert!(check_order_by(pg(), "code desc nulls last").is_ok());
        assert!(check_order_by(pg(), "1").is_ok());
        assert_eq!(stage(check_order_by(mssql(), "code nulls first").unwrap_err()), STAGE_ORDER_BY);
        assert!(check_order_by(pg(), "0").is_err());
        assert!(check_order_by(pg(), "code sideways").is_err());
        assert!(check_order_by(pg(), "(select 1)").is_err());
        assert!(check_order_by(pg(), "").is_err());
    }

    #[test]
    fn test_base_query() {
        assert!(check_base_query(pg(), "SELECT * FROM area WHERE code = :code").is_ok());
        assert!(check_base_query(pg(), "").is_err());
        assert!(check_base_query(pg(), "SELECT 1; SELECT 2").is_err());
        assert!(check_base_query(pg(), "SELECT * FROM area -- x").is_err());
        assert!(check_base_query(pg(), "SELECT * FROM a UNION SELECT * FROM b").is_err());
        assert!(check_base_query(pg(), "SELECT * FROM a WHERE 1=1").is_err());
        assert!(check_base_query(pg(), "SELECT * FROM information_schema.tables").is_err());
        assert!(check_base_query(mssql(), "SELECT * FROM a WHERE x = 1 WAITFOR DELAY '0:0:5'").is_err());
    }

    #[test]
    fn test_extract_order_by() {
        assert_eq!(
            extract_order_by("SELECT * FROM a ORDER BY code desc LIMIT 10"),
            Some("code desc")
        );
        assert_eq!(
            extract_order_by("SELECT row_number() over (order by x) FROM a"),
            None
        );
        assert_eq!(
            extract_order_by("SELECT * FROM a ORDER BY 1 OFFSET 5 ROWS FETCH NEXT 5 ROWS ONLY"),
            Some("1")
        );
    }

    #[test]
    fn test_check_all() {
        let args = kv([("code", "A1")]);
        let sql = "SELECT * FROM area WHERE code = :code ORDER BY code";
        assert!(check_all(pg(), sql, &args, CheckOptions::default()).is_ok());

        let bad = kv([("code", "x' or '1'='1")]);
        assert!(check_all(pg(), sql, &bad, CheckOptions::default()).is_err());
        assert!(check_all(pg(), sql, &bad, CheckOptions::allow_risk()).is_ok());

        let sql = "SELECT * FROM area ORDER BY (select password from users)";
        assert!(check_all(pg(), sql, &KeyValues::new(), CheckOptions::default()).is_err());
    }
}
