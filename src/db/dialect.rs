// SQL Dialects
// One `Dialect` implementation per engine; builders and the injection checker
// only talk to the trait.

use crate::db::traits::DatabaseError;
use crate::db::transaction::IsolationLevel;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

/// Supported database types
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    #[serde(alias = "postgres")]
    Postgresql,
    Mysql,
    Mariadb,
    Sqlserver,
    Oracle,
    #[default]
    #[serde(other)]
    Unknown,
}

impl DatabaseType {
    /// Resolve a configuration string; unrecognised names map to `Unknown`.
    pub fn from_str_lossy(s: &str) -> DatabaseType {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => DatabaseType::Postgresql,
            "mysql" => DatabaseType::Mysql,
            "mariadb" => DatabaseType::Mariadb,
            "sqlserver" => DatabaseType::Sqlserver,
            "oracle" => DatabaseType::Oracle,
            _ => DatabaseType::Unknown,
        }
    }

    /// Name used in connection URLs and logs
    pub fn driver_name(&self) -> &'static str {
        match self {
            DatabaseType::Postgresql => "postgres",
            DatabaseType::Mysql => "mysql",
            DatabaseType::Mariadb => "mariadb",
            DatabaseType::Sqlserver => "sqlserver",
            DatabaseType::Oracle => "oracle",
            DatabaseType::Unknown => "unknown",
        }
    }

    /// Display name for UI
    pub fn display_name(&self) -> &'static str {
        match self {
            DatabaseType::Postgresql => "PostgreSQL",
            DatabaseType::Mysql => "MySQL",
            DatabaseType::Mariadb => "MariaDB",
            DatabaseType::Sqlserver => "Microsoft SQL Server",
            DatabaseType::Oracle => "Oracle",
            DatabaseType::Unknown => "Unknown",
        }
    }

    /// Default port for the database type
    pub fn default_port(&self) -> u16 {
        match self {
            DatabaseType::Postgresql => 5432,
            DatabaseType::Mysql | DatabaseType::Mariadb => 3306,
            DatabaseType::Sqlserver => 1433,
            DatabaseType::Oracle => 1521,
            DatabaseType::Unknown => 0,
        }
    }

    pub fn dialect(&self) -> Result<&'static dyn Dialect, DatabaseError> {
        match self {
            DatabaseType::Postgresql => Ok(&PostgresDialect),
            DatabaseType::Mysql => Ok(&MYSQL_DIALECT),
            DatabaseType::Mariadb => Ok(&MARIADB_DIALECT),
            DatabaseType::Sqlserver => Ok(&SqlServerDialect),
            DatabaseType::Oracle => Ok(&OracleDialect),
            DatabaseType::Unknown => Err(DatabaseError::UnsupportedDatabase(
                self.driver_name().to_string(),
            )),
        }
    }
}

impl fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.driver_name())
    }
}

impl FromStr for DatabaseType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(DatabaseType::from_str_lossy(s))
    }
}

/// How the generated id of an INSERT comes back from the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReturningMode {
    /// `RETURNING id` / `OUTPUT INSERTED.id`: the statement yields a row
    Row,
    /// `RETURNING id INTO :bind`: the id arrives in an OUT parameter
    OutParam { bind_name: String },
    /// The driver reports the last auto-increment value
    LastInsertId,
}

/// Row-returning clause for UPDATE/DELETE
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReturningClause {
    /// SQL Server `OUTPUT INSERTED.x` / `OUTPUT DELETED.x`, placed before WHERE
    Output(String),
    /// `RETURNING x`, appended at the end
    Returning(String),
}

pub trait Dialect: Send + Sync {
    fn database_type(&self) -> DatabaseType;

    /// Identifier casing applied to table and field names
    fn format_identifier(&self, identifier: &str) -> String {
        identifier.to_string()
    }

    /// Positional or named placeholder for the `index`-th (1-based) parameter
    fn placeholder(&self, index: usize, name: &str) -> String;

    /// Whether a repeated named parameter can share one placeholder
    fn reuses_placeholders(&self) -> bool {
        true
    }

    /// Text inserted right after SELECT (`TOP n`), when the engine wants one
    fn build_select_limit(&self, _limit: Option<u64>, _offset: Option<u64>) -> Option<String> {
        None
    }

    /// Paging tail appended after ORDER BY
    fn build_paging(&self, limit: Option<u64>, offset: Option<u64>, has_order_by: bool) -> String;

    fn returning_insert(
        &self,
        table: &str,
        fields: &[String],
        values: &[String],
        id_field: &str,
    ) -> (String, ReturningMode);

    fn output_clause_update(&self, fields: &[String]) -> Result<ReturningClause, DatabaseError>;

    fn output_clause_delete(&self, fields: &[String]) -> Result<ReturningClause, DatabaseError>;

    fn count_expression(&self) -> &'static str;

    fn max_identifier_length(&self) -> usize;

    fn identifier_pattern(&self) -> &'static Regex;

    fn quote_pairs(&self) -> &'static [(char, char)] {
        &[('"', '"')]
    }

    fn reserved_keywords(&self) -> &'static HashSet<&'static str>;

    fn operators(&self) -> &'static [&'static str] {
        COMMON_OPERATORS
    }

    fn supports_nulls_ordering(&self) -> bool {
        false
    }

    fn supports_for_update(&self) -> bool {
        true
    }

    fn supports_isolation_level(&self) -> bool {
        true
    }

    /// Keyword between a derived table and its alias
    fn subquery_alias_keyword(&self) -> &'static str {
        " AS "
    }

    /// SQL Server and Oracle have no boolean column type
    fn normalizes_booleans(&self) -> bool {
        false
    }

    fn supports_native_arrays(&self) -> bool {
        false
    }

    /// Isolation keyword for `SET TRANSACTION` / `BEGIN ISOLATION LEVEL`
    fn isolation_level_sql(&self, level: IsolationLevel) -> Option<&'static str> {
        if !self.supports_isolation_level() {
            return None;
        }
        match level {
            IsolationLevel::Default => None,
            IsolationLevel::ReadUncommitted => Some("READ UNCOMMITTED"),
            IsolationLevel::ReadCommitted | IsolationLevel::WriteCommitted => Some("READ COMMITTED"),
            IsolationLevel::RepeatableRead | IsolationLevel::Snapshot => Some("REPEATABLE READ"),
            IsolationLevel::Serializable | IsolationLevel::Linearizable => Some("SERIALIZABLE"),
        }
    }
}

const COMMON_OPERATORS: &[&str] = &[
    "=", "!=", "<>", ">", "<", ">=", "<=", "like", "in", "not in", "is null", "is not null",
];

const POSTGRES_OPERATORS: &[&str] = &[
    "=", "!=", "<>", ">", "<", ">=", "<=", "like", "ilike", "in", "not in", "is null",
    "is not null",
];

// Words rejected as bare identifiers on every engine
const CORE_KEYWORDS: &[&str] = &[
    "all", "alter", "and", "any", "as", "between", "by", "case", "check", "column",
    "constraint", "create", "cross", "delete", "distinct", "drop", "else", "end", "exists",
    "foreign", "from", "grant", "group", "having", "in", "inner", "insert", "intersect",
    "into", "is", "join", "left", "like", "not", "null", "on", "or", "order", "outer",
    "primary", "references", "revoke", "right", "select", "set", "table", "then", "to",
    "union", "unique", "update", "values", "when", "where", "with",
];

fn keyword_set(extra: &[&'static str]) -> HashSet<&'static str> {
    CORE_KEYWORDS.iter().chain(extra.iter()).copied().collect()
}

static POSTGRES_KEYWORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    keyword_set(&[
        "analyse", "analyze", "array", "asc", "asymmetric", "both", "cast", "collate",
        "current_date", "current_role", "current_time", "current_timestamp", "current_user",
        "default", "deferrable", "desc", "do", "except", "false", "fetch", "for", "initially",
        "lateral", "leading", "limit", "localtime", "localtimestamp", "offset", "only",
        "placing", "returning", "session_user", "some", "symmetric", "trailing", "true",
        "user", "using", "variadic", "window",
    ])
});

static MYSQL_KEYWORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    keyword_set(&[
        "asc", "before", "both", "call", "cascade", "change", "condition", "continue",
        "convert", "current_date", "current_time", "current_timestamp", "current_user",
        "database", "databases", "declare", "default", "delayed", "desc", "describe",
        "div", "dual", "each", "exit", "explain", "false", "fetch", "for", "force",
        "fulltext", "if", "ignore", "index", "infile", "interval", "iterate", "key", "keys",
        "kill", "leading", "leave", "limit", "lines", "load", "lock", "loop", "match",
        "mod", "natural", "outfile", "procedure", "purge", "range", "read", "regexp",
        "release", "rename", "repeat", "replace", "require", "restrict", "return", "rlike",
        "schema", "schemas", "separator", "show", "signal", "spatial", "sql", "straight_join",
        "terminated", "trailing", "trigger", "true", "undo", "unlock", "unsigned", "usage",
        "use", "using", "utc_date", "utc_time", "utc_timestamp", "while", "write", "xor",
        "zerofill",
    ])
});

static SQLSERVER_KEYWORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    keyword_set(&[
        "add", "asc", "authorization", "backup", "begin", "break", "browse", "bulk",
        "cascade", "checkpoint", "close", "clustered", "coalesce", "collate", "commit",
        "compute", "contains", "containstable", "continue", "convert", "current",
        "current_date", "current_time", "current_timestamp", "current_user", "cursor",
        "database", "dbcc", "deallocate", "declare", "default", "deny", "desc", "disk",
        "distributed", "double", "dump", "errlvl", "escape", "except", "exec", "execute",
        "exit", "external", "fetch", "file", "fillfactor", "for", "freetext", "full",
        "function", "goto", "holdlock", "identity", "identity_insert", "identitycol", "if",
        "index", "key", "kill", "lineno", "load", "merge", "national", "nocheck",
        "nonclustered", "nullif", "of", "off", "offsets", "open", "opendatasource",
        "openquery", "openrowset", "openxml", "option", "over", "percent", "pivot", "plan",
        "print", "proc", "procedure", "public", "raiserror", "read", "readtext",
        "reconfigure", "replication", "restore", "restrict", "return", "revert",
        "rollback", "rowcount", "rowguidcol", "rule", "save", "schema", "securityaudit",
        "semantickeyphrasetable", "session_user", "setuser", "shutdown", "some",
        "statistics", "system_user", "tablesample", "textsize", "top", "tran",
        "transaction", "trigger", "truncate", "try_convert", "tsequal", "unpivot",
        "updatetext", "use", "user", "varying", "view", "waitfor", "while", "within",
        "writetext",
    ])
});

static ORACLE_KEYWORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    keyword_set(&[
        "access", "add", "asc", "audit", "char", "cluster", "comment", "compress",
        "connect", "current", "date", "decimal", "default", "desc", "exclusive", "file",
        "float", "identified", "immediate", "increment", "index", "initial", "integer",
        "level", "lock", "long", "maxextents", "minus", "mlslabel", "mode", "modify",
        "noaudit", "nocompress", "nowait", "number", "of", "offline", "online", "option",
        "pctfree", "prior", "public", "raw", "rename", "resource", "row", "rowid",
        "rownum", "rows", "session", "share", "size", "smallint", "start", "successful",
        "synonym", "sysdate", "trigger", "uid", "user", "validate", "varchar", "varchar2",
        "view", "whenever",
    ])
});

static POSTGRES_IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*$").expect("valid regex"));
static MYSQL_IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9_$]+$").expect("valid regex"));
static SQLSERVER_IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z@#_][a-zA-Z0-9@#_$]*$").expect("valid regex"));
static ORACLE_IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z][a-zA-Z0-9_$#]*$").expect("valid regex"));

fn limit_offset(limit: Option<u64>, offset: Option<u64>) -> String {
    match (limit, offset) {
        (Some(limit), Some(offset)) if offset > 0 => format!(" LIMIT {} OFFSET {}", limit, offset),
        (Some(limit), _) => format!(" LIMIT {}", limit),
        (None, Some(offset)) if offset > 0 => format!(" OFFSET {}", offset),
        _ => String::new(),
    }
}

fn offset_fetch(limit: Option<u64>, offset: Option<u64>) -> String {
    match (limit, offset) {
        (Some(limit), Some(offset)) if offset > 0 => {
            format!(" OFFSET {} ROWS FETCH NEXT {} ROWS ONLY", offset, limit)
        }
        (Some(limit), _) => format!(" FETCH FIRST {} ROWS ONLY", limit),
        (None, Some(offset)) if offset > 0 => format!(" OFFSET {} ROWS", offset),
        _ => String::new(),
    }
}

// ============================================================================
// PostgreSQL
// ============================================================================

pub struct PostgresDialect;

impl Dialect for PostgresDialect {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::Postgresql
    }

    fn placeholder(&self, index: usize, _name: &str) -> String {
        format!("${}", index)
    }

    fn build_paging(&self, limit: Option<u64>, offset: Option<u64>, _has_order_by: bool) -> String {
        limit_offset(limit, offset)
    }

    fn returning_insert(
        &self,
        table: &str,
        fields: &[String],
        values: &[String],
        id_field: &str,
    ) -> (String, ReturningMode) {
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({}) RETURNING {}",
            table,
            fields.join(", "),
            values.join(", "),
            id_field
        );
        (sql, ReturningMode::Row)
    }

    fn output_clause_update(&self, fields: &[String]) -> Result<ReturningClause, DatabaseError> {
        Ok(ReturningClause::Returning(fields.join(", ")))
    }

    fn output_clause_delete(&self, fields: &[String]) -> Result<ReturningClause, DatabaseError> {
        Ok(ReturningClause::Returning(fields.join(", ")))
    }

    fn count_expression(&self) -> &'static str {
        "CAST(COUNT(*) AS BIGINT)"
    }

    fn max_identifier_length(&self) -> usize {
        63
    }

    fn identifier_pattern(&self) -> &'static Regex {
        &POSTGRES_IDENTIFIER
    }

    fn reserved_keywords(&self) -> &'static HashSet<&'static str> {
        &POSTGRES_KEYWORDS
    }

    fn operators(&self) -> &'static [&'static str] {
        POSTGRES_OPERATORS
    }

    fn supports_nulls_ordering(&self) -> bool {
        true
    }

    fn supports_native_arrays(&self) -> bool {
        true
    }
}

// ============================================================================
// MySQL / MariaDB
// ============================================================================

/// MySQL and MariaDB share syntax; MariaDB additionally supports RETURNING.
pub struct MysqlDialect {
    mariadb: bool,
}

static MYSQL_DIALECT: MysqlDialect = MysqlDialect { mariadb: false };
static MARIADB_DIALECT: MysqlDialect = MysqlDialect { mariadb: true };

impl Dialect for MysqlDialect {
    fn database_type(&self) -> DatabaseType {
        if self.mariadb {
            DatabaseType::Mariadb
        } else {
            DatabaseType::Mysql
        }
    }

    fn placeholder(&self, _index: usize, _name: &str) -> String {
        "?".to_string()
    }

    fn reuses_placeholders(&self) -> bool {
        false
    }

    fn build_paging(&self, limit: Option<u64>, offset: Option<u64>, _has_order_by: bool) -> String {
        match (limit, offset) {
            // MySQL has no bare OFFSET
            (None, Some(offset)) if offset > 0 => {
                format!(" LIMIT {} OFFSET {}", u64::MAX, offset)
            }
            _ => limit_offset(limit, offset),
        }
    }

    fn returning_insert(
        &self,
        table: &str,
        fields: &[String],
        values: &[String],
        id_field: &str,
    ) -> (String, ReturningMode) {
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            table,
            fields.join(", "),
            values.join(", ")
        );
        if self.mariadb {
            (format!("{} RETURNING {}", sql, id_field), ReturningMode::Row)
        } else {
            (sql, ReturningMode::LastInsertId)
        }
    }

    fn output_clause_update(&self, _fields: &[String]) -> Result<ReturningClause, DatabaseError> {
        Err(DatabaseError::InvalidRequest(format!(
            "UPDATE ... RETURNING is not supported on {}",
            self.database_type()
        )))
    }

    fn output_clause_delete(&self, fields: &[String]) -> Result<ReturningClause, DatabaseError> {
        if self.mariadb {
            Ok(ReturningClause::Returning(fields.join(", ")))
        } else {
            Err(DatabaseError::InvalidRequest(
                "DELETE ... RETURNING is not supported on mysql".to_string(),
            ))
        }
    }

    fn count_expression(&self) -> &'static str {
        "CAST(COUNT(*) AS SIGNED)"
    }

    fn max_identifier_length(&self) -> usize {
        64
    }

    fn identifier_pattern(&self) -> &'static Regex {
        &MYSQL_IDENTIFIER
    }

    fn reserved_keywords(&self) -> &'static HashSet<&'static str> {
        &MYSQL_KEYWORDS
    }
}

// ============================================================================
// SQL Server
// ============================================================================

pub struct SqlServerDialect;

impl Dialect for SqlServerDialect {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::Sqlserver
    }

    fn placeholder(&self, index: usize, _name: &str) -> String {
        format!("@P{}", index)
    }

    fn build_select_limit(&self, limit: Option<u64>, offset: Option<u64>) -> Option<String> {
        match (limit, offset) {
            (Some(limit), None) | (Some(limit), Some(0)) => Some(format!("TOP {}", limit)),
            _ => None,
        }
    }

    fn build_paging(&self, limit: Option<u64>, offset: Option<u64>, has_order_by: bool) -> String {
        let offset = match offset {
            Some(offset) if offset > 0 => offset,
            // plain limits go through TOP
            _ => return String::new(),
        };
        let order_by = if has_order_by { "" } else { " ORDER BY 1" };
        match limit {
            Some(limit) => format!(
                "{} OFFSET {} ROWS FETCH NEXT {} ROWS ONLY",
                order_by, offset, limit
            ),
            None => format!("{} OFFSET {} ROWS", order_by, offset),
        }
    }

    fn returning_insert(
        &self,
        table: &str,
        fields: &[String],
        values: &[String],
        id_field: &str,
    ) -> (String, ReturningMode) {
        let sql = format!(
            "INSERT INTO {} ({}) OUTPUT INSERTED.{} VALUES ({})",
            table,
            fields.join(", "),
            id_field,
            values.join(", ")
        );
        (sql, ReturningMode::Row)
    }

    fn output_clause_update(&self, fields: &[String]) -> Result<ReturningClause, DatabaseError> {
        Ok(ReturningClause::Output(prefixed(fields, "INSERTED")))
    }

    fn output_clause_delete(&self, fields: &[String]) -> Result<ReturningClause, DatabaseError> {
        Ok(ReturningClause::Output(prefixed(fields, "DELETED")))
    }

    fn count_expression(&self) -> &'static str {
        "CAST(COUNT(*) AS BIGINT)"
    }

    fn max_identifier_length(&self) -> usize {
        128
    }

    fn identifier_pattern(&self) -> &'static Regex {
        &SQLSERVER_IDENTIFIER
    }

    fn quote_pairs(&self) -> &'static [(char, char)] {
        &[('"', '"'), ('[', ']')]
    }

    fn reserved_keywords(&self) -> &'static HashSet<&'static str> {
        &SQLSERVER_KEYWORDS
    }

    fn supports_for_update(&self) -> bool {
        false
    }

    fn normalizes_booleans(&self) -> bool {
        true
    }

    fn isolation_level_sql(&self, level: IsolationLevel) -> Option<&'static str> {
        match level {
            IsolationLevel::Snapshot => Some("SNAPSHOT"),
            IsolationLevel::Default => None,
            IsolationLevel::ReadUncommitted => Some("READ UNCOMMITTED"),
            IsolationLevel::ReadCommitted | IsolationLevel::WriteCommitted => Some("READ COMMITTED"),
            IsolationLevel::RepeatableRead => Some("REPEATABLE READ"),
            IsolationLevel::Serializable | IsolationLevel::Linearizable => Some("SERIALIZABLE"),
        }
    }
}

fn prefixed(fields: &[String], pseudo_table: &str) -> String {
    fields
        .iter()
        .map(|f| format!("{}.{}", pseudo_table, f))
        .collect::<Vec<_>>()
        .join(", ")
}

// ============================================================================
// Oracle
// ============================================================================

pub struct OracleDialect;

impl Dialect for OracleDialect {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::Oracle
    }

    /// Unquoted segments are folded to upper case, quoted ones kept as written
    fn format_identifier(&self, identifier: &str) -> String {
        let mut out = String::with_capacity(identifier.len());
        let mut in_quote = false;
        for ch in identifier.chars() {
            if ch == '"' {
                in_quote = !in_quote;
                out.push(ch);
            } else if in_quote {
                out.push(ch);
            } else {
                out.extend(ch.to_uppercase());
            }
        }
        out
    }

    fn placeholder(&self, _index: usize, name: &str) -> String {
        format!(":{}", name)
    }

    fn build_paging(&self, limit: Option<u64>, offset: Option<u64>, _has_order_by: bool) -> String {
        offset_fetch(limit, offset)
    }

    fn returning_insert(
        &self,
        table: &str,
        fields: &[String],
        values: &[String],
        id_field: &str,
    ) -> (String, ReturningMode) {
        let bind_name = format!("{}_OUT", id_field);
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({}) RETURNING {} INTO :{}",
            table,
            fields.join(", "),
            values.join(", "),
            id_field,
            bind_name
        );
        (sql, ReturningMode::OutParam { bind_name })
    }

    fn output_clause_update(&self, _fields: &[String]) -> Result<ReturningClause, DatabaseError> {
        Err(DatabaseError::InvalidRequest(
            "UPDATE ... RETURNING needs OUT binds on oracle and is not supported".to_string(),
        ))
    }

    fn output_clause_delete(&self, _fields: &[String]) -> Result<ReturningClause, DatabaseError> {
        Err(DatabaseError::InvalidRequest(
            "DELETE ... RETURNING needs OUT binds on oracle and is not supported".to_string(),
        ))
    }

    fn count_expression(&self) -> &'static str {
        "COUNT(*)"
    }

    fn max_identifier_length(&self) -> usize {
        128
    }

    fn identifier_pattern(&self) -> &'static Regex {
        &ORACLE_IDENTIFIER
    }

    fn reserved_keywords(&self) -> &'static HashSet<&'static str> {
        &ORACLE_KEYWORDS
    }

    fn supports_nulls_ordering(&self) -> bool {
        true
    }

    fn supports_isolation_level(&self) -> bool {
        false
    }

    fn subquery_alias_keyword(&self) -> &'static str {
        " "
    }

    fn normalizes_booleans(&self) -> bool {
        true
    }
}
