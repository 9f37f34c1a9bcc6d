// SELECT, COUNT and paging statements

use super::parts::{
    sql_part_field_names, sql_part_order_by, sql_part_table, sql_part_where, FieldsOrderBy,
    OrderByField,
};
use super::NamedStatement;
use crate::db::dialect::Dialect;
use crate::db::sqlchecker::check_identifier;
use crate::db::traits::DatabaseError;
use crate::db::value::{KeyValues, Row, RowSet, SqlValue};

/// Alias of the row count column produced by count queries
pub const TOTAL_ROWS_FIELD: &str = "s___total_rows";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectRequest {
    pub table: String,
    pub fields: Option<Vec<String>>,
    pub where_kv: KeyValues,
    pub join: Option<String>,
    pub group_by: Vec<String>,
    pub having: Option<String>,
    pub order_by: FieldsOrderBy,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub for_update: bool,
    /// `name AS (SELECT ...)` without the leading WITH
    pub with_cte: Option<String>,
}

impl SelectRequest {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ..Default::default()
        }
    }

    pub fn fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn where_eq(mut self, field: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        self.where_kv.insert(field.into(), value.into());
        self
    }

    pub fn where_kv(mut self, where_kv: KeyValues) -> Self {
        self.where_kv.extend(where_kv);
        self
    }

    pub fn join(mut self, join: impl Into<String>) -> Self {
        self.join = Some(join.into());
        self
    }

    pub fn group_by<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.group_by = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn having(mut self, having: impl Into<String>) -> Self {
        self.having = Some(having.into());
        self
    }

    pub fn order_by(mut self, field: OrderByField) -> Self {
        self.order_by.push(field);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Limit taken from a dynamic value, e.g. a request parameter
    pub fn limit_value(mut self, limit: &SqlValue) -> Result<Self, DatabaseError> {
        self.limit = parse_limit(limit)?;
        Ok(self)
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn for_update(mut self) -> Self {
        self.for_update = true;
        self
    }

    pub fn with_cte(mut self, cte: impl Into<String>) -> Self {
        self.with_cte = Some(cte.into());
        self
    }
}

/// NULL means no limit; anything other than a non-negative integer is rejected.
pub fn parse_limit(value: &SqlValue) -> Result<Option<u64>, DatabaseError> {
    match value {
        SqlValue::Null => Ok(None),
        SqlValue::Int(n) if *n >= 0 => Ok(Some(*n as u64)),
        SqlValue::Json(serde_json::Value::Number(n)) if n.as_u64().is_some() => Ok(n.as_u64()),
        other => Err(DatabaseError::InvalidLimit(format!(
            "limit must be a non-negative integer, got {} {}",
            other.type_name(),
            other
        ))),
    }
}

fn non_zero(value: Option<u64>) -> Option<u64> {
    value.filter(|v| *v > 0)
}

pub fn build_select(
    dialect: &dyn Dialect,
    request: &SelectRequest,
) -> Result<NamedStatement, DatabaseError> {
    let table = sql_part_table(dialect, &request.table)?;
    let fields = sql_part_field_names(dialect, request.fields.as_deref())?;
    let (where_sql, args) = sql_part_where(dialect, &request.where_kv)?;
    let limit = non_zero(request.limit);
    let offset = non_zero(request.offset);

    let mut sql = String::new();
    if let Some(cte) = &request.with_cte {
        sql.push_str("WITH ");
        sql.push_str(cte.trim());
        sql.push(' ');
    }
    sql.push_str("SELECT ");
    if let Some(top) = dialect.build_select_limit(limit, offset) {
        sql.push_str(&top);
        sql.push(' ');
    }
    sql.push_str(&fields);
    sql.push_str(" FROM ");
    sql.push_str(&table);
    if let Some(join) = request.join.as_deref().filter(|j| !j.trim().is_empty()) {
        sql.push(' ');
        sql.push_str(join.trim());
    }
    if !where_sql.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&where_sql);
    }
    if !request.group_by.is_empty() {
        for field in &request.group_by {
            check_identifier(dialect, field)?;
        }
        let group_by: Vec<String> = request
            .group_by
            .iter()
            .map(|f| dialect.format_identifier(f))
            .collect();
        sql.push_str(" GROUP BY ");
        sql.push_str(&group_by.join(", "));
    }
    if let Some(having) = request.having.as_deref().filter(|h| !h.trim().is_empty()) {
        sql.push_str(" HAVING ");
        sql.push_str(having.trim());
    }
    let has_order_by = !request.order_by.is_empty();
    if has_order_by {
        sql.push_str(" ORDER BY ");
        sql.push_str(&sql_part_order_by(dialect, &request.order_by)?);
    }
    sql.push_str(&dialect.build_paging(limit, offset, has_order_by));
    if request.for_update {
        if !dialect.supports_for_update() {
            return Err(DatabaseError::InvalidRequest(format!(
                "FOR UPDATE is not supported on {}",
                dialect.database_type()
            )));
        }
        sql.push_str(" FOR UPDATE");
    }
    Ok(NamedStatement::new(sql, args))
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CountRequest {
    /// Table reference or a sub-query
    pub table: String,
    /// Extra aggregate columns, e.g. `sum(amount) as total_amount`
    pub summary_fields: Option<String>,
    pub where_kv: KeyValues,
    pub join: Option<String>,
}

impl CountRequest {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ..Default::default()
        }
    }

    pub fn where_eq(mut self, field: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        self.where_kv.insert(field.into(), value.into());
        self
    }

    pub fn summary(mut self, summary_fields: impl Into<String>) -> Self {
        self.summary_fields = Some(summary_fields.into());
        self
    }

    pub fn join(mut self, join: impl Into<String>) -> Self {
        self.join = Some(join.into());
        self
    }
}

fn is_subquery(source: &str) -> bool {
    let lowered = source.trim_start().to_ascii_lowercase();
    lowered.starts_with('(') || lowered.starts_with("select ") || lowered.starts_with("with ")
}

fn subquery_source(dialect: &dyn Dialect, query: &str) -> String {
    let query = query.trim();
    let inner = query
        .strip_prefix('(')
        .and_then(|q| q.strip_suffix(')'))
        .unwrap_or(query);
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "({}){}subquery__sq_{}",
        inner.trim(),
        dialect.subquery_alias_keyword(),
        &suffix[..8]
    )
}

fn count_head(dialect: &dyn Dialect, summary_fields: Option<&str>) -> String {
    let mut head = format!(
        "SELECT {} AS {}",
        dialect.count_expression(),
        TOTAL_ROWS_FIELD
    );
    if let Some(summary) = summary_fields.map(str::trim).filter(|s| !s.is_empty()) {
        head.push_str(", ");
        head.push_str(summary);
    }
    head
}

pub fn build_count(
    dialect: &dyn Dialect,
    request: &CountRequest,
) -> Result<NamedStatement, DatabaseError> {
    let subquery = is_subquery(&request.table);
    if subquery && !request.where_kv.is_empty() {
        return Err(DatabaseError::InvalidRequest(
            "WHERE_NOT_ALLOWED_WITH_SUBQUERY".to_string(),
        ));
    }
    let source = if subquery {
        subquery_source(dialect, &request.table)
    } else {
        sql_part_table(dialect, &request.table)?
    };
    let (where_sql, args) = sql_part_where(dialect, &request.where_kv)?;

    let mut sql = count_head(dialect, request.summary_fields.as_deref());
    sql.push_str(" FROM ");
    sql.push_str(&source);
    if let Some(join) = request.join.as_deref().filter(|j| !j.trim().is_empty()) {
        sql.push(' ');
        sql.push_str(join.trim());
    }
    if !where_sql.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&where_sql);
    }
    Ok(NamedStatement::new(sql, args))
}

/// Row count plus any summary aggregates of a count query
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct CountResult {
    pub total_rows: i64,
    pub summary: Row,
}

impl CountResult {
    /// Split a (key-lowercased) count row into the total and the summary columns.
    pub fn from_row(mut row: Row) -> Result<Self, DatabaseError> {
        let total_rows = match row.shift_remove(TOTAL_ROWS_FIELD) {
            None | Some(SqlValue::Null) => 0,
            Some(value) => value.as_i64().ok_or_else(|| {
                DatabaseError::QueryError(format!(
                    "{} came back as {}",
                    TOTAL_ROWS_FIELD,
                    value.type_name()
                ))
            })?,
        };
        Ok(Self {
            total_rows,
            summary: row,
        })
    }
}

/// Raw-text paging request; `where_clause` may reference `args` as `:name`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PagingRequest {
    pub fields: Option<String>,
    pub from: String,
    pub join: Option<String>,
    pub where_clause: Option<String>,
    pub order_by: Option<String>,
    pub summary_fields: Option<String>,
    pub args: KeyValues,
    pub rows_per_page: u64,
    /// Zero based
    pub page_index: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PagingStatements {
    pub count: NamedStatement,
    pub rows: NamedStatement,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct PagingResult {
    pub rows: RowSet,
    pub total_rows: i64,
    pub total_pages: i64,
    pub summary: Row,
}

pub fn total_pages(total_rows: i64, rows_per_page: u64) -> i64 {
    if rows_per_page == 0 {
        return 1;
    }
    let per_page = i64::try_from(rows_per_page).unwrap_or(i64::MAX);
    ((total_rows - 1) / per_page) + 1
}

fn non_empty(text: &Option<String>) -> Option<&str> {
    text.as_deref().map(str::trim).filter(|t| !t.is_empty())
}

pub fn build_paging(
    dialect: &dyn Dialect,
    request: &PagingRequest,
) -> Result<PagingStatements, DatabaseError> {
    if request.from.trim().is_empty() {
        return Err(DatabaseError::InvalidRequest("paging needs a FROM part".to_string()));
    }
    let mut tail = format!(" FROM {}", request.from.trim());
    if let Some(join) = non_empty(&request.join) {
        tail.push(' ');
        tail.push_str(join);
    }
    if let Some(where_clause) = non_empty(&request.where_clause) {
        tail.push_str(" WHERE ");
        tail.push_str(where_clause);
    }

    let count_sql = format!(
        "{}{}",
        count_head(dialect, request.summary_fields.as_deref()),
        tail
    );

    let (limit, offset) = if request.rows_per_page > 0 {
        (
            Some(request.rows_per_page),
            non_zero(Some(request.page_index.saturating_mul(request.rows_per_page))),
        )
    } else {
        (None, None)
    };
    let mut rows_sql = String::from("SELECT ");
    if let Some(top) = dialect.build_select_limit(limit, offset) {
        rows_sql.push_str(&top);
        rows_sql.push(' ');
    }
    rows_sql.push_str(non_empty(&request.fields).unwrap_or("*"));
    rows_sql.push_str(&tail);
    let order_by = non_empty(&request.order_by);
    if let Some(order_by) = order_by {
        rows_sql.push_str(" ORDER BY ");
        rows_sql.push_str(order_by);
    }
    rows_sql.push_str(&dialect.build_paging(limit, offset, order_by.is_some()));

    Ok(PagingStatements {
        count: NamedStatement::new(count_sql, request.args.clone()),
        rows: NamedStatement::new(rows_sql, request.args.clone()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::dialect::DatabaseType;

    fn dialect(t: DatabaseType) -> &'static dyn Dialect {
        t.dialect().unwrap()
    }

    #[test]
    fn test_select_postgres() {
        let request = SelectRequest::new("area")
            .fields(["id", "code"])
            .where_eq("code", "A1")
            .order_by(OrderByField::asc("code"))
            .limit(10)
            .offset(20)
            .for_update();
        let stmt = build_select(dialect(DatabaseType::Postgresql), &request).unwrap();
        assert_eq!(
            stmt.sql,
            "SELECT id, code FROM area WHERE code = :code ORDER BY code ASC LIMIT 10 OFFSET 20 FOR UPDATE"
        );
        assert_eq!(stmt.args["code"], SqlValue::from("A1"));
    }

    #[test]
    fn test_select_sqlserver_top_and_offset() {
        let mssql = dialect(DatabaseType::Sqlserver);
        let stmt = build_select(mssql, &SelectRequest::new("area").limit(1)).unwrap();
        assert_eq!(stmt.sql, "SELECT TOP 1 * FROM area");

        let stmt = build_select(mssql, &SelectRequest::new("area").limit(5).offset(10)).unwrap();
        assert_eq!(
            stmt.sql,
            "SELECT * FROM area ORDER BY 1 OFFSET 10 ROWS FETCH NEXT 5 ROWS ONLY"
        );

        assert!(build_select(mssql, &SelectRequest::new("area").for_update()).is_err());
    }

    #[test]
    fn test_select_oracle_uppercases() {
        let stmt = build_select(
            dialect(DatabaseType::Oracle),
            &SelectRequest::new("area").where_eq("code", "A1").limit(1),
        )
        .unwrap();
        assert_eq!(stmt.sql, "SELECT * FROM AREA WHERE CODE = :code FETCH FIRST 1 ROWS ONLY");
    }

    #[test]
    fn test_select_with_cte_group_having_join() {
        let request = SelectRequest::new("area a")
            .with_cte("recent AS (SELECT area_id FROM visit)")
            .fields(["a.code", "count(*) as visits"])
            .join("JOIN recent r ON r.area_id = a.id")
            .group_by(["a.code"])
            .having("count(*) > 1");
        let stmt = build_select(dialect(DatabaseType::Postgresql), &request).unwrap();
        assert_eq!(
            stmt.sql,
            "WITH recent AS (SELECT area_id FROM visit) SELECT a.code, count(*) as visits FROM area a JOIN recent r ON r.area_id = a.id GROUP BY a.code HAVING count(*) > 1"
        );
    }

    #[test]
    fn test_parse_limit() {
        assert_eq!(parse_limit(&SqlValue::Int(5)).unwrap(), Some(5));
        assert_eq!(parse_limit(&SqlValue::Null).unwrap(), None);
        assert!(matches!(
            parse_limit(&SqlValue::from("5")),
            Err(DatabaseError::InvalidLimit(_))
        ));
        assert!(parse_limit(&SqlValue::Int(-1)).is_err());
        assert!(parse_limit(&SqlValue::Float(1.5)).is_err());
    }

    #[test]
    fn test_count_per_dialect() {
        let request = CountRequest::new("area").where_eq("code", "A1");
        let stmt = build_count(dialect(DatabaseType::Postgresql), &request).unwrap();
        assert_eq!(
            stmt.sql,
            "SELECT CAST(COUNT(*) AS BIGINT) AS s___total_rows FROM area WHERE code = :code"
        );
        let stmt = build_count(dialect(DatabaseType::Mysql), &request).unwrap();
        assert!(stmt.sql.starts_with("SELECT CAST(COUNT(*) AS SIGNED) AS s___total_rows"));
        let stmt = build_count(dialect(DatabaseType::Oracle), &request).unwrap();
        assert!(stmt.sql.starts_with("SELECT COUNT(*) AS s___total_rows FROM AREA"));
    }

    #[test]
    fn test_count_summary_and_join_order() {
        let request = CountRequest::new("invoice i")
            .summary("sum(i.amount) as total_amount")
            .join("JOIN customer c ON c.id = i.customer_id")
            .where_eq("c.code", "C1");
        let stmt = build_count(dialect(DatabaseType::Postgresql), &request).unwrap();
        assert_eq!(
            stmt.sql,
            "SELECT CAST(COUNT(*) AS BIGINT) AS s___total_rows, sum(i.amount) as total_amount FROM invoice i JOIN customer c ON c.id = i.customer_id WHERE c.code = :c_code"
        );
    }

    #[test]
    fn test_count_subquery() {
        let request = CountRequest::new("SELECT code FROM area GROUP BY code");
        let stmt = build_count(dialect(DatabaseType::Postgresql), &request).unwrap();
        assert!(stmt
            .sql
            .starts_with("SELECT CAST(COUNT(*) AS BIGINT) AS s___total_rows FROM (SELECT code FROM area GROUP BY code) AS subquery__sq_"));

        let stmt = build_count(dialect(DatabaseType::Oracle), &request).unwrap();
        assert!(stmt.sql.contains(") subquery__sq_"));

        let request = request.where_eq("code", "A1");
        assert!(build_count(dialect(DatabaseType::Postgresql), &request).is_err());
    }

    #[test]
    fn test_total_pages() {
        for n in [0, 1, 10000] {
            assert_eq!(total_pages(n, 0), 1);
        }
        assert_eq!(total_pages(95, 10), 10);
        assert_eq!(total_pages(100, 10), 10);
        assert_eq!(total_pages(101, 10), 11);
        assert_eq!(total_pages(0, 10), 1);
    }

    #[test]
    fn test_count_result_from_row() {
        let row = crate::db::value::kv([
            (TOTAL_ROWS_FIELD, SqlValue::Decimal("42".into())),
            ("total_amount", SqlValue::Float(12.5)),
        ]);
        let count = CountResult::from_row(row).unwrap();
        assert_eq!(count.total_rows, 42);
        assert_eq!(count.summary["total_amount"], SqlValue::Float(12.5));

        assert_eq!(CountResult::from_row(Row::new()).unwrap().total_rows, 0);
        let bad = crate::db::value::kv([(TOTAL_ROWS_FIELD, "many")]);
        assert!(CountResult::from_row(bad).is_err());
    }

    #[test]
    fn test_paging_statements() {
        let request = PagingRequest {
            fields: Some("id, code".to_string()),
            from: "area".to_string(),
            where_clause: Some("code like :q".to_string()),
            order_by: Some("code".to_string()),
            args: crate::db::value::kv([("q", "A%")]),
            rows_per_page: 10,
            page_index: 2,
            ..Default::default()
        };
        let paging = build_paging(dialect(DatabaseType::Postgresql), &request).unwrap();
        assert_eq!(
            paging.count.sql,
            "SELECT CAST(COUNT(*) AS BIGINT) AS s___total_rows FROM area WHERE code like :q"
        );
        assert_eq!(
            paging.rows.sql,
            "SELECT id, code FROM area WHERE code like :q ORDER BY code LIMIT 10 OFFSET 20"
        );

        let request = PagingRequest {
            order_by: None,
            ..request
        };
        let paging = build_paging(dialect(DatabaseType::Sqlserver), &request).unwrap();
        assert!(paging
            .rows
            .sql
            .ends_with("ORDER BY 1 OFFSET 20 ROWS FETCH NEXT 10 ROWS ONLY"));
    }
}
