// INSERT, UPDATE and DELETE statements

use super::parts::{sql_part_insert, sql_part_set, sql_part_table, sql_part_where};
use super::{add_arg, NamedStatement};
use crate::db::dialect::{Dialect, ReturningClause, ReturningMode};
use crate::db::sqlchecker::check_identifier;
use crate::db::traits::DatabaseError;
use crate::db::value::KeyValues;

#[derive(Debug, Clone, PartialEq)]
pub struct InsertStatement {
    pub statement: NamedStatement,
    pub mode: ReturningMode,
    pub id_field: String,
}

/// UPDATE/DELETE, flagged when it produces rows through OUTPUT/RETURNING
#[derive(Debug, Clone, PartialEq)]
pub struct WriteStatement {
    pub statement: NamedStatement,
    pub returns_rows: bool,
}

pub fn build_insert(
    dialect: &dyn Dialect,
    table: &str,
    id_field: &str,
    values: &KeyValues,
) -> Result<InsertStatement, DatabaseError> {
    if values.is_empty() {
        return Err(DatabaseError::InvalidRequest(format!(
            "INSERT into {} without values",
            table
        )));
    }
    check_identifier(dialect, table)?;
    check_identifier(dialect, id_field)?;
    let table = dialect.format_identifier(table);
    let id_field = dialect.format_identifier(id_field);
    let (fields, markers, args) = sql_part_insert(dialect, values)?;
    let (sql, mode) = dialect.returning_insert(&table, &fields, &markers, &id_field);
    let mut statement = NamedStatement::new(sql, args);
    if let ReturningMode::OutParam { bind_name } = &mode {
        statement.out_params.push(bind_name.clone());
    }
    Ok(InsertStatement {
        statement,
        mode,
        id_field,
    })
}

fn returning_fields(dialect: &dyn Dialect, returning: &[String]) -> Result<Vec<String>, DatabaseError> {
    returning
        .iter()
        .map(|f| {
            check_identifier(dialect, f)?;
            Ok(dialect.format_identifier(f))
        })
        .collect()
}

fn place_returning(sql: &mut String, where_sql: &str, clause: Option<ReturningClause>) {
    if let Some(ReturningClause::Output(output)) = &clause {
        sql.push_str(" OUTPUT ");
        sql.push_str(output);
    }
    if !where_sql.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(where_sql);
    }
    if let Some(ReturningClause::Returning(returning)) = &clause {
        sql.push_str(" RETURNING ");
        sql.push_str(returning);
    }
}

pub fn build_update(
    dialect: &dyn Dialect,
    table: &str,
    set: &KeyValues,
    where_kv: &KeyValues,
    returning: &[String],
) -> Result<WriteStatement, DatabaseError> {
    if set.is_empty() {
        return Err(DatabaseError::InvalidRequest(format!(
            "UPDATE of {} without SET values",
            table
        )));
    }
    let table = sql_part_table(dialect, table)?;
    let (set_sql, mut args) = sql_part_set(dialect, set)?;
    let (where_sql, where_args) = sql_part_where(dialect, where_kv)?;
    for (name, value) in where_args {
        add_arg(&mut args, name, value)?;
    }

    let clause = if returning.is_empty() {
        None
    } else {
        Some(dialect.output_clause_update(&returning_fields(dialect, returning)?)?)
    };
    let returns_rows = clause.is_some();
    let mut sql = format!("UPDATE {} SET {}", table, set_sql);
    place_returning(&mut sql, &where_sql, clause);
    Ok(WriteStatement {
        statement: NamedStatement::new(sql, args),
        returns_rows,
    })
}

pub fn build_delete(
    dialect: &dyn Dialect,
    table: &str,
    where_kv: &KeyValues,
    returning: &[String],
) -> Result<WriteStatement, DatabaseError> {
    if where_kv.is_empty() {
        return Err(DatabaseError::InvalidRequest(
            "DELETE without WHERE clause is not allowed".to_string(),
        ));
    }
    let table = sql_part_table(dialect, table)?;
    let (where_sql, args) = sql_part_where(dialect, where_kv)?;
    let clause = if returning.is_empty() {
        None
    } else {
        Some(dialect.output_clause_delete(&returning_fields(dialect, returning)?)?)
    };
    let returns_rows = clause.is_some();
    let mut sql = format!("DELETE FROM {}", table);
    place_returning(&mut sql, &where_sql, clause);
    Ok(WriteStatement {
        statement: NamedStatement::new(sql, args),
        returns_rows,
    })
}
