// SQL Scripts
// Splits script files into statements and runs ordered file lists

use crate::db::database::DxDatabase;
use crate::db::traits::DatabaseError;
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Normal,
    SingleQuote,
    DoubleQuote,
    /// `$tag$ .. $tag$` body, tag stored alongside
    DollarQuote,
    LineComment,
    BlockComment,
}

/// `GO` (SQL Server) and `/` (Oracle) lines end a batch
fn is_batch_separator(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.eq_ignore_ascii_case("go") || trimmed == "/"
}

fn dollar_tag(chars: &[char], start: usize) -> Option<String> {
    let mut end = start + 1;
    while end < chars.len() && (chars[end].is_ascii_alphanumeric() || chars[end] == '_') {
        end += 1;
    }
    if chars.get(end) == Some(&'$') {
        Some(chars[start..=end].iter().collect())
    } else {
        None
    }
}

/// Comment-only chunks are dropped
fn push_statement(statements: &mut Vec<String>, current: &mut String, has_code: &mut bool) {
    let statement = current.trim();
    if *has_code && statement != ";" {
        statements.push(statement.to_string());
    }
    current.clear();
    *has_code = false;
}

/// Split script text on `;` and batch separator lines.
///
/// Terminators inside quoted literals, quoted identifiers, dollar-quoted
/// bodies and comments are ignored. Statements keep their trailing `;`.
pub fn split_sql_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut state = State::Normal;
    let mut tag = String::new();
    let mut has_code = false;

    for line in sql.lines() {
        if state == State::Normal && is_batch_separator(line) {
            push_statement(&mut statements, &mut current, &mut has_code);
            continue;
        }

        let chars: Vec<char> = line.chars().collect();
        let mut i = 0;
        while i < chars.len() {
            let ch = chars[i];
            let next = chars.get(i + 1).copied();
            match state {
                State::Normal => match ch {
                    '\'' => state = State::SingleQuote,
                    '"' => state = State::DoubleQuote,
                    '-' if next == Some('-') => state = State::LineComment,
                    '/' if next == Some('*') => {
                        current.push_str("/*");
                        state = State::BlockComment;
                        i += 2;
                        continue;
                    }
                    '$' => {
                        if let Some(found) = dollar_tag(&chars, i) {
                            current.push_str(&found);
                            has_code = true;
                            i += found.chars().count();
                            tag = found;
                            state = State::DollarQuote;
                            continue;
                        }
                    }
                    ';' => {
                        current.push(';');
                        push_statement(&mut statements, &mut current, &mut has_code);
                        i += 1;
                        continue;
                    }
                    _ => {}
                },
                // doubled quotes toggle twice and stay inside the literal
                State::SingleQuote if ch == '\'' => state = State::Normal,
                State::DoubleQuote if ch == '"' => state = State::Normal,
                State::BlockComment if ch == '*' && next == Some('/') => {
                    current.push_str("*/");
                    state = State::Normal;
                    i += 2;
                    continue;
                }
                State::DollarQuote if ch == '$' => {
                    let rest: String = chars[i..].iter().collect();
                    if rest.starts_with(&tag) {
                        current.push_str(&tag);
                        i += tag.chars().count();
                        state = State::Normal;
                        continue;
                    }
                }
                _ => {}
            }
            if !ch.is_whitespace() && !matches!(state, State::LineComment | State::BlockComment) {
                has_code = true;
            }
            current.push(ch);
            i += 1;
        }

        if state == State::LineComment {
            state = State::Normal;
        }
        current.push('\n');
    }

    push_statement(&mut statements, &mut current, &mut has_code);
    statements
}

/// Named, ordered list of script files run against one database
#[derive(Debug, Clone)]
pub struct DxDatabaseScript {
    pub name_id: String,
    pub files: Vec<PathBuf>,
}

impl DxDatabaseScript {
    pub fn new<I, P>(name_id: impl Into<String>, files: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            name_id: name_id.into(),
            files: files.into_iter().map(Into::into).collect(),
        }
    }

    /// Execute every file in order, stopping at the first failure.
    /// Returns the statement count of each executed file.
    pub async fn execute(&self, database: &DxDatabase) -> Result<Vec<usize>, DatabaseError> {
        database.ensure_connection().await?;
        let mut executed = Vec::with_capacity(self.files.len());
        for (index, file) in self.files.iter().enumerate() {
            match database.execute_file(file).await {
                Ok(count) => executed.push(count),
                Err(e) => {
                    error!(
                        script = %self.name_id,
                        database = %database.name_id(),
                        file = %file.display(),
                        index,
                        error = %e,
                        "Error executing script file"
                    );
                    return Err(e);
                }
            }
        }
        info!(script = %self.name_id, files = executed.len(), "Script executed");
        Ok(executed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::database::tests::{mock_registry, section};
    use std::io::Write;

    #[test]
    fn test_split_on_semicolons() {
        let statements = split_sql_statements("CREATE TABLE a (id int);\n\nINSERT INTO a VALUES (1);");
        assert_eq!(
            statements,
            vec!["CREATE TABLE a (id int);", "INSERT INTO a VALUES (1);"]
        );
    }

    #[test]
    fn test_split_ignores_quoted_terminators() {
        let sql = "INSERT INTO a VALUES ('x;y', 'it''s');\nSELECT \"odd;name\" FROM a;";
        let statements = split_sql_statements(sql);
        assert_eq!(statements.len(), 2);
        assert_eq!(statements[0], "INSERT INTO a VALUES ('x;y', 'it''s');");
    }

    #[test]
    fn test_split_comments() {
        let sql = "-- setup; not a statement\nCREATE TABLE a (id int); /* trailing; */\nDROP TABLE b;";
        let statements = split_sql_statements(sql);
        assert_eq!(statements.len(), 2);
        assert!(statements[0].starts_with("-- setup; not a statement"));
        assert_eq!(statements[1], "/* trailing; */\nDROP TABLE b;");
    }

    #[test]
    fn test_split_dollar_quoted_body() {
        let sql = "CREATE FUNCTION f() RETURNS int AS $body$\nBEGIN\n  RETURN 1;\nEND;\n$body$ LANGUAGE plpgsql;\nSELECT f();";
        let statements = split_sql_statements(sql);
        assert_eq!(statements.len(), 2);
        assert!(statements[0].contains("RETURN 1;"));
        assert!(statements[0].ends_with("LANGUAGE plpgsql;"));
        assert_eq!(statements[1], "SELECT f();");
    }

    #[test]
    fn test_split_go_batches() {
        let sql = "CREATE PROCEDURE p AS\nBEGIN\n  SELECT 1\nEND\nGO\nEXEC p\ngo\n";
        let statements = split_sql_statements(sql);
        assert_eq!(statements.len(), 2);
        assert!(statements[0].starts_with("CREATE PROCEDURE p AS"));
        assert_eq!(statements[1], "EXEC p");
    }

    #[test]
    fn test_split_empty() {
        assert!(split_sql_statements("  \n;\n-- nothing\n/* still nothing; */").is_empty());
        assert!(split_sql_statements("").is_empty());
    }

    #[tokio::test]
    async fn test_script_runs_files_in_order() {
        let (registry, state) = mock_registry().await;
        let database = DxDatabase::new("main", registry, false, false);
        database.apply_section(&section()).await.unwrap();

        let mut first = tempfile::NamedTempFile::new().unwrap();
        writeln!(first, "CREATE TABLE a (id int);").unwrap();
        let mut second = tempfile::NamedTempFile::new().unwrap();
        writeln!(second, "CREATE TABLE b (id int);\nCREATE TABLE c (id int);").unwrap();

        let script = DxDatabaseScript::new("schema", [first.path(), second.path()]);
        assert_eq!(script.execute(&database).await.unwrap(), vec![1, 2]);
        assert_eq!(
            state.batches.lock().unwrap().first().map(String::as_str),
            Some("CREATE TABLE a (id int);")
        );
    }
}
