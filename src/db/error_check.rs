// Database Error Classification
// Maps engine specific failures onto connection-loss / duplicate-key / other

use crate::db::dialect::DatabaseType;
use crate::db::traits::{DatabaseError, DriverError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    ConnectionLost,
    DuplicateKey,
    Other,
}

const MYSQL_CONNECTION_CODES: &[&str] = &[
    "1040", "1042", "1043", "1047", "1053", "1077", "1129", "1130", "2002", "2003", "2005",
    "2006", "2013",
];

const MSSQL_CONNECTION_CODES: &[&str] = &["53", "233", "10053", "10054", "10060", "10061", "-2"];

const ORACLE_CONNECTION_CODES: &[&str] = &[
    "ORA-03113", "ORA-03114", "ORA-03135", "ORA-12541", "ORA-12170", "ORA-12224", "ORA-12543",
    "ORA-12571",
];

const CONNECTION_PHRASES: &[&str] = &[
    "connection refused",
    "connection reset",
    "connection closed",
    "connection timed out",
    "broken pipe",
    "bad connection",
    "driver: bad connection",
    "no connection",
    "server closed the connection",
    "network is unreachable",
    "i/o timeout",
    "timeout expired",
    "unexpected eof",
    "lost connection",
    "gone away",
    "communication link failure",
    "end-of-file on communication channel",
    "error communicating with the server",
    "error connecting to server",
];

const DUPLICATE_PHRASES: &[&str] = &[
    "duplicate key",
    "duplicate entry",
    "unique constraint",
    "violation of primary key",
    "violation of unique key",
    "cannot insert duplicate key",
];

fn code_in(error: &DriverError, codes: &[&str]) -> bool {
    error
        .code
        .as_deref()
        .is_some_and(|code| codes.iter().any(|c| c.eq_ignore_ascii_case(code)))
}

/// Engines that report a SQLSTATE or vendor code are judged on it alone
fn has_typed_code(error: &DriverError) -> bool {
    error.code.is_some() || error.sql_state.is_some()
}

fn is_connection_driver_error(error: &DriverError) -> bool {
    if error.connection_lost {
        return true;
    }
    let by_code = match error.database_type {
        DatabaseType::Postgresql => error
            .sql_state
            .as_deref()
            .is_some_and(|state| state.starts_with("08") || matches!(state, "57P01" | "57P02" | "57P03")),
        DatabaseType::Mysql | DatabaseType::Mariadb => code_in(error, MYSQL_CONNECTION_CODES),
        DatabaseType::Sqlserver => code_in(error, MSSQL_CONNECTION_CODES),
        DatabaseType::Oracle => code_in(error, ORACLE_CONNECTION_CODES),
        DatabaseType::Unknown => false,
    };
    if has_typed_code(error) {
        return by_code;
    }
    contains_any(&error.message, CONNECTION_PHRASES)
}

fn is_duplicate_driver_error(error: &DriverError) -> bool {
    let by_code = match error.database_type {
        DatabaseType::Postgresql => error.sql_state.as_deref() == Some("23505"),
        DatabaseType::Mysql | DatabaseType::Mariadb => code_in(error, &["1062"]),
        DatabaseType::Sqlserver => code_in(error, &["2627", "2601"]),
        DatabaseType::Oracle => code_in(error, &["ORA-00001"]),
        DatabaseType::Unknown => false,
    };
    if has_typed_code(error) {
        return by_code;
    }
    contains_any(&error.message, DUPLICATE_PHRASES)
}

fn contains_any(message: &str, phrases: &[&str]) -> bool {
    let lowered = message.to_lowercase();
    phrases.iter().any(|p| lowered.contains(p))
}

pub fn classify(error: &DatabaseError) -> ErrorClass {
    match error {
        DatabaseError::NotConnected(_)
        | DatabaseError::ConnectionFailed(_)
        | DatabaseError::PoolError(_)
        | DatabaseError::Timeout
        | DatabaseError::IoError(_) => ErrorClass::ConnectionLost,
        DatabaseError::DuplicateKey(_) => ErrorClass::DuplicateKey,
        DatabaseError::Driver(driver) => {
            // duplicate first: "duplicate key" messages never mean a dead link
            if is_duplicate_driver_error(driver) {
                ErrorClass::DuplicateKey
            } else if is_connection_driver_error(driver) {
                ErrorClass::ConnectionLost
            } else {
                ErrorClass::Other
            }
        }
        DatabaseError::QueryError(message) => {
            if contains_any(message, DUPLICATE_PHRASES) {
                ErrorClass::DuplicateKey
            } else if contains_any(message, CONNECTION_PHRASES) {
                ErrorClass::ConnectionLost
            } else {
                ErrorClass::Other
            }
        }
        DatabaseError::Context { source, .. } => classify(source),
        _ => ErrorClass::Other,
    }
}

pub fn is_connection_error(error: &DatabaseError) -> bool {
    classify(error) == ErrorClass::ConnectionLost
}

pub fn is_duplicate_key_error(error: &DatabaseError) -> bool {
    classify(error) == ErrorClass::DuplicateKey
}

/// Normalise a driver failure into `NotConnected` / `DuplicateKey`; other errors pass through.
pub fn check_database_error(error: DatabaseError) -> DatabaseError {
    match classify(&error) {
        ErrorClass::ConnectionLost if !matches!(error, DatabaseError::NotConnected(_)) => {
            DatabaseError::NotConnected(error.to_string())
        }
        ErrorClass::DuplicateKey if !matches!(error, DatabaseError::DuplicateKey(_)) => {
            DatabaseError::DuplicateKey(error.to_string())
        }
        _ => error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver(db: DatabaseType, code: Option<&str>, state: Option<&str>, message: &str) -> DatabaseError {
        let mut e = DriverError::new(db, message);
        e.code = code.map(String::from);
        e.sql_state = state.map(String::from);
        DatabaseError::Driver(e)
    }

    #[test]
    fn test_duplicate_codes() {
        assert_eq!(
            classify(&driver(DatabaseType::Postgresql, None, Some("23505"), "x")),
            ErrorClass::DuplicateKey
        );
        assert_eq!(
            classify(&driver(DatabaseType::Mysql, Some("1062"), Some("23000"), "x")),
            ErrorClass::DuplicateKey
        );
        assert_eq!(
            classify(&driver(DatabaseType::Sqlserver, Some("2601"), None, "x")),
            ErrorClass::DuplicateKey
        );
        assert_eq!(
            classify(&driver(DatabaseType::Oracle, Some("ORA-00001"), None, "x")),
            ErrorClass::DuplicateKey
        );
        assert_eq!(
            classify(&driver(DatabaseType::Sqlserver, None, None, "Violation of PRIMARY KEY constraint")),
            ErrorClass::DuplicateKey
        );
    }

    #[test]
    fn test_connection_codes() {
        assert_eq!(
            classify(&driver(DatabaseType::Postgresql, None, Some("08006"), "x")),
            ErrorClass::ConnectionLost
        );
        assert_eq!(
            classify(&driver(DatabaseType::Postgresql, None, Some("57P01"), "x")),
            ErrorClass::ConnectionLost
        );
        assert_eq!(
            classify(&driver(DatabaseType::Mariadb, Some("2006"), None, "x")),
            ErrorClass::ConnectionLost
        );
        assert_eq!(
            classify(&driver(DatabaseType::Sqlserver, Some("10054"), None, "x")),
            ErrorClass::ConnectionLost
        );
        assert_eq!(
            classify(&driver(DatabaseType::Oracle, Some("ORA-03113"), None, "x")),
            ErrorClass::ConnectionLost
        );
        assert_eq!(
            classify(&driver(DatabaseType::Postgresql, None, None, "write: broken pipe")),
            ErrorClass::ConnectionLost
        );
        let lost = DatabaseError::Driver(DriverError::new(DatabaseType::Mysql, "x").connection_lost());
        assert!(is_connection_error(&lost));
    }

    #[test]
    fn test_other_errors() {
        assert_eq!(
            classify(&driver(DatabaseType::Postgresql, None, Some("42P01"), "relation does not exist")),
            ErrorClass::Other
        );
        assert_eq!(
            classify(&DatabaseError::injection("QUERY_VALIDATION_FAILED", "x")),
            ErrorClass::Other
        );
    }

    #[test]
    fn test_typed_codes_win_over_message_phrases() {
        assert_eq!(
            classify(&driver(
                DatabaseType::Postgresql,
                None,
                Some("57014"),
                "canceling statement due to statement timeout"
            )),
            ErrorClass::Other
        );
        assert_eq!(
            classify(&driver(
                DatabaseType::Mysql,
                Some("1205"),
                Some("HY000"),
                "Lock wait timeout exceeded; try restarting transaction"
            )),
            ErrorClass::Other
        );
        assert_eq!(
            classify(&driver(
                DatabaseType::Postgresql,
                None,
                Some("23514"),
                "new row for relation \"device\" violates check constraint \"socket_type_chk\""
            )),
            ErrorClass::Other
        );
        assert_eq!(
            classify(&driver(
                DatabaseType::Sqlserver,
                Some("547"),
                None,
                "The INSERT statement conflicted with the CHECK constraint \"unique constraint_chk\""
            )),
            ErrorClass::Other
        );
    }

    #[test]
    fn test_untyped_messages_use_narrow_phrases() {
        assert_eq!(
            classify(&driver(DatabaseType::Mysql, None, None, "read tcp: i/o timeout")),
            ErrorClass::ConnectionLost
        );
        assert_eq!(
            classify(&driver(DatabaseType::Sqlserver, None, None, "Timeout expired")),
            ErrorClass::ConnectionLost
        );
        assert_eq!(
            classify(&driver(DatabaseType::Postgresql, None, None, "statement timeout")),
            ErrorClass::Other
        );
        assert_eq!(
            classify(&DatabaseError::QueryError("invalid socket_type value".into())),
            ErrorClass::Other
        );
    }

    #[test]
    fn test_check_database_error_normalises() {
        let err = check_database_error(driver(DatabaseType::Postgresql, None, Some("08003"), "gone"));
        assert!(matches!(err, DatabaseError::NotConnected(_)));
        assert!(err.to_string().starts_with("ERROR_DB_NOT_CONNECTED"));

        let err = check_database_error(driver(DatabaseType::Mysql, Some("1062"), None, "dup"));
        assert!(matches!(err, DatabaseError::DuplicateKey(_)));

        let err = check_database_error(DatabaseError::InvalidRequest("x".into()));
        assert!(matches!(err, DatabaseError::InvalidRequest(_)));
    }

    #[test]
    fn test_classify_sees_through_context() {
        let err = DatabaseError::Timeout.context("select", "area");
        assert!(is_connection_error(&err));
    }
}
