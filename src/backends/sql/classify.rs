//! SQL error classification.
//!
//! Pure per-dialect tables plus the `sqlx::Error` dispatcher. Sub-codes that
//! are more specific than their class (serialization failure and deadlock
//! inside class 40) are checked before the class.

use crate::error::{Classify, Error, ErrorKind};

/// Classify a PostgreSQL-style SQLSTATE.
pub fn classify_sqlstate(sqlstate: &str) -> ErrorKind {
    match sqlstate {
        "40001" => return ErrorKind::SerializationConflict,
        "40P01" => return ErrorKind::Deadlock,
        "42501" => return ErrorKind::PermissionDenied,
        "42P01" => return ErrorKind::NotFound,
        "57014" => return ErrorKind::Cancelled,
        "3D000" | "3F000" => return ErrorKind::NotFound,
        _ => {}
    }

    match sqlstate.get(..2) {
        Some("40") => ErrorKind::SerializationConflict,
        Some("23") => ErrorKind::ConstraintViolation,
        Some("42") | Some("22") => ErrorKind::QuerySyntax,
        Some("28") => ErrorKind::Unauthenticated,
        Some("08") => ErrorKind::Connection,
        Some("53") => ErrorKind::ResourceExhausted,
        Some("57") => ErrorKind::Unavailable,
        Some("XX") | Some("58") => ErrorKind::Internal,
        _ => ErrorKind::Unknown,
    }
}

/// Classify a MySQL/MariaDB server or client error number.
pub fn classify_mysql_errno(errno: u16) -> ErrorKind {
    match errno {
        1062 | 1451 | 1452 | 1048 | 3819 => ErrorKind::ConstraintViolation,
        1213 => ErrorKind::Deadlock,
        // Lock wait timeout: the server gave up on this participant.
        1205 => ErrorKind::Deadlock,
        1064 | 1054 => ErrorKind::QuerySyntax,
        1146 | 1049 => ErrorKind::NotFound,
        1045 => ErrorKind::Unauthenticated,
        1044 | 1142 | 1143 => ErrorKind::PermissionDenied,
        1040 => ErrorKind::ResourceExhausted,
        2002 | 2003 | 2006 | 2013 => ErrorKind::Connection,
        1317 => ErrorKind::Cancelled,
        // max_execution_time exceeded on the server, not the caller's timer.
        3024 => ErrorKind::Timeout,
        _ => ErrorKind::Unknown,
    }
}

/// Classify an SQLite result code; extended codes reduce to their primary.
pub fn classify_sqlite_code(code: i32) -> ErrorKind {
    match code & 0xff {
        5 => ErrorKind::SerializationConflict, // SQLITE_BUSY
        6 => ErrorKind::Deadlock,              // SQLITE_LOCKED
        19 => ErrorKind::ConstraintViolation,
        1 => ErrorKind::QuerySyntax,
        3 | 8 => ErrorKind::PermissionDenied, // PERM, READONLY
        23 => ErrorKind::Unauthenticated,     // AUTH
        7 | 13 => ErrorKind::ResourceExhausted, // NOMEM, FULL
        14 => ErrorKind::Connection,          // CANTOPEN
        9 => ErrorKind::Cancelled,            // INTERRUPT
        11 | 2 => ErrorKind::Internal,        // CORRUPT, INTERNAL
        12 => ErrorKind::NotFound,            // NOTFOUND
        _ => ErrorKind::Unknown,
    }
}

/// Refine a generic SQLite error (code 1) by its message.
fn refine_sqlite_message(kind: ErrorKind, message: &str) -> ErrorKind {
    if kind == ErrorKind::QuerySyntax && message.starts_with("no such table") {
        ErrorKind::NotFound
    } else {
        kind
    }
}

fn classify_database(db: &(dyn sqlx::error::DatabaseError + 'static)) -> (ErrorKind, Option<String>) {
    #[cfg(feature = "mysql")]
    if let Some(mysql) = db.try_downcast_ref::<sqlx::mysql::MySqlDatabaseError>() {
        let errno = mysql.number();
        return (classify_mysql_errno(errno), Some(errno.to_string()));
    }

    let code = db.code().map(|code| code.into_owned());

    #[cfg(feature = "sqlite")]
    if db.try_downcast_ref::<sqlx::sqlite::SqliteError>().is_some() {
        let kind = code
            .as_deref()
            .and_then(|code| code.parse::<i32>().ok())
            .map(classify_sqlite_code)
            .unwrap_or(ErrorKind::Unknown);
        return (refine_sqlite_message(kind, db.message()), code);
    }

    let kind = match code.as_deref() {
        Some(sqlstate) => classify_sqlstate(sqlstate),
        None => ErrorKind::Unknown,
    };
    let kind = match (kind, db.kind()) {
        (ErrorKind::Unknown, sqlx::error::ErrorKind::UniqueViolation)
        | (ErrorKind::Unknown, sqlx::error::ErrorKind::ForeignKeyViolation)
        | (ErrorKind::Unknown, sqlx::error::ErrorKind::NotNullViolation)
        | (ErrorKind::Unknown, sqlx::error::ErrorKind::CheckViolation) => {
            ErrorKind::ConstraintViolation
        }
        (kind, _) => kind,
    };
    (kind, code)
}

impl Classify for sqlx::Error {
    fn classify(self) -> Error {
        let message = self.to_string();
        match &self {
            sqlx::Error::Database(db) => {
                let (kind, code) = classify_database(db.as_ref());
                let constraint = db.constraint().map(str::to_string);
                let mut error = Error::new(kind, db.message().to_string());
                if let Some(code) = code {
                    error = error.with_code(code);
                }
                if let Some(constraint) = constraint {
                    error = error.with_constraint(constraint);
                }
                error.with_cause(self)
            }
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Configuration(_) => {
                Error::new(ErrorKind::Connection, message).with_cause(self)
            }
            sqlx::Error::PoolTimedOut => {
                Error::new(ErrorKind::ResourceExhausted, message).with_cause(self)
            }
            sqlx::Error::RowNotFound
            | sqlx::Error::ColumnNotFound(_)
            | sqlx::Error::TypeNotFound { .. } => {
                Error::new(ErrorKind::NotFound, message).with_cause(self)
            }
            sqlx::Error::ColumnIndexOutOfBounds { .. }
            | sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::Decode(_)
            | sqlx::Error::Protocol(_) => {
                Error::new(ErrorKind::Internal, message).with_cause(self)
            }
            _ => Error::new(ErrorKind::Unknown, message).with_cause(self),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlstate_specific_codes_win_over_class() {
        assert_eq!(classify_sqlstate("40001"), ErrorKind::SerializationConflict);
        assert_eq!(classify_sqlstate("40P01"), ErrorKind::Deadlock);
        assert_eq!(classify_sqlstate("40002"), ErrorKind::SerializationConflict);
        assert_eq!(classify_sqlstate("42501"), ErrorKind::PermissionDenied);
        assert_eq!(classify_sqlstate("42P01"), ErrorKind::NotFound);
        assert_eq!(classify_sqlstate("42601"), ErrorKind::QuerySyntax);
    }

    #[test]
    fn test_sqlstate_classes() {
        assert_eq!(classify_sqlstate("23505"), ErrorKind::ConstraintViolation);
        assert_eq!(classify_sqlstate("23503"), ErrorKind::ConstraintViolation);
        assert_eq!(classify_sqlstate("22P02"), ErrorKind::QuerySyntax);
        assert_eq!(classify_sqlstate("28P01"), ErrorKind::Unauthenticated);
        assert_eq!(classify_sqlstate("08006"), ErrorKind::Connection);
        assert_eq!(classify_sqlstate("53300"), ErrorKind::ResourceExhausted);
        assert_eq!(classify_sqlstate("57014"), ErrorKind::Cancelled);
        assert_eq!(classify_sqlstate("57P01"), ErrorKind::Unavailable);
        assert_eq!(classify_sqlstate("3D000"), ErrorKind::NotFound);
        assert_eq!(classify_sqlstate("XX000"), ErrorKind::Internal);
    }

    #[test]
    fn test_sqlstate_unknown_is_total() {
        assert_eq!(classify_sqlstate("HY000"), ErrorKind::Unknown);
        assert_eq!(classify_sqlstate(""), ErrorKind::Unknown);
        assert_eq!(classify_sqlstate("4"), ErrorKind::Unknown);
        assert_eq!(classify_sqlstate("ééé"), ErrorKind::Unknown);
    }

    #[test]
    fn test_mysql_errno() {
        assert_eq!(classify_mysql_errno(1062), ErrorKind::ConstraintViolation);
        assert_eq!(classify_mysql_errno(1213), ErrorKind::Deadlock);
        assert_eq!(classify_mysql_errno(1064), ErrorKind::QuerySyntax);
        assert_eq!(classify_mysql_errno(1146), ErrorKind::NotFound);
        assert_eq!(classify_mysql_errno(1045), ErrorKind::Unauthenticated);
        assert_eq!(classify_mysql_errno(1142), ErrorKind::PermissionDenied);
        assert_eq!(classify_mysql_errno(1040), ErrorKind::ResourceExhausted);
        assert_eq!(classify_mysql_errno(2013), ErrorKind::Connection);
        assert_eq!(classify_mysql_errno(3024), ErrorKind::Timeout);
        assert_eq!(classify_mysql_errno(9999), ErrorKind::Unknown);
    }

    #[test]
    fn test_sqlite_extended_codes_reduce_to_primary() {
        // SQLITE_CONSTRAINT_UNIQUE = 2067, SQLITE_CONSTRAINT_FOREIGNKEY = 787
        assert_eq!(classify_sqlite_code(2067), ErrorKind::ConstraintViolation);
        assert_eq!(classify_sqlite_code(787), ErrorKind::ConstraintViolation);
        // SQLITE_BUSY_SNAPSHOT = 517
        assert_eq!(classify_sqlite_code(517), ErrorKind::SerializationConflict);
        assert_eq!(classify_sqlite_code(1), ErrorKind::QuerySyntax);
        assert_eq!(classify_sqlite_code(14), ErrorKind::Connection);
        assert_eq!(classify_sqlite_code(100), ErrorKind::Unknown);
    }

    #[test]
    fn test_sqlite_missing_table_is_not_found() {
        assert_eq!(
            refine_sqlite_message(ErrorKind::QuerySyntax, "no such table: users"),
            ErrorKind::NotFound
        );
        assert_eq!(
            refine_sqlite_message(ErrorKind::QuerySyntax, "near \"SELEC\": syntax error"),
            ErrorKind::QuerySyntax
        );
    }

    #[test]
    fn test_driver_level_errors() {
        assert_eq!(sqlx::Error::PoolTimedOut.classify().kind(), ErrorKind::ResourceExhausted);
        assert_eq!(sqlx::Error::PoolClosed.classify().kind(), ErrorKind::Connection);
        assert_eq!(sqlx::Error::RowNotFound.classify().kind(), ErrorKind::NotFound);
        assert_eq!(
            sqlx::Error::Protocol("bad packet".into()).classify().kind(),
            ErrorKind::Internal
        );

        let io = sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ));
        let err = io.classify();
        assert_eq!(err.kind(), ErrorKind::Connection);
        assert!(err.cause().is_some());
    }
}
