//! Statements handed to the driver layer and the results it returns

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{Datum, Row};

/// Row filter for reads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Filter {
    /// Every row of the table
    All,
    /// Rows whose column equals the value
    Eq { column: String, value: Datum },
}

impl Filter {
    pub fn eq<S: Into<String>>(column: S, value: Datum) -> Self {
        Self::Eq { column: column.into(), value }
    }

    /// Check whether a row passes the filter
    pub fn matches(&self, row: &Row) -> bool {
        match self {
            Filter::All => true,
            Filter::Eq { column, value } => row.get(column) == Some(value),
        }
    }
}

/// A statement executed against a single physical connection
///
/// Record-level statements are structured so that the driver owns the
/// translation into its native dialect; `Raw` carries opaque text such as
/// schema changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Statement {
    Select {
        table: String,
        filter: Filter,
    },
    Insert {
        table: String,
        key_column: String,
        row: Row,
    },
    Update {
        table: String,
        key_column: String,
        key: Datum,
        row: Row,
    },
    Delete {
        table: String,
        key_column: String,
        key: Datum,
    },
    Begin,
    Commit,
    Rollback,
    Raw(String),
}

impl Statement {
    pub fn raw<S: Into<String>>(text: S) -> Self {
        Self::Raw(text.into())
    }

    /// Short label used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            Statement::Select { .. } => "select",
            Statement::Insert { .. } => "insert",
            Statement::Update { .. } => "update",
            Statement::Delete { .. } => "delete",
            Statement::Begin => "begin",
            Statement::Commit => "commit",
            Statement::Rollback => "rollback",
            Statement::Raw(_) => "raw",
        }
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Statement::Select { table, filter: Filter::All } => write!(f, "SELECT * FROM {}", table),
            Statement::Select { table, filter: Filter::Eq { column, value } } => {
                write!(f, "SELECT * FROM {} WHERE {} = {}", table, column, value)
            }
            Statement::Insert { table, row, .. } => {
                write!(f, "INSERT INTO {} ({} columns)", table, row.len())
            }
            Statement::Update { table, key_column, key, .. } => {
                write!(f, "UPDATE {} WHERE {} = {}", table, key_column, key)
            }
            Statement::Delete { table, key_column, key } => {
                write!(f, "DELETE FROM {} WHERE {} = {}", table, key_column, key)
            }
            Statement::Begin => write!(f, "BEGIN"),
            Statement::Commit => write!(f, "COMMIT"),
            Statement::Rollback => write!(f, "ROLLBACK"),
            Statement::Raw(text) => f.write_str(text),
        }
    }
}

/// Result of executing a statement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryResult {
    /// Rows returned by a read
    Rows(Vec<Row>),
    /// A row was inserted under the given key
    Inserted { key: Datum },
    /// Number of rows changed by a write
    Affected(u64),
    /// Statement accepted without a row-level result
    Ack,
}

impl QueryResult {
    pub fn into_rows(self) -> Vec<Row> {
        match self {
            QueryResult::Rows(rows) => rows,
            _ => Vec::new(),
        }
    }

    pub fn affected(&self) -> u64 {
        match self {
            QueryResult::Affected(count) => *count,
            QueryResult::Inserted { .. } => 1,
            _ => 0,
        }
    }
}
