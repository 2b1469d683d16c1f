//! Administrative statements moving management roles around.
//!
//! ```text
//! MIGRATE TABLEMANAGER <schema>.<table>
//! MIGRATE SYSTEMTABLE
//! RECREATE TABLEMANAGER <schema>.<table>
//! ```
//!
//! Keywords are case-insensitive. Roles always move to the node running the
//! statement.
use std::fmt;

use tablemeta::types::TableIdentity;

use crate::errors::{ExecError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminStatement {
    MigrateTableManager(TableIdentity),
    MigrateSystemTable,
    RecreateTableManager(TableIdentity),
}

impl AdminStatement {
    /// Parse an administrative statement.
    ///
    /// Returns `Ok(None)` if the text isn't an administrative statement at
    /// all, and an error if it is one but malformed.
    pub fn parse(sql: &str) -> Result<Option<AdminStatement>> {
        let sql = sql.trim().trim_end_matches(';').trim_end();
        let words: Vec<&str> = sql.split_whitespace().collect();
        let upper: Vec<String> = words.iter().map(|w| w.to_uppercase()).collect();
        let keywords: Vec<&str> = upper.iter().map(String::as_str).collect();

        let stmt = match keywords.as_slice() {
            ["MIGRATE", "SYSTEMTABLE"] => AdminStatement::MigrateSystemTable,
            ["MIGRATE", "TABLEMANAGER", _] => {
                AdminStatement::MigrateTableManager(parse_table(words[2])?)
            }
            ["RECREATE", "TABLEMANAGER", _] => {
                AdminStatement::RecreateTableManager(parse_table(words[2])?)
            }
            ["MIGRATE" | "RECREATE", "SYSTEMTABLE" | "TABLEMANAGER", ..] => {
                return Err(ExecError::Syntax(sql.to_string()));
            }
            _ => return Ok(None),
        };
        Ok(Some(stmt))
    }
}

fn parse_table(name: &str) -> Result<TableIdentity> {
    TableIdentity::parse(name).ok_or_else(|| ExecError::Syntax(format!("invalid table name: {name}")))
}

impl fmt::Display for AdminStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdminStatement::MigrateTableManager(table) => write!(f, "MIGRATE TABLEMANAGER {table}"),
            AdminStatement::MigrateSystemTable => write!(f, "MIGRATE SYSTEMTABLE"),
            AdminStatement::RecreateTableManager(table) => {
                write!(f, "RECREATE TABLEMANAGER {table}")
            }
        }
    }
}
