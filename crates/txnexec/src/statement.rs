//! Interface to parsed statements.
//!
//! Parsing, planning and evaluation live outside this crate. The executor
//! only needs to know what a statement touches and how to run it.
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tablemeta::node::NodeServices;
use tablemeta::replica::ReplicaStore;
use tablemeta::types::{LockClass, LockGrant, NodeHandle, TableIdentity, TxnName};
use tokio_util::sync::CancellationToken;

use crate::errors::{ExecError, Result};

/// A bound parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    /// Render as a SQL literal that any replica can parse without the
    /// prepared statement.
    pub fn to_sql_literal(&self) -> String {
        match self {
            Value::Null => "NULL".to_string(),
            Value::Bool(b) => (if *b { "TRUE" } else { "FALSE" }).to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) if f.is_finite() => {
                let s = f.to_string();
                // Keep it a decimal literal, not an integer one.
                if s.contains('.') || s.contains('e') {
                    s
                } else {
                    format!("{s}.0")
                }
            }
            Value::Float(f) => format!("CAST('{f}' AS DOUBLE)"),
            Value::Text(s) => format!("'{}'", s.replace('\'', "''")),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_sql_literal())
    }
}

/// Replace `?` placeholders with the literal form of the parameters.
///
/// Placeholders inside string literals and quoted identifiers are left
/// alone. The number of placeholders must match the number of parameters.
pub fn substitute_parameters(sql: &str, params: &[Value]) -> Result<String> {
    #[derive(PartialEq)]
    enum Scan {
        Plain,
        Literal,
        Identifier,
    }

    let mut out = String::with_capacity(sql.len());
    let mut scan = Scan::Plain;
    let mut used = 0;
    let mut placeholders = 0;

    for c in sql.chars() {
        match (&scan, c) {
            (Scan::Plain, '\'') => scan = Scan::Literal,
            (Scan::Plain, '"') => scan = Scan::Identifier,
            (Scan::Literal, '\'') | (Scan::Identifier, '"') => scan = Scan::Plain,
            (Scan::Plain, '?') => {
                placeholders += 1;
                if let Some(param) = params.get(used) {
                    out.push_str(&param.to_sql_literal());
                    used += 1;
                }
                continue;
            }
            _ => (),
        }
        out.push(c);
    }

    if placeholders != params.len() {
        return Err(ExecError::ParameterCount {
            expected: placeholders,
            provided: params.len(),
        });
    }

    Ok(out)
}

/// Result of executing a statement.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecOutcome {
    Rows(Vec<Vec<Value>>),
    UpdateCount(u64),
}

impl ExecOutcome {
    pub fn update_count(&self) -> Option<u64> {
        match self {
            ExecOutcome::UpdateCount(n) => Some(*n),
            ExecOutcome::Rows(_) => None,
        }
    }
}

/// Fail with `Cancelled` if the token has been cancelled.
pub fn checkpoint(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(ExecError::Cancelled);
    }
    Ok(())
}

/// What a statement gets to see while executing on the local node.
pub struct ExecContext<'a> {
    pub(crate) txn: &'a TxnName,
    pub(crate) node: &'a Arc<NodeServices>,
    pub(crate) cancel: &'a CancellationToken,
    pub(crate) grants: &'a [LockGrant],
}

impl ExecContext<'_> {
    pub fn txn(&self) -> &TxnName {
        self.txn
    }

    pub fn node(&self) -> &NodeHandle {
        self.node.handle()
    }

    /// Storage of the local node. Writes made here are committed or rolled
    /// back with the transaction.
    pub fn store(&self) -> &Arc<dyn ReplicaStore> {
        self.node.store()
    }

    /// Grant held for a table touched by the statement.
    pub fn grant(&self, table: &TableIdentity) -> Option<&LockGrant> {
        self.grants.iter().find(|g| &g.table == table)
    }

    /// Cancellation checkpoint. Must be called between row operations.
    pub fn checkpoint(&self) -> Result<()> {
        checkpoint(self.cancel)
    }
}

/// A parsed, typed statement.
#[async_trait]
pub trait PreparedStatement: Send + Sync {
    /// Statement text, possibly with `?` placeholders.
    fn sql(&self) -> &str;

    fn is_query(&self) -> bool;

    /// Non-transactional statements (DDL) complete the transaction they run
    /// in even when auto-commit is off.
    fn is_transactional(&self) -> bool;

    fn is_read_only(&self) -> bool;

    fn parameters(&self) -> &[Value];

    /// Tables touched, in the order their locks should be taken.
    fn tables(&self) -> Vec<TableIdentity>;

    /// Lock needed on every table touched.
    fn lock_class(&self) -> LockClass {
        if self.is_query() && self.is_read_only() {
            LockClass::Read
        } else {
            LockClass::Write
        }
    }

    /// Schema modification id the cached plan was built against.
    fn modification_id(&self) -> u64;

    /// Plans depending on literal values are rebuilt before every execution.
    fn always_recompile(&self) -> bool {
        false
    }

    /// Rebuild the plan against the current schema.
    async fn recompile(&mut self, modification_id: u64) -> Result<()>;

    /// Run the statement against the local node.
    async fn execute(&self, ctx: &ExecContext<'_>) -> Result<ExecOutcome>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literals() {
        assert_eq!("NULL", Value::Null.to_sql_literal());
        assert_eq!("TRUE", Value::Bool(true).to_sql_literal());
        assert_eq!("-4", Value::Int(-4).to_sql_literal());
        assert_eq!("2.5", Value::Float(2.5).to_sql_literal());
        assert_eq!("3.0", Value::Float(3.0).to_sql_literal());
        assert_eq!("'it''s'", Value::Text("it's".to_string()).to_sql_literal());
    }

    #[test]
    fn substitute_skips_quoted() {
        let sql = "UPDATE t SET a = ?, b = '?' WHERE \"c?\" = ?";
        let out =
            substitute_parameters(sql, &[Value::Int(1), Value::Text("x".to_string())]).unwrap();
        assert_eq!("UPDATE t SET a = 1, b = '?' WHERE \"c?\" = 'x'", out);
    }

    #[test]
    fn substitute_counts_placeholders() {
        let err = substitute_parameters("SELECT ?, ?", &[Value::Int(1)]).unwrap_err();
        assert!(matches!(
            err,
            ExecError::ParameterCount {
                expected: 2,
                provided: 1
            }
        ));

        let err = substitute_parameters("SELECT 1", &[Value::Int(1)]).unwrap_err();
        assert!(matches!(
            err,
            ExecError::ParameterCount {
                expected: 0,
                provided: 1
            }
        ));
    }

    #[test]
    fn escaped_quotes_stay_in_literal() {
        let out = substitute_parameters("SELECT 'a''?' , ?", &[Value::Null]).unwrap();
        assert_eq!("SELECT 'a''?' , NULL", out);
    }
}
