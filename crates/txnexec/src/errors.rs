use std::time::Duration;

use tablemeta::errors::MetaError;
use tablemeta::types::{RoleId, TableIdentity, TxnName};

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("Timeout trying to lock {table} after {waited:?}")]
    LockTimeout { table: TableIdentity, waited: Duration },

    #[error("Deadlock detected trying to lock {table}; cycle: {}", display_cycle(.cycle))]
    Deadlock {
        table: TableIdentity,
        cycle: Vec<TxnName>,
    },

    #[error("Concurrent update to {table}")]
    ConcurrentUpdate { table: TableIdentity },

    #[error("Migration of the {0} is already in progress")]
    MigrationInProgress(RoleId),

    #[error("The {0} has already moved")]
    AlreadyMoved(RoleId),

    #[error("Table or view not found: {0}")]
    TableOrViewNotFound(TableIdentity),

    #[error("Table already exists: {0}")]
    TableExists(TableIdentity),

    #[error("Table manager for {table} is unreachable: {reason}")]
    ManagerUnreachable { table: TableIdentity, reason: String },

    #[error("Directory failure for {table}: {reason}")]
    DirectoryFailure { table: TableIdentity, reason: String },

    #[error("Replica '{replica}' failed; transaction rolled back: {message}")]
    ReplicaFailure { replica: String, message: String },

    #[error("Out of memory")]
    OutOfMemory,

    #[error("Statement was cancelled")]
    Cancelled,

    #[error("Database is closed")]
    DatabaseClosed,

    #[error("Session is closed")]
    SessionClosed,

    #[error("Invalid value for setting '{name}': {reason}")]
    InvalidSetting { name: String, reason: String },

    #[error("Unknown setting: {0}")]
    UnknownSetting(String),

    #[error("Syntax error in administrative statement: {0}")]
    Syntax(String),

    #[error("Statement expects {expected} parameters, {provided} provided")]
    ParameterCount { expected: usize, provided: usize },

    #[error("{source}; SQL statement: {sql}")]
    Statement {
        sql: String,
        #[source]
        source: Box<ExecError>,
    },

    #[error(transparent)]
    Meta(MetaError),

    #[error("internal error: {0}")]
    Internal(String),
}

fn display_cycle(cycle: &[TxnName]) -> String {
    cycle
        .iter()
        .map(|t| t.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}

impl ExecError {
    /// Attach the statement text that produced this error.
    ///
    /// Errors that already carry statement text are returned as is.
    pub fn with_statement(self, sql: impl Into<String>) -> ExecError {
        match self {
            err @ ExecError::Statement { .. } => err,
            err => ExecError::Statement {
                sql: sql.into(),
                source: Box::new(err),
            },
        }
    }

    /// The error without any attached statement text.
    pub fn root(&self) -> &ExecError {
        match self {
            ExecError::Statement { source, .. } => source.root(),
            err => err,
        }
    }

    pub fn is_concurrent_update(&self) -> bool {
        matches!(self.root(), ExecError::ConcurrentUpdate { .. })
    }

    pub fn is_out_of_memory(&self) -> bool {
        matches!(self.root(), ExecError::OutOfMemory)
    }
}

impl From<MetaError> for ExecError {
    fn from(value: MetaError) -> Self {
        match value {
            MetaError::MigrationInProgress { role } => ExecError::MigrationInProgress(role),
            MetaError::AlreadyMoved { role } => ExecError::AlreadyMoved(role),
            MetaError::ConcurrentUpdate { table } => ExecError::ConcurrentUpdate { table },
            MetaError::ResourceExhausted { .. } => ExecError::OutOfMemory,
            MetaError::ReplicaFailure { replica, message } => {
                ExecError::ReplicaFailure { replica, message }
            }
            other => ExecError::Meta(other),
        }
    }
}

pub type Result<T, E = ExecError> = std::result::Result<T, E>;

#[allow(unused_macros)]
macro_rules! internal {
    ($($arg:tt)*) => {
        crate::errors::ExecError::Internal(std::format!($($arg)*))
    };
}
#[allow(unused_imports)]
pub(crate) use internal;
