use crate::types::{NodeHandle, RoleId, TableIdentity};

#[derive(Debug, thiserror::Error)]
pub enum MetaError {
    #[error("The {role} has moved to another node")]
    Moved { role: RoleId },

    #[error("Migration of the {role} is already in progress")]
    MigrationInProgress { role: RoleId },

    #[error("The {role} has already moved")]
    AlreadyMoved { role: RoleId },

    #[error("Node '{node}' does not host a table manager for {table}")]
    NoSuchManager { node: String, table: TableIdentity },

    #[error("Node '{node}' does not host the system table")]
    NotSystemTable { node: String },

    #[error("Node '{address}' is unreachable")]
    Unreachable { address: String },

    #[error(
        "Location of the {role} changed concurrently; expected: {expected}, found: {found}"
    )]
    LocationChanged {
        role: RoleId,
        expected: NodeHandle,
        found: NodeHandle,
    },

    #[error("Replica '{replica}' failed: {message}")]
    ReplicaFailure { replica: String, message: String },

    #[error("Concurrent update to {table}")]
    ConcurrentUpdate { table: TableIdentity },

    #[error("Resource exhausted on node '{node}'")]
    ResourceExhausted { node: String },

    #[error("Failed to encode or decode role state: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("internal: {0}")]
    Internal(String),
}

impl MetaError {
    /// If the error indicates the remote side could not be talked to at all,
    /// as opposed to the remote side answering with an error.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, MetaError::Unreachable { .. })
    }
}

pub type Result<T, E = MetaError> = std::result::Result<T, E>;

#[allow(unused_macros)]
macro_rules! internal {
    ($($arg:tt)*) => {
        crate::errors::MetaError::Internal(std::format!($($arg)*))
    };
}
#[allow(unused_imports)]
pub(crate) use internal;
