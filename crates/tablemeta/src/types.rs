//! Data model shared between nodes.
use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::Result;

/// Schema used for tables that aren't qualified.
pub const DEFAULT_SCHEMA: &str = "PUBLIC";

/// Schemas holding metadata tables. Statements against these never go
/// through a Table Manager.
pub const SYSTEM_SCHEMAS: &[&str] = &["INFORMATION_SCHEMA", "SYSTEM"];

/// Stable key for a table, unique within a schema.
///
/// Names are normalized to upper case on construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableIdentity {
    pub schema: String,
    pub table: String,
}

impl TableIdentity {
    pub fn new(schema: impl AsRef<str>, table: impl AsRef<str>) -> Self {
        TableIdentity {
            schema: schema.as_ref().to_uppercase(),
            table: table.as_ref().to_uppercase(),
        }
    }

    /// Parse a possibly qualified name, `schema.table` or just `table`.
    pub fn parse(name: &str) -> Option<Self> {
        let mut parts = name.trim().split('.');
        let (schema, table) = match (parts.next(), parts.next(), parts.next()) {
            (Some(table), None, None) => (DEFAULT_SCHEMA, table),
            (Some(schema), Some(table), None) => (schema, table),
            _ => return None,
        };
        if schema.is_empty() || table.is_empty() {
            return None;
        }
        Some(TableIdentity::new(schema, table))
    }

    /// If this is a metadata table that is never replicated.
    pub fn is_system(&self) -> bool {
        SYSTEM_SCHEMAS.iter().any(|s| *s == self.schema)
    }
}

impl fmt::Display for TableIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

/// Identity and address of a database node.
///
/// Equality, hashing and ordering only consider the address. A node that
/// restarts gets a new instance id but is still the same location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeHandle {
    instance_id: Uuid,
    address: String,
}

impl NodeHandle {
    pub fn new(address: impl Into<String>) -> Self {
        NodeHandle {
            instance_id: Uuid::new_v4(),
            address: address.into(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }
}

impl PartialEq for NodeHandle {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for NodeHandle {}

impl Hash for NodeHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state)
    }
}

impl PartialOrd for NodeHandle {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NodeHandle {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.address.cmp(&other.address)
    }
}

impl fmt::Display for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address)
    }
}

/// Class of a table lock. Totally ordered, a stronger class subsumes all
/// weaker ones.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub enum LockClass {
    #[default]
    None,
    Read,
    Write,
    Create,
}

impl LockClass {
    /// WRITE and CREATE are mutually exclusive with every other lock.
    pub fn is_exclusive(&self) -> bool {
        *self >= LockClass::Write
    }

    /// If holding `self` makes a request for `requested` unnecessary.
    pub fn satisfies(&self, requested: LockClass) -> bool {
        *self >= requested
    }
}

impl fmt::Display for LockClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockClass::None => write!(f, "NONE"),
            LockClass::Read => write!(f, "READ"),
            LockClass::Write => write!(f, "WRITE"),
            LockClass::Create => write!(f, "CREATE"),
        }
    }
}

/// Name of a transaction, unique across the system.
///
/// Format: `<address>/<session>/<sequence>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxnName(String);

impl TxnName {
    pub fn new(node: &NodeHandle, session_id: u64, seq: u64) -> Self {
        TxnName(format!("{}/{}/{}", node.address(), session_id, seq))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TxnName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A lock granted by a Table Manager to a single transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockGrant {
    pub table: TableIdentity,
    pub class: LockClass,
    pub holder: TxnName,
    /// Replicas that must apply any mutation made under this lock.
    pub replicas: Vec<NodeHandle>,
    /// Update sequence number of the table at the time of the grant.
    pub update_id: u64,
}

impl LockGrant {
    /// If executing under this grant only touches the given node.
    pub fn is_local_only(&self, node: &NodeHandle) -> bool {
        self.replicas.len() == 1 && &self.replicas[0] == node
    }
}

/// Answer from a Table Manager to a lock request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockResponse {
    /// All replica locks held.
    Granted(LockGrant),
    /// Lock currently held by other transactions.
    Waiting { holders: Vec<TxnName> },
    /// Manager is preparing a migration and isn't admitting new requests.
    Migrating,
    /// Manager relocated, caller needs to re-resolve.
    Moved,
}

/// Lifecycle of a management role as seen from the directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MigrationState {
    Active,
    Migrating,
    Moved,
}

/// Directory entry for a single table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerRecord {
    pub table: TableIdentity,
    pub host: NodeHandle,
    pub replicas: BTreeSet<NodeHandle>,
    pub state: MigrationState,
}

impl ManagerRecord {
    pub fn new(table: TableIdentity, host: NodeHandle, replicas: BTreeSet<NodeHandle>) -> Self {
        ManagerRecord {
            table,
            host,
            replicas,
            state: MigrationState::Active,
        }
    }
}

/// A management role that can be migrated between nodes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RoleId {
    /// The directory mapping tables to their managers.
    SystemTable,
    /// Lock and replica state for one table.
    TableManager(TableIdentity),
}

impl fmt::Display for RoleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoleId::SystemTable => write!(f, "system table"),
            RoleId::TableManager(table) => write!(f, "table manager for {table}"),
        }
    }
}

/// Full state of a Table Manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerState {
    pub table: TableIdentity,
    pub replicas: BTreeSet<NodeHandle>,
    pub update_id: u64,
    pub writer: Option<(TxnName, LockClass)>,
    pub readers: BTreeSet<TxnName>,
}

impl ManagerState {
    /// State with no locks held, used when a manager is created or rebuilt.
    pub fn fresh(table: TableIdentity, replicas: BTreeSet<NodeHandle>) -> Self {
        ManagerState {
            table,
            replicas,
            update_id: 0,
            writer: None,
            readers: BTreeSet::new(),
        }
    }
}

/// Full state of the System Table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryState {
    pub records: Vec<ManagerRecord>,
    /// Replica placement, sorted by table. Kept as pairs since table
    /// identities can't be JSON object keys.
    pub replicas: Vec<(TableIdentity, BTreeSet<NodeHandle>)>,
    pub active: BTreeSet<NodeHandle>,
}

/// State handed from an old role instance to its replacement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateBlob {
    TableManager(ManagerState),
    SystemTable(DirectoryState),
}

impl StateBlob {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(buf: &[u8]) -> Result<StateBlob> {
        Ok(serde_json::from_slice(buf)?)
    }
}
