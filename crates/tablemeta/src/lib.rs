//! Node-resident management roles for replicated tables.
//!
//! A Table Manager owns lock state and replica placement for one table. The
//! System Table is the directory mapping tables to the node currently
//! hosting their manager. Both roles can be migrated between nodes.
pub mod errors;
pub mod local;
pub mod manager;
pub mod node;
pub mod replica;
pub mod rpc;
pub mod system_table;
pub mod types;
