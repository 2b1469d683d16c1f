//! Statement execution over replicated tables.
//!
//! A statement resolves the managers of the tables it touches through the
//! [`directory::LocationDirectory`], acquires locks from them through the
//! [`lock::LockBroker`], then runs locally or is propagated to every replica
//! by the [`propagate::ReplicaPropagator`]. Management roles are moved
//! between nodes with the [`migrate::RoleMigrator`].
pub mod admin;
pub mod config;
pub mod deadlock;
pub mod directory;
pub mod engine;
pub mod errors;
pub mod executor;
pub mod lock;
pub mod memory;
pub mod migrate;
pub mod propagate;
pub mod session;
pub mod statement;
