//! Concrete adapter implementations for ports.

pub mod file_config_adapter;
pub mod memory_adapter;
#[cfg(feature = "postgres")]
pub mod postgres_adapter;
pub mod sequence_repair;
#[cfg(feature = "sqlite")]
pub mod sqlite_adapter;
