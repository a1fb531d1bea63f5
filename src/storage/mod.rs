//! Storage module for address book and header persistence

pub mod persistence;

pub use persistence::{FileStore, MemoryStore, NetworkStore, StorageConfig, StorageError};
