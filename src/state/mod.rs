//! Persistent catalogue shared by the three workers.
//!
//! The state store is the only coupling between the Fetcher, the
//! Decoder/Converter, and the Renderer: workers exchange work by committing
//! rows, never by holding references to each other. Every compound
//! transition is a single SQLite transaction, which is what makes claims
//! race-safe and restarts crash-safe.

mod store;

pub use store::{
    FileRecord, PartialDownload, ProcessingStatus, ProductRow, StateStore, StoreStats, VolumeRow,
};
