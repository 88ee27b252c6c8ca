//! Durable agent state and time-ordered agent memory.
//!
//! Agents keep two kinds of data here: a single state blob with a TTL, and
//! per-type memory logs ordered by timestamp. Both live in a key-value
//! store with the layout
//!
//! - `agent:{id}:state` holds the state blob,
//! - `agent:{id}:memory:{type}` holds the sorted log for one entry type,
//! - `agent:{id}:memory:types` indexes the entry types in use.
//!
//! # Main types
//!
//! - [`KvStore`] — Trait over the string, sorted-log and set primitives.
//! - [`InMemoryKvStore`] — Process-local store.
//! - [`FileKvStore`] — Store persisted as a JSON snapshot on disk.
//! - [`AgentStore`] — Agent-facing operations with timeouts and retries.
//! - [`StoreConfig`] — `[store]` configuration section.

/// Agent state, memory log and single-blob adapter.
pub mod agent_store;
/// Store configuration and backend selection.
pub mod config;
/// File-backed key-value store.
pub mod file;
/// Key-value store trait and in-memory implementation.
pub mod kv;

pub use agent_store::{AgentState, AgentStore, MemoryEntry, MemoryScope, LEGACY_MEMORY_TYPE};
pub use config::{open_store, StoreBackend, StoreConfig};
pub use file::FileKvStore;
pub use kv::{BatchOp, InMemoryKvStore, KvStore};
