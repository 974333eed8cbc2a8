//! # statehub core
//!
//! Uniform CRUD/subscribe contracts over heterogeneous, partially
//! asynchronous data backends.
//!
//! This crate provides:
//! - The change notification delegate (per-name listener registry with
//!   typed dispatch and fault isolation)
//! - The synchronous state manager driving pluggable storage primitives
//! - The asynchronous state manager (fetch de-duplication, run bookkeeping,
//!   generation-guarded completions)
//! - The filtered query engine (exact / conditional / partial classes)
//! - In-memory and key-value persisted backends, plain and encrypted
//! - Composite managers: aggregate fan-out and the async-to-sync bridge
//!
//! ## Architecture
//!
//! A caller issues CRUD/query calls on a [`StateManager`]. Synchronous
//! managers answer immediately from an owned buffer; asynchronous managers
//! answer from a completed run's buffer or start a primitive fetch that
//! resolves out of band. Results flow back to subscribers through the
//! [`ChangeDelegate`], including failures, which are never thrown across
//! the public contract.
//!
//! ## Key invariants
//!
//! - At most one authoritative state record per name per manager
//! - One primitive fetch per run (reads during a run return empty)
//! - Event delivery per name follows operation resolution order
//! - A stale fetch completion never overwrites a fresher run

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod async_manager;
mod composite;
mod equality;
mod error;
mod events;
mod filter;
mod keyvalue;
mod manager;
mod security;
mod store;
mod types;

pub use async_manager::{AsyncFetcher, AsyncManager, RunHandle};
pub use composite::{AggregateManager, AsyncBridge};
pub use equality::{composite_equality, key_field_equality, EqualityFn, EqualityRegistry};
pub use error::{CoreError, CoreResult};
pub use events::{ChangeDelegate, ChangeListener, StateEvent, StateEventType};
pub use filter::{Filter, FilterEngine, FilterOperator, MatchLogic};
pub use keyvalue::{EncryptedKeyValueStore, KeyValueBackend, KeyValueStore, MemoryKeyValueBackend};
pub use manager::{StateManager, SyncManager};
pub use security::{ObjectCipher, StaticIdentity, UserIdentity};
pub use store::{MemoryStore, StateStore};
pub use types::{CollectionSpec, Item, StateValue};
