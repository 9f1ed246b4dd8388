//! Normalized client-side entity cache with optimistic edit branches.
//!
//! This crate caches remote list and item resources, keyed canonically, and
//! lets callers edit them optimistically before reconciling the edits back.
//!
//! ## Features
//!
//! - **Repository**: normalized entity and list storage with deduplicated,
//!   debounced read-through fetches and sideload extraction
//! - **Branch**: isolated change log overlaid on repository reads
//! - **Merge/Push**: minimal changes view and commit back into the repository
//! - **Views**: `Item`, `List` and `Reduce` facades for rendering layers
//! - **Transports**: in-memory fixtures and a REST-style HTTP client

pub mod branch;
mod codec;
mod config;
mod debounce;
mod error;
mod normalize;
pub mod reconcile;
pub mod repository;
pub mod transport;
mod types;
pub mod view;

pub use branch::{Branch, BranchUpdate, ChangeEntry, FieldChange, ItemView, ListView};
pub use codec::{Id, encode_id, encode_id_value, encode_query, id_path_segment};
pub use config::{DEFAULT_INSERT_DEBOUNCE_MS, DEFAULT_UPDATE_CHANNEL_CAPACITY, RepositoryConfig};
pub use error::{CacheError, CodecError, ConfigError, FetchError, TransportError};
pub use reconcile::{Changes, Merge, PendingChange, Push};
pub use repository::{ItemCache, ItemWrite, ListCache, Repository, RepositoryUpdate};
pub use transport::{Fixture, HttpTransport, ListFixture, MemoryTransport, Transport};
pub use types::*;
pub use view::{Item, ItemInteract, List, ListState, Reduce, ReduceView};
