//! Remote read interface used by the repository.
//!
//! The repository never talks to a backend directly; it goes through a
//! [`Transport`]. Two implementations ship with the crate:
//!
//! - [`MemoryTransport`]: fixture-backed, with call counters and failure
//!   injection, for tests and offline tooling
//! - [`HttpTransport`]: REST-style JSON over `reqwest`

use async_trait::async_trait;
use serde_json::Value;

use crate::codec::Id;
use crate::error::TransportError;
use crate::types::{ListResponse, Resource};

mod http;
mod memory;

pub use http::HttpTransport;
pub use memory::{Fixture, ListFixture, MemoryTransport};

/// Reads lists and items of a model from a backend.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Read one page of a list. Items may be stubs or carry attributes.
    async fn read_list(&self, model: &str, query: &Value) -> Result<ListResponse, TransportError>;

    /// Read a single item, optionally with sideloaded relationships.
    async fn read_item(&self, model: &str, id: &Id) -> Result<Resource, TransportError>;
}
