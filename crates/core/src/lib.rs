//! maestro-core: shared contracts for the maestro orchestrator.
//!
//! This crate provides the foundation the reconciliation engine is built on:
//! - `Status` / `StatusError`: the tagged status and boundary error model
//! - `StateStore`: a keyed, versioned entity store with optimistic revisions
//! - `ListFilter`: label/field/status/spec selectors for store listings
//! - `PubSub`: the publish/subscribe transport seam
//! - `Request` / `Response`: wire envelopes for asynchronous provider calls
//!
//! The types are transport- and storage-agnostic; in-memory implementations
//! of the store and the bus are included as the reference behavior.

pub mod error;
pub mod filter;
pub mod pubsub;
pub mod store;
pub mod wire;

pub use error::{Result, Status, StatusError};
pub use filter::ListFilter;
pub use pubsub::{Event, MemoryBus, PubSub};
pub use store::{MemoryStateStore, StateEntry, StateStore, UpsertOptions};
pub use wire::{CALL_CONTEXT, Request, Response};
