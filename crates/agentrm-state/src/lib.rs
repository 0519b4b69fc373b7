//! agentrm-state — durable snapshots of agent state.
//!
//! Backed by [redb](https://docs.rs/redb). Every record is JSON-serialized
//! into a `&[u8]` value column. Agent snapshots are keyed by the random
//! instance UUID of the agent-state incarnation that wrote them, with a
//! second table enforcing one snapshot per agent ID.
//!
//! The engine only talks to the store through [`DurableStore`], so tests
//! can substitute a failing or recording implementation.
//!
//! `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`).

pub mod durable;
pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use durable::DurableStore;
pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
