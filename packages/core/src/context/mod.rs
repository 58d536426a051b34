//! Session-local caching layer between the session API and the row store

mod persistence_context;
mod selections;

pub use persistence_context::{ContextCapacity, ContextStats, PersistenceContext};
pub use selections::{SelectionContext, SelectionKind};
