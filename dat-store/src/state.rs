//! Shared state of the HTTP handlers

use crate::store::Store;

/// The shared app state.
#[derive(Debug, Clone)]
pub struct AppState {
    /// The store served by this node
    pub store: Store,
}
