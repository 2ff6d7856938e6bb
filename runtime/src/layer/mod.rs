//! Layers: the pure snapshot/diff model and the content-addressed store.

pub mod diff;
mod store;

pub use diff::{ChangeSet, Node, Snapshot};
pub use store::{LayerMeta, LayerStore};
