//! Images: model, references, tags and the local store.

mod model;
mod reference;
mod store;
mod tags;

pub use model::{HistoryEntry, Image, ImageConfig};
pub use reference::{ImageReference, DEFAULT_REGISTRY, DEFAULT_TAG};
pub use store::{ImageStore, ImageSummary};
pub use tags::{FileTagStore, MemoryTagStore, TagStore};
