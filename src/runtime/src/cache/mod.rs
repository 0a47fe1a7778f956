//! Persistent layer cache shared across invocations.

pub mod layer_cache;

pub use layer_cache::{CachedImage, LayerCache};
