//! Media & Number Catalogs: read-through asset cache and outbound number
//! pool.

mod media;
mod numbers;

pub use media::{HttpMediaSource, MediaAsset, MediaCatalog, MediaSource};
pub use numbers::{Capability, NumberLibrary};
