//! Content-addressed layer store (spec.md §4.1).

pub mod driver;
pub mod image;
pub mod store;
pub mod tarsplit;

pub use driver::{GraphDriver, LayerReader, MemoryDriver};
pub use image::{Image, ImageId, ImageMetadata, RuntimeConfig};
pub use store::Graph;
