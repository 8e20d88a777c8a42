//! Content-addressed layered image store, tag index, and registry
//! push/pull transfer engine (spec.md §1 "Purpose & scope").
//!
//! [`graph`] is the content-addressed layer store, [`tagstore`] the name
//! index on top of it, [`pool`] dedups concurrent transfers of the same
//! key, [`manifest`] builds/signs/verifies the v2 manifest format, and
//! [`transfer`] drives the v1/v2 pull and push state machines against a
//! caller-supplied registry session. [`core::Core`] assembles all of the
//! above behind one [`config::Config`].

pub mod config;
pub mod core;
pub mod digest;
pub mod error;
pub mod event;
pub mod export;
pub mod graph;
pub mod manifest;
pub mod pool;
pub mod tagstore;
pub mod transfer;
pub mod util;

pub use config::Config;
pub use core::Core;
pub use error::{GraphError, ManifestError, PoolError, TagStoreError, TransferError};
pub use event::{Event, EventSink};
pub use graph::{Graph, Image, ImageId, ImageMetadata};
pub use tagstore::TagStore;
