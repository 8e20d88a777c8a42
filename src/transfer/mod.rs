//! Push/pull transfer engine: endpoint fallback, v1/v2 state machines,
//! and the registry collaborator traits they run against (spec.md §4.5).

pub mod endpoint;
pub mod puller_v1;
pub mod puller_v2;
pub mod pusher_v1;
pub mod pusher_v2;
pub mod session;

pub use endpoint::{run_with_fallback, Endpoint, EndpointList, StaticEndpointList, Version};
pub use session::{
    BlobReader, BlobService, BlobStat, BlobWriter, ManifestService, MockRegistry, RecordingBuffer, Repository,
    RegistrySession, UploadWriter,
};
