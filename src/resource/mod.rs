//! Reference counted caching of CPU side resource blobs.

mod manager;

pub use manager::{
    Resource, ResourceDescriptor, ResourceHandle, ResourceLease, ResourceManager, ResourceType,
};
