//! The rendering device: a handle generation allocator for GPU objects with
//! timeline gated deferred destruction.

mod alloc;
mod debug;
mod device;
mod init;
mod slots;
mod surface;
mod types;

use async_trait::async_trait;

use crate::error::Error;

pub use debug::{DebugMessengerCallback, RustLogDebugMessenger};
pub use device::{DeviceLanes, VulkanDevice, FRAMES_IN_FLIGHT};
pub use init::DeviceQueue;
pub use surface::{PixelExtent, SurfaceProvider};
pub use types::*;

/// Public contract of the rendering device.
///
/// All operations are dispatched onto the device's strand lanes, callers may
/// invoke them from anywhere. Handles returned by the create operations are
/// invalidated by the matching destroy; using a stale handle is harmless and
/// reported, never undefined behaviour.
#[async_trait]
pub trait RenderingDevice: Send + Sync {
    async fn initialize(&self) -> Result<(), Error>;

    /// Begins a frame: waits for the frame's fence, acquires the next
    /// swapchain image and resets the frame's command pool.
    async fn prepare_buffers(&self) -> Result<(), Error>;

    /// Ends a frame: submits the recorded command buffers and presents.
    async fn swap_buffers(&self) -> Result<(), Error>;

    async fn create_buffer(&self, descriptor: BufferDescriptor) -> Result<BufferHandle, Error>;
    async fn destroy_buffer(&self, handle: BufferHandle) -> Result<(), Error>;

    async fn create_image(&self, descriptor: ImageDescriptor) -> Result<ImageHandle, Error>;
    async fn destroy_image(&self, handle: ImageHandle) -> Result<(), Error>;

    async fn create_sampler(&self, descriptor: SamplerDescriptor) -> Result<SamplerHandle, Error>;
    async fn destroy_sampler(&self, handle: SamplerHandle) -> Result<(), Error>;

    async fn create_shader_module(&self, descriptor: ShaderModuleDescriptor) -> Result<ShaderModuleHandle, Error>;
    async fn destroy_shader_module(&self, handle: ShaderModuleHandle) -> Result<(), Error>;
}
