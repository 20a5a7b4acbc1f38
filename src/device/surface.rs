//! Seam to the external windowing collaborator.

use std::ffi::CString;

use ash::vk;

use crate::error::Error;

/// Size of the window surface in pixels.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PixelExtent {
    pub width: u32,
    pub height: u32,
}

impl PixelExtent {
    pub fn is_zero(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Provided by the windowing platform. The device only ever needs the
/// required instance extensions, a surface handle and the current pixel
/// extent; everything else about the window stays outside this crate.
pub trait SurfaceProvider: Send {
    /// Returns a list of all required instance extensions for this surface.
    fn get_required_instance_extensions(&self) -> Vec<CString>;

    /// Called once during device initialization to create the surface.
    ///
    /// # Safety
    /// The returned surface must not be used after [`SurfaceProvider::destroy`]
    /// has been called. If this function returns [`Ok`] then
    /// [`SurfaceProvider::destroy`] must be called before the instance is
    /// destroyed.
    unsafe fn init(&mut self, entry: &ash::Entry, instance: &ash::Instance) -> Result<vk::SurfaceKHR, Error>;

    /// Destroys any vulkan objects created by the surface provider.
    ///
    /// # Safety
    /// Must only be called after a successful [`SurfaceProvider::init`] and
    /// before the instance is destroyed. The surface must not be in use.
    unsafe fn destroy(&mut self);

    /// Current framebuffer size. The swapchain build blocks while this
    /// reports a zero extent, the provider guarantees it eventually becomes
    /// nonzero.
    fn get_pixel_extent(&self) -> PixelExtent;
}
