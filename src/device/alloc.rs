//! Device memory allocation.
//!
//! Thin wrapper over [`gpu_allocator`]. The allocator is internally
//! synchronized (one mutex around the suballocator) so any lane may call it.

use ash::vk;
use gpu_allocator::MemoryLocation;
use gpu_allocator::vulkan::{AllocationCreateDesc, AllocatorCreateDesc};
use parking_lot::Mutex;

use crate::device::types::{BufferUsage, Visibility};
use crate::error::Error;

/// Maps a buffer descriptor onto a memory location.
///
/// The underlying allocator models access patterns through locations rather
/// than per allocation flags: host visible staging memory that is written
/// sequentially lives in `CpuToGpu`, host visible readback memory in
/// `GpuToCpu`, everything device local in `GpuOnly`.
pub(crate) fn buffer_memory_location(visibility: Visibility, usage: BufferUsage) -> MemoryLocation {
    let is_source = usage.contains(BufferUsage::TRANSFER_SOURCE);
    let is_destination = usage.contains(BufferUsage::TRANSFER_DESTINATION);

    match visibility {
        Visibility::Host => {
            if is_destination && !is_source {
                MemoryLocation::GpuToCpu
            } else {
                MemoryLocation::CpuToGpu
            }
        }
        Visibility::Device => MemoryLocation::GpuOnly,
    }
}

pub(crate) struct DeviceAllocator {
    device: ash::Device,
    allocator: Mutex<gpu_allocator::vulkan::Allocator>,
}

impl DeviceAllocator {
    pub fn new(
        instance: ash::Instance,
        device: ash::Device,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Self, Error> {
        let allocator = gpu_allocator::vulkan::Allocator::new(&AllocatorCreateDesc {
            instance,
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
        }).map_err(|err| {
            log::error!("failed to create device memory allocator: {:?}", err);
            Error::InternalError
        })?;

        Ok(Self {
            device,
            allocator: Mutex::new(allocator),
        })
    }

    /// Allocates and binds memory for a buffer.
    pub fn allocate_buffer_memory(
        &self,
        buffer: vk::Buffer,
        location: MemoryLocation,
    ) -> Result<Allocation, Error> {
        let requirements = unsafe {
            self.device.get_buffer_memory_requirements(buffer)
        };

        let allocation = self.allocator.lock().allocate(&AllocationCreateDesc {
            name: "",
            requirements,
            location,
            linear: true,
        }).map_err(|err| {
            log::error!("buffer memory allocation failed: {:?}", err);
            Error::InternalError
        })?;

        if let Err(err) = unsafe {
            self.device.bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        } {
            log::error!("vkBindBufferMemory returned {:?}", err);
            let _ = self.allocator.lock().free(allocation);
            return Err(Error::InternalError);
        }

        Ok(Allocation {
            allocation: Some(allocation),
        })
    }

    /// Allocates and binds memory for an image.
    pub fn allocate_image_memory(
        &self,
        image: vk::Image,
        location: MemoryLocation,
    ) -> Result<Allocation, Error> {
        let requirements = unsafe {
            self.device.get_image_memory_requirements(image)
        };

        let allocation = self.allocator.lock().allocate(&AllocationCreateDesc {
            name: "",
            requirements,
            location,
            // Host accessible images use linear tiling.
            linear: location != MemoryLocation::GpuOnly,
        }).map_err(|err| {
            log::error!("image memory allocation failed: {:?}", err);
            Error::InternalError
        })?;

        if let Err(err) = unsafe {
            self.device.bind_image_memory(image, allocation.memory(), allocation.offset())
        } {
            log::error!("vkBindImageMemory returned {:?}", err);
            let _ = self.allocator.lock().free(allocation);
            return Err(Error::InternalError);
        }

        Ok(Allocation {
            allocation: Some(allocation),
        })
    }

    pub fn free(&self, mut allocation: Allocation) {
        if let Some(allocation) = allocation.allocation.take() {
            self.allocator.lock().free(allocation).unwrap_or_else(|err| {
                log::error!("failed to free device memory: {:?}", err);
            });
        }
    }
}

/// A bound memory allocation. Returned to [`DeviceAllocator::free`] when the
/// owning object is collected.
pub(crate) struct Allocation {
    allocation: Option<gpu_allocator::vulkan::Allocation>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hint_table() {
        let host = Visibility::Host;
        let device = Visibility::Device;

        assert_eq!(
            buffer_memory_location(host, BufferUsage::TRANSFER_SOURCE),
            MemoryLocation::CpuToGpu
        );
        assert_eq!(
            buffer_memory_location(host, BufferUsage::TRANSFER_DESTINATION),
            MemoryLocation::GpuToCpu
        );
        assert_eq!(
            buffer_memory_location(host, BufferUsage::TRANSFER_SOURCE | BufferUsage::TRANSFER_DESTINATION),
            MemoryLocation::CpuToGpu
        );
        assert_eq!(
            buffer_memory_location(host, BufferUsage::READ_ONLY),
            MemoryLocation::CpuToGpu
        );
        assert_eq!(
            buffer_memory_location(device, BufferUsage::VERTEX),
            MemoryLocation::GpuOnly
        );
    }
}
