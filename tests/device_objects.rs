//! Rendering device tests against a real vulkan driver.
//!
//! Most of these need a driver exposing VK_EXT_headless_surface and are
//! marked ignored, run them with `cargo test -- --ignored` on a machine
//! with vulkan installed.

use std::ffi::CString;
use std::sync::Arc;

use ash::vk;

use ember_core::device::{
    BufferDescriptor, BufferUsage, PixelExtent, SamplerDescriptor, ShaderModuleDescriptor,
    ShaderStage, SurfaceProvider, Visibility, VulkanDevice,
};
use ember_core::error::Error;
use ember_core::scheduler::Scheduler;
use ember_core::util::hash::fnv1a_64;

struct HeadlessSurfaceProvider {
    surface: Option<(vk::SurfaceKHR, ash::extensions::khr::Surface)>,
}

impl HeadlessSurfaceProvider {
    const REQUIRED_INSTANCE_EXTENSIONS: [&'static str; 2] = [
        "VK_KHR_surface",
        "VK_EXT_headless_surface",
    ];

    fn new() -> Box<Self> {
        Box::new(Self {
            surface: None,
        })
    }
}

impl SurfaceProvider for HeadlessSurfaceProvider {
    fn get_required_instance_extensions(&self) -> Vec<CString> {
        Self::REQUIRED_INSTANCE_EXTENSIONS.iter()
            .map(|name| CString::new(*name).unwrap())
            .collect()
    }

    unsafe fn init(&mut self, entry: &ash::Entry, instance: &ash::Instance) -> Result<vk::SurfaceKHR, Error> {
        if self.surface.is_some() {
            panic!("HeadlessSurfaceProvider::init called twice");
        }

        let surface_fn = ash::extensions::khr::Surface::new(entry, instance);
        let headless_fn = ash::extensions::ext::HeadlessSurface::new(entry, instance);

        let info = vk::HeadlessSurfaceCreateInfoEXT::builder();
        let surface = headless_fn.create_headless_surface(&info, None)
            .map_err(|_| Error::InternalError)?;

        self.surface = Some((surface, surface_fn));
        Ok(surface)
    }

    unsafe fn destroy(&mut self) {
        if let Some((surface, surface_fn)) = self.surface.take() {
            surface_fn.destroy_surface(surface, None);
        }
    }

    fn get_pixel_extent(&self) -> PixelExtent {
        PixelExtent {
            width: 800,
            height: 600,
        }
    }
}

fn make_device() -> (Arc<Scheduler>, VulkanDevice) {
    let _ = env_logger::builder().is_test(true).try_init();

    let scheduler = Arc::new(Scheduler::new(4).unwrap());
    let device = VulkanDevice::new(scheduler.clone(), HeadlessSurfaceProvider::new(), false);
    (scheduler, device)
}

/// Minimal well formed SPIR-V module: header, OpCapability Shader,
/// OpMemoryModel Logical GLSL450.
fn minimal_spirv() -> Vec<u32> {
    vec![
        0x0723_0203, 0x0001_0000, 0, 2, 0,
        0x0002_0011, 1,
        0x0003_000e, 0, 1,
    ]
}

#[test]
fn operations_before_initialize_fail() {
    // Needs no driver: the device rejects work before initialize ran.
    let (_scheduler, device) = make_device();

    let descriptor = BufferDescriptor {
        size: 64,
        usage: BufferUsage::TRANSFER_SOURCE,
        visibility: Visibility::Device,
    };

    let result = futures::executor::block_on(device.create_buffer(descriptor));
    assert_eq!(result.unwrap_err(), Error::FailedPreconditionError);
}

#[test]
#[ignore = "requires a vulkan driver with VK_EXT_headless_surface"]
fn buffer_slot_reuse_after_collection() {
    let (_scheduler, device) = make_device();
    futures::executor::block_on(device.initialize()).unwrap();

    let descriptor = BufferDescriptor {
        size: 100,
        usage: BufferUsage::TRANSFER_SOURCE,
        visibility: Visibility::Device,
    };

    let first = futures::executor::block_on(device.create_buffer(descriptor)).unwrap();
    futures::executor::block_on(device.destroy_buffer(first)).unwrap();

    // Advance the timeline past the destroy's fence value with one empty
    // frame, then collect.
    futures::executor::block_on(device.prepare_buffers()).unwrap();
    futures::executor::block_on(device.swap_buffers()).unwrap();
    futures::executor::block_on(device.collect_pending_destroy()).unwrap();

    let second = futures::executor::block_on(device.create_buffer(descriptor)).unwrap();
    assert_eq!(second.index(), first.index());
    assert_eq!(second.generation(), first.generation() + 1);

    futures::executor::block_on(device.destroy_buffer(second)).unwrap();
}

#[test]
#[ignore = "requires a vulkan driver with VK_EXT_headless_surface"]
fn sampler_anisotropy_is_clamped() {
    let (_scheduler, device) = make_device();
    futures::executor::block_on(device.initialize()).unwrap();

    let descriptor = SamplerDescriptor {
        anisotropy_enabled: true,
        max_anisotropy: 1024.0,
        ..Default::default()
    };

    match futures::executor::block_on(device.create_sampler(descriptor)) {
        Ok(handle) => {
            let effective = futures::executor::block_on(device.get_sampler_descriptor(handle)).unwrap();
            assert!(effective.max_anisotropy <= 1024.0);
            assert!(effective.max_anisotropy >= 1.0);

            futures::executor::block_on(device.destroy_sampler(handle)).unwrap();
        }
        Err(Error::FeatureNotSupported) => {
            // Device without anisotropy support, the rejection is the
            // specified behaviour.
        }
        Err(err) => panic!("unexpected sampler creation error {:?}", err),
    }
}

#[test]
#[ignore = "requires a vulkan driver with VK_EXT_headless_surface"]
fn shader_modules_are_shared_by_content() {
    let (_scheduler, device) = make_device();
    futures::executor::block_on(device.initialize()).unwrap();

    let spirv = minimal_spirv();
    let bytes: Vec<u8> = spirv.iter().flat_map(|word| word.to_le_bytes()).collect();
    let descriptor = ShaderModuleDescriptor {
        stage: ShaderStage::Vertex,
        spirv,
        hash: fnv1a_64(&bytes),
    };

    let first = futures::executor::block_on(device.create_shader_module(descriptor.clone())).unwrap();
    let second = futures::executor::block_on(device.create_shader_module(descriptor)).unwrap();
    assert_eq!(first, second);

    futures::executor::block_on(device.destroy_shader_module(first)).unwrap();
    futures::executor::block_on(device.destroy_shader_module(second)).unwrap();

    futures::executor::block_on(device.prepare_buffers()).unwrap();
    futures::executor::block_on(device.swap_buffers()).unwrap();
    futures::executor::block_on(device.collect_pending_destroy()).unwrap();
}

#[test]
#[ignore = "requires a vulkan driver with VK_EXT_headless_surface"]
fn empty_frame_loop() {
    let (_scheduler, device) = make_device();
    futures::executor::block_on(device.initialize()).unwrap();

    let buffer = futures::executor::block_on(device.create_buffer(BufferDescriptor {
        size: 256,
        usage: BufferUsage::VERTEX | BufferUsage::TRANSFER_DESTINATION,
        visibility: Visibility::Device,
    })).unwrap();

    for _ in 0..4 {
        futures::executor::block_on(device.prepare_buffers()).unwrap();
        futures::executor::block_on(device.swap_buffers()).unwrap();
    }

    // Live objects stay addressable across the whole loop, the shutdown
    // path reclaims them.
    futures::executor::block_on(device.destroy_buffer(buffer)).unwrap();
}
