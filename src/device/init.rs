//! The device initialization pipeline.
//!
//! Runs on the device's Initialize lane. Each step may fail with
//! [`Error::InternalError`] which aborts the whole sequence.

use std::collections::HashSet;
use std::ffi::{CStr, CString};
use std::sync::Arc;

use ash::extensions::{ext, khr};
use ash::prelude::VkResult;
use ash::vk;
use parking_lot::Mutex;

use crate::device::alloc::DeviceAllocator;
use crate::device::debug::{
    debug_utils_messenger_callback_wrapper, DebugMessengerCallback, DebugUtilsMessengerWrapper,
};
use crate::device::surface::SurfaceProvider;
use crate::error::Error;

const ENGINE_NAME: &[u8] = b"ember\0";
const VALIDATION_LAYER_NAME: &[u8] = b"VK_LAYER_KHRONOS_validation\0";

const DISCRETE_GPU_SCORE: i32 = 200;
const INTEGRATED_GPU_SCORE: i32 = 50;

/// A wrapper around vulkan queues which provides thread safe access to a
/// queue.
#[derive(Clone)]
pub struct DeviceQueue(Arc<DeviceQueueImpl>);

struct DeviceQueueImpl {
    queue: Mutex<vk::Queue>,
    family: u32,
}

impl DeviceQueue {
    fn new(queue: vk::Queue, family: u32) -> Self {
        Self(Arc::new(DeviceQueueImpl {
            queue: Mutex::new(queue),
            family,
        }))
    }

    pub fn get_family(&self) -> u32 {
        self.0.family
    }

    /// Performs a thread safe vkQueueSubmit call.
    pub fn submit(&self, device: &ash::Device, submits: &[vk::SubmitInfo], fence: vk::Fence) -> VkResult<()> {
        let guard = self.0.queue.lock();
        unsafe { device.queue_submit(*guard, submits, fence) }
    }

    /// Performs a thread safe vkQueuePresentKHR call. Returns true if the
    /// swapchain is suboptimal.
    pub fn present(&self, swapchain_fn: &khr::Swapchain, present_info: &vk::PresentInfoKHR) -> VkResult<bool> {
        let guard = self.0.queue.lock();
        unsafe { swapchain_fn.queue_present(*guard, present_info) }
    }
}

pub(crate) struct DebugUtilsState {
    pub debug_utils_fn: ext::DebugUtils,
    pub messenger: vk::DebugUtilsMessengerEXT,
    // The instance stores a raw pointer to this wrapper as callback user
    // data, it must stay alive for the lifetime of the messenger.
    _wrapper: Box<DebugUtilsMessengerWrapper>,
}

/// Everything about the device that never changes after initialization.
///
/// Shared by every lane. The mutable parts of the device (swapchain, frame
/// sync, slot storages) live outside of this struct, each owned by its lane.
pub(crate) struct DeviceCore {
    // Never read back, but the instance and device function pointers are
    // loaded from it so it must live exactly as long as they do.
    pub _entry: ash::Entry,
    pub instance: ash::Instance,
    pub debug_utils: Option<DebugUtilsState>,
    pub surface_fn: khr::Surface,
    pub surface: vk::SurfaceKHR,
    pub physical_device: vk::PhysicalDevice,
    pub limits: vk::PhysicalDeviceLimits,
    pub enabled_features: vk::PhysicalDeviceFeatures,
    pub timeline_semaphore_supported: bool,
    pub device: ash::Device,
    pub swapchain_fn: khr::Swapchain,
    pub graphics_queue: DeviceQueue,
    pub present_queue: DeviceQueue,
    pub separate_queues: bool,
    pub allocator: DeviceAllocator,
    pub descriptor_pool: vk::DescriptorPool,
    pub timeline_semaphore: vk::Semaphore,
    pub pipeline_cache: vk::PipelineCache,
    pub surface_format: vk::SurfaceFormatKHR,
}

/// Builds the immutable part of the device: instance, surface, physical and
/// logical device, queues, allocator, descriptor pool, synchronization
/// primitives and the surface format.
///
/// The caller continues with the render pass, swapchain and per frame
/// resources which stay rebuildable for the lifetime of the device.
pub(crate) fn create_device_core(
    surface_provider: &mut dyn SurfaceProvider,
    enable_validation: bool,
) -> Result<DeviceCore, Error> {
    let entry = unsafe { ash::Entry::load() }.map_err(|err| {
        log::error!("failed to load vulkan entry points: {:?}", err);
        Error::InternalError
    })?;

    let instance_version = match entry.try_enumerate_instance_version().map_err(Error::from)? {
        Some(version) => version,
        None => vk::API_VERSION_1_0,
    };
    if instance_version < vk::API_VERSION_1_3 {
        log::error!(
            "platform supports vulkan {}.{} but 1.3 is required",
            vk::api_version_major(instance_version),
            vk::api_version_minor(instance_version)
        );
        return Err(Error::InternalError);
    }

    let use_debug_utils = enable_validation || cfg!(debug_assertions);

    // Layers are filtered against availability, a missing validation layer
    // only downgrades the debug experience.
    let mut enabled_layers: Vec<*const std::os::raw::c_char> = Vec::new();
    if use_debug_utils {
        let validation_layer = CStr::from_bytes_with_nul(VALIDATION_LAYER_NAME).unwrap();
        let available_layers = entry.enumerate_instance_layer_properties().map_err(|err| {
            log::error!("unable to enumerate instance layer properties: {:?}", err);
            Error::InternalError
        })?;

        let has_validation = available_layers.iter().any(|layer| {
            (unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) }) == validation_layer
        });

        if has_validation {
            log::info!("validation layers enabled");
            enabled_layers.push(validation_layer.as_ptr());
        } else {
            log::warn!("validation requested but VK_LAYER_KHRONOS_validation is not available");
        }
    }

    let available_extensions: HashSet<CString> = entry
        .enumerate_instance_extension_properties(None)
        .map_err(|err| {
            log::error!("unable to enumerate instance extension properties: {:?}", err);
            Error::InternalError
        })?
        .into_iter()
        .map(|ext| CString::from(unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) }))
        .collect();

    let mut required_extensions: Vec<CString> = surface_provider.get_required_instance_extensions();
    for extension in &required_extensions {
        if !available_extensions.contains(extension) {
            log::error!("required vulkan instance extension {:?} is not supported", extension);
            return Err(Error::InternalError);
        }
    }

    let debug_utils_name = CString::from(ext::DebugUtils::name());
    let messenger_supported = available_extensions.contains(&debug_utils_name);
    if use_debug_utils && !messenger_supported {
        log::warn!("debug utils extension not available, validation output is lost");
    }
    let install_messenger = use_debug_utils && messenger_supported;
    if install_messenger {
        required_extensions.push(debug_utils_name);
    }

    let extension_pointers: Vec<*const std::os::raw::c_char> =
        required_extensions.iter().map(|ext| ext.as_ptr()).collect();

    let application_info = vk::ApplicationInfo::builder()
        .engine_name(CStr::from_bytes_with_nul(ENGINE_NAME).unwrap())
        .engine_version(vk::make_api_version(0, 0, 2, 0))
        .application_name(CStr::from_bytes_with_nul(ENGINE_NAME).unwrap())
        .application_version(vk::make_api_version(0, 0, 2, 0))
        .api_version(vk::API_VERSION_1_3);

    // The wrapper must be boxed before instance creation, the create info
    // carries a raw pointer to it.
    let wrapper = Box::new(DebugUtilsMessengerWrapper {
        callback: Box::new(crate::device::debug::RustLogDebugMessenger::new())
            as Box<dyn DebugMessengerCallback>,
    });

    let mut messenger_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
                | vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(debug_utils_messenger_callback_wrapper))
        .user_data(wrapper.as_ref() as *const DebugUtilsMessengerWrapper as *mut std::os::raw::c_void);

    let mut instance_info = vk::InstanceCreateInfo::builder()
        .application_info(&application_info)
        .enabled_layer_names(&enabled_layers)
        .enabled_extension_names(&extension_pointers);
    if install_messenger {
        instance_info = instance_info.push_next(&mut messenger_info);
    }

    let instance = unsafe { entry.create_instance(&instance_info, None) }.map_err(|err| {
        log::error!("vkCreateInstance returned {:?}", err);
        Error::InternalError
    })?;

    let debug_utils = if install_messenger {
        let debug_utils_fn = ext::DebugUtils::new(&entry, &instance);
        match unsafe { debug_utils_fn.create_debug_utils_messenger(&messenger_info, None) } {
            Ok(messenger) => Some(DebugUtilsState {
                debug_utils_fn,
                messenger,
                _wrapper: wrapper,
            }),
            Err(err) => {
                log::warn!("vkCreateDebugUtilsMessengerEXT returned {:?}", err);
                None
            }
        }
    } else {
        None
    };

    // Surface.
    let surface = unsafe { surface_provider.init(&entry, &instance) }.map_err(|err| {
        log::error!("unable to create vulkan window surface: {:?}", err);
        unsafe { destroy_partial(&instance, &debug_utils) };
        err
    })?;
    let surface_fn = khr::Surface::new(&entry, &instance);

    build_core_with_surface(surface_provider, entry, instance, debug_utils, surface_fn, surface)
}

unsafe fn destroy_partial(instance: &ash::Instance, debug_utils: &Option<DebugUtilsState>) {
    if let Some(state) = debug_utils {
        state.debug_utils_fn.destroy_debug_utils_messenger(state.messenger, None);
    }
    instance.destroy_instance(None);
}

fn build_core_with_surface(
    surface_provider: &mut dyn SurfaceProvider,
    entry: ash::Entry,
    instance: ash::Instance,
    debug_utils: Option<DebugUtilsState>,
    surface_fn: khr::Surface,
    surface: vk::SurfaceKHR,
) -> Result<DeviceCore, Error> {
    // Everything below tears the instance and surface down on failure.
    match build_core_inner(&instance, &surface_fn, surface) {
        Ok(parts) => {
            let (
                physical_device,
                limits,
                enabled_features,
                timeline_semaphore_supported,
                device,
                separate_queues,
                graphics_queue,
                present_queue,
                allocator,
                descriptor_pool,
                timeline_semaphore,
                pipeline_cache,
                surface_format,
            ) = parts;

            let swapchain_fn = khr::Swapchain::new(&instance, &device);

            Ok(DeviceCore {
                _entry: entry,
                instance,
                debug_utils,
                surface_fn,
                surface,
                physical_device,
                limits,
                enabled_features,
                timeline_semaphore_supported,
                device,
                swapchain_fn,
                graphics_queue,
                present_queue,
                separate_queues,
                allocator,
                descriptor_pool,
                timeline_semaphore,
                pipeline_cache,
                surface_format,
            })
        }
        Err(err) => {
            // The provider owns the surface, it must tear it down before
            // the instance goes.
            unsafe {
                surface_provider.destroy();
                destroy_partial(&instance, &debug_utils);
            }
            Err(err)
        }
    }
}

type CoreParts = (
    vk::PhysicalDevice,
    vk::PhysicalDeviceLimits,
    vk::PhysicalDeviceFeatures,
    bool,
    ash::Device,
    bool,
    DeviceQueue,
    DeviceQueue,
    DeviceAllocator,
    vk::DescriptorPool,
    vk::Semaphore,
    vk::PipelineCache,
    vk::SurfaceFormatKHR,
);

fn build_core_inner(
    instance: &ash::Instance,
    surface_fn: &khr::Surface,
    surface: vk::SurfaceKHR,
) -> Result<CoreParts, Error> {
    // Physical device.
    let physical_device = pick_physical_device(instance, surface_fn, surface)?;
    let properties = unsafe { instance.get_physical_device_properties(physical_device) };
    let limits = properties.limits;

    // Queue family indices.
    let (graphics_family, present_family) =
        find_graphics_and_present_family(instance, surface_fn, surface, physical_device)?;
    let separate_queues = graphics_family != present_family;

    // Logical device.
    let (device, enabled_features, timeline_semaphore_supported) =
        create_logical_device(instance, physical_device, graphics_family, present_family)?;

    let destroy_device = |device: &ash::Device| unsafe { device.destroy_device(None) };

    // Memory allocator.
    let allocator = match DeviceAllocator::new(
        instance.clone(),
        device.clone(),
        physical_device,
    ) {
        Ok(allocator) => allocator,
        Err(err) => {
            destroy_device(&device);
            return Err(err);
        }
    };

    // Descriptor pool.
    let descriptor_pool = match create_descriptor_pool(&device) {
        Ok(pool) => pool,
        Err(err) => {
            // The allocator owns device memory, it must go before the
            // device does.
            drop(allocator);
            destroy_device(&device);
            return Err(err);
        }
    };

    // Queues.
    let graphics_queue = DeviceQueue::new(
        unsafe { device.get_device_queue(graphics_family, 0) },
        graphics_family,
    );
    let present_queue = DeviceQueue::new(
        unsafe { device.get_device_queue(present_family, 0) },
        present_family,
    );

    // Timeline semaphore, monotonic counter gating deferred destruction.
    let mut timeline_info = vk::SemaphoreTypeCreateInfo::builder()
        .semaphore_type(vk::SemaphoreType::TIMELINE)
        .initial_value(0);
    let semaphore_info = vk::SemaphoreCreateInfo::builder().push_next(&mut timeline_info);
    let timeline_semaphore = match unsafe { device.create_semaphore(&semaphore_info, None) } {
        Ok(semaphore) => semaphore,
        Err(err) => {
            log::error!("vkCreateSemaphore returned {:?} for the timeline semaphore", err);
            unsafe { device.destroy_descriptor_pool(descriptor_pool, None) };
            drop(allocator);
            destroy_device(&device);
            return Err(Error::InternalError);
        }
    };

    // Surface format.
    let surface_format = match pick_surface_format(surface_fn, surface, physical_device) {
        Ok(format) => format,
        Err(err) => {
            unsafe {
                device.destroy_semaphore(timeline_semaphore, None);
                device.destroy_descriptor_pool(descriptor_pool, None);
            }
            drop(allocator);
            destroy_device(&device);
            return Err(err);
        }
    };

    // Pipeline cache.
    let cache_info = vk::PipelineCacheCreateInfo::builder();
    let pipeline_cache = match unsafe { device.create_pipeline_cache(&cache_info, None) } {
        Ok(cache) => cache,
        Err(err) => {
            log::error!("vkCreatePipelineCache returned {:?}", err);
            unsafe {
                device.destroy_semaphore(timeline_semaphore, None);
                device.destroy_descriptor_pool(descriptor_pool, None);
            }
            drop(allocator);
            destroy_device(&device);
            return Err(Error::InternalError);
        }
    };

    Ok((
        physical_device,
        limits,
        enabled_features,
        timeline_semaphore_supported,
        device,
        separate_queues,
        graphics_queue,
        present_queue,
        allocator,
        descriptor_pool,
        timeline_semaphore,
        pipeline_cache,
        surface_format,
    ))
}

/// Scores a physical device. Discrete and integrated gpus are considered,
/// anything else is rejected, and the device must expose a graphics queue
/// family that can present to the surface.
fn rate_physical_device(
    instance: &ash::Instance,
    surface_fn: &khr::Surface,
    surface: vk::SurfaceKHR,
    device: vk::PhysicalDevice,
) -> i32 {
    let properties = unsafe { instance.get_physical_device_properties(device) };

    let mut score = match properties.device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => DISCRETE_GPU_SCORE,
        vk::PhysicalDeviceType::INTEGRATED_GPU => INTEGRATED_GPU_SCORE,
        _ => return 0,
    };

    let families = unsafe { instance.get_physical_device_queue_family_properties(device) };
    let can_present = families.iter().enumerate().any(|(index, family)| {
        family.queue_flags.contains(vk::QueueFlags::GRAPHICS)
            && unsafe {
                surface_fn.get_physical_device_surface_support(device, index as u32, surface)
            }.unwrap_or(false)
    });

    if !can_present {
        score = 0;
    }

    score
}

fn pick_physical_device(
    instance: &ash::Instance,
    surface_fn: &khr::Surface,
    surface: vk::SurfaceKHR,
) -> Result<vk::PhysicalDevice, Error> {
    let devices = unsafe { instance.enumerate_physical_devices() }.map_err(|err| {
        log::error!("vkEnumeratePhysicalDevices returned {:?}", err);
        Error::InternalError
    })?;

    let mut best: Option<(i32, vk::PhysicalDevice)> = None;
    for device in devices {
        let score = rate_physical_device(instance, surface_fn, surface, device);

        let properties = unsafe { instance.get_physical_device_properties(device) };
        let name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) };
        log::debug!(
            "physical device {:?}: type: {:?}, score: {}, maxImageDimension2D: {}, maxSamplerAnisotropy: {}",
            name,
            properties.device_type,
            score,
            properties.limits.max_image_dimension2_d,
            properties.limits.max_sampler_anisotropy
        );

        if score > 0 && best.map(|(best_score, _)| score > best_score).unwrap_or(true) {
            best = Some((score, device));
        }
    }

    best.map(|(_, device)| device).ok_or_else(|| {
        log::error!("unable to find a suitable physical display device");
        Error::InternalError
    })
}

fn find_graphics_and_present_family(
    instance: &ash::Instance,
    surface_fn: &khr::Surface,
    surface: vk::SurfaceKHR,
    physical_device: vk::PhysicalDevice,
) -> Result<(u32, u32), Error> {
    let families = unsafe {
        instance.get_physical_device_queue_family_properties(physical_device)
    };

    let graphics_family = families.iter()
        .position(|family| family.queue_flags.contains(vk::QueueFlags::GRAPHICS))
        .ok_or_else(|| {
            log::error!("physical device has no graphics queue family");
            Error::InternalError
        })? as u32;

    let supports_present = |family: u32| unsafe {
        surface_fn.get_physical_device_surface_support(physical_device, family, surface)
    }.unwrap_or(false);

    // Prefer presenting from the graphics family, fall back to any family
    // that can present.
    if supports_present(graphics_family) {
        return Ok((graphics_family, graphics_family));
    }

    for family in 0..families.len() as u32 {
        if supports_present(family) {
            return Ok((graphics_family, family));
        }
    }

    log::error!("unable to find graphics and present queues on physical display device");
    Err(Error::InternalError)
}

/// Intersects the fixed capability wishlist with what the device reports.
fn build_feature_wishlist(supported: &vk::PhysicalDeviceFeatures) -> vk::PhysicalDeviceFeatures {
    vk::PhysicalDeviceFeatures {
        full_draw_index_uint32: supported.full_draw_index_uint32,
        image_cube_array: supported.image_cube_array,
        independent_blend: supported.independent_blend,
        geometry_shader: supported.geometry_shader,
        tessellation_shader: supported.tessellation_shader,
        sample_rate_shading: supported.sample_rate_shading,
        dual_src_blend: supported.dual_src_blend,
        logic_op: supported.logic_op,
        multi_draw_indirect: supported.multi_draw_indirect,
        draw_indirect_first_instance: supported.draw_indirect_first_instance,
        depth_clamp: supported.depth_clamp,
        depth_bias_clamp: supported.depth_bias_clamp,
        fill_mode_non_solid: supported.fill_mode_non_solid,
        depth_bounds: supported.depth_bounds,
        wide_lines: supported.wide_lines,
        large_points: supported.large_points,
        alpha_to_one: supported.alpha_to_one,
        multi_viewport: supported.multi_viewport,
        sampler_anisotropy: supported.sampler_anisotropy,
        texture_compression_etc2: supported.texture_compression_etc2,
        texture_compression_astc_ldr: supported.texture_compression_astc_ldr,
        texture_compression_bc: supported.texture_compression_bc,
        vertex_pipeline_stores_and_atomics: supported.vertex_pipeline_stores_and_atomics,
        fragment_stores_and_atomics: supported.fragment_stores_and_atomics,
        shader_tessellation_and_geometry_point_size: supported.shader_tessellation_and_geometry_point_size,
        shader_image_gather_extended: supported.shader_image_gather_extended,
        shader_storage_image_extended_formats: supported.shader_storage_image_extended_formats,
        shader_storage_image_read_without_format: supported.shader_storage_image_read_without_format,
        shader_storage_image_write_without_format: supported.shader_storage_image_write_without_format,
        shader_uniform_buffer_array_dynamic_indexing: supported.shader_uniform_buffer_array_dynamic_indexing,
        shader_sampled_image_array_dynamic_indexing: supported.shader_sampled_image_array_dynamic_indexing,
        shader_storage_buffer_array_dynamic_indexing: supported.shader_storage_buffer_array_dynamic_indexing,
        shader_storage_image_array_dynamic_indexing: supported.shader_storage_image_array_dynamic_indexing,
        shader_clip_distance: supported.shader_clip_distance,
        shader_cull_distance: supported.shader_cull_distance,
        shader_float64: supported.shader_float64,
        shader_int64: supported.shader_int64,
        shader_int16: supported.shader_int16,
        shader_resource_min_lod: supported.shader_resource_min_lod,
        variable_multisample_rate: supported.variable_multisample_rate,
        ..Default::default()
    }
}

fn create_logical_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    graphics_family: u32,
    present_family: u32,
) -> Result<(ash::Device, vk::PhysicalDeviceFeatures, bool), Error> {
    let queue_priorities = [1.0f32];
    let mut queue_infos = vec![
        vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(graphics_family)
            .queue_priorities(&queue_priorities)
            .build(),
    ];
    if present_family != graphics_family {
        queue_infos.push(
            vk::DeviceQueueCreateInfo::builder()
                .queue_family_index(present_family)
                .queue_priorities(&queue_priorities)
                .build(),
        );
    }

    // Device extensions, filtered against availability.
    let available_extensions: HashSet<CString> = unsafe {
        instance.enumerate_device_extension_properties(physical_device)
    }.map_err(|err| {
        log::error!("unable to enumerate device extension properties: {:?}", err);
        Error::InternalError
    })?
        .into_iter()
        .map(|ext| CString::from(unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) }))
        .collect();

    let swapchain_name = CString::from(khr::Swapchain::name());
    if !available_extensions.contains(&swapchain_name) {
        log::error!("required vulkan device extension VK_KHR_swapchain is not supported");
        return Err(Error::InternalError);
    }
    let extension_pointers = [swapchain_name.as_ptr()];

    // Core features: the fixed wishlist intersected with reported support.
    let supported = unsafe { instance.get_physical_device_features(physical_device) };
    let enabled_features = build_feature_wishlist(&supported);

    // Vulkan 1.2 features, of which only timelineSemaphore matters here.
    let mut supported12 = vk::PhysicalDeviceVulkan12Features::default();
    let mut features2 = vk::PhysicalDeviceFeatures2::builder().push_next(&mut supported12);
    unsafe { instance.get_physical_device_features2(physical_device, &mut features2) };

    let timeline_semaphore_supported = supported12.timeline_semaphore != 0;
    if !timeline_semaphore_supported {
        log::warn!("timelineSemaphore feature not supported by this device");
    }

    let mut enabled12 = vk::PhysicalDeviceVulkan12Features::builder()
        .timeline_semaphore(timeline_semaphore_supported);

    let device_info = vk::DeviceCreateInfo::builder()
        .queue_create_infos(&queue_infos)
        .enabled_extension_names(&extension_pointers)
        .enabled_features(&enabled_features)
        .push_next(&mut enabled12);

    let device = unsafe {
        instance.create_device(physical_device, &device_info, None)
    }.map_err(|err| {
        log::error!("vkCreateDevice returned {:?}", err);
        Error::InternalError
    })?;

    Ok((device, enabled_features, timeline_semaphore_supported))
}

fn create_descriptor_pool(device: &ash::Device) -> Result<vk::DescriptorPool, Error> {
    const POOL_SIZE: u32 = 1024;

    let pool_sizes = [
        vk::DescriptorPoolSize { ty: vk::DescriptorType::UNIFORM_BUFFER, descriptor_count: POOL_SIZE },
        vk::DescriptorPoolSize { ty: vk::DescriptorType::STORAGE_BUFFER, descriptor_count: POOL_SIZE },
        vk::DescriptorPoolSize { ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER, descriptor_count: POOL_SIZE },
        vk::DescriptorPoolSize { ty: vk::DescriptorType::SAMPLED_IMAGE, descriptor_count: POOL_SIZE },
        vk::DescriptorPoolSize { ty: vk::DescriptorType::STORAGE_IMAGE, descriptor_count: POOL_SIZE },
    ];

    let info = vk::DescriptorPoolCreateInfo::builder()
        .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
        .max_sets(POOL_SIZE)
        .pool_sizes(&pool_sizes);

    unsafe { device.create_descriptor_pool(&info, None) }.map_err(|err| {
        log::error!("vkCreateDescriptorPool returned {:?}", err);
        Error::InternalError
    })
}

/// Picks the surface format, preferring 8 bit rgba variants with the sRGB
/// nonlinear color space.
fn pick_surface_format(
    surface_fn: &khr::Surface,
    surface: vk::SurfaceKHR,
    physical_device: vk::PhysicalDevice,
) -> Result<vk::SurfaceFormatKHR, Error> {
    const PREFERRED_FORMATS: [vk::Format; 4] = [
        vk::Format::B8G8R8A8_UNORM,
        vk::Format::R8G8B8A8_UNORM,
        vk::Format::B8G8R8_UNORM,
        vk::Format::R8G8B8_UNORM,
    ];

    let formats = unsafe {
        surface_fn.get_physical_device_surface_formats(physical_device, surface)
    }.map_err(|err| {
        log::error!("unable to query surface formats: {:?}", err);
        Error::InternalError
    })?;

    if formats.is_empty() {
        log::error!("surface reports no formats");
        return Err(Error::InternalError);
    }

    if formats.len() == 1 && formats[0].format == vk::Format::UNDEFINED {
        // The surface does not care, pick our favourite.
        return Ok(vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        });
    }

    for preferred in PREFERRED_FORMATS {
        if let Some(format) = formats.iter().find(|format| {
            format.format == preferred && format.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        }) {
            return Ok(*format);
        }
    }

    Ok(formats[0])
}

/// Creates the primary render pass: a single color attachment cleared on
/// load, stored on completion and handed to the presentation engine.
pub(crate) fn create_primary_render_pass(core: &DeviceCore) -> Result<vk::RenderPass, Error> {
    let attachments = [
        vk::AttachmentDescription::builder()
            .format(core.surface_format.format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)
            .build(),
    ];

    let color_attachments = [
        vk::AttachmentReference {
            attachment: 0,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        },
    ];

    let subpasses = [
        vk::SubpassDescription::builder()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_attachments)
            .build(),
    ];

    let dependencies = [
        vk::SubpassDependency {
            src_subpass: vk::SUBPASS_EXTERNAL,
            dst_subpass: 0,
            src_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            dst_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            src_access_mask: vk::AccessFlags::NONE,
            dst_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            dependency_flags: vk::DependencyFlags::empty(),
        },
    ];

    let info = vk::RenderPassCreateInfo::builder()
        .attachments(&attachments)
        .subpasses(&subpasses)
        .dependencies(&dependencies);

    unsafe { core.device.create_render_pass(&info, None) }.map_err(|err| {
        log::error!("unable to create primary render pass: {:?}", err);
        Error::InternalError
    })
}

/// Picks the present mode preferring MAILBOX over IMMEDIATE over FIFO.
pub(crate) fn pick_present_mode(present_modes: &[vk::PresentModeKHR]) -> vk::PresentModeKHR {
    let mut picked = vk::PresentModeKHR::FIFO;
    for present_mode in present_modes {
        if *present_mode == vk::PresentModeKHR::MAILBOX {
            return vk::PresentModeKHR::MAILBOX;
        }
        if *present_mode == vk::PresentModeKHR::IMMEDIATE {
            picked = vk::PresentModeKHR::IMMEDIATE;
        }
    }
    picked
}

/// Picks the composite alpha mode by support priority.
pub(crate) fn pick_composite_alpha(
    capabilities: &vk::SurfaceCapabilitiesKHR,
) -> vk::CompositeAlphaFlagsKHR {
    let supported = capabilities.supported_composite_alpha;

    if supported.contains(vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED) {
        vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED
    } else if supported.contains(vk::CompositeAlphaFlagsKHR::POST_MULTIPLIED) {
        vk::CompositeAlphaFlagsKHR::POST_MULTIPLIED
    } else if supported.contains(vk::CompositeAlphaFlagsKHR::INHERIT) {
        vk::CompositeAlphaFlagsKHR::INHERIT
    } else {
        vk::CompositeAlphaFlagsKHR::OPAQUE
    }
}

/// Picks the surface transform, preferring identity.
pub(crate) fn pick_pre_transform(
    capabilities: &vk::SurfaceCapabilitiesKHR,
) -> vk::SurfaceTransformFlagsKHR {
    if capabilities.supported_transforms.contains(vk::SurfaceTransformFlagsKHR::IDENTITY) {
        vk::SurfaceTransformFlagsKHR::IDENTITY
    } else {
        capabilities.current_transform
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn present_mode_priority() {
        assert_eq!(
            pick_present_mode(&[vk::PresentModeKHR::FIFO]),
            vk::PresentModeKHR::FIFO
        );
        assert_eq!(
            pick_present_mode(&[vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE]),
            vk::PresentModeKHR::IMMEDIATE
        );
        assert_eq!(
            pick_present_mode(&[
                vk::PresentModeKHR::IMMEDIATE,
                vk::PresentModeKHR::MAILBOX,
                vk::PresentModeKHR::FIFO,
            ]),
            vk::PresentModeKHR::MAILBOX
        );
    }

    #[test]
    fn composite_alpha_priority() {
        let mut capabilities = vk::SurfaceCapabilitiesKHR::default();

        capabilities.supported_composite_alpha = vk::CompositeAlphaFlagsKHR::OPAQUE;
        assert_eq!(pick_composite_alpha(&capabilities), vk::CompositeAlphaFlagsKHR::OPAQUE);

        capabilities.supported_composite_alpha =
            vk::CompositeAlphaFlagsKHR::OPAQUE | vk::CompositeAlphaFlagsKHR::POST_MULTIPLIED;
        assert_eq!(pick_composite_alpha(&capabilities), vk::CompositeAlphaFlagsKHR::POST_MULTIPLIED);

        capabilities.supported_composite_alpha = vk::CompositeAlphaFlagsKHR::OPAQUE
            | vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED
            | vk::CompositeAlphaFlagsKHR::POST_MULTIPLIED
            | vk::CompositeAlphaFlagsKHR::INHERIT;
        assert_eq!(pick_composite_alpha(&capabilities), vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED);
    }
}
