//! The vulkan implementation of the rendering device.
//!
//! All Vulkan handles are owned here. Object creation and destruction are
//! serialized per type on dedicated strand lanes; the frame loop and the
//! swapchain live on the Initialize lane; collection of deferred destroys is
//! coordinated from the Cleanup lane which hops onto each owning lane.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use ash::vk;
use async_trait::async_trait;
use parking_lot::Mutex;

use crate::device::alloc::{buffer_memory_location, Allocation};
use crate::device::init::{self, DeviceCore};
use crate::device::slots::SlotStore;
use crate::device::surface::SurfaceProvider;
use crate::device::types::*;
use crate::device::RenderingDevice;
use crate::error::Error;
use crate::scheduler::{Scheduler, StrandGroup, StrandLanes, POLL_INTERVAL};
use crate::util::hash::hash_combine;

/// Number of frames the CPU may record ahead of the GPU.
pub const FRAMES_IN_FLIGHT: usize = 2;

/// Serial lanes of the rendering device.
#[derive(Copy, Clone, Debug)]
pub enum DeviceLanes {
    Initialize,
    Buffer,
    Sampler,
    Shader,
    Cleanup,
}

impl StrandLanes for DeviceLanes {
    const COUNT: usize = 5;
    const NAME: &'static str = "device";

    fn index(self) -> usize {
        self as usize
    }
}

struct BufferData {
    buffer: vk::Buffer,
    allocation: Allocation,
    size: u64,
}

struct ImageData {
    image: vk::Image,
    view: vk::ImageView,
    allocation: Allocation,
}

struct SamplerData {
    sampler: vk::Sampler,
    // The effective parameters, after clamping against device limits.
    descriptor: SamplerDescriptor,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct ShaderModuleKey {
    stage: ShaderStage,
    hash: u64,
}

// Keyed by content, not identity: the stage is folded into the SPIR-V
// content hash.
impl Hash for ShaderModuleKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(hash_combine(self.stage.table_index() as u64, self.hash));
    }
}

struct ShaderModuleData {
    module: vk::ShaderModule,
    stage: ShaderStage,
    key: ShaderModuleKey,
    reference_counter: usize,
}

/// Owned by the Buffer lane.
struct BufferStores {
    buffers: SlotStore<BufferData>,
    images: SlotStore<ImageData>,
}

/// Owned by the Sampler lane.
struct SamplerStore {
    samplers: SlotStore<SamplerData>,
}

/// Owned by the Shader lane.
struct ShaderStore {
    modules: SlotStore<ShaderModuleData>,
    cache: HashMap<ShaderModuleKey, ShaderModuleHandle>,
}

struct FrameSync {
    image_available: vk::Semaphore,
    render_finished: vk::Semaphore,
    in_flight: vk::Fence,
    command_pool: vk::CommandPool,
    command_buffers: Vec<vk::CommandBuffer>,
}

struct SwapchainResources {
    swapchain: vk::SwapchainKHR,
    image_views: Vec<vk::ImageView>,
    framebuffers: Vec<vk::Framebuffer>,
    extent: vk::Extent2D,
    current_image: u32,
}

/// Owned by the Initialize lane.
struct PresentState {
    render_pass: Option<vk::RenderPass>,
    swapchain: Option<SwapchainResources>,
    frames: Vec<FrameSync>,
    // Which frame's fence currently guards each swapchain image.
    images_in_flight: Vec<Option<usize>>,
    current_frame: usize,
}

struct DeviceInner {
    scheduler: Arc<Scheduler>,
    strands: StrandGroup<DeviceLanes>,
    surface_provider: Mutex<Box<dyn SurfaceProvider>>,
    enable_validation: bool,

    core: Mutex<Option<Arc<DeviceCore>>>,
    present: Mutex<PresentState>,
    buffers: Mutex<BufferStores>,
    samplers: Mutex<SamplerStore>,
    shaders: Mutex<ShaderStore>,

    // The value the next queue submit will signal on the timeline
    // semaphore. The semaphore itself starts at 0, so deferred destroys
    // recorded before the first submit drain after that submit completes.
    timeline_value: AtomicU64,
}

impl DeviceInner {
    fn get_core(&self) -> Result<Arc<DeviceCore>, Error> {
        self.core.lock().clone().ok_or(Error::FailedPreconditionError)
    }
}

/// The vulkan rendering device.
///
/// Cheap to clone; all clones share one device. The device shuts down when
/// the last clone is dropped, which must happen outside the scheduler's
/// worker threads and while no operations are in flight.
#[derive(Clone)]
pub struct VulkanDevice {
    inner: Arc<DeviceInner>,
}

impl VulkanDevice {
    pub fn new(
        scheduler: Arc<Scheduler>,
        surface_provider: Box<dyn SurfaceProvider>,
        enable_validation: bool,
    ) -> Self {
        let strands = scheduler.make_strands::<DeviceLanes>();

        Self {
            inner: Arc::new(DeviceInner {
                scheduler,
                strands,
                surface_provider: Mutex::new(surface_provider),
                enable_validation,
                core: Mutex::new(None),
                present: Mutex::new(PresentState {
                    render_pass: None,
                    swapchain: None,
                    frames: Vec::new(),
                    images_in_flight: Vec::new(),
                    current_frame: 0,
                }),
                buffers: Mutex::new(BufferStores {
                    buffers: SlotStore::new(),
                    images: SlotStore::new(),
                }),
                samplers: Mutex::new(SamplerStore {
                    samplers: SlotStore::new(),
                }),
                shaders: Mutex::new(ShaderStore {
                    modules: SlotStore::new(),
                    cache: HashMap::new(),
                }),
                timeline_value: AtomicU64::new(1),
            }),
        }
    }

    /// The timeline value the next submit will signal. Deferred destroys
    /// recorded now become collectable once the semaphore reaches it.
    pub fn current_timeline_value(&self) -> u64 {
        self.inner.timeline_value.load(Ordering::SeqCst)
    }

    pub async fn initialize(&self) -> Result<(), Error> {
        let inner = self.inner.clone();
        self.inner.strands.get(DeviceLanes::Initialize)
            .dispatch(async move { do_initialize(inner).await })
            .await?
    }

    pub async fn prepare_buffers(&self) -> Result<(), Error> {
        let inner = self.inner.clone();
        self.inner.strands.get(DeviceLanes::Initialize)
            .dispatch(async move { do_prepare_buffers(inner).await })
            .await?
    }

    pub async fn swap_buffers(&self) -> Result<(), Error> {
        let inner = self.inner.clone();
        self.inner.strands.get(DeviceLanes::Initialize)
            .dispatch(async move { do_swap_buffers(inner).await })
            .await?
    }

    pub async fn create_buffer(&self, descriptor: BufferDescriptor) -> Result<BufferHandle, Error> {
        let inner = self.inner.clone();
        self.inner.strands.get(DeviceLanes::Buffer)
            .dispatch(async move { do_create_buffer(inner, descriptor) })
            .await?
    }

    pub async fn destroy_buffer(&self, handle: BufferHandle) -> Result<(), Error> {
        let inner = self.inner.clone();
        self.inner.strands.get(DeviceLanes::Buffer)
            .dispatch(async move { do_destroy_buffer(inner, handle) })
            .await?
    }

    pub async fn create_image(&self, descriptor: ImageDescriptor) -> Result<ImageHandle, Error> {
        let inner = self.inner.clone();
        self.inner.strands.get(DeviceLanes::Buffer)
            .dispatch(async move { do_create_image(inner, descriptor) })
            .await?
    }

    pub async fn destroy_image(&self, handle: ImageHandle) -> Result<(), Error> {
        let inner = self.inner.clone();
        self.inner.strands.get(DeviceLanes::Buffer)
            .dispatch(async move { do_destroy_image(inner, handle) })
            .await?
    }

    pub async fn create_sampler(&self, descriptor: SamplerDescriptor) -> Result<SamplerHandle, Error> {
        let inner = self.inner.clone();
        self.inner.strands.get(DeviceLanes::Sampler)
            .dispatch(async move { do_create_sampler(inner, descriptor) })
            .await?
    }

    pub async fn destroy_sampler(&self, handle: SamplerHandle) -> Result<(), Error> {
        let inner = self.inner.clone();
        self.inner.strands.get(DeviceLanes::Sampler)
            .dispatch(async move { do_destroy_sampler(inner, handle) })
            .await?
    }

    /// Returns the effective parameters of a live sampler, after clamping.
    pub async fn get_sampler_descriptor(&self, handle: SamplerHandle) -> Result<SamplerDescriptor, Error> {
        let inner = self.inner.clone();
        self.inner.strands.get(DeviceLanes::Sampler)
            .dispatch(async move {
                let store = inner.samplers.lock();
                store.samplers.get(handle.index(), handle.generation())
                    .map(|data| data.descriptor)
                    .ok_or(Error::NotFoundError)
            })
            .await?
    }

    pub async fn create_shader_module(&self, descriptor: ShaderModuleDescriptor) -> Result<ShaderModuleHandle, Error> {
        let inner = self.inner.clone();
        self.inner.strands.get(DeviceLanes::Shader)
            .dispatch(async move { do_create_shader_module(inner, descriptor) })
            .await?
    }

    pub async fn destroy_shader_module(&self, handle: ShaderModuleHandle) -> Result<(), Error> {
        let inner = self.inner.clone();
        self.inner.strands.get(DeviceLanes::Shader)
            .dispatch(async move { do_destroy_shader_module(inner, handle) })
            .await?
    }

    /// Destroys every object whose recorded fence value the timeline
    /// semaphore has reached, returning their slots to the free lists.
    pub async fn collect_pending_destroy(&self) -> Result<(), Error> {
        let inner = self.inner.clone();
        self.inner.strands.get(DeviceLanes::Cleanup)
            .dispatch(async move { do_collect_pending_destroy(inner).await })
            .await?
    }
}

#[async_trait]
impl RenderingDevice for VulkanDevice {
    async fn initialize(&self) -> Result<(), Error> {
        VulkanDevice::initialize(self).await
    }

    async fn prepare_buffers(&self) -> Result<(), Error> {
        VulkanDevice::prepare_buffers(self).await
    }

    async fn swap_buffers(&self) -> Result<(), Error> {
        VulkanDevice::swap_buffers(self).await
    }

    async fn create_buffer(&self, descriptor: BufferDescriptor) -> Result<BufferHandle, Error> {
        VulkanDevice::create_buffer(self, descriptor).await
    }

    async fn destroy_buffer(&self, handle: BufferHandle) -> Result<(), Error> {
        VulkanDevice::destroy_buffer(self, handle).await
    }

    async fn create_image(&self, descriptor: ImageDescriptor) -> Result<ImageHandle, Error> {
        VulkanDevice::create_image(self, descriptor).await
    }

    async fn destroy_image(&self, handle: ImageHandle) -> Result<(), Error> {
        VulkanDevice::destroy_image(self, handle).await
    }

    async fn create_sampler(&self, descriptor: SamplerDescriptor) -> Result<SamplerHandle, Error> {
        VulkanDevice::create_sampler(self, descriptor).await
    }

    async fn destroy_sampler(&self, handle: SamplerHandle) -> Result<(), Error> {
        VulkanDevice::destroy_sampler(self, handle).await
    }

    async fn create_shader_module(&self, descriptor: ShaderModuleDescriptor) -> Result<ShaderModuleHandle, Error> {
        VulkanDevice::create_shader_module(self, descriptor).await
    }

    async fn destroy_shader_module(&self, handle: ShaderModuleHandle) -> Result<(), Error> {
        VulkanDevice::destroy_shader_module(self, handle).await
    }
}

async fn do_initialize(inner: Arc<DeviceInner>) -> Result<(), Error> {
    if inner.core.lock().is_some() {
        log::warn!("device initialize called twice");
        return Err(Error::AlreadyExistsError);
    }

    let core = {
        let mut provider = inner.surface_provider.lock();
        init::create_device_core(provider.as_mut(), inner.enable_validation)?
    };
    let core = Arc::new(core);

    let render_pass = match init::create_primary_render_pass(&core) {
        Ok(render_pass) => render_pass,
        Err(err) => {
            destroy_core(&inner, core);
            return Err(err);
        }
    };

    let mut frames = match create_frame_sync_objects(&core) {
        Ok(frames) => frames,
        Err(err) => {
            unsafe { core.device.destroy_render_pass(render_pass, None) };
            destroy_core(&inner, core);
            return Err(err);
        }
    };

    let swapchain = match create_swapchain_resources(&inner, &core, render_pass, &mut frames).await {
        Ok(swapchain) => swapchain,
        Err(err) => {
            unsafe {
                destroy_frame_sync_objects(&core, &mut frames);
                core.device.destroy_render_pass(render_pass, None);
            }
            destroy_core(&inner, core);
            return Err(err);
        }
    };

    let image_count = swapchain.image_views.len();

    {
        let mut present = inner.present.lock();
        present.render_pass = Some(render_pass);
        present.swapchain = Some(swapchain);
        present.frames = frames;
        present.images_in_flight = vec![None; image_count];
        present.current_frame = 0;
    }
    log::info!(
        "rendering device initialized; separate queues: {}, timeline semaphores: {}",
        core.separate_queues, core.timeline_semaphore_supported
    );
    *inner.core.lock() = Some(core);

    Ok(())
}

/// Tears down a device core that never became visible to other lanes.
fn destroy_core(inner: &DeviceInner, core: Arc<DeviceCore>) {
    let core = match Arc::try_unwrap(core) {
        Ok(core) => core,
        Err(_) => {
            log::error!("partially initialized device core still referenced, leaking");
            return;
        }
    };

    unsafe {
        core.device.destroy_pipeline_cache(core.pipeline_cache, None);
        core.device.destroy_semaphore(core.timeline_semaphore, None);
        core.device.destroy_descriptor_pool(core.descriptor_pool, None);

        // The allocator owns device memory, it must go before the device.
        drop(core.allocator);
        core.device.destroy_device(None);

        inner.surface_provider.lock().destroy();
        if let Some(state) = &core.debug_utils {
            state.debug_utils_fn.destroy_debug_utils_messenger(state.messenger, None);
        }
        core.instance.destroy_instance(None);
    }
}

fn create_frame_sync_objects(core: &DeviceCore) -> Result<Vec<FrameSync>, Error> {
    let mut frames: Vec<FrameSync> = Vec::with_capacity(FRAMES_IN_FLIGHT);

    for frame_index in 0..FRAMES_IN_FLIGHT {
        match create_one_frame_sync(core) {
            Ok(frame) => frames.push(frame),
            Err(err) => {
                log::error!("unable to create sync objects for frame {}: {:?}", frame_index, err);
                unsafe { destroy_frame_sync_objects(core, &mut frames) };
                return Err(Error::InternalError);
            }
        }
    }

    Ok(frames)
}

fn create_one_frame_sync(core: &DeviceCore) -> Result<FrameSync, vk::Result> {
    let fence_info = vk::FenceCreateInfo::builder()
        .flags(vk::FenceCreateFlags::SIGNALED);
    let in_flight = unsafe { core.device.create_fence(&fence_info, None) }?;

    let semaphore_info = vk::SemaphoreCreateInfo::builder();
    let image_available = match unsafe { core.device.create_semaphore(&semaphore_info, None) } {
        Ok(semaphore) => semaphore,
        Err(err) => {
            unsafe { core.device.destroy_fence(in_flight, None) };
            return Err(err);
        }
    };
    let render_finished = match unsafe { core.device.create_semaphore(&semaphore_info, None) } {
        Ok(semaphore) => semaphore,
        Err(err) => {
            unsafe {
                core.device.destroy_semaphore(image_available, None);
                core.device.destroy_fence(in_flight, None);
            }
            return Err(err);
        }
    };

    let pool_info = vk::CommandPoolCreateInfo::builder()
        .flags(
            vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER
                | vk::CommandPoolCreateFlags::TRANSIENT,
        )
        .queue_family_index(core.graphics_queue.get_family());
    let command_pool = match unsafe { core.device.create_command_pool(&pool_info, None) } {
        Ok(pool) => pool,
        Err(err) => {
            unsafe {
                core.device.destroy_semaphore(render_finished, None);
                core.device.destroy_semaphore(image_available, None);
                core.device.destroy_fence(in_flight, None);
            }
            return Err(err);
        }
    };

    let buffer_info = vk::CommandBufferAllocateInfo::builder()
        .command_pool(command_pool)
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_buffer_count(1);
    let command_buffers = match unsafe { core.device.allocate_command_buffers(&buffer_info) } {
        Ok(buffers) => buffers,
        Err(err) => {
            unsafe {
                core.device.destroy_command_pool(command_pool, None);
                core.device.destroy_semaphore(render_finished, None);
                core.device.destroy_semaphore(image_available, None);
                core.device.destroy_fence(in_flight, None);
            }
            return Err(err);
        }
    };

    Ok(FrameSync {
        image_available,
        render_finished,
        in_flight,
        command_pool,
        command_buffers,
    })
}

unsafe fn destroy_frame_sync_objects(core: &DeviceCore, frames: &mut Vec<FrameSync>) {
    for frame in frames.drain(..) {
        if !frame.command_buffers.is_empty() {
            core.device.free_command_buffers(frame.command_pool, &frame.command_buffers);
        }
        core.device.destroy_command_pool(frame.command_pool, None);
        core.device.destroy_semaphore(frame.image_available, None);
        core.device.destroy_semaphore(frame.render_finished, None);
        core.device.destroy_fence(frame.in_flight, None);
    }
}

/// Builds the swapchain, its views and framebuffers, and refreshes the per
/// frame image available semaphores.
///
/// Blocks (by polling) while the window reports a zero extent.
async fn create_swapchain_resources(
    inner: &Arc<DeviceInner>,
    core: &Arc<DeviceCore>,
    render_pass: vk::RenderPass,
    frames: &mut [FrameSync],
) -> Result<SwapchainResources, Error> {
    // The window may be mid resize or minimized. The provider guarantees the
    // extent eventually becomes nonzero.
    let window_extent = loop {
        let extent = inner.surface_provider.lock().get_pixel_extent();
        if !extent.is_zero() {
            break extent;
        }
        inner.scheduler.sleep(POLL_INTERVAL).await;
    };

    let capabilities = unsafe {
        core.surface_fn.get_physical_device_surface_capabilities(core.physical_device, core.surface)
    }.map_err(|err| {
        log::error!("unable to query surface capabilities: {:?}", err);
        Error::InternalError
    })?;

    let extent = if capabilities.current_extent.width != u32::MAX {
        // The surface dictates the extent, the swapchain must match.
        capabilities.current_extent
    } else {
        vk::Extent2D {
            width: window_extent.width.clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ),
            height: window_extent.height.clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ),
        }
    };

    let present_modes = unsafe {
        core.surface_fn.get_physical_device_surface_present_modes(core.physical_device, core.surface)
    }.map_err(|err| {
        log::error!("unable to query surface present modes: {:?}", err);
        Error::InternalError
    })?;

    let present_mode = init::pick_present_mode(&present_modes);
    let pre_transform = init::pick_pre_transform(&capabilities);
    let composite_alpha = init::pick_composite_alpha(&capabilities);

    log::debug!(
        "creating swapchain; extent: {}x{}, format: {:?}, present_mode: {:?}",
        extent.width, extent.height, core.surface_format.format, present_mode
    );

    let swapchain_info = vk::SwapchainCreateInfoKHR::builder()
        .surface(core.surface)
        .min_image_count(capabilities.min_image_count)
        .image_format(core.surface_format.format)
        .image_color_space(core.surface_format.color_space)
        .image_extent(extent)
        .image_array_layers(1)
        .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_SRC)
        .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        .pre_transform(pre_transform)
        .composite_alpha(composite_alpha)
        .present_mode(present_mode)
        .clipped(true);

    let swapchain = unsafe {
        core.swapchain_fn.create_swapchain(&swapchain_info, None)
    }.map_err(|err| {
        log::error!("unable to create swapchain: {:?}", err);
        Error::InternalError
    })?;

    let mut resources = SwapchainResources {
        swapchain,
        image_views: Vec::new(),
        framebuffers: Vec::new(),
        extent,
        current_image: 0,
    };

    let images = match unsafe { core.swapchain_fn.get_swapchain_images(swapchain) } {
        Ok(images) => images,
        Err(err) => {
            log::error!("unable to query swapchain images: {:?}", err);
            unsafe { destroy_swapchain_resources(core, &mut resources) };
            return Err(Error::InternalError);
        }
    };

    for image in images {
        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(core.surface_format.format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });

        match unsafe { core.device.create_image_view(&view_info, None) } {
            Ok(view) => resources.image_views.push(view),
            Err(err) => {
                log::error!("unable to create swapchain image view: {:?}", err);
                unsafe { destroy_swapchain_resources(core, &mut resources) };
                return Err(Error::InternalError);
            }
        }
    }

    for view in &resources.image_views {
        let attachments = [*view];
        let framebuffer_info = vk::FramebufferCreateInfo::builder()
            .render_pass(render_pass)
            .attachments(&attachments)
            .width(extent.width)
            .height(extent.height)
            .layers(1);

        match unsafe { core.device.create_framebuffer(&framebuffer_info, None) } {
            Ok(framebuffer) => resources.framebuffers.push(framebuffer),
            Err(err) => {
                log::error!("unable to create swapchain framebuffer: {:?}", err);
                unsafe { destroy_swapchain_resources(core, &mut resources) };
                return Err(Error::InternalError);
            }
        }
    }

    // Refresh the acquire semaphores, the old instances may have pending
    // signal operations from the torn down swapchain.
    for frame in frames.iter_mut() {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        match unsafe { core.device.create_semaphore(&semaphore_info, None) } {
            Ok(semaphore) => {
                unsafe { core.device.destroy_semaphore(frame.image_available, None) };
                frame.image_available = semaphore;
            }
            Err(err) => {
                log::error!("unable to refresh image available semaphore: {:?}", err);
                unsafe { destroy_swapchain_resources(core, &mut resources) };
                return Err(Error::InternalError);
            }
        }
    }

    Ok(resources)
}

unsafe fn destroy_swapchain_resources(core: &DeviceCore, resources: &mut SwapchainResources) {
    for framebuffer in resources.framebuffers.drain(..) {
        core.device.destroy_framebuffer(framebuffer, None);
    }
    for view in resources.image_views.drain(..) {
        core.device.destroy_image_view(view, None);
    }
    if resources.swapchain != vk::SwapchainKHR::null() {
        core.swapchain_fn.destroy_swapchain(resources.swapchain, None);
        resources.swapchain = vk::SwapchainKHR::null();
    }
}

/// Rebuilds the render pass and swapchain after a resize or an out of date
/// report from the presentation engine.
async fn update_swapchain(inner: &Arc<DeviceInner>, core: &Arc<DeviceCore>) -> Result<(), Error> {
    log::debug!("updating swapchain");

    unsafe { core.device.device_wait_idle() }.map_err(|err| {
        log::error!("vkDeviceWaitIdle returned {:?} in update_swapchain", err);
        Error::InternalError
    })?;

    {
        let mut present = inner.present.lock();
        if let Some(mut resources) = present.swapchain.take() {
            unsafe { destroy_swapchain_resources(core, &mut resources) };
        }
        if let Some(render_pass) = present.render_pass.take() {
            unsafe { core.device.destroy_render_pass(render_pass, None) };
        }
    }

    let render_pass = init::create_primary_render_pass(core)?;
    inner.present.lock().render_pass = Some(render_pass);

    // The frames are only touched from this lane, but the lock must not be
    // held across the extent poll, so they are moved out for the rebuild.
    let mut frames = std::mem::take(&mut inner.present.lock().frames);
    let result = create_swapchain_resources(inner, core, render_pass, &mut frames).await;

    let mut present = inner.present.lock();
    present.frames = frames;
    match result {
        Ok(resources) => {
            present.images_in_flight = vec![None; resources.image_views.len()];
            present.swapchain = Some(resources);
            Ok(())
        }
        Err(err) => Err(err),
    }
}

/// Polls a fence with the scheduler timer until it signals. Never blocks a
/// worker thread.
async fn wait_fence_polling(
    inner: &Arc<DeviceInner>,
    core: &Arc<DeviceCore>,
    fence: vk::Fence,
) -> Result<(), Error> {
    loop {
        match unsafe { core.device.wait_for_fences(&[fence], true, 0) } {
            Ok(()) => return Ok(()),
            Err(vk::Result::TIMEOUT) => {
                inner.scheduler.sleep(POLL_INTERVAL).await;
            }
            Err(err) => {
                log::error!("vkWaitForFences returned {:?}", err);
                return Err(Error::InternalError);
            }
        }
    }
}

async fn do_prepare_buffers(inner: Arc<DeviceInner>) -> Result<(), Error> {
    let core = inner.get_core()?;

    let (current_frame, in_flight) = {
        let present = inner.present.lock();
        let frame = &present.frames[present.current_frame];
        (present.current_frame, frame.in_flight)
    };

    wait_fence_polling(&inner, &core, in_flight).await?;

    loop {
        // Re-derived every iteration, updateSwapchain may have replaced the
        // swapchain and the semaphores.
        let (swapchain, image_available) = {
            let present = inner.present.lock();
            let resources = present.swapchain.as_ref().ok_or(Error::FailedPreconditionError)?;
            (resources.swapchain, present.frames[current_frame].image_available)
        };

        let acquired = unsafe {
            core.swapchain_fn.acquire_next_image(swapchain, 0, image_available, vk::Fence::null())
        };

        match acquired {
            Ok((image_index, _suboptimal)) => {
                // Another frame may still be rendering into this image.
                let other_fence = {
                    let present = inner.present.lock();
                    present.images_in_flight[image_index as usize]
                        .map(|frame| present.frames[frame].in_flight)
                };
                if let Some(other_fence) = other_fence {
                    wait_fence_polling(&inner, &core, other_fence).await?;
                }

                {
                    let mut present = inner.present.lock();
                    present.images_in_flight[image_index as usize] = Some(current_frame);
                    if let Some(resources) = present.swapchain.as_mut() {
                        resources.current_image = image_index;
                    }
                }

                unsafe { core.device.reset_fences(&[in_flight]) }.map_err(|err| {
                    log::error!("vkResetFences returned {:?}", err);
                    Error::InternalError
                })?;

                let (command_pool, command_buffers) = {
                    let mut present = inner.present.lock();
                    let frame = &mut present.frames[current_frame];
                    (frame.command_pool, std::mem::take(&mut frame.command_buffers))
                };

                unsafe {
                    core.device.reset_command_pool(command_pool, vk::CommandPoolResetFlags::empty())
                }.map_err(|err| {
                    log::error!("vkResetCommandPool returned {:?}", err);
                    Error::InternalError
                })?;

                if !command_buffers.is_empty() {
                    unsafe { core.device.free_command_buffers(command_pool, &command_buffers) };
                }

                return Ok(());
            }
            Err(vk::Result::NOT_READY) | Err(vk::Result::TIMEOUT) => {
                inner.scheduler.sleep(POLL_INTERVAL).await;
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                update_swapchain(&inner, &core).await?;
            }
            Err(err) => {
                log::error!("vkAcquireNextImageKHR returned {:?}", err);
                return Err(Error::InternalError);
            }
        }
    }
}

async fn do_swap_buffers(inner: Arc<DeviceInner>) -> Result<(), Error> {
    let core = inner.get_core()?;

    let (image_available, render_finished, in_flight, command_buffers, swapchain, image_index) = {
        let present = inner.present.lock();
        let frame = &present.frames[present.current_frame];
        let resources = present.swapchain.as_ref().ok_or(Error::FailedPreconditionError)?;
        (
            frame.image_available,
            frame.render_finished,
            frame.in_flight,
            frame.command_buffers.clone(),
            resources.swapchain,
            resources.current_image,
        )
    };

    let timeline_value = inner.timeline_value.load(Ordering::SeqCst);

    let wait_semaphores = [image_available];
    let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
    let signal_semaphores = [render_finished, core.timeline_semaphore];
    // Values for binary semaphores are ignored but the counts must match.
    let signal_values = [0, timeline_value];

    {
        let mut timeline_info = vk::TimelineSemaphoreSubmitInfo::builder()
            .signal_semaphore_values(&signal_values);

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores)
            .push_next(&mut timeline_info)
            .build();

        core.graphics_queue.submit(&core.device, &[submit_info], in_flight).map_err(|err| {
            log::error!("vkQueueSubmit returned {:?} in swap_buffers", err);
            Error::InternalError
        })?;
    }

    inner.timeline_value.fetch_add(1, Ordering::SeqCst);

    let present_result = {
        let present_wait = [render_finished];
        let swapchains = [swapchain];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&present_wait)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        core.present_queue.present(&core.swapchain_fn, &present_info)
    };

    match present_result {
        Ok(false) => {}
        Ok(true) => {
            // Suboptimal, still presented.
            update_swapchain(&inner, &core).await?;
        }
        Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
            update_swapchain(&inner, &core).await?;
        }
        Err(err) => {
            log::error!("vkQueuePresentKHR returned {:?}", err);
            return Err(Error::InternalError);
        }
    }

    let mut present = inner.present.lock();
    present.current_frame = (present.current_frame + 1) % FRAMES_IN_FLIGHT;

    Ok(())
}

fn do_create_buffer(inner: Arc<DeviceInner>, descriptor: BufferDescriptor) -> Result<BufferHandle, Error> {
    let core = inner.get_core()?;

    let buffer_info = vk::BufferCreateInfo::builder()
        .size(descriptor.size)
        .usage(descriptor.usage.to_vk())
        .sharing_mode(vk::SharingMode::EXCLUSIVE);

    let buffer = unsafe { core.device.create_buffer(&buffer_info, None) }.map_err(|err| {
        log::error!("vkCreateBuffer returned {:?} in create_buffer", err);
        Error::InternalError
    })?;

    let location = buffer_memory_location(descriptor.visibility, descriptor.usage);
    let allocation = match core.allocator.allocate_buffer_memory(buffer, location) {
        Ok(allocation) => allocation,
        Err(err) => {
            unsafe { core.device.destroy_buffer(buffer, None) };
            return Err(err);
        }
    };

    let mut stores = inner.buffers.lock();
    let (index, generation) = stores.buffers.insert(BufferData {
        buffer,
        allocation,
        size: descriptor.size,
    });

    log::debug!(
        "created buffer; size: {}, usage: {:?}, visibility: {:?}, index: {}, generation: {}, storage_size: {}",
        descriptor.size, descriptor.usage, descriptor.visibility, index, generation,
        stores.buffers.len()
    );

    Ok(BufferHandle::new(index, generation))
}

fn do_destroy_buffer(inner: Arc<DeviceInner>, handle: BufferHandle) -> Result<(), Error> {
    let fence_value = inner.timeline_value.load(Ordering::SeqCst);
    let mut stores = inner.buffers.lock();

    log::debug!(
        "destroying buffer; index: {}, handle generation: {}, storage generation: {:?}, fence_value: {}",
        handle.index(), handle.generation(), stores.buffers.generation(handle.index()), fence_value
    );

    if stores.buffers.destroy(handle.index(), handle.generation(), fence_value).is_err() {
        log::trace!("destroy buffer called with stale handle {:?}", handle);
    }

    Ok(())
}

fn do_create_image(inner: Arc<DeviceInner>, descriptor: ImageDescriptor) -> Result<ImageHandle, Error> {
    let core = inner.get_core()?;

    let flags = if descriptor.image_type == ImageType::Cube {
        vk::ImageCreateFlags::CUBE_COMPATIBLE
    } else {
        vk::ImageCreateFlags::empty()
    };

    let tiling = if descriptor.visibility == Visibility::Host {
        vk::ImageTiling::LINEAR
    } else {
        vk::ImageTiling::OPTIMAL
    };

    let image_info = vk::ImageCreateInfo::builder()
        .flags(flags)
        .image_type(vk::ImageType::TYPE_2D)
        .format(descriptor.format.to_vk())
        .extent(vk::Extent3D {
            width: descriptor.extent.width,
            height: descriptor.extent.height,
            depth: 1,
        })
        .mip_levels(descriptor.mip_levels)
        .array_layers(descriptor.array_layers)
        .samples(descriptor.samples.to_vk())
        .tiling(tiling)
        .usage(descriptor.usage.to_vk())
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .initial_layout(vk::ImageLayout::UNDEFINED);

    let image = unsafe { core.device.create_image(&image_info, None) }.map_err(|err| {
        log::error!("vkCreateImage returned {:?} in create_image", err);
        Error::InternalError
    })?;

    let location = if descriptor.visibility == Visibility::Host {
        gpu_allocator::MemoryLocation::CpuToGpu
    } else {
        gpu_allocator::MemoryLocation::GpuOnly
    };

    let allocation = match core.allocator.allocate_image_memory(image, location) {
        Ok(allocation) => allocation,
        Err(err) => {
            unsafe { core.device.destroy_image(image, None) };
            return Err(err);
        }
    };

    let aspect_mask = if descriptor.usage.contains(ImageUsage::DEPTH_STENCIL_ATTACHMENT) {
        vk::ImageAspectFlags::DEPTH
    } else {
        vk::ImageAspectFlags::COLOR
    };
    let view_type = if descriptor.image_type == ImageType::Cube {
        vk::ImageViewType::CUBE
    } else {
        vk::ImageViewType::TYPE_2D
    };

    let view_info = vk::ImageViewCreateInfo::builder()
        .image(image)
        .view_type(view_type)
        .format(descriptor.format.to_vk())
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask,
            base_mip_level: 0,
            level_count: descriptor.mip_levels,
            base_array_layer: 0,
            layer_count: descriptor.array_layers,
        });

    let view = match unsafe { core.device.create_image_view(&view_info, None) } {
        Ok(view) => view,
        Err(err) => {
            log::error!("vkCreateImageView returned {:?} in create_image", err);
            unsafe { core.device.destroy_image(image, None) };
            core.allocator.free(allocation);
            return Err(Error::InternalError);
        }
    };

    let mut stores = inner.buffers.lock();
    let (index, generation) = stores.images.insert(ImageData {
        image,
        view,
        allocation,
    });

    log::debug!(
        "created image; extent: {}x{}, format: {:?}, index: {}, generation: {}",
        descriptor.extent.width, descriptor.extent.height, descriptor.format, index, generation
    );

    Ok(ImageHandle::new(index, generation))
}

fn do_destroy_image(inner: Arc<DeviceInner>, handle: ImageHandle) -> Result<(), Error> {
    let fence_value = inner.timeline_value.load(Ordering::SeqCst);
    let mut stores = inner.buffers.lock();

    log::debug!(
        "destroying image; index: {}, handle generation: {}, fence_value: {}",
        handle.index(), handle.generation(), fence_value
    );

    if stores.images.destroy(handle.index(), handle.generation(), fence_value).is_err() {
        log::trace!("destroy image called with stale handle {:?}", handle);
    }

    Ok(())
}

fn do_create_sampler(inner: Arc<DeviceInner>, descriptor: SamplerDescriptor) -> Result<SamplerHandle, Error> {
    let core = inner.get_core()?;

    if descriptor.anisotropy_enabled && core.enabled_features.sampler_anisotropy == vk::FALSE {
        log::warn!("sampler anisotropy requested but the device does not support it");
        return Err(Error::FeatureNotSupported);
    }

    let mut effective = descriptor;
    effective.max_anisotropy = descriptor.max_anisotropy.min(core.limits.max_sampler_anisotropy);

    let sampler_info = vk::SamplerCreateInfo::builder()
        .mag_filter(effective.magnification_filter.to_vk())
        .min_filter(effective.minification_filter.to_vk())
        .mipmap_mode(effective.mipmap_mode.to_vk())
        .address_mode_u(effective.address_mode_u.to_vk())
        .address_mode_v(effective.address_mode_v.to_vk())
        .address_mode_w(effective.address_mode_w.to_vk())
        .mip_lod_bias(effective.mip_lod_bias)
        .anisotropy_enable(effective.anisotropy_enabled)
        .max_anisotropy(effective.max_anisotropy)
        .compare_enable(effective.compare_enabled)
        .compare_op(effective.compare_operation.to_vk())
        .min_lod(effective.min_lod)
        .max_lod(effective.max_lod)
        .border_color(effective.border_color.to_vk())
        .unnormalized_coordinates(false);

    let sampler = unsafe { core.device.create_sampler(&sampler_info, None) }.map_err(|err| {
        log::error!("vkCreateSampler returned {:?}", err);
        Error::InternalError
    })?;

    let mut store = inner.samplers.lock();
    let (index, generation) = store.samplers.insert(SamplerData {
        sampler,
        descriptor: effective,
    });

    log::debug!("created sampler; index: {}, generation: {}", index, generation);

    Ok(SamplerHandle::new(index, generation))
}

fn do_destroy_sampler(inner: Arc<DeviceInner>, handle: SamplerHandle) -> Result<(), Error> {
    let fence_value = inner.timeline_value.load(Ordering::SeqCst);
    let mut store = inner.samplers.lock();

    if store.samplers.destroy(handle.index(), handle.generation(), fence_value).is_err() {
        log::trace!("destroy sampler called with stale handle {:?}", handle);
    }

    Ok(())
}

fn do_create_shader_module(
    inner: Arc<DeviceInner>,
    descriptor: ShaderModuleDescriptor,
) -> Result<ShaderModuleHandle, Error> {
    let core = inner.get_core()?;

    let key = ShaderModuleKey {
        stage: descriptor.stage,
        hash: descriptor.hash,
    };

    {
        let mut store = inner.shaders.lock();
        if let Some(&handle) = store.cache.get(&key) {
            match store.modules.get_mut(handle.index(), handle.generation()) {
                Some(data) => {
                    data.reference_counter += 1;
                    log::debug!(
                        "create shader module cache hit; stage: {:?}, index: {}, generation: {}, references: {}",
                        data.stage, handle.index(), handle.generation(), data.reference_counter
                    );
                    return Ok(handle);
                }
                None => {
                    log::error!("shader module cache entry {:?} points at a dead slot", key);
                    store.cache.remove(&key);
                    return Err(Error::InternalError);
                }
            }
        }
    }

    let module_info = vk::ShaderModuleCreateInfo::builder().code(&descriptor.spirv);
    let module = unsafe { core.device.create_shader_module(&module_info, None) }.map_err(|err| {
        log::error!(
            "vkCreateShaderModule returned {:?}; stage: {:?}, words: {}",
            err, descriptor.stage, descriptor.spirv.len()
        );
        Error::InternalError
    })?;

    let mut store = inner.shaders.lock();
    let (index, generation) = store.modules.insert(ShaderModuleData {
        module,
        stage: descriptor.stage,
        key,
        reference_counter: 1,
    });
    let handle = ShaderModuleHandle::new(index, generation);
    store.cache.insert(key, handle);

    log::debug!(
        "created shader module; stage: {:?}, index: {}, generation: {}, storage_size: {}",
        descriptor.stage, index, generation, store.modules.len()
    );

    Ok(handle)
}

fn do_destroy_shader_module(inner: Arc<DeviceInner>, handle: ShaderModuleHandle) -> Result<(), Error> {
    let fence_value = inner.timeline_value.load(Ordering::SeqCst);
    let mut store = inner.shaders.lock();

    let data = match store.modules.get_mut(handle.index(), handle.generation()) {
        Some(data) => data,
        None => {
            log::trace!("destroy shader module called with stale handle {:?}", handle);
            return Ok(());
        }
    };

    data.reference_counter -= 1;
    log::debug!(
        "destroying shader module; index: {}, generation: {}, references: {}",
        handle.index(), handle.generation(), data.reference_counter
    );

    if data.reference_counter == 0 {
        let key = data.key;
        store.cache.remove(&key);
        store.modules.destroy(handle.index(), handle.generation(), fence_value).map_err(|_| {
            log::error!("shader module slot vanished during destroy");
            Error::InternalError
        })?;
    }

    Ok(())
}

async fn do_collect_pending_destroy(inner: Arc<DeviceInner>) -> Result<(), Error> {
    let core = inner.get_core()?;

    let completed = unsafe {
        core.device.get_semaphore_counter_value(core.timeline_semaphore)
    }.map_err(|err| {
        log::error!("failed to read the timeline semaphore counter: {:?}", err);
        Error::InternalError
    })?;

    // Each storage is collected on its owning lane.
    let buffer_collect = {
        let task_inner = inner.clone();
        let task_core = core.clone();
        inner.strands.get(DeviceLanes::Buffer).dispatch(async move {
            collect_buffer_stores(&task_inner, &task_core, completed);
        })
    };
    let sampler_collect = {
        let task_inner = inner.clone();
        let task_core = core.clone();
        inner.strands.get(DeviceLanes::Sampler).dispatch(async move {
            collect_sampler_store(&task_inner, &task_core, completed);
        })
    };
    let shader_collect = {
        let task_inner = inner.clone();
        let task_core = core.clone();
        inner.strands.get(DeviceLanes::Shader).dispatch(async move {
            collect_shader_store(&task_inner, &task_core, completed);
        })
    };

    buffer_collect.await?;
    sampler_collect.await?;
    shader_collect.await?;

    Ok(())
}

fn collect_buffer_stores(inner: &DeviceInner, core: &DeviceCore, completed: u64) {
    let mut stores = inner.buffers.lock();

    log::trace!(
        "collecting; timeline: {}, pending buffers: {}, pending images: {}",
        completed,
        stores.buffers.pending_count(),
        stores.images.pending_count()
    );

    stores.buffers.collect_pending(completed, |index, data| {
        log::trace!("collecting buffer slot {} (size: {})", index, data.size);
        unsafe { core.device.destroy_buffer(data.buffer, None) };
        core.allocator.free(data.allocation);
    });

    stores.images.collect_pending(completed, |index, data| {
        log::trace!("collecting image slot {}", index);
        unsafe {
            core.device.destroy_image_view(data.view, None);
            core.device.destroy_image(data.image, None);
        }
        core.allocator.free(data.allocation);
    });
}

fn collect_sampler_store(inner: &DeviceInner, core: &DeviceCore, completed: u64) {
    let mut store = inner.samplers.lock();

    store.samplers.collect_pending(completed, |index, data| {
        log::trace!("collecting sampler slot {}", index);
        unsafe { core.device.destroy_sampler(data.sampler, None) };
    });
}

fn collect_shader_store(inner: &DeviceInner, core: &DeviceCore, completed: u64) {
    let mut store = inner.shaders.lock();

    store.modules.collect_pending(completed, |index, data| {
        log::trace!("collecting shader module slot {} (stage: {:?})", index, data.stage);
        unsafe { core.device.destroy_shader_module(data.module, None) };
    });
}

impl Drop for DeviceInner {
    fn drop(&mut self) {
        let core = match self.core.get_mut().take() {
            Some(core) => core,
            None => return,
        };

        log::debug!("shutting down rendering device");

        if let Err(err) = unsafe { core.device.device_wait_idle() } {
            log::error!("vkDeviceWaitIdle returned {:?} during shutdown", err);
        }

        // Doom everything the application left alive, then drain. After the
        // idle wait the timeline cannot advance anymore so a single
        // collection pass empties all pending lists.
        let fence_value = self.timeline_value.get_mut().wrapping_sub(1);

        {
            let stores = self.buffers.get_mut();
            for (index, generation) in stores.buffers.live_handles() {
                let _ = stores.buffers.destroy(index, generation, fence_value);
            }
            for (index, generation) in stores.images.live_handles() {
                let _ = stores.images.destroy(index, generation, fence_value);
            }
        }
        {
            let store = self.samplers.get_mut();
            for (index, generation) in store.samplers.live_handles() {
                let _ = store.samplers.destroy(index, generation, fence_value);
            }
        }
        {
            let store = self.shaders.get_mut();
            store.cache.clear();
            for (index, generation) in store.modules.live_handles() {
                let _ = store.modules.destroy(index, generation, fence_value);
            }
        }

        let completed = unsafe {
            core.device.get_semaphore_counter_value(core.timeline_semaphore)
        }.unwrap_or(u64::MAX).max(fence_value);

        collect_buffer_stores_shutdown(self, &core, completed);

        // Present state teardown.
        {
            let present = self.present.get_mut();
            if let Some(mut resources) = present.swapchain.take() {
                unsafe { destroy_swapchain_resources(&core, &mut resources) };
            }
            if let Some(render_pass) = present.render_pass.take() {
                unsafe { core.device.destroy_render_pass(render_pass, None) };
            }
            let mut frames = std::mem::take(&mut present.frames);
            unsafe { destroy_frame_sync_objects(&core, &mut frames) };
        }

        match Arc::try_unwrap(core) {
            Ok(core) => unsafe {
                core.device.destroy_pipeline_cache(core.pipeline_cache, None);
                core.device.destroy_semaphore(core.timeline_semaphore, None);
                core.device.destroy_descriptor_pool(core.descriptor_pool, None);

                // The allocator holds device memory, it must go before the
                // device does.
                drop(core.allocator);
                core.device.destroy_device(None);

                self.surface_provider.get_mut().destroy();
                if let Some(state) = &core.debug_utils {
                    state.debug_utils_fn.destroy_debug_utils_messenger(state.messenger, None);
                }
                core.instance.destroy_instance(None);
            },
            Err(_) => {
                log::error!("device core still referenced during shutdown, leaking vulkan objects");
            }
        }
    }
}

fn collect_buffer_stores_shutdown(inner: &mut DeviceInner, core: &DeviceCore, completed: u64) {
    let stores = inner.buffers.get_mut();
    stores.buffers.collect_pending(completed, |_, data| {
        unsafe { core.device.destroy_buffer(data.buffer, None) };
        core.allocator.free(data.allocation);
    });
    stores.images.collect_pending(completed, |_, data| {
        unsafe {
            core.device.destroy_image_view(data.view, None);
            core.device.destroy_image(data.image, None);
        }
        core.allocator.free(data.allocation);
    });

    let samplers = inner.samplers.get_mut();
    samplers.samplers.collect_pending(completed, |_, data| {
        unsafe { core.device.destroy_sampler(data.sampler, None) };
    });

    let shaders = inner.shaders.get_mut();
    shaders.modules.collect_pending(completed, |_, data| {
        unsafe { core.device.destroy_shader_module(data.module, None) };
    });
}
