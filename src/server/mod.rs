//! The rendering server.
//!
//! Orchestrates the asset → resource → GPU object pipeline: looks an asset
//! up, pulls its file backed resources through the resource manager and asks
//! the rendering device for the matching GPU objects. Loaded results are
//! cached per asset type so repeated loads are free.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::assets::{AssetData, AssetId, AssetManager, ShaderDescriptor, ShaderStageDescriptor};
use crate::device::{RenderingDevice, ShaderModuleDescriptor, ShaderModuleHandle, ShaderStage};
use crate::error::Error;
use crate::resource::{ResourceDescriptor, ResourceManager, ResourceType};
use crate::scheduler::{Scheduler, StrandGroup, StrandLanes};
use crate::util::bytes::bytes_to_spirv;

/// The server's single serial lane. Its hot path merely coordinates, so one
/// lane is enough.
#[derive(Copy, Clone, Debug)]
pub enum ServerLanes {
    Main,
}

impl StrandLanes for ServerLanes {
    const COUNT: usize = 1;
    const NAME: &'static str = "server";

    fn index(self) -> usize {
        self as usize
    }
}

/// GPU face of a loaded shader asset: one module handle per declared stage.
#[derive(Clone, Debug, Default)]
pub struct ShaderResource {
    stages: [Option<ShaderModuleHandle>; ShaderStage::COUNT],
}

impl ShaderResource {
    pub fn stage(&self, stage: ShaderStage) -> Option<ShaderModuleHandle> {
        self.stages[stage.table_index()]
    }

    pub fn declared_stages(&self) -> impl Iterator<Item = (ShaderStage, ShaderModuleHandle)> + '_ {
        ShaderStage::ALL.iter().filter_map(move |stage| {
            self.stages[stage.table_index()].map(|handle| (*stage, handle))
        })
    }
}

#[derive(Clone, Debug, Default)]
pub struct MaterialResource {
}

struct ServerInner {
    scheduler: Arc<Scheduler>,
    strands: StrandGroup<ServerLanes>,
    assets: Arc<AssetManager>,
    resources: ResourceManager,
    device: Arc<dyn RenderingDevice>,

    shader_resource_cache: Mutex<HashMap<AssetId, ShaderResource>>,
    material_resource_cache: Mutex<HashMap<AssetId, MaterialResource>>,
}

#[derive(Clone)]
pub struct RenderingServer {
    inner: Arc<ServerInner>,
}

impl RenderingServer {
    pub fn new(
        scheduler: Arc<Scheduler>,
        assets: Arc<AssetManager>,
        resources: ResourceManager,
        device: Arc<dyn RenderingDevice>,
    ) -> Self {
        let strands = scheduler.make_strands::<ServerLanes>();

        Self {
            inner: Arc::new(ServerInner {
                scheduler,
                strands,
                assets,
                resources,
                device,
                shader_resource_cache: Mutex::new(HashMap::new()),
                material_resource_cache: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Loads the asset database.
    pub async fn initialize(&self) -> Result<(), Error> {
        self.inner.assets.initialize(&self.inner.scheduler).await
    }

    /// Loads an asset into GPU residency. Loading is idempotent: an asset
    /// already present in its type cache is not loaded again.
    pub async fn load_asset(&self, asset_id: AssetId) -> Result<(), Error> {
        let descriptor = self.inner.assets.get_asset(asset_id).map_err(|err| {
            log::error!("asset {} not found", asset_id);
            err
        })?;

        match &descriptor.data {
            AssetData::Shader(shader) => {
                let inner = self.inner.clone();
                let shader = shader.clone();

                self.inner.strands.get(ServerLanes::Main).dispatch(async move {
                    if inner.shader_resource_cache.lock().contains_key(&asset_id) {
                        log::trace!("shader asset {} already resident", asset_id);
                        return Ok(());
                    }

                    let resource = load_shader(&inner, &shader).await.map_err(|err| {
                        log::error!("failed to load shader resource for asset {}", asset_id);
                        err
                    })?;

                    inner.shader_resource_cache.lock().insert(asset_id, resource);
                    Ok(())
                }).await?
            }
            AssetData::Texture(_) => Err(Error::UnimplementedError),
            AssetData::Mesh(_) => Err(Error::UnimplementedError),
            AssetData::Material(_) => {
                let inner = self.inner.clone();

                self.inner.strands.get(ServerLanes::Main).dispatch(async move {
                    if inner.material_resource_cache.lock().contains_key(&asset_id) {
                        return Ok(());
                    }

                    let resource = load_material(&inner).await.map_err(|err| {
                        log::error!("failed to load material resource for asset {}", asset_id);
                        err
                    })?;

                    inner.material_resource_cache.lock().insert(asset_id, resource);
                    Ok(())
                }).await?
            }
        }
    }

    /// Returns the GPU face of a loaded shader asset.
    pub fn get_shader_resource(&self, asset_id: AssetId) -> Option<ShaderResource> {
        self.inner.shader_resource_cache.lock().get(&asset_id).cloned()
    }
}

async fn load_shader(inner: &ServerInner, descriptor: &ShaderDescriptor) -> Result<ShaderResource, Error> {
    let mut resource = ShaderResource::default();

    for stage in ShaderStage::ALL {
        let stage_descriptor = match descriptor.stages.get(&stage) {
            Some(stage_descriptor) => stage_descriptor,
            None => {
                log::trace!("shader stage {:?} not declared, skipping", stage);
                continue;
            }
        };

        match load_shader_stage(inner, stage, stage_descriptor).await {
            Ok(handle) => {
                resource.stages[stage.table_index()] = Some(handle);
            }
            Err(err) => {
                log::error!("failed to load shader stage {:?}", stage);

                // Roll back the modules created for earlier stages.
                for handle in resource.stages.iter().flatten() {
                    if let Err(destroy_err) = inner.device.destroy_shader_module(*handle).await {
                        log::error!(
                            "failed to destroy shader module {:?} during rollback: {:?}",
                            handle, destroy_err
                        );
                    }
                }

                return Err(err);
            }
        }
    }

    Ok(resource)
}

async fn load_shader_stage(
    inner: &ServerInner,
    stage: ShaderStage,
    stage_descriptor: &ShaderStageDescriptor,
) -> Result<ShaderModuleHandle, Error> {
    let resource_descriptor = ResourceDescriptor {
        ty: ResourceType::Shader,
        path: stage_descriptor.spirv_path.clone(),
    };

    let lease = inner.resources.acquire(resource_descriptor).await.map_err(|err| {
        log::error!(
            "failed to acquire shader resource; stage: {:?}, spirv_path: {}",
            stage, stage_descriptor.spirv_path
        );
        err
    })?;

    let resource = inner.resources.get_resource(&lease).await?;
    let spirv = bytes_to_spirv(&resource.data)?;

    let module_descriptor = ShaderModuleDescriptor {
        stage,
        spirv,
        hash: resource.hash,
    };

    // The lease only needs to live across the create call, the device keeps
    // its own reference to the module contents from here on.
    let handle = inner.device.create_shader_module(module_descriptor).await;
    drop(lease);

    handle
}

async fn load_material(_inner: &ServerInner) -> Result<MaterialResource, Error> {
    Err(Error::UnimplementedError)
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use futures::executor::block_on;

    use super::*;
    use crate::device::{
        BufferDescriptor, BufferHandle, ImageDescriptor, ImageHandle, SamplerDescriptor,
        SamplerHandle,
    };

    /// Counts physical module creations and mimics the device's content
    /// addressed shader module cache.
    struct MockDevice {
        created_modules: AtomicUsize,
        live_modules: Mutex<HashMap<(ShaderStage, u64), (ShaderModuleHandle, usize)>>,
        next_index: AtomicU64,
    }

    impl MockDevice {
        fn new() -> Self {
            Self {
                created_modules: AtomicUsize::new(0),
                live_modules: Mutex::new(HashMap::new()),
                next_index: AtomicU64::new(0),
            }
        }

        fn physical_modules(&self) -> usize {
            self.created_modules.load(Ordering::SeqCst)
        }

        fn live_modules(&self) -> usize {
            self.live_modules.lock().len()
        }
    }

    #[async_trait]
    impl RenderingDevice for MockDevice {
        async fn initialize(&self) -> Result<(), Error> {
            Ok(())
        }

        async fn prepare_buffers(&self) -> Result<(), Error> {
            Ok(())
        }

        async fn swap_buffers(&self) -> Result<(), Error> {
            Ok(())
        }

        async fn create_buffer(&self, _: BufferDescriptor) -> Result<BufferHandle, Error> {
            Err(Error::UnimplementedError)
        }

        async fn destroy_buffer(&self, _: BufferHandle) -> Result<(), Error> {
            Err(Error::UnimplementedError)
        }

        async fn create_image(&self, _: ImageDescriptor) -> Result<ImageHandle, Error> {
            Err(Error::UnimplementedError)
        }

        async fn destroy_image(&self, _: ImageHandle) -> Result<(), Error> {
            Err(Error::UnimplementedError)
        }

        async fn create_sampler(&self, _: SamplerDescriptor) -> Result<SamplerHandle, Error> {
            Err(Error::UnimplementedError)
        }

        async fn destroy_sampler(&self, _: SamplerHandle) -> Result<(), Error> {
            Err(Error::UnimplementedError)
        }

        async fn create_shader_module(&self, descriptor: ShaderModuleDescriptor) -> Result<ShaderModuleHandle, Error> {
            if descriptor.spirv.is_empty() {
                return Err(Error::InternalError);
            }

            let mut modules = self.live_modules.lock();
            let key = (descriptor.stage, descriptor.hash);

            if let Some((handle, references)) = modules.get_mut(&key) {
                *references += 1;
                return Ok(*handle);
            }

            let index = self.next_index.fetch_add(1, Ordering::SeqCst);
            let handle = ShaderModuleHandle::new(index as usize, 0);
            modules.insert(key, (handle, 1));
            self.created_modules.fetch_add(1, Ordering::SeqCst);

            Ok(handle)
        }

        async fn destroy_shader_module(&self, handle: ShaderModuleHandle) -> Result<(), Error> {
            let mut modules = self.live_modules.lock();

            let key = modules.iter()
                .find(|(_, (live, _))| *live == handle)
                .map(|(key, _)| *key);

            if let Some(key) = key {
                let remove = {
                    let (_, references) = modules.get_mut(&key).unwrap();
                    *references -= 1;
                    *references == 0
                };
                if remove {
                    modules.remove(&key);
                }
            }

            Ok(())
        }
    }

    struct Fixture {
        server: RenderingServer,
        device: Arc<MockDevice>,
        files: Vec<PathBuf>,
    }

    impl Fixture {
        fn new() -> Self {
            let scheduler = Arc::new(Scheduler::new(4).unwrap());
            let assets = Arc::new(AssetManager::new());
            let resources = ResourceManager::new(scheduler.clone());
            let device = Arc::new(MockDevice::new());

            let server = RenderingServer::new(
                scheduler,
                assets,
                resources,
                device.clone() as Arc<dyn RenderingDevice>,
            );

            Self {
                server,
                device,
                files: Vec::new(),
            }
        }

        fn write_file(&mut self, name: &str, contents: &[u8]) -> PathBuf {
            let mut path = std::env::temp_dir();
            path.push(format!("ember-core-server-{}-{}", name, std::process::id()));

            let mut file = std::fs::File::create(&path).unwrap();
            file.write_all(contents).unwrap();

            self.files.push(path.clone());
            path
        }

        fn initialize_with_db(&mut self, db: &str) {
            let path = self.write_file("assetsdb.json", db.as_bytes());
            block_on(
                self.server.inner.assets.initialize_from(&self.server.inner.scheduler, &path)
            ).unwrap();
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            for path in &self.files {
                let _ = std::fs::remove_file(path);
            }
        }
    }

    // A minimal valid SPIR-V prefix: magic, version, generator, bound,
    // schema. Enough for the byte stream plumbing, never handed to a real
    // driver in these tests.
    fn spirv_words(tag: u32) -> Vec<u8> {
        let words = [0x0723_0203u32, 0x0001_0000, 0, 16, 0, tag];
        words.iter().flat_map(|word| word.to_le_bytes()).collect()
    }

    #[test]
    fn shader_assets_share_modules_by_content() {
        let mut fixture = Fixture::new();

        let vertex = fixture.write_file("basic.vert.spv", &spirv_words(1));
        let fragment = fixture.write_file("basic.frag.spv", &spirv_words(2));

        // Asset 2 references the same SPIR-V files as asset 1, so the
        // content addressed module cache must collapse them.
        let db = format!(r#"[
            {{
                "id": 1,
                "type": "shader",
                "stages": [
                    {{ "spirv": {vert:?}, "meta": "basic.vert.json", "type": "vertex" }},
                    {{ "spirv": {frag:?}, "meta": "basic.frag.json", "type": "fragment" }}
                ]
            }},
            {{
                "id": 2,
                "type": "shader",
                "stages": [
                    {{ "spirv": {vert:?}, "meta": "basic.vert.json", "type": "vertex" }},
                    {{ "spirv": {frag:?}, "meta": "basic.frag.json", "type": "fragment" }}
                ]
            }}
        ]"#, vert = vertex.to_str().unwrap(), frag = fragment.to_str().unwrap());

        fixture.initialize_with_db(&db);

        block_on(fixture.server.load_asset(1)).unwrap();
        block_on(fixture.server.load_asset(1)).unwrap();
        block_on(fixture.server.load_asset(1)).unwrap();
        block_on(fixture.server.load_asset(2)).unwrap();

        // Two cache entries, one per asset.
        assert!(fixture.server.get_shader_resource(1).is_some());
        assert!(fixture.server.get_shader_resource(2).is_some());

        // Two physical modules despite four create calls.
        assert_eq!(fixture.device.physical_modules(), 2);

        let first = fixture.server.get_shader_resource(1).unwrap();
        let second = fixture.server.get_shader_resource(2).unwrap();
        assert_eq!(
            first.stage(ShaderStage::Vertex).unwrap(),
            second.stage(ShaderStage::Vertex).unwrap()
        );
        assert!(first.stage(ShaderStage::Compute).is_none());
    }

    #[test]
    fn missing_asset_is_not_found() {
        let mut fixture = Fixture::new();
        fixture.initialize_with_db("[]");

        assert_eq!(
            block_on(fixture.server.load_asset(77)).unwrap_err(),
            Error::NotFoundError
        );
    }

    #[test]
    fn unimplemented_asset_types() {
        let mut fixture = Fixture::new();
        fixture.initialize_with_db(r#"[
            {
                "id": 5,
                "type": "texture",
                "image": "textures/a.png",
                "colour_space": "srgb",
                "mipmaps": true
            },
            {
                "id": 6,
                "type": "mesh",
                "source": "meshes/a.bin",
                "submeshes": []
            },
            {
                "id": 7,
                "type": "material",
                "textures": [],
                "parameters": []
            }
        ]"#);

        for asset_id in [5, 6, 7] {
            assert_eq!(
                block_on(fixture.server.load_asset(asset_id)).unwrap_err(),
                Error::UnimplementedError
            );
        }
    }

    #[test]
    fn failed_stage_rolls_back_earlier_modules() {
        let mut fixture = Fixture::new();

        let vertex = fixture.write_file("rollback.vert.spv", &spirv_words(3));

        // The fragment stage points at a file that does not exist, so the
        // vertex module created first must be destroyed again.
        let db = format!(r#"[
            {{
                "id": 1,
                "type": "shader",
                "stages": [
                    {{ "spirv": {vert:?}, "meta": "rollback.vert.json", "type": "vertex" }},
                    {{ "spirv": "/nonexistent/rollback.frag.spv", "meta": "rollback.frag.json", "type": "fragment" }}
                ]
            }}
        ]"#, vert = vertex.to_str().unwrap());

        fixture.initialize_with_db(&db);

        assert_eq!(
            block_on(fixture.server.load_asset(1)).unwrap_err(),
            Error::NotFoundError
        );

        assert!(fixture.server.get_shader_resource(1).is_none());
        assert_eq!(fixture.device.live_modules(), 0);
    }

    #[test]
    fn unaligned_spirv_is_internal_error() {
        let mut fixture = Fixture::new();

        let broken = fixture.write_file("broken.vert.spv", &[1, 2, 3]);
        let db = format!(r#"[
            {{
                "id": 1,
                "type": "shader",
                "stages": [
                    {{ "spirv": {path:?}, "meta": "broken.vert.json", "type": "vertex" }}
                ]
            }}
        ]"#, path = broken.to_str().unwrap());

        fixture.initialize_with_db(&db);

        assert_eq!(
            block_on(fixture.server.load_asset(1)).unwrap_err(),
            Error::InternalError
        );
    }
}
