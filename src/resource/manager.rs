//! The reference counted resource cache.
//!
//! Caches file backed blobs keyed by `(type, path)`. Each resource type has
//! its own strand lane owning its slot table, cache map and free list, so
//! loads of different types proceed concurrently while loads of one type are
//! serialized without locking. At most one load per key is ever in flight:
//! concurrent acquires of a loading resource suspend on a polling timer
//! until the loader clears the flag.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Error;
use crate::scheduler::{Scheduler, StrandGroup, StrandLanes, POLL_INTERVAL};
use crate::util::hash::fnv1a_64;

/// Kind of a cached resource. Doubles as the lane assignment of the
/// resource manager: one serial lane per type.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ResourceType {
    Shader,
    Image,
    Mesh,
    Material,
}

impl StrandLanes for ResourceType {
    const COUNT: usize = 4;
    const NAME: &'static str = "resource";

    fn index(self) -> usize {
        self as usize
    }
}

/// Cache key of a resource. Hashing covers both the type and the path so
/// keys stay unique even across consolidated caches.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ResourceDescriptor {
    pub ty: ResourceType,
    pub path: String,
}

/// A loaded blob plus its content hash.
pub struct Resource {
    pub data: Vec<u8>,
    pub hash: u64,
}

/// Addresses one resource slot. Only valid while a lease holds a reference.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ResourceHandle {
    ty: ResourceType,
    index: usize,
    generation: u64,
}

impl ResourceHandle {
    pub fn resource_type(&self) -> ResourceType {
        self.ty
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

struct ResourceSlot {
    descriptor: Option<ResourceDescriptor>,
    resource: Option<Arc<Resource>>,
    generation: u64,
    reference_counter: usize,
    loading: bool,
    loaded: bool,
}

impl ResourceSlot {
    fn empty() -> Self {
        Self {
            descriptor: None,
            resource: None,
            generation: 0,
            reference_counter: 0,
            loading: false,
            loaded: false,
        }
    }
}

struct ResourceContext {
    slots: Vec<ResourceSlot>,
    cache: HashMap<ResourceDescriptor, ResourceHandle>,
    free_list: Vec<usize>,
}

impl ResourceContext {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            cache: HashMap::new(),
            free_list: Vec::new(),
        }
    }
}

struct ResourceManagerInner {
    scheduler: Arc<Scheduler>,
    strands: StrandGroup<ResourceType>,
    contexts: [Mutex<ResourceContext>; ResourceType::COUNT],
}

/// Issues [`ResourceLease`]s for file backed blobs.
///
/// Cheap to clone; clones share the cache. Leases keep the cache state
/// alive, the manager itself must outlive the scheduler shutdown.
#[derive(Clone)]
pub struct ResourceManager {
    inner: Arc<ResourceManagerInner>,
}

impl ResourceManager {
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        let strands = scheduler.make_strands::<ResourceType>();

        Self {
            inner: Arc::new(ResourceManagerInner {
                scheduler,
                strands,
                contexts: [
                    Mutex::new(ResourceContext::new()),
                    Mutex::new(ResourceContext::new()),
                    Mutex::new(ResourceContext::new()),
                    Mutex::new(ResourceContext::new()),
                ],
            }),
        }
    }

    /// Acquires a lease on the resource described by `descriptor`, loading
    /// it from disk on first use.
    pub async fn acquire(&self, descriptor: ResourceDescriptor) -> Result<ResourceLease, Error> {
        let inner = self.inner.clone();
        self.inner.strands.get(descriptor.ty)
            .dispatch(async move { do_acquire(inner, descriptor).await })
            .await?
    }

    /// Resolves the payload behind a lease on its owning lane.
    pub async fn get_resource(&self, lease: &ResourceLease) -> Result<Arc<Resource>, Error> {
        let inner = self.inner.clone();
        let handle = lease.handle();

        self.inner.strands.get(handle.ty)
            .dispatch(async move {
                let context = inner.contexts[handle.ty.index()].lock();
                let slot = context.slots.get(handle.index).ok_or(Error::NotFoundError)?;
                if slot.generation != handle.generation || !slot.loaded {
                    return Err(Error::NotFoundError);
                }
                slot.resource.clone().ok_or(Error::InternalError)
            })
            .await?
    }

    #[cfg(test)]
    fn cache_len(&self, ty: ResourceType) -> usize {
        self.inner.contexts[ty.index()].lock().cache.len()
    }

    #[cfg(test)]
    fn reference_count(&self, handle: ResourceHandle) -> usize {
        self.inner.contexts[handle.ty.index()].lock()
            .slots[handle.index].reference_counter
    }
}

async fn do_acquire(
    inner: Arc<ResourceManagerInner>,
    descriptor: ResourceDescriptor,
) -> Result<ResourceLease, Error> {
    let lane = descriptor.ty;

    log::debug!("acquiring resource; type: {:?}, path: {}", descriptor.ty, descriptor.path);

    // Cache hit: take a reference immediately, then wait out a load that is
    // still in flight. The slot vector may grow while we sleep, the slot is
    // re-derived by index after every suspension.
    let hit = {
        let mut context = inner.contexts[lane.index()].lock();
        match context.cache.get(&descriptor) {
            Some(&handle) => {
                let slot = &mut context.slots[handle.index];
                assert_eq!(slot.generation, handle.generation);
                slot.reference_counter += 1;
                Some(handle)
            }
            None => None,
        }
    };

    if let Some(handle) = hit {
        loop {
            let loading = inner.contexts[lane.index()].lock().slots[handle.index].loading;
            if !loading {
                break;
            }
            inner.scheduler.sleep(POLL_INTERVAL).await;
        }

        let loaded = inner.contexts[lane.index()].lock().slots[handle.index].loaded;
        if !loaded {
            log::error!("resource not loaded after its load wait; path: {}", descriptor.path);
            release_reference(&inner, handle);
            return Err(Error::InternalError);
        }

        log::debug!("acquired resource from cache; path: {}", descriptor.path);
        return Ok(ResourceLease::new(inner.clone(), handle));
    }

    // Cache miss: reserve a slot, publish it as loading and start the read.
    let handle = {
        let mut context = inner.contexts[lane.index()].lock();

        let index = match context.free_list.pop() {
            Some(index) => index,
            None => {
                context.slots.push(ResourceSlot::empty());
                context.slots.len() - 1
            }
        };

        let slot = &mut context.slots[index];
        slot.descriptor = Some(descriptor.clone());
        slot.loading = true;
        slot.loaded = false;

        let handle = ResourceHandle {
            ty: lane,
            index,
            generation: slot.generation,
        };
        context.cache.insert(descriptor.clone(), handle);

        handle
    };

    let read = inner.scheduler.read_file(&descriptor.path).await;

    let data = match read {
        Ok(data) => data,
        Err(err) => {
            let error = if err.kind() == std::io::ErrorKind::NotFound {
                log::error!("resource file not found: {}", descriptor.path);
                Error::NotFoundError
            } else {
                log::error!("resource read error; path: {}: {}", descriptor.path, err);
                Error::InternalError
            };

            abort_loading_slot(&inner, handle, &descriptor);
            return Err(error);
        }
    };

    {
        let mut context = inner.contexts[lane.index()].lock();
        let slot = &mut context.slots[handle.index];

        let hash = fnv1a_64(&data);
        log::debug!(
            "loaded resource; path: {}, bytes: {}, hash: {:#018x}, index: {}, generation: {}",
            descriptor.path, data.len(), hash, handle.index, slot.generation
        );

        slot.resource = Some(Arc::new(Resource {
            data,
            hash,
        }));
        slot.loaded = true;
        slot.loading = false;
        slot.reference_counter += 1;
    }

    Ok(ResourceLease::new(inner, handle))
}

/// Rolls back a slot whose load failed. Waiters that already took a
/// reference keep the slot alive until their own release.
fn abort_loading_slot(
    inner: &ResourceManagerInner,
    handle: ResourceHandle,
    descriptor: &ResourceDescriptor,
) {
    log::debug!("resource load aborted; path: {}", descriptor.path);

    let mut context = inner.contexts[handle.ty.index()].lock();
    let ResourceContext { slots, cache, free_list } = &mut *context;

    cache.remove(descriptor);

    let slot = &mut slots[handle.index];
    slot.loading = false;

    if slot.reference_counter == 0 {
        slot.descriptor = None;
        slot.generation += 1;
        free_list.push(handle.index);
    }
}

/// Drops one reference. On the last release the cache entry is erased, the
/// generation is bumped and the slot joins the free list.
fn release_reference(inner: &ResourceManagerInner, handle: ResourceHandle) {
    let mut context = inner.contexts[handle.ty.index()].lock();
    let ResourceContext { slots, cache, free_list } = &mut *context;

    let slot = &mut slots[handle.index];
    assert_eq!(slot.generation, handle.generation);
    assert!(slot.reference_counter > 0);

    slot.reference_counter -= 1;
    if slot.reference_counter == 0 {
        log::debug!("releasing resource; path: {:?}", slot.descriptor.as_ref().map(|d| &d.path));

        if let Some(descriptor) = slot.descriptor.take() {
            cache.remove(&descriptor);
        }
        slot.generation += 1;
        slot.resource = None;
        slot.loaded = false;
        free_list.push(handle.index);
    }
}

/// RAII token for one reference on a loaded resource.
///
/// Move only. Dropping the lease releases the reference exactly once, on
/// the resource's owning lane.
pub struct ResourceLease {
    inner: Option<Arc<ResourceManagerInner>>,
    handle: ResourceHandle,
}

impl std::fmt::Debug for ResourceLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceLease").field("handle", &self.handle).finish()
    }
}

impl ResourceLease {
    fn new(inner: Arc<ResourceManagerInner>, handle: ResourceHandle) -> Self {
        Self {
            inner: Some(inner),
            handle,
        }
    }

    pub fn handle(&self) -> ResourceHandle {
        self.handle
    }
}

impl Drop for ResourceLease {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            let handle = self.handle;
            let strand = inner.strands.get(handle.ty).clone();
            strand.spawn(async move {
                release_reference(&inner, handle);
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::path::PathBuf;

    use futures::executor::block_on;

    use super::*;

    struct Fixture {
        manager: ResourceManager,
        files: Vec<PathBuf>,
    }

    impl Fixture {
        fn new() -> Self {
            let scheduler = Arc::new(Scheduler::new(4).unwrap());
            let manager = ResourceManager::new(scheduler);

            Self {
                manager,
                files: Vec::new(),
            }
        }

        fn write_file(&mut self, name: &str, contents: &[u8]) -> String {
            let mut path = std::env::temp_dir();
            path.push(format!("ember-core-resource-{}-{}", name, std::process::id()));

            let mut file = std::fs::File::create(&path).unwrap();
            file.write_all(contents).unwrap();

            self.files.push(path.clone());
            path.to_str().unwrap().to_string()
        }

        /// Runs after previously spawned releases on the lane: strand tasks
        /// start in submission order.
        fn drain_lane(&self, ty: ResourceType) {
            block_on(self.manager.inner.strands.get(ty).dispatch(async {})).unwrap();
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            for path in &self.files {
                let _ = std::fs::remove_file(path);
            }
        }
    }

    fn shader_descriptor(path: &str) -> ResourceDescriptor {
        ResourceDescriptor {
            ty: ResourceType::Shader,
            path: path.to_string(),
        }
    }

    #[test]
    fn load_and_release_lifecycle() {
        let mut fixture = Fixture::new();
        let path = fixture.write_file("lifecycle", b"resource payload");
        let descriptor = shader_descriptor(&path);

        let lease = block_on(fixture.manager.acquire(descriptor.clone())).unwrap();
        let resource = block_on(fixture.manager.get_resource(&lease)).unwrap();
        assert_eq!(resource.data, b"resource payload");
        assert_eq!(resource.hash, fnv1a_64(b"resource payload"));

        assert_eq!(fixture.manager.cache_len(ResourceType::Shader), 1);

        drop(lease);
        fixture.drain_lane(ResourceType::Shader);

        assert_eq!(fixture.manager.cache_len(ResourceType::Shader), 0);
    }

    #[test]
    fn reference_counting() {
        let mut fixture = Fixture::new();
        let path = fixture.write_file("refcount", b"shared");
        let descriptor = shader_descriptor(&path);

        let leases: Vec<_> = (0..3)
            .map(|_| block_on(fixture.manager.acquire(descriptor.clone())).unwrap())
            .collect();

        let handle = leases[0].handle();
        assert!(leases.iter().all(|lease| lease.handle() == handle));
        assert_eq!(fixture.manager.reference_count(handle), 3);

        // n acquires, m < n releases: still loaded.
        let mut leases = leases;
        drop(leases.pop());
        drop(leases.pop());
        fixture.drain_lane(ResourceType::Shader);

        assert_eq!(fixture.manager.reference_count(handle), 1);
        assert_eq!(fixture.manager.cache_len(ResourceType::Shader), 1);

        // Last release empties the cache.
        drop(leases.pop());
        fixture.drain_lane(ResourceType::Shader);
        assert_eq!(fixture.manager.cache_len(ResourceType::Shader), 0);
    }

    #[test]
    fn slot_reuse_bumps_generation() {
        let mut fixture = Fixture::new();
        let path = fixture.write_file("generation", b"first life");
        let descriptor = shader_descriptor(&path);

        let lease = block_on(fixture.manager.acquire(descriptor.clone())).unwrap();
        let first = lease.handle();
        drop(lease);
        fixture.drain_lane(ResourceType::Shader);

        let lease = block_on(fixture.manager.acquire(descriptor)).unwrap();
        let second = lease.handle();

        assert_eq!(second.index(), first.index());
        assert!(second.generation() > first.generation());
    }

    #[test]
    fn concurrent_acquires_share_one_slot() {
        let mut fixture = Fixture::new();
        let path = fixture.write_file("dedup", b"deduplicated");
        let descriptor = shader_descriptor(&path);

        const CONCURRENT: usize = 16;
        let futures: Vec<_> = (0..CONCURRENT)
            .map(|_| {
                let manager = fixture.manager.clone();
                let descriptor = descriptor.clone();
                async move { manager.acquire(descriptor).await }
            })
            .collect();

        let leases: Vec<_> = block_on(futures::future::join_all(futures))
            .into_iter()
            .map(|result| result.unwrap())
            .collect();

        let handle = leases[0].handle();
        assert!(leases.iter().all(|lease| lease.handle() == handle));
        assert_eq!(fixture.manager.reference_count(handle), CONCURRENT);
        assert_eq!(fixture.manager.cache_len(ResourceType::Shader), 1);

        drop(leases);
        fixture.drain_lane(ResourceType::Shader);
        assert_eq!(fixture.manager.cache_len(ResourceType::Shader), 0);
    }

    #[test]
    fn storage_growth_stress() {
        // Many distinct descriptors force the slot vector to reallocate
        // while loads are in flight. Everything must still resolve to its
        // own payload.
        let mut fixture = Fixture::new();

        let descriptors: Vec<_> = (0..64)
            .map(|i| {
                let path = fixture.write_file(&format!("stress-{}", i), format!("payload {}", i).as_bytes());
                shader_descriptor(&path)
            })
            .collect();

        let futures: Vec<_> = descriptors.iter()
            .map(|descriptor| {
                let manager = fixture.manager.clone();
                let descriptor = descriptor.clone();
                async move { manager.acquire(descriptor).await }
            })
            .collect();

        let leases: Vec<_> = block_on(futures::future::join_all(futures))
            .into_iter()
            .map(|result| result.unwrap())
            .collect();

        assert_eq!(fixture.manager.cache_len(ResourceType::Shader), 64);

        for (i, lease) in leases.iter().enumerate() {
            let resource = block_on(fixture.manager.get_resource(lease)).unwrap();
            assert_eq!(resource.data, format!("payload {}", i).as_bytes());
        }
    }

    #[test]
    fn missing_file_is_not_found() {
        let fixture = Fixture::new();
        let descriptor = shader_descriptor("/nonexistent/ember-core-resource");

        let error = block_on(fixture.manager.acquire(descriptor)).unwrap_err();
        assert_eq!(error, Error::NotFoundError);

        // The aborted load must leave no cache entry behind.
        assert_eq!(fixture.manager.cache_len(ResourceType::Shader), 0);
    }

    #[test]
    fn failed_load_slot_is_reusable() {
        let mut fixture = Fixture::new();

        let missing = shader_descriptor("/nonexistent/ember-core-resource-reuse");
        assert!(block_on(fixture.manager.acquire(missing)).is_err());

        let path = fixture.write_file("after-failure", b"recovered");
        let lease = block_on(fixture.manager.acquire(shader_descriptor(&path))).unwrap();
        let resource = block_on(fixture.manager.get_resource(&lease)).unwrap();
        assert_eq!(resource.data, b"recovered");
    }

    #[test]
    fn lease_moves_release_once() {
        let mut fixture = Fixture::new();
        let path = fixture.write_file("moves", b"moved");
        let descriptor = shader_descriptor(&path);

        let lease = block_on(fixture.manager.acquire(descriptor.clone())).unwrap();
        let handle = lease.handle();

        // Shuffle the lease through moves, only the final owner releases.
        let moved = lease;
        let mut container = Vec::new();
        container.push(moved);
        let recovered = container.pop().unwrap();

        assert_eq!(fixture.manager.reference_count(handle), 1);

        drop(recovered);
        fixture.drain_lane(ResourceType::Shader);
        assert_eq!(fixture.manager.cache_len(ResourceType::Shader), 0);
    }

    #[test]
    fn types_do_not_collide() {
        let mut fixture = Fixture::new();
        let path = fixture.write_file("type-collision", b"same path");

        let shader = block_on(fixture.manager.acquire(ResourceDescriptor {
            ty: ResourceType::Shader,
            path: path.clone(),
        })).unwrap();
        let image = block_on(fixture.manager.acquire(ResourceDescriptor {
            ty: ResourceType::Image,
            path,
        })).unwrap();

        // Same path, different type: two independent cache entries.
        assert_eq!(shader.handle().resource_type(), ResourceType::Shader);
        assert_eq!(image.handle().resource_type(), ResourceType::Image);
        assert_eq!(fixture.manager.cache_len(ResourceType::Shader), 1);
        assert_eq!(fixture.manager.cache_len(ResourceType::Image), 1);
    }
}
