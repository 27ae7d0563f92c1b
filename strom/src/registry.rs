use std::{
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Weak,
    },
};

use serde::{Deserialize, Serialize};
use strom_content::{
    catch_panic,
    resource_file::{read_resource_file, write_resource_file},
    run_materializer, sanitize_file_stem, Directories, IoPool, IoTask, IoTaskHandler, IoTaskKind, Materializer,
    MaterializerRegistry, Origin,
};
use strom_shared::{
    ahash::AHashSet,
    crossbeam_channel::{self, Receiver, Sender},
    derive_where::derive_where,
    log::{error, info, trace, warn},
    parking_lot::{Mutex, RwLock},
    serde_yaml, Handle, SlotArena, StreamingConfig,
};
use strom_transfer::{Priority, TicketStatus, TransferDevice, TransferEngine};

use crate::{DevicePayload, Error, ResourceKind, Result};

/// Where a resource is in the streaming pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    /// Only the canonical file exists or the resource isn't materialized yet
    OnDisk,
    /// The decoded data is in memory
    OnCpu,
    /// The upload to the device completed
    OnGpu,
    /// Materializing, loading or uploading failed
    Failed,
}

pub(crate) struct Entry<K: ResourceKind> {
    pub(crate) name: String,
    pub(crate) origin: Origin,
    pub(crate) canonical_path: PathBuf,
    pub(crate) ref_count: u32,
    pub(crate) decoded: Option<Arc<K::Decoded>>,
    pub(crate) device: Option<DevicePayload>,
    pub(crate) materialized: bool,
    pub(crate) pending_load: bool,
    pub(crate) resident: bool,
    pub(crate) failure: Option<String>,
}

impl<K: ResourceKind> Default for Entry<K> {
    fn default() -> Self {
        Self {
            name: String::new(),
            origin: Origin::from_path(PathBuf::new()),
            canonical_path: PathBuf::new(),
            ref_count: 0,
            decoded: None,
            device: None,
            materialized: false,
            pending_load: false,
            resident: false,
            failure: None,
        }
    }
}

pub(crate) struct State<K: ResourceKind> {
    pub(crate) entries: SlotArena<Entry<K>>,
    /// Raw handles with a load in flight
    pub(crate) initializing: AHashSet<u32>,
    /// Raw handles whose upload was submitted and isn't resolved yet
    pub(crate) uploading: Vec<u32>,
    pub(crate) placeholder: Option<DevicePayload>,
    pub(crate) reported_capacity: usize,
}

pub(crate) struct Shared<K: ResourceKind> {
    pub(crate) state: Mutex<State<K>>,
    materializers: RwLock<MaterializerRegistry<K::Decoded>>,
    directories: Directories,
    io_pool: Arc<IoPool>,
    notification_sender: Sender<u32>,
    scheduled_loads: AtomicUsize,
}

/// Observes whether the resource a handle referred to was removed.
///
/// The token is cancelled when the slot of the handle was recycled or removed or when the
/// registry was dropped. Work for a cancelled token will never be committed.
#[derive_where(Clone)]
#[derive_where(crate = strom_shared::derive_where)]
pub struct CancelToken<K: ResourceKind> {
    shared: Weak<Shared<K>>,
    handle: Handle<K>,
}

impl<K: ResourceKind> CancelToken<K> {
    pub fn is_cancelled(&self) -> bool {
        match self.shared.upgrade() {
            Some(shared) => !shared.state.lock().entries.is_live(&self.handle.cast()),
            None => true,
        }
    }

    pub fn handle(&self) -> Handle<K> {
        self.handle
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct IndexEntry {
    name: String,
    handle: u32,
    /// `None` for embedded origins. They are restored from the canonical file.
    origin: Option<PathBuf>,
    canonical_path: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct RegistryIndex {
    file_type: String,
    entries: Vec<IndexEntry>,
}

/// Reference counted resources of one [`ResourceKind`] addressed by generation-checked handles.
///
/// Every resource goes through the states `OnDisk → OnCpu → OnGpu`. The blocking work is
/// done on the [`IoPool`] and the upload by the [`TransferEngine`]. The owning thread has to
/// call [`ResourceRegistry::reconcile`] regularly to start uploads and to observe their
/// completion.
pub struct ResourceRegistry<K: ResourceKind> {
    pub(crate) shared: Arc<Shared<K>>,
    pub(crate) engine: Arc<TransferEngine>,
    pub(crate) notification_receiver: Receiver<u32>,
}

impl<K: ResourceKind> ResourceRegistry<K> {
    /// Creates an empty registry with the default materializers of the kind registered.
    pub fn new(
        io_pool: Arc<IoPool>,
        engine: Arc<TransferEngine>,
        directories: Directories,
        config: &StreamingConfig,
    ) -> Result<Self> {
        config.check()?;
        directories.check()?;
        let mut materializers = MaterializerRegistry::default();
        K::register_default_materializers(&mut materializers);
        let (notification_sender, notification_receiver) = crossbeam_channel::bounded(config.notification_capacity);
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                entries: SlotArena::new(),
                initializing: AHashSet::new(),
                uploading: Vec::new(),
                placeholder: None,
                reported_capacity: 0,
            }),
            materializers: RwLock::new(materializers),
            directories,
            io_pool,
            notification_sender,
            scheduled_loads: AtomicUsize::new(0),
        });
        info!("Created ResourceRegistry for {}", K::NAME);
        Ok(Self {
            shared,
            engine,
            notification_receiver,
        })
    }

    /// Registers a materializer for the extension. A previous registration is replaced.
    pub fn register_materializer(&self, extension: impl Into<String>, materializer: Box<Materializer<K::Decoded>>) {
        self.shared.materializers.write().register(extension, materializer);
    }

    /// Adds a resource and schedules its materialization. This returns immediately.
    ///
    /// Fails when no materializer is registered for the extension of the origin.
    pub fn add(&self, origin: Origin, name: impl Into<String>) -> Result<Handle<K>> {
        self.shared.materializers.read().get(&origin)?;
        let name = name.into();

        let handle = {
            let mut state = self.shared.state.lock();
            let handle = state.entries.insert(Entry {
                name: name.clone(),
                origin: origin.clone(),
                ..Entry::default()
            });
            let canonical_path = self.canonical_path(&name, handle.raw());
            if let Some(entry) = state.entries.get_mut(&handle) {
                entry.canonical_path = canonical_path;
            }
            handle
        };

        let task = IoTask {
            kind: IoTaskKind::Materialize,
            handle: handle.raw(),
            origin,
        };
        if let Err(err) = self.shared.io_pool.submit(task, self.task_handler()) {
            self.shared.state.lock().entries.remove(&handle);
            return Err(err.into());
        }
        trace!("Added {} '{name}' as {handle:?}", K::NAME);
        Ok(handle.cast())
    }

    /// Increments the reference count. The first acquire schedules the load.
    ///
    /// Stale and null handles are ignored.
    pub fn acquire(&self, handle: Handle<K>) {
        let mut state = self.shared.state.lock();
        let State {
            entries, initializing, ..
        } = &mut *state;
        let Some(entry) = entries.get_mut(&handle.cast()) else {
            trace!("Ignoring acquire of stale {handle:?}");
            return;
        };
        entry.ref_count += 1;
        if entry.ref_count > 1 {
            return;
        }

        entry.decoded = None;
        entry.resident = false;
        if let Some(payload) = entry.device.take() {
            warn!("{} '{}' had a device payload without references", K::NAME, entry.name);
            self.free_device_payload(payload);
        }
        if entry.failure.is_some() || initializing.contains(&handle.raw()) {
            return;
        }
        if !entry.materialized {
            entry.pending_load = true;
            return;
        }
        let origin = entry.origin.clone();
        self.shared.schedule_load(initializing, handle.raw(), origin, self.task_handler());
    }

    /// Decrements the reference count. The last release frees the decoded data and the device object.
    ///
    /// Stale and null handles are ignored.
    pub fn release(&self, handle: Handle<K>) {
        let mut state = self.shared.state.lock();
        let Some(entry) = state.entries.get_mut(&handle.cast()) else {
            trace!("Ignoring release of stale {handle:?}");
            return;
        };
        if entry.ref_count == 0 {
            warn!("Ignoring release of {handle:?} without references");
            return;
        }
        entry.ref_count -= 1;
        if entry.ref_count > 0 {
            return;
        }

        trace!("Freeing the payloads of {} '{}'", K::NAME, entry.name);
        entry.pending_load = false;
        entry.resident = false;
        entry.decoded = None;
        if let Some(payload) = entry.device.take() {
            self.free_device_payload(payload);
        }
    }

    /// Removes the resource and deletes its canonical file.
    ///
    /// Returns `false` when the handle is stale or the resource is still referenced.
    pub fn remove(&self, handle: Handle<K>) -> bool {
        let mut state = self.shared.state.lock();
        match state.entries.get(&handle.cast()) {
            Some(entry) if entry.ref_count == 0 => {}
            _ => return false,
        }
        let Some(entry) = state.entries.remove(&handle.cast()) else {
            return false;
        };
        state.uploading.retain(|raw| *raw != handle.raw());
        if let Some(payload) = entry.device {
            self.free_device_payload(payload);
        }
        if entry.canonical_path.exists() {
            if let Err(err) = fs::remove_file(&entry.canonical_path) {
                warn!("Failed to delete '{}': {err}", entry.canonical_path.display());
            }
        }
        trace!("Removed {} '{}' at {handle:?}", K::NAME, entry.name);
        true
    }

    pub fn name(&self, handle: Handle<K>) -> Result<String> {
        self.with_entry(handle, |entry| entry.name.clone())
    }

    pub fn origin(&self, handle: Handle<K>) -> Result<Origin> {
        self.with_entry(handle, |entry| entry.origin.clone())
    }

    pub fn ref_count(&self, handle: Handle<K>) -> Result<u32> {
        self.with_entry(handle, |entry| entry.ref_count)
    }

    /// Decoded data while the resource is referenced and loaded
    pub fn decoded(&self, handle: Handle<K>) -> Result<Option<Arc<K::Decoded>>> {
        self.with_entry(handle, |entry| entry.decoded.clone())
    }

    /// Error message of a failed resource
    pub fn failure(&self, handle: Handle<K>) -> Result<Option<String>> {
        self.with_entry(handle, |entry| entry.failure.clone())
    }

    /// Device payload of the resource. Failed resources return the placeholder.
    ///
    /// The payload is returned as soon as the upload started. Use the ticket to check
    /// whether the upload completed.
    pub fn device_payload(&self, handle: Handle<K>) -> Result<Option<DevicePayload>> {
        let state = self.shared.state.lock();
        let entry = state.entries.get(&handle.cast()).ok_or(Error::BadGeneration)?;
        if entry.failure.is_some() {
            return Ok(state.placeholder);
        }
        Ok(entry.device)
    }

    pub fn is_loaded(&self, handle: Handle<K>) -> Result<LoadState> {
        let state = self.shared.state.lock();
        let entry = state.entries.get(&handle.cast()).ok_or(Error::BadGeneration)?;
        if entry.failure.is_some() {
            return Ok(LoadState::Failed);
        }
        if let Some(payload) = &entry.device {
            if self.engine.status(payload.ticket) == TicketStatus::Ready {
                return Ok(LoadState::OnGpu);
            }
        }
        if entry.decoded.is_some() {
            return Ok(LoadState::OnCpu);
        }
        Ok(LoadState::OnDisk)
    }

    /// Returns whether the handle refers to a resource of this registry.
    pub fn is_live(&self, handle: Handle<K>) -> bool {
        self.shared.state.lock().entries.is_live(&handle.cast())
    }

    pub fn cancel_token(&self, handle: Handle<K>) -> CancelToken<K> {
        CancelToken {
            shared: Arc::downgrade(&self.shared),
            handle,
        }
    }

    /// Sets the payload that is returned for failed resources.
    pub fn set_placeholder(&self, placeholder: DevicePayload) {
        self.shared.state.lock().placeholder = Some(placeholder);
    }

    /// Uploads the placeholder of the kind and sets it when the kind has one.
    pub fn upload_placeholder(&self) -> Result<Option<DevicePayload>> {
        let Some(decoded) = K::placeholder() else {
            return Ok(None);
        };
        let payload = K::upload(&self.engine, "placeholder", &decoded, Priority::High)?;
        self.set_placeholder(payload);
        Ok(Some(payload))
    }

    /// Handles of all resources
    pub fn handles(&self) -> Vec<Handle<K>> {
        let state = self.shared.state.lock();
        state.entries.iter().map(|(handle, _)| handle.cast()).collect()
    }

    /// Number of resources
    pub fn len(&self) -> usize {
        self.shared.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of loads that were handed to the I/O pool
    pub fn scheduled_loads(&self) -> usize {
        self.shared.scheduled_loads.load(Ordering::SeqCst)
    }

    /// Returns whether no load and no upload is in flight.
    pub fn is_idle(&self) -> bool {
        let state = self.shared.state.lock();
        let waiting_for_materialize = state.entries.iter().any(|(_, entry)| entry.pending_load);
        state.initializing.is_empty() && state.uploading.is_empty() && !waiting_for_materialize && self.notification_receiver.is_empty()
    }

    /// Writes the index that maps the names of the resources to their handles.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let index = {
            let state = self.shared.state.lock();
            RegistryIndex {
                file_type: K::FILE_TYPE.to_owned(),
                entries: state
                    .entries
                    .iter()
                    .map(|(handle, entry)| IndexEntry {
                        name: entry.name.clone(),
                        handle: handle.raw(),
                        origin: entry.origin.path().map(Path::to_owned),
                        canonical_path: entry.canonical_path.clone(),
                    })
                    .collect(),
            }
        };
        let temporary_path = path.with_extension("yaml.tmp");
        fs::write(&temporary_path, serde_yaml::to_string(&index)?)?;
        fs::rename(&temporary_path, path)?;
        info!("Saved index with {} {} resources to '{}'", index.entries.len(), K::NAME, path.display());
        Ok(())
    }

    /// Restores the resources of an index written by [`ResourceRegistry::save`] with their handles.
    ///
    /// Entries whose slot is occupied are skipped. Resources whose canonical file is missing
    /// are materialized again when their origin is a path. Returns the number of restored resources.
    pub fn load(&self, path: impl AsRef<Path>) -> Result<usize> {
        let path = path.as_ref();
        let index: RegistryIndex = serde_yaml::from_str(&fs::read_to_string(path)?)?;
        if index.file_type != K::FILE_TYPE {
            return Err(strom_content::Error::UnexpectedFileType {
                expected: K::FILE_TYPE.to_owned(),
                found: index.file_type,
            }
            .into());
        }

        let mut restored = 0;
        for index_entry in index.entries {
            let handle = Handle::<Entry<K>>::from_raw(index_entry.handle);
            if handle.generation() == 0 {
                warn!("Skipping '{}' with the invalid handle {:#x}", index_entry.name, index_entry.handle);
                continue;
            }
            let materialized = index_entry.canonical_path.is_file();
            let origin = match (&index_entry.origin, materialized) {
                (_, true) => Origin::from_path(index_entry.origin.clone().unwrap_or(index_entry.canonical_path.clone())),
                (Some(origin), false) => Origin::from_path(origin),
                (None, false) => {
                    warn!("Skipping '{}' because its canonical file is missing", index_entry.name);
                    continue;
                }
            };
            let entry = Entry {
                name: index_entry.name.clone(),
                origin: origin.clone(),
                canonical_path: index_entry.canonical_path,
                materialized,
                ..Entry::default()
            };
            if !self.shared.state.lock().entries.insert_at(handle, entry) {
                warn!("Skipping '{}' because {handle:?} is occupied", index_entry.name);
                continue;
            }
            if !materialized {
                let task = IoTask {
                    kind: IoTaskKind::Materialize,
                    handle: handle.raw(),
                    origin,
                };
                if let Err(err) = self.shared.io_pool.submit(task, self.task_handler()) {
                    self.shared.state.lock().entries.remove(&handle);
                    return Err(err.into());
                }
            }
            restored += 1;
        }
        info!("Restored {restored} {} resources from '{}'", K::NAME, path.display());
        Ok(restored)
    }

    /// Destroys the device object. The ticket of a failed upload is retired.
    pub(crate) fn free_device_payload(&self, payload: DevicePayload) {
        if self.engine.status(payload.ticket) == TicketStatus::Failed {
            self.engine.retire(payload.ticket);
        }
        self.engine.device().destroy(payload.object);
    }

    fn with_entry<T>(&self, handle: Handle<K>, f: impl FnOnce(&Entry<K>) -> T) -> Result<T> {
        let state = self.shared.state.lock();
        state.entries.get(&handle.cast()).map(f).ok_or(Error::BadGeneration)
    }

    fn canonical_path(&self, name: &str, raw_handle: u32) -> PathBuf {
        let file_name = format!("{}-{raw_handle:08x}.{}", sanitize_file_stem(name), K::FILE_TYPE);
        self.shared.directories.processed_path().join(file_name)
    }

    fn task_handler(&self) -> Arc<dyn IoTaskHandler> {
        Arc::new(TaskHandler {
            shared: Arc::downgrade(&self.shared),
        })
    }
}

impl<K: ResourceKind> Shared<K> {
    /// Marks the handle as initializing and hands the load to the I/O pool.
    fn schedule_load(&self, initializing: &mut AHashSet<u32>, raw_handle: u32, origin: Origin, handler: Arc<dyn IoTaskHandler>) {
        if !initializing.insert(raw_handle) {
            return;
        }
        let task = IoTask {
            kind: IoTaskKind::Load,
            handle: raw_handle,
            origin,
        };
        match self.io_pool.submit(task, handler) {
            Ok(()) => {
                self.scheduled_loads.fetch_add(1, Ordering::SeqCst);
            }
            Err(err) => {
                error!("Failed to schedule the load of {raw_handle:#x}: {err}");
                initializing.remove(&raw_handle);
            }
        }
    }
}

/// Executes the tasks of a registry on the I/O pool. Holds a weak reference so that queued
/// tasks don't keep a dropped registry alive.
struct TaskHandler<K: ResourceKind> {
    shared: Weak<Shared<K>>,
}

impl<K: ResourceKind> IoTaskHandler for TaskHandler<K> {
    fn handle(&self, task: IoTask) {
        let Some(shared) = self.shared.upgrade() else {
            trace!("Dropping {:?} of {:#x} because the registry is gone", task.kind, task.handle);
            return;
        };
        match task.kind {
            IoTaskKind::Materialize => self.materialize(&shared, task),
            IoTaskKind::Load => self.load(&shared, task),
        }
    }
}

impl<K: ResourceKind> TaskHandler<K> {
    fn materialize(&self, shared: &Shared<K>, task: IoTask) {
        let handle = Handle::<Entry<K>>::from_raw(task.handle);
        let Some((name, canonical_path)) = shared
            .state
            .lock()
            .entries
            .get(&handle)
            .map(|entry| (entry.name.clone(), entry.canonical_path.clone()))
        else {
            trace!("Skipping materialization of removed {handle:?}");
            return;
        };

        let temporary_path = canonical_path.with_extension(format!("{}.tmp", K::FILE_TYPE));
        let result = catch_panic(&name, || {
            let materializer = shared.materializers.read().get(&task.origin)?;
            let decoded = run_materializer(&*materializer, &name, &task.origin)?;
            write_resource_file(&temporary_path, K::FILE_TYPE, &decoded)
        });

        // The rename happens under the lock so that a concurrent remove can't leave a file behind.
        let mut state = shared.state.lock();
        let State {
            entries, initializing, ..
        } = &mut *state;
        let Some(entry) = entries.get_mut(&handle) else {
            trace!("Discarding materialization of removed {handle:?}");
            let _ = fs::remove_file(&temporary_path);
            return;
        };
        let result = result.and_then(|()| fs::rename(&temporary_path, &canonical_path).map_err(strom_content::Error::from));
        match result {
            Ok(()) => {
                info!("Materialized {} '{name}' to '{}'", K::NAME, canonical_path.display());
                entry.materialized = true;
                if entry.pending_load {
                    entry.pending_load = false;
                    let origin = entry.origin.clone();
                    let handler = Arc::new(TaskHandler::<K> {
                        shared: self.shared.clone(),
                    });
                    shared.schedule_load(initializing, task.handle, origin, handler);
                }
            }
            Err(err) => {
                error!("Failed to materialize {} '{name}': {err}", K::NAME);
                let _ = fs::remove_file(&temporary_path);
                entry.pending_load = false;
                entry.failure = Some(err.to_string());
            }
        }
    }

    fn load(&self, shared: &Shared<K>, task: IoTask) {
        let handle = Handle::<Entry<K>>::from_raw(task.handle);
        let token = CancelToken {
            shared: self.shared.clone(),
            handle: handle.cast::<K>(),
        };
        let canonical_path = {
            let mut state = shared.state.lock();
            let canonical_path = state
                .entries
                .get(&handle)
                .filter(|entry| entry.ref_count > 0)
                .map(|entry| entry.canonical_path.clone());
            let Some(canonical_path) = canonical_path else {
                trace!("Skipping load of {handle:?} because it was released or removed");
                state.initializing.remove(&task.handle);
                return;
            };
            canonical_path
        };

        let result = catch_panic(&canonical_path.display().to_string(), || {
            read_resource_file::<K::Decoded>(&canonical_path, K::FILE_TYPE)
        });
        if token.is_cancelled() {
            trace!("Discarding load of removed {handle:?}");
            shared.state.lock().initializing.remove(&task.handle);
            return;
        }

        {
            let mut state = shared.state.lock();
            state.initializing.remove(&task.handle);
            let Some(entry) = state.entries.get_mut(&handle) else {
                trace!("Discarding load of removed {handle:?}");
                return;
            };
            if entry.ref_count == 0 {
                trace!("Discarding load of released {handle:?}");
                return;
            }
            match result {
                Ok(decoded) => {
                    trace!("Loaded {} '{}'", K::NAME, entry.name);
                    entry.decoded = Some(Arc::new(decoded));
                }
                Err(err) => {
                    error!("Failed to load {} '{}': {err}", K::NAME, entry.name);
                    entry.failure = Some(err.to_string());
                    return;
                }
            }
        }

        // Only the workers block on the bounded channel, never while holding the lock.
        if shared.notification_sender.send(task.handle).is_err() {
            warn!("Failed to notify the registry about {handle:?}");
        }
    }
}
