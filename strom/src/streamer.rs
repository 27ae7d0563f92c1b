use std::{
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use strom_content::{Directories, IoPool};
use strom_shared::{
    format_bytes,
    log::{info, warn},
    spin_sleep, StreamingConfig,
};
use strom_transfer::{TransferDevice, TransferEngine};

use crate::{apply_acquire_barriers, Model, ReconcileReport, ResourceRegistry, Result, Texture};

/// File name of the model index in the processed directory
pub const MODEL_INDEX_FILE_NAME: &str = "models.yaml";
/// File name of the texture index in the processed directory
pub const TEXTURE_INDEX_FILE_NAME: &str = "textures.yaml";

/// What happened during one call of [`Streamer::update`]
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StreamerReport {
    pub models: ReconcileReport,
    pub textures: ReconcileReport,
    /// Number of acquire barriers that were submitted on the consumer queue
    pub acquire_barriers: usize,
}

/// Context of a streaming session.
///
/// Owns the registries for models and textures and the threads they share. Everything is
/// torn down in [`Streamer::shutdown`] or when the `Streamer` is dropped.
pub struct Streamer {
    config: StreamingConfig,
    directories: Directories,
    io_pool: Arc<IoPool>,
    engine: Arc<TransferEngine>,
    models: ResourceRegistry<Model>,
    textures: ResourceRegistry<Texture>,
}

impl Streamer {
    pub fn new(device: Arc<dyn TransferDevice>, directories: Directories, config: StreamingConfig) -> Result<Self> {
        config.check()?;
        let io_pool = Arc::new(IoPool::new(config.io_worker_count)?);
        let engine = Arc::new(TransferEngine::new(device, &config)?);
        let models = ResourceRegistry::new(io_pool.clone(), engine.clone(), directories.clone(), &config)?;
        let textures = ResourceRegistry::new(io_pool.clone(), engine.clone(), directories.clone(), &config)?;
        models.upload_placeholder()?;
        textures.upload_placeholder()?;
        info!(
            "Created Streamer with {} I/O threads and {} of staging memory in '{}'",
            io_pool.thread_count(),
            format_bytes(config.staging_capacity),
            directories.processed_path().display()
        );
        Ok(Self {
            config,
            directories,
            io_pool,
            engine,
            models,
            textures,
        })
    }

    pub fn models(&self) -> &ResourceRegistry<Model> {
        &self.models
    }

    pub fn textures(&self) -> &ResourceRegistry<Texture> {
        &self.textures
    }

    pub fn engine(&self) -> &TransferEngine {
        &self.engine
    }

    pub fn config(&self) -> &StreamingConfig {
        &self.config
    }

    /// Reconciles both registries and hands the completed uploads over to the consumer queue.
    ///
    /// Has to be called once per frame by the owning thread.
    pub fn update(&self) -> Result<StreamerReport> {
        let models = self.models.reconcile();
        let textures = self.textures.reconcile();
        let acquire_barriers = apply_acquire_barriers(&self.engine)?;
        Ok(StreamerReport {
            models,
            textures,
            acquire_barriers,
        })
    }

    /// Returns whether no work is in flight in any of the threads.
    pub fn is_idle(&self) -> bool {
        self.io_pool.is_idle() && self.models.is_idle() && self.textures.is_idle() && self.engine.is_idle()
    }

    /// Writes the indices of both registries into the processed directory.
    pub fn save_index(&self) -> Result<()> {
        self.models.save(self.index_path(MODEL_INDEX_FILE_NAME))?;
        self.textures.save(self.index_path(TEXTURE_INDEX_FILE_NAME))?;
        Ok(())
    }

    /// Restores the indices that exist in the processed directory. Returns the number of restored resources.
    pub fn load_index(&self) -> Result<usize> {
        let mut restored = 0;
        let model_index = self.index_path(MODEL_INDEX_FILE_NAME);
        if model_index.is_file() {
            restored += self.models.load(model_index)?;
        }
        let texture_index = self.index_path(TEXTURE_INDEX_FILE_NAME);
        if texture_index.is_file() {
            restored += self.textures.load(texture_index)?;
        }
        Ok(restored)
    }

    /// Drains the outstanding work and stops the transfer thread.
    ///
    /// Spins for at most [`StreamingConfig::shutdown_timeout`]. Returns whether everything was drained.
    pub fn shutdown(&self) -> Result<bool> {
        let timeout = self.config.shutdown_timeout();
        let start = Instant::now();
        let drained = loop {
            self.update()?;
            if self.is_idle() {
                break true;
            }
            if start.elapsed() >= timeout {
                break false;
            }
            spin_sleep::sleep(Duration::from_millis(1));
        };
        if drained {
            info!("Streamer drained in {:?}", start.elapsed());
        } else {
            warn!("Streamer didn't drain within {timeout:?}");
        }
        self.engine.shutdown();
        Ok(drained)
    }

    fn index_path(&self, file_name: &str) -> PathBuf {
        self.directories.processed_path().join(file_name)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use strom_content::{model::ModelData, Origin};
    use strom_shared::parking_lot::Mutex;
    use strom_test::{
        expect_within,
        fixtures::{TRIANGLE_DEVICE_SIZE, TRIANGLE_GLTF},
        setup_logger,
        spectral::{assert_that, prelude::*},
    };
    use strom_transfer::{DeviceObject, HostDevice};
    use tempdir::TempDir;

    use super::*;
    use crate::{Error, LoadState};

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn config() -> StreamingConfig {
        StreamingConfig {
            io_worker_count: 2,
            transfer_idle_wait_ms: 1,
            ..StreamingConfig::default()
        }
    }

    fn streamer(root: &TempDir, device: &Arc<HostDevice>) -> Streamer {
        setup_logger();
        let directories = Directories::create_all_dir(root.path().join("processed")).unwrap();
        Streamer::new(device.clone(), directories, config()).unwrap()
    }

    fn update_until(streamer: &Streamer, condition: impl FnMut() -> bool, message: &str) {
        expect_within(
            TIMEOUT,
            || {
                streamer.update().unwrap();
            },
            condition,
            message,
        );
    }

    #[test]
    fn end_to_end() {
        let root = TempDir::new("streamer").unwrap();
        let path = root.path().join("a.glb");
        fs::write(&path, TRIANGLE_GLTF).unwrap();
        let device = Arc::new(HostDevice::new());
        let streamer = streamer(&root, &device);
        let models = streamer.models();

        let h1 = models.add(Origin::from_path(&path), "A").unwrap();
        models.acquire(h1);
        models.acquire(h1);
        update_until(&streamer, || models.is_loaded(h1).unwrap() == LoadState::OnGpu, "model not on the GPU");
        assert_eq!(models.scheduled_loads(), 1);
        assert_eq!(models.ref_count(h1).unwrap(), 2);

        let payload = models.device_payload(h1).unwrap().unwrap();
        assert_eq!(payload.size, TRIANGLE_DEVICE_SIZE);
        let DeviceObject::Buffer(buffer) = payload.object else {
            panic!("expected a buffer");
        };
        let decoded: Arc<ModelData> = models.decoded(h1).unwrap().unwrap();
        assert_eq!(device.buffer_data(buffer).unwrap(), decoded.device_bytes());

        models.release(h1);
        assert_eq!(models.ref_count(h1).unwrap(), 1);
        assert!(models.device_payload(h1).unwrap().is_some());
        assert_eq!(models.is_loaded(h1).unwrap(), LoadState::OnGpu);

        models.release(h1);
        assert_eq!(models.ref_count(h1).unwrap(), 0);
        assert!(models.device_payload(h1).unwrap().is_none());
        assert!(models.decoded(h1).unwrap().is_none());
        assert_eq!(models.is_loaded(h1).unwrap(), LoadState::OnDisk);
        assert!(device.buffer_data(buffer).is_none());

        assert!(models.remove(h1));
        assert!(matches!(models.name(h1), Err(Error::BadGeneration)));
        assert!(streamer.shutdown().unwrap());
    }

    #[test]
    fn failed_texture_uses_placeholder() {
        let root = TempDir::new("streamer").unwrap();
        let device = Arc::new(HostDevice::new());
        let streamer = streamer(&root, &device);
        let textures = streamer.textures();

        let handle = textures.add(Origin::embedded("png", vec![1, 2, 3]), "broken").unwrap();
        textures.acquire(handle);
        update_until(&streamer, || textures.is_loaded(handle).unwrap() == LoadState::Failed, "texture didn't fail");

        let failure = textures.failure(handle).unwrap();
        assert_that!(failure).is_some();
        let placeholder = textures.device_payload(handle).unwrap().unwrap();
        assert!(matches!(placeholder.object, DeviceObject::Image(_)));
        update_until(&streamer, || streamer.engine().is_ready(placeholder.ticket), "placeholder not uploaded");

        // Failed resources still release and remove cleanly.
        textures.release(handle);
        assert!(textures.remove(handle));
        assert!(streamer.shutdown().unwrap());
    }

    #[test]
    fn index_round_trip() {
        let root = TempDir::new("streamer").unwrap();
        let path = root.path().join("triangle.gltf");
        fs::write(&path, TRIANGLE_GLTF).unwrap();
        let device = Arc::new(HostDevice::new());

        let (handle, embedded) = {
            let streamer = streamer(&root, &device);
            let models = streamer.models();
            let handle = models.add(Origin::from_path(&path), "triangle").unwrap();
            let embedded = models
                .add(Origin::embedded("gltf", TRIANGLE_GLTF.as_bytes().to_vec()), "embedded")
                .unwrap();
            update_until(&streamer, || streamer.is_idle(), "materialization not finished");
            streamer.save_index().unwrap();
            assert!(streamer.shutdown().unwrap());
            (handle, embedded)
        };

        let streamer = streamer(&root, &device);
        assert_eq!(streamer.load_index().unwrap(), 2);
        let models = streamer.models();
        assert_eq!(models.name(handle).unwrap(), "triangle");
        assert_eq!(models.name(embedded).unwrap(), "embedded");

        // The canonical file is used directly, so the load doesn't need the origin.
        models.acquire(embedded);
        update_until(&streamer, || models.is_loaded(embedded).unwrap() == LoadState::OnGpu, "model not on the GPU");

        // New resources don't collide with the restored handles.
        let added = models.add(Origin::from_path(&path), "another").unwrap();
        assert_ne!(added.slot(), handle.slot());
        assert_ne!(added.slot(), embedded.slot());
        assert!(streamer.shutdown().unwrap());
    }

    #[test]
    fn concurrent_acquire_schedules_one_load() {
        let root = TempDir::new("streamer").unwrap();
        let device = Arc::new(HostDevice::new());
        let streamer = streamer(&root, &device);
        let models = streamer.models();
        let handle = models
            .add(Origin::embedded("gltf", TRIANGLE_GLTF.as_bytes().to_vec()), "shared")
            .unwrap();
        update_until(&streamer, || streamer.is_idle(), "materialization not finished");

        let acquired = Mutex::new(0);
        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    models.acquire(handle);
                    *acquired.lock() += 1;
                });
            }
        });
        assert_eq!(*acquired.lock(), 4);
        update_until(&streamer, || models.is_loaded(handle).unwrap() == LoadState::OnGpu, "model not on the GPU");
        assert_eq!(models.scheduled_loads(), 1);
        assert_eq!(models.ref_count(handle).unwrap(), 4);

        for _ in 0..4 {
            models.release(handle);
        }
        assert_eq!(models.ref_count(handle).unwrap(), 0);
        assert!(models.device_payload(handle).unwrap().is_none());
        assert!(streamer.shutdown().unwrap());
    }
}
