use std::mem;

use strom_shared::{
    log::{error, info, trace},
    span, Handle,
};
use strom_transfer::{Command, Priority, QueueKind, TicketStatus, TransferEngine};

use crate::{
    registry::{Entry, State},
    ResourceKind, ResourceRegistry, Result,
};

/// What happened during one call of [`ResourceRegistry::reconcile`]
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Number of decoded notifications that were received
    pub decoded: usize,
    /// Number of uploads that were submitted to the transfer engine
    pub uploads_started: usize,
    /// Number of resources that became resident on the device
    pub resident: usize,
    /// Number of resources whose upload failed
    pub failed: usize,
    /// New capacity when the registry grew past the capacity that was reported last time.
    /// Pools on the device that are indexed by handle slot have to be rebuilt with this capacity.
    pub capacity_changed: Option<usize>,
}

impl ReconcileReport {
    /// Returns whether anything changed.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl<K: ResourceKind> ResourceRegistry<K> {
    /// Advances the resources of the registry. Has to be called regularly by the owning thread.
    ///
    /// Starts the uploads of freshly decoded resources and marks resources as resident once
    /// their upload completed. This never blocks on the workers.
    pub fn reconcile(&self) -> ReconcileReport {
        let _span = span!("reconcile");
        let mut report = ReconcileReport::default();

        let notifications = self.notification_receiver.try_iter().collect::<Vec<_>>();
        report.decoded = notifications.len();

        let mut state = self.shared.state.lock();
        let State {
            entries,
            uploading,
            reported_capacity,
            ..
        } = &mut *state;
        for raw_handle in notifications {
            let handle = Handle::<Entry<K>>::from_raw(raw_handle);
            let Some(entry) = entries.get_mut(&handle) else {
                trace!("Ignoring notification of removed {handle:?}");
                continue;
            };
            let decoded = match &entry.decoded {
                Some(decoded) if entry.device.is_none() && entry.failure.is_none() && entry.ref_count > 0 => decoded.clone(),
                _ => continue,
            };
            match K::upload(&self.engine, &entry.name, &decoded, Priority::Normal) {
                Ok(payload) => {
                    trace!("Started upload of {} '{}' with {:?}", K::NAME, entry.name, payload.ticket);
                    entry.device = Some(payload);
                    uploading.push(raw_handle);
                    report.uploads_started += 1;
                }
                Err(err) => {
                    error!("Failed to upload {} '{}': {err}", K::NAME, entry.name);
                    entry.failure = Some(err.to_string());
                    report.failed += 1;
                }
            }
        }

        for raw_handle in mem::take(uploading) {
            let handle = Handle::<Entry<K>>::from_raw(raw_handle);
            let Some(entry) = entries.get_mut(&handle) else {
                continue;
            };
            // Released while the upload was in flight
            let Some(payload) = entry.device else {
                continue;
            };
            match self.engine.status(payload.ticket) {
                TicketStatus::Pending => uploading.push(raw_handle),
                TicketStatus::Ready => {
                    trace!("{} '{}' is resident", K::NAME, entry.name);
                    entry.resident = true;
                    report.resident += 1;
                }
                TicketStatus::Failed => {
                    error!("The device rejected the upload of {} '{}'", K::NAME, entry.name);
                    entry.failure = Some("the device rejected the upload".to_owned());
                    entry.device = None;
                    report.failed += 1;
                    self.free_device_payload(payload);
                }
            }
        }

        let slot_count = entries.slot_count();
        if slot_count > *reported_capacity {
            let capacity = slot_count.next_power_of_two();
            info!("Capacity of the {} registry changed to {capacity}", K::NAME);
            *reported_capacity = capacity;
            report.capacity_changed = Some(capacity);
        }
        report
    }
}

/// Records the acquire barriers of every completed upload on the consumer queue.
///
/// Returns the number of barriers that were submitted.
pub fn apply_acquire_barriers(engine: &TransferEngine) -> Result<usize> {
    let barriers = engine.take_acquire_barriers();
    if barriers.is_empty() {
        return Ok(0);
    }
    let commands = barriers.into_iter().map(Command::Barrier).collect::<Vec<_>>();
    engine.device().submit(QueueKind::Consumer, &[], &commands)?;
    trace!("Applied {} acquire barriers on the consumer queue", commands.len());
    Ok(commands.len())
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, sync::Arc, time::Duration};

    use strom_content::{texture::TextureData, Directories, IoPool, Origin};
    use strom_shared::StreamingConfig;
    use strom_test::{expect_within, setup_logger};
    use strom_transfer::{BarrierKind, HostDevice};
    use tempdir::TempDir;

    use super::*;
    use crate::{LoadState, Texture};

    const TIMEOUT: Duration = Duration::from_secs(5);

    struct Fixture {
        _root: TempDir,
        device: Arc<HostDevice>,
        engine: Arc<TransferEngine>,
        textures: ResourceRegistry<Texture>,
    }

    fn fixture() -> Fixture {
        setup_logger();
        let root = TempDir::new("reconciler").unwrap();
        let directories = Directories::create_all_dir(root.path().join("processed")).unwrap();
        let config = StreamingConfig::default();
        let device = Arc::new(HostDevice::new());
        let engine = Arc::new(TransferEngine::new(device.clone(), &config).unwrap());
        let io_pool = Arc::new(IoPool::new(2).unwrap());
        let textures = ResourceRegistry::new(io_pool, engine.clone(), directories, &config).unwrap();
        textures.register_materializer(
            "raw",
            Box::new(|source| TextureData::from_layers(source.name, 1, 1, &[source.bytes])),
        );
        Fixture {
            _root: root,
            device,
            engine,
            textures,
        }
    }

    #[test]
    fn upload_and_resident() {
        let fixture = fixture();
        let handle = fixture.textures.add(Origin::embedded("raw", vec![1, 2, 3, 4]), "pixel").unwrap();
        fixture.textures.acquire(handle);

        let report = RefCell::new(ReconcileReport::default());
        expect_within(
            TIMEOUT,
            || {
                let step = fixture.textures.reconcile();
                let mut report = report.borrow_mut();
                report.decoded += step.decoded;
                report.uploads_started += step.uploads_started;
                report.resident += step.resident;
                report.capacity_changed = report.capacity_changed.or(step.capacity_changed);
            },
            || report.borrow().resident == 1,
            "texture not resident",
        );
        let report = report.into_inner();
        assert_eq!(report.decoded, 1);
        assert_eq!(report.uploads_started, 1);
        assert_eq!(report.capacity_changed, Some(1));
        assert_eq!(fixture.textures.is_loaded(handle).unwrap(), LoadState::OnGpu);

        assert_eq!(apply_acquire_barriers(&fixture.engine).unwrap(), 1);
        assert_eq!(apply_acquire_barriers(&fixture.engine).unwrap(), 0);
        let kinds = fixture.device.barriers().into_iter().map(|barrier| barrier.kind).collect::<Vec<_>>();
        assert_eq!(kinds, vec![BarrierKind::Release, BarrierKind::Acquire]);
    }

    #[test]
    fn capacity_grows_in_powers_of_two() {
        let fixture = fixture();
        for index in 0..3 {
            fixture
                .textures
                .add(Origin::embedded("raw", vec![0, 0, 0, index]), format!("pixel {index}"))
                .unwrap();
        }
        assert_eq!(fixture.textures.reconcile().capacity_changed, Some(4));
        assert_eq!(fixture.textures.reconcile().capacity_changed, None);
        fixture.textures.add(Origin::embedded("raw", vec![0; 4]), "fourth").unwrap();
        assert_eq!(fixture.textures.reconcile().capacity_changed, None);
        fixture.textures.add(Origin::embedded("raw", vec![0; 4]), "fifth").unwrap();
        assert_eq!(fixture.textures.reconcile().capacity_changed, Some(8));
    }

    #[test]
    fn rejected_upload_fails_resource() {
        let fixture = fixture();
        let handle = fixture.textures.add(Origin::embedded("raw", vec![1, 2, 3, 4]), "pixel").unwrap();
        fixture.device.fail_next_submit();
        fixture.textures.acquire(handle);
        expect_within(
            TIMEOUT,
            || {
                fixture.textures.reconcile();
            },
            || fixture.textures.is_loaded(handle).unwrap() == LoadState::Failed,
            "upload didn't fail",
        );
        assert!(fixture.textures.device_payload(handle).unwrap().is_none());
        assert_eq!(fixture.device.object_count(), 0);
    }
}
