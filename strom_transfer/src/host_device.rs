use std::{
    collections::VecDeque,
    sync::atomic::{AtomicBool, Ordering},
    time::{Duration, Instant},
};

use strom_shared::{
    ahash::AHashMap,
    log::{info, trace, warn},
    parking_lot::Mutex,
    spin_sleep, thread_id, DebugInfo,
};

use crate::{
    device::{Barrier, BufferId, Command, DeviceObject, ImageDesc, ImageId, QueueKind, TransferDevice},
    Error, Result,
};

struct HostImage {
    desc: ImageDesc,
    data: Vec<u8>,
}

struct PendingSubmission {
    counter: u64,
    staging: Vec<u8>,
    commands: Vec<Command>,
}

#[derive(Default)]
struct QueueState {
    submitted: u64,
    completed: u64,
    submission_count: usize,
    pending: VecDeque<PendingSubmission>,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    buffers: AHashMap<BufferId, Vec<u8>>,
    images: AHashMap<ImageId, HostImage>,
    transfer: QueueState,
    consumer: QueueState,
    barriers: Vec<Barrier>,
}

impl Inner {
    fn queue_mut(&mut self, queue: QueueKind) -> &mut QueueState {
        match queue {
            QueueKind::Transfer => &mut self.transfer,
            QueueKind::Consumer => &mut self.consumer,
        }
    }

    fn queue(&self, queue: QueueKind) -> &QueueState {
        match queue {
            QueueKind::Transfer => &self.transfer,
            QueueKind::Consumer => &self.consumer,
        }
    }

    /// Checks that every copy stays inside the staging region and its destination.
    ///
    /// Copies into objects that don't exist are skipped on execution and pass.
    fn validate(&self, staging: &[u8], commands: &[Command]) -> Result<()> {
        let staging_len = staging.len() as u64;
        for command in commands {
            match command {
                Command::CopyBuffer {
                    staging_offset,
                    buffer,
                    offset,
                    size,
                } => {
                    let Some(data) = self.buffers.get(buffer) else {
                        continue;
                    };
                    if !fits(*staging_offset, *size, staging_len) {
                        return Err(Error::Device(format!(
                            "copy of {size} bytes from staging offset {staging_offset} exceeds the staging region of {staging_len} bytes"
                        )));
                    }
                    if !fits(*offset, *size, data.len() as u64) {
                        return Err(Error::Device(format!(
                            "copy of {size} bytes to offset {offset} exceeds {buffer:?} with {} bytes",
                            data.len()
                        )));
                    }
                }
                Command::CopyImage {
                    staging_offset,
                    image,
                    extent,
                    row_pitch,
                    base_layer,
                    layer_count,
                    ..
                } => {
                    let Some(host_image) = self.images.get(image) else {
                        continue;
                    };
                    let desc = &host_image.desc;
                    if *extent != desc.extent {
                        return Err(Error::Device(format!(
                            "copy with extent {extent:?} into {image:?} with extent {:?}",
                            desc.extent
                        )));
                    }
                    if *row_pitch < desc.row_pitch() {
                        return Err(Error::Device(format!(
                            "row pitch {row_pitch} is smaller than the row of {image:?} with {} bytes",
                            desc.row_pitch()
                        )));
                    }
                    if !fits(*base_layer as u64, *layer_count as u64, desc.layers as u64) {
                        return Err(Error::Device(format!(
                            "copy of layers {base_layer}..{} exceeds {image:?} with {} layers",
                            *base_layer as u64 + *layer_count as u64,
                            desc.layers
                        )));
                    }
                    let size = *row_pitch as u64 * extent.height as u64 * *layer_count as u64;
                    if !fits(*staging_offset, size, staging_len) {
                        return Err(Error::Device(format!(
                            "copy of {size} bytes from staging offset {staging_offset} exceeds the staging region of {staging_len} bytes"
                        )));
                    }
                }
                Command::Barrier(_) => {}
            }
        }
        Ok(())
    }

    fn execute(&mut self, submission: PendingSubmission) {
        for command in submission.commands {
            match command {
                Command::CopyBuffer {
                    staging_offset,
                    buffer,
                    offset,
                    size,
                } => {
                    let Some(data) = self.buffers.get_mut(&buffer) else {
                        trace!("Skipping copy into destroyed {buffer:?}");
                        continue;
                    };
                    let src = &submission.staging[staging_offset as usize..(staging_offset + size) as usize];
                    data[offset as usize..(offset + size) as usize].copy_from_slice(src);
                }
                Command::CopyImage {
                    staging_offset,
                    image,
                    extent,
                    row_pitch,
                    base_layer,
                    layer_count,
                    ..
                } => {
                    let Some(host_image) = self.images.get_mut(&image) else {
                        trace!("Skipping copy into destroyed {image:?}");
                        continue;
                    };
                    let tight_pitch = host_image.desc.row_pitch() as usize;
                    let layer_size = host_image.desc.layer_size() as usize;
                    for layer in 0..layer_count as usize {
                        for row in 0..extent.height as usize {
                            let src = staging_offset as usize + (layer * extent.height as usize + row) * row_pitch as usize;
                            let dst = (base_layer as usize + layer) * layer_size + row * tight_pitch;
                            host_image.data[dst..dst + tight_pitch].copy_from_slice(&submission.staging[src..src + tight_pitch]);
                        }
                    }
                }
                Command::Barrier(barrier) => self.barriers.push(barrier),
            }
        }
    }

    fn complete(&mut self, queue: QueueKind) {
        while let Some(submission) = self.queue_mut(queue).pending.pop_front() {
            let counter = submission.counter;
            self.execute(submission);
            self.queue_mut(queue).completed = counter;
        }
    }
}

/// Returns whether `offset..offset + size` lies inside `0..len`.
fn fits(offset: u64, size: u64, len: u64) -> bool {
    offset.checked_add(size).is_some_and(|end| end <= len)
}

/// [`TransferDevice`] that keeps every object in host memory.
///
/// Submissions complete immediately unless completions are held. This makes it possible to
/// run the streaming pipeline headless and to observe the state while uploads are in flight.
#[derive(Default)]
pub struct HostDevice {
    inner: Mutex<Inner>,
    hold_completions: AtomicBool,
    fail_next_submit: AtomicBool,
}

impl HostDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// When `hold` is `true`, submissions don't complete until [`HostDevice::release_completions`] is called.
    pub fn set_hold_completions(&self, hold: bool) {
        self.hold_completions.store(hold, Ordering::SeqCst);
        if !hold {
            self.release_completions();
        }
    }

    /// Completes every held submission.
    pub fn release_completions(&self) {
        let mut inner = self.inner.lock();
        inner.complete(QueueKind::Transfer);
        inner.complete(QueueKind::Consumer);
    }

    /// The next submission returns an error.
    pub fn fail_next_submit(&self) {
        self.fail_next_submit.store(true, Ordering::SeqCst);
    }

    /// Content of the buffer when it exists
    pub fn buffer_data(&self, buffer: BufferId) -> Option<Vec<u8>> {
        self.inner.lock().buffers.get(&buffer).cloned()
    }

    /// Content of the image when it exists. The layers are stored one after another with tight rows.
    pub fn image_data(&self, image: ImageId) -> Option<Vec<u8>> {
        self.inner.lock().images.get(&image).map(|image| image.data.clone())
    }

    /// Number of buffers and images that were created and not destroyed
    pub fn object_count(&self) -> usize {
        let inner = self.inner.lock();
        inner.buffers.len() + inner.images.len()
    }

    /// Number of submissions to the queue
    pub fn submission_count(&self, queue: QueueKind) -> usize {
        self.inner.lock().queue(queue).submission_count
    }

    /// Every barrier that was executed so far
    pub fn barriers(&self) -> Vec<Barrier> {
        self.inner.lock().barriers.clone()
    }
}

impl TransferDevice for HostDevice {
    fn create_buffer(&self, size: u64, debug_info: DebugInfo) -> Result<BufferId> {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let buffer = BufferId(inner.next_id);
        trace!("Creating {buffer:?} with {size} bytes: {}", debug_info.format_one_line());
        inner.buffers.insert(buffer, vec![0; size as usize]);
        Ok(buffer)
    }

    fn create_image(&self, desc: &ImageDesc, debug_info: DebugInfo) -> Result<ImageId> {
        if desc.size() == 0 {
            return Err(Error::Device(format!("Can't create an empty image: {desc:?}")));
        }
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let image = ImageId(inner.next_id);
        trace!("Creating {image:?} with {desc:?}: {}", debug_info.format_one_line());
        inner.images.insert(
            image,
            HostImage {
                desc: desc.clone(),
                data: vec![0; desc.size() as usize],
            },
        );
        Ok(image)
    }

    fn destroy(&self, object: DeviceObject) {
        let mut inner = self.inner.lock();
        let existed = match object {
            DeviceObject::Buffer(buffer) => inner.buffers.remove(&buffer).is_some(),
            DeviceObject::Image(image) => inner.images.remove(&image).is_some(),
        };
        if !existed {
            warn!("Destroying {object:?} which doesn't exist");
        }
    }

    fn submit(&self, queue: QueueKind, staging: &[u8], commands: &[Command]) -> Result<u64> {
        if self.fail_next_submit.swap(false, Ordering::SeqCst) {
            return Err(Error::Device("submission rejected".to_owned()));
        }
        trace!(
            "HostDevice submit to {queue:?} on thread: {:?} with id {}",
            std::thread::current().name().unwrap_or("unnamed thread"),
            thread_id::get(),
        );
        let mut inner = self.inner.lock();
        inner.validate(staging, commands)?;
        let state = inner.queue_mut(queue);
        state.submitted += 1;
        state.submission_count += 1;
        let counter = state.submitted;
        state.pending.push_back(PendingSubmission {
            counter,
            staging: staging.to_vec(),
            commands: commands.to_vec(),
        });
        if !self.hold_completions.load(Ordering::SeqCst) {
            inner.complete(queue);
        }
        Ok(counter)
    }

    fn completed_counter(&self, queue: QueueKind) -> u64 {
        self.inner.lock().queue(queue).completed
    }

    fn wait(&self, queue: QueueKind, counter: u64, timeout: Duration) -> bool {
        let start = Instant::now();
        loop {
            if self.completed_counter(queue) >= counter {
                return true;
            }
            if start.elapsed() >= timeout {
                return false;
            }
            spin_sleep::sleep(Duration::from_micros(200));
        }
    }
}

impl Drop for HostDevice {
    fn drop(&mut self) {
        let inner = self.inner.lock();
        let object_count = inner.buffers.len() + inner.images.len();
        if object_count > 0 {
            info!("Dropping HostDevice with {object_count} objects alive");
        }
    }
}

#[cfg(test)]
mod tests {
    use strom_shared::debug_info;

    use super::*;
    use crate::device::{BarrierTarget, Extent, ImageLayout};

    #[test]
    fn copy_buffer() {
        let device = HostDevice::new();
        let buffer = device.create_buffer(8, debug_info!("buffer")).unwrap();
        let commands = [Command::CopyBuffer {
            staging_offset: 2,
            buffer,
            offset: 4,
            size: 3,
        }];
        let counter = device.submit(QueueKind::Transfer, &[0, 0, 1, 2, 3], &commands).unwrap();
        assert_eq!(counter, 1);
        assert_eq!(device.completed_counter(QueueKind::Transfer), 1);
        assert_eq!(device.buffer_data(buffer).unwrap(), vec![0, 0, 0, 0, 1, 2, 3, 0]);
    }

    #[test]
    fn copy_image_with_row_pitch() {
        let device = HostDevice::new();
        let desc = ImageDesc {
            extent: Extent { width: 1, height: 2 },
            layers: 2,
            bytes_per_pixel: 2,
        };
        let image = device.create_image(&desc, debug_info!("image")).unwrap();
        // Rows are padded to 4 bytes in the staging region.
        let staging = [1, 2, 0, 0, 3, 4, 0, 0];
        let commands = [Command::CopyImage {
            staging_offset: 0,
            image,
            extent: desc.extent,
            row_pitch: 4,
            base_layer: 1,
            layer_count: 1,
            layout: ImageLayout::ShaderReadOnly,
        }];
        device.submit(QueueKind::Transfer, &staging, &commands).unwrap();
        assert_eq!(device.image_data(image).unwrap(), vec![0, 0, 0, 0, 1, 2, 3, 4]);
    }

    #[test]
    fn hold_completions() {
        let device = HostDevice::new();
        let buffer = device.create_buffer(1, debug_info!("buffer")).unwrap();
        device.set_hold_completions(true);
        let barrier = Barrier::release(BarrierTarget::Buffer { buffer, offset: 0, size: 1 });
        let commands = [
            Command::CopyBuffer {
                staging_offset: 0,
                buffer,
                offset: 0,
                size: 1,
            },
            Command::Barrier(barrier.clone()),
        ];
        let counter = device.submit(QueueKind::Transfer, &[9], &commands).unwrap();
        assert_eq!(device.completed_counter(QueueKind::Transfer), 0);
        assert!(!device.wait(QueueKind::Transfer, counter, Duration::from_millis(5)));
        assert_eq!(device.buffer_data(buffer).unwrap(), vec![0]);

        device.set_hold_completions(false);
        assert!(device.wait(QueueKind::Transfer, counter, Duration::from_millis(5)));
        assert_eq!(device.buffer_data(buffer).unwrap(), vec![9]);
        assert_eq!(device.barriers(), vec![barrier]);
        assert_eq!(device.submission_count(QueueKind::Transfer), 1);
        assert_eq!(device.submission_count(QueueKind::Consumer), 0);
    }

    #[test]
    fn destroyed_during_upload() {
        let device = HostDevice::new();
        let buffer = device.create_buffer(1, debug_info!("buffer")).unwrap();
        device.set_hold_completions(true);
        let commands = [Command::CopyBuffer {
            staging_offset: 0,
            buffer,
            offset: 0,
            size: 1,
        }];
        let counter = device.submit(QueueKind::Transfer, &[9], &commands).unwrap();
        device.destroy(DeviceObject::Buffer(buffer));
        assert_eq!(device.object_count(), 0);
        device.release_completions();
        assert_eq!(device.completed_counter(QueueKind::Transfer), counter);
    }

    #[test]
    fn rejects_copy_out_of_bounds() {
        let device = HostDevice::new();
        let buffer = device.create_buffer(4, debug_info!("buffer")).unwrap();
        let too_large = [Command::CopyBuffer {
            staging_offset: 0,
            buffer,
            offset: 0,
            size: 8,
        }];
        assert!(matches!(
            device.submit(QueueKind::Transfer, &[1; 8], &too_large),
            Err(Error::Device(_))
        ));
        let beyond_staging = [Command::CopyBuffer {
            staging_offset: 6,
            buffer,
            offset: 0,
            size: 4,
        }];
        assert!(matches!(
            device.submit(QueueKind::Transfer, &[1; 8], &beyond_staging),
            Err(Error::Device(_))
        ));

        let desc = ImageDesc {
            extent: Extent { width: 2, height: 1 },
            layers: 1,
            bytes_per_pixel: 4,
        };
        let image = device.create_image(&desc, debug_info!("image")).unwrap();
        let narrow_rows = [Command::CopyImage {
            staging_offset: 0,
            image,
            extent: desc.extent,
            row_pitch: 4,
            base_layer: 0,
            layer_count: 1,
            layout: ImageLayout::ShaderReadOnly,
        }];
        assert!(matches!(
            device.submit(QueueKind::Transfer, &[1; 8], &narrow_rows),
            Err(Error::Device(_))
        ));
        let missing_layer = [Command::CopyImage {
            staging_offset: 0,
            image,
            extent: desc.extent,
            row_pitch: 8,
            base_layer: 1,
            layer_count: 1,
            layout: ImageLayout::ShaderReadOnly,
        }];
        assert!(matches!(
            device.submit(QueueKind::Transfer, &[1; 8], &missing_layer),
            Err(Error::Device(_))
        ));

        // Nothing was enqueued and the objects are untouched.
        assert_eq!(device.submission_count(QueueKind::Transfer), 0);
        assert_eq!(device.buffer_data(buffer).unwrap(), vec![0; 4]);
        assert_eq!(device.image_data(image).unwrap(), vec![0; 8]);
    }

    #[test]
    fn failing_submit() {
        let device = HostDevice::new();
        device.fail_next_submit();
        assert!(matches!(device.submit(QueueKind::Transfer, &[], &[]), Err(Error::Device(_))));
        assert_eq!(device.submit(QueueKind::Transfer, &[], &[]).unwrap(), 1);
    }
}
