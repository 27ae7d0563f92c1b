use std::time::Duration;

use strom_shared::DebugInfo;

use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageId(pub u64);

/// Object that was created by a [`TransferDevice`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeviceObject {
    Buffer(BufferId),
    Image(ImageId),
}

/// Queues on which the device executes commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    /// Copy-capable queue that is only used by the transfer thread
    Transfer,
    /// Queue of the renderer that uses the uploaded objects
    Consumer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageLayout {
    Undefined,
    TransferDst,
    ShaderReadOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub width: u32,
    pub height: u32,
}

/// Description of a 2D image with array layers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageDesc {
    pub extent: Extent,
    pub layers: u32,
    pub bytes_per_pixel: u32,
}

impl ImageDesc {
    /// Number of bytes of one tightly packed row
    pub fn row_pitch(&self) -> u32 {
        self.extent.width * self.bytes_per_pixel
    }

    /// Number of bytes of one array layer
    pub fn layer_size(&self) -> u64 {
        self.row_pitch() as u64 * self.extent.height as u64
    }

    pub fn size(&self) -> u64 {
        self.layer_size() * self.layers as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierKind {
    /// Recorded on the source queue to give up the ownership
    Release,
    /// Recorded on the destination queue to take over the ownership
    Acquire,
}

/// Region of a device object whose ownership is transferred
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BarrierTarget {
    Buffer {
        buffer: BufferId,
        offset: u64,
        size: u64,
    },
    Image {
        image: ImageId,
        base_layer: u32,
        layer_count: u32,
        layout: ImageLayout,
    },
}

/// Queue-ownership transfer barrier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Barrier {
    pub kind: BarrierKind,
    pub src_queue: QueueKind,
    pub dst_queue: QueueKind,
    pub target: BarrierTarget,
}

impl Barrier {
    pub fn release(target: BarrierTarget) -> Self {
        Self {
            kind: BarrierKind::Release,
            src_queue: QueueKind::Transfer,
            dst_queue: QueueKind::Consumer,
            target,
        }
    }

    pub fn acquire(target: BarrierTarget) -> Self {
        Self {
            kind: BarrierKind::Acquire,
            src_queue: QueueKind::Transfer,
            dst_queue: QueueKind::Consumer,
            target,
        }
    }
}

/// Command that is recorded into a submission. Offsets into the staging region are in bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    CopyBuffer {
        staging_offset: u64,
        buffer: BufferId,
        offset: u64,
        size: u64,
    },
    CopyImage {
        staging_offset: u64,
        image: ImageId,
        extent: Extent,
        row_pitch: u32,
        base_layer: u32,
        layer_count: u32,
        layout: ImageLayout,
    },
    Barrier(Barrier),
}

/// Graphics device abstraction that the transfer engine and the registry are written against.
///
/// Every submission signals a monotonically increasing counter per queue. An object that is
/// destroyed while work referencing it is still in flight has to be kept alive by the device
/// until that work completed.
pub trait TransferDevice: Send + Sync {
    fn create_buffer(&self, size: u64, debug_info: DebugInfo) -> Result<BufferId>;

    fn create_image(&self, desc: &ImageDesc, debug_info: DebugInfo) -> Result<ImageId>;

    fn destroy(&self, object: DeviceObject);

    /// Submits the `commands` to the `queue` and returns the counter value that is signalled
    /// when they completed. `staging` must only be read until this counter was reached.
    fn submit(&self, queue: QueueKind, staging: &[u8], commands: &[Command]) -> Result<u64>;

    /// Highest counter value that the `queue` has reached
    fn completed_counter(&self, queue: QueueKind) -> u64;

    /// Waits until the `queue` reached the `counter`. Returns `false` on timeout.
    fn wait(&self, queue: QueueKind, counter: u64, timeout: Duration) -> bool;
}
