use std::{fmt, sync::Arc};

use crate::{
    device::{BarrierTarget, BufferId, Extent, ImageId, ImageLayout},
    ticket::Ticket,
    Error, Result,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Normal,
    /// Processed before every `Normal` task that is queued
    High,
}

/// Memory that an upload reads from.
///
/// `Shared` bytes are freed when the last fragment of the upload was dropped.
#[derive(Clone)]
pub enum SourceBytes {
    Shared(Arc<[u8]>),
    Static(&'static [u8]),
}

impl SourceBytes {
    pub fn as_slice(&self) -> &[u8] {
        match self {
            SourceBytes::Shared(bytes) => &bytes[..],
            SourceBytes::Static(bytes) => *bytes,
        }
    }

    pub fn len(&self) -> u64 {
        self.as_slice().len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for SourceBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceBytes::Shared(bytes) => write!(f, "Shared({} bytes)", bytes.len()),
            SourceBytes::Static(bytes) => write!(f, "Static({} bytes)", bytes.len()),
        }
    }
}

impl From<Arc<[u8]>> for SourceBytes {
    fn from(bytes: Arc<[u8]>) -> Self {
        SourceBytes::Shared(bytes)
    }
}

impl From<Vec<u8>> for SourceBytes {
    fn from(bytes: Vec<u8>) -> Self {
        SourceBytes::Shared(bytes.into())
    }
}

impl From<&'static [u8]> for SourceBytes {
    fn from(bytes: &'static [u8]) -> Self {
        SourceBytes::Static(bytes)
    }
}

/// Byte range of [`SourceBytes`]
#[derive(Debug, Clone)]
pub struct Source {
    pub bytes: SourceBytes,
    pub offset: u64,
    pub size: u64,
}

impl Source {
    /// Source that covers all of the `bytes`.
    pub fn new(bytes: impl Into<SourceBytes>) -> Self {
        let bytes = bytes.into();
        let size = bytes.len();
        Self { bytes, offset: 0, size }
    }

    pub fn range(bytes: impl Into<SourceBytes>, offset: u64, size: u64) -> Result<Self> {
        let bytes = bytes.into();
        if offset.checked_add(size).map_or(true, |end| end > bytes.len()) {
            return Err(Error::InvalidTransfer(format!(
                "source range {offset}..{} exceeds the {} source bytes",
                offset.saturating_add(size),
                bytes.len()
            )));
        }
        Ok(Self { bytes, offset, size })
    }

    pub fn data(&self) -> &[u8] {
        &self.bytes.as_slice()[self.offset as usize..(self.offset + self.size) as usize]
    }
}

/// Where the bytes of an upload are copied to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Buffer {
        buffer: BufferId,
        offset: u64,
    },
    /// Layers `base_layer..base_layer + layer_count` of an image. The source contains the
    /// layers one after another with `row_pitch` bytes per row.
    Image {
        image: ImageId,
        extent: Extent,
        row_pitch: u32,
        base_layer: u32,
        layer_count: u32,
        layout: ImageLayout,
    },
}

impl Destination {
    /// Size of the smallest fragment an upload into this destination can be split into: one
    /// byte of a buffer or one layer of an image.
    pub fn min_fragment_size(&self) -> u64 {
        match self {
            Destination::Buffer { .. } => 1,
            Destination::Image { extent, row_pitch, .. } => *row_pitch as u64 * extent.height as u64,
        }
    }

    /// Region that is handed over to the consumer queue when `size` bytes were written.
    pub fn barrier_target(&self, size: u64) -> BarrierTarget {
        match self {
            Destination::Buffer { buffer, offset } => BarrierTarget::Buffer {
                buffer: *buffer,
                offset: *offset,
                size,
            },
            Destination::Image {
                image,
                base_layer,
                layer_count,
                layout,
                ..
            } => BarrierTarget::Image {
                image: *image,
                base_layer: *base_layer,
                layer_count: *layer_count,
                layout: *layout,
            },
        }
    }
}

/// Copy request that is processed by the transfer thread.
///
/// Uploads that don't fit into the remaining staging budget are split into fragments. All
/// fragments share the ticket and the barrier target of the original upload, and only the
/// fragment with `last == true` records the release barrier.
#[derive(Debug, Clone)]
pub struct TransferTask {
    pub ticket: Ticket,
    pub priority: Priority,
    pub source: Source,
    pub destination: Destination,
    pub barrier: BarrierTarget,
    pub last: bool,
}

/// Result of [`TransferTask::split`]
#[derive(Debug)]
pub enum Split {
    /// The task fits into the budget.
    Whole(TransferTask),
    /// The first task fits into the budget, the second is the remainder.
    Parts(TransferTask, TransferTask),
    /// Not even the smallest unit of the task fits into the budget.
    TooLarge(TransferTask),
}

impl TransferTask {
    /// Creates the task of a complete upload after checking that the source and the destination agree.
    pub fn new(ticket: Ticket, priority: Priority, source: Source, destination: Destination) -> Result<Self> {
        Self::check(&source, &destination)?;
        let barrier = destination.barrier_target(source.size);
        Ok(Self {
            ticket,
            priority,
            source,
            destination,
            barrier,
            last: true,
        })
    }

    /// Checks that the `source` has the size that the `destination` expects.
    pub fn check(source: &Source, destination: &Destination) -> Result<()> {
        match destination {
            Destination::Buffer { .. } => {
                if source.size == 0 {
                    return Err(Error::InvalidTransfer("buffer upload without bytes".to_owned()));
                }
            }
            Destination::Image {
                extent,
                row_pitch,
                layer_count,
                ..
            } => {
                if extent.width == 0 || extent.height == 0 || *layer_count == 0 || *row_pitch == 0 {
                    return Err(Error::InvalidTransfer(format!(
                        "image upload with extent {extent:?}, row pitch {row_pitch} and {layer_count} layers"
                    )));
                }
                let expected = *row_pitch as u64 * extent.height as u64 * *layer_count as u64;
                if source.size != expected {
                    return Err(Error::InvalidTransfer(format!(
                        "image upload expects {expected} bytes but the source has {}",
                        source.size
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn size(&self) -> u64 {
        self.source.size
    }

    pub fn min_fragment_size(&self) -> u64 {
        self.destination.min_fragment_size()
    }

    /// Splits the task so that the first part has at most `budget` bytes.
    ///
    /// The parts tile the original source and destination without overlap or gap. A buffer is
    /// split by byte offset, an image by array layer.
    pub fn split(self, budget: u64) -> Split {
        if self.size() <= budget {
            return Split::Whole(self);
        }
        if budget < self.min_fragment_size() {
            return Split::TooLarge(self);
        }
        match self.destination.clone() {
            Destination::Buffer { buffer, offset } => {
                let head = TransferTask {
                    source: Source {
                        bytes: self.source.bytes.clone(),
                        offset: self.source.offset,
                        size: budget,
                    },
                    destination: Destination::Buffer { buffer, offset },
                    last: false,
                    ..self.clone()
                };
                let tail = TransferTask {
                    source: Source {
                        bytes: self.source.bytes.clone(),
                        offset: self.source.offset + budget,
                        size: self.source.size - budget,
                    },
                    destination: Destination::Buffer {
                        buffer,
                        offset: offset + budget,
                    },
                    ..self
                };
                Split::Parts(head, tail)
            }
            Destination::Image {
                image,
                extent,
                row_pitch,
                base_layer,
                layer_count,
                layout,
            } => {
                let layer_size = self.min_fragment_size();
                // `budget < size` and `budget >= layer_size` so that `0 < head_layers < layer_count`.
                let head_layers = (budget / layer_size) as u32;
                let head_size = head_layers as u64 * layer_size;
                let head = TransferTask {
                    source: Source {
                        bytes: self.source.bytes.clone(),
                        offset: self.source.offset,
                        size: head_size,
                    },
                    destination: Destination::Image {
                        image,
                        extent,
                        row_pitch,
                        base_layer,
                        layer_count: head_layers,
                        layout,
                    },
                    last: false,
                    ..self.clone()
                };
                let tail = TransferTask {
                    source: Source {
                        bytes: self.source.bytes.clone(),
                        offset: self.source.offset + head_size,
                        size: self.source.size - head_size,
                    },
                    destination: Destination::Image {
                        image,
                        extent,
                        row_pitch,
                        base_layer: base_layer + head_layers,
                        layer_count: layer_count - head_layers,
                        layout,
                    },
                    ..self
                };
                Split::Parts(head, tail)
            }
        }
    }
}
