//! Upload path from host memory into device objects.
//!
//! Uploads are submitted to the [`TransferEngine`] which returns a [`Ticket`] that can be
//! polled without blocking. A dedicated thread packs the queued uploads into a bounded
//! staging region, splits uploads that don't fit and submits them to the transfer queue of
//! a [`TransferDevice`]. Completed uploads hand their destination over to the consumer
//! queue with a pair of release and acquire barriers.
mod device;
mod engine;
mod host_device;
mod staging;
mod task;
mod ticket;

pub use device::*;
pub use engine::TransferEngine;
pub use host_device::HostDevice;
pub use staging::{align_up, StagingRegion};
pub use task::{Destination, Priority, Source, SourceBytes, Split, TransferTask};
pub use ticket::{Ticket, TicketAllocator, TicketStatus};

use strom_shared::{thiserror, ConfigError};

/// Error type for the whole library
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Upload of {size} bytes can't be split to fit into the staging region of {capacity} bytes")]
    QueueOverflow { size: u64, capacity: u64 },
    #[error("Invalid transfer: {0}")]
    InvalidTransfer(String),
    #[error("Error from the device: {0}")]
    Device(String),
    #[error("The TransferEngine was shut down")]
    ShutDown,
    #[error("Failed to start the transfer thread")]
    FailedToStartThread,
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

pub type Result<T> = std::result::Result<T, Error>;
