//! Asynchronous resource streaming.
//!
//! A [`ResourceRegistry`] tracks reference counted resources of one [`ResourceKind`] through
//! the states `OnDisk → OnCpu → OnGpu`. Resources are addressed by generation-checked
//! [`Handle`]s that turn stale as soon as the resource is removed. The [`Streamer`] owns the
//! registries for models and textures together with the [`IoPool`] and the [`TransferEngine`]
//! they share.
//!
//! ```
//! use std::sync::Arc;
//!
//! use strom::{Model, Streamer};
//! use strom_content::{Directories, Origin};
//! use strom_shared::StreamingConfig;
//! use strom_transfer::HostDevice;
//!
//! let directories = Directories::create_all_dir("target/doc_streamer").unwrap();
//! let streamer = Streamer::new(Arc::new(HostDevice::new()), directories, StreamingConfig::default()).unwrap();
//! let result = streamer.models().add(Origin::embedded("obj", vec![0u8]), "unsupported");
//! assert!(result.is_err());
//! ```
mod kinds;
mod reconciler;
mod registry;
mod streamer;

pub use kinds::*;
pub use reconciler::*;
pub use registry::{CancelToken, LoadState, ResourceRegistry};
pub use streamer::*;

pub use strom_content::{IoPool, Origin};
pub use strom_shared::Handle;
pub use strom_transfer::TransferEngine;

use std::io;

use strom_shared::{serde_yaml, thiserror, ConfigError};

/// Error type for the whole library
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("The handle is stale or null")]
    BadGeneration,
    #[error("Error from the content crate: {0}")]
    Content(#[from] strom_content::Error),
    #[error("Error from the transfer crate: {0}")]
    Transfer(#[from] strom_transfer::Error),
    #[error("IoError: {0}")]
    Io(#[from] io::Error),
    #[error("Failed to read or write the index: {0}")]
    Index(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

pub type Result<T> = std::result::Result<T, Error>;
