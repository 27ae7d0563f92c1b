//! # Overview
//!
//! Crate for everything that happens to a resource before it reaches the device: reading the
//! [`Origin`], converting it into the canonical representation with a registered
//! [materializer](MaterializerRegistry), persisting it in a [resource file](resource_file) and
//! running this blocking work on the [`IoPool`].
//!
//! Two resource kinds are shipped with default materializers:
//!
//! | Kind                           | Extensions                   | Materializer           |
//! |--------------------------------|------------------------------|------------------------|
//! | [`ModelData`](model::ModelData)       | `gltf`, `glb`                | [`model::materialize_gltf`]   |
//! | [`TextureData`](texture::TextureData) | `png`, `jpg`, `jpeg`, `bmp`, `tga` | [`texture::materialize_image`] |

mod common;
mod io_pool;
mod materializer;
mod origin;

pub mod model;
pub mod resource_file;
pub mod texture;

pub use common::{catch_panic, extract_extension_from_path, sanitize_file_stem, Directories, Error, Result};
pub use io_pool::*;
pub use materializer::*;
pub use origin::Origin;
