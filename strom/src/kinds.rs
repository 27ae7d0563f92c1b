use serde::{de::DeserializeOwned, Serialize};
use strom_content::{
    model::{self, ModelData, MODEL_FILE_TYPE},
    texture::{self, TextureData, TEXTURE_FILE_TYPE},
    MaterializerRegistry,
};
use strom_shared::debug_info;
use strom_transfer::{DeviceObject, Extent, ImageDesc, ImageLayout, Priority, Ticket, TransferDevice, TransferEngine};

use crate::Result;

/// Device object of a resource together with the ticket of its upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DevicePayload {
    pub object: DeviceObject,
    pub ticket: Ticket,
    /// Number of bytes that were uploaded
    pub size: u64,
}

/// Kind of resource that is managed by a [`ResourceRegistry`](crate::ResourceRegistry).
///
/// The kind decides how a resource is materialized, which canonical file type it is stored
/// in and how its decoded representation is uploaded to the device.
pub trait ResourceKind: Send + Sync + 'static {
    type Decoded: Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Name of the kind for log output
    const NAME: &'static str;

    /// File type in the header of the canonical files
    const FILE_TYPE: &'static str;

    /// Registers the materializers that are available without configuration.
    fn register_default_materializers(materializers: &mut MaterializerRegistry<Self::Decoded>);

    /// Creates the device object and submits the upload of the decoded data.
    fn upload(engine: &TransferEngine, name: &str, decoded: &Self::Decoded, priority: Priority) -> Result<DevicePayload>;

    /// Data that is uploaded once and used for every resource that failed to load.
    fn placeholder() -> Option<Self::Decoded> {
        None
    }
}

/// Meshes uploaded into a single buffer
pub struct Model;

impl ResourceKind for Model {
    type Decoded = ModelData;

    const NAME: &'static str = "Model";
    const FILE_TYPE: &'static str = MODEL_FILE_TYPE;

    fn register_default_materializers(materializers: &mut MaterializerRegistry<ModelData>) {
        materializers.register("gltf", Box::new(model::materialize_gltf));
        materializers.register("glb", Box::new(model::materialize_gltf));
    }

    fn upload(engine: &TransferEngine, name: &str, decoded: &ModelData, priority: Priority) -> Result<DevicePayload> {
        let device = engine.device();
        let size = decoded.device_size();
        let buffer = device.create_buffer(size, debug_info!(format!("Model '{name}'")))?;
        match engine.submit_buffer(priority, decoded.device_bytes(), buffer, 0) {
            Ok(ticket) => Ok(DevicePayload {
                object: DeviceObject::Buffer(buffer),
                ticket,
                size,
            }),
            Err(err) => {
                device.destroy(DeviceObject::Buffer(buffer));
                Err(err.into())
            }
        }
    }
}

/// Array images with RGBA8 texels
pub struct Texture;

impl Texture {
    /// Magenta so that missing textures stand out.
    pub const PLACEHOLDER_COLOR: [u8; 4] = [255, 0, 255, 255];
}

impl ResourceKind for Texture {
    type Decoded = TextureData;

    const NAME: &'static str = "Texture";
    const FILE_TYPE: &'static str = TEXTURE_FILE_TYPE;

    fn register_default_materializers(materializers: &mut MaterializerRegistry<TextureData>) {
        for extension in ["png", "jpg", "jpeg", "bmp", "tga"] {
            materializers.register(extension, Box::new(texture::materialize_image));
        }
    }

    fn upload(engine: &TransferEngine, name: &str, decoded: &TextureData, priority: Priority) -> Result<DevicePayload> {
        let device = engine.device();
        let desc = ImageDesc {
            extent: Extent {
                width: decoded.width,
                height: decoded.height,
            },
            layers: decoded.layers,
            bytes_per_pixel: decoded.format.bytes_per_pixel(),
        };
        let image = device.create_image(&desc, debug_info!(format!("Texture '{name}'")))?;
        match engine.submit_image(priority, decoded.data.clone(), image, &desc, ImageLayout::ShaderReadOnly) {
            Ok(ticket) => Ok(DevicePayload {
                object: DeviceObject::Image(image),
                ticket,
                size: desc.size(),
            }),
            Err(err) => {
                device.destroy(DeviceObject::Image(image));
                Err(err.into())
            }
        }
    }

    fn placeholder() -> Option<TextureData> {
        Some(TextureData::solid("placeholder", Self::PLACEHOLDER_COLOR))
    }
}
