use serde::{Deserialize, Serialize};

use crate::{Error, Result, SourceData};

/// File type of canonical texture files
pub const TEXTURE_FILE_TYPE: &str = "texture";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TextureFormat {
    Rgba8,
}

impl TextureFormat {
    pub fn bytes_per_pixel(&self) -> u32 {
        match self {
            TextureFormat::Rgba8 => 4,
        }
    }
}

/// Decoded texture with one or more array layers stored one after another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextureData {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub layers: u32,
    pub format: TextureFormat,
    pub data: Vec<u8>,
}

impl TextureData {
    /// Creates a texture from layers that all have the size `width * height * 4`.
    pub fn from_layers(name: impl Into<String>, width: u32, height: u32, layers: &[&[u8]]) -> Result<Self> {
        let name = name.into();
        let layer_size = width as usize * height as usize * TextureFormat::Rgba8.bytes_per_pixel() as usize;
        if layers.is_empty() || layers.iter().any(|layer| layer.len() != layer_size) {
            return Err(Error::decode(name, "all layers must have the size of width * height * 4"));
        }
        Ok(Self {
            name,
            width,
            height,
            layers: layers.len() as u32,
            format: TextureFormat::Rgba8,
            data: layers.concat(),
        })
    }

    /// A 1x1 texture with a single color. Used as placeholder for textures that failed to load.
    pub fn solid(name: impl Into<String>, color: [u8; 4]) -> Self {
        Self {
            name: name.into(),
            width: 1,
            height: 1,
            layers: 1,
            format: TextureFormat::Rgba8,
            data: color.to_vec(),
        }
    }

    /// Number of bytes of one row
    pub fn row_pitch(&self) -> u32 {
        self.width * self.format.bytes_per_pixel()
    }

    /// Number of bytes of one array layer
    pub fn layer_size(&self) -> u64 {
        self.row_pitch() as u64 * self.height as u64
    }
}

/// Materializer for every image format that the `image` crate can decode.
pub fn materialize_image(source: &SourceData) -> Result<TextureData> {
    let image = image::load_from_memory(source.bytes).map_err(|err| Error::decode(source.name, err))?;
    let rgba = image.to_rgba8();
    Ok(TextureData {
        name: source.name.to_owned(),
        width: rgba.width(),
        height: rgba.height(),
        layers: 1,
        format: TextureFormat::Rgba8,
        data: rgba.into_raw(),
    })
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use image::{ImageOutputFormat, Rgba, RgbaImage};

    use super::*;

    fn png_bytes() -> Vec<u8> {
        let image = RgbaImage::from_fn(4, 2, |x, y| Rgba([x as u8, y as u8, 7, 255]));
        let mut bytes = Cursor::new(Vec::new());
        image.write_to(&mut bytes, ImageOutputFormat::Png).unwrap();
        bytes.into_inner()
    }

    #[test]
    fn decode_png() {
        let png = png_bytes();
        let source = SourceData {
            name: "checker",
            extension: "png",
            bytes: &png,
        };
        let texture = materialize_image(&source).unwrap();
        assert_eq!((texture.width, texture.height, texture.layers), (4, 2, 1));
        assert_eq!(texture.row_pitch(), 16);
        assert_eq!(texture.layer_size(), 32);
        assert_eq!(texture.data.len(), 32);
        assert_eq!(&texture.data[20..24], &[1, 1, 7, 255]);
    }

    #[test]
    fn decode_garbage() {
        let source = SourceData {
            name: "garbage",
            extension: "png",
            bytes: &[1, 2, 3],
        };
        assert!(matches!(materialize_image(&source), Err(Error::Decode { .. })));
    }

    #[test]
    fn layers() {
        let a = [1u8; 8];
        let b = [2u8; 8];
        let texture = TextureData::from_layers("array", 2, 1, &[&a[..], &b[..]]).unwrap();
        assert_eq!(texture.layers, 2);
        assert_eq!(texture.layer_size(), 8);
        assert_eq!(&texture.data[8..], &b);
        assert!(TextureData::from_layers("array", 2, 2, &[&a[..]]).is_err());
        assert!(TextureData::from_layers("array", 2, 1, &[]).is_err());
    }

    #[test]
    fn solid() {
        let texture = TextureData::solid("magenta", [255, 0, 255, 255]);
        assert_eq!(texture.layer_size(), 4);
        assert_eq!(texture.data, vec![255, 0, 255, 255]);
    }
}
