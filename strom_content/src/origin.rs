use std::{
    fmt, fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::{common::extract_extension_from_path, Result};

/// Where the source data of a resource comes from.
#[derive(Clone)]
pub enum Origin {
    /// A file in one of the formats for which a materializer is registered.
    Path(PathBuf),
    /// Bytes that are already in memory, e.g. a texture embedded in another file.
    Embedded { extension: String, bytes: Arc<[u8]> },
}

impl Origin {
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self::Path(path.into())
    }

    pub fn embedded(extension: impl Into<String>, bytes: impl Into<Arc<[u8]>>) -> Self {
        Self::Embedded {
            extension: extension.into().to_lowercase(),
            bytes: bytes.into(),
        }
    }

    /// Returns the lowercase extension that selects the materializer.
    pub fn extension(&self) -> Result<String> {
        match self {
            Origin::Path(path) => extract_extension_from_path(path),
            Origin::Embedded { extension, .. } => Ok(extension.clone()),
        }
    }

    /// Returns the path when the origin is a file.
    pub fn path(&self) -> Option<&Path> {
        match self {
            Origin::Path(path) => Some(path),
            Origin::Embedded { .. } => None,
        }
    }

    /// Reads the source bytes. This blocks for file origins.
    pub fn read_bytes(&self) -> Result<Arc<[u8]>> {
        match self {
            Origin::Path(path) => Ok(fs::read(path)?.into()),
            Origin::Embedded { bytes, .. } => Ok(bytes.clone()),
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Path(path) => write!(f, "{}", path.display()),
            Origin::Embedded { extension, bytes } => write!(f, "<embedded {extension}, {} bytes>", bytes.len()),
        }
    }
}

impl fmt::Debug for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Origin({self})")
    }
}

#[cfg(test)]
mod tests {
    use tempdir::TempDir;

    use super::*;

    #[test]
    fn embedded() {
        let origin = Origin::embedded("PNG", vec![1u8, 2, 3]);
        assert_eq!(origin.extension().unwrap(), "png");
        assert_eq!(&*origin.read_bytes().unwrap(), &[1, 2, 3]);
        assert_eq!(origin.path(), None);
        assert_eq!(origin.to_string(), "<embedded png, 3 bytes>");
    }

    #[test]
    fn path() {
        let root = TempDir::new("origin").unwrap();
        let path = root.path().join("a.glb");
        fs::write(&path, b"glTF").unwrap();
        let origin = Origin::from_path(&path);
        assert_eq!(origin.extension().unwrap(), "glb");
        assert_eq!(&*origin.read_bytes().unwrap(), b"glTF");
    }

    #[test]
    fn missing_file() {
        let origin = Origin::from_path("does/not/exist.png");
        assert!(origin.read_bytes().is_err());
    }
}
