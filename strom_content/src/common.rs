use std::{
    fs, io,
    panic::{self, AssertUnwindSafe},
    path::{Path, PathBuf},
    result,
};

use strom_shared::thiserror;

pub type Result<T> = result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid path: {0}")]
    InvalidPath(PathBuf),
    #[error("IoError: {0}")]
    IoError(#[from] io::Error),
    #[error("Extension not registered: {0}")]
    ExtensionNotRegistered(String),
    #[error("Failed to start thread pool")]
    FailedToStartThreadPool,
    #[error("The I/O pool is shutting down")]
    PoolShutDown,
    #[error("Failed to decode '{name}': {message}")]
    Decode { name: String, message: String },
    #[error("Expected a resource file of type '{expected}' but found '{found}'")]
    UnexpectedFileType { expected: String, found: String },
    #[error("Panicked while processing '{name}': {message}")]
    Panicked { name: String, message: String },
    #[error("Failed to serialize or deserialize: {0}")]
    FailedSerialization(#[from] bincode::Error),
    #[error("Other: {0}")]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    pub(crate) fn decode(name: impl Into<String>, message: impl ToString) -> Self {
        Self::Decode {
            name: name.into(),
            message: message.to_string(),
        }
    }
}

/// Runs `f` and returns a panic as [`Error::Panicked`].
///
/// Wraps the decoders of third-party formats that may panic on malformed input.
pub fn catch_panic<T>(name: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
    panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| {
        let message = payload
            .downcast_ref::<&str>()
            .map(|message| message.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic payload".to_owned());
        Err(Error::Panicked {
            name: name.to_owned(),
            message,
        })
    })
}

/// Directories in which the canonical resource files and the index files are stored.
#[derive(Debug, Clone)]
pub struct Directories {
    processed: PathBuf,
}

impl Directories {
    /// Creates the `processed` directory when it doesn't exist.
    ///
    /// # Example
    ///
    /// ```rust
    /// use strom_content::Directories;
    /// let directories = Directories::create_all_dir("target/doc_processed").unwrap();
    /// assert!(directories.processed_path().is_dir());
    /// ```
    pub fn create_all_dir(processed: impl Into<PathBuf>) -> Result<Self> {
        let processed = processed.into();
        fs::create_dir_all(&processed)?;
        let directories = Self { processed };
        directories.check()?;
        Ok(directories)
    }

    /// Checks that the directories exist.
    pub fn check(&self) -> Result<()> {
        if !self.processed.is_dir() {
            return Err(Error::InvalidPath(self.processed.clone()));
        }
        Ok(())
    }

    pub fn processed_path(&self) -> &Path {
        &self.processed
    }
}

/// Returns the lowercase extension of the path.
pub fn extract_extension_from_path(path: &Path) -> Result<String> {
    Ok(path
        .extension()
        .and_then(|extension| extension.to_str())
        .map(|extension| extension.to_lowercase())
        .ok_or(Error::InvalidPath(path.to_owned()))?
        .to_owned())
}

/// Replaces every character that is not allowed in a file name.
pub fn sanitize_file_stem(name: &str) -> String {
    let sanitized = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect::<String>();
    if sanitized.is_empty() {
        "unnamed".to_owned()
    } else {
        sanitized
    }
}

#[cfg(test)]
mod tests {
    use tempdir::TempDir;

    use super::*;

    #[test]
    fn extension() {
        assert_eq!(extract_extension_from_path(Path::new("models/a.GLB")).unwrap(), "glb");
        assert!(matches!(
            extract_extension_from_path(Path::new("models/a")),
            Err(Error::InvalidPath(_))
        ));
    }

    #[test]
    fn panic_becomes_error() {
        let result = catch_panic::<u32>("broken", || panic!("decoder crashed"));
        assert!(matches!(
            result,
            Err(Error::Panicked { name, message }) if name == "broken" && message == "decoder crashed"
        ));
        assert_eq!(catch_panic("fine", || Ok(3)).unwrap(), 3);
    }

    #[test]
    fn sanitize() {
        assert_eq!(sanitize_file_stem("Sponza Atrium/1"), "Sponza_Atrium_1");
        assert_eq!(sanitize_file_stem(""), "unnamed");
    }

    #[test]
    fn directories() {
        let root = TempDir::new("directories").unwrap();
        let processed = root.path().join("processed");
        let directories = Directories::create_all_dir(&processed).unwrap();
        assert_eq!(directories.processed_path(), processed);
        fs::remove_dir(&processed).unwrap();
        assert!(matches!(directories.check(), Err(Error::InvalidPath(_))));
    }
}
