use std::{collections::BTreeMap, sync::Arc};

use strom_shared::log::trace;

use crate::{Error, Origin, Result};

/// Source bytes handed to a [`Materializer`].
pub struct SourceData<'a> {
    /// Name of the resource for error messages
    pub name: &'a str,
    /// Lowercase extension that selected the materializer
    pub extension: &'a str,
    pub bytes: &'a [u8],
}

/// Converts the source bytes of an [`Origin`] into the canonical representation `T`.
pub type Materializer<T> = dyn Fn(&SourceData) -> Result<T> + Send + Sync;

/// Materializers of one resource kind registered by file extension.
pub struct MaterializerRegistry<T> {
    materializers: BTreeMap<String, Arc<Materializer<T>>>,
}

impl<T> Default for MaterializerRegistry<T> {
    fn default() -> Self {
        Self {
            materializers: BTreeMap::new(),
        }
    }
}

impl<T> MaterializerRegistry<T> {
    /// Registers the materializer for the given extension. A previous registration is replaced.
    ///
    /// # Example
    ///
    /// ```rust
    /// use strom_content::{MaterializerRegistry, Origin};
    ///
    /// let mut registry = MaterializerRegistry::<String>::default();
    /// registry.register("txt", Box::new(|source| Ok(String::from_utf8_lossy(source.bytes).into_owned())));
    /// let text = registry.materialize("hello", &Origin::embedded("txt", b"Hello".to_vec())).unwrap();
    /// assert_eq!(text, "Hello");
    /// ```
    pub fn register(&mut self, extension: impl Into<String>, materializer: Box<Materializer<T>>) {
        let extension = extension.into().to_lowercase();
        trace!("Registering materializer for extension '{extension}'");
        self.materializers.insert(extension, Arc::from(materializer));
    }

    pub fn contains(&self, extension: &str) -> bool {
        self.materializers.contains_key(extension)
    }

    pub fn extensions(&self) -> impl Iterator<Item = &str> {
        self.materializers.keys().map(String::as_str)
    }

    /// Returns the materializer for the origin's extension.
    pub fn get(&self, origin: &Origin) -> Result<Arc<Materializer<T>>> {
        let extension = origin.extension()?;
        self.materializers
            .get(&extension)
            .cloned()
            .ok_or(Error::ExtensionNotRegistered(extension))
    }

    /// Reads the origin and runs the matching materializer. This blocks.
    pub fn materialize(&self, name: &str, origin: &Origin) -> Result<T> {
        let materializer = self.get(origin)?;
        run_materializer(&*materializer, name, origin)
    }
}

/// Reads the origin and runs the given materializer. This blocks.
pub fn run_materializer<T>(materializer: &Materializer<T>, name: &str, origin: &Origin) -> Result<T> {
    let extension = origin.extension()?;
    let bytes = origin.read_bytes()?;
    materializer(&SourceData {
        name,
        extension: &extension,
        bytes: &bytes,
    })
}
