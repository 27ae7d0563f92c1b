//! Canonical resource files are written in a custom format that contains a header and the
//! bincode-serialized resource.
//!
//! ## Overview
//!
//! The header contains a magic number, a version number and a file type. The magic number is a
//! 16-byte UUID that identifies the file as a resource file. The version is the version of the
//! container format and not of the content. The file type names the resource kind that was
//! serialized into the content, e.g. `"model"` or `"texture"`.
//!
//! Header:
//!
//! | Field            | Type   | Size (bytes) | Description                          |
//! |------------------|--------|--------------|--------------------------------------|
//! | Magic            | u8[16] | 16           | 6f1c5a8e-93d2-4b7e-a0f4-2c5e81d7b3a9 |
//! | Version          | u32    | 4            | 1                                    |
//! | File type length | u32    | 4            | Length of the file type string       |
//! | File type        | String | variable     | Kind of the resource                 |
//!
//! The content is written directly after the header. Consider that the header has a
//! variable length.

use std::{
    fs::File,
    io::{self, BufReader, BufWriter, Read, Write},
    path::Path,
};

use bincode::Options;
use serde::{de::DeserializeOwned, Serialize};
use strom_shared::byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::{Error, Result};

/* UUID string: 6f1c5a8e-93d2-4b7e-a0f4-2c5e81d7b3a9 */
pub const MAGIC: [u8; 16] = [
    0x6f, 0x1c, 0x5a, 0x8e, 0x93, 0xd2, 0x4b, 0x7e, 0xa0, 0xf4, 0x2c, 0x5e, 0x81, 0xd7, 0xb3, 0xa9,
];

pub const VERSION: u32 = 1;

/// Upper bound for the file type string so that a corrupt header doesn't allocate arbitrary memory.
const MAX_FILE_TYPE_LEN: u32 = 256;

/// Header that is written at the beginning of a resource file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceHeader {
    pub magic: [u8; 16],
    pub version: u32,
    pub file_type: String,
}

fn invalid_data(message: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.to_owned())
}

impl ResourceHeader {
    pub fn new(file_type: impl Into<String>) -> Self {
        Self {
            magic: MAGIC,
            version: VERSION,
            file_type: file_type.into(),
        }
    }

    pub fn read<R: Read>(mut reader: R) -> io::Result<Self> {
        let mut magic = [0u8; 16];
        reader
            .read_exact(&mut magic)
            .map_err(|_| invalid_data("Failed to read magic number"))?;

        let version = reader
            .read_u32::<LittleEndian>()
            .map_err(|_| invalid_data("Failed to read version number"))?;

        let file_type_len = reader
            .read_u32::<LittleEndian>()
            .map_err(|_| invalid_data("Failed to read file type length"))?;
        if file_type_len > MAX_FILE_TYPE_LEN {
            return Err(invalid_data("File type is too long"));
        }
        let mut file_type_buf = vec![0u8; file_type_len as usize];
        reader
            .read_exact(&mut file_type_buf)
            .map_err(|_| invalid_data("Failed to read file type"))?;
        let file_type = String::from_utf8(file_type_buf).map_err(|_| invalid_data("File type is not UTF-8"))?;

        Ok(Self { magic, version, file_type })
    }

    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_all(&self.magic)?;
        writer.write_u32::<LittleEndian>(self.version)?;
        writer.write_u32::<LittleEndian>(self.file_type.len() as u32)?;
        writer.write_all(self.file_type.as_bytes())?;
        Ok(())
    }

    /// Checks if the header is valid.
    pub fn check(&self) -> io::Result<()> {
        if self.magic != MAGIC {
            return Err(invalid_data("Invalid magic number"));
        }
        if self.version != VERSION {
            return Err(invalid_data("Invalid version number"));
        }
        Ok(())
    }
}

/// Writes the header on creation and hands out a [`Write`] for the content.
pub struct ResourceWrite<W: Write> {
    writer: W,
}

impl<W: Write> ResourceWrite<W> {
    /// Creates a new resource file by writing the header.
    ///
    /// # Example
    ///
    /// ```rust
    /// use std::io::{Cursor, Write};
    /// use strom_content::resource_file::{ResourceHeader, ResourceWrite};
    ///
    /// let mut buf = Vec::new();
    /// let mut writer = ResourceWrite::create(&mut buf, "texture").unwrap();
    /// writer.write_content().write_all(b"pixels").unwrap();
    ///
    /// let header = ResourceHeader::read(Cursor::new(&buf)).unwrap();
    /// assert!(header.check().is_ok());
    /// assert_eq!(header.file_type, "texture");
    /// ```
    pub fn create(mut writer: W, file_type: impl Into<String>) -> io::Result<Self> {
        ResourceHeader::new(file_type).write(&mut writer)?;
        Ok(Self { writer })
    }

    /// Provides a [`Write`] implementation for the content of the resource file.
    pub fn write_content(&mut self) -> ContentWrite<W> {
        ContentWrite { resource_write: self }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

pub struct ContentWrite<'a, W: Write> {
    resource_write: &'a mut ResourceWrite<W>,
}

impl<'a, W: Write> Write for ContentWrite<'a, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.resource_write.writer.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.resource_write.writer.flush()
    }
}

/// Reads and checks the header on opening and hands out a [`Read`] for the content.
pub struct ResourceRead<R: Read> {
    reader: R,
    header: ResourceHeader,
}

impl<R: Read> ResourceRead<R> {
    pub fn open(mut reader: R) -> io::Result<Self> {
        let header = ResourceHeader::read(&mut reader)?;
        header.check()?;
        Ok(Self { reader, header })
    }

    pub fn header(&self) -> &ResourceHeader {
        &self.header
    }

    /// Provides a [`Read`] implementation for the content of the resource file.
    pub fn read_content(&mut self) -> ContentRead<R> {
        ContentRead { resource_read: self }
    }
}

pub struct ContentRead<'a, R: Read> {
    resource_read: &'a mut ResourceRead<R>,
}

impl<'a, R: Read> Read for ContentRead<'a, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.resource_read.reader.read(buf)
    }
}

/// Serializes `value` with bincode into a new resource file at `path`.
pub fn write_resource_file<T: Serialize>(path: &Path, file_type: &str, value: &T) -> Result<()> {
    let file = BufWriter::new(File::create(path)?);
    let mut resource_write = ResourceWrite::create(file, file_type)?;
    bincode::serialize_into(resource_write.write_content(), value)?;
    resource_write.into_inner().flush()?;
    Ok(())
}

/// Reads the resource file at `path` and deserializes its content after checking the file type.
pub fn read_resource_file<T: DeserializeOwned>(path: &Path, file_type: &str) -> Result<T> {
    let file = File::open(path)?;
    let limit = file.metadata()?.len();
    read_resource(BufReader::new(file), file_type, limit)
}

/// Same as [`read_resource_file`] for any reader.
///
/// The content may not be longer than `limit` bytes. Length prefixes that exceed it fail
/// before anything is allocated for them.
pub fn read_resource<T: DeserializeOwned, R: Read>(reader: R, file_type: &str, limit: u64) -> Result<T> {
    let mut resource_read = ResourceRead::open(reader)?;
    if resource_read.header().file_type != file_type {
        return Err(Error::UnexpectedFileType {
            expected: file_type.to_owned(),
            found: resource_read.header().file_type.clone(),
        });
    }
    // Same encoding as `bincode::serialize_into`
    let options = bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .allow_trailing_bytes()
        .with_limit(limit);
    Ok(options.deserialize_from(resource_read.read_content())?)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use serde::Deserialize;
    use tempdir::TempDir;

    use super::*;

    fn assert_header<R: Read>(mut reader: R, expected_file_type: &str) {
        let mut actual_magic = [0u8; 16];
        reader.read_exact(&mut actual_magic).unwrap();
        assert_eq!(actual_magic, MAGIC);
        assert_eq!(reader.read_u32::<LittleEndian>().unwrap(), VERSION);
        let file_type_len = reader.read_u32::<LittleEndian>().unwrap();
        let mut actual_file_type = vec![0u8; file_type_len as usize];
        reader.read_exact(&mut actual_file_type).unwrap();
        assert_eq!(String::from_utf8(actual_file_type).unwrap(), expected_file_type);
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Payload {
        name: String,
        values: Vec<u32>,
    }

    #[test]
    fn create() {
        // Given
        let mut buf = Vec::new();

        // When
        let mut writer = ResourceWrite::create(&mut buf, "model").unwrap();
        writer.write_content().write_all(b"Hello, world!").unwrap();

        // Then
        let mut reader = Cursor::new(&buf);
        assert_header(&mut reader, "model");
        let mut rest = String::new();
        reader.read_to_string(&mut rest).unwrap();
        assert_eq!(rest, "Hello, world!");
    }

    #[test]
    fn read() {
        // Given
        let mut buf = Vec::new();
        let mut writer = ResourceWrite::create(&mut buf, "model").unwrap();
        writer.write_content().write_all(b"Hello, world!").unwrap();

        // When
        let mut reader = ResourceRead::open(Cursor::new(&buf)).unwrap();
        let mut actual = String::new();
        reader.read_content().read_to_string(&mut actual).unwrap();

        // Then
        assert_eq!(reader.header().file_type, "model");
        assert_eq!(actual, "Hello, world!");
    }

    #[test]
    fn invalid_magic() {
        let mut buf = Vec::new();
        ResourceWrite::create(&mut buf, "model").unwrap();
        buf[0] ^= 0xff;
        let result = ResourceRead::open(Cursor::new(&buf));
        assert_eq!(result.err().unwrap().kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn truncated_header() {
        let mut buf = Vec::new();
        ResourceWrite::create(&mut buf, "model").unwrap();
        buf.truncate(20);
        assert!(ResourceHeader::read(Cursor::new(&buf)).is_err());
    }

    #[test]
    fn serialized_file() {
        // Given
        let root = TempDir::new("resource_file").unwrap();
        let path = root.path().join("payload.bin");
        let payload = Payload {
            name: "payload".to_owned(),
            values: vec![1, 2, 3],
        };

        // When
        write_resource_file(&path, "payload", &payload).unwrap();

        // Then
        let actual = read_resource_file::<Payload>(&path, "payload").unwrap();
        assert_eq!(actual, payload);
    }

    #[test]
    fn unexpected_file_type() {
        let root = TempDir::new("resource_file").unwrap();
        let path = root.path().join("payload.bin");
        write_resource_file(&path, "model", &vec![1u32]).unwrap();
        let result = read_resource_file::<Vec<u32>>(&path, "texture");
        assert!(matches!(
            result,
            Err(Error::UnexpectedFileType { expected, found }) if expected == "texture" && found == "model"
        ));
    }

    #[test]
    fn corrupt_content() {
        let mut buf = Vec::new();
        let mut writer = ResourceWrite::create(&mut buf, "payload").unwrap();
        writer.write_content().write_all(&[0xff; 3]).unwrap();
        let result = read_resource::<Payload, _>(Cursor::new(&buf), "payload", buf.len() as u64);
        assert!(matches!(result, Err(Error::FailedSerialization(_))));
    }

    #[test]
    fn length_prefix_beyond_file() {
        let root = TempDir::new("resource_file").unwrap();
        let path = root.path().join("payload.bin");
        let mut file = BufWriter::new(File::create(&path).unwrap());
        let mut writer = ResourceWrite::create(&mut file, "payload").unwrap();
        // The name claims to be far longer than the file.
        writer.write_content().write_u64::<LittleEndian>(u64::MAX / 2).unwrap();
        writer.write_content().write_all(b"short").unwrap();
        drop(writer);
        file.flush().unwrap();
        drop(file);

        let result = read_resource_file::<Payload>(&path, "payload");
        assert!(matches!(result, Err(Error::FailedSerialization(_))));
    }
}
