//! # Byte-Oriented File Handle
//!
//! `FileStore` is the thin seek/read/write layer every higher component goes
//! through. It owns the banner region at the start of the file: the first 48
//! bytes are three copies of a fixed text line, written on create and
//! verified on open, so a foreign or truncated file is rejected before any
//! header field is interpreted.
//!
//! All errors carry the file name and the operation; the handle is released
//! when the value drops, including on every error path out of `open`.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use eyre::{ensure, Result, WrapErr};

use crate::config::{FILE_BANNER, FILE_HEADER_LENGTH};
use crate::error::StoreError;

#[derive(Debug)]
pub struct FileStore {
    file: File,
    name: String,
    read_only: bool,
}

impl FileStore {
    /// Byte length of the banner region preceding the header fields.
    pub const HEADER_LENGTH: usize = FILE_HEADER_LENGTH;

    /// Opens an existing file and verifies the banner region.
    pub fn open<P: AsRef<Path>>(path: P, read_only: bool) -> Result<Self> {
        let path = path.as_ref();
        let name = path.display().to_string();

        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path)
            .wrap_err_with(|| format!("failed to open store file '{}'", name))?;

        let mut store = Self {
            file,
            name,
            read_only,
        };

        let length = store.length()?;
        ensure!(
            length >= Self::HEADER_LENGTH as u64,
            StoreError::FileCorrupted(
                store.name.clone(),
                format!("file is {} bytes, shorter than the banner region", length),
            )
        );

        let mut banner = [0u8; FILE_HEADER_LENGTH];
        store.seek(0)?;
        store.read_fully(&mut banner)?;
        for (i, chunk) in banner.chunks_exact(FILE_BANNER.len()).enumerate() {
            if chunk != FILE_BANNER {
                return Err(StoreError::FileCorrupted(
                    store.name.clone(),
                    format!("banner line {} does not match", i),
                )
                .into());
            }
        }

        Ok(store)
    }

    /// Creates a new file (truncating any previous content) and writes the
    /// banner region.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let name = path.display().to_string();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create store file '{}'", name))?;

        let mut store = Self {
            file,
            name,
            read_only: false,
        };

        let mut banner = [0u8; FILE_HEADER_LENGTH];
        for chunk in banner.chunks_exact_mut(FILE_BANNER.len()) {
            chunk.copy_from_slice(FILE_BANNER);
        }
        store.seek(0)?;
        store.write(&banner)?;

        Ok(store)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    pub fn seek(&mut self, pos: u64) -> Result<()> {
        self.file
            .seek(SeekFrom::Start(pos))
            .wrap_err_with(|| format!("failed to seek to {} in '{}'", pos, self.name))?;
        Ok(())
    }

    /// Reads until `buf` is full; a short read is an error.
    pub fn read_fully(&mut self, buf: &mut [u8]) -> Result<()> {
        self.file
            .read_exact(buf)
            .wrap_err_with(|| format!("failed to read {} bytes from '{}'", buf.len(), self.name))
    }

    pub fn write(&mut self, buf: &[u8]) -> Result<()> {
        ensure!(
            !self.read_only,
            StoreError::ReadOnly(self.name.clone())
        );
        self.file
            .write_all(buf)
            .wrap_err_with(|| format!("failed to write {} bytes to '{}'", buf.len(), self.name))
    }

    /// Seek-then-read in one call.
    pub fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> Result<()> {
        self.seek(pos)?;
        self.read_fully(buf)
    }

    /// Seek-then-write in one call.
    pub fn write_at(&mut self, pos: u64, buf: &[u8]) -> Result<()> {
        self.seek(pos)?;
        self.write(buf)
    }

    pub fn length(&self) -> Result<u64> {
        let meta = self
            .file
            .metadata()
            .wrap_err_with(|| format!("failed to stat '{}'", self.name))?;
        Ok(meta.len())
    }

    pub fn set_length(&mut self, len: u64) -> Result<()> {
        ensure!(
            !self.read_only,
            StoreError::ReadOnly(self.name.clone())
        );
        self.file
            .set_len(len)
            .wrap_err_with(|| format!("failed to set length of '{}' to {}", self.name, len))
    }

    pub fn sync(&self) -> Result<()> {
        self.file
            .sync_all()
            .wrap_err_with(|| format!("failed to sync '{}'", self.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_open_verifies_banner() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("banner.db");

        let store = FileStore::create(&path).unwrap();
        assert_eq!(store.length().unwrap(), FILE_HEADER_LENGTH as u64);
        drop(store);

        let store = FileStore::open(&path, false).unwrap();
        assert!(!store.read_only());
    }

    #[test]
    fn open_rejects_foreign_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("foreign.db");
        std::fs::write(&path, vec![0xAB; 64]).unwrap();

        let err = FileStore::open(&path, false).unwrap_err();
        assert!(err.downcast_ref::<StoreError>().is_some());
    }

    #[test]
    fn open_rejects_truncated_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.db");
        std::fs::write(&path, b"-- H2").unwrap();

        assert!(FileStore::open(&path, false).is_err());
    }

    #[test]
    fn read_only_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ro.db");
        drop(FileStore::create(&path).unwrap());

        let mut store = FileStore::open(&path, true).unwrap();
        let err = store.write(b"x").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::ReadOnly(_))
        ));
    }

    #[test]
    fn read_at_returns_written_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rw.db");
        let mut store = FileStore::create(&path).unwrap();

        store.write_at(100, b"hello").unwrap();
        let mut buf = [0u8; 5];
        store.read_at(100, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }
}
