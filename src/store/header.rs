//! # File Header
//!
//! The first page of a store file is never rewritten after creation. It
//! holds the 48-byte banner (owned by [`super::FileStore`]) followed by this
//! fixed header struct:
//!
//! ```text
//! Offset  Size  Field            Description
//! ------  ----  ---------------  ---------------------------------------
//! 48      4     page_size        bytes per page (512..=32768, power of 2)
//! 52      1     write_version    0, otherwise the file opens read-only
//! 53      1     read_version     0, otherwise opening fails
//! 54      4     system_root      system table root page id (usually 1)
//! 58      4     free_list_root   free-page bitmap root page id (usually 2)
//! 62      4     log_root         undo log root page id (usually 3)
//! ```
//!
//! Integers are big-endian. The struct is read and written zero-copy; the
//! version gates are applied by the store on open, not here.

use eyre::{ensure, Result};
use zerocopy::big_endian::{I32, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::be_accessors;
use crate::config::{FREE_LIST_ROOT_PAGE, LOG_ROOT_PAGE, SYSTEM_ROOT_PAGE};

/// Current file format version this implementation reads and writes.
pub const READ_VERSION: u8 = 0;
pub const WRITE_VERSION: u8 = 0;

pub const STORE_HEADER_SIZE: usize = 18;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct StoreHeader {
    page_size: I32,
    write_version: u8,
    read_version: u8,
    system_root: U32,
    free_list_root: U32,
    log_root: U32,
}

const _: () = assert!(std::mem::size_of::<StoreHeader>() == STORE_HEADER_SIZE);

impl StoreHeader {
    /// A fresh header with the default root layout.
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size: I32::new(page_size as i32),
            write_version: WRITE_VERSION,
            read_version: READ_VERSION,
            system_root: U32::new(SYSTEM_ROOT_PAGE),
            free_list_root: U32::new(FREE_LIST_ROOT_PAGE),
            log_root: U32::new(LOG_ROOT_PAGE),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        ensure!(
            bytes.len() >= STORE_HEADER_SIZE,
            "buffer too small for StoreHeader: {} < {}",
            bytes.len(),
            STORE_HEADER_SIZE
        );
        Self::ref_from_bytes(&bytes[..STORE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse StoreHeader: {:?}", e))
    }

    be_accessors! {
        page_size: i32,
        system_root: u32,
        free_list_root: u32,
        log_root: u32,
    }

    pub fn write_version(&self) -> u8 {
        self.write_version
    }

    pub fn read_version(&self) -> u8 {
        self.read_version
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::IntoBytes;

    #[test]
    fn header_size_is_fixed() {
        assert_eq!(std::mem::size_of::<StoreHeader>(), STORE_HEADER_SIZE);
    }

    #[test]
    fn header_roundtrip() {
        let header = StoreHeader::new(4096);
        let bytes = header.as_bytes();

        let parsed = StoreHeader::from_bytes(bytes).unwrap();
        assert_eq!(parsed.page_size(), 4096);
        assert_eq!(parsed.write_version(), WRITE_VERSION);
        assert_eq!(parsed.read_version(), READ_VERSION);
        assert_eq!(parsed.system_root(), SYSTEM_ROOT_PAGE);
        assert_eq!(parsed.free_list_root(), FREE_LIST_ROOT_PAGE);
        assert_eq!(parsed.log_root(), LOG_ROOT_PAGE);
    }

    #[test]
    fn page_size_is_stored_big_endian() {
        let header = StoreHeader::new(1024);
        assert_eq!(&header.as_bytes()[0..4], &1024i32.to_be_bytes());
    }

    #[test]
    fn from_bytes_rejects_short_buffer() {
        assert!(StoreHeader::from_bytes(&[0u8; 10]).is_err());
    }
}
