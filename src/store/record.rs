//! # Records and Record Readers
//!
//! A record is the unit a storage persists: a header the core understands
//! (position, block count, storage id, deleted/changed flags) plus an opaque
//! payload. The core never interprets the payload; each storage registers a
//! [`RecordReader`] that knows how to parse it back out of a page. The
//! payload must be self-describing — the reader decides where it ends.
//!
//! ## Wire layout
//!
//! Within its allocated block range a record is stored as:
//!
//! ```text
//! i32  block count     (self-describing range length)
//! i32  storage id
//! ...  payload         (reader-specific)
//! u8   checksum        (XOR of all preceding bytes)
//! ...  zero fill up to block count * BLOCK_SIZE
//! ```
//!
//! Records are plain values. The cache stores them by value and lookups
//! return clones; mutation re-installs a new value through the update path
//! rather than aliasing a shared object.

use eyre::{bail, ensure, Result};

use crate::config::{BLOCK_SIZE, RECORD_OVERHEAD};
use crate::session::Session;
use crate::store::DataPage;

/// Parses the reader-specific payload of a record. Implementations are
/// registered per storage; the cursor is positioned just past the block
/// count / storage id prefix when `read` is called, and must stop exactly
/// at the end of the payload.
pub trait RecordReader: Send + Sync {
    fn read(&self, session: &Session, page: &mut DataPage) -> Result<Vec<u8>>;
}

/// Default reader: the payload is a u32 length followed by that many bytes.
#[derive(Debug, Default)]
pub struct LenPrefixReader;

impl RecordReader for LenPrefixReader {
    fn read(&self, _session: &Session, page: &mut DataPage) -> Result<Vec<u8>> {
        let start = page.pos();
        let len = page.read_u32()? as usize;
        let body = page.read_bytes(len)?;
        let mut payload = Vec::with_capacity(4 + len);
        payload.extend_from_slice(&(len as u32).to_be_bytes());
        payload.extend_from_slice(&body);
        debug_assert_eq!(page.pos() - start, payload.len());
        Ok(payload)
    }
}

impl LenPrefixReader {
    /// Encodes raw bytes into the self-describing payload form this reader
    /// parses.
    pub fn encode(body: &[u8]) -> Vec<u8> {
        let mut payload = Vec::with_capacity(4 + body.len());
        payload.extend_from_slice(&(body.len() as u32).to_be_bytes());
        payload.extend_from_slice(body);
        payload
    }

    /// Strips the length prefix from a payload produced by [`Self::encode`].
    pub fn decode(payload: &[u8]) -> Result<&[u8]> {
        ensure!(payload.len() >= 4, "payload shorter than its length prefix");
        let len = u32::from_be_bytes(payload[..4].try_into().unwrap()) as usize;
        ensure!(
            payload.len() == 4 + len,
            "payload length {} does not match prefix {}",
            payload.len() - 4,
            len
        );
        Ok(&payload[4..])
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pos: u32,
    block_count: u32,
    storage_id: u32,
    deleted: bool,
    changed: bool,
    payload: Vec<u8>,
}

impl Record {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            pos: 0,
            block_count: 0,
            storage_id: 0,
            deleted: false,
            changed: false,
            payload,
        }
    }

    pub fn pos(&self) -> u32 {
        self.pos
    }

    pub fn set_pos(&mut self, pos: u32) {
        self.pos = pos;
    }

    pub fn block_count(&self) -> u32 {
        self.block_count
    }

    pub fn set_block_count(&mut self, block_count: u32) {
        self.block_count = block_count;
    }

    pub fn storage_id(&self) -> u32 {
        self.storage_id
    }

    pub fn set_storage_id(&mut self, storage_id: u32) {
        self.storage_id = storage_id;
    }

    pub fn deleted(&self) -> bool {
        self.deleted
    }

    pub fn set_deleted(&mut self, deleted: bool) {
        self.deleted = deleted;
    }

    pub fn changed(&self) -> bool {
        self.changed
    }

    pub fn set_changed(&mut self, changed: bool) {
        self.changed = changed;
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn set_payload(&mut self, payload: Vec<u8>) {
        self.payload = payload;
    }

    /// Payload length in bytes, the reader-reported size used for
    /// allocation.
    pub fn byte_count(&self) -> usize {
        self.payload.len()
    }

    /// Serializes this record into `page`, which must be exactly
    /// `block_count * BLOCK_SIZE` bytes with the cursor at 0.
    pub fn write_to(&self, page: &mut DataPage) -> Result<()> {
        ensure!(
            page.len() == self.block_count as usize * BLOCK_SIZE,
            "page is {} bytes but the record spans {} blocks",
            page.len(),
            self.block_count
        );
        page.reset();
        page.write_i32(self.block_count as i32)?;
        page.write_i32(self.storage_id as i32)?;
        page.write_bytes(&self.payload)?;
        let checksum = page.xor_checksum(0, page.pos())?;
        page.write_u8(checksum)?;
        page.fill_to(page.len())?;
        Ok(())
    }

    /// Parses a record out of `page` (cursor at 0, buffer starting at the
    /// record's first block), verifying the prefix against the caller's
    /// expectation and the trailer checksum against the stored bytes.
    pub fn read_from(
        page: &mut DataPage,
        reader: &dyn RecordReader,
        session: &Session,
        expected_storage_id: u32,
        pos: u32,
    ) -> Result<Record> {
        page.reset();
        let block_count = page.read_i32()?;
        ensure!(
            block_count > 0,
            "no record stored at block {} (block count {})",
            pos,
            block_count
        );
        let storage_id = page.read_i32()?;
        ensure!(
            storage_id == expected_storage_id as i32,
            "record at block {} belongs to storage {}, expected {}",
            pos,
            storage_id,
            expected_storage_id
        );
        let payload = reader.read(session, page)?;
        let checksum = page.xor_checksum(0, page.pos())?;
        let stored = page.read_u8()?;
        if checksum != stored {
            bail!(
                "checksum mismatch for record at block {}: computed {:#04x}, stored {:#04x}",
                pos,
                checksum,
                stored
            );
        }
        Ok(Record {
            pos,
            block_count: block_count as u32,
            storage_id: storage_id as u32,
            deleted: false,
            changed: false,
            payload,
        })
    }

    /// Blocks needed to store a payload of `len` bytes.
    pub fn blocks_for_payload(len: usize) -> u32 {
        let size = RECORD_OVERHEAD + len;
        size.div_ceil(BLOCK_SIZE) as u32
    }
}
