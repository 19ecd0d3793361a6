//! # Page-Image Undo Log
//!
//! Before any page of the file is overwritten, its previous content is
//! appended here. Reopening the store replays every valid entry, which rolls
//! uncommitted work back to the state of the last checkpoint; a checkpoint
//! rotates the log and discards the entries it has made obsolete.
//!
//! ## On-disk form
//!
//! The log is a byte stream laid over a chain of log pages inside the heap
//! file itself, rooted at a fixed page id from the file header:
//!
//! ```text
//! log page:   [0xF1][next page id, i32 BE][stream bytes ...]
//! frame:      [0x01][page id, u32 BE][CRC-64 of image, u64 BE][page image]
//! end:        [0x00]
//! ```
//!
//! Frames freely span page boundaries. Replay stops at the end marker, a
//! checksum mismatch, or a truncated chain — a torn tail is treated as the
//! end of the log, never applied partially. Frames are collected first and
//! applied after the whole stream has been read, so applying an image can
//! never clobber a chain page the reader has not reached yet.
//!
//! ## Window dedup
//!
//! Each page is logged at most once per checkpoint window: the first
//! write-back that touches a page captures its pre-image, later ones are
//! no-ops. `reopen` clears the dedup set, releases continuation pages back
//! to the free pool, rewrites an empty root page, and syncs the file — the
//! caller truncates the file only after that sync returns.

use crc::{Crc, CRC_64_ECMA_182};
use eyre::{ensure, Result};

use crate::config::{META_PAGE_HEADER, PAGE_TYPE_LOG};
use crate::store::{FileStore, Geometry, PageAlloc};
use crate::util::BitField;

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

/// Frame prefix: marker byte, page id, checksum.
const FRAME_HEADER: usize = 1 + 4 + 8;

/// A zero byte where a marker is expected ends the stream; fresh log pages
/// are zero-filled, so the end marker never has to be written explicitly.
const MARKER_UNDO: u8 = 0x01;

pub(crate) struct PageLog {
    geo: Geometry,
    /// Pages of the current window's chain; `chain[0]` is the root.
    chain: Vec<u32>,
    /// In-memory image of the last chain page.
    buf: Vec<u8>,
    write_pos: usize,
    /// Pages already logged in this window.
    logged: BitField,
}

impl PageLog {
    pub fn new(root: u32, geo: Geometry) -> Self {
        Self {
            geo,
            chain: vec![root],
            buf: Self::fresh_page(geo),
            write_pos: META_PAGE_HEADER,
            logged: BitField::new(),
        }
    }

    fn fresh_page(geo: Geometry) -> Vec<u8> {
        let mut buf = vec![0u8; geo.page_size];
        buf[0] = PAGE_TYPE_LOG;
        buf
    }

    pub fn chain(&self) -> &[u32] {
        &self.chain
    }

    /// True if `page` already has a pre-image in the current window.
    pub fn is_logged(&self, page: u32) -> bool {
        self.logged.get(page as usize)
    }

    /// Appends the pre-image of `page` unless this window already holds one.
    /// The frame is flushed to disk before returning, so the caller may
    /// overwrite the page immediately after.
    pub fn add_undo(
        &mut self,
        file: &mut FileStore,
        alloc: &mut PageAlloc,
        page: u32,
        image: &[u8],
    ) -> Result<()> {
        if self.logged.get(page as usize) {
            return Ok(());
        }
        ensure!(
            image.len() == self.geo.page_size,
            "undo image is {} bytes, expected {}",
            image.len(),
            self.geo.page_size
        );
        self.logged.set(page as usize);

        let mut frame = Vec::with_capacity(FRAME_HEADER + image.len());
        frame.push(MARKER_UNDO);
        frame.extend_from_slice(&page.to_be_bytes());
        frame.extend_from_slice(&CRC64.checksum(image).to_be_bytes());
        frame.extend_from_slice(image);

        self.stream_write(file, alloc, &frame)?;
        self.flush_current(file)?;
        log::trace!("undo image of page {} logged", page);
        Ok(())
    }

    fn stream_write(
        &mut self,
        file: &mut FileStore,
        alloc: &mut PageAlloc,
        bytes: &[u8],
    ) -> Result<()> {
        let mut off = 0;
        while off < bytes.len() {
            let space = self.geo.page_size - self.write_pos;
            if space == 0 {
                let next = alloc.allocate_page(file)?;
                alloc.mark_meta(next);
                self.buf[1..5].copy_from_slice(&next.to_be_bytes());
                self.flush_current(file)?;
                self.chain.push(next);
                self.buf = Self::fresh_page(self.geo);
                self.write_pos = META_PAGE_HEADER;
                continue;
            }
            let n = space.min(bytes.len() - off);
            self.buf[self.write_pos..self.write_pos + n].copy_from_slice(&bytes[off..off + n]);
            self.write_pos += n;
            off += n;
        }
        Ok(())
    }

    /// Writes the current (possibly partial) chain page; the zero tail of
    /// the buffer doubles as the end marker.
    fn flush_current(&mut self, file: &mut FileStore) -> Result<()> {
        let page = *self.chain.last().expect("log chain never empty"); // INVARIANT: chain[0] is the root
        file.write_at(self.geo.page_offset(page), &self.buf)
    }

    /// Starts a fresh window: releases continuation pages to the free pool,
    /// clears the dedup set, rewrites an empty root page, and syncs.
    pub fn reopen(&mut self, file: &mut FileStore, alloc: &mut PageAlloc) -> Result<()> {
        for &page in &self.chain[1..] {
            alloc.clear_meta(page);
            alloc.free_page(page);
        }
        self.chain.truncate(1);
        self.logged.clear_all();
        self.buf = Self::fresh_page(self.geo);
        self.write_pos = META_PAGE_HEADER;
        self.flush_current(file)?;
        file.sync()?;
        log::debug!("undo log reopened");
        Ok(())
    }
}

/// Replays the undo log found at `root`. Returns the number of page images
/// applied and the chain pages the old window occupied (the caller releases
/// everything past the root).
pub(crate) fn recover(
    file: &mut FileStore,
    geo: Geometry,
    root: u32,
    page_count: u32,
) -> Result<(u32, Vec<u32>)> {
    let mut chain = vec![root];
    let mut stream: Vec<u8> = Vec::new();

    let mut page = root;
    loop {
        if page >= page_count {
            break;
        }
        let mut buf = vec![0u8; geo.page_size];
        file.read_at(geo.page_offset(page), &mut buf)?;
        if buf[0] != PAGE_TYPE_LOG {
            // A fresh or torn chain page ends the stream; an unwritten root
            // means there is nothing to replay at all.
            if page == root {
                return Ok((0, chain));
            }
            break;
        }
        let next = u32::from_be_bytes(buf[1..5].try_into().unwrap());
        stream.extend_from_slice(&buf[META_PAGE_HEADER..]);
        if next == 0 || next >= page_count || chain.contains(&next) {
            break;
        }
        chain.push(next);
        page = next;
    }

    // Collect every valid frame before applying any: an image must never
    // overwrite a chain page the reader has not visited yet.
    let mut frames: Vec<(u32, Vec<u8>)> = Vec::new();
    let mut off = 0usize;
    while off < stream.len() {
        if stream[off] != MARKER_UNDO {
            break;
        }
        if off + FRAME_HEADER + geo.page_size > stream.len() {
            break;
        }
        let page = u32::from_be_bytes(stream[off + 1..off + 5].try_into().unwrap());
        let stored = u64::from_be_bytes(stream[off + 5..off + 13].try_into().unwrap());
        let image = &stream[off + FRAME_HEADER..off + FRAME_HEADER + geo.page_size];
        if CRC64.checksum(image) != stored || page >= page_count {
            break;
        }
        frames.push((page, image.to_vec()));
        off += FRAME_HEADER + geo.page_size;
    }

    let applied = frames.len() as u32;
    for (page, image) in frames {
        file.write_at(geo.page_offset(page), &image)?;
    }
    if applied > 0 {
        log::debug!("replayed {} undo frames", applied);
    }
    Ok((applied, chain))
}
