//! # Logical Storage Facade
//!
//! A `Storage` is the per-table/per-index view over the shared store: a set
//! of owned pages, a record count, and a bounded list of recently freed
//! positions. Handles are cheap clones over the shared [`PageStore`]; every
//! operation takes the store's monitor for its duration.
//!
//! ## Allocation policy
//!
//! Adding a record tries, in order:
//!
//! 1. the per-storage free list — positions freed by earlier removes. An
//!    entry can be stale (its blocks were reused by a larger neighbor), so
//!    each candidate is re-checked: every block of the range must be unused
//!    and its page owned by this storage. Stale entries are dropped as they
//!    are encountered, not eagerly.
//! 2. a gap of enough contiguous free blocks on a page this storage
//!    already owns.
//! 3. a freshly claimed page from the global allocator.
//!
//! Freed positions are appended to the free list without deduplication as
//! long as it has capacity; overflow is silently discarded (those blocks
//! stay reclaimable through gap scans).
//!
//! ## Sequential scans
//!
//! `get_next` walks the block-used bitmap in ascending position order,
//! constrained to this storage's sorted page list. A 64-bit window over the
//! bitmap lets the scan skip an entirely free region in one step instead of
//! probing block by block.
//!
//! ## Page reclamation
//!
//! Every remove first probes one page of the storage, round-robin: if that
//! page has no used blocks left, it is released to the global free pool.
//! Reclamation therefore lags removal by at most one cycle through the
//! page list.

use std::sync::Arc;

use eyre::{ensure, Result};

use crate::config::{
    free_list_capacity, BLOCK_SIZE, FIRST_ALLOCATABLE_PAGE, INCREMENT_PAGES, RECORD_OVERHEAD,
};
use crate::error::StoreError;
use crate::session::Session;
use crate::store::page_store::{write_back_record, PageAlloc, StorageState, StoreInner};
use crate::store::{round_up, Geometry, PageStore, Record, RecordReader};

/// Handle to one logical record collection of a [`PageStore`].
#[derive(Clone)]
pub struct Storage {
    store: Arc<PageStore>,
    id: u32,
}

impl Storage {
    pub(crate) fn new(store: Arc<PageStore>, id: u32) -> Self {
        Self { store, id }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Fixed per-record header-and-trailer cost in bytes.
    pub fn record_overhead(&self) -> usize {
        RECORD_OVERHEAD
    }

    pub fn record_count(&self) -> u64 {
        self.store
            .inner
            .lock()
            .storages
            .get(&self.id)
            .map(|s| s.record_count)
            .unwrap_or(0)
    }

    /// Replaces the record parser bound to this storage.
    pub fn set_reader(&self, reader: Arc<dyn RecordReader>) {
        let mut inner = self.store.inner.lock();
        if let Some(state) = inner.storages.get_mut(&self.id) {
            state.reader = Some(reader);
        }
    }

    /// Adds a record. With `pos == None` a block range is allocated;
    /// otherwise the caller-supplied range is claimed. Returns the record's
    /// position.
    pub fn add_record(
        &self,
        session: &Session,
        record: &mut Record,
        pos: Option<u32>,
    ) -> Result<u32> {
        let mut inner = self.store.inner.lock();
        inner.ensure_writable()?;
        let geo = inner.geo;

        record.set_storage_id(self.id);
        record.set_deleted(false);
        let size = RECORD_OVERHEAD + record.byte_count();
        ensure!(
            size <= geo.page_size,
            StoreError::InvalidParameter(format!(
                "record of {} payload bytes does not fit a {}-byte page",
                record.byte_count(),
                geo.page_size
            ))
        );
        let block_count = size.div_ceil(BLOCK_SIZE) as u32;

        let pos = match pos {
            None => inner.allocate_for(self.id, block_count)?,
            Some(p) => {
                inner.use_explicit_range(self.id, p, block_count)?;
                p
            }
        };
        record.set_pos(pos);
        record.set_block_count(block_count);
        record.set_changed(true);

        inner
            .storages
            .get_mut(&self.id)
            .expect("storage state exists after allocation") // INVARIANT: allocate_for/use_explicit_range create it
            .record_count += 1;
        inner.install_record(record.clone())?;
        log::trace!(
            "session {} added record at block {} to storage {}",
            session.id(),
            pos,
            self.id
        );
        Ok(pos)
    }

    /// Re-installs a mutated record; it reaches disk on eviction, flush, or
    /// checkpoint. The record's allocation cannot grow.
    pub fn update_record(&self, session: &Session, record: &Record) -> Result<()> {
        let mut inner = self.store.inner.lock();
        inner.ensure_writable()?;
        ensure!(
            record.storage_id() == self.id,
            StoreError::Internal(format!(
                "record of storage {} updated through storage {}",
                record.storage_id(),
                self.id
            ))
        );
        let size = RECORD_OVERHEAD + record.byte_count();
        ensure!(
            size.div_ceil(BLOCK_SIZE) as u32 <= record.block_count(),
            StoreError::InvalidParameter(format!(
                "update would grow the record at block {} past its {} blocks",
                record.pos(),
                record.block_count()
            ))
        );
        let mut updated = record.clone();
        updated.set_deleted(false);
        updated.set_changed(true);
        inner.install_record(updated)?;
        log::trace!(
            "session {} updated record at block {}",
            session.id(),
            record.pos()
        );
        Ok(())
    }

    /// Removes the record at `pos`. Removing a position twice is a caller
    /// bug and reported as an internal error.
    pub fn remove_record(&self, session: &Session, pos: u32) -> Result<()> {
        let mut inner = self.store.inner.lock();
        inner.ensure_writable()?;
        inner.check_one_page(self.id);

        let record = inner.get_record(session, pos, self.id)?;
        ensure!(
            !record.deleted(),
            StoreError::Internal(format!("duplicate delete at block {}", pos))
        );
        let block_count = record.block_count();
        inner.free_blocks(self.id, pos, block_count);
        inner
            .storages
            .get_mut(&self.id)
            .expect("storage state exists for a stored record") // INVARIANT: get_record verified the storage
            .record_count -= 1;
        inner.purge_record(pos, block_count)?;
        log::trace!(
            "session {} removed record at block {} from storage {}",
            session.id(),
            pos,
            self.id
        );
        Ok(())
    }

    /// Reads the record at `pos` (cache hit or verified disk read).
    pub fn get_record(&self, session: &Session, pos: u32) -> Result<Record> {
        self.store.inner.lock().get_record(session, pos, self.id)
    }

    /// Like [`Self::get_record`], but `None` when nothing of this storage
    /// is stored at `pos`.
    pub fn get_record_if_stored(&self, session: &Session, pos: u32) -> Result<Option<Record>> {
        self.store
            .inner
            .lock()
            .get_record_if_stored(session, pos, self.id)
    }

    /// Position of the next live record after `record` (after the start of
    /// the storage when `record` is `None`); `None` when the scan is
    /// exhausted. Positions come back in strictly ascending order.
    pub fn get_next(&self, record: Option<&Record>) -> Option<u32> {
        let inner = self.store.inner.lock();
        inner.next_record_pos(self.id, record.map(|r| (r.pos(), r.block_count())))
    }

    /// Drops every record of this storage and releases its pages to the
    /// global free pool. The storage id stays valid.
    pub fn truncate(&self, session: &Session) -> Result<()> {
        let mut inner = self.store.inner.lock();
        inner.ensure_writable()?;
        let geo = inner.geo;

        let pages: Vec<u32> = match inner.storages.get(&self.id) {
            Some(state) => state.pages.iter().collect(),
            None => return Ok(()),
        };
        for &page in &pages {
            inner
                .alloc
                .used
                .set_range(geo.first_block(page) as usize, geo.blocks_per_page, false);
            inner.free_page_full(page);
        }
        let state = inner
            .storages
            .get_mut(&self.id)
            .expect("storage state exists"); // INVARIANT: checked above
        state.pages.clear();
        state.free_list.clear();
        state.record_count = 0;
        state.page_check_index = 0;
        log::debug!(
            "session {} truncated storage {} ({} pages released)",
            session.id(),
            self.id,
            pages.len()
        );
        Ok(())
    }

    /// Writes one record to disk immediately instead of waiting for
    /// eviction or a checkpoint.
    pub fn flush_record(&self, record: &Record) -> Result<()> {
        let mut inner = self.store.inner.lock();
        inner.ensure_writable()?;
        let mut current = match inner.cache.find(record.pos()) {
            Some(cached) => cached.clone(),
            None => record.clone(),
        };
        let StoreInner {
            ref mut file,
            ref mut alloc,
            ref mut log,
            ref mut cache,
            geo,
            ..
        } = *inner;
        write_back_record(file, alloc, log, geo, &mut current)?;
        cache.set_clean(current.pos());
        Ok(())
    }
}

/// True when every block of `[pos, pos + blocks)` is unused and lies on a
/// single page owned by `storage_id`.
fn is_free_and_mine(alloc: &PageAlloc, geo: Geometry, storage_id: u32, pos: u32, blocks: u32) -> bool {
    let last = pos + blocks - 1;
    if geo.page_of(pos) != geo.page_of(last) {
        return false;
    }
    if alloc.owner(geo.page_of(pos)) != storage_id as i32 {
        return false;
    }
    alloc.used.is_range_clear(pos as usize, blocks as usize)
}

/// First position of `blocks` contiguous free blocks within `page`, if any.
fn free_run_in_page(alloc: &PageAlloc, geo: Geometry, page: u32, blocks: u32) -> Option<u32> {
    let base = geo.first_block(page) as usize;
    let mut run = 0usize;
    for b in 0..geo.blocks_per_page {
        if alloc.used.get(base + b) {
            run = 0;
        } else {
            run += 1;
            if run == blocks as usize {
                return Some((base + b + 1 - run) as u32);
            }
        }
    }
    None
}

impl StoreInner {
    /// Free-list-first block allocation for one storage.
    pub(crate) fn allocate_for(&mut self, storage_id: u32, blocks: u32) -> Result<u32> {
        let geo = self.geo;
        let StoreInner {
            ref mut file,
            ref mut alloc,
            ref mut storages,
            ..
        } = *self;
        let state = storages
            .entry(storage_id)
            .or_insert_with(|| StorageState::new());

        // 1. Recently freed positions; stale entries are dropped on sight.
        let mut i = 0;
        while i < state.free_list.len() {
            let candidate = state.free_list.get(i);
            if alloc.used.get(candidate as usize) {
                state.free_list.remove_index(i);
                continue;
            }
            if is_free_and_mine(alloc, geo, storage_id, candidate, blocks) {
                state.free_list.remove_index(i);
                alloc.used.set_range(candidate as usize, blocks as usize, true);
                return Ok(candidate);
            }
            i += 1;
        }

        // 2. A gap on a page this storage already owns.
        for page in state.pages.iter() {
            if let Some(pos) = free_run_in_page(alloc, geo, page, blocks) {
                alloc.used.set_range(pos as usize, blocks as usize, true);
                return Ok(pos);
            }
        }

        // 3. A fresh page, zeroed on claim.
        let page = alloc.allocate_page(file)?;
        alloc.set_owner(page, storage_id as i32);
        file.write_at(geo.page_offset(page), &vec![0u8; geo.page_size])?;
        state.pages.add_value_sorted(page);
        let pos = geo.first_block(page);
        alloc.used.set_range(pos as usize, blocks as usize, true);
        log::trace!("storage {} claimed page {}", storage_id, page);
        Ok(pos)
    }

    /// Claims a caller-chosen block range, taking page ownership and
    /// growing the file as needed.
    pub(crate) fn use_explicit_range(
        &mut self,
        storage_id: u32,
        pos: u32,
        blocks: u32,
    ) -> Result<()> {
        let geo = self.geo;
        let page = geo.page_of(pos);
        ensure!(
            page == geo.page_of(pos + blocks - 1),
            StoreError::InvalidParameter(format!(
                "block range {}+{} crosses a page boundary",
                pos, blocks
            ))
        );
        ensure!(
            page >= FIRST_ALLOCATABLE_PAGE && !self.alloc.is_meta(page),
            StoreError::InvalidParameter(format!("page {} is reserved", page))
        );
        ensure!(
            self.alloc.used.is_range_clear(pos as usize, blocks as usize),
            StoreError::Internal(format!("block range {}+{} is already in use", pos, blocks))
        );

        let owner = self.alloc.owner(page);
        if owner == -1 {
            while page >= self.alloc.page_count {
                let StoreInner {
                    ref mut file,
                    ref mut alloc,
                    ..
                } = *self;
                alloc.increase_file_size(file, INCREMENT_PAGES)?;
            }
            self.alloc.free.remove(page);
            self.file
                .write_at(geo.page_offset(page), &vec![0u8; geo.page_size])?;
            self.alloc.set_owner(page, storage_id as i32);
            self.alloc.last_used_page = self.alloc.last_used_page.max(page);
            self.storages
                .entry(storage_id)
                .or_insert_with(|| StorageState::new())
                .pages
                .add_value_sorted(page);
        } else {
            ensure!(
                owner == storage_id as i32,
                StoreError::Internal(format!(
                    "page {} belongs to storage {}, not {}",
                    page, owner, storage_id
                ))
            );
        }
        self.alloc.used.set_range(pos as usize, blocks as usize, true);
        Ok(())
    }

    /// Clears the used bits of a freed range and remembers the position for
    /// reuse while the bounded free list has room.
    pub(crate) fn free_blocks(&mut self, storage_id: u32, pos: u32, blocks: u32) {
        self.alloc
            .used
            .set_range(pos as usize, blocks as usize, false);
        let capacity = free_list_capacity(self.geo.page_size);
        if let Some(state) = self.storages.get_mut(&storage_id) {
            if state.free_list.len() < capacity {
                state.free_list.add(pos);
            }
        }
    }

    /// Round-robin probe of one owned page; a fully free page is released
    /// to the global pool.
    pub(crate) fn check_one_page(&mut self, storage_id: u32) {
        let page = {
            let state = match self.storages.get_mut(&storage_id) {
                Some(state) if !state.pages.is_empty() => state,
                _ => return,
            };
            state.page_check_index = (state.page_check_index + 1) % state.pages.len();
            state.pages.get(state.page_check_index)
        };
        if self.alloc.page_blocks_free(page) && self.alloc.owner(page) == storage_id as i32 {
            if let Some(state) = self.storages.get_mut(&storage_id) {
                state.pages.remove_value(page);
            }
            self.free_page_full(page);
            log::trace!("storage {} released empty page {}", storage_id, page);
        }
    }

    /// Position of the next live record at or after `from` (exclusive of
    /// the record `from` describes), constrained to the storage's pages.
    pub(crate) fn next_record_pos(
        &self,
        storage_id: u32,
        from: Option<(u32, u32)>,
    ) -> Option<u32> {
        let state = self.storages.get(&storage_id)?;
        let geo = self.geo;
        let bpp = geo.blocks_per_page as u32;

        let mut page_index: Option<usize> = None;
        let (mut last_checked_page, mut next) = match from {
            None => {
                if state.pages.is_empty() {
                    return None;
                }
                page_index = Some(0);
                let page = state.pages.get(0);
                (page, page * bpp)
            }
            Some((pos, block_count)) => (geo.page_of(pos), pos + block_count),
        };

        loop {
            let page = next / bpp;
            if page != last_checked_page {
                let idx = match page_index {
                    None => state.pages.find_next_index(page),
                    Some(i) => i + 1,
                };
                if idx >= state.pages.len() {
                    return None;
                }
                page_index = Some(idx);
                last_checked_page = state.pages.get(idx);
                next = next.max(last_checked_page * bpp);
            }
            if self.alloc.used.get(next as usize) {
                return Some(next);
            }
            if self.alloc.used.get_word(next as usize) == 0 {
                // The whole 64-block window is free: skip to its end.
                next = round_up(next + 1, 64);
            } else {
                next += 1;
            }
        }
    }
}
