//! # Shared File Coordinator
//!
//! `PageStore` owns everything the logical storages share: the file handle,
//! the header, the page allocator, the block-used bitmap, the page-owner
//! table, the write-back record cache, and the undo log. Every structural
//! mutation happens under its single `parking_lot::Mutex` — the database
//! monitor of the embedding system.
//!
//! ## Page allocation
//!
//! The allocator prefers growing the used region into preallocated space
//! (`last_used_page + 1`), falling back to the persistent free-page bitmap
//! once the preallocated tail is exhausted; the file grows by
//! `INCREMENT_PAGES` pages when both run out. Pages 0..=3 (header, system
//! root, free-list root, log root) are never handed out.
//!
//! ## Write-back and undo
//!
//! Records enter the cache on add/update/read and reach disk when evicted,
//! flushed, or checkpointed. Every page write is preceded by an undo-log
//! entry holding the page's previous on-disk content, captured at most once
//! per checkpoint window.
//!
//! ## Checkpoint
//!
//! Under the monitor: write back all dirty records in position order,
//! persist the free-page bitmap, sync the data file, rotate the undo log
//! (which syncs again), then truncate the file to `(last_used_page + 1)`
//! pages. Checkpoint is the durability boundary — work after the last
//! completed checkpoint is rolled back by undo replay at the next open.
//!
//! ## Open-time rebuild
//!
//! Opening an existing file replays the undo log, loads the free-page
//! bitmap, and then rebuilds the allocator state (used bits, page owners,
//! per-storage page lists and record counts) by scanning the block prefixes
//! of data pages. Pages in the free bitmap are skipped — their content is
//! stale by definition — and data pages that turn out to hold no live
//! records are reclaimed to the pool.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::{ensure, Result, WrapErr};
use hashbrown::HashMap;
use parking_lot::Mutex;
use smallvec::SmallVec;
use zerocopy::IntoBytes;

use crate::config::{
    page_size_valid, BLOCK_SIZE, DEFAULT_CACHE_CAPACITY, FILE_HEADER_LENGTH,
    FIRST_ALLOCATABLE_PAGE, FREE_LIST_ROOT_PAGE, INCREMENT_PAGES, LOG_ROOT_PAGE,
    PAGE_SIZE_DEFAULT, PAGE_SIZE_MIN, SYSTEM_ROOT_PAGE,
};
use crate::error::StoreError;
use crate::session::Session;
use crate::store::log as undo_log;
use crate::store::{
    CachePolicy, CacheWriter, DataPage, FileStore, Geometry, PageFreeList, PageLog, Record,
    RecordCache, RecordReader, Storage, StoreHeader, READ_VERSION, STORE_HEADER_SIZE,
    WRITE_VERSION,
};
use crate::util::{BitField, IntArray};

/// Page ids whose first byte is at or above this value are metadata pages
/// (log, free-list); data pages always start with the high byte of a small
/// big-endian block count, which is zero.
const META_TYPE_FLOOR: u8 = 0xF0;

/// Page allocator state: geometry, counters, the free-page bitmap, the
/// block-used bitmap, and the page-owner table.
pub(crate) struct PageAlloc {
    pub geo: Geometry,
    /// Total pages in the file, including free and preallocated ones.
    pub page_count: u32,
    /// Highest page id in use; pages past it are preallocated tail.
    pub last_used_page: u32,
    pub file_length: u64,
    pub free: PageFreeList,
    /// One bit per block; set iff the block belongs to a live record.
    pub used: BitField,
    /// Page id → owning storage id, -1 when unowned.
    pub owners: Vec<i32>,
    /// Pages holding store metadata (free-list links, log chain).
    pub meta: BitField,
}

impl PageAlloc {
    pub fn new(
        geo: Geometry,
        page_count: u32,
        last_used_page: u32,
        file_length: u64,
        free: PageFreeList,
    ) -> Self {
        Self {
            geo,
            page_count,
            last_used_page,
            file_length,
            free,
            used: BitField::new(),
            owners: vec![-1; page_count as usize],
            meta: BitField::new(),
        }
    }

    /// Hands out a page id: preallocated tail first, then the free bitmap,
    /// growing the file when both are exhausted.
    pub fn allocate_page(&mut self, file: &mut FileStore) -> Result<u32> {
        if self.free.free_count() == 0 && self.last_used_page + 1 >= self.page_count {
            self.increase_file_size(file, INCREMENT_PAGES)?;
        }
        if self.last_used_page + 1 < self.page_count {
            self.last_used_page += 1;
            // A reopened store can hold free-bitmap entries above the
            // rebuilt high-water mark; growing over one must consume it.
            self.free.remove(self.last_used_page);
            return Ok(self.last_used_page);
        }
        let page = self.free.allocate().ok_or_else(|| {
            StoreError::Internal("page allocator has neither free nor preallocated pages".into())
        })?;
        log::trace!("reused free page {}", page);
        Ok(page)
    }

    pub fn increase_file_size(&mut self, file: &mut FileStore, increment: u32) -> Result<()> {
        self.page_count += increment;
        self.owners.resize(self.page_count as usize, -1);
        self.file_length = self.page_count as u64 * self.geo.page_size as u64;
        file.set_length(self.file_length)
            .wrap_err("failed to grow the store file")?;
        log::debug!("file grown to {} pages", self.page_count);
        Ok(())
    }

    /// Returns a page to the free pool; its blocks must already be free.
    pub fn free_page(&mut self, page: u32) {
        debug_assert!(page > LOG_ROOT_PAGE, "reserved page {} freed", page);
        self.set_owner(page, -1);
        self.free.free(page);
    }

    pub fn owner(&self, page: u32) -> i32 {
        self.owners.get(page as usize).copied().unwrap_or(-1)
    }

    pub fn set_owner(&mut self, page: u32, owner: i32) {
        if (page as usize) < self.owners.len() {
            self.owners[page as usize] = owner;
        }
    }

    pub fn mark_meta(&mut self, page: u32) {
        self.meta.set(page as usize);
    }

    pub fn clear_meta(&mut self, page: u32) {
        self.meta.clear(page as usize);
    }

    pub fn is_meta(&self, page: u32) -> bool {
        self.meta.get(page as usize)
    }

    /// True if no block of the page belongs to a live record.
    pub fn page_blocks_free(&self, page: u32) -> bool {
        self.used
            .is_range_clear(self.geo.first_block(page) as usize, self.geo.blocks_per_page)
    }
}

/// Per-storage bookkeeping held in the store registry.
pub(crate) struct StorageState {
    pub record_count: u64,
    /// Owned pages, ascending, no duplicates.
    pub pages: IntArray,
    /// Recently freed positions eligible for same-storage reuse. Entries
    /// may be stale; staleness is filtered when they are consumed.
    pub free_list: IntArray,
    /// Round-robin cursor of the opportunistic page reclamation probe.
    pub page_check_index: usize,
    pub reader: Option<Arc<dyn RecordReader>>,
}

impl StorageState {
    pub fn new() -> Self {
        Self {
            record_count: 0,
            pages: IntArray::new(),
            free_list: IntArray::new(),
            page_check_index: 0,
            reader: None,
        }
    }
}

impl Default for StorageState {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) struct StoreInner {
    pub file: FileStore,
    pub geo: Geometry,
    pub read_only: bool,
    pub alloc: PageAlloc,
    pub log: PageLog,
    pub cache: RecordCache,
    pub storages: HashMap<u32, StorageState>,
}

/// The disjoint borrow of everything a page write needs: file, allocator
/// (the undo log allocates chain pages), and the log itself. Implements the
/// writer capability the cache invokes on dirty eviction.
pub(crate) struct PageIo<'a> {
    pub file: &'a mut FileStore,
    pub alloc: &'a mut PageAlloc,
    pub log: &'a mut PageLog,
    pub geo: Geometry,
}

impl CacheWriter for PageIo<'_> {
    fn write_back(&mut self, record: &mut Record) -> Result<()> {
        write_back_record(self.file, self.alloc, self.log, self.geo, record)
    }
}

/// Serializes a changed record and writes its block range, logging the
/// pre-image of every spanned page first. Clean records are a no-op.
pub(crate) fn write_back_record(
    file: &mut FileStore,
    alloc: &mut PageAlloc,
    log: &mut PageLog,
    geo: Geometry,
    record: &mut Record,
) -> Result<()> {
    if !record.changed() {
        return Ok(());
    }
    let pos = record.pos();
    let first = geo.page_of(pos);
    let last = geo.page_of(pos + record.block_count() - 1);
    let span: SmallVec<[u32; 2]> = (first..=last).collect();
    for page in span {
        if !log.is_logged(page) {
            let mut image = vec![0u8; geo.page_size];
            file.read_at(geo.page_offset(page), &mut image)?;
            log.add_undo(file, alloc, page, &image)?;
        }
    }

    let mut page = DataPage::create(record.block_count() as usize * BLOCK_SIZE);
    record.write_to(&mut page)?;
    file.write_at(geo.block_offset(pos), page.bytes())?;
    record.set_changed(false);
    log::trace!("wrote back record at block {}", pos);
    Ok(())
}

impl StoreInner {
    pub fn ensure_writable(&self) -> Result<()> {
        ensure!(
            !self.read_only,
            StoreError::ReadOnly(self.file.name().to_string())
        );
        Ok(())
    }

    /// Installs a record into the cache; a dirty eviction this forces is
    /// written back through the undo-logged path.
    pub fn install_record(&mut self, record: Record) -> Result<()> {
        let StoreInner {
            file,
            alloc,
            log,
            cache,
            geo,
            ..
        } = self;
        let mut io = PageIo {
            file,
            alloc,
            log,
            geo: *geo,
        };
        cache.update(record.pos(), record, &mut io)
    }

    pub fn reader_for(&self, storage_id: u32) -> Result<Arc<dyn RecordReader>> {
        self.storages
            .get(&storage_id)
            .and_then(|s| s.reader.clone())
            .ok_or_else(|| {
                StoreError::Internal(format!("no reader registered for storage {}", storage_id))
                    .into()
            })
    }

    /// Cache hit or a verified read from disk; the parsed record is
    /// installed in the cache before it is returned.
    pub fn get_record(&mut self, session: &Session, pos: u32, storage_id: u32) -> Result<Record> {
        if let Some(rec) = self.cache.find(pos) {
            ensure!(
                rec.storage_id() == storage_id,
                StoreError::Internal(format!(
                    "record at block {} belongs to storage {}, expected {}",
                    pos,
                    rec.storage_id(),
                    storage_id
                ))
            );
            return Ok(rec.clone());
        }
        let record = self.read_record(session, pos, storage_id)?;
        self.install_record(record.clone())?;
        Ok(record)
    }

    /// Like `get_record`, but a missing or foreign record is `None` rather
    /// than an error. Parse failures past the prefix still surface.
    pub fn get_record_if_stored(
        &mut self,
        session: &Session,
        pos: u32,
        storage_id: u32,
    ) -> Result<Option<Record>> {
        if let Some(rec) = self.cache.find(pos) {
            if rec.storage_id() != storage_id {
                return Ok(None);
            }
            return Ok(Some(rec.clone()));
        }
        if self.geo.page_of(pos) >= self.alloc.page_count || !self.alloc.used.get(pos as usize) {
            return Ok(None);
        }
        let mut prefix = [0u8; 8];
        self.file.read_at(self.geo.block_offset(pos), &mut prefix)?;
        let block_count = i32::from_be_bytes(prefix[0..4].try_into().unwrap());
        let stored_id = i32::from_be_bytes(prefix[4..8].try_into().unwrap());
        let max_run = self.geo.blocks_per_page as u32 - pos % self.geo.blocks_per_page as u32;
        if block_count <= 0 || block_count as u32 > max_run || stored_id != storage_id as i32 {
            return Ok(None);
        }
        let record = self.read_record(session, pos, storage_id)?;
        self.install_record(record.clone())?;
        Ok(Some(record))
    }

    fn read_record(&mut self, session: &Session, pos: u32, storage_id: u32) -> Result<Record> {
        let reader = self.reader_for(storage_id)?;
        let geo = self.geo;
        ensure!(
            geo.page_of(pos) < self.alloc.page_count,
            StoreError::FileCorrupted(
                self.file.name().to_string(),
                format!(
                    "block {} is on page {} of a {}-page file",
                    pos,
                    geo.page_of(pos),
                    self.alloc.page_count
                ),
            )
        );
        ensure!(
            self.alloc.used.get(pos as usize),
            StoreError::Internal(format!("no record stored at block {}", pos))
        );

        let mut prefix = [0u8; 8];
        self.file.read_at(geo.block_offset(pos), &mut prefix)?;
        let block_count = i32::from_be_bytes(prefix[0..4].try_into().unwrap());
        let max_run = geo.blocks_per_page as u32 - pos % geo.blocks_per_page as u32;
        ensure!(
            block_count > 0 && block_count as u32 <= max_run,
            StoreError::FileCorrupted(
                self.file.name().to_string(),
                format!("record at block {} has block count {}", pos, block_count),
            )
        );

        let mut buf = vec![0u8; block_count as usize * BLOCK_SIZE];
        self.file.read_at(geo.block_offset(pos), &mut buf)?;
        let mut page = DataPage::from_bytes(buf);
        Record::read_from(&mut page, reader.as_ref(), session, storage_id, pos).wrap_err_with(
            || {
                format!(
                    "failed to read record at block {} of '{}'",
                    pos,
                    self.file.name()
                )
            },
        )
    }

    /// Destroys the on-disk image of a removed record: logs the page
    /// pre-image, zeroes the block range, and drops any cached copy.
    pub fn purge_record(&mut self, pos: u32, block_count: u32) -> Result<()> {
        let StoreInner {
            file,
            alloc,
            log,
            cache,
            geo,
            ..
        } = self;
        let page = geo.page_of(pos);
        if !log.is_logged(page) {
            let mut image = vec![0u8; geo.page_size];
            file.read_at(geo.page_offset(page), &mut image)?;
            log.add_undo(file, alloc, page, &image)?;
        }
        file.write_at(
            geo.block_offset(pos),
            &vec![0u8; block_count as usize * BLOCK_SIZE],
        )?;
        cache.remove(pos);
        Ok(())
    }

    /// Returns a fully-empty page to the global pool and drops any cached
    /// records that still point into it.
    pub fn free_page_full(&mut self, page: u32) {
        self.alloc.free_page(page);
        for pos in self.cache.positions() {
            if self.geo.page_of(pos) == page {
                self.cache.remove(pos);
            }
        }
        log::trace!("page {} returned to the free pool", page);
    }

    /// Claims a fresh page for a storage. The page is zeroed on disk so a
    /// later open cannot misread stale content left by a previous owner.
    pub fn claim_page(&mut self, storage_id: u32) -> Result<u32> {
        let StoreInner {
            file, alloc, geo, ..
        } = self;
        let page = alloc.allocate_page(file)?;
        alloc.set_owner(page, storage_id as i32);
        file.write_at(geo.page_offset(page), &vec![0u8; geo.page_size])?;
        log::trace!("storage {} claimed page {}", storage_id, page);
        Ok(page)
    }

    /// Persists the free-page bitmap chain through the undo-logged write
    /// path, extending the chain when the file has outgrown it.
    fn write_free_list(&mut self) -> Result<()> {
        loop {
            let needed = self.alloc.free.links_for(self.alloc.page_count);
            if self.alloc.free.chain().len() >= needed {
                break;
            }
            let StoreInner { file, alloc, .. } = self;
            let page = alloc.allocate_page(file)?;
            alloc.mark_meta(page);
            alloc.free.push_chain(page);
        }

        let links: Vec<u32> = self.alloc.free.chain().to_vec();
        {
            let StoreInner {
                file, alloc, log, geo, ..
            } = self;
            for &page in &links {
                if !log.is_logged(page) {
                    let mut image = vec![0u8; geo.page_size];
                    file.read_at(geo.page_offset(page), &mut image)?;
                    log.add_undo(file, alloc, page, &image)?;
                }
            }
        }
        for (k, &page) in links.iter().enumerate() {
            let image = self.alloc.free.serialize_link(k, self.geo);
            self.file.write_at(self.geo.page_offset(page), &image)?;
        }
        Ok(())
    }

    /// Flush-all-dirty, persist the free bitmap, rotate the log, trim the
    /// file. The durability boundary of the store.
    pub fn checkpoint(&mut self) -> Result<()> {
        self.ensure_writable()?;
        log::debug!("checkpoint");

        let dirty = self.cache.all_changed();
        {
            let StoreInner {
                file,
                alloc,
                log,
                cache,
                geo,
                ..
            } = self;
            for mut record in dirty {
                write_back_record(file, alloc, log, *geo, &mut record)?;
                cache.set_clean(record.pos());
            }
        }

        self.write_free_list()?;
        self.file.sync()?;

        {
            let StoreInner {
                file, alloc, log, ..
            } = self;
            log.reopen(file, alloc)?;
        }

        let new_count = self.alloc.last_used_page + 1;
        let new_length = self.geo.page_offset(new_count);
        self.file.set_length(new_length)?;
        self.alloc.page_count = new_count;
        self.alloc.file_length = new_length;
        self.alloc.free.truncate(new_count);
        self.alloc
            .used
            .truncate(new_count as usize * self.geo.blocks_per_page);
        self.alloc.owners.truncate(new_count as usize);
        log::debug!("checkpoint done, file trimmed to {} pages", new_count);
        Ok(())
    }
}

/// Fluent configuration for opening or creating a store.
pub struct StoreBuilder {
    path: Option<PathBuf>,
    page_size: usize,
    cache_capacity: usize,
    cache_policy: CachePolicy,
    read_only: bool,
}

impl Default for StoreBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreBuilder {
    pub fn new() -> Self {
        Self {
            path: None,
            page_size: PAGE_SIZE_DEFAULT,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            cache_policy: CachePolicy::Lru,
            read_only: false,
        }
    }

    pub fn path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Page size for a newly created file; an existing file keeps the size
    /// recorded in its header.
    pub fn page_size(mut self, size: usize) -> Self {
        self.page_size = size;
        self
    }

    pub fn cache_capacity(mut self, records: usize) -> Self {
        self.cache_capacity = records;
        self
    }

    pub fn cache_policy(mut self, policy: CachePolicy) -> Self {
        self.cache_policy = policy;
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn open(self) -> Result<Arc<PageStore>> {
        let path = self.path.clone().ok_or_else(|| {
            StoreError::InvalidParameter("store path is required".into())
        })?;
        if path.exists() {
            PageStore::open_existing(self)
        } else {
            ensure!(
                !self.read_only,
                StoreError::InvalidParameter(format!(
                    "cannot create '{}' read-only",
                    path.display()
                ))
            );
            PageStore::create(self)
        }
    }
}

pub struct PageStore {
    name: String,
    page_size: usize,
    read_only: bool,
    system_root: u32,
    pub(crate) inner: Mutex<StoreInner>,
}

impl std::fmt::Debug for PageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageStore")
            .field("name", &self.name)
            .field("page_size", &self.page_size)
            .field("read_only", &self.read_only)
            .field("system_root", &self.system_root)
            .finish_non_exhaustive()
    }
}

impl PageStore {
    pub fn builder() -> StoreBuilder {
        StoreBuilder::new()
    }

    fn create(builder: StoreBuilder) -> Result<Arc<Self>> {
        let path = builder.path.as_ref().expect("path checked by builder");
        ensure!(
            page_size_valid(builder.page_size),
            StoreError::InvalidParameter(format!("illegal page size {}", builder.page_size))
        );
        let page_size = builder.page_size;
        let geo = Geometry::new(page_size);
        let mut file = FileStore::create(path)?;
        log::debug!("creating store '{}', page size {}", file.name(), page_size);

        file.set_length((LOG_ROOT_PAGE + 1) as u64 * page_size as u64)?;
        let free = PageFreeList::new(FREE_LIST_ROOT_PAGE, geo);
        let mut alloc = PageAlloc::new(
            geo,
            LOG_ROOT_PAGE + 1,
            LOG_ROOT_PAGE,
            (LOG_ROOT_PAGE + 1) as u64 * page_size as u64,
            free,
        );
        for page in 0..=LOG_ROOT_PAGE {
            alloc.mark_meta(page);
        }
        alloc.increase_file_size(&mut file, INCREMENT_PAGES - (LOG_ROOT_PAGE + 1))?;

        let header = StoreHeader::new(page_size);
        file.write_at(FILE_HEADER_LENGTH as u64, header.as_bytes())?;

        let link = alloc.free.serialize_link(0, geo);
        file.write_at(geo.page_offset(FREE_LIST_ROOT_PAGE), &link)?;

        let mut undo = PageLog::new(LOG_ROOT_PAGE, geo);
        undo.reopen(&mut file, &mut alloc)?;

        let name = file.name().to_string();
        let inner = StoreInner {
            file,
            geo,
            read_only: false,
            alloc,
            log: undo,
            cache: RecordCache::new(builder.cache_policy, builder.cache_capacity)?,
            storages: HashMap::new(),
        };
        Ok(Arc::new(Self {
            name,
            page_size,
            read_only: false,
            system_root: SYSTEM_ROOT_PAGE,
            inner: Mutex::new(inner),
        }))
    }

    fn open_existing(builder: StoreBuilder) -> Result<Arc<Self>> {
        let path = builder.path.as_ref().expect("path checked by builder");
        let mut file = FileStore::open(path, builder.read_only)?;
        let length = file.length()?;
        ensure!(
            length >= PAGE_SIZE_MIN as u64,
            StoreError::FileCorrupted(
                file.name().to_string(),
                format!("file is only {} bytes", length),
            )
        );

        let mut header_buf = [0u8; STORE_HEADER_SIZE];
        file.read_at(FILE_HEADER_LENGTH as u64, &mut header_buf)?;
        let header = *StoreHeader::from_bytes(&header_buf)?;
        let page_size = header.page_size() as usize;
        ensure!(
            page_size_valid(page_size),
            StoreError::FileCorrupted(
                file.name().to_string(),
                format!("illegal page size {}", page_size),
            )
        );
        if header.read_version() != READ_VERSION {
            return Err(StoreError::FileVersion(file.name().to_string()).into());
        }
        let mut read_only = builder.read_only;
        if header.write_version() != WRITE_VERSION && !read_only {
            log::warn!(
                "'{}' has write version {}, opening read-only",
                file.name(),
                header.write_version()
            );
            let name = file.name().to_string();
            drop(file);
            file = FileStore::open(Path::new(&name), true)?;
            read_only = true;
        }

        let geo = Geometry::new(page_size);
        let page_count = (length / page_size as u64) as u32;
        ensure!(
            page_count > LOG_ROOT_PAGE,
            StoreError::FileCorrupted(
                file.name().to_string(),
                format!("file has only {} pages", page_count),
            )
        );
        let log_root = header.log_root();
        let free_root = header.free_list_root();
        ensure!(
            log_root < page_count && free_root < page_count,
            StoreError::FileCorrupted(
                file.name().to_string(),
                format!("root pages {}/{} out of range", free_root, log_root),
            )
        );

        // Roll uncommitted work back before any state is derived from the
        // file. Old log chain pages beyond the root become orphans and are
        // reclaimed by the scan below.
        if !read_only {
            undo_log::recover(&mut file, geo, log_root, page_count)?;
        }

        let free = PageFreeList::load(&mut file, geo, free_root, page_count)?;
        let mut alloc = PageAlloc::new(geo, page_count, LOG_ROOT_PAGE, length, free);
        for page in 0..=LOG_ROOT_PAGE {
            alloc.mark_meta(page);
        }
        let chain: Vec<u32> = alloc.free.chain().to_vec();
        for page in chain {
            alloc.mark_meta(page);
        }

        let mut storages = HashMap::new();
        let last_used = scan_data_pages(&mut file, geo, &mut alloc, &mut storages)?;
        alloc.last_used_page = last_used;

        // Reclaim orphans: non-metadata pages inside the used region with
        // no live records and no free-bitmap entry.
        for page in FIRST_ALLOCATABLE_PAGE..=last_used {
            if !alloc.is_meta(page)
                && !alloc.free.contains(page)
                && alloc.owner(page) == -1
                && alloc.page_blocks_free(page)
            {
                alloc.free.free(page);
            }
        }

        let mut undo = PageLog::new(log_root, geo);
        if !read_only {
            undo.reopen(&mut file, &mut alloc)?;
        }

        log::debug!(
            "opened store '{}': {} pages, {} free, {} storages",
            file.name(),
            alloc.page_count,
            alloc.free.free_count(),
            storages.len()
        );

        let name = file.name().to_string();
        let inner = StoreInner {
            file,
            geo,
            read_only,
            alloc,
            log: undo,
            cache: RecordCache::new(builder.cache_policy, builder.cache_capacity)?,
            storages,
        };
        Ok(Arc::new(Self {
            name,
            page_size,
            read_only,
            system_root: header.system_root(),
            inner: Mutex::new(inner),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    pub fn system_root_page(&self) -> u32 {
        self.system_root
    }

    pub fn page_count(&self) -> u32 {
        self.inner.lock().alloc.page_count
    }

    pub fn free_page_count(&self) -> u32 {
        self.inner.lock().alloc.free.free_count()
    }

    /// Opens (or re-opens) the logical storage with the given id, binding
    /// its record reader.
    pub fn get_storage(self: &Arc<Self>, id: u32, reader: Arc<dyn RecordReader>) -> Storage {
        {
            let mut inner = self.inner.lock();
            let state = inner
                .storages
                .entry(id)
                .or_insert_with(|| StorageState::new());
            state.reader = Some(reader);
        }
        Storage::new(Arc::clone(self), id)
    }

    /// Flushes all dirty records and rotates the undo log; after this
    /// returns, everything written before it is durable.
    pub fn checkpoint(&self) -> Result<()> {
        self.inner.lock().checkpoint()
    }

    /// Syncs outstanding file writes. The handle itself is released when
    /// the last reference drops.
    pub fn close(&self) -> Result<()> {
        let inner = self.inner.lock();
        if !inner.read_only {
            inner.file.sync()?;
        }
        log::debug!("store '{}' closed", self.name);
        Ok(())
    }
}

/// Rebuilds used bits, page owners, and per-storage registries by scanning
/// the block prefixes of every candidate data page. Returns the highest
/// page in use (data or metadata).
fn scan_data_pages(
    file: &mut FileStore,
    geo: Geometry,
    alloc: &mut PageAlloc,
    storages: &mut HashMap<u32, StorageState>,
) -> Result<u32> {
    let bpp = geo.blocks_per_page;
    let mut last_used = LOG_ROOT_PAGE;
    for page in FIRST_ALLOCATABLE_PAGE..alloc.page_count {
        if alloc.is_meta(page) {
            last_used = last_used.max(page);
            continue;
        }
        if alloc.free.contains(page) {
            continue;
        }
        let mut buf = vec![0u8; geo.page_size];
        file.read_at(geo.page_offset(page), &mut buf)?;
        if buf[0] >= META_TYPE_FLOOR {
            // An orphaned log or free-list page from a rotated-away chain;
            // it is reclaimed by the orphan pass after the scan.
            continue;
        }
        let mut b = 0usize;
        let mut any = false;
        while b < bpp {
            let off = b * BLOCK_SIZE;
            let block_count = i32::from_be_bytes(buf[off..off + 4].try_into().unwrap());
            if block_count <= 0 || block_count as usize > bpp - b {
                b += 1;
                continue;
            }
            let sid = i32::from_be_bytes(buf[off + 4..off + 8].try_into().unwrap());
            if sid < 0 {
                b += 1;
                continue;
            }
            let owner = alloc.owner(page);
            if owner != -1 && owner != sid {
                return Err(StoreError::FileCorrupted(
                    file.name().to_string(),
                    format!(
                        "page {} holds records of storages {} and {}",
                        page, owner, sid
                    ),
                )
                .into());
            }
            let first_block = geo.first_block(page) as usize + b;
            alloc.used.set_range(first_block, block_count as usize, true);
            let state = storages
                .entry(sid as u32)
                .or_insert_with(|| StorageState::new());
            if owner == -1 {
                alloc.set_owner(page, sid);
                state.pages.add_value_sorted(page);
            }
            state.record_count += 1;
            b += block_count as usize;
            any = true;
        }
        if any {
            last_used = last_used.max(page);
        }
    }
    Ok(last_used)
}
