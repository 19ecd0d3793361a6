//! # Store Configuration Constants
//!
//! This module centralizes the geometry and policy constants of the store,
//! grouping interdependent values together. Constants that depend on each
//! other are co-located to prevent mismatch bugs.
//!
//! ## Dependency Graph
//!
//! ```text
//! BLOCK_SIZE (128 bytes)
//!       │
//!       ├─> blocks_per_page = page_size / BLOCK_SIZE
//!       │     page_size is chosen per file (512..=32768, power of two),
//!       │     so blocks_per_page is 4..=256.
//!       │
//!       └─> RECORD_OVERHEAD (9 bytes)
//!             i32 block count + i32 storage id + checksum byte; a record
//!             payload plus overhead is rounded up to whole blocks.
//!
//! PAGE_SIZE_MIN (512)
//!       │
//!       └─> The file header (banner + header struct) must fit inside the
//!           first PAGE_SIZE_MIN bytes so it can be read before the page
//!           size is known.
//!
//! INCREMENT_PAGES (128)
//!       │
//!       └─> File growth chunk; a fresh store is preallocated to this many
//!           pages so early inserts never grow the file.
//! ```
//!
//! ## Critical Invariants
//!
//! Enforced by compile-time assertions below:
//!
//! 1. `BLOCK_SIZE` is a power of two
//! 2. `PAGE_SIZE_MIN` is a multiple of `BLOCK_SIZE` (every legal page size is)
//! 3. The banner region is exactly three banner lines
//! 4. Reserved page ids are contiguous from 0

/// Smallest allocation unit for records, in bytes.
pub const BLOCK_SIZE: usize = 128;

/// Minimum legal page size in bytes.
pub const PAGE_SIZE_MIN: usize = 512;

/// Maximum legal page size in bytes.
pub const PAGE_SIZE_MAX: usize = 32768;

/// Page size used when creating a new store without an explicit choice.
pub const PAGE_SIZE_DEFAULT: usize = 1024;

/// Number of pages the file grows by when the used region catches up with
/// the preallocated space.
pub const INCREMENT_PAGES: u32 = 128;

/// Fixed per-record header-and-trailer cost in bytes: i32 block count,
/// i32 storage id, XOR checksum byte.
pub const RECORD_OVERHEAD: usize = 9;

/// Lower bound of the per-storage free-position list capacity.
/// The actual bound is `max(FREE_LIST_MIN, FREE_LIST_PAGE_FACTOR * blocks_per_page)`.
pub const FREE_LIST_MIN: usize = 1024;

/// Pages worth of blocks the per-storage free-position list may hold.
pub const FREE_LIST_PAGE_FACTOR: usize = 4;

/// Default capacity (in records) of the write-back record cache.
pub const DEFAULT_CACHE_CAPACITY: usize = 512;

/// Byte length of the banner region at the start of the file.
pub const FILE_HEADER_LENGTH: usize = 48;

/// One banner line; written three times to fill the 48-byte header region.
pub const FILE_BANNER: &[u8; 16] = b"-- H2 0.5/B -- \n";

/// Page id of the file header page.
pub const HEADER_PAGE: u32 = 0;

/// Page id reserved for the embedding database's system table root.
pub const SYSTEM_ROOT_PAGE: u32 = 1;

/// Page id of the first free-page bitmap page.
pub const FREE_LIST_ROOT_PAGE: u32 = 2;

/// Page id of the first undo-log page.
pub const LOG_ROOT_PAGE: u32 = 3;

/// First page id the allocator may hand out.
pub const FIRST_ALLOCATABLE_PAGE: u32 = 4;

/// Type byte of a free-page bitmap page. Data pages always start with 0x00
/// (the high byte of a big-endian block count), so metadata type bytes live
/// in the 0xF0 range.
pub const PAGE_TYPE_FREE_LIST: u8 = 0xF2;

/// Type byte of an undo-log page.
pub const PAGE_TYPE_LOG: u8 = 0xF1;

/// Byte length of the metadata page header: type byte + i32 next page id.
pub const META_PAGE_HEADER: usize = 5;

const _: () = assert!(BLOCK_SIZE.is_power_of_two(), "BLOCK_SIZE must be a power of two");

const _: () = assert!(
    PAGE_SIZE_MIN % BLOCK_SIZE == 0,
    "every legal page size must be a whole number of blocks"
);

const _: () = assert!(
    PAGE_SIZE_MIN <= PAGE_SIZE_DEFAULT && PAGE_SIZE_DEFAULT <= PAGE_SIZE_MAX,
    "default page size out of range"
);

const _: () = assert!(
    FILE_HEADER_LENGTH == FILE_BANNER.len() * 3,
    "banner region is three banner lines"
);

const _: () = assert!(
    FIRST_ALLOCATABLE_PAGE == LOG_ROOT_PAGE + 1,
    "reserved pages must be contiguous from 0"
);

/// Number of blocks in one page of the given size.
#[inline]
pub const fn blocks_per_page(page_size: usize) -> usize {
    page_size / BLOCK_SIZE
}

/// Capacity bound of the per-storage free-position list for the given
/// page size.
#[inline]
pub const fn free_list_capacity(page_size: usize) -> usize {
    let per_page = FREE_LIST_PAGE_FACTOR * blocks_per_page(page_size);
    if per_page > FREE_LIST_MIN {
        per_page
    } else {
        FREE_LIST_MIN
    }
}

/// Checks that a page size is legal: a power of two within bounds.
#[inline]
pub fn page_size_valid(size: usize) -> bool {
    size.is_power_of_two() && (PAGE_SIZE_MIN..=PAGE_SIZE_MAX).contains(&size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_page_size_is_valid() {
        assert!(page_size_valid(PAGE_SIZE_DEFAULT));
    }

    #[test]
    fn page_size_bounds_are_enforced() {
        assert!(!page_size_valid(256));
        assert!(!page_size_valid(65536));
        assert!(!page_size_valid(1000));
        assert!(page_size_valid(512));
        assert!(page_size_valid(32768));
    }

    #[test]
    fn blocks_per_page_for_default_geometry() {
        assert_eq!(blocks_per_page(PAGE_SIZE_DEFAULT), 8);
        assert_eq!(blocks_per_page(PAGE_SIZE_MIN), 4);
        assert_eq!(blocks_per_page(PAGE_SIZE_MAX), 256);
    }

    #[test]
    fn free_list_capacity_floor() {
        assert_eq!(free_list_capacity(1024), 1024);
        assert_eq!(free_list_capacity(32768), 1024);
    }
}
