//! # Utility Structures
//!
//! Small allocation-tracking primitives shared across the store:
//!
//! - [`BitField`]: dense growable bit set with an aligned 64-bit window
//!   accessor for fast skip during sequential scans
//! - [`IntArray`]: growable `u32` array with value-ordered insert/remove and
//!   lower-bound lookup

mod bit_field;
mod int_array;

pub use bit_field::BitField;
pub use int_array::IntArray;
