//! # Internal Macros
//!
//! ## be_accessors!
//!
//! Generates getter and setter methods for zerocopy struct fields that use
//! big-endian wrapper types (U32, I32). The on-disk header of this store is
//! big-endian, so fields are declared with `zerocopy::big_endian` wrappers
//! and accessed through plain native-endian integers.
//!
//! ### Usage
//!
//! ```ignore
//! use zerocopy::big_endian::I32;
//!
//! #[repr(C)]
//! struct Header {
//!     page_size: I32,
//!     system_root: I32,
//! }
//!
//! impl Header {
//!     be_accessors! {
//!         page_size: i32,
//!         system_root: i32,
//!     }
//! }
//!
//! // Generates:
//! // pub fn page_size(&self) -> i32 { self.page_size.get() }
//! // pub fn set_page_size(&mut self, val: i32) { self.page_size = I32::new(val); }
//! // ...
//! ```

/// Generates getter and setter methods for zerocopy big-endian fields.
#[macro_export]
macro_rules! be_accessors {
    (@impl $field:ident, u32) => {
        ::paste::paste! {
            #[inline]
            pub fn $field(&self) -> u32 {
                self.$field.get()
            }

            #[inline]
            pub fn [<set_ $field>](&mut self, val: u32) {
                self.$field = ::zerocopy::big_endian::U32::new(val);
            }
        }
    };
    (@impl $field:ident, i32) => {
        ::paste::paste! {
            #[inline]
            pub fn $field(&self) -> i32 {
                self.$field.get()
            }

            #[inline]
            pub fn [<set_ $field>](&mut self, val: i32) {
                self.$field = ::zerocopy::big_endian::I32::new(val);
            }
        }
    };
    ($($field:ident: $ty:tt),+ $(,)?) => {
        $( $crate::be_accessors!(@impl $field, $ty); )+
    };
}
