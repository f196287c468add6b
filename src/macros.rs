//! # Internal Macros
//!
//! ## zerocopy_accessors!
//!
//! Generates getter and setter methods for zerocopy struct fields that use
//! little-endian wrapper types (U16, U32, U64). Every on-disk header of the
//! record store (page header, state page, position map entry point) is built
//! from these wrappers so it can be read from unaligned page buffers.
//!
//! ```ignore
//! use zerocopy::little_endian::{U32, U64};
//!
//! #[repr(C)]
//! struct StateHeader {
//!     record_count: U64,
//!     file_size: U32,
//! }
//!
//! impl StateHeader {
//!     zerocopy_accessors! {
//!         record_count: u64,
//!         file_size: u32,
//!     }
//! }
//!
//! // Generates:
//! // pub fn record_count(&self) -> u64 { self.record_count.get() }
//! // pub fn set_record_count(&mut self, val: u64) { self.record_count = U64::new(val); }
//! // pub fn file_size(&self) -> u32 { self.file_size.get() }
//! // pub fn set_file_size(&mut self, val: u32) { self.file_size = U32::new(val); }
//! ```

/// Generates getter and setter methods for zerocopy little-endian fields.
#[macro_export]
macro_rules! zerocopy_accessors {
    (@impl $field:ident, u16) => {
        ::paste::paste! {
            #[inline]
            pub fn $field(&self) -> u16 {
                self.$field.get()
            }

            #[inline]
            pub fn [<set_ $field>](&mut self, val: u16) {
                self.$field = ::zerocopy::little_endian::U16::new(val);
            }
        }
    };
    (@impl $field:ident, u32) => {
        ::paste::paste! {
            #[inline]
            pub fn $field(&self) -> u32 {
                self.$field.get()
            }

            #[inline]
            pub fn [<set_ $field>](&mut self, val: u32) {
                self.$field = ::zerocopy::little_endian::U32::new(val);
            }
        }
    };
    (@impl $field:ident, u64) => {
        ::paste::paste! {
            #[inline]
            pub fn $field(&self) -> u64 {
                self.$field.get()
            }

            #[inline]
            pub fn [<set_ $field>](&mut self, val: u64) {
                self.$field = ::zerocopy::little_endian::U64::new(val);
            }
        }
    };
    ($($field:ident : $ty:tt),* $(,)?) => {
        $(
            $crate::zerocopy_accessors!(@impl $field, $ty);
        )*
    };
}
