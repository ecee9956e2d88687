//! Stable radix sort of `u32` keys and payloads on a compute backend.
//!
//! The sort is a least-significant-digit radix sort built from device-side histograms and
//! prefix sums, see [`RadixSort`]. Every kernel has a WGSL implementation and a host twin, so
//! the same code runs on a `wgpu` device and on the CPU.

#![warn(missing_docs)]

pub mod radix_sort;

pub use radix_sort::{
    padded_len, PassState, RadixSort, RadixSortWorkspace, BITS_PER_PASS, ITEMS_PER_GROUP,
    NUM_BINS, NUM_PASSES, SENTINEL_KEY,
};
