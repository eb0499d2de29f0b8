//! Unaligned memcpy specializations for the transmit hot path.
//!
//! The implementation is picked at compile time from the enabled target
//! features; the dispatch collapses to a direct call once the constant
//! predicate folds. Kernels follow the DPDK scheme: small copies use a
//! pair of possibly-overlapping fixed-width block moves from the front
//! and the back, large copies align the destination and then stream
//! fixed-size blocks.

#![cfg_attr(test, allow(clippy::unwrap_used))]

#[cfg(all(target_arch = "x86_64", target_feature = "avx2", not(target_feature = "avx512f")))]
mod avx2;
#[cfg(all(target_arch = "x86_64", target_feature = "avx512f"))]
mod avx512;

#[cfg(all(target_arch = "x86_64", target_feature = "avx512f"))]
use avx512 as imp;

#[cfg(all(target_arch = "x86_64", target_feature = "avx2", not(target_feature = "avx512f")))]
use avx2 as imp;

#[cfg(not(all(
    target_arch = "x86_64",
    any(target_feature = "avx2", target_feature = "avx512f")
)))]
mod imp {
    pub const ALIGNMENT_MASK: usize = 0;

    #[inline]
    pub fn copy(dst: &mut [u8], src: &[u8]) {
        dst.copy_from_slice(src);
    }
}

/// Destination alignment mask of the selected implementation; zero when
/// the platform memcpy is in use.
pub const ALIGNMENT_MASK: usize = imp::ALIGNMENT_MASK;

/// Copies `src` into `dst`.
///
/// Both slices must have the same length. Slices never alias, so the
/// no-overlap requirement of the SIMD kernels holds by construction.
#[inline]
pub fn copy(dst: &mut [u8], src: &[u8]) {
    assert_eq!(dst.len(), src.len());
    imp::copy(dst, src)
}
