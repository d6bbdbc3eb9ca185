//! Argument marshaling: placing remote-memory argument regions into a
//! worker's bounded scratch buffers and describing the transfers that move
//! them.
//!
//! Scratch placement mirrors the transfer granularity of the hardware this
//! models: every staged region occupies a cache-line-aligned window and keeps
//! the remote address's misalignment, so the bulk of a transfer runs at the
//! largest burst size and only the edges need fix-up accesses.

use thiserror::Error;

use crate::dma::CopyOp;

/// Alignment of staged windows in scratch memory.
pub const CACHE_LINE: usize = 128;

/// Minimum burst size for bulk PUT transfers. Transfers shorter than this
/// are split by bisection into power-of-two accesses.
pub const BULK_ALIGN: usize = 16;

/// Signals that a job's aggregate remote-argument footprint exceeds the
/// scratch budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("aggregate remote-argument size exceeds the scratch budget")]
pub struct BudgetExceeded;

/// A bump allocator over one worker-owned scratch buffer.
pub struct ScratchArena {
    base: usize,
    cap: usize,
    used: usize,
}

impl ScratchArena {
    /// `base` must point at `cap` bytes owned by the caller and aligned to
    /// [`CACHE_LINE`].
    pub fn new(base: usize, cap: usize) -> Self {
        debug_assert_eq!(base % CACHE_LINE, 0);
        ScratchArena { base, cap, used: 0 }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.cap
    }

    #[inline]
    pub fn reset(&mut self) {
        self.used = 0;
    }

    /// Claims a window of `len` bytes starting at a cache-line boundary.
    fn claim(&mut self, len: usize) -> Result<usize, BudgetExceeded> {
        let start = self.used;
        let end = start.checked_add(len).ok_or(BudgetExceeded)?;
        if end > self.cap {
            return Err(BudgetExceeded);
        }
        self.used = align_up(end, CACHE_LINE).min(self.cap);
        Ok(self.base + start)
    }

    /// Stages an inbound (GET) argument: reserves the aligned window covering
    /// `[ea_addr, ea_addr + size)` and appends the copy that pulls exactly
    /// the requested bytes into it. Returns the local address of the first
    /// requested byte.
    pub fn stage_get(
        &mut self,
        sgl: &mut Vec<CopyOp>,
        ea_addr: usize,
        size: usize,
    ) -> Result<usize, BudgetExceeded> {
        let misalign = ea_addr % CACHE_LINE;
        let window = align_up(misalign + size, CACHE_LINE).max(CACHE_LINE);
        let local_window = self.claim(window)?;
        let local = local_window + misalign;
        if size > 0 {
            sgl.push(CopyOp {
                src: ea_addr,
                dst: local,
                len: size,
            });
        }
        Ok(local)
    }

    /// Stages an outbound (PUT) argument: reserves an aligned window whose
    /// misalignment matches `ea_addr` so the eventual bulk transfer is
    /// aligned on both sides. No copy is issued here; the procedure writes
    /// the region and [`put_ops`] describes the transfer out.
    pub fn stage_put(&mut self, ea_addr: usize, size: usize) -> Result<usize, BudgetExceeded> {
        let misalign = ea_addr % CACHE_LINE;
        let window = align_up(misalign + size, CACHE_LINE).max(CACHE_LINE);
        let local_window = self.claim(window)?;
        Ok(local_window + misalign)
    }
}

#[inline]
pub const fn align_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}

#[inline]
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Describes the transfers that push a finished PUT region back to host
/// memory, writing only bytes inside `[ea_addr, ea_addr + len)`.
///
/// Regions of at least [`BULK_ALIGN`] bytes become an unaligned prefix fixed
/// up with 1/2/4/8-byte accesses, one maximal aligned middle, and a symmetric
/// suffix fix-up. Shorter regions are bisected into the minimal power-of-two
/// accesses directly.
pub fn put_ops(sgl: &mut Vec<CopyOp>, local: usize, ea_addr: usize, len: usize) {
    debug_assert_eq!(local % BULK_ALIGN, ea_addr % BULK_ALIGN);
    if len < BULK_ALIGN {
        put_fixup(sgl, local, ea_addr, len);
        return;
    }

    let prefix = align_up(ea_addr, BULK_ALIGN) - ea_addr;
    let middle = align_down(len - prefix, BULK_ALIGN);
    let suffix = len - prefix - middle;

    put_fixup(sgl, local, ea_addr, prefix);
    if middle > 0 {
        sgl.push(CopyOp {
            src: local + prefix,
            dst: ea_addr + prefix,
            len: middle,
        });
    }
    put_fixup(sgl, local + prefix + middle, ea_addr + prefix + middle, suffix);
}

/// Splits a sub-burst range into power-of-two accesses no larger than 8
/// bytes, each naturally aligned on the host side.
fn put_fixup(sgl: &mut Vec<CopyOp>, mut local: usize, mut ea_addr: usize, mut len: usize) {
    while len > 0 {
        let mut access = 8usize.min(prev_power_of_two(len));
        while ea_addr % access != 0 {
            access >>= 1;
        }
        sgl.push(CopyOp {
            src: local,
            dst: ea_addr,
            len: access,
        });
        local += access;
        ea_addr += access;
        len -= access;
    }
}

#[inline]
fn prev_power_of_two(value: usize) -> usize {
    debug_assert!(value > 0);
    1 << (usize::BITS - 1 - value.leading_zeros())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn total(sgl: &[CopyOp]) -> usize {
        sgl.iter().map(|op| op.len).sum()
    }

    #[test]
    fn get_window_keeps_misalignment() {
        let mut arena = ScratchArena::new(0x10000, 4096);
        let mut sgl = Vec::new();
        let local = arena.stage_get(&mut sgl, 0x2003, 64).unwrap();
        assert_eq!(local % CACHE_LINE, 0x2003 % CACHE_LINE);
        assert_eq!(sgl.len(), 1);
        assert_eq!(sgl[0].len, 64);
    }

    #[test]
    fn get_budget_boundary() {
        let mut arena = ScratchArena::new(0x10000, 256);
        let mut sgl = Vec::new();
        assert!(arena.stage_get(&mut sgl, 0x2000, 128).is_ok());
        assert!(arena.stage_get(&mut sgl, 0x3000, 128).is_ok());
        assert_eq!(
            arena.stage_get(&mut sgl, 0x4000, 1),
            Err(BudgetExceeded)
        );
    }

    #[test]
    fn put_ops_cover_exactly_the_window() {
        for offset in 0..64usize {
            for len in 0..200usize {
                let mut sgl = Vec::new();
                put_ops(&mut sgl, 0x8000 + offset, 0x100 + offset, len);
                assert_eq!(total(&sgl), len, "offset={offset} len={len}");
                // ops are contiguous and in order
                let mut at = 0x100 + offset;
                for op in &sgl {
                    assert_eq!(op.dst, at);
                    at += op.len;
                }
            }
        }
    }

    #[test]
    fn small_put_uses_minimal_accesses() {
        let mut sgl = Vec::new();
        // 8 bytes at an 8-aligned address is a single access
        put_ops(&mut sgl, 0x8008, 0x208, 8);
        assert_eq!(sgl.len(), 1);
        assert_eq!(sgl[0].len, 8);

        // 15 bytes at odd alignment decomposes into 1/2/4/8-byte pieces
        sgl.clear();
        put_ops(&mut sgl, 0x8001, 0x201, 15);
        assert_eq!(total(&sgl), 15);
        assert!(sgl.iter().all(|op| op.len.is_power_of_two() && op.len <= 8));
        assert!(sgl.iter().all(|op| op.dst % op.len == 0));
    }

    #[test]
    fn bulk_put_has_aligned_middle() {
        let mut sgl = Vec::new();
        put_ops(&mut sgl, 0x8003, 0x203, 1000);
        let middle = sgl.iter().max_by_key(|op| op.len).unwrap();
        assert_eq!(middle.dst % BULK_ALIGN, 0);
        assert_eq!(middle.len % BULK_ALIGN, 0);
        assert_eq!(total(&sgl), 1000);
    }
}
