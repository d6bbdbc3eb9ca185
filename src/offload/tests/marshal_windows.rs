//! Byte-exactness of staged GET windows and PUT fix-up transfers over a full
//! (offset, length) grid.

use rand::prelude::*;
use rand::rngs::StdRng;

use offload::dma::CopyOp;
use offload::marshal::{put_ops, ScratchArena, CACHE_LINE};

const SEED: u64 = 999;
const GRID: usize = 128;

/// A 128-aligned byte buffer for use as a scratch stand-in.
struct Aligned {
    storage: Vec<u8>,
    base: usize,
}

impl Aligned {
    fn new(len: usize, fill: u8) -> Self {
        let mut storage = vec![fill; len + CACHE_LINE];
        let base = (storage.as_mut_ptr() as usize + CACHE_LINE - 1) & !(CACHE_LINE - 1);
        Aligned { storage, base }
    }

    fn addr(&self) -> usize {
        self.base
    }

    fn bytes(&self, len: usize) -> &[u8] {
        let off = self.base - self.storage.as_ptr() as usize;
        &self.storage[off..off + len]
    }
}

fn apply(sgl: &[CopyOp]) {
    for op in sgl {
        // SAFETY: all test addresses point into live, disjoint buffers.
        unsafe { op.apply() };
    }
}

#[test]
fn get_grid_transfers_exact_bytes() {
    let mut rng = StdRng::seed_from_u64(SEED);
    let mut src = vec![0u8; 512];
    rng.fill(&mut src[..]);

    const ARENA: usize = 2048;
    let local = Aligned::new(ARENA, 0xee);
    let mut sgl = Vec::new();

    for offset in 0..=GRID {
        for len in 0..=GRID {
            // fresh arena over pre-poisoned memory
            unsafe {
                std::ptr::write_bytes(local.addr() as *mut u8, 0xee, ARENA);
            }
            let mut arena = ScratchArena::new(local.addr(), ARENA);
            sgl.clear();

            let ea = src.as_ptr() as usize + offset;
            let staged = arena.stage_get(&mut sgl, ea, len).unwrap();
            apply(&sgl);

            let got = unsafe { std::slice::from_raw_parts(staged as *const u8, len) };
            assert_eq!(got, &src[offset..offset + len], "offset={offset} len={len}");

            // nothing outside the requested bytes was written
            let arena_bytes = local.bytes(ARENA);
            let start = staged - local.addr();
            for (i, &b) in arena_bytes.iter().enumerate() {
                if i < start || i >= start + len {
                    assert_eq!(b, 0xee, "stray write at {i} (offset={offset} len={len})");
                }
            }
        }
    }
}

#[test]
fn put_grid_leaves_outside_bytes_untouched() {
    let mut rng = StdRng::seed_from_u64(SEED);
    let mut pristine = vec![0u8; 512];
    rng.fill(&mut pristine[..]);

    let local = Aligned::new(512, 0);
    let mut sgl = Vec::new();

    for offset in 0..=GRID {
        for len in 0..=GRID {
            let mut dst = pristine.clone();
            let ea = dst.as_mut_ptr() as usize + offset;

            // source region congruent with the destination's misalignment
            let staged = local.addr() + ea % CACHE_LINE;
            let payload: Vec<u8> = (0..len).map(|i| (i as u8) ^ 0xa5).collect();
            unsafe {
                std::ptr::copy_nonoverlapping(payload.as_ptr(), staged as *mut u8, len);
            }

            sgl.clear();
            put_ops(&mut sgl, staged, ea, len);
            apply(&sgl);

            assert_eq!(&dst[offset..offset + len], &payload[..], "offset={offset} len={len}");
            assert_eq!(
                &dst[..offset],
                &pristine[..offset],
                "bytes before the window changed (offset={offset} len={len})"
            );
            assert_eq!(
                &dst[offset + len..],
                &pristine[offset + len..],
                "bytes after the window changed (offset={offset} len={len})"
            );
        }
    }
}
