#![forbid(unsafe_code)]
//! Benchmark: extent search latency by tree depth.
//!
//! Each tree is built by appending one block at a time from an allocator
//! that leaves a gap after every run, so every logical block gets its own
//! leaf extent.
//!
//! Scenarios:
//! 1. Depth 0: 9 extents in the inode root
//! 2. Depth 1: 400 extents in one leaf block
//! 3. Depth 2: 4000 extents across 10 leaf blocks
//! 4. Append cost of building the depth-1 tree

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use std::hint::black_box;
use vfs_alloc::{AllocHint, BlockAlloc};
use vfs_block::{ByteBlockDevice, MemByteDevice, mem_block_device};
use vfs_error::{Result, VfsError};
use vfs_extent::{BlockAllocator, ExtentRoot, allocate_new_block, init_empty, search};
use vfs_types::{BLOCK_SIZE, BlockNumber, EXTENT_ROOT_BYTES};

const DEVICE_BLOCKS: u64 = 16_384;

struct GapAllocator {
    next: u64,
}

impl BlockAllocator for GapAllocator {
    fn alloc_blocks(&mut self, count: u32, _hint: &AllocHint) -> Result<BlockAlloc> {
        let start = self.next;
        if start + u64::from(count) > DEVICE_BLOCKS {
            return Err(VfsError::NoSpace);
        }
        self.next = start + u64::from(count) + 1;
        Ok(BlockAlloc {
            start: BlockNumber(start),
            count,
        })
    }

    fn free_blocks(&mut self, _start: BlockNumber, _count: u32) -> Result<()> {
        Ok(())
    }
}

fn build_tree(extents: u32) -> (ByteBlockDevice<MemByteDevice>, ExtentRoot) {
    let dev = mem_block_device(BLOCK_SIZE, DEVICE_BLOCKS).expect("device");
    let mut root = [0_u8; EXTENT_ROOT_BYTES];
    init_empty(&mut root).expect("init");
    let mut alloc = GapAllocator { next: 2 };
    for logical in 0..extents {
        allocate_new_block(&dev, &mut root, logical, &AllocHint::default(), &mut alloc)
            .expect("allocate");
    }
    (dev, root)
}

fn bench_search(c: &mut Criterion) {
    let mut group = c.benchmark_group("extent_search");
    for (depth, extents) in [(0_u16, 9_u32), (1, 400), (2, 4000)] {
        let (dev, root) = build_tree(extents);
        group.bench_with_input(BenchmarkId::new("depth", depth), &extents, |b, &extents| {
            let mut logical = 0_u32;
            b.iter(|| {
                logical = (logical + 7919) % extents;
                black_box(search(&dev, &root, black_box(logical)).expect("search"))
            });
        });
    }
    group.finish();
}

fn bench_append(c: &mut Criterion) {
    c.bench_function("extent_append_400", |b| {
        b.iter(|| black_box(build_tree(400)));
    });
}

criterion_group!(benches, bench_search, bench_append);
criterion_main!(benches);
