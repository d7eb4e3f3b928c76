use std::hint::black_box;

use criterion::{Criterion, criterion_group, criterion_main};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use shoal_core::range::{Range, RangeSet};
use shoal_core::selection::{RandomStrategy, SelectionStrategy};

const FILE_SIZE: u64 = 64 * 1024 * 1024;
const BLOCK: u64 = 128 * 1024;

/// Every other block of the file, the worst case for coalescing.
fn checkerboard() -> RangeSet {
    let mut set = RangeSet::new();
    let mut low = 0;
    while low < FILE_SIZE {
        if let Ok(range) = Range::from_len(low, BLOCK) {
            set.add(range);
        }
        low += 2 * BLOCK;
    }
    set
}

fn bench_range_set_churn(c: &mut Criterion) {
    c.bench_function("range_set_add_delete_checkerboard", |b| {
        b.iter(|| {
            let mut set = checkerboard();
            let mut low = BLOCK;
            while low < FILE_SIZE {
                if let Ok(range) = Range::from_len(low, BLOCK) {
                    set.add(range);
                }
                low += 4 * BLOCK;
            }
            if let Ok(middle) = Range::new(FILE_SIZE / 4, FILE_SIZE / 2) {
                set.delete(middle);
            }
            black_box(set.count())
        });
    });

    let set = checkerboard();
    c.bench_function("range_set_invert_checkerboard", |b| {
        b.iter(|| black_box(set.invert(FILE_SIZE).size()));
    });
}

fn bench_random_selection(c: &mut Criterion) {
    let needed = RangeSet::full(FILE_SIZE);
    let fragmented = checkerboard();

    c.bench_function("random_pick_whole_file", |b| {
        let mut strategy = RandomStrategy::new(Box::new(ChaCha8Rng::seed_from_u64(7)), FILE_SIZE);
        b.iter(|| black_box(strategy.pick_assignment(&needed, &needed, BLOCK)));
    });

    c.bench_function("random_pick_fragmented", |b| {
        let mut strategy = RandomStrategy::new(Box::new(ChaCha8Rng::seed_from_u64(7)), FILE_SIZE);
        b.iter(|| black_box(strategy.pick_assignment(&fragmented, &fragmented, BLOCK)));
    });
}

criterion_group!(benches, bench_range_set_churn, bench_random_selection);
criterion_main!(benches);
