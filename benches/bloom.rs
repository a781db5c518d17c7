use criterion::{criterion_group, criterion_main, Criterion};
use csc_tree::bloom::BloomFilter;
use rand::{Rng, SeedableRng};

fn rng() -> rand::rngs::StdRng {
    rand::rngs::StdRng::seed_from_u64(7)
}

fn seeds(r: &mut impl Rng, k: usize) -> Vec<u64> {
    (0..k).map(|_| r.random()).collect()
}

fn filter_construction(c: &mut Criterion) {
    c.bench_function("bloom filter add key", |b| {
        let mut r = rng();
        let mut filter = BloomFilter::with_fp_rate(500_000, 0.01, &seeds(&mut r, 4));
        let mut i = 0u64;

        b.iter(|| {
            filter.add(&i.to_be_bytes());
            i += 1;
        });
    });
}

fn filter_contains(c: &mut Criterion) {
    let mut r = rng();

    let keys = (0..100_000u64).map(u64::to_be_bytes).collect::<Vec<_>>();

    for fpr in [0.01, 0.001, 0.0001, 0.00001] {
        let mut filter = BloomFilter::with_fp_rate(100_000, fpr, &seeds(&mut r, 4));

        for key in &keys {
            filter.add(key);
        }

        c.bench_function(
            &format!("bloom filter contains key, true positive ({}%)", fpr * 100.0),
            |b| {
                let mut idx = 0usize;
                b.iter(|| {
                    let key = &keys[idx % keys.len()];
                    idx += 1;
                    assert!(filter.contains(key));
                });
            },
        );
    }
}

criterion_group!(benches, filter_construction, filter_contains);
criterion_main!(benches);
