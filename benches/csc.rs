use criterion::{criterion_group, criterion_main, Criterion};
use csc_tree::csc::Csc;
use rand::{Rng, SeedableRng};

fn rng() -> rand::rngs::StdRng {
    rand::rngs::StdRng::seed_from_u64(11)
}

fn seeds(r: &mut impl Rng) -> (u64, u64) {
    (r.random(), r.random())
}

fn csc_construction(c: &mut Criterion) {
    c.bench_function("csc add (x, file_id)", |b| {
        let mut r = rng();
        let s = seeds(&mut r);
        let mut csc = Csc::new(12, 16, 4, 30, 8, s, &mut r);
        let mut i = 0u32;

        b.iter(|| {
            while !csc.add(&i.to_be_bytes(), i % 8) {
                csc.double();
            }
            i = i.wrapping_add(1);
        });
    });
}

fn csc_get(c: &mut Criterion) {
    let mut r = rng();
    let s = seeds(&mut r);
    let mut csc = Csc::new(12, 16, 4, 30, 8, s, &mut r);

    let keys = (0..2_000u32).collect::<Vec<_>>();
    for &x in &keys {
        let bytes = x.to_be_bytes();
        while !csc.add(&bytes, x % 8) {
            csc.double();
        }
    }

    c.bench_function("csc get, true positive", |b| {
        let mut idx = 0usize;
        b.iter(|| {
            let x = keys[idx % keys.len()];
            idx += 1;
            assert!(!csc.get(&x.to_be_bytes()).is_empty());
        });
    });

    c.bench_function("csc get, absent key", |b| {
        let mut i = 1_000_000u32;
        b.iter(|| {
            i += 1;
            let _ = csc.get(&i.to_be_bytes());
        });
    });
}

criterion_group!(benches, csc_construction, csc_get);
criterion_main!(benches);
