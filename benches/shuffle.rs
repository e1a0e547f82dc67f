use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::rngs::StdRng;
use rand::SeedableRng;

use elgamal_shuffle_lib::{
    encrypt, keygen, random_permutation, random_point, shuffle, verify, Ciphertext,
};

fn bench_shuffle(c: &mut Criterion) {
    let mut group = c.benchmark_group("verifiable_shuffle");
    for &n in &[8usize, 32, 128] {
        let mut rng = StdRng::seed_from_u64(42);
        let (_, pk) = keygen(&mut rng);
        let inputs: Vec<Ciphertext> = (0..n)
            .map(|_| encrypt(&pk, &random_point(&mut rng), &mut rng))
            .collect();
        let pi = random_permutation(n, &mut rng);

        group.bench_with_input(BenchmarkId::new("prove", n), &n, |b, _| {
            b.iter(|| {
                let mut rng = StdRng::seed_from_u64(7);
                shuffle(black_box(&pi), &pk, black_box(&inputs), &mut rng).unwrap()
            })
        });

        let mut rng = StdRng::seed_from_u64(7);
        let (outputs, proof) = shuffle(&pi, &pk, &inputs, &mut rng).unwrap();
        group.bench_with_input(BenchmarkId::new("verify", n), &n, |b, _| {
            b.iter(|| verify(&pk, black_box(&inputs), black_box(&outputs), &proof).unwrap())
        });
    }
    group.finish();
}

criterion_group!(benches, bench_shuffle);
criterion_main!(benches);
