use criterion::{criterion_group, criterion_main, Criterion};
use sparsectr_kernels::{cpu_accumulate_unique, cpu_combine_forward, Combiner};
use std::hint::black_box;

fn benchmark_combine(c: &mut Criterion) {
    let mut group = c.benchmark_group("combine_forward");
    let vec_size = 64;
    let sizes = [1024, 8192, 65536];

    for &segments in &sizes {
        let hotness = 4;
        let rows = vec![1.0f32; 4096 * vec_size];
        let row_index: Vec<usize> = (0..segments * hotness).map(|i| (i * 31) % 4096).collect();
        let row_offset: Vec<usize> = (0..=segments).map(|s| s * hotness).collect();

        group.bench_function(format!("{}x{}", segments, hotness), |b| {
            b.iter(|| {
                cpu_combine_forward(
                    black_box(&rows),
                    black_box(&row_index),
                    black_box(&row_offset),
                    vec_size,
                    Combiner::Sum,
                )
                .unwrap()
            })
        });
    }
    group.finish();
}

fn benchmark_accumulate(c: &mut Criterion) {
    let mut group = c.benchmark_group("accumulate_unique");
    let vec_size = 64;
    let sizes = [4096, 32768];

    for &occurrences in &sizes {
        let num_unique = occurrences / 8;
        let grads = vec![0.5f32; occurrences * vec_size];
        let index: Vec<usize> = (0..occurrences).map(|i| (i * 7) % num_unique).collect();

        group.bench_function(format!("{}->{}", occurrences, num_unique), |b| {
            b.iter(|| {
                cpu_accumulate_unique(black_box(&grads), black_box(&index), num_unique, vec_size)
                    .unwrap()
            })
        });
    }
    group.finish();
}

criterion_group!(benches, benchmark_combine, benchmark_accumulate);
criterion_main!(benches);
