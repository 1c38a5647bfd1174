use criterion::{black_box, criterion_group, criterion_main, Criterion};
use hmmkit::{CovarianceKind, GaussianHmm, PruneConfig, TrainConfig};
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::SeedableRng;

fn model(n_states: usize, dim: usize, kind: CovarianceKind) -> GaussianHmm {
    let mut transmat = Array2::from_elem((n_states, n_states), 0.1 / (n_states - 1) as f64);
    transmat.diag_mut().fill(0.9);
    let means = Array2::from_shape_fn((n_states, dim), |(s, k)| (s * 4 + k) as f64);
    GaussianHmm::gaussian(n_states, dim, kind)
        .unwrap()
        .with_startprob(&Array1::from_elem(n_states, 1.0 / n_states as f64))
        .unwrap()
        .with_transmat(&transmat)
        .unwrap()
        .with_means(means)
        .unwrap()
}

fn bench_evaluate(c: &mut Criterion) {
    let mut group = c.benchmark_group("evaluate");

    for kind in [CovarianceKind::Diagonal, CovarianceKind::Full] {
        let m = model(8, 4, kind);
        let (obs, _) = m.sample(2_000, &mut StdRng::seed_from_u64(42)).unwrap();
        group.bench_function(format!("8_states_2k_frames_{kind}"), |b| {
            b.iter(|| m.evaluate(black_box(&obs)))
        });
    }

    let m = model(32, 4, CovarianceKind::Diagonal);
    let (obs, _) = m.sample(2_000, &mut StdRng::seed_from_u64(42)).unwrap();
    let pruned = PruneConfig {
        max_rank: Some(4),
        beam_log_prob: -20.0,
        ..Default::default()
    };
    group.bench_function("32_states_unpruned", |b| {
        b.iter(|| m.evaluate(black_box(&obs)))
    });
    group.bench_function("32_states_rank4_beam20", |b| {
        b.iter(|| m.evaluate_with(black_box(&obs), &pruned))
    });

    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");

    let m = model(8, 4, CovarianceKind::Diagonal);
    let (obs, _) = m.sample(2_000, &mut StdRng::seed_from_u64(7)).unwrap();
    group.bench_function("8_states_2k_frames", |b| {
        b.iter(|| m.decode(black_box(&obs)))
    });

    group.finish();
}

fn bench_train(c: &mut Criterion) {
    let mut group = c.benchmark_group("train");
    group.sample_size(10);

    let truth = model(4, 2, CovarianceKind::Full);
    let mut rng = StdRng::seed_from_u64(11);
    let sequences: Vec<Array2<f64>> = (0..8)
        .map(|_| truth.sample(500, &mut rng).unwrap().0)
        .collect();
    let config = TrainConfig {
        n_iter: 1,
        min_covar: 1e-3,
        ..Default::default()
    };

    group.bench_function("one_em_iteration_8x500", |b| {
        b.iter(|| {
            let mut m = GaussianHmm::gaussian(4, 2, CovarianceKind::Full).unwrap();
            m.train(black_box(sequences.as_slice()), &config)
        })
    });

    group.finish();
}

criterion_group!(benches, bench_evaluate, bench_decode, bench_train);
criterion_main!(benches);
