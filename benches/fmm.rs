use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use group_fmm::fmm::kernel::CountKernel;
use group_fmm::tree::helpers::points_fixture;
use group_fmm::{Domain, FmmEngine, GroupedTree, SequentialFmm, TaskParallelFmm};

fn traversal(c: &mut Criterion) {
    let n_points = 100_000;
    let points = points_fixture::<f64>(n_points, Some(0));
    let charges = vec![1.0; n_points];
    let domain = Domain::new([0.5, 0.5, 0.5], 1.0);
    let height = 6;
    let group_size = 128;

    let mut group = c.benchmark_group("Grouped traversal");
    group.sample_size(10);

    group.bench_function(format!("sequential, N={n_points}"), |b| {
        b.iter_batched(
            || GroupedTree::new(&points, &charges, height, domain, group_size),
            |mut tree| {
                SequentialFmm::new(&mut tree, CountKernel::new())
                    .execute()
                    .unwrap()
            },
            BatchSize::LargeInput,
        )
    });

    group.bench_function(format!("task-parallel, N={n_points}"), |b| {
        b.iter_batched(
            || GroupedTree::new(&points, &charges, height, domain, group_size),
            |mut tree| {
                TaskParallelFmm::new(&mut tree, CountKernel::new())
                    .execute()
                    .unwrap()
            },
            BatchSize::LargeInput,
        )
    });

    group.finish();
}

fn tree_build(c: &mut Criterion) {
    let n_points = 100_000;
    let points = points_fixture::<f64>(n_points, Some(1));
    let charges = vec![1.0; n_points];
    let domain = Domain::new([0.5, 0.5, 0.5], 1.0);

    c.bench_function(format!("tree build, N={n_points}"), |b| {
        b.iter(|| {
            GroupedTree::<f64, u64, u64>::new(&points, &charges, 6, domain, 128)
        })
    });
}

criterion_group!(benches, traversal, tree_build);
criterion_main!(benches);
