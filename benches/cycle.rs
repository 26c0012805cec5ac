//! Benchmarks for the decision cycle.

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};

use akh_kernel::cycle::RunType;
use akh_kernel::demo::{self, Demo};
use akh_kernel::kernel::{CycleMode, Kernel, KernelConfig};

fn counter_kernel(mode: CycleMode) -> Kernel {
    let mut kernel = Kernel::new(KernelConfig {
        cycle_mode: mode,
        seed: Some(0),
        ..KernelConfig::default()
    })
    .unwrap();
    demo::load_counter(&mut kernel, None).unwrap();
    kernel
}

fn bench_counter_decisions(c: &mut Criterion) {
    c.bench_function("counter_50_decisions_operand2", |bench| {
        bench.iter_batched(
            || counter_kernel(CycleMode::Operand2),
            |mut kernel| black_box(kernel.run(50, RunType::Decisions).unwrap()),
            BatchSize::SmallInput,
        )
    });

    c.bench_function("counter_50_decisions_legacy", |bench| {
        bench.iter_batched(
            || counter_kernel(CycleMode::Legacy),
            |mut kernel| black_box(kernel.run(50, RunType::Decisions).unwrap()),
            BatchSize::SmallInput,
        )
    });
}

fn bench_tie_impasse(c: &mut Criterion) {
    c.bench_function("tie_impasse_resolution", |bench| {
        bench.iter_batched(
            || {
                let mut kernel = Kernel::new(KernelConfig::default()).unwrap();
                Demo::Tie.load(&mut kernel).unwrap();
                kernel
            },
            |mut kernel| black_box(kernel.run(2, RunType::Decisions).unwrap()),
            BatchSize::SmallInput,
        )
    });
}

fn bench_reinitialize(c: &mut Criterion) {
    let mut kernel = counter_kernel(CycleMode::Operand2);
    c.bench_function("run_10_and_reinitialize", |bench| {
        bench.iter(|| {
            kernel.run(10, RunType::Decisions).unwrap();
            kernel.reinitialize().unwrap();
        })
    });
}

criterion_group!(
    benches,
    bench_counter_decisions,
    bench_tie_impasse,
    bench_reinitialize
);
criterion_main!(benches);
