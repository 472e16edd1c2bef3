use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use evogrid_core::{EvoGridConfig, EvolutionEngine, GridPos, InstructionSet, MovementMode};
use std::time::Duration;

fn bench_engine_steps(c: &mut Criterion) {
    let mut group = c.benchmark_group("engine_step");
    let samples: usize = std::env::var("EVOGRID_BENCH_SAMPLES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(30);
    group.sample_size(samples);
    group.warm_up_time(Duration::from_secs(2));
    group.measurement_time(Duration::from_secs(8));

    let steps: usize = std::env::var("EVOGRID_BENCH_STEPS")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(64);

    for &population in &[256_usize, 1024, 4096] {
        for (label, mode) in [
            ("free", MovementMode::Free),
            ("collision", MovementMode::BoundedCollision),
        ] {
            group.bench_function(format!("{label}_pop{population}_steps{steps}"), |b| {
                b.iter_batched(
                    || {
                        let config = EvoGridConfig {
                            grid_dimension: 128,
                            population_size: population,
                            program_length: 16,
                            instruction_set: InstructionSet::Extended,
                            movement_mode: mode,
                            ticks_per_generation: 32,
                            spawn: GridPos::new(0, 0),
                            rng_seed: Some(0xBEEF),
                            history_capacity: 0,
                            ..EvoGridConfig::default()
                        };
                        EvolutionEngine::new(config).expect("engine")
                    },
                    |mut engine| {
                        for _ in 0..steps {
                            engine.step();
                        }
                        engine
                    },
                    BatchSize::LargeInput,
                );
            });
        }
    }
    group.finish();
}

criterion_group!(benches, bench_engine_steps);
criterion_main!(benches);
