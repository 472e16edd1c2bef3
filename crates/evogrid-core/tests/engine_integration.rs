use evogrid_core::{
    EvoGridConfig, EvolutionEngine, FitnessNorm, GridPos, InstructionSet, MovementMode, Tick,
};
use std::collections::HashSet;

fn collision_config(seed: u64) -> EvoGridConfig {
    EvoGridConfig {
        grid_dimension: 16,
        population_size: 16,
        program_length: 8,
        instruction_set: InstructionSet::Extended,
        movement_mode: MovementMode::BoundedCollision,
        selection_fraction: 0.5,
        mutation_rate: 0.1,
        ticks_per_generation: 4,
        spawn: GridPos::new(0, 0),
        rng_seed: Some(seed),
        history_capacity: 64,
        ..EvoGridConfig::default()
    }
}

#[test]
fn collision_invariant_holds_across_generations() {
    let mut engine = EvolutionEngine::new(collision_config(0xBADC_0FFE)).expect("engine");

    for _ in 0..24 {
        engine.step();

        // No two live agents share a cell at any tick boundary,
        // including the boundaries where a generation reset fired.
        let mut seen = HashSet::new();
        for agent in engine.agents() {
            if agent.is_alive() {
                assert!(
                    seen.insert(agent.position()),
                    "two live agents share {:?}",
                    agent.position()
                );
            }
        }

        // The occupancy index and the agent positions agree.
        let occupancy = engine.occupancy().expect("occupancy");
        for (index, agent) in engine.agents().iter().enumerate() {
            if agent.is_alive() {
                assert_eq!(occupancy.occupant(agent.position()), Some(index as u32));
            }
        }
        let occupied: Vec<_> = occupancy.occupied_cells().collect();
        assert!(occupied.len() <= engine.agent_count());
    }
    assert_eq!(engine.generation(), 6);
}

#[test]
fn generation_cadence_and_history() {
    let mut engine = EvolutionEngine::new(collision_config(7)).expect("engine");
    for step in 1..=20 {
        let events = engine.step();
        assert_eq!(events.tick, Tick(step));
        assert_eq!(events.generation_rolled, step % 4 == 0);
    }
    assert_eq!(engine.generation(), 5);
    assert_eq!(engine.iterations(), 0);

    let generations: Vec<u64> = engine.history().map(|summary| summary.generation).collect();
    assert_eq!(generations, vec![1, 2, 3, 4, 5]);
    for summary in engine.history() {
        assert_eq!(summary.ticks, 4);
        assert!(summary.best_fitness <= 1.0);
        assert!(summary.total_fitness <= summary.best_fitness * 8.0 + 1e-9);
    }
}

#[test]
fn free_mode_runs_are_reproducible() {
    let config = EvoGridConfig {
        grid_dimension: 32,
        population_size: 64,
        program_length: 12,
        instruction_set: InstructionSet::Minimal,
        movement_mode: MovementMode::Free,
        selection_fraction: 0.25,
        mutation_rate: 0.05,
        ticks_per_generation: 10,
        fitness_norm: FitnessNorm::L2,
        spawn: GridPos::new(16, 16),
        rng_seed: Some(0xC0FF_EE00),
        history_capacity: 8,
        ..EvoGridConfig::default()
    };

    let run = |config: EvoGridConfig| {
        let mut engine = EvolutionEngine::new(config).expect("engine");
        let mut snapshots = Vec::new();
        for _ in 0..35 {
            engine.step();
            snapshots.push(engine.snapshot());
        }
        snapshots
    };

    // Parallel agent execution must not perturb the outcome.
    let first = run(config.clone());
    let second = run(config);
    assert_eq!(first, second);
    assert_eq!(first.last().expect("snapshots").generation, 3);
}

#[test]
fn clamped_population_never_escapes_grid() {
    let config = EvoGridConfig {
        grid_dimension: 6,
        population_size: 24,
        program_length: 5,
        instruction_set: InstructionSet::Extended,
        movement_mode: MovementMode::BoundedClamped,
        selection_fraction: 0.5,
        mutation_rate: 0.2,
        ticks_per_generation: 7,
        spawn: GridPos::new(5, 5),
        rng_seed: Some(12),
        history_capacity: 4,
        ..EvoGridConfig::default()
    };
    let mut engine = EvolutionEngine::new(config).expect("engine");
    for _ in 0..50 {
        engine.step();
        for agent in engine.agents() {
            assert!(agent.position().in_bounds(6));
        }
    }
}

#[test]
fn config_round_trips_through_json() {
    let config = collision_config(99);
    let encoded = serde_json::to_string(&config).expect("serialize");
    let decoded: EvoGridConfig = serde_json::from_str(&encoded).expect("deserialize");
    assert_eq!(decoded, config);

    let engine = EvolutionEngine::new(decoded).expect("engine");
    let snapshot = engine.snapshot();
    let encoded = serde_json::to_string(&snapshot).expect("serialize snapshot");
    let decoded: evogrid_core::FrameSnapshot =
        serde_json::from_str(&encoded).expect("deserialize snapshot");
    assert_eq!(decoded, snapshot);
}
