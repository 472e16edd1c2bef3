use anyhow::Result;
use clap::{Parser, ValueEnum};
use evogrid_app::{
    LogTelemetry, SharedEngine,
    renderer::{Renderer, RendererContext},
    terminal::TerminalRenderer,
};
use evogrid_core::{
    EvoGridConfig, EvolutionEngine, FitnessNorm, GridPos, InstructionSet, MovementMode,
};
use std::sync::{Arc, Mutex};
use tracing::info;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum MovementModeArg {
    Free,
    Clamped,
    Collision,
}

impl From<MovementModeArg> for MovementMode {
    fn from(value: MovementModeArg) -> Self {
        match value {
            MovementModeArg::Free => Self::Free,
            MovementModeArg::Clamped => Self::BoundedClamped,
            MovementModeArg::Collision => Self::BoundedCollision,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum InstructionSetArg {
    Minimal,
    Extended,
}

impl From<InstructionSetArg> for InstructionSet {
    fn from(value: InstructionSetArg) -> Self {
        match value {
            InstructionSetArg::Minimal => Self::Minimal,
            InstructionSetArg::Extended => Self::Extended,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FitnessNormArg {
    L1,
    L2,
}

impl From<FitnessNormArg> for FitnessNorm {
    fn from(value: FitnessNormArg) -> Self {
        match value {
            FitnessNormArg::L1 => Self::L1,
            FitnessNormArg::L2 => Self::L2,
        }
    }
}

/// Evolve program-driven agents on a bounded grid.
#[derive(Debug, Parser)]
#[command(name = "evogrid", version, about)]
struct Args {
    /// Edge length of the square grid in cells.
    #[arg(long, default_value_t = 128)]
    grid_dimension: u32,

    /// Number of agents per generation.
    #[arg(long, default_value_t = 128)]
    population: usize,

    /// Instruction count of every agent program.
    #[arg(long, default_value_t = 16)]
    program_length: usize,

    /// Instruction set agents draw programs from.
    #[arg(long, value_enum, default_value_t = InstructionSetArg::Minimal)]
    instructions: InstructionSetArg,

    /// Boundary and collision policy for movement.
    #[arg(long, value_enum, default_value_t = MovementModeArg::Collision)]
    movement: MovementModeArg,

    /// Fraction of the population ranked into the breeding pool.
    #[arg(long, default_value_t = 0.5)]
    selection_fraction: f64,

    /// Per-child probability of a single-gene mutation.
    #[arg(long, default_value_t = 0.05)]
    mutation_rate: f64,

    /// Ticks between generation transitions.
    #[arg(long, default_value_t = 5_000)]
    ticks_per_generation: u32,

    /// Norm used by the fitness function.
    #[arg(long, value_enum, default_value_t = FitnessNormArg::L1)]
    fitness_norm: FitnessNormArg,

    /// Spawn cell, x coordinate.
    #[arg(long, default_value_t = 0)]
    spawn_x: i32,

    /// Spawn cell, y coordinate.
    #[arg(long, default_value_t = 0)]
    spawn_y: i32,

    /// RNG seed for reproducible runs.
    #[arg(long)]
    seed: Option<u64>,

    /// Run without a UI for the given number of ticks, then exit.
    #[arg(long)]
    headless_ticks: Option<u64>,
}

impl Args {
    fn to_config(&self) -> EvoGridConfig {
        EvoGridConfig {
            grid_dimension: self.grid_dimension,
            population_size: self.population,
            program_length: self.program_length,
            instruction_set: self.instructions.into(),
            movement_mode: self.movement.into(),
            selection_fraction: self.selection_fraction,
            mutation_rate: self.mutation_rate,
            ticks_per_generation: self.ticks_per_generation,
            fitness_norm: self.fitness_norm.into(),
            spawn: GridPos::new(self.spawn_x, self.spawn_y),
            rng_seed: self.seed,
            ..EvoGridConfig::default()
        }
    }
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let config = args.to_config();
    info!(
        grid_dimension = config.grid_dimension,
        population = config.population_size,
        movement = ?config.movement_mode,
        instructions = ?config.instruction_set,
        "Starting evogrid simulation"
    );
    let engine = EvolutionEngine::with_telemetry(config, Box::new(LogTelemetry))?;

    if let Some(ticks) = args.headless_ticks {
        return run_headless(engine, ticks);
    }

    let engine: SharedEngine = Arc::new(Mutex::new(engine));
    let renderer = TerminalRenderer::default();
    info!(renderer = renderer.name(), "Launching renderer");
    renderer.run(RendererContext { engine })
}

fn run_headless(mut engine: EvolutionEngine, ticks: u64) -> Result<()> {
    for _ in 0..ticks {
        engine.step();
    }
    let snapshot = engine.snapshot();
    let alive = snapshot.agents.iter().filter(|agent| agent.alive).count();
    if let Some(summary) = engine.history().last() {
        info!(
            ticks,
            generation = summary.generation,
            total_fitness = summary.total_fitness,
            best_fitness = summary.best_fitness,
            alive,
            "Headless run completed"
        );
    } else {
        info!(ticks, alive, "Headless run completed before first generation");
    }
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_args_build_a_valid_config() {
        let args = Args::parse_from(["evogrid"]);
        let config = args.to_config();
        assert_eq!(config.movement_mode, MovementMode::BoundedCollision);
        assert!(EvolutionEngine::new(config).is_ok());
    }

    #[test]
    fn headless_flags_override_defaults() {
        let args = Args::parse_from([
            "evogrid",
            "--grid-dimension",
            "16",
            "--population",
            "8",
            "--movement",
            "free",
            "--instructions",
            "extended",
            "--seed",
            "42",
            "--headless-ticks",
            "10",
        ]);
        assert_eq!(args.headless_ticks, Some(10));
        let config = args.to_config();
        assert_eq!(config.grid_dimension, 16);
        assert_eq!(config.movement_mode, MovementMode::Free);
        assert_eq!(config.instruction_set, InstructionSet::Extended);
        assert_eq!(config.rng_seed, Some(42));
        assert!(EvolutionEngine::new(config).is_ok());
    }
}
