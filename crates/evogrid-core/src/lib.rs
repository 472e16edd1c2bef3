//! Core engine for the evogrid simulation: program-driven agents on a
//! bounded 2D grid, scored and re-bred each generation by a classic
//! generational genetic algorithm.

use ordered_float::OrderedFloat;
use rand::{Rng, SeedableRng, rngs::SmallRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::fmt;
use thiserror::Error;

/// High level simulation clock (ticks processed since boot).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tick(pub u64);

impl Tick {
    /// Returns the next sequential tick.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Resets the tick counter back to zero.
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }
}

/// Integer cell coordinate on the simulation grid.
///
/// Coordinates are signed so that *free* movement mode can leave the
/// grid; bounded modes keep both axes within `[0, dimension)`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct GridPos {
    pub x: i32,
    pub y: i32,
}

impl GridPos {
    /// Construct a new grid position.
    #[must_use]
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Whether both axes fall within `[0, dimension)`.
    #[must_use]
    pub const fn in_bounds(self, dimension: i32) -> bool {
        self.x >= 0 && self.x < dimension && self.y >= 0 && self.y < dimension
    }
}

/// One symbol of an agent program.
///
/// The minimal set covers the four cardinal moves plus `Wait`; the
/// extended set adds diagonal moves, program-counter control, `Halt`,
/// and a reserved placeholder kept for genome compatibility.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Instruction {
    MoveLeft,
    MoveRight,
    MoveUp,
    MoveDown,
    Wait,
    MoveUpLeft,
    MoveUpRight,
    MoveDownLeft,
    MoveDownRight,
    /// Jump back to the first program slot.
    Restart,
    /// Skip the next program slot (+1 beyond the default advance).
    SkipAhead,
    /// Re-execute the current slot next tick (-1 beyond the default advance).
    SkipBack,
    /// Permanently halt the agent for the rest of the epoch.
    Halt,
    /// Reserved slot with no effect.
    Reserved,
}

impl Instruction {
    /// Position delta requested by a movement instruction, if any.
    ///
    /// `MoveUp` decreases `y`, matching screen coordinates.
    #[must_use]
    pub const fn delta(self) -> Option<(i32, i32)> {
        match self {
            Self::MoveLeft => Some((-1, 0)),
            Self::MoveRight => Some((1, 0)),
            Self::MoveUp => Some((0, -1)),
            Self::MoveDown => Some((0, 1)),
            Self::MoveUpLeft => Some((-1, -1)),
            Self::MoveUpRight => Some((1, -1)),
            Self::MoveDownLeft => Some((-1, 1)),
            Self::MoveDownRight => Some((1, 1)),
            _ => None,
        }
    }
}

const MINIMAL_INSTRUCTIONS: [Instruction; 5] = [
    Instruction::MoveLeft,
    Instruction::MoveRight,
    Instruction::MoveUp,
    Instruction::MoveDown,
    Instruction::Wait,
];

const EXTENDED_INSTRUCTIONS: [Instruction; 14] = [
    Instruction::MoveLeft,
    Instruction::MoveRight,
    Instruction::MoveUp,
    Instruction::MoveDown,
    Instruction::Wait,
    Instruction::MoveUpLeft,
    Instruction::MoveUpRight,
    Instruction::MoveDownLeft,
    Instruction::MoveDownRight,
    Instruction::Restart,
    Instruction::SkipAhead,
    Instruction::SkipBack,
    Instruction::Halt,
    Instruction::Reserved,
];

/// Which closed instruction set random generation and mutation draw from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum InstructionSet {
    #[default]
    Minimal,
    Extended,
}

impl InstructionSet {
    /// All symbols of the active set.
    #[must_use]
    pub const fn symbols(self) -> &'static [Instruction] {
        match self {
            Self::Minimal => &MINIMAL_INSTRUCTIONS,
            Self::Extended => &EXTENDED_INSTRUCTIONS,
        }
    }

    /// Draw one symbol uniformly from the active set.
    pub fn sample<R: Rng + ?Sized>(self, rng: &mut R) -> Instruction {
        let symbols = self.symbols();
        symbols[rng.random_range(0..symbols.len())]
    }
}

/// Fixed-length, ordered instruction sequence driving one agent.
///
/// Programs are plain values: breeding copies genes, so parent and
/// child never alias.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Program {
    genes: Vec<Instruction>,
}

impl Program {
    /// Build a program from explicit genes.
    #[must_use]
    pub fn from_genes(genes: Vec<Instruction>) -> Self {
        Self { genes }
    }

    /// Draw `length` instructions independently and uniformly from `set`.
    pub fn random<R: Rng + ?Sized>(length: usize, set: InstructionSet, rng: &mut R) -> Self {
        let genes = (0..length).map(|_| set.sample(rng)).collect();
        Self { genes }
    }

    fn filled(length: usize, instruction: Instruction) -> Self {
        Self {
            genes: vec![instruction; length],
        }
    }

    /// Number of instruction slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.genes.len()
    }

    /// Returns true for a zero-length program.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.genes.is_empty()
    }

    /// Instruction at `slot`.
    #[must_use]
    pub fn get(&self, slot: usize) -> Instruction {
        self.genes[slot]
    }

    /// Full gene sequence.
    #[must_use]
    pub fn genes(&self) -> &[Instruction] {
        &self.genes
    }
}

/// Write a crossover of `parent_a` and `parent_b` into `child`.
///
/// A split point `s` is drawn uniformly in `[0, L)`; the child takes
/// `parent_a`'s genes below `s` and `parent_b`'s genes from `s` on.
/// With probability `mutation_rate` exactly one uniformly chosen gene
/// is then overwritten with a random symbol from `set`. Self-breeding
/// (both parents identical) produces a clone, optionally mutated.
pub fn breed<R: Rng + ?Sized>(
    child: &mut Program,
    parent_a: &Program,
    parent_b: &Program,
    mutation_rate: f64,
    set: InstructionSet,
    rng: &mut R,
) {
    let length = child.len();
    debug_assert_eq!(length, parent_a.len());
    debug_assert_eq!(length, parent_b.len());
    let split = rng.random_range(0..length);
    child.genes[..split].copy_from_slice(&parent_a.genes[..split]);
    child.genes[split..].copy_from_slice(&parent_b.genes[split..]);
    if mutation_rate > 0.0 && rng.random::<f64>() < mutation_rate {
        let slot = rng.random_range(0..length);
        child.genes[slot] = set.sample(rng);
    }
}

/// How directional instructions interact with the grid boundary.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum MovementMode {
    /// Positions update unconditionally; no bounds check, no occupancy.
    Free,
    /// Moves leaving `[0, dimension)` on either axis are rejected.
    BoundedClamped,
    /// Bounded, and moves into a cell occupied by a live agent are
    /// rejected; each cell holds at most one live agent.
    #[default]
    BoundedCollision,
}

/// Norm applied to the displacement from grid center when scoring.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum FitnessNorm {
    #[default]
    L1,
    L2,
}

/// Score an agent's terminal position; higher is better, at most 1.0.
///
/// Both norms reward finishing near the grid center. Depends only on
/// the position, never on program content.
#[must_use]
pub fn fitness(position: GridPos, dimension: u32, norm: FitnessNorm, scale: f64) -> f64 {
    let center = f64::from(dimension) / 2.0;
    let dx = f64::from(position.x) + 0.5 - center;
    let dy = f64::from(position.y) + 0.5 - center;
    match norm {
        FitnessNorm::L1 => 1.0 - (dx.abs() + dy.abs()) / scale,
        FitnessNorm::L2 => 1.0 - (dx * dx + dy * dy).sqrt() / scale,
    }
}

/// One simulated agent: a program, its program counter, a grid
/// position, and liveness state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Agent {
    program: Program,
    step: usize,
    position: GridPos,
    alive: bool,
    updated: bool,
}

impl Agent {
    /// Current grid position.
    #[must_use]
    pub const fn position(&self) -> GridPos {
        self.position
    }

    /// Current program counter in `[0, program length)`.
    #[must_use]
    pub const fn step(&self) -> usize {
        self.step
    }

    /// Whether the agent is still executing this epoch.
    #[must_use]
    pub const fn is_alive(&self) -> bool {
        self.alive
    }

    /// Whether the agent already executed during the current tick.
    /// Always false at tick boundaries.
    #[must_use]
    pub const fn updated_this_tick(&self) -> bool {
        self.updated
    }

    /// The program driving this agent.
    #[must_use]
    pub fn program(&self) -> &Program {
        &self.program
    }
}

/// Grid-exclusive occupancy index mapping each cell to at most one
/// agent, used only in [`MovementMode::BoundedCollision`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OccupancyGrid {
    dimension: u32,
    cells: Vec<Option<u32>>,
}

impl OccupancyGrid {
    /// Construct an empty `dimension x dimension` index.
    pub fn new(dimension: u32) -> Result<Self, EngineError> {
        if dimension == 0 {
            return Err(EngineError::InvalidConfig(
                "grid dimension must be non-zero",
            ));
        }
        Ok(Self {
            dimension,
            cells: vec![None; (dimension as usize) * (dimension as usize)],
        })
    }

    /// Edge length of the indexed grid.
    #[must_use]
    pub const fn dimension(&self) -> u32 {
        self.dimension
    }

    #[inline]
    fn offset(&self, position: GridPos) -> usize {
        debug_assert!(position.in_bounds(self.dimension as i32));
        (position.y as usize) * (self.dimension as usize) + (position.x as usize)
    }

    /// Index of the agent occupying `position`, if any.
    #[must_use]
    pub fn occupant(&self, position: GridPos) -> Option<u32> {
        self.cells[self.offset(position)]
    }

    /// Record `agent` as the occupant of `position`.
    pub fn claim(&mut self, position: GridPos, agent: u32) {
        let offset = self.offset(position);
        debug_assert!(self.cells[offset].is_none(), "cell already claimed");
        self.cells[offset] = Some(agent);
    }

    /// Release `position`.
    pub fn vacate(&mut self, position: GridPos) {
        let offset = self.offset(position);
        debug_assert!(self.cells[offset].is_some(), "cell already vacant");
        self.cells[offset] = None;
    }

    /// Release every cell.
    pub fn clear(&mut self) {
        self.cells.fill(None);
    }

    /// Iterate over `(position, agent index)` pairs for occupied cells.
    pub fn occupied_cells(&self) -> impl Iterator<Item = (GridPos, u32)> + '_ {
        let dimension = self.dimension as usize;
        self.cells.iter().enumerate().filter_map(move |(idx, cell)| {
            cell.map(|agent| {
                (
                    GridPos::new((idx % dimension) as i32, (idx / dimension) as i32),
                    agent,
                )
            })
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RankEntry {
    fitness: OrderedFloat<f64>,
    index: usize,
}

impl PartialOrd for RankEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RankEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Ties rank the lower population index higher, preserving the
        // original index-order scan semantics.
        self.fitness
            .cmp(&other.fitness)
            .then_with(|| other.index.cmp(&self.index))
    }
}

/// Top-K fitness ranking used as the breeding pool for one generation.
///
/// Rebuilt wholesale by [`rank_top_k`] every generation transition;
/// never carried across generations.
#[derive(Debug, Clone, PartialEq)]
pub struct Ranking {
    entries: Vec<RankEntry>,
    total_fitness: f64,
}

impl Ranking {
    /// Number of ranked agents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true when nothing is ranked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of fitness over exactly the ranked entries.
    #[must_use]
    pub const fn total_fitness(&self) -> f64 {
        self.total_fitness
    }

    /// Iterate `(agent index, fitness)` in descending fitness order.
    pub fn entries(&self) -> impl Iterator<Item = (usize, f64)> + '_ {
        self.entries
            .iter()
            .map(|entry| (entry.index, entry.fitness.into_inner()))
    }

    /// The highest-ranked agent, if any.
    #[must_use]
    pub fn best(&self) -> Option<(usize, f64)> {
        self.entries
            .first()
            .map(|entry| (entry.index, entry.fitness.into_inner()))
    }

    /// Fitness-proportional ("roulette wheel") sample restricted to the
    /// ranked set.
    ///
    /// Draws `r` uniformly in `[0, total_fitness)` and returns the
    /// first ranked index whose running fitness sum reaches `r`. A
    /// non-positive total or a rounding shortfall falls back to a
    /// uniform choice among the ranked indices, so a valid agent index
    /// is always returned. The ranking must be non-empty.
    pub fn select<R: Rng + ?Sized>(&self, rng: &mut R) -> usize {
        debug_assert!(!self.entries.is_empty(), "selection from empty ranking");
        if self.total_fitness > 0.0 {
            let target = rng.random_range(0.0..self.total_fitness);
            let mut accumulated = 0.0;
            for entry in &self.entries {
                accumulated += entry.fitness.into_inner();
                if accumulated >= target {
                    return entry.index;
                }
            }
        }
        self.entries[rng.random_range(0..self.entries.len())].index
    }
}

/// Produce the `k` highest-fitness agent indices in descending order,
/// ties broken by ascending population index.
///
/// Maintains a bounded min-heap of capacity `k`, so each insertion and
/// eviction costs `O(log k)` rather than an `O(k)` array shift.
#[must_use]
pub fn rank_top_k(fitnesses: &[f64], k: usize) -> Ranking {
    let mut heap: BinaryHeap<Reverse<RankEntry>> = BinaryHeap::with_capacity(k + 1);
    for (index, &value) in fitnesses.iter().enumerate() {
        let entry = RankEntry {
            fitness: OrderedFloat(value),
            index,
        };
        if heap.len() < k {
            heap.push(Reverse(entry));
        } else if let Some(Reverse(worst)) = heap.peek() {
            if entry > *worst {
                heap.pop();
                heap.push(Reverse(entry));
            }
        }
    }
    let mut entries: Vec<RankEntry> = heap.into_iter().map(|Reverse(entry)| entry).collect();
    entries.sort_unstable_by(|a, b| b.cmp(a));
    let total_fitness = entries
        .iter()
        .map(|entry| entry.fitness.into_inner())
        .sum();
    Ranking {
        entries,
        total_fitness,
    }
}

/// Errors raised when constructing an engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Static configuration for an evogrid simulation.
///
/// Validated once at construction; immutable thereafter. The defaults
/// mirror the original 128x128 collision-mode setup with one agent
/// seeded per row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvoGridConfig {
    /// Edge length of the square grid in cells.
    pub grid_dimension: u32,
    /// Number of agents in each generation.
    pub population_size: usize,
    /// Fixed instruction count of every program.
    pub program_length: usize,
    /// Closed instruction set drawn from by generation and mutation.
    pub instruction_set: InstructionSet,
    /// Boundary/collision policy applied to movement.
    pub movement_mode: MovementMode,
    /// Fraction of the population ranked into the breeding pool, in (0, 1].
    pub selection_fraction: f64,
    /// Per-child probability of a single-gene mutation, in [0, 1].
    pub mutation_rate: f64,
    /// Ticks between generation transitions.
    pub ticks_per_generation: u32,
    /// Norm used by the fitness function.
    pub fitness_norm: FitnessNorm,
    /// Fitness normalization constant; defaults to the grid dimension.
    pub fitness_scale: Option<f64>,
    /// Cell agents reset to at each generation start. In collision mode
    /// the population fans out column-major from this cell.
    pub spawn: GridPos,
    /// Optional RNG seed for reproducible runs.
    pub rng_seed: Option<u64>,
    /// Maximum generation summaries retained in-memory; 0 disables.
    pub history_capacity: usize,
}

impl Default for EvoGridConfig {
    fn default() -> Self {
        Self {
            grid_dimension: 128,
            population_size: 128,
            program_length: 16,
            instruction_set: InstructionSet::Minimal,
            movement_mode: MovementMode::BoundedCollision,
            selection_fraction: 0.5,
            mutation_rate: 0.05,
            ticks_per_generation: 5_000,
            fitness_norm: FitnessNorm::L1,
            fitness_scale: None,
            spawn: GridPos::new(0, 0),
            rng_seed: None,
            history_capacity: 256,
        }
    }
}

impl EvoGridConfig {
    /// Validates the configuration, returning the breeding-pool size K.
    fn breeding_pool_size(&self) -> Result<usize, EngineError> {
        if self.grid_dimension == 0 {
            return Err(EngineError::InvalidConfig(
                "grid_dimension must be non-zero",
            ));
        }
        if self.population_size == 0 {
            return Err(EngineError::InvalidConfig(
                "population_size must be non-zero",
            ));
        }
        if self.program_length == 0 {
            return Err(EngineError::InvalidConfig(
                "program_length must be non-zero",
            ));
        }
        if self.ticks_per_generation == 0 {
            return Err(EngineError::InvalidConfig(
                "ticks_per_generation must be non-zero",
            ));
        }
        if !self.selection_fraction.is_finite()
            || self.selection_fraction <= 0.0
            || self.selection_fraction > 1.0
        {
            return Err(EngineError::InvalidConfig(
                "selection_fraction must lie in (0, 1]",
            ));
        }
        if !self.mutation_rate.is_finite() || !(0.0..=1.0).contains(&self.mutation_rate) {
            return Err(EngineError::InvalidConfig(
                "mutation_rate must lie in [0, 1]",
            ));
        }
        if let Some(scale) = self.fitness_scale {
            if !scale.is_finite() || scale <= 0.0 {
                return Err(EngineError::InvalidConfig(
                    "fitness_scale must be positive",
                ));
            }
        }
        if !self.spawn.in_bounds(self.grid_dimension as i32) {
            return Err(EngineError::InvalidConfig(
                "spawn position must lie within the grid",
            ));
        }
        let cells = (self.grid_dimension as usize) * (self.grid_dimension as usize);
        if self.movement_mode == MovementMode::BoundedCollision && self.population_size > cells {
            return Err(EngineError::InvalidConfig(
                "collision mode cannot place more agents than grid cells",
            ));
        }
        let k = (self.population_size as f64 * self.selection_fraction).floor() as usize;
        if k == 0 {
            return Err(EngineError::InvalidConfig(
                "selection_fraction yields an empty breeding pool",
            ));
        }
        if k > self.population_size {
            return Err(EngineError::InvalidConfig(
                "breeding pool cannot exceed the population",
            ));
        }
        Ok(k)
    }

    /// Normalization constant used by the fitness function.
    #[must_use]
    pub fn resolved_fitness_scale(&self) -> f64 {
        self.fitness_scale
            .unwrap_or_else(|| f64::from(self.grid_dimension))
    }

    /// Returns the configured RNG, seeding from entropy if no seed is set.
    fn seeded_rng(&self) -> SmallRng {
        match self.rng_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => {
                let seed: u64 = rand::random();
                SmallRng::seed_from_u64(seed)
            }
        }
    }
}

/// Spawn cell for the agent at `index`.
///
/// Free and clamped modes stack the whole population on the configured
/// spawn cell. Collision mode cannot stack, so agents fan out
/// column-major from the spawn origin, wrapping around the grid.
fn spawn_cell(config: &EvoGridConfig, index: usize) -> GridPos {
    match config.movement_mode {
        MovementMode::Free | MovementMode::BoundedClamped => config.spawn,
        MovementMode::BoundedCollision => {
            let dimension = config.grid_dimension as usize;
            let origin = (config.spawn.x as usize) * dimension + config.spawn.y as usize;
            let cell = (origin + index) % (dimension * dimension);
            GridPos::new((cell / dimension) as i32, (cell % dimension) as i32)
        }
    }
}

fn try_move(
    index: usize,
    agent: &mut Agent,
    dx: i32,
    dy: i32,
    dimension: i32,
    mode: MovementMode,
    occupancy: Option<&mut OccupancyGrid>,
) {
    let target = GridPos::new(agent.position.x + dx, agent.position.y + dy);
    match mode {
        MovementMode::Free => {
            agent.position = target;
        }
        MovementMode::BoundedClamped => {
            if target.in_bounds(dimension) {
                agent.position = target;
            }
        }
        MovementMode::BoundedCollision => {
            if !target.in_bounds(dimension) {
                return;
            }
            let Some(occupancy) = occupancy else {
                return;
            };
            if occupancy.occupant(target).is_some() {
                return;
            }
            occupancy.vacate(agent.position);
            occupancy.claim(target, index as u32);
            agent.position = target;
        }
    }
}

/// Advance one agent by one program step.
///
/// Every invocation consumes exactly one instruction slot: unless a
/// control instruction set the program counter itself, it advances by
/// one and wraps modulo the program length.
fn execute_step(
    index: usize,
    agent: &mut Agent,
    dimension: i32,
    mode: MovementMode,
    occupancy: Option<&mut OccupancyGrid>,
) {
    let length = agent.program.len();
    let instruction = agent.program.get(agent.step);
    let mut next_step = agent.step + 1;
    if let Some((dx, dy)) = instruction.delta() {
        try_move(index, agent, dx, dy, dimension, mode, occupancy);
    } else {
        match instruction {
            Instruction::Restart => next_step = 0,
            Instruction::SkipAhead => next_step = agent.step + 2,
            Instruction::SkipBack => next_step = agent.step,
            Instruction::Halt => {
                agent.alive = false;
                // Only live agents block movement; the halted agent
                // keeps its position for fitness scoring.
                if let Some(occupancy) = occupancy {
                    occupancy.vacate(agent.position);
                }
            }
            // Wait and the reserved placeholder have no effect.
            _ => {}
        }
    }
    agent.step = next_step % length;
}

/// Summary emitted to telemetry sinks at each generation transition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerationSummary {
    /// Epoch counter after the transition.
    pub generation: u64,
    /// Sum of fitness over the ranked breeding pool.
    pub total_fitness: f64,
    /// Fitness of the generation champion.
    pub best_fitness: f64,
    /// Ticks elapsed during the generation.
    pub ticks: u32,
}

/// Telemetry sink invoked once per generation transition.
pub trait GenerationTelemetry: Send {
    fn on_generation(&mut self, summary: &GenerationSummary);
}

/// No-op telemetry sink.
#[derive(Debug, Default)]
pub struct NullTelemetry;

impl GenerationTelemetry for NullTelemetry {
    fn on_generation(&mut self, _summary: &GenerationSummary) {}
}

/// Events emitted after processing one engine tick.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct TickEvents {
    pub tick: Tick,
    pub generation: u64,
    pub generation_rolled: bool,
}

/// Read-only per-agent state handed to renderers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentSnapshot {
    pub index: usize,
    pub position: GridPos,
    pub alive: bool,
}

/// Read-only engine snapshot taken between ticks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FrameSnapshot {
    pub tick: Tick,
    pub generation: u64,
    pub iterations: u32,
    pub agents: Vec<AgentSnapshot>,
}

/// The evolution engine: owns the population, drives the tick loop,
/// and runs the generation-transition algorithm.
pub struct EvolutionEngine {
    config: EvoGridConfig,
    selection_count: usize,
    tick: Tick,
    iterations: u32,
    generation: u64,
    rng: SmallRng,
    agents: Vec<Agent>,
    offspring: Vec<Program>,
    fitnesses: Vec<f64>,
    occupancy: Option<OccupancyGrid>,
    telemetry: Box<dyn GenerationTelemetry>,
    history: VecDeque<GenerationSummary>,
}

impl fmt::Debug for EvolutionEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvolutionEngine")
            .field("config", &self.config)
            .field("tick", &self.tick)
            .field("iterations", &self.iterations)
            .field("generation", &self.generation)
            .field("agent_count", &self.agents.len())
            .finish()
    }
}

impl EvolutionEngine {
    /// Instantiate a new engine using the supplied configuration.
    pub fn new(config: EvoGridConfig) -> Result<Self, EngineError> {
        Self::with_telemetry(config, Box::new(NullTelemetry))
    }

    /// Instantiate a new engine with a generation telemetry sink.
    pub fn with_telemetry(
        config: EvoGridConfig,
        telemetry: Box<dyn GenerationTelemetry>,
    ) -> Result<Self, EngineError> {
        let selection_count = config.breeding_pool_size()?;
        let mut rng = config.seeded_rng();
        let population = config.population_size;

        let mut agents = Vec::with_capacity(population);
        for index in 0..population {
            agents.push(Agent {
                program: Program::random(config.program_length, config.instruction_set, &mut rng),
                step: 0,
                position: spawn_cell(&config, index),
                alive: true,
                updated: false,
            });
        }

        let occupancy = if config.movement_mode == MovementMode::BoundedCollision {
            let mut grid = OccupancyGrid::new(config.grid_dimension)?;
            for (index, agent) in agents.iter().enumerate() {
                grid.claim(agent.position, index as u32);
            }
            Some(grid)
        } else {
            None
        };

        let offspring = (0..population)
            .map(|_| Program::filled(config.program_length, Instruction::Wait))
            .collect();
        let history_capacity = config.history_capacity;

        Ok(Self {
            config,
            selection_count,
            tick: Tick::zero(),
            iterations: 0,
            generation: 0,
            rng,
            agents,
            offspring,
            fitnesses: Vec::with_capacity(population),
            occupancy,
            telemetry,
            history: VecDeque::with_capacity(history_capacity),
        })
    }

    /// Execute one tick: advance every live, not-yet-updated agent by
    /// one program step, then roll the generation when the configured
    /// threshold is reached.
    pub fn step(&mut self) -> TickEvents {
        let next_tick = self.tick.next();
        self.stage_execution();
        self.stage_flag_reset();
        self.iterations += 1;

        let mut events = TickEvents {
            tick: next_tick,
            generation: self.generation,
            generation_rolled: false,
        };
        if self.iterations >= self.config.ticks_per_generation {
            let elapsed = self.iterations;
            self.iterations = 0;
            self.generation += 1;
            self.stage_generation(elapsed);
            events.generation = self.generation;
            events.generation_rolled = true;
        }
        self.tick = next_tick;
        events
    }

    fn stage_execution(&mut self) {
        let dimension = self.config.grid_dimension as i32;
        let mode = self.config.movement_mode;
        match mode {
            MovementMode::BoundedCollision => {
                // First-claim-wins on contested cells requires the
                // strict index-ascending scan order.
                if let Some(occupancy) = self.occupancy.as_mut() {
                    for (index, agent) in self.agents.iter_mut().enumerate() {
                        if !agent.alive || agent.updated {
                            continue;
                        }
                        execute_step(index, agent, dimension, mode, Some(&mut *occupancy));
                        agent.updated = true;
                    }
                }
            }
            MovementMode::Free | MovementMode::BoundedClamped => {
                // No shared state between agents, so execution is
                // distributed; per-agent results match the sequential
                // scan exactly.
                self.agents
                    .par_iter_mut()
                    .enumerate()
                    .for_each(|(index, agent)| {
                        if agent.alive && !agent.updated {
                            execute_step(index, agent, dimension, mode, None);
                            agent.updated = true;
                        }
                    });
            }
        }
    }

    fn stage_flag_reset(&mut self) {
        for agent in &mut self.agents {
            agent.updated = false;
        }
    }

    /// Generation transition: score, rank, breed, swap, reset.
    fn stage_generation(&mut self, elapsed: u32) {
        let dimension = self.config.grid_dimension;
        let norm = self.config.fitness_norm;
        let scale = self.config.resolved_fitness_scale();

        self.fitnesses.clear();
        self.fitnesses.par_extend(
            self.agents
                .par_iter()
                .map(|agent| fitness(agent.position, dimension, norm, scale)),
        );

        let ranking = rank_top_k(&self.fitnesses, self.selection_count);
        for slot in 0..self.agents.len() {
            let parent_a = ranking.select(&mut self.rng);
            let parent_b = ranking.select(&mut self.rng);
            breed(
                &mut self.offspring[slot],
                &self.agents[parent_a].program,
                &self.agents[parent_b].program,
                self.config.mutation_rate,
                self.config.instruction_set,
                &mut self.rng,
            );
        }
        for (agent, child) in self.agents.iter_mut().zip(self.offspring.iter_mut()) {
            // The old program becomes next epoch's scratch slot.
            std::mem::swap(&mut agent.program, child);
        }
        self.reset_agents();

        let summary = GenerationSummary {
            generation: self.generation,
            total_fitness: ranking.total_fitness(),
            best_fitness: ranking.best().map_or(0.0, |(_, value)| value),
            ticks: elapsed,
        };
        if self.config.history_capacity > 0 {
            if self.history.len() >= self.config.history_capacity {
                self.history.pop_front();
            }
            self.history.push_back(summary.clone());
        }
        self.telemetry.on_generation(&summary);
    }

    /// Reset transient agent state for a fresh epoch. Programs are
    /// retained; they were just written by breeding.
    fn reset_agents(&mut self) {
        if let Some(occupancy) = &mut self.occupancy {
            occupancy.clear();
        }
        for index in 0..self.agents.len() {
            let position = spawn_cell(&self.config, index);
            let agent = &mut self.agents[index];
            agent.step = 0;
            agent.position = position;
            agent.alive = true;
            agent.updated = false;
            if let Some(occupancy) = &mut self.occupancy {
                occupancy.claim(position, index as u32);
            }
        }
    }

    /// Returns an immutable reference to configuration.
    #[must_use]
    pub fn config(&self) -> &EvoGridConfig {
        &self.config
    }

    /// Current simulation tick.
    #[must_use]
    pub const fn tick(&self) -> Tick {
        self.tick
    }

    /// Ticks elapsed since the last generation transition.
    #[must_use]
    pub const fn iterations(&self) -> u32 {
        self.iterations
    }

    /// Epoch counter.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Size K of the ranked breeding pool.
    #[must_use]
    pub const fn selection_count(&self) -> usize {
        self.selection_count
    }

    /// Number of agents in the population.
    #[must_use]
    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    /// Read-only access to the population in index order.
    #[must_use]
    pub fn agents(&self) -> &[Agent] {
        &self.agents
    }

    /// Borrow one agent by population index.
    #[must_use]
    pub fn agent(&self, index: usize) -> Option<&Agent> {
        self.agents.get(index)
    }

    /// Replace the program of the agent at `index`. The program length
    /// must match the configured length. Useful for seeding known
    /// genomes into experiments.
    pub fn set_program(&mut self, index: usize, program: Program) -> bool {
        if program.len() != self.config.program_length {
            return false;
        }
        match self.agents.get_mut(index) {
            Some(agent) => {
                agent.program = program;
                true
            }
            None => false,
        }
    }

    /// The occupancy index, present only in collision mode. Must not
    /// be read mid-tick.
    #[must_use]
    pub fn occupancy(&self) -> Option<&OccupancyGrid> {
        self.occupancy.as_ref()
    }

    /// Iterate over retained generation summaries, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &GenerationSummary> {
        self.history.iter()
    }

    /// Replace the telemetry sink.
    pub fn set_telemetry(&mut self, telemetry: Box<dyn GenerationTelemetry>) {
        self.telemetry = telemetry;
    }

    /// Produce a cheap read-only snapshot for renderers.
    #[must_use]
    pub fn snapshot(&self) -> FrameSnapshot {
        FrameSnapshot {
            tick: self.tick,
            generation: self.generation,
            iterations: self.iterations,
            agents: self
                .agents
                .iter()
                .enumerate()
                .map(|(index, agent)| AgentSnapshot {
                    index,
                    position: agent.position,
                    alive: agent.alive,
                })
                .collect(),
        }
    }
}
