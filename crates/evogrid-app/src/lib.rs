//! Shared application plumbing for the evogrid shell.

use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Result, anyhow};
use evogrid_core::{EvolutionEngine, GenerationSummary, GenerationTelemetry};
use tracing::info;

/// Engine handle shared between the simulation driver and renderers.
pub type SharedEngine = Arc<Mutex<EvolutionEngine>>;

pub mod terminal;

/// Lock the shared engine, surfacing poisoning as an error.
pub fn lock_engine(engine: &SharedEngine) -> Result<MutexGuard<'_, EvolutionEngine>> {
    engine.lock().map_err(|_| anyhow!("engine mutex poisoned"))
}

pub mod renderer {
    use anyhow::Result;

    use crate::SharedEngine;

    /// Shared context passed to renderer implementations.
    pub struct RendererContext {
        pub engine: SharedEngine,
    }

    /// A presentation-layer collaborator. Renderers consume engine
    /// snapshots; the engine never blocks on them.
    pub trait Renderer {
        /// Stable identifier describing the renderer implementation.
        fn name(&self) -> &'static str;

        /// Launch the renderer; blocks until the session completes.
        fn run(&self, ctx: RendererContext) -> Result<()>;
    }
}

/// Telemetry sink that forwards generation summaries to tracing.
#[derive(Debug, Default)]
pub struct LogTelemetry;

impl GenerationTelemetry for LogTelemetry {
    fn on_generation(&mut self, summary: &GenerationSummary) {
        info!(
            generation = summary.generation,
            total_fitness = summary.total_fitness,
            best_fitness = summary.best_fitness,
            ticks = summary.ticks,
            "Generation complete",
        );
    }
}
