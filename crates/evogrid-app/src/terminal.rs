//! Terminal renderer: draws the grid as a density map alongside a
//! generation statistics panel, with a headless mode for smoke runs.

use std::{
    io::{self, Stdout},
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind},
    execute,
    terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
};
use evogrid_core::FrameSnapshot;
use ratatui::{
    Frame, Terminal,
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Style},
    text::Line,
    widgets::{Block, Borders, Paragraph, Sparkline},
};
use tracing::info;

use crate::{
    SharedEngine, lock_engine,
    renderer::{Renderer, RendererContext},
};

const TARGET_SIM_HZ: f32 = 60.0;
const MAX_STEPS_PER_FRAME: u32 = 240;
const UI_TICK_MILLIS: u64 = 100;
const DEFAULT_HEADLESS_FRAMES: usize = 12;
const MAX_HEADLESS_FRAMES: usize = 360;
const HEADLESS_STEPS_PER_FRAME: u32 = 60;
const SPARKLINE_CAPACITY: usize = 64;

/// Interactive terminal front-end for the evolution engine.
pub struct TerminalRenderer {
    tick_interval: Duration,
    draw_interval: Duration,
}

impl Default for TerminalRenderer {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs_f32(1.0 / TARGET_SIM_HZ),
            draw_interval: Duration::from_millis(UI_TICK_MILLIS),
        }
    }
}

impl Renderer for TerminalRenderer {
    fn name(&self) -> &'static str {
        "terminal"
    }

    fn run(&self, ctx: RendererContext) -> Result<()> {
        if std::env::var_os("EVOGRID_TERMINAL_HEADLESS").is_some() {
            let report = run_headless(&ctx.engine)?;
            info!(
                frames = report.frames,
                ticks_simulated = report.ticks_simulated,
                final_tick = report.final_tick,
                final_generation = report.final_generation,
                alive = report.alive,
                best_fitness = report.best_fitness,
                "Terminal headless run completed"
            );
            return Ok(());
        }

        let mut stdout = io::stdout();
        enable_raw_mode().context("failed to enable raw mode")?;
        execute!(stdout, EnterAlternateScreen).context("failed to enter alternate screen")?;

        let backend = CrosstermBackend::new(stdout);
        let mut terminal = Terminal::new(backend).context("failed to build terminal backend")?;
        terminal.hide_cursor().ok();

        let result = run_event_loop(self, &mut terminal, ctx);

        terminal.show_cursor().ok();
        if let Err(err) = disable_raw_mode() {
            tracing::error!(?err, "failed to disable raw mode");
        }
        if let Err(err) = execute!(terminal.backend_mut(), LeaveAlternateScreen) {
            tracing::error!(?err, "failed to leave alternate screen");
        }

        result
    }
}

#[derive(Debug)]
struct HeadlessReport {
    frames: usize,
    ticks_simulated: u64,
    final_tick: u64,
    final_generation: u64,
    alive: usize,
    best_fitness: f64,
}

fn run_headless(engine: &SharedEngine) -> Result<HeadlessReport> {
    let frames = std::env::var("EVOGRID_HEADLESS_FRAMES")
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(DEFAULT_HEADLESS_FRAMES)
        .min(MAX_HEADLESS_FRAMES);

    let mut ticks_simulated = 0u64;
    let mut guard = lock_engine(engine)?;
    for _ in 0..frames {
        for _ in 0..HEADLESS_STEPS_PER_FRAME {
            guard.step();
            ticks_simulated += 1;
        }
    }
    let snapshot = guard.snapshot();
    let best_fitness = guard
        .history()
        .last()
        .map_or(0.0, |summary| summary.best_fitness);
    Ok(HeadlessReport {
        frames,
        ticks_simulated,
        final_tick: snapshot.tick.0,
        final_generation: snapshot.generation,
        alive: snapshot.agents.iter().filter(|agent| agent.alive).count(),
        best_fitness,
    })
}

struct TerminalApp {
    engine: SharedEngine,
    tick_interval: Duration,
    draw_interval: Duration,
    last_step: Instant,
    last_draw: Instant,
    steps_per_tick: u32,
    paused: bool,
    should_quit: bool,
    snapshot: FrameSnapshot,
    fitness_spark: Vec<u64>,
    grid_dimension: u32,
    ticks_per_generation: u32,
}

impl TerminalApp {
    fn new(renderer: &TerminalRenderer, ctx: RendererContext) -> Result<Self> {
        let (snapshot, grid_dimension, ticks_per_generation) = {
            let guard = lock_engine(&ctx.engine)?;
            (
                guard.snapshot(),
                guard.config().grid_dimension,
                guard.config().ticks_per_generation,
            )
        };
        let now = Instant::now();
        Ok(Self {
            engine: ctx.engine,
            tick_interval: renderer.tick_interval,
            draw_interval: renderer.draw_interval,
            last_step: now,
            last_draw: now,
            steps_per_tick: 1,
            paused: false,
            should_quit: false,
            snapshot,
            fitness_spark: Vec::new(),
            grid_dimension,
            ticks_per_generation,
        })
    }

    fn maybe_step_simulation(&mut self, now: Instant) -> Result<()> {
        if self.paused || now.duration_since(self.last_step) < self.tick_interval {
            return Ok(());
        }
        let steps = self.steps_per_tick.min(MAX_STEPS_PER_FRAME);
        let mut guard = lock_engine(&self.engine)?;
        for _ in 0..steps {
            guard.step();
        }
        drop(guard);
        self.last_step = now;
        Ok(())
    }

    fn refresh_snapshot(&mut self) -> Result<()> {
        let guard = lock_engine(&self.engine)?;
        self.snapshot = guard.snapshot();
        self.fitness_spark = guard
            .history()
            .map(|summary| (summary.best_fitness.clamp(0.0, 1.0) * 1_000.0) as u64)
            .collect();
        drop(guard);
        let len = self.fitness_spark.len();
        if len > SPARKLINE_CAPACITY {
            self.fitness_spark.drain(..len - SPARKLINE_CAPACITY);
        }
        Ok(())
    }

    fn handle_key(&mut self, key: KeyEvent) {
        match key.code {
            KeyCode::Char('q') | KeyCode::Esc => self.should_quit = true,
            KeyCode::Char(' ') => self.paused = !self.paused,
            KeyCode::Char('+') | KeyCode::Char('=') => {
                self.steps_per_tick = (self.steps_per_tick * 2).min(MAX_STEPS_PER_FRAME);
            }
            KeyCode::Char('-') => {
                self.steps_per_tick = (self.steps_per_tick / 2).max(1);
            }
            _ => {}
        }
    }
}

fn run_event_loop(
    renderer: &TerminalRenderer,
    terminal: &mut Terminal<CrosstermBackend<Stdout>>,
    ctx: RendererContext,
) -> Result<()> {
    let mut app = TerminalApp::new(renderer, ctx)?;

    loop {
        let now = Instant::now();
        app.maybe_step_simulation(now)?;

        if now.duration_since(app.last_draw) >= app.draw_interval {
            app.refresh_snapshot()?;
            terminal
                .draw(|frame| draw(frame, &app))
                .context("terminal draw failed")?;
            app.last_draw = now;
        }

        let timeout = app
            .tick_interval
            .checked_sub(now.duration_since(app.last_step))
            .unwrap_or_else(|| Duration::from_millis(1));
        if event::poll(timeout).context("event poll failed")? {
            if let Event::Key(key) = event::read().context("event read failed")? {
                if key.kind == KeyEventKind::Press {
                    app.handle_key(key);
                }
            }
        }

        if app.should_quit {
            return Ok(());
        }
    }
}

fn draw(frame: &mut Frame<'_>, app: &TerminalApp) {
    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Min(24), Constraint::Length(36)])
        .split(frame.area());

    draw_grid(frame, chunks[0], app);
    draw_stats(frame, chunks[1], app);
}

fn draw_grid(frame: &mut Frame<'_>, area: Rect, app: &TerminalApp) {
    let block = Block::default().borders(Borders::ALL).title("grid");
    let inner = block.inner(area);
    frame.render_widget(block, area);
    if inner.width == 0 || inner.height == 0 {
        return;
    }

    let cols = inner.width as usize;
    let rows = inner.height as usize;
    let mut counts = vec![0u32; cols * rows];
    let dimension = app.grid_dimension.max(1) as f64;
    for agent in &app.snapshot.agents {
        if !agent.alive {
            continue;
        }
        // Free-mode agents may wander off-grid; clamp them onto the
        // border cell so the view stays stable.
        let x = (agent.position.x.max(0) as f64 / dimension * cols as f64) as usize;
        let y = (agent.position.y.max(0) as f64 / dimension * rows as f64) as usize;
        let x = x.min(cols - 1);
        let y = y.min(rows - 1);
        counts[y * cols + x] += 1;
    }

    let mut lines = Vec::with_capacity(rows);
    for row in 0..rows {
        let text: String = (0..cols)
            .map(|col| density_glyph(counts[row * cols + col]))
            .collect();
        lines.push(Line::from(text));
    }
    let paragraph = Paragraph::new(lines).style(Style::default().fg(Color::Green));
    frame.render_widget(paragraph, inner);
}

fn draw_stats(frame: &mut Frame<'_>, area: Rect, app: &TerminalApp) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(8), Constraint::Length(5)])
        .split(area);

    let alive = app
        .snapshot
        .agents
        .iter()
        .filter(|agent| agent.alive)
        .count();
    let status = if app.paused { "paused" } else { "running" };
    let lines = vec![
        Line::from(format!("tick        {}", app.snapshot.tick.0)),
        Line::from(format!("generation  {}", app.snapshot.generation)),
        Line::from(format!(
            "epoch tick  {}/{}",
            app.snapshot.iterations, app.ticks_per_generation
        )),
        Line::from(format!("alive       {alive}/{}", app.snapshot.agents.len())),
        Line::from(format!("speed       {}x ({status})", app.steps_per_tick)),
        Line::from(""),
        Line::from("space pause  +/- speed  q quit"),
    ];
    let panel = Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title("evogrid"));
    frame.render_widget(panel, chunks[0]);

    let spark = Sparkline::default()
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title("best fitness"),
        )
        .style(Style::default().fg(Color::Yellow))
        .data(&app.fitness_spark);
    frame.render_widget(spark, chunks[1]);
}

fn density_glyph(count: u32) -> char {
    match count {
        0 => ' ',
        1 => '•',
        2..=4 => '▒',
        _ => '█',
    }
}
