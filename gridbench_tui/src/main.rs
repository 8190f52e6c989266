use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use gridbench_core::{
    Position,
    agent::{AgentView, Decision, DecisionSource, RandomWalker, TargetSeeker},
    benchmark::{run_benchmark, run_seed},
    config::EnvConfig,
    environment::{Cell, Environment},
    scheduler::{EpisodeRunner, RunOutcome, RunState},
    termination::TerminationKind,
    transcript::{JsonlTranscript, NullTranscript, TranscriptSink},
};
use rand::{SeedableRng, rngs::StdRng};
use ratatui::{
    crossterm::{
        self,
        event::{self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode},
        execute,
        terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
    },
    prelude::*,
    widgets::*,
};
use std::{
    fs::File,
    io::{self, BufWriter, Stdout},
    path::{Path, PathBuf},
    sync::Mutex,
    time::{Duration, Instant},
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Environment description to load
    #[arg(
        short,
        long,
        value_name = "CONFIG_FILE",
        default_value = "configs/multi_agent_navigation.yaml"
    )]
    config: PathBuf,

    /// Base seed; run `i` uses `seed + i`. Random when omitted
    #[arg(short, long)]
    seed: Option<u64>,

    /// Number of independent runs
    #[arg(short, long, default_value_t = 1)]
    runs: usize,

    /// Run without drawing and print a JSON report to stdout
    #[arg(long)]
    headless: bool,

    /// Built-in agent driving every character
    #[arg(short, long, value_enum, default_value_t = AgentKind::Seeker)]
    agent: AgentKind,

    /// Override the termination function named in the config
    #[arg(long, value_parser = parse_termination)]
    termination: Option<TerminationKind>,

    /// Write every agent conversation as JSON lines
    #[arg(long, value_name = "FILE")]
    transcript: Option<PathBuf>,

    /// Write logs to a file (the only log output while drawing)
    #[arg(long, value_name = "FILE")]
    log_file: Option<PathBuf>,

    /// Milliseconds between turns while drawing
    #[arg(long, default_value_t = 250)]
    tick_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum AgentKind {
    Random,
    Seeker,
}

impl AgentKind {
    fn driver(self, seed: u64) -> Driver {
        match self {
            AgentKind::Random => Driver::Random(RandomWalker::new(seed)),
            AgentKind::Seeker => Driver::Seeker(TargetSeeker::new()),
        }
    }
}

enum Driver {
    Random(RandomWalker),
    Seeker(TargetSeeker),
}

impl DecisionSource for Driver {
    fn decide(&mut self, view: &AgentView<'_>) -> Decision {
        match self {
            Driver::Random(walker) => walker.decide(view),
            Driver::Seeker(seeker) => seeker.decide(view),
        }
    }
}

fn parse_termination(name: &str) -> Result<TerminationKind, String> {
    serde_json::from_value(serde_json::Value::String(name.to_string()))
        .map_err(|err| err.to_string())
}

struct App {
    config: EnvConfig,
    agent_kind: AgentKind,
    seed: u64,
    runs: usize,
    /// Zero-based index of the run on screen.
    run: usize,
    environment: Environment,
    runner: EpisodeRunner,
    decisions: Driver,
    transcript: Box<dyn TranscriptSink>,
    outcomes: Vec<RunOutcome>,
    paused: bool,
    should_quit: bool,
}

impl App {
    fn new(
        config: EnvConfig,
        agent_kind: AgentKind,
        seed: u64,
        runs: usize,
        transcript: Box<dyn TranscriptSink>,
    ) -> Result<Self> {
        let (environment, runner, decisions) = start_run(&config, agent_kind, seed, 0)?;
        Ok(App {
            config,
            agent_kind,
            seed,
            runs: runs.max(1),
            run: 0,
            environment,
            runner,
            decisions,
            transcript,
            outcomes: Vec::new(),
            paused: false,
            should_quit: false,
        })
    }

    /// Advances the simulation unless paused.
    fn tick(&mut self) -> Result<()> {
        if self.paused {
            return Ok(());
        }
        self.step()
    }

    /// Plays one agent turn, or moves on to the next run once this one ended.
    fn step(&mut self) -> Result<()> {
        if !self.runner.state().is_finished() {
            self.runner.advance(
                &mut self.environment,
                &mut self.decisions,
                self.transcript.as_mut(),
            )?;
            if self.runner.state().is_finished() {
                let outcome = self.runner.outcome(&self.environment);
                info!(
                    run = self.run,
                    state = ?outcome.state,
                    score = outcome.score,
                    episodes = outcome.episodes_played,
                    "Run finished"
                );
                self.outcomes.push(outcome);
            }
            return Ok(());
        }

        if self.run + 1 < self.runs {
            self.run += 1;
            let (environment, runner, decisions) =
                start_run(&self.config, self.agent_kind, self.seed, self.run)?;
            self.environment = environment;
            self.runner = runner;
            self.decisions = decisions;
        }
        Ok(())
    }

    fn toggle_pause(&mut self) {
        self.paused = !self.paused;
    }

    /// Sets the quit flag.
    fn quit(&mut self) {
        self.should_quit = true;
    }
}

fn start_run(
    config: &EnvConfig,
    agent_kind: AgentKind,
    seed: u64,
    run: usize,
) -> Result<(Environment, EpisodeRunner, Driver)> {
    let seed = run_seed(seed, run);
    let mut rng = StdRng::seed_from_u64(seed);
    let mut environment = config
        .instantiate(&mut rng)
        .with_context(|| format!("Failed to instantiate run {} of {}", run, config.name()))?;
    let runner = EpisodeRunner::new(&mut environment);
    Ok((environment, runner, agent_kind.driver(seed)))
}

fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();
    init_tracing(args.log_file.as_deref(), args.headless)?;

    if !args.config.exists() {
        return Err(anyhow::anyhow!(
            "Config file does not exist: {}",
            args.config.display()
        ));
    }
    let mut config = EnvConfig::from_file(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;
    if let Some(kind) = args.termination {
        config.set_termination(kind)?;
    }

    let seed = args.seed.unwrap_or_else(rand::random);
    let mut transcript: Box<dyn TranscriptSink> = match &args.transcript {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("Failed to create {}", path.display()))?;
            Box::new(JsonlTranscript::new(BufWriter::new(file)))
        }
        None => Box::new(NullTranscript),
    };
    info!(config = config.name(), seed, runs = args.runs, agent = ?args.agent, "Starting");

    if args.headless {
        let agent_kind = args.agent;
        let report = run_benchmark(
            &config,
            args.runs,
            seed,
            |run, _| agent_kind.driver(run_seed(seed, run)),
            transcript.as_mut(),
        )?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    // Create the application state before touching the terminal so config
    // errors print normally.
    let mut app = App::new(config, args.agent, seed, args.runs, transcript)?;

    // Set up the terminal
    let mut terminal = setup_terminal()?;

    // Run the main application loop
    let result = run_app(&mut terminal, &mut app, Duration::from_millis(args.tick_ms));

    // Restore the terminal state
    restore_terminal(&mut terminal)?;

    result
}

/// Logs go to stderr when headless. While drawing, the terminal belongs to
/// the UI, so logs are written only when a log file is given.
fn init_tracing(log_file: Option<&Path>, headless: bool) -> Result<()> {
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match log_file {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("Failed to create log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter())
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
        }
        None if headless => {
            tracing_subscriber::fmt()
                .with_env_filter(filter())
                .with_writer(io::stderr)
                .init();
        }
        None => {}
    }
    Ok(())
}

/// Configures the terminal for TUI interaction.
fn setup_terminal() -> Result<Terminal<CrosstermBackend<Stdout>>> {
    let mut stdout = io::stdout();
    enable_raw_mode()?;
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    Terminal::new(backend).map_err(Into::into)
}

/// Restores the terminal to its original state.
fn restore_terminal(terminal: &mut Terminal<CrosstermBackend<Stdout>>) -> Result<()> {
    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        DisableMouseCapture
    )?;
    terminal.show_cursor()?;
    Ok(())
}

/// Runs the main loop of the TUI application.
fn run_app(
    terminal: &mut Terminal<CrosstermBackend<Stdout>>,
    app: &mut App,
    tick_rate: Duration,
) -> Result<()> {
    let mut last_tick = Instant::now();

    loop {
        // Draw the UI
        terminal.draw(|f| ui(f, app))?;

        // Calculate timeout for event polling
        let timeout = tick_rate
            .checked_sub(last_tick.elapsed())
            .unwrap_or_else(|| Duration::from_secs(0));

        // Poll for events (keyboard, mouse, etc.)
        if crossterm::event::poll(timeout)? {
            if let Event::Key(key) = event::read()? {
                match key.code {
                    KeyCode::Char('q') | KeyCode::Esc => app.quit(),
                    KeyCode::Char(' ') => app.toggle_pause(),
                    KeyCode::Char('s') if app.paused => app.step()?,
                    _ => {}
                }
            }
        }

        // Update application state if enough time has passed
        if last_tick.elapsed() >= tick_rate {
            app.tick()?;
            last_tick = Instant::now();
        }

        // Exit loop if requested
        if app.should_quit {
            break;
        }
    }
    Ok(())
}

/// Renders the user interface.
fn ui(frame: &mut Frame, app: &App) {
    let main_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage(70), // Map and status
            Constraint::Percentage(20), // Group messages
            Constraint::Percentage(10), // Help
        ])
        .split(frame.area());
    let top_layout = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(60), Constraint::Percentage(40)])
        .split(main_layout[0]);

    render_map(frame, top_layout[0], &app.environment);
    render_status(frame, top_layout[1], app);
    render_messages(frame, main_layout[1], &app.environment);

    let help = if app.paused {
        "Paused. 'space' resumes, 's' plays one turn, 'q' or 'Esc' quits."
    } else {
        "Press 'space' to pause, 'q' or 'Esc' to quit."
    };
    let help_text = Paragraph::new(help)
        .alignment(Alignment::Center)
        .block(Block::default().borders(Borders::TOP));
    frame.render_widget(help_text, main_layout[2]);
}

fn state_label(state: RunState) -> &'static str {
    match state {
        RunState::Running => "running",
        RunState::Terminated => "goal reached",
        RunState::EpisodeBudgetExhausted => "out of episodes",
    }
}

/// Renders run progress and every agent's position and load.
fn render_status(frame: &mut Frame, area: Rect, app: &App) {
    let environment = &app.environment;
    let episode = (app.runner.episode() + 1).min(environment.max_episodes());
    let mut items = vec![
        ListItem::new(format!("Environment: {}", environment.name())),
        ListItem::new(format!(
            "Run: {}/{}  Seed: {}",
            app.run + 1,
            app.runs,
            app.seed
        )),
        ListItem::new(format!(
            "Episode: {}/{}",
            episode,
            environment.max_episodes()
        )),
        ListItem::new(format!("Score: {:.1}", environment.score())),
        ListItem::new(Line::from(vec![
            Span::raw("State: "),
            Span::styled(
                state_label(app.runner.state()),
                match app.runner.state() {
                    RunState::Running => Style::default().fg(Color::Yellow),
                    RunState::Terminated => Style::default().fg(Color::Green).bold(),
                    RunState::EpisodeBudgetExhausted => Style::default().fg(Color::Red),
                },
            ),
        ])),
        ListItem::new(format!(
            "Termination: {}",
            environment.termination_name().unwrap_or("none")
        )),
    ];
    if !app.outcomes.is_empty() {
        let successes = app
            .outcomes
            .iter()
            .filter(|outcome| outcome.state == RunState::Terminated)
            .count();
        items.push(ListItem::new(format!(
            "Solved: {}/{}",
            successes,
            app.outcomes.len()
        )));
    }
    items.push(ListItem::new(""));

    let next = app.runner.next_agent(environment);
    for agent in environment.agents() {
        let marker = if Some(agent.id) == next { ">" } else { " " };
        let mut spans = vec![Span::styled(
            format!(
                "{}{} {} steps: {}",
                marker,
                agent.name,
                agent.position(),
                agent.steps_taken
            ),
            Style::default(),
        )];
        if let Some(item) = agent.held_item() {
            spans.push(Span::styled(
                format!(" holding {}", item),
                Style::default().fg(Color::Red),
            ));
        }
        items.push(ListItem::new(Line::from(spans)));
    }

    let status =
        List::new(items).block(Block::default().borders(Borders::ALL).title("Status"));
    frame.render_widget(status, area);
}

/// Renders the most recent broadcasts that fit.
fn render_messages(frame: &mut Frame, area: Rect, environment: &Environment) {
    let visible = area.height.saturating_sub(2) as usize;
    let messages = environment.group_messages();
    let items: Vec<ListItem> = messages
        .iter()
        .skip(messages.len().saturating_sub(visible))
        .map(|message| {
            ListItem::new(Line::from(vec![
                Span::styled(
                    format!("{}: ", message.sender_name),
                    Style::default().fg(Color::Cyan).bold(),
                ),
                Span::raw(message.content.clone()),
            ]))
        })
        .collect();
    let widget =
        List::new(items).block(Block::default().borders(Borders::ALL).title("Messages"));
    frame.render_widget(widget, area);
}

fn cell_span(cell: &Cell, environment: &Environment) -> Span<'static> {
    let base = if cell.has_target() {
        Style::default().bg(Color::Blue)
    } else {
        Style::default()
    };
    if cell.obstacle {
        return Span::styled("#", base.fg(Color::DarkGray));
    }
    if let Some(id) = cell.agents().iter().next() {
        let label = match cell.agents().len() {
            1 => environment
                .agent(*id)
                .and_then(|agent| agent.name.chars().next())
                .map(String::from)
                .unwrap_or_else(|| "@".to_string()),
            crowd => crowd.to_string(),
        };
        return Span::styled(label, base.fg(Color::Yellow).bold());
    }
    if cell.has_carryable() {
        return Span::styled("*", base.fg(Color::Red));
    }
    if cell.has_target() {
        return Span::styled("o", base.fg(Color::White));
    }
    Span::styled(".", base.fg(Color::DarkGray))
}

/// Renders the environment map onto the frame with north at the top.
fn render_map(frame: &mut Frame, area: Rect, environment: &Environment) {
    let grid = environment.grid();
    let mut lines: Vec<Line> = Vec::with_capacity(grid.height());

    // Row 0 is the southern edge, so rows are drawn from the top down.
    for y in (0..grid.height()).rev() {
        let mut spans: Vec<Span> = Vec::with_capacity(grid.width() * 2);
        for x in 0..grid.width() {
            if let Some(cell) = grid.cell(Position::new(x, y)) {
                spans.push(cell_span(cell, environment));
                spans.push(Span::raw(" "));
            }
        }
        lines.push(Line::from(spans));
    }

    let map_paragraph = Paragraph::new(lines)
        .block(
            Block::default()
                .title(environment.name().to_string())
                .borders(Borders::ALL),
        )
        .alignment(Alignment::Center);

    frame.render_widget(map_paragraph, area);
}
