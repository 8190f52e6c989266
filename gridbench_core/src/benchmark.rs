//! Repeated runs of one description, each on a freshly instantiated environment.

use rand::{SeedableRng, rngs::StdRng};
use serde::Serialize;
use tracing::info;

use crate::{
    agent::DecisionSource,
    config::{ConfigError, EnvConfig},
    environment::Environment,
    scheduler::{EpisodeRunner, RunError, RunOutcome, RunState},
    transcript::TranscriptSink,
};

#[derive(Debug, thiserror::Error)]
pub enum BenchmarkError {
    #[error("run {run} could not be instantiated: {source}")]
    Config {
        run: usize,
        #[source]
        source: ConfigError,
    },
    #[error("run {run} failed: {source}")]
    Run {
        run: usize,
        #[source]
        source: RunError,
    },
}

/// Aggregate figures over all runs of a benchmark.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BenchmarkReport {
    pub environment: String,
    pub seed: u64,
    pub termination: Option<String>,
    pub successes: usize,
    pub success_rate: f64,
    pub mean_score: f64,
    pub mean_episodes: f64,
    pub runs: Vec<RunOutcome>,
}

impl BenchmarkReport {
    pub fn new(
        environment: impl Into<String>,
        seed: u64,
        termination: Option<String>,
        runs: Vec<RunOutcome>,
    ) -> Self {
        let count = runs.len().max(1) as f64;
        let successes = runs
            .iter()
            .filter(|run| run.state == RunState::Terminated)
            .count();
        BenchmarkReport {
            environment: environment.into(),
            seed,
            termination,
            successes,
            success_rate: if runs.is_empty() {
                0.0
            } else {
                successes as f64 / count
            },
            mean_score: runs.iter().map(|run| run.score).sum::<f64>() / count,
            mean_episodes: runs.iter().map(|run| run.episodes_played as f64).sum::<f64>() / count,
            runs,
        }
    }
}

/// Run `i` draws its random variables and start positions from `seed + i`,
/// so a benchmark is reproducible run by run.
pub fn run_seed(seed: u64, run: usize) -> u64 {
    seed.wrapping_add(run as u64)
}

/// Plays `runs` independent runs of `config`. `make_decisions` builds the
/// decision source of each run once its environment exists.
pub fn run_benchmark<F, D, S>(
    config: &EnvConfig,
    runs: usize,
    seed: u64,
    mut make_decisions: F,
    transcript: &mut S,
) -> Result<BenchmarkReport, BenchmarkError>
where
    F: FnMut(usize, &Environment) -> D,
    D: DecisionSource,
    S: TranscriptSink + ?Sized,
{
    let mut outcomes = Vec::with_capacity(runs);
    let mut termination = None;
    for run in 0..runs {
        let mut rng = StdRng::seed_from_u64(run_seed(seed, run));
        let mut env = config
            .instantiate(&mut rng)
            .map_err(|source| BenchmarkError::Config { run, source })?;
        if termination.is_none() {
            termination = env.termination_name().map(str::to_string);
        }

        let mut decisions = make_decisions(run, &env);
        let mut runner = EpisodeRunner::new(&mut env);
        let outcome = runner
            .run(&mut env, &mut decisions, transcript)
            .map_err(|source| BenchmarkError::Run { run, source })?;
        outcomes.push(outcome);
    }

    let report = BenchmarkReport::new(config.name(), seed, termination, outcomes);
    info!(
        env = %report.environment,
        runs,
        successes = report.successes,
        mean_score = report.mean_score,
        "Benchmark finished"
    );
    Ok(report)
}
