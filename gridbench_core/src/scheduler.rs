//! Turn scheduler: every agent acts once per episode, in roster order, until
//! the termination condition holds or the episode budget runs out.

use std::collections::HashMap;

use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    EntityId, Position,
    agent::{AgentView, DecisionSource},
    environment::{Environment, EnvironmentError},
    transcript::{Role, TranscriptEntry, TranscriptSink},
};

/// Observation an agent gets back when its decision names no usable action.
pub const INVALID_ACTION_OBSERVATION: &str = "Invalid action.";

/// Observation shown on an agent's first turn, before it has acted.
pub const START_OBSERVATION: &str = "The run has started. You have not acted yet.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Running,
    Terminated,
    EpisodeBudgetExhausted,
}

impl RunState {
    pub fn is_finished(&self) -> bool {
        !matches!(self, RunState::Running)
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Environment(#[from] EnvironmentError),
}

/// Per-agent figures at the end of a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentStats {
    pub id: EntityId,
    pub name: String,
    pub steps_taken: usize,
    pub score: f64,
    pub messages_sent: Vec<String>,
    pub final_position: Position,
}

/// How a run ended. Budget exhaustion is a normal outcome, not an error.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub environment: String,
    pub state: RunState,
    pub episodes_played: usize,
    pub score: f64,
    pub agents: Vec<AgentStats>,
}

/// Drives one [`Environment`] from its first turn to a terminal [`RunState`].
#[derive(Debug, Clone)]
pub struct EpisodeRunner {
    run_id: Uuid,
    state: RunState,
    episode: usize,
    /// Index into the turn order of the agent acting next.
    cursor: usize,
    observations: HashMap<EntityId, String>,
    started: bool,
}

impl EpisodeRunner {
    /// Prepares `env` for a run: counters are zeroed and stale messages dropped.
    pub fn new(env: &mut Environment) -> Self {
        Self::with_run_id(env, Uuid::new_v4())
    }

    pub fn with_run_id(env: &mut Environment, run_id: Uuid) -> Self {
        env.reset_bookkeeping();
        let observations = env
            .agents()
            .map(|agent| (agent.id, START_OBSERVATION.to_string()))
            .collect();
        EpisodeRunner {
            run_id,
            state: RunState::Running,
            episode: 0,
            cursor: 0,
            observations,
            started: false,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Zero-based index of the current episode.
    pub fn episode(&self) -> usize {
        self.episode
    }

    /// Agent whose turn comes next, if the run is still going.
    pub fn next_agent(&self, env: &Environment) -> Option<EntityId> {
        if self.state.is_finished() {
            return None;
        }
        env.turn_order().get(self.cursor).copied()
    }

    /// Latest observation shown to `agent_id`.
    pub fn observation(&self, agent_id: EntityId) -> Option<&str> {
        self.observations.get(&agent_id).map(String::as_str)
    }

    /// Runs until the environment terminates or the episode budget is spent.
    pub fn run<D, S>(
        &mut self,
        env: &mut Environment,
        decisions: &mut D,
        transcript: &mut S,
    ) -> Result<RunOutcome, RunError>
    where
        D: DecisionSource + ?Sized,
        S: TranscriptSink + ?Sized,
    {
        info!(
            env = env.name(),
            run_id = %self.run_id,
            agents = env.agent_count(),
            max_episodes = env.max_episodes(),
            "Run started"
        );
        while !self.advance(env, decisions, transcript)?.is_finished() {}

        let outcome = self.outcome(env);
        info!(
            env = env.name(),
            run_id = %self.run_id,
            state = ?outcome.state,
            episodes = outcome.episodes_played,
            score = outcome.score,
            "Run finished"
        );
        Ok(outcome)
    }

    /// Plays exactly one agent turn and returns the resulting state.
    pub fn advance<D, S>(
        &mut self,
        env: &mut Environment,
        decisions: &mut D,
        transcript: &mut S,
    ) -> Result<RunState, RunError>
    where
        D: DecisionSource + ?Sized,
        S: TranscriptSink + ?Sized,
    {
        if self.state.is_finished() {
            return Ok(self.state);
        }
        if env.terminated() {
            self.state = RunState::Terminated;
            return Ok(self.state);
        }
        if self.episode >= env.max_episodes() {
            self.state = RunState::EpisodeBudgetExhausted;
            return Ok(self.state);
        }
        if !self.started {
            self.started = true;
            self.record_goals(env, transcript);
        }

        if self.cursor == 0 {
            debug!(env = env.name(), episode = self.episode + 1, "Episode started");
        }
        if let Some(agent_id) = env.turn_order().get(self.cursor).copied() {
            self.take_turn(env, agent_id, decisions, transcript)?;
            self.cursor += 1;
        }

        if env.terminated() {
            self.state = RunState::Terminated;
        } else if self.cursor >= env.agent_count() {
            self.cursor = 0;
            self.episode += 1;
            if self.episode >= env.max_episodes() {
                self.state = RunState::EpisodeBudgetExhausted;
            }
        }
        Ok(self.state)
    }

    fn take_turn<D, S>(
        &mut self,
        env: &mut Environment,
        agent_id: EntityId,
        decisions: &mut D,
        transcript: &mut S,
    ) -> Result<(), RunError>
    where
        D: DecisionSource + ?Sized,
        S: TranscriptSink + ?Sized,
    {
        let inbox = env
            .agent_mut(agent_id)
            .map(|agent| agent.inbox_mut().drain())
            .ok_or(EnvironmentError::UnknownAgent(agent_id))?;
        let observation = self.observations.remove(&agent_id).unwrap_or_default();

        let decision = {
            let agent = env
                .agent(agent_id)
                .ok_or(EnvironmentError::UnknownAgent(agent_id))?;
            let view = AgentView {
                agent,
                episode: self.episode,
                observation: &observation,
                inbox: &inbox,
                score: env.score(),
                actions: env.actions(),
                grid: env.grid(),
            };
            self.record(env, agent_id, Role::User, view.render(), transcript);
            decisions.decide(&view)
        };
        let reply = serde_json::to_string(&decision).unwrap_or_default();
        self.record(env, agent_id, Role::Assistant, reply, transcript);

        if let Some(message) = decision.broadcast() {
            env.broadcast(agent_id, message)?;
        }

        let next_observation = match decision.action() {
            Some(action) => env.step(agent_id, action)?.observation,
            None => {
                debug!(
                    env = env.name(),
                    agent_id,
                    action = ?decision.action_name,
                    "Decision without a usable action"
                );
                INVALID_ACTION_OBSERVATION.to_string()
            }
        };

        let score = env.score();
        if let Some(agent) = env.agent_mut(agent_id) {
            agent.steps_taken += 1;
            agent.score = score;
        }
        self.observations.insert(agent_id, next_observation);
        Ok(())
    }

    fn record_goals<S>(&self, env: &Environment, transcript: &mut S)
    where
        S: TranscriptSink + ?Sized,
    {
        let goal = env
            .variables()
            .get("unified_goal")
            .and_then(|goal| goal.as_str())
            .map(str::to_string);
        let Some(goal) = goal else {
            return;
        };
        let names = env.actions().describe();
        for agent_id in env.turn_order() {
            let content = format!("{}\nAvailable actions: {}", goal, names);
            self.record(env, *agent_id, Role::System, content, transcript);
        }
    }

    fn record<S>(
        &self,
        env: &Environment,
        agent_id: EntityId,
        role: Role,
        content: String,
        transcript: &mut S,
    ) where
        S: TranscriptSink + ?Sized,
    {
        let entry = TranscriptEntry {
            environment: env.name().to_string(),
            run_id: self.run_id,
            episode: self.episode,
            agent_id,
            role,
            content,
        };
        if let Err(err) = transcript.record(&entry) {
            warn!(%err, agent_id, "Failed to write transcript entry");
        }
    }

    /// Snapshot of the run so far.
    pub fn outcome(&self, env: &Environment) -> RunOutcome {
        let episodes_played = match self.state {
            RunState::Terminated => self.episode + 1,
            RunState::Running => self.episode,
            RunState::EpisodeBudgetExhausted => env.max_episodes(),
        }
        .min(env.max_episodes());
        RunOutcome {
            run_id: self.run_id,
            environment: env.name().to_string(),
            state: self.state,
            episodes_played,
            score: env.score(),
            agents: env
                .agents()
                .map(|agent| AgentStats {
                    id: agent.id,
                    name: agent.name.clone(),
                    steps_taken: agent.steps_taken,
                    score: agent.score,
                    messages_sent: agent.messages_sent().to_vec(),
                    final_position: agent.position(),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        agent::{Decision, ScriptedDecisions},
        environment::Action,
        termination::{CornerOccupancy, SingleTarget},
        transcript::{MemoryTranscript, NullTranscript},
    };

    fn corners_env() -> Environment {
        let mut env = Environment::new("corners", 3, 3).unwrap();
        env.add_agent("Alice", Position::new(0, 1)).unwrap();
        env.add_agent("Bob", Position::new(2, 1)).unwrap();
        env.add_agent("Carol", Position::new(1, 2)).unwrap();
        env.add_agent("Dave", Position::new(1, 0)).unwrap();
        env.set_termination(CornerOccupancy).unwrap();
        env.set_max_episodes(5);
        env
    }

    #[test]
    fn budget_exhaustion_is_a_clean_outcome() {
        let mut env = corners_env();
        let mut runner = EpisodeRunner::new(&mut env);
        let outcome = runner
            .run(&mut env, &mut ScriptedDecisions::new(), &mut NullTranscript)
            .unwrap();
        assert_eq!(outcome.state, RunState::EpisodeBudgetExhausted);
        assert_eq!(outcome.episodes_played, 5);
        assert!(outcome.agents.iter().all(|agent| agent.steps_taken == 5));
    }

    #[test]
    fn the_last_agent_in_the_roster_can_end_the_run() {
        let mut env = corners_env();
        let mut script = ScriptedDecisions::new();
        script
            .push_actions(0, [Action::South])
            .push_actions(1, [Action::North])
            .push_actions(2, [Action::West])
            .push_actions(3, [Action::West, Action::East, Action::East]);

        let mut runner = EpisodeRunner::new(&mut env);
        let outcome = runner
            .run(&mut env, &mut script, &mut NullTranscript)
            .unwrap();
        // Dave detours through Alice's corner and reaches (2, 0) on his third turn.
        assert_eq!(outcome.state, RunState::Terminated);
        assert_eq!(outcome.score, 100.0);
        assert_eq!(outcome.episodes_played, 3);
        let turns: Vec<EntityId> = script.seen.iter().map(|turn| turn.0).collect();
        assert_eq!(turns, vec![0, 1, 2, 3, 0, 1, 2, 3, 0, 1, 2, 3]);
        assert_eq!(runner.next_agent(&env), None);
    }

    #[test]
    fn agents_after_the_terminating_one_never_act_in_that_episode() {
        let mut env = Environment::new("corners", 3, 3).unwrap();
        env.add_agent("Alice", Position::new(1, 0)).unwrap();
        env.add_agent("Bob", Position::new(0, 1)).unwrap();
        env.add_agent("Carol", Position::new(2, 1)).unwrap();
        env.add_agent("Dave", Position::new(1, 2)).unwrap();
        env.set_termination(CornerOccupancy).unwrap();
        env.set_max_episodes(5);

        let mut script = ScriptedDecisions::new();
        script
            .push_actions(0, [Action::Skip, Action::East])
            .push_actions(1, [Action::South, Action::East])
            .push_actions(2, [Action::North, Action::West])
            .push_actions(3, [Action::West, Action::East]);

        let mut runner = EpisodeRunner::new(&mut env);
        let outcome = runner
            .run(&mut env, &mut script, &mut NullTranscript)
            .unwrap();
        // Three corners are held after the first episode; Alice takes (2, 0)
        // on the first turn of the second.
        assert_eq!(outcome.state, RunState::Terminated);
        assert_eq!(outcome.episodes_played, 2);
        let turns: Vec<(EntityId, usize)> =
            script.seen.iter().map(|turn| (turn.0, turn.1)).collect();
        assert_eq!(turns, vec![(0, 0), (1, 0), (2, 0), (3, 0), (0, 1)]);

        assert_eq!(env.agent(1).unwrap().position(), Position::new(0, 0));
        assert_eq!(env.agent(2).unwrap().position(), Position::new(2, 2));
        assert_eq!(env.agent(3).unwrap().position(), Position::new(0, 2));
        let steps: Vec<usize> = outcome.agents.iter().map(|a| a.steps_taken).collect();
        assert_eq!(steps, vec![2, 1, 1, 1]);
        assert_eq!(runner.next_agent(&env), None);
    }

    #[test]
    fn first_turn_shows_the_position_once() {
        let mut env = corners_env();
        let mut script = ScriptedDecisions::new();
        let mut transcript = MemoryTranscript::new();
        let mut runner = EpisodeRunner::new(&mut env);
        assert_eq!(runner.observation(0), Some(START_OBSERVATION));
        runner
            .advance(&mut env, &mut script, &mut transcript)
            .unwrap();
        let prompt = &transcript.entries[0].content;
        assert_eq!(prompt.matches("Your current position is").count(), 1);
        assert!(prompt.starts_with(&format!(
            "Your current position is: (0, 1)\n{}",
            START_OBSERVATION
        )));
    }

    #[test]
    fn invalid_decisions_become_an_invalid_action_observation() {
        let mut env = corners_env();
        let mut script = ScriptedDecisions::new();
        script.push(0, Decision::default());
        script.push(0, Decision::act(Action::Skip));
        let mut runner = EpisodeRunner::new(&mut env);
        for _ in 0..4 {
            runner
                .advance(&mut env, &mut script, &mut NullTranscript)
                .unwrap();
        }
        assert_eq!(runner.observation(0), Some(INVALID_ACTION_OBSERVATION));
        runner
            .advance(&mut env, &mut script, &mut NullTranscript)
            .unwrap();
        assert_eq!(runner.observation(0), Some("You skipped your turn."));
    }

    #[test]
    fn messages_reach_others_once_and_never_the_sender() {
        let mut env = corners_env();
        let mut script = ScriptedDecisions::new();
        script.push(0, Decision::act(Action::Skip).with_message("I take (0, 0)"));
        let mut runner = EpisodeRunner::new(&mut env);
        let mut transcript = NullTranscript;

        runner.advance(&mut env, &mut script, &mut transcript).unwrap();
        assert!(env.agent(0).unwrap().inbox().is_empty());
        for id in 1..4 {
            assert_eq!(env.agent(id).unwrap().inbox().len(), 1);
        }

        for _ in 0..4 {
            runner.advance(&mut env, &mut script, &mut transcript).unwrap();
        }
        let delivered: Vec<usize> = script.seen.iter().map(|turn| turn.3.len()).collect();
        assert_eq!(delivered, vec![0, 1, 1, 1, 0]);
        assert!(env.agents().all(|agent| agent.inbox().is_empty()));
        assert_eq!(env.group_messages().len(), 1);
        assert_eq!(
            env.agent(0).unwrap().messages_sent(),
            &["I take (0, 0)".to_string()]
        );
    }

    #[test]
    fn transcript_records_goal_prompt_and_reply() {
        let mut env = Environment::new("solo", 3, 3).unwrap();
        env.add_agent("Alice", Position::new(0, 0)).unwrap();
        env.set_termination(SingleTarget::new(Position::new(0, 1)))
            .unwrap();
        env.grid_mut()
            .variables
            .insert("unified_goal".into(), "Reach (0, 1).".into());
        env.set_max_episodes(3);

        let mut script = ScriptedDecisions::new();
        script.push_actions(0, [Action::North]);
        let mut transcript = MemoryTranscript::new();
        let mut runner = EpisodeRunner::new(&mut env);
        let outcome = runner.run(&mut env, &mut script, &mut transcript).unwrap();

        assert_eq!(outcome.state, RunState::Terminated);
        let roles: Vec<Role> = transcript.for_agent(0).map(|e| e.role).collect();
        assert_eq!(roles, vec![Role::System, Role::User, Role::Assistant]);
        assert!(transcript.entries[0].content.starts_with("Reach (0, 1)."));
        assert!(
            transcript.entries[1]
                .content
                .starts_with("Your current position is: (0, 0)")
        );
        assert!(transcript.entries[2].content.contains("\"north\""));
        assert!(
            transcript
                .entries
                .iter()
                .all(|e| e.run_id == runner.run_id())
        );
    }

    #[test]
    fn zero_budget_never_asks_for_a_decision() {
        let mut env = corners_env();
        env.set_max_episodes(0);
        let mut script = ScriptedDecisions::new();
        let mut runner = EpisodeRunner::new(&mut env);
        let outcome = runner.run(&mut env, &mut script, &mut NullTranscript).unwrap();
        assert_eq!(outcome.state, RunState::EpisodeBudgetExhausted);
        assert!(script.seen.is_empty());
    }
}
