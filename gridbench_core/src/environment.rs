use std::{
    collections::{BTreeSet, HashMap},
    fmt,
    str::FromStr,
    sync::Arc,
};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::{
    EntityId, Item, Position,
    agent::{AgentState, Message},
    map::{Grid, GridError},
    termination::{Evaluation, TerminationCondition},
};

pub const TERMINATION_OBSERVATION: &str = "The environment has reached a termination condition.";

/// Represents one square of the environment grid.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Cell {
    pub obstacle: bool,
    /// Items resting here; the last one is on top and is picked up first.
    pub items: Vec<Item>,
    /// Agents standing here. Only [`Environment::move_agent`] and
    /// [`Environment::add_agent`] write this set.
    agents: BTreeSet<EntityId>,
}

impl Cell {
    pub fn new(obstacle: bool, items: Vec<Item>) -> Self {
        Cell {
            obstacle,
            items,
            agents: BTreeSet::new(),
        }
    }

    pub fn agents(&self) -> &BTreeSet<EntityId> {
        &self.agents
    }

    pub fn top_item(&self) -> Option<&Item> {
        self.items.last()
    }

    pub fn has_target(&self) -> bool {
        self.items.iter().any(Item::is_target)
    }

    pub fn has_carryable(&self) -> bool {
        self.items.iter().any(Item::is_carryable)
    }
}

/// The cell grid plus the shared variables scoring functions and prompts read.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GridState {
    cells: Grid<Cell>,
    /// Goal text, target lists and other free-form values.
    pub variables: Map<String, Value>,
}

impl GridState {
    pub fn new(width: usize, height: usize) -> Result<Self, GridError> {
        Ok(GridState {
            cells: Grid::new(width, height)?,
            variables: Map::new(),
        })
    }

    pub fn width(&self) -> usize {
        self.cells.width()
    }

    pub fn height(&self) -> usize {
        self.cells.height()
    }

    pub fn cells(&self) -> &Grid<Cell> {
        &self.cells
    }

    pub fn contains(&self, position: Position) -> bool {
        self.cells.contains(position)
    }

    pub fn get(&self, x: usize, y: usize) -> Result<&Cell, GridError> {
        self.cells
            .get(x, y)
            .ok_or_else(|| self.cells.out_of_bounds(x, y))
    }

    /// Replaces the obstacle flag and items of a cell. Agents standing in the
    /// cell stay where they are.
    pub fn set(&mut self, x: usize, y: usize, cell: Cell) -> Result<(), GridError> {
        let out_of_bounds = self.cells.out_of_bounds(x, y);
        let current = self.cells.get_mut(x, y).ok_or(out_of_bounds)?;
        current.obstacle = cell.obstacle;
        current.items = cell.items;
        Ok(())
    }

    pub fn cell(&self, position: Position) -> Option<&Cell> {
        self.cells.get(position.x, position.y)
    }

    fn cell_mut(&mut self, position: Position) -> Result<&mut Cell, GridError> {
        let out_of_bounds = self.cells.out_of_bounds(position.x, position.y);
        self.cells
            .get_mut(position.x, position.y)
            .ok_or(out_of_bounds)
    }

    /// Puts `item` on top of the cell at `position`.
    pub fn place_item(&mut self, position: Position, item: Item) -> Result<(), GridError> {
        self.cell_mut(position)?.items.push(item);
        Ok(())
    }

    pub fn set_obstacle(&mut self, position: Position, obstacle: bool) -> Result<(), GridError> {
        self.cell_mut(position)?.obstacle = obstacle;
        Ok(())
    }

    /// Adds a target marker below any items at `position` unless one is already there.
    pub fn ensure_target_marker(&mut self, position: Position) -> Result<(), GridError> {
        let cell = self.cell_mut(position)?;
        if !cell.has_target() {
            cell.items.insert(0, Item::target());
        }
        Ok(())
    }

    /// The distinct corner cells of the grid.
    pub fn corners(&self) -> BTreeSet<Position> {
        let (east, north) = (self.width() - 1, self.height() - 1);
        BTreeSet::from([
            Position::new(0, 0),
            Position::new(east, 0),
            Position::new(0, north),
            Position::new(east, north),
        ])
    }
}

/// Represents actions an agent can decide to take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    North,
    South,
    East,
    West,
    Pick,
    Drop,
    Skip,
}

impl Action {
    pub const ALL: [Action; 7] = [
        Action::North,
        Action::South,
        Action::East,
        Action::West,
        Action::Pick,
        Action::Drop,
        Action::Skip,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Action::North => "north",
            Action::South => "south",
            Action::East => "east",
            Action::West => "west",
            Action::Pick => "pick",
            Action::Drop => "drop",
            Action::Skip => "skip",
        }
    }

    /// Offset of a movement action, `None` for the others.
    pub fn delta(&self) -> Option<(isize, isize)> {
        match self {
            Action::North => Some((0, 1)),
            Action::South => Some((0, -1)),
            Action::East => Some((1, 0)),
            Action::West => Some((-1, 0)),
            Action::Pick | Action::Drop | Action::Skip => None,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown action '{0}'")]
pub struct UnknownAction(pub String);

impl FromStr for Action {
    type Err = UnknownAction;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_ascii_lowercase();
        Action::ALL
            .into_iter()
            .find(|action| action.name() == name)
            .ok_or_else(|| UnknownAction(s.to_string()))
    }
}

/// The subset of [`Action::ALL`] an environment allows, in declaration order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionSet(Vec<Action>);

impl ActionSet {
    pub fn new(actions: impl IntoIterator<Item = Action>) -> Self {
        let mut declared = Vec::new();
        for action in actions {
            if !declared.contains(&action) {
                declared.push(action);
            }
        }
        ActionSet(declared)
    }

    pub fn contains(&self, action: Action) -> bool {
        self.0.contains(&action)
    }

    pub fn iter(&self) -> impl Iterator<Item = Action> + '_ {
        self.0.iter().copied()
    }

    pub fn as_slice(&self) -> &[Action] {
        &self.0
    }

    /// Renders the set as `[north, south, ...]` for observations.
    pub fn describe(&self) -> String {
        let names: Vec<&str> = self.0.iter().map(Action::name).collect();
        format!("[{}]", names.join(", "))
    }
}

impl Default for ActionSet {
    fn default() -> Self {
        ActionSet(Action::ALL.to_vec())
    }
}

/// What one call to [`Environment::step`] produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepResult {
    pub observation: String,
    pub score: f64,
    pub terminated: bool,
}

/// Setup-time failures. Agent mistakes during a run are observations, not errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EnvironmentError {
    #[error(transparent)]
    Grid(#[from] GridError),
    #[error("environment '{0}' must have a termination condition before its first step")]
    MissingTermination(String),
    #[error("agent {0} does not exist")]
    UnknownAgent(EntityId),
    #[error("agent name '{0}' is already in use")]
    DuplicateName(String),
    #[error("cannot place agent on obstacle at {0}")]
    BlockedStart(Position),
}

/// One run of an environment: grid, agent roster, scoring function and budget.
#[derive(Debug, Clone)]
pub struct Environment {
    name: String,
    grid: GridState,
    agents: HashMap<EntityId, AgentState>,
    /// Roster in insertion order; this is the turn order.
    turn_order: Vec<EntityId>,
    next_entity_id: EntityId,
    actions: ActionSet,
    max_episodes: usize,
    score: f64,
    terminated: bool,
    group_messages: Vec<Message>,
    termination: Option<Arc<dyn TerminationCondition>>,
}

impl Environment {
    /// Creates a new, empty environment.
    pub fn new(name: impl Into<String>, width: usize, height: usize) -> Result<Self, GridError> {
        Ok(Environment {
            name: name.into(),
            grid: GridState::new(width, height)?,
            agents: HashMap::new(),
            turn_order: Vec::new(),
            next_entity_id: 0,
            actions: ActionSet::default(),
            max_episodes: 0,
            score: 0.0,
            terminated: false,
            group_messages: Vec::new(),
            termination: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn grid(&self) -> &GridState {
        &self.grid
    }

    /// Setup access to cells and variables. Occupancy stays private to the
    /// environment, so this cannot break the agent/cell bookkeeping.
    pub fn grid_mut(&mut self) -> &mut GridState {
        &mut self.grid
    }

    pub fn variables(&self) -> &Map<String, Value> {
        &self.grid.variables
    }

    pub fn actions(&self) -> &ActionSet {
        &self.actions
    }

    pub fn set_actions(&mut self, actions: ActionSet) {
        self.actions = actions;
    }

    pub fn max_episodes(&self) -> usize {
        self.max_episodes
    }

    pub fn set_max_episodes(&mut self, max_episodes: usize) {
        self.max_episodes = max_episodes;
    }

    /// Score in `[0, 100]` as last reported by the termination condition.
    pub fn score(&self) -> f64 {
        self.score
    }

    pub fn terminated(&self) -> bool {
        self.terminated
    }

    pub fn group_messages(&self) -> &[Message] {
        &self.group_messages
    }

    pub fn termination_name(&self) -> Option<&str> {
        self.termination.as_deref().map(|condition| condition.name())
    }

    /// Attaches the scoring function, letting it set up any items it needs.
    pub fn set_termination<C>(&mut self, condition: C) -> Result<(), GridError>
    where
        C: TerminationCondition + 'static,
    {
        self.attach_termination(Arc::new(condition))
    }

    /// Same as [`Environment::set_termination`] for an already shared condition.
    pub fn attach_termination(
        &mut self,
        condition: Arc<dyn TerminationCondition>,
    ) -> Result<(), GridError> {
        condition.install(&mut self.grid)?;
        info!(env = %self.name, termination = condition.name(), "Termination condition attached");
        self.termination = Some(condition);
        Ok(())
    }

    /// Adds an agent at `position` and returns its id. Ids follow insertion order.
    pub fn add_agent(
        &mut self,
        name: impl Into<String>,
        position: Position,
    ) -> Result<EntityId, EnvironmentError> {
        let name = name.into();
        let cell = self
            .grid
            .cell(position)
            .ok_or_else(|| self.grid.cells.out_of_bounds(position.x, position.y))?;
        if cell.obstacle {
            return Err(EnvironmentError::BlockedStart(position));
        }
        if self.agents.values().any(|agent| agent.name == name) {
            return Err(EnvironmentError::DuplicateName(name));
        }

        let id = self.next_entity_id;
        self.next_entity_id += 1;
        self.grid.cell_mut(position)?.agents.insert(id);
        self.agents.insert(id, AgentState::new(id, name, position));
        self.turn_order.push(id);
        debug_assert!(self.occupancy_consistent());
        Ok(id)
    }

    pub fn agent(&self, agent_id: EntityId) -> Option<&AgentState> {
        self.agents.get(&agent_id)
    }

    /// Mutable access for bookkeeping (inbox, counters). Position and held
    /// item can only change through the environment.
    pub fn agent_mut(&mut self, agent_id: EntityId) -> Option<&mut AgentState> {
        self.agents.get_mut(&agent_id)
    }

    /// Agent ids in turn order.
    pub fn turn_order(&self) -> &[EntityId] {
        &self.turn_order
    }

    /// Agents in turn order.
    pub fn agents(&self) -> impl Iterator<Item = &AgentState> {
        self.turn_order.iter().filter_map(|id| self.agents.get(id))
    }

    pub fn agent_count(&self) -> usize {
        self.turn_order.len()
    }

    /// Moves an agent, updating both its position and the occupancy of the
    /// old and new cells. Nothing changes if the move fails.
    pub fn move_agent(
        &mut self,
        agent_id: EntityId,
        new_position: Position,
    ) -> Result<(), EnvironmentError> {
        let old_position = self
            .agents
            .get(&agent_id)
            .ok_or(EnvironmentError::UnknownAgent(agent_id))?
            .position;
        if !self.grid.contains(new_position) {
            return Err(self
                .grid
                .cells
                .out_of_bounds(new_position.x, new_position.y)
                .into());
        }

        // Both cells are validated, so the three writes below cannot fail midway.
        self.grid.cells[old_position].agents.remove(&agent_id);
        self.grid.cells[new_position].agents.insert(agent_id);
        if let Some(agent) = self.agents.get_mut(&agent_id) {
            agent.position = new_position;
        }
        debug_assert!(self.occupancy_consistent());
        Ok(())
    }

    /// Checks that every agent is in exactly the cell matching its position.
    pub fn occupancy_consistent(&self) -> bool {
        let agents_match = self.agents.values().all(|agent| {
            self.grid
                .cell(agent.position)
                .is_some_and(|cell| cell.agents.contains(&agent.id))
        });
        let cells_match = self.grid.cells.enumerate().all(|(position, cell)| {
            cell.agents.iter().all(|id| {
                self.agents
                    .get(id)
                    .is_some_and(|agent| agent.position == position)
            })
        });
        agents_match && cells_match
    }

    /// Zeroes per-agent counters and drops stale messages.
    pub fn reset_bookkeeping(&mut self) {
        for agent in self.agents.values_mut() {
            agent.reset_bookkeeping();
        }
        self.group_messages.clear();
    }

    /// Appends `content` to every other agent's inbox and to the group log.
    pub fn broadcast(&mut self, sender: EntityId, content: &str) -> Result<(), EnvironmentError> {
        let sender_name = self
            .agents
            .get(&sender)
            .ok_or(EnvironmentError::UnknownAgent(sender))?
            .name
            .clone();
        let message = Message {
            sender,
            sender_name,
            content: content.to_string(),
        };
        for id in &self.turn_order {
            if *id == sender {
                continue;
            }
            if let Some(agent) = self.agents.get_mut(id) {
                agent.inbox.push(message.clone());
            }
        }
        if let Some(agent) = self.agents.get_mut(&sender) {
            agent.messages_sent.push(message.content.clone());
        }
        debug!(env = %self.name, sender, content, "Message broadcast");
        self.group_messages.push(message);
        Ok(())
    }

    /// Runs the termination condition, records its score and latches
    /// `terminated` on success.
    pub fn evaluate_termination(&mut self) -> Result<Evaluation, EnvironmentError> {
        let condition = self
            .termination
            .clone()
            .ok_or_else(|| EnvironmentError::MissingTermination(self.name.clone()))?;
        let agents: Vec<&AgentState> = self
            .turn_order
            .iter()
            .filter_map(|id| self.agents.get(id))
            .collect();
        let evaluation = condition.evaluate(&mut self.grid, &agents);
        if let Some(score) = evaluation.score {
            self.score = score;
        }
        if evaluation.success && !self.terminated {
            self.terminated = true;
            info!(env = %self.name, score = self.score, "Termination condition reached");
        }
        Ok(evaluation)
    }

    fn result(&self, observation: impl Into<String>) -> StepResult {
        StepResult {
            observation: observation.into(),
            score: self.score,
            terminated: self.terminated,
        }
    }

    /// Parses `action_name` and applies it. Unknown names and actions outside
    /// the environment's set come back as an observation listing valid actions.
    pub fn step_named(
        &mut self,
        agent_id: EntityId,
        action_name: &str,
    ) -> Result<StepResult, EnvironmentError> {
        match action_name.parse::<Action>() {
            Ok(action) => self.step(agent_id, action),
            Err(_) => {
                if self.termination.is_none() {
                    return Err(EnvironmentError::MissingTermination(self.name.clone()));
                }
                Ok(self.result(self.invalid_action(action_name)))
            }
        }
    }

    fn invalid_action(&self, action_name: &str) -> String {
        format!(
            "Invalid action: '{}'. Valid actions are {}.",
            action_name,
            self.actions.describe()
        )
    }

    /// Applies one action for one agent.
    ///
    /// The termination condition runs before the action (a finished run is
    /// never mutated) and again after any action that changed the grid.
    pub fn step(
        &mut self,
        agent_id: EntityId,
        action: Action,
    ) -> Result<StepResult, EnvironmentError> {
        if self.termination.is_none() {
            return Err(EnvironmentError::MissingTermination(self.name.clone()));
        }
        if !self.agents.contains_key(&agent_id) {
            return Ok(self.result(format!(
                "Agent ID {} not found in the environment.",
                agent_id
            )));
        }
        if self.terminated || self.evaluate_termination()?.success {
            return Ok(self.result(TERMINATION_OBSERVATION));
        }
        if !self.actions.contains(action) {
            return Ok(self.result(self.invalid_action(action.name())));
        }

        let (observation, mutated) = match action {
            Action::North | Action::South | Action::East | Action::West => {
                self.apply_move(agent_id, action)?
            }
            Action::Pick => self.apply_pick(agent_id),
            Action::Drop => self.apply_drop(agent_id)?,
            Action::Skip => (self.describe_skip(agent_id), false),
        };
        debug!(env = %self.name, agent_id, %action, mutated, "Action applied");

        if mutated && self.evaluate_termination()?.success {
            return Ok(self.result(TERMINATION_OBSERVATION));
        }
        Ok(self.result(observation))
    }

    fn apply_move(
        &mut self,
        agent_id: EntityId,
        action: Action,
    ) -> Result<(String, bool), EnvironmentError> {
        let agent = self
            .agents
            .get(&agent_id)
            .ok_or(EnvironmentError::UnknownAgent(agent_id))?;
        let current = agent.position;
        let (dx, dy) = action.delta().unwrap_or((0, 0));
        let target = current
            .x
            .checked_add_signed(dx)
            .zip(current.y.checked_add_signed(dy))
            .map(Position::from)
            .filter(|position| self.grid.contains(*position));

        let Some(target) = target else {
            return Ok((
                format!(
                    "Agent {} tried to move '{}', but it cannot move further in that direction.",
                    agent.name, action
                ),
                false,
            ));
        };
        if self.grid.cells[target].obstacle {
            return Ok(("Cannot move into obstacle.".to_string(), false));
        }

        let name = agent.name.clone();
        self.move_agent(agent_id, target)?;
        Ok((
            format!(
                "Agent {} moved '{}' from {} to {}.",
                name, action, current, target
            ),
            true,
        ))
    }

    fn apply_pick(&mut self, agent_id: EntityId) -> (String, bool) {
        let Some(agent) = self.agents.get_mut(&agent_id) else {
            return (format!("Agent ID {} not found.", agent_id), false);
        };
        if agent.held_item.is_some() {
            return ("You are already holding an item.".to_string(), false);
        }
        let cell = &mut self.grid.cells[agent.position];
        let top = cell
            .top_item()
            .filter(|item| item.is_carryable())
            .map(|item| item.permits(agent_id));
        match top {
            Some(true) => {
                agent.held_item = cell.items.pop();
                ("You pick up the item.".to_string(), true)
            }
            Some(false) => (
                "You are not authorized to pick up this item.".to_string(),
                false,
            ),
            None => ("No item here.".to_string(), false),
        }
    }

    fn apply_drop(&mut self, agent_id: EntityId) -> Result<(String, bool), EnvironmentError> {
        let agent = self
            .agents
            .get_mut(&agent_id)
            .ok_or(EnvironmentError::UnknownAgent(agent_id))?;
        match agent.held_item.take() {
            Some(item) => {
                self.grid.cells[agent.position].items.push(item);
                Ok(("You drop off the item.".to_string(), true))
            }
            None => Ok(("You are not holding an item.".to_string(), false)),
        }
    }

    fn describe_skip(&self, agent_id: EntityId) -> String {
        let visible: Vec<String> = self
            .agents
            .get(&agent_id)
            .and_then(|agent| self.grid.cell(agent.position))
            .map(|cell| cell.items.iter().map(ToString::to_string).collect())
            .unwrap_or_default();
        if visible.is_empty() {
            "You skipped your turn.".to_string()
        } else {
            format!(
                "You skipped your turn. Items here: {}.",
                visible.join(", ")
            )
        }
    }
}
