use std::{
    cmp::Ordering,
    collections::{BinaryHeap, HashMap, VecDeque},
};

use rand::{SeedableRng, rngs::StdRng, seq::IndexedRandom};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::{
    EntityId, Item, Position,
    environment::{Action, ActionSet, GridState},
};

/// Maximum number of undelivered messages an agent keeps.
pub const INBOX_CAPACITY: usize = 64;

/// A message broadcast by one agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub sender: EntityId,
    pub sender_name: String,
    pub content: String,
}

/// Bounded FIFO of messages waiting for an agent's next turn.
///
/// When full, the oldest message is dropped to make room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Inbox {
    messages: VecDeque<Message>,
    capacity: usize,
}

impl Inbox {
    pub fn with_capacity(capacity: usize) -> Self {
        Inbox {
            messages: VecDeque::with_capacity(capacity.min(INBOX_CAPACITY)),
            capacity: capacity.max(1),
        }
    }

    /// Appends a message, returning the one evicted to make room, if any.
    pub fn push(&mut self, message: Message) -> Option<Message> {
        let evicted = if self.messages.len() >= self.capacity {
            self.messages.pop_front()
        } else {
            None
        };
        if let Some(dropped) = &evicted {
            warn!(sender = dropped.sender, "Inbox full, dropping oldest message");
        }
        self.messages.push_back(message);
        evicted
    }

    /// Takes every pending message, leaving the inbox empty.
    pub fn drain(&mut self) -> Vec<Message> {
        self.messages.drain(..).collect()
    }

    pub fn peek(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }
}

impl Default for Inbox {
    fn default() -> Self {
        Inbox::with_capacity(INBOX_CAPACITY)
    }
}

/// Holds the state of an agent within the environment.
#[derive(Debug, Clone, Serialize)]
pub struct AgentState {
    pub id: EntityId,
    pub name: String,
    pub(crate) position: Position,
    pub(crate) held_item: Option<Item>,
    pub(crate) inbox: Inbox,
    pub(crate) messages_sent: Vec<String>,
    pub steps_taken: usize,
    /// Environment score seen after this agent's last action.
    pub score: f64,
}

impl AgentState {
    pub(crate) fn new(id: EntityId, name: String, position: Position) -> Self {
        AgentState {
            id,
            name,
            position,
            held_item: None,
            inbox: Inbox::default(),
            messages_sent: Vec::new(),
            steps_taken: 0,
            score: 0.0,
        }
    }

    pub fn position(&self) -> Position {
        self.position
    }

    pub fn held_item(&self) -> Option<&Item> {
        self.held_item.as_ref()
    }

    pub fn inbox(&self) -> &Inbox {
        &self.inbox
    }

    pub fn inbox_mut(&mut self) -> &mut Inbox {
        &mut self.inbox
    }

    pub fn messages_sent(&self) -> &[String] {
        &self.messages_sent
    }

    /// Clears counters and pending messages before a run.
    pub fn reset_bookkeeping(&mut self) {
        self.inbox.clear();
        self.messages_sent.clear();
        self.steps_taken = 0;
        self.score = 0.0;
    }
}

/// Read-only context handed to a [`DecisionSource`] for one turn.
#[derive(Debug)]
pub struct AgentView<'a> {
    pub agent: &'a AgentState,
    pub episode: usize,
    /// Result of the agent's previous action.
    pub observation: &'a str,
    /// Messages received since the agent's previous turn.
    pub inbox: &'a [Message],
    pub score: f64,
    pub actions: &'a ActionSet,
    pub grid: &'a GridState,
}

impl AgentView<'_> {
    pub fn location(&self) -> Position {
        self.agent.position
    }

    /// Plain-text turn message as shown to a language model.
    pub fn render(&self) -> String {
        let mut text = format!(
            "Your current position is: {}\n{}",
            self.agent.position, self.observation
        );
        if let Some(item) = &self.agent.held_item {
            text.push_str(&format!("\nYou are holding: {}", item));
        }
        if !self.inbox.is_empty() {
            text.push_str("\nMessages:");
            for message in self.inbox {
                text.push_str(&format!("\n- {}: {}", message.sender_name, message.content));
            }
        }
        text.push_str(&format!("\nCurrent score: {:.1}", self.score));
        text
    }
}

/// The structured reply of one agent turn.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    #[serde(default)]
    pub action_name: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl Decision {
    pub fn act(action: Action) -> Self {
        Decision {
            action_name: Some(action.name().to_string()),
            message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// The parsed action, `None` when missing or not in the vocabulary.
    pub fn action(&self) -> Option<Action> {
        self.action_name.as_deref()?.parse().ok()
    }

    /// Non-empty broadcast text.
    pub fn broadcast(&self) -> Option<&str> {
        self.message
            .as_deref()
            .map(str::trim)
            .filter(|message| !message.is_empty())
    }

    /// Reads the first `{...}` object in a free-text model reply.
    ///
    /// Anything that cannot be read yields a decision without an action.
    pub fn from_response(response: &str) -> Self {
        let (Some(start), Some(end)) = (response.find('{'), response.rfind('}')) else {
            return Decision::default();
        };
        if end < start {
            return Decision::default();
        }
        let body = &response[start..=end];
        let parsed = serde_json::from_str::<Value>(body)
            .or_else(|_| serde_json::from_str::<Value>(&body.replace('\'', "\"")));
        let Ok(Value::Object(fields)) = parsed else {
            return Decision::default();
        };

        let text = |key: &str| match fields.get(key) {
            Some(Value::String(value)) => Some(value.clone()),
            Some(Value::Null) | None => None,
            Some(other) => Some(other.to_string()),
        };
        Decision {
            action_name: text("action_name"),
            message: text("message"),
        }
    }
}

/// Produces an agent's decision for one turn: a language model, a bot or a script.
pub trait DecisionSource {
    fn decide(&mut self, view: &AgentView<'_>) -> Decision;
}

impl<F> DecisionSource for F
where
    F: FnMut(&AgentView<'_>) -> Decision,
{
    fn decide(&mut self, view: &AgentView<'_>) -> Decision {
        self(view)
    }
}

/// Picks a uniformly random allowed action every turn.
#[derive(Debug)]
pub struct RandomWalker {
    rng: StdRng,
}

impl RandomWalker {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl DecisionSource for RandomWalker {
    fn decide(&mut self, view: &AgentView<'_>) -> Decision {
        let action = view
            .actions
            .as_slice()
            .choose(&mut self.rng)
            .copied()
            .unwrap_or(Action::Skip);
        Decision::act(action)
    }
}

/// Replays fixed decisions per agent and records what each agent was shown.
#[derive(Debug, Default)]
pub struct ScriptedDecisions {
    scripts: HashMap<EntityId, VecDeque<Decision>>,
    /// `(agent, episode, observation, inbox)` for every turn taken.
    pub seen: Vec<(EntityId, usize, String, Vec<Message>)>,
}

impl ScriptedDecisions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, agent_id: EntityId, decision: Decision) -> &mut Self {
        self.scripts.entry(agent_id).or_default().push_back(decision);
        self
    }

    pub fn push_actions(
        &mut self,
        agent_id: EntityId,
        actions: impl IntoIterator<Item = Action>,
    ) -> &mut Self {
        for action in actions {
            self.push(agent_id, Decision::act(action));
        }
        self
    }
}

impl DecisionSource for ScriptedDecisions {
    /// Skips once an agent's script runs out.
    fn decide(&mut self, view: &AgentView<'_>) -> Decision {
        self.seen.push((
            view.agent.id,
            view.episode,
            view.observation.to_string(),
            view.inbox.to_vec(),
        ));
        self.scripts
            .get_mut(&view.agent.id)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Decision::act(Action::Skip))
    }
}

/// A planning agent that walks to the nearest free target marker, ferrying
/// items there first when the grid has any.
#[derive(Debug, Default)]
pub struct TargetSeeker {
    /// Last destination announced by each agent.
    announced: HashMap<EntityId, Position>,
}

impl TargetSeeker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Converts a move between two adjacent positions into an Action
    fn position_to_action(src: &Position, dst: &Position) -> Action {
        let dx = dst.x as isize - src.x as isize;
        let dy = dst.y as isize - src.y as isize;

        match (dx, dy) {
            (0, 1) => Action::North,
            (0, -1) => Action::South,
            (1, 0) => Action::East,
            (-1, 0) => Action::West,
            _ => Action::Skip,
        }
    }

    /// A* pathfinding around obstacles
    fn a_star_path(start: Position, goal: Position, grid: &GridState) -> Option<Vec<Position>> {
        // For priority queue
        #[derive(Clone, Eq, PartialEq)]
        struct PrioritizedItem {
            priority: usize,
            position: Position,
        }

        impl Ord for PrioritizedItem {
            fn cmp(&self, other: &Self) -> Ordering {
                // Reverse ordering for min-heap behavior
                other
                    .priority
                    .cmp(&self.priority)
                    .then_with(|| other.position.cmp(&self.position))
            }
        }

        impl PartialOrd for PrioritizedItem {
            fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
                Some(self.cmp(other))
            }
        }

        let mut frontier = BinaryHeap::new();
        let mut came_from: HashMap<Position, Position> = HashMap::new();
        let mut cost_so_far: HashMap<Position, usize> = HashMap::new();

        frontier.push(PrioritizedItem {
            priority: 0,
            position: start,
        });
        cost_so_far.insert(start, 0);

        let mut goal_reached = false;

        while let Some(PrioritizedItem {
            position: current, ..
        }) = frontier.pop()
        {
            if current == goal {
                goal_reached = true;
                break;
            }

            let current_cost = cost_so_far.get(&current).copied().unwrap_or(usize::MAX);
            for neighbor in Self::open_neighbors(&current, grid) {
                let new_cost = current_cost.saturating_add(1);
                if cost_so_far
                    .get(&neighbor)
                    .is_none_or(|known| new_cost < *known)
                {
                    cost_so_far.insert(neighbor, new_cost);
                    frontier.push(PrioritizedItem {
                        priority: new_cost + neighbor.manhattan(&goal),
                        position: neighbor,
                    });
                    came_from.insert(neighbor, current);
                }
            }
        }

        if !goal_reached {
            return None;
        }

        // Reconstruct path
        let mut path = vec![goal];
        let mut current = goal;
        while current != start {
            current = *came_from.get(&current)?;
            path.push(current);
        }
        path.reverse();
        Some(path)
    }

    /// In-bounds, obstacle-free neighbors. Agents may share cells, so they never block.
    fn open_neighbors(position: &Position, grid: &GridState) -> Vec<Position> {
        [(0, 1), (0, -1), (1, 0), (-1, 0)]
            .into_iter()
            .filter_map(|(dx, dy)| {
                let x = position.x.checked_add_signed(dx)?;
                let y = position.y.checked_add_signed(dy)?;
                let neighbor = Position { x, y };
                grid.cell(neighbor)
                    .filter(|cell| !cell.obstacle)
                    .map(|_| neighbor)
            })
            .collect()
    }

    /// Target markers nobody else is standing on and that hold no delivered item.
    fn free_targets(view: &AgentView<'_>, for_delivery: bool) -> Vec<Position> {
        view.grid
            .cells()
            .enumerate()
            .filter(|(_, cell)| cell.has_target())
            .filter(|(_, cell)| !for_delivery || !cell.has_carryable())
            .filter(|(_, cell)| {
                for_delivery || cell.agents().iter().all(|id| *id == view.agent.id)
            })
            .map(|(position, _)| position)
            .collect()
    }

    /// Items this agent may pick up that are not already delivered.
    fn reachable_items(view: &AgentView<'_>) -> Vec<Position> {
        view.grid
            .cells()
            .enumerate()
            .filter(|(_, cell)| !cell.has_target())
            .filter(|(_, cell)| {
                cell.top_item()
                    .is_some_and(|item| item.is_carryable() && item.permits(view.agent.id))
            })
            .map(|(position, _)| position)
            .collect()
    }

    /// Plans to the nearest target from a list of positions
    fn plan_to_nearest(
        start: Position,
        targets: &[Position],
        grid: &GridState,
    ) -> Option<Vec<Position>> {
        targets
            .iter()
            .filter_map(|target| Self::a_star_path(start, *target, grid))
            .min_by_key(Vec::len)
    }

    fn head_for(&mut self, view: &AgentView<'_>, targets: &[Position]) -> Decision {
        let here = view.location();
        let Some(path) = Self::plan_to_nearest(here, targets, view.grid) else {
            return Decision::act(Action::Skip);
        };
        let destination = path.last().copied().unwrap_or(here);
        let action = path
            .get(1)
            .map_or(Action::Skip, |next| Self::position_to_action(&here, next));
        let decision = Decision::act(action);

        if self.announced.get(&view.agent.id) != Some(&destination) {
            self.announced.insert(view.agent.id, destination);
            return decision.with_message(format!("I am heading to {}.", destination));
        }
        decision
    }
}

impl DecisionSource for TargetSeeker {
    fn decide(&mut self, view: &AgentView<'_>) -> Decision {
        let here = view.location();
        let cell = view.grid.cell(here);
        let items_in_play = !Self::reachable_items(view).is_empty();

        // 1. Deliver a held item, or drop it on a free target
        if view.agent.held_item.is_some() {
            if cell.is_some_and(|cell| cell.has_target() && !cell.has_carryable()) {
                return Decision::act(Action::Drop);
            }
            let targets = Self::free_targets(view, true);
            return self.head_for(view, &targets);
        }

        // 2. Collect items before anything else
        if items_in_play {
            let standing_on_item = cell.is_some_and(|cell| {
                !cell.has_target()
                    && cell
                        .top_item()
                        .is_some_and(|item| item.is_carryable() && item.permits(view.agent.id))
            });
            if standing_on_item {
                return Decision::act(Action::Pick);
            }
            let items = Self::reachable_items(view);
            return self.head_for(view, &items);
        }

        // 3. Occupy a free target
        if cell.is_some_and(|cell| cell.has_target()) {
            return Decision::act(Action::Skip);
        }
        let targets = Self::free_targets(view, false);
        self.head_for(view, &targets)
    }
}
