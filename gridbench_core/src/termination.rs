//! Scoring functions that decide when an environment run is finished.
//!
//! Every condition is idempotent: evaluating twice against an unchanged grid
//! gives the same success flag and score. Conditions that draw target markers
//! do so lazily on their first evaluation and never duplicate them.

use std::{collections::BTreeSet, fmt, sync::Arc};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::{
    Item, Position,
    agent::AgentState,
    environment::GridState,
    map::GridError,
};

/// Outcome of one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Evaluation {
    pub success: bool,
    /// New score in `[0, 100]`, or `None` to leave the current score unchanged.
    pub score: Option<f64>,
}

impl Evaluation {
    fn scored(success: bool, score: f64) -> Self {
        Evaluation {
            success,
            score: Some(score),
        }
    }
}

/// A named, swappable success predicate and scorer.
pub trait TerminationCondition: fmt::Debug + Send + Sync {
    fn name(&self) -> &str;

    /// Called once when the condition is attached to an environment.
    fn install(&self, _grid: &mut GridState) -> Result<(), GridError> {
        Ok(())
    }

    fn evaluate(&self, grid: &mut GridState, agents: &[&AgentState]) -> Evaluation;
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TerminationError {
    #[error("environment variable '{0}' is required by this termination function")]
    MissingVariable(&'static str),
    #[error("environment variable '{variable}' is not a position list: {value}")]
    InvalidPositions { variable: &'static str, value: String },
    #[error("environment variable '{0}' lists no positions")]
    NoTargets(&'static str),
}

fn ensure_in_bounds(grid: &GridState, positions: &[Position]) -> Result<(), GridError> {
    match positions.iter().find(|position| !grid.contains(**position)) {
        Some(position) => Err(GridError::OutOfBounds {
            x: position.x,
            y: position.y,
            width: grid.width(),
            height: grid.height(),
        }),
        None => Ok(()),
    }
}

fn mark_targets<'a>(grid: &mut GridState, targets: impl IntoIterator<Item = &'a Position>) {
    for target in targets {
        if let Err(err) = grid.ensure_target_marker(*target) {
            warn!(%err, "Skipping target marker");
        }
    }
}

fn occupied<'a>(agents: &[&AgentState], cells: impl IntoIterator<Item = &'a Position>) -> usize {
    cells
        .into_iter()
        .filter(|cell| agents.iter().any(|agent| agent.position == **cell))
        .count()
}

fn percentage(part: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64 * 100.0
    }
}

/// Every agent must stand on one designated cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SingleTarget {
    target: Position,
}

impl SingleTarget {
    pub fn new(target: Position) -> Self {
        SingleTarget { target }
    }
}

impl TerminationCondition for SingleTarget {
    fn name(&self) -> &str {
        "single_target"
    }

    fn install(&self, grid: &mut GridState) -> Result<(), GridError> {
        ensure_in_bounds(grid, &[self.target])
    }

    /// Scores 100 on success and leaves the score alone otherwise.
    fn evaluate(&self, grid: &mut GridState, agents: &[&AgentState]) -> Evaluation {
        mark_targets(grid, [&self.target]);
        let success = agents.iter().all(|agent| agent.position == self.target);
        Evaluation {
            success,
            score: success.then_some(100.0),
        }
    }
}

/// Agents must hold all four corners at once; 25 points per occupied corner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CornerOccupancy;

impl TerminationCondition for CornerOccupancy {
    fn name(&self) -> &str {
        "corners"
    }

    fn evaluate(&self, grid: &mut GridState, agents: &[&AgentState]) -> Evaluation {
        let corners = grid.corners();
        mark_targets(grid, &corners);
        let held = occupied(agents, &corners);
        Evaluation::scored(held == corners.len(), held as f64 * 25.0)
    }
}

/// Agents sorted by name must stand at `(0, 0), (1, 0), ...` in that order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AlphabeticalLineUp;

impl TerminationCondition for AlphabeticalLineUp {
    fn name(&self) -> &str {
        "alphabetical"
    }

    fn evaluate(&self, _grid: &mut GridState, agents: &[&AgentState]) -> Evaluation {
        let mut sorted: Vec<&AgentState> = agents.to_vec();
        sorted.sort_by(|a, b| a.name.cmp(&b.name));
        let correct = sorted
            .iter()
            .enumerate()
            .filter(|(index, agent)| agent.position == Position::new(*index, 0))
            .count();
        Evaluation::scored(correct == sorted.len(), percentage(correct, sorted.len()))
    }
}

/// Every listed target must be occupied by some agent at the same time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiTargetCoverage {
    targets: BTreeSet<Position>,
}

impl MultiTargetCoverage {
    pub fn new(targets: impl IntoIterator<Item = Position>) -> Self {
        MultiTargetCoverage {
            targets: targets.into_iter().collect(),
        }
    }
}

impl TerminationCondition for MultiTargetCoverage {
    fn name(&self) -> &str {
        "multi_target"
    }

    fn install(&self, grid: &mut GridState) -> Result<(), GridError> {
        let targets: Vec<Position> = self.targets.iter().copied().collect();
        ensure_in_bounds(grid, &targets)
    }

    fn evaluate(&self, grid: &mut GridState, agents: &[&AgentState]) -> Evaluation {
        mark_targets(grid, &self.targets);
        let covered = occupied(agents, &self.targets);
        Evaluation::scored(
            !self.targets.is_empty() && covered == self.targets.len(),
            percentage(covered, self.targets.len()),
        )
    }
}

/// Items must be carried onto the targets; the score is the share of
/// targets holding an item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemDelivery {
    targets: BTreeSet<Position>,
    item_positions: Vec<Position>,
    use_permissions: bool,
}

impl ItemDelivery {
    /// With `use_permissions`, the item placed at `item_positions[i]` is
    /// reserved for agent `i`.
    pub fn new(
        targets: impl IntoIterator<Item = Position>,
        item_positions: Vec<Position>,
        use_permissions: bool,
    ) -> Self {
        ItemDelivery {
            targets: targets.into_iter().collect(),
            item_positions,
            use_permissions,
        }
    }
}

impl TerminationCondition for ItemDelivery {
    fn name(&self) -> &str {
        "item_delivery"
    }

    fn install(&self, grid: &mut GridState) -> Result<(), GridError> {
        let targets: Vec<Position> = self.targets.iter().copied().collect();
        ensure_in_bounds(grid, &targets)?;
        for (index, position) in self.item_positions.iter().enumerate() {
            let owner = self.use_permissions.then_some(index);
            grid.place_item(*position, Item::carryable(owner))?;
        }
        Ok(())
    }

    fn evaluate(&self, grid: &mut GridState, _agents: &[&AgentState]) -> Evaluation {
        mark_targets(grid, &self.targets);
        let filled = self
            .targets
            .iter()
            .filter(|target| grid.cell(**target).is_some_and(|cell| cell.has_carryable()))
            .count();
        Evaluation::scored(
            !self.targets.is_empty() && filled == self.targets.len(),
            percentage(filled, self.targets.len()),
        )
    }
}

/// Identifier of a built-in termination function in configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationKind {
    #[serde(alias = "single_agent_navigation")]
    SingleTarget,
    #[serde(alias = "multi_agent_navigation")]
    Corners,
    #[serde(alias = "align_alphabetically_task", alias = "alphabetical_order")]
    Alphabetical,
    #[serde(alias = "random_points_multi_agent_navigation")]
    MultiTarget,
    #[serde(alias = "pick_item")]
    ItemDelivery,
}

impl TerminationKind {
    /// Alphabetical line-up for teams, single-target reach for a lone agent.
    pub fn default_for(agent_count: usize) -> Self {
        if agent_count > 1 {
            TerminationKind::Alphabetical
        } else {
            TerminationKind::SingleTarget
        }
    }

    /// Builds the condition, reading its targets from the environment variables.
    pub fn build(
        &self,
        variables: &Map<String, Value>,
    ) -> Result<Arc<dyn TerminationCondition>, TerminationError> {
        Ok(match self {
            TerminationKind::SingleTarget => {
                let value = require(variables, "target_position")?;
                let target = parse_position(value).ok_or_else(|| invalid("target_position", value))?;
                Arc::new(SingleTarget::new(target))
            }
            TerminationKind::Corners => Arc::new(CornerOccupancy),
            TerminationKind::Alphabetical => Arc::new(AlphabeticalLineUp),
            TerminationKind::MultiTarget => {
                let targets = require_positions(variables, "target_positions")?;
                Arc::new(MultiTargetCoverage::new(targets))
            }
            TerminationKind::ItemDelivery => {
                let targets = match variables.get("target_positions") {
                    Some(_) => require_positions(variables, "target_positions")?,
                    None => {
                        let value = require(variables, "target_position")?;
                        vec![parse_position(value).ok_or_else(|| invalid("target_position", value))?]
                    }
                };
                let items = require_positions(variables, "item_positions")?;
                let use_permissions = match variables.get("use_permissions") {
                    Some(Value::Bool(flag)) => *flag,
                    Some(Value::String(text)) => text.trim().eq_ignore_ascii_case("true"),
                    _ => false,
                };
                Arc::new(ItemDelivery::new(targets, items, use_permissions))
            }
        })
    }
}

fn require<'a>(
    variables: &'a Map<String, Value>,
    name: &'static str,
) -> Result<&'a Value, TerminationError> {
    variables
        .get(name)
        .ok_or(TerminationError::MissingVariable(name))
}

fn invalid(variable: &'static str, value: &Value) -> TerminationError {
    TerminationError::InvalidPositions {
        variable,
        value: value.to_string(),
    }
}

fn require_positions(
    variables: &Map<String, Value>,
    name: &'static str,
) -> Result<Vec<Position>, TerminationError> {
    let value = require(variables, name)?;
    let positions = parse_positions(value).ok_or_else(|| invalid(name, value))?;
    if positions.is_empty() {
        return Err(TerminationError::NoTargets(name));
    }
    Ok(positions)
}

/// Reads the integers of a textual tuple list such as `"[(1, 2), (3, 4)]"`.
fn numbers_in(text: &str) -> Option<Vec<usize>> {
    let mut numbers = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        if ch.is_ascii_digit() {
            current.push(ch);
            continue;
        }
        if !matches!(ch, '(' | ')' | '[' | ']' | ',') && !ch.is_whitespace() {
            return None;
        }
        if !current.is_empty() {
            numbers.push(current.parse().ok()?);
            current.clear();
        }
    }
    if !current.is_empty() {
        numbers.push(current.parse().ok()?);
    }
    Some(numbers)
}

fn pairs(numbers: &[usize]) -> Option<Vec<Position>> {
    if numbers.len() % 2 != 0 {
        return None;
    }
    Some(
        numbers
            .chunks_exact(2)
            .map(|pair| Position::new(pair[0], pair[1]))
            .collect(),
    )
}

fn as_index(value: &Value) -> Option<usize> {
    match value {
        Value::Number(number) => number.as_u64().and_then(|n| usize::try_from(n).ok()),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

/// Reads one position from `[x, y]` or `"(x, y)"`.
pub fn parse_position(value: &Value) -> Option<Position> {
    match parse_positions(value)?.as_slice() {
        [position] => Some(*position),
        _ => None,
    }
}

/// Reads a position list from `[[x, y], ...]`, `[x, y]` or a textual tuple list.
pub fn parse_positions(value: &Value) -> Option<Vec<Position>> {
    match value {
        Value::String(text) => pairs(&numbers_in(text)?),
        Value::Array(elements) => {
            // Two scalars, numeric or digit text, are a single position.
            if let [x, y] = elements.as_slice() {
                if let (Some(x), Some(y)) = (as_index(x), as_index(y)) {
                    return Some(vec![Position::new(x, y)]);
                }
            }
            elements.iter().map(parse_position).collect()
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn agent(id: usize, name: &str, x: usize, y: usize) -> AgentState {
        AgentState::new(id, name.to_string(), Position::new(x, y))
    }

    #[test]
    fn corners_score_a_quarter_each() {
        let mut grid = GridState::new(6, 6).unwrap();
        let a = agent(0, "A", 0, 0);
        let b = agent(1, "B", 5, 5);
        let c = agent(2, "C", 2, 2);
        let eval = CornerOccupancy.evaluate(&mut grid, &[&a, &b, &c]);
        assert_eq!(eval, Evaluation::scored(false, 50.0));
        for corner in grid.corners() {
            assert_eq!(grid.cell(corner).unwrap().items, vec![Item::target()]);
        }
    }

    #[test]
    fn repeated_evaluation_does_not_duplicate_markers() {
        let mut grid = GridState::new(4, 4).unwrap();
        let a = agent(0, "A", 1, 1);
        let coverage = MultiTargetCoverage::new([Position::new(1, 1), Position::new(3, 0)]);
        let first = coverage.evaluate(&mut grid, &[&a]);
        let second = coverage.evaluate(&mut grid, &[&a]);
        assert_eq!(first, second);
        assert_eq!(first, Evaluation::scored(false, 50.0));
        assert_eq!(grid.cell(Position::new(3, 0)).unwrap().items.len(), 1);
    }

    #[test]
    fn single_target_only_scores_on_success() {
        let mut grid = GridState::new(3, 3).unwrap();
        let target = SingleTarget::new(Position::new(2, 2));
        let away = agent(0, "A", 0, 0);
        assert_eq!(
            target.evaluate(&mut grid, &[&away]),
            Evaluation {
                success: false,
                score: None
            }
        );
        let there = agent(0, "A", 2, 2);
        assert_eq!(
            target.evaluate(&mut grid, &[&there]),
            Evaluation::scored(true, 100.0)
        );
    }

    #[test]
    fn delivery_counts_targets_holding_items() {
        let mut grid = GridState::new(5, 5).unwrap();
        let delivery = ItemDelivery::new(
            [Position::new(4, 4), Position::new(0, 4)],
            vec![Position::new(1, 1), Position::new(2, 2)],
            true,
        );
        delivery.install(&mut grid).unwrap();
        assert_eq!(
            grid.cell(Position::new(2, 2)).unwrap().items,
            vec![Item::carryable(Some(1))]
        );
        assert_eq!(
            delivery.evaluate(&mut grid, &[]),
            Evaluation::scored(false, 0.0)
        );

        grid.place_item(Position::new(4, 4), Item::carryable(None))
            .unwrap();
        assert_eq!(
            delivery.evaluate(&mut grid, &[]),
            Evaluation::scored(false, 50.0)
        );
    }

    #[test]
    fn install_rejects_targets_outside_the_grid() {
        let mut grid = GridState::new(3, 3).unwrap();
        assert!(matches!(
            SingleTarget::new(Position::new(3, 0)).install(&mut grid),
            Err(GridError::OutOfBounds { x: 3, .. })
        ));
    }

    #[test]
    fn positions_parse_from_text_and_sequences() {
        assert_eq!(
            parse_positions(&json!("[(1, 2), (3, 4)]")),
            Some(vec![Position::new(1, 2), Position::new(3, 4)])
        );
        assert_eq!(parse_position(&json!("(5, 0)")), Some(Position::new(5, 0)));
        assert_eq!(parse_position(&json!([2, 3])), Some(Position::new(2, 3)));
        assert_eq!(
            parse_positions(&json!([[0, 1], "(2, 3)"])),
            Some(vec![Position::new(0, 1), Position::new(2, 3)])
        );
        assert_eq!(parse_positions(&json!("[(1, 2), (3)]")), None);
        assert_eq!(parse_positions(&json!("__import__('os')")), None);
    }

    #[test]
    fn digit_text_pairs_are_positions() {
        assert_eq!(parse_position(&json!(["3", "4"])), Some(Position::new(3, 4)));
        assert_eq!(parse_position(&json!([" 3", 4])), Some(Position::new(3, 4)));
        assert_eq!(
            parse_positions(&json!([["1", "2"], [3, 4]])),
            Some(vec![Position::new(1, 2), Position::new(3, 4)])
        );
        assert_eq!(parse_position(&json!(["3", "x"])), None);
        assert_eq!(parse_position(&json!(["3"])), None);
    }

    #[test]
    fn kinds_accept_benchmark_names() {
        let kind: TerminationKind =
            serde_json::from_value(json!("random_points_multi_agent_navigation")).unwrap();
        assert_eq!(kind, TerminationKind::MultiTarget);
        assert_eq!(TerminationKind::default_for(1), TerminationKind::SingleTarget);
        assert_eq!(TerminationKind::default_for(3), TerminationKind::Alphabetical);
    }

    #[test]
    fn build_reports_missing_variables() {
        let variables = Map::new();
        assert_eq!(
            TerminationKind::MultiTarget.build(&variables).unwrap_err(),
            TerminationError::MissingVariable("target_positions")
        );
        let mut variables = Map::new();
        variables.insert("target_positions".into(), json!("[]"));
        assert_eq!(
            TerminationKind::MultiTarget.build(&variables).unwrap_err(),
            TerminationError::NoTargets("target_positions")
        );
    }
}
