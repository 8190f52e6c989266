//! Declarative environment descriptions and their per-run instantiation.
//!
//! A description is a YAML document. Each call to [`EnvConfig::instantiate`]
//! resolves the `random_variables` block in declaration order, substitutes
//! the resolved values into every `<<name>>` placeholder of the rest of the
//! document, and builds a fresh [`Environment`] with agents at distinct random
//! cells.
//!
//! ```yaml
//! grid_size: [6, 6]
//! num_agents: "<<num_agents>>"
//! max_episodes: 30
//! actions: [north, south, east, west, skip]
//! random_variables:
//!   num_agents: randint(2, 4)
//!   target_positions: positions(3, 6, 6)
//! env_variables:
//!   target_positions: "<<target_positions>>"
//! unified_goal: Cover every target.
//! termination: multi_target
//! ```

use std::{
    collections::HashSet,
    fs, io,
    path::{Path, PathBuf},
    str::FromStr,
};

use rand::{
    Rng,
    seq::{IndexedRandom, SliceRandom},
};
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::{
    Item, Position,
    environment::{ActionSet, Environment, EnvironmentError},
    map::GridError,
    termination::{TerminationError, TerminationKind},
};

/// Agent names, drawn without replacement for every run.
pub const NAME_POOL: [&str; 20] = [
    "Alice", "Bob", "Charlie", "Diana", "Eve", "Frank", "Grace", "Hector", "Ivy", "Jack",
    "Karen", "Leo", "Mona", "Nate", "Olivia", "Paul", "Quinn", "Rosa", "Sam", "Tina",
];

/// Attempts allowed per requested position before rejection sampling gives up.
const PLACEMENT_ATTEMPTS_PER_CELL: usize = 1_000;

/// Upper bound on up-front allocation for sampled positions.
const MAX_PREALLOCATED_POSITIONS: usize = 1_024;

/// Represents errors that can occur while loading or instantiating a description.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config YAML: {0}")]
    Yaml(#[from] serde_yml::Error),
    #[error("invalid config: {0}")]
    Shape(#[from] serde_json::Error),
    #[error("config document must be a mapping")]
    NotAMapping,
    #[error("random variable '{name}' has a malformed expression '{expression}': {reason}")]
    Expression {
        name: String,
        expression: String,
        reason: String,
    },
    #[error("random variable '{name}' refers to an unresolved placeholder in '{expression}'")]
    Unresolved { name: String, expression: String },
    #[error("cannot place {requested} distinct positions in {available} free cells")]
    NotEnoughCells { requested: usize, available: usize },
    #[error("gave up placing {requested} distinct positions after {attempts} attempts")]
    PlacementGaveUp { requested: usize, attempts: usize },
    #[error("{requested} agents requested but only {available} names exist")]
    NamePoolExhausted { requested: usize, available: usize },
    #[error(transparent)]
    Termination(#[from] TerminationError),
    #[error(transparent)]
    Environment(#[from] EnvironmentError),
    #[error(transparent)]
    Grid(#[from] GridError),
}

/// A closed set of random-value generators usable in `random_variables`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RandomExpr {
    Int(i64),
    /// Uniform integer in `lo..=hi`.
    RandInt(i64, i64),
    Choice(Vec<String>),
    /// `count` distinct cells of a `width` x `height` grid, as `[(x, y), ...]`.
    Positions {
        count: usize,
        width: usize,
        height: usize,
    },
}

fn unquote(arg: &str) -> &str {
    let arg = arg.trim();
    for quote in ['"', '\''] {
        if let Some(inner) = arg
            .strip_prefix(quote)
            .and_then(|rest| rest.strip_suffix(quote))
        {
            return inner;
        }
    }
    arg
}

/// Splits a call's argument list on the commas that sit outside quotes and
/// outside nested `()` or `[]`.
fn split_args(args: &str) -> Result<Vec<&str>, String> {
    if args.trim().is_empty() {
        return Ok(Vec::new());
    }
    let mut parts = Vec::new();
    let mut closers = Vec::new();
    let mut quote = None;
    let mut start = 0;
    for (index, c) in args.char_indices() {
        if let Some(open) = quote {
            if c == open {
                quote = None;
            }
            continue;
        }
        match c {
            '"' | '\'' => quote = Some(c),
            '(' => closers.push(')'),
            '[' => closers.push(']'),
            ')' | ']' => {
                if closers.pop() != Some(c) {
                    return Err(format!("unbalanced '{}' in '{}'", c, args.trim()));
                }
            }
            ',' if closers.is_empty() => {
                parts.push(args[start..index].trim());
                start = index + 1;
            }
            _ => {}
        }
    }
    if let Some(open) = quote {
        return Err(format!("unterminated {} quote in '{}'", open, args.trim()));
    }
    if let Some(closer) = closers.last() {
        return Err(format!("missing '{}' in '{}'", closer, args.trim()));
    }
    parts.push(args[start..].trim());
    if parts.iter().any(|part| part.is_empty()) {
        return Err(format!("empty argument in '{}'", args.trim()));
    }
    Ok(parts)
}

fn int_arg<T: FromStr>(function: &str, arg: &str) -> Result<T, String> {
    arg.trim()
        .parse()
        .map_err(|_| format!("{}() expects integers, got '{}'", function, arg.trim()))
}

impl FromStr for RandomExpr {
    type Err = String;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let text = text.trim();
        if let Ok(value) = text.parse::<i64>() {
            return Ok(RandomExpr::Int(value));
        }

        let (function, rest) = text
            .split_once('(')
            .ok_or_else(|| "expected an integer or a call such as randint(1, 5)".to_string())?;
        let args = rest
            .strip_suffix(')')
            .ok_or_else(|| "missing closing parenthesis".to_string())?;
        let mut args = split_args(args)?;
        // `choice([a, b])` lists its options inside one bracketed argument.
        if let &[single] = args.as_slice() {
            if let Some(inner) = single.strip_prefix('[').and_then(|rest| rest.strip_suffix(']')) {
                args = split_args(inner)?;
            }
        }

        match (function.trim(), args.as_slice()) {
            ("randint", [lo, hi]) => {
                let (lo, hi) = (int_arg("randint", lo)?, int_arg("randint", hi)?);
                if lo > hi {
                    return Err(format!("randint({}, {}) has an empty range", lo, hi));
                }
                Ok(RandomExpr::RandInt(lo, hi))
            }
            ("choice", options) if !options.is_empty() => Ok(RandomExpr::Choice(
                options.iter().map(|option| unquote(option).to_string()).collect(),
            )),
            ("positions", [count, width, height]) => Ok(RandomExpr::Positions {
                count: int_arg("positions", count)?,
                width: int_arg("positions", width)?,
                height: int_arg("positions", height)?,
            }),
            (function, args) => Err(format!(
                "unknown function {}() with {} argument(s)",
                function,
                args.len()
            )),
        }
    }
}

impl RandomExpr {
    /// Draws a value and renders it as text for substitution.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<String, ConfigError> {
        Ok(match self {
            RandomExpr::Int(value) => value.to_string(),
            RandomExpr::RandInt(lo, hi) => rng.random_range(*lo..=*hi).to_string(),
            RandomExpr::Choice(options) => options.choose(rng).cloned().unwrap_or_default(),
            RandomExpr::Positions {
                count,
                width,
                height,
            } => {
                let positions = unique_positions(rng, *width, *height, *count, &HashSet::new())?;
                let rendered: Vec<String> = positions.iter().map(ToString::to_string).collect();
                format!("[{}]", rendered.join(", "))
            }
        })
    }
}

/// Draws `count` pairwise-distinct cells of a `width` x `height` grid,
/// avoiding `blocked`, by rejection sampling.
///
/// Fails up front when there are fewer free cells than requested, so the
/// sampling loop always has a reachable end.
pub fn unique_positions<R: Rng + ?Sized>(
    rng: &mut R,
    width: usize,
    height: usize,
    count: usize,
    blocked: &HashSet<Position>,
) -> Result<Vec<Position>, ConfigError> {
    let cells = width.saturating_mul(height);
    let blocked_inside = blocked
        .iter()
        .filter(|position| position.x < width && position.y < height)
        .count();
    let available = cells - blocked_inside;
    if count > available {
        return Err(ConfigError::NotEnoughCells {
            requested: count,
            available,
        });
    }

    let max_attempts = count.saturating_mul(PLACEMENT_ATTEMPTS_PER_CELL);
    let capacity = count.min(MAX_PREALLOCATED_POSITIONS);
    let mut seen = HashSet::with_capacity(capacity);
    let mut positions = Vec::with_capacity(capacity);
    let mut attempts = 0;
    while positions.len() < count {
        if attempts >= max_attempts {
            return Err(ConfigError::PlacementGaveUp {
                requested: count,
                attempts,
            });
        }
        attempts += 1;
        let candidate = Position::new(rng.random_range(0..width), rng.random_range(0..height));
        if !blocked.contains(&candidate) && seen.insert(candidate) {
            positions.push(candidate);
        }
    }
    Ok(positions)
}

/// Replaces every `<<name>>` with its resolved value.
fn substitute_text(text: &str, resolved: &[(String, String)]) -> String {
    let mut text = text.to_string();
    for (name, value) in resolved {
        let placeholder = format!("<<{}>>", name);
        if text.contains(&placeholder) {
            text = text.replace(&placeholder, value);
        }
    }
    text
}

/// Recursively substitutes placeholders in every string leaf.
fn substitute(value: &mut Value, resolved: &[(String, String)]) {
    match value {
        Value::String(text) => *text = substitute_text(text, resolved),
        Value::Array(elements) => {
            for element in elements {
                substitute(element, resolved);
            }
        }
        Value::Object(fields) => {
            for field in fields.values_mut() {
                substitute(field, resolved);
            }
        }
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
    }
}

/// A non-negative integer given either as a number or as text that becomes
/// one after substitution, such as `"<<num_agents>>"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Count(usize);

impl<'de> Deserialize<'de> for Count {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Number(usize),
            Text(String),
        }
        match Repr::deserialize(deserializer)? {
            Repr::Number(value) => Ok(Count(value)),
            Repr::Text(text) => text.trim().parse().map(Count).map_err(|_| {
                serde::de::Error::custom(format!("expected a non-negative integer, got '{}'", text))
            }),
        }
    }
}

fn to_position((x, y): (Count, Count)) -> Position {
    Position::new(x.0, y.0)
}

#[derive(Debug, Deserialize)]
struct ItemPlacement {
    position: (Count, Count),
    #[serde(flatten)]
    item: Item,
}

/// The typed shape of a description after substitution.
#[derive(Debug, Deserialize)]
struct Description {
    #[serde(default)]
    name: Option<String>,
    grid_size: (Count, Count),
    num_agents: Count,
    max_episodes: Count,
    #[serde(default)]
    actions: Option<ActionSet>,
    #[serde(default)]
    env_variables: Map<String, Value>,
    #[serde(default)]
    unified_goal: Option<String>,
    #[serde(default)]
    termination: Option<TerminationKind>,
    #[serde(default)]
    obstacles: Vec<(Count, Count)>,
    #[serde(default)]
    items: Vec<ItemPlacement>,
}

/// A named environment description; every instantiation is a fresh run.
#[derive(Debug, Clone, PartialEq)]
pub struct EnvConfig {
    name: String,
    template: Map<String, Value>,
}

impl EnvConfig {
    /// Loads a description from a YAML file, named after the file stem
    /// unless the document sets `name`.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let stem = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or("environment");
        Self::parse(stem, &contents)
    }

    /// Parses a description from YAML text.
    pub fn parse(name: &str, yaml: &str) -> Result<Self, ConfigError> {
        let document: Value = serde_yml::from_str(yaml)?;
        Self::from_value(name, document)
    }

    /// Validates the parts of a description that must not depend on random values.
    pub fn from_value(name: &str, document: Value) -> Result<Self, ConfigError> {
        let Value::Object(template) = document else {
            return Err(ConfigError::NotAMapping);
        };
        match template.get("random_variables") {
            None | Some(Value::Object(_)) => {}
            Some(_) => {
                return Err(ConfigError::Expression {
                    name: "random_variables".to_string(),
                    expression: String::new(),
                    reason: "must be a mapping of name to expression".to_string(),
                });
            }
        }
        if let Some(actions) = template.get("actions") {
            serde_json::from_value::<ActionSet>(actions.clone())?;
        }
        if let Some(termination) = template.get("termination") {
            serde_json::from_value::<TerminationKind>(termination.clone())?;
        }

        let name = template
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or(name)
            .to_string();
        Ok(EnvConfig { name, template })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Overrides the termination function named in the document.
    pub fn set_termination(&mut self, kind: TerminationKind) -> Result<(), ConfigError> {
        self.template
            .insert("termination".to_string(), serde_json::to_value(kind)?);
        Ok(())
    }

    /// Resolves `random_variables` in declaration order. Later expressions
    /// may use earlier values through placeholders.
    pub fn resolve_random_variables<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
    ) -> Result<Vec<(String, String)>, ConfigError> {
        let Some(Value::Object(declared)) = self.template.get("random_variables") else {
            return Ok(Vec::new());
        };

        let mut resolved: Vec<(String, String)> = Vec::with_capacity(declared.len());
        for (name, expression) in declared {
            let text = match expression {
                Value::String(text) => text.clone(),
                Value::Number(number) => number.to_string(),
                other => {
                    return Err(ConfigError::Expression {
                        name: name.clone(),
                        expression: other.to_string(),
                        reason: "expected text or a number".to_string(),
                    });
                }
            };
            let text = substitute_text(&text, &resolved);
            if text.contains("<<") {
                return Err(ConfigError::Unresolved {
                    name: name.clone(),
                    expression: text,
                });
            }
            let parsed: RandomExpr = text.parse().map_err(|reason| ConfigError::Expression {
                name: name.clone(),
                expression: text.clone(),
                reason,
            })?;
            let value = parsed.sample(rng)?;
            debug!(variable = %name, %value, "Random variable resolved");
            resolved.push((name.clone(), value));
        }
        Ok(resolved)
    }

    /// Builds a brand-new run of this description.
    pub fn instantiate<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<Environment, ConfigError> {
        let resolved = self.resolve_random_variables(rng)?;

        let mut document = Value::Object(self.template.clone());
        if let Value::Object(fields) = &mut document {
            fields.remove("random_variables");
        }
        substitute(&mut document, &resolved);
        let description: Description = serde_json::from_value(document)?;

        let name = description.name.unwrap_or_else(|| self.name.clone());
        let (width, height) = (description.grid_size.0.0, description.grid_size.1.0);
        let mut env = Environment::new(name, width, height)?;

        let mut obstacles = HashSet::new();
        for obstacle in description.obstacles {
            let position = to_position(obstacle);
            env.grid_mut().set_obstacle(position, true)?;
            obstacles.insert(position);
        }
        for ItemPlacement { position, item } in description.items {
            env.grid_mut().place_item(to_position(position), item)?;
        }

        let num_agents = description.num_agents.0;
        if num_agents > NAME_POOL.len() {
            return Err(ConfigError::NamePoolExhausted {
                requested: num_agents,
                available: NAME_POOL.len(),
            });
        }
        let mut names = NAME_POOL.to_vec();
        names.shuffle(rng);
        names.truncate(num_agents);
        let starts = unique_positions(rng, width, height, num_agents, &obstacles)?;

        let variables = &mut env.grid_mut().variables;
        variables.extend(description.env_variables);
        for (name, value) in &resolved {
            variables
                .entry(name.clone())
                .or_insert_with(|| Value::String(value.clone()));
        }
        if let Some(goal) = description.unified_goal {
            variables.insert("unified_goal".to_string(), Value::String(goal));
        }
        variables.insert(
            "agent_names".to_string(),
            Value::from(names.iter().map(|name| name.to_string()).collect::<Vec<_>>()),
        );
        variables.insert("gridworld_size".to_string(), Value::from(vec![width, height]));

        for (name, start) in names.iter().zip(starts) {
            env.add_agent(*name, start)?;
        }

        let kind = description
            .termination
            .unwrap_or_else(|| TerminationKind::default_for(num_agents));
        let condition = kind.build(env.variables())?;
        env.attach_termination(condition)?;
        env.set_actions(description.actions.unwrap_or_default());
        env.set_max_episodes(description.max_episodes.0);

        info!(
            env = env.name(),
            width,
            height,
            agents = num_agents,
            termination = ?kind,
            max_episodes = env.max_episodes(),
            "Environment instantiated"
        );
        Ok(env)
    }
}
