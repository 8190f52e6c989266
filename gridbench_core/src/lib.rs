use std::fmt;

use serde::{Deserialize, Serialize};

pub mod agent;
pub mod benchmark;
pub mod config;
pub mod environment;
pub mod map;
pub mod scheduler;
pub mod termination;
pub mod transcript;

/// Unique identifier for agents within one environment.
pub type EntityId = usize;

/// Represents a 2D coordinate.
///
/// The origin is the south-west corner: `x` grows towards the east and `y`
/// grows towards the north.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Position {
    pub x: usize,
    pub y: usize,
}

impl Position {
    pub const fn new(x: usize, y: usize) -> Self {
        Position { x, y }
    }

    /// Manhattan distance between two positions.
    pub fn manhattan(&self, other: &Position) -> usize {
        self.x.abs_diff(other.x) + self.y.abs_diff(other.y)
    }
}

impl From<(usize, usize)> for Position {
    fn from((x, y): (usize, usize)) -> Self {
        Position { x, y }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// The role an item plays in a task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    /// Marker for a cell agents (or items) should reach. Never picked up.
    Target,
    /// Something an agent can carry.
    Item,
    #[serde(untagged)]
    Other(String),
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemKind::Target => f.write_str("target"),
            ItemKind::Item => f.write_str("item"),
            ItemKind::Other(tag) => f.write_str(tag),
        }
    }
}

/// Shape used when drawing an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Shape {
    #[default]
    Circle,
    Triangle,
    Square,
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Shape::Circle => f.write_str("circle"),
            Shape::Triangle => f.write_str("triangle"),
            Shape::Square => f.write_str("square"),
        }
    }
}

/// RGBA color of an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Color(pub u8, pub u8, pub u8, pub u8);

impl Color {
    pub const TARGET: Color = Color(0, 0, 50, 128);
    pub const ITEM: Color = Color(200, 0, 0, 255);
}

impl Default for Color {
    fn default() -> Self {
        Color::ITEM
    }
}

/// Represents things that rest in a cell or are carried by an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub kind: ItemKind,
    #[serde(default)]
    pub color: Color,
    #[serde(default)]
    pub shape: Shape,
    /// When set, only the agent with this id may pick the item up.
    #[serde(default)]
    pub allowed_agent_id: Option<EntityId>,
}

impl Item {
    /// A target marker as drawn by the scoring functions.
    pub fn target() -> Self {
        Item {
            kind: ItemKind::Target,
            color: Color::TARGET,
            shape: Shape::Circle,
            allowed_agent_id: None,
        }
    }

    /// A carryable item, optionally restricted to one agent.
    pub fn carryable(allowed_agent_id: Option<EntityId>) -> Self {
        Item {
            kind: ItemKind::Item,
            color: Color::ITEM,
            shape: Shape::Triangle,
            allowed_agent_id,
        }
    }

    pub fn is_target(&self) -> bool {
        self.kind == ItemKind::Target
    }

    pub fn is_carryable(&self) -> bool {
        self.kind == ItemKind::Item
    }

    /// Whether the agent `agent_id` is allowed to pick this item up.
    pub fn permits(&self, agent_id: EntityId) -> bool {
        self.allowed_agent_id.is_none_or(|allowed| allowed == agent_id)
    }
}

impl fmt::Display for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.kind, self.shape)?;
        if let Some(owner) = self.allowed_agent_id {
            write!(f, " reserved for agent {}", owner)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_is_a_pure_function_of_item_and_agent() {
        let open = Item::carryable(None);
        assert!(open.permits(0));
        assert!(open.permits(7));

        let reserved = Item::carryable(Some(3));
        assert!(reserved.permits(3));
        assert!(!reserved.permits(5));
    }

    #[test]
    fn item_kind_reads_known_and_free_form_tags() {
        let kinds: Vec<ItemKind> = serde_json::from_str(r#"["target", "item", "gem"]"#).unwrap();
        assert_eq!(
            kinds,
            vec![
                ItemKind::Target,
                ItemKind::Item,
                ItemKind::Other("gem".to_string())
            ]
        );
    }

    #[test]
    fn position_display_uses_tuple_notation() {
        assert_eq!(Position::new(2, 5).to_string(), "(2, 5)");
        assert_eq!(Position::new(0, 0).manhattan(&Position::new(2, 3)), 5);
    }
}
