use std::collections::HashSet;

use gridbench_core::{
    Item, Position,
    config::EnvConfig,
    environment::{Action, Environment, TERMINATION_OBSERVATION},
    termination::{AlphabeticalLineUp, CornerOccupancy, SingleTarget},
};
use rand::{Rng, SeedableRng, rngs::StdRng, seq::IndexedRandom};

fn open_env(width: usize, height: usize, agents: &[(&str, Position)]) -> Environment {
    let mut env = Environment::new("properties", width, height).unwrap();
    for (name, position) in agents {
        env.add_agent(*name, *position).unwrap();
    }
    env.set_max_episodes(10);
    env
}

#[test]
fn occupancy_stays_consistent_under_random_play() {
    let mut rng = StdRng::seed_from_u64(2024);
    let mut env = open_env(
        5,
        4,
        &[
            ("Alice", Position::new(0, 0)),
            ("Bob", Position::new(4, 3)),
            ("Charlie", Position::new(2, 1)),
        ],
    );
    env.grid_mut().set_obstacle(Position::new(2, 2), true).unwrap();
    env.grid_mut()
        .place_item(Position::new(1, 1), Item::carryable(None))
        .unwrap();
    env.set_termination(CornerOccupancy).unwrap();

    for _ in 0..500 {
        let agent_id = rng.random_range(0..env.agent_count());
        let action = *Action::ALL.choose(&mut rng).unwrap();
        env.step(agent_id, action).unwrap();

        assert!(env.occupancy_consistent());
        for agent in env.agents() {
            assert!(env.grid().contains(agent.position()));
            assert!(!env.grid().cell(agent.position()).unwrap().obstacle);
        }
    }
}

#[test]
fn evaluating_twice_changes_nothing() {
    let mut env = open_env(
        6,
        6,
        &[("Alice", Position::new(0, 0)), ("Bob", Position::new(3, 3))],
    );
    env.set_termination(CornerOccupancy).unwrap();
    let first = env.evaluate_termination().unwrap();
    let snapshot = env.grid().clone();
    let second = env.evaluate_termination().unwrap();
    assert_eq!(first, second);
    assert_eq!(env.grid(), &snapshot);
}

#[test]
fn moving_north_from_the_top_row_is_a_no_op() {
    let mut env = open_env(4, 3, &[("Alice", Position::new(1, 2))]);
    env.set_termination(SingleTarget::new(Position::new(0, 0)))
        .unwrap();
    let result = env.step(0, Action::North).unwrap();
    assert_eq!(env.agent(0).unwrap().position(), Position::new(1, 2));
    assert!(result.observation.contains("cannot move further"));
    assert!(!result.terminated);
}

#[test]
fn obstacles_block_movement() {
    let mut env = open_env(3, 3, &[("Alice", Position::new(0, 1))]);
    env.grid_mut().set_obstacle(Position::new(1, 1), true).unwrap();
    env.set_termination(SingleTarget::new(Position::new(2, 2)))
        .unwrap();
    let result = env.step(0, Action::East).unwrap();
    assert_eq!(result.observation, "Cannot move into obstacle.");
    assert_eq!(env.agent(0).unwrap().position(), Position::new(0, 1));
}

#[test]
fn instantiated_agents_start_on_distinct_free_cells() {
    let config = EnvConfig::parse(
        "crowd",
        r#"
grid_size: [4, 4]
num_agents: "<<n>>"
max_episodes: 1
random_variables:
  n: randint(8, 12)
obstacles: [[1, 1], [2, 2]]
termination: corners
"#,
    )
    .unwrap();
    for seed in 0..25 {
        let env = config.instantiate(&mut StdRng::seed_from_u64(seed)).unwrap();
        let positions: HashSet<Position> = env.agents().map(|agent| agent.position()).collect();
        assert_eq!(positions.len(), env.agent_count());
        assert!(!positions.contains(&Position::new(1, 1)));
        assert!(!positions.contains(&Position::new(2, 2)));
        let names: HashSet<&str> = env.agents().map(|agent| agent.name.as_str()).collect();
        assert_eq!(names.len(), env.agent_count());
    }
}

#[test]
fn corner_score_counts_occupied_corners() {
    let mut partial = open_env(
        6,
        6,
        &[
            ("Alice", Position::new(0, 0)),
            ("Bob", Position::new(5, 5)),
            ("Charlie", Position::new(2, 2)),
        ],
    );
    partial.set_termination(CornerOccupancy).unwrap();
    let evaluation = partial.evaluate_termination().unwrap();
    assert!(!evaluation.success);
    assert_eq!(partial.score(), 50.0);

    let mut full = open_env(
        6,
        6,
        &[
            ("Alice", Position::new(0, 0)),
            ("Bob", Position::new(5, 5)),
            ("Charlie", Position::new(0, 5)),
            ("Diana", Position::new(5, 0)),
        ],
    );
    full.set_termination(CornerOccupancy).unwrap();
    let evaluation = full.evaluate_termination().unwrap();
    assert!(evaluation.success);
    assert_eq!(full.score(), 100.0);
    assert!(full.terminated());
}

#[test]
fn alphabetical_line_up_follows_names_not_ids() {
    let mut ordered = open_env(
        3,
        2,
        &[("Bob", Position::new(1, 0)), ("Alice", Position::new(0, 0))],
    );
    ordered.set_termination(AlphabeticalLineUp).unwrap();
    assert!(ordered.evaluate_termination().unwrap().success);
    assert_eq!(ordered.score(), 100.0);

    let mut swapped = open_env(
        3,
        2,
        &[("Bob", Position::new(0, 0)), ("Alice", Position::new(1, 0))],
    );
    swapped.set_termination(AlphabeticalLineUp).unwrap();
    assert!(!swapped.evaluate_termination().unwrap().success);
    assert_eq!(swapped.score(), 0.0);
}

#[test]
fn reserved_items_refuse_other_agents() {
    let roster: Vec<(String, Position)> = (0..6)
        .map(|i| (format!("Agent{}", i), Position::new(i, 0)))
        .collect();
    let mut env = Environment::new("permissions", 6, 3).unwrap();
    for (name, position) in &roster {
        env.add_agent(name.as_str(), *position).unwrap();
    }
    env.grid_mut()
        .place_item(Position::new(5, 0), Item::carryable(Some(3)))
        .unwrap();
    env.set_termination(SingleTarget::new(Position::new(0, 2)))
        .unwrap();

    let result = env.step(5, Action::Pick).unwrap();
    assert_eq!(
        result.observation,
        "You are not authorized to pick up this item."
    );
    assert!(env.agent(5).unwrap().held_item().is_none());
    assert_eq!(
        env.grid().cell(Position::new(5, 0)).unwrap().top_item(),
        Some(&Item::carryable(Some(3)))
    );
}

#[test]
fn broadcasts_skip_the_sender() {
    let mut env = open_env(
        4,
        4,
        &[
            ("Alice", Position::new(0, 0)),
            ("Bob", Position::new(1, 0)),
            ("Charlie", Position::new(2, 0)),
        ],
    );
    env.broadcast(1, "Meet at (3, 3)").unwrap();
    assert!(env.agent(1).unwrap().inbox().is_empty());
    for id in [0, 2] {
        let received: Vec<&str> = env
            .agent(id)
            .unwrap()
            .inbox()
            .peek()
            .map(|message| message.content.as_str())
            .collect();
        assert_eq!(received, vec!["Meet at (3, 3)"]);
    }
    assert_eq!(env.agent(1).unwrap().messages_sent(), ["Meet at (3, 3)"]);
    assert_eq!(env.group_messages().len(), 1);
}

#[test]
fn a_satisfied_condition_preempts_the_action() {
    let mut env = open_env(3, 3, &[("Alice", Position::new(1, 1))]);
    env.set_termination(SingleTarget::new(Position::new(1, 1)))
        .unwrap();
    let result = env.step(0, Action::North).unwrap();
    assert_eq!(result.observation, TERMINATION_OBSERVATION);
    assert!(result.terminated);
    assert_eq!(result.score, 100.0);
    assert_eq!(env.agent(0).unwrap().position(), Position::new(1, 1));

    let again = env.step(0, Action::East).unwrap();
    assert_eq!(again.observation, TERMINATION_OBSERVATION);
    assert_eq!(env.agent(0).unwrap().position(), Position::new(1, 1));
}
