use std::{fs, path::PathBuf};

use gridbench_core::{
    agent::TargetSeeker,
    benchmark::run_benchmark,
    config::EnvConfig,
    transcript::NullTranscript,
};
use rand::{SeedableRng, rngs::StdRng};

fn config_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../configs")
}

fn shipped() -> Vec<EnvConfig> {
    let mut paths: Vec<PathBuf> = fs::read_dir(config_dir())
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "yaml"))
        .collect();
    paths.sort();
    paths
        .iter()
        .map(|path| EnvConfig::from_file(path).unwrap())
        .collect()
}

#[test]
fn every_shipped_config_instantiates() {
    let configs = shipped();
    assert_eq!(configs.len(), 7);
    for config in &configs {
        for seed in 0..10 {
            let env = config
                .instantiate(&mut StdRng::seed_from_u64(seed))
                .unwrap_or_else(|err| panic!("{}: {}", config.name(), err));
            assert!(env.termination_name().is_some());
            assert!(env.occupancy_consistent());
            let goal = env.variables()["unified_goal"].as_str().unwrap();
            assert!(!goal.contains("<<"), "{}: {}", config.name(), goal);
        }
    }
}

#[test]
fn seeker_solves_single_agent_navigation() {
    let config = EnvConfig::from_file(&config_dir().join("single_agent_navigation.yaml")).unwrap();
    let report =
        run_benchmark(&config, 5, 1, |_, _| TargetSeeker::new(), &mut NullTranscript).unwrap();
    assert_eq!(report.successes, 5);
    assert_eq!(report.mean_score, 100.0);
}
