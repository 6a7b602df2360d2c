use std::path::{Path, PathBuf};

use dedup_engine::{DedupEngine, EngineConfig};

/// Scratch directory for a single test, removed on drop.
pub struct TestDir {
    path: PathBuf,
}

impl TestDir {
    pub fn new(name: &str) -> Self {
        let path = PathBuf::from(format!(".testdir-{name}"));
        if let Err(_e) = std::fs::remove_dir_all(&path) { /* ignore */ }
        std::fs::create_dir_all(&path).unwrap();
        Self {
            path: path.canonicalize().unwrap(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TestDir {
    fn drop(&mut self) {
        if let Err(_e) = std::fs::remove_dir_all(&self.path) { /* ignore */ }
    }
}

pub fn engine_config(dir: &TestDir) -> EngineConfig {
    EngineConfig::parse(&EngineConfig::example(dir.path())).unwrap()
}

pub fn create_engine(dir: &TestDir) -> DedupEngine {
    DedupEngine::create(engine_config(dir)).unwrap()
}

pub fn reopen_engine(dir: &TestDir) -> DedupEngine {
    DedupEngine::open(engine_config(dir), false).unwrap()
}

/// Deterministic pseudo-random block content.
pub fn random_block(seed: u64, size: usize) -> Vec<u8> {
    use rand::{RngCore, SeedableRng};
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let mut data = vec![0u8; size];
    rng.fill_bytes(&mut data);
    data
}
