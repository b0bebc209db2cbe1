use crate::input::{InputError, RouteDefaults, Seed};
use rand_core::RngCore;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised while loading session files into seeds.
#[derive(Error, Debug)]
pub enum CorpusError {
    #[error("I/O error: {0}")]
    Io(String),
    #[error("Session file {path:?} is invalid: {source}")]
    Input {
        path: PathBuf,
        #[source]
        source: InputError,
    },
    #[error("No session files found in {0:?}")]
    EmptyFolder(PathBuf),
}

/// The work queue of seeds under fuzzing.
///
/// Append-only for the duration of a run: a seed's id is its position and stays
/// valid until the queue is dropped.
#[derive(Debug, Default)]
pub struct SeedQueue {
    seeds: Vec<Seed>,
}

impl SeedQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_seeds(seeds: Vec<Seed>) -> Self {
        Self { seeds }
    }

    /// Appends a seed and returns its id.
    pub fn push(&mut self, seed: Seed) -> usize {
        self.seeds.push(seed);
        self.seeds.len() - 1
    }

    pub fn get(&self, id: usize) -> Option<&Seed> {
        self.seeds.get(id)
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut Seed> {
        self.seeds.get_mut(id)
    }

    pub fn len(&self) -> usize {
        self.seeds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seeds.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Seed> {
        self.seeds.iter()
    }

    pub fn seeds(&self) -> &[Seed] {
        &self.seeds
    }

    pub fn into_seeds(self) -> Vec<Seed> {
        self.seeds
    }

    /// Lowest id whose targeted pass has not run yet.
    pub fn next_unmutated(&self) -> Option<usize> {
        self.seeds.iter().position(|seed| !seed.mutated)
    }

    /// Uniformly random id among the seeds accepted by `filter`.
    pub fn random_select<F>(&self, rng: &mut dyn RngCore, filter: F) -> Option<usize>
    where
        F: Fn(&Seed) -> bool,
    {
        let candidates: Vec<usize> = self
            .seeds
            .iter()
            .enumerate()
            .filter(|(_, seed)| filter(seed))
            .map(|(id, _)| id)
            .collect();
        if candidates.is_empty() {
            return None;
        }
        let pick = rng.next_u64() as usize % candidates.len();
        candidates.get(pick).copied()
    }
}

/// Reads and parses one captured session file.
pub fn load_seed_file(path: &Path, defaults: &RouteDefaults) -> Result<Seed, CorpusError> {
    let text = fs::read(path)
        .map_err(|e| CorpusError::Io(format!("Failed to read session file {:?}: {}", path, e)))?;
    Seed::parse_session(&String::from_utf8_lossy(&text), defaults).map_err(|source| {
        CorpusError::Input {
            path: path.to_path_buf(),
            source,
        }
    })
}

/// Loads every regular, non-hidden file of `dir` as a seed, in file-name order.
pub fn load_seed_folder(dir: &Path, defaults: &RouteDefaults) -> Result<Vec<Seed>, CorpusError> {
    let entries = fs::read_dir(dir)
        .map_err(|e| CorpusError::Io(format!("Failed to read seed directory {:?}: {}", dir, e)))?;

    let mut paths = Vec::new();
    for entry in entries {
        let entry =
            entry.map_err(|e| CorpusError::Io(format!("Error reading entry in {:?}: {}", dir, e)))?;
        let path = entry.path();
        let hidden = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with('.'));
        if path.is_file() && !hidden {
            paths.push(path);
        }
    }
    paths.sort();

    if paths.is_empty() {
        return Err(CorpusError::EmptyFolder(dir.to_path_buf()));
    }
    let seeds = paths
        .iter()
        .map(|path| load_seed_file(path, defaults))
        .collect::<Result<Vec<_>, _>>()?;
    tracing::info!(seeds = seeds.len(), dir = %dir.display(), "Loaded seed sessions");
    Ok(seeds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;
    use std::collections::HashSet;
    use tempfile::tempdir;

    const SESSION: &str = "========\nIP:127.0.0.1\nPort:80\nContent:00ff\n";

    #[test]
    fn folder_is_loaded_sorted_skipping_hidden_files() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("b.txt"), "========\nIP:10.0.0.2\nPort:1\nContent:bb\n").unwrap();
        fs::write(dir.path().join("a.txt"), "========\nIP:10.0.0.1\nPort:1\nContent:aa\n").unwrap();
        fs::write(dir.path().join(".swp"), "garbage").unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();

        let seeds = load_seed_folder(dir.path(), &RouteDefaults::default()).unwrap();
        assert_eq!(seeds.len(), 2);
        assert_eq!(seeds[0].messages[0].content(), b"aa");
        assert_eq!(seeds[1].messages[0].content(), b"bb");
    }

    #[test]
    fn empty_folder_is_an_error() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            load_seed_folder(dir.path(), &RouteDefaults::default()),
            Err(CorpusError::EmptyFolder(_))
        ));
    }

    #[test]
    fn invalid_session_names_the_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.txt");
        fs::write(&path, "========\nContent:00\n").unwrap();
        match load_seed_file(&path, &RouteDefaults::default()) {
            Err(CorpusError::Input { path: p, source }) => {
                assert_eq!(p, path);
                assert_eq!(source, InputError::NoRoute);
            }
            other => panic!("expected input error, got {other:?}"),
        }
    }

    #[test]
    fn queue_ids_are_stable_and_selection_respects_filter() {
        let seed = Seed::parse_session(SESSION, &RouteDefaults::default()).unwrap();
        let mut queue = SeedQueue::new();
        assert_eq!(queue.push(seed.clone()), 0);
        let mut mutated = seed.clone();
        mutated.mutated = true;
        assert_eq!(queue.push(mutated), 1);
        assert_eq!(queue.push(seed), 2);
        assert_eq!(queue.next_unmutated(), Some(0));

        let mut rng = ChaCha8Rng::from_seed([3; 32]);
        let mut picked = HashSet::new();
        for _ in 0..50 {
            picked.insert(queue.random_select(&mut rng, |s| !s.mutated).unwrap());
        }
        assert_eq!(picked, HashSet::from([0, 2]));
        assert!(queue.random_select(&mut rng, |_| false).is_none());
    }
}
