use crate::config::MutationSettings;
use crate::corpus::SeedQueue;
use crate::input::Seed;
use crate::mutator::Mutation;
use rand::Rng;
use rand_core::RngCore;
use std::ops::Range;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SchedulerError {
    /// No seed in the queue has a snippet to mutate.
    #[error("No queued seed has any snippet to mutate")]
    NothingToMutate,
}

/// One havoc iteration's target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HavocPick {
    pub seed: usize,
    pub message: usize,
    pub snippet: Range<usize>,
    pub mutation: Mutation,
}

/// Chooses what the next havoc iteration mutates.
pub trait Scheduler: Send + Sync {
    /// Selects a seed, message, snippet and operator from `queue`.
    ///
    /// Returns `SchedulerError::NothingToMutate` when no queued seed has a snippet.
    fn next(&mut self, queue: &SeedQueue, rng: &mut dyn RngCore) -> Result<HavocPick, SchedulerError>;
}

/// Uniform random choice of seed, message, snippet and operator.
#[derive(Debug, Clone)]
pub struct HavocScheduler {
    settings: MutationSettings,
}

impl HavocScheduler {
    pub fn new(settings: MutationSettings) -> Self {
        Self { settings }
    }
}

impl Scheduler for HavocScheduler {
    /// Picks a target among seeds that have at least one snippet.
    ///
    /// Messages without snippets (empty content) are never chosen.
    fn next(&mut self, queue: &SeedQueue, rng: &mut dyn RngCore) -> Result<HavocPick, SchedulerError> {
        let seed_id = queue
            .random_select(rng, |seed| seed.snippet_count() > 0)
            .ok_or(SchedulerError::NothingToMutate)?;
        let seed = queue.get(seed_id).ok_or(SchedulerError::NothingToMutate)?;

        let messages = mutable_messages(seed);
        if messages.is_empty() {
            return Err(SchedulerError::NothingToMutate);
        }
        let message = messages[rng.random_range(0..messages.len())];
        let ranges = seed.snippets[message].ranges();
        let snippet = ranges[rng.random_range(0..ranges.len())].clone();

        Ok(HavocPick {
            seed: seed_id,
            message,
            snippet,
            mutation: Mutation::random(&self.settings, rng),
        })
    }
}

fn mutable_messages(seed: &Seed) -> Vec<usize> {
    seed.snippets
        .iter()
        .enumerate()
        .filter(|(_, map)| !map.ranges().is_empty())
        .map(|(index, _)| index)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::test_utils::socket_message;
    use crate::probe::ProbeResult;
    use crate::snippet::SnippetMap;
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;
    use std::collections::HashSet;

    fn seed_with_snippets(contents: &[&str]) -> Seed {
        let mut seed = Seed::new(contents.iter().map(|c| socket_message(c)).collect());
        seed.probes = contents
            .iter()
            .map(|c| ProbeResult::unprobeable(c.len()))
            .collect();
        seed.snippets = seed.probes.iter().map(SnippetMap::form).collect();
        seed
    }

    #[test]
    fn empty_queue_has_nothing_to_mutate() {
        let mut scheduler = HavocScheduler::new(MutationSettings::default());
        let mut rng = ChaCha8Rng::from_seed([0; 32]);
        assert_eq!(
            scheduler.next(&SeedQueue::new(), &mut rng),
            Err(SchedulerError::NothingToMutate)
        );
        let queue = SeedQueue::from_seeds(vec![seed_with_snippets(&[""])]);
        assert_eq!(
            scheduler.next(&queue, &mut rng),
            Err(SchedulerError::NothingToMutate)
        );
    }

    #[test]
    fn picks_only_messages_and_snippets_that_exist() {
        let mut scheduler = HavocScheduler::new(MutationSettings::default());
        let mut rng = ChaCha8Rng::from_seed([9; 32]);
        let queue = SeedQueue::from_seeds(vec![
            seed_with_snippets(&[""]),
            seed_with_snippets(&["abcd", "", "xy"]),
        ]);

        let mut messages = HashSet::new();
        for _ in 0..100 {
            let pick = scheduler.next(&queue, &mut rng).unwrap();
            assert_eq!(pick.seed, 1);
            assert_ne!(pick.message, 1);
            let content_len = queue.get(1).unwrap().messages[pick.message].content().len();
            assert_eq!(pick.snippet, 0..content_len);
            messages.insert(pick.message);
        }
        assert_eq!(messages, HashSet::from([0, 2]));
    }
}
