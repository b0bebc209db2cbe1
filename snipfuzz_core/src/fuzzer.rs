use crate::config::{FuzzerSettings, MutationSettings, SnipfuzzConfig};
use crate::corpus::SeedQueue;
use crate::executor::{Messenger, Phase, SendFault, Transport, TransportError};
use crate::feedback::Verdict;
use crate::input::{Message, Seed};
use crate::mutator::{Mutation, targeted_plan};
use crate::oracle::{CrashOracle, Oracle};
use crate::probe::Prober;
use crate::scheduler::{HavocScheduler, Scheduler, SchedulerError};
use rand_core::RngCore;
use std::ops::Range;
use std::path::{Path, PathBuf};
use thiserror::Error;

const HAVOC_PROGRESS_INTERVAL: u64 = 100;

#[derive(Error, Debug)]
pub enum FuzzError {
    #[error("Restore seed failed validation: {0}")]
    Restore(SendFault),
    #[error("Dry run of seed {seed} failed: {fault}")]
    DryRun { seed: usize, fault: SendFault },
    #[error("Failed to write crash report to {dir:?}: {reason}")]
    CrashOutput { dir: PathBuf, reason: String },
    #[error("No seed with id {0}")]
    UnknownSeed(usize),
    #[error("Seed {seed} has no message {message}")]
    UnknownMessage { seed: usize, message: usize },
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

/// Why `Fuzzer::run` stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEnd {
    /// The device stopped answering; the report was written to this path.
    Crash(PathBuf),
    /// Too many consecutive transport faults during havoc.
    TransportFailure(TransportError),
    /// The configured havoc iteration limit was reached.
    HavocExhausted,
    NothingToMutate,
}

/// Result of one mutated send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trial {
    /// The response was empty or matched a known class.
    Known,
    /// The response was new; the mutated sequence was queued under this id.
    Promoted(usize),
    /// The mutated payload could not be encoded, so the device was never contacted.
    Rejected,
    Crashed(PathBuf),
    Fault(TransportError),
}

/// How a targeted pass over one seed ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassEnd {
    Completed,
    Aborted(TransportError),
    Crashed(PathBuf),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FuzzStats {
    pub trials: u64,
    pub promotions: u64,
    pub transport_faults: u64,
    pub havoc_iterations: u64,
}

/// One fuzzing session against one device.
///
/// Owns the messenger (and with it the restore seed), the seed queue, the
/// output directory and the random source, so every phase runs against the
/// same explicit state.
pub struct Fuzzer<T: Transport, R: RngCore> {
    messenger: Messenger<T>,
    queue: SeedQueue,
    prober: Prober,
    scheduler: HavocScheduler,
    oracle: CrashOracle,
    mutation: MutationSettings,
    settings: FuzzerSettings,
    output_dir: PathBuf,
    rng: R,
    stats: FuzzStats,
}

impl<T: Transport, R: RngCore> Fuzzer<T, R> {
    pub fn new(
        messenger: Messenger<T>,
        queue: SeedQueue,
        config: &SnipfuzzConfig,
        output_dir: PathBuf,
        rng: R,
    ) -> Self {
        Self {
            messenger,
            queue,
            prober: Prober::new(&config.probe),
            scheduler: HavocScheduler::new(config.mutation.clone()),
            oracle: CrashOracle::new(),
            mutation: config.mutation.clone(),
            settings: config.fuzzer.clone(),
            output_dir,
            rng,
            stats: FuzzStats::default(),
        }
    }

    pub fn queue(&self) -> &SeedQueue {
        &self.queue
    }

    pub fn messenger(&self) -> &Messenger<T> {
        &self.messenger
    }

    pub fn stats(&self) -> &FuzzStats {
        &self.stats
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn validate_restore(&mut self) -> Result<(), FuzzError> {
        self.messenger.validate_restore().map_err(FuzzError::Restore)?;
        tracing::info!(
            messages = self.messenger.restore_seed().messages.len(),
            "Restore seed validated"
        );
        Ok(())
    }

    /// Replays every queued seed once to record its baseline responses.
    pub fn dry_run_all(&mut self) -> Result<(), FuzzError> {
        for id in 0..self.queue.len() {
            let Some(seed) = self.queue.get_mut(id) else {
                continue;
            };
            self.messenger
                .dry_run(seed)
                .map_err(|fault| FuzzError::DryRun { seed: id, fault })?;
            tracing::debug!(seed = id, responses = ?seed.responses, "Dry run complete");
        }
        tracing::info!(seeds = self.queue.len(), "Dry run complete");
        Ok(())
    }

    /// Probes every queued seed and forms its snippets.
    ///
    /// A seed whose probe hits a transport fault is dropped from the queue and
    /// the remaining seeds are still probed. Returns the crash report path if
    /// the device died while being probed.
    pub fn probe_all(&mut self) -> Result<Option<PathBuf>, FuzzError> {
        let mut pending = std::mem::take(&mut self.queue).into_seeds().into_iter().enumerate();
        let mut kept = Vec::with_capacity(pending.len());

        while let Some((id, mut seed)) = pending.next() {
            let probe_fault = match self.prober.probe_seed(&mut self.messenger, &mut seed) {
                Ok(()) => {
                    seed.form_snippets();
                    kept.push(seed);
                    continue;
                }
                Err(probe_fault) => probe_fault,
            };
            match &probe_fault.fault {
                SendFault::Crash { .. } => {
                    kept.push(seed);
                    kept.extend(pending.map(|(_, seed)| seed));
                    self.queue = SeedQueue::from_seeds(kept);
                    return self
                        .record_crash(&probe_fault.fault, &probe_fault.messages)
                        .map(Some);
                }
                SendFault::Transport { error, .. } => {
                    self.stats.transport_faults += 1;
                    tracing::warn!(
                        seed = id,
                        message = probe_fault.message,
                        error = %error,
                        "Probe aborted by transport fault, dropping seed"
                    );
                }
            }
        }

        self.queue = SeedQueue::from_seeds(kept);
        tracing::info!(seeds = self.queue.len(), "Probing complete");
        Ok(None)
    }

    /// Runs every targeted mutation on every snippet of seed `id`, once.
    ///
    /// A transport fault ends the pass early; the seed is marked mutated either way.
    pub fn targeted_pass(&mut self, id: usize) -> Result<PassEnd, FuzzError> {
        let seed = self.queue.get_mut(id).ok_or(FuzzError::UnknownSeed(id))?;
        if seed.snippets.len() != seed.probes.len() {
            seed.form_snippets();
        }
        let targets: Vec<(usize, Range<usize>)> = seed
            .snippets
            .iter()
            .enumerate()
            .flat_map(|(message, map)| map.ranges().iter().cloned().map(move |r| (message, r)))
            .collect();
        tracing::info!(seed = id, snippets = targets.len(), "Targeted mutation pass");

        let mut end = PassEnd::Completed;
        'targets: for (message, range) in targets {
            for mutation in targeted_plan(&self.mutation, &mut self.rng) {
                match self.trial(id, message, range.clone(), &mutation)? {
                    Trial::Crashed(path) => return Ok(PassEnd::Crashed(path)),
                    Trial::Fault(error) => {
                        tracing::warn!(seed = id, message, error = %error, "Targeted pass aborted");
                        end = PassEnd::Aborted(error);
                        break 'targets;
                    }
                    Trial::Known | Trial::Promoted(_) | Trial::Rejected => {}
                }
            }
        }

        if let Some(seed) = self.queue.get_mut(id) {
            seed.mutated = true;
        }
        Ok(end)
    }

    /// One random mutation of a random snippet anywhere in the queue.
    pub fn havoc_step(&mut self) -> Result<Trial, FuzzError> {
        let pick = self.scheduler.next(&self.queue, &mut self.rng)?;
        self.stats.havoc_iterations += 1;
        tracing::debug!(
            seed = pick.seed,
            message = pick.message,
            snippet = ?pick.snippet,
            mutation = %pick.mutation,
            "Havoc"
        );
        self.trial(pick.seed, pick.message, pick.snippet, &pick.mutation)
    }

    /// Targeted passes for every unmutated seed, then havoc until a terminal condition.
    pub fn run(&mut self) -> Result<RunEnd, FuzzError> {
        let mut consecutive_faults = 0u32;
        loop {
            while let Some(id) = self.queue.next_unmutated() {
                if let PassEnd::Crashed(path) = self.targeted_pass(id)? {
                    return Ok(RunEnd::Crash(path));
                }
            }

            if self
                .settings
                .max_havoc_iterations
                .is_some_and(|max| self.stats.havoc_iterations >= max)
            {
                tracing::info!(stats = ?self.stats, "Havoc iteration limit reached");
                return Ok(RunEnd::HavocExhausted);
            }

            let trial = match self.havoc_step() {
                Ok(trial) => trial,
                Err(FuzzError::Scheduler(SchedulerError::NothingToMutate)) => {
                    tracing::warn!("No snippets left to mutate");
                    return Ok(RunEnd::NothingToMutate);
                }
                Err(e) => return Err(e),
            };
            match trial {
                Trial::Crashed(path) => return Ok(RunEnd::Crash(path)),
                Trial::Fault(error) => {
                    consecutive_faults += 1;
                    tracing::warn!(consecutive = consecutive_faults, error = %error, "Havoc send failed");
                    if consecutive_faults >= self.settings.max_consecutive_transport_faults {
                        return Ok(RunEnd::TransportFailure(error));
                    }
                }
                Trial::Rejected => {}
                Trial::Known | Trial::Promoted(_) => consecutive_faults = 0,
            }

            if self.stats.havoc_iterations % HAVOC_PROGRESS_INTERVAL == 0 {
                tracing::info!(
                    iterations = self.stats.havoc_iterations,
                    queue = self.queue.len(),
                    promotions = self.stats.promotions,
                    faults = self.stats.transport_faults,
                    "Havoc progress"
                );
            }
        }
    }

    /// Sends seed `seed_id` with `mutation` applied to `range` of message `message`.
    ///
    /// The queued seed is never modified; a novel response promotes a copy
    /// carrying the mutated content.
    fn trial(
        &mut self,
        seed_id: usize,
        message: usize,
        range: Range<usize>,
        mutation: &Mutation,
    ) -> Result<Trial, FuzzError> {
        let seed = self.queue.get(seed_id).ok_or(FuzzError::UnknownSeed(seed_id))?;
        let original = seed
            .messages
            .get(message)
            .ok_or(FuzzError::UnknownMessage {
                seed: seed_id,
                message,
            })?;
        let content = mutation.apply(original.content(), range, &mut self.rng);
        let mut messages = seed.messages.clone();
        messages[message] = original.with_content(content);

        self.stats.trials += 1;
        let responses = match self.messenger.send_seed(&messages, &seed.responses, Phase::Live) {
            Ok(responses) => responses,
            Err(SendFault::Transport { error, .. }) if error.is_payload_error() => {
                tracing::debug!(seed = seed_id, message, mutation = %mutation, error = %error, "Mutated payload rejected");
                return Ok(Trial::Rejected);
            }
            Err(SendFault::Transport { error, .. }) => {
                self.stats.transport_faults += 1;
                return Ok(Trial::Fault(error));
            }
            Err(fault @ SendFault::Crash { .. }) => {
                return self.record_crash(&fault, &messages).map(Trial::Crashed);
            }
        };

        let response = responses.get(message).map(String::as_str).unwrap_or_default();
        let verdict = seed
            .probes
            .get(message)
            .map_or(Verdict::Silent, |probe| probe.pool.judge(response));
        match verdict {
            Verdict::Novel => {
                tracing::info!(seed = seed_id, message, mutation = %mutation, response, "Novel response");
                self.promote(messages)
            }
            Verdict::Known(_) | Verdict::Silent => Ok(Trial::Known),
        }
    }

    /// Validates, probes and enqueues a new seed built from `messages`.
    fn promote(&mut self, messages: Vec<Message>) -> Result<Trial, FuzzError> {
        let mut candidate = Seed::new(messages);
        if let Err(fault) = self.messenger.dry_run(&mut candidate) {
            return match fault {
                SendFault::Transport { error, .. } => {
                    tracing::warn!(error = %error, "Dry run of promoted seed failed");
                    self.stats.transport_faults += 1;
                    Ok(Trial::Fault(error))
                }
                SendFault::Crash { .. } => self
                    .record_crash(&fault, &candidate.messages)
                    .map(Trial::Crashed),
            };
        }

        if let Err(probe_fault) = self.prober.probe_seed(&mut self.messenger, &mut candidate) {
            return match probe_fault.fault {
                SendFault::Transport { error, .. } => {
                    tracing::warn!(error = %error, "Probe of promoted seed failed");
                    self.stats.transport_faults += 1;
                    Ok(Trial::Fault(error))
                }
                SendFault::Crash { .. } => self
                    .record_crash(&probe_fault.fault, &probe_fault.messages)
                    .map(Trial::Crashed),
            };
        }
        candidate.form_snippets();

        let id = self.queue.push(candidate);
        self.stats.promotions += 1;
        tracing::info!(seed = id, queue = self.queue.len(), "New seed queued");
        Ok(Trial::Promoted(id))
    }

    fn record_crash(&self, fault: &SendFault, messages: &[Message]) -> Result<PathBuf, FuzzError> {
        let report = self
            .oracle
            .examine(fault, messages)
            .ok_or_else(|| FuzzError::CrashOutput {
                dir: self.output_dir.clone(),
                reason: format!("not a crash: {fault}"),
            })?;
        let path = report
            .write_to(&self.output_dir)
            .map_err(|e| FuzzError::CrashOutput {
                dir: self.output_dir.clone(),
                reason: e.to_string(),
            })?;
        tracing::error!(
            path = %path.display(),
            message = report.index,
            during_restore = report.during_restore,
            content_md5 = %report.content_hash,
            "Device crash detected"
        );
        Ok(path)
    }
}
