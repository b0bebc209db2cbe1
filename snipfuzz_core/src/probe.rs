use crate::config::ProbeSettings;
use crate::executor::{Messenger, Phase, SendFault, Transport};
use crate::feedback::{ResponsePool, Verdict};
use crate::input::{Message, Seed};
use std::time::Duration;
use thiserror::Error;

/// Outcome of probing one message: its response classes and the class of every content byte.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProbeResult {
    pub pool: ResponsePool,
    /// `index[k]` is the class produced when content byte `k` was deleted.
    pub index: Vec<usize>,
}

impl ProbeResult {
    /// Every byte in the single placeholder class; used when the baseline was empty.
    pub fn unprobeable(content_len: usize) -> Self {
        Self {
            pool: ResponsePool::unprobeable(),
            index: vec![0; content_len],
        }
    }

    /// Pool and classification are consistent: every entry names an existing class.
    pub fn is_consistent(&self) -> bool {
        self.index.iter().all(|&class| class < self.pool.len())
    }
}

/// A probe send that failed, with the message sequence that was on the wire.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("probe of message {message} failed: {fault}")]
pub struct ProbeFault {
    pub message: usize,
    pub fault: SendFault,
    pub messages: Vec<Message>,
}

/// Byte-deletion differential prober.
///
/// All trials go through the messenger, so the restore seed is replayed after
/// each one and the seed itself is never modified until its probe completes.
pub struct Prober {
    delay: Duration,
}

impl Prober {
    pub fn new(settings: &ProbeSettings) -> Self {
        Self {
            delay: settings.inter_send_delay(),
        }
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self { delay }
    }

    /// Probes every message of `seed` and stores the results on it.
    pub fn probe_seed<T: Transport>(
        &self,
        messenger: &mut Messenger<T>,
        seed: &mut Seed,
    ) -> Result<(), ProbeFault> {
        let mut probes = Vec::with_capacity(seed.messages.len());
        for index in 0..seed.messages.len() {
            probes.push(self.probe_message(messenger, seed, index)?);
        }
        seed.probes = probes;
        seed.snippets.clear();
        tracing::info!(
            messages = seed.messages.len(),
            classes = seed.probes.iter().map(|p| p.pool.len()).sum::<usize>(),
            "Seed probed"
        );
        Ok(())
    }

    /// Assigns every content byte of message `index` to a response class.
    pub fn probe_message<T: Transport>(
        &self,
        messenger: &mut Messenger<T>,
        seed: &Seed,
        index: usize,
    ) -> Result<ProbeResult, ProbeFault> {
        let content = seed.messages[index].content();
        let failed = |fault: SendFault, messages: &[Message]| ProbeFault {
            message: index,
            fault,
            messages: messages.to_vec(),
        };

        let first = messenger
            .send_seed(&seed.messages, &seed.responses, Phase::Validation)
            .map_err(|fault| failed(fault, &seed.messages))?;
        self.pause();
        let second = messenger
            .send_seed(&seed.messages, &seed.responses, Phase::Validation)
            .map_err(|fault| failed(fault, &seed.messages))?;
        self.pause();

        let a = response_at(&first, index);
        let b = response_at(&second, index);
        if a.trim().is_empty() || b.trim().is_empty() {
            tracing::debug!(message = index, "Empty baseline, message is unprobeable");
            return Ok(ProbeResult::unprobeable(content.len()));
        }

        let mut pool = ResponsePool::from_baseline(a, b);
        let mut classes = Vec::with_capacity(content.len());
        for offset in 0..content.len() {
            let mut trial = content.to_vec();
            trial.remove(offset);
            let mut messages = seed.messages.clone();
            messages[index] = seed.messages[index].with_content(trial);

            let class = match messenger.send_seed(&messages, &seed.responses, Phase::Live) {
                Ok(responses) => match pool.judge(response_at(&responses, index)) {
                    Verdict::Silent => 0,
                    Verdict::Known(class) => class,
                    Verdict::Novel => pool.admit(response_at(&responses, index)),
                },
                Err(SendFault::Transport { error, .. }) if error.is_payload_error() => {
                    tracing::debug!(message = index, offset, error = %error, "Trial payload rejected");
                    0
                }
                Err(fault) => return Err(failed(fault, &messages)),
            };
            classes.push(class);
            self.pause();
        }

        tracing::debug!(
            message = index,
            bytes = content.len(),
            classes = pool.len(),
            "Message probed"
        );
        Ok(ProbeResult {
            pool,
            index: classes,
        })
    }

    fn pause(&self) {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
    }
}

fn response_at(responses: &[String], index: usize) -> &str {
    responses.get(index).map(String::as_str).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::test_utils::{FnTransport, ScriptedTransport, no_retry_delay, socket_message};
    use crate::executor::{Attempt, TransportError};
    use crate::input::Seed;

    fn prober() -> Prober {
        Prober::with_delay(Duration::ZERO)
    }

    #[test]
    fn empty_baseline_makes_message_unprobeable_without_trials() {
        let transport = ScriptedTransport::new(Attempt::Closed);
        let mut messenger = Messenger::new(transport, no_retry_delay(3), Seed::default());
        let seed = Seed::new(vec![socket_message("abcd")]);

        let result = prober().probe_message(&mut messenger, &seed, 0).unwrap();
        assert_eq!(result.pool.classes().len(), 1);
        assert_eq!(result.pool.classes()[0].response, "");
        assert_eq!(result.pool.classes()[0].threshold, 100.0);
        assert_eq!(result.index, vec![0, 0, 0, 0]);
        // Only the two baseline sends.
        assert_eq!(messenger.transport().log.len(), 2);
    }

    #[test]
    fn deletion_with_different_response_creates_new_class() {
        let transport = FnTransport::new(|content: &[u8]| {
            if content == b"abcdef" || content.contains(&b'd') {
                Attempt::Reply("OK".to_string())
            } else {
                Attempt::Reply("ERR".to_string())
            }
        });
        let mut messenger = Messenger::new(transport, no_retry_delay(3), Seed::default());
        let mut seed = Seed::new(vec![socket_message("abcdef")]);
        seed.responses = vec!["OK".to_string()];

        let result = prober().probe_message(&mut messenger, &seed, 0).unwrap();
        assert_eq!(result.pool.classes()[0].threshold, 100.0);
        assert_eq!(result.pool.len(), 2);
        assert_eq!(result.pool.classes()[1].response, "ERR");
        assert_eq!(result.pool.classes()[1].threshold, 100.0);
        assert_eq!(result.index, vec![0, 0, 0, 1, 0, 0]);
        assert!(result.is_consistent());
    }

    #[test]
    fn empty_trial_response_falls_into_class_zero() {
        let transport = FnTransport::new(|content: &[u8]| {
            if content.len() == 3 {
                Attempt::Reply("OK".to_string())
            } else {
                Attempt::Closed
            }
        });
        let mut messenger = Messenger::new(transport, no_retry_delay(0), Seed::default());
        let seed = Seed::new(vec![socket_message("abc")]);
        let result = prober().probe_message(&mut messenger, &seed, 0).unwrap();
        assert_eq!(result.index, vec![0, 0, 0]);
        assert_eq!(result.pool.len(), 1);
    }

    #[test]
    fn reprobing_identical_device_is_deterministic() {
        let respond = |content: &[u8]| {
            Attempt::Reply(format!("len={} first={}", content.len(), content[0]))
        };
        let seed = Seed::new(vec![socket_message("0123")]);
        let mut first = Messenger::new(FnTransport::new(respond), no_retry_delay(0), Seed::default());
        let mut second = Messenger::new(FnTransport::new(respond), no_retry_delay(0), Seed::default());
        let a = prober().probe_message(&mut first, &seed, 0).unwrap();
        let b = prober().probe_message(&mut second, &seed, 0).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.index.len(), 4);
    }

    #[test]
    fn payload_rejection_is_classified_not_fatal() {
        let transport = FnTransport::new(|content: &[u8]| {
            if content.len() == 4 {
                Attempt::Reply("OK".to_string())
            } else {
                Attempt::Fault(TransportError::Decode("odd length".to_string()))
            }
        });
        let mut messenger = Messenger::new(transport, no_retry_delay(0), Seed::default());
        let seed = Seed::new(vec![socket_message("aabb")]);
        let result = prober().probe_message(&mut messenger, &seed, 0).unwrap();
        assert_eq!(result.index, vec![0, 0, 0, 0]);
    }

    #[test]
    fn connection_failure_aborts_probe() {
        let transport = FnTransport::new(|content: &[u8]| {
            if content.len() == 2 {
                Attempt::Reply("OK".to_string())
            } else {
                Attempt::Fault(TransportError::Connect("refused".to_string()))
            }
        });
        let mut messenger = Messenger::new(transport, no_retry_delay(0), Seed::default());
        let seed = Seed::new(vec![socket_message("ab")]);
        assert!(matches!(
            prober().probe_message(&mut messenger, &seed, 0),
            Err(ProbeFault {
                fault: SendFault::Transport { .. },
                ..
            })
        ));
    }

    #[test]
    fn probe_seed_fills_one_result_per_message() {
        let transport = FnTransport::new(|content: &[u8]| {
            Attempt::Reply(String::from_utf8_lossy(content).into_owned())
        });
        let mut messenger = Messenger::new(transport, no_retry_delay(0), Seed::default());
        let mut seed = Seed::new(vec![socket_message("ab"), socket_message("xyz")]);
        prober().probe_seed(&mut messenger, &mut seed).unwrap();
        assert!(seed.is_probed());
        assert_eq!(seed.probes[0].index.len(), 2);
        assert_eq!(seed.probes[1].index.len(), 3);
        assert!(seed.probes.iter().all(ProbeResult::is_consistent));
    }
}
