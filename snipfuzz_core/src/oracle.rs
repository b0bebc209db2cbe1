use crate::executor::SendFault;
use crate::input::Message;
use chrono::{DateTime, Local};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Everything needed to reproduce a device crash.
#[derive(Debug, Clone)]
pub struct CrashReport {
    /// The message sequence whose send ended in silence, mutated content included.
    pub messages: Vec<Message>,
    /// Position of the message that went unanswered.
    pub index: usize,
    /// Whether the device died while the restore seed was being replayed.
    pub during_restore: bool,
    /// MD5 of the unanswered message's content, or of the last sequence message when
    /// the restore replay died. Used for log correlation.
    pub content_hash: String,
    pub detected_at: DateTime<Local>,
}

impl CrashReport {
    pub fn file_name(&self) -> String {
        format!("Crash-{}.txt", self.detected_at.format("%Y%m%d-%H%M%S"))
    }

    /// `Message Index-K` followed by that message's header lines, for every message.
    ///
    /// `Content` is written as the raw bytes that were sent, so mutated payloads
    /// that are not valid UTF-8 survive unchanged.
    pub fn render(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (index, message) in self.messages.iter().enumerate() {
            out.extend_from_slice(format!("Message Index-{index}\n").as_bytes());
            out.extend_from_slice(&message.header_bytes());
        }
        out
    }

    pub fn write_to(&self, dir: &Path) -> io::Result<PathBuf> {
        fs::create_dir_all(dir)?;
        let path = dir.join(self.file_name());
        fs::write(&path, self.render())?;
        Ok(path)
    }
}

/// Decides whether a failed send is a bug worth reporting.
pub trait Oracle: Send + Sync {
    /// Examines the fault a sequence send ended with.
    ///
    /// # Arguments
    /// * `fault`: How the send stopped.
    /// * `messages`: The sequence that was on the wire, mutated content included.
    ///
    /// # Returns
    /// `Some(CrashReport)` when the fault is reportable, otherwise `None`.
    fn examine(&self, fault: &SendFault, messages: &[Message]) -> Option<CrashReport>;
}

/// Reports a `SendFault::Crash`; transport faults point at the harness, not the target.
#[derive(Debug, Default)]
pub struct CrashOracle;

impl CrashOracle {
    pub fn new() -> Self {
        CrashOracle
    }
}

impl Oracle for CrashOracle {
    fn examine(&self, fault: &SendFault, messages: &[Message]) -> Option<CrashReport> {
        match fault {
            SendFault::Crash {
                index,
                during_restore,
            } => {
                let trigger = if *during_restore {
                    messages.last()
                } else {
                    messages.get(*index)
                };
                let digest = md5::compute(trigger.map(Message::content).unwrap_or_default());
                Some(CrashReport {
                    messages: messages.to_vec(),
                    index: *index,
                    during_restore: *during_restore,
                    content_hash: format!("{:x}", digest),
                    detected_at: Local::now(),
                })
            }
            SendFault::Transport { .. } => None,
        }
    }
}
