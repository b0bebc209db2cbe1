pub mod config;
pub mod corpus;
pub mod executor;
pub mod feedback;
pub mod fuzzer;
pub mod input;
pub mod mutator;
pub mod oracle;
pub mod probe;
pub mod record;
pub mod scheduler;
pub mod session;
pub mod similarity;
pub mod snippet;

pub use config::SnipfuzzConfig;
pub use corpus::{CorpusError, SeedQueue, load_seed_file, load_seed_folder};
pub use executor::{
    Attempt, Messenger, Outcome, Phase, RetryPolicy, RoutedTransport, SendFault, SocketTransport,
    Transport, TransportError,
};
pub use feedback::{ResponseClass, ResponsePool, Verdict};
pub use fuzzer::{FuzzError, FuzzStats, Fuzzer, PassEnd, RunEnd, Trial};
pub use input::{DeviceFingerprint, InputError, Message, Route, RouteDefaults, Seed};
pub use mutator::{Mutation, targeted_plan};
pub use oracle::{CrashOracle, CrashReport, Oracle};
pub use probe::{ProbeFault, ProbeResult, Prober};
pub use record::{RecordError, read_record, write_record};
pub use scheduler::{HavocPick, HavocScheduler, Scheduler, SchedulerError};
pub use session::{SessionCapability, SessionError, SessionManager, SessionTransport, UnavailableSession};
pub use similarity::similarity;
pub use snippet::{ClusterMerge, SnippetMap};
