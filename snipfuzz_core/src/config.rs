use crate::input::RouteDefaults;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct TransportSettings {
    #[serde(default = "default_socket_timeout_ms")]
    pub socket_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_session_cmd")]
    pub default_session_cmd: u32,
    #[serde(default = "default_session_version")]
    pub default_session_version: String,
}

fn default_socket_timeout_ms() -> u64 {
    2000
}
fn default_connect_timeout_ms() -> u64 {
    2000
}
fn default_read_buffer_size() -> usize {
    2048
}
pub fn default_max_retries() -> u32 {
    3
}
fn default_retry_backoff_ms() -> u64 {
    250
}
fn default_session_cmd() -> u32 {
    RouteDefaults::default().session_cmd
}
fn default_session_version() -> String {
    RouteDefaults::default().session_version
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            socket_timeout_ms: default_socket_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            read_buffer_size: default_read_buffer_size(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            default_session_cmd: default_session_cmd(),
            default_session_version: default_session_version(),
        }
    }
}

impl TransportSettings {
    pub fn socket_timeout(&self) -> Duration {
        Duration::from_millis(self.socket_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn route_defaults(&self) -> RouteDefaults {
        RouteDefaults {
            session_cmd: self.default_session_cmd,
            session_version: self.default_session_version.clone(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ProbeSettings {
    /// Pause between consecutive sends while probing; gives the device time to settle.
    #[serde(default = "default_inter_send_delay_ms")]
    pub inter_send_delay_ms: u64,
}

fn default_inter_send_delay_ms() -> u64 {
    1000
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            inter_send_delay_ms: default_inter_send_delay_ms(),
        }
    }
}

impl ProbeSettings {
    pub fn inter_send_delay(&self) -> Duration {
        Duration::from_millis(self.inter_send_delay_ms)
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct MutationSettings {
    #[serde(default = "default_repeat_min")]
    pub repeat_min: usize,
    #[serde(default = "default_repeat_max")]
    pub repeat_max: usize,
    #[serde(default = "default_interesting_literals")]
    pub interesting_literals: Vec<String>,
}

fn default_repeat_min() -> usize {
    2
}
fn default_repeat_max() -> usize {
    5
}
pub fn default_interesting_literals() -> Vec<String> {
    ["on", "off", "True", "False", "0", "1"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for MutationSettings {
    fn default() -> Self {
        Self {
            repeat_min: default_repeat_min(),
            repeat_max: default_repeat_max(),
            interesting_literals: default_interesting_literals(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FuzzerSettings {
    /// Havoc stops after this many iterations; unbounded when absent.
    #[serde(default)]
    pub max_havoc_iterations: Option<u64>,
    #[serde(default)]
    pub rng_seed: Option<u64>,
    #[serde(default = "default_max_consecutive_transport_faults")]
    pub max_consecutive_transport_faults: u32,
    #[serde(default = "default_record_file_name")]
    pub record_file_name: String,
}

fn default_max_consecutive_transport_faults() -> u32 {
    16
}
pub fn default_record_file_name() -> String {
    "ProbeRecord.txt".to_string()
}

impl Default for FuzzerSettings {
    fn default() -> Self {
        Self {
            max_havoc_iterations: None,
            rng_seed: None,
            max_consecutive_transport_faults: default_max_consecutive_transport_faults(),
            record_file_name: default_record_file_name(),
        }
    }
}

impl FuzzerSettings {
    /// Deterministic generator when `rng-seed` is set, OS-seeded otherwise.
    pub fn make_rng(&self) -> ChaCha8Rng {
        match self.rng_seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_os_rng(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct SnipfuzzConfig {
    #[serde(default)]
    pub transport: TransportSettings,
    #[serde(default)]
    pub probe: ProbeSettings,
    #[serde(default)]
    pub mutation: MutationSettings,
    #[serde(default)]
    pub fuzzer: FuzzerSettings,
}

impl SnipfuzzConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;
        Self::from_toml_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })
    }

    pub fn from_toml_str(content: &str) -> Result<Self, anyhow::Error> {
        let config: SnipfuzzConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        let mutation = &self.mutation;
        if mutation.repeat_min == 0 || mutation.repeat_min > mutation.repeat_max {
            anyhow::bail!(
                "repeat-min ({}) must be at least 1 and not exceed repeat-max ({})",
                mutation.repeat_min,
                mutation.repeat_max
            );
        }
        if mutation.interesting_literals.is_empty() {
            anyhow::bail!("interesting-literals must not be empty");
        }
        if self.transport.read_buffer_size == 0 {
            anyhow::bail!("read-buffer-size must be greater than zero");
        }
        Ok(())
    }
}
