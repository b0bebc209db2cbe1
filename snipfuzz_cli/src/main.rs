use snipfuzz_core::config::SnipfuzzConfig;
use snipfuzz_core::corpus::{SeedQueue, load_seed_file, load_seed_folder};
use snipfuzz_core::executor::{Messenger, RetryPolicy, RoutedTransport, SocketTransport};
use snipfuzz_core::fuzzer::{Fuzzer, RunEnd};
use snipfuzz_core::record::{read_record, write_record};
use snipfuzz_core::session::UnavailableSession;

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_FILE: &str = "snipfuzz.toml";

#[derive(Parser, Debug)]
#[clap(author, version, about = "Snippet-based black-box fuzzer for IoT protocols", long_about = None)]
struct Cli {
    /// Folder of captured session files used as seeds.
    #[clap(short, long, value_parser)]
    input_folder: PathBuf,
    /// Session replayed after every send to reset the device.
    #[clap(short, long, value_parser)]
    restore_file: PathBuf,
    /// Where the probe record and crash reports are written.
    #[clap(short, long, value_parser)]
    output_folder: PathBuf,
    /// Probe record from an earlier run; skips dry run and probing when it exists.
    #[clap(short = 'c', long, value_parser)]
    record_file: Option<PathBuf>,
    #[clap(long, value_parser)]
    config_file: Option<PathBuf>,
    #[clap(long)]
    rng_seed: Option<u64>,
    #[clap(long)]
    havoc_iterations: Option<u64>,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

fn load_config(cli: &Cli) -> Result<SnipfuzzConfig, anyhow::Error> {
    let mut config = match &cli.config_file {
        Some(config_path) => {
            tracing::info!(path = ?config_path, "Loading configuration");
            SnipfuzzConfig::load_from_file(config_path)?
        }
        None => {
            let default_config_path = PathBuf::from(DEFAULT_CONFIG_FILE);
            if default_config_path.exists() {
                tracing::info!(path = ?default_config_path, "Loading default configuration");
                SnipfuzzConfig::load_from_file(&default_config_path)?
            } else {
                tracing::info!("No configuration file found, using built-in defaults");
                SnipfuzzConfig::default()
            }
        }
    };

    if let Some(seed) = cli.rng_seed {
        config.fuzzer.rng_seed = Some(seed);
    }
    if let Some(iterations) = cli.havoc_iterations {
        config.fuzzer.max_havoc_iterations = Some(iterations);
    }
    config.validate()?;
    Ok(config)
}

fn run(cli: Cli) -> Result<ExitCode, anyhow::Error> {
    let config = load_config(&cli)?;
    tracing::debug!(?config, "Effective configuration");

    std::fs::create_dir_all(&cli.output_folder).map_err(|e| {
        anyhow::anyhow!("Failed to create output folder {:?}: {}", cli.output_folder, e)
    })?;

    let defaults = config.transport.route_defaults();
    let restore = load_seed_file(&cli.restore_file, &defaults)?;

    let cached = cli.record_file.as_ref().filter(|path| path.exists());
    let seeds = match cached {
        Some(record_path) => {
            tracing::info!(path = ?record_path, "Loading probe record, skipping dry run and probing");
            read_record(record_path, &defaults)?
        }
        None => load_seed_folder(&cli.input_folder, &defaults)?,
    };

    let transport = RoutedTransport::new(
        SocketTransport::from_settings(&config.transport),
        UnavailableSession,
    );
    let messenger = Messenger::new(
        transport,
        RetryPolicy::from_settings(&config.transport),
        restore,
    );
    let rng = config.fuzzer.make_rng();
    let mut fuzzer = Fuzzer::new(
        messenger,
        SeedQueue::from_seeds(seeds),
        &config,
        cli.output_folder.clone(),
        rng,
    );

    if let Err(e) = fuzzer.validate_restore() {
        tracing::error!(error = %e, "Restore seed could not be replayed, check the inputs or connection");
        return Ok(ExitCode::FAILURE);
    }

    if cached.is_none() {
        if let Err(e) = fuzzer.dry_run_all() {
            tracing::error!(error = %e, "Dry run failed, check the inputs or connection");
            return Ok(ExitCode::FAILURE);
        }
        if let Some(path) = fuzzer.probe_all()? {
            tracing::error!(path = %path.display(), "Device crashed while probing");
            return Ok(ExitCode::SUCCESS);
        }
        let record_path = cli.output_folder.join(&config.fuzzer.record_file_name);
        write_record(&record_path, fuzzer.queue().seeds())?;
    }

    let end = fuzzer.run()?;
    let stats = fuzzer.stats();
    tracing::info!(
        trials = stats.trials,
        havoc_iterations = stats.havoc_iterations,
        promotions = stats.promotions,
        transport_faults = stats.transport_faults,
        queue = fuzzer.queue().len(),
        "Fuzzing finished"
    );
    match end {
        RunEnd::Crash(path) => {
            tracing::info!(path = %path.display(), "Crash report written");
            Ok(ExitCode::SUCCESS)
        }
        RunEnd::HavocExhausted => Ok(ExitCode::SUCCESS),
        RunEnd::NothingToMutate => {
            tracing::warn!("No seed has a snippet to mutate");
            Ok(ExitCode::SUCCESS)
        }
        RunEnd::TransportFailure(error) => {
            tracing::error!(error = %error, "Giving up after repeated transport faults");
            Ok(ExitCode::FAILURE)
        }
    }
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "snipfuzz failed");
            ExitCode::FAILURE
        }
    }
}
