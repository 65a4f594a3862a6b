//! CLI entry point: `apt-mirror [<config-path>]`.
//!
//! Exit codes (spec.md §6):
//! - 0: success
//! - 1: configuration error (missing file, parse failure, no repositories)
//! - 2: another run already holds the lock
//! - 3: network or checksum verification failure
//! - 4: GPG signature verification failure

use std::{path::PathBuf, process::ExitCode, sync::Arc};

use anyhow::Error;
use apt_mirror::{
    config,
    error::{find_in_chain, ConfigError, SignatureError},
    gpg::GpgvVerifier,
    lock::LockContention,
    orchestrator::Orchestrator,
    transport::UreqTransport,
};

const DEFAULT_CONFIG_PATH: &str = "/etc/apt/mirror.list";

fn main() -> ExitCode {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    match run(&config_path) {
        Ok(()) => ExitCode::from(0),
        Err(err) => {
            eprintln!("apt-mirror: {err:#}");
            ExitCode::from(exit_code_for(&err))
        }
    }
}

fn run(config_path: &std::path::Path) -> Result<(), Error> {
    let config = config::load(config_path)?;

    let transport = Arc::new(UreqTransport::new(&config)?);
    let verifier = Arc::new(GpgvVerifier);

    let orchestrator = Orchestrator::new(config, transport, verifier);
    let journal = orchestrator.run()?;

    println!(
        "apt-mirror: run {} finished ({}), {} repositories, {} stale file(s)",
        journal.run_id, journal.final_state, journal.repositories, journal.stale_files
    );
    for warning in &journal.warnings {
        eprintln!("warning: {warning}");
    }

    if journal.signature_failure {
        return Err(anyhow::Error::new(SignatureError(format!(
            "{} of {} repositories failed signature verification this run",
            journal.failed_repositories, journal.repositories
        ))));
    }

    if journal.failed_repositories > 0 {
        anyhow::bail!(
            "{} of {} repositories failed this run",
            journal.failed_repositories,
            journal.repositories
        );
    }

    Ok(())
}

fn exit_code_for(err: &Error) -> u8 {
    if find_in_chain::<ConfigError>(err).is_some() {
        return 1;
    }
    if find_in_chain::<LockContention>(err).is_some() {
        return 2;
    }
    if find_in_chain::<SignatureError>(err).is_some() {
        return 4;
    }
    3
}
