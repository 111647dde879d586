// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: Payload checker/applier tool
//! OWNERS: @tools-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests below (argument handling + exit codes)
//!
//! PUBLIC API:
//!   - CLI: paycheck check <payload> [--key <file>] [--metadata-signature <file>]
//!          [--type full|delta]
//!   - CLI: paycheck apply <payload> --kernel <out> --root <out>
//!          [--old-kernel <in> --old-root <in>]
//!   - CLI: paycheck trace <payload> --partition kernel|root --block <n> [--skip <n>]
//!   - CLI: paycheck describe <payload>
//!
//! Exit codes: 0 ok, 1 usage/io/config, 2 signature, 3 malformed payload,
//! 4 apply or hash failure.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use log::{error, info};
use thiserror::Error;

use nexus_payload::{
    ApplyOptions, ConfigError, EngineConfig, ErrorKind, KeyError, PartitionKind, PartitionState,
    Payload, PayloadType, PublicKey,
};

const METADATA_SIGNATURE_SUFFIX: &str = ".metadata-signature";

#[derive(Debug, Parser)]
#[command(name = "paycheck", version, about = "Checks, applies and traces update payloads")]
struct Cli {
    /// Engine configuration (TOML).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Verify signatures, payload type, layout and operation data.
    Check {
        #[command(flatten)]
        common: CommonArgs,
        #[command(flatten)]
        sig: SignatureArgs,
        /// Expected payload type.
        #[arg(long = "type")]
        expected: Option<PayloadType>,
    },
    /// Apply the payload to new kernel/root images.
    Apply {
        #[command(flatten)]
        common: CommonArgs,
        #[command(flatten)]
        sig: SignatureArgs,
        #[arg(long)]
        kernel: PathBuf,
        #[arg(long)]
        root: PathBuf,
        /// Old kernel image (delta payloads).
        #[arg(long, requires = "old_root")]
        old_kernel: Option<PathBuf>,
        /// Old root image (delta payloads).
        #[arg(long, requires = "old_kernel")]
        old_root: Option<PathBuf>,
        /// Apply kernel and root concurrently.
        #[arg(long)]
        parallel: bool,
    },
    /// Report which operation wrote a block.
    Trace {
        #[command(flatten)]
        common: CommonArgs,
        #[arg(long, value_parser = parse_partition)]
        partition: PartitionKind,
        #[arg(long)]
        block: u64,
        /// Leave out the first N earlier writers of the origin chain.
        #[arg(long, default_value_t = 0)]
        skip: usize,
    },
    /// Print payload metadata without verifying it.
    Describe {
        #[command(flatten)]
        common: CommonArgs,
    },
}

#[derive(Debug, Args)]
struct CommonArgs {
    payload: PathBuf,
    /// Emit JSON instead of text.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct SignatureArgs {
    /// Public key file (32 raw bytes or hex).
    #[arg(long, conflicts_with = "key_hex")]
    key: Option<PathBuf>,
    /// Public key as hex.
    #[arg(long)]
    key_hex: Option<String>,
    /// Out-of-band metadata signature; defaults to `<payload>.metadata-signature` when present.
    #[arg(long)]
    metadata_signature: Option<PathBuf>,
}

fn parse_partition(name: &str) -> Result<PartitionKind, String> {
    PartitionKind::from_name(name)
        .ok_or_else(|| format!("unknown partition `{name}` (expected kernel or root)"))
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Engine(#[from] nexus_payload::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

impl CliError {
    fn exit_code(&self) -> u8 {
        match self {
            CliError::Engine(err) => exit_code(err.kind()),
            CliError::Config(_) | CliError::Key(_) | CliError::Io { .. } | CliError::Json(_) => 1,
        }
    }
}

fn exit_code(kind: ErrorKind) -> u8 {
    match kind {
        ErrorKind::Io => 1,
        ErrorKind::SignatureMissing | ErrorKind::SignatureInvalid => 2,
        ErrorKind::MalformedContainer
        | ErrorKind::MalformedManifest
        | ErrorKind::PayloadTypeMismatch
        | ErrorKind::OutOfRange => 3,
        ErrorKind::SizeMismatch
        | ErrorKind::DecompressionFailed
        | ErrorKind::PatchApplicationFailed
        | ErrorKind::OrderingViolation
        | ErrorKind::HashMismatch
        | ErrorKind::InvariantViolation
        | ErrorKind::BlockOutOfRange
        | ErrorKind::Cancelled => 4,
    }
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            eprintln!("paycheck: {err}");
            ExitCode::from(err.exit_code())
        }
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    let config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };

    match cli.command {
        Command::Check { common, sig, expected } => {
            let payload = open(&common.payload, &config)?;
            let key = load_key(&sig)?;
            let signature = load_metadata_signature(&sig, &common.payload)?;
            let report = payload.verify(signature.as_deref(), key.as_ref(), expected, &config)?;
            if common.json {
                println!("{}", report.to_json()?);
            } else {
                print!("{report}");
                println!("OK");
            }
        }
        Command::Apply { common, sig, kernel, root, old_kernel, old_root, parallel } => {
            let payload = open(&common.payload, &config)?;
            let key = load_key(&sig)?;
            let signature = load_metadata_signature(&sig, &common.payload)?;
            let expected =
                if old_kernel.is_some() { PayloadType::Delta } else { PayloadType::Full };
            payload.verify(signature.as_deref(), key.as_ref(), Some(expected), &config)?;

            let mut options = ApplyOptions::from_config(&config);
            options.parallel |= parallel;
            let report = match (old_kernel, old_root) {
                (Some(old_kernel), Some(old_root)) => nexus_payload::apply_delta(
                    &payload,
                    &kernel,
                    &root,
                    &old_kernel,
                    &old_root,
                    &options,
                )?,
                _ => nexus_payload::apply_full(&payload, &kernel, &root, &options)?,
            };
            for outcome in &report.outcomes {
                info!(
                    "{}: {} ({} operations)",
                    outcome.kind, outcome.state, outcome.operations_applied
                );
                if !common.json {
                    println!("{}: {}", outcome.kind, outcome.state);
                }
            }
            if common.json {
                let states: Vec<(PartitionKind, PartitionState)> =
                    report.outcomes.iter().map(|o| (o.kind, o.state)).collect();
                println!("{}", serde_json::to_string_pretty(&states)?);
            }
        }
        Command::Trace { common, partition, block, skip } => {
            let payload = open(&common.payload, &config)?;
            let trace = nexus_payload::trace_block(&payload, partition, block)?.skip_origin(skip);
            if common.json {
                println!("{}", serde_json::to_string_pretty(&trace)?);
            } else {
                println!("{trace}");
            }
        }
        Command::Describe { common } => {
            let payload = open(&common.payload, &config)?;
            let report = payload.describe();
            if common.json {
                println!("{}", report.to_json()?);
            } else {
                print!("{report}");
            }
        }
    }
    Ok(())
}

fn open(
    path: &Path,
    config: &EngineConfig,
) -> Result<Payload<std::io::BufReader<fs::File>>, CliError> {
    match Payload::open_path(path, config) {
        Err(nexus_payload::Error::Io(source)) => {
            Err(CliError::Io { path: path.to_path_buf(), source })
        }
        other => Ok(other?),
    }
}

fn load_key(args: &SignatureArgs) -> Result<Option<PublicKey>, CliError> {
    match (&args.key, &args.key_hex) {
        (Some(path), _) => Ok(Some(PublicKey::from_file(path)?)),
        (None, Some(text)) => Ok(Some(PublicKey::from_hex(text)?)),
        (None, None) => Ok(None),
    }
}

fn default_signature_path(payload: &Path) -> PathBuf {
    let mut name = OsString::from(payload.as_os_str());
    name.push(METADATA_SIGNATURE_SUFFIX);
    PathBuf::from(name)
}

/// Explicit file, else `<payload>.metadata-signature` if it exists.
fn load_metadata_signature(
    args: &SignatureArgs,
    payload: &Path,
) -> Result<Option<Vec<u8>>, CliError> {
    let path = match &args.metadata_signature {
        Some(path) => path.clone(),
        None => {
            let candidate = default_signature_path(payload);
            if !candidate.is_file() {
                return Ok(None);
            }
            info!("using metadata signature {}", candidate.display());
            candidate
        }
    };
    fs::read(&path).map(Some).map_err(|source| CliError::Io { path, source })
}
