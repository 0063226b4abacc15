//! secure-media CLI - password-protected media containers
//!
//! Encrypts files into containers, decrypts them to a chosen path, or opens
//! them into a private temporary file for playback that is removed again
//! when the viewer exits.

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use std::io::{self, BufRead, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::process::{self, Command};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

use secure_media::decrypt::{DEFAULT_CHUNK_SIZE, default_output_path};
use secure_media::kdf::PBKDF2_ITERATIONS;
use secure_media::password::{PasswordReader, ReaderPasswordReader, TerminalPasswordReader};
use secure_media::{
    ArtifactManager, CancelToken, DecryptJob, DecryptOptions, EncryptOptions, FormatVersion,
    JobOutcome, ProgressEvent, decrypt_to_file, encrypt_file, inspect_file, purge_outstanding,
    SecureMediaError, sweep_stale,
};

/// Exit status after Ctrl-C, as a shell reports SIGINT
const INTERRUPTED_EXIT: i32 = 130;

/// Sessions younger than this survive the sweep `open` runs on startup even
/// when their owner is gone.
const STARTUP_SWEEP_AGE: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "secure-media")]
#[command(version)]
#[command(about = "Password-protected media containers.", long_about = None)]
struct Cli {
    /// Read password from stdin instead of from terminal
    #[arg(long, global = true)]
    password_stdin: bool,

    /// Directory that holds temporary decrypted files
    #[arg(long, global = true, value_name = "DIR", env = "SECURE_MEDIA_TEMP_DIR")]
    temp_dir: Option<PathBuf>,

    /// Bytes decrypted per step
    #[arg(long, global = true, value_name = "BYTES", env = "SECURE_MEDIA_CHUNK_SIZE", default_value_t = DEFAULT_CHUNK_SIZE)]
    chunk_size: usize,

    /// PBKDF2 iteration count (must match between encrypt and decrypt)
    #[arg(long, global = true, value_name = "N", env = "SECURE_MEDIA_ITERATIONS", default_value_t = PBKDF2_ITERATIONS)]
    iterations: u32,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Encrypt a file into a container
    #[command(alias = "e")]
    Encrypt {
        /// Path to the file whose contents is to be encrypted
        #[arg(short, long, value_name = "FILE")]
        input: PathBuf,

        /// Path to write the container to
        #[arg(short, long, value_name = "FILE")]
        output: PathBuf,

        /// Extension to record instead of the input's own (e.g. mp4)
        #[arg(long, value_name = "EXT")]
        extension: Option<String>,

        /// Mark the input as a packed directory
        #[arg(long)]
        directory: bool,

        /// Write a version 1 container without an authentication tag
        #[arg(long)]
        unauthenticated: bool,
    },

    /// Decrypt a container to a file
    #[command(alias = "d")]
    Decrypt {
        /// Path to the container
        #[arg(short, long, value_name = "FILE")]
        input: PathBuf,

        /// Path to write the plaintext to [default: input without .enc]
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Decrypt into a private temporary file, hand it to a player and
    /// delete it afterwards
    #[command(alias = "o")]
    Open {
        /// Path to the container
        #[arg(short, long, value_name = "FILE")]
        input: PathBuf,

        /// Command to run with the decrypted file path as last argument
        #[arg(long, value_name = "CMD", num_args = 1.., allow_hyphen_values = true)]
        exec: Option<Vec<String>>,
    },

    /// Show the header of a container without decrypting it
    Inspect {
        /// Path to the container
        #[arg(short, long, value_name = "FILE")]
        input: PathBuf,
    },

    /// Remove temporary files left behind by earlier runs
    Sweep {
        /// Only remove sessions older than this many seconds
        #[arg(long, value_name = "SECS", default_value_t = 3600)]
        max_age_secs: u64,
    },
}

fn main() {
    let cli = Cli::parse();
    init_logging();

    if let Err(e) = run(cli) {
        eprintln!("Error: {:#}", e);
        let cancelled = e
            .downcast_ref::<SecureMediaError>()
            .is_some_and(SecureMediaError::is_cancelled);
        process::exit(if cancelled { INTERRUPTED_EXIT } else { 1 });
    }
}

fn init_logging() {
    let filter =
        EnvFilter::try_from_env("SECURE_MEDIA_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let decrypt_options = DecryptOptions {
        chunk_size: cli.chunk_size,
        iterations: cli.iterations,
        ..DecryptOptions::default()
    };

    match cli.command {
        Commands::Encrypt {
            input,
            output,
            extension,
            directory,
            unauthenticated,
        } => {
            let mut reader = get_password_reader(cli.password_stdin, true);
            let password = reader.read_password()?;
            let options = EncryptOptions {
                version: if unauthenticated {
                    FormatVersion::V1
                } else {
                    FormatVersion::V2
                },
                iterations: cli.iterations,
                extension,
                is_directory: directory,
                chunk_size: cli.chunk_size,
            };
            encrypt_file(&input, &output, &password, &options)?;
        }
        Commands::Decrypt { input, output } => {
            let output = match output {
                Some(o) => o,
                None => default_output_path(&input, &inspect_file(&input)?),
            };
            let mut reader = get_password_reader(cli.password_stdin, false);
            let password = reader.read_password()?;
            // Cancel instead of exiting so the partial temp file is removed.
            let cancel = CancelToken::new();
            let handler_cancel = cancel.clone();
            ctrlc::set_handler(move || handler_cancel.cancel())
                .context("failed to install interrupt handler")?;

            let mut progress = progress_printer();
            let result = decrypt_to_file(
                &input,
                &output,
                &password,
                &decrypt_options,
                &mut progress,
                &cancel,
            );
            finish_progress_line();
            result?;
        }
        Commands::Open { input, exec } => {
            let header = inspect_file(&input)?;
            if header.is_directory {
                bail!(
                    "{} holds a packed directory and cannot be played; use decrypt instead",
                    input.display()
                );
            }
            if exec.is_none() && !io::stdin().is_terminal() {
                bail!("open without --exec needs an interactive terminal");
            }
            let mut reader = get_password_reader(cli.password_stdin, false);
            let password = reader.read_password()?;
            sweep_on_startup(cli.temp_dir.as_deref());
            let manager = new_manager(cli.temp_dir.as_deref())?;
            open(&input, password, &manager, decrypt_options, exec)?;
            manager.teardown();
        }
        Commands::Inspect { input } => {
            let header = inspect_file(&input)?;
            println!("version:        {}", header.version.as_byte());
            println!("authenticated:  {}", header.version.is_authenticated());
            println!("extension:      {}", header.original_extension);
            println!("directory:      {}", header.is_directory);
            println!("payload length: {}", header.payload_length);
        }
        Commands::Sweep { max_age_secs } => {
            let base = session_base(cli.temp_dir.as_deref());
            let removed = sweep_stale(&base, Duration::from_secs(max_age_secs))?;
            println!("removed {} stale session(s)", removed);
        }
    }
    Ok(())
}

fn open(
    input: &Path,
    password: Zeroizing<Vec<u8>>,
    manager: &ArtifactManager,
    options: DecryptOptions,
    exec: Option<Vec<String>>,
) -> anyhow::Result<()> {
    let cancel = CancelToken::new();
    let handler_cancel = cancel.clone();
    ctrlc::set_handler(move || {
        handler_cancel.cancel();
        purge_outstanding();
        process::exit(INTERRUPTED_EXIT);
    })
    .context("failed to install interrupt handler")?;

    let job = DecryptJob::spawn_with_cancel(input, password, manager.clone(), options, cancel)?;
    let outcome = job.wait_with(progress_printer());
    finish_progress_line();

    let artifact = match outcome {
        JobOutcome::Completed(artifact) => artifact,
        JobOutcome::Cancelled => bail!("decryption cancelled"),
        JobOutcome::Failed(e) => return Err(e.into()),
    };
    if artifact.is_empty() {
        bail!("decrypted payload is empty; nothing to play");
    }
    println!("{}", artifact.path().display());

    match exec {
        Some(command) => {
            let (program, args) = command
                .split_first()
                .context("--exec needs a command")?;
            let status = Command::new(program)
                .args(args)
                .arg(artifact.path())
                .status()
                .with_context(|| format!("failed to run {}", program))?;
            if !status.success() {
                eprintln!("{} exited with {}", program, status);
            }
        }
        None => {
            eprint!("Press Enter to remove the decrypted file... ");
            io::stderr().flush().ok();
            let mut line = String::new();
            io::stdin()
                .lock()
                .read_line(&mut line)
                .context("failed to read from stdin")?;
        }
    }
    drop(artifact);
    Ok(())
}

fn session_base(temp_dir: Option<&Path>) -> PathBuf {
    temp_dir.map_or_else(std::env::temp_dir, Path::to_path_buf)
}

/// Best effort: leftovers of crashed sessions are removed, failures only
/// logged.
fn sweep_on_startup(temp_dir: Option<&Path>) {
    let base = session_base(temp_dir);
    match sweep_stale(&base, STARTUP_SWEEP_AGE) {
        Ok(0) => {}
        Ok(removed) => info!(removed, "removed stale sessions"),
        Err(e) => warn!(error = %e, "startup sweep failed"),
    }
}

fn new_manager(temp_dir: Option<&Path>) -> anyhow::Result<ArtifactManager> {
    let manager = match temp_dir {
        Some(dir) => ArtifactManager::new_in(dir)?,
        None => ArtifactManager::new()?,
    };
    Ok(manager)
}

fn get_password_reader(use_stdin: bool, confirm: bool) -> Box<dyn PasswordReader> {
    if use_stdin {
        Box::new(ReaderPasswordReader::new(Box::new(io::stdin())))
    } else if confirm {
        Box::new(TerminalPasswordReader::confirming())
    } else {
        Box::new(TerminalPasswordReader::new())
    }
}

/// Progress line on stderr, shown only when stderr is a terminal.
fn progress_printer() -> impl FnMut(ProgressEvent) {
    let interactive = io::stderr().is_terminal();
    let mut last_percent = None;
    move |event: ProgressEvent| {
        let percent = event.percent();
        if !interactive || last_percent == Some(percent) {
            return;
        }
        last_percent = Some(percent);
        eprint!(
            "\rDecrypting: {:3}% ({}/{} bytes)",
            percent, event.bytes_processed, event.bytes_total
        );
    }
}

fn finish_progress_line() {
    if io::stderr().is_terminal() {
        eprintln!();
    }
}
