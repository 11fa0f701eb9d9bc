//! otaflash CLI - Upload an application image to a serial OTA bootloader.
//!
//! ```text
//! otaflash <PORT_INDEX> <FIRMWARE>
//! otaflash --port /dev/ttyUSB0 <FIRMWARE>
//! ```
//!
//! The port index selects a device from the known serial path table, which is
//! printed with any usage error.

use anyhow::{Context, Result};
use clap::Parser;
use console::style;
use env_logger::Env;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, warn};
use otaflash::host::{KNOWN_PORTS, port_index, port_path};
use otaflash::{
    FirmwareImage, NativePort, ProtocolLimits, ReadPolicy, SerialConfig, UploadConfig, Uploader,
};
use std::env;
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

mod config;

use config::Config;

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Default baud rate of the bootloader link.
const DEFAULT_BAUD: u32 = 115_200;

/// Default response timeout in milliseconds.
const DEFAULT_TIMEOUT_MS: u64 = 1000;

/// Message for a missing port or image argument.
const MISSING_ARGS: &str = "Please feed the COM PORT number and the Application Image";

/// Check if animations should be used (TTY and colors enabled).
fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Errors that select a non-default exit code.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// Missing or invalid arguments.
    #[error("{0}")]
    Usage(String),

    /// An explicitly named config file could not be used.
    #[error("{0}")]
    Config(String),
}

/// otaflash - Upload firmware to a serial OTA bootloader.
///
/// Environment variables:
///   OTAFLASH_PORT     - Serial device path (overrides the port index)
///   OTAFLASH_BAUD     - Baud rate (default: 115200)
///   OTAFLASH_TIMEOUT  - Response timeout in milliseconds (default: 1000)
#[derive(Parser, Debug)]
#[command(name = "otaflash")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Index of the serial port in the known device table.
    #[arg(value_name = "PORT_INDEX")]
    port_index: Option<String>,

    /// Application image to upload.
    #[arg(value_name = "FIRMWARE")]
    firmware: Option<PathBuf>,

    /// Serial device path; takes precedence over the port index.
    #[arg(long, value_name = "PATH", env = "OTAFLASH_PORT")]
    port: Option<String>,

    /// Baud rate [default: 115200].
    #[arg(short, long, env = "OTAFLASH_BAUD")]
    baud: Option<u32>,

    /// Response timeout in milliseconds [default: 1000].
    #[arg(long, value_name = "MS", env = "OTAFLASH_TIMEOUT")]
    timeout: Option<u64>,

    /// Path to a configuration file.
    #[arg(long = "config", value_name = "PATH")]
    config_path: Option<PathBuf>,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long)]
    quiet: bool,
}

/// Effective settings after merging flags, environment and config files.
#[derive(Debug)]
struct Settings {
    port: String,
    firmware: PathBuf,
    baud: u32,
    upload: UploadConfig,
}

impl Settings {
    fn resolve(cli: &Cli, config: &Config) -> Result<Self, CliError> {
        // With a port from --port or the config file, a single positional is the image
        let port_known = cli.port.is_some() || config.connection.port.is_some();
        let (index, firmware) = match (&cli.port_index, &cli.firmware) {
            (Some(only), None) if port_known => (None, Some(PathBuf::from(only))),
            (index, firmware) => (index.as_deref(), firmware.clone()),
        };

        let port = match (&cli.port, index, &config.connection.port) {
            (Some(path), _, _) => path.clone(),
            (None, Some(index), _) => port_from_index(index)?,
            (None, None, Some(path)) => path.clone(),
            (None, None, None) => return Err(CliError::Usage(MISSING_ARGS.into())),
        };
        let firmware = firmware.ok_or_else(|| CliError::Usage(MISSING_ARGS.into()))?;

        let timeout_ms = cli
            .timeout
            .or(config.connection.response_timeout_ms)
            .unwrap_or(DEFAULT_TIMEOUT_MS);
        if timeout_ms == 0 {
            return Err(CliError::Usage("timeout must be at least 1 ms".into()));
        }

        let defaults = UploadConfig::default();
        let upload = UploadConfig {
            limits: ProtocolLimits::default(),
            response: ReadPolicy::with_timeout(Duration::from_millis(timeout_ms)),
            inter_byte_delay: config
                .transfer
                .inter_byte_delay_us
                .map_or(defaults.inter_byte_delay, Duration::from_micros),
            inter_frame_delay: config
                .transfer
                .inter_frame_delay_ms
                .map_or(defaults.inter_frame_delay, Duration::from_millis),
        };

        Ok(Self {
            port,
            firmware,
            baud: cli
                .baud
                .or(config.connection.baud)
                .unwrap_or(DEFAULT_BAUD),
            upload,
        })
    }
}

/// Look up a port index argument in the known device table.
fn port_from_index(arg: &str) -> Result<String, CliError> {
    arg.trim()
        .parse::<usize>()
        .ok()
        .and_then(port_path)
        .map(str::to_string)
        .ok_or_else(|| {
            CliError::Usage(format!(
                "invalid port index '{arg}' (expected 0..={})",
                KNOWN_PORTS.len() - 1
            ))
        })
}

/// The known device table, two entries per line.
fn port_table() -> String {
    let half = KNOWN_PORTS.len().div_ceil(2);
    let mut out = String::new();
    for row in 0..half {
        let left = format!("{row:>3}: {}", KNOWN_PORTS[row]);
        match KNOWN_PORTS.get(row + half) {
            Some(right) => out.push_str(&format!("{left:<24}{:>3}: {right}\n", row + half)),
            None => out.push_str(&format!("{left}\n")),
        }
    }
    out
}

/// Port path for messages, with its table index when it has one.
fn describe_port(path: &str) -> String {
    match port_index(path) {
        Some(index) => format!("{path} (index {index})"),
        None => path.to_string(),
    }
}

fn print_usage(message: &str) {
    eprintln!("{} {message}", style("Error:").red().bold());
    eprintln!();
    eprintln!("Usage: otaflash <PORT_INDEX> <FIRMWARE>");
    print_known_ports();
}

fn print_known_ports() {
    eprintln!();
    eprintln!("Known serial ports:");
    eprint!("{}", port_table());

    match otaflash::host::discover_ports() {
        Ok(ports) if !ports.is_empty() => {
            let names: Vec<_> = ports.iter().map(|p| p.name.as_str()).collect();
            eprintln!();
            eprintln!("Detected on this machine: {}", names.join(", "));
        },
        Ok(_) => {},
        Err(e) => debug!("Port discovery failed: {e}"),
    }
}

/// Exit code for an error returned by [`run`].
fn exit_code(err: &anyhow::Error) -> i32 {
    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        return match cli_err {
            CliError::Usage(_) | CliError::Config(_) => 2,
        };
    }
    match err.downcast_ref::<otaflash::Error>().map(otaflash::Error::root) {
        Some(otaflash::Error::Interrupted) => 130,
        _ => 1,
    }
}

fn main() {
    // --- NO_COLOR and TTY detection ---
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        // --help and --version go to stdout
        Err(e) if !e.use_stderr() => e.exit(),
        Err(e) => {
            eprint!("{e}");
            print_known_ports();
            process::exit(2);
        },
    };

    // Setup logging based on verbosity
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    debug!(
        "otaflash v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    if let Err(e) = ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::Relaxed)) {
        warn!("Failed to install Ctrl-C handler: {e}");
    }
    otaflash::set_interrupt_checker(|| INTERRUPTED.load(Ordering::Relaxed));

    if let Err(err) = run(&cli) {
        match err.downcast_ref::<CliError>() {
            Some(CliError::Usage(message)) => print_usage(message),
            _ => eprintln!("{} {err:#}", style("Error:").red().bold()),
        }
        process::exit(exit_code(&err));
    }
}

fn run(cli: &Cli) -> Result<()> {
    let config = match &cli.config_path {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load(),
    };
    let settings = Settings::resolve(cli, &config)?;
    debug!("Settings: {settings:?}");

    let image = FirmwareImage::from_file(&settings.firmware, &settings.upload.limits)
        .with_context(|| format!("failed to load image {}", settings.firmware.display()))?;
    if !cli.quiet {
        eprintln!(
            "{} Loaded {} ({} bytes, CRC 0x{:08X})",
            style("📦").cyan(),
            settings.firmware.display(),
            image.len(),
            image.crc()
        );
    }

    if !cli.quiet {
        eprintln!(
            "{} Using port {} at {} baud",
            style("🔌").cyan(),
            describe_port(&settings.port),
            settings.baud
        );
    }
    let serial = SerialConfig::new(&settings.port, settings.baud);
    let port = NativePort::open(&serial)
        .with_context(|| format!("failed to open serial port {}", settings.port))?;

    let pb = if cli.quiet || !use_fancy_output() {
        ProgressBar::hidden()
    } else {
        let pb = ProgressBar::new(image.len() as u64);
        #[allow(clippy::unwrap_used)] // Static template string
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}")
                .unwrap()
                .progress_chars("#>-"),
        );
        pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
        pb
    };
    pb.set_message("uploading");

    let mut uploader = Uploader::with_config(port, settings.upload);
    let result = uploader.upload(&image, |sent, _total| pb.set_position(sent as u64));
    if result.is_ok() {
        pb.finish_with_message("done");
    } else {
        pb.abandon();
    }
    result.context("OTA upload failed")?;

    if !cli.quiet {
        eprintln!("\n{} Upload complete", style("🎉").green().bold());
    }
    Ok(())
}
