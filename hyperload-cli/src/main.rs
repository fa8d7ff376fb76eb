//! hyperload CLI - Command-line tool for flashing boards running the
//! Hyperload bootloader.
//!
//! ## Features
//!
//! - Flash Intel HEX or raw binary images
//! - Inspect images and their block layout
//! - Serial port listing with USB bridge detection
//! - Shell completion generation
//! - Environment variable and TOML configuration support

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use env_logger::Env;
use log::debug;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};

mod commands;
mod config;

use config::Config;

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if animations should be used (TTY and colors enabled).
fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Whether Ctrl-C was pressed.
pub(crate) fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}

/// Baud rates the bootloader can be asked to switch to.
pub(crate) const SUPPORTED_BAUD_RATES: &[u32] = &[
    4800, 9600, 19200, 38400, 57600, 115_200, 230_400, 576_000, 921_600, 1_000_000, 1_152_000,
    1_500_000, 2_000_000, 2_500_000, 3_000_000, 3_500_000, 4_000_000,
];

/// hyperload - Flash firmware to boards running the Hyperload bootloader.
///
/// Environment variables:
///   HYPERLOAD_PORT   - Default serial port
///   HYPERLOAD_BAUD   - Default baud rate (default: 38400)
///   HYPERLOAD_CLOCK  - Target CPU clock in Hz (default: 48000000)
#[derive(Parser)]
#[command(name = "hyperload")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[command(after_help = "Examples:\n  hyperload -p /dev/ttyUSB0 -b 576000 flash firmware.hex\n  hyperload info --json firmware.hex\n  hyperload list-ports")]
pub(crate) struct Cli {
    /// Serial port to use (auto-detected if not specified).
    #[arg(short, long, global = true, env = "HYPERLOAD_PORT")]
    pub port: Option<String>,

    /// Baud rate to transfer blocks at.
    #[arg(short, long, global = true, env = "HYPERLOAD_BAUD", value_parser = parse_baud)]
    pub baud: Option<u32>,

    /// CPU clock of the target in Hz while the bootloader runs.
    #[arg(short, long, global = true, env = "HYPERLOAD_CLOCK")]
    pub clock: Option<u32>,

    /// Give up after this many attempts of one block (0 retries forever).
    #[arg(long, global = true, value_name = "N")]
    pub max_retries: Option<u32>,

    /// Progress spinner animation.
    #[arg(short, long, global = true, value_enum)]
    pub animation: Option<Animation>,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    pub config_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Flash a firmware image (Intel HEX or raw binary).
    Flash {
        /// Path to the firmware file.
        firmware: PathBuf,
    },

    /// Show image information and block layout.
    Info {
        /// Path to the firmware file.
        firmware: PathBuf,

        /// Block size to lay the image out with.
        #[arg(long, default_value_t = 4096, value_parser = clap::value_parser!(u32).range(1..))]
        block_size: u32,

        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// List available serial ports.
    ListPorts {
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type (detected from $SHELL if omitted).
        shell: Option<Shell>,
    },
}

/// Progress spinner animations.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub(crate) enum Animation {
    /// Clock faces.
    #[default]
    Clocks,
    /// Half-filled circles.
    Circles,
    /// Quadrant blocks.
    Quadrants,
    /// Trigrams.
    Trigrams,
    /// Half-filled squares.
    Squarefills,
    /// Blank.
    Spaces,
    /// Braille dots.
    Braille,
}

impl Animation {
    /// Spinner frames, in order.
    pub(crate) fn frames(self) -> &'static [&'static str] {
        match self {
            Self::Clocks => &[
                "\u{1F55B}", "\u{1F550}", "\u{1F551}", "\u{1F552}", "\u{1F553}", "\u{1F554}",
                "\u{1F555}", "\u{1F556}", "\u{1F557}", "\u{1F558}", "\u{1F559}", "\u{1F55A}",
            ],
            Self::Circles => &["\u{25D0}", "\u{25D3}", "\u{25D1}", "\u{25D2}"],
            Self::Quadrants => &["\u{259F}", "\u{2599}", "\u{259B}", "\u{259C}"],
            Self::Trigrams => &["\u{2630}", "\u{2631}", "\u{2632}", "\u{2634}"],
            Self::Squarefills => &["\u{25E7}", "\u{25E9}", "\u{25E8}", "\u{25EA}"],
            Self::Spaces => &["\u{2008}", "\u{2008}", "\u{2008}", "\u{2008}"],
            Self::Braille => &[
                "\u{2840}", "\u{2844}", "\u{2846}", "\u{2847}", "\u{2840}", "\u{28C7}", "\u{28E7}",
                "\u{28F7}", "\u{28FF}",
            ],
        }
    }
}

/// Errors with a dedicated exit code.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Invalid arguments or option combination.
    #[error("{0}")]
    Usage(String),
    /// Invalid configuration value.
    #[error("{0}")]
    Config(String),
    /// No serial port available.
    #[error("{0}")]
    DeviceNotFound(String),
    /// Stopped by the user.
    #[error("{0}")]
    Cancelled(String),
}

/// Map an error to the process exit code.
///
/// After Ctrl-C every failure counts as a cancellation, whatever the
/// interrupted step returned.
fn exit_code(err: &anyhow::Error, interrupted: bool) -> u8 {
    if interrupted {
        return 130;
    }
    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        return match cli_err {
            CliError::Usage(_) => 2,
            CliError::Config(_) => 3,
            CliError::DeviceNotFound(_) => 4,
            CliError::Cancelled(_) => 130,
        };
    }
    match err.downcast_ref::<hyperload::Error>() {
        Some(hyperload::Error::Config(_)) => 3,
        Some(e) if e.is_device_missing() => 4,
        Some(hyperload::Error::Interrupted) => 130,
        _ => 1,
    }
}

fn parse_baud(s: &str) -> Result<u32, String> {
    let baud: u32 = s
        .parse()
        .map_err(|_| format!("'{s}' is not a number"))?;
    if SUPPORTED_BAUD_RATES.contains(&baud) {
        Ok(baud)
    } else {
        Err(format!(
            "unsupported baud rate {baud}; choose one of {}",
            SUPPORTED_BAUD_RATES
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }
}

fn init_logging(cli: &Cli) {
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
}

fn run(cli: &Cli) -> Result<()> {
    let config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::Flash { firmware } => commands::flash::cmd_flash(cli, &config, firmware),
        Commands::Info {
            firmware,
            block_size,
            json,
        } => commands::info::cmd_info(firmware, *block_size as usize, *json),
        Commands::ListPorts { json } => commands::info::cmd_list_ports(*json),
        Commands::Completions { shell } => commands::completions::cmd_completions(*shell),
    }
}

fn main() -> ExitCode {
    // NO_COLOR and TTY detection
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);
    if env::var_os("NO_COLOR").is_some() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // Help and version go to stdout with exit code 0; usage errors
            // go to stderr with exit code 2.
            let _ = e.print();
            return ExitCode::from(u8::try_from(e.exit_code()).unwrap_or(2));
        },
    };

    init_logging(&cli);
    debug!(
        "hyperload v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    if let Err(e) = ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::Relaxed)) {
        debug!("Failed to install Ctrl-C handler: {e}");
    }
    hyperload::set_interrupt_checker(was_interrupted);

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!(
                "{} {err:#}",
                console::style("Error:").red().bold()
            );
            ExitCode::from(exit_code(&err, was_interrupted()))
        },
    }
}

#[cfg(test)]
mod cli_tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_command_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_parse_flash() {
        let cli = Cli::try_parse_from([
            "hyperload",
            "--port",
            "/dev/ttyUSB0",
            "--baud",
            "576000",
            "flash",
            "firmware.hex",
        ])
        .unwrap();
        assert_eq!(cli.port.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(cli.baud, Some(576_000));
        assert!(matches!(cli.command, Commands::Flash { .. }));
    }

    #[test]
    fn test_cli_global_options_after_subcommand() {
        let cli = Cli::try_parse_from([
            "hyperload",
            "flash",
            "fw.hex",
            "-c",
            "12000000",
            "--max-retries",
            "5",
            "-a",
            "braille",
            "-vv",
        ])
        .unwrap();
        assert_eq!(cli.clock, Some(12_000_000));
        assert_eq!(cli.max_retries, Some(5));
        assert_eq!(cli.animation, Some(Animation::Braille));
        assert_eq!(cli.verbose, 2);
    }

    #[test]
    fn test_cli_rejects_unsupported_baud() {
        assert!(Cli::try_parse_from(["hyperload", "-b", "12345", "flash", "fw.hex"]).is_err());
        assert!(Cli::try_parse_from(["hyperload", "-b", "fast", "flash", "fw.hex"]).is_err());
    }

    #[test]
    fn test_cli_parse_info_defaults() {
        let cli = Cli::try_parse_from(["hyperload", "info", "fw.bin"]).unwrap();
        match cli.command {
            Commands::Info {
                block_size, json, ..
            } => {
                assert_eq!(block_size, 4096);
                assert!(!json);
            },
            _ => panic!("expected info"),
        }
    }

    #[test]
    fn test_cli_rejects_zero_block_size() {
        assert!(Cli::try_parse_from(["hyperload", "info", "fw.bin", "--block-size", "0"]).is_err());
    }

    #[test]
    fn test_cli_requires_subcommand() {
        assert!(Cli::try_parse_from(["hyperload"]).is_err());
    }

    #[test]
    fn test_parse_baud() {
        assert_eq!(parse_baud("38400"), Ok(38400));
        assert_eq!(parse_baud("4000000"), Ok(4_000_000));
        assert!(parse_baud("100").unwrap_err().contains("unsupported"));
    }

    #[test]
    fn test_animation_frames() {
        for animation in Animation::value_variants() {
            assert!(animation.frames().len() >= 4);
        }
        assert_eq!(Animation::Clocks.frames().len(), 12);
        assert_eq!(Animation::Braille.frames().len(), 9);
        assert_eq!(Animation::default(), Animation::Clocks);
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code(&CliError::Usage("x".into()).into(), false), 2);
        assert_eq!(exit_code(&CliError::Config("x".into()).into(), false), 3);
        assert_eq!(exit_code(&CliError::DeviceNotFound("x".into()).into(), false), 4);
        assert_eq!(exit_code(&CliError::Cancelled("x".into()).into(), false), 130);
        assert_eq!(exit_code(&hyperload::Error::DeviceNotFound.into(), false), 4);
        assert_eq!(exit_code(&hyperload::Error::Interrupted.into(), false), 130);
        assert_eq!(exit_code(&hyperload::Error::SessionConsumed.into(), false), 1);
        assert_eq!(exit_code(&anyhow::anyhow!("boom"), false), 1);
    }

    #[test]
    fn test_exit_code_sees_through_context() {
        let err = anyhow::Error::from(hyperload::Error::DeviceNotFound).context("opening port");
        assert_eq!(exit_code(&err, false), 4);
    }

    #[test]
    fn test_exit_code_after_ctrl_c() {
        let err = anyhow::Error::from(hyperload::Error::Timeout {
            phase: hyperload::Phase::Sync,
        })
        .context("Flashing failed");
        assert_eq!(exit_code(&err, false), 1);
        assert_eq!(exit_code(&err, true), 130);
    }
}
