//! Flash command implementation.

use anyhow::{Context, Result};
use clap::ValueEnum;
use console::style;
use hyperload::session::DEFAULT_CLOCK_HZ;
use hyperload::{
    FinalAck, FirmwareImage, INITIAL_BAUD, NativePort, RetryPolicy, Session, SessionConfig,
};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::debug;
use std::path::Path;
use std::time::Duration;

use crate::config::Config;
use crate::{Animation, Cli, CliError, SUPPORTED_BAUD_RATES, use_fancy_output};

/// Flash settings after merging command line, environment and config files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FlashSettings {
    pub port: Option<String>,
    pub baud: u32,
    pub clock_hz: u32,
    pub retry: RetryPolicy,
    pub animation: Animation,
}

impl FlashSettings {
    /// Command-line values win over config file values.
    pub(crate) fn resolve(cli: &Cli, config: &Config) -> Result<Self> {
        let baud = cli
            .baud
            .or(config.connection.baud)
            .unwrap_or(INITIAL_BAUD);
        if !SUPPORTED_BAUD_RATES.contains(&baud) {
            return Err(CliError::Config(format!("unsupported baud rate {baud} in configuration")).into());
        }

        let clock_hz = cli
            .clock
            .or(config.flash.clock)
            .unwrap_or(DEFAULT_CLOCK_HZ);
        if clock_hz == 0 {
            return Err(CliError::Config("clock frequency must be non-zero".into()).into());
        }

        let animation = match (cli.animation, config.flash.animation.as_deref()) {
            (Some(animation), _) => animation,
            (None, Some(name)) => Animation::from_str(name, true)
                .map_err(|_| CliError::Config(format!("unknown animation '{name}' in configuration")))?,
            (None, None) => Animation::default(),
        };

        let max_attempts = cli
            .max_retries
            .or(config.flash.max_retries)
            .unwrap_or(0);

        Ok(Self {
            port: cli
                .port
                .clone()
                .or_else(|| config.connection.port.clone()),
            baud,
            clock_hz,
            retry: RetryPolicy::from_max_attempts(max_attempts),
            animation,
        })
    }

    fn session_config(&self) -> SessionConfig {
        SessionConfig::new(self.baud)
            .with_clock_hz(self.clock_hz)
            .with_retry(self.retry)
    }
}

/// Use the given port, or auto-detect one.
fn resolve_port(port: Option<&str>) -> Result<String> {
    if let Some(port) = port {
        return Ok(port.to_string());
    }
    hyperload::auto_detect_port()
        .map(|detected| detected.name)
        .map_err(|_| {
            CliError::DeviceNotFound("no serial port found; connect a board or pass --port".into())
                .into()
        })
}

fn progress_bar(cli: &Cli, animation: Animation) -> ProgressBar {
    if cli.quiet || !use_fancy_output() {
        return ProgressBar::hidden();
    }

    let pb = ProgressBar::new(0);
    // The last tick string is shown once the bar finishes.
    let mut ticks = animation.frames().to_vec();
    ticks.push("\u{2714}");
    match ProgressStyle::with_template(
        "{spinner} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} blocks {msg}",
    ) {
        Ok(bar_style) => pb.set_style(
            bar_style
                .tick_strings(&ticks)
                .progress_chars("#>-"),
        ),
        Err(e) => debug!("Invalid progress template: {e}"),
    }
    pb.set_draw_target(ProgressDrawTarget::stderr());
    pb.enable_steady_tick(Duration::from_millis(120));
    pb
}

/// Flash command implementation.
pub(crate) fn cmd_flash(cli: &Cli, config: &Config, firmware: &Path) -> Result<()> {
    let settings = FlashSettings::resolve(cli, config)?;

    let image = FirmwareImage::from_file(firmware)
        .with_context(|| format!("Failed to load firmware {}", firmware.display()))?;
    if !cli.quiet {
        eprintln!(
            "{} {} ({}, {} bytes)",
            style("Firmware:").bold(),
            firmware.display(),
            image.format(),
            image.len()
        );
    }

    let port_name = resolve_port(settings.port.as_deref())?;
    if !cli.quiet {
        eprintln!(
            "{} {} @ {} baud (clock {} Hz)",
            style("Port:").bold(),
            style(&port_name).cyan(),
            settings.baud,
            settings.clock_hz
        );
    }

    let session_config = settings.session_config();
    let port = NativePort::open_for_session(&port_name, &session_config)
        .with_context(|| format!("Failed to open serial port {port_name}"))?;
    let mut session = Session::new(port, session_config);

    let pb = progress_bar(cli, settings.animation);
    pb.set_message("waiting for device");
    let result = session.flash(image.into_bytes(), |sent: usize, total: usize| {
        pb.set_length(total as u64);
        pb.set_position(sent as u64);
        if sent == 1 {
            pb.set_message("");
        }
    });

    let report = match result {
        Ok(report) => {
            pb.finish();
            report
        },
        Err(e) => {
            pb.abandon();
            return Err(e).context("Flashing failed");
        },
    };

    if !cli.quiet {
        eprintln!("\n{}", style("Board").bold().underlined());
        for line in report.board.to_string().lines() {
            eprintln!("  {line}");
        }
        eprintln!(
            "\n{} {} of {} blocks written ({} retries)",
            style("\u{2713}").green(),
            report.blocks_sent,
            report.total_blocks,
            report.retries
        );
    }

    match report.final_ack {
        FinalAck::Received => {
            if !cli.quiet {
                eprintln!("{}", style("Flashing successful!").green().bold());
            }
        },
        FinalAck::Unexpected(_) | FinalAck::Missing => {
            eprintln!(
                "{} all blocks were accepted but the device did not confirm completion",
                style("Warning:").yellow().bold()
            );
        },
    }

    Ok(())
}
