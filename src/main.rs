//! CLI entry point for the Keithley 6487 driver
//!
//! Opens the instrument described by the configuration file, builds the voltage
//! source and current reader front-ends in their configured roles, and runs one
//! command.
//!
//! # Usage
//!
//! ```bash
//! keithley6487 identify
//! keithley6487 --config lab.toml read --count 10
//! keithley6487 source -2.5
//! keithley6487 operate on
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use keithley6487::config::{Keithley6487Config, DEFAULT_CONFIG_PATH};
use keithley6487::instrument::{Controller, ControllerStatus};
use keithley6487::logging::{self, OutputFormat, TracingConfig};
use keithley6487::modules::{CurrentReader, VoltageSource};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "keithley6487")]
#[command(about = "Control a Keithley 6487 picoammeter / voltage source", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log output format: pretty, compact or json
    #[arg(long, default_value = "compact")]
    log_format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the instrument identity string
    Identify,

    /// Apply the reader settings and take readings
    Read {
        /// Number of readings
        #[arg(long, default_value = "1")]
        count: u32,

        /// Pause between readings in milliseconds
        #[arg(long, default_value = "0")]
        interval_ms: u64,
    },

    /// Set the source output level in volts (clamped to the source range)
    Source {
        #[arg(allow_negative_numbers = true)]
        volts: f64,
    },

    /// Switch the source output
    Operate {
        #[arg(value_enum)]
        state: Switch,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Switch {
    On,
    Off,
}

/// Front-ends wired to one connection according to the configured roles.
struct Session {
    master: Controller,
    source: VoltageSource,
    reader: CurrentReader,
}

impl Session {
    async fn open(config: &Keithley6487Config) -> Result<Self> {
        let master = Controller::master_from_settings(&config.connection)
            .await
            .with_context(|| format!("Failed to open {}", config.connection.resource))?;

        let role = |status: ControllerStatus| match status {
            ControllerStatus::Master => master.clone(),
            ControllerStatus::Slave => Controller::slave(&master),
        };
        let source = VoltageSource::new(role(config.roles.actuator));
        let reader = CurrentReader::new(role(config.roles.reader));

        Ok(Self {
            master,
            source,
            reader,
        })
    }

    async fn run(&mut self, command: Commands, config: &Keithley6487Config) -> Result<()> {
        match command {
            Commands::Identify => {
                println!("{}", self.reader.identify().await?);
            }
            Commands::Read { count, interval_ms } => {
                self.reader
                    .apply_settings(&config.reader, &config.source)
                    .await
                    .context("Failed to apply reader settings")?;
                for index in 0..count {
                    let sample = self.reader.grab_sample().await?;
                    if !sample.is_ok() {
                        warn!(index, status = sample.status, "reading flagged by instrument");
                    }
                    println!(
                        "{:>4}  {:>14.6e} A  {:>10.4} V  t={:.3} s",
                        index, sample.current, sample.voltage, sample.timestamp
                    );
                    if interval_ms > 0 && index + 1 < count {
                        tokio::time::sleep(Duration::from_millis(interval_ms)).await;
                    }
                }
            }
            Commands::Source { volts } => {
                self.source
                    .set_source_range(config.source.range.volts())
                    .await?;
                let sent = self.source.move_abs(volts).await?;
                println!("Vsource = {} V", sent);
            }
            Commands::Operate { state } => {
                let on = matches!(state, Switch::On);
                self.source.operate(on).await?;
                println!("source output {}", if on { "ON" } else { "OFF" });
            }
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Keithley6487Config::load_from(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;

    let format: OutputFormat = cli.log_format.parse().map_err(anyhow::Error::msg)?;
    let tracing_config = TracingConfig::from_config(&config)
        .map_err(anyhow::Error::msg)?
        .with_format(format);
    logging::init(tracing_config).map_err(anyhow::Error::msg)?;

    info!(
        resource = %config.connection.resource,
        actuator = %config.roles.actuator,
        reader = %config.roles.reader,
        "starting"
    );

    let mut session = Session::open(&config).await?;
    let outcome = session.run(cli.command, &config).await;

    // Close even when the command failed; report the command's error first
    let closed = session.master.close().await;
    outcome?;
    closed.context("Failed to close instrument")?;
    Ok(())
}
