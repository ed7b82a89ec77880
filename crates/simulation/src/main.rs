//! fba-sim - run and inspect federated consensus networks in memory.
//!
//! # Quick Start
//!
//! ```bash
//! # Four validators, 3-of-4, decide five slots
//! fba-sim run --nodes 4 --slots 5
//!
//! # Same, with one validator down from the start
//! fba-sim run --nodes 4 --offline 1
//!
//! # Check a node configuration file
//! fba-sim check-config node.toml
//!
//! # Print a configuration to start from
//! fba-sim sample-config > node.toml
//! ```

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;

use fba_common::config::{
    Config, LogFormat, LogLevel, LoggingConfig, NodeConfig, QuorumSetConfig, ScpConfig,
    ThresholdPercent,
};
use fba_scp::quorum_config::threshold_from_percent;
use fba_scp::{
    config_to_quorum_set, hash_quorum_set, is_quorum_set_sane, parse_node_id, validate_quorum_config,
    QuorumSetJson,
};
use fba_simulation::logging::{self, LogConfig};
use fba_simulation::{sim_node_id, Simulation, SimulationConfig, SimulationStats};

/// Federated consensus network simulator
#[derive(Parser)]
#[command(name = "fba-sim")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging (debug level)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Enable trace logging (most verbose)
    #[arg(long, global = true)]
    trace: bool,

    /// Log output format
    #[arg(long, default_value = "text", global = true)]
    log_format: CliLogFormat,

    #[command(subcommand)]
    command: Commands,
}

/// Log output format for CLI
#[derive(Clone, Copy, Debug, Default, clap::ValueEnum)]
enum CliLogFormat {
    #[default]
    Text,
    Json,
}

impl From<CliLogFormat> for LogFormat {
    fn from(fmt: CliLogFormat) -> Self {
        match fmt {
            CliLogFormat::Text => LogFormat::Text,
            CliLogFormat::Json => LogFormat::Json,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Simulate a network deciding consecutive slots
    Run {
        /// Number of validators
        #[arg(long, default_value_t = 4)]
        nodes: usize,

        /// Flat quorum threshold (default: 67% of validators)
        #[arg(long)]
        threshold: Option<u32>,

        /// Number of non-voting watchers
        #[arg(long, default_value_t = 0)]
        watchers: usize,

        /// Number of slots to decide
        #[arg(long, default_value_t = 3)]
        slots: u64,

        /// Validators to take offline before the run, highest index first
        #[arg(long, default_value_t = 0)]
        offline: usize,

        /// Give up on a slot after this many steps
        #[arg(long, default_value_t = 100_000)]
        max_steps: u64,

        /// Node configuration whose [scp] timeouts to use
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate a node configuration file and print its quorum set
    CheckConfig {
        /// Configuration file
        #[arg(value_name = "FILE")]
        path: PathBuf,
    },

    /// Print a sample node configuration
    SampleConfig,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.trace {
        LogLevel::Trace
    } else if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    logging::init(
        &LogConfig::default()
            .with_level(level)
            .with_format(cli.log_format.into()),
    )?;

    match cli.command {
        Commands::Run {
            nodes,
            threshold,
            watchers,
            slots,
            offline,
            max_steps,
            config,
            json,
        } => {
            let scp = match config {
                Some(path) => load_config(&path)?.scp,
                None => ScpConfig::default(),
            };
            let options = RunOptions {
                simulation: SimulationConfig {
                    validators: nodes,
                    threshold,
                    watchers,
                    scp,
                },
                slots,
                offline,
                max_steps,
            };
            cmd_run(options, json)
        }
        Commands::CheckConfig { path } => cmd_check_config(&path),
        Commands::SampleConfig => cmd_sample_config(),
    }
}

fn load_config(path: &Path) -> anyhow::Result<Config> {
    Config::from_file(path).with_context(|| format!("failed to load {}", path.display()))
}

struct RunOptions {
    simulation: SimulationConfig,
    slots: u64,
    offline: usize,
    max_steps: u64,
}

#[derive(Serialize)]
struct SlotReport {
    slot_index: u64,
    value: String,
}

#[derive(Serialize)]
struct RunReport {
    validators: usize,
    watchers: usize,
    threshold: u32,
    offline: usize,
    decided: Vec<SlotReport>,
    stats: SimulationStats,
}

fn cmd_run(options: RunOptions, json: bool) -> anyhow::Result<()> {
    let validators = options.simulation.validators;
    anyhow::ensure!(
        options.offline < validators,
        "cannot take {} of {} validators offline",
        options.offline,
        validators
    );

    let mut sim = Simulation::new(options.simulation)?;
    for index in (validators - options.offline..validators).rev() {
        sim.disconnect(index);
    }

    let values = sim
        .run_slots(options.slots, options.max_steps)
        .context("simulation did not reach consensus")?;

    let report = RunReport {
        validators,
        watchers: sim.config().watchers,
        threshold: sim.config().effective_threshold(),
        offline: options.offline,
        decided: values
            .iter()
            .zip(1u64..)
            .map(|(value, slot_index)| SlotReport {
                slot_index,
                value: String::from_utf8_lossy(value.as_slice()).into_owned(),
            })
            .collect(),
        stats: sim.stats(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!(
        "{} validators ({} offline), {} watchers, threshold {}",
        report.validators, report.offline, report.watchers, report.threshold
    );
    for slot in &report.decided {
        println!("  slot {:>4}  {}", slot.slot_index, slot.value);
    }
    println!(
        "delivered {} envelopes ({} rejected, {} dropped), fired {} timers, {} ms virtual time",
        report.stats.delivered,
        report.stats.rejected,
        report.stats.dropped,
        report.stats.timers_fired,
        report.stats.elapsed_ms
    );
    Ok(())
}

fn cmd_check_config(path: &Path) -> anyhow::Result<()> {
    let config = load_config(path)?;

    if let Some(node_id) = &config.node.node_id {
        let node_id = parse_node_id(node_id).context("invalid node.node_id")?;
        println!("node id:     {}", node_id);
    }
    println!("validator:   {}", config.node.is_validator);

    validate_quorum_config(&config.node.quorum_set).context("invalid node.quorum_set")?;
    let qset = config_to_quorum_set(&config.node.quorum_set).context("invalid node.quorum_set")?;

    if let Err(reason) = is_quorum_set_sane(&qset, true) {
        println!("warning:     quorum set fails strict checks: {}", reason);
    }
    println!("quorum hash: {}", hash_quorum_set(&qset).to_hex());
    println!(
        "{}",
        serde_json::to_string_pretty(&QuorumSetJson::from_quorum_set(&qset))?
    );
    Ok(())
}

fn cmd_sample_config() -> anyhow::Result<()> {
    let validators: Vec<String> = (0..4).map(|i| sim_node_id(i).to_hex()).collect();
    let config = Config {
        node: NodeConfig {
            node_id: Some(validators[0].clone()),
            is_validator: true,
            quorum_set: QuorumSetConfig {
                threshold_percent: ThresholdPercent::new(67),
                validators,
                inner_sets: Vec::new(),
            },
        },
        scp: ScpConfig::default(),
        logging: LoggingConfig::default(),
    };

    let threshold = threshold_from_percent(67, config.node.quorum_set.validators.len());
    println!("# Sample node configuration: 4 validators, {}-of-4.", threshold);
    println!("# Node ids are hex-encoded 32-byte keys.");
    print!("{}", config.to_toml_string()?);
    Ok(())
}
