//! fleetrun CLI - distributed test runner for device fleets.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

use fleetrun::analytics::{LoggingTracker, Track};
use fleetrun::config::{self, DevicesConfig};
use fleetrun::discovery;
use fleetrun::provider;
use fleetrun::report::{self, ConsoleTracker};
use fleetrun::scheduler::Scheduler;

#[derive(Parser)]
#[command(name = "fleetrun")]
#[command(about = "Distributed test runner for device fleets", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "fleetrun.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run tests
    Run {
        /// Test list (plain `package.Class#method` lines or JSON)
        #[arg(short, long)]
        tests: PathBuf,

        /// Override the number of local devices
        #[arg(short, long)]
        devices: Option<usize>,

        /// Treat every test as a strict run
        #[arg(long)]
        strict: bool,
    },

    /// Load a test list and print it without running anything
    Collect {
        /// Test list (plain `package.Class#method` lines or JSON)
        #[arg(short, long)]
        tests: PathBuf,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Validate configuration file
    Validate,

    /// Initialize a new configuration file
    Init {
        /// Number of local devices
        #[arg(short, long, default_value_t = 2)]
        devices: usize,

        /// Command run once per batch
        #[arg(long, default_value = "./run-tests.sh {tests}")]
        command: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run {
            tests,
            devices,
            strict,
        } => run_tests(&cli.config, &tests, devices, strict, cli.verbose).await,
        Commands::Collect { tests, format } => collect_tests(&tests, &format),
        Commands::Validate => validate_config(&cli.config),
        Commands::Init { devices, command } => init_config(&cli.config, devices, &command),
    }
}

async fn run_tests(
    config_path: &Path,
    tests_path: &Path,
    devices_override: Option<usize>,
    strict: bool,
    verbose: bool,
) -> Result<()> {
    let mut config = config::load_config(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    if let Some(count) = devices_override {
        match &mut config.devices {
            DevicesConfig::Local(local) => local.count = count,
        }
    }
    if strict {
        config.run.strict_mode = true;
    }
    config::validate(&config).context("Invalid configuration")?;
    info!("Loaded configuration from {}", config_path.display());

    let tests = discovery::load_tests(tests_path)
        .with_context(|| format!("Failed to load tests from {}", tests_path.display()))?;
    if tests.is_empty() {
        warn!("No tests to run");
        return Ok(());
    }

    let track = Track::new();
    track.register(LoggingTracker);
    track.register(ConsoleTracker::new(verbose));

    let devices = provider::from_config(&config.devices, config.run.test_output_timeout());
    let report_config = config.report.clone();
    let scheduler = Scheduler::new(config, devices).with_track(track);

    let stop = scheduler.stop_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, waiting for running batches to finish");
            stop.cancel();
        }
    });

    let result = scheduler.run(tests).await?;

    report::print_summary(&result);
    if report_config.json {
        let path = report::write_json_summary(&result, &report_config.output_dir)
            .with_context(|| format!("Failed to write summary to {}", report_config.output_dir.display()))?;
        info!("Summary written to {}", path.display());
    }

    std::process::exit(result.exit_code());
}

fn collect_tests(tests_path: &Path, format: &str) -> Result<()> {
    let tests = discovery::load_tests(tests_path)
        .with_context(|| format!("Failed to load tests from {}", tests_path.display()))?;

    match format {
        "json" => {
            let json = serde_json::to_string_pretty(&tests)?;
            println!("{}", json);
        }
        _ => {
            println!("Loaded {} tests:", tests.len());
            for test in &tests {
                let properties: Vec<&str> =
                    test.meta_properties.iter().map(|p| p.name.as_str()).collect();
                if properties.is_empty() {
                    println!("  {}", test);
                } else {
                    println!("  {} [{}]", test, properties.join(", "));
                }
            }
        }
    }

    Ok(())
}

fn validate_config(config_path: &Path) -> Result<()> {
    let result = config::load_config(config_path)
        .and_then(|config| config::validate(&config).map(|()| config).map_err(Into::into));

    match result {
        Ok(config) => {
            println!("Configuration is valid!");
            println!();
            println!("Settings:");
            println!(
                "  Uncompleted retry quota: {}",
                config.run.uncompleted_test_retry_quota
            );
            println!(
                "  Batch timeout: {}ms",
                config.run.test_batch_timeout_millis
            );
            println!("  Strict mode: {}", config.run.strict_mode);
            println!("  Batching: {:?}", config.strategies.batching);
            println!("  Retry: {:?}", config.strategies.retry);
            println!("  Pooling: {:?}", config.strategies.pooling);

            match &config.devices {
                DevicesConfig::Local(local) => {
                    println!("  Devices: {} local ({})", local.count, local.command);
                }
            }

            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    }
}

fn init_config(path: &Path, devices: usize, command: &str) -> Result<()> {
    if path.exists() {
        eprintln!(
            "{} already exists. Remove it first or edit manually.",
            path.display()
        );
        std::process::exit(1);
    }

    let config = format!(
        r#"# fleetrun configuration file

[run]
uncompleted_test_retry_quota = 3
ignore_crash_regexes = []
strict_mode = false
test_batch_timeout_millis = 900000
test_output_timeout_millis = 60000
no_devices_timeout_secs = 300

[strategies.batching]
type = "fixed-size"
size = 5

[strategies.retry]
type = "fixed-quota"
total_allowed_retry_quota = 200
retry_per_test_quota = 3

[strategies.pooling]
type = "omni"

[devices]
type = "local"
count = {}
command = {}

[report]
output_dir = "fleetrun-output"
json = true
"#,
        devices,
        toml_string(command)
    );

    std::fs::write(path, config)?;
    println!("Created {}", path.display());
    println!();
    println!("Edit the configuration as needed, then run:");
    println!("  fleetrun run --tests tests.txt");

    Ok(())
}

/// Quotes a value as a TOML basic string.
fn toml_string(value: &str) -> String {
    toml::Value::String(value.to_string()).to_string()
}
