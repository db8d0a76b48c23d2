/*!
 * Relay Pump CLI
 *
 * `demo` runs the pump against the in-memory broker, optionally with
 * injected faults, and prints the resulting report. `check-config`
 * validates a TOML configuration file.
 */

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use relay_pump::{
    config::{LogLevel, PumpConfig},
    endpoint::{DestinationEndpoint, EntityManager, QueueOptions, SourceEndpoint},
    fault_injection::{FaultPlan, FaultyDestination, Operation, Trigger},
    logging, ErrorCategory, InMemoryBroker, Message, MessagePump, PumpReport,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

const SOURCE_QUEUE: &str = "relay-source";
const DESTINATION_QUEUE: &str = "relay-destination";
const POISON_LABEL: &str = "poison";

#[derive(Parser)]
#[command(name = "relay-pump")]
#[command(version, about = "Resilient at-least-once message relay", long_about = None)]
struct Cli {
    /// Log level
    #[arg(long, value_enum, global = true)]
    log_level: Option<LogLevelArg>,

    /// Enable verbose (debug) logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Relay messages between two in-memory queues and report throughput
    Demo {
        /// Messages seeded into the source queue
        #[arg(short = 'n', long, default_value = "1000")]
        messages: u64,

        /// Number of parallel lanes (overrides the config file)
        #[arg(short, long)]
        parallelism: Option<usize>,

        /// Messages each receiver fetches ahead (overrides the config file)
        #[arg(long)]
        prefetch: Option<usize>,

        /// TOML configuration file
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Fail every n-th send with a transient error
        #[arg(long, value_name = "N")]
        transient_send_every: Option<u64>,

        /// Mark every n-th message as undeliverable
        #[arg(long, value_name = "N")]
        poison_every: Option<u64>,

        /// Give up waiting after this many seconds
        #[arg(long, default_value = "60")]
        timeout_secs: u64,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate a configuration file
    CheckConfig {
        /// TOML configuration file
        #[arg(value_name = "FILE")]
        path: PathBuf,
    },
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
enum LogLevelArg {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevelArg> for LogLevel {
    fn from(arg: LogLevelArg) -> Self {
        match arg {
            LogLevelArg::Error => LogLevel::Error,
            LogLevelArg::Warn => LogLevel::Warn,
            LogLevelArg::Info => LogLevel::Info,
            LogLevelArg::Debug => LogLevel::Debug,
            LogLevelArg::Trace => LogLevel::Trace,
        }
    }
}

struct DemoArgs {
    messages: u64,
    transient_send_every: Option<u64>,
    poison_every: Option<u64>,
    timeout: Duration,
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Demo {
            messages,
            parallelism,
            prefetch,
            config,
            transient_send_every,
            poison_every,
            timeout_secs,
            json,
        } => {
            let mut pump_config = match config {
                Some(path) => PumpConfig::from_file(&path)
                    .with_context(|| format!("loading {}", path.display()))?,
                None => PumpConfig::default(),
            };
            if let Some(parallelism) = parallelism {
                pump_config.parallelism = parallelism;
            }
            if let Some(prefetch) = prefetch {
                pump_config.prefetch_count = prefetch;
            }
            if json && !cli.verbose && cli.log_level.is_none() {
                pump_config.log_level = LogLevel::Warn;
            }
            apply_log_flags(&mut pump_config, cli.log_level, cli.verbose);
            logging::init_logging(&pump_config)?;

            let args = DemoArgs {
                messages,
                transient_send_every,
                poison_every,
                timeout: Duration::from_secs(timeout_secs),
                json,
            };
            run_demo(pump_config, args).await
        }
        Commands::CheckConfig { path } => {
            let mut config = PumpConfig::default();
            apply_log_flags(&mut config, cli.log_level, cli.verbose);
            logging::init_logging(&config)?;
            check_config(&path)
        }
    }
}

fn apply_log_flags(config: &mut PumpConfig, level: Option<LogLevelArg>, verbose: bool) {
    if let Some(level) = level {
        config.log_level = level.into();
    }
    config.verbose |= verbose;
}

async fn run_demo(mut config: PumpConfig, args: DemoArgs) -> Result<()> {
    let broker = InMemoryBroker::new();
    broker
        .create_queue(SOURCE_QUEUE, QueueOptions::default())
        .await?;
    broker
        .create_queue(DESTINATION_QUEUE, QueueOptions::default())
        .await?;

    let mut poisoned = 0;
    for i in 1..=args.messages {
        let mut message = Message::new(format!("payload {}", i))
            .with_id(format!("msg-{:06}", i))
            .with_label("demo")
            .with_property("sequence", i as i64);
        if args.poison_every.is_some_and(|n| n > 0 && i % n == 0) {
            message = message.with_label(POISON_LABEL);
            poisoned += 1;
        }
        broker.send(SOURCE_QUEUE, message)?;
    }
    let deliverable = args.messages - poisoned;
    config.throughput_target.get_or_insert(deliverable);

    let mut plan = FaultPlan::new();
    if let Some(n) = args.transient_send_every {
        plan = plan.fail(Operation::Send, Trigger::EveryNth(n), ErrorCategory::ServerBusy);
    }
    if poisoned > 0 {
        plan = plan.fail(
            Operation::Send,
            Trigger::LabelEquals(POISON_LABEL.to_string()),
            ErrorCategory::MalformedMessage,
        );
    }

    let source: Arc<dyn SourceEndpoint> = Arc::new(broker.source(SOURCE_QUEUE));
    let destination: Arc<dyn DestinationEndpoint> = if plan.is_empty() {
        Arc::new(broker.destination(DESTINATION_QUEUE))
    } else {
        Arc::new(FaultyDestination::new(
            Arc::new(broker.destination(DESTINATION_QUEUE)),
            plan,
        ))
    };

    info!(
        messages = args.messages,
        poisoned,
        parallelism = config.parallelism,
        "Starting demo relay"
    );
    let pump = MessagePump::start_with_config(source, destination, config).await?;

    let deadline = Instant::now() + args.timeout;
    loop {
        let metrics = pump.metrics();
        if metrics.completed + metrics.dead_lettered >= args.messages {
            break;
        }
        if Instant::now() >= deadline {
            warn!(
                settled = metrics.completed + metrics.dead_lettered,
                expected = args.messages,
                "Timed out waiting for the relay to drain"
            );
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let report = pump.stop().await?;
    let dead_letters = broker.dead_letters(SOURCE_QUEUE)?.len();
    let delivered = broker.active_count(DESTINATION_QUEUE)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report, delivered, dead_letters);
    }

    Ok(())
}

fn print_report(report: &PumpReport, delivered: usize, dead_letters: usize) {
    println!("Relay finished");
    println!("  {}", report.throughput.summary());
    println!("  {}", report.metrics.summary());
    println!("  destination holds {} messages", delivered);
    println!("  source dead-letter store holds {} messages", dead_letters);
    for lane in &report.lanes {
        println!(
            "  lane {:>2}: relayed {:>6}, dead-lettered {:>4}, transient failures {:>4}",
            lane.lane, lane.relayed, lane.dead_lettered, lane.transient_failures
        );
    }
}

fn check_config(path: &Path) -> Result<()> {
    let config = PumpConfig::from_file(path)
        .with_context(|| format!("loading {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("validating {}", path.display()))?;

    println!("{} is valid", path.display());
    println!("  parallelism:         {}", config.parallelism);
    println!("  prefetch_count:      {}", config.prefetch_count);
    println!("  receive_timeout_ms:  {}", config.receive_timeout_ms);
    println!(
        "  source_backoff:      {}ms..{}ms",
        config.source_backoff.min_ms, config.source_backoff.max_ms
    );
    println!(
        "  destination_backoff: {}ms..{}ms",
        config.destination_backoff.min_ms, config.destination_backoff.max_ms
    );
    println!("  dead_letter_reason:  {}", config.dead_letter_reason);
    Ok(())
}
