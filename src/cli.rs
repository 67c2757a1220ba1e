use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;
use tabled::{Table, Tabled};

use arpsentry::detector::DuplicateMac;
use arpsentry::engine::{create_source, CaptureConfig, CaptureSource, PcapFileSource};
use arpsentry::output::{FanoutSink, JsonLinesSink, LogSink};
use arpsentry::{Alert, AlertSink, ArpEngine, Binding, Config, EngineStats, Severity, SinkError};

#[derive(Parser)]
#[command(name = "arpsentry")]
#[command(author, version, about = "ARP spoofing detector")]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,

    /// Also append alerts as JSON lines to this file
    #[arg(long, global = true)]
    pub json: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Monitor an interface (requires the `live` feature)
    Watch {
        /// Interface to capture on
        #[arg(short, long)]
        interface: Option<String>,
    },

    /// Replay a pcap file through the detector
    Replay {
        /// PCAP file
        file: PathBuf,

        /// Print the learned bindings at the end
        #[arg(short, long)]
        bindings: bool,
    },

    /// Print the default configuration
    Config {
        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Tabled)]
struct StatRow {
    #[tabled(rename = "Counter")]
    name: String,
    #[tabled(rename = "Value")]
    value: String,
}

#[derive(Tabled)]
struct BindingRow {
    #[tabled(rename = "IP")]
    ip: String,
    #[tabled(rename = "MAC")]
    mac: String,
    #[tabled(rename = "First seen")]
    first_seen: String,
    #[tabled(rename = "Last seen")]
    last_seen: String,
    #[tabled(rename = "Replies")]
    observations: u64,
    #[tabled(rename = "Conflicts")]
    conflicts: u32,
    #[tabled(rename = "Pinned")]
    pinned: String,
}

impl From<&Binding> for BindingRow {
    fn from(b: &Binding) -> Self {
        Self {
            ip: b.ip.to_string(),
            mac: b.mac.to_string(),
            first_seen: b.first_seen.format("%Y-%m-%d %H:%M:%S").to_string(),
            last_seen: b.last_seen.format("%Y-%m-%d %H:%M:%S").to_string(),
            observations: b.observation_count,
            conflicts: b.conflict_count,
            pinned: if b.pinned { "yes".to_string() } else { String::new() },
        }
    }
}

#[derive(Tabled)]
struct DuplicateRow {
    #[tabled(rename = "MAC")]
    mac: String,
    #[tabled(rename = "Claimed IPs")]
    ips: String,
}

impl From<&DuplicateMac> for DuplicateRow {
    fn from(d: &DuplicateMac) -> Self {
        Self {
            mac: d.mac.to_string(),
            ips: d.ips.iter().map(|ip| ip.to_string()).collect::<Vec<_>>().join(", "),
        }
    }
}

/// Prints one coloured line per alert
struct ConsoleSink;

#[async_trait]
impl AlertSink for ConsoleSink {
    fn name(&self) -> &str {
        "console"
    }

    async fn deliver(&self, alert: &Alert) -> Result<(), SinkError> {
        let severity = match alert.severity {
            Severity::Critical => alert.severity.to_string().red().bold(),
            Severity::High => alert.severity.to_string().red(),
            Severity::Medium => alert.severity.to_string().yellow(),
            Severity::Low => alert.severity.to_string().cyan(),
            Severity::Info => alert.severity.to_string().dimmed(),
        };
        println!(
            "{} [{}] {} {}",
            alert.timestamp.format("%H:%M:%S%.3f").to_string().dimmed(),
            severity,
            alert.kind.to_string().bold(),
            alert.message
        );
        Ok(())
    }
}

pub async fn run_command(cli: Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => {
            let mut config = Config::default();
            config.apply_env_overrides();
            config.validate()?;
            config
        }
    };
    if let Some(json) = cli.json {
        config.alerts.json_path = Some(json);
    }

    match cli.command {
        Commands::Watch { interface } => cmd_watch(config, interface).await,
        Commands::Replay { file, bindings } => cmd_replay(config, file, bindings).await,
        Commands::Config { output } => cmd_config(output),
    }
}

async fn cmd_watch(config: Config, interface: Option<String>) -> Result<()> {
    let capture = CaptureConfig {
        interface: interface.or_else(|| config.capture.interface.clone()),
        pcap_file: None,
        ..config.capture.clone()
    };
    let iface = capture
        .interface
        .clone()
        .context("no interface given (use --interface or [capture] interface)")?;
    let source = create_source(&capture)?;

    let mut sinks: Vec<Arc<dyn AlertSink>> = Vec::new();
    if config.alerts.log {
        sinks.push(Arc::new(LogSink::new()));
    }
    let sink = build_sink(&config, sinks).await?;

    println!("Watching {} for ARP spoofing (Ctrl+C to stop)...", iface.bold());
    let stats = run_engine(&config, source, sink).await?;
    print_stats(&stats);
    Ok(())
}

async fn cmd_replay(config: Config, file: PathBuf, show_bindings: bool) -> Result<()> {
    let source = PcapFileSource::open(&file)
        .with_context(|| format!("opening {}", file.display()))?;
    let sink = build_sink(&config, vec![Arc::new(ConsoleSink)]).await?;

    println!("Replaying {}...", file.display().to_string().bold());
    let mut engine = ArpEngine::from_config(&config);
    let stats = run_on(&mut engine, Box::new(source), sink).await?;

    if show_bindings {
        let mut bindings = engine.detector().table().snapshot();
        bindings.sort_by_key(|b| b.ip);
        let rows: Vec<BindingRow> = bindings.iter().map(BindingRow::from).collect();
        if rows.is_empty() {
            println!("No bindings learned");
        } else {
            println!("{}", Table::new(rows));
        }
    }
    print_stats(&stats);

    let duplicates: Vec<DuplicateRow> = engine
        .detector()
        .duplicate_macs()
        .iter()
        .map(DuplicateRow::from)
        .collect();
    if !duplicates.is_empty() {
        println!();
        println!("{}", "MACs answering for several IPs".yellow().bold());
        println!("{}", Table::new(duplicates));
    }
    if stats.spoofing_suspected() {
        println!("{}", "ARP spoofing suspected".red().bold());
    } else {
        println!("{}", "No ARP spoofing detected".green());
    }
    Ok(())
}

fn cmd_config(output: Option<PathBuf>) -> Result<()> {
    match output {
        Some(path) => {
            std::fs::write(&path, Config::default_with_comments())
                .with_context(|| format!("writing {}", path.display()))?;
            println!("{} {}", "Wrote".green(), path.display());
        }
        None => print!("{}", Config::default_with_comments()),
    }
    Ok(())
}

/// Combine the command's sinks with the JSON file sink if configured
async fn build_sink(config: &Config, mut sinks: Vec<Arc<dyn AlertSink>>) -> Result<Arc<dyn AlertSink>> {
    if let Some(path) = &config.alerts.json_path {
        let json = JsonLinesSink::open(path)
            .await
            .with_context(|| format!("opening {}", path.display()))?;
        sinks.push(Arc::new(json));
    }

    Ok(match sinks.len() {
        1 => sinks.remove(0),
        _ => Arc::new(FanoutSink::new(sinks)),
    })
}

async fn run_engine(
    config: &Config,
    source: Box<dyn CaptureSource>,
    sink: Arc<dyn AlertSink>,
) -> Result<EngineStats> {
    let mut engine = ArpEngine::from_config(config);
    run_on(&mut engine, source, sink).await
}

/// Run until the source ends or Ctrl+C
async fn run_on(
    engine: &mut ArpEngine,
    source: Box<dyn CaptureSource>,
    sink: Arc<dyn AlertSink>,
) -> Result<EngineStats> {
    engine.start(source, sink).await?;

    let handle = engine.shutdown_handle();
    let signals = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("\nShutting down...");
            handle.shutdown();
        }
    });

    let result = engine.wait().await;
    signals.abort();
    Ok(result?)
}

fn print_stats(stats: &EngineStats) {
    let rows: Vec<StatRow> = match serde_json::to_value(stats) {
        Ok(serde_json::Value::Object(map)) => map
            .into_iter()
            .map(|(name, value)| StatRow {
                name,
                value: value.to_string(),
            })
            .collect(),
        _ => return,
    };

    println!();
    println!("{}", "Summary".bold());
    println!("{}", Table::new(rows));

    if stats.frames_dropped > 0 || stats.alerts_dropped > 0 {
        println!(
            "{} {} frames and {} alerts dropped",
            "Warning:".yellow().bold(),
            stats.frames_dropped,
            stats.alerts_dropped
        );
    }
}
