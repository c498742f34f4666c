//! CLI entry point for agent-comms

use std::path::PathBuf;
use std::time::Duration;

use agent_comms_core::bus::{
    BroadcastData, BusStats, Envelope, EnvelopeDraft, HealthStatus, HistoryBuffer, HistoryQuery,
    HistoryStore, JsonFileStore, MessageBus, MessageFilter, MessageType, Priority, PriorityQueue,
    ResponseData,
};
use agent_comms_core::config::{Config, ConfigLoader};
use agent_comms_core::logging::init_logging;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use console::style;
use serde_json::json;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "agent-comms")]
#[command(about = "Inspect and exercise the inter-agent message bus")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration directory
    #[arg(short, long, global = true)]
    config_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show configuration and persisted history status
    Status,
    /// Print statistics computed from the persisted history
    Stats {
        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// List persisted messages visible to an agent
    History {
        /// Agent whose view of the history to show
        #[arg(short, long)]
        agent: String,
        /// Only messages of this type
        #[arg(short = 't', long = "type")]
        message_type: Option<MessageType>,
        /// Only messages from this sender
        #[arg(short, long)]
        from: Option<String>,
        /// Only messages at least this urgent (name or 1-5)
        #[arg(short, long)]
        priority: Option<Priority>,
        /// Only messages stamped at or after this RFC 3339 instant
        #[arg(short, long)]
        since: Option<DateTime<Utc>>,
        /// Emit JSON instead of one line per message
        #[arg(long)]
        json: bool,
    },
    /// Run a short in-process exchange between a few agents
    Demo,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_loader = if let Some(dir) = cli.config_dir {
        ConfigLoader::with_dir(dir)
    } else {
        ConfigLoader::new()
    };
    let config = config_loader.load()?;
    let _log_guard = init_logging(&config.logging);

    match cli.command {
        Commands::Status => {
            info!("Showing status");
            run_status(&config_loader, &config)?;
        }
        Commands::Stats { json } => {
            info!("Showing bus statistics");
            run_stats(&config, json)?;
        }
        Commands::History {
            agent,
            message_type,
            from,
            priority,
            since,
            json,
        } => {
            let mut filter = MessageFilter::new();
            filter.message_type = message_type;
            filter.from = from;
            filter.priority = priority;
            let mut query = HistoryQuery::new().with_filter(filter);
            query.since = since;
            run_history(&config, &agent, &query, json)?;
        }
        Commands::Demo => {
            info!("Running demo exchange");
            run_demo(&config).await?;
        }
    }

    Ok(())
}

/// Read the persisted snapshot into a history buffer sized by the config
fn load_history(config: &Config) -> Result<HistoryBuffer> {
    let store = JsonFileStore::new(&config.bus.message_persist_path);
    let snapshot = store
        .load()
        .with_context(|| format!("reading {}", store.path().display()))?;
    let entries = snapshot.map(|s| s.history).unwrap_or_default();
    Ok(HistoryBuffer::with_entries(config.bus.max_history_size, entries))
}

fn run_status(loader: &ConfigLoader, config: &Config) -> Result<()> {
    println!("{}", style("Agent Comms Status").bold().cyan());
    println!("Version: {}\n", env!("CARGO_PKG_VERSION"));

    println!("{}", style("Configuration:").bold());
    println!("  Config directory: {}", loader.config_dir().display());
    println!("  Max queue size: {}", config.bus.max_queue_size);
    println!("  Max history size: {}", config.bus.max_history_size);
    println!("  Message timeout: {}ms", config.bus.message_timeout_ms);
    println!("  Log level: {} ({})", config.logging.level, config.logging.format);
    println!();

    println!("{}", style("Persistence:").bold());
    let enabled = if config.bus.persist_messages {
        style("enabled").green()
    } else {
        style("disabled").yellow()
    };
    println!("  Status: {}", enabled);
    println!("  Snapshot: {}", config.bus.message_persist_path.display());

    match load_history(config) {
        Ok(history) => println!("  Persisted messages: {}", history.len()),
        Err(e) => {
            warn!("Failed to read snapshot: {:#}", e);
            println!("  Persisted messages: {}", style("unreadable").red());
        }
    }

    Ok(())
}

fn run_stats(config: &Config, as_json: bool) -> Result<()> {
    let history = load_history(config)?;
    let queue = PriorityQueue::new(config.bus.max_queue_size);
    let stats = BusStats::collect(&history, &queue, 0, Utc::now());

    if as_json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    print_stats(&stats);
    Ok(())
}

fn print_stats(stats: &BusStats) {
    println!("{}", style("Message Bus Statistics").bold().cyan());
    println!("  History: {}", stats.total_messages);
    println!("  Queued: {}", stats.queued_messages);
    println!("  Subscriptions: {}", stats.active_subscriptions);

    let health = &stats.queue_health;
    let status = match health.status {
        HealthStatus::Healthy => style(health.status.as_str()).green(),
        HealthStatus::Warning => style(health.status.as_str()).yellow(),
        HealthStatus::Critical => style(health.status.as_str()).red(),
    };
    println!(
        "  Queue health: {} ({}% used, {} critical, {} expired)",
        status, health.utilization_percent, health.critical_messages, health.expired_messages
    );

    if !stats.message_types.is_empty() {
        println!("\n{}", style("By type:").bold());
        for (message_type, count) in &stats.message_types {
            println!("  {:<14} {}", message_type, count);
        }
    }
    if !stats.agent_activity.is_empty() {
        println!("\n{}", style("By sender:").bold());
        for (agent, count) in &stats.agent_activity {
            println!("  {:<14} {}", agent, count);
        }
    }
}

fn run_history(config: &Config, agent: &str, query: &HistoryQuery, as_json: bool) -> Result<()> {
    let history = load_history(config)?;
    let messages = history.for_agent(agent, query);

    if as_json {
        println!("{}", serde_json::to_string_pretty(&messages)?);
        return Ok(());
    }

    if messages.is_empty() {
        println!("No messages for {}", agent);
        return Ok(());
    }

    for envelope in &messages {
        print_envelope(envelope);
    }
    println!("\n{} message(s)", messages.len());
    Ok(())
}

fn print_envelope(envelope: &Envelope) {
    let priority = match envelope.priority {
        Priority::Critical => style(envelope.priority.as_str()).red().bold(),
        Priority::High => style(envelope.priority.as_str()).yellow(),
        _ => style(envelope.priority.as_str()).dim(),
    };
    println!(
        "{} {} [{}] {} -> {} {}",
        style(envelope.timestamp.format("%Y-%m-%d %H:%M:%S")).dim(),
        style(&envelope.id).cyan(),
        priority,
        envelope.from,
        envelope.to,
        style(envelope.message_type.as_str()).bold(),
    );
    println!("    {}", envelope.payload);
}

async fn run_demo(config: &Config) -> Result<()> {
    let bus = MessageBus::new(config.bus.clone());
    println!("{}", style("Starting demo exchange").bold().cyan());

    let mut events = bus.events();
    let broadcasts = tokio::spawn(async move {
        let mut seen = 0usize;
        while let Ok(event) = events.recv().await {
            if event.is_broadcast() {
                seen += 1;
            }
        }
        seen
    });

    let responder = bus.clone();
    bus.subscribe_with_filter(
        "validator",
        MessageFilter::new().with_type(MessageType::Request),
        move |envelope| {
            let valid = envelope.payload.get("action").is_some();
            responder.send_response(
                envelope,
                ResponseData::new("validator", json!({ "valid": valid })),
            )?;
            Ok(())
        },
    );

    bus.subscribe("mixer", |envelope| {
        println!(
            "  {} received {} from {}",
            style("mixer").green(),
            envelope.message_type,
            envelope.from
        );
        Ok(())
    });

    bus.subscribe_with_filter(
        "router",
        MessageFilter::new().with_priority(Priority::High),
        |envelope| {
            println!(
                "  {} received {} priority {}",
                style("router").green(),
                envelope.priority,
                envelope.message_type
            );
            Ok(())
        },
    );

    bus.broadcast(
        BroadcastData::new("guardian", json!({ "alert": "cpu usage high" }))
            .with_priority(Priority::Critical),
    )?;
    bus.send(
        EnvelopeDraft::new("planner", "mixer", json!({ "track": 3, "gain": -2.5 }))
            .with_priority(Priority::Low),
    )?;

    let response = bus
        .send_request(
            EnvelopeDraft::new("planner", "validator", json!({ "action": "deploy" })),
            Some(Duration::from_secs(5)),
        )
        .await?;
    println!(
        "  {} answered {}: {}",
        style("validator").green(),
        response.request_id.as_deref().unwrap_or("-"),
        response.payload
    );

    let stats = bus.stats();
    println!();
    print_stats(&stats);

    bus.shutdown();
    let seen = broadcasts.await.context("event listener failed")?;
    println!("\nBroadcast events observed: {}", seen);

    Ok(())
}
