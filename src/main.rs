use clap::{Arg, Command};
use inbox_triage::correlator::{find_suppressible, AlertCandidate};
use inbox_triage::cycle::{open_queue, open_triage_log};
use inbox_triage::server::{self, ServerState};
use inbox_triage::triage_log::LogSummary;
use inbox_triage::webhook::WebhookNotifier;
use inbox_triage::{
    Config, ConfigSource, CycleOutcome, GmailInbox, StatisticsCollector, TriageCycle,
};
use log::LevelFilter;
use std::path::Path;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;

#[tokio::main]
async fn main() {
    let matches = Command::new("inbox-triage")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Rule-based inbox triage with an idempotent action queue")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .env("INBOX_TRIAGE_CONFIG")
                .help("Configuration file path")
                .default_value("./triage.yaml"),
        )
        .arg(
            Arg::new("port")
                .long("port")
                .value_name("PORT")
                .env("INBOX_TRIAGE_PORT")
                .help("Port for the /health and /stats server (overrides server.port)")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Write an example configuration file")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("test-config")
                .long("test-config")
                .help("Validate the configuration and list its rules")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("once")
                .long("once")
                .help("Run a single triage cycle and exit")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("stats")
                .long("stats")
                .help("Summarize the triage log")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("list-pending")
                .long("list-pending")
                .help("List pending action queue items")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("mark-done")
                .long("mark-done")
                .value_name("ID")
                .help("Mark an action queue item as done")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("queue-cleanup")
                .long("queue-cleanup")
                .help("Auto-resolve stale queue items and expire old done-markers")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("report-suppressible")
                .long("report-suppressible")
                .help("List logged DOWN alerts that a later UP alert resolved")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable debug logging")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    if let Some(generate_path) = matches.get_one::<String>("generate-config") {
        generate_default_config(generate_path);
        return;
    }

    let config_path = matches
        .get_one::<String>("config")
        .cloned()
        .unwrap_or_else(|| "./triage.yaml".to_string());

    if matches.get_flag("test-config") {
        test_config(&config_path);
        return;
    }

    let source = match load_config(&config_path) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("Error loading configuration: {e:#}");
            process::exit(1);
        }
    };
    let config = source.current().config;
    let base_dir = source.base_dir().to_path_buf();

    if matches.get_flag("stats") {
        show_log_summary(&config, &base_dir);
        return;
    }

    if matches.get_flag("list-pending") {
        list_pending(&config, &base_dir);
        return;
    }

    if let Some(id) = matches.get_one::<String>("mark-done") {
        let queue = open_queue_or_exit(&config, &base_dir);
        queue.mark_done(id);
        println!("✅ Marked {id} as done");
        return;
    }

    if matches.get_flag("queue-cleanup") {
        let queue = open_queue_or_exit(&config, &base_dir);
        match queue.cleanup() {
            Ok(report) => {
                println!("🧹 Queue cleanup complete");
                println!("  ├─ Auto-resolved: {}", report.auto_resolved);
                println!("  └─ Done-markers removed: {}", report.markers_removed);
            }
            Err(e) => {
                println!("❌ Queue cleanup failed: {e:#}");
                process::exit(1);
            }
        }
        return;
    }

    if matches.get_flag("report-suppressible") {
        report_suppressible(&config, &base_dir);
        return;
    }

    let port = matches
        .get_one::<u16>("port")
        .copied()
        .unwrap_or(config.server.port);
    if let Err(e) = run(source, port, matches.get_flag("once")).await {
        log::error!("{e:#}");
        process::exit(1);
    }
}

async fn run(source: ConfigSource, port: u16, once: bool) -> anyhow::Result<()> {
    let config = source.current().config;
    let stats = StatisticsCollector::new();
    let inbox = Arc::new(GmailInbox::new(&config.inbox, source.base_dir())?);
    let webhook = WebhookNotifier::from_config(&config.webhook, stats.clone())?;
    if webhook.is_none() {
        log::info!("No webhook URL configured, notifications disabled");
    }
    let cycle = Arc::new(TriageCycle::new(source, inbox, stats.clone(), webhook)?);
    let grace = Duration::from_secs(config.webhook.shutdown_grace_seconds);

    if config.triage.shadow_mode {
        log::info!("Shadow mode: decisions are logged, nothing is queued");
    }

    if once {
        let outcome = cycle.run_once().await;
        drain_webhooks(&cycle, grace).await;
        return match outcome {
            CycleOutcome::Completed(report) => {
                log::info!(
                    "Cycle complete: {} fetched, {} decided, {} queued, {} errors",
                    report.fetched,
                    report.decided,
                    report.queued,
                    report.errors
                );
                Ok(())
            }
            CycleOutcome::Failed(message) => Err(anyhow::anyhow!("triage cycle failed: {message}")),
            CycleOutcome::Skipped => Ok(()),
        };
    }

    let host = config.server.host.clone();
    let server_state = ServerState {
        stats: stats.clone(),
    };
    let server_task = tokio::spawn(async move {
        if let Err(e) = server::serve(&host, port, server_state).await {
            log::error!("Health server stopped: {e:#}");
        }
    });

    log::info!(
        "Starting inbox triage, polling every {}s",
        config.inbox.check_interval_seconds
    );
    let mut ticker =
        tokio::time::interval(Duration::from_secs(config.inbox.check_interval_seconds));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut cycles = JoinSet::new();
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                while cycles.try_join_next().is_some() {}
                let cycle = Arc::clone(&cycle);
                cycles.spawn(async move {
                    cycle.run_once().await;
                });
            }
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    log::warn!("Failed to listen for shutdown signal: {e}");
                }
                log::info!("Received shutdown signal, finishing current cycle...");
                break;
            }
        }
    }

    while cycles.join_next().await.is_some() {}
    drain_webhooks(&cycle, grace).await;
    server_task.abort();
    log::info!("Inbox triage stopped");
    Ok(())
}

async fn drain_webhooks(cycle: &TriageCycle, grace: Duration) {
    if let Some(webhook) = cycle.webhook() {
        webhook.drain(grace).await;
    }
}

fn load_config(path: &str) -> anyhow::Result<ConfigSource> {
    let path = Path::new(path);
    if path.exists() {
        ConfigSource::load(path)
    } else {
        log::warn!(
            "Configuration file '{}' not found, using default configuration",
            path.display()
        );
        let base_dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => ".".into(),
        };
        Ok(ConfigSource::fixed(Config::default(), base_dir))
    }
}

fn generate_default_config(path: &str) {
    match Config::example().to_file(path) {
        Ok(()) => {
            println!("Example configuration written to: {path}");
            println!("Please edit the rules and whitelist to suit your inbox.");
        }
        Err(e) => {
            eprintln!("Error writing configuration file: {e}");
            process::exit(1);
        }
    }
}

fn test_config(path: &str) {
    println!("🔍 Testing configuration {path}...");
    println!();
    let config = match Config::from_file(path) {
        Ok(config) => config,
        Err(e) => {
            println!("❌ Configuration validation failed:");
            println!("Error: {e:#}");
            process::exit(1);
        }
    };

    println!("Number of rules: {}", config.triage.rules.len());
    for (i, rule) in config.triage.rules.iter().enumerate() {
        let assignee = rule
            .assign_to
            .as_deref()
            .map(|a| format!(" → {a}"))
            .unwrap_or_default();
        println!("  Rule {}: {} ({}{assignee})", i + 1, rule.name, rule.action);
    }
    let whitelist = config.inbox.whitelisted_domains.len() + config.inbox.whitelisted_addresses.len();
    if whitelist == 0 {
        println!("Whitelist: empty (all senders accepted)");
    } else {
        println!("Whitelist entries: {whitelist}");
    }
    if config.triage.shadow_mode {
        println!("Shadow mode: enabled");
    }
    println!("✅ Configuration is valid");
}

fn open_queue_or_exit(config: &Config, base_dir: &Path) -> inbox_triage::ActionQueue {
    match open_queue(config, base_dir) {
        Ok(queue) => queue,
        Err(e) => {
            println!("❌ Failed to open action queue: {e:#}");
            process::exit(1);
        }
    }
}

fn show_log_summary(config: &Config, base_dir: &Path) {
    let log = open_triage_log(config, base_dir);
    let entries = match log.read_entries() {
        Ok(entries) => entries,
        Err(e) => {
            println!("❌ Failed to read triage log: {e:#}");
            process::exit(1);
        }
    };
    let summary = LogSummary::from_entries(&entries);

    println!("📊 Inbox Triage Statistics");
    println!("═══════════════════════════════════════");
    println!();
    if summary.total == 0 {
        println!("📭 No decisions logged yet in {}", log.path().display());
        return;
    }

    println!("📈 Decisions: {} ({} in shadow mode)", summary.total, summary.shadow);
    print_breakdown(&summary.by_action, summary.total);
    println!();
    if let (Some(first), Some(last)) = (summary.first, summary.last) {
        println!("  First: {}", first.format("%Y-%m-%d %H:%M:%S UTC"));
        println!("  Last:  {}", last.format("%Y-%m-%d %H:%M:%S UTC"));
        println!();
    }

    println!("🎯 By classification:");
    print_breakdown(&summary.by_classification, summary.total);
}

fn print_breakdown(counts: &std::collections::BTreeMap<String, usize>, total: usize) {
    let mut rows: Vec<_> = counts.iter().collect();
    rows.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
    for (i, (name, count)) in rows.iter().enumerate() {
        let branch = if i + 1 == rows.len() { "└─" } else { "├─" };
        let pct = (**count as f64 / total as f64) * 100.0;
        println!("  {branch} {}: {count} ({pct:.1}%)", truncate_string(name, 40));
    }
}

fn list_pending(config: &Config, base_dir: &Path) {
    let queue = open_queue_or_exit(config, base_dir);
    let items = match queue.pending_items() {
        Ok(items) => items,
        Err(e) => {
            println!("❌ Failed to list queue: {e:#}");
            process::exit(1);
        }
    };
    if items.is_empty() {
        println!("📭 No pending items in {}", queue.dir().display());
        return;
    }
    println!("📋 Pending items ({}):", items.len());
    for item in items {
        println!(
            "  • {} [{} / {}] {} | {}",
            item.email_id,
            item.action,
            item.classification,
            item.from,
            truncate_string(&item.subject, 60)
        );
    }
}

fn report_suppressible(config: &Config, base_dir: &Path) {
    let entries = match open_triage_log(config, base_dir).read_entries() {
        Ok(entries) => entries,
        Err(e) => {
            println!("❌ Failed to read triage log: {e:#}");
            process::exit(1);
        }
    };
    let candidates: Vec<AlertCandidate> = entries.iter().map(AlertCandidate::from).collect();
    let suppressible = find_suppressible(&candidates, &config.alerts.classification);
    if suppressible.is_empty() {
        println!("✅ No resolved '{}' alerts found", config.alerts.classification);
        return;
    }
    println!("🔕 Resolved alerts ({}):", suppressible.len());
    for id in suppressible {
        let subject = entries
            .iter()
            .find(|e| e.email_id == id)
            .map(|e| e.subject.as_str())
            .unwrap_or_default();
        println!("  • {id} | {}", truncate_string(subject, 60));
    }
}

fn truncate_string(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{head}...")
    }
}
