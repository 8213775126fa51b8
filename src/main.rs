use std::path::PathBuf;
use std::sync::Arc;

use autoscrape::{
    app_context::AppContext,
    cancel::SessionControl,
    config::Config,
    config_persistence::{default_config_path, load_config_file, persist_config_file},
    credentials,
    engine::RunOptions,
    model::Provider,
    prompt::{AutoApprove, OperatorPrompt, StdinPrompt},
    protocol::SessionOutcome,
};
use clap::{Parser, Subcommand};
use log::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "autoscrape", version, about = "Scene metadata enrichment automation")]
struct Cli {
    /// Log at debug level.
    #[arg(short, long, global = true)]
    verbose: bool,
    /// Config file to use instead of the default location.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run an automation session for each scene, one after another.
    Run {
        #[arg(required = true)]
        scene_ids: Vec<String>,
        /// Scrape this provider even if the scene already carries its data.
        #[arg(long)]
        force: Vec<Provider>,
        /// Ask before applying each scraped result.
        #[arg(long)]
        manual: bool,
    },
    /// Show per-provider completion for a scene.
    Status { scene_id: String },
    #[command(subcommand)]
    Queue(QueueCommand),
    #[command(subcommand)]
    History(HistoryCommand),
    /// Show per-provider success counters.
    Stats {
        #[arg(long)]
        reset: bool,
    },
    #[command(subcommand)]
    Config(ConfigCommand),
    #[command(subcommand)]
    Credentials(CredentialsCommand),
}

#[derive(Subcommand, Debug)]
enum QueueCommand {
    List,
    Due,
    Clear,
}

#[derive(Subcommand, Debug)]
enum HistoryCommand {
    Stats,
    Export { file: PathBuf },
    Import { file: PathBuf },
    Clear,
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    Path,
    /// Write the current (or default) config back to disk.
    Init,
}

#[derive(Subcommand, Debug)]
enum CredentialsCommand {
    /// Store the query API key in the system keyring.
    Set { api_key: String },
}

type CliResult = Result<(), Box<dyn std::error::Error>>;

fn format_timestamp(timestamp_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp_ms)
        .map(|time| time.to_rfc3339())
        .unwrap_or_else(|| timestamp_ms.to_string())
}

fn config_path(cli: &Cli) -> Option<PathBuf> {
    cli.config.clone().or_else(default_config_path)
}

fn load_config(path: Option<&PathBuf>) -> Config {
    match path {
        Some(path) => load_config_file(path),
        None => {
            warn!("No config directory available. Using defaults.");
            Config::default()
        }
    }
}

async fn run_sessions(
    context: &AppContext,
    scene_ids: &[String],
    force: &[Provider],
) -> CliResult {
    for scene_id in scene_ids {
        let control = SessionControl::new();
        let watcher = {
            let control = control.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupt received. Cancelling the running session");
                    control.cancel();
                }
            })
        };
        let result = context
            .engine
            .run(
                scene_id,
                RunOptions {
                    force: force.to_vec(),
                    control: Some(control),
                },
            )
            .await;
        watcher.abort();

        let report = result?;
        println!("{}", report.summary.headline());
        if report.outcome == SessionOutcome::Cancelled {
            info!("Session cancelled. Remaining scenes are not processed");
            break;
        }
    }
    Ok(())
}

async fn print_status(context: &AppContext, scene_id: &str) -> CliResult {
    let snapshot = context.tracker.refresh(scene_id).await?;
    println!(
        "{} \"{}\": {}% complete",
        snapshot.scene.label(),
        snapshot.scene.title,
        snapshot.percentage
    );
    for entry in &snapshot.per_source {
        let state = if entry.status.found {
            format!(
                "found via {} ({}%)",
                entry.status.strategy_name, entry.status.confidence
            )
        } else {
            "missing".to_string()
        };
        println!("  {:<10} {}", entry.provider.display_name(), state);
    }
    println!(
        "  {:<10} {}",
        "organized",
        if snapshot.organized.found { "yes" } else { "no" }
    );
    for recommendation in &snapshot.recommendations {
        println!("  - {recommendation}");
    }
    Ok(())
}

fn print_queue(context: &AppContext, due_only: bool) -> CliResult {
    let entries = if due_only {
        context.queue.due_entries()?
    } else {
        context.queue.entries()?
    };
    if entries.is_empty() {
        println!("Rescrape queue is empty");
    }
    for entry in entries {
        println!(
            "scene:{}  next {}  attempts {}  ({})",
            entry.record_id,
            format_timestamp(entry.next_attempt_ms),
            entry.attempt_count,
            entry.reason
        );
    }
    Ok(())
}

fn history_command(context: &AppContext, command: HistoryCommand) -> CliResult {
    match command {
        HistoryCommand::Stats => {
            let statistics = context.history.statistics()?;
            println!("{}", serde_json::to_string_pretty(&statistics)?);
        }
        HistoryCommand::Export { file } => {
            let count = context.history.export_to_file(&file)?;
            println!("Exported {count} entries to {}", file.display());
        }
        HistoryCommand::Import { file } => {
            let report = context.history.import_from_file(&file)?;
            println!(
                "Imported {} entries ({} duplicates, {} rejected)",
                report.imported, report.duplicates, report.rejected
            );
        }
        HistoryCommand::Clear => {
            let removed = context.history.clear()?;
            println!("Removed {removed} history entries");
        }
    }
    Ok(())
}

fn stats_command(context: &AppContext, reset: bool) -> CliResult {
    if reset {
        let removed = context.stats.reset()?;
        println!("Reset counters for {removed} providers");
        return Ok(());
    }
    let all = context.stats.get_all()?;
    for provider in Provider::ALL {
        let stats = all.get(&provider).copied().unwrap_or_default();
        let last = stats
            .last_attempt_ms
            .map(format_timestamp)
            .unwrap_or_else(|| "never".to_string());
        println!(
            "{:<10} {} ok / {} failed ({:.0}%), last attempt {}",
            provider.display_name(),
            stats.success_count,
            stats.fail_count,
            stats.success_ratio() * 100.0,
            last
        );
    }
    Ok(())
}

fn main() -> CliResult {
    let cli = Cli::parse();

    let mut clog = colog::default_builder();
    let level = if cli.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    clog.filter(None, level);
    clog.init();

    std::panic::set_hook(Box::new(|panic_info| {
        let current_thread = std::thread::current();
        let thread_name = current_thread.name().unwrap_or("unnamed");
        log::error!("panic in thread '{}': {}", thread_name, panic_info);
    }));

    let path = config_path(&cli);
    let mut config = load_config(path.as_ref());

    match &cli.command {
        Command::Config(ConfigCommand::Path) => {
            match path {
                Some(path) => println!("{}", path.display()),
                None => println!("no config directory available"),
            }
            return Ok(());
        }
        Command::Config(ConfigCommand::Init) => {
            let Some(path) = path else {
                return Err("no config directory available".into());
            };
            persist_config_file(&config, &path)?;
            println!("Wrote {}", path.display());
            return Ok(());
        }
        Command::Credentials(CredentialsCommand::Set { api_key }) => {
            credentials::set_api_key(&config.api.endpoint, api_key.trim())?;
            println!("Stored API key for {}", config.api.endpoint);
            return Ok(());
        }
        _ => {}
    }

    let manual = matches!(cli.command, Command::Run { manual: true, .. });
    let prompt: Arc<dyn OperatorPrompt> = if manual {
        config.automation.auto_apply = false;
        Arc::new(StdinPrompt)
    } else {
        Arc::new(AutoApprove)
    };
    let context = AppContext::open(config, prompt)?;
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    match cli.command {
        Command::Run {
            scene_ids, force, ..
        } => runtime.block_on(run_sessions(&context, &scene_ids, &force)),
        Command::Status { scene_id } => runtime.block_on(print_status(&context, &scene_id)),
        Command::Queue(QueueCommand::List) => print_queue(&context, false),
        Command::Queue(QueueCommand::Due) => print_queue(&context, true),
        Command::Queue(QueueCommand::Clear) => {
            let removed = context.queue.clear()?;
            println!("Removed {removed} queued scenes");
            Ok(())
        }
        Command::History(command) => history_command(&context, command),
        Command::Stats { reset } => stats_command(&context, reset),
        Command::Config(_) | Command::Credentials(_) => Ok(()),
    }
}
