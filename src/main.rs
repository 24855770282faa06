mod batch;
mod cache;
mod config;
mod engine;
mod error;
mod pool;
mod providers;
mod stores;
#[cfg(test)]
mod testing;

use anyhow::Result;
use clap::{Parser, Subcommand};
use config::{ConfigManager, MentorConfig};
use engine::{Answer, AnswerOptions, EngineDeps, ResponseOrchestrator};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use stores::graph::LocalGraph;
use stores::seed::SeedFile;
use stores::semantic::LocalVectorStore;
use stores::session::LocalSessionStore;
use tracing::info;

// ============================================================================
// CLI Argument Parsing
// ============================================================================

#[derive(Parser)]
#[command(name = "mentor", version, about = "Mentor - personalized course assistant")]
struct Cli {
    /// Output JSON instead of human-readable text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer a single question
    Ask {
        /// Learner asking the question
        #[arg(short, long)]
        learner: String,
        /// Session to attach the exchange to (a new one when omitted)
        #[arg(short, long)]
        session: Option<String>,
        /// Bypass the response cache
        #[arg(long)]
        skip_cache: bool,
        /// The question
        query: String,
    },
    /// Interactive question loop
    Chat {
        #[arg(short, long)]
        learner: String,
        #[arg(short, long)]
        session: Option<String>,
    },
    /// Warm the learner-context cache
    Preload {
        /// Learner ids to load
        #[arg(required = true)]
        learners: Vec<String>,
    },
    /// Load course content (entities, relations, documents) from a JSON file
    Seed {
        /// Seed file path
        file: PathBuf,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Print the config file location
    Path,
    /// Write the effective configuration to the config file if none exists
    Init,
}

/// JSON envelope for non-interactive output
fn json_output(success: bool, data: serde_json::Value, error: Option<&str>) -> String {
    serde_json::json!({
        "success": success,
        "data": data,
        "error": error,
    })
    .to_string()
}

#[tokio::main]
async fn main() -> Result<()> {
    // Check for --json flag before initializing logging
    let json_mode = std::env::args().any(|arg| arg == "--json");
    init_logging(json_mode);

    let cli = Cli::parse();
    run_command(cli.command, cli.json).await
}

fn init_logging(json_mode: bool) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("mentor=info"));

    if json_mode {
        // stdout carries the JSON envelope; logs go to stderr
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_ansi(false)
            .with_writer(std::io::stderr)
            .compact()
            .init();
    } else if std::env::var("MENTOR_LOG_JSON").is_ok() {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .compact()
            .init();
    }
}

// ============================================================================
// Command Runner
// ============================================================================

async fn run_command(command: Commands, json_mode: bool) -> Result<()> {
    let config_manager = ConfigManager::new()?;

    match command {
        Commands::Config { action } => run_config(action, &config_manager, json_mode),
        Commands::Ask {
            learner,
            session,
            skip_cache,
            query,
        } => {
            let runtime = EngineRuntime::start(config_manager.get()).await?;
            let session = runtime.open_session(&learner, session).await?;

            let answer = runtime
                .engine
                .answer(&learner, &session, &query, AnswerOptions { skip_cache })
                .await;
            print_answer(&answer, &session, json_mode);

            runtime.engine.shutdown().await;
            Ok(())
        }
        Commands::Chat { learner, session } => {
            let runtime = EngineRuntime::start(config_manager.get()).await?;
            let session = runtime.open_session(&learner, session).await?;
            let result = run_chat(&runtime.engine, &learner, &session, json_mode).await;
            runtime.engine.shutdown().await;
            result
        }
        Commands::Preload { learners } => {
            let runtime = EngineRuntime::start(config_manager.get()).await?;
            let loaded = runtime.engine.preload(&learners).await;
            if json_mode {
                println!(
                    "{}",
                    json_output(
                        true,
                        serde_json::json!({
                            "requested": learners.len(),
                            "loaded": loaded,
                        }),
                        None
                    )
                );
            } else {
                println!("Preloaded {} of {} learner contexts", loaded, learners.len());
            }
            runtime.engine.shutdown().await;
            Ok(())
        }
        Commands::Seed { file } => {
            let data_dir = config_manager.get().data_dir()?;
            let graph = LocalGraph::open(data_dir.join("graph"))?;
            let vectors = LocalVectorStore::open(data_dir.join("vectors"))?;
            let seed = SeedFile::read(&file).await?;
            let report = stores::seed::apply(seed, &graph, &vectors).await?;
            if json_mode {
                println!("{}", json_output(true, serde_json::to_value(&report)?, None));
            } else {
                println!(
                    "Added {} entities, {} relations, {} documents ({} entities, {} documents total)",
                    report.entities_added,
                    report.relations_added,
                    report.documents_indexed,
                    report.total_entities,
                    report.total_documents
                );
            }
            Ok(())
        }
    }
}

fn run_config(action: ConfigAction, config_manager: &ConfigManager, json_mode: bool) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let mut config = config_manager.get().clone();
            if config.provider.api_key.is_some() {
                config.provider.api_key = Some("****configured****".to_string());
            }
            if json_mode {
                println!("{}", json_output(true, serde_json::to_value(&config)?, None));
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
        ConfigAction::Path => {
            let path = config_manager.config_path().display().to_string();
            if json_mode {
                println!("{}", json_output(true, serde_json::json!({ "path": path }), None));
            } else {
                println!("{}", path);
            }
        }
        ConfigAction::Init => {
            let path = config_manager.config_path();
            let created = !path.exists();
            if created {
                config_manager.save()?;
            }
            if json_mode {
                println!(
                    "{}",
                    json_output(
                        true,
                        serde_json::json!({
                            "path": path.display().to_string(),
                            "created": created,
                        }),
                        None
                    )
                );
            } else if created {
                println!("Wrote default configuration to {}", path.display());
            } else {
                println!("Configuration already exists at {}", path.display());
            }
        }
    }
    Ok(())
}

// ============================================================================
// Engine wiring
// ============================================================================

struct EngineRuntime {
    engine: ResponseOrchestrator,
    sessions: Arc<LocalSessionStore>,
}

impl EngineRuntime {
    async fn start(config: &MentorConfig) -> Result<Self> {
        let data_dir = config.data_dir()?;
        info!(data_dir = %data_dir.display(), "Opening local stores");

        let graph = Arc::new(LocalGraph::open(data_dir.join("graph"))?);
        let similarity = Arc::new(LocalVectorStore::open(data_dir.join("vectors"))?);
        let sessions = Arc::new(LocalSessionStore::open(data_dir.join("sessions"))?);
        let provider = providers::create_provider(&config.provider)?;
        let provider_info = provider.info();
        info!(
            provider = %provider_info.name,
            display_name = %provider_info.display_name,
            default_model = %provider_info.default_model,
            "Provider configured"
        );

        let engine = ResponseOrchestrator::new(
            EngineDeps {
                similarity,
                graph,
                sessions: sessions.clone(),
                provider,
            },
            config,
        );

        Ok(Self { engine, sessions })
    }

    async fn open_session(&self, learner_id: &str, session: Option<String>) -> Result<String> {
        let session_id = session.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        self.sessions.start_session(&session_id, learner_id).await?;
        Ok(session_id)
    }
}

fn print_answer(answer: &Answer, session_id: &str, json_mode: bool) {
    if json_mode {
        let data = serde_json::json!({
            "session_id": session_id,
            "answer": answer,
        });
        println!("{}", json_output(!answer.fallback, data, None));
        return;
    }

    println!("{}", answer.text);
    println!(
        "\n[{} ms | cache {:?} | {} context item(s){}]",
        answer.latency_ms,
        answer.cache_status,
        answer.context_used.len(),
        if answer.fallback { " | fallback" } else { "" }
    );
}

async fn run_chat(
    engine: &ResponseOrchestrator,
    learner_id: &str,
    session_id: &str,
    json_mode: bool,
) -> Result<()> {
    if !json_mode {
        println!("Mentor chat (session {})", session_id);
        println!("Commands: :stats, :clear, :quit");
    }

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        if !json_mode {
            print!("> ");
            stdout.flush()?;
        }

        let mut input = String::new();
        if stdin.lock().read_line(&mut input)? == 0 {
            break;
        }
        let input = input.trim();
        if input.is_empty() {
            continue;
        }

        match input {
            ":quit" | ":exit" => break,
            ":clear" => {
                engine.clear_caches();
                if json_mode {
                    println!("{}", json_output(true, serde_json::json!({ "cleared": true }), None));
                } else {
                    println!("Caches cleared");
                }
            }
            ":stats" => {
                engine.purge_expired();
                let metrics = engine.metrics();
                if json_mode {
                    println!("{}", json_output(true, serde_json::to_value(&metrics)?, None));
                } else {
                    for cache in &metrics.caches {
                        println!(
                            "{:<18} {:>6} entries  {:>5.1}% hit rate  {} evicted  {} expired",
                            cache.name,
                            cache.entries,
                            cache.hit_rate() * 100.0,
                            cache.evicted,
                            cache.expired
                        );
                    }
                    println!(
                        "pool               {} idle  {} in use  {} opened  {} discarded",
                        metrics.pool.idle, metrics.pool.in_use, metrics.pool.opened, metrics.pool.discarded
                    );
                    println!(
                        "batch              {} pending  {} flushed  {} dropped",
                        metrics.batch.pending, metrics.batch.flushed_items, metrics.batch.dropped_items
                    );
                    println!(
                        "post-processing    {} failure(s)  {} dropped",
                        metrics.post_process_failures, metrics.post_process_dropped
                    );
                }
            }
            query => {
                let answer = engine
                    .answer(learner_id, session_id, query, AnswerOptions::default())
                    .await;
                print_answer(&answer, session_id, json_mode);
            }
        }
    }

    Ok(())
}
