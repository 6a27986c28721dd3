//! CLI entrypoint and subcommand orchestration.

mod config;
mod display;
#[cfg(test)]
mod test_support;

use std::path::PathBuf;
use std::str::FromStr;

use agent::ContextStrategy;
use clap::{Parser, Subcommand};
use proto::AgentRole;

#[cfg(not(test))]
use std::sync::Arc;

#[cfg(not(test))]
use agent::{
    AgentRuntime, AnthropicProvider, ContextRequest, EmbeddingService, JsonRunLog,
    OpenAiEmbeddingLoader, OpenAiProvider, RunOptions, SqliteMemory,
};
#[cfg(not(test))]
use config::Config;
#[cfg(not(test))]
use gateway::{EnvCredentials, GatewayExecutor, ProviderDispatcher};
#[cfg(not(test))]
use proto::{ChainProgress, SearchFilter, SessionId};
#[cfg(not(test))]
use tracing::{info, warn};
#[cfg(not(test))]
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Top-level command-line arguments for `mao`.
#[derive(Parser)]
#[command(name = "mao")]
#[command(about = "Multi-agent orchestration over LLM providers", version)]
struct Cli {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "warn")]
    log_level: String,

    /// Also write debug logs to <log_dir>/debug.YYYY-MM-DD.log
    #[arg(long, default_value_t = false)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a single agent
    Run {
        prompt: String,

        /// Agent name, or `auto` to let the router pick
        #[arg(short, long, default_value = agent::AUTO_AGENT)]
        agent: String,

        /// Override the agent's model (disables its fallbacks)
        #[arg(short, long)]
        model: Option<String>,

        /// Prepend context from past conversations (keyword, semantic, hybrid)
        #[arg(long, value_parser = parse_strategy)]
        context: Option<ContextStrategy>,

        /// Session to tag the stored conversation with
        #[arg(long)]
        session: Option<String>,
    },

    /// Run agents in sequence, each seeing a summary of the previous output
    Chain {
        prompt: String,

        /// Stage agents; builder, critic, closer when omitted
        stages: Vec<String>,

        /// Write a markdown report to this file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Iterate builder and critic until the critique converges, then close
    Refine { prompt: String },

    /// Inspect and manage stored conversations
    Memory {
        #[command(subcommand)]
        command: MemoryCommands,
    },
}

#[derive(Subcommand)]
enum MemoryCommands {
    /// Totals by agent and model
    Stats,
    /// Most recent conversations
    Recent {
        #[arg(short = 'n', long, default_value_t = 10)]
        limit: usize,
        #[arg(short, long)]
        agent: Option<String>,
    },
    /// Case-insensitive search over prompts and responses
    Search {
        query: String,
        #[arg(short, long)]
        agent: Option<String>,
        #[arg(short, long)]
        model: Option<String>,
        #[arg(long)]
        session: Option<String>,
        #[arg(short = 'n', long, default_value_t = 10)]
        limit: usize,
    },
    /// Print one conversation
    Show { id: i64 },
    /// Delete one conversation
    Delete { id: i64 },
    /// Delete conversations older than N days
    Cleanup {
        #[arg(long)]
        days: i64,
    },
}

fn parse_strategy(raw: &str) -> Result<ContextStrategy, String> {
    ContextStrategy::from_str(raw).map_err(|e| e.to_string())
}

/// Checks chain stage names, returning the first unknown one.
fn validate_stages(stages: &[String]) -> Result<(), String> {
    match stages.iter().find(|s| AgentRole::from_str(s).is_err()) {
        Some(bad) => Err(bad.clone()),
        None => Ok(()),
    }
}

fn valid_stage_names() -> String {
    AgentRole::ALL.map(AgentRole::as_str).join(", ")
}

#[cfg(not(test))]
#[tokio::main]
/// Program entrypoint.
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_result = Config::load(cli.config.as_deref());
    let log_dir = config_result
        .as_ref()
        .map(|c| c.logging.log_dir_path())
        .unwrap_or_else(|_| Config::default().logging.log_dir_path());

    // When --debug is passed, write debug-level logs to <log_dir>/debug.YYYY-MM-DD.log
    // with daily rotation.
    let console_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    // WorkerGuard must outlive main() so buffered file writes are flushed on exit.
    let _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>;

    if cli.debug {
        std::fs::create_dir_all(&log_dir).ok();
        let appender = tracing_appender::rolling::daily(&log_dir, "debug.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        _file_guard = Some(guard);

        let console = fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_filter(console_filter);
        let file = fmt::layer()
            .with_writer(writer)
            .with_target(true)
            .with_ansi(false)
            .with_filter(EnvFilter::new(
                "debug,hyper_util=info,rustls=info,reqwest=info,sqlx=info",
            ));
        tracing_subscriber::registry()
            .with(console)
            .with(file)
            .init();
    } else {
        _file_guard = None;
        fmt()
            .with_env_filter(console_filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .init();
    }

    if cli.debug {
        let cmd_label = match &cli.command {
            Commands::Run { .. } => "run",
            Commands::Chain { .. } => "chain",
            Commands::Refine { .. } => "refine",
            Commands::Memory { .. } => "memory",
        };
        info!(
            version = env!("CARGO_PKG_VERSION"),
            command = cmd_label,
            log_level = %cli.log_level,
            "========== mao session start =========="
        );
    }

    let config = config_result.unwrap_or_else(|e| {
        warn!("Failed to load config ({e}), using defaults");
        Config::default()
    });

    let ok = match cli.command {
        Commands::Run {
            prompt,
            agent,
            model,
            context,
            session,
        } => cmd_run(config, prompt, agent, model, context, session).await?,
        Commands::Chain {
            prompt,
            stages,
            output,
        } => cmd_chain(config, prompt, stages, output).await?,
        Commands::Refine { prompt } => cmd_refine(config, prompt).await?,
        Commands::Memory { command } => cmd_memory(config, command).await?,
    };

    if !ok {
        std::process::exit(1);
    }
    Ok(())
}

#[cfg(not(test))]
/// Registers a client for every provider the gateway knows about.
///
/// Providers without a key are still registered; the executor skips them
/// through the credential check before any call is made.
fn build_dispatcher(config: &Config) -> ProviderDispatcher {
    let dispatcher = ProviderDispatcher::new();
    let key = |var: &str| std::env::var(var).unwrap_or_default();
    let openai_compatible = |provider: &str, api_key: String, default_url: Option<&str>| {
        let client = match config.providers.base_url(provider).or(default_url) {
            Some(url) => OpenAiProvider::with_base_url(api_key, url),
            None => OpenAiProvider::new(api_key),
        };
        Arc::new(client)
    };

    dispatcher.register("openai", openai_compatible("openai", key("OPENAI_API_KEY"), None));
    dispatcher.register(
        "google",
        openai_compatible(
            "google",
            key("GOOGLE_API_KEY"),
            Some(agent::llm::GOOGLE_OPENAI_BASE_URL),
        ),
    );
    dispatcher.register(
        "openrouter",
        openai_compatible(
            "openrouter",
            key("OPENROUTER_API_KEY"),
            Some(agent::llm::OPENROUTER_BASE_URL),
        ),
    );
    // Ollama ignores the key but the client wants a non-empty one.
    dispatcher.register(
        "ollama",
        openai_compatible("ollama", "ollama".to_string(), Some(agent::llm::OLLAMA_BASE_URL)),
    );

    let anthropic_key = key("ANTHROPIC_API_KEY");
    let anthropic = match config.providers.base_url("anthropic") {
        Some(url) => AnthropicProvider::with_base_url(anthropic_key, url),
        None => AnthropicProvider::new(anthropic_key),
    };
    dispatcher.register("anthropic", Arc::new(anthropic));

    info!(providers = dispatcher.provider_count(), "Provider clients registered");
    dispatcher
}

#[cfg(not(test))]
/// Creates a runtime with the gateway, memory store, embeddings and run log.
async fn build_runtime(config: &Config) -> anyhow::Result<AgentRuntime> {
    let executor = GatewayExecutor::new(
        Arc::new(build_dispatcher(config)),
        Arc::new(EnvCredentials),
        config.gateway.to_gateway_config(),
    );
    let mut runtime = AgentRuntime::new(config.orchestration.clone(), Arc::new(executor));

    let memory = SqliteMemory::open(&config.storage.db_path)
        .await
        .map_err(|e| anyhow::anyhow!("DB error: {e}"))?;
    if !config.storage.memory_enabled {
        memory.disable();
    }
    runtime = runtime.with_memory(Arc::new(memory));

    let api_key = std::env::var("OPENAI_API_KEY").unwrap_or_default();
    if api_key.is_empty() {
        info!("OPENAI_API_KEY not set, semantic context will fall back to keyword search");
    }
    let mut loader = OpenAiEmbeddingLoader::new(api_key)
        .with_model(config.embedding.model.clone(), config.embedding.dimension);
    if let Some(url) = &config.embedding.base_url {
        loader = loader.with_base_url(url.clone());
    }
    runtime = runtime.with_embeddings(Arc::new(EmbeddingService::new(Arc::new(loader))));

    if config.logging.write_run_logs {
        runtime = runtime.with_run_log(Arc::new(JsonRunLog::new(config.logging.log_dir_path())));
    }
    Ok(runtime)
}

#[cfg(not(test))]
/// Runs one agent and prints its record. Returns `false` when the call failed.
async fn cmd_run(
    config: Config,
    prompt: String,
    agent: String,
    model: Option<String>,
    context: Option<ContextStrategy>,
    session: Option<String>,
) -> anyhow::Result<bool> {
    let runtime = build_runtime(&config).await?;

    let mut options = RunOptions::default();
    if let Some(model) = model {
        options = options.with_model(model);
    }
    if let Some(session) = session {
        options = options.with_session(SessionId::from(session));
    }
    if let Some(strategy) = context {
        let mut request = ContextRequest::from_config(&config.orchestration.context);
        request.strategy = strategy;
        options = options.with_context(request);
    }

    let record = match runtime.run(&agent, &prompt, options).await {
        Ok(record) => record,
        Err(e) => {
            eprintln!("Error: {e}");
            return Ok(false);
        }
    };
    println!("{}", display::render_run(&record));
    Ok(!record.is_error())
}

#[cfg(not(test))]
async fn cmd_chain(
    config: Config,
    prompt: String,
    stages: Vec<String>,
    output: Option<PathBuf>,
) -> anyhow::Result<bool> {
    if let Err(bad) = validate_stages(&stages) {
        eprintln!("Error: Invalid agent '{bad}'");
        eprintln!("Valid agents: {}", valid_stage_names());
        return Ok(false);
    }

    let runtime = build_runtime(&config).await?;
    let (tx, mut rx) = tokio::sync::mpsc::channel::<ChainProgress>(16);
    let progress = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if let ChainProgress::StageStarted { index, total, agent } = event {
                eprintln!("▶ Stage {index}/{total}: {agent}...");
            }
        }
    });

    let result = runtime.chain_with_progress(&prompt, &stages, tx).await;
    let _ = progress.await;
    let report = match result {
        Ok(report) => report,
        Err(e) => {
            eprintln!("Error: {e}");
            return Ok(false);
        }
    };

    let total = report.stages.len();
    for (i, record) in report.stages.iter().enumerate() {
        println!("{}", display::render_stage(i + 1, total, record));
    }
    println!("{}", display::render_chain_summary(&report));

    if let Some(path) = output {
        std::fs::write(&path, display::render_chain_markdown(&report))?;
        println!("Report written to {}", path.display());
    }
    Ok(!report.has_errors())
}

#[cfg(not(test))]
async fn cmd_refine(config: Config, prompt: String) -> anyhow::Result<bool> {
    let runtime = build_runtime(&config).await?;
    let (tx, mut rx) = tokio::sync::mpsc::channel::<ChainProgress>(32);
    let progress = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                ChainProgress::IterationStarted {
                    iteration,
                    max_iterations,
                } => eprintln!("▶ Iteration {iteration}/{max_iterations}"),
                ChainProgress::CriticsSelected { critics } => {
                    eprintln!("  critics: {}", critics.join(", "))
                }
                ChainProgress::StageStarted { agent, .. } => eprintln!("  {agent}..."),
                ChainProgress::StageFinished { .. } => {}
            }
        }
    });

    let result = runtime.refine_with_progress(&prompt, tx).await;
    let _ = progress.await;
    let report = match result {
        Ok(report) => report,
        Err(e) => {
            eprintln!("Error: {e}");
            return Ok(false);
        }
    };

    let total = report.stages.len();
    for (i, record) in report.stages.iter().enumerate() {
        println!("{}", display::render_stage(i + 1, total, record));
    }
    println!("{}", display::render_refinement(&report));
    Ok(!report.has_errors())
}

#[cfg(not(test))]
async fn cmd_memory(config: Config, command: MemoryCommands) -> anyhow::Result<bool> {
    let memory = SqliteMemory::open(&config.storage.db_path)
        .await
        .map_err(|e| anyhow::anyhow!("DB error: {e}"))?;

    match command {
        MemoryCommands::Stats => {
            let stats = memory.stats().await?;
            println!("{}", display::render_stats(&stats));
        }
        MemoryCommands::Recent { limit, agent } => {
            let conversations = memory.recent(limit, agent.as_deref()).await?;
            print!("{}", display::render_conversation_list(&conversations));
        }
        MemoryCommands::Search {
            query,
            agent,
            model,
            session,
            limit,
        } => {
            let filter = SearchFilter {
                query: Some(query),
                agent,
                model,
                session_id: session.map(SessionId::from),
                limit,
                ..SearchFilter::default()
            };
            let conversations = memory.search(&filter).await?;
            print!("{}", display::render_conversation_list(&conversations));
        }
        MemoryCommands::Show { id } => match memory.get(id).await? {
            Some(conv) => println!("{}", display::render_conversation(&conv)),
            None => {
                eprintln!("Conversation #{id} not found");
                return Ok(false);
            }
        },
        MemoryCommands::Delete { id } => {
            if memory.delete(id).await? {
                println!("Deleted conversation #{id}");
            } else {
                eprintln!("Conversation #{id} not found");
                return Ok(false);
            }
        }
        MemoryCommands::Cleanup { days } => {
            let removed = memory.cleanup(days).await?;
            println!("Removed {removed} conversation(s) older than {days} day(s)");
        }
    }
    Ok(true)
}
