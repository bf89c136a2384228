use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use delve::config::EngineConfig;
use delve::events::{LogFilter, LogStore, MemoryLogStore};
use delve::llm;
use delve::orchestrator::Orchestrator;
use delve::tools::{SynthesizeExecutor, ToolRegistry};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "delve")]
#[command(version, about = "LLM-driven research orchestrator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Research a query and print the synthesized answer with sources
    Research {
        query: String,
        /// Use the agentic pipeline (decompose + iterative retrieval + reflection)
        #[arg(long)]
        agentic: bool,
        /// Session id to use instead of a generated one
        #[arg(long)]
        session_id: Option<String>,
        /// Replay the session's event log after the answer
        #[arg(long)]
        show_events: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Research {
            query,
            agentic,
            session_id,
            show_events,
        } => research(&query, agentic, session_id, show_events).await,
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| {
            EnvFilter::try_new(
                std::env::var("LOG_LEVEL").unwrap_or_else(|_| default_level.to_string()),
            )
        })
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn research(
    query: &str,
    agentic: bool,
    session_id: Option<String>,
    show_events: bool,
) -> Result<()> {
    let config = EngineConfig::from_env();
    let client = llm::client_from_config(&config).context("Failed to build LLM client")?;

    let mut registry = ToolRegistry::new();
    registry.register("synthesize", Arc::new(SynthesizeExecutor::new(client.clone())));
    // Search and fetch executors are external collaborators; without them the
    // planner still advertises synthesis and the LLM plans around what exists.

    let log: Arc<MemoryLogStore> = Arc::new(MemoryLogStore::new());
    let orchestrator = Orchestrator::new(
        client,
        log.clone(),
        Arc::new(registry),
        config,
    );

    let result = if agentic {
        orchestrator
            .orchestrate_agentic_research(query, session_id)
            .await?
    } else {
        orchestrator.execute_research(query, session_id).await?
    };

    println!("# Answer\n\n{}\n", result.answer);
    if !result.sources.is_empty() {
        println!("## Sources");
        for source in &result.sources {
            println!("- {} ({})", source.title, source.url);
        }
        println!();
    }
    println!("session: {}", result.session_id);
    println!(
        "elapsed: {:.1}s over {} phase(s)",
        result.metadata.total_execution_time_ms as f64 / 1000.0,
        result.metadata.phases.len()
    );

    if show_events {
        println!("\n## Events");
        let entries = log
            .query(&LogFilter::session(result.session_id.as_str()))
            .await
            .context("Failed to read event log")?;
        for entry in entries {
            println!(
                "{} {}",
                entry.timestamp.format("%H:%M:%S%.3f"),
                entry.event_type.as_str()
            );
        }
    }

    Ok(())
}
