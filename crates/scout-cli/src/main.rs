use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use scout_client::{HtmlCleaner, OpenAiRecipeGenerator, ReqwestFetcher};
use scout_core::recipe::Recipe;
use scout_core::traits::SourceStore;
use scout_core::{
    AnalyzerConfig, PageAnalyzer, Registration, ReplayEngine, Route, SchedulerConfig,
    SchedulerService, SourceRun, TracingSchedulerReporter, classify,
};
use scout_db::{Database, DatabaseConfig, SourceRepository};

#[derive(Parser)]
#[command(name = "scout", version, about = "Recipe-driven event extraction")]
struct Cli {
    #[command(flatten)]
    llm: LlmArgs,

    /// Allow fetching private/loopback addresses
    #[arg(long, global = true, default_value_t = false)]
    allow_private: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct LlmArgs {
    /// LLM model used to generate recipes
    #[arg(long, global = true, env = "SCOUT_MODEL", default_value = "gpt-4o-mini")]
    model: String,

    /// OpenAI-compatible API base URL
    #[arg(
        long,
        global = true,
        env = "SCOUT_BASE_URL",
        default_value = "https://api.openai.com/v1"
    )]
    base_url: String,

    /// API key (may be empty for local servers)
    #[arg(long, global = true, env = "SCOUT_API_KEY", default_value = "", hide_env_values = true)]
    api_key: String,

    /// Minimum confidence for a generated recipe to be accepted
    #[arg(long, global = true, default_value_t = 0.3)]
    threshold: f64,
}

#[derive(Subcommand)]
enum Commands {
    /// Show whether a URL is handled by a built-in extractor
    Classify { url: String },

    /// Generate a recipe for a page and print it as JSON
    Analyze {
        url: String,

        /// Also write the recipe to this file
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Replay a saved recipe against a page and print the events
    Replay {
        url: String,

        /// Recipe JSON file (as written by `analyze`)
        #[arg(short, long)]
        recipe: PathBuf,
    },

    /// Register a URL as a source
    Add {
        url: String,

        /// Display name (defaults to the domain)
        #[arg(short, long)]
        name: Option<String>,

        /// Only register; leave analysis to the next `run` cycle
        #[arg(long, default_value_t = false)]
        defer: bool,
    },

    /// List registered sources
    List,

    /// Disable an enabled source, or re-enable a disabled one
    Toggle { id: Uuid },

    /// Re-analyze a failed source
    Retry { id: Uuid },

    /// Run the scheduler
    Run {
        /// Run a single cycle and exit
        #[arg(long, default_value_t = false)]
        once: bool,

        /// Hours between cycles
        #[arg(long, default_value_t = 24)]
        interval_hours: u64,

        /// Sources processed concurrently
        #[arg(short, long, default_value_t = 4)]
        concurrency: usize,
    },
}

type Service =
    SchedulerService<SourceRepository, ReqwestFetcher, HtmlCleaner, OpenAiRecipeGenerator>;

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("scout=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Classify { url } => cmd_classify(&url)?,
        Commands::Analyze { url, out } => {
            let analyzer = build_analyzer(&cli.llm, cli.allow_private)?;
            cmd_analyze(&analyzer, &url, out.as_deref()).await?;
        }
        Commands::Replay { url, recipe } => {
            let engine = ReplayEngine::new(build_fetcher(cli.allow_private)?);
            cmd_replay(&engine, &url, &recipe).await?;
        }
        Commands::Add { url, name, defer } => {
            let service = build_service(&cli.llm, cli.allow_private, SchedulerConfig::default())
                .await?;
            cmd_add(&service, &url, name.as_deref(), defer).await?;
        }
        Commands::List => {
            let service = build_service(&cli.llm, cli.allow_private, SchedulerConfig::default())
                .await?;
            cmd_list(service.store()).await?;
        }
        Commands::Toggle { id } => {
            let service = build_service(&cli.llm, cli.allow_private, SchedulerConfig::default())
                .await?;
            let status = service.toggle(id).await?;
            println!("{id} is now {status}");
        }
        Commands::Retry { id } => {
            let service = build_service(&cli.llm, cli.allow_private, SchedulerConfig::default())
                .await?;
            let run = service
                .retry(id)
                .await
                .with_context(|| format!("Retry of {id} failed"))?;
            print_run(&run);
        }
        Commands::Run {
            once,
            interval_hours,
            concurrency,
        } => {
            if interval_hours == 0 {
                bail!("--interval-hours must be at least 1");
            }
            let config = SchedulerConfig::default()
                .with_concurrency(concurrency)
                .with_interval(Duration::from_secs(interval_hours * 60 * 60));
            let service = build_service(&cli.llm, cli.allow_private, config).await?;
            cmd_run(&service, once).await?;
        }
    }

    Ok(())
}

fn build_fetcher(allow_private: bool) -> Result<ReqwestFetcher> {
    let fetcher = ReqwestFetcher::new().context("Failed to create HTTP client")?;
    Ok(if allow_private {
        fetcher.allow_private_urls()
    } else {
        fetcher
    })
}

fn build_analyzer(
    llm: &LlmArgs,
    allow_private: bool,
) -> Result<PageAnalyzer<ReqwestFetcher, HtmlCleaner, OpenAiRecipeGenerator>> {
    if !(0.0..=1.0).contains(&llm.threshold) {
        bail!("--threshold must be between 0 and 1, got {}", llm.threshold);
    }
    let generator = OpenAiRecipeGenerator::with_base_url(&llm.api_key, &llm.model, &llm.base_url)
        .context("Failed to create LLM client")?;
    let config = AnalyzerConfig {
        acceptance_threshold: llm.threshold,
        ..AnalyzerConfig::default()
    };
    Ok(PageAnalyzer::with_config(
        build_fetcher(allow_private)?,
        HtmlCleaner::new()?,
        generator,
        config,
    ))
}

async fn build_service(
    llm: &LlmArgs,
    allow_private: bool,
    config: SchedulerConfig,
) -> Result<Service> {
    let db_config = DatabaseConfig::from_env()?;
    let db = Database::connect(&db_config)
        .await
        .context("Failed to connect to database")?;
    db.migrate().await?;

    let analyzer = build_analyzer(llm, allow_private)?;
    Ok(SchedulerService::new(
        db.sources(),
        build_fetcher(allow_private)?,
        analyzer,
        config,
    ))
}

fn cmd_classify(url: &str) -> Result<()> {
    match classify(url)? {
        Route::Builtin(extractor) => println!("builtin: {extractor}"),
        Route::Generic => println!("generic"),
    }
    Ok(())
}

async fn cmd_analyze(
    analyzer: &PageAnalyzer<ReqwestFetcher, HtmlCleaner, OpenAiRecipeGenerator>,
    url: &str,
    out: Option<&Path>,
) -> Result<()> {
    if let Route::Builtin(extractor) = classify(url)? {
        tracing::warn!(%url, %extractor, "URL is handled by a built-in extractor");
    }

    let recipe = analyzer
        .analyze(url)
        .await
        .with_context(|| format!("Analysis of {url} failed"))?;

    if analyzer.is_accepted(&recipe) {
        tracing::info!(confidence = recipe.confidence(), "Recipe accepted");
    } else {
        tracing::warn!(
            confidence = recipe.confidence(),
            notes = recipe.notes(),
            "Recipe below acceptance threshold"
        );
    }

    let json = serde_json::to_string_pretty(&recipe)?;
    if let Some(path) = out {
        std::fs::write(path, &json)
            .with_context(|| format!("Failed to write recipe to {}", path.display()))?;
    }
    println!("{json}");
    Ok(())
}

async fn cmd_replay(engine: &ReplayEngine<ReqwestFetcher>, url: &str, path: &Path) -> Result<()> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read recipe file: {}", path.display()))?;
    let recipe = Recipe::from_json(&raw).context("Invalid recipe file")?;

    let events = engine.replay(url, &recipe).await?;
    println!("{}", serde_json::to_string_pretty(&events)?);
    Ok(())
}

async fn cmd_add(service: &Service, url: &str, name: Option<&str>, defer: bool) -> Result<()> {
    let registration = if defer {
        service.register_deferred(url, name).await?
    } else {
        service.register(url, name).await?
    };

    match registration {
        Registration::Builtin(extractor) => {
            println!("{url} is handled by the built-in '{extractor}' extractor; nothing to add");
            return Ok(());
        }
        Registration::Existing(source) => {
            println!("Already registered: {} ({})", source.id, source.status);
            return Ok(());
        }
        Registration::Created { source, run } => {
            println!("Registered {} ({})", source.id, source.domain);
            if let Some(run) = run {
                print_run(&run);
            }
        }
    }
    Ok(())
}

async fn cmd_list(store: &SourceRepository) -> Result<()> {
    let sources = store.list_sources().await?;
    if sources.is_empty() {
        println!("No sources registered");
        return Ok(());
    }

    for source in &sources {
        let stored = store.event_count(source.id).await?;
        let recipe = source
            .recipe
            .as_ref()
            .map(|r| format!("{} @ {:.2}", r.kind(), r.confidence()))
            .unwrap_or_else(|| "-".into());
        let last = source
            .last_scraped_at
            .map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
            .unwrap_or_else(|| "never".into());

        println!(
            "{}  {:<9} {:<28} recipe: {:<22} last run: {} ({} events, {stored} stored)",
            source.id,
            source.status.as_str(),
            source.name,
            recipe,
            last,
            source.last_event_count,
        );
        if let Some(error) = &source.last_error {
            println!("    last error: {error}");
        }
    }

    println!("\nTotal: {} sources", sources.len());
    Ok(())
}

async fn cmd_run(service: &Service, once: bool) -> Result<()> {
    let token = CancellationToken::new();
    let shutdown = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Ctrl-C received, finishing up");
            shutdown.cancel();
        }
    });

    let reporter = TracingSchedulerReporter;
    if once {
        let summary = service.run_cycle(&token, &reporter).await?;
        println!(
            "analyzed {}, replayed {}, events {} ({} new), failed {}{}",
            summary.analyzed,
            summary.replayed,
            summary.events,
            summary.new_events,
            summary.failed,
            if summary.cancelled { ", cancelled" } else { "" },
        );
        return Ok(());
    }

    service.run(token, &reporter).await?;
    Ok(())
}

fn print_run(run: &SourceRun) {
    let confidence = run
        .confidence
        .map(|c| format!(", confidence {c:.2}"))
        .unwrap_or_default();
    let events = run
        .events
        .map(|n| format!(", {n} events ({} new)", run.new_events))
        .unwrap_or_default();
    println!("{}: {}{confidence}{events}", run.url, run.status);
    if let Some(error) = &run.error {
        println!("    error: {error}");
    }
}
