use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{CommandFactory, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use storyloom_core::config::{AppConfig, ModelConfig};
use storyloom_core::event::EventBus;
use storyloom_core::types::{ExecutionEvent, ExecutionMeta};
use storyloom_engine::{
    topological_order, validate_dag, Actor, Capabilities, CreateRecipe, OrchestratorBuilder,
    RecipeOrchestrator, RecipeService,
};
use storyloom_store::SqliteStore;

#[derive(Parser)]
#[command(name = "storyloom", version, about = "Recipe-driven generation pipelines")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "storyloom.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP gateway
    Serve,
    /// Check a recipe file and print its execution order
    Validate {
        /// Recipe JSON file
        file: PathBuf,
    },
    /// Execute a stored recipe and print the final execution
    Run {
        /// Recipe id
        recipe_id: String,
        /// External input as a JSON object
        #[arg(long, default_value = "{}")]
        input: String,
        /// Project id recorded on the execution
        #[arg(long)]
        project: Option<String>,
    },
    /// Install the built-in recipes
    Seed,
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("storyloom=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    // Commands that need no config
    match &cli.command {
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(*shell, &mut cmd, "storyloom", &mut std::io::stdout());
            return Ok(());
        }
        Commands::Validate { file } => return validate_file(file),
        _ => {}
    }

    let config = load_config(&cli.config)?;

    if let Commands::Config = cli.command {
        println!("{}", toml::to_string_pretty(&redacted(&config))?);
        return Ok(());
    }

    let workspace = config.workspace_dir();
    std::fs::create_dir_all(&workspace)?;
    let store = Arc::new(SqliteStore::open(&config.database_path())?);
    let recipes = RecipeService::new(store.clone());

    match cli.command {
        Commands::Seed => {
            let report = recipes.seed(&Actor::admin("cli")).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Run {
            recipe_id,
            input,
            project,
        } => {
            let input: serde_json::Value = serde_json::from_str(&input)
                .map_err(|e| anyhow::anyhow!("--input is not valid JSON: {}", e))?;
            let orchestrator = build_orchestrator(&config, store)?;
            run_recipe(&orchestrator, &recipe_id, input, project).await?;
        }
        Commands::Serve => {
            let gateway_config = config.gateway.clone().unwrap_or_default();
            let orchestrator = build_orchestrator(&config, store)?;
            info!(bind = %gateway_config.bind, "Starting gateway");
            let server = storyloom_gateway::GatewayServer::new(gateway_config, orchestrator, recipes);

            let cancel = tokio_util::sync::CancellationToken::new();
            let cancel_clone = cancel.clone();

            // Graceful shutdown on Ctrl-C
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                info!("Shutting down gateway...");
                cancel_clone.cancel();
            });

            server.run(cancel).await?;
        }
        Commands::Validate { .. } | Commands::Config | Commands::Completions { .. } => {}
    }

    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }

    let home_config = dirs_home().map(|h| h.join(".storyloom").join("config.toml"));
    if let Some(path) = home_config.filter(|p| p.exists()) {
        info!(path = %path.display(), "Loading config from home directory");
        return Ok(AppConfig::load(&path)?);
    }

    eprintln!("Warning: No config file found. Set OPENAI_API_KEY or GEMINI_API_KEY, or create storyloom.toml");
    Ok(create_env_config())
}

/// Minimal config built from provider API keys in the environment.
fn create_env_config() -> AppConfig {
    let openai = std::env::var("OPENAI_API_KEY").ok();
    let gemini = std::env::var("GEMINI_API_KEY").ok();
    let anthropic = std::env::var("ANTHROPIC_API_KEY").ok();

    let mut config = AppConfig::default();
    config.models.text = match (&openai, &gemini, &anthropic) {
        (Some(key), _, _) => Some(ModelConfig::new("openai", "gpt-4o-mini").with_api_key(key)),
        (None, Some(key), _) => Some(ModelConfig::new("gemini", "gemini-2.0-flash").with_api_key(key)),
        (None, None, Some(key)) => {
            Some(ModelConfig::new("anthropic", "claude-sonnet-4-20250514").with_api_key(key))
        }
        (None, None, None) => None,
    };
    config.models.image = match (&gemini, &openai) {
        (Some(key), _) => {
            Some(ModelConfig::new("gemini", "imagen-3.0-generate-002").with_api_key(key))
        }
        (None, Some(key)) => Some(ModelConfig::new("openai", "gpt-image-1").with_api_key(key)),
        (None, None) => None,
    };
    config.models.video = gemini
        .map(|key| ModelConfig::new("gemini", "veo-2.0-generate-001").with_api_key(key));

    if config.models.text.is_none() {
        warn!("No text model configured; text generation nodes will fail");
    }
    config
}

fn build_orchestrator(config: &AppConfig, store: Arc<SqliteStore>) -> anyhow::Result<RecipeOrchestrator> {
    let providers = storyloom_llm::build_providers(&config.models)?;
    let capabilities = Capabilities {
        text: providers.text,
        image: providers.image,
        video: providers.video,
        uploader: None,
    };

    let log_dir = config.log_dir();
    if let Some(dir) = &log_dir {
        std::fs::create_dir_all(dir)?;
    }

    Ok(OrchestratorBuilder {
        recipes: store.clone(),
        executions: store,
        capabilities,
        event_bus: Arc::new(EventBus::default()),
        log_dir,
    }
    .build(&config.engine))
}

async fn run_recipe(
    orchestrator: &RecipeOrchestrator,
    recipe_id: &str,
    input: serde_json::Value,
    project: Option<String>,
) -> anyhow::Result<()> {
    let mut events = orchestrator.event_bus().subscribe();
    let meta = ExecutionMeta {
        user_id: Some("cli".to_string()),
        project_id: project,
        stage_id: None,
    };
    let handle = orchestrator.start(recipe_id, input, meta).await?;
    let execution_id = handle.execution_id.clone();

    // Progress on stderr while the walk runs
    let progress = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if event.execution_id() != execution_id {
                continue;
            }
            match &event {
                ExecutionEvent::NodeStarted { node_id, .. } => eprintln!("▶ {}", node_id),
                ExecutionEvent::NodeCompleted {
                    node_id,
                    elapsed_ms,
                    ..
                } => eprintln!("✓ {} ({}ms)", node_id, elapsed_ms),
                ExecutionEvent::NodeFailed { node_id, error, .. } => {
                    eprintln!("✗ {}: {}", node_id, error)
                }
                _ => {}
            }
            if event.is_terminal() {
                break;
            }
        }
    });

    let execution = handle.wait().await?;
    progress.abort();
    println!("{}", serde_json::to_string_pretty(&execution)?);
    Ok(())
}

fn validate_file(path: &Path) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(path)?;
    let recipe: CreateRecipe = serde_json::from_str(&content)?;
    let name = recipe.name.unwrap_or_else(|| path.display().to_string());
    let nodes = recipe.nodes.unwrap_or_default();
    let edges = recipe.edges.unwrap_or_default();
    validate_dag(&nodes, &edges)?;
    let order = topological_order(&nodes, &edges)?;
    println!("{}: valid ({} nodes)", name, nodes.len());
    println!("order: {}", order.join(" -> "));
    Ok(())
}

/// Config with API keys and tokens masked, for display.
fn redacted(config: &AppConfig) -> AppConfig {
    let mask = |key: &mut Option<String>| {
        if key.is_some() {
            *key = Some("***".to_string());
        }
    };

    let mut shown = config.clone();
    for model in [
        shown.models.text.as_mut(),
        shown.models.image.as_mut(),
        shown.models.video.as_mut(),
    ]
    .into_iter()
    .flatten()
    {
        mask(&mut model.api_key);
    }
    for model in &mut shown.models.text_fallbacks {
        mask(&mut model.api_key);
    }
    if let Some(gateway) = shown.gateway.as_mut() {
        mask(&mut gateway.token);
        for key in &mut gateway.api_keys {
            key.key = "***".to_string();
        }
    }
    shown
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
