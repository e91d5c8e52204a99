// Aglogen Assistant — command-line entry point

use aglogen_assistant::assistant::AIService;
use aglogen_assistant::config::Config;
use aglogen_assistant::crypto::ApiKeyEncryption;
use aglogen_assistant::queue::{Lane, TaskQueue};
use aglogen_assistant::rag::embedding::EmbeddingService;
use aglogen_assistant::rag::indexer::Indexer;
use aglogen_assistant::rag::{DocumentIndex, RAGSearchService};
use aglogen_assistant::store::{AIProviderConfig, Store, User};
use aglogen_assistant::tool::registration::{register_all_tools, ToolServices};
use aglogen_assistant::tool::ToolRegistry;
use aglogen_assistant::web::{self, AppState};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{json, Map};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const QUEUE_CAPACITY: usize = 4096;

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

#[derive(Parser)]
#[command(
    name = "aglogen-assistant",
    about = "Aglogen Assistant — AI tools and knowledge search for aggregate simulations",
    version
)]
struct Cli {
    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum CatalogFormat {
    Json,
    Openai,
    Anthropic,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Print the tool catalog
    Tools {
        #[arg(short, long, value_enum, default_value = "json")]
        format: CatalogFormat,
        /// Only tools in this category
        #[arg(long)]
        category: Option<String>,
    },
    /// Print a new encryption key
    Keygen,
    /// Encrypt an API key for storage
    Encrypt { value: String },
    /// Create a user and print a bearer token for it
    UserAdd {
        username: String,
        #[arg(long)]
        superuser: bool,
    },
    /// Store an LLM provider configuration for a user
    ProviderAdd {
        #[arg(long)]
        user_id: i64,
        #[arg(long)]
        provider: String,
        #[arg(long)]
        model: String,
        #[arg(long)]
        api_key: String,
        #[arg(long)]
        default: bool,
    },
    /// Add a scientific document to the global knowledge base and index it
    AddDocument {
        title: String,
        /// File holding the document text
        path: PathBuf,
    },
    /// Re-index all completed simulations and analyses a user owns
    Reindex {
        #[arg(long)]
        user_id: i64,
    },
    /// Show version information
    Version,
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let level = match cli.command {
        Commands::Serve { .. } => "info",
        _ => "warn",
    };
    aglogen_assistant::logger::init(level);

    let cfg = load_config(cli.config.as_deref());

    let result = match cli.command {
        Commands::Serve { host, port } => serve_cmd(cfg, host, port).await,
        Commands::Tools { format, category } => tools_cmd(format, category.as_deref()).await,
        Commands::Keygen => {
            println!("{}", ApiKeyEncryption::generate_key());
            Ok(())
        }
        Commands::Encrypt { value } => encrypt_cmd(&cfg, &value),
        Commands::UserAdd { username, superuser } => user_add_cmd(&cfg, &username, superuser).await,
        Commands::ProviderAdd {
            user_id,
            provider,
            model,
            api_key,
            default,
        } => provider_add_cmd(&cfg, user_id, &provider, &model, &api_key, default).await,
        Commands::AddDocument { title, path } => add_document_cmd(&cfg, &title, &path).await,
        Commands::Reindex { user_id } => reindex_cmd(&cfg, user_id).await,
        Commands::Version => {
            println!("aglogen-assistant v{}", aglogen_assistant::VERSION);
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn load_config(path: Option<&str>) -> Config {
    let config_path = match path {
        Some(p) => PathBuf::from(p),
        None => Config::default_path().unwrap_or_else(|_| PathBuf::from("config.json")),
    };
    Config::load(&config_path).unwrap_or_else(|e| {
        tracing::warn!("Failed to load config: {}, using defaults", e);
        Config::default()
    })
}

// ---------------------------------------------------------------------------
// Runtime wiring
// ---------------------------------------------------------------------------

struct Runtime {
    store: Store,
    queue: TaskQueue,
    search: RAGSearchService,
}

fn open_runtime(cfg: &Config) -> anyhow::Result<Runtime> {
    let embeddings = EmbeddingService::from_config(&cfg.rag)?;
    let (store, index) = if cfg.storage.persist {
        let dir = cfg.data_dir()?;
        std::fs::create_dir_all(&dir)?;
        (
            Store::open(&dir.join("store.json"))?,
            DocumentIndex::open(&dir.join("index.json"))?,
        )
    } else {
        (Store::new(), DocumentIndex::new())
    };
    Ok(Runtime {
        store,
        queue: TaskQueue::new(QUEUE_CAPACITY),
        search: RAGSearchService::new(index, embeddings),
    })
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn serve_cmd(mut cfg: Config, host: Option<String>, port: Option<u16>) -> anyhow::Result<()> {
    if let Some(host) = host {
        cfg.server.host = host;
    }
    if let Some(port) = port {
        cfg.server.port = port;
    }
    cfg.validate()?;

    let rt = open_runtime(&cfg)?;
    let registry = ToolRegistry::global();
    let services = ToolServices::new(rt.store.clone(), rt.queue.clone(), rt.search.clone());
    register_all_tools(&registry, &services).await;

    Indexer::new(rt.store.clone(), rt.search.clone(), rt.queue.clone()).spawn_worker();

    let assistant = AIService::new(
        rt.store.clone(),
        Arc::new(cfg.encryption()?),
        cfg.assistant.clone(),
        cfg.tools.clone(),
    );
    let addr: SocketAddr = format!("{}:{}", cfg.server.host, cfg.server.port).parse()?;
    let state = Arc::new(AppState {
        store: rt.store,
        registry,
        search: rt.search,
        queue: rt.queue,
        assistant,
        config: cfg,
    });
    println!("Aglogen Assistant API listening on http://{}", addr);
    web::start_server(addr, state).await
}

async fn tools_cmd(format: CatalogFormat, category: Option<&str>) -> anyhow::Result<()> {
    let registry = ToolRegistry::new();
    let services = ToolServices::new(Store::new(), TaskQueue::new(1), RAGSearchService::default());
    register_all_tools(&registry, &services).await;

    let categories = category.map(|c| vec![c]);
    let catalog = match format {
        CatalogFormat::Openai => json!(registry.to_openai_format(categories.as_deref()).await),
        CatalogFormat::Anthropic => json!(registry.to_anthropic_format(categories.as_deref()).await),
        CatalogFormat::Json => {
            let tools = match category {
                Some(c) => registry.get_tools_by_category(c).await,
                None => registry.get_all_tools().await,
            };
            json!(tools.iter().map(|t| t.to_dict()).collect::<Vec<_>>())
        }
    };
    println!("{}", serde_json::to_string_pretty(&catalog)?);
    Ok(())
}

fn encrypt_cmd(cfg: &Config, value: &str) -> anyhow::Result<()> {
    let encryption = cfg.encryption()?;
    println!("{}", encryption.encrypt(value)?);
    Ok(())
}

async fn user_add_cmd(cfg: &Config, username: &str, superuser: bool) -> anyhow::Result<()> {
    let rt = open_runtime(cfg)?;
    let id = rt.store.read(|d| d.users.keys().max().copied().unwrap_or(0)).await + 1;
    let mut user = User::new(id, username);
    if superuser {
        user = user.superuser();
    }
    rt.store.add_user(user).await?;
    let token = rt.store.issue_token(id).await?;
    println!("Created user {} (id {})", username, id);
    println!("Token: {}", token);
    Ok(())
}

async fn provider_add_cmd(
    cfg: &Config,
    user_id: i64,
    provider: &str,
    model: &str,
    api_key: &str,
    default: bool,
) -> anyhow::Result<()> {
    let encryption = cfg.encryption()?;
    let rt = open_runtime(cfg)?;
    if rt.store.user(user_id).await.is_none() {
        anyhow::bail!("User '{}' not found", user_id);
    }
    let mut config = AIProviderConfig::new(user_id, provider, model, encryption.encrypt(api_key)?);
    config.is_default = default;
    rt.store.add_provider_config(config).await?;
    println!("Stored {} provider ({}) for user {}", provider, model, user_id);
    Ok(())
}

async fn add_document_cmd(cfg: &Config, title: &str, path: &Path) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(path)?;
    let rt = open_runtime(cfg)?;
    let indexer = Indexer::new(rt.store, rt.search, rt.queue);
    let doc = indexer.add_scientific_document(title, &content, Map::new()).await?;
    let result = indexer.index_scientific_document(&doc.id).await;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

async fn reindex_cmd(cfg: &Config, user_id: i64) -> anyhow::Result<()> {
    let rt = open_runtime(cfg)?;
    let indexer = Indexer::new(rt.store, rt.search, rt.queue.clone());
    let summary = indexer.reindex_user(user_id).await;
    let queued = summary["queued"].as_u64().unwrap_or(0);
    for _ in 0..queued {
        let Some(task) = rt.queue.next_in(Lane::Indexing).await else {
            break;
        };
        indexer.handle_task(&task).await;
    }
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
