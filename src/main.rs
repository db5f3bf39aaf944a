use chat_bridge::providers::anthropic::AnthropicProvider;
use chat_bridge::providers::gemini::GeminiProvider;
use chat_bridge::providers::grok::GrokProvider;
use chat_bridge::providers::ChatProvider;
use chat_bridge::{build_router, AppState, AuthKeys, GatewayConfig, ModelRegistry};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "chat-bridge",
    about = "OpenAI-compatible gateway over Anthropic, Gemini and Grok",
    version
)]
struct Cli {
    /// Path to config file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Host to bind (overrides config)
    #[arg(long)]
    host: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chat_bridge=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = GatewayConfig::find_and_load(cli.config.as_deref())?;

    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(host) = cli.host {
        config.host = host;
    }

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(300))
        .build()?;

    let mut providers: Vec<Arc<dyn ChatProvider>> = Vec::new();

    match config.providers.anthropic.resolve_api_key() {
        Some(key) => providers.push(Arc::new(AnthropicProvider::new(
            client.clone(),
            key,
            config.providers.anthropic.base_url.clone(),
        ))),
        None => warn!(
            env = %config.providers.anthropic.api_key_env,
            "Anthropic not configured, skipping"
        ),
    }
    match config.providers.gemini.resolve_api_key() {
        Some(key) => providers.push(Arc::new(GeminiProvider::new(
            client.clone(),
            key,
            config.providers.gemini.base_url.clone(),
        ))),
        None => warn!(
            env = %config.providers.gemini.api_key_env,
            "Gemini not configured, skipping"
        ),
    }
    match config.providers.grok.resolve_api_key() {
        Some(key) => providers.push(Arc::new(GrokProvider::new(
            client.clone(),
            key,
            config.providers.grok.base_url.clone(),
        ))),
        None => warn!(
            env = %config.providers.grok.api_key_env,
            "Grok not configured, skipping"
        ),
    }

    let registry = Arc::new(ModelRegistry::new(providers)?);

    let auth = Arc::new(AuthKeys::parse(&config.effective_api_keys()));
    if auth.is_enabled() {
        info!("Gateway auth enabled");
    } else {
        warn!("No gateway API keys configured, auth is disabled");
    }

    let state = Arc::new(AppState {
        registry,
        auth,
    });

    let app = build_router(state);
    let bind_addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;

    info!("chat-bridge v{}", env!("CARGO_PKG_VERSION"));
    info!("Listening on http://{}", bind_addr);

    axum::serve(listener, app).await?;

    Ok(())
}
