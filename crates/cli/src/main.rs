use bridge::agent::AgentResponse;
use bridge::integrations::{self, IntegrationKind};
use bridge::pipeline::AppContext;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "askbridge")]
#[command(about = "Chat webhook gateway that answers through an AI agent with MCP tools", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Run the webhook gateway (Chatwork and Slack endpoints).
    Serve {
        /// Config file path (default: ASKBRIDGE_CONFIG_PATH or ~/.askbridge/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// HTTP port (default from config or 4000)
        #[arg(long, short)]
        port: Option<u16>,
    },

    /// Run one prompt through an integration's agent and print the answer.
    Ask {
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// chatwork, slack, crm or news
        #[arg(long, short, default_value = "slack")]
        integration: String,

        prompt: String,
    },

    /// Collect recent news on a topic and have the agent post the digest to a Slack channel.
    News {
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Slack channel name, with or without '#'
        #[arg(long, default_value = integrations::DEFAULT_NEWS_CHANNEL)]
        channel: String,

        topic: String,
    },
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("askbridge {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Serve { config, port }) => {
            if let Err(e) = run_serve(config, port).await {
                log::error!("gateway failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Ask {
            config,
            integration,
            prompt,
        }) => {
            if let Err(e) = run_ask(config, &integration, &prompt).await {
                log::error!("ask failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::News {
            config,
            channel,
            topic,
        }) => {
            let prompt = integrations::news_prompt(&topic, &channel);
            if let Err(e) = run_ask(config, IntegrationKind::News.as_str(), &prompt).await {
                log::error!("news failed: {:#}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

fn load_context(config_path: Option<PathBuf>, port: Option<u16>) -> anyhow::Result<AppContext> {
    let (mut config, path) = bridge::config::load_config(config_path)?;
    log::debug!("config loaded from {}", path.display());
    if let Some(p) = port {
        config.gateway.port = p;
    }
    AppContext::from_config(config)
}

async fn run_serve(config_path: Option<PathBuf>, port: Option<u16>) -> anyhow::Result<()> {
    let ctx = load_context(config_path, port)?;
    log::info!(
        "starting gateway on {}:{}",
        ctx.config.gateway.bind,
        ctx.config.gateway.port
    );
    bridge::gateway::run_gateway(Arc::new(ctx)).await
}

async fn run_ask(config_path: Option<PathBuf>, kind: &str, prompt: &str) -> anyhow::Result<()> {
    let kind = IntegrationKind::parse(kind)
        .ok_or_else(|| anyhow::anyhow!("unknown integration: {}", kind))?;
    let ctx = load_context(config_path, None)?;
    let integration = ctx
        .integrations
        .get(kind)
        .ok_or_else(|| anyhow::anyhow!("integration {} is disabled in config", kind))?;

    match bridge::pipeline::invoke_once(&ctx, &integration, prompt).await? {
        AgentResponse::Text(text) => println!("{}", text.trim()),
        AgentResponse::Structured(value) => println!("{}", serde_json::to_string_pretty(&value)?),
    }
    Ok(())
}
