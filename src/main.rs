mod advice;
mod agent;
mod config;
mod health;
mod llm;
mod parser;
mod platform;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::advice::AdviceGenerator;
use crate::agent::Agent;
use crate::config::Config;
use crate::llm::LlmClient;
use crate::parser::OptionParser;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .or_else(|_| tracing_subscriber::EnvFilter::try_from_env("LOG_LEVEL"))
                .unwrap_or_else(|_| "info,choicebot=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config_path = std::env::args().nth(1).map(PathBuf::from).or_else(|| {
        let default = PathBuf::from("config.toml");
        default.exists().then_some(default)
    });

    match &config_path {
        Some(path) => info!("Loading configuration from: {}", path.display()),
        None => info!("Loading configuration from environment"),
    }
    let config = Config::load(config_path.as_deref()).map_err(|e| {
        error!("{:#}", e);
        e
    })?;

    info!("Configuration loaded successfully");
    info!("  Provider: {}", config.llm.provider);
    info!("  Model: {}", config.llm.model);
    info!("  Max options: {}", config.bot.max_options);
    info!("  Response timeout: {:?}", config.bot.response_timeout);

    let backend = Arc::new(LlmClient::new(&config.llm));
    let agent = Arc::new(Agent::new(
        OptionParser::new(config.bot.max_options),
        AdviceGenerator::new(backend, &config),
    ));

    let health = if config.health.enabled {
        let port = config.health.port;
        Some(tokio::spawn(async move {
            if let Err(e) = health::serve(port).await {
                error!("{:#}", e);
            }
        }))
    } else {
        None
    };

    info!(version = env!("CARGO_PKG_VERSION"), "Decision bot is starting...");
    let result = platform::telegram::run(agent, &config.telegram)
        .await
        .context("Telegram platform stopped with an error");

    if let Some(handle) = health {
        handle.abort();
    }

    if let Err(e) = &result {
        error!("{:#}", e);
    }
    result
}
