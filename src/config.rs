//! Environment-driven configuration, generalizing the bot's
//! `app_config::read_config` (`config::Config` builder + clap overrides)
//! to a dev/prod environment pair.

use anyhow::{Context, Result};
use clap::Args;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Dev,
    Prod,
}

impl Environment {
    fn from_env_var(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "prod" | "production" => Environment::Prod,
            _ => Environment::Dev,
        }
    }
}

/// Overrides accepted on the command line, layered over environment
/// variables the same way the bot's `clap` arguments override
/// `config::Config` defaults.
#[derive(Debug, Args, Default)]
pub struct CliOverrides {
    #[arg(long)]
    pub database_url: Option<String>,
    #[arg(long)]
    pub bot_token: Option<String>,
    #[arg(long)]
    pub valkey_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub env: Environment,
    pub database_url: String,
    pub bot_token: String,
    pub valkey_url: Option<String>,
}

impl AppConfig {
    /// Loads configuration from the environment, with CLI overrides
    /// taking precedence (mirroring the bot's override layering).
    pub fn load(overrides: CliOverrides) -> Result<Self> {
        let env = std::env::var("TUX_ENV")
            .map(|v| Environment::from_env_var(&v))
            .unwrap_or(Environment::Dev);

        let (db_var, token_var) = match env {
            Environment::Dev => ("DEV_DATABASE_URL", "DEV_BOT_TOKEN"),
            Environment::Prod => ("PROD_DATABASE_URL", "PROD_BOT_TOKEN"),
        };

        let database_url = overrides
            .database_url
            .or_else(|| std::env::var(db_var).ok())
            .with_context(|| format!("{db_var} must be set (or pass --database-url)"))?;

        let bot_token = overrides
            .bot_token
            .or_else(|| std::env::var(token_var).ok())
            .with_context(|| format!("{token_var} must be set (or pass --bot-token)"))?;

        let valkey_url = overrides
            .valkey_url
            .or_else(|| std::env::var("VALKEY_URL").ok())
            .filter(|s| !s.is_empty());

        Ok(AppConfig {
            env,
            database_url,
            bot_token,
            valkey_url,
        })
    }
}
