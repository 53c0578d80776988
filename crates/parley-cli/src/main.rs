use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use parley_client::{ClientError, StaticToken, TokenSource};
use parley_config::ConfigLoader;
use parley_util::{init_tracing, LogLevel};

mod chat;
mod cli;
mod repl;
mod session_cmd;
mod terminal;
mod util;

use chat::run_chat;
use cli::*;
use repl::login_hint;
use session_cmd::{create_session, delete_session, list_sessions};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut loader = ConfigLoader::new();
    let config = loader
        .load_all(cli.config.as_deref())
        .context("Failed to load configuration")?;
    let settings = config
        .resolve()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    let level = cli
        .log_level
        .as_deref()
        .or(config.log_level())
        .map(LogLevel::from_str_lossy);
    let log_dir = config
        .log_dir()
        .or_else(|| dirs::data_local_dir().map(|d| d.join("parley").join("log")));
    let log_guard = init_tracing(level, log_dir, cli.print_logs);
    tracing::info!(
        api_url = %settings.api_url,
        ws_url = %settings.ws_url,
        config_files = loader.config_paths().len(),
        "parley starting"
    );

    let tokens: Arc<dyn TokenSource> = Arc::new(StaticToken::new(config.token().map(str::to_string)));

    let result = match cli.command {
        Some(Commands::Sessions { format }) => list_sessions(&settings, tokens, format).await,
        Some(Commands::New) => create_session(&settings, tokens).await,
        Some(Commands::Delete { session_id }) => delete_session(&settings, tokens, &session_id).await,
        Some(Commands::Chat { session }) => run_chat(settings, tokens, session).await,
        None => run_chat(settings, tokens, None).await,
    };

    match result {
        Ok(()) => Ok(()),
        Err(err @ ClientError::Auth(_)) => {
            tracing::warn!(%err, "authentication required");
            eprintln!("{}", login_hint(&err));
            drop(log_guard);
            std::process::exit(2);
        }
        Err(err) => Err(anyhow::anyhow!(err)),
    }
}
