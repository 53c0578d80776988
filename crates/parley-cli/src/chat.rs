use std::sync::Arc;

use parley_client::{ChatEngine, ClientContext, ClientError, TokenSource};
use parley_config::ClientSettings;

use crate::repl::spawn_stdin_reader;
use crate::terminal::TerminalRenderer;

/// Interactive chat until `/quit` or end of input. Opens `session`, else the
/// most recent chat, else a new one.
pub(crate) async fn run_chat(
    settings: ClientSettings,
    tokens: Arc<dyn TokenSource>,
    session: Option<String>,
) -> Result<(), ClientError> {
    let render = Arc::new(TerminalRenderer::new());
    let ctx = ClientContext::connect_http(settings, tokens, render)?;
    let mut engine = ChatEngine::new(ctx);

    let sessions = engine.list_sessions().await?;
    match session.or_else(|| sessions.first().map(|s| s.id.clone())) {
        Some(id) => engine.activate(&id).await?,
        None => {
            engine.new_session().await?;
        }
    }
    eprintln!("Type a message, or /help for commands.");

    let result = engine.run(spawn_stdin_reader()).await;
    tracing::info!(ok = result.is_ok(), "chat ended");
    result
}
