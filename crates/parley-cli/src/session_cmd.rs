use std::sync::Arc;

use parley_client::{ChatApi, ClientError, HttpChatApi, TokenSource};
use parley_config::ClientSettings;

use crate::cli::SessionListFormat;
use crate::terminal::print_sessions;

pub(crate) async fn list_sessions(
    settings: &ClientSettings,
    tokens: Arc<dyn TokenSource>,
    format: SessionListFormat,
) -> Result<(), ClientError> {
    let api = HttpChatApi::new(settings, tokens)?;
    let mut sessions = api.list_sessions().await?;
    sessions.sort_by(|a, b| b.recency().cmp(&a.recency()));

    match format {
        SessionListFormat::Json => {
            let rows: Vec<_> = sessions
                .iter()
                .map(|s| {
                    serde_json::json!({
                        "id": s.id,
                        "title": s.display_title(),
                        "created": s.created_at,
                        "updated": s.updated_at,
                    })
                })
                .collect();
            println!(
                "{}",
                serde_json::to_string_pretty(&rows).unwrap_or_else(|_| "[]".to_string())
            );
        }
        SessionListFormat::Table => print_sessions(&sessions),
    }
    Ok(())
}

pub(crate) async fn create_session(
    settings: &ClientSettings,
    tokens: Arc<dyn TokenSource>,
) -> Result<(), ClientError> {
    let api = HttpChatApi::new(settings, tokens)?;
    let session = api.create_session().await?;
    println!("{}", session.id);
    Ok(())
}

pub(crate) async fn delete_session(
    settings: &ClientSettings,
    tokens: Arc<dyn TokenSource>,
    session_id: &str,
) -> Result<(), ClientError> {
    let api = HttpChatApi::new(settings, tokens)?;
    api.delete_session(session_id).await?;
    println!("Chat {} deleted.", session_id);
    Ok(())
}
