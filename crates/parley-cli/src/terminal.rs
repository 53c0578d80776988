use std::io::{self, Write};
use std::sync::Mutex;

use parley_client::{ChannelState, Notification, RenderSink};
use parley_types::{Message, MessageRole, MessageStatus, Session};

use crate::util::truncate_text;

#[derive(Default)]
struct TerminalState {
    active: Option<String>,
    /// A reply is being printed and the cursor sits after its last fragment.
    mid_line: bool,
}

/// Prints the active chat to stdout. Replies are written fragment by
/// fragment; notifications and connection changes go to stderr.
#[derive(Default)]
pub(crate) struct TerminalRenderer {
    state: Mutex<TerminalState>,
}

impl TerminalRenderer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn is_active(&self, session_id: &str) -> bool {
        self.state
            .lock()
            .map(|s| s.active.as_deref() == Some(session_id))
            .unwrap_or(false)
    }

    fn end_line(&self) {
        if let Ok(mut state) = self.state.lock() {
            if state.mid_line {
                println!();
                state.mid_line = false;
            }
        }
    }

    fn set_mid_line(&self, value: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.mid_line = value;
        }
    }
}

fn print_message(message: &Message) {
    match (message.role, message.status) {
        (MessageRole::User, MessageStatus::Failed) => println!("you> {}  [not sent]", message.content),
        (MessageRole::User, _) => println!("you> {}", message.content),
        (MessageRole::Assistant, MessageStatus::Failed) => {
            println!("assistant> {}  [interrupted]", message.content)
        }
        (MessageRole::Assistant, _) => println!("assistant> {}", message.content),
        (MessageRole::System, _) => println!("system> {}", message.content),
    }
}

pub(crate) fn print_sessions(sessions: &[Session]) {
    if sessions.is_empty() {
        println!("No chats yet. Use /new to start one.");
        return;
    }
    println!("{:<38} {:<30} Updated", "Chat ID", "Title");
    println!("{}", "-".repeat(88));
    for session in sessions {
        println!(
            "{:<38} {:<30} {}",
            session.id,
            truncate_text(session.display_title(), 30),
            session.recency().format("%Y-%m-%d %H:%M")
        );
    }
}

impl RenderSink for TerminalRenderer {
    fn message_appended(&self, message: &Message) {
        if !self.is_active(&message.session_id) || message.role != MessageRole::Assistant {
            return;
        }
        self.end_line();
        print!("assistant> {}", message.content);
        let _ = io::stdout().flush();
        if message.is_streaming() {
            self.set_mid_line(true);
        } else {
            println!();
        }
    }

    fn message_updated(&self, message: &Message) {
        if self.is_active(&message.session_id)
            && message.role == MessageRole::User
            && message.status == MessageStatus::Failed
        {
            self.end_line();
            eprintln!("(not sent) {}", truncate_text(&message.content, 60));
        }
    }

    fn fragment(&self, session_id: &str, _key: &str, delta: &str) {
        if !self.is_active(session_id) {
            return;
        }
        print!("{}", delta);
        let _ = io::stdout().flush();
        self.set_mid_line(true);
    }

    fn message_finalized(&self, message: &Message) {
        if !self.is_active(&message.session_id) {
            return;
        }
        if message.status == MessageStatus::Failed {
            print!("  [interrupted]");
        }
        self.end_line();
    }

    fn transcript_replaced(&self, session_id: &str, messages: &[Message]) {
        if !self.is_active(session_id) {
            return;
        }
        self.end_line();
        for message in messages {
            if message.is_streaming() {
                print!("assistant> {}", message.content);
                let _ = io::stdout().flush();
                self.set_mid_line(true);
            } else {
                print_message(message);
            }
        }
    }

    fn sessions_listed(&self, sessions: &[Session]) {
        self.end_line();
        print_sessions(sessions);
    }

    fn session_renamed(&self, session: &Session) {
        if self.is_active(&session.id) {
            self.end_line();
            eprintln!("(title) {}", session.display_title());
        }
    }

    fn active_session_changed(&self, session_id: Option<&str>) {
        self.end_line();
        if let Ok(mut state) = self.state.lock() {
            state.active = session_id.map(str::to_string);
        }
        match session_id {
            Some(id) => eprintln!("-- chat {} --", id),
            None => eprintln!("-- no chat selected, use /new or /switch <id> --"),
        }
    }

    fn connection_changed(&self, state: ChannelState) {
        match state {
            ChannelState::Open => tracing::debug!("connection open"),
            ChannelState::Reconnecting { .. } | ChannelState::Closed => {
                self.end_line();
                eprintln!("(connection {})", state);
            }
            ChannelState::Connecting => {}
        }
    }

    fn notification(&self, notification: &Notification) {
        self.end_line();
        eprintln!("{}", notification_line(notification));
    }
}

fn notification_line(notification: &Notification) -> String {
    if notification.retry {
        format!("[{}] {} (try again, or /reconnect)", notification.level, notification.text)
    } else {
        format!("[{}] {}", notification.level, notification.text)
    }
}
