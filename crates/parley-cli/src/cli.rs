use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "parley")]
#[command(about = "Parley - terminal client for a streaming chat backend", long_about = None)]
pub(crate) struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    pub(crate) config: Option<PathBuf>,
    #[arg(long = "print-logs", global = true, default_value_t = false)]
    pub(crate) print_logs: bool,
    #[arg(long = "log-level", global = true)]
    pub(crate) log_level: Option<String>,
    #[command(subcommand)]
    pub(crate) command: Option<Commands>,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    #[command(about = "List chat sessions")]
    Sessions {
        #[arg(long, default_value = "table")]
        format: SessionListFormat,
    },
    #[command(about = "Create a chat session and print its id")]
    New,
    #[command(about = "Delete a chat session")]
    Delete {
        #[arg(value_name = "SESSION_ID")]
        session_id: String,
    },
    #[command(about = "Start an interactive chat")]
    Chat {
        #[arg(short = 's', long)]
        session: Option<String>,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub(crate) enum SessionListFormat {
    Table,
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_flags_follow_the_subcommand() {
        let cli = Cli::parse_from([
            "parley",
            "chat",
            "--session",
            "abc",
            "--print-logs",
            "--log-level",
            "debug",
        ]);
        assert!(cli.print_logs);
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        match cli.command {
            Some(Commands::Chat { session }) => assert_eq!(session.as_deref(), Some("abc")),
            _ => panic!("expected chat"),
        }
    }

    #[test]
    fn no_subcommand_is_accepted() {
        let cli = Cli::parse_from(["parley", "--config", "/tmp/p.jsonc"]);
        assert!(cli.command.is_none());
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/p.jsonc")));
    }
}
