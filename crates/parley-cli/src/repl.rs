use parley_client::{ClientError, Command};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

pub(crate) const HELP: &str = "\
Commands:
  /new                 start a new chat
  /switch <id>         open another chat
  /sessions            list chats
  /delete <id>         delete a chat
  /attach <ref> [text] send a message with an uploaded file reference
  /reconnect           reopen the live connection
  /hide | /show        pause or resume the live view
  /quit                leave
Anything else is sent as a message.";

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Input {
    Command(Command),
    Help,
    Invalid(String),
    Blank,
}

pub(crate) fn parse_line(line: &str) -> Input {
    let line = line.trim();
    if line.is_empty() {
        return Input::Blank;
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Input::Command(Command::Send(line.to_string()));
    };

    let (name, arg) = match rest.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (rest, ""),
    };
    match (name, arg) {
        ("new", _) => Input::Command(Command::NewSession),
        ("sessions" | "ls", _) => Input::Command(Command::ListSessions),
        ("reconnect", _) => Input::Command(Command::Reconnect),
        ("hide", _) => Input::Command(Command::SetVisible(false)),
        ("show", _) => Input::Command(Command::SetVisible(true)),
        ("quit" | "exit" | "q", _) => Input::Command(Command::Quit),
        ("help" | "?", _) => Input::Help,
        ("switch" | "delete" | "attach", "") => Input::Invalid(format!("/{} needs an argument", name)),
        ("switch", id) => Input::Command(Command::Switch(id.to_string())),
        ("delete", id) => Input::Command(Command::Delete(id.to_string())),
        ("attach", arg) => {
            let (file_ref, content) = match arg.split_once(char::is_whitespace) {
                Some((file_ref, content)) => (file_ref, content.trim()),
                None => (arg, ""),
            };
            Input::Command(Command::SendWithAttachment {
                content: content.to_string(),
                file_ref: file_ref.to_string(),
            })
        }
        _ => Input::Invalid(format!("unknown command /{}", name)),
    }
}

/// Read stdin lines on a background task and forward them as commands.
/// The channel closes on end of input.
pub(crate) fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<Command> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "stdin read failed");
                    break;
                }
            };
            match parse_line(&line) {
                Input::Command(command) => {
                    let quit = command == Command::Quit;
                    if tx.send(command).is_err() || quit {
                        break;
                    }
                }
                Input::Help => println!("{}", HELP),
                Input::Invalid(reason) => eprintln!("{}", reason),
                Input::Blank => {}
            }
        }
    });
    rx
}

pub(crate) fn login_hint(err: &ClientError) -> String {
    format!(
        "{}\nSign in again and set PARLEY_TOKEN (or `auth.token` in the config file).",
        err
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_a_message() {
        assert_eq!(
            parse_line("  hello there "),
            Input::Command(Command::Send("hello there".into()))
        );
        assert_eq!(parse_line("   "), Input::Blank);
    }

    #[test]
    fn slash_commands() {
        assert_eq!(parse_line("/new"), Input::Command(Command::NewSession));
        assert_eq!(
            parse_line("/switch  abc "),
            Input::Command(Command::Switch("abc".into()))
        );
        assert_eq!(parse_line("/hide"), Input::Command(Command::SetVisible(false)));
        assert_eq!(parse_line("/quit"), Input::Command(Command::Quit));
        assert_eq!(parse_line("/help"), Input::Help);
    }

    #[test]
    fn attach_splits_reference_from_text() {
        assert_eq!(
            parse_line("/attach files/42 what is in here?"),
            Input::Command(Command::SendWithAttachment {
                content: "what is in here?".into(),
                file_ref: "files/42".into(),
            })
        );
        assert_eq!(
            parse_line("/attach files/42"),
            Input::Command(Command::SendWithAttachment {
                content: String::new(),
                file_ref: "files/42".into(),
            })
        );
    }

    #[test]
    fn bad_commands_are_reported() {
        assert!(matches!(parse_line("/switch"), Input::Invalid(_)));
        assert!(matches!(parse_line("/frobnicate"), Input::Invalid(_)));
    }
}
