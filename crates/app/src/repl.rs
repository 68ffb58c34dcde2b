use std::num::ParseIntError;
use std::sync::Arc;

use granny_session::{Identity, NoticeLevel, SessionError, SessionEvent, SessionStore};
use granny_storage::{ChatId, ChatRecord, MessageRecord};
use snafu::{OptionExt, ResultExt, Snafu, ensure};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{AppResult, ReadInputSnafu, WriteOutputSnafu};
use crate::settings::SettingsStore;

pub const HELP: &str = "\
commands:
  /new                 start a new chat
  /chats               list your chats
  /select <n>          open chat number n
  /search <text>       find chats by title
  /login <id>          sign in
  /logout              sign out
  /attach <ref> <text> send a message with an attachment
  /help                show this help
  /quit                leave
anything else is sent as a message";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Empty,
    NewChat,
    ListChats,
    /// One-based position in the chat list.
    Select(usize),
    Search(String),
    Login(String),
    Logout,
    Attach { reference: String, content: String },
    Help,
    Quit,
    Send(String),
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CommandError {
    #[snafu(display("unknown command `{command}`, try /help"))]
    UnknownCommand {
        stage: &'static str,
        command: String,
    },
    #[snafu(display("`{command}` needs {argument}"))]
    MissingArgument {
        stage: &'static str,
        command: &'static str,
        argument: &'static str,
    },
    #[snafu(display("`{raw}` is not a chat number"))]
    InvalidIndex {
        stage: &'static str,
        raw: String,
        source: ParseIntError,
    },
}

impl Command {
    pub fn parse(line: &str) -> Result<Self, CommandError> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(Self::Empty);
        }
        let Some(rest) = line.strip_prefix('/') else {
            return Ok(Self::Send(line.to_string()));
        };

        let (name, argument) = match rest.split_once(char::is_whitespace) {
            Some((name, argument)) => (name, argument.trim()),
            None => (rest, ""),
        };

        match name {
            "new" => Ok(Self::NewChat),
            "chats" => Ok(Self::ListChats),
            "select" => {
                ensure!(
                    !argument.is_empty(),
                    MissingArgumentSnafu {
                        stage: "parse-select",
                        command: "/select",
                        argument: "a chat number",
                    }
                );
                let index = argument.parse::<usize>().context(InvalidIndexSnafu {
                    stage: "parse-select",
                    raw: argument.to_string(),
                })?;
                Ok(Self::Select(index))
            }
            "search" => Ok(Self::Search(argument.to_string())),
            "login" => {
                ensure!(
                    !argument.is_empty(),
                    MissingArgumentSnafu {
                        stage: "parse-login",
                        command: "/login",
                        argument: "a user id",
                    }
                );
                Ok(Self::Login(argument.to_string()))
            }
            "logout" => Ok(Self::Logout),
            "attach" => {
                let (reference, content) =
                    argument
                        .split_once(char::is_whitespace)
                        .context(MissingArgumentSnafu {
                            stage: "parse-attach",
                            command: "/attach",
                            argument: "a reference and a message",
                        })?;
                Ok(Self::Attach {
                    reference: reference.to_string(),
                    content: content.trim().to_string(),
                })
            }
            "help" => Ok(Self::Help),
            "quit" | "exit" => Ok(Self::Quit),
            other => UnknownCommandSnafu {
                stage: "parse-command",
                command: other.to_string(),
            }
            .fail(),
        }
    }
}

/// Terminal line for events the user should see as they happen.
pub fn render_event(event: &SessionEvent) -> Option<String> {
    match event {
        SessionEvent::Notice(notice) => Some(match notice.level {
            NoticeLevel::Error => format!("! {}: {}", notice.title, notice.description),
            NoticeLevel::Info => format!("* {}: {}", notice.title, notice.description),
        }),
        SessionEvent::MessageAppended(message) if !message.author.is_user() => {
            Some(render_message(message))
        }
        _ => None,
    }
}

pub struct Repl {
    session: SessionStore,
    settings: Arc<SettingsStore>,
}

impl Repl {
    pub fn new(session: SessionStore, settings: Arc<SettingsStore>) -> Self {
        Self { session, settings }
    }

    /// Reads commands until `/quit` or end of input.
    pub async fn run<R, W>(&self, input: R, output: &mut W) -> AppResult<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = input.lines();
        while let Some(line) = lines.next_line().await.context(ReadInputSnafu {
            stage: "read-command",
        })? {
            let command = match Command::parse(&line) {
                Ok(Command::Quit) => break,
                Ok(command) => command,
                Err(error) => {
                    write_line(output, &error.to_string()).await?;
                    continue;
                }
            };

            let text = self.execute(command).await?;
            if !text.is_empty() {
                write_line(output, &text).await?;
            }
        }

        output.flush().await.context(WriteOutputSnafu {
            stage: "flush-output",
        })
    }

    /// Runs one command and returns what to show the user.
    pub async fn execute(&self, command: Command) -> AppResult<String> {
        let text = match command {
            Command::Empty | Command::Quit => String::new(),
            Command::Help => HELP.to_string(),
            Command::NewChat => match self.session.create_chat().await {
                Ok(chat) => format!("started \"{}\"", chat.title),
                Err(error) => describe_error(&error),
            },
            Command::ListChats => {
                let snapshot = self.session.snapshot();
                render_chat_list(&snapshot.chats, snapshot.selected_chat_id(), |_| true)
            }
            Command::Search(query) => {
                let snapshot = self.session.snapshot();
                let matches = self
                    .session
                    .search_chats(&query)
                    .into_iter()
                    .map(|chat| chat.id)
                    .collect::<Vec<_>>();
                render_chat_list(&snapshot.chats, snapshot.selected_chat_id(), |chat| {
                    matches.contains(&chat.id)
                })
            }
            Command::Select(number) => {
                let chats = self.session.chats();
                match number.checked_sub(1).and_then(|index| chats.get(index)) {
                    Some(chat) => match self.session.select_chat(chat).await {
                        Ok(messages) => render_transcript(chat, &messages),
                        Err(error) => describe_error(&error),
                    },
                    None => format!("no chat number {number}, see /chats"),
                }
            }
            Command::Login(user_id) => {
                let identity = Identity::new(user_id.clone());
                let outcome = match self.session.react_to_identity_change(Some(identity)).await {
                    Ok(()) => format!(
                        "signed in as {user_id} ({} chats)",
                        self.session.chats().len()
                    ),
                    Err(error) => describe_error(&error),
                };
                with_warning(self.remember_user(Some(user_id)), outcome)
            }
            Command::Logout => {
                let outcome = match self.session.react_to_identity_change(None).await {
                    Ok(()) => "signed out".to_string(),
                    Err(error) => describe_error(&error),
                };
                with_warning(self.remember_user(None), outcome)
            }
            Command::Attach { reference, content } => self.submit(&content, Some(reference)).await,
            Command::Send(content) => self.submit(&content, None).await,
        };
        Ok(text)
    }

    async fn submit(&self, content: &str, attachment_ref: Option<String>) -> String {
        match self.session.submit(content, attachment_ref).await {
            Ok(_) => String::new(),
            Err(error) => describe_error(&error),
        }
    }

    /// Saves the user id for the next start. Failures are reported, never fatal.
    fn remember_user(&self, user_id: Option<String>) -> Option<String> {
        match self.settings.remember_user(user_id) {
            Ok(_) => None,
            Err(error) => {
                tracing::warn!(%error, "failed to remember signed-in user");
                Some(format!("could not save settings: {error}"))
            }
        }
    }
}

fn with_warning(warning: Option<String>, text: String) -> String {
    match warning {
        Some(warning) if text.is_empty() => warning,
        Some(warning) => format!("{warning}\n{text}"),
        None => text,
    }
}

fn describe_error(error: &SessionError) -> String {
    match error {
        SessionError::Unauthenticated { .. } => "sign in first with /login <id>".to_string(),
        SessionError::NoChatSelected { .. } => {
            "pick a chat with /select <n> or start one with /new".to_string()
        }
        SessionError::EmptyContent { .. } => "nothing to send".to_string(),
        SessionError::UnknownChat { .. } => "that chat is not in your list".to_string(),
        // Remote failures already surfaced as notices.
        SessionError::RemoteUnavailable { .. } | SessionError::Superseded { .. } => String::new(),
    }
}

fn render_chat_list<F>(chats: &[ChatRecord], selected: Option<ChatId>, mut include: F) -> String
where
    F: FnMut(&ChatRecord) -> bool,
{
    let lines = chats
        .iter()
        .enumerate()
        .filter(|(_, chat)| include(chat))
        .map(|(index, chat)| {
            let marker = if selected == Some(chat.id) { '*' } else { ' ' };
            format!("{marker}{:>3}. {}", index + 1, chat.title)
        })
        .collect::<Vec<_>>();

    if lines.is_empty() {
        if chats.is_empty() {
            "no chats yet, start one with /new".to_string()
        } else {
            "no matching chats".to_string()
        }
    } else {
        lines.join("\n")
    }
}

fn render_transcript(chat: &ChatRecord, messages: &[MessageRecord]) -> String {
    let mut lines = vec![format!("== {} ==", chat.title)];
    lines.extend(messages.iter().map(render_message));
    lines.join("\n")
}

fn render_message(message: &MessageRecord) -> String {
    let speaker = if message.author.is_user() {
        "you"
    } else {
        "granny"
    };
    match &message.attachment_ref {
        Some(reference) => format!("{speaker}: {} [attachment: {reference}]", message.content),
        None => format!("{speaker}: {}", message.content),
    }
}

async fn write_line<W>(output: &mut W, text: &str) -> AppResult<()>
where
    W: AsyncWrite + Unpin,
{
    output
        .write_all(format!("{text}\n").as_bytes())
        .await
        .context(WriteOutputSnafu {
            stage: "write-line",
        })
}

#[cfg(test)]
mod tests {
    use granny_session::Notification;
    use granny_storage::{Author, MessageId, OwnerId};

    use super::*;

    #[test]
    fn plain_text_is_sent_trimmed() {
        assert_eq!(
            Command::parse("  my knee hurts  ").expect("parse"),
            Command::Send("my knee hurts".to_string())
        );
        assert_eq!(Command::parse("   ").expect("parse"), Command::Empty);
    }

    #[test]
    fn slash_commands_parse_with_arguments() {
        assert_eq!(Command::parse("/select 3").expect("parse"), Command::Select(3));
        assert_eq!(
            Command::parse("/search  knee pain ").expect("parse"),
            Command::Search("knee pain".to_string())
        );
        assert_eq!(
            Command::parse("/login alice").expect("parse"),
            Command::Login("alice".to_string())
        );
        assert_eq!(
            Command::parse("/attach uploads/x.jpg look at this").expect("parse"),
            Command::Attach {
                reference: "uploads/x.jpg".to_string(),
                content: "look at this".to_string(),
            }
        );
        assert_eq!(Command::parse("/exit").expect("parse"), Command::Quit);
    }

    #[test]
    fn malformed_commands_are_rejected() {
        assert!(matches!(
            Command::parse("/select two"),
            Err(CommandError::InvalidIndex { .. })
        ));
        assert!(matches!(
            Command::parse("/select"),
            Err(CommandError::MissingArgument { command: "/select", .. })
        ));
        assert!(matches!(
            Command::parse("/attach onlyref"),
            Err(CommandError::MissingArgument { command: "/attach", .. })
        ));
        assert!(matches!(
            Command::parse("/dance"),
            Err(CommandError::UnknownCommand { .. })
        ));
    }

    #[test]
    fn only_notices_and_replies_are_rendered_live() {
        let reply = MessageRecord {
            id: MessageId::new_v7(),
            chat_id: ChatId::new_v7(),
            content: "noted".to_string(),
            author: Author::Respondent,
            attachment_ref: None,
            created_at_unix_millis: 1,
        };
        let own = MessageRecord {
            author: Author::User,
            ..reply.clone()
        };

        assert_eq!(
            render_event(&SessionEvent::MessageAppended(reply)).as_deref(),
            Some("granny: noted")
        );
        assert_eq!(render_event(&SessionEvent::MessageAppended(own)), None);
        assert_eq!(
            render_event(&SessionEvent::Notice(Notification::error("Failed to load chats")))
                .as_deref(),
            Some("! Error: Failed to load chats")
        );
        assert_eq!(render_event(&SessionEvent::ChatsReplaced), None);
    }

    #[test]
    fn chat_list_marks_the_selection_and_keeps_positions() {
        let chat = |title: &str| ChatRecord {
            id: ChatId::new_v7(),
            owner_id: OwnerId::new("alice"),
            title: title.to_string(),
            created_at_unix_millis: 1,
            updated_at_unix_millis: 1,
        };
        let chats = vec![chat("first"), chat("second")];

        let rendered = render_chat_list(&chats, Some(chats[1].id), |chat| chat.title == "second");
        assert_eq!(rendered, "*  2. second");
        assert_eq!(
            render_chat_list(&[], None, |_| true),
            "no chats yet, start one with /new"
        );
    }
}
