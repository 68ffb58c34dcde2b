use std::sync::Arc;

use granny_session::{Identity, SessionEvent, SessionStore};
use granny_storage::SqliteStorage;
use snafu::ResultExt;
use tokio::io::BufReader;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::error::{AppResult, OpenStorageSnafu};
use crate::repl::{Repl, render_event};
use crate::settings::SettingsStore;

/// Opens the configured database, signs in and serves stdin until `/quit`.
pub async fn run() -> AppResult<()> {
    let settings = Arc::new(SettingsStore::load());
    let current = settings.settings();

    let storage = SqliteStorage::open(&current.database)
        .await
        .context(OpenStorageSnafu {
            stage: "open-chat-database",
        })?;
    let (session, events) = SessionStore::new(Arc::new(storage), current.session.clone());
    let printer = tokio::spawn(print_events(events));

    let user_id = current
        .user_id
        .clone()
        .or_else(|| std::env::var("USER").ok());
    if let Some(user_id) = user_id {
        if let Err(error) = session
            .react_to_identity_change(Some(Identity::new(user_id)))
            .await
        {
            tracing::warn!("initial sign-in did not load chats: {error}");
        }
    }
    println!("{} chats loaded, /help for commands", session.chats().len());

    let repl = Repl::new(session.clone(), Arc::clone(&settings));
    let mut stdout = tokio::io::stdout();
    let outcome = repl
        .run(BufReader::new(tokio::io::stdin()), &mut stdout)
        .await;

    let cancelled = session.scheduler().cancel_all();
    if cancelled > 0 {
        tracing::info!(cancelled, "dropped pending automated replies on exit");
    }
    printer.abort();
    outcome
}

async fn print_events(mut events: UnboundedReceiver<SessionEvent>) {
    while let Some(event) = events.recv().await {
        if let Some(line) = render_event(&event) {
            println!("{line}");
        }
    }
}
