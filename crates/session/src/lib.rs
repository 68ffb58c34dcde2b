#![deny(unsafe_code)]

//! Chat session state: the signed-in user's chats, the selected chat's messages,
//! optimistic sends and the delayed automated replies that follow them.

pub mod dispatcher;
pub mod error;
pub mod events;
pub mod identity;
pub mod responder;
pub mod scheduler;
pub mod settings;
mod state;
pub mod store;

pub use dispatcher::{MessageDispatcher, SendReceipt, title_from_content};
pub use error::{SessionError, SessionResult};
pub use events::{NoticeLevel, Notification, SessionEvent};
pub use identity::Identity;
pub use responder::{CannedResponder, Responder};
pub use scheduler::{ReplyHandle, ReplyKey, ReplyPhase, ReplyProgress, ReplyScheduler};
pub use settings::{SessionSettings, TitlePolicy};
pub use state::SessionSnapshot;
pub use store::SessionStore;
