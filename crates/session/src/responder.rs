use std::sync::atomic::{AtomicUsize, Ordering};

use futures::FutureExt;
use futures::future::BoxFuture;

/// Produces the automated reply for a user message.
pub trait Responder: Send + Sync {
    fn respond<'a>(&'a self, prompt: &'a str) -> BoxFuture<'a, String>;
}

const DEFAULT_REPLIES: [&str; 4] = [
    "Thanks, I have noted that. Can you tell me when it started?",
    "Understood. Has anything made it better or worse so far?",
    "Got it. Is there anything else you would like me to know?",
    "Thank you for the details. Let's keep an eye on how it develops.",
];

/// Cycles through a fixed list of replies regardless of the prompt.
#[derive(Debug)]
pub struct CannedResponder {
    replies: Vec<String>,
    next: AtomicUsize,
}

impl CannedResponder {
    /// An empty list falls back to the built-in replies.
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let replies = replies.into_iter().map(Into::into).collect::<Vec<_>>();
        if replies.is_empty() {
            return Self::default();
        }

        Self {
            replies,
            next: AtomicUsize::new(0),
        }
    }
}

impl Default for CannedResponder {
    fn default() -> Self {
        Self {
            replies: DEFAULT_REPLIES.iter().map(ToString::to_string).collect(),
            next: AtomicUsize::new(0),
        }
    }
}

impl Responder for CannedResponder {
    fn respond<'a>(&'a self, _prompt: &'a str) -> BoxFuture<'a, String> {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.replies.len();
        let reply = self.replies.get(index).cloned().unwrap_or_default();
        futures::future::ready(reply).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn canned_replies_rotate() {
        let responder = CannedResponder::new(["one", "two"]);
        let replies = vec![
            responder.respond("a").await,
            responder.respond("b").await,
            responder.respond("c").await,
        ];
        assert_eq!(replies, vec!["one", "two", "one"]);
    }

    #[tokio::test]
    async fn empty_reply_list_uses_builtin_replies() {
        let responder = CannedResponder::new(Vec::<String>::new());
        assert_eq!(responder.respond("hello").await, DEFAULT_REPLIES[0]);
    }
}
