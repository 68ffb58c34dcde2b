use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use granny_storage::{ChatId, MessageId};
use tokio::sync::watch;
use tokio::task::AbortHandle;

/// One scheduled reply: the chat and the user message that triggered it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReplyKey {
    pub chat_id: ChatId,
    pub message_id: MessageId,
}

/// Lifecycle of an automated reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyPhase {
    Scheduled,
    Persisting,
    /// Stored under the given id.
    Committed(MessageId),
    /// Generation or persistence failed. Never retried.
    Dropped,
    Cancelled,
}

impl ReplyPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed(_) | Self::Dropped | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Persisting => "persisting",
            Self::Committed(_) => "committed",
            Self::Dropped => "dropped",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Write side of a reply's phase, handed to the scheduled job.
#[derive(Debug, Clone)]
pub struct ReplyProgress {
    sender: Arc<watch::Sender<ReplyPhase>>,
}

impl ReplyProgress {
    /// Moves to `phase` unless a terminal phase was already reached.
    pub fn set(&self, phase: ReplyPhase) -> bool {
        self.sender.send_if_modified(|current| {
            if current.is_terminal() || *current == phase {
                return false;
            }
            *current = phase;
            true
        })
    }
}

/// Read side of a reply's phase.
#[derive(Debug, Clone)]
pub struct ReplyHandle {
    key: ReplyKey,
    phase: watch::Receiver<ReplyPhase>,
}

impl ReplyHandle {
    pub fn key(&self) -> ReplyKey {
        self.key
    }

    pub fn phase(&self) -> ReplyPhase {
        *self.phase.borrow()
    }

    /// Waits for a terminal phase. A task torn down without one reads as cancelled.
    pub async fn settled(&self) -> ReplyPhase {
        let mut phase = self.phase.clone();
        match phase.wait_for(ReplyPhase::is_terminal).await {
            Ok(settled) => *settled,
            Err(_) => ReplyPhase::Cancelled,
        }
    }
}

#[derive(Debug)]
struct PendingReply {
    abort: AbortHandle,
    progress: ReplyProgress,
}

/// Runs reply jobs after a fixed delay on the tokio timer, one task per key.
#[derive(Debug, Clone)]
pub struct ReplyScheduler {
    delay: Duration,
    pending: Arc<ArcSwap<HashMap<ReplyKey, Arc<PendingReply>>>>,
}

impl ReplyScheduler {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: Arc::default(),
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Spawns `job` to run once the delay elapses. Its returned phase becomes final.
    ///
    /// Must be called from within a tokio runtime.
    pub fn schedule<F, Fut>(&self, key: ReplyKey, job: F) -> ReplyHandle
    where
        F: FnOnce(ReplyProgress) -> Fut + Send + 'static,
        Fut: Future<Output = ReplyPhase> + Send + 'static,
    {
        let (sender, receiver) = watch::channel(ReplyPhase::Scheduled);
        let progress = ReplyProgress {
            sender: Arc::new(sender),
        };

        let delay = self.delay;
        let pending = Arc::clone(&self.pending);
        let task_progress = progress.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let phase = job(task_progress.clone()).await;
            task_progress.set(phase);
            remove_pending(&pending, key);
            tracing::debug!(
                chat_id = %key.chat_id,
                message_id = %key.message_id,
                phase = phase.as_str(),
                "automated reply settled"
            );
        });

        let entry = Arc::new(PendingReply {
            abort: task.abort_handle(),
            progress,
        });
        self.pending.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.insert(key, Arc::clone(&entry));
            next
        });
        if entry.abort.is_finished() {
            remove_pending(&self.pending, key);
        }

        tracing::debug!(
            chat_id = %key.chat_id,
            message_id = %key.message_id,
            delay_ms = %delay.as_millis(),
            "automated reply scheduled"
        );
        ReplyHandle {
            key,
            phase: receiver,
        }
    }

    pub fn cancel(&self, key: ReplyKey) -> bool {
        match remove_pending(&self.pending, key) {
            Some(entry) => {
                entry.abort.abort();
                entry.progress.set(ReplyPhase::Cancelled);
                tracing::debug!(
                    chat_id = %key.chat_id,
                    message_id = %key.message_id,
                    "automated reply cancelled"
                );
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) -> usize {
        let drained = self.pending.swap(Arc::default());
        for entry in drained.values() {
            entry.abort.abort();
            entry.progress.set(ReplyPhase::Cancelled);
        }
        drained.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending
            .load()
            .values()
            .filter(|entry| !entry.abort.is_finished())
            .count()
    }

    pub fn is_pending(&self, key: ReplyKey) -> bool {
        self.pending
            .load()
            .get(&key)
            .is_some_and(|entry| !entry.abort.is_finished())
    }
}

fn remove_pending(
    pending: &ArcSwap<HashMap<ReplyKey, Arc<PendingReply>>>,
    key: ReplyKey,
) -> Option<Arc<PendingReply>> {
    let mut removed = None;
    pending.rcu(|current| {
        removed = current.get(&key).cloned();
        if removed.is_none() {
            return Arc::clone(current);
        }
        let mut next = HashMap::clone(current);
        next.remove(&key);
        Arc::new(next)
    });
    removed
}
