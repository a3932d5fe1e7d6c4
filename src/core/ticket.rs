//! Status tickets
//!
//! A ticket is the message a job's owner watches: it shows the queue
//! position, then live progress, then the outcome. [`StatusReporter`] wraps a
//! [`TicketSink`] with the retry discipline status updates need so that a
//! flaky chat API never fails the transfer behind it.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::core::progress::render;
use crate::core::transfer::{ProgressSample, ProgressSink};

/// Opaque handle of one status message
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TicketId(pub String);

impl fmt::Display for TicketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Why a status update did not go through
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TicketError {
    /// Flood control; wait at least `retry_after`
    RateLimited { retry_after: Duration },
    /// Timeout or connection problem
    Transient(String),
    /// The message already shows this text
    NotModified,
    /// Any other refusal
    Rejected(String),
}

impl fmt::Display for TicketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TicketError::RateLimited { retry_after } => {
                write!(f, "rate limited for {}s", retry_after.as_secs_f64())
            }
            TicketError::Transient(msg) => write!(f, "temporary failure: {msg}"),
            TicketError::NotModified => write!(f, "message is not modified"),
            TicketError::Rejected(msg) => write!(f, "rejected: {msg}"),
        }
    }
}

impl std::error::Error for TicketError {}

/// Where status messages live (a chat, a terminal...)
#[async_trait]
pub trait TicketSink: Send + Sync {
    /// Replace the text of an existing message
    async fn update(&self, ticket: &TicketId, text: &str) -> Result<(), TicketError>;

    /// Post a new message next to `near` and return its handle
    async fn post_new(&self, near: &TicketId, text: &str) -> Result<TicketId, TicketError>;
}

/// Delivers status texts to one ticket, retrying and falling back as needed
pub struct StatusReporter {
    sink: Arc<dyn TicketSink>,
    current: Mutex<TicketId>,
    max_tries: u32,
}

impl StatusReporter {
    pub fn new(sink: Arc<dyn TicketSink>, ticket: TicketId, max_tries: u32) -> Self {
        Self {
            sink,
            current: Mutex::new(ticket),
            max_tries: max_tries.max(1),
        }
    }

    /// The message updates currently go to
    pub fn ticket(&self) -> TicketId {
        match self.current.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn retarget(&self, ticket: TicketId) {
        match self.current.lock() {
            Ok(mut guard) => *guard = ticket,
            Err(poisoned) => *poisoned.into_inner() = ticket,
        }
    }

    /// Show `text` on the ticket. Never fails; returns whether it was shown.
    ///
    /// Edits are attempted up to `max_tries` times. Rate limits wait the
    /// announced time plus half a second, temporary failures wait 1.5 s per
    /// attempt made so far, other refusals half a second. When every edit
    /// failed, the text is posted as a new message which later updates target.
    pub async fn show(&self, text: &str) -> bool {
        let ticket = self.ticket();

        for attempt in 1..=self.max_tries {
            let pause = match self.sink.update(&ticket, text).await {
                Ok(()) | Err(TicketError::NotModified) => return true,
                Err(TicketError::RateLimited { retry_after }) => {
                    retry_after + Duration::from_millis(500)
                }
                Err(TicketError::Transient(msg)) => {
                    log::debug!("Status update of {ticket} failed ({msg}), attempt {attempt}");
                    Duration::from_millis(1500) * attempt
                }
                Err(TicketError::Rejected(msg)) => {
                    log::debug!("Status update of {ticket} rejected: {msg}");
                    Duration::from_millis(500)
                }
            };
            if attempt < self.max_tries {
                tokio::time::sleep(pause).await;
            }
        }

        match self.sink.post_new(&ticket, text).await {
            Ok(replacement) => {
                log::warn!("⚠️  Could not edit {ticket}, continuing on {replacement}");
                self.retarget(replacement);
                true
            }
            Err(e) => {
                log::warn!("⚠️  Status update for {ticket} dropped: {e}");
                false
            }
        }
    }
}

/// Streams progress cards to a ticket without blocking the transfer.
///
/// Samples are rendered and parked in a watch channel; a background task
/// delivers the newest one whenever the previous delivery has finished, so
/// a slow sink only ever skips stale cards.
pub struct LiveCard {
    tx: watch::Sender<Option<String>>,
    task: JoinHandle<()>,
}

impl LiveCard {
    pub fn start(reporter: Arc<StatusReporter>) -> Self {
        let (tx, mut rx) = watch::channel(None::<String>);
        let task = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let text = rx.borrow_and_update().clone();
                if let Some(text) = text {
                    reporter.show(&text).await;
                }
            }
        });
        Self { tx, task }
    }

    /// Queue an arbitrary text, replacing any undelivered card
    pub fn push(&self, text: String) {
        self.tx.send_replace(Some(text));
    }

    /// Deliver the last pending card and stop the background task
    pub async fn finish(self) {
        let LiveCard { tx, task } = self;
        drop(tx);
        if let Err(e) = task.await {
            log::warn!("⚠️  Progress forwarder stopped abnormally: {e}");
        }
    }
}

impl ProgressSink for LiveCard {
    fn on_progress(&self, sample: &ProgressSample) {
        self.push(render(
            sample.stage,
            sample.done,
            sample.total,
            sample.speed,
            sample.elapsed,
            sample.eta,
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::progress::Stage;
    use std::collections::VecDeque;

    /// Replays scripted update results, then succeeds
    #[derive(Default)]
    struct ScriptedSink {
        script: Mutex<VecDeque<Result<(), TicketError>>>,
        fail_posts: bool,
        updates: Mutex<Vec<(TicketId, String)>>,
        posts: Mutex<Vec<String>>,
    }

    impl ScriptedSink {
        fn with_script(script: Vec<Result<(), TicketError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl TicketSink for ScriptedSink {
        async fn update(&self, ticket: &TicketId, text: &str) -> Result<(), TicketError> {
            self.updates
                .lock()
                .unwrap()
                .push((ticket.clone(), text.to_string()));
            self.script.lock().unwrap().pop_front().unwrap_or(Ok(()))
        }

        async fn post_new(&self, _near: &TicketId, text: &str) -> Result<TicketId, TicketError> {
            if self.fail_posts {
                return Err(TicketError::Transient("offline".into()));
            }
            let mut posts = self.posts.lock().unwrap();
            posts.push(text.to_string());
            Ok(TicketId(format!("fallback-{}", posts.len())))
        }
    }

    fn reporter(sink: &Arc<ScriptedSink>) -> StatusReporter {
        StatusReporter::new(sink.clone(), TicketId("t1".into()), 4)
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_waits_retry_after_plus_half_second() {
        let sink = Arc::new(ScriptedSink::with_script(vec![Err(TicketError::RateLimited {
            retry_after: Duration::from_secs(3),
        })]));
        let start = tokio::time::Instant::now();

        assert!(reporter(&sink).show("hello").await);

        assert_eq!(start.elapsed(), Duration::from_millis(3500));
        assert_eq!(sink.updates.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_back_off_linearly() {
        let sink = Arc::new(ScriptedSink::with_script(vec![
            Err(TicketError::Transient("timeout".into())),
            Err(TicketError::Transient("timeout".into())),
        ]));
        let start = tokio::time::Instant::now();

        assert!(reporter(&sink).show("x").await);
        // 1.5s after the first failure, 3s after the second
        assert_eq!(start.elapsed(), Duration::from_millis(4500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_modified_counts_as_delivered() {
        let sink = Arc::new(ScriptedSink::with_script(vec![Err(TicketError::NotModified)]));
        assert!(reporter(&sink).show("same").await);
        assert_eq!(sink.updates.lock().unwrap().len(), 1);
        assert!(sink.posts.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_edits_fall_back_to_a_new_message() {
        let rejected = || Err(TicketError::Rejected("message to edit not found".into()));
        let sink = Arc::new(ScriptedSink::with_script(vec![
            rejected(),
            rejected(),
            rejected(),
            rejected(),
        ]));
        let reporter = reporter(&sink);

        assert!(reporter.show("card").await);
        assert_eq!(sink.updates.lock().unwrap().len(), 4);
        assert_eq!(*sink.posts.lock().unwrap(), vec!["card".to_string()]);
        assert_eq!(reporter.ticket(), TicketId("fallback-1".into()));

        assert!(reporter.show("next").await);
        let updates = sink.updates.lock().unwrap();
        assert_eq!(updates.last().unwrap(), &(TicketId("fallback-1".into()), "next".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_fallback_is_swallowed() {
        let sink = Arc::new(ScriptedSink {
            script: Mutex::new(
                (0..4)
                    .map(|_| Err(TicketError::Transient("down".into())))
                    .collect(),
            ),
            fail_posts: true,
            ..Default::default()
        });

        assert!(!reporter(&sink).show("lost").await);
    }

    #[tokio::test]
    async fn test_live_card_delivers_the_latest_sample() {
        let sink = Arc::new(ScriptedSink::default());
        let card = LiveCard::start(Arc::new(reporter(&sink)));

        for done in [100u64, 200, 300] {
            card.on_progress(&ProgressSample {
                stage: Stage::Download,
                done,
                total: 300,
                speed: 100.0,
                elapsed: Duration::from_secs(1),
                eta: None,
            });
        }
        card.finish().await;

        let updates = sink.updates.lock().unwrap();
        assert!(!updates.is_empty());
        let (_, last) = updates.last().unwrap();
        assert!(last.contains("100.0%"), "last card was {last}");
    }
}
