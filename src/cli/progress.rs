//! Console status tickets for the linkferry CLI
//!
//! Every job gets one spinner line; its status cards are flattened from
//! markup to plain text and shown as the line's message.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use linkferry::{TicketError, TicketId, TicketSink};
use once_cell::sync::Lazy;
use regex::Regex;

static TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]*>").expect("valid tag regex"));

/// Creates the spinner line used for one ticket
pub fn create_ticket_bar(label: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    let style = ProgressStyle::with_template("{spinner:.green} [{elapsed_precise}] {prefix:.bold} {wide_msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner());
    pb.set_style(style);
    pb.set_prefix(label.to_string());
    pb.enable_steady_tick(Duration::from_millis(120));
    pb
}

/// Status card markup to a single plain line
pub fn plain_text(card: &str) -> String {
    let stripped = TAG.replace_all(card, "");
    let unescaped = stripped
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");
    unescaped
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("  ")
}

/// Final cards stop the spinner
fn is_final(card: &str) -> bool {
    card.starts_with('❌') || card.contains("Upload complete")
}

/// [`TicketSink`] drawing each ticket as a line of a [`MultiProgress`]
pub struct ConsoleTickets {
    multi: MultiProgress,
    bars: Mutex<HashMap<TicketId, ProgressBar>>,
    next: AtomicU64,
}

impl Default for ConsoleTickets {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsoleTickets {
    pub fn new() -> Self {
        Self::with_draw_target(ProgressDrawTarget::stderr())
    }

    pub fn with_draw_target(target: ProgressDrawTarget) -> Self {
        Self {
            multi: MultiProgress::with_draw_target(target),
            bars: Mutex::new(HashMap::new()),
            next: AtomicU64::new(1),
        }
    }

    /// Add a line for a new job
    pub fn open(&self, label: &str) -> TicketId {
        let id = TicketId(format!("console-{}", self.next.fetch_add(1, Ordering::Relaxed)));
        let pb = self.multi.add(create_ticket_bar(label));
        if let Ok(mut bars) = self.bars.lock() {
            bars.insert(id.clone(), pb);
        }
        id
    }

    /// Current text of a ticket
    pub fn message(&self, ticket: &TicketId) -> Option<String> {
        self.bars.lock().ok()?.get(ticket).map(|pb| pb.message())
    }

    /// Stop every spinner, leaving the last messages on screen
    pub fn finish_all(&self) {
        if let Ok(bars) = self.bars.lock() {
            for pb in bars.values().filter(|pb| !pb.is_finished()) {
                pb.finish();
            }
        }
    }
}

#[async_trait]
impl TicketSink for ConsoleTickets {
    async fn update(&self, ticket: &TicketId, text: &str) -> Result<(), TicketError> {
        let bars = self
            .bars
            .lock()
            .map_err(|_| TicketError::Transient("ticket table poisoned".to_string()))?;
        let pb = bars
            .get(ticket)
            .ok_or_else(|| TicketError::Rejected(format!("unknown ticket {ticket}")))?;

        let line = plain_text(text);
        if pb.message() == line {
            return Err(TicketError::NotModified);
        }
        if is_final(text) {
            pb.finish_with_message(line);
        } else {
            pb.set_message(line);
        }
        Ok(())
    }

    async fn post_new(&self, near: &TicketId, text: &str) -> Result<TicketId, TicketError> {
        let label = {
            let bars = self
                .bars
                .lock()
                .map_err(|_| TicketError::Transient("ticket table poisoned".to_string()))?;
            bars.get(near).map(|pb| pb.prefix()).unwrap_or_default()
        };
        let ticket = self.open(&label);
        self.update(&ticket, text).await?;
        Ok(ticket)
    }
}
