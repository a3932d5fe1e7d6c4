//! # Linkferry Library
//!
//! Takes links (or chat attachments) submitted by users, finds the real file
//! behind them, downloads it with resume support and uploads it to the
//! user's storage, one job at a time, keeping a status message up to date.
//!
//! ## Features
//!
//! - **Landing-page resolution**: follows meta refreshes, script redirects and
//!   download buttons until a non-HTML resource is reached
//! - **Resumable transfers**: `.part` artifacts, range requests, a retry budget
//!   that refills on progress
//! - **Single-worker queue**: strict FIFO, positions, failure isolation
//! - **Throttled status cards**: progress rendered at most once per interval
//!
//! ## Basic Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use linkferry::{Job, LocalFolderStore, Source, TicketId, TransferConfig, TransferPipeline, TransferQueue};
//! # use linkferry::{TicketError, TicketSink};
//! # struct Console;
//! # #[async_trait::async_trait]
//! # impl TicketSink for Console {
//! #     async fn update(&self, _: &TicketId, text: &str) -> Result<(), TicketError> { println!("{text}"); Ok(()) }
//! #     async fn post_new(&self, t: &TicketId, _: &str) -> Result<TicketId, TicketError> { Ok(t.clone()) }
//! # }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = TransferConfig::default();
//!     let store = Arc::new(LocalFolderStore::new("./drive"));
//!     let pipeline = Arc::new(TransferPipeline::new(config, store)?);
//!     let queue = TransferQueue::new(pipeline, Arc::new(Console), 4);
//!
//!     let source = Source::from_text("please fetch https://example.com/file.zip")?;
//!     let submission = queue.enqueue(Job::new(source, "me", TicketId("1".into()))).await;
//!     println!("queued at position {}", submission.position);
//!
//!     let outcome = submission.outcome().await;
//!     println!("{outcome:?}");
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

pub mod core;

pub use crate::core::config::TransferConfig;
pub use crate::core::destination::{
    ChunkAck, Destination, LocalFolderStore, RemoteFile, UploadRequest, UploadSession,
};
pub use crate::core::downloader::DownloadedFile;
pub use crate::core::error::{Error, Result};
pub use crate::core::job::{Completion, Job, JobFailure, JobId, JobOutcome, JobState};
pub use crate::core::pipeline::{AttachmentLocation, AttachmentSource, TransferPipeline};
pub use crate::core::progress::Stage;
pub use crate::core::queue::{JobHandler, QueueEntryView, Submission, TransferQueue};
pub use crate::core::resolver::ResolvedTarget;
pub use crate::core::source::Source;
pub use crate::core::ticket::{StatusReporter, TicketError, TicketId, TicketSink};
pub use crate::core::transfer::{ProgressSample, ProgressSink};

/// Resolve a URL to its direct resource without downloading it
///
/// # Examples
/// ```rust,no_run
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let target = linkferry::resolve("https://example.com/share/page").await?;
/// println!("{} after {} hops", target.url, target.hops);
/// # Ok(())
/// # }
/// ```
pub async fn resolve(url: &str) -> Result<ResolvedTarget> {
    resolve_with_config(url, &TransferConfig::default()).await
}

/// Resolve with a custom configuration
pub async fn resolve_with_config(url: &str, config: &TransferConfig) -> Result<ResolvedTarget> {
    let client = core::stream::build_client(config)?;
    core::Resolver::new(client, config).resolve(url).await
}

/// Build a queue whose jobs run through a [`TransferPipeline`]
pub fn transfer_queue(
    config: TransferConfig,
    destination: Arc<dyn Destination>,
    tickets: Arc<dyn TicketSink>,
) -> Result<TransferQueue> {
    let status_max_tries = config.status_max_tries;
    let pipeline = TransferPipeline::new(config, destination)?;
    Ok(TransferQueue::new(Arc::new(pipeline), tickets, status_max_tries))
}
