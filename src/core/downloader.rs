//! Resumable download engine
//!
//! Streams a resolved target into `<name>.part` inside the download
//! directory, resuming from whatever a previous attempt left behind, and
//! renames the artifact to its final name once the transfer is complete.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, RANGE, REFERER};
use reqwest::{Client, StatusCode};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::core::config::TransferConfig;
use crate::core::error::{Error, Result};
use crate::core::partial::{classify_response, unsatisfied_range_total, RangeReply};
use crate::core::progress::Stage;
use crate::core::resolver::ResolvedTarget;
use crate::core::stream::{send_with_timeout, ChunkedBody};
use crate::core::transfer::{ProgressSink, RetryBudget, TransferState};

/// Suffix marking an in-progress download
pub const PARTIAL_SUFFIX: &str = ".part";

/// A completed download sitting at its final path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedFile {
    pub path: PathBuf,
    pub file_name: String,
    /// Content type announced by the server, without parameters
    pub mime: Option<String>,
    pub size: u64,
    pub elapsed: Duration,
}

/// Path of the partial artifact belonging to `dest`
pub fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_os_string();
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

/// How one request/response cycle ended
enum Pass {
    /// Every byte is on disk
    Finished,
    /// The artifact was discarded; start over without spending budget
    Restart,
}

/// Drives a single download from first request to rename
pub struct Downloader {
    client: Client,
    config: TransferConfig,
}

impl Downloader {
    pub fn new(client: Client, config: TransferConfig) -> Self {
        Self { client, config }
    }

    /// Download `target` into the configured download directory.
    ///
    /// An existing `.part` file for the same name is the resume point. The
    /// `referer` is sent on every request. Transient faults are retried
    /// against a budget that refills whenever new bytes reach the disk;
    /// cancelling `cancel` deletes the partial artifact and returns
    /// [`Error::Cancelled`].
    pub async fn download(
        &self,
        target: &ResolvedTarget,
        referer: Option<&str>,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<DownloadedFile> {
        fs::create_dir_all(&self.config.download_dir).await?;

        let file_name = target.file_name();
        let dest = self.config.download_dir.join(&file_name);
        let part = partial_path(&dest);

        let offset = match fs::metadata(&part).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };
        if offset > 0 {
            log::info!("⏯️  Resuming {file_name} from {offset} bytes");
        }

        let mut run = ActiveDownload {
            client: &self.client,
            config: &self.config,
            url: &target.url,
            referer,
            part: &part,
            state: TransferState::new(
                Stage::Download,
                offset,
                target.declared_total,
                self.config.progress_interval(),
            ),
            budget: RetryBudget::new(self.config.max_retries, self.config.retry_delay()),
            mime: target.mime_hint.as_deref().map(strip_parameters),
            progress,
            cancel,
        };

        match run.drive().await {
            Ok(()) => {}
            Err(Error::Cancelled) => {
                discard(&part).await;
                return Err(Error::Cancelled);
            }
            Err(e) => return Err(e),
        }

        fs::rename(&part, &dest).await?;
        log::info!("✅ Downloaded {file_name} ({} bytes)", run.state.done());

        Ok(DownloadedFile {
            path: dest,
            file_name,
            mime: run.mime,
            size: run.state.done(),
            elapsed: run.state.elapsed(),
        })
    }
}

struct ActiveDownload<'a> {
    client: &'a Client,
    config: &'a TransferConfig,
    url: &'a str,
    referer: Option<&'a str>,
    part: &'a Path,
    state: TransferState,
    budget: RetryBudget,
    mime: Option<String>,
    progress: &'a dyn ProgressSink,
    cancel: &'a CancellationToken,
}

impl ActiveDownload<'_> {
    async fn drive(&mut self) -> Result<()> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            match self.pass().await {
                Ok(Pass::Finished) => return Ok(()),
                Ok(Pass::Restart) => continue,
                Err(e) if e.is_transient() => {
                    if !self.budget.try_consume() {
                        log::error!(
                            "❌ Giving up on {} after {} retries: {e}",
                            self.url,
                            self.budget.attempts_used()
                        );
                        return Err(e);
                    }
                    log::warn!(
                        "⚠️  {e} at {} bytes (retry {}/{}), retrying in {}ms...",
                        self.state.done(),
                        self.budget.attempts_used(),
                        self.config.max_retries,
                        self.budget.delay().as_millis()
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                        _ = tokio::time::sleep(self.budget.delay()) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One request and as much of its body as the connection delivers
    async fn pass(&mut self) -> Result<Pass> {
        let offset = self.state.done();

        let mut request = self.client.get(self.url);
        if let Some(referer) = self.referer {
            request = request.header(REFERER, referer);
        }
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={offset}-"));
        }
        log::debug!("GET {} from offset {offset}", self.url);

        let response = tokio::select! {
            _ = self.cancel.cancelled() => return Err(Error::Cancelled),
            response = send_with_timeout(request, self.config.read_timeout()) => response?,
        };

        if offset > 0 && response.status() == StatusCode::RANGE_NOT_SATISFIABLE {
            let total = unsatisfied_range_total(&response).unwrap_or(self.state.total());
            if total > 0 && offset == total {
                self.state.set_total(total);
                return Ok(Pass::Finished);
            }
            log::warn!("⚠️  Partial artifact ({offset} bytes) does not fit the remote file, restarting");
            self.truncate(0).await?;
            self.state.restart();
            return Ok(Pass::Restart);
        }

        match classify_response(&response)? {
            RangeReply::Full => {
                if offset > 0 {
                    log::warn!("⚠️  Server ignored the range request, restarting from zero");
                    self.state.restart();
                }
                // a full response declares the whole size
                if let Some(len) = response
                    .headers()
                    .get(CONTENT_LENGTH)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                {
                    self.state.set_total(len);
                }
            }
            RangeReply::Partial(range) => {
                if range.start > offset {
                    return Err(Error::InvalidResponse(format!(
                        "asked for bytes from {offset}, server sent from {}",
                        range.start
                    )));
                }
                if range.start < offset {
                    log::debug!("Server resumes at {} instead of {offset}", range.start);
                    self.state.rewind(range.start);
                }
                if let Some(total) = range.total {
                    self.state.set_total(total);
                }
            }
        }

        if self.mime.is_none() {
            self.mime = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(strip_parameters);
        }

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(self.part)
            .await?;
        file.set_len(self.state.done()).await?;
        file.seek(SeekFrom::Start(self.state.done())).await?;

        let mut body = ChunkedBody::new(
            response,
            self.config.download_chunk_size,
            self.config.read_timeout(),
        );

        loop {
            let chunk = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                chunk = body.next_chunk() => chunk?,
            };

            let Some(chunk) = chunk else {
                file.flush().await?;
                if self.state.total() > 0 && !self.state.is_complete() {
                    return Err(Error::NetworkError(format!(
                        "connection closed after {} of {} bytes",
                        self.state.done(),
                        self.state.total()
                    )));
                }
                return Ok(Pass::Finished);
            };

            file.write_all(&chunk).await?;
            file.flush().await?;
            if !chunk.is_empty() {
                self.state.advance(chunk.len() as u64);
                self.budget.replenish();
            }
            self.state.report(self.progress);

            if self.state.is_complete() {
                return Ok(Pass::Finished);
            }
        }
    }

    async fn truncate(&self, len: u64) -> Result<()> {
        if fs::metadata(self.part).await.is_ok() {
            let file = OpenOptions::new().write(true).open(self.part).await?;
            file.set_len(len).await?;
        }
        Ok(())
    }
}

/// `video/mp4; codecs=...` -> `video/mp4`
fn strip_parameters(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or(content_type)
        .trim()
        .to_ascii_lowercase()
}

/// Remove a partial artifact, tolerating its absence
async fn discard(part: &Path) {
    match fs::remove_file(part).await {
        Ok(()) => log::debug!("Deleted partial artifact {}", part.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => log::warn!("⚠️  Could not delete {}: {e}", part.display()),
    }
}
