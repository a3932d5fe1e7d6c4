//! Upload direction of the transfer engine
//!
//! Reads a local file in fixed-size blocks and feeds it to a [`Destination`]
//! session. Progress follows the destination's commit acknowledgements, not
//! the bytes handed over, and transient faults resume from the offset the
//! destination reports as committed.

use std::io::SeekFrom;
use std::path::Path;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::sync::CancellationToken;

use crate::core::config::TransferConfig;
use crate::core::destination::{ChunkAck, Destination, RemoteFile, UploadRequest, UploadSession};
use crate::core::error::{Error, Result};
use crate::core::progress::Stage;
use crate::core::transfer::{ProgressSink, RetryBudget, TransferState};

/// A finished upload with complete metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedFile {
    pub file: RemoteFile,
    pub elapsed: Duration,
}

/// Content type for `path`: the announced one when usable, else a guess
/// from the file extension.
pub fn resolve_mime(path: &Path, announced: Option<&str>) -> String {
    match announced {
        Some(mime) if !mime.is_empty() && mime != "application/octet-stream" => mime.to_string(),
        _ => mime_guess::from_path(path)
            .first_or_octet_stream()
            .essence_str()
            .to_string(),
    }
}

/// Uploads local files to a [`Destination`]
pub struct Uploader<'a> {
    destination: &'a dyn Destination,
    config: &'a TransferConfig,
}

impl<'a> Uploader<'a> {
    pub fn new(destination: &'a dyn Destination, config: &'a TransferConfig) -> Self {
        Self {
            destination,
            config,
        }
    }

    /// Upload the file at `path` as `request.name` into `request.parent`.
    ///
    /// `request.total` is overwritten with the file's size on disk.
    pub async fn upload(
        &self,
        path: &Path,
        mut request: UploadRequest,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<UploadedFile> {
        let mut file = File::open(path).await?;
        request.total = file.metadata().await?.len();

        let mut budget = RetryBudget::new(self.config.max_retries, self.config.retry_delay());
        let session = self.begin(&request, &mut budget, cancel).await?;
        log::debug!("Upload session {} opened for {}", session.id, request.name);

        let mut state = TransferState::new(
            Stage::Upload,
            0,
            request.total,
            self.config.progress_interval(),
        );

        let result = self
            .send_all(&mut file, &session, &mut state, &mut budget, progress, cancel)
            .await;

        let remote = match result {
            Ok(remote) => remote,
            Err(e) => {
                if matches!(e, Error::Cancelled) {
                    if let Err(abort_err) = self.destination.abort(&session).await {
                        log::warn!("⚠️  Could not abort upload session {}: {abort_err}", session.id);
                    }
                }
                return Err(e);
            }
        };

        let remote = if remote.is_complete() {
            remote
        } else {
            log::debug!("Fetching metadata of {}", remote.id);
            let fetched = self.destination.fetch_metadata(&remote.id).await?;
            remote.merge(fetched)
        };

        log::info!("✅ Uploaded {} ({} bytes)", remote.name, request.total);
        Ok(UploadedFile {
            file: remote,
            elapsed: state.elapsed(),
        })
    }

    async fn begin(
        &self,
        request: &UploadRequest,
        budget: &mut RetryBudget,
        cancel: &CancellationToken,
    ) -> Result<UploadSession> {
        loop {
            match self.destination.begin_upload(request).await {
                Ok(session) => return Ok(session),
                Err(e) if e.is_transient() => self.back_off(e, budget, cancel).await?,
                Err(e) => return Err(e),
            }
        }
    }

    async fn send_all(
        &self,
        file: &mut File,
        session: &UploadSession,
        state: &mut TransferState,
        budget: &mut RetryBudget,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<RemoteFile> {
        let mut offset = 0u64;

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let chunk = read_block(file, offset, self.config.upload_chunk_size).await?;
            let sent = chunk.len() as u64;

            let ack = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                ack = self.destination.upload_chunk(session, offset, chunk) => ack,
            };

            match ack {
                Ok(ChunkAck::Complete(remote)) => {
                    state.advance_to(session.total);
                    state.report(progress);
                    return Ok(remote);
                }
                Ok(ChunkAck::InProgress { committed }) => {
                    if committed > offset {
                        budget.replenish();
                    } else if sent > 0 {
                        // a stalled session counts against the budget
                        let stalled = Error::NetworkError(format!(
                            "destination committed nothing of a {sent} byte chunk at {offset}"
                        ));
                        self.back_off(stalled, budget, cancel).await?;
                    }
                    offset = committed;
                    state.advance_to(committed);
                    state.report(progress);
                }
                Err(e) if e.is_transient() => {
                    self.back_off(e, budget, cancel).await?;
                    match self.destination.committed_bytes(session).await {
                        Ok(committed) => {
                            if committed < state.done() {
                                state.rewind(committed);
                            }
                            offset = committed;
                        }
                        Err(e) if e.is_transient() => {
                            log::debug!("Committed offset unknown ({e}), resending from {offset}");
                        }
                        Err(e) => return Err(e),
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Spend one retry and sleep, or give up with `error`
    async fn back_off(
        &self,
        error: Error,
        budget: &mut RetryBudget,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if !budget.try_consume() {
            log::error!("❌ Upload failed after {} retries: {error}", budget.attempts_used());
            return Err(error);
        }
        log::warn!(
            "⚠️  {error} (retry {}/{}), retrying in {}ms...",
            budget.attempts_used(),
            self.config.max_retries,
            budget.delay().as_millis()
        );
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            _ = tokio::time::sleep(budget.delay()) => Ok(()),
        }
    }
}

/// Read up to `size` bytes starting at `offset`; short only at end of file
async fn read_block(file: &mut File, offset: u64, size: usize) -> Result<Bytes> {
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buffer = BytesMut::zeroed(size);
    let mut filled = 0;
    while filled < size {
        let n = file.read(&mut buffer[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buffer.truncate(filled);
    Ok(buffer.freeze())
}
