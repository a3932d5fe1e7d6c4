//! The per-job transfer pipeline
//!
//! session check → resolve (URL jobs) → download → upload → final card.
//! [`TransferPipeline`] is the [`JobHandler`] the queue runs in production.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use crate::core::config::TransferConfig;
use crate::core::destination::{Destination, UploadRequest};
use crate::core::downloader::{DownloadedFile, Downloader};
use crate::core::error::{Error, Result};
use crate::core::job::{Completion, Job, JobFailure, JobId};
use crate::core::progress::{render, render_done, DoneCard, Stage};
use crate::core::queue::JobHandler;
use crate::core::resolver::{ResolvedTarget, Resolver};
use crate::core::source::{sanitize_filename, Source};
use crate::core::stream::build_client;
use crate::core::ticket::{LiveCard, StatusReporter};
use crate::core::uploader::{resolve_mime, UploadedFile, Uploader};

/// Where a chat attachment can be downloaded from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentLocation {
    pub url: String,
    pub file_name: Option<String>,
}

/// Looks up download locations of files hosted by the chat service
#[async_trait]
pub trait AttachmentSource: Send + Sync {
    async fn locate(&self, attachment_id: &str) -> Result<AttachmentLocation>;
}

fn fail(stage: Option<Stage>) -> impl FnOnce(Error) -> JobFailure {
    move |e| JobFailure {
        stage,
        message: e.to_string(),
    }
}

/// Resolver, downloader and uploader wired together for one configuration
pub struct TransferPipeline {
    config: TransferConfig,
    client: Client,
    resolver: Resolver,
    destination: Arc<dyn Destination>,
    attachments: Option<Arc<dyn AttachmentSource>>,
}

impl TransferPipeline {
    pub fn new(config: TransferConfig, destination: Arc<dyn Destination>) -> Result<Self> {
        config.validate()?;
        let client = build_client(&config)?;
        let resolver = Resolver::new(client.clone(), &config);
        Ok(Self {
            config,
            client,
            resolver,
            destination,
            attachments: None,
        })
    }

    pub fn with_attachments(mut self, attachments: Arc<dyn AttachmentSource>) -> Self {
        self.attachments = Some(attachments);
        self
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Find the direct resource behind a job's source
    async fn locate(&self, source: &Source) -> Result<(ResolvedTarget, Option<String>)> {
        match source {
            Source::Url(url) => {
                let target = self.resolver.resolve(url).await?;
                if target.hops > 0 {
                    log::debug!("Resolved {url} to {} in {} hops", target.url, target.hops);
                }
                Ok((target, Some(url.clone())))
            }
            Source::Attachment(id) => {
                let attachments = self.attachments.as_ref().ok_or_else(|| {
                    Error::InvalidInput("attachments are not supported here".to_string())
                })?;
                let location = attachments.locate(id).await?;
                let name = location.file_name.as_deref().map(sanitize_filename);
                Ok((ResolvedTarget::direct(location.url, name), None))
            }
        }
    }

    async fn download(&self, job: &Job, status: &Arc<StatusReporter>) -> Result<DownloadedFile> {
        let (target, referer) = self.locate(&job.source).await?;

        let card = LiveCard::start(status.clone());
        card.push(render(
            Stage::Download,
            0,
            target.declared_total,
            0.0,
            Duration::ZERO,
            None,
        ));
        let result = Downloader::new(self.client.clone(), self.config.clone())
            .download(&target, referer.as_deref(), &card, &job.cancel)
            .await;
        card.finish().await;
        result
    }

    async fn upload(
        &self,
        job: &Job,
        folder: String,
        file: &DownloadedFile,
        status: &Arc<StatusReporter>,
    ) -> Result<UploadedFile> {
        let request = UploadRequest {
            name: file.file_name.clone(),
            parent: folder,
            mime: resolve_mime(&file.path, file.mime.as_deref()),
            total: file.size,
        };

        let card = LiveCard::start(status.clone());
        card.push(render(Stage::Upload, 0, file.size, 0.0, Duration::ZERO, None));
        let result = Uploader::new(self.destination.as_ref(), &self.config)
            .upload(&file.path, request, &card, &job.cancel)
            .await;
        card.finish().await;
        result
    }

    /// Run `job` through every stage, keeping its ticket current
    pub async fn run(
        &self,
        job: &Job,
        status: &Arc<StatusReporter>,
    ) -> std::result::Result<Completion, JobFailure> {
        let folder = self
            .destination
            .prepare(&job.owner)
            .await
            .map_err(fail(None))?;

        let downloaded = self
            .download(job, status)
            .await
            .map_err(fail(Some(Stage::Download)))?;

        status
            .show(&render_done(&DoneCard {
                title: "Download complete",
                file_name: &downloaded.file_name,
                size: downloaded.size,
                download_time: Some(downloaded.elapsed),
                ..Default::default()
            }))
            .await;

        let uploaded = self
            .upload(job, folder, &downloaded, status)
            .await
            .map_err(fail(Some(Stage::Upload)))?;

        let size = uploaded.file.size.unwrap_or(downloaded.size);
        status
            .show(&render_done(&DoneCard {
                title: "Upload complete",
                file_name: &downloaded.file_name,
                size,
                download_time: Some(downloaded.elapsed),
                upload_time: Some(uploaded.elapsed),
                link: uploaded.file.link.as_deref(),
            }))
            .await;

        Ok(Completion {
            file_name: downloaded.file_name,
            size,
            remote: uploaded.file,
        })
    }
}

#[async_trait]
impl JobHandler for TransferPipeline {
    async fn handle(
        &self,
        id: JobId,
        job: Job,
        status: Arc<StatusReporter>,
    ) -> std::result::Result<Completion, JobFailure> {
        log::debug!("Job {id} owned by {}", job.owner);
        self.run(&job, &status).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::destination::LocalFolderStore;
    use crate::core::ticket::{TicketError, TicketId, TicketSink};
    use std::sync::Mutex;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Default)]
    struct Cards(Mutex<Vec<String>>);

    #[async_trait]
    impl TicketSink for Cards {
        async fn update(&self, _ticket: &TicketId, text: &str) -> std::result::Result<(), TicketError> {
            self.0.lock().unwrap().push(text.to_string());
            Ok(())
        }

        async fn post_new(&self, near: &TicketId, _text: &str) -> std::result::Result<TicketId, TicketError> {
            Ok(near.clone())
        }
    }

    struct FixedAttachment(String);

    #[async_trait]
    impl AttachmentSource for FixedAttachment {
        async fn locate(&self, _attachment_id: &str) -> Result<AttachmentLocation> {
            Ok(AttachmentLocation {
                url: self.0.clone(),
                file_name: Some("voice note.ogg".to_string()),
            })
        }
    }

    fn pipeline(dir: &TempDir) -> TransferPipeline {
        let config = TransferConfig {
            download_dir: dir.path().join("downloads"),
            retry_delay_ms: 10,
            ..Default::default()
        };
        let store = Arc::new(LocalFolderStore::new(dir.path().join("drive")));
        TransferPipeline::new(config, store).unwrap()
    }

    fn status(cards: &Arc<Cards>) -> Arc<StatusReporter> {
        Arc::new(StatusReporter::new(cards.clone(), TicketId("t".into()), 4))
    }

    #[tokio::test]
    async fn test_attachment_job_skips_resolution() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/file/abc"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![5u8; 2048]))
            .expect(1)
            .mount(&mock_server)
            .await;

        let dir = TempDir::new().unwrap();
        let pipeline = pipeline(&dir).with_attachments(Arc::new(FixedAttachment(format!(
            "{}/file/abc",
            mock_server.uri()
        ))));
        let cards = Arc::new(Cards::default());
        let job = Job::new(Source::Attachment("abc".into()), "dave", TicketId("t".into()));

        let completion = pipeline.run(&job, &status(&cards)).await.unwrap();

        assert_eq!(completion.file_name, "voice note.ogg");
        assert_eq!(completion.size, 2048);
        let cards = cards.0.lock().unwrap();
        assert!(cards.first().unwrap().starts_with("<b>Downloading File</b>"));
        assert!(cards.iter().any(|c| c.contains("Download complete")));
        assert!(cards.iter().any(|c| c.starts_with("<b>Uploading File</b>")));
        let last = cards.last().unwrap();
        assert!(last.contains("Upload complete"));
        assert!(last.contains("file://"));
    }

    #[tokio::test]
    async fn test_missing_session_fails_before_downloading() {
        let dir = TempDir::new().unwrap();
        let cards = Arc::new(Cards::default());
        let job = Job::new(Source::Url("https://example.invalid/x".into()), " ", TicketId("t".into()));

        let failure = pipeline(&dir).run(&job, &status(&cards)).await.unwrap_err();
        assert_eq!(failure.stage, None);
        assert!(failure.message.contains("connect an account"));
        assert!(cards.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_landing_page_failure_is_a_download_failure() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(b"<html>nothing to see</html>".to_vec(), "text/html"),
            )
            .mount(&mock_server)
            .await;

        let dir = TempDir::new().unwrap();
        let cards = Arc::new(Cards::default());
        let job = Job::new(Source::Url(mock_server.uri()), "erin", TicketId("t".into()));

        let failure = pipeline(&dir).run(&job, &status(&cards)).await.unwrap_err();
        assert_eq!(failure.stage, Some(Stage::Download));
        assert!(failure.message.contains("not a direct file"));
    }
}
