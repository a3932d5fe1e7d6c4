//! Destination storage collaborator
//!
//! The upload direction of the engine talks to remote storage through the
//! [`Destination`] trait: a resumable, chunked upload session in the style of
//! cloud drive APIs. [`LocalFolderStore`] implements it on a local directory
//! tree, keeping each session's state on disk so it survives a restart.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use url::Url;

use crate::core::error::{Error, Result};
use crate::core::source::sanitize_filename;

/// Folder created for an owner when none is configured
pub const DEFAULT_FOLDER_NAME: &str = "linkferry uploads";

/// Parameters of a new upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    pub name: String,
    /// Folder identifier returned by [`Destination::prepare`]
    pub parent: String,
    pub mime: String,
    pub total: u64,
}

/// Handle of an open resumable upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSession {
    pub id: String,
    pub total: u64,
}

/// Stored file as described by the destination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFile {
    pub id: String,
    pub name: String,
    pub size: Option<u64>,
    /// Shareable link
    pub link: Option<String>,
}

impl RemoteFile {
    /// Whether both size and link are known
    pub fn is_complete(&self) -> bool {
        self.size.is_some() && self.link.is_some()
    }

    /// Fill the gaps of `self` with what `other` knows
    pub fn merge(self, other: RemoteFile) -> RemoteFile {
        RemoteFile {
            id: self.id,
            name: self.name,
            size: self.size.or(other.size),
            link: self.link.or(other.link),
        }
    }
}

/// Acknowledgement of one uploaded chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkAck {
    /// Bytes the destination has durably committed so far
    InProgress { committed: u64 },
    /// The last chunk was accepted and the file finalized
    Complete(RemoteFile),
}

/// Remote storage that accepts resumable chunked uploads
#[async_trait]
pub trait Destination: Send + Sync {
    /// Check the owner's session and return the folder uploads go to
    async fn prepare(&self, owner: &str) -> Result<String>;

    async fn begin_upload(&self, request: &UploadRequest) -> Result<UploadSession>;

    /// Send `chunk` starting at byte `offset` of the file
    async fn upload_chunk(
        &self,
        session: &UploadSession,
        offset: u64,
        chunk: Bytes,
    ) -> Result<ChunkAck>;

    /// How many bytes of the session the destination already holds
    async fn committed_bytes(&self, session: &UploadSession) -> Result<u64>;

    async fn fetch_metadata(&self, file_id: &str) -> Result<RemoteFile>;

    /// Drop an unfinished session and whatever it stored
    async fn abort(&self, _session: &UploadSession) -> Result<()> {
        Ok(())
    }
}

/// On-disk state of one upload session
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionRecord {
    name: String,
    parent: PathBuf,
    mime: String,
    total: u64,
}

/// A [`Destination`] backed by a local directory.
///
/// Layout under `root`:
/// `<owner>/<folder>/<file>` for finished files and
/// `.sessions/<id>.json` + `.sessions/<id>.data` for open uploads.
#[derive(Debug)]
pub struct LocalFolderStore {
    root: PathBuf,
    folder_name: String,
    next_session: AtomicU64,
}

impl LocalFolderStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_folder(root, DEFAULT_FOLDER_NAME)
    }

    pub fn with_folder(root: impl Into<PathBuf>, folder_name: &str) -> Self {
        Self {
            root: root.into(),
            folder_name: sanitize_filename(folder_name),
            next_session: AtomicU64::new(0),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn sessions_dir(&self) -> PathBuf {
        self.root.join(".sessions")
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.sessions_dir().join(format!("{id}.json"))
    }

    fn data_path(&self, id: &str) -> PathBuf {
        self.sessions_dir().join(format!("{id}.data"))
    }

    fn new_session_id(&self) -> String {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let seq = self.next_session.fetch_add(1, Ordering::Relaxed);
        format!("{nanos:x}-{seq}")
    }

    async fn load_record(&self, id: &str) -> Result<SessionRecord> {
        let raw = fs::read(self.record_path(id)).await.map_err(|e| {
            Error::DestinationError(format!("unknown upload session {id}: {e}"))
        })?;
        serde_json::from_slice(&raw)
            .map_err(|e| Error::DestinationError(format!("corrupt upload session {id}: {e}")))
    }

    /// Resolve a file id (a path relative to the root) without escaping the root
    fn file_path(&self, file_id: &str) -> Result<PathBuf> {
        let relative = Path::new(file_id);
        if relative.is_absolute()
            || relative
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(Error::DestinationError(format!("invalid file id {file_id}")));
        }
        Ok(self.root.join(relative))
    }

    async fn finalize(&self, id: &str, record: SessionRecord) -> Result<RemoteFile> {
        let target = unique_path(&record.parent, &record.name).await;
        fs::rename(self.data_path(id), &target).await?;
        let _ = fs::remove_file(self.record_path(id)).await;

        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or(record.name);
        let file_id = target
            .strip_prefix(&self.root)
            .unwrap_or(&target)
            .to_string_lossy()
            .into_owned();

        log::debug!("Stored {name} as {file_id}");
        // the link is only handed out by fetch_metadata
        Ok(RemoteFile {
            id: file_id,
            name,
            size: Some(record.total),
            link: None,
        })
    }
}

/// `dir/name`, or `dir/name (n).ext` when that is already taken
async fn unique_path(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if fs::metadata(&candidate).await.is_err() {
        return candidate;
    }

    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, format!(".{ext}")),
        _ => (name, String::new()),
    };
    let mut n = 1;
    loop {
        let candidate = dir.join(format!("{stem} ({n}){ext}"));
        if fs::metadata(&candidate).await.is_err() {
            return candidate;
        }
        n += 1;
    }
}

#[async_trait]
impl Destination for LocalFolderStore {
    async fn prepare(&self, owner: &str) -> Result<String> {
        if owner.trim().is_empty() {
            return Err(Error::DestinationError(
                "no storage session for this user, connect an account first".to_string(),
            ));
        }
        let folder = self
            .root
            .join(sanitize_filename(owner))
            .join(&self.folder_name);
        fs::create_dir_all(&folder).await?;
        Ok(folder.to_string_lossy().into_owned())
    }

    async fn begin_upload(&self, request: &UploadRequest) -> Result<UploadSession> {
        let parent = PathBuf::from(&request.parent);
        if !parent.starts_with(&self.root) || fs::metadata(&parent).await.is_err() {
            return Err(Error::DestinationError(format!(
                "folder {} does not exist",
                request.parent
            )));
        }

        fs::create_dir_all(self.sessions_dir()).await?;
        let id = self.new_session_id();
        let record = SessionRecord {
            name: sanitize_filename(&request.name),
            parent,
            mime: request.mime.clone(),
            total: request.total,
        };
        let json = serde_json::to_vec_pretty(&record)
            .map_err(|e| Error::DestinationError(format!("cannot record session: {e}")))?;
        fs::write(self.record_path(&id), json).await?;
        fs::write(self.data_path(&id), b"").await?;

        Ok(UploadSession {
            id,
            total: request.total,
        })
    }

    async fn upload_chunk(
        &self,
        session: &UploadSession,
        offset: u64,
        chunk: Bytes,
    ) -> Result<ChunkAck> {
        let record = self.load_record(&session.id).await?;
        let committed = self.committed_bytes(session).await?;
        if offset > committed {
            return Err(Error::DestinationError(format!(
                "chunk at {offset} leaves a gap after {committed} committed bytes"
            )));
        }
        let end = offset + chunk.len() as u64;
        if end > record.total {
            return Err(Error::DestinationError(format!(
                "chunk ends at {end}, past the declared size {}",
                record.total
            )));
        }

        let mut file = OpenOptions::new()
            .write(true)
            .open(self.data_path(&session.id))
            .await?;
        // a resend overwrites what was already there
        file.set_len(offset).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(&chunk).await?;
        file.sync_data().await?;

        if end == record.total {
            Ok(ChunkAck::Complete(self.finalize(&session.id, record).await?))
        } else {
            Ok(ChunkAck::InProgress { committed: end })
        }
    }

    async fn committed_bytes(&self, session: &UploadSession) -> Result<u64> {
        match fs::metadata(self.data_path(&session.id)).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) => Err(Error::DestinationError(format!(
                "unknown upload session {}: {e}",
                session.id
            ))),
        }
    }

    async fn fetch_metadata(&self, file_id: &str) -> Result<RemoteFile> {
        let path = self.file_path(file_id)?;
        let meta = fs::metadata(&path)
            .await
            .map_err(|e| Error::DestinationError(format!("no file {file_id}: {e}")))?;
        let absolute = fs::canonicalize(&path).await?;

        Ok(RemoteFile {
            id: file_id.to_string(),
            name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            size: Some(meta.len()),
            link: Url::from_file_path(&absolute).ok().map(String::from),
        })
    }

    async fn abort(&self, session: &UploadSession) -> Result<()> {
        let _ = fs::remove_file(self.data_path(&session.id)).await;
        let _ = fs::remove_file(self.record_path(&session.id)).await;
        Ok(())
    }
}
