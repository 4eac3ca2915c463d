#![forbid(unsafe_code)]

//! Durable home for acquired audio.
//!
//! [`MediaStorage`] is the seam the upload service talks to. The only
//! implementation, [`LocalMediaStorage`], keeps files under the media root and
//! hands out URLs that the backend's `/media` route serves.

use std::{
    io,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::error::ErrorKind;

async fn discard_staging(staging: &Path) {
    match tokio::fs::remove_file(staging).await {
        Ok(()) => debug!(path = %staging.display(), "removed staging file"),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %staging.display(), "failed to remove staging file: {err}"),
    }
}

/// Folder every upload lands in, both on disk and in URLs.
pub const MEDIA_FOLDER: &str = "yt-audios";
const MEDIA_EXTENSION: &str = "mp3";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid public id {0:?}")]
    InvalidId(String),
    #[error("{operation} {}: {source}", path.display())]
    Io {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl StorageError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::UploadFailure
    }

    fn io(operation: &'static str, path: &Path, source: io::Error) -> Self {
        Self::Io {
            operation,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Where an upload ended up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredMedia {
    pub public_id: String,
    pub url: String,
    #[serde(skip)]
    pub path: PathBuf,
}

#[async_trait]
pub trait MediaStorage: Send + Sync {
    /// Copies `local_path` into storage under `public_id`. The local file is
    /// left alone; its owner deletes it.
    async fn upload(&self, local_path: &Path, public_id: &str)
    -> Result<StoredMedia, StorageError>;

    /// Deletes a previous upload. Removing something that is already gone is
    /// not an error.
    async fn remove(&self, public_id: &str) -> Result<(), StorageError>;
}

#[derive(Debug, Clone)]
pub struct LocalMediaStorage {
    root: PathBuf,
    public_base_url: String,
}

impl LocalMediaStorage {
    pub fn new(media_root: impl Into<PathBuf>, public_base_url: impl Into<String>) -> Self {
        let public_base_url = public_base_url.into();
        Self {
            root: media_root.into(),
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Directory holding the stored files; the backend serves it.
    pub fn folder(&self) -> PathBuf {
        self.root.join(MEDIA_FOLDER)
    }

    fn file_path(&self, public_id: &str) -> Result<PathBuf, StorageError> {
        if !is_valid_public_id(public_id) {
            return Err(StorageError::InvalidId(public_id.to_string()));
        }
        Ok(self.folder().join(format!("{public_id}.{MEDIA_EXTENSION}")))
    }

    fn url_for(&self, public_id: &str) -> String {
        format!(
            "{}/media/{MEDIA_FOLDER}/{public_id}.{MEDIA_EXTENSION}",
            self.public_base_url
        )
    }
}

#[async_trait]
impl MediaStorage for LocalMediaStorage {
    async fn upload(
        &self,
        local_path: &Path,
        public_id: &str,
    ) -> Result<StoredMedia, StorageError> {
        let destination = self.file_path(public_id)?;
        let folder = self.folder();
        tokio::fs::create_dir_all(&folder)
            .await
            .map_err(|err| StorageError::io("creating media folder", &folder, err))?;

        // Copy under a temporary name so readers never see a half-written file.
        let staging = destination.with_extension(format!("{MEDIA_EXTENSION}.partial"));
        if let Err(err) = tokio::fs::copy(local_path, &staging).await {
            discard_staging(&staging).await;
            return Err(StorageError::io("copying", local_path, err));
        }
        if let Err(err) = tokio::fs::rename(&staging, &destination).await {
            discard_staging(&staging).await;
            return Err(StorageError::io("moving upload into", &destination, err));
        }

        info!(public_id, path = %destination.display(), "stored audio");
        Ok(StoredMedia {
            public_id: public_id.to_string(),
            url: self.url_for(public_id),
            path: destination,
        })
    }

    async fn remove(&self, public_id: &str) -> Result<(), StorageError> {
        let path = self.file_path(public_id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(public_id, "removed stored audio");
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StorageError::io("removing", &path, err)),
        }
    }
}

/// Builds a storage id from a title: whitespace runs become `_`, anything
/// outside `[A-Za-z0-9_-]` is dropped and the current millisecond timestamp
/// is appended.
pub fn public_id_for(title: &str) -> String {
    public_id_with_stamp(title, Utc::now().timestamp_millis())
}

fn public_id_with_stamp(title: &str, millis: i64) -> String {
    let mut slug = String::with_capacity(title.len());
    let mut pending_gap = false;
    for ch in title.trim().chars() {
        if ch.is_whitespace() {
            pending_gap = true;
            continue;
        }
        if !(ch.is_ascii_alphanumeric() || ch == '_' || ch == '-') {
            continue;
        }
        if pending_gap && !slug.is_empty() {
            slug.push('_');
        }
        pending_gap = false;
        slug.push(ch);
    }
    if slug.is_empty() {
        slug.push_str("audio");
    }
    format!("{slug}_{millis}")
}

fn is_valid_public_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-')
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use tempfile::tempdir;

    #[test]
    fn public_ids_are_slugged_and_stamped() {
        assert_eq!(public_id_with_stamp("My Song", 42), "My_Song_42");
        assert_eq!(
            public_id_with_stamp("  lots   of\tspace ", 1),
            "lots_of_space_1"
        );
        assert_eq!(
            public_id_with_stamp("what?! it's \"fine\"", 7),
            "what_its_fine_7"
        );
        assert_eq!(public_id_with_stamp("¿¡!!", 3), "audio_3");
        assert_eq!(public_id_with_stamp("a/../b", 9), "ab_9");
        assert!(is_valid_public_id(&public_id_for("Anything at all")));
    }

    #[tokio::test]
    async fn upload_copies_and_reports_url() -> Result<()> {
        let temp = tempdir()?;
        let source = temp.path().join("scratch.mp3");
        std::fs::write(&source, b"ID3 data")?;
        let storage = LocalMediaStorage::new(temp.path().join("media"), "http://host:5000/");

        let stored = storage.upload(&source, "song_1").await?;

        assert_eq!(stored.public_id, "song_1");
        assert_eq!(stored.url, "http://host:5000/media/yt-audios/song_1.mp3");
        assert_eq!(stored.path, temp.path().join("media/yt-audios/song_1.mp3"));
        assert_eq!(std::fs::read(&stored.path)?, b"ID3 data");
        assert!(source.exists(), "upload leaves the local file to its owner");
        assert!(!stored.path.with_extension("mp3.partial").exists());
        Ok(())
    }

    #[tokio::test]
    async fn upload_of_missing_file_fails() -> Result<()> {
        let temp = tempdir()?;
        let storage = LocalMediaStorage::new(temp.path(), "http://host");
        let err = storage
            .upload(&temp.path().join("ghost.mp3"), "ghost_1")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UploadFailure);
        assert!(!storage.folder().join("ghost_1.mp3").exists());
        assert!(!storage.folder().join("ghost_1.mp3.partial").exists());
        Ok(())
    }

    #[tokio::test]
    async fn failed_rename_discards_staging_file() -> Result<()> {
        let temp = tempdir()?;
        let source = temp.path().join("a.mp3");
        std::fs::write(&source, b"x")?;
        let storage = LocalMediaStorage::new(temp.path(), "http://host");
        let blocker = storage.folder().join("taken_1.mp3");
        std::fs::create_dir_all(blocker.join("occupied"))?;

        let err = storage.upload(&source, "taken_1").await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::UploadFailure);
        assert!(blocker.is_dir());
        assert!(!storage.folder().join("taken_1.mp3.partial").exists());
        Ok(())
    }

    #[tokio::test]
    async fn rejects_ids_that_escape_the_folder() -> Result<()> {
        let temp = tempdir()?;
        let source = temp.path().join("a.mp3");
        std::fs::write(&source, b"x")?;
        let storage = LocalMediaStorage::new(temp.path(), "http://host");
        for id in ["", "../evil", "a/b", "dot.dot"] {
            let err = storage.upload(&source, id).await.unwrap_err();
            assert!(matches!(err, StorageError::InvalidId(_)), "{id}");
        }
        Ok(())
    }

    #[tokio::test]
    async fn remove_is_idempotent() -> Result<()> {
        let temp = tempdir()?;
        let source = temp.path().join("a.mp3");
        std::fs::write(&source, b"x")?;
        let storage = LocalMediaStorage::new(temp.path(), "http://host");
        let stored = storage.upload(&source, "gone_1").await?;

        storage.remove("gone_1").await?;
        assert!(!stored.path.exists());
        storage.remove("gone_1").await?;
        Ok(())
    }
}
