#![forbid(unsafe_code)]

//! Upload orchestration: URL + title in, catalogue entry out.
//!
//! The order matters. The title is checked and reserved before any download
//! starts, the local MP3 is dropped (and therefore deleted) as soon as the
//! storage upload returns, and a failed insert takes the stored copy back out.

use std::{collections::HashSet, sync::Arc};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::acquire::{AcquireError, Acquirer, AcquisitionRequest};
use crate::error::ErrorKind;
use crate::library::{AudioRecord, Library, LibraryError, NewAudio};
use crate::storage::{MediaStorage, StorageError, public_id_for};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    InvalidInput(String),
    #[error("an audio titled {0:?} already exists")]
    DuplicateTitle(String),
    #[error(transparent)]
    Acquire(#[from] AcquireError),
    #[error("upload failed: {0}")]
    Upload(#[from] StorageError),
    #[error(transparent)]
    Library(#[from] LibraryError),
}

impl ServiceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::DuplicateTitle(_) => ErrorKind::DuplicateTitle,
            Self::Acquire(err) => err.kind(),
            Self::Upload(err) => err.kind(),
            Self::Library(err) => err.kind(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadRequest {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub title: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadResponse {
    pub message: &'static str,
    pub audio: AudioRecord,
}

#[derive(Clone)]
pub struct UploadService {
    acquirer: Acquirer,
    storage: Arc<dyn MediaStorage>,
    library: Library,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl UploadService {
    pub fn new(acquirer: Acquirer, storage: Arc<dyn MediaStorage>, library: Library) -> Self {
        Self {
            acquirer,
            storage,
            library,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn library(&self) -> &Library {
        &self.library
    }

    pub async fn upload(
        &self,
        request: UploadRequest,
        uploader: Option<i64>,
    ) -> Result<AudioRecord, ServiceError> {
        let url = request.url.trim();
        let title = request.title.trim();
        if url.is_empty() || title.is_empty() {
            return Err(ServiceError::InvalidInput(
                "URL and title are required".into(),
            ));
        }

        if self.library.title_exists(title).await? {
            return Err(ServiceError::DuplicateTitle(title.to_string()));
        }
        let _reservation = TitleReservation::claim(&self.in_flight, title)
            .ok_or_else(|| ServiceError::DuplicateTitle(title.to_string()))?;

        let acquisition = self
            .acquirer
            .acquire(&AcquisitionRequest::new(url, title))
            .await?;

        let public_id = public_id_for(title);
        let uploaded = self
            .storage
            .upload(acquisition.local_file_path(), &public_id)
            .await;
        // Deletes the scratch MP3 whether or not the upload worked.
        drop(acquisition);
        let stored = uploaded?;

        let inserted = self
            .library
            .insert_audio(&NewAudio {
                title,
                url: &stored.url,
                source_url: url,
                uploader_id: uploader,
            })
            .await;
        match inserted {
            Ok(record) => {
                info!(id = record.id, title, public_id = %stored.public_id, "audio uploaded");
                Ok(record)
            }
            Err(err) => {
                if let Err(cleanup) = self.storage.remove(&stored.public_id).await {
                    warn!(public_id = %stored.public_id, "failed to remove orphaned upload: {cleanup}");
                }
                Err(err.into())
            }
        }
    }
}

/// Marks a title as being uploaded; released on drop.
struct TitleReservation {
    set: Arc<Mutex<HashSet<String>>>,
    title: String,
}

impl TitleReservation {
    fn claim(set: &Arc<Mutex<HashSet<String>>>, title: &str) -> Option<Self> {
        if !set.lock().insert(title.to_string()) {
            return None;
        }
        Some(Self {
            set: Arc::clone(set),
            title: title.to_string(),
        })
    }
}

impl Drop for TitleReservation {
    fn drop(&mut self) {
        self.set.lock().remove(&self.title);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::acquire::AcquireConfig;
    use crate::error::ToolFailureKind;
    use crate::storage::{LocalMediaStorage, StoredMedia};
    use anyhow::Result;
    use async_trait::async_trait;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};
    use std::{fs, io};
    use tempfile::{TempDir, tempdir};

    /// Fake yt-dlp: counts invocations, then runs `body` with `$target` set to
    /// the mp3 path derived from `--output`.
    fn write_stub(dir: &Path, body: &str) -> PathBuf {
        let script = dir.join("yt-dlp");
        let contents = format!(
            r#"#!/usr/bin/env bash
set -eu
if [[ "${{1:-}}" == "--version" ]]; then
  exit 0
fi
echo run >> "$(dirname "$0")/runs.log"
output=""
while [[ $# -gt 0 ]]; do
  if [[ "$1" == "--output" ]]; then
    shift
    output="$1"
  fi
  shift
done
target="$(printf '%s' "$output" | sed 's/%(ext)s$/mp3/')"
{body}
"#
        );
        fs::write(&script, contents).unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        script
    }

    fn runs(dir: &Path) -> usize {
        fs::read_to_string(dir.join("runs.log"))
            .map(|log| log.lines().count())
            .unwrap_or(0)
    }

    struct Fixture {
        temp: TempDir,
        library: Library,
        acquirer: Acquirer,
    }

    impl Fixture {
        async fn new(stub_body: &str) -> Result<Self> {
            let temp = tempdir()?;
            let script = write_stub(temp.path(), stub_body);
            let mut config = AcquireConfig::new(temp.path().join("scratch"));
            config.binary = Some(script);
            let acquirer = Acquirer::new(config)?;
            let library = Library::open(&temp.path().join("media/library.db")).await?;
            Ok(Self {
                temp,
                library,
                acquirer,
            })
        }

        fn local_storage(&self) -> LocalMediaStorage {
            LocalMediaStorage::new(self.temp.path().join("media"), "http://host")
        }

        fn service(&self, storage: Arc<dyn MediaStorage>) -> UploadService {
            UploadService::new(self.acquirer.clone(), storage, self.library.clone())
        }

        fn scratch_is_empty(&self) -> bool {
            fs::read_dir(self.temp.path().join("scratch"))
                .map(|mut entries| entries.next().is_none())
                .unwrap_or(true)
        }

        fn stored_files(&self) -> usize {
            fs::read_dir(self.temp.path().join("media/yt-audios"))
                .map(|entries| entries.count())
                .unwrap_or(0)
        }
    }

    fn request(url: &str, title: &str) -> UploadRequest {
        UploadRequest {
            url: url.into(),
            title: title.into(),
        }
    }

    /// Records whether the local file existed when storage saw it.
    struct ObservingStorage {
        inner: LocalMediaStorage,
        saw_local_file: Mutex<Option<bool>>,
    }

    #[async_trait]
    impl MediaStorage for ObservingStorage {
        async fn upload(
            &self,
            local_path: &Path,
            public_id: &str,
        ) -> Result<StoredMedia, StorageError> {
            *self.saw_local_file.lock() = Some(local_path.is_file());
            self.inner.upload(local_path, public_id).await
        }

        async fn remove(&self, public_id: &str) -> Result<(), StorageError> {
            self.inner.remove(public_id).await
        }
    }

    struct FailingStorage;

    #[async_trait]
    impl MediaStorage for FailingStorage {
        async fn upload(&self, local_path: &Path, _: &str) -> Result<StoredMedia, StorageError> {
            Err(StorageError::Io {
                operation: "uploading",
                path: local_path.to_path_buf(),
                source: io::Error::other("remote host down"),
            })
        }

        async fn remove(&self, _: &str) -> Result<(), StorageError> {
            Ok(())
        }
    }

    /// Inserts a catalogue row with the same title mid-upload, like a
    /// concurrent writer from another process would.
    struct RacingStorage {
        inner: LocalMediaStorage,
        library: Library,
    }

    #[async_trait]
    impl MediaStorage for RacingStorage {
        async fn upload(
            &self,
            local_path: &Path,
            public_id: &str,
        ) -> Result<StoredMedia, StorageError> {
            self.library
                .insert_audio(&NewAudio {
                    title: "Test",
                    url: "http://elsewhere/test.mp3",
                    source_url: "https://youtu.be/other",
                    uploader_id: None,
                })
                .await
                .map_err(|err| StorageError::Io {
                    operation: "racing insert",
                    path: local_path.to_path_buf(),
                    source: io::Error::other(err.to_string()),
                })?;
            self.inner.upload(local_path, public_id).await
        }

        async fn remove(&self, public_id: &str) -> Result<(), StorageError> {
            self.inner.remove(public_id).await
        }
    }

    #[tokio::test]
    async fn upload_stores_persists_and_cleans_scratch() -> Result<()> {
        let fixture = Fixture::new(r#"printf 'mp3 bytes' > "$target""#).await?;
        let storage = Arc::new(ObservingStorage {
            inner: fixture.local_storage(),
            saw_local_file: Mutex::new(None),
        });
        let service = fixture.service(storage.clone());
        let uploader = fixture
            .library
            .create_user("uploader", "uploader@example.com", "hash")
            .await?;

        let record = service
            .upload(request(" https://youtu.be/VALID ", " Test "), Some(uploader.id))
            .await
            .unwrap_or_else(|err| panic!("upload failed: {err}"));

        assert_eq!(record.title, "Test");
        assert_eq!(record.source_url, "https://youtu.be/VALID");
        assert_eq!(record.uploader_id, Some(uploader.id));
        assert!(record.url.starts_with("http://host/media/yt-audios/Test_"));
        assert_eq!(*storage.saw_local_file.lock(), Some(true));
        assert!(fixture.scratch_is_empty(), "local file removed after upload");
        assert_eq!(fixture.stored_files(), 1);
        assert_eq!(service.library().list_audios().await?, vec![record]);
        Ok(())
    }

    #[tokio::test]
    async fn blank_fields_are_rejected_before_download() -> Result<()> {
        let fixture = Fixture::new(r#"printf 'x' > "$target""#).await?;
        let service = fixture.service(Arc::new(fixture.local_storage()));
        for (url, title) in [("", "Test"), ("https://youtu.be/VALID", "  ")] {
            let err = service.upload(request(url, title), None).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidInput);
        }
        assert_eq!(runs(fixture.temp.path()), 0);
        Ok(())
    }

    #[tokio::test]
    async fn existing_title_short_circuits() -> Result<()> {
        let fixture = Fixture::new(r#"printf 'x' > "$target""#).await?;
        let service = fixture.service(Arc::new(fixture.local_storage()));
        service
            .upload(request("https://youtu.be/first", "Test"), None)
            .await?;

        let err = service
            .upload(request("https://youtu.be/second", "Test"), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DuplicateTitle);
        assert_eq!(runs(fixture.temp.path()), 1);
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_same_title_downloads_once() -> Result<()> {
        let fixture = Fixture::new(
            r#"sleep 0.3
printf 'x' > "$target""#,
        )
        .await?;
        let service = fixture.service(Arc::new(fixture.local_storage()));

        let (a, b) = tokio::join!(
            service.upload(request("https://youtu.be/one", "Same"), None),
            service.upload(request("https://youtu.be/two", "Same"), None)
        );
        let outcomes = [a.is_ok(), b.is_ok()];
        assert_eq!(outcomes.iter().filter(|ok| **ok).count(), 1);
        let err = a.err().or(b.err()).expect("one upload must fail");
        assert_eq!(err.kind(), ErrorKind::DuplicateTitle);
        assert_eq!(runs(fixture.temp.path()), 1);

        // The reservation is released once the winner finishes.
        assert!(service.in_flight.lock().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn acquisition_errors_pass_through() -> Result<()> {
        let fixture = Fixture::new(
            r#"echo "ERROR: [youtube] x: Private video" >&2
exit 1"#,
        )
        .await?;
        let service = fixture.service(Arc::new(fixture.local_storage()));
        let err = service
            .upload(request("https://youtu.be/VALID", "Test"), None)
            .await
            .unwrap_err();
        assert_eq!(
            err.kind(),
            ErrorKind::ExternalToolFailure(ToolFailureKind::SourceUnavailable)
        );

        let err = service
            .upload(request("not-a-url", "Test"), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert_eq!(fixture.library.count_audios().await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn failed_upload_still_deletes_local_file() -> Result<()> {
        let fixture = Fixture::new(r#"printf 'x' > "$target""#).await?;
        let service = fixture.service(Arc::new(FailingStorage));
        let err = service
            .upload(request("https://youtu.be/VALID", "Test"), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UploadFailure);
        assert!(fixture.scratch_is_empty());
        assert_eq!(fixture.library.count_audios().await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn persistence_conflict_removes_stored_media() -> Result<()> {
        let fixture = Fixture::new(r#"printf 'x' > "$target""#).await?;
        let storage = RacingStorage {
            inner: fixture.local_storage(),
            library: fixture.library.clone(),
        };
        let service = fixture.service(Arc::new(storage));

        let err = service
            .upload(request("https://youtu.be/VALID", "Test"), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DuplicateTitle);
        assert_eq!(fixture.stored_files(), 0);
        assert!(fixture.scratch_is_empty());

        let stored = fixture.library.list_audios().await?;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].url, "http://elsewhere/test.mp3");
        Ok(())
    }
}
