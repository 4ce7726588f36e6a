//! On-disk storage for generated audio.
//!
//! Every task owns one directory, `<root>/<task_id>/`, so no two tasks ever
//! touch the same path. Artifacts are published by writing a temporary file
//! and renaming it into place; deletion renames first and unlinks second.
//! A reader that already opened the file keeps a valid handle either way.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::runtime::types::{RuntimeError, TaskId};

const ARTIFACT_STEM: &str = "generated";
const WORK_DIR: &str = "work";
const TRASH_PREFIX: &str = ".trash-";

/// Container format of a generated clip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    Wav,
    Mp3,
}

impl AudioFormat {
    /// Sniff the format from the leading bytes.
    pub fn detect(bytes: &[u8]) -> Option<Self> {
        if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WAVE" {
            return Some(AudioFormat::Wav);
        }
        if bytes.starts_with(b"ID3") {
            return Some(AudioFormat::Mp3);
        }
        // Bare MPEG audio frame sync.
        if bytes.len() >= 2 && bytes[0] == 0xFF && bytes[1] & 0xE0 == 0xE0 {
            return Some(AudioFormat::Mp3);
        }
        None
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "wav" => Some(AudioFormat::Wav),
            "mp3" => Some(AudioFormat::Mp3),
            _ => None,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            AudioFormat::Wav => "wav",
            AudioFormat::Mp3 => "mp3",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            AudioFormat::Wav => "audio/wav",
            AudioFormat::Mp3 => "audio/mpeg",
        }
    }
}

/// Result of a successful [`ArtifactStore::save`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredArtifact {
    pub path: PathBuf,
    pub size: u64,
    pub format: AudioFormat,
}

/// Filesystem-backed artifact storage rooted at one directory.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// Open (creating if needed) the store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, RuntimeError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| RuntimeError::storage(format!("create {}", root.display()), e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory that holds everything belonging to `task_id`.
    pub fn task_dir(&self, task_id: TaskId) -> PathBuf {
        self.root.join(task_id.to_string())
    }

    /// Final artifact path for `task_id` in `format`.
    pub fn artifact_path(&self, task_id: TaskId, format: AudioFormat) -> PathBuf {
        self.task_dir(task_id)
            .join(format!("{ARTIFACT_STEM}.{}", format.extension()))
    }

    /// Scratch directory handed to the inference routine.
    pub fn work_dir(&self, task_id: TaskId) -> PathBuf {
        self.task_dir(task_id).join(WORK_DIR)
    }

    /// Persist `bytes` as the artifact of `task_id`.
    ///
    /// The format is sniffed from the content; unrecognised content is
    /// stored as WAV.
    pub async fn save(&self, task_id: TaskId, bytes: &[u8]) -> Result<StoredArtifact, RuntimeError> {
        let format = AudioFormat::detect(bytes).unwrap_or_else(|| {
            debug!(%task_id, "unrecognised audio header; storing as wav");
            AudioFormat::Wav
        });
        let dir = self.task_dir(task_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| RuntimeError::storage(format!("create {}", dir.display()), e))?;

        let path = self.artifact_path(task_id, format);
        let partial = path.with_extension(format!("{}.partial", format.extension()));
        tokio::fs::write(&partial, bytes)
            .await
            .map_err(|e| RuntimeError::storage(format!("write {}", partial.display()), e))?;
        tokio::fs::rename(&partial, &path)
            .await
            .map_err(|e| RuntimeError::storage(format!("publish {}", path.display()), e))?;

        Ok(StoredArtifact {
            path,
            size: bytes.len() as u64,
            format,
        })
    }

    pub async fn exists(&self, path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    pub async fn size(&self, path: &Path) -> Result<u64, RuntimeError> {
        tokio::fs::metadata(path)
            .await
            .map(|m| m.len())
            .map_err(|e| RuntimeError::storage(format!("stat {}", path.display()), e))
    }

    /// Read a whole artifact. Returns `Ok(None)` when the file is gone.
    ///
    /// The file is opened once and read through that handle, so a concurrent
    /// [`Self::delete`] cannot truncate a read that has already started.
    pub async fn read(&self, path: &Path) -> Result<Option<Bytes>, RuntimeError> {
        let mut file = match tokio::fs::File::open(path).await {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(RuntimeError::storage(format!("open {}", path.display()), e)),
        };
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)
            .await
            .map_err(|e| RuntimeError::storage(format!("read {}", path.display()), e))?;
        Ok(Some(Bytes::from(buf)))
    }

    /// Delete one artifact file. Deleting a missing file is not an error.
    pub async fn delete(&self, path: &Path) -> Result<(), RuntimeError> {
        let doomed = path.with_file_name(format!(
            "{TRASH_PREFIX}{}",
            Uuid::new_v4().simple()
        ));
        match tokio::fs::rename(path, &doomed).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(RuntimeError::storage(format!("unlink {}", path.display()), e)),
        }
        match tokio::fs::remove_file(&doomed).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(RuntimeError::storage(format!("unlink {}", doomed.display()), e)),
        }
    }

    /// Delete everything stored for `task_id`. Idempotent.
    pub async fn delete_task(&self, task_id: TaskId) -> Result<(), RuntimeError> {
        let dir = self.task_dir(task_id);
        let doomed = self
            .root
            .join(format!("{TRASH_PREFIX}{}", Uuid::new_v4().simple()));
        match tokio::fs::rename(&dir, &doomed).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(RuntimeError::storage(format!("remove {}", dir.display()), e))
            }
        }
        match tokio::fs::remove_dir_all(&doomed).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(RuntimeError::storage(format!("remove {}", doomed.display()), e)),
        }
    }

    /// Remove a task's scratch directory, logging rather than failing.
    pub async fn discard_work_dir(&self, task_id: TaskId) {
        let dir = self.work_dir(task_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(%task_id, path = %dir.display(), error = %e, "failed to remove work dir"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wav_bytes(payload: usize) -> Vec<u8> {
        let mut b = Vec::with_capacity(44 + payload);
        b.extend_from_slice(b"RIFF");
        b.extend_from_slice(&((36 + payload) as u32).to_le_bytes());
        b.extend_from_slice(b"WAVE");
        b.extend_from_slice(&[0u8; 32]);
        b.extend(std::iter::repeat(7u8).take(payload));
        b
    }

    #[test]
    fn detects_formats_from_magic_bytes() {
        assert_eq!(AudioFormat::detect(&wav_bytes(0)), Some(AudioFormat::Wav));
        assert_eq!(AudioFormat::detect(b"ID3\x04\x00rest"), Some(AudioFormat::Mp3));
        assert_eq!(AudioFormat::detect(&[0xFF, 0xFB, 0x90, 0x00]), Some(AudioFormat::Mp3));
        assert_eq!(AudioFormat::detect(b"hello"), None);
        assert_eq!(AudioFormat::from_extension("WAV"), Some(AudioFormat::Wav));
    }

    #[tokio::test]
    async fn save_places_artifact_under_task_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(tmp.path().join("out")).await.unwrap();
        let id = TaskId::new();

        let stored = store.save(id, &wav_bytes(100)).await.unwrap();
        assert_eq!(stored.format, AudioFormat::Wav);
        assert_eq!(stored.size, 144);
        assert_eq!(stored.path, store.task_dir(id).join("generated.wav"));
        assert!(store.exists(&stored.path).await);
        assert_eq!(store.size(&stored.path).await.unwrap(), 144);
    }

    #[tokio::test]
    async fn tasks_do_not_share_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(tmp.path()).await.unwrap();
        let a = store.save(TaskId::new(), &wav_bytes(1)).await.unwrap();
        let b = store.save(TaskId::new(), &wav_bytes(2)).await.unwrap();
        assert_ne!(a.path.parent(), b.path.parent());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(tmp.path()).await.unwrap();
        let id = TaskId::new();
        let stored = store.save(id, &wav_bytes(4)).await.unwrap();

        store.delete(&stored.path).await.unwrap();
        assert!(!store.exists(&stored.path).await);
        store.delete(&stored.path).await.expect("second delete is a no-op");
        assert_eq!(store.read(&stored.path).await.unwrap(), None);

        store.delete_task(id).await.unwrap();
        store.delete_task(id).await.expect("missing dir is a no-op");
        assert!(!store.exists(&store.task_dir(id)).await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn open_handle_survives_concurrent_delete() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(tmp.path()).await.unwrap();
        let id = TaskId::new();
        let content = wav_bytes(4096);
        let stored = store.save(id, &content).await.unwrap();

        let mut handle = tokio::fs::File::open(&stored.path).await.unwrap();
        store.delete_task(id).await.unwrap();

        let mut buf = Vec::new();
        handle.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, content);
    }
}
