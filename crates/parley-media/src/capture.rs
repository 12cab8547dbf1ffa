//! Optional raw capture of inbound client audio to disk.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Writes every inbound frame to `<dir>/<unix-millis>-<session>.<ext>` on a
/// background task. Write failures are logged and never reach the caller.
#[derive(Debug)]
pub struct AudioCapture {
    path: PathBuf,
    frames: Option<mpsc::UnboundedSender<Bytes>>,
}

impl AudioCapture {
    pub async fn create(dir: &Path, session_id: &str, extension: &str) -> Result<Self> {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("cannot create capture dir {}", dir.display()))?;
        let name = format!(
            "{}-{session_id}.{extension}",
            chrono::Utc::now().timestamp_millis()
        );
        let path = dir.join(name);
        let mut file = tokio::fs::File::create(&path)
            .await
            .with_context(|| format!("cannot create capture file {}", path.display()))?;

        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
        let task_path = path.clone();
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(e) = file.write_all(&frame).await {
                    warn!(path = %task_path.display(), error = %e, "Audio capture write failed");
                    return;
                }
            }
            if let Err(e) = file.flush().await {
                warn!(path = %task_path.display(), error = %e, "Audio capture flush failed");
            }
            debug!(path = %task_path.display(), "Audio capture closed");
        });

        Ok(Self {
            path,
            frames: Some(tx),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&self, frame: &Bytes) {
        if let Some(tx) = &self.frames {
            let _ = tx.send(frame.clone());
        }
    }

    /// Stop accepting frames; the writer flushes and exits. Idempotent.
    pub fn finish(&mut self) {
        self.frames = None;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_capture_writes_frames_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut capture = AudioCapture::create(dir.path(), "sess-1", "webm").await.unwrap();
        let name = capture.path().file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.ends_with("-sess-1.webm"));

        capture.write(&Bytes::from_static(b"abc"));
        capture.write(&Bytes::from_static(b"def"));
        capture.finish();
        capture.finish();
        capture.write(&Bytes::from_static(b"ignored"));

        let path = capture.path().to_path_buf();
        let mut contents = Vec::new();
        for _ in 0..50 {
            contents = tokio::fs::read(&path).await.unwrap();
            if contents.len() == 6 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(contents, b"abcdef");
    }

    #[tokio::test]
    async fn test_capture_creates_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b");
        let capture = AudioCapture::create(&nested, "s", "pcm").await.unwrap();
        assert!(capture.path().starts_with(&nested));
    }
}
