//! Output-artifact discovery.
//!
//! The generation service never tells us which file it wrote. We list
//! the output directory before and after the job, take the newest file
//! that appeared, and wait until its size stops changing before reading
//! it. This module only ever reads the output directory.

use std::collections::HashSet;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio::time::Instant;

/// Default artifact extensions.
pub const DEFAULT_EXTENSIONS: &[&str] = &["png"];

/// Errors from artifact discovery.
#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    /// No stable artifact appeared within the allotted time.
    #[error("No stable artifact within {waited:?} (last candidate: {candidate:?})")]
    ArtifactTimeout {
        waited: Duration,
        candidate: Option<PathBuf>,
    },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file is not an image we can read.
    #[error("Undecodable artifact {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

/// A file observed while waiting for it to be fully written.
#[derive(Debug, Clone)]
pub struct ArtifactCandidate {
    pub path: PathBuf,
    /// `(when, size in bytes)` in observation order.
    pub samples: Vec<(Instant, u64)>,
}

impl ArtifactCandidate {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            samples: Vec::new(),
        }
    }

    /// Record the current size. A file that does not exist yet counts as empty.
    pub fn sample(&mut self) -> Result<u64, ArtifactError> {
        let size = match std::fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(source) => {
                return Err(ArtifactError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        self.samples.push((Instant::now(), size));
        Ok(size)
    }

    /// Two consecutive equal, non-zero samples.
    pub fn is_stable(&self) -> bool {
        match self.samples.as_slice() {
            [.., (_, a), (_, b)] => a == b && *a > 0,
            _ => false,
        }
    }
}

/// A located, fully-written artifact.
#[derive(Debug, Clone)]
pub struct LocatedArtifact {
    pub path: PathBuf,
    pub bytes: Vec<u8>,
}

/// Finds new files in the service's output directory.
#[derive(Debug, Clone)]
pub struct ArtifactLocator {
    output_dir: PathBuf,
    extensions: Vec<String>,
}

impl ArtifactLocator {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            extensions: DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
        }
    }

    /// Replace the recognized extensions (compared case-insensitively).
    pub fn with_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extensions = extensions
            .into_iter()
            .map(|e| e.into().to_ascii_lowercase())
            .collect();
        self
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// List artifact files, oldest modification first.
    ///
    /// A missing directory snapshots as empty.
    pub fn snapshot(&self) -> Result<Vec<PathBuf>, ArtifactError> {
        let entries = match std::fs::read_dir(&self.output_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(ArtifactError::Io {
                    path: self.output_dir.clone(),
                    source,
                })
            }
        };

        let mut files: Vec<(SystemTime, PathBuf)> = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if !self.is_artifact(&path) {
                continue;
            }
            let Ok(meta) = entry.metadata() else { continue };
            if !meta.is_file() {
                continue;
            }
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            files.push((modified, path));
        }
        files.sort();
        Ok(files.into_iter().map(|(_, path)| path).collect())
    }

    /// Newest path in `after` that is absent from `before`.
    ///
    /// Both lists are expected in [`snapshot`](Self::snapshot) order.
    pub fn locate(before: &[PathBuf], after: &[PathBuf]) -> Option<PathBuf> {
        let before: HashSet<&PathBuf> = before.iter().collect();
        after.iter().rev().find(|p| !before.contains(p)).cloned()
    }

    /// Wait until `path` has two equal, non-zero size samples taken
    /// `poll_interval` apart, then read it.
    pub async fn await_stable(
        path: &Path,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<Vec<u8>, ArtifactError> {
        let deadline = Instant::now() + timeout;
        let mut candidate = ArtifactCandidate::new(path.to_path_buf());

        loop {
            candidate.sample()?;
            if candidate.is_stable() {
                return read_file(path);
            }
            if Instant::now() + poll_interval > deadline {
                return Err(ArtifactError::ArtifactTimeout {
                    waited: timeout,
                    candidate: Some(candidate.path),
                });
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Poll the output directory until a file not in `before` appears and
    /// becomes stable. One `timeout` bounds the whole wait.
    pub async fn await_artifact(
        &self,
        before: &[PathBuf],
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<LocatedArtifact, ArtifactError> {
        let deadline = Instant::now() + timeout;

        loop {
            let after = self.snapshot()?;
            if let Some(path) = Self::locate(before, &after) {
                let remaining = deadline.saturating_duration_since(Instant::now());
                tracing::debug!(path = %path.display(), "New artifact found, waiting for it to settle");
                let bytes = Self::await_stable(&path, remaining, poll_interval)
                    .await
                    .map_err(|e| match e {
                        ArtifactError::ArtifactTimeout { candidate, .. } => {
                            ArtifactError::ArtifactTimeout {
                                waited: timeout,
                                candidate,
                            }
                        }
                        other => other,
                    })?;
                return Ok(LocatedArtifact { path, bytes });
            }
            if Instant::now() + poll_interval > deadline {
                return Err(ArtifactError::ArtifactTimeout {
                    waited: timeout,
                    candidate: None,
                });
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    fn is_artifact(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| self.extensions.iter().any(|x| x.eq_ignore_ascii_case(e)))
            .unwrap_or(false)
    }
}

/// Read image dimensions from the header without decoding pixels.
pub fn decode_dimensions(path: &Path, bytes: &[u8]) -> Result<(u32, u32), ArtifactError> {
    let decode = |source| ArtifactError::Decode {
        path: path.to_path_buf(),
        source,
    };
    image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| decode(image::ImageError::IoError(e)))?
        .into_dimensions()
        .map_err(decode)
}

fn read_file(path: &Path) -> Result<Vec<u8>, ArtifactError> {
    std::fs::read(path).map_err(|source| ArtifactError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    /// 1x1 transparent PNG.
    pub(crate) const TINY_PNG: &[u8] = &[
        0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44,
        0x52, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1F,
        0x15, 0xC4, 0x89, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9C, 0x63, 0x00,
        0x01, 0x00, 0x00, 0x05, 0x00, 0x01, 0x0D, 0x0A, 0x2D, 0xB4, 0x00, 0x00, 0x00, 0x00, 0x49,
        0x45, 0x4E, 0x44, 0xAE, 0x42, 0x60, 0x82,
    ];

    const POLL: Duration = Duration::from_millis(20);

    fn p(name: &str) -> PathBuf {
        PathBuf::from(name)
    }

    fn set_mtime(path: &Path, secs: u64) {
        std::fs::File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(secs))
            .unwrap();
    }

    #[test]
    fn locate_identical_snapshots_is_none() {
        let snap = vec![p("a.png"), p("b.png")];
        assert_eq!(ArtifactLocator::locate(&snap, &snap), None);
        assert_eq!(ArtifactLocator::locate(&[], &[]), None);
    }

    #[test]
    fn locate_returns_added_path() {
        let before = vec![p("a.png")];
        let after = vec![p("a.png"), p("b.png")];
        assert_eq!(ArtifactLocator::locate(&before, &after), Some(p("b.png")));
    }

    #[test]
    fn locate_returns_newest_of_several_added() {
        let before = vec![p("a.png")];
        let after = vec![p("c.png"), p("a.png"), p("b.png")];
        assert_eq!(ArtifactLocator::locate(&before, &after), Some(p("b.png")));
    }

    #[test]
    fn locate_ignores_removed_files() {
        let before = vec![p("a.png"), p("b.png")];
        let after = vec![p("a.png")];
        assert_eq!(ArtifactLocator::locate(&before, &after), None);
    }

    #[test]
    fn snapshot_filters_and_orders_by_mtime() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("old.png"), b"1").unwrap();
        std::fs::write(dir.path().join("new.PNG"), b"2").unwrap();
        set_mtime(&dir.path().join("old.png"), 1_000);
        set_mtime(&dir.path().join("new.PNG"), 2_000);
        std::fs::write(dir.path().join("notes.txt"), b"3").unwrap();
        std::fs::create_dir(dir.path().join("sub.png")).unwrap();

        let snap = ArtifactLocator::new(dir.path()).snapshot().unwrap();
        let names: Vec<_> = snap
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["old.png", "new.PNG"]);
    }

    #[test]
    fn snapshot_of_missing_dir_is_empty() {
        let locator = ArtifactLocator::new("/no/such/output/dir");
        assert!(locator.snapshot().unwrap().is_empty());
    }

    #[test]
    fn custom_extensions() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.webp"), b"1").unwrap();
        std::fs::write(dir.path().join("b.png"), b"1").unwrap();
        let snap = ArtifactLocator::new(dir.path())
            .with_extensions(["WEBP"])
            .snapshot()
            .unwrap();
        assert_eq!(snap, vec![dir.path().join("a.webp")]);
    }

    #[test]
    fn candidate_stability_rules() {
        let mut c = ArtifactCandidate::new(p("x.png"));
        let now = Instant::now();
        c.samples.push((now, 10));
        assert!(!c.is_stable());
        c.samples.push((now, 20));
        assert!(!c.is_stable());
        c.samples.push((now, 20));
        assert!(c.is_stable());

        let mut empty = ArtifactCandidate::new(p("y.png"));
        empty.samples.push((now, 0));
        empty.samples.push((now, 0));
        assert!(!empty.is_stable());
    }

    #[tokio::test]
    async fn await_stable_reads_settled_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.png");
        std::fs::write(&path, TINY_PNG).unwrap();

        let bytes = ArtifactLocator::await_stable(&path, Duration::from_secs(2), POLL)
            .await
            .unwrap();
        assert_eq!(bytes, TINY_PNG);
    }

    #[tokio::test]
    async fn await_stable_times_out_on_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.png");
        std::fs::write(&path, b"").unwrap();

        let result = ArtifactLocator::await_stable(&path, Duration::from_millis(100), POLL).await;
        assert_matches!(result, Err(ArtifactError::ArtifactTimeout { candidate: Some(_), .. }));
    }

    #[tokio::test]
    async fn await_artifact_waits_for_new_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("old.png"), TINY_PNG).unwrap();
        let locator = ArtifactLocator::new(dir.path());
        let before = locator.snapshot().unwrap();

        let out = dir.path().join("output_00001_.png");
        let writer = {
            let out = out.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(60)).await;
                std::fs::write(out, TINY_PNG).unwrap();
            })
        };

        let artifact = locator
            .await_artifact(&before, Duration::from_secs(3), POLL)
            .await
            .unwrap();
        writer.await.unwrap();
        assert_eq!(artifact.path, out);
        assert_eq!(artifact.bytes, TINY_PNG);
    }

    #[tokio::test]
    async fn await_artifact_without_new_file_times_out() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("old.png"), TINY_PNG).unwrap();
        let locator = ArtifactLocator::new(dir.path());
        let before = locator.snapshot().unwrap();

        let result = locator
            .await_artifact(&before, Duration::from_millis(100), POLL)
            .await;
        assert_matches!(result, Err(ArtifactError::ArtifactTimeout { candidate: None, .. }));
    }

    #[test]
    fn decode_dimensions_of_png() {
        assert_eq!(decode_dimensions(&p("x.png"), TINY_PNG).unwrap(), (1, 1));
        assert_matches!(
            decode_dimensions(&p("x.png"), b"not an image"),
            Err(ArtifactError::Decode { .. })
        );
    }
}
