//! Content-addressed artifact files.
//!
//! Artifacts land under `runs/<runId>/artifacts/<id>-<sanitized-name>`
//! and are never mutated after creation. Writes go through a temp
//! sibling + rename so a crash cannot leave a half-written artifact.

use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;

use ag_domain::error::Result;
use ag_domain::Artifact;

pub struct ArtifactStore {
    data_dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    fn artifacts_dir(&self, run_id: &str) -> PathBuf {
        self.data_dir.join("runs").join(run_id).join("artifacts")
    }

    /// Write an artifact's content and return the record with its
    /// absolute on-disk path filled in.
    pub async fn write(&self, mut artifact: Artifact, content: &[u8]) -> Result<Artifact> {
        let dir = self.artifacts_dir(&artifact.run_id);
        fs::create_dir_all(&dir).await?;

        let file_name = format!("{}-{}", artifact.id, sanitize_name(&artifact.name));
        let path = dir.join(&file_name);
        let tmp = dir.join(format!(".{file_name}.tmp"));

        let mut file = fs::File::create(&tmp).await?;
        file.write_all(content).await?;
        file.flush().await?;
        file.sync_data().await?;
        fs::rename(&tmp, &path).await?;

        artifact.path = path.canonicalize().unwrap_or(path);
        Ok(artifact)
    }

    /// Open an artifact's content for streaming read-back.
    pub async fn open(&self, path: &Path) -> Result<fs::File> {
        Ok(fs::File::open(path).await?)
    }

    /// Read an artifact's content fully (small artifacts: prompts,
    /// diffs).
    pub async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        Ok(fs::read(path).await?)
    }
}

/// Keep artifact file names to a safe charset; everything else becomes
/// a dash.
pub fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '-'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "artifact".into()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ag_domain::ArtifactKind;

    #[test]
    fn sanitize_replaces_unsafe_chars() {
        assert_eq!(sanitize_name("prompt turn 1.md"), "prompt-turn-1.md");
        assert_eq!(sanitize_name("../../etc/passwd"), "..-..-etc-passwd");
        assert_eq!(sanitize_name(""), "artifact");
        assert_eq!(sanitize_name("ok-name_v2.diff"), "ok-name_v2.diff");
    }

    #[tokio::test]
    async fn write_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());

        let artifact = Artifact::new("run_1", "node_1", ArtifactKind::Prompt, "turn 1 prompt.md");
        let written = store.write(artifact, b"the prompt body").await.unwrap();

        assert!(written.path.is_absolute());
        assert!(written
            .path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .ends_with("turn-1-prompt.md"));

        let content = store.read(&written.path).await.unwrap();
        assert_eq!(content, b"the prompt body");
    }

    #[tokio::test]
    async fn empty_diff_artifact_is_valid() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());

        let artifact = Artifact::new("run_1", "node_1", ArtifactKind::Diff, "turn-1.diff");
        let written = store.write(artifact, b"").await.unwrap();
        assert_eq!(store.read(&written.path).await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn artifacts_land_under_run_dir() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());

        let artifact = Artifact::new("run_xyz", "node_1", ArtifactKind::Log, "out.log");
        let written = store.write(artifact, b"line\n").await.unwrap();
        let rendered = written.path.to_string_lossy().replace('\\', "/");
        assert!(rendered.contains("runs/run_xyz/artifacts/"));
    }
}
