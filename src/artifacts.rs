//! Artifact manager — the per-job on-disk tree.
//!
//! Layout under the artifact root:
//!   `<job_id>/inputs/`     staged upload inputs
//!   `<job_id>/outputs/`    pipeline output artifacts
//!   `<job_id>/events.log`  append-only JSON-lines mirror of JobEvents
//!
//! Disk and database are only eventually consistent; listing reads the
//! disk snapshot and sync drift is detected, not prevented.

use std::path::{Component, Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::warn;
use uuid::Uuid;

use crate::error::ArtifactError;

/// An entry in an artifact listing.
#[derive(Debug, Clone, Serialize)]
pub struct ArtifactEntry {
    /// Path relative to the job's outputs directory.
    pub path: String,
    pub size: u64,
}

/// Counts returned by a delete.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct DeleteReport {
    pub removed_files: u64,
}

/// Manages per-job artifact trees under one root directory.
pub struct ArtifactManager {
    root: PathBuf,
}

impl ArtifactManager {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Root of one job's artifact tree.
    pub fn job_root(&self, job_id: Uuid) -> PathBuf {
        self.root.join(job_id.to_string())
    }

    /// Staged-input directory of a job.
    pub fn inputs_dir(&self, job_id: Uuid) -> PathBuf {
        self.job_root(job_id).join("inputs")
    }

    /// Output directory of a job.
    pub fn outputs_dir(&self, job_id: Uuid) -> PathBuf {
        self.job_root(job_id).join("outputs")
    }

    /// Create the job's directory skeleton.
    pub async fn init_job_dirs(&self, job_id: Uuid) -> Result<(), ArtifactError> {
        fs::create_dir_all(self.inputs_dir(job_id)).await?;
        fs::create_dir_all(self.outputs_dir(job_id)).await?;
        Ok(())
    }

    /// Resolve a requested relative path against the job's outputs root.
    ///
    /// Hard security invariant: any resolution escaping the job root is
    /// rejected before touching the filesystem. Absolute paths, parent
    /// components, and path-prefix tricks all fail here.
    pub fn resolve_output(&self, job_id: Uuid, rel: &str) -> Result<PathBuf, ArtifactError> {
        let requested = Path::new(rel);
        if requested.is_absolute() {
            return Err(ArtifactError::PathEscape {
                path: rel.to_string(),
            });
        }

        let mut clean = PathBuf::new();
        for component in requested.components() {
            match component {
                Component::Normal(c) => clean.push(c),
                Component::CurDir => {}
                // ParentDir, RootDir, Prefix all escape
                _ => {
                    return Err(ArtifactError::PathEscape {
                        path: rel.to_string(),
                    });
                }
            }
        }

        if clean.as_os_str().is_empty() {
            return Err(ArtifactError::NotFound {
                path: rel.to_string(),
            });
        }

        Ok(self.outputs_dir(job_id).join(clean))
    }

    /// Read one output artifact, with the traversal guard applied.
    pub async fn read_output(&self, job_id: Uuid, rel: &str) -> Result<Vec<u8>, ArtifactError> {
        let path = self.resolve_output(job_id, rel)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(ArtifactError::NotFound {
                path: rel.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Snapshot of the job's output tree as it exists on disk right now,
    /// independent of what the database believes.
    pub async fn list_outputs(&self, job_id: Uuid) -> Result<Vec<ArtifactEntry>, ArtifactError> {
        let outputs = self.outputs_dir(job_id);
        let files = walk_files(&outputs).await?;
        let mut entries: Vec<ArtifactEntry> = files
            .into_iter()
            .filter_map(|(path, size)| {
                path.strip_prefix(&outputs).ok().map(|rel| ArtifactEntry {
                    path: rel.to_string_lossy().into_owned(),
                    size,
                })
            })
            .collect();
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    /// Delete every output artifact of a job. Returns removal counts; the
    /// caller appends the cleanup event and clears the sync flag.
    pub async fn delete_outputs(&self, job_id: Uuid) -> Result<DeleteReport, ArtifactError> {
        let outputs = self.outputs_dir(job_id);
        let removed_files = walk_files(&outputs).await?.len() as u64;
        match fs::remove_dir_all(&outputs).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        fs::create_dir_all(&outputs).await?;
        Ok(DeleteReport { removed_files })
    }

    /// Check the database's output records against the disk snapshot.
    /// Returns true when every expected path exists.
    pub async fn verify_sync(&self, job_id: Uuid, expected: &[String]) -> bool {
        for rel in expected {
            let Ok(path) = self.resolve_output(job_id, rel) else {
                return false;
            };
            if fs::metadata(&path).await.is_err() {
                return false;
            }
        }
        true
    }

    /// Append one event to the job's on-disk log mirror. Best effort: the
    /// database row is the record of truth, so a mirror failure is logged
    /// and swallowed.
    pub async fn mirror_event(
        &self,
        job_id: Uuid,
        event_type: &str,
        message: &str,
        payload: &serde_json::Value,
    ) {
        let line = serde_json::json!({
            "event_type": event_type,
            "message": message,
            "payload": payload,
            "event_time": Utc::now().to_rfc3339(),
        });
        if let Err(e) = self.append_log_line(job_id, &line.to_string()).await {
            warn!(job_id = %job_id, error = %e, "Failed to mirror event to disk log");
        }
    }

    async fn append_log_line(&self, job_id: Uuid, line: &str) -> std::io::Result<()> {
        let job_root = self.job_root(job_id);
        fs::create_dir_all(&job_root).await?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(job_root.join("events.log"))
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        Ok(())
    }

    /// Read the job's event-log mirror, one JSON value per line. Lines that
    /// fail to parse are skipped.
    pub async fn read_event_log(&self, job_id: Uuid) -> Vec<serde_json::Value> {
        let path = self.job_root(job_id).join("events.log");
        let Ok(content) = fs::read_to_string(&path).await else {
            return Vec::new();
        };
        content
            .lines()
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect()
    }

    /// Job ids that have an artifact tree on disk.
    pub async fn list_job_dirs(&self) -> Vec<Uuid> {
        let Ok(mut rd) = fs::read_dir(&self.root).await else {
            return Vec::new();
        };
        let mut ids = Vec::new();
        while let Ok(Some(entry)) = rd.next_entry().await {
            let name = entry.file_name();
            if let Some(name) = name.to_str()
                && let Ok(id) = Uuid::parse_str(name)
            {
                ids.push(id);
            }
        }
        ids
    }
}

/// Collect (path, size) of every file under `dir`, depth first. A missing
/// directory yields an empty list.
async fn walk_files(dir: &Path) -> std::io::Result<Vec<(PathBuf, u64)>> {
    let mut out = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let mut rd = match fs::read_dir(&current).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        while let Some(entry) = rd.next_entry().await? {
            let meta = entry.metadata().await?;
            if meta.is_dir() {
                stack.push(entry.path());
            } else {
                out.push((entry.path(), meta.len()));
            }
        }
    }
    Ok(out)
}
