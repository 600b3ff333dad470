// src/storage/mod.rs
use crate::extractors::classifier::DocumentType;
use crate::extractors::naming::parse_filename;
use crate::utils::error::StorageError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

const PART_SUFFIX: &str = ".part";

/// A stored artifact as seen by a directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactInfo {
    pub filename: String,
    /// Symbol prefix for names this crate generated.
    pub company: Option<String>,
    pub doc_type: Option<DocumentType>,
    pub period: Option<String>,
    pub size_bytes: u64,
    pub modified: DateTime<Utc>,
}

/// Flat output directory holding one file per artifact.
///
/// Writes land in a hidden `.{name}.part` file and are renamed into place,
/// so a file that exists under its final name is always complete.
#[derive(Debug, Clone)]
pub struct StorageManager {
    base_dir: PathBuf,
}

impl StorageManager {
    /// Creates the directory if needed and clears partial files left by an
    /// interrupted run.
    pub fn new<P: AsRef<Path>>(base_dir: P) -> Result<Self, StorageError> {
        let base_path = base_dir.as_ref().to_path_buf();

        if !base_path.exists() {
            fs::create_dir_all(&base_path)?;
            tracing::debug!("Created output directory {}", base_path.display());
        }

        let manager = Self { base_dir: base_path };
        let removed = manager.remove_partials()?;
        if removed > 0 {
            tracing::info!("Removed {} stale partial files from {}", removed, manager.base_dir.display());
        }
        Ok(manager)
    }

    /// Handle to an existing directory without creating or sweeping it, for
    /// listing or clearing while another job may be writing there.
    pub fn open<P: AsRef<Path>>(base_dir: P) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn path_for(&self, filename: &str) -> Result<PathBuf, StorageError> {
        validate_name(filename)?;
        Ok(self.base_dir.join(filename))
    }

    /// Whether a completed artifact with this name exists.
    pub async fn contains(&self, filename: &str) -> Result<bool, StorageError> {
        let path = self.path_for(filename)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Writes `bytes` under `filename`, replacing nothing until the data is
    /// fully on disk. Returns the number of bytes written.
    pub async fn write_artifact(&self, filename: &str, bytes: &[u8]) -> Result<u64, StorageError> {
        let final_path = self.path_for(filename)?;
        let part_path = self.base_dir.join(format!(".{}{}", filename, PART_SUFFIX));

        let result = async {
            let mut file = tokio::fs::File::create(&part_path).await?;
            file.write_all(bytes).await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&part_path, &final_path).await
        }
        .await;

        if let Err(e) = result {
            // Best effort; the next StorageManager::new sweeps leftovers anyway.
            let _ = tokio::fs::remove_file(&part_path).await;
            return Err(e.into());
        }

        tracing::info!("Saved {} ({} bytes)", final_path.display(), bytes.len());
        Ok(bytes.len() as u64)
    }

    /// Completed artifacts, sorted by filename.
    pub fn list(&self) -> Result<Vec<ArtifactInfo>, StorageError> {
        let mut artifacts = Vec::new();

        for entry in fs::read_dir(&self.base_dir)? {
            let entry = entry?;
            let filename = entry.file_name().to_string_lossy().into_owned();
            if filename.starts_with('.') || filename.ends_with(PART_SUFFIX) {
                continue;
            }
            let meta = entry.metadata()?;
            if !meta.is_file() {
                continue;
            }

            let parsed = parse_filename(&filename);
            let modified = meta
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());

            artifacts.push(ArtifactInfo {
                company: parsed.as_ref().map(|p| p.company.clone()),
                doc_type: parsed.as_ref().map(|p| p.doc_type),
                period: parsed.map(|p| p.period),
                filename,
                size_bytes: meta.len(),
                modified,
            });
        }

        artifacts.sort_by(|a, b| a.filename.cmp(&b.filename));
        Ok(artifacts)
    }

    /// Deletes every regular file in the directory. Returns how many were removed.
    pub fn clear(&self) -> Result<usize, StorageError> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.base_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        tracing::info!("Cleared {} files from {}", removed, self.base_dir.display());
        Ok(removed)
    }

    fn remove_partials(&self) -> Result<usize, StorageError> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.base_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') && name.ends_with(PART_SUFFIX) && entry.file_type()?.is_file() {
                fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

fn validate_name(filename: &str) -> Result<(), StorageError> {
    let bad = filename.is_empty()
        || filename.starts_with('.')
        || filename.contains(['/', '\\'])
        || filename.ends_with(PART_SUFFIX);
    if bad {
        return Err(StorageError::InvalidName(filename.to_string()));
    }
    Ok(())
}
