//! Versioned model weights on the local filesystem.
//!
//! ```text
//! <root>/active.weights      weights the inference adapter loads
//! <root>/versions/<id>.weights  immutable copy of every version ever active
//! <root>/backups/<id>.weights   snapshots taken before a retrain commit
//! <root>/staging/            scratch space for freshly fine-tuned weights
//! <root>/manifest.json       artifact metadata and the active version id
//! ```
//!
//! `active.weights` and `manifest.json` are only ever replaced by writing a
//! sibling temp file and renaming it over the target, so a crash leaves
//! either the old or the new file, never a partial one.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::models::artifact::{ArtifactSource, ModelArtifact};

const ACTIVE_FILE: &str = "active.weights";
const MANIFEST_FILE: &str = "manifest.json";
const INITIAL_VERSION: &str = "initial";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Manifest {
    active: String,
    artifacts: Vec<ModelArtifact>,
}

impl Manifest {
    fn find(&self, version_id: &str) -> Option<&ModelArtifact> {
        self.artifacts.iter().find(|a| a.version_id == version_id)
    }

    fn unique_id(&self, prefix: &str) -> String {
        let base = format!("{prefix}_{}", Utc::now().format("%Y%m%dT%H%M%S%6f"));
        let mut candidate = base.clone();
        let mut n = 1;
        while self.find(&candidate).is_some() {
            candidate = format!("{base}_{n}");
            n += 1;
        }
        candidate
    }
}

pub struct ArtifactStore {
    root: PathBuf,
    manifest: Mutex<Manifest>,
}

async fn sha256_file(path: &Path) -> Result<String, ArtifactError> {
    let bytes = tokio::fs::read(path).await?;
    Ok(format!("{:x}", Sha256::digest(&bytes)))
}

/// Copy `src` over `dest` via a temp file in `dest`'s directory.
async fn replace_file(src: &Path, dest: &Path) -> Result<(), ArtifactError> {
    let tmp = dest.with_extension(format!("tmp-{}", Uuid::new_v4().simple()));
    tokio::fs::copy(src, &tmp).await?;
    if let Err(e) = tokio::fs::rename(&tmp, dest).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

impl ArtifactStore {
    /// Open the store at `root`, registering `active.weights` as the initial
    /// artifact if no manifest exists yet. An existing store has its active
    /// weights checked against the manifest before it is handed out.
    ///
    /// The manifest is cached for the life of the store, so one process owns
    /// a store root at a time.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, ArtifactError> {
        let root = root.into();
        for dir in ["backups", "versions", "staging"] {
            tokio::fs::create_dir_all(root.join(dir)).await?;
        }

        let manifest_path = root.join(MANIFEST_FILE);
        let manifest = if tokio::fs::try_exists(&manifest_path).await? {
            let raw = tokio::fs::read(&manifest_path).await?;
            let manifest: Manifest = serde_json::from_slice(&raw)?;
            let Some(active) = manifest.find(&manifest.active) else {
                return Err(ArtifactError::UnknownVersion(manifest.active.clone()));
            };
            repair_active(&root, active).await?;
            manifest
        } else {
            let active = root.join(ACTIVE_FILE);
            if !tokio::fs::try_exists(&active).await? {
                return Err(ArtifactError::MissingWeights(active));
            }

            let path = PathBuf::from("versions").join(format!("{INITIAL_VERSION}.weights"));
            tokio::fs::copy(&active, root.join(&path)).await?;
            let initial = ModelArtifact {
                version_id: INITIAL_VERSION.to_string(),
                created_at: Utc::now(),
                source: ArtifactSource::Initial,
                backup_of: None,
                path,
                checksum: sha256_file(&active).await?,
            };
            tracing::info!(root = %root.display(), "Registered initial model artifact");

            let manifest = Manifest {
                active: initial.version_id.clone(),
                artifacts: vec![initial],
            };
            write_manifest(&root, &manifest).await?;
            manifest
        };

        Ok(Self {
            root,
            manifest: Mutex::new(manifest),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The weights file the inference adapter loads.
    pub fn active_path(&self) -> PathBuf {
        self.root.join(ACTIVE_FILE)
    }

    /// A fresh path under `staging/` to save newly trained weights into.
    pub fn staging_path(&self) -> PathBuf {
        self.root
            .join("staging")
            .join(format!("{}.weights", Uuid::new_v4().simple()))
    }

    pub fn path_of(&self, artifact: &ModelArtifact) -> PathBuf {
        self.root.join(&artifact.path)
    }

    pub async fn active(&self) -> Result<ModelArtifact, ArtifactError> {
        let manifest = self.manifest.lock().await;
        manifest
            .find(&manifest.active)
            .cloned()
            .ok_or_else(|| ArtifactError::UnknownVersion(manifest.active.clone()))
    }

    pub async fn list(&self) -> Vec<ModelArtifact> {
        self.manifest.lock().await.artifacts.clone()
    }

    /// Snapshot the active weights into `backups/`.
    pub async fn backup_active(&self) -> Result<ModelArtifact, ArtifactError> {
        let mut manifest = self.manifest.lock().await;
        let active = manifest
            .find(&manifest.active)
            .cloned()
            .ok_or_else(|| ArtifactError::UnknownVersion(manifest.active.clone()))?;

        let version_id = manifest.unique_id("backup");
        let path = PathBuf::from("backups").join(format!("{version_id}.weights"));
        let dest = self.root.join(&path);
        tokio::fs::copy(self.active_path(), &dest).await?;

        let checksum = sha256_file(&dest).await?;
        if checksum != active.checksum {
            tracing::warn!(
                version = %active.version_id,
                "Active weights differ from their recorded checksum"
            );
        }

        let backup = ModelArtifact {
            version_id,
            created_at: Utc::now(),
            source: active.source,
            backup_of: Some(active.version_id),
            path,
            checksum,
        };
        manifest.artifacts.push(backup.clone());
        write_manifest(&self.root, &manifest).await?;

        tracing::info!(backup = %backup.version_id, "Backed up active model");
        Ok(backup)
    }

    /// Make the staged weights the active artifact, keeping a versioned copy.
    pub async fn commit(&self, staged: &Path) -> Result<ModelArtifact, ArtifactError> {
        let mut manifest = self.manifest.lock().await;

        let version_id = manifest.unique_id("retrained");
        let path = PathBuf::from("versions").join(format!("{version_id}.weights"));
        let version_file = self.root.join(&path);
        tokio::fs::rename(staged, &version_file).await?;

        let artifact = ModelArtifact {
            version_id: version_id.clone(),
            created_at: Utc::now(),
            source: ArtifactSource::Retrained,
            backup_of: None,
            checksum: sha256_file(&version_file).await?,
            path,
        };

        replace_file(&version_file, &self.active_path()).await?;
        manifest.artifacts.push(artifact.clone());
        manifest.active = version_id;
        write_manifest(&self.root, &manifest).await?;

        tracing::info!(version = %artifact.version_id, "Committed new active model");
        Ok(artifact)
    }

    /// Put a backup's weights back in place and reactivate the version it was taken of.
    pub async fn restore(&self, backup: &ModelArtifact) -> Result<(), ArtifactError> {
        let mut manifest = self.manifest.lock().await;
        let restored_version = backup
            .backup_of
            .clone()
            .ok_or_else(|| ArtifactError::NotABackup(backup.version_id.clone()))?;

        let source = self.root.join(&backup.path);
        if sha256_file(&source).await? != backup.checksum {
            return Err(ArtifactError::ChecksumMismatch(backup.version_id.clone()));
        }

        replace_file(&source, &self.active_path()).await?;
        manifest.active = restored_version;
        write_manifest(&self.root, &manifest).await?;

        tracing::info!(
            backup = %backup.version_id,
            version = %manifest.active,
            "Restored model from backup"
        );
        Ok(())
    }

    /// Whether `active.weights` still matches the active artifact's checksum.
    pub async fn verify_active(&self) -> Result<bool, ArtifactError> {
        let active = self.active().await?;
        Ok(sha256_file(&self.active_path()).await? == active.checksum)
    }

    /// Best-effort removal of a staged file that never got committed.
    pub async fn discard_staged(&self, staged: &Path) {
        if let Err(e) = tokio::fs::remove_file(staged).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %staged.display(), error = %e, "Failed to remove staged weights");
            }
        }
    }
}

/// Put the active version's own copy back if `active.weights` is missing or
/// holds bytes the manifest does not describe, e.g. after a crash between
/// replacing the weights and rewriting the manifest.
async fn repair_active(root: &Path, active: &ModelArtifact) -> Result<(), ArtifactError> {
    let target = root.join(ACTIVE_FILE);
    if tokio::fs::try_exists(&target).await? && sha256_file(&target).await? == active.checksum {
        return Ok(());
    }

    let source = root.join(&active.path);
    if !tokio::fs::try_exists(&source).await? || sha256_file(&source).await? != active.checksum {
        return Err(ArtifactError::ChecksumMismatch(active.version_id.clone()));
    }
    replace_file(&source, &target).await?;

    tracing::warn!(
        version = %active.version_id,
        "Active weights did not match the manifest, restored from version copy"
    );
    Ok(())
}

async fn write_manifest(root: &Path, manifest: &Manifest) -> Result<(), ArtifactError> {
    let target = root.join(MANIFEST_FILE);
    let tmp = root.join(format!("{MANIFEST_FILE}.tmp"));
    tokio::fs::write(&tmp, serde_json::to_vec_pretty(manifest)?).await?;
    tokio::fs::rename(&tmp, &target).await?;
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("Artifact store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid artifact manifest: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error("No initial weights at {0}")]
    MissingWeights(PathBuf),

    #[error("Unknown model version: {0}")]
    UnknownVersion(String),

    #[error("Artifact {0} is not a backup")]
    NotABackup(String),

    #[error("Checksum mismatch for artifact {0}")]
    ChecksumMismatch(String),
}
