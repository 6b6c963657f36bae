use async_trait::async_trait;
use s3::creds::Credentials;
use s3::{Bucket, Region};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::models::record::Fingerprint;
use crate::services::encryption::{CipherError, ImageCipher};

/// Content-addressed key for an uploaded image.
///
/// The extension is guessed from magic bytes so the engine can pick a decoder;
/// anything unrecognized is stored as `.bin`.
pub fn image_key(fingerprint: &Fingerprint, bytes: &[u8]) -> String {
    let ext = image::guess_format(bytes)
        .ok()
        .and_then(|format| format.extensions_str().first().copied())
        .unwrap_or("bin");
    format!("xray_images/{fingerprint}.{ext}")
}

/// Blob storage for uploaded X-ray images.
#[async_trait]
pub trait ImageStore: Send + Sync {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError>;

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    /// A local filesystem path holding the plaintext image, for the engine to read.
    async fn local_path(&self, key: &str) -> Result<PathBuf, StorageError>;
}

fn content_type(key: &str) -> &'static str {
    match Path::new(key).extension().and_then(|e| e.to_str()) {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        _ => "application/octet-stream",
    }
}

/// Reject keys that could escape the store root.
fn checked_relative(key: &str) -> Result<&Path, StorageError> {
    let path = Path::new(key);
    let safe = path
        .components()
        .all(|c| matches!(c, std::path::Component::Normal(_)));
    if !safe || key.is_empty() {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    Ok(path)
}

async fn write_file(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, bytes).await?;
    Ok(())
}

/// Images kept as plain files under a root directory.
pub struct LocalImageStore {
    root: PathBuf,
}

impl LocalImageStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        Ok(self.root.join(checked_relative(key)?))
    }
}

#[async_trait]
impl ImageStore for LocalImageStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        write_file(&self.path_for(key)?, bytes).await
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        match tokio::fs::read(self.path_for(key)?).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StorageError::Missing(key.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn local_path(&self, key: &str) -> Result<PathBuf, StorageError> {
        let path = self.path_for(key)?;
        if !tokio::fs::try_exists(&path).await? {
            return Err(StorageError::Missing(key.to_string()));
        }
        Ok(path)
    }
}

/// Images in Cloudflare R2 (S3-compatible), optionally sealed at rest.
///
/// `local_path` downloads into a staging directory; keys are content
/// addressed, so an already-staged file is reused as is.
pub struct R2ImageStore {
    bucket: Box<Bucket>,
    cipher: Option<ImageCipher>,
    staging: PathBuf,
}

impl R2ImageStore {
    pub fn new(
        bucket_name: &str,
        endpoint: &str,
        access_key: &str,
        secret_key: &str,
        cipher: Option<ImageCipher>,
        staging: impl Into<PathBuf>,
    ) -> Result<Self, StorageError> {
        let region = Region::Custom {
            region: "auto".to_string(),
            endpoint: endpoint.to_string(),
        };

        let credentials = Credentials::new(Some(access_key), Some(secret_key), None, None, None)
            .map_err(|e| StorageError::Config(e.to_string()))?;

        let bucket = Bucket::new(bucket_name, region, credentials)
            .map_err(|e| StorageError::Config(e.to_string()))?;

        Ok(Self {
            bucket,
            cipher,
            staging: staging.into(),
        })
    }
}

#[async_trait]
impl ImageStore for R2ImageStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let body = match &self.cipher {
            Some(cipher) => cipher.seal(bytes)?,
            None => bytes.to_vec(),
        };
        let ct = if self.cipher.is_some() {
            "application/octet-stream"
        } else {
            content_type(key)
        };

        let response = self.bucket.put_object_with_content_type(key, &body, ct).await?;
        if !(200..300).contains(&response.status_code()) {
            return Err(StorageError::Status {
                key: key.to_string(),
                code: response.status_code(),
            });
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let response = self.bucket.get_object(key).await?;
        match response.status_code() {
            200 => {}
            404 => return Err(StorageError::Missing(key.to_string())),
            code => {
                return Err(StorageError::Status {
                    key: key.to_string(),
                    code,
                })
            }
        }

        let body = response.to_vec();
        match &self.cipher {
            Some(cipher) => Ok(cipher.open(&body)?),
            None => Ok(body),
        }
    }

    async fn local_path(&self, key: &str) -> Result<PathBuf, StorageError> {
        let path = self.staging.join(checked_relative(key)?);
        if tokio::fs::try_exists(&path).await? {
            return Ok(path);
        }

        let bytes = self.get(key).await?;
        write_file(&path, &bytes).await?;
        tracing::debug!(key = %key, path = %path.display(), "Staged image from R2");
        Ok(path)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("S3 operation failed: {0}")]
    S3(#[from] s3::error::S3Error),

    #[error("S3 returned status {code} for {key}")]
    Status { key: String, code: u16 },

    #[error("Image not found: {0}")]
    Missing(String),

    #[error("Invalid image key: {0}")]
    InvalidKey(String),

    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image cipher error: {0}")]
    Cipher(#[from] CipherError),

    #[error("Storage configuration error: {0}")]
    Config(String),
}
