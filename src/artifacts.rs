use crate::types::*;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

/// Storage collaborator that turns object identifiers into fetchable URLs.
///
/// Implementations must return one URL per identifier, in input order.
pub trait ObjectStorage: Send + Sync {
    fn presign(&self, folder: &str, identifiers: &[String]) -> Result<Vec<String>>;
}

/// Builds virtual-hosted bucket URLs, signed with an expiry when a secret is set.
pub struct BucketUrlSigner {
    bucket: String,
    expiry: Duration,
    secret: Option<String>,
}

impl BucketUrlSigner {
    pub fn new(bucket: impl Into<String>, expiry: Duration, secret: Option<String>) -> Self {
        Self {
            bucket: bucket.into(),
            expiry,
            secret,
        }
    }

    fn object_path(folder: &str, identifier: &str) -> String {
        let folder = folder.trim_matches('/');
        let identifier = identifier.trim_start_matches('/');
        if folder.is_empty() {
            identifier.to_string()
        } else {
            format!("{}/{}", folder, identifier)
        }
    }

    fn signature(secret: &str, path: &str, expires_at: i64) -> String {
        let mut hasher = Sha256::new();
        hasher.update(secret.as_bytes());
        hasher.update(b"\n");
        hasher.update(path.as_bytes());
        hasher.update(b"\n");
        hasher.update(expires_at.to_string().as_bytes());
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect()
    }

    fn sign_at(&self, path: &str, now: chrono::DateTime<chrono::Utc>) -> Result<String> {
        let base = format!("https://{}.s3.amazonaws.com/{}", self.bucket, path);
        let secret = match &self.secret {
            Some(s) => s,
            None => return Ok(base),
        };
        let ttl = chrono::Duration::from_std(self.expiry)
            .map_err(|e| RelayError::ArtifactPublish(format!("invalid expiry: {}", e)))?;
        let expires_at = (now + ttl).timestamp();
        Ok(format!(
            "{}?X-Expires={}&X-Signature={}",
            base,
            expires_at,
            Self::signature(secret, path, expires_at)
        ))
    }
}

impl ObjectStorage for BucketUrlSigner {
    fn presign(&self, folder: &str, identifiers: &[String]) -> Result<Vec<String>> {
        if self.bucket.is_empty() {
            return Err(RelayError::ArtifactPublish("bucket name is empty".to_string()).into());
        }
        let now = chrono::Utc::now();
        identifiers
            .iter()
            .map(|id| {
                if id.trim().is_empty() {
                    return Err(RelayError::ArtifactPublish(
                        "empty artifact identifier".to_string(),
                    )
                    .into());
                }
                self.sign_at(&Self::object_path(folder, id), now)
            })
            .collect()
    }
}

/// Publishes generated artifacts. Never fails: storage errors degrade to no URLs.
pub struct ArtifactPublisher {
    storage: Arc<dyn ObjectStorage>,
    folder: String,
}

impl ArtifactPublisher {
    pub fn new(storage: Arc<dyn ObjectStorage>, folder: impl Into<String>) -> Self {
        Self {
            storage,
            folder: folder.into(),
        }
    }

    pub fn publish(&self, identifiers: &[String]) -> Vec<String> {
        if identifiers.is_empty() {
            return Vec::new();
        }

        match self.try_publish(identifiers) {
            Ok(urls) => {
                tracing::info!(
                    "[⚙️  -> 🪣 ] Published {} artifact(s) to {}",
                    urls.len(),
                    self.folder
                );
                urls
            }
            Err(e) => {
                tracing::error!(
                    failure = %e.kind(),
                    "[⚙️  -> 🪣 ] Artifact publish failed for {} identifier(s): {}",
                    identifiers.len(),
                    e.inner
                );
                Vec::new()
            }
        }
    }

    fn try_publish(&self, identifiers: &[String]) -> Result<Vec<String>> {
        let urls = self.storage.presign(&self.folder, identifiers)?;
        if urls.len() != identifiers.len() {
            return Err(RelayError::ArtifactPublish(format!(
                "storage returned {} url(s) for {} identifier(s)",
                urls.len(),
                identifiers.len()
            ))
            .into());
        }
        Ok(urls)
    }
}
