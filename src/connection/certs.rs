//! Certificate material referenced by URL.
//!
//! Descriptors may point at certificate files over HTTP(S); they are
//! fetched with a bounded timeout into scoped temporary files that live as
//! long as the connection entry and are removed on teardown.

use crate::config::{is_valid_uri, ConnectionInfo};
use crate::error::{ChatDbError, Result};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Timeout for fetching one certificate file.
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

static FILE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Temporary certificate files backing one connection entry.
#[derive(Debug, Default)]
pub struct CertBundle {
    files: Vec<PathBuf>,
}

impl CertBundle {
    /// Fetches every certificate URL on the descriptor into temp files and
    /// rewrites the descriptor's URL fields to the local paths drivers read.
    ///
    /// Returns the resolved descriptor together with the bundle guarding
    /// the files.
    pub async fn materialize(info: &ConnectionInfo) -> Result<(ConnectionInfo, CertBundle)> {
        let mut bundle = CertBundle::default();
        let mut resolved = info.clone();

        let fetches: [(&Option<String>, &mut Option<String>, &str); 3] = [
            (&info.ssl_root_cert_url, &mut resolved.ssl_root_cert_url, "root"),
            (&info.ssl_cert_url, &mut resolved.ssl_cert_url, "cert"),
            (&info.ssl_key_url, &mut resolved.ssl_key_url, "key"),
        ];

        for (source, target, kind) in fetches {
            if let Some(url) = source.as_deref().filter(|u| !u.trim().is_empty()) {
                match bundle.fetch_one(url, kind).await {
                    Ok(path) => *target = Some(path.to_string_lossy().into_owned()),
                    Err(e) => {
                        bundle.cleanup();
                        return Err(e);
                    }
                }
            }
        }

        Ok((resolved, bundle))
    }

    async fn fetch_one(&mut self, url: &str, kind: &str) -> Result<PathBuf> {
        if !is_valid_uri(url) {
            return Err(ChatDbError::bad_input(format!(
                "Invalid certificate URL: {url}"
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .map_err(|e| ChatDbError::internal(format!("Failed to build HTTP client: {e}")))?;

        let response = client
            .get(url)
            .send()
            .await
            .map_err(|e| ChatDbError::upstream_db(format!("Failed to fetch certificate: {e}")))?;

        if !response.status().is_success() {
            return Err(ChatDbError::upstream_db(format!(
                "Certificate fetch returned {}",
                response.status()
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| ChatDbError::upstream_db(format!("Failed to read certificate: {e}")))?;

        let path = std::env::temp_dir().join(format!(
            "chatdb-{}-{}-{kind}.pem",
            std::process::id(),
            FILE_COUNTER.fetch_add(1, Ordering::SeqCst)
        ));

        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|e| ChatDbError::internal(format!("Failed to write certificate: {e}")))?;

        debug!(url, path = %path.display(), "certificate materialized");
        self.files.push(path.clone());
        Ok(path)
    }

    /// Removes every materialized file. Idempotent.
    pub fn cleanup(&mut self) {
        for path in self.files.drain(..) {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(path = %path.display(), "failed to remove certificate file: {e}");
            }
        }
    }

    /// Number of materialized files.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// True when no files were materialized.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl Drop for CertBundle {
    fn drop(&mut self) {
        self.cleanup();
    }
}
