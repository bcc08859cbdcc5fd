//! The exodus-gw HTTP client.
//!
//! Carries two reqwest clients sharing one TLS identity: `api` for the
//! JSON publish/task endpoints, and `blob` for the S3-compatible blob
//! store under `{gwurl}/upload`. Each side applies the retry policy to
//! its own calls so retries never compound.

use reqwest::header::{ACCEPT, CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::Method;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::retry::{send_with_retries, RetryPolicy};
use super::GwError;
use crate::conf::Config;
use crate::walk::SyncItem;

/// Maximum response body bytes included in error messages.
const ERROR_BODY_LIMIT: usize = 2000;

/// A high-level client for one exodus-gw environment.
#[derive(Debug, Clone)]
pub struct Client {
    api: reqwest::Client,
    blob: reqwest::Client,
    pub(crate) gw_url: String,
    pub(crate) gw_env: String,
    upload_base: String,
    pub(crate) batch_size: usize,
    pub(crate) poll_interval: Duration,
    pub(crate) commit_mode: String,
    pub(crate) upload_threads: usize,
    retry: RetryPolicy,
    pub(crate) dry_run: bool,
}

fn load_identity(cfg: &dyn Config) -> Result<Option<reqwest::Identity>, GwError> {
    let (cert, key) = (cfg.gw_cert(), cfg.gw_key());
    if cert.is_empty() && key.is_empty() {
        // No client certificate configured.
        return Ok(None);
    }

    let mut pem = std::fs::read(cert).map_err(|source| GwError::Credentials {
        path: cert.to_string(),
        source,
    })?;
    if key != cert {
        pem.extend(std::fs::read(key).map_err(|source| GwError::Credentials {
            path: key.to_string(),
            source,
        })?);
    }

    reqwest::Identity::from_pem(&pem)
        .map(Some)
        .map_err(GwError::Identity)
}

impl Client {
    /// Creates a client for the configured gateway. With `dry_run` set,
    /// every write operation becomes a no-op success while presence
    /// probes still run.
    pub fn new(cfg: &dyn Config, dry_run: bool) -> Result<Client, GwError> {
        let identity = load_identity(cfg)?;

        let build = || {
            let mut builder = reqwest::Client::builder();
            if let Some(identity) = identity.clone() {
                builder = builder.identity(identity);
            }
            builder.build().map_err(GwError::Init)
        };

        Ok(Client {
            api: build()?,
            blob: build()?,
            gw_url: cfg.gw_url().to_string(),
            gw_env: cfg.gw_env().to_string(),
            upload_base: format!("{}/upload", cfg.gw_url()),
            batch_size: cfg.gw_batch_size(),
            poll_interval: Duration::from_millis(cfg.gw_poll_interval()),
            commit_mode: cfg.gw_commit().to_string(),
            upload_threads: cfg.upload_threads(),
            retry: RetryPolicy::from_config(cfg),
            dry_run,
        })
    }

    fn full_url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.gw_url, path)
        } else {
            path.to_string()
        }
    }

    async fn error_for_status(
        method: &Method,
        url: &str,
        resp: reqwest::Response,
    ) -> Result<reqwest::Response, GwError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let body = match resp.bytes().await {
            Ok(bytes) => {
                let end = bytes.len().min(ERROR_BODY_LIMIT);
                String::from_utf8_lossy(&bytes[..end]).to_string()
            }
            Err(err) => {
                debug!(method = %method, url, error = %err, "no body in error response");
                String::new()
            }
        };

        Err(GwError::Status {
            method: method.to_string(),
            url: url.to_string(),
            status,
            body,
        })
    }

    /// Performs a JSON request against the gateway API and decodes the
    /// response body.
    pub(crate) async fn do_json<T: DeserializeOwned>(
        &self,
        token: &CancellationToken,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<T, GwError> {
        let resp = self.do_request(token, &method, path, body).await?;
        let url = self.full_url(path);
        let resp = Self::error_for_status(&method, &url, resp).await?;

        resp.json().await.map_err(|source| GwError::Decode {
            method: method.to_string(),
            url,
            source,
        })
    }

    /// Performs a JSON request for which only the status matters; the
    /// response body is ignored.
    pub(crate) async fn do_empty(
        &self,
        token: &CancellationToken,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<(), GwError> {
        let resp = self.do_request(token, &method, path, body).await?;
        let url = self.full_url(path);
        Self::error_for_status(&method, &url, resp).await?;
        Ok(())
    }

    async fn do_request(
        &self,
        token: &CancellationToken,
        method: &Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<reqwest::Response, GwError> {
        let url = self.full_url(path);
        let body_bytes = body.map(serde_json::to_vec).transpose()?;

        debug!(method = %method, url, "gateway request");

        send_with_retries(&self.retry, token, method.as_str(), &url, || {
            let mut req = self
                .api
                .request(method.clone(), &url)
                .header(ACCEPT, "application/json")
                .header(CONTENT_TYPE, "application/json");
            if let Some(bytes) = &body_bytes {
                req = req.body(bytes.clone());
            }
            Ok(req)
        })
        .await
    }

    /// Asks the gateway who we are authenticated as. Used by
    /// diagnostics only.
    pub async fn whoami(&self, token: &CancellationToken) -> Result<serde_json::Value, GwError> {
        self.do_json(token, Method::GET, "/whoami", None).await
    }

    fn blob_url(&self, key: &str) -> String {
        format!("{}/{}/{}", self.upload_base, self.gw_env, key)
    }

    /// Checks whether the blob for the given item is already present in
    /// the target environment.
    pub(crate) async fn have_blob(
        &self,
        token: &CancellationToken,
        item: &SyncItem,
    ) -> Result<bool, GwError> {
        let url = self.blob_url(&item.key);

        let resp =
            send_with_retries(&self.retry, token, "HEAD", &url, || Ok(self.blob.head(&url)))
                .await?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            // Fine, object doesn't exist yet.
            debug!(key = %item.key, "blob is not present");
            return Ok(false);
        }

        if resp.status().is_success() {
            info!(key = %item.key, "Skipping upload, blob is present");
            return Ok(true);
        }

        warn!(key = %item.key, status = %resp.status(), "blob HEAD unexpected error");
        Self::error_for_status(&Method::HEAD, &url, resp)
            .await
            .map(|_| false)
    }

    /// Streams the item's content into the blob store.
    pub(crate) async fn upload_blob(
        &self,
        token: &CancellationToken,
        item: &SyncItem,
    ) -> Result<(), GwError> {
        info!(src = %item.src_path, key = %item.key, "Uploading");

        if self.dry_run {
            return Ok(());
        }

        let url = self.blob_url(&item.key);
        let path = item.src_path.clone();
        let size = item.info.size;

        let resp = send_with_retries(&self.retry, token, "PUT", &url, || {
            let file = std::fs::File::open(&path).map_err(|source| GwError::OpenFile {
                path: path.clone(),
                source,
            })?;
            let stream = tokio_util::io::ReaderStream::new(tokio::fs::File::from_std(file));
            Ok(self
                .blob
                .put(&url)
                .header(CONTENT_LENGTH, size)
                .body(reqwest::Body::wrap_stream(stream)))
        })
        .await?;

        Self::error_for_status(&Method::PUT, &url, resp).await?;

        debug!(key = %item.key, "uploaded blob");
        Ok(())
    }
}
