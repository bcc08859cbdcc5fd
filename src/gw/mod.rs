//! Client for the exodus-gw content gateway.
//!
//! Covers the JSON publish/task API, the S3-compatible blob store used
//! for content uploads, and the concurrent upload pipeline. All
//! operations observe a cancellation token and abort promptly when it
//! fires.

mod client;
mod publish;
mod retry;
mod task;
mod upload;

pub use client::Client;
pub use publish::{ItemInput, Publish};
pub use retry::RetryPolicy;
pub use upload::UploadState;

use thiserror::Error;

fn fmt_body(body: &str) -> String {
    if body.is_empty() {
        String::new()
    } else {
        format!(", {body}")
    }
}

/// Errors arising from gateway operations.
#[derive(Debug, Error)]
pub enum GwError {
    #[error("can't load cert/key from {path}: {source}")]
    Credentials {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("can't build TLS identity: {0}")]
    Identity(#[source] reqwest::Error),

    #[error("can't initialize HTTP client: {0}")]
    Init(#[source] reqwest::Error),

    #[error("{method} {url}: {source}")]
    Request {
        method: String,
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// The gateway answered with a non-2xx status. Carries up to 2000
    /// bytes of the response body verbatim.
    #[error("{method} {url}: {status}{}", fmt_body(.body))]
    Status {
        method: String,
        url: String,
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("{method} {url}: {source}")]
    Decode {
        method: String,
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("encoding request body: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("publish object is missing '{0}' link")]
    MissingLink(&'static str),

    #[error("publish task {0} failed")]
    TaskFailed(String),

    #[error("polling task {id}: {source}")]
    TaskPoll {
        id: String,
        #[source]
        source: Box<GwError>,
    },

    #[error("checking for presence of {key}: {source}")]
    Presence {
        key: String,
        #[source]
        source: Box<GwError>,
    },

    #[error("upload {path}: {source}")]
    Upload {
        path: String,
        #[source]
        source: Box<GwError>,
    },

    #[error("opening {path}: {source}")]
    OpenFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("operation cancelled")]
    Cancelled,

    /// An error returned from an upload callback; stops the batch.
    #[error("{0}")]
    Callback(String),
}
