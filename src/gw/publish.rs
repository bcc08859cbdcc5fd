//! Publish objects: server-side collections of path mappings which are
//! committed atomically to make content visible on the CDN.

use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::client::Client;
use super::task;
use super::GwError;

/// One publish item as transmitted to the gateway: a destination path
/// mapped onto either an object key or a symlink target.
///
/// `content_type` is accepted by the server but never populated from
/// user input; it is omitted from the wire format while empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemInput {
    pub web_uri: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub object_key: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub link_to: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content_type: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[allow(dead_code)]
pub(crate) struct PublishData {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub env: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub links: HashMap<String, String>,
}

/// A handle to a publish object within exodus-gw.
#[derive(Debug, Clone)]
pub struct Publish {
    client: Client,
    raw: PublishData,
}

impl Client {
    /// Creates a new publish object within the gateway.
    pub async fn new_publish(&self, token: &CancellationToken) -> Result<Publish, GwError> {
        if self.dry_run {
            return Ok(Publish {
                client: self.clone(),
                raw: PublishData {
                    id: "abcd1234".to_string(),
                    ..Default::default()
                },
            });
        }

        let raw: PublishData = self
            .do_json(
                token,
                Method::POST,
                &format!("/{}/publish", self.gw_env),
                None,
            )
            .await?;

        Ok(Publish {
            client: self.clone(),
            raw,
        })
    }

    /// Returns a handle to an existing publish object.
    ///
    /// This never fails up front; if the id is invalid, an error occurs
    /// on the next write operation against the publish.
    pub fn get_publish(&self, id: &str) -> Publish {
        let base = format!("/{}/publish/{}", self.gw_env, id);
        let mut links = HashMap::new();
        links.insert("self".to_string(), base.clone());
        links.insert("commit".to_string(), format!("{base}/commit"));

        Publish {
            client: self.clone(),
            raw: PublishData {
                id: id.to_string(),
                links,
                ..Default::default()
            },
        }
    }
}

impl Publish {
    /// The unique identifier of this publish.
    pub fn id(&self) -> &str {
        &self.raw.id
    }

    /// Adds all of the given items onto this publish, in batches of at
    /// most the configured batch size.
    pub async fn add_items(
        &self,
        token: &CancellationToken,
        items: &[ItemInput],
    ) -> Result<(), GwError> {
        if self.client.dry_run {
            return if token.is_cancelled() {
                Err(GwError::Cancelled)
            } else {
                Ok(())
            };
        }

        let link = self
            .raw
            .links
            .get("self")
            .ok_or(GwError::MissingLink("self"))?;

        for chunk in items.chunks(self.client.batch_size.max(1)) {
            let body = serde_json::to_value(chunk)?;
            self.client
                .do_empty(token, Method::PUT, link, Some(&body))
                .await?;
            debug!(publish = %self.raw.id, count = chunk.len(), "added batch of publish items");
        }

        Ok(())
    }

    /// Commits this publish, making its content visible from the CDN,
    /// and waits for the asynchronous commit task to complete. Returns
    /// `Ok` only if the task succeeded.
    pub async fn commit(&self, token: &CancellationToken) -> Result<(), GwError> {
        if self.client.dry_run {
            return if token.is_cancelled() {
                Err(GwError::Cancelled)
            } else {
                Ok(())
            };
        }

        info!(publish = %self.raw.id, "Committing publish");

        let link = self
            .raw
            .links
            .get("commit")
            .ok_or(GwError::MissingLink("commit"))?;

        let mode = &self.client.commit_mode;
        let url = if mode.is_empty() {
            link.clone()
        } else {
            format!("{link}?commit_mode={mode}")
        };

        let task: task::TaskData = self
            .client
            .do_json(token, Method::POST, &url, None)
            .await?;

        task::await_task(&self.client, token, task).await
    }
}
