//! Task objects: asynchronous server-side operations polled until a
//! terminal state is reached.

use reqwest::Method;
use serde::Deserialize;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::client::Client;
use super::GwError;

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct TaskData {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub publish_id: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub links: HashMap<String, String>,
}

/// Repeatedly refreshes the task from the gateway until it reaches a
/// terminal state. Only `COMPLETE` is success; `FAILED` is a terminal
/// failure; any other state polls again after the configured interval.
pub(crate) async fn await_task(
    client: &Client,
    token: &CancellationToken,
    mut task: TaskData,
) -> Result<(), GwError> {
    loop {
        match task.state.as_str() {
            "COMPLETE" => {
                info!(task = %task.id, publish = %task.publish_id, "Task completed");
                return Ok(());
            }
            "FAILED" => {
                info!(task = %task.id, publish = %task.publish_id, "Task failed");
                return Err(GwError::TaskFailed(task.id));
            }
            _ => {}
        }

        // Not in a terminal state - query it again soon.
        tokio::select! {
            _ = token.cancelled() => return Err(GwError::Cancelled),
            _ = tokio::time::sleep(client.poll_interval) => {}
        }

        let link = task
            .links
            .get("self")
            .ok_or(GwError::MissingLink("self"))?
            .clone();

        debug!(url = %link, "polling task");

        task = client
            .do_json(token, Method::GET, &link, None)
            .await
            .map_err(|source| GwError::TaskPoll {
                id: task.id.clone(),
                source: Box::new(source),
            })?;
    }
}
