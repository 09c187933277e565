//! IPC notifications to the supervising server.
//!
//! Out-of-band status updates are small JSON POSTs to the IPC URL handed
//! over at startup. A failed POST is logged and swallowed: the response
//! files in the working directory are the ground truth, the IPC channel
//! only wakes the supervisor up early.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcStatus {
    /// Below the concurrency cap; new requests are welcome.
    Ready,
    /// Admitted a request into a previously-idle slot.
    Busy,
    /// A response file has been written.
    Output,
}

impl IpcStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "READY",
            Self::Busy => "BUSY",
            Self::Output => "OUTPUT",
        }
    }
}

pub struct IpcClient {
    url: String,
    name: Option<String>,
    working_dir: String,
    client: reqwest::Client,
}

impl IpcClient {
    pub fn new(url: impl Into<String>, name: Option<String>, working_dir: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("Failed to create HTTP client");

        Self { url: url.into(), name, working_dir: working_dir.into(), client }
    }

    /// Post a status notification. Fire-and-swallow: failures are logged,
    /// never surfaced.
    pub async fn notify(&self, status: IpcStatus) {
        let mut payload = serde_json::Map::new();
        if let Some(ref name) = self.name {
            payload.insert("name".into(), serde_json::json!(name));
        }
        payload.insert("pid".into(), serde_json::json!(std::process::id()));
        payload.insert("status".into(), serde_json::json!(status.as_str()));
        payload.insert("working_dir".into(), serde_json::json!(self.working_dir));

        match self.client.post(&self.url).json(&payload).send().await {
            Ok(response) => {
                tracing::trace!(status = status.as_str(), code = %response.status(), "IPC sent");
            }
            Err(e) => {
                tracing::warn!(status = status.as_str(), error = %e, "IPC failed");
            }
        }
    }
}
