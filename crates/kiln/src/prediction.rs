//! Prediction wire types and status lifecycle.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PredictionStatus {
    Starting,
    Processing,
    Succeeded,
    Failed,
    Canceled,
}

impl PredictionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Processing => "processing",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }
}

/// One `request-<pid>.json` file.
#[derive(Debug, Clone, Deserialize)]
pub struct PredictionRequest {
    #[serde(default)]
    pub input: serde_json::Map<String, serde_json::Value>,
    pub webhook: Option<String>,
    pub context: Option<serde_json::Map<String, serde_json::Value>>,
}

/// One `response-<pid>-<epoch>.json` file, partial or final.
#[derive(Debug, Clone, Serialize)]
pub struct PredictionResponse {
    pub status: PredictionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<serde_json::Map<String, serde_json::Value>>,
}

impl PredictionResponse {
    pub fn starting() -> Self {
        Self {
            status: PredictionStatus::Starting,
            started_at: Some(now_iso()),
            completed_at: None,
            output: None,
            error: None,
            metrics: None,
        }
    }
}

/// RFC 3339 timestamp with offset, matching what the host writes.
pub(crate) fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_is_terminal() {
        assert!(!PredictionStatus::Starting.is_terminal());
        assert!(!PredictionStatus::Processing.is_terminal());
        assert!(PredictionStatus::Succeeded.is_terminal());
        assert!(PredictionStatus::Failed.is_terminal());
        assert!(PredictionStatus::Canceled.is_terminal());
    }

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_value(PredictionStatus::Succeeded).unwrap(),
            serde_json::json!("succeeded")
        );
        assert_eq!(PredictionStatus::Canceled.as_str(), "canceled");
    }

    #[test]
    fn response_omits_unset_fields() {
        let resp = PredictionResponse::starting();
        let v = serde_json::to_value(&resp).unwrap();
        assert_eq!(v["status"], "starting");
        assert!(v.get("output").is_none());
        assert!(v.get("error").is_none());
        assert!(v.get("metrics").is_none());
        assert!(v.get("completed_at").is_none());
        assert!(v.get("started_at").is_some());
    }

    #[test]
    fn request_accepts_minimal_payload() {
        let req: PredictionRequest = serde_json::from_str(r#"{"input": {"i": 1}}"#).unwrap();
        assert_eq!(req.input["i"], serde_json::json!(1));
        assert!(req.webhook.is_none());
        assert!(req.context.is_none());
    }
}
