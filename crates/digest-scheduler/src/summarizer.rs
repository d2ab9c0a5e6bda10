//! Collaborator contract for per-target summary generation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One summarizer call. Serialises with the camelCase keys the service expects.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryRequest {
    pub target_id: String,
    pub target_name: String,
    /// ISO 8601 UTC, inclusive.
    pub start_utc: String,
    /// ISO 8601 UTC, inclusive.
    pub end_utc: String,
    pub timezone: String,
    pub options: serde_json::Value,
}

/// A successful answer. `result_id == None` means "nothing to summarise",
/// which is not an error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryOutcome {
    #[serde(default)]
    pub result_id: Option<String>,
    #[serde(default)]
    pub cached: bool,
}

impl SummaryOutcome {
    /// The produced identifier, ignoring blank strings.
    pub fn usable_id(&self) -> Option<&str> {
        self.result_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }
}

#[derive(Debug, Error)]
pub enum SummarizerError {
    #[error("summarizer timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("summarizer transport error: {0}")]
    Http(String),

    #[error("summarizer rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("{0}")]
    Other(String),
}

/// Produces one summary per target. Invoked sequentially by the runner.
#[async_trait]
pub trait Summarizer: Send + Sync {
    fn name(&self) -> &str;

    async fn summarize(&self, req: &SummaryRequest) -> Result<SummaryOutcome, SummarizerError>;
}
