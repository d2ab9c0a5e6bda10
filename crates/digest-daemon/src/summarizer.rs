use std::time::Duration;

use async_trait::async_trait;
use digest_core::config::SummarizerConfig;
use digest_scheduler::{Summarizer, SummarizerError, SummaryOutcome, SummaryRequest};
use tracing::{debug, warn};

/// Longest error body kept in a `Rejected` error (and so in execution history).
const MAX_ERROR_BODY_CHARS: usize = 500;

/// Calls the summary service over HTTP: `POST {base_url}/summaries`.
pub struct HttpSummarizer {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    timeout_secs: u64,
}

impl HttpSummarizer {
    pub fn new(config: &SummarizerConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            timeout_secs: config.request_timeout_secs,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/summaries", self.base_url)
    }
}

#[async_trait]
impl Summarizer for HttpSummarizer {
    fn name(&self) -> &str {
        "http"
    }

    async fn summarize(&self, req: &SummaryRequest) -> Result<SummaryOutcome, SummarizerError> {
        debug!(
            target_id = %req.target_id,
            start = %req.start_utc,
            end = %req.end_utc,
            "requesting summary"
        );

        let mut builder = self.client.post(self.endpoint()).json(req);
        if let Some(ref key) = self.api_key {
            builder = builder.bearer_auth(key);
        }

        let resp = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                SummarizerError::Timeout {
                    secs: self.timeout_secs,
                }
            } else {
                SummarizerError::Http(e.to_string())
            }
        })?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, target_id = %req.target_id, "summary service error");
            return Err(SummarizerError::Rejected {
                status,
                body: truncate_chars(&text, MAX_ERROR_BODY_CHARS),
            });
        }

        resp.json::<SummaryOutcome>()
            .await
            .map_err(|e| SummarizerError::Http(format!("invalid response body: {e}")))
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}…", &s[..idx]),
        None => s.to_string(),
    }
}
