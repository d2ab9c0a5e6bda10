//! Scriptable [`Summarizer`] used by the runner and engine tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::summarizer::{SummarizerError, SummaryOutcome, SummaryRequest, Summarizer};

#[derive(Debug, Clone)]
pub(crate) enum Reply {
    /// Success with a generated identifier.
    Ok,
    /// Success without an identifier.
    Empty,
    Fail(&'static str),
    /// Never answers within any reasonable timeout.
    Hang,
}

/// Holds each call until released, so tests can overlap operations.
pub(crate) struct Gate {
    pub started: Notify,
    pub release: Notify,
}

pub(crate) struct ScriptedSummarizer {
    default: Reply,
    script: Mutex<HashMap<String, VecDeque<Reply>>>,
    calls: Mutex<Vec<SummaryRequest>>,
    gate: Option<Arc<Gate>>,
}

impl ScriptedSummarizer {
    pub fn new(default: Reply) -> Self {
        Self {
            default,
            script: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            gate: None,
        }
    }

    pub fn gated(default: Reply) -> (Self, Arc<Gate>) {
        let gate = Arc::new(Gate {
            started: Notify::new(),
            release: Notify::new(),
        });
        let mut s = Self::new(default);
        s.gate = Some(Arc::clone(&gate));
        (s, gate)
    }

    /// Queue replies for one target; once drained the default applies.
    pub fn script(self, target_id: &str, replies: Vec<Reply>) -> Self {
        self.script
            .lock()
            .unwrap()
            .insert(target_id.to_string(), replies.into());
        self
    }

    pub fn calls(&self) -> Vec<SummaryRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl Summarizer for ScriptedSummarizer {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn summarize(&self, req: &SummaryRequest) -> Result<SummaryOutcome, SummarizerError> {
        let n = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(req.clone());
            calls.len()
        };
        if let Some(gate) = &self.gate {
            gate.started.notify_one();
            gate.release.notified().await;
        }

        let reply = self
            .script
            .lock()
            .unwrap()
            .get_mut(&req.target_id)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| self.default.clone());

        match reply {
            Reply::Ok => Ok(SummaryOutcome {
                result_id: Some(format!("sum-{}-{n}", req.target_id)),
                cached: false,
            }),
            Reply::Empty => Ok(SummaryOutcome::default()),
            Reply::Fail(msg) => Err(SummarizerError::Other(msg.to_string())),
            Reply::Hang => {
                tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
                Ok(SummaryOutcome::default())
            }
        }
    }
}
