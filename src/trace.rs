//! Append-only audit trail for one run.

use crate::jobs::now_millis;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceStatus {
    Start,
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionTraceEntry {
    pub step: String,
    pub status: TraceStatus,
    pub detail: String,
    pub timestamp: i64,
}

#[derive(Default)]
pub struct ExecutionTrace {
    entries: Mutex<Vec<ExecutionTraceEntry>>,
}

impl ExecutionTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(
        &self,
        step: impl Into<String>,
        status: TraceStatus,
        detail: impl Into<String>,
    ) -> ExecutionTraceEntry {
        let entry = ExecutionTraceEntry {
            step: step.into(),
            status,
            detail: detail.into(),
            timestamp: now_millis(),
        };
        tracing::debug!(step = %entry.step, status = ?entry.status, detail = %entry.detail, "trace");
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(entry.clone());
        entry
    }

    pub fn all(&self) -> Vec<ExecutionTraceEntry> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}
