//! Per-request bookkeeping
//!
//! A `RequestRecord` follows one inbound call from entry to its terminal
//! state. Status only moves forward along the executor's state machine;
//! attempts, tokens and cost of failed attempts stay on the record even
//! when the call fails overall.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use uuid::Uuid;

use crate::error::{AttemptError, EngineError, EngineResult};
use crate::types::LlmRequest;

/// Lifecycle of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    InFlight,
    Completed,
    Failed,
    Timeout,
    Cached,
    Exhausted,
}

impl RequestStatus {
    /// Allowed edges:
    /// pending -> in_flight | cached | exhausted,
    /// in_flight -> completed | failed | timeout,
    /// failed | timeout -> in_flight | exhausted
    pub fn can_transition_to(self, next: RequestStatus) -> bool {
        use RequestStatus::*;
        matches!(
            (self, next),
            (Pending, InFlight)
                | (Pending, Cached)
                | (Pending, Exhausted)
                | (InFlight, Completed)
                | (InFlight, Failed)
                | (InFlight, Timeout)
                | (Failed, InFlight)
                | (Timeout, InFlight)
                | (Failed, Exhausted)
                | (Timeout, Exhausted)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestStatus::Completed | RequestStatus::Cached | RequestStatus::Exhausted
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::InFlight => "in_flight",
            RequestStatus::Completed => "completed",
            RequestStatus::Failed => "failed",
            RequestStatus::Timeout => "timeout",
            RequestStatus::Cached => "cached",
            RequestStatus::Exhausted => "exhausted",
        }
    }
}

/// One attempt against one model
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    pub model: String,
    pub started_at: DateTime<Utc>,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
}

/// Observability record of one inbound call
#[derive(Debug, Clone, Serialize)]
pub struct RequestRecord {
    pub id: Uuid,
    pub request: LlmRequest,
    pub status: RequestStatus,
    /// Model that served the request, or the last one attempted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub attempts: Vec<AttemptRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub cost: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RequestRecord {
    pub fn new(request: LlmRequest) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            request,
            status: RequestStatus::Pending,
            model: None,
            attempts: Vec::new(),
            created_at: now,
            updated_at: now,
            finished_at: None,
            tokens_in: 0,
            tokens_out: 0,
            cost: 0.0,
            error: None,
        }
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempts.len() as u32
    }

    fn advance(&mut self, next: RequestStatus) -> EngineResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(EngineError::Internal(anyhow::anyhow!(
                "request {} cannot move from {} to {}",
                self.id,
                self.status.as_str(),
                next.as_str()
            )));
        }
        let now = Utc::now();
        self.status = next;
        self.updated_at = now;
        if next.is_terminal() {
            self.finished_at = Some(now);
        }
        Ok(())
    }

    /// Served from cache without touching a backend
    pub fn mark_cached(&mut self, model: &str) -> EngineResult<()> {
        self.advance(RequestStatus::Cached)?;
        self.model = Some(model.to_string());
        Ok(())
    }

    /// Start an attempt against `model`
    pub fn begin_attempt(&mut self, model: &str) -> EngineResult<()> {
        self.advance(RequestStatus::InFlight)?;
        self.model = Some(model.to_string());
        self.attempts.push(AttemptRecord {
            model: model.to_string(),
            started_at: self.updated_at,
            latency_ms: 0,
            error: None,
            error_kind: None,
        });
        Ok(())
    }

    fn finish_attempt(&mut self, latency_ms: u64, error: Option<&AttemptError>) {
        if let Some(attempt) = self.attempts.last_mut() {
            attempt.latency_ms = latency_ms;
            attempt.error = error.map(|e| e.to_string());
            attempt.error_kind = error.map(|e| e.kind().to_string());
        }
    }

    /// The current attempt succeeded
    pub fn complete_attempt(
        &mut self,
        latency_ms: u64,
        tokens_in: u32,
        tokens_out: u32,
        cost: f64,
    ) -> EngineResult<()> {
        self.advance(RequestStatus::Completed)?;
        self.finish_attempt(latency_ms, None);
        self.tokens_in += tokens_in;
        self.tokens_out += tokens_out;
        self.cost += cost;
        self.error = None;
        Ok(())
    }

    /// The current attempt failed; timeouts and cancellation land in `Timeout`
    pub fn fail_attempt(&mut self, latency_ms: u64, error: &AttemptError) -> EngineResult<()> {
        let next = if error.is_timeout() {
            RequestStatus::Timeout
        } else {
            RequestStatus::Failed
        };
        self.advance(next)?;
        self.finish_attempt(latency_ms, Some(error));
        self.error = Some(error.to_string());
        Ok(())
    }

    /// No candidate left
    pub fn exhaust(&mut self, error: &EngineError) -> EngineResult<()> {
        self.advance(RequestStatus::Exhausted)?;
        self.error = Some(error.to_string());
        Ok(())
    }
}

/// Bounded log of the most recent request records
pub struct RequestJournal {
    records: Mutex<VecDeque<RequestRecord>>,
    capacity: usize,
}

impl RequestJournal {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
        }
    }

    pub fn push(&self, record: RequestRecord) {
        if self.capacity == 0 {
            return;
        }
        let mut records = self.records.lock();
        while records.len() >= self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    pub fn get(&self, id: Uuid) -> Option<RequestRecord> {
        self.records.lock().iter().rev().find(|r| r.id == id).cloned()
    }

    /// Most recent records, newest first
    pub fn recent(&self, limit: usize) -> Vec<RequestRecord> {
        self.records.lock().iter().rev().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
