//! Append-only audit trail for intercepted calls.
//!
//! Every call that enters the proxy produces exactly one [`AuditRecord`]
//! before control returns to the caller. [`AuditGuard`] enforces this even
//! when the caller cancels mid-flight.

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::decision::{reason_codes, Decision};
use crate::descriptor::{CallDescriptor, CallId};
use crate::errors::AuditWriteError;

/// How an intercepted call ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CallOutcome {
    /// The wrapped server returned a result; `payload_digest` is the hex
    /// SHA-256 of its serialized body.
    Success { payload_digest: String },
    /// The wrapped server raised; the failure propagated to the caller.
    Error { message: String },
    /// Denied by policy; the wrapped server was never invoked.
    Rejected,
    /// Force-failed by the shutdown drain.
    Interrupted,
    /// The caller cancelled before the call completed.
    Cancelled,
}

/// One entry in the append-only audit trail. Never updated or deleted
/// after write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub call_id: CallId,
    pub timestamp: DateTime<Utc>,
    pub descriptor: CallDescriptor,
    #[serde(flatten)]
    pub decision: Decision,
    /// Machine-parseable code, see [`reason_codes`].
    pub reason_code: String,
    pub outcome: CallOutcome,
    pub duration_ms: u64,
}

/// Hex SHA-256 digest of a tool result body.
pub fn payload_digest<T: Serialize>(payload: &T) -> String {
    let mut hasher = Sha256::new();
    let bytes = serde_json::to_vec(payload).unwrap_or_default();
    hasher.update(&bytes);
    hex::encode(hasher.finalize())
}

/// Append-only recorder of audit records.
///
/// Calls are bounded by [`crate::GovernConfig::audit_timeout`] at the call
/// site; implementations should not block indefinitely on their own.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, record: &AuditRecord) -> Result<(), AuditWriteError>;
}

/// In-memory sink with read-only export queries.
#[derive(Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all records, in write order.
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// All records for one call id, in write order.
    pub fn records_for_call(&self, call_id: &CallId) -> Vec<AuditRecord> {
        self.records()
            .into_iter()
            .filter(|r| &r.call_id == call_id)
            .collect()
    }

    /// All records whose timestamp falls in `[from, to)`.
    pub fn records_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<AuditRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.timestamp >= from && r.timestamp < to)
            .collect()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, record: &AuditRecord) -> Result<(), AuditWriteError> {
        self.records
            .lock()
            .map_err(|e| AuditWriteError::Io(std::io::Error::other(e.to_string())))?
            .push(record.clone());
        Ok(())
    }
}

/// NDJSON file sink: one record per line, append-only. Export queries
/// re-read the file sequentially.
pub struct FileAuditSink {
    path: PathBuf,
    file: Mutex<std::fs::File>,
}

impl FileAuditSink {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AuditWriteError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// All records in the file, in write order. Lines that fail to parse
    /// are skipped: the trail is append-only and a torn trailing write
    /// must not hide the records before it.
    pub fn read_all(&self) -> Result<Vec<AuditRecord>, AuditWriteError> {
        let file = std::fs::File::open(&self.path)?;
        let reader = BufReader::new(file);
        let mut records = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            if let Ok(record) = serde_json::from_str::<AuditRecord>(&line) {
                records.push(record);
            }
        }
        Ok(records)
    }

    pub fn records_for_call(&self, call_id: &CallId) -> Result<Vec<AuditRecord>, AuditWriteError> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|r| &r.call_id == call_id)
            .collect())
    }

    pub fn records_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<AuditRecord>, AuditWriteError> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|r| r.timestamp >= from && r.timestamp < to)
            .collect())
    }
}

#[async_trait]
impl AuditSink for FileAuditSink {
    async fn record(&self, record: &AuditRecord) -> Result<(), AuditWriteError> {
        let json = serde_json::to_string(record)?;
        let mut file = self
            .file
            .lock()
            .map_err(|e| AuditWriteError::Io(std::io::Error::other(e.to_string())))?;
        writeln!(file, "{}", json)?;
        Ok(())
    }
}

/// Writes one record with a bounded wait. On failure or timeout the call
/// proceeds; the failure counter is bumped and a warning logged so audit
/// gaps are detectable without blocking agent operation.
pub(crate) async fn write_record(
    sink: &dyn AuditSink,
    record: &AuditRecord,
    bound: Duration,
    failures: &AtomicU64,
) {
    let error = match tokio::time::timeout(bound, sink.record(record)).await {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e.to_string()),
        Err(_) => Some(AuditWriteError::Timeout(bound).to_string()),
    };
    if let Some(error) = error {
        failures.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            call_id = %record.call_id,
            code = reason_codes::S_AUDIT_WRITE,
            %error,
            "audit write failed"
        );
    }
}

/// RAII guard ensuring exactly one audit record per intercepted call.
///
/// The proxy finishes the guard explicitly on every branch; if the
/// caller cancels and the guard is dropped mid-flight, a best-effort
/// write with outcome [`CallOutcome::Cancelled`] is spawned instead.
pub struct AuditGuard {
    sink: Arc<dyn AuditSink>,
    bound: Duration,
    failures: Arc<AtomicU64>,
    descriptor: Option<CallDescriptor>,
    decision: Option<Decision>,
    reason_code: Option<&'static str>,
    started: Instant,
}

impl AuditGuard {
    pub fn new(
        sink: Arc<dyn AuditSink>,
        bound: Duration,
        failures: Arc<AtomicU64>,
        descriptor: CallDescriptor,
    ) -> Self {
        Self {
            sink,
            bound,
            failures,
            descriptor: Some(descriptor),
            decision: None,
            reason_code: None,
            started: Instant::now(),
        }
    }

    /// Set once, right after policy evaluation.
    pub fn set_decision(&mut self, decision: Decision, reason_code: &'static str) {
        self.decision = Some(decision);
        self.reason_code = Some(reason_code);
    }

    fn build_record(
        descriptor: CallDescriptor,
        decision: Option<Decision>,
        reason_code: Option<&'static str>,
        outcome: CallOutcome,
        started: Instant,
    ) -> AuditRecord {
        let reason_code = match &outcome {
            CallOutcome::Interrupted => reason_codes::T_DRAIN_INTERRUPTED,
            CallOutcome::Cancelled => reason_codes::T_CANCELLED,
            CallOutcome::Error { .. } => reason_codes::S_SERVER_ERROR,
            _ => reason_code.unwrap_or(reason_codes::P_POLICY_DENY),
        };
        AuditRecord {
            call_id: descriptor.call_id.clone(),
            timestamp: Utc::now(),
            // Cancellation can land before evaluation completed; the
            // trail stays fail-closed rather than inventing an Allow.
            decision: decision.unwrap_or_else(|| Decision::deny("cancelled before decision")),
            reason_code: reason_code.to_string(),
            outcome,
            duration_ms: started.elapsed().as_millis() as u64,
            descriptor,
        }
    }

    /// Write the record and consume the guard.
    pub async fn finish(mut self, outcome: CallOutcome) {
        if let Some(descriptor) = self.descriptor.take() {
            let record = Self::build_record(
                descriptor,
                self.decision.take(),
                self.reason_code.take(),
                outcome,
                self.started,
            );
            write_record(&*self.sink, &record, self.bound, &self.failures).await;
        }
    }
}

impl Drop for AuditGuard {
    fn drop(&mut self) {
        let Some(descriptor) = self.descriptor.take() else {
            return;
        };
        let record = Self::build_record(
            descriptor,
            self.decision.take(),
            self.reason_code.take(),
            CallOutcome::Cancelled,
            self.started,
        );
        let sink = Arc::clone(&self.sink);
        let bound = self.bound;
        let failures = Arc::clone(&self.failures);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    write_record(&*sink, &record, bound, &failures).await;
                });
            }
            Err(_) => {
                // No runtime left to write from; the gap is still visible.
                failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(call_id = %record.call_id, "audit write skipped: no runtime");
            }
        }
    }
}
