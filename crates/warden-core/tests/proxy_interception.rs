//! Interception invariants: one audit record per call, deny blocks the
//! server, modify rewrites arguments, failures fail closed.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use warden_core::{
    reason_codes, AuditRecord, AuditSink, AuditWriteError, CallDescriptor, CallOutcome, Decision,
    GovernConfig, GovernError, GovernedServer, MemoryAuditSink, PolicyError, PolicyEvaluator,
    ToolOutput, ToolServer,
};

struct MockServer {
    delay: Duration,
    fail_calls: bool,
    calls: Mutex<Vec<(String, Map<String, Value>)>>,
}

impl MockServer {
    fn new() -> Self {
        Self {
            delay: Duration::ZERO,
            fail_calls: false,
            calls: Mutex::new(Vec::new()),
        }
    }

    fn failing() -> Self {
        Self {
            fail_calls: true,
            ..Self::new()
        }
    }

    fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::new()
        }
    }

    fn calls(&self) -> Vec<(String, Map<String, Value>)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ToolServer for MockServer {
    async fn start(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn call_tool(
        &self,
        tool: &str,
        arguments: &Map<String, Value>,
    ) -> anyhow::Result<ToolOutput> {
        self.calls
            .lock()
            .unwrap()
            .push((tool.to_string(), arguments.clone()));
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail_calls {
            anyhow::bail!("backend exploded");
        }
        Ok(ToolOutput::text(format!("ok:{tool}")))
    }
}

struct Fixed(Decision);

#[async_trait]
impl PolicyEvaluator for Fixed {
    async fn evaluate(&self, _descriptor: &CallDescriptor) -> Result<Decision, PolicyError> {
        Ok(self.0.clone())
    }
}

struct Unreachable;

#[async_trait]
impl PolicyEvaluator for Unreachable {
    async fn evaluate(&self, _descriptor: &CallDescriptor) -> Result<Decision, PolicyError> {
        Err(PolicyError::Unavailable("connection refused".to_string()))
    }
}

struct Slow(Duration);

#[async_trait]
impl PolicyEvaluator for Slow {
    async fn evaluate(&self, _descriptor: &CallDescriptor) -> Result<Decision, PolicyError> {
        tokio::time::sleep(self.0).await;
        Ok(Decision::Allow)
    }
}

fn args(pairs: &[(&str, &str)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), json!(v)))
        .collect()
}

async fn governed(
    evaluator: Arc<dyn PolicyEvaluator>,
    server: Arc<MockServer>,
) -> (GovernedServer, Arc<MemoryAuditSink>) {
    let sink = Arc::new(MemoryAuditSink::new());
    let governed = GovernedServer::new(evaluator, "a1", server)
        .with_audit_sink(sink.clone() as Arc<dyn AuditSink>);
    governed.start().await.unwrap();
    (governed, sink)
}

#[tokio::test]
async fn allow_forwards_and_audits_success() {
    let server = Arc::new(MockServer::new());
    let (governed, sink) = governed(Arc::new(Fixed(Decision::Allow)), server.clone()).await;

    let out = governed
        .call_tool("read_file", args(&[("path", "/tmp/x")]))
        .await
        .unwrap();

    assert_eq!(out, ToolOutput::text("ok:read_file"));
    assert_eq!(server.calls().len(), 1);

    let records = sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].decision, Decision::Allow);
    assert_eq!(records[0].reason_code, reason_codes::P_POLICY_ALLOW);
    match &records[0].outcome {
        CallOutcome::Success { payload_digest } => assert_eq!(payload_digest.len(), 64),
        other => panic!("expected success outcome, got {other:?}"),
    }
}

#[tokio::test]
async fn deny_blocks_server_and_audits_reason() {
    let server = Arc::new(MockServer::new());
    let (governed, sink) = governed(
        Arc::new(Fixed(Decision::deny("destructive op blocked"))),
        server.clone(),
    )
    .await;

    let out = governed
        .call_tool("delete_file", args(&[("path", "/etc/passwd")]))
        .await
        .unwrap();

    assert!(out.is_error);
    assert_eq!(
        out.structured.as_ref().unwrap()["reason"],
        "destructive op blocked"
    );
    assert!(server.calls().is_empty());

    let records = sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].outcome, CallOutcome::Rejected);
    assert_eq!(
        records[0].decision,
        Decision::deny("destructive op blocked")
    );
}

#[tokio::test]
async fn modify_forwards_rewritten_arguments() {
    let server = Arc::new(MockServer::new());
    let mut rewritten = Map::new();
    rewritten.insert("path".to_string(), json!("/safe/dir/x"));
    let (governed, sink) = governed(
        Arc::new(Fixed(Decision::Modify {
            arguments: rewritten,
        })),
        server.clone(),
    )
    .await;

    governed
        .call_tool("write_file", args(&[("path", "/etc/x")]))
        .await
        .unwrap();

    let calls = server.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].1["path"], "/safe/dir/x");

    // The audited descriptor keeps the original arguments; the decision
    // records the substitution.
    let records = sink.records();
    assert_eq!(records[0].descriptor.arguments["path"], "/etc/x");
    assert!(matches!(records[0].decision, Decision::Modify { .. }));
}

#[tokio::test]
async fn server_error_is_audited_then_propagated() {
    let server = Arc::new(MockServer::failing());
    let (governed, sink) = governed(Arc::new(Fixed(Decision::Allow)), server.clone()).await;

    let err = governed
        .call_tool("read_file", args(&[("path", "/tmp/x")]))
        .await
        .unwrap_err();

    match err {
        GovernError::Server(inner) => assert_eq!(inner.to_string(), "backend exploded"),
        other => panic!("expected server error, got {other:?}"),
    }

    let records = sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(
        records[0].outcome,
        CallOutcome::Error {
            message: "backend exploded".to_string()
        }
    );
}

#[tokio::test]
async fn unreachable_evaluator_fails_closed() {
    let server = Arc::new(MockServer::new());
    let (governed, sink) = governed(Arc::new(Unreachable), server.clone()).await;

    let out = governed
        .call_tool("read_file", args(&[("path", "/tmp/x")]))
        .await
        .unwrap();

    assert!(out.is_error);
    assert!(server.calls().is_empty());

    let records = sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].reason_code, reason_codes::P_EVALUATOR_UNAVAILABLE);
    match &records[0].decision {
        Decision::Deny { reason } => {
            assert!(reason.starts_with("evaluator unavailable"), "{reason}")
        }
        other => panic!("expected deny, got {other:?}"),
    }
}

#[tokio::test]
async fn slow_evaluator_times_out_closed() {
    let server = Arc::new(MockServer::new());
    let sink = Arc::new(MemoryAuditSink::new());
    let governed = GovernedServer::new(Arc::new(Slow(Duration::from_secs(10))), "a1", server.clone())
        .with_audit_sink(sink.clone() as Arc<dyn AuditSink>)
        .with_config(GovernConfig {
            evaluator_timeout: Duration::from_millis(50),
            ..GovernConfig::default()
        });
    governed.start().await.unwrap();

    let out = governed
        .call_tool("read_file", args(&[("path", "/tmp/x")]))
        .await
        .unwrap();

    assert!(out.is_error);
    assert!(server.calls().is_empty());
    let records = sink.records();
    assert_eq!(records[0].reason_code, reason_codes::P_EVALUATOR_TIMEOUT);
    match &records[0].decision {
        Decision::Deny { reason } => assert!(reason.contains("timed out"), "{reason}"),
        other => panic!("expected deny, got {other:?}"),
    }
}

#[tokio::test]
async fn audit_failure_does_not_fail_the_call() {
    struct BrokenSink;
    #[async_trait]
    impl AuditSink for BrokenSink {
        async fn record(&self, _record: &AuditRecord) -> Result<(), AuditWriteError> {
            Err(AuditWriteError::Io(std::io::Error::other("disk full")))
        }
    }

    let server = Arc::new(MockServer::new());
    let governed = GovernedServer::new(Arc::new(Fixed(Decision::Allow)), "a1", server.clone())
        .with_audit_sink(Arc::new(BrokenSink));
    governed.start().await.unwrap();

    let out = governed
        .call_tool("read_file", args(&[("path", "/tmp/x")]))
        .await
        .unwrap();

    assert_eq!(out, ToolOutput::text("ok:read_file"));
    assert_eq!(governed.audit_failures(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn cancelled_call_still_records_an_outcome() {
    let server = Arc::new(MockServer::slow(Duration::from_secs(30)));
    let (governed, sink) = governed(Arc::new(Fixed(Decision::Allow)), server.clone()).await;
    let governed = Arc::new(governed);

    let g = governed.clone();
    let cancelled = tokio::time::timeout(
        Duration::from_millis(50),
        g.call_tool("read_file", args(&[("path", "/tmp/x")])),
    )
    .await;
    assert!(cancelled.is_err());

    // Best-effort: the drop-spawned write needs a moment to land.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let records = sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].outcome, CallOutcome::Cancelled);
}

#[tokio::test]
async fn empty_tool_name_is_rejected_synchronously() {
    let server = Arc::new(MockServer::new());
    let (governed, sink) = governed(Arc::new(Fixed(Decision::Allow)), server.clone()).await;

    let err = governed.call_tool("", Map::new()).await.unwrap_err();
    assert!(matches!(err, GovernError::InvalidDescriptor(_)));
    assert!(server.calls().is_empty());
    assert!(sink.records().is_empty());
}

#[tokio::test]
async fn exactly_one_forward_and_one_record_per_call() {
    let server = Arc::new(MockServer::new());
    let (governed, sink) = governed(Arc::new(Fixed(Decision::Allow)), server.clone()).await;
    let governed = Arc::new(governed);

    let total = 16usize;
    let done = Arc::new(AtomicUsize::new(0));
    let mut tasks = Vec::new();
    for i in 0..total {
        let g = governed.clone();
        let done = done.clone();
        tasks.push(tokio::spawn(async move {
            let path = format!("/tmp/{i}");
            g.call_tool("read_file", args(&[("path", path.as_str())]))
                .await
                .unwrap();
            done.fetch_add(1, Ordering::SeqCst);
        }));
    }
    for t in tasks {
        t.await.unwrap();
    }

    assert_eq!(done.load(Ordering::SeqCst), total);
    assert_eq!(server.calls().len(), total);
    assert_eq!(sink.records().len(), total);
}
