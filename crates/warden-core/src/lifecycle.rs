//! Lifecycle controller tying the wrapped server to the proxy.
//!
//! State machine: Stopped -> Starting -> Running -> Stopping -> Stopped.
//! While Running the wrapped server is reachable only through the proxy;
//! `stop` drains in-flight calls so none is left un-audited.

use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::{watch, Notify};

use crate::audit::{AuditSink, MemoryAuditSink};
use crate::config::GovernConfig;
use crate::descriptor::CallDescriptor;
use crate::errors::GovernError;
use crate::policy::PolicyEvaluator;
use crate::proxy::InterceptionProxy;
use crate::server::{ToolOutput, ToolServer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LifecycleState {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
}

impl LifecycleState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

/// State shared between the controller and the proxy.
pub(crate) struct Shared {
    state: AtomicU8,
    pub(crate) in_flight: AtomicUsize,
    pub(crate) drained: Notify,
    abort_tx: watch::Sender<bool>,
    pub(crate) audit_failures: Arc<AtomicU64>,
}

impl Shared {
    fn new() -> Self {
        let (abort_tx, _abort_rx) = watch::channel(false);
        Self {
            state: AtomicU8::new(LifecycleState::Stopped as u8),
            in_flight: AtomicUsize::new(0),
            drained: Notify::new(),
            abort_tx,
            audit_failures: Arc::new(AtomicU64::new(0)),
        }
    }

    pub(crate) fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, next: LifecycleState) {
        self.state.store(next as u8, Ordering::SeqCst);
    }

    /// Atomic transition; on failure returns the state actually observed.
    fn transition(
        &self,
        from: LifecycleState,
        to: LifecycleState,
    ) -> Result<(), LifecycleState> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(LifecycleState::from_u8)
    }

    pub(crate) fn abort_rx(&self) -> watch::Receiver<bool> {
        self.abort_tx.subscribe()
    }

    fn reset_abort(&self) {
        self.abort_tx.send_replace(false);
    }

    fn fire_abort(&self) {
        self.abort_tx.send_replace(true);
    }
}

/// Decrements the in-flight count and wakes the drain when it hits zero.
pub(crate) struct InFlightGuard {
    shared: Arc<Shared>,
}

impl InFlightGuard {
    pub(crate) fn enter(shared: &Arc<Shared>) -> Self {
        shared.in_flight.fetch_add(1, Ordering::SeqCst);
        Self {
            shared: Arc::clone(shared),
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.shared.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.shared.drained.notify_waiters();
        }
    }
}

/// Lifecycle controller and owner of the only handle to the wrapped
/// server. Also implements [`ToolServer`], so it is a drop-in substitute
/// for direct use of the server it governs.
pub struct GovernedServer {
    pub(crate) proxy: InterceptionProxy,
    server: Arc<dyn ToolServer>,
    shared: Arc<Shared>,
}

impl GovernedServer {
    /// Wrap `server` so every call from `agent_id` passes `evaluator`.
    ///
    /// Defaults to an in-memory audit sink and [`GovernConfig::default`];
    /// override with [`Self::with_audit_sink`] / [`Self::with_config`]
    /// before starting.
    pub fn new(
        evaluator: Arc<dyn PolicyEvaluator>,
        agent_id: impl Into<String>,
        server: Arc<dyn ToolServer>,
    ) -> Self {
        let shared = Arc::new(Shared::new());
        let proxy = InterceptionProxy {
            agent_id: agent_id.into(),
            evaluator,
            sink: Arc::new(MemoryAuditSink::new()),
            server: Arc::clone(&server),
            config: GovernConfig::default(),
            shared: Arc::clone(&shared),
        };
        Self {
            proxy,
            server,
            shared,
        }
    }

    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.proxy.sink = sink;
        self
    }

    pub fn with_config(mut self, config: GovernConfig) -> Self {
        self.proxy.config = config;
        self
    }

    pub fn state(&self) -> LifecycleState {
        self.shared.state()
    }

    /// Audit writes that failed or timed out since construction. The
    /// side-channel for audit gaps: calls themselves are never failed by
    /// a sink problem.
    pub fn audit_failures(&self) -> u64 {
        self.shared.audit_failures.load(Ordering::Relaxed)
    }

    pub fn proxy(&self) -> &InterceptionProxy {
        &self.proxy
    }

    /// Start the wrapped server behind the proxy.
    ///
    /// Fails with `AlreadyRunning` unless the controller is Stopped; the
    /// wrapped server's own start failure propagates and the state
    /// returns to Stopped.
    pub async fn start(&self) -> Result<(), GovernError> {
        self.shared
            .transition(LifecycleState::Stopped, LifecycleState::Starting)
            .map_err(|_| GovernError::AlreadyRunning)?;
        self.shared.reset_abort();

        tracing::info!(server = self.server.server_id(), "starting governed server");
        match self.server.start().await {
            Ok(()) => {
                self.shared.set_state(LifecycleState::Running);
                tracing::info!(server = self.server.server_id(), "governed server running");
                Ok(())
            }
            Err(error) => {
                self.shared.set_state(LifecycleState::Stopped);
                Err(GovernError::Server(error))
            }
        }
    }

    /// Stop the wrapped server after draining in-flight calls.
    ///
    /// Waits up to `drain_timeout` for in-flight `handle` calls to finish
    /// their audit writes, then force-fails the remainder (recorded as
    /// interrupted). Returns the number of force-failed calls. Idempotent
    /// from Stopped.
    pub async fn stop(&self, drain_timeout: Duration) -> Result<usize, GovernError> {
        if let Err(observed) = self
            .shared
            .transition(LifecycleState::Running, LifecycleState::Stopping)
        {
            return match observed {
                LifecycleState::Stopped | LifecycleState::Stopping => Ok(0),
                _ => Err(GovernError::NotRunning),
            };
        }

        tracing::info!("stopping governed server; draining in-flight calls");
        let deadline = tokio::time::Instant::now() + drain_timeout;
        self.wait_quiescent(deadline).await;

        let forced = self.shared.in_flight.load(Ordering::SeqCst);
        if forced > 0 {
            tracing::warn!(forced, "drain timeout expired; force-failing in-flight calls");
            self.shared.fire_abort();
            // Interrupted calls return promptly; give their audit writes
            // one bounded audit-timeout window to land.
            let grace = tokio::time::Instant::now()
                + self.proxy.config.audit_timeout
                + Duration::from_millis(250);
            self.wait_quiescent(grace).await;
        }

        let result = self.server.stop().await;
        self.shared.set_state(LifecycleState::Stopped);
        tracing::info!(forced, "governed server stopped");
        result.map(|()| forced).map_err(GovernError::Server)
    }

    async fn wait_quiescent(&self, deadline: tokio::time::Instant) {
        loop {
            let notified = self.shared.drained.notified();
            if self.shared.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return;
            }
        }
    }

    /// Intercept one call. See [`InterceptionProxy::handle`].
    pub async fn handle(&self, descriptor: CallDescriptor) -> Result<ToolOutput, GovernError> {
        self.proxy.handle(descriptor).await
    }

    /// Per-call surface mirroring the wrapped server's own.
    pub async fn call_tool(
        &self,
        tool: &str,
        arguments: Map<String, Value>,
    ) -> Result<ToolOutput, GovernError> {
        self.proxy.call_tool(tool, arguments).await
    }
}

/// The wrapped server's failure passes through unchanged; everything else
/// is wrapped once.
fn flatten(error: GovernError) -> anyhow::Error {
    match error {
        GovernError::Server(inner) => inner,
        other => anyhow::Error::new(other),
    }
}

#[async_trait]
impl ToolServer for GovernedServer {
    async fn start(&self) -> anyhow::Result<()> {
        GovernedServer::start(self).await.map_err(flatten)
    }

    async fn stop(&self) -> anyhow::Result<()> {
        GovernedServer::stop(self, self.proxy.config.drain_timeout)
            .await
            .map(|_forced| ())
            .map_err(flatten)
    }

    async fn call_tool(
        &self,
        tool: &str,
        arguments: &Map<String, Value>,
    ) -> anyhow::Result<ToolOutput> {
        self.proxy
            .call_tool(tool, arguments.clone())
            .await
            .map_err(flatten)
    }

    fn server_id(&self) -> &str {
        self.server.server_id()
    }
}
