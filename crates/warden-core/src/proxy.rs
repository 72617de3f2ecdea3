//! Interception proxy: every call is evaluated, audited, and only then
//! forwarded.
//!
//! Invariants: exactly one audit record per call, written before control
//! returns; the decision is computed exactly once; at most one forwarded
//! call per descriptor.

use std::sync::Arc;

use serde_json::{Map, Value};

use crate::audit::{payload_digest, AuditGuard, AuditSink, CallOutcome};
use crate::config::GovernConfig;
use crate::decision::{reason_codes, Decision};
use crate::descriptor::CallDescriptor;
use crate::errors::{GovernError, PolicyError};
use crate::lifecycle::{InFlightGuard, LifecycleState, Shared};
use crate::policy::PolicyEvaluator;
use crate::server::{ToolOutput, ToolServer};

pub struct InterceptionProxy {
    pub(crate) agent_id: String,
    pub(crate) evaluator: Arc<dyn PolicyEvaluator>,
    pub(crate) sink: Arc<dyn AuditSink>,
    pub(crate) server: Arc<dyn ToolServer>,
    pub(crate) config: GovernConfig,
    pub(crate) shared: Arc<Shared>,
}

impl InterceptionProxy {
    /// Intercept one call.
    ///
    /// Deny produces an `Ok` rejection result (the wrapped server is not
    /// invoked); a wrapped-server failure is re-raised unchanged after
    /// being audited.
    pub async fn handle(&self, descriptor: CallDescriptor) -> Result<ToolOutput, GovernError> {
        if descriptor.agent_id.trim().is_empty() {
            return Err(GovernError::InvalidDescriptor(
                "agent_id must be non-empty".to_string(),
            ));
        }
        if descriptor.tool_name.trim().is_empty() {
            return Err(GovernError::InvalidDescriptor(
                "tool_name must be non-empty".to_string(),
            ));
        }

        // Register before the state check so a concurrent drain cannot
        // miss this call.
        let _in_flight = InFlightGuard::enter(&self.shared);
        if self.shared.state() != LifecycleState::Running {
            return Err(GovernError::NotRunning);
        }

        tracing::debug!(
            call_id = %descriptor.call_id,
            agent_id = %descriptor.agent_id,
            tool = %descriptor.tool_name,
            "intercepted call"
        );

        let mut guard = AuditGuard::new(
            Arc::clone(&self.sink),
            self.config.audit_timeout,
            Arc::clone(&self.shared.audit_failures),
            descriptor.clone(),
        );

        let (decision, reason_code) = self.evaluate(&descriptor).await;
        guard.set_decision(decision.clone(), reason_code);

        let arguments = match &decision {
            Decision::Deny { reason } => {
                tracing::debug!(call_id = %descriptor.call_id, %reason, "call denied");
                let output = ToolOutput::rejection(reason);
                guard.finish(CallOutcome::Rejected).await;
                return Ok(output);
            }
            Decision::Allow => &descriptor.arguments,
            Decision::Modify { arguments } => arguments,
        };

        let mut abort = self.shared.abort_rx();
        let result = tokio::select! {
            res = self.server.call_tool(&descriptor.tool_name, arguments) => res,
            _ = async { let _ = abort.wait_for(|aborted| *aborted).await; } => {
                tracing::warn!(call_id = %descriptor.call_id, "call force-failed by shutdown drain");
                guard.finish(CallOutcome::Interrupted).await;
                return Err(GovernError::Interrupted);
            }
        };

        match result {
            Ok(output) => {
                guard
                    .finish(CallOutcome::Success {
                        payload_digest: payload_digest(&output),
                    })
                    .await;
                Ok(output)
            }
            Err(error) => {
                guard
                    .finish(CallOutcome::Error {
                        message: error.to_string(),
                    })
                    .await;
                Err(GovernError::Server(error))
            }
        }
    }

    /// Per-call surface mirroring the wrapped server's: builds a
    /// descriptor for the proxy's configured agent and delegates to
    /// [`Self::handle`].
    pub async fn call_tool(
        &self,
        tool: &str,
        arguments: Map<String, Value>,
    ) -> Result<ToolOutput, GovernError> {
        let descriptor = CallDescriptor::new(self.agent_id.clone(), tool, arguments)?;
        self.handle(descriptor).await
    }

    /// Resolve the policy decision, fail-closed. Evaluator failures and
    /// timeouts become Deny; they never surface to the caller.
    async fn evaluate(&self, descriptor: &CallDescriptor) -> (Decision, &'static str) {
        let bounded = tokio::time::timeout(
            self.config.evaluator_timeout,
            self.evaluator.evaluate(descriptor),
        );
        match bounded.await {
            Ok(Ok(decision)) => {
                let code = decision.reason_code();
                (decision, code)
            }
            Ok(Err(error)) => {
                tracing::warn!(call_id = %descriptor.call_id, %error, "evaluator unavailable; denying");
                (
                    Decision::deny(format!("evaluator unavailable: {error}")),
                    reason_codes::P_EVALUATOR_UNAVAILABLE,
                )
            }
            Err(_) => {
                let error = PolicyError::Timeout(self.config.evaluator_timeout);
                tracing::warn!(call_id = %descriptor.call_id, %error, "evaluator unavailable; denying");
                (
                    Decision::deny(format!("evaluator unavailable: {error}")),
                    reason_codes::P_EVALUATOR_TIMEOUT,
                )
            }
        }
    }
}
