use async_trait::async_trait;

use crate::decision::Decision;
use crate::descriptor::CallDescriptor;
use crate::errors::PolicyError;

/// Decision function consulted once per intercepted call.
///
/// Stateless from the proxy's perspective; implementations may consult
/// external policy storage. Must be total over valid descriptors: an
/// `Err` is resolved by the proxy to a fail-closed `Deny`, never to a
/// silent allow and never to an error surfaced to the caller.
#[async_trait]
pub trait PolicyEvaluator: Send + Sync {
    async fn evaluate(&self, descriptor: &CallDescriptor) -> Result<Decision, PolicyError>;
}

/// Permits every call.
///
/// Insecure default used when no policy is configured; replace it with a
/// real evaluator before exposing the proxy to untrusted agents.
pub struct AllowAll;

#[async_trait]
impl PolicyEvaluator for AllowAll {
    async fn evaluate(&self, _descriptor: &CallDescriptor) -> Result<Decision, PolicyError> {
        Ok(Decision::Allow)
    }
}
