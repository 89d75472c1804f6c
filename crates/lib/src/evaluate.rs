//! Deployment spec evaluation hook.
//!
//! Before planning, the reconciler gives an [`Evaluator`] the chance to
//! expand templated expressions in the deployment spec (config lookups,
//! secret references, computed properties). The engine itself does not
//! interpret expressions; that stays pluggable. Evaluation failure is fatal
//! on an update reconcile and ignored on removal, so malformed specs can
//! still be cleaned up.

use maestro_core::Result;

use crate::model::DeploymentSpec;

/// Expands a deployment spec in an evaluation context.
pub trait Evaluator: Send + Sync {
    fn evaluate(&self, deployment: &DeploymentSpec, namespace: &str) -> Result<DeploymentSpec>;
}

/// The identity evaluator: returns the spec unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEvaluator;

impl Evaluator for NoopEvaluator {
    fn evaluate(&self, deployment: &DeploymentSpec, _namespace: &str) -> Result<DeploymentSpec> {
        Ok(deployment.clone())
    }
}
