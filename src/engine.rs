use std::collections::BTreeMap;
use std::sync::Arc;

use json_patch::PatchOperation;
use kube::core::admission::AdmissionRequest;
use kube::core::DynamicObject;
use serde_json::Value;
use tracing::info;

use crate::classifier::{self, DecodeError, ObjectMetadataView};
use crate::config::PolicyConfig;
use crate::patch;
use crate::predicate::{self, MUTATED};

pub const MISSING_LABELS_MESSAGE: &str = "required labels are not set";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookMode {
    Validate,
    Mutate,
}

impl WebhookMode {
    pub fn as_str(self) -> &'static str {
        match self {
            WebhookMode::Validate => "validate",
            WebhookMode::Mutate => "mutate",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PolicyDecision {
    /// The policy does not apply; the object was never inspected.
    AllowedUnconditionally,
    Allowed,
    Denied(String),
    /// Mutation does not apply to this object.
    MutationSkipped,
    PatchProduced(Vec<PatchOperation>),
}

impl PolicyDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyDecision::AllowedUnconditionally => "allowed_unconditionally",
            PolicyDecision::Allowed => "allowed",
            PolicyDecision::Denied(_) => "denied",
            PolicyDecision::MutationSkipped => "mutation_skipped",
            PolicyDecision::PatchProduced(_) => "patch_produced",
        }
    }

    pub fn allowed(&self) -> bool {
        !matches!(self, PolicyDecision::Denied(_))
    }
}

/// Stateless decision engine. The only data it holds is the immutable policy.
pub struct AdmissionEngine {
    policy: Arc<PolicyConfig>,
    desired_annotations: BTreeMap<String, String>,
}

impl AdmissionEngine {
    pub fn new(policy: Arc<PolicyConfig>) -> Self {
        let desired_annotations =
            BTreeMap::from([(policy.annotations.status.clone(), MUTATED.to_string())]);
        Self {
            policy,
            desired_annotations,
        }
    }

    /// Classifies the embedded object and decides the request.
    ///
    /// `raw_object` is the request's object as detached from the envelope by
    /// [`classifier::take_raw_object`]. Requests without an object and objects
    /// of unsupported kinds are allowed unconditionally. A decode failure is
    /// returned to the caller, which must not admit the object.
    pub fn decide(
        &self,
        mode: WebhookMode,
        request: &AdmissionRequest<DynamicObject>,
        raw_object: Option<&Value>,
    ) -> Result<PolicyDecision, DecodeError> {
        let Some(object) = raw_object else {
            return Ok(PolicyDecision::AllowedUnconditionally);
        };

        let classified =
            classifier::classify(&request.kind.kind, object, request.namespace.as_deref())?;
        let decision = match classified {
            Some((_, metadata)) => self.decide_metadata(mode, &metadata),
            None => PolicyDecision::AllowedUnconditionally,
        };

        info!(
            uid = %request.uid,
            kind = %request.kind.kind,
            webhook = mode.as_str(),
            decision = decision.as_str(),
            allowed = decision.allowed(),
            "admission decided"
        );
        Ok(decision)
    }

    pub fn decide_metadata(
        &self,
        mode: WebhookMode,
        metadata: &ObjectMetadataView,
    ) -> PolicyDecision {
        match mode {
            WebhookMode::Validate => {
                if !predicate::is_validation_required(&self.policy, metadata) {
                    return PolicyDecision::AllowedUnconditionally;
                }
                self.validate(metadata)
            }
            WebhookMode::Mutate => {
                if !predicate::is_mutation_required(&self.policy, metadata) {
                    return PolicyDecision::MutationSkipped;
                }
                PolicyDecision::PatchProduced(patch::build_patch(
                    Some(&metadata.annotations),
                    &self.desired_annotations,
                    Some(&metadata.labels),
                    &self.policy.inject_labels,
                ))
            }
        }
    }

    fn validate(&self, metadata: &ObjectMetadataView) -> PolicyDecision {
        let missing: Vec<&str> = self
            .policy
            .required_labels
            .iter()
            .filter(|key| !metadata.labels.contains_key(key.as_str()))
            .map(String::as_str)
            .collect();

        if missing.is_empty() {
            PolicyDecision::Allowed
        } else {
            info!(
                namespace = %metadata.namespace,
                name = %metadata.name,
                missing = ?missing,
                "required labels missing"
            );
            PolicyDecision::Denied(MISSING_LABELS_MESSAGE.to_string())
        }
    }
}
