use tracing::info;

use crate::classifier::ObjectMetadataView;
use crate::config::PolicyConfig;

const OPT_OUT_VALUES: [&str; 4] = ["n", "no", "false", "off"];
/// Status-marker value written by a mutation.
pub(crate) const MUTATED: &str = "mutated";

/// Why a policy does not apply to an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    ExemptNamespace,
    OptedOut,
    AlreadyMutated,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            SkipReason::ExemptNamespace => "exempt namespace",
            SkipReason::OptedOut => "opt-out annotation",
            SkipReason::AlreadyMutated => "already mutated",
        }
    }
}

fn applicability(
    policy: &PolicyConfig,
    metadata: &ObjectMetadataView,
    opt_out_key: &str,
) -> Result<(), SkipReason> {
    if policy.is_exempt(&metadata.namespace) {
        return Err(SkipReason::ExemptNamespace);
    }

    let opted_out = metadata
        .annotations
        .get(opt_out_key)
        .is_some_and(|v| OPT_OUT_VALUES.contains(&v.to_lowercase().as_str()));
    if opted_out {
        return Err(SkipReason::OptedOut);
    }

    Ok(())
}

pub fn validation_applies(
    policy: &PolicyConfig,
    metadata: &ObjectMetadataView,
) -> Result<(), SkipReason> {
    let outcome = applicability(policy, metadata, &policy.annotations.validate);
    info!(
        namespace = %metadata.namespace,
        name = %metadata.name,
        required = outcome.is_ok(),
        skip_reason = outcome.err().map(SkipReason::as_str),
        "validation policy evaluated"
    );
    outcome
}

pub fn mutation_applies(
    policy: &PolicyConfig,
    metadata: &ObjectMetadataView,
) -> Result<(), SkipReason> {
    let already_mutated = metadata
        .annotations
        .get(&policy.annotations.status)
        .is_some_and(|v| v.eq_ignore_ascii_case(MUTATED));

    let outcome = applicability(policy, metadata, &policy.annotations.mutate).and_then(|()| {
        if already_mutated {
            Err(SkipReason::AlreadyMutated)
        } else {
            Ok(())
        }
    });
    info!(
        namespace = %metadata.namespace,
        name = %metadata.name,
        required = outcome.is_ok(),
        skip_reason = outcome.err().map(SkipReason::as_str),
        "mutation policy evaluated"
    );
    outcome
}

pub fn is_validation_required(policy: &PolicyConfig, metadata: &ObjectMetadataView) -> bool {
    validation_applies(policy, metadata).is_ok()
}

pub fn is_mutation_required(policy: &PolicyConfig, metadata: &ObjectMetadataView) -> bool {
    mutation_applies(policy, metadata).is_ok()
}
