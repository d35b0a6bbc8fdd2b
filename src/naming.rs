//! Substrate resource names and labels
//!
//! Names derive from (user id, challenge id, instance id) so two instances
//! can never collide, regardless of when they were created.

use crate::models::{ChallengeId, InstanceId, UserId};
use std::collections::BTreeMap;

pub const LABEL_APP: &str = "app";
pub const LABEL_USER_ID: &str = "user-id";
pub const LABEL_CHALLENGE_ID: &str = "challenge-id";
pub const LABEL_INSTANCE_ID: &str = "instance-id";
pub const LABEL_MANAGED_BY: &str = "managed-by";
pub const LABEL_COMPONENT: &str = "component";

pub const APP_NAME: &str = "ctf-challenge";
pub const MANAGER_NAME: &str = "ctf-instances";

pub const COMPONENT_WORKLOAD: &str = "workload";
pub const COMPONENT_EXPOSURE: &str = "exposure";

/// Label set keyed by name, ordered for stable output
pub type Labels = BTreeMap<String, String>;

/// Name of the workload backing an instance
pub fn workload_name(user_id: UserId, challenge_id: ChallengeId, instance_id: &InstanceId) -> String {
    format!("ctf-{}-{}-{}", user_id, challenge_id, instance_id.short())
}

/// Name of the exposure publishing a workload
pub fn exposure_name(workload_name: &str) -> String {
    format!("svc-{}", workload_name)
}

/// Stable selector the exposure uses to reach the workload
///
/// Keyed by instance id rather than by workload name so a replaced workload
/// is picked up by the existing exposure.
pub fn instance_selector(instance_id: &InstanceId) -> String {
    format!("inst-{}", instance_id.as_uuid().simple())
}

/// Labels carried by both resources of an instance
pub fn instance_labels(
    user_id: UserId,
    challenge_id: ChallengeId,
    instance_id: &InstanceId,
    component: &str,
) -> Labels {
    let mut labels = managed_selector(component);
    labels.insert(LABEL_USER_ID.to_string(), user_id.to_string());
    labels.insert(LABEL_CHALLENGE_ID.to_string(), challenge_id.to_string());
    labels.insert(LABEL_INSTANCE_ID.to_string(), instance_id.to_string());
    labels
}

/// Selector matching every resource of one component managed by this crate
pub fn managed_selector(component: &str) -> Labels {
    let mut labels = Labels::new();
    labels.insert(LABEL_APP.to_string(), APP_NAME.to_string());
    labels.insert(LABEL_MANAGED_BY.to_string(), MANAGER_NAME.to_string());
    labels.insert(LABEL_COMPONENT.to_string(), component.to_string());
    labels
}

/// True if every selector entry is present in `labels` with the same value
pub fn selector_matches(selector: &Labels, labels: &Labels) -> bool {
    selector
        .iter()
        .all(|(key, value)| labels.get(key).map(|v| v == value).unwrap_or(false))
}
