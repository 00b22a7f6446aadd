use crate::policy::PolicyDescriptor;

const NAMESPACE: &str = "QPS";

/// Two-level address of a counter inside a [CounterStore](crate::store::CounterStore).
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct CounterKey {
    pub namespace: String,
    pub field: String,
}

impl CounterKey {
    /// Derive the counter address for a policy.
    ///
    /// The namespace is `QPS:<scope>` (or just `QPS` for a blank scope), the field is the limit
    /// key verbatim.
    pub fn for_policy(policy: &PolicyDescriptor) -> Self {
        let namespace = if policy.scope_id.trim().is_empty() {
            NAMESPACE.to_owned()
        } else {
            format!("{NAMESPACE}:{}", policy.scope_id)
        };
        Self {
            namespace,
            field: policy.limit_key.clone(),
        }
    }
}
