use std::collections::HashMap;
use std::sync::Arc;

/// One recorded spend for a user, as the policy sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub eps: f64,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyError {
    pub code: &'static str,
    pub message: String,
}

impl std::fmt::Display for PolicyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for PolicyError {}

/// Decides whether a requested spend is admitted given the user's
/// thresholds and cumulative usage. Implementations must be pure: the same
/// inputs always yield the same decision.
pub trait AdmissionPolicy: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn admit(
        &self,
        eps: f64,
        total_threshold: f64,
        per_query_threshold: f64,
        used: f64,
        history: &[HistoryEntry],
    ) -> bool;
}

/// Default policy: `eps <= per_query_threshold && used + eps <= total_threshold`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThresholdPolicy;

impl AdmissionPolicy for ThresholdPolicy {
    fn name(&self) -> &str {
        "threshold"
    }

    fn description(&self) -> &str {
        "admits a request iff the requested risk is within the per-query \
         threshold and the cumulative spend stays within the total threshold"
    }

    fn admit(
        &self,
        eps: f64,
        total_threshold: f64,
        per_query_threshold: f64,
        used: f64,
        _history: &[HistoryEntry],
    ) -> bool {
        eps <= per_query_threshold && used + eps <= total_threshold
    }
}

/// Immutable policy registry snapshot with a single active policy. Hot
/// reload swaps the whole snapshot; a request keeps the snapshot it
/// captured for its entire decision.
#[derive(Clone)]
pub struct PolicySet {
    policies: HashMap<String, Arc<dyn AdmissionPolicy>>,
    active: String,
}

impl std::fmt::Debug for PolicySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicySet")
            .field("active", &self.active)
            .field("policies", &self.names())
            .finish()
    }
}

impl PolicySet {
    pub fn builtin() -> Self {
        let mut policies: HashMap<String, Arc<dyn AdmissionPolicy>> = HashMap::new();
        let threshold = Arc::new(ThresholdPolicy);
        policies.insert(threshold.name().to_string(), threshold);
        PolicySet {
            policies,
            active: "threshold".to_string(),
        }
    }

    pub fn with_policy(mut self, policy: Arc<dyn AdmissionPolicy>) -> Self {
        self.policies.insert(policy.name().to_string(), policy);
        self
    }

    pub fn with_active(mut self, name: &str) -> Result<Self, PolicyError> {
        if !self.policies.contains_key(name) {
            return Err(PolicyError {
                code: "ERR_UNKNOWN_POLICY",
                message: format!("policy `{}` is not registered", name),
            });
        }
        self.active = name.to_string();
        Ok(self)
    }

    pub fn active(&self) -> Arc<dyn AdmissionPolicy> {
        // The active name is validated on construction.
        Arc::clone(&self.policies[&self.active])
    }

    pub fn active_name(&self) -> &str {
        &self.active
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.policies.keys().map(|k| k.as_str()).collect();
        names.sort_unstable();
        names
    }
}
