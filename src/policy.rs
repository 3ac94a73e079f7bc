//! Attribute-based authorization over (principal, action, resource attributes).
//!
//! The engine is pure — no I/O, no clock — and evaluation order is fixed:
//! sensitivity → PII permission → processing hint → cost ceiling. The first
//! failing rule produces the denial reason; a request failing several rules
//! always reports the earliest one.
//!
//! `sensitive` data without the `pii_access` permission is a denial, not a
//! silent downgrade to `internal` — the engine is the single authority on
//! sensitivity access.

use std::collections::{BTreeSet, HashMap};

use crate::auth::{Permission, Principal, Role};
use crate::contract::{ProcessingHint, Sensitivity};

/// Attributes of the resource being authorized.
#[derive(Debug, Clone)]
pub struct ResourceAttributes {
    pub sensitivity: Sensitivity,
    pub processing_hint: ProcessingHint,
    /// Initial cost estimate in USD, refined later by the router.
    pub estimated_cost: f64,
}

/// Outcome of an authorization check.
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyDecision {
    Allow,
    Deny { reason: String },
}

impl PolicyDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Allow => None,
            Self::Deny { reason } => Some(reason),
        }
    }
}

/// The three default rule families, each keyed by role.
pub struct PolicyEngine {
    sensitivity_access: HashMap<Role, BTreeSet<Sensitivity>>,
    hint_access: HashMap<Role, BTreeSet<&'static str>>,
    cost_ceilings: HashMap<Role, f64>,
}

impl Default for PolicyEngine {
    fn default() -> Self {
        use ProcessingHint as H;
        use Sensitivity as S;

        let mut sensitivity_access = HashMap::new();
        sensitivity_access.insert(Role::User, BTreeSet::from([S::Public, S::Internal]));
        sensitivity_access
            .insert(Role::Service, BTreeSet::from([S::Public, S::Internal, S::Sensitive]));
        let all = BTreeSet::from([S::Public, S::Internal, S::Sensitive, S::Pii, S::Confidential]);
        sensitivity_access.insert(Role::Admin, all.clone());
        sensitivity_access.insert(Role::System, all);

        let mut hint_access = HashMap::new();
        hint_access.insert(
            Role::User,
            BTreeSet::from([H::Auto.as_str(), H::ModelSmall.as_str(), H::RuleEngine.as_str()]),
        );
        hint_access.insert(
            Role::Service,
            BTreeSet::from([
                H::Auto.as_str(),
                H::ModelSmall.as_str(),
                H::ModelLarge.as_str(),
                H::RuleEngine.as_str(),
                H::Hybrid.as_str(),
            ]),
        );
        let all_hints = BTreeSet::from([
            H::Auto.as_str(),
            H::ModelSmall.as_str(),
            H::ModelLarge.as_str(),
            H::ModelPrivate.as_str(),
            H::RuleEngine.as_str(),
            H::Hybrid.as_str(),
        ]);
        hint_access.insert(Role::Admin, all_hints.clone());
        hint_access.insert(Role::System, all_hints);

        let cost_ceilings = HashMap::from([
            (Role::User, 0.10),
            (Role::Service, 1.00),
            (Role::Admin, 10.00),
            (Role::System, 100.00),
        ]);

        Self { sensitivity_access, hint_access, cost_ceilings }
    }
}

impl PolicyEngine {
    /// Build the default engine with per-role cost ceilings overridden from
    /// configuration. Roles absent from `overrides` keep their defaults.
    pub fn with_cost_ceilings(overrides: &HashMap<Role, f64>) -> Self {
        let mut engine = Self::default();
        for (role, ceiling) in overrides {
            engine.cost_ceilings.insert(*role, *ceiling);
        }
        engine
    }

    /// The per-request cost ceiling for a role; also consulted by the router.
    pub fn cost_ceiling(&self, role: Role) -> f64 {
        self.cost_ceilings.get(&role).copied().unwrap_or(0.0)
    }

    /// Authorize `principal` to perform `action` on a resource with the given
    /// attributes.
    pub fn authorize(
        &self,
        principal: &Principal,
        action: &str,
        attrs: &ResourceAttributes,
    ) -> PolicyDecision {
        // Rule 1: role-based sensitivity access.
        let allowed_sensitivities =
            self.sensitivity_access.get(&principal.role).cloned().unwrap_or_default();
        if !allowed_sensitivities.contains(&attrs.sensitivity) {
            return PolicyDecision::Deny {
                reason: format!(
                    "role '{}' not allowed to {action} '{}' data",
                    principal.role, attrs.sensitivity
                ),
            };
        }

        // Rule 2: elevated sensitivity requires pii_access regardless of role.
        if matches!(
            attrs.sensitivity,
            Sensitivity::Sensitive | Sensitivity::Pii | Sensitivity::Confidential
        ) && !principal.has_permission(Permission::PiiAccess)
        {
            return PolicyDecision::Deny {
                reason: format!(
                    "permission 'pii_access' required for '{}' data",
                    attrs.sensitivity
                ),
            };
        }

        // Rule 3: role-based processing hint access.
        let allowed_hints = self.hint_access.get(&principal.role).cloned().unwrap_or_default();
        if !allowed_hints.contains(attrs.processing_hint.as_str()) {
            return PolicyDecision::Deny {
                reason: format!(
                    "role '{}' not allowed to use processing hint '{}'",
                    principal.role, attrs.processing_hint
                ),
            };
        }

        // Rule 4: per-request cost ceiling.
        let ceiling = self.cost_ceiling(principal.role);
        if attrs.estimated_cost > ceiling {
            return PolicyDecision::Deny {
                reason: format!(
                    "estimated cost ${:.4} exceeds limit ${:.4} for role '{}'",
                    attrs.estimated_cost, ceiling, principal.role
                ),
            };
        }

        PolicyDecision::Allow
    }
}
