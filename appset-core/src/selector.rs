//! Label selection for rollout steps.
//!
//! Steps select applications through a restricted set of label expressions:
//! `In` and `NotIn`. Unlike full Kubernetes label selectors there is no
//! `Exists`/`DoesNotExist`, and an unrecognised operator is logged and treated
//! as never matching.

use crate::appset::ApplicationMatchExpression;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

// local type aliases
type Map = BTreeMap<String, String>;

/// A label expression with its values resolved into a set.
///
/// Rollout steps only produce the `In`/`NotIn`/`Invalid` forms; the remaining
/// forms exist for full [`LabelSelector`] support in the clusters generator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Expression {
    /// Matches iff the key exists and its value is in the set
    In(String, BTreeSet<String>),
    /// Matches iff the key is absent or its value is not in the set
    NotIn(String, BTreeSet<String>),
    /// Matches iff the key exists with exactly this value
    Equal(String, String),
    /// Matches iff the key exists
    Exists(String),
    /// Matches iff the key is absent
    DoesNotExist(String),
    /// An unrecognised operator; never matches
    Invalid,
}

impl Expression {
    fn matches(&self, labels: &Map) -> bool {
        match self {
            Expression::In(key, values) => match labels.get(key) {
                Some(v) => values.contains(v),
                None => false,
            },
            Expression::NotIn(key, values) => match labels.get(key) {
                Some(v) => !values.contains(v),
                None => true,
            },
            Expression::Equal(key, value) => labels.get(key) == Some(value),
            Expression::Exists(key) => labels.contains_key(key),
            Expression::DoesNotExist(key) => !labels.contains_key(key),
            Expression::Invalid => false,
        }
    }
}

impl From<&ApplicationMatchExpression> for Expression {
    fn from(expr: &ApplicationMatchExpression) -> Self {
        let values = expr.values.iter().cloned().collect();
        match expr.operator.as_str() {
            "In" => Expression::In(expr.key.clone(), values),
            "NotIn" => Expression::NotIn(expr.key.clone(), values),
            other => {
                warn!(operator = other, key = %expr.key, "unsupported match expression operator");
                Expression::Invalid
            }
        }
    }
}

/// The ANDed expressions of one rollout step
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Selector(Vec<Expression>);

impl Selector {
    /// Whether every expression matches the given labels.
    ///
    /// An empty selector matches everything, mirroring an unrestricted step.
    pub fn matches(&self, labels: &Map) -> bool {
        self.0.iter().all(|e| e.matches(labels))
    }
}

impl From<&[ApplicationMatchExpression]> for Selector {
    fn from(exprs: &[ApplicationMatchExpression]) -> Self {
        Self(exprs.iter().map(Expression::from).collect())
    }
}

impl FromIterator<Expression> for Selector {
    fn from_iter<T: IntoIterator<Item = Expression>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl From<&LabelSelector> for Selector {
    fn from(selector: &LabelSelector) -> Self {
        let mut expressions: Vec<Expression> = selector
            .match_labels
            .iter()
            .flatten()
            .map(|(k, v)| Expression::Equal(k.clone(), v.clone()))
            .collect();
        expressions.extend(selector.match_expressions.iter().flatten().map(Expression::from));
        Self(expressions)
    }
}

impl From<&LabelSelectorRequirement> for Expression {
    fn from(requirement: &LabelSelectorRequirement) -> Self {
        let key = requirement.key.clone();
        let values = || requirement.values.iter().flatten().cloned().collect();
        match requirement.operator.as_str() {
            "In" => Expression::In(key, values()),
            "NotIn" => Expression::NotIn(key, values()),
            "Exists" => Expression::Exists(key),
            "DoesNotExist" => Expression::DoesNotExist(key),
            other => {
                warn!(operator = other, %key, "unsupported label selector operator");
                Expression::Invalid
            }
        }
    }
}
