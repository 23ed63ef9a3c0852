//! Parent condition records and the rules that keep them cross-consistent.
//!
//! A reconcile outcome is folded into the condition set through
//! [`ConditionBatch::expand`], which pairs up `ResourcesUpToDate` and
//! `ErrorOccurred` so the two can never contradict each other, and
//! [`ApplicationSetStatus::set_conditions`], which replaces exactly the
//! evaluated types and leaves the rest untouched.

use crate::appset::ApplicationSetStatus;
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Condition reason: one or more generators failed
pub const REASON_APPLICATION_PARAMS_GENERATION_ERROR: &str = "ApplicationGenerationFromParamsError";
/// Condition reason: one or more desired applications failed validation
pub const REASON_APPLICATION_VALIDATION_ERROR: &str = "ApplicationValidationError";
/// Condition reason: creating a child failed
pub const REASON_CREATE_APPLICATION_ERROR: &str = "CreateApplicationError";
/// Condition reason: updating a child failed
pub const REASON_UPDATE_APPLICATION_ERROR: &str = "UpdateApplicationError";
/// Condition reason: deleting a child failed
pub const REASON_DELETE_APPLICATION_ERROR: &str = "DeleteApplicationError";
/// Condition reason: every child reconciled cleanly
pub const REASON_APPLICATION_SET_UP_TO_DATE: &str = "ApplicationSetUpToDate";
/// Condition reason: parameter generation succeeded
pub const REASON_PARAMETERS_GENERATED: &str = "ParametersGenerated";
/// Condition reason: a rollout step is still in flight
pub const REASON_APPLICATION_SET_MODIFIED: &str = "ApplicationSetModified";
/// Condition reason: all rollout steps are complete
pub const REASON_APPLICATION_SET_ROLLOUT_COMPLETE: &str = "ApplicationSetRolloutComplete";
/// Condition reason mirrored onto `ResourcesUpToDate=False`
pub const REASON_ERROR_OCCURRED: &str = "ErrorOccurred";

/// One reconcile outcome dimension on the parent
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSetCondition {
    /// The dimension this record covers
    #[serde(rename = "type")]
    pub condition_type: ApplicationSetConditionType,
    /// Whether the dimension currently holds
    pub status: ApplicationSetConditionStatus,
    /// Machine readable cause
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    /// Human readable cause
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    /// When `status` last changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<Time>,
}

impl ApplicationSetCondition {
    /// Build a condition with no transition time; one is stamped when the
    /// condition is applied to a status
    pub fn new(
        condition_type: ApplicationSetConditionType,
        status: ApplicationSetConditionStatus,
        reason: &str,
        message: &str,
    ) -> Self {
        Self {
            condition_type,
            status,
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition_time: None,
        }
    }

    fn same_outcome(&self, other: &Self) -> bool {
        self.condition_type == other.condition_type
            && self.status == other.status
            && self.reason == other.reason
            && self.message == other.message
    }
}

/// The condition dimensions
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd, Deserialize, Serialize, JsonSchema)]
pub enum ApplicationSetConditionType {
    /// A generation, validation or materialisation error happened
    ErrorOccurred,
    /// The generators produced parameters
    ParametersGenerated,
    /// Children match the desired set
    ResourcesUpToDate,
    /// A progressive rollout is in flight; present only while the strategy is active
    RolloutProgressing,
}

/// Truth value of a condition
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize, JsonSchema)]
pub enum ApplicationSetConditionStatus {
    /// The dimension holds
    True,
    /// The dimension does not hold
    False,
    /// The dimension could not be evaluated
    Unknown,
}

/// A fully expanded set of conditions to apply in one status write
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConditionBatch {
    /// Conditions to upsert
    pub conditions: Vec<ApplicationSetCondition>,
    /// Types evaluated this pass; existing records of these types are replaced,
    /// or removed when the batch carries no replacement
    pub evaluated: BTreeSet<ApplicationSetConditionType>,
}

impl ConditionBatch {
    /// Expand one evaluated condition into the batch to apply.
    ///
    /// `ParametersGenerated` always mirrors the supplied flag, and the
    /// `ResourcesUpToDate`/`ErrorOccurred` pairing rules are applied:
    /// resources being up to date forces the error dimension false, and an
    /// error forces resources out of date.
    pub fn expand(condition: ApplicationSetCondition, parameters_generated: bool) -> Self {
        use ApplicationSetConditionStatus::{False, True};
        use ApplicationSetConditionType::{ErrorOccurred, ParametersGenerated, ResourcesUpToDate};

        let mut batch = Self::default();

        let params = if parameters_generated {
            ApplicationSetCondition::new(
                ParametersGenerated,
                True,
                REASON_PARAMETERS_GENERATED,
                "Successfully generated parameters for all Applications",
            )
        } else {
            ApplicationSetCondition::new(
                ParametersGenerated,
                False,
                REASON_PARAMETERS_GENERATED,
                "Failed to generate parameters for Applications",
            )
        };
        batch.push(params);

        if condition.condition_type == ResourcesUpToDate && condition.status == True {
            batch.push(ApplicationSetCondition::new(
                ErrorOccurred,
                False,
                &condition.reason,
                &condition.message,
            ));
        }
        if condition.condition_type == ErrorOccurred && condition.status == True {
            batch.push(ApplicationSetCondition::new(
                ResourcesUpToDate,
                False,
                REASON_ERROR_OCCURRED,
                &condition.message,
            ));
        }
        batch.push(condition);
        batch
    }

    /// Add a condition to the batch, marking its type evaluated
    pub fn push(&mut self, condition: ApplicationSetCondition) {
        self.evaluated.insert(condition.condition_type);
        self.conditions.push(condition);
    }

    /// Mark a type evaluated without a replacement, removing any existing record
    pub fn remove(&mut self, condition_type: ApplicationSetConditionType) {
        self.evaluated.insert(condition_type);
    }
}

impl ApplicationSetStatus {
    /// Apply a batch: replace records of evaluated types, keep the rest.
    ///
    /// A record whose outcome is unchanged keeps its transition time; anything
    /// else is stamped with the current time.
    pub fn set_conditions(&mut self, batch: ConditionBatch) {
        let now = Time(Utc::now());
        let mut next: Vec<ApplicationSetCondition> = Vec::with_capacity(batch.conditions.len());
        for mut condition in batch.conditions {
            let previous = self
                .conditions
                .iter()
                .find(|c| c.condition_type == condition.condition_type);
            match previous {
                Some(previous) if previous.same_outcome(&condition) => next.push(previous.clone()),
                _ => {
                    condition.last_transition_time = Some(now.clone());
                    next.push(condition);
                }
            }
        }
        for condition in &self.conditions {
            if !batch.evaluated.contains(&condition.condition_type) {
                next.push(condition.clone());
            }
        }
        self.conditions = next;
    }

    /// Whether two condition sets describe the same outcomes, in order.
    ///
    /// Transition times are ignored so an unchanged outcome never forces a
    /// status write.
    pub fn conditions_equivalent(a: &[ApplicationSetCondition], b: &[ApplicationSetCondition]) -> bool {
        a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.same_outcome(y))
    }
}
