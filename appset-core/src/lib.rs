//! Resource model and rollout logic for the ApplicationSet fleet controller.
//!
//! This crate carries everything that can be expressed without IO: the
//! [`ApplicationSet`] parent and [`Application`] child resources, the condition
//! model on the parent status, and the progressive [`rollout`] engine that
//! assigns applications to steps and advances their per-application state
//! machine. The async reconciliation machinery lives in `appset-controller`
//! and calls in here.

pub mod application;
pub mod appset;
pub mod conditions;
pub mod rollout;
pub mod selector;

pub use application::{Application, ApplicationSpec, ApplicationStatus, Operation};
pub use appset::{
    ApplicationSet, ApplicationSetGenerator, ApplicationSetSpec, ApplicationSetStatus,
    ApplicationSetTemplate,
};
pub use conditions::{
    ApplicationSetCondition, ApplicationSetConditionStatus, ApplicationSetConditionType,
    ConditionBatch,
};
