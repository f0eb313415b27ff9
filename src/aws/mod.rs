//! AWS control-plane integration.
//!
//! This module provides:
//! - The [`CloudApi`] trait the planner, apply engine and status reporter use
//! - The SDK-backed implementation for ECS and Elastic Load Balancing v2
//! - Observation of the live resources of one service

mod api;
mod client;
mod observer;
mod types;

#[cfg(test)]
pub(crate) mod fake;

pub use api::CloudApi;
pub use client::AwsCloud;
pub use observer::StateObserver;
pub use types::{
    Bindings, ClusterInfo, ClusterParams, ContainerParams, HealthCheckParams, ListenerInfo,
    ListenerParams, LoadBalancerInfo, LoadBalancerParams, Lookup, ObservedState, RolloutState,
    ServiceInfo, ServiceParams, TargetGroupInfo, TargetGroupParams, TargetHealthInfo,
    TaskDefinitionInfo, TaskDefinitionParams, TaskHealth, TaskInfo,
};
