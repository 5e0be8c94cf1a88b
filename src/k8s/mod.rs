//! Kubernetes integration for AppConsole
//!
//! This module handles all interactions with the cluster:
//! - Applying and deleting application manifests
//! - Mirroring namespaces, services, deployments and nodes in a local cache
//! - Reconciling application status against what the cluster reports

pub mod cache;
mod client;
pub mod manifest;
pub mod reconcile;
pub mod status;

pub use cache::{CacheManager, CacheSummary, ClusterReader, ResourceKind};
pub use client::{parse_gvk, AppliedObject, ApplyOutcome, K8sClient};
pub use reconcile::{Reconciler, Target};
pub use status::ClusterView;
