//! vault-operator: Kubernetes operator for highly-available Vault clusters
//!
//! This crate reconciles `VaultCluster` resources: it sizes the instance
//! set, manages each cluster's TLS trust domain, probes every instance for
//! seal and leadership state, and publishes an aggregated status.

pub mod config;
pub mod controller;
pub mod crd;
pub mod error;

#[cfg(feature = "rest-api")]
pub mod rest_api;

pub use crate::error::{Error, Result};
