//! Custom Resource Definitions for the Vault operator

pub mod types;
mod vault_cluster;


pub use types::*;
pub use vault_cluster::{
    SpecValidationError, VaultCluster, VaultClusterSpec, VaultClusterStatus, DEFAULT_BASE_IMAGE,
};
