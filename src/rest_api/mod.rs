//! REST API module for external integrations
//!
//! Read-only HTTP view of the VaultClusters the operator manages.

mod dto;
mod handlers;
mod server;

pub use server::run_server;
