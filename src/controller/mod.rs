//! Controller module for VaultCluster reconciliation
//!
//! This module contains the main controller loop together with the pieces
//! it drives each pass: workload sizing, TLS trust management, instance
//! probing and status aggregation.

pub mod aggregate;
pub mod conditions;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod probe;
mod reconciler;
pub mod resources;
pub mod sizer;
pub mod status;
pub mod tls;

pub use aggregate::{aggregate, Aggregation};
pub use probe::{probe_all, HttpsProber, ProbeError, ProbeResult, ProbeTarget, Prober};
pub use reconciler::{run_controller, ControllerState};
pub use sizer::{plan, LastSeen, ObservedInstance, ScalePlan, SizingAction};
pub use tls::{CertPolicy, SecretStore, TrustBundle, TrustManager};
