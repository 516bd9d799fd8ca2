//! Prints the VaultCluster CustomResourceDefinition as YAML

use anyhow::Context;
use kube::CustomResourceExt;
use vault_operator::crd::VaultCluster;

fn main() -> anyhow::Result<()> {
    let crd = serde_yaml::to_string(&VaultCluster::crd()).context("serializing VaultCluster CRD")?;
    print!("{crd}");
    Ok(())
}
