//! Replica sizing
//!
//! Compares the declared replica count against the instances that exist and
//! decides which to create or delete. Pure; the reconciler applies the plan.

use std::collections::BTreeSet;
use std::fmt;

use crate::crd::{AnomalyKind, VaultClusterStatus};

/// An instance as seen in the cluster
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObservedInstance {
    pub id: String,
    pub ordinal: i32,
    pub image: String,
    /// Deletion already requested
    pub terminating: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeleteReason {
    ScaleDown,
    Outdated,
}

impl fmt::Display for DeleteReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeleteReason::ScaleDown => write!(f, "scale down"),
            DeleteReason::Outdated => write!(f, "version change"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SizingAction {
    Create { id: String, ordinal: i32 },
    Delete { id: String, reason: DeleteReason },
}

impl SizingAction {
    pub fn id(&self) -> &str {
        match self {
            SizingAction::Create { id, .. } | SizingAction::Delete { id, .. } => id,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScalePlan {
    pub actions: Vec<SizingAction>,
    /// Ordinal to hand out after this plan is applied
    pub next_ordinal: i32,
}

impl ScalePlan {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn creates(&self) -> impl Iterator<Item = (&str, i32)> {
        self.actions.iter().filter_map(|a| match a {
            SizingAction::Create { id, ordinal } => Some((id.as_str(), *ordinal)),
            SizingAction::Delete { .. } => None,
        })
    }
}

/// Leadership and seal state as published by the previous pass
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LastSeen {
    pub active: Option<String>,
    /// Unsealed followers, contenders excluded
    pub standby: BTreeSet<String>,
    /// Instances that claimed leadership at the same time
    pub contenders: BTreeSet<String>,
}

impl LastSeen {
    pub fn from_status(status: Option<&VaultClusterStatus>) -> Self {
        let Some(status) = status else {
            return Self::default();
        };

        let contenders: BTreeSet<String> = status
            .anomalies
            .iter()
            .filter(|a| a.kind == AnomalyKind::SplitBrain)
            .flat_map(|a| a.nodes.iter().cloned())
            .collect();

        Self {
            active: status.active_node.clone(),
            standby: status
                .standby_nodes
                .iter()
                .filter(|n| !contenders.contains(*n))
                .cloned()
                .collect(),
            contenders,
        }
    }

    /// The leader, or one of several instances claiming to be
    pub fn is_leader(&self, id: &str) -> bool {
        self.active.as_deref() == Some(id) || self.contenders.contains(id)
    }

    pub fn is_standby(&self, id: &str) -> bool {
        self.standby.contains(id)
    }

    fn is_serving(&self, id: &str) -> bool {
        self.is_leader(id) || self.is_standby(id)
    }
}

pub fn instance_id(cluster: &str, ordinal: i32) -> String {
    format!("{cluster}-{ordinal}")
}

/// Plan creations and deletions for one pass.
///
/// New ordinals always exceed every ordinal ever observed, terminating
/// instances included, and `next_ordinal` from the last status. Scale-down
/// removes the highest ordinal first and keeps the leader (and any
/// split-brain contender) unless it is the last instance.
///
/// With the count already right, at most one instance running a different
/// image is replaced per pass, and only while every other live instance was
/// unsealed at the last probe. Followers go first. An outdated leader is
/// replaced once an up-to-date standby can take over, or when it is the
/// only instance. Nothing is replaced during a split-brain.
pub fn plan(
    cluster: &str,
    desired: i32,
    observed: &[ObservedInstance],
    last: &LastSeen,
    next_ordinal: i32,
    desired_image: &str,
) -> ScalePlan {
    let desired = usize::try_from(desired).unwrap_or(0);

    let mut live: Vec<&ObservedInstance> = observed.iter().filter(|i| !i.terminating).collect();
    live.sort_by_key(|i| i.ordinal);

    let highest_seen = observed.iter().map(|i| i.ordinal).max();
    let mut next = highest_seen.map_or(next_ordinal, |h| next_ordinal.max(h + 1)).max(0);

    let mut actions = Vec::new();

    if live.len() < desired {
        for _ in live.len()..desired {
            actions.push(SizingAction::Create {
                id: instance_id(cluster, next),
                ordinal: next,
            });
            next += 1;
        }
    } else if live.len() > desired {
        let excess = live.len() - desired;
        let mut victims: Vec<&ObservedInstance> = live
            .iter()
            .rev()
            .filter(|i| !last.is_leader(&i.id))
            .take(excess)
            .copied()
            .collect();

        let remaining = live.len() - victims.len();
        if victims.len() < excess && remaining == 1 {
            victims.extend(live.iter().copied().filter(|i| last.is_leader(&i.id)));
        }

        actions.extend(victims.into_iter().map(|i| SizingAction::Delete {
            id: i.id.clone(),
            reason: DeleteReason::ScaleDown,
        }));
    } else if !observed.iter().any(|i| i.terminating) && last.contenders.is_empty() {
        if let Some(instance) = replacement(&live, last, desired_image) {
            actions.push(SizingAction::Delete {
                id: instance.id.clone(),
                reason: DeleteReason::Outdated,
            });
        }
    }

    ScalePlan {
        actions,
        next_ordinal: next,
    }
}

/// Next outdated instance to replace, if the rest of the cluster can cover
fn replacement<'a>(
    live: &[&'a ObservedInstance],
    last: &LastSeen,
    desired_image: &str,
) -> Option<&'a ObservedInstance> {
    let others_serving = |target: &ObservedInstance| {
        live.iter()
            .filter(|i| i.id != target.id)
            .all(|i| last.is_serving(&i.id))
    };

    let (leaders, followers): (Vec<&ObservedInstance>, Vec<&ObservedInstance>) = live
        .iter()
        .rev()
        .copied()
        .filter(|i| i.image != desired_image)
        .partition(|i| last.is_leader(&i.id));

    if !followers.is_empty() {
        return followers.into_iter().find(|i| others_serving(*i));
    }

    let successor = live
        .iter()
        .any(|i| i.image == desired_image && last.is_standby(&i.id));
    leaders
        .into_iter()
        .find(|i| live.len() == 1 || (successor && others_serving(*i)))
}
