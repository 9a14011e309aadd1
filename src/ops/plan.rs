//! Operation plans: a tree of phases whose composite state is derived from
//! its leaves.
//!
//! The execution engine that drives phases through their states lives
//! elsewhere. This module only stores the tree and answers questions about it.

use crate::backend::resources::PackageLocator;
use crate::core::error::{CairnError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum PhaseState {
    #[default]
    Unstarted,
    InProgress,
    Completed,
    Failed,
    RolledBack,
}

impl PhaseState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseState::Unstarted => "unstarted",
            PhaseState::InProgress => "in_progress",
            PhaseState::Completed => "completed",
            PhaseState::Failed => "failed",
            PhaseState::RolledBack => "rolled_back",
        }
    }

    /// Completed, failed or rolled back.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PhaseState::Completed | PhaseState::Failed | PhaseState::RolledBack
        )
    }

    fn is_failure(&self) -> bool {
        matches!(self, PhaseState::Failed | PhaseState::RolledBack)
    }
}

impl fmt::Display for PhaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PhaseState {
    type Err = CairnError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" | "unstarted" => Ok(PhaseState::Unstarted),
            "in_progress" => Ok(PhaseState::InProgress),
            "completed" => Ok(PhaseState::Completed),
            "failed" => Ok(PhaseState::Failed),
            "rolled_back" => Ok(PhaseState::RolledBack),
            other => Err(CairnError::BadParameter(format!("unknown phase state {other:?}"))),
        }
    }
}

impl Serialize for PhaseState {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for PhaseState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Derives a composite state from its children's states.
///
/// All equal → that state; otherwise any failure → failed; otherwise in
/// progress. No children → unstarted.
pub fn aggregate_state<I: IntoIterator<Item = PhaseState>>(states: I) -> PhaseState {
    let mut states = states.into_iter();
    let Some(first) = states.next() else {
        return PhaseState::Unstarted;
    };
    let mut uniform = true;
    let mut failed = first.is_failure();
    for state in states {
        uniform &= state == first;
        failed |= state.is_failure();
    }
    if uniform {
        first
    } else if failed {
        PhaseState::Failed
    } else {
        PhaseState::InProgress
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Server {
    pub hostname: String,
    pub advertise_ip: String,
    #[serde(default)]
    pub role: String,
}

/// Phase-specific payload handed to the executor.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct PhaseData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<Server>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package: Option<PackageLocator>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub details: serde_json::Value,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct OperationPhase {
    /// Absolute slash path, e.g. `/bootstrap/node-1`.
    pub id: String,
    #[serde(default)]
    pub executor: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub phases: Vec<OperationPhase>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requires: Vec<String>,
    /// Sub-phases may run concurrently.
    #[serde(default)]
    pub parallel: bool,
    #[serde(default)]
    pub state: PhaseState,
    #[serde(default)]
    pub updated: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<PhaseData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl OperationPhase {
    pub fn is_leaf(&self) -> bool {
        self.phases.is_empty()
    }

    /// Own state for leaves, aggregated sub-phase state otherwise.
    pub fn state(&self) -> PhaseState {
        if self.is_leaf() {
            return self.state;
        }
        aggregate_state(self.phases.iter().map(OperationPhase::state))
    }

    pub fn is_unstarted(&self) -> bool {
        self.state() == PhaseState::Unstarted
    }

    pub fn is_in_progress(&self) -> bool {
        self.state() == PhaseState::InProgress
    }

    pub fn is_completed(&self) -> bool {
        self.state() == PhaseState::Completed
    }

    pub fn is_failed(&self) -> bool {
        self.state() == PhaseState::Failed
    }

    pub fn is_rolled_back(&self) -> bool {
        self.state() == PhaseState::RolledBack
    }

    /// Latest update among the leaves below (or of) this phase.
    pub fn last_update_time(&self) -> Option<DateTime<Utc>> {
        if self.is_leaf() {
            return self.updated;
        }
        self.phases.iter().filter_map(OperationPhase::last_update_time).max()
    }

    pub fn find(&self, id: &str) -> Option<&OperationPhase> {
        if self.id == id {
            return Some(self);
        }
        self.phases.iter().find_map(|p| p.find(id))
    }

    pub fn find_mut(&mut self, id: &str) -> Option<&mut OperationPhase> {
        if self.id == id {
            return Some(self);
        }
        self.phases.iter_mut().find_map(|p| p.find_mut(id))
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a OperationPhase>) {
        if self.is_leaf() {
            out.push(self);
            return;
        }
        for phase in &self.phases {
            phase.collect_leaves(out);
        }
    }

    fn apply_changes(&mut self, changelog: &PlanChangelog) {
        if let Some(change) = changelog.latest(&self.id) {
            self.state = change.new_state;
            self.updated = Some(change.created);
            self.error = change.error.clone();
        }
        for phase in &mut self.phases {
            phase.apply_changes(changelog);
        }
    }
}

/// Operation-specific data attached to a plan.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OperationData {
    Install {
        app: PackageLocator,
    },
    Update {
        from: PackageLocator,
        to: PackageLocator,
    },
    GarbageCollect {
        #[serde(default)]
        remove_packages: Vec<PackageLocator>,
    },
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct OperationPlan {
    pub operation_id: String,
    pub operation_type: String,
    #[serde(default)]
    pub account_id: String,
    pub cluster_name: String,
    #[serde(default)]
    pub phases: Vec<OperationPhase>,
    #[serde(default)]
    pub servers: Vec<Server>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<OperationData>,
}

impl OperationPlan {
    pub fn check(&self) -> Result<()> {
        if self.operation_id.is_empty() {
            return Err(CairnError::BadParameter("plan: missing operation_id".to_string()));
        }
        if self.operation_type.is_empty() {
            return Err(CairnError::BadParameter("plan: missing operation_type".to_string()));
        }
        if self.cluster_name.is_empty() {
            return Err(CairnError::BadParameter("plan: missing cluster_name".to_string()));
        }
        Ok(())
    }

    pub fn state(&self) -> PhaseState {
        aggregate_state(self.phases.iter().map(OperationPhase::state))
    }

    pub fn is_unstarted(&self) -> bool {
        self.state() == PhaseState::Unstarted
    }

    pub fn is_in_progress(&self) -> bool {
        self.state() == PhaseState::InProgress
    }

    pub fn is_completed(&self) -> bool {
        self.state() == PhaseState::Completed
    }

    pub fn is_failed(&self) -> bool {
        self.state() == PhaseState::Failed
    }

    pub fn is_rolled_back(&self) -> bool {
        self.state() == PhaseState::RolledBack
    }

    /// Every phase without sub-phases, in pre-order.
    pub fn get_leaf_phases(&self) -> Vec<&OperationPhase> {
        let mut out = Vec::new();
        for phase in &self.phases {
            phase.collect_leaves(&mut out);
        }
        out
    }

    pub fn last_update_time(&self) -> Option<DateTime<Utc>> {
        self.phases.iter().filter_map(OperationPhase::last_update_time).max()
    }

    pub fn find_phase(&self, id: &str) -> Option<&OperationPhase> {
        self.phases.iter().find_map(|p| p.find(id))
    }

    pub fn find_phase_mut(&mut self, id: &str) -> Option<&mut OperationPhase> {
        self.phases.iter_mut().find_map(|p| p.find_mut(id))
    }

    /// Overlays the latest recorded change of every phase onto the tree.
    pub fn apply_changelog(&mut self, changelog: &PlanChangelog) {
        for phase in &mut self.phases {
            phase.apply_changes(changelog);
        }
    }
}

/// One recorded state transition of a phase.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct PlanChange {
    pub id: String,
    pub cluster_name: String,
    pub operation_id: String,
    pub phase_id: String,
    pub new_state: PhaseState,
    pub created: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PlanChange {
    pub fn check(&self) -> Result<()> {
        if self.cluster_name.is_empty() || self.operation_id.is_empty() || self.phase_id.is_empty() {
            return Err(CairnError::BadParameter(format!(
                "plan change {}: cluster_name, operation_id and phase_id are required",
                self.id
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct PlanChangelog(pub Vec<PlanChange>);

impl PlanChangelog {
    /// Most recently created change for `phase_id`; on equal timestamps the
    /// later entry wins.
    pub fn latest(&self, phase_id: &str) -> Option<&PlanChange> {
        self.0
            .iter()
            .filter(|c| c.phase_id == phase_id)
            .max_by_key(|c| c.created)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
