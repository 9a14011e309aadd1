//! Fluent construction of phase trees.
//!
//! Phases are allocated in an arena and referred to by [`PhaseHandle`]s.
//! Requirements are recorded between handles, so call sites can wire
//! dependencies in any order without knowing final paths. [`PlanBuilder::resolve`]
//! turns relative IDs into absolute slash paths, rewrites requirements into
//! those paths and renders the plain [`OperationPhase`] tree.

use crate::core::error::{CairnError, Result};
use crate::ops::plan::{OperationData, OperationPhase, OperationPlan, PhaseData, Server};
use std::collections::{HashMap, HashSet};

/// Stable reference to a phase inside one [`PlanBuilder`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PhaseHandle(usize);

#[derive(Debug, Default)]
struct BuilderPhase {
    /// Relative to the parent.
    id: String,
    executor: String,
    description: String,
    data: Option<PhaseData>,
    parallel: bool,
    children: Vec<PhaseHandle>,
    requires: Vec<PhaseHandle>,
}

#[derive(Debug, Clone, Default)]
pub struct PlanIdentity {
    pub operation_id: String,
    pub operation_type: String,
    pub account_id: String,
    pub cluster_name: String,
}

#[derive(Debug)]
pub struct PlanBuilder {
    arena: Vec<BuilderPhase>,
}

impl Default for PlanBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PlanBuilder {
    pub fn new() -> Self {
        Self {
            arena: vec![BuilderPhase::default()],
        }
    }

    /// The implicit parent of all top-level phases.
    pub fn root(&self) -> PhaseHandle {
        PhaseHandle(0)
    }

    /// Allocates a detached phase with a relative `id`.
    pub fn phase(&mut self, id: &str, executor: &str) -> PhaseHandle {
        self.arena.push(BuilderPhase {
            id: id.to_string(),
            executor: executor.to_string(),
            ..Default::default()
        });
        PhaseHandle(self.arena.len() - 1)
    }

    pub fn set_description(&mut self, phase: PhaseHandle, description: &str) {
        if let Some(node) = self.arena.get_mut(phase.0) {
            node.description = description.to_string();
        }
    }

    pub fn set_data(&mut self, phase: PhaseHandle, data: PhaseData) {
        if let Some(node) = self.arena.get_mut(phase.0) {
            node.data = Some(data);
        }
    }

    /// Appends `subs` so that each one requires the sibling before it,
    /// including a sibling added by an earlier call.
    pub fn add_sequential(&mut self, parent: PhaseHandle, subs: &[PhaseHandle]) {
        for &sub in subs {
            if let Some(&prev) = self.arena.get(parent.0).and_then(|p| p.children.last()) {
                self.require(sub, &[prev]);
            }
            self.attach(parent, sub);
        }
    }

    /// Appends `subs` without ordering between them and marks the parent
    /// as running its sub-phases in parallel.
    pub fn add_parallel(&mut self, parent: PhaseHandle, subs: &[PhaseHandle]) {
        if let Some(node) = self.arena.get_mut(parent.0) {
            node.parallel = true;
        }
        for &sub in subs {
            self.attach(parent, sub);
        }
    }

    /// Appends `subs` without sibling ordering; each one requires `dep`.
    pub fn add_with_dependency(&mut self, parent: PhaseHandle, dep: PhaseHandle, subs: &[PhaseHandle]) {
        for &sub in subs {
            self.require(sub, &[dep]);
            self.attach(parent, sub);
        }
    }

    pub fn require(&mut self, phase: PhaseHandle, reqs: &[PhaseHandle]) {
        if let Some(node) = self.arena.get_mut(phase.0) {
            for req in reqs {
                if !node.requires.contains(req) {
                    node.requires.push(*req);
                }
            }
        }
    }

    pub fn children(&self, phase: PhaseHandle) -> &[PhaseHandle] {
        self.arena
            .get(phase.0)
            .map(|n| n.children.as_slice())
            .unwrap_or_default()
    }

    pub fn requirements(&self, phase: PhaseHandle) -> &[PhaseHandle] {
        self.arena
            .get(phase.0)
            .map(|n| n.requires.as_slice())
            .unwrap_or_default()
    }

    /// The direct sub-phase of `parent` whose data targets `hostname`.
    pub fn find_child_by_server(&self, parent: PhaseHandle, hostname: &str) -> Option<PhaseHandle> {
        self.children(parent).iter().copied().find(|child| {
            self.arena
                .get(child.0)
                .and_then(|n| n.data.as_ref())
                .and_then(|d| d.server.as_ref())
                .is_some_and(|s| s.hostname == hostname)
        })
    }

    fn attach(&mut self, parent: PhaseHandle, sub: PhaseHandle) {
        if let Some(node) = self.arena.get_mut(parent.0) {
            node.children.push(sub);
        }
    }

    /// Resolves the tree against the absolute root `/`.
    pub fn resolve(&self) -> Result<Vec<OperationPhase>> {
        self.resolve_inline("/")
    }

    /// Resolves the tree as the sub-phases of an existing phase `parent_id`,
    /// for splicing into a plan that is already built.
    pub fn resolve_inline(&self, parent_id: &str) -> Result<Vec<OperationPhase>> {
        if !parent_id.starts_with('/') {
            return Err(CairnError::BadParameter(format!(
                "parent phase ID {parent_id:?} must be absolute"
            )));
        }
        self.check_links()?;

        // Pass 1: absolute IDs for every phase reachable from the root.
        let mut absolute: HashMap<usize, String> = HashMap::new();
        let mut seen = HashSet::new();
        absolute.insert(0, parent_id.trim_end_matches('/').to_string());
        let mut stack = vec![0usize];
        while let Some(idx) = stack.pop() {
            let base = absolute[&idx].clone();
            for child in &self.arena[idx].children {
                let rel = &self.arena[child.0].id;
                if rel.is_empty() || rel.starts_with('/') {
                    return Err(CairnError::BadParameter(format!(
                        "phase ID {rel:?} under {} must be a non-empty relative path",
                        display_root(&base)
                    )));
                }
                let id = format!("{base}/{rel}");
                if !seen.insert(id.clone()) {
                    return Err(CairnError::BadParameter(format!("duplicate phase ID {id}")));
                }
                absolute.insert(child.0, id);
                stack.push(child.0);
            }
        }

        // Pass 2: requirement handles become absolute IDs.
        let mut requires: HashMap<usize, Vec<String>> = HashMap::new();
        for &idx in absolute.keys() {
            let mut ids = Vec::new();
            for req in &self.arena[idx].requires {
                let id = absolute.get(&req.0).filter(|_| req.0 != 0).ok_or_else(|| {
                    CairnError::BadParameter(format!(
                        "phase {} requires a phase that is not part of the plan",
                        absolute[&idx]
                    ))
                })?;
                ids.push(id.clone());
            }
            requires.insert(idx, ids);
        }

        Ok(self.render_children(0, &absolute, &mut requires))
    }

    /// Builds a complete plan from the resolved tree.
    pub fn build_plan(
        &self,
        identity: PlanIdentity,
        servers: Vec<Server>,
        data: Option<OperationData>,
    ) -> Result<OperationPlan> {
        let plan = OperationPlan {
            operation_id: identity.operation_id,
            operation_type: identity.operation_type,
            account_id: identity.account_id,
            cluster_name: identity.cluster_name,
            phases: self.resolve()?,
            servers,
            data,
        };
        plan.check()?;
        Ok(plan)
    }

    /// Rejects invalid handles and phases attached more than once.
    fn check_links(&self) -> Result<()> {
        let mut parents = vec![None; self.arena.len()];
        for (idx, node) in self.arena.iter().enumerate() {
            for child in &node.children {
                if child.0 == 0 || child.0 >= self.arena.len() {
                    return Err(CairnError::BadParameter(format!(
                        "phase {:?} has an invalid sub-phase handle",
                        node.id
                    )));
                }
                if parents[child.0].replace(idx).is_some() {
                    return Err(CairnError::BadParameter(format!(
                        "phase {:?} is added to the plan more than once",
                        self.arena[child.0].id
                    )));
                }
            }
        }
        Ok(())
    }

    fn render_children(
        &self,
        idx: usize,
        absolute: &HashMap<usize, String>,
        requires: &mut HashMap<usize, Vec<String>>,
    ) -> Vec<OperationPhase> {
        self.arena[idx]
            .children
            .iter()
            .map(|child| {
                let node = &self.arena[child.0];
                OperationPhase {
                    id: absolute[&child.0].clone(),
                    executor: node.executor.clone(),
                    description: node.description.clone(),
                    phases: self.render_children(child.0, absolute, requires),
                    requires: requires.remove(&child.0).unwrap_or_default(),
                    parallel: node.parallel,
                    data: node.data.clone(),
                    ..Default::default()
                }
            })
            .collect()
    }
}

fn display_root(base: &str) -> &str {
    if base.is_empty() { "/" } else { base }
}
