//! Site operations, their progress, plans and plan changelogs.
//!
//! Plans are read far more often than written, so decoded plans are cached
//! per backend. Cache entries are whole `Arc`s swapped in after each
//! successful write; a reader holding an older `Arc` keeps a consistent
//! snapshot.

use super::resources::{ProgressEntry, SiteOperation};
use super::{Backend, CHANGELOG, OPS, PLAN, PROGRESS, SITES, VAL, key};
use crate::core::error::{CairnError, Result};
use crate::core::time::{FOREVER, new_id};
use crate::kv::{EngineExt, Key};
use crate::ops::plan::{OperationPlan, PlanChange, PlanChangelog};
use chrono::{DateTime, Utc};
use std::sync::{Arc, PoisonError};
use tracing::debug;

fn op_dir(site_domain: &str, operation_id: &str) -> Key {
    key([SITES, site_domain, OPS, operation_id])
}

impl Backend {
    /// Records a new operation against an existing site. The ID is generated
    /// when empty; `created` and `updated` come from the backend clock.
    pub fn create_site_operation(&self, mut op: SiteOperation) -> Result<SiteOperation> {
        op.check()?;
        self.get_site(&op.site_domain)?;
        if op.id.is_empty() {
            op.id = new_id();
        }
        let now = self.now();
        if op.created == DateTime::<Utc>::default() {
            op.created = now;
        }
        op.updated = now;
        self.engine
            .create_val(&op_dir(&op.site_domain, &op.id).join(VAL), &op, FOREVER)
            .map_err(|e| e.with_context(format!("operation {}", op.id)))?;
        debug!(site = %op.site_domain, operation = %op.id, op_type = %op.op_type, "created operation");
        Ok(op)
    }

    pub fn update_site_operation(&self, mut op: SiteOperation) -> Result<SiteOperation> {
        op.check()?;
        op.updated = self.now();
        self.engine
            .update_val(&op_dir(&op.site_domain, &op.id).join(VAL), &op, FOREVER)
            .map_err(|e| e.with_context(format!("operation {}", op.id)))?;
        Ok(op)
    }

    /// Writes an operation record as given, keeping its timestamps.
    pub(crate) fn put_site_operation(&self, op: &SiteOperation) -> Result<()> {
        op.check()?;
        if op.id.is_empty() {
            return Err(CairnError::BadParameter("operation: missing id".to_string()));
        }
        self.engine
            .upsert_val(&op_dir(&op.site_domain, &op.id).join(VAL), op, FOREVER)
    }

    pub fn get_site_operation(&self, site_domain: &str, operation_id: &str) -> Result<SiteOperation> {
        self.get_typed(
            &op_dir(site_domain, operation_id).join(VAL),
            &format!("operation {operation_id}"),
        )
    }

    /// Operations of a site, newest first.
    pub fn get_site_operations(&self, site_domain: &str) -> Result<Vec<SiteOperation>> {
        let mut ops = Vec::new();
        for id in self.engine.get_keys(&key([SITES, site_domain, OPS]))? {
            match self.get_site_operation(site_domain, &id) {
                Ok(op) => ops.push(op),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        ops.sort_by(|a, b| b.created.cmp(&a.created));
        Ok(ops)
    }

    pub fn create_progress_entry(&self, mut entry: ProgressEntry) -> Result<ProgressEntry> {
        entry.check()?;
        self.get_site_operation(&entry.site_domain, &entry.operation_id)?;
        if entry.id.is_empty() {
            entry.id = new_id();
        }
        if entry.created == DateTime::<Utc>::default() {
            entry.created = self.now();
        }
        let key = op_dir(&entry.site_domain, &entry.operation_id)
            .join(PROGRESS)
            .join(entry.id.as_str());
        self.engine
            .create_val(&key, &entry, FOREVER)
            .map_err(|e| e.with_context("progress entry"))?;
        Ok(entry)
    }

    /// Most recently created progress entry of an operation.
    pub fn get_last_progress_entry(
        &self,
        site_domain: &str,
        operation_id: &str,
    ) -> Result<ProgressEntry> {
        let entries: Vec<ProgressEntry> =
            self.get_all(&op_dir(site_domain, operation_id).join(PROGRESS))?;
        // entries are listed in ID order, so on equal timestamps the later ID wins
        entries
            .into_iter()
            .max_by_key(|e| e.created)
            .ok_or_else(|| {
                CairnError::NotFound(format!("progress entry for operation {operation_id}"))
            })
    }

    /// Stores a new plan for an existing operation and caches it.
    pub fn create_operation_plan(&self, plan: OperationPlan) -> Result<Arc<OperationPlan>> {
        plan.check()?;
        self.get_site_operation(&plan.cluster_name, &plan.operation_id)?;
        self.engine
            .create_val(
                &op_dir(&plan.cluster_name, &plan.operation_id).join(PLAN),
                &plan,
                FOREVER,
            )
            .map_err(|e| e.with_context(format!("plan for operation {}", plan.operation_id)))?;
        Ok(self.cache_plan(plan))
    }

    pub fn update_operation_plan(&self, plan: OperationPlan) -> Result<Arc<OperationPlan>> {
        plan.check()?;
        self.engine
            .update_val(
                &op_dir(&plan.cluster_name, &plan.operation_id).join(PLAN),
                &plan,
                FOREVER,
            )
            .map_err(|e| e.with_context(format!("plan for operation {}", plan.operation_id)))?;
        Ok(self.cache_plan(plan))
    }

    /// Returns the stored plan of an operation, serving repeat reads from
    /// the cache.
    pub fn get_operation_plan(
        &self,
        cluster_name: &str,
        operation_id: &str,
    ) -> Result<Arc<OperationPlan>> {
        {
            let plans = self.plans.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(plan) = plans.get(operation_id)
                && plan.cluster_name == cluster_name
            {
                return Ok(Arc::clone(plan));
            }
        }
        self.load_plan(cluster_name, operation_id)
    }

    /// Fills the cache from the engine. The store is read under the cache
    /// write lock so a writer caching a newer plan is ordered after us.
    fn load_plan(&self, cluster_name: &str, operation_id: &str) -> Result<Arc<OperationPlan>> {
        let mut plans = self.plans.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(plan) = plans.get(operation_id)
            && plan.cluster_name == cluster_name
        {
            return Ok(Arc::clone(plan));
        }
        let plan: Arc<OperationPlan> = Arc::new(self.get_typed(
            &op_dir(cluster_name, operation_id).join(PLAN),
            &format!("plan for operation {operation_id}"),
        )?);
        plans.insert(operation_id.to_string(), Arc::clone(&plan));
        Ok(plan)
    }

    pub fn create_operation_plan_change(&self, mut change: PlanChange) -> Result<PlanChange> {
        change.check()?;
        if change.id.is_empty() {
            change.id = new_id();
        }
        if change.created == DateTime::<Utc>::default() {
            change.created = self.now();
        }
        let key = op_dir(&change.cluster_name, &change.operation_id)
            .join(CHANGELOG)
            .join(change.id.as_str());
        self.engine
            .create_val(&key, &change, FOREVER)
            .map_err(|e| e.with_context(format!("plan change {}", change.id)))?;
        Ok(change)
    }

    /// Changelog of an operation ordered by creation time.
    pub fn get_operation_plan_changelog(
        &self,
        cluster_name: &str,
        operation_id: &str,
    ) -> Result<PlanChangelog> {
        let mut changes: Vec<PlanChange> =
            self.get_all(&op_dir(cluster_name, operation_id).join(CHANGELOG))?;
        changes.sort_by_key(|c| c.created);
        Ok(PlanChangelog(changes))
    }

    /// Forgets every cached plan.
    pub fn clear_plan_cache(&self) {
        self.plans
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn cache_plan(&self, plan: OperationPlan) -> Arc<OperationPlan> {
        let plan = Arc::new(plan);
        self.plans
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(plan.operation_id.clone(), Arc::clone(&plan));
        plan
    }

    pub(crate) fn drop_site_plans(&self, site_domain: &str) {
        let mut plans = self.plans.write().unwrap_or_else(PoisonError::into_inner);
        let before = plans.len();
        plans.retain(|_, plan| plan.cluster_name != site_domain);
        debug!(site = site_domain, dropped = before - plans.len(), "dropped cached plans");
    }
}
