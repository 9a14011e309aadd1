//! Moving a site and everything it depends on between two backends.
//!
//! An export is a plain serde value, so it can also be written to a file and
//! imported by another process.

use crate::backend::Backend;
use crate::backend::resources::{
    Account, ApiKey, Package, ProgressEntry, ProvisioningToken, Repository, ReverseTunnel, Role,
    Site, SiteOperation, User,
};
use crate::core::error::Result;
use crate::ops::plan::{OperationPlan, PlanChangelog};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::info;

/// A completed operation with its plan and history.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct OperationExport {
    pub operation: SiteOperation,
    #[serde(default)]
    pub plan: Option<OperationPlan>,
    #[serde(default)]
    pub changelog: PlanChangelog,
    #[serde(default)]
    pub progress: Option<ProgressEntry>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct SiteExport {
    pub account: Account,
    /// Always marked `local`.
    pub site: Site,
    #[serde(default)]
    pub repository: Option<Repository>,
    #[serde(default)]
    pub app: Option<Package>,
    /// Agent users of the site only.
    #[serde(default)]
    pub users: Vec<User>,
    #[serde(default)]
    pub api_keys: Vec<ApiKey>,
    #[serde(default)]
    pub roles: Vec<Role>,
    #[serde(default)]
    pub tunnel: Option<ReverseTunnel>,
    #[serde(default)]
    pub tokens: Vec<ProvisioningToken>,
    #[serde(default)]
    pub operations: Vec<OperationExport>,
}

fn optional<T>(res: Result<T>) -> Result<Option<T>> {
    match res {
        Ok(v) => Ok(Some(v)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

fn ignore_already_exists<T>(res: Result<T>) -> Result<()> {
    match res {
        Ok(_) => Ok(()),
        Err(e) if e.is_already_exists() => Ok(()),
        Err(e) => Err(e),
    }
}

/// Collects the site `domain` and its dependencies from `backend`.
pub fn export_site(backend: &Backend, domain: &str) -> Result<SiteExport> {
    let mut site = backend.get_site(domain)?;
    site.local = true;
    let account = backend.get_account(&site.account_id)?;
    let repository = optional(backend.get_repository(&site.app.repository))?;
    let app = optional(backend.get_package(&site.app))?;

    let users: Vec<User> = backend
        .get_site_users(domain)?
        .into_iter()
        .filter(User::is_agent)
        .collect();
    let mut api_keys = Vec::new();
    let mut role_names = BTreeSet::new();
    for user in &users {
        api_keys.extend(backend.get_api_keys(&user.name)?);
        role_names.extend(user.roles.iter().cloned());
    }
    let mut roles = Vec::new();
    for name in &role_names {
        if let Some(role) = optional(backend.get_role(name))? {
            roles.push(role);
        }
    }

    let mut operations = Vec::new();
    for operation in backend.get_site_operations(domain)? {
        if !operation.is_completed() {
            continue;
        }
        let plan = optional(backend.get_operation_plan(domain, &operation.id))?
            .map(|p| (*p).clone());
        let changelog = backend.get_operation_plan_changelog(domain, &operation.id)?;
        let progress = optional(backend.get_last_progress_entry(domain, &operation.id))?;
        operations.push(OperationExport {
            operation,
            plan,
            changelog,
            progress,
        });
    }

    let export = SiteExport {
        account,
        site,
        repository,
        app,
        users,
        api_keys,
        roles,
        tunnel: optional(backend.get_reverse_tunnel(domain))?,
        tokens: backend.get_site_provisioning_tokens(domain)?,
        operations,
    };
    info!(
        site = domain,
        users = export.users.len(),
        operations = export.operations.len(),
        "exported site"
    );
    Ok(export)
}

/// Writes an export into `backend`. Records that already exist are kept, so
/// importing the same export twice is harmless.
pub fn import_site(backend: &Backend, export: &SiteExport) -> Result<()> {
    ignore_already_exists(backend.create_account(export.account.clone()))?;
    if let Some(repo) = &export.repository {
        ignore_already_exists(backend.create_repository(repo.clone()))?;
    }
    if let Some(app) = &export.app {
        backend.upsert_package(app.clone())?;
    }
    match backend.create_site(export.site.clone()) {
        Err(e) if e.is_already_exists() => {
            backend.update_site(export.site.clone())?;
        }
        res => {
            res?;
        }
    }
    for role in &export.roles {
        backend.upsert_role(role.clone())?;
    }
    for user in &export.users {
        backend.upsert_user(user.clone())?;
    }
    for api_key in &export.api_keys {
        ignore_already_exists(backend.create_api_key(api_key.clone()))?;
    }
    if let Some(tunnel) = &export.tunnel {
        backend.upsert_reverse_tunnel(tunnel.clone())?;
    }
    for token in &export.tokens {
        ignore_already_exists(backend.create_provisioning_token(token.clone()))?;
    }
    for op in &export.operations {
        backend.put_site_operation(&op.operation)?;
        if let Some(plan) = &op.plan {
            match backend.create_operation_plan(plan.clone()) {
                Err(e) if e.is_already_exists() => {
                    backend.update_operation_plan(plan.clone())?;
                }
                res => {
                    res?;
                }
            }
        }
        for change in &op.changelog.0 {
            ignore_already_exists(backend.create_operation_plan_change(change.clone()))?;
        }
        if let Some(progress) = &op.progress {
            ignore_already_exists(backend.create_progress_entry(progress.clone()))?;
        }
    }
    info!(site = %export.site.domain, "imported site");
    Ok(())
}

/// Exports `domain` from `src` and imports it into `dst`.
pub fn transfer_site(src: &Backend, dst: &Backend, domain: &str) -> Result<SiteExport> {
    let export = export_site(src, domain)?;
    import_site(dst, &export)?;
    Ok(export)
}
