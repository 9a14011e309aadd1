use cairn::backend::Backend;
use cairn::backend::resources::{
    Account, ApiKey, OperationState, Package, PackageLocator, ProgressEntry, ProvisioningToken,
    Repository, ReverseTunnel, Role, Site, SiteOperation, User, UserType,
};
use cairn::core::config::BackendConfig;
use cairn::ops::{OperationPhase, OperationPlan, PhaseState, PlanChange};
use cairn::transfer::{SiteExport, export_site, import_site, transfer_site};
use tempfile::tempdir;

const SITE: &str = "prod.example.com";

fn populate(backend: &Backend) -> Account {
    let account = backend
        .create_account(Account {
            org: "acme".to_string(),
            ..Default::default()
        })
        .unwrap();
    backend
        .create_repository(Repository {
            name: "example.com".to_string(),
            expires: None,
        })
        .unwrap();
    let app = PackageLocator::new("example.com", "app", "1.0.0");
    backend
        .create_package(Package {
            locator: app.clone(),
            size_bytes: 4096,
            ..Default::default()
        })
        .unwrap();
    backend
        .create_site(Site {
            domain: SITE.to_string(),
            account_id: account.id.clone(),
            app,
            ..Default::default()
        })
        .unwrap();

    backend
        .upsert_role(Role {
            name: "agent-role".to_string(),
            allow: vec!["connect".to_string()],
            ..Default::default()
        })
        .unwrap();
    for (name, user_type, roles) in [
        ("agent@prod.example.com", UserType::Agent, vec!["agent-role".to_string()]),
        ("admin@acme.com", UserType::Admin, vec![]),
    ] {
        backend
            .create_user(User {
                name: name.to_string(),
                user_type,
                account_id: account.id.clone(),
                cluster_name: SITE.to_string(),
                roles,
                ..Default::default()
            })
            .unwrap();
        backend
            .create_api_key(ApiKey {
                token: format!("key-{name}"),
                user_email: name.to_string(),
                expires: None,
            })
            .unwrap();
    }
    backend
        .upsert_reverse_tunnel(ReverseTunnel {
            domain_name: SITE.to_string(),
            dial_addrs: vec!["10.0.0.1:3024".to_string()],
            expires: None,
        })
        .unwrap();
    backend
        .create_provisioning_token(ProvisioningToken {
            token: "expand-token".to_string(),
            account_id: account.id.clone(),
            site_domain: SITE.to_string(),
            ..Default::default()
        })
        .unwrap();

    let install = backend
        .create_site_operation(SiteOperation {
            account_id: account.id.clone(),
            site_domain: SITE.to_string(),
            op_type: "install".to_string(),
            state: OperationState::Completed,
            ..Default::default()
        })
        .unwrap();
    backend
        .create_operation_plan(OperationPlan {
            operation_id: install.id.clone(),
            operation_type: "install".to_string(),
            account_id: account.id.clone(),
            cluster_name: SITE.to_string(),
            phases: vec![OperationPhase {
                id: "/init".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        })
        .unwrap();
    backend
        .create_operation_plan_change(PlanChange {
            cluster_name: SITE.to_string(),
            operation_id: install.id.clone(),
            phase_id: "/init".to_string(),
            new_state: PhaseState::Completed,
            ..Default::default()
        })
        .unwrap();
    backend
        .create_progress_entry(ProgressEntry {
            site_domain: SITE.to_string(),
            operation_id: install.id.clone(),
            completion: 100,
            state: "completed".to_string(),
            ..Default::default()
        })
        .unwrap();
    // still running, must stay behind
    backend
        .create_site_operation(SiteOperation {
            account_id: account.id.clone(),
            site_domain: SITE.to_string(),
            op_type: "expand".to_string(),
            state: OperationState::InProgress,
            ..Default::default()
        })
        .unwrap();
    account
}

#[test]
fn test_transfer_site_end_to_end() {
    let tmp = tempdir().unwrap();
    let src = Backend::open(BackendConfig::new(tmp.path().join("src.db"))).unwrap();
    let dst = Backend::open(BackendConfig::new(tmp.path().join("dst.db"))).unwrap();
    let account = populate(&src);

    let export = transfer_site(&src, &dst, SITE).unwrap();
    assert_eq!(export.users.len(), 1);
    assert_eq!(export.operations.len(), 1);

    assert_eq!(dst.get_accounts().unwrap(), vec![account.clone()]);
    let site = dst.get_site(SITE).unwrap();
    assert!(site.local);
    assert_eq!(site.account_id, account.id);
    assert!(!src.get_site(SITE).unwrap().local);

    let users = dst.get_site_users(SITE).unwrap();
    assert_eq!(users.len(), 1);
    assert_eq!(users[0].name, "agent@prod.example.com");
    assert!(dst.get_user("admin@acme.com").unwrap_err().is_not_found());
    assert_eq!(dst.get_api_keys("agent@prod.example.com").unwrap().len(), 1);
    assert!(dst.get_api_key("key-admin@acme.com").unwrap_err().is_not_found());
    assert_eq!(dst.get_roles().unwrap().len(), 1);

    assert!(dst.get_package(&site.app).is_ok());
    assert!(dst.get_reverse_tunnel(SITE).is_ok());
    assert_eq!(dst.get_site_provisioning_tokens(SITE).unwrap().len(), 1);

    let ops = dst.get_site_operations(SITE).unwrap();
    assert_eq!(ops.len(), 1);
    assert!(ops[0].is_completed());
    assert_eq!(ops[0], src.get_site_operation(SITE, &ops[0].id).unwrap());
    let plan = dst.get_operation_plan(SITE, &ops[0].id).unwrap();
    assert_eq!(plan.phases.len(), 1);
    assert_eq!(
        dst.get_operation_plan_changelog(SITE, &ops[0].id).unwrap().len(),
        1
    );
    assert_eq!(
        dst.get_last_progress_entry(SITE, &ops[0].id).unwrap().completion,
        100
    );

    // importing the same export again changes nothing
    import_site(&dst, &export).unwrap();
    assert_eq!(dst.get_accounts().unwrap().len(), 1);
    assert_eq!(export_site(&dst, SITE).unwrap(), export);
}

#[test]
fn test_export_survives_json() {
    let tmp = tempdir().unwrap();
    let src = Backend::open(BackendConfig::new(tmp.path().join("src.db"))).unwrap();
    populate(&src);
    let export = export_site(&src, SITE).unwrap();
    let json = serde_json::to_string(&export).unwrap();
    let back: SiteExport = serde_json::from_str(&json).unwrap();
    assert_eq!(back, export);

    let dst = Backend::open(BackendConfig::new(tmp.path().join("dst.db"))).unwrap();
    import_site(&dst, &back).unwrap();
    assert!(dst.get_site(SITE).unwrap().local);
}

#[test]
fn test_export_of_unknown_site_fails() {
    let tmp = tempdir().unwrap();
    let src = Backend::open(BackendConfig::new(tmp.path().join("src.db"))).unwrap();
    assert!(export_site(&src, "missing.example.com").unwrap_err().is_not_found());
}
