use cairn::backend::Backend;
use cairn::backend::resources::{Account, OperationState, PackageLocator, Site, SiteOperation};
use cairn::core::config::BackendConfig;
use cairn::ops::{
    OperationData, PhaseData, PhaseState, PlanBuilder, PlanChange, PlanIdentity, Server,
    aggregate_state,
};
use cairn::core::time::FakeClock;
use chrono::{TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

fn seed(backend: &Backend) -> SiteOperation {
    let account = backend
        .create_account(Account {
            org: "acme".to_string(),
            ..Default::default()
        })
        .unwrap();
    backend
        .create_site(Site {
            domain: "prod.example.com".to_string(),
            account_id: account.id.clone(),
            app: PackageLocator::new("example.com", "app", "1.0.0"),
            ..Default::default()
        })
        .unwrap();
    backend
        .create_site_operation(SiteOperation {
            account_id: account.id,
            site_domain: "prod.example.com".to_string(),
            op_type: "update".to_string(),
            ..Default::default()
        })
        .unwrap()
}

fn server(name: &str) -> Server {
    Server {
        hostname: name.to_string(),
        advertise_ip: "10.0.0.1".to_string(),
        role: "master".to_string(),
    }
}

/// `/init`, `/bootstrap/{node-1,node-2}`, `/upgrade`
fn update_plan(op: &SiteOperation) -> cairn::ops::OperationPlan {
    let mut b = PlanBuilder::new();
    let root = b.root();
    let init = b.phase("init", "update_init");
    let bootstrap = b.phase("bootstrap", "update_bootstrap");
    let upgrade = b.phase("upgrade", "update_upgrade");
    let mut nodes = Vec::new();
    for name in ["node-1", "node-2"] {
        let node = b.phase(name, "update_bootstrap_node");
        b.set_data(
            node,
            PhaseData {
                server: Some(server(name)),
                ..Default::default()
            },
        );
        nodes.push(node);
    }
    b.add_parallel(bootstrap, &nodes);
    b.add_sequential(root, &[init, bootstrap, upgrade]);
    b.build_plan(
        PlanIdentity {
            operation_id: op.id.clone(),
            operation_type: op.op_type.clone(),
            account_id: op.account_id.clone(),
            cluster_name: op.site_domain.clone(),
        },
        vec![server("node-1"), server("node-2")],
        Some(OperationData::Update {
            from: PackageLocator::new("example.com", "app", "1.0.0"),
            to: PackageLocator::new("example.com", "app", "2.0.0"),
        }),
    )
    .unwrap()
}

#[test]
fn test_built_plan_round_trips_through_store() {
    let tmp = tempdir().unwrap();
    let backend = Backend::open(BackendConfig::new(tmp.path().join("ops.db"))).unwrap();
    let op = seed(&backend);
    let plan = update_plan(&op);

    let leaves: Vec<&str> = plan.get_leaf_phases().iter().map(|p| p.id.as_str()).collect();
    assert_eq!(
        leaves,
        vec!["/init", "/bootstrap/node-1", "/bootstrap/node-2", "/upgrade"]
    );
    let bootstrap = plan.find_phase("/bootstrap").unwrap();
    assert!(bootstrap.parallel);
    assert_eq!(bootstrap.requires, vec!["/init"]);
    assert_eq!(plan.find_phase("/upgrade").unwrap().requires, vec!["/bootstrap"]);

    backend.create_operation_plan(plan.clone()).unwrap();
    backend.clear_plan_cache();
    let stored = backend
        .get_operation_plan("prod.example.com", &op.id)
        .unwrap();
    assert_eq!(*stored, plan);
    assert!(stored.is_unstarted());
}

#[test]
fn test_changelog_drives_aggregate_state() {
    let tmp = tempdir().unwrap();
    let clock = FakeClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap());
    let backend = Backend::open_with_clock(
        BackendConfig::new(tmp.path().join("ops.db")),
        Arc::new(clock.clone()),
    )
    .unwrap();
    let op = seed(&backend);
    backend.create_operation_plan(update_plan(&op)).unwrap();

    let record = |phase: &str, state: PhaseState| {
        clock.advance(Duration::from_secs(1));
        backend
            .create_operation_plan_change(PlanChange {
                cluster_name: op.site_domain.clone(),
                operation_id: op.id.clone(),
                phase_id: phase.to_string(),
                new_state: state,
                ..Default::default()
            })
            .unwrap();
    };
    record("/init", PhaseState::Completed);
    record("/bootstrap/node-1", PhaseState::Completed);
    record("/bootstrap/node-2", PhaseState::InProgress);

    let changelog = backend
        .get_operation_plan_changelog(&op.site_domain, &op.id)
        .unwrap();
    let mut plan = (*backend.get_operation_plan(&op.site_domain, &op.id).unwrap()).clone();
    plan.apply_changelog(&changelog);
    assert_eq!(plan.find_phase("/bootstrap").unwrap().state(), PhaseState::InProgress);
    assert!(plan.is_in_progress());

    record("/bootstrap/node-2", PhaseState::Failed);
    let changelog = backend
        .get_operation_plan_changelog(&op.site_domain, &op.id)
        .unwrap();
    plan.apply_changelog(&changelog);
    assert!(plan.find_phase("/bootstrap").unwrap().is_failed());
    assert!(plan.is_failed());

    // stored tree is untouched by the overlay
    let stored = backend.get_operation_plan(&op.site_domain, &op.id).unwrap();
    assert!(stored.is_unstarted());
}

#[test]
fn test_aggregation_rule() {
    use PhaseState::*;
    assert_eq!(aggregate_state([Completed, Failed, RolledBack, Unstarted]), Failed);
    assert_eq!(aggregate_state([Completed, Completed]), Completed);
    assert_eq!(aggregate_state([Completed, InProgress]), InProgress);
    assert_eq!(aggregate_state([Completed, Unstarted]), InProgress);
}

#[test]
fn test_operation_lifecycle() {
    let tmp = tempdir().unwrap();
    let backend = Backend::open(BackendConfig::new(tmp.path().join("ops.db"))).unwrap();
    let op = seed(&backend);

    let missing_site = backend.create_site_operation(SiteOperation {
        site_domain: "nowhere.example.com".to_string(),
        op_type: "install".to_string(),
        ..Default::default()
    });
    assert!(missing_site.unwrap_err().is_not_found());

    let mut done = backend.get_site_operation(&op.site_domain, &op.id).unwrap();
    done.state = OperationState::Completed;
    backend.update_site_operation(done).unwrap();
    let ops = backend.get_site_operations(&op.site_domain).unwrap();
    assert_eq!(ops.len(), 1);
    assert!(ops[0].is_completed());

    let plan: Arc<_> = backend.create_operation_plan(update_plan(&op)).unwrap();
    backend.delete_site(&op.site_domain).unwrap();
    assert!(backend
        .get_operation_plan(&plan.cluster_name, &plan.operation_id)
        .unwrap_err()
        .is_not_found());
    assert!(backend.get_site_operations(&op.site_domain).unwrap().is_empty());
}
