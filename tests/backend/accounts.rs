use cairn::backend::Backend;
use cairn::backend::resources::{Account, ApiKey, PackageLocator, Site, User, UserType};
use cairn::core::config::BackendConfig;
use tempfile::tempdir;

fn open(dir: &std::path::Path) -> Backend {
    Backend::open(BackendConfig::new(dir.join("accounts.db"))).unwrap()
}

fn seed_account(backend: &Backend) -> Account {
    let account = backend
        .create_account(Account {
            org: "acme".to_string(),
            ..Default::default()
        })
        .unwrap();
    for domain in ["a.example.com", "b.example.com"] {
        backend
            .create_site(Site {
                domain: domain.to_string(),
                account_id: account.id.clone(),
                app: PackageLocator::new("example.com", "app", "1.0.0"),
                ..Default::default()
            })
            .unwrap();
    }
    for (name, user_type) in [
        ("agent@a.example.com", UserType::Agent),
        ("admin@acme.com", UserType::Admin),
    ] {
        backend
            .create_user(User {
                name: name.to_string(),
                user_type,
                account_id: account.id.clone(),
                cluster_name: "a.example.com".to_string(),
                ..Default::default()
            })
            .unwrap();
    }
    backend
        .create_api_key(ApiKey {
            token: "agent-key".to_string(),
            user_email: "agent@a.example.com".to_string(),
            expires: None,
        })
        .unwrap();
    account
}

#[test]
fn test_account_cascade_delete_is_idempotent() {
    let tmp = tempdir().unwrap();
    let backend = open(tmp.path());
    let account = seed_account(&backend);

    // A user from another account survives
    backend
        .create_user(User {
            name: "someone@else.com".to_string(),
            account_id: "other".to_string(),
            ..Default::default()
        })
        .unwrap();

    backend.delete_account(&account.id).unwrap();

    assert!(backend.get_sites(&account.id).unwrap().is_empty());
    assert!(backend.get_users(&account.id).unwrap().is_empty());
    assert!(backend.get_api_key("agent-key").unwrap_err().is_not_found());
    assert!(backend.get_user("someone@else.com").is_ok());

    // Second delete: dependents are already gone, only the account is missing
    let err = backend.delete_account(&account.id).unwrap_err();
    assert!(err.is_not_found());
    assert!(backend.get_sites(&account.id).unwrap().is_empty());
    assert!(backend.get_users(&account.id).unwrap().is_empty());
}

#[test]
fn test_site_users_and_keys() {
    let tmp = tempdir().unwrap();
    let backend = open(tmp.path());
    let account = seed_account(&backend);

    let site_users = backend.get_site_users("a.example.com").unwrap();
    assert_eq!(site_users.len(), 2);
    assert_eq!(
        site_users.iter().filter(|u| u.is_agent()).count(),
        1,
        "exactly one agent"
    );
    assert_eq!(backend.get_users(&account.id).unwrap().len(), 2);
    assert_eq!(backend.get_api_keys("agent@a.example.com").unwrap().len(), 1);
    assert!(backend.get_api_keys("admin@acme.com").unwrap().is_empty());

    let mut admin = backend.get_user("admin@acme.com").unwrap();
    admin.roles = vec!["@teleadmin".to_string()];
    backend.upsert_user(admin).unwrap();
    assert_eq!(backend.get_user("admin@acme.com").unwrap().roles, vec!["@teleadmin"]);
}

#[test]
fn test_state_survives_reopen() {
    let tmp = tempdir().unwrap();
    let account = {
        let backend = open(tmp.path());
        let account = seed_account(&backend);
        backend.close().unwrap();
        account
    };
    let backend = open(tmp.path());
    assert_eq!(backend.get_account(&account.id).unwrap(), account);
    assert_eq!(backend.get_sites(&account.id).unwrap().len(), 2);
}

#[test]
fn test_second_embedded_open_is_refused() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("locked.db");
    let first = Backend::open(BackendConfig::new(&path)).unwrap();
    let err = Backend::open(
        BackendConfig::new(&path).timeout(cairn::core::config::OpenTimeout::FailFast),
    )
    .err()
    .expect("second open must fail while the first holds the file");
    assert!(err.is_connection_problem(), "unexpected error: {err}");
    first.close().unwrap();
    Backend::open(BackendConfig::new(&path)).unwrap();
}
