use cairn::backend::resources::{CertAuthType, CertAuthority};
use cairn::backend::{Backend, Election};
use cairn::core::config::BackendConfig;
use std::time::Duration;
use tempfile::tempdir;

fn authority(ca_type: CertAuthType, domain: &str) -> CertAuthority {
    CertAuthority {
        ca_type,
        domain_name: domain.to_string(),
        checking_keys: vec![format!("ssh-ed25519 {domain}")],
        signing_keys: vec!["private".to_string()],
        expires: None,
    }
}

#[test]
fn test_cert_authority_activation_cycle() {
    let tmp = tempdir().unwrap();
    let backend = Backend::open(BackendConfig::new(tmp.path().join("ca.db"))).unwrap();
    backend
        .upsert_cert_authority(authority(CertAuthType::User, "example.com"))
        .unwrap();
    backend
        .upsert_cert_authority(authority(CertAuthType::Host, "example.com"))
        .unwrap();

    backend
        .deactivate_cert_authority(CertAuthType::User, "example.com")
        .unwrap();
    assert!(backend.get_cert_authorities(CertAuthType::User).unwrap().is_empty());
    // The host authority of the same domain is unaffected
    assert_eq!(backend.get_cert_authorities(CertAuthType::Host).unwrap().len(), 1);

    // Deactivating again finds nothing to move
    assert!(backend
        .deactivate_cert_authority(CertAuthType::User, "example.com")
        .unwrap_err()
        .is_not_found());

    backend
        .activate_cert_authority(CertAuthType::User, "example.com")
        .unwrap();
    assert_eq!(
        backend
            .get_cert_authority(CertAuthType::User, "example.com")
            .unwrap(),
        authority(CertAuthType::User, "example.com")
    );
    assert!(backend
        .activate_cert_authority(CertAuthType::User, "example.com")
        .unwrap_err()
        .is_not_found());
}

#[test]
fn test_interrupted_move_is_completed_by_retry() {
    let tmp = tempdir().unwrap();
    let backend = Backend::open(BackendConfig::new(tmp.path().join("ca.db"))).unwrap();
    let ca = authority(CertAuthType::Host, "example.com");
    backend.upsert_cert_authority(ca.clone()).unwrap();

    // Simulate a move that wrote the new copy but never removed the old one
    backend
        .deactivate_cert_authority(CertAuthType::Host, "example.com")
        .unwrap();
    backend.upsert_cert_authority(ca.clone()).unwrap();
    assert!(backend
        .get_deactivated_cert_authority(CertAuthType::Host, "example.com")
        .is_ok());

    backend
        .deactivate_cert_authority(CertAuthType::Host, "example.com")
        .unwrap();
    assert!(backend
        .get_cert_authority(CertAuthType::Host, "example.com")
        .unwrap_err()
        .is_not_found());
    assert_eq!(
        backend
            .get_deactivated_cert_authority(CertAuthType::Host, "example.com")
            .unwrap(),
        ca
    );
}

#[test]
fn test_election_across_multi_client_backends() {
    let tmp = tempdir().unwrap();
    let cfg = BackendConfig::new(tmp.path().join("shared.db")).multi_client(true);
    let a = Backend::open(cfg.clone()).unwrap();
    let b = Backend::open(cfg).unwrap();
    let term = Duration::from_secs(60);

    let ea = Election::new(&a, "updates", "node-a", term).unwrap();
    let eb = Election::new(&b, "updates", "node-b", term).unwrap();
    assert!(ea.campaign().unwrap());
    assert!(!eb.campaign().unwrap());
    assert_eq!(eb.leader().unwrap().as_deref(), Some("node-a"));

    ea.step_down().unwrap();
    assert!(eb.campaign().unwrap());
    assert_eq!(ea.leader().unwrap().as_deref(), Some("node-b"));
}
