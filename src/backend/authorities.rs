//! Certificate authorities, trusted clusters, auth connectors and peers.

use super::resources::{AuthConnector, CertAuthType, CertAuthority, Peer, TrustedCluster};
use super::{AUTHORITIES, Backend, CONNECTORS, DEACTIVATED, PEERS, TRUSTED_CLUSTERS, key};
use crate::core::error::{Result, ignore_not_found};
use crate::kv::{EngineExt, Key};
use tracing::{info, warn};

fn ca_key(ca_type: CertAuthType, domain: &str) -> Key {
    key([AUTHORITIES, ca_type.as_str(), domain])
}

fn deactivated_ca_key(ca_type: CertAuthType, domain: &str) -> Key {
    key([AUTHORITIES, DEACTIVATED, ca_type.as_str(), domain])
}

impl Backend {
    pub fn upsert_cert_authority(&self, ca: CertAuthority) -> Result<CertAuthority> {
        ca.check()?;
        self.engine
            .upsert_val(&ca_key(ca.ca_type, &ca.domain_name), &ca, self.ttl(ca.expires))?;
        Ok(ca)
    }

    pub fn get_cert_authority(&self, ca_type: CertAuthType, domain: &str) -> Result<CertAuthority> {
        self.get_typed(
            &ca_key(ca_type, domain),
            &format!("{} cert authority {domain}", ca_type.as_str()),
        )
    }

    /// Active authorities of one type.
    pub fn get_cert_authorities(&self, ca_type: CertAuthType) -> Result<Vec<CertAuthority>> {
        self.get_all(&key([AUTHORITIES, ca_type.as_str()]))
    }

    pub fn delete_cert_authority(&self, ca_type: CertAuthType, domain: &str) -> Result<()> {
        self.engine
            .delete_key(&ca_key(ca_type, domain))
            .map_err(|e| e.with_context(format!("{} cert authority {domain}", ca_type.as_str())))
    }

    /// Moves an active authority to the deactivated set.
    ///
    /// The move is three engine calls: read, write the new location, delete
    /// the old one. If interrupted, the authority is left in both places and
    /// a retry completes the move.
    pub fn deactivate_cert_authority(&self, ca_type: CertAuthType, domain: &str) -> Result<()> {
        let ca = self.get_cert_authority(ca_type, domain)?;
        self.engine.upsert_val(
            &deactivated_ca_key(ca_type, domain),
            &ca,
            self.ttl(ca.expires),
        )?;
        ignore_not_found(self.delete_cert_authority(ca_type, domain))?;
        info!(ca_type = ca_type.as_str(), domain, "deactivated cert authority");
        Ok(())
    }

    /// Reverse of [`Backend::deactivate_cert_authority`], with the same
    /// partial-failure behavior.
    pub fn activate_cert_authority(&self, ca_type: CertAuthType, domain: &str) -> Result<()> {
        let ca = self.get_deactivated_cert_authority(ca_type, domain)?;
        self.engine
            .upsert_val(&ca_key(ca_type, domain), &ca, self.ttl(ca.expires))?;
        if let Err(e) = ignore_not_found(self.engine.delete_key(&deactivated_ca_key(ca_type, domain))) {
            warn!(ca_type = ca_type.as_str(), domain, error = %e, "stale deactivated copy left behind");
            return Err(e);
        }
        info!(ca_type = ca_type.as_str(), domain, "activated cert authority");
        Ok(())
    }

    pub fn get_deactivated_cert_authority(
        &self,
        ca_type: CertAuthType,
        domain: &str,
    ) -> Result<CertAuthority> {
        self.get_typed(
            &deactivated_ca_key(ca_type, domain),
            &format!("deactivated {} cert authority {domain}", ca_type.as_str()),
        )
    }

    pub fn upsert_trusted_cluster(&self, tc: TrustedCluster) -> Result<TrustedCluster> {
        tc.check()?;
        self.engine
            .upsert_val(&key([TRUSTED_CLUSTERS, &tc.name]), &tc, self.ttl(tc.expires))?;
        Ok(tc)
    }

    pub fn get_trusted_cluster(&self, name: &str) -> Result<TrustedCluster> {
        self.get_typed(&key([TRUSTED_CLUSTERS, name]), &format!("trusted cluster {name}"))
    }

    pub fn get_trusted_clusters(&self) -> Result<Vec<TrustedCluster>> {
        self.get_all(&key([TRUSTED_CLUSTERS]))
    }

    pub fn delete_trusted_cluster(&self, name: &str) -> Result<()> {
        self.engine
            .delete_key(&key([TRUSTED_CLUSTERS, name]))
            .map_err(|e| e.with_context(format!("trusted cluster {name}")))
    }

    pub fn upsert_auth_connector(&self, connector: AuthConnector) -> Result<AuthConnector> {
        connector.check()?;
        self.engine.upsert_val(
            &key([CONNECTORS, &connector.kind, &connector.name]),
            &connector,
            self.ttl(connector.expires),
        )?;
        Ok(connector)
    }

    pub fn get_auth_connector(&self, kind: &str, name: &str) -> Result<AuthConnector> {
        self.get_typed(
            &key([CONNECTORS, kind, name]),
            &format!("{kind} connector {name}"),
        )
    }

    /// Connectors of one kind (`oidc`, `saml` or `github`).
    pub fn get_auth_connectors(&self, kind: &str) -> Result<Vec<AuthConnector>> {
        self.get_all(&key([CONNECTORS, kind]))
    }

    pub fn delete_auth_connector(&self, kind: &str, name: &str) -> Result<()> {
        self.engine
            .delete_key(&key([CONNECTORS, kind, name]))
            .map_err(|e| e.with_context(format!("{kind} connector {name}")))
    }

    pub fn upsert_peer(&self, peer: Peer) -> Result<Peer> {
        peer.check()?;
        self.engine
            .upsert_val(&key([PEERS, &peer.id]), &peer, self.ttl(peer.expires))?;
        Ok(peer)
    }

    pub fn get_peer(&self, id: &str) -> Result<Peer> {
        self.get_typed(&key([PEERS, id]), &format!("peer {id}"))
    }

    pub fn get_peers(&self) -> Result<Vec<Peer>> {
        self.get_all(&key([PEERS]))
    }

    pub fn delete_peer(&self, id: &str) -> Result<()> {
        self.engine
            .delete_key(&key([PEERS, id]))
            .map_err(|e| e.with_context(format!("peer {id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil;
    use super::*;
    use std::time::Duration;

    fn ca(domain: &str) -> CertAuthority {
        CertAuthority {
            ca_type: CertAuthType::Host,
            domain_name: domain.to_string(),
            checking_keys: vec!["ssh-rsa AAAA".to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn deactivation_moves_between_prefixes() {
        let dir = tempfile::tempdir().unwrap();
        let (backend, _) = testutil::backend(dir.path());
        backend.upsert_cert_authority(ca("a.example.com")).unwrap();
        backend.upsert_cert_authority(ca("b.example.com")).unwrap();

        backend
            .deactivate_cert_authority(CertAuthType::Host, "a.example.com")
            .unwrap();
        assert!(backend
            .get_cert_authority(CertAuthType::Host, "a.example.com")
            .unwrap_err()
            .is_not_found());
        let listed = backend.get_cert_authorities(CertAuthType::Host).unwrap();
        assert_eq!(listed, vec![ca("b.example.com")]);
        assert_eq!(
            backend
                .get_deactivated_cert_authority(CertAuthType::Host, "a.example.com")
                .unwrap(),
            ca("a.example.com")
        );

        backend
            .activate_cert_authority(CertAuthType::Host, "a.example.com")
            .unwrap();
        assert!(backend
            .get_deactivated_cert_authority(CertAuthType::Host, "a.example.com")
            .unwrap_err()
            .is_not_found());
        assert_eq!(backend.get_cert_authorities(CertAuthType::Host).unwrap().len(), 2);
        assert!(backend.get_cert_authorities(CertAuthType::User).unwrap().is_empty());
    }

    #[test]
    fn deactivating_missing_authority_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (backend, _) = testutil::backend(dir.path());
        let err = backend
            .deactivate_cert_authority(CertAuthType::User, "nowhere")
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(err.to_string().contains("user cert authority nowhere"));
    }

    #[test]
    fn connectors_are_grouped_by_kind() {
        let dir = tempfile::tempdir().unwrap();
        let (backend, _) = testutil::backend(dir.path());
        for (kind, name) in [("oidc", "google"), ("saml", "okta"), ("oidc", "auth0")] {
            backend
                .upsert_auth_connector(AuthConnector {
                    kind: kind.to_string(),
                    name: name.to_string(),
                    spec: serde_json::json!({"issuer": format!("https://{name}")}),
                    expires: None,
                })
                .unwrap();
        }
        let oidc: Vec<String> = backend
            .get_auth_connectors("oidc")
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(oidc, vec!["auth0", "google"]);
        backend.delete_auth_connector("saml", "okta").unwrap();
        assert!(backend.get_auth_connectors("saml").unwrap().is_empty());
    }

    #[test]
    fn peers_expire_with_heartbeat() {
        let dir = tempfile::tempdir().unwrap();
        let (backend, clock) = testutil::backend(dir.path());
        backend
            .upsert_peer(Peer {
                id: "node-1".to_string(),
                addr: "10.0.0.1:61009".to_string(),
                last_heartbeat: testutil::start(),
                expires: Some(testutil::start() + chrono::Duration::seconds(30)),
            })
            .unwrap();
        assert_eq!(backend.get_peers().unwrap().len(), 1);
        clock.advance(Duration::from_secs(31));
        assert!(backend.get_peers().unwrap().is_empty());
        assert!(backend.get_peer("node-1").unwrap_err().is_not_found());
    }

    #[test]
    fn trusted_clusters_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (backend, _) = testutil::backend(dir.path());
        let tc = TrustedCluster {
            name: "remote".to_string(),
            enabled: true,
            proxy_address: "remote.example.com:3023".to_string(),
            ..Default::default()
        };
        backend.upsert_trusted_cluster(tc.clone()).unwrap();
        assert_eq!(backend.get_trusted_clusters().unwrap(), vec![tc]);
        backend.delete_trusted_cluster("remote").unwrap();
        assert!(backend.delete_trusted_cluster("remote").unwrap_err().is_not_found());
    }
}
