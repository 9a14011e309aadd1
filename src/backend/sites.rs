//! Sites, provisioning tokens and reverse tunnels.

use super::resources::{ProvisioningToken, ReverseTunnel, Site};
use super::{Backend, SITES, TOKENS, TUNNELS, VAL, key};
use crate::core::error::Result;
use crate::kv::EngineExt;
use chrono::{DateTime, Utc};
use tracing::info;

impl Backend {
    /// Stores a new site owned by an existing account. `created` is stamped
    /// from the backend clock unless already set.
    pub fn create_site(&self, mut site: Site) -> Result<Site> {
        site.check()?;
        self.get_account(&site.account_id)?;
        if site.created == DateTime::<Utc>::default() {
            site.created = self.now();
        }
        self.engine
            .create_val(&key([SITES, &site.domain, VAL]), &site, self.ttl(site.expires))
            .map_err(|e| e.with_context(format!("site {}", site.domain)))?;
        info!(site = %site.domain, account = %site.account_id, "created site");
        Ok(site)
    }

    pub fn update_site(&self, site: Site) -> Result<Site> {
        site.check()?;
        self.engine
            .update_val(&key([SITES, &site.domain, VAL]), &site, self.ttl(site.expires))
            .map_err(|e| e.with_context(format!("site {}", site.domain)))?;
        Ok(site)
    }

    pub fn get_site(&self, domain: &str) -> Result<Site> {
        self.get_typed(&key([SITES, domain, VAL]), &format!("site {domain}"))
    }

    /// Sites owned by `account_id`.
    pub fn get_sites(&self, account_id: &str) -> Result<Vec<Site>> {
        let mut sites = Vec::new();
        for domain in self.engine.get_keys(&key([SITES]))? {
            match self.get_site(&domain) {
                Ok(site) if site.account_id == account_id => sites.push(site),
                Ok(_) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(sites)
    }

    /// Removes the site along with its operations, plans, changelogs and
    /// progress entries.
    pub fn delete_site(&self, domain: &str) -> Result<()> {
        self.engine
            .delete_dir(&key([SITES, domain]))
            .map_err(|e| e.with_context(format!("site {domain}")))?;
        self.drop_site_plans(domain);
        info!(site = domain, "deleted site");
        Ok(())
    }

    pub fn create_provisioning_token(&self, token: ProvisioningToken) -> Result<ProvisioningToken> {
        token.check()?;
        self.engine
            .create_val(&key([TOKENS, &token.token]), &token, self.ttl(token.expires))
            .map_err(|e| e.with_context("provisioning token"))?;
        Ok(token)
    }

    pub fn get_provisioning_token(&self, token: &str) -> Result<ProvisioningToken> {
        self.get_typed(&key([TOKENS, token]), "provisioning token")
    }

    pub fn get_site_provisioning_tokens(&self, cluster_name: &str) -> Result<Vec<ProvisioningToken>> {
        let tokens: Vec<ProvisioningToken> = self.get_all(&key([TOKENS]))?;
        Ok(tokens
            .into_iter()
            .filter(|t| t.site_domain == cluster_name)
            .collect())
    }

    pub fn delete_provisioning_token(&self, token: &str) -> Result<()> {
        self.engine
            .delete_key(&key([TOKENS, token]))
            .map_err(|e| e.with_context("provisioning token"))
    }

    pub fn upsert_reverse_tunnel(&self, tunnel: ReverseTunnel) -> Result<ReverseTunnel> {
        tunnel.check()?;
        self.engine.upsert_val(
            &key([TUNNELS, &tunnel.domain_name]),
            &tunnel,
            self.ttl(tunnel.expires),
        )?;
        Ok(tunnel)
    }

    pub fn get_reverse_tunnel(&self, domain: &str) -> Result<ReverseTunnel> {
        self.get_typed(&key([TUNNELS, domain]), &format!("reverse tunnel {domain}"))
    }

    pub fn get_reverse_tunnels(&self) -> Result<Vec<ReverseTunnel>> {
        self.get_all(&key([TUNNELS]))
    }

    pub fn delete_reverse_tunnel(&self, domain: &str) -> Result<()> {
        self.engine
            .delete_key(&key([TUNNELS, domain]))
            .map_err(|e| e.with_context(format!("reverse tunnel {domain}")))
    }
}
