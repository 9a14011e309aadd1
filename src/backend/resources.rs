//! Stored entity types.
//!
//! These are thin records: the backend validates them with `check` before
//! writing and otherwise treats them as opaque serialized values.

use crate::core::error::{CairnError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

fn require(field: &str, value: &str, kind: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(CairnError::BadParameter(format!("{kind}: missing {field}")));
    }
    Ok(())
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Account {
    pub id: String,
    pub org: String,
    #[serde(default)]
    pub expires: Option<DateTime<Utc>>,
}

impl Account {
    pub fn check(&self) -> Result<()> {
        require("org", &self.org, "account")
    }
}

/// Identity of a package: `repository/name:version`.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PackageLocator {
    pub repository: String,
    pub name: String,
    pub version: String,
}

impl PackageLocator {
    pub fn new(repository: &str, name: &str, version: &str) -> Self {
        Self {
            repository: repository.to_string(),
            name: name.to_string(),
            version: version.to_string(),
        }
    }

    pub fn check(&self) -> Result<()> {
        require("repository", &self.repository, "package")?;
        require("name", &self.name, "package")?;
        require("version", &self.version, "package")
    }
}

impl fmt::Display for PackageLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.repository, self.name, self.version)
    }
}

impl FromStr for PackageLocator {
    type Err = CairnError;

    fn from_str(s: &str) -> Result<Self> {
        let bad = || CairnError::BadParameter(format!("expected repository/name:version, got {s:?}"));
        let (repository, rest) = s.split_once('/').ok_or_else(bad)?;
        let (name, version) = rest.rsplit_once(':').ok_or_else(bad)?;
        let loc = PackageLocator::new(repository, name, version);
        loc.check().map_err(|_| bad())?;
        Ok(loc)
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Repository {
    pub name: String,
    #[serde(default)]
    pub expires: Option<DateTime<Utc>>,
}

impl Repository {
    pub fn check(&self) -> Result<()> {
        require("name", &self.name, "repository")
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Package {
    pub locator: PackageLocator,
    #[serde(default)]
    pub size_bytes: u64,
    #[serde(default)]
    pub sha512: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub expires: Option<DateTime<Utc>>,
}

impl Package {
    pub fn check(&self) -> Result<()> {
        self.locator.check()
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Site {
    pub domain: String,
    pub account_id: String,
    #[serde(default)]
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub created_by: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub provider: String,
    /// Set on the copy that a site keeps of its own record after relocation.
    #[serde(default)]
    pub local: bool,
    pub app: PackageLocator,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub expires: Option<DateTime<Utc>>,
}

impl Site {
    pub fn check(&self) -> Result<()> {
        require("domain", &self.domain, "site")?;
        require("account_id", &self.account_id, "site")?;
        self.app.check()
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UserType {
    /// Machine identity used by cluster agents.
    Agent,
    Admin,
    #[default]
    Regular,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub name: String,
    #[serde(default)]
    pub user_type: UserType,
    #[serde(default)]
    pub account_id: String,
    /// Site domain the user is bound to, empty for account-wide users.
    #[serde(default)]
    pub cluster_name: String,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub expires: Option<DateTime<Utc>>,
}

impl User {
    pub fn check(&self) -> Result<()> {
        require("name", &self.name, "user")
    }

    pub fn is_agent(&self) -> bool {
        self.user_type == UserType::Agent
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ApiKey {
    pub token: String,
    pub user_email: String,
    #[serde(default)]
    pub expires: Option<DateTime<Utc>>,
}

impl ApiKey {
    pub fn check(&self) -> Result<()> {
        require("token", &self.token, "api key")?;
        require("user_email", &self.user_email, "api key")
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Role {
    pub name: String,
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
    #[serde(default)]
    pub expires: Option<DateTime<Utc>>,
}

impl Role {
    pub fn check(&self) -> Result<()> {
        require("name", &self.name, "role")
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProvisioningTokenType {
    #[default]
    Install,
    Expand,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ProvisioningToken {
    pub token: String,
    #[serde(default)]
    pub token_type: ProvisioningTokenType,
    pub account_id: String,
    pub site_domain: String,
    #[serde(default)]
    pub operation_id: String,
    #[serde(default)]
    pub user_email: String,
    #[serde(default)]
    pub expires: Option<DateTime<Utc>>,
}

impl ProvisioningToken {
    pub fn check(&self) -> Result<()> {
        require("token", &self.token, "provisioning token")?;
        require("site_domain", &self.site_domain, "provisioning token")
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ReverseTunnel {
    pub domain_name: String,
    #[serde(default)]
    pub dial_addrs: Vec<String>,
    #[serde(default)]
    pub expires: Option<DateTime<Utc>>,
}

impl ReverseTunnel {
    pub fn check(&self) -> Result<()> {
        require("domain_name", &self.domain_name, "reverse tunnel")?;
        if self.dial_addrs.is_empty() {
            return Err(CairnError::BadParameter(
                "reverse tunnel: missing dial addresses".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct TrustedCluster {
    pub name: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub proxy_address: String,
    #[serde(default)]
    pub reverse_tunnel_address: String,
    #[serde(default)]
    pub expires: Option<DateTime<Utc>>,
}

impl TrustedCluster {
    pub fn check(&self) -> Result<()> {
        require("name", &self.name, "trusted cluster")?;
        require("proxy_address", &self.proxy_address, "trusted cluster")
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct AuthConnector {
    /// `oidc`, `saml` or `github`.
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub spec: serde_json::Value,
    #[serde(default)]
    pub expires: Option<DateTime<Utc>>,
}

impl AuthConnector {
    pub fn check(&self) -> Result<()> {
        require("name", &self.name, "auth connector")?;
        match self.kind.as_str() {
            "oidc" | "saml" | "github" => Ok(()),
            other => Err(CairnError::BadParameter(format!(
                "auth connector: unsupported kind {other:?}"
            ))),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Peer {
    pub id: String,
    pub addr: String,
    #[serde(default)]
    pub last_heartbeat: DateTime<Utc>,
    #[serde(default)]
    pub expires: Option<DateTime<Utc>>,
}

impl Peer {
    pub fn check(&self) -> Result<()> {
        require("id", &self.id, "peer")?;
        require("addr", &self.addr, "peer")
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CertAuthType {
    #[default]
    Host,
    User,
}

impl CertAuthType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CertAuthType::Host => "host",
            CertAuthType::User => "user",
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct CertAuthority {
    pub ca_type: CertAuthType,
    pub domain_name: String,
    #[serde(default)]
    pub checking_keys: Vec<String>,
    #[serde(default)]
    pub signing_keys: Vec<String>,
    #[serde(default)]
    pub expires: Option<DateTime<Utc>>,
}

impl CertAuthority {
    pub fn check(&self) -> Result<()> {
        require("domain_name", &self.domain_name, "cert authority")?;
        if self.checking_keys.is_empty() {
            return Err(CairnError::BadParameter(
                "cert authority: missing checking keys".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    #[default]
    Ready,
    InProgress,
    Completed,
    Failed,
}

/// Record of one cluster operation (install, update, expand, ...).
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct SiteOperation {
    pub id: String,
    pub account_id: String,
    pub site_domain: String,
    pub op_type: String,
    #[serde(default)]
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub created_by: String,
    #[serde(default)]
    pub updated: DateTime<Utc>,
    #[serde(default)]
    pub state: OperationState,
}

impl SiteOperation {
    pub fn check(&self) -> Result<()> {
        require("site_domain", &self.site_domain, "operation")?;
        require("op_type", &self.op_type, "operation")
    }

    pub fn is_completed(&self) -> bool {
        self.state == OperationState::Completed
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ProgressEntry {
    pub id: String,
    pub site_domain: String,
    pub operation_id: String,
    #[serde(default)]
    pub created: DateTime<Utc>,
    /// Percent complete, 0..=100.
    #[serde(default)]
    pub completion: u8,
    #[serde(default)]
    pub step: u32,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub message: String,
}

impl ProgressEntry {
    pub fn check(&self) -> Result<()> {
        require("site_domain", &self.site_domain, "progress entry")?;
        require("operation_id", &self.operation_id, "progress entry")?;
        if self.completion > 100 {
            return Err(CairnError::BadParameter(format!(
                "progress entry: completion {} exceeds 100",
                self.completion
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locator_parse_and_display() {
        let loc: PackageLocator = "gravitational.io/telekube:5.5.0".parse().unwrap();
        assert_eq!(loc.repository, "gravitational.io");
        assert_eq!(loc.name, "telekube");
        assert_eq!(loc.version, "5.5.0");
        assert_eq!(loc.to_string(), "gravitational.io/telekube:5.5.0");

        assert!("no-slash:1.0".parse::<PackageLocator>().is_err());
        assert!("repo/no-version".parse::<PackageLocator>().is_err());
        assert!("repo/:1.0".parse::<PackageLocator>().is_err());
    }

    #[test]
    fn checks_reject_missing_fields() {
        assert!(Account::default().check().is_err());
        assert!(Site::default().check().is_err());
        assert!(ReverseTunnel {
            domain_name: "example.com".to_string(),
            ..Default::default()
        }
        .check()
        .is_err());
        assert!(AuthConnector {
            kind: "ldap".to_string(),
            name: "corp".to_string(),
            ..Default::default()
        }
        .check()
        .is_err());
        assert!(ProgressEntry {
            site_domain: "a".to_string(),
            operation_id: "b".to_string(),
            completion: 101,
            ..Default::default()
        }
        .check()
        .is_err());
    }

    #[test]
    fn user_type_serializes_snake_case() {
        let user = User {
            name: "agent@example.com".to_string(),
            user_type: UserType::Agent,
            ..Default::default()
        };
        let json = serde_json::to_value(&user).unwrap();
        assert_eq!(json["user_type"], "agent");
        assert!(user.is_agent());
    }
}
