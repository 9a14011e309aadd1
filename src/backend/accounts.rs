//! Accounts, users, API keys and roles.

use super::resources::{Account, ApiKey, Role, User};
use super::{ACCOUNTS, Backend, KEYS, ROLES, USERS, key};
use crate::core::error::{Result, ignore_not_found};
use crate::core::time::new_id;
use crate::kv::EngineExt;
use tracing::{debug, info};

impl Backend {
    /// Stores a new account, generating its ID when empty.
    pub fn create_account(&self, mut account: Account) -> Result<Account> {
        account.check()?;
        if account.id.is_empty() {
            account.id = new_id();
        }
        let what = format!("account {}", account.id);
        self.engine
            .create_val(&key([ACCOUNTS, &account.id]), &account, self.ttl(account.expires))
            .map_err(|e| e.with_context(&what))?;
        Ok(account)
    }

    pub fn get_account(&self, id: &str) -> Result<Account> {
        self.get_typed(&key([ACCOUNTS, id]), &format!("account {id}"))
    }

    pub fn get_accounts(&self) -> Result<Vec<Account>> {
        self.get_all(&key([ACCOUNTS]))
    }

    /// Deletes the account together with its users and sites. Dependents that
    /// are already gone are not an error; the account itself must exist.
    pub fn delete_account(&self, id: &str) -> Result<()> {
        for user in self.get_users(id)? {
            ignore_not_found(self.delete_user(&user.name))?;
        }
        for site in self.get_sites(id)? {
            ignore_not_found(self.delete_site(&site.domain))?;
        }
        self.engine
            .delete_key(&key([ACCOUNTS, id]))
            .map_err(|e| e.with_context(format!("account {id}")))?;
        info!(account = id, "deleted account");
        Ok(())
    }

    pub fn create_user(&self, user: User) -> Result<User> {
        user.check()?;
        self.engine
            .create_val(&key([USERS, &user.name]), &user, self.ttl(user.expires))
            .map_err(|e| e.with_context(format!("user {}", user.name)))?;
        Ok(user)
    }

    pub fn upsert_user(&self, user: User) -> Result<User> {
        user.check()?;
        self.engine
            .upsert_val(&key([USERS, &user.name]), &user, self.ttl(user.expires))?;
        Ok(user)
    }

    pub fn get_user(&self, name: &str) -> Result<User> {
        self.get_typed(&key([USERS, name]), &format!("user {name}"))
    }

    /// Users belonging to `account_id`.
    pub fn get_users(&self, account_id: &str) -> Result<Vec<User>> {
        let users: Vec<User> = self.get_all(&key([USERS]))?;
        Ok(users.into_iter().filter(|u| u.account_id == account_id).collect())
    }

    /// Users bound to the site `cluster_name`.
    pub fn get_site_users(&self, cluster_name: &str) -> Result<Vec<User>> {
        let users: Vec<User> = self.get_all(&key([USERS]))?;
        Ok(users
            .into_iter()
            .filter(|u| u.cluster_name == cluster_name)
            .collect())
    }

    /// Deletes the user and every API key issued to it.
    pub fn delete_user(&self, name: &str) -> Result<()> {
        for api_key in self.get_api_keys(name)? {
            ignore_not_found(self.delete_api_key(name, &api_key.token))?;
        }
        self.engine
            .delete_key(&key([USERS, name]))
            .map_err(|e| e.with_context(format!("user {name}")))?;
        debug!(user = name, "deleted user");
        Ok(())
    }

    pub fn create_api_key(&self, api_key: ApiKey) -> Result<ApiKey> {
        api_key.check()?;
        // the owner must exist
        self.get_user(&api_key.user_email)?;
        self.engine
            .create_val(&key([KEYS, &api_key.token]), &api_key, self.ttl(api_key.expires))
            .map_err(|e| e.with_context("api key"))?;
        Ok(api_key)
    }

    pub fn get_api_key(&self, token: &str) -> Result<ApiKey> {
        self.get_typed(&key([KEYS, token]), "api key")
    }

    pub fn get_api_keys(&self, user_email: &str) -> Result<Vec<ApiKey>> {
        let keys: Vec<ApiKey> = self.get_all(&key([KEYS]))?;
        Ok(keys.into_iter().filter(|k| k.user_email == user_email).collect())
    }

    /// Deletes the key `token` if it belongs to `user_email`.
    pub fn delete_api_key(&self, user_email: &str, token: &str) -> Result<()> {
        let api_key = self.get_api_key(token)?;
        if api_key.user_email != user_email {
            return Err(crate::core::error::CairnError::NotFound(format!(
                "api key for user {user_email}"
            )));
        }
        self.engine
            .delete_key(&key([KEYS, token]))
            .map_err(|e| e.with_context("api key"))
    }

    pub fn upsert_role(&self, role: Role) -> Result<Role> {
        role.check()?;
        self.engine
            .upsert_val(&key([ROLES, &role.name]), &role, self.ttl(role.expires))?;
        Ok(role)
    }

    pub fn get_role(&self, name: &str) -> Result<Role> {
        self.get_typed(&key([ROLES, name]), &format!("role {name}"))
    }

    pub fn get_roles(&self) -> Result<Vec<Role>> {
        self.get_all(&key([ROLES]))
    }

    pub fn delete_role(&self, name: &str) -> Result<()> {
        self.engine
            .delete_key(&key([ROLES, name]))
            .map_err(|e| e.with_context(format!("role {name}")))
    }
}
