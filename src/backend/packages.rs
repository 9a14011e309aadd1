//! Package repositories and the packages stored in them.

use super::resources::{Package, PackageLocator, Repository};
use super::{Backend, PACKAGES, REPOSITORIES, VAL, key};
use crate::core::error::Result;
use crate::kv::EngineExt;
use chrono::{DateTime, Utc};

fn package_key(loc: &PackageLocator) -> crate::kv::Key {
    key([REPOSITORIES, &loc.repository, PACKAGES, &loc.name, &loc.version])
}

impl Backend {
    pub fn create_repository(&self, repo: Repository) -> Result<Repository> {
        repo.check()?;
        self.engine
            .create_val(&key([REPOSITORIES, &repo.name, VAL]), &repo, self.ttl(repo.expires))
            .map_err(|e| e.with_context(format!("repository {}", repo.name)))?;
        Ok(repo)
    }

    pub fn get_repository(&self, name: &str) -> Result<Repository> {
        self.get_typed(&key([REPOSITORIES, name, VAL]), &format!("repository {name}"))
    }

    pub fn get_repositories(&self) -> Result<Vec<Repository>> {
        let mut repos = Vec::new();
        for name in self.engine.get_keys(&key([REPOSITORIES]))? {
            match self.get_repository(&name) {
                Ok(repo) => repos.push(repo),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(repos)
    }

    /// Deletes the repository and every package in it.
    pub fn delete_repository(&self, name: &str) -> Result<()> {
        self.engine
            .delete_dir(&key([REPOSITORIES, name]))
            .map_err(|e| e.with_context(format!("repository {name}")))
    }

    /// Stores a new package; its repository must already exist.
    pub fn create_package(&self, mut pkg: Package) -> Result<Package> {
        pkg.check()?;
        self.get_repository(&pkg.locator.repository)?;
        if pkg.created == DateTime::<Utc>::default() {
            pkg.created = self.now();
        }
        self.engine
            .create_val(&package_key(&pkg.locator), &pkg, self.ttl(pkg.expires))
            .map_err(|e| e.with_context(format!("package {}", pkg.locator)))?;
        Ok(pkg)
    }

    pub fn upsert_package(&self, mut pkg: Package) -> Result<Package> {
        pkg.check()?;
        self.get_repository(&pkg.locator.repository)?;
        if pkg.created == DateTime::<Utc>::default() {
            pkg.created = self.now();
        }
        self.engine
            .upsert_val(&package_key(&pkg.locator), &pkg, self.ttl(pkg.expires))?;
        Ok(pkg)
    }

    pub fn get_package(&self, loc: &PackageLocator) -> Result<Package> {
        self.get_typed(&package_key(loc), &format!("package {loc}"))
    }

    /// Every package in `repository`, ordered by name then version.
    pub fn get_packages(&self, repository: &str) -> Result<Vec<Package>> {
        let dir = key([REPOSITORIES, repository, PACKAGES]);
        let mut packages: Vec<Package> = Vec::new();
        for name in self.engine.get_keys(&dir)? {
            packages.extend(self.get_all::<Package>(&dir.join(name))?);
        }
        packages.sort_by(|a, b| {
            (&a.locator.name, &a.locator.version).cmp(&(&b.locator.name, &b.locator.version))
        });
        Ok(packages)
    }

    pub fn delete_package(&self, loc: &PackageLocator) -> Result<()> {
        self.engine
            .delete_key(&package_key(loc))
            .map_err(|e| e.with_context(format!("package {loc}")))
    }
}
